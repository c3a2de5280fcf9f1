//! Idempotent start/stop intents driven by retryable actions.
//!
//! Pure state machines: transitions return effect lists the owner applies
//! (invoke the wrapped action, arm or cancel a backoff timer). Timer ticks
//! come back in through [`RetryExecutor::timer_fired`] carrying the
//! generation that armed them, so a stopped executor's stale ticks fall
//! through harmlessly.

/// Effects an owner must apply after a [`RetryExecutor`] transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEffect {
    /// Run the wrapped action. The action must be non-blocking and report
    /// its outcome through `on_success` / `on_fail`.
    InvokeAction { attempt: u32 },
    /// Arm the backoff timer; ticks must come back tagged with this
    /// generation.
    ArmTimer { generation: u64 },
    /// Cancel the backoff timer.
    CancelTimer,
}

/// Drives one action until it succeeds, retrying on a backoff schedule.
#[derive(Debug, Default)]
pub struct RetryExecutor {
    running: bool,
    timer_armed: bool,
    attempt: u32,
    generation: u64,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Begin driving the action: attempt 0 runs immediately and the timer
    /// is armed for the retries. Idempotent while running.
    pub fn start(&mut self) -> Vec<RetryEffect> {
        if self.running {
            return Vec::new();
        }
        self.running = true;
        self.timer_armed = true;
        self.attempt = 0;
        self.generation += 1;
        vec![
            RetryEffect::InvokeAction { attempt: 0 },
            RetryEffect::ArmTimer {
                generation: self.generation,
            },
        ]
    }

    /// Stop driving the action. Idempotent. Outcomes reported for attempts
    /// already in flight are ignored from here on.
    pub fn stop(&mut self) -> Vec<RetryEffect> {
        if !self.running {
            return Vec::new();
        }
        self.running = false;
        self.timer_armed = false;
        vec![RetryEffect::CancelTimer]
    }

    /// A backoff tick arrived. Stale generations are dropped.
    pub fn timer_fired(&mut self, generation: u64) -> Vec<RetryEffect> {
        if !self.running || !self.timer_armed || generation != self.generation {
            return Vec::new();
        }
        self.attempt += 1;
        vec![RetryEffect::InvokeAction {
            attempt: self.attempt,
        }]
    }

    /// The action reported success; the executor stops.
    pub fn on_success(&mut self) -> Vec<RetryEffect> {
        self.stop()
    }

    /// The action reported failure; (re)arm the timer if it is not armed.
    pub fn on_fail(&mut self) -> Vec<RetryEffect> {
        if !self.running || self.timer_armed {
            return Vec::new();
        }
        self.timer_armed = true;
        self.generation += 1;
        vec![RetryEffect::ArmTimer {
            generation: self.generation,
        }]
    }
}

// ── StartStopHelper ─────────────────────────────────────────────────────

/// The intent a [`StartStopHelper`] converges toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    Started,
    Stopped,
}

/// Which of the helper's two executors an effect belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperRole {
    Starter,
    Stopper,
}

/// An effect from one of the helper's executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperEffect {
    pub role: HelperRole,
    pub effect: RetryEffect,
}

/// Converges an external start/stop state to the last-requested intent,
/// even when outside events flip the actual state underneath it.
#[derive(Debug)]
pub struct StartStopHelper {
    desired: DesiredState,
    starter: RetryExecutor,
    stopper: RetryExecutor,
}

impl Default for StartStopHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl StartStopHelper {
    pub fn new() -> Self {
        Self {
            desired: DesiredState::Stopped,
            starter: RetryExecutor::new(),
            stopper: RetryExecutor::new(),
        }
    }

    pub fn desired(&self) -> DesiredState {
        self.desired
    }

    pub fn starter_running(&self) -> bool {
        self.starter.is_running()
    }

    pub fn stopper_running(&self) -> bool {
        self.stopper.is_running()
    }

    /// Request the started state.
    pub fn start(&mut self) -> Vec<HelperEffect> {
        self.desired = DesiredState::Started;
        let mut effects = tag(HelperRole::Stopper, self.stopper.stop());
        effects.extend(tag(HelperRole::Starter, self.starter.start()));
        effects
    }

    /// Request the stopped state.
    pub fn stop(&mut self) -> Vec<HelperEffect> {
        self.desired = DesiredState::Stopped;
        let mut effects = tag(HelperRole::Starter, self.starter.stop());
        effects.extend(tag(HelperRole::Stopper, self.stopper.start()));
        effects
    }

    /// The external state is now started. Stops the starter; if the intent
    /// is Stopped, begins driving the stopper.
    pub fn confirm_start_occurred(&mut self) -> Vec<HelperEffect> {
        let mut effects = tag(HelperRole::Starter, self.starter.stop());
        if self.desired == DesiredState::Stopped {
            effects.extend(tag(HelperRole::Stopper, self.stopper.start()));
        }
        effects
    }

    /// The external state is now stopped. Mirror of
    /// [`confirm_start_occurred`](Self::confirm_start_occurred).
    pub fn confirm_stop_occurred(&mut self) -> Vec<HelperEffect> {
        let mut effects = tag(HelperRole::Stopper, self.stopper.stop());
        if self.desired == DesiredState::Started {
            effects.extend(tag(HelperRole::Starter, self.starter.start()));
        }
        effects
    }

    /// Route a backoff tick to the right executor.
    pub fn timer_fired(&mut self, role: HelperRole, generation: u64) -> Vec<HelperEffect> {
        let effects = match role {
            HelperRole::Starter => self.starter.timer_fired(generation),
            HelperRole::Stopper => self.stopper.timer_fired(generation),
        };
        tag(role, effects)
    }

    /// Report an attempt outcome to the right executor.
    pub fn attempt_failed(&mut self, role: HelperRole) -> Vec<HelperEffect> {
        let effects = match role {
            HelperRole::Starter => self.starter.on_fail(),
            HelperRole::Stopper => self.stopper.on_fail(),
        };
        tag(role, effects)
    }
}

fn tag(role: HelperRole, effects: Vec<RetryEffect>) -> Vec<HelperEffect> {
    effects
        .into_iter()
        .map(|effect| HelperEffect { role, effect })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invokes(effects: &[RetryEffect]) -> Vec<u32> {
        effects
            .iter()
            .filter_map(|e| match e {
                RetryEffect::InvokeAction { attempt } => Some(*attempt),
                _ => None,
            })
            .collect()
    }

    // ── RetryExecutor ──────────────────────────────────────────────────

    #[test]
    fn start_invokes_attempt_zero_and_arms_timer() {
        let mut exec = RetryExecutor::new();
        let effects = exec.start();
        assert_eq!(invokes(&effects), vec![0]);
        assert!(effects
            .iter()
            .any(|e| matches!(e, RetryEffect::ArmTimer { .. })));
    }

    #[test]
    fn start_is_idempotent() {
        let mut exec = RetryExecutor::new();
        exec.start();
        assert!(exec.start().is_empty());
    }

    #[test]
    fn ticks_produce_increasing_attempts() {
        let mut exec = RetryExecutor::new();
        let effects = exec.start();
        let generation = match effects[1] {
            RetryEffect::ArmTimer { generation } => generation,
            other => panic!("expected ArmTimer, got {other:?}"),
        };

        assert_eq!(invokes(&exec.timer_fired(generation)), vec![1]);
        assert_eq!(invokes(&exec.timer_fired(generation)), vec![2]);
    }

    #[test]
    fn stale_generation_tick_ignored() {
        let mut exec = RetryExecutor::new();
        exec.start();
        assert!(exec.timer_fired(0).is_empty());
    }

    #[test]
    fn success_stops_executor() {
        let mut exec = RetryExecutor::new();
        let generation = match exec.start()[1] {
            RetryEffect::ArmTimer { generation } => generation,
            other => panic!("expected ArmTimer, got {other:?}"),
        };

        let effects = exec.on_success();
        assert_eq!(effects, vec![RetryEffect::CancelTimer]);
        assert!(!exec.is_running());
        assert!(exec.timer_fired(generation).is_empty());
        // outcome reports after stop are ignored
        assert!(exec.on_fail().is_empty());
    }

    #[test]
    fn fail_rearms_only_when_disarmed() {
        let mut exec = RetryExecutor::new();
        exec.start();
        // timer already armed
        assert!(exec.on_fail().is_empty());
    }

    // ── StartStopHelper ────────────────────────────────────────────────

    #[test]
    fn start_stop_start_then_confirmations_leave_starter_running() {
        let mut helper = StartStopHelper::new();
        helper.start();
        helper.stop();
        helper.start();
        helper.confirm_start_occurred();
        helper.confirm_stop_occurred();

        assert_eq!(helper.desired(), DesiredState::Started);
        assert!(helper.starter_running());
        assert!(!helper.stopper_running());
    }

    #[test]
    fn confirm_start_while_stopped_intent_drives_stopper() {
        let mut helper = StartStopHelper::new();
        helper.start();
        helper.stop();
        // External start landed late, after we changed our mind.
        let effects = helper.confirm_start_occurred();

        assert!(effects.iter().any(|e| e.role == HelperRole::Stopper
            && matches!(e.effect, RetryEffect::InvokeAction { .. })));
        assert!(!helper.starter_running());
        assert!(helper.stopper_running());
    }

    #[test]
    fn last_intent_wins_never_both_running() {
        let mut helper = StartStopHelper::new();
        helper.start();
        helper.confirm_start_occurred();
        assert!(!helper.starter_running() && !helper.stopper_running());

        helper.stop();
        helper.start();
        helper.stop();
        helper.confirm_stop_occurred();
        assert!(!helper.starter_running());
        assert!(!helper.stopper_running());

        helper.start();
        assert!(helper.starter_running() ^ helper.stopper_running());
    }

    #[test]
    fn initial_state_is_stopped_and_idle() {
        let helper = StartStopHelper::new();
        assert_eq!(helper.desired(), DesiredState::Stopped);
        assert!(!helper.starter_running());
        assert!(!helper.stopper_running());
    }

    #[test]
    fn helper_ticks_route_to_role() {
        let mut helper = StartStopHelper::new();
        let effects = helper.start();
        let generation = effects
            .iter()
            .find_map(|e| match e.effect {
                RetryEffect::ArmTimer { generation } => Some(generation),
                _ => None,
            })
            .unwrap();

        let retries = helper.timer_fired(HelperRole::Starter, generation);
        assert!(retries.iter().all(|e| e.role == HelperRole::Starter));
        assert!(!retries.is_empty());
        // Stopper is idle; its ticks do nothing.
        assert!(helper.timer_fired(HelperRole::Stopper, generation).is_empty());
    }
}
