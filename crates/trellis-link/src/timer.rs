//! Repeating timer with multiplicative backoff.
//!
//! Fires at delays `min(initial · factor^k, maximum)` for k = 0, 1, 2, …
//! Ticks carry the generation that armed the timer; an owner compares it
//! against [`BackoffTimer::current_generation`] so that ticks already in
//! flight when `stop()` returned are discarded. Precision is best-effort.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Backoff schedule parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    /// Multiplier applied per execution; values below 1.0 are treated as 1.0.
    pub backoff_factor: f64,
    pub maximum_delay: Duration,
}

impl BackoffSettings {
    pub fn new(initial_delay: Duration, backoff_factor: f64, maximum_delay: Duration) -> Self {
        Self {
            initial_delay,
            backoff_factor,
            maximum_delay,
        }
    }

    /// A schedule that fires at a fixed interval.
    pub fn constant(delay: Duration) -> Self {
        Self::new(delay, 1.0, delay)
    }

    /// Delay before execution `k`.
    pub fn delay_for(&self, execution: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0);
        let scaled = self.initial_delay.as_secs_f64() * factor.powi(execution.min(1024) as i32);
        let capped = scaled.min(self.maximum_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// One firing of a [`BackoffTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTick {
    /// Generation of the `start()` call that armed the timer.
    pub generation: u64,
    /// Zero-based execution count.
    pub execution: u32,
}

/// A repeating backoff timer delivering ticks into an owner's channel.
///
/// `stop()` is idempotent; the spawned task stops producing ticks, and the
/// generation bump lets the owner drop any tick that was already queued.
pub struct BackoffTimer {
    settings: BackoffSettings,
    generation: u64,
    cancel: Option<CancellationToken>,
}

impl BackoffTimer {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            generation: 0,
            cancel: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.cancel.is_some()
    }

    /// Generation of the most recent `start()`. Ticks with an older
    /// generation are stale.
    pub fn current_generation(&self) -> u64 {
        self.generation
    }

    /// Arm the schedule, restarting it if already running. Returns the new
    /// generation.
    pub fn start(&mut self, tx: mpsc::Sender<TimerTick>) -> u64 {
        self.stop();
        self.generation += 1;
        let generation = self.generation;
        let token = CancellationToken::new();
        self.cancel = Some(token.clone());
        let settings = self.settings;

        tokio::spawn(async move {
            let mut execution = 0u32;
            loop {
                let delay = settings.delay_for(execution);
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if tx
                    .send(TimerTick {
                        generation,
                        execution,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                execution = execution.saturating_add(1);
            }
        });

        generation
    }

    /// Stop producing ticks. Idempotent.
    pub fn stop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }
}

impl Drop for BackoffTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
