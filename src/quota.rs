use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::QuotaConfig;

/// Calls admitted in the current fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaState {
    pub count: u32,
    pub window_start: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Ceiling reached; the window resets after this long.
    Wait(Duration),
}

struct Shared {
    state: Mutex<QuotaState>,
    reset: Notify,
    ceiling: u32,
    window: Duration,
}

/// Fixed-window admission gate for LLM calls.
///
/// The count only ever goes back to zero from the background reset task, which
/// ticks every `window` regardless of load. Request-path code increments or waits,
/// it never resets.
pub struct QuotaTracker {
    shared: Arc<Shared>,
    reset_task: Option<JoinHandle<()>>,
}

impl QuotaTracker {
    /// Open the first window and spawn its reset task. Must run inside a tokio runtime.
    pub fn start(config: &QuotaConfig) -> Self {
        let now = Instant::now();
        let shared = Arc::new(Shared {
            state: Mutex::new(QuotaState {
                count: 0,
                window_start: now,
            }),
            reset: Notify::new(),
            ceiling: config.ceiling,
            window: config.window,
        });

        let task_shared = shared.clone();
        let reset_task = tokio::spawn(async move {
            let window = task_shared.window;
            let mut ticker = tokio::time::interval_at(now + window, window);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let previous = {
                    let mut state = task_shared.state.lock().await;
                    let previous = state.count;
                    state.count = 0;
                    state.window_start = Instant::now();
                    previous
                };
                task_shared.reset.notify_waiters();
                debug!(previous_count = previous, "Quota window reset");
            }
        });

        debug!(
            ceiling = config.ceiling,
            window_ms = config.window.as_millis() as u64,
            "Quota tracker started"
        );

        Self {
            shared,
            reset_task: Some(reset_task),
        }
    }

    /// Admit one call if the window has capacity, otherwise report how long until it resets.
    pub async fn try_consume(&self) -> Admission {
        let mut state = self.shared.state.lock().await;
        if state.count < self.shared.ceiling {
            state.count += 1;
            Admission::Admitted
        } else {
            let elapsed = state.window_start.elapsed();
            Admission::Wait(self.shared.window.saturating_sub(elapsed))
        }
    }

    /// Wait until a call is admitted. Returns true if the caller had to pause.
    pub async fn acquire(&self) -> bool {
        let mut waited = false;
        loop {
            // Registered before the check so a reset landing in between is not missed.
            let reset = self.shared.reset.notified();
            match self.try_consume().await {
                Admission::Admitted => return waited,
                Admission::Wait(remaining) => {
                    waited = true;
                    info!(
                        wait_ms = remaining.as_millis() as u64,
                        ceiling = self.shared.ceiling,
                        "Quota reached, waiting for window reset"
                    );
                    if remaining.is_zero() {
                        reset.await;
                    } else {
                        tokio::select! {
                            _ = reset => {}
                            _ = tokio::time::sleep(remaining) => {}
                        }
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub async fn state(&self) -> QuotaState {
        *self.shared.state.lock().await
    }

    /// Stop the reset task. The tracker cannot be used afterwards.
    pub fn stop(mut self) {
        self.abort_reset_task();
    }

    fn abort_reset_task(&mut self) {
        if let Some(task) = self.reset_task.take() {
            task.abort();
            debug!("Quota tracker stopped");
        }
    }
}

impl Drop for QuotaTracker {
    fn drop(&mut self) {
        self.abort_reset_task();
    }
}
