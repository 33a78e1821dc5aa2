/// Periodic Task Runner
///
/// Drives a task on a fixed period until shutdown is signalled. Failures are
/// retried with exponential backoff; after too many consecutive failures the
/// runner gives up and returns an error to its caller.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct PeriodicConfig {
    /// Delay between two successful runs
    pub period: Duration,
    /// Consecutive failures tolerated before the runner stops
    pub max_consecutive_failures: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl PeriodicConfig {
    pub fn every(period: Duration) -> Self {
        Self {
            period,
            max_consecutive_failures: 5,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: period.max(Duration::from_secs(1)),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TaskError {
    #[error("Task '{task}' exceeded maximum consecutive failures ({failures}). Last error: {last_error}")]
    TooManyFailures {
        task: String,
        failures: u32,
        last_error: String,
    },
}

#[derive(Debug)]
struct FailureState {
    consecutive_failures: u32,
    current_retry_delay: Duration,
}

impl FailureState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            current_retry_delay: initial_delay,
        }
    }

    fn record_failure(&mut self, max_delay: Duration) -> Duration {
        self.consecutive_failures += 1;
        let delay = self.current_retry_delay;
        self.current_retry_delay = std::cmp::min(self.current_retry_delay * 2, max_delay);
        delay
    }

    fn reset(&mut self, initial_delay: Duration) {
        self.consecutive_failures = 0;
        self.current_retry_delay = initial_delay;
    }
}

/// Run `task_fn` now and then once per period until `shutdown` turns true
///
/// # Arguments
/// * `task_name` - Name of the task for logging purposes
/// * `config` - Period and failure policy
/// * `shutdown` - Watch channel flipped to `true` on shutdown
/// * `task_fn` - Async function that executes one iteration of the task
///
/// # Errors
/// `TooManyFailures` once `max_consecutive_failures` iterations in a row failed
pub async fn run_periodic<F, Fut>(
    task_name: &str,
    config: PeriodicConfig,
    mut shutdown: watch::Receiver<bool>,
    mut task_fn: F,
) -> Result<(), TaskError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let mut state = FailureState::new(config.initial_retry_delay);
    info!("Task '{}' started, period {:?}", task_name, config.period);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let wait = match task_fn().await {
            Ok(()) => {
                if state.consecutive_failures > 0 {
                    warn!(
                        "Task '{}' recovered after {} failures",
                        task_name, state.consecutive_failures
                    );
                }
                state.reset(config.initial_retry_delay);
                config.period
            }
            Err(e) => {
                let delay = state.record_failure(config.max_retry_delay);
                error!(
                    "Task '{}' failed (attempt {}/{}): {}",
                    task_name, state.consecutive_failures, config.max_consecutive_failures, e
                );
                if state.consecutive_failures >= config.max_consecutive_failures {
                    return Err(TaskError::TooManyFailures {
                        task: task_name.to_string(),
                        failures: state.consecutive_failures,
                        last_error: e,
                    });
                }
                warn!("Task '{}' will retry in {:?}", task_name, delay);
                delay
            }
        };

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    debug!("Task '{}' shutdown sender dropped", task_name);
                    break;
                }
            }
            _ = sleep(wait) => {}
        }
    }

    info!("Task '{}' stopped", task_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_config(max_failures: u32) -> PeriodicConfig {
        PeriodicConfig {
            period: Duration::from_millis(5),
            max_consecutive_failures: max_failures,
            initial_retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_recovers_after_failures() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let attempt_count_clone = attempt_count.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            run_periodic("test_task", fast_config(3), shutdown_rx, || {
                let count = attempt_count_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count < 2 {
                        Err("Simulated failure".to_string())
                    } else {
                        Ok(())
                    }
                }
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();

        assert_eq!(handle.await.unwrap(), Ok(()));
        assert!(attempt_count.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_stops_after_max_failures() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let result = run_periodic("failing_task", fast_config(3), shutdown_rx, || async {
            Err("Always fails".to_string())
        })
        .await;

        assert_eq!(
            result,
            Err(TaskError::TooManyFailures {
                task: "failing_task".to_string(),
                failures: 3,
                last_error: "Always fails".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_shutdown_before_first_run() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        run_periodic("idle", fast_config(1), shutdown_rx, move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
