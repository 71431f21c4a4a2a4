use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{AppError, AppResult};

/// Outcome of a bounded fan-out: every key lands in exactly one bucket
#[derive(Debug)]
pub struct FanOut<T> {
    pub completed: Vec<(String, T)>,
    pub failed: Vec<(String, AppError)>,
    /// Keys skipped because of cancellation or the cycle deadline
    pub not_started: Vec<String>,
}

impl<T> Default for FanOut<T> {
    fn default() -> Self {
        Self {
            completed: Vec::new(),
            failed: Vec::new(),
            not_started: Vec::new(),
        }
    }
}

/// Bounded-parallelism primitive for a cycle's per-wallet pipelines.
///
/// A permit is taken before a unit of work starts and dropped when it
/// finishes, whatever the outcome. Errors are collected per key; one failing
/// unit never stops the others.
#[derive(Clone)]
pub struct ConcurrencyGovernor {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyGovernor {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `work` for every item with at most `limit` in flight.
    ///
    /// Cancellation is checked before each item starts. Started work runs until
    /// it finishes or `deadline` passes.
    pub async fn fan_out<I, T, F, Fut>(
        &self,
        items: Vec<(String, I)>,
        cancel: &CancellationToken,
        deadline: Instant,
        work: F,
    ) -> FanOut<T>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
    {
        let work = Arc::new(work);
        let mut outcome = FanOut::default();
        let mut tasks: JoinSet<(String, AppResult<T>)> = JoinSet::new();
        // Lets a panicked task still be reported under its key
        let mut keys: HashMap<task::Id, String> = HashMap::new();
        let mut pending = items.into_iter();

        for (key, item) in pending.by_ref() {
            if cancel.is_cancelled() || Instant::now() >= deadline {
                outcome.not_started.push(key);
                break;
            }

            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        warn!("Concurrency semaphore closed: {}", e);
                        outcome.not_started.push(key);
                        break;
                    }
                },
                _ = cancel.cancelled() => {
                    outcome.not_started.push(key);
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    outcome.not_started.push(key);
                    break;
                }
            };

            let work = work.clone();
            let task_key = key.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let result = match tokio::time::timeout_at(deadline, work(item)).await {
                    Ok(result) => result,
                    Err(_) => Err(AppError::DeadlineExceeded),
                };
                (task_key, result)
            });
            keys.insert(handle.id(), key);
        }
        outcome.not_started.extend(pending.map(|(key, _)| key));

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, (key, result))) => {
                    keys.remove(&id);
                    match result {
                        Ok(value) => outcome.completed.push((key, value)),
                        Err(e) => outcome.failed.push((key, e)),
                    }
                }
                Err(e) => {
                    let key = keys
                        .remove(&e.id())
                        .unwrap_or_else(|| format!("task-{}", e.id()));
                    warn!(key = %key, "Pipeline task aborted: {}", e);
                    outcome.failed.push((key, AppError::Internal(e.to_string())));
                }
            }
        }

        outcome
    }
}
