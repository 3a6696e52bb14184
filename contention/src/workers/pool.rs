use std::collections::HashMap;

use tokio::task::{AbortHandle, JoinSet};
use tracing::{Instrument, debug, error, info_span};

use crate::contention_error;
use crate::error::{ContentionError, ErrorKind};
use crate::store::{LockPolicy, RecordStore};
use crate::workers::update::{UpdateWorker, WorkerId, WorkerReport};

/// Liveness handle of a spawned update worker.
#[derive(Debug)]
pub struct UpdateWorkerHandle {
    worker_id: WorkerId,
    policy: LockPolicy,
    abort_handle: AbortHandle,
}

impl UpdateWorkerHandle {
    /// Returns the identifier the worker was spawned with.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Returns the lock policy the worker runs its cycles with.
    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Returns whether the worker task has terminated, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.abort_handle.is_finished()
    }
}

/// Result of joining one worker task.
#[derive(Debug)]
pub enum WorkerCompletion {
    /// The worker left its loop and produced a report.
    Finished(WorkerReport),
    /// The worker terminated with an error, including panics.
    Failed {
        /// `None` when the task panicked, since its identity is lost with it.
        worker_id: Option<WorkerId>,
        error: ContentionError,
    },
}

/// Pool owning every update worker task of a run.
#[derive(Debug)]
pub struct WorkerPool {
    handles: HashMap<WorkerId, UpdateWorkerHandle>,
    join_set: JoinSet<(WorkerId, Result<WorkerReport, ContentionError>)>,
}

impl WorkerPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
            join_set: JoinSet::new(),
        }
    }

    /// Spawns `worker` on the runtime and tracks its handle.
    pub fn spawn<S>(&mut self, worker: UpdateWorker<S>)
    where
        S: RecordStore + Send + Sync + 'static,
    {
        let worker_id = worker.worker_id();
        let policy = worker.policy();

        let span = info_span!("update_worker", worker_id, %policy);
        let abort_handle = self.join_set.spawn(
            async move {
                let result = worker.run().await;
                (worker_id, result)
            }
            .instrument(span),
        );

        self.handles.insert(
            worker_id,
            UpdateWorkerHandle {
                worker_id,
                policy,
                abort_handle,
            },
        );

        debug!(worker_id, "spawned update worker in pool");
    }

    /// Returns how many spawned workers have not terminated yet.
    pub fn alive_count(&self) -> usize {
        self.handles
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Returns the handles of workers not joined yet.
    pub fn handles(&self) -> impl Iterator<Item = &UpdateWorkerHandle> {
        self.handles.values()
    }

    /// Returns whether every spawned worker has been joined.
    pub fn is_empty(&self) -> bool {
        self.join_set.is_empty()
    }

    /// Waits for the next worker to terminate.
    ///
    /// Returns `None` once every worker has been joined. Cancel safe, so it can be raced
    /// against other events in `tokio::select!`.
    pub async fn join_next(&mut self) -> Option<WorkerCompletion> {
        let result = self.join_set.join_next().await?;

        let completion = match result {
            Ok((worker_id, Ok(report))) => {
                self.handles.remove(&worker_id);
                debug!(worker_id, exit = ?report.exit, "update worker joined");

                WorkerCompletion::Finished(report)
            }
            Ok((worker_id, Err(err))) => {
                self.handles.remove(&worker_id);
                error!(worker_id, error = %err, "update worker completed with error");

                WorkerCompletion::Failed {
                    worker_id: Some(worker_id),
                    error: err,
                }
            }
            Err(join_err) => {
                self.handles.retain(|_, handle| !handle.is_finished());

                let error = if join_err.is_cancelled() {
                    contention_error!(
                        ErrorKind::UpdateWorkerPanic,
                        "Update worker task was cancelled",
                        source: join_err
                    )
                } else {
                    contention_error!(
                        ErrorKind::UpdateWorkerPanic,
                        "Update worker panicked",
                        source: join_err
                    )
                };
                error!(error = %error, "update worker task terminated abnormally");

                WorkerCompletion::Failed {
                    worker_id: None,
                    error,
                }
            }
        };

        Some(completion)
    }

    /// Waits for every remaining worker to terminate.
    pub async fn wait_all(&mut self) -> Vec<WorkerCompletion> {
        let mut completions = Vec::with_capacity(self.join_set.len());
        while let Some(completion) = self.join_next().await {
            completions.push(completion);
        }

        self.handles.clear();

        completions
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::concurrency::cancellation::create_stop_signal;
    use crate::store::Record;
    use crate::store::memory::MemoryRecordStore;
    use crate::workers::update::{UpdateWorkerConfig, WorkerExit};

    #[tokio::test]
    async fn joins_every_spawned_worker() {
        let store = MemoryRecordStore::new(Record::new(0, "initial"));
        let (stop_handle, _) = create_stop_signal();
        let config = UpdateWorkerConfig {
            policy: LockPolicy::Pessimistic,
            pacing: Duration::from_millis(1),
            max_iterations: Some(2),
        };

        let mut pool = WorkerPool::new();
        for worker_id in 0..3 {
            pool.spawn(UpdateWorker::new(
                worker_id,
                config.clone(),
                store.clone(),
                stop_handle.clone(),
            ));
        }

        let completions = pool.wait_all().await;

        assert_eq!(completions.len(), 3);
        for completion in completions {
            match completion {
                WorkerCompletion::Finished(report) => {
                    assert_eq!(report.exit, WorkerExit::IterationsExhausted)
                }
                other => panic!("expected a report, got {other:?}"),
            }
        }
        assert!(pool.is_empty());
        assert_eq!(pool.alive_count(), 0);
        assert_eq!(store.record().map(|record| record.version), Some(6));
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_alive_workers() {
        let store = MemoryRecordStore::new(Record::new(0, "initial"));
        let (stop_handle, _) = create_stop_signal();
        let config = UpdateWorkerConfig {
            pacing: Duration::from_secs(3600),
            ..UpdateWorkerConfig::for_policy(LockPolicy::Optimistic)
        };

        let mut pool = WorkerPool::new();
        pool.spawn(UpdateWorker::new(
            0,
            config,
            store.clone(),
            stop_handle.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(pool.alive_count(), 1);
        assert!(pool.handles().all(|handle| handle.policy() == LockPolicy::Optimistic));

        stop_handle.request_stop();
        let completions = pool.wait_all().await;

        assert!(matches!(
            completions.as_slice(),
            [WorkerCompletion::Finished(WorkerReport {
                exit: WorkerExit::Stopped,
                ..
            })]
        ));
        assert_eq!(pool.alive_count(), 0);
    }
}
