//! Update worker running read-modify-write cycles against the versioned record.
//!
//! Each worker owns one store connection and loops until a stop is requested, until its
//! iteration budget is spent, or until it observes a conditional update matching zero rows.
//! The latter stops every sibling too, under both lock policies.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::concurrency::cancellation::{StopHandle, StopSignal, WaitOutcome};
use crate::error::{ContentionError, ContentionResult};
use crate::store::{LockPolicy, Record, RecordConnection, RecordStore, UpdateOutcome};

/// Identifier of a worker within a single run, assigned in spawn order.
pub type WorkerId = usize;

/// Per-worker settings.
#[derive(Debug, Clone)]
pub struct UpdateWorkerConfig {
    /// Lock policy used for every cycle.
    pub policy: LockPolicy,
    /// Pause between two cycles. A stop request cuts it short.
    pub pacing: Duration,
    /// Number of cycles after which the worker exits on its own. `None` means unbounded.
    pub max_iterations: Option<u64>,
}

impl UpdateWorkerConfig {
    /// Creates an unbounded configuration with the policy's default pacing.
    pub fn for_policy(policy: LockPolicy) -> Self {
        Self {
            policy,
            pacing: policy.default_pacing(),
            max_iterations: None,
        }
    }
}

/// Why a worker left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// A stop was requested, by the coordinator or by a sibling.
    Stopped,
    /// This worker saw a conditional update match zero rows and requested a stop.
    AnomalyDetected,
    /// The configured number of iterations was reached.
    IterationsExhausted,
}

/// Summary of a finished worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// Worker this report belongs to.
    pub worker_id: WorkerId,
    /// Lock policy the worker ran with.
    pub policy: LockPolicy,
    /// Cycles attempted, whatever their outcome.
    pub iterations: u64,
    /// Cycles whose conditional update was committed.
    pub committed: u64,
    /// Cycles whose conditional update matched zero rows.
    pub anomalies: u64,
    /// Cycles that failed with a store error.
    pub store_errors: u64,
    /// Why the worker left its loop.
    pub exit: WorkerExit,
}

impl WorkerReport {
    fn new(worker_id: WorkerId, policy: LockPolicy) -> Self {
        Self {
            worker_id,
            policy,
            iterations: 0,
            committed: 0,
            anomalies: 0,
            store_errors: 0,
            exit: WorkerExit::Stopped,
        }
    }
}

/// Closed set of outcomes of one cycle, dispatched on by the worker loop.
#[derive(Debug)]
enum CycleOutcome {
    /// The update was committed.
    Committed {
        previous: Record,
        version: i64,
        content: String,
    },
    /// The store failed. The next iteration retries.
    StoreError(ContentionError),
    /// The update matched zero rows.
    Anomaly { read: Record, content: String },
}

/// Worker contending on the versioned record.
#[derive(Debug)]
pub struct UpdateWorker<S> {
    worker_id: WorkerId,
    config: UpdateWorkerConfig,
    store: S,
    stop_handle: StopHandle,
    stop_signal: StopSignal,
}

impl<S> UpdateWorker<S>
where
    S: RecordStore,
{
    /// Creates a worker observing, and able to trigger, `stop_handle`.
    pub fn new(
        worker_id: WorkerId,
        config: UpdateWorkerConfig,
        store: S,
        stop_handle: StopHandle,
    ) -> Self {
        let stop_signal = stop_handle.subscribe();

        Self {
            worker_id,
            config,
            store,
            stop_handle,
            stop_signal,
        }
    }

    /// Returns the identifier of this worker within its run.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Returns the lock policy used for every cycle.
    pub fn policy(&self) -> LockPolicy {
        self.config.policy
    }

    /// Runs the worker loop to completion.
    ///
    /// Only a failure to open the store connection is returned as an error: store errors
    /// during a cycle are logged and retried by the next iteration.
    pub async fn run(mut self) -> ContentionResult<WorkerReport> {
        let policy = self.config.policy;
        let mut report = WorkerReport::new(self.worker_id, policy);

        if !self.stop_signal.should_continue() {
            info!("stop requested before the first iteration, update worker exiting");
            return Ok(report);
        }

        let mut connection = self.store.connect().await?;
        info!(pacing_ms = self.config.pacing.as_millis() as u64, "update worker started");

        report.exit = loop {
            if !self.stop_signal.should_continue() {
                break WorkerExit::Stopped;
            }

            report.iterations += 1;
            match self.run_cycle(&mut connection).await {
                CycleOutcome::Committed {
                    previous,
                    version,
                    content,
                } => {
                    report.committed += 1;
                    info!(
                        previous_version = previous.version,
                        version,
                        previous_content = %previous.content,
                        content = %content,
                        "record updated"
                    );
                }
                CycleOutcome::StoreError(err) => {
                    report.store_errors += 1;
                    error!(error = %err, "store error during update, retrying on next iteration");
                }
                CycleOutcome::Anomaly { read, content } => {
                    report.anomalies += 1;
                    warn!(
                        read_version = read.version,
                        previous_content = %read.content,
                        content = %content,
                        "conditional update matched no row, the version changed after it was read"
                    );

                    if self.stop_handle.request_stop() {
                        info!("stop requested for all update workers");
                    }

                    break WorkerExit::AnomalyDetected;
                }
            }

            if self
                .config
                .max_iterations
                .is_some_and(|max_iterations| report.iterations >= max_iterations)
            {
                break WorkerExit::IterationsExhausted;
            }

            if self.stop_signal.wait_or_stop(self.config.pacing).await == WaitOutcome::Stopped {
                break WorkerExit::Stopped;
            }
        };

        info!(
            exit = ?report.exit,
            iterations = report.iterations,
            committed = report.committed,
            anomalies = report.anomalies,
            store_errors = report.store_errors,
            "update worker finished"
        );

        Ok(report)
    }

    /// Runs one read-modify-write cycle with freshly generated content.
    async fn run_cycle(&self, connection: &mut S::Connection) -> CycleOutcome {
        let content = generate_content();
        debug!(content = %content, "starting read-modify-write cycle");

        match connection
            .read_modify_write(self.config.policy, &content)
            .await
        {
            Ok(UpdateOutcome::Committed { previous, version }) => CycleOutcome::Committed {
                previous,
                version,
                content,
            },
            Ok(UpdateOutcome::Conflict { read }) => CycleOutcome::Anomaly { read, content },
            Err(err) => CycleOutcome::StoreError(err),
        }
    }
}

/// Generates a content value distinct across iterations with overwhelming probability.
fn generate_content() -> String {
    rand::random::<f64>().to_string()
}
