//! Lifecycle of a contention run.
//!
//! The [`Coordinator`] spawns a fixed number of update workers sharing one stop signal, then
//! supervises them until either every worker has exited on its own or the operator interrupt
//! fires. In the latter case it requests a stop from every still-alive worker. Either way it
//! joins every worker before returning, so no task outlives a run.

use std::time::Duration;

use contention_config::shared::WorkersConfig;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::concurrency::cancellation::{StopHandle, StopSignal, WaitOutcome, create_stop_signal};
use crate::error::ContentionError;
use crate::store::{LockPolicy, RecordStore};
use crate::workers::{UpdateWorker, UpdateWorkerConfig, WorkerCompletion, WorkerPool, WorkerReport};

/// Default delay between two worker spawns.
const DEFAULT_SPAWN_STAGGER: Duration = Duration::from_secs(1);

/// Lifecycle state of a [`Coordinator`].
///
/// Transitions only move forward: `Starting -> Running -> Draining -> Done`. An interrupt
/// received while workers are still being spawned skips `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CoordinatorState {
    /// Workers are being spawned.
    Starting,
    /// All workers were spawned and are being supervised.
    Running,
    /// Supervision ended, remaining workers are being stopped and joined.
    Draining,
    /// Every worker was joined.
    Done,
}

/// Why supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The operator interrupt fired.
    Interrupted,
    /// Every worker exited on its own.
    WorkersFinished,
}

/// Settings of a run.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Lock policy shared by every worker of the run.
    pub policy: LockPolicy,
    /// Number of workers to spawn.
    pub worker_count: usize,
    /// Delay between two spawns. The first worker is spawned without delay.
    pub spawn_stagger: Duration,
    /// Pause between two iterations of a worker.
    pub pacing: Duration,
    /// Iterations after which each worker exits on its own, `None` for unbounded.
    pub max_iterations: Option<u64>,
}

impl CoordinatorConfig {
    /// Creates a configuration with the default stagger and the policy's default pacing.
    pub fn new(policy: LockPolicy, worker_count: usize) -> Self {
        Self {
            policy,
            worker_count,
            spawn_stagger: DEFAULT_SPAWN_STAGGER,
            pacing: policy.default_pacing(),
            max_iterations: None,
        }
    }

    /// Creates a configuration from the `workers` section of the harness configuration.
    pub fn from_workers_config(policy: LockPolicy, config: &WorkersConfig) -> Self {
        let pacing_ms = match policy {
            LockPolicy::Optimistic => config.optimistic_pacing_ms,
            LockPolicy::Pessimistic => config.pessimistic_pacing_ms,
        };

        Self {
            policy,
            worker_count: config.count,
            spawn_stagger: Duration::from_millis(config.spawn_stagger_ms),
            pacing: Duration::from_millis(pacing_ms),
            max_iterations: config.max_iterations,
        }
    }

    fn worker_config(&self) -> UpdateWorkerConfig {
        UpdateWorkerConfig {
            policy: self.policy,
            pacing: self.pacing,
            max_iterations: self.max_iterations,
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug)]
pub struct CoordinatorReport {
    /// Why supervision ended.
    pub exit_reason: ExitReason,
    /// Number of still-alive workers the stop request was addressed to on interrupt.
    pub stop_broadcasts: usize,
    /// Reports of workers that left their loop, in join order.
    pub workers: Vec<WorkerReport>,
    /// Errors of workers that terminated abnormally.
    pub failures: Vec<ContentionError>,
}

impl CoordinatorReport {
    /// Returns the number of committed updates across all reported workers.
    pub fn total_committed(&self) -> u64 {
        self.workers.iter().map(|report| report.committed).sum()
    }

    /// Returns the number of conditional updates that matched zero rows, across all workers.
    ///
    /// A run never reports more than one anomaly per worker, since detecting one ends the loop.
    pub fn total_anomalies(&self) -> u64 {
        self.workers.iter().map(|report| report.anomalies).sum()
    }

    fn record(&mut self, completion: WorkerCompletion) {
        match completion {
            WorkerCompletion::Finished(report) => self.workers.push(report),
            WorkerCompletion::Failed { error, .. } => self.failures.push(error),
        }
    }
}

/// Supervisor of the update workers of a run.
#[derive(Debug)]
pub struct Coordinator<S> {
    config: CoordinatorConfig,
    store: S,
    interrupt_handle: StopHandle,
    interrupt_signal: StopSignal,
    state_tx: watch::Sender<CoordinatorState>,
}

impl<S> Coordinator<S>
where
    S: RecordStore + Clone + Send + Sync + 'static,
{
    /// Creates a coordinator in the [`CoordinatorState::Starting`] state.
    ///
    /// Nothing is spawned and no connection is opened until [`Coordinator::run`] is awaited.
    pub fn new(config: CoordinatorConfig, store: S) -> Self {
        let (interrupt_handle, interrupt_signal) = create_stop_signal();
        let (state_tx, _) = watch::channel(CoordinatorState::Starting);

        Self {
            config,
            store,
            interrupt_handle,
            interrupt_signal,
            state_tx,
        }
    }

    /// Returns the handle that interrupts the run when triggered.
    ///
    /// Workers never observe it directly: the coordinator translates it into a stop request
    /// on the signal it shares with them.
    pub fn interrupt_handle(&self) -> StopHandle {
        self.interrupt_handle.clone()
    }

    /// Returns a receiver of the coordinator's lifecycle state.
    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state_tx.subscribe()
    }

    /// Runs the workers until they all exit or the interrupt fires, then joins them.
    pub async fn run(mut self) -> CoordinatorReport {
        info!(
            policy = %self.config.policy,
            worker_count = self.config.worker_count,
            "starting coordinator"
        );

        let (workers_stop, _) = create_stop_signal();
        let worker_config = self.config.worker_config();
        let mut pool = WorkerPool::new();

        let mut interrupted = false;
        for worker_id in 0..self.config.worker_count {
            if worker_id > 0
                && self
                    .interrupt_signal
                    .wait_or_stop(self.config.spawn_stagger)
                    .await
                    == WaitOutcome::Stopped
            {
                interrupted = true;
                break;
            }

            if !self.interrupt_signal.should_continue() {
                interrupted = true;
                break;
            }

            pool.spawn(UpdateWorker::new(
                worker_id,
                worker_config.clone(),
                self.store.clone(),
                workers_stop.clone(),
            ));
            info!(worker_id, "spawned update worker");
        }

        let mut report = CoordinatorReport {
            exit_reason: ExitReason::WorkersFinished,
            stop_broadcasts: 0,
            workers: Vec::with_capacity(self.config.worker_count),
            failures: Vec::new(),
        };

        if interrupted {
            info!("interrupt received while spawning update workers");
            report.exit_reason = ExitReason::Interrupted;
        } else {
            self.set_state(CoordinatorState::Running);

            report.exit_reason = loop {
                tokio::select! {
                    biased;

                    _ = self.interrupt_signal.wait_for_stop() => {
                        info!("interrupt received, stopping update workers");
                        break ExitReason::Interrupted;
                    }
                    completion = pool.join_next() => match completion {
                        Some(completion) => report.record(completion),
                        None => {
                            info!("all update workers exited");
                            break ExitReason::WorkersFinished;
                        }
                    }
                }
            };
        }

        self.set_state(CoordinatorState::Draining);

        if report.exit_reason == ExitReason::Interrupted {
            report.stop_broadcasts = pool.alive_count();
            workers_stop.request_stop();
            info!(
                alive_workers = report.stop_broadcasts,
                "stop requested for all alive update workers"
            );
        }

        for completion in pool.wait_all().await {
            report.record(completion);
        }

        self.set_state(CoordinatorState::Done);

        if !report.failures.is_empty() {
            warn!(
                failed_workers = report.failures.len(),
                "some update workers terminated with an error"
            );
        }

        info!(
            exit_reason = ?report.exit_reason,
            committed = report.total_committed(),
            anomalies = report.total_anomalies(),
            "coordinator finished"
        );

        report
    }

    fn set_state(&self, state: CoordinatorState) {
        let previous = self.state_tx.send_replace(state);
        info!(?previous, current = ?state, "coordinator state changed");
    }
}
