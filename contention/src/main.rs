//! Contention harness binary.
//!
//! Runs a fixed number of update workers against the versioned record under the selected lock
//! policy, until they exit on their own or the process is interrupted.

use std::process::ExitCode;

use clap::Parser;
use contention::coordinator::{Coordinator, CoordinatorConfig, CoordinatorReport};
use contention::error::ContentionError;
use contention::store::LockPolicy;
use contention::store::postgres::PostgresRecordStore;
use contention_config::shared::{HarnessConfig, ValidationError, WorkersConfig};
use contention_config::{LoadConfigError, load_config};
use contention_telemetry::tracing::{TracingError, init_tracing};
use thiserror::Error;
use tracing::{info, warn};

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(
    name = "contention",
    version,
    about = "Demonstrates lost updates between concurrent writers under two lock policies"
)]
struct Args {
    /// Lock policy: `optimistic` (alias `without_lock`) or `pessimistic` (alias `with_lock`).
    #[arg(long, alias = "test", value_parser = parse_policy)]
    policy: LockPolicy,
    /// Number of update workers, overriding the configuration.
    #[arg(long)]
    workers: Option<usize>,
    /// Number of iterations after which each worker exits, overriding the configuration.
    #[arg(long)]
    iterations: Option<u64>,
}

impl Args {
    fn apply_overrides(&self, workers: &mut WorkersConfig) {
        if let Some(count) = self.workers {
            workers.count = count;
        }

        if let Some(iterations) = self.iterations {
            workers.max_iterations = Some(iterations);
        }
    }
}

fn parse_policy(value: &str) -> Result<LockPolicy, ContentionError> {
    value.parse()
}

/// Errors preventing the harness from running.
#[derive(Debug, Error)]
enum HarnessError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadConfigError),

    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TracingError),

    #[error("failed to start the async runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();

            // `--help` and `--version` are reported as errors that go to stdout.
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("contention failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), HarnessError> {
    let mut config = load_config::<HarnessConfig>()?;
    args.apply_overrides(&mut config.workers);
    config.validate()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(args.policy, config));

    Ok(())
}

async fn async_main(policy: LockPolicy, config: HarnessConfig) {
    let store = PostgresRecordStore::new(config.database, &config.record.table);
    let coordinator = Coordinator::new(
        CoordinatorConfig::from_workers_config(policy, &config.workers),
        store,
    );

    let interrupt = coordinator.interrupt_handle();
    let signal_task = tokio::spawn(async move {
        wait_for_termination_signal().await;

        if interrupt.request_stop() {
            info!("interrupting the contention run");
        }
    });

    let report = coordinator.run().await;
    signal_task.abort();

    log_report(&report);
}

/// Waits for SIGINT or, on unix, SIGTERM.
async fn wait_for_termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("sigint (ctrl+c) received"),
                    _ = sigterm.recv() => info!("sigterm received"),
                }
                return;
            }
            Err(err) => warn!(error = %err, "failed to register sigterm handler"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("sigint (ctrl+c) received"),
        Err(err) => {
            warn!(error = %err, "failed to listen for ctrl+c, the run can only end on its own");
            std::future::pending::<()>().await;
        }
    }
}

fn log_report(report: &CoordinatorReport) {
    for worker in &report.workers {
        info!(
            worker_id = worker.worker_id,
            exit = ?worker.exit,
            iterations = worker.iterations,
            committed = worker.committed,
            anomalies = worker.anomalies,
            store_errors = worker.store_errors,
            "worker summary"
        );
    }

    for failure in &report.failures {
        warn!(error = %failure, "worker failure");
    }

    info!(
        exit_reason = ?report.exit_reason,
        stop_broadcasts = report.stop_broadcasts,
        committed = report.total_committed(),
        anomalies = report.total_anomalies(),
        "contention run finished"
    );
}

#[cfg(test)]
mod tests {
    use clap::error::ErrorKind;

    use super::*;

    #[test]
    fn parses_policy_names_and_legacy_flag() {
        let args = Args::try_parse_from(["contention", "--policy", "optimistic"]).unwrap();
        assert_eq!(args.policy, LockPolicy::Optimistic);

        let args = Args::try_parse_from(["contention", "--test", "with_lock"]).unwrap();
        assert_eq!(args.policy, LockPolicy::Pessimistic);

        let args = Args::try_parse_from(["contention", "--test", "without_lock"]).unwrap();
        assert_eq!(args.policy, LockPolicy::Optimistic);
    }

    #[test]
    fn missing_or_invalid_policy_is_a_usage_error() {
        let missing = Args::try_parse_from(["contention"]).unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::MissingRequiredArgument);
        assert!(missing.use_stderr());

        let empty = Args::try_parse_from(["contention", "--policy", ""]).unwrap_err();
        assert!(empty.use_stderr());

        let unknown = Args::try_parse_from(["contention", "--test", "sometimes"]).unwrap_err();
        assert_eq!(unknown.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn help_is_not_a_failure() {
        let help = Args::try_parse_from(["contention", "--help"]).unwrap_err();

        assert_eq!(help.kind(), ErrorKind::DisplayHelp);
        assert!(!help.use_stderr());
    }

    #[test]
    fn overrides_replace_configured_values() {
        let args = Args::try_parse_from([
            "contention",
            "--policy",
            "pessimistic",
            "--workers",
            "5",
            "--iterations",
            "3",
        ])
        .unwrap();
        let mut workers = WorkersConfig::default();

        args.apply_overrides(&mut workers);

        assert_eq!(workers.count, 5);
        assert_eq!(workers.max_iterations, Some(3));
        assert_eq!(workers.spawn_stagger_ms, 1_000);
    }

    #[test]
    fn zero_workers_fail_validation() {
        let args =
            Args::try_parse_from(["contention", "--policy", "optimistic", "--workers", "0"])
                .unwrap();
        let mut workers = WorkersConfig::default();

        args.apply_overrides(&mut workers);

        assert!(matches!(
            workers.validate(),
            Err(ValidationError::WorkerCountZero)
        ));
    }
}
