use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;
use tokio_postgres::{Config as TokioPgConnectOptions, config::SslMode as TokioPgSslMode};

use crate::shared::ValidationError;

/// Common Postgres settings shared by every harness connection.
const COMMON_DATESTYLE: &str = "ISO";
const COMMON_CLIENT_ENCODING: &str = "UTF8";
const COMMON_TIMEZONE: &str = "UTC";

const APP_NAME_UPDATE_WORKER: &str = "contention_update_worker";

/// Session options for update worker connections.
///
/// Statement and lock timeouts are disabled, so a locking read waits for the row lock as long
/// as it is held. Transactions left idle for a minute are aborted, releasing their lock.
pub static UPDATE_WORKER_OPTIONS: LazyLock<PgConnectionOptions> =
    LazyLock::new(|| PgConnectionOptions {
        datestyle: COMMON_DATESTYLE.to_string(),
        client_encoding: COMMON_CLIENT_ENCODING.to_string(),
        timezone: COMMON_TIMEZONE.to_string(),
        statement_timeout: 0,
        lock_timeout: 0,
        idle_in_transaction_session_timeout: 60_000,
        application_name: APP_NAME_UPDATE_WORKER.to_string(),
    });

/// Server session settings applied at connection startup.
#[derive(Debug, Clone)]
pub struct PgConnectionOptions {
    /// Output format of date and time values.
    pub datestyle: String,
    /// Client-side character set.
    pub client_encoding: String,
    /// Time zone of timestamps displayed to the session.
    pub timezone: String,
    /// Maximum duration of a statement, in milliseconds. Zero disables the limit.
    pub statement_timeout: u32,
    /// Maximum wait for a lock, in milliseconds. Zero waits indefinitely.
    pub lock_timeout: u32,
    /// Maximum idle time inside an open transaction, in milliseconds. Zero disables the limit.
    pub idle_in_transaction_session_timeout: u32,
    /// Name reported in `pg_stat_activity`.
    pub application_name: String,
}

impl PgConnectionOptions {
    /// Returns the options as a space-separated list of `-c key=value` pairs.
    pub fn to_options_string(&self) -> String {
        format!(
            "-c datestyle={} -c client_encoding={} -c timezone={} -c statement_timeout={} -c lock_timeout={} -c idle_in_transaction_session_timeout={} -c application_name={}",
            self.datestyle,
            self.client_encoding,
            self.timezone,
            self.statement_timeout,
            self.lock_timeout,
            self.idle_in_transaction_session_timeout,
            self.application_name
        )
    }
}

/// Configuration for connecting to a Postgres database.
#[derive(Debug, Clone, Deserialize)]
pub struct PgConnectionConfig {
    /// Hostname or IP address of the Postgres server.
    pub host: String,
    /// Port number on which the Postgres server is listening.
    pub port: u16,
    /// Name of the Postgres database to connect to.
    pub name: String,
    /// Username for authenticating with the Postgres server.
    pub username: String,
    /// Password for the specified user. Redacted in debug output.
    pub password: Option<SecretString>,
    /// TLS configuration for secure connections.
    #[serde(default = "TlsConfig::disabled")]
    pub tls: TlsConfig,
    /// TCP keepalive configuration. When `None`, TCP keepalives are disabled.
    #[serde(default)]
    pub keepalive: Option<TcpKeepaliveConfig>,
}

impl PgConnectionConfig {
    /// Validates the connection settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.tls.validate()
    }
}

/// TLS settings for secure Postgres connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM-encoded trusted root certificates.
    pub trusted_root_certs: String,
    /// Whether TLS is enabled for the connection.
    pub enabled: bool,
}

impl TlsConfig {
    /// Returns a configuration with TLS turned off and no certificates.
    pub fn disabled() -> Self {
        Self {
            trusted_root_certs: "".to_string(),
            enabled: false,
        }
    }

    /// Checks that certificates are present whenever TLS is enabled.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled && self.trusted_root_certs.is_empty() {
            return Err(ValidationError::MissingTrustedRootCerts);
        }

        Ok(())
    }
}

/// TCP keepalive probing of an idle connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpKeepaliveConfig {
    /// Idle time before the first probe, in seconds.
    pub idle_secs: u64,
    /// Time between two probes, in seconds.
    pub interval_secs: u64,
    /// Unanswered probes after which the connection is considered dead.
    pub retries: u32,
}

impl Default for TcpKeepaliveConfig {
    fn default() -> Self {
        Self {
            idle_secs: 30,
            interval_secs: 30,
            retries: 3,
        }
    }
}

/// Converts [`PgConnectionConfig`] into driver specific connect options.
pub trait IntoConnectOptions<Output> {
    /// Creates connect options without selecting a database, for administrative statements
    /// such as `create database`.
    fn without_db(&self, options: Option<&PgConnectionOptions>) -> Output;

    /// Creates connect options for [`PgConnectionConfig::name`].
    fn with_db(&self, options: Option<&PgConnectionOptions>) -> Output;
}

impl IntoConnectOptions<TokioPgConnectOptions> for PgConnectionConfig {
    fn without_db(&self, options: Option<&PgConnectionOptions>) -> TokioPgConnectOptions {
        let ssl_mode = if self.tls.enabled {
            TokioPgSslMode::Require
        } else {
            TokioPgSslMode::Prefer
        };
        let mut config = TokioPgConnectOptions::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.username)
            .ssl_mode(ssl_mode);

        if let Some(password) = &self.password {
            config.password(password.expose_secret());
        }

        if let Some(keepalive) = &self.keepalive {
            config
                .keepalives(true)
                .keepalives_idle(Duration::from_secs(keepalive.idle_secs))
                .keepalives_interval(Duration::from_secs(keepalive.interval_secs))
                .keepalives_retries(keepalive.retries);
        }

        if let Some(opts) = options {
            config.options(&opts.to_options_string());
        }

        config
    }

    fn with_db(&self, options: Option<&PgConnectionOptions>) -> TokioPgConnectOptions {
        let mut config: TokioPgConnectOptions = self.without_db(options);
        config.dbname(&self.name);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> PgConnectionConfig {
        PgConnectionConfig {
            host: "localhost".to_string(),
            port: 5432,
            name: "consistent".to_string(),
            username: "postgres".to_string(),
            password: None,
            tls: TlsConfig::disabled(),
            keepalive: None,
        }
    }

    #[test]
    fn test_update_worker_options_string_format() {
        let options_string = UPDATE_WORKER_OPTIONS.to_options_string();
        assert_eq!(
            options_string,
            "-c datestyle=ISO -c client_encoding=UTF8 -c timezone=UTC -c statement_timeout=0 -c lock_timeout=0 -c idle_in_transaction_session_timeout=60000 -c application_name=contention_update_worker"
        );
    }

    #[test]
    fn test_with_db_sets_database_name() {
        let config: TokioPgConnectOptions = local_config().with_db(None);

        assert_eq!(config.get_dbname(), Some("consistent"));
        assert_eq!(config.get_user(), Some("postgres"));
        assert_eq!(config.get_ports(), &[5432]);
        assert_eq!(config.get_ssl_mode(), TokioPgSslMode::Prefer);
    }

    #[test]
    fn test_without_db_leaves_database_unset() {
        let config: TokioPgConnectOptions = local_config().without_db(Some(&UPDATE_WORKER_OPTIONS));

        assert_eq!(config.get_dbname(), None);
        assert!(
            config
                .get_options()
                .is_some_and(
                    |options| options.contains("application_name=contention_update_worker")
                )
        );
    }

    #[test]
    fn test_tls_enabled_without_certs_is_rejected() {
        let mut config = local_config();
        config.tls.enabled = true;

        assert!(matches!(
            config.validate(),
            Err(ValidationError::MissingTrustedRootCerts)
        ));
    }
}
