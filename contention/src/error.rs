//! Error type of the contention harness.
//!
//! A [`ContentionError`] carries an [`ErrorKind`] callers dispatch on, a static description,
//! optional dynamic detail, an optional source error, and the callsite that created it.
//! Build them with [`crate::contention_error!`] or return them with [`crate::bail!`].

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Convenient result type for fallible operations of the harness.
pub type ContentionResult<T> = Result<T, ContentionError>;

/// Categories of failures.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connection
    SourceConnectionFailed,
    AuthenticationError,
    TlsError,

    // Queries
    SourceQueryFailed,
    SourceLockTimeout,
    SourceOperationCanceled,
    SourceSchemaError,
    RecordMissing,

    // Configuration
    ConfigError,
    InvalidPolicy,

    // Workers
    InvalidState,
    UpdateWorkerPanic,

    /// Transient failure raised on purpose by test stores.
    InjectedFailure,

    Unknown,
}

#[derive(Debug)]
struct Payload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Backtrace,
}

/// Error returned by every fallible harness operation.
#[derive(Debug)]
pub struct ContentionError {
    payload: Box<Payload>,
}

impl ContentionError {
    #[track_caller]
    fn new(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            payload: Box::new(Payload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Backtrace::capture(),
            }),
        }
    }

    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.payload.kind
    }

    /// Returns the static, human readable description.
    pub fn description(&self) -> &str {
        &self.payload.description
    }

    /// Returns the dynamic detail attached at the callsite, if any.
    pub fn detail(&self) -> Option<&str> {
        self.payload.detail.as_deref()
    }

    /// Returns the callsite where this error was created.
    pub fn location(&self) -> &'static Location<'static> {
        self.payload.location
    }

    /// Returns the backtrace captured at creation, empty unless `RUST_BACKTRACE` is set.
    pub fn backtrace(&self) -> &Backtrace {
        &self.payload.backtrace
    }

    /// Attaches the error that caused this one.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        self.payload.source = Some(Arc::new(source));
        self
    }

    #[track_caller]
    fn from_driver<E>(kind: ErrorKind, description: &'static str, err: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        let detail = err.to_string();
        Self::new(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl PartialEq for ContentionError {
    fn eq(&self, other: &Self) -> bool {
        self.payload.kind == other.payload.kind
            && self.payload.description == other.payload.description
    }
}

impl fmt::Display for ContentionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = self.payload.location;
        write!(
            f,
            "[{:?}] {} @ {}:{}",
            self.payload.kind,
            self.payload.description,
            location.file(),
            location.line()
        )?;

        if let Some(detail) = &self.payload.detail {
            for line in detail.lines() {
                write!(f, "\n    {line}")?;
            }
        }

        Ok(())
    }
}

impl error::Error for ContentionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.payload
            .source
            .as_deref()
            .map(|source| source as &(dyn error::Error + 'static))
    }
}

impl From<(ErrorKind, &'static str)> for ContentionError {
    #[track_caller]
    fn from((kind, description): (ErrorKind, &'static str)) -> Self {
        Self::new(kind, Cow::Borrowed(description), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for ContentionError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, description, detail): (ErrorKind, &'static str, D)) -> Self {
        Self::new(kind, Cow::Borrowed(description), Some(detail.into()), None)
    }
}

impl From<std::io::Error> for ContentionError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_driver(ErrorKind::SourceConnectionFailed, "I/O operation failed", err)
    }
}

impl From<rustls::Error> for ContentionError {
    #[track_caller]
    fn from(err: rustls::Error) -> Self {
        Self::from_driver(ErrorKind::TlsError, "TLS configuration failed", err)
    }
}

/// Converts [`tokio_postgres::Error`] by classifying its SQLSTATE.
///
/// Errors without a SQLSTATE come from the client side. Only a closed connection is classified
/// as a connection failure; anything else (unexpected row counts, type conversions) failed the
/// request itself.
impl From<tokio_postgres::Error> for ContentionError {
    #[track_caller]
    fn from(err: tokio_postgres::Error) -> Self {
        let (kind, description) = match err.code() {
            Some(sqlstate) => {
                use tokio_postgres::error::SqlState;

                match *sqlstate {
                    SqlState::CONNECTION_EXCEPTION
                    | SqlState::CONNECTION_DOES_NOT_EXIST
                    | SqlState::CONNECTION_FAILURE
                    | SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION
                    | SqlState::SQLSERVER_REJECTED_ESTABLISHMENT_OF_SQLCONNECTION
                    | SqlState::TOO_MANY_CONNECTIONS
                    | SqlState::ADMIN_SHUTDOWN
                    | SqlState::CRASH_SHUTDOWN
                    | SqlState::CANNOT_CONNECT_NOW
                    | SqlState::IDLE_SESSION_TIMEOUT => (
                        ErrorKind::SourceConnectionFailed,
                        "PostgreSQL connection failed",
                    ),

                    SqlState::INVALID_AUTHORIZATION_SPECIFICATION | SqlState::INVALID_PASSWORD => (
                        ErrorKind::AuthenticationError,
                        "PostgreSQL authentication failed",
                    ),

                    SqlState::UNDEFINED_TABLE
                    | SqlState::UNDEFINED_COLUMN
                    | SqlState::UNDEFINED_SCHEMA
                    | SqlState::DATATYPE_MISMATCH => (
                        ErrorKind::SourceSchemaError,
                        "PostgreSQL schema does not match the versioned record",
                    ),

                    SqlState::LOCK_NOT_AVAILABLE => (
                        ErrorKind::SourceLockTimeout,
                        "PostgreSQL lock not available",
                    ),

                    SqlState::QUERY_CANCELED | SqlState::OPERATOR_INTERVENTION => (
                        ErrorKind::SourceOperationCanceled,
                        "PostgreSQL query canceled",
                    ),

                    SqlState::T_R_SERIALIZATION_FAILURE
                    | SqlState::T_R_DEADLOCK_DETECTED
                    | SqlState::IN_FAILED_SQL_TRANSACTION
                    | SqlState::IDLE_IN_TRANSACTION_SESSION_TIMEOUT => {
                        (ErrorKind::InvalidState, "PostgreSQL transaction failed")
                    }

                    _ => (ErrorKind::SourceQueryFailed, "PostgreSQL query failed"),
                }
            }
            None if err.is_closed() => (
                ErrorKind::SourceConnectionFailed,
                "PostgreSQL connection closed",
            ),
            None => (ErrorKind::SourceQueryFailed, "PostgreSQL client request failed"),
        };

        Self::from_driver(kind, description, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bail, contention_error};

    fn failing() -> ContentionResult<()> {
        bail!(ErrorKind::RecordMissing, "Record not found", "table post is empty");
    }

    #[test]
    fn macro_builds_error_with_detail() {
        let err = contention_error!(ErrorKind::InvalidPolicy, "Unknown policy", "sometimes");

        assert_eq!(err.kind(), ErrorKind::InvalidPolicy);
        assert_eq!(err.description(), "Unknown policy");
        assert_eq!(err.detail(), Some("sometimes"));
        assert!(err.to_string().starts_with("[InvalidPolicy] Unknown policy @ "));
        assert!(err.to_string().ends_with("\n    sometimes"));
    }

    #[test]
    fn bail_returns_early_with_callsite() {
        let err = failing().unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RecordMissing);
        assert_eq!(err.location().file(), file!());
    }

    #[test]
    fn source_is_exposed() {
        let io = std::io::Error::other("socket closed");
        let err = contention_error!(
            ErrorKind::SourceConnectionFailed,
            "Connect failed",
            source: io
        );

        let source = error::Error::source(&err).map(|source| source.to_string());
        assert_eq!(source.as_deref(), Some("socket closed"));
    }

    #[test]
    fn io_errors_are_connection_failures() {
        let err: ContentionError = std::io::Error::other("reset by peer").into();

        assert_eq!(err.kind(), ErrorKind::SourceConnectionFailed);
        assert_eq!(err.detail(), Some("reset by peer"));
    }

    #[test]
    fn equality_ignores_detail_and_location() {
        let first = contention_error!(ErrorKind::InjectedFailure, "Injected", "first");
        let second = contention_error!(ErrorKind::InjectedFailure, "Injected", "second");

        assert_eq!(first, second);
        assert_ne!(first, contention_error!(ErrorKind::InjectedFailure, "Other"));
    }
}
