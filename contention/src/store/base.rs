use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use crate::bail;
use crate::error::{ContentionError, ContentionResult, ErrorKind};

/// Default pause between iterations of an optimistic worker.
const OPTIMISTIC_PACING: Duration = Duration::from_millis(200);

/// Default pause between iterations of a pessimistic worker.
const PESSIMISTIC_PACING: Duration = Duration::from_millis(300);

/// Concurrency control strategy used when updating the versioned record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockPolicy {
    /// Plain read followed by a version-conditioned write. A concurrent writer committing in
    /// between makes the write match zero rows.
    Optimistic,
    /// Read taking an exclusive row lock held until commit, which serializes all workers.
    Pessimistic,
}

impl LockPolicy {
    /// Returns the canonical name of the policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            LockPolicy::Optimistic => "optimistic",
            LockPolicy::Pessimistic => "pessimistic",
        }
    }

    /// Returns whether the read of a cycle locks the row.
    pub fn locks_row(&self) -> bool {
        matches!(self, LockPolicy::Pessimistic)
    }

    /// Returns the default pause between two iterations under this policy.
    pub fn default_pacing(&self) -> Duration {
        match self {
            LockPolicy::Optimistic => OPTIMISTIC_PACING,
            LockPolicy::Pessimistic => PESSIMISTIC_PACING,
        }
    }
}

impl fmt::Display for LockPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockPolicy {
    type Err = ContentionError;

    /// Parses a policy from its name or its `with_lock`/`without_lock` alias.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "optimistic" | "without_lock" => Ok(LockPolicy::Optimistic),
            "pessimistic" | "with_lock" => Ok(LockPolicy::Pessimistic),
            "" => bail!(ErrorKind::InvalidPolicy, "Lock policy cannot be empty"),
            other => bail!(
                ErrorKind::InvalidPolicy,
                "Unknown lock policy",
                format!(
                    "`{other}` is not a lock policy, expected `optimistic` (`without_lock`) or `pessimistic` (`with_lock`)"
                )
            ),
        }
    }
}

/// Snapshot of the contended record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Monotonic version, incremented by one on every successful update.
    pub version: i64,
    /// Opaque payload replaced on every update.
    pub content: String,
}

impl Record {
    /// Creates a record snapshot.
    pub fn new(version: i64, content: impl Into<String>) -> Self {
        Self {
            version,
            content: content.into(),
        }
    }
}

/// Result of a single read-modify-write cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The conditional update matched the row read and was committed.
    Committed {
        /// Record as read at the start of the cycle.
        previous: Record,
        /// Version confirmed by the update, always `previous.version + 1`.
        version: i64,
    },
    /// The conditional update matched zero rows: the version changed after it was read.
    Conflict {
        /// Record as read at the start of the cycle.
        read: Record,
    },
}

/// Source of exclusively owned connections to a versioned record.
pub trait RecordStore {
    /// Connection type handed to a single worker.
    type Connection: RecordConnection + Send + 'static;

    /// Opens a new connection. Connections are never shared between workers.
    fn connect(&self) -> impl Future<Output = ContentionResult<Self::Connection>> + Send;
}

/// Connection able to run read-modify-write cycles on the versioned record.
pub trait RecordConnection {
    /// Runs one cycle in a single transaction.
    ///
    /// Reads the record (locking the row when `policy` requires it), writes `content` with
    /// `version = read + 1` only if the stored version still equals the one read, and commits.
    /// A write matching zero rows is reported as [`UpdateOutcome::Conflict`], not as an error.
    fn read_modify_write(
        &mut self,
        policy: LockPolicy,
        content: &str,
    ) -> impl Future<Output = ContentionResult<UpdateOutcome>> + Send;
}
