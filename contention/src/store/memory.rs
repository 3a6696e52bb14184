use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::bail;
use crate::error::{ContentionResult, ErrorKind};
use crate::store::base::{LockPolicy, Record, RecordConnection, RecordStore, UpdateOutcome};

/// A committed `from -> to` version transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionTransition {
    /// Version read by the committing cycle.
    pub from: i64,
    /// Version written, always `from + 1`.
    pub to: i64,
}

#[derive(Debug)]
struct Inner {
    record: Mutex<Option<Record>>,
    row_lock: Arc<AsyncMutex<()>>,
    race_window: Duration,
    pending_failures: AtomicUsize,
    pending_external_writes: AtomicUsize,
    transitions: Mutex<Vec<VersionTransition>>,
    conflicts: AtomicUsize,
}

/// In-process versioned record store with the same observable semantics as the Postgres one.
///
/// A locking read acquires the row lock and keeps it until commit. An unlocked conditional
/// write takes the row lock only for the write itself, like a row update does, so it waits
/// for a locking transaction to finish before re-checking the version.
#[derive(Debug, Clone)]
pub struct MemoryRecordStore {
    inner: Arc<Inner>,
}

impl MemoryRecordStore {
    /// Creates a store holding `record`.
    pub fn new(record: Record) -> Self {
        Self::build(Some(record), Duration::ZERO)
    }

    /// Creates a store whose table has no row.
    pub fn empty() -> Self {
        Self::build(None, Duration::ZERO)
    }

    /// Creates a store that waits `race_window` between the read and the write of every cycle.
    ///
    /// Widening the gap makes lost races between optimistic workers practically certain.
    pub fn with_race_window(record: Record, race_window: Duration) -> Self {
        Self::build(Some(record), race_window)
    }

    fn build(record: Option<Record>, race_window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                record: Mutex::new(record),
                row_lock: Arc::new(AsyncMutex::new(())),
                race_window,
                pending_failures: AtomicUsize::new(0),
                pending_external_writes: AtomicUsize::new(0),
                transitions: Mutex::new(Vec::new()),
                conflicts: AtomicUsize::new(0),
            }),
        }
    }

    /// Makes the next `count` conditional writes fail with a transient store error.
    pub fn fail_next_updates(&self, count: usize) {
        self.inner.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` cycles see the version bumped by a writer that ignores the row lock,
    /// between their read and their conditional write.
    ///
    /// This is the only way a locking cycle can match zero rows.
    pub fn bump_version_during_next_cycles(&self, count: usize) {
        self.inner
            .pending_external_writes
            .store(count, Ordering::SeqCst);
    }

    /// Returns the current record, if the table has a row.
    pub fn record(&self) -> Option<Record> {
        self.lock_record().clone()
    }

    /// Returns every committed version transition in commit order.
    pub fn transitions(&self) -> Vec<VersionTransition> {
        self.inner
            .transitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Returns how many conditional writes matched zero rows.
    pub fn conflicts(&self) -> usize {
        self.inner.conflicts.load(Ordering::SeqCst)
    }

    fn lock_record(&self) -> MutexGuard<'_, Option<Record>> {
        self.inner
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> ContentionResult<Record> {
        match self.lock_record().as_ref() {
            Some(record) => Ok(record.clone()),
            None => bail!(ErrorKind::RecordMissing, "The record table has no row"),
        }
    }

    fn take_injected_failure(&self) -> bool {
        take_one(&self.inner.pending_failures)
    }

    /// Bumps the version without the row lock and without recording a transition.
    fn write_externally(&self) {
        if let Some(record) = self.lock_record().as_mut() {
            record.version += 1;
            record.content = "external".to_string();
            debug!(version = record.version, "record bumped outside the row lock");
        }
    }

    /// Writes `content` if the stored version still equals `read_version`.
    ///
    /// The caller must hold the row lock.
    fn compare_and_swap(&self, read_version: i64, content: &str) -> Option<i64> {
        let mut record = self.lock_record();
        let record = record.as_mut()?;

        if record.version != read_version {
            self.inner.conflicts.fetch_add(1, Ordering::SeqCst);
            return None;
        }

        record.version = read_version + 1;
        record.content = content.to_string();

        self.inner
            .transitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(VersionTransition {
                from: read_version,
                to: record.version,
            });

        Some(record.version)
    }
}

/// Decrements `counter` if it is positive, returning whether it was.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
            pending.checked_sub(1)
        })
        .is_ok()
}

impl RecordStore for MemoryRecordStore {
    type Connection = MemoryRecordConnection;

    async fn connect(&self) -> ContentionResult<MemoryRecordConnection> {
        Ok(MemoryRecordConnection {
            store: self.clone(),
        })
    }
}

/// Connection to a [`MemoryRecordStore`].
#[derive(Debug)]
pub struct MemoryRecordConnection {
    store: MemoryRecordStore,
}

impl MemoryRecordConnection {
    async fn lock_row(&self) -> OwnedMutexGuard<()> {
        self.store.inner.row_lock.clone().lock_owned().await
    }
}

impl RecordConnection for MemoryRecordConnection {
    async fn read_modify_write(
        &mut self,
        policy: LockPolicy,
        content: &str,
    ) -> ContentionResult<UpdateOutcome> {
        let held_lock = if policy.locks_row() {
            Some(self.lock_row().await)
        } else {
            None
        };

        let previous = self.store.read()?;
        debug!(version = previous.version, %policy, "read record");

        if !self.store.inner.race_window.is_zero() {
            tokio::time::sleep(self.store.inner.race_window).await;
        }

        if take_one(&self.store.inner.pending_external_writes) {
            self.store.write_externally();
        }

        let _row_lock = match held_lock {
            Some(guard) => guard,
            None => self.lock_row().await,
        };

        if self.store.take_injected_failure() {
            bail!(
                ErrorKind::InjectedFailure,
                "Injected failure while updating the record"
            );
        }

        let outcome = match self.store.compare_and_swap(previous.version, content) {
            Some(version) => UpdateOutcome::Committed { previous, version },
            None => UpdateOutcome::Conflict { read: previous },
        };

        Ok(outcome)
    }
}
