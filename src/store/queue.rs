//! Durable record store: admission control, per-class logs, wipe-based
//! fault recovery.

use crate::config::PipelineConfig;
use crate::error::{QueueError, Result};
use crate::store::log::ClassLog;
use crate::types::{InsertOutcome, ReadBatch, RecordClass, RecordId, Timestamp};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Per-class logs, guarded as one unit so a wipe can replace both.
struct Logs {
    events: ClassLog,
    profile_updates: ClassLog,
}

impl Logs {
    fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            events: ClassLog::open(dir, RecordClass::Event)?,
            profile_updates: ClassLog::open(dir, RecordClass::ProfileUpdate)?,
        })
    }

    fn log_mut(&mut self, class: RecordClass) -> &mut ClassLog {
        match class {
            RecordClass::Event => &mut self.events,
            RecordClass::ProfileUpdate => &mut self.profile_updates,
        }
    }

    fn total_size_bytes(&self) -> u64 {
        self.events.size_bytes() + self.profile_updates.size_bytes()
    }
}

/// Store statistics for diagnostics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub event_count: u64,
    pub profile_update_count: u64,
    pub total_size_bytes: u64,
}

/// The persistent store for one application instance.
///
/// Owned and mutated exclusively by the worker thread; the lock file
/// keeps a second process from opening the same queue directory.
///
/// Failure semantics: an I/O fault on any mutating call is treated as
/// corruption — the store wipes and recreates itself rather than
/// attempting repair, bounding disk growth from a broken log. Read
/// faults are tolerated by returning "no data" and leaving rows
/// untouched.
pub struct RecordStore {
    dir: PathBuf,
    minimum_free_space_bytes: u64,
    maximum_store_size_bytes: u64,
    _lock_file: File,
    inner: Mutex<Logs>,
}

impl RecordStore {
    /// Open or create the store under the configured directory.
    pub fn open(config: &PipelineConfig) -> Result<Self> {
        let dir = config.storage_path.clone();
        fs::create_dir_all(&dir)?;

        let lock_file = Self::acquire_lock(&dir)?;

        let logs = match Logs::open(&dir) {
            Ok(logs) => logs,
            Err(e) => {
                // Unscannable logs at open get the same treatment as a
                // mutating fault: start over.
                warn!(error = %e, "record store unreadable at open, recreating");
                Self::remove_log_files(&dir)?;
                Logs::open(&dir)?
            }
        };

        Ok(Self {
            dir,
            minimum_free_space_bytes: config.minimum_free_space_bytes,
            maximum_store_size_bytes: config.maximum_store_size_bytes,
            _lock_file: lock_file,
            inner: Mutex::new(logs),
        })
    }

    /// Admission-controlled insert.
    ///
    /// The admission check precedes the write: once usable free space
    /// is below the configured floor (or the store is at its maximum
    /// footprint), the record is denied and the existing queue left
    /// untouched. A write fault wipes the store and surfaces as `Err`;
    /// the in-flight record is lost.
    pub fn insert(
        &self,
        class: RecordClass,
        payload: &[u8],
        owner: &str,
        is_automatic: bool,
        created_at: Timestamp,
    ) -> Result<InsertOutcome> {
        let mut logs = self.inner.lock();

        if !self.admit(&logs) {
            debug!(class = %class, owner, "insert denied by admission control");
            return Ok(InsertOutcome::AdmissionDenied);
        }

        match logs.log_mut(class).append(payload, owner, is_automatic, created_at) {
            Ok((_, owner_count)) => Ok(InsertOutcome::Stored { owner_count }),
            Err(e) => Err(self.wipe_after_fault(&mut logs, e)),
        }
    }

    /// Oldest-first bounded read. Read faults are absorbed: the batch
    /// is reported as absent and the rows stay put for a later attempt.
    pub fn read_batch(
        &self,
        class: RecordClass,
        owner: &str,
        limit: u64,
        include_automatic: bool,
    ) -> Option<ReadBatch> {
        let mut logs = self.inner.lock();
        match logs.log_mut(class).read_batch(owner, limit, include_automatic) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(class = %class, error = %e, "read failed, treating as no data");
                None
            }
        }
    }

    /// Delete same-owner records with id ≤ cutoff.
    pub fn delete_up_to(
        &self,
        class: RecordClass,
        cutoff: RecordId,
        owner: &str,
        include_automatic: bool,
    ) -> Result<u64> {
        let mut logs = self.inner.lock();
        match logs.log_mut(class).delete_up_to(cutoff, owner, include_automatic) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.wipe_after_fault(&mut logs, e)),
        }
    }

    /// Global, owner-independent expiry sweep.
    pub fn delete_older_than(&self, class: RecordClass, timestamp: Timestamp) -> Result<u64> {
        let mut logs = self.inner.lock();
        match logs.log_mut(class).delete_older_than(timestamp) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.wipe_after_fault(&mut logs, e)),
        }
    }

    /// Delete every record belonging to an owner, in both classes.
    pub fn delete_all_for_owner(&self, owner: &str) -> Result<u64> {
        let mut logs = self.inner.lock();
        let mut removed = 0;
        for class in RecordClass::ALL {
            match logs.log_mut(class).delete_all_for_owner(owner) {
                Ok(n) => removed += n,
                Err(e) => return Err(self.wipe_after_fault(&mut logs, e)),
            }
        }
        Ok(removed)
    }

    /// Delete an owner's automatically-produced records, in both classes.
    pub fn delete_automatic_for_owner(&self, owner: &str) -> Result<u64> {
        let mut logs = self.inner.lock();
        let mut removed = 0;
        for class in RecordClass::ALL {
            match logs.log_mut(class).delete_automatic_for_owner(owner) {
                Ok(n) => removed += n,
                Err(e) => return Err(self.wipe_after_fault(&mut logs, e)),
            }
        }
        Ok(removed)
    }

    /// Distinct owners with queued records in a class.
    pub fn owners(&self, class: RecordClass) -> Vec<String> {
        let mut logs = self.inner.lock();
        logs.log_mut(class).owners()
    }

    /// Number of records an owner has queued in a class.
    pub fn count_for_owner(&self, class: RecordClass, owner: &str) -> u64 {
        let mut logs = self.inner.lock();
        logs.log_mut(class).count_for_owner(owner)
    }

    /// Hard reset: delete and recreate both logs.
    pub fn wipe(&self) -> Result<()> {
        let mut logs = self.inner.lock();
        self.recreate(&mut logs)
    }

    /// Store statistics.
    pub fn stats(&self) -> StoreStats {
        let logs = self.inner.lock();
        StoreStats {
            event_count: logs.events.len(),
            profile_update_count: logs.profile_updates.len(),
            total_size_bytes: logs.total_size_bytes(),
        }
    }

    /// Bytes occupied on disk by both logs.
    pub fn total_size_bytes(&self) -> u64 {
        self.inner.lock().total_size_bytes()
    }

    /// Admission check against live free space and the store's own
    /// footprint. When free space cannot be measured the write is
    /// attempted anyway.
    fn admit(&self, logs: &Logs) -> bool {
        if logs.total_size_bytes() >= self.maximum_store_size_bytes {
            return false;
        }
        match fs2::available_space(&self.dir) {
            Ok(free) => free >= self.minimum_free_space_bytes,
            Err(e) => {
                warn!(error = %e, "could not measure free space, admitting write");
                true
            }
        }
    }

    /// Wipe and recreate after a mutating fault, then report it.
    fn wipe_after_fault(&self, logs: &mut Logs, cause: QueueError) -> QueueError {
        error!(error = %cause, "mutating store call failed, wiping store");
        if let Err(e) = self.recreate(logs) {
            error!(error = %e, "store recreate failed");
        }
        QueueError::Corruption(cause.to_string())
    }

    fn recreate(&self, logs: &mut Logs) -> Result<()> {
        Self::remove_log_files(&self.dir)?;
        *logs = Logs::open(&self.dir)?;
        Ok(())
    }

    fn remove_log_files(dir: &Path) -> Result<()> {
        for class in RecordClass::ALL {
            let path = dir.join(format!("{}.log", class.table_name()));
            if path.exists() {
                fs::remove_file(&path)?;
            }
            let compact = dir.join(format!("{}.log.compact", class.table_name()));
            if compact.exists() {
                fs::remove_file(&compact)?;
            }
        }
        Ok(())
    }

    fn acquire_lock(dir: &Path) -> Result<File> {
        let lock_path = dir.join("LOCK");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(lock_path)?;
        file.try_lock_exclusive().map_err(|_| QueueError::Locked)?;
        Ok(file)
    }
}
