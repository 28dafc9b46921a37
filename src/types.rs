//! Core types for the delivery pipeline.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a queued record.
///
/// Assigned at insert time, monotonically increasing within one record
/// class. Batch deletion after a successful delivery uses the largest
/// id of the batch as its cutoff.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(pub u64);

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_millis() as i64)
    }

    pub fn saturating_add_ms(self, ms: i64) -> Self {
        Timestamp(self.0.saturating_add(ms))
    }

    /// Milliseconds from `self` until `later` (zero if `later` is not later).
    pub fn millis_until(self, later: Timestamp) -> i64 {
        (later.0 - self.0).max(0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// The two record classes the pipeline queues and delivers.
///
/// Each class has its own on-disk table and its own delivery endpoints;
/// flushes drain classes independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordClass {
    Event,
    ProfileUpdate,
}

impl RecordClass {
    /// All classes in flush order.
    pub const ALL: [RecordClass; 2] = [RecordClass::Event, RecordClass::ProfileUpdate];

    /// On-disk table (log file) name.
    pub fn table_name(self) -> &'static str {
        match self {
            RecordClass::Event => "events",
            RecordClass::ProfileUpdate => "profile_updates",
        }
    }
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// A record awaiting delivery.
///
/// The payload is opaque serialized bytes, immutable once stored.
#[derive(Clone, Debug)]
pub struct QueuedRecord {
    /// Unique identifier (assigned by the store).
    pub id: RecordId,

    /// Which class this record belongs to.
    pub class: RecordClass,

    /// When the record was inserted.
    pub created_at: Timestamp,

    /// Whether the record was produced automatically rather than by an
    /// explicit host call.
    pub is_automatic: bool,

    /// Token of the project that owns this record.
    pub owner: String,

    /// Serialized payload.
    pub payload: Vec<u8>,
}

/// Result of a bounded oldest-first read.
#[derive(Clone, Debug)]
pub struct ReadBatch {
    /// Records in non-decreasing id order.
    pub records: Vec<QueuedRecord>,

    /// Total number of records the owner has queued in this class,
    /// including the ones returned.
    pub owner_total: u64,

    /// Largest id returned; passed to `delete_up_to` after a successful
    /// delivery.
    pub cutoff: RecordId,
}

/// Outcome of an admission-controlled insert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record was written; carries the owner's resulting count in
    /// the record's class.
    Stored { owner_count: u64 },

    /// Usable storage is below the configured floor (or the store is at
    /// its maximum footprint). The record was dropped and the existing
    /// queue left untouched.
    AdmissionDenied,
}

/// Time source for the worker's scheduling decisions.
///
/// The production impl reads the system clock; tests substitute a
/// manual clock to drive timer-based flushes deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// System clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}
