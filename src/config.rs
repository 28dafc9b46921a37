//! Pipeline configuration.
//!
//! One `PipelineConfig` is constructed by the host and passed down to
//! every component; there are no process-global registries.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Pipeline configuration.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Directory holding the durable queue.
    pub storage_path: PathBuf,

    /// Queue depth at which an insert triggers an immediate flush.
    pub bulk_upload_limit: u64,

    /// Maximum records read per delivery attempt.
    pub flush_batch_size: u64,

    /// Delay between an insert and the automatic flush it schedules,
    /// in milliseconds. Negative disables auto-flush entirely; the host
    /// must call `flush()` explicitly.
    pub flush_interval_ms: i64,

    /// Records older than this are swept from the store before each
    /// flush cycle, in milliseconds.
    pub data_expiration_ms: i64,

    /// Inserts are denied once usable free space on the storage volume
    /// falls below this floor, in bytes.
    pub minimum_free_space_bytes: u64,

    /// Inserts are denied once the store's own footprint exceeds this
    /// ceiling, in bytes.
    pub maximum_store_size_bytes: u64,

    /// Delivery endpoint for event records.
    pub events_endpoint: String,

    /// Fallback endpoint for event records.
    pub events_fallback_endpoint: Option<String>,

    /// Delivery endpoint for profile updates.
    pub people_endpoint: String,

    /// Fallback endpoint for profile updates.
    pub people_fallback_endpoint: Option<String>,

    /// Decide-check polling endpoint.
    pub decide_endpoint: String,

    /// Fallback endpoint for decide checks.
    pub decide_fallback_endpoint: Option<String>,

    /// When set, fallback endpoints are never used.
    pub disable_fallback: bool,

    /// HTTP connect timeout, in milliseconds.
    pub connect_timeout_ms: u64,

    /// HTTP read timeout, in milliseconds.
    pub read_timeout_ms: u64,

    /// How many times a low-level transport reset is retried against
    /// the same endpoint before the attempt is classified recoverable.
    pub transport_retries: u32,

    /// When a delivery is rejected at the application level, retry the
    /// same batch exactly once before dropping it. Off by default: an
    /// app-level rejection usually means the payload itself is bad.
    pub retry_ambiguous_rejection: bool,

    /// Whether automatically-produced records participate in flushes
    /// and cutoff deletion.
    pub include_automatic_events: bool,

    /// Initial state of the verbose-logging flag.
    pub verbose: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./beacon-queue"),
            bulk_upload_limit: 40,
            flush_batch_size: 50,
            flush_interval_ms: 60_000,
            data_expiration_ms: 5 * 24 * 60 * 60 * 1000,
            minimum_free_space_bytes: 4 * 1024 * 1024,
            maximum_store_size_bytes: 32 * 1024 * 1024,
            events_endpoint: "https://api.example.com/track".into(),
            events_fallback_endpoint: None,
            people_endpoint: "https://api.example.com/engage".into(),
            people_fallback_endpoint: None,
            decide_endpoint: "https://decide.example.com/decide".into(),
            decide_fallback_endpoint: None,
            disable_fallback: false,
            connect_timeout_ms: 2_000,
            read_timeout_ms: 10_000,
            transport_retries: 2,
            retry_ambiguous_rejection: false,
            include_automatic_events: true,
            verbose: false,
        }
    }
}

impl PipelineConfig {
    /// Primary endpoint for a record class.
    pub fn endpoint_for(&self, class: crate::types::RecordClass) -> &str {
        match class {
            crate::types::RecordClass::Event => &self.events_endpoint,
            crate::types::RecordClass::ProfileUpdate => &self.people_endpoint,
        }
    }

    /// Fallback endpoint for a record class, honoring `disable_fallback`.
    pub fn fallback_for(&self, class: crate::types::RecordClass) -> Option<&str> {
        if self.disable_fallback {
            return None;
        }
        match class {
            crate::types::RecordClass::Event => self.events_fallback_endpoint.as_deref(),
            crate::types::RecordClass::ProfileUpdate => self.people_fallback_endpoint.as_deref(),
        }
    }

    /// Decide fallback endpoint, honoring `disable_fallback`.
    pub fn decide_fallback(&self) -> Option<&str> {
        if self.disable_fallback {
            None
        } else {
            self.decide_fallback_endpoint.as_deref()
        }
    }
}

/// Shared verbose-logging flag.
///
/// The only cross-thread mutable state besides the worker mailbox;
/// gates the chattier `debug!` output at runtime.
#[derive(Clone, Debug)]
pub struct VerboseFlag(Arc<AtomicBool>);

impl VerboseFlag {
    pub fn new(initial: bool) -> Self {
        VerboseFlag(Arc::new(AtomicBool::new(initial)))
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
