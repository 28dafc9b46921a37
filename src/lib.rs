//! # Beacon
//!
//! An embedded telemetry client: records behavioral events and profile
//! updates, buffers them durably on local storage, and transmits them
//! to a collection service without ever blocking the host's threads.
//!
//! ## Core Concepts
//!
//! - **Store**: an admission-controlled, append-only queue with
//!   oldest-first bounded reads and cutoff deletion
//! - **Channel**: primary/fallback HTTP delivery classifying outcomes
//!   as succeeded, recoverable, or unrecoverable
//! - **Worker**: one thread owning all queue mutation, batching and
//!   flushing on count thresholds or timers
//! - **Decide**: a per-identity poller merging server-driven content
//!   idempotently into listener-visible state
//!
//! ## Example
//!
//! ```ignore
//! use beacon::{PipelineConfig, TelemetryClient};
//! use serde_json::{json, Map};
//!
//! let client = TelemetryClient::new(
//!     PipelineConfig::default(),
//!     "my-project-token",
//!     identity_provider,
//! )?;
//!
//! let mut props = Map::new();
//! props.insert("plan".into(), json!("pro"));
//! client.track("signup", props);
//!
//! client.flush();
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod decide;
pub mod error;
pub mod store;
pub mod types;
pub mod worker;

// Re-exports
pub use channel::{DeliveryChannel, DeliveryOutcome, HttpChannel};
pub use client::{IdentityProvider, TelemetryClient};
pub use config::{PipelineConfig, VerboseFlag};
pub use decide::{DecideItem, DecideItemKind, DecideListener, DecideManager};
pub use error::{QueueError, Result};
pub use store::{RecordStore, StoreStats};
pub use types::*;
pub use worker::{Message, QueueWorker, WorkerCore};
