//! Durable record storage.

mod log;
mod queue;

pub use log::ClassLog;
pub use queue::{RecordStore, StoreStats};
