//! The serialization worker: single-writer queue mutation and flush
//! orchestration.

mod core;
mod message;
mod thread;

pub use self::core::{Flow, WorkerCore};
pub use message::Message;
pub use thread::QueueWorker;
