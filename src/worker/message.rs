//! Worker mailbox messages.

/// Messages processed by the serialization worker, strictly in arrival
/// order. Producers on any thread only ever enqueue one of these; all
/// queue mutation happens on the worker thread.
#[derive(Clone, Debug)]
pub enum Message {
    /// Persist an enriched event record.
    EnqueueEvent {
        owner: String,
        payload: Vec<u8>,
        is_automatic: bool,
    },

    /// Persist an enriched profile update.
    EnqueuePeopleUpdate { owner: String, payload: Vec<u8> },

    /// Run a flush cycle now.
    FlushNow,

    /// Run a flush cycle, then poll for remote decide content.
    CheckRemoteDecide,

    /// Hard kill: wipe the store and terminate the worker thread.
    Shutdown,
}
