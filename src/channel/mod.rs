//! Network delivery.

mod http;

pub use http::{ConnectivityProbe, HttpChannel};

/// Outcome of one delivery or polling attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The service acknowledged the request; carries the response body.
    Succeeded(Vec<u8>),

    /// Transport-level failure (unreachable, reset, non-2xx status).
    /// The records stay queued and are retried until expiry removes
    /// them.
    FailedRecoverable,

    /// The service answered but rejected the request at the
    /// application level. Retrying the same payload will not help.
    FailedUnrecoverable,
}

/// A transport for batched submission and read-only polling.
///
/// Implementations must check connectivity before attempting anything:
/// when offline, return `FailedRecoverable` immediately without
/// counting it as a network attempt.
pub trait DeliveryChannel: Send {
    /// Submit a batch payload, trying the fallback endpoint once if the
    /// primary attempt fails recoverably.
    fn deliver(&self, payload: &[u8], endpoint: &str, fallback: Option<&str>) -> DeliveryOutcome;

    /// Read-only fetch with the same fallback policy, used for decide
    /// polling.
    fn get(&self, url: &str, fallback: Option<&str>) -> DeliveryOutcome;

    /// Whether the network looks reachable at all.
    fn is_online(&self) -> bool {
        true
    }
}
