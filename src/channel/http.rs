//! HTTP delivery channel.

use crate::channel::{DeliveryChannel, DeliveryOutcome};
use crate::config::{PipelineConfig, VerboseFlag};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::time::Duration;
use tracing::{debug, warn};

/// Host-supplied connectivity probe. The default channel assumes the
/// network is reachable.
pub type ConnectivityProbe = Box<dyn Fn() -> bool + Send + Sync>;

/// Blocking HTTP transport.
///
/// Payloads are base64-encoded into a `data=` form field; a response is
/// a success only on an explicit positive acknowledgement (`1`).
/// Low-level transport resets are retried a small fixed number of
/// times before the attempt is classified recoverable.
pub struct HttpChannel {
    agent: ureq::Agent,
    transport_retries: u32,
    probe: Option<ConnectivityProbe>,
    verbose: VerboseFlag,
}

impl HttpChannel {
    pub fn new(config: &PipelineConfig, verbose: VerboseFlag) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
            .timeout_read(Duration::from_millis(config.read_timeout_ms))
            .build();
        Self {
            agent,
            transport_retries: config.transport_retries,
            probe: None,
            verbose,
        }
    }

    /// Attach a connectivity probe consulted before every attempt.
    pub fn with_probe(mut self, probe: ConnectivityProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// One endpoint, transport retries included.
    fn post_once(&self, endpoint: &str, encoded: &str) -> DeliveryOutcome {
        for attempt in 0..=self.transport_retries {
            match self.agent.post(endpoint).send_form(&[("data", encoded)]) {
                Ok(response) => return self.classify_ack(response),
                Err(ureq::Error::Status(code, _)) => {
                    warn!(endpoint, code, "delivery rejected with http status");
                    return DeliveryOutcome::FailedRecoverable;
                }
                Err(ureq::Error::Transport(t)) => {
                    warn!(endpoint, attempt, error = %t, "transport error during delivery");
                }
            }
        }
        DeliveryOutcome::FailedRecoverable
    }

    fn get_once(&self, url: &str) -> DeliveryOutcome {
        for attempt in 0..=self.transport_retries {
            match self.agent.get(url).call() {
                Ok(response) => {
                    return match response.into_string() {
                        Ok(body) => DeliveryOutcome::Succeeded(body.into_bytes()),
                        Err(e) => {
                            warn!(url, error = %e, "response body unreadable");
                            DeliveryOutcome::FailedRecoverable
                        }
                    }
                }
                Err(ureq::Error::Status(code, _)) => {
                    warn!(url, code, "poll rejected with http status");
                    return DeliveryOutcome::FailedRecoverable;
                }
                Err(ureq::Error::Transport(t)) => {
                    warn!(url, attempt, error = %t, "transport error during poll");
                }
            }
        }
        DeliveryOutcome::FailedRecoverable
    }

    /// A 2xx response is only a success when the body carries the
    /// service's positive acknowledgement; anything else is an
    /// application-level rejection.
    fn classify_ack(&self, response: ureq::Response) -> DeliveryOutcome {
        let body = match response.into_string() {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "acknowledgement body unreadable");
                return DeliveryOutcome::FailedRecoverable;
            }
        };
        if is_positive_ack(&body) {
            DeliveryOutcome::Succeeded(body.into_bytes())
        } else {
            if self.verbose.enabled() {
                debug!(body = %body.trim(), "delivery not acknowledged");
            }
            DeliveryOutcome::FailedUnrecoverable
        }
    }
}

impl DeliveryChannel for HttpChannel {
    fn deliver(&self, payload: &[u8], endpoint: &str, fallback: Option<&str>) -> DeliveryOutcome {
        if !self.is_online() {
            debug!("offline, skipping delivery attempt");
            return DeliveryOutcome::FailedRecoverable;
        }

        let encoded = BASE64.encode(payload);
        match self.post_once(endpoint, &encoded) {
            DeliveryOutcome::FailedRecoverable => match fallback {
                Some(fallback) => {
                    debug!(fallback, "retrying delivery against fallback endpoint");
                    self.post_once(fallback, &encoded)
                }
                None => DeliveryOutcome::FailedRecoverable,
            },
            outcome => outcome,
        }
    }

    fn get(&self, url: &str, fallback: Option<&str>) -> DeliveryOutcome {
        if !self.is_online() {
            debug!("offline, skipping poll attempt");
            return DeliveryOutcome::FailedRecoverable;
        }

        match self.get_once(url) {
            DeliveryOutcome::FailedRecoverable => match fallback {
                Some(fallback) => self.get_once(fallback),
                None => DeliveryOutcome::FailedRecoverable,
            },
            outcome => outcome,
        }
    }

    fn is_online(&self) -> bool {
        self.probe.as_ref().map_or(true, |p| p())
    }
}

/// Explicit positive acknowledgement: a bare `1` or a JSON document
/// with `"status": 1`.
fn is_positive_ack(body: &str) -> bool {
    let trimmed = body.trim();
    if trimmed == "1" {
        return true;
    }
    serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|v| v.get("status").and_then(|s| s.as_i64()))
        .map_or(false, |status| status == 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_ack_forms() {
        assert!(is_positive_ack("1"));
        assert!(is_positive_ack("1\n"));
        assert!(is_positive_ack("{\"status\": 1}"));
    }

    #[test]
    fn test_negative_ack_forms() {
        assert!(!is_positive_ack("0"));
        assert!(!is_positive_ack("{\"status\": 0, \"error\": \"bad token\"}"));
        assert!(!is_positive_ack(""));
        assert!(!is_positive_ack("ok"));
    }

    #[test]
    fn test_offline_probe_short_circuits() {
        let config = PipelineConfig::default();
        let channel = HttpChannel::new(&config, VerboseFlag::new(false))
            .with_probe(Box::new(|| false));

        // No request is attempted; the outcome is immediate.
        let outcome = channel.deliver(b"[]", "http://127.0.0.1:1/track", None);
        assert_eq!(outcome, DeliveryOutcome::FailedRecoverable);
        assert_eq!(
            channel.get("http://127.0.0.1:1/decide", None),
            DeliveryOutcome::FailedRecoverable
        );
    }
}
