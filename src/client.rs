//! Client facade tying the pipeline together.
//!
//! One `TelemetryClient` per application: the host constructs it once
//! and passes it down, preserving "one queue per application" without
//! hidden globals. Every ingestion call is fire-and-forget — it
//! enriches the payload on the calling thread, submits a message, and
//! returns; no caller-thread operation blocks on storage or network.

use crate::channel::{DeliveryChannel, HttpChannel};
use crate::config::{PipelineConfig, VerboseFlag};
use crate::decide::{DecideItem, DecideItemKind, DecideListener, DecideManager};
use crate::error::Result;
use crate::store::RecordStore;
use crate::types::{Clock, SystemClock, Timestamp};
use crate::worker::{Message, QueueWorker, WorkerCore};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::warn;

/// Host-supplied identity state: the current distinct id and any
/// profile updates recorded before the identity was known.
pub trait IdentityProvider: Send + Sync {
    fn distinct_id(&self) -> String;

    /// Drain profile updates held back until an identity exists; used
    /// by the push-on-identify hook.
    fn pending_profile_updates(&self) -> Vec<Value>;
}

/// The embedded telemetry client.
pub struct TelemetryClient {
    token: String,
    identity: Arc<dyn IdentityProvider>,
    decide: Arc<DecideManager>,
    worker: QueueWorker,
    verbose: VerboseFlag,
    clock: Arc<dyn Clock>,
}

impl TelemetryClient {
    /// Construct the pipeline with the default HTTP channel.
    pub fn new(
        config: PipelineConfig,
        token: impl Into<String>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        let verbose = VerboseFlag::new(config.verbose);
        let channel = Box::new(HttpChannel::new(&config, verbose.clone()));
        Self::assemble(config, token.into(), identity, channel, verbose)
    }

    /// Construct the pipeline around a custom transport.
    pub fn with_channel(
        config: PipelineConfig,
        token: impl Into<String>,
        identity: Arc<dyn IdentityProvider>,
        channel: Box<dyn DeliveryChannel>,
    ) -> Result<Self> {
        let verbose = VerboseFlag::new(config.verbose);
        Self::assemble(config, token.into(), identity, channel, verbose)
    }

    fn assemble(
        config: PipelineConfig,
        token: String,
        identity: Arc<dyn IdentityProvider>,
        channel: Box<dyn DeliveryChannel>,
        verbose: VerboseFlag,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let store = RecordStore::open(&config)?;
        let decide = Arc::new(DecideManager::new(Arc::clone(&config)));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let core = WorkerCore::new(
            store,
            channel,
            Arc::clone(&decide),
            config,
            Arc::clone(&clock),
            verbose.clone(),
        );
        let worker = QueueWorker::spawn(core)?;

        Ok(Self {
            token,
            identity,
            decide,
            worker,
            verbose,
            clock,
        })
    }

    // --- Ingestion ---

    /// Record a behavioral event.
    pub fn track(&self, event: &str, properties: Map<String, Value>) {
        self.submit_event(event, properties, false);
    }

    /// Record an automatically-produced event.
    pub fn track_automatic(&self, event: &str, properties: Map<String, Value>) {
        self.submit_event(event, properties, true);
    }

    fn submit_event(&self, event: &str, properties: Map<String, Value>, is_automatic: bool) {
        let payload = enrich_event(
            &self.token,
            &self.identity.distinct_id(),
            event,
            properties,
            self.clock.now(),
        );
        self.worker.post(Message::EnqueueEvent {
            owner: self.token.clone(),
            payload,
            is_automatic,
        });
    }

    /// Record a profile update.
    pub fn engage(&self, update: Map<String, Value>) {
        let payload = enrich_profile_update(
            &self.token,
            &self.identity.distinct_id(),
            update,
            self.clock.now(),
        );
        self.worker.post(Message::EnqueuePeopleUpdate {
            owner: self.token.clone(),
            payload,
        });
    }

    /// Push-on-identify hook: queue any profile updates the host held
    /// back until a distinct id existed, then schedule a decide check
    /// for the new identity.
    pub fn identify(&self) {
        for update in self.identity.pending_profile_updates() {
            match update {
                Value::Object(update) => self.engage(update),
                other => {
                    warn!(?other, "pending profile update is not an object, skipped");
                }
            }
        }
        self.check_decide();
    }

    // --- Triggers ---

    /// Ask the worker to flush both queues now.
    pub fn flush(&self) {
        self.worker.post(Message::FlushNow);
    }

    /// Ask the worker to flush, then poll for decide content.
    pub fn check_decide(&self) {
        self.worker.post(Message::CheckRemoteDecide);
    }

    /// Hard kill: wipe the store, stop the worker, and wait for it.
    pub fn hard_kill(&mut self) {
        self.worker.shutdown_and_join();
    }

    /// Whether the worker hit a fatal fault and dropped out.
    pub fn is_dead(&self) -> bool {
        self.worker.is_dead()
    }

    /// Toggle verbose diagnostics at runtime.
    pub fn set_verbose(&self, enabled: bool) {
        self.verbose.set(enabled);
    }

    // --- Decide ---

    /// Listen for decide content under this client's token and the
    /// current identity.
    pub fn subscribe_decide(&self, listener: &Arc<dyn DecideListener>) {
        self.decide
            .add_subscription(&self.token, &self.identity.distinct_id(), listener);
    }

    pub fn unsubscribe_decide(&self) {
        self.decide.remove_subscription(&self.token);
    }

    /// Remove and return the oldest unseen decide item.
    pub fn pop_decide_item(&self) -> Option<DecideItem> {
        self.decide.pop_unseen(&self.token)
    }

    /// Peek the oldest unseen decide item, rotating it to the tail.
    pub fn peek_decide_item(&self) -> Option<DecideItem> {
        self.decide.peek_unseen(&self.token)
    }

    /// Remove a specific unseen item out of FIFO order.
    pub fn take_decide_item(&self, kind: DecideItemKind, id: u64) -> Option<DecideItem> {
        self.decide.take_item(&self.token, kind, id)
    }

    /// Direct access to the subscription registry.
    pub fn decide_manager(&self) -> &Arc<DecideManager> {
        &self.decide
    }
}

/// Build the wire form of an event record.
fn enrich_event(
    token: &str,
    distinct_id: &str,
    event: &str,
    mut properties: Map<String, Value>,
    now: Timestamp,
) -> Vec<u8> {
    properties.insert("token".into(), json!(token));
    properties.insert("distinct_id".into(), json!(distinct_id));
    properties.insert("time".into(), json!(now.0));
    let record = json!({
        "event": event,
        "properties": Value::Object(properties),
    });
    record.to_string().into_bytes()
}

/// Build the wire form of a profile update.
fn enrich_profile_update(
    token: &str,
    distinct_id: &str,
    mut update: Map<String, Value>,
    now: Timestamp,
) -> Vec<u8> {
    update.insert("$token".into(), json!(token));
    update.insert("$distinct_id".into(), json!(distinct_id));
    update.insert("$time".into(), json!(now.0));
    Value::Object(update).to_string().into_bytes()
}
