//! Per-identity decide subscription registry.

use crate::channel::{DeliveryChannel, DeliveryOutcome};
use crate::config::PipelineConfig;
use crate::decide::types::{DecideItem, DecideItemKind, DecideListener, DecideResponse};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// One live subscription: an identity listening for decide content
/// under a token.
struct SubscriptionState {
    token: String,
    distinct_id: String,
    listener: Weak<dyn DecideListener>,
    /// Items fetched but not yet consumed by the host, FIFO.
    unseen: VecDeque<DecideItem>,
    /// Every id ever reported, per kind; the dedup set.
    seen: HashSet<(DecideItemKind, u64)>,
}

/// Subscription registry and poll driver.
///
/// `run_checks` is called from the worker thread; everything else may
/// be called from any host thread. The registry lock is never held
/// across a network request or a listener callback.
pub struct DecideManager {
    config: Arc<PipelineConfig>,
    subscriptions: Mutex<Vec<SubscriptionState>>,
}

impl DecideManager {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self {
            config,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Start listening for decide content. One subscription per token:
    /// subscribing the same token under a new identity supersedes the
    /// old subscription and resets its unseen state.
    pub fn add_subscription(
        &self,
        token: &str,
        distinct_id: &str,
        listener: &Arc<dyn DecideListener>,
    ) {
        let mut subs = self.subscriptions.lock();
        if let Some(existing) = subs.iter_mut().find(|s| s.token == token) {
            if existing.distinct_id == distinct_id {
                existing.listener = Arc::downgrade(listener);
                return;
            }
            debug!(token, old = %existing.distinct_id, new = %distinct_id,
                   "decide subscription superseded by identity change");
            subs.retain(|s| s.token != token);
        }
        subs.push(SubscriptionState {
            token: token.to_string(),
            distinct_id: distinct_id.to_string(),
            listener: Arc::downgrade(listener),
            unseen: VecDeque::new(),
            seen: HashSet::new(),
        });
    }

    /// Explicitly destroy a subscription.
    pub fn remove_subscription(&self, token: &str) {
        self.subscriptions.lock().retain(|s| s.token != token);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Poll every live subscription, pruning the ones whose listener
    /// has been dropped. One combined read-only request per
    /// subscription; failures skip that subscription until the next
    /// check.
    pub fn run_checks(&self, channel: &dyn DeliveryChannel) {
        let targets: Vec<(String, String)> = {
            let mut subs = self.subscriptions.lock();
            subs.retain(|s| {
                let alive = s.listener.upgrade().is_some();
                if !alive {
                    debug!(token = %s.token, "pruning destroyed decide subscription");
                }
                alive
            });
            subs.iter()
                .map(|s| (s.token.clone(), s.distinct_id.clone()))
                .collect()
        };

        for (token, distinct_id) in targets {
            let url = match self.poll_url(&self.config.decide_endpoint, &token, &distinct_id) {
                Ok(url) => url,
                Err(e) => {
                    warn!(error = %e, "bad decide endpoint");
                    return;
                }
            };
            let fallback = self
                .config
                .decide_fallback()
                .and_then(|f| self.poll_url(f, &token, &distinct_id).ok());

            match channel.get(&url, fallback.as_deref()) {
                DeliveryOutcome::Succeeded(body) => match DecideResponse::parse(&body) {
                    Ok(response) => self.report_results(&token, response.into_items()),
                    Err(e) => warn!(token, error = %e, "decide response unparseable"),
                },
                DeliveryOutcome::FailedRecoverable => {
                    debug!(token, "decide check skipped, network unavailable");
                }
                DeliveryOutcome::FailedUnrecoverable => {
                    warn!(token, "decide check rejected by service");
                }
            }
        }
    }

    /// Merge fetched items into a subscription. Incoming items are
    /// deduplicated against everything already seen; only genuinely new
    /// ones join the unseen FIFO. Fires exactly one "new results"
    /// callback per call when anything new arrived and at least one
    /// item remains unseen.
    pub fn report_results(&self, token: &str, items: Vec<DecideItem>) {
        let notify = {
            let mut subs = self.subscriptions.lock();
            let Some(sub) = subs.iter_mut().find(|s| s.token == token) else {
                return;
            };

            let mut new_count = 0usize;
            for item in items {
                if sub.seen.insert(item.dedup_key()) {
                    sub.unseen.push_back(item);
                    new_count += 1;
                }
            }

            if new_count > 0 && !sub.unseen.is_empty() {
                sub.listener
                    .upgrade()
                    .map(|listener| (listener, sub.distinct_id.clone()))
            } else {
                None
            }
        };

        // Callback outside the lock: the host may immediately pop.
        if let Some((listener, distinct_id)) = notify {
            listener.on_new_results(&distinct_id);
        }
    }

    /// Remove and return the oldest unseen item.
    pub fn pop_unseen(&self, token: &str) -> Option<DecideItem> {
        let mut subs = self.subscriptions.lock();
        subs.iter_mut()
            .find(|s| s.token == token)
            .and_then(|s| s.unseen.pop_front())
    }

    /// Return a copy of the oldest unseen item, rotating it to the
    /// tail so repeated peeks cycle through the queue.
    pub fn peek_unseen(&self, token: &str) -> Option<DecideItem> {
        let mut subs = self.subscriptions.lock();
        let sub = subs.iter_mut().find(|s| s.token == token)?;
        let item = sub.unseen.pop_front()?;
        sub.unseen.push_back(item.clone());
        Some(item)
    }

    /// Remove and return a specific unseen item out of FIFO order.
    pub fn take_item(&self, token: &str, kind: DecideItemKind, id: u64) -> Option<DecideItem> {
        let mut subs = self.subscriptions.lock();
        let sub = subs.iter_mut().find(|s| s.token == token)?;
        let position = sub
            .unseen
            .iter()
            .position(|i| i.kind() == kind && i.id() == id)?;
        sub.unseen.remove(position)
    }

    /// Return a copy of a specific unseen item, leaving it in place.
    pub fn peek_item(&self, token: &str, kind: DecideItemKind, id: u64) -> Option<DecideItem> {
        let subs = self.subscriptions.lock();
        let sub = subs.iter().find(|s| s.token == token)?;
        sub.unseen
            .iter()
            .find(|i| i.kind() == kind && i.id() == id)
            .cloned()
    }

    /// Number of unseen items for a token.
    pub fn unseen_count(&self, token: &str) -> usize {
        let subs = self.subscriptions.lock();
        subs.iter()
            .find(|s| s.token == token)
            .map_or(0, |s| s.unseen.len())
    }

    fn poll_url(&self, endpoint: &str, token: &str, distinct_id: &str) -> crate::error::Result<String> {
        let mut url = url::Url::parse(endpoint)
            .map_err(|e| crate::error::QueueError::InvalidFormat(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("version", "1")
            .append_pair("lib", "rust")
            .append_pair("token", token)
            .append_pair("distinct_id", distinct_id);
        Ok(url.into())
    }
}
