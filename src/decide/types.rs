//! Decide-check content types.

use crate::error::{QueueError, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

/// The two kinds of server-driven content a decide check can return.
/// Ids are only unique within a kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DecideItemKind {
    Survey,
    Notification,
}

/// A survey-like item. Everything beyond the id is presentation
/// content the pipeline carries opaquely.
#[derive(Clone, Debug, Deserialize)]
pub struct Survey {
    pub id: u64,
    #[serde(flatten)]
    pub content: Map<String, Value>,
}

/// A notification-like item.
#[derive(Clone, Debug, Deserialize)]
pub struct Notification {
    pub id: u64,
    #[serde(flatten)]
    pub content: Map<String, Value>,
}

/// One item fetched by a decide check.
#[derive(Clone, Debug)]
pub enum DecideItem {
    Survey(Survey),
    Notification(Notification),
}

impl DecideItem {
    pub fn id(&self) -> u64 {
        match self {
            DecideItem::Survey(s) => s.id,
            DecideItem::Notification(n) => n.id,
        }
    }

    pub fn kind(&self) -> DecideItemKind {
        match self {
            DecideItem::Survey(_) => DecideItemKind::Survey,
            DecideItem::Notification(_) => DecideItemKind::Notification,
        }
    }

    /// Dedup key: ids are only unique within a kind.
    pub fn dedup_key(&self) -> (DecideItemKind, u64) {
        (self.kind(), self.id())
    }
}

/// Parsed decide response document.
#[derive(Debug, Default, Deserialize)]
pub struct DecideResponse {
    #[serde(default)]
    pub surveys: Vec<Survey>,
    #[serde(default)]
    pub notifications: Vec<Notification>,
}

impl DecideResponse {
    pub fn parse(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| QueueError::Deserialization(format!("decide response: {}", e)))
    }

    /// Flatten into delivery order: surveys first, then notifications.
    pub fn into_items(self) -> Vec<DecideItem> {
        let mut items: Vec<DecideItem> = self.surveys.into_iter().map(DecideItem::Survey).collect();
        items.extend(self.notifications.into_iter().map(DecideItem::Notification));
        items
    }
}

/// Host callback for freshly-arrived decide content. Held weakly by
/// the subscription registry: dropping the listener destroys the
/// subscription.
pub trait DecideListener: Send + Sync {
    /// Fired at most once per reported batch, when new items arrived
    /// and at least one remains unseen.
    fn on_new_results(&self, distinct_id: &str);
}
