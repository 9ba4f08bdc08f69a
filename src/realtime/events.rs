//! Engine event types
//!
//! Mutations and collaborator signals are surfaced as events on a broadcast
//! bus; the compression-needed signal consumed by the external compression
//! collaborator travels this way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{AlternativeId, ConversationId, TurnId};

/// Types of engine events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TurnCreated,
    AlternativeCreated,
    AlternativeSelected,
    ContentBound,
    CompressionNeeded,
    ProducerFailed,
}

/// An engine event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Event type
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    pub conversation_id: Option<ConversationId>,
    pub turn_id: Option<TurnId>,
    pub alternative_id: Option<AlternativeId>,
    /// Additional data
    pub data: Option<serde_json::Value>,
}

impl EngineEvent {
    /// Create a turn created event
    pub fn turn_created(conversation_id: ConversationId, turn_id: TurnId) -> Self {
        Self {
            event_type: EventType::TurnCreated,
            timestamp: Utc::now(),
            conversation_id: Some(conversation_id),
            turn_id: Some(turn_id),
            alternative_id: None,
            data: None,
        }
    }

    /// Create an alternative created event
    pub fn alternative_created(
        conversation_id: ConversationId,
        turn_id: TurnId,
        alternative_id: AlternativeId,
    ) -> Self {
        Self {
            event_type: EventType::AlternativeCreated,
            timestamp: Utc::now(),
            conversation_id: Some(conversation_id),
            turn_id: Some(turn_id),
            alternative_id: Some(alternative_id),
            data: None,
        }
    }

    /// Create an alternative selected event
    pub fn alternative_selected(
        conversation_id: ConversationId,
        turn_id: TurnId,
        alternative_id: AlternativeId,
        ancestors_reverted: usize,
    ) -> Self {
        Self {
            event_type: EventType::AlternativeSelected,
            timestamp: Utc::now(),
            conversation_id: Some(conversation_id),
            turn_id: Some(turn_id),
            alternative_id: Some(alternative_id),
            data: Some(serde_json::json!({
                "ancestors_reverted": ancestors_reverted,
            })),
        }
    }

    /// Create a content bound event
    pub fn content_bound(
        conversation_id: ConversationId,
        alternative_id: AlternativeId,
        content_ref: &str,
    ) -> Self {
        Self {
            event_type: EventType::ContentBound,
            timestamp: Utc::now(),
            conversation_id: Some(conversation_id),
            turn_id: None,
            alternative_id: Some(alternative_id),
            data: Some(serde_json::json!({
                "content_ref": content_ref,
            })),
        }
    }

    /// Create a compression needed signal
    pub fn compression_needed(
        conversation_id: ConversationId,
        window_start: i64,
        window_end: i64,
    ) -> Self {
        Self {
            event_type: EventType::CompressionNeeded,
            timestamp: Utc::now(),
            conversation_id: Some(conversation_id),
            turn_id: None,
            alternative_id: None,
            data: Some(serde_json::json!({
                "window_start": window_start,
                "window_end": window_end,
            })),
        }
    }

    /// Create a producer failed event
    pub fn producer_failed(alternative_id: AlternativeId, reason: &str) -> Self {
        Self {
            event_type: EventType::ProducerFailed,
            timestamp: Utc::now(),
            conversation_id: None,
            turn_id: None,
            alternative_id: Some(alternative_id),
            data: Some(serde_json::json!({
                "reason": reason,
            })),
        }
    }
}

/// Broadcast bus for engine events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; lagging or absent subscribers are not an error
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
