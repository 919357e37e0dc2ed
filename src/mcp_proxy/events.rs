//! Typed event bus for service observers.

use serde::Serialize;
use tokio::sync::broadcast;

use super::config::ProxyConfig;

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the federation service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum ProxyEvent {
    #[serde(rename = "server:connecting")]
    Connecting { server_id: String },
    #[serde(rename = "server:connected")]
    Connected { server_id: String },
    #[serde(rename = "server:error")]
    Error { server_id: String, error: String },
    #[serde(rename = "server:disconnected")]
    Disconnected { server_id: String },
    #[serde(rename = "server:unhealthy")]
    Unhealthy { server_id: String },
    /// Unsolicited line from a server: a notification or an unmatched response.
    #[serde(rename = "server:message")]
    Message {
        server_id: String,
        payload: serde_json::Value,
    },
    #[serde(rename = "config:updated")]
    ConfigUpdated { config: ProxyConfig },
}

impl ProxyEvent {
    /// The server this event concerns, if any.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::Connecting { server_id }
            | Self::Connected { server_id }
            | Self::Error { server_id, .. }
            | Self::Disconnected { server_id }
            | Self::Unhealthy { server_id }
            | Self::Message { server_id, .. } => Some(server_id),
            Self::ConfigUpdated { .. } => None,
        }
    }
}

/// Cloneable publisher half of the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn emit(&self, event: ProxyEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
