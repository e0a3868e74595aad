use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snapshot::Uid;

/// Classification of messages received on the notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    SimulationStart,
    SimulationEnd,
    ErrorReport,
    Other,
}

/// One event message from the engine's notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: serde_json::Map<String, Value>,
}

impl NotificationMessage {
    pub fn new(kind: impl Into<String>, timestamp: i64) -> Self {
        Self {
            kind: kind.into(),
            timestamp,
            body: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.body.insert(key.to_string(), value.into());
        self
    }

    pub fn classify(&self) -> NotificationKind {
        match self.kind.as_str() {
            "EVENT_SIMULATION_START" => NotificationKind::SimulationStart,
            "EVENT_SIMULATION_END" => NotificationKind::SimulationEnd,
            "RESPONSES_ERROR_REPORT" => NotificationKind::ErrorReport,
            _ => NotificationKind::Other,
        }
    }

    /// Looks a field up on the message itself, then on its nested `event` object.
    fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key).or_else(|| self.body.get("event")?.get(key))
    }

    /// Log directory announced by a start message.
    pub fn log_dir(&self) -> Option<&str> {
        self.field("logDir").and_then(Value::as_str)
    }

    /// Target agent, or `None` for broadcast messages.
    pub fn agent_id(&self) -> Option<Uid> {
        self.field("agentId")
            .and_then(Value::as_u64)
            .and_then(|id| Uid::try_from(id).ok())
    }
}

/// An ordered batch of notification messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationBatch {
    #[serde(default)]
    pub messages: Vec<NotificationMessage>,
}

/// Reply to an error report telling the engine whether to keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueSignal {
    #[serde(rename = "continue")]
    pub proceed: bool,
}
