use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

/// Sink for operator alerts raised by recoverable failures.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert(&self, message: &str, details: Value);
}

/// Logs alerts through `tracing` at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlerter;

#[async_trait]
impl Alerter for TracingAlerter {
    async fn alert(&self, message: &str, details: Value) {
        error!(%details, "{message}");
    }
}

/// A recorded alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub message: String,
    pub details: Value,
}

/// Keeps alerts in memory. Useful in tests and for diagnostics endpoints.
#[derive(Debug, Default)]
pub struct MemoryAlerter {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.alerts.lock().map(|a| a.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Alerter for MemoryAlerter {
    async fn alert(&self, message: &str, details: Value) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(Alert {
                message: message.to_string(),
                details,
            });
        }
    }
}
