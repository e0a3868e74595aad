use std::path::{Path, PathBuf};

use serde_json::Value;

use simbridge_types::{
    BridgeError, ContinueSignal, InstructionBatch, Notice, NotificationMessage, Result,
};

/// Decides whether the engine keeps running after an error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorReportPolicy {
    pub threshold: u32,
}

impl ErrorReportPolicy {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    /// `count` is the number of reports received this run, including the current one.
    pub fn decide(&self, count: u32) -> ContinueSignal {
        ContinueSignal {
            proceed: count <= self.threshold,
        }
    }
}

/// Write the instruction batch that triggered an error report, and the report
/// itself, next to the checkpoints.
pub(crate) fn dump_error_report(
    dir: &Path,
    simulation_id: &str,
    message: &NotificationMessage,
    last_response: &InstructionBatch,
) -> Result<(PathBuf, PathBuf)> {
    let stem = format!("{simulation_id}.{}", message.timestamp);
    let responses = dir.join(format!("{stem}.responses.json"));
    let error = dir.join(format!("{stem}.error.json"));
    write_json(&responses, &serde_json::to_value(last_response).unwrap_or(Value::Null))?;
    write_json(&error, &serde_json::to_value(message).unwrap_or(Value::Null))?;
    Ok((responses, error))
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    let content = serde_json::to_vec_pretty(value).map_err(|e| BridgeError::Serialization(e.to_string()))?;
    std::fs::write(path, content)
        .map_err(|e| BridgeError::Internal(format!("failed to write {}: {e}", path.display())))
}

/// Notice form of a notification, queued for the next snapshot when it
/// could not be delivered directly.
pub(crate) fn as_notice(message: &NotificationMessage) -> Notice {
    let mut notice = Notice::new(message.kind.clone(), message.timestamp);
    notice.agent = message.agent_id().map(i64::from);
    notice.body = message.body.clone();
    notice
}
