use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snapshot::Uid;

/// A single instruction submitted by an agent, e.g. place or cancel an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    #[serde(rename = "agentId")]
    pub agent_id: Uid,
    /// Simulation-time delay applied by the engine before executing the instruction.
    #[serde(default)]
    pub delay: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Everything one agent returned for the current step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    #[serde(rename = "agentId")]
    pub agent_id: Uid,
    #[serde(default)]
    pub instructions: Vec<Instruction>,
}

/// The per-step reply returned to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstructionBatch {
    pub responses: Vec<AgentResponse>,
}

impl InstructionBatch {
    /// The reply sent when a step could not be processed.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    pub fn instruction_count(&self) -> usize {
        self.responses.iter().map(|r| r.instructions.len()).sum()
    }
}
