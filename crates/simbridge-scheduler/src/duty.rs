use std::fmt;

use serde::{Deserialize, Serialize};

/// Background work the bridge runs off the step loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Duty {
    /// Sync identities and registrations from the chain.
    Maintain,
    /// Recompute rankings.
    Reward,
    /// Write checkpoints.
    Save,
    /// Compress and prune engine logs.
    Archive,
    /// Publish metrics.
    Report,
}

impl Duty {
    pub const ALL: [Duty; 5] = [
        Duty::Maintain,
        Duty::Reward,
        Duty::Save,
        Duty::Archive,
        Duty::Report,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Duty::Maintain => "maintain",
            Duty::Reward => "reward",
            Duty::Save => "save",
            Duty::Archive => "archive",
            Duty::Report => "report",
        }
    }
}

impl fmt::Display for Duty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
