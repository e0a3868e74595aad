//! Seams to the systems the bridge drives but does not implement.
//!
//! Each trait has a `Null*` implementation that does nothing, so a bridge
//! can run with only the collaborators a deployment actually has.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use simbridge_ledger::{CallOutcome, LedgerParams, RankingState, ScoreUpdate};
use simbridge_types::{
    InstructionBatch, NotificationMessage, Result, SimulationConfig, StateSnapshot, Uid,
};

/// Identity and registration data from the consensus layer.
#[async_trait]
pub trait ChainSync: Send + Sync {
    /// Current registered identity per UID. An empty roster means no data.
    async fn roster(&self) -> Result<BTreeMap<Uid, String>>;

    /// Submit the latest scores.
    async fn publish_scores(&self, scores: &BTreeMap<Uid, f64>) -> Result<()>;
}

/// The ranking formula.
#[async_trait]
pub trait RewardModel: Send + Sync {
    async fn score(
        &self,
        ranking: &RankingState,
        snapshot: &StateSnapshot,
        params: &LedgerParams,
    ) -> Result<BTreeMap<Uid, ScoreUpdate>>;
}

/// Instructions collected from miners for one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayResponse {
    pub batch: InstructionBatch,
    pub outcomes: BTreeMap<Uid, CallOutcome>,
}

/// Query fan-out to the miners.
#[async_trait]
pub trait MinerGateway: Send + Sync {
    async fn forward(&self, snapshot: &StateSnapshot) -> Result<GatewayResponse>;

    /// Deliver event notifications. Returns the messages that could not be delivered.
    async fn notify(&self, messages: &[NotificationMessage]) -> Result<Vec<NotificationMessage>>;
}

/// Per-step figures handed to the reporter.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepReport {
    pub step: u64,
    pub timestamp: i64,
    pub step_rate: Option<f64>,
    pub mean_step_rate: Option<f64>,
    pub scores: BTreeMap<Uid, f64>,
    pub pending_resets: usize,
}

/// Metrics publication.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn publish_run_info(&self, simulation: &SimulationConfig) -> Result<()>;

    async fn report(&self, report: &StepReport) -> Result<()>;
}

/// Deployment hand-off: pulling, rebuilding and restarting the engine.
#[async_trait]
pub trait Updater: Send + Sync {
    /// Called hourly in simulation time.
    async fn check_for_update(&self) -> Result<()>;

    /// Called once the run has ended and been checkpointed.
    async fn on_end(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullChainSync;

#[async_trait]
impl ChainSync for NullChainSync {
    async fn roster(&self) -> Result<BTreeMap<Uid, String>> {
        Ok(BTreeMap::new())
    }

    async fn publish_scores(&self, _scores: &BTreeMap<Uid, f64>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullRewardModel;

#[async_trait]
impl RewardModel for NullRewardModel {
    async fn score(
        &self,
        _ranking: &RankingState,
        _snapshot: &StateSnapshot,
        _params: &LedgerParams,
    ) -> Result<BTreeMap<Uid, ScoreUpdate>> {
        Ok(BTreeMap::new())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullGateway;

#[async_trait]
impl MinerGateway for NullGateway {
    async fn forward(&self, _snapshot: &StateSnapshot) -> Result<GatewayResponse> {
        Ok(GatewayResponse::default())
    }

    async fn notify(&self, _messages: &[NotificationMessage]) -> Result<Vec<NotificationMessage>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn publish_run_info(&self, _simulation: &SimulationConfig) -> Result<()> {
        Ok(())
    }

    async fn report(&self, _report: &StepReport) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullUpdater;

#[async_trait]
impl Updater for NullUpdater {
    async fn check_for_update(&self) -> Result<()> {
        Ok(())
    }

    async fn on_end(&self) -> Result<()> {
        Ok(())
    }
}

/// The full set of collaborators a bridge calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub chain: Arc<dyn ChainSync>,
    pub reward: Arc<dyn RewardModel>,
    pub gateway: Arc<dyn MinerGateway>,
    pub reporter: Arc<dyn Reporter>,
    pub updater: Arc<dyn Updater>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            chain: Arc::new(NullChainSync),
            reward: Arc::new(NullRewardModel),
            gateway: Arc::new(NullGateway),
            reporter: Arc::new(NullReporter),
            updater: Arc::new(NullUpdater),
        }
    }
}
