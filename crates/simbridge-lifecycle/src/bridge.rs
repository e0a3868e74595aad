use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use simbridge_checkpoint::{CheckpointStore, MigrationContext};
use simbridge_ledger::{LedgerParams, RankingState};
use simbridge_scheduler::{Alerter, Duty, DutyScheduler};
use simbridge_types::{
    BridgeConfig, BridgeError, ContinueSignal, InstructionBatch, NotificationBatch,
    NotificationKind, NotificationMessage, Result, RunEvent, RunPhase, SimulationConfig,
    StateSnapshot, duration_from_timestamp,
};

use crate::archive::LogArchiver;
use crate::collaborators::{Collaborators, GatewayResponse, StepReport};
use crate::fundamental::load_fundamental;
use crate::notify::{ErrorReportPolicy, as_notice, dump_error_report};
use crate::run_state::MarketRunState;

const HOUR: i64 = 3_600_000_000_000;

/// Connects the engine's step stream to ranking, checkpointing and the
/// miner gateway.
///
/// Shared state sits behind `tokio::sync::RwLock`s; when both are held the
/// ranking lock is taken before the market lock.
pub struct Bridge {
    config: BridgeConfig,
    simulation_path: PathBuf,
    state_dir: PathBuf,
    simulation: RwLock<SimulationConfig>,
    ranking: Arc<RwLock<RankingState>>,
    market: Arc<RwLock<MarketRunState>>,
    scheduler: Arc<DutyScheduler>,
    store: Arc<CheckpointStore>,
    archiver: Arc<LogArchiver>,
    collaborators: Collaborators,
    alerter: Arc<dyn Alerter>,
    policy: ErrorReportPolicy,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        simulation: SimulationConfig,
        collaborators: Collaborators,
        alerter: Arc<dyn Alerter>,
    ) -> Result<Self> {
        let state_dir = config.resolved_state_dir();
        let store = CheckpointStore::open(&state_dir, &simulation.label)?;
        Ok(Self {
            simulation_path: PathBuf::from(&config.simulation_config),
            ranking: Arc::new(RwLock::new(RankingState::new(simulation.book_count))),
            market: Arc::new(RwLock::new(MarketRunState::default())),
            scheduler: Arc::new(DutyScheduler::new(Arc::clone(&alerter))),
            store: Arc::new(store),
            archiver: Arc::new(LogArchiver::new(config.archive.clone())),
            policy: ErrorReportPolicy::new(config.error_report_threshold),
            simulation: RwLock::new(simulation),
            state_dir,
            collaborators,
            alerter,
            config,
        })
    }

    pub fn with_archiver(mut self, archiver: LogArchiver) -> Self {
        self.archiver = Arc::new(archiver);
        self
    }

    pub fn ranking(&self) -> Arc<RwLock<RankingState>> {
        Arc::clone(&self.ranking)
    }

    pub fn market(&self) -> Arc<RwLock<MarketRunState>> {
        Arc::clone(&self.market)
    }

    pub fn scheduler(&self) -> Arc<DutyScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub async fn simulation(&self) -> SimulationConfig {
        self.simulation.read().await.clone()
    }

    pub async fn phase(&self) -> RunPhase {
        self.market.read().await.phase
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.join_poll_interval_ms)
    }

    async fn alert(&self, message: &str, details: serde_json::Value) {
        self.alerter.alert(message, details).await;
    }

    /// Load the last checkpoint unless `reset` is set. Returns whether state was restored.
    pub async fn restore(&self, reset: bool) -> Result<bool> {
        let simulation = self.simulation().await;
        if reset {
            warn!(dir = %self.state_dir.display(), "reset requested, ignoring previous checkpoint");
            return Ok(false);
        }

        let ctx = MigrationContext {
            book_count: simulation.book_count,
            sampling_interval: self.config.scoring.trade_volume_sampling_interval,
            volume_decimals: simulation.volume_decimals,
            miner_wealth: simulation.miner_wealth,
        };
        let store = Arc::clone(&self.store);
        let loaded = tokio::task::spawn_blocking(move || store.load(&ctx))
            .await
            .map_err(join_error)??;
        let Some(loaded) = loaded else {
            info!(dir = %self.state_dir.display(), "no checkpoint found, starting fresh");
            return Ok(false);
        };

        let market = MarketRunState::from_document(loaded.market);
        if let Some(log_dir) = &market.log_dir {
            let mut simulation = self.simulation.write().await;
            simulation.simulation_id = Some(SimulationConfig::simulation_id_for(log_dir));
            simulation.log_dir = Some(log_dir.clone());
        }
        {
            let mut ranking = self.ranking.write().await;
            *ranking = loaded.ranking;
            let mut current = self.market.write().await;
            *current = market;
            info!(step = ranking.step, agents = ranking.entries.len(), "checkpoint restored");
        }
        if loaded.needs_resave {
            self.save_now().await?;
        }
        Ok(true)
    }

    /// Process one snapshot and return the instructions for the engine.
    pub async fn handle_snapshot(&self, mut snapshot: StateSnapshot, received: Instant) -> Result<InstructionBatch> {
        let now = Utc::now();
        let timestamp = snapshot.timestamp;
        {
            let mut market = self.market.write().await;
            if market.phase == RunPhase::AwaitingStart {
                market.apply(RunEvent::Resume)?;
                info!(timestamp, "snapshot without start event, resuming run");
            } else {
                market.apply(RunEvent::Step)?;
            }
        }

        let previous = self.ranking.read().await.simulation_timestamp;
        if crossed_hour(previous, timestamp) {
            if let Err(e) = self.collaborators.updater.check_for_update().await {
                self.alert("update check failed", json!({ "error": e.to_string() })).await;
            }
        }

        let simulation = self.simulation().await;
        let params = LedgerParams::new(&self.config.scoring, &simulation);

        let (step, resets, rate) = {
            let mut ranking = self.ranking.write().await;
            ranking.inject_volumes(&mut snapshot, &params);
            ranking.step += 1;
            ranking.simulation_timestamp = ranking.simulation_timestamp.max(timestamp);
            let resets = ranking.process_resets(&snapshot);

            let mut market = self.market.write().await;
            if market.ensure_anchors(timestamp, now) {
                debug!(timestamp, "run anchors taken from snapshot");
            }
            if snapshot.log_dir.is_some() && snapshot.log_dir != market.log_dir {
                info!(log_dir = ?snapshot.log_dir, "engine log directory changed");
                market.log_dir = snapshot.log_dir.clone();
            }
            let rate = market.record_rate(timestamp, now, self.config.step_rate_window);
            for uid in &resets.reset {
                market.forget_agent(*uid);
            }
            let merged = market.merge_pending_notices(&mut snapshot);
            if merged > 0 {
                debug!(merged, "pending notices merged into snapshot");
            }
            (ranking.step, resets, rate)
        };

        for failure in &resets.failed {
            self.alert(
                "agent reset failed",
                json!({ "uid": failure.uid, "message": failure.message }),
            )
            .await;
        }

        if simulation.log_window > 0 && timestamp % simulation.log_window == simulation.publish_interval {
            self.trigger_archive(false);
        }

        snapshot.config = Some(SimulationConfig {
            log_dir: None,
            simulation_id: snapshot.log_dir.as_deref().map(SimulationConfig::simulation_id_for),
            ..simulation
        });
        let snapshot = Arc::new(snapshot);

        self.scheduler
            .wait_idle(&[Duty::Reward, Duty::Maintain], self.poll_interval())
            .await;
        self.trigger_maintain();
        self.trigger_reward(Arc::clone(&snapshot), params);

        let response = match self.collaborators.gateway.forward(&snapshot).await {
            Ok(response) => response,
            Err(e) => {
                self.alert("forwarding state to miners failed", json!({ "error": e.to_string(), "step": step }))
                    .await;
                GatewayResponse::default()
            }
        };

        let mean_rate = {
            let mut ranking = self.ranking.write().await;
            for (uid, outcome) in &response.outcomes {
                if let Some(entry) = ranking.entries.get_mut(uid) {
                    entry.miner_stats.record(*outcome);
                }
            }
            let mut market = self.market.write().await;
            market.last_response = response.batch.clone();
            market.observe(Arc::clone(&snapshot), now);
            market.mean_rate()
        };

        info!(
            step,
            simulation_time = %duration_from_timestamp(timestamp),
            rate = ?rate.map(|r| r / 1e9),
            mean_rate = ?mean_rate.map(|r| r / 1e9),
            instructions = response.batch.instruction_count(),
            elapsed_ms = received.elapsed().as_millis() as u64,
            "step processed"
        );

        self.trigger_save();
        self.trigger_report();
        Ok(response.batch)
    }

    /// Start transition: new run anchors, rebased history, fresh balances.
    pub async fn on_start(&self, timestamp: i64, log_dir: Option<String>) -> Result<()> {
        self.market.write().await.apply(RunEvent::Start)?;

        let reloaded = match SimulationConfig::load(&self.simulation_path) {
            Ok(config) => config,
            Err(e) => {
                self.alert(
                    "failed to reload simulation config, keeping previous",
                    json!({ "path": self.simulation_path.display().to_string(), "error": e.to_string() }),
                )
                .await;
                self.simulation().await
            }
        };
        let simulation = SimulationConfig {
            simulation_id: log_dir.as_deref().map(SimulationConfig::simulation_id_for),
            log_dir: log_dir.clone(),
            ..reloaded
        };
        *self.simulation.write().await = simulation.clone();

        let fundamental = load_fundamental(log_dir.as_deref(), &simulation);
        {
            let mut ranking = self.ranking.write().await;
            ranking.normalize_books(simulation.book_count);
            let previous_end = ranking.simulation_timestamp;
            ranking.rebase_window(previous_end, timestamp, simulation.duration);
            ranking.reset_initial_balances(simulation.miner_wealth);

            let mut market = self.market.write().await;
            market.reset_for_start(log_dir, timestamp, Utc::now());
            market.fundamental_price = fundamental;
            info!(
                timestamp,
                log_dir = ?market.log_dir,
                books = simulation.book_count,
                pending_resets = ranking.pending_resets.len(),
                "simulation started"
            );
        }

        self.trigger_archive(true);
        self.trigger_save();
        if let Err(e) = self.collaborators.reporter.publish_run_info(&simulation).await {
            self.alert("publishing run info failed", json!({ "error": e.to_string() })).await;
        }
        Ok(())
    }

    /// End transition: clear run data, checkpoint, hand off to the updater.
    pub async fn on_end(&self) -> Result<()> {
        {
            let mut market = self.market.write().await;
            market.apply(RunEvent::End)?;
            market.clear_for_end();
        }
        self.simulation.write().await.log_dir = None;

        if let Err(e) = self.save_now().await {
            self.alert("checkpoint at end of run failed", json!({ "error": e.to_string() })).await;
        }
        if let Err(e) = self.collaborators.updater.on_end().await {
            self.alert("update hand-off failed", json!({ "error": e.to_string() })).await;
        }
        self.market.write().await.apply(RunEvent::Restarted)?;
        info!("simulation ended");
        Ok(())
    }

    /// Handle a batch from the notification channel. Returns a continue
    /// signal when the batch carried an error report.
    pub async fn handle_notifications(&self, batch: NotificationBatch) -> Result<Option<ContinueSignal>> {
        let mut ended = false;
        let mut forward = Vec::new();
        for message in batch.messages {
            match message.classify() {
                NotificationKind::SimulationStart => {
                    let log_dir = message.log_dir().map(str::to_string);
                    self.on_start(message.timestamp, log_dir).await?;
                }
                NotificationKind::SimulationEnd => ended = true,
                NotificationKind::ErrorReport => {
                    return self.handle_error_report(&message).await.map(Some);
                }
                NotificationKind::Other => forward.push(message),
            }
        }

        if !forward.is_empty() {
            match self.collaborators.gateway.notify(&forward).await {
                Ok(undelivered) if !undelivered.is_empty() => {
                    let notices: Vec<_> = undelivered
                        .iter()
                        .filter_map(|m| Some((m.agent_id()?, as_notice(m))))
                        .collect();
                    debug!(undelivered = undelivered.len(), queued = notices.len(), "notices deferred");
                    self.market.write().await.defer_notices(notices);
                }
                Ok(_) => {}
                Err(e) => {
                    self.alert("forwarding notices failed", json!({ "error": e.to_string(), "count": forward.len() }))
                        .await;
                }
            }
        }

        if ended {
            self.on_end().await?;
        }
        Ok(None)
    }

    async fn handle_error_report(&self, message: &NotificationMessage) -> Result<ContinueSignal> {
        let (count, last_response, log_dir) = {
            let mut market = self.market.write().await;
            market.error_reports += 1;
            (market.error_reports, market.last_response.clone(), market.log_dir.clone())
        };
        let simulation_id = self
            .simulation
            .read()
            .await
            .simulation_id
            .clone()
            .or_else(|| log_dir.as_deref().map(SimulationConfig::simulation_id_for))
            .unwrap_or_else(|| "unknown".to_string());

        match dump_error_report(&self.state_dir, &simulation_id, message, &last_response) {
            Ok((responses, error)) => {
                info!(responses = %responses.display(), error = %error.display(), "error report saved")
            }
            Err(e) => warn!(error = %e, "failed to save error report"),
        }

        let signal = self.policy.decide(count);
        let threshold = self.policy.threshold;
        let details = json!({ "count": count, "threshold": threshold, "report": message });
        if signal.proceed {
            self.alert(&format!("engine reported an error in responses ({count}/{threshold})"), details)
                .await;
        } else {
            self.alert("engine error reports over threshold, stopping simulation", details)
                .await;
        }
        Ok(signal)
    }

    /// Checkpoint now, waiting for any running save first. Holds the save
    /// flag so no triggered save writes the same files concurrently.
    pub async fn save_now(&self) -> Result<()> {
        let _guard = loop {
            self.scheduler.wait_idle(&[Duty::Save], self.poll_interval()).await;
            if let Some(guard) = self.scheduler.try_acquire(Duty::Save) {
                break guard;
            }
        };
        self.save_task().await
    }

    fn save_task(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let ranking = Arc::clone(&self.ranking);
        let market = Arc::clone(&self.market);
        let store = Arc::clone(&self.store);
        async move {
            let started = Instant::now();
            let (ranking, market) = {
                let ranking = ranking.read().await;
                let market = market.read().await;
                (ranking.clone(), market.to_document())
            };
            tokio::task::spawn_blocking(move || store.save(&ranking, &market))
                .await
                .map_err(join_error)??;
            debug!(elapsed_ms = started.elapsed().as_millis() as u64, "state saved");
            Ok(())
        }
    }

    fn trigger_save(&self) -> bool {
        self.scheduler.trigger(Duty::Save, self.save_task())
    }

    fn trigger_maintain(&self) -> bool {
        let chain = Arc::clone(&self.collaborators.chain);
        let ranking = Arc::clone(&self.ranking);
        self.scheduler.trigger(Duty::Maintain, async move {
            let roster = chain.roster().await?;
            if !roster.is_empty() {
                let change = ranking.write().await.apply_roster(roster);
                if !change.added.is_empty() || !change.deregistered.is_empty() {
                    info!(added = ?change.added, deregistered = ?change.deregistered, "roster updated");
                }
            }
            let scores = {
                let ranking = ranking.read().await;
                ranking.entries.iter().map(|(uid, e)| (*uid, e.score)).collect()
            };
            chain.publish_scores(&scores).await
        })
    }

    fn trigger_reward(&self, snapshot: Arc<StateSnapshot>, params: LedgerParams) -> bool {
        let ranking = Arc::clone(&self.ranking);
        let market = Arc::clone(&self.market);
        let model = Arc::clone(&self.collaborators.reward);
        let trades_per_book = self.config.recent_trades_per_book;
        let agent_trades = self.config.recent_agent_trades;
        self.scheduler.trigger(Duty::Reward, async move {
            {
                let mut ranking = ranking.write().await;
                let trades = ranking.record_step(&snapshot, &params);
                let mut market = market.write().await;
                market.record_market_trades(&snapshot, trades_per_book);
                market.record_agent_trades(trades, agent_trades);
            }
            let updates = {
                let ranking = ranking.read().await;
                model.score(&ranking, &snapshot, &params).await?
            };
            if !updates.is_empty() {
                ranking.write().await.apply_scores(updates);
            }
            Ok(())
        })
    }

    fn trigger_archive(&self, start: bool) -> bool {
        let archiver = Arc::clone(&self.archiver);
        let ranking = Arc::clone(&self.ranking);
        let market = Arc::clone(&self.market);
        let alerter = Arc::clone(&self.alerter);
        self.scheduler.trigger(Duty::Archive, async move {
            let timestamp = ranking.read().await.simulation_timestamp;
            let log_dir = market.read().await.log_dir.clone();
            let today = Utc::now().date_naive();
            let report = tokio::task::spawn_blocking(move || archiver.run(log_dir.as_deref(), timestamp, start, today))
                .await
                .map_err(join_error)??;
            for failure in report.failures {
                alerter.alert("log archive failure", json!({ "error": failure })).await;
            }
            Ok(())
        })
    }

    fn trigger_report(&self) -> bool {
        if self.config.reporting_disabled {
            return false;
        }
        let ranking = Arc::clone(&self.ranking);
        let market = Arc::clone(&self.market);
        let reporter = Arc::clone(&self.collaborators.reporter);
        self.scheduler.trigger(Duty::Report, async move {
            let report = {
                let ranking = ranking.read().await;
                let market = market.read().await;
                StepReport {
                    step: ranking.step,
                    timestamp: ranking.simulation_timestamp,
                    step_rate: market.step_rates.back().copied(),
                    mean_step_rate: market.mean_rate(),
                    scores: ranking.entries.iter().map(|(uid, e)| (*uid, e.score)).collect(),
                    pending_resets: ranking.pending_resets.len(),
                }
            };
            reporter.report(&report).await
        })
    }
}

/// Whether the simulation clock passed an hour boundary between two steps.
fn crossed_hour(previous: i64, timestamp: i64) -> bool {
    previous > 0 && timestamp.div_euclid(HOUR) > previous.div_euclid(HOUR)
}

fn join_error(err: JoinError) -> BridgeError {
    BridgeError::Internal(format!("blocking task failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crossed_hour() {
        assert!(!crossed_hour(0, HOUR));
        assert!(crossed_hour(HOUR - 1, HOUR));
        assert!(crossed_hour(HOUR - 1, 3 * HOUR));
        assert!(!crossed_hour(HOUR, HOUR + 5));
        assert!(!crossed_hour(HOUR + 5, HOUR + 10));
    }
}
