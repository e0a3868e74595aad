use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use simbridge_ledger::{
    AgentEntry, InitialBalance, MinerStats, RankingState, RoleVolumes, SharpeBreakdown, TradeRecord,
};
use simbridge_types::{BookId, Notice, TradeNotice, Uid};

/// Schema version written for new market documents.
pub const MARKET_VERSION: u64 = 1;
/// Schema version written for new ranking documents.
pub const RANKING_VERSION: u64 = 2;

/// Run-scoped market state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDocument {
    pub version: u64,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_timestamp: Option<i64>,
    #[serde(default)]
    pub step_rates: Vec<f64>,
    #[serde(default)]
    pub initial_balances: BTreeMap<Uid, BTreeMap<BookId, InitialBalance>>,
    #[serde(default)]
    pub initial_balances_published: BTreeMap<Uid, bool>,
    #[serde(default)]
    pub recent_trades: BTreeMap<BookId, Vec<TradeNotice>>,
    #[serde(default)]
    pub recent_agent_trades: BTreeMap<Uid, BTreeMap<BookId, Vec<TradeRecord>>>,
    #[serde(default)]
    pub pending_notices: BTreeMap<Uid, Vec<Notice>>,
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub fundamental_price: BTreeMap<BookId, Option<f64>>,
}

impl Default for MarketDocument {
    fn default() -> Self {
        Self {
            version: MARKET_VERSION,
            start_time: None,
            start_timestamp: None,
            step_rates: Vec::new(),
            initial_balances: BTreeMap::new(),
            initial_balances_published: BTreeMap::new(),
            recent_trades: BTreeMap::new(),
            recent_agent_trades: BTreeMap::new(),
            pending_notices: BTreeMap::new(),
            log_dir: None,
            fundamental_price: BTreeMap::new(),
        }
    }
}

impl MarketDocument {
    /// Copy the per-agent balance bookkeeping, which is persisted with the market.
    pub fn capture_balances(&mut self, state: &RankingState) {
        self.initial_balances = state
            .entries
            .iter()
            .map(|(uid, e)| (*uid, e.initial_balances.clone()))
            .collect();
        self.initial_balances_published = state
            .entries
            .iter()
            .map(|(uid, e)| (*uid, e.initial_balance_published))
            .collect();
    }
}

/// Per-agent ranking state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingDocument {
    pub version: u64,
    pub book_count: u32,
    pub step: u64,
    pub simulation_timestamp: i64,
    pub hotkeys: BTreeMap<Uid, String>,
    pub scores: BTreeMap<Uid, f64>,
    pub activity_factors: BTreeMap<Uid, BTreeMap<BookId, f64>>,
    pub inventory_history: BTreeMap<Uid, BTreeMap<i64, BTreeMap<BookId, f64>>>,
    pub sharpe_values: BTreeMap<Uid, SharpeBreakdown>,
    pub unnormalized_scores: BTreeMap<Uid, f64>,
    pub trade_volumes: BTreeMap<Uid, BTreeMap<BookId, RoleVolumes>>,
    #[serde(default)]
    pub miner_stats: BTreeMap<Uid, MinerStats>,
    pub deregistered_uids: Vec<Uid>,
}

impl RankingDocument {
    pub fn capture(state: &RankingState) -> Self {
        fn column<T>(state: &RankingState, f: impl Fn(&AgentEntry) -> T) -> BTreeMap<Uid, T> {
            state.entries.iter().map(|(uid, e)| (*uid, f(e))).collect()
        }

        Self {
            version: RANKING_VERSION,
            book_count: state.book_count,
            step: state.step,
            simulation_timestamp: state.simulation_timestamp,
            hotkeys: state.hotkeys.clone(),
            scores: column(state, |e| e.score),
            activity_factors: column(state, |e| e.activity_factors.clone()),
            inventory_history: column(state, |e| e.inventory_history.clone()),
            sharpe_values: column(state, |e| e.sharpe.clone()),
            unnormalized_scores: column(state, |e| e.unnormalized_score),
            trade_volumes: column(state, |e| e.trade_volumes.clone()),
            miner_stats: column(state, |e| e.miner_stats.clone()),
            deregistered_uids: state.pending_resets.iter().copied().collect(),
        }
    }

    /// Rebuild the ranking state, taking initial balances from the market document.
    pub fn restore(mut self, market: &MarketDocument) -> RankingState {
        let uids: BTreeSet<Uid> = self
            .hotkeys
            .keys()
            .chain(self.scores.keys())
            .chain(self.activity_factors.keys())
            .chain(self.inventory_history.keys())
            .chain(self.sharpe_values.keys())
            .chain(self.trade_volumes.keys())
            .chain(market.initial_balances.keys())
            .copied()
            .collect();

        let entries = uids
            .into_iter()
            .map(|uid| {
                let entry = AgentEntry {
                    score: self.scores.remove(&uid).unwrap_or(0.0),
                    unnormalized_score: self.unnormalized_scores.remove(&uid).unwrap_or(0.0),
                    sharpe: self.sharpe_values.remove(&uid).unwrap_or_default(),
                    activity_factors: self.activity_factors.remove(&uid).unwrap_or_default(),
                    trade_volumes: self.trade_volumes.remove(&uid).unwrap_or_default(),
                    inventory_history: self.inventory_history.remove(&uid).unwrap_or_default(),
                    initial_balances: market.initial_balances.get(&uid).cloned().unwrap_or_default(),
                    initial_balance_published: market
                        .initial_balances_published
                        .get(&uid)
                        .copied()
                        .unwrap_or(false),
                    miner_stats: self.miner_stats.remove(&uid).unwrap_or_default(),
                };
                (uid, entry)
            })
            .collect();

        let mut state = RankingState {
            book_count: self.book_count,
            step: self.step,
            simulation_timestamp: self.simulation_timestamp,
            hotkeys: self.hotkeys,
            entries,
            pending_resets: self.deregistered_uids.into_iter().collect(),
        };
        let book_count = state.book_count;
        state.normalize_books(book_count);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_restore_keeps_entries() {
        let mut state = RankingState::new(2);
        state.step = 12;
        state.hotkeys.insert(3, "hk3".into());
        let entry = state.entry_mut(3);
        entry.score = 0.4;
        entry.initial_balances.insert(1, InitialBalance::with_wealth(50.0));
        entry.initial_balance_published = true;
        state.handle_deregistration(5);

        let mut market = MarketDocument::default();
        market.capture_balances(&state);
        let restored = RankingDocument::capture(&state).restore(&market);
        assert_eq!(restored, state);
    }

    #[test]
    fn test_restore_pads_missing_books() {
        let mut doc = RankingDocument::capture(&RankingState::new(3));
        doc.scores.insert(1, 0.2);
        let restored = doc.restore(&MarketDocument::default());
        assert!(restored.is_normalized());
        assert_eq!(restored.entry(1).unwrap().activity_factors.len(), 3);
    }
}
