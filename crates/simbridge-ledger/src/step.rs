use std::collections::BTreeMap;

use tracing::warn;

use simbridge_types::{BookId, ScoringConfig, SimulationConfig, StateSnapshot, Uid};

use crate::entry::{Role, TradeRecord};
use crate::state::RankingState;

/// Parameters of the per-step ledger update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedgerParams {
    pub sampling_interval: i64,
    pub assessment_period: i64,
    pub lookback: usize,
    pub volume_decimals: u32,
}

impl LedgerParams {
    pub fn new(scoring: &ScoringConfig, simulation: &SimulationConfig) -> Self {
        Self {
            sampling_interval: scoring.trade_volume_sampling_interval,
            assessment_period: scoring.trade_volume_assessment_period,
            lookback: scoring.sharpe_lookback,
            volume_decimals: simulation.volume_decimals,
        }
    }

    pub fn round(&self, value: f64) -> f64 {
        let scale = 10f64.powi(self.volume_decimals as i32);
        (value * scale).round() / scale
    }

    /// End of the sampling bucket containing `timestamp`.
    pub fn bucket(&self, timestamp: i64) -> i64 {
        let interval = self.sampling_interval.max(1);
        let quotient = timestamp.div_euclid(interval);
        if timestamp.rem_euclid(interval) == 0 {
            quotient * interval
        } else {
            (quotient + 1) * interval
        }
    }
}

impl RankingState {
    /// Rounded sum of an agent's `total` volume buckets on a book.
    pub fn cumulative_volume(&self, uid: Uid, book_id: BookId, params: &LedgerParams) -> f64 {
        self.entry(uid)
            .map(|e| params.round(e.total_volume(book_id)))
            .unwrap_or(0.0)
    }

    /// Write each agent's cumulative volume into the `v` field of its accounts.
    pub fn inject_volumes(&self, snapshot: &mut StateSnapshot, params: &LedgerParams) {
        for (uid, accounts) in snapshot.accounts.iter_mut() {
            for (book_id, account) in accounts.iter_mut() {
                account.volume = Some(self.cumulative_volume(*uid, *book_id, params));
            }
        }
    }

    /// Fold one snapshot into the ledger: trade volume buckets, initial
    /// balances and inventory history. Returns the agent trades seen, once per role.
    pub fn record_step(
        &mut self,
        snapshot: &StateSnapshot,
        params: &LedgerParams,
    ) -> Vec<(Uid, TradeRecord)> {
        let timestamp = snapshot.timestamp;
        let bucket = params.bucket(timestamp);
        let horizon = timestamp - params.assessment_period;
        let mut agent_trades = Vec::new();

        let uids: Vec<Uid> = self.uids().collect();
        for uid in uids {
            let entry = self.entry_mut(uid);

            for volumes in entry.trade_volumes.values_mut() {
                for buckets in volumes.roles_mut() {
                    buckets.retain(|time, _| *time >= horizon);
                    buckets.entry(bucket).or_insert(0.0);
                }
            }

            for trade in snapshot.trades_for(uid) {
                let uid_signed = i64::from(uid);
                for (is_role, role) in [
                    (trade.maker_agent == uid_signed, Role::Maker),
                    (trade.taker_agent == uid_signed, Role::Taker),
                ] {
                    if is_role {
                        agent_trades.push((
                            uid,
                            TradeRecord {
                                role,
                                trade: trade.clone(),
                            },
                        ));
                    }
                }

                let Some(volumes) = entry.trade_volumes.get_mut(&trade.book_id) else {
                    warn!(uid, book_id = trade.book_id, "trade on unknown book ignored");
                    continue;
                };
                let notional = trade.notional();
                let role = if trade.is_self_trade() {
                    Some(Role::SelfTrade)
                } else if trade.maker_agent == uid_signed {
                    Some(Role::Maker)
                } else if trade.taker_agent == uid_signed {
                    Some(Role::Taker)
                } else {
                    None
                };
                for role in std::iter::once(Role::Total).chain(role) {
                    let slot = volumes.role_mut(role).entry(bucket).or_insert(0.0);
                    *slot = params.round(*slot + notional);
                }
            }

            let accounts = snapshot.accounts.get(&uid);
            if let Some(accounts) = accounts {
                for (book_id, account) in accounts {
                    let Some(initial) = entry.initial_balances.get_mut(book_id) else {
                        continue;
                    };
                    initial.base.get_or_insert(account.base_balance.total);
                    initial.quote.get_or_insert(account.quote_balance.total);
                    if initial.wealth.is_none() {
                        if let Some(book) = snapshot.books.get(book_id) {
                            initial.wealth = Some(account.value(book));
                        }
                    }
                }
            }

            let values: BTreeMap<BookId, f64> = snapshot
                .books
                .iter()
                .map(|(book_id, book)| {
                    let value = accounts
                        .and_then(|a| a.get(book_id))
                        .map(|account| {
                            let wealth = entry
                                .initial_balances
                                .get(book_id)
                                .and_then(|b| b.wealth)
                                .unwrap_or(0.0);
                            account.value(book) - wealth
                        })
                        .unwrap_or(0.0);
                    (*book_id, value)
                })
                .collect();
            entry.inventory_history.insert(timestamp, values);
            while entry.inventory_history.len() > params.lookback {
                entry.inventory_history.pop_first();
            }
        }

        self.step_observed(timestamp);
        agent_trades
    }

    fn step_observed(&mut self, timestamp: i64) {
        if timestamp > self.simulation_timestamp {
            self.simulation_timestamp = timestamp;
        }
    }
}
