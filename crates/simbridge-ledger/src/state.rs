use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use simbridge_types::{BookId, ResetOutcome, StateSnapshot, Uid};

use crate::entry::{AgentEntry, InitialBalance, SharpeBreakdown};

/// Per-UID ranking data plus the bookkeeping shared by all agents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingState {
    pub book_count: u32,
    pub step: u64,
    pub simulation_timestamp: i64,
    /// Registered identity per UID.
    pub hotkeys: BTreeMap<Uid, String>,
    pub entries: BTreeMap<Uid, AgentEntry>,
    /// UIDs awaiting a reset confirmation from the engine.
    pub pending_resets: BTreeSet<Uid>,
}

/// What `process_resets` did with the reset notices of one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResetReport {
    /// UIDs whose entries were reinitialized.
    pub reset: Vec<Uid>,
    /// Failed confirmations; the UIDs stay pending.
    pub failed: Vec<ResetOutcome>,
    /// Successful confirmations for UIDs that were not pending.
    pub ignored: Vec<Uid>,
}

/// Result of syncing the roster with the consensus layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RosterChange {
    pub added: Vec<Uid>,
    pub deregistered: Vec<Uid>,
}

/// Scores produced by the reward model for one UID.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreUpdate {
    pub sharpe: SharpeBreakdown,
    pub activity_factors: BTreeMap<BookId, f64>,
    pub unnormalized_score: f64,
    pub score: f64,
}

impl RankingState {
    pub fn new(book_count: u32) -> Self {
        Self {
            book_count,
            ..Default::default()
        }
    }

    pub fn entry(&self, uid: Uid) -> Option<&AgentEntry> {
        self.entries.get(&uid)
    }

    /// Get the entry for a UID, creating a zero entry if it is unknown.
    pub fn entry_mut(&mut self, uid: Uid) -> &mut AgentEntry {
        let book_count = self.book_count;
        self.entries
            .entry(uid)
            .or_insert_with(|| AgentEntry::new(book_count))
    }

    pub fn uids(&self) -> impl Iterator<Item = Uid> + '_ {
        self.entries.keys().copied()
    }

    /// Bring every per-book mapping to exactly `book_count` entries.
    pub fn normalize_books(&mut self, book_count: u32) {
        if book_count != self.book_count {
            info!(from = self.book_count, to = book_count, "book count changed");
        }
        self.book_count = book_count;
        for entry in self.entries.values_mut() {
            entry.normalize_books(book_count);
        }
    }

    /// Whether every per-book mapping matches the configured book count.
    pub fn is_normalized(&self) -> bool {
        let n = self.book_count as usize;
        self.entries.values().all(|e| {
            e.sharpe.books.len() == n
                && e.sharpe.books_weighted.len() == n
                && e.activity_factors.len() == n
                && e.trade_volumes.len() == n
                && e.initial_balances.len() == n
                && e.inventory_history.values().all(|v| v.len() == n)
        })
    }

    /// Replace the roster. UIDs whose identity changed are deregistered; new UIDs get zero entries.
    pub fn apply_roster(&mut self, roster: BTreeMap<Uid, String>) -> RosterChange {
        let mut change = RosterChange::default();
        for (uid, hotkey) in &roster {
            match self.hotkeys.get(uid) {
                Some(previous) if previous != hotkey => change.deregistered.push(*uid),
                Some(_) => {}
                None => change.added.push(*uid),
            }
            self.entry_mut(*uid);
        }
        self.hotkeys = roster;
        for uid in &change.deregistered {
            self.handle_deregistration(*uid);
        }
        change
    }

    /// Flag a UID for reset and zero its score until the engine confirms.
    pub fn handle_deregistration(&mut self, uid: Uid) {
        self.pending_resets.insert(uid);
        self.entry_mut(uid).score = 0.0;
        debug!(uid, "deregistered, scheduled for reset");
    }

    /// Apply the reset confirmations carried by this step's notices.
    pub fn process_resets(&mut self, snapshot: &StateSnapshot) -> ResetReport {
        let mut report = ResetReport::default();
        let outcomes = snapshot
            .notices
            .values()
            .flatten()
            .flat_map(|notice| notice.reset_outcomes());

        for outcome in outcomes {
            if !outcome.success {
                report.failed.push(outcome);
                continue;
            }
            if self.pending_resets.remove(&outcome.uid) {
                let book_count = self.book_count;
                self.entries.insert(outcome.uid, AgentEntry::new(book_count));
                info!(uid = outcome.uid, "agent balances reset");
                report.reset.push(outcome.uid);
            } else {
                debug!(uid = outcome.uid, "reset confirmed for an agent that was not pending");
                report.ignored.push(outcome.uid);
            }
        }
        report
    }

    /// Write the reward model's output back into the ledger.
    pub fn apply_scores(&mut self, updates: BTreeMap<Uid, ScoreUpdate>) {
        let book_count = self.book_count;
        for (uid, update) in updates {
            let pending = self.pending_resets.contains(&uid);
            let entry = self.entry_mut(uid);
            entry.sharpe = update.sharpe;
            entry.activity_factors = update.activity_factors;
            entry.unnormalized_score = update.unnormalized_score;
            entry.score = if pending { 0.0 } else { update.score };
            entry.normalize_books(book_count);
        }
    }

    /// Start-of-run initial balances: unknown base/quote, configured wealth.
    pub fn reset_initial_balances(&mut self, miner_wealth: f64) {
        let book_count = self.book_count;
        for entry in self.entries.values_mut() {
            entry.initial_balances = (0..book_count)
                .map(|b| (b, InitialBalance::with_wealth(miner_wealth)))
                .collect();
        }
    }

    /// Carry time-bucketed history into a new run.
    ///
    /// Buckets keyed within `window` before `previous_end` are shifted so that
    /// `previous_end` maps onto `new_start`; everything else is dropped.
    pub fn rebase_window(&mut self, previous_end: i64, new_start: i64, window: i64) {
        let keep = |key: i64| key <= previous_end && previous_end - key <= window;
        let shift = new_start - previous_end;
        for entry in self.entries.values_mut() {
            for volumes in entry.trade_volumes.values_mut() {
                for buckets in volumes.roles_mut() {
                    *buckets = rebase(std::mem::take(buckets), keep, shift);
                }
            }
            entry.inventory_history = rebase(std::mem::take(&mut entry.inventory_history), keep, shift);
        }
        self.simulation_timestamp = new_start;
    }
}

fn rebase<V>(map: BTreeMap<i64, V>, keep: impl Fn(i64) -> bool, shift: i64) -> BTreeMap<i64, V> {
    map.into_iter()
        .filter(|(key, _)| keep(*key))
        .map(|(key, value)| (key + shift, value))
        .collect()
}
