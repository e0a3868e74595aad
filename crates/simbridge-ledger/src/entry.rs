use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use simbridge_types::{BookId, TradeNotice};

/// Role an agent played in a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Total,
    Maker,
    Taker,
    #[serde(rename = "self")]
    SelfTrade,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Total, Role::Maker, Role::Taker, Role::SelfTrade];
}

/// A trade remembered in an agent's recent-trade window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub role: Role,
    pub trade: TradeNotice,
}

/// Time-bucketed quote volume, keyed by bucket end timestamp.
pub type Buckets = BTreeMap<i64, f64>;

/// Trade volume of one agent on one book, split by role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleVolumes {
    #[serde(default)]
    pub total: Buckets,
    #[serde(default)]
    pub maker: Buckets,
    #[serde(default)]
    pub taker: Buckets,
    #[serde(rename = "self", default)]
    pub self_trade: Buckets,
}

impl RoleVolumes {
    pub fn role(&self, role: Role) -> &Buckets {
        match role {
            Role::Total => &self.total,
            Role::Maker => &self.maker,
            Role::Taker => &self.taker,
            Role::SelfTrade => &self.self_trade,
        }
    }

    pub fn role_mut(&mut self, role: Role) -> &mut Buckets {
        match role {
            Role::Total => &mut self.total,
            Role::Maker => &mut self.maker,
            Role::Taker => &mut self.taker,
            Role::SelfTrade => &mut self.self_trade,
        }
    }

    pub fn roles_mut(&mut self) -> [&mut Buckets; 4] {
        [
            &mut self.total,
            &mut self.maker,
            &mut self.taker,
            &mut self.self_trade,
        ]
    }
}

/// Balances observed when an agent was first seen in the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InitialBalance {
    #[serde(rename = "BASE", default)]
    pub base: Option<f64>,
    #[serde(rename = "QUOTE", default)]
    pub quote: Option<f64>,
    #[serde(rename = "WEALTH", default)]
    pub wealth: Option<f64>,
}

impl InitialBalance {
    /// Start-of-run balance: base and quote unknown, wealth pre-filled.
    pub fn with_wealth(wealth: f64) -> Self {
        Self {
            base: None,
            quote: None,
            wealth: Some(wealth),
        }
    }
}

/// Risk-adjusted performance summary produced by the reward model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharpeBreakdown {
    #[serde(default)]
    pub books: BTreeMap<BookId, f64>,
    #[serde(default)]
    pub books_weighted: BTreeMap<BookId, f64>,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub average: f64,
    #[serde(default)]
    pub median: f64,
    #[serde(default)]
    pub normalized_total: f64,
    #[serde(default)]
    pub normalized_average: f64,
    #[serde(default)]
    pub normalized_median: f64,
    #[serde(default)]
    pub activity_weighted_normalized_median: f64,
    #[serde(default)]
    pub penalty: f64,
    #[serde(default)]
    pub score: f64,
}

/// Outcome counters for queries sent to one miner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinerStats {
    pub requests: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub rejections: u64,
    /// Round-trip durations in seconds, most recent last.
    pub call_time: Vec<f64>,
}

/// Outcome of a single query to a miner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallOutcome {
    Success { seconds: f64 },
    Timeout,
    Failure,
    Rejected,
}

impl MinerStats {
    pub fn record(&mut self, outcome: CallOutcome) {
        self.requests += 1;
        match outcome {
            CallOutcome::Success { seconds } => self.call_time.push(seconds),
            CallOutcome::Timeout => self.timeouts += 1,
            CallOutcome::Failure => self.failures += 1,
            CallOutcome::Rejected => self.rejections += 1,
        }
    }
}

/// Everything the ranking tracks for one UID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentEntry {
    pub score: f64,
    pub unnormalized_score: f64,
    pub sharpe: SharpeBreakdown,
    pub activity_factors: BTreeMap<BookId, f64>,
    pub trade_volumes: BTreeMap<BookId, RoleVolumes>,
    /// Inventory value change per book, keyed by simulation timestamp.
    pub inventory_history: BTreeMap<i64, BTreeMap<BookId, f64>>,
    pub initial_balances: BTreeMap<BookId, InitialBalance>,
    pub initial_balance_published: bool,
    pub miner_stats: MinerStats,
}

impl AgentEntry {
    /// The zero entry with one slot per book.
    pub fn new(book_count: u32) -> Self {
        let mut entry = Self::default();
        entry.normalize_books(book_count);
        entry
    }

    /// Pad per-book mappings with zero entries or drop books at or above `book_count`.
    pub fn normalize_books(&mut self, book_count: u32) {
        resize_books(&mut self.sharpe.books, book_count, || 0.0);
        resize_books(&mut self.sharpe.books_weighted, book_count, || 0.0);
        resize_books(&mut self.activity_factors, book_count, || 0.0);
        resize_books(&mut self.trade_volumes, book_count, RoleVolumes::default);
        resize_books(&mut self.initial_balances, book_count, InitialBalance::default);
        for values in self.inventory_history.values_mut() {
            resize_books(values, book_count, || 0.0);
        }
    }

    /// Sum of the `total` volume buckets on a book, unrounded.
    pub fn total_volume(&self, book_id: BookId) -> f64 {
        self.trade_volumes
            .get(&book_id)
            .map(|v| v.total.values().sum())
            .unwrap_or(0.0)
    }
}

pub(crate) fn resize_books<V>(map: &mut BTreeMap<BookId, V>, book_count: u32, fill: impl Fn() -> V) {
    map.retain(|book_id, _| *book_id < book_count);
    for book_id in 0..book_count {
        map.entry(book_id).or_insert_with(&fill);
    }
}
