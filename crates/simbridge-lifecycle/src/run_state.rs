use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use simbridge_checkpoint::MarketDocument;
use simbridge_ledger::TradeRecord;
use simbridge_types::{
    BookId, InstructionBatch, Notice, RunEvent, RunPhase, StateSnapshot, TradeNotice, Uid,
};

/// Run-scoped market bookkeeping. Reset on every start, cleared on end.
#[derive(Debug, Clone, Default)]
pub struct MarketRunState {
    pub phase: RunPhase,
    /// Simulated nanoseconds per wall-clock second, most recent last.
    pub step_rates: VecDeque<f64>,
    /// Wall-clock time of the run start.
    pub start_time: Option<DateTime<Utc>>,
    /// Simulation time of the run start.
    pub start_timestamp: Option<i64>,
    /// Wall-clock time the previous snapshot was received.
    pub last_state_time: Option<DateTime<Utc>>,
    pub last_snapshot: Option<Arc<StateSnapshot>>,
    pub recent_trades: BTreeMap<BookId, VecDeque<TradeNotice>>,
    pub recent_agent_trades: BTreeMap<Uid, BTreeMap<BookId, VecDeque<TradeRecord>>>,
    /// Notices waiting to be merged into the next forwarded snapshot.
    pub pending_notices: BTreeMap<Uid, Vec<Notice>>,
    pub log_dir: Option<String>,
    pub fundamental_price: BTreeMap<BookId, Option<f64>>,
    pub last_response: InstructionBatch,
    pub error_reports: u32,
}

impl MarketRunState {
    pub fn from_document(doc: MarketDocument) -> Self {
        Self {
            step_rates: doc.step_rates.into(),
            start_time: doc.start_time,
            start_timestamp: doc.start_timestamp,
            recent_trades: doc
                .recent_trades
                .into_iter()
                .map(|(book, trades)| (book, trades.into()))
                .collect(),
            recent_agent_trades: doc
                .recent_agent_trades
                .into_iter()
                .map(|(uid, books)| {
                    let books = books.into_iter().map(|(b, t)| (b, t.into())).collect();
                    (uid, books)
                })
                .collect(),
            pending_notices: doc.pending_notices,
            log_dir: doc.log_dir,
            fundamental_price: doc.fundamental_price,
            ..Default::default()
        }
    }

    /// Market document for a checkpoint. Initial balances are filled in by the store.
    pub fn to_document(&self) -> MarketDocument {
        MarketDocument {
            start_time: self.start_time,
            start_timestamp: self.start_timestamp,
            step_rates: self.step_rates.iter().copied().collect(),
            recent_trades: self
                .recent_trades
                .iter()
                .map(|(book, trades)| (*book, trades.iter().cloned().collect()))
                .collect(),
            recent_agent_trades: self
                .recent_agent_trades
                .iter()
                .map(|(uid, books)| {
                    let books = books
                        .iter()
                        .map(|(b, t)| (*b, t.iter().cloned().collect()))
                        .collect();
                    (*uid, books)
                })
                .collect(),
            pending_notices: self.pending_notices.clone(),
            log_dir: self.log_dir.clone(),
            fundamental_price: self.fundamental_price.clone(),
            ..Default::default()
        }
    }

    pub fn apply(&mut self, event: RunEvent) -> simbridge_types::Result<RunPhase> {
        self.phase = self.phase.transition(event)?;
        Ok(self.phase)
    }

    /// Fresh anchors and windows for a new run.
    pub fn reset_for_start(&mut self, log_dir: Option<String>, timestamp: i64, now: DateTime<Utc>) {
        self.start_time = Some(now);
        self.start_timestamp = Some(timestamp);
        self.last_state_time = None;
        self.last_snapshot = None;
        self.step_rates.clear();
        self.recent_trades.clear();
        self.recent_agent_trades.clear();
        self.log_dir = log_dir;
        self.error_reports = 0;
    }

    pub fn clear_for_end(&mut self) {
        self.log_dir = None;
        self.fundamental_price.clear();
        self.pending_notices.clear();
    }

    /// Take run anchors from the first snapshot seen without them.
    pub fn ensure_anchors(&mut self, timestamp: i64, now: DateTime<Utc>) -> bool {
        if self.start_time.is_some() && self.start_timestamp.is_some() {
            return false;
        }
        self.start_time = Some(now);
        self.start_timestamp = Some(timestamp);
        true
    }

    /// Throughput since the previous snapshot, or since the run anchors for
    /// the first one. Keeps at most `window` samples.
    pub fn record_rate(&mut self, timestamp: i64, now: DateTime<Utc>, window: usize) -> Option<f64> {
        let (previous_ts, previous_time) = match (&self.last_snapshot, self.last_state_time) {
            (Some(last), Some(at)) => (last.timestamp, at),
            _ => (self.start_timestamp?, self.start_time?),
        };
        let elapsed = (now - previous_time).num_nanoseconds()? as f64 / 1e9;
        if elapsed <= 0.0 {
            return None;
        }
        let rate = (timestamp - previous_ts) as f64 / elapsed;
        self.step_rates.push_back(rate);
        while self.step_rates.len() > window {
            self.step_rates.pop_front();
        }
        Some(rate)
    }

    pub fn mean_rate(&self) -> Option<f64> {
        if self.step_rates.is_empty() {
            return None;
        }
        Some(self.step_rates.iter().sum::<f64>() / self.step_rates.len() as f64)
    }

    pub fn observe(&mut self, snapshot: Arc<StateSnapshot>, now: DateTime<Utc>) {
        self.last_snapshot = Some(snapshot);
        self.last_state_time = Some(now);
    }

    /// Queue notices for later delivery.
    pub fn defer_notices(&mut self, notices: impl IntoIterator<Item = (Uid, Notice)>) {
        for (uid, notice) in notices {
            self.pending_notices.entry(uid).or_default().push(notice);
        }
    }

    /// Move queued notices into `snapshot`, after the engine's own.
    pub fn merge_pending_notices(&mut self, snapshot: &mut StateSnapshot) -> usize {
        let pending = std::mem::take(&mut self.pending_notices);
        let mut merged = 0;
        for (uid, notices) in pending {
            merged += notices.len();
            snapshot.notices.entry(uid).or_default().extend(notices);
        }
        merged
    }

    /// Append the trades in each book's event list, keeping the last `limit` per book.
    pub fn record_market_trades(&mut self, snapshot: &StateSnapshot, limit: usize) {
        for (book_id, book) in &snapshot.books {
            let window = self.recent_trades.entry(*book_id).or_default();
            window.extend(book.trades());
            while window.len() > limit {
                window.pop_front();
            }
        }
    }

    /// Append per-agent trades, keeping the last `limit` per agent and book.
    pub fn record_agent_trades(&mut self, trades: Vec<(Uid, TradeRecord)>, limit: usize) {
        for (uid, record) in trades {
            let window = self
                .recent_agent_trades
                .entry(uid)
                .or_default()
                .entry(record.trade.book_id)
                .or_default();
            window.push_back(record);
            while window.len() > limit {
                window.pop_front();
            }
        }
    }

    pub fn forget_agent(&mut self, uid: Uid) {
        self.recent_agent_trades.remove(&uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use simbridge_ledger::Role;
    use simbridge_types::{Book, Level};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn trade(book_id: BookId, n: i64) -> TradeNotice {
        TradeNotice {
            timestamp: n,
            book_id,
            taker_agent: 1,
            maker_agent: 2,
            price: 100.0,
            quantity: 1.0,
            side: None,
        }
    }

    #[test]
    fn test_rate_uses_anchor_then_previous_snapshot() {
        let mut state = MarketRunState::default();
        assert_eq!(state.record_rate(10, at(1), 3), None);

        state.reset_for_start(None, 0, at(0));
        assert_eq!(state.record_rate(2_000_000_000, at(2), 3), Some(1e9));

        let snapshot = StateSnapshot {
            timestamp: 2_000_000_000,
            ..Default::default()
        };
        state.observe(Arc::new(snapshot), at(2));
        assert_eq!(state.record_rate(8_000_000_000, at(4), 3), Some(3e9));
        assert_eq!(state.mean_rate(), Some(2e9));
    }

    #[test]
    fn test_rate_window_is_bounded() {
        let mut state = MarketRunState::default();
        state.reset_for_start(None, 0, at(0));
        for i in 1..=5 {
            state.record_rate(i * 1_000, at(i), 3);
        }
        assert_eq!(state.step_rates.len(), 3);
    }

    #[test]
    fn test_market_trade_window() {
        let mut state = MarketRunState::default();
        let mut snapshot = StateSnapshot::default();
        let events = (0..4)
            .map(|n| {
                Notice::new("t", n)
                    .with_field("b", 0)
                    .with_field("Ta", 1)
                    .with_field("Ma", 2)
                    .with_field("p", 100.0)
                    .with_field("q", 1.0)
            })
            .collect();
        snapshot.books.insert(
            0,
            Book {
                id: 0,
                bids: vec![Level { price: 99.0, quantity: 1.0 }],
                asks: vec![],
                events,
            },
        );

        state.record_market_trades(&snapshot, 3);
        let window = &state.recent_trades[&0];
        assert_eq!(window.len(), 3);
        assert_eq!(window.front().unwrap().timestamp, 1);
    }

    #[test]
    fn test_agent_trade_window_and_forget() {
        let mut state = MarketRunState::default();
        let trades = (0..7)
            .map(|n| (4, TradeRecord { role: Role::Taker, trade: trade(1, n) }))
            .collect();
        state.record_agent_trades(trades, 5);
        assert_eq!(state.recent_agent_trades[&4][&1].len(), 5);

        state.forget_agent(4);
        assert!(state.recent_agent_trades.is_empty());
    }

    #[test]
    fn test_pending_notices_merge_once() {
        let mut state = MarketRunState::default();
        state.defer_notices([(3, Notice::new("EVENT_X", 5)), (3, Notice::new("EVENT_Y", 6))]);

        let mut snapshot = StateSnapshot::default();
        snapshot.notices.insert(3, vec![Notice::new("ET", 7)]);
        assert_eq!(state.merge_pending_notices(&mut snapshot), 2);
        assert_eq!(snapshot.notices[&3].len(), 3);
        assert_eq!(snapshot.notices[&3][0].tag, "ET");
        assert_eq!(state.merge_pending_notices(&mut snapshot), 0);
    }

    #[test]
    fn test_document_conversion_keeps_windows() {
        let mut state = MarketRunState::default();
        state.reset_for_start(Some("/logs/run".into()), 100, at(0));
        state.recent_trades.entry(0).or_default().push_back(trade(0, 1));
        state.fundamental_price.insert(0, Some(99.5));
        state.step_rates.push_back(1.5e9);

        let restored = MarketRunState::from_document(state.to_document());
        assert_eq!(restored.start_timestamp, Some(100));
        assert_eq!(restored.log_dir.as_deref(), Some("/logs/run"));
        assert_eq!(restored.recent_trades[&0].len(), 1);
        assert_eq!(restored.fundamental_price[&0], Some(99.5));
        assert_eq!(restored.phase, RunPhase::AwaitingStart);
    }

    #[test]
    fn test_phase_follows_transition_table() {
        let mut state = MarketRunState::default();
        assert!(state.apply(RunEvent::Step).is_err());
        assert_eq!(state.apply(RunEvent::Start).unwrap(), RunPhase::Running);
        assert_eq!(state.apply(RunEvent::End).unwrap(), RunPhase::Ended);
        assert!(state.apply(RunEvent::Step).is_err());
        assert_eq!(state.phase, RunPhase::Ended);
    }
}
