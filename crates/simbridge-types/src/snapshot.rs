use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SimulationConfig;

/// Agent identifier assigned by the consensus layer.
pub type Uid = u32;
/// Order book identifier within one simulation.
pub type BookId = u32;

/// One price level of an order book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    #[serde(rename = "p")]
    pub price: f64,
    #[serde(rename = "q")]
    pub quantity: f64,
}

/// Depth and recent events of a single order book.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Book {
    #[serde(rename = "i", default)]
    pub id: BookId,
    #[serde(rename = "b", default)]
    pub bids: Vec<Level>,
    #[serde(rename = "a", default)]
    pub asks: Vec<Level>,
    #[serde(rename = "e", default)]
    pub events: Vec<Notice>,
}

impl Book {
    /// Mid price of the best bid and ask, or `None` when either side is empty.
    pub fn midquote(&self) -> Option<f64> {
        match (self.bids.first(), self.asks.first()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / 2.0),
            _ => None,
        }
    }

    /// Trade events recorded on this book during the step.
    pub fn trades(&self) -> impl Iterator<Item = TradeNotice> + '_ {
        self.events.iter().filter_map(Notice::as_trade)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    #[serde(rename = "t", default)]
    pub total: f64,
    #[serde(rename = "f", default)]
    pub free: f64,
    #[serde(rename = "r", default)]
    pub reserved: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Fees {
    #[serde(rename = "v", default)]
    pub volume: f64,
    #[serde(rename = "m", default)]
    pub maker_rate: f64,
    #[serde(rename = "t", default)]
    pub taker_rate: f64,
}

/// An agent's account on one book.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "bb", default)]
    pub base_balance: Balance,
    #[serde(rename = "qb", default)]
    pub quote_balance: Balance,
    #[serde(rename = "bl", default)]
    pub base_loan: f64,
    #[serde(rename = "ql", default)]
    pub quote_loan: f64,
    #[serde(rename = "bc", default)]
    pub base_collateral: f64,
    #[serde(rename = "qc", default)]
    pub quote_collateral: f64,
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    pub fees: Option<Fees>,
    /// Cumulative traded volume, injected by the bridge before forwarding.
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

impl Account {
    /// Base holdings net of loans, including posted collateral.
    pub fn own_base(&self) -> f64 {
        self.base_balance.total - self.base_loan + self.base_collateral
    }

    pub fn own_quote(&self) -> f64 {
        self.quote_balance.total - self.quote_loan + self.quote_collateral
    }

    /// Inventory value using the book midquote; base holdings count as zero on a one-sided book.
    pub fn value(&self, book: &Book) -> f64 {
        self.own_quote() + book.midquote().unwrap_or(0.0) * self.own_base()
    }
}

/// Broad classification of a notice by its `y` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Trade,
    ResetAgents,
    ResetAgentsError,
    Other,
}

impl NoticeKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "EVENT_TRADE" | "ET" | "t" => NoticeKind::Trade,
            "RESPONSE_DISTRIBUTED_RESET_AGENT" | "RDRA" => NoticeKind::ResetAgents,
            "ERROR_RESPONSE_DISTRIBUTED_RESET_AGENT" | "ERDRA" => NoticeKind::ResetAgentsError,
            _ => NoticeKind::Other,
        }
    }
}

/// A structured event emitted by the engine. Only the tag, timestamp and agent are typed;
/// the remaining fields are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    #[serde(rename = "y")]
    pub tag: String,
    #[serde(rename = "t", default)]
    pub timestamp: i64,
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<i64>,
    #[serde(flatten, deserialize_with = "crate::dynamic::deserialize_map")]
    pub body: serde_json::Map<String, Value>,
}

/// One entry of a reset response notice.
#[derive(Debug, Clone, PartialEq)]
pub struct ResetOutcome {
    pub uid: Uid,
    pub success: bool,
    pub message: Option<String>,
}

/// A fill as reported in trade notices and book events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeNotice {
    pub timestamp: i64,
    pub book_id: BookId,
    pub taker_agent: i64,
    pub maker_agent: i64,
    pub price: f64,
    pub quantity: f64,
    pub side: Option<i64>,
}

impl TradeNotice {
    /// Volume in quote currency.
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }

    pub fn is_self_trade(&self) -> bool {
        self.maker_agent == self.taker_agent
    }
}

impl Notice {
    pub fn new(tag: impl Into<String>, timestamp: i64) -> Self {
        Self {
            tag: tag.into(),
            timestamp,
            agent: None,
            body: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.body.insert(key.to_string(), value.into());
        self
    }

    pub fn kind(&self) -> NoticeKind {
        NoticeKind::from_tag(&self.tag)
    }

    /// Entries of a reset response notice. Both the response and the error
    /// variant report success per entry through its `u` flag.
    pub fn reset_outcomes(&self) -> Vec<ResetOutcome> {
        if !matches!(self.kind(), NoticeKind::ResetAgents | NoticeKind::ResetAgentsError) {
            return Vec::new();
        }
        let Some(Value::Array(entries)) = self.body.get("r") else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|entry| {
                let uid = entry.get("a")?.as_u64()?;
                Some(ResetOutcome {
                    uid: Uid::try_from(uid).ok()?,
                    success: entry.get("u").and_then(Value::as_bool).unwrap_or(false),
                    message: entry.get("m").and_then(Value::as_str).map(str::to_string),
                })
            })
            .collect()
    }

    /// Interprets the notice as a trade, if it is one and carries the required fields.
    pub fn as_trade(&self) -> Option<TradeNotice> {
        if self.kind() != NoticeKind::Trade {
            return None;
        }
        let field = |key: &str| self.body.get(key);
        Some(TradeNotice {
            timestamp: self.timestamp,
            book_id: BookId::try_from(field("b")?.as_u64()?).ok()?,
            taker_agent: field("Ta")?.as_i64()?,
            maker_agent: field("Ma")?.as_i64()?,
            price: field("p")?.as_f64()?,
            quantity: field("q")?.as_f64()?,
            side: field("s").and_then(Value::as_i64),
        })
    }
}

/// One step of market state as published by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub timestamp: i64,
    #[serde(rename = "logDir", default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub books: BTreeMap<BookId, Book>,
    #[serde(default)]
    pub accounts: BTreeMap<Uid, BTreeMap<BookId, Account>>,
    #[serde(default)]
    pub notices: BTreeMap<Uid, Vec<Notice>>,
    /// Run description attached by the bridge when forwarding to miners.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<SimulationConfig>,
}

impl StateSnapshot {
    pub fn notices_for(&self, uid: Uid) -> &[Notice] {
        self.notices.get(&uid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All trade notices addressed to an agent.
    pub fn trades_for(&self, uid: Uid) -> Vec<TradeNotice> {
        self.notices_for(uid)
            .iter()
            .filter_map(Notice::as_trade)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trade(book: u64, taker: i64, maker: i64, price: f64, qty: f64) -> Notice {
        Notice::new("ET", 1_000)
            .with_field("b", book)
            .with_field("Ta", taker)
            .with_field("Ma", maker)
            .with_field("p", price)
            .with_field("q", qty)
    }

    #[test]
    fn test_midquote_and_value() {
        let book = Book {
            id: 0,
            bids: vec![Level { price: 99.0, quantity: 1.0 }],
            asks: vec![Level { price: 101.0, quantity: 1.0 }],
            events: vec![],
        };
        assert_eq!(book.midquote(), Some(100.0));

        let account = Account {
            base_balance: Balance { total: 2.0, ..Default::default() },
            quote_balance: Balance { total: 50.0, ..Default::default() },
            ..Default::default()
        };
        assert_eq!(account.value(&book), 250.0);

        let one_sided = Book { asks: vec![], ..book };
        assert_eq!(account.value(&one_sided), 50.0);
    }

    #[test]
    fn test_trade_notice_parsing() {
        let notice = trade(1, 3, 7, 10.0, 2.5);
        let parsed = notice.as_trade().unwrap();
        assert_eq!(parsed.book_id, 1);
        assert_eq!(parsed.taker_agent, 3);
        assert_eq!(parsed.maker_agent, 7);
        assert_eq!(parsed.notional(), 25.0);
        assert!(!parsed.is_self_trade());

        let missing_price = Notice::new("EVENT_TRADE", 0).with_field("b", 0);
        assert!(missing_price.as_trade().is_none());
        assert!(Notice::new("RDRA", 0).as_trade().is_none());
    }

    #[test]
    fn test_reset_outcomes() {
        let ok = Notice::new("RDRA", 5).with_field(
            "r",
            json!([{"a": 4, "u": true}, {"a": 9, "u": false, "m": "busy"}]),
        );
        let outcomes = ok.reset_outcomes();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].uid, 4);
        assert!(!outcomes[1].success);
        assert_eq!(outcomes[1].message.as_deref(), Some("busy"));

        let error_variant = Notice::new("ERROR_RESPONSE_DISTRIBUTED_RESET_AGENT", 5)
            .with_field("r", json!([{"a": 4, "u": true}, {"a": 6, "u": false}]));
        let outcomes = error_variant.reset_outcomes();
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);

        assert!(Notice::new("ET", 0).reset_outcomes().is_empty());
    }

    #[test]
    fn test_snapshot_wire_keys() {
        let raw = json!({
            "timestamp": 600,
            "logDir": "/tmp/run",
            "books": {"0": {"i": 0, "b": [{"p": 1.0, "q": 2.0}], "a": [], "e": []}},
            "accounts": {"3": {"0": {"bb": {"t": 1.0, "f": 1.0, "r": 0.0}, "qb": {"t": 5.0}}}},
            "notices": {"3": [{"y": "ET", "t": 600, "b": 0, "Ta": 3, "Ma": 4, "p": 1.0, "q": 1.0}]}
        });
        let snapshot: StateSnapshot = serde_json::from_value(raw).unwrap();
        assert_eq!(snapshot.timestamp, 600);
        assert_eq!(snapshot.log_dir.as_deref(), Some("/tmp/run"));
        assert_eq!(snapshot.accounts[&3][&0].quote_balance.total, 5.0);
        assert_eq!(snapshot.trades_for(3).len(), 1);
        assert!(snapshot.trades_for(8).is_empty());
    }

    #[test]
    fn test_notice_body_survives_msgpack() {
        let notice = Notice::new("EVENT_ORDER_PLACED", 42).with_field("o", 17);
        let bytes = rmp_serde::to_vec_named(&notice).unwrap();
        let decoded: Notice = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, notice);
    }

    #[test]
    fn test_snapshot_from_engine_msgpack() {
        // Engine payloads key books, accounts and notice bodies by integers.
        #[derive(serde::Serialize)]
        struct Wire {
            timestamp: i64,
            books: BTreeMap<u32, BTreeMap<&'static str, Value>>,
            accounts: BTreeMap<u32, BTreeMap<u32, BTreeMap<&'static str, BTreeMap<&'static str, f64>>>>,
            notices: BTreeMap<u32, Vec<BTreeMap<&'static str, Value>>>,
        }
        let mut reset = BTreeMap::from([("y", json!("RDRA")), ("t", json!(600))]);
        reset.insert("r", json!([{"a": 4, "u": true}]));
        let wire = Wire {
            timestamp: 600,
            books: BTreeMap::from([(0, BTreeMap::from([("i", json!(0)), ("b", json!([{"p": 99.5, "q": 1}]))]))]),
            accounts: BTreeMap::from([(4, BTreeMap::from([(0, BTreeMap::from([("qb", BTreeMap::from([("t", 50.0)]))]))]))]),
            notices: BTreeMap::from([(4, vec![reset])]),
        };
        let mut bytes = rmp_serde::to_vec_named(&wire).unwrap();
        // Nested body maps may be keyed by integers too.
        let mut raw: BTreeMap<String, rmp_body::Raw> = BTreeMap::new();
        raw.insert("y".into(), rmp_body::Raw::Str("ET".into()));
        raw.insert("d".into(), rmp_body::Raw::IntMap(BTreeMap::from([(7, 1.5)])));
        let notice: Notice = rmp_serde::from_slice(&rmp_serde::to_vec_named(&raw).unwrap()).unwrap();
        assert_eq!(notice.body["d"], json!({"7": 1.5}));

        let snapshot: StateSnapshot = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(snapshot.timestamp, 600);
        assert_eq!(snapshot.books[&0].bids[0].price, 99.5);
        assert_eq!(snapshot.accounts[&4][&0].quote_balance.total, 50.0);
        assert_eq!(snapshot.notices_for(4)[0].reset_outcomes()[0].uid, 4);

        bytes.truncate(bytes.len() - 1);
        assert!(rmp_serde::from_slice::<StateSnapshot>(&bytes).is_err());
    }

    mod rmp_body {
        use std::collections::BTreeMap;

        #[derive(serde::Serialize)]
        #[serde(untagged)]
        pub enum Raw {
            Str(String),
            IntMap(BTreeMap<u32, f64>),
        }
    }
}
