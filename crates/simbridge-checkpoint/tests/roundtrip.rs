use std::collections::BTreeMap;

use proptest::prelude::*;
use serde_json::json;
use tempfile::tempdir;

use simbridge_checkpoint::{CheckpointStore, MarketDocument, MigrationContext};
use simbridge_ledger::{CallOutcome, InitialBalance, RankingState, Role, SharpeBreakdown, TradeRecord};
use simbridge_types::{Notice, TradeNotice};

fn ctx(book_count: u32) -> MigrationContext {
    MigrationContext {
        book_count,
        sampling_interval: 600,
        volume_decimals: 4,
        miner_wealth: 1_000.0,
    }
}

fn trade(book_id: u32, maker: i64, taker: i64) -> TradeNotice {
    TradeNotice {
        timestamp: 1_200,
        book_id,
        taker_agent: taker,
        maker_agent: maker,
        price: 101.5,
        quantity: 0.25,
        side: Some(1),
    }
}

fn populated() -> (RankingState, MarketDocument) {
    let mut state = RankingState::new(2);
    state.step = 310;
    state.simulation_timestamp = 1_800;
    state.hotkeys = BTreeMap::from([(1, "hk1".to_string()), (2, "hk2".to_string())]);

    let entry = state.entry_mut(1);
    entry.score = 0.75;
    entry.unnormalized_score = 1.25;
    entry.sharpe = SharpeBreakdown {
        books: BTreeMap::from([(0, 0.5), (1, -0.25)]),
        books_weighted: BTreeMap::from([(0, 0.4), (1, -0.2)]),
        total: 0.25,
        median: 0.125,
        score: 1.25,
        ..Default::default()
    };
    entry.activity_factors.insert(0, 1.5);
    entry
        .trade_volumes
        .get_mut(&0)
        .unwrap()
        .role_mut(Role::Maker)
        .insert(1_200, 25.375);
    entry.trade_volumes.get_mut(&0).unwrap().total.insert(1_200, 25.375);
    entry.inventory_history.insert(1_800, BTreeMap::from([(0, 3.5), (1, -1.0)]));
    entry.initial_balances.insert(0, InitialBalance {
        base: Some(10.0),
        quote: Some(900.0),
        wealth: Some(1_000.0),
    });
    entry.initial_balance_published = true;
    entry.miner_stats.record(CallOutcome::Success { seconds: 0.4 });
    entry.miner_stats.record(CallOutcome::Timeout);

    state.entry_mut(2);
    state.handle_deregistration(2);

    let mut market = MarketDocument {
        start_time: Some(chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap()),
        start_timestamp: Some(0),
        step_rates: vec![2.5e9, 3.0e9],
        log_dir: Some("/var/log/sim/20251018_1200".into()),
        ..Default::default()
    };
    market.recent_trades.insert(0, vec![trade(0, 1, 4)]);
    market.recent_agent_trades.insert(
        1,
        BTreeMap::from([(0, vec![TradeRecord { role: Role::Maker, trade: trade(0, 1, 4) }])]),
    );
    market
        .pending_notices
        .insert(2, vec![Notice::new("RDRA", 1_700).with_field("r", json!([]))]);
    market.fundamental_price.insert(0, Some(100.0));
    market.fundamental_price.insert(1, None);
    market.capture_balances(&state);
    (state, market)
}

#[test]
fn test_populated_state_roundtrip() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::open(dir.path(), "simulation_0").unwrap();
    let (state, market) = populated();

    store.save(&state, &market).unwrap();
    let loaded = store.load(&ctx(2)).unwrap().unwrap();

    assert_eq!(loaded.ranking, state);
    assert_eq!(loaded.market, market);
    assert!(!loaded.needs_resave);
    assert!(loaded.ranking.pending_resets.contains(&2));
}

#[test]
fn test_empty_state_roundtrip() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::open(dir.path(), "simulation_0").unwrap();
    let state = RankingState::new(3);

    store.save(&state, &MarketDocument::default()).unwrap();
    let loaded = store.load(&ctx(3)).unwrap().unwrap();
    assert_eq!(loaded.ranking, state);
    assert_eq!(loaded.market, MarketDocument::default());
}

#[test]
fn test_book_count_change_on_load() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::open(dir.path(), "simulation_0").unwrap();
    let (state, market) = populated();
    store.save(&state, &market).unwrap();

    let grown = store.load(&ctx(4)).unwrap().unwrap().ranking;
    assert_eq!(grown.book_count, 4);
    assert!(grown.is_normalized());
    assert_eq!(grown.entry(1).unwrap().activity_factors[&0], 1.5);
    assert_eq!(grown.entry(1).unwrap().activity_factors[&3], 0.0);

    let shrunk = store.load(&ctx(1)).unwrap().unwrap().ranking;
    assert!(shrunk.is_normalized());
    assert_eq!(shrunk.entry(1).unwrap().inventory_history[&1_800].len(), 1);
}

#[test]
fn test_legacy_documents_migrate_and_request_resave() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::open(dir.path(), "simulation_0").unwrap();
    let ranking = json!({
        "step": 99,
        "hotkeys": ["hk0", "hk1"],
        "scores": [0.1, 0.9],
        "activity_factors": {"1": 0.6},
        "sharpe_values": {"0": null},
        "unnormalized_scores": {},
        "inventory_history": {},
        "trade_volumes": {"1": {"0": {"1000": {"total": 2.0, "taker": 2.0}, "1100": {"total": 1.0, "maker": 1.0}}}},
    });
    let market = json!({
        "start_time": 1_700_000_000.0,
        "start_timestamp": 0,
        "initial_balances": {"1": {"0": {"BASE": 1.0, "QUOTE": 2.0, "WEALTH": null}}},
        "recent_miner_trades": {},
        "simulation.logDir": "/logs/a",
    });
    std::fs::write(store.ranking_path(), rmp_serde::to_vec_named(&ranking).unwrap()).unwrap();
    std::fs::write(store.market_path(), rmp_serde::to_vec_named(&market).unwrap()).unwrap();

    let loaded = store.load(&ctx(2)).unwrap().unwrap();
    assert!(loaded.needs_resave);
    assert_eq!(loaded.market.log_dir.as_deref(), Some("/logs/a"));

    let state = &loaded.ranking;
    assert!(state.is_normalized());
    assert_eq!(state.step, 99);
    assert_eq!(state.hotkeys[&1], "hk1");
    let entry = state.entry(1).unwrap();
    assert_eq!(entry.score, 0.9);
    assert_eq!(entry.activity_factors[&0], 0.6);
    assert_eq!(entry.activity_factors[&1], 0.6);
    assert_eq!(entry.trade_volumes[&0].total[&1200], 3.0);
    assert_eq!(entry.trade_volumes[&0].taker[&1200], 2.0);
    assert_eq!(entry.initial_balances[&0].wealth, Some(1_000.0));

    // Saving writes the current schema; the next load needs no migration.
    store.save(&loaded.ranking, &loaded.market).unwrap();
    let again = store.load(&ctx(2)).unwrap().unwrap();
    assert!(!again.needs_resave);
    assert_eq!(again.ranking, loaded.ranking);
}

#[test]
fn test_legacy_document_with_integer_keys() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::open(dir.path(), "simulation_0").unwrap();
    let ranking = BTreeMap::from([
        ("step", rmp_value::Field::Step(5)),
        ("scores", rmp_value::Field::Scores(BTreeMap::from([(3, 0.5)]))),
    ]);
    std::fs::write(store.ranking_path(), rmp_serde::to_vec_named(&ranking).unwrap()).unwrap();

    let loaded = store.load(&ctx(1)).unwrap().unwrap();
    assert_eq!(loaded.ranking.step, 5);
    assert_eq!(loaded.ranking.entry(3).unwrap().score, 0.5);
}

mod rmp_value {
    use std::collections::BTreeMap;

    #[derive(serde::Serialize)]
    #[serde(untagged)]
    pub enum Field {
        Step(u64),
        Scores(BTreeMap<u32, f64>),
    }
}

#[test]
fn test_missing_ranking_document_starts_empty() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::open(dir.path(), "simulation_0").unwrap();
    std::fs::write(store.market_path(), rmp_serde::to_vec_named(&MarketDocument::default()).unwrap()).unwrap();

    let loaded = store.load(&ctx(2)).unwrap().unwrap();
    assert_eq!(loaded.ranking, RankingState::new(2));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_loaded_state_matches_configured_books(saved in 1u32..6, configured in 1u32..6) {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), "simulation_0").unwrap();
        let mut state = RankingState::new(saved);
        for uid in 0..3 {
            state.entry_mut(uid).activity_factors.insert(0, 0.5);
        }
        store.save(&state, &MarketDocument::default()).unwrap();

        let loaded = store.load(&ctx(configured)).unwrap().unwrap().ranking;
        prop_assert!(loaded.is_normalized());
        prop_assert_eq!(loaded.book_count, configured);
        for entry in loaded.entries.values() {
            prop_assert_eq!(entry.trade_volumes.len() as u32, configured);
        }
    }
}
