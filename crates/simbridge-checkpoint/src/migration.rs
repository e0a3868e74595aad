//! Schema migrations for checkpoint documents.
//!
//! Each migration takes a document at version `n` and returns it at version
//! `n + 1`. Documents without a `version` field are version 0. Migrations are
//! pure functions of the document and the [`MigrationContext`].

use chrono::DateTime;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::document::{MARKET_VERSION, RANKING_VERSION};
use crate::error::CheckpointError;

/// Configuration a migration may need to fill in or reshape data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MigrationContext {
    pub book_count: u32,
    pub sampling_interval: i64,
    pub volume_decimals: u32,
    pub miner_wealth: f64,
}

/// A document brought up to the current schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Migrated {
    pub value: Value,
    pub from_version: u64,
    /// Set when a migration restructured data so that it should be written back immediately.
    pub needs_resave: bool,
}

type Migration = fn(Value, &MigrationContext) -> Result<(Value, bool), CheckpointError>;

const MARKET_MIGRATIONS: [Migration; MARKET_VERSION as usize] = [market_v0_to_v1];
const RANKING_MIGRATIONS: [Migration; RANKING_VERSION as usize] = [ranking_v0_to_v1, ranking_v1_to_v2];

pub fn migrate_market(value: Value, ctx: &MigrationContext) -> Result<Migrated, CheckpointError> {
    run_chain("market", value, &MARKET_MIGRATIONS, ctx)
}

pub fn migrate_ranking(value: Value, ctx: &MigrationContext) -> Result<Migrated, CheckpointError> {
    run_chain("ranking", value, &RANKING_MIGRATIONS, ctx)
}

fn run_chain(
    document: &'static str,
    mut value: Value,
    chain: &[Migration],
    ctx: &MigrationContext,
) -> Result<Migrated, CheckpointError> {
    if !value.is_object() {
        return Err(CheckpointError::Malformed {
            document,
            message: "expected a JSON object".into(),
        });
    }
    let from_version = value.get("version").and_then(Value::as_u64).unwrap_or(0);
    let supported = chain.len() as u64;
    if from_version > supported {
        return Err(CheckpointError::UnsupportedVersion {
            document,
            found: from_version,
            supported,
        });
    }

    let mut needs_resave = false;
    for (index, migration) in chain.iter().enumerate().skip(from_version as usize) {
        let (next, resave) = migration(value, ctx)?;
        value = next;
        needs_resave |= resave;
        let to = index as u64 + 1;
        if let Some(object) = value.as_object_mut() {
            object.insert("version".into(), json!(to));
        }
        debug!(document, to, "checkpoint document migrated");
    }
    Ok(Migrated {
        value,
        from_version,
        needs_resave,
    })
}

fn object(value: Value, document: &'static str) -> Result<Map<String, Value>, CheckpointError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(CheckpointError::Malformed {
            document,
            message: "expected a JSON object".into(),
        }),
    }
}

/// Index-keyed arrays become maps; null becomes an empty map.
fn as_uid_map(value: Option<Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        Some(Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        _ => Map::new(),
    }
}

fn book_map(ctx: &MigrationContext, value: impl Fn() -> Value) -> Value {
    Value::Object((0..ctx.book_count).map(|b| (b.to_string(), value())).collect())
}

/// Legacy ranking state: fill missing keys, turn index-keyed arrays into
/// maps, and expand scalar activity factors to one value per book.
fn ranking_v0_to_v1(value: Value, ctx: &MigrationContext) -> Result<(Value, bool), CheckpointError> {
    let mut doc = object(value, "ranking")?;

    for key in ["hotkeys", "scores", "unnormalized_scores", "activity_factors", "inventory_history", "trade_volumes"] {
        let map = as_uid_map(doc.remove(key));
        doc.insert(key.into(), Value::Object(map));
    }

    if let Some(Value::Object(factors)) = doc.get_mut("activity_factors") {
        for factor in factors.values_mut() {
            if let Some(scalar) = factor.as_f64() {
                *factor = book_map(ctx, || json!(scalar));
            } else if factor.is_null() {
                *factor = book_map(ctx, || json!(0.0));
            }
        }
    }

    let mut sharpe = as_uid_map(doc.remove("sharpe_values"));
    sharpe.retain(|_, v| v.is_object());
    doc.insert("sharpe_values".into(), Value::Object(sharpe));

    doc.entry("step").or_insert(json!(0));
    doc.entry("simulation_timestamp").or_insert(json!(0));
    doc.entry("book_count").or_insert(json!(ctx.book_count));
    doc.entry("miner_stats").or_insert(json!({}));
    if !doc.get("deregistered_uids").is_some_and(Value::is_array) {
        doc.insert("deregistered_uids".into(), json!([]));
    }

    Ok((Value::Object(doc), false))
}

/// Time-major trade volumes `{time: {role: volume}}` become role-major buckets
/// `{role: {bucket: volume}}` resampled to the sampling interval.
fn ranking_v1_to_v2(value: Value, ctx: &MigrationContext) -> Result<(Value, bool), CheckpointError> {
    let mut doc = object(value, "ranking")?;
    let mut reorganized = false;

    if let Some(Value::Object(per_uid)) = doc.get_mut("trade_volumes") {
        for books in per_uid.values_mut() {
            let Some(books) = books.as_object_mut() else {
                continue;
            };
            for volumes in books.values_mut() {
                if volumes.get("total").is_some() {
                    continue;
                }
                if !reorganized {
                    info!("reorganizing time-major trade volume history");
                    reorganized = true;
                }
                *volumes = resample(volumes, ctx);
            }
        }
    }

    Ok((Value::Object(doc), reorganized))
}

fn resample(flat: &Value, ctx: &MigrationContext) -> Value {
    let interval = ctx.sampling_interval.max(1);
    let scale = 10f64.powi(ctx.volume_decimals as i32);
    let mut roles: Map<String, Value> = ["total", "maker", "taker", "self"]
        .into_iter()
        .map(|r| (r.to_string(), json!({})))
        .collect();

    let Some(entries) = flat.as_object() else {
        return Value::Object(roles);
    };
    let mut sums: std::collections::BTreeMap<(String, i64), f64> = Default::default();
    for (time, role_volumes) in entries {
        let Ok(time) = time.parse::<i64>() else {
            continue;
        };
        let sampled = (time + interval - 1).div_euclid(interval) * interval;
        if let Some(role_volumes) = role_volumes.as_object() {
            for (role, volume) in role_volumes {
                *sums.entry((role.clone(), sampled)).or_default() += volume.as_f64().unwrap_or(0.0);
            }
        }
    }
    for ((role, sampled), volume) in sums {
        if let Some(Value::Object(buckets)) = roles.get_mut(&role) {
            buckets.insert(sampled.to_string(), json!((volume * scale).round() / scale));
        }
    }
    Value::Object(roles)
}

/// Legacy market state: rename keys, fill missing wealth, convert the wall
/// clock anchor, and drop trade windows stored in the old trade shape.
fn market_v0_to_v1(value: Value, ctx: &MigrationContext) -> Result<(Value, bool), CheckpointError> {
    let mut doc = object(value, "market")?;

    if let Some(log_dir) = doc.remove("simulation.logDir") {
        doc.insert("log_dir".into(), log_dir);
    }
    doc.remove("recent_miner_trades");
    doc.insert("recent_trades".into(), json!({}));
    doc.insert("recent_agent_trades".into(), json!({}));

    let start_time = match doc.remove("start_time") {
        Some(Value::Number(secs)) => secs
            .as_f64()
            .and_then(|s| DateTime::from_timestamp(s.trunc() as i64, (s.fract() * 1e9) as u32))
            .map(|t| json!(t.to_rfc3339()))
            .unwrap_or(Value::Null),
        Some(other) => other,
        None => Value::Null,
    };
    doc.insert("start_time".into(), start_time);

    let mut balances = as_uid_map(doc.remove("initial_balances"));
    for books in balances.values_mut() {
        let Some(books) = books.as_object_mut() else {
            continue;
        };
        for balance in books.values_mut() {
            if let Some(balance) = balance.as_object_mut() {
                if balance.get("WEALTH").is_none_or(Value::is_null) {
                    balance.insert("WEALTH".into(), json!(ctx.miner_wealth));
                }
            }
        }
    }
    doc.insert("initial_balances".into(), Value::Object(balances));

    let mut notices = as_uid_map(doc.remove("pending_notices"));
    for list in notices.values_mut() {
        if let Some(items) = list.as_array_mut() {
            items.retain(|n| n.get("y").is_some_and(Value::is_string));
        } else {
            *list = json!([]);
        }
    }
    doc.insert("pending_notices".into(), Value::Object(notices));

    doc.entry("step_rates").or_insert(json!([]));
    doc.entry("initial_balances_published").or_insert(json!({}));
    doc.entry("fundamental_price").or_insert(json!({}));

    Ok((Value::Object(doc), false))
}
