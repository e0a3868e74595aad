use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, warn};

use simbridge_types::{BookId, SimulationConfig};

/// Latest fundamental price per book, read from the engine's
/// `fundamental.<first>-<last>.csv` files in `log_dir`.
///
/// Each file starts with a header of book ids followed by `Timestamp`; the
/// last non-empty line holds the most recent prices. Books without a
/// readable value map to `None`.
pub fn load_fundamental(log_dir: Option<&str>, simulation: &SimulationConfig) -> BTreeMap<BookId, Option<f64>> {
    let mut prices: BTreeMap<BookId, Option<f64>> = (0..simulation.book_count).map(|b| (b, None)).collect();
    let Some(log_dir) = log_dir else {
        return prices;
    };

    let per_block = simulation.books_per_block();
    for block in 0..simulation.block_count() {
        let first = block * per_block;
        let last = per_block * (block + 1) - 1;
        let path = Path::new(log_dir).join(format!("fundamental.{first}-{last}.csv"));
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no fundamental prices yet");
                continue;
            }
        };
        match parse_latest(&content) {
            Some(latest) => prices.extend(latest.into_iter().map(|(b, p)| (b, Some(p)))),
            None => warn!(path = %path.display(), "unreadable fundamental price file"),
        }
    }
    prices
}

fn parse_latest(content: &str) -> Option<BTreeMap<BookId, f64>> {
    let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());
    let header: Vec<BookId> = lines
        .next()?
        .split(',')
        .filter(|col| col.trim() != "Timestamp")
        .map(|col| col.trim().parse().ok())
        .collect::<Option<_>>()?;
    let Some(latest) = lines.last() else {
        return Some(BTreeMap::new());
    };
    let values: Vec<f64> = latest
        .split(',')
        .take(header.len())
        .map(|v| v.trim().parse().ok())
        .collect::<Option<_>>()?;
    Some(header.into_iter().zip(values).collect())
}
