use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use simbridge_ledger::RankingState;
use simbridge_types::DynamicValue;

use crate::document::{MARKET_VERSION, MarketDocument, RANKING_VERSION, RankingDocument};
use crate::error::CheckpointError;
use crate::migration::{self, MigrationContext, Migrated};

const TMP_SUFFIX: &str = ".tmp";

/// State recovered from disk, already migrated and normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    pub ranking: RankingState,
    pub market: MarketDocument,
    /// A migration restructured data; the caller should save right away.
    pub needs_resave: bool,
}

/// File-based checkpoint store with atomic writes.
///
/// Holds one market document per simulation label and one ranking document
/// shared across runs, both as MessagePack maps.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    market_path: PathBuf,
    ranking_path: PathBuf,
}

impl CheckpointStore {
    /// Open the store, creating the directory and removing temp files left
    /// behind by an interrupted save.
    pub fn open(dir: &Path, label: &str) -> Result<Self, CheckpointError> {
        std::fs::create_dir_all(dir).map_err(|e| CheckpointError::io("create", dir, e))?;
        let entries = std::fs::read_dir(dir).map_err(|e| CheckpointError::io("list", dir, e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && path.to_string_lossy().ends_with(TMP_SUFFIX) {
                warn!(path = %path.display(), "removing stale checkpoint temp file");
                std::fs::remove_file(&path).map_err(|e| CheckpointError::io("remove", &path, e))?;
            }
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            market_path: dir.join(format!("{label}.market.mp")),
            ranking_path: dir.join("ranking.mp"),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn market_path(&self) -> &Path {
        &self.market_path
    }

    pub fn ranking_path(&self) -> &Path {
        &self.ranking_path
    }

    pub fn exists(&self) -> bool {
        self.market_path.exists() || self.ranking_path.exists()
    }

    /// Persist both documents. Each is written to `<file>.tmp` and renamed
    /// into place; on failure the temp files are removed and the previous
    /// checkpoint stays intact.
    pub fn save(&self, ranking: &RankingState, market: &MarketDocument) -> Result<(), CheckpointError> {
        let ranking_bytes = encode("ranking", &RankingDocument::capture(ranking))?;
        let mut market = market.clone();
        market.capture_balances(ranking);
        let market_bytes = encode("market", &market)?;

        let pending = [
            (&self.market_path, market_bytes),
            (&self.ranking_path, ranking_bytes),
        ];
        let mut written: Vec<(PathBuf, &PathBuf)> = Vec::with_capacity(pending.len());
        for (path, bytes) in pending {
            let tmp = tmp_path(path);
            if let Err(e) = std::fs::write(&tmp, bytes) {
                discard(&tmp);
                written.iter().for_each(|(tmp, _)| discard(tmp));
                return Err(CheckpointError::io("write", &tmp, e));
            }
            written.push((tmp, path));
        }
        for (tmp, path) in &written {
            if let Err(e) = std::fs::rename(tmp, path) {
                written.iter().for_each(|(tmp, _)| discard(tmp));
                return Err(CheckpointError::io("rename", tmp, e));
            }
        }
        debug!(dir = %self.dir.display(), step = ranking.step, "checkpoint saved");
        Ok(())
    }

    /// Load and migrate both documents. Returns `None` when nothing has been
    /// saved yet. A missing half is replaced by its empty default.
    pub fn load(&self, ctx: &MigrationContext) -> Result<Option<Loaded>, CheckpointError> {
        if !self.exists() {
            return Ok(None);
        }

        let (market, market_resave) = match read(&self.market_path)? {
            Some(bytes) => decode(&self.market_path, &bytes, MARKET_VERSION, migration::migrate_market, ctx)?,
            None => (MarketDocument::default(), false),
        };

        let (mut ranking, ranking_resave) = match read(&self.ranking_path)? {
            Some(bytes) => {
                let (doc, resave): (RankingDocument, bool) =
                    decode(&self.ranking_path, &bytes, RANKING_VERSION, migration::migrate_ranking, ctx)?;
                (doc.restore(&market), resave)
            }
            None => {
                let empty = RankingDocument::capture(&RankingState::new(ctx.book_count));
                (empty.restore(&market), false)
            }
        };

        if ranking.book_count != ctx.book_count {
            info!(from = ranking.book_count, to = ctx.book_count, "book count changed since checkpoint");
        }
        ranking.normalize_books(ctx.book_count);

        Ok(Some(Loaded {
            ranking,
            market,
            needs_resave: market_resave || ranking_resave,
        }))
    }

    /// Delete both documents so the next load starts fresh.
    pub fn clear(&self) -> Result<(), CheckpointError> {
        for path in [&self.market_path, &self.ranking_path] {
            match std::fs::remove_file(path) {
                Ok(()) => info!(path = %path.display(), "checkpoint removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CheckpointError::io("remove", path, e)),
            }
        }
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

fn discard(tmp: &Path) {
    if let Err(e) = std::fs::remove_file(tmp) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %tmp.display(), error = %e, "failed to remove checkpoint temp file");
        }
    }
}

fn encode<T: Serialize>(document: &'static str, value: &T) -> Result<Vec<u8>, CheckpointError> {
    rmp_serde::to_vec_named(value).map_err(|source| CheckpointError::Serialize { document, source })
}

fn read(path: &Path) -> Result<Option<Vec<u8>>, CheckpointError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CheckpointError::io("read", path, e)),
    }
}

#[derive(Deserialize)]
struct VersionHeader {
    #[serde(default)]
    version: u64,
}

type Migrate = fn(Value, &MigrationContext) -> Result<Migrated, CheckpointError>;

/// Decode a document. Current documents are read directly so that every
/// float survives as written; older ones go through the migration chain.
fn decode<T: DeserializeOwned>(
    path: &Path,
    bytes: &[u8],
    current: u64,
    migrate: Migrate,
    ctx: &MigrationContext,
) -> Result<(T, bool), CheckpointError> {
    let decode_err = |source| CheckpointError::Decode {
        path: path.to_path_buf(),
        source,
    };
    let header: VersionHeader = rmp_serde::from_slice(bytes).map_err(decode_err)?;
    if header.version == current {
        return Ok((rmp_serde::from_slice(bytes).map_err(decode_err)?, false));
    }

    let DynamicValue(value) = rmp_serde::from_slice(bytes).map_err(decode_err)?;
    let migrated = migrate(value, ctx)?;
    let resave = report(path, &migrated);
    let document = serde_json::from_value(migrated.value).map_err(|source| CheckpointError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((document, resave))
}

fn report(path: &Path, migrated: &Migrated) -> bool {
    if migrated.from_version < migrated.value["version"].as_u64().unwrap_or(0) {
        info!(
            path = %path.display(),
            from = migrated.from_version,
            resave = migrated.needs_resave,
            "checkpoint migrated"
        );
    }
    migrated.needs_resave
}
