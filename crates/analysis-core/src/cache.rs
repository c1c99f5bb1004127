//! Durable position cache: `(position, engine params) -> evaluation`.
//!
//! Schema:
//! ```sql
//! CREATE TABLE evaluations (
//!     key      TEXT PRIMARY KEY,   -- sha256(canonical params || '\n' || fen)
//!     position TEXT NOT NULL,
//!     params   TEXT NOT NULL,      -- EngineParams::canonical()
//!     result   TEXT NOT NULL       -- StoredEval JSON, engine perspective
//! );
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::engine::{EngineEval, EngineParams};
use crate::error::AnalysisError;
use crate::score::{EngineScore, Score};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Neutral persisted form of an evaluation. Side-to-move perspective, like
/// everything the engine returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredEval {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cp: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mate: Option<i32>,
    pv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nodes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nps: Option<u64>,
    #[serde(default = "first_line")]
    multipv: u32,
}

fn first_line() -> u32 {
    1
}

impl From<&EngineEval> for StoredEval {
    fn from(eval: &EngineEval) -> Self {
        Self {
            cp: eval.score.0.cp(),
            mate: eval.score.0.mate(),
            pv: eval.pv.clone(),
            depth: eval.depth,
            nodes: eval.nodes,
            nps: eval.nps,
            multipv: eval.multipv,
        }
    }
}

impl TryFrom<StoredEval> for EngineEval {
    type Error = AnalysisError;

    fn try_from(stored: StoredEval) -> Result<Self, Self::Error> {
        let score = match (stored.cp, stored.mate) {
            (Some(cp), _) => Score::Cp(cp),
            (None, Some(mate)) => Score::Mate(mate),
            (None, None) => {
                return Err(AnalysisError::CacheUnavailable(
                    "cached record has no score".into(),
                ))
            }
        };
        Ok(EngineEval {
            score: EngineScore(score),
            pv: stored.pv,
            depth: stored.depth,
            nodes: stored.nodes,
            nps: stored.nps,
            multipv: stored.multipv,
        })
    }
}

/// SQLite-backed cache. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct PositionCache {
    conn: Arc<Mutex<Connection>>,
}

impl PositionCache {
    /// Open (or create) the cache file, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AnalysisError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                AnalysisError::CacheUnavailable(format!("{}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn)
    }

    /// A throwaway cache that lives as long as this value and its clones.
    pub fn in_memory() -> Result<Self, AnalysisError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AnalysisError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS evaluations (
                key TEXT PRIMARY KEY,
                position TEXT NOT NULL,
                params TEXT NOT NULL,
                result TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, AnalysisError> {
        self.conn
            .lock()
            .map_err(|_| AnalysisError::CacheUnavailable("cache lock poisoned".into()))
    }

    /// Digest identifying `(fen, params)`.
    pub fn key(fen: &str, params: &EngineParams) -> String {
        let mut hasher = Sha256::new();
        hasher.update(params.canonical().as_bytes());
        hasher.update(b"\n");
        hasher.update(fen.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    pub fn get(
        &self,
        fen: &str,
        params: &EngineParams,
    ) -> Result<Option<EngineEval>, AnalysisError> {
        let key = Self::key(fen, params);
        let row: Option<(String, String, String)> = self
            .lock()?
            .query_row(
                "SELECT position, params, result FROM evaluations WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((position, stored_params, result)) = row else {
            return Ok(None);
        };
        if position != fen || stored_params != params.canonical() {
            debug!(key, "Cache key collision, ignoring entry");
            return Ok(None);
        }
        let stored: StoredEval = serde_json::from_str(&result)?;
        stored.try_into().map(Some)
    }

    /// Insert or replace the evaluation for `(fen, params)`.
    pub fn put(
        &self,
        fen: &str,
        params: &EngineParams,
        eval: &EngineEval,
    ) -> Result<(), AnalysisError> {
        let key = Self::key(fen, params);
        let result = serde_json::to_string(&StoredEval::from(eval))?;
        self.lock()?.execute(
            "INSERT OR REPLACE INTO evaluations (key, position, params, result)
             VALUES (?1, ?2, ?3, ?4)",
            params![key, fen, params.canonical(), result],
        )?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), AnalysisError> {
        self.lock()?.execute("DELETE FROM evaluations", [])?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize, AnalysisError> {
        let count: i64 = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM evaluations", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, AnalysisError> {
        Ok(self.len()? == 0)
    }

    /// Raw write used by tests to simulate a damaged store.
    #[cfg(test)]
    pub(crate) fn put_raw(
        &self,
        fen: &str,
        params: &EngineParams,
        result: &str,
    ) -> Result<(), AnalysisError> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO evaluations (key, position, params, result)
             VALUES (?1, ?2, ?3, ?4)",
            params![Self::key(fen, params), fen, params.canonical(), result],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEN: &str = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1";

    fn eval(score: Score) -> EngineEval {
        EngineEval {
            score: EngineScore(score),
            pv: vec!["e7e5".into(), "g1f3".into()],
            depth: Some(18),
            nodes: Some(123_456),
            nps: Some(1_000_000),
            multipv: 1,
        }
    }

    #[test]
    fn test_put_then_get() {
        let cache = PositionCache::in_memory().unwrap();
        let params = EngineParams::default();
        assert!(cache.get(FEN, &params).unwrap().is_none());

        cache.put(FEN, &params, &eval(Score::Cp(-25))).unwrap();
        assert_eq!(cache.get(FEN, &params).unwrap(), Some(eval(Score::Cp(-25))));

        cache.put(FEN, &params, &eval(Score::Mate(-3))).unwrap();
        assert_eq!(cache.get(FEN, &params).unwrap(), Some(eval(Score::Mate(-3))));
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_different_params_miss() {
        let cache = PositionCache::in_memory().unwrap();
        let shallow = EngineParams {
            depth_limit: Some(8),
            ..EngineParams::default()
        };
        cache.put(FEN, &shallow, &eval(Score::Cp(10))).unwrap();
        assert!(cache.get(FEN, &EngineParams::default()).unwrap().is_none());
        let more_hash = EngineParams::default().with_option("Hash", 256);
        assert!(cache.get(FEN, &more_hash).unwrap().is_none());
    }

    #[test]
    fn test_key_is_order_insensitive() {
        let a = EngineParams::default().with_options([("a", 1), ("b", 2)]);
        let b = EngineParams::default().with_options([("b", 2), ("a", 1)]);
        assert_eq!(PositionCache::key(FEN, &a), PositionCache::key(FEN, &b));
        assert_eq!(PositionCache::key(FEN, &a).len(), 64);
        assert_ne!(
            PositionCache::key(FEN, &a),
            PositionCache::key("8/8/8/8/8/8/8/K6k w - - 0 1", &a)
        );
    }

    #[test]
    fn test_clear() {
        let cache = PositionCache::in_memory().unwrap();
        let params = EngineParams::default();
        cache.put(FEN, &params, &eval(Score::Cp(1))).unwrap();
        cache.clear().unwrap();
        assert!(cache.is_empty().unwrap());
        assert!(cache.get(FEN, &params).unwrap().is_none());
    }

    #[test]
    fn test_stored_form_is_compact() {
        let json = serde_json::to_string(&StoredEval::from(&eval(Score::Mate(2)))).unwrap();
        assert!(json.contains("\"mate\":2"));
        assert!(!json.contains("\"cp\""));
        assert!(json.contains("\"pv\":[\"e7e5\",\"g1f3\"]"));
    }

    #[test]
    fn test_corrupt_record_is_cache_error() {
        let cache = PositionCache::in_memory().unwrap();
        let params = EngineParams::default();
        cache.put_raw(FEN, &params, "{not json").unwrap();
        let err = cache.get(FEN, &params).unwrap_err();
        assert!(matches!(err, AnalysisError::CacheUnavailable(_)));
        cache.put_raw(FEN, &params, "{\"pv\":[]}").unwrap();
        assert!(cache.get(FEN, &params).is_err());
    }
}
