//! Analysis configuration from environment variables

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::book;
use crate::engine::{EngineParams, DEFAULT_DEPTH, DEFAULT_HASH_MB, DEFAULT_THREADS};
use crate::error::AnalysisError;
use crate::live::DEFAULT_LIVE_MULTIPV;

#[derive(Clone, Debug)]
pub struct AnalysisConfig {
    /// Path to the UCI engine binary
    pub stockfish_path: String,

    pub engine_threads: u32,
    pub engine_hash_mb: u32,

    /// Depth limit per position; `None` when only a time budget applies
    pub depth: Option<u32>,

    /// Seconds per position
    pub time_secs: Option<f64>,

    pub multi_pv: u32,
    pub live_multi_pv: u32,

    /// Position cache file; `None` disables caching
    pub cache_path: Option<PathBuf>,

    pub book_enabled: bool,
    pub book_endpoint: String,
    pub book_timeout: Duration,

    pub handshake_timeout: Duration,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl AnalysisConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let stockfish_path = lookup("STOCKFISH_PATH")
            .unwrap_or_else(|| "/usr/local/bin/stockfish".to_string());

        // An empty ANALYSIS_DEPTH means "no depth limit".
        let depth = match lookup("ANALYSIS_DEPTH") {
            Some(v) if v.trim().is_empty() => None,
            Some(v) => v.trim().parse().ok().or(Some(DEFAULT_DEPTH)),
            None => Some(DEFAULT_DEPTH),
        };

        let cache_path = match lookup("POSITION_CACHE_PATH") {
            Some(v) if v.trim().eq_ignore_ascii_case("off") || v.trim().is_empty() => None,
            Some(v) => Some(PathBuf::from(v.trim())),
            None => Some(PathBuf::from("data/position_cache.sqlite3")),
        };

        let book_enabled = lookup("BOOK_ENABLED")
            .map(|v| {
                !matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "0" | "false" | "off" | "no"
                )
            })
            .unwrap_or(true);

        Self {
            stockfish_path,
            engine_threads: parse_var(&lookup, "ENGINE_THREADS").unwrap_or(DEFAULT_THREADS),
            engine_hash_mb: parse_var(&lookup, "ENGINE_HASH_MB").unwrap_or(DEFAULT_HASH_MB),
            depth,
            time_secs: parse_var(&lookup, "ANALYSIS_TIME_SECS"),
            multi_pv: parse_var(&lookup, "ANALYSIS_MULTIPV").unwrap_or(1),
            live_multi_pv: parse_var(&lookup, "LIVE_MULTIPV").unwrap_or(DEFAULT_LIVE_MULTIPV),
            cache_path,
            book_enabled,
            book_endpoint: lookup("BOOK_ENDPOINT")
                .unwrap_or_else(|| book::DEFAULT_ENDPOINT.to_string()),
            book_timeout: parse_var(&lookup, "BOOK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(book::DEFAULT_TIMEOUT),
            handshake_timeout: parse_var(&lookup, "ENGINE_HANDSHAKE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(10)),
        }
    }

    /// Engine parameters for game analysis.
    pub fn engine_params(&self) -> Result<EngineParams, AnalysisError> {
        let params = EngineParams {
            time_budget: self.time_secs,
            depth_limit: self.depth,
            multi_pv: self.multi_pv,
            options: Default::default(),
        }
        .with_option("Threads", self.engine_threads)
        .with_option("Hash", self.engine_hash_mb);
        params.validate()?;
        Ok(params)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}
