//! Engine sessions: the `Engine` trait, request limits and evaluation records.
//!
//! [`uci::UciEngine`] drives a real UCI process; [`mock::MockEngine`] is a
//! scripted stand-in for tests. A session serves one request at a time and is
//! never shared between tasks.

pub mod mock;
pub mod uci;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::AnalysisError;
use crate::score::EngineScore;

pub use mock::MockEngine;
pub use uci::UciEngine;

pub const DEFAULT_THREADS: u32 = 1;
pub const DEFAULT_HASH_MB: u32 = 16;
pub const DEFAULT_DEPTH: u32 = 18;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
    Analyzing,
    Terminated,
}

/// Bound on a single search. Neither set means search until stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limit {
    pub time: Option<Duration>,
    pub depth: Option<u32>,
}

impl Limit {
    pub fn depth(depth: u32) -> Self {
        Self {
            time: None,
            depth: Some(depth),
        }
    }

    pub fn time(time: Duration) -> Self {
        Self {
            time: Some(time),
            depth: None,
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.time.is_none() && self.depth.is_none()
    }

    /// The UCI `go` command for this limit.
    pub fn go_command(&self) -> String {
        if self.is_infinite() {
            return "go infinite".to_string();
        }
        let mut cmd = String::from("go");
        if let Some(depth) = self.depth {
            cmd.push_str(&format!(" depth {depth}"));
        }
        if let Some(time) = self.time {
            cmd.push_str(&format!(" movetime {}", time.as_millis().max(1)));
        }
        cmd
    }
}

/// One evaluated line, in the engine's (side-to-move) perspective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEval {
    pub score: EngineScore,
    pub pv: Vec<String>,
    pub depth: Option<u32>,
    pub nodes: Option<u64>,
    pub nps: Option<u64>,
    /// 1-based line index; 1 is the main line.
    pub multipv: u32,
}

impl EngineEval {
    pub fn best_move(&self) -> Option<&str> {
        self.pv.first().map(String::as_str)
    }
}

/// Everything that determines an engine result besides the position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineParams {
    /// Seconds per position.
    pub time_budget: Option<f64>,
    /// Plies per position.
    pub depth_limit: Option<u32>,
    pub multi_pv: u32,
    /// UCI options applied to the process (`Threads`, `Hash`, ...).
    pub options: BTreeMap<String, String>,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            time_budget: None,
            depth_limit: Some(DEFAULT_DEPTH),
            multi_pv: 1,
            options: default_options(),
        }
    }
}

impl EngineParams {
    pub fn with_option(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.options.insert(name.into(), value.to_string());
        self
    }

    pub fn with_options<I, K, V>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        for (name, value) in options {
            self.options.insert(name.into(), value.to_string());
        }
        self
    }

    pub fn validate(&self) -> Result<(), AnalysisError> {
        if self.time_budget.is_none() && self.depth_limit.is_none() {
            return Err(AnalysisError::InvalidInput(
                "engine params need a time budget or a depth limit".into(),
            ));
        }
        if let Some(t) = self.time_budget {
            if !(t.is_finite() && t > 0.0) {
                return Err(AnalysisError::InvalidInput(format!("bad time budget: {t}")));
            }
        }
        if self.multi_pv == 0 {
            return Err(AnalysisError::InvalidInput("multi_pv must be positive".into()));
        }
        Ok(())
    }

    pub fn limit(&self) -> Limit {
        Limit {
            time: self.time_budget.map(Duration::from_secs_f64),
            depth: self.depth_limit,
        }
    }

    /// Deterministic serialized form: every map key sorted.
    pub fn canonical(&self) -> String {
        let value = serde_json::json!({
            "depth": self.depth_limit,
            "multipv": self.multi_pv,
            "options": self.options,
            "time": self.time_budget,
        });
        value.to_string()
    }
}

pub fn default_options() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("Threads".to_string(), DEFAULT_THREADS.to_string()),
        ("Hash".to_string(), DEFAULT_HASH_MB.to_string()),
    ])
}

/// Pre-emption signal for streaming analysis.
pub trait Preempt: Send + Sync {
    /// True once the current stream should end.
    fn is_set(&self) -> bool;
    /// Woken (via `notify_waiters`) whenever `is_set` may have changed.
    fn notifier(&self) -> &Notify;
}

/// Resolves once `signal` is set.
pub async fn preempted(signal: &dyn Preempt) {
    loop {
        let notified = signal.notifier().notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if signal.is_set() {
            return;
        }
        notified.await;
    }
}

/// Receives streamed frames; returning `false` ends the stream.
pub type FrameSink<'a> = dyn FnMut(EngineEval) -> bool + Send + 'a;

#[async_trait]
pub trait Engine: Send {
    /// Spawn and handshake, then apply the session's options.
    async fn start(&mut self) -> Result<(), AnalysisError>;

    /// Apply named options; unknown or rejected ones are logged and skipped.
    async fn configure(&mut self, options: &BTreeMap<String, String>) -> Result<(), AnalysisError>;

    /// Bounded search. Returns up to `multi_pv` lines, best first.
    async fn analyse(
        &mut self,
        fen: &str,
        limit: Limit,
        multi_pv: u32,
    ) -> Result<Vec<EngineEval>, AnalysisError>;

    /// Bounded search returning only the chosen move.
    async fn best_move(
        &mut self,
        fen: &str,
        limit: Limit,
    ) -> Result<Option<String>, AnalysisError>;

    /// Unbounded search streaming every info frame into `sink` until
    /// `signal` is set or the sink declines more frames.
    async fn analyse_stream(
        &mut self,
        fen: &str,
        multi_pv: u32,
        sink: &mut FrameSink<'_>,
        signal: &dyn Preempt,
    ) -> Result<(), AnalysisError>;

    /// Quit the process. Idempotent.
    async fn stop(&mut self);

    /// Kill the process without the quit exchange, for teardown paths that
    /// cannot await.
    fn abort(&mut self);

    fn state(&self) -> SessionState;
}
