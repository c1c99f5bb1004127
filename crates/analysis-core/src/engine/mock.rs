//! Scripted engine for tests and offline runs.
//!
//! Evaluations are looked up by position (placement, side, castling, en
//! passant; move counters ignored). Counters live behind an `Arc` so a test can
//! keep a [`MockProbe`] after the engine has been moved into an analyzer or a
//! live worker.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{preempted, Engine, EngineEval, FrameSink, Limit, Preempt, SessionState};
use crate::book::normalize_fen;
use crate::error::AnalysisError;
use crate::score::{EngineScore, Score};

#[derive(Debug)]
struct Shared {
    state: Mutex<SessionState>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    aborts: AtomicUsize,
    analyse_calls: AtomicUsize,
    streamed: Mutex<Vec<String>>,
    configured: Mutex<BTreeMap<String, String>>,
}

/// Observes a [`MockEngine`] from outside.
#[derive(Debug, Clone)]
pub struct MockProbe(Arc<Shared>);

impl MockProbe {
    pub fn state(&self) -> SessionState {
        *self.0.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn starts(&self) -> usize {
        self.0.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.0.stops.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.0.aborts.load(Ordering::SeqCst)
    }

    pub fn analyse_calls(&self) -> usize {
        self.0.analyse_calls.load(Ordering::SeqCst)
    }

    /// Positions handed to `analyse_stream`, in order.
    pub fn streamed(&self) -> Vec<String> {
        self.0
            .streamed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn configured(&self) -> BTreeMap<String, String> {
        self.0
            .configured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[derive(Debug)]
pub struct MockEngine {
    lines: HashMap<String, Vec<(Score, Vec<String>)>>,
    fallback: Option<Score>,
    fail_start: bool,
    fail_after: Option<usize>,
    stream_depth: u32,
    latency: Option<Duration>,
    shared: Arc<Shared>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            lines: HashMap::new(),
            fallback: Some(Score::Cp(0)),
            fail_start: false,
            fail_after: None,
            stream_depth: 3,
            latency: None,
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Uninitialized),
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                aborts: AtomicUsize::new(0),
                analyse_calls: AtomicUsize::new(0),
                streamed: Mutex::new(Vec::new()),
                configured: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn probe(&self) -> MockProbe {
        MockProbe(self.shared.clone())
    }

    /// Main line for `fen`, engine perspective.
    pub fn with_eval(self, fen: &str, score: Score, pv: &[&str]) -> Self {
        self.with_lines(fen, vec![(score, pv.to_vec())])
    }

    /// Several lines for `fen`, best first.
    pub fn with_lines(mut self, fen: &str, lines: Vec<(Score, Vec<&str>)>) -> Self {
        let lines = lines
            .into_iter()
            .map(|(score, pv)| (score, pv.into_iter().map(str::to_string).collect()))
            .collect();
        self.lines.insert(normalize_fen(fen), lines);
        self
    }

    /// Score for unscripted positions; `None` makes them an engine error.
    pub fn with_fallback(mut self, score: Option<Score>) -> Self {
        self.fallback = score;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// The engine "dies" on the analyse call after `calls` successful ones.
    pub fn failing_after(mut self, calls: usize) -> Self {
        self.fail_after = Some(calls);
        self
    }

    pub fn with_stream_depth(mut self, depth: u32) -> Self {
        self.stream_depth = depth;
        self
    }

    /// Every bounded search takes `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn set_state(&self, state: SessionState) {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn ensure_ready(&self) -> Result<(), AnalysisError> {
        match self.state() {
            SessionState::Ready => Ok(()),
            other => Err(AnalysisError::Engine(format!("mock engine is {other:?}"))),
        }
    }

    fn evals_for(
        &self,
        fen: &str,
        multi_pv: u32,
        depth: Option<u32>,
    ) -> Result<Vec<EngineEval>, AnalysisError> {
        let scripted = match self.lines.get(&normalize_fen(fen)) {
            Some(lines) => lines.clone(),
            None => match self.fallback {
                Some(score) => vec![(score, Vec::new())],
                None => {
                    return Err(AnalysisError::Engine(format!("no scripted line for {fen}")));
                }
            },
        };
        Ok(scripted
            .into_iter()
            .take(multi_pv.max(1) as usize)
            .enumerate()
            .map(|(i, (score, pv))| EngineEval {
                score: EngineScore(score),
                pv,
                depth,
                nodes: Some(1000),
                nps: Some(100_000),
                multipv: i as u32 + 1,
            })
            .collect())
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn start(&mut self) -> Result<(), AnalysisError> {
        if self.fail_start {
            return Err(AnalysisError::EngineUnavailable("mock engine refused to start".into()));
        }
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        self.set_state(SessionState::Ready);
        Ok(())
    }

    async fn configure(&mut self, options: &BTreeMap<String, String>) -> Result<(), AnalysisError> {
        self.ensure_ready()?;
        self.shared
            .configured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(options.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn analyse(
        &mut self,
        fen: &str,
        limit: Limit,
        multi_pv: u32,
    ) -> Result<Vec<EngineEval>, AnalysisError> {
        self.ensure_ready()?;
        let done = self.shared.analyse_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|n| done >= n) {
            self.set_state(SessionState::Terminated);
            return Err(AnalysisError::Engine("mock engine process exited".into()));
        }
        if let Some(latency) = self.latency {
            self.set_state(SessionState::Analyzing);
            tokio::time::sleep(latency).await;
            self.set_state(SessionState::Ready);
        }
        self.evals_for(fen, multi_pv, limit.depth)
    }

    async fn best_move(
        &mut self,
        fen: &str,
        limit: Limit,
    ) -> Result<Option<String>, AnalysisError> {
        let evals = self.analyse(fen, limit, 1).await?;
        Ok(evals
            .first()
            .and_then(|e| e.best_move())
            .map(str::to_string))
    }

    async fn analyse_stream(
        &mut self,
        fen: &str,
        multi_pv: u32,
        sink: &mut FrameSink<'_>,
        signal: &dyn Preempt,
    ) -> Result<(), AnalysisError> {
        self.ensure_ready()?;
        self.shared
            .streamed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(fen.to_string());
        self.set_state(SessionState::Analyzing);

        let mut declined = false;
        'frames: for depth in 1..=self.stream_depth {
            if signal.is_set() {
                break;
            }
            for eval in self.evals_for(fen, multi_pv, Some(depth))? {
                if !sink(eval) {
                    declined = true;
                    break 'frames;
                }
            }
            tokio::task::yield_now().await;
        }
        if !declined {
            preempted(signal).await;
        }

        self.set_state(SessionState::Ready);
        Ok(())
    }

    async fn stop(&mut self) {
        self.shared.stops.fetch_add(1, Ordering::SeqCst);
        if self.state() != SessionState::Uninitialized {
            self.set_state(SessionState::Terminated);
        }
    }

    fn abort(&mut self) {
        self.shared.aborts.fetch_add(1, Ordering::SeqCst);
        if self.state() != SessionState::Uninitialized {
            self.set_state(SessionState::Terminated);
        }
    }

    fn state(&self) -> SessionState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
