//! UCI engine session over a child process (async I/O)

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::{
    default_options, preempted, Engine, EngineEval, FrameSink, Limit, Preempt, SessionState,
};
use crate::error::AnalysisError;
use crate::score::{EngineScore, Score};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const QUIT_TIMEOUT: Duration = Duration::from_secs(2);

/// A UCI engine process. Spawned by [`Engine::start`], killed on drop.
pub struct UciEngine {
    path: PathBuf,
    options: BTreeMap<String, String>,
    handshake_timeout: Duration,
    state: SessionState,
    process: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    /// Lower-cased option names from `option name ...` during the handshake.
    advertised: HashSet<String>,
    engine_name: Option<String>,
    multi_pv: u32,
}

impl UciEngine {
    /// A session for the binary at `path`, not yet started.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            options: default_options(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            state: SessionState::Uninitialized,
            process: None,
            stdin: None,
            stdout: None,
            advertised: HashSet::new(),
            engine_name: None,
            multi_pv: 1,
        }
    }

    /// Options applied on every start, on top of `Threads=1` and `Hash=16`.
    pub fn with_options(mut self, options: &BTreeMap<String, String>) -> Self {
        self.options
            .extend(options.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn engine_name(&self) -> Option<&str> {
        self.engine_name.as_deref()
    }

    /// Send a command to the engine
    async fn send(&mut self, cmd: &str) -> Result<(), AnalysisError> {
        debug!(cmd, "UCI <");
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(AnalysisError::Engine("engine not running".into()));
        };
        let written = async {
            stdin.write_all(format!("{cmd}\n").as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            self.state = SessionState::Terminated;
            return Err(AnalysisError::Engine(format!("Failed to write to engine: {e}")));
        }
        Ok(())
    }

    /// Read the next output line. End of output means the process died.
    async fn read_line(&mut self) -> Result<String, AnalysisError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Err(AnalysisError::Engine("engine not running".into()));
        };
        match stdout.next_line().await {
            Ok(Some(line)) => {
                debug!(line = line.trim(), "UCI >");
                Ok(line)
            }
            Ok(None) => {
                self.state = SessionState::Terminated;
                Err(AnalysisError::Engine("engine process exited".into()))
            }
            Err(e) => {
                self.state = SessionState::Terminated;
                Err(AnalysisError::Engine(format!("Failed to read from engine: {e}")))
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), AnalysisError> {
        self.send("uci").await?;
        loop {
            let line = self.read_line().await?;
            let trimmed = line.trim();
            if trimmed == "uciok" {
                return Ok(());
            }
            if let Some(name) = parse_option_name(trimmed) {
                self.advertised.insert(name.to_ascii_lowercase());
            } else if let Some(name) = trimmed.strip_prefix("id name ") {
                self.engine_name = Some(name.to_string());
            }
        }
    }

    /// `isready` round trip. Complaints printed before `readyok` are logged.
    async fn sync_ready(&mut self) -> Result<(), AnalysisError> {
        self.send("isready").await?;
        loop {
            let line = self.read_line().await?;
            let trimmed = line.trim();
            if trimmed == "readyok" {
                return Ok(());
            }
            if is_option_complaint(trimmed) {
                warn!(line = trimmed, "Engine rejected option");
            }
        }
    }

    fn ensure_ready(&self) -> Result<(), AnalysisError> {
        match self.state {
            SessionState::Ready => Ok(()),
            SessionState::Uninitialized => Err(AnalysisError::Engine("engine not started".into())),
            SessionState::Analyzing => Err(AnalysisError::Engine(
                "an analysis is already in flight".into(),
            )),
            SessionState::Terminated => Err(AnalysisError::Engine("engine terminated".into())),
        }
    }

    async fn set_multi_pv(&mut self, multi_pv: u32) -> Result<(), AnalysisError> {
        let multi_pv = multi_pv.max(1);
        if multi_pv != self.multi_pv {
            self.send(&format!("setoption name MultiPV value {multi_pv}"))
                .await?;
            self.multi_pv = multi_pv;
        }
        Ok(())
    }

    /// Run one bounded search; returns the lines and the `bestmove` token.
    async fn search(
        &mut self,
        fen: &str,
        limit: Limit,
        multi_pv: u32,
    ) -> Result<(Vec<EngineEval>, Option<String>), AnalysisError> {
        self.ensure_ready()?;
        if limit.is_infinite() {
            return Err(AnalysisError::InvalidInput(
                "bounded analysis needs a time or depth limit".into(),
            ));
        }
        self.set_multi_pv(multi_pv).await?;
        self.send(&format!("position fen {fen}")).await?;
        self.send(&limit.go_command()).await?;
        self.state = SessionState::Analyzing;

        let mut lines: Vec<Option<EngineEval>> = vec![None; self.multi_pv as usize];
        let best = loop {
            let line = self.read_line().await?;
            let trimmed = line.trim();
            if let Some(eval) = parse_info(trimmed) {
                let idx = eval.multipv.saturating_sub(1) as usize;
                if idx < lines.len() {
                    lines[idx] = Some(eval);
                }
            } else if trimmed.starts_with("bestmove") {
                break parse_bestmove(trimmed);
            }
        };
        self.state = SessionState::Ready;

        let mut evals: Vec<EngineEval> = lines.into_iter().flatten().collect();
        if evals.is_empty() {
            return Err(AnalysisError::Engine(format!("no evaluation for {fen}")));
        }
        if let (Some(main), Some(best)) = (evals.first_mut(), best.as_ref()) {
            if main.pv.is_empty() {
                main.pv.push(best.clone());
            }
        }
        Ok((evals, best))
    }

    /// After `stop`, discard frames up to the closing `bestmove`.
    async fn drain_to_bestmove(&mut self) -> Result<(), AnalysisError> {
        loop {
            let line = self.read_line().await?;
            if line.trim().starts_with("bestmove") {
                return Ok(());
            }
        }
    }

    fn kill(&mut self) {
        if let Some(process) = self.process.as_mut() {
            let _ = process.start_kill();
        }
        self.process = None;
        self.stdin = None;
        self.stdout = None;
    }
}

enum StreamEvent {
    Preempted,
    Line(std::io::Result<Option<String>>),
}

#[async_trait]
impl Engine for UciEngine {
    async fn start(&mut self) -> Result<(), AnalysisError> {
        if self.state == SessionState::Ready {
            return Ok(());
        }
        self.kill();

        let mut process = Command::new(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AnalysisError::EngineUnavailable(format!(
                    "Failed to spawn {}: {e}",
                    self.path.display()
                ))
            })?;

        let (Some(stdin), Some(stdout)) = (process.stdin.take(), process.stdout.take()) else {
            let _ = process.start_kill();
            return Err(AnalysisError::EngineUnavailable("engine stdio not captured".into()));
        };
        self.stdin = Some(stdin);
        self.stdout = Some(BufReader::new(stdout).lines());
        self.process = Some(process);
        self.advertised.clear();
        self.multi_pv = 1;

        match tokio::time::timeout(self.handshake_timeout, self.handshake()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.kill();
                self.state = SessionState::Terminated;
                return Err(AnalysisError::EngineUnavailable(e.to_string()));
            }
            Err(_) => {
                self.kill();
                self.state = SessionState::Terminated;
                return Err(AnalysisError::EngineUnavailable(format!(
                    "no uciok within {:?}",
                    self.handshake_timeout
                )));
            }
        }

        self.state = SessionState::Ready;
        let options = self.options.clone();
        self.configure(&options).await?;
        info!(
            engine = self.engine_name.as_deref().unwrap_or("unknown"),
            path = %self.path.display(),
            "Engine ready"
        );
        Ok(())
    }

    async fn configure(&mut self, options: &BTreeMap<String, String>) -> Result<(), AnalysisError> {
        self.ensure_ready()?;
        for (name, value) in options {
            if !self.advertised.is_empty() && !self.advertised.contains(&name.to_ascii_lowercase())
            {
                warn!(option = %name, "Engine does not advertise option, skipping");
                continue;
            }
            self.send(&format!("setoption name {name} value {value}"))
                .await?;
            if name.eq_ignore_ascii_case("MultiPV") {
                self.multi_pv = value.parse().unwrap_or(1);
            }
        }
        self.sync_ready().await
    }

    async fn analyse(
        &mut self,
        fen: &str,
        limit: Limit,
        multi_pv: u32,
    ) -> Result<Vec<EngineEval>, AnalysisError> {
        let (evals, _) = self.search(fen, limit, multi_pv).await?;
        Ok(evals)
    }

    async fn best_move(
        &mut self,
        fen: &str,
        limit: Limit,
    ) -> Result<Option<String>, AnalysisError> {
        let (_, best) = self.search(fen, limit, 1).await?;
        Ok(best)
    }

    async fn analyse_stream(
        &mut self,
        fen: &str,
        multi_pv: u32,
        sink: &mut FrameSink<'_>,
        signal: &dyn Preempt,
    ) -> Result<(), AnalysisError> {
        self.ensure_ready()?;
        self.set_multi_pv(multi_pv).await?;
        self.send(&format!("position fen {fen}")).await?;
        self.send(&Limit::default().go_command()).await?;
        self.state = SessionState::Analyzing;

        let stop = preempted(signal);
        tokio::pin!(stop);
        // Deepest frame emitted so far per line.
        let mut deepest: HashMap<u32, u32> = HashMap::new();

        loop {
            let event = match self.stdout.as_mut() {
                Some(stdout) => tokio::select! {
                    _ = &mut stop => StreamEvent::Preempted,
                    line = stdout.next_line() => StreamEvent::Line(line),
                },
                None => return Err(AnalysisError::Engine("engine not running".into())),
            };

            let line = match event {
                StreamEvent::Preempted => break,
                StreamEvent::Line(Ok(Some(line))) => line,
                StreamEvent::Line(Ok(None)) => {
                    self.state = SessionState::Terminated;
                    return Err(AnalysisError::Engine("engine process exited".into()));
                }
                StreamEvent::Line(Err(e)) => {
                    self.state = SessionState::Terminated;
                    return Err(AnalysisError::Engine(format!("Failed to read from engine: {e}")));
                }
            };

            let trimmed = line.trim();
            if trimmed.starts_with("bestmove") {
                // Search ended on its own (e.g. no legal moves).
                self.state = SessionState::Ready;
                return Ok(());
            }
            let Some(eval) = parse_info(trimmed) else {
                continue;
            };
            let depth = eval.depth.unwrap_or(0);
            let seen = deepest.entry(eval.multipv).or_insert(0);
            if depth < *seen {
                continue;
            }
            *seen = depth;
            if !sink(eval) {
                break;
            }
        }

        self.send("stop").await?;
        self.drain_to_bestmove().await?;
        self.state = SessionState::Ready;
        Ok(())
    }

    async fn stop(&mut self) {
        if self.process.is_none() {
            if self.state != SessionState::Uninitialized {
                self.state = SessionState::Terminated;
            }
            return;
        }
        if self.state == SessionState::Analyzing {
            let _ = self.send("stop").await;
        }
        let _ = self.send("quit").await;
        if let Some(process) = self.process.as_mut() {
            if tokio::time::timeout(QUIT_TIMEOUT, process.wait()).await.is_err() {
                warn!("Engine ignored quit, killing");
            }
        }
        self.kill();
        self.state = SessionState::Terminated;
        debug!("Engine stopped");
    }

    fn abort(&mut self) {
        if self.process.is_some() {
            self.kill();
            self.state = SessionState::Terminated;
        }
    }

    fn state(&self) -> SessionState {
        self.state
    }
}

impl Drop for UciEngine {
    fn drop(&mut self) {
        // Best-effort synchronous kill in drop
        self.kill();
    }
}

/// Parse an `info` line carrying a score into an evaluation frame.
pub fn parse_info(line: &str) -> Option<EngineEval> {
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("info") {
        return None;
    }

    let mut score = None;
    let mut bound = false;
    let mut depth = None;
    let mut nodes = None;
    let mut nps = None;
    let mut multipv = 1;
    let mut pv = Vec::new();

    while let Some(token) = tokens.next() {
        match token {
            "depth" => depth = tokens.next().and_then(|v| v.parse().ok()),
            "nodes" => nodes = tokens.next().and_then(|v| v.parse().ok()),
            "nps" => nps = tokens.next().and_then(|v| v.parse().ok()),
            "multipv" => multipv = tokens.next().and_then(|v| v.parse().ok()).unwrap_or(1),
            "score" => {
                score = match (tokens.next(), tokens.next().and_then(|v| v.parse().ok())) {
                    (Some("cp"), Some(v)) => Some(Score::Cp(v)),
                    (Some("mate"), Some(v)) => Some(Score::Mate(v)),
                    _ => None,
                }
            }
            "lowerbound" | "upperbound" => bound = true,
            "pv" => {
                // PV ends at next keyword or end of line
                pv = tokens
                    .by_ref()
                    .take_while(|t| !t.starts_with("bmc") && *t != "string")
                    .map(str::to_string)
                    .collect();
                break;
            }
            "string" => break,
            _ => {}
        }
    }

    if bound {
        return None;
    }
    Some(EngineEval {
        score: EngineScore(score?),
        pv,
        depth,
        nodes,
        nps,
        multipv: multipv.max(1),
    })
}

/// `bestmove e2e4 [ponder e7e5]`; `(none)` when there is no legal move.
fn parse_bestmove(line: &str) -> Option<String> {
    let mv = line.split_whitespace().nth(1)?;
    if mv == "(none)" || mv == "0000" {
        return None;
    }
    Some(mv.to_string())
}

/// `option name <Name With Spaces> type ...`
fn parse_option_name(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("option name ")?;
    let end = rest.find(" type ").unwrap_or(rest.len());
    Some(rest[..end].trim())
}

fn is_option_complaint(line: &str) -> bool {
    line.starts_with("No such option") || line.contains("ERROR") || line.starts_with("Unknown")
}
