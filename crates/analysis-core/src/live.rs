//! Continuous analysis of a moving target position.
//!
//! A spawned worker owns its own engine session and streams every info frame
//! for the current target into a bounded channel. `set_position` bumps an
//! epoch under the lock and wakes the worker; the running stream sees the
//! epoch change, sends `stop`, drains, and the worker moves on.
//!
//! A consumer that falls behind does not stall the engine: frames wait in a
//! backlog holding only the newest frame of each line, so the next one it
//! reads is the deepest available.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{preempted, Engine, EngineEval, Preempt, SessionState};
use crate::error::AnalysisError;
use crate::game::{parse_position, side_to_move};
use crate::score::WhiteScore;

pub const DEFAULT_LIVE_MULTIPV: u32 = 3;
pub const DEFAULT_CAPACITY: usize = 256;

/// One streamed frame. The score is engine perspective.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveUpdate {
    /// Target this frame belongs to.
    pub fen: String,
    pub eval: EngineEval,
}

impl LiveUpdate {
    pub fn multipv_index(&self) -> u32 {
        self.eval.multipv
    }

    pub fn white_score(&self) -> Result<WhiteScore, AnalysisError> {
        Ok(self.eval.score.for_white(side_to_move(&self.fen)?))
    }
}

#[derive(Debug, Default)]
struct Target {
    fen: Option<String>,
    epoch: u64,
    stopped: bool,
}

#[derive(Debug, Default)]
struct Shared {
    target: Mutex<Target>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Target> {
        self.target.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Preemption for one stream: set once the epoch moves on or the worker stops.
struct Watch<'a> {
    shared: &'a Shared,
    epoch: u64,
}

impl Preempt for Watch<'_> {
    fn is_set(&self) -> bool {
        let target = self.shared.lock();
        target.stopped || target.epoch != self.epoch
    }

    fn notifier(&self) -> &Notify {
        &self.shared.notify
    }
}

pub struct LiveAnalyzer {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<Result<(), AnalysisError>>>,
}

impl LiveAnalyzer {
    /// Start the worker. While the channel is full, older frames of a line
    /// are replaced by newer ones.
    pub fn spawn<E>(
        engine: E,
        multi_pv: u32,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<LiveUpdate>)
    where
        E: Engine + 'static,
    {
        let shared = Arc::new(Shared::default());
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(engine, shared.clone(), multi_pv.max(1), tx));
        (
            Self {
                shared,
                worker: Some(worker),
            },
            rx,
        )
    }

    /// Retarget the worker. Never waits on the engine.
    pub fn set_position(&self, fen: impl Into<String>) -> Result<(), AnalysisError> {
        let fen = fen.into();
        parse_position(&fen)?;
        {
            let mut target = self.shared.lock();
            if target.stopped {
                return Err(AnalysisError::Engine("live analyzer stopped".into()));
            }
            target.fen = Some(fen);
            target.epoch += 1;
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Stop the worker and its engine, returning the worker's error if it died.
    pub async fn stop(mut self) -> Result<(), AnalysisError> {
        self.signal_stop();
        match self.worker.take() {
            Some(handle) => handle
                .await
                .map_err(|e| AnalysisError::Engine(format!("live worker failed: {e}")))?,
            None => Ok(()),
        }
    }

    fn signal_stop(&self) {
        self.shared.lock().stopped = true;
        self.shared.notify.notify_waiters();
    }
}

impl Drop for LiveAnalyzer {
    fn drop(&mut self) {
        // The worker stops its engine on the way out.
        self.signal_stop();
    }
}

async fn run_worker<E: Engine>(
    mut engine: E,
    shared: Arc<Shared>,
    multi_pv: u32,
    tx: mpsc::Sender<LiveUpdate>,
) -> Result<(), AnalysisError> {
    let result = serve(&mut engine, &shared, multi_pv, &tx).await;
    engine.stop().await;
    match &result {
        Ok(()) => info!("Live analysis stopped"),
        Err(e) => warn!("Live analysis failed: {}", e),
    }
    result
}

async fn serve<E: Engine>(
    engine: &mut E,
    shared: &Shared,
    multi_pv: u32,
    tx: &mpsc::Sender<LiveUpdate>,
) -> Result<(), AnalysisError> {
    let mut done_epoch = 0;
    loop {
        let Some((fen, epoch)) = next_target(shared, done_epoch).await else {
            return Ok(());
        };
        if engine.state() != SessionState::Ready {
            engine.start().await?;
        }

        debug!(%fen, epoch, "Live target");
        let watch = Watch { shared, epoch };
        let backlog = Backlog::default();
        let mut sink = |eval: EngineEval| {
            if tx.is_closed() {
                return false;
            }
            backlog.push(LiveUpdate {
                fen: fen.clone(),
                eval,
            });
            true
        };

        let mut stream = engine.analyse_stream(&fen, multi_pv, &mut sink, &watch);
        let forwarding = forward(&backlog, tx, &watch);
        tokio::pin!(forwarding);
        // Forward what is pending before letting the engine produce more.
        tokio::select! {
            biased;
            () = &mut forwarding => (&mut stream).await?,
            result = &mut stream => result?,
        }
        drop(stream);
        // A search that ended on its own still delivers its last frames.
        drain(&backlog, tx, &watch).await;

        if tx.is_closed() {
            return Ok(());
        }
        done_epoch = epoch;
    }
}

/// Frames not yet sent for one target, newest per line.
#[derive(Debug, Default)]
struct Backlog {
    frames: Mutex<BTreeMap<u32, LiveUpdate>>,
    ready: Notify,
}

impl Backlog {
    fn push(&self, update: LiveUpdate) {
        self.lock().insert(update.multipv_index(), update);
        self.ready.notify_one();
    }

    fn take_next(&self) -> Option<LiveUpdate> {
        self.lock().pop_first().map(|(_, update)| update)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u32, LiveUpdate>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Move frames from the backlog into the channel as capacity frees up.
/// Returns once the target is superseded or the receiver is gone.
async fn forward(backlog: &Backlog, tx: &mpsc::Sender<LiveUpdate>, watch: &Watch<'_>) {
    loop {
        // Reserve first so the frame picked is the newest one at send time.
        let Ok(permit) = tx.reserve().await else {
            return;
        };
        let update = loop {
            if let Some(update) = backlog.take_next() {
                break update;
            }
            backlog.ready.notified().await;
        };
        if watch.is_set() {
            return;
        }
        permit.send(update);
    }
}

async fn drain(backlog: &Backlog, tx: &mpsc::Sender<LiveUpdate>, watch: &Watch<'_>) {
    while let Some(update) = backlog.take_next() {
        tokio::select! {
            sent = tx.send(update) => {
                if sent.is_err() {
                    return;
                }
            }
            () = preempted(watch) => return,
        }
    }
}

/// Wait for a target newer than `done_epoch`; `None` once stopped.
async fn next_target(shared: &Shared, done_epoch: u64) -> Option<(String, u64)> {
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let target = shared.lock();
            if target.stopped {
                return None;
            }
            if let Some(fen) = target.fen.as_ref().filter(|_| target.epoch != done_epoch) {
                return Some((fen.clone(), target.epoch));
            }
        }
        notified.await;
    }
}
