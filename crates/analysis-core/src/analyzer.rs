//! Whole-game analysis: evaluate every position, normalize, classify, summarize.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use shakmaty::Color;
use tracing::{debug, info, warn};

use crate::analysis::{
    calculate_cp_loss, classify_move, explain, game_accuracy, move_accuracy, player_chance,
    win_probability_loss, MoveQuality,
};
use crate::book::OpeningBook;
use crate::cache::PositionCache;
use crate::engine::{Engine, EngineEval, EngineParams, SessionState};
use crate::error::AnalysisError;
use crate::game::{
    play_uci, side_to_move, uci_to_san, Classification, Game, GameSummary, SideSummary,
};
use crate::score::WhiteScore;

/// Cooperative cancellation flag, checked at every move boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress callback, invoked as `(move_index, move_count)` before each move.
pub type ProgressFn<'a> = dyn FnMut(usize, usize) + Send + 'a;

/// Main line of a position, already in White's perspective.
struct Evaluated {
    score: WhiteScore,
    pv: Vec<String>,
}

pub struct GameAnalyzer<E: Engine> {
    engine: E,
    params: EngineParams,
    cache: Option<PositionCache>,
    book: Option<Arc<dyn OpeningBook>>,
}

impl<E: Engine> GameAnalyzer<E> {
    pub fn new(engine: E, params: EngineParams) -> Self {
        Self {
            engine,
            params,
            cache: None,
            book: None,
        }
    }

    pub fn with_cache(mut self, cache: PositionCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_book(mut self, book: Arc<dyn OpeningBook>) -> Self {
        self.book = Some(book);
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    /// Analyze `game` in place.
    ///
    /// The engine is started on the first cache miss and stopped before this
    /// returns, whatever the outcome. If the returned future is dropped
    /// instead, the engine is aborted. On error the moves analyzed so far keep
    /// their fields and `game.summary` is left untouched.
    pub async fn analyze(
        &mut self,
        game: &mut Game,
        progress: Option<&mut ProgressFn<'_>>,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), AnalysisError> {
        self.params.validate()?;
        let mut pass = Pass {
            engine: &mut self.engine,
            params: &self.params,
            cache: self.cache.clone(),
            stopped: false,
        };
        let result = pass.run(game, self.book.as_deref(), progress, cancel).await;
        pass.finish().await;
        match &result {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => info!("Analysis cancelled"),
            Err(e) => warn!("Analysis failed: {}", e),
        }
        result
    }
}

/// One call to [`GameAnalyzer::analyze`]. Dropping it before [`Pass::finish`]
/// aborts the engine, so an abandoned analysis never leaves a search running.
struct Pass<'a, E: Engine> {
    engine: &'a mut E,
    params: &'a EngineParams,
    // Disabled for the rest of this analysis after the first failure.
    cache: Option<PositionCache>,
    stopped: bool,
}

impl<E: Engine> Pass<'_, E> {
    async fn finish(&mut self) {
        self.engine.stop().await;
        self.stopped = true;
    }

    async fn run(
        &mut self,
        game: &mut Game,
        book: Option<&dyn OpeningBook>,
        mut progress: Option<&mut ProgressFn<'_>>,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), AnalysisError> {
        let n = game.moves.len();
        let cancelled = || cancel.is_some_and(CancellationToken::is_cancelled);
        // Moves left unclassified and out of the summary.
        let mut skipped = vec![false; n];

        info!(moves = n, "Starting analysis");

        for i in 0..n {
            if let Some(report) = progress.as_deref_mut() {
                report(i, n);
            }
            if cancelled() {
                return Err(AnalysisError::Cancelled);
            }

            let fen = game.moves[i].position_before.clone();
            let side = match side_to_move(&fen) {
                Ok(side) => side,
                Err(e) => {
                    warn!(ply = game.moves[i].ply, "Skipping move: {}", e);
                    skipped[i] = true;
                    continue;
                }
            };
            // The position is still evaluated: it is the previous move's outcome.
            if let Err(e) = play_uci(&fen, &game.moves[i].uci) {
                warn!(ply = game.moves[i].ply, "Skipping move: {}", e);
                skipped[i] = true;
            }

            let Some(eval) = self.evaluate(&fen).await? else {
                debug!(ply = game.moves[i].ply, "No evaluation for position");
                continue;
            };
            let evaluated = normalize(eval, side);
            let record = &mut game.moves[i];
            record.best_move = evaluated.pv.first().cloned();
            record.principal_variation = evaluated.pv;
            record.eval_before = Some(evaluated.score);
        }

        if cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        let eval_after_last = match game.terminal_position() {
            Ok(Some(fen)) => match side_to_move(&fen) {
                Ok(side) => self
                    .evaluate(&fen)
                    .await?
                    .map(|eval| normalize(eval, side).score),
                Err(_) => None,
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Cannot reach final position: {}", e);
                None
            }
        };

        for i in 0..n {
            game.moves[i].eval_after = match game.moves.get(i + 1) {
                Some(next) => next.eval_before,
                None => eval_after_last,
            };
        }

        for (record, skip) in game.moves.iter_mut().zip(&skipped) {
            if *skip {
                continue;
            }
            let (Some(before), Some(after), Ok(mover)) =
                (record.eval_before, record.eval_after, record.mover())
            else {
                continue;
            };

            let w_before = before.win_probability();
            let w_after = after.win_probability();
            let p_before = player_chance(w_before, mover);
            let p_after = player_chance(w_after, mover);
            let quality = MoveQuality {
                played_best: record.is_best(),
                wpl: win_probability_loss(w_before, w_after, mover),
                p_before,
                p_after,
            };

            record.win_chance_before = Some(w_before);
            record.win_chance_after = Some(w_after);
            record.accuracy = Some(move_accuracy(p_before, p_after));
            record.cp_loss = calculate_cp_loss(before, after, mover);
            record.classification = classify_move(quality);

            let best_san = record
                .best_move
                .as_deref()
                .and_then(|best| uci_to_san(&record.position_before, best));
            record.explanation = explain(
                record.classification,
                best_san.as_deref(),
                before,
                after,
                mover,
            );
        }

        if let Some(book) = book {
            mark_book_moves(book, game).await;
        }

        let summary = summarize(game, &skipped);
        info!(
            white_accuracy = %format!("{:.1}", summary.white.accuracy),
            black_accuracy = %format!("{:.1}", summary.black.accuracy),
            opening = game.opening.as_deref().unwrap_or("-"),
            "Analysis complete"
        );
        game.summary = Some(summary);
        Ok(())
    }

    /// Main line for `fen`, from the cache when possible.
    async fn evaluate(&mut self, fen: &str) -> Result<Option<EngineEval>, AnalysisError> {
        if let Some(store) = self.cache.as_ref() {
            match store.get(fen, self.params) {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => {}
                Err(e) => {
                    warn!("Position cache disabled for this analysis: {}", e);
                    self.cache = None;
                }
            }
        }

        if self.engine.state() != SessionState::Ready {
            self.engine.start().await?;
            self.engine.configure(&self.params.options).await?;
        }

        let lines = self
            .engine
            .analyse(fen, self.params.limit(), self.params.multi_pv)
            .await?;
        let Some(main) = lines
            .iter()
            .find(|line| line.multipv == 1)
            .or(lines.first())
            .cloned()
        else {
            return Ok(None);
        };

        if let Some(store) = self.cache.as_ref() {
            if let Err(e) = store.put(fen, self.params, &main) {
                warn!("Position cache disabled for this analysis: {}", e);
                self.cache = None;
            }
        }
        Ok(Some(main))
    }
}

impl<E: Engine> Drop for Pass<'_, E> {
    fn drop(&mut self) {
        if !self.stopped {
            warn!("Analysis abandoned, aborting engine");
            self.engine.abort();
        }
    }
}

/// The single point where engine scores become White-perspective.
fn normalize(eval: EngineEval, side_to_move: Color) -> Evaluated {
    Evaluated {
        score: eval.score.for_white(side_to_move),
        pv: eval.pv,
    }
}

/// Relabel the leading run of theory moves as `Book` and record the deepest
/// opening name reached.
async fn mark_book_moves(book: &dyn OpeningBook, game: &mut Game) {
    let mut in_book = 0;
    for record in game.moves.iter_mut() {
        if !book.is_book(&record.position_before, &record.uci).await {
            break;
        }
        record.classification = Classification::Book;
        record.explanation = None;
        if let Some(name) = book.opening_name(&record.position_before, &record.uci).await {
            game.opening = Some(name);
        }
        in_book += 1;
    }
    debug!(book_moves = in_book, "Book walk finished");
}

fn summarize(game: &Game, skipped: &[bool]) -> GameSummary {
    let mut summary = GameSummary::default();
    for color in [Color::White, Color::Black] {
        let mut side = SideSummary::default();
        let mut accuracies = Vec::new();
        let mut total_cp_loss: i64 = 0;

        for (record, skip) in game.moves.iter().zip(skipped) {
            if *skip || record.mover().ok() != Some(color) {
                continue;
            }
            side.move_count += 1;
            side.classifications.add(record.classification);
            if let Some(accuracy) = record.accuracy {
                accuracies.push(accuracy);
            }
            if let Some(loss) = record.cp_loss {
                total_cp_loss += i64::from(loss);
            }
        }

        side.accuracy = game_accuracy(&accuracies);
        if side.move_count > 0 {
            side.average_cp_loss = total_cp_loss as f64 / f64::from(side.move_count);
        }
        match color {
            Color::White => summary.white = side,
            Color::Black => summary.black = side,
        }
    }
    summary
}
