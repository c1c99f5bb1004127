#![allow(dead_code)]

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use analysis_core::engine::mock::MockEngine;
use analysis_core::game::side_to_move;
use analysis_core::shakmaty::Color;
use analysis_core::{Game, Score};

pub const START: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// 1.e4 e5 2.Nh3 Nc6 3.Ng5 Nf6 4.Nxf7 Kxf7 5.d3 d5 6.Be2 dxe4
pub const KNIGHT_RAID: [&str; 12] = [
    "e2e4", "e7e5", "g1h3", "b8c6", "h3g5", "g8f6", "g5f7", "e8f7", "d2d3", "d7d5", "f1e2",
    "d5e4",
];

/// Generate a unique suffix based on timestamp to avoid collisions.
pub fn unique_suffix() -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{}", ts % 1_000_000_000)
}

/// A fresh cache file path under the system temp dir.
pub fn temp_cache_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("game-review-{name}-{}", unique_suffix()))
        .join("positions.sqlite3")
}

/// `n` plies of knights hopping back and forth.
pub fn shuffle_moves(n: usize) -> Vec<&'static str> {
    ["g1f3", "g8f6", "f3g1", "f6g8"]
        .into_iter()
        .cycle()
        .take(n)
        .collect()
}

/// Per-position script entry: White-perspective score and the engine's move
/// (`None` means the move actually played).
pub type Scripted<'a> = (Score, Option<&'a str>);

fn engine_perspective(fen: &str, white: Score) -> Score {
    match side_to_move(fen).unwrap() {
        Color::White => white,
        Color::Black => white.negate(),
    }
}

/// Script a mock engine from White-perspective evaluations of every
/// `position_before` plus the final position.
pub fn scripted_engine(game: &Game, evals: &[Scripted<'_>], terminal: Score) -> MockEngine {
    assert_eq!(evals.len(), game.moves.len());
    let mut engine = MockEngine::new().with_fallback(None);
    for (record, (white, best)) in game.moves.iter().zip(evals) {
        let best = best.unwrap_or(record.uci.as_str());
        engine = engine.with_eval(
            &record.position_before,
            engine_perspective(&record.position_before, *white),
            &[best],
        );
    }
    let last = game.terminal_position().unwrap().unwrap();
    engine.with_eval(&last, engine_perspective(&last, terminal), &[])
}

/// Every position evaluated at `white` with the played move best.
pub fn constant_engine(game: &Game, white: Score) -> MockEngine {
    let evals = vec![(white, None); game.moves.len()];
    scripted_engine(game, &evals, white)
}
