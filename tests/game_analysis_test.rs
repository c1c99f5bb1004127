//! Integration tests for whole-game analysis against a scripted engine.
//!
//! Scripts are written in White's perspective and converted to the engine's
//! side-to-move perspective by `common::scripted_engine`, so every test also
//! exercises score normalization.

mod common;

use analysis_core::engine::mock::MockEngine;
use analysis_core::engine::{EngineParams, SessionState};
use analysis_core::shakmaty::Color;
use analysis_core::{
    AnalysisError, CancellationToken, Classification, Game, GameAnalyzer, Score, WhiteScore,
};

use common::{constant_engine, scripted_engine, shuffle_moves, KNIGHT_RAID, START};

fn params() -> EngineParams {
    EngineParams {
        depth_limit: Some(12),
        ..EngineParams::default()
    }
}

async fn analyze(engine: MockEngine, game: &mut Game) -> Result<(), AnalysisError> {
    GameAnalyzer::new(engine, params())
        .analyze(game, None, None)
        .await
}

// ---------------------------------------------------------------------------
// Classification scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_best_play_keeps_full_accuracy() {
    let mut game = Game::from_uci_moves(None, &["e2e4", "e7e5", "g1f3"]).unwrap();
    let engine = constant_engine(&game, Score::Cp(30));
    analyze(engine, &mut game).await.unwrap();

    for record in &game.moves {
        assert_eq!(record.classification, Classification::Best, "{}", record.san);
        assert_eq!(record.eval_before, Some(WhiteScore(Score::Cp(30))));
        assert_eq!(record.eval_after, Some(WhiteScore(Score::Cp(30))));
        assert_eq!(record.cp_loss, Some(0));
        assert_eq!(record.explanation, None);
    }
    let summary = game.summary.unwrap();
    assert!(summary.white.accuracy > 99.0);
    assert!(summary.black.accuracy > 99.0);
    assert_eq!(summary.white.average_cp_loss, 0.0);
    assert_eq!(summary.black.average_cp_loss, 0.0);
    assert_eq!(summary.white.classifications.best, 2);
    assert_eq!(summary.black.classifications.best, 1);
}

#[tokio::test]
async fn test_single_blunder() {
    let mut game = Game::from_uci_moves(None, &KNIGHT_RAID).unwrap();
    // Even-ish until 4.Nxf7??, lost for White afterwards. Nf3 retreat was best.
    let evals: Vec<_> = (0..game.moves.len())
        .map(|i| match i {
            0..=5 => (Score::Cp(50), None),
            6 => (Score::Cp(50), Some("g5f3")),
            _ => (Score::Cp(-400), None),
        })
        .collect();
    let engine = scripted_engine(&game, &evals, Score::Cp(-400));
    analyze(engine, &mut game).await.unwrap();

    let blunder = &game.moves[6];
    assert_eq!(blunder.san, "Nxf7");
    assert_eq!(blunder.move_number, 4);
    assert_eq!(blunder.classification, Classification::Blunder);
    let wpl = blunder.win_chance_before.unwrap() - blunder.win_chance_after.unwrap();
    assert!(wpl > 0.20 && wpl < 0.50, "wpl = {wpl}");
    assert_eq!(blunder.cp_loss, Some(450));
    assert_eq!(
        blunder.explanation.as_deref(),
        Some("Blunder. Nf3 was best (+0.50 -> -4.00).")
    );

    for (i, record) in game.moves.iter().enumerate().filter(|(i, _)| *i != 6) {
        assert_eq!(record.classification, Classification::Best, "ply {}", i + 1);
    }

    let summary = game.summary.unwrap();
    assert_eq!(summary.white.classifications.blunder, 1);
    assert!(summary.white.accuracy < summary.black.accuracy - 10.0);
    assert!((summary.white.average_cp_loss - 75.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_missed_win() {
    let mut moves = KNIGHT_RAID.to_vec();
    moves.push("b1c3");
    let mut game = Game::from_uci_moves(None, &moves).unwrap();

    // White is winning throughout; on move 7 the winning capture is ignored.
    let mut evals = vec![(Score::Cp(900), None); game.moves.len()];
    evals[12] = (Score::Cp(900), Some("d3e4"));
    let engine = scripted_engine(&game, &evals, Score::Cp(50));
    analyze(engine, &mut game).await.unwrap();

    let miss = &game.moves[12];
    assert_eq!(miss.move_number, 7);
    assert!(miss.win_chance_before.unwrap() > 0.95);
    assert!(miss.win_chance_after.unwrap() < 0.60);
    assert_eq!(miss.classification, Classification::Miss);
    assert_eq!(
        miss.explanation.as_deref(),
        Some("Missed win. dxe4 was best (+9.00 -> +0.50).")
    );
    assert_eq!(game.summary.unwrap().white.classifications.miss, 1);
}

// ---------------------------------------------------------------------------
// Perspective
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_black_eval_is_stored_from_white_side() {
    let mut game = Game::from_uci_moves(None, &["e2e4", "e7e5"]).unwrap();
    let engine = MockEngine::new()
        .with_eval(START, Score::Cp(-150), &["e2e4"])
        .with_eval(&game.moves[1].position_before, Score::Cp(150), &["e7e5"]);
    analyze(engine, &mut game).await.unwrap();

    assert_eq!(game.moves[0].eval_before, Some(WhiteScore(Score::Cp(-150))));
    assert_eq!(game.moves[1].eval_before, Some(WhiteScore(Score::Cp(-150))));
    assert_eq!(game.moves[0].eval_after, game.moves[1].eval_before);
}

#[tokio::test]
async fn test_game_starting_with_black_to_move() {
    let fen = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1";
    let mut game = Game::from_uci_moves(Some(fen), &["c7c5", "g1f3", "d7d6"]).unwrap();
    assert_eq!(game.moves[0].mover().unwrap(), Color::Black);
    assert_eq!(game.moves[0].move_number, 1);
    assert_eq!(game.moves[1].move_number, 2);

    let evals = [
        (Score::Cp(35), None),
        (Score::Cp(35), None),
        (Score::Cp(35), Some("b8c6")),
    ];
    let engine = scripted_engine(&game, &evals, Score::Cp(120));
    analyze(engine, &mut game).await.unwrap();

    for record in &game.moves {
        assert_eq!(record.eval_before, Some(WhiteScore(Score::Cp(35))));
    }
    assert_eq!(game.moves[2].eval_after, Some(WhiteScore(Score::Cp(120))));
    assert_eq!(game.moves[2].cp_loss, Some(85));
    assert_ne!(game.moves[2].classification, Classification::Best);

    let summary = game.summary.unwrap();
    assert_eq!(summary.black.move_count, 2);
    assert_eq!(summary.white.move_count, 1);
    assert_eq!(summary.white.classifications.best, 1);
}

#[tokio::test]
async fn test_black_delivers_mate() {
    // 1.f3 e5 2.g4?? Qh4#
    let mut game = Game::from_uci_moves(None, &["f2f3", "e7e5", "g2g4", "d8h4"]).unwrap();
    let evals = [
        (Score::Cp(0), None),
        (Score::Cp(0), None),
        (Score::Cp(0), Some("b1c3")),
        (Score::Mate(-1), None),
    ];
    // White is checkmated in the final position; the engine reports mate 0.
    let last = game.terminal_position().unwrap().unwrap();
    let engine = scripted_engine(&game, &evals, Score::Cp(0)).with_eval(&last, Score::Mate(0), &[]);
    analyze(engine, &mut game).await.unwrap();

    let blunder = &game.moves[2];
    assert_eq!(blunder.eval_after, Some(WhiteScore(Score::Mate(-1))));
    assert_eq!(blunder.win_chance_after, Some(0.0));
    assert_eq!(blunder.classification, Classification::Blunder);
    assert_eq!(blunder.cp_loss, None);

    let mate = &game.moves[3];
    assert_eq!(mate.san, "Qh4#");
    assert_eq!(mate.eval_before, Some(WhiteScore(Score::Mate(-1))));
    assert_eq!(mate.eval_after, Some(WhiteScore(Score::Mate(-1))));
    assert_eq!(mate.classification, Classification::Best);
    assert!(mate.accuracy.unwrap() > 99.0);

    // Mate scores stay out of the centipawn average.
    let summary = game.summary.unwrap();
    assert_eq!(summary.white.average_cp_loss, 0.0);
}

#[tokio::test]
async fn test_white_delivers_mate() {
    // 1.e4 e5 2.Bc4 Nc6 3.Qh5 Nf6?? 4.Qxf7#
    let moves = ["e2e4", "e7e5", "f1c4", "b8c6", "d1h5", "g8f6", "h5f7"];
    let mut game = Game::from_uci_moves(None, &moves).unwrap();
    let mut evals = vec![(Score::Cp(0), None); moves.len()];
    evals[5] = (Score::Cp(0), Some("g7g6"));
    evals[6] = (Score::Mate(1), None);
    let last = game.terminal_position().unwrap().unwrap();
    let engine = scripted_engine(&game, &evals, Score::Cp(0)).with_eval(&last, Score::Mate(0), &[]);
    analyze(engine, &mut game).await.unwrap();

    let blunder = &game.moves[5];
    assert!(blunder.eval_after.unwrap().win_probability() == 1.0);
    assert_eq!(blunder.classification, Classification::Blunder);

    let mate = &game.moves[6];
    assert_eq!(mate.san, "Qxf7#");
    assert_eq!(mate.eval_before, Some(WhiteScore(Score::Mate(1))));
    assert_eq!(mate.eval_after, Some(WhiteScore(Score::Mate(1))));
    assert_eq!(mate.classification, Classification::Best);
    // Sign of eval_before tracks who is better.
    assert!(game.moves.iter().all(|m| m.eval_before.unwrap().win_probability() >= 0.5));
}

// ---------------------------------------------------------------------------
// Failure semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_after_third_progress_callback() {
    let mut game = Game::from_uci_moves(None, &shuffle_moves(40)).unwrap();
    let engine = constant_engine(&game, Score::Cp(10));
    let probe = engine.probe();
    let token = CancellationToken::new();

    let mut seen = Vec::new();
    let mut report = |i: usize, n: usize| {
        seen.push((i, n));
        if seen.len() == 3 {
            token.cancel();
        }
    };
    let err = GameAnalyzer::new(engine, params())
        .analyze(&mut game, Some(&mut report), Some(&token))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(seen, vec![(0, 40), (1, 40), (2, 40)]);
    assert_eq!(probe.analyse_calls(), 2);
    assert_eq!(probe.state(), SessionState::Terminated);
    assert_eq!(probe.stops(), 1);

    assert!(game.moves[0].eval_before.is_some());
    assert!(game.moves[1].eval_before.is_some());
    assert!(game.moves[4..].iter().all(|m| {
        m.classification == Classification::Book && m.eval_before.is_none()
    }));
    assert_eq!(game.summary, None);
}

#[tokio::test]
async fn test_engine_death_keeps_partial_results() {
    let mut game = Game::from_uci_moves(None, &shuffle_moves(6)).unwrap();
    let engine = constant_engine(&game, Score::Cp(10)).failing_after(3);
    let probe = engine.probe();
    let err = analyze(engine, &mut game).await.unwrap_err();

    assert!(matches!(err, AnalysisError::Engine(_)));
    assert!(game.moves[..3].iter().all(|m| m.eval_before.is_some()));
    assert!(game.moves[3..].iter().all(|m| m.eval_before.is_none()));
    assert_eq!(game.summary, None);
    assert_eq!(probe.state(), SessionState::Terminated);
    assert_eq!(probe.stops(), 1);
}

#[tokio::test]
async fn test_engine_unavailable() {
    let mut game = Game::from_uci_moves(None, &["e2e4"]).unwrap();
    let engine = MockEngine::new().failing_start();
    let err = analyze(engine, &mut game).await.unwrap_err();
    assert!(matches!(err, AnalysisError::EngineUnavailable(_)));
    assert!(!err.is_recoverable());
    assert_eq!(game.moves[0].eval_before, None);
}

#[tokio::test]
async fn test_empty_game() {
    let mut game = Game::default();
    let engine = MockEngine::new();
    let probe = engine.probe();
    analyze(engine, &mut game).await.unwrap();
    let summary = game.summary.unwrap();
    assert_eq!(summary.white.accuracy, 0.0);
    assert_eq!(summary.black.move_count, 0);
    assert_eq!(probe.starts(), 0);
}
