/// Move accuracy and classification — pure functions only
/// (No Engine/Cache/Game dependencies)
use shakmaty::Color;

use crate::game::Classification;
use crate::score::{Score, WhiteScore};

/// Classification thresholds (player win-probability loss, 0-1)
const THRESHOLD_BLUNDER: f64 = 0.20;
const THRESHOLD_MISTAKE: f64 = 0.10;
const THRESHOLD_INACCURACY: f64 = 0.05;
const THRESHOLD_GOOD: f64 = 0.02;
const THRESHOLD_EXCELLENT: f64 = 0.005;

/// Missed win: clearly winning before the move, unclear after it.
const MISSED_WIN_BEFORE: f64 = 0.80;
const MISSED_WIN_AFTER: f64 = 0.60;

/// Accuracy curve fitted against win-percent loss.
const ACCURACY_SCALE: f64 = 103.1668;
const ACCURACY_DECAY: f64 = 0.04354;
const ACCURACY_OFFSET: f64 = 3.1669;

/// Keeps the harmonic mean finite when a move scores 0.
const HARMONIC_EPSILON: f64 = 0.001;

/// Win-probability loss for `mover`, given White's win chances around the move.
pub fn win_probability_loss(white_before: f64, white_after: f64, mover: Color) -> f64 {
    let loss = match mover {
        Color::White => white_before - white_after,
        Color::Black => white_after - white_before,
    };
    loss.max(0.0)
}

/// A player's win chance from White's.
pub fn player_chance(white_chance: f64, player: Color) -> f64 {
    match player {
        Color::White => white_chance,
        Color::Black => 1.0 - white_chance,
    }
}

/// Accuracy of one move from the mover's win probability before and after it.
pub fn move_accuracy(p_before: f64, p_after: f64) -> f64 {
    let delta = ((p_before - p_after) * 100.0).max(0.0);
    let accuracy = ACCURACY_SCALE * (-ACCURACY_DECAY * delta).exp() - ACCURACY_OFFSET;
    accuracy.clamp(0.0, 100.0)
}

/// Mean of the arithmetic and harmonic means of per-move accuracies.
pub fn game_accuracy(accuracies: &[f64]) -> f64 {
    if accuracies.is_empty() {
        return 0.0;
    }
    let n = accuracies.len() as f64;
    let arithmetic = accuracies.iter().sum::<f64>() / n;
    let harmonic = n / accuracies
        .iter()
        .map(|a| 1.0 / (a + HARMONIC_EPSILON))
        .sum::<f64>();
    ((arithmetic + harmonic) / 2.0).clamp(0.0, 100.0)
}

/// Centipawn loss for the mover. `None` when either side is a mate score.
pub fn calculate_cp_loss(before: WhiteScore, after: WhiteScore, mover: Color) -> Option<i32> {
    let (Score::Cp(before), Score::Cp(after)) = (before.0, after.0) else {
        return None;
    };
    let loss = match mover {
        Color::White => before - after,
        Color::Black => after - before,
    };
    Some(loss.max(0))
}

/// Inputs to the classifier, all from the mover's perspective.
#[derive(Debug, Clone, Copy)]
pub struct MoveQuality {
    pub played_best: bool,
    /// Win-probability loss, clamped at 0.
    pub wpl: f64,
    pub p_before: f64,
    pub p_after: f64,
}

pub fn classify_move(quality: MoveQuality) -> Classification {
    let label = if quality.played_best {
        Classification::Best
    } else {
        classify_loss(quality.wpl)
    };

    if is_missed_win(quality.p_before, quality.p_after) {
        return Classification::Miss;
    }
    label
}

pub fn classify_loss(wpl: f64) -> Classification {
    if wpl >= THRESHOLD_BLUNDER {
        Classification::Blunder
    } else if wpl >= THRESHOLD_MISTAKE {
        Classification::Mistake
    } else if wpl >= THRESHOLD_INACCURACY {
        Classification::Inaccuracy
    } else if wpl >= THRESHOLD_GOOD {
        Classification::Good
    } else if wpl >= THRESHOLD_EXCELLENT {
        Classification::Excellent
    } else {
        Classification::Best
    }
}

pub fn is_missed_win(p_before: f64, p_after: f64) -> bool {
    p_before > MISSED_WIN_BEFORE && p_after < MISSED_WIN_AFTER
}

/// Short human-readable note for moves that lost ground.
pub fn explain(
    classification: Classification,
    best_san: Option<&str>,
    before: WhiteScore,
    after: WhiteScore,
    mover: Color,
) -> Option<String> {
    let lead = match classification {
        Classification::Inaccuracy => "Inaccuracy",
        Classification::Mistake => "Mistake",
        Classification::Blunder => "Blunder",
        Classification::Miss => "Missed win",
        _ => return None,
    };
    let swing = format!(
        "{} -> {}",
        before.for_player(mover),
        after.for_player(mover)
    );
    Some(match best_san {
        Some(best) => format!("{lead}. {best} was best ({swing})."),
        None => format!("{lead} ({swing})."),
    })
}
