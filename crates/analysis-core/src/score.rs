//! Evaluation scores and the win-probability model.
//!
//! Engines report scores from the side to move's point of view. Everything
//! stored on a move is from White's point of view. The two perspectives are
//! separate types so a score cannot cross the boundary without going through
//! [`EngineScore::for_white`].

use std::fmt;

use serde::{Deserialize, Serialize};
use shakmaty::Color;

/// Slope of the centipawn -> win probability logistic curve.
const WIN_PROBABILITY_SLOPE: f64 = 0.003_682_08;

/// Beyond this exponent magnitude `exp` stops being meaningful; saturate instead.
const MAX_EXPONENT: f64 = 700.0;

/// A raw evaluation, centipawns or signed mate distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Score {
    Cp(i32),
    Mate(i32),
}

impl Score {
    pub fn cp(&self) -> Option<i32> {
        match self {
            Score::Cp(cp) => Some(*cp),
            Score::Mate(_) => None,
        }
    }

    pub fn mate(&self) -> Option<i32> {
        match self {
            Score::Cp(_) => None,
            Score::Mate(m) => Some(*m),
        }
    }

    /// Flip perspective.
    pub fn negate(&self) -> Score {
        match self {
            Score::Cp(cp) => Score::Cp(-cp),
            Score::Mate(m) => Score::Mate(-m),
        }
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Score::Cp(cp) => write!(f, "{:+.2}", *cp as f64 / 100.0),
            Score::Mate(m) if *m >= 0 => write!(f, "+M{m}"),
            Score::Mate(m) => write!(f, "-M{}", m.abs()),
        }
    }
}

/// Score from the side to move's perspective, as the engine reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineScore(pub Score);

/// Score from White's perspective. Positive favors White.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WhiteScore(pub Score);

impl EngineScore {
    /// Normalize to White's perspective given the side to move in the
    /// evaluated position.
    ///
    /// `Mate(0)` means the side to move is already checkmated. Its sign would
    /// be lost on negation, so it becomes a one-ply mate against the mated
    /// side, which keeps the decided result.
    pub fn for_white(self, side_to_move: Color) -> WhiteScore {
        let score = match self.0 {
            Score::Mate(0) => Score::Mate(-1),
            other => other,
        };
        match side_to_move {
            Color::White => WhiteScore(score),
            Color::Black => WhiteScore(score.negate()),
        }
    }
}

impl WhiteScore {
    /// White's win probability in [0, 1].
    pub fn win_probability(&self) -> f64 {
        match self.0 {
            Score::Mate(m) if m > 0 => 1.0,
            Score::Mate(m) if m < 0 => 0.0,
            Score::Mate(_) => 0.5,
            Score::Cp(cp) => cp_win_probability(cp),
        }
    }

    /// Score from `color`'s perspective.
    pub fn for_player(&self, color: Color) -> Score {
        match color {
            Color::White => self.0,
            Color::Black => self.0.negate(),
        }
    }
}

impl fmt::Display for WhiteScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// White's win probability for an optional evaluation; unknown is even.
pub fn win_chance(eval: Option<WhiteScore>) -> f64 {
    eval.map(|e| e.win_probability()).unwrap_or(0.5)
}

fn cp_win_probability(cp: i32) -> f64 {
    let exponent = -WIN_PROBABILITY_SLOPE * cp as f64;
    if exponent > MAX_EXPONENT {
        return 0.0;
    }
    if exponent < -MAX_EXPONENT {
        return 1.0;
    }
    let p = 0.5 + 0.5 * (2.0 / (1.0 + exponent.exp()) - 1.0);
    p.clamp(0.0, 1.0)
}
