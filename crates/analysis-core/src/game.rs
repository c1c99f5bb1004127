//! Game and move records consumed and annotated by the analyzer.

use serde::{Deserialize, Serialize};
use shakmaty::fen::Fen;
use shakmaty::san::San;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Position};

use crate::error::AnalysisError;
use crate::score::WhiteScore;

/// Move quality label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Brilliant,
    Great,
    Best,
    Excellent,
    Good,
    #[default]
    Book,
    Inaccuracy,
    Mistake,
    Miss,
    Blunder,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Brilliant => "brilliant",
            Classification::Great => "great",
            Classification::Best => "best",
            Classification::Excellent => "excellent",
            Classification::Good => "good",
            Classification::Book => "book",
            Classification::Inaccuracy => "inaccuracy",
            Classification::Mistake => "mistake",
            Classification::Miss => "miss",
            Classification::Blunder => "blunder",
        }
    }
}

/// A single move plus the analysis slots the analyzer fills in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub san: String,
    pub uci: String,
    /// Full-move number as printed in PGN.
    pub move_number: u32,
    /// 1-based ply within this game record.
    pub ply: u32,
    /// FEN of the position in which `uci` is played.
    pub position_before: String,

    pub eval_before: Option<WhiteScore>,
    pub eval_after: Option<WhiteScore>,
    pub best_move: Option<String>,
    pub principal_variation: Vec<String>,
    /// White's win probability before and after the move.
    pub win_chance_before: Option<f64>,
    pub win_chance_after: Option<f64>,
    /// Mover's accuracy for this move, 0-100.
    pub accuracy: Option<f64>,
    /// Mover's centipawn loss, only when both sides of the move are cp scores.
    pub cp_loss: Option<i32>,
    pub classification: Classification,
    pub explanation: Option<String>,
}

impl MoveRecord {
    pub fn new(
        san: impl Into<String>,
        uci: impl Into<String>,
        move_number: u32,
        ply: u32,
        position_before: impl Into<String>,
    ) -> Self {
        Self {
            san: san.into(),
            uci: uci.into(),
            move_number,
            ply,
            position_before: position_before.into(),
            eval_before: None,
            eval_after: None,
            best_move: None,
            principal_variation: Vec::new(),
            win_chance_before: None,
            win_chance_after: None,
            accuracy: None,
            cp_loss: None,
            classification: Classification::default(),
            explanation: None,
        }
    }

    /// The side playing this move.
    pub fn mover(&self) -> Result<Color, AnalysisError> {
        side_to_move(&self.position_before)
    }

    /// Whether the engine's preferred move was played.
    pub fn is_best(&self) -> bool {
        self.best_move.as_deref() == Some(self.uci.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameMetadata {
    pub white: String,
    pub black: String,
    pub result: Option<String>,
    pub date: Option<String>,
    pub event: Option<String>,
    /// Where the game came from (file, lichess, chess.com, ...).
    pub source: Option<String>,
}

/// Per-classification counts for one side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationCounts {
    pub brilliant: u32,
    pub great: u32,
    pub best: u32,
    pub excellent: u32,
    pub good: u32,
    pub book: u32,
    pub inaccuracy: u32,
    pub mistake: u32,
    pub miss: u32,
    pub blunder: u32,
}

impl ClassificationCounts {
    pub fn add(&mut self, classification: Classification) {
        match classification {
            Classification::Brilliant => self.brilliant += 1,
            Classification::Great => self.great += 1,
            Classification::Best => self.best += 1,
            Classification::Excellent => self.excellent += 1,
            Classification::Good => self.good += 1,
            Classification::Book => self.book += 1,
            Classification::Inaccuracy => self.inaccuracy += 1,
            Classification::Mistake => self.mistake += 1,
            Classification::Miss => self.miss += 1,
            Classification::Blunder => self.blunder += 1,
        }
    }

    pub fn get(&self, classification: Classification) -> u32 {
        match classification {
            Classification::Brilliant => self.brilliant,
            Classification::Great => self.great,
            Classification::Best => self.best,
            Classification::Excellent => self.excellent,
            Classification::Good => self.good,
            Classification::Book => self.book,
            Classification::Inaccuracy => self.inaccuracy,
            Classification::Mistake => self.mistake,
            Classification::Miss => self.miss,
            Classification::Blunder => self.blunder,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideSummary {
    pub classifications: ClassificationCounts,
    pub average_cp_loss: f64,
    pub accuracy: f64,
    pub move_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameSummary {
    pub white: SideSummary,
    pub black: SideSummary,
}

impl GameSummary {
    pub fn side(&self, color: Color) -> &SideSummary {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub metadata: GameMetadata,
    /// Deepest opening name reached while the game was in book.
    pub opening: Option<String>,
    pub moves: Vec<MoveRecord>,
    pub summary: Option<GameSummary>,
}

impl Game {
    /// Build a game by replaying long-algebraic moves from `start_fen`
    /// (the standard start position when `None`).
    pub fn from_uci_moves<S: AsRef<str>>(
        start_fen: Option<&str>,
        moves: &[S],
    ) -> Result<Self, AnalysisError> {
        let mut pos = match start_fen {
            Some(fen) => parse_position(fen)?,
            None => Chess::default(),
        };

        let mut records = Vec::with_capacity(moves.len());
        for (i, uci) in moves.iter().enumerate() {
            let uci = uci.as_ref();
            let fen_before = position_fen(&pos);
            let mv = parse_move(&pos, uci)?;
            let san = San::from_move(&pos, mv.clone()).to_string();
            let move_number = pos.fullmoves().get();

            pos = pos
                .play(mv)
                .map_err(|e| AnalysisError::InvalidInput(format!("illegal move {uci}: {e}")))?;

            records.push(MoveRecord::new(san, uci, move_number, i as u32 + 1, fen_before));
        }

        Ok(Self {
            moves: records,
            ..Self::default()
        })
    }

    /// The position reached after the last move, if the game has moves.
    pub fn terminal_position(&self) -> Result<Option<String>, AnalysisError> {
        let Some(last) = self.moves.last() else {
            return Ok(None);
        };
        play_uci(&last.position_before, &last.uci).map(Some)
    }

    /// Check that every move replays into the next move's starting position.
    pub fn verify_replay(&self) -> Result<(), AnalysisError> {
        for pair in self.moves.windows(2) {
            let reached = play_uci(&pair[0].position_before, &pair[0].uci)?;
            if reached != pair[1].position_before {
                return Err(AnalysisError::InvalidInput(format!(
                    "ply {}: {} does not lead to the next position",
                    pair[0].ply, pair[0].uci
                )));
            }
        }
        Ok(())
    }
}

/// Parse a 6-field FEN into a legal position.
pub fn parse_position(fen: &str) -> Result<Chess, AnalysisError> {
    let parsed: Fen = fen
        .parse()
        .map_err(|e| AnalysisError::InvalidInput(format!("invalid FEN {fen}: {e}")))?;
    parsed
        .into_position::<Chess>(CastlingMode::Standard)
        .map_err(|e| AnalysisError::InvalidInput(format!("illegal position {fen}: {e}")))
}

/// Canonical FEN for a position.
pub fn position_fen(pos: &Chess) -> String {
    Fen::from_position(pos, EnPassantMode::Legal).to_string()
}

pub fn side_to_move(fen: &str) -> Result<Color, AnalysisError> {
    Ok(parse_position(fen)?.turn())
}

/// Apply a long-algebraic move to a FEN, returning the resulting FEN.
pub fn play_uci(fen: &str, uci: &str) -> Result<String, AnalysisError> {
    let pos = parse_position(fen)?;
    let mv = parse_move(&pos, uci)?;
    let next = pos
        .play(mv)
        .map_err(|e| AnalysisError::InvalidInput(format!("illegal move {uci}: {e}")))?;
    Ok(position_fen(&next))
}

/// SAN for a long-algebraic move, if it is legal in `fen`.
pub fn uci_to_san(fen: &str, uci: &str) -> Option<String> {
    let pos = parse_position(fen).ok()?;
    let mv = parse_move(&pos, uci).ok()?;
    Some(San::from_move(&pos, mv).to_string())
}

fn parse_move(pos: &Chess, uci: &str) -> Result<shakmaty::Move, AnalysisError> {
    let uci_move: UciMove = uci
        .parse()
        .map_err(|_| AnalysisError::InvalidInput(format!("malformed move: {uci}")))?;
    uci_move
        .to_move(pos)
        .map_err(|_| AnalysisError::InvalidInput(format!("illegal move: {uci}")))
}
