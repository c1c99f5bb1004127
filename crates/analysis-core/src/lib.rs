pub use shakmaty;

pub mod analysis;
pub mod analyzer;
pub mod book;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod game;
pub mod live;
pub mod score;

pub use analyzer::{CancellationToken, GameAnalyzer};
pub use error::AnalysisError;
pub use game::{Classification, Game, MoveRecord};
pub use score::{EngineScore, Score, WhiteScore};
