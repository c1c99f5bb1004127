//! Opening book lookups against a masters database.
//!
//! Positions are keyed by their first four FEN fields so transpositions with
//! different move counters share one entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::AnalysisError;
use crate::game::play_uci;

pub const DEFAULT_ENDPOINT: &str = "https://explorer.lichess.ovh/masters";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Continuations requested per position.
const MOVES_PER_POSITION: u32 = 12;

/// Strips move counters from FEN, keeping only position + side + castling + ep.
pub fn normalize_fen(fen: &str) -> String {
    fen.split_whitespace().take(4).collect::<Vec<_>>().join(" ")
}

/// What the database knows about one position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookPosition {
    pub opening_name: Option<String>,
    /// Known continuations, long algebraic.
    pub moves: Vec<String>,
}

impl BookPosition {
    pub fn contains(&self, uci: &str) -> bool {
        self.moves.iter().any(|m| m == uci)
    }
}

#[async_trait]
pub trait OpeningBook: Send + Sync {
    /// Query one position. An unknown position is an empty `BookPosition`.
    async fn lookup(&self, fen: &str) -> Result<BookPosition, AnalysisError>;

    /// Name of the position reached by playing `uci` from `position_before`.
    async fn opening_name(&self, position_before: &str, uci: &str) -> Option<String> {
        let after = play_uci(position_before, uci).ok()?;
        match self.lookup(&after).await {
            Ok(position) => position.opening_name,
            Err(e) => {
                warn!("Book lookup failed: {}", e);
                None
            }
        }
    }

    /// Whether `uci` is a known continuation from `position_before`.
    async fn is_book(&self, position_before: &str, uci: &str) -> bool {
        match self.lookup(position_before).await {
            Ok(position) => position.contains(uci),
            Err(e) => {
                warn!("Book lookup failed: {}", e);
                false
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct MastersResponse {
    #[serde(default)]
    opening: Option<MastersOpening>,
    #[serde(default)]
    moves: Vec<MastersMove>,
}

#[derive(Debug, Deserialize)]
struct MastersOpening {
    name: String,
}

#[derive(Debug, Deserialize)]
struct MastersMove {
    uci: String,
}

impl From<MastersResponse> for BookPosition {
    fn from(resp: MastersResponse) -> Self {
        Self {
            opening_name: resp.opening.map(|o| o.name),
            moves: resp.moves.into_iter().map(|m| m.uci).collect(),
        }
    }
}

/// HTTP client for the masters explorer, memoized per position.
pub struct MastersBook {
    client: Client,
    endpoint: String,
    memo: Mutex<HashMap<String, BookPosition>>,
    requests: AtomicUsize,
}

impl MastersBook {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, AnalysisError> {
        let client = Client::builder()
            .user_agent("GameReview/1.0")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            memo: Mutex::new(HashMap::new()),
            requests: AtomicUsize::new(0),
        })
    }

    /// Network requests issued so far (memo hits excluded).
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    fn memoized(&self, key: &str) -> Option<BookPosition> {
        self.memo
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    async fn fetch(&self, fen: &str) -> Result<BookPosition, AnalysisError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let moves = MOVES_PER_POSITION.to_string();
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("fen", fen), ("moves", moves.as_str())])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(AnalysisError::BookUnavailable(format!("HTTP {}", resp.status())));
        }

        let body: MastersResponse = resp
            .json()
            .await
            .map_err(|e| AnalysisError::BookUnavailable(format!("malformed response: {e}")))?;
        Ok(body.into())
    }
}

#[async_trait]
impl OpeningBook for MastersBook {
    async fn lookup(&self, fen: &str) -> Result<BookPosition, AnalysisError> {
        let key = normalize_fen(fen);
        if let Some(hit) = self.memoized(&key) {
            return Ok(hit);
        }

        let position = self.fetch(fen).await?;
        debug!(
            fen = %key,
            moves = position.moves.len(),
            opening = position.opening_name.as_deref().unwrap_or("-"),
            "Book lookup"
        );
        self.memo
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, position.clone());
        Ok(position)
    }
}

/// Fixed in-memory book, for tests and offline runs.
#[derive(Debug, Default)]
pub struct StaticBook {
    positions: HashMap<String, BookPosition>,
    unavailable: bool,
    lookups: AtomicUsize,
}

impl StaticBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_position(mut self, fen: &str, opening_name: Option<&str>, moves: &[&str]) -> Self {
        self.positions.insert(
            normalize_fen(fen),
            BookPosition {
                opening_name: opening_name.map(str::to_string),
                moves: moves.iter().map(|m| m.to_string()).collect(),
            },
        );
        self
    }

    /// Every lookup fails, as if the network were down.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl OpeningBook for StaticBook {
    async fn lookup(&self, fen: &str) -> Result<BookPosition, AnalysisError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if self.unavailable {
            return Err(AnalysisError::BookUnavailable("static book offline".into()));
        }
        Ok(self
            .positions
            .get(&normalize_fen(fen))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
    const AFTER_E4: &str = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 0 1";

    #[test]
    fn test_normalize_fen_drops_counters() {
        assert_eq!(
            normalize_fen(START),
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq -"
        );
        assert_eq!(
            normalize_fen("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 4 9"),
            normalize_fen(START)
        );
    }

    #[test]
    fn test_parse_masters_response() {
        let json = r#"{
            "white": 1000, "draws": 800, "black": 700,
            "moves": [
                {"uci": "e7e5", "san": "e5", "white": 1, "draws": 2, "black": 3},
                {"uci": "c7c5", "san": "c5", "white": 1, "draws": 2, "black": 3}
            ],
            "opening": {"eco": "B00", "name": "King's Pawn Game"}
        }"#;
        let resp: MastersResponse = serde_json::from_str(json).unwrap();
        let position = BookPosition::from(resp);
        assert_eq!(position.opening_name.as_deref(), Some("King's Pawn Game"));
        assert!(position.contains("c7c5"));
        assert!(!position.contains("a7a6"));

        let empty: MastersResponse =
            serde_json::from_str(r#"{"moves": [], "opening": null}"#).unwrap();
        assert_eq!(BookPosition::from(empty), BookPosition::default());
    }

    #[tokio::test]
    async fn test_static_book_queries() {
        let book = StaticBook::new()
            .with_position(START, None, &["e2e4", "d2d4"])
            .with_position(AFTER_E4, Some("King's Pawn Game"), &["e7e5"]);

        assert!(book.is_book(START, "e2e4").await);
        assert!(!book.is_book(START, "g2g4").await);
        assert_eq!(
            book.opening_name(START, "e2e4").await.as_deref(),
            Some("King's Pawn Game")
        );
        assert_eq!(book.opening_name(START, "d2d4").await, None);
        // Illegal move never reaches the book.
        assert_eq!(book.opening_name(START, "e2e5").await, None);
    }

    #[tokio::test]
    async fn test_failures_are_not_in_book() {
        let book = StaticBook::unavailable();
        assert!(!book.is_book(START, "e2e4").await);
        assert_eq!(book.opening_name(START, "e2e4").await, None);
        assert_eq!(book.lookups(), 2);
    }

    /// Serves one canned masters response, then stops listening.
    async fn serve_once(body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/masters")
    }

    #[tokio::test]
    async fn test_lookups_are_memoized_per_position() {
        let endpoint = serve_once(
            r#"{"moves": [{"uci": "e7e5"}, {"uci": "c7c5"}],
                "opening": {"eco": "B00", "name": "King's Pawn Game"}}"#,
        )
        .await;
        let book = MastersBook::new(endpoint, Duration::from_secs(2)).unwrap();

        let first = book.lookup(AFTER_E4).await.unwrap();
        assert_eq!(first.opening_name.as_deref(), Some("King's Pawn Game"));

        // Same position with different move counters.
        let later = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq - 3 12";
        assert_eq!(book.lookup(later).await.unwrap(), first);
        assert!(book.is_book(later, "c7c5").await);
        assert_eq!(book.requests(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_book_unavailable() {
        let book =
            MastersBook::new("http://127.0.0.1:9/masters", Duration::from_millis(500)).unwrap();
        let err = book.lookup(START).await.unwrap_err();
        assert!(matches!(err, AnalysisError::BookUnavailable(_)));
        assert!(!book.is_book(START, "e2e4").await);
        // Failures are not memoized.
        assert_eq!(book.requests(), 2);
    }
}
