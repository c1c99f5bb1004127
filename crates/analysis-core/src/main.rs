//! Game review CLI
//!
//! Annotates a game given as long-algebraic moves and prints it as JSON, or
//! streams live evaluations of a single position.
//!
//! ```text
//! analyze-game [--fen <FEN>] <uci moves...>
//! analyze-game --live <FEN> [--seconds N]
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use analysis_core::book::MastersBook;
use analysis_core::cache::PositionCache;
use analysis_core::config::AnalysisConfig;
use analysis_core::engine::UciEngine;
use analysis_core::live::{LiveAnalyzer, DEFAULT_CAPACITY};
use analysis_core::{CancellationToken, Game, GameAnalyzer};

const DEFAULT_LIVE_SECONDS: u64 = 10;

#[derive(Debug, PartialEq)]
enum Mode {
    Game {
        fen: Option<String>,
        moves: Vec<String>,
    },
    Live {
        fen: String,
        seconds: u64,
    },
}

fn parse_args(args: &[String]) -> Result<Mode, String> {
    let mut fen = None;
    let mut live = None;
    let mut seconds = DEFAULT_LIVE_SECONDS;
    let mut moves = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--fen" => {
                fen = Some(args.get(i + 1).ok_or("--fen needs a value")?.clone());
                i += 1;
            }
            "--live" => {
                live = Some(args.get(i + 1).ok_or("--live needs a FEN")?.clone());
                i += 1;
            }
            "--seconds" => {
                seconds = args
                    .get(i + 1)
                    .and_then(|v| v.parse().ok())
                    .ok_or("--seconds needs a number")?;
                i += 1;
            }
            flag if flag.starts_with("--") => return Err(format!("unknown flag {flag}")),
            mv => moves.push(mv.to_string()),
        }
        i += 1;
    }

    match live {
        Some(fen) => Ok(Mode::Live { fen, seconds }),
        None if moves.is_empty() => Err("no moves given".into()),
        None => Ok(Mode::Game { fen, moves }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the results
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Load .env file for local dev
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = match parse_args(&args) {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("usage: analyze-game [--fen <FEN>] <uci moves...>");
            eprintln!("       analyze-game --live <FEN> [--seconds N]");
            std::process::exit(2);
        }
    };

    let config = AnalysisConfig::from_env();
    info!(stockfish_path = %config.stockfish_path, "Config loaded");

    match mode {
        Mode::Game { fen, moves } => analyze_game(&config, fen.as_deref(), &moves).await,
        Mode::Live { fen, seconds } => live(&config, &fen, seconds).await,
    }
}

async fn analyze_game(
    config: &AnalysisConfig,
    fen: Option<&str>,
    moves: &[String],
) -> anyhow::Result<()> {
    let mut game = Game::from_uci_moves(fen, moves).context("Failed to replay moves")?;
    let params = config.engine_params()?;

    let engine = UciEngine::new(&config.stockfish_path)
        .with_options(&params.options)
        .with_handshake_timeout(config.handshake_timeout);
    let mut analyzer = GameAnalyzer::new(engine, params);

    if let Some(path) = &config.cache_path {
        match PositionCache::open(path) {
            Ok(cache) => analyzer = analyzer.with_cache(cache),
            Err(e) => warn!(path = %path.display(), "Running without position cache: {}", e),
        }
    }
    if config.book_enabled {
        match MastersBook::new(config.book_endpoint.clone(), config.book_timeout) {
            Ok(book) => analyzer = analyzer.with_book(Arc::new(book)),
            Err(e) => warn!("Running without opening book: {}", e),
        }
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let mut report = |i: usize, n: usize| info!(ply = i + 1, total = n, "Analyzing");
    analyzer
        .analyze(&mut game, Some(&mut report), Some(&cancel))
        .await?;

    println!("{}", serde_json::to_string_pretty(&game)?);
    Ok(())
}

async fn live(config: &AnalysisConfig, fen: &str, seconds: u64) -> anyhow::Result<()> {
    let params = config.engine_params()?;
    let engine = UciEngine::new(&config.stockfish_path)
        .with_options(&params.options)
        .with_handshake_timeout(config.handshake_timeout);

    let (analyzer, mut updates) =
        LiveAnalyzer::spawn(engine, config.live_multi_pv, DEFAULT_CAPACITY);
    analyzer.set_position(fen)?;

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            update = updates.recv() => {
                let Some(update) = update else { break };
                let score = update
                    .white_score()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| "?".into());
                println!(
                    "depth {:>2} #{} {:>7} {}",
                    update.eval.depth.unwrap_or(0),
                    update.multipv_index(),
                    score,
                    update.eval.pv.join(" ")
                );
            }
        }
    }

    analyzer.stop().await?;
    Ok(())
}
