use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chess::{ChessMove, Color};
use clap::{Parser, Subcommand};

use zero_chess::logging::setup_logging;
use zero_chess::{
    Evaluator, GameContext, GameStatus, SearchHyperparameters, SearchStrategy, UniformEvaluator,
    ZeroChessError,
};

#[derive(Parser, Debug)]
#[command(name = "zero_chess", version, about = "Concurrent AlphaZero-style chess search")]
struct Config {
    #[command(subcommand)]
    command: Command,

    /// Log level spec, overridden by RUST_LOG
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Write rotating log files to this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// JSON file with search hyperparameters
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Worker threads
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Playouts per move
    #[arg(short, long, global = true, conflicts_with = "time_ms")]
    playouts: Option<usize>,

    /// Time budget per move in milliseconds
    #[arg(long, global = true)]
    time_ms: Option<u64>,

    /// Positions per evaluator call
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Random seed
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// TorchScript policy/value model (needs the `torch` feature)
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    /// Value returned by the stub evaluator when no model is given
    #[arg(long, default_value_t = 0.0, global = true)]
    stub_value: f32,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Play games of the search against itself
    Selfplay {
        /// Number of games
        #[arg(short = 'n', long, default_value_t = 1)]
        games: usize,

        /// Starting position
        #[arg(long)]
        fen: Option<String>,
    },
    /// Search one position and print the root statistics
    Analyse {
        /// Position to analyse, the initial position by default
        #[arg(long)]
        fen: Option<String>,
    },
}

// ============================================================================
// CONFIGURATION
// ============================================================================

fn hyperparameters(config: &Config) -> Result<SearchHyperparameters, ZeroChessError> {
    let mut params = match &config.config {
        Some(path) => SearchHyperparameters::load(path)?,
        None => SearchHyperparameters::default(),
    };
    if let Some(workers) = config.workers {
        params.workers = workers;
    }
    if let Some(playouts) = config.playouts {
        params.playouts = Some(playouts);
        params.time_budget_ms = None;
    }
    if let Some(ms) = config.time_ms {
        params.time_budget_ms = Some(ms);
        params.playouts = None;
    }
    if let Some(batch_size) = config.batch_size {
        params.batch_size = batch_size;
    }
    if let Some(seed) = config.seed {
        params.seed = seed;
    }
    params.validate()?;
    Ok(params)
}

#[cfg(feature = "torch")]
fn load_model(path: &Path) -> Result<Arc<dyn Evaluator>, ZeroChessError> {
    Ok(Arc::new(zero_chess::neural::TorchEvaluator::load(path)?))
}

#[cfg(not(feature = "torch"))]
fn load_model(path: &Path) -> Result<Arc<dyn Evaluator>, ZeroChessError> {
    Err(ZeroChessError::Config(format!(
        "cannot load {}: built without the `torch` feature",
        path.display()
    )))
}

fn evaluator(config: &Config) -> Result<Arc<dyn Evaluator>, ZeroChessError> {
    match &config.model {
        Some(path) => load_model(path),
        None => Ok(Arc::new(UniformEvaluator::new(config.stub_value))),
    }
}

fn start_position(fen: Option<&str>, move_cap: usize) -> Result<GameContext, ZeroChessError> {
    let context = match fen {
        Some(fen) => GameContext::from_fen(fen)?,
        None => GameContext::new(),
    };
    Ok(context.with_move_cap(move_cap))
}

// ============================================================================
// SELF-PLAY
// ============================================================================

fn play_game(
    white: &mut SearchStrategy,
    black: &mut SearchStrategy,
    start: &GameContext,
    game: usize,
) -> Result<GameStatus, ZeroChessError> {
    white.new_game(start.clone())?;
    black.new_game(start.clone())?;

    let mut board = start.clone();
    let mut last_move: Option<ChessMove> = None;
    loop {
        let status = board.status();
        if status.is_terminal() {
            return Ok(status);
        }
        let legal = board.legal_moves();
        let player = if board.side_to_move() == Color::White {
            &mut *white
        } else {
            &mut *black
        };
        let mv = player.choose_move(last_move, &legal)?;
        if let Some(result) = player.search_result() {
            log::info!(
                "[Game {}] ply {:>3} {} value {:+.3} ({} visits, {} live nodes)",
                game,
                board.ply(),
                mv,
                result.root_value,
                result.root_visits,
                result.report.live_nodes
            );
        }
        board.try_apply_move(mv)?;
        last_move = Some(mv);
    }
}

fn selfplay(
    params: &SearchHyperparameters,
    evaluator: Arc<dyn Evaluator>,
    games: usize,
    fen: Option<&str>,
) -> Result<(), ZeroChessError> {
    let start = start_position(fen, params.move_cap)?;
    let mut white = SearchStrategy::new(params.to_search_config()?, Arc::clone(&evaluator))?;
    let black_params = SearchHyperparameters {
        seed: params.seed.wrapping_add(1),
        ..params.clone()
    };
    let mut black = SearchStrategy::new(black_params.to_search_config()?, evaluator)?;

    let (mut white_wins, mut black_wins, mut draws) = (0usize, 0usize, 0usize);
    for game in 1..=games {
        let started = Instant::now();
        let status = play_game(&mut white, &mut black, &start, game)?;
        match status.winner() {
            Some(Color::White) => white_wins += 1,
            Some(Color::Black) => black_wins += 1,
            None => draws += 1,
        }
        log::info!(
            "🏁 Game {}/{} finished: {:?} in {:.1}s",
            game,
            games,
            status,
            started.elapsed().as_secs_f64()
        );
    }
    log::info!(
        "📊 {} games: white {} / black {} / draws {}",
        games,
        white_wins,
        black_wins,
        draws
    );
    Ok(())
}

// ============================================================================
// ANALYSIS
// ============================================================================

fn analyse(
    params: &SearchHyperparameters,
    evaluator: Arc<dyn Evaluator>,
    fen: Option<&str>,
) -> Result<(), ZeroChessError> {
    let position = start_position(fen, params.move_cap)?;
    let mut strategy = SearchStrategy::new(params.to_search_config()?, evaluator)?;
    strategy.new_game(position.clone())?;

    let legal = position.legal_moves();
    let best = strategy.choose_move(None, &legal)?;
    let Some(result) = strategy.search_result() else {
        return Err(ZeroChessError::Config("search produced no result".to_string()));
    };

    println!("position   {}", position.board());
    println!("best move  {}", best);
    println!("root value {:+.4} ({} visits)", result.root_value, result.root_visits);
    println!(
        "playouts   {} in {:.2}s ({:.0}/s)",
        result.report.playouts,
        result.report.elapsed.as_secs_f64(),
        result.report.playouts_per_second()
    );
    println!("{:<8} {:>8} {:>7} {:>8} {:>8}  state", "move", "visits", "share", "prior", "q");
    let shares = result.visit_distribution();
    for (child, (_, share)) in result.children.iter().zip(shares) {
        println!(
            "{:<8} {:>8} {:>6.1}% {:>8.4} {:>+8.4}  {:?}",
            child.mv.to_string(),
            child.visits,
            share * 100.0,
            child.prior,
            child.expected_reward,
            child.state
        );
    }
    Ok(())
}

// ============================================================================
// ENTRY POINT
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    let _logger = setup_logging(&config.log_level, config.log_dir.as_deref())?;

    let params = hyperparameters(&config)?;
    log::info!("⚙️ {} {}: {}", zero_chess::NAME, zero_chess::VERSION, params.to_config_string());
    let evaluator = evaluator(&config)?;

    match &config.command {
        Command::Selfplay { games, fen } => selfplay(&params, evaluator, *games, fen.as_deref())?,
        Command::Analyse { fen } => analyse(&params, evaluator, fen.as_deref())?,
    }
    Ok(())
}
