//! Kolosal PNAS CLI Module
//!
//! Command-line interface for running the progressive search, inspecting a
//! search space, and a self-contained demo on synthetic data.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::*;

use crate::architectures::CellNetworkBuilder;
use crate::nas::{ProgressiveSearch, SearchConfig, SearchSummary, StateSpace};
use crate::tracking::{best_row, read_history, CsvHistoryLog, HistoryRow};
use crate::utils::data_loader::{Dataset, DatasetLoader};

// ─── Styling helpers ───────────────────────────────────────────────────────────

fn dim(s: &str) -> ColoredString    { s.truecolor(100, 100, 100) }
fn accent(s: &str) -> ColoredString { s.truecolor(120, 170, 255) }
fn muted(s: &str) -> ColoredString  { s.truecolor(140, 140, 140) }
fn ok(s: &str) -> ColoredString     { s.truecolor(100, 210, 120) }

fn step_run(msg: &str) {
    print!("  {} {}... ", accent("›"), msg);
}

fn step_done(detail: &str) {
    println!("{} {}", ok("done"), dim(detail));
}

fn section(title: &str) {
    println!();
    println!("  {}", title.white().bold());
    println!("  {}", dim(&"─".repeat(56)));
}

fn timestamp(label: &str) {
    let now = chrono::Local::now();
    println!("  {:<12} {}", muted(label), now.format("%Y-%m-%d %H:%M:%S").to_string().white());
}

// ─── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "kolosal-pnas")]
#[command(author = "KolosalAI")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Progressive neural architecture search in Rust")]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Search for a cell on a dataset
    Search(SearchArgs),

    /// Print the decision space and the number of models the search visits
    Space {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of blocks per cell
        #[arg(short = 'B', long)]
        blocks: Option<usize>,

        /// Candidates kept per trial
        #[arg(short = 'K', long)]
        top_k: Option<usize>,
    },

    /// Run a short search on a synthetic dataset
    Demo {
        /// Number of blocks per cell
        #[arg(short = 'B', long, default_value = "2")]
        blocks: usize,

        /// Candidates kept per trial
        #[arg(short = 'K', long, default_value = "4")]
        top_k: usize,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Result log
        #[arg(long, default_value = "demo_history.csv")]
        history: PathBuf,
    },
}

/// Flags of the `search` command; each one overrides the configuration file
#[derive(Args, Debug, Clone, Default)]
pub struct SearchArgs {
    /// Training split (`.dat`: comma-separated features, tab, label)
    #[arg(long)]
    pub train: PathBuf,

    /// Validation split
    #[arg(long)]
    pub val: PathBuf,

    /// JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of blocks per cell
    #[arg(short = 'B', long)]
    pub blocks: Option<usize>,

    /// Candidates kept per trial
    #[arg(short = 'K', long)]
    pub top_k: Option<usize>,

    /// Child training epochs
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Child mini-batch size
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Child learning rate
    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Controller entropy regularisation
    #[arg(long)]
    pub reg: Option<f64>,

    /// Controller hidden units
    #[arg(long)]
    pub controller_cells: Option<usize>,

    /// Controller updates per trial
    #[arg(long)]
    pub controller_epochs: Option<usize>,

    /// Restore the controller from its checkpoint
    #[arg(long)]
    pub restore: bool,

    /// Controller checkpoint file
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Result log (appended to)
    #[arg(long)]
    pub history: Option<PathBuf>,

    /// Random seed
    #[arg(long)]
    pub seed: Option<u64>,
}

impl SearchArgs {
    /// Merge the flags into a configuration
    pub fn apply(&self, config: &mut SearchConfig) {
        if let Some(blocks) = self.blocks {
            config.space.num_blocks = blocks;
        }
        if let Some(k) = self.top_k {
            config.controller.top_k = k;
        }
        if let Some(epochs) = self.epochs {
            config.training.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.batch_size = batch_size;
        }
        if let Some(lr) = self.learning_rate {
            config.training.learning_rate = lr;
        }
        if let Some(reg) = self.reg {
            config.controller.reg_param = reg;
        }
        if let Some(cells) = self.controller_cells {
            config.controller.hidden_dim = cells;
        }
        if let Some(iterations) = self.controller_epochs {
            config.controller.train_iterations = iterations;
        }
        if self.restore {
            config.controller.restore_controller = true;
        }
        if let Some(path) = &self.checkpoint {
            config.controller.checkpoint_path = Some(path.clone());
        }
        if let Some(path) = &self.history {
            config.history_path = path.clone();
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SearchConfig> {
    match path {
        Some(p) => SearchConfig::from_json_file(p)
            .with_context(|| format!("Failed to read configuration {}", p.display())),
        None => Ok(SearchConfig::default()),
    }
}

// ─── Commands ──────────────────────────────────────────────────────────────────

pub fn cmd_search(args: &SearchArgs) -> anyhow::Result<()> {
    section("Search");

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    step_run("Loading data");
    let start = Instant::now();
    let dataset = DatasetLoader::new()
        .load(&args.train, &args.val)
        .context("Failed to load dataset")?;
    step_done(&format!(
        "{} train / {} val × {} features in {:?}",
        dataset.x_train.nrows(),
        dataset.x_val.nrows(),
        dataset.x_train.ncols(),
        start.elapsed()
    ));

    run_search(&config, dataset)
}

pub fn cmd_space(
    config_path: Option<&Path>,
    blocks: Option<usize>,
    top_k: Option<usize>,
) -> anyhow::Result<()> {
    section("Search space");

    let mut config = load_config(config_path)?;
    if let Some(b) = blocks {
        config.space.num_blocks = b;
    }
    if let Some(k) = top_k {
        config.controller.top_k = k;
    }
    config.validate()?;

    let space = StateSpace::new(&config.space)?;
    for line in space.summary() {
        println!("  {}", line);
    }
    println!();
    println!(
        "  {:<16} {}",
        muted("Tokens"),
        space.max_sequence_len().to_string().white()
    );
    println!(
        "  {:<16} {}",
        muted("Models"),
        space
            .total_models(config.controller.top_k, config.controller.max_enumerable)
            .to_string()
            .white()
            .bold()
    );
    println!();
    Ok(())
}

pub fn cmd_demo(blocks: usize, top_k: usize, seed: u64, history: &Path) -> anyhow::Result<()> {
    section("Demo");

    let mut config = SearchConfig::default()
        .with_blocks(blocks)
        .with_top_k(top_k)
        .with_seed(seed)
        .with_history_path(history);
    config.training.epochs = 3;
    config.training.batch_size = 32;
    config.training.learning_rate = 0.05;
    config.controller.hidden_dim = 32;

    step_run("Generating synthetic signals");
    let dataset = Dataset::synthetic(240, 80, 32, 4, seed);
    step_done("240 train / 80 val × 32 features, 4 classes");

    run_search(&config, dataset)
}

fn run_search(config: &SearchConfig, dataset: Dataset) -> anyhow::Result<()> {
    println!();
    timestamp("Started");

    let builder = CellNetworkBuilder::new(config.num_cells);
    let sink = CsvHistoryLog::new(&config.history_path);
    let mut search = ProgressiveSearch::new(config, dataset, builder, sink)?;
    let summary = search.run()?;

    timestamp("Finished");
    let logged = best_logged(&config.history_path)?;
    print_summary(&summary, &config.history_path, logged.as_ref());
    Ok(())
}

/// Best row across every run appended to the log
fn best_logged(path: &Path) -> anyhow::Result<Option<HistoryRow>> {
    let rows = read_history(path)
        .with_context(|| format!("Failed to read history {}", path.display()))?;
    Ok(best_row(&rows).cloned())
}

fn print_summary(summary: &SearchSummary, history: &Path, logged: Option<&HistoryRow>) {
    println!();
    println!(
        "  {:<8} {:>10} {:>10} {:>10} {:>10}",
        muted("Trial"),
        muted("Models"),
        muted("Mean"),
        muted("Max"),
        muted("Loss")
    );
    println!("  {}", dim(&"─".repeat(52)));
    for trial in &summary.trials {
        println!(
            "  {:<8} {:>10} {:>10.4} {:>10.4} {:>10.4}",
            trial.trial + 1,
            trial.num_candidates,
            trial.mean_reward,
            trial.max_reward,
            trial.controller.loss
        );
    }
    println!("  {}", dim(&"─".repeat(52)));

    match &summary.best {
        Some(best) => {
            println!();
            println!(
                "  {} {} {:.4}",
                ok("★"),
                "Best architecture".white().bold(),
                best.reward
            );
            for block in &best.architecture.blocks {
                let choices: Vec<String> = block
                    .choices
                    .iter()
                    .map(|c| format!("{} ← {}", c.op, c.input))
                    .collect();
                println!("    {} {}", muted(&format!("block {}", block.index)), choices.join(", "));
            }
        }
        None => println!("  {}", "No candidate was evaluated".yellow()),
    }

    println!();
    if summary.failed_candidates > 0 {
        println!(
            "  {:<12} {}",
            muted("Failed"),
            summary.failed_candidates.to_string().red()
        );
    }
    println!("  {:<12} {}", muted("Models"), summary.total_candidates);
    println!("  {:<12} {:.2}s", muted("Time"), summary.elapsed_secs);
    println!("  {:<12} {}", muted("History"), history.display());
    if let Some(row) = logged {
        println!(
            "  {:<12} {:.4} {}",
            muted("Best logged"),
            row.reward,
            dim(&format!("[{}]", row.decisions.join(", ")))
        );
    }
    println!();
}
