//! Grid Game CLI.
//!
//! Commands:
//! - play: Run a single game and print transcript, stats and best proposal
//! - batch: Run repeated games with one seed and save JSON results
//! - generate: Display the hidden grid and private facts for a seed

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use quorum_kernel::KernelConfig;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use grid_game::experiment::{ExperimentRunner, ExperimentRunnerConfig};
use grid_game::results::format_duration;

/// Generate a timestamped output path from the given path.
/// e.g., "results.json" -> "results-20260108-010530.json"
fn timestamped_path(path: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d-%H%M%S");
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("results");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("json");
    let parent = path.parent().unwrap_or(Path::new("."));
    parent.join(format!("{}-{}.{}", stem, timestamp, ext))
}

#[derive(Parser)]
#[command(name = "grid-game")]
#[command(version)]
#[command(about = "Hidden-grid information sharing game over a noisy channel")]
struct Cli {
    /// vLLM host URL
    #[arg(long = "vllm-host", env = "VLLM_HOST", default_value = "http://localhost:8000")]
    vllm_host: String,

    /// API key sent as bearer token
    #[arg(long = "api-key", env = "VLLM_API_KEY")]
    api_key: Option<String>,

    /// Models per participant (comma-separated, cycled over participants)
    #[arg(long, default_value = "Qwen/Qwen2.5-7B-Instruct", value_delimiter = ',')]
    models: Vec<String>,

    /// Kernel configuration JSON (missing keys take defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a single game
    Play {
        /// Random seed
        #[arg(long, env = "GAME_SEED")]
        seed: Option<u64>,

        /// Skip the final report
        #[arg(long)]
        no_report: bool,

        /// Also save the full result as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run repeated games with one seed
    Batch {
        /// Number of runs
        #[arg(long, default_value = "3")]
        runs: usize,

        /// Random seed shared by every run
        #[arg(long, env = "GAME_SEED", default_value = "42")]
        seed: u64,

        /// Request the final report for every run
        #[arg(long)]
        report: bool,

        /// Output file for results
        #[arg(long, default_value = "batch.json")]
        output: PathBuf,
    },

    /// Generate and display a game
    Generate {
        /// Random seed
        #[arg(long, env = "GAME_SEED")]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let kernel = match &cli.config {
        Some(path) => KernelConfig::from_json_file(path)?,
        None => KernelConfig::default(),
    };
    let base_config = ExperimentRunnerConfig {
        vllm_host: cli.vllm_host,
        api_key: cli.api_key,
        models: cli.models,
        request_timeout: Duration::from_secs(cli.timeout_secs),
        kernel,
        ..Default::default()
    };

    match cli.command {
        Commands::Play {
            seed,
            no_report,
            output,
        } => {
            let runner = ExperimentRunner::new(ExperimentRunnerConfig {
                write_report: !no_report,
                ..base_config
            });
            let result = runner.run(0, seed).await?;

            println!("\n=== Round Complete ===\n");
            println!("Transcript:");
            for entry in &result.transcript {
                println!("{}@{}: {}", entry.speaker, entry.turn, entry.noised);
            }
            println!("\nChannel stats:");
            println!("{}", serde_json::to_string_pretty(&result.channel_stats)?);

            println!("\nSeed: {}", result.seed);
            println!("State: {}", result.state);
            println!("Turns: {}", result.turns_used);
            println!("Quorum fields: {}/8", result.quorum_fields);
            println!("Schema locked: {}", result.schema_locked);
            println!(
                "Proposals: {} accepted, {} premature, {} malformed, {} prepares",
                result.counters.accepted,
                result.counters.premature,
                result.counters.malformed,
                result.counters.prepares
            );
            println!("Duration: {}", format_duration(result.duration_ms));

            match &result.best_proposal {
                Some(best) => {
                    println!("\nBest proposal received:");
                    println!("{}", serde_json::to_string_pretty(best)?);
                    println!("Score: {:.1}%", result.best_score * 100.0);
                }
                None => println!("\nNo valid proposal received."),
            }

            if let Some(report) = &result.report {
                println!("\n=== Final Synthesized Report ===\n");
                println!("{}", report);
            }

            if let Some(output) = output {
                let path = timestamped_path(&output);
                std::fs::write(&path, serde_json::to_string_pretty(&result)?)?;
                println!("\nResult saved to: {}", path.display());
            }
        }

        Commands::Batch {
            runs,
            seed,
            report,
            output,
        } => {
            info!(runs = runs, seed = seed, "Starting batch");

            let runner = ExperimentRunner::new(ExperimentRunnerConfig {
                write_report: report,
                ..base_config
            });
            let batch = runner.run_batch(runs, Some(seed)).await?;

            let output_path = timestamped_path(&output);
            batch.save(&output_path)?;

            println!("\n=== Experiment Results ===");
            println!("Seed: {}", seed);
            println!("Number of runs: {}", runs);
            if let Some(summary) = &batch.summary {
                println!("Average score: {:.1}%", summary.average_score * 100.0);
                println!("Maximum score: {:.1}%", summary.max_score * 100.0);
                println!("Minimum score: {:.1}%", summary.min_score * 100.0);
                println!(
                    "Perfect rate: {:.1}% (95% CI {:.1}%-{:.1}%)",
                    summary.perfect_rate * 100.0,
                    summary.perfect_rate_ci.0 * 100.0,
                    summary.perfect_rate_ci.1 * 100.0
                );
                println!("Average turns: {:.1}", summary.avg_turns);
                for (state, count) in &summary.states {
                    println!("  {}: {}", state, count);
                }
            }
            println!("\nResults saved to: {}", output_path.display());
        }

        Commands::Generate { seed } => {
            let runner = ExperimentRunner::new(base_config);
            let game = runner.generate(seed);
            println!("{}", game);
        }
    }

    Ok(())
}
