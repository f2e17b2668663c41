//! Experiment runner for grid game runs.
//!
//! Orchestrates the run lifecycle:
//! 1. Generate the hidden grid and private facts from a seed
//! 2. Set up participants and the turn scheduler
//! 3. Play turns until a terminal state
//! 4. Optionally request the final report
//! 5. Collect metrics and results
//!
//! Every run owns its environment, channel, tracker and scheduler, so runs in
//! a batch are fully independent.

use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use quorum_kernel::{Collaborator, Environment, KernelConfig, TurnScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crate::conversation::build_participants;
use crate::environment::HiddenEnvironment;
use crate::generator::{GameGenerator, GeneratedGame, GeneratorConfig};
use crate::report::{write_report, ReportWriter};
use crate::results::{BatchResults, GameResult};
use crate::vllm_client::{ClientConfig, VllmClient, VllmCollaborator, VllmReportWriter};

/// Configuration for the experiment runner.
#[derive(Debug, Clone)]
pub struct ExperimentRunnerConfig {
    /// vLLM host URL
    pub vllm_host: String,
    /// Bearer token for the vLLM server
    pub api_key: Option<String>,
    /// One model per participant, cycled if shorter
    pub models: Vec<String>,
    /// Model used for the final report (defaults to the first model)
    pub report_model: Option<String>,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Retries after the first failed request
    pub max_retries: usize,
    /// Protocol settings
    pub kernel: KernelConfig,
    /// Whether to request the final report
    pub write_report: bool,
}

impl Default for ExperimentRunnerConfig {
    fn default() -> Self {
        Self {
            vllm_host: "http://localhost:8000".to_string(),
            api_key: None,
            models: vec!["Qwen/Qwen2.5-7B-Instruct".to_string()],
            report_model: None,
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
            kernel: KernelConfig::default(),
            write_report: true,
        }
    }
}

/// Experiment runner.
pub struct ExperimentRunner {
    config: ExperimentRunnerConfig,
}

impl ExperimentRunner {
    /// Create a new experiment runner.
    pub fn new(config: ExperimentRunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExperimentRunnerConfig {
        &self.config
    }

    fn client(&self) -> Result<VllmClient> {
        VllmClient::new(ClientConfig {
            base_url: self.config.vllm_host.clone(),
            api_key: self.config.api_key.clone(),
            request_timeout: self.config.request_timeout,
            max_retries: self.config.max_retries,
            ..Default::default()
        })
    }

    /// Generate a game for `seed` with the configured participant count.
    pub fn generate(&self, seed: Option<u64>) -> GeneratedGame {
        GameGenerator::new(GeneratorConfig {
            participants: self.config.kernel.participants,
            seed,
        })
        .generate()
    }

    /// Run a single game against the vLLM server.
    pub async fn run(&self, run_index: usize, seed: Option<u64>) -> Result<GameResult> {
        self.config.kernel.validate()?;
        let game = self.generate(seed);
        let client = self.client()?;

        let ids: Vec<String> = (1..=self.config.kernel.participants)
            .map(|i| format!("Agent{}", i))
            .collect();
        let collaborator = VllmCollaborator::new(
            client.clone(),
            &ids,
            &self.config.models,
            &self.config.kernel.prepare_marker,
            &self.config.kernel.proposal_marker,
        )?;
        let models: Vec<String> = ids
            .iter()
            .map(|id| collaborator.model_for(id).to_string())
            .collect();

        let report_writer = self.config.write_report.then(|| VllmReportWriter {
            client,
            model: self
                .config
                .report_model
                .clone()
                .unwrap_or_else(|| models[0].clone()),
        });

        play_game(
            &self.config.kernel,
            game,
            &collaborator,
            report_writer.as_ref().map(|w| w as &dyn ReportWriter),
            run_index,
            models,
        )
        .await
    }

    /// Run `runs` games with the same seed.
    pub async fn run_batch(&self, runs: usize, seed: Option<u64>) -> Result<BatchResults> {
        let mut batch = BatchResults::new(seed);
        for run_index in 0..runs {
            let result = self.run(run_index, seed).await?;
            info!(
                progress = format!("{}/{}", run_index + 1, runs),
                state = %result.state,
                score = result.best_score,
                "Completed run"
            );
            batch.add(result);
        }
        batch.compute_summary();
        Ok(batch)
    }
}

/// Play one complete game with any collaborator.
///
/// # Arguments
/// * `kernel` - Protocol settings; `participants` must match the game
/// * `game` - Generated grid and private facts; its seed also seeds the channel
/// * `collaborator` - Source of utterances
/// * `report_writer` - Asked for the final report when present
pub async fn play_game<C: Collaborator + ?Sized>(
    kernel: &KernelConfig,
    game: GeneratedGame,
    collaborator: &C,
    report_writer: Option<&dyn ReportWriter>,
    run_index: usize,
    models: Vec<String>,
) -> Result<GameResult> {
    let started_at = Utc::now();
    let start_time = Instant::now();

    let participants = build_participants(game.private_facts.clone());
    let ground_truth = game.env.solution_wire();
    let mut scheduler = TurnScheduler::new(kernel.clone(), game.env, participants, game.seed)?;

    info!(
        seed = game.seed,
        run = run_index,
        participants = kernel.participants,
        turn_budget = kernel.turn_budget,
        "Starting game"
    );

    let outcome = scheduler.run(collaborator).await;
    let stats = scheduler.channel().stats();

    let report = match report_writer {
        Some(writer) => {
            let report = write_report(
                writer,
                &scheduler.channel().history_text(),
                &stats,
                outcome.best.as_ref(),
            )
            .await;
            if report.is_none() {
                warn!(run = run_index, "Continuing without final report");
            }
            report
        }
        None => None,
    };

    let fields = scheduler.env().fields().len();
    info!(
        state = %outcome.state,
        turns = outcome.turns_used,
        quorum_fields = format!("{}/{}", outcome.quorum_fields, fields),
        best_score = outcome.best.as_ref().map(|b| b.score),
        "Game finished"
    );

    Ok(GameResult {
        run_id: Uuid::new_v4(),
        run_index,
        seed: game.seed,
        models,
        started_at,
        ended_at: Utc::now(),
        duration_ms: start_time.elapsed().as_millis() as u64,
        state: outcome.state,
        turns_used: outcome.turns_used,
        best_score: outcome.best.as_ref().map_or(0.0, |b| b.score),
        best_proposal: outcome
            .best
            .as_ref()
            .map(|b| HiddenEnvironment::proposal_to_wire(&b.proposal)),
        best_turn: outcome.best.as_ref().map(|b| b.turn),
        counters: outcome.counters,
        channel_stats: stats,
        canonical_state: scheduler.tracker().canonical_state(),
        quorum_fields: outcome.quorum_fields,
        schema_locked: outcome.schema_locked,
        ground_truth,
        private_facts: game.private_facts,
        turns: scheduler.records().to_vec(),
        transcript: scheduler.transcript().to_vec(),
        report,
    })
}
