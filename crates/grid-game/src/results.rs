//! Results collection and output for grid game runs.
//!
//! Captures metrics like:
//! - Terminal state and turns used
//! - Best accepted proposal and its score
//! - Proposal counters (accepted, premature, malformed, prepares)
//! - Channel statistics and the full audit trail

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quorum_kernel::{
    ChannelStats, FieldKey, ProposalCounters, SchedulerState, TranscriptEntry, TurnRecord,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Results from a single game.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameResult {
    pub run_id: Uuid,
    /// Position within a batch (0 for single runs)
    pub run_index: usize,
    pub seed: u64,
    pub models: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub state: SchedulerState,
    pub turns_used: usize,
    /// Score of the best accepted proposal, 0 when none was accepted
    pub best_score: f64,
    /// Best accepted proposal in the wire format
    pub best_proposal: Option<serde_json::Value>,
    pub best_turn: Option<usize>,
    pub counters: ProposalCounters,
    pub channel_stats: ChannelStats,
    pub canonical_state: BTreeMap<FieldKey, String>,
    pub quorum_fields: usize,
    pub schema_locked: bool,
    pub ground_truth: serde_json::Value,
    pub private_facts: Vec<Vec<String>>,
    pub turns: Vec<TurnRecord>,
    pub transcript: Vec<TranscriptEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
}

impl GameResult {
    pub fn is_perfect(&self) -> bool {
        self.state == SchedulerState::TerminatedPerfect
    }
}

/// Repeated runs with one configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResults {
    /// Seed shared by every run, if fixed
    pub seed: Option<u64>,
    pub results: Vec<GameResult>,
    pub summary: Option<BatchSummary>,
}

/// Summary statistics for a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub runs: usize,
    pub average_score: f64,
    pub max_score: f64,
    pub min_score: f64,
    pub perfect_rate: f64,
    /// Standard error of perfect rate: sqrt(p(1-p)/n)
    pub perfect_rate_se: f64,
    /// 95% confidence interval for perfect rate: (lower, upper)
    pub perfect_rate_ci: (f64, f64),
    pub avg_turns: f64,
    /// Standard error of avg_turns
    pub avg_turns_se: f64,
    pub scores: Vec<f64>,
    /// Terminal state name -> count
    pub states: BTreeMap<String, usize>,
}

impl BatchResults {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            seed,
            results: Vec::new(),
            summary: None,
        }
    }

    pub fn add(&mut self, result: GameResult) {
        self.results.push(result);
    }

    /// Compute summary statistics. No summary is produced for an empty batch.
    pub fn compute_summary(&mut self) {
        if self.results.is_empty() {
            self.summary = None;
            return;
        }

        let runs = self.results.len();
        let n = runs as f64;
        let scores: Vec<f64> = self.results.iter().map(|r| r.best_score).collect();
        let average_score = scores.iter().sum::<f64>() / n;
        let max_score = scores.iter().copied().fold(f64::MIN, f64::max);
        let min_score = scores.iter().copied().fold(f64::MAX, f64::min);

        let perfect = self.results.iter().filter(|r| r.is_perfect()).count();
        let perfect_rate = perfect as f64 / n;

        // Standard error for proportion: SE = sqrt(p(1-p)/n)
        let perfect_rate_se = if runs > 1 {
            (perfect_rate * (1.0 - perfect_rate) / n).sqrt()
        } else {
            0.0
        };

        // 95% CI: p ± 1.96 * SE, clamped to [0, 1]
        let z = 1.96;
        let perfect_rate_ci = (
            (perfect_rate - z * perfect_rate_se).max(0.0),
            (perfect_rate + z * perfect_rate_se).min(1.0),
        );

        let turns: Vec<f64> = self.results.iter().map(|r| r.turns_used as f64).collect();
        let avg_turns = turns.iter().sum::<f64>() / n;

        // Standard error for continuous: SE = std_dev / sqrt(n)
        let avg_turns_se = if runs > 1 {
            let variance = turns.iter().map(|t| (t - avg_turns).powi(2)).sum::<f64>() / (n - 1.0);
            variance.sqrt() / n.sqrt()
        } else {
            0.0
        };

        let mut states = BTreeMap::new();
        for r in &self.results {
            *states.entry(r.state.to_string()).or_insert(0) += 1;
        }

        self.summary = Some(BatchSummary {
            runs,
            average_score,
            max_score,
            min_score,
            perfect_rate,
            perfect_rate_se,
            perfect_rate_ci,
            avg_turns,
            avg_turns_se,
            scores,
            states,
        });
    }

    /// Save results to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write results to {}", path.display()))?;
        Ok(())
    }

    /// Load results from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read results from {}", path.display()))?;
        let results = serde_json::from_str(&json)?;
        Ok(results)
    }
}

/// Format a duration in milliseconds for display.
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{:.1}m", ms as f64 / 60_000.0)
    }
}
