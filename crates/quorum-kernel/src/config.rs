//! Configuration types for the kernel.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level kernel configuration.
///
/// Defines the turn budget, channel constraints, noise schedule and the
/// acceptance policy. Loaded from JSON at runtime; missing keys take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Total turns across all participants
    pub turn_budget: usize,

    /// Number of participants acting in round-robin order
    pub participants: usize,

    /// Bandwidth cap in characters for non-proposal messages
    pub max_message_len: usize,

    /// Per-phase character drop probabilities
    pub noise: NoiseSchedule,

    /// Distinct confirmers required before a field counts as settled
    pub quorum_threshold: usize,

    /// Turns before the end of the budget at which finalization is forced
    pub finalize_lead_turns: usize,

    /// Utterances mentioning SCHEMA needed to lock the key format
    pub schema_lock_votes: usize,

    /// How competing confirmations resolve
    pub flip_policy: FlipPolicy,

    /// Prefix of an uncorrupted final proposal
    pub proposal_marker: String,

    /// Prefix of a rehearsal proposal
    pub prepare_marker: String,
}

/// Drop probability per game phase.
///
/// Early turns stay quiet so a protocol can form, mid turns stress it, and
/// late turns quiet down again so confirmations and proposals survive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseSchedule {
    pub early: f64,
    pub mid: f64,
    pub late: f64,
}

/// Game phase derived from turn index and budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Early,
    Mid,
    Late,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Early => write!(f, "early"),
            Self::Mid => write!(f, "mid"),
            Self::Late => write!(f, "late"),
        }
    }
}

/// Resolution rule when confirmations accumulate for a non-canonical value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlipPolicy {
    /// A challenger reaching the quorum threshold replaces the canonical value.
    #[default]
    Majority,
    /// Once the canonical value has quorum it can no longer be replaced.
    FirstQuorumWins,
}

impl Phase {
    /// Phase of 1-based `turn` within `budget`: thirds of the budget.
    pub fn of(turn: usize, budget: usize) -> Self {
        if turn * 3 <= budget {
            Self::Early
        } else if turn * 3 <= budget * 2 {
            Self::Mid
        } else {
            Self::Late
        }
    }
}

impl NoiseSchedule {
    pub fn drop_probability(&self, phase: Phase) -> f64 {
        match phase {
            Phase::Early => self.early,
            Phase::Mid => self.mid,
            Phase::Late => self.late,
        }
    }
}

impl Default for NoiseSchedule {
    fn default() -> Self {
        Self {
            early: 0.03,
            mid: 0.06,
            late: 0.02,
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            turn_budget: 24,
            participants: 4,
            max_message_len: 200,
            noise: NoiseSchedule::default(),
            quorum_threshold: 2,
            finalize_lead_turns: 4,
            schema_lock_votes: 3,
            flip_policy: FlipPolicy::Majority,
            proposal_marker: "PROPOSE=".to_string(),
            prepare_marker: "PREPARE=".to_string(),
        }
    }
}

impl KernelConfig {
    /// Load a configuration from a JSON file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read kernel config {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse kernel config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the scheduler cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.turn_budget == 0 {
            bail!("turn_budget must be positive");
        }
        if !(2..=8).contains(&self.participants) {
            bail!("participants must be between 2 and 8, got {}", self.participants);
        }
        if self.max_message_len == 0 {
            bail!("max_message_len must be positive");
        }
        for (name, p) in [
            ("early", self.noise.early),
            ("mid", self.noise.mid),
            ("late", self.noise.late),
        ] {
            if !(0.0..=1.0).contains(&p) {
                bail!("noise.{} must be within [0, 1], got {}", name, p);
            }
        }
        if self.quorum_threshold == 0 {
            bail!("quorum_threshold must be positive");
        }
        if self.finalize_lead_turns >= self.turn_budget {
            bail!(
                "finalize_lead_turns ({}) must be smaller than turn_budget ({})",
                self.finalize_lead_turns,
                self.turn_budget
            );
        }
        if self.proposal_marker.trim().is_empty() || self.prepare_marker.trim().is_empty() {
            bail!("proposal and prepare markers must be non-empty");
        }
        Ok(())
    }

    /// Drop probability in effect for 1-based `turn`.
    pub fn noise_for_turn(&self, turn: usize) -> f64 {
        self.noise
            .drop_probability(Phase::of(turn, self.turn_budget))
    }

    /// The turn at which the forced-finalization directive may be issued.
    pub fn finalize_turn(&self) -> usize {
        self.turn_budget - self.finalize_lead_turns
    }
}
