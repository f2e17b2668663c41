//! The turn scheduler: round-robin play with quorum-gated, two-phase proposals.
//!
//! Each turn:
//! 1. set the channel noise from the phase schedule
//! 2. hand the acting participant a [`TurnContext`] and obtain an utterance
//! 3. deliver it through the [`NoisyChannel`], parse it, absorb it
//! 4. answer prepare proposals and malformed finals with machine feedback
//! 5. score valid finals, accepting them only when every field has quorum
//! 6. stop on a perfect accepted proposal
//! 7. at the finalize turn, direct the closer to commit if quorum is complete
//! 8. stop when the turn budget is spent
//!
//! All mutations for turn N are applied before turn N+1 is requested.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::{NoisyChannel, TranscriptEntry};
use crate::config::{KernelConfig, Phase};
use crate::environment::{Environment, Proposal};
use crate::parser::{ClaimParser, FinalAttempt};
use crate::tracker::{AbsorbSummary, FieldStatus, ProtocolStateTracker};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    Running,
    /// An accepted proposal matched the ground truth exactly
    TerminatedPerfect,
    /// The turn budget ran out without a perfect match
    TerminatedBudget,
    /// The closer's imperfect proposal was accepted after the finalize directive
    TerminatedBestEffort,
}

impl SchedulerState {
    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::TerminatedPerfect => write!(f, "TERMINATED_PERFECT"),
            Self::TerminatedBudget => write!(f, "TERMINATED_BUDGET"),
            Self::TerminatedBestEffort => write!(f, "TERMINATED_BEST_EFFORT"),
        }
    }
}

/// A participant and its immutable private knowledge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub role: String,
    /// Recipient of the forced-finalization directive
    pub is_closer: bool,
    pub private_facts: Vec<String>,
}

/// Everything the text-generation collaborator receives for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnContext {
    pub turn: usize,
    pub turn_budget: usize,
    pub phase: Phase,
    pub drop_probability: f64,
    pub participant: Participant,
    /// Transcript so far, noised view only
    pub transcript: String,
    pub fields: Vec<FieldStatus>,
    pub feedback: Vec<String>,
    pub schema_locked: bool,
}

/// Produces the next utterance for a participant.
///
/// Failures are not fatal: the scheduler logs them and plays an empty turn.
#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn generate(&self, participant_id: &str, context: &TurnContext) -> Result<String>;
}

/// A proposal together with its adjudication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredProposal {
    pub turn: usize,
    pub speaker: String,
    pub score: f64,
    pub proposal: Proposal,
}

/// How the proposal content of a turn was handled.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ProposalVerdict {
    #[default]
    None,
    Prepared {
        score: f64,
    },
    Malformed,
    /// Valid final proposal submitted before every field had quorum
    Premature {
        score: f64,
    },
    Accepted {
        score: f64,
    },
}

/// Running totals of proposal outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalCounters {
    pub prepares: usize,
    pub malformed: usize,
    pub premature: usize,
    pub accepted: usize,
}

/// Audit record of one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn: usize,
    pub speaker: String,
    pub phase: Phase,
    pub drop_probability: f64,
    pub empty: bool,
    pub items: usize,
    pub absorbed: AbsorbSummary,
    pub verdict: ProposalVerdict,
    pub quorum_fields: usize,
    pub feedback_issued: Vec<String>,
}

/// Final result of [`TurnScheduler::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub state: SchedulerState,
    pub turns_used: usize,
    pub best: Option<ScoredProposal>,
    pub counters: ProposalCounters,
    pub schema_locked: bool,
    pub quorum_fields: usize,
}

/// Owns all per-run state: nothing is shared between runs.
pub struct TurnScheduler<E: Environment> {
    config: KernelConfig,
    env: E,
    participants: Vec<Participant>,
    channel: NoisyChannel,
    parser: ClaimParser,
    tracker: ProtocolStateTracker,
    state: SchedulerState,
    turn: usize,
    pending_feedback: Vec<String>,
    best: Option<ScoredProposal>,
    finalize_issued: bool,
    /// Directive waiting for the closer's next turn
    finalize_directive: Option<String>,
    finalize_delivered: bool,
    counters: ProposalCounters,
    records: Vec<TurnRecord>,
}

impl<E: Environment> TurnScheduler<E> {
    /// Create a scheduler.
    ///
    /// # Arguments
    /// * `config` - Validated before use
    /// * `env` - Ground truth and adjudication rules
    /// * `participants` - Round-robin order; length must match `config.participants`
    /// * `seed` - Seed for the channel noise
    pub fn new(
        config: KernelConfig,
        env: E,
        participants: Vec<Participant>,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;
        if participants.len() != config.participants {
            bail!(
                "expected {} participants, got {}",
                config.participants,
                participants.len()
            );
        }

        let channel = NoisyChannel::new(
            config.max_message_len,
            config.noise.early,
            config.proposal_marker.clone(),
            seed,
        );
        let parser = ClaimParser::new(&config.proposal_marker, &config.prepare_marker)?;
        let tracker = ProtocolStateTracker::new(env.fields(), &config);

        Ok(Self {
            config,
            env,
            participants,
            channel,
            parser,
            tracker,
            state: SchedulerState::Running,
            turn: 0,
            pending_feedback: Vec::new(),
            best: None,
            finalize_issued: false,
            finalize_directive: None,
            finalize_delivered: false,
            counters: ProposalCounters::default(),
            records: Vec::new(),
        })
    }

    /// Play until a terminal state is reached.
    pub async fn run<C: Collaborator + ?Sized>(&mut self, collaborator: &C) -> RunOutcome {
        info!(
            participants = self.participants.len(),
            turn_budget = self.config.turn_budget,
            "Starting run"
        );
        while self.step(collaborator).await.is_some() {}
        info!(
            state = %self.state,
            turns = self.turn,
            best_score = self.best.as_ref().map(|b| b.score),
            "Run finished"
        );
        self.outcome()
    }

    /// Play one turn. Returns `None` once the run is terminal.
    pub async fn step<C: Collaborator + ?Sized>(&mut self, collaborator: &C) -> Option<&TurnRecord> {
        if self.state.is_terminal() {
            return None;
        }
        let context = self.next_context();
        let speaker = context.participant.id.clone();
        let utterance = match collaborator.generate(&speaker, &context).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!(speaker = %speaker, turn = context.turn, error = %e, "Collaborator failed, playing empty turn");
                String::new()
            }
        };
        Some(self.apply_utterance(&utterance))
    }

    /// Context for the participant who acts next.
    ///
    /// A pending finalize directive is repeated in every context until the
    /// closer has been handed it.
    pub fn next_context(&self) -> TurnContext {
        let turn = self.turn + 1;
        let mut feedback = self.pending_feedback.clone();
        feedback.extend(self.finalize_directive.iter().cloned());
        TurnContext {
            turn,
            turn_budget: self.config.turn_budget,
            phase: Phase::of(turn, self.config.turn_budget),
            drop_probability: self.config.noise_for_turn(turn),
            participant: self.next_speaker().clone(),
            transcript: self.channel.history_text(),
            fields: self.tracker.snapshot(),
            feedback,
            schema_locked: self.tracker.schema_locked(),
        }
    }

    pub fn next_speaker(&self) -> &Participant {
        &self.participants[self.turn % self.participants.len()]
    }

    /// Whether `id` is targeted by the finalize directive. Without a
    /// designated closer every participant qualifies.
    fn is_closer(&self, id: &str) -> bool {
        self.participants
            .iter()
            .find(|p| p.is_closer)
            .map_or(true, |closer| closer.id == id)
    }

    /// Apply one utterance from the next speaker. Empty text is a no-op turn
    /// that still consumes budget.
    pub fn apply_utterance(&mut self, utterance: &str) -> &TurnRecord {
        let turn = self.turn + 1;
        let phase = Phase::of(turn, self.config.turn_budget);
        let drop_probability = self.config.noise_for_turn(turn);
        self.channel.set_drop_probability(drop_probability);

        let speaker = self.next_speaker().id.clone();
        // Feedback queued for this turn has now been delivered.
        self.pending_feedback.clear();
        if self.finalize_directive.is_some() && self.is_closer(&speaker) {
            self.finalize_directive = None;
            self.finalize_delivered = true;
            debug!(turn = turn, speaker = %speaker, "Finalize directive delivered to closer");
        }

        let entry = self.channel.send(&speaker, turn, utterance);
        let parsed = self.parser.parse(&self.env, &entry);
        if self.tracker.note_utterance(parsed.mentions_schema) {
            info!(turn = turn, speaker = %speaker, "Schema lock reached");
        }
        let absorbed = self.tracker.absorb(&speaker, &parsed.items);
        debug!(
            turn = turn,
            items = parsed.items.len(),
            seeded = absorbed.seeded,
            confirmations = absorbed.confirmations,
            "Absorbed turn"
        );

        let mut feedback = Vec::new();
        let mut verdict = ProposalVerdict::None;

        if let Some(prepare) = &parsed.prepare {
            let score = self.env.score_proposal(prepare);
            self.counters.prepares += 1;
            feedback.push(self.field_feedback("PREPARE CHECK", prepare));
            verdict = ProposalVerdict::Prepared { score };
            info!(turn = turn, speaker = %speaker, score = score, "Prepare proposal checked");
        }

        match parsed.final_attempt {
            FinalAttempt::Absent => {}
            FinalAttempt::Malformed => {
                self.counters.malformed += 1;
                feedback.push(format!(
                    "MALFORMED PROPOSAL from {}: the {} payload did not parse or is missing cells. \
                     Refocus on confirming unknown fields, then resend one complete JSON line.",
                    speaker, self.config.proposal_marker
                ));
                verdict = ProposalVerdict::Malformed;
                info!(turn = turn, speaker = %speaker, "Malformed final proposal");
            }
            FinalAttempt::Valid(proposal) => {
                verdict = self.adjudicate_final(turn, &speaker, proposal, &mut feedback);
            }
        }

        if !self.state.is_terminal() && turn >= self.config.turn_budget {
            self.state = SchedulerState::TerminatedBudget;
        }

        self.turn = turn;
        self.pending_feedback = feedback.clone();

        if !self.state.is_terminal()
            && !self.finalize_issued
            && turn == self.config.finalize_turn()
            && self.tracker.all_quorums_met()
        {
            self.finalize_issued = true;
            let closer = self
                .participants
                .iter()
                .find(|p| p.is_closer)
                .map_or("the closer", |p| p.id.as_str());
            let directive = format!(
                "FINALIZE: every field has quorum. {} must submit {} with the canonical values on its very next turn.",
                closer, self.config.proposal_marker
            );
            info!(turn = turn, closer = closer, "Forced finalization directive issued");
            feedback.push(directive.clone());
            self.finalize_directive = Some(directive);
        }

        self.records.push(TurnRecord {
            turn,
            speaker,
            phase,
            drop_probability,
            empty: utterance.trim().is_empty(),
            items: parsed.items.len(),
            absorbed,
            verdict,
            quorum_fields: self.tracker.quorum_count(),
            feedback_issued: feedback,
        });
        &self.records[self.records.len() - 1]
    }

    fn adjudicate_final(
        &mut self,
        turn: usize,
        speaker: &str,
        proposal: Proposal,
        feedback: &mut Vec<String>,
    ) -> ProposalVerdict {
        let score = self.env.score_proposal(&proposal);

        if !self.tracker.all_quorums_met() {
            self.counters.premature += 1;
            let missing: Vec<String> = self
                .tracker
                .snapshot()
                .into_iter()
                .filter(|s| !s.quorum_met)
                .map(|s| s.field.to_string())
                .collect();
            feedback.push(format!(
                "PROPOSAL REJECTED: quorum not met for {}. CONFIRM these before proposing.",
                missing.join(", ")
            ));
            feedback.push(self.field_feedback("PROPOSAL CHECK", &proposal));
            info!(turn = turn, speaker = speaker, score = score, "Premature final proposal rejected");
            return ProposalVerdict::Premature { score };
        }

        self.counters.accepted += 1;
        if self.best.as_ref().map_or(true, |b| score >= b.score) {
            self.best = Some(ScoredProposal {
                turn,
                speaker: speaker.to_string(),
                score,
                proposal: proposal.clone(),
            });
        }
        info!(turn = turn, speaker = speaker, score = score, "Final proposal accepted");

        if score >= 1.0 {
            self.state = SchedulerState::TerminatedPerfect;
        } else if self.finalize_delivered && self.is_closer(speaker) {
            self.state = SchedulerState::TerminatedBestEffort;
        } else {
            feedback.push(self.field_feedback("PROPOSAL CHECK", &proposal));
        }
        ProposalVerdict::Accepted { score }
    }

    /// Per-field correctness of `proposal`, as DELTA feedback.
    fn field_feedback(&self, label: &str, proposal: &Proposal) -> String {
        let slots: Vec<String> = self
            .tracker
            .fields()
            .iter()
            .map(|field| match proposal.get(field) {
                Some(value) if self.env.is_correct(field, value) => format!("{}={} ok", field, value),
                Some(value) => format!("{}={} wrong", field, value),
                None => format!("{} missing", field),
            })
            .collect();
        format!("{} DELTA: {}", label, slots.join(" | "))
    }

    pub fn outcome(&self) -> RunOutcome {
        RunOutcome {
            state: self.state,
            turns_used: self.turn,
            best: self.best.clone(),
            counters: self.counters,
            schema_locked: self.tracker.schema_locked(),
            quorum_fields: self.tracker.quorum_count(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn turn(&self) -> usize {
        self.turn
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn channel(&self) -> &NoisyChannel {
        &self.channel
    }

    pub fn tracker(&self) -> &ProtocolStateTracker {
        &self.tracker
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        self.channel.transcript()
    }

    pub fn best(&self) -> Option<&ScoredProposal> {
        self.best.as_ref()
    }

    pub fn counters(&self) -> ProposalCounters {
        self.counters
    }

    pub fn records(&self) -> &[TurnRecord] {
        &self.records
    }

    pub fn pending_feedback(&self) -> &[String] {
        &self.pending_feedback
    }
}
