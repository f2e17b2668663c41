//! Quorum Kernel: turn-based collaborative reconstruction over a noisy channel
//!
//! Participants holding partial private facts take turns posting short
//! utterances through a lossy, bandwidth-capped channel. A tolerant parser
//! turns the delivered text into claims and confirmations, a tracker settles
//! each field once enough distinct participants confirm it, and a scheduler
//! accepts a final proposal only after every field has quorum.
//!
//! The kernel is domain-agnostic: the hidden state, value aliases and scoring
//! live behind the [`Environment`] trait, and utterances come from a
//! [`Collaborator`].

pub mod channel;
pub mod config;
pub mod environment;
pub mod parser;
pub mod scheduler;
pub mod tracker;

pub use channel::{ChannelStats, NoisyChannel, TranscriptEntry};
pub use config::{FlipPolicy, KernelConfig, NoiseSchedule, Phase};
pub use environment::{Environment, FieldKey, Proposal};
pub use parser::{ClaimParser, FinalAttempt, ParsedItem, ParsedTurn, TableStatus};
pub use scheduler::{
    Collaborator, Participant, ProposalCounters, ProposalVerdict, RunOutcome, SchedulerState,
    ScoredProposal, TurnContext, TurnRecord, TurnScheduler,
};
pub use tracker::{AbsorbSummary, FieldStatus, ProtocolStateTracker, TABLE_CONFIRMER};
