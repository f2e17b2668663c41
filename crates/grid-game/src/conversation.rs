//! Participant roles and prompt rendering for the grid game.
//!
//! The scheduler hands over a [`TurnContext`]; this module turns it into the
//! system and user prompts sent to the text-generation collaborator. The
//! rendered prompt is the only place protocol state becomes natural language.

use quorum_kernel::{Participant, Phase, TurnContext};
use serde::{Deserialize, Serialize};

use crate::environment::{Attribute, CELLS};

/// Fixed role alignment of the four seats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantRole {
    /// Keeps keys in canonical form and merges the shared picture
    SchemaGuardian,
    /// Pushes private facts out early
    FactBroadcaster,
    /// Challenges contradictions and drives confirmations
    ConsistencyChecker,
    /// Issues the final proposal
    ProposerCloser,
}

pub const SEAT_ROLES: [ParticipantRole; 4] = [
    ParticipantRole::SchemaGuardian,
    ParticipantRole::FactBroadcaster,
    ParticipantRole::ConsistencyChecker,
    ParticipantRole::ProposerCloser,
];

impl ParticipantRole {
    /// Role for a zero-based seat. Seats beyond four cycle through the
    /// non-closing roles so there is exactly one closer.
    pub fn for_seat(seat: usize, n_seats: usize) -> Self {
        if seat + 1 == n_seats {
            Self::ProposerCloser
        } else {
            SEAT_ROLES[seat % 3]
        }
    }

    pub fn is_closer(self) -> bool {
        self == Self::ProposerCloser
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::SchemaGuardian => "Schema Guardian + Aggregator",
            Self::FactBroadcaster => "Fact Broadcaster",
            Self::ConsistencyChecker => "Consistency Checker",
            Self::ProposerCloser => "Proposer/Closer",
        }
    }
}

impl std::fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Build the ordered participant list `Agent1..AgentN`.
pub fn build_participants(private_facts: Vec<Vec<String>>) -> Vec<Participant> {
    let n = private_facts.len();
    private_facts
        .into_iter()
        .enumerate()
        .map(|(seat, facts)| {
            let role = ParticipantRole::for_seat(seat, n);
            Participant {
                id: format!("Agent{}", seat + 1),
                role: role.label().to_string(),
                is_closer: role.is_closer(),
                private_facts: facts,
            }
        })
        .collect()
}

/// Canonical key list shown once the schema is locked.
pub fn canonical_schema() -> String {
    CELLS
        .iter()
        .map(|cell| {
            [Attribute::Color, Attribute::Shape]
                .iter()
                .map(|attr| format!("{}.{}", cell, attr.code()))
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect::<Vec<_>>()
        .join("|")
}

pub const GAME_SYSTEM_PROMPT: &str = "You are one of several agents reconstructing a hidden grid \
    over a noisy, length-capped channel. Reply with ONE short line in the compact notation. \
    No explanations.";

/// Prompt templates for the grid game.
pub struct PromptTemplates;

impl PromptTemplates {
    pub fn public_brief(n_participants: usize, proposal_marker: &str) -> String {
        format!(
            r#"You are 1 of {n} agents coordinating to reconstruct a 2x2 grid: A1, A2, B1, B2.
Each cell has Color (C) and Shape (S). Colors: Red, Blue, Green, Yellow. Shapes: Circle, Square, Triangle, Star.
No two cells share a color, no two cells share a shape.
Compact schema: cell.attr=value (e.g. A2.C=Red, B1.S=Circle). Use ? for unknown.
Messages are capped and slightly noised. Evolve robust shorthand.
To propose the final solution, output a single line starting with:
{marker}{{"A1":{{"Color":"...","Shape":"..."}},"A2":{{...}},"B1":{{...}},"B2":{{...}}}}"#,
            n = n_participants,
            marker = proposal_marker
        )
    }

    fn guidance(ctx: &TurnContext, prepare_marker: &str, proposal_marker: &str) -> String {
        let phase_hint = match ctx.phase {
            Phase::Early => "EARLY: dump your private facts compactly.",
            Phase::Mid => "MID: consolidate and confirm; focus only on unknown or unconfirmed fields.",
            Phase::Late => "LATE: one unknown slot per turn; the Closer proposes once every field has quorum.",
        };
        format!(
            r#"Guidance:
- Only state NEW or CORRECTED facts; separate items with '|'.
- Confirm slotwise with 'CONFIRM cell.attr=value' (e.g. CONFIRM B1.S=Circle); avoid generic OK.
- A field counts as settled only after 2 different agents CONFIRM the same value.
- List unknown fields at the end: 'UNKNOWN: A1.S, B2.C'.
- Near the end emit a status table: TABLE: A1.C=Red[OK], A1.S=?[UNK], ... with tags OK/UNK/REVISE.
- Rehearse with {prepare}{{...}} before the final {proposal} line; you will get per-field feedback.
- Turn {turn}/{budget}. {phase_hint}"#,
            prepare = prepare_marker,
            proposal = proposal_marker,
            turn = ctx.turn,
            budget = ctx.turn_budget,
            phase_hint = phase_hint
        )
    }

    fn field_table(ctx: &TurnContext) -> String {
        ctx.fields
            .iter()
            .map(|s| {
                let value = s.value.as_deref().unwrap_or("?");
                let tag = if s.quorum_met { "OK" } else { "UNK" };
                format!("{}={}[{} {}]", s.field, value, tag, s.confirmers)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Full user prompt for the acting participant.
    pub fn turn_prompt(
        ctx: &TurnContext,
        n_participants: usize,
        prepare_marker: &str,
        proposal_marker: &str,
    ) -> String {
        let p = &ctx.participant;
        let facts = if p.private_facts.is_empty() {
            "(no private facts visible)".to_string()
        } else {
            p.private_facts.join("\n")
        };
        let transcript = if ctx.transcript.is_empty() {
            "(none)"
        } else {
            ctx.transcript.as_str()
        };

        let mut prompt = format!(
            "{brief}\nYOU ARE {id}. ROLE={role}\nYOUR PRIVATE FACTS:\n{facts}\n\n\
             TRANSCRIPT SO FAR (noised):\n{transcript}\n\n\
             SHARED STATE (value[quorum confirmers]):\n{table}\n\n{guidance}",
            brief = Self::public_brief(n_participants, proposal_marker),
            id = p.id,
            role = p.role,
            facts = facts,
            transcript = transcript,
            table = Self::field_table(ctx),
            guidance = Self::guidance(ctx, prepare_marker, proposal_marker),
        );

        if !ctx.feedback.is_empty() {
            prompt.push_str("\n\nMACHINE FEEDBACK:\n");
            prompt.push_str(&ctx.feedback.join("\n"));
        }

        if ctx.schema_locked {
            prompt.push_str(&format!(
                "\n\nSCHEMA LOCKED: use canonical keys exactly: {}.\n\
                 Normalize malformed keys to this schema before sending.",
                canonical_schema()
            ));
        }
        prompt
    }
}
