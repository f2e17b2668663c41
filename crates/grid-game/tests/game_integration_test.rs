//! Integration tests for complete grid games.
//!
//! Games are driven by scripted collaborators instead of a vLLM server:
//! - scripted claim/confirmation scenarios on a seeded grid
//! - cooperative play reaching a perfect, quorum-gated proposal
//! - quorum gating of early proposals
//! - forced finalization reaching the closer and ending in best effort
//! - collaborator failures degrading to empty turns

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use quorum_kernel::{
    Collaborator, Environment, FieldKey, KernelConfig, NoiseSchedule, Proposal, SchedulerState,
    TurnContext, TurnScheduler,
};

use grid_game::conversation::build_participants;
use grid_game::environment::HiddenEnvironment;
use grid_game::experiment::play_game;
use grid_game::generator::{GameGenerator, GeneratedGame, GeneratorConfig};
use grid_game::report::ReportWriter;

fn game(seed: u64) -> GeneratedGame {
    GameGenerator::new(GeneratorConfig {
        participants: 4,
        seed: Some(seed),
    })
    .generate()
}

fn quiet_kernel() -> KernelConfig {
    KernelConfig {
        noise: NoiseSchedule {
            early: 0.0,
            mid: 0.0,
            late: 0.0,
        },
        ..Default::default()
    }
}

fn truth(env: &HiddenEnvironment) -> Vec<(FieldKey, String)> {
    env.fields()
        .into_iter()
        .filter_map(|f| env.value_of(&f).map(|v| (f, v.to_string())))
        .collect()
}

fn confirm_line(facts: &[(FieldKey, String)]) -> String {
    facts
        .iter()
        .map(|(f, v)| format!("CONFIRM {}={}", f, v))
        .collect::<Vec<_>>()
        .join(" ")
}

fn propose_line(values: &[(FieldKey, String)]) -> String {
    let mut proposal = Proposal::new();
    for (f, v) in values {
        proposal.insert(f.clone(), v.clone());
    }
    format!("PROPOSE={}", HiddenEnvironment::proposal_to_wire(&proposal))
}

/// Collaborator backed by a closure over the turn context.
struct FnCollaborator<F> {
    respond: F,
}

#[async_trait]
impl<F> Collaborator for FnCollaborator<F>
where
    F: Fn(&str, &TurnContext) -> Result<String> + Send + Sync,
{
    async fn generate(&self, participant_id: &str, context: &TurnContext) -> Result<String> {
        (self.respond)(participant_id, context)
    }
}

/// Participants confirm their private facts and everything already in the
/// shared state; the closer proposes the shared state once every field has
/// quorum.
fn cooperative(ctx: &TurnContext) -> Result<String> {
    let quorum_complete = ctx.fields.iter().all(|s| s.quorum_met);
    let shared: Vec<(FieldKey, String)> = ctx
        .fields
        .iter()
        .filter_map(|s| s.value.clone().map(|v| (s.field.clone(), v)))
        .collect();

    if quorum_complete && ctx.participant.is_closer {
        return Ok(propose_line(&shared));
    }

    let mut items: Vec<(FieldKey, String)> = ctx
        .participant
        .private_facts
        .iter()
        .filter_map(|fact| {
            let (key, value) = fact.split_once('=')?;
            Some((key.parse().ok()?, value.to_string()))
        })
        .collect();
    for item in shared {
        if !items.iter().any(|(f, _)| *f == item.0) {
            items.push(item);
        }
    }
    Ok(confirm_line(&items))
}

#[test]
fn test_seed_7_confirmation_scenario() {
    let game = game(7);
    let participants = build_participants(game.private_facts.clone());
    let mut scheduler = TurnScheduler::new(quiet_kernel(), game.env, participants, 7).unwrap();
    let field: FieldKey = "A1.C".parse().unwrap();

    scheduler.apply_utterance("A1.C=Green");
    assert_eq!(scheduler.tracker().canonical(&field), Some("Green"));

    scheduler.apply_utterance("CONFIRM A1.C=Green");
    assert!(!scheduler.tracker().quorum_met(&field));

    scheduler.apply_utterance("CONFIRM A1.C=Green");
    let canonical = scheduler.tracker().canonical_state();
    assert_eq!(canonical[&field], "Green");
    assert!(scheduler.tracker().quorum_met(&field));
}

#[test]
fn test_misspelled_claim_is_canonicalized() {
    let game = game(7);
    let participants = build_participants(game.private_facts.clone());
    let mut scheduler = TurnScheduler::new(quiet_kernel(), game.env, participants, 7).unwrap();

    scheduler.apply_utterance("A1.C=Gren | B2.S=Circel | A2.C=Purple");
    let canonical = scheduler.tracker().canonical_state();
    assert_eq!(canonical[&"A1.C".parse::<FieldKey>().unwrap()], "Green");
    assert_eq!(canonical[&"B2.S".parse::<FieldKey>().unwrap()], "Circle");
    assert!(!canonical.contains_key(&"A2.C".parse::<FieldKey>().unwrap()));
}

#[tokio::test]
async fn test_cooperative_game_reaches_perfect_proposal() {
    let collaborator = FnCollaborator {
        respond: |_: &str, ctx: &TurnContext| cooperative(ctx),
    };
    let result = play_game(&quiet_kernel(), game(7), &collaborator, None, 0, vec![])
        .await
        .unwrap();

    assert_eq!(result.state, SchedulerState::TerminatedPerfect);
    assert_eq!(result.best_score, 1.0);
    assert_eq!(result.quorum_fields, 8);
    assert_eq!(result.counters.accepted, 1);
    assert_eq!(result.counters.premature, 0);
    assert!(result.turns_used < 24);
    assert_eq!(result.best_proposal.as_ref(), Some(&result.ground_truth));
    // The perfect proposal ends the game on the closer's turn.
    assert_eq!(result.transcript.last().unwrap().speaker, "Agent4");
}

#[tokio::test]
async fn test_perfect_proposal_without_quorum_is_never_accepted() {
    let game = game(11);
    let perfect = propose_line(&truth(&game.env));
    let collaborator = FnCollaborator {
        respond: move |_: &str, _: &TurnContext| -> Result<String> { Ok(perfect.clone()) },
    };
    let result = play_game(&quiet_kernel(), game, &collaborator, None, 0, vec![])
        .await
        .unwrap();

    assert_eq!(result.state, SchedulerState::TerminatedBudget);
    assert_eq!(result.turns_used, 24);
    assert!(result.best_proposal.is_none());
    assert_eq!(result.best_score, 0.0);
    assert_eq!(result.counters.premature, 24);
    assert_eq!(result.counters.accepted, 0);
}

#[tokio::test]
async fn test_forced_finalization_reaches_closer() {
    let game = game(3);
    let truth = truth(&game.env);
    let mut wrong = truth.clone();
    // Swap two colors: still a valid proposal, two fields wrong.
    let (a, b) = (wrong[0].1.clone(), wrong[2].1.clone());
    wrong[0].1 = b;
    wrong[2].1 = a;
    let confirm = confirm_line(&truth);
    let imperfect = propose_line(&wrong);

    // (turn, speaker, saw FINALIZE)
    let seen: Arc<Mutex<Vec<(usize, String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let collaborator = FnCollaborator {
        respond: move |id: &str, ctx: &TurnContext| -> Result<String> {
            let finalize = ctx.feedback.iter().any(|f| f.starts_with("FINALIZE"));
            log.lock().unwrap().push((ctx.turn, id.to_string(), finalize));
            if finalize && ctx.participant.is_closer {
                Ok(imperfect.clone())
            } else {
                Ok(confirm.clone())
            }
        },
    };
    let kernel = quiet_kernel();
    let result = play_game(&kernel, game, &collaborator, None, 0, vec![])
        .await
        .unwrap();

    let directive = &result.turns[kernel.finalize_turn() - 1].feedback_issued;
    assert!(directive.iter().any(|f| f.contains("Agent4")));

    let seen = seen.lock().unwrap();
    let closer_turn = seen
        .iter()
        .find(|(turn, id, _)| *turn > kernel.finalize_turn() && id == "Agent4")
        .unwrap();
    assert!(closer_turn.2, "closer must receive the directive");
    assert!(seen
        .iter()
        .filter(|(turn, _, _)| *turn <= kernel.finalize_turn())
        .all(|(_, _, finalize)| !finalize));

    assert_eq!(result.state, SchedulerState::TerminatedBestEffort);
    assert_eq!(result.turns_used, closer_turn.0);
    assert_eq!(result.best_turn, Some(closer_turn.0));
    assert_eq!(result.best_score, 0.75);
    assert_eq!(result.transcript.last().unwrap().speaker, "Agent4");
}

#[tokio::test]
async fn test_failing_collaborator_plays_empty_turns() {
    let collaborator = FnCollaborator {
        respond: |_: &str, _: &TurnContext| -> Result<String> { bail!("connection refused") },
    };
    let result = play_game(&KernelConfig::default(), game(5), &collaborator, None, 0, vec![])
        .await
        .unwrap();

    assert_eq!(result.state, SchedulerState::TerminatedBudget);
    assert_eq!(result.transcript.len(), 24);
    assert!(result.turns.iter().all(|t| t.empty));
    assert!(result.best_proposal.is_none());
}

#[tokio::test]
async fn test_noisy_game_keeps_round_robin_and_is_reproducible() {
    let kernel = KernelConfig {
        noise: NoiseSchedule {
            early: 0.2,
            mid: 0.3,
            late: 0.2,
        },
        ..Default::default()
    };
    let collaborator = FnCollaborator {
        respond: |_: &str, ctx: &TurnContext| cooperative(ctx),
    };

    let first = play_game(&kernel, game(21), &collaborator, None, 0, vec![])
        .await
        .unwrap();
    let second = play_game(&kernel, game(21), &collaborator, None, 1, vec![])
        .await
        .unwrap();

    for (i, entry) in first.transcript.iter().enumerate() {
        assert_eq!(entry.turn, i + 1);
        assert_eq!(entry.speaker, format!("Agent{}", i % 4 + 1));
        assert!(entry.capped.chars().count() <= kernel.max_message_len || entry.raw.starts_with("PROPOSE="));
    }
    assert!(first.state.is_terminal());
    if first.state == SchedulerState::TerminatedPerfect {
        assert_eq!(first.quorum_fields, 8);
    }

    let noised = |r: &grid_game::results::GameResult| -> Vec<String> {
        r.transcript.iter().map(|e| e.noised.clone()).collect()
    };
    assert_eq!(noised(&first), noised(&second));
    assert_eq!(first.state, second.state);
}

struct CapturingWriter {
    inputs: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ReportWriter for CapturingWriter {
    async fn summarize(&self, synthesis_input: &str) -> Result<String> {
        self.inputs.lock().unwrap().push(synthesis_input.to_string());
        Ok("emergent shorthand observed".to_string())
    }
}

#[tokio::test]
async fn test_report_is_requested_once_with_best_proposal() {
    let inputs = Arc::new(Mutex::new(Vec::new()));
    let writer = CapturingWriter {
        inputs: inputs.clone(),
    };
    let collaborator = FnCollaborator {
        respond: |_: &str, ctx: &TurnContext| cooperative(ctx),
    };
    let result = play_game(&quiet_kernel(), game(9), &collaborator, Some(&writer as &dyn ReportWriter), 0, vec![])
        .await
        .unwrap();

    assert_eq!(result.report.as_deref(), Some("emergent shorthand observed"));
    let inputs = inputs.lock().unwrap();
    assert_eq!(inputs.len(), 1);
    assert!(inputs[0].contains("Transcript:\nAgent1@1: CONFIRM"));
    assert!(inputs[0].contains("Score: 100.0%"));
}

#[test]
fn test_generated_games_distribute_facts_without_loss() {
    for seed in 0..50 {
        let game = game(seed);
        let all = game.env.facts();
        for fact in &all {
            assert!(game.private_facts.iter().any(|held| held.contains(fact)));
        }
        assert!(game.private_facts.iter().all(|held| held.len() < all.len()));
    }
}
