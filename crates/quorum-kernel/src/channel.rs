//! NoisyChannel: a lossy, bandwidth-limited message bus with a full transcript.
//!
//! Every message is recorded in three variants:
//! - `raw`: exactly what the speaker produced (visible only to the adjudicator)
//! - `capped`: truncated to the bandwidth limit
//! - `noised`: the capped text after random per-character drops
//!
//! Only the noised variant is shown to participants. Messages that start with
//! the proposal marker bypass both steps so final answers stay parseable.

use std::collections::HashMap;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One delivered message. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub turn: usize,
    pub speaker: String,
    pub raw: String,
    pub capped: String,
    pub noised: String,
}

/// Aggregate channel statistics.
///
/// `top_terms` is a crude signal for emerging shorthand: the most frequent
/// whitespace-delimited tokens in the noised corpus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub n_messages: usize,
    pub avg_len: f64,
    pub avg_len_raw: f64,
    pub top_terms: Vec<(String, usize)>,
}

const TOP_TERMS: usize = 10;

/// Lossy channel with a seeded noise source.
#[derive(Debug, Clone)]
pub struct NoisyChannel {
    max_len: usize,
    drop_probability: f64,
    proposal_marker: String,
    rng: ChaCha8Rng,
    transcript: Vec<TranscriptEntry>,
}

impl NoisyChannel {
    /// Create a channel.
    ///
    /// # Arguments
    /// * `max_len` - Character cap for non-proposal messages
    /// * `drop_probability` - Initial per-character drop probability
    /// * `proposal_marker` - Prefix that exempts a message from corruption
    /// * `seed` - Seed for the noise source
    pub fn new(
        max_len: usize,
        drop_probability: f64,
        proposal_marker: impl Into<String>,
        seed: u64,
    ) -> Self {
        Self {
            max_len,
            drop_probability: drop_probability.clamp(0.0, 1.0),
            proposal_marker: proposal_marker.into(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            transcript: Vec::new(),
        }
    }

    pub fn drop_probability(&self) -> f64 {
        self.drop_probability
    }

    /// Set the drop probability; the scheduler calls this once per turn.
    pub fn set_drop_probability(&mut self, p: f64) {
        self.drop_probability = p.clamp(0.0, 1.0);
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Deliver a message and append it to the transcript.
    pub fn send(&mut self, speaker: &str, turn: usize, message: &str) -> TranscriptEntry {
        let (capped, noised) = if message.trim_start().starts_with(&self.proposal_marker) {
            (message.to_string(), message.to_string())
        } else {
            let capped = self.apply_bandwidth_cap(message);
            let noised = self.apply_noise(&capped);
            (capped, noised)
        };

        debug!(
            speaker = speaker,
            turn = turn,
            raw_len = message.chars().count(),
            noised_len = noised.chars().count(),
            "Message delivered"
        );

        let entry = TranscriptEntry {
            turn,
            speaker: speaker.to_string(),
            raw: message.to_string(),
            capped,
            noised,
        };
        self.transcript.push(entry.clone());
        entry
    }

    fn apply_bandwidth_cap(&self, message: &str) -> String {
        message.chars().take(self.max_len).collect()
    }

    fn apply_noise(&mut self, message: &str) -> String {
        let p = self.drop_probability;
        message
            .chars()
            .filter(|ch| matches!(ch, '\n' | '\r' | '\t') || self.rng.random::<f64>() >= p)
            .collect()
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.transcript.last()
    }

    /// Human-readable log built from the noised variant only.
    pub fn history_text(&self) -> String {
        self.transcript
            .iter()
            .map(|e| format!("{}@{}: {}", e.speaker, e.turn, e.noised))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn stats(&self) -> ChannelStats {
        if self.transcript.is_empty() {
            return ChannelStats::default();
        }

        let n = self.transcript.len() as f64;
        let avg_len = self
            .transcript
            .iter()
            .map(|e| e.noised.chars().count())
            .sum::<usize>() as f64
            / n;
        let avg_len_raw = self
            .transcript
            .iter()
            .map(|e| e.raw.chars().count())
            .sum::<usize>() as f64
            / n;

        // Count in first-seen order so the stable sort breaks ties by appearance.
        let mut order: Vec<&str> = Vec::new();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for token in self.transcript.iter().flat_map(|e| e.noised.split_whitespace()) {
            let count = counts.entry(token).or_insert(0);
            if *count == 0 {
                order.push(token);
            }
            *count += 1;
        }
        let mut top_terms: Vec<(String, usize)> = order
            .into_iter()
            .map(|t| (t.to_string(), counts[t]))
            .collect();
        top_terms.sort_by(|a, b| b.1.cmp(&a.1));
        top_terms.truncate(TOP_TERMS);

        ChannelStats {
            n_messages: self.transcript.len(),
            avg_len,
            avg_len_raw,
            top_terms,
        }
    }
}
