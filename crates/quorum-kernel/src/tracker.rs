//! ProtocolStateTracker: shared belief state with per-field confirmation quorums.
//!
//! Two tiers of evidence:
//! - a claim seeds an empty slot (first claim wins; later claims never overwrite)
//! - a confirmation credits its speaker in the [`ConfirmationLedger`]
//!
//! A field satisfies quorum when the confirmers of its canonical value reach
//! the threshold. Confirmations are never retracted, so the ledger only grows.
//! Under [`FlipPolicy::Majority`] a non-canonical value whose confirmers reach
//! the threshold replaces the canonical value.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{FlipPolicy, KernelConfig};
use crate::environment::FieldKey;
use crate::parser::{ParsedItem, TableStatus};

/// Synthetic confirmer credited for table entries tagged OK.
pub const TABLE_CONFIRMER: &str = "table";

/// Field -> value -> distinct confirmers. Grows monotonically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfirmationLedger {
    entries: BTreeMap<FieldKey, BTreeMap<String, BTreeSet<String>>>,
}

impl ConfirmationLedger {
    /// Record `confirmer` for `value`. Returns false if already recorded.
    pub fn add(&mut self, field: &FieldKey, value: &str, confirmer: &str) -> bool {
        self.entries
            .entry(field.clone())
            .or_default()
            .entry(value.to_string())
            .or_default()
            .insert(confirmer.to_string())
    }

    pub fn confirmers(&self, field: &FieldKey, value: &str) -> Option<&BTreeSet<String>> {
        self.entries.get(field).and_then(|values| values.get(value))
    }

    pub fn count(&self, field: &FieldKey, value: &str) -> usize {
        self.confirmers(field, value).map_or(0, BTreeSet::len)
    }

    /// All values ever confirmed for `field` with their confirmer counts.
    pub fn tally(&self, field: &FieldKey) -> Vec<(String, usize)> {
        self.entries
            .get(field)
            .map(|values| values.iter().map(|(v, c)| (v.clone(), c.len())).collect())
            .unwrap_or_default()
    }
}

/// Point-in-time view of one field, handed to the prompt layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldStatus {
    pub field: FieldKey,
    pub value: Option<String>,
    pub confirmers: usize,
    pub quorum_met: bool,
}

/// A canonical value replaced by an overriding set of confirmations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flip {
    pub field: FieldKey,
    pub from: String,
    pub to: String,
}

/// What one `absorb` call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsorbSummary {
    pub seeded: usize,
    pub confirmations: usize,
    pub flips: Vec<Flip>,
}

/// Canonical state, confirmation ledger and schema lock.
#[derive(Debug, Clone)]
pub struct ProtocolStateTracker {
    fields: Vec<FieldKey>,
    canonical: BTreeMap<FieldKey, Option<String>>,
    ledger: ConfirmationLedger,
    quorum_threshold: usize,
    flip_policy: FlipPolicy,
    schema_votes: usize,
    schema_lock_votes: usize,
    schema_locked: bool,
}

impl ProtocolStateTracker {
    /// Start with every field unknown.
    pub fn new(fields: Vec<FieldKey>, config: &KernelConfig) -> Self {
        let canonical = fields.iter().map(|f| (f.clone(), None)).collect();
        Self {
            fields,
            canonical,
            ledger: ConfirmationLedger::default(),
            quorum_threshold: config.quorum_threshold,
            flip_policy: config.flip_policy,
            schema_votes: 0,
            schema_lock_votes: config.schema_lock_votes,
            schema_locked: false,
        }
    }

    /// Apply the parsed items of one turn spoken by `speaker`.
    pub fn absorb(&mut self, speaker: &str, items: &[ParsedItem]) -> AbsorbSummary {
        let mut summary = AbsorbSummary::default();

        for item in items {
            match item {
                ParsedItem::Claim { field, value } => {
                    if self.seed(field, value) {
                        summary.seeded += 1;
                    }
                }
                ParsedItem::Confirmation { field, value } => {
                    self.confirm(field, value, speaker, &mut summary);
                }
                ParsedItem::TableRow {
                    field,
                    value,
                    status: TableStatus::Ok,
                } => {
                    self.confirm(field, value, TABLE_CONFIRMER, &mut summary);
                }
                ParsedItem::TableRow { .. } => {}
            }
        }

        summary
    }

    fn seed(&mut self, field: &FieldKey, value: &str) -> bool {
        match self.canonical.get_mut(field) {
            Some(slot) if slot.is_none() => {
                debug!(field = %field, value = value, "Seeded canonical value");
                *slot = Some(value.to_string());
                true
            }
            _ => false,
        }
    }

    fn confirm(
        &mut self,
        field: &FieldKey,
        value: &str,
        confirmer: &str,
        summary: &mut AbsorbSummary,
    ) {
        if !self.canonical.contains_key(field) {
            return;
        }
        if self.ledger.add(field, value, confirmer) {
            summary.confirmations += 1;
        }
        if self.seed(field, value) {
            summary.seeded += 1;
            return;
        }

        let Some(current) = self.canonical(field).map(str::to_string) else {
            return;
        };
        if current == value || self.ledger.count(field, value) < self.quorum_threshold {
            return;
        }
        if self.flip_policy == FlipPolicy::FirstQuorumWins && self.quorum_met(field) {
            return;
        }

        info!(
            field = %field,
            from = %current,
            to = value,
            confirmers = self.ledger.count(field, value),
            "Canonical value flipped by confirmations"
        );
        self.canonical.insert(field.clone(), Some(value.to_string()));
        summary.flips.push(Flip {
            field: field.clone(),
            from: current,
            to: value.to_string(),
        });
    }

    /// Count an utterance toward the schema lock. Returns true when this call locks it.
    pub fn note_utterance(&mut self, mentions_schema: bool) -> bool {
        if mentions_schema {
            self.schema_votes += 1;
        }
        if !self.schema_locked && self.schema_votes >= self.schema_lock_votes {
            self.schema_locked = true;
            info!(votes = self.schema_votes, "Schema locked");
            return true;
        }
        false
    }

    pub fn schema_locked(&self) -> bool {
        self.schema_locked
    }

    pub fn schema_votes(&self) -> usize {
        self.schema_votes
    }

    pub fn fields(&self) -> &[FieldKey] {
        &self.fields
    }

    pub fn canonical(&self, field: &FieldKey) -> Option<&str> {
        self.canonical.get(field).and_then(|v| v.as_deref())
    }

    pub fn ledger(&self) -> &ConfirmationLedger {
        &self.ledger
    }

    /// Confirmers of the field's current canonical value.
    pub fn confirmer_count(&self, field: &FieldKey) -> usize {
        self.canonical(field)
            .map_or(0, |value| self.ledger.count(field, value))
    }

    pub fn quorum_met(&self, field: &FieldKey) -> bool {
        self.confirmer_count(field) >= self.quorum_threshold
    }

    pub fn all_quorums_met(&self) -> bool {
        self.fields.iter().all(|f| self.quorum_met(f))
    }

    pub fn quorum_count(&self) -> usize {
        self.fields.iter().filter(|f| self.quorum_met(f)).count()
    }

    pub fn known_count(&self) -> usize {
        self.canonical.values().filter(|v| v.is_some()).count()
    }

    pub fn snapshot(&self) -> Vec<FieldStatus> {
        self.fields
            .iter()
            .map(|f| FieldStatus {
                field: f.clone(),
                value: self.canonical(f).map(str::to_string),
                confirmers: self.confirmer_count(f),
                quorum_met: self.quorum_met(f),
            })
            .collect()
    }

    /// Canonical values as a plain map, unknown fields omitted.
    pub fn canonical_state(&self) -> BTreeMap<FieldKey, String> {
        self.canonical
            .iter()
            .filter_map(|(f, v)| v.as_ref().map(|v| (f.clone(), v.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> FieldKey {
        s.parse().unwrap()
    }

    fn tracker_with(policy: FlipPolicy) -> ProtocolStateTracker {
        let config = KernelConfig {
            flip_policy: policy,
            ..Default::default()
        };
        let fields = ["A1.C", "A1.S"].iter().map(|s| key(s)).collect();
        ProtocolStateTracker::new(fields, &config)
    }

    fn claim(field: &str, value: &str) -> ParsedItem {
        ParsedItem::Claim {
            field: key(field),
            value: value.to_string(),
        }
    }

    fn confirm(field: &str, value: &str) -> ParsedItem {
        ParsedItem::Confirmation {
            field: key(field),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_first_claim_wins_for_empty_slot() {
        let mut t = tracker_with(FlipPolicy::Majority);
        t.absorb("Agent1", &[claim("A1.C", "Green")]);
        t.absorb("Agent2", &[claim("A1.C", "Red")]);
        assert_eq!(t.canonical(&key("A1.C")), Some("Green"));
        assert!(!t.quorum_met(&key("A1.C")));
    }

    #[test]
    fn test_quorum_after_two_distinct_confirmers() {
        let mut t = tracker_with(FlipPolicy::Majority);
        t.absorb("Agent1", &[claim("A1.C", "Green")]);

        t.absorb("Agent2", &[confirm("A1.C", "Green")]);
        assert!(!t.quorum_met(&key("A1.C")));

        // Repeating a confirmation does not count twice.
        t.absorb("Agent2", &[confirm("A1.C", "Green")]);
        assert!(!t.quorum_met(&key("A1.C")));

        t.absorb("Agent3", &[confirm("A1.C", "Green")]);
        assert_eq!(t.canonical(&key("A1.C")), Some("Green"));
        assert!(t.quorum_met(&key("A1.C")));
        assert!(!t.all_quorums_met());
    }

    #[test]
    fn test_confirmation_seeds_empty_slot() {
        let mut t = tracker_with(FlipPolicy::Majority);
        let summary = t.absorb("Agent1", &[confirm("A1.S", "Star")]);
        assert_eq!(summary.seeded, 1);
        assert_eq!(summary.confirmations, 1);
        assert_eq!(t.canonical(&key("A1.S")), Some("Star"));
    }

    #[test]
    fn test_quorum_survives_later_conflicting_claim() {
        let mut t = tracker_with(FlipPolicy::Majority);
        t.absorb("Agent1", &[confirm("A1.C", "Green")]);
        t.absorb("Agent2", &[confirm("A1.C", "Green")]);
        t.absorb("Agent3", &[claim("A1.C", "Blue")]);
        t.absorb("Agent4", &[confirm("A1.C", "Blue")]);
        assert_eq!(t.canonical(&key("A1.C")), Some("Green"));
        assert!(t.quorum_met(&key("A1.C")));
    }

    #[test]
    fn test_majority_override_flips_canonical() {
        let mut t = tracker_with(FlipPolicy::Majority);
        t.absorb("Agent1", &[claim("A1.C", "Red")]);
        t.absorb("Agent2", &[confirm("A1.C", "Green")]);
        let summary = t.absorb("Agent3", &[confirm("A1.C", "Green")]);
        assert_eq!(summary.flips.len(), 1);
        assert_eq!(summary.flips[0].from, "Red");
        assert_eq!(t.canonical(&key("A1.C")), Some("Green"));
        assert!(t.quorum_met(&key("A1.C")));
    }

    #[test]
    fn test_table_ok_credits_single_synthetic_confirmer() {
        let mut t = tracker_with(FlipPolicy::Majority);
        let row = |status| ParsedItem::TableRow {
            field: key("A1.S"),
            value: "Star".to_string(),
            status,
        };
        t.absorb("Agent1", &[row(TableStatus::Ok)]);
        t.absorb("Agent2", &[row(TableStatus::Ok)]);
        t.absorb("Agent3", &[row(TableStatus::Unknown)]);
        assert_eq!(t.canonical(&key("A1.S")), Some("Star"));
        assert_eq!(t.confirmer_count(&key("A1.S")), 1);

        t.absorb("Agent4", &[confirm("A1.S", "Star")]);
        assert!(t.quorum_met(&key("A1.S")));
    }

    #[test]
    fn test_unknown_or_revise_rows_do_not_seed() {
        let mut t = tracker_with(FlipPolicy::Majority);
        t.absorb(
            "Agent1",
            &[ParsedItem::TableRow {
                field: key("A1.C"),
                value: "Red".to_string(),
                status: TableStatus::Revise,
            }],
        );
        assert_eq!(t.canonical(&key("A1.C")), None);
    }

    /// Two values each gathering a growing set of confirmers: the majority
    /// rule flips back and forth, a livelock risk when confirmations for
    /// competing values interleave.
    #[test]
    fn test_majority_rule_can_oscillate() {
        let mut t = tracker_with(FlipPolicy::Majority);
        let field = key("A1.C");
        t.absorb("Agent1", &[confirm("A1.C", "Red")]);
        t.absorb("Agent2", &[confirm("A1.C", "Red")]);
        t.absorb("Agent3", &[confirm("A1.C", "Blue")]);
        t.absorb("Agent4", &[confirm("A1.C", "Blue")]);
        assert_eq!(t.canonical(&field), Some("Blue"));

        t.absorb("Agent3", &[confirm("A1.C", "Red")]);
        assert_eq!(t.canonical(&field), Some("Red"));

        t.absorb("Agent1", &[confirm("A1.C", "Blue")]);
        assert_eq!(t.canonical(&field), Some("Blue"));
    }

    #[test]
    fn test_first_quorum_wins_is_stable() {
        let mut t = tracker_with(FlipPolicy::FirstQuorumWins);
        let field = key("A1.C");
        t.absorb("Agent1", &[confirm("A1.C", "Red")]);
        t.absorb("Agent2", &[confirm("A1.C", "Red")]);
        t.absorb("Agent3", &[confirm("A1.C", "Blue")]);
        t.absorb("Agent4", &[confirm("A1.C", "Blue")]);
        t.absorb("Agent1", &[confirm("A1.C", "Blue")]);
        assert_eq!(t.canonical(&field), Some("Red"));
        assert!(t.quorum_met(&field));
    }

    #[test]
    fn test_first_quorum_wins_still_replaces_unsettled_value() {
        let mut t = tracker_with(FlipPolicy::FirstQuorumWins);
        t.absorb("Agent1", &[claim("A1.C", "Red")]);
        t.absorb("Agent2", &[confirm("A1.C", "Blue")]);
        t.absorb("Agent3", &[confirm("A1.C", "Blue")]);
        assert_eq!(t.canonical(&key("A1.C")), Some("Blue"));
    }

    #[test]
    fn test_schema_lock_after_three_mentions() {
        let mut t = tracker_with(FlipPolicy::Majority);
        assert!(!t.note_utterance(true));
        assert!(!t.note_utterance(false));
        assert!(!t.note_utterance(true));
        assert!(t.note_utterance(true));
        assert!(t.schema_locked());
        assert!(!t.note_utterance(true));
        assert_eq!(t.schema_votes(), 4);
    }
}
