//! ClaimParser: pulls structured assertions out of free-text turns.
//!
//! Recognized sub-grammar:
//! - claim: `A1.C=Red`
//! - confirmation: `CONFIRM A1.C=Red`
//! - table row: a `TABLE:` line of `A1.C=Red[OK]` entries tagged OK/UNK/REVISE
//! - prepare proposal: `PREPARE=` followed by a JSON object (best effort)
//! - final proposal: delegated to [`Environment::validate_proposal`]
//!
//! Parsing is tolerant. A malformed fragment never blocks the others, and a
//! value that fails canonicalization is dropped without an error.

use std::ops::Range;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::TranscriptEntry;
use crate::environment::{Environment, FieldKey, Proposal};

/// Status tag attached to a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableStatus {
    Ok,
    Unknown,
    Revise,
}

/// One structured assertion found in an utterance, already canonicalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedItem {
    Claim {
        field: FieldKey,
        value: String,
    },
    Confirmation {
        field: FieldKey,
        value: String,
    },
    TableRow {
        field: FieldKey,
        value: String,
        status: TableStatus,
    },
}

/// Outcome of looking for a final proposal in a turn.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FinalAttempt {
    /// No proposal marker anywhere in the turn
    #[default]
    Absent,
    /// The marker is present but the payload did not validate
    Malformed,
    Valid(Proposal),
}

/// Everything extracted from one transcript entry.
#[derive(Debug, Clone, Default)]
pub struct ParsedTurn {
    pub items: Vec<ParsedItem>,
    pub prepare: Option<Proposal>,
    pub final_attempt: FinalAttempt,
    pub mentions_schema: bool,
}

/// Regex-based parser for the fixed sub-grammar.
#[derive(Debug, Clone)]
pub struct ClaimParser {
    assertion: Regex,
    confirmation: Regex,
    table_line: Regex,
    table_entry: Regex,
    proposal_marker: String,
    prepare_marker: String,
}

impl ClaimParser {
    pub fn new(proposal_marker: &str, prepare_marker: &str) -> Result<Self> {
        Ok(Self {
            assertion: Regex::new(r"(?i)\b([A-Z]\d+)\s*\.\s*([A-Z])\s*=\s*([A-Z?]+)")
                .context("assertion pattern")?,
            confirmation: Regex::new(
                r"(?i)\bCONFIRM\s*:?\s*([A-Z]\d+)\s*\.\s*([A-Z])\s*=\s*([A-Z?]+)",
            )
            .context("confirmation pattern")?,
            table_line: Regex::new(r"(?im)^[^\S\n]*TABLE\s*:.*$").context("table pattern")?,
            table_entry: Regex::new(
                r"(?i)([A-Z]\d+)\s*\.\s*([A-Z])\s*=\s*([A-Z?]+)(?:\s*[\[(]?\s*(OK|UNK|REVISE)\b)?",
            )
            .context("table entry pattern")?,
            proposal_marker: proposal_marker.to_string(),
            prepare_marker: prepare_marker.to_string(),
        })
    }

    /// Parse one transcript entry.
    ///
    /// Assertions come from the delivered (noised) text, since that is what
    /// the other participants actually received. Proposals are adjudicated on
    /// the raw text first, falling back to the delivered text.
    pub fn parse<E: Environment + ?Sized>(&self, env: &E, entry: &TranscriptEntry) -> ParsedTurn {
        ParsedTurn {
            items: self.parse_items(env, &entry.noised),
            prepare: self
                .parse_prepare(env, &entry.raw)
                .or_else(|| self.parse_prepare(env, &entry.noised)),
            final_attempt: self.parse_final(env, &entry.raw, &entry.noised),
            mentions_schema: entry.raw.to_uppercase().contains("SCHEMA"),
        }
    }

    /// Extract claims, confirmations and table rows from `text`.
    pub fn parse_items<E: Environment + ?Sized>(&self, env: &E, text: &str) -> Vec<ParsedItem> {
        let mut items: Vec<(usize, ParsedItem)> = Vec::new();
        let mut consumed: Vec<Range<usize>> = Vec::new();

        for line in self.table_line.find_iter(text) {
            consumed.push(line.range());
            for caps in self.table_entry.captures_iter(line.as_str()) {
                let start = line.start() + caps.get(0).map_or(0, |m| m.start());
                let status = match caps.get(4).map(|m| m.as_str().to_ascii_uppercase()) {
                    Some(tag) if tag == "OK" => TableStatus::Ok,
                    Some(tag) if tag == "REVISE" => TableStatus::Revise,
                    _ => TableStatus::Unknown,
                };
                if let Some((field, value)) = self.resolve(env, &caps[1], &caps[2], &caps[3]) {
                    items.push((
                        start,
                        ParsedItem::TableRow {
                            field,
                            value,
                            status,
                        },
                    ));
                }
            }
        }

        for caps in self.confirmation.captures_iter(text) {
            let Some(m) = caps.get(0) else { continue };
            consumed.push(m.range());
            if let Some((field, value)) = self.resolve(env, &caps[1], &caps[2], &caps[3]) {
                items.push((m.start(), ParsedItem::Confirmation { field, value }));
            }
        }

        for caps in self.assertion.captures_iter(text) {
            let Some(m) = caps.get(0) else { continue };
            if consumed
                .iter()
                .any(|r| r.start <= m.start() && m.end() <= r.end)
            {
                continue;
            }
            if let Some((field, value)) = self.resolve(env, &caps[1], &caps[2], &caps[3]) {
                items.push((m.start(), ParsedItem::Claim { field, value }));
            }
        }

        // Absorb in the order the speaker wrote them.
        items.sort_by_key(|(start, _)| *start);
        items.into_iter().map(|(_, item)| item).collect()
    }

    /// Best-effort extraction of a rehearsal proposal.
    pub fn parse_prepare<E: Environment + ?Sized>(&self, env: &E, text: &str) -> Option<Proposal> {
        let idx = find_ignore_ascii_case(text, &self.prepare_marker)?;
        let rest = &text[idx + self.prepare_marker.len()..];
        let payload = extract_json_object(rest)?;
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        let proposal = env.proposal_from_json(&value);
        (!proposal.is_empty()).then_some(proposal)
    }

    /// Classify the final-proposal content of a turn.
    pub fn parse_final<E: Environment + ?Sized>(
        &self,
        env: &E,
        raw: &str,
        delivered: &str,
    ) -> FinalAttempt {
        if let Some(p) = env
            .validate_proposal(raw, &self.proposal_marker)
            .or_else(|| env.validate_proposal(delivered, &self.proposal_marker))
        {
            FinalAttempt::Valid(p)
        } else if raw.contains(&self.proposal_marker) || delivered.contains(&self.proposal_marker) {
            FinalAttempt::Malformed
        } else {
            FinalAttempt::Absent
        }
    }

    fn resolve<E: Environment + ?Sized>(
        &self,
        env: &E,
        cell: &str,
        attr: &str,
        value: &str,
    ) -> Option<(FieldKey, String)> {
        let field = FieldKey::new(cell, attr);
        if !env.is_field(&field) {
            debug!(field = %field, "Ignoring unknown field");
            return None;
        }
        match env.canonicalize(&field, value) {
            Some(canonical) => Some((field, canonical)),
            None => {
                debug!(field = %field, value = value, "Dropping value that failed canonicalization");
                None
            }
        }
    }
}

fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    // ASCII uppercasing keeps byte offsets stable.
    haystack
        .to_ascii_uppercase()
        .find(&needle.to_ascii_uppercase())
}

/// Return the first balanced `{...}` object in `text`, honoring JSON strings.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use super::*;

    /// Minimal two-cell environment for kernel tests.
    pub(crate) struct TestEnv {
        pub truth: BTreeMap<FieldKey, String>,
    }

    impl TestEnv {
        pub(crate) fn new() -> Self {
            let truth = [
                ("A1.C", "Green"),
                ("A1.S", "Star"),
                ("A2.C", "Red"),
                ("A2.S", "Circle"),
            ]
            .into_iter()
            .map(|(k, v)| (k.parse().unwrap(), v.to_string()))
            .collect();
            Self { truth }
        }
    }

    impl Environment for TestEnv {
        fn fields(&self) -> Vec<FieldKey> {
            self.truth.keys().cloned().collect()
        }

        fn canonicalize(&self, field: &FieldKey, value: &str) -> Option<String> {
            let options: &[&str] = if field.attr == "C" {
                &["Red", "Green", "Blue", "Yellow"]
            } else {
                &["Circle", "Star", "Square", "Triangle"]
            };
            if value.eq_ignore_ascii_case("gren") {
                return Some("Green".to_string());
            }
            options
                .iter()
                .find(|o| o.eq_ignore_ascii_case(value))
                .map(|o| o.to_string())
        }

        fn validate_proposal(&self, text: &str, marker: &str) -> Option<Proposal> {
            let idx = text.find(marker)?;
            let value: serde_json::Value =
                serde_json::from_str(text[idx + marker.len()..].trim()).ok()?;
            let proposal = self.proposal_from_json(&value);
            proposal.covers(&self.fields()).then_some(proposal)
        }

        fn proposal_from_json(&self, payload: &serde_json::Value) -> Proposal {
            let mut proposal = Proposal::new();
            if let Some(obj) = payload.as_object() {
                for (k, v) in obj {
                    let (Ok(field), Some(v)) = (k.parse::<FieldKey>(), v.as_str()) else {
                        continue;
                    };
                    if let Some(c) = self.canonicalize(&field, v) {
                        proposal.insert(field, c);
                    }
                }
            }
            proposal
        }

        fn score_proposal(&self, proposal: &Proposal) -> f64 {
            let correct = self
                .truth
                .iter()
                .filter(|(f, v)| proposal.get(f) == Some(v.as_str()))
                .count();
            correct as f64 / self.truth.len() as f64
        }

        fn is_correct(&self, field: &FieldKey, value: &str) -> bool {
            self.truth.get(field).is_some_and(|v| v == value)
        }
    }

    pub(crate) fn perfect_payload() -> &'static str {
        r#"{"A1.C":"Green","A1.S":"Star","A2.C":"Red","A2.S":"Circle"}"#
    }

    fn parser() -> ClaimParser {
        ClaimParser::new("PROPOSE=", "PREPARE=").unwrap()
    }

    fn key(s: &str) -> FieldKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_claims_with_separators() {
        let items = parser().parse_items(&TestEnv::new(), "A1.C=Green | a2.s=circle");
        assert_eq!(
            items,
            vec![
                ParsedItem::Claim {
                    field: key("A1.C"),
                    value: "Green".to_string()
                },
                ParsedItem::Claim {
                    field: key("A2.S"),
                    value: "Circle".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_misspelled_claim_is_canonicalized() {
        let items = parser().parse_items(&TestEnv::new(), "A1.C=Gren");
        assert_eq!(
            items,
            vec![ParsedItem::Claim {
                field: key("A1.C"),
                value: "Green".to_string()
            }]
        );
    }

    #[test]
    fn test_confirmation_is_not_also_a_claim() {
        let items = parser().parse_items(&TestEnv::new(), "CONFIRM A1.C=Green A2.C=Red");
        assert_eq!(
            items,
            vec![
                ParsedItem::Confirmation {
                    field: key("A1.C"),
                    value: "Green".to_string()
                },
                ParsedItem::Claim {
                    field: key("A2.C"),
                    value: "Red".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_items_keep_text_order() {
        let items = parser().parse_items(
            &TestEnv::new(),
            "A1.C=Red | CONFIRM A1.C=Green\nTABLE: A2.S=Circle OK",
        );
        assert_eq!(
            items,
            vec![
                ParsedItem::Claim {
                    field: key("A1.C"),
                    value: "Red".to_string()
                },
                ParsedItem::Confirmation {
                    field: key("A1.C"),
                    value: "Green".to_string()
                },
                ParsedItem::TableRow {
                    field: key("A2.S"),
                    value: "Circle".to_string(),
                    status: TableStatus::Ok
                },
            ]
        );
    }

    #[test]
    fn test_bad_values_do_not_block_others() {
        let items = parser().parse_items(
            &TestEnv::new(),
            "A1.C=Purple | Z9.C=Red | A1.S=? | CONFIRM A2.S=Circle",
        );
        assert_eq!(
            items,
            vec![ParsedItem::Confirmation {
                field: key("A2.S"),
                value: "Circle".to_string()
            }]
        );
    }

    #[test]
    fn test_table_rows_with_status_tags() {
        let text = "note first\nTABLE: A1.C=Green[OK], A1.S=? UNK, A2.C=Red (REVISE), A2.S=Circle OK";
        let items = parser().parse_items(&TestEnv::new(), text);
        assert_eq!(
            items,
            vec![
                ParsedItem::TableRow {
                    field: key("A1.C"),
                    value: "Green".to_string(),
                    status: TableStatus::Ok
                },
                ParsedItem::TableRow {
                    field: key("A2.C"),
                    value: "Red".to_string(),
                    status: TableStatus::Revise
                },
                ParsedItem::TableRow {
                    field: key("A2.S"),
                    value: "Circle".to_string(),
                    status: TableStatus::Ok
                },
            ]
        );
    }

    #[test]
    fn test_prepare_extraction_tolerates_surrounding_text() {
        let text = r#"rehearsal: prepare={"A1.C":"Gren","A2.S":"Circle"} then confirm"#;
        let proposal = parser().parse_prepare(&TestEnv::new(), text).unwrap();
        assert_eq!(proposal.len(), 2);
        assert_eq!(proposal.get(&key("A1.C")), Some("Green"));
    }

    #[test]
    fn test_final_attempt_classification() {
        let p = parser();
        let env = TestEnv::new();
        let valid = format!("PROPOSE={}", perfect_payload());
        assert!(matches!(p.parse_final(&env, &valid, ""), FinalAttempt::Valid(_)));
        assert_eq!(
            p.parse_final(&env, r#"PROPOSE={"A1.C":"Green""#, ""),
            FinalAttempt::Malformed
        );
        assert_eq!(p.parse_final(&env, "A1.C=Green", "A1.C=Green"), FinalAttempt::Absent);
    }

    #[test]
    fn test_parse_entry_uses_noised_for_items_and_raw_for_proposals() {
        let entry = TranscriptEntry {
            turn: 1,
            speaker: "Agent1".to_string(),
            raw: "A1.C=Green schema".to_string(),
            capped: "A1.C=Green schema".to_string(),
            noised: "A1.C=Gree".to_string(),
        };
        let parsed = parser().parse(&TestEnv::new(), &entry);
        assert!(parsed.items.is_empty());
        assert!(parsed.mentions_schema);
        assert_eq!(parsed.final_attempt, FinalAttempt::Absent);
    }

    #[test]
    fn test_extract_json_object() {
        assert_eq!(extract_json_object(r#"x {"a":{"b":"}"}} y"#), Some(r#"{"a":{"b":"}"}}"#));
        assert_eq!(extract_json_object(r#"{"a":1"#), None);
        assert_eq!(extract_json_object("none"), None);
    }
}
