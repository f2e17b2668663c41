//! Environment trait: the hidden structure participants are trying to agree on.
//!
//! The kernel never knows what a cell or an attribute means. A concrete game
//! supplies the field list, value canonicalization, proposal validation and
//! scoring through [`Environment`]; everything else (channel, parsing, quorum
//! tracking, scheduling) is generic over it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// One (cell, attribute) slot, written `A1.C` on the wire.
///
/// Serialized as its wire string so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldKey {
    pub cell: String,
    pub attr: String,
}

impl FieldKey {
    pub fn new(cell: impl Into<String>, attr: impl Into<String>) -> Self {
        Self {
            cell: cell.into().to_ascii_uppercase(),
            attr: attr.into().to_ascii_uppercase(),
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.cell, self.attr)
    }
}

impl FromStr for FieldKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((cell, attr)) = s.trim().split_once('.') else {
            bail!("field key {:?} is missing the '.' separator", s);
        };
        let (cell, attr) = (cell.trim(), attr.trim());
        if cell.is_empty() || attr.is_empty() {
            bail!("field key {:?} has an empty cell or attribute", s);
        }
        Ok(Self::new(cell, attr))
    }
}

impl TryFrom<String> for FieldKey {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<FieldKey> for String {
    fn from(key: FieldKey) -> Self {
        key.to_string()
    }
}

/// A (possibly partial) assignment of canonical values to fields.
///
/// Final proposals are complete by construction; prepare proposals may be
/// missing fields that the speaker left out or that failed canonicalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Proposal {
    pub values: BTreeMap<FieldKey, String>,
}

impl Proposal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: FieldKey, value: impl Into<String>) {
        self.values.insert(field, value.into());
    }

    pub fn get(&self, field: &FieldKey) -> Option<&str> {
        self.values.get(field).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True if every field in `fields` has a value.
    pub fn covers(&self, fields: &[FieldKey]) -> bool {
        fields.iter().all(|f| self.values.contains_key(f))
    }
}

/// The hidden ground truth and its adjudication rules.
///
/// Implementations own the ground truth exclusively and never mutate it
/// after construction.
pub trait Environment: Send + Sync {
    /// All fields that must be agreed on, in a stable order.
    fn fields(&self) -> Vec<FieldKey>;

    /// Map a raw value for `field` onto its canonical spelling.
    ///
    /// Returns `None` for values outside the enumeration and alias table.
    fn canonicalize(&self, field: &FieldKey, value: &str) -> Option<String>;

    /// Locate `marker` in `text` and parse the remainder as a final proposal.
    ///
    /// Malformed or incomplete payloads yield `None`; this is an expected,
    /// frequent outcome rather than an error.
    fn validate_proposal(&self, text: &str, marker: &str) -> Option<Proposal>;

    /// Best-effort conversion of an already-extracted JSON payload into a
    /// partial proposal. Used for prepare proposals.
    fn proposal_from_json(&self, payload: &serde_json::Value) -> Proposal;

    /// Fraction of fields in `proposal` that equal the ground truth, in [0, 1].
    fn score_proposal(&self, proposal: &Proposal) -> f64;

    /// Whether `value` is the ground-truth value of `field`.
    fn is_correct(&self, field: &FieldKey, value: &str) -> bool;

    fn is_field(&self, field: &FieldKey) -> bool {
        self.fields().contains(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_key_parse_and_display() {
        let key: FieldKey = "a1.c".parse().unwrap();
        assert_eq!(key, FieldKey::new("A1", "C"));
        assert_eq!(key.to_string(), "A1.C");

        assert!("A1C".parse::<FieldKey>().is_err());
        assert!(".C".parse::<FieldKey>().is_err());
    }

    #[test]
    fn test_proposal_serializes_with_string_keys() {
        let mut proposal = Proposal::new();
        proposal.insert(FieldKey::new("B2", "S"), "Star");
        proposal.insert(FieldKey::new("A1", "C"), "Red");

        let json = serde_json::to_string(&proposal).unwrap();
        assert_eq!(json, r#"{"A1.C":"Red","B2.S":"Star"}"#);

        let back: Proposal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, proposal);
    }

    #[test]
    fn test_proposal_covers() {
        let fields = vec![FieldKey::new("A1", "C"), FieldKey::new("A1", "S")];
        let mut proposal = Proposal::new();
        proposal.insert(fields[0].clone(), "Red");
        assert!(!proposal.covers(&fields));
        proposal.insert(fields[1].clone(), "Star");
        assert!(proposal.covers(&fields));
    }
}
