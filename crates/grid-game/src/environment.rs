//! The hidden 2x2 grid: ground truth, private facts, proposal adjudication.
//!
//! Four cells (A1, A2, B1, B2) each carry a Color and a Shape. The ground truth
//! is a bijection: no two cells share a color and no two share a shape.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use quorum_kernel::parser::extract_json_object;
use quorum_kernel::{Environment, FieldKey, Proposal};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Cell {
    A1,
    A2,
    B1,
    B2,
}

pub const CELLS: [Cell; 4] = [Cell::A1, Cell::A2, Cell::B1, Cell::B2];

impl Cell {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A1 => "A1",
            Self::A2 => "A2",
            Self::B1 => "B1",
            Self::B2 => "B2",
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cell {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A1" => Ok(Self::A1),
            "A2" => Ok(Self::A2),
            "B1" => Ok(Self::B1),
            "B2" => Ok(Self::B2),
            _ => bail!("Unknown cell: {}", s),
        }
    }
}

/// The two attributes of a cell. Abbreviated `C`/`S` in claims, spelled out
/// in the proposal wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Attribute {
    Color,
    Shape,
}

pub const ATTRIBUTES: [Attribute; 2] = [Attribute::Color, Attribute::Shape];

impl Attribute {
    pub fn code(self) -> &'static str {
        match self {
            Self::Color => "C",
            Self::Shape => "S",
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Color => "Color",
            Self::Shape => "Shape",
        }
    }

    /// Accepts the abbreviation or the wire name, any case.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "c" | "color" | "colour" => Some(Self::Color),
            "s" | "shape" => Some(Self::Shape),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Color {
    Red,
    Blue,
    Green,
    Yellow,
}

pub const COLORS: [Color; 4] = [Color::Red, Color::Blue, Color::Green, Color::Yellow];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    Circle,
    Square,
    Triangle,
    Star,
}

pub const SHAPES: [Shape; 4] = [Shape::Circle, Shape::Square, Shape::Triangle, Shape::Star];

/// Known misspellings, lowercase.
const COLOR_ALIASES: &[(&str, Color)] = &[
    ("rd", Color::Red),
    ("redd", Color::Red),
    ("blu", Color::Blue),
    ("bleu", Color::Blue),
    ("gren", Color::Green),
    ("grn", Color::Green),
    ("gree", Color::Green),
    ("grean", Color::Green),
    ("yelow", Color::Yellow),
    ("yellw", Color::Yellow),
    ("yello", Color::Yellow),
    ("yllw", Color::Yellow),
];

const SHAPE_ALIASES: &[(&str, Shape)] = &[
    ("circel", Shape::Circle),
    ("cirle", Shape::Circle),
    ("circl", Shape::Circle),
    ("sqare", Shape::Square),
    ("squre", Shape::Square),
    ("sqr", Shape::Square),
    ("triangel", Shape::Triangle),
    ("triange", Shape::Triangle),
    ("trangle", Shape::Triangle),
    ("tri", Shape::Triangle),
    ("str", Shape::Star),
    ("starr", Shape::Star),
];

fn normalize(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == ',' || c == ';')
        .to_ascii_lowercase()
}

impl Color {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Red => "Red",
            Self::Blue => "Blue",
            Self::Green => "Green",
            Self::Yellow => "Yellow",
        }
    }

    /// Exact name (any case) or a known misspelling.
    pub fn canonicalize(raw: &str) -> Option<Self> {
        let v = normalize(raw);
        COLORS
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(&v))
            .or_else(|| COLOR_ALIASES.iter().find(|(a, _)| *a == v).map(|(_, c)| *c))
    }
}

impl Shape {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Circle => "Circle",
            Self::Square => "Square",
            Self::Triangle => "Triangle",
            Self::Star => "Star",
        }
    }

    pub fn canonicalize(raw: &str) -> Option<Self> {
        let v = normalize(raw);
        SHAPES
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(&v))
            .or_else(|| SHAPE_ALIASES.iter().find(|(a, _)| *a == v).map(|(_, s)| *s))
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ground-truth values of one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellValue {
    #[serde(rename = "Color")]
    pub color: Color,
    #[serde(rename = "Shape")]
    pub shape: Shape,
}

/// Field key for `cell`/`attr` in `A1.C` notation.
pub fn field_key(cell: Cell, attr: Attribute) -> FieldKey {
    FieldKey::new(cell.as_str(), attr.code())
}

/// The hidden grid. Immutable once sampled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenEnvironment {
    solution: BTreeMap<Cell, CellValue>,
}

impl HiddenEnvironment {
    /// Sample colors and shapes without replacement, one of each per cell.
    pub fn sample_ground_truth(rng: &mut impl Rng) -> Self {
        let mut colors = COLORS.to_vec();
        let mut shapes = SHAPES.to_vec();
        colors.shuffle(rng);
        shapes.shuffle(rng);

        let solution = CELLS
            .into_iter()
            .zip(colors.into_iter().zip(shapes))
            .map(|(cell, (color, shape))| (cell, CellValue { color, shape }))
            .collect();
        Self { solution }
    }

    /// Build from an explicit assignment. The assignment must cover every
    /// cell and be a bijection on both attributes.
    pub fn from_solution(solution: BTreeMap<Cell, CellValue>) -> Result<Self> {
        if CELLS.iter().any(|c| !solution.contains_key(c)) {
            bail!("Solution must assign every cell");
        }
        let colors: HashSet<Color> = solution.values().map(|v| v.color).collect();
        let shapes: HashSet<Shape> = solution.values().map(|v| v.shape).collect();
        if colors.len() != CELLS.len() || shapes.len() != CELLS.len() {
            bail!("Solution must not repeat a color or a shape");
        }
        Ok(Self { solution })
    }

    pub fn solution(&self) -> &BTreeMap<Cell, CellValue> {
        &self.solution
    }

    /// Ground-truth value of a field, canonical spelling.
    pub fn value_of(&self, field: &FieldKey) -> Option<&'static str> {
        let cell: Cell = field.cell.parse().ok()?;
        let value = self.solution.get(&cell)?;
        match Attribute::parse(&field.attr)? {
            Attribute::Color => Some(value.color.as_str()),
            Attribute::Shape => Some(value.shape.as_str()),
        }
    }

    /// All eight facts in `A1.C=Red` form, cell-major order.
    pub fn facts(&self) -> Vec<String> {
        self.solution
            .iter()
            .flat_map(|(cell, value)| {
                [
                    format!("{}.C={}", cell, value.color),
                    format!("{}.S={}", cell, value.shape),
                ]
            })
            .collect()
    }

    /// Distribute facts across `n_participants` with overlap and omissions.
    ///
    /// Shuffled facts are dealt round robin, each to two consecutive
    /// participants. Every participant then withholds one fact and, with
    /// probability one half, a second one. A fact is only withheld if its
    /// other holder still keeps it, so the union of all sets is always the
    /// full truth while every participant lacks at least one fact.
    pub fn sample_private_facts(&self, n_participants: usize, rng: &mut impl Rng) -> Vec<Vec<String>> {
        let mut facts = self.facts();
        facts.shuffle(rng);

        let n = n_participants.max(1);
        let mut per_participant: Vec<Vec<String>> = vec![Vec::new(); n];
        for (i, fact) in facts.iter().enumerate() {
            per_participant[i % n].push(fact.clone());
            let partner = (i + 1) % n;
            if partner != i % n {
                per_participant[partner].push(fact.clone());
            }
        }

        let mut withheld: HashSet<String> = HashSet::new();
        for pass in 0..2 {
            for held in per_participant.iter_mut() {
                if pass == 1 && !rng.random_bool(0.5) {
                    continue;
                }
                let eligible: Vec<usize> = held
                    .iter()
                    .enumerate()
                    .filter(|(_, f)| !withheld.contains(*f))
                    .map(|(idx, _)| idx)
                    .collect();
                if let Some(&idx) = eligible.choose(rng) {
                    withheld.insert(held.remove(idx));
                }
            }
        }

        per_participant
    }

    /// Render a proposal in the nested wire format.
    pub fn proposal_to_wire(proposal: &Proposal) -> Value {
        let mut root = Map::new();
        for cell in CELLS {
            let mut attrs = Map::new();
            for attr in ATTRIBUTES {
                if let Some(v) = proposal.get(&field_key(cell, attr)) {
                    attrs.insert(attr.wire_name().to_string(), json!(v));
                }
            }
            if !attrs.is_empty() {
                root.insert(cell.to_string(), Value::Object(attrs));
            }
        }
        Value::Object(root)
    }

    /// Ground truth in the wire format.
    pub fn solution_wire(&self) -> Value {
        let mut proposal = Proposal::new();
        for field in self.fields() {
            if let Some(v) = self.value_of(&field) {
                proposal.insert(field, v);
            }
        }
        Self::proposal_to_wire(&proposal)
    }
}

impl fmt::Display for HiddenEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (cell, value) in &self.solution {
            writeln!(f, "{}: {} {}", cell, value.color, value.shape)?;
        }
        Ok(())
    }
}

impl Environment for HiddenEnvironment {
    fn fields(&self) -> Vec<FieldKey> {
        CELLS
            .into_iter()
            .flat_map(|cell| ATTRIBUTES.into_iter().map(move |attr| field_key(cell, attr)))
            .collect()
    }

    fn canonicalize(&self, field: &FieldKey, value: &str) -> Option<String> {
        match Attribute::parse(&field.attr)? {
            Attribute::Color => Color::canonicalize(value).map(|c| c.to_string()),
            Attribute::Shape => Shape::canonicalize(value).map(|s| s.to_string()),
        }
    }

    fn validate_proposal(&self, text: &str, marker: &str) -> Option<Proposal> {
        let idx = text.find(marker)?;
        let rest = text[idx + marker.len()..].trim();
        let payload: Value = serde_json::from_str(rest)
            .ok()
            .or_else(|| extract_json_object(rest).and_then(|obj| serde_json::from_str(obj).ok()))?;

        // Every cell must be an object carrying both attributes.
        let obj = payload.as_object()?;
        for cell in CELLS {
            let attrs = lookup(obj, cell.as_str())?.as_object()?;
            for attr in ATTRIBUTES {
                lookup(attrs, attr.wire_name())?;
            }
        }

        let proposal = self.proposal_from_json(&payload);
        proposal.covers(&self.fields()).then_some(proposal)
    }

    /// Accepts the nested wire format and flat `"A1.C"` keys.
    fn proposal_from_json(&self, payload: &Value) -> Proposal {
        let mut proposal = Proposal::new();
        let Some(obj) = payload.as_object() else {
            return proposal;
        };

        for (key, value) in obj {
            if let Ok(cell) = key.parse::<Cell>() {
                let Some(attrs) = value.as_object() else { continue };
                for (attr_key, v) in attrs {
                    let (Some(attr), Some(v)) = (Attribute::parse(attr_key), v.as_str()) else {
                        continue;
                    };
                    let field = field_key(cell, attr);
                    if let Some(canonical) = self.canonicalize(&field, v) {
                        proposal.insert(field, canonical);
                    }
                }
            } else if let (Ok(field), Some(v)) = (key.parse::<FieldKey>(), value.as_str()) {
                if self.is_field(&field) {
                    if let Some(canonical) = self.canonicalize(&field, v) {
                        proposal.insert(field, canonical);
                    }
                }
            }
        }
        proposal
    }

    fn score_proposal(&self, proposal: &Proposal) -> f64 {
        let fields = self.fields();
        let correct = fields
            .iter()
            .filter(|f| proposal.get(f).is_some_and(|v| self.is_correct(f, v)))
            .count();
        correct as f64 / fields.len() as f64
    }

    fn is_correct(&self, field: &FieldKey, value: &str) -> bool {
        self.value_of(field) == Some(value)
    }
}

fn lookup<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key)
        .or_else(|| obj.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v))
}
