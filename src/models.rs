use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Comparator family of a source field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    String,
    ShortString,
    Categorical,
    Price,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub field: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default, rename = "has_missing")]
    pub has_missing: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

impl FieldDef {
    pub fn new(field: &str, kind: FieldKind) -> Self {
        Self {
            field: field.to_string(),
            kind,
            has_missing: false,
            categories: Vec::new(),
        }
    }

    pub fn missing(mut self) -> Self {
        self.has_missing = true;
        self
    }

    pub fn with_categories(mut self, cats: &[&str]) -> Self {
        self.categories = cats.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Maps a raw column value to the field value; empty strings count as
    /// missing only for fields declared with `has_missing`.
    pub fn value_from_raw(&self, raw: Option<String>) -> Option<String> {
        match raw {
            Some(s) if self.has_missing && s.trim().is_empty() => None,
            other => other,
        }
    }
}

/// One source row: its key plus values aligned with the configured field list.
/// `None` marks a missing value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub values: Vec<Option<String>>,
}

impl Record {
    pub fn new(key: impl Into<String>, values: Vec<Option<String>>) -> Self {
        Self {
            key: key.into(),
            values,
        }
    }

    pub fn value(&self, idx: usize) -> Option<&str> {
        self.values.get(idx).and_then(|v| v.as_deref())
    }

    pub fn is_missing(&self, idx: usize) -> bool {
        self.value(idx).is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockAssignment {
    pub block_key: String,
    pub record_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluralBlock {
    pub block_id: i64,
    pub block_key: String,
    pub members: Vec<String>,
}

/// Ascending set of plural block ids covering one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coverage {
    pub record_key: String,
    pub block_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmallerCoverage {
    pub record_key: String,
    pub block_id: i64,
    pub smaller_ids: BTreeSet<i64>,
}

/// A record as delivered to the matcher inside one block.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRecord {
    pub record: Record,
    pub smaller_ids: BTreeSet<i64>,
}

/// Records of one plural block, each with its exclusion set.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateGroup {
    pub block_id: i64,
    pub members: Vec<CandidateRecord>,
}

impl CandidateGroup {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// True when both records were already covered by a common smaller block.
    pub fn excluded(&self, i: usize, j: usize) -> bool {
        let a = &self.members[i].smaller_ids;
        let b = &self.members[j].smaller_ids;
        if a.is_empty() || b.is_empty() {
            return false;
        }
        let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
        small.iter().any(|id| large.contains(id))
    }

    /// Index pairs this block is responsible for comparing.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let n = self.members.len();
        (0..n)
            .flat_map(move |i| (i + 1..n).map(move |j| (i, j)))
            .filter(move |&(i, j)| !self.excluded(i, j))
    }
}

/// Matcher output: members in order, the first is the canonical id.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCluster {
    pub members: Vec<String>,
    pub scores: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EntityMapEntry {
    pub record_key: String,
    pub canon_id: String,
    pub cluster_score: f64,
}
