use std::collections::{HashMap, HashSet};

use rphonetic::{DoubleMetaphone, Encoder};
use serde::{Deserialize, Serialize};

use super::Blocker;
use crate::config::SourceConfig;
use crate::error::{DedupeError, Result};
use crate::models::{FieldKind, Record};
use crate::normalize::{normalize_for_phonetic, normalize_text, tokens};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    WholeField,
    FirstChars(usize),
    Token,
    SortedTokens,
    Metaphone,
    /// Tokens appearing in at most `max_df` distinct indexed values.
    RareToken { max_df: usize },
}

impl Predicate {
    pub fn needs_index(&self) -> bool {
        matches!(self, Predicate::RareToken { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateRule {
    pub field: String,
    pub predicate: Predicate,
}

impl PredicateRule {
    pub fn new(field: &str, predicate: Predicate) -> Self {
        Self {
            field: field.to_string(),
            predicate,
        }
    }
}

#[derive(Debug, Default)]
struct FieldIndex {
    seen: HashSet<String>,
    doc_freq: HashMap<String, usize>,
}

impl FieldIndex {
    fn add(&mut self, value: String) -> bool {
        let norm = normalize_text(&value);
        if !self.seen.insert(norm) {
            return false;
        }
        let toks: HashSet<String> = tokens(&value).into_iter().collect();
        for t in toks {
            *self.doc_freq.entry(t).or_insert(0) += 1;
        }
        true
    }

    fn df(&self, token: &str) -> usize {
        self.doc_freq.get(token).copied().unwrap_or(0)
    }
}

/// Rule-driven blocker: every rule maps one field value to zero or more keys
/// of the form `"{rule_index}:{value}"`.
#[derive(Debug)]
pub struct PredicateBlocker {
    rules: Vec<(usize, PredicateRule)>,
    indices: HashMap<String, FieldIndex>,
}

impl PredicateBlocker {
    pub fn new(schema: &SourceConfig, rules: Vec<PredicateRule>) -> Result<Self> {
        let mut resolved = Vec::with_capacity(rules.len());
        for rule in rules {
            let idx = schema
                .field_index(&rule.field)
                .ok_or_else(|| DedupeError::Indexing {
                    field: rule.field.clone(),
                    reason: "field not in source schema".into(),
                })?;
            resolved.push((idx, rule));
        }
        Ok(Self {
            rules: resolved,
            indices: HashMap::new(),
        })
    }

    /// Rules derived from the field kinds of `schema`.
    pub fn for_schema(schema: &SourceConfig) -> Result<Self> {
        let mut rules = Vec::new();
        for f in &schema.fields {
            match f.kind {
                FieldKind::String => {
                    rules.push(PredicateRule::new(&f.field, Predicate::FirstChars(5)));
                    rules.push(PredicateRule::new(&f.field, Predicate::SortedTokens));
                    rules.push(PredicateRule::new(&f.field, Predicate::Metaphone));
                    rules.push(PredicateRule::new(
                        &f.field,
                        Predicate::RareToken { max_df: 100 },
                    ));
                }
                FieldKind::ShortString => {
                    rules.push(PredicateRule::new(&f.field, Predicate::WholeField));
                }
                FieldKind::Categorical | FieldKind::Price => {}
            }
        }
        Self::new(schema, rules)
    }

    pub fn rules(&self) -> impl Iterator<Item = &PredicateRule> {
        self.rules.iter().map(|(_, r)| r)
    }

    fn apply(&self, rule: &PredicateRule, value: &str) -> Result<Vec<String>> {
        let out = match &rule.predicate {
            Predicate::WholeField => {
                let v = normalize_text(value);
                if v.is_empty() { vec![] } else { vec![v] }
            }
            Predicate::FirstChars(n) => {
                let v: String = normalize_text(value)
                    .chars()
                    .filter(|c| !c.is_whitespace())
                    .take(*n)
                    .collect();
                if v.chars().count() < *n { vec![] } else { vec![v] }
            }
            Predicate::Token => {
                let mut t = tokens(value);
                t.sort();
                t.dedup();
                t
            }
            Predicate::SortedTokens => {
                let mut t = tokens(value);
                t.sort();
                t.dedup();
                if t.is_empty() { vec![] } else { vec![t.join(" ")] }
            }
            Predicate::Metaphone => {
                let s = normalize_for_phonetic(value);
                let first = s.split(' ').next().unwrap_or("").to_string();
                if first.is_empty() {
                    vec![]
                } else {
                    match std::panic::catch_unwind(|| DoubleMetaphone::default().encode(&first)) {
                        Ok(code) if !code.is_empty() => vec![code],
                        _ => vec![],
                    }
                }
            }
            Predicate::RareToken { max_df } => {
                let index = self
                    .indices
                    .get(&rule.field)
                    .ok_or_else(|| DedupeError::Indexing {
                        field: rule.field.clone(),
                        reason: "field has not been indexed".into(),
                    })?;
                let mut t = tokens(value);
                t.sort();
                t.dedup();
                t.into_iter().filter(|tok| index.df(tok) <= *max_df).collect()
            }
        };
        Ok(out)
    }
}

impl Blocker for PredicateBlocker {
    fn index_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self
            .rules
            .iter()
            .filter(|(_, r)| r.predicate.needs_index())
            .map(|(_, r)| r.field.clone())
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }

    fn index(&mut self, field: &str, values: &mut dyn Iterator<Item = String>) -> Result<usize> {
        if !self.index_fields().iter().any(|f| f == field) {
            return Err(DedupeError::Indexing {
                field: field.to_string(),
                reason: "no index predicate configured for this field".into(),
            });
        }
        let index = self.indices.entry(field.to_string()).or_default();
        let mut added = 0usize;
        for v in values {
            if index.add(v) {
                added += 1;
            }
        }
        Ok(added)
    }

    fn block_keys(&self, record: &Record) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for (rule_id, (field_idx, rule)) in self.rules.iter().enumerate() {
            let Some(value) = record.value(*field_idx) else {
                continue;
            };
            for k in self.apply(rule, value)? {
                keys.push(format!("{}:{}", rule_id, k));
            }
        }
        Ok(keys)
    }
}
