//! Coverage and smaller-coverage computation.
//!
//! Coverage is the ascending list of plural block ids containing a record.
//! For a record inside block `b`, its smaller coverage is every covering id
//! below `b`. Two records sharing a smaller id were already compared in that
//! smaller block, so block `b` skips the pair.
//!
//! Id lists are persisted as comma-joined decimal ids and always parsed back
//! into integer sets; ids are compared as numbers, never as substrings.

use std::collections::BTreeSet;

use crate::error::{DedupeError, Result};
use crate::models::{Coverage, SmallerCoverage};

/// Folds `(record_key, block_id)` rows, ordered by record key, into one
/// [`Coverage`] per record. Rows may arrive in pages; a record's run is only
/// closed when a different key shows up or [`finish`](Self::finish) is called.
#[derive(Debug, Default)]
pub struct CoverageAccumulator {
    current: Option<String>,
    ids: BTreeSet<i64>,
}

impl CoverageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record_key: &str, block_id: i64) -> Option<Coverage> {
        let closed = match self.current.as_deref() {
            Some(cur) if cur == record_key => None,
            Some(_) => self.take(),
            None => None,
        };
        if self.current.is_none() {
            self.current = Some(record_key.to_string());
        }
        self.ids.insert(block_id);
        closed
    }

    pub fn finish(&mut self) -> Option<Coverage> {
        self.take()
    }

    fn take(&mut self) -> Option<Coverage> {
        let record_key = self.current.take()?;
        let block_ids: Vec<i64> = std::mem::take(&mut self.ids).into_iter().collect();
        Some(Coverage {
            record_key,
            block_ids,
        })
    }
}

/// Coverage for every record in an already ordered membership list.
pub fn coverage_from_sorted<'a, I>(rows: I) -> Vec<Coverage>
where
    I: IntoIterator<Item = (&'a str, i64)>,
{
    let mut acc = CoverageAccumulator::new();
    let mut out = Vec::new();
    for (key, id) in rows {
        if let Some(c) = acc.push(key, id) {
            out.push(c);
        }
    }
    out.extend(acc.finish());
    out
}

/// One [`SmallerCoverage`] per covering block of the record.
pub fn smaller_coverage(coverage: &Coverage) -> impl Iterator<Item = SmallerCoverage> + '_ {
    coverage
        .block_ids
        .iter()
        .enumerate()
        .map(move |(i, &block_id)| SmallerCoverage {
            record_key: coverage.record_key.clone(),
            block_id,
            smaller_ids: coverage.block_ids[..i].iter().copied().collect(),
        })
}

pub fn format_id_list<'a, I>(ids: I) -> String
where
    I: IntoIterator<Item = &'a i64>,
{
    ids.into_iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses a comma-joined id list into a set. Blank input is the empty set.
pub fn parse_id_list(raw: &str) -> Result<BTreeSet<i64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(BTreeSet::new());
    }
    raw.split(',')
        .map(|tok| {
            tok.trim()
                .parse::<i64>()
                .map_err(|_| DedupeError::MalformedCoverageToken(raw.to_string()))
        })
        .collect()
}

/// Like [`parse_id_list`] but an unparsable list becomes the empty set.
pub fn parse_id_list_lenient(raw: Option<&str>) -> BTreeSet<i64> {
    match raw.map(parse_id_list) {
        None => BTreeSet::new(),
        Some(Ok(ids)) => ids,
        Some(Err(e)) => {
            log::warn!("{}; treating as empty exclusion set", e);
            BTreeSet::new()
        }
    }
}
