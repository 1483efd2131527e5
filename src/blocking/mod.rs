//! Field indexing and block-key generation.
//!
//! The predicates themselves belong to the classifier; this module only drives
//! them. [`index_field`] registers the distinct values of one field with the
//! blocker, [`BlockingEngine`] turns a record stream into `(block_key,
//! record_key)` assignments.

pub mod predicates;

use std::collections::{BTreeSet, VecDeque};

use crate::error::{DedupeError, Result};
use crate::models::{BlockAssignment, Record};

pub use predicates::{Predicate, PredicateBlocker, PredicateRule};

/// Longest block key the store accepts.
pub const MAX_BLOCK_KEY_CHARS: usize = 200;

pub trait Blocker {
    /// Fields whose predicates need an inverted index before blocking.
    fn index_fields(&self) -> Vec<String>;

    /// Adds distinct values of `field` to its index. May be called more than
    /// once per field; repeated values are ignored.
    fn index(&mut self, field: &str, values: &mut dyn Iterator<Item = String>) -> Result<usize>;

    /// Block keys for one record. Must be deterministic.
    fn block_keys(&self, record: &Record) -> Result<Vec<String>>;
}

/// Registers one field's distinct values with the blocker.
///
/// Fails with [`DedupeError::Indexing`] when the blocker has no index
/// predicate on `field`.
pub fn index_field<B, I>(blocker: &mut B, field: &str, values: I) -> Result<usize>
where
    B: Blocker + ?Sized,
    I: IntoIterator<Item = String>,
{
    if !blocker.index_fields().iter().any(|f| f == field) {
        return Err(DedupeError::Indexing {
            field: field.to_string(),
            reason: "no index predicate configured for this field".into(),
        });
    }
    let mut it = values.into_iter();
    blocker.index(field, &mut it)
}

pub(crate) fn clamp_key(mut key: String) -> String {
    if let Some((cut, _)) = key.char_indices().nth(MAX_BLOCK_KEY_CHARS) {
        key.truncate(cut);
    }
    key
}

/// Lazily maps records to their block assignments.
pub struct BlockingEngine<'a, B: ?Sized, I> {
    blocker: &'a B,
    records: I,
    pending: VecDeque<BlockAssignment>,
    failed: bool,
}

impl<'a, B, I> BlockingEngine<'a, B, I>
where
    B: Blocker + ?Sized,
    I: Iterator<Item = Record>,
{
    pub fn new(blocker: &'a B, records: I) -> Self {
        Self {
            blocker,
            records,
            pending: VecDeque::new(),
            failed: false,
        }
    }
}

impl<'a, B, I> Iterator for BlockingEngine<'a, B, I>
where
    B: Blocker + ?Sized,
    I: Iterator<Item = Record>,
{
    type Item = Result<BlockAssignment>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(a) = self.pending.pop_front() {
                return Some(Ok(a));
            }
            if self.failed {
                return None;
            }
            let record = self.records.next()?;
            match self.blocker.block_keys(&record) {
                Ok(keys) => {
                    let keys: BTreeSet<String> = keys.into_iter().map(clamp_key).collect();
                    self.pending
                        .extend(keys.into_iter().map(|block_key| BlockAssignment {
                            block_key,
                            record_key: record.key.clone(),
                        }));
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
