//! Streaming assembly of per-block candidate groups.

use std::collections::BTreeSet;
use std::time::Instant;

use crate::error::{DedupeError, Result};
use crate::models::{CandidateGroup, CandidateRecord, Record};

pub const DEFAULT_PROGRESS_EVERY: usize = 10_000;

/// One `smaller_coverage ⋈ records` row.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRow {
    pub block_id: i64,
    pub record: Record,
    pub smaller_ids: BTreeSet<i64>,
}

/// Pull-based grouping of rows into [`CandidateGroup`]s.
///
/// Rows must arrive in non-decreasing `block_id` order; the stream does not
/// re-sort. Only the block under the cursor is buffered. The first error from
/// the row source is yielded and ends the stream.
pub struct CandidateStream<I> {
    rows: I,
    current: Option<i64>,
    buffer: Vec<CandidateRecord>,
    groups: usize,
    largest: usize,
    progress_every: usize,
    started: Instant,
    done: bool,
}

impl<I> CandidateStream<I>
where
    I: Iterator<Item = Result<CandidateRow>>,
{
    pub fn new(rows: I) -> Self {
        Self::with_progress(rows, DEFAULT_PROGRESS_EVERY)
    }

    pub fn with_progress(rows: I, progress_every: usize) -> Self {
        Self {
            rows,
            current: None,
            buffer: Vec::new(),
            groups: 0,
            largest: 0,
            progress_every: progress_every.max(1),
            started: Instant::now(),
            done: false,
        }
    }

    /// Groups emitted so far.
    pub fn groups_emitted(&self) -> usize {
        self.groups
    }

    /// Size of the largest group emitted so far.
    pub fn largest_group(&self) -> usize {
        self.largest
    }

    fn emit(&mut self, block_id: i64, members: Vec<CandidateRecord>) -> CandidateGroup {
        self.groups += 1;
        self.largest = self.largest.max(members.len());
        if self.groups % self.progress_every == 0 {
            let mem = crate::metrics::memory_stats_mb();
            log::debug!(
                "{} blocks, {:.1}s elapsed, rss {} MB, {} MB available",
                self.groups,
                self.started.elapsed().as_secs_f64(),
                mem.process_mb,
                mem.avail_mb
            );
        }
        CandidateGroup { block_id, members }
    }
}

impl<I> Iterator for CandidateStream<I>
where
    I: Iterator<Item = Result<CandidateRow>>,
{
    type Item = Result<CandidateGroup>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.rows.next() {
                Some(Ok(row)) => {
                    let member = CandidateRecord {
                        record: row.record,
                        smaller_ids: row.smaller_ids,
                    };
                    if self.current == Some(row.block_id) {
                        self.buffer.push(member);
                        continue;
                    }
                    let finished = self.current.replace(row.block_id);
                    let members = std::mem::replace(&mut self.buffer, vec![member]);
                    if let Some(block_id) = finished {
                        return Some(Ok(self.emit(block_id, members)));
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    self.buffer.clear();
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    let block_id = self.current.take()?;
                    let members = std::mem::take(&mut self.buffer);
                    if members.is_empty() {
                        return None;
                    }
                    log::debug!("candidate stream finished after {} blocks", self.groups + 1);
                    return Some(Ok(self.emit(block_id, members)));
                }
            }
        }
    }
}

/// Yields the `Ok` values of `iter` and parks the first error in `slot`,
/// ending the sequence there.
pub fn until_error<'a, T, I>(
    iter: I,
    slot: &'a mut Option<DedupeError>,
) -> impl Iterator<Item = T> + 'a
where
    I: Iterator<Item = Result<T>> + 'a,
    T: 'a,
{
    iter.map_while(move |r| match r {
        Ok(v) => Some(v),
        Err(e) => {
            *slot = Some(e);
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(block_id: i64, key: &str, smaller: &[i64]) -> Result<CandidateRow> {
        Ok(CandidateRow {
            block_id,
            record: Record::new(key, vec![Some(key.to_string())]),
            smaller_ids: smaller.iter().copied().collect(),
        })
    }

    fn keys(g: &CandidateGroup) -> Vec<&str> {
        g.members.iter().map(|m| m.record.key.as_str()).collect()
    }

    #[test]
    fn groups_on_block_boundaries() {
        let rows = vec![
            row(1, "r1", &[]),
            row(1, "r2", &[]),
            row(1, "r3", &[]),
            row(2, "r2", &[1]),
            row(2, "r3", &[1]),
        ];
        let groups: Vec<CandidateGroup> = CandidateStream::new(rows.into_iter())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(keys(&groups[0]), vec!["r1", "r2", "r3"]);
        assert_eq!(groups[1].block_id, 2);
        assert_eq!(keys(&groups[1]), vec!["r2", "r3"]);
    }

    #[test]
    fn scenario_exclusion_in_larger_block() {
        let rows = vec![
            row(1, "r1", &[]),
            row(1, "r2", &[]),
            row(1, "r3", &[]),
            row(2, "r2", &[1]),
            row(2, "r3", &[1]),
        ];
        let groups: Vec<CandidateGroup> = CandidateStream::new(rows.into_iter())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(groups[0].pairs().count(), 3);
        assert_eq!(groups[1].pairs().count(), 0);
    }

    #[test]
    fn record_with_empty_smaller_ids_is_never_excluded() {
        let rows = vec![row(5, "a", &[]), row(5, "b", &[1, 2]), row(5, "c", &[2])];
        let g = CandidateStream::new(rows.into_iter())
            .next()
            .unwrap()
            .unwrap();
        let pairs: Vec<_> = g.pairs().collect();
        // b and c share block 2, a shares nothing.
        assert_eq!(pairs, vec![(0, 1), (0, 2)]);
    }

    #[test]
    fn empty_input_yields_nothing() {
        let mut s = CandidateStream::new(Vec::<Result<CandidateRow>>::new().into_iter());
        assert!(s.next().is_none());
        assert!(s.next().is_none());
    }

    #[test]
    fn error_ends_stream() {
        let rows = vec![
            row(1, "a", &[]),
            row(1, "b", &[]),
            Err(DedupeError::Connectivity("gone".into())),
            row(2, "c", &[]),
        ];
        let mut s = CandidateStream::new(rows.into_iter());
        assert!(matches!(s.next(), Some(Err(DedupeError::Connectivity(_)))));
        assert!(s.next().is_none());
    }

    #[test]
    fn buffers_one_block_at_a_time() {
        let rows = (0..1_000i64).flat_map(|b| (0..3).map(move |i| row(b, &format!("{b}-{i}"), &[])));
        let mut s = CandidateStream::with_progress(rows, 100);
        let mut n = 0;
        while let Some(g) = s.next() {
            let g = g.unwrap();
            assert_eq!(g.len(), 3);
            assert!(s.buffer.len() <= 3);
            n += 1;
        }
        assert_eq!(n, 1_000);
        assert_eq!(s.largest_group(), 3);
    }

    #[test]
    fn until_error_parks_first_error() {
        let items: Vec<Result<i32>> = vec![
            Ok(1),
            Err(DedupeError::MalformedCoverageToken("x".into())),
            Ok(2),
        ];
        let mut slot = None;
        let got: Vec<i32> = until_error(items.into_iter(), &mut slot).collect();
        assert_eq!(got, vec![1]);
        assert!(matches!(slot, Some(DedupeError::MalformedCoverageToken(_))));
    }
}
