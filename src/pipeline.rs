//! Phase orchestration.
//!
//! [`run`] drives a full rebuild against the store: sample and train, index,
//! block, materialize plural blocks, compute coverage, stream candidate groups
//! into the matcher, write the entity map. Each phase completes before the
//! next starts, except candidate generation and matching, which stream.
//!
//! [`dedupe_in_memory`] runs the same stages over an in-memory record set.

use anyhow::{Context, Result};
use sqlx::MySqlPool;
use std::collections::{BTreeSet, HashMap};
use tokio::runtime::Handle;

use crate::blocking::{Blocker, BlockingEngine, index_field};
use crate::blocks::{materialize, memberships_by_record};
use crate::candidates::{CandidateRow, CandidateStream, until_error};
use crate::config::{AppConfig, SourceConfig};
use crate::coverage::{CoverageAccumulator, coverage_from_sorted, smaller_coverage};
use crate::db;
use crate::entity_map::EntityMapBuilder;
use crate::error::DedupeError;
use crate::matching::Matcher;
use crate::models::{
    BlockAssignment, Coverage, EntityMapEntry, PluralBlock, Record, SmallerCoverage,
};
use crate::summary::RunSummary;
use crate::training;

fn unknown_index_field(field: &str) -> DedupeError {
    DedupeError::Indexing {
        field: field.to_string(),
        reason: "field not in source schema".into(),
    }
}

/// Buffers coverage rows and flushes them in bulk.
struct CoverageWriter<'p> {
    pool: &'p MySqlPool,
    batch: usize,
    covered: Vec<Coverage>,
    smaller: Vec<SmallerCoverage>,
    records: u64,
}

impl<'p> CoverageWriter<'p> {
    fn new(pool: &'p MySqlPool, batch: usize) -> Self {
        Self {
            pool,
            batch,
            covered: Vec::new(),
            smaller: Vec::new(),
            records: 0,
        }
    }

    async fn push(&mut self, cov: Coverage) -> Result<()> {
        self.smaller.extend(smaller_coverage(&cov));
        self.covered.push(cov);
        self.records += 1;
        if self.covered.len() >= self.batch || self.smaller.len() >= self.batch {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.covered.is_empty() {
            db::insert_covered_blocks(self.pool, &self.covered, self.batch).await?;
            self.covered.clear();
        }
        if !self.smaller.is_empty() {
            db::insert_smaller_coverage(self.pool, &self.smaller, self.batch).await?;
            self.smaller.clear();
        }
        Ok(())
    }
}

async fn train_phase<M: Matcher>(
    pool: &MySqlPool,
    cfg: &AppConfig,
    matcher: &mut M,
    summary: &mut RunSummary,
) -> Result<()> {
    let src = &cfg.source;
    let count = db::count_records(pool, src).await?;
    let sample_size = (count as f64 * cfg.pipeline.sample) as i64;
    log::debug!("Generating sample of {} records out of {}", sample_size, count);
    let sample = db::fetch_sample(pool, src, cfg.pipeline.sample, sample_size).await?;

    let path = &cfg.pipeline.training_path;
    let labels = training::load_or_empty(path)?;
    matcher.train(&sample, &labels)?;
    log::debug!("Saving training file to {}", path.display());
    training::save(path, &labels)?;

    summary.records = count.max(0) as u64;
    summary.sample_size = sample.len() as u64;
    summary.labels = labels.len() as u64;
    Ok(())
}

async fn index_phase<B: Blocker>(
    pool: &MySqlPool,
    cfg: &AppConfig,
    blocker: &mut B,
    summary: &mut RunSummary,
) -> Result<()> {
    let src = &cfg.source;
    for field in blocker.index_fields() {
        if src.field_index(&field).is_none() {
            return Err(unknown_index_field(&field).into());
        }
        log::debug!("Selecting distinct values for \"{}\"", field);
        let mut after: Option<String> = None;
        let mut indexed = 0usize;
        loop {
            let page =
                db::fetch_distinct_page(pool, src, &field, after.as_deref(), cfg.pipeline.batch_size)
                    .await?;
            let Some(last) = page.last().cloned() else {
                break;
            };
            let full = page.len() >= cfg.pipeline.batch_size;
            indexed += index_field(blocker, &field, page)?;
            after = Some(last);
            if !full {
                break;
            }
        }
        log::info!("Indexed {} distinct values of {}", indexed, field);
        summary.indexed_values += indexed as u64;
    }
    Ok(())
}

async fn blocking_phase<B: Blocker>(
    pool: &MySqlPool,
    cfg: &AppConfig,
    blocker: &B,
    summary: &mut RunSummary,
) -> Result<()> {
    let src = &cfg.source;
    let batch = cfg.pipeline.batch_size;
    db::create_blocking_map(pool).await?;
    let mut after: Option<String> = None;
    let mut buffer: Vec<BlockAssignment> = Vec::with_capacity(batch);
    let mut written = 0u64;
    loop {
        let page = db::fetch_records_page(pool, src, after.as_deref(), batch).await?;
        let Some(last) = page.last().map(|r| r.key.clone()) else {
            break;
        };
        let full = page.len() >= batch;
        for assignment in BlockingEngine::new(blocker, page.into_iter()) {
            buffer.push(assignment?);
            if buffer.len() >= batch {
                written += db::insert_block_assignments(pool, &buffer, batch).await?;
                buffer.clear();
            }
        }
        after = Some(last);
        if !full {
            break;
        }
    }
    if !buffer.is_empty() {
        written += db::insert_block_assignments(pool, &buffer, batch).await?;
    }
    log::debug!("Indexing blocks");
    db::index_blocking_map(pool).await?;
    summary.block_assignments = written;
    Ok(())
}

async fn coverage_phase(pool: &MySqlPool, cfg: &AppConfig, summary: &mut RunSummary) -> Result<()> {
    let batch = cfg.pipeline.batch_size;
    db::create_coverage_tables(pool).await?;
    let mut acc = CoverageAccumulator::new();
    let mut writer = CoverageWriter::new(pool, batch);
    let mut after: Option<(String, i64)> = None;
    loop {
        let page = db::fetch_memberships_page(
            pool,
            after.as_ref().map(|(k, id)| (k.as_str(), *id)),
            batch,
        )
        .await?;
        let Some(last) = page.last().cloned() else {
            break;
        };
        let full = page.len() >= batch;
        for (key, block_id) in &page {
            if let Some(cov) = acc.push(key, *block_id) {
                writer.push(cov).await?;
            }
        }
        after = Some(last);
        if !full {
            break;
        }
    }
    if let Some(cov) = acc.finish() {
        writer.push(cov).await?;
    }
    writer.flush().await?;
    summary.covered_records = writer.records;
    Ok(())
}

/// Streams candidate groups from the store into the matcher on a blocking
/// thread and collects the resulting entity map rows.
async fn clustering_phase<M>(
    pool: &MySqlPool,
    cfg: &AppConfig,
    matcher: M,
    summary: &mut RunSummary,
) -> Result<Vec<EntityMapEntry>>
where
    M: Matcher + 'static,
{
    let handle = Handle::current();
    let pool = pool.clone();
    let source = cfg.source.clone();
    let page_size = cfg.pipeline.batch_size;
    let every = cfg.pipeline.progress_every;
    let threshold = cfg.pipeline.threshold;

    let (builder, groups, largest) = tokio::task::spawn_blocking(move || -> crate::error::Result<_> {
        let cursor = db::CandidateCursor::new(handle, pool, source, page_size);
        let mut stream = CandidateStream::with_progress(cursor, every);
        let mut failure: Option<DedupeError> = None;
        let mut builder = EntityMapBuilder::new();
        {
            let mut groups = until_error(stream.by_ref(), &mut failure);
            for cluster in matcher.match_blocks(&mut groups, threshold) {
                builder.add_cluster(&cluster)?;
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        Ok((builder, stream.groups_emitted(), stream.largest_group()))
    })
    .await
    .context("clustering task failed to complete")??;

    summary.candidate_groups = groups as u64;
    summary.largest_group = largest as u64;
    summary.clusters = builder.clusters() as u64;
    Ok(builder.finish())
}

/// Full store-backed run. Every working table and the entity map are rebuilt
/// from scratch; the training file is the only state carried between runs.
pub async fn run<B, M>(
    pool: &MySqlPool,
    cfg: &AppConfig,
    mut blocker: B,
    mut matcher: M,
) -> Result<RunSummary>
where
    B: Blocker,
    M: Matcher + 'static,
{
    let mut summary = RunSummary::new(&cfg.database.database, &cfg.source.table);

    let p = summary.begin_phase("training");
    train_phase(pool, cfg, &mut matcher, &mut summary)
        .await
        .context("training phase failed")?;
    summary.end_phase(p);

    let p = summary.begin_phase("indexing");
    index_phase(pool, cfg, &mut blocker, &mut summary)
        .await
        .context("indexing phase failed")?;
    summary.end_phase(p);

    let p = summary.begin_phase("blocking");
    blocking_phase(pool, cfg, &blocker, &mut summary)
        .await
        .context("blocking phase failed")?;
    summary.end_phase(p);

    let p = summary.begin_phase("plural");
    let counts = db::materialize_plural_blocks(pool)
        .await
        .context("plural block phase failed")?;
    summary.plural_blocks = counts.blocks;
    summary.plural_memberships = counts.memberships;
    summary.end_phase(p);

    let p = summary.begin_phase("coverage");
    coverage_phase(pool, cfg, &mut summary)
        .await
        .context("coverage phase failed")?;
    summary.end_phase(p);

    let p = summary.begin_phase("clustering");
    let entries = clustering_phase(pool, cfg, matcher, &mut summary)
        .await
        .context("clustering phase failed")?;
    summary.end_phase(p);

    let p = summary.begin_phase("entity_map");
    summary.entity_rows = db::write_entity_map(pool, &entries, cfg.pipeline.batch_size)
        .await
        .context("entity map phase failed")?;
    summary.end_phase(p);

    summary.finish();
    Ok(summary)
}

/// Intermediate and final products of an in-memory run.
#[derive(Debug, Clone)]
pub struct InMemoryRun {
    pub plural_blocks: Vec<PluralBlock>,
    pub coverage: Vec<Coverage>,
    pub candidate_groups: usize,
    pub entries: Vec<EntityMapEntry>,
}

/// Stages 1-8 over `records`. The matcher is expected to be trained already.
pub fn dedupe_in_memory<B, M>(
    source: &SourceConfig,
    records: &[Record],
    blocker: &mut B,
    matcher: &M,
    threshold: f64,
) -> crate::error::Result<InMemoryRun>
where
    B: Blocker + ?Sized,
    M: Matcher + ?Sized,
{
    for field in blocker.index_fields() {
        let idx = source
            .field_index(&field)
            .ok_or_else(|| unknown_index_field(&field))?;
        let distinct: BTreeSet<String> = records
            .iter()
            .filter_map(|r| r.value(idx).map(str::to_string))
            .collect();
        index_field(blocker, &field, distinct)?;
    }

    let assignments = BlockingEngine::new(&*blocker, records.iter().cloned())
        .collect::<crate::error::Result<Vec<_>>>()?;
    let plural_blocks = materialize(assignments);
    let memberships = memberships_by_record(&plural_blocks);
    let coverage = coverage_from_sorted(memberships.iter().map(|(k, id)| (k.as_str(), *id)));

    let by_key: HashMap<&str, &Record> = records.iter().map(|r| (r.key.as_str(), r)).collect();
    let mut rows: Vec<CandidateRow> = Vec::new();
    for cov in &coverage {
        let Some(record) = by_key.get(cov.record_key.as_str()) else {
            continue;
        };
        for sc in smaller_coverage(cov) {
            rows.push(CandidateRow {
                block_id: sc.block_id,
                record: (*record).clone(),
                smaller_ids: sc.smaller_ids,
            });
        }
    }
    rows.sort_by(|a, b| {
        a.block_id
            .cmp(&b.block_id)
            .then_with(|| a.record.key.cmp(&b.record.key))
    });

    let mut stream = CandidateStream::new(rows.into_iter().map(Ok));
    let mut failure = None;
    let mut builder = EntityMapBuilder::new();
    {
        let mut groups = until_error(stream.by_ref(), &mut failure);
        for cluster in matcher.match_blocks(&mut groups, threshold) {
            builder.add_cluster(&cluster)?;
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    Ok(InMemoryRun {
        plural_blocks,
        coverage,
        candidate_groups: stream.groups_emitted(),
        entries: builder.finish(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::PredicateBlocker;
    use crate::matching::FieldSimilarityMatcher;
    use crate::matching::cluster::{Edge, clusters_from_edges};
    use crate::models::{CandidateGroup, FieldDef, FieldKind, ScoredCluster};
    use crate::training::TrainingSet;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Blocks records by a fixed key list per record.
    struct FixedBlocker(HashMap<String, Vec<String>>);

    impl Blocker for FixedBlocker {
        fn index_fields(&self) -> Vec<String> {
            Vec::new()
        }
        fn index(&mut self, field: &str, _: &mut dyn Iterator<Item = String>) -> crate::error::Result<usize> {
            Err(unknown_index_field(field))
        }
        fn block_keys(&self, record: &Record) -> crate::error::Result<Vec<String>> {
            Ok(self.0.get(&record.key).cloned().unwrap_or_default())
        }
    }

    /// Records every compared pair and links all of them.
    #[derive(Default)]
    struct RecordingMatcher {
        compared: Mutex<Vec<(i64, String, String)>>,
    }

    impl Matcher for RecordingMatcher {
        fn train(&mut self, _: &[Record], _: &TrainingSet) -> crate::error::Result<()> {
            Ok(())
        }
        fn match_blocks<'a>(
            &'a self,
            groups: &'a mut dyn Iterator<Item = CandidateGroup>,
            _threshold: f64,
        ) -> Box<dyn Iterator<Item = ScoredCluster> + 'a> {
            let mut edges = Vec::new();
            let mut log = self.compared.lock().unwrap();
            for g in groups {
                for (i, j) in g.pairs() {
                    let (a, b) = (&g.members[i].record.key, &g.members[j].record.key);
                    let (a, b) = if a < b { (a, b) } else { (b, a) };
                    log.push((g.block_id, a.clone(), b.clone()));
                    edges.push(Edge {
                        left: a.clone(),
                        right: b.clone(),
                        score: 1.0,
                    });
                }
            }
            Box::new(clusters_from_edges(&edges).into_iter())
        }
    }

    fn schema() -> SourceConfig {
        SourceConfig {
            table: "records".into(),
            key_field: "id".into(),
            fields: vec![FieldDef::new("name", FieldKind::String)],
        }
    }

    fn keyed(records: &[(&str, &[&str])]) -> (Vec<Record>, FixedBlocker) {
        let recs = records
            .iter()
            .map(|(k, _)| Record::new(*k, vec![Some(k.to_string())]))
            .collect();
        let map = records
            .iter()
            .map(|(k, keys)| (k.to_string(), keys.iter().map(|s| s.to_string()).collect()))
            .collect();
        (recs, FixedBlocker(map))
    }

    #[test]
    fn shared_blocks_scenario() {
        let (records, mut blocker) = keyed(&[
            ("r1", &["A"]),
            ("r2", &["A", "B"]),
            ("r3", &["A", "B"]),
        ]);
        let matcher = RecordingMatcher::default();
        let run = dedupe_in_memory(&schema(), &records, &mut blocker, &matcher, 0.5).unwrap();

        assert_eq!(run.plural_blocks.len(), 2);
        let cov: BTreeMap<_, _> = run
            .coverage
            .iter()
            .map(|c| (c.record_key.as_str(), c.block_ids.clone()))
            .collect();
        assert_eq!(cov["r2"], vec![1, 2]);
        assert_eq!(cov["r3"], vec![1, 2]);
        assert_eq!(cov["r1"], vec![1]);

        let compared = matcher.compared.lock().unwrap().clone();
        assert_eq!(compared.len(), 3);
        assert!(compared.iter().all(|(b, _, _)| *b == 1));

        let canon: Vec<_> = run
            .entries
            .iter()
            .map(|e| (e.record_key.as_str(), e.canon_id.as_str()))
            .collect();
        assert_eq!(canon, vec![("r1", "r1"), ("r2", "r1"), ("r3", "r1")]);
    }

    #[test]
    fn singleton_keys_never_reach_matcher() {
        let (records, mut blocker) = keyed(&[("a", &["X"]), ("b", &["Y"]), ("c", &[])]);
        let matcher = RecordingMatcher::default();
        let run = dedupe_in_memory(&schema(), &records, &mut blocker, &matcher, 0.5).unwrap();
        assert!(run.plural_blocks.is_empty());
        assert_eq!(run.candidate_groups, 0);
        assert!(run.entries.is_empty());
    }

    #[test]
    fn every_co_blocked_pair_compared_once_in_min_block() {
        // Deterministic pseudo-random block keys.
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };
        let mut layout: Vec<(String, Vec<String>)> = Vec::new();
        for i in 0..80 {
            let n = (next() % 4) as usize;
            let keys = (0..n).map(|_| format!("k{}", next() % 25)).collect();
            layout.push((format!("rec{:03}", i), keys));
        }
        let records: Vec<Record> = layout
            .iter()
            .map(|(k, _)| Record::new(k.clone(), vec![None]))
            .collect();
        let mut blocker = FixedBlocker(layout.iter().cloned().collect());
        let matcher = RecordingMatcher::default();
        let run = dedupe_in_memory(&schema(), &records, &mut blocker, &matcher, 0.5).unwrap();

        let mut shared: BTreeMap<(String, String), i64> = BTreeMap::new();
        for b in &run.plural_blocks {
            for (i, x) in b.members.iter().enumerate() {
                for y in &b.members[i + 1..] {
                    let key = if x < y { (x.clone(), y.clone()) } else { (y.clone(), x.clone()) };
                    let e = shared.entry(key).or_insert(b.block_id);
                    *e = (*e).min(b.block_id);
                }
            }
        }
        let compared = matcher.compared.lock().unwrap().clone();
        let mut seen: BTreeMap<(String, String), i64> = BTreeMap::new();
        for (block, a, b) in compared {
            assert!(seen.insert((a, b), block).is_none(), "pair compared twice");
        }
        assert_eq!(seen, shared);

        let keys: BTreeSet<_> = run.entries.iter().map(|e| e.record_key.clone()).collect();
        assert_eq!(keys.len(), run.entries.len());
    }

    #[test]
    fn end_to_end_with_builtin_classifier_is_idempotent() {
        let source = SourceConfig {
            table: "records".into(),
            key_field: "id".into(),
            fields: vec![
                FieldDef::new("name", FieldKind::String),
                FieldDef::new("zip", FieldKind::ShortString).missing(),
            ],
        };
        let records = vec![
            Record::new("1", vec![Some("Acme Welding Co".into()), Some("02139".into())]),
            Record::new("2", vec![Some("ACME Welding Company".into()), Some("02139".into())]),
            Record::new("3", vec![Some("Acme Welding".into()), None]),
            Record::new("4", vec![Some("Zeta Bakery".into()), Some("10001".into())]),
            Record::new("5", vec![Some("Omega Tools".into()), Some("10001".into())]),
        ];
        let run_once = || {
            let mut blocker = PredicateBlocker::for_schema(&source).unwrap();
            let mut matcher = FieldSimilarityMatcher::new(source.fields.clone(), 2).unwrap();
            matcher.train(&records, &TrainingSet::default()).unwrap();
            dedupe_in_memory(&source, &records, &mut blocker, &matcher, 0.8).unwrap()
        };
        let first = run_once();
        let second = run_once();
        assert_eq!(first.entries, second.entries);

        let canon: BTreeMap<_, _> = first
            .entries
            .iter()
            .map(|e| (e.record_key.as_str(), e.canon_id.as_str()))
            .collect();
        assert_eq!(canon.get("1"), Some(&"1"));
        assert_eq!(canon.get("2"), Some(&"1"));
        assert_eq!(canon.get("3"), Some(&"1"));
        assert!(!canon.contains_key("4"));
    }

    #[test]
    fn index_field_outside_schema_fails() {
        let source = schema();
        let other = SourceConfig {
            fields: vec![FieldDef::new("alias", FieldKind::String)],
            ..schema()
        };
        let mut blocker = PredicateBlocker::for_schema(&other).unwrap();
        let matcher = RecordingMatcher::default();
        let err = dedupe_in_memory(&source, &[], &mut blocker, &matcher, 0.5).unwrap_err();
        assert!(matches!(err, DedupeError::Indexing { ref field, .. } if field == "alias"));
    }
}
