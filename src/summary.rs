//! Run summary: phase timings and row counts.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub database: String,
    pub source_table: String,
    pub started_utc: DateTime<Utc>,
    pub ended_utc: DateTime<Utc>,
    pub records: u64,
    pub sample_size: u64,
    pub labels: u64,
    pub indexed_values: u64,
    pub block_assignments: u64,
    pub plural_blocks: u64,
    pub plural_memberships: u64,
    pub covered_records: u64,
    pub candidate_groups: u64,
    pub largest_group: u64,
    pub clusters: u64,
    pub entity_rows: u64,
    pub phases: Vec<(&'static str, Duration)>,
}

impl RunSummary {
    pub fn new(database: &str, source_table: &str) -> Self {
        let now = Utc::now();
        Self {
            database: database.to_string(),
            source_table: source_table.to_string(),
            started_utc: now,
            ended_utc: now,
            records: 0,
            sample_size: 0,
            labels: 0,
            indexed_values: 0,
            block_assignments: 0,
            plural_blocks: 0,
            plural_memberships: 0,
            covered_records: 0,
            candidate_groups: 0,
            largest_group: 0,
            clusters: 0,
            entity_rows: 0,
            phases: Vec::new(),
        }
    }

    /// Starts timing a phase; pass the result to [`end_phase`](Self::end_phase).
    pub fn begin_phase(&self, name: &'static str) -> (&'static str, Instant) {
        log::info!("[{}] starting", name);
        (name, Instant::now())
    }

    pub fn end_phase(&mut self, started: (&'static str, Instant)) {
        let (name, at) = started;
        let took = at.elapsed();
        log::info!("[{}] done in {:.2}s", name, took.as_secs_f64());
        self.phases.push((name, took));
    }

    pub fn finish(&mut self) {
        self.ended_utc = Utc::now();
    }

    pub fn duration_secs(&self) -> f64 {
        (self.ended_utc - self.started_utc).num_milliseconds() as f64 / 1000.0
    }

    pub fn log(&self) {
        log::info!(
            "Run on {}.{} finished at {} ({:.1}s)",
            self.database,
            self.source_table,
            self.ended_utc.to_rfc3339(),
            self.duration_secs()
        );
        log::info!(
            "records={} sample={} labels={} indexed_values={} assignments={}",
            self.records,
            self.sample_size,
            self.labels,
            self.indexed_values,
            self.block_assignments
        );
        log::info!(
            "plural_blocks={} memberships={} covered_records={} groups={} largest_group={}",
            self.plural_blocks,
            self.plural_memberships,
            self.covered_records,
            self.candidate_groups,
            self.largest_group
        );
        log::info!("clusters={} entity_rows={}", self.clusters, self.entity_rows);
        for (name, took) in &self.phases {
            log::debug!("  {:<12} {:>8.2}s", name, took.as_secs_f64());
        }
    }
}
