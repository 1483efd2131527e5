use rayon::prelude::*;
use strsim::jaro_winkler;

use super::Matcher;
use super::cluster::{Edge, clusters_from_edges};
use crate::error::{ConfigError, DedupeError, Result};
use crate::models::{CandidateGroup, FieldDef, FieldKind, Record, ScoredCluster};
use crate::normalize::normalize_text;
use crate::training::TrainingSet;

const MIN_WEIGHT: f64 = 0.05;
const GROUPS_PER_CHUNK: usize = 256;

/// Weighted per-field similarity with union-find clustering.
///
/// Groups are pulled from the candidate stream in fixed-size chunks and each
/// chunk is scored in parallel on a dedicated rayon pool.
pub struct FieldSimilarityMatcher {
    fields: Vec<FieldDef>,
    weights: Vec<f64>,
    pool: rayon::ThreadPool,
}

impl FieldSimilarityMatcher {
    pub fn new(fields: Vec<FieldDef>, workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("dedupe-match-{}", i))
            .build()
            .map_err(|e| {
                DedupeError::Config(ConfigError::InvalidValue {
                    field: "pipeline.workers",
                    reason: e.to_string(),
                })
            })?;
        let weights = vec![1.0; fields.len()];
        Ok(Self {
            fields,
            weights,
            pool,
        })
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    fn field_similarity(&self, idx: usize, a: &str, b: &str) -> f64 {
        match self.fields[idx].kind {
            FieldKind::String | FieldKind::ShortString => {
                jaro_winkler(&normalize_text(a), &normalize_text(b))
            }
            FieldKind::Categorical => {
                if normalize_text(a) == normalize_text(b) {
                    1.0
                } else {
                    0.0
                }
            }
            FieldKind::Price => match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
                (Ok(x), Ok(y)) => {
                    let (x, y) = (x.abs(), y.abs());
                    let hi = x.max(y);
                    if hi == 0.0 { 1.0 } else { x.min(y) / hi }
                }
                _ => {
                    if a.trim() == b.trim() {
                        1.0
                    } else {
                        0.0
                    }
                }
            },
        }
    }

    /// Weighted mean over fields present on both sides; 0 when none are.
    pub fn score(&self, a: &Record, b: &Record) -> f64 {
        let mut num = 0.0;
        let mut den = 0.0;
        for (idx, w) in self.weights.iter().enumerate() {
            if let (Some(x), Some(y)) = (a.value(idx), b.value(idx)) {
                num += w * self.field_similarity(idx, x, y);
                den += w;
            }
        }
        if den == 0.0 { 0.0 } else { num / den }
    }

    fn mean_similarity<'p, I>(&self, idx: usize, pairs: I) -> Option<f64>
    where
        I: Iterator<Item = (&'p Record, &'p Record)>,
    {
        let mut total = 0.0;
        let mut n = 0usize;
        for (a, b) in pairs {
            if let (Some(x), Some(y)) = (a.value(idx), b.value(idx)) {
                total += self.field_similarity(idx, x, y);
                n += 1;
            }
        }
        (n > 0).then(|| total / n as f64)
    }

    fn score_group(&self, group: &CandidateGroup, threshold: f64) -> Vec<Edge> {
        group
            .pairs()
            .filter_map(|(i, j)| {
                let a = &group.members[i].record;
                let b = &group.members[j].record;
                let s = self.score(a, b);
                (s >= threshold).then(|| Edge {
                    left: a.key.clone(),
                    right: b.key.clone(),
                    score: s,
                })
            })
            .collect()
    }
}

impl Matcher for FieldSimilarityMatcher {
    /// Field weight is how much better a field separates labelled matches from
    /// labelled distinct pairs. Without labels, random sample pairs stand in
    /// for distinct pairs and a perfect match is assumed.
    fn train(&mut self, sample: &[Record], labels: &TrainingSet) -> Result<()> {
        let width = self.fields.len();
        for r in sample
            .iter()
            .chain(labels.matches.iter().flat_map(|p| [&p.left, &p.right]))
            .chain(labels.distinct.iter().flat_map(|p| [&p.left, &p.right]))
        {
            if r.values.len() != width {
                return Err(DedupeError::Config(ConfigError::InvalidValue {
                    field: "source.fields",
                    reason: format!(
                        "record {} has {} values, schema has {} fields",
                        r.key,
                        r.values.len(),
                        width
                    ),
                }));
            }
        }
        let sample_pairs = || sample.iter().zip(sample.iter().skip(1));
        let mut weights = Vec::with_capacity(width);
        for idx in 0..width {
            let baseline = self.mean_similarity(idx, sample_pairs()).unwrap_or(0.5);
            let matched = self
                .mean_similarity(idx, labels.matches.iter().map(|p| (&p.left, &p.right)))
                .unwrap_or(1.0);
            let distinct = self
                .mean_similarity(idx, labels.distinct.iter().map(|p| (&p.left, &p.right)))
                .unwrap_or(baseline);
            weights.push((matched - distinct).max(MIN_WEIGHT));
        }
        log::debug!(
            "Trained field weights from {} sample records, {} labels: {:?}",
            sample.len(),
            labels.len(),
            self.fields
                .iter()
                .map(|f| f.field.as_str())
                .zip(weights.iter())
                .collect::<Vec<_>>()
        );
        self.weights = weights;
        Ok(())
    }

    fn match_blocks<'a>(
        &'a self,
        groups: &'a mut dyn Iterator<Item = CandidateGroup>,
        threshold: f64,
    ) -> Box<dyn Iterator<Item = ScoredCluster> + 'a> {
        let mut edges: Vec<Edge> = Vec::new();
        let mut chunk: Vec<CandidateGroup> = Vec::with_capacity(GROUPS_PER_CHUNK);
        let mut scored_groups = 0usize;
        loop {
            chunk.clear();
            chunk.extend((&mut *groups).take(GROUPS_PER_CHUNK));
            if chunk.is_empty() {
                break;
            }
            scored_groups += chunk.len();
            let found: Vec<Edge> = self.pool.install(|| {
                chunk
                    .par_iter()
                    .flat_map_iter(|g| self.score_group(g, threshold))
                    .collect()
            });
            edges.extend(found);
        }
        let clusters = clusters_from_edges(&edges);
        log::info!(
            "Scored {} candidate groups: {} pairs above {:.2}, {} clusters",
            scored_groups,
            edges.len(),
            threshold,
            clusters.len()
        );
        Box::new(clusters.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CandidateRecord;
    use crate::training::LabeledPair;
    use std::collections::BTreeSet;

    fn fields() -> Vec<FieldDef> {
        vec![
            FieldDef::new("name", FieldKind::String),
            FieldDef::new("owner", FieldKind::Categorical).with_categories(&["A", "B"]),
            FieldDef::new("employees", FieldKind::Price).missing(),
        ]
    }

    fn rec(key: &str, name: &str, owner: &str, emp: Option<&str>) -> Record {
        Record::new(
            key,
            vec![Some(name.into()), Some(owner.into()), emp.map(str::to_string)],
        )
    }

    fn member(r: Record, smaller: &[i64]) -> CandidateRecord {
        CandidateRecord {
            record: r,
            smaller_ids: smaller.iter().copied().collect::<BTreeSet<_>>(),
        }
    }

    #[test]
    fn identical_records_score_one() {
        let m = FieldSimilarityMatcher::new(fields(), 1).unwrap();
        let a = rec("1", "Acme Welding", "A", Some("10"));
        assert!((m.score(&a, &a.clone()) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn missing_values_do_not_count() {
        let m = FieldSimilarityMatcher::new(fields(), 1).unwrap();
        let a = rec("1", "Acme", "A", None);
        let b = rec("2", "Acme", "A", Some("500"));
        assert!((m.score(&a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn price_similarity_is_ratio() {
        let m = FieldSimilarityMatcher::new(fields(), 1).unwrap();
        assert!((m.field_similarity(2, "50", "100") - 0.5).abs() < 1e-9);
        assert_eq!(m.field_similarity(2, "0", "0"), 1.0);
    }

    #[test]
    fn training_upweights_discriminating_fields() {
        let mut m = FieldSimilarityMatcher::new(fields(), 1).unwrap();
        let labels = TrainingSet {
            matches: vec![LabeledPair {
                left: rec("1", "Acme Welding", "A", Some("10")),
                right: rec("2", "Acme Welding Inc", "B", Some("10")),
            }],
            distinct: vec![LabeledPair {
                left: rec("3", "Zeta Foods", "A", Some("10")),
                right: rec("4", "Omega Tools", "A", Some("10")),
            }],
        };
        m.train(&[], &labels).unwrap();
        let w = m.weights();
        assert!(w[0] > w[1]);
        assert_eq!(w[2], MIN_WEIGHT);
    }

    #[test]
    fn training_rejects_misaligned_records() {
        let mut m = FieldSimilarityMatcher::new(fields(), 1).unwrap();
        let bad = Record::new("x", vec![Some("a".into())]);
        assert!(m.train(&[bad], &TrainingSet::default()).is_err());
    }

    #[test]
    fn excluded_pairs_are_not_clustered() {
        let m = FieldSimilarityMatcher::new(fields(), 2).unwrap();
        let groups = vec![CandidateGroup {
            block_id: 2,
            members: vec![
                member(rec("r2", "Acme", "A", None), &[1]),
                member(rec("r3", "Acme", "A", None), &[1]),
            ],
        }];
        let mut it = groups.into_iter();
        assert_eq!(m.match_blocks(&mut it, 0.5).count(), 0);
    }

    #[test]
    fn clusters_span_blocks_without_overlap() {
        let m = FieldSimilarityMatcher::new(fields(), 2).unwrap();
        let groups = vec![
            CandidateGroup {
                block_id: 1,
                members: vec![
                    member(rec("a", "Acme Welding", "A", None), &[]),
                    member(rec("b", "Acme Welding", "A", None), &[]),
                ],
            },
            CandidateGroup {
                block_id: 2,
                members: vec![
                    member(rec("b", "Acme Welding", "A", None), &[1]),
                    member(rec("c", "Acme Weldng", "A", None), &[]),
                    member(rec("z", "Quux", "B", None), &[]),
                ],
            },
        ];
        let mut it = groups.into_iter();
        let clusters: Vec<_> = m.match_blocks(&mut it, 0.8).collect();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].members, vec!["a", "b", "c"]);
        assert_eq!(clusters[0].scores.len(), 3);
    }

    #[test]
    fn groups_beyond_one_chunk_are_all_scored() {
        let m = FieldSimilarityMatcher::new(fields(), 2).unwrap();
        let n = GROUPS_PER_CHUNK * 2 + 3;
        let groups: Vec<CandidateGroup> = (0..n)
            .map(|i| CandidateGroup {
                block_id: i as i64 + 1,
                members: vec![
                    member(rec(&format!("p{:04}a", i), "Acme Welding", "A", None), &[]),
                    member(rec(&format!("p{:04}b", i), "Acme Welding", "A", None), &[]),
                ],
            })
            .collect();
        let mut it = groups.into_iter();
        let clusters: Vec<_> = m.match_blocks(&mut it, 0.9).collect();
        assert_eq!(clusters.len(), n);
        assert!(it.next().is_none());
        assert_eq!(clusters[n - 1].members, vec![format!("p{:04}a", n - 1), format!("p{:04}b", n - 1)]);
    }
}
