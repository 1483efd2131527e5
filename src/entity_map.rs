use std::collections::HashMap;

use crate::error::{DedupeError, Result};
use crate::models::{EntityMapEntry, ScoredCluster};

/// Collects matcher clusters into entity map rows, one per clustered record.
///
/// The first member of each cluster becomes its canonical id. A record seen
/// in two clusters is an [`DedupeError::Integrity`] failure, and a cluster
/// whose score list does not match its members is rejected whole.
#[derive(Debug, Default)]
pub struct EntityMapBuilder {
    entries: Vec<EntityMapEntry>,
    seen: HashMap<String, usize>,
    clusters: usize,
}

impl EntityMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cluster(&mut self, cluster: &ScoredCluster) -> Result<()> {
        let Some(canon) = cluster.members.first() else {
            return Ok(());
        };
        if cluster.scores.len() != cluster.members.len() {
            return Err(DedupeError::MalformedCluster {
                canon: canon.clone(),
                members: cluster.members.len(),
                scores: cluster.scores.len(),
            });
        }
        for (record_key, score) in cluster.members.iter().zip(cluster.scores.iter()) {
            if let Some(&prev) = self.seen.get(record_key) {
                return Err(DedupeError::Integrity {
                    record_key: record_key.clone(),
                    first_canon: self.entries[prev].canon_id.clone(),
                    second_canon: canon.clone(),
                });
            }
            self.seen.insert(record_key.clone(), self.entries.len());
            self.entries.push(EntityMapEntry {
                record_key: record_key.clone(),
                canon_id: canon.clone(),
                cluster_score: *score,
            });
        }
        self.clusters += 1;
        Ok(())
    }

    pub fn clusters(&self) -> usize {
        self.clusters
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by record key.
    pub fn finish(self) -> Vec<EntityMapEntry> {
        let mut entries = self.entries;
        entries.sort_by(|a, b| a.record_key.cmp(&b.record_key));
        entries
    }
}

/// Builds the map from a whole cluster sequence.
pub fn build_entity_map<I>(clusters: I) -> Result<Vec<EntityMapEntry>>
where
    I: IntoIterator<Item = ScoredCluster>,
{
    let mut b = EntityMapBuilder::new();
    for c in clusters {
        b.add_cluster(&c)?;
    }
    Ok(b.finish())
}
