//! Classifier seam: training and scoring of candidate groups.

pub mod cluster;
pub mod similarity;

use crate::error::Result;
use crate::models::{CandidateGroup, Record, ScoredCluster};
use crate::training::TrainingSet;

pub use similarity::FieldSimilarityMatcher;

pub trait Matcher: Send {
    /// Fits the model from a record sample and the labelled pairs.
    fn train(&mut self, sample: &[Record], labels: &TrainingSet) -> Result<()>;

    /// Scores candidate groups and returns disjoint clusters. Pairs a group
    /// marks as excluded (see [`CandidateGroup::pairs`]) must not be scored.
    fn match_blocks<'a>(
        &'a self,
        groups: &'a mut dyn Iterator<Item = CandidateGroup>,
        threshold: f64,
    ) -> Box<dyn Iterator<Item = ScoredCluster> + 'a>;
}
