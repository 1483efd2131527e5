pub mod blocking;
pub mod blocks;
pub mod candidates;
pub mod cli;
pub mod config;
pub mod coverage;
pub mod db;
pub mod entity_map;
pub mod matching;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod summary;
pub mod training;
pub mod util;

pub mod error;
