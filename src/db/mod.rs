pub mod connection;
pub mod scan;
pub mod schema;

pub use connection::make_pool;
pub use scan::{
    CandidateCursor, count_records, fetch_candidate_page, fetch_distinct_page,
    fetch_memberships_page, fetch_records_page, fetch_sample,
};
pub use schema::{
    PluralCounts, create_blocking_map, create_coverage_tables, index_blocking_map,
    insert_block_assignments, insert_covered_blocks, insert_smaller_coverage,
    materialize_plural_blocks, write_entity_map,
};
