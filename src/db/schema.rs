//! Working tables of a run and the bulk writes that fill them.
//!
//! Every table is dropped and recreated per run. Key columns use a binary
//! collation so block keys and record keys compare byte-for-byte.

use sqlx::{MySql, MySqlConnection, MySqlPool, QueryBuilder};
use std::collections::HashMap;

use crate::error::{ConfigError, DedupeError, Result};
use crate::models::{BlockAssignment, Coverage, EntityMapEntry, SmallerCoverage};

pub const BLOCKING_MAP: &str = "blocking_map";
pub const PLURAL_KEY: &str = "plural_key";
pub const PLURAL_BLOCK: &str = "plural_block";
pub const COVERED_BLOCKS: &str = "covered_blocks";
pub const SMALLER_COVERAGE: &str = "smaller_coverage";
pub const ENTITY_MAP: &str = "entity_map";

const KEY_COL: &str = "VARCHAR(255) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin NOT NULL";
const BLOCK_KEY_COL: &str = "VARCHAR(200) CHARACTER SET utf8mb4 COLLATE utf8mb4_bin NOT NULL";
// MySQL caps a prepared statement at 65535 placeholders.
const MAX_PLACEHOLDERS: usize = 65_535;

pub fn validate_ident(name: &str) -> Result<()> {
    if !crate::config::is_valid_ident(name) {
        return Err(DedupeError::Config(ConfigError::InvalidValue {
            field: "identifier",
            reason: format!("invalid SQL identifier: {:?}", name),
        }));
    }
    Ok(())
}

fn rows_per_statement(batch: usize, columns: usize) -> usize {
    batch.clamp(1, MAX_PLACEHOLDERS / columns)
}

async fn exec(pool: &MySqlPool, sql: &str) -> Result<()> {
    log::trace!("{}", sql);
    sqlx::query(sql).execute(pool).await?;
    Ok(())
}

pub async fn drop_tables(pool: &MySqlPool, tables: &[&str]) -> Result<()> {
    for t in tables {
        validate_ident(t)?;
        exec(pool, &format!("DROP TABLE IF EXISTS `{}`", t)).await?;
    }
    Ok(())
}

pub async fn create_blocking_map(pool: &MySqlPool) -> Result<()> {
    drop_tables(pool, &[BLOCKING_MAP]).await?;
    exec(
        pool,
        &format!(
            "CREATE TABLE `{BLOCKING_MAP}` (block_key {BLOCK_KEY_COL}, record_key {KEY_COL}) ENGINE=InnoDB"
        ),
    )
    .await
}

pub async fn insert_block_assignments(
    pool: &MySqlPool,
    rows: &[BlockAssignment],
    batch: usize,
) -> Result<u64> {
    let mut conn = pool.acquire().await?;
    let mut written = 0u64;
    for chunk in rows.chunks(rows_per_statement(batch, 2)) {
        let mut q = QueryBuilder::<MySql>::new(format!(
            "INSERT INTO `{BLOCKING_MAP}` (block_key, record_key) "
        ));
        q.push_values(chunk, |mut b, a| {
            b.push_bind(&a.block_key).push_bind(&a.record_key);
        });
        written += q.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(written)
}

pub async fn index_blocking_map(pool: &MySqlPool) -> Result<()> {
    exec(
        pool,
        &format!("CREATE INDEX blocking_map_key_idx ON `{BLOCKING_MAP}` (block_key)"),
    )
    .await
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluralCounts {
    pub blocks: u64,
    pub memberships: u64,
}

/// Keeps block keys shared by two or more distinct records, numbers them in
/// block-key order and joins them back to their members.
pub async fn materialize_plural_blocks(pool: &MySqlPool) -> Result<PluralCounts> {
    drop_tables(
        pool,
        &[PLURAL_KEY, PLURAL_BLOCK, COVERED_BLOCKS, SMALLER_COVERAGE],
    )
    .await?;
    exec(
        pool,
        &format!(
            "CREATE TABLE `{PLURAL_KEY}` (\
               block_id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY, \
               block_key {BLOCK_KEY_COL}, \
               UNIQUE KEY block_key_idx (block_key)) ENGINE=InnoDB"
        ),
    )
    .await?;
    let blocks = sqlx::query(&format!(
        "INSERT INTO `{PLURAL_KEY}` (block_key) \
         SELECT block_key FROM `{BLOCKING_MAP}` \
         GROUP BY block_key HAVING COUNT(DISTINCT record_key) > 1 \
         ORDER BY block_key"
    ))
    .execute(pool)
    .await?
    .rows_affected();

    exec(
        pool,
        &format!(
            "CREATE TABLE `{PLURAL_BLOCK}` (\
               block_id BIGINT NOT NULL, \
               record_key {KEY_COL}, \
               PRIMARY KEY (block_id, record_key), \
               KEY plural_block_record_idx (record_key)) ENGINE=InnoDB"
        ),
    )
    .await?;
    let memberships = sqlx::query(&format!(
        "INSERT INTO `{PLURAL_BLOCK}` (block_id, record_key) \
         SELECT DISTINCT pk.block_id, bm.record_key \
         FROM `{BLOCKING_MAP}` bm INNER JOIN `{PLURAL_KEY}` pk USING (block_key)"
    ))
    .execute(pool)
    .await?
    .rows_affected();

    Ok(PluralCounts {
        blocks,
        memberships,
    })
}

pub async fn create_coverage_tables(pool: &MySqlPool) -> Result<()> {
    drop_tables(pool, &[COVERED_BLOCKS, SMALLER_COVERAGE]).await?;
    exec(
        pool,
        &format!(
            "CREATE TABLE `{COVERED_BLOCKS}` (\
               record_key {KEY_COL} PRIMARY KEY, \
               sorted_ids MEDIUMTEXT NOT NULL) ENGINE=InnoDB"
        ),
    )
    .await?;
    exec(
        pool,
        &format!(
            "CREATE TABLE `{SMALLER_COVERAGE}` (\
               record_key {KEY_COL}, \
               block_id BIGINT NOT NULL, \
               smaller_ids MEDIUMTEXT NOT NULL, \
               PRIMARY KEY (block_id, record_key)) ENGINE=InnoDB"
        ),
    )
    .await
}

pub async fn insert_covered_blocks(pool: &MySqlPool, rows: &[Coverage], batch: usize) -> Result<u64> {
    use crate::coverage::format_id_list;
    let mut conn = pool.acquire().await?;
    let mut written = 0u64;
    for chunk in rows.chunks(rows_per_statement(batch, 2)) {
        let mut q = QueryBuilder::<MySql>::new(format!(
            "INSERT INTO `{COVERED_BLOCKS}` (record_key, sorted_ids) "
        ));
        q.push_values(chunk, |mut b, c| {
            b.push_bind(&c.record_key)
                .push_bind(format_id_list(&c.block_ids));
        });
        written += q.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(written)
}

pub async fn insert_smaller_coverage(
    pool: &MySqlPool,
    rows: &[SmallerCoverage],
    batch: usize,
) -> Result<u64> {
    use crate::coverage::format_id_list;
    let mut conn = pool.acquire().await?;
    let mut written = 0u64;
    for chunk in rows.chunks(rows_per_statement(batch, 3)) {
        let mut q = QueryBuilder::<MySql>::new(format!(
            "INSERT INTO `{SMALLER_COVERAGE}` (record_key, block_id, smaller_ids) "
        ));
        q.push_values(chunk, |mut b, s| {
            b.push_bind(&s.record_key)
                .push_bind(s.block_id)
                .push_bind(format_id_list(&s.smaller_ids));
        });
        written += q.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(written)
}

async fn insert_entity_rows(
    conn: &mut MySqlConnection,
    rows: &[EntityMapEntry],
    batch: usize,
) -> Result<u64> {
    let mut written = 0u64;
    for chunk in rows.chunks(rows_per_statement(batch, 3)) {
        let mut q = QueryBuilder::<MySql>::new(format!(
            "INSERT INTO `{ENTITY_MAP}` (record_key, canon_id, cluster_score) "
        ));
        q.push_values(chunk, |mut b, e| {
            b.push_bind(&e.record_key)
                .push_bind(&e.canon_id)
                .push_bind(e.cluster_score);
        });
        written += q.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(written)
}

/// The table starts empty and binary-collated, so a key repeated in `rows` is
/// the only way the load can hit its primary key.
fn check_unique_keys(rows: &[EntityMapEntry]) -> Result<()> {
    let mut seen: HashMap<&str, &str> = HashMap::with_capacity(rows.len());
    for e in rows {
        if let Some(first) = seen.insert(e.record_key.as_str(), e.canon_id.as_str()) {
            return Err(DedupeError::Integrity {
                record_key: e.record_key.clone(),
                first_canon: first.to_string(),
                second_canon: e.canon_id.clone(),
            });
        }
    }
    Ok(())
}

/// Recreates `entity_map` and loads `entries` in one transaction, then
/// indexes it on `canon_id`.
pub async fn write_entity_map(
    pool: &MySqlPool,
    entries: &[EntityMapEntry],
    batch: usize,
) -> Result<u64> {
    check_unique_keys(entries)?;
    drop_tables(pool, &[ENTITY_MAP]).await?;
    exec(
        pool,
        &format!(
            "CREATE TABLE `{ENTITY_MAP}` (\
               record_key {KEY_COL}, \
               canon_id {KEY_COL}, \
               cluster_score DOUBLE NOT NULL, \
               PRIMARY KEY (record_key)) ENGINE=InnoDB"
        ),
    )
    .await?;
    let mut tx = pool.begin().await?;
    let written = insert_entity_rows(&mut tx, entries, batch).await?;
    tx.commit().await?;
    exec(
        pool,
        &format!("CREATE INDEX head_index ON `{ENTITY_MAP}` (canon_id)"),
    )
    .await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_size_respects_placeholder_cap() {
        assert_eq!(rows_per_statement(10_000, 3), 10_000);
        assert_eq!(rows_per_statement(100_000, 3), 21_845);
        assert_eq!(rows_per_statement(0, 2), 1);
    }

    #[test]
    fn repeated_entity_key_names_both_clusters() {
        let row = |k: &str, c: &str| EntityMapEntry {
            record_key: k.into(),
            canon_id: c.into(),
            cluster_score: 1.0,
        };
        assert!(check_unique_keys(&[row("a", "a"), row("b", "a")]).is_ok());
        let err = check_unique_keys(&[row("a", "a"), row("b", "a"), row("b", "c")]).unwrap_err();
        match err {
            DedupeError::Integrity {
                record_key,
                first_canon,
                second_canon,
            } => {
                assert_eq!(record_key, "b");
                assert_eq!(first_canon, "a");
                assert_eq!(second_canon, "c");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn identifiers_are_checked() {
        assert!(validate_ident(ENTITY_MAP).is_ok());
        assert!(validate_ident("entity map").is_err());
        assert!(validate_ident("").is_err());
    }
}
