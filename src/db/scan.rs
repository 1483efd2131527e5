//! Keyset-paginated scans over the source table and the working tables.
//!
//! No scan materializes a full table: each call returns at most `limit` rows
//! strictly after the given keyset position.

use sqlx::mysql::MySqlRow;
use sqlx::{MySqlPool, Row};
use tokio::runtime::Handle;

use super::schema::{PLURAL_BLOCK, SMALLER_COVERAGE, validate_ident};
use crate::candidates::CandidateRow;
use crate::config::SourceConfig;
use crate::coverage::parse_id_list_lenient;
use crate::error::Result;
use crate::models::Record;

/// `SELECT` list: the key expression as `record_key`, then every configured
/// field as text aliased `v0..vn`.
fn select_list(src: &SourceConfig, key_expr: &str, prefix: &str) -> Result<String> {
    let mut parts = vec![format!("{} AS record_key", key_expr)];
    for (i, f) in src.fields.iter().enumerate() {
        validate_ident(&f.field)?;
        parts.push(format!("CAST({}`{}` AS CHAR) AS v{}", prefix, f.field, i));
    }
    Ok(parts.join(", "))
}

fn record_from_row(row: &MySqlRow, src: &SourceConfig) -> Result<Record> {
    let key: String = row.try_get("record_key")?;
    let mut values = Vec::with_capacity(src.fields.len());
    for (i, f) in src.fields.iter().enumerate() {
        let raw: Option<String> = row.try_get(format!("v{}", i).as_str())?;
        values.push(f.value_from_raw(raw));
    }
    Ok(Record { key, values })
}

pub async fn count_records(pool: &MySqlPool, src: &SourceConfig) -> Result<i64> {
    validate_ident(&src.table)?;
    let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM `{}`", src.table))
        .fetch_one(pool)
        .await?;
    Ok(row.try_get::<i64, _>("n")?)
}

/// Deterministic sample: records whose key hashes into the lowest `fraction`
/// of 10 000 buckets, first `limit` by key.
pub async fn fetch_sample(
    pool: &MySqlPool,
    src: &SourceConfig,
    fraction: f64,
    limit: i64,
) -> Result<Vec<Record>> {
    validate_ident(&src.table)?;
    validate_ident(&src.key_field)?;
    let key = format!("`{}`", src.key_field);
    let sql = format!(
        "SELECT {sel} FROM `{table}` WHERE MOD(CRC32(CAST({key} AS CHAR)), 10000) < ? \
         ORDER BY {key} LIMIT ?",
        sel = select_list(src, &format!("CAST({} AS CHAR)", key), "")?,
        table = src.table,
        key = key
    );
    let buckets = (fraction * 10_000.0).ceil() as i64;
    let rows = sqlx::query(&sql)
        .bind(buckets)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(|r| record_from_row(r, src)).collect()
}

pub async fn fetch_records_page(
    pool: &MySqlPool,
    src: &SourceConfig,
    after: Option<&str>,
    limit: usize,
) -> Result<Vec<Record>> {
    validate_ident(&src.table)?;
    validate_ident(&src.key_field)?;
    let key = format!("`{}`", src.key_field);
    let mut sql = format!(
        "SELECT {} FROM `{}`",
        select_list(src, &format!("CAST({} AS CHAR)", key), "")?,
        src.table
    );
    if after.is_some() {
        sql.push_str(&format!(" WHERE {} > ?", key));
    }
    sql.push_str(&format!(" ORDER BY {} LIMIT ?", key));
    let mut q = sqlx::query(&sql);
    if let Some(a) = after {
        q = q.bind(a);
    }
    let rows = q.bind(limit as i64).fetch_all(pool).await?;
    rows.iter().map(|r| record_from_row(r, src)).collect()
}

pub async fn fetch_distinct_page(
    pool: &MySqlPool,
    src: &SourceConfig,
    field: &str,
    after: Option<&str>,
    limit: usize,
) -> Result<Vec<String>> {
    validate_ident(&src.table)?;
    validate_ident(field)?;
    let v = format!("CAST(`{}` AS CHAR) COLLATE utf8mb4_bin", field);
    let mut sql = format!(
        "SELECT DISTINCT {v} AS v FROM `{table}` WHERE `{field}` IS NOT NULL",
        v = v,
        table = src.table,
        field = field
    );
    if after.is_some() {
        sql.push_str(&format!(" AND {} > ?", v));
    }
    sql.push_str(" ORDER BY v LIMIT ?");
    let mut q = sqlx::query(&sql);
    if let Some(a) = after {
        q = q.bind(a);
    }
    let rows = q.bind(limit as i64).fetch_all(pool).await?;
    let mut out = Vec::with_capacity(rows.len());
    for r in &rows {
        out.push(r.try_get::<String, _>("v")?);
    }
    Ok(out)
}

/// Plural memberships ordered by `(record_key, block_id)`.
pub async fn fetch_memberships_page(
    pool: &MySqlPool,
    after: Option<(&str, i64)>,
    limit: usize,
) -> Result<Vec<(String, i64)>> {
    let mut sql = format!("SELECT record_key, block_id FROM `{}`", PLURAL_BLOCK);
    if after.is_some() {
        sql.push_str(" WHERE record_key > ? OR (record_key = ? AND block_id > ?)");
    }
    sql.push_str(" ORDER BY record_key, block_id LIMIT ?");
    let mut q = sqlx::query(&sql);
    if let Some((k, id)) = after {
        q = q.bind(k).bind(k).bind(id);
    }
    let rows = q.bind(limit as i64).fetch_all(pool).await?;
    let mut out = Vec::with_capacity(rows.len());
    for r in &rows {
        out.push((r.try_get::<String, _>("record_key")?, r.try_get::<i64, _>("block_id")?));
    }
    Ok(out)
}

/// `smaller_coverage ⋈ source` rows ordered by `(block_id, record_key)`.
pub async fn fetch_candidate_page(
    pool: &MySqlPool,
    src: &SourceConfig,
    after: Option<(i64, &str)>,
    limit: usize,
) -> Result<Vec<CandidateRow>> {
    validate_ident(&src.table)?;
    validate_ident(&src.key_field)?;
    let mut sql = format!(
        "SELECT sc.block_id, sc.smaller_ids, {sel} \
         FROM `{sc}` sc INNER JOIN `{table}` r ON r.`{key}` = sc.record_key",
        sel = select_list(src, "sc.record_key", "r.")?,
        sc = SMALLER_COVERAGE,
        table = src.table,
        key = src.key_field
    );
    if after.is_some() {
        sql.push_str(" WHERE sc.block_id > ? OR (sc.block_id = ? AND sc.record_key > ?)");
    }
    sql.push_str(" ORDER BY sc.block_id, sc.record_key LIMIT ?");
    let mut q = sqlx::query(&sql);
    if let Some((id, k)) = after {
        q = q.bind(id).bind(id).bind(k);
    }
    let rows = q.bind(limit as i64).fetch_all(pool).await?;
    let mut out = Vec::with_capacity(rows.len());
    for r in &rows {
        let smaller: Option<String> = r.try_get("smaller_ids")?;
        out.push(CandidateRow {
            block_id: r.try_get("block_id")?,
            record: record_from_row(r, src)?,
            smaller_ids: parse_id_list_lenient(smaller.as_deref()),
        });
    }
    Ok(out)
}

/// Blocking iterator over candidate rows in block order, one page in memory
/// at a time.
///
/// Drives async fetches through `handle`, so it must run on a thread outside
/// the runtime's workers, e.g. inside `tokio::task::spawn_blocking`.
pub struct CandidateCursor {
    handle: Handle,
    pool: MySqlPool,
    source: SourceConfig,
    page_size: usize,
    after: Option<(i64, String)>,
    page: std::vec::IntoIter<CandidateRow>,
    exhausted: bool,
}

impl CandidateCursor {
    pub fn new(handle: Handle, pool: MySqlPool, source: SourceConfig, page_size: usize) -> Self {
        Self {
            handle,
            pool,
            source,
            page_size: page_size.max(1),
            after: None,
            page: Vec::new().into_iter(),
            exhausted: false,
        }
    }
}

impl Iterator for CandidateCursor {
    type Item = Result<CandidateRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(row) = self.page.next() {
            return Some(Ok(row));
        }
        if self.exhausted {
            return None;
        }
        let after = self.after.as_ref().map(|(id, k)| (*id, k.as_str()));
        let fetched = self.handle.block_on(fetch_candidate_page(
            &self.pool,
            &self.source,
            after,
            self.page_size,
        ));
        match fetched {
            Ok(rows) => {
                if rows.len() < self.page_size {
                    self.exhausted = true;
                }
                if let Some(last) = rows.last() {
                    self.after = Some((last.block_id, last.record.key.clone()));
                }
                self.page = rows.into_iter();
                self.page.next().map(Ok)
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldDef, FieldKind};

    #[test]
    fn select_list_aliases_fields_in_order() {
        let src = SourceConfig {
            table: "records".into(),
            key_field: "id".into(),
            fields: vec![
                FieldDef::new("name", FieldKind::String),
                FieldDef::new("zip", FieldKind::ShortString),
            ],
        };
        let sel = select_list(&src, "sc.record_key", "r.").unwrap();
        assert_eq!(
            sel,
            "sc.record_key AS record_key, CAST(r.`name` AS CHAR) AS v0, CAST(r.`zip` AS CHAR) AS v1"
        );
    }

    #[test]
    fn select_list_rejects_bad_field() {
        let src = SourceConfig {
            table: "records".into(),
            key_field: "id".into(),
            fields: vec![FieldDef::new("na`me", FieldKind::String)],
        };
        assert!(select_list(&src, "id", "").is_err());
    }
}
