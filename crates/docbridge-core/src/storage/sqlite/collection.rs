//! SQLite collection: documents as rows with a JSON payload column.

use super::ann::{AnnRegistry, RowId};
use super::schema::{
    ensure_table, quote_ident, record_columns, table_exists, table_name, INDEX_META_TABLE,
};
use super::session::Session;
use super::translate::{translate_filter, translate_sort, translate_update, Fragment};
use crate::cursor::{Cursor, CursorSource};
use crate::document::{
    format_timestamp, parse_timestamp, RawRecord, RecordMeta, COLLECTION, CREATED_AT, CREATED_BY,
    DELETED_AT, ID_FIELD, UPDATED_AT, UPDATED_BY, VERSION,
};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::identity::{DocId, Identity, PhysicalKey};
use crate::index::{Index, ID_INDEX_NAME};
use crate::json::{set_path, values_equal, Map};
use crate::options::{FindOptions, Projection, UpdateOptions, UpdateResult};
use crate::storage::traits::Collection;
use crate::update::Update;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

fn now() -> String {
    format_timestamp(&Utc::now())
}

// -----------------------------------------------------------------------------
// Row decoding
// -----------------------------------------------------------------------------

/// Raw column values of one record row.
pub(crate) struct RowParts {
    physical: String,
    data: String,
    created_by: Option<String>,
    updated_by: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
    version: i64,
    deleted_at: Option<String>,
}

/// Read the record columns starting at column 0.
pub(crate) fn read_row(row: &Row<'_>) -> rusqlite::Result<RowParts> {
    Ok(RowParts {
        physical: row.get(0)?,
        data: row.get(1)?,
        created_by: row.get(2)?,
        updated_by: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        version: row.get(6)?,
        deleted_at: row.get(7)?,
    })
}

fn optional_timestamp(value: Option<String>) -> Result<Option<chrono::DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

/// Rebuild a record from its columns and payload.
pub(crate) fn decode_row(parts: RowParts) -> Result<RawRecord> {
    let data: Map = serde_json::from_str(&parts.data)?;
    let id = match data.get(ID_FIELD) {
        Some(Value::String(s)) => DocId::parse(s)?,
        _ => {
            return Err(Error::InvalidIdentity(format!(
                "row {} has no embedded _id",
                parts.physical
            )))
        }
    };
    Ok(RawRecord {
        id,
        data,
        meta: RecordMeta {
            physical_key: PhysicalKey::parse(&parts.physical),
            created_by: parts.created_by,
            updated_by: parts.updated_by,
            created_at: optional_timestamp(parts.created_at)?,
            updated_at: optional_timestamp(parts.updated_at)?,
            version: Some(parts.version),
            deleted_at: optional_timestamp(parts.deleted_at)?,
        },
    })
}

/// Apply a projection to the merged view of a record.
pub(crate) fn project(record: RawRecord, projection: Option<&Projection>) -> RawRecord {
    let Some(projection) = projection else {
        return record;
    };
    let id = record.id;
    let physical_key = record.meta.physical_key;
    let deleted_at = record.meta.deleted_at;
    let mut merged = record.into_map();
    projection.apply(&mut merged);
    RawRecord {
        id,
        data: merged,
        meta: RecordMeta {
            physical_key,
            deleted_at,
            ..RecordMeta::default()
        },
    }
}

pub(crate) fn query_records(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<RawRecord>> {
    tracing::debug!(sql, "query");
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), read_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(decode_row).collect()
}

// -----------------------------------------------------------------------------
// Writes
// -----------------------------------------------------------------------------

fn take_string(doc: &mut Map, key: &str) -> Option<String> {
    match doc.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

/// Insert one document, returning its external identity.
pub(crate) fn insert_row(conn: &Connection, table: &str, mut doc: Map, now: &str) -> Result<DocId> {
    let identity = Identity::assign(doc.get(ID_FIELD))?;
    let created_by = take_string(&mut doc, CREATED_BY);
    let updated_by = take_string(&mut doc, UPDATED_BY).or_else(|| created_by.clone());
    for key in [CREATED_AT, UPDATED_AT, VERSION, COLLECTION, DELETED_AT] {
        doc.remove(key);
    }
    doc.insert(ID_FIELD.to_string(), Value::from(identity.id));

    conn.execute(
        &format!(
            "INSERT INTO {} (_id, data, _created_by, _updated_by, _created_at, _updated_at, _version) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1)",
            quote_ident(table)
        ),
        params![
            identity.physical.to_string(),
            serde_json::to_string(&doc)?,
            created_by,
            updated_by,
            now,
        ],
    )?;
    Ok(identity.id)
}

/// Seed document for an upsert: the filter's equality fields plus the update.
fn upsert_seed(filter: &Filter, update: &Update) -> Map {
    let mut seed = Map::new();
    for (field, value) in filter.equality_fields() {
        if field == ID_FIELD {
            seed.insert(ID_FIELD.to_string(), value.clone());
        } else {
            set_path(&mut seed, field, value.clone());
        }
    }
    update.apply(&mut seed);
    seed
}

fn changed(old: &str, new: &str) -> Result<bool> {
    let old: Value = serde_json::from_str(old)?;
    let new: Value = serde_json::from_str(new)?;
    Ok(!values_equal(&old, &new))
}

// -----------------------------------------------------------------------------
// Collection
// -----------------------------------------------------------------------------

/// A logical collection stored in table `docs_<name>`.
#[derive(Clone)]
pub struct SqliteCollection {
    pub(super) session: Session,
    pub(super) ann: Arc<AnnRegistry>,
    pub(super) name: String,
    pub(super) batch_size: usize,
}

impl SqliteCollection {
    pub(crate) fn new(session: Session, ann: Arc<AnnRegistry>, name: &str, batch_size: usize) -> Self {
        Self {
            session,
            ann,
            name: name.to_string(),
            batch_size,
        }
    }

    pub(super) fn table(&self) -> Result<String> {
        table_name(&self.name)
    }

    async fn update(&self, filter: &Filter, update: &Update, many: bool, upsert: bool) -> Result<UpdateResult> {
        let table = self.table()?;
        let predicate = translate_filter(filter)?;
        let (set, updated_by) = update.sanitized();
        let expr = translate_update(&set)?;
        let seed = upsert.then(|| upsert_seed(filter, update));
        tracing::debug!(collection = %self.name, expr = %expr.sql, "update");

        self.session
            .run("update", move |conn| {
                let sp = conn.savepoint()?;
                ensure_table(&sp, &table)?;
                let quoted = quote_ident(&table);
                let now = now();

                let select = format!(
                    "SELECT _id, data FROM {} WHERE ({}) AND _deleted_at IS NULL ORDER BY rowid{}",
                    quoted,
                    predicate.sql,
                    if many { "" } else { " LIMIT 1" }
                );
                let targets: Vec<(String, String)> = {
                    let mut stmt = sp.prepare(&select)?;
                    let rows = stmt
                        .query_map(params_from_iter(predicate.params.iter()), |row| {
                            Ok((row.get(0)?, row.get(1)?))
                        })?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                };

                let update_sql = format!(
                    "UPDATE {} SET data = {}, _updated_at = ?, _updated_by = COALESCE(?, _updated_by) \
                     WHERE _id = ? RETURNING data",
                    quoted, expr.sql
                );
                let bump_sql = format!("UPDATE {} SET _version = _version + 1 WHERE _id = ?1", quoted);

                let mut result = UpdateResult::default();
                for (physical, old) in targets {
                    let mut bound = expr.params.clone();
                    bound.push(SqlValue::Text(now.clone()));
                    bound.push(updated_by.clone().map_or(SqlValue::Null, SqlValue::Text));
                    bound.push(SqlValue::Text(physical.clone()));
                    let new: String = sp.query_row(&update_sql, params_from_iter(bound.iter()), |row| row.get(0))?;

                    result.matched += 1;
                    if changed(&old, &new)? {
                        sp.execute(&bump_sql, params![physical])?;
                        result.modified += 1;
                    }
                }

                if result.matched == 0 {
                    if let Some(seed) = seed {
                        result.upserted_id = Some(insert_row(&sp, &table, seed, &now)?);
                    }
                }
                sp.commit()?;
                Ok(result)
            })
            .await
    }

    async fn soft_delete(&self, filter: &Filter, many: bool) -> Result<u64> {
        let table = self.table()?;
        let predicate = translate_filter(filter)?;
        self.session
            .run("delete", move |conn| {
                if !table_exists(conn, &table)? {
                    return Ok(0);
                }
                let quoted = quote_ident(&table);
                let sql = if many {
                    format!(
                        "UPDATE {q} SET _deleted_at = ? WHERE ({p}) AND _deleted_at IS NULL",
                        q = quoted,
                        p = predicate.sql
                    )
                } else {
                    format!(
                        "UPDATE {q} SET _deleted_at = ? WHERE _id IN \
                         (SELECT _id FROM {q} WHERE ({p}) AND _deleted_at IS NULL ORDER BY rowid LIMIT 1)",
                        q = quoted,
                        p = predicate.sql
                    )
                };
                let mut bound = vec![SqlValue::Text(now())];
                bound.extend(predicate.params);
                let n = conn.execute(&sql, params_from_iter(bound.iter()))?;
                Ok(n as u64)
            })
            .await
    }

    /// Clear the soft-delete marker of matching documents.
    pub async fn restore_many(&self, filter: &Filter) -> Result<u64> {
        let table = self.table()?;
        let predicate = translate_filter(filter)?;
        self.session
            .run("restore", move |conn| {
                if !table_exists(conn, &table)? {
                    return Ok(0);
                }
                let sql = format!(
                    "UPDATE {} SET _deleted_at = NULL, _updated_at = ? WHERE ({}) AND _deleted_at IS NOT NULL",
                    quote_ident(&table),
                    predicate.sql
                );
                let mut bound = vec![SqlValue::Text(now())];
                bound.extend(predicate.params);
                Ok(conn.execute(&sql, params_from_iter(bound.iter()))? as u64)
            })
            .await
    }

    /// Count matching rows, soft-deleted ones included.
    pub async fn count_including_deleted(&self, filter: &Filter) -> Result<u64> {
        self.count(filter, true).await
    }

    async fn count(&self, filter: &Filter, include_deleted: bool) -> Result<u64> {
        let table = self.table()?;
        let predicate = translate_filter(filter)?;
        self.session
            .run("count", move |conn| {
                if !table_exists(conn, &table)? {
                    return Ok(0);
                }
                let sql = format!(
                    "SELECT COUNT(*) FROM {} WHERE ({}){}",
                    quote_ident(&table),
                    predicate.sql,
                    if include_deleted { "" } else { " AND _deleted_at IS NULL" }
                );
                let n: i64 = conn.query_row(&sql, params_from_iter(predicate.params.iter()), |row| row.get(0))?;
                Ok(n as u64)
            })
            .await
    }

    async fn load_index_specs(&self) -> Result<Vec<(Index, String)>> {
        let collection = self.name.clone();
        self.session
            .run("list_indexes", move |conn| load_index_specs(conn, &collection))
            .await
    }
}

pub(crate) fn load_index_specs(conn: &Connection, collection: &str) -> Result<Vec<(Index, String)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT spec, physical_name FROM {} WHERE collection = ?1 ORDER BY created_at, name",
        INDEX_META_TABLE
    ))?;
    let rows = stmt
        .query_map(params![collection], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(spec, physical)| Ok((serde_json::from_str(&spec)?, physical)))
        .collect()
}

/// DDL of the expression index backing `index`.
fn index_ddl(table: &str, physical: &str, index: &Index) -> Result<String> {
    let mut columns = Vec::with_capacity(index.keys.len());
    let mut present = Vec::with_capacity(index.keys.len());
    for key in &index.keys {
        let path = super::schema::path_literal(&key.field)?;
        let dir = match key.direction {
            crate::options::Direction::Ascending => "",
            crate::options::Direction::Descending => " DESC",
        };
        columns.push(format!("json_extract(data, {}){}", path, dir));
        present.push(format!("json_type(data, {}) IS NOT NULL", path));
    }
    let mut predicate = "_deleted_at IS NULL".to_string();
    if index.sparse {
        predicate.push_str(&format!(" AND ({})", present.join(" OR ")));
    }
    Ok(format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({}) WHERE {}",
        if index.unique { "UNIQUE " } else { "" },
        quote_ident(physical),
        quote_ident(table),
        columns.join(", "),
        predicate
    ))
}

fn check_index_name(name: &str) -> Result<()> {
    if name.chars().any(|c| c == '"' || c.is_control()) {
        return Err(Error::InvalidIndex(format!("unsupported index name {:?}", name)));
    }
    Ok(())
}

/// Fetches the rows of a result set in batches.
///
/// The matching row keys are fixed when the query runs, so writes made while
/// the cursor is consumed neither skip nor repeat rows. Each batch reads the
/// rows' current contents.
struct SqliteCursorSource {
    session: Session,
    table: String,
    keys: VecDeque<RowId>,
    projection: Option<Projection>,
    batch_size: usize,
}

#[async_trait]
impl CursorSource for SqliteCursorSource {
    async fn next_batch(&mut self) -> Result<Vec<RawRecord>> {
        while !self.keys.is_empty() {
            let take = self.batch_size.min(self.keys.len());
            let batch: Vec<RowId> = self.keys.drain(..take).collect();
            let sql = format!(
                "SELECT {} FROM json_each(?1) AS k JOIN {} AS t ON t.rowid = k.value ORDER BY k.key",
                record_columns(Some("t")),
                quote_ident(&self.table)
            );
            let keys = SqlValue::Text(serde_json::to_string(&batch)?);
            let records = self
                .session
                .run("cursor", move |conn| query_records(conn, &sql, &[keys]))
                .await?;
            // Rows removed outright since the query ran are skipped.
            if !records.is_empty() {
                return Ok(records
                    .into_iter()
                    .map(|r| project(r, self.projection.as_ref()))
                    .collect());
            }
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl Collection for SqliteCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert_one(&self, doc: Map) -> Result<DocId> {
        let table = self.table()?;
        self.session
            .run("insert_one", move |conn| {
                ensure_table(conn, &table)?;
                insert_row(conn, &table, doc, &now())
            })
            .await
    }

    async fn insert_many(&self, docs: Vec<Map>) -> Result<Vec<DocId>> {
        let table = self.table()?;
        self.session
            .run("insert_many", move |conn| {
                let sp = conn.savepoint()?;
                ensure_table(&sp, &table)?;
                let now = now();
                let ids = docs
                    .into_iter()
                    .map(|doc| insert_row(&sp, &table, doc, &now))
                    .collect::<Result<Vec<_>>>()?;
                sp.commit()?;
                Ok(ids)
            })
            .await
    }

    async fn find_one(&self, filter: &Filter) -> Result<RawRecord> {
        let table = self.table()?;
        let predicate = translate_filter(filter)?;
        self.session
            .run("find_one", move |conn| {
                if !table_exists(conn, &table)? {
                    return Err(Error::NoDocuments);
                }
                let sql = format!(
                    "SELECT {} FROM {} WHERE ({}) AND _deleted_at IS NULL ORDER BY rowid LIMIT 1",
                    record_columns(None),
                    quote_ident(&table),
                    predicate.sql
                );
                query_records(conn, &sql, &predicate.params)?
                    .into_iter()
                    .next()
                    .ok_or(Error::NoDocuments)
            })
            .await
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Cursor> {
        let table = self.table()?;
        let Fragment { sql: predicate, mut params } = translate_filter(filter)?;
        let order = translate_sort(&options.sort)?;
        let sql = format!(
            "SELECT rowid FROM {} WHERE ({}) AND _deleted_at IS NULL ORDER BY {} LIMIT ? OFFSET ?",
            quote_ident(&table),
            predicate,
            order
        );
        params.push(SqlValue::Integer(
            options.limit.and_then(|n| i64::try_from(n).ok()).unwrap_or(-1),
        ));
        params.push(SqlValue::Integer(
            options.skip.and_then(|n| i64::try_from(n).ok()).unwrap_or(0),
        ));

        let check = table.clone();
        let keys = self
            .session
            .run("find", move |conn| -> Result<Vec<RowId>> {
                if !table_exists(conn, &check)? {
                    return Ok(Vec::new());
                }
                tracing::debug!(sql = %sql, "find");
                let mut stmt = conn.prepare(&sql)?;
                let keys = stmt
                    .query_map(params_from_iter(params.iter()), |row| row.get::<_, RowId>(0))?
                    .collect::<std::result::Result<Vec<RowId>, _>>()?;
                Ok(keys)
            })
            .await?;
        if keys.is_empty() {
            return Ok(Cursor::empty());
        }

        Ok(Cursor::new(Box::new(SqliteCursorSource {
            session: self.session.clone(),
            table,
            keys: keys.into(),
            projection: options.projection.clone(),
            batch_size: options.batch_size.unwrap_or(self.batch_size).max(1),
        })))
    }

    async fn update_one(
        &self,
        filter: &Filter,
        update: &Update,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        self.update(filter, update, false, options.upsert).await
    }

    async fn update_many(
        &self,
        filter: &Filter,
        update: &Update,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        self.update(filter, update, true, options.upsert).await
    }

    async fn replace_one(&self, filter: &Filter, doc: Map) -> Result<UpdateResult> {
        let table = self.table()?;
        let predicate = translate_filter(filter)?;
        let (mut replacement, updated_by) = Update { set: doc }.sanitized();
        replacement.remove(DELETED_AT);

        self.session
            .run("replace_one", move |conn| {
                if !table_exists(conn, &table)? {
                    return Ok(UpdateResult::default());
                }
                let quoted = quote_ident(&table);
                let sql = format!(
                    "SELECT _id, data FROM {} WHERE ({}) AND _deleted_at IS NULL ORDER BY rowid LIMIT 1",
                    quoted, predicate.sql
                );
                let target: Option<(String, String)> = conn
                    .query_row(&sql, params_from_iter(predicate.params.iter()), |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .optional()?;
                let Some((physical, old)) = target else {
                    return Ok(UpdateResult::default());
                };

                let old_map: Map = serde_json::from_str(&old)?;
                if let Some(id) = old_map.get(ID_FIELD) {
                    replacement.insert(ID_FIELD.to_string(), id.clone());
                }
                let modified = !values_equal(&Value::Object(old_map), &Value::Object(replacement.clone()));
                conn.execute(
                    &format!(
                        "UPDATE {} SET data = ?1, _updated_at = ?2, _updated_by = COALESCE(?3, _updated_by), \
                         _version = _version + ?4 WHERE _id = ?5",
                        quoted
                    ),
                    params![
                        serde_json::to_string(&replacement)?,
                        now(),
                        updated_by,
                        modified as i64,
                        physical
                    ],
                )?;
                Ok(UpdateResult {
                    matched: 1,
                    modified: modified as u64,
                    upserted_id: None,
                })
            })
            .await
    }

    async fn delete_one(&self, filter: &Filter) -> Result<u64> {
        self.soft_delete(filter, false).await
    }

    async fn delete_many(&self, filter: &Filter) -> Result<u64> {
        self.soft_delete(filter, true).await
    }

    async fn count_documents(&self, filter: &Filter) -> Result<u64> {
        self.count(filter, false).await
    }

    async fn create_index(&self, index: &Index) -> Result<String> {
        let index = index.normalized()?;
        let name = index.name_str().to_string();
        check_index_name(&name)?;
        let table = self.table()?;
        let collection = self.name.clone();

        self.session
            .run("create_index", move |conn| {
                let sp = conn.savepoint()?;
                ensure_table(&sp, &table)?;
                let existing = load_index_specs(&sp, &collection)?;
                if let Some((found, _)) = existing.iter().find(|(i, _)| i.same_keys(&index)) {
                    tracing::debug!("index {} already covers these keys", found.name_str());
                    return Ok(found.name_str().to_string());
                }
                if existing.iter().any(|(i, _)| i.name == index.name) {
                    return Err(Error::InvalidIndex(format!(
                        "index {} already exists with different keys",
                        name
                    )));
                }

                let physical = format!("{}__{}", table, name);
                let ddl = index_ddl(&table, &physical, &index)?;
                tracing::info!("creating index: {}", ddl);
                sp.execute_batch(&ddl)?;
                sp.execute(
                    &format!(
                        "INSERT INTO {} (collection, name, physical_name, spec, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                        INDEX_META_TABLE
                    ),
                    params![collection, name, physical, serde_json::to_string(&index)?, now()],
                )?;
                sp.commit()?;
                Ok(name)
            })
            .await
    }

    async fn list_indexes(&self) -> Result<Vec<Index>> {
        self.table()?;
        let mut indexes = vec![Index::identity()];
        indexes.extend(self.load_index_specs().await?.into_iter().map(|(index, _)| index));
        Ok(indexes)
    }

    async fn drop_index(&self, name: &str) -> Result<()> {
        if name == ID_INDEX_NAME {
            return Err(Error::InvalidIndex("cannot drop the _id index".to_string()));
        }
        self.table()?;
        let collection = self.name.clone();
        let name = name.to_string();
        self.session
            .run("drop_index", move |conn| {
                let sp = conn.savepoint()?;
                let physical: Option<String> = sp
                    .query_row(
                        &format!(
                            "SELECT physical_name FROM {} WHERE collection = ?1 AND name = ?2",
                            INDEX_META_TABLE
                        ),
                        params![collection, name],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(physical) = physical else {
                    return Err(Error::InvalidIndex(format!("index {} not found", name)));
                };
                sp.execute_batch(&format!("DROP INDEX IF EXISTS {}", quote_ident(&physical)))?;
                sp.execute(
                    &format!("DELETE FROM {} WHERE collection = ?1 AND name = ?2", INDEX_META_TABLE),
                    params![collection, name],
                )?;
                sp.commit()?;
                tracing::info!("dropped index {}", physical);
                Ok(())
            })
            .await
    }
}
