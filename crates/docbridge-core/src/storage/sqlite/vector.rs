//! Vector columns, ANN indexes and similarity search.

use super::ann::{AnnIndex, AnnRegistry, RowId, Stamp};
use super::collection::{decode_row, read_row, SqliteCollection};
use super::schema::{ensure_table, path_literal, quote_ident, record_columns, VECTOR_META_TABLE};
use super::translate::{translate_filter, Fragment};
use crate::document::{format_timestamp, ID_FIELD};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::identity::DocId;
use crate::vector::{
    decode_vector, encode_vector, HybridHit, HybridQuery, VectorField, VectorHit, VectorIndexInfo,
};
use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::sync::Arc;

/// Candidates fetched per side of a hybrid search, relative to its limit.
const HYBRID_CANDIDATE_FACTOR: usize = 4;

fn sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn column_name(field: &str) -> Result<String> {
    if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Vector(format!(
            "vector field names may only contain letters, digits and '_': {:?}",
            field
        )));
    }
    Ok(format!("vec_{}", field))
}

struct StoredField {
    field: VectorField,
    column: String,
    index: Option<VectorIndexInfo>,
}

fn load_field(conn: &Connection, collection: &str, field: &str) -> Result<Option<StoredField>> {
    let row: Option<(String, String, Option<String>)> = conn
        .query_row(
            &format!(
                "SELECT spec, column_name, index_spec FROM {} WHERE collection = ?1 AND field = ?2",
                VECTOR_META_TABLE
            ),
            params![collection, field],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((spec, column, index)) = row else {
        return Ok(None);
    };
    Ok(Some(StoredField {
        field: serde_json::from_str(&spec)?,
        column,
        index: index.as_deref().map(serde_json::from_str).transpose()?,
    }))
}

fn require_field(conn: &Connection, collection: &str, field: &str) -> Result<StoredField> {
    load_field(conn, collection, field)?.ok_or_else(|| {
        Error::Vector(format!(
            "collection {} has no vector field {}",
            collection, field
        ))
    })
}

fn stamp(conn: &Connection) -> Result<Stamp> {
    Ok(Stamp {
        data_version: conn.query_row("PRAGMA data_version", [], |row| row.get(0))?,
        total_changes: conn.query_row("SELECT total_changes()", [], |row| row.get(0))?,
    })
}

fn load_vectors(conn: &Connection, table: &str, column: &str) -> Result<Vec<(RowId, Vec<f32>)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT rowid, {col} FROM {table} WHERE _deleted_at IS NULL AND {col} IS NOT NULL ORDER BY rowid",
        col = quote_ident(column),
        table = quote_ident(table)
    ))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, RowId>(0)?, row.get::<_, Vec<u8>>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(rowid, bytes)| Ok((rowid, decode_vector(&bytes)?)))
        .collect()
}

/// The field's ANN index, built or reused at the connection's write position.
///
/// Uncommitted writes of an open transaction are invisible to a rollback-safe
/// cache, so searches inside a transaction get `None` and scan exactly.
fn ann_index(
    conn: &Connection,
    registry: &AnnRegistry,
    table: &str,
    stored: &StoredField,
) -> Result<Option<Arc<AnnIndex>>> {
    let Some(info) = &stored.index else {
        return Ok(None);
    };
    if !conn.is_autocommit() {
        return Ok(None);
    }
    let position = stamp(conn)?;
    let index = registry.get_or_build(table, &stored.column, &info.definition, position, || {
        let rows = load_vectors(conn, table, &stored.column)?;
        Ok(AnnIndex::build(info.index, info.metric, rows))
    })?;
    Ok(Some(index))
}

/// Exact nearest rows, optionally restricted to `candidates`.
fn nearest(
    conn: &Connection,
    table: &str,
    stored: &StoredField,
    predicate: &Fragment,
    vector: &[f32],
    limit: usize,
    candidates: Option<&[RowId]>,
) -> Result<Vec<VectorHit>> {
    let column = quote_ident(&stored.column);
    let sql = format!(
        "SELECT {}, {}({}, ?) AS distance FROM {} \
         WHERE ({}) AND _deleted_at IS NULL AND {} IS NOT NULL{} \
         ORDER BY distance ASC, rowid ASC LIMIT ?",
        record_columns(None),
        stored.field.metric.sql_function(),
        column,
        quote_ident(table),
        predicate.sql,
        column,
        if candidates.is_some() {
            " AND rowid IN (SELECT value FROM json_each(?))"
        } else {
            ""
        }
    );
    tracing::debug!(sql = %sql, "vector search");

    let mut bound = vec![SqlValue::Blob(encode_vector(vector))];
    bound.extend(predicate.params.iter().cloned());
    if let Some(candidates) = candidates {
        bound.push(SqlValue::Text(serde_json::to_string(candidates)?));
    }
    bound.push(SqlValue::Integer(sql_limit(limit)));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bound.iter()), |row| {
            Ok((read_row(row)?, row.get::<_, f64>(8)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(parts, distance)| {
            Ok(VectorHit {
                record: decode_row(parts)?,
                distance,
            })
        })
        .collect()
}

impl SqliteCollection {
    /// Add a fixed-width vector column. Re-adding an identical field is a no-op.
    pub async fn add_vector_field(&self, field: &VectorField) -> Result<()> {
        let column = column_name(&field.name)?;
        if field.dimensions == 0 {
            return Err(Error::Vector("vector dimensions must be positive".to_string()));
        }
        let table = self.table()?;
        let collection = self.name.clone();
        let field = field.clone();

        self.session
            .run("add_vector_field", move |conn| {
                let sp = conn.savepoint()?;
                ensure_table(&sp, &table)?;
                if let Some(existing) = load_field(&sp, &collection, &field.name)? {
                    if existing.field.dimensions != field.dimensions {
                        return Err(Error::Vector(format!(
                            "vector field {} already exists with {} dimensions",
                            field.name, existing.field.dimensions
                        )));
                    }
                    return Ok(());
                }

                let quoted = quote_ident(&column);
                let ddl = format!(
                    "ALTER TABLE {} ADD COLUMN {} BLOB CHECK ({} IS NULL OR length({}) = {})",
                    quote_ident(&table),
                    quoted,
                    quoted,
                    quoted,
                    field.dimensions * 4
                );
                tracing::info!("adding vector column: {}", ddl);
                sp.execute_batch(&ddl)?;
                sp.execute(
                    &format!(
                        "INSERT INTO {} (collection, field, column_name, spec) VALUES (?1, ?2, ?3, ?4)",
                        VECTOR_META_TABLE
                    ),
                    params![collection, field.name, column, serde_json::to_string(&field)?],
                )?;
                sp.commit()?;
                Ok(())
            })
            .await
    }

    /// Vector fields declared on this collection.
    pub async fn vector_fields(&self) -> Result<Vec<VectorField>> {
        let collection = self.name.clone();
        self.session
            .run("vector_fields", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT spec FROM {} WHERE collection = ?1 ORDER BY field",
                    VECTOR_META_TABLE
                ))?;
                let specs = stmt
                    .query_map(params![collection], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                specs
                    .iter()
                    .map(|s| serde_json::from_str(s).map_err(Error::from))
                    .collect()
            })
            .await
    }

    /// Store `vector` on the document with identity `id`.
    pub async fn set_vector(&self, id: &DocId, field: &str, vector: &[f32]) -> Result<()> {
        let table = self.table()?;
        let collection = self.name.clone();
        let field = field.to_string();
        let id = id.to_hex();
        let vector = vector.to_vec();

        self.session
            .run("set_vector", move |conn| {
                let stored = require_field(conn, &collection, &field)?;
                stored.field.check(&vector)?;
                let n = conn.execute(
                    &format!(
                        "UPDATE {} SET {} = ?1, _updated_at = ?2, _version = _version + 1 \
                         WHERE json_extract(data, '$.\"{}\"') = ?3 AND _deleted_at IS NULL",
                        quote_ident(&table),
                        quote_ident(&stored.column),
                        ID_FIELD
                    ),
                    params![encode_vector(&vector), format_timestamp(&Utc::now()), id],
                )?;
                if n == 0 {
                    return Err(Error::NoDocuments);
                }
                Ok(())
            })
            .await
    }

    /// Read back a stored vector; `None` when the document has none.
    pub async fn get_vector(&self, id: &DocId, field: &str) -> Result<Option<Vec<f32>>> {
        let table = self.table()?;
        let collection = self.name.clone();
        let field = field.to_string();
        let id = id.to_hex();

        self.session
            .run("get_vector", move |conn| {
                let stored = require_field(conn, &collection, &field)?;
                let blob: Option<Option<Vec<u8>>> = conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM {} WHERE json_extract(data, '$.\"{}\"') = ?1 AND _deleted_at IS NULL",
                            quote_ident(&stored.column),
                            quote_ident(&table),
                            ID_FIELD
                        ),
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match blob {
                    None => Err(Error::NoDocuments),
                    Some(None) => Ok(None),
                    Some(Some(bytes)) => decode_vector(&bytes).map(Some),
                }
            })
            .await
    }

    /// Build an ivfflat or HNSW index over `field` and record its definition.
    ///
    /// The definition is persisted; the structure itself lives in memory and
    /// is rebuilt from the column after writes.
    pub async fn create_vector_index(&self, field: &str) -> Result<VectorIndexInfo> {
        let table = self.table()?;
        let collection = self.name.clone();
        let field = field.to_string();
        let registry = self.ann.clone();

        self.session
            .run("create_vector_index", move |conn| {
                let mut stored = require_field(conn, &collection, &field)?;
                let method = stored.field.index.method();
                let name = format!("{}_{}_{}_idx", table, field, method);
                let info = VectorIndexInfo {
                    field: field.clone(),
                    name: name.clone(),
                    index: stored.field.index,
                    metric: stored.field.metric,
                    operator_class: stored.field.metric.operator_class().to_string(),
                    definition: format!(
                        "CREATE INDEX IF NOT EXISTS {} ON {} USING {} ({} {}) WITH ({})",
                        quote_ident(&name),
                        quote_ident(&table),
                        method,
                        quote_ident(&stored.column),
                        stored.field.metric.operator_class(),
                        stored.field.index.parameters()
                    ),
                };
                if stored.index.as_ref() != Some(&info) {
                    conn.execute(
                        &format!(
                            "UPDATE {} SET index_spec = ?1 WHERE collection = ?2 AND field = ?3",
                            VECTOR_META_TABLE
                        ),
                        params![serde_json::to_string(&info)?, collection, field],
                    )?;
                    tracing::info!("recorded vector index: {}", info.definition);
                }
                stored.index = Some(info.clone());
                if let Some(index) = ann_index(conn, &registry, &table, &stored)? {
                    tracing::info!("built {} index {} over {} vectors", method, name, index.len());
                }
                Ok(info)
            })
            .await
    }

    /// Remove the ANN index definition; returns whether one existed.
    pub async fn drop_vector_index(&self, field: &str) -> Result<bool> {
        let table = self.table()?;
        let collection = self.name.clone();
        let field = field.to_string();
        let registry = self.ann.clone();
        self.session
            .run("drop_vector_index", move |conn| {
                let stored = require_field(conn, &collection, &field)?;
                if stored.index.is_none() {
                    return Ok(false);
                }
                registry.evict(&table, &stored.column);
                conn.execute(
                    &format!(
                        "UPDATE {} SET index_spec = NULL WHERE collection = ?1 AND field = ?2",
                        VECTOR_META_TABLE
                    ),
                    params![collection, field],
                )?;
                Ok(true)
            })
            .await
    }

    pub async fn vector_index(&self, field: &str) -> Result<Option<VectorIndexInfo>> {
        let collection = self.name.clone();
        let field = field.to_string();
        self.session
            .run("vector_index", move |conn| {
                Ok(require_field(conn, &collection, &field)?.index)
            })
            .await
    }

    /// Nearest neighbours of `vector` by the field's metric, closest first.
    ///
    /// With an index on the field, candidates come from the index and are
    /// re-ranked exactly; the candidate set widens until `limit` rows pass
    /// the filter or the index is exhausted.
    pub async fn vector_search(
        &self,
        field: &str,
        vector: &[f32],
        limit: usize,
        filter: &Filter,
    ) -> Result<Vec<VectorHit>> {
        let table = self.table()?;
        let predicate = translate_filter(filter)?;
        let collection = self.name.clone();
        let field = field.to_string();
        let vector = vector.to_vec();
        let registry = self.ann.clone();

        self.session
            .run("vector_search", move |conn| {
                let stored = require_field(conn, &collection, &field)?;
                stored.field.check(&vector)?;
                let Some(index) = ann_index(conn, &registry, &table, &stored)? else {
                    return nearest(conn, &table, &stored, &predicate, &vector, limit, None);
                };

                let mut k = limit;
                loop {
                    let candidates: Vec<RowId> =
                        index.search(&vector, k).into_iter().map(|(id, _)| id).collect();
                    let hits = nearest(
                        conn,
                        &table,
                        &stored,
                        &predicate,
                        &vector,
                        limit,
                        Some(candidates.as_slice()),
                    )?;
                    if hits.len() >= limit || k >= index.len() {
                        return Ok(hits);
                    }
                    k = k.saturating_mul(2).max(1);
                }
            })
            .await
    }

    /// Blend text rank and vector similarity.
    ///
    /// Each side keeps its best candidates; text ranks are scaled by their
    /// maximum and distances min-max scaled into similarities. A document
    /// found by only one side scores zero on the other.
    pub async fn hybrid_search(&self, query: &HybridQuery) -> Result<Vec<HybridHit>> {
        query.validate()?;
        let table = self.table()?;
        let predicate = translate_filter(&query.filter)?;
        let text_path = path_literal(&query.text_field)?;
        let collection = self.name.clone();
        let query = query.clone();
        let registry = self.ann.clone();

        self.session
            .run("hybrid_search", move |conn| {
                let stored = require_field(conn, &collection, &query.vector_field)?;
                stored.field.check(&query.vector)?;
                let quoted = quote_ident(&table);
                let column = quote_ident(&stored.column);
                let candidates = query.limit.saturating_mul(HYBRID_CANDIDATE_FACTOR).max(1);

                // Filtered searches scan exactly so the filter cannot starve
                // the index candidates.
                let indexed: Option<Vec<RowId>> = if query.filter.is_all() {
                    ann_index(conn, &registry, &table, &stored)?.map(|index| {
                        index
                            .search(&query.vector, candidates)
                            .into_iter()
                            .map(|(id, _)| id)
                            .collect()
                    })
                } else {
                    None
                };

                let sql = format!(
                    r#"
                    WITH text_hits AS (
                        SELECT _id, relevance FROM (
                            SELECT _id, rowid AS rid,
                                   text_rank(CASE WHEN json_type(data, {path}) = 'text'
                                                  THEN json_extract(data, {path}) END, ?) AS relevance
                            FROM {table}
                            WHERE ({pred}) AND _deleted_at IS NULL
                        )
                        WHERE relevance > 0
                        ORDER BY relevance DESC, rid ASC
                        LIMIT ?
                    ),
                    vector_hits AS (
                        SELECT _id, {distance}({column}, ?) AS distance
                        FROM {table}
                        WHERE ({pred}) AND _deleted_at IS NULL AND {column} IS NOT NULL{restrict}
                        ORDER BY distance ASC, rowid ASC
                        LIMIT ?
                    ),
                    text_norm AS (
                        SELECT _id, relevance / (SELECT MAX(relevance) FROM text_hits) AS score
                        FROM text_hits
                    ),
                    vector_bounds AS (
                        SELECT MIN(distance) AS lo, MAX(distance) AS hi FROM vector_hits
                    ),
                    vector_norm AS (
                        SELECT v._id,
                               CASE WHEN b.hi = b.lo THEN 1.0
                                    ELSE (b.hi - v.distance) / (b.hi - b.lo) END AS score
                        FROM vector_hits v, vector_bounds b
                    ),
                    combined AS (
                        SELECT COALESCE(t._id, v._id) AS _id,
                               COALESCE(t.score, 0.0) AS text_score,
                               COALESCE(v.score, 0.0) AS vector_score
                        FROM text_norm t
                        FULL OUTER JOIN vector_norm v ON t._id = v._id
                    )
                    SELECT {columns}, c.text_score, c.vector_score,
                           (1.0 - ?) * c.text_score + ? * c.vector_score AS score
                    FROM combined c
                    JOIN {table} d ON d._id = c._id
                    ORDER BY score DESC, d.rowid ASC
                    LIMIT ?
                    "#,
                    path = text_path,
                    table = quoted,
                    pred = predicate.sql,
                    distance = stored.field.metric.sql_function(),
                    column = column,
                    columns = record_columns(Some("d")),
                    restrict = if indexed.is_some() {
                        " AND rowid IN (SELECT value FROM json_each(?))"
                    } else {
                        ""
                    },
                );
                tracing::debug!(sql = %sql, "hybrid search");

                let mut bound = vec![SqlValue::Text(query.text.clone())];
                bound.extend(predicate.params.iter().cloned());
                bound.push(SqlValue::Integer(sql_limit(candidates)));
                bound.push(SqlValue::Blob(encode_vector(&query.vector)));
                bound.extend(predicate.params.iter().cloned());
                if let Some(ids) = &indexed {
                    bound.push(SqlValue::Text(serde_json::to_string(ids)?));
                }
                bound.push(SqlValue::Integer(sql_limit(candidates)));
                bound.push(SqlValue::Real(query.alpha));
                bound.push(SqlValue::Real(query.alpha));
                bound.push(SqlValue::Integer(sql_limit(query.limit)));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(bound.iter()), |row| {
                        Ok((
                            read_row(row)?,
                            row.get::<_, f64>(8)?,
                            row.get::<_, f64>(9)?,
                            row.get::<_, f64>(10)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .map(|(parts, text_score, vector_score, score)| {
                        Ok(HybridHit {
                            record: decode_row(parts)?,
                            text_score,
                            vector_score,
                            score,
                        })
                    })
                    .collect()
            })
            .await
    }
}
