//! Physical layout of the SQLite backend.

use crate::error::{Error, Result};
use crate::json::{split_path, validate_field};
use rusqlite::{params, Connection, OptionalExtension};

/// Prefix of every collection table.
pub(crate) const TABLE_PREFIX: &str = "docs_";
pub(crate) const INDEX_META_TABLE: &str = "_docbridge_indexes";
pub(crate) const VECTOR_META_TABLE: &str = "_docbridge_vector_fields";

/// Columns read for every record, in decode order.
pub(crate) const RECORD_COLUMNS: &[&str] = &[
    "_id",
    "data",
    "_created_by",
    "_updated_by",
    "_created_at",
    "_updated_at",
    "_version",
    "_deleted_at",
];

/// Comma-separated record columns, optionally qualified by a table alias.
pub(crate) fn record_columns(alias: Option<&str>) -> String {
    RECORD_COLUMNS
        .iter()
        .map(|c| match alias {
            Some(a) => format!("{}.{}", a, c),
            None => c.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reject collection names that cannot be embedded in an identifier.
pub(crate) fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(Error::InvalidName(format!(
            "collection name must be 1-64 characters: {:?}",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::InvalidName(format!(
            "collection name may only contain letters, digits, '_' and '-': {:?}",
            name
        )));
    }
    Ok(())
}

/// Physical table of a logical collection.
pub(crate) fn table_name(collection: &str) -> Result<String> {
    validate_collection_name(collection)?;
    Ok(format!("{}{}", TABLE_PREFIX, collection))
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// SQL string literal of the JSON path of a dotted field: `'$."a"."b"'`.
pub(crate) fn path_literal(field: &str) -> Result<String> {
    validate_field(field)?;
    Ok(path_literal_unchecked(&split_path(field)))
}

pub(crate) fn path_literal_unchecked(segments: &[&str]) -> String {
    let mut path = String::from("$");
    for segment in segments {
        path.push_str(".\"");
        path.push_str(segment);
        path.push('"');
    }
    format!("'{}'", path.replace('\'', "''"))
}

/// Create the metadata tables.
pub(crate) fn init_metadata(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {index_meta} (
            collection      TEXT NOT NULL,
            name            TEXT NOT NULL,
            physical_name   TEXT NOT NULL,
            spec            TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            PRIMARY KEY (collection, name)
        );

        CREATE TABLE IF NOT EXISTS {vector_meta} (
            collection      TEXT NOT NULL,
            field           TEXT NOT NULL,
            column_name     TEXT NOT NULL,
            spec            TEXT NOT NULL,
            index_spec      TEXT,
            PRIMARY KEY (collection, field)
        );
        "#,
        index_meta = INDEX_META_TABLE,
        vector_meta = VECTOR_META_TABLE,
    ))?;
    Ok(())
}

/// Create a collection table and its identity index if missing.
pub(crate) fn ensure_table(conn: &Connection, table: &str) -> Result<()> {
    let quoted = quote_ident(table);
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {quoted} (
            _id             TEXT PRIMARY KEY,
            data            TEXT NOT NULL CHECK (json_valid(data)),
            _created_by     TEXT,
            _updated_by     TEXT,
            _created_at     TEXT NOT NULL,
            _updated_at     TEXT NOT NULL,
            _version        INTEGER NOT NULL DEFAULT 1,
            _deleted_at     TEXT
        );

        CREATE UNIQUE INDEX IF NOT EXISTS {id_index} ON {quoted} (json_extract(data, '$."_id"'));
        CREATE INDEX IF NOT EXISTS {deleted_index} ON {quoted} (_deleted_at);
        "#,
        quoted = quoted,
        id_index = quote_ident(&format!("{}___id_", table)),
        deleted_index = quote_ident(&format!("{}___deleted", table)),
    ))?;
    Ok(())
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Logical names of every collection table.
pub(crate) fn list_collections(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'docs\\_%' ESCAPE '\\' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names
        .into_iter()
        .filter_map(|n| n.strip_prefix(TABLE_PREFIX).map(str::to_string))
        .collect())
}

/// Drop a collection table with its metadata.
pub(crate) fn drop_collection(conn: &mut Connection, collection: &str) -> Result<bool> {
    let table = table_name(collection)?;
    let tx = conn.savepoint()?;
    let existed = table_exists(&tx, &table)?;
    tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&table)))?;
    tx.execute(
        &format!("DELETE FROM {} WHERE collection = ?1", INDEX_META_TABLE),
        params![collection],
    )?;
    tx.execute(
        &format!("DELETE FROM {} WHERE collection = ?1", VECTOR_META_TABLE),
        params![collection],
    )?;
    tx.commit()?;
    Ok(existed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_literal() {
        assert_eq!(path_literal("settings.auditing").unwrap(), "'$.\"settings\".\"auditing\"'");
        assert_eq!(path_literal("o'brien").unwrap(), "'$.\"o''brien\"'");
        assert!(path_literal("a..b").is_err());
    }

    #[test]
    fn test_table_name_validation() {
        assert_eq!(table_name("users").unwrap(), "docs_users");
        assert!(table_name("users; DROP").is_err());
        assert!(table_name("").is_err());
    }

    #[test]
    fn test_ensure_and_list() {
        let conn = Connection::open_in_memory().unwrap();
        init_metadata(&conn).unwrap();
        ensure_table(&conn, "docs_users").unwrap();
        ensure_table(&conn, "docs_users").unwrap();
        assert!(table_exists(&conn, "docs_users").unwrap());
        assert_eq!(list_collections(&conn).unwrap(), vec!["users".to_string()]);
    }
}
