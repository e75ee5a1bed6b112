use accountdb_common::{Error, Result};
use rusqlite::{Connection, Params, params};
use serde::{Deserialize, Serialize};

/// A column as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

/// An index as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub partial: bool,
    /// `CREATE INDEX` text; `None` for indexes the engine creates implicitly.
    pub definition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStatus {
    pub name: String,
    pub rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub engine_version: String,
    pub tables: Vec<TableStatus>,
}

/// Quote an identifier for interpolation into SQL text.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    conn.query_row(
        "SELECT count(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )
    .map_err(|e| Error::Database(format!("failed to check table {table}: {e}")))
}

pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    conn.query_row(
        "SELECT count(*) > 0 FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get(0),
    )
    .map_err(|e| Error::Database(format!("failed to check column {table}.{column}: {e}")))
}

pub fn index_exists(conn: &Connection, name: &str) -> Result<bool> {
    conn.query_row(
        "SELECT count(*) > 0 FROM sqlite_master WHERE type = 'index' AND name = ?1",
        params![name],
        |row| row.get(0),
    )
    .map_err(|e| Error::Database(format!("failed to check index {name}: {e}")))
}

/// All columns of `table` in declaration order.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn
        .prepare(
            "SELECT name, type, \"notnull\", dflt_value
             FROM pragma_table_info(?1)
             ORDER BY cid",
        )
        .map_err(|e| Error::Database(format!("failed to prepare column query: {e}")))?;

    let rows = stmt
        .query_map(params![table], |row| {
            Ok(ColumnInfo {
                name: row.get(0)?,
                declared_type: row.get(1)?,
                nullable: !row.get::<_, bool>(2)?,
                default: row.get(3)?,
            })
        })
        .map_err(|e| Error::Database(format!("failed to query columns of {table}: {e}")))?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Database(format!("failed to read column row: {e}")))
}

/// All indexes on `table`, sorted by name, including implicit ones.
pub fn table_indexes(conn: &Connection, table: &str) -> Result<Vec<IndexInfo>> {
    let mut stmt = conn
        .prepare(
            "SELECT il.name, il.\"unique\", il.partial, m.sql
             FROM pragma_index_list(?1) AS il
             LEFT JOIN sqlite_master AS m ON m.type = 'index' AND m.name = il.name
             ORDER BY il.name",
        )
        .map_err(|e| Error::Database(format!("failed to prepare index query: {e}")))?;

    let rows = stmt
        .query_map(params![table], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, bool>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })
        .map_err(|e| Error::Database(format!("failed to query indexes of {table}: {e}")))?;

    let mut indexes = Vec::new();
    for row in rows {
        let (name, unique, partial, definition) =
            row.map_err(|e| Error::Database(format!("failed to read index row: {e}")))?;
        let columns = index_columns(conn, &name)?;
        indexes.push(IndexInfo {
            name,
            table: table.to_string(),
            columns,
            unique,
            partial,
            definition,
        });
    }
    Ok(indexes)
}

fn index_columns(conn: &Connection, index: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
        .map_err(|e| Error::Database(format!("failed to prepare index column query: {e}")))?;

    let rows = stmt
        .query_map(params![index], |row| row.get::<_, Option<String>>(0))
        .map_err(|e| Error::Database(format!("failed to query columns of {index}: {e}")))?;

    let mut columns = Vec::new();
    for row in rows {
        // Expression columns have no name.
        let name = row.map_err(|e| Error::Database(format!("failed to read index column: {e}")))?;
        columns.push(name.unwrap_or_else(|| "<expr>".to_string()));
    }
    Ok(columns)
}

/// Application tables sorted by name. Engine-internal tables and the
/// migration ledger are excluded.
pub fn list_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name <> '_migrations'
             ORDER BY name",
        )
        .map_err(|e| Error::Database(format!("failed to prepare table query: {e}")))?;

    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| Error::Database(format!("failed to list tables: {e}")))?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Database(format!("failed to read table row: {e}")))
}

/// Liveness check plus per-table row counts.
pub fn health(conn: &Connection) -> Result<HealthReport> {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .map_err(|e| Error::Database(format!("health probe failed: {e}")))?;

    let engine_version: String = conn
        .query_row("SELECT sqlite_version()", [], |row| row.get(0))
        .map_err(|e| Error::Database(format!("failed to read engine version: {e}")))?;

    let mut tables = Vec::new();
    for name in list_tables(conn)? {
        let rows: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(&name)),
                [],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to count rows of {name}: {e}")))?;
        tables.push(TableStatus {
            name,
            rows: rows as u64,
        });
    }

    Ok(HealthReport {
        engine_version,
        tables,
    })
}

/// Detail lines of `EXPLAIN QUERY PLAN` for `sql`.
pub fn query_plan<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("EXPLAIN QUERY PLAN {sql}"))
        .map_err(|e| Error::Database(format!("failed to prepare query plan: {e}")))?;

    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(3))
        .map_err(|e| Error::Database(format!("failed to explain query: {e}")))?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Database(format!("failed to read plan row: {e}")))
}
