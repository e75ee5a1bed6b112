use accountdb_common::{Error, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::migrations::{begin_immediate, is_duplicate_object};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptReport {
    pub executed: usize,
    pub skipped: usize,
}

/// Split SQL text into statements.
///
/// Blank lines and lines starting with `--` are dropped. The remaining lines
/// are trimmed and joined with single spaces; a line ending in `;` closes the
/// statement. Text left over after the last `;` becomes a final statement.
///
/// Splitting is line based: a `;` in the middle of a line does not end a
/// statement, and `--` after code on the same line is kept.
pub fn split_statements(text: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("--") {
            continue;
        }
        current.push(line);
        if line.ends_with(';') {
            statements.push(current.join(" "));
            current.clear();
        }
    }

    if !current.is_empty() {
        statements.push(current.join(" "));
    }
    statements
}

/// Execute every statement of `text` in one transaction. Statements failing
/// with a duplicate-object error are skipped; any other failure rolls the
/// whole script back.
pub fn apply_script(conn: &Connection, text: &str) -> Result<ScriptReport> {
    let statements = split_statements(text);
    let total = statements.len();
    let mut report = ScriptReport::default();

    let tx = begin_immediate(conn)?;

    for (i, statement) in statements.iter().enumerate() {
        let n = i + 1;
        match tx.execute_batch(statement) {
            Ok(()) => {
                info!("statement {n}/{total} executed");
                report.executed += 1;
            }
            Err(e) if is_duplicate_object(&e) => {
                warn!("statement {n}/{total} skipped, object exists: {e}");
                report.skipped += 1;
            }
            Err(e) => {
                return Err(Error::Migration(format!("statement {n}/{total} failed: {e}")));
            }
        }
    }

    tx.commit()
        .map_err(|e| Error::Database(format!("failed to commit script: {e}")))?;
    Ok(report)
}
