//! Email-verification support on `users`.
//!
//! Adds three columns and two partial indexes:
//!
//! | column | declared type | default |
//! |---|---|---|
//! | `email_verified` | `BOOLEAN NOT NULL` | `0` |
//! | `verification_token` | `VARCHAR(255)` | null |
//! | `verification_token_expires` | `TIMESTAMPTZ` | null |
//!
//! `idx_users_verification_token` covers only rows holding a token, and
//! `idx_users_email_verified` covers only unverified rows. The status index
//! assumes verification only ever moves from false to true.
//!
//! The token index is not unique. Token uniqueness is left to whoever
//! issues tokens.

use accountdb_common::Result;
use rusqlite::Connection;

use crate::inspect::{self, ColumnInfo, IndexInfo};
use crate::migrations::{self, Migration, Step, StepReport};

pub const VERSION: u32 = 1;
pub const USERS_TABLE: &str = "users";

pub const EMAIL_VERIFIED: &str = "email_verified";
pub const VERIFICATION_TOKEN: &str = "verification_token";
pub const VERIFICATION_TOKEN_EXPIRES: &str = "verification_token_expires";
pub const VERIFICATION_COLUMNS: [&str; 3] =
    [EMAIL_VERIFIED, VERIFICATION_TOKEN, VERIFICATION_TOKEN_EXPIRES];

pub const TOKEN_INDEX: &str = "idx_users_verification_token";
pub const STATUS_INDEX: &str = "idx_users_email_verified";

/// Substring shared by the names of both indexes this migration creates.
pub const INDEX_MARKER: &str = "verif";

pub const TOKEN_MAX_LEN: usize = 255;

const UP: &[Step] = &[
    Step::AddColumn {
        table: USERS_TABLE,
        column: EMAIL_VERIFIED,
        definition: "BOOLEAN NOT NULL DEFAULT 0",
    },
    Step::AddColumn {
        table: USERS_TABLE,
        column: VERIFICATION_TOKEN,
        definition: "VARCHAR(255)",
    },
    Step::AddColumn {
        table: USERS_TABLE,
        column: VERIFICATION_TOKEN_EXPIRES,
        definition: "TIMESTAMPTZ",
    },
    Step::CreateIndex {
        name: TOKEN_INDEX,
        table: USERS_TABLE,
        columns: &[VERIFICATION_TOKEN],
        predicate: Some("verification_token IS NOT NULL"),
    },
    Step::CreateIndex {
        name: STATUS_INDEX,
        table: USERS_TABLE,
        columns: &[EMAIL_VERIFIED],
        predicate: Some("email_verified = 0"),
    },
];

// Indexes first: the engine will not drop a column an index still refers to.
const DOWN: &[Step] = &[
    Step::DropIndex { name: TOKEN_INDEX },
    Step::DropIndex { name: STATUS_INDEX },
    Step::DropColumn {
        table: USERS_TABLE,
        column: VERIFICATION_TOKEN_EXPIRES,
    },
    Step::DropColumn {
        table: USERS_TABLE,
        column: VERIFICATION_TOKEN,
    },
    Step::DropColumn {
        table: USERS_TABLE,
        column: EMAIL_VERIFIED,
    },
];

pub const MIGRATION: Migration = Migration {
    version: VERSION,
    name: "add_email_verification",
    up: UP,
    down: DOWN,
};

/// Add the columns and indexes, skipping whatever already exists.
/// Does not touch the migration ledger.
pub fn forward(conn: &Connection) -> Result<Vec<StepReport>> {
    migrations::apply_steps(conn, MIGRATION.up)
}

/// Drop both indexes, then the three columns. Verification state is lost.
/// Does not touch the migration ledger.
pub fn revert(conn: &Connection) -> Result<Vec<StepReport>> {
    migrations::apply_steps(conn, MIGRATION.down)
}

/// The verification columns currently on `users`, in declaration order.
pub fn verify_columns(conn: &Connection) -> Result<Vec<ColumnInfo>> {
    Ok(inspect::table_columns(conn, USERS_TABLE)?
        .into_iter()
        .filter(|c| VERIFICATION_COLUMNS.contains(&c.name.as_str()))
        .collect())
}

/// Indexes on `users` whose name carries the verification marker.
pub fn verification_indexes(conn: &Connection) -> Result<Vec<IndexInfo>> {
    Ok(inspect::table_indexes(conn, USERS_TABLE)?
        .into_iter()
        .filter(|i| i.name.contains(INDEX_MARKER))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::StepOutcome;

    fn users() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE);
             INSERT INTO users (id, email) VALUES (1, 'a@b.com');",
        )
        .unwrap();
        conn
    }

    fn schema_snapshot(conn: &Connection) -> Vec<(String, String, Option<String>)> {
        let mut stmt = conn
            .prepare("SELECT type, name, sql FROM sqlite_master ORDER BY type, name")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn forward_reports_every_step_applied() {
        let conn = users();
        let reports = forward(&conn).unwrap();
        assert_eq!(reports.len(), 5);
        assert!(reports.iter().all(|r| r.outcome == StepOutcome::Applied));
    }

    #[test]
    fn forward_twice_matches_forward_once() {
        let conn = users();
        forward(&conn).unwrap();
        let once = schema_snapshot(&conn);

        let reports = forward(&conn).unwrap();
        assert!(reports.iter().all(|r| r.outcome == StepOutcome::AlreadyPresent));
        assert_eq!(schema_snapshot(&conn), once);
    }

    #[test]
    fn verify_columns_describes_the_three_columns() {
        let conn = users();
        assert!(verify_columns(&conn).unwrap().is_empty());

        forward(&conn).unwrap();
        let columns = verify_columns(&conn).unwrap();
        assert_eq!(
            columns,
            vec![
                ColumnInfo {
                    name: EMAIL_VERIFIED.into(),
                    declared_type: "BOOLEAN".into(),
                    nullable: false,
                    default: Some("0".into()),
                },
                ColumnInfo {
                    name: VERIFICATION_TOKEN.into(),
                    declared_type: "VARCHAR(255)".into(),
                    nullable: true,
                    default: None,
                },
                ColumnInfo {
                    name: VERIFICATION_TOKEN_EXPIRES.into(),
                    declared_type: "TIMESTAMPTZ".into(),
                    nullable: true,
                    default: None,
                },
            ]
        );
    }

    #[test]
    fn index_inventory_lists_both_partial_indexes() {
        let conn = users();
        forward(&conn).unwrap();

        let indexes = verification_indexes(&conn).unwrap();
        let names: Vec<_> = indexes.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, [STATUS_INDEX, TOKEN_INDEX]);
        assert!(indexes.iter().all(|i| i.partial && !i.unique));
        assert_eq!(indexes[0].columns, [EMAIL_VERIFIED]);
        assert_eq!(indexes[1].columns, [VERIFICATION_TOKEN]);
    }

    #[test]
    fn partial_application_is_completed() {
        let conn = users();
        // Simulate a run killed after the first column was added.
        conn.execute_batch("ALTER TABLE users ADD COLUMN email_verified BOOLEAN NOT NULL DEFAULT 0")
            .unwrap();

        let reports = forward(&conn).unwrap();
        assert_eq!(reports[0].outcome, StepOutcome::AlreadyPresent);
        assert!(reports[1..].iter().all(|r| r.outcome == StepOutcome::Applied));
        assert_eq!(verify_columns(&conn).unwrap().len(), 3);
        assert_eq!(verification_indexes(&conn).unwrap().len(), 2);
    }

    #[test]
    fn revert_leaves_original_table() {
        let conn = users();
        let before = inspect::table_columns(&conn, USERS_TABLE).unwrap();

        forward(&conn).unwrap();
        revert(&conn).unwrap();

        assert_eq!(inspect::table_columns(&conn, USERS_TABLE).unwrap(), before);
        assert!(verification_indexes(&conn).unwrap().is_empty());
        let email: String = conn
            .query_row("SELECT email FROM users WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(email, "a@b.com");
    }

    #[test]
    fn down_steps_drop_indexes_before_columns() {
        let first_column = DOWN
            .iter()
            .position(|s| matches!(s, Step::DropColumn { .. }))
            .unwrap();
        assert!(DOWN[..first_column]
            .iter()
            .all(|s| matches!(s, Step::DropIndex { .. })));
        assert_eq!(first_column, 2);
    }
}
