use std::fmt;

use accountdb_common::{Error, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::email_verification;
use crate::inspect::{self, quote_ident};

/// Every migration this crate knows about, in version order.
pub const MIGRATIONS: &[Migration] = &[email_verification::MIGRATION];

const LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL
)";

/// A versioned schema change with an explicit reversal.
///
/// `up` and `down` are ordered lists of existence-guarded steps, so either
/// direction can be re-run against a schema that is already partly there.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub up: &'static [Step],
    pub down: &'static [Step],
}

/// A single guarded schema alteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
    CreateIndex {
        name: &'static str,
        table: &'static str,
        columns: &'static [&'static str],
        predicate: Option<&'static str>,
    },
    DropIndex {
        name: &'static str,
    },
    DropColumn {
        table: &'static str,
        column: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Applied,
    AlreadyPresent,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: String,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

/// What happened to one migration during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRun {
    pub version: u32,
    pub name: String,
    pub direction: Direction,
    pub steps: Vec<StepReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub version: u32,
    pub name: String,
    pub applied_at: Option<String>,
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::AddColumn { table, column, .. } => write!(f, "add column {table}.{column}"),
            Step::CreateIndex { name, table, .. } => write!(f, "create index {name} on {table}"),
            Step::DropIndex { name } => write!(f, "drop index {name}"),
            Step::DropColumn { table, column } => write!(f, "drop column {table}.{column}"),
        }
    }
}

impl Step {
    /// The statement this step executes when its guard lets it through.
    pub fn sql(&self) -> String {
        match self {
            Step::AddColumn {
                table,
                column,
                definition,
            } => format!(
                "ALTER TABLE {} ADD COLUMN {} {definition}",
                quote_ident(table),
                quote_ident(column)
            ),
            Step::CreateIndex {
                name,
                table,
                columns,
                predicate,
            } => {
                let cols = columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut sql = format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {}({cols})",
                    quote_ident(name),
                    quote_ident(table)
                );
                if let Some(predicate) = predicate {
                    sql.push_str(" WHERE ");
                    sql.push_str(predicate);
                }
                sql
            }
            Step::DropIndex { name } => format!("DROP INDEX IF EXISTS {}", quote_ident(name)),
            Step::DropColumn { table, column } => format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(table),
                quote_ident(column)
            ),
        }
    }

    /// Check the catalog, then run the statement if needed. A duplicate-object
    /// error from the engine counts as `AlreadyPresent`: another runner won the
    /// race between our check and our create.
    pub fn apply(&self, conn: &Connection) -> Result<StepOutcome> {
        let present = match self {
            Step::AddColumn { table, column, .. } | Step::DropColumn { table, column } => {
                inspect::column_exists(conn, table, column)?
            }
            Step::CreateIndex { name, .. } | Step::DropIndex { name } => {
                inspect::index_exists(conn, name)?
            }
        };

        let creates = matches!(self, Step::AddColumn { .. } | Step::CreateIndex { .. });
        if creates && present {
            debug!("{self}: already present");
            return Ok(StepOutcome::AlreadyPresent);
        }
        if !creates && !present {
            debug!("{self}: already absent");
            return Ok(StepOutcome::Absent);
        }

        match conn.execute_batch(&self.sql()) {
            Ok(()) => {
                info!("{self}: applied");
                Ok(StepOutcome::Applied)
            }
            Err(e) if creates && is_duplicate_object(&e) => {
                warn!("{self}: tolerated concurrent creation ({e})");
                Ok(StepOutcome::AlreadyPresent)
            }
            Err(e) => Err(Error::Migration(format!("{self} failed: {e}"))),
        }
    }
}

/// True for the engine errors that mean "this object is already there".
pub fn is_duplicate_object(err: &rusqlite::Error) -> bool {
    is_duplicate_object_message(&err.to_string())
}

pub(crate) fn is_duplicate_object_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("already exists") || msg.contains("duplicate column name")
}

/// Begin a transaction that takes the write lock up front, so existence
/// checks and the statements they guard see the same schema.
pub(crate) fn begin_immediate(conn: &Connection) -> Result<Transaction<'_>> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))
}

/// Run `steps` in order inside one transaction.
pub fn apply_steps(conn: &Connection, steps: &[Step]) -> Result<Vec<StepReport>> {
    let tx = begin_immediate(conn)?;
    let reports = run_steps(&tx, steps)?;
    tx.commit()
        .map_err(|e| Error::Database(format!("failed to commit steps: {e}")))?;
    Ok(reports)
}

fn run_steps(conn: &Connection, steps: &[Step]) -> Result<Vec<StepReport>> {
    steps
        .iter()
        .map(|step| {
            step.apply(conn).map(|outcome| StepReport {
                step: step.to_string(),
                outcome,
            })
        })
        .collect()
}

/// Applies and reverts registered migrations, recording them in `_migrations`.
pub struct Migrator<'a> {
    migrations: &'a [Migration],
}

impl Default for Migrator<'static> {
    fn default() -> Self {
        Self::new(MIGRATIONS)
    }
}

impl<'a> Migrator<'a> {
    pub fn new(migrations: &'a [Migration]) -> Self {
        Self { migrations }
    }

    pub fn migrations(&self) -> &'a [Migration] {
        self.migrations
    }

    fn validate(&self) -> Result<()> {
        for pair in self.migrations.windows(2) {
            if pair[1].version <= pair[0].version {
                return Err(Error::Migration(format!(
                    "migration versions out of order: {} ({}) follows {} ({})",
                    pair[1].version, pair[1].name, pair[0].version, pair[0].name
                )));
            }
        }
        Ok(())
    }

    fn ensure_ledger(conn: &Connection) -> Result<()> {
        let tx = begin_immediate(conn)?;
        tx.execute_batch(LEDGER_DDL)
            .map_err(|e| Error::Database(format!("failed to create migration ledger: {e}")))?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit migration ledger: {e}")))
    }

    fn applied_at(conn: &Connection, version: u32) -> Result<Option<String>> {
        conn.query_row(
            "SELECT applied_at FROM _migrations WHERE version = ?1",
            params![version],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to query ledger: {e}")))
    }

    /// Applied/pending state of every registered migration.
    pub fn status(&self, conn: &Connection) -> Result<Vec<MigrationStatus>> {
        Self::ensure_ledger(conn)?;
        self.migrations
            .iter()
            .map(|m| {
                Ok(MigrationStatus {
                    version: m.version,
                    name: m.name.to_string(),
                    applied_at: Self::applied_at(conn, m.version)?,
                })
            })
            .collect()
    }

    /// Apply every migration not yet recorded. Each migration's steps and its
    /// ledger entry commit together. Returns only the migrations that ran.
    pub fn run_pending(&self, conn: &Connection) -> Result<Vec<MigrationRun>> {
        self.validate()?;
        Self::ensure_ledger(conn)?;

        let mut runs = Vec::new();
        for migration in self.migrations {
            // Checked under the write lock: a concurrent runner may have
            // recorded it while we waited.
            let tx = begin_immediate(conn)?;
            if Self::applied_at(&tx, migration.version)?.is_some() {
                debug!(
                    "migration {} ({}) already recorded",
                    migration.version, migration.name
                );
                continue;
            }

            info!(
                "applying migration {} ({})",
                migration.version, migration.name
            );
            let steps = run_steps(&tx, migration.up)?;
            tx.execute(
                "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![migration.version, migration.name, Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::Database(format!("failed to record migration: {e}")))?;
            tx.commit().map_err(|e| {
                Error::Database(format!(
                    "failed to commit migration {}: {e}",
                    migration.version
                ))
            })?;

            runs.push(MigrationRun {
                version: migration.version,
                name: migration.name.to_string(),
                direction: Direction::Up,
                steps,
            });
        }

        if runs.is_empty() {
            info!("schema is up to date");
        }
        Ok(runs)
    }

    /// Run the `down` steps of `version` and drop its ledger entry.
    ///
    /// Destructive: the columns it removes take their data with them. Refuses
    /// when `version` is not recorded or while a later migration still is.
    pub fn revert(&self, conn: &Connection, version: u32) -> Result<MigrationRun> {
        Self::ensure_ledger(conn)?;

        let migration = self
            .migrations
            .iter()
            .find(|m| m.version == version)
            .ok_or_else(|| Error::NotFound(format!("migration version {version}")))?;

        let tx = begin_immediate(conn)?;
        if Self::applied_at(&tx, version)?.is_none() {
            return Err(Error::Migration(format!(
                "migration {version} ({}) is not applied",
                migration.name
            )));
        }
        for later in self.migrations.iter().filter(|m| m.version > version) {
            if Self::applied_at(&tx, later.version)?.is_some() {
                return Err(Error::Migration(format!(
                    "cannot revert {version} while {} ({}) is applied",
                    later.version, later.name
                )));
            }
        }

        warn!(
            "reverting migration {} ({})",
            migration.version, migration.name
        );
        let steps = run_steps(&tx, migration.down)?;
        tx.execute(
            "DELETE FROM _migrations WHERE version = ?1",
            params![migration.version],
        )
        .map_err(|e| Error::Database(format!("failed to update ledger: {e}")))?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit revert: {e}")))?;

        Ok(MigrationRun {
            version: migration.version,
            name: migration.name.to_string(),
            direction: Direction::Down,
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDGET_UP: &[Step] = &[
        Step::AddColumn {
            table: "widgets",
            column: "colour",
            definition: "TEXT DEFAULT 'red'",
        },
        Step::CreateIndex {
            name: "idx_widgets_colour",
            table: "widgets",
            columns: &["colour"],
            predicate: Some("colour IS NOT NULL"),
        },
    ];

    const WIDGET_DOWN: &[Step] = &[
        Step::DropIndex {
            name: "idx_widgets_colour",
        },
        Step::DropColumn {
            table: "widgets",
            column: "colour",
        },
    ];

    const WIDGETS: &[Migration] = &[Migration {
        version: 7,
        name: "widget_colour",
        up: WIDGET_UP,
        down: WIDGET_DOWN,
    }];

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE widgets (id INTEGER PRIMARY KEY, label TEXT);")
            .unwrap();
        conn
    }

    #[test]
    fn renders_guarded_sql() {
        assert_eq!(
            WIDGET_UP[0].sql(),
            "ALTER TABLE \"widgets\" ADD COLUMN \"colour\" TEXT DEFAULT 'red'"
        );
        assert_eq!(
            WIDGET_UP[1].sql(),
            "CREATE INDEX IF NOT EXISTS \"idx_widgets_colour\" ON \"widgets\"(\"colour\") \
             WHERE colour IS NOT NULL"
        );
        assert_eq!(
            WIDGET_DOWN[0].sql(),
            "DROP INDEX IF EXISTS \"idx_widgets_colour\""
        );
    }

    #[test]
    fn steps_are_idempotent() {
        let conn = conn();
        let first = apply_steps(&conn, WIDGET_UP).unwrap();
        assert!(first.iter().all(|r| r.outcome == StepOutcome::Applied));

        let second = apply_steps(&conn, WIDGET_UP).unwrap();
        assert!(second.iter().all(|r| r.outcome == StepOutcome::AlreadyPresent));
        assert_eq!(second[0].step, "add column widgets.colour");
    }

    #[test]
    fn down_steps_report_absent_when_nothing_to_drop() {
        let conn = conn();
        let reports = apply_steps(&conn, WIDGET_DOWN).unwrap();
        assert!(reports.iter().all(|r| r.outcome == StepOutcome::Absent));
    }

    #[test]
    fn duplicate_object_errors_are_recognised() {
        assert!(is_duplicate_object_message("duplicate column name: colour"));
        assert!(is_duplicate_object_message("index idx_x already exists"));
        assert!(is_duplicate_object_message("Table \"t\" Already Exists"));
        assert!(!is_duplicate_object_message("no such table: widgets"));
        assert!(!is_duplicate_object_message("UNIQUE constraint failed: users.email"));

        let conn = conn();
        conn.execute_batch("ALTER TABLE widgets ADD COLUMN colour TEXT")
            .unwrap();
        let err = conn
            .execute_batch("ALTER TABLE widgets ADD COLUMN colour TEXT")
            .unwrap_err();
        assert!(is_duplicate_object(&err));
    }

    #[test]
    fn failing_step_surfaces_migration_error() {
        let conn = conn();
        let step = Step::AddColumn {
            table: "missing_table",
            column: "x",
            definition: "TEXT",
        };
        let err = step.apply(&conn).unwrap_err();
        assert!(matches!(err, Error::Migration(_)));
        assert!(err.to_string().contains("add column missing_table.x failed"));
    }

    #[test]
    fn run_pending_records_and_skips() {
        let conn = conn();
        let migrator = Migrator::new(WIDGETS);

        let runs = migrator.run_pending(&conn).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].version, 7);
        assert_eq!(runs[0].direction, Direction::Up);

        let status = migrator.status(&conn).unwrap();
        assert!(status[0].is_applied());

        assert!(migrator.run_pending(&conn).unwrap().is_empty());
    }

    #[test]
    fn revert_clears_ledger_and_schema() {
        let conn = conn();
        let migrator = Migrator::new(WIDGETS);
        migrator.run_pending(&conn).unwrap();

        let run = migrator.revert(&conn, 7).unwrap();
        assert_eq!(run.direction, Direction::Down);
        assert!(run.steps.iter().all(|s| s.outcome == StepOutcome::Applied));
        assert!(!inspect::column_exists(&conn, "widgets", "colour").unwrap());
        assert!(!migrator.status(&conn).unwrap()[0].is_applied());
    }

    #[test]
    fn revert_unknown_version_is_not_found() {
        let conn = conn();
        let err = Migrator::new(WIDGETS).revert(&conn, 99).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn revert_refuses_while_later_migration_applied() {
        const TWO: &[Migration] = &[
            Migration {
                version: 1,
                name: "first",
                up: &[],
                down: &[],
            },
            Migration {
                version: 2,
                name: "second",
                up: &[],
                down: &[],
            },
        ];
        let conn = conn();
        let migrator = Migrator::new(TWO);
        migrator.run_pending(&conn).unwrap();

        let err = migrator.revert(&conn, 1).unwrap_err();
        assert!(err.to_string().contains("while 2 (second) is applied"));

        migrator.revert(&conn, 2).unwrap();
        migrator.revert(&conn, 1).unwrap();
    }

    #[test]
    fn revert_of_unrecorded_migration_leaves_schema() {
        let conn = conn();
        let migrator = Migrator::new(WIDGETS);
        apply_steps(&conn, WIDGET_UP).unwrap();

        let err = migrator.revert(&conn, 7).unwrap_err();
        assert!(err.to_string().contains("migration 7 (widget_colour) is not applied"));
        assert!(inspect::column_exists(&conn, "widgets", "colour").unwrap());
        assert!(inspect::index_exists(&conn, "idx_widgets_colour").unwrap());

        // The refused revert must not leave a transaction open.
        migrator.run_pending(&conn).unwrap();
        migrator.revert(&conn, 7).unwrap();
    }

    #[test]
    fn out_of_order_versions_are_rejected() {
        const BAD: &[Migration] = &[
            Migration {
                version: 3,
                name: "later",
                up: &[],
                down: &[],
            },
            Migration {
                version: 2,
                name: "earlier",
                up: &[],
                down: &[],
            },
        ];
        let conn = conn();
        let err = Migrator::new(BAD).run_pending(&conn).unwrap_err();
        assert!(err.to_string().contains("out of order"));
    }

    #[test]
    fn failed_migration_is_not_recorded() {
        const BROKEN: &[Migration] = &[Migration {
            version: 1,
            name: "broken",
            up: &[
                Step::AddColumn {
                    table: "widgets",
                    column: "size",
                    definition: "INTEGER",
                },
                Step::AddColumn {
                    table: "nowhere",
                    column: "size",
                    definition: "INTEGER",
                },
            ],
            down: &[],
        }];
        let conn = conn();
        let migrator = Migrator::new(BROKEN);
        assert!(migrator.run_pending(&conn).is_err());

        assert!(!migrator.status(&conn).unwrap()[0].is_applied());
        // The transaction rolled back the first column as well.
        assert!(!inspect::column_exists(&conn, "widgets", "size").unwrap());
    }
}
