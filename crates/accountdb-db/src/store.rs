use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use accountdb_common::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::email_verification::{self, TOKEN_MAX_LEN};
use crate::inspect::{self, ColumnInfo, HealthReport, IndexInfo};
use crate::migrations::{MigrationRun, MigrationStatus, Migrator};
use crate::schema;
use crate::script::{self, ScriptReport};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite takes the busy timeout as a C `int` of milliseconds.
pub const MAX_BUSY_TIMEOUT_MS: u128 = i32::MAX as u128;

/// Lookup statement served by the partial token index.
pub const TOKEN_LOOKUP_SQL: &str = "SELECT id FROM users WHERE verification_token = ?1";

/// A `users` row after the email-verification migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
    pub username: String,
    pub email_verified: bool,
    pub verification_token: Option<String>,
    pub verification_token_expires: Option<DateTime<Utc>>,
}

/// A freshly issued verification token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires: DateTime<Utc>,
}

/// Owns the account database connection. Opening creates the base schema;
/// migrations run only when asked for.
pub struct AccountStore {
    conn: Mutex<Connection>,
}

impl AccountStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::open_with_timeout(db_path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_timeout(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        if busy_timeout.as_millis() > MAX_BUSY_TIMEOUT_MS {
            return Err(Error::Config(format!(
                "busy timeout of {} ms exceeds {MAX_BUSY_TIMEOUT_MS} ms",
                busy_timeout.as_millis()
            )));
        }
        info!("opening account store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.busy_timeout(busy_timeout)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("account store lock poisoned".into()))
    }

    // --- schema management ---

    pub fn migrate(&self) -> Result<Vec<MigrationRun>> {
        let conn = self.connection()?;
        Migrator::default().run_pending(&conn)
    }

    /// Destructive. Callers are expected to have obtained operator consent.
    pub fn revert(&self, version: u32) -> Result<MigrationRun> {
        let conn = self.connection()?;
        Migrator::default().revert(&conn, version)
    }

    pub fn migration_status(&self) -> Result<Vec<MigrationStatus>> {
        let conn = self.connection()?;
        Migrator::default().status(&conn)
    }

    pub fn verify_columns(&self) -> Result<Vec<ColumnInfo>> {
        let conn = self.connection()?;
        email_verification::verify_columns(&conn)
    }

    pub fn verification_indexes(&self) -> Result<Vec<IndexInfo>> {
        let conn = self.connection()?;
        email_verification::verification_indexes(&conn)
    }

    pub fn tables(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        inspect::list_tables(&conn)
    }

    pub fn health(&self) -> Result<HealthReport> {
        let conn = self.connection()?;
        inspect::health(&conn)
    }

    pub fn apply_script(&self, text: &str) -> Result<ScriptReport> {
        let conn = self.connection()?;
        script::apply_script(&conn, text)
    }

    /// Query plan of the token lookup, for confirming the index is used.
    pub fn token_lookup_plan(&self, token: &str) -> Result<Vec<String>> {
        let conn = self.connection()?;
        inspect::query_plan(&conn, TOKEN_LOOKUP_SQL, params![token])
    }

    // --- users ---

    pub fn create_user(&self, email: &str, username: &str, hashed_password: &str) -> Result<i64> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO users (email, username, hashed_password) VALUES (?1, ?2, ?3)",
            params![email, username, hashed_password],
        )
        .map_err(|e| Error::Database(format!("failed to create user: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_user(&self, id: i64) -> Result<Option<UserRecord>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT id, email, username, email_verified, verification_token,
                    verification_token_expires
             FROM users WHERE id = ?1",
            params![id],
            |row| {
                Ok(UserRecord {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    username: row.get(2)?,
                    email_verified: row.get(3)?,
                    verification_token: row.get(4)?,
                    verification_token_expires: expiry_column(row, 5)?,
                })
            },
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load user {id}: {e}")))
    }

    /// Store a new random token for `user_id`, valid for `ttl`. Refuses users
    /// whose email is already verified.
    pub fn issue_verification_token(&self, user_id: i64, ttl: chrono::Duration) -> Result<IssuedToken> {
        if ttl <= chrono::Duration::zero() {
            return Err(Error::Validation(format!(
                "token lifetime must be positive, got {ttl}"
            )));
        }
        let expires = Utc::now()
            .checked_add_signed(ttl)
            .ok_or_else(|| Error::Validation(format!("token lifetime {ttl} is out of range")))?;

        let conn = self.connection()?;
        let verified: Option<bool> = conn
            .query_row(
                "SELECT email_verified FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load user {user_id}: {e}")))?;
        match verified {
            None => return Err(Error::NotFound(format!("user {user_id}"))),
            Some(true) => {
                return Err(Error::Validation(format!(
                    "email of user {user_id} is already verified"
                )));
            }
            Some(false) => {}
        }

        let issued = IssuedToken {
            token: generate_token(),
            expires,
        };
        store_token(&conn, user_id, &issued.token, issued.expires)?;
        Ok(issued)
    }

    pub fn set_verification_token(
        &self,
        user_id: i64,
        token: &str,
        expires: DateTime<Utc>,
    ) -> Result<()> {
        validate_token(token)?;
        let conn = self.connection()?;
        store_token(&conn, user_id, token, expires)
    }

    /// Resolve a token to a user id. When several rows carry the same token
    /// the lowest id wins.
    pub fn find_by_verification_token(&self, token: &str) -> Result<Option<i64>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("{TOKEN_LOOKUP_SQL} ORDER BY id LIMIT 1"),
            params![token],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to look up verification token: {e}")))
    }

    /// Mark the owner of `token` as verified and clear the token. Rejects
    /// unknown tokens and tokens whose expiry lies before `now`.
    pub fn confirm_email(&self, token: &str, now: DateTime<Utc>) -> Result<i64> {
        let conn = self.connection()?;
        let found: Option<(i64, Option<DateTime<Utc>>)> = conn
            .query_row(
                "SELECT id, verification_token_expires FROM users
                 WHERE verification_token = ?1 ORDER BY id LIMIT 1",
                params![token],
                |row| Ok((row.get(0)?, expiry_column(row, 1)?)),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to look up verification token: {e}")))?;

        let (id, expires) = found.ok_or_else(|| Error::NotFound("verification token".into()))?;
        if expires.is_none_or(|at| at < now) {
            return Err(Error::Expired(format!("verification token for user {id}")));
        }

        conn.execute(
            "UPDATE users SET email_verified = 1, verification_token = NULL,
                    verification_token_expires = NULL
             WHERE id = ?1",
            params![id],
        )
        .map_err(|e| Error::Database(format!("failed to confirm email: {e}")))?;

        info!("email verified for user {id}");
        Ok(id)
    }

    /// Ids of users whose email is not yet verified, ascending.
    pub fn unverified_users(&self) -> Result<Vec<i64>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT id FROM users WHERE email_verified = 0 ORDER BY id")
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| Error::Database(format!("failed to query unverified users: {e}")))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to read user row: {e}")))
    }

    /// Run `f` with the underlying connection held.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.connection()?;
        f(&conn)
    }
}

/// 32 random bytes, URL-safe base64 without padding.
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

fn validate_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(Error::Validation("verification token cannot be empty".into()));
    }
    if token.chars().count() > TOKEN_MAX_LEN {
        return Err(Error::Validation(format!(
            "verification token longer than {TOKEN_MAX_LEN} characters"
        )));
    }
    Ok(())
}

fn store_token(conn: &Connection, user_id: i64, token: &str, expires: DateTime<Utc>) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE users SET verification_token = ?1, verification_token_expires = ?2
             WHERE id = ?3",
            params![token, expires.to_rfc3339(), user_id],
        )
        .map_err(|e| Error::Database(format!("failed to store verification token: {e}")))?;
    if updated == 0 {
        return Err(Error::NotFound(format!("user {user_id}")));
    }
    debug!("verification token stored for user {user_id}");
    Ok(())
}

/// Read an RFC 3339 expiry column. Unparseable text is a conversion error.
fn expiry_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}
