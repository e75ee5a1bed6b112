use accountdb_common::{Error, Result};
use rusqlite::Connection;
use tracing::info;

use crate::inspect;

/// Tables the application expects before any migration has run. `users`
/// starts without the email-verification columns; those arrive through
/// [`crate::email_verification::MIGRATION`].
const BASE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    email VARCHAR(255) NOT NULL UNIQUE,
    username VARCHAR(100) NOT NULL UNIQUE,
    phone VARCHAR(20),
    hashed_password VARCHAR(255) NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    is_active BOOLEAN NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS quiz_sessions (
    id INTEGER PRIMARY KEY,
    session_id VARCHAR(255) NOT NULL UNIQUE,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    completed BOOLEAN NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS quiz_answers (
    id INTEGER PRIMARY KEY,
    session_id VARCHAR(255) NOT NULL REFERENCES quiz_sessions(session_id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    scenario_question TEXT,
    scenario_answer TEXT,
    questions_and_answers TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS ai_recommendations (
    id INTEGER PRIMARY KEY,
    session_id VARCHAR(255) NOT NULL REFERENCES quiz_sessions(session_id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    recommendations TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS products (
    id INTEGER PRIMARY KEY,
    product_name VARCHAR(500) NOT NULL,
    product_type VARCHAR(255),
    brand VARCHAR(255),
    country VARCHAR(255),
    product_kind VARCHAR(255),
    volume VARCHAR(100),
    skin_for TEXT,
    functions TEXT,
    description_1 TEXT,
    description_2 TEXT,
    components TEXT,
    ingredients_list TEXT,
    price_min INTEGER,
    price_max INTEGER
);

CREATE TABLE IF NOT EXISTS reviews (
    id INTEGER PRIMARY KEY,
    product_id INTEGER REFERENCES products(id) ON DELETE CASCADE,
    review_text TEXT
);

CREATE INDEX IF NOT EXISTS idx_quiz_sessions_user ON quiz_sessions(user_id);
CREATE INDEX IF NOT EXISTS idx_quiz_answers_session ON quiz_answers(session_id);
CREATE INDEX IF NOT EXISTS idx_ai_recommendations_session ON ai_recommendations(session_id);
CREATE INDEX IF NOT EXISTS idx_reviews_product ON reviews(product_id);
";

pub const BASE_TABLES: [&str; 6] = [
    "ai_recommendations",
    "products",
    "quiz_answers",
    "quiz_sessions",
    "reviews",
    "users",
];

/// Create the base tables if they are missing and return the resulting
/// table list.
pub fn initialize(conn: &Connection) -> Result<Vec<String>> {
    conn.execute_batch(BASE_SCHEMA)
        .map_err(|e| Error::Database(format!("base schema creation failed: {e}")))?;

    let tables = inspect::list_tables(conn)?;
    info!("tables present: {}", tables.join(", "));
    Ok(tables)
}
