//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- One profile per user
        CREATE TABLE IF NOT EXISTS profiles (
            user_id TEXT PRIMARY KEY,
            name TEXT,
            age INTEGER,
            gender TEXT,
            weight_kg REAL,
            height_cm REAL,
            activity_level TEXT,
            allergies TEXT NOT NULL DEFAULT '[]',
            dietary_values TEXT NOT NULL DEFAULT '[]',
            health_goals TEXT NOT NULL DEFAULT '[]',
            household_adults INTEGER NOT NULL DEFAULT 1,
            household_kids INTEGER NOT NULL DEFAULT 0,
            onboarding_completed INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS household_members (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES profiles(user_id),
            name TEXT NOT NULL,
            relationship TEXT,
            age INTEGER,
            allergies TEXT NOT NULL DEFAULT '[]'
        );

        CREATE INDEX IF NOT EXISTS idx_members_user ON household_members(user_id);

        CREATE TABLE IF NOT EXISTS pets (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES profiles(user_id),
            name TEXT NOT NULL,
            species TEXT NOT NULL,
            breed TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_pets_user ON pets(user_id);

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS inventory_items (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES profiles(user_id),
            name TEXT NOT NULL,
            category TEXT,
            quantity REAL NOT NULL DEFAULT 1,
            unit TEXT,
            fill_level INTEGER CHECK(fill_level IS NULL OR fill_level BETWEEN 0 AND 100),
            expiry_date TEXT,
            last_activity_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_inventory_user ON inventory_items(user_id);

        CREATE TABLE IF NOT EXISTS shopping_list_items (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES profiles(user_id),
            name TEXT NOT NULL,
            quantity REAL,
            checked INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_shopping_user ON shopping_list_items(user_id);

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2");
    Ok(())
}
