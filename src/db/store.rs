//! `SQLite`-backed data store

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::{DbConn, DbPool};
use crate::context::{
    ActivityLevel, ContextSnapshot, Gender, HouseholdMember, InventoryItem, Pet, Profile,
    ShoppingListItem,
};
use crate::store::{DataStore, HouseholdUpdate, ProfileUpdate};
use crate::{Error, Result};

/// Fields for a new pantry item
#[derive(Debug, Clone)]
pub struct NewInventoryItem {
    pub name: String,
    pub category: Option<String>,
    pub quantity: f32,
    pub unit: Option<String>,
    pub fill_level: Option<u8>,
    pub expiry_date: Option<NaiveDate>,
}

impl NewInventoryItem {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: None,
            quantity: 1.0,
            unit: None,
            fill_level: None,
            expiry_date: None,
        }
    }
}

/// Data store over a pooled `SQLite` database
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    /// Create the profile row if it does not exist yet
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn ensure_profile(&self, user_id: &str) -> Result<()> {
        let conn = self.conn()?;
        ensure_profile(&conn, user_id)
    }

    /// Add a pantry item
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn add_inventory_item(&self, user_id: &str, item: NewInventoryItem) -> Result<InventoryItem> {
        let conn = self.conn()?;
        ensure_profile(&conn, user_id)?;

        let stored = InventoryItem {
            id: Uuid::new_v4().to_string(),
            name: item.name,
            category: item.category,
            quantity: item.quantity,
            unit: item.unit,
            fill_level: item.fill_level.map(|f| f.min(100)),
            expiry_date: item.expiry_date,
            last_activity_at: Utc::now(),
        };

        conn.execute(
            "INSERT INTO inventory_items
             (id, user_id, name, category, quantity, unit, fill_level, expiry_date, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                stored.id,
                user_id,
                stored.name,
                stored.category,
                f64::from(stored.quantity),
                stored.unit,
                stored.fill_level,
                stored.expiry_date.map(|d| d.to_string()),
                stored.last_activity_at.to_rfc3339(),
            ],
        )?;

        tracing::debug!(user_id, item = %stored.name, "inventory item added");
        Ok(stored)
    }

    /// Set an item's fill level and bump its activity time
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no such item exists
    pub fn set_fill_level(&self, item_id: &str, fill_level: u8) -> Result<InventoryItem> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE inventory_items SET fill_level = ?1, last_activity_at = ?2 WHERE id = ?3",
            params![fill_level.min(100), Utc::now().to_rfc3339(), item_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("inventory item {item_id}")));
        }

        conn.query_row(
            &format!("SELECT {INVENTORY_COLUMNS} FROM inventory_items WHERE id = ?1"),
            [item_id],
            inventory_from_row,
        )
        .map_err(Into::into)
    }

    /// Remove a pantry item, returning it
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no such item exists
    pub fn remove_inventory_item(&self, item_id: &str) -> Result<InventoryItem> {
        let conn = self.conn()?;
        let item = conn
            .query_row(
                &format!("SELECT {INVENTORY_COLUMNS} FROM inventory_items WHERE id = ?1"),
                [item_id],
                inventory_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("inventory item {item_id}")))?;

        conn.execute("DELETE FROM inventory_items WHERE id = ?1", [item_id])?;
        Ok(item)
    }

    /// Read a snapshot synchronously
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn load_snapshot(&self, user_id: &str, as_of: NaiveDate) -> Result<ContextSnapshot> {
        let conn = self.conn()?;

        let profile = conn
            .query_row(
                "SELECT user_id, name, age, gender, weight_kg, height_cm, activity_level,
                        allergies, dietary_values, health_goals, household_adults,
                        household_kids, onboarding_completed
                 FROM profiles WHERE user_id = ?1",
                [user_id],
                profile_from_row,
            )
            .optional()?
            .unwrap_or_else(|| Profile {
                user_id: user_id.to_string(),
                ..Profile::default()
            });

        let members = conn
            .prepare(
                "SELECT name, relationship, age, allergies FROM household_members
                 WHERE user_id = ?1 ORDER BY name, id",
            )?
            .query_map([user_id], |row| {
                Ok(HouseholdMember {
                    name: row.get(0)?,
                    relationship: row.get(1)?,
                    age: row.get(2)?,
                    allergies: json_list(&row.get::<_, String>(3)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let pets = conn
            .prepare("SELECT name, species, breed FROM pets WHERE user_id = ?1 ORDER BY name, id")?
            .query_map([user_id], |row| {
                Ok(Pet {
                    name: row.get(0)?,
                    species: row.get(1)?,
                    breed: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let inventory = conn
            .prepare(&format!(
                "SELECT {INVENTORY_COLUMNS} FROM inventory_items WHERE user_id = ?1 ORDER BY name, id"
            ))?
            .query_map([user_id], inventory_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let shopping_list = list_shopping(&conn, user_id)?;

        Ok(ContextSnapshot {
            as_of,
            profile,
            members,
            pets,
            inventory,
            shopping_list,
        })
    }
}

// Synchronous bodies of the `DataStore` methods, run on the blocking pool
impl SqliteStore {
    fn set_profile_column(&self, user_id: &str, update: ProfileUpdate) -> Result<()> {
        let conn = self.conn()?;
        ensure_profile(&conn, user_id)?;

        let column = update.column();
        let value = match update {
            ProfileUpdate::Name(name) => Value::Text(name),
            ProfileUpdate::Age(age) => Value::Integer(i64::from(age)),
            ProfileUpdate::Gender(gender) => Value::Text(gender.as_str().to_string()),
            ProfileUpdate::WeightKg(v) | ProfileUpdate::HeightCm(v) => Value::Real(f64::from(v)),
            ProfileUpdate::ActivityLevel(level) => Value::Text(level.as_str().to_string()),
            ProfileUpdate::Allergies(list)
            | ProfileUpdate::DietaryValues(list)
            | ProfileUpdate::HealthGoals(list) => Value::Text(serde_json::to_string(&list)?),
        };

        conn.execute(
            &format!("UPDATE profiles SET {column} = ?1, updated_at = ?2 WHERE user_id = ?3"),
            params![value, Utc::now().to_rfc3339(), user_id],
        )?;

        tracing::debug!(user_id, column, "profile updated");
        Ok(())
    }

    fn replace_household(&self, user_id: &str, update: &HouseholdUpdate) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        ensure_profile(&tx, user_id)?;

        if let Some(adults) = update.adults {
            tx.execute(
                "UPDATE profiles SET household_adults = ?1 WHERE user_id = ?2",
                params![adults, user_id],
            )?;
        }
        if let Some(kids) = update.kids {
            tx.execute(
                "UPDATE profiles SET household_kids = ?1 WHERE user_id = ?2",
                params![kids, user_id],
            )?;
        }

        if let Some(members) = &update.members {
            tx.execute("DELETE FROM household_members WHERE user_id = ?1", [user_id])?;
            for member in members {
                tx.execute(
                    "INSERT INTO household_members (id, user_id, name, relationship, age, allergies)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        Uuid::new_v4().to_string(),
                        user_id,
                        member.name,
                        member.relationship,
                        member.age,
                        serde_json::to_string(&member.allergies)?,
                    ],
                )?;
            }
        }

        if let Some(pets) = &update.pets {
            tx.execute("DELETE FROM pets WHERE user_id = ?1", [user_id])?;
            for pet in pets {
                tx.execute(
                    "INSERT INTO pets (id, user_id, name, species, breed) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![Uuid::new_v4().to_string(), user_id, pet.name, pet.species, pet.breed],
                )?;
            }
        }

        tx.execute(
            "UPDATE profiles SET updated_at = ?1 WHERE user_id = ?2",
            params![Utc::now().to_rfc3339(), user_id],
        )?;
        tx.commit()?;

        tracing::debug!(
            user_id,
            members = update.members.as_ref().map(Vec::len),
            pets = update.pets.as_ref().map(Vec::len),
            "household written"
        );
        Ok(())
    }

    fn complete_onboarding(&self, user_id: &str) -> Result<()> {
        let conn = self.conn()?;
        ensure_profile(&conn, user_id)?;
        conn.execute(
            "UPDATE profiles SET onboarding_completed = 1, updated_at = ?1
             WHERE user_id = ?2 AND onboarding_completed = 0",
            params![Utc::now().to_rfc3339(), user_id],
        )?;
        Ok(())
    }

    fn append_shopping_items(&self, user_id: &str, names: &[String]) -> Result<Vec<ShoppingListItem>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        ensure_profile(&tx, user_id)?;

        for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
            tx.execute(
                "INSERT INTO shopping_list_items (id, user_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![Uuid::new_v4().to_string(), user_id, name, Utc::now().to_rfc3339()],
            )?;
        }
        tx.commit()?;

        list_shopping(&conn, user_id)
    }
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn snapshot(&self, user_id: &str, as_of: NaiveDate) -> Result<ContextSnapshot> {
        let store = self.clone();
        let user_id = user_id.to_string();
        run_blocking(move || store.load_snapshot(&user_id, as_of)).await
    }

    async fn update_profile(&self, user_id: &str, update: ProfileUpdate) -> Result<()> {
        let store = self.clone();
        let user_id = user_id.to_string();
        run_blocking(move || store.set_profile_column(&user_id, update)).await
    }

    async fn write_household(&self, user_id: &str, update: HouseholdUpdate) -> Result<()> {
        let store = self.clone();
        let user_id = user_id.to_string();
        run_blocking(move || store.replace_household(&user_id, &update)).await
    }

    async fn mark_onboarding_complete(&self, user_id: &str) -> Result<()> {
        let store = self.clone();
        let user_id = user_id.to_string();
        run_blocking(move || store.complete_onboarding(&user_id)).await
    }

    async fn add_shopping_items(&self, user_id: &str, names: &[String]) -> Result<Vec<ShoppingListItem>> {
        let store = self.clone();
        let user_id = user_id.to_string();
        let names = names.to_vec();
        run_blocking(move || store.append_shopping_items(&user_id, &names)).await
    }
}

/// Run a synchronous query off the async runtime
async fn run_blocking<T, F>(query: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(query)
        .await
        .map_err(|e| Error::Database(format!("database task failed: {e}")))?
}

const INVENTORY_COLUMNS: &str =
    "id, name, category, quantity, unit, fill_level, expiry_date, last_activity_at";

fn ensure_profile(conn: &Connection, user_id: &str) -> Result<()> {
    conn.execute("INSERT OR IGNORE INTO profiles (user_id) VALUES (?1)", [user_id])?;
    Ok(())
}

fn list_shopping(conn: &Connection, user_id: &str) -> Result<Vec<ShoppingListItem>> {
    let items = conn
        .prepare(
            "SELECT id, name, quantity, checked FROM shopping_list_items
             WHERE user_id = ?1 ORDER BY created_at, rowid",
        )?
        .query_map([user_id], |row| {
            Ok(ShoppingListItem {
                id: row.get(0)?,
                name: row.get(1)?,
                quantity: row.get::<_, Option<f64>>(2)?.map(narrow),
                checked: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        user_id: row.get(0)?,
        name: row.get(1)?,
        age: row.get(2)?,
        gender: row.get::<_, Option<String>>(3)?.as_deref().and_then(Gender::parse),
        weight_kg: row.get::<_, Option<f64>>(4)?.map(narrow),
        height_cm: row.get::<_, Option<f64>>(5)?.map(narrow),
        activity_level: row
            .get::<_, Option<String>>(6)?
            .as_deref()
            .and_then(ActivityLevel::parse),
        allergies: json_list(&row.get::<_, String>(7)?),
        dietary_values: json_list(&row.get::<_, String>(8)?),
        health_goals: json_list(&row.get::<_, String>(9)?),
        household_adults: row.get(10)?,
        household_kids: row.get(11)?,
        onboarding_completed: row.get(12)?,
    })
}

fn inventory_from_row(row: &Row<'_>) -> rusqlite::Result<InventoryItem> {
    Ok(InventoryItem {
        id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        quantity: narrow(row.get(3)?),
        unit: row.get(4)?,
        fill_level: row.get(5)?,
        expiry_date: row
            .get::<_, Option<String>>(6)?
            .and_then(|s| s.parse::<NaiveDate>().ok()),
        last_activity_at: parse_datetime(&row.get::<_, String>(7)?),
    })
}

#[allow(clippy::cast_possible_truncation)]
const fn narrow(v: f64) -> f32 {
    v as f32
}

fn json_list(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(
        |_| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map_or(DateTime::UNIX_EPOCH, |dt| dt.and_utc())
        },
        |dt| dt.with_timezone(&Utc),
    )
}
