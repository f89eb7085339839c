//! Domain snapshot types
//!
//! A [`ContextSnapshot`] is a read-only view assembled by the data store.
//! The serializer only formats it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Fill level (percent) at or below which an item counts as low stock
pub const LOW_STOCK_FILL: u8 = 25;

/// Days ahead of `as_of` that count as expiring soon
pub const EXPIRY_WINDOW_DAYS: i64 = 3;

/// Self-reported activity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Sedentary,
    Light,
    Moderate,
    Active,
    VeryActive,
}

impl ActivityLevel {
    /// Multiplier applied to the basal metabolic rate
    #[must_use]
    pub const fn factor(self) -> f32 {
        match self {
            Self::Sedentary => 1.2,
            Self::Light => 1.375,
            Self::Moderate => 1.55,
            Self::Active => 1.725,
            Self::VeryActive => 1.9,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sedentary => "sedentary",
            Self::Light => "light",
            Self::Moderate => "moderate",
            Self::Active => "active",
            Self::VeryActive => "very_active",
        }
    }

    /// Parse loosely ("very active", "Very_Active", "lightly active")
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "sedentary" => Some(Self::Sedentary),
            "light" | "lightly_active" => Some(Self::Light),
            "moderate" | "moderately_active" => Some(Self::Moderate),
            "active" => Some(Self::Active),
            "very_active" | "extra_active" => Some(Self::VeryActive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "male" | "m" | "man" => Some(Self::Male),
            "female" | "f" | "woman" => Some(Self::Female),
            "other" | "nonbinary" | "non-binary" => Some(Self::Other),
            _ => None,
        }
    }
}

/// The primary user's profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: String,
    pub name: Option<String>,
    pub age: Option<u32>,
    pub gender: Option<Gender>,
    pub weight_kg: Option<f32>,
    pub height_cm: Option<f32>,
    pub activity_level: Option<ActivityLevel>,
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub dietary_values: Vec<String>,
    #[serde(default)]
    pub health_goals: Vec<String>,
    #[serde(default)]
    pub household_adults: u32,
    #[serde(default)]
    pub household_kids: u32,
    #[serde(default)]
    pub onboarding_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseholdMember {
    pub name: String,
    pub relationship: Option<String>,
    pub age: Option<u32>,
    #[serde(default)]
    pub allergies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pet {
    pub name: String,
    pub species: String,
    pub breed: Option<String>,
}

/// A pantry/fridge item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub id: String,
    pub name: String,
    pub category: Option<String>,
    pub quantity: f32,
    pub unit: Option<String>,
    /// Remaining fill level in percent
    pub fill_level: Option<u8>,
    pub expiry_date: Option<NaiveDate>,
    pub last_activity_at: DateTime<Utc>,
}

impl InventoryItem {
    #[must_use]
    pub fn is_low_stock(&self) -> bool {
        self.quantity <= 0.0 || self.fill_level.is_some_and(|f| f <= LOW_STOCK_FILL)
    }

    /// Expires on or before `as_of + EXPIRY_WINDOW_DAYS` (already expired counts)
    #[must_use]
    pub fn is_expiring(&self, as_of: NaiveDate) -> bool {
        self.expiry_date
            .is_some_and(|d| (d - as_of).num_days() <= EXPIRY_WINDOW_DAYS)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShoppingListItem {
    pub id: String,
    pub name: String,
    pub quantity: Option<f32>,
    #[serde(default)]
    pub checked: bool,
}

/// Everything the agent needs to know about a user at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    /// Reference date for expiry calculations
    pub as_of: NaiveDate,
    pub profile: Profile,
    #[serde(default)]
    pub members: Vec<HouseholdMember>,
    #[serde(default)]
    pub pets: Vec<Pet>,
    #[serde(default)]
    pub inventory: Vec<InventoryItem>,
    #[serde(default)]
    pub shopping_list: Vec<ShoppingListItem>,
}

impl ContextSnapshot {
    #[must_use]
    pub fn empty(user_id: &str, as_of: NaiveDate) -> Self {
        Self {
            as_of,
            profile: Profile {
                user_id: user_id.to_string(),
                ..Profile::default()
            },
            members: Vec::new(),
            pets: Vec::new(),
            inventory: Vec::new(),
            shopping_list: Vec::new(),
        }
    }

    /// Unchecked shopping list entries
    pub fn cart(&self) -> impl Iterator<Item = &ShoppingListItem> {
        self.shopping_list.iter().filter(|i| !i.checked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(fill: Option<u8>, quantity: f32, expiry: Option<&str>) -> InventoryItem {
        InventoryItem {
            id: "i1".to_string(),
            name: "Milk".to_string(),
            category: None,
            quantity,
            unit: None,
            fill_level: fill,
            expiry_date: expiry.map(|d| d.parse().unwrap()),
            last_activity_at: Utc::now(),
        }
    }

    #[test]
    fn test_low_stock() {
        assert!(item(Some(25), 1.0, None).is_low_stock());
        assert!(item(None, 0.0, None).is_low_stock());
        assert!(!item(Some(26), 1.0, None).is_low_stock());
        assert!(!item(None, 2.0, None).is_low_stock());
    }

    #[test]
    fn test_expiry_window() {
        let as_of: NaiveDate = "2026-03-10".parse().unwrap();
        assert!(item(None, 1.0, Some("2026-03-13")).is_expiring(as_of));
        assert!(item(None, 1.0, Some("2026-03-01")).is_expiring(as_of));
        assert!(!item(None, 1.0, Some("2026-03-14")).is_expiring(as_of));
        assert!(!item(None, 1.0, None).is_expiring(as_of));
    }

    #[test]
    fn test_activity_parse() {
        assert_eq!(ActivityLevel::parse("Very Active"), Some(ActivityLevel::VeryActive));
        assert_eq!(ActivityLevel::parse("moderately-active"), Some(ActivityLevel::Moderate));
        assert_eq!(ActivityLevel::parse("couch"), None);
    }
}
