//! Data store boundary
//!
//! The tool dispatcher and session controller only see this trait. The
//! bundled implementation is [`crate::db::SqliteStore`].

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::Result;
use crate::context::{ActivityLevel, ContextSnapshot, Gender, HouseholdMember, Pet, ShoppingListItem};

/// A single scalar or list column update on the profile
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileUpdate {
    Name(String),
    Age(u32),
    Gender(Gender),
    WeightKg(f32),
    HeightCm(f32),
    ActivityLevel(ActivityLevel),
    Allergies(Vec<String>),
    DietaryValues(Vec<String>),
    HealthGoals(Vec<String>),
}

impl ProfileUpdate {
    /// Column written by this update
    #[must_use]
    pub const fn column(&self) -> &'static str {
        match self {
            Self::Name(_) => "name",
            Self::Age(_) => "age",
            Self::Gender(_) => "gender",
            Self::WeightKg(_) => "weight_kg",
            Self::HeightCm(_) => "height_cm",
            Self::ActivityLevel(_) => "activity_level",
            Self::Allergies(_) => "allergies",
            Self::DietaryValues(_) => "dietary_values",
            Self::HealthGoals(_) => "health_goals",
        }
    }
}

/// Household composition written in one transaction
///
/// `None` leaves that part untouched; `Some` replaces it entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HouseholdUpdate {
    pub adults: Option<u32>,
    pub kids: Option<u32>,
    pub members: Option<Vec<HouseholdMember>>,
    pub pets: Option<Vec<Pet>>,
}

impl HouseholdUpdate {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.adults.is_none() && self.kids.is_none() && self.members.is_none() && self.pets.is_none()
    }
}

/// Persistence capability keyed by user id
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Assemble the current snapshot for a user
    async fn snapshot(&self, user_id: &str, as_of: NaiveDate) -> Result<ContextSnapshot>;

    /// Write one profile column
    async fn update_profile(&self, user_id: &str, update: ProfileUpdate) -> Result<()>;

    /// Replace household counts, members and pets atomically
    async fn write_household(&self, user_id: &str, update: HouseholdUpdate) -> Result<()>;

    /// Mark onboarding done; calling it again is not an error
    async fn mark_onboarding_complete(&self, user_id: &str) -> Result<()>;

    /// Append items to the shopping list, returning the full list
    async fn add_shopping_items(&self, user_id: &str, names: &[String]) -> Result<Vec<ShoppingListItem>>;
}
