//! Typed tool calls

use serde_json::Value;

use super::ToolInvocation;
use crate::context::{ActivityLevel, Gender, HouseholdMember, Pet};
use crate::store::{HouseholdUpdate, ProfileUpdate};
use crate::{Error, Result};

/// Profile fields the agent may write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileField {
    Name,
    Age,
    Gender,
    Weight,
    Height,
    ActivityLevel,
    Allergies,
    DietaryValues,
    HealthGoals,
    HouseholdAdults,
    HouseholdKids,
    HouseholdMembers,
    Pets,
    Household,
}

impl ProfileField {
    /// Parse the agent's field name
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let field = match name {
            "name" | "userName" => Self::Name,
            "age" => Self::Age,
            "gender" => Self::Gender,
            "weight" | "weightKg" => Self::Weight,
            "height" | "heightCm" => Self::Height,
            "activityLevel" => Self::ActivityLevel,
            "allergies" => Self::Allergies,
            "dietaryValues" | "diet" => Self::DietaryValues,
            "healthGoals" | "goals" => Self::HealthGoals,
            "householdAdults" | "adults" => Self::HouseholdAdults,
            "householdKids" | "kids" => Self::HouseholdKids,
            "householdMembers" | "members" => Self::HouseholdMembers,
            "pets" => Self::Pets,
            "household" => Self::Household,
            _ => return None,
        };
        Some(field)
    }

    /// Fields written through the transactional household path
    #[must_use]
    pub const fn is_structured(self) -> bool {
        matches!(
            self,
            Self::HouseholdAdults | Self::HouseholdKids | Self::HouseholdMembers | Self::Pets | Self::Household
        )
    }

    /// Convert a scalar field's JSON value into a column update
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tool`] if the value has the wrong shape, or if called
    /// on a structured field
    pub fn profile_update(self, value: &Value) -> Result<ProfileUpdate> {
        let update = match self {
            Self::Name => ProfileUpdate::Name(as_text(value).ok_or_else(|| invalid("name", value))?),
            Self::Age => ProfileUpdate::Age(as_u32(value).ok_or_else(|| invalid("age", value))?),
            Self::Gender => ProfileUpdate::Gender(
                as_text(value)
                    .as_deref()
                    .and_then(Gender::parse)
                    .ok_or_else(|| invalid("gender", value))?,
            ),
            Self::Weight => ProfileUpdate::WeightKg(as_f32(value).ok_or_else(|| invalid("weight", value))?),
            Self::Height => ProfileUpdate::HeightCm(as_f32(value).ok_or_else(|| invalid("height", value))?),
            Self::ActivityLevel => ProfileUpdate::ActivityLevel(
                as_text(value)
                    .as_deref()
                    .and_then(ActivityLevel::parse)
                    .ok_or_else(|| invalid("activityLevel", value))?,
            ),
            Self::Allergies => ProfileUpdate::Allergies(as_list(value).ok_or_else(|| invalid("allergies", value))?),
            Self::DietaryValues => {
                ProfileUpdate::DietaryValues(as_list(value).ok_or_else(|| invalid("dietaryValues", value))?)
            }
            Self::HealthGoals => {
                ProfileUpdate::HealthGoals(as_list(value).ok_or_else(|| invalid("healthGoals", value))?)
            }
            Self::HouseholdAdults | Self::HouseholdKids | Self::HouseholdMembers | Self::Pets | Self::Household => {
                return Err(Error::Tool(format!("{self:?} is written as a household update")));
            }
        };
        Ok(update)
    }

    /// Convert a structured field's JSON value into a household write
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tool`] if the value has the wrong shape, or if called
    /// on a scalar field
    pub fn household_update(self, value: &Value) -> Result<HouseholdUpdate> {
        let mut update = HouseholdUpdate::default();
        match self {
            Self::HouseholdAdults => update.adults = Some(as_u32(value).ok_or_else(|| invalid("householdAdults", value))?),
            Self::HouseholdKids => update.kids = Some(as_u32(value).ok_or_else(|| invalid("householdKids", value))?),
            Self::HouseholdMembers => update.members = Some(parse_members(value)?),
            Self::Pets => update.pets = Some(parse_pets(value)?),
            Self::Household => {
                let obj = value.as_object().ok_or_else(|| invalid("household", value))?;
                if let Some(v) = obj.get("adults") {
                    update.adults = Some(as_u32(v).ok_or_else(|| invalid("household.adults", v))?);
                }
                if let Some(v) = obj.get("kids") {
                    update.kids = Some(as_u32(v).ok_or_else(|| invalid("household.kids", v))?);
                }
                if let Some(v) = obj.get("members") {
                    update.members = Some(parse_members(v)?);
                }
                if let Some(v) = obj.get("pets") {
                    update.pets = Some(parse_pets(v)?);
                }
                if update.is_empty() {
                    return Err(invalid("household", value));
                }
            }
            _ => return Err(Error::Tool(format!("{self:?} is not a household field"))),
        }
        Ok(update)
    }
}

/// One case per tool the agent may call
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    UpdateProfile { field: String, value: Value },
    CompleteConversation { reason: Option<String> },
    EndConversation { reason: Option<String> },
    NavigateTo { page: String },
    AddToShoppingList { items: Vec<String> },
    Unknown { name: String },
}

impl ToolCall {
    /// Interpret an invocation
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tool`] if a required parameter is missing or malformed
    pub fn parse(invocation: &ToolInvocation) -> Result<Self> {
        let params = &invocation.parameters;
        let text = |key: &str| params.get(key).and_then(as_text);

        let call = match invocation.name.as_str() {
            "updateProfile" | "update_profile" => Self::UpdateProfile {
                field: text("field").ok_or_else(|| missing("field"))?,
                value: params.get("value").cloned().ok_or_else(|| missing("value"))?,
            },
            "completeConversation" | "complete_conversation" => Self::CompleteConversation { reason: text("reason") },
            "endConversation" | "end_conversation" => Self::EndConversation { reason: text("reason") },
            "navigateTo" | "navigate_to" => Self::NavigateTo {
                page: text("page").ok_or_else(|| missing("page"))?,
            },
            "addToShoppingList" | "add_to_shopping_list" => Self::AddToShoppingList {
                items: params
                    .get("items")
                    .and_then(as_list)
                    .ok_or_else(|| missing("items"))?,
            },
            other => Self::Unknown { name: other.to_string() },
        };
        Ok(call)
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::UpdateProfile { .. } => "updateProfile",
            Self::CompleteConversation { .. } => "completeConversation",
            Self::EndConversation { .. } => "endConversation",
            Self::NavigateTo { .. } => "navigateTo",
            Self::AddToShoppingList { .. } => "addToShoppingList",
            Self::Unknown { .. } => "unknown",
        }
    }
}

fn missing(key: &str) -> Error {
    Error::Tool(format!("missing parameter: {key}"))
}

fn invalid(field: &str, value: &Value) -> Error {
    Error::Tool(format!("invalid value for {field}: {value}"))
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn as_f32(value: &Value) -> Option<f32> {
    let v = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s
            .trim()
            .trim_end_matches(|c: char| c.is_alphabetic())
            .trim()
            .parse()
            .ok()?,
        _ => return None,
    };
    (v.is_finite() && v > 0.0).then_some(v as f32)
}

/// A JSON array of strings, or a comma-separated string
fn as_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(|s| s.trim().to_string()))
            .collect::<Option<Vec<_>>>()
            .map(|v| v.into_iter().filter(|s| !s.is_empty()).collect()),
        Value::String(s) => Some(
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        ),
        _ => None,
    }
}

fn parse_members(value: &Value) -> Result<Vec<HouseholdMember>> {
    let items = value.as_array().ok_or_else(|| invalid("householdMembers", value))?;
    items
        .iter()
        .map(|item| match item {
            Value::String(name) => Ok(HouseholdMember {
                name: name.trim().to_string(),
                relationship: None,
                age: None,
                allergies: Vec::new(),
            }),
            other => serde_json::from_value(other.clone()).map_err(|_| invalid("householdMembers", other)),
        })
        .collect()
}

fn parse_pets(value: &Value) -> Result<Vec<Pet>> {
    let items = value.as_array().ok_or_else(|| invalid("pets", value))?;
    items
        .iter()
        .map(|item| match item {
            Value::String(name) => Ok(Pet {
                name: name.trim().to_string(),
                species: "pet".to_string(),
                breed: None,
            }),
            other => serde_json::from_value(other.clone()).map_err(|_| invalid("pets", other)),
        })
        .collect()
}
