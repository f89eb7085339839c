//! Context serialization for the agent
//!
//! Turns a [`ContextSnapshot`] into a fixed-order text block. Sections with
//! no data are left out, and every list is sorted, so an unchanged snapshot
//! always serializes to the same string.

use std::collections::BTreeMap;
use std::fmt::Write;

use super::snapshot::{ContextSnapshot, Gender, InventoryItem, Profile, ShoppingListItem};

/// Most recent inventory items listed in the full context
pub const RECENT_LIMIT: usize = 5;

/// Cart item names listed before collapsing into "+N more"
pub const CART_NAME_LIMIT: usize = 5;

/// Text pushed to the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextUpdate {
    /// Complete re-serialization
    Full(String),
    /// One-line incremental notice
    Delta(String),
}

impl ContextUpdate {
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Full(s) | Self::Delta(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single inventory row change
#[derive(Debug, Clone)]
pub struct InventoryChange {
    pub kind: ChangeKind,
    pub item: InventoryItem,
}

/// Serialize the full context block
#[must_use]
pub fn serialize_full(snapshot: &ContextSnapshot) -> String {
    let mut lines = Vec::new();
    let profile = &snapshot.profile;

    if let Some(line) = identity_line(profile) {
        lines.push(line);
    }
    if let Some(line) = energy_line(profile) {
        lines.push(line);
    }
    if let Some(line) = shield_line(snapshot) {
        lines.push(line);
    }
    if let Some(line) = household_line(snapshot) {
        lines.push(line);
    }

    let cart: Vec<&ShoppingListItem> = snapshot.cart().collect();

    if !snapshot.inventory.is_empty() {
        lines.push("INVENTORY:".to_string());

        let mut expiring: Vec<&InventoryItem> = snapshot
            .inventory
            .iter()
            .filter(|i| i.is_expiring(snapshot.as_of))
            .collect();
        expiring.sort_by(|a, b| a.expiry_date.cmp(&b.expiry_date).then_with(|| a.name.cmp(&b.name)));
        for item in expiring {
            if let Some(date) = item.expiry_date {
                lines.push(format!("- EXPIRING SOON: {} ({date})", item.name));
            }
        }

        let mut low: Vec<&InventoryItem> = snapshot.inventory.iter().filter(|i| i.is_low_stock()).collect();
        low.sort_by(|a, b| a.name.cmp(&b.name));
        for item in low {
            lines.push(format!("- LOW STOCK: {}{}", item.name, stock_suffix(item)));
        }

        let mut recent: Vec<&InventoryItem> = snapshot.inventory.iter().collect();
        recent.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        for item in recent.into_iter().take(RECENT_LIMIT) {
            lines.push(format!("- RECENT: {}{}", item.name, quantity_suffix(item)));
        }

        lines.push(cart_line("CART", &cart));
    } else if !cart.is_empty() {
        lines.push(cart_line("CART", &cart));
    }

    lines.join("\n")
}

/// One-line note for a single inventory change
#[must_use]
pub fn serialize_inventory_delta(change: &InventoryChange) -> String {
    let name = &change.item.name;
    match change.kind {
        ChangeKind::Insert => format!("INVENTORY UPDATE: added {name}"),
        ChangeKind::Update if change.item.is_low_stock() => {
            format!("INVENTORY UPDATE: updated {name} (low stock)")
        }
        ChangeKind::Update => format!("INVENTORY UPDATE: updated {name}"),
        ChangeKind::Delete => format!("INVENTORY UPDATE: removed {name}"),
    }
}

/// One-line note reporting cart size and the first few names
#[must_use]
pub fn serialize_cart_delta(items: &[ShoppingListItem]) -> String {
    let cart: Vec<&ShoppingListItem> = items.iter().filter(|i| !i.checked).collect();
    cart_line("CART UPDATE", &cart)
}

fn identity_line(profile: &Profile) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(name) = &profile.name {
        parts.push(name.clone());
    }
    if let Some(age) = profile.age {
        parts.push(format!("{age}y"));
    }
    if let Some(gender) = profile.gender {
        parts.push(gender.as_str().to_string());
    }
    if let Some(activity) = profile.activity_level {
        parts.push(activity.as_str().to_string());
    }
    if !profile.health_goals.is_empty() {
        parts.push(format!("goals: {}", profile.health_goals.join(", ")));
    }

    if parts.is_empty() {
        None
    } else {
        Some(format!("USER: {}", parts.join(" | ")))
    }
}

/// Mifflin-St Jeor BMR scaled by activity factor
#[must_use]
pub fn daily_energy_kcal(profile: &Profile) -> Option<(u32, u32)> {
    let weight = profile.weight_kg?;
    let height = profile.height_cm?;
    let age = profile.age?;

    let offset = match profile.gender {
        Some(Gender::Male) => 5.0,
        Some(Gender::Female) => -161.0,
        Some(Gender::Other) | None => -78.0,
    };
    #[allow(clippy::cast_precision_loss)]
    let bmr = 6.25f32.mul_add(height, 10.0 * weight) - 5.0 * age as f32 + offset;
    if bmr <= 0.0 {
        return None;
    }
    let factor = profile.activity_level.map_or(1.2, |a| a.factor());

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some((bmr.round() as u32, (bmr * factor).round() as u32))
}

fn energy_line(profile: &Profile) -> Option<String> {
    let (bmr, tdee) = daily_energy_kcal(profile)?;
    Some(format!("ENERGY: ~{tdee} kcal/day (BMR {bmr})"))
}

fn shield_line(snapshot: &ContextSnapshot) -> Option<String> {
    let allergies = dedupe(
        snapshot
            .profile
            .allergies
            .iter()
            .chain(snapshot.members.iter().flat_map(|m| m.allergies.iter())),
    );
    let diet = dedupe(snapshot.profile.dietary_values.iter());

    let mut parts = Vec::new();
    if !allergies.is_empty() {
        parts.push(format!("avoid {}", allergies.join(", ")));
    }
    if !diet.is_empty() {
        parts.push(format!("diet {}", diet.join(", ")));
    }

    if parts.is_empty() {
        None
    } else {
        Some(format!("SHIELD: {}", parts.join(" | ")))
    }
}

fn household_line(snapshot: &ContextSnapshot) -> Option<String> {
    let profile = &snapshot.profile;
    let mut parts = Vec::new();

    if profile.household_adults > 0 || profile.household_kids > 0 {
        parts.push(format!(
            "{} adult{}, {} kid{}",
            profile.household_adults,
            plural(u64::from(profile.household_adults)),
            profile.household_kids,
            plural(u64::from(profile.household_kids))
        ));
    }

    if !snapshot.members.is_empty() {
        let mut members: Vec<String> = snapshot
            .members
            .iter()
            .map(|m| match (&m.relationship, m.age) {
                (Some(rel), Some(age)) => format!("{} ({rel}, {age})", m.name),
                (Some(rel), None) => format!("{} ({rel})", m.name),
                (None, Some(age)) => format!("{} ({age})", m.name),
                (None, None) => m.name.clone(),
            })
            .collect();
        members.sort();
        parts.push(format!("members {}", members.join(", ")));
    }

    if !snapshot.pets.is_empty() {
        let mut pets: Vec<String> = snapshot
            .pets
            .iter()
            .map(|p| format!("{} ({})", p.name, p.species))
            .collect();
        pets.sort();
        parts.push(format!("pets {}", pets.join(", ")));
    }

    if parts.is_empty() {
        None
    } else {
        Some(format!("HOUSEHOLD: {}", parts.join(" | ")))
    }
}

fn cart_line(label: &str, cart: &[&ShoppingListItem]) -> String {
    if cart.is_empty() {
        return format!("{label}: empty");
    }
    let names: Vec<&str> = cart.iter().take(CART_NAME_LIMIT).map(|i| i.name.as_str()).collect();
    let mut line = format!(
        "{label}: {} item{} ({}",
        cart.len(),
        plural(cart.len() as u64),
        names.join(", ")
    );
    if cart.len() > CART_NAME_LIMIT {
        let _ = write!(line, ", +{} more", cart.len() - CART_NAME_LIMIT);
    }
    line.push(')');
    line
}

fn stock_suffix(item: &InventoryItem) -> String {
    match item.fill_level {
        Some(fill) => format!(" ({fill}%)"),
        None => " (out)".to_string(),
    }
}

fn quantity_suffix(item: &InventoryItem) -> String {
    match &item.unit {
        Some(unit) => format!(" ({} {unit})", format_quantity(item.quantity)),
        None => format!(" (x{})", format_quantity(item.quantity)),
    }
}

fn format_quantity(q: f32) -> String {
    if (q - q.round()).abs() < f32::EPSILON {
        format!("{q:.0}")
    } else {
        format!("{q:.1}")
    }
}

/// Case-insensitive dedupe, first spelling wins, sorted
fn dedupe<'a>(values: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            continue;
        }
        seen.entry(trimmed.to_lowercase()).or_insert_with(|| trimmed.to_string());
    }
    seen.into_values().collect()
}

const fn plural(n: u64) -> &'static str {
    if n == 1 { "" } else { "s" }
}
