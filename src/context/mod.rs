//! Agent context
//!
//! Domain snapshot types and the text serialization that keeps the agent
//! informed of live household state.

mod serializer;
mod snapshot;

pub use serializer::{
    ChangeKind, ContextUpdate, InventoryChange, daily_energy_kcal, serialize_cart_delta,
    serialize_full, serialize_inventory_delta,
};
pub use snapshot::{
    ActivityLevel, ContextSnapshot, EXPIRY_WINDOW_DAYS, Gender, HouseholdMember, InventoryItem,
    LOW_STOCK_FILL, Pet, Profile, ShoppingListItem,
};
