//! Serializable point-in-time image of the inventory.
//!
//! Produced by save hooks and consumed by load hooks. The on-disk format is
//! plain JSON so snapshots can be inspected and hand-edited.

use serde::{Deserialize, Serialize};

/// Accumulator handed to every save hook, and the structure load hooks
/// repopulate from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub products: Vec<ProductSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    pub sku: String,
    pub stock: u64,
    /// Informational only; recomputed from `reservations` on load.
    #[serde(default)]
    pub total_reserved: u64,
    #[serde(default)]
    pub reservations: Vec<ReservationSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationSnapshot {
    pub client_id: String,
    pub quantity: u64,
    /// Milliseconds since Unix epoch.
    pub last_updated: u64,
}
