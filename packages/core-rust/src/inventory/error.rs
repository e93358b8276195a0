/// Errors returned by [`InventoryStore`](super::InventoryStore) operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InventoryError {
    #[error("unknown sku: {sku}")]
    NotFound { sku: String },
    #[error("sku already exists: {sku}")]
    AlreadyExists { sku: String },
    /// Admission control rejected a reservation. `available` is the SKU's
    /// stock at the time of the check, not the unreserved remainder.
    #[error("insufficient stock (available: {available})")]
    InsufficientStock { available: u64 },
}

impl InventoryError {
    pub(crate) fn not_found(sku: &str) -> Self {
        Self::NotFound {
            sku: sku.to_string(),
        }
    }
}
