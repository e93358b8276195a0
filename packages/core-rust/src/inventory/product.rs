//! Per-SKU state: stock, reservations and the running reserved total.

use std::collections::HashMap;

use serde::Serialize;

use super::error::InventoryError;

/// A single client's claim on a SKU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationEntry {
    pub quantity: u64,
    /// Milliseconds since Unix epoch of the last add/set/del touching this entry.
    pub last_updated: u64,
}

/// Read-only view returned by `product.info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductInfo {
    pub stock: u64,
    pub total_reserved: u64,
}

/// A reservation removed by an expiration pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredReservation {
    pub client_id: String,
    pub quantity: u64,
}

/// Stock and reservation state of one SKU.
///
/// Only ever touched while the owning store holds this product's mutex, so
/// the methods here assume exclusive access and keep
/// `total_reserved == sum(reservations[*].quantity)`.
#[derive(Debug, Default)]
pub struct Product {
    pub(crate) stock: u64,
    pub(crate) total_reserved: u64,
    pub(crate) reservations: HashMap<String, ReservationEntry>,
}

impl Product {
    pub(crate) fn new(stock: u64) -> Self {
        Self {
            stock,
            ..Self::default()
        }
    }

    pub(crate) fn info(&self) -> ProductInfo {
        ProductInfo {
            stock: self.stock,
            total_reserved: self.total_reserved,
        }
    }

    /// Admission check shared by add and set: would `total_reserved + delta`
    /// still fit in stock?
    fn admits(&self, delta: u64) -> bool {
        self.total_reserved
            .checked_add(delta)
            .is_some_and(|candidate| candidate <= self.stock)
    }

    fn insufficient(&self) -> InventoryError {
        InventoryError::InsufficientStock {
            available: self.stock,
        }
    }

    pub(crate) fn reserve(
        &mut self,
        client_id: &str,
        qty: u64,
        now: u64,
    ) -> Result<(), InventoryError> {
        if !self.admits(qty) {
            return Err(self.insufficient());
        }

        if let Some(entry) = self.reservations.get_mut(client_id) {
            entry.quantity += qty;
            entry.last_updated = now;
        } else if qty > 0 {
            self.reservations.insert(
                client_id.to_string(),
                ReservationEntry {
                    quantity: qty,
                    last_updated: now,
                },
            );
        }
        self.total_reserved += qty;
        Ok(())
    }

    pub(crate) fn release(&mut self, client_id: &str, qty: u64, now: u64) {
        let Some(entry) = self.reservations.get_mut(client_id) else {
            return;
        };

        let released = qty.min(entry.quantity);
        entry.quantity -= released;
        entry.last_updated = now;
        self.total_reserved = self.total_reserved.saturating_sub(released);

        if entry.quantity == 0 {
            self.reservations.remove(client_id);
        }
    }

    pub(crate) fn set_reservation(
        &mut self,
        client_id: &str,
        qty: u64,
        now: u64,
    ) -> Result<(), InventoryError> {
        let current = self.reservations.get(client_id).map_or(0, |e| e.quantity);

        if qty > current {
            if !self.admits(qty - current) {
                return Err(self.insufficient());
            }
            self.total_reserved += qty - current;
        } else {
            // Shrinking a reservation never needs admission.
            self.total_reserved -= current - qty;
        }

        if qty == 0 {
            self.reservations.remove(client_id);
        } else {
            self.reservations.insert(
                client_id.to_string(),
                ReservationEntry {
                    quantity: qty,
                    last_updated: now,
                },
            );
        }
        Ok(())
    }

    /// Drops every entry not touched within `ttl_millis` of `now`.
    pub(crate) fn expire(&mut self, now: u64, ttl_millis: u64) -> Vec<ExpiredReservation> {
        let stale: Vec<String> = self
            .reservations
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.last_updated) > ttl_millis)
            .map(|(client_id, _)| client_id.clone())
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for client_id in stale {
            if let Some(entry) = self.reservations.remove(&client_id) {
                self.total_reserved = self.total_reserved.saturating_sub(entry.quantity);
                expired.push(ExpiredReservation {
                    client_id,
                    quantity: entry.quantity,
                });
            }
        }
        expired
    }

    /// Replaces all state from a snapshot. The reserved total is recomputed
    /// from the entries rather than trusted.
    pub(crate) fn replace(&mut self, stock: u64, reservations: HashMap<String, ReservationEntry>) {
        self.stock = stock;
        self.reservations = reservations;
        self.reservations.retain(|_, entry| entry.quantity > 0);
        self.total_reserved = self.reservations.values().map(|e| e.quantity).sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserved_sum(product: &Product) -> u64 {
        product.reservations.values().map(|e| e.quantity).sum()
    }

    #[test]
    fn reserve_creates_then_increments() {
        let mut product = Product::new(10);
        product.reserve("c1", 3, 100).unwrap();
        product.reserve("c1", 2, 200).unwrap();

        let entry = product.reservations["c1"];
        assert_eq!(entry.quantity, 5);
        assert_eq!(entry.last_updated, 200);
        assert_eq!(product.total_reserved, 5);
    }

    #[test]
    fn reserve_zero_refreshes_without_creating() {
        let mut product = Product::new(10);
        product.reserve("ghost", 0, 100).unwrap();
        assert!(product.reservations.is_empty());

        product.reserve("c1", 1, 100).unwrap();
        product.reserve("c1", 0, 500).unwrap();
        assert_eq!(product.reservations["c1"].last_updated, 500);
        assert_eq!(product.total_reserved, 1);
    }

    #[test]
    fn reserve_rejects_overflowing_quantities() {
        let mut product = Product::new(u64::MAX);
        product.reserve("c1", 10, 0).unwrap();
        let err = product.reserve("c2", u64::MAX, 0).unwrap_err();
        assert_eq!(
            err,
            InventoryError::InsufficientStock {
                available: u64::MAX
            }
        );
        assert_eq!(product.total_reserved, 10);
    }

    #[test]
    fn release_floors_at_zero_and_removes_entry() {
        let mut product = Product::new(10);
        product.reserve("c1", 4, 0).unwrap();
        product.release("c1", 9, 10);

        assert!(!product.reservations.contains_key("c1"));
        assert_eq!(product.total_reserved, 0);
    }

    #[test]
    fn release_does_not_steal_from_other_clients() {
        let mut product = Product::new(10);
        product.reserve("c1", 2, 0).unwrap();
        product.reserve("c2", 5, 0).unwrap();
        product.release("c1", 7, 0);

        assert_eq!(product.total_reserved, 5);
        assert_eq!(reserved_sum(&product), 5);
    }

    #[test]
    fn set_reservation_grows_and_shrinks() {
        let mut product = Product::new(10);
        product.set_reservation("c1", 6, 0).unwrap();
        assert_eq!(product.total_reserved, 6);

        product.set_reservation("c1", 2, 0).unwrap();
        assert_eq!(product.total_reserved, 2);

        product.set_reservation("c1", 0, 0).unwrap();
        assert!(product.reservations.is_empty());
        assert_eq!(product.total_reserved, 0);
    }

    #[test]
    fn set_reservation_admits_on_delta_only() {
        let mut product = Product::new(10);
        product.reserve("c1", 4, 0).unwrap();
        product.reserve("c2", 4, 0).unwrap();

        // c1 4 -> 6 needs 2 more: 8 + 2 <= 10
        product.set_reservation("c1", 6, 0).unwrap();
        // c2 4 -> 7 needs 3 more: 10 + 3 > 10
        let err = product.set_reservation("c2", 7, 0).unwrap_err();
        assert_eq!(err, InventoryError::InsufficientStock { available: 10 });
        assert_eq!(product.reservations["c2"].quantity, 4);
        assert_eq!(product.total_reserved, 10);
    }

    #[test]
    fn expire_removes_only_stale_entries() {
        let mut product = Product::new(100);
        product.reserve("old", 7, 1_000).unwrap();
        product.reserve("fresh", 3, 5_000).unwrap();

        let expired = product.expire(6_000, 2_000);
        assert_eq!(
            expired,
            vec![ExpiredReservation {
                client_id: "old".to_string(),
                quantity: 7
            }]
        );
        assert_eq!(product.total_reserved, 3);
        assert!(product.reservations.contains_key("fresh"));
    }

    #[test]
    fn expire_is_strictly_greater_than_ttl() {
        let mut product = Product::new(100);
        product.reserve("edge", 1, 1_000).unwrap();
        assert!(product.expire(3_000, 2_000).is_empty());
        assert_eq!(product.expire(3_001, 2_000).len(), 1);
    }

    #[test]
    fn replace_recomputes_total() {
        let mut product = Product::new(1);
        let mut entries = HashMap::new();
        entries.insert(
            "a".to_string(),
            ReservationEntry {
                quantity: 2,
                last_updated: 0,
            },
        );
        entries.insert(
            "empty".to_string(),
            ReservationEntry {
                quantity: 0,
                last_updated: 0,
            },
        );
        product.replace(20, entries);

        assert_eq!(product.stock, 20);
        assert_eq!(product.total_reserved, 2);
        assert!(!product.reservations.contains_key("empty"));
    }

    #[test]
    fn info_serializes_camel_case() {
        let product = Product::new(100);
        let json = serde_json::to_value(product.info()).unwrap();
        assert_eq!(json, serde_json::json!({"stock": 100, "totalReserved": 0}));
    }
}
