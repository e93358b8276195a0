//! Thread-safe inventory store with per-SKU locking.
//!
//! Two levels of locking:
//!
//! - a process-wide [`RwLock`] over the SKU set, write-locked only to add a
//!   SKU and read-locked just long enough to clone one product handle or to
//!   enumerate the set;
//! - one [`Mutex`] per product, held for the whole of every read-modify-write
//!   on that SKU.
//!
//! The SKU-set guard is always released before a product mutex is acquired,
//! so a slow operation on one SKU never serializes the others.

mod error;
mod product;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::clock::{ClockSource, SystemClock};
use crate::snapshot::{ProductSnapshot, ReservationSnapshot};

pub use error::InventoryError;
pub use product::{ExpiredReservation, ProductInfo, ReservationEntry};
use product::Product;

type ProductHandle = Arc<Mutex<Product>>;

/// Stock and reservation state for every known SKU.
///
/// Products are created by [`add_product`](Self::add_product) (or a snapshot
/// load) and never removed for the lifetime of the store.
pub struct InventoryStore {
    products: RwLock<HashMap<String, ProductHandle>>,
    clock: Arc<dyn ClockSource>,
}

impl InventoryStore {
    /// Creates an empty store stamping reservations with the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store with an injected clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            products: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Clones the product handle out from under the SKU-set lock.
    fn product(&self, sku: &str) -> Result<ProductHandle, InventoryError> {
        self.products
            .read()
            .get(sku)
            .cloned()
            .ok_or_else(|| InventoryError::not_found(sku))
    }

    /// Registers a new SKU with `initial_stock` and no reservations.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the SKU is already known. The existing
    /// product is left untouched.
    pub fn add_product(&self, sku: &str, initial_stock: u64) -> Result<(), InventoryError> {
        match self.products.write().entry(sku.to_string()) {
            Entry::Occupied(_) => {
                warn!(sku, "product already exists");
                Err(InventoryError::AlreadyExists {
                    sku: sku.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(Product::new(initial_stock))));
                debug!(sku, initial_stock, "product added");
                Ok(())
            }
        }
    }

    /// Overwrites the stock level. Existing reservations are kept as-is.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the SKU is unknown.
    pub fn set_stock(&self, sku: &str, qty: u64) -> Result<(), InventoryError> {
        self.product(sku)?.lock().stock = qty;
        Ok(())
    }

    /// Decrements stock, flooring at zero, and returns the resulting level.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the SKU is unknown.
    pub fn dec_stock(&self, sku: &str, qty: u64) -> Result<u64, InventoryError> {
        let handle = self.product(sku)?;
        let mut product = handle.lock();
        product.stock = product.stock.saturating_sub(qty);
        Ok(product.stock)
    }

    /// Returns the current stock level.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the SKU is unknown.
    pub fn get_stock(&self, sku: &str) -> Result<u64, InventoryError> {
        Ok(self.product(sku)?.lock().stock)
    }

    /// Reserves `qty` units of `sku` for `client_id`.
    ///
    /// This is the only admission-control point: the reservation is granted
    /// only if the SKU's reserved total plus `qty` still fits in stock, and
    /// the check and the increment happen under the same product lock.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown SKU and `InsufficientStock` (with no
    /// state change) when the reservation does not fit.
    pub fn reservation_add(
        &self,
        sku: &str,
        client_id: &str,
        qty: u64,
    ) -> Result<(), InventoryError> {
        let handle = self.product(sku)?;
        let now = self.clock.now();
        let result = handle.lock().reserve(client_id, qty, now);
        if let Err(InventoryError::InsufficientStock { available }) = &result {
            debug!(sku, client_id, qty, available, "reservation rejected");
        }
        result
    }

    /// Releases up to `qty` units of a client's reservation.
    ///
    /// Releasing from an absent reservation is a successful no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the SKU is unknown.
    pub fn reservation_del(
        &self,
        sku: &str,
        client_id: &str,
        qty: u64,
    ) -> Result<(), InventoryError> {
        let handle = self.product(sku)?;
        let now = self.clock.now();
        handle.lock().release(client_id, qty, now);
        Ok(())
    }

    /// Sets a client's reservation to exactly `qty`, admitting only the
    /// increase over the current quantity.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown SKU and `InsufficientStock` (with no
    /// state change) when the increase does not fit.
    pub fn reservation_set(
        &self,
        sku: &str,
        client_id: &str,
        qty: u64,
    ) -> Result<(), InventoryError> {
        let handle = self.product(sku)?;
        let now = self.clock.now();
        let mut product = handle.lock();
        product.set_reservation(client_id, qty, now)
    }

    /// Returns a client's reservation on a SKU, if any.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the SKU is unknown.
    pub fn reservation(
        &self,
        sku: &str,
        client_id: &str,
    ) -> Result<Option<ReservationEntry>, InventoryError> {
        Ok(self.product(sku)?.lock().reservations.get(client_id).copied())
    }

    /// Returns stock and reserved total, read atomically.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the SKU is unknown.
    pub fn info(&self, sku: &str) -> Result<ProductInfo, InventoryError> {
        Ok(self.product(sku)?.lock().info())
    }

    /// Point-in-time copy of the SKU set.
    #[must_use]
    pub fn skus(&self) -> Vec<String> {
        self.products.read().keys().cloned().collect()
    }

    /// Number of known SKUs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.products.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.products.read().is_empty()
    }

    /// Removes every reservation on `sku` that has not been touched for
    /// longer than `ttl`, returning what was removed.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the SKU is unknown.
    pub fn expire_reservations(
        &self,
        sku: &str,
        ttl: Duration,
    ) -> Result<Vec<ExpiredReservation>, InventoryError> {
        let handle = self.product(sku)?;
        let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let mut product = handle.lock();
        // Read the clock under the lock so a concurrent refresh of the same
        // entry cannot be stamped later than `now` and still be reaped.
        let now = self.clock.now();
        Ok(product.expire(now, ttl_millis))
    }

    /// Captures every product, sorted by SKU.
    ///
    /// Each product is copied under its own lock; the image is consistent
    /// per SKU but not across SKUs.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProductSnapshot> {
        let handles: Vec<(String, ProductHandle)> = self
            .products
            .read()
            .iter()
            .map(|(sku, handle)| (sku.clone(), Arc::clone(handle)))
            .collect();

        let mut products: Vec<ProductSnapshot> = handles
            .into_iter()
            .map(|(sku, handle)| {
                let product = handle.lock();
                let mut reservations: Vec<ReservationSnapshot> = product
                    .reservations
                    .iter()
                    .map(|(client_id, entry)| ReservationSnapshot {
                        client_id: client_id.clone(),
                        quantity: entry.quantity,
                        last_updated: entry.last_updated,
                    })
                    .collect();
                reservations.sort_by(|a, b| a.client_id.cmp(&b.client_id));
                ProductSnapshot {
                    sku,
                    stock: product.stock,
                    total_reserved: product.total_reserved,
                    reservations,
                }
            })
            .collect();
        products.sort_by(|a, b| a.sku.cmp(&b.sku));
        products
    }

    /// Repopulates the store from a snapshot, creating missing SKUs and
    /// overwriting the state of existing ones. SKUs absent from the snapshot
    /// are left alone.
    pub fn restore(&self, products: &[ProductSnapshot]) {
        for snap in products {
            let handle = {
                let mut set = self.products.write();
                Arc::clone(
                    set.entry(snap.sku.clone())
                        .or_insert_with(|| Arc::new(Mutex::new(Product::default()))),
                )
            };

            let reservations = snap
                .reservations
                .iter()
                .map(|r| {
                    (
                        r.client_id.clone(),
                        ReservationEntry {
                            quantity: r.quantity,
                            last_updated: r.last_updated,
                        },
                    )
                })
                .collect();
            handle.lock().replace(snap.stock, reservations);
        }
    }
}

impl Default for InventoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use proptest::prelude::*;

    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (InventoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (InventoryStore::with_clock(clock.clone()), clock)
    }

    fn assert_invariants(store: &InventoryStore, sku: &str) {
        let snap = store.snapshot();
        let product = snap.iter().find(|p| p.sku == sku).unwrap();
        let sum: u64 = product.reservations.iter().map(|r| r.quantity).sum();
        assert_eq!(product.total_reserved, sum, "total must equal sum of entries");
        assert!(
            product.total_reserved <= product.stock,
            "reserved {} exceeds stock {}",
            product.total_reserved,
            product.stock
        );
    }

    #[test]
    fn add_product_rejects_duplicates() {
        let store = InventoryStore::new();
        store.add_product("A", 5).unwrap();
        let err = store.add_product("A", 99).unwrap_err();
        assert_eq!(
            err,
            InventoryError::AlreadyExists {
                sku: "A".to_string()
            }
        );
        assert_eq!(store.get_stock("A").unwrap(), 5);
    }

    #[test]
    fn unknown_sku_is_not_found_everywhere() {
        let store = InventoryStore::new();
        let not_found = InventoryError::NotFound {
            sku: "nope".to_string(),
        };
        assert_eq!(store.get_stock("nope").unwrap_err(), not_found);
        assert_eq!(store.set_stock("nope", 1).unwrap_err(), not_found);
        assert_eq!(store.dec_stock("nope", 1).unwrap_err(), not_found);
        assert_eq!(store.info("nope").unwrap_err(), not_found);
        assert_eq!(store.reservation_add("nope", "c", 1).unwrap_err(), not_found);
        assert_eq!(store.reservation_del("nope", "c", 1).unwrap_err(), not_found);
        assert_eq!(store.reservation_set("nope", "c", 1).unwrap_err(), not_found);
    }

    #[test]
    fn dec_stock_floors_at_zero() {
        let store = InventoryStore::new();
        store.add_product("A", 5).unwrap();
        assert_eq!(store.dec_stock("A", 3).unwrap(), 2);
        assert_eq!(store.dec_stock("A", 10).unwrap(), 0);
        assert_eq!(store.get_stock("A").unwrap(), 0);
    }

    #[test]
    fn set_stock_overwrites() {
        let store = InventoryStore::new();
        store.add_product("A", 5).unwrap();
        store.set_stock("A", 42).unwrap();
        assert_eq!(store.get_stock("A").unwrap(), 42);
    }

    #[test]
    fn admission_control_keeps_first_reservation() {
        let store = InventoryStore::new();
        store.add_product("sku", 10).unwrap();

        store.reservation_add("sku", "c1", 6).unwrap();
        let err = store.reservation_add("sku", "c1", 5).unwrap_err();

        assert_eq!(err, InventoryError::InsufficientStock { available: 10 });
        assert_eq!(store.info("sku").unwrap().total_reserved, 6);
        assert_eq!(store.reservation("sku", "c1").unwrap().unwrap().quantity, 6);
    }

    #[test]
    fn reservation_del_on_absent_entry_is_noop() {
        let store = InventoryStore::new();
        store.add_product("sku", 10).unwrap();
        store.reservation_add("sku", "c1", 4).unwrap();

        let before = store.snapshot();
        store.reservation_del("sku", "ghost", 3).unwrap();
        store.reservation_del("sku", "ghost", 3).unwrap();
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn reservation_set_failure_leaves_state_unchanged() {
        let store = InventoryStore::new();
        store.add_product("sku", 10).unwrap();
        store.reservation_add("sku", "c1", 8).unwrap();

        let before = store.snapshot();
        let err = store.reservation_set("sku", "c2", 3).unwrap_err();
        assert_eq!(err, InventoryError::InsufficientStock { available: 10 });
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn reservations_are_stamped_with_the_clock() {
        let (store, clock) = store_with_clock();
        store.add_product("sku", 10).unwrap();
        store.reservation_add("sku", "c1", 1).unwrap();
        assert_eq!(
            store.reservation("sku", "c1").unwrap().unwrap().last_updated,
            1_000_000
        );

        clock.advance(500);
        store.reservation_set("sku", "c1", 2).unwrap();
        assert_eq!(
            store.reservation("sku", "c1").unwrap().unwrap().last_updated,
            1_000_500
        );
    }

    #[test]
    fn expiration_reclaims_exactly_the_stale_quantity() {
        let (store, clock) = store_with_clock();
        store.add_product("sku", 100).unwrap();
        store.reservation_add("sku", "stale", 30).unwrap();
        clock.advance(4_000);
        store.reservation_add("sku", "fresh", 20).unwrap();
        clock.advance(2_000);

        let expired = store
            .expire_reservations("sku", Duration::from_secs(5))
            .unwrap();

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].client_id, "stale");
        assert_eq!(expired[0].quantity, 30);
        assert_eq!(store.info("sku").unwrap().total_reserved, 20);
        assert!(store.reservation("sku", "fresh").unwrap().is_some());
    }

    #[test]
    fn refreshed_reservation_survives_expiration() {
        let (store, clock) = store_with_clock();
        store.add_product("sku", 100).unwrap();
        store.reservation_add("sku", "c1", 5).unwrap();
        clock.advance(4_000);
        store.reservation_add("sku", "c1", 0).unwrap();
        clock.advance(4_000);

        let expired = store
            .expire_reservations("sku", Duration::from_secs(5))
            .unwrap();
        assert!(expired.is_empty());
        assert_eq!(store.info("sku").unwrap().total_reserved, 5);
    }

    #[test]
    fn snapshot_restore_round_trip_into_fresh_store() {
        let store = InventoryStore::new();
        store.add_product("B", 7).unwrap();
        store.add_product("A", 10).unwrap();
        store.reservation_add("A", "c2", 3).unwrap();
        store.reservation_add("A", "c1", 2).unwrap();

        let snap = store.snapshot();
        assert_eq!(snap[0].sku, "A");
        assert_eq!(snap[0].reservations[0].client_id, "c1");

        let restored = InventoryStore::new();
        restored.restore(&snap);
        assert_eq!(restored.snapshot(), snap);
    }

    #[test]
    fn restore_overwrites_existing_and_keeps_unlisted() {
        let store = InventoryStore::new();
        store.add_product("A", 1).unwrap();
        store.add_product("keep", 9).unwrap();

        store.restore(&[ProductSnapshot {
            sku: "A".to_string(),
            stock: 50,
            total_reserved: 999,
            reservations: vec![ReservationSnapshot {
                client_id: "c1".to_string(),
                quantity: 4,
                last_updated: 1,
            }],
        }]);

        assert_eq!(
            store.info("A").unwrap(),
            ProductInfo {
                stock: 50,
                total_reserved: 4
            }
        );
        assert_eq!(store.get_stock("keep").unwrap(), 9);
    }

    #[test]
    fn concurrent_reservations_never_oversell() {
        const THREADS: usize = 16;
        let store = Arc::new(InventoryStore::new());
        store.add_product("hot", 100).unwrap();
        let barrier = Arc::new(Barrier::new(THREADS));

        let admitted: u64 = thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|i| {
                    let store = Arc::clone(&store);
                    let barrier = Arc::clone(&barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        let mut granted = 0;
                        for _ in 0..50 {
                            if store.reservation_add("hot", &format!("c{i}"), 1).is_ok() {
                                granted += 1;
                            }
                        }
                        granted
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(admitted, 100);
        assert_eq!(store.info("hot").unwrap().total_reserved, 100);
        assert_invariants(&store, "hot");
    }

    #[test]
    fn sequential_arrivals_admit_the_fitting_prefix() {
        let store = InventoryStore::new();
        store.add_product("sku", 10).unwrap();

        let outcomes: Vec<bool> = [4, 5, 3, 1, 2]
            .iter()
            .enumerate()
            .map(|(i, qty)| store.reservation_add("sku", &format!("c{i}"), *qty).is_ok())
            .collect();

        assert_eq!(outcomes, vec![true, true, false, true, false]);
        assert_eq!(store.info("sku").unwrap().total_reserved, 10);
    }

    #[test]
    fn independent_skus_do_not_block_each_other() {
        let store = Arc::new(InventoryStore::new());
        store.add_product("held", 1).unwrap();
        store.add_product("free", 1).unwrap();

        // Hold "held"'s product lock while another thread works on "free".
        let handle = store.product("held").unwrap();
        let guard = handle.lock();
        let other = Arc::clone(&store);
        thread::spawn(move || other.reservation_add("free", "c1", 1))
            .join()
            .unwrap()
            .unwrap();
        drop(guard);

        assert_eq!(store.info("free").unwrap().total_reserved, 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, u64),
        Del(u8, u64),
        Set(u8, u64),
        Expire(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, 0u64..40).prop_map(|(c, q)| Op::Add(c, q)),
            (0u8..4, 0u64..40).prop_map(|(c, q)| Op::Del(c, q)),
            (0u8..4, 0u64..40).prop_map(|(c, q)| Op::Set(c, q)),
            (0u64..3_000).prop_map(Op::Expire),
        ]
    }

    proptest! {
        #[test]
        fn reservation_invariants_hold(stock in 0u64..100, ops in prop::collection::vec(op_strategy(), 1..60)) {
            let (store, clock) = store_with_clock();
            store.add_product("p", stock).unwrap();

            for op in ops {
                clock.advance(100);
                match op {
                    Op::Add(c, q) => { let _ = store.reservation_add("p", &format!("c{c}"), q); }
                    Op::Del(c, q) => { store.reservation_del("p", &format!("c{c}"), q).unwrap(); }
                    Op::Set(c, q) => { let _ = store.reservation_set("p", &format!("c{c}"), q); }
                    Op::Expire(ttl) => { store.expire_reservations("p", Duration::from_millis(ttl)).unwrap(); }
                }
                assert_invariants(&store, "p");
            }
        }
    }
}
