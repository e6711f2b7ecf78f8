//! Tranche partitioning.
//!
//! Owns the per-`(symbol, position_side)` tranche books. Each book is an
//! ordered list of tranches plus the next id; ids are monotonic per key and
//! never reused. All mutation happens under the book's async lock, which the
//! caller holds across the protection I/O that follows so the whole
//! fill -> tranche -> protection sequence is serialized per key.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{Config, TranchePnlBasis};
use crate::models::{PositionKey, PositionSide, Tranche};
use crate::store::Store;

/// The partitioning rules a book needs from configuration.
#[derive(Debug, Clone, Copy)]
pub struct TrancheRules {
    pub increment_pct: f64,
    pub basis: TranchePnlBasis,
    pub max_tranches: u32,
}

impl TrancheRules {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            increment_pct: cfg.tranche_pnl_increment_pct,
            basis: cfg.tranche_pnl_basis,
            max_tranches: cfg.max_tranches_per_symbol_side,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    Absorbed { tranche_id: u64 },
    Created { tranche_id: u64 },
}

/// What the caller must do after an entry fill was applied.
#[derive(Debug, Clone)]
pub struct EntryOutcome {
    pub action: EntryAction,
    /// Tranches whose protection must be rebuilt or placed.
    pub rebuild: Vec<u64>,
    /// Protective order ids orphaned by a merge; cancel them.
    pub cancel_orders: Vec<i64>,
    /// `(kept, removed)` when a merge was forced by the tranche cap.
    pub merged: Option<(u64, u64)>,
}

#[derive(Debug)]
pub enum ReduceOutcome {
    /// Quantity reached zero; the destroyed tranche is returned so the
    /// caller can cancel its companion order and clear breaker state.
    Removed { tranche: Tranche },
    /// Partial reduction; protection must be resized.
    Reduced { tranche_id: u64, remaining: f64 },
    UnknownTranche,
}

#[derive(Debug)]
pub struct TrancheBook {
    pub key: PositionKey,
    /// Ordered by tranche id ascending.
    pub tranches: Vec<Tranche>,
    next_id: u64,
}

impl TrancheBook {
    pub fn new(key: PositionKey) -> Self {
        Self {
            key,
            tranches: Vec::new(),
            next_id: 0,
        }
    }

    pub fn from_stored(key: PositionKey, tranches: Vec<Tranche>) -> Self {
        let next_id = tranches.iter().map(|t| t.tranche_id + 1).max().unwrap_or(0);
        Self {
            key,
            tranches,
            next_id,
        }
    }

    pub fn total_qty(&self) -> f64 {
        self.tranches.iter().map(|t| t.quantity).sum()
    }

    pub fn total_notional(&self) -> f64 {
        self.tranches.iter().map(|t| t.notional()).sum()
    }

    /// Weighted-average entry across all tranches.
    pub fn aggregate_entry(&self) -> Option<f64> {
        let qty = self.total_qty();
        if qty <= 0.0 {
            return None;
        }
        Some(self.tranches.iter().map(|t| t.avg_entry_price * t.quantity).sum::<f64>() / qty)
    }

    fn basis_entry(&self, basis: TranchePnlBasis) -> Option<f64> {
        match basis {
            TranchePnlBasis::Aggregate => self.aggregate_entry(),
            TranchePnlBasis::Latest => self.tranches.last().map(|t| t.avg_entry_price),
        }
    }

    pub fn get(&self, tranche_id: u64) -> Option<&Tranche> {
        self.tranches.iter().find(|t| t.tranche_id == tranche_id)
    }

    pub fn get_mut(&mut self, tranche_id: u64) -> Option<&mut Tranche> {
        self.tranches.iter_mut().find(|t| t.tranche_id == tranche_id)
    }

    fn create_tranche(&mut self, qty: f64, price: f64, now_ms: i64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.tranches.push(Tranche {
            tranche_id: id,
            symbol: self.key.symbol.clone(),
            position_side: self.key.position_side,
            avg_entry_price: price,
            quantity: qty,
            created_at: now_ms,
            updated_at: now_ms,
            tp_order_id: None,
            sl_order_id: None,
            unprotected: false,
        });
        id
    }

    /// Open a synthetic tranche for quantity the venue holds but no tranche
    /// accounts for (reconciler recovery path).
    pub fn create_recovery_tranche(&mut self, qty: f64, price: f64, now_ms: i64) -> u64 {
        self.create_tranche(qty, price, now_ms)
    }

    /// Apply an entry fill per the assignment rule: absorb into the most
    /// recent tranche while the aggregate is above the adverse increment,
    /// otherwise open a new tranche (merging first when at the cap).
    pub fn apply_entry_fill(
        &mut self,
        qty: f64,
        price: f64,
        now_ms: i64,
        rules: &TrancheRules,
    ) -> EntryOutcome {
        let side = self.key.position_side;

        let pnl_pct = self
            .basis_entry(rules.basis)
            .map(|entry| side.signed_return_pct(entry, price));

        match pnl_pct {
            // Aggregate is underwater by at least the increment (or this is
            // the first fill): open a new tranche. The boundary itself
            // creates.
            None => {
                let id = self.create_tranche(qty, price, now_ms);
                EntryOutcome {
                    action: EntryAction::Created { tranche_id: id },
                    rebuild: vec![id],
                    cancel_orders: Vec::new(),
                    merged: None,
                }
            }
            Some(pnl) if pnl <= -rules.increment_pct => {
                let mut cancel_orders = Vec::new();
                let mut rebuild = Vec::new();
                let mut merged = None;

                if self.tranches.len() as u32 >= rules.max_tranches {
                    match self.merge_most_favorable(now_ms) {
                        Some((kept, removed, orphans)) => {
                            cancel_orders.extend(orphans);
                            rebuild.push(kept);
                            merged = Some((kept, removed));
                        }
                        // Cap of one: nothing to merge, average instead.
                        None => {
                            let t = self
                                .tranches
                                .last_mut()
                                .expect("at cap implies at least one tranche");
                            t.absorb(qty, price, now_ms);
                            let id = t.tranche_id;
                            return EntryOutcome {
                                action: EntryAction::Absorbed { tranche_id: id },
                                rebuild: vec![id],
                                cancel_orders: Vec::new(),
                                merged: None,
                            };
                        }
                    }
                }

                let id = self.create_tranche(qty, price, now_ms);
                rebuild.push(id);
                EntryOutcome {
                    action: EntryAction::Created { tranche_id: id },
                    rebuild,
                    cancel_orders,
                    merged,
                }
            }
            Some(_) => {
                // Absorb into the most recent tranche.
                let t = self
                    .tranches
                    .last_mut()
                    .expect("basis_entry is Some, so tranches is non-empty");
                t.absorb(qty, price, now_ms);
                let id = t.tranche_id;
                EntryOutcome {
                    action: EntryAction::Absorbed { tranche_id: id },
                    rebuild: vec![id],
                    cancel_orders: Vec::new(),
                    merged: None,
                }
            }
        }
    }

    /// Merge the pair whose combined weighted-average entry is most
    /// favorable for the position side. The lower-id tranche of the pair
    /// survives; the other's protective order ids are returned for
    /// cancellation.
    fn merge_most_favorable(&mut self, now_ms: i64) -> Option<(u64, u64, Vec<i64>)> {
        let pair = self.best_merge_pair()?;
        Some(self.merge(pair.0, pair.1, now_ms))
    }

    fn best_merge_pair(&self) -> Option<(u64, u64)> {
        if self.tranches.len() < 2 {
            return None;
        }
        let side = self.key.position_side;
        let mut best: Option<(u64, u64, f64)> = None;
        for i in 0..self.tranches.len() {
            for j in (i + 1)..self.tranches.len() {
                let a = &self.tranches[i];
                let b = &self.tranches[j];
                let qty = a.quantity + b.quantity;
                if qty <= 0.0 {
                    continue;
                }
                let combined =
                    (a.avg_entry_price * a.quantity + b.avg_entry_price * b.quantity) / qty;
                // Favorable = lower entry for LONG, higher for SHORT.
                let score = match side {
                    PositionSide::Long => -combined,
                    PositionSide::Short => combined,
                };
                if best.map(|(_, _, s)| score > s).unwrap_or(true) {
                    best = Some((a.tranche_id, b.tranche_id, score));
                }
            }
        }
        best.map(|(a, b, _)| (a, b))
    }

    /// Merge `from` into `into` and drop `from`. Returns `(kept, removed,
    /// orphaned protective order ids)`.
    pub fn merge(&mut self, into: u64, from: u64, now_ms: i64) -> (u64, u64, Vec<i64>) {
        let from_idx = self
            .tranches
            .iter()
            .position(|t| t.tranche_id == from)
            .expect("merge source exists");
        let removed = self.tranches.remove(from_idx);
        let kept = self
            .get_mut(into)
            .expect("merge target exists");
        kept.absorb(removed.quantity, removed.avg_entry_price, now_ms);
        let orphans: Vec<i64> = removed
            .tp_order_id
            .into_iter()
            .chain(removed.sl_order_id)
            .collect();
        (into, from, orphans)
    }

    /// A pair whose combined position is currently profitable at `mark`,
    /// if any. Used by the reconciler's opportunistic merge pass.
    pub fn profitable_merge_pair(&self, mark: f64) -> Option<(u64, u64)> {
        if self.tranches.len() < 2 || mark <= 0.0 {
            return None;
        }
        let side = self.key.position_side;
        for i in 0..self.tranches.len() {
            for j in (i + 1)..self.tranches.len() {
                let a = &self.tranches[i];
                let b = &self.tranches[j];
                let qty = a.quantity + b.quantity;
                if qty <= 0.0 {
                    continue;
                }
                let combined =
                    (a.avg_entry_price * a.quantity + b.avg_entry_price * b.quantity) / qty;
                if side.signed_return_pct(combined, mark) > 0.0 {
                    return Some((a.tranche_id, b.tranche_id));
                }
            }
        }
        None
    }

    /// Subtract a reduce fill (TP/SL/close) from a tranche.
    pub fn apply_reduction(&mut self, tranche_id: u64, qty: f64, now_ms: i64) -> ReduceOutcome {
        let Some(idx) = self.tranches.iter().position(|t| t.tranche_id == tranche_id) else {
            return ReduceOutcome::UnknownTranche;
        };
        let t = &mut self.tranches[idx];
        let remaining = t.quantity - qty;
        // Step-size noise at full reduction collapses to zero.
        if remaining <= f64::EPSILON.max(t.quantity * 1e-9) {
            let tranche = self.tranches.remove(idx);
            ReduceOutcome::Removed { tranche }
        } else {
            t.quantity = remaining;
            t.updated_at = now_ms;
            ReduceOutcome::Reduced {
                tranche_id,
                remaining,
            }
        }
    }
}

/// Registry of tranche books, one async lock per key. Books load lazily from
/// the store and persist after every mutation.
pub struct TranchePartitioner {
    store: Store,
    rules: TrancheRules,
    books: RwLock<HashMap<PositionKey, Arc<Mutex<TrancheBook>>>>,
}

impl TranchePartitioner {
    pub fn new(store: Store, rules: TrancheRules) -> Self {
        Self {
            store,
            rules,
            books: RwLock::new(HashMap::new()),
        }
    }

    pub fn rules(&self) -> TrancheRules {
        self.rules
    }

    /// Get or lazily load the book for a key.
    pub async fn book(&self, key: &PositionKey) -> Result<Arc<Mutex<TrancheBook>>> {
        if let Some(book) = self.books.read().get(key) {
            return Ok(book.clone());
        }
        let stored = self
            .store
            .list_tranches(&key.symbol, key.position_side)
            .await?;
        let mut books = self.books.write();
        // Double-checked: another task may have loaded it meanwhile.
        if let Some(book) = books.get(key) {
            return Ok(book.clone());
        }
        let book = Arc::new(Mutex::new(TrancheBook::from_stored(key.clone(), stored)));
        books.insert(key.clone(), book.clone());
        Ok(book)
    }

    /// Book for a key only if it is already resident; the fast path must
    /// not conjure empty books for symbols with no position.
    pub fn book_if_loaded(&self, key: &PositionKey) -> Option<Arc<Mutex<TrancheBook>>> {
        self.books.read().get(key).cloned()
    }

    /// Preload every persisted book on startup.
    pub async fn recover(&self) -> Result<usize> {
        let all = self.store.list_all_tranches().await?;
        let mut grouped: HashMap<PositionKey, Vec<Tranche>> = HashMap::new();
        for t in all {
            grouped
                .entry(PositionKey::new(t.symbol.clone(), t.position_side))
                .or_default()
                .push(t);
        }
        let count = grouped.values().map(|v| v.len()).sum();
        let mut books = self.books.write();
        for (key, tranches) in grouped {
            books.insert(
                key.clone(),
                Arc::new(Mutex::new(TrancheBook::from_stored(key, tranches))),
            );
        }
        info!(tranches = count, "tranche books recovered from store");
        Ok(count)
    }

    pub fn loaded_keys(&self) -> Vec<PositionKey> {
        self.books.read().keys().cloned().collect()
    }

    /// Persist the current state of a book after a mutation, including the
    /// deletion of `removed` ids.
    pub async fn persist(&self, book: &TrancheBook, removed: &[u64]) -> Result<()> {
        for id in removed {
            self.store
                .delete_tranche(&book.key.symbol, book.key.position_side, *id)
                .await?;
        }
        for t in &book.tranches {
            self.store.upsert_tranche(t).await?;
        }
        debug!(key = %book.key, tranches = book.tranches.len(), "tranche book persisted");
        Ok(())
    }

    /// Snapshot of every live tranche, for projections and reconciliation.
    pub async fn snapshot(&self) -> Vec<Tranche> {
        let books: Vec<Arc<Mutex<TrancheBook>>> =
            self.books.read().values().cloned().collect();
        let mut out = Vec::new();
        for book in books {
            let book = book.lock().await;
            out.extend(book.tranches.iter().cloned());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> TrancheRules {
        TrancheRules {
            increment_pct: 5.0,
            basis: TranchePnlBasis::Aggregate,
            max_tranches: 5,
        }
    }

    fn long_book() -> TrancheBook {
        TrancheBook::new(PositionKey::new("BTCUSDT", PositionSide::Long))
    }

    #[test]
    fn first_fill_creates_tranche_zero() {
        let mut book = long_book();
        let out = book.apply_entry_fill(0.016, 60_000.0, 1, &rules());
        assert_eq!(out.action, EntryAction::Created { tranche_id: 0 });
        assert_eq!(out.rebuild, vec![0]);
        assert_eq!(book.tranches.len(), 1);
    }

    #[test]
    fn small_adverse_fill_absorbs_into_latest() {
        let mut book = long_book();
        book.apply_entry_fill(0.016, 60_000.0, 1, &rules());
        // -0.67% vs 60k: above -5%, absorb.
        let out = book.apply_entry_fill(0.016, 59_600.0, 2, &rules());
        assert_eq!(out.action, EntryAction::Absorbed { tranche_id: 0 });
        assert_eq!(book.tranches.len(), 1);
        assert!((book.tranches[0].avg_entry_price - 59_800.0).abs() < 1e-9);
    }

    #[test]
    fn deep_adverse_fill_creates_second_tranche() {
        let mut book = long_book();
        book.apply_entry_fill(0.016, 60_000.0, 1, &rules());
        // -5.33% vs 60k: below -5%, new tranche; tranche 0 untouched.
        let out = book.apply_entry_fill(0.016, 56_800.0, 2, &rules());
        assert_eq!(out.action, EntryAction::Created { tranche_id: 1 });
        assert_eq!(book.tranches.len(), 2);
        assert!((book.tranches[0].avg_entry_price - 60_000.0).abs() < 1e-9);
        assert!((book.tranches[1].avg_entry_price - 56_800.0).abs() < 1e-9);
    }

    #[test]
    fn boundary_exactly_at_increment_creates() {
        let mut book = long_book();
        book.apply_entry_fill(1.0, 100.0, 1, &rules());
        // Exactly -5.0%: the boundary creates, not absorbs.
        let out = book.apply_entry_fill(1.0, 95.0, 2, &rules());
        assert_eq!(out.action, EntryAction::Created { tranche_id: 1 });
    }

    #[test]
    fn favorable_fill_absorbs() {
        let mut book = long_book();
        book.apply_entry_fill(1.0, 100.0, 1, &rules());
        let out = book.apply_entry_fill(1.0, 103.0, 2, &rules());
        assert_eq!(out.action, EntryAction::Absorbed { tranche_id: 0 });
    }

    #[test]
    fn cap_forces_merge_then_creates() {
        let capped = TrancheRules {
            max_tranches: 2,
            ..rules()
        };
        let mut book = long_book();
        book.apply_entry_fill(1.0, 100.0, 1, &capped);
        book.apply_entry_fill(1.0, 94.0, 2, &capped); // tranche 1
        assert_eq!(book.tranches.len(), 2);

        book.get_mut(0).unwrap().tp_order_id = Some(101);
        book.get_mut(0).unwrap().sl_order_id = Some(102);
        book.get_mut(1).unwrap().tp_order_id = Some(103);
        book.get_mut(1).unwrap().sl_order_id = Some(104);

        // Aggregate entry (100+94)/2 = 97; 88 is ~-9.3%: create, but cap hits.
        let out = book.apply_entry_fill(1.0, 88.0, 3, &capped);
        assert_eq!(out.action, EntryAction::Created { tranche_id: 2 });
        assert_eq!(out.merged, Some((0, 1)));
        // Orphaned protective ids belong to the removed tranche 1.
        assert_eq!(out.cancel_orders, vec![103, 104]);
        assert_eq!(book.tranches.len(), 2);
        // Id monotonicity: merged pair left ids 0; new tranche got 2.
        let ids: Vec<u64> = book.tranches.iter().map(|t| t.tranche_id).collect();
        assert_eq!(ids, vec![0, 2]);
        // Merged tranche 0 carries the combined weighted average.
        assert!((book.get(0).unwrap().avg_entry_price - 97.0).abs() < 1e-9);
        assert!((book.get(0).unwrap().quantity - 2.0).abs() < 1e-12);
    }

    #[test]
    fn cap_of_one_averages_instead_of_merging() {
        let capped = TrancheRules {
            max_tranches: 1,
            ..rules()
        };
        let mut book = long_book();
        book.apply_entry_fill(1.0, 100.0, 1, &capped);
        // Deep adverse fill would open a tranche, but there is nothing to
        // merge with a cap of one; it averages into the only tranche.
        let out = book.apply_entry_fill(1.0, 90.0, 2, &capped);
        assert_eq!(out.action, EntryAction::Absorbed { tranche_id: 0 });
        assert_eq!(book.tranches.len(), 1);
        assert!((book.tranches[0].avg_entry_price - 95.0).abs() < 1e-9);
    }

    #[test]
    fn merge_pair_is_most_favorable_for_side() {
        let mut book = long_book();
        let r = TrancheRules {
            max_tranches: 10,
            ..rules()
        };
        book.apply_entry_fill(1.0, 100.0, 1, &r);
        book.apply_entry_fill(1.0, 90.0, 2, &r);
        book.apply_entry_fill(1.0, 80.0, 3, &r);
        // For LONG the most favorable (lowest) combined average is 90+80.
        assert_eq!(book.best_merge_pair(), Some((1, 2)));

        let mut short_book = TrancheBook::new(PositionKey::new("BTCUSDT", PositionSide::Short));
        short_book.apply_entry_fill(1.0, 100.0, 1, &r);
        short_book.apply_entry_fill(1.0, 110.0, 2, &r);
        short_book.apply_entry_fill(1.0, 120.0, 3, &r);
        // For SHORT the highest combined average wins.
        assert_eq!(short_book.best_merge_pair(), Some((1, 2)));
    }

    #[test]
    fn reduction_to_zero_removes_tranche() {
        let mut book = long_book();
        book.apply_entry_fill(0.016, 60_000.0, 1, &rules());
        match book.apply_reduction(0, 0.016, 2) {
            ReduceOutcome::Removed { tranche } => {
                assert_eq!(tranche.tranche_id, 0);
            }
            other => panic!("expected Removed, got {other:?}"),
        }
        assert!(book.tranches.is_empty());
        // Next tranche id keeps climbing; ids are never reused.
        let out = book.apply_entry_fill(0.01, 50_000.0, 3, &rules());
        assert_eq!(out.action, EntryAction::Created { tranche_id: 1 });
    }

    #[test]
    fn partial_reduction_shrinks() {
        let mut book = long_book();
        book.apply_entry_fill(0.02, 60_000.0, 1, &rules());
        match book.apply_reduction(0, 0.01, 2) {
            ReduceOutcome::Reduced {
                tranche_id,
                remaining,
            } => {
                assert_eq!(tranche_id, 0);
                assert!((remaining - 0.01).abs() < 1e-12);
            }
            other => panic!("expected Reduced, got {other:?}"),
        }
    }

    #[test]
    fn latest_basis_uses_most_recent_tranche() {
        let latest_rules = TrancheRules {
            basis: TranchePnlBasis::Latest,
            ..rules()
        };
        let mut book = long_book();
        book.apply_entry_fill(1.0, 100.0, 1, &latest_rules);
        book.apply_entry_fill(1.0, 94.0, 2, &latest_rules); // tranche 1 at 94
        // 90 vs latest entry 94 is -4.26%: absorbs under `latest`...
        let out = book.apply_entry_fill(1.0, 90.0, 3, &latest_rules);
        assert_eq!(out.action, EntryAction::Absorbed { tranche_id: 1 });
        // ...while the aggregate basis (97 -> -7.2%) would have created.
    }

    #[test]
    fn profitable_pair_detection() {
        let mut book = long_book();
        let r = TrancheRules {
            max_tranches: 10,
            ..rules()
        };
        book.apply_entry_fill(1.0, 100.0, 1, &r);
        book.apply_entry_fill(1.0, 90.0, 2, &r);
        // Mark 96 beats the combined 95 average: profitable pair exists.
        assert_eq!(book.profitable_merge_pair(96.0), Some((0, 1)));
        // Mark 94 does not.
        assert_eq!(book.profitable_merge_pair(94.0), None);
    }

    #[test]
    fn replaying_fills_rebuilds_equivalent_book() {
        let r = rules();
        let fills = [
            (0.016, 60_000.0),
            (0.016, 59_600.0),
            (0.02, 56_800.0),
            (0.01, 56_500.0),
        ];
        let mut a = long_book();
        let mut b = long_book();
        for (i, (qty, price)) in fills.iter().enumerate() {
            a.apply_entry_fill(*qty, *price, i as i64, &r);
        }
        for (i, (qty, price)) in fills.iter().enumerate() {
            b.apply_entry_fill(*qty, *price, i as i64, &r);
        }
        assert_eq!(a.tranches.len(), b.tranches.len());
        for (ta, tb) in a.tranches.iter().zip(b.tranches.iter()) {
            assert_eq!(ta.tranche_id, tb.tranche_id);
            assert!((ta.quantity - tb.quantity).abs() < 1e-12);
            assert!((ta.avg_entry_price - tb.avg_entry_price).abs() < 1e-9);
        }
    }
}
