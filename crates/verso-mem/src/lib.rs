//! PM arena and transaction shim.
//!
//! [`PmPool`] models the persistent-memory side of a storage target: a slot
//! arena of typed cells addressed by stable [`PmAddr`] offsets, with quota
//! accounting and an undo-logged transaction discipline. All mutation goes
//! through an active transaction; on abort every snapshotted cell is
//! restored byte-for-byte, transaction-local allocations vanish, and
//! transaction-local frees are un-freed. A crash mid-transaction is
//! indistinguishable from an abort, so the abort path is the crash-recovery
//! path.
//!
//! Nested `tx_begin` calls join the outer transaction; an inner abort is
//! sticky and forces the outer commit to fail. [`scoped_tx`] wraps the
//! begin/end pair so that exactly one commit or abort happens on every exit
//! path, including cancellation observed at the commit checkpoint.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use verso_error::{Result, VosError};
use verso_types::{Cx, FaultHook, NoFault, PmAddr};

// ---------------------------------------------------------------------------
// PmObject
// ---------------------------------------------------------------------------

/// A value that can live in a PM cell.
///
/// Cells are snapshotted for undo by cloning, so every PM-resident type is
/// `Clone`. The blanket impl covers all of them.
pub trait PmObject: Any + fmt::Debug {
    fn clone_cell(&self) -> Box<dyn PmObject>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Clone + fmt::Debug> PmObject for T {
    fn clone_cell(&self) -> Box<dyn PmObject> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// PmPool
// ---------------------------------------------------------------------------

struct Slot {
    cell: Option<Box<dyn PmObject>>,
    charge: u64,
}

enum UndoRecord {
    /// Cell was modified; restore the prior image.
    Modify {
        addr: PmAddr,
        prior: Box<dyn PmObject>,
    },
    /// Cell was allocated in this tx; undo removes it.
    Alloc { addr: PmAddr },
    /// Cell was freed in this tx; undo reinstates it.
    Free {
        addr: PmAddr,
        prior: Box<dyn PmObject>,
    },
}

struct TxState {
    depth: u32,
    aborted: bool,
    undo: Vec<UndoRecord>,
    /// Addresses already snapshotted this tx; one undo image per cell.
    touched: HashSet<u64>,
    /// Addresses freed this tx (idempotent free, deferred reclamation).
    freed: HashSet<u64>,
    /// `(slot, charge)` pairs reclaimed at commit.
    pending_free: Vec<(u64, u64)>,
}

/// The PM arena for one pool, owned by a single xstream.
pub struct PmPool {
    slots: Vec<Slot>,
    free_list: Vec<u64>,
    quota: u64,
    used: u64,
    root: PmAddr,
    tx: Option<TxState>,
    fault: Arc<dyn FaultHook>,
}

impl fmt::Debug for PmPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PmPool")
            .field("slots", &self.slots.len())
            .field("used", &self.used)
            .field("quota", &self.quota)
            .field("in_tx", &self.tx.is_some())
            .finish()
    }
}

impl PmPool {
    /// Create an arena with the given byte quota.
    #[must_use]
    pub fn new(quota: u64) -> Self {
        Self::with_fault_hook(quota, Arc::new(NoFault))
    }

    /// Create an arena with an installed fault hook.
    #[must_use]
    pub fn with_fault_hook(quota: u64, fault: Arc<dyn FaultHook>) -> Self {
        Self {
            // Slot zero backs PmAddr::NULL and is never handed out.
            slots: vec![Slot {
                cell: None,
                charge: 0,
            }],
            free_list: Vec::new(),
            quota,
            used: 0,
            root: PmAddr::NULL,
            tx: None,
            fault,
        }
    }

    /// The installed fault hook, consulted by upper layers at their own
    /// injection sites.
    pub fn fault_hook(&self) -> &Arc<dyn FaultHook> {
        &self.fault
    }

    /// Bytes currently charged against the quota.
    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// The pool root cell, set once at format time.
    pub fn root(&self) -> PmAddr {
        self.root
    }

    pub fn set_root(&mut self, root: PmAddr) {
        self.root = root;
    }

    #[inline]
    pub fn in_tx(&self) -> bool {
        self.tx.is_some()
    }

    // -- transactions -------------------------------------------------------

    /// Begin a transaction, joining the outer one if already active.
    pub fn tx_begin(&mut self) {
        match &mut self.tx {
            Some(tx) => tx.depth += 1,
            None => {
                self.tx = Some(TxState {
                    depth: 1,
                    aborted: false,
                    undo: Vec::new(),
                    touched: HashSet::new(),
                    freed: HashSet::new(),
                    pending_free: Vec::new(),
                });
            }
        }
    }

    /// End the innermost transaction scope.
    ///
    /// `ok = false` marks the whole transaction aborted; the abort itself
    /// happens when the outermost scope ends. Returns an error only on
    /// misuse (no active tx) or when a committing outer scope discovers a
    /// sticky inner abort.
    pub fn tx_end(&mut self, ok: bool) -> Result<()> {
        let tx = self.tx.as_mut().ok_or_else(|| {
            VosError::inval("tx_end without an active transaction")
        })?;
        if !ok {
            tx.aborted = true;
        }
        tx.depth -= 1;
        if tx.depth > 0 {
            return Ok(());
        }

        let tx = self.tx.take().expect("tx present at depth zero");
        if tx.aborted {
            self.rollback(tx);
            if ok {
                return Err(VosError::inval("inner transaction scope aborted"));
            }
            return Ok(());
        }
        self.commit(tx);
        Ok(())
    }

    fn commit(&mut self, tx: TxState) {
        for (slot, charge) in tx.pending_free {
            self.free_list.push(slot);
            self.used -= charge;
        }
        debug!(undo = tx.undo.len(), "pm tx commit");
    }

    fn rollback(&mut self, tx: TxState) {
        for rec in tx.undo.into_iter().rev() {
            match rec {
                UndoRecord::Modify { addr, prior } => {
                    self.slots[addr.raw() as usize].cell = Some(prior);
                }
                UndoRecord::Alloc { addr } => {
                    let slot = &mut self.slots[addr.raw() as usize];
                    slot.cell = None;
                    self.used -= slot.charge;
                    slot.charge = 0;
                    self.free_list.push(addr.raw());
                }
                UndoRecord::Free { addr, prior } => {
                    self.slots[addr.raw() as usize].cell = Some(prior);
                }
            }
        }
        warn!("pm tx aborted, state rolled back");
    }

    fn tx_mut(&mut self) -> Result<&mut TxState> {
        self.tx
            .as_mut()
            .ok_or_else(|| VosError::inval("no active transaction"))
    }

    // -- allocation ---------------------------------------------------------

    /// Allocate a cell holding `val`, charging `charge` bytes of quota.
    ///
    /// Must run inside a transaction; the allocation is undone on abort.
    pub fn alloc<T: PmObject>(&mut self, val: T, charge: u64) -> Result<PmAddr> {
        self.tx_mut()?;
        if self.used.saturating_add(charge) > self.quota {
            warn!(used = self.used, charge, quota = self.quota, "pm arena full");
            return Err(VosError::NoSpace);
        }
        let idx = match self.free_list.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot {
                    cell: None,
                    charge: 0,
                });
                (self.slots.len() - 1) as u64
            }
        };
        let slot = &mut self.slots[idx as usize];
        debug_assert!(slot.cell.is_none(), "allocating an occupied slot");
        slot.cell = Some(Box::new(val));
        slot.charge = charge;
        self.used += charge;
        let addr = PmAddr::from_raw(idx);
        let tx = self.tx.as_mut().expect("checked above");
        tx.undo.push(UndoRecord::Alloc { addr });
        Ok(addr)
    }

    /// Free the cell at `addr`. Idempotent within the same transaction;
    /// reclamation is deferred to commit so abort can reinstate the cell.
    pub fn free(&mut self, addr: PmAddr) -> Result<()> {
        if addr.is_null() {
            return Ok(());
        }
        let tx = self.tx_mut()?;
        if tx.freed.contains(&addr.raw()) {
            return Ok(());
        }
        tx.freed.insert(addr.raw());
        let slot = self
            .slots
            .get_mut(addr.raw() as usize)
            .ok_or_else(|| VosError::inval("free of an unallocated pm address"))?;
        let prior = slot
            .cell
            .take()
            .ok_or_else(|| VosError::inval("free of an unallocated pm address"))?;
        let charge = slot.charge;
        let tx = self.tx.as_mut().expect("checked above");
        tx.undo.push(UndoRecord::Free { addr, prior });
        tx.pending_free.push((addr.raw(), charge));
        Ok(())
    }

    // -- access -------------------------------------------------------------

    /// Read the cell at `addr`.
    pub fn get<T: PmObject>(&self, addr: PmAddr) -> Result<&T> {
        let slot = self
            .slots
            .get(addr.raw() as usize)
            .ok_or_else(|| VosError::inval("read of an unallocated pm address"))?;
        let cell: &dyn PmObject = slot
            .cell
            .as_ref()
            .ok_or_else(|| VosError::inval("read of a freed pm address"))?
            .as_ref();
        cell.as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| VosError::inval("pm cell type mismatch"))
    }

    /// Register `addr` for undo. The first registration per transaction
    /// snapshots the cell; later ones are no-ops.
    pub fn tx_add(&mut self, addr: PmAddr) -> Result<()> {
        let tx = self.tx_mut()?;
        if tx.touched.contains(&addr.raw()) {
            return Ok(());
        }
        let slot = self
            .slots
            .get(addr.raw() as usize)
            .ok_or_else(|| VosError::inval("tx_add of an unallocated pm address"))?;
        let prior = match &slot.cell {
            Some(cell) => {
                let cell: &dyn PmObject = cell.as_ref();
                cell.clone_cell()
            }
            None => return Err(VosError::inval("tx_add of a freed pm address")),
        };
        let tx = self.tx.as_mut().expect("checked above");
        tx.touched.insert(addr.raw());
        tx.undo.push(UndoRecord::Modify { addr, prior });
        Ok(())
    }

    /// Mutable access to the cell at `addr`, registering undo first.
    pub fn get_mut<T: PmObject>(&mut self, addr: PmAddr) -> Result<&mut T> {
        if self.tx.is_none() {
            return Err(VosError::inval("mutation outside a transaction"));
        }
        self.tx_add(addr)?;
        let slot = self
            .slots
            .get_mut(addr.raw() as usize)
            .ok_or_else(|| VosError::inval("read of an unallocated pm address"))?;
        let cell = slot
            .cell
            .as_mut()
            .ok_or_else(|| VosError::inval("read of a freed pm address"))?;
        cell.as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| VosError::inval("pm cell type mismatch"))
    }
}

// ---------------------------------------------------------------------------
// scoped_tx
// ---------------------------------------------------------------------------

/// Run `f` inside a transaction with exactly one commit/abort on every exit
/// path. Cancellation observed at the commit checkpoint aborts.
pub fn scoped_tx<T>(
    pool: &mut PmPool,
    cx: &Cx,
    f: impl FnOnce(&mut PmPool) -> Result<T>,
) -> Result<T> {
    pool.tx_begin();
    let mut rc = f(pool);
    // Commit is a suspension point; observe cancellation before it.
    if rc.is_ok() && cx.checkpoint().is_err() {
        rc = Err(VosError::Cancelled);
    }
    match (pool.tx_end(rc.is_ok()), rc) {
        (_, Err(e)) => Err(e),
        (Err(e), Ok(_)) => Err(e),
        (Ok(()), Ok(v)) => Ok(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> PmPool {
        PmPool::new(1 << 20)
    }

    #[test]
    fn alloc_get_roundtrip() {
        let mut p = pool();
        let cx = Cx::new();
        let addr = scoped_tx(&mut p, &cx, |p| p.alloc(42u64, 8)).unwrap();
        assert!(!addr.is_null());
        assert_eq!(*p.get::<u64>(addr).unwrap(), 42);
        assert_eq!(p.used(), 8);
    }

    #[test]
    fn type_mismatch_is_detected() {
        let mut p = pool();
        let cx = Cx::new();
        let addr = scoped_tx(&mut p, &cx, |p| p.alloc(42u64, 8)).unwrap();
        assert!(matches!(
            p.get::<String>(addr),
            Err(VosError::Inval { .. })
        ));
    }

    #[test]
    fn abort_undoes_allocation() {
        let mut p = pool();
        let cx = Cx::new();
        let rc: Result<()> = scoped_tx(&mut p, &cx, |p| {
            p.alloc(7u32, 4)?;
            Err(VosError::NonExist)
        });
        assert!(matches!(rc, Err(VosError::NonExist)));
        assert_eq!(p.used(), 0);
    }

    #[test]
    fn abort_restores_modified_cell() {
        let mut p = pool();
        let cx = Cx::new();
        let addr = scoped_tx(&mut p, &cx, |p| p.alloc(vec![1u8, 2, 3], 3)).unwrap();

        let rc: Result<()> = scoped_tx(&mut p, &cx, |p| {
            p.get_mut::<Vec<u8>>(addr)?.push(4);
            assert_eq!(p.get::<Vec<u8>>(addr).unwrap().len(), 4);
            Err(VosError::Again)
        });
        assert!(rc.is_err());
        assert_eq!(p.get::<Vec<u8>>(addr).unwrap(), &vec![1u8, 2, 3]);
    }

    #[test]
    fn abort_reinstates_freed_cell() {
        let mut p = pool();
        let cx = Cx::new();
        let addr = scoped_tx(&mut p, &cx, |p| p.alloc(9u64, 8)).unwrap();

        let rc: Result<()> = scoped_tx(&mut p, &cx, |p| {
            p.free(addr)?;
            assert!(p.get::<u64>(addr).is_err());
            Err(VosError::Again)
        });
        assert!(rc.is_err());
        assert_eq!(*p.get::<u64>(addr).unwrap(), 9);
        assert_eq!(p.used(), 8);
    }

    #[test]
    fn free_is_idempotent_within_tx() {
        let mut p = pool();
        let cx = Cx::new();
        let addr = scoped_tx(&mut p, &cx, |p| p.alloc(9u64, 8)).unwrap();
        scoped_tx(&mut p, &cx, |p| {
            p.free(addr)?;
            p.free(addr)?;
            p.free(addr)
        })
        .unwrap();
        assert_eq!(p.used(), 0);
    }

    #[test]
    fn freed_slot_is_reused_after_commit() {
        let mut p = pool();
        let cx = Cx::new();
        let a = scoped_tx(&mut p, &cx, |p| p.alloc(1u64, 8)).unwrap();
        scoped_tx(&mut p, &cx, |p| p.free(a)).unwrap();
        let b = scoped_tx(&mut p, &cx, |p| p.alloc(2u64, 8)).unwrap();
        assert_eq!(a, b);
        assert_eq!(*p.get::<u64>(b).unwrap(), 2);
    }

    #[test]
    fn quota_enforced() {
        let mut p = PmPool::new(16);
        let cx = Cx::new();
        let rc = scoped_tx(&mut p, &cx, |p| {
            p.alloc(0u64, 8)?;
            p.alloc(0u64, 16)
        });
        assert!(matches!(rc, Err(VosError::NoSpace)));
        // The whole tx aborted, including the first allocation.
        assert_eq!(p.used(), 0);
    }

    #[test]
    fn nested_scopes_join_and_inner_abort_is_sticky() {
        let mut p = pool();
        let cx = Cx::new();
        p.tx_begin();
        let addr = p.alloc(1u64, 8).unwrap();
        p.tx_begin();
        *p.get_mut::<u64>(addr).unwrap() = 2;
        p.tx_end(false).unwrap();
        // Outer scope believes it succeeded, but the inner abort wins.
        assert!(p.tx_end(true).is_err());
        assert!(p.get::<u64>(addr).is_err());
        assert_eq!(p.used(), 0);
    }

    #[test]
    fn mutation_outside_tx_is_rejected() {
        let mut p = pool();
        let cx = Cx::new();
        let addr = scoped_tx(&mut p, &cx, |p| p.alloc(1u64, 8)).unwrap();
        assert!(p.get_mut::<u64>(addr).is_err());
        assert!(p.alloc(2u64, 8).is_err());
        assert!(p.free(addr).is_err());
    }

    #[test]
    fn cancellation_aborts_at_commit() {
        let mut p = pool();
        let cx = Cx::new();
        let rc = scoped_tx(&mut p, &cx, |p| {
            let addr = p.alloc(1u64, 8)?;
            cx.cancel();
            Ok(addr)
        });
        assert!(matches!(rc, Err(VosError::Cancelled)));
        assert_eq!(p.used(), 0);
    }

    #[test]
    fn snapshot_taken_once_per_tx() {
        let mut p = pool();
        let cx = Cx::new();
        let addr = scoped_tx(&mut p, &cx, |p| p.alloc(0u64, 8)).unwrap();
        let rc: Result<()> = scoped_tx(&mut p, &cx, |p| {
            *p.get_mut::<u64>(addr)? = 1;
            *p.get_mut::<u64>(addr)? = 2;
            *p.get_mut::<u64>(addr)? = 3;
            Err(VosError::Again)
        });
        assert!(rc.is_err());
        // Restored to the pre-tx image, not an intermediate one.
        assert_eq!(*p.get::<u64>(addr).unwrap(), 0);
    }
}
