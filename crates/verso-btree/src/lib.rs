//! KBTR: the ordered key btree.
//!
//! An ordered map keyed by the composite `(key bytes, epoch)` with a
//! class-specific comparator on the byte dimension and **descending** order
//! on the epoch dimension, so that a `Ge` probe with the `matched` modifier
//! lands on the most recent version at or below the requested epoch. This
//! ordering is the cornerstone of multiversion lookup; everything above
//! (dkey trees, akey trees, single-value trees) is built on it.
//!
//! Nodes are PM cells with embedded keys: leaves carry `(key, record)`
//! pairs, interior nodes carry separator keys and child addresses. Records
//! are opaque [`PmAddr`]s; their availability under a probing intent is
//! delegated to a [`RecordCheck`] so the DTX seam stays outside the tree.
//!
//! Deletion is the aggregation path only: entries are removed without
//! rebalancing, and nodes are unlinked once empty.

use std::cmp::Ordering;

use smallvec::SmallVec;
use tracing::debug;

use verso_error::{Result, VosError};
use verso_mem::PmPool;
use verso_types::limits::{BTR_MAX_DEPTH, BTR_ORDER};
use verso_types::{Epoch, FaultSite, Intent, KeyClass, PmAddr};

/// Nominal quota charge for one btree node.
const NODE_CHARGE: u64 = 4096;

// ---------------------------------------------------------------------------
// On-PM layout
// ---------------------------------------------------------------------------

/// Composite key: class-ordered bytes, then epoch descending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtrKey {
    pub key: Vec<u8>,
    pub epoch: Epoch,
}

impl BtrKey {
    #[must_use]
    pub fn new(key: &[u8], epoch: Epoch) -> Self {
        Self {
            key: key.to_vec(),
            epoch,
        }
    }
}

/// Tree root cell.
#[derive(Debug, Clone)]
pub struct BtrRoot {
    pub class: KeyClass,
    node: PmAddr,
}

/// One tree node. Leaves hold `keys[i] -> recs[i]`; interior nodes hold
/// `children.len() == keys.len() + 1` with `children[i]` covering composites
/// below `keys[i]` and `children[i+1]` covering `keys[i]` and above.
#[derive(Debug, Clone)]
struct BtrNode {
    leaf: bool,
    keys: Vec<BtrKey>,
    recs: Vec<PmAddr>,
    children: Vec<PmAddr>,
}

impl BtrNode {
    fn new_leaf() -> Self {
        Self {
            leaf: true,
            keys: Vec::new(),
            recs: Vec::new(),
            children: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Record availability (DTX seam)
// ---------------------------------------------------------------------------

/// Availability of a record under a probing intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAvail {
    Visible,
    /// Skipped by probes as if absent.
    Invisible,
    /// Blocked by an uncommitted modification; surfaces as `InProgress`.
    Blocked,
}

/// Intent-aware record availability check.
///
/// The tree never interprets record cells; the layer that owns them decides
/// what a probe may observe.
pub trait RecordCheck {
    fn available(&self, pool: &PmPool, rec: PmAddr, intent: Intent) -> Result<RecordAvail>;
}

/// Every record is visible. Standalone default.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllVisible;

impl RecordCheck for AllVisible {
    fn available(&self, _pool: &PmPool, _rec: PmAddr, _intent: Intent) -> Result<RecordAvail> {
        Ok(RecordAvail::Visible)
    }
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

fn cmp_composite(class: KeyClass, entry: &BtrKey, key: &[u8], epoch: Epoch) -> Ordering {
    class
        .compare(&entry.key, key)
        .then(entry.epoch.cmp(&epoch).reverse())
}

/// First index in `keys` whose composite is `>=` the probe.
fn lower_bound(class: KeyClass, keys: &[BtrKey], key: &[u8], epoch: Epoch) -> usize {
    keys.partition_point(|e| cmp_composite(class, e, key, epoch) == Ordering::Less)
}

/// Child index covering the probe composite in an interior node.
fn child_index(class: KeyClass, keys: &[BtrKey], key: &[u8], epoch: Epoch) -> usize {
    keys.partition_point(|e| cmp_composite(class, e, key, epoch) != Ordering::Greater)
}

// ---------------------------------------------------------------------------
// Tree lifecycle
// ---------------------------------------------------------------------------

/// Create an empty tree, returning the address of its root cell.
pub fn create(pool: &mut PmPool, class: KeyClass) -> Result<PmAddr> {
    pool.alloc(
        BtrRoot {
            class,
            node: PmAddr::NULL,
        },
        64,
    )
}

/// Whether the tree holds no entries.
pub fn is_empty(pool: &PmPool, root: PmAddr) -> Result<bool> {
    Ok(pool.get::<BtrRoot>(root)?.node.is_null())
}

/// Destroy the tree, freeing every node and handing each record address to
/// `on_rec` so the owner can release the cells behind it.
pub fn destroy(
    pool: &mut PmPool,
    root: PmAddr,
    on_rec: &mut dyn FnMut(&mut PmPool, PmAddr) -> Result<()>,
) -> Result<()> {
    let node = pool.get::<BtrRoot>(root)?.node;
    if !node.is_null() {
        destroy_node(pool, node, on_rec)?;
    }
    pool.free(root)
}

fn destroy_node(
    pool: &mut PmPool,
    addr: PmAddr,
    on_rec: &mut dyn FnMut(&mut PmPool, PmAddr) -> Result<()>,
) -> Result<()> {
    let (recs, children) = {
        let node = pool.get::<BtrNode>(addr)?;
        (node.recs.clone(), node.children.clone())
    };
    for rec in recs {
        on_rec(pool, rec)?;
    }
    for child in children {
        destroy_node(pool, child, on_rec)?;
    }
    pool.free(addr)
}

// ---------------------------------------------------------------------------
// Insert
// ---------------------------------------------------------------------------

/// Outcome of [`upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A new entry was created.
    Inserted,
    /// `(key, epoch)` already exists; the record address is returned and the
    /// caller decides whether replacement is allowed.
    Found(PmAddr),
}

enum Pushed {
    Done(Upsert),
    Split { sep: BtrKey, right: PmAddr },
}

fn alloc_node(pool: &mut PmPool, node: BtrNode) -> Result<PmAddr> {
    if pool.fault_hook().should_fail(FaultSite::TreeAlloc) {
        debug!("injected btree allocation failure");
        return Err(VosError::NoMem);
    }
    pool.alloc(node, NODE_CHARGE)
}

/// Insert `(key, epoch) -> rec`.
///
/// An existing entry with the same composite is never overwritten here;
/// [`Upsert::Found`] hands the existing record back to the caller, which
/// enforces the duplicate semantics (punch may replace, plain updates go
/// through the record cell).
pub fn upsert(
    pool: &mut PmPool,
    root: PmAddr,
    key: &[u8],
    epoch: Epoch,
    rec: PmAddr,
) -> Result<Upsert> {
    let (class, top) = {
        let r = pool.get::<BtrRoot>(root)?;
        (r.class, r.node)
    };
    class.validate(key).map_err(|e| VosError::inval(e.to_string()))?;

    if top.is_null() {
        let mut leaf = BtrNode::new_leaf();
        leaf.keys.push(BtrKey::new(key, epoch));
        leaf.recs.push(rec);
        let addr = alloc_node(pool, leaf)?;
        pool.get_mut::<BtrRoot>(root)?.node = addr;
        return Ok(Upsert::Inserted);
    }

    match push_down(pool, class, top, key, epoch, rec)? {
        Pushed::Done(outcome) => Ok(outcome),
        Pushed::Split { sep, right } => {
            let new_root = alloc_node(
                pool,
                BtrNode {
                    leaf: false,
                    keys: vec![sep],
                    recs: Vec::new(),
                    children: vec![top, right],
                },
            )?;
            pool.get_mut::<BtrRoot>(root)?.node = new_root;
            Ok(Upsert::Inserted)
        }
    }
}

fn push_down(
    pool: &mut PmPool,
    class: KeyClass,
    addr: PmAddr,
    key: &[u8],
    epoch: Epoch,
    rec: PmAddr,
) -> Result<Pushed> {
    let (leaf, pos, child) = {
        let node = pool.get::<BtrNode>(addr)?;
        if node.leaf {
            let pos = lower_bound(class, &node.keys, key, epoch);
            let exists = node
                .keys
                .get(pos)
                .is_some_and(|e| cmp_composite(class, e, key, epoch) == Ordering::Equal);
            if exists {
                return Ok(Pushed::Done(Upsert::Found(node.recs[pos])));
            }
            (true, pos, PmAddr::NULL)
        } else {
            let idx = child_index(class, &node.keys, key, epoch);
            (false, idx, node.children[idx])
        }
    };

    if leaf {
        let node = pool.get_mut::<BtrNode>(addr)?;
        node.keys.insert(pos, BtrKey::new(key, epoch));
        node.recs.insert(pos, rec);
        return maybe_split(pool, addr);
    }

    match push_down(pool, class, child, key, epoch, rec)? {
        Pushed::Done(outcome) => Ok(Pushed::Done(outcome)),
        Pushed::Split { sep, right } => {
            let node = pool.get_mut::<BtrNode>(addr)?;
            node.keys.insert(pos, sep);
            node.children.insert(pos + 1, right);
            maybe_split(pool, addr)
        }
    }
}

fn maybe_split(pool: &mut PmPool, addr: PmAddr) -> Result<Pushed> {
    let full = pool.get::<BtrNode>(addr)?.keys.len() >= 2 * BTR_ORDER;
    if !full {
        return Ok(Pushed::Done(Upsert::Inserted));
    }

    let (sep, right) = {
        let node = pool.get_mut::<BtrNode>(addr)?;
        if node.leaf {
            let keys = node.keys.split_off(BTR_ORDER);
            let recs = node.recs.split_off(BTR_ORDER);
            let sep = keys[0].clone();
            (
                sep,
                BtrNode {
                    leaf: true,
                    keys,
                    recs,
                    children: Vec::new(),
                },
            )
        } else {
            // Promote the middle separator; it does not stay in either half.
            let mut keys = node.keys.split_off(BTR_ORDER);
            let children = node.children.split_off(BTR_ORDER + 1);
            let sep = keys.remove(0);
            (
                sep,
                BtrNode {
                    leaf: false,
                    keys,
                    recs: Vec::new(),
                    children,
                },
            )
        }
    };
    let right_addr = alloc_node(pool, right)?;
    Ok(Pushed::Split {
        sep,
        right: right_addr,
    })
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Multiversion lookup: the record whose key equals `key` with the greatest
/// epoch `<= epoch`, honoring the probing intent.
pub fn lookup(
    pool: &PmPool,
    root: PmAddr,
    key: &[u8],
    epoch: Epoch,
    intent: Intent,
    check: &dyn RecordCheck,
) -> Result<(Epoch, PmAddr)> {
    let mut iter = BtrIter::new(pool, root)?;
    iter.probe(
        pool,
        ProbeSpec::key(ProbeOp::Ge, key, epoch).matched(),
        intent,
        check,
    )?;
    let (found, rec) = iter.fetch(pool)?;
    Ok((found.epoch, rec))
}

// ---------------------------------------------------------------------------
// Iterator
// ---------------------------------------------------------------------------

/// Probe opcode over the composite order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOp {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
}

/// Full probe specification.
#[derive(Debug, Clone, Copy)]
pub enum ProbeSpec<'a> {
    First,
    Last,
    Key {
        op: ProbeOp,
        key: &'a [u8],
        epoch: Epoch,
        /// Restrict the result to entries whose key bytes equal the probe's.
        matched: bool,
    },
}

impl<'a> ProbeSpec<'a> {
    #[must_use]
    pub fn key(op: ProbeOp, key: &'a [u8], epoch: Epoch) -> Self {
        Self::Key {
            op,
            key,
            epoch,
            matched: false,
        }
    }

    /// Add the `matched` modifier.
    #[must_use]
    pub fn matched(self) -> Self {
        match self {
            Self::Key {
                op, key, epoch, ..
            } => Self::Key {
                op,
                key,
                epoch,
                matched: true,
            },
            other => other,
        }
    }
}

/// Embedded iterator over one tree.
///
/// The descent stack lives inline; no allocation happens per probe. The
/// iterator does not pin the tree: callers must not mutate it while a
/// cursor is live, which the engine's single-xstream discipline guarantees.
#[derive(Debug, Clone)]
pub struct BtrIter {
    class: KeyClass,
    top: PmAddr,
    /// `(node, index)` path; the last element indexes a leaf entry.
    stack: SmallVec<[(PmAddr, usize); BTR_MAX_DEPTH]>,
}

impl BtrIter {
    /// Prepare an iterator over the tree rooted at `root`.
    pub fn new(pool: &PmPool, root: PmAddr) -> Result<Self> {
        let r = pool.get::<BtrRoot>(root)?;
        Ok(Self {
            class: r.class,
            top: r.node,
            stack: SmallVec::new(),
        })
    }

    /// Whether the cursor is positioned on an entry.
    #[must_use]
    pub fn is_positioned(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Position the cursor. Returns `NonExist` when no entry satisfies the
    /// probe, `InProgress` when the satisfying entry is blocked by an
    /// unresolved modification.
    pub fn probe(
        &mut self,
        pool: &PmPool,
        spec: ProbeSpec<'_>,
        intent: Intent,
        check: &dyn RecordCheck,
    ) -> Result<()> {
        self.stack.clear();
        if self.top.is_null() {
            return Err(VosError::NonExist);
        }
        match spec {
            ProbeSpec::First => {
                self.descend_edge(pool, self.top, false)?;
                self.skip_unavailable(pool, true, None, intent, check)
            }
            ProbeSpec::Last => {
                self.descend_edge(pool, self.top, true)?;
                self.skip_unavailable(pool, false, None, intent, check)
            }
            ProbeSpec::Key {
                op,
                key,
                epoch,
                matched,
            } => {
                self.descend_to(pool, key, epoch)?;
                // The descent lands on the leaf lower bound; adjust per op.
                let at_lower = self.entry_at_cursor(pool)?;
                match op {
                    ProbeOp::Eq => {
                        let hit = at_lower.is_some_and(|e| {
                            cmp_composite(self.class, e, key, epoch) == Ordering::Equal
                        });
                        if !hit {
                            self.stack.clear();
                            return Err(VosError::NonExist);
                        }
                    }
                    ProbeOp::Ge => {
                        if at_lower.is_none() && !self.step(pool, true)? {
                            self.stack.clear();
                            return Err(VosError::NonExist);
                        }
                    }
                    ProbeOp::Gt => {
                        let on_equal = at_lower.is_some_and(|e| {
                            cmp_composite(self.class, e, key, epoch) == Ordering::Equal
                        });
                        if (at_lower.is_none() || on_equal) && !self.step(pool, true)? {
                            self.stack.clear();
                            return Err(VosError::NonExist);
                        }
                    }
                    ProbeOp::Le => {
                        let on_equal = at_lower.is_some_and(|e| {
                            cmp_composite(self.class, e, key, epoch) == Ordering::Equal
                        });
                        if !on_equal && !self.step(pool, false)? {
                            self.stack.clear();
                            return Err(VosError::NonExist);
                        }
                    }
                    ProbeOp::Lt => {
                        if !self.step(pool, false)? {
                            self.stack.clear();
                            return Err(VosError::NonExist);
                        }
                    }
                }
                let constraint = matched.then_some(key);
                if let Some(kb) = constraint {
                    let ok = self
                        .entry_at_cursor(pool)?
                        .is_some_and(|e| self.class.compare(&e.key, kb) == Ordering::Equal);
                    if !ok {
                        self.stack.clear();
                        return Err(VosError::NonExist);
                    }
                }
                if op == ProbeOp::Eq {
                    // An exact probe never slides to a neighbour.
                    let (_, rec) = self.fetch(pool)?;
                    return match check.available(pool, rec, intent)? {
                        RecordAvail::Visible => Ok(()),
                        RecordAvail::Blocked => Err(VosError::InProgress),
                        RecordAvail::Invisible => {
                            self.stack.clear();
                            Err(VosError::NonExist)
                        }
                    };
                }
                let forward = matches!(op, ProbeOp::Ge | ProbeOp::Gt);
                self.skip_unavailable(pool, forward, constraint, intent, check)
            }
        }
    }

    /// Advance to the next entry in composite order.
    pub fn next(&mut self, pool: &PmPool, intent: Intent, check: &dyn RecordCheck) -> Result<()> {
        if !self.is_positioned() {
            return Err(VosError::NoHandle);
        }
        if !self.step(pool, true)? {
            self.stack.clear();
            return Err(VosError::NonExist);
        }
        self.skip_unavailable(pool, true, None, intent, check)
    }

    /// Step to the previous entry in composite order.
    pub fn prev(&mut self, pool: &PmPool, intent: Intent, check: &dyn RecordCheck) -> Result<()> {
        if !self.is_positioned() {
            return Err(VosError::NoHandle);
        }
        if !self.step(pool, false)? {
            self.stack.clear();
            return Err(VosError::NonExist);
        }
        self.skip_unavailable(pool, false, None, intent, check)
    }

    /// Fetch the entry under the cursor.
    pub fn fetch<'a>(&self, pool: &'a PmPool) -> Result<(&'a BtrKey, PmAddr)> {
        let (addr, idx) = *self.stack.last().ok_or(VosError::NoHandle)?;
        let node = pool.get::<BtrNode>(addr)?;
        let key = node.keys.get(idx).ok_or(VosError::NoHandle)?;
        Ok((key, node.recs[idx]))
    }

    /// Remove the entry under the cursor. Aggregation-only: the caller has
    /// already established that no reader can still observe it. The cursor
    /// is left unpositioned.
    pub fn delete(&mut self, pool: &mut PmPool, root: PmAddr) -> Result<PmAddr> {
        let (addr, idx) = *self.stack.last().ok_or(VosError::NoHandle)?;
        let rec = {
            let node = pool.get_mut::<BtrNode>(addr)?;
            if idx >= node.keys.len() {
                return Err(VosError::NoHandle);
            }
            node.keys.remove(idx);
            node.recs.remove(idx)
        };
        // Unlink the whole branch if the leaf emptied.
        if pool.get::<BtrNode>(addr)?.keys.is_empty() {
            self.unlink_empty(pool, root)?;
        }
        self.stack.clear();
        Ok(rec)
    }

    // -- internals ----------------------------------------------------------

    fn descend_edge(&mut self, pool: &PmPool, mut addr: PmAddr, last: bool) -> Result<()> {
        loop {
            let node = pool.get::<BtrNode>(addr)?;
            if node.leaf {
                if node.keys.is_empty() {
                    self.stack.clear();
                    return Err(VosError::NonExist);
                }
                let idx = if last { node.keys.len() - 1 } else { 0 };
                self.stack.push((addr, idx));
                return Ok(());
            }
            let idx = if last { node.children.len() - 1 } else { 0 };
            self.stack.push((addr, idx));
            addr = node.children[idx];
        }
    }

    fn descend_to(&mut self, pool: &PmPool, key: &[u8], epoch: Epoch) -> Result<()> {
        let mut addr = self.top;
        loop {
            let node = pool.get::<BtrNode>(addr)?;
            if node.leaf {
                let pos = lower_bound(self.class, &node.keys, key, epoch);
                self.stack.push((addr, pos));
                return Ok(());
            }
            let idx = child_index(self.class, &node.keys, key, epoch);
            self.stack.push((addr, idx));
            addr = node.children[idx];
        }
    }

    /// Entry under the cursor, or `None` when the cursor sits one past the
    /// end of its leaf (a valid intermediate state during probes).
    fn entry_at_cursor<'a>(&self, pool: &'a PmPool) -> Result<Option<&'a BtrKey>> {
        let (addr, idx) = *self.stack.last().ok_or(VosError::NoHandle)?;
        let node = pool.get::<BtrNode>(addr)?;
        Ok(node.keys.get(idx))
    }

    /// Move one entry forward or backward; `false` when the walk runs off
    /// the tree.
    fn step(&mut self, pool: &PmPool, forward: bool) -> Result<bool> {
        // Try within the current leaf first.
        if let Some((addr, idx)) = self.stack.last_mut() {
            let node = pool.get::<BtrNode>(*addr)?;
            if forward {
                if *idx + 1 < node.keys.len() {
                    *idx += 1;
                    return Ok(true);
                }
            } else if *idx > 0 && !node.keys.is_empty() {
                *idx = (*idx).min(node.keys.len()) - 1;
                return Ok(true);
            }
        } else {
            return Ok(false);
        }

        // Climb until a sibling subtree exists, then descend its near edge.
        let saved = self.stack.clone();
        self.stack.pop();
        while let Some((addr, idx)) = self.stack.last_mut() {
            let node = pool.get::<BtrNode>(*addr)?;
            if forward {
                if *idx + 1 < node.children.len() {
                    *idx += 1;
                    let child = node.children[*idx];
                    return match self.descend_edge_from(pool, child, false) {
                        Ok(()) => Ok(true),
                        Err(VosError::NonExist) => {
                            self.stack = saved;
                            Ok(false)
                        }
                        Err(e) => Err(e),
                    };
                }
            } else if *idx > 0 {
                *idx -= 1;
                let child = node.children[*idx];
                return match self.descend_edge_from(pool, child, true) {
                    Ok(()) => Ok(true),
                    Err(VosError::NonExist) => {
                        self.stack = saved;
                        Ok(false)
                    }
                    Err(e) => Err(e),
                };
            }
            self.stack.pop();
        }
        self.stack = saved;
        Ok(false)
    }

    fn descend_edge_from(&mut self, pool: &PmPool, mut addr: PmAddr, last: bool) -> Result<()> {
        loop {
            let node = pool.get::<BtrNode>(addr)?;
            if node.leaf {
                if node.keys.is_empty() {
                    return Err(VosError::NonExist);
                }
                let idx = if last { node.keys.len() - 1 } else { 0 };
                self.stack.push((addr, idx));
                return Ok(());
            }
            let idx = if last { node.children.len() - 1 } else { 0 };
            self.stack.push((addr, idx));
            addr = node.children[idx];
        }
    }

    /// Skip entries the check reports invisible, moving in `forward`
    /// direction, optionally constrained to one key's generations.
    fn skip_unavailable(
        &mut self,
        pool: &PmPool,
        forward: bool,
        same_key: Option<&[u8]>,
        intent: Intent,
        check: &dyn RecordCheck,
    ) -> Result<()> {
        loop {
            let (entry_key, rec) = {
                let (addr, idx) = *self.stack.last().ok_or(VosError::NonExist)?;
                let node = pool.get::<BtrNode>(addr)?;
                match node.keys.get(idx) {
                    Some(k) => (k.key.clone(), node.recs[idx]),
                    None => {
                        self.stack.clear();
                        return Err(VosError::NonExist);
                    }
                }
            };
            if let Some(kb) = same_key {
                if self.class.compare(&entry_key, kb) != Ordering::Equal {
                    self.stack.clear();
                    return Err(VosError::NonExist);
                }
            }
            match check.available(pool, rec, intent)? {
                RecordAvail::Visible => return Ok(()),
                RecordAvail::Blocked => return Err(VosError::InProgress),
                RecordAvail::Invisible => {
                    if !self.step(pool, forward)? {
                        self.stack.clear();
                        return Err(VosError::NonExist);
                    }
                }
            }
        }
    }

    fn unlink_empty(&mut self, pool: &mut PmPool, root: PmAddr) -> Result<()> {
        // Walk the recorded path bottom-up, unlinking empty nodes.
        let mut path = self.stack.clone();
        loop {
            let Some((addr, _)) = path.pop() else {
                return Ok(());
            };
            let empty = {
                let node = pool.get::<BtrNode>(addr)?;
                if node.leaf {
                    node.keys.is_empty()
                } else {
                    node.children.is_empty()
                }
            };
            if !empty {
                return Ok(());
            }
            match path.last() {
                Some(&(parent, child_idx)) => {
                    let node = pool.get_mut::<BtrNode>(parent)?;
                    node.children.remove(child_idx);
                    if !node.keys.is_empty() {
                        node.keys.remove(child_idx.saturating_sub(1));
                    }
                }
                None => {
                    pool.get_mut::<BtrRoot>(root)?.node = PmAddr::NULL;
                }
            }
            pool.free(addr)?;
        }
    }
}
