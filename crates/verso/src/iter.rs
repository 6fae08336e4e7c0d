//! Object iterators: dkey, akey, single-value epochs, and array extents.
//!
//! Iterators compose as a stack: a dkey iterator may nest an akey
//! iterator, which may nest a single-value or extent iterator. A nested
//! child borrows the parent's held object instead of taking another cache
//! reference, and children must be torn down before their parent; the
//! release path reports the violation instead of silently unpinning.
//!
//! Key iteration enumerates generations in `(key asc, birth desc)` order
//! and applies the window-match rules: a generation born above the window
//! slides to the older generation, one punched at or below the window
//! start skips the remaining generations of its key.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use verso_btree::{BtrIter, ProbeOp, ProbeSpec};
use verso_error::{Result, VosError};
use verso_evtree::{self as evtree, EvtFilter, EvtIter, IterFlags, Visibility as RecxVisibility};
use verso_mem::scoped_tx;
use verso_types::{BioAddr, Cx, Epoch, EpochRange, Extent, Intent, ObjectId, PmAddr, Recx, EPOCH_MAX};

use crate::container::VosContainer;
use crate::io::free_payload;
use crate::object::VosObject;
use crate::pool::VosPool;
use crate::tree::{
    free_key_record, key_tree_find, sv_key, KeyBody, KeyRecord, KrecCheck, SingleValue, SvCheck,
    TreeCtx,
};

/// Iterator type; also names the nesting level an entry descends into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterType {
    Dkey,
    Akey,
    Single,
    Recx,
}

/// Epoch expressions for single-value iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpochExpr {
    /// Only the exact epoch in `[lo, hi]`.
    Eq,
    /// Ascending within `[lo, hi]`.
    #[default]
    Re,
    /// Descending within `[hi, lo]`.
    Rr,
    /// First epoch at or above `lo`, unbounded.
    Ge,
    /// Last epoch at or below `lo`.
    Le,
}

/// Parameters for [`iter_prepare`].
#[derive(Debug, Clone)]
pub struct IterParam {
    pub oid: ObjectId,
    pub epr: EpochRange,
    /// Required for akey, single-value, and extent iteration.
    pub dkey: Option<Vec<u8>>,
    /// Required for single-value and extent iteration.
    pub akey: Option<Vec<u8>>,
    /// Dkey iteration condition: accept only dkeys under which this akey
    /// exists at the (point) epoch range.
    pub cond_akey: Option<Vec<u8>>,
    pub epc_expr: EpochExpr,
    /// Extent iteration flags.
    pub flags: IterFlags,
}

impl IterParam {
    #[must_use]
    pub fn new(oid: ObjectId, epr: EpochRange) -> Self {
        Self {
            oid,
            epr,
            dkey: None,
            akey: None,
            cond_akey: None,
            epc_expr: EpochExpr::default(),
            flags: IterFlags::default(),
        }
    }
}

/// One fetched iterator entry.
#[derive(Debug, Clone)]
pub enum IterEntry {
    Key {
        key: Vec<u8>,
        /// Punch epoch for tombstoned generations, `EPOCH_MAX` for live
        /// ones.
        epoch: Epoch,
        earliest: Epoch,
        punched: bool,
        /// Nesting level beneath this entry.
        child: IterType,
    },
    Single {
        epoch: Epoch,
        rsize: u64,
        addr: BioAddr,
        csum: u64,
        punched: bool,
    },
    Recx {
        epoch: Epoch,
        recx: Recx,
        orig: Recx,
        vis: RecxVisibility,
        rsize: u64,
        addr: BioAddr,
    },
}

enum IterState {
    Key { it: BtrIter, tree_root: PmAddr },
    Single { it: BtrIter, sv_root: PmAddr },
    Recx { it: EvtIter, evt_root: PmAddr },
}

/// An open object iterator.
pub struct VosIter {
    ty: IterType,
    obj: Rc<RefCell<VosObject>>,
    /// True when this iterator took its own cache hold; false when it
    /// borrows the parent's.
    owns_obj: bool,
    epr: EpochRange,
    cond_akey: Option<Vec<u8>>,
    epc_expr: EpochExpr,
    state: IterState,
}

fn full_extent() -> Extent {
    Extent::new(0, u64::MAX - 1).expect("constant bounds")
}

/// Locate a subtree for an iterator: dkey (and akey, when given) resolved
/// at `epoch`.
fn locate_tree(
    pool: &VosPool,
    obj: &Rc<RefCell<VosObject>>,
    param: &IterParam,
    epoch: Epoch,
    want_akey: bool,
    ctx: TreeCtx<'_>,
) -> Result<KeyBody> {
    let pm = &pool.pm;
    let dkey_root = obj.borrow().dkey_root_ro(pm)?;
    if dkey_root.is_null() {
        return Err(VosError::NonExist);
    }
    let dkey = param
        .dkey
        .as_deref()
        .ok_or_else(|| VosError::inval("iterator requires a dkey"))?;
    let (_, dk) = key_tree_find(pm, dkey_root, dkey, epoch, ctx)?;
    let body = pm.get::<KeyRecord>(dk)?.body;
    if !want_akey {
        return Ok(body);
    }
    let ak_tree = match body {
        KeyBody::Tree(t) => t,
        _ => return Err(VosError::NonExist),
    };
    let akey = param
        .akey
        .as_deref()
        .ok_or_else(|| VosError::inval("iterator requires an akey"))?;
    let (_, ak) = key_tree_find(pm, ak_tree, akey, epoch, ctx)?;
    Ok(pm.get::<KeyRecord>(ak)?.body)
}

/// Prepare an object iterator, holding the object for its lifetime.
pub fn iter_prepare(
    pool: &mut VosPool,
    cont: &VosContainer,
    param: &IterParam,
    dth: Option<&crate::tree::DtxHandle>,
) -> Result<VosIter> {
    let obj = {
        let VosPool {
            pm,
            cache,
            resolver,
            ..
        } = pool;
        let ctx = VosPool::tree_ctx(resolver.as_ref(), dth, Intent::Default);
        let obj = cache.hold(
            pm,
            cont.oi_root,
            cont.uuid,
            param.oid,
            param.epr.hi,
            false,
            ctx,
        )?;
        let vis = obj.borrow().visibility(pm, param.epr.hi)?;
        if matches!(
            vis,
            crate::tree::Visibility::Tombstoned | crate::tree::Visibility::NotYet
        ) {
            cache.release(&obj)?;
            debug!("empty object, nothing to iterate");
            return Err(VosError::NonExist);
        }
        obj
    };

    let prep = iter_state(pool, &obj, param, ctx_of(pool, dth));
    match prep {
        Ok(state) => {
            let ty = match (param.dkey.is_some(), param.akey.is_some()) {
                (false, _) => IterType::Dkey,
                (true, false) => IterType::Akey,
                (true, true) => match &state {
                    IterState::Single { .. } => IterType::Single,
                    _ => IterType::Recx,
                },
            };
            Ok(VosIter {
                ty,
                obj,
                owns_obj: true,
                epr: param.epr,
                cond_akey: param.cond_akey.clone(),
                epc_expr: param.epc_expr,
                state,
            })
        }
        Err(e) => {
            pool.cache.release(&obj)?;
            Err(e)
        }
    }
}

fn ctx_of<'a>(pool: &'a VosPool, dth: Option<&crate::tree::DtxHandle>) -> TreeCtx<'a> {
    VosPool::tree_ctx(pool.resolver.as_ref(), dth, Intent::Default)
}

fn iter_state(
    pool: &VosPool,
    obj: &Rc<RefCell<VosObject>>,
    param: &IterParam,
    ctx: TreeCtx<'_>,
) -> Result<IterState> {
    let pm = &pool.pm;
    let has_akey = param.akey.is_some();
    match (param.dkey.as_deref(), has_akey) {
        // Dkey iteration over the object's dkey tree.
        (None, _) => {
            let tree_root = obj.borrow().dkey_root_ro(pm)?;
            if tree_root.is_null() {
                return Err(VosError::NonExist);
            }
            Ok(IterState::Key {
                it: BtrIter::new(pm, tree_root)?,
                tree_root,
            })
        }
        // Akey iteration beneath one dkey.
        (Some(_), false) => {
            let body = locate_tree(pool, obj, param, param.epr.lo, false, ctx)?;
            let tree_root = match body {
                KeyBody::Tree(t) => t,
                _ => return Err(VosError::NonExist),
            };
            Ok(IterState::Key {
                it: BtrIter::new(pm, tree_root)?,
                tree_root,
            })
        }
        // Value iteration beneath (dkey, akey).
        (Some(_), true) => {
            let body = locate_tree(pool, obj, param, param.epr.hi, true, ctx)?;
            match body {
                KeyBody::Single(sv_root) => Ok(IterState::Single {
                    it: BtrIter::new(pm, sv_root)?,
                    sv_root,
                }),
                KeyBody::Array(evt_root) => {
                    let it = EvtIter::prepare(
                        pm,
                        evt_root,
                        param.flags,
                        EvtFilter {
                            ext: full_extent(),
                            epr: param.epr,
                        },
                    )?;
                    Ok(IterState::Recx { it, evt_root })
                }
                _ => Err(VosError::NonExist),
            }
        }
    }
}

/// Prepare a nested iterator borrowing the parent's held object.
pub fn iter_nested(
    pool: &VosPool,
    parent: &mut VosIter,
    ty: IterType,
    epc_expr: EpochExpr,
    flags: IterFlags,
) -> Result<VosIter> {
    let valid = matches!(
        (parent.ty, ty),
        (IterType::Dkey, IterType::Akey)
            | (IterType::Akey, IterType::Single)
            | (IterType::Akey, IterType::Recx)
    );
    if !valid {
        return Err(VosError::inval("invalid nested iterator type"));
    }
    let pm = &pool.pm;

    // The parent must sit on an entry; its generation bounds the child's
    // window.
    let IterState::Key { it, .. } = &parent.state else {
        return Err(VosError::inval("nested iteration requires a key iterator"));
    };
    let (_, krec_addr) = it.fetch(pm)?;
    let krec = pm.get::<KeyRecord>(krec_addr)?;
    let epr = EpochRange::new(
        parent.epr.lo.max(krec.earliest),
        parent.epr.hi.min(krec.latest.max(krec.earliest)),
    )
    .ok_or(VosError::NonExist)?;

    let state = match (ty, krec.body) {
        (IterType::Akey, KeyBody::Tree(root)) => IterState::Key {
            it: BtrIter::new(pm, root)?,
            tree_root: root,
        },
        (IterType::Single, KeyBody::Single(root)) => IterState::Single {
            it: BtrIter::new(pm, root)?,
            sv_root: root,
        },
        (IterType::Recx, KeyBody::Array(root)) => IterState::Recx {
            it: EvtIter::prepare(
                pm,
                root,
                flags,
                EvtFilter {
                    ext: full_extent(),
                    epr,
                },
            )?,
            evt_root: root,
        },
        _ => return Err(VosError::NonExist),
    };

    parent.obj.borrow_mut().add_borrow();
    Ok(VosIter {
        ty,
        obj: Rc::clone(&parent.obj),
        owns_obj: false,
        epr,
        cond_akey: None,
        epc_expr,
        state,
    })
}

impl VosIter {
    pub fn iter_type(&self) -> IterType {
        self.ty
    }

    /// Position on the first matching entry.
    pub fn probe(&mut self, pool: &VosPool, dth: Option<&crate::tree::DtxHandle>) -> Result<()> {
        let ctx = ctx_of(pool, dth);
        match &mut self.state {
            IterState::Key { it, .. } => {
                it.probe(&pool.pm, ProbeSpec::First, Intent::Default, &KrecCheck(ctx))?;
                key_match(
                    &pool.pm,
                    it,
                    self.ty,
                    self.epr,
                    self.cond_akey.as_deref(),
                    ctx,
                )
            }
            IterState::Single { it, .. } => {
                // The epoch expressions position directly on the epoch
                // axis: EQ/RE/GE anchor at the window start, RR/LE at
                // their upper anchor.
                let (op, target) = match self.epc_expr {
                    EpochExpr::Eq => (ProbeOp::Eq, self.epr.lo),
                    EpochExpr::Re | EpochExpr::Ge => (ProbeOp::Ge, self.epr.lo),
                    EpochExpr::Rr => (ProbeOp::Le, self.epr.hi),
                    EpochExpr::Le => (ProbeOp::Le, self.epr.lo),
                };
                it.probe(
                    &pool.pm,
                    ProbeSpec::key(op, &sv_key(target), 0),
                    Intent::Default,
                    &SvCheck(ctx),
                )?;
                let epoch = sv_entry_epoch(&pool.pm, it)?;
                singv_check_range(self.epc_expr, self.epr, epoch)
            }
            IterState::Recx { it, .. } => it.probe(&pool.pm, ctx.resolver),
        }
    }

    /// Advance to the next matching entry.
    pub fn next(&mut self, pool: &VosPool, dth: Option<&crate::tree::DtxHandle>) -> Result<()> {
        let ctx = ctx_of(pool, dth);
        match &mut self.state {
            IterState::Key { it, .. } => {
                it.next(&pool.pm, Intent::Default, &KrecCheck(ctx))?;
                key_match(
                    &pool.pm,
                    it,
                    self.ty,
                    self.epr,
                    self.cond_akey.as_deref(),
                    ctx,
                )
            }
            IterState::Single { it, .. } => {
                let cur = sv_entry_epoch(&pool.pm, it)?;
                // RE/RR walk the epoch axis by one; the point expressions
                // yield a single entry.
                let (target, opc) = match self.epc_expr {
                    EpochExpr::Re => (cur.checked_add(1).ok_or(VosError::NonExist)?, ProbeOp::Ge),
                    EpochExpr::Rr => (cur.checked_sub(1).ok_or(VosError::NonExist)?, ProbeOp::Le),
                    _ => return Err(VosError::NonExist),
                };
                it.probe(
                    &pool.pm,
                    ProbeSpec::key(opc, &sv_key(target), 0),
                    Intent::Default,
                    &SvCheck(ctx),
                )?;
                let epoch = sv_entry_epoch(&pool.pm, it)?;
                singv_check_range(self.epc_expr, self.epr, epoch)
            }
            IterState::Recx { it, .. } => it.next(),
        }
    }

    /// Fetch the entry under the cursor.
    pub fn fetch(&self, pool: &VosPool) -> Result<IterEntry> {
        let pm = &pool.pm;
        match &self.state {
            IterState::Key { it, .. } => {
                let (bkey, rec) = it.fetch(pm)?;
                let krec = pm.get::<KeyRecord>(rec)?;
                let child = match (self.ty, krec.body) {
                    (IterType::Dkey, _) => IterType::Akey,
                    (_, KeyBody::Array(_)) => IterType::Recx,
                    _ => IterType::Single,
                };
                Ok(IterEntry::Key {
                    key: bkey.key.clone(),
                    epoch: if krec.punched { krec.latest } else { EPOCH_MAX },
                    earliest: krec.earliest,
                    punched: krec.punched,
                    child,
                })
            }
            IterState::Single { it, .. } => {
                let (bkey, rec) = it.fetch(pm)?;
                let epoch = Epoch::from_be_bytes(
                    bkey.key
                        .as_slice()
                        .try_into()
                        .map_err(|_| VosError::inval("malformed single-value key"))?,
                );
                let sv = pm.get::<SingleValue>(rec)?;
                Ok(IterEntry::Single {
                    epoch,
                    rsize: sv.rsize,
                    addr: sv.addr,
                    csum: sv.csum,
                    punched: sv.punched,
                })
            }
            IterState::Recx { it, .. } => {
                let (sel, inob) = it.fetch()?;
                Ok(IterEntry::Recx {
                    epoch: sel.desc.epoch,
                    recx: Recx::from(sel.sel),
                    orig: Recx::from(sel.desc.ext),
                    vis: sel.vis,
                    rsize: u64::from(inob),
                    addr: sel.desc.addr,
                })
            }
        }
    }

    /// Whether the underlying subtree holds no entries at all.
    pub fn is_tree_empty(&self, pool: &VosPool) -> Result<bool> {
        match &self.state {
            IterState::Key { tree_root, .. } => verso_btree::is_empty(&pool.pm, *tree_root),
            IterState::Single { sv_root, .. } => verso_btree::is_empty(&pool.pm, *sv_root),
            IterState::Recx { evt_root, .. } => evtree::is_empty(&pool.pm, *evt_root),
        }
    }

    /// Remove the entry under the cursor. Aggregation path: runs in its
    /// own transaction and releases the storage beneath the entry.
    pub fn delete(&mut self, pool: &mut VosPool, cx: &Cx) -> Result<()> {
        let VosPool { pm, io, .. } = pool;
        match &mut self.state {
            IterState::Key { it, tree_root } => scoped_tx(pm, cx, |pm| {
                let rec = it.delete(pm, *tree_root)?;
                free_key_record(pm, io, rec)
            }),
            IterState::Single { it, sv_root } => scoped_tx(pm, cx, |pm| {
                let rec = it.delete(pm, *sv_root)?;
                let (addr, rsize) = {
                    let sv = pm.get::<SingleValue>(rec)?;
                    (sv.addr, sv.rsize)
                };
                free_payload(pm, io, addr, rsize)?;
                pm.free(rec)
            }),
            IterState::Recx { it, evt_root } => scoped_tx(pm, cx, |pm| {
                let inob = u64::from(evtree::inob(pm, *evt_root)?);
                let desc = it.delete_current(pm)?;
                free_payload(pm, io, desc.addr, desc.ext.width().saturating_mul(inob))
            }),
        }
    }

    /// Tear the iterator down. Children must finish before their parent;
    /// a parent finishing with live borrows is refused.
    pub fn finish(self, pool: &mut VosPool) -> Result<()> {
        if self.owns_obj {
            pool.cache.release(&self.obj)
        } else {
            self.obj.borrow_mut().drop_borrow();
            Ok(())
        }
    }
}

/// Representative epoch of the current single-value entry.
fn sv_entry_epoch(pm: &verso_mem::PmPool, it: &BtrIter) -> Result<Epoch> {
    let (bkey, _) = it.fetch(pm)?;
    let bytes: [u8; 8] = bkey
        .key
        .as_slice()
        .try_into()
        .map_err(|_| VosError::inval("malformed single-value key"))?;
    Ok(Epoch::from_be_bytes(bytes))
}

/// Walk key-tree entries until one matches the window, applying the
/// generation skip rules.
fn key_match(
    pm: &verso_mem::PmPool,
    it: &mut BtrIter,
    ty: IterType,
    epr: EpochRange,
    cond_akey: Option<&[u8]>,
    ctx: TreeCtx<'_>,
) -> Result<()> {
    loop {
        let (key_bytes, earliest, latest, punched, body) = {
            let (bkey, rec) = it.fetch(pm)?;
            let krec = pm.get::<KeyRecord>(rec)?;
            (
                bkey.key.clone(),
                krec.earliest,
                krec.latest,
                krec.punched,
                krec.body,
            )
        };
        let ie_epoch = if punched { latest } else { EPOCH_MAX };

        if earliest > epr.hi {
            // Born above the window; an older generation may still match.
            it.next(pm, Intent::Default, &KrecCheck(ctx))?;
            continue;
        }
        if ie_epoch <= epr.lo {
            // Punched at or before the window start: every older
            // generation of this key is dead too, skip to the next key.
            it.probe(
                pm,
                ProbeSpec::key(ProbeOp::Gt, &key_bytes, 0),
                Intent::Default,
                &KrecCheck(ctx),
            )?;
            continue;
        }

        let Some(cond) = cond_akey else {
            return Ok(());
        };
        if ty != IterType::Dkey {
            return Ok(());
        }
        // Conditional iteration is defined for a point window only.
        if !epr.is_point() {
            return Err(VosError::inval(
                "conditional iteration over an epoch range",
            ));
        }
        let found = match body {
            KeyBody::Tree(ak_root) => match key_tree_find(pm, ak_root, cond, epr.lo, ctx) {
                Ok(_) => true,
                Err(VosError::NonExist) => false,
                Err(e) => return Err(e),
            },
            _ => false,
        };
        if found {
            return Ok(());
        }
        it.next(pm, Intent::Default, &KrecCheck(ctx))?;
    }
}

/// Reject entries the epoch expression places outside its window.
fn singv_check_range(expr: EpochExpr, epr: EpochRange, epoch: Epoch) -> Result<()> {
    let ok = match expr {
        EpochExpr::Eq | EpochExpr::Re => epoch <= epr.hi,
        EpochExpr::Rr => epoch >= epr.lo,
        // GE has no upper bound; LE anchors below its probe by
        // construction.
        EpochExpr::Ge | EpochExpr::Le => true,
    };
    if ok {
        Ok(())
    } else {
        Err(VosError::NonExist)
    }
}
