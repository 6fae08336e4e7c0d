//! The I/O pipelines: update, fetch, punch, and the attribute API.
//!
//! Update walks object → dkey → akey under one PM transaction, inserts the
//! value records, then stages payload bytes through a [`BioDesc`] and
//! commits; any failure on the way aborts the whole transaction. Fetch is
//! the mirror with visibility filtering and no transaction. Punch is a
//! distinguished update that writes tombstones instead of data.
//!
//! NVMe space displaced by a same-epoch replacement is reclaimed only
//! after the transaction commits, so an abort never frees storage a live
//! record still points at.

use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use verso_bio::{BioDesc, BioOp, IoContext};
use verso_error::{Result, VosError};
use verso_evtree::{self as evtree, EvtDesc, EvtFilter, EvtIter, IterFlags};
use verso_mem::{scoped_tx, PmPool};
use verso_types::limits::INLINE_PAYLOAD_MAX;
use verso_types::{
    BioAddr, Cx, Epoch, EpochRange, Extent, FaultSite, Intent, MediaType, ObjectId, PmAddr, Recx,
};

use crate::container::VosContainer;
use crate::object::{oi_check_attrs, oi_punch, ObjRecord};
use crate::pool::VosPool;
use crate::tree::{
    key_tree_find, key_tree_prepare, key_tree_punch, sv_fetch, sv_update, DtxHandle, KeyBody,
    KeyRecord, SingleValue, SubtreeKind, TreeCtx, Visibility,
};

/// One caller buffer.
pub type IoVec = Vec<u8>;

/// Scatter-gather list: one buffer per value (single) or per extent
/// (array).
#[derive(Debug, Clone, Default)]
pub struct SgList {
    pub iovs: Vec<IoVec>,
}

impl SgList {
    #[must_use]
    pub fn one(iov: IoVec) -> Self {
        Self { iovs: vec![iov] }
    }
}

/// Value shape addressed by one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IodType {
    Single,
    Array,
}

/// I/O descriptor: one akey and the records to touch beneath it.
#[derive(Debug, Clone)]
pub struct Iod {
    pub akey: Vec<u8>,
    pub kind: IodType,
    /// Record size. For single values this is the full value size.
    pub rsize: u64,
    /// Extents; one per sgl buffer. Unused for single values.
    pub recxs: Vec<Recx>,
}

/// Per-iod record sizes discovered by a fetch; zero marks an absent or
/// tombstoned value.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub rsize: Vec<u64>,
}

// ---------------------------------------------------------------------------
// Payload placement
// ---------------------------------------------------------------------------

/// Allocate payload storage: PM-resident below the inline threshold, blob
/// space above it.
pub(crate) fn alloc_payload(pm: &mut PmPool, io: &mut IoContext, len: u64) -> Result<BioAddr> {
    if len == 0 {
        return Err(VosError::inval("zero-length payload allocation"));
    }
    if len <= INLINE_PAYLOAD_MAX as u64 {
        let cell = pm.alloc(vec![0u8; len as usize], len)?;
        Ok(BioAddr::new(MediaType::Scm, cell.raw()))
    } else {
        Ok(BioAddr::new(MediaType::Nvme, io.alloc(len)?))
    }
}

/// Release payload storage immediately. Only sound where no abort can
/// follow (teardown paths); replacement paths defer the NVMe half to
/// commit.
pub(crate) fn free_payload(
    pm: &mut PmPool,
    io: &mut IoContext,
    addr: BioAddr,
    len: u64,
) -> Result<()> {
    if addr.is_hole() {
        return Ok(());
    }
    match addr.media {
        MediaType::Scm => pm.free(PmAddr::from_raw(addr.off)),
        MediaType::Nvme => {
            io.free(addr.off, len);
            Ok(())
        }
    }
}

fn checksum(payload: &[u8]) -> u64 {
    xxh3_64(payload)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_iods(oid: ObjectId, dkey: &[u8], iods: &[Iod], sgl_count: usize) -> Result<()> {
    if iods.len() != sgl_count {
        return Err(VosError::inval("iod/sgl count mismatch"));
    }
    let dk_class = oid
        .dkey_class()
        .map_err(|e| VosError::inval(e.to_string()))?;
    dk_class
        .validate(dkey)
        .map_err(|e| VosError::inval(e.to_string()))?;
    let ak_class = oid
        .akey_class()
        .map_err(|e| VosError::inval(e.to_string()))?;
    for iod in iods {
        ak_class
            .validate(&iod.akey)
            .map_err(|e| VosError::inval(e.to_string()))?;
        match iod.kind {
            IodType::Single => {
                if !iod.recxs.is_empty() {
                    return Err(VosError::inval("extents on a single-value iod"));
                }
            }
            IodType::Array => {
                if iod.recxs.is_empty() {
                    return Err(VosError::inval("array iod without extents"));
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

/// Update one object: insert single values and array extents at `epoch`.
///
/// `rsize = 0` on any iod is `Inval` here; tombstones go through
/// [`obj_punch`].
#[allow(clippy::too_many_arguments)]
pub fn obj_update(
    pool: &mut VosPool,
    cx: &Cx,
    cont: &VosContainer,
    oid: ObjectId,
    epoch: Epoch,
    dkey: &[u8],
    iods: &[Iod],
    sgls: &[SgList],
    dth: Option<&DtxHandle>,
) -> Result<()> {
    validate_iods(oid, dkey, iods, sgls.len())?;
    for iod in iods {
        if iod.rsize == 0 {
            return Err(VosError::inval("zero record size on a non-punch update"));
        }
    }
    debug!(%oid, epoch, iods = iods.len(), "object update");

    let VosPool {
        pm,
        io,
        cache,
        resolver,
        ..
    } = pool;
    let ctx = VosPool::tree_ctx(resolver.as_ref(), dth, Intent::Update);

    // NVMe space displaced by replacements; reclaimed after commit.
    let mut displaced: Vec<(BioAddr, u64)> = Vec::new();

    scoped_tx(pm, cx, |pm| {
        let obj = cache.hold(pm, cont.oi_root, cont.uuid, oid, epoch, true, ctx)?;
        let res = (|| {
            let dkey_root = obj.borrow().dkey_root(pm)?;
            let ak_class = oid
                .akey_class()
                .map_err(|e| VosError::inval(e.to_string()))?;
            let dk = key_tree_prepare(
                pm,
                dkey_root,
                dkey,
                epoch,
                SubtreeKind::Tree(ak_class),
                ctx,
            )?;
            let ak_tree = match pm.get::<KeyRecord>(dk)?.body {
                KeyBody::Tree(t) => t,
                _ => return Err(VosError::inval("dkey does not carry an akey tree")),
            };

            // Insert records first, collecting payload staging work.
            let mut stages: Vec<(BioAddr, &[u8])> = Vec::new();
            for (iod, sgl) in iods.iter().zip(sgls) {
                match iod.kind {
                    IodType::Single => {
                        let payload = sgl
                            .iovs
                            .first()
                            .ok_or_else(|| VosError::inval("single-value iod without buffer"))?;
                        if payload.len() as u64 != iod.rsize {
                            return Err(VosError::inval("single-value buffer length mismatch"));
                        }
                        let ak = key_tree_prepare(
                            pm,
                            ak_tree,
                            &iod.akey,
                            epoch,
                            SubtreeKind::Single,
                            ctx,
                        )?;
                        let sv_root = match pm.get::<KeyRecord>(ak)?.body {
                            KeyBody::Single(t) => t,
                            _ => return Err(VosError::inval("akey does not hold a single value")),
                        };
                        let addr = alloc_payload(pm, io, iod.rsize)?;
                        let value = SingleValue {
                            rsize: iod.rsize,
                            addr,
                            csum: checksum(payload),
                            ver: 0,
                            punched: false,
                            dtx: ctx.current,
                        };
                        let (_, old) = sv_update(pm, sv_root, epoch, value, ctx)?;
                        if let Some((old_addr, old_len)) = old {
                            queue_free(pm, &mut displaced, old_addr, old_len)?;
                        }
                        stages.push((addr, payload.as_slice()));
                    }
                    IodType::Array => {
                        if iod.recxs.len() != sgl.iovs.len() {
                            return Err(VosError::inval("recx/buffer count mismatch"));
                        }
                        let ak = key_tree_prepare(
                            pm,
                            ak_tree,
                            &iod.akey,
                            epoch,
                            SubtreeKind::Array,
                            ctx,
                        )?;
                        let evt_root = match pm.get::<KeyRecord>(ak)?.body {
                            KeyBody::Array(t) => t,
                            _ => return Err(VosError::inval("akey does not hold an array")),
                        };
                        for (recx, iov) in iod.recxs.iter().zip(&sgl.iovs) {
                            let ext = recx
                                .to_extent()
                                .map_err(|e| VosError::inval(e.to_string()))?;
                            let rsize = u32::try_from(iod.rsize)
                                .map_err(|_| VosError::inval("array record size too large"))?;
                            if iov.is_empty() {
                                // Extent punch: a hole entry, no payload.
                                insert_extent(
                                    pm,
                                    &mut displaced,
                                    evt_root,
                                    rsize,
                                    epoch,
                                    ext,
                                    BioAddr::hole(),
                                    0,
                                    ctx,
                                )?;
                                continue;
                            }
                            let need = ext.width().saturating_mul(iod.rsize);
                            if iov.len() as u64 != need {
                                return Err(VosError::inval("extent buffer length mismatch"));
                            }
                            let addr = alloc_payload(pm, io, need)?;
                            insert_extent(
                                pm,
                                &mut displaced,
                                evt_root,
                                rsize,
                                epoch,
                                ext,
                                addr,
                                checksum(iov),
                                ctx,
                            )?;
                            stages.push((addr, iov.as_slice()));
                        }
                    }
                }
            }

            // Stage and write back the payload bytes.
            let mut biod = BioDesc::new(BioOp::Update);
            for (addr, data) in &stages {
                biod.add_iov(*addr, 0, data.len() as u64)?;
            }
            biod.prep(pm, io)?;
            for (i, (_, data)) in stages.iter().enumerate() {
                biod.buf_mut(i)?.copy_from_slice(data);
            }
            cx.checkpoint().map_err(|_| VosError::Cancelled)?;
            let fault = pm.fault_hook().clone();
            biod.post(pm, io, fault.as_ref())?;
            Ok(())
        })();
        let rel = cache.release(&obj);
        res.and(rel)
    })?;

    for (addr, len) in displaced {
        free_payload(pm, io, addr, len)?;
    }
    if let Some(dth) = dth {
        dth.mark_prepared();
    }
    Ok(())
}

/// Queue a displaced payload for post-commit reclamation. The SCM half is
/// undo-logged and can be freed inside the transaction.
fn queue_free(
    pm: &mut PmPool,
    displaced: &mut Vec<(BioAddr, u64)>,
    addr: BioAddr,
    len: u64,
) -> Result<()> {
    if addr.is_hole() {
        return Ok(());
    }
    match addr.media {
        MediaType::Scm => pm.free(PmAddr::from_raw(addr.off)),
        MediaType::Nvme => {
            displaced.push((addr, len));
            Ok(())
        }
    }
}

/// Insert an extent entry, resolving the exact-duplicate case by
/// deterministic replacement.
#[allow(clippy::too_many_arguments)]
fn insert_extent(
    pm: &mut PmPool,
    displaced: &mut Vec<(BioAddr, u64)>,
    evt_root: PmAddr,
    rsize: u32,
    epoch: Epoch,
    ext: Extent,
    addr: BioAddr,
    csum: u64,
    ctx: TreeCtx<'_>,
) -> Result<()> {
    let desc = EvtDesc {
        epoch,
        ext,
        ver: 0,
        addr,
        csum,
        dtx: ctx.current,
    };
    match evtree::insert(pm, evt_root, rsize, desc) {
        Ok(()) => Ok(()),
        Err(VosError::Exist) => {
            // The exact same extent at the same epoch is replaced in
            // place; a partial overlap keeps the Exist.
            if evtree::find_exact(pm, evt_root, epoch, ext)?.is_none() {
                return Err(VosError::Exist);
            }
            let old = evtree::replace_payload(pm, evt_root, epoch, ext, addr, csum)?;
            let old_len = old.ext.width().saturating_mul(u64::from(rsize));
            queue_free(pm, displaced, old.addr, old_len)
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Fetch one object at `epoch` into caller buffers.
///
/// Absent or tombstoned keys yield zero sizes; holes yield zero bytes; a
/// missing object record is `NonExist`.
#[allow(clippy::too_many_arguments)]
pub fn obj_fetch(
    pool: &mut VosPool,
    cx: &Cx,
    cont: &VosContainer,
    oid: ObjectId,
    epoch: Epoch,
    dkey: &[u8],
    iods: &[Iod],
    sgls: &mut [SgList],
    dth: Option<&DtxHandle>,
) -> Result<FetchResult> {
    validate_iods(oid, dkey, iods, sgls.len())?;
    debug!(%oid, epoch, iods = iods.len(), "object fetch");

    let VosPool {
        pm,
        io,
        cache,
        resolver,
        ..
    } = pool;
    let ctx = VosPool::tree_ctx(resolver.as_ref(), dth, Intent::Default);

    let obj = cache.hold(pm, cont.oi_root, cont.uuid, oid, epoch, false, ctx)?;
    let res = (|| {
        let mut out = FetchResult {
            rsize: vec![0; iods.len()],
        };
        if matches!(
            obj.borrow().visibility(pm, epoch)?,
            Visibility::Tombstoned | Visibility::NotYet
        ) {
            return Ok(out);
        }
        let dkey_root = obj.borrow().dkey_root_ro(pm)?;
        if dkey_root.is_null() {
            return Ok(out);
        }
        let dk = match key_tree_find(pm, dkey_root, dkey, epoch, ctx) {
            Ok((_, addr)) => addr,
            Err(VosError::NonExist) => return Ok(out),
            Err(e) => return Err(e),
        };
        let ak_tree = match pm.get::<KeyRecord>(dk)?.body {
            KeyBody::Tree(t) => t,
            KeyBody::None => return Ok(out),
            _ => return Err(VosError::inval("dkey does not carry an akey tree")),
        };

        for (i, (iod, sgl)) in iods.iter().zip(sgls.iter_mut()).enumerate() {
            let ak = match key_tree_find(pm, ak_tree, &iod.akey, epoch, ctx) {
                Ok((_, addr)) => addr,
                Err(VosError::NonExist) => continue,
                Err(e) => return Err(e),
            };
            let body = pm.get::<KeyRecord>(ak)?.body;
            match (iod.kind, body) {
                (IodType::Single, KeyBody::Single(sv_root)) => {
                    let (_, sv) = match sv_fetch(pm, sv_root, epoch, ctx) {
                        Ok(v) => v,
                        Err(VosError::NonExist) => continue,
                        Err(e) => return Err(e),
                    };
                    if sv.punched || sv.rsize == 0 {
                        continue;
                    }
                    let buf = sgl
                        .iovs
                        .first_mut()
                        .ok_or_else(|| VosError::inval("single-value fetch without buffer"))?;
                    if (buf.len() as u64) < sv.rsize {
                        return Err(VosError::Overflow { required: sv.rsize });
                    }
                    read_payload(
                        pm,
                        io,
                        cx,
                        sv.addr,
                        0,
                        sv.rsize,
                        Some(sv.csum),
                        &mut buf[..sv.rsize as usize],
                    )?;
                    out.rsize[i] = sv.rsize;
                }
                (IodType::Array, KeyBody::Array(evt_root)) => {
                    let inob = evtree::inob(pm, evt_root)?;
                    if inob == 0 {
                        continue;
                    }
                    out.rsize[i] = u64::from(inob);
                    if iod.recxs.len() != sgl.iovs.len() {
                        return Err(VosError::inval("recx/buffer count mismatch"));
                    }
                    for (recx, iov) in iod.recxs.iter().zip(sgl.iovs.iter_mut()) {
                        let ext = recx
                            .to_extent()
                            .map_err(|e| VosError::inval(e.to_string()))?;
                        let need = ext.width().saturating_mul(u64::from(inob));
                        if (iov.len() as u64) < need {
                            return Err(VosError::Overflow { required: need });
                        }
                        iov[..need as usize].fill(0);
                        fetch_extent(pm, io, cx, ctx, evt_root, ext, epoch, inob, iov)?;
                    }
                }
                // The akey exists with the other value kind.
                (_, KeyBody::None) => continue,
                _ => return Err(VosError::inval("iod type disagrees with the stored value")),
            }
        }
        Ok(out)
    })();
    let rel = cache.release(&obj);
    let out = res?;
    rel?;
    Ok(out)
}

/// Copy the visible runs of `ext` at `epoch` into `buf` (pre-zeroed by the
/// caller); holes and gaps stay zero.
#[allow(clippy::too_many_arguments)]
fn fetch_extent(
    pm: &mut PmPool,
    io: &mut IoContext,
    cx: &Cx,
    ctx: TreeCtx<'_>,
    evt_root: PmAddr,
    ext: Extent,
    epoch: Epoch,
    inob: u32,
    buf: &mut [u8],
) -> Result<()> {
    let mut it = EvtIter::prepare(
        pm,
        evt_root,
        IterFlags::visible(),
        EvtFilter {
            ext,
            epr: EpochRange::new(0, epoch).expect("zero lower bound"),
        },
    )?;
    match it.probe(pm, ctx.resolver) {
        Ok(()) => {}
        Err(VosError::NonExist) => return Ok(()),
        Err(e) => return Err(e),
    }
    loop {
        let (sel, rsize) = it.fetch()?;
        if u64::from(rsize) != u64::from(inob) {
            return Err(VosError::inval("record size disagreement in a visible run"));
        }
        if !sel.desc.addr.is_hole() {
            let skip = sel.payload_skip(rsize);
            let len = sel.payload_len(rsize);
            let whole = skip == 0 && len == sel.desc.ext.width() * u64::from(rsize);
            let at = ((sel.sel.lo() - ext.lo()) * u64::from(rsize)) as usize;
            let csum = whole.then_some(sel.desc.csum);
            let sel_addr = sel.desc.addr;
            read_payload(
                pm,
                io,
                cx,
                sel_addr,
                skip,
                len,
                csum,
                &mut buf[at..at + len as usize],
            )?;
        }
        match it.next() {
            Ok(()) => {}
            Err(VosError::NonExist) => break,
            Err(e) => return Err(e),
        }
    }
    it.finish();
    Ok(())
}

/// Read one payload range through a fetch descriptor, verifying the
/// checksum when the whole payload is covered.
#[allow(clippy::too_many_arguments)]
fn read_payload(
    pm: &mut PmPool,
    io: &mut IoContext,
    cx: &Cx,
    addr: BioAddr,
    skip: u64,
    len: u64,
    csum: Option<u64>,
    out: &mut [u8],
) -> Result<()> {
    cx.checkpoint().map_err(|_| VosError::Cancelled)?;
    let mut biod = BioDesc::new(BioOp::Fetch);
    biod.add_iov(addr, skip, len)?;
    biod.prep(pm, io)?;
    let data = biod.buf(0)?;
    if let Some(want) = csum {
        let fault = pm.fault_hook().should_fail(FaultSite::ChecksumVerify);
        if fault || checksum(data) != want {
            return Err(VosError::io("payload checksum mismatch"));
        }
    }
    out.copy_from_slice(data);
    let fault = pm.fault_hook().clone();
    biod.post(pm, io, fault.as_ref())?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Punch
// ---------------------------------------------------------------------------

/// Punch an object, a dkey, or a set of akeys under one dkey, at `epoch`.
pub fn obj_punch(
    pool: &mut VosPool,
    cx: &Cx,
    cont: &VosContainer,
    oid: ObjectId,
    epoch: Epoch,
    dkey: Option<&[u8]>,
    akeys: &[Vec<u8>],
    dth: Option<&DtxHandle>,
) -> Result<()> {
    if dkey.is_none() && !akeys.is_empty() {
        return Err(VosError::inval("akey punch requires a dkey"));
    }
    debug!(%oid, epoch, "object punch");

    let VosPool {
        pm,
        cache,
        resolver,
        ..
    } = pool;
    let ctx = VosPool::tree_ctx(resolver.as_ref(), dth, Intent::Punch);

    scoped_tx(pm, cx, |pm| {
        let obj = cache.hold(pm, cont.oi_root, cont.uuid, oid, epoch, true, ctx)?;
        let res = (|| match dkey {
            Some(dk) => {
                let dk_class = oid
                    .dkey_class()
                    .map_err(|e| VosError::inval(e.to_string()))?;
                dk_class
                    .validate(dk)
                    .map_err(|e| VosError::inval(e.to_string()))?;
                let dkey_root = obj.borrow().dkey_root(pm)?;
                if akeys.is_empty() {
                    return key_tree_punch(pm, dkey_root, dk, epoch, ctx);
                }
                let ak_class = oid
                    .akey_class()
                    .map_err(|e| VosError::inval(e.to_string()))?;
                let dkrec = key_tree_prepare(
                    pm,
                    dkey_root,
                    dk,
                    epoch,
                    SubtreeKind::Tree(ak_class),
                    ctx,
                )?;
                let ak_tree = match pm.get::<KeyRecord>(dkrec)?.body {
                    KeyBody::Tree(t) => t,
                    _ => return Err(VosError::inval("dkey does not carry an akey tree")),
                };
                for ak in akeys {
                    ak_class
                        .validate(ak)
                        .map_err(|e| VosError::inval(e.to_string()))?;
                    key_tree_punch(pm, ak_tree, ak, epoch, ctx)?;
                }
                Ok(())
            }
            None => {
                oi_punch(pm, cont.oi_root, oid, epoch, ctx)?;
                // Future fetches must observe the fresh (empty)
                // incarnation, not the cached pre-punch one.
                cache.evict(cont.uuid, oid);
                Ok(())
            }
        })();
        let rel = cache.release(&obj);
        res.and(rel)
    })?;
    if let Some(dth) = dth {
        dth.mark_prepared();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Attribute API
// ---------------------------------------------------------------------------

/// Set attribute bits on an object at `epoch`. Reserved bits are refused.
pub fn oi_set_attr(
    pool: &mut VosPool,
    cx: &Cx,
    cont: &VosContainer,
    oid: ObjectId,
    epoch: Epoch,
    attrs: u64,
    dth: Option<&DtxHandle>,
) -> Result<()> {
    oi_attr_helper(pool, cx, cont, oid, epoch, attrs, true, dth)
}

/// Clear attribute bits on an object at `epoch`. Reserved bits are
/// refused; only set bits are cleared.
pub fn oi_clear_attr(
    pool: &mut VosPool,
    cx: &Cx,
    cont: &VosContainer,
    oid: ObjectId,
    epoch: Epoch,
    attrs: u64,
    dth: Option<&DtxHandle>,
) -> Result<()> {
    oi_attr_helper(pool, cx, cont, oid, epoch, attrs, false, dth)
}

#[allow(clippy::too_many_arguments)]
fn oi_attr_helper(
    pool: &mut VosPool,
    cx: &Cx,
    cont: &VosContainer,
    oid: ObjectId,
    epoch: Epoch,
    attrs: u64,
    set: bool,
    dth: Option<&DtxHandle>,
) -> Result<()> {
    oi_check_attrs(attrs)?;
    let VosPool {
        pm,
        cache,
        resolver,
        ..
    } = pool;
    let ctx = VosPool::tree_ctx(resolver.as_ref(), dth, Intent::Update);
    scoped_tx(pm, cx, |pm| {
        let obj = cache.hold(pm, cont.oi_root, cont.uuid, oid, epoch, true, ctx)?;
        let res = (|| {
            let rec = obj.borrow().rec;
            let orec = pm.get_mut::<ObjRecord>(rec)?;
            if set {
                orec.attrs |= attrs;
            } else {
                let to_clear = attrs & orec.attrs;
                orec.attrs ^= to_clear;
            }
            orec.latest = orec.latest.max(epoch);
            Ok(())
        })();
        let rel = cache.release(&obj);
        res.and(rel)
    })
}

/// Read the attribute bits of an object at `epoch`. A nonexistent object
/// reads as zero.
pub fn oi_get_attr(
    pool: &mut VosPool,
    cont: &VosContainer,
    oid: ObjectId,
    epoch: Epoch,
    dth: Option<&DtxHandle>,
) -> Result<u64> {
    let VosPool {
        pm,
        cache,
        resolver,
        ..
    } = pool;
    let ctx = VosPool::tree_ctx(resolver.as_ref(), dth, Intent::Default);
    let obj = match cache.hold(pm, cont.oi_root, cont.uuid, oid, epoch, false, ctx) {
        Ok(obj) => obj,
        Err(VosError::NonExist) => return Ok(0),
        Err(e) => return Err(e),
    };
    let res: Result<u64> = (|| {
        let rec = obj.borrow().rec;
        Ok(pm.get::<ObjRecord>(rec)?.attrs)
    })();
    let rel = cache.release(&obj);
    let out = res?;
    rel?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Zero-copy variants
// ---------------------------------------------------------------------------

/// Zero-copy update: the caller fills the staged buffers directly instead
/// of handing over source SGLs. Buffer `i` corresponds to the `i`-th
/// non-hole payload in iod order (extents in recx order within each iod).
#[allow(clippy::too_many_arguments)]
pub fn zc_update(
    pool: &mut VosPool,
    cx: &Cx,
    cont: &VosContainer,
    oid: ObjectId,
    epoch: Epoch,
    dkey: &[u8],
    iods: &[Iod],
    fill: impl FnOnce(&mut BioDesc) -> Result<()>,
    dth: Option<&DtxHandle>,
) -> Result<()> {
    validate_iods(oid, dkey, iods, iods.len())?;
    for iod in iods {
        if iod.rsize == 0 {
            return Err(VosError::inval("zero record size on a non-punch update"));
        }
    }

    let VosPool {
        pm,
        io,
        cache,
        resolver,
        ..
    } = pool;
    let ctx = VosPool::tree_ctx(resolver.as_ref(), dth, Intent::Update);
    let mut displaced: Vec<(BioAddr, u64)> = Vec::new();

    scoped_tx(pm, cx, |pm| {
        let obj = cache.hold(pm, cont.oi_root, cont.uuid, oid, epoch, true, ctx)?;
        let res = (|| {
            let dkey_root = obj.borrow().dkey_root(pm)?;
            let ak_class = oid
                .akey_class()
                .map_err(|e| VosError::inval(e.to_string()))?;
            let dk = key_tree_prepare(
                pm,
                dkey_root,
                dkey,
                epoch,
                SubtreeKind::Tree(ak_class),
                ctx,
            )?;
            let ak_tree = match pm.get::<KeyRecord>(dk)?.body {
                KeyBody::Tree(t) => t,
                _ => return Err(VosError::inval("dkey does not carry an akey tree")),
            };

            // Record bookkeeping for the post-fill checksum patch.
            enum Patched {
                Sv(PmAddr),
                Ext(PmAddr, Epoch, Extent),
            }
            let mut patches: Vec<Patched> = Vec::new();
            let mut biod = BioDesc::new(BioOp::Update);

            for iod in iods {
                match iod.kind {
                    IodType::Single => {
                        let ak = key_tree_prepare(
                            pm,
                            ak_tree,
                            &iod.akey,
                            epoch,
                            SubtreeKind::Single,
                            ctx,
                        )?;
                        let sv_root = match pm.get::<KeyRecord>(ak)?.body {
                            KeyBody::Single(t) => t,
                            _ => return Err(VosError::inval("akey does not hold a single value")),
                        };
                        let addr = alloc_payload(pm, io, iod.rsize)?;
                        let value = SingleValue {
                            rsize: iod.rsize,
                            addr,
                            csum: 0,
                            ver: 0,
                            punched: false,
                            dtx: ctx.current,
                        };
                        let (rec, old) = sv_update(pm, sv_root, epoch, value, ctx)?;
                        if let Some((old_addr, old_len)) = old {
                            queue_free(pm, &mut displaced, old_addr, old_len)?;
                        }
                        biod.add_iov(addr, 0, iod.rsize)?;
                        patches.push(Patched::Sv(rec));
                    }
                    IodType::Array => {
                        let ak = key_tree_prepare(
                            pm,
                            ak_tree,
                            &iod.akey,
                            epoch,
                            SubtreeKind::Array,
                            ctx,
                        )?;
                        let evt_root = match pm.get::<KeyRecord>(ak)?.body {
                            KeyBody::Array(t) => t,
                            _ => return Err(VosError::inval("akey does not hold an array")),
                        };
                        for recx in &iod.recxs {
                            let ext = recx
                                .to_extent()
                                .map_err(|e| VosError::inval(e.to_string()))?;
                            let rsize = u32::try_from(iod.rsize)
                                .map_err(|_| VosError::inval("array record size too large"))?;
                            let need = ext.width().saturating_mul(iod.rsize);
                            let addr = alloc_payload(pm, io, need)?;
                            insert_extent(
                                pm,
                                &mut displaced,
                                evt_root,
                                rsize,
                                epoch,
                                ext,
                                addr,
                                0,
                                ctx,
                            )?;
                            biod.add_iov(addr, 0, need)?;
                            patches.push(Patched::Ext(evt_root, epoch, ext));
                        }
                    }
                }
            }

            biod.prep(pm, io)?;
            fill(&mut biod)?;

            // Seal the records with checksums over the filled buffers.
            for (i, patch) in patches.iter().enumerate() {
                let csum = checksum(biod.buf(i)?);
                match patch {
                    Patched::Sv(rec) => pm.get_mut::<SingleValue>(*rec)?.csum = csum,
                    Patched::Ext(root, e, ext) => {
                        let current = evtree::find_exact(pm, *root, *e, *ext)?
                            .ok_or(VosError::NonExist)?;
                        evtree::replace_payload(pm, *root, *e, *ext, current.addr, csum)?;
                    }
                }
            }

            cx.checkpoint().map_err(|_| VosError::Cancelled)?;
            let fault = pm.fault_hook().clone();
            biod.post(pm, io, fault.as_ref())?;
            Ok(())
        })();
        let rel = cache.release(&obj);
        res.and(rel)
    })?;

    for (addr, len) in displaced {
        free_payload(pm, io, addr, len)?;
    }
    if let Some(dth) = dth {
        dth.mark_prepared();
    }
    Ok(())
}

/// Zero-copy fetch: the caller reads the staged buffers directly. Buffer
/// layout follows iod order; each array recx contributes one buffer per
/// visible run plus hole buffers for the gaps, in position order.
#[allow(clippy::too_many_arguments)]
pub fn zc_fetch(
    pool: &mut VosPool,
    cx: &Cx,
    cont: &VosContainer,
    oid: ObjectId,
    epoch: Epoch,
    dkey: &[u8],
    iods: &[Iod],
    read: impl FnOnce(&BioDesc) -> Result<()>,
    dth: Option<&DtxHandle>,
) -> Result<FetchResult> {
    validate_iods(oid, dkey, iods, iods.len())?;

    let VosPool {
        pm,
        io,
        cache,
        resolver,
        ..
    } = pool;
    let ctx = VosPool::tree_ctx(resolver.as_ref(), dth, Intent::Default);

    let obj = cache.hold(pm, cont.oi_root, cont.uuid, oid, epoch, false, ctx)?;
    let res = (|| {
        let mut out = FetchResult {
            rsize: vec![0; iods.len()],
        };
        let mut biod = BioDesc::new(BioOp::Fetch);

        let dkey_root = obj.borrow().dkey_root_ro(pm)?;
        let tombstoned = matches!(
            obj.borrow().visibility(pm, epoch)?,
            Visibility::Tombstoned | Visibility::NotYet
        );
        if !tombstoned && !dkey_root.is_null() {
            if let Ok((_, dk)) = key_tree_find(pm, dkey_root, dkey, epoch, ctx) {
                if let KeyBody::Tree(ak_tree) = pm.get::<KeyRecord>(dk)?.body {
                    for (i, iod) in iods.iter().enumerate() {
                        let ak = match key_tree_find(pm, ak_tree, &iod.akey, epoch, ctx) {
                            Ok((_, addr)) => addr,
                            Err(VosError::NonExist) => continue,
                            Err(e) => return Err(e),
                        };
                        let body = pm.get::<KeyRecord>(ak)?.body;
                        match (iod.kind, body) {
                            (IodType::Single, KeyBody::Single(sv_root)) => {
                                let (_, sv) = match sv_fetch(pm, sv_root, epoch, ctx) {
                                    Ok(v) => v,
                                    Err(VosError::NonExist) => continue,
                                    Err(e) => return Err(e),
                                };
                                if sv.punched || sv.rsize == 0 {
                                    continue;
                                }
                                biod.add_iov(sv.addr, 0, sv.rsize)?;
                                out.rsize[i] = sv.rsize;
                            }
                            (IodType::Array, KeyBody::Array(evt_root)) => {
                                let inob = evtree::inob(pm, evt_root)?;
                                if inob == 0 {
                                    continue;
                                }
                                out.rsize[i] = u64::from(inob);
                                for recx in &iod.recxs {
                                    let ext = recx
                                        .to_extent()
                                        .map_err(|e| VosError::inval(e.to_string()))?;
                                    add_extent_iovs(pm, ctx, evt_root, ext, epoch, inob, &mut biod)?;
                                }
                            }
                            (_, KeyBody::None) => continue,
                            _ => {
                                return Err(VosError::inval(
                                    "iod type disagrees with the stored value",
                                ))
                            }
                        }
                    }
                }
            }
        }

        cx.checkpoint().map_err(|_| VosError::Cancelled)?;
        biod.prep(pm, io)?;
        read(&biod)?;
        let fault = pm.fault_hook().clone();
        biod.post(pm, io, fault.as_ref())?;
        Ok(out)
    })();
    let rel = cache.release(&obj);
    let out = res?;
    rel?;
    Ok(out)
}

/// Append the visible runs and hole gaps of one extent window to a fetch
/// descriptor, in position order.
fn add_extent_iovs(
    pm: &PmPool,
    ctx: TreeCtx<'_>,
    evt_root: PmAddr,
    ext: Extent,
    epoch: Epoch,
    inob: u32,
    biod: &mut BioDesc,
) -> Result<()> {
    let mut it = EvtIter::prepare(
        pm,
        evt_root,
        IterFlags::visible(),
        EvtFilter {
            ext,
            epr: EpochRange::new(0, epoch).expect("zero lower bound"),
        },
    )?;
    let mut cursor = ext.lo();
    let push_hole = |biod: &mut BioDesc, from: u64, to: u64| -> Result<()> {
        if from <= to {
            let len = (to - from + 1) * u64::from(inob);
            biod.add_iov(BioAddr::hole(), 0, len)?;
        }
        Ok(())
    };
    match it.probe(pm, ctx.resolver) {
        Ok(()) => loop {
            let (sel, rsize) = it.fetch()?;
            if sel.sel.lo() > cursor {
                push_hole(biod, cursor, sel.sel.lo() - 1)?;
            }
            if sel.desc.addr.is_hole() {
                push_hole(biod, sel.sel.lo(), sel.sel.hi())?;
            } else {
                biod.add_iov(sel.desc.addr, sel.payload_skip(rsize), sel.payload_len(rsize))?;
            }
            cursor = sel.sel.hi() + 1;
            match it.next() {
                Ok(()) => {}
                Err(VosError::NonExist) => break,
                Err(e) => return Err(e),
            }
        },
        Err(VosError::NonExist) => {}
        Err(e) => return Err(e),
    }
    if cursor <= ext.hi() {
        push_hole(biod, cursor, ext.hi())?;
    }
    it.finish();
    Ok(())
}
