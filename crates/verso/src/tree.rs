//! Key-record model shared by the dkey and akey trees.
//!
//! Key trees are btrees keyed by `(key bytes, birth epoch)`: each entry is
//! one *generation* of the key, carrying its own `earliest`/`latest`
//! bounds, punch flag, and attached subtree. A punch marks the current
//! generation tombstoned and advances `latest`; a later write above a
//! punched generation starts a fresh generation with an empty subtree, so
//! readers below the punch keep seeing the old incarnation untouched.
//!
//! The visibility rule here is the uniform one applied across every tree
//! in the store.

use std::cell::Cell;

use tracing::debug;

use verso_btree::{self as btree, ProbeOp, ProbeSpec, RecordAvail, RecordCheck};
use verso_error::{Result, VosError};
use verso_evtree as evtree;
use verso_mem::PmPool;
use verso_types::{BioAddr, DtxId, DtxResolver, DtxState, Epoch, Intent, KeyClass, PmAddr};

use crate::io;

/// Nominal quota charges for the small record cells.
const KREC_CHARGE: u64 = 128;
const SVREC_CHARGE: u64 = 96;

// ---------------------------------------------------------------------------
// Visibility
// ---------------------------------------------------------------------------

/// Classification of an `(earliest, latest, punched)` entry for a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Created after the reader's epoch.
    NotYet,
    /// Punched at or before the reader's epoch.
    Tombstoned,
    /// Visible; `rep` is the representative epoch for the reader.
    Visible { rep: Epoch },
}

/// The uniform visibility rule for a reader at `at`.
#[must_use]
pub fn visibility(earliest: Epoch, latest: Epoch, punched: bool, at: Epoch) -> Visibility {
    if earliest > at {
        Visibility::NotYet
    } else if punched && latest <= at {
        Visibility::Tombstoned
    } else {
        Visibility::Visible {
            rep: latest.min(at),
        }
    }
}

// ---------------------------------------------------------------------------
// DTX handle
// ---------------------------------------------------------------------------

/// Handle of the distributed transaction driving a modification, opaque to
/// the store except for identity. `prepared` flips once the local side of
/// the modification has committed.
#[derive(Debug)]
pub struct DtxHandle {
    pub id: DtxId,
    prepared: Cell<bool>,
}

impl DtxHandle {
    #[must_use]
    pub fn new(id: DtxId) -> Self {
        Self {
            id,
            prepared: Cell::new(false),
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.get()
    }

    pub(crate) fn mark_prepared(&self) {
        self.prepared.set(true);
    }
}

/// Lookup context: the DTX resolver plus the identity of the transaction
/// performing the lookup, if any.
#[derive(Clone, Copy)]
pub struct TreeCtx<'a> {
    pub resolver: &'a dyn DtxResolver,
    pub current: Option<DtxId>,
    pub intent: Intent,
}

pub(crate) fn dtx_avail(
    entry: Option<DtxId>,
    current: Option<DtxId>,
    resolver: &dyn DtxResolver,
) -> RecordAvail {
    match entry {
        None => RecordAvail::Visible,
        Some(id) if Some(id) == current => RecordAvail::Visible,
        Some(id) => match resolver.state(id) {
            DtxState::Committed => RecordAvail::Visible,
            DtxState::Aborted => RecordAvail::Invisible,
            DtxState::Prepared => RecordAvail::Blocked,
        },
    }
}

/// [`RecordCheck`] over key-record cells.
pub struct KrecCheck<'a>(pub TreeCtx<'a>);

impl RecordCheck for KrecCheck<'_> {
    fn available(&self, pool: &PmPool, rec: PmAddr, _intent: Intent) -> Result<RecordAvail> {
        let krec = pool.get::<KeyRecord>(rec)?;
        Ok(dtx_avail(krec.dtx, self.0.current, self.0.resolver))
    }
}

/// [`RecordCheck`] over single-value cells.
pub struct SvCheck<'a>(pub TreeCtx<'a>);

impl RecordCheck for SvCheck<'_> {
    fn available(&self, pool: &PmPool, rec: PmAddr, _intent: Intent) -> Result<RecordAvail> {
        let sv = pool.get::<SingleValue>(rec)?;
        Ok(dtx_avail(sv.dtx, self.0.current, self.0.resolver))
    }
}

// ---------------------------------------------------------------------------
// Key records
// ---------------------------------------------------------------------------

/// Subtree attached to a key generation. A generation carries exactly one
/// kind; asking for a different kind is a caller error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBody {
    /// No subtree yet (fresh or pure-tombstone generation).
    None,
    /// A nested key tree (dkey generations attach the akey tree).
    Tree(PmAddr),
    /// Single-value subtree: a btree keyed by epoch.
    Single(PmAddr),
    /// Array subtree: an extent tree.
    Array(PmAddr),
}

/// One generation of a dkey or akey.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub earliest: Epoch,
    pub latest: Epoch,
    pub punched: bool,
    pub body: KeyBody,
    pub dtx: Option<DtxId>,
}

/// What kind of subtree an operation wants attached to the generation it
/// prepares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtreeKind {
    /// Nested key tree with the given key class.
    Tree(KeyClass),
    Single,
    Array,
}

/// Single-value record: one `(epoch, payload)` version of an akey.
#[derive(Debug, Clone)]
pub struct SingleValue {
    /// Record size in bytes; zero marks a value-level tombstone.
    pub rsize: u64,
    pub addr: BioAddr,
    pub csum: u64,
    pub ver: u32,
    pub punched: bool,
    pub dtx: Option<DtxId>,
}

/// Key bytes of a single-value entry: the big-endian epoch, so lexical
/// order is epoch order.
#[must_use]
pub fn sv_key(epoch: Epoch) -> [u8; 8] {
    epoch.to_be_bytes()
}

// ---------------------------------------------------------------------------
// key tree operations
// ---------------------------------------------------------------------------

/// Read-side resolution: the generation of `key` visible at `epoch`.
///
/// `NonExist` covers both a missing key and one tombstoned at or before
/// `epoch`; callers that must distinguish the two check the returned
/// record themselves via [`key_tree_punched_at`].
pub fn key_tree_find(
    pm: &PmPool,
    tree_root: PmAddr,
    key: &[u8],
    epoch: Epoch,
    ctx: TreeCtx<'_>,
) -> Result<(Epoch, PmAddr)> {
    let (birth, addr) = btree::lookup(pm, tree_root, key, epoch, ctx.intent, &KrecCheck(ctx))?;
    let krec = pm.get::<KeyRecord>(addr)?;
    match visibility(krec.earliest, krec.latest, krec.punched, epoch) {
        Visibility::Tombstoned => Err(VosError::NonExist),
        _ => Ok((birth, addr)),
    }
}

/// The punch epoch of the generation covering `epoch`, if it is tombstoned
/// for that reader.
pub fn key_tree_punched_at(
    pm: &PmPool,
    tree_root: PmAddr,
    key: &[u8],
    epoch: Epoch,
    ctx: TreeCtx<'_>,
) -> Result<Option<Epoch>> {
    match btree::lookup(pm, tree_root, key, epoch, ctx.intent, &KrecCheck(ctx)) {
        Ok((_, addr)) => {
            let krec = pm.get::<KeyRecord>(addr)?;
            if krec.punched && krec.latest <= epoch {
                Ok(Some(krec.latest))
            } else {
                Ok(None)
            }
        }
        Err(VosError::NonExist) => Ok(None),
        Err(e) => Err(e),
    }
}

fn attach_body(pm: &mut PmPool, kind: SubtreeKind) -> Result<KeyBody> {
    Ok(match kind {
        SubtreeKind::Tree(class) => KeyBody::Tree(btree::create(pm, class)?),
        SubtreeKind::Single => KeyBody::Single(btree::create(pm, KeyClass::Lexical64)?),
        SubtreeKind::Array => KeyBody::Array(evtree::create(pm)?),
    })
}

fn body_matches(body: KeyBody, kind: SubtreeKind) -> bool {
    matches!(
        (body, kind),
        (KeyBody::Tree(_), SubtreeKind::Tree(_))
            | (KeyBody::Single(_), SubtreeKind::Single)
            | (KeyBody::Array(_), SubtreeKind::Array)
    )
}

/// Write-side resolution: find or create the generation of `key` receiving
/// an update at `epoch`, with a subtree of `kind` attached.
///
/// A generation tombstoned at or before `epoch` is never reused; the
/// update starts a new incarnation.
pub fn key_tree_prepare(
    pm: &mut PmPool,
    tree_root: PmAddr,
    key: &[u8],
    epoch: Epoch,
    kind: SubtreeKind,
    ctx: TreeCtx<'_>,
) -> Result<PmAddr> {
    match btree::lookup(pm, tree_root, key, epoch, ctx.intent, &KrecCheck(ctx)) {
        Ok((_, addr)) => {
            let (punched, latest, body) = {
                let krec = pm.get::<KeyRecord>(addr)?;
                (krec.punched, krec.latest, krec.body)
            };
            if punched && latest <= epoch {
                return new_generation(pm, tree_root, key, epoch, Some(kind), ctx);
            }
            if body == KeyBody::None {
                let body = attach_body(pm, kind)?;
                pm.get_mut::<KeyRecord>(addr)?.body = body;
            } else if !body_matches(body, kind) {
                return Err(VosError::inval(
                    "key carries a different value kind than requested",
                ));
            }
            let krec = pm.get_mut::<KeyRecord>(addr)?;
            krec.latest = krec.latest.max(epoch);
            Ok(addr)
        }
        Err(VosError::NonExist) => new_generation(pm, tree_root, key, epoch, Some(kind), ctx),
        Err(e) => Err(e),
    }
}

fn new_generation(
    pm: &mut PmPool,
    tree_root: PmAddr,
    key: &[u8],
    epoch: Epoch,
    kind: Option<SubtreeKind>,
    ctx: TreeCtx<'_>,
) -> Result<PmAddr> {
    let body = match kind {
        Some(kind) => attach_body(pm, kind)?,
        None => KeyBody::None,
    };
    let addr = pm.alloc(
        KeyRecord {
            earliest: epoch,
            latest: epoch,
            punched: kind.is_none(),
            body,
            dtx: ctx.current,
        },
        KREC_CHARGE + key.len() as u64,
    )?;
    match btree::upsert(pm, tree_root, key, epoch, addr)? {
        btree::Upsert::Inserted => Ok(addr),
        btree::Upsert::Found(_) => Err(VosError::Exist),
    }
}

/// Punch `key` at `epoch`: tombstone the covering generation, or write a
/// pure-tombstone generation when the key has never been written.
pub fn key_tree_punch(
    pm: &mut PmPool,
    tree_root: PmAddr,
    key: &[u8],
    epoch: Epoch,
    ctx: TreeCtx<'_>,
) -> Result<()> {
    match btree::lookup(pm, tree_root, key, epoch, ctx.intent, &KrecCheck(ctx)) {
        Ok((_, addr)) => {
            let krec = pm.get::<KeyRecord>(addr)?;
            if krec.punched {
                // Re-punch only advances the tombstone.
                if epoch > krec.latest {
                    pm.get_mut::<KeyRecord>(addr)?.latest = epoch;
                }
                return Ok(());
            }
            if epoch < krec.latest {
                return Err(VosError::inval(
                    "punch epoch below the key's latest update",
                ));
            }
            let krec = pm.get_mut::<KeyRecord>(addr)?;
            krec.punched = true;
            krec.latest = epoch;
            debug!(epoch, "key punched");
            Ok(())
        }
        Err(VosError::NonExist) => {
            new_generation(pm, tree_root, key, epoch, None, ctx).map(|_| ())
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Single-value operations
// ---------------------------------------------------------------------------

/// Insert the single value at `epoch`, or deterministically replace an
/// existing one. Returns the record cell together with the payload it
/// displaced, which the caller must release after the swap.
pub fn sv_update(
    pm: &mut PmPool,
    sv_root: PmAddr,
    epoch: Epoch,
    value: SingleValue,
    ctx: TreeCtx<'_>,
) -> Result<(PmAddr, Option<(BioAddr, u64)>)> {
    let key = sv_key(epoch);
    let mut it = btree::BtrIter::new(pm, sv_root)?;
    match it.probe(
        pm,
        ProbeSpec::key(ProbeOp::Eq, &key, 0),
        ctx.intent,
        &SvCheck(ctx),
    ) {
        Ok(()) => {
            let (_, addr) = it.fetch(pm)?;
            let old = {
                let sv = pm.get::<SingleValue>(addr)?;
                (sv.addr, sv.rsize)
            };
            *pm.get_mut::<SingleValue>(addr)? = value;
            Ok((addr, Some(old)))
        }
        Err(VosError::NonExist) => {
            let addr = pm.alloc(value, SVREC_CHARGE)?;
            match btree::upsert(pm, sv_root, &key, 0, addr)? {
                btree::Upsert::Inserted => Ok((addr, None)),
                btree::Upsert::Found(_) => Err(VosError::Exist),
            }
        }
        Err(e) => Err(e),
    }
}

/// The single value with the greatest epoch at or below `epoch`.
pub fn sv_fetch(
    pm: &PmPool,
    sv_root: PmAddr,
    epoch: Epoch,
    ctx: TreeCtx<'_>,
) -> Result<(Epoch, SingleValue)> {
    let key = sv_key(epoch);
    let mut it = btree::BtrIter::new(pm, sv_root)?;
    it.probe(
        pm,
        ProbeSpec::key(ProbeOp::Le, &key, 0),
        ctx.intent,
        &SvCheck(ctx),
    )?;
    let (found, addr) = it.fetch(pm)?;
    let epoch = Epoch::from_be_bytes(
        found
            .key
            .as_slice()
            .try_into()
            .map_err(|_| VosError::inval("malformed single-value key"))?,
    );
    Ok((epoch, pm.get::<SingleValue>(addr)?.clone()))
}

// ---------------------------------------------------------------------------
// Subtree teardown
// ---------------------------------------------------------------------------

pub(crate) fn collect_recs(pm: &PmPool, root: PmAddr) -> Result<Vec<PmAddr>> {
    let mut recs = Vec::new();
    let mut it = btree::BtrIter::new(pm, root)?;
    match it.probe(
        pm,
        ProbeSpec::First,
        Intent::Default,
        &btree::AllVisible,
    ) {
        Ok(()) => loop {
            let (_, rec) = it.fetch(pm)?;
            recs.push(rec);
            match it.next(pm, Intent::Default, &btree::AllVisible) {
                Ok(()) => {}
                Err(VosError::NonExist) => break,
                Err(e) => return Err(e),
            }
        },
        Err(VosError::NonExist) => {}
        Err(e) => return Err(e),
    }
    Ok(recs)
}

/// Free a key generation and everything beneath it.
pub fn free_key_record(
    pm: &mut PmPool,
    io_ctx: &mut verso_bio::IoContext,
    krec_addr: PmAddr,
) -> Result<()> {
    let body = pm.get::<KeyRecord>(krec_addr)?.body;
    match body {
        KeyBody::None => {}
        KeyBody::Tree(root) => {
            for rec in collect_recs(pm, root)? {
                free_key_record(pm, io_ctx, rec)?;
            }
            btree::destroy(pm, root, &mut |_, _| Ok(()))?;
        }
        KeyBody::Single(root) => {
            for rec in collect_recs(pm, root)? {
                let (addr, rsize) = {
                    let sv = pm.get::<SingleValue>(rec)?;
                    (sv.addr, sv.rsize)
                };
                io::free_payload(pm, io_ctx, addr, rsize)?;
                pm.free(rec)?;
            }
            btree::destroy(pm, root, &mut |_, _| Ok(()))?;
        }
        KeyBody::Array(root) => {
            let inob = u64::from(evtree::inob(pm, root)?);
            let mut descs = Vec::new();
            evtree::destroy(pm, root, &mut |_, d| {
                descs.push((d.addr, d.ext.width()));
                Ok(())
            })?;
            for (addr, width) in descs {
                io::free_payload(pm, io_ctx, addr, width.saturating_mul(inob))?;
            }
        }
    }
    pm.free(krec_addr)
}
