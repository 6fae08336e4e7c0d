//! Object index and the object handle cache.
//!
//! The OI is a per-container key tree whose keys are the 16-byte
//! big-endian object ids; entries are object-record generations with the
//! same `earliest`/`latest`/punch discipline as key records. The handle
//! cache is a bounded LRU of hydrated objects; held objects are never
//! evicted, and an evicted object rehydrates from PM without any
//! observable difference.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use std::cell::RefCell;

use tracing::debug;

use uuid::Uuid;
use verso_btree::{self as btree, RecordAvail, RecordCheck};
use verso_error::{Result, VosError};
use verso_mem::PmPool;
use verso_types::{DtxId, Epoch, Intent, ObjectId, PmAddr};

use crate::tree::{visibility, TreeCtx, Visibility};

/// Object attribute bit: tombstoned by an object-level punch. Reserved;
/// the attribute API refuses to touch it.
pub const OI_PUNCHED: u64 = 1 << 62;
/// Object attribute bit: removed by rebuild. Reserved likewise.
pub const OI_REMOVED: u64 = 1 << 63;

const OI_RESERVED: u64 = OI_PUNCHED | OI_REMOVED;

const OREC_CHARGE: u64 = 160;

/// One generation of an object record.
#[derive(Debug, Clone)]
pub struct ObjRecord {
    pub oid: ObjectId,
    pub attrs: u64,
    pub earliest: Epoch,
    pub latest: Epoch,
    /// Root of the dkey tree; null until the first write hydrates it.
    pub dkey_root: PmAddr,
    pub dtx: Option<DtxId>,
}

impl ObjRecord {
    #[must_use]
    pub fn punched(&self) -> bool {
        self.attrs & OI_PUNCHED != 0
    }

    /// Visibility of this generation for a reader at `at`.
    #[must_use]
    pub fn visibility(&self, at: Epoch) -> Visibility {
        visibility(self.earliest, self.latest, self.punched(), at)
    }
}

/// [`RecordCheck`] over object-record cells.
pub struct OrecCheck<'a>(pub TreeCtx<'a>);

impl RecordCheck for OrecCheck<'_> {
    fn available(&self, pool: &PmPool, rec: PmAddr, _intent: Intent) -> Result<RecordAvail> {
        // Object records share the DTX discipline of key records.
        let orec = pool.get::<ObjRecord>(rec)?;
        Ok(crate::tree::dtx_avail(
            orec.dtx,
            self.0.current,
            self.0.resolver,
        ))
    }
}

// ---------------------------------------------------------------------------
// Object index operations
// ---------------------------------------------------------------------------

/// Find the object generation covering `epoch`.
pub fn oi_find(
    pm: &PmPool,
    oi_root: PmAddr,
    oid: ObjectId,
    epoch: Epoch,
    ctx: TreeCtx<'_>,
) -> Result<PmAddr> {
    let key = oid.to_key_bytes();
    let (_, addr) = btree::lookup(pm, oi_root, &key, epoch, ctx.intent, &OrecCheck(ctx))?;
    Ok(addr)
}

/// Find or allocate the object generation receiving a write at `epoch`.
/// A generation tombstoned at or before `epoch` starts a new incarnation.
pub fn oi_find_or_alloc(
    pm: &mut PmPool,
    oi_root: PmAddr,
    oid: ObjectId,
    epoch: Epoch,
    ctx: TreeCtx<'_>,
) -> Result<PmAddr> {
    let key = oid.to_key_bytes();
    match btree::lookup(pm, oi_root, &key, epoch, ctx.intent, &OrecCheck(ctx)) {
        Ok((_, addr)) => {
            let (punched, latest) = {
                let orec = pm.get::<ObjRecord>(addr)?;
                (orec.punched(), orec.latest)
            };
            if punched && latest <= epoch {
                oi_new_generation(pm, oi_root, oid, epoch, false, ctx)
            } else {
                let orec = pm.get_mut::<ObjRecord>(addr)?;
                orec.latest = orec.latest.max(epoch);
                Ok(addr)
            }
        }
        Err(VosError::NonExist) => oi_new_generation(pm, oi_root, oid, epoch, false, ctx),
        Err(e) => Err(e),
    }
}

fn oi_new_generation(
    pm: &mut PmPool,
    oi_root: PmAddr,
    oid: ObjectId,
    epoch: Epoch,
    tombstone: bool,
    ctx: TreeCtx<'_>,
) -> Result<PmAddr> {
    let addr = pm.alloc(
        ObjRecord {
            oid,
            attrs: if tombstone { OI_PUNCHED } else { 0 },
            earliest: epoch,
            latest: epoch,
            dkey_root: PmAddr::NULL,
            dtx: ctx.current,
        },
        OREC_CHARGE,
    )?;
    match btree::upsert(pm, oi_root, &oid.to_key_bytes(), epoch, addr)? {
        btree::Upsert::Inserted => Ok(addr),
        btree::Upsert::Found(_) => Err(VosError::Exist),
    }
}

/// Tombstone the object at `epoch`.
pub fn oi_punch(
    pm: &mut PmPool,
    oi_root: PmAddr,
    oid: ObjectId,
    epoch: Epoch,
    ctx: TreeCtx<'_>,
) -> Result<()> {
    let key = oid.to_key_bytes();
    match btree::lookup(pm, oi_root, &key, epoch, ctx.intent, &OrecCheck(ctx)) {
        Ok((_, addr)) => {
            let (punched, latest) = {
                let orec = pm.get::<ObjRecord>(addr)?;
                (orec.punched(), orec.latest)
            };
            if punched {
                if epoch > latest {
                    pm.get_mut::<ObjRecord>(addr)?.latest = epoch;
                }
                return Ok(());
            }
            if epoch < latest {
                return Err(VosError::inval(
                    "punch epoch below the object's latest update",
                ));
            }
            let orec = pm.get_mut::<ObjRecord>(addr)?;
            orec.attrs |= OI_PUNCHED;
            orec.latest = epoch;
            debug!(%oid, epoch, "object punched");
            Ok(())
        }
        Err(VosError::NonExist) => {
            oi_new_generation(pm, oi_root, oid, epoch, true, ctx).map(|_| ())
        }
        Err(e) => Err(e),
    }
}

/// Free an object-record generation and its whole dkey tree.
pub(crate) fn free_obj_record(
    pm: &mut PmPool,
    io_ctx: &mut verso_bio::IoContext,
    orec_addr: PmAddr,
) -> Result<()> {
    let root = pm.get::<ObjRecord>(orec_addr)?.dkey_root;
    if !root.is_null() {
        for rec in crate::tree::collect_recs(pm, root)? {
            crate::tree::free_key_record(pm, io_ctx, rec)?;
        }
        btree::destroy(pm, root, &mut |_, _| Ok(()))?;
    }
    pm.free(orec_addr)
}

/// Validate an attribute mask against the reserved bits.
pub fn oi_check_attrs(attrs: u64) -> Result<()> {
    if attrs & OI_RESERVED != 0 {
        return Err(VosError::inval(
            "punched/removed attribute bits are reserved",
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Object handle cache
// ---------------------------------------------------------------------------

/// A hydrated object handle.
#[derive(Debug)]
pub struct VosObject {
    pub cont: Uuid,
    pub oid: ObjectId,
    /// Generation resolved at the last hold; null for an empty object.
    pub rec: PmAddr,
    /// Epoch the generation was resolved for.
    pub epoch: Epoch,
    refs: u32,
    borrows: u32,
}

impl VosObject {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rec.is_null()
    }

    /// Visibility of the held generation at `at`.
    pub fn visibility(&self, pm: &PmPool, at: Epoch) -> Result<Visibility> {
        if self.rec.is_null() {
            return Ok(Visibility::NotYet);
        }
        Ok(pm.get::<ObjRecord>(self.rec)?.visibility(at))
    }

    /// Root of the dkey tree, hydrating it under the current transaction
    /// when absent.
    pub fn dkey_root(&self, pm: &mut PmPool) -> Result<PmAddr> {
        let root = pm.get::<ObjRecord>(self.rec)?.dkey_root;
        if !root.is_null() {
            return Ok(root);
        }
        let class = self
            .oid
            .dkey_class()
            .map_err(|e| VosError::inval(e.to_string()))?;
        let root = btree::create(pm, class)?;
        pm.get_mut::<ObjRecord>(self.rec)?.dkey_root = root;
        Ok(root)
    }

    /// Root of the dkey tree without hydration; null when never written.
    pub fn dkey_root_ro(&self, pm: &PmPool) -> Result<PmAddr> {
        if self.rec.is_null() {
            return Ok(PmAddr::NULL);
        }
        Ok(pm.get::<ObjRecord>(self.rec)?.dkey_root)
    }

    pub(crate) fn add_borrow(&mut self) {
        self.borrows += 1;
    }

    pub(crate) fn drop_borrow(&mut self) {
        debug_assert!(self.borrows > 0, "unbalanced nested-iterator borrow");
        self.borrows = self.borrows.saturating_sub(1);
    }

    pub(crate) fn borrows(&self) -> u32 {
        self.borrows
    }
}

/// Bounded LRU of hydrated objects, one per xstream.
#[derive(Debug)]
pub struct ObjCache {
    capacity: usize,
    map: HashMap<(Uuid, ObjectId), Rc<RefCell<VosObject>>>,
    lru: VecDeque<(Uuid, ObjectId)>,
}

impl ObjCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Hold the object, resolving its generation for `epoch`.
    ///
    /// With `create`, the record is allocated under the active transaction
    /// when absent; without it, a missing record is `NonExist`.
    #[allow(clippy::too_many_arguments)]
    pub fn hold(
        &mut self,
        pm: &mut PmPool,
        oi_root: PmAddr,
        cont: Uuid,
        oid: ObjectId,
        epoch: Epoch,
        create: bool,
        ctx: TreeCtx<'_>,
    ) -> Result<Rc<RefCell<VosObject>>> {
        let rec = if create {
            oi_find_or_alloc(pm, oi_root, oid, epoch, ctx)?
        } else {
            match oi_find(pm, oi_root, oid, epoch, ctx) {
                Ok(addr) => addr,
                Err(VosError::NonExist) => return Err(VosError::NonExist),
                Err(e) => return Err(e),
            }
        };

        let key = (cont, oid);
        let obj = match self.map.get(&key) {
            Some(obj) => Rc::clone(obj),
            None => {
                let obj = Rc::new(RefCell::new(VosObject {
                    cont,
                    oid,
                    rec: PmAddr::NULL,
                    epoch,
                    refs: 0,
                    borrows: 0,
                }));
                self.map.insert(key, Rc::clone(&obj));
                self.lru.push_back(key);
                obj
            }
        };
        {
            let mut o = obj.borrow_mut();
            o.rec = rec;
            o.epoch = epoch;
            o.refs += 1;
        }
        self.touch(key);
        self.evict_excess();
        Ok(obj)
    }

    /// Release one hold. Fails when nested iterators still borrow the
    /// handle; children must be torn down before their parent.
    pub fn release(&mut self, obj: &Rc<RefCell<VosObject>>) -> Result<()> {
        let mut o = obj.borrow_mut();
        if o.refs == 0 {
            return Err(VosError::inval("release without a matching hold"));
        }
        if o.refs == 1 && o.borrows() > 0 {
            return Err(VosError::inval(
                "object released while nested iterators still borrow it",
            ));
        }
        o.refs -= 1;
        drop(o);
        self.evict_excess();
        Ok(())
    }

    /// Drop the object from the lookup table. Live holders keep their
    /// handle; the next hold rehydrates from PM.
    pub fn evict(&mut self, cont: Uuid, oid: ObjectId) {
        let key = (cont, oid);
        if self.map.remove(&key).is_some() {
            self.lru.retain(|k| *k != key);
            debug!(%oid, "object evicted from cache");
        }
    }

    fn touch(&mut self, key: (Uuid, ObjectId)) {
        self.lru.retain(|k| *k != key);
        self.lru.push_back(key);
    }

    /// Drop every cached object of one container.
    pub fn evict_cont(&mut self, cont: Uuid) {
        self.map.retain(|(c, _), _| *c != cont);
        self.lru.retain(|(c, _)| *c != cont);
    }

    fn evict_excess(&mut self) {
        while self.map.len() > self.capacity {
            let Some(victim) = self
                .lru
                .iter()
                .copied()
                .find(|k| self.map.get(k).is_some_and(|o| o.borrow().refs == 0))
            else {
                return;
            };
            self.map.remove(&victim);
            self.lru.retain(|k| *k != victim);
        }
    }
}
