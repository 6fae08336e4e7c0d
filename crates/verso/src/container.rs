//! Container lifecycle.
//!
//! Containers live in the pool's container index, a key tree keyed by the
//! container uuid. Each container record owns one object index; destroying
//! a container tears down the OI and every object beneath it inside a
//! single transaction.

use tracing::debug;
use uuid::Uuid;

use verso_btree::{self as btree, AllVisible, BtrIter, ProbeOp, ProbeSpec};
use verso_error::{Result, VosError};
use verso_mem::scoped_tx;
use verso_types::{Cx, Intent, KeyClass, PmAddr};

use crate::object::free_obj_record;
use crate::pool::VosPool;

/// Container record cell.
#[derive(Debug, Clone)]
pub struct ContRecord {
    pub oi_root: PmAddr,
}

/// An open container handle.
#[derive(Debug, Clone)]
pub struct VosContainer {
    pub uuid: Uuid,
    pub(crate) oi_root: PmAddr,
}

/// Create a container under the pool transaction.
pub fn cont_create(pool: &mut VosPool, cx: &Cx, uuid: Uuid) -> Result<()> {
    let index = pool.cont_index()?;
    let key = *uuid.as_bytes();
    if btree::lookup(&pool.pm, index, &key, 0, Intent::Default, &AllVisible).is_ok() {
        return Err(VosError::Exist);
    }
    scoped_tx(&mut pool.pm, cx, |pm| {
        let oi_root = btree::create(pm, KeyClass::Opaque)?;
        let rec = pm.alloc(ContRecord { oi_root }, 64)?;
        match btree::upsert(pm, index, &key, 0, rec)? {
            btree::Upsert::Inserted => Ok(()),
            btree::Upsert::Found(_) => Err(VosError::Exist),
        }
    })?;
    debug!(%uuid, "container created");
    Ok(())
}

/// Open a container handle.
pub fn cont_open(pool: &VosPool, uuid: Uuid) -> Result<VosContainer> {
    let index = pool.cont_index()?;
    let key = *uuid.as_bytes();
    let (_, rec) = btree::lookup(&pool.pm, index, &key, 0, Intent::Default, &AllVisible)?;
    let oi_root = pool.pm.get::<ContRecord>(rec)?.oi_root;
    Ok(VosContainer { uuid, oi_root })
}

/// Close a container handle.
pub fn cont_close(cont: VosContainer) {
    debug!(uuid = %cont.uuid, "container closed");
}

/// Destroy a container and everything it owns.
pub fn cont_destroy(pool: &mut VosPool, cx: &Cx, uuid: Uuid) -> Result<()> {
    let index = pool.cont_index()?;
    let key = *uuid.as_bytes();
    let VosPool { pm, io, cache, .. } = pool;
    let (_, rec) = btree::lookup(pm, index, &key, 0, Intent::Default, &AllVisible)?;
    let oi_root = pm.get::<ContRecord>(rec)?.oi_root;

    scoped_tx(pm, cx, |pm| {
        for orec in crate::tree::collect_recs(pm, oi_root)? {
            free_obj_record(pm, io, orec)?;
        }
        btree::destroy(pm, oi_root, &mut |_, _| Ok(()))?;

        let mut it = BtrIter::new(pm, index)?;
        it.probe(
            pm,
            ProbeSpec::key(ProbeOp::Eq, &key, 0),
            Intent::Default,
            &AllVisible,
        )?;
        let rec = it.delete(pm, index)?;
        pm.free(rec)
    })?;
    cache.evict_cont(uuid);
    debug!(%uuid, "container destroyed");
    Ok(())
}
