//! MIN/MAX key and extent queries.
//!
//! `query_key` selects the lexicographic minimum or maximum live dkey
//! and/or akey at the query epoch, optionally with the matching minimum or
//! maximum visible extent. Liveness is visibility: a key punched at or
//! before the query epoch is skipped together with everything beneath it,
//! and a dkey whose akeys are all dead falls back to the next candidate in
//! query direction.

use tracing::debug;

use verso_btree::{BtrIter, ProbeOp, ProbeSpec};
use verso_error::{Result, VosError};
use verso_evtree::{EvtFilter, EvtIter, IterFlags};
use verso_mem::PmPool;
use verso_types::{Epoch, EpochRange, Extent, Intent, ObjectId, PmAddr, Recx, EPOCH_MAX};

use crate::container::VosContainer;
use crate::pool::VosPool;
use crate::tree::{key_tree_find, sv_fetch, KeyBody, KeyRecord, KrecCheck, TreeCtx};

/// Query selector flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryFlags {
    pub dkey: bool,
    pub akey: bool,
    pub recx: bool,
    pub max: bool,
    pub min: bool,
}

impl QueryFlags {
    fn validate(&self, dkey_given: bool) -> Result<()> {
        if self.max == self.min {
            return Err(VosError::inval("exactly one of MIN and MAX must be set"));
        }
        if !self.dkey && !self.akey {
            return Err(VosError::inval("query selects neither dkey nor akey"));
        }
        if self.recx && !self.akey {
            return Err(VosError::inval("extent query requires akey selection"));
        }
        if !self.dkey && !dkey_given {
            return Err(VosError::inval("akey query requires a dkey"));
        }
        Ok(())
    }
}

/// Query result; fields are populated per the requested flags.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub dkey: Option<Vec<u8>>,
    pub akey: Option<Vec<u8>>,
    pub recx: Option<Recx>,
}

/// First key of `tree` in query direction, if any.
fn first_key(pm: &PmPool, tree: PmAddr, max: bool, ctx: TreeCtx<'_>) -> Result<Option<Vec<u8>>> {
    let mut it = BtrIter::new(pm, tree)?;
    let spec = if max { ProbeSpec::Last } else { ProbeSpec::First };
    match it.probe(pm, spec, Intent::Default, &KrecCheck(ctx)) {
        Ok(()) => Ok(Some(it.fetch(pm)?.0.key.clone())),
        Err(VosError::NonExist) => Ok(None),
        Err(e) => Err(e),
    }
}

/// The key after `key` in query direction, skipping its remaining
/// generations.
fn next_key(
    pm: &PmPool,
    tree: PmAddr,
    key: &[u8],
    max: bool,
    ctx: TreeCtx<'_>,
) -> Result<Option<Vec<u8>>> {
    let mut it = BtrIter::new(pm, tree)?;
    // In (key asc, epoch desc) order, (key, EPOCH_MAX) is the first slot
    // of a key and (key, 0) the last.
    let spec = if max {
        ProbeSpec::key(ProbeOp::Lt, key, EPOCH_MAX)
    } else {
        ProbeSpec::key(ProbeOp::Gt, key, 0)
    };
    match it.probe(pm, spec, Intent::Default, &KrecCheck(ctx)) {
        Ok(()) => Ok(Some(it.fetch(pm)?.0.key.clone())),
        Err(VosError::NonExist) => Ok(None),
        Err(e) => Err(e),
    }
}

/// The min/max visible, non-hole extent of an array subtree at `epoch`.
fn edge_extent(
    pm: &PmPool,
    evt_root: PmAddr,
    epoch: Epoch,
    max: bool,
    ctx: TreeCtx<'_>,
) -> Result<Option<Extent>> {
    let mut flags = IterFlags::visible_no_holes();
    flags.reverse = max;
    let mut it = EvtIter::prepare(
        pm,
        evt_root,
        flags,
        EvtFilter {
            ext: Extent::new(0, u64::MAX - 1).expect("constant bounds"),
            epr: EpochRange::new(0, epoch).expect("zero lower bound"),
        },
    )?;
    match it.probe(pm, ctx.resolver) {
        Ok(()) => {
            let (sel, _) = it.fetch()?;
            Ok(Some(sel.sel))
        }
        Err(VosError::NonExist) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Whether the akey generation holds any live value at `epoch`; returns
/// the extent edge when one is requested.
fn akey_live(
    pm: &PmPool,
    body: KeyBody,
    epoch: Epoch,
    flags: QueryFlags,
    ctx: TreeCtx<'_>,
) -> Result<Option<Option<Extent>>> {
    match body {
        KeyBody::Array(evt_root) => {
            let edge = edge_extent(pm, evt_root, epoch, flags.max, ctx)?;
            Ok(edge.map(|e| if flags.recx { Some(e) } else { None }))
        }
        KeyBody::Single(sv_root) if !flags.recx => match sv_fetch(pm, sv_root, epoch, ctx) {
            Ok((_, sv)) if !sv.punched && sv.rsize > 0 => Ok(Some(None)),
            Ok(_) => Ok(None),
            Err(VosError::NonExist) => Ok(None),
            Err(e) => Err(e),
        },
        _ => Ok(None),
    }
}

/// Select the min/max live akey beneath one dkey generation.
fn best_akey(
    pm: &PmPool,
    ak_tree: PmAddr,
    epoch: Epoch,
    flags: QueryFlags,
    ctx: TreeCtx<'_>,
) -> Result<Option<(Vec<u8>, Option<Extent>)>> {
    let mut cur = first_key(pm, ak_tree, flags.max, ctx)?;
    while let Some(akey) = cur {
        match key_tree_find(pm, ak_tree, &akey, epoch, ctx) {
            Ok((_, addr)) => {
                let body = pm.get::<KeyRecord>(addr)?.body;
                if let Some(edge) = akey_live(pm, body, epoch, flags, ctx)? {
                    return Ok(Some((akey, edge)));
                }
            }
            Err(VosError::NonExist) => {}
            Err(e) => return Err(e),
        }
        cur = next_key(pm, ak_tree, &akey, flags.max, ctx)?;
    }
    Ok(None)
}

/// Query the min/max live dkey and/or akey (and optionally the matching
/// extent) of one object at `epoch`.
pub fn query_key(
    pool: &mut VosPool,
    cont: &VosContainer,
    oid: ObjectId,
    flags: QueryFlags,
    epoch: Epoch,
    dkey_in: Option<&[u8]>,
    dth: Option<&crate::tree::DtxHandle>,
) -> Result<QueryResult> {
    flags.validate(dkey_in.is_some())?;
    debug!(%oid, epoch, ?flags, "key query");

    let VosPool {
        pm,
        cache,
        resolver,
        ..
    } = pool;
    let ctx = VosPool::tree_ctx(resolver.as_ref(), dth, Intent::Default);

    let obj = cache.hold(pm, cont.oi_root, cont.uuid, oid, epoch, false, ctx)?;
    let res = (|| {
        if matches!(
            obj.borrow().visibility(pm, epoch)?,
            crate::tree::Visibility::Tombstoned | crate::tree::Visibility::NotYet
        ) {
            return Err(VosError::NonExist);
        }
        let dkey_tree = obj.borrow().dkey_root_ro(pm)?;
        if dkey_tree.is_null() {
            return Err(VosError::NonExist);
        }

        // Examine one dkey candidate; Some(result) ends the scan.
        let probe_dkey = |dk_bytes: &[u8]| -> Result<Option<QueryResult>> {
            let dkrec = match key_tree_find(pm, dkey_tree, dk_bytes, epoch, ctx) {
                Ok((_, addr)) => addr,
                Err(VosError::NonExist) => return Ok(None),
                Err(e) => return Err(e),
            };
            let ak_tree = match pm.get::<KeyRecord>(dkrec)?.body {
                KeyBody::Tree(t) => t,
                _ => return Ok(None),
            };
            if !flags.akey {
                // Dkey-only queries still require something live beneath.
                // The liveness witness is the same akey scan the joint
                // query runs, with the selected akey and extent edge
                // discarded, so this path pays the full per-candidate
                // tree descents.
                let mut probe = flags;
                probe.akey = true;
                probe.recx = false;
                return Ok(best_akey(pm, ak_tree, epoch, probe, ctx)?.map(|_| QueryResult {
                    dkey: Some(dk_bytes.to_vec()),
                    ..QueryResult::default()
                }));
            }
            Ok(
                best_akey(pm, ak_tree, epoch, flags, ctx)?.map(|(akey, edge)| QueryResult {
                    dkey: flags.dkey.then(|| dk_bytes.to_vec()),
                    akey: Some(akey),
                    recx: edge.map(Recx::from),
                }),
            )
        };

        if flags.dkey {
            let mut cur = first_key(pm, dkey_tree, flags.max, ctx)?;
            while let Some(dk) = cur {
                if let Some(result) = probe_dkey(&dk)? {
                    return Ok(result);
                }
                cur = next_key(pm, dkey_tree, &dk, flags.max, ctx)?;
            }
            Err(VosError::NonExist)
        } else {
            let dk = dkey_in.expect("validated above");
            probe_dkey(dk)?.ok_or(VosError::NonExist)
        }
    })();
    let rel = cache.release(&obj);
    let out = res?;
    rel?;
    Ok(out)
}
