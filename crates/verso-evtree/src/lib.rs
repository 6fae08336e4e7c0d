//! EVT: the epoch-versioned extent tree.
//!
//! A 1-D interval index over contiguous record ranges. Each entry carries
//! `(epoch, [lo,hi], version, addr)`; the record size is fixed per tree and
//! pinned by the first insert. The tree answers the covering-epoch
//! question: for a probe window at reader epoch `E`, an entry `X` with
//! `epoch(X) <= E` is *visible* over the positions of its extent that no
//! entry `Y` with `epoch(X) < epoch(Y) <= E` overwrites; overwritten
//! positions are *covered*; positions no entry reaches are *holes* (the
//! iterator never synthesizes them. Gaps between visible segments are the
//! caller's holes, while punched ranges appear as entries whose address
//! carries the hole bit).
//!
//! Entry descriptors are embedded in the root cell ordered by
//! `(lo asc, epoch desc)`; payloads live behind their [`BioAddr`].

use std::cmp::Ordering;

use tracing::debug;

use verso_error::{Result, VosError};
use verso_mem::PmPool;
use verso_types::{BioAddr, DtxId, DtxResolver, DtxState, Epoch, EpochRange, Extent, PmAddr};

// ---------------------------------------------------------------------------
// On-PM layout
// ---------------------------------------------------------------------------

/// One extent entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvtDesc {
    pub epoch: Epoch,
    pub ext: Extent,
    /// Pool-map version stamped by the writer.
    pub ver: u32,
    pub addr: BioAddr,
    /// xxh3 of the payload; zero for holes.
    pub csum: u64,
    pub dtx: Option<DtxId>,
}

/// Tree root cell.
#[derive(Debug, Clone)]
pub struct EvtRoot {
    /// Record size in bytes; zero until the first insert pins it.
    inob: u32,
    /// Ordered by `(ext.lo asc, epoch desc)`.
    entries: Vec<EvtDesc>,
}

fn desc_order(a: &EvtDesc, b: &EvtDesc) -> Ordering {
    a.ext
        .lo()
        .cmp(&b.ext.lo())
        .then(a.epoch.cmp(&b.epoch).reverse())
        .then(a.ext.hi().cmp(&b.ext.hi()))
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Create an empty extent tree, returning its root cell address.
pub fn create(pool: &mut PmPool) -> Result<PmAddr> {
    pool.alloc(
        EvtRoot {
            inob: 0,
            entries: Vec::new(),
        },
        128,
    )
}

/// The pinned record size; zero while the tree is empty.
pub fn inob(pool: &PmPool, root: PmAddr) -> Result<u32> {
    Ok(pool.get::<EvtRoot>(root)?.inob)
}

pub fn is_empty(pool: &PmPool, root: PmAddr) -> Result<bool> {
    Ok(pool.get::<EvtRoot>(root)?.entries.is_empty())
}

/// Destroy the tree, handing every descriptor to `on_entry` so the owner
/// can release payload storage.
pub fn destroy(
    pool: &mut PmPool,
    root: PmAddr,
    on_entry: &mut dyn FnMut(&mut PmPool, &EvtDesc) -> Result<()>,
) -> Result<()> {
    let entries = pool.get::<EvtRoot>(root)?.entries.clone();
    for desc in &entries {
        on_entry(pool, desc)?;
    }
    pool.free(root)
}

// ---------------------------------------------------------------------------
// Insert / replace / delete
// ---------------------------------------------------------------------------

/// Insert an entry.
///
/// The first insert pins the tree's record size; a later mismatch is
/// `Inval`. Any same-epoch overlap is `Exist`, including the exact
/// duplicate, which the caller resolves through [`replace_payload`].
pub fn insert(pool: &mut PmPool, root: PmAddr, rsize: u32, desc: EvtDesc) -> Result<()> {
    if rsize == 0 {
        return Err(VosError::inval("zero record size on extent insert"));
    }
    {
        let r = pool.get::<EvtRoot>(root)?;
        if r.inob != 0 && r.inob != rsize {
            return Err(VosError::inval(format!(
                "record size {rsize} disagrees with tree record size {}",
                r.inob
            )));
        }
        for e in &r.entries {
            if e.epoch == desc.epoch && e.ext.overlaps(&desc.ext) {
                debug!(epoch = desc.epoch, ext = %desc.ext, "same-epoch extent overlap");
                return Err(VosError::Exist);
            }
        }
    }
    let r = pool.get_mut::<EvtRoot>(root)?;
    r.inob = rsize;
    let pos = r
        .entries
        .partition_point(|e| desc_order(e, &desc) == Ordering::Less);
    r.entries.insert(pos, desc);
    Ok(())
}

/// Find the entry with exactly `(epoch, ext)`.
pub fn find_exact(pool: &PmPool, root: PmAddr, epoch: Epoch, ext: Extent) -> Result<Option<EvtDesc>> {
    let r = pool.get::<EvtRoot>(root)?;
    Ok(r.entries
        .iter()
        .find(|e| e.epoch == epoch && e.ext == ext)
        .cloned())
}

/// Deterministically replace the payload of the exact entry `(epoch, ext)`,
/// returning the descriptor it displaced.
pub fn replace_payload(
    pool: &mut PmPool,
    root: PmAddr,
    epoch: Epoch,
    ext: Extent,
    addr: BioAddr,
    csum: u64,
) -> Result<EvtDesc> {
    let r = pool.get_mut::<EvtRoot>(root)?;
    let entry = r
        .entries
        .iter_mut()
        .find(|e| e.epoch == epoch && e.ext == ext)
        .ok_or(VosError::NonExist)?;
    let old = entry.clone();
    entry.addr = addr;
    entry.csum = csum;
    Ok(old)
}

/// Remove the exact entry `(epoch, ext)`. Aggregation-only.
pub fn delete(pool: &mut PmPool, root: PmAddr, epoch: Epoch, ext: Extent) -> Result<EvtDesc> {
    let r = pool.get_mut::<EvtRoot>(root)?;
    let pos = r
        .entries
        .iter()
        .position(|e| e.epoch == epoch && e.ext == ext)
        .ok_or(VosError::NonExist)?;
    Ok(r.entries.remove(pos))
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

/// Iterator mode flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterFlags {
    pub visible: bool,
    pub covered: bool,
    pub skip_holes: bool,
    pub reverse: bool,
    pub for_purge: bool,
    pub for_rebuild: bool,
}

impl IterFlags {
    #[must_use]
    pub fn visible() -> Self {
        Self {
            visible: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn visible_no_holes() -> Self {
        Self {
            visible: true,
            skip_holes: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn covered() -> Self {
        Self {
            covered: true,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.skip_holes && (!self.visible || self.covered) {
            return Err(VosError::inval(
                "skip-holes iteration requires visible mode exclusively",
            ));
        }
        Ok(())
    }
}

/// Probe window: a record-index range and an epoch range. Visibility is
/// computed at `epr.hi`.
#[derive(Debug, Clone, Copy)]
pub struct EvtFilter {
    pub ext: Extent,
    pub epr: EpochRange,
}

/// Classification produced for each selected sub-extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Raw iteration (neither visible nor covered requested).
    Unknown,
    Visible,
    Covered,
}

/// One selected sub-extent of an entry.
#[derive(Debug, Clone)]
pub struct EvtEntrySel {
    /// The originating entry, unclipped.
    pub desc: EvtDesc,
    /// The selected sub-extent within the probe window.
    pub sel: Extent,
    pub vis: Visibility,
}

impl EvtEntrySel {
    /// Byte offset of the selected sub-extent within the entry payload.
    #[must_use]
    pub fn payload_skip(&self, inob: u32) -> u64 {
        (self.sel.lo() - self.desc.ext.lo()) * u64::from(inob)
    }

    /// Byte length of the selected sub-extent.
    #[must_use]
    pub fn payload_len(&self, inob: u32) -> u64 {
        self.sel.width() * u64::from(inob)
    }
}

/// Extent iterator. Materializes the visibility partition of the probe
/// window at [`EvtIter::probe`]; `next`/`fetch` then walk the selection.
#[derive(Debug)]
pub struct EvtIter {
    root: PmAddr,
    flags: IterFlags,
    filter: EvtFilter,
    inob: u32,
    sels: Vec<EvtEntrySel>,
    pos: usize,
    materialized: bool,
}

impl EvtIter {
    /// Prepare an iterator; validates the flag combination.
    pub fn prepare(pool: &PmPool, root: PmAddr, flags: IterFlags, filter: EvtFilter) -> Result<Self> {
        flags.validate()?;
        // Fail early on a dangling root.
        let _ = pool.get::<EvtRoot>(root)?;
        Ok(Self {
            root,
            flags,
            filter,
            inob: 0,
            sels: Vec::new(),
            pos: 0,
            materialized: false,
        })
    }

    /// Position at the first selected sub-extent (last, under `reverse`).
    pub fn probe(&mut self, pool: &PmPool, resolver: &dyn DtxResolver) -> Result<()> {
        let r = pool.get::<EvtRoot>(self.root)?;
        self.inob = r.inob;
        self.sels = partition(&r.entries, &self.filter, self.flags, resolver)?;
        if self.flags.reverse {
            self.sels.reverse();
        }
        self.pos = 0;
        self.materialized = true;
        if self.sels.is_empty() {
            return Err(VosError::NonExist);
        }
        Ok(())
    }

    /// Advance to the next selected sub-extent.
    pub fn next(&mut self) -> Result<()> {
        if !self.materialized {
            return Err(VosError::NoHandle);
        }
        if self.pos + 1 >= self.sels.len() {
            return Err(VosError::NonExist);
        }
        self.pos += 1;
        Ok(())
    }

    /// The selection under the cursor and the tree's record size.
    pub fn fetch(&self) -> Result<(&EvtEntrySel, u32)> {
        if !self.materialized {
            return Err(VosError::NoHandle);
        }
        let sel = self.sels.get(self.pos).ok_or(VosError::NonExist)?;
        Ok((sel, self.inob))
    }

    /// Remove the originating entry of the selection under the cursor,
    /// returning its descriptor. Purge path; the cursor stays on the
    /// materialized snapshot.
    pub fn delete_current(&mut self, pool: &mut PmPool) -> Result<EvtDesc> {
        let (sel, _) = self.fetch()?;
        let (epoch, ext) = (sel.desc.epoch, sel.desc.ext);
        delete(pool, self.root, epoch, ext)
    }

    /// Release the iterator.
    pub fn finish(self) {}
}

/// The covering-epoch sweep: split the candidate entries of the window into
/// visible and covered sub-extents.
fn partition(
    entries: &[EvtDesc],
    filter: &EvtFilter,
    flags: IterFlags,
    resolver: &dyn DtxResolver,
) -> Result<Vec<EvtEntrySel>> {
    let reader = filter.epr.hi;
    let mut cands: Vec<&EvtDesc> = Vec::new();
    for e in entries {
        if !e.ext.overlaps(&filter.ext) || e.epoch > reader || e.epoch < filter.epr.lo {
            continue;
        }
        if let Some(id) = e.dtx {
            match resolver.state(id) {
                DtxState::Committed => {}
                DtxState::Aborted => continue,
                DtxState::Prepared => return Err(VosError::InProgress),
            }
        }
        cands.push(e);
    }

    let want_covered = flags.covered || flags.for_purge || flags.for_rebuild;
    let raw = !flags.visible && !want_covered;
    if raw {
        let mut out: Vec<EvtEntrySel> = cands
            .iter()
            .map(|d| EvtEntrySel {
                desc: (*d).clone(),
                sel: d.ext.intersect(&filter.ext).expect("candidate overlaps"),
                vis: Visibility::Unknown,
            })
            .collect();
        out.sort_by(|a, b| desc_order(&a.desc, &b.desc));
        return Ok(out);
    }

    // Elementary segments between candidate boundaries, clipped to the
    // window.
    let mut bounds: Vec<u64> = Vec::with_capacity(cands.len() * 2 + 2);
    bounds.push(filter.ext.lo());
    bounds.push(filter.ext.hi().saturating_add(1));
    for c in &cands {
        let clip = c.ext.intersect(&filter.ext).expect("candidate overlaps");
        bounds.push(clip.lo());
        bounds.push(clip.hi().saturating_add(1));
    }
    bounds.sort_unstable();
    bounds.dedup();

    let mut segs: Vec<(usize, Extent, Visibility)> = Vec::new();
    for w in bounds.windows(2) {
        let seg = match Extent::new(w[0], w[1] - 1) {
            Some(s) => s,
            None => continue,
        };
        let mut owner: Option<usize> = None;
        for (i, c) in cands.iter().enumerate() {
            if !c.ext.overlaps(&seg) {
                continue;
            }
            match owner {
                Some(o) if cands[o].epoch >= c.epoch => {}
                _ => owner = Some(i),
            }
        }
        let Some(owner) = owner else { continue };
        for (i, c) in cands.iter().enumerate() {
            if !c.ext.overlaps(&seg) {
                continue;
            }
            let vis = if i == owner {
                Visibility::Visible
            } else {
                Visibility::Covered
            };
            segs.push((i, seg, vis));
        }
    }

    // Merge adjacent segments of the same entry and classification.
    segs.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then((a.2 == Visibility::Covered).cmp(&(b.2 == Visibility::Covered)))
            .then(a.1.lo().cmp(&b.1.lo()))
    });
    let mut merged: Vec<(usize, Extent, Visibility)> = Vec::new();
    for (i, seg, vis) in segs {
        match merged.last_mut() {
            Some((mi, mseg, mvis))
                if *mi == i && *mvis == vis && mseg.hi().saturating_add(1) == seg.lo() =>
            {
                *mseg = Extent::new(mseg.lo(), seg.hi()).expect("merge extends");
            }
            _ => merged.push((i, seg, vis)),
        }
    }

    let mut out: Vec<EvtEntrySel> = merged
        .into_iter()
        .filter(|(i, _, vis)| match vis {
            Visibility::Visible => {
                flags.visible && !(flags.skip_holes && cands[*i].addr.is_hole())
            }
            Visibility::Covered | Visibility::Unknown => want_covered,
        })
        .map(|(i, seg, vis)| EvtEntrySel {
            desc: cands[i].clone(),
            sel: seg,
            vis,
        })
        .collect();

    out.sort_by(|a, b| {
        a.sel
            .lo()
            .cmp(&b.sel.lo())
            .then(a.desc.epoch.cmp(&b.desc.epoch).reverse())
    });
    Ok(out)
}
