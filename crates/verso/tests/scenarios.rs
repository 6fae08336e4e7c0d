//! End-to-end scenarios over the full engine stack.

use std::sync::Arc;

use uuid::Uuid;

use verso::{
    cont_create, cont_open, iter_nested, iter_prepare, obj_fetch, obj_punch, obj_update,
    oi_clear_attr, oi_get_attr, oi_set_attr, query_key, zc_fetch, zc_update, EpochExpr, IterEntry,
    IterParam, IterType, Iod, IodType, QueryFlags, SgList, VosContainer, VosPool,
};
use verso_error::VosError;
use verso_evtree::IterFlags;
use verso_types::{
    Cx, DtxId, DtxResolver, DtxState, EpochRange, FaultInjector, FaultMode, FaultSite,
    InstanceConfig, ObjectId, Recx, OF_DKEY_UINT64,
};

fn setup() -> (VosPool, VosContainer) {
    let mut pool = VosPool::create(Uuid::new_v4(), &InstanceConfig::default()).unwrap();
    let uuid = Uuid::new_v4();
    cont_create(&mut pool, &Cx::new(), uuid).unwrap();
    let cont = cont_open(&pool, uuid).unwrap();
    (pool, cont)
}

fn oid(n: u64) -> ObjectId {
    ObjectId::new(0, n)
}

fn array_iod(akey: &[u8], rsize: u64, recxs: Vec<Recx>) -> Iod {
    Iod {
        akey: akey.to_vec(),
        kind: IodType::Array,
        rsize,
        recxs,
    }
}

fn single_iod(akey: &[u8], rsize: u64) -> Iod {
    Iod {
        akey: akey.to_vec(),
        kind: IodType::Single,
        rsize,
        recxs: Vec::new(),
    }
}

fn write_extent(
    pool: &mut VosPool,
    cont: &VosContainer,
    o: ObjectId,
    epoch: u64,
    dkey: &[u8],
    akey: &[u8],
    idx: u64,
    data: &[u8],
) {
    let iod = array_iod(akey, 1, vec![Recx::new(idx, data.len() as u64)]);
    let sgl = SgList::one(data.to_vec());
    obj_update(pool, &Cx::new(), cont, o, epoch, dkey, &[iod], &[sgl], None).unwrap();
}

fn fetch_extent(
    pool: &mut VosPool,
    cont: &VosContainer,
    o: ObjectId,
    epoch: u64,
    dkey: &[u8],
    akey: &[u8],
    idx: u64,
    nr: u64,
) -> (u64, Vec<u8>) {
    let iod = array_iod(akey, 1, vec![Recx::new(idx, nr)]);
    let mut sgls = vec![SgList::one(vec![0u8; nr as usize])];
    let res = obj_fetch(pool, &Cx::new(), cont, o, epoch, dkey, &[iod], &mut sgls, None).unwrap();
    (res.rsize[0], sgls.remove(0).iovs.remove(0))
}

fn write_single(
    pool: &mut VosPool,
    cont: &VosContainer,
    o: ObjectId,
    epoch: u64,
    dkey: &[u8],
    akey: &[u8],
    data: &[u8],
) {
    let iod = single_iod(akey, data.len() as u64);
    let sgl = SgList::one(data.to_vec());
    obj_update(pool, &Cx::new(), cont, o, epoch, dkey, &[iod], &[sgl], None).unwrap();
}

fn fetch_single(
    pool: &mut VosPool,
    cont: &VosContainer,
    o: ObjectId,
    epoch: u64,
    dkey: &[u8],
    akey: &[u8],
    cap: usize,
) -> (u64, Vec<u8>) {
    let iod = single_iod(akey, 0);
    let mut sgls = vec![SgList::one(vec![0u8; cap])];
    let res = obj_fetch(pool, &Cx::new(), cont, o, epoch, dkey, &[iod], &mut sgls, None).unwrap();
    let size = res.rsize[0];
    let mut buf = sgls.remove(0).iovs.remove(0);
    buf.truncate(size as usize);
    (size, buf)
}

fn count_dkeys(pool: &mut VosPool, cont: &VosContainer, o: ObjectId, epoch: u64) -> usize {
    let param = IterParam::new(o, EpochRange::point(epoch));
    let mut it = match iter_prepare(pool, cont, &param, None) {
        Ok(it) => it,
        Err(VosError::NonExist) => return 0,
        Err(e) => panic!("prepare failed: {e}"),
    };
    let mut n = 0;
    if it.probe(pool, None).is_ok() {
        n += 1;
        while it.next(pool, None).is_ok() {
            n += 1;
        }
    }
    it.finish(pool).unwrap();
    n
}

// ---------------------------------------------------------------------------
// Spec scenarios
// ---------------------------------------------------------------------------

#[test]
fn hole_read_yields_zeros_between_extents() {
    let (mut pool, cont) = setup();
    let o = oid(1);
    write_extent(&mut pool, &cont, o, 1, b"dkey", b"akey", 0, &[b'A'; 1024]);
    write_extent(&mut pool, &cont, o, 1, b"dkey", b"akey", 2048, &[b'C'; 1024]);

    let (rsize, data) = fetch_extent(&mut pool, &cont, o, 1, b"dkey", b"akey", 0, 3072);
    assert_eq!(rsize, 1);
    assert_eq!(&data[..1024], &[b'A'; 1024][..]);
    assert_eq!(&data[1024..2048], &[0u8; 1024][..]);
    assert_eq!(&data[2048..], &[b'C'; 1024][..]);
}

#[test]
fn epoch_shadowing_partial_overwrite() {
    let (mut pool, cont) = setup();
    let o = oid(2);
    write_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 0, &[b'A'; 1024]);
    write_extent(&mut pool, &cont, o, 2, b"dk", b"ak", 512, &[b'B'; 512]);

    let (_, at2) = fetch_extent(&mut pool, &cont, o, 2, b"dk", b"ak", 0, 1024);
    assert_eq!(&at2[..512], &[b'A'; 512][..]);
    assert_eq!(&at2[512..], &[b'B'; 512][..]);

    let (_, at1) = fetch_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 0, 1024);
    assert_eq!(&at1[..], &[b'A'; 1024][..]);
}

#[test]
fn punch_hides_descendants_from_iteration() {
    let (mut pool, cont) = setup();
    let o = oid(3);
    let cx = Cx::new();
    for i in 0..100u32 {
        let dkey = format!("dkey-{i:03}");
        write_extent(&mut pool, &cont, o, 1, dkey.as_bytes(), b"ak", 0, &[1, 2, 3, 4]);
    }
    for i in 0..10u32 {
        let dkey = format!("dkey-{i:03}");
        obj_punch(&mut pool, &cx, &cont, o, 2, Some(dkey.as_bytes()), &[], None).unwrap();
    }

    assert_eq!(count_dkeys(&mut pool, &cont, o, 2), 90);
    assert_eq!(count_dkeys(&mut pool, &cont, o, 1), 100);

    // Punched dkeys read as empty at or above the punch and intact below.
    let (rsize, _) = fetch_extent(&mut pool, &cont, o, 2, b"dkey-005", b"ak", 0, 4);
    assert_eq!(rsize, 0);
    let (rsize, data) = fetch_extent(&mut pool, &cont, o, 1, b"dkey-005", b"ak", 0, 4);
    assert_eq!(rsize, 1);
    assert_eq!(data, vec![1, 2, 3, 4]);
}

#[test]
fn query_min_max_after_akey_punches() {
    let (mut pool, cont) = setup();
    let o = oid(4);
    let cx = Cx::new();

    // A smaller dkey with one live akey, for the fallback case.
    write_extent(&mut pool, &cont, o, 1, b"d0", b"a05", 0, &[9; 4]);
    // The main dkey with akeys a01..a10.
    for i in 1..=10u32 {
        let akey = format!("a{i:02}");
        write_extent(&mut pool, &cont, o, 1, b"d1", akey.as_bytes(), 0, &[7; 4]);
    }
    // Punch the edges at e=2.
    obj_punch(
        &mut pool,
        &cx,
        &cont,
        o,
        2,
        Some(b"d1"),
        &[b"a01".to_vec(), b"a10".to_vec()],
        None,
    )
    .unwrap();

    let min = QueryFlags {
        akey: true,
        min: true,
        ..QueryFlags::default()
    };
    let max = QueryFlags {
        akey: true,
        max: true,
        ..QueryFlags::default()
    };

    let r = query_key(&mut pool, &cont, o, min, 2, Some(b"d1"), None).unwrap();
    assert_eq!(r.akey.as_deref(), Some(&b"a02"[..]));
    let r = query_key(&mut pool, &cont, o, max, 2, Some(b"d1"), None).unwrap();
    assert_eq!(r.akey.as_deref(), Some(&b"a09"[..]));
    // Below the punches both edges are intact.
    let r = query_key(&mut pool, &cont, o, max, 1, Some(b"d1"), None).unwrap();
    assert_eq!(r.akey.as_deref(), Some(&b"a10"[..]));

    // Punch the middle too; d1 has nothing left at e=3.
    let middle: Vec<Vec<u8>> = (2..=9u32).map(|i| format!("a{i:02}").into_bytes()).collect();
    obj_punch(&mut pool, &cx, &cont, o, 3, Some(b"d1"), &middle, None).unwrap();

    assert!(matches!(
        query_key(&mut pool, &cont, o, max, 3, Some(b"d1"), None),
        Err(VosError::NonExist)
    ));
    // The joint query falls back to the previous dkey's largest akey.
    let joint = QueryFlags {
        dkey: true,
        akey: true,
        max: true,
        ..QueryFlags::default()
    };
    let r = query_key(&mut pool, &cont, o, joint, 3, None, None).unwrap();
    assert_eq!(r.dkey.as_deref(), Some(&b"d0"[..]));
    assert_eq!(r.akey.as_deref(), Some(&b"a05"[..]));
}

#[test]
fn single_value_epoch_expressions() {
    let (mut pool, cont) = setup();
    let o = oid(5);
    for e in [2u64, 4, 6, 8] {
        write_single(&mut pool, &cont, o, e, b"dk", b"ak", &e.to_le_bytes());
    }

    let probe_one = |pool: &mut VosPool, expr: EpochExpr, epr: EpochRange| -> Result<u64, VosError> {
        let mut param = IterParam::new(o, epr);
        param.dkey = Some(b"dk".to_vec());
        param.akey = Some(b"ak".to_vec());
        param.epc_expr = expr;
        let mut it = iter_prepare(pool, &cont, &param, None)?;
        let out = it.probe(pool, None).and_then(|()| match it.fetch(pool)? {
            IterEntry::Single { epoch, .. } => Ok(epoch),
            other => panic!("unexpected entry {other:?}"),
        });
        it.finish(pool).unwrap();
        out
    };

    assert_eq!(
        probe_one(&mut pool, EpochExpr::Le, EpochRange::new(5, 9).unwrap()).unwrap(),
        4
    );
    assert_eq!(
        probe_one(&mut pool, EpochExpr::Ge, EpochRange::new(5, 9).unwrap()).unwrap(),
        6
    );
    assert_eq!(
        probe_one(&mut pool, EpochExpr::Eq, EpochRange::point(4)).unwrap(),
        4
    );
    assert!(matches!(
        probe_one(&mut pool, EpochExpr::Eq, EpochRange::point(5)),
        Err(VosError::NonExist)
    ));

    // RR over [3, 7] enumerates 6 then 4.
    let mut param = IterParam::new(o, EpochRange::new(3, 7).unwrap());
    param.dkey = Some(b"dk".to_vec());
    param.akey = Some(b"ak".to_vec());
    param.epc_expr = EpochExpr::Rr;
    let mut it = iter_prepare(&mut pool, &cont, &param, None).unwrap();
    it.probe(&pool, None).unwrap();
    let mut seen = Vec::new();
    loop {
        match it.fetch(&pool).unwrap() {
            IterEntry::Single { epoch, .. } => seen.push(epoch),
            other => panic!("unexpected entry {other:?}"),
        }
        match it.next(&pool, None) {
            Ok(()) => {}
            Err(VosError::NonExist) => break,
            Err(e) => panic!("next failed: {e}"),
        }
    }
    it.finish(&mut pool).unwrap();
    assert_eq!(seen, vec![6, 4]);
}

#[test]
fn nested_iterator_teardown_order_is_enforced() {
    let (mut pool, cont) = setup();
    let o = oid(6);
    write_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 0, &[1; 8]);

    let param = IterParam::new(o, EpochRange::point(1));
    let mut dkey_it = iter_prepare(&mut pool, &cont, &param, None).unwrap();
    dkey_it.probe(&pool, None).unwrap();

    let akey_it = iter_nested(
        &pool,
        &mut dkey_it,
        IterType::Akey,
        EpochExpr::default(),
        IterFlags::default(),
    )
    .unwrap();

    // Tearing the parent down first is a programmer error.
    assert!(matches!(
        dkey_it.finish(&mut pool),
        Err(VosError::Inval { .. })
    ));
    // Child first, then the parent is already gone but the borrow is
    // balanced again.
    akey_it.finish(&mut pool).unwrap();
}

// ---------------------------------------------------------------------------
// Round-trip and idempotence laws
// ---------------------------------------------------------------------------

#[test]
fn update_fetch_round_trip() {
    let (mut pool, cont) = setup();
    let o = oid(7);
    let payload: Vec<u8> = (0..=255u8).cycle().take(2000).collect();
    write_extent(&mut pool, &cont, o, 5, b"dk", b"ak", 100, &payload);
    let (rsize, data) = fetch_extent(&mut pool, &cont, o, 5, b"dk", b"ak", 100, 2000);
    assert_eq!(rsize, 1);
    assert_eq!(data, payload);

    write_single(&mut pool, &cont, o, 5, b"dk", b"sv", b"value-bytes");
    let (size, data) = fetch_single(&mut pool, &cont, o, 5, b"dk", b"sv", 64);
    assert_eq!(size, 11);
    assert_eq!(data, b"value-bytes");
}

#[test]
fn punch_then_fetch_reads_empty() {
    let (mut pool, cont) = setup();
    let o = oid(8);
    let cx = Cx::new();
    write_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 0, &[5; 16]);

    // Object-level punch.
    obj_punch(&mut pool, &cx, &cont, o, 2, None, &[], None).unwrap();
    let (rsize, data) = fetch_extent(&mut pool, &cont, o, 3, b"dk", b"ak", 0, 16);
    assert_eq!(rsize, 0);
    assert_eq!(data, vec![0u8; 16]);
    // Below the punch the data is intact.
    let (rsize, data) = fetch_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 0, 16);
    assert_eq!(rsize, 1);
    assert_eq!(data, vec![5u8; 16]);
}

#[test]
fn repeated_update_at_same_epoch_is_stable() {
    let (mut pool, cont) = setup();
    let o = oid(9);
    write_extent(&mut pool, &cont, o, 3, b"dk", b"ak", 0, &[7; 64]);
    // Identical re-write: a no-op.
    write_extent(&mut pool, &cont, o, 3, b"dk", b"ak", 0, &[7; 64]);
    let (_, data) = fetch_extent(&mut pool, &cont, o, 3, b"dk", b"ak", 0, 64);
    assert_eq!(data, vec![7u8; 64]);

    // Differing re-write of the exact extent: deterministic last writer.
    write_extent(&mut pool, &cont, o, 3, b"dk", b"ak", 0, &[8; 64]);
    let (_, data) = fetch_extent(&mut pool, &cont, o, 3, b"dk", b"ak", 0, 64);
    assert_eq!(data, vec![8u8; 64]);
}

#[test]
fn partially_overlapping_same_epoch_write_is_exist() {
    let (mut pool, cont) = setup();
    let o = oid(10);
    write_extent(&mut pool, &cont, o, 3, b"dk", b"ak", 0, &[7; 64]);

    let iod = array_iod(b"ak", 1, vec![Recx::new(32, 64)]);
    let sgl = SgList::one(vec![9u8; 64]);
    let rc = obj_update(&mut pool, &Cx::new(), &cont, o, 3, b"dk", &[iod], &[sgl], None);
    assert!(matches!(rc, Err(VosError::Exist)));
    // The failed transaction left the original intact.
    let (_, data) = fetch_extent(&mut pool, &cont, o, 3, b"dk", b"ak", 0, 64);
    assert_eq!(data, vec![7u8; 64]);
}

// ---------------------------------------------------------------------------
// Boundaries and malformed input
// ---------------------------------------------------------------------------

#[test]
fn extents_at_index_space_edges() {
    let (mut pool, cont) = setup();
    let o = oid(11);
    write_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 0, &[1]);
    write_extent(&mut pool, &cont, o, 1, b"dk", b"ak", u64::MAX - 1, &[2]);

    let (_, lo) = fetch_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 0, 1);
    assert_eq!(lo, vec![1]);
    let (_, hi) = fetch_extent(&mut pool, &cont, o, 1, b"dk", b"ak", u64::MAX - 1, 1);
    assert_eq!(hi, vec![2]);
}

#[test]
fn multi_recx_iod_with_gaps() {
    let (mut pool, cont) = setup();
    let o = oid(12);
    let iod = array_iod(b"ak", 1, vec![Recx::new(0, 4), Recx::new(100, 4)]);
    let sgls = vec![SgList {
        iovs: vec![vec![1u8; 4], vec![2u8; 4]],
    }];
    obj_update(&mut pool, &Cx::new(), &cont, o, 1, b"dk", &iod_slice(&iod), &sgls, None).unwrap();

    let read = array_iod(b"ak", 1, vec![Recx::new(0, 4), Recx::new(100, 4)]);
    let mut out = vec![SgList {
        iovs: vec![vec![0u8; 4], vec![0u8; 4]],
    }];
    obj_fetch(
        &mut pool,
        &Cx::new(),
        &cont,
        o,
        1,
        b"dk",
        &iod_slice(&read),
        &mut out,
        None,
    )
    .unwrap();
    assert_eq!(out[0].iovs[0], vec![1u8; 4]);
    assert_eq!(out[0].iovs[1], vec![2u8; 4]);
}

fn iod_slice(iod: &Iod) -> Vec<Iod> {
    vec![iod.clone()]
}

#[test]
fn zero_length_key_is_inval() {
    let (mut pool, cont) = setup();
    let o = oid(13);
    let iod = array_iod(b"ak", 1, vec![Recx::new(0, 4)]);
    let sgl = SgList::one(vec![0u8; 4]);
    let rc = obj_update(&mut pool, &Cx::new(), &cont, o, 1, b"", &[iod], &[sgl], None);
    assert!(matches!(rc, Err(VosError::Inval { .. })));
}

#[test]
fn zero_rsize_update_is_inval() {
    let (mut pool, cont) = setup();
    let o = oid(14);
    let iod = array_iod(b"ak", 0, vec![Recx::new(0, 4)]);
    let sgl = SgList::one(vec![0u8; 4]);
    let rc = obj_update(&mut pool, &Cx::new(), &cont, o, 1, b"dk", &[iod], &[sgl], None);
    assert!(matches!(rc, Err(VosError::Inval { .. })));
}

#[test]
fn conflicting_feature_bits_are_inval() {
    let (mut pool, cont) = setup();
    let o = ObjectId::new(0, 15)
        .with_features(OF_DKEY_UINT64 | verso_types::OF_DKEY_LEXICAL);
    let iod = array_iod(b"ak", 1, vec![Recx::new(0, 4)]);
    let sgl = SgList::one(vec![0u8; 4]);
    let rc = obj_update(&mut pool, &Cx::new(), &cont, o, 1, b"dk", &[iod], &[sgl], None);
    assert!(matches!(rc, Err(VosError::Inval { .. })));
}

#[test]
fn overflow_reports_required_size() {
    let (mut pool, cont) = setup();
    let o = oid(16);
    write_single(&mut pool, &cont, o, 1, b"dk", b"ak", &[3; 100]);

    let iod = single_iod(b"ak", 0);
    let mut sgls = vec![SgList::one(vec![0u8; 10])];
    let rc = obj_fetch(&mut pool, &Cx::new(), &cont, o, 1, b"dk", &[iod], &mut sgls, None);
    assert!(matches!(rc, Err(VosError::Overflow { required: 100 })));
}

#[test]
fn uint64_dkeys_iterate_numerically() {
    let (mut pool, cont) = setup();
    let o = ObjectId::new(0, 17).with_features(OF_DKEY_UINT64);
    for k in [300u64, 2, 10] {
        write_extent(&mut pool, &cont, o, 1, &k.to_le_bytes(), b"ak", 0, &[1; 4]);
    }
    let param = IterParam::new(o, EpochRange::point(1));
    let mut it = iter_prepare(&mut pool, &cont, &param, None).unwrap();
    it.probe(&pool, None).unwrap();
    let mut order = Vec::new();
    loop {
        if let IterEntry::Key { key, .. } = it.fetch(&pool).unwrap() {
            order.push(u64::from_le_bytes(key.as_slice().try_into().unwrap()));
        }
        if it.next(&pool, None).is_err() {
            break;
        }
    }
    it.finish(&mut pool).unwrap();
    assert_eq!(order, vec![2, 10, 300]);
}

// ---------------------------------------------------------------------------
// Iteration details
// ---------------------------------------------------------------------------

#[test]
fn conditional_dkey_iteration() {
    let (mut pool, cont) = setup();
    let o = oid(18);
    write_extent(&mut pool, &cont, o, 1, b"d1", b"wanted", 0, &[1; 4]);
    write_extent(&mut pool, &cont, o, 1, b"d2", b"other", 0, &[1; 4]);
    write_extent(&mut pool, &cont, o, 1, b"d3", b"wanted", 0, &[1; 4]);

    let mut param = IterParam::new(o, EpochRange::point(1));
    param.cond_akey = Some(b"wanted".to_vec());
    let mut it = iter_prepare(&mut pool, &cont, &param, None).unwrap();
    it.probe(&pool, None).unwrap();
    let mut keys = Vec::new();
    loop {
        if let IterEntry::Key { key, .. } = it.fetch(&pool).unwrap() {
            keys.push(key);
        }
        if it.next(&pool, None).is_err() {
            break;
        }
    }
    it.finish(&mut pool).unwrap();
    assert_eq!(keys, vec![b"d1".to_vec(), b"d3".to_vec()]);

    // A ranged condition window is refused.
    let mut param = IterParam::new(o, EpochRange::new(0, 1).unwrap());
    param.cond_akey = Some(b"wanted".to_vec());
    let mut it = iter_prepare(&mut pool, &cont, &param, None).unwrap();
    assert!(matches!(
        it.probe(&pool, None),
        Err(VosError::Inval { .. })
    ));
    it.finish(&mut pool).unwrap();
}

#[test]
fn recx_iteration_reports_visibility() {
    let (mut pool, cont) = setup();
    let o = oid(19);
    write_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 0, &[1; 100]);
    write_extent(&mut pool, &cont, o, 2, b"dk", b"ak", 50, &[2; 100]);

    let mut param = IterParam::new(o, EpochRange::new(0, 2).unwrap());
    param.dkey = Some(b"dk".to_vec());
    param.akey = Some(b"ak".to_vec());
    param.flags = IterFlags::visible();
    let mut it = iter_prepare(&mut pool, &cont, &param, None).unwrap();
    it.probe(&pool, None).unwrap();
    let mut runs = Vec::new();
    loop {
        if let IterEntry::Recx { epoch, recx, .. } = it.fetch(&pool).unwrap() {
            runs.push((epoch, recx.idx, recx.nr));
        }
        if it.next(&pool, None).is_err() {
            break;
        }
    }
    it.finish(&mut pool).unwrap();
    assert_eq!(runs, vec![(1, 0, 50), (2, 50, 100)]);
}

#[test]
fn akey_iteration_under_one_dkey() {
    let (mut pool, cont) = setup();
    let o = oid(20);
    write_extent(&mut pool, &cont, o, 1, b"dk", b"a1", 0, &[1; 4]);
    write_single(&mut pool, &cont, o, 1, b"dk", b"a2", &[2; 8]);

    let mut param = IterParam::new(o, EpochRange::point(1));
    param.dkey = Some(b"dk".to_vec());
    let mut it = iter_prepare(&mut pool, &cont, &param, None).unwrap();
    it.probe(&pool, None).unwrap();
    let mut found = Vec::new();
    loop {
        if let IterEntry::Key { key, child, .. } = it.fetch(&pool).unwrap() {
            found.push((key, child));
        }
        if it.next(&pool, None).is_err() {
            break;
        }
    }
    it.finish(&mut pool).unwrap();
    assert_eq!(
        found,
        vec![
            (b"a1".to_vec(), IterType::Recx),
            (b"a2".to_vec(), IterType::Single),
        ]
    );
}

// ---------------------------------------------------------------------------
// Cache, attributes, zero-copy, faults, DTX
// ---------------------------------------------------------------------------

#[test]
fn cache_eviction_is_transparent() {
    let (mut pool, cont) = setup();
    let o = oid(21);
    write_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 0, &[9; 32]);

    let before = fetch_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 0, 32);
    pool.evict_object(&cont, o);
    let after = fetch_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 0, 32);
    assert_eq!(before, after);
}

#[test]
fn object_attributes() {
    let (mut pool, cont) = setup();
    let o = oid(22);
    let cx = Cx::new();

    // Nonexistent object reads attr 0.
    assert_eq!(oi_get_attr(&mut pool, &cont, o, 1, None).unwrap(), 0);

    oi_set_attr(&mut pool, &cx, &cont, o, 1, 0x5, None).unwrap();
    assert_eq!(oi_get_attr(&mut pool, &cont, o, 2, None).unwrap(), 0x5);
    oi_clear_attr(&mut pool, &cx, &cont, o, 2, 0x1, None).unwrap();
    assert_eq!(oi_get_attr(&mut pool, &cont, o, 3, None).unwrap(), 0x4);

    // Reserved bits are rejected in both directions.
    assert!(matches!(
        oi_set_attr(&mut pool, &cx, &cont, o, 3, verso::OI_PUNCHED, None),
        Err(VosError::Inval { .. })
    ));
    assert!(matches!(
        oi_clear_attr(&mut pool, &cx, &cont, o, 3, verso::OI_REMOVED, None),
        Err(VosError::Inval { .. })
    ));
}

#[test]
fn zero_copy_update_and_fetch() {
    let (mut pool, cont) = setup();
    let o = oid(23);
    let cx = Cx::new();
    let iod = array_iod(b"ak", 1, vec![Recx::new(0, 64)]);

    zc_update(
        &mut pool,
        &cx,
        &cont,
        o,
        1,
        b"dk",
        &[iod.clone()],
        |biod| {
            biod.buf_mut(0)?.copy_from_slice(&[0xcd; 64]);
            Ok(())
        },
        None,
    )
    .unwrap();

    let mut got = Vec::new();
    zc_fetch(
        &mut pool,
        &cx,
        &cont,
        o,
        1,
        b"dk",
        &[iod],
        |biod| {
            got = biod.buf(0)?.to_vec();
            Ok(())
        },
        None,
    )
    .unwrap();
    assert_eq!(got, vec![0xcd; 64]);

    // The regular fetch path agrees.
    let (_, data) = fetch_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 0, 64);
    assert_eq!(data, vec![0xcd; 64]);
}

#[test]
fn injected_nvme_failure_aborts_the_update() {
    let inj = Arc::new(FaultInjector::new(FaultSite::NvmeSubmit, FaultMode::Once));
    let mut pool =
        VosPool::create_with_fault_hook(Uuid::new_v4(), &InstanceConfig::default(), inj).unwrap();
    let uuid = Uuid::new_v4();
    cont_create(&mut pool, &Cx::new(), uuid).unwrap();
    let cont = cont_open(&pool, uuid).unwrap();
    let o = oid(24);

    // Payloads above the inline threshold take the NVMe path.
    let big = vec![0x11u8; 8192];
    let iod = array_iod(b"ak", 1, vec![Recx::new(0, 8192)]);
    let rc = obj_update(
        &mut pool,
        &Cx::new(),
        &cont,
        o,
        1,
        b"dk",
        &[iod],
        &[SgList::one(big.clone())],
        None,
    );
    assert!(matches!(rc, Err(VosError::Io { .. })));

    // The abort left no trace; the retry succeeds and reads back whole.
    write_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 0, &big);
    let (_, data) = fetch_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 0, 8192);
    assert_eq!(data, big);
}

#[test]
fn injected_checksum_failure_is_one_shot() {
    let inj = Arc::new(FaultInjector::new(
        FaultSite::ChecksumVerify,
        FaultMode::Once,
    ));
    let mut pool =
        VosPool::create_with_fault_hook(Uuid::new_v4(), &InstanceConfig::default(), inj).unwrap();
    let uuid = Uuid::new_v4();
    cont_create(&mut pool, &Cx::new(), uuid).unwrap();
    let cont = cont_open(&pool, uuid).unwrap();
    let o = oid(25);

    write_single(&mut pool, &cont, o, 1, b"dk", b"ak", &[6; 32]);

    let iod = single_iod(b"ak", 0);
    let mut sgls = vec![SgList::one(vec![0u8; 32])];
    let rc = obj_fetch(&mut pool, &Cx::new(), &cont, o, 1, b"dk", &[iod.clone()], &mut sgls, None);
    assert!(matches!(rc, Err(VosError::Io { .. })));

    // The injector fired once; the data itself is sound.
    let (size, data) = fetch_single(&mut pool, &cont, o, 1, b"dk", b"ak", 32);
    assert_eq!(size, 32);
    assert_eq!(data, vec![6u8; 32]);
}

#[test]
fn cancellation_aborts_without_partial_state() {
    let (mut pool, cont) = setup();
    let o = oid(26);
    let cx = Cx::new();
    cx.cancel();
    let iod = array_iod(b"ak", 1, vec![Recx::new(0, 16)]);
    let rc = obj_update(
        &mut pool,
        &cx,
        &cont,
        o,
        1,
        b"dk",
        &[iod],
        &[SgList::one(vec![1u8; 16])],
        None,
    );
    assert!(matches!(rc, Err(VosError::Cancelled)));
    // Nothing persisted: the object does not exist.
    let rc = obj_fetch(
        &mut pool,
        &Cx::new(),
        &cont,
        o,
        1,
        b"dk",
        &[array_iod(b"ak", 1, vec![Recx::new(0, 16)])],
        &mut [SgList::one(vec![0u8; 16])],
        None,
    );
    assert!(matches!(rc, Err(VosError::NonExist)));
}

struct AllPrepared;

impl DtxResolver for AllPrepared {
    fn state(&self, _id: DtxId) -> DtxState {
        DtxState::Prepared
    }
}

#[test]
fn unresolved_dtx_surfaces_inprogress() {
    let (mut pool, cont) = setup();
    let o = oid(27);
    let dth = verso::DtxHandle::new(DtxId(77));

    let iod = array_iod(b"ak", 1, vec![Recx::new(0, 8)]);
    obj_update(
        &mut pool,
        &Cx::new(),
        &cont,
        o,
        1,
        b"dk",
        &[iod.clone()],
        &[SgList::one(vec![4u8; 8])],
        Some(&dth),
    )
    .unwrap();
    assert!(dth.is_prepared());

    // With the entry still unresolved at the coordinator, plain readers
    // block.
    pool.set_resolver(Box::new(AllPrepared));
    let mut sgls = vec![SgList::one(vec![0u8; 8])];
    let rc = obj_fetch(&mut pool, &Cx::new(), &cont, o, 1, b"dk", &[iod], &mut sgls, None);
    assert!(matches!(rc, Err(VosError::InProgress)));
}

#[test]
fn extent_punch_reads_as_zeroes() {
    let (mut pool, cont) = setup();
    let o = oid(28);
    write_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 0, &[5; 64]);

    // An empty buffer writes a hole entry over part of the range.
    let iod = array_iod(b"ak", 1, vec![Recx::new(0, 32)]);
    let sgl = SgList::one(Vec::new());
    obj_update(&mut pool, &Cx::new(), &cont, o, 2, b"dk", &[iod], &[sgl], None).unwrap();

    let (_, at2) = fetch_extent(&mut pool, &cont, o, 2, b"dk", b"ak", 0, 64);
    assert_eq!(&at2[..32], &[0u8; 32][..]);
    assert_eq!(&at2[32..], &[5u8; 32][..]);
    let (_, at1) = fetch_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 0, 64);
    assert_eq!(&at1[..], &[5u8; 64][..]);
}

#[test]
fn query_extent_edges() {
    let (mut pool, cont) = setup();
    let o = oid(29);
    write_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 10, &[1; 10]);
    write_extent(&mut pool, &cont, o, 1, b"dk", b"ak", 50, &[2; 10]);

    let min = QueryFlags {
        akey: true,
        recx: true,
        min: true,
        ..QueryFlags::default()
    };
    let max = QueryFlags {
        akey: true,
        recx: true,
        max: true,
        ..QueryFlags::default()
    };
    let r = query_key(&mut pool, &cont, o, min, 1, Some(b"dk"), None).unwrap();
    assert_eq!(r.recx, Some(Recx::new(10, 10)));
    let r = query_key(&mut pool, &cont, o, max, 1, Some(b"dk"), None).unwrap();
    assert_eq!(r.recx, Some(Recx::new(50, 10)));

    // Both or neither of MIN/MAX is invalid.
    let bad = QueryFlags {
        akey: true,
        min: true,
        max: true,
        ..QueryFlags::default()
    };
    assert!(matches!(
        query_key(&mut pool, &cont, o, bad, 1, Some(b"dk"), None),
        Err(VosError::Inval { .. })
    ));
}
