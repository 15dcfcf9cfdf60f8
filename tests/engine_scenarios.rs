//! End-to-end scenarios against the public engine API: persistence across
//! reopen, bulk loads checked against an oracle, reclamation accounting,
//! snapshot isolation, and forced tree growth.

use wrendb::{Engine, Options};

fn open_engine(dir: &tempfile::TempDir) -> Engine {
    Engine::open(dir.path().join("scenario.db"), Options::default()).unwrap()
}

/// Distinct 8-byte keys drawn from a shuffled range, paired with the
/// big-endian encoding of the underlying number as the value.
fn shuffled_keys(count: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
    // 7919 is coprime with any power of ten, so this permutes 0..count.
    (0..count)
        .map(|i| {
            let n = (i * 7919) % count;
            let bytes = n.to_be_bytes().to_vec();
            (bytes.clone(), bytes)
        })
        .collect()
}

#[test]
fn single_key_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let engine = open_engine(&dir);
        engine.set(b"a", b"1").unwrap();
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get(b"b").unwrap(), None);
        engine.close().unwrap();
    }

    let engine = open_engine(&dir);
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    engine.close().unwrap();
}

#[test]
fn ten_thousand_shuffled_keys_scan_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir);
    let pairs = shuffled_keys(10_000);

    let mut writer = engine.writer();
    for (key, val) in &pairs {
        writer.set(key, val).unwrap();
    }
    writer.commit().unwrap();

    // Point lookups return the matching value.
    for (key, val) in pairs.iter().step_by(97) {
        assert_eq!(engine.get(key).unwrap().as_ref(), Some(val));
    }

    // A full scan yields every key in increasing order.
    let reader = engine.reader();
    let mut cursor = reader.scan().unwrap();
    let mut count = 0u64;
    let mut last: Option<Vec<u8>> = None;
    while let Some((key, val)) = cursor.next().unwrap() {
        if let Some(prev) = &last {
            assert!(prev < &key, "scan out of order at {:?}", key);
        }
        assert_eq!(key, val);
        last = Some(key);
        count += 1;
    }
    assert_eq!(count, 10_000);

    drop(reader);
    let report = engine.check().unwrap();
    assert!(report.leaked.is_empty());
    engine.close().unwrap();
}

#[test]
fn deleting_even_keys_leaves_only_odd_keys() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir);
    let pairs = shuffled_keys(2_000);

    let mut writer = engine.writer();
    for (key, val) in &pairs {
        writer.set(key, val).unwrap();
    }
    writer.commit().unwrap();

    let mut writer = engine.writer();
    for n in (0..2_000u64).step_by(2) {
        assert!(writer.delete(&n.to_be_bytes()).unwrap());
    }
    writer.commit().unwrap();

    let reader = engine.reader();
    let mut cursor = reader.scan().unwrap();
    let mut seen = 0;
    while let Some((key, _)) = cursor.next().unwrap() {
        let n = u64::from_be_bytes(key.as_slice().try_into().unwrap());
        assert_eq!(n % 2, 1, "even key {} survived deletion", n);
        seen += 1;
    }
    assert_eq!(seen, 1_000);
    drop(reader);

    // check() verifies that no page is referenced by both the tree and the
    // free-list, and that every page is accounted for.
    let report = engine.check().unwrap();
    assert!(report.leaked.is_empty());
    engine.close().unwrap();
}

#[test]
fn snapshot_keeps_deleted_keys_visible_until_closed() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir);

    let mut writer = engine.writer();
    for n in 0..64u64 {
        writer.set(&n.to_be_bytes(), &n.to_be_bytes()).unwrap();
    }
    writer.commit().unwrap();

    let snapshot = engine.reader();

    let mut writer = engine.writer();
    for n in 0..64u64 {
        assert!(writer.delete(&n.to_be_bytes()).unwrap());
    }
    writer.commit().unwrap();

    // The old snapshot still sees the full key set, including through more
    // unrelated commits.
    engine.set(b"unrelated", b"x").unwrap();
    let probe = 1u64.to_be_bytes();
    assert_eq!(
        snapshot.get(&probe).unwrap(),
        Some(probe.to_vec()),
        "snapshot lost a deleted key"
    );

    snapshot.close();

    // After the snapshot closes and a later commit reclaims, new readers
    // see none of the deleted keys.
    engine.set(b"unrelated", b"y").unwrap();
    let fresh = engine.reader();
    for n in 0..64u64 {
        assert_eq!(fresh.get(&n.to_be_bytes()).unwrap(), None);
    }
    drop(fresh);
    engine.close().unwrap();
}

#[test]
fn large_values_force_a_root_split_at_depth_two() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir);

    // 1000-byte values under short keys: a handful of entries overflow the
    // root leaf and grow the tree by one level.
    let mut writer = engine.writer();
    let mut inserted = 0;
    for i in 0..6 {
        let key = format!("k{}", i);
        writer.set(key.as_bytes(), &[i as u8; 1000]).unwrap();
        inserted += 1;
    }
    writer.commit().unwrap();

    let report = engine.check().unwrap();
    assert_eq!(report.depth, 2, "expected a pointer root over leaves");

    for i in 0..inserted {
        let key = format!("k{}", i);
        assert_eq!(
            engine.get(key.as_bytes()).unwrap(),
            Some(vec![i as u8; 1000])
        );
    }
    engine.close().unwrap();
}

#[test]
fn values_can_be_empty_and_keys_single_byte() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir);

    engine.set(b"k", b"").unwrap();
    engine.set(&[0x00], b"zero").unwrap();
    engine.set(&[0xff], b"max").unwrap();

    assert_eq!(engine.get(b"k").unwrap(), Some(Vec::new()));
    assert_eq!(engine.get(&[0x00]).unwrap(), Some(b"zero".to_vec()));
    assert_eq!(engine.get(&[0xff]).unwrap(), Some(b"max".to_vec()));

    let reader = engine.reader();
    let mut cursor = reader.scan().unwrap();
    let first = cursor.next().unwrap().unwrap();
    assert_eq!(first.0, vec![0x00]);
    drop(cursor);
    drop(reader);
    engine.close().unwrap();
}

#[test]
fn seek_resumes_mid_range() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(&dir);

    let mut writer = engine.writer();
    for n in (0..1000u64).step_by(2) {
        writer.set(&n.to_be_bytes(), b"v").unwrap();
    }
    writer.commit().unwrap();

    let reader = engine.reader();

    // Seek to a present key.
    let mut cursor = reader.seek(&500u64.to_be_bytes()).unwrap();
    let (key, _) = cursor.next().unwrap().unwrap();
    assert_eq!(u64::from_be_bytes(key.as_slice().try_into().unwrap()), 500);

    // Seek to an absent key resumes at the next greater one.
    let mut cursor = reader.seek(&501u64.to_be_bytes()).unwrap();
    let (key, _) = cursor.next().unwrap().unwrap();
    assert_eq!(u64::from_be_bytes(key.as_slice().try_into().unwrap()), 502);

    drop(reader);
    engine.close().unwrap();
}

#[test]
fn reopen_after_heavy_churn_preserves_content_and_accounting() {
    let dir = tempfile::tempdir().unwrap();

    {
        let engine = open_engine(&dir);
        for round in 0..3 {
            let mut writer = engine.writer();
            for n in 0..500u64 {
                let val = format!("round{}-{}", round, n);
                writer.set(&n.to_be_bytes(), val.as_bytes()).unwrap();
            }
            writer.commit().unwrap();

            let mut writer = engine.writer();
            for n in (0..500u64).filter(|n| n % 5 == round) {
                writer.delete(&n.to_be_bytes()).unwrap();
            }
            writer.commit().unwrap();
        }
        engine.close().unwrap();
    }

    let engine = open_engine(&dir);
    let report = engine.check().unwrap();
    assert!(report.leaked.is_empty(), "leaked: {:?}", report.leaked);

    for n in 0..500u64 {
        let expected_deleted = n % 5 == 2;
        let value = engine.get(&n.to_be_bytes()).unwrap();
        if expected_deleted {
            assert_eq!(value, None, "key {} should have been deleted", n);
        } else {
            assert_eq!(value, Some(format!("round2-{}", n).into_bytes()));
        }
    }
    engine.close().unwrap();
}
