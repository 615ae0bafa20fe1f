use tidemark_storage::{Batch, Entry, IterOptions, MergeOperator, RocksStore, Store};

fn make_test_store() -> RocksStore {
    let path = std::env::temp_dir().join(format!("tidemark-storage-{}", fastrand::u64(..)));
    RocksStore::open(&path, vec![max_suffix_operator()]).unwrap()
}

// keeps whichever record carries the greater one-byte suffix; ties go to the
// new operand
fn max_suffix_operator() -> MergeOperator {
    MergeOperator {
        name: "max-suffix",
        merge: |existing, operand| match existing {
            Some(cur) if !cur.is_empty() && !operand.is_empty() && operand[0] < cur[0] => {
                Some(cur.to_vec())
            }
            _ => Some(operand.to_vec()),
        },
    }
}

#[test]
fn put_get_delete_round_trip() {
    let store = make_test_store();

    store.put(b"k1", b"v1").unwrap();
    assert_eq!(store.get(b"k1").unwrap(), Some(b"v1".to_vec()));

    store.delete(b"k1").unwrap();
    assert_eq!(store.get(b"k1").unwrap(), None);
    assert_eq!(store.get(b"missing").unwrap(), None);
}

#[test]
fn forward_iteration_in_key_order() {
    let store = make_test_store();

    let entries: Vec<Entry> = (0u8..5)
        .map(|i| Entry::new(vec![b'p', 0, i], vec![i]))
        .collect();
    store.batch_put(&entries).unwrap();
    store.put(b"q-outside", b"x").unwrap();

    let mut seen = Vec::new();
    let mut it = store.iter(IterOptions::default());
    it.seek(&[b'p', 0]);
    while it.valid_for_prefix(&[b'p', 0]) {
        seen.push(it.key().unwrap().to_vec());
        it.next();
    }

    let expected: Vec<Vec<u8>> = (0u8..5).map(|i| vec![b'p', 0, i]).collect();
    assert_eq!(seen, expected);
}

#[test]
fn reverse_iteration_from_upper_bound() {
    let store = make_test_store();

    for i in 0u8..4 {
        store.put(&[b'r', i], &[i]).unwrap();
    }

    let mut it = store.iter(IterOptions::reverse());
    it.seek(&[b'r', 0xff]);
    let mut seen = Vec::new();
    while it.valid_for_prefix(&[b'r']) {
        seen.push(it.key().unwrap()[1]);
        it.next();
    }

    assert_eq!(seen, vec![3, 2, 1, 0]);
}

#[test]
fn truncate_deletes_prefix_from_min() {
    let store = make_test_store();

    for i in 0u8..10 {
        store.put(&[b't', i], b"v").unwrap();
    }
    store.put(b"u-keep", b"v").unwrap();

    // batch_size smaller than the range forces several delete rounds
    store.truncate(&[b't'], &[b't', 3], 2).unwrap();

    for i in 0u8..3 {
        assert!(store.get(&[b't', i]).unwrap().is_some(), "below min must survive");
    }
    for i in 3u8..10 {
        assert!(store.get(&[b't', i]).unwrap().is_none(), "key {i} should be gone");
    }
    assert!(store.get(b"u-keep").unwrap().is_some());
}

#[test]
fn merge_operator_keeps_max() {
    let store = make_test_store();

    store.merge(b"m1", &[2, b'a']).unwrap();
    store.merge(b"m1", &[5, b'b']).unwrap();
    store.merge(b"m1", &[3, b'c']).unwrap();

    assert_eq!(store.get(b"m1").unwrap(), Some(vec![5, b'b']));

    // re-merging the winner is idempotent, ties prefer the newest operand
    store.merge(b"m1", &[5, b'd']).unwrap();
    assert_eq!(store.get(b"m1").unwrap(), Some(vec![5, b'd']));
}

#[test]
fn mixed_write_batch_is_applied() {
    let store = make_test_store();
    store.put(b"gone", b"v").unwrap();

    store
        .write(Batch {
            puts: vec![Entry::new(&b"put"[..], &b"v1"[..])],
            merges: vec![Entry::new(&b"merged"[..], &[7u8, b'z'][..])],
            deletes: vec![b"gone".to_vec()],
        })
        .unwrap();

    assert_eq!(store.get(b"put").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(store.get(b"merged").unwrap(), Some(vec![7, b'z']));
    assert_eq!(store.get(b"gone").unwrap(), None);
}
