//! B+Tree scenarios at default order, including persistence through the
//! on-disk format.

use stratadb::common::TupleId;
use stratadb::index::{BPlusTree, IndexKey};
use tempfile::TempDir;

#[test]
fn test_sequential_inserts_split_and_stay_ordered() {
    let tree = BPlusTree::new();
    for i in 0..200 {
        tree.insert(IndexKey::Int(i), TupleId::new(i as u32, i as u16))
            .unwrap();
    }

    assert!(tree.height() > 1);

    let results = tree.range_search(&IndexKey::Int(10), &IndexKey::Int(20));
    assert_eq!(results.len(), 11);
    let keys: Vec<_> = results.iter().map(|(k, _)| k.clone()).collect();
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(keys.first(), Some(&IndexKey::Int(10)));
    assert_eq!(keys.last(), Some(&IndexKey::Int(20)));

    assert_eq!(tree.search(&IndexKey::Int(100)), Some(TupleId::new(100, 100)));
}

#[test]
fn test_random_order_inserts_retrievable() {
    let tree = BPlusTree::new();
    // Deterministic shuffle: stride through the key space.
    let keys: Vec<i64> = (0..500).map(|i| (i * 131) % 500).collect();
    for &k in &keys {
        tree.insert(IndexKey::Int(k), TupleId::new(k as u32, 0))
            .unwrap();
    }

    for k in 0..500 {
        assert_eq!(
            tree.search(&IndexKey::Int(k)),
            Some(TupleId::new(k as u32, 0)),
            "key {}",
            k
        );
    }
    let all = tree.range_search(&IndexKey::Int(0), &IndexKey::Int(499));
    assert_eq!(all.len(), 500);
    assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn test_save_load_preserves_search_and_ranges() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t_id.idx");

    let tree = BPlusTree::new();
    for i in 0..300 {
        tree.insert(IndexKey::Int(i), TupleId::new(i as u32, 1))
            .unwrap();
    }
    tree.save(&path).unwrap();

    let loaded = BPlusTree::load(&path).unwrap();
    assert_eq!(loaded.height(), tree.height());
    assert_eq!(loaded.len(), 300);
    assert_eq!(loaded.search(&IndexKey::Int(299)), Some(TupleId::new(299, 1)));

    let range = loaded.range_search(&IndexKey::Int(120), &IndexKey::Int(180));
    assert_eq!(range.len(), 61);
    assert!(range.windows(2).all(|w| w[0].0 < w[1].0));
}
