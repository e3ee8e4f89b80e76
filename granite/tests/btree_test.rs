use std::sync::Arc;

use granite::{BPlusTree, BufferPoolManager, GenericKey, Pager, Rid};
use rand::seq::SliceRandom;
use tempfile::tempdir;

fn pool(size: usize) -> (tempfile::TempDir, Arc<BufferPoolManager>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().unwrap();
    let pager = Pager::open(dir.path().join("test.db")).unwrap();
    (dir, Arc::new(BufferPoolManager::new(size, pager)))
}

fn collect_keys(tree: &BPlusTree<i64, i64>) -> Vec<i64> {
    let mut keys = Vec::new();
    let mut it = tree.iter().unwrap();
    while !it.is_end() {
        keys.push(it.entry().0);
        it.next();
    }
    keys
}

#[test]
fn test_insert_and_point_query() {
    let (_dir, bpm) = pool(32);
    let tree: BPlusTree<i64, i64> = BPlusTree::new("primary", bpm);

    assert!(tree.is_empty());
    for key in 1..=50 {
        assert!(tree.insert(&key, &(key * 2)).unwrap());
    }
    assert!(!tree.is_empty());
    for key in 1..=50 {
        assert_eq!(tree.get_value(&key).unwrap(), Some(key * 2));
    }
    assert_eq!(tree.get_value(&99).unwrap(), None);
    tree.check_integrity().unwrap();
}

#[test]
fn test_duplicate_insert_is_rejected() {
    let (_dir, bpm) = pool(32);
    let tree: BPlusTree<i64, i64> = BPlusTree::new("primary", bpm);

    assert!(tree.insert(&7, &70).unwrap());
    assert!(!tree.insert(&7, &71).unwrap());
    assert_eq!(tree.get_value(&7).unwrap(), Some(70));
}

#[test]
fn test_leaf_split_shape() {
    let (_dir, bpm) = pool(32);
    // max_size 4 leaves: the fourth insert splits the root leaf.
    let tree: BPlusTree<i64, i64> = BPlusTree::new_with_max_sizes("primary", bpm.clone(), 4, 4);

    for key in 1..=5 {
        assert!(tree.insert(&key, &key).unwrap());
    }
    tree.check_integrity().unwrap();

    let root = bpm.fetch_page(tree.root_page_id()).unwrap();
    {
        let page = root.read();
        assert!(!page.is_leaf_node());
        assert_eq!(page.tree_size(), 2);

        let left = bpm.fetch_page(page.internal_value_at::<i64>(0)).unwrap();
        let right = bpm.fetch_page(page.internal_value_at::<i64>(1)).unwrap();
        assert_eq!(left.read().tree_size(), 2);
        assert_eq!(right.read().tree_size(), 3);
        bpm.unpin_page(left.read().id, false);
        bpm.unpin_page(right.read().id, false);
    }
    bpm.unpin_page(root.read().id, false);

    assert_eq!(collect_keys(&tree), vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_remove_collapses_to_single_leaf() {
    let (_dir, bpm) = pool(32);
    let tree: BPlusTree<i64, i64> = BPlusTree::new_with_max_sizes("primary", bpm.clone(), 6, 6);

    for key in 1..=10 {
        assert!(tree.insert(&key, &key).unwrap());
    }
    for key in 6..=10 {
        tree.remove(&key).unwrap();
    }
    tree.check_integrity().unwrap();

    for key in 1..=5 {
        assert_eq!(tree.get_value(&key).unwrap(), Some(key));
    }
    for key in 6..=10 {
        assert_eq!(tree.get_value(&key).unwrap(), None);
    }

    let root = bpm.fetch_page(tree.root_page_id()).unwrap();
    assert!(root.read().is_leaf_node());
    assert_eq!(root.read().tree_size(), 5);
    bpm.unpin_page(root.read().id, false);
}

#[test]
fn test_remove_everything_empties_the_tree() {
    let (_dir, bpm) = pool(32);
    let tree: BPlusTree<i64, i64> = BPlusTree::new_with_max_sizes("primary", bpm, 4, 4);

    for key in 1..=20 {
        assert!(tree.insert(&key, &key).unwrap());
    }
    for key in 1..=20 {
        tree.remove(&key).unwrap();
    }
    assert!(tree.is_empty());
    assert_eq!(tree.get_value(&1).unwrap(), None);

    // Removing from an empty tree is a no-op, and the tree can regrow.
    tree.remove(&1).unwrap();
    assert!(tree.insert(&1, &1).unwrap());
    assert_eq!(tree.get_value(&1).unwrap(), Some(1));
}

#[test]
fn test_iteration_is_sorted() {
    let (_dir, bpm) = pool(32);
    let tree: BPlusTree<i64, i64> = BPlusTree::new_with_max_sizes("primary", bpm, 4, 4);

    let mut keys: Vec<i64> = (1..=100).collect();
    keys.shuffle(&mut rand::thread_rng());
    for key in &keys {
        assert!(tree.insert(key, &(key * 10)).unwrap());
    }
    tree.check_integrity().unwrap();

    assert_eq!(collect_keys(&tree), (1..=100).collect::<Vec<i64>>());

    // iter_from starts at the first key >= the probe.
    let mut it = tree.iter_from(&37).unwrap();
    let mut seen = Vec::new();
    while !it.is_end() {
        seen.push(it.entry().0);
        it.next();
    }
    assert_eq!(seen, (37..=100).collect::<Vec<i64>>());

    let mut it = tree.iter_from(&1000).unwrap();
    assert!(it.is_end());
    drop(it);
}

#[test]
fn test_random_churn_keeps_invariants() {
    let (_dir, bpm) = pool(64);
    let tree: BPlusTree<i64, i64> = BPlusTree::new_with_max_sizes("primary", bpm, 8, 8);

    let mut rng = rand::thread_rng();
    let mut keys: Vec<i64> = (0..500).collect();
    keys.shuffle(&mut rng);
    for key in &keys {
        assert!(tree.insert(key, key).unwrap());
    }
    tree.check_integrity().unwrap();

    keys.shuffle(&mut rng);
    let (gone, kept) = keys.split_at(250);
    for key in gone {
        tree.remove(key).unwrap();
    }
    tree.check_integrity().unwrap();

    for key in gone {
        assert_eq!(tree.get_value(key).unwrap(), None);
    }
    let mut remaining: Vec<i64> = kept.to_vec();
    remaining.sort_unstable();
    assert_eq!(collect_keys(&tree), remaining);
}

#[test]
fn test_survives_a_small_buffer_pool() {
    // The pool is far smaller than the tree; operations must not leak pins.
    // A full-height split can legitimately hold two pages per level plus
    // the header page, so the pool is small but not starved.
    let (_dir, bpm) = pool(24);
    let tree: BPlusTree<i64, i64> = BPlusTree::new_with_max_sizes("primary", bpm, 4, 4);

    for key in 0..300 {
        assert!(tree.insert(&key, &key).unwrap());
    }
    for key in (0..300).step_by(2) {
        tree.remove(&key).unwrap();
    }
    for key in 0..300 {
        let expected = if key % 2 == 0 { None } else { Some(key) };
        assert_eq!(tree.get_value(&key).unwrap(), expected);
    }
    tree.check_integrity().unwrap();
}

#[test]
fn test_concurrent_disjoint_inserts() {
    const THREADS: i64 = 4;
    const PER_THREAD: i64 = 200;

    let (_dir, bpm) = pool(64);
    let tree: Arc<BPlusTree<i64, i64>> = Arc::new(BPlusTree::new("primary", bpm));

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let tree = tree.clone();
            s.spawn(move || {
                // Interleaved ranges so threads collide on the same leaves.
                for i in 0..PER_THREAD {
                    let key = i * THREADS + t;
                    assert!(tree.insert(&key, &key).unwrap());
                }
            });
        }
    });

    tree.check_integrity().unwrap();
    let keys = collect_keys(&tree);
    assert_eq!(keys.len(), (THREADS * PER_THREAD) as usize);
    assert_eq!(keys, (0..THREADS * PER_THREAD).collect::<Vec<i64>>());
}

#[test]
fn test_concurrent_mixed_workload() {
    const THREADS: i64 = 4;
    const PER_THREAD: i64 = 150;

    let (_dir, bpm) = pool(64);
    let tree: Arc<BPlusTree<i64, i64>> = Arc::new(BPlusTree::new_with_max_sizes(
        "primary", bpm, 16, 16,
    ));

    for key in 0..THREADS * PER_THREAD {
        assert!(tree.insert(&key, &key).unwrap());
    }

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let tree = tree.clone();
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    let key = i * THREADS + t;
                    if key % 2 == 0 {
                        tree.remove(&key).unwrap();
                    } else {
                        assert_eq!(tree.get_value(&key).unwrap(), Some(key));
                    }
                }
            });
        }
    });

    tree.check_integrity().unwrap();
    for key in 0..THREADS * PER_THREAD {
        let expected = if key % 2 == 0 { None } else { Some(key) };
        assert_eq!(tree.get_value(&key).unwrap(), expected);
    }
}

#[test]
fn test_generic_keys_and_rids() {
    let (_dir, bpm) = pool(32);
    let tree: BPlusTree<GenericKey<8>, Rid> = BPlusTree::new("orders_pk", bpm);

    for i in 0..200i64 {
        let key = GenericKey::<8>::from_integer(i);
        let rid = Rid::new((i / 16) as i32 + 1, (i % 16) as u32);
        assert!(tree.insert(&key, &rid).unwrap());
    }
    for i in 0..200i64 {
        let key = GenericKey::<8>::from_integer(i);
        let rid = tree.get_value(&key).unwrap().unwrap();
        assert_eq!(rid, Rid::new((i / 16) as i32 + 1, (i % 16) as u32));
    }

    let mut it = tree.iter().unwrap();
    let mut previous = None;
    while !it.is_end() {
        let (key, _) = it.entry();
        if let Some(p) = previous {
            assert!(p < key);
        }
        previous = Some(key);
        it.next();
    }
}

#[test]
fn test_root_page_id_survives_in_header_page() {
    let (_dir, bpm) = pool(32);
    let tree: BPlusTree<i64, i64> = BPlusTree::new("primary", bpm.clone());

    for key in 1..=10 {
        tree.insert(&key, &key).unwrap();
    }
    let frame = bpm.fetch_page(granite::HEADER_PAGE_ID).unwrap();
    let recorded = {
        let mut page = frame.write();
        granite::header_page::HeaderPage::new(&mut page)
            .get_record("primary")
            .unwrap()
    };
    bpm.unpin_page(granite::HEADER_PAGE_ID, false);
    assert_eq!(recorded, tree.root_page_id());
}
