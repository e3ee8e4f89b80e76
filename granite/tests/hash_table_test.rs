use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;

use granite::ExtendibleHashTable;

/// Hashes a key to its own value; keeps directory addressing predictable
/// for the structural assertions below.
#[derive(Default, Clone)]
struct IdentityHasher(u64);

impl Hasher for IdentityHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut buf = [0u8; 8];
        let n = bytes.len().min(8);
        buf[..n].copy_from_slice(&bytes[..n]);
        self.0 = u64::from_le_bytes(buf);
    }
}

#[derive(Default, Clone)]
struct IdentityBuild;

impl BuildHasher for IdentityBuild {
    type Hasher = IdentityHasher;

    fn build_hasher(&self) -> IdentityHasher {
        IdentityHasher::default()
    }
}

#[test]
fn test_first_split_doubles_the_directory() {
    let table: ExtendibleHashTable<i32, char, _> =
        ExtendibleHashTable::with_hasher(2, IdentityBuild);

    table.insert(&0, &'a');
    table.insert(&1, &'b');
    table.insert(&2, &'c');

    assert_eq!(table.global_depth(), 1);
    assert_eq!(table.num_buckets(), 2);
    assert_eq!(table.find(&0), Some('a'));
    assert_eq!(table.find(&1), Some('b'));
    assert_eq!(table.find(&2), Some('c'));
}

#[test]
fn test_aliased_slots_share_a_bucket() {
    let table: ExtendibleHashTable<i32, i32, _> =
        ExtendibleHashTable::with_hasher(4, IdentityBuild);

    // Drive the directory deep with keys that all land in low slots.
    for i in 0..32 {
        table.insert(&i, &i);
    }
    let global = table.global_depth();
    assert!(global >= 3);
    // Every slot's local depth is bounded by the global depth.
    for slot in 0..(1usize << global) {
        assert!(table.local_depth(slot) <= global);
    }
}

#[test]
fn test_find_reflects_latest_insert_and_remove() {
    let table = ExtendibleHashTable::new(4);
    for i in 0..200 {
        table.insert(&i, &(i * 3));
    }
    for i in (0..200).step_by(2) {
        assert!(table.remove(&i));
    }
    for i in 0..200 {
        let expected = if i % 2 == 0 { None } else { Some(i * 3) };
        assert_eq!(table.find(&i), expected);
    }
    // Upserts overwrite in place.
    table.insert(&1, &-1);
    assert_eq!(table.find(&1), Some(-1));
    assert!(!table.remove(&0));
}

#[test]
fn test_global_depth_is_nondecreasing() {
    let table = ExtendibleHashTable::new(2);
    let mut last = table.global_depth();
    for i in 0..256 {
        table.insert(&i, &i);
        let depth = table.global_depth();
        assert!(depth >= last);
        last = depth;
    }
    // 256 keys in capacity-2 buckets need at least 128 buckets, so at
    // least 7 directory bits; hash clustering adds a few more on top.
    assert!(last >= 7);
    assert!(last <= 20);
}

#[test]
fn test_concurrent_disjoint_keys() {
    const THREADS: i32 = 8;
    const PER_THREAD: i32 = 500;

    let table: Arc<ExtendibleHashTable<i32, i32>> = Arc::new(ExtendibleHashTable::new(4));

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let table = table.clone();
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    let key = t * PER_THREAD + i;
                    table.insert(&key, &(key * 7));
                    // Read own writes while other threads split buckets.
                    assert_eq!(table.find(&key), Some(key * 7));
                }
            });
        }
    });

    assert_eq!(table.size(), (THREADS * PER_THREAD) as usize);
    for key in 0..THREADS * PER_THREAD {
        assert_eq!(table.find(&key), Some(key * 7));
    }
}

#[test]
fn test_concurrent_mixed_operations() {
    const THREADS: i32 = 6;
    const PER_THREAD: i32 = 300;

    let table: Arc<ExtendibleHashTable<i32, i32>> = Arc::new(ExtendibleHashTable::new(4));
    for key in 0..THREADS * PER_THREAD {
        table.insert(&key, &key);
    }

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let table = table.clone();
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    let key = t * PER_THREAD + i;
                    if key % 3 == 0 {
                        assert!(table.remove(&key));
                    } else {
                        table.insert(&key, &(key + 1));
                    }
                }
            });
        }
    });

    for key in 0..THREADS * PER_THREAD {
        let expected = if key % 3 == 0 { None } else { Some(key + 1) };
        assert_eq!(table.find(&key), expected);
    }
}
