//! The concurrent extendible hash table.
//!
//! A directory of `2^global_depth` slots, each referring to a shared
//! bucket. Buckets whose hashes agree in their low `local_depth` bits are
//! aliased by multiple slots. Overflowing a bucket splits it in two and, if
//! the bucket was at full depth, doubles the directory first.

use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};
use xxhash_rust::xxh3::Xxh3Builder;

struct BucketInner<K, V> {
    local_depth: u32,
    entries: BTreeMap<K, V>,
    /// Set once a split has rebound this bucket's directory slots; a locker
    /// that observes it must re-resolve the slot.
    stale: bool,
}

struct Bucket<K, V> {
    inner: Mutex<BucketInner<K, V>>,
}

impl<K, V> Bucket<K, V> {
    fn with_depth(local_depth: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BucketInner {
                local_depth,
                entries: BTreeMap::new(),
                stale: false,
            }),
        })
    }
}

struct Directory<K, V> {
    global_depth: u32,
    buckets: Vec<Arc<Bucket<K, V>>>,
    num_buckets: usize,
}

pub struct ExtendibleHashTable<K, V, S = Xxh3Builder> {
    bucket_size: usize,
    hasher: S,
    directory: RwLock<Directory<K, V>>,
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Ord + Hash + Clone,
    V: Clone,
{
    pub fn new(bucket_size: usize) -> Self {
        Self::with_hasher(bucket_size, Xxh3Builder::new())
    }
}

impl<K, V, S> ExtendibleHashTable<K, V, S>
where
    K: Ord + Hash + Clone,
    V: Clone,
    S: BuildHasher,
{
    pub fn with_hasher(bucket_size: usize, hasher: S) -> Self {
        assert!(bucket_size > 0);
        Self {
            bucket_size,
            hasher,
            directory: RwLock::new(Directory {
                global_depth: 0,
                buckets: vec![Bucket::with_depth(0)],
                num_buckets: 1,
            }),
        }
    }

    fn hash_key(&self, key: &K) -> u64 {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    fn bucket_index(hash: u64, global_depth: u32) -> usize {
        (hash & ((1u64 << global_depth) - 1)) as usize
    }

    /// Resolves and locks the live bucket for `hash`, then runs `f` on it.
    ///
    /// The slot lookup and the bucket lock cannot be taken atomically, so a
    /// concurrent split may rebind the slot in between; such a bucket is
    /// marked stale under its own lock and the lookup retries.
    fn with_bucket<R>(&self, hash: u64, f: impl FnOnce(&mut BucketInner<K, V>) -> R) -> R {
        let mut f = Some(f);
        loop {
            let bucket = {
                let dir = self.directory.read();
                dir.buckets[Self::bucket_index(hash, dir.global_depth)].clone()
            };
            let mut inner = bucket.inner.lock();
            if inner.stale {
                continue;
            }
            let f = f.take().expect("closure runs once");
            return f(&mut inner);
        }
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let hash = self.hash_key(key);
        self.with_bucket(hash, |bucket| bucket.entries.get(key).cloned())
    }

    pub fn remove(&self, key: &K) -> bool {
        let hash = self.hash_key(key);
        self.with_bucket(hash, |bucket| bucket.entries.remove(key).is_some())
    }

    /// Inserts or overwrites the entry for `key`, splitting the target
    /// bucket as often as needed to make room.
    pub fn insert(&self, key: &K, value: &V) {
        let hash = self.hash_key(key);
        loop {
            let inserted = self.with_bucket(hash, |bucket| {
                if bucket.entries.contains_key(key) || bucket.entries.len() < self.bucket_size {
                    bucket.entries.insert(key.clone(), value.clone());
                    true
                } else {
                    false
                }
            });
            if inserted {
                return;
            }
            self.split_bucket(hash);
            // Pathological distributions may leave the target bucket full
            // even after a split; the loop splits again.
        }
    }

    /// Splits the bucket addressed by `hash`, doubling the directory first
    /// when the bucket is already at global depth. Every step re-checks its
    /// precondition so racing inserts can attempt the same split safely.
    fn split_bucket(&self, hash: u64) {
        let mut dir = self.directory.write();
        let slot = Self::bucket_index(hash, dir.global_depth);
        let bucket = dir.buckets[slot].clone();
        let mut inner = bucket.inner.lock();
        if inner.stale || inner.entries.len() < self.bucket_size {
            return;
        }

        let local_depth = inner.local_depth;
        if local_depth == dir.global_depth {
            let current_size = dir.buckets.len();
            dir.buckets.extend_from_within(..current_size);
            dir.global_depth += 1;
            debug!("hash directory doubled to global depth {}", dir.global_depth);
        }

        debug_assert!(dir.global_depth > local_depth);
        let bucket0 = Bucket::with_depth(local_depth + 1);
        let bucket1 = Bucket::with_depth(local_depth + 1);
        {
            let mut inner0 = bucket0.inner.lock();
            let mut inner1 = bucket1.inner.lock();
            for (k, v) in inner.entries.iter() {
                if (self.hash_key(k) >> local_depth) & 1 == 0 {
                    inner0.entries.insert(k.clone(), v.clone());
                } else {
                    inner1.entries.insert(k.clone(), v.clone());
                }
            }
        }
        for i in 0..dir.buckets.len() {
            if Arc::ptr_eq(&dir.buckets[i], &bucket) {
                dir.buckets[i] = if (i >> local_depth) & 1 == 0 {
                    bucket0.clone()
                } else {
                    bucket1.clone()
                };
            }
        }
        inner.stale = true;
        dir.num_buckets += 1;
        debug!(
            "bucket split at depth {}, {} buckets",
            local_depth + 1,
            dir.num_buckets
        );
    }

    pub fn global_depth(&self) -> u32 {
        self.directory.read().global_depth
    }

    pub fn local_depth(&self, bucket_index: usize) -> u32 {
        let bucket = self.directory.read().buckets[bucket_index].clone();
        let depth = bucket.inner.lock().local_depth;
        depth
    }

    pub fn num_buckets(&self) -> usize {
        self.directory.read().num_buckets
    }

    pub fn size(&self) -> usize {
        let buckets: Vec<_> = {
            let dir = self.directory.read();
            dir.buckets.clone()
        };
        let mut seen: Vec<*const Bucket<K, V>> = Vec::new();
        let mut total = 0;
        for bucket in buckets {
            let ptr = Arc::as_ptr(&bucket);
            if !seen.contains(&ptr) {
                seen.push(ptr);
                total += bucket.inner.lock().entries.len();
            }
        }
        total
    }
}
