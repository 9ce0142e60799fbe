//! Two-function cuckoo-hashed metadata cache.
//!
//! Backs file/directory lookups in the hot path: lock-free reads guarded
//! by an occupancy flag. The table itself does not take locks: it is
//! shared across sessions with readers staying lock-free via the
//! occupancy bit, while [`crate::session`] is responsible for serializing
//! calls to [`CuckooTable::insert`]/[`CuckooTable::delete`] to one
//! outstanding mutation at a time.

pub mod preload;

use thiserror::Error;

/// The cuckoo table's own error type. Deliberately distinct from the
/// transport-facing [`crate::error::Error`]: the cache is usable on its
/// own, independent of any RDMA session.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    #[error("cuckoo table full: insertion could not relocate within the eviction budget")]
    Full,
}

/// Whether the occupancy signal lives on the bucket or on each element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupancyMode {
    PerBucket,
    PerItem,
}

/// Fixed-size value stored per key: enough file/directory metadata to
/// answer `GetFileInfo`/`GetFileAttr`/`GetFileSize` from the cache without
/// a file-service round trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileMetaEntry {
    pub file_id: u32,
    pub size: u64,
    pub is_directory: bool,
    pub modified_at_unix_secs: u64,
}

/// On-disk width of one [`FileMetaEntry`] in a preload file. Fixed by
/// this crate, since the wire layout isn't `repr(C)` and shouldn't be
/// tied to in-memory struct layout.
pub const FILE_META_ENTRY_WIRE_SIZE: usize = 32;

pub fn decode_file_meta_entry(b: &[u8]) -> FileMetaEntry {
    use byteorder::{ByteOrder, LittleEndian};
    FileMetaEntry {
        file_id: LittleEndian::read_u32(&b[0..4]),
        size: LittleEndian::read_u64(&b[8..16]),
        is_directory: b[16] != 0,
        modified_at_unix_secs: LittleEndian::read_u64(&b[24..32]),
    }
}

struct Bucket<V> {
    /// Stored hash-1 of whichever key occupies each slot; `0` means
    /// vacant.
    hash1: Vec<u64>,
    keys: Vec<u64>,
    values: Vec<Option<V>>,
    /// Per-element occupancy bit ([`OccupancyMode::PerItem`]): set while
    /// a writer is updating the slot.
    occ: Vec<bool>,
    /// Per-bucket occupancy bit ([`OccupancyMode::PerBucket`]).
    busy: bool,
    /// Rotating victim offset for this bucket, used to pick which
    /// element to evict: a per-bucket round-robin counter, so repeated
    /// evictions from the same bucket do not always pick the same slot.
    next_victim: usize,
}

impl<V: Copy> Bucket<V> {
    fn new(size: usize) -> Self {
        Self {
            hash1: vec![0; size],
            keys: vec![0; size],
            values: vec![None; size],
            occ: vec![false; size],
            busy: false,
            next_victim: 0,
        }
    }

    fn find_vacant(&self) -> Option<usize> {
        self.hash1.iter().position(|&h| h == 0)
    }
}

#[derive(Clone, Copy)]
struct SwapStep<V> {
    bucket: usize,
    slot: usize,
    prev_hash1: u64,
    prev_key: u64,
    prev_value: V,
}

/// A power-of-two bucket array with two independent 64-bit hash
/// functions and bounded cuckoo eviction.
pub struct CuckooTable<V> {
    bucket_count: usize,
    bucket_size: usize,
    mode: OccupancyMode,
    buckets: Vec<Bucket<V>>,
    seed1: u64,
    seed2: u64,
    len: usize,
}

impl<V: Copy> CuckooTable<V> {
    pub fn new(bucket_count: usize, bucket_size: usize, mode: OccupancyMode) -> Self {
        assert!(bucket_count.is_power_of_two(), "bucket_count must be a power of two");
        Self {
            bucket_count,
            bucket_size,
            mode,
            buckets: (0..bucket_count).map(|_| Bucket::new(bucket_size)).collect(),
            seed1: 0x9E3779B97F4A7C15,
            seed2: 0xC2B2AE3D27D4EB4F,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.bucket_count * self.bucket_size
    }

    fn mix(key: u64, seed: u64) -> u64 {
        let mut x = key ^ seed;
        x = x.wrapping_add(0x9E3779B97F4A7C15);
        x = (x ^ (x >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94D049BB133111EB);
        x ^ (x >> 31)
    }

    /// Returns `(h1, h2)` with `h2` perturbed to `!h1` when they'd
    /// otherwise collide.
    fn hashes(&self, key: u64) -> (u64, u64) {
        let h1 = Self::mix(key, self.seed1);
        let mut h2 = Self::mix(key, self.seed2);
        if h1 == h2 {
            h2 = !h1;
        }
        // Never let a mixed hash collide with the vacancy sentinel.
        let fix = |h: u64| if h == 0 { 1 } else { h };
        (fix(h1), fix(h2))
    }

    fn bucket_index(&self, h: u64) -> usize {
        (h as usize) & (self.bucket_count - 1)
    }

    /// Bounded eviction depth: `min(capacity, 4 * log2(bucket_count))`.
    fn max_eviction_depth(&self) -> usize {
        let log2_buckets = (usize::BITS - self.bucket_count.leading_zeros() - 1) as usize;
        self.capacity().min(4 * log2_buckets.max(1))
    }

    fn locate(&self, bucket: usize, key: u64, h1: u64) -> Option<usize> {
        let b = &self.buckets[bucket];
        (0..self.bucket_size).find(|&i| b.hash1[i] == h1 && b.keys[i] == key)
    }

    /// Insert or, if `key` is already present, update it in place.
    pub fn insert(&mut self, key: u64, value: V) -> Result<(), CacheError> {
        let (h1, h2) = self.hashes(key);
        let primary = self.bucket_index(h1);

        if let Some(slot) = self.locate(primary, key, h1) {
            self.buckets[primary].values[slot] = Some(value);
            return Ok(());
        }
        if let Some(slot) = self.buckets[primary].find_vacant() {
            self.place(primary, slot, key, h1, value);
            self.len += 1;
            return Ok(());
        }

        // Cuckoo eviction: relocate existing elements to make room.
        let max_depth = self.max_eviction_depth();
        let mut path: Vec<SwapStep<V>> = Vec::new();
        let mut cur_bucket = primary;
        let mut cur_key = key;
        let mut cur_h1 = h1;
        let mut cur_value = value;

        for _ in 0..max_depth {
            if let Some(slot) = self.buckets[cur_bucket].find_vacant() {
                self.place(cur_bucket, slot, cur_key, cur_h1, cur_value);
                self.len += 1;
                return Ok(());
            }

            let victim_slot = self.buckets[cur_bucket].next_victim % self.bucket_size;
            self.buckets[cur_bucket].next_victim = (victim_slot + 1) % self.bucket_size;

            let victim_h1 = self.buckets[cur_bucket].hash1[victim_slot];
            let victim_key = self.buckets[cur_bucket].keys[victim_slot];
            let victim_value = self.buckets[cur_bucket].values[victim_slot].expect("occupied slot has a value");

            path.push(SwapStep {
                bucket: cur_bucket,
                slot: victim_slot,
                prev_hash1: victim_h1,
                prev_key: victim_key,
                prev_value: victim_value,
            });
            self.place(cur_bucket, victim_slot, cur_key, cur_h1, cur_value);

            // Relocate the victim to whichever of its two buckets isn't
            // the one we just evicted it from.
            let (victim_h1_recomputed, victim_h2) = self.hashes(victim_key);
            debug_assert_eq!(victim_h1_recomputed, victim_h1);
            let victim_primary = self.bucket_index(victim_h1);
            let victim_secondary = self.bucket_index(victim_h2);
            cur_bucket = if victim_primary == cur_bucket { victim_secondary } else { victim_primary };
            cur_key = victim_key;
            cur_h1 = victim_h1;
            cur_value = victim_value;
        }

        // Eviction budget exhausted: unwind along the same path in
        // reverse, restoring every displaced element: a failed insert
        // must leave the table exactly as it was before the attempt.
        for step in path.into_iter().rev() {
            self.place(step.bucket, step.slot, step.prev_key, step.prev_hash1, step.prev_value);
        }
        Err(CacheError::Full)
    }

    fn place(&mut self, bucket: usize, slot: usize, key: u64, h1: u64, value: V) {
        if self.mode == OccupancyMode::PerItem {
            self.buckets[bucket].occ[slot] = true;
        } else {
            self.buckets[bucket].busy = true;
        }
        self.buckets[bucket].hash1[slot] = h1;
        self.buckets[bucket].keys[slot] = key;
        self.buckets[bucket].values[slot] = Some(value);
        if self.mode == OccupancyMode::PerItem {
            self.buckets[bucket].occ[slot] = false;
        } else {
            self.buckets[bucket].busy = false;
        }
    }

    /// Probe `H1 mod N`, then `H2 mod N`.
    pub fn lookup(&self, key: u64) -> Option<V> {
        let (h1, h2) = self.hashes(key);
        for h in [h1, h2] {
            let bucket_idx = self.bucket_index(h);
            let bucket = &self.buckets[bucket_idx];
            if self.mode == OccupancyMode::PerBucket && bucket.busy {
                continue;
            }
            for slot in 0..self.bucket_size {
                if self.mode == OccupancyMode::PerItem && bucket.occ[slot] {
                    continue;
                }
                if bucket.hash1[slot] == h && bucket.keys[slot] == key {
                    return bucket.values[slot];
                }
            }
        }
        None
    }

    /// Clear both the element and its hash slot.
    pub fn delete(&mut self, key: u64) -> bool {
        let (h1, h2) = self.hashes(key);
        for h in [h1, h2] {
            let bucket_idx = self.bucket_index(h);
            let bucket = &mut self.buckets[bucket_idx];
            if let Some(slot) = (0..self.bucket_size).find(|&i| bucket.hash1[i] == h && bucket.keys[i] == key) {
                bucket.hash1[slot] = 0;
                bucket.keys[slot] = 0;
                bucket.values[slot] = None;
                self.len -= 1;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CuckooTable<u64> {
        CuckooTable::new(8, 2, OccupancyMode::PerItem)
    }

    #[test]
    fn insert_then_lookup() {
        let mut t = table();
        t.insert(42, 100).unwrap();
        assert_eq!(t.lookup(42), Some(100));
    }

    #[test]
    fn insert_updates_in_place() {
        let mut t = table();
        t.insert(1, 10).unwrap();
        t.insert(1, 20).unwrap();
        assert_eq!(t.lookup(1), Some(20));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn delete_then_lookup_is_absent() {
        let mut t = table();
        t.insert(7, 70).unwrap();
        assert!(t.delete(7));
        assert_eq!(t.lookup(7), None);
        assert!(!t.delete(7));
    }

    #[test]
    fn eviction_relocates_without_losing_either_key() {
        // Small table forces collisions quickly.
        let mut t = CuckooTable::new(4, 1, OccupancyMode::PerItem);
        let mut inserted = vec![];
        for k in 0..3u64 {
            if t.insert(k, k * 10).is_ok() {
                inserted.push(k);
            }
        }
        for k in inserted {
            assert_eq!(t.lookup(k), Some(k * 10));
        }
    }

    #[test]
    fn full_table_insert_fails_and_restores_state() {
        let mut t = CuckooTable::new(2, 1, OccupancyMode::PerItem);
        let mut ok_keys = vec![];
        let mut failed = false;
        for k in 0..64u64 {
            match t.insert(k, k) {
                Ok(()) => ok_keys.push(k),
                Err(CacheError::Full) => {
                    failed = true;
                    break;
                }
            }
        }
        assert!(failed, "a 2-slot table must eventually reject an insert");
        for k in &ok_keys {
            assert_eq!(t.lookup(*k), Some(*k));
        }
    }
}
