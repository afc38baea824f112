//! Extranonce1 allocation.
//!
//! Every connection gets its own extranonce1, which partitions the nonce
//! space so concurrently mining clients never search the same range. The
//! top [`INSTANCE_ID_BITS`] bits carry an instance id, so pool instances
//! sharing one upstream also hand out disjoint ranges. The remaining bits
//! are a counter that wraps.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Bits of extranonce1 reserved for the instance id.
pub const INSTANCE_ID_BITS: u32 = 5;

/// Thread-safe extranonce1 allocator.
#[derive(Debug)]
pub struct ExtraNonceAllocator {
    size: usize,
    instance_id: u8,
    shift: u32,
    counter_mask: u64,
    counter: AtomicU64,
}

impl ExtraNonceAllocator {
    /// Create an allocator producing `size`-byte values (clamped to 1..=8).
    ///
    /// Without an explicit instance id, a random one is picked.
    pub fn new(size: usize, instance_id: Option<u8>) -> Self {
        let size = size.clamp(1, 8);
        let shift = size as u32 * 8 - INSTANCE_ID_BITS;
        let id_mask = (1u8 << INSTANCE_ID_BITS) - 1;
        let instance_id = instance_id.unwrap_or_else(random_instance_id) & id_mask;

        Self {
            size,
            instance_id,
            shift,
            counter_mask: (1u64 << shift) - 1,
            counter: AtomicU64::new(0),
        }
    }

    /// Size in bytes of each extranonce1.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn instance_id(&self) -> u8 {
        self.instance_id
    }

    /// Hand out the next extranonce1, hex encoded.
    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) & self.counter_mask;
        let value = (u64::from(self.instance_id) << self.shift) | n;
        hex::encode(&value.to_be_bytes()[8 - self.size..])
    }
}

fn random_instance_id() -> u8 {
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u32(std::process::id());
    (hasher.finish() & ((1 << INSTANCE_ID_BITS) - 1)) as u8
}
