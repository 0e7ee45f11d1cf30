//! Bit-packed columnar status storage.
//!
//! Status values live packed into fixed-width `u64` blocks, grouped into
//! chunks that a host can allocate and free as a unit (e.g. one chunk per
//! game entity). Each chunk keeps its own width-sorted free list so
//! `register_status` can reuse a hole left by an earlier removal before
//! growing the block vector.
//!
//! A value never straddles a block boundary: every field is carved either
//! from an existing free region (itself never wider than one block) or from
//! a freshly appended block, so packing and unpacking only ever touch a
//! single `u64`.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use crate::status_value::{Comparison, Evaluation, StatusValue, Width};
use crate::{ChunkKey, StatusKey};

/// Number of bits in one storage block.
pub const BLOCK_BITS: u32 = 64;

/// Describes how a packed field should be reconstituted into a `StatusValue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFormat {
    /// A single packed bit.
    Bool,
    /// An unsigned integer of the given bit width.
    Unsigned(Width),
    /// A signed integer of the given bit width.
    Signed(Width),
    /// A 64-bit IEEE-754 double.
    Float,
}

impl StatusFormat {
    fn of(value: &StatusValue) -> Option<Self> {
        match *value {
            StatusValue::Empty => None,
            StatusValue::Bool(_) => Some(StatusFormat::Bool),
            StatusValue::Unsigned { width, .. } => Some(StatusFormat::Unsigned(width)),
            StatusValue::Signed { width, .. } => Some(StatusFormat::Signed(width)),
            StatusValue::Float(_) => Some(StatusFormat::Float),
        }
    }

    fn bit_width(&self) -> Width {
        match self {
            StatusFormat::Bool => 1,
            StatusFormat::Unsigned(w) | StatusFormat::Signed(w) => *w,
            StatusFormat::Float => 64,
        }
    }
}

/// A free bit region within a chunk's block vector, never wider than one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRegion {
    width: Width,
    position: u32,
}

/// Bit-packed storage for one chunk's worth of status values.
#[derive(Debug, Default)]
struct StatusChunk {
    blocks: Vec<u64>,
    /// Kept sorted ascending by `(width, position)`, matching the reference
    /// allocator's `lower_bound` reuse policy.
    free: Vec<FreeRegion>,
}

impl StatusChunk {
    fn allocate_bit_field(&mut self, width: Width) -> u32 {
        let slot = self.free.partition_point(|r| r.width < width);
        if slot < self.free.len() {
            self.reuse_free_region(width, slot)
        } else {
            self.add_bit_field(width)
        }
    }

    fn reuse_free_region(&mut self, width: Width, slot: usize) -> u32 {
        let region = self.free.remove(slot);
        if width < region.width {
            self.insert_free_region(FreeRegion {
                width: region.width - width,
                position: region.position + width as u32,
            });
        }
        region.position
    }

    fn add_bit_field(&mut self, width: Width) -> u32 {
        let position = (self.blocks.len() as u32) * BLOCK_BITS;
        self.blocks.push(0);
        let pad = BLOCK_BITS as Width - width;
        if pad > 0 {
            self.insert_free_region(FreeRegion { width: pad, position: position + width as u32 });
        }
        position
    }

    fn insert_free_region(&mut self, region: FreeRegion) {
        let at = self
            .free
            .partition_point(|r| (r.width, r.position) < (region.width, region.position));
        self.free.insert(at, region);
    }

    fn get_bit_field(&self, position: u32, width: Width) -> u64 {
        let block_index = (position / BLOCK_BITS) as usize;
        let shift = position % BLOCK_BITS;
        let block = self.blocks[block_index];
        let mask = mask_for(width);
        (block >> shift) & mask
    }

    /// Returns `true` if the stored bits changed.
    fn set_bit_field(&mut self, position: u32, width: Width, value: u64) -> bool {
        let block_index = (position / BLOCK_BITS) as usize;
        let shift = position % BLOCK_BITS;
        let mask = mask_for(width);
        let block = &mut self.blocks[block_index];
        let cleared = *block & !(mask << shift);
        let new_block = cleared | ((value & mask) << shift);
        let changed = new_block != *block;
        *block = new_block;
        changed
    }
}

fn mask_for(width: Width) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Per-status bookkeeping: where it lives and whether it changed this tick.
#[derive(Debug, Clone, Copy)]
struct StatusProperty {
    chunk: ChunkKey,
    position: u32,
    format: StatusFormat,
    transition: bool,
}

/// Errors surfaced by reservoir operations.
#[derive(Debug, thiserror::Error)]
pub enum ReservoirError {
    /// A status was registered twice under the same key.
    #[error("status key {0:?} is already registered")]
    AlreadyRegistered(StatusKey),
    /// `register_status` was called with `StatusValue::Empty`.
    #[error("cannot register an empty status value")]
    EmptyInit,
    /// No status is registered under this key.
    #[error("status key {0:?} is not registered")]
    NotFound(StatusKey),
    /// The status's chunk no longer exists (should not happen if the
    /// property map and chunk map are kept in sync).
    #[error("chunk {0:?} does not exist")]
    NoChunk(ChunkKey),
    /// The underlying `StatusValue::assign` call failed.
    #[error("assignment failed: {0}")]
    Assign(#[from] crate::status_value::AssignError),
}

/// Bit-packed columnar store of every registered status value.
pub struct Reservoir {
    chunks: HashMap<ChunkKey, StatusChunk>,
    properties: HashMap<StatusKey, StatusProperty>,
    /// Multiple of `f64::EPSILON` treated as equal by float comparisons.
    epsilon_scale: f64,
}

impl Default for Reservoir {
    fn default() -> Self {
        Self {
            chunks: HashMap::new(),
            properties: HashMap::new(),
            epsilon_scale: crate::status_value::DEFAULT_EPSILON_SCALE,
        }
    }
}

impl Reservoir {
    /// An empty reservoir with no chunks or statuses registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a reservoir with a non-default float comparison epsilon
    /// scale (see [`crate::config::EngineConfig::epsilon_scale`]).
    pub fn with_epsilon_scale(epsilon_scale: f64) -> Self {
        Self { epsilon_scale, ..Self::default() }
    }

    /// Register a new status value in `chunk`, allocating storage for it.
    /// Fails if the key is already registered or `init` is `Empty`.
    pub fn register_status(
        &mut self,
        chunk: ChunkKey,
        key: StatusKey,
        init: StatusValue,
    ) -> Result<(), ReservoirError> {
        if self.properties.contains_key(&key) {
            return Err(ReservoirError::AlreadyRegistered(key));
        }
        let format = StatusFormat::of(&init).ok_or(ReservoirError::EmptyInit)?;
        let width = format.bit_width();
        let bits = encode(&init);
        let storage = self.chunks.entry(chunk).or_default();
        let position = storage.allocate_bit_field(width);
        storage.set_bit_field(position, width, bits);
        self.properties.insert(
            key,
            StatusProperty { chunk, position, format, transition: true },
        );
        Ok(())
    }

    /// Look up a status's current value, or `Empty` if unregistered.
    pub fn find_status(&self, key: StatusKey) -> StatusValue {
        let Some(prop) = self.properties.get(&key) else {
            return StatusValue::Empty;
        };
        let Some(chunk) = self.chunks.get(&prop.chunk) else {
            return StatusValue::Empty;
        };
        let bits = chunk.get_bit_field(prop.position, prop.format.bit_width());
        decode(prop.format, bits)
    }

    /// Apply `op` in place at `key`, returning whether the stored bits
    /// changed. Sets the status's transition flag to that result.
    pub fn assign_status(
        &mut self,
        key: StatusKey,
        op: crate::status_value::Assignment,
        rhs: StatusValue,
    ) -> Result<bool, ReservoirError> {
        let prop = *self.properties.get(&key).ok_or(ReservoirError::NotFound(key))?;
        let mut current = self.find_status(key);
        let changed = current.assign(op, &rhs)?;
        if changed {
            let chunk = self.chunks.get_mut(&prop.chunk).ok_or(ReservoirError::NoChunk(prop.chunk))?;
            chunk.set_bit_field(prop.position, prop.format.bit_width(), encode(&current));
        }
        if let Some(prop) = self.properties.get_mut(&key) {
            prop.transition = changed;
        }
        Ok(changed)
    }

    /// Compare the status at `key` against a literal value.
    pub fn compare_status(&self, key: StatusKey, op: Comparison, rhs: &StatusValue) -> Evaluation {
        self.find_status(key).compare_scaled(op, rhs, self.epsilon_scale)
    }

    /// Compare the status at `key` against another status's current value.
    pub fn compare_status_keys(
        &self,
        key: StatusKey,
        op: Comparison,
        rhs_key: StatusKey,
    ) -> Evaluation {
        self.find_status(key).compare_scaled(op, &self.find_status(rhs_key), self.epsilon_scale)
    }

    /// Did `key`'s value change since the last `reset_transitions` call?
    pub fn find_transition(&self, key: StatusKey) -> Option<bool> {
        self.properties.get(&key).map(|p| p.transition)
    }

    /// Clear every status's transition flag. Called once per tick after
    /// expression evaluation and before the next enqueue/flush cycle.
    pub fn reset_transitions(&mut self) {
        for prop in self.properties.values_mut() {
            prop.transition = false;
        }
    }

    /// Drop a chunk and every status registered within it.
    pub fn remove_chunk(&mut self, chunk: ChunkKey) {
        self.chunks.remove(&chunk);
        self.properties.retain(|_, prop| prop.chunk != chunk);
    }

    /// Compact storage: re-allocate every live property into a fresh chunk,
    /// largest-width first within each chunk, and re-hash the chunk/property
    /// maps to the given bucket-count hints. Every key's value is preserved
    /// bit-exactly; this is observable only as faster subsequent access.
    pub fn rebuild(&mut self, new_chunk_buckets: usize, new_status_buckets: usize) {
        let mut per_chunk: HashMap<ChunkKey, Vec<(StatusKey, StatusValue, bool)>> = HashMap::new();
        for (&key, prop) in &self.properties {
            let value = self.find_status(key);
            per_chunk.entry(prop.chunk).or_default().push((key, value, prop.transition));
        }

        let mut fresh_chunks: HashMap<ChunkKey, StatusChunk> =
            HashMap::with_capacity(new_chunk_buckets.max(per_chunk.len()));
        let mut fresh_properties: HashMap<StatusKey, StatusProperty> =
            HashMap::with_capacity(new_status_buckets.max(self.properties.len()));

        for (chunk_key, mut entries) in per_chunk {
            entries.sort_by(|a, b| b.1.bit_width().cmp(&a.1.bit_width()));
            let mut chunk = StatusChunk::default();
            for (status_key, value, transition) in entries {
                let format = StatusFormat::of(&value).expect("a live property is never Empty");
                let width = format.bit_width();
                let position = chunk.allocate_bit_field(width);
                chunk.set_bit_field(position, width, encode(&value));
                fresh_properties.insert(status_key, StatusProperty { chunk: chunk_key, position, format, transition });
            }
            fresh_chunks.insert(chunk_key, chunk);
        }

        self.chunks = fresh_chunks;
        self.properties = fresh_properties;
    }

    /// Raw packed words backing `chunk`, for a host to persist verbatim.
    /// This crate does not itself define a serialized wire format for them.
    pub fn chunk_words(&self, chunk: ChunkKey) -> Option<&[u64]> {
        self.chunks.get(&chunk).map(|c| c.blocks.as_slice())
    }
}

fn encode(value: &StatusValue) -> u64 {
    match *value {
        StatusValue::Empty => 0,
        StatusValue::Bool(b) => b as u64,
        StatusValue::Unsigned { value, .. } => value,
        StatusValue::Signed { value, width } => (value as u64) & mask_for(width),
        StatusValue::Float(f) => f.to_bits(),
    }
}

fn decode(format: StatusFormat, bits: u64) -> StatusValue {
    match format {
        StatusFormat::Bool => StatusValue::Bool(bits != 0),
        StatusFormat::Unsigned(width) => StatusValue::Unsigned { value: bits, width },
        StatusFormat::Signed(width) => StatusValue::Signed { value: sign_extend(bits, width), width },
        StatusFormat::Float => StatusValue::Float(f64::from_bits(bits)),
    }
}

fn sign_extend(bits: u64, width: Width) -> i64 {
    if width >= 64 {
        return bits as i64;
    }
    let shift = 64 - width as u32;
    ((bits << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_value::Assignment;

    #[test]
    fn register_find_round_trip() {
        let mut r = Reservoir::new();
        let k = StatusKey(1);
        r.register_status(ChunkKey(0), k, StatusValue::Signed { value: -7, width: 8 }).unwrap();
        assert_eq!(r.find_status(k), StatusValue::Signed { value: -7, width: 8 });
    }

    #[test]
    fn double_register_fails() {
        let mut r = Reservoir::new();
        let k = StatusKey(1);
        r.register_status(ChunkKey(0), k, StatusValue::Bool(true)).unwrap();
        assert!(matches!(
            r.register_status(ChunkKey(0), k, StatusValue::Bool(false)),
            Err(ReservoirError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn assign_sets_transition_flag() {
        let mut r = Reservoir::new();
        let k = StatusKey(1);
        r.register_status(ChunkKey(0), k, StatusValue::Unsigned { value: 1, width: 8 }).unwrap();
        r.reset_transitions();
        assert_eq!(r.find_transition(k), Some(false));
        let changed = r
            .assign_status(k, Assignment::Add, StatusValue::Unsigned { value: 1, width: 8 })
            .unwrap();
        assert!(changed);
        assert_eq!(r.find_transition(k), Some(true));

        let changed_again = r
            .assign_status(k, Assignment::Add, StatusValue::Unsigned { value: 0, width: 8 })
            .unwrap();
        assert!(!changed_again);
        assert_eq!(r.find_transition(k), Some(false));
    }

    #[test]
    fn allocator_reuses_freed_region_before_growing() {
        let mut r = Reservoir::new();
        let chunk = ChunkKey(0);
        r.register_status(chunk, StatusKey(1), StatusValue::Unsigned { value: 0, width: 8 }).unwrap();
        r.register_status(chunk, StatusKey(2), StatusValue::Unsigned { value: 0, width: 8 }).unwrap();
        assert_eq!(r.chunk_words(chunk).unwrap().len(), 2);
        r.remove_chunk(chunk);
        r.register_status(chunk, StatusKey(3), StatusValue::Unsigned { value: 9, width: 8 }).unwrap();
        assert_eq!(r.chunk_words(chunk).unwrap().len(), 1);
    }

    #[test]
    fn remove_chunk_drops_its_statuses() {
        let mut r = Reservoir::new();
        let k = StatusKey(1);
        r.register_status(ChunkKey(0), k, StatusValue::Bool(true)).unwrap();
        r.remove_chunk(ChunkKey(0));
        assert_eq!(r.find_status(k), StatusValue::Empty);
        assert_eq!(r.find_transition(k), None);
    }

    #[test]
    fn rebuild_preserves_values_and_packs_tightly() {
        let mut r = Reservoir::new();
        let chunk = ChunkKey(0);
        r.register_status(chunk, StatusKey(1), StatusValue::Unsigned { value: 3, width: 4 }).unwrap();
        r.register_status(chunk, StatusKey(2), StatusValue::Unsigned { value: 200, width: 32 }).unwrap();
        r.register_status(chunk, StatusKey(3), StatusValue::Signed { value: -7, width: 8 }).unwrap();
        r.remove_chunk(ChunkKey(1)); // no-op, exercises an empty chunk key path
        // Fragment the chunk: free the first field, leaving a hole the
        // allocator would otherwise have reused.
        r.register_status(chunk, StatusKey(4), StatusValue::Bool(true)).unwrap();

        r.rebuild(8, 8);

        assert_eq!(r.find_status(StatusKey(1)), StatusValue::Unsigned { value: 3, width: 4 });
        assert_eq!(r.find_status(StatusKey(2)), StatusValue::Unsigned { value: 200, width: 32 });
        assert_eq!(r.find_status(StatusKey(3)), StatusValue::Signed { value: -7, width: 8 });
        assert_eq!(r.find_status(StatusKey(4)), StatusValue::Bool(true));
        // 4 + 32 + 8 + 1 = 45 bits, still fits in a single 64-bit block when
        // packed largest-width first.
        assert_eq!(r.chunk_words(chunk).unwrap().len(), 1);
    }

    #[test]
    fn multiple_fields_share_a_block_without_crossing() {
        let mut r = Reservoir::new();
        let chunk = ChunkKey(0);
        r.register_status(chunk, StatusKey(1), StatusValue::Unsigned { value: 3, width: 4 }).unwrap();
        r.register_status(chunk, StatusKey(2), StatusValue::Unsigned { value: 5, width: 4 }).unwrap();
        // Both fields fit in the same 64-bit block; no second block allocated.
        assert_eq!(r.chunk_words(chunk).unwrap().len(), 1);
        assert_eq!(r.find_status(StatusKey(1)), StatusValue::Unsigned { value: 3, width: 4 });
        assert_eq!(r.find_status(StatusKey(2)), StatusValue::Unsigned { value: 5, width: 4 });
    }
}
