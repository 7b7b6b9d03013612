//! Lock-free open-addressed counting array with invertible hashing.
//!
//! A key is hashed through a random invertible GF(2) matrix; the low `lsize`
//! bits of the hash pick the cell, and only the remaining high hash bits are
//! stored. Together with the cell position and the reprobe marker they
//! reconstruct the key through the inverse matrix, which is what keeps cells
//! narrow at small k.
//!
//! Collisions reprobe quadratically (`Δ[j] = j(j+1)/2`); the marker records
//! which step filled a cell so probes of unrelated keys sharing an address
//! stay distinguishable. Counts that outgrow the value field continue into
//! later reprobe slots of the same walk (value stealing), each continuation
//! cell tagged with a distinguished marker.

use rand::Rng;
use std::hint;

use crate::cells::{self, CellStore, Claim};
use crate::error::MerError;
use crate::matrix::SquareBinaryMatrix;

/// What an inspection of a single cell observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    /// Never written.
    Empty,
    /// A complete entry.
    Filled,
    /// A claim caught between its spill store and its control-word
    /// publish; retry shortly.
    LbSet,
}

/// Decoded view of one cell, internal to the probe logic.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Empty,
    Pending,
    /// Primary entry installed at reprobe step `step`.
    Primary { step: u32, rem: u64, value: u64 },
    /// Value-overflow continuation chunk.
    Continuation { rem: u64, value: u64 },
}

/// Lock-free, bit-packed, open-addressed counting table.
///
/// All read/write operations are safe under unrestricted concurrent
/// callers; `clear` requires exclusive access. One allocation at
/// construction, none afterwards.
pub struct CountArray {
    store: CellStore,
    matrix: SquareBinaryMatrix,
    inverse: SquareBinaryMatrix,
    lsize: u32,
    size_mask: u64,
    key_bits: u32,
    val_bits: u32,
    marker_bits: u32,
    rem_bits: u32,
    reprobe_limit: u32,
    /// `Δ[j] = j(j+1)/2` for `j ∈ [0, reprobe_limit]`.
    offsets: Vec<u64>,
    /// Marker of continuation cells: one past every legal primary marker.
    ovfl_marker: u64,
    /// Saturation pattern of the live value field.
    val_max: u64,
}

impl CountArray {
    /// Create an array of `size` cells (power of two) for `key_bits`-bit
    /// keys with a `val_bits`-bit live counter, generating a fresh random
    /// invertible matrix pair.
    pub fn new(
        size: u64,
        key_bits: u32,
        val_bits: u32,
        reprobe_limit: u32,
    ) -> Result<Self, MerError> {
        Self::with_rng(size, key_bits, val_bits, reprobe_limit, &mut rand::rng())
    }

    /// As [`CountArray::new`] with a caller-supplied RNG (reproducible
    /// tables, deterministic tests).
    pub fn with_rng<R: Rng>(
        size: u64,
        key_bits: u32,
        val_bits: u32,
        reprobe_limit: u32,
        rng: &mut R,
    ) -> Result<Self, MerError> {
        let (matrix, inverse) = SquareBinaryMatrix::random_invertible(key_bits, rng)?;
        Ok(Self::with_matrix(size, val_bits, reprobe_limit, matrix, inverse))
    }

    /// Build around an existing matrix pair (reloading a dumped table, or
    /// crafting keys onto chosen positions in tests).
    pub fn with_matrix(
        size: u64,
        val_bits: u32,
        reprobe_limit: u32,
        matrix: SquareBinaryMatrix,
        inverse: SquareBinaryMatrix,
    ) -> Self {
        assert!(size.is_power_of_two() && size >= 2, "size must be a power of two >= 2");
        assert!(
            (1..=cells::MAX_VAL_BITS).contains(&val_bits),
            "val_bits must be 1..={}",
            cells::MAX_VAL_BITS
        );
        assert!(
            (reprobe_limit as u64) < size && reprobe_limit >= 1,
            "reprobe_limit must be 1..size"
        );
        let key_bits = matrix.dim();
        debug_assert_eq!(inverse.dim(), key_bits);
        debug_assert_eq!(inverse.times(matrix.times(0x5a5a_5a5a)) & matrix.mask(),
                         0x5a5a_5a5a & matrix.mask());

        let ovfl_marker = reprobe_limit as u64 + 2;
        let marker_bits = 64 - ovfl_marker.leading_zeros();
        assert!(
            marker_bits <= cells::MAX_MARKER_BITS,
            "reprobe_limit too large for the marker field"
        );

        let lsize = size.trailing_zeros();
        let rem_bits = key_bits.saturating_sub(lsize);
        let raw_bits = rem_bits + val_bits + marker_bits;
        let store = CellStore::new(size, raw_bits, marker_bits + val_bits);

        let offsets = (0..=reprobe_limit as u64).map(|j| j * (j + 1) / 2).collect();

        CountArray {
            store,
            matrix,
            inverse,
            lsize,
            size_mask: size - 1,
            key_bits,
            val_bits,
            marker_bits,
            rem_bits,
            reprobe_limit,
            offsets,
            ovfl_marker,
            val_max: if val_bits == 64 { u64::MAX } else { (1u64 << val_bits) - 1 },
        }
    }

    /// Number of cells.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size_mask + 1
    }

    #[inline]
    pub fn key_bits(&self) -> u32 {
        self.key_bits
    }

    #[inline]
    pub fn val_bits(&self) -> u32 {
        self.val_bits
    }

    #[inline]
    pub fn reprobe_limit(&self) -> u32 {
        self.reprobe_limit
    }

    /// The `j`-th quadratic reprobe offset.
    #[inline]
    pub fn reprobe_offset(&self, j: u32) -> u64 {
        self.offsets[j as usize]
    }

    /// Largest offset of the probe walk, `Δ[reprobe_limit]`.
    #[inline]
    pub fn max_reprobe_offset(&self) -> u64 {
        *self.offsets.last().unwrap()
    }

    /// The hash matrix.
    #[inline]
    pub fn matrix(&self) -> &SquareBinaryMatrix {
        &self.matrix
    }

    /// The inverse hash matrix.
    #[inline]
    pub fn inverse_matrix(&self) -> &SquareBinaryMatrix {
        &self.inverse
    }

    /// Home position of a key: `H(key) mod S`.
    #[inline]
    pub fn position_of(&self, key: u64) -> u64 {
        self.matrix.times(key) & self.size_mask
    }

    // ---- cell codec ----

    #[inline]
    fn split_hash(&self, key: u64) -> (u64, u64) {
        let h = self.matrix.times(key);
        (h & self.size_mask, h >> self.lsize)
    }

    #[inline]
    fn probe_pos(&self, p0: u64, step: u32) -> u64 {
        (p0 + self.offsets[step as usize]) & self.size_mask
    }

    #[inline]
    fn encode(&self, marker: u64, value: u64, rem: u64) -> u128 {
        debug_assert!(value <= self.val_max);
        (marker as u128)
            | (value as u128) << self.marker_bits
            | (rem as u128) << (self.marker_bits + self.val_bits)
            | self.store.claim_bit()
    }

    #[inline]
    fn decode(&self, cell: u128) -> Slot {
        if cell == 0 {
            return Slot::Empty;
        }
        let marker = (cell as u64) & field_mask(self.marker_bits);
        if marker == 0 {
            return Slot::Pending;
        }
        let value = ((cell >> self.marker_bits) as u64) & field_mask(self.val_bits);
        let rem =
            ((cell >> (self.marker_bits + self.val_bits)) as u64) & field_mask(self.rem_bits);
        if marker == self.ovfl_marker {
            Slot::Continuation { rem, value }
        } else {
            Slot::Primary {
                step: (marker - 1) as u32,
                rem,
                value,
            }
        }
    }

    /// Rebuild the key of a primary cell from its position, reprobe step,
    /// and stored hash remainder.
    #[inline]
    fn reconstruct(&self, id: u64, step: u32, rem: u64) -> u64 {
        let p0 = id.wrapping_sub(self.offsets[step as usize]) & self.size_mask;
        let h = ((rem << self.lsize) | p0) & self.matrix.mask();
        self.inverse.times(h)
    }

    /// Replace the value field of a cell image.
    #[inline]
    fn with_value(&self, cell: u128, value: u64) -> u128 {
        debug_assert!(value <= self.val_max);
        let vmask = (field_mask(self.val_bits) as u128) << self.marker_bits;
        (cell & !vmask) | (value as u128) << self.marker_bits
    }

    // ---- public operations ----

    /// Increment the counter of `key` by `delta`.
    ///
    /// Returns false only when the reprobe walk is exhausted before the
    /// whole increment found a home: the table needs a flush. Lock-free;
    /// never blocks, never allocates.
    pub fn add(&self, key: u64, delta: u64) -> bool {
        let (p0, rem) = self.split_hash(key);
        for step in 0..=self.reprobe_limit {
            let id = self.probe_pos(p0, step);
            loop {
                let cell = self.store.load(id);
                match self.decode(cell) {
                    Slot::Empty => {
                        let fitted = delta.min(self.val_max);
                        let entry = self.encode(step as u64 + 1, fitted, rem);
                        if self.store.try_claim(id, entry) == Claim::Claimed {
                            return delta == fitted
                                || self.add_overflow(p0, rem, step, delta - fitted);
                        }
                        // Lost the claim; find out what got installed.
                    }
                    Slot::Pending => hint::spin_loop(),
                    Slot::Primary { step: s, rem: r, .. } if s == step && r == rem => {
                        return self.add_to_cell(id, cell, delta, p0, rem, step);
                    }
                    _ => break, // foreign entry, keep probing
                }
            }
        }
        false
    }

    /// CAS-add `delta` into the value field of the matched cell at `id`,
    /// spilling anything past saturation into the continuation walk.
    fn add_to_cell(&self, id: u64, mut cell: u128, delta: u64, p0: u64, rem: u64, step: u32) -> bool {
        loop {
            let cur = ((cell >> self.marker_bits) as u64) & field_mask(self.val_bits);
            let sum = cur.saturating_add(delta);
            let fitted = sum.min(self.val_max);
            let next = self.with_value(cell, fitted);
            let old_lo = self.store.lo_slice(id, cell);
            let new_lo = self.store.lo_slice(id, next);
            if self.store.cas_lo(id, old_lo, new_lo) {
                return sum == fitted || self.add_overflow(p0, rem, step, sum - fitted);
            }
            // Value grew under us; marker and remainder are immutable.
            cell = self.store.load(id);
        }
    }

    /// Place `carry` into continuation cells along the reprobe walk after
    /// the primary's step. Stops at the first foreign cell.
    fn add_overflow(&self, p0: u64, rem: u64, primary_step: u32, mut carry: u64) -> bool {
        debug_assert!(carry > 0);
        for step in primary_step + 1..=self.reprobe_limit {
            let id = self.probe_pos(p0, step);
            loop {
                let cell = self.store.load(id);
                match self.decode(cell) {
                    Slot::Empty => {
                        let chunk = carry.min(self.val_max);
                        let entry = self.encode(self.ovfl_marker, chunk, rem);
                        if self.store.try_claim(id, entry) == Claim::Claimed {
                            carry -= chunk;
                            if carry == 0 {
                                return true;
                            }
                            break; // next continuation cell
                        }
                    }
                    Slot::Pending => hint::spin_loop(),
                    Slot::Continuation { rem: r, .. } if r == rem => {
                        let cur = ((cell >> self.marker_bits) as u64) & field_mask(self.val_bits);
                        let sum = cur.saturating_add(carry);
                        let fitted = sum.min(self.val_max);
                        let next = self.with_value(cell, fitted);
                        if self.store.cas_lo(
                            id,
                            self.store.lo_slice(id, cell),
                            self.store.lo_slice(id, next),
                        ) {
                            carry = sum - fitted;
                            if carry == 0 {
                                return true;
                            }
                            break;
                        }
                        // retry this cell
                    }
                    _ => return false, // chain blocked by a foreign entry
                }
            }
        }
        false
    }

    /// Record `key`'s presence without counting.
    ///
    /// `Some((is_new, id))` on success, `None` when the walk is exhausted
    /// (table full).
    pub fn set(&self, key: u64) -> Option<(bool, u64)> {
        let (p0, rem) = self.split_hash(key);
        for step in 0..=self.reprobe_limit {
            let id = self.probe_pos(p0, step);
            loop {
                let cell = self.store.load(id);
                match self.decode(cell) {
                    Slot::Empty => {
                        let entry = self.encode(step as u64 + 1, 0, rem);
                        if self.store.try_claim(id, entry) == Claim::Claimed {
                            return Some((true, id));
                        }
                    }
                    Slot::Pending => hint::spin_loop(),
                    Slot::Primary { step: s, rem: r, .. } if s == step && r == rem => {
                        return Some((false, id));
                    }
                    _ => break,
                }
            }
        }
        None
    }

    /// Total count of `key`, continuation chunks included. `None` when the
    /// key was never inserted.
    pub fn get_val_for_key(&self, key: u64) -> Option<u64> {
        let (p0, rem) = self.split_hash(key);
        let (step, _id, value) = self.find_primary(p0, rem)?;
        Some(self.chain_total(p0, rem, step, value))
    }

    /// Cell id of `key`'s primary entry.
    pub fn get_key_id(&self, key: u64) -> Option<u64> {
        let (p0, rem) = self.split_hash(key);
        self.find_primary(p0, rem).map(|(_, id, _)| id)
    }

    fn find_primary(&self, p0: u64, rem: u64) -> Option<(u32, u64, u64)> {
        for step in 0..=self.reprobe_limit {
            let id = self.probe_pos(p0, step);
            loop {
                match self.decode(self.store.load(id)) {
                    Slot::Empty => return None,
                    Slot::Pending => hint::spin_loop(),
                    Slot::Primary { step: s, rem: r, value } if s == step && r == rem => {
                        return Some((step, id, value));
                    }
                    _ => break,
                }
            }
        }
        None
    }

    /// Sum a primary value with its contiguous continuation chunks,
    /// stopping at the first empty, non-continuation, or differently-keyed
    /// cell.
    fn chain_total(&self, p0: u64, rem: u64, primary_step: u32, primary_value: u64) -> u64 {
        let mut total = primary_value;
        for step in primary_step + 1..=self.reprobe_limit {
            let id = self.probe_pos(p0, step);
            match self.decode(self.store.load(id)) {
                Slot::Continuation { rem: r, value } if r == rem => total += value,
                _ => break,
            }
        }
        total
    }

    /// Inspect cell `id` directly.
    ///
    /// For a filled primary cell the reconstructed key and the accumulated
    /// value (continuations folded in) are returned; a continuation cell
    /// reports `Filled` with key 0 and its raw chunk. Used by the iterator
    /// and by tests.
    pub fn get_key_val_at_id(&self, id: u64) -> (CellStatus, u64, u64) {
        match self.decode(self.store.load(id)) {
            Slot::Empty => (CellStatus::Empty, 0, 0),
            Slot::Pending => (CellStatus::LbSet, 0, 0),
            Slot::Primary { step, rem, value } => {
                let key = self.reconstruct(id, step, rem);
                let p0 = id.wrapping_sub(self.offsets[step as usize]) & self.size_mask;
                (CellStatus::Filled, key, self.chain_total(p0, rem, step, value))
            }
            Slot::Continuation { value, .. } => (CellStatus::Filled, 0, value),
        }
    }

    /// Zero every cell. Not thread-safe; the exclusive borrow enforces
    /// quiescence.
    pub fn clear(&mut self) {
        self.store.clear();
    }

    /// Scan every primary cell in ascending id order.
    ///
    /// Not a consistent snapshot: inserts landing ahead of the cursor are
    /// visible. Enumerate only after writers have quiesced.
    pub fn iter(&self) -> PositionIter<'_> {
        PositionIter {
            ary: self,
            id: 0,
            end: self.size(),
        }
    }

    /// Iterator over the `worker`-th of `num_workers` equal id slices.
    ///
    /// A pair belongs to the worker owning its *primary* cell, so workers
    /// yield disjoint sets whose union is [`CountArray::iter`]; chain
    /// accumulation reads past the slice end as needed.
    pub fn slice_iter(&self, worker: u64, num_workers: u64) -> PositionIter<'_> {
        assert!(num_workers > 0 && worker < num_workers);
        let size = self.size();
        PositionIter {
            ary: self,
            id: size * worker / num_workers,
            end: size * (worker + 1) / num_workers,
        }
    }

    fn primary_at(&self, id: u64) -> Option<(u64, u64)> {
        match self.decode(self.store.load(id)) {
            Slot::Primary { step, rem, value } => {
                let key = self.reconstruct(id, step, rem);
                let p0 = id.wrapping_sub(self.offsets[step as usize]) & self.size_mask;
                Some((key, self.chain_total(p0, rem, step, value)))
            }
            _ => None,
        }
    }
}

/// Forward cursor over filled primary cells; see [`CountArray::iter`].
pub struct PositionIter<'a> {
    ary: &'a CountArray,
    id: u64,
    end: u64,
}

impl Iterator for PositionIter<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        while self.id < self.end {
            let id = self.id;
            self.id += 1;
            if let Some(pair) = self.ary.primary_at(id) {
                return Some(pair);
            }
        }
        None
    }
}

#[inline]
fn field_mask(width: u32) -> u64 {
    if width == 0 {
        0
    } else if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// Craft a key whose hash lands exactly on `pos` with hash-high bits
    /// `rem` (the inverse matrix makes this a constructive operation).
    fn key_for_position(ary: &CountArray, pos: u64, rem: u64) -> u64 {
        let h = ((rem << ary.lsize) | pos) & ary.matrix().mask();
        let key = ary.inverse_matrix().times(h);
        debug_assert_eq!(ary.position_of(key), pos & ary.size_mask);
        key
    }

    #[test]
    fn crafted_collisions_take_quadratic_slots() {
        let mut rng = StdRng::seed_from_u64(11);
        let ary = CountArray::with_rng(512, 20, 3, 62, &mut rng).unwrap();

        // Four keys, all hashing to position 100.
        let keys: Vec<u64> = (0..4).map(|r| key_for_position(&ary, 100, r)).collect();
        for &k in &keys {
            assert!(ary.add(k, 1));
        }

        // Slots 100, 101, 103, 106 with markers 1..=4.
        for (j, &k) in keys.iter().enumerate() {
            let id = (100 + ary.reprobe_offset(j as u32)) & ary.size_mask;
            assert_eq!([100, 101, 103, 106][j], id);
            assert_eq!(ary.get_key_id(k), Some(id));
            match ary.decode(ary.store.load(id)) {
                Slot::Primary { step, .. } => assert_eq!(step as usize, j),
                s => panic!("expected primary at {id}, got {s:?}"),
            }
            let (status, key, val) = ary.get_key_val_at_id(id);
            assert_eq!(status, CellStatus::Filled);
            assert_eq!(key, k);
            assert_eq!(val, 1);
        }
    }

    #[test]
    fn saturation_spills_into_one_continuation_cell() {
        let mut rng = StdRng::seed_from_u64(13);
        let ary = CountArray::with_rng(512, 32, 2, 62, &mut rng).unwrap();
        let key = 0xdead_beef;

        assert!(ary.add(key, 3));
        assert!(ary.add(key, 2));

        let id = ary.get_key_id(key).unwrap();
        match ary.decode(ary.store.load(id)) {
            Slot::Primary { value, .. } => assert_eq!(value, 3), // saturated
            s => panic!("expected primary, got {s:?}"),
        }

        // Exactly one continuation chunk holding the surplus.
        let chunks: Vec<u64> = (0..ary.size())
            .filter_map(|i| match ary.decode(ary.store.load(i)) {
                Slot::Continuation { value, .. } => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec![2]);

        assert_eq!(ary.get_val_for_key(key), Some(5));
    }

    #[test]
    fn single_add_of_a_large_delta_builds_a_chain() {
        let mut rng = StdRng::seed_from_u64(17);
        let ary = CountArray::with_rng(256, 24, 2, 30, &mut rng).unwrap();
        let key = 0xabcdef;

        // 3 + 3 + 3 + 1 across primary and three continuation cells.
        assert!(ary.add(key, 10));
        assert_eq!(ary.get_val_for_key(key), Some(10));

        // Adding more keeps extending the same chain.
        assert!(ary.add(key, 7));
        assert_eq!(ary.get_val_for_key(key), Some(17));
    }

    #[test]
    fn set_reports_newness_and_id() {
        let mut rng = StdRng::seed_from_u64(19);
        let ary = CountArray::with_rng(1 << 10, 40, 1, 62, &mut rng).unwrap();

        let (is_new, id) = ary.set(42).unwrap();
        assert!(is_new);
        let (again, id2) = ary.set(42).unwrap();
        assert!(!again);
        assert_eq!(id, id2);
        assert_eq!(ary.get_key_id(42), Some(id));
        assert_eq!(ary.get_key_id(43), None);
    }

    #[test]
    fn clear_empties_every_cell() {
        let mut rng = StdRng::seed_from_u64(23);
        let mut ary = CountArray::with_rng(256, 16, 2, 30, &mut rng).unwrap();
        for k in 0..50u64 {
            assert!(ary.add(k, 1));
        }
        assert!(ary.iter().count() > 0);
        ary.clear();
        assert_eq!(ary.iter().count(), 0);
        assert_eq!(ary.get_val_for_key(1), None);
    }

    #[test]
    fn sliced_iteration_partitions_the_scan() {
        let mut rng = StdRng::seed_from_u64(29);
        let ary = CountArray::with_rng(1 << 9, 30, 4, 62, &mut rng).unwrap();
        let mut keyrng = StdRng::seed_from_u64(30);
        for _ in 0..200 {
            assert!(ary.add(keyrng.random::<u64>() & ary.matrix().mask(), 1));
        }

        let mut whole: Vec<(u64, u64)> = ary.iter().collect();
        let mut sliced: Vec<(u64, u64)> = (0..4)
            .flat_map(|w| ary.slice_iter(w, 4))
            .collect();
        whole.sort_unstable();
        sliced.sort_unstable();
        assert_eq!(whole, sliced);
    }
}
