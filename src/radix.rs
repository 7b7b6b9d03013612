//! In-place LSD radix sort for `u64` sort keys with a paired record array.
//! 8-bit passes, 8 rounds. Stable via counting + prefix sums.
//!
//! The dumper sorts `(key, count)` records by hashed position; stability
//! across passes is what lets the position sort preserve a preceding
//! key-order pass, giving the `(position, key)` lexicographic order the
//! compacted format requires.

/// Sort `keys` in ascending order and permute `recs` accordingly.
/// Temporary buffers are allocated once and reused across passes.
pub fn radix_sort_pairs_u64(keys: &mut [u64], recs: &mut [(u64, u64)]) {
    debug_assert_eq!(keys.len(), recs.len());
    let n = keys.len();
    if n <= 1 {
        return;
    }

    // Scratch buffers.
    let mut tmp_keys = vec![0u64; n];
    let mut tmp_recs = vec![(0u64, 0u64); n];

    // For each byte [0..7], perform a counting sort pass.
    for pass in 0..8 {
        let shift = pass * 8;
        let mut counts = [0usize; 256];

        // Count occurrences
        for &k in keys.iter() {
            let byte = ((k >> shift) & 0xFF) as usize;
            counts[byte] += 1;
        }

        // Skip passes where every key shares the byte.
        if counts.iter().any(|&c| c == n) {
            continue;
        }

        // Prefix sums -> positions
        let mut sum = 0usize;
        for c in counts.iter_mut() {
            let tmp = *c;
            *c = sum;
            sum += tmp;
        }

        // Scatter to tmp (stable)
        for i in 0..n {
            let k = keys[i];
            let b = ((k >> shift) & 0xFF) as usize;
            let pos = counts[b];
            tmp_keys[pos] = k;
            tmp_recs[pos] = recs[i];
            counts[b] = pos + 1;
        }

        // Swap buffers
        keys.copy_from_slice(&tmp_keys);
        recs.copy_from_slice(&tmp_recs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_and_keeps_pairs_aligned() {
        let mut keys: Vec<u64> = vec![9, 3, 7, 3, 0, u64::MAX, 42];
        let mut recs: Vec<(u64, u64)> = keys
            .iter()
            .map(|&k| (k.wrapping_mul(2), k.wrapping_add(1)))
            .collect();
        radix_sort_pairs_u64(&mut keys, &mut recs);

        assert_eq!(keys, vec![0u64, 3, 3, 7, 9, 42, u64::MAX]);
        for (k, r) in keys.iter().zip(&recs) {
            assert_eq!(*r, (k.wrapping_mul(2), k.wrapping_add(1)));
        }
    }

    #[test]
    fn stable_for_equal_keys() {
        let mut keys = vec![5u64, 5, 5, 1, 1];
        let mut recs = vec![(0u64, 0u64), (0, 1), (0, 2), (1, 0), (1, 1)];
        radix_sort_pairs_u64(&mut keys, &mut recs);
        assert_eq!(recs, vec![(1, 0), (1, 1), (0, 0), (0, 1), (0, 2)]);
    }
}
