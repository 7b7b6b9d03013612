//! Sorted dump of a quiesced array into the compacted format.
//!
//! Enumeration fans out over equal id slices (one per rayon worker), the
//! pairs are radix-sorted into `(H(key) mod S, key)` order, and streamed
//! through the compacted writer. Scheduling — deciding *when* a table must
//! be flushed — stays with the caller; a `false` return from
//! [`CountArray::add`] is the usual trigger.

use rayon::prelude::*;
use std::io::{Seek, Write};

use crate::array::CountArray;
use crate::error::MerError;
use crate::io::CompactedWriter;
use crate::radix::radix_sort_pairs_u64;

/// Dump `array` with an on-disk value width fitted to the largest count.
/// Returns the number of records written. The array must be quiesced.
pub fn dump<W: Write + Seek>(array: &CountArray, out: W) -> Result<u64, MerError> {
    let recs = collect_sorted(array);
    let max = recs.iter().map(|&(_, v)| v).max().unwrap_or(0);
    let val_bytes = (64 - u64::leading_zeros(max | 1)).div_ceil(8);
    write_records(array, out, val_bytes, &recs)
}

/// As [`dump`] with an explicit on-disk value width in bytes (1..=8).
/// Counts wider than the field are stored truncated to its low bytes.
pub fn dump_with<W: Write + Seek>(
    array: &CountArray,
    out: W,
    val_bytes: u32,
) -> Result<u64, MerError> {
    let recs = collect_sorted(array);
    write_records(array, out, val_bytes, &recs)
}

/// Enumerate every primary cell and order the pairs by `(position, key)`.
///
/// Two stable LSD passes: key first, then position, so pairs sharing a
/// position stay key-ordered.
fn collect_sorted(array: &CountArray) -> Vec<(u64, u64)> {
    let workers = rayon::current_num_threads().max(1) as u64;
    let shards: Vec<Vec<(u64, u64)>> = (0..workers)
        .into_par_iter()
        .map(|w| array.slice_iter(w, workers).collect())
        .collect();
    let mut recs: Vec<(u64, u64)> = shards.concat();

    let mut keys: Vec<u64> = recs.iter().map(|&(k, _)| k).collect();
    radix_sort_pairs_u64(&mut keys, &mut recs);
    let mut positions: Vec<u64> = recs.iter().map(|&(k, _)| array.position_of(k)).collect();
    radix_sort_pairs_u64(&mut positions, &mut recs);
    recs
}

fn write_records<W: Write + Seek>(
    array: &CountArray,
    out: W,
    val_bytes: u32,
    recs: &[(u64, u64)],
) -> Result<u64, MerError> {
    let mut writer = CompactedWriter::create(out, array, val_bytes)?;
    for &(key, val) in recs {
        writer.append(key, val)?;
    }
    writer.finalize()?;
    Ok(writer.distinct())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::Rng;
    use std::io::Cursor;

    #[test]
    fn dump_orders_by_position_then_key() {
        let mut rng = StdRng::seed_from_u64(5);
        let ary = CountArray::with_rng(1 << 8, 22, 4, 40, &mut rng).unwrap();
        for _ in 0..150 {
            assert!(ary.add(rng.random::<u64>() & ary.matrix().mask(), 1 + (rng.random::<u64>() % 9)));
        }

        let cursor = Cursor::new(Vec::new());
        let recs = collect_sorted(&ary);
        let n = dump(&ary, cursor).unwrap();
        assert_eq!(n, recs.len() as u64);
        for pair in recs.windows(2) {
            let a = (ary.position_of(pair[0].0), pair[0].0);
            let b = (ary.position_of(pair[1].0), pair[1].0);
            assert!(a < b);
        }
    }
}
