use merhash::{CompactedReader, CompactedWriter, CountArray, SquareBinaryMatrix};
use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::io::Cursor;

proptest! {
    /// Any generated matrix pair is a mutual inverse over the whole key
    /// space it is sampled for.
    #[test]
    fn prop_matrix_inversion_round_trips(
        dim in 1u32..=64,
        seed in any::<u64>(),
        probes in prop::collection::vec(any::<u64>(), 8)
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let (m, inv) = SquareBinaryMatrix::random_invertible(dim, &mut rng).unwrap();
        for x in probes {
            let x = x & m.mask();
            prop_assert_eq!(inv.times(m.times(x)), x);
            prop_assert_eq!(m.times(inv.times(x)), x);
        }
    }

    /// The array agrees with a hash-map model under arbitrary interleaved
    /// adds, through both point gets and full enumeration.
    #[test]
    fn prop_array_matches_model(
        key_bits in 24u32..=48,
        val_bits in 4u32..=8,
        seed in any::<u64>(),
        ops in prop::collection::vec((any::<u64>(), 1u64..=7), 1..200)
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let ary = CountArray::with_rng(1 << 10, key_bits, val_bits, 62, &mut rng).unwrap();
        let key_mask = ary.matrix().mask();

        let mut model: HashMap<u64, u64> = HashMap::new();
        for (key, delta) in ops {
            let key = key & key_mask;
            prop_assert!(ary.add(key, delta));
            *model.entry(key).or_default() += delta;
        }

        for (&key, &val) in &model {
            prop_assert_eq!(ary.get_val_for_key(key), Some(val));
        }
        let got: HashMap<u64, u64> = ary.iter().collect();
        prop_assert_eq!(got, model);
    }

    /// A total reaches the same stored value however the adds are split.
    #[test]
    fn prop_overflow_totals_are_linear(
        val_bits in 1u32..=4,
        seed in any::<u64>(),
        parts in prop::collection::vec(1u64..=5, 1..8)
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let whole = CountArray::with_rng(1 << 9, 26, val_bits, 62, &mut rng).unwrap();
        let split = CountArray::with_matrix(
            1 << 9,
            val_bits,
            62,
            whole.matrix().clone(),
            whole.inverse_matrix().clone(),
        );

        let key = 0x00ca_fe42u64;
        let total: u64 = parts.iter().sum();
        prop_assert!(whole.add(key, total));
        for delta in parts {
            prop_assert!(split.add(key, delta));
        }

        prop_assert_eq!(whole.get_val_for_key(key), Some(total));
        prop_assert_eq!(split.get_val_for_key(key), Some(total));
    }

    /// Writer then reader is the identity on sorted pair streams, and the
    /// header statistics summarize the input exactly.
    #[test]
    fn prop_compacted_round_trip(
        key_bits in 9u32..=40,
        seed in any::<u64>(),
        raw_pairs in prop::collection::vec((any::<u64>(), 1u64..=255), 0..300)
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let (m, inv) = SquareBinaryMatrix::random_invertible(key_bits, &mut rng).unwrap();
        let size = 1u64 << 9;

        let mut dedup: HashMap<u64, u64> = HashMap::new();
        for (key, val) in raw_pairs {
            dedup.insert(key & m.mask(), val);
        }
        let mut pairs: Vec<(u64, u64)> = dedup.iter().map(|(&k, &v)| (k, v)).collect();
        pairs.sort_by_key(|&(k, _)| (m.times(k) & (size - 1), k));

        let mut w = CompactedWriter::with_matrices(
            Cursor::new(Vec::new()), &m, &inv, size, 62, 1,
        ).unwrap();
        for &(k, v) in &pairs {
            w.append(k, v).unwrap();
        }
        w.finalize().unwrap();
        let bytes = w.into_inner().unwrap().into_inner();

        let mut r = CompactedReader::new(Cursor::new(&bytes), 1 << 12).unwrap();
        prop_assert_eq!(r.distinct(), pairs.len() as u64);
        prop_assert_eq!(r.total(), pairs.iter().map(|&(_, v)| v).sum::<u64>());
        prop_assert_eq!(r.unique(), pairs.iter().filter(|&&(_, v)| v == 1).count() as u64);
        prop_assert_eq!(
            r.max_count(),
            pairs.iter().map(|&(_, v)| v).max().unwrap_or(0)
        );

        let mut got = Vec::new();
        while let Some(rec) = r.next_record().unwrap() {
            got.push(rec);
        }
        prop_assert_eq!(got, pairs);
    }
}
