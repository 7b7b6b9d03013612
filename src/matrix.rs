//! Square binary matrix over GF(2), the invertible hash of the counting
//! array.
//!
//! The matrix is `dim × dim` bits, stored as `dim` column vectors of `dim`
//! bits each (one `u64` per column, low bits meaningful). Multiplication by
//! a key is an XOR fold over the columns selected by the key's set bits, so
//! an invertible matrix gives a bijection on `dim`-bit words: the low bits
//! of the hash locate a cell and the high bits, stored in the cell, recover
//! the key through the inverse.

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use std::io::{Read, Write};

use crate::error::MerError;

/// How many fresh samples to try before giving up on finding an invertible
/// matrix. Failure probability per attempt is below 1/2 for any dimension,
/// so this budget is never exhausted in practice.
const RANDOMIZE_ATTEMPTS: u32 = 16;

/// Square bit matrix over GF(2), column-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SquareBinaryMatrix {
    dim: u32,
    cols: Vec<u64>,
}

impl SquareBinaryMatrix {
    /// The identity matrix of the given dimension (`1..=64`).
    pub fn identity(dim: u32) -> Self {
        assert!((1..=64).contains(&dim), "matrix dimension must be 1..=64");
        let cols = (0..dim).map(|c| 1u64 << c).collect();
        SquareBinaryMatrix { dim, cols }
    }

    /// Build from explicit column vectors. Columns must already fit `dim`
    /// bits.
    pub fn from_columns(dim: u32, cols: Vec<u64>) -> Self {
        assert!((1..=64).contains(&dim), "matrix dimension must be 1..=64");
        assert_eq!(cols.len(), dim as usize);
        let mask = Self::mask_for(dim);
        debug_assert!(cols.iter().all(|&c| c & !mask == 0));
        SquareBinaryMatrix { dim, cols }
    }

    /// Sample a uniformly random matrix (not necessarily invertible).
    pub fn random<R: Rng>(dim: u32, rng: &mut R) -> Self {
        assert!((1..=64).contains(&dim), "matrix dimension must be 1..=64");
        let mask = Self::mask_for(dim);
        let cols = (0..dim).map(|_| rng.random::<u64>() & mask).collect();
        SquareBinaryMatrix { dim, cols }
    }

    /// Sample matrices until one inverts, returning the pair `(M, M⁻¹)`.
    pub fn random_invertible<R: Rng>(
        dim: u32,
        rng: &mut R,
    ) -> Result<(Self, Self), MerError> {
        for _ in 0..RANDOMIZE_ATTEMPTS {
            let m = Self::random(dim, rng);
            if let Ok(inv) = m.inverse() {
                return Ok((m, inv));
            }
        }
        Err(MerError::MatrixNotInvertible)
    }

    #[inline]
    fn mask_for(dim: u32) -> u64 {
        if dim == 64 { u64::MAX } else { (1u64 << dim) - 1 }
    }

    /// Bit dimension of the matrix.
    #[inline]
    pub fn dim(&self) -> u32 {
        self.dim
    }

    /// Mask selecting the meaningful low `dim` bits of a word.
    #[inline]
    pub fn mask(&self) -> u64 {
        Self::mask_for(self.dim)
    }

    /// Matrix-vector product over GF(2).
    #[inline]
    pub fn times(&self, x: u64) -> u64 {
        let mut rem = x & self.mask();
        let mut y = 0u64;
        while rem != 0 {
            let i = rem.trailing_zeros() as usize;
            y ^= self.cols[i];
            rem &= rem - 1;
        }
        y
    }

    /// Gauss-Jordan inversion over GF(2).
    ///
    /// Reduction works on rows of the augmented matrix `[M | I]`; a zero
    /// pivot column means `M` is singular.
    pub fn inverse(&self) -> Result<Self, MerError> {
        let dim = self.dim as usize;

        // Row-major views: bit c of rows_a[r] is M[r][c].
        let mut rows_a = vec![0u64; dim];
        let mut rows_i = vec![0u64; dim];
        for (c, &col) in self.cols.iter().enumerate() {
            for r in 0..dim {
                rows_a[r] |= ((col >> r) & 1) << c;
            }
        }
        for (r, row) in rows_i.iter_mut().enumerate() {
            *row = 1u64 << r;
        }

        for c in 0..dim {
            let pivot_bit = 1u64 << c;
            let pivot = (c..dim).find(|&r| rows_a[r] & pivot_bit != 0);
            let Some(pivot) = pivot else {
                return Err(MerError::MatrixNotInvertible);
            };
            rows_a.swap(c, pivot);
            rows_i.swap(c, pivot);
            let (pa, pi) = (rows_a[c], rows_i[c]);
            for r in 0..dim {
                if r != c && rows_a[r] & pivot_bit != 0 {
                    rows_a[r] ^= pa;
                    rows_i[r] ^= pi;
                }
            }
        }

        // rows_i now holds M⁻¹ row-major; transpose back to columns.
        let mut cols = vec![0u64; dim];
        for r in 0..dim {
            let row = rows_i[r];
            for (c, col) in cols.iter_mut().enumerate() {
                *col |= ((row >> c) & 1) << r;
            }
        }
        Ok(SquareBinaryMatrix {
            dim: self.dim,
            cols,
        })
    }

    /// Serialized size in bytes: rank word plus one word per column.
    #[inline]
    pub fn dump_size(&self) -> usize {
        8 + 8 * self.dim as usize
    }

    /// Write `u64` rank followed by the columns, all little-endian.
    pub fn dump<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u64::<LE>(self.dim as u64)?;
        for &col in &self.cols {
            w.write_u64::<LE>(col)?;
        }
        Ok(())
    }

    /// Read a matrix in `dump` format.
    pub fn load<R: Read>(r: &mut R) -> Result<Self, MerError> {
        let dim = r.read_u64::<LE>()?;
        if !(1..=64).contains(&dim) {
            return Err(MerError::BadHeader(format!("matrix rank {dim}")));
        }
        let dim = dim as u32;
        let mask = Self::mask_for(dim);
        let mut cols = Vec::with_capacity(dim as usize);
        for _ in 0..dim {
            let col = r.read_u64::<LE>()?;
            if col & !mask != 0 {
                return Err(MerError::BadHeader("matrix column overflows rank".into()));
            }
            cols.push(col);
        }
        Ok(SquareBinaryMatrix { dim, cols })
    }

    /// Parse a matrix from an 8-byte-aligned byte slice (the mmap'd query
    /// path). Returns the matrix and the number of bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), MerError> {
        if bytes.len() < 8 {
            return Err(MerError::BadHeader("matrix block truncated".into()));
        }
        let words: &[u64] = bytemuck::try_cast_slice(&bytes[..bytes.len() & !7])
            .map_err(|e| MerError::BadHeader(format!("matrix cast: {e:?}")))?;
        let dim = words[0];
        if !(1..=64).contains(&dim) {
            return Err(MerError::BadHeader(format!("matrix rank {dim}")));
        }
        let n = dim as usize;
        if words.len() < 1 + n {
            return Err(MerError::BadHeader("matrix block truncated".into()));
        }
        let mask = Self::mask_for(dim as u32);
        let cols = words[1..1 + n].to_vec();
        if cols.iter().any(|&c| c & !mask != 0) {
            return Err(MerError::BadHeader("matrix column overflows rank".into()));
        }
        Ok((
            SquareBinaryMatrix {
                dim: dim as u32,
                cols,
            },
            8 * (1 + n),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn identity_is_its_own_inverse() {
        for dim in [1u32, 7, 30, 64] {
            let id = SquareBinaryMatrix::identity(dim);
            assert_eq!(id.inverse().unwrap(), id);
            assert_eq!(id.times(0x1234_5678 & id.mask()), 0x1234_5678 & id.mask());
        }
    }

    #[test]
    fn inverse_round_trip() {
        let mut rng = StdRng::seed_from_u64(42);
        for dim in [8u32, 20, 33, 64] {
            let (m, inv) = SquareBinaryMatrix::random_invertible(dim, &mut rng).unwrap();
            for _ in 0..64 {
                let x = rng.random::<u64>() & m.mask();
                assert_eq!(inv.times(m.times(x)), x);
                assert_eq!(m.times(inv.times(x)), x);
            }
        }
    }

    #[test]
    fn singular_matrix_rejected() {
        // Two identical columns: rank < dim.
        let m = SquareBinaryMatrix::from_columns(4, vec![0b0011, 0b0011, 0b0100, 0b1000]);
        assert!(matches!(m.inverse(), Err(MerError::MatrixNotInvertible)));
        // The zero matrix as the degenerate case.
        let z = SquareBinaryMatrix::from_columns(8, vec![0; 8]);
        assert!(z.inverse().is_err());
    }

    #[test]
    fn dump_load_round_trip() {
        let mut rng = StdRng::seed_from_u64(7);
        let (m, _) = SquareBinaryMatrix::random_invertible(30, &mut rng).unwrap();
        let mut buf = Vec::new();
        m.dump(&mut buf).unwrap();
        assert_eq!(buf.len(), m.dump_size());

        let loaded = SquareBinaryMatrix::load(&mut &buf[..]).unwrap();
        assert_eq!(loaded, m);

        let (from_bytes, consumed) = SquareBinaryMatrix::from_bytes(&buf).unwrap();
        assert_eq!(from_bytes, m);
        assert_eq!(consumed, buf.len());
    }
}
