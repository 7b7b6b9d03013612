//! Random lookups over a compacted file through a read-only memory map.
//!
//! The record region is sorted by `(H(key) mod S, key)`, so a lookup hashes
//! the key, range-checks the position against the first and last records,
//! and binary-searches with the same lexicographic comparator the dumper
//! sorted with. A k-mer never observed has count 0; absence is not an
//! error.

use std::fs::File;
use std::path::Path;

use crate::encode;
use crate::error::MerError;
use crate::io::{CompactedHeader, HEADER_LEN};
use crate::matrix::SquareBinaryMatrix;

/// Memory-mapped point query over a compacted file.
///
/// The file is write-once read-many; the map stays immutable for the
/// lifetime of the query.
pub struct CompactedQuery {
    map: memmap2::Mmap,
    header: CompactedHeader,
    matrix: SquareBinaryMatrix,
    inverse: SquareBinaryMatrix,
    records_off: usize,
    record_len: usize,
    key_bytes: usize,
    size_mask: u64,
    /// Number of records in the map.
    last_id: u64,
    first_key: u64,
    last_key: u64,
    first_pos: u64,
    last_pos: u64,
    canonical: bool,
}

impl CompactedQuery {
    /// Map a compacted file read-only and validate its geometry.
    ///
    /// `canonical` folds every looked-up k-mer onto
    /// `min(key, revcomp(key))` first; it requires an even key length
    /// (two bits per base) and is rejected here otherwise.
    pub fn open<P: AsRef<Path>>(path: P, canonical: bool) -> Result<Self, MerError> {
        let file = File::open(path)?;
        let map = unsafe { memmap2::MmapOptions::new().map(&file)? };
        if map.len() < HEADER_LEN {
            return Err(MerError::BadHeader("file shorter than its header".into()));
        }
        let header = CompactedHeader::read_from(&mut &map[..HEADER_LEN])?;
        if canonical && header.key_bits % 2 != 0 {
            return Err(MerError::BadHeader(
                "canonical lookups need an even key length".into(),
            ));
        }

        let (matrix, used_m) = SquareBinaryMatrix::from_bytes(&map[HEADER_LEN..])?;
        let (inverse, used_i) = SquareBinaryMatrix::from_bytes(&map[HEADER_LEN + used_m..])?;
        if matrix.dim() as u64 != header.key_bits || inverse.dim() != matrix.dim() {
            return Err(MerError::BadHeader("matrix rank disagrees with key length".into()));
        }

        let records_off = HEADER_LEN + used_m + used_i;
        let record_len = header.record_len();
        let body = map.len() - records_off;
        if body % record_len != 0 {
            return Err(MerError::BadHeader(format!(
                "record region of {body} bytes is not a multiple of {record_len}"
            )));
        }

        let mut query = CompactedQuery {
            map,
            size_mask: header.size - 1,
            records_off,
            record_len,
            key_bytes: header.key_bytes(),
            header,
            matrix,
            inverse,
            last_id: (body / record_len) as u64,
            first_key: 0,
            last_key: 0,
            first_pos: 0,
            last_pos: 0,
            canonical,
        };
        if query.last_id > 0 {
            query.first_key = query.key_at(0);
            query.last_key = query.key_at(query.last_id - 1);
            query.first_pos = query.pos_of(query.first_key);
            query.last_pos = query.pos_of(query.last_key);
        }
        Ok(query)
    }

    #[inline]
    fn key_at(&self, id: u64) -> u64 {
        let off = self.records_off + id as usize * self.record_len;
        le_u64(&self.map[off..off + self.key_bytes])
    }

    #[inline]
    fn val_at(&self, id: u64) -> u64 {
        let off = self.records_off + id as usize * self.record_len + self.key_bytes;
        le_u64(&self.map[off..off + self.header.val_bytes as usize])
    }

    /// `H(key) mod S`, the record sort position.
    #[inline]
    pub fn pos_of(&self, key: u64) -> u64 {
        self.matrix.times(key) & self.size_mask
    }

    /// Count of `key`; 0 when the k-mer was never observed.
    ///
    /// `UnsortedCompacted` surfaces lazily if the binary search trips over
    /// records violating the `(position, key)` order.
    pub fn lookup(&self, key: u64) -> Result<u64, MerError> {
        let key = if self.canonical {
            encode::canonical(key, (self.header.key_bits / 2) as usize)
        } else {
            key
        };
        if self.last_id == 0 {
            return Ok(0);
        }
        if key == self.first_key {
            return Ok(self.val_at(0));
        }
        if key == self.last_key {
            return Ok(self.val_at(self.last_id - 1));
        }
        let pos = self.pos_of(key);
        if pos < self.first_pos || pos > self.last_pos {
            return Ok(0);
        }

        let target = (pos, key);
        let mut lo_ord = (self.first_pos, self.first_key);
        let mut hi_ord = (self.last_pos, self.last_key);
        let (mut first, mut last) = (0u64, self.last_id);
        while first < last - 1 {
            let middle = (first + last) / 2;
            let mid_key = self.key_at(middle);
            if mid_key == key {
                return Ok(self.val_at(middle));
            }
            let mid_ord = (self.pos_of(mid_key), mid_key);
            if mid_ord < lo_ord || mid_ord > hi_ord {
                return Err(MerError::UnsortedCompacted);
            }
            if mid_ord > target {
                last = middle;
                hi_ord = mid_ord;
            } else {
                first = middle;
                lo_ord = mid_ord;
            }
        }
        Ok(0)
    }

    /// Whether lookups canonicalize their argument.
    pub fn is_canonical(&self) -> bool {
        self.canonical
    }

    /// Number of records in the file.
    pub fn num_records(&self) -> u64 {
        self.last_id
    }

    pub fn header(&self) -> &CompactedHeader {
        &self.header
    }
    pub fn key_bits(&self) -> u64 {
        self.header.key_bits
    }
    /// Number of DNA bases per key.
    pub fn mer_len(&self) -> u64 {
        self.header.key_bits / 2
    }
    pub fn val_bytes(&self) -> u64 {
        self.header.val_bytes
    }
    pub fn size(&self) -> u64 {
        self.header.size
    }
    pub fn reprobe_limit(&self) -> u64 {
        self.header.reprobe_limit
    }
    pub fn unique(&self) -> u64 {
        self.header.unique
    }
    pub fn distinct(&self) -> u64 {
        self.header.distinct
    }
    pub fn total(&self) -> u64 {
        self.header.total
    }
    pub fn max_count(&self) -> u64 {
        self.header.max_count
    }
    pub fn matrix(&self) -> &SquareBinaryMatrix {
        &self.matrix
    }
    pub fn inverse_matrix(&self) -> &SquareBinaryMatrix {
        &self.inverse
    }
}

#[inline]
fn le_u64(bytes: &[u8]) -> u64 {
    debug_assert!(bytes.len() <= 8);
    let mut b = [0u8; 8];
    b[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(b)
}
