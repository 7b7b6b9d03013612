//! Exact k-mer counting in modern Rust (edition 2024).
//!
//! Two coupled subsystems:
//! - [`CountArray`]: a lock-free, bit-packed, open-addressed counting table
//!   whose hash is an invertible GF(2) matrix, so cells store only the high
//!   hash bits and positions recover full keys.
//! - the compacted on-disk image of such a table: [`CompactedWriter`],
//!   [`CompactedReader`], and the memory-mapped [`CompactedQuery`], all over
//!   one sorted little-endian record format.
//!
//! Feeding sequence data into the table and deciding when to flush it are
//! the caller's business; [`dump`] turns a quiesced table into its durable
//! image in one call.
//!
//! See README for the on-disk format.

mod array;
mod cells;
mod dumper;
pub mod encode;
mod error;
mod io;
mod matrix;
mod query;
mod radix;

pub use crate::array::{CellStatus, CountArray, PositionIter};
pub use crate::dumper::{dump, dump_with};
pub use crate::encode::{canonical, decode_kmer, encode_kmer, revcomp};
pub use crate::error::MerError;
pub use crate::io::{COMPACTED_MAGIC, CompactedHeader, CompactedReader, CompactedWriter, HEADER_LEN};
pub use crate::matrix::SquareBinaryMatrix;
pub use crate::query::CompactedQuery;
