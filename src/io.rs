//! Compacted on-disk format: header + matrices + packed records.
//! All integers are little-endian.
//!
//! ```text
//! offset 0   magic "JFLISTDN"                      8 bytes
//! offset 8   key_len_bits   (u64 LE)               8
//! offset 16  val_len_bytes  (u64 LE)               8
//! offset 24  size S         (u64 LE, power of 2)   8
//! offset 32  reprobe_limit  (u64 LE)               8
//! offset 40  unique         (u64 LE)               8
//! offset 48  distinct       (u64 LE)               8
//! offset 56  total          (u64 LE)               8
//! offset 64  max_count      (u64 LE)               8
//! offset 72  matrix M, matrix M⁻¹ (rank + columns each)
//!            records: (key: ceil(kb/8) bytes, value: val_len_bytes) …
//! ```
//!
//! Records must arrive sorted by `(H(key) mod S, key)`; the point query
//! relies on that invariant.

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::array::CountArray;
use crate::error::MerError;
use crate::matrix::SquareBinaryMatrix;

/// File type tag at offset 0.
pub const COMPACTED_MAGIC: &[u8; 8] = b"JFLISTDN";
/// Fixed byte length of the statistics header.
pub const HEADER_LEN: usize = 72;

/// Default read-buffer budget of [`CompactedReader::open`], in bytes.
const DEFAULT_BUF_LEN: usize = 10_000_000;

/// How many records the writer buffers between drains.
const WRITER_BUF_RECORDS: usize = 1 << 16;

/// The fixed 72-byte statistics header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactedHeader {
    pub key_bits: u64,
    pub val_bytes: u64,
    pub size: u64,
    pub reprobe_limit: u64,
    pub unique: u64,
    pub distinct: u64,
    pub total: u64,
    pub max_count: u64,
}

impl CompactedHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(COMPACTED_MAGIC)?;
        w.write_u64::<LE>(self.key_bits)?;
        w.write_u64::<LE>(self.val_bytes)?;
        w.write_u64::<LE>(self.size)?;
        w.write_u64::<LE>(self.reprobe_limit)?;
        w.write_u64::<LE>(self.unique)?;
        w.write_u64::<LE>(self.distinct)?;
        w.write_u64::<LE>(self.total)?;
        w.write_u64::<LE>(self.max_count)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, MerError> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != COMPACTED_MAGIC {
            return Err(MerError::BadHeader("bad file type".into()));
        }
        let header = CompactedHeader {
            key_bits: r.read_u64::<LE>()?,
            val_bytes: r.read_u64::<LE>()?,
            size: r.read_u64::<LE>()?,
            reprobe_limit: r.read_u64::<LE>()?,
            unique: r.read_u64::<LE>()?,
            distinct: r.read_u64::<LE>()?,
            total: r.read_u64::<LE>()?,
            max_count: r.read_u64::<LE>()?,
        };
        header.validate()?;
        Ok(header)
    }

    /// Geometry checks shared by the reader and the query.
    pub fn validate(&self) -> Result<(), MerError> {
        if !self.size.is_power_of_two() {
            return Err(MerError::BadHeader(format!(
                "size {} is not a power of two",
                self.size
            )));
        }
        if !(1..=64).contains(&self.key_bits) {
            return Err(MerError::BadHeader(format!("key length {} bits", self.key_bits)));
        }
        if !(1..=8).contains(&self.val_bytes) {
            return Err(MerError::BadHeader(format!("value length {} bytes", self.val_bytes)));
        }
        Ok(())
    }

    /// Stored key width in bytes.
    #[inline]
    pub fn key_bytes(&self) -> usize {
        self.key_bits.div_ceil(8) as usize
    }

    /// Bytes per record.
    #[inline]
    pub fn record_len(&self) -> usize {
        self.key_bytes() + self.val_bytes as usize
    }
}

/// Streams sorted `(key, count)` pairs into the compacted format.
///
/// `create` writes a zero-statistics header and both matrices up front;
/// [`CompactedWriter::finalize`] (needs `Seek`) patches the real statistics
/// in. A writer drained only through `flush` — a pipe, say — still produces
/// a valid stream, but its statistics fields stay zero.
pub struct CompactedWriter<W: Write> {
    out: W,
    header: CompactedHeader,
    buf: Vec<u8>,
}

impl<W: Write> CompactedWriter<W> {
    /// Start a compacted stream carrying `array`'s geometry and matrices.
    pub fn create(out: W, array: &CountArray, val_bytes: u32) -> Result<Self, MerError> {
        Self::with_matrices(
            out,
            array.matrix(),
            array.inverse_matrix(),
            array.size(),
            array.reprobe_limit() as u64,
            val_bytes,
        )
    }

    /// As [`CompactedWriter::create`] with an explicit matrix pair and
    /// geometry.
    pub fn with_matrices(
        mut out: W,
        matrix: &SquareBinaryMatrix,
        inverse: &SquareBinaryMatrix,
        size: u64,
        reprobe_limit: u64,
        val_bytes: u32,
    ) -> Result<Self, MerError> {
        let header = CompactedHeader {
            key_bits: matrix.dim() as u64,
            val_bytes: val_bytes as u64,
            size,
            reprobe_limit,
            ..Default::default()
        };
        header.validate()?;
        header.write_to(&mut out)?;
        matrix.dump(&mut out)?;
        inverse.dump(&mut out)?;
        let buf = Vec::with_capacity(WRITER_BUF_RECORDS * header.record_len());
        Ok(CompactedWriter { out, header, buf })
    }

    /// Buffer one record and fold it into the running statistics. The
    /// value's low `val_bytes` bytes are stored.
    pub fn append(&mut self, key: u64, val: u64) -> std::io::Result<()> {
        let kb = self.header.key_bytes();
        let vb = self.header.val_bytes as usize;
        self.buf.extend_from_slice(&key.to_le_bytes()[..kb]);
        self.buf.extend_from_slice(&val.to_le_bytes()[..vb]);

        self.header.unique += (val == 1) as u64;
        self.header.distinct += 1;
        self.header.total += val;
        if val > self.header.max_count {
            self.header.max_count = val;
        }

        if self.buf.len() >= self.buf.capacity() {
            self.flush()?;
        }
        Ok(())
    }

    /// Drain the record buffer to the underlying stream.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.out.write_all(&self.buf)?;
        self.buf.clear();
        self.out.flush()
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

    /// Flush and give the stream back (tests, chained writers).
    pub fn into_inner(mut self) -> std::io::Result<W> {
        self.flush()?;
        Ok(self.out)
    }
}

impl<W: Write + Seek> CompactedWriter<W> {
    /// Flush, then rewrite the header in place with the final statistics.
    pub fn finalize(&mut self) -> std::io::Result<()> {
        self.flush()?;
        self.out.seek(SeekFrom::Start(0))?;
        self.header.write_to(&mut self.out)?;
        self.out.seek(SeekFrom::End(0))?;
        self.out.flush()
    }
}

/// Buffered sequential reader over a compacted stream.
pub struct CompactedReader<R: Read> {
    io: R,
    header: CompactedHeader,
    matrix: SquareBinaryMatrix,
    inverse: SquareBinaryMatrix,
    record_len: usize,
    buf: Vec<u8>,
    filled: usize,
    pos: usize,
    eof: bool,
}

impl CompactedReader<BufReader<File>> {
    /// Open a compacted file with the default buffer budget.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MerError> {
        Self::new(BufReader::new(File::open(path)?), DEFAULT_BUF_LEN)
    }
}

impl<R: Read> CompactedReader<R> {
    /// Validate the header, load both matrices, and size the record buffer
    /// down to a whole number of records.
    pub fn new(mut io: R, buf_len: usize) -> Result<Self, MerError> {
        let header = CompactedHeader::read_from(&mut io)?;
        let matrix = SquareBinaryMatrix::load(&mut io)?;
        let inverse = SquareBinaryMatrix::load(&mut io)?;
        if matrix.dim() as u64 != header.key_bits || inverse.dim() != matrix.dim() {
            return Err(MerError::BadHeader("matrix rank disagrees with key length".into()));
        }

        let record_len = header.record_len();
        let buf_len = record_len * (buf_len / record_len).max(1);
        Ok(CompactedReader {
            io,
            header,
            matrix,
            inverse,
            record_len,
            buf: vec![0u8; buf_len],
            filled: 0,
            pos: 0,
            eof: false,
        })
    }

    /// Next `(key, count)` record, or `None` at a clean end of stream.
    ///
    /// A trailing partial record surfaces as
    /// [`MerError::TruncatedRecord`].
    pub fn next_record(&mut self) -> Result<Option<(u64, u64)>, MerError> {
        if self.pos + self.record_len > self.filled {
            self.refill()?;
            if self.filled == 0 {
                return Ok(None);
            }
        }

        let kb = self.header.key_bytes();
        let rec = &self.buf[self.pos..self.pos + self.record_len];
        self.pos += self.record_len;

        let mut key = [0u8; 8];
        key[..kb].copy_from_slice(&rec[..kb]);
        let mut val = [0u8; 8];
        val[..self.header.val_bytes as usize].copy_from_slice(&rec[kb..]);
        Ok(Some((u64::from_le_bytes(key), u64::from_le_bytes(val))))
    }

    /// Pull bytes until the buffer holds whole records again. A partial
    /// tail is carried over between rounds; one left at end of stream is a
    /// truncated record.
    fn refill(&mut self) -> Result<(), MerError> {
        let tail = self.filled - self.pos;
        self.buf.copy_within(self.pos..self.filled, 0);
        self.filled = tail;
        self.pos = 0;

        while !self.eof && self.filled < self.buf.len() {
            match self.io.read(&mut self.buf[self.filled..]) {
                Ok(0) => self.eof = true,
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if self.filled == 0 {
            return Ok(()); // clean end of stream
        }
        if self.filled < self.record_len {
            return Err(MerError::TruncatedRecord);
        }
        Ok(())
    }

    /// `H(key) mod S` of a record's key, for sort-order cross-checks.
    #[inline]
    pub fn pos_of(&self, key: u64) -> u64 {
        self.matrix.times(key) & (self.header.size - 1)
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

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::io::Cursor;

    fn test_matrices(dim: u32) -> (SquareBinaryMatrix, SquareBinaryMatrix) {
        let mut rng = StdRng::seed_from_u64(99);
        SquareBinaryMatrix::random_invertible(dim, &mut rng).unwrap()
    }

    #[test]
    fn header_round_trip() {
        let header = CompactedHeader {
            key_bits: 30,
            val_bytes: 2,
            size: 512,
            reprobe_limit: 62,
            unique: 1,
            distinct: 2,
            total: 3,
            max_count: 4,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(CompactedHeader::read_from(&mut &buf[..]).unwrap(), header);
    }

    #[test]
    fn non_power_of_two_size_is_rejected() {
        let mut header = CompactedHeader {
            key_bits: 30,
            val_bytes: 2,
            size: 500,
            ..Default::default()
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert!(matches!(
            CompactedHeader::read_from(&mut &buf[..]),
            Err(MerError::BadHeader(_))
        ));
        header.size = 512;
        buf.clear();
        header.write_to(&mut buf).unwrap();
        assert!(CompactedHeader::read_from(&mut &buf[..]).is_ok());
    }

    #[test]
    fn writer_statistics_and_reader_round_trip() {
        let (m, inv) = test_matrices(30);
        let mut w =
            CompactedWriter::with_matrices(Cursor::new(Vec::new()), &m, &inv, 512, 62, 2).unwrap();

        let pairs: Vec<(u64, u64)> = (0..100u64).map(|i| (i * 31 + 1, (i % 5) + 1)).collect();
        // Sorted the way a dumper would feed them.
        let mut sorted = pairs.clone();
        sorted.sort_by_key(|&(k, _)| ((m.times(k) & 511), k));
        for &(k, v) in &sorted {
            w.append(k, v).unwrap();
        }
        w.finalize().unwrap();

        assert_eq!(w.distinct(), 100);
        assert_eq!(w.unique(), pairs.iter().filter(|&&(_, v)| v == 1).count() as u64);
        assert_eq!(w.total(), pairs.iter().map(|&(_, v)| v).sum::<u64>());
        assert_eq!(w.max_count(), 5);

        let bytes = w.into_inner().unwrap().into_inner();
        let mut r = CompactedReader::new(Cursor::new(&bytes), 64).unwrap();
        assert_eq!(r.key_bits(), 30);
        assert_eq!(r.mer_len(), 15);
        assert_eq!(r.distinct(), 100);
        assert_eq!(r.matrix(), &m);
        assert_eq!(r.inverse_matrix(), &inv);

        let mut got = Vec::new();
        let mut last = (0u64, 0u64);
        while let Some((k, v)) = r.next_record().unwrap() {
            let ordered = (r.pos_of(k), k);
            assert!(got.is_empty() || last <= ordered);
            last = ordered;
            got.push((k, v));
        }
        let mut expect = sorted;
        expect.sort_unstable();
        got.sort_unstable();
        assert_eq!(got, expect);
    }

    #[test]
    fn truncated_record_is_detected() {
        let (m, inv) = test_matrices(16);
        let mut w =
            CompactedWriter::with_matrices(Cursor::new(Vec::new()), &m, &inv, 256, 30, 1).unwrap();
        w.append(1, 1).unwrap();
        w.append(2, 2).unwrap();
        let mut bytes = w.into_inner().unwrap().into_inner();
        bytes.pop(); // sever the last record

        let mut r = CompactedReader::new(Cursor::new(&bytes), 4096).unwrap();
        assert!(r.next_record().unwrap().is_some());
        assert!(matches!(r.next_record(), Err(MerError::TruncatedRecord)));
    }
}
