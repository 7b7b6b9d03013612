use thiserror::Error;

/// Errors surfaced by the counting core and the compacted-file codecs.
///
/// Table-full is not represented here: the array's hot path reports it
/// through its return value and allocates nothing.
#[derive(Debug, Error)]
pub enum MerError {
    /// I/O error from the underlying stream, surfaced as is.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Magic mismatch, non-power-of-two size, or a length inconsistent
    /// with the header geometry.
    #[error("invalid compacted file: {0}")]
    BadHeader(String),
    /// Gauss-Jordan reduction hit a zero pivot, or random sampling
    /// exhausted its retry budget.
    #[error("matrix is not invertible")]
    MatrixNotInvertible,
    /// Trailing bytes of the record region are not a whole record.
    #[error("trailing bytes are not a whole record")]
    TruncatedRecord,
    /// Record order violated the `(position, key)` sort during a lookup.
    #[error("compacted records are not sorted by (position, key)")]
    UnsortedCompacted,
}
