use thiserror::Error;

/// Errors that can occur during binary operations.
#[derive(Error, Debug)]
pub enum BinaryError {
    /// Not enough bytes remaining in the buffer for the requested operation.
    #[error("not enough bytes in buffer: needed {needed}, remaining {remaining}")]
    UnexpectedEof { needed: usize, remaining: usize },

    /// A value does not fit the varint range `0..=MAX_VARINT`.
    #[error("value overflows varint")]
    VarintOverflow,

    /// A varint used more bytes than its value requires. Only raised when
    /// strict decoding is requested.
    #[error("non-canonical varint encoding")]
    NonCanonicalVarint,

    /// An invalid value was encountered while decoding.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, BinaryError>;
