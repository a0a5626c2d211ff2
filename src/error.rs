use thiserror::Error;

/// Errors surfaced across the public API.
///
/// Each variant is a distinct, non-overlapping failure mode propagated
/// synchronously out of `compute`/`index`/`fetch` boundaries.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid expression: {0}")]
    Validation(#[from] crate::expr::validator::ValidationError),

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("empty reduction over axis {axis:?}")]
    EmptyReduction { axis: Vec<usize> },

    #[error("failed to decompress chunk {nchunk}: {source}")]
    Decompress {
        nchunk: usize,
        #[source]
        source: DecompressError,
    },

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

#[derive(Error, Debug)]
pub enum DecompressError {
    #[error("corrupt chunk payload")]
    Corrupt,
    #[error("output buffer too small: need {need}, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    #[error("blosc decompression failed")]
    Blosc,
}

pub type Result<T> = std::result::Result<T, Error>;
