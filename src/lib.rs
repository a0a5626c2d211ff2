//! A chunked, n-dimensional compressed array library with deferred
//! arithmetic expression evaluation: allocate an [`ndarray::NDArray`]
//! backed by an [`schunk::SChunk`] of independently blosc-compressed
//! chunks, build [`expr::LazyExpr`] expressions over one or more arrays
//! without evaluating them, and [`expr::compute`] the result chunk by
//! chunk. See each module's doc comment for the component it implements.

use smallvec::SmallVec;

pub mod chunk;
pub mod config;
pub mod dtype;
pub mod error;
pub mod expr;
pub mod leaf;
pub mod ndarray;
pub mod partition;
pub mod prelude;
pub mod proxy;
pub mod reduce;
pub mod schunk;
pub mod slab;

const COORD_SMALLVEC_SIZE: usize = 6;

/// A small-vector-backed per-axis coordinate, avoiding a heap allocation
/// for the common case of arrays with at most 6 dimensions.
pub type CoordVec<T> = SmallVec<[T; COORD_SMALLVEC_SIZE]>;
pub type GridCoord = CoordVec<u64>;
