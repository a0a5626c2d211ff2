//! Dynamic leaf types: `NDArray`, a remote
//! array, a structured-field view, or a bare scalar, behind one small
//! object-safe trait so the evaluator doesn't care which it's holding.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::chunk::SpecialValue;
use crate::dtype::DataType;
use crate::error::Result;
use crate::ndarray::{NDArray, Region};
use crate::slab::Slab;

/// A bare scalar operand, inlined literally into expression text at
/// construction time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(num_complex::Complex64),
}

impl Scalar {
    pub fn to_slab(self) -> Slab {
        use ndarray::{ArrayD, IxDyn};
        match self {
            Self::Bool(b) => Slab::Bool(ArrayD::from_elem(IxDyn(&[]), b)),
            Self::Int(i) => Slab::Int(ArrayD::from_elem(IxDyn(&[]), i)),
            Self::Float(f) => Slab::Float(ArrayD::from_elem(IxDyn(&[]), f)),
            Self::Complex(c) => Slab::Complex(ArrayD::from_elem(IxDyn(&[]), c)),
        }
    }
}

/// A remote, HTTP-accessed array. Implementors provide whole compressed
/// chunks; decompression/assembly is handled generically.
pub trait RemoteArray: Send + Sync {
    fn shape(&self) -> Vec<u64>;
    fn dtype(&self) -> DataType;
    fn chunks(&self) -> Vec<u64>;
    fn blocks(&self) -> Vec<u64>;
    fn get_chunk(&self, nchunk: usize) -> Result<Vec<u8>>;
}

/// Common surface every dynamic leaf exposes to the evaluator.
pub trait ArrayLike: Send + Sync {
    fn shape(&self) -> Vec<u64>;
    fn dtype(&self) -> DataType;
    /// `None` for leaves with no natural chunk geometry (e.g. a bare
    /// in-memory buffer never wrapped in an `NDArray`).
    fn chunks(&self) -> Option<Vec<u64>>;
    fn blocks(&self) -> Option<Vec<u64>>;
    fn chunk_count(&self) -> usize;
    fn chunk_special(&self, nchunk: usize) -> Result<SpecialValue>;
    fn chunk_slab(&self, nchunk: usize) -> Result<Slab>;
    fn region_slab(&self, region: &Region) -> Result<Slab>;
}

impl ArrayLike for NDArray {
    fn shape(&self) -> Vec<u64> {
        NDArray::shape(self).to_vec()
    }

    fn dtype(&self) -> DataType {
        NDArray::dtype(self).clone()
    }

    fn chunks(&self) -> Option<Vec<u64>> {
        Some(NDArray::chunks(self).to_vec())
    }

    fn blocks(&self) -> Option<Vec<u64>> {
        Some(NDArray::blocks(self).to_vec())
    }

    fn chunk_count(&self) -> usize {
        self.chunk_counts().1
    }

    fn chunk_special(&self, nchunk: usize) -> Result<SpecialValue> {
        NDArray::chunk_special(self, nchunk)
    }

    fn chunk_slab(&self, nchunk: usize) -> Result<Slab> {
        self.decompress_chunk_dyn(nchunk)
    }

    fn region_slab(&self, region: &Region) -> Result<Slab> {
        self.read_region_dyn(region)
    }
}

/// A single named field of a structured (`Raw`) record, narrowing
/// materialization to that field's byte range within each chunk.
pub struct FieldView {
    pub base: Arc<dyn ArrayLike>,
    pub field_name: String,
}

impl ArrayLike for FieldView {
    fn shape(&self) -> Vec<u64> {
        self.base.shape()
    }

    fn dtype(&self) -> DataType {
        self.base
            .dtype()
            .field(&self.field_name)
            .map(|f| (*f.dtype).clone())
            .unwrap_or(DataType::Bool)
    }

    fn chunks(&self) -> Option<Vec<u64>> {
        self.base.chunks()
    }

    fn blocks(&self) -> Option<Vec<u64>> {
        self.base.blocks()
    }

    fn chunk_count(&self) -> usize {
        self.base.chunk_count()
    }

    fn chunk_special(&self, nchunk: usize) -> Result<SpecialValue> {
        self.base.chunk_special(nchunk)
    }

    fn chunk_slab(&self, nchunk: usize) -> Result<Slab> {
        // Whole-chunk materialization; only the returned slab narrows to
        // the field.
        self.base.chunk_slab(nchunk)
    }

    fn region_slab(&self, region: &Region) -> Result<Slab> {
        self.base.region_slab(region)
    }
}

/// An expression operand: either a dynamic array-like leaf, or a bare
/// scalar recognized before dispatch. A scalar carries a token minted
/// fresh at construction (see [`Leaf::scalar`]), not derived from its
/// value, so identity never depends on value equality.
#[derive(Clone)]
pub enum Leaf {
    Array(Arc<dyn ArrayLike>),
    Scalar(Scalar, u64),
}

static NEXT_SCALAR_ID: AtomicU64 = AtomicU64::new(0);

impl Leaf {
    /// Build a scalar leaf, minting it a fresh process-wide identity
    /// token. Two calls with the same `Scalar` value still produce
    /// distinct, non-deduplicating leaves.
    pub fn scalar(s: Scalar) -> Leaf {
        Leaf::Scalar(s, NEXT_SCALAR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn shape(&self) -> Option<Vec<u64>> {
        match self {
            Self::Array(a) => Some(a.shape()),
            Self::Scalar(..) => None,
        }
    }

    pub fn dtype(&self) -> Option<DataType> {
        match self {
            Self::Array(a) => Some(a.dtype()),
            Self::Scalar(..) => None,
        }
    }

    pub fn chunks(&self) -> Option<Vec<u64>> {
        match self {
            Self::Array(a) => a.chunks(),
            Self::Scalar(..) => None,
        }
    }

    pub fn blocks(&self) -> Option<Vec<u64>> {
        match self {
            Self::Array(a) => a.blocks(),
            Self::Scalar(..) => None,
        }
    }

    /// Identity token used for operand-map dedup: two leaves referring to
    /// the same underlying array share an identity even across separate
    /// `Leaf` values (same `Arc` pointer), while two distinct scalars with
    /// the same value never do (each mints its own counter token).
    pub fn identity(&self) -> LeafId {
        match self {
            Self::Array(a) => LeafId::Pointer(Arc::as_ptr(a) as *const () as usize),
            Self::Scalar(_, id) => LeafId::ScalarToken(*id),
        }
    }
}

/// A stable identity token for a leaf, used instead of `PartialEq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeafId {
    Pointer(usize),
    ScalarToken(u64),
}
