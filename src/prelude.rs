//! Convenience re-exports for downstream crates: the common types needed to
//! build arrays, expressions, and reductions without spelling out every
//! module path.

pub use crate::config::{CParams, Clevel, Compressor, DParams, Filter};
pub use crate::dtype::{DataType, Endian, ReflectedType};
pub use crate::error::{Error, Result};
pub use crate::expr::{compute, ComputeOptions, ComputeResult, LazyExpr, LazyUDF};
pub use crate::leaf::{ArrayLike, Leaf, RemoteArray, Scalar};
pub use crate::ndarray::{NDArray, Region};
pub use crate::proxy::{Proxy, ProxyField, ProxySource};
pub use crate::slab::Slab;

pub use ndarray;
pub use num_complex;
