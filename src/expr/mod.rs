//! Lazy arithmetic expressions: a hand-rolled AST and
//! validator over a closed allow-list, a scalar kernel that walks the AST over per-chunk slabs, and
//! the `LazyExpr` builder that fuses operand maps by leaf identity.

pub mod ast;
pub mod driver;
pub mod eval;
pub mod lazy;
pub mod udf;
pub mod validator;

pub use driver::{compute, ComputeOptions, ComputeResult};
pub use lazy::LazyExpr;
pub use udf::LazyUDF;
