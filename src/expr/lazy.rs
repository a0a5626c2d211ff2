//! `LazyExpr`: a deferred arithmetic expression represented as a
//! text expression plus a dense, insertion-ordered operand map.
//!
//! Construction never rebuilds a parse tree by hand: every combinator below
//! parses its fragments' own text (already validated at the point it was
//! produced), merges operand maps by [`Leaf::identity`] dedup, and lets
//! [`super::ast::Expr`]'s `Display` impl re-serialize the canonical,
//! fully-parenthesized text. `remap_vars` does the heavy lifting for fusion,
//! rewriting every referenced operand name token by token.

use std::collections::HashMap;
use std::sync::Arc;

use num_complex::Complex64;

use crate::error::{Error, Result};
use crate::leaf::{ArrayLike, Leaf, Scalar};
use crate::ndarray::NDArray;

use super::ast::{self, BinOp, Expr, UnaryOp};
use super::validator::{self, ValidationError};

/// Anything that can appear on one side of an operator overload: another
/// deferred expression, a single leaf (array or scalar), or a bare number.
#[derive(Clone)]
pub enum Operand {
    Expr(LazyExpr),
    Leaf(Leaf),
    Num(f64),
}

impl From<NDArray> for Operand {
    fn from(a: NDArray) -> Self {
        Operand::Leaf(Leaf::Array(Arc::new(a)))
    }
}

impl From<&NDArray> for Operand {
    fn from(a: &NDArray) -> Self {
        Operand::Leaf(Leaf::Array(Arc::new(a.clone())))
    }
}

impl From<LazyExpr> for Operand {
    fn from(e: LazyExpr) -> Self {
        Operand::Expr(e)
    }
}

impl From<&LazyExpr> for Operand {
    fn from(e: &LazyExpr) -> Self {
        Operand::Expr(e.clone())
    }
}

impl From<f64> for Operand {
    fn from(n: f64) -> Self {
        Operand::Num(n)
    }
}

impl From<i64> for Operand {
    fn from(n: i64) -> Self {
        Operand::Num(n as f64)
    }
}

impl From<bool> for Operand {
    fn from(b: bool) -> Self {
        Operand::Leaf(Leaf::scalar(Scalar::Bool(b)))
    }
}

impl From<Complex64> for Operand {
    fn from(c: Complex64) -> Self {
        Operand::Leaf(Leaf::scalar(Scalar::Complex(c)))
    }
}

/// Anything that can be bound to `_where_x`/`_where_y`: a single
/// leaf, never a whole sub-expression — `where_args` binds bare operands,
/// not nested lazy expressions.
pub trait ToLeaf {
    fn to_leaf(self) -> Leaf;
}

impl ToLeaf for Leaf {
    fn to_leaf(self) -> Leaf {
        self
    }
}

impl ToLeaf for NDArray {
    fn to_leaf(self) -> Leaf {
        Leaf::Array(Arc::new(self))
    }
}

impl ToLeaf for &NDArray {
    fn to_leaf(self) -> Leaf {
        Leaf::Array(Arc::new(self.clone()))
    }
}

impl ToLeaf for f64 {
    fn to_leaf(self) -> Leaf {
        Leaf::scalar(Scalar::Float(self))
    }
}

impl ToLeaf for i64 {
    fn to_leaf(self) -> Leaf {
        Leaf::scalar(Scalar::Int(self))
    }
}

impl ToLeaf for bool {
    fn to_leaf(self) -> Leaf {
        Leaf::scalar(Scalar::Bool(self))
    }
}

impl ToLeaf for Complex64 {
    fn to_leaf(self) -> Leaf {
        Leaf::scalar(Scalar::Complex(self))
    }
}

/// A reduction terminal recovered from the root of a `LazyExpr`'s text
///: `sum`/`prod`/`min`/`max`/`any`/`all` are primitives; `mean`/
/// `std`/`var` are built atop `sum` by [`crate::reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
    Any,
    All,
    Mean,
    Std,
    Var,
}

impl ReduceOp {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sum" => Self::Sum,
            "prod" => Self::Prod,
            "min" => Self::Min,
            "max" => Self::Max,
            "any" => Self::Any,
            "all" => Self::All,
            "mean" => Self::Mean,
            "std" => Self::Std,
            "var" => Self::Var,
            _ => return None,
        })
    }
}

/// A reduction recovered from the outermost method call of a `LazyExpr`'s
/// text, with the inner expression `body` still to be evaluated chunk by
/// chunk before the op is applied.
#[derive(Debug, Clone)]
pub struct ReduceSpec {
    pub op: ReduceOp,
    pub axis: Option<usize>,
    pub keepdims: bool,
    pub ddof: usize,
    pub body: Expr,
}

fn kwarg(name: &str, value: f64) -> Expr {
    Expr::MethodCall(
        Box::new(Expr::Var("__kwarg__".to_string())),
        name.to_string(),
        vec![Expr::Num(value)],
    )
}

fn parse_kwargs(args: &[Expr]) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    for a in args {
        if let Expr::MethodCall(recv, name, vals) = a {
            if matches!(&**recv, Expr::Var(v) if v == "__kwarg__") {
                if let Some(Expr::Num(n)) = vals.first() {
                    out.insert(name.clone(), *n);
                }
            }
        }
    }
    out
}

struct Fragment {
    text: String,
    operands: Vec<(String, Leaf)>,
}

fn fragment_from_operand(op: Operand) -> Fragment {
    match op {
        Operand::Expr(e) => Fragment {
            text: e.text,
            operands: e.operands,
        },
        Operand::Leaf(leaf) => Fragment {
            text: "o0".to_string(),
            operands: vec![("o0".to_string(), leaf)],
        },
        Operand::Num(n) => Fragment {
            text: format!("{n}"),
            operands: Vec::new(),
        },
    }
}

/// Merge `other` into `base`, deduping by [`Leaf::identity`] ; returns the merged map and the name
/// substitution `other`'s own text must be rewritten through.
fn merge_operands(
    mut base: Vec<(String, Leaf)>,
    other: Vec<(String, Leaf)>,
) -> (Vec<(String, Leaf)>, HashMap<String, String>) {
    let mut remap = HashMap::new();
    for (name, leaf) in other {
        let existing = base
            .iter()
            .find(|(_, l)| l.identity() == leaf.identity())
            .map(|(n, _)| n.clone());
        if let Some(existing_name) = existing {
            remap.insert(name, existing_name);
        } else {
            let new_name = format!("o{}", base.len());
            remap.insert(name, new_name.clone());
            base.push((new_name, leaf));
        }
    }
    (base, remap)
}

fn parse_fragment(text: &str) -> Expr {
    ast::parse(text).expect("fragment text is always produced by this module and always parses")
}

/// A deferred arithmetic expression: an expression string
/// over canonical operand names plus the map those names resolve to.
#[derive(Clone)]
pub struct LazyExpr {
    text: String,
    operands: Vec<(String, Leaf)>,
    where_args: Option<(Leaf, Option<Leaf>)>,
    cached_shape: Option<Vec<u64>>,
    cached_dtype: Option<crate::dtype::DataType>,
}

impl LazyExpr {
    /// Wrap a single leaf (array or scalar) as a one-operand expression.
    pub fn from_operand(op: impl Into<Operand>) -> LazyExpr {
        let f = fragment_from_operand(op.into());
        LazyExpr {
            text: f.text,
            operands: f.operands,
            where_args: None,
            cached_shape: None,
            cached_dtype: None,
        }
    }

    /// Build from caller-authored text plus an explicit operand map,
    /// running the full two-stage validator before accepting it.
    /// Used for hand-written expressions and for reopening saved ones.
    pub fn from_text(
        text: impl Into<String>,
        operands: Vec<(String, Leaf)>,
        where_args: Option<(Leaf, Option<Leaf>)>,
    ) -> Result<LazyExpr> {
        let text = text.into();
        let names: std::collections::HashSet<String> =
            operands.iter().map(|(n, _)| n.clone()).collect();
        validator::validate(&text, &names)?;
        Ok(LazyExpr {
            text,
            operands,
            where_args,
            cached_shape: None,
            cached_dtype: None,
        })
    }

    pub fn expression(&self) -> &str {
        &self.text
    }

    pub fn operands(&self) -> &[(String, Leaf)] {
        &self.operands
    }

    pub fn operand_map(&self) -> HashMap<String, Leaf> {
        self.operands.iter().cloned().collect()
    }

    pub fn where_args(&self) -> Option<&(Leaf, Option<Leaf>)> {
        self.where_args.as_ref()
    }

    /// Cache a previously-inferred broadcast shape/dtype (set by the
    /// evaluator the first time it resolves them) to avoid recomputing on
    /// repeated `compute()` calls against the same expression value.
    pub fn with_cached_shape_dtype(
        mut self,
        shape: Vec<u64>,
        dtype: crate::dtype::DataType,
    ) -> LazyExpr {
        self.cached_shape = Some(shape);
        self.cached_dtype = Some(dtype);
        self
    }

    pub fn cached_shape(&self) -> Option<&[u64]> {
        self.cached_shape.as_deref()
    }

    pub fn cached_dtype(&self) -> Option<&crate::dtype::DataType> {
        self.cached_dtype.as_ref()
    }

    pub fn ast(&self) -> Result<Expr> {
        ast::parse(&self.text)
            .map_err(|e| Error::Validation(ValidationError::ForbiddenSyntax(e.to_string())))
    }

    /// Recover a reduction from the outermost node of the text, if
    /// the expression's root is one of the nine reduction method names.
    pub fn reduce_spec(&self) -> Result<Option<ReduceSpec>> {
        let ast = self.ast()?;
        if let Expr::MethodCall(recv, name, args) = &ast {
            if let Some(op) = ReduceOp::from_name(name) {
                let kwargs = parse_kwargs(args);
                return Ok(Some(ReduceSpec {
                    op,
                    axis: kwargs.get("axis").map(|&v| v as usize),
                    keepdims: kwargs.get("keepdims").map(|&v| v != 0.0).unwrap_or(false),
                    ddof: kwargs.get("ddof").map(|&v| v as usize).unwrap_or(0),
                    body: (**recv).clone(),
                }));
            }
        }
        Ok(None)
    }

    fn reduce_call(self, name: &str, axis: Option<usize>, keepdims: bool, ddof: Option<usize>) -> LazyExpr {
        let recv = parse_fragment(&self.text);
        let mut args = Vec::new();
        if let Some(a) = axis {
            args.push(kwarg("axis", a as f64));
        }
        if keepdims {
            args.push(kwarg("keepdims", 1.0));
        }
        if let Some(d) = ddof {
            args.push(kwarg("ddof", d as f64));
        }
        let combined = Expr::MethodCall(Box::new(recv), name.to_string(), args);
        LazyExpr {
            text: combined.to_string(),
            operands: self.operands,
            where_args: self.where_args,
            cached_shape: None,
            cached_dtype: None,
        }
    }

    pub fn sum(self, axis: Option<usize>, keepdims: bool) -> LazyExpr {
        self.reduce_call("sum", axis, keepdims, None)
    }

    pub fn prod(self, axis: Option<usize>, keepdims: bool) -> LazyExpr {
        self.reduce_call("prod", axis, keepdims, None)
    }

    pub fn min(self, axis: Option<usize>, keepdims: bool) -> LazyExpr {
        self.reduce_call("min", axis, keepdims, None)
    }

    pub fn max(self, axis: Option<usize>, keepdims: bool) -> LazyExpr {
        self.reduce_call("max", axis, keepdims, None)
    }

    pub fn any(self, axis: Option<usize>, keepdims: bool) -> LazyExpr {
        self.reduce_call("any", axis, keepdims, None)
    }

    pub fn all(self, axis: Option<usize>, keepdims: bool) -> LazyExpr {
        self.reduce_call("all", axis, keepdims, None)
    }

    pub fn mean(self, axis: Option<usize>, keepdims: bool) -> LazyExpr {
        self.reduce_call("mean", axis, keepdims, None)
    }

    pub fn std(self, axis: Option<usize>, keepdims: bool, ddof: usize) -> LazyExpr {
        self.reduce_call("std", axis, keepdims, Some(ddof))
    }

    pub fn var(self, axis: Option<usize>, keepdims: bool, ddof: usize) -> LazyExpr {
        self.reduce_call("var", axis, keepdims, Some(ddof))
    }

    /// Fuse a two-value `where(cond, x, y)` as a method call on the
    /// receiver expression: `cond.where(_where_x, _where_y)`, with
    /// `x`/`y` bound as a dedicated pair outside the regular operand map.
    pub fn where_(self, x: impl ToLeaf, y: impl ToLeaf) -> LazyExpr {
        let recv = parse_fragment(&self.text);
        let combined = Expr::MethodCall(
            Box::new(recv),
            "where".to_string(),
            vec![Expr::Var("_where_x".to_string()), Expr::Var("_where_y".to_string())],
        );
        LazyExpr {
            text: combined.to_string(),
            operands: self.operands,
            where_args: Some((x.to_leaf(), Some(y.to_leaf()))),
            cached_shape: None,
            cached_dtype: None,
        }
    }

    /// One-arg `where(cond, x)`: selects and flattens.
    pub fn where_one(self, x: impl ToLeaf) -> LazyExpr {
        let recv = parse_fragment(&self.text);
        let combined = Expr::MethodCall(
            Box::new(recv),
            "where".to_string(),
            vec![Expr::Var("_where_x".to_string())],
        );
        LazyExpr {
            text: combined.to_string(),
            operands: self.operands,
            where_args: Some((x.to_leaf(), None)),
            cached_shape: None,
            cached_dtype: None,
        }
    }

    fn combine_binary(op: BinOp, lhs: Operand, rhs: Operand) -> LazyExpr {
        let lf = fragment_from_operand(lhs);
        let rf = fragment_from_operand(rhs);
        let (merged, remap) = merge_operands(lf.operands, rf.operands);
        let l_ast = parse_fragment(&lf.text);
        let r_ast = parse_fragment(&rf.text).remap_vars(&remap);
        let combined = Expr::Binary(op, Box::new(l_ast), Box::new(r_ast));
        LazyExpr {
            text: combined.to_string(),
            operands: merged,
            where_args: None,
            cached_shape: None,
            cached_dtype: None,
        }
    }

    fn combine_unary(op: UnaryOp, operand: Operand) -> LazyExpr {
        let f = fragment_from_operand(operand);
        let ast_node = parse_fragment(&f.text);
        let combined = Expr::Unary(op, Box::new(ast_node));
        LazyExpr {
            text: combined.to_string(),
            operands: f.operands,
            where_args: None,
            cached_shape: None,
            cached_dtype: None,
        }
    }

    fn combine_call_n(name: &str, operands: Vec<Operand>) -> LazyExpr {
        let mut merged: Vec<(String, Leaf)> = Vec::new();
        let mut asts = Vec::with_capacity(operands.len());
        for op in operands {
            let f = fragment_from_operand(op);
            let (new_merged, remap) = merge_operands(merged, f.operands);
            merged = new_merged;
            asts.push(parse_fragment(&f.text).remap_vars(&remap));
        }
        let combined = Expr::Call(name.to_string(), asts);
        LazyExpr {
            text: combined.to_string(),
            operands: merged,
            where_args: None,
            cached_shape: None,
            cached_dtype: None,
        }
    }

    /// Persisted form: `{"expression", "UDF": null, "operands"}`.
    /// Operand *references* (how to re-resolve a saved `oK` back to a
    /// leaf) are opaque here — persistent container formats are out of
    /// scope — so the caller supplies them, keyed by operand name.
    pub fn to_vlmeta(&self, operand_refs: &HashMap<String, serde_json::Value>) -> serde_json::Value {
        let operands: serde_json::Map<String, serde_json::Value> = self
            .operands
            .iter()
            .map(|(name, _)| {
                (
                    name.clone(),
                    operand_refs.get(name).cloned().unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();
        serde_json::json!({
            "expression": self.text,
            "UDF": serde_json::Value::Null,
            "operands": operands,
        })
    }

    /// Reopen a `to_vlmeta`-shaped value, resolving each operand reference
    /// back to a [`Leaf`] via the caller-supplied `resolve` callback.
    pub fn from_vlmeta(
        meta: &serde_json::Value,
        resolve: impl Fn(&str, &serde_json::Value) -> Result<Leaf>,
    ) -> Result<LazyExpr> {
        if !meta.get("UDF").map(|v| v.is_null()).unwrap_or(true) {
            return Err(Error::Unsupported(
                "reopening a saved UDF expression is not supported".into(),
            ));
        }
        let text = meta
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Unsupported("missing expression in saved lazy array".into()))?
            .to_string();
        let operands_obj = meta
            .get("operands")
            .and_then(|v| v.as_object())
            .ok_or_else(|| Error::Unsupported("missing operands in saved lazy array".into()))?;
        let mut operands = Vec::with_capacity(operands_obj.len());
        for (name, reference) in operands_obj {
            operands.push((name.clone(), resolve(name, reference)?));
        }
        LazyExpr::from_text(text, operands, None)
    }
}

macro_rules! impl_binop {
    ($trait:ident, $method:ident, $binop:expr) => {
        impl std::ops::$trait<NDArray> for NDArray {
            type Output = LazyExpr;
            fn $method(self, rhs: NDArray) -> LazyExpr {
                LazyExpr::combine_binary($binop, Operand::from(self), Operand::from(rhs))
            }
        }
        impl std::ops::$trait<f64> for NDArray {
            type Output = LazyExpr;
            fn $method(self, rhs: f64) -> LazyExpr {
                LazyExpr::combine_binary($binop, Operand::from(self), Operand::Num(rhs))
            }
        }
        impl std::ops::$trait<LazyExpr> for NDArray {
            type Output = LazyExpr;
            fn $method(self, rhs: LazyExpr) -> LazyExpr {
                LazyExpr::combine_binary($binop, Operand::from(self), Operand::Expr(rhs))
            }
        }
        impl std::ops::$trait<NDArray> for LazyExpr {
            type Output = LazyExpr;
            fn $method(self, rhs: NDArray) -> LazyExpr {
                LazyExpr::combine_binary($binop, Operand::Expr(self), Operand::from(rhs))
            }
        }
        impl std::ops::$trait<f64> for LazyExpr {
            type Output = LazyExpr;
            fn $method(self, rhs: f64) -> LazyExpr {
                LazyExpr::combine_binary($binop, Operand::Expr(self), Operand::Num(rhs))
            }
        }
        impl std::ops::$trait<LazyExpr> for LazyExpr {
            type Output = LazyExpr;
            fn $method(self, rhs: LazyExpr) -> LazyExpr {
                LazyExpr::combine_binary($binop, Operand::Expr(self), Operand::Expr(rhs))
            }
        }
    };
}

impl_binop!(Add, add, BinOp::Add);
impl_binop!(Sub, sub, BinOp::Sub);
impl_binop!(Mul, mul, BinOp::Mul);
impl_binop!(Div, div, BinOp::Div);
impl_binop!(Rem, rem, BinOp::Mod);
impl_binop!(BitAnd, bitand, BinOp::BitAnd);
impl_binop!(BitOr, bitor, BinOp::BitOr);

impl std::ops::Neg for NDArray {
    type Output = LazyExpr;
    fn neg(self) -> LazyExpr {
        LazyExpr::combine_unary(UnaryOp::Neg, Operand::from(self))
    }
}

impl std::ops::Neg for LazyExpr {
    type Output = LazyExpr;
    fn neg(self) -> LazyExpr {
        LazyExpr::combine_unary(UnaryOp::Neg, Operand::Expr(self))
    }
}

impl std::ops::Not for NDArray {
    type Output = LazyExpr;
    fn not(self) -> LazyExpr {
        LazyExpr::combine_unary(UnaryOp::Not, Operand::from(self))
    }
}

impl std::ops::Not for LazyExpr {
    type Output = LazyExpr;
    fn not(self) -> LazyExpr {
        LazyExpr::combine_unary(UnaryOp::Not, Operand::Expr(self))
    }
}

/// Comparison operators build expressions rather than evaluating:
/// `PartialEq`/`PartialOrd` are reserved for Rust equality/ordering, so
/// these are plain named methods.
macro_rules! impl_cmp {
    ($name:ident, $binop:expr) => {
        impl NDArray {
            pub fn $name(self, rhs: impl Into<Operand>) -> LazyExpr {
                LazyExpr::combine_binary($binop, Operand::from(self), rhs.into())
            }
        }
        impl LazyExpr {
            pub fn $name(self, rhs: impl Into<Operand>) -> LazyExpr {
                LazyExpr::combine_binary($binop, Operand::Expr(self), rhs.into())
            }
        }
    };
}

impl_cmp!(lt, BinOp::Lt);
impl_cmp!(le, BinOp::Le);
impl_cmp!(gt, BinOp::Gt);
impl_cmp!(ge, BinOp::Ge);
impl_cmp!(eq, BinOp::Eq);
impl_cmp!(ne, BinOp::Ne);

macro_rules! unary_fn {
    ($name:ident, $text:expr) => {
        pub fn $name(x: impl Into<Operand>) -> LazyExpr {
            LazyExpr::combine_call_n($text, vec![x.into()])
        }
    };
}

unary_fn!(sin, "sin");
unary_fn!(cos, "cos");
unary_fn!(tan, "tan");
unary_fn!(sqrt, "sqrt");
unary_fn!(sinh, "sinh");
unary_fn!(cosh, "cosh");
unary_fn!(tanh, "tanh");
unary_fn!(arcsin, "arcsin");
unary_fn!(arccos, "arccos");
unary_fn!(arctan, "arctan");
unary_fn!(arcsinh, "arcsinh");
unary_fn!(arccosh, "arccosh");
unary_fn!(arctanh, "arctanh");
unary_fn!(exp, "exp");
unary_fn!(expm1, "expm1");
unary_fn!(log, "log");
unary_fn!(log10, "log10");
unary_fn!(log1p, "log1p");
unary_fn!(conj, "conj");
unary_fn!(real, "real");
unary_fn!(imag, "imag");
unary_fn!(abs, "abs");

pub fn arctan2(y: impl Into<Operand>, x: impl Into<Operand>) -> LazyExpr {
    LazyExpr::combine_call_n("arctan2", vec![y.into(), x.into()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CParams;
    use crate::dtype::Endian;
    use ndarray::{ArrayD, IxDyn};

    fn small_array(fill: f64) -> NDArray {
        let data = ArrayD::from_elem(IxDyn(&[4]), fill);
        NDArray::from_array(data, CParams::default(), None, None, Endian::Little).unwrap()
    }

    #[test]
    fn identity_of_fusion_matches_manual_text() {
        let a = small_array(1.0);
        let b = small_array(2.0);
        let e = a.clone() + b.clone();
        assert_eq!(e.expression(), "(o0+o1)");
        assert_eq!(e.operands().len(), 2);
    }

    #[test]
    fn operand_dedup_collapses_same_leaf() {
        let a = small_array(1.0);
        let e = a.clone() + a;
        assert_eq!(e.expression(), "(o0+o0)");
        assert_eq!(e.operands().len(), 1);
    }

    #[test]
    fn chained_overloads_reuse_shared_operand() {
        let a = small_array(1.0);
        let b = small_array(2.0);
        let c = small_array(3.0);
        let e = (a.clone() + b) * c - a;
        assert_eq!(e.operands().len(), 3);
    }

    #[test]
    fn reduce_spec_recovers_axis_kwarg() {
        let a = small_array(1.0);
        let e = LazyExpr::from_operand(a).sum(Some(0), false);
        let spec = e.reduce_spec().unwrap().unwrap();
        assert_eq!(spec.op, ReduceOp::Sum);
        assert_eq!(spec.axis, Some(0));
    }

    #[test]
    fn where_binds_dedicated_operands() {
        let a = small_array(1.0);
        let e = a.clone().gt(5.0).where_(a, 0.0);
        assert!(e.expression().contains(".where(_where_x,_where_y)"));
        assert!(e.where_args().is_some());
    }
}
