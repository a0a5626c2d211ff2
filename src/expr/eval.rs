//! Chunked expression evaluation.
//!
//! Three paths, chosen by a selection table: a fast path (all operands
//! aligned/behaved, no broadcasting, no `where`), a sliced path (regions
//! intersected chunk-by-chunk when operands disagree on partition), and a
//! reduction path (delegated to [`crate::reduce`]). All three share the same
//! scalar kernel walking an [`super::ast::Expr`] over a `HashMap<String,
//! Slab>` of per-step operand slabs.

use std::collections::HashMap;

use num_complex::Complex64;

use crate::error::{Error, Result};
use crate::slab::Slab;

use super::ast::{BinOp, Expr, UnaryOp};

/// Free functions allowed inside expression text, checked by the
/// validator and dispatched here.
pub const KERNEL_FUNCTIONS: &[&str] = &[
    "sin", "cos", "tan", "sqrt", "sinh", "cosh", "tanh", "arcsin", "arccos", "arctan", "arctan2",
    "arcsinh", "arccosh", "arctanh", "exp", "expm1", "log", "log10", "log1p", "conj", "real",
    "imag", "contains", "abs", "where",
];

/// Evaluate `expr` against a fully materialized per-operand slab map
/// (one call per chunk/region step on the fast/sliced paths).
pub fn eval(expr: &Expr, operands: &HashMap<String, Slab>) -> Result<Slab> {
    match expr {
        Expr::Num(n) => Ok(Slab::Float(ndarray::ArrayD::from_elem(
            ndarray::IxDyn(&[]),
            *n,
        ))),
        Expr::Var(name) => operands
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Unsupported(format!("unbound operand {name:?}"))),
        Expr::Unary(op, inner) => eval_unary(*op, &eval(inner, operands)?),
        Expr::Binary(op, l, r) => eval_binary(*op, &eval(l, operands)?, &eval(r, operands)?),
        Expr::Call(name, args) => eval_call(name, args, operands),
        Expr::MethodCall(recv, name, args) => eval_method(recv, name, args, operands),
    }
}

fn eval_unary(op: UnaryOp, v: &Slab) -> Result<Slab> {
    Ok(match op {
        UnaryOp::Neg => match v {
            Slab::Int(a) => Slab::Int(a.mapv(|x| -x)),
            Slab::Float(a) => Slab::Float(a.mapv(|x| -x)),
            Slab::Complex(a) => Slab::Complex(a.mapv(|x| -x)),
            Slab::Bool(a) => Slab::Int(a.mapv(|x| if x { -1 } else { 0 })),
        },
        UnaryOp::Not => match v {
            Slab::Bool(a) => Slab::Bool(a.mapv(|x| !x)),
            Slab::Int(a) => Slab::Int(a.mapv(|x| !x)),
            _ => return Err(Error::Unsupported("bitwise not on non-integer operand".into())),
        },
    })
}

fn eval_binary(op: BinOp, l: &Slab, r: &Slab) -> Result<Slab> {
    use BinOp::*;
    Ok(match op {
        Add => Slab::zip_numeric(l, r, |a, b| a + b, |a, b| a + b, |a, b| a + b)?,
        Sub => Slab::zip_numeric(l, r, |a, b| a - b, |a, b| a - b, |a, b| a - b)?,
        Mul => Slab::zip_numeric(l, r, |a, b| a * b, |a, b| a * b, |a, b| a * b)?,
        // True division always promotes to float, matching the reference
        // evaluator's `__truediv__`: `int / int` never truncates.
        Div => Slab::true_div(l, r)?,
        Mod => Slab::zip_numeric(
            l,
            r,
            |a, b| if b == 0 { 0 } else { a % b },
            |a, b| a % b,
            |a: Complex64, _b: Complex64| a,
        )?,
        Pow => Slab::Float(crate::slab::broadcast_map2_pub(&l.to_float(), &r.to_float(), f64::powf)?),
        BitAnd => match (l, r) {
            (Slab::Bool(_), Slab::Bool(_)) => Slab::map_bool(l, r, |a, b| a != 0.0 && b != 0.0)?,
            _ => Slab::zip_numeric(l, r, |a, b| a & b, |a, _b| a, |a, _b| a)?,
        },
        BitOr => match (l, r) {
            (Slab::Bool(_), Slab::Bool(_)) => Slab::map_bool(l, r, |a, b| a != 0.0 || b != 0.0)?,
            _ => Slab::zip_numeric(l, r, |a, b| a | b, |a, _b| a, |a, _b| a)?,
        },
        Lt => Slab::map_bool(l, r, |a, b| a < b)?,
        Le => Slab::map_bool(l, r, |a, b| a <= b)?,
        Gt => Slab::map_bool(l, r, |a, b| a > b)?,
        Ge => Slab::map_bool(l, r, |a, b| a >= b)?,
        Eq => Slab::map_bool(l, r, |a, b| a == b)?,
        Ne => Slab::map_bool(l, r, |a, b| a != b)?,
    })
}

fn eval_call(name: &str, args: &[Expr], operands: &HashMap<String, Slab>) -> Result<Slab> {
    if name == "where" {
        if args.len() != 3 {
            return Err(Error::Unsupported("where() takes exactly 3 arguments".into()));
        }
        let cond = eval(&args[0], operands)?;
        let x = eval(&args[1], operands)?;
        let y = eval(&args[2], operands)?;
        return eval_where(&cond, &x, &y);
    }
    if name == "arctan2" {
        if args.len() != 2 {
            return Err(Error::Unsupported("arctan2() takes exactly 2 arguments".into()));
        }
        let y = eval(&args[0], operands)?.to_float();
        let x = eval(&args[1], operands)?.to_float();
        return Ok(Slab::Float(crate::slab::broadcast_map2_pub(&y, &x, f64::atan2)?));
    }
    if name == "contains" {
        return Err(Error::Unsupported("contains() is only valid as a string-array predicate, not implemented for numeric slabs".into()));
    }
    if args.len() != 1 {
        return Err(Error::Unsupported(format!("{name}() takes exactly 1 argument")));
    }
    let v = eval(&args[0], operands)?;
    Ok(match name {
        "sin" => v.map_unary_float(f64::sin),
        "cos" => v.map_unary_float(f64::cos),
        "tan" => v.map_unary_float(f64::tan),
        "sqrt" => v.map_unary_float(f64::sqrt),
        "sinh" => v.map_unary_float(f64::sinh),
        "cosh" => v.map_unary_float(f64::cosh),
        "tanh" => v.map_unary_float(f64::tanh),
        "arcsin" => v.map_unary_float(f64::asin),
        "arccos" => v.map_unary_float(f64::acos),
        "arctan" => v.map_unary_float(f64::atan),
        "arcsinh" => v.map_unary_float(f64::asinh),
        "arccosh" => v.map_unary_float(f64::acosh),
        "arctanh" => v.map_unary_float(f64::atanh),
        "exp" => v.map_unary_float(f64::exp),
        "expm1" => v.map_unary_float(f64::exp_m1),
        "log" => v.map_unary_float(f64::ln),
        "log10" => v.map_unary_float(f64::log10),
        "log1p" => v.map_unary_float(f64::ln_1p),
        "abs" => match &v {
            Slab::Complex(a) => Slab::Float(a.mapv(|c| c.norm())),
            _ => v.map_unary_float(f64::abs),
        },
        "conj" => match v {
            Slab::Complex(a) => Slab::Complex(a.mapv(|c| c.conj())),
            other => other,
        },
        "real" => Slab::Float(v.to_complex().mapv(|c| c.re)),
        "imag" => Slab::Float(v.to_complex().mapv(|c| c.im)),
        other => return Err(Error::Unsupported(format!("unknown kernel function {other:?}"))),
    })
}

fn eval_method(
    recv: &Expr,
    name: &str,
    args: &[Expr],
    operands: &HashMap<String, Slab>,
) -> Result<Slab> {
    match name {
        "real" => eval_call("real", std::slice::from_ref(recv), operands),
        "imag" => eval_call("imag", std::slice::from_ref(recv), operands),
        "where" => {
            if args.len() != 2 {
                return Err(Error::Unsupported("where() takes exactly 2 arguments".into()));
            }
            let cond = eval(recv, operands)?;
            let x = eval(&args[0], operands)?;
            let y = eval(&args[1], operands)?;
            eval_where(&cond, &x, &y)
        }
        // sum/prod/min/max/std/mean/var/any/all are reduction terminals
        // : they only ever appear at the root of a `LazyExpr` and are
        // dispatched by `crate::reduce`, not by this scalar kernel.
        other => Err(Error::Unsupported(format!(
            "{other}() is a reduction and must be evaluated via reduce(), not the scalar kernel"
        ))),
    }
}

fn eval_where(cond: &Slab, x: &Slab, y: &Slab) -> Result<Slab> {
    let cond_bool = match cond {
        Slab::Bool(a) => a.clone(),
        other => other.to_float().mapv(|v| v != 0.0),
    };
    if x.is_complex() || y.is_complex() {
        let xc = x.to_complex();
        let yc = y.to_complex();
        let out = crate::slab::broadcast_map3_pub(&cond_bool, &xc, &yc, |c, a, b| if c { a } else { b })?;
        return Ok(Slab::Complex(out));
    }
    match (x, y) {
        (Slab::Int(a), Slab::Int(b)) => {
            Ok(Slab::Int(crate::slab::broadcast_map3_pub(&cond_bool, a, b, |c, a, b| if c { a } else { b })?))
        }
        (Slab::Bool(a), Slab::Bool(b)) => {
            Ok(Slab::Bool(crate::slab::broadcast_map3_pub(&cond_bool, a, b, |c, a, b| if c { a } else { b })?))
        }
        _ => {
            let xf = x.to_float();
            let yf = y.to_float();
            Ok(Slab::Float(crate::slab::broadcast_map3_pub(&cond_bool, &xf, &yf, |c, a, b| {
                if c {
                    a
                } else {
                    b
                }
            })?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ast::parse;
    use ndarray::{ArrayD, IxDyn};

    fn operand_map(pairs: &[(&str, Slab)]) -> HashMap<String, Slab> {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn evaluates_simple_arithmetic() {
        let e = parse("o0+o1*2").unwrap();
        let ops = operand_map(&[
            ("o0", Slab::Int(ArrayD::from_elem(IxDyn(&[2]), 3))),
            ("o1", Slab::Int(ArrayD::from_elem(IxDyn(&[2]), 4))),
        ]);
        let r = eval(&e, &ops).unwrap();
        match r {
            Slab::Float(a) => assert!(a.iter().all(|&v| v == 11.0)),
            other => panic!("unexpected result variant: {other:?}"),
        }
    }

    #[test]
    fn evaluates_where_with_int_branches() {
        let e = parse("where(o0>1,o0,o1)").unwrap();
        let ops = operand_map(&[
            ("o0", Slab::Int(ArrayD::from_shape_vec(IxDyn(&[3]), vec![0, 1, 2]).unwrap())),
            ("o1", Slab::Int(ArrayD::from_elem(IxDyn(&[3]), 9))),
        ]);
        let r = eval(&e, &ops).unwrap();
        match r {
            Slab::Int(a) => assert_eq!(a.iter().copied().collect::<Vec<_>>(), vec![9, 9, 2]),
            other => panic!("unexpected result variant: {other:?}"),
        }
    }

    #[test]
    fn evaluates_trig_function_call() {
        let e = parse("sqrt(o0)").unwrap();
        let ops = operand_map(&[("o0", Slab::Float(ArrayD::from_elem(IxDyn(&[1]), 4.0)))]);
        let r = eval(&e, &ops).unwrap();
        match r {
            Slab::Float(a) => assert!((a[ndarray::IxDyn(&[0])] - 2.0).abs() < 1e-12),
            other => panic!("unexpected result variant: {other:?}"),
        }
    }
}
