//! Reduction engine: `sum`/`prod`/`min`/`max`/`any`/`all`
//! primitives, each seeded with its identity element and combined as a
//! monoid over chunks, plus `mean`/`std`/`var` built as two passes atop
//! `sum`. A zero-valued chunk is skipped for `sum` without decompressing it.
//!
//! Scope: only single-axis or whole-array reduction is implemented, since
//! [`ReduceSpec::axis`] is `Option<usize>` rather than a set of axes — see
//! DESIGN.md.

use std::collections::HashMap;

use ndarray::{ArrayD, Axis, IxDyn};
use num_complex::Complex64;

use crate::error::{Error, Result};
use crate::expr::ast::Expr;
use crate::expr::driver::{self, ChunkPlan};
use crate::expr::eval;
use crate::expr::lazy::{ReduceOp, ReduceSpec};
use crate::leaf::Leaf;
use crate::ndarray::{NDArray, Region};
use crate::slab::Slab;

pub fn reduce(
    spec: &ReduceSpec,
    operands: &HashMap<String, Leaf>,
    where_args: Option<&(Leaf, Option<Leaf>)>,
    item_slice: Option<&Region>,
) -> Result<NDArray> {
    match spec.op {
        ReduceOp::Mean => reduce_mean(spec, operands, where_args, item_slice),
        ReduceOp::Std | ReduceOp::Var => reduce_std_var(spec, operands, where_args, item_slice),
        _ => {
            let (acc, _n) =
                reduce_primitive(spec.op, &spec.body, operands, where_args, item_slice, spec.axis)?;
            finish(acc, spec.keepdims, spec.axis)
        }
    }
}

fn empty_err(axis: Option<usize>) -> Error {
    Error::EmptyReduction {
        axis: axis.map(|a| vec![a]).unwrap_or_default(),
    }
}

fn reduced_shape_of(shape: &[u64], axis: Option<usize>) -> Vec<usize> {
    match axis {
        None => vec![],
        Some(ax) => shape
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != ax)
            .map(|(_, &s)| s as usize)
            .collect(),
    }
}

fn drop_axis_region(region: &Region, axis: Option<usize>) -> Region {
    match axis {
        None => Region(vec![]),
        Some(ax) => Region(
            region
                .0
                .iter()
                .enumerate()
                .filter(|&(i, _)| i != ax)
                .map(|(_, &r)| r)
                .collect(),
        ),
    }
}

fn bool_identity(op: ReduceOp) -> bool {
    matches!(op, ReduceOp::All)
}

fn bool_combine(op: ReduceOp) -> impl Fn(bool, bool) -> bool {
    move |a, b| match op {
        ReduceOp::All => a && b,
        _ => a || b,
    }
}

fn int_identity(op: ReduceOp) -> i64 {
    match op {
        ReduceOp::Sum => 0,
        ReduceOp::Prod => 1,
        ReduceOp::Min => i64::MAX,
        ReduceOp::Max => i64::MIN,
        _ => 0,
    }
}

fn int_combine(op: ReduceOp) -> impl Fn(i64, i64) -> i64 {
    move |a, b| match op {
        ReduceOp::Sum => a.wrapping_add(b),
        ReduceOp::Prod => a.wrapping_mul(b),
        ReduceOp::Min => a.min(b),
        ReduceOp::Max => a.max(b),
        _ => a,
    }
}

fn float_identity(op: ReduceOp) -> f64 {
    match op {
        ReduceOp::Sum => 0.0,
        ReduceOp::Prod => 1.0,
        ReduceOp::Min => f64::INFINITY,
        ReduceOp::Max => f64::NEG_INFINITY,
        _ => 0.0,
    }
}

fn float_combine(op: ReduceOp) -> impl Fn(f64, f64) -> f64 {
    move |a, b| match op {
        ReduceOp::Sum => a + b,
        ReduceOp::Prod => a * b,
        ReduceOp::Min => a.min(b),
        ReduceOp::Max => a.max(b),
        _ => a,
    }
}

fn complex_identity(op: ReduceOp) -> Result<Complex64> {
    match op {
        ReduceOp::Sum => Ok(Complex64::new(0.0, 0.0)),
        ReduceOp::Prod => Ok(Complex64::new(1.0, 0.0)),
        _ => Err(Error::Unsupported(format!(
            "{:?} is not defined for complex operands",
            op
        ))),
    }
}

fn complex_combine(op: ReduceOp) -> Result<impl Fn(Complex64, Complex64) -> Complex64> {
    match op {
        ReduceOp::Sum => Ok((move |a: Complex64, b: Complex64| a + b) as fn(_, _) -> _),
        ReduceOp::Prod => Ok((move |a: Complex64, b: Complex64| a * b) as fn(_, _) -> _),
        _ => Err(Error::Unsupported(format!(
            "{:?} is not defined for complex operands",
            op
        ))),
    }
}

fn fold_array<T: Clone>(a: &ArrayD<T>, axis: Option<usize>, init: T, combine: impl Fn(T, T) -> T) -> ArrayD<T> {
    match axis {
        None => {
            let v = a.iter().cloned().fold(init, &combine);
            ArrayD::from_elem(IxDyn(&[]), v)
        }
        Some(ax) => a.fold_axis(Axis(ax), init, |acc, x| combine(acc.clone(), x.clone())),
    }
}

/// Coerce to bool and fold.
fn fold_slab(s: &Slab, axis: Option<usize>, op: ReduceOp) -> Result<Slab> {
    if matches!(op, ReduceOp::Any | ReduceOp::All) {
        let b = s.to_bool();
        return Ok(Slab::Bool(fold_array(&b, axis, bool_identity(op), bool_combine(op))));
    }
    Ok(match s {
        Slab::Bool(a) => Slab::Bool(fold_array(a, axis, bool_identity(op), bool_combine(op))),
        Slab::Int(a) => Slab::Int(fold_array(a, axis, int_identity(op), int_combine(op))),
        Slab::Float(a) => Slab::Float(fold_array(a, axis, float_identity(op), float_combine(op))),
        Slab::Complex(a) => {
            let id = complex_identity(op)?;
            let f = complex_combine(op)?;
            Slab::Complex(fold_array(a, axis, id, f))
        }
    })
}

fn identity_slab(op: ReduceOp, sample: &Slab, shape: &[usize]) -> Result<Slab> {
    Ok(match sample {
        Slab::Bool(_) => Slab::Bool(ArrayD::from_elem(IxDyn(shape), bool_identity(op))),
        Slab::Int(_) => Slab::Int(ArrayD::from_elem(IxDyn(shape), int_identity(op))),
        Slab::Float(_) => Slab::Float(ArrayD::from_elem(IxDyn(shape), float_identity(op))),
        Slab::Complex(_) => Slab::Complex(ArrayD::from_elem(IxDyn(shape), complex_identity(op)?)),
    })
}

fn combine_region<T: Clone>(dst: &mut ArrayD<T>, offset: &[usize], src: &ArrayD<T>, combine: impl Fn(T, T) -> T) {
    let mut view = dst.slice_each_axis_mut(|ax| {
        let i = ax.axis.index();
        let start = offset.get(i).copied().unwrap_or(0);
        let len = src.shape().get(i).copied().unwrap_or(1);
        ndarray::SliceInfoElem::Slice {
            start: start as isize,
            end: Some((start + len) as isize),
            step: 1,
        }
    });
    ndarray::Zip::from(&mut view)
        .and(src)
        .for_each(|d, s| *d = combine(d.clone(), s.clone()));
}

fn combine_into(acc: &mut Slab, offset: &[usize], src: &Slab, op: ReduceOp) -> Result<()> {
    match (acc, src) {
        (Slab::Bool(a), Slab::Bool(b)) => combine_region(a, offset, b, bool_combine(op)),
        (Slab::Int(a), Slab::Int(b)) => combine_region(a, offset, b, int_combine(op)),
        (Slab::Float(a), Slab::Float(b)) => combine_region(a, offset, b, float_combine(op)),
        (Slab::Complex(a), Slab::Complex(b)) => combine_region(a, offset, b, complex_combine(op)?),
        _ => return Err(Error::InvalidShape("reduction dtype mismatch across chunks".into())),
    }
    Ok(())
}

/// Walk every chunk of the broadcast geometry, folding each chunk's result
/// along `axis` and combining the fold into a dense accumulator pre-seeded
/// with `op`'s identity value (so first-touch and already-written cells
/// need no separate bookkeeping: `combine(identity, x) == x`).
fn reduce_primitive(
    op: ReduceOp,
    body: &Expr,
    operands: &HashMap<String, Leaf>,
    where_args: Option<&(Leaf, Option<Leaf>)>,
    item_slice: Option<&Region>,
    axis: Option<usize>,
) -> Result<(Slab, u64)> {
    let plan = driver::plan_geometry(operands, where_args, None)?;
    if plan.shape.iter().any(|&s| s == 0) {
        return Err(empty_err(axis));
    }
    let reduced_shape = reduced_shape_of(&plan.shape, axis);
    let mut acc: Option<Slab> = None;
    let mut n_elems: u64 = 0;

    for nchunk in 0..plan.n {
        let (slabs, base_region) = driver::chunk_slab_map(operands, where_args, &plan, nchunk)?;
        if let Some(item) = item_slice {
            if base_region.intersect(item).is_none() {
                continue;
            }
        }
        let full = eval::eval(body, &slabs)?;
        if op == ReduceOp::Sum && full.is_zero_scalar() {
            continue;
        }
        let partial = fold_slab(&full, axis, op)?;
        let chunk_n: u64 = match axis {
            Some(ax) => base_region.shape().get(ax).copied().unwrap_or(1),
            None => base_region.shape().iter().product(),
        };
        n_elems += chunk_n;

        let out_region = drop_axis_region(&base_region, axis);
        let offset: Vec<usize> = out_region.0.iter().map(|&(s, _)| s as usize).collect();
        match acc.as_mut() {
            None => {
                let mut a = identity_slab(op, &partial, &reduced_shape)?;
                combine_into(&mut a, &offset, &partial, op)?;
                acc = Some(a);
            }
            Some(a) => combine_into(a, &offset, &partial, op)?,
        }
    }
    let acc = acc.ok_or_else(|| empty_err(axis))?;
    Ok((acc, n_elems))
}

fn insert_axis(s: Slab, axis: Option<usize>) -> Slab {
    let Some(ax) = axis else { return s };
    match s {
        Slab::Bool(a) => Slab::Bool(a.insert_axis(Axis(ax))),
        Slab::Int(a) => Slab::Int(a.insert_axis(Axis(ax))),
        Slab::Float(a) => Slab::Float(a.insert_axis(Axis(ax))),
        Slab::Complex(a) => Slab::Complex(a.insert_axis(Axis(ax))),
    }
}

fn finish(acc: Slab, keepdims: bool, axis: Option<usize>) -> Result<NDArray> {
    let acc = if keepdims { insert_axis(acc, axis) } else { acc };
    NDArray::from_slab(
        acc,
        crate::config::CParams::default(),
        None,
        None,
        crate::dtype::Endian::Little,
    )
}

fn reduce_mean(
    spec: &ReduceSpec,
    operands: &HashMap<String, Leaf>,
    where_args: Option<&(Leaf, Option<Leaf>)>,
    item_slice: Option<&Region>,
) -> Result<NDArray> {
    let (sum_acc, n) =
        reduce_primitive(ReduceOp::Sum, &spec.body, operands, where_args, item_slice, spec.axis)?;
    if n == 0 {
        return Err(empty_err(spec.axis));
    }
    let mean = sum_acc.map_unary_float(|v| v / n as f64);
    finish(mean, spec.keepdims, spec.axis)
}

/// `std`/`var(ddof)`: a first pass computes the mean via `sum`, then a
/// second pass sums squared deviations from that mean, broadcasting each
/// chunk's slice of the (already reduced) mean back against the chunk's own
/// shape along the reduced axis.
fn reduce_std_var(
    spec: &ReduceSpec,
    operands: &HashMap<String, Leaf>,
    where_args: Option<&(Leaf, Option<Leaf>)>,
    item_slice: Option<&Region>,
) -> Result<NDArray> {
    let (sum_acc, n) =
        reduce_primitive(ReduceOp::Sum, &spec.body, operands, where_args, item_slice, spec.axis)?;
    if n as i64 <= spec.ddof as i64 {
        return Err(empty_err(spec.axis));
    }
    let mean = sum_acc.to_float();

    let plan = driver::plan_geometry(operands, where_args, None)?;
    let reduced_shape = reduced_shape_of(&plan.shape, spec.axis);
    let mut acc: Option<ArrayD<f64>> = None;

    for nchunk in 0..plan.n {
        let (slabs, base_region) = driver::chunk_slab_map(operands, where_args, &plan, nchunk)?;
        if let Some(item) = item_slice {
            if base_region.intersect(item).is_none() {
                continue;
            }
        }
        let full = eval::eval(&spec.body, &slabs)?.to_float();
        let mean_chunk = broadcast_mean_to_chunk(&mean, &base_region, spec.axis);
        let dev2 = crate::slab::broadcast_map2_pub(&full, &mean_chunk, |a, b| (a - b) * (a - b))?;
        let partial = fold_array(&dev2, spec.axis, 0.0, |a, b| a + b);

        let out_region = drop_axis_region(&base_region, spec.axis);
        let offset: Vec<usize> = out_region.0.iter().map(|&(s, _)| s as usize).collect();
        match acc.as_mut() {
            None => {
                let mut a = ArrayD::from_elem(IxDyn(&reduced_shape), 0.0);
                combine_region(&mut a, &offset, &partial, |a, b| a + b);
                acc = Some(a);
            }
            Some(a) => combine_region(a, &offset, &partial, |a, b| a + b),
        }
    }
    let sq_sum = acc.ok_or_else(|| empty_err(spec.axis))?;
    let ddof = spec.ddof as f64;
    let var = sq_sum.mapv(|v| v / (n as f64 - ddof));
    let result = if spec.op == ReduceOp::Std {
        var.mapv(f64::sqrt)
    } else {
        var
    };
    finish(Slab::Float(result), spec.keepdims, spec.axis)
}

/// Slice the whole-array `mean` (already missing `axis`) down to the
/// non-reduced extent this chunk covers, then reinsert a length-1 `axis` so
/// it broadcasts elementwise against the chunk's own full shape.
fn broadcast_mean_to_chunk(mean: &ArrayD<f64>, base_region: &Region, axis: Option<usize>) -> ArrayD<f64> {
    let out_region = drop_axis_region(base_region, axis);
    let offset: Vec<usize> = out_region.0.iter().map(|&(s, _)| s as usize).collect();
    let shape: Vec<usize> = out_region.shape().iter().map(|&s| s as usize).collect();
    let view = mean
        .slice_each_axis(|ax| {
            let i = ax.axis.index();
            let start = offset.get(i).copied().unwrap_or(0);
            let len = shape.get(i).copied().unwrap_or(1);
            ndarray::SliceInfoElem::Slice {
                start: start as isize,
                end: Some((start + len) as isize),
                step: 1,
            }
        })
        .to_owned();
    match axis {
        Some(ax) => view.insert_axis(Axis(ax)),
        None => view,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::collections::HashMap;

    use ndarray::{ArrayD, IxDyn};

    use super::*;
    use crate::config::CParams;
    use crate::dtype::Endian;
    use crate::expr::lazy::LazyExpr;

    fn array_leaf(shape: &[usize], values: Vec<f64>) -> Leaf {
        let data = ArrayD::<f64>::from_shape_vec(IxDyn(shape), values).unwrap();
        let shape_u64: Vec<u64> = shape.iter().map(|&s| s as u64).collect();
        let arr = NDArray::from_array(
            data,
            CParams::default(),
            Some(&shape_u64),
            Some(&shape_u64),
            Endian::Little,
        )
        .unwrap();
        Leaf::Array(Arc::new(arr))
    }

    #[test]
    fn sum_over_all_axes_matches_total() {
        let leaf = array_leaf(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let expr = LazyExpr::from_operand(leaf).sum(None, false);
        let spec = expr.reduce_spec().unwrap().unwrap();
        let operands: HashMap<String, Leaf> = expr.operand_map();
        let out = reduce(&spec, &operands, None, None).unwrap();
        let region = Region::full(out.shape());
        let back = out.read_region_typed::<f64>(&region).unwrap();
        assert_eq!(back[IxDyn(&[])], 21.0);
    }

    #[test]
    fn sum_over_axis_reduces_one_dimension() {
        let leaf = array_leaf(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let expr = LazyExpr::from_operand(leaf).sum(Some(0), false);
        let spec = expr.reduce_spec().unwrap().unwrap();
        let operands: HashMap<String, Leaf> = expr.operand_map();
        let out = reduce(&spec, &operands, None, None).unwrap();
        assert_eq!(out.shape(), &[3]);
        let region = Region::full(out.shape());
        let back = out.read_region_typed::<f64>(&region).unwrap();
        assert_eq!(back.iter().cloned().collect::<Vec<_>>(), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn mean_matches_sum_divided_by_count() {
        let leaf = array_leaf(&[4], vec![2.0, 4.0, 6.0, 8.0]);
        let expr = LazyExpr::from_operand(leaf).mean(None, false);
        let spec = expr.reduce_spec().unwrap().unwrap();
        let operands: HashMap<String, Leaf> = expr.operand_map();
        let out = reduce(&spec, &operands, None, None).unwrap();
        let region = Region::full(out.shape());
        let back = out.read_region_typed::<f64>(&region).unwrap();
        assert_eq!(back[IxDyn(&[])], 5.0);
    }

    #[test]
    fn empty_shape_min_is_an_error() {
        let leaf = array_leaf(&[0], vec![]);
        let expr = LazyExpr::from_operand(leaf).max(None, false);
        let spec = expr.reduce_spec().unwrap().unwrap();
        let operands: HashMap<String, Leaf> = expr.operand_map();
        assert!(reduce(&spec, &operands, None, None).is_err());
    }
}
