//! In-flight evaluation buffers.
//!
//! The scalar-expression kernel operates over a coarsened numeric domain —
//! `bool`, a widened 64-bit integer, a 64-bit float, and a complex number —
//! rather than over every dtype `NDArray` can store on disk. This mirrors
//! how `DataType` stays opaque except for a short list of special cases:
//! arithmetic genuinely only needs to distinguish these four kinds.
//! Decoded once per chunk via [`crate::ndarray::NDArray::read_region_dyn`],
//! each dtype's native width round-trips exactly through its widened kind.

use ndarray::{ArrayD, IxDyn};
use num_complex::Complex64;

use crate::dtype::DataType;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub enum Slab {
    Bool(ArrayD<bool>),
    Int(ArrayD<i64>),
    Float(ArrayD<f64>),
    Complex(ArrayD<Complex64>),
}

impl Slab {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Self::Bool(a) => a.shape().to_vec(),
            Self::Int(a) => a.shape().to_vec(),
            Self::Float(a) => a.shape().to_vec(),
            Self::Complex(a) => a.shape().to_vec(),
        }
    }

    pub fn scalar_zero(dtype: &DataType) -> Self {
        match dtype {
            DataType::Bool => Self::Bool(ArrayD::from_elem(IxDyn(&[]), false)),
            DataType::Int(_) | DataType::UInt(_) => Self::Int(ArrayD::from_elem(IxDyn(&[]), 0)),
            DataType::Float(_) => Self::Float(ArrayD::from_elem(IxDyn(&[]), 0.0)),
            DataType::Complex(_) => {
                Self::Complex(ArrayD::from_elem(IxDyn(&[]), Complex64::new(0.0, 0.0)))
            }
            DataType::Raw { .. } => Self::Int(ArrayD::from_elem(IxDyn(&[]), 0)),
        }
    }

    /// Promote to a dense float array (bool -> 0/1, complex -> real part).
    pub fn to_float(&self) -> ArrayD<f64> {
        match self {
            Self::Bool(a) => a.mapv(|b| if b { 1.0 } else { 0.0 }),
            Self::Int(a) => a.mapv(|v| v as f64),
            Self::Float(a) => a.clone(),
            Self::Complex(a) => a.mapv(|c| c.re),
        }
    }

    pub fn to_complex(&self) -> ArrayD<Complex64> {
        match self {
            Self::Bool(a) => a.mapv(|b| Complex64::new(if b { 1.0 } else { 0.0 }, 0.0)),
            Self::Int(a) => a.mapv(|v| Complex64::new(v as f64, 0.0)),
            Self::Float(a) => a.mapv(|v| Complex64::new(v, 0.0)),
            Self::Complex(a) => a.clone(),
        }
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, Self::Complex(_))
    }

    /// Coerce to a dense boolean mask (nonzero test, same rule `where`'s
    /// condition uses).
    pub fn to_bool(&self) -> ArrayD<bool> {
        match self {
            Self::Bool(a) => a.clone(),
            other => other.to_float().mapv(|v| v != 0.0),
        }
    }

    /// Promote to a dense i64 array (bool -> 0/1, float truncates, complex
    /// -> real part truncated). Used by dtype-narrowing on write-back.
    pub fn to_int(&self) -> ArrayD<i64> {
        match self {
            Self::Bool(a) => a.mapv(|b| b as i64),
            Self::Int(a) => a.clone(),
            Self::Float(a) => a.mapv(|v| v as i64),
            Self::Complex(a) => a.mapv(|c| c.re as i64),
        }
    }

    pub fn is_zero_scalar(&self) -> bool {
        self.shape().iter().product::<usize>() == 1
            && match self {
                Self::Bool(a) => !a.iter().any(|&v| v),
                Self::Int(a) => a.iter().all(|&v| v == 0),
                Self::Float(a) => a.iter().all(|&v| v == 0.0),
                Self::Complex(a) => a.iter().all(|&v| v == Complex64::new(0.0, 0.0)),
            }
    }

    /// Elementwise binary numeric op with broadcasting, promoting to
    /// complex only if either operand is complex, else to float.
    pub fn zip_numeric(
        a: &Slab,
        b: &Slab,
        int_op: impl Fn(i64, i64) -> i64,
        float_op: impl Fn(f64, f64) -> f64,
        complex_op: impl Fn(Complex64, Complex64) -> Complex64,
    ) -> Result<Slab> {
        if let (Slab::Int(x), Slab::Int(y)) = (a, b) {
            return broadcast_map2(x, y, int_op).map(Slab::Int);
        }
        if a.is_complex() || b.is_complex() {
            return broadcast_map2(&a.to_complex(), &b.to_complex(), complex_op).map(Slab::Complex);
        }
        broadcast_map2(&a.to_float(), &b.to_float(), float_op).map(Slab::Float)
    }

    /// True division (`/`): always promotes to float (or complex if either
    /// side is complex), even for two integer operands, matching the
    /// reference evaluator's `__truediv__` — int/int division is never
    /// truncated and never needs a divide-by-zero guard, since float
    /// division by zero yields `inf`/`nan` rather than panicking.
    pub fn true_div(a: &Slab, b: &Slab) -> Result<Slab> {
        if a.is_complex() || b.is_complex() {
            return broadcast_map2(&a.to_complex(), &b.to_complex(), |x, y| x / y).map(Slab::Complex);
        }
        broadcast_map2(&a.to_float(), &b.to_float(), |x, y| x / y).map(Slab::Float)
    }

    pub fn map_bool(a: &Slab, b: &Slab, op: impl Fn(f64, f64) -> bool) -> Result<Slab> {
        broadcast_map2(&a.to_float(), &b.to_float(), op).map(Slab::Bool)
    }

    pub fn map_unary_float(&self, op: impl Fn(f64) -> f64) -> Slab {
        Slab::Float(self.to_float().mapv(op))
    }

    /// A zero-filled buffer of `shape`, same variant as `self`.
    pub fn zeros_like_kind(&self, shape: &[usize]) -> Slab {
        match self {
            Self::Bool(_) => Self::Bool(ArrayD::from_elem(IxDyn(shape), false)),
            Self::Int(_) => Self::Int(ArrayD::from_elem(IxDyn(shape), 0)),
            Self::Float(_) => Self::Float(ArrayD::from_elem(IxDyn(shape), 0.0)),
            Self::Complex(_) => Self::Complex(ArrayD::from_elem(IxDyn(shape), Complex64::new(0.0, 0.0))),
        }
    }

    /// A dense sub-view of `self` starting at `offset` with extent `shape`.
    pub fn subslice(&self, offset: &[usize], shape: &[usize]) -> Slab {
        fn sub<T: Clone>(a: &ArrayD<T>, offset: &[usize], shape: &[usize]) -> ArrayD<T> {
            let view = a.slice_each_axis(|ax| {
                let i = ax.axis.index();
                let start = offset.get(i).copied().unwrap_or(0);
                let len = shape.get(i).copied().unwrap_or(1);
                ndarray::SliceInfoElem::Slice {
                    start: start as isize,
                    end: Some((start + len) as isize),
                    step: 1,
                }
            });
            view.to_owned()
        }
        match self {
            Self::Bool(a) => Self::Bool(sub(a, offset, shape)),
            Self::Int(a) => Self::Int(sub(a, offset, shape)),
            Self::Float(a) => Self::Float(sub(a, offset, shape)),
            Self::Complex(a) => Self::Complex(sub(a, offset, shape)),
        }
    }

    /// Overwrite the subregion of `self` starting at `offset` with `src`,
    /// in place.
    pub fn assign_subregion(&mut self, offset: &[usize], src: &Slab) -> Result<()> {
        match (self, src) {
            (Self::Bool(a), Self::Bool(b)) => assign_into(a, offset, b),
            (Self::Int(a), Self::Int(b)) => assign_into(a, offset, b),
            (Self::Float(a), Self::Float(b)) => assign_into(a, offset, b),
            (Self::Complex(a), Self::Complex(b)) => assign_into(a, offset, b),
            _ => return Err(Error::InvalidShape("slab dtype mismatch on assignment".into())),
        }
        Ok(())
    }
}

/// Select the elements of `x` where a broadcast-compatible `cond` is true,
/// flattened to 1-D (the one-argument `array.method.where(x)` form).
pub fn select_where_flat(cond: &ArrayD<bool>, x: &Slab) -> Result<Slab> {
    fn select<T: Clone>(cond: &ArrayD<bool>, a: &ArrayD<T>) -> Result<ArrayD<T>> {
        let out_shape = broadcast_shape(cond.shape(), a.shape())?;
        let c = cond
            .broadcast(IxDyn(&out_shape))
            .ok_or_else(|| Error::InvalidShape("cannot broadcast where() condition".into()))?;
        let v = a
            .broadcast(IxDyn(&out_shape))
            .ok_or_else(|| Error::InvalidShape("cannot broadcast where() operand".into()))?;
        let out: Vec<T> = c
            .iter()
            .zip(v.iter())
            .filter(|&(&keep, _)| keep)
            .map(|(_, val)| val.clone())
            .collect();
        let n = out.len();
        Ok(ArrayD::from_shape_vec(IxDyn(&[n]), out).expect("filtered vec matches its own length"))
    }
    Ok(match x {
        Slab::Bool(a) => Slab::Bool(select(cond, a)?),
        Slab::Int(a) => Slab::Int(select(cond, a)?),
        Slab::Float(a) => Slab::Float(select(cond, a)?),
        Slab::Complex(a) => Slab::Complex(select(cond, a)?),
    })
}

/// Concatenate 1-D pieces of the same variant into one flat array.
pub fn concat1d(pieces: Vec<Slab>) -> Result<Slab> {
    fn flatten<T: Clone>(pieces: Vec<Slab>, unwrap: impl Fn(Slab) -> Option<ArrayD<T>>) -> ArrayD<T> {
        let mut out = Vec::new();
        for p in pieces {
            if let Some(a) = unwrap(p) {
                out.extend(a.into_raw_vec());
            }
        }
        let n = out.len();
        ArrayD::from_shape_vec(IxDyn(&[n]), out).expect("flat vec matches its own length")
    }
    let Some(first) = pieces.first() else {
        return Ok(Slab::Float(ArrayD::from_shape_vec(IxDyn(&[0]), vec![]).unwrap()));
    };
    Ok(match first {
        Slab::Bool(_) => Slab::Bool(flatten(pieces, |p| match p {
            Slab::Bool(a) => Some(a),
            _ => None,
        })),
        Slab::Int(_) => Slab::Int(flatten(pieces, |p| match p {
            Slab::Int(a) => Some(a),
            _ => None,
        })),
        Slab::Float(_) => Slab::Float(flatten(pieces, |p| match p {
            Slab::Float(a) => Some(a),
            _ => None,
        })),
        Slab::Complex(_) => Slab::Complex(flatten(pieces, |p| match p {
            Slab::Complex(a) => Some(a),
            _ => None,
        })),
    })
}

fn assign_into<T: Clone>(dst: &mut ArrayD<T>, offset: &[usize], src: &ArrayD<T>) {
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
    view.assign(src);
}

/// Broadcast two dense arrays (standard NumPy right-aligned rule) and apply
/// `op` elementwise.
fn broadcast_map2<T: Clone, U: Clone, R>(
    a: &ArrayD<T>,
    b: &ArrayD<U>,
    op: impl Fn(T, U) -> R,
) -> Result<ArrayD<R>> {
    let out_shape = broadcast_shape(a.shape(), b.shape())?;
    let a_b = a
        .broadcast(IxDyn(&out_shape))
        .ok_or_else(|| Error::InvalidShape("cannot broadcast operands".into()))?;
    let b_b = b
        .broadcast(IxDyn(&out_shape))
        .ok_or_else(|| Error::InvalidShape("cannot broadcast operands".into()))?;
    let out = ArrayD::from_shape_fn(IxDyn(&out_shape), |idx| {
        op(a_b[idx.clone()].clone(), b_b[idx].clone())
    });
    Ok(out)
}

/// Public entry point for the evaluator, which needs to broadcast
/// operand pairs that aren't necessarily wrapped in a [`Slab`] (e.g. the
/// two float arrays behind `arctan2`, or the condition/branch triple of
/// `where`).
pub fn broadcast_map2_pub<T: Clone, U: Clone, R>(
    a: &ArrayD<T>,
    b: &ArrayD<U>,
    op: impl Fn(T, U) -> R,
) -> Result<ArrayD<R>> {
    broadcast_map2(a, b, op)
}

/// Three-way broadcast for `where(cond, x, y)`: first aligns `x`/`y` to a
/// common shape, then broadcasts `cond` against that result.
pub fn broadcast_map3_pub<C: Clone, T: Clone, R: Clone>(
    cond: &ArrayD<C>,
    x: &ArrayD<T>,
    y: &ArrayD<T>,
    op: impl Fn(C, T, T) -> R,
) -> Result<ArrayD<R>> {
    let xy_shape = broadcast_shape(x.shape(), y.shape())?;
    let out_shape = broadcast_shape(cond.shape(), &xy_shape)?;
    let cond_b = cond
        .broadcast(IxDyn(&out_shape))
        .ok_or_else(|| Error::InvalidShape("cannot broadcast where() condition".into()))?;
    let x_b = x
        .broadcast(IxDyn(&out_shape))
        .ok_or_else(|| Error::InvalidShape("cannot broadcast where() branch".into()))?;
    let y_b = y
        .broadcast(IxDyn(&out_shape))
        .ok_or_else(|| Error::InvalidShape("cannot broadcast where() branch".into()))?;
    let out = ArrayD::from_shape_fn(IxDyn(&out_shape), |idx| {
        op(cond_b[idx.clone()].clone(), x_b[idx.clone()].clone(), y_b[idx].clone())
    });
    Ok(out)
}

/// The standard right-aligned trailing-dimension broadcast rule.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let n = a.len().max(b.len());
    let mut out = vec![1usize; n];
    for i in 0..n {
        let da = *a.get(a.len().wrapping_sub(n - i)).unwrap_or(&1);
        let db = *b.get(b.len().wrapping_sub(n - i)).unwrap_or(&1);
        out[i] = if da == db {
            da
        } else if da == 1 {
            db
        } else if db == 1 {
            da
        } else {
            return Err(Error::InvalidShape(format!(
                "cannot broadcast shapes {:?} and {:?}",
                a, b
            )));
        };
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_shape_right_aligns() {
        assert_eq!(broadcast_shape(&[3000, 4000], &[4000]).unwrap(), vec![3000, 4000]);
        assert_eq!(broadcast_shape(&[1, 4000], &[3000, 1]).unwrap(), vec![3000, 4000]);
        assert!(broadcast_shape(&[3], &[4]).is_err());
    }

    #[test]
    fn int_addition_stays_exact() {
        let a = Slab::Int(ArrayD::from_elem(IxDyn(&[3]), 2));
        let b = Slab::Int(ArrayD::from_elem(IxDyn(&[3]), 3));
        let r = Slab::zip_numeric(&a, &b, |x, y| x + y, |x, y| x + y, |x, y| x + y).unwrap();
        match r {
            Slab::Int(a) => assert!(a.iter().all(|&v| v == 5)),
            _ => panic!("expected int result"),
        }
    }

    #[test]
    fn zero_scalar_detection() {
        let z = Slab::scalar_zero(&DataType::Float(crate::dtype::FloatSize::b64));
        assert!(z.is_zero_scalar());
    }
}
