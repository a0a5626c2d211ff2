//! User-defined chunk functions: instead of compiling a
//! validated expression, apply an arbitrary closure directly to each
//! chunk's operand views. Always walked single-chunk-at-a-time on the
//! calling thread — there is no worker pool to force out of, but this is
//! the UDF path's only supported mode, matching the forced `nthreads=1`
//! note for user code.

use std::collections::HashMap;
use std::sync::Arc;

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};

use crate::dtype::{DataType, Endian};
use crate::error::Result;
use crate::leaf::Leaf;
use crate::ndarray::NDArray;
use crate::slab::Slab;

use super::driver::{chunk_slab_map, plan_geometry, ComputeOptions};

/// A user-supplied per-chunk kernel: given each operand's chunk already
/// widened to `f64`, fill the output chunk view. The `usize` is the
/// chunk's linear index, for kernels that need it (e.g. per-chunk seeds).
pub type UdfFn = dyn Fn(&[ArrayViewD<f64>], &mut ArrayViewMutD<f64>, usize) + Send + Sync;

/// A deferred chunk function, standing in for [`super::LazyExpr`] when the
/// computation can't be expressed in the validated expression language.
pub struct LazyUDF {
    operands: Vec<(String, Leaf)>,
    f: Arc<UdfFn>,
    output_dtype: DataType,
}

impl LazyUDF {
    pub fn new(
        operands: Vec<(String, Leaf)>,
        output_dtype: DataType,
        f: Arc<UdfFn>,
    ) -> LazyUDF {
        LazyUDF {
            operands,
            f,
            output_dtype,
        }
    }

    /// Evaluate chunk by chunk, writing straight into a freshly allocated
    /// output array.
    pub fn compute(&self, opts: ComputeOptions) -> Result<NDArray> {
        let operand_map: HashMap<String, Leaf> = self.operands.iter().cloned().collect();
        let plan = plan_geometry(&operand_map, None, opts.chunks.as_deref())?;
        let cparams = opts.cparams.clone().unwrap_or_default();
        let out = NDArray::empty(
            &plan.shape,
            self.output_dtype.clone(),
            cparams,
            Some(&plan.chunks),
            opts.blocks.as_deref(),
            opts.endian,
        )?;
        for nchunk in 0..plan.n {
            let (slabs, region) = chunk_slab_map(&operand_map, None, &plan, nchunk)?;
            let views: Vec<ArrayD<f64>> = self
                .operands
                .iter()
                .map(|(name, _)| slabs[name].to_float())
                .collect();
            let view_refs: Vec<ArrayViewD<f64>> = views.iter().map(|v| v.view()).collect();
            let out_shape: Vec<usize> = region.shape().iter().map(|&s| s as usize).collect();
            let mut out_buf = ArrayD::<f64>::zeros(IxDyn(&out_shape));
            (self.f)(&view_refs, &mut out_buf.view_mut(), nchunk);
            out.update_data_dyn(nchunk, &Slab::Float(out_buf))?;
        }
        Ok(out)
    }
}

impl std::fmt::Debug for LazyUDF {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyUDF")
            .field("operands", &self.operands.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("output_dtype", &self.output_dtype)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CParams;
    use crate::dtype::FloatSize;
    use crate::ndarray::Region;
    use ndarray::IxDyn as NdIxDyn;
    use std::sync::Arc as StdArc;

    fn array_leaf(shape: &[usize], fill: f64) -> Leaf {
        let data = ArrayD::<f64>::from_elem(NdIxDyn(shape), fill);
        let shape_u64: Vec<u64> = shape.iter().map(|&s| s as u64).collect();
        let arr = NDArray::from_array(
            data,
            CParams::default(),
            Some(&shape_u64),
            Some(&shape_u64),
            Endian::Little,
        )
        .unwrap();
        Leaf::Array(StdArc::new(arr))
    }

    #[test]
    fn udf_doubles_each_chunk() {
        let a = array_leaf(&[4, 4], 3.0);
        let udf = LazyUDF::new(
            vec![("o0".to_string(), a)],
            DataType::Float(FloatSize::b64),
            StdArc::new(|inputs, out, _nchunk| {
                out.assign(&(&inputs[0] * 2.0));
            }),
        );
        let result = udf.compute(ComputeOptions::default()).unwrap();
        let region = Region::full(result.shape());
        let back = result.read_region_typed::<f64>(&region).unwrap();
        assert!(back.iter().all(|&v| v == 6.0));
    }
}
