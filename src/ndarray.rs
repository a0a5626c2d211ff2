//! NDArray: an n-dim view over an `SChunk` with shape/chunks/
//! blocks metadata.
//!
//! Adapts a decompress-and-assemble-from-chunk-grid read path and a
//! row-major region-intersection scheme from an on-disk chunk grid to an
//! in-process `SChunk`.

use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};

use crate::dtype::{DataType, Endian, ReflectedType};
use crate::error::{Error, Result};
use crate::partition::{
    self, are_partitions_aligned, are_partitions_behaved, chunk_slab, unravel_chunk_index,
};
use crate::schunk::SChunk;
use crate::GridCoord;

/// A per-axis `(start, end)` region, row-major, half-open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region(pub Vec<(u64, u64)>);

impl Region {
    pub fn full(shape: &[u64]) -> Self {
        Self(shape.iter().map(|&s| (0, s)).collect())
    }

    pub fn shape(&self) -> Vec<u64> {
        self.0.iter().map(|&(s, e)| e - s).collect()
    }

    /// Intersection with another region, or `None` if disjoint on some axis.
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        if self.0.len() != other.0.len() {
            return None;
        }
        let mut out = Vec::with_capacity(self.0.len());
        for (&(s1, e1), &(s2, e2)) in self.0.iter().zip(other.0.iter()) {
            let s = s1.max(s2);
            let e = e1.min(e2);
            if s >= e {
                return None;
            }
            out.push((s, e));
        }
        Some(Region(out))
    }
}

#[derive(Clone)]
pub struct NDArray {
    shape: GridCoord,
    dtype: DataType,
    chunks: GridCoord,
    blocks: GridCoord,
    endian: Endian,
    schunk: Arc<SChunk>,
}

impl NDArray {
    pub fn shape(&self) -> &[u64] {
        self.shape.as_slice()
    }

    pub fn dtype(&self) -> &DataType {
        &self.dtype
    }

    pub fn chunks(&self) -> &[u64] {
        self.chunks.as_slice()
    }

    pub fn blocks(&self) -> &[u64] {
        self.blocks.as_slice()
    }

    pub fn itemsize(&self) -> usize {
        self.dtype.itemsize()
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn schunk(&self) -> &Arc<SChunk> {
        &self.schunk
    }

    pub fn is_aligned(&self) -> bool {
        are_partitions_aligned(self.shape.as_slice(), self.chunks.as_slice(), self.blocks.as_slice())
    }

    pub fn is_behaved(&self) -> bool {
        are_partitions_behaved(self.shape.as_slice(), self.chunks.as_slice(), self.blocks.as_slice())
    }

    pub fn chunk_counts(&self) -> (GridCoord, usize) {
        partition::get_chunks_idx(self.shape.as_slice(), self.chunks.as_slice())
    }

    /// The n-dim slab (row-major region) covered by chunk `nchunk`.
    pub fn chunk_region(&self, nchunk: usize) -> Region {
        let (counts, _) = self.chunk_counts();
        let coord = unravel_chunk_index(nchunk, counts.as_slice());
        let slab = chunk_slab(coord.as_slice(), self.shape.as_slice(), self.chunks.as_slice());
        Region(slab)
    }

    /// Whether `nchunk` is a "full" chunk (not truncated by array boundary).
    pub fn is_full_chunk(&self, nchunk: usize) -> bool {
        let region = self.chunk_region(nchunk);
        region
            .0
            .iter()
            .zip(self.chunks.iter())
            .all(|(&(s, e), &c)| e - s == c)
    }

    /// The chunk's special-value tag, without decompressing.
    pub fn chunk_special(&self, nchunk: usize) -> Result<crate::chunk::SpecialValue> {
        self.schunk.special(nchunk)
    }

    /// `get_chunk`: compressed bytes for `nchunk`.
    pub fn get_chunk(&self, nchunk: usize) -> Result<Vec<u8>> {
        self.schunk.get_chunk(nchunk)
    }

    /// Decompress the whole chunk once, returned as a dense `ArrayD<T>`
    /// in the chunk's own (possibly truncated) shape.
    pub fn decompress_chunk_typed<T: ReflectedType>(&self, nchunk: usize) -> Result<ArrayD<T>> {
        if self.dtype != T::DTYPE {
            return Err(Error::InvalidShape("dtype mismatch".into()));
        }
        let region = self.chunk_region(nchunk);
        let shape = region.shape();
        let raw = self.schunk.decompress_chunk(nchunk)?;
        decode_buffer::<T>(&raw, &shape, self.endian)
    }

    /// Materialize an arbitrary region as a dense `ArrayD<T>`, assembling it chunk-by-chunk.
    pub fn read_region_typed<T: ReflectedType>(&self, region: &Region) -> Result<ArrayD<T>> {
        if self.dtype != T::DTYPE {
            return Err(Error::InvalidShape("dtype mismatch".into()));
        }
        let out_shape = region.shape();
        let mut out = ArrayD::<T>::from_elem(IxDyn(&out_shape.iter().map(|&s| s as usize).collect::<Vec<_>>()), zero_value::<T>());

        let (_, n) = self.chunk_counts();
        for nchunk in 0..n {
            let chunk_region = self.chunk_region(nchunk);
            let Some(ix) = chunk_region.intersect(region) else {
                continue;
            };
            let chunk_data = self.decompress_chunk_typed::<T>(nchunk)?;
            // Offsets of the intersection within the chunk and within the output.
            for (flat_idx, value) in iter_region_values(&chunk_data, &chunk_region, &ix) {
                let out_idx: Vec<usize> = flat_idx
                    .iter()
                    .zip(region.0.iter())
                    .map(|(&gi, &(start, _))| (gi - start) as usize)
                    .collect();
                out[IxDyn(&out_idx)] = value;
            }
        }
        Ok(out)
    }

    /// `slice(key) -> NDArray`: a new array sharing no state with the
    /// source; re-derives its own partitioning unless told otherwise.
    pub fn slice_typed<T: ReflectedType>(&self, region: &Region, cparams: crate::config::CParams) -> Result<NDArray> {
        let data = self.read_region_typed::<T>(region)?;
        NDArray::from_array(data, cparams, None, None, self.endian)
    }

    pub fn from_array<T: ReflectedType>(
        data: ArrayD<T>,
        cparams: crate::config::CParams,
        chunks: Option<&[u64]>,
        blocks: Option<&[u64]>,
        endian: Endian,
    ) -> Result<NDArray> {
        let shape: Vec<u64> = data.shape().iter().map(|&s| s as u64).collect();
        let itemsize = T::DTYPE.itemsize();
        let (chunks, blocks) = crate::partition::compute_chunks_blocks(
            &shape,
            chunks,
            blocks,
            itemsize,
            &cparams,
            crate::partition::CacheSizes::probe(),
        )?;
        let (_, n) = partition::get_chunks_idx(&shape, chunks.as_slice());
        let chunksize = chunks.iter().product::<u64>() as usize * itemsize;
        let schunk = Arc::new(SChunk::new(n, itemsize, chunksize, cparams));
        let arr = NDArray {
            shape: shape.into_iter().collect(),
            dtype: T::DTYPE,
            chunks,
            blocks,
            endian,
            schunk,
        };
        for nchunk in 0..n {
            let region = arr.chunk_region(nchunk);
            let shape_usize: Vec<usize> = region.shape().iter().map(|&s| s as usize).collect();
            let mut buf = vec![0u8; shape_usize.iter().product::<usize>() * itemsize];
            let mut offset = 0;
            for v in slice_region(&data, &region) {
                v.write_bytes(endian, &mut buf[offset..offset + itemsize]);
                offset += itemsize;
            }
            arr.schunk.update_data(nchunk, &buf)?;
        }
        Ok(arr)
    }

    /// `empty`: a shape+dtype skeleton with every chunk `UNINIT`.
    pub fn empty(
        shape: &[u64],
        dtype: DataType,
        cparams: crate::config::CParams,
        chunks: Option<&[u64]>,
        blocks: Option<&[u64]>,
        endian: Endian,
    ) -> Result<NDArray> {
        let itemsize = dtype.itemsize();
        let (chunks, blocks) = crate::partition::compute_chunks_blocks(
            shape,
            chunks,
            blocks,
            itemsize,
            &cparams,
            crate::partition::CacheSizes::probe(),
        )?;
        let (_, n) = partition::get_chunks_idx(shape, chunks.as_slice());
        let chunksize = chunks.iter().product::<u64>() as usize * itemsize;
        let schunk = Arc::new(SChunk::new(n, itemsize, chunksize, cparams));
        Ok(NDArray {
            shape: shape.iter().copied().collect(),
            dtype,
            chunks,
            blocks,
            endian,
            schunk,
        })
    }

    /// Dispatch on the array's runtime dtype and return the chunk as a
    /// coarsened [`crate::slab::Slab`].
    pub fn decompress_chunk_dyn(&self, nchunk: usize) -> Result<crate::slab::Slab> {
        use crate::dtype::{ComplexSize, FloatSize, IntSize};
        use crate::slab::Slab;
        Ok(match &self.dtype {
            DataType::Bool => Slab::Bool(self.decompress_chunk_typed::<bool>(nchunk)?),
            DataType::Int(IntSize::b8) => {
                Slab::Int(self.decompress_chunk_typed::<i8>(nchunk)?.mapv(|v| v as i64))
            }
            DataType::Int(IntSize::b16) => {
                Slab::Int(self.decompress_chunk_typed::<i16>(nchunk)?.mapv(|v| v as i64))
            }
            DataType::Int(IntSize::b32) => {
                Slab::Int(self.decompress_chunk_typed::<i32>(nchunk)?.mapv(|v| v as i64))
            }
            DataType::Int(IntSize::b64) => Slab::Int(self.decompress_chunk_typed::<i64>(nchunk)?),
            DataType::UInt(IntSize::b8) => {
                Slab::Int(self.decompress_chunk_typed::<u8>(nchunk)?.mapv(|v| v as i64))
            }
            DataType::UInt(IntSize::b16) => {
                Slab::Int(self.decompress_chunk_typed::<u16>(nchunk)?.mapv(|v| v as i64))
            }
            DataType::UInt(IntSize::b32) => {
                Slab::Int(self.decompress_chunk_typed::<u32>(nchunk)?.mapv(|v| v as i64))
            }
            DataType::UInt(IntSize::b64) => {
                Slab::Int(self.decompress_chunk_typed::<u64>(nchunk)?.mapv(|v| v as i64))
            }
            DataType::Float(FloatSize::b32) => {
                Slab::Float(self.decompress_chunk_typed::<f32>(nchunk)?.mapv(|v| v as f64))
            }
            DataType::Float(FloatSize::b64) => Slab::Float(self.decompress_chunk_typed::<f64>(nchunk)?),
            DataType::Complex(ComplexSize::b64) => Slab::Complex(
                self.decompress_chunk_typed::<crate::dtype::c64>(nchunk)?
                    .mapv(|v| num_complex::Complex64::new(v.re as f64, v.im as f64)),
            ),
            DataType::Complex(ComplexSize::b128) => {
                Slab::Complex(self.decompress_chunk_typed::<crate::dtype::c128>(nchunk)?)
            }
            DataType::Raw { .. } => {
                return Err(Error::Unsupported(
                    "raw/structured dtype has no numeric slab view".into(),
                ))
            }
        })
    }

    /// Dispatch on the array's runtime dtype and return an arbitrary region
    /// as a coarsened [`crate::slab::Slab`], assembling it chunk-by-chunk
    /// the same way [`Self::read_region_typed`] does for a single dtype.
    /// This is the generic counterpart of [`Self::decompress_chunk_dyn`]
    /// used by [`crate::leaf::ArrayLike::region_slab`].
    pub fn read_region_dyn(&self, region: &Region) -> Result<crate::slab::Slab> {
        use crate::dtype::{ComplexSize, FloatSize, IntSize};
        use crate::slab::Slab;
        Ok(match &self.dtype {
            DataType::Bool => Slab::Bool(self.read_region_typed::<bool>(region)?),
            DataType::Int(IntSize::b8) => {
                Slab::Int(self.read_region_typed::<i8>(region)?.mapv(|v| v as i64))
            }
            DataType::Int(IntSize::b16) => {
                Slab::Int(self.read_region_typed::<i16>(region)?.mapv(|v| v as i64))
            }
            DataType::Int(IntSize::b32) => {
                Slab::Int(self.read_region_typed::<i32>(region)?.mapv(|v| v as i64))
            }
            DataType::Int(IntSize::b64) => Slab::Int(self.read_region_typed::<i64>(region)?),
            DataType::UInt(IntSize::b8) => {
                Slab::Int(self.read_region_typed::<u8>(region)?.mapv(|v| v as i64))
            }
            DataType::UInt(IntSize::b16) => {
                Slab::Int(self.read_region_typed::<u16>(region)?.mapv(|v| v as i64))
            }
            DataType::UInt(IntSize::b32) => {
                Slab::Int(self.read_region_typed::<u32>(region)?.mapv(|v| v as i64))
            }
            DataType::UInt(IntSize::b64) => {
                Slab::Int(self.read_region_typed::<u64>(region)?.mapv(|v| v as i64))
            }
            DataType::Float(FloatSize::b32) => {
                Slab::Float(self.read_region_typed::<f32>(region)?.mapv(|v| v as f64))
            }
            DataType::Float(FloatSize::b64) => Slab::Float(self.read_region_typed::<f64>(region)?),
            DataType::Complex(ComplexSize::b64) => Slab::Complex(
                self.read_region_typed::<crate::dtype::c64>(region)?
                    .mapv(|v| num_complex::Complex64::new(v.re as f64, v.im as f64)),
            ),
            DataType::Complex(ComplexSize::b128) => {
                Slab::Complex(self.read_region_typed::<crate::dtype::c128>(region)?)
            }
            DataType::Raw { .. } => {
                return Err(Error::Unsupported(
                    "raw/structured dtype has no numeric slab view".into(),
                ))
            }
        })
    }

    /// Compress a fully-assembled [`crate::slab::Slab`] into a new array,
    /// dispatching on its variant the same way [`Self::from_array`] is
    /// dispatched on a compile-time dtype. Used by the chunked evaluator
    /// once a whole-array result has been assembled in memory.
    pub fn from_slab(
        slab: crate::slab::Slab,
        cparams: crate::config::CParams,
        chunks: Option<&[u64]>,
        blocks: Option<&[u64]>,
        endian: Endian,
    ) -> Result<NDArray> {
        use crate::slab::Slab;
        match slab {
            Slab::Bool(a) => NDArray::from_array(a, cparams, chunks, blocks, endian),
            Slab::Int(a) => NDArray::from_array(a, cparams, chunks, blocks, endian),
            Slab::Float(a) => NDArray::from_array(a, cparams, chunks, blocks, endian),
            Slab::Complex(a) => NDArray::from_array(a, cparams, chunks, blocks, endian),
        }
    }

    /// `update_data(nchunk, buffer)`: overwrite a whole chunk.
    pub fn update_data_typed<T: ReflectedType>(&self, nchunk: usize, data: &ArrayD<T>) -> Result<()> {
        let itemsize = self.dtype.itemsize();
        let mut buf = vec![0u8; data.len() * itemsize];
        for (i, &v) in data.iter().enumerate() {
            v.write_bytes(self.endian, &mut buf[i * itemsize..(i + 1) * itemsize]);
        }
        self.schunk.update_data(nchunk, &buf)
    }

    /// Dynamic counterpart of [`Self::update_data_typed`]: narrows a
    /// [`crate::slab::Slab`] (always one of the four widened kinds) down to
    /// this array's own native dtype before writing the chunk. Used by the
    /// chunked evaluator to write a freshly computed chunk back into
    /// an output array without the caller needing to know its exact dtype.
    pub fn update_data_dyn(&self, nchunk: usize, slab: &crate::slab::Slab) -> Result<()> {
        use crate::dtype::{ComplexSize, FloatSize, IntSize};
        match &self.dtype {
            DataType::Bool => self.update_data_typed(nchunk, &slab.to_bool()),
            DataType::Int(IntSize::b8) => self.update_data_typed(nchunk, &slab.to_int().mapv(|v| v as i8)),
            DataType::Int(IntSize::b16) => self.update_data_typed(nchunk, &slab.to_int().mapv(|v| v as i16)),
            DataType::Int(IntSize::b32) => self.update_data_typed(nchunk, &slab.to_int().mapv(|v| v as i32)),
            DataType::Int(IntSize::b64) => self.update_data_typed(nchunk, &slab.to_int()),
            DataType::UInt(IntSize::b8) => self.update_data_typed(nchunk, &slab.to_int().mapv(|v| v as u8)),
            DataType::UInt(IntSize::b16) => self.update_data_typed(nchunk, &slab.to_int().mapv(|v| v as u16)),
            DataType::UInt(IntSize::b32) => self.update_data_typed(nchunk, &slab.to_int().mapv(|v| v as u32)),
            DataType::UInt(IntSize::b64) => self.update_data_typed(nchunk, &slab.to_int().mapv(|v| v as u64)),
            DataType::Float(FloatSize::b32) => {
                self.update_data_typed(nchunk, &slab.to_float().mapv(|v| v as f32))
            }
            DataType::Float(FloatSize::b64) => self.update_data_typed(nchunk, &slab.to_float()),
            DataType::Complex(ComplexSize::b64) => self.update_data_typed(
                nchunk,
                &slab
                    .to_complex()
                    .mapv(|c| crate::dtype::c64::new(c.re as f32, c.im as f32)),
            ),
            DataType::Complex(ComplexSize::b128) => self.update_data_typed(nchunk, &slab.to_complex()),
            DataType::Raw { .. } => Err(Error::Unsupported(
                "raw/structured dtype has no numeric slab view".into(),
            )),
        }
    }
}

fn zero_value<T: ReflectedType>() -> T {
    let itemsize = T::DTYPE.itemsize();
    let buf = vec![0u8; itemsize];
    T::read_bytes(Endian::Little, &buf)
}

fn decode_buffer<T: ReflectedType>(raw: &[u8], shape: &[u64], endian: Endian) -> Result<ArrayD<T>> {
    let itemsize = T::DTYPE.itemsize();
    let n: usize = shape.iter().map(|&s| s as usize).product();
    if raw.len() < n * itemsize {
        return Err(Error::Decompress {
            nchunk: usize::MAX,
            source: crate::error::DecompressError::BufferTooSmall {
                need: n * itemsize,
                have: raw.len(),
            },
        });
    }
    let values: Vec<T> = (0..n)
        .map(|i| T::read_bytes(endian, &raw[i * itemsize..(i + 1) * itemsize]))
        .collect();
    let dims: Vec<usize> = shape.iter().map(|&s| s as usize).collect();
    ArrayD::from_shape_vec(IxDyn(&dims), values)
        .map_err(|e| Error::InvalidShape(e.to_string()))
}

/// Iterate `(global_coord, value)` pairs of `chunk_data` (whose own
/// coordinate frame starts at `chunk_region`'s origin) restricted to the
/// intersection `ix`.
fn iter_region_values<'a, T: ReflectedType>(
    chunk_data: &'a ArrayD<T>,
    chunk_region: &'a Region,
    ix: &'a Region,
) -> impl Iterator<Item = (Vec<u64>, T)> + 'a {
    let local = Region(
        ix.0
            .iter()
            .zip(chunk_region.0.iter())
            .map(|(&(s, e), &(cs, _))| (s - cs, e - cs))
            .collect(),
    );
    multi_range(&local).map(move |local_idx| {
        let usize_idx: Vec<usize> = local_idx.iter().map(|&i| i as usize).collect();
        let v = chunk_data[IxDyn(&usize_idx)];
        let global_idx: Vec<u64> = local_idx
            .iter()
            .zip(chunk_region.0.iter())
            .map(|(&li, &(cs, _))| li + cs)
            .collect();
        (global_idx, v)
    })
}

fn slice_region<T: ReflectedType>(data: &ArrayD<T>, region: &Region) -> Vec<T> {
    multi_range(region)
        .map(|idx| {
            let usize_idx: Vec<usize> = idx.iter().map(|&i| i as usize).collect();
            data[IxDyn(&usize_idx)]
        })
        .collect()
}

/// Row-major iteration over every coordinate in `region` (absolute
/// coordinates, half-open per axis).
fn multi_range(region: &Region) -> impl Iterator<Item = Vec<u64>> + '_ {
    let dims: Vec<u64> = region.0.iter().map(|&(s, e)| e - s).collect();
    let total: u64 = if dims.is_empty() { 1 } else { dims.iter().product() };
    (0..total).map(move |mut flat| {
        let mut idx = vec![0u64; dims.len()];
        for i in (0..dims.len()).rev() {
            let d = dims[i].max(1);
            idx[i] = (flat % d) + region.0[i].0;
            flat /= d;
        }
        idx
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CParams;

    #[test]
    fn roundtrip_small_array() {
        let data = ArrayD::from_shape_vec(IxDyn(&[4, 4]), (0..16).map(|x| x as f64).collect()).unwrap();
        let arr = NDArray::from_array(data.clone(), CParams::default(), Some(&[2, 2]), Some(&[2, 2]), Endian::Little).unwrap();
        let region = Region::full(arr.shape());
        let back = arr.read_region_typed::<f64>(&region).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn partial_region_reads_correct_values() {
        let data = ArrayD::from_shape_vec(IxDyn(&[4, 4]), (0..16).map(|x| x as f64).collect()).unwrap();
        let arr = NDArray::from_array(data.clone(), CParams::default(), Some(&[2, 2]), Some(&[2, 2]), Endian::Little).unwrap();
        let region = Region(vec![(1, 3), (1, 3)]);
        let back = arr.read_region_typed::<f64>(&region).unwrap();
        for i in 0..2 {
            for j in 0..2 {
                assert_eq!(back[IxDyn(&[i, j])], data[IxDyn(&[i + 1, j + 1])]);
            }
        }
    }
}
