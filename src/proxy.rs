//! Cache proxy: mirrors a slow/remote chunk source into local
//! storage at whole-chunk granularity, materializing `UNINIT` slots lazily
//! on first access. A read through the proxy only fetches the chunks it
//! actually touches — the whole array is never forced to materialize
//! unless [`Proxy::fetch`] is called explicitly.
//!
//! Built on [`crate::leaf::RemoteArray`] and
//! [`crate::chunk::PrefetchPipeline`]'s `ChunkSource` abstraction: "give me
//! chunk N, I don't care how".

use std::sync::Arc;

use crate::chunk::{ChunkSource, SpecialValue};
use crate::config::CParams;
use crate::dtype::{ComplexSize, DataType, Endian, FloatSize, IntSize, ReflectedType};
use crate::error::{Error, Result};
use crate::leaf::{ArrayLike, RemoteArray};
use crate::ndarray::{NDArray, Region};
use crate::partition::get_chunks_idx;
use crate::slab::Slab;

/// Whole-chunk-granularity remote source a [`Proxy`] mirrors from.
/// Blanket-implemented for any [`RemoteArray`] so the same remote-array
/// leaves the evaluator already knows about can be wrapped in a proxy.
pub trait ProxySource: Send + Sync {
    fn shape(&self) -> Vec<u64>;
    fn dtype(&self) -> DataType;
    fn chunks(&self) -> Vec<u64>;
    fn blocks(&self) -> Vec<u64>;
    fn fetch_chunk(&self, nchunk: usize) -> Result<Vec<u8>>;
}

impl<T: RemoteArray + ?Sized> ProxySource for T {
    fn shape(&self) -> Vec<u64> {
        RemoteArray::shape(self)
    }
    fn dtype(&self) -> DataType {
        RemoteArray::dtype(self)
    }
    fn chunks(&self) -> Vec<u64> {
        RemoteArray::chunks(self)
    }
    fn blocks(&self) -> Vec<u64> {
        RemoteArray::blocks(self)
    }
    fn fetch_chunk(&self, nchunk: usize) -> Result<Vec<u8>> {
        RemoteArray::get_chunk(self, nchunk)
    }
}

/// An n-dim view that mirrors a [`ProxySource`] into a local `NDArray`,
/// materializing whole chunks on first access. Concurrency contract:
/// materializing a chunk is idempotent under concurrent callers (the local
/// `SChunk`'s slot lock makes "check special, maybe fetch, store" atomic per
/// chunk; a redundant concurrent fetch just overwrites the same bytes).
pub struct Proxy {
    source: Arc<dyn ProxySource>,
    local: NDArray,
}

impl Proxy {
    pub fn new(source: Arc<dyn ProxySource>, cparams: CParams, endian: Endian) -> Result<Proxy> {
        let shape = source.shape();
        let dtype = source.dtype();
        let chunks = source.chunks();
        let blocks = source.blocks();
        let local = NDArray::empty(&shape, dtype, cparams, Some(&chunks), Some(&blocks), endian)?;
        Ok(Proxy { source, local })
    }

    /// The local mirror, for inspecting metadata without touching the
    /// remote source (e.g. `shape`/`dtype`/`chunks` never need a fetch).
    pub fn local(&self) -> &NDArray {
        &self.local
    }

    fn materialize_chunk(&self, nchunk: usize) -> Result<()> {
        if self.local.chunk_special(nchunk)? != SpecialValue::Uninit {
            return Ok(());
        }
        let compressed = self.source.fetch_chunk(nchunk)?;
        self.local.schunk().update_chunk(nchunk, compressed)
    }

    /// `fetch()`: materialize the whole array, chunk by chunk.
    pub fn fetch(&self) -> Result<()> {
        let (_, n) = get_chunks_idx(self.local.shape(), self.local.chunks());
        for nchunk in 0..n {
            self.materialize_chunk(nchunk)?;
        }
        Ok(())
    }

    /// `fetch(item)`: materialize only the chunks `region` intersects.
    pub fn fetch_region(&self, region: &Region) -> Result<()> {
        let (_, n) = get_chunks_idx(self.local.shape(), self.local.chunks());
        for nchunk in 0..n {
            if self.local.chunk_region(nchunk).intersect(region).is_some() {
                self.materialize_chunk(nchunk)?;
            }
        }
        Ok(())
    }

    /// Read a region, sparsely materializing only the chunks it touches.
    pub fn read_region(&self, region: &Region) -> Result<Slab> {
        self.fetch_region(region)?;
        self.local.read_region_dyn(region)
    }
}

impl ArrayLike for Proxy {
    fn shape(&self) -> Vec<u64> {
        ArrayLike::shape(&self.local)
    }
    fn dtype(&self) -> DataType {
        ArrayLike::dtype(&self.local)
    }
    fn chunks(&self) -> Option<Vec<u64>> {
        ArrayLike::chunks(&self.local)
    }
    fn blocks(&self) -> Option<Vec<u64>> {
        ArrayLike::blocks(&self.local)
    }
    fn chunk_count(&self) -> usize {
        ArrayLike::chunk_count(&self.local)
    }
    fn chunk_special(&self, nchunk: usize) -> Result<SpecialValue> {
        self.materialize_chunk(nchunk)?;
        ArrayLike::chunk_special(&self.local, nchunk)
    }
    fn chunk_slab(&self, nchunk: usize) -> Result<Slab> {
        self.materialize_chunk(nchunk)?;
        ArrayLike::chunk_slab(&self.local, nchunk)
    }
    fn region_slab(&self, region: &Region) -> Result<Slab> {
        self.fetch_region(region)?;
        ArrayLike::region_slab(&self.local, region)
    }
}

impl ChunkSource for Proxy {
    fn get_chunk(&self, nchunk: usize) -> Result<Vec<u8>> {
        self.materialize_chunk(nchunk)?;
        self.local.get_chunk(nchunk)
    }
}

/// A structured-field-scoped supplement: narrows reads
/// to one field of a proxied structured record, fetching whole chunks the
/// same way [`Proxy`] does but decoding and returning only that field's
/// values, not the whole record.
pub struct ProxyField {
    pub base: Arc<Proxy>,
    pub field_name: String,
}

impl ProxyField {
    fn field_dtype(&self) -> Result<DataType> {
        self.base
            .local
            .dtype()
            .field(&self.field_name)
            .map(|f| (*f.dtype).clone())
            .ok_or_else(|| Error::Unsupported(format!("no such field {:?}", self.field_name)))
    }

    fn decode_chunk(&self, nchunk: usize) -> Result<Slab> {
        self.base.materialize_chunk(nchunk)?;
        let raw = self.base.local.schunk().decompress_chunk(nchunk)?;
        let n: usize = self
            .base
            .local
            .chunk_region(nchunk)
            .shape()
            .iter()
            .map(|&s| s as usize)
            .product();
        let field = self
            .base
            .local
            .dtype()
            .field(&self.field_name)
            .ok_or_else(|| Error::Unsupported(format!("no such field {:?}", self.field_name)))?;
        decode_field_slab(
            &raw,
            n,
            self.base.local.itemsize(),
            field.offset,
            &field.dtype,
            Endian::Little,
        )
    }
}

impl ArrayLike for ProxyField {
    fn shape(&self) -> Vec<u64> {
        self.base.local.shape().to_vec()
    }
    fn dtype(&self) -> DataType {
        self.field_dtype().unwrap_or(DataType::Bool)
    }
    fn chunks(&self) -> Option<Vec<u64>> {
        ArrayLike::chunks(&*self.base)
    }
    fn blocks(&self) -> Option<Vec<u64>> {
        ArrayLike::blocks(&*self.base)
    }
    fn chunk_count(&self) -> usize {
        ArrayLike::chunk_count(&*self.base)
    }
    fn chunk_special(&self, nchunk: usize) -> Result<SpecialValue> {
        ArrayLike::chunk_special(&*self.base, nchunk)
    }
    fn chunk_slab(&self, nchunk: usize) -> Result<Slab> {
        self.decode_chunk(nchunk)
    }
    fn region_slab(&self, region: &Region) -> Result<Slab> {
        let (_, n) = get_chunks_idx(self.base.local.shape(), self.base.local.chunks());
        let out_shape: Vec<usize> = region.shape().iter().map(|&s| s as usize).collect();
        let mut acc: Option<Slab> = None;
        for nchunk in 0..n {
            let chunk_region = self.base.local.chunk_region(nchunk);
            let Some(ix) = chunk_region.intersect(region) else {
                continue;
            };
            let chunk_slab = self.decode_chunk(nchunk)?;
            let local_offset: Vec<usize> = ix
                .0
                .iter()
                .zip(chunk_region.0.iter())
                .map(|(&(s, _), &(cs, _))| (s - cs) as usize)
                .collect();
            let ix_shape: Vec<usize> = ix.shape().iter().map(|&s| s as usize).collect();
            let sub = chunk_slab.subslice(&local_offset, &ix_shape);
            if acc.is_none() {
                acc = Some(sub.zeros_like_kind(&out_shape));
            }
            let offset: Vec<usize> = ix
                .0
                .iter()
                .zip(region.0.iter())
                .map(|(&(s, _), &(os, _))| (s - os) as usize)
                .collect();
            acc.as_mut().unwrap().assign_subregion(&offset, &sub)?;
        }
        acc.ok_or_else(|| Error::InvalidShape("region does not intersect array".into()))
    }
}

/// Decode one field's values out of `n` fixed-width records packed in
/// `raw`, widening to the canonical [`Slab`] domain the same way
/// [`crate::ndarray::NDArray::decompress_chunk_dyn`] does for a whole array.
fn decode_field_slab(
    raw: &[u8],
    n: usize,
    rec_size: usize,
    offset: usize,
    dtype: &DataType,
    endian: Endian,
) -> Result<Slab> {
    fn decode<T: ReflectedType>(raw: &[u8], n: usize, rec_size: usize, offset: usize, endian: Endian) -> Vec<T> {
        let width = std::mem::size_of::<T>();
        (0..n)
            .map(|i| {
                let base = i * rec_size + offset;
                T::read_bytes(endian, &raw[base..base + width])
            })
            .collect()
    }
    fn to_array<T, R>(values: Vec<T>, cast: impl Fn(T) -> R) -> ndarray::ArrayD<R> {
        let n = values.len();
        let out: Vec<R> = values.into_iter().map(cast).collect();
        ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&[n]), out).expect("length matches n")
    }
    Ok(match dtype {
        DataType::Bool => Slab::Bool(to_array(decode::<bool>(raw, n, rec_size, offset, endian), |v| v)),
        DataType::Int(IntSize::b8) => Slab::Int(to_array(decode::<i8>(raw, n, rec_size, offset, endian), |v| v as i64)),
        DataType::Int(IntSize::b16) => Slab::Int(to_array(decode::<i16>(raw, n, rec_size, offset, endian), |v| v as i64)),
        DataType::Int(IntSize::b32) => Slab::Int(to_array(decode::<i32>(raw, n, rec_size, offset, endian), |v| v as i64)),
        DataType::Int(IntSize::b64) => Slab::Int(to_array(decode::<i64>(raw, n, rec_size, offset, endian), |v| v)),
        DataType::UInt(IntSize::b8) => Slab::Int(to_array(decode::<u8>(raw, n, rec_size, offset, endian), |v| v as i64)),
        DataType::UInt(IntSize::b16) => Slab::Int(to_array(decode::<u16>(raw, n, rec_size, offset, endian), |v| v as i64)),
        DataType::UInt(IntSize::b32) => Slab::Int(to_array(decode::<u32>(raw, n, rec_size, offset, endian), |v| v as i64)),
        DataType::UInt(IntSize::b64) => Slab::Int(to_array(decode::<u64>(raw, n, rec_size, offset, endian), |v| v as i64)),
        DataType::Float(FloatSize::b32) => Slab::Float(to_array(decode::<f32>(raw, n, rec_size, offset, endian), |v| v as f64)),
        DataType::Float(FloatSize::b64) => Slab::Float(to_array(decode::<f64>(raw, n, rec_size, offset, endian), |v| v)),
        DataType::Complex(ComplexSize::b64) => Slab::Complex(to_array(
            decode::<crate::dtype::c64>(raw, n, rec_size, offset, endian),
            |v| num_complex::Complex64::new(v.re as f64, v.im as f64),
        )),
        DataType::Complex(ComplexSize::b128) => {
            Slab::Complex(to_array(decode::<crate::dtype::c128>(raw, n, rec_size, offset, endian), |v| v))
        }
        DataType::Raw { .. } => return Err(Error::Unsupported("nested structured fields are not supported".into())),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::dtype::FloatSize;

    struct CountingSource {
        shape: Vec<u64>,
        chunks: Vec<u64>,
        fetch_count: Mutex<usize>,
    }

    impl ProxySource for CountingSource {
        fn shape(&self) -> Vec<u64> {
            self.shape.clone()
        }
        fn dtype(&self) -> DataType {
            DataType::Float(FloatSize::b64)
        }
        fn chunks(&self) -> Vec<u64> {
            self.chunks.clone()
        }
        fn blocks(&self) -> Vec<u64> {
            self.chunks.clone()
        }
        fn fetch_chunk(&self, _nchunk: usize) -> Result<Vec<u8>> {
            *self.fetch_count.lock().unwrap() += 1;
            let n: usize = self.chunks.iter().product::<u64>() as usize;
            let data = ndarray::ArrayD::from_elem(ndarray::IxDyn(&[n]), 7.0f64);
            crate::chunk::compress_chunk(
                &data
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect::<Vec<u8>>(),
                &CParams::default(),
            )
        }
    }

    #[test]
    fn partial_read_only_materializes_touched_chunks() {
        let source = Arc::new(CountingSource {
            shape: vec![4, 4],
            chunks: vec![2, 2],
            fetch_count: Mutex::new(0),
        });
        let proxy = Proxy::new(source.clone(), CParams::default(), Endian::Little).unwrap();
        proxy.read_region(&Region(vec![(0, 2), (0, 2)])).unwrap();
        assert_eq!(*source.fetch_count.lock().unwrap(), 1);

        // A second read of the same region must not refetch (already
        // NotSpecial after the first materialize).
        proxy.read_region(&Region(vec![(0, 2), (0, 2)])).unwrap();
        assert_eq!(*source.fetch_count.lock().unwrap(), 1);

        proxy.fetch().unwrap();
        assert_eq!(*source.fetch_count.lock().unwrap(), 4);
    }
}
