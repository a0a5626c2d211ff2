//! Chunk I/O: compression boundary, chunk header, special-value tag,
//! and the disk-prefetch pipeline.
//!
//! The byte-level codec kernels (SHUFFLE, BloscLZ, LZ4, ZSTD, …) are
//! treated as an external collaborator; they are consumed here through
//! `compress_chunk`/`decompress_chunk`, built on the vendored `blosc` crate
//! (`Context::new()` builder, `ctx.compress`, `blosc::decompress_bytes`).

use std::sync::Arc;
use std::thread::JoinHandle;

use blosc::{Clevel, Context};
use log::{debug, trace};

use crate::config::CParams;
use crate::error::{DecompressError, Error, Result};

pub const HEADER_LEN: usize = 32;
const SPECIAL_MASK: u8 = 0x70;
const SPECIAL_SHIFT: u32 = 4;

/// The 3-bit special-value tag carried at byte 31, bits 4-6 of a chunk's
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialValue {
    NotSpecial,
    Zero,
    Nan,
    Value,
    Uninit,
}

impl SpecialValue {
    fn from_bits(b: u8) -> Self {
        match b {
            0 => Self::NotSpecial,
            1 => Self::Zero,
            2 => Self::Nan,
            3 => Self::Value,
            4 => Self::Uninit,
            _ => Self::NotSpecial,
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            Self::NotSpecial => 0,
            Self::Zero => 1,
            Self::Nan => 2,
            Self::Value => 3,
            Self::Uninit => 4,
        }
    }
}

/// A read-only view over a chunk's leading 32-byte header.
///
/// The engine never constructs headers by hand when writing real payload
/// chunks — `compress_chunk` delegates that to the codec — but it does
/// synthesize headers for `SpecialValue::Zero`/`Uninit` placeholder chunks,
/// and always reads this format back.
#[derive(Debug, Clone)]
pub struct ChunkHeader(pub [u8; HEADER_LEN]);

impl ChunkHeader {
    pub fn special(&self) -> SpecialValue {
        SpecialValue::from_bits((self.0[31] & SPECIAL_MASK) >> SPECIAL_SHIFT)
    }

    pub fn set_special(&mut self, v: SpecialValue) {
        self.0[31] = (self.0[31] & !SPECIAL_MASK) | (v.to_bits() << SPECIAL_SHIFT);
    }

    /// Build a placeholder header for a special (non-materialized) chunk of
    /// `nbytes` logical bytes.
    pub fn placeholder(special: SpecialValue, nbytes: u32) -> Self {
        let mut h = [0u8; HEADER_LEN];
        h[4..8].copy_from_slice(&nbytes.to_le_bytes());
        let mut out = Self(h);
        out.set_special(special);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Decompress {
                nchunk: usize::MAX,
                source: DecompressError::BufferTooSmall {
                    need: HEADER_LEN,
                    have: buf.len(),
                },
            });
        }
        let mut h = [0u8; HEADER_LEN];
        h.copy_from_slice(&buf[..HEADER_LEN]);
        Ok(Self(h))
    }
}

fn clevel_from_u8(c: u8) -> Clevel {
    match c {
        0 => Clevel::None,
        1 => Clevel::L1,
        2 => Clevel::L2,
        3 => Clevel::L3,
        4 => Clevel::L4,
        5 => Clevel::L5,
        6 => Clevel::L6,
        7 => Clevel::L7,
        8 => Clevel::L8,
        _ => Clevel::L9,
    }
}

fn build_context(cparams: &CParams) -> Result<Context> {
    let ctx = Context::new()
        .compressor(cparams.codec)
        .map_err(|_| Error::Unsupported("unsupported compressor".to_string()))?
        .clevel(clevel_from_u8(match cparams.clevel {
            Clevel::None => 0,
            Clevel::L1 => 1,
            Clevel::L2 => 2,
            Clevel::L3 => 3,
            Clevel::L4 => 4,
            Clevel::L5 => 5,
            Clevel::L6 => 6,
            Clevel::L7 => 7,
            Clevel::L8 => 8,
            Clevel::L9 => 9,
        }))
        .shuffle(cparams.shuffle_mode())
        .blocksize(if cparams.blocksize == 0 {
            None
        } else {
            Some(cparams.blocksize)
        });
    Ok(ctx)
}

/// Compress a decoded chunk payload. External collaborator boundary ;
/// delegates to the vendored blosc codec.
pub fn compress_chunk(decoded: &[u8], cparams: &CParams) -> Result<Vec<u8>> {
    let ctx = build_context(cparams)?;
    let compressed: Vec<u8> = ctx.compress(decoded).into();
    trace!(
        "compressed chunk: {} -> {} bytes",
        decoded.len(),
        compressed.len()
    );
    Ok(compressed)
}

/// Decompress a full chunk (header + payload) produced by `compress_chunk`.
pub fn decompress_chunk(encoded: &[u8]) -> Result<Vec<u8>> {
    unsafe { blosc::decompress_bytes(encoded) }.map_err(|_| Error::Decompress {
        nchunk: usize::MAX,
        source: DecompressError::Blosc,
    })
}

/// Read just the chunk's header, without touching payload bytes. `reader` need only yield the first 32 bytes.
pub fn read_header<R: std::io::Read>(mut reader: R) -> Result<ChunkHeader> {
    let mut buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut buf).map_err(Error::Io)?;
    ChunkHeader::from_bytes(&buf)
}

/// One item pulled off the prefetch queue: the chunk index, and each
/// operand's chunk bytes in operand order. Compressed or decompressed
/// depending on `BLOSC_LOW_MEM`.
pub enum PrefetchedChunk {
    Compressed(usize, Vec<Vec<u8>>),
    Decompressed(usize, Vec<Vec<u8>>),
}

/// A source of compressed chunk bytes for one operand, as needed by the
/// prefetch pipeline. Implemented by `SChunk` and by `Proxy`.
pub trait ChunkSource: Send + Sync {
    fn get_chunk(&self, nchunk: usize) -> Result<Vec<u8>>;
}

/// The bounded producer/consumer prefetch pipeline: a single
/// background OS thread fetches every operand's `nchunk`-th chunk and
/// enqueues them in row-major order onto a depth-2 bounded channel; the
/// evaluator drains it in order. Parallel across operands, sequential
/// across chunks; the channel provides backpressure.
pub struct PrefetchPipeline {
    rx: crossbeam_channel::Receiver<PrefetchedChunk>,
    handle: Option<JoinHandle<()>>,
}

impl PrefetchPipeline {
    pub fn spawn(sources: Vec<Arc<dyn ChunkSource>>, nchunks: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(2);
        let low_mem = crate::config::low_mem_prefetch();
        debug!(
            "spawning prefetch pipeline over {} operands, {} chunks, low_mem={}",
            sources.len(),
            nchunks,
            low_mem
        );
        let handle = std::thread::spawn(move || {
            for n in 0..nchunks {
                let mut chunks = Vec::with_capacity(sources.len());
                let mut failed = false;
                for src in sources.iter() {
                    match src.get_chunk(n) {
                        Ok(bytes) => chunks.push(bytes),
                        Err(_) => {
                            failed = true;
                            break;
                        }
                    }
                }
                if failed {
                    break;
                }
                let item = if low_mem {
                    PrefetchedChunk::Compressed(n, chunks)
                } else {
                    let decoded: Result<Vec<Vec<u8>>> =
                        chunks.iter().map(|c| decompress_chunk(c)).collect();
                    match decoded {
                        Ok(d) => PrefetchedChunk::Decompressed(n, d),
                        Err(_) => break,
                    }
                };
                if tx.send(item).is_err() {
                    break;
                }
            }
        });
        Self {
            rx,
            handle: Some(handle),
        }
    }

    /// Blocks until the next chunk arrives, or the producer has finished.
    pub fn recv(&self) -> Option<PrefetchedChunk> {
        self.rx.recv().ok()
    }
}

impl Drop for PrefetchPipeline {
    fn drop(&mut self) {
        // Dropping `rx` (implicitly, as the receiver side of the channel is
        // owned by `self`) unblocks a producer stuck on `send`; join it so
        // the background thread never outlives its pipeline.
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_special_value_roundtrip() {
        for sv in [
            SpecialValue::NotSpecial,
            SpecialValue::Zero,
            SpecialValue::Nan,
            SpecialValue::Value,
            SpecialValue::Uninit,
        ] {
            let h = ChunkHeader::placeholder(sv, 128);
            assert_eq!(h.special(), sv);
        }
    }

    #[test]
    fn compress_decompress_roundtrip() {
        let data = vec![0u8; 4096];
        let cparams = CParams::default();
        let compressed = compress_chunk(&data, &cparams).unwrap();
        let decompressed = decompress_chunk(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }
}
