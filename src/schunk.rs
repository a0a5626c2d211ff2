//! `SChunk`: an ordered sequence of independently compressed chunks
//! sharing a `typesize`, `chunksize`, and compression-parameter set, plus
//! `vlmeta` (variable-length metadata persisted alongside).
//!
//! Generalizes a store-backed chunk read/write pattern from per-file chunk
//! keys to a single in-process chunk vector, keeping the same "index of
//! chunks" bookkeeping idiom.

use std::collections::HashMap;
use std::sync::RwLock;

use log::trace;

use crate::chunk::{self, ChunkHeader, SpecialValue};
use crate::config::CParams;
use crate::error::{Error, Result};

/// A single slot in the super-chunk: either real compressed bytes, or one
/// of the special tags that lets the engine skip decompression entirely.
#[derive(Debug, Clone)]
enum Slot {
    Compressed(Vec<u8>),
    Special(SpecialValue),
}

pub struct SChunk {
    typesize: usize,
    /// Logical (decompressed) byte length of a full chunk.
    chunksize: usize,
    cparams: CParams,
    slots: RwLock<Vec<Slot>>,
    vlmeta: RwLock<HashMap<String, serde_json::Value>>,
}

impl SChunk {
    pub fn new(n: usize, typesize: usize, chunksize: usize, cparams: CParams) -> Self {
        Self {
            typesize,
            chunksize,
            cparams,
            slots: RwLock::new(vec![Slot::Special(SpecialValue::Uninit); 0]
                .into_iter()
                .chain(std::iter::repeat(Slot::Special(SpecialValue::Uninit)).take(n))
                .collect()),
            vlmeta: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn typesize(&self) -> usize {
        self.typesize
    }

    pub fn chunksize(&self) -> usize {
        self.chunksize
    }

    pub fn cparams(&self) -> &CParams {
        &self.cparams
    }

    /// `get_lazychunk`: the special-value tag without touching payload.
    pub fn special(&self, nchunk: usize) -> Result<SpecialValue> {
        let slots = self.slots.read().unwrap();
        match slots.get(nchunk) {
            Some(Slot::Special(s)) => Ok(*s),
            Some(Slot::Compressed(_)) => Ok(SpecialValue::NotSpecial),
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such chunk {nchunk}"),
            ))),
        }
    }

    /// `get_chunk`: compressed bytes, as stored.
    pub fn get_chunk(&self, nchunk: usize) -> Result<Vec<u8>> {
        let slots = self.slots.read().unwrap();
        match slots.get(nchunk) {
            Some(Slot::Compressed(b)) => Ok(b.clone()),
            Some(Slot::Special(SpecialValue::Zero)) => Ok(Vec::new()),
            Some(Slot::Special(s)) => {
                let mut h = ChunkHeader::placeholder(*s, self.chunksize as u32);
                Ok(h.0.to_vec())
            }
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such chunk {nchunk}"),
            ))),
        }
    }

    /// `decompress_chunk`: full decompressed payload.
    ///
    /// The special-zero fast path is handled by callers inspecting
    /// `special()` first; this always materializes (returning a
    /// zero-filled buffer for a `Zero` chunk).
    pub fn decompress_chunk(&self, nchunk: usize) -> Result<Vec<u8>> {
        let slots = self.slots.read().unwrap();
        match slots.get(nchunk) {
            Some(Slot::Compressed(b)) => chunk::decompress_chunk(b),
            Some(Slot::Special(SpecialValue::Zero)) => Ok(vec![0u8; self.chunksize]),
            Some(Slot::Special(_)) => Ok(vec![0u8; self.chunksize]),
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such chunk {nchunk}"),
            ))),
        }
    }

    /// `update_chunk`: replace a whole chunk with already-compressed bytes.
    pub fn update_chunk(&self, nchunk: usize, compressed: Vec<u8>) -> Result<()> {
        let mut slots = self.slots.write().unwrap();
        let slot = slots
            .get_mut(nchunk)
            .ok_or_else(|| Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such chunk {nchunk}"),
            )))?;
        *slot = Slot::Compressed(compressed);
        Ok(())
    }

    /// `update_data`: replace a whole chunk given decompressed bytes,
    /// compressing via the super-chunk's cparams. Detects all-zero buffers
    /// and stores the cheaper `Zero` special tag instead of compressing.
    pub fn update_data(&self, nchunk: usize, decoded: &[u8]) -> Result<()> {
        if decoded.iter().all(|&b| b == 0) {
            trace!("chunk {nchunk} is all-zero, storing as special Zero tag");
            let mut slots = self.slots.write().unwrap();
            if let Some(slot) = slots.get_mut(nchunk) {
                *slot = Slot::Special(SpecialValue::Zero);
            }
            return Ok(());
        }
        let compressed = chunk::compress_chunk(decoded, &self.cparams)?;
        self.update_chunk(nchunk, compressed)
    }

    pub fn set_vlmeta(&self, key: impl Into<String>, value: serde_json::Value) {
        self.vlmeta.write().unwrap().insert(key.into(), value);
    }

    pub fn get_vlmeta(&self, key: &str) -> Option<serde_json::Value> {
        self.vlmeta.read().unwrap().get(key).cloned()
    }

    pub fn vlmeta_snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.vlmeta.read().unwrap().clone()
    }
}

impl crate::chunk::ChunkSource for SChunk {
    fn get_chunk(&self, nchunk: usize) -> Result<Vec<u8>> {
        SChunk::get_chunk(self, nchunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_chunks_start_uninit() {
        let sc = SChunk::new(4, 8, 1024, CParams::default());
        for i in 0..4 {
            assert_eq!(sc.special(i).unwrap(), SpecialValue::Uninit);
        }
    }

    #[test]
    fn zero_buffer_stores_as_special_zero() {
        let sc = SChunk::new(1, 8, 64, CParams::default());
        sc.update_data(0, &vec![0u8; 64]).unwrap();
        assert_eq!(sc.special(0).unwrap(), SpecialValue::Zero);
        assert_eq!(sc.decompress_chunk(0).unwrap(), vec![0u8; 64]);
    }

    #[test]
    fn nonzero_buffer_roundtrips() {
        let sc = SChunk::new(1, 8, 64, CParams::default());
        let data: Vec<u8> = (0..64).map(|i| i as u8).collect();
        sc.update_data(0, &data).unwrap();
        assert_eq!(sc.special(0).unwrap(), SpecialValue::NotSpecial);
        assert_eq!(sc.decompress_chunk(0).unwrap(), data);
    }

    #[test]
    fn vlmeta_roundtrips() {
        let sc = SChunk::new(0, 8, 64, CParams::default());
        sc.set_vlmeta("_LazyArray", serde_json::json!({"expression": "o0+o1"}));
        assert_eq!(
            sc.get_vlmeta("_LazyArray").unwrap()["expression"],
            "o0+o1"
        );
    }
}
