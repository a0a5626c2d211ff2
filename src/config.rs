//! Global and per-array configuration.
//!
//! A plain-data struct plus a builder, mirroring the fields `blosc::Context`
//! actually forwards to the codec.

use std::sync::atomic::{AtomicUsize, Ordering};

pub use blosc::{Clevel, Compressor, ShuffleMode};

/// Filters applied before compression, in order. At most 6 may be chained;
/// only `Shuffle`/`Bitshuffle` are implemented by the codec boundary, the
/// rest are recognized but currently no-ops, treated as an opaque kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    NoFilter,
    Shuffle,
    Bitshuffle,
    Delta,
    TruncPrec,
    ByteDelta,
    NdCell,
    NdMean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    Always,
    Never,
    Auto,
    ForwardCompat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tuner {
    Stune,
    Btune,
}

/// Compression parameters for an `SChunk`.
#[derive(Debug, Clone)]
pub struct CParams {
    pub codec: Compressor,
    pub codec_meta: i32,
    pub clevel: Clevel,
    pub use_dict: bool,
    pub typesize: usize,
    pub nthreads: usize,
    /// 0 means "auto".
    pub blocksize: usize,
    pub splitmode: SplitMode,
    pub filters: Vec<Filter>,
    pub filters_meta: Vec<i32>,
    pub tuner: Tuner,
}

impl Default for CParams {
    fn default() -> Self {
        Self {
            codec: Compressor::BloscLZ,
            codec_meta: 0,
            clevel: Clevel::L5,
            use_dict: false,
            typesize: 8,
            nthreads: 1,
            blocksize: 0,
            splitmode: SplitMode::Auto,
            filters: vec![Filter::Shuffle],
            filters_meta: Vec::new(),
            tuner: Tuner::Stune,
        }
    }
}

impl CParams {
    /// The `ShuffleMode` the underlying codec should apply, derived from
    /// the filter list's leading byte/bit-shuffle entry (if any).
    pub fn shuffle_mode(&self) -> ShuffleMode {
        if self.filters.contains(&Filter::Bitshuffle) {
            ShuffleMode::Bit
        } else if self.filters.contains(&Filter::Shuffle) {
            ShuffleMode::Byte
        } else {
            ShuffleMode::None
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DParams {
    pub nthreads: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Read,
    Append,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapMode {
    Read,
    ReadWrite,
    Write,
    CopyOnWrite,
}

/// On-disk storage options. `urlpath` is the only part of persistence
/// this crate defines end-to-end; container-format specifics are out of
/// scope.
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    pub contiguous: Option<bool>,
    pub urlpath: Option<std::path::PathBuf>,
    pub mode: Option<StorageMode>,
    pub mmap_mode: Option<MmapMode>,
    pub initial_mapping_size: Option<usize>,
    pub meta: std::collections::HashMap<String, serde_json::Value>,
}

impl StorageOptions {
    pub fn is_contiguous(&self) -> bool {
        self.contiguous.unwrap_or(self.urlpath.is_some())
    }
}

/// Process-wide mutable defaults: a context object threaded through the evaluator, with a
/// process-wide default retained for API convenience.
///
/// The `blosc` crate's safe `Context` builder (as used by the vendored
/// `BloscCodec`) exposes no `nthreads` knob, so `nthreads` here is
/// orchestration-layer state only: it sizes the prefetch pipeline's worker
/// count and forces `1` for UDF evaluation, but is never passed across the
/// codec FFI boundary. See DESIGN.md.
pub struct Context {
    pub cparams: CParams,
    pub dparams: DParams,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            cparams: CParams::default(),
            dparams: DParams::default(),
        }
    }
}

static GLOBAL_NTHREADS: AtomicUsize = AtomicUsize::new(1);

/// Process-wide default thread count, read by newly-constructed `Context`s.
pub fn global_nthreads() -> usize {
    GLOBAL_NTHREADS.load(Ordering::Relaxed)
}

pub fn set_global_nthreads(n: usize) {
    GLOBAL_NTHREADS.store(n.max(1), Ordering::Relaxed);
}

/// `BLOSC_LOW_MEM`: keep prefetched chunks compressed, decompressing
/// only at consume time, trading throughput for working-set size.
pub fn low_mem_prefetch() -> bool {
    std::env::var("BLOSC_LOW_MEM")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}
