//! Partitioning: compute `(chunks, blocks)` from a shape, dtype,
//! and cache sizes; check alignment/"behavedness".
//!
//! Row-major chunk-index arithmetic for the coordinate math, plus a
//! cache-aware blocksize heuristic.

use crate::config::CParams;
use crate::error::{Error, Result};
use crate::GridCoord;

/// Stand-in for the engine's out-of-scope CPU-info probing: the cache
/// sizes the blocksize heuristic needs, without actually reading `/proc` or
/// `cpuid`. Conservative, typical desktop-class values.
#[derive(Debug, Clone, Copy)]
pub struct CacheSizes {
    pub l1_data: usize,
    pub l2: usize,
    pub l3: Option<usize>,
}

impl Default for CacheSizes {
    fn default() -> Self {
        Self {
            l1_data: 32 * 1024,
            l2: 256 * 1024,
            l3: Some(8 * 1024 * 1024),
        }
    }
}

impl CacheSizes {
    pub fn probe() -> Self {
        Self::default()
    }
}

const L3_MAX: usize = 64 * 1024 * 1024;
const MIN_CHUNKSIZE: usize = 1024 * 1024;
const MAX_CHUNKSIZE: usize = (1usize << 31) - 512; // 2^31 - OVERHEAD
/// Engine-wide typesize ceiling (spec §7 `ResourceExhausted`): the chunk
/// header's special-value tag and sizes are packed assuming `itemsize` fits
/// a single byte.
pub const MAX_TYPESIZE: usize = 255;
/// Engine-wide buffer-size ceiling for a single chunk, mirroring
/// `MAX_CHUNKSIZE`: user-supplied `chunks`/`blocks` bypass the heuristic
/// that otherwise keeps chunk buffers under this bound, so it's re-checked
/// here.
pub const MAX_BUFFERSIZE: usize = MAX_CHUNKSIZE;

/// Which clamp branch the blocksize heuristic took, recorded for
/// testability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlocksizeBranch {
    X86L2Half,
    AppleSiliconL1Half,
    Uncompressed,
}

fn current_arch_branch() -> BlocksizeBranch {
    if cfg!(all(target_arch = "aarch64", target_os = "macos")) {
        BlocksizeBranch::AppleSiliconL1Half
    } else {
        BlocksizeBranch::X86L2Half
    }
}

/// Greedy right-to-left divisor search: allocate trailing axes
/// first, choosing the largest divisor of the axis length that fits the
/// remaining budget, snapping to the nearest divisor when within a factor
/// of two.
pub fn compute_partition(nitems: usize, shape: &[u64], minpart: Option<&[u64]>) -> GridCoord {
    let mut out: Vec<u64> = vec![0; shape.len()];
    let mut remaining = nitems.max(1);

    for i in (0..shape.len()).rev() {
        let axis_len = shape[i].max(1);
        let min_i = minpart.map(|m| m[i]).unwrap_or(1).max(1);

        if axis_len <= 1 {
            out[i] = 1;
            continue;
        }

        let budget = remaining.max(1) as u64;
        let mut best = min_i.min(axis_len);
        let mut d = 1u64;
        while d <= axis_len {
            if axis_len % d == 0 && d <= budget && d >= min_i {
                best = d;
            }
            d += 1;
        }
        // Snap up to the true axis length if we're within a factor of two
        // and it still respects the budget; favors whole-axis chunks.
        if best * 2 >= axis_len.min(budget.max(best)) && axis_len <= budget * 2 {
            best = best.max(axis_len.min(budget));
        }
        out[i] = best.max(1);
        remaining = (remaining / (out[i] as usize).max(1)).max(1);
    }

    out.into_iter().collect()
}

/// `compute_chunks_blocks`.
pub fn compute_chunks_blocks(
    shape: &[u64],
    chunks: Option<&[u64]>,
    blocks: Option<&[u64]>,
    itemsize: usize,
    cparams: &CParams,
    cache: CacheSizes,
) -> Result<(GridCoord, GridCoord)> {
    let ndim = shape.len();

    if itemsize == 0 || itemsize > MAX_TYPESIZE {
        return Err(Error::ResourceExhausted(format!(
            "typesize {} outside [1, {}]",
            itemsize, MAX_TYPESIZE
        )));
    }

    if shape.iter().any(|&s| s == 0) {
        let ones: GridCoord = std::iter::repeat(1u64).take(ndim).collect();
        return Ok((ones.clone(), ones));
    }

    if let (Some(c), Some(b)) = (chunks, blocks) {
        validate_partition(shape, c, b)?;
        let buffer_bytes = c.iter().product::<u64>() as usize * itemsize;
        if buffer_bytes > MAX_BUFFERSIZE {
            return Err(Error::ResourceExhausted(format!(
                "chunk buffer of {} bytes exceeds MAX_BUFFERSIZE ({})",
                buffer_bytes, MAX_BUFFERSIZE
            )));
        }
        return Ok((c.iter().copied().collect(), b.iter().copied().collect()));
    }
    if let Some(c) = chunks {
        if c.len() != ndim {
            return Err(Error::InvalidShape(
                "chunks rank does not match shape rank".into(),
            ));
        }
    }
    if let Some(b) = blocks {
        if b.len() != ndim {
            return Err(Error::InvalidShape(
                "blocks rank does not match shape rank".into(),
            ));
        }
    }

    let branch = current_arch_branch();

    // Step 3: hint blocksize from an ~8MiB synthetic all-zero compression.
    let hint_bytes = 8 * 1024 * 1024usize;
    let mut hint_cparams = cparams.clone();
    hint_cparams.filters.retain(|f| {
        matches!(f, crate::config::Filter::Shuffle | crate::config::Filter::Bitshuffle)
    });
    let zeros = vec![0u8; hint_bytes];
    let compressed = crate::chunk::compress_chunk(&zeros, &hint_cparams)?;
    let header = crate::chunk::ChunkHeader::from_bytes(&compressed)?;
    let mut blocksize = u32::from_le_bytes(header.0[4..8].try_into().unwrap()) as usize;
    if blocksize == 0 {
        blocksize = hint_bytes;
    }

    blocksize = match (branch, cparams.clevel) {
        (_, blosc::Clevel::None) => blocksize, // uncompressed: bandwidth-bound, use max directly
        (BlocksizeBranch::X86L2Half, _) => blocksize.min(cache.l2 / 2),
        (BlocksizeBranch::AppleSiliconL1Half, _) => blocksize.min(cache.l1_data / 2),
        (BlocksizeBranch::Uncompressed, _) => blocksize,
    };
    blocksize = blocksize.max(itemsize);

    // Step 4: derive chunksize from blocksize + cache geometry.
    let mut chunksize = blocksize;
    if blocksize.saturating_mul(32) <= L3_MAX {
        chunksize = blocksize * 32;
    }
    if let Some(l3) = cache.l3 {
        if l3 > cache.l2 && l3 > chunksize {
            chunksize = l3;
        }
    }
    chunksize = chunksize.max(cache.l2);
    chunksize /= 4; // three operands + one result co-resident
    chunksize = chunksize.max(MIN_CHUNKSIZE).min(MAX_CHUNKSIZE);

    let computed_blocks = blocks
        .map(|b| b.iter().copied().collect())
        .unwrap_or_else(|| {
            let max_nitems = (blocksize / itemsize.max(1)).max(1);
            let maxshape: Vec<u64> = match chunks {
                Some(c) => shape.iter().zip(c).map(|(&s, &c)| s.min(c)).collect(),
                None => shape.to_vec(),
            };
            compute_partition(max_nitems, &maxshape, None)
        });

    let computed_chunks = chunks.map(|c| c.iter().copied().collect()).unwrap_or_else(|| {
        let max_nitems = (chunksize / itemsize.max(1)).max(1);
        compute_partition(max_nitems, shape, Some(computed_blocks.as_slice()))
    });

    validate_partition(shape, &computed_chunks, &computed_blocks)?;
    Ok((computed_chunks, computed_blocks))
}

fn validate_partition(shape: &[u64], chunks: &[u64], blocks: &[u64]) -> Result<()> {
    if shape.len() != chunks.len() || shape.len() != blocks.len() {
        return Err(Error::InvalidShape("rank mismatch".into()));
    }
    for i in 0..shape.len() {
        if chunks[i] == 0 || blocks[i] == 0 {
            return Err(Error::InvalidShape("zero-sized partition".into()));
        }
        if blocks[i] > chunks[i] {
            return Err(Error::InvalidShape("blocks > chunks".into()));
        }
        if shape[i] == 1 && (chunks[i] > 1 || blocks[i] > 1) {
            return Err(Error::InvalidShape(
                "chunks/blocks > shape on a length-1 axis".into(),
            ));
        }
    }
    Ok(())
}

/// *Aligned*: every chunk has an integer number of whole blocks along every
/// axis that is not the array's last (possibly short) chunk.
pub fn are_partitions_aligned(shape: &[u64], chunks: &[u64], blocks: &[u64]) -> bool {
    (0..shape.len()).all(|i| {
        let n_full_chunks = shape[i] / chunks[i].max(1);
        let full_len = n_full_chunks * chunks[i];
        full_len == shape[i] || chunks[i] % blocks[i].max(1) == 0
    })
}

/// *Behaved*: aligned, and every chunk is a whole number of chunks in the
/// total shape (no padding on the last chunk).
pub fn are_partitions_behaved(shape: &[u64], chunks: &[u64], blocks: &[u64]) -> bool {
    are_partitions_aligned(shape, chunks, blocks)
        && (0..shape.len()).all(|i| shape[i] % chunks[i].max(1) == 0)
}

/// Per-axis chunk counts and total chunk count `N`.
pub fn get_chunks_idx(shape: &[u64], chunks: &[u64]) -> (GridCoord, usize) {
    let counts: GridCoord = shape
        .iter()
        .zip(chunks.iter())
        .map(|(&s, &c)| if c == 0 { 0 } else { s.div_ceil(c) })
        .collect();
    let n = counts.iter().product::<u64>() as usize;
    (counts, n)
}

/// Row-major unraveling of a linear chunk index into per-axis chunk
/// coordinates, given per-axis chunk counts.
pub fn unravel_chunk_index(nchunk: usize, counts: &[u64]) -> GridCoord {
    let mut idx = nchunk as u64;
    let mut coord = vec![0u64; counts.len()];
    for i in (0..counts.len()).rev() {
        let c = counts[i].max(1);
        coord[i] = idx % c;
        idx /= c;
    }
    coord.into_iter().collect()
}

/// A chunk's i-axis slab: `[c_i * chunks[i], min((c_i+1) * chunks[i], shape[i]))`.
pub fn chunk_slab(coord: &[u64], shape: &[u64], chunks: &[u64]) -> Vec<(u64, u64)> {
    coord
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let start = c * chunks[i];
            let end = (start + chunks[i]).min(shape[i]);
            (start, end)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_dim_shape_returns_ones() {
        let cparams = CParams::default();
        let (chunks, blocks) =
            compute_chunks_blocks(&[0, 10], None, None, 8, &cparams, CacheSizes::default())
                .unwrap();
        assert_eq!(chunks.as_slice(), &[1, 1]);
        assert_eq!(blocks.as_slice(), &[1, 1]);
    }

    #[test]
    fn explicit_partition_is_validated_and_returned() {
        let cparams = CParams::default();
        let (chunks, blocks) = compute_chunks_blocks(
            &[100, 100],
            Some(&[10, 10]),
            Some(&[5, 5]),
            8,
            &cparams,
            CacheSizes::default(),
        )
        .unwrap();
        assert_eq!(chunks.as_slice(), &[10, 10]);
        assert_eq!(blocks.as_slice(), &[5, 5]);
    }

    #[test]
    fn typesize_outside_range_is_resource_exhausted() {
        let cparams = CParams::default();
        let res = compute_chunks_blocks(&[10, 10], None, None, 0, &cparams, CacheSizes::default());
        assert!(matches!(res, Err(Error::ResourceExhausted(_))));
        let res =
            compute_chunks_blocks(&[10, 10], None, None, 256, &cparams, CacheSizes::default());
        assert!(matches!(res, Err(Error::ResourceExhausted(_))));
    }

    #[test]
    fn explicit_chunks_over_max_buffersize_is_resource_exhausted() {
        let cparams = CParams::default();
        // (2^28)^1 items * 16 bytes > 2^31 - OVERHEAD.
        let huge = 1u64 << 28;
        let res = compute_chunks_blocks(
            &[huge],
            Some(&[huge]),
            Some(&[huge]),
            16,
            &cparams,
            CacheSizes::default(),
        );
        assert!(matches!(res, Err(Error::ResourceExhausted(_))));
    }

    #[test]
    fn blocks_exceeding_chunks_is_an_error() {
        let cparams = CParams::default();
        let res = compute_chunks_blocks(
            &[100, 100],
            Some(&[10, 10]),
            Some(&[20, 5]),
            8,
            &cparams,
            CacheSizes::default(),
        );
        assert!(res.is_err());
    }

    #[test]
    fn partition_monotonicity() {
        let cparams = CParams::default();
        let (chunks, blocks) = compute_chunks_blocks(
            &[3000, 4000],
            None,
            None,
            8,
            &cparams,
            CacheSizes::default(),
        )
        .unwrap();
        for i in 0..2 {
            assert!(blocks[i] <= chunks[i]);
            assert!(chunks[i] <= 3000u64.max(4000));
        }
    }

    #[test]
    fn behaved_implies_aligned() {
        let shape = [100u64, 100];
        let chunks = [10u64, 10];
        let blocks = [5u64, 5];
        if are_partitions_behaved(&shape, &chunks, &blocks) {
            assert!(are_partitions_aligned(&shape, &chunks, &blocks));
        }
    }

    #[test]
    fn chunk_index_roundtrips_through_unravel() {
        let shape = [23u64, 17];
        let chunks = [10u64, 10];
        let (counts, n) = get_chunks_idx(&shape, &chunks);
        for nchunk in 0..n {
            let coord = unravel_chunk_index(nchunk, counts.as_slice());
            let slab = chunk_slab(coord.as_slice(), &shape, &chunks);
            assert!(slab.iter().all(|&(s, e)| s < e));
        }
    }
}
