//! C1: PartPlanner — deterministic S3-style multipart layout (spec.md §4.1).
//!
//! Ported from `DANDIEtag.gen_part_sizes` in
//! `dandi/core/digests/dandietag.py`: base part size 64 MiB, bumped up if the
//! file would need more than 10,000 parts, then clamped to S3's [5 MiB, 5
//! GiB] allowed part-size range.

use crate::error::EngineError;

const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;
const TIB: u64 = 1 << 40;

const BASE_PART_SIZE: u64 = 64 * MIB;
const MAX_PARTS: u64 = 10_000;
const MIN_PART_SIZE: u64 = 5 * MIB;
const MAX_PART_SIZE: u64 = 5 * GIB;
const MAX_OBJECT_SIZE: u64 = 5 * TIB;

/// One 1-based part of a multipart layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    pub number: u32,
    pub offset: u64,
    pub size: u64,
}

/// The layout for a file of a given size (spec.md §3).
///
/// `uniform_part_size` is the size shared by every part but the last; when
/// `part_count <= 1` there is no "uniform" part in the usual sense, so it is
/// set equal to `final_part_size` (see spec.md's boundary rows for size 1 and
/// size 50 MiB, where the computed 64 MiB part size never surfaces).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartLayout {
    pub part_count: u32,
    pub uniform_part_size: u64,
    pub final_part_size: u64,
}

impl PartLayout {
    pub fn total_size(&self) -> u64 {
        if self.part_count == 0 {
            0
        } else {
            self.uniform_part_size * u64::from(self.part_count - 1) + self.final_part_size
        }
    }

    /// Expand the layout into its ordered, non-overlapping `Part` sequence.
    pub fn parts(&self) -> Vec<Part> {
        let mut parts = Vec::with_capacity(self.part_count as usize);
        let mut offset = 0u64;
        for i in 0..self.part_count {
            let size = if i + 1 == self.part_count {
                self.final_part_size
            } else {
                self.uniform_part_size
            };
            parts.push(Part {
                number: i + 1,
                offset,
                size,
            });
            offset += size;
        }
        parts
    }
}

/// Compute the multipart layout for a file of `size` bytes.
///
/// Fails [`EngineError::SizeTooLarge`] for files over 5 TiB, matching the
/// original's `raise ValueError(...)` in `gen_part_sizes`.
pub fn plan(size: u64) -> Result<PartLayout, EngineError> {
    if size > MAX_OBJECT_SIZE {
        return Err(EngineError::SizeTooLarge { size });
    }
    if size == 0 {
        return Ok(PartLayout {
            part_count: 0,
            uniform_part_size: 0,
            final_part_size: 0,
        });
    }

    let mut part_size = BASE_PART_SIZE;
    if size.div_ceil(part_size) >= MAX_PARTS {
        part_size = size.div_ceil(MAX_PARTS);
    }
    part_size = part_size.clamp(MIN_PART_SIZE, MAX_PART_SIZE);

    let full_parts = size / part_size;
    let remainder = size % part_size;

    let (part_count, uniform_part_size, final_part_size) = if full_parts == 0 {
        // File smaller than one part: a single part holding the remainder.
        (1, remainder, remainder)
    } else if remainder > 0 {
        (full_parts as u32 + 1, part_size, remainder)
    } else {
        (full_parts as u32, part_size, part_size)
    };

    Ok(PartLayout {
        part_count,
        uniform_part_size,
        final_part_size,
    })
}
