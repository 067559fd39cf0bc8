// SPDX-License-Identifier: MIT OR Apache-2.0

//! Locate the image-context token run inside a prompt.

use std::ops::Range;

use crate::error::{LensError, Result};

/// Contiguous run of image-context tokens in a token sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTokenSpan {
    /// Index of the first image-context token.
    pub start: usize,
    /// Number of image-context tokens (tiles × tokens per tile).
    pub len: usize,
}

impl ImageTokenSpan {
    /// One past the last position of the span.
    #[must_use]
    pub const fn end(self) -> usize {
        self.start + self.len
    }

    /// The span as a position range.
    #[must_use]
    pub const fn range(self) -> Range<usize> {
        self.start..self.end()
    }
}

/// Find the image-context run of length `expected` in `ids`.
///
/// The run starts at the first occurrence of `image_context_id`, and at
/// least `expected` occurrences must follow contiguously from there.
///
/// ```
/// use candle_vlm_lens::interp::alignment::locate_image_span;
///
/// let ids = [1, 2, 9, 9, 9, 3];
/// let span = locate_image_span(&ids, 9, 3).unwrap();
/// assert_eq!((span.start, span.len), (2, 3));
/// ```
///
/// # Errors
///
/// Returns [`LensError::Alignment`] if the marker is absent, if `expected`
/// is zero, or if fewer than `expected` contiguous markers are found.
pub fn locate_image_span(
    ids: &[u32],
    image_context_id: u32,
    expected: usize,
) -> Result<ImageTokenSpan> {
    if expected == 0 {
        return Err(LensError::Alignment(
            "expected image token count must be positive".into(),
        ));
    }
    let start = ids
        .iter()
        .position(|&id| id == image_context_id)
        .ok_or_else(|| {
            LensError::Alignment(format!(
                "image context token {image_context_id} not found in {} prompt tokens",
                ids.len()
            ))
        })?;

    let run = ids
        .get(start..)
        .unwrap_or_default()
        .iter()
        .take_while(|&&id| id == image_context_id)
        .count();
    if run < expected {
        return Err(LensError::Alignment(format!(
            "found {run} contiguous image context tokens at {start}, expected {expected}"
        )));
    }

    tracing::debug!(start, len = expected, run, "located image token span");
    Ok(ImageTokenSpan {
        start,
        len: expected,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
