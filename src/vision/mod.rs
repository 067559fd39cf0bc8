// SPDX-License-Identifier: MIT OR Apache-2.0

//! Image tiling and pixel normalisation.
//!
//! - [`tiling`]: closest-aspect-ratio grid search and row-major cropping.
//! - [`pixels`]: image decoding and ImageNet normalisation into a
//!   [`PixelBatch`](pixels::PixelBatch).

pub mod pixels;
pub mod tiling;
