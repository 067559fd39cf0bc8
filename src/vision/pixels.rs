// SPDX-License-Identifier: MIT OR Apache-2.0

//! Image decoding and normalisation into the tensor the vision tower consumes.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};

use super::tiling::{TileGrid, TilingParams, dynamic_preprocess};
use crate::error::{LensError, Result};

/// Per-channel mean used by the InternViT image processor (ImageNet).
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Per-channel standard deviation used by the InternViT image processor (ImageNet).
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decode an image file and convert it to RGB.
///
/// # Errors
///
/// Returns [`LensError::Decode`] if the file cannot be opened or decoded.
pub fn load_image(path: impl AsRef<Path>) -> Result<DynamicImage> {
    let path = path.as_ref();
    let image = image::open(path)
        .map_err(|e| LensError::Decode(format!("{}: {e}", path.display())))?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

/// Normalised image tiles ready for the vision tower.
///
/// # Shapes
/// - `pixels`: `[tiles, 3, tile_size, tile_size]` (channels first)
///
/// All tiles share the same spatial size. The tile count is the grid's
/// `cols * rows`, plus one when a thumbnail was appended.
#[derive(Debug, Clone)]
pub struct PixelBatch {
    /// Stacked tiles.
    pixels: Tensor,
    /// Grid the tiles were cut from.
    grid: TileGrid,
    /// Whether the last tile is a whole-image thumbnail.
    has_thumbnail: bool,
}

impl PixelBatch {
    /// Normalise `tiles` with ImageNet statistics and stack them.
    ///
    /// Tiles whose size differs from `tile_size` are resized (bicubic).
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Shape`] if `tiles` is empty, and
    /// [`LensError::Model`] if the tensor cannot be built on `device`.
    pub fn from_tiles(
        tiles: &[RgbImage],
        tile_size: u32,
        grid: TileGrid,
        has_thumbnail: bool,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if tiles.is_empty() {
            return Err(LensError::Shape("pixel batch needs at least one tile".into()));
        }
        let side = usize::try_from(tile_size)
            .map_err(|_| LensError::Config(format!("tile_size {tile_size} overflows usize")))?;
        let plane = side * side;

        let mut data = Vec::with_capacity(tiles.len() * 3 * plane);
        for tile in tiles {
            let resized;
            let tile = if tile.dimensions() == (tile_size, tile_size) {
                tile
            } else {
                resized = imageops::resize(tile, tile_size, tile_size, FilterType::CatmullRom);
                &resized
            };
            normalize_into(tile, &mut data);
        }

        let pixels = Tensor::from_vec(data, (tiles.len(), 3, side, side), device)?
            .to_dtype(dtype)?;
        Ok(Self {
            pixels,
            grid,
            has_thumbnail,
        })
    }

    /// The stacked pixel tensor, `[tiles, 3, tile_size, tile_size]`.
    #[must_use]
    pub const fn pixels(&self) -> &Tensor {
        &self.pixels
    }

    /// Number of tiles, thumbnail included.
    #[must_use]
    pub fn num_tiles(&self) -> usize {
        self.pixels.dims().first().copied().unwrap_or(0)
    }

    /// Grid the tiles were cut from.
    #[must_use]
    pub const fn grid(&self) -> TileGrid {
        self.grid
    }

    /// Whether the last tile is a whole-image thumbnail.
    #[must_use]
    pub const fn has_thumbnail(&self) -> bool {
        self.has_thumbnail
    }
}

/// Append one tile's CHW-ordered, normalised values to `out`.
fn normalize_into(tile: &RgbImage, out: &mut Vec<f32>) {
    for (c, (mean, std)) in IMAGENET_MEAN.iter().zip(IMAGENET_STD.iter()).enumerate() {
        out.extend(
            tile.pixels()
                .map(|px| (f32::from(px.0.get(c).copied().unwrap_or(0)) / 255.0 - mean) / std),
        );
    }
}

/// Tile an image and normalise the tiles into a [`PixelBatch`].
///
/// # Errors
///
/// Propagates tiling and tensor construction errors.
pub fn pixel_batch_from_image(
    image: &DynamicImage,
    params: &TilingParams,
    device: &Device,
    dtype: DType,
) -> Result<PixelBatch> {
    let tiled = dynamic_preprocess(image, params)?;
    PixelBatch::from_tiles(
        &tiled.tiles,
        params.tile_size,
        tiled.grid,
        tiled.has_thumbnail,
        device,
        dtype,
    )
}

/// Decode an image file, tile it and normalise the tiles.
///
/// # Errors
///
/// Returns [`LensError::Decode`] if the file cannot be decoded, and
/// propagates tiling and tensor construction errors.
pub fn load_pixel_batch(
    path: impl AsRef<Path>,
    params: &TilingParams,
    device: &Device,
    dtype: DType,
) -> Result<PixelBatch> {
    let image = load_image(path)?;
    pixel_batch_from_image(&image, params, device, dtype)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
