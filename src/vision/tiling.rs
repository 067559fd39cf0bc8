// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dynamic tiling: split an image into a grid of fixed-size square tiles.
//!
//! The grid is the (cols × rows) factorisation, with a tile count inside
//! `[min_tiles, max_tiles]`, whose aspect ratio is closest to the image's.
//! The image is resized to exactly cover the grid and cropped row-major.

use std::collections::BTreeSet;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, RgbImage};
use serde::Deserialize;

use crate::error::{LensError, Result};

/// Parameters of the dynamic tiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TilingParams {
    /// Tile edge in pixels.
    pub tile_size: u32,
    /// Minimum number of grid tiles.
    pub min_tiles: u32,
    /// Maximum number of grid tiles.
    pub max_tiles: u32,
    /// Append a whole-image thumbnail tile when more than one tile is cut.
    pub use_thumbnail: bool,
}

impl Default for TilingParams {
    fn default() -> Self {
        Self {
            tile_size: 448,
            min_tiles: 1,
            max_tiles: 12,
            use_thumbnail: false,
        }
    }
}

/// A tiling grid: `cols` tiles across, `rows` tiles down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileGrid {
    /// Tiles along the width.
    pub cols: u32,
    /// Tiles along the height.
    pub rows: u32,
}

impl TileGrid {
    /// Number of grid tiles (`cols * rows`).
    #[must_use]
    pub const fn count(self) -> u32 {
        self.cols * self.rows
    }

    /// Width-over-height ratio of the grid.
    #[must_use]
    pub fn aspect_ratio(self) -> f64 {
        f64::from(self.cols) / f64::from(self.rows)
    }
}

/// Output of [`dynamic_preprocess`].
#[derive(Debug, Clone)]
pub struct TiledImage {
    /// Grid tiles in row-major order, followed by the thumbnail if any.
    pub tiles: Vec<RgbImage>,
    /// The selected grid.
    pub grid: TileGrid,
    /// Whether the last tile is a thumbnail.
    pub has_thumbnail: bool,
}

impl TiledImage {
    /// Total number of tiles, thumbnail included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    /// Whether no tiles were produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

/// Every grid whose tile count lies in `[min_tiles, max_tiles]`,
/// ordered by tile count and then by `(cols, rows)`.
#[must_use]
pub fn target_ratios(min_tiles: u32, max_tiles: u32) -> Vec<TileGrid> {
    let mut set = BTreeSet::new();
    for cols in 1..=max_tiles {
        for rows in 1..=max_tiles {
            let n = cols * rows;
            if n >= min_tiles && n <= max_tiles {
                set.insert((cols, rows));
            }
        }
    }
    let mut grids: Vec<TileGrid> = set
        .into_iter()
        .map(|(cols, rows)| TileGrid { cols, rows })
        .collect();
    // Stable: keeps (cols, rows) order within equal counts.
    grids.sort_by_key(|g| g.count());
    grids
}

/// Pick the grid whose aspect ratio is closest to `aspect_ratio`.
///
/// On an exact tie the later (larger) grid wins if the image area exceeds
/// half the area the grid would cover at `tile_size`. Falls back to 1×1
/// when `ratios` is empty.
#[must_use]
pub fn find_closest_aspect_ratio(
    aspect_ratio: f64,
    ratios: &[TileGrid],
    width: u32,
    height: u32,
    tile_size: u32,
) -> TileGrid {
    let mut best = TileGrid { cols: 1, rows: 1 };
    let mut best_diff = f64::INFINITY;
    let area = f64::from(width) * f64::from(height);
    let tile_area = f64::from(tile_size) * f64::from(tile_size);

    for &grid in ratios {
        let diff = (aspect_ratio - grid.aspect_ratio()).abs();
        if diff < best_diff {
            best_diff = diff;
            best = grid;
        } else if (diff - best_diff).abs() < f64::EPSILON
            && area > 0.5 * tile_area * f64::from(grid.count())
        {
            best = grid;
        }
    }
    best
}

/// Split `image` into the closest-aspect-ratio grid of square tiles.
///
/// # Errors
///
/// Returns [`LensError::Config`] for a zero tile size or an empty/inverted
/// tile range, and [`LensError::Decode`] for a zero-sized image.
pub fn dynamic_preprocess(image: &DynamicImage, params: &TilingParams) -> Result<TiledImage> {
    if params.tile_size == 0 {
        return Err(LensError::Config("tile_size must be positive".into()));
    }
    if params.min_tiles == 0 || params.min_tiles > params.max_tiles {
        return Err(LensError::Config(format!(
            "invalid tile range [{}, {}]",
            params.min_tiles, params.max_tiles
        )));
    }

    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(LensError::Decode(format!(
            "image has zero extent ({width}x{height})"
        )));
    }
    let aspect_ratio = f64::from(width) / f64::from(height);

    let ratios = target_ratios(params.min_tiles, params.max_tiles);
    let grid = find_closest_aspect_ratio(aspect_ratio, &ratios, width, height, params.tile_size);

    let tile = params.tile_size;
    let rgb = image.to_rgb8();
    let resized = imageops::resize(&rgb, grid.cols * tile, grid.rows * tile, FilterType::CatmullRom);

    let mut tiles = Vec::with_capacity(usize::try_from(grid.count()).unwrap_or(0) + 1);
    for i in 0..grid.count() {
        let x = (i % grid.cols) * tile;
        let y = (i / grid.cols) * tile;
        tiles.push(imageops::crop_imm(&resized, x, y, tile, tile).to_image());
    }

    let has_thumbnail = params.use_thumbnail && tiles.len() != 1;
    if has_thumbnail {
        tiles.push(imageops::resize(&rgb, tile, tile, FilterType::CatmullRom));
    }

    tracing::debug!(
        cols = grid.cols,
        rows = grid.rows,
        tiles = tiles.len(),
        has_thumbnail,
        "tiled image {width}x{height}"
    );

    Ok(TiledImage {
        tiles,
        grid,
        has_thumbnail,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
