//! Atlas geometry and slot addressing.
//!
//! The particle state atlas is a `width × height` texture grid carved into
//! square tiles of `tile_size × tile_size` texels. Tiles are numbered row-major:
//!
//! ```text
//!   tile % tiles_per_row ──►
//!  ┌────┬────┬────┬────┐
//!  │ 0  │ 1  │ 2  │ 3  │   each cell is S×S texels,
//!  ├────┼────┼────┼────┤   one particle per texel
//!  │ 4  │ 5  │ 6  │ 7  │
//!  └────┴────┴────┴────┘
//! ```
//!
//! A particle slot is addressed by `(tile, sub_x, sub_y)`. The CPU uses
//! [`AtlasLayout::slot_texel`] when it builds spawn records and the GPU uses the
//! WGSL emitted by [`AtlasLayout::to_wgsl`] when it simulates. Both are the same
//! integer arithmetic, so the two sides can never disagree about where a
//! particle lives.

use glam::UVec2;

use crate::config::AtlasConfig;
use crate::error::ConfigError;

/// Bytes of GPU state per particle slot: two position copies, two velocity
/// copies, one render-attribute texel and one simulation-attribute texel, all
/// `Rgba32Float`.
pub const BYTES_PER_PARTICLE: u64 = 6 * 16;

/// Validated atlas geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AtlasLayout {
    width: u32,
    height: u32,
    tile_size: u32,
    tiles_per_row: u32,
    tiles_per_column: u32,
}

impl AtlasLayout {
    /// Build a layout, rejecting geometry that cannot be tiled exactly.
    pub fn new(config: AtlasConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            width: config.width,
            height: config.height,
            tile_size: config.tile_size,
            tiles_per_row: config.width / config.tile_size,
            tiles_per_column: config.height / config.tile_size,
        })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    #[inline]
    pub fn tiles_per_row(&self) -> u32 {
        self.tiles_per_row
    }

    /// Total number of tiles in the atlas.
    #[inline]
    pub fn tile_count(&self) -> u32 {
        self.tiles_per_row * self.tiles_per_column
    }

    /// Particles held by one tile.
    #[inline]
    pub fn particles_per_tile(&self) -> u32 {
        self.tile_size * self.tile_size
    }

    /// Particles held by the whole atlas.
    #[inline]
    pub fn particle_capacity(&self) -> u64 {
        self.tile_count() as u64 * self.particles_per_tile() as u64
    }

    /// Bytes of particle state backing one tile.
    #[inline]
    pub fn bytes_per_tile(&self) -> u64 {
        self.particles_per_tile() as u64 * BYTES_PER_PARTICLE
    }

    /// Number of tiles that fit under a memory ceiling.
    pub fn tiles_within(&self, ceiling_bytes: u64) -> u32 {
        (ceiling_bytes / self.bytes_per_tile()).min(self.tile_count() as u64) as u32
    }

    /// Texel of the top-left slot of a tile.
    #[inline]
    pub fn tile_origin(&self, tile: u32) -> UVec2 {
        debug_assert!(tile < self.tile_count(), "tile {} out of range", tile);
        UVec2::new(
            (tile % self.tiles_per_row) * self.tile_size,
            (tile / self.tiles_per_row) * self.tile_size,
        )
    }

    /// Texel address of slot `(sub_x, sub_y)` inside `tile`.
    #[inline]
    pub fn slot_texel(&self, tile: u32, sub_x: u32, sub_y: u32) -> UVec2 {
        debug_assert!(
            sub_x < self.tile_size && sub_y < self.tile_size,
            "sub-tile ({}, {}) outside tile of size {}",
            sub_x,
            sub_y,
            self.tile_size
        );
        self.tile_origin(tile) + UVec2::new(sub_x, sub_y)
    }

    /// Texel address of the `index`-th slot of `tile`, filling row by row.
    #[inline]
    pub fn slot_for_index(&self, tile: u32, index: u32) -> UVec2 {
        debug_assert!(index < self.particles_per_tile());
        self.slot_texel(tile, index % self.tile_size, index / self.tile_size)
    }

    /// Inverse of [`slot_texel`](Self::slot_texel).
    pub fn texel_to_slot(&self, texel: UVec2) -> (u32, u32, u32) {
        let tile = (texel.y / self.tile_size) * self.tiles_per_row + texel.x / self.tile_size;
        (tile, texel.x % self.tile_size, texel.y % self.tile_size)
    }

    /// WGSL constants and addressing helpers matching [`slot_texel`](Self::slot_texel).
    pub fn to_wgsl(&self) -> String {
        format!(
            r#"
const TILE_SIZE: u32 = {tile_size}u;
const PARTICLES_PER_TILE: u32 = {per_tile}u;
const TILES_PER_ROW: u32 = {tiles_per_row}u;

fn tile_origin(tile: u32) -> vec2<u32> {{
    return vec2<u32>((tile % TILES_PER_ROW) * TILE_SIZE, (tile / TILES_PER_ROW) * TILE_SIZE);
}}

fn slot_texel(tile: u32, sub_x: u32, sub_y: u32) -> vec2<u32> {{
    return tile_origin(tile) + vec2<u32>(sub_x, sub_y);
}}

fn slot_for_index(tile: u32, index: u32) -> vec2<u32> {{
    return slot_texel(tile, index % TILE_SIZE, index / TILE_SIZE);
}}

fn pack_texel(texel: vec2<u32>) -> u32 {{
    return texel.x | (texel.y << 16u);
}}
"#,
            tile_size = self.tile_size,
            per_tile = self.particles_per_tile(),
            tiles_per_row = self.tiles_per_row,
        )
    }
}

/// Pack a texel address into one `u32` (`x | y << 16`), the sorted index format.
#[inline]
pub fn pack_texel(texel: UVec2) -> u32 {
    debug_assert!(texel.x <= 0xFFFF && texel.y <= 0xFFFF);
    texel.x | (texel.y << 16)
}

/// Unpack a texel address produced by [`pack_texel`].
#[inline]
pub fn unpack_texel(packed: u32) -> UVec2 {
    UVec2::new(packed & 0xFFFF, packed >> 16)
}
