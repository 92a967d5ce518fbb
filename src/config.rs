//! Runtime configuration.
//!
//! [`SimulationConfig`] holds the tunable scalars of the simulation. It is
//! consulted once per frame: [`ParticleWorld::set_config`](crate::ParticleWorld::set_config)
//! stages a new value and the next frame boundary applies it, so a change never
//! lands in the middle of a dispatch.
//!
//! # Example
//!
//! ```
//! use tilesim::SimulationConfig;
//!
//! let config = SimulationConfig::from_toml_str(r#"
//!     max_spawned_per_frame = 2048
//!     memory_ceiling_bytes = 67108864
//!
//!     [atlas]
//!     width = 512
//!     height = 512
//!     tile_size = 4
//! "#).unwrap();
//!
//! assert_eq!(config.atlas.width, 512);
//! assert_eq!(config.max_spawned_per_frame, 2048);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest supported tile side. A tile is simulated by one workgroup, so
/// `tile_size²` must stay within the 256-invocation workgroup limit.
pub const MAX_TILE_SIZE: u32 = 16;

/// Dimensions of the particle state atlas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    /// Atlas width in texels.
    pub width: u32,
    /// Atlas height in texels.
    pub height: u32,
    /// Side length of one tile in texels (tile capacity is `tile_size²`).
    pub tile_size: u32,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            tile_size: 4,
        }
    }
}

impl AtlasConfig {
    /// Create an atlas config with the given dimensions.
    pub fn new(width: u32, height: u32, tile_size: u32) -> Self {
        Self { width, height, tile_size }
    }

    /// Check that the atlas can be carved into whole tiles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.tile_size.is_power_of_two() || self.tile_size > MAX_TILE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "atlas.tile_size must be a power of two in [1, {}], got {}",
                MAX_TILE_SIZE, self.tile_size
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "atlas dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.width % self.tile_size != 0 || self.height % self.tile_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "atlas {}x{} is not a multiple of tile_size {}",
                self.width, self.height, self.tile_size
            )));
        }
        if self.width > u16::MAX as u32 + 1 || self.height > u16::MAX as u32 + 1 {
            return Err(ConfigError::Invalid(format!(
                "atlas {}x{} exceeds the 16-bit texel address range",
                self.width, self.height
            )));
        }
        if self.width as u64 * self.height as u64 > u32::MAX as u64 {
            return Err(ConfigError::Invalid(format!(
                "atlas {}x{} holds more than {} particle slots",
                self.width,
                self.height,
                u32::MAX
            )));
        }
        Ok(())
    }
}

/// Simulation-wide tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Atlas geometry. Fixed for the lifetime of a GPU executor.
    pub atlas: AtlasConfig,
    /// Per-emitter cap on particles spawned in one tick.
    pub max_spawned_per_frame: u32,
    /// Upper bound on the tiles a looping emitter keeps while idle.
    pub min_preallocated_tiles: u32,
    /// Extra fraction of tiles kept by looping emitters on top of their estimate.
    pub particle_slack: f32,
    /// Limit on allocated tiles expressed in bytes of particle state.
    pub memory_ceiling_bytes: Option<u64>,
    /// Spawning more than this many particles in one tick logs a warning.
    pub spawn_warning_threshold: u32,
    /// Maximum spawn records per injection dispatch.
    pub max_injection_batch: u32,
    /// Capacity of the bounded producer/consumer frame channel.
    pub frames_in_flight: usize,
    /// Consecutive idle ticks before an emitter releases its tiles.
    pub quiescent_frame_count: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            atlas: AtlasConfig::default(),
            max_spawned_per_frame: 8192,
            min_preallocated_tiles: 1024,
            particle_slack: 0.2,
            memory_ceiling_bytes: None,
            spawn_warning_threshold: 4096,
            max_injection_batch: 16384,
            frames_in_flight: 2,
            quiescent_frame_count: 10,
        }
    }
}

impl SimulationConfig {
    /// Parse and validate a config from a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: SimulationConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Serialize to a TOML document.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Check every value against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.atlas.validate()?;
        if self.max_spawned_per_frame == 0 {
            return Err(ConfigError::Invalid(
                "max_spawned_per_frame must be at least 1".into(),
            ));
        }
        if self.max_injection_batch == 0 {
            return Err(ConfigError::Invalid(
                "max_injection_batch must be at least 1".into(),
            ));
        }
        if self.frames_in_flight == 0 {
            return Err(ConfigError::Invalid("frames_in_flight must be at least 1".into()));
        }
        if !(self.particle_slack >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "particle_slack must be non-negative, got {}",
                self.particle_slack
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SimulationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.atlas.width, 1024);
        assert_eq!(config.atlas.tile_size, 4);
    }

    #[test]
    fn test_atlas_slot_count_must_fit_u32() {
        assert!(AtlasConfig::new(65536, 65536, 1).validate().is_err());
        assert!(AtlasConfig::new(65536, 65536, 16).validate().is_err());
        assert!(AtlasConfig::new(65536, 32768, 1).validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SimulationConfig::from_toml_str("max_spawned_per_frame = 40").unwrap();
        assert_eq!(config.max_spawned_per_frame, 40);
        assert_eq!(config.atlas, AtlasConfig::default());
        assert_eq!(config.quiescent_frame_count, 10);
        assert!(config.memory_ceiling_bytes.is_none());
    }

    #[test]
    fn test_toml_roundtrip_preserves_values() {
        let mut config = SimulationConfig::default();
        config.memory_ceiling_bytes = Some(1 << 20);
        config.atlas = AtlasConfig::new(64, 32, 8);
        let text = config.to_toml_string().unwrap();
        let parsed = SimulationConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_rejects_non_power_of_two_tile() {
        let atlas = AtlasConfig::new(48, 48, 6);
        assert!(matches!(atlas.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_oversized_tile() {
        let atlas = AtlasConfig::new(64, 64, 32);
        assert!(atlas.validate().is_err());
    }

    #[test]
    fn test_rejects_partial_tiles() {
        let atlas = AtlasConfig::new(42, 40, 4);
        assert!(atlas.validate().is_err());
    }

    #[test]
    fn test_non_power_of_two_atlas_allowed() {
        // 40x4 holds exactly ten 4x4 tiles.
        assert!(AtlasConfig::new(40, 4, 4).validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_caps() {
        let mut config = SimulationConfig::default();
        config.max_spawned_per_frame = 0;
        assert!(config.validate().is_err());

        let mut config = SimulationConfig::default();
        config.frames_in_flight = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_negative_slack() {
        let mut config = SimulationConfig::default();
        config.particle_slack = -0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let err = SimulationConfig::from_toml_str("max_spawned_per_frame = \"lots\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
