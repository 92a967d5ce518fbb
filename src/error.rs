//! Error types for tilesim.
//!
//! Resource exhaustion (an empty tile allocator, a reached memory ceiling) and
//! missing optional inputs (no collision view, no local vector field) are not
//! errors: they show up as counts in [`SpawnReport`](crate::SpawnReport) and
//! [`FrameStats`](crate::FrameStats). The types here cover the failures a
//! caller actually has to handle.

/// Errors that can occur during GPU initialization or readback.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    /// No compatible GPU adapter found.
    #[error("No compatible GPU adapter found. Ensure your system has a GPU with WebGPU/Vulkan/Metal/DX12 support.")]
    NoAdapter,
    /// Failed to create GPU device.
    #[error("Failed to create GPU device: {0}")]
    DeviceCreation(#[from] wgpu::RequestDeviceError),
    /// Failed to map buffer for reading.
    #[error("Failed to map GPU buffer: {0}")]
    BufferMapping(String),
    /// The atlas does not fit the device's texture or buffer limits.
    #[error("Particle atlas exceeds device limits: {0}")]
    AtlasTooLarge(String),
}

/// Errors raised while loading or validating a [`SimulationConfig`](crate::SimulationConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The TOML document could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The config file could not be read.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// A value is outside its allowed range.
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Errors on the producer/consumer frame handoff.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    /// The consumer side of the frame channel has been dropped.
    #[error("Frame consumer disconnected; batch for frame {frame} was not delivered")]
    Disconnected {
        /// Frame number of the undelivered batch.
        frame: u64,
    },
}
