//! Producer-side simulation world.
//!
//! [`ParticleWorld`] owns the one tile allocator for its atlas, the active and
//! staged configuration, the world vector-field registry and every emitter.
//! Each frame it ticks the emitters, collects their GPU work into a
//! [`FrameBatch`] and hands the batch to the consumer over the frame channel.
//!
//! ```ignore
//! let (mut world, frames) = ParticleWorld::new(SimulationConfig::default())?;
//! let sparks = world.add_emitter(EmitterConfig { spawn_rate: 500.0, ..Default::default() });
//!
//! loop {
//!     world.begin_frame();
//!     world.tick(1.0 / 60.0);
//!     world.submit()?;
//!     // render thread: gpu.execute_frame(&frames.next_blocking().unwrap(), None)
//! }
//! ```

use std::collections::BTreeMap;

use glam::Vec3;
use log::{debug, warn};

use crate::allocator::TileAllocator;
use crate::atlas::AtlasLayout;
use crate::config::SimulationConfig;
use crate::emitter::{EmitterConfig, EmitterInstance};
use crate::error::{ConfigError, HandoffError};
use crate::frame::{frame_channel, EmitterId, FrameBatch, FrameReceiver, FrameSender};
use crate::spawn::SpawnReport;
use crate::vector_field::VectorFieldRegistry;

pub struct ParticleWorld {
    config: SimulationConfig,
    staged: Option<SimulationConfig>,
    layout: AtlasLayout,
    allocator: TileAllocator,
    vector_fields: VectorFieldRegistry,
    emitters: BTreeMap<EmitterId, EmitterInstance>,
    next_emitter: u32,
    frame: u64,
    pending: Option<FrameBatch>,
    sort_origin: Option<Vec3>,
    sender: FrameSender,
}

impl ParticleWorld {
    /// Create a world and the consumer end of its frame channel.
    pub fn new(config: SimulationConfig) -> Result<(Self, FrameReceiver), ConfigError> {
        config.validate()?;
        let layout = AtlasLayout::new(config.atlas)?;
        let mut allocator = TileAllocator::new(layout.tile_count());
        allocator.set_tile_limit(config.memory_ceiling_bytes.map(|c| layout.tiles_within(c)));
        let (sender, receiver) = frame_channel(config.frames_in_flight);
        let world = Self {
            config,
            staged: None,
            layout,
            allocator,
            vector_fields: VectorFieldRegistry::new(),
            emitters: BTreeMap::new(),
            next_emitter: 0,
            frame: 0,
            pending: None,
            sort_origin: None,
            sender,
        };
        Ok((world, receiver))
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Stage a new configuration for the next frame boundary.
    pub fn set_config(&mut self, config: SimulationConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.staged = Some(config);
        Ok(())
    }

    pub fn layout(&self) -> &AtlasLayout {
        &self.layout
    }

    pub fn allocator(&self) -> &TileAllocator {
        &self.allocator
    }

    pub fn vector_fields(&self) -> &VectorFieldRegistry {
        &self.vector_fields
    }

    pub fn vector_fields_mut(&mut self) -> &mut VectorFieldRegistry {
        &mut self.vector_fields
    }

    /// Camera origin for the back-to-front sort of subsequent frames.
    pub fn set_sort_origin(&mut self, origin: Option<Vec3>) {
        self.sort_origin = origin;
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Add and activate an emitter.
    pub fn add_emitter(&mut self, config: EmitterConfig) -> EmitterId {
        let id = EmitterId(self.next_emitter);
        self.next_emitter += 1;
        let mut emitter = EmitterInstance::new(id, config, self.layout);
        emitter.activate();
        self.emitters.insert(id, emitter);
        id
    }

    /// Tear down an emitter mid-frame.
    ///
    /// Its commands in the batch being built are discarded and its tiles go
    /// straight back to the allocator. Earlier batches already handed to the
    /// consumer run before any batch that can reissue those tiles.
    pub fn remove_emitter(&mut self, id: EmitterId) -> bool {
        let Some(mut emitter) = self.emitters.remove(&id) else {
            return false;
        };
        if let Some(batch) = self.pending.as_mut() {
            let dropped = batch.discard_emitter(id);
            if dropped > 0 {
                debug!("Dropped {} pending commands of removed emitter {:?}", dropped, id);
            }
        }
        emitter.release(&mut self.allocator);
        true
    }

    /// Remove every emitter that has finished all loops and has no live
    /// particles. Returns the removed ids.
    pub fn remove_completed_emitters(&mut self) -> Vec<EmitterId> {
        let done: Vec<EmitterId> = self
            .emitters
            .iter()
            .filter(|(_, e)| e.has_completed())
            .map(|(&id, _)| id)
            .collect();
        for &id in &done {
            self.remove_emitter(id);
        }
        done
    }

    pub fn emitter(&self, id: EmitterId) -> Option<&EmitterInstance> {
        self.emitters.get(&id)
    }

    pub fn emitter_mut(&mut self, id: EmitterId) -> Option<&mut EmitterInstance> {
        self.emitters.get_mut(&id)
    }

    pub fn emitters(&self) -> impl Iterator<Item = &EmitterInstance> {
        self.emitters.values()
    }

    /// Start a frame: apply any staged config and open a new batch.
    pub fn begin_frame(&mut self) {
        if let Some(mut staged) = self.staged.take() {
            if staged.atlas != self.config.atlas {
                warn!(
                    "Atlas geometry cannot change at runtime; keeping {}x{} with {}x{} tiles",
                    self.config.atlas.width,
                    self.config.atlas.height,
                    self.config.atlas.tile_size,
                    self.config.atlas.tile_size
                );
                staged.atlas = self.config.atlas;
            }
            self.config = staged;
            debug!("Applied staged simulation config at frame {}", self.frame + 1);
        }
        let limit = self
            .config
            .memory_ceiling_bytes
            .map(|ceiling| self.layout.tiles_within(ceiling));
        self.allocator.set_tile_limit(limit);

        if self.pending.is_some() {
            warn!("Frame {} was never submitted; submitting it now", self.frame);
            if let Err(err) = self.submit() {
                warn!("{}", err);
            }
        }
        self.frame += 1;
        let mut batch = FrameBatch::new(self.frame, 0.0);
        batch.max_injection_batch = Some(self.config.max_injection_batch);
        self.pending = Some(batch);
    }

    /// Tick every emitter and record its GPU work in the current batch.
    ///
    /// Once per frame: a second tick closes and submits the current batch
    /// first, since each batch simulates every owned tile exactly once.
    pub fn tick(&mut self, dt: f32) -> SpawnReport {
        let already_ticked = self.pending.as_ref().is_some_and(|b| b.delta_seconds > 0.0 || !b.commands.is_empty());
        if already_ticked || self.pending.is_none() {
            self.begin_frame();
        }
        let mut commands = Vec::with_capacity(self.emitters.len());
        let mut report = SpawnReport::default();
        for emitter in self.emitters.values_mut() {
            report.merge(emitter.tick(dt, &mut self.allocator, &self.config));
            if let Some(command) = emitter.build_command(dt, &self.vector_fields) {
                commands.push(command);
            }
        }
        if let Some(batch) = self.pending.as_mut() {
            batch.delta_seconds = dt;
            batch.commands.extend(commands);
            batch.sort_origin = self.sort_origin;
        }
        report
    }

    /// Close the current batch without sending it.
    pub fn end_frame(&mut self) -> Option<FrameBatch> {
        self.pending.take()
    }

    /// Close the current batch and hand it to the consumer.
    pub fn submit(&mut self) -> Result<(), HandoffError> {
        match self.pending.take() {
            Some(batch) => self.sender.submit(batch),
            None => Ok(()),
        }
    }
}
