//! CPU-side emitter instances.
//!
//! An [`EmitterInstance`] owns a set of atlas tiles and decides, once per tick,
//! how many particles to spawn and where they go. It never touches particle
//! state directly; everything the GPU needs is collected into an
//! [`EmitterCommand`] by [`EmitterInstance::build_command`].
//!
//! # Lifecycle
//!
//! | State | Spawning | Simulating | Tiles |
//! |-------|----------|------------|-------|
//! | `Uninitialized` | no | no | none |
//! | `Active` | yes | yes | grow on demand |
//! | `Draining` | forced only | yes | released as they die |
//! | `Quiescent` | forced only | no live particles | all released |
//!
//! # Tile set
//!
//! Tiles are kept in allocation order with a time of death and an active bit
//! per tile. A tile's time of death is the latest time any particle spawned
//! into it can still be alive, so a tile marked inactive holds only dead
//! particles and may be reused or released. Release only ever happens from the
//! tail of the list.

use glam::{Vec2, Vec3};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;

use crate::allocator::TileAllocator;
use crate::atlas::AtlasLayout;
use crate::bounds::Aabb;
use crate::config::SimulationConfig;
use crate::frame::{EmitterCommand, EmitterId, SimulationPhase};
use crate::spawn::{FloatRange, Orbit, SpawnRandom, SpawnRecord, SpawnReport, SpawnShape, SpawnTiming};
use crate::uniforms::{CollisionResponse, PerFrameUniforms, PointAttractor, SimulationUniforms};
use crate::vector_field::{combine_vector_fields, GlobalFieldResponse, VectorFieldInstance, VectorFieldRegistry};

/// Shortest lifetime a particle can be given, in seconds.
const MIN_LIFETIME: f32 = 0.001;

/// A one-shot spawn at a fixed point of each loop.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Burst {
    /// Loop time in seconds at which the burst fires.
    pub time: f32,
    /// Particles spawned.
    pub count: u32,
    /// When set, the count is random in `[count_low, count]`.
    #[serde(default)]
    pub count_low: Option<u32>,
}

impl Burst {
    pub fn new(time: f32, count: u32) -> Self {
        Self { time, count, count_low: None }
    }
}

/// Everything that defines how an emitter spawns and moves particles.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Continuous spawn rate in particles per second.
    pub spawn_rate: f32,
    pub bursts: Vec<Burst>,
    /// Length of one loop in seconds.
    pub duration: f32,
    /// Loops to run before spawning stops; 0 loops forever.
    pub loops: u32,
    /// Particle lifetime in seconds.
    pub lifetime: FloatRange,
    pub size_x: FloatRange,
    /// `None` makes particles square.
    pub size_y: Option<FloatRange>,
    /// Initial rotation in radians.
    pub rotation: FloatRange,
    /// Rotation rate in radians per second.
    pub rotation_rate: FloatRange,
    pub drag: FloatRange,
    pub vector_field_scale: FloatRange,
    pub resilience: FloatRange,
    pub shape: SpawnShape,
    pub acceleration: Vec3,
    pub orbit: Orbit,
    /// Attractor position is relative to the emitter.
    pub point_attractor: Option<PointAttractor>,
    /// Request the collision phase.
    pub collision: bool,
    pub collision_response: CollisionResponse,
    /// Include particles in the back-to-front sort.
    pub sorted: bool,
    /// Move live particles along with the emitter.
    pub local_space: bool,
    pub global_fields: GlobalFieldResponse,
    /// Fixed bounds relative to the emitter; `None` derives them.
    pub local_bounds: Option<Aabb>,
    /// Expected peak particle count; 0 estimates it from rate and bursts.
    pub max_particle_count: u32,
    pub seed: u64,
    /// Field placed relative to the emitter; always slot 0 when non-zero.
    #[serde(skip)]
    pub local_vector_field: Option<VectorFieldInstance>,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            spawn_rate: 0.0,
            bursts: Vec::new(),
            duration: 1.0,
            loops: 0,
            lifetime: FloatRange::constant(1.0),
            size_x: FloatRange::constant(0.1),
            size_y: None,
            rotation: FloatRange::constant(0.0),
            rotation_rate: FloatRange::constant(0.0),
            drag: FloatRange::constant(0.0),
            vector_field_scale: FloatRange::constant(1.0),
            resilience: FloatRange::constant(0.0),
            shape: SpawnShape::default(),
            acceleration: Vec3::ZERO,
            orbit: Orbit::default(),
            point_attractor: None,
            collision: false,
            collision_response: CollisionResponse::default(),
            sorted: false,
            local_space: false,
            global_fields: GlobalFieldResponse::default(),
            local_bounds: None,
            max_particle_count: 0,
            seed: 0,
            local_vector_field: None,
        }
    }
}

impl EmitterConfig {
    /// Largest sprite extent a particle can be spawned with.
    pub fn max_sprite_size(&self) -> f32 {
        let size_x = self.size_x.min.max(self.size_x.max);
        let size_y = self.size_y.map_or(size_x, |range| range.min.max(range.max));
        size_x.max(size_y)
    }

    /// Peak particle count used to size the retained tile set.
    pub fn estimated_max_particles(&self) -> u32 {
        if self.max_particle_count > 0 {
            return self.max_particle_count;
        }
        let from_rate = (self.spawn_rate.max(0.0) * self.lifetime.min.max(self.lifetime.max)).ceil();
        let from_bursts = self.bursts.iter().fold(0u32, |total, b| total.saturating_add(b.count));
        (from_rate as u32).saturating_add(from_bursts)
    }

    fn max_lifetime(&self) -> f32 {
        self.lifetime.min.max(self.lifetime.max).max(MIN_LIFETIME)
    }
}

/// Where an emitter is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitterState {
    Uninitialized,
    Active,
    Draining,
    Quiescent,
}

/// One emitter's tile set and spawn bookkeeping.
pub struct EmitterInstance {
    id: EmitterId,
    config: EmitterConfig,
    layout: AtlasLayout,
    rng: SpawnRandom,

    activated: bool,
    spawning: bool,
    quiescent: bool,
    preallocated: bool,

    tiles: Vec<u32>,
    tile_time_of_death: Vec<f32>,
    tile_active: Vec<bool>,
    active_tile_count: usize,
    /// Tile-set index currently being filled.
    allocate_from: Option<usize>,
    free_in_tile: u32,

    tiles_to_clear: Vec<u32>,
    spawns: Vec<SpawnRecord>,

    seconds: f32,
    loop_time: f32,
    loops_completed: u32,
    spawn_fraction: f32,
    forced: u32,
    idle_ticks: u32,

    location: Vec3,
    previous_location: Vec3,
    /// Offset applied to live particles at the next simulation step.
    pending_offset: Vec3,
    /// World positions covered by particles spawned since the set last emptied.
    spawn_bounds: Aabb,
    last_report: SpawnReport,
}

impl EmitterInstance {
    pub fn new(id: EmitterId, config: EmitterConfig, layout: AtlasLayout) -> Self {
        let rng = SpawnRandom::new(config.seed ^ ((id.0 as u64) << 32));
        Self {
            id,
            config,
            layout,
            rng,
            activated: false,
            spawning: false,
            quiescent: false,
            preallocated: false,
            tiles: Vec::new(),
            tile_time_of_death: Vec::new(),
            tile_active: Vec::new(),
            active_tile_count: 0,
            allocate_from: None,
            free_in_tile: 0,
            tiles_to_clear: Vec::new(),
            spawns: Vec::new(),
            seconds: 0.0,
            loop_time: 0.0,
            loops_completed: 0,
            spawn_fraction: 0.0,
            forced: 0,
            idle_ticks: 0,
            location: Vec3::ZERO,
            previous_location: Vec3::ZERO,
            pending_offset: Vec3::ZERO,
            spawn_bounds: Aabb::EMPTY,
            last_report: SpawnReport::default(),
        }
    }

    pub fn id(&self) -> EmitterId {
        self.id
    }

    pub fn config(&self) -> &EmitterConfig {
        &self.config
    }

    pub fn state(&self) -> EmitterState {
        if !self.activated {
            EmitterState::Uninitialized
        } else if self.quiescent {
            EmitterState::Quiescent
        } else if self.spawning {
            EmitterState::Active
        } else {
            EmitterState::Draining
        }
    }

    /// Start (or resume) spawning.
    pub fn activate(&mut self) {
        self.activated = true;
        self.spawning = true;
        self.quiescent = false;
        self.idle_ticks = 0;
    }

    /// Stop spawning; live particles run out their lifetime.
    pub fn deactivate(&mut self) {
        self.spawning = false;
    }

    /// Queue `count` particles for the next tick, regardless of rate and loops.
    pub fn force_spawn(&mut self, count: u32) {
        self.forced = self.forced.saturating_add(count);
    }

    /// Kill every particle: all tiles go inactive and are cleared on the GPU.
    pub fn kill_all(&mut self) {
        self.spawns.clear();
        self.forced = 0;
        for (i, &tile) in self.tiles.iter().enumerate() {
            self.tile_active[i] = false;
            self.tile_time_of_death[i] = self.seconds;
            if !self.tiles_to_clear.contains(&tile) {
                self.tiles_to_clear.push(tile);
            }
        }
        self.active_tile_count = 0;
        self.allocate_from = None;
        self.free_in_tile = 0;
        self.spawn_bounds = Aabb::EMPTY;
    }

    /// Return every tile to the allocator.
    ///
    /// Pending clears and spawns for those tiles are dropped with them so a
    /// tile's next owner never sees stale work.
    pub fn release(&mut self, allocator: &mut TileAllocator) {
        if !self.tiles.is_empty() {
            debug!("Emitter {:?}: releasing {} tiles", self.id, self.tiles.len());
        }
        for &tile in &self.tiles {
            allocator.free(tile);
        }
        self.tiles.clear();
        self.tile_time_of_death.clear();
        self.tile_active.clear();
        self.tiles_to_clear.clear();
        self.spawns.clear();
        self.active_tile_count = 0;
        self.allocate_from = None;
        self.free_in_tile = 0;
        self.spawn_bounds = Aabb::EMPTY;
    }

    /// Release everything and restart the loop clock.
    pub fn reset(&mut self, allocator: &mut TileAllocator) {
        self.release(allocator);
        self.rng = SpawnRandom::new(self.config.seed ^ ((self.id.0 as u64) << 32));
        self.seconds = 0.0;
        self.loop_time = 0.0;
        self.loops_completed = 0;
        self.spawn_fraction = 0.0;
        self.forced = 0;
        self.idle_ticks = 0;
        self.quiescent = false;
        self.preallocated = false;
        self.pending_offset = Vec3::ZERO;
        self.previous_location = self.location;
        self.last_report = SpawnReport::default();
    }

    /// All loops have run and every particle is dead.
    pub fn has_completed(&self) -> bool {
        self.loops_exhausted() && self.active_tile_count == 0 && self.spawns.is_empty()
    }

    /// Upper bound on live particles: active tiles minus unused slots of the
    /// tile being filled.
    pub fn active_particle_estimate(&self) -> u32 {
        let full = self.active_tile_count as u32 * self.layout.particles_per_tile();
        match self.allocate_from {
            Some(_) => full.saturating_sub(self.free_in_tile),
            None => full,
        }
    }

    fn owns_particles(&self) -> bool {
        self.active_tile_count > 0 || !self.spawns.is_empty()
    }

    pub fn tiles(&self) -> &[u32] {
        &self.tiles
    }

    pub fn active_tile_count(&self) -> usize {
        self.active_tile_count
    }

    pub fn pending_spawns(&self) -> &[SpawnRecord] {
        &self.spawns
    }

    pub fn tiles_to_clear(&self) -> &[u32] {
        &self.tiles_to_clear
    }

    pub fn last_report(&self) -> SpawnReport {
        self.last_report
    }

    pub fn seconds(&self) -> f32 {
        self.seconds
    }

    pub fn location(&self) -> Vec3 {
        self.location
    }

    pub fn set_location(&mut self, location: Vec3) {
        if !self.activated || !self.owns_particles() {
            // Nothing to trail from the old location.
            self.previous_location = location;
        } else if self.config.local_space {
            self.pending_offset += location - self.location;
        }
        self.location = location;
    }

    /// Tiles this emitter keeps even when they hold no live particles.
    pub fn min_tile_count(&self, config: &SimulationConfig) -> usize {
        if self.config.loops != 0 {
            return 0;
        }
        let per_tile = self.layout.particles_per_tile();
        let estimated = self.config.estimated_max_particles().div_ceil(per_tile);
        let slack = (config.particle_slack * estimated as f32).ceil() as u32;
        (estimated + slack).min(config.min_preallocated_tiles) as usize
    }

    /// Conservative world bounds of every particle this emitter may own.
    pub fn bounds(&self) -> Aabb {
        if let Some(local) = self.config.local_bounds {
            return local.translated(self.location);
        }
        let lifetime = self.config.max_lifetime();
        let travel = self.config.shape.speed() * lifetime
            + 0.5 * self.config.acceleration.length() * lifetime * lifetime
            + self.config.orbit.extent();
        let spawn_area = Aabb::from_center_half_extents(
            self.location,
            Vec3::splat(self.config.shape.extent()),
        );
        spawn_area.union(&self.spawn_bounds).expanded(travel)
    }

    /// Advance the emitter by `dt` seconds and reserve slots for new particles.
    pub fn tick(&mut self, dt: f32, allocator: &mut TileAllocator, config: &SimulationConfig) -> SpawnReport {
        if !self.activated {
            self.last_report = SpawnReport::default();
            return self.last_report;
        }
        if !self.preallocated {
            self.preallocate(allocator, config);
        }

        self.seconds += dt;
        self.mark_tiles_inactive();

        let bursts = self.advance_loop(dt);
        let forced = std::mem::take(&mut self.forced);
        let rate = if self.spawning && !self.loops_exhausted() {
            let (timing, fraction) = SpawnTiming::from_rate(self.spawn_fraction, self.config.spawn_rate, dt);
            self.spawn_fraction = fraction;
            timing
        } else {
            SpawnTiming::default()
        };

        let requested = bursts.saturating_add(forced).saturating_add(rate.count);
        let mut report = SpawnReport {
            requested,
            ..Default::default()
        };

        let capped = requested.min(config.max_spawned_per_frame);
        report.dropped_by_cap = requested - capped;
        if capped > config.spawn_warning_threshold {
            warn!("Emitter {:?}: spawning {} particles in one tick", self.id, capped);
        }

        // Bursts first, then the rate stream, both sharing the cap.
        let burst_count = bursts.saturating_add(forced).min(capped);
        let rate_count = capped - burst_count;
        let groups = [
            SpawnTiming::burst(burst_count),
            SpawnTiming { count: rate_count, ..rate },
        ];

        for timing in groups {
            let spawned = self.spawn_group(timing, dt, allocator);
            report.injected += spawned;
            if spawned < timing.count {
                report.dropped_by_capacity += timing.count - spawned;
                warn!(
                    "Emitter {:?}: {} new particles truncated to {}, out of tiles",
                    self.id, timing.count, spawned
                );
            }
        }

        self.free_inactive_tiles(allocator, config);
        self.update_quiescence(report.injected, allocator, config);
        self.previous_location = self.location;

        self.last_report = report;
        report
    }

    /// Run the emitter for `seconds` up front so it starts mid-life.
    ///
    /// Pending particles are advanced under constant acceleration only; the
    /// GPU sees them for the first time at their warmed-up state.
    pub fn warmup(&mut self, seconds: f32, step: f32, allocator: &mut TileAllocator, config: &SimulationConfig) -> SpawnReport {
        let mut total = SpawnReport::default();
        if seconds <= 0.0 || step <= 0.0 {
            return total;
        }
        let mut remaining = seconds;
        while remaining > 0.0 {
            let dt = step.min(remaining);
            let acceleration = self.config.acceleration;
            for record in &mut self.spawns {
                record.pre_advance(acceleration, dt);
            }
            self.spawns.retain(|r| r.relative_time < 1.0);
            total.merge(self.tick(dt, allocator, config));
            remaining -= dt;
        }
        total
    }

    /// Package this tick's GPU work.
    ///
    /// Drains pending clears and spawns. Returns `None` when the emitter owns
    /// no tiles and has nothing queued.
    pub fn build_command(&mut self, delta_seconds: f32, registry: &VectorFieldRegistry) -> Option<EmitterCommand> {
        if self.tiles.is_empty() && self.tiles_to_clear.is_empty() && self.spawns.is_empty() {
            return None;
        }

        let bounds = self.bounds();
        let local_field = self.config.local_vector_field.as_ref().map(|field| {
            let mut placed = field.clone();
            placed.update_transforms(field.bounds.translated(self.location), glam::Quat::IDENTITY);
            placed
        });
        let vector_fields = combine_vector_fields(
            local_field.as_ref(),
            registry,
            &bounds,
            self.config.global_fields,
        );

        let attractor = self.config.point_attractor.map(|a| PointAttractor {
            position: a.position + self.location,
            ..a
        });
        let offset = std::mem::take(&mut self.pending_offset);

        Some(EmitterCommand {
            emitter: self.id,
            phase: if self.config.collision {
                SimulationPhase::Collision
            } else {
                SimulationPhase::Main
            },
            tiles: self.tiles.clone(),
            tiles_to_clear: std::mem::take(&mut self.tiles_to_clear),
            spawns: std::mem::take(&mut self.spawns),
            simulation: SimulationUniforms::new(
                self.config.acceleration,
                &self.config.orbit,
                self.config.collision_response,
            ),
            per_frame: PerFrameUniforms::new(delta_seconds, attractor.as_ref(), offset),
            vector_fields,
            bounds,
            sorted: self.config.sorted,
        })
    }

    fn loops_exhausted(&self) -> bool {
        self.config.loops != 0 && self.loops_completed >= self.config.loops
    }

    /// Looping emitters start with their retained tiles already allocated.
    fn preallocate(&mut self, allocator: &mut TileAllocator, config: &SimulationConfig) {
        self.preallocated = true;
        let min_tiles = self.min_tile_count(config);
        while self.tiles.len() < min_tiles {
            let Some(tile) = allocator.allocate() else {
                break;
            };
            self.tiles.push(tile);
            self.tile_time_of_death.push(0.0);
            self.tile_active.push(false);
            self.tiles_to_clear.push(tile);
        }
        if !self.tiles.is_empty() {
            debug!("Emitter {:?}: preallocated {} tiles", self.id, self.tiles.len());
        }
    }

    fn mark_tiles_inactive(&mut self) {
        for i in 0..self.tiles.len() {
            if self.tile_active[i] && self.tile_time_of_death[i] <= self.seconds {
                self.tile_active[i] = false;
                self.active_tile_count -= 1;
                if self.allocate_from == Some(i) {
                    self.allocate_from = None;
                    self.free_in_tile = 0;
                }
            }
        }
        if self.active_tile_count == 0 {
            self.spawn_bounds = Aabb::EMPTY;
        }
    }

    /// Advance the loop clock and count bursts fired in `[previous, now)`.
    fn advance_loop(&mut self, dt: f32) -> u32 {
        if !self.spawning || self.loops_exhausted() {
            return 0;
        }
        let duration = self.config.duration.max(MIN_LIFETIME);
        let mut start = self.loop_time;
        let mut end = start + dt;
        let mut count: u32 = 0;
        loop {
            let window_end = end.min(duration);
            for i in 0..self.config.bursts.len() {
                let burst = self.config.bursts[i];
                if burst.time >= start && burst.time < window_end {
                    let fired = match burst.count_low {
                        Some(low) => self.rng.random_count(low.min(burst.count), burst.count),
                        None => burst.count,
                    };
                    count = count.saturating_add(fired);
                }
            }
            if end < duration {
                self.loop_time = end;
                break;
            }
            self.loops_completed += 1;
            if self.loops_exhausted() {
                self.loop_time = duration;
                break;
            }
            start = 0.0;
            end -= duration;
        }
        count
    }

    /// Reserve the next free slot, growing the tile set if needed.
    ///
    /// Returns the tile-set index and the sub-tile index.
    fn reserve_slot(&mut self, allocator: &mut TileAllocator) -> Option<(usize, u32)> {
        let per_tile = self.layout.particles_per_tile();
        if self.allocate_from.is_none() || self.free_in_tile == 0 {
            let index = match self.tile_active.iter().position(|active| !active) {
                Some(index) => index,
                None => {
                    let tile = allocator.allocate()?;
                    debug!("Emitter {:?}: allocated tile {}", self.id, tile);
                    self.tiles.push(tile);
                    self.tile_time_of_death.push(self.seconds);
                    self.tile_active.push(false);
                    self.tiles_to_clear.push(tile);
                    self.tiles.len() - 1
                }
            };
            self.tile_active[index] = true;
            self.active_tile_count += 1;
            self.allocate_from = Some(index);
            self.free_in_tile = per_tile;
        }
        let index = self.allocate_from?;
        let sub_index = per_tile - self.free_in_tile;
        self.free_in_tile -= 1;
        Some((index, sub_index))
    }

    /// Spawn up to `timing.count` particles; returns how many got a slot.
    fn spawn_group(&mut self, timing: SpawnTiming, dt: f32, allocator: &mut TileAllocator) -> u32 {
        let emitter_delta = if self.config.local_space {
            Vec3::ZERO
        } else {
            self.previous_location - self.location
        };
        for i in 0..timing.count {
            let Some((local_index, sub_index)) = self.reserve_slot(allocator) else {
                return i;
            };
            let tile = self.tiles[local_index];
            let age = timing.age_of(i);
            // Spread particles back along the emitter's path this tick.
            let interp = if dt > 0.0 { (age / dt).clamp(0.0, 1.0) } else { 0.0 };
            let mut record = self.build_record(emitter_delta * interp);
            record.texel = self.layout.slot_for_index(tile, sub_index);
            record.tile_local_index = local_index as u32;
            record.pre_advance(self.config.acceleration, age);
            record.position += self.config.orbit.offset(record.relative_time, record.random_orbit)
                - self.config.orbit.offset(0.0, record.random_orbit);

            let remaining_life = (1.0 - record.relative_time).max(0.0) / record.time_scale;
            let death = self.seconds + remaining_life;
            self.tile_time_of_death[local_index] = self.tile_time_of_death[local_index].max(death);
            self.spawn_bounds.include_point(record.position);
            self.spawns.push(record);
        }
        timing.count
    }

    fn build_record(&mut self, path_offset: Vec3) -> SpawnRecord {
        let rng = &mut self.rng;
        let config = &self.config;
        let (offset, velocity) = config.shape.sample(rng);
        let lifetime = config.lifetime.sample(rng).max(MIN_LIFETIME);
        let size_x = config.size_x.sample(rng);
        let size_y = match config.size_y {
            Some(range) => range.sample(rng),
            None => size_x,
        };
        let random_orbit = rng.random();
        let orbit_start = config.orbit.offset(0.0, random_orbit);
        SpawnRecord {
            position: self.location + offset + path_offset + orbit_start,
            relative_time: 0.0,
            velocity,
            time_scale: 1.0 / lifetime,
            size: Vec2::new(size_x, size_y),
            rotation: (config.rotation.sample(rng) / TAU).rem_euclid(1.0),
            relative_rotation_rate: config.rotation_rate.sample(rng) / TAU,
            drag_coefficient: config.drag.sample(rng),
            vector_field_scale: config.vector_field_scale.sample(rng),
            resilience: config.resilience.sample(rng),
            random_orbit,
            texel: glam::UVec2::ZERO,
            tile_local_index: 0,
        }
    }

    /// Release inactive tiles from the tail, keeping the retained minimum.
    fn free_inactive_tiles(&mut self, allocator: &mut TileAllocator, config: &SimulationConfig) {
        let min_tiles = self.min_tile_count(config);
        let mut freed = 0;
        while self.tiles.len() > min_tiles {
            let last = self.tiles.len() - 1;
            if self.tile_active[last] {
                break;
            }
            let tile = self.tiles[last];
            debug_assert!(self.tile_time_of_death[last] <= self.seconds);
            self.tiles_to_clear.retain(|&t| t != tile);
            allocator.free(tile);
            self.tiles.pop();
            self.tile_time_of_death.pop();
            self.tile_active.pop();
            freed += 1;
        }
        if freed > 0 {
            debug!("Emitter {:?}: freed {} inactive tiles", self.id, freed);
        }
    }

    fn update_quiescence(&mut self, spawned: u32, allocator: &mut TileAllocator, config: &SimulationConfig) {
        if self.active_tile_count > 0 || spawned > 0 || !self.spawns.is_empty() {
            self.idle_ticks = 0;
            self.quiescent = false;
            return;
        }
        self.idle_ticks = self.idle_ticks.saturating_add(1);
        if !self.quiescent && self.idle_ticks >= config.quiescent_frame_count {
            debug!(
                "Emitter {:?}: quiescent after {} idle ticks",
                self.id, self.idle_ticks
            );
            self.release(allocator);
            self.quiescent = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AtlasConfig;

    /// 40x4 atlas of 4x4 tiles: ten tiles of 16 particles.
    fn ten_tile_layout() -> AtlasLayout {
        AtlasLayout::new(AtlasConfig::new(40, 4, 4)).unwrap()
    }

    fn sim_config(cap: u32) -> SimulationConfig {
        SimulationConfig {
            atlas: AtlasConfig::new(40, 4, 4),
            max_spawned_per_frame: cap,
            ..Default::default()
        }
    }

    fn one_shot(seed: u64) -> EmitterConfig {
        EmitterConfig {
            loops: 1,
            lifetime: FloatRange::constant(0.5),
            seed,
            ..Default::default()
        }
    }

    #[test]
    fn test_cap_and_capacity_scenario() {
        let layout = ten_tile_layout();
        let config = sim_config(40);
        let mut allocator = TileAllocator::new(layout.tile_count());
        // Three tiles already held elsewhere.
        let held: Vec<u32> = (0..3).map(|_| allocator.allocate().unwrap()).collect();

        let mut emitter = EmitterInstance::new(EmitterId(1), one_shot(1), layout);
        emitter.activate();
        emitter.force_spawn(50);
        let report = emitter.tick(0.016, &mut allocator, &config);

        assert_eq!(report.requested, 50);
        assert_eq!(report.injected, 40);
        assert_eq!(report.dropped(), 10);
        assert_eq!(report.dropped_by_cap, 10);
        assert_eq!(emitter.pending_spawns().len(), 40);
        assert_eq!(emitter.tiles().len(), 3);
        assert_eq!(emitter.tiles_to_clear().len(), 3);
        for tile in emitter.tiles() {
            assert!(!held.contains(tile));
        }
    }

    #[test]
    fn test_allocator_exhaustion_truncates() {
        let layout = ten_tile_layout();
        let config = sim_config(1000);
        let mut allocator = TileAllocator::new(layout.tile_count());
        for _ in 0..8 {
            allocator.allocate();
        }

        let mut emitter = EmitterInstance::new(EmitterId(1), one_shot(2), layout);
        emitter.activate();
        emitter.force_spawn(40);
        let report = emitter.tick(0.016, &mut allocator, &config);

        assert_eq!(report.injected, 32);
        assert_eq!(report.dropped_by_capacity, 8);
        assert_eq!(report.dropped_by_cap, 0);
        assert_eq!(allocator.free_count(), 0);
    }

    #[test]
    fn test_spawned_texels_are_unique_and_inside_owned_tiles() {
        let layout = ten_tile_layout();
        let config = sim_config(1000);
        let mut allocator = TileAllocator::new(layout.tile_count());
        let mut emitter = EmitterInstance::new(EmitterId(3), one_shot(3), layout);
        emitter.activate();
        emitter.force_spawn(37);
        emitter.tick(0.016, &mut allocator, &config);

        let mut seen = std::collections::HashSet::new();
        for record in emitter.pending_spawns() {
            assert!(seen.insert(record.texel), "texel {:?} reused", record.texel);
            let (tile, _, _) = layout.texel_to_slot(record.texel);
            assert_eq!(emitter.tiles()[record.tile_local_index as usize], tile);
        }
    }

    #[test]
    fn test_fills_current_tile_before_allocating() {
        let layout = ten_tile_layout();
        let config = sim_config(1000);
        let mut allocator = TileAllocator::new(layout.tile_count());
        let mut emitter = EmitterInstance::new(EmitterId(1), one_shot(4), layout);
        emitter.activate();

        emitter.force_spawn(10);
        emitter.tick(0.016, &mut allocator, &config);
        assert_eq!(emitter.tiles().len(), 1);

        emitter.force_spawn(6);
        emitter.tick(0.016, &mut allocator, &config);
        assert_eq!(emitter.tiles().len(), 1);

        emitter.force_spawn(1);
        emitter.tick(0.016, &mut allocator, &config);
        assert_eq!(emitter.tiles().len(), 2);
    }

    #[test]
    fn test_inactive_tile_reused_before_new_allocation() {
        let layout = ten_tile_layout();
        let config = sim_config(1000);
        let mut allocator = TileAllocator::new(layout.tile_count());
        let mut emitter = EmitterInstance::new(
            EmitterId(1),
            EmitterConfig {
                lifetime: FloatRange::constant(0.05),
                max_particle_count: 32,
                ..Default::default()
            },
            layout,
        );
        emitter.activate();
        emitter.tick(0.1, &mut allocator, &config);
        let retained = emitter.tiles().to_vec();
        assert!(!retained.is_empty());
        let free_before = allocator.free_count();

        emitter.force_spawn(16);
        emitter.tick(0.1, &mut allocator, &config);
        assert_eq!(allocator.free_count(), free_before);
        assert_eq!(emitter.tiles(), retained.as_slice());
        assert_eq!(emitter.active_tile_count(), 1);
    }

    #[test]
    fn test_tiles_not_released_while_particles_live() {
        let layout = ten_tile_layout();
        let config = sim_config(1000);
        let mut allocator = TileAllocator::new(layout.tile_count());
        let mut emitter = EmitterInstance::new(EmitterId(1), one_shot(5), layout);
        emitter.activate();
        emitter.force_spawn(20);
        emitter.tick(0.1, &mut allocator, &config);
        assert_eq!(emitter.tiles().len(), 2);

        // Lifetime 0.5s: still alive after 0.4s more.
        for _ in 0..4 {
            emitter.tick(0.1, &mut allocator, &config);
            assert_eq!(emitter.tiles().len(), 2);
        }
        emitter.tick(0.1, &mut allocator, &config);
        emitter.tick(0.1, &mut allocator, &config);
        assert!(emitter.tiles().is_empty());
        assert_eq!(allocator.free_count(), allocator.capacity());
    }

    #[test]
    fn test_quiescent_after_idle_frames_releases_tiles() {
        let layout = ten_tile_layout();
        let config = sim_config(1000);
        let mut allocator = TileAllocator::new(layout.tile_count());
        let mut emitter = EmitterInstance::new(
            EmitterId(9),
            EmitterConfig {
                max_particle_count: 32,
                ..Default::default()
            },
            layout,
        );
        emitter.activate();

        // Forever-looping emitters keep their estimate plus slack.
        emitter.tick(0.1, &mut allocator, &config);
        assert_eq!(emitter.min_tile_count(&config), 3);
        assert_eq!(emitter.tiles().len(), 3);
        assert_eq!(emitter.state(), EmitterState::Active);

        for _ in 2..10 {
            emitter.tick(0.1, &mut allocator, &config);
            assert_eq!(emitter.state(), EmitterState::Active);
        }
        emitter.tick(0.1, &mut allocator, &config);
        assert_eq!(emitter.state(), EmitterState::Quiescent);
        assert!(emitter.tiles().is_empty());
        assert!(emitter.tiles_to_clear().is_empty());
        assert_eq!(allocator.free_count(), allocator.capacity());

        emitter.force_spawn(1);
        emitter.tick(0.1, &mut allocator, &config);
        assert_eq!(emitter.state(), EmitterState::Active);
    }

    #[test]
    fn test_draining_stops_rate_spawns() {
        let layout = ten_tile_layout();
        let config = sim_config(1000);
        let mut allocator = TileAllocator::new(layout.tile_count());
        let mut emitter = EmitterInstance::new(
            EmitterId(1),
            EmitterConfig {
                spawn_rate: 100.0,
                loops: 1,
                duration: 10.0,
                ..Default::default()
            },
            layout,
        );
        emitter.activate();
        assert_eq!(emitter.tick(0.1, &mut allocator, &config).injected, 10);
        emitter.deactivate();
        assert_eq!(emitter.state(), EmitterState::Draining);
        assert_eq!(emitter.tick(0.1, &mut allocator, &config).requested, 0);
    }

    #[test]
    fn test_bursts_fire_once_per_loop() {
        let layout = ten_tile_layout();
        let config = sim_config(1000);
        let mut allocator = TileAllocator::new(layout.tile_count());
        let mut emitter = EmitterInstance::new(
            EmitterId(1),
            EmitterConfig {
                bursts: vec![Burst::new(0.0, 5), Burst::new(0.25, 3)],
                duration: 0.5,
                loops: 2,
                lifetime: FloatRange::constant(0.05),
                ..Default::default()
            },
            layout,
        );
        emitter.activate();
        let registry = VectorFieldRegistry::new();
        let mut total = 0;
        for _ in 0..20 {
            total += emitter.tick(0.1, &mut allocator, &config).requested;
            emitter.build_command(0.1, &registry);
        }
        assert_eq!(total, 16);
        assert!(emitter.has_completed());
    }

    #[test]
    fn test_uninitialized_emitter_does_nothing() {
        let layout = ten_tile_layout();
        let config = sim_config(1000);
        let mut allocator = TileAllocator::new(layout.tile_count());
        let mut emitter = EmitterInstance::new(EmitterId(1), one_shot(6), layout);
        emitter.force_spawn(5);
        let report = emitter.tick(0.1, &mut allocator, &config);
        assert_eq!(report, SpawnReport::default());
        assert_eq!(emitter.state(), EmitterState::Uninitialized);
        assert_eq!(allocator.free_count(), allocator.capacity());
    }

    #[test]
    fn test_kill_all_queues_clears() {
        let layout = ten_tile_layout();
        let config = sim_config(1000);
        let mut allocator = TileAllocator::new(layout.tile_count());
        let mut emitter = EmitterInstance::new(EmitterId(1), one_shot(7), layout);
        emitter.activate();
        emitter.force_spawn(20);
        emitter.tick(0.016, &mut allocator, &config);
        let registry = VectorFieldRegistry::new();
        let first = emitter.build_command(0.016, &registry).unwrap();
        assert_eq!(first.spawns.len(), 20);
        assert_eq!(first.tiles_to_clear.len(), 2);

        emitter.kill_all();
        assert_eq!(emitter.active_tile_count(), 0);
        let second = emitter.build_command(0.016, &registry).unwrap();
        assert!(second.spawns.is_empty());
        assert_eq!(second.tiles_to_clear, second.tiles);
    }

    #[test]
    fn test_release_drops_pending_work() {
        let layout = ten_tile_layout();
        let config = sim_config(1000);
        let mut allocator = TileAllocator::new(layout.tile_count());
        let mut emitter = EmitterInstance::new(EmitterId(1), one_shot(8), layout);
        emitter.activate();
        emitter.force_spawn(20);
        emitter.tick(0.016, &mut allocator, &config);
        emitter.release(&mut allocator);

        assert_eq!(allocator.free_count(), allocator.capacity());
        assert!(emitter.build_command(0.016, &VectorFieldRegistry::new()).is_none());
    }

    #[test]
    fn test_command_routes_collision_phase() {
        let layout = ten_tile_layout();
        let config = sim_config(1000);
        let mut allocator = TileAllocator::new(layout.tile_count());
        let mut emitter = EmitterInstance::new(
            EmitterId(4),
            EmitterConfig {
                collision: true,
                sorted: true,
                point_attractor: Some(PointAttractor {
                    position: Vec3::Y,
                    radius: 1.0,
                    strength: 2.0,
                }),
                ..one_shot(9)
            },
            layout,
        );
        emitter.set_location(Vec3::new(5.0, 0.0, 0.0));
        emitter.activate();
        emitter.force_spawn(1);
        emitter.tick(0.016, &mut allocator, &config);

        let command = emitter.build_command(0.016, &VectorFieldRegistry::new()).unwrap();
        assert_eq!(command.phase, SimulationPhase::Collision);
        assert!(command.sorted);
        assert_eq!(command.per_frame.point_attractor, [5.0, 1.0, 0.0, 1.0]);
        assert!(command.bounds.contains_point(Vec3::new(5.0, 0.0, 0.0)));
        assert_eq!(command.vector_fields.uniforms.active_slots(), 0);
    }

    #[test]
    fn test_warmup_advances_pending_particles() {
        let layout = ten_tile_layout();
        let config = sim_config(1000);
        let mut allocator = TileAllocator::new(layout.tile_count());
        let mut emitter = EmitterInstance::new(
            EmitterId(1),
            EmitterConfig {
                spawn_rate: 10.0,
                lifetime: FloatRange::constant(10.0),
                acceleration: Vec3::new(0.0, -1.0, 0.0),
                ..Default::default()
            },
            layout,
        );
        emitter.activate();
        let report = emitter.warmup(1.0, 0.1, &mut allocator, &config);
        assert!(report.injected >= 9);
        let oldest = emitter
            .pending_spawns()
            .iter()
            .map(|r| r.relative_time)
            .fold(0.0f32, f32::max);
        assert!(oldest > 0.08, "oldest relative time {}", oldest);
        assert!(emitter.pending_spawns().iter().all(|r| r.velocity.y <= 0.0));
        assert!(emitter.pending_spawns().iter().any(|r| r.velocity.y < -0.5));
    }

    #[test]
    fn test_local_space_offsets_live_particles() {
        let layout = ten_tile_layout();
        let mut emitter = EmitterInstance::new(
            EmitterId(1),
            EmitterConfig {
                local_space: true,
                ..one_shot(10)
            },
            layout,
        );
        let mut allocator = TileAllocator::new(layout.tile_count());
        emitter.activate();
        emitter.force_spawn(1);
        emitter.tick(0.016, &mut allocator, &sim_config(100));
        emitter.set_location(Vec3::new(0.0, 2.0, 0.0));

        let registry = VectorFieldRegistry::new();
        let command = emitter.build_command(0.016, &registry).unwrap();
        assert_eq!(command.per_frame.position_offset, [0.0, 2.0, 0.0, 0.0]);
        let next = emitter.build_command(0.016, &registry).unwrap();
        assert_eq!(next.per_frame.position_offset, [0.0; 4]);
    }

    #[test]
    fn test_saturated_request_is_truncated_not_fatal() {
        let layout = ten_tile_layout();
        let mut allocator = TileAllocator::new(layout.tile_count());
        let mut emitter = EmitterInstance::new(
            EmitterId(1),
            EmitterConfig {
                bursts: vec![Burst::new(0.0, 5)],
                ..one_shot(11)
            },
            layout,
        );
        emitter.activate();
        emitter.force_spawn(u32::MAX);
        let report = emitter.tick(0.016, &mut allocator, &sim_config(1000));

        assert_eq!(report.requested, u32::MAX);
        assert_eq!(report.injected, 160);
        assert_eq!(report.dropped_by_cap, u32::MAX - 1000);
        assert_eq!(report.dropped_by_capacity, 1000 - 160);
    }

    #[test]
    fn test_pre_advanced_spawns_carry_their_orbit_phase() {
        let layout = ten_tile_layout();
        let orbit = Orbit {
            offset_base: Vec3::new(1.0, 1.0, 0.0),
            frequency_base: Vec3::new(2.0, 3.0, 0.0),
            ..Default::default()
        };
        let mut emitter = EmitterInstance::new(
            EmitterId(1),
            EmitterConfig {
                spawn_rate: 100.0,
                lifetime: FloatRange::constant(0.5),
                orbit,
                ..Default::default()
            },
            layout,
        );
        let mut allocator = TileAllocator::new(layout.tile_count());
        emitter.activate();
        emitter.tick(0.1, &mut allocator, &sim_config(1000));

        let spawns = emitter.pending_spawns();
        assert!(spawns.iter().any(|r| r.relative_time > 0.05));
        for record in spawns {
            let expected = orbit.offset(record.relative_time, record.random_orbit);
            assert!(
                (record.position - expected).length() < 1e-4,
                "position {:?} expected {:?}",
                record.position,
                expected
            );
        }
    }

    #[test]
    fn test_first_placement_does_not_trail_from_origin() {
        let layout = ten_tile_layout();
        let mut emitter = EmitterInstance::new(
            EmitterId(1),
            EmitterConfig {
                spawn_rate: 100.0,
                lifetime: FloatRange::constant(5.0),
                ..Default::default()
            },
            layout,
        );
        let mut allocator = TileAllocator::new(layout.tile_count());
        emitter.activate();
        emitter.set_location(Vec3::new(10.0, 0.0, 0.0));
        emitter.tick(0.1, &mut allocator, &sim_config(1000));

        assert!(!emitter.pending_spawns().is_empty());
        for record in emitter.pending_spawns() {
            assert!((record.position.x - 10.0).abs() < 1e-4, "spawned at {:?}", record.position);
        }

        // Once particles are live, movement is spread along the path again.
        emitter.build_command(0.1, &VectorFieldRegistry::new()).unwrap();
        emitter.set_location(Vec3::new(20.0, 0.0, 0.0));
        emitter.tick(0.1, &mut allocator, &sim_config(1000));
        assert!(emitter.pending_spawns().iter().any(|r| r.position.x < 19.0));
    }

    #[test]
    fn test_max_sprite_size_covers_both_axes() {
        let square = EmitterConfig {
            size_x: FloatRange::new(0.1, 0.4),
            ..Default::default()
        };
        assert_eq!(square.max_sprite_size(), 0.4);
        let tall = EmitterConfig {
            size_x: FloatRange::constant(0.2),
            size_y: Some(FloatRange::new(1.5, 0.5)),
            ..Default::default()
        };
        assert_eq!(tall.max_sprite_size(), 1.5);
    }
}
