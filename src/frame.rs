//! Producer/consumer frame handoff.
//!
//! The producer (game side) ticks emitters and packs everything the GPU needs
//! for one frame into a [`FrameBatch`]: per emitter, the tiles to simulate, the
//! freshly allocated tiles to clear, the spawn records to inject and the
//! uniform values. Batches cross to the consumer (render side) over a bounded
//! channel and are executed in order, one per frame.
//!
//! The consumer never touches allocator state; it only reads the tile indices
//! carried by each batch. Because batches are executed strictly in submission
//! order, a tile released by one emitter and reissued to another is always
//! cleared for its new owner after every command of its old owner has run.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use glam::Vec3;

use crate::bounds::Aabb;
use crate::error::HandoffError;
use crate::spawn::SpawnRecord;
use crate::uniforms::{PerFrameUniforms, SimulationUniforms};
use crate::vector_field::CombinedVectorFields;

/// Which simulation pass a tile runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SimulationPhase {
    /// Particles that ignore scene depth.
    Main,
    /// Particles that collide with scene depth. Runs in `Main` when the frame
    /// has no collision view.
    Collision,
}

impl SimulationPhase {
    pub const ALL: [SimulationPhase; 2] = [SimulationPhase::Main, SimulationPhase::Collision];
}

/// Identifies an emitter within a [`ParticleWorld`](crate::ParticleWorld).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EmitterId(pub u32);

/// GPU work for one emitter in one frame.
#[derive(Clone, Debug)]
pub struct EmitterCommand {
    pub emitter: EmitterId,
    /// Requested phase; the consumer may route `Collision` to `Main`.
    pub phase: SimulationPhase,
    /// Every tile the emitter owns, simulated this frame.
    pub tiles: Vec<u32>,
    /// Tiles newly taken from the allocator; cleared before injection.
    pub tiles_to_clear: Vec<u32>,
    pub spawns: Vec<SpawnRecord>,
    pub simulation: SimulationUniforms,
    pub per_frame: PerFrameUniforms,
    pub vector_fields: CombinedVectorFields,
    /// Conservative world bounds of the emitter's particles.
    pub bounds: Aabb,
    /// Include the emitter in the frame's back-to-front sort.
    pub sorted: bool,
}

impl EmitterCommand {
    /// Whether the command has any GPU work.
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty() && self.tiles_to_clear.is_empty() && self.spawns.is_empty()
    }
}

/// Everything the consumer executes for one frame.
#[derive(Clone, Debug, Default)]
pub struct FrameBatch {
    pub frame: u64,
    pub delta_seconds: f32,
    pub commands: Vec<EmitterCommand>,
    /// Camera origin for sorting; no sort runs without one.
    pub sort_origin: Option<Vec3>,
    /// Spawn records per injection dispatch; `None` keeps the executor's setting.
    pub max_injection_batch: Option<u32>,
}

impl FrameBatch {
    pub fn new(frame: u64, delta_seconds: f32) -> Self {
        Self {
            frame,
            delta_seconds,
            commands: Vec::new(),
            sort_origin: None,
            max_injection_batch: None,
        }
    }

    /// Drop every command belonging to `emitter`.
    ///
    /// Used when an emitter is torn down mid-frame so none of its work is
    /// applied after its tiles return to the allocator.
    pub fn discard_emitter(&mut self, emitter: EmitterId) -> usize {
        let before = self.commands.len();
        self.commands.retain(|c| c.emitter != emitter);
        before - self.commands.len()
    }

    pub fn spawn_count(&self) -> usize {
        self.commands.iter().map(|c| c.spawns.len()).sum()
    }

    pub fn tile_count(&self) -> usize {
        self.commands.iter().map(|c| c.tiles.len()).sum()
    }
}

/// Create a bounded frame channel holding at most `capacity` pending batches.
pub fn frame_channel(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    (FrameSender { tx }, FrameReceiver { rx })
}

/// Producer end of the frame channel.
#[derive(Clone)]
pub struct FrameSender {
    tx: Sender<FrameBatch>,
}

impl FrameSender {
    /// Hand a batch to the consumer.
    ///
    /// Never waits while the channel has room. When the consumer has fallen a
    /// full channel behind, this blocks until it catches up by one frame.
    pub fn submit(&self, batch: FrameBatch) -> Result<(), HandoffError> {
        match self.tx.try_send(batch) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(batch)) => {
                log::warn!(
                    "Frame channel full at frame {}; waiting for the consumer",
                    batch.frame
                );
                let frame = batch.frame;
                self.tx
                    .send(batch)
                    .map_err(|_| HandoffError::Disconnected { frame })
            }
            Err(TrySendError::Disconnected(batch)) => {
                Err(HandoffError::Disconnected { frame: batch.frame })
            }
        }
    }

    /// Batches waiting for the consumer.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

/// Consumer end of the frame channel.
pub struct FrameReceiver {
    rx: Receiver<FrameBatch>,
}

impl FrameReceiver {
    /// Next batch if one is waiting.
    pub fn try_next(&self) -> Option<FrameBatch> {
        match self.rx.try_recv() {
            Ok(batch) => Some(batch),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Block until a batch arrives; `None` once the producer is gone.
    pub fn next_blocking(&self) -> Option<FrameBatch> {
        self.rx.recv().ok()
    }

    /// All waiting batches, oldest first.
    pub fn drain(&self) -> Vec<FrameBatch> {
        self.rx.try_iter().collect()
    }
}
