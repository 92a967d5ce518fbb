//! Double-buffer bookkeeping for the particle state atlas.
//!
//! Position and velocity live in two physical copies, `A` and `B`. Each frame
//! one copy is the simulation source (previous state) and the other the
//! destination (current state). Which is which is an explicit [`BufferParity`]
//! rather than the low bit of a counter.
//!
//! Every physical copy is tagged with the [`Revision`] it holds. A simulation
//! pass for revision N reads the copy holding N-1 and writes the copy that will
//! hold N. [`ParticleStateStore::try_begin_pass`] hands out each
//! `(phase, source, dest)` pass at most once per frame, so any number of
//! consumers asking for the same pass share one dispatch.

use std::collections::HashSet;

use crate::frame::SimulationPhase;

/// Selects one of the two physical state copies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferParity {
    A,
    B,
}

impl BufferParity {
    /// The other copy.
    #[inline]
    pub fn other(self) -> Self {
        match self {
            BufferParity::A => BufferParity::B,
            BufferParity::B => BufferParity::A,
        }
    }

    /// Switch to the other copy in place.
    #[inline]
    pub fn flip(&mut self) {
        *self = self.other();
    }

    /// Array index of this copy (`A` = 0, `B` = 1).
    #[inline]
    pub fn index(self) -> usize {
        match self {
            BufferParity::A => 0,
            BufferParity::B => 1,
        }
    }
}

/// Generation tag of the state held by a physical copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(pub u64);

impl Revision {
    #[inline]
    pub fn next(self) -> Self {
        Revision(self.0 + 1)
    }
}

/// Revisions read and written by one simulation pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PassRevisions {
    /// Phase the pass simulates.
    pub phase: SimulationPhase,
    /// Revision read from the previous copy.
    pub source: Revision,
    /// Revision written into the current copy.
    pub dest: Revision,
    /// Physical copy being written.
    pub dest_parity: BufferParity,
}

/// Parity, revisions and per-frame pass memo.
#[derive(Debug)]
pub struct ParticleStateStore {
    current: BufferParity,
    revisions: [Revision; 2],
    frame: u64,
    in_frame: bool,
    completed: HashSet<(SimulationPhase, Revision, Revision)>,
}

impl Default for ParticleStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParticleStateStore {
    /// Both copies start at revision 0 with `A` current.
    pub fn new() -> Self {
        Self {
            current: BufferParity::A,
            revisions: [Revision(0), Revision(0)],
            frame: 0,
            in_frame: false,
            completed: HashSet::new(),
        }
    }

    /// Start a new frame: flip parity once and retag the new current copy.
    ///
    /// Returns the revision this frame will write.
    pub fn begin_frame(&mut self) -> Revision {
        let latest = self.latest_revision();
        self.current.flip();
        self.revisions[self.current.index()] = latest.next();
        self.completed.clear();
        self.frame += 1;
        self.in_frame = true;
        latest.next()
    }

    /// Close the frame. Passes requested after this belong to no frame.
    pub fn end_frame(&mut self) {
        self.in_frame = false;
    }

    /// Whether a frame is currently being executed.
    #[inline]
    pub fn in_frame(&self) -> bool {
        self.in_frame
    }

    /// Number of frames begun so far.
    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Copy written this frame.
    #[inline]
    pub fn current_parity(&self) -> BufferParity {
        self.current
    }

    /// Copy read this frame.
    #[inline]
    pub fn previous_parity(&self) -> BufferParity {
        self.current.other()
    }

    /// Copy holding the last completed frame. While a frame is open the
    /// current copy may be only partly simulated.
    #[inline]
    pub fn completed_parity(&self) -> BufferParity {
        if self.in_frame {
            self.previous_parity()
        } else {
            self.current
        }
    }

    /// Revision held by a physical copy.
    #[inline]
    pub fn revision_of(&self, parity: BufferParity) -> Revision {
        self.revisions[parity.index()]
    }

    fn latest_revision(&self) -> Revision {
        self.revisions[0].max(self.revisions[1])
    }

    /// Claim the simulation pass for `phase` in the current frame.
    ///
    /// Returns `None` when the pass has already run this frame (or no frame is
    /// open); the caller reuses the existing result instead of dispatching.
    pub fn try_begin_pass(&mut self, phase: SimulationPhase) -> Option<PassRevisions> {
        if !self.in_frame {
            return None;
        }
        let source = self.revision_of(self.previous_parity());
        let dest = self.revision_of(self.current);
        debug_assert_eq!(source.next(), dest, "source and dest revisions out of step");
        if !self.completed.insert((phase, source, dest)) {
            return None;
        }
        Some(PassRevisions {
            phase,
            source,
            dest,
            dest_parity: self.current,
        })
    }
}
