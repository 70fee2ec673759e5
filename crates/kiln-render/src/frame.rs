//! Per-frame command slot allocation.
//!
//! Every frame in flight owns `per_frame` consecutive slots. A canvas takes
//! one slot per render pass it records; `end_frame` submits the slots taken
//! during the frame in the order they were taken.

use crate::backend::CommandSlot;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame {frame} used all {capacity} command buffers")]
    CommandBuffersExhausted { frame: usize, capacity: usize },
}

#[derive(Debug)]
pub struct FrameCommands {
    frames_in_flight: usize,
    per_frame: usize,
    frame: usize,
    count: usize,
}

impl FrameCommands {
    pub fn new(frames_in_flight: usize, per_frame: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            per_frame: per_frame.max(1),
            frame: 0,
            count: 0,
        }
    }

    /// Start recording frame-in-flight `frame`, resetting the running count.
    pub fn begin(&mut self, frame: usize) {
        self.frame = frame % self.frames_in_flight;
        self.count = 0;
    }

    /// Take the next slot of the current frame.
    pub fn next_slot(&mut self) -> Result<CommandSlot, FrameError> {
        if self.count >= self.per_frame {
            return Err(FrameError::CommandBuffersExhausted {
                frame: self.frame,
                capacity: self.per_frame,
            });
        }
        let slot = CommandSlot(self.frame * self.per_frame + self.count);
        self.count += 1;
        Ok(slot)
    }

    /// Slots taken so far this frame.
    pub fn running_count(&self) -> usize {
        self.count
    }

    /// The slots taken this frame, in order.
    pub fn recorded(&self) -> Vec<CommandSlot> {
        let base = self.frame * self.per_frame;
        (base..base + self.count).map(CommandSlot).collect()
    }

    pub fn current_frame(&self) -> usize {
        self.frame
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Total slots across every frame in flight.
    pub fn capacity(&self) -> usize {
        self.frames_in_flight * self.per_frame
    }
}
