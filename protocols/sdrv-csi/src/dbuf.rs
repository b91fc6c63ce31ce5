// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Two-stage pipeline of buffers for DMA with shadow registers.
//!
//! The buffer whose address is written to shadow registers is armed. At next frame boundary,
//! the hardware latches the address and starts writing to the buffer, then the buffer is
//! active. The active buffer is retired when the hardware reports completion of the frame.

/// The state of slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    /// The address of buffer is written to shadow registers.
    Armed,
    /// The hardware writes to the buffer.
    Active,
}

/// The slots for armed and active buffers.
///
/// The buffers are moved into the slots, thus one buffer never occupies both slots.
#[derive(Debug)]
pub struct DoubleBuffer<T> {
    ready: Option<T>,
    active: Option<T>,
}

impl<T> Default for DoubleBuffer<T> {
    fn default() -> Self {
        Self {
            ready: None,
            active: None,
        }
    }
}

impl<T> DoubleBuffer<T> {
    /// Promote the armed buffer to active and arm the next buffer. The buffer which was still
    /// active is displaced and returned; it missed its completion.
    pub fn advance(&mut self, next: T) -> Option<T> {
        let displaced = self.active.take();
        self.active = self.ready.replace(next);
        displaced
    }

    /// Take the active buffer.
    pub fn retire(&mut self) -> Option<T> {
        self.active.take()
    }

    /// Take all of buffers; the active one at first.
    pub fn drain(&mut self) -> Vec<T> {
        self.active
            .take()
            .into_iter()
            .chain(self.ready.take())
            .collect()
    }

    pub fn ready(&self) -> Option<&T> {
        self.ready.as_ref()
    }

    pub fn active(&self) -> Option<&T> {
        self.active.as_ref()
    }

    /// The state of slots for armed and active buffers.
    pub fn states(&self) -> (SlotState, SlotState) {
        let ready = if self.ready.is_some() {
            SlotState::Armed
        } else {
            SlotState::Empty
        };
        let active = if self.active.is_some() {
            SlotState::Active
        } else {
            SlotState::Empty
        };
        (ready, active)
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_none() && self.active.is_none()
    }
}
