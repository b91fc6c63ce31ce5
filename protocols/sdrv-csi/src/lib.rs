// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

#![doc = include_str!("../README.md")]

pub mod csi_core;
pub mod dbuf;
pub mod graph;
pub mod kstream;
pub mod mipi_csi2;
pub mod parallel;
pub mod pixfmt;
pub mod regs;
pub mod subdev;
pub mod video;

use {
    glib::{Error, FileError},
    std::sync::{Arc, PoisonError},
};

/// Accessor to 32 bit registers in memory-mapped I/O region.
///
/// Both of control path and interrupt path access the same region, thus the accessor is
/// shared between them.
pub trait RegisterIo: Send + Sync {
    /// Read the register at the offset.
    fn readl(&self, offset: u32) -> u32;

    /// Write the value to the register at the offset.
    fn writel(&self, offset: u32, val: u32);

    /// Clear the bits of mask in the register.
    fn clr(&self, offset: u32, mask: u32) {
        let val = self.readl(offset);
        self.writel(offset, val & !mask);
    }

    /// Set the bits of mask in the register.
    fn set(&self, offset: u32, mask: u32) {
        let val = self.readl(offset);
        self.writel(offset, val | mask);
    }

    /// Replace the bits of mask in the register with the value.
    fn update(&self, offset: u32, mask: u32, val: u32) {
        let curr = self.readl(offset);
        self.writel(offset, (curr & !mask) | (val & mask));
    }
}

impl<T: RegisterIo + ?Sized> RegisterIo for Arc<T> {
    fn readl(&self, offset: u32) -> u32 {
        (**self).readl(offset)
    }

    fn writel(&self, offset: u32, val: u32) {
        (**self).writel(offset, val)
    }
}

/// The set of register blocks which receive the same register write.
///
/// In synchronized mode, one logical image pipe drives several hardware blocks in lock-step,
/// thus any register write for the pipe is replicated to all of them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Replicas {
    /// The offset of the first block.
    pub base: u32,
    /// The distance between blocks.
    pub stride: u32,
    /// The number of blocks.
    pub count: u32,
}

impl Replicas {
    /// The single block.
    pub const fn single(base: u32) -> Self {
        Self {
            base,
            stride: 0,
            count: 1,
        }
    }

    /// The blocks laid out by the stride.
    pub const fn strided(base: u32, stride: u32, count: u32) -> Self {
        Self {
            base,
            stride,
            count,
        }
    }

    /// Iterate the offsets of blocks.
    pub fn offsets(&self) -> impl Iterator<Item = u32> {
        let Self {
            base,
            stride,
            count,
        } = *self;
        (0..count).map(move |i| base + i * stride)
    }

    /// Write the same value to the register in all of blocks.
    pub fn write(&self, io: &dyn RegisterIo, reg: u32, val: u32) {
        self.offsets().for_each(|block| io.writel(block + reg, val));
    }

    /// Write the value computed for the index of block to the register in all of blocks.
    pub fn write_with<F>(&self, io: &dyn RegisterIo, reg: u32, mut compute: F)
    where
        F: FnMut(u32) -> u32,
    {
        self.offsets()
            .enumerate()
            .for_each(|(i, block)| io.writel(block + reg, compute(i as u32)));
    }

    /// Read the register in all of blocks.
    pub fn read(&self, io: &dyn RegisterIo, reg: u32) -> Vec<u32> {
        self.offsets().map(|block| io.readl(block + reg)).collect()
    }
}

pub(crate) fn invalid_arg(msg: &str) -> Error {
    Error::new(FileError::Inval, msg)
}

pub(crate) fn poisoned<T>(e: PoisonError<T>) -> Error {
    let msg = format!("{}", e);
    Error::new(FileError::Io, &msg)
}

#[cfg(test)]
pub(crate) mod test_utils {
    use {
        super::{kstream::*, pixfmt::*, subdev::*, *},
        std::collections::HashMap,
        std::sync::Mutex,
    };

    /// Register file which records every write in order.
    #[derive(Default)]
    pub(crate) struct RecordingIo {
        state: Mutex<(HashMap<u32, u32>, Vec<(u32, u32)>)>,
    }

    impl RecordingIo {
        pub(crate) fn preset(&self, offset: u32, val: u32) {
            self.state.lock().unwrap().0.insert(offset, val);
        }

        pub(crate) fn value(&self, offset: u32) -> u32 {
            self.state
                .lock()
                .unwrap()
                .0
                .get(&offset)
                .copied()
                .unwrap_or_default()
        }

        pub(crate) fn writes(&self) -> Vec<(u32, u32)> {
            self.state.lock().unwrap().1.clone()
        }

        pub(crate) fn clear_log(&self) {
            self.state.lock().unwrap().1.clear();
        }
    }

    impl RegisterIo for RecordingIo {
        fn readl(&self, offset: u32) -> u32 {
            self.value(offset)
        }

        fn writel(&self, offset: u32, val: u32) {
            let mut state = self.state.lock().unwrap();
            state.0.insert(offset, val);
            state.1.push((offset, val));
        }
    }

    /// Upstream sub-device which records calls of s_stream with the number of register writes
    /// issued before the call.
    pub(crate) struct FakeSubdev {
        pub(crate) fmt: Mutex<MbusFrameFormat>,
        pub(crate) io: Arc<RecordingIo>,
        pub(crate) stream_calls: Mutex<Vec<(bool, usize)>>,
        pub(crate) power_calls: Mutex<Vec<bool>>,
        pub(crate) fail_stream: Mutex<bool>,
    }

    impl FakeSubdev {
        pub(crate) fn new(fmt: MbusFrameFormat, io: Arc<RecordingIo>) -> Self {
            Self {
                fmt: Mutex::new(fmt),
                io,
                stream_calls: Default::default(),
                power_calls: Default::default(),
                fail_stream: Default::default(),
            }
        }

        pub(crate) fn stream_calls(&self) -> Vec<(bool, usize)> {
            self.stream_calls.lock().unwrap().clone()
        }
    }

    impl V4l2Subdev for FakeSubdev {
        fn name(&self) -> String {
            "fake-sensor".to_string()
        }

        fn s_power(&self, on: bool) -> Result<(), Error> {
            self.power_calls.lock().unwrap().push(on);
            Ok(())
        }

        fn s_stream(&self, enable: bool) -> Result<(), Error> {
            let count = self.io.writes().len();
            self.stream_calls.lock().unwrap().push((enable, count));
            if *self.fail_stream.lock().unwrap() {
                Err(Error::new(FileError::Io, "stream failure"))
            } else {
                Ok(())
            }
        }

        fn get_fmt(&self, _: u32) -> Result<MbusFrameFormat, Error> {
            Ok(*self.fmt.lock().unwrap())
        }

        fn set_fmt(&self, _: u32, fmt: &mut MbusFrameFormat) -> Result<(), Error> {
            *self.fmt.lock().unwrap() = *fmt;
            Ok(())
        }

        fn g_frame_interval(&self) -> Result<FrameInterval, Error> {
            Ok(FrameInterval::default())
        }
    }

    /// Buffer queue which records returned buffers.
    #[derive(Default)]
    pub(crate) struct FakeVb2 {
        pub(crate) done: Mutex<Vec<(KstreamBuffer, Vb2BufferState)>>,
    }

    impl FakeVb2 {
        pub(crate) fn returned(&self) -> Vec<(u32, Vb2BufferState)> {
            self.done
                .lock()
                .unwrap()
                .iter()
                .map(|(buf, state)| (buf.index, *state))
                .collect()
        }
    }

    impl Vb2Core for FakeVb2 {
        fn buffer_done(&self, buf: KstreamBuffer, state: Vb2BufferState) {
            self.done.lock().unwrap().push((buf, state));
        }
    }

    pub(crate) fn uyvy_format(width: u32, height: u32) -> MbusFrameFormat {
        MbusFrameFormat {
            width,
            height,
            code: MbusCode::Uyvy8_2x8,
            field: Field::None,
        }
    }

    pub(crate) fn buffer(index: u32, addr: u64) -> KstreamBuffer {
        KstreamBuffer::new(index, &[addr])
    }
}
