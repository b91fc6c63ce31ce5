// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Video node and buffer queue over kstream.
//!
//! The node supports multi-planar capture only. The format operations are serialized by one
//! mutex, and the queue operations by another one, while the buffers handed to kstream are
//! protected by the lock of kstream shared with interrupt path.

use {
    super::{kstream::*, pixfmt::*, regs::MAX_PLANES, subdev::*, *},
    bitflags::bitflags,
    std::sync::Mutex,
    tracing::debug,
};

bitflags! {
    /// The modes of I/O for buffers.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct IoModes: u32 {
        const MMAP = 0x01;
        const USERPTR = 0x02;
        const READ = 0x04;
        const DMABUF = 0x10;
    }
}

bitflags! {
    /// The capabilities of device, compatible with `V4L2_CAP_*`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DeviceCaps: u32 {
        const VIDEO_CAPTURE_MPLANE = 0x0000_1000;
        const READWRITE = 0x0100_0000;
        const STREAMING = 0x0400_0000;
    }
}

/// The minimum number of buffers for double buffering.
pub const MIN_BUFFERS: u32 = 2;

/// The multi-planar format of video node.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PixFormatMplane {
    pub width: u32,
    pub height: u32,
    pub pixelformat: PixelFormat,
    pub field: Field,
    pub num_planes: usize,
    pub bytesperline: [u32; MAX_PLANES],
    pub sizeimage: [u32; MAX_PLANES],
}

impl Default for PixFormatMplane {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            pixelformat: PixelFormat::default(),
            field: Field::default(),
            num_planes: 0,
            bytesperline: [0; MAX_PLANES],
            sizeimage: [0; MAX_PLANES],
        }
    }
}

/// The result of capability query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub device_caps: DeviceCaps,
}

/// Allocator of memory for DMA.
pub trait DmaAllocator: Send + Sync {
    /// Allocate memory and return its address for DMA.
    fn alloc(&self, size: usize) -> Result<u64, Error>;

    fn free(&self, addr: u64, size: usize);
}

/// Allocator reserving padding before and after each buffer, so that the hardware can write
/// the pixels for horizontal crop compensation out of the buffer.
#[derive(Debug)]
pub struct HcropAllocator<A: DmaAllocator> {
    inner: A,
    front: usize,
    back: usize,
}

impl<A: DmaAllocator> HcropAllocator<A> {
    pub fn new(inner: A, front: usize, back: usize) -> Self {
        Self { inner, front, back }
    }

    pub fn padding(&self) -> (usize, usize) {
        (self.front, self.back)
    }
}

impl<A: DmaAllocator> DmaAllocator for HcropAllocator<A> {
    fn alloc(&self, size: usize) -> Result<u64, Error> {
        self.inner
            .alloc(self.front + size + self.back)
            .map(|addr| addr + self.front as u64)
    }

    fn free(&self, addr: u64, size: usize) {
        self.inner
            .free(addr - self.front as u64, self.front + size + self.back)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    streaming: bool,
    num_buffers: u32,
}

/// The video node for kstream.
pub struct KstreamVideo {
    kstream: Arc<KstreamDevice>,
    host_id: u32,
    lock: Mutex<PixFormatMplane>,
    q_lock: Mutex<QueueState>,
}

impl KstreamVideo {
    /// Instantiate with the format adjusted to the sink pad of kstream.
    pub fn new(host_id: u32, kstream: Arc<KstreamDevice>) -> Result<Self, Error> {
        let video = Self {
            kstream,
            host_id,
            lock: Default::default(),
            q_lock: Default::default(),
        };

        let mut fmt = video.default_fmt(PixelFormat::default())?;
        video.s_fmt(&mut fmt)?;

        Ok(video)
    }

    /// The format to capture whole of crop window at the sink pad. The padding for crop
    /// compensation is excluded from the width, and the frames of all cameras are stacked
    /// vertically in synchronized mode.
    pub fn default_fmt(&self, pixelformat: PixelFormat) -> Result<PixFormatMplane, Error> {
        let crop = self.kstream.get_fmt(KSTREAM_PAD_SOURCE)?;
        let config = self.kstream.config();
        let padding = config.hcrop.line_padding(crop.field.is_interlaced());
        let channels = if config.sync { SYNC_CHANNELS } else { 1 };

        let mut fmt = PixFormatMplane {
            width: crop.width.saturating_sub(padding),
            height: crop.height * channels,
            pixelformat,
            ..Default::default()
        };
        self.try_fmt(&mut fmt)?;
        Ok(fmt)
    }

    pub fn kstream(&self) -> &Arc<KstreamDevice> {
        &self.kstream
    }

    pub fn name(&self) -> String {
        format!("sdrv-video-{}-{}", self.host_id, self.kstream.id())
    }

    /// The modes of I/O. The buffer from user space is not available with crop compensation
    /// since padding is required out of the buffer.
    pub fn io_modes(&self) -> IoModes {
        if self.kstream.config().hcrop.is_active() {
            IoModes::MMAP | IoModes::READ
        } else {
            IoModes::MMAP | IoModes::USERPTR | IoModes::READ | IoModes::DMABUF
        }
    }

    /// The number of bytes reserved before and after each buffer for crop compensation.
    pub fn hcrop_padding(&self) -> Result<(usize, usize), Error> {
        let fmt = self.g_fmt()?;
        let bpp = find_by_pixfmt(fmt.pixelformat)
            .unwrap_or_else(|| KstreamPixFmt::negotiation_default())
            .bpp[0] as usize;
        let hcrop = &self.kstream.config().hcrop;
        let front = hcrop.max_front() as usize * bpp / 8;
        let back = hcrop.max_back() as usize * bpp / 8;
        Ok((front, back))
    }

    pub fn querycap(&self) -> Capability {
        Capability {
            driver: "sdrv-csi".to_string(),
            card: self.name(),
            bus_info: format!("platform:csi{}", self.host_id),
            device_caps: DeviceCaps::VIDEO_CAPTURE_MPLANE
                | DeviceCaps::READWRITE
                | DeviceCaps::STREAMING,
        }
    }

    /// Enumerate the pixel formats available for the bus of kstream.
    pub fn enum_fmt(&self, index: u32) -> Result<PixelFormat, Error> {
        let bus = self.kstream.config().bus.class();
        let mut fmts: Vec<PixelFormat> = Vec::new();
        PIX_FMTS
            .iter()
            .filter(|entry| entry.bus == bus)
            .for_each(|entry| {
                if !fmts.contains(&entry.pixfmt) {
                    fmts.push(entry.pixfmt);
                }
            });
        fmts.get(index as usize)
            .copied()
            .ok_or_else(|| invalid_arg("Index out of range"))
    }

    /// Adjust the format to the one available.
    pub fn try_fmt(&self, fmt: &mut PixFormatMplane) -> Result<(), Error> {
        let sink = self.kstream.get_fmt(KSTREAM_PAD_SINK)?;
        let crop = self.kstream.get_fmt(KSTREAM_PAD_SOURCE)?;
        let config = self.kstream.config();

        let kpfmt = find_pix_fmt(fmt.pixelformat, sink.code, config.bus.class())
            .unwrap_or_else(|| KstreamPixFmt::negotiation_default());

        let max_height = if config.sync {
            IMG_Y_MAX * SYNC_CHANNELS
        } else {
            IMG_Y_MAX
        };
        // The hardware writes the padding for crop compensation in the crop window.
        let padding = config.hcrop.line_padding(sink.field.is_interlaced());
        let max_width = crop.width.saturating_sub(padding).clamp(IMG_X_MIN, IMG_X_MAX);
        fmt.width = fmt.width.clamp(IMG_X_MIN, max_width);
        fmt.height = fmt.height.clamp(IMG_Y_MIN, max_height);
        fmt.pixelformat = kpfmt.pixfmt;
        fmt.field = sink.field;
        fmt.num_planes = kpfmt.planes;

        let line_width = fmt.width + padding;
        fmt.bytesperline = [0; MAX_PLANES];
        fmt.sizeimage = [0; MAX_PLANES];
        (0..kpfmt.planes).for_each(|p| {
            let bpl = kpfmt.bytesperline(p, line_width);
            fmt.bytesperline[p] = bpl;
            fmt.sizeimage[p] = kpfmt.plane_size(p, bpl, fmt.height);
        });

        Ok(())
    }

    pub fn s_fmt(&self, fmt: &mut PixFormatMplane) -> Result<(), Error> {
        if self.q_lock.lock().map_err(poisoned)?.streaming {
            Err(Error::new(FileError::Again, "Video node is streaming"))?;
        }

        let mut curr = self.lock.lock().map_err(poisoned)?;
        self.try_fmt(fmt)?;
        self.kstream.set_video_fmt(fmt)?;
        *curr = *fmt;
        debug!(video = self.name().as_str(), ?fmt);

        Ok(())
    }

    pub fn g_fmt(&self) -> Result<PixFormatMplane, Error> {
        self.lock.lock().map(|fmt| *fmt).map_err(poisoned)
    }

    /// Decide the number of buffers and the size of planes.
    pub fn queue_setup(&self, num_buffers: &mut u32) -> Result<Vec<u32>, Error> {
        let mut q = self.q_lock.lock().map_err(poisoned)?;
        let fmt = self.g_fmt()?;
        *num_buffers = std::cmp::max(*num_buffers, MIN_BUFFERS);
        q.num_buffers = *num_buffers;
        Ok(fmt.sizeimage[..fmt.num_planes].to_vec())
    }

    /// Check the size of planes in the buffer.
    pub fn buf_prepare(&self, plane_sizes: &[u32]) -> Result<(), Error> {
        let fmt = self.g_fmt()?;
        if plane_sizes.len() < fmt.num_planes {
            let msg = format!(
                "The number of planes {} is less than {}",
                plane_sizes.len(),
                fmt.num_planes
            );
            Err(invalid_arg(&msg))?;
        }
        plane_sizes
            .iter()
            .zip(&fmt.sizeimage[..fmt.num_planes])
            .enumerate()
            .try_for_each(|(i, (size, required))| {
                if size < required {
                    let msg = format!("Plane {} is too small: {} < {}", i, size, required);
                    Err(invalid_arg(&msg))
                } else {
                    Ok(())
                }
            })
    }

    pub fn buf_queue(&self, buf: KstreamBuffer) -> Result<(), Error> {
        self.kstream.queue_buffer(buf)
    }

    /// Start streaming. At failure, the queued buffers are returned as queued state.
    pub fn start_streaming(&self) -> Result<(), Error> {
        let mut q = self.q_lock.lock().map_err(poisoned)?;

        let res = if self.kstream.state() == KstreamState::Stopped {
            self.kstream.init_device()
        } else {
            Ok(())
        }
        .and_then(|_| self.kstream.s_stream(true));

        match res {
            Ok(_) => {
                q.streaming = true;
                Ok(())
            }
            Err(err) => {
                self.kstream.return_buffers(Vb2BufferState::Queued)?;
                Err(err)
            }
        }
    }

    /// Stop streaming. All of buffers are returned as error state.
    pub fn stop_streaming(&self) -> Result<(), Error> {
        let mut q = self.q_lock.lock().map_err(poisoned)?;
        q.streaming = false;
        self.kstream.s_stream(false)
    }

    pub fn is_streaming(&self) -> bool {
        self.q_lock.lock().map(|q| q.streaming).unwrap_or(false)
    }
}
