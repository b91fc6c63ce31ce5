// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Image pipe of CSI host, called as kstream.
//!
//! The kstream has two pads; sink from interface and source to video node. At start of
//! streaming, the registers of pipe are programmed in fixed order; write DMA, pixel interrupt
//! mask, pixel control, timing of parallel bus, crop window, channel split and pack, stride
//! and size, then base address of the first buffer. The upstream interface is started only
//! after all of them.
//!
//! The base address registers are shadowed. The address written in shadow registers is latched
//! by the hardware at next frame boundary, then shadow update interrupt is generated. At the
//! interrupt, the buffer for the latched address is promoted to active and the address of next
//! buffer is written. At frame done interrupt, the active buffer is returned to buffer queue.
//!
//! In synchronized mode, one kstream drives all of image pipes in lock-step to capture four
//! cameras into four quadrants of one buffer.

use {
    super::{dbuf::*, pixfmt::*, regs::*, subdev::*, video::PixFormatMplane, *},
    glib::{error::ErrorDomain, Quark},
    std::{
        collections::VecDeque,
        sync::{Arc, Mutex, MutexGuard},
        time::Instant,
    },
    tracing::{debug, debug_span, warn},
};

pub const KSTREAM_PAD_SINK: u32 = 0;
pub const KSTREAM_PAD_SOURCE: u32 = 1;

pub const IMG_X_MIN: u32 = 32;
pub const IMG_Y_MIN: u32 = 32;
pub const IMG_X_MAX: u32 = 4096;
pub const IMG_Y_MAX: u32 = 4096;

/// The number of cameras captured in synchronized mode.
pub const SYNC_CHANNELS: u32 = IMG_COUNT;

const WDMA_FIFO_THRESHOLD: u32 = 0x40;
const WDMA_PRIORITY: u32 = 0x3;

/// Any error of kstream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KstreamError {
    /// The operation is not available in current state.
    State,
    /// No interface is bound to sink pad.
    Unbound,
    Invalid(i32),
}

impl std::fmt::Display for KstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match self {
            KstreamError::State => "state",
            KstreamError::Unbound => "unbound",
            KstreamError::Invalid(_) => "invalid",
        };

        write!(f, "KstreamError::{}", msg)
    }
}

impl ErrorDomain for KstreamError {
    fn domain() -> Quark {
        Quark::from_str("sdrv-kstream-error-quark")
    }

    fn code(self) -> i32 {
        match self {
            KstreamError::State => 0,
            KstreamError::Unbound => 1,
            KstreamError::Invalid(v) => v,
        }
    }

    fn from(code: i32) -> Option<Self> {
        let enumeration = match code {
            0 => KstreamError::State,
            1 => KstreamError::Unbound,
            _ => KstreamError::Invalid(code),
        };
        Some(enumeration)
    }
}

/// The state of kstream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KstreamState {
    Stopped,
    Initing,
    Initialed,
    /// The hardware writes to buffers.
    Running,
    /// No buffer is available at the last shadow update.
    Idle,
    Stopping,
}

impl Default for KstreamState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl KstreamState {
    pub fn is_streaming(&self) -> bool {
        *self == Self::Running || *self == Self::Idle
    }
}

/// The number of pixels to compensate horizontal crop at the interface.
///
/// The hardware writes `front` pixels before and `back` pixels after the visible pixels in each
/// line, thus the base address is moved backward by `front` pixels. For interlaced source, the
/// pair for top and bottom fields is used instead.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct HcropCompensation {
    pub back: u32,
    pub front: u32,
    pub top_back: u32,
    pub top_front: u32,
    pub bottom_back: u32,
    pub bottom_front: u32,
}

impl HcropCompensation {
    pub fn is_active(&self) -> bool {
        *self != Self::default()
    }

    /// The number of padding pixels in one line.
    pub fn line_padding(&self, interlaced: bool) -> u32 {
        if interlaced {
            std::cmp::max(
                self.top_front + self.top_back,
                self.bottom_front + self.bottom_back,
            )
        } else {
            self.front + self.back
        }
    }

    /// The maximum number of pixels placed before the buffer.
    pub fn max_front(&self) -> u32 {
        self.front.max(self.top_front).max(self.bottom_front)
    }

    /// The maximum number of pixels placed after the buffer.
    pub fn max_back(&self) -> u32 {
        self.back.max(self.top_back).max(self.bottom_back)
    }
}

/// Timing parameters of parallel and BT.656 bus.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ParallelTiming {
    pub hsync_active_high: bool,
    pub vsync_active_high: bool,
    pub pclk_rising: bool,
    /// Validity of pixels at even cycles.
    pub even_mask: u32,
    /// Validity of pixels at odd cycles.
    pub odd_mask: u32,
}

/// Configuration of kstream.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct KstreamConfig {
    /// The index of image pipe.
    pub id: u32,
    pub bus: BusType,
    /// Synchronized mode.
    pub sync: bool,
    /// Virtual channel of MIPI CSI-2.
    pub vc: u32,
    pub hcrop: HcropCompensation,
    pub timing: ParallelTiming,
}

/// The state of buffer returned to buffer queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Vb2BufferState {
    /// Returned without processing; queued again.
    Queued,
    Done,
    Error,
}

/// The buffer for capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KstreamBuffer {
    pub index: u32,
    /// The address of planes for DMA.
    pub planes: [u64; MAX_PLANES],
    pub num_planes: usize,
    pub sequence: u32,
    /// Monotonic time at frame done.
    pub timestamp_ns: u64,
    pub field: Field,
}

impl KstreamBuffer {
    pub fn new(index: u32, addrs: &[u64]) -> Self {
        let mut planes = [0; MAX_PLANES];
        let num_planes = std::cmp::min(addrs.len(), MAX_PLANES);
        planes[..num_planes].copy_from_slice(&addrs[..num_planes]);
        Self {
            index,
            planes,
            num_planes,
            sequence: 0,
            timestamp_ns: 0,
            field: Field::None,
        }
    }
}

/// The queue to which buffers are returned.
pub trait Vb2Core: Send + Sync {
    fn buffer_done(&self, buf: KstreamBuffer, state: Vb2BufferState);
}

/// The layout of frame in DMA buffers, decided at start of streaming.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DmaLayout {
    pub planes: usize,
    /// The number of bytes in one line in memory.
    pub bytesperline: [u32; MAX_PLANES],
    /// The value of stride register; doubled for interlaced source.
    pub stride: [u32; MAX_PLANES],
    pub sizeimage: [u32; MAX_PLANES],
    /// The number of pixels in line written by hardware.
    pub hw_width: u32,
    /// The number of lines written by hardware for one field and one quadrant.
    pub hw_height: u32,
    pub field: Field,
    /// The number of bytes before the buffer for progressive source.
    pub front: [u32; MAX_PLANES],
    pub top_front: [u32; MAX_PLANES],
    pub bottom_front: [u32; MAX_PLANES],
    /// The distance between quadrants in synchronized mode.
    pub quadrant: [u32; MAX_PLANES],
}

impl DmaLayout {
    pub fn interlaced(&self) -> bool {
        self.field.is_interlaced()
    }

    fn first_field_front(&self) -> &[u32; MAX_PLANES] {
        if !self.interlaced() {
            &self.front
        } else if self.field.bottom_first() {
            &self.bottom_front
        } else {
            &self.top_front
        }
    }

    fn second_field_front(&self) -> &[u32; MAX_PLANES] {
        if self.field.bottom_first() {
            &self.top_front
        } else {
            &self.bottom_front
        }
    }

    /// The address to start DMA for the first field of the buffer.
    pub fn first_field_addrs(&self, buf: &KstreamBuffer) -> [u64; MAX_PLANES] {
        let fronts = self.first_field_front();
        let mut addrs = [0; MAX_PLANES];
        (0..self.planes).for_each(|p| {
            let mut addr = buf.planes[p];
            if self.interlaced() && self.field.bottom_first() {
                addr += self.bytesperline[p] as u64;
            }
            addrs[p] = addr - fronts[p] as u64;
        });
        addrs
    }

    /// The address to start DMA for the second field, derived from the one of first field.
    pub fn second_field_addrs(&self, first: &[u64; MAX_PLANES]) -> [u64; MAX_PLANES] {
        let first_fronts = self.first_field_front();
        let second_fronts = self.second_field_front();
        let mut addrs = [0; MAX_PLANES];
        (0..self.planes).for_each(|p| {
            let addr = first[p] + first_fronts[p] as u64 - second_fronts[p] as u64;
            addrs[p] = if self.field.bottom_first() {
                addr - self.bytesperline[p] as u64
            } else {
                addr + self.bytesperline[p] as u64
            };
        });
        addrs
    }
}

/// Operations for interrupts of image pipe.
pub trait KstreamIsrOperation: Send + Sync {
    /// Program the interface parameters of pipe at initialization.
    fn init_interface(&self, kstream: &KstreamDevice) -> Result<(), Error> {
        kstream.write_if_param();
        Ok(())
    }

    fn on_frame_done(&self, kstream: &KstreamDevice) {
        kstream.frame_done();
    }

    fn on_shadow_update(&self, kstream: &KstreamDevice) {
        kstream.shadow_update();
    }
}

/// The kstream for image pipe of CSI host.
#[derive(Default, Debug)]
pub struct DefaultKstream;

impl KstreamIsrOperation for DefaultKstream {}

#[derive(Debug, Default, Clone)]
struct PadState {
    sink: MbusFrameFormat,
    crop: Rect,
    video: PixFormatMplane,
}

#[derive(Debug, Default)]
struct BufferQueue {
    state: KstreamState,
    list: VecDeque<KstreamBuffer>,
    slots: DoubleBuffer<KstreamBuffer>,
    layout: DmaLayout,
    sequence: u32,
    /// Whether the second field of interlaced frame is pending.
    field: u32,
}

/// The image pipe.
pub struct KstreamDevice {
    config: KstreamConfig,
    io: Arc<dyn RegisterIo>,
    ops: Arc<dyn KstreamIsrOperation>,
    vb2: Arc<dyn Vb2Core>,
    interface: Mutex<Option<(Arc<dyn V4l2Subdev>, u32)>>,
    pads: Mutex<PadState>,
    // Shared by control path and interrupt path.
    queue: Mutex<BufferQueue>,
    epoch: Instant,
}

impl std::fmt::Debug for KstreamDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("KstreamDevice")
            .field("config", &self.config)
            .finish()
    }
}

impl KstreamDevice {
    pub fn new(
        config: KstreamConfig,
        io: Arc<dyn RegisterIo>,
        ops: Arc<dyn KstreamIsrOperation>,
        vb2: Arc<dyn Vb2Core>,
    ) -> Self {
        let sink = MbusFrameFormat::default();
        let pads = PadState {
            sink,
            crop: Rect::full(&sink),
            video: Default::default(),
        };
        Self {
            config,
            io,
            ops,
            vb2,
            interface: Default::default(),
            pads: Mutex::new(pads),
            queue: Default::default(),
            epoch: Instant::now(),
        }
    }

    pub fn id(&self) -> u32 {
        self.config.id
    }

    pub fn config(&self) -> &KstreamConfig {
        &self.config
    }

    pub(crate) fn ops(&self) -> &Arc<dyn KstreamIsrOperation> {
        &self.ops
    }

    /// The blocks of register written for the pipe.
    pub fn replicas(&self) -> Replicas {
        if self.config.sync {
            Replicas::strided(img_base(0), IMG_REG_LEN, SYNC_CHANNELS)
        } else {
            Replicas::single(img_base(self.config.id))
        }
    }

    fn pipe_ids(&self) -> std::ops::Range<u32> {
        if self.config.sync {
            0..SYNC_CHANNELS
        } else {
            self.config.id..(self.config.id + 1)
        }
    }

    fn enable_bits(&self) -> u32 {
        let bits = self.pipe_ids().fold(0, |bits, id| bits | csi_img_en(id));
        if self.config.sync {
            bits | CSI_SYNC_EN
        } else {
            bits
        }
    }

    fn shadow_bits(&self) -> u32 {
        self.pipe_ids().fold(0, |bits, id| bits | csi_shadow_set(id))
    }

    fn irq_bits(&self) -> u32 {
        self.pipe_ids()
            .fold(0, |bits, id| bits | int_img_done(id) | int_img_update(id))
    }

    fn err_bits(&self) -> u32 {
        let bt656 = self.config.bus == BusType::Bt656;
        self.pipe_ids().fold(0, |mut bits, id| {
            bits |= int_bus_err(id) | int_pixel_err(id) | int_crop_err(id) | int_overflow(id);
            if bt656 {
                bits |= int_bt_sync_err(id) | int_bt_fatal(id);
            }
            bits
        })
    }

    fn lock_queue(&self) -> Result<MutexGuard<BufferQueue>, Error> {
        self.queue.lock().map_err(poisoned)
    }

    fn lock_pads(&self) -> Result<MutexGuard<PadState>, Error> {
        self.pads.lock().map_err(poisoned)
    }

    pub fn state(&self) -> KstreamState {
        self.queue
            .lock()
            .map(|q| q.state)
            .unwrap_or(KstreamState::Stopped)
    }

    /// The number of buffers waiting for DMA.
    pub fn pending_buffers(&self) -> usize {
        self.queue.lock().map(|q| q.list.len()).unwrap_or(0)
    }

    /// The state of slots for armed and active buffers.
    pub fn slot_states(&self) -> (SlotState, SlotState) {
        self.queue
            .lock()
            .map(|q| q.slots.states())
            .unwrap_or((SlotState::Empty, SlotState::Empty))
    }

    /// The layout of frame decided at last start of streaming.
    pub fn layout(&self) -> DmaLayout {
        self.queue.lock().map(|q| q.layout).unwrap_or_default()
    }

    /// Bind the interface to sink pad. The format of sink pad is taken from the source pad of
    /// interface.
    pub fn bind_interface(&self, interface: Arc<dyn V4l2Subdev>, pad: u32) -> Result<(), Error> {
        let mut fmt = interface.get_fmt(pad)?;
        self.set_fmt(KSTREAM_PAD_SINK, &mut fmt)?;
        debug!(
            kstream = self.config.id,
            interface = interface.name().as_str(),
            pad,
            ?fmt,
        );
        let mut entry = self.interface.lock().map_err(poisoned)?;
        *entry = Some((interface, pad));
        Ok(())
    }

    pub fn interface(&self) -> Result<(Arc<dyn V4l2Subdev>, u32), Error> {
        self.interface
            .lock()
            .map_err(poisoned)?
            .as_ref()
            .map(|(sd, pad)| (sd.clone(), *pad))
            .ok_or_else(|| Error::new(KstreamError::Unbound, "No interface is bound"))
    }

    pub fn video_fmt(&self) -> Result<PixFormatMplane, Error> {
        self.lock_pads().map(|pads| pads.video)
    }

    pub fn set_video_fmt(&self, fmt: &PixFormatMplane) -> Result<(), Error> {
        if self.state().is_streaming() {
            Err(Error::new(FileError::Again, "Kstream is streaming"))?;
        }
        self.lock_pads().map(|mut pads| pads.video = *fmt)
    }

    /// Put the buffer to the list for DMA.
    pub fn queue_buffer(&self, buf: KstreamBuffer) -> Result<(), Error> {
        self.lock_queue().map(|mut q| q.list.push_back(buf))
    }

    /// Put the buffer back to the list while streaming, else give it back.
    pub fn requeue_buffer(&self, buf: KstreamBuffer) -> Result<(), KstreamBuffer> {
        match self.queue.lock() {
            Ok(mut q) if q.state.is_streaming() => {
                q.list.push_back(buf);
                Ok(())
            }
            _ => Err(buf),
        }
    }

    /// Return all of buffers in the list and the slots with the state.
    pub fn return_buffers(&self, state: Vb2BufferState) -> Result<(), Error> {
        let bufs = self.lock_queue().map(|mut q| {
            let mut bufs = q.slots.drain();
            bufs.extend(q.list.drain(..));
            bufs
        })?;
        bufs.into_iter()
            .for_each(|buf| self.vb2.buffer_done(buf, state));
        Ok(())
    }

    /// Initialize the pipe. This is the only way to the initialized state.
    pub fn init_device(&self) -> Result<(), Error> {
        self.lock_queue().and_then(|mut q| {
            if q.state != KstreamState::Stopped {
                let msg = format!("Kstream {} is not stopped: {:?}", self.config.id, q.state);
                Err(Error::new(KstreamError::State, &msg))
            } else {
                q.state = KstreamState::Initing;
                Ok(())
            }
        })?;

        let res = self.ops.init_interface(self);

        let mut q = self.lock_queue()?;
        q.state = if res.is_ok() {
            KstreamState::Initialed
        } else {
            KstreamState::Stopped
        };
        res
    }

    /// Write bus type and virtual channel. In synchronized mode, the camera in each quadrant
    /// is received in its own virtual channel.
    pub fn write_if_param(&self) {
        let bus = self.config.bus.reg_val() & IF_PARAM_BUS_MASK;
        let sync = self.config.sync;
        let vc = self.config.vc;
        self.replicas().write_with(&*self.io, IMG_IF_PARAM, |j| {
            let vc = if sync { j } else { vc };
            bus | ((vc << IF_PARAM_VC_SHIFT) & IF_PARAM_VC_MASK)
        });
    }

    fn prepare_layout(
        &self,
        pads: &PadState,
    ) -> Result<(&'static KstreamPixFmt, DmaLayout), Error> {
        let video = &pads.video;
        let sink = &pads.sink;

        if video.width == 0 || video.height == 0 {
            Err(invalid_arg("Format of video node is not set"))?;
        }

        let bus = self.config.bus.class();
        let kpfmt = find_pix_fmt(video.pixelformat, sink.code, bus).ok_or_else(|| {
            let msg = format!(
                "Unsupported combination: {:?}, {:?}, {:?}",
                video.pixelformat, sink.code, bus
            );
            invalid_arg(&msg)
        })?;

        let interlaced = sink.field.is_interlaced();
        let hcrop = &self.config.hcrop;
        let hw_width = video.width + hcrop.line_padding(interlaced);
        if hw_width > pads.crop.width {
            let msg = format!(
                "Line width {} exceeds width of crop {}",
                hw_width, pads.crop.width
            );
            Err(invalid_arg(&msg))?;
        }

        let channels = if self.config.sync { SYNC_CHANNELS } else { 1 };
        let frame_height = video.height / channels;
        if frame_height > pads.crop.height {
            let msg = format!(
                "Height {} exceeds height of crop {}",
                frame_height, pads.crop.height
            );
            Err(invalid_arg(&msg))?;
        }

        let mut layout = DmaLayout {
            planes: kpfmt.planes,
            hw_width,
            hw_height: if interlaced {
                frame_height / 2
            } else {
                frame_height
            },
            field: sink.field,
            ..Default::default()
        };

        (0..kpfmt.planes).for_each(|p| {
            let bpp = kpfmt.bpp[p];
            let bpl = kpfmt.bytesperline(p, hw_width);
            let size = kpfmt.plane_size(p, bpl, video.height);
            layout.bytesperline[p] = bpl;
            layout.stride[p] = if interlaced { bpl * 2 } else { bpl };
            layout.sizeimage[p] = size;
            layout.front[p] = hcrop.front * bpp / 8;
            layout.top_front[p] = hcrop.top_front * bpp / 8;
            layout.bottom_front[p] = hcrop.bottom_front * bpp / 8;
            layout.quadrant[p] = if self.config.sync { size / channels } else { 0 };
        });

        Ok((kpfmt, layout))
    }

    fn set_wdma(&self) {
        let replicas = self.replicas();
        let cfg = WDMA_BURST_LEN_16
            | (WDMA_FIFO_THRESHOLD << WDMA_FIFO_THRESHOLD_SHIFT)
            | WDMA_ARB_ROUND_ROBIN;
        replicas.write(&*self.io, IMG_WDMA_CFG, cfg);
        replicas.write(&*self.io, IMG_WDMA_PRIO, WDMA_PRIORITY);
    }

    fn set_pixel_mask(&self) {
        let mask = if self.config.bus == BusType::Bt656 {
            0
        } else {
            PIXEL_MASK_BT_ERR
        };
        self.replicas().write(&*self.io, IMG_PIXEL_MASK, mask);
        self.io.clr(CSI_INT_MASK0, self.irq_bits());
        self.io.clr(CSI_INT_MASK1, self.err_bits());
    }

    fn mask_interrupts(&self) {
        self.io.set(CSI_INT_MASK0, self.irq_bits());
        self.io.set(CSI_INT_MASK1, self.err_bits());
        self.replicas()
            .write(&*self.io, IMG_PIXEL_MASK, PIXEL_MASK_ALL);
    }

    fn set_pixel_ctrl(&self, kpfmt: &KstreamPixFmt, layout: &DmaLayout) {
        let mut ctrl = match kpfmt.pixfmt {
            PixelFormat::Yuv420 => {
                if kpfmt.bus == BusClass::Parallel {
                    PIXEL_CTRL_YUV422_IN | PIXEL_CTRL_YUV420_LEGACY
                } else {
                    PIXEL_CTRL_YUV422_IN | PIXEL_CTRL_YUV420_PLANAR
                }
            }
            PixelFormat::Yuyv | PixelFormat::Uyvy => PIXEL_CTRL_YUV422_IN,
            PixelFormat::Rgb565 | PixelFormat::Rgb24 => PIXEL_CTRL_RGB,
            PixelFormat::Sbggr8 | PixelFormat::Grey => PIXEL_CTRL_RAW,
        };
        if layout.interlaced() {
            ctrl |= PIXEL_CTRL_INTERLACED;
            if layout.field.bottom_first() {
                ctrl |= PIXEL_CTRL_BOTTOM_FIRST;
            }
        }
        self.replicas().write(&*self.io, IMG_PIXEL_CTRL, ctrl);
    }

    fn set_para_bt(&self) {
        let timing = &self.config.timing;
        let mut val = 0;
        if timing.hsync_active_high {
            val |= PARA_BT_HSYNC_POL;
        }
        if timing.vsync_active_high {
            val |= PARA_BT_VSYNC_POL;
        }
        if timing.pclk_rising {
            val |= PARA_BT_PCLK_POL;
        }
        val |= (timing.even_mask & 0xf) << PARA_BT_EVEN_MASK_SHIFT;
        val |= (timing.odd_mask & 0xf) << PARA_BT_ODD_MASK_SHIFT;
        if self.config.bus == BusType::Bt656 {
            val |= PARA_BT_BT656_EN;
        }
        self.replicas().write(&*self.io, IMG_PARA_BT, val);
    }

    fn set_crop(&self, pads: &PadState, layout: &DmaLayout) {
        let window = Rect {
            left: pads.crop.left,
            top: pads.crop.top,
            width: layout.hw_width,
            height: pads.crop.height,
        };
        if window == Rect::full(&pads.sink) {
            return;
        }
        let replicas = self.replicas();
        replicas.write(&*self.io, IMG_CROP_POS, window.left | (window.top << 16));
        let size = (window.width & 0x7fff) | ((window.height & 0x7fff) << 16) | CROP_SIZE_EN;
        replicas.write(&*self.io, IMG_CROP_SIZE, size);
    }

    fn set_channel(&self, kpfmt: &KstreamPixFmt) {
        let replicas = self.replicas();
        replicas.write(&*self.io, IMG_CHN_SPLIT, kpfmt.split);
        replicas.write(&*self.io, IMG_CHN_PACK, kpfmt.pack);
        (0..MAX_PLANES).for_each(|p| {
            let ctrl = if p < kpfmt.planes {
                CHN_CTRL_EN | kpfmt.bpp[p]
            } else {
                0
            };
            replicas.write(&*self.io, img_chn_ctrl(p), ctrl);
        });
    }

    fn set_stride(&self, layout: &DmaLayout) {
        let replicas = self.replicas();
        (0..layout.planes).for_each(|p| {
            replicas.write(&*self.io, img_stride(p), layout.stride[p]);
        });
        let size = (layout.hw_width & 0xffff) | ((layout.hw_height & 0xffff) << 16);
        replicas.write(&*self.io, IMG_SIZE, size);
    }

    fn write_baddr(&self, layout: &DmaLayout, addrs: &[u64; MAX_PLANES]) {
        let replicas = self.replicas();
        (0..layout.planes).for_each(|p| {
            let quadrant = layout.quadrant[p] as u64;
            let addr = |j: u32| addrs[p] + quadrant * j as u64;
            replicas.write_with(&*self.io, img_baddr_h(p), |j| (addr(j) >> 32) as u32);
            replicas.write_with(&*self.io, img_baddr_l(p), |j| addr(j) as u32);
        });
        self.io.set(CSI_SHADOW, self.shadow_bits());
    }

    fn read_baddr(&self, layout: &DmaLayout) -> [u64; MAX_PLANES] {
        let block = self.replicas().base;
        let mut addrs = [0; MAX_PLANES];
        (0..layout.planes).for_each(|p| {
            let high = self.io.readl(block + img_baddr_h(p)) as u64;
            let low = self.io.readl(block + img_baddr_l(p)) as u64;
            addrs[p] = (high << 32) | low;
        });
        addrs
    }

    // Arm the next buffer. The buffer displaced from active slot is returned.
    fn set_baddr(&self, q: &mut BufferQueue) -> Option<KstreamBuffer> {
        let buf = match q.list.pop_front() {
            Some(buf) => buf,
            None => {
                if q.state == KstreamState::Running {
                    debug!(kstream = self.config.id, "No buffer available");
                    q.state = KstreamState::Idle;
                }
                return None;
            }
        };

        let addrs = q.layout.first_field_addrs(&buf);
        let displaced = q.slots.advance(buf);
        self.write_baddr(&q.layout, &addrs);

        if q.state == KstreamState::Idle {
            q.state = KstreamState::Running;
        }
        q.field = if q.layout.interlaced() { 1 } else { 0 };

        displaced
    }

    fn set_second_field_baddr(&self, q: &mut BufferQueue) {
        let first = self.read_baddr(&q.layout);
        let addrs = q.layout.second_field_addrs(&first);
        self.write_baddr(&q.layout, &addrs);
        q.field = 0;
    }

    /// Handle shadow update; rotate buffers, or point the second field of interlaced frame.
    pub fn shadow_update(&self) {
        let displaced = match self.queue.lock() {
            Ok(mut q) => {
                if !q.state.is_streaming() {
                    None
                } else if q.layout.interlaced() && q.field == 1 {
                    self.set_second_field_baddr(&mut q);
                    None
                } else {
                    self.set_baddr(&mut q)
                }
            }
            Err(_) => None,
        };

        if let Some(buf) = displaced {
            warn!(
                kstream = self.config.id,
                index = buf.index,
                "Buffer displaced before frame done"
            );
            self.vb2.buffer_done(buf, Vb2BufferState::Error);
        }
    }

    /// Handle frame done; return the active buffer.
    pub fn frame_done(&self) {
        let done = match self.queue.lock() {
            Ok(mut q) => {
                if !q.state.is_streaming() || (q.layout.interlaced() && q.field == 0) {
                    None
                } else {
                    let sequence = q.sequence;
                    q.sequence = q.sequence.wrapping_add(1);
                    let field = q.layout.field;
                    q.slots.retire().map(|mut buf| {
                        buf.sequence = sequence;
                        buf.timestamp_ns = self.epoch.elapsed().as_nanos() as u64;
                        buf.field = field;
                        buf
                    })
                }
            }
            Err(_) => None,
        };

        if let Some(buf) = done {
            self.vb2.buffer_done(buf, Vb2BufferState::Done);
        }
    }

    fn start_stream(&self) -> Result<(), Error> {
        let (interface, _) = self.interface()?;

        let state = self.lock_queue()?.state;
        match state {
            KstreamState::Running | KstreamState::Idle => return Ok(()),
            KstreamState::Initialed => (),
            _ => {
                let msg = format!("Kstream {} is not initialized: {:?}", self.config.id, state);
                Err(Error::new(KstreamError::State, &msg))?
            }
        }

        let pads = self.lock_pads()?.clone();
        let (kpfmt, layout) = self.prepare_layout(&pads)?;
        debug!(kstream = self.config.id, ?layout);

        self.set_wdma();
        self.set_pixel_mask();
        self.set_pixel_ctrl(kpfmt, &layout);
        if self.config.bus.class() == BusClass::Parallel {
            self.set_para_bt();
        }
        self.set_crop(&pads, &layout);
        self.set_channel(kpfmt);
        self.set_stride(&layout);

        let displaced = self.lock_queue().map(|mut q| {
            q.layout = layout;
            q.sequence = 0;
            q.field = 0;
            q.state = KstreamState::Running;
            self.set_baddr(&mut q)
        })?;
        if let Some(buf) = displaced {
            self.vb2.buffer_done(buf, Vb2BufferState::Error);
        }

        if let Err(err) = interface.s_stream(true) {
            self.mask_interrupts();
            let mut q = self.lock_queue()?;
            let bufs = q.slots.drain();
            bufs.into_iter()
                .rev()
                .for_each(|buf| q.list.push_front(buf));
            q.state = KstreamState::Initialed;
            return Err(err);
        }

        self.io.set(CSI_ENABLE, self.enable_bits());

        Ok(())
    }

    fn stop_stream(&self) -> Result<(), Error> {
        let state = self.lock_queue().map(|mut q| {
            let state = q.state;
            if state.is_streaming() {
                q.state = KstreamState::Stopping;
            }
            state
        })?;

        let res = if state.is_streaming() {
            self.io.clr(CSI_ENABLE, self.enable_bits());
            self.mask_interrupts();
            self.interface()
                .and_then(|(interface, _)| interface.s_stream(false))
                .map_err(|err| {
                    warn!(kstream = self.config.id, "Fail to stop interface: {}", err);
                    err
                })
        } else {
            Ok(())
        };

        self.return_buffers(Vb2BufferState::Error)?;
        self.lock_queue()?.state = KstreamState::Stopped;

        res
    }
}

impl V4l2Subdev for KstreamDevice {
    fn name(&self) -> String {
        format!("sdrv-kstream-{}", self.config.id)
    }

    fn s_stream(&self, enable: bool) -> Result<(), Error> {
        let _enter = debug_span!("kstream", id = self.config.id, enable).entered();
        if enable {
            self.start_stream()
        } else {
            self.stop_stream()
        }
    }

    fn get_fmt(&self, pad: u32) -> Result<MbusFrameFormat, Error> {
        let pads = self.lock_pads()?;
        match pad {
            KSTREAM_PAD_SINK => Ok(pads.sink),
            KSTREAM_PAD_SOURCE => Ok(MbusFrameFormat {
                width: pads.crop.width,
                height: pads.crop.height,
                ..pads.sink
            }),
            _ => Err(invalid_arg("Invalid pad")),
        }
    }

    fn set_fmt(&self, pad: u32, fmt: &mut MbusFrameFormat) -> Result<(), Error> {
        match pad {
            KSTREAM_PAD_SINK => {
                if self.state().is_streaming() {
                    Err(Error::new(FileError::Again, "Kstream is streaming"))?;
                }
                if !is_sink_mbus_code(fmt.code) {
                    fmt.code = MbusCode::Uyvy8_2x8;
                }
                fmt.width = fmt.width.clamp(IMG_X_MIN, IMG_X_MAX);
                fmt.height = fmt.height.clamp(IMG_Y_MIN, IMG_Y_MAX);
                let mut pads = self.lock_pads()?;
                pads.sink = *fmt;
                pads.crop = Rect::full(fmt);
                Ok(())
            }
            KSTREAM_PAD_SOURCE => {
                *fmt = self.get_fmt(KSTREAM_PAD_SOURCE)?;
                Ok(())
            }
            _ => Err(invalid_arg("Invalid pad")),
        }
    }

    fn enum_mbus_code(&self, pad: u32, index: u32) -> Result<MbusCode, Error> {
        match pad {
            KSTREAM_PAD_SINK => MBUS_FMTS
                .get(index as usize)
                .copied()
                .ok_or_else(|| invalid_arg("Index out of range")),
            KSTREAM_PAD_SOURCE if index == 0 => self.get_fmt(pad).map(|fmt| fmt.code),
            _ => Err(invalid_arg("Index out of range")),
        }
    }

    fn enum_frame_size(
        &self,
        pad: u32,
        index: u32,
        code: MbusCode,
    ) -> Result<FrameSizeRange, Error> {
        if index > 0 || pad > KSTREAM_PAD_SOURCE || !is_sink_mbus_code(code) {
            Err(invalid_arg("Unsupported frame size enumeration"))
        } else {
            Ok(FrameSizeRange {
                min_width: IMG_X_MIN,
                max_width: IMG_X_MAX,
                min_height: IMG_Y_MIN,
                max_height: IMG_Y_MAX,
            })
        }
    }

    fn g_frame_interval(&self) -> Result<FrameInterval, Error> {
        self.interface()
            .and_then(|(interface, _)| interface.g_frame_interval())
    }

    fn s_frame_interval(&self, interval: &mut FrameInterval) -> Result<(), Error> {
        self.interface()
            .and_then(|(interface, _)| interface.s_frame_interval(interval))
    }

    fn get_selection(&self, pad: u32, target: SelectionTarget) -> Result<Rect, Error> {
        if pad != KSTREAM_PAD_SINK {
            Err(invalid_arg("Selection is available at sink pad"))?;
        }
        let pads = self.lock_pads()?;
        match target {
            SelectionTarget::Crop => Ok(pads.crop),
            SelectionTarget::CropDefault | SelectionTarget::CropBounds => {
                Ok(Rect::full(&pads.sink))
            }
        }
    }

    fn set_selection(
        &self,
        pad: u32,
        target: SelectionTarget,
        rect: &mut Rect,
    ) -> Result<(), Error> {
        if pad != KSTREAM_PAD_SINK || target != SelectionTarget::Crop {
            Err(invalid_arg("Crop is available at sink pad"))?;
        }
        if self.state().is_streaming() {
            Err(Error::new(FileError::Again, "Kstream is streaming"))?;
        }
        let mut pads = self.lock_pads()?;
        let sink = pads.sink;
        rect.width = rect.width.clamp(IMG_X_MIN, sink.width);
        rect.height = rect.height.clamp(IMG_Y_MIN, sink.height);
        rect.left = std::cmp::min(rect.left, sink.width - rect.width);
        rect.top = std::cmp::min(rect.top, sink.height - rect.height);
        pads.crop = *rect;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use {super::super::test_utils::*, super::*};

    const BASE: u32 = 0x100;

    fn uyvy_video(width: u32, height: u32, bpl: u32) -> PixFormatMplane {
        PixFormatMplane {
            width,
            height,
            pixelformat: PixelFormat::Uyvy,
            field: Field::None,
            num_planes: 1,
            bytesperline: [bpl, 0, 0],
            sizeimage: [bpl * height, 0, 0],
        }
    }

    struct Fixture {
        io: Arc<RecordingIo>,
        vb2: Arc<FakeVb2>,
        sensor: Arc<FakeSubdev>,
        kstream: KstreamDevice,
    }

    fn fixture(config: KstreamConfig, sink: MbusFrameFormat) -> Fixture {
        let io = Arc::new(RecordingIo::default());
        let vb2 = Arc::new(FakeVb2::default());
        let sensor = Arc::new(FakeSubdev::new(sink, io.clone()));
        let kstream = KstreamDevice::new(
            config,
            io.clone(),
            Arc::new(DefaultKstream),
            vb2.clone(),
        );
        kstream.bind_interface(sensor.clone(), 0).unwrap();
        Fixture {
            io,
            vb2,
            sensor,
            kstream,
        }
    }

    fn first_index(writes: &[(u32, u32)], offset: u32) -> usize {
        writes
            .iter()
            .position(|(o, _)| *o == offset)
            .unwrap_or_else(|| panic!("No write to {:#x}", offset))
    }

    fn values_at(writes: &[(u32, u32)], offset: u32) -> Vec<u32> {
        writes
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    #[test]
    fn mipi_stream_start_order() {
        let config = KstreamConfig::default();
        let f = fixture(config, uyvy_format(1280, 720));
        f.kstream
            .set_video_fmt(&uyvy_video(1280, 720, 2560))
            .unwrap();
        f.kstream.init_device().unwrap();
        assert_eq!(f.kstream.state(), KstreamState::Initialed);
        assert_eq!(f.io.value(BASE + IMG_IF_PARAM), 2);

        f.kstream.queue_buffer(buffer(0, 0x8000_0000)).unwrap();
        f.kstream.queue_buffer(buffer(1, 0x8040_0000)).unwrap();
        f.io.clear_log();

        f.kstream.s_stream(true).unwrap();
        assert_eq!(f.kstream.state(), KstreamState::Running);

        let writes = f.io.writes();
        let order = [
            BASE + IMG_WDMA_CFG,
            BASE + IMG_PIXEL_MASK,
            BASE + IMG_PIXEL_CTRL,
            BASE + IMG_CHN_SPLIT,
            BASE + IMG_CHN_PACK,
            BASE + img_stride(0),
            BASE + img_baddr_l(0),
            CSI_SHADOW,
            CSI_ENABLE,
        ];
        let positions: Vec<usize> = order.iter().map(|o| first_index(&writes, *o)).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", positions);

        assert!(values_at(&writes, BASE + IMG_PARA_BT).is_empty());
        assert!(values_at(&writes, BASE + IMG_CROP_POS).is_empty());
        assert!(values_at(&writes, BASE + IMG_CROP_SIZE).is_empty());

        assert_eq!(values_at(&writes, BASE + img_stride(0)), vec![2560]);
        assert_eq!(values_at(&writes, BASE + IMG_SIZE), vec![1280 | (720 << 16)]);
        assert_eq!(values_at(&writes, BASE + img_baddr_l(0)), vec![0x8000_0000]);
        assert_eq!(values_at(&writes, BASE + img_baddr_h(0)), vec![0]);
        assert_eq!(f.io.value(CSI_SHADOW), csi_shadow_set(0));

        // Upstream is started after the shadow bit and before the enable bit.
        let shadow = first_index(&writes, CSI_SHADOW);
        let enable = first_index(&writes, CSI_ENABLE);
        let calls = f.sensor.stream_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, true);
        assert!(calls[0].1 > shadow && calls[0].1 <= enable);
        assert_eq!(f.io.value(CSI_ENABLE), csi_img_en(0));

        assert_eq!(f.kstream.slot_states(), (SlotState::Armed, SlotState::Empty));
        assert_eq!(f.kstream.pending_buffers(), 1);
    }

    #[test]
    fn sync_mode_replication() {
        let config = KstreamConfig {
            sync: true,
            ..Default::default()
        };
        let f = fixture(config, uyvy_format(1280, 720));
        f.kstream
            .set_video_fmt(&uyvy_video(1280, 2880, 2560))
            .unwrap();
        f.kstream.init_device().unwrap();
        (0..4).for_each(|j| {
            let val = f.io.value(img_base(j) + IMG_IF_PARAM);
            assert_eq!(val, 2 | (j << IF_PARAM_VC_SHIFT));
        });

        f.kstream.queue_buffer(buffer(0, 0x8000_0000)).unwrap();
        f.kstream.queue_buffer(buffer(1, 0x9000_0000)).unwrap();
        f.io.clear_log();
        f.kstream.s_stream(true).unwrap();

        let writes = f.io.writes();
        [IMG_CHN_SPLIT, IMG_CHN_PACK, img_chn_ctrl(0), img_stride(0), IMG_SIZE]
            .iter()
            .for_each(|reg| {
                let vals: Vec<u32> = (0..4)
                    .map(|j| {
                        let vals = values_at(&writes, img_base(j) + reg);
                        assert_eq!(vals.len(), 1);
                        vals[0]
                    })
                    .collect();
                assert!(vals.iter().all(|v| *v == vals[0]), "{:#x}: {:?}", reg, vals);
            });
        assert_eq!(f.io.value(img_base(0) + IMG_SIZE), 1280 | (720 << 16));

        // Each quadrant is width * height * bpp / 8 / 4 bytes.
        let length = 1280 * 2880 * 16 / 8 / 4;
        (0..4).for_each(|j| {
            let vals = values_at(&writes, img_base(j) + img_baddr_l(0));
            assert_eq!(vals, vec![0x8000_0000 + j * length]);
        });
        assert_eq!(f.io.value(CSI_SHADOW), 0xf);
        assert_eq!(f.io.value(CSI_ENABLE), 0xf | CSI_SYNC_EN);

        // Rotation by shadow update is replicated as well.
        f.io.clear_log();
        f.kstream.shadow_update();
        let writes = f.io.writes();
        (0..4).for_each(|j| {
            let vals = values_at(&writes, img_base(j) + img_baddr_l(0));
            assert_eq!(vals, vec![0x9000_0000 + j * length]);
        });
    }

    #[test]
    fn shutdown_flushes_slots() {
        let f = fixture(KstreamConfig::default(), uyvy_format(1280, 720));
        f.kstream
            .set_video_fmt(&uyvy_video(1280, 720, 2560))
            .unwrap();
        f.kstream.init_device().unwrap();
        (0..3).for_each(|i| {
            f.kstream
                .queue_buffer(buffer(i, 0x8000_0000 + i as u64 * 0x40_0000))
                .unwrap();
        });
        f.kstream.s_stream(true).unwrap();
        f.kstream.shadow_update();
        assert_eq!(f.kstream.slot_states(), (SlotState::Armed, SlotState::Active));

        f.kstream.s_stream(false).unwrap();
        assert_eq!(f.kstream.state(), KstreamState::Stopped);
        assert_eq!(f.kstream.pending_buffers(), 0);
        assert_eq!(f.kstream.slot_states(), (SlotState::Empty, SlotState::Empty));

        let mut returned = f.vb2.returned();
        returned.sort_by_key(|(index, _)| *index);
        assert_eq!(
            returned,
            vec![
                (0, Vb2BufferState::Error),
                (1, Vb2BufferState::Error),
                (2, Vb2BufferState::Error),
            ]
        );
        assert_eq!(f.io.value(CSI_ENABLE) & csi_img_en(0), 0);
        assert_eq!(f.io.value(BASE + IMG_PIXEL_MASK), PIXEL_MASK_ALL);
        assert_eq!(f.sensor.stream_calls().last().map(|c| c.0), Some(false));
    }

    #[test]
    fn starvation_and_recovery() {
        let f = fixture(KstreamConfig::default(), uyvy_format(1280, 720));
        f.kstream
            .set_video_fmt(&uyvy_video(1280, 720, 2560))
            .unwrap();
        f.kstream.init_device().unwrap();
        f.kstream.queue_buffer(buffer(0, 0x8000_0000)).unwrap();
        f.kstream.s_stream(true).unwrap();

        f.io.clear_log();
        f.kstream.shadow_update();
        assert_eq!(f.kstream.state(), KstreamState::Idle);
        assert!(f.io.writes().is_empty());

        // Queueing itself does not leave idle state.
        f.kstream.queue_buffer(buffer(1, 0x8040_0000)).unwrap();
        assert_eq!(f.kstream.state(), KstreamState::Idle);

        f.kstream.shadow_update();
        assert_eq!(f.kstream.state(), KstreamState::Running);
        assert_eq!(f.io.value(BASE + img_baddr_l(0)), 0x8040_0000);

        f.kstream.frame_done();
        let done = f.vb2.done.lock().unwrap().clone();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0.index, 0);
        assert_eq!(done[0].0.sequence, 0);
        assert_eq!(done[0].1, Vb2BufferState::Done);
    }

    #[test]
    fn state_transitions() {
        let f = fixture(KstreamConfig::default(), uyvy_format(1280, 720));
        f.kstream
            .set_video_fmt(&uyvy_video(1280, 720, 2560))
            .unwrap();

        let err = f.kstream.s_stream(true).unwrap_err();
        assert_eq!(err.kind::<KstreamError>(), Some(KstreamError::State));
        assert!(f.sensor.stream_calls().is_empty());

        f.kstream.init_device().unwrap();
        let err = f.kstream.init_device().unwrap_err();
        assert_eq!(err.kind::<KstreamError>(), Some(KstreamError::State));

        f.kstream.s_stream(true).unwrap();
        // No buffer is queued.
        assert_eq!(f.kstream.state(), KstreamState::Idle);
        f.kstream.s_stream(true).unwrap();
        assert_eq!(f.sensor.stream_calls().len(), 1);
    }

    #[test]
    fn upstream_failure_keeps_buffers() {
        let f = fixture(KstreamConfig::default(), uyvy_format(1280, 720));
        f.kstream
            .set_video_fmt(&uyvy_video(1280, 720, 2560))
            .unwrap();
        f.kstream.init_device().unwrap();
        f.kstream.queue_buffer(buffer(0, 0x8000_0000)).unwrap();
        *f.sensor.fail_stream.lock().unwrap() = true;

        assert!(f.kstream.s_stream(true).is_err());
        assert_eq!(f.kstream.state(), KstreamState::Initialed);
        assert_eq!(f.kstream.pending_buffers(), 1);
        assert_eq!(f.io.value(CSI_ENABLE), 0);
    }

    #[test]
    fn interlaced_second_field() {
        let config = KstreamConfig {
            hcrop: HcropCompensation {
                top_front: 8,
                bottom_front: 4,
                bottom_back: 4,
                ..Default::default()
            },
            ..Default::default()
        };
        let sink = MbusFrameFormat {
            field: Field::InterlacedTb,
            ..uyvy_format(728, 480)
        };
        let f = fixture(config, sink);
        f.kstream
            .set_video_fmt(&uyvy_video(720, 480, 1456))
            .unwrap();
        f.kstream.init_device().unwrap();
        f.kstream.queue_buffer(buffer(0, 0x1000_0000)).unwrap();
        f.kstream.queue_buffer(buffer(1, 0x2000_0000)).unwrap();
        f.kstream.s_stream(true).unwrap();

        let layout = f.kstream.layout();
        assert_eq!(layout.hw_width, 728);
        assert_eq!(layout.hw_height, 240);
        assert_eq!(layout.stride[0], 2912);
        assert_eq!(f.io.value(BASE + img_stride(0)), 2912);
        assert_ne!(f.io.value(BASE + IMG_PIXEL_CTRL) & PIXEL_CTRL_INTERLACED, 0);

        // Top field starts at the first line, moved backward by its front padding.
        assert_eq!(f.io.value(BASE + img_baddr_l(0)), 0x1000_0000 - 16);

        // Bottom field starts at the second line, moved backward by its front padding.
        f.io.clear_log();
        f.kstream.shadow_update();
        assert_eq!(f.io.value(BASE + img_baddr_l(0)), 0x1000_0000 + 1456 - 8);
        assert_eq!(f.kstream.slot_states(), (SlotState::Armed, SlotState::Empty));

        // Completion of the first field is not reported.
        f.kstream.frame_done();
        assert!(f.vb2.returned().is_empty());

        f.kstream.shadow_update();
        assert_eq!(f.io.value(BASE + img_baddr_l(0)), 0x2000_0000 - 16);
        f.kstream.frame_done();
        assert_eq!(f.vb2.returned(), vec![(0, Vb2BufferState::Done)]);
        assert_eq!(f.vb2.done.lock().unwrap()[0].0.field, Field::InterlacedTb);
    }

    #[test]
    fn interlaced_bottom_first() {
        let config = KstreamConfig {
            hcrop: HcropCompensation {
                top_front: 8,
                bottom_front: 4,
                bottom_back: 4,
                ..Default::default()
            },
            ..Default::default()
        };
        let sink = MbusFrameFormat {
            field: Field::InterlacedBt,
            ..uyvy_format(728, 480)
        };
        let f = fixture(config, sink);
        f.kstream
            .set_video_fmt(&uyvy_video(720, 480, 1456))
            .unwrap();
        f.kstream.init_device().unwrap();
        f.kstream.queue_buffer(buffer(0, 0x1000_0000)).unwrap();
        f.kstream.queue_buffer(buffer(1, 0x2000_0000)).unwrap();
        f.kstream.s_stream(true).unwrap();

        let ctrl = f.io.value(BASE + IMG_PIXEL_CTRL);
        assert_ne!(ctrl & PIXEL_CTRL_INTERLACED, 0);
        assert_ne!(ctrl & PIXEL_CTRL_BOTTOM_FIRST, 0);

        // Bottom field starts at the second line, moved backward by its front padding.
        assert_eq!(f.io.value(BASE + img_baddr_l(0)), 0x1000_0000 + 1456 - 8);

        // Top field follows at the first line, moved backward by its front padding.
        f.kstream.shadow_update();
        assert_eq!(f.io.value(BASE + img_baddr_l(0)), 0x1000_0000 - 16);

        f.kstream.frame_done();
        assert!(f.vb2.returned().is_empty());

        f.kstream.shadow_update();
        assert_eq!(f.io.value(BASE + img_baddr_l(0)), 0x2000_0000 + 1456 - 8);
        f.kstream.frame_done();
        assert_eq!(f.vb2.returned(), vec![(0, Vb2BufferState::Done)]);
        assert_eq!(f.vb2.done.lock().unwrap()[0].0.field, Field::InterlacedBt);
    }

    #[test]
    fn displaced_buffer_back_to_list() {
        let f = fixture(KstreamConfig::default(), uyvy_format(1280, 720));
        f.kstream
            .set_video_fmt(&uyvy_video(1280, 720, 2560))
            .unwrap();
        f.kstream.init_device().unwrap();

        // Not streaming.
        assert_eq!(f.kstream.requeue_buffer(buffer(9, 0x9000_0000)), Err(buffer(9, 0x9000_0000)));

        (0..3).for_each(|i| {
            let buf = buffer(i, 0x8000_0000 + i as u64 * 0x20_0000);
            f.kstream.queue_buffer(buf).unwrap();
        });
        f.kstream.s_stream(true).unwrap();

        // Two shadow updates without frame done displace the first buffer.
        f.kstream.shadow_update();
        f.kstream.shadow_update();
        assert_eq!(f.vb2.returned(), vec![(0, Vb2BufferState::Error)]);
        assert_eq!(f.kstream.pending_buffers(), 0);

        let (buf, _) = f.vb2.done.lock().unwrap().remove(0);
        f.kstream.requeue_buffer(buf).unwrap();
        assert_eq!(f.kstream.pending_buffers(), 1);

        // The pipe keeps running with the buffer.
        f.kstream.frame_done();
        f.kstream.shadow_update();
        assert_eq!(f.kstream.state(), KstreamState::Running);
        assert_eq!(f.io.value(BASE + img_baddr_l(0)), 0x8000_0000);

        f.kstream.s_stream(false).unwrap();
        assert!(f.kstream.requeue_buffer(buffer(0, 0x8000_0000)).is_err());
        assert_eq!(f.kstream.pending_buffers(), 0);
    }

    #[test]
    fn invalid_geometry_touches_nothing() {
        let config = KstreamConfig {
            hcrop: HcropCompensation {
                front: 8,
                ..Default::default()
            },
            ..Default::default()
        };
        let f = fixture(config, uyvy_format(1280, 720));
        f.kstream
            .set_video_fmt(&uyvy_video(1280, 720, 2576))
            .unwrap();
        f.kstream.init_device().unwrap();
        f.kstream.queue_buffer(buffer(0, 0x8000_0000)).unwrap();
        f.io.clear_log();

        let err = f.kstream.s_stream(true).unwrap_err();
        assert_eq!(err.kind::<FileError>(), Some(FileError::Inval));
        assert!(f.io.writes().is_empty());
        assert!(f.sensor.stream_calls().is_empty());
    }

    #[test]
    fn strict_format_lookup() {
        let f = fixture(KstreamConfig::default(), uyvy_format(1280, 720));
        let mut video = uyvy_video(1280, 720, 3840);
        video.pixelformat = PixelFormat::Rgb24;
        f.kstream.set_video_fmt(&video).unwrap();
        f.kstream.init_device().unwrap();
        f.io.clear_log();

        let err = f.kstream.s_stream(true).unwrap_err();
        assert_eq!(err.kind::<FileError>(), Some(FileError::Inval));
        assert!(f.io.writes().is_empty());
    }

    #[test]
    fn parallel_timing_and_crop() {
        let config = KstreamConfig {
            bus: BusType::Bt656,
            timing: ParallelTiming {
                hsync_active_high: true,
                even_mask: 0x3,
                odd_mask: 0xc,
                ..Default::default()
            },
            ..Default::default()
        };
        let sink = MbusFrameFormat {
            code: MbusCode::Yuyv8_2x8,
            ..uyvy_format(720, 576)
        };
        let f = fixture(config, sink);
        let mut rect = Rect {
            left: 16,
            top: 0,
            width: 704,
            height: 576,
        };
        f.kstream
            .set_selection(KSTREAM_PAD_SINK, SelectionTarget::Crop, &mut rect)
            .unwrap();
        f.kstream
            .set_video_fmt(&uyvy_video(704, 576, 1408))
            .unwrap();
        f.kstream.init_device().unwrap();
        f.kstream.s_stream(true).unwrap();

        let para = f.io.value(BASE + IMG_PARA_BT);
        assert_eq!(
            para,
            PARA_BT_HSYNC_POL
                | (0x3 << PARA_BT_EVEN_MASK_SHIFT)
                | (0xc << PARA_BT_ODD_MASK_SHIFT)
                | PARA_BT_BT656_EN
        );
        assert_eq!(f.io.value(BASE + IMG_CROP_POS), 16);
        assert_eq!(
            f.io.value(BASE + IMG_CROP_SIZE),
            704 | (576 << 16) | CROP_SIZE_EN
        );
        assert_eq!(f.io.value(BASE + IMG_PIXEL_MASK), 0);
    }

    #[test]
    fn pad_operations() {
        let f = fixture(KstreamConfig::default(), uyvy_format(1280, 720));

        let mut fmt = MbusFrameFormat {
            code: MbusCode::Yuyv8_1x16,
            width: 8192,
            height: 16,
            field: Field::None,
        };
        f.kstream.set_fmt(KSTREAM_PAD_SINK, &mut fmt).unwrap();
        assert_eq!(fmt.code, MbusCode::Uyvy8_2x8);
        assert_eq!(fmt.width, IMG_X_MAX);
        assert_eq!(fmt.height, IMG_Y_MIN);

        let mut fmt = uyvy_format(1280, 720);
        f.kstream.set_fmt(KSTREAM_PAD_SINK, &mut fmt).unwrap();

        let mut rect = Rect {
            left: 1000,
            top: 0,
            width: 640,
            height: 2000,
        };
        f.kstream
            .set_selection(KSTREAM_PAD_SINK, SelectionTarget::Crop, &mut rect)
            .unwrap();
        assert_eq!(
            rect,
            Rect {
                left: 640,
                top: 0,
                width: 640,
                height: 720
            }
        );

        let source = f.kstream.get_fmt(KSTREAM_PAD_SOURCE).unwrap();
        assert_eq!((source.width, source.height), (640, 720));
        assert_eq!(source.code, MbusCode::Uyvy8_2x8);

        let mut fmt = uyvy_format(32, 32);
        f.kstream.set_fmt(KSTREAM_PAD_SOURCE, &mut fmt).unwrap();
        assert_eq!(fmt, source);

        assert_eq!(
            f.kstream.enum_mbus_code(KSTREAM_PAD_SINK, 0).unwrap(),
            MBUS_FMTS[0]
        );
        assert!(f
            .kstream
            .enum_mbus_code(KSTREAM_PAD_SINK, MBUS_FMTS.len() as u32)
            .is_err());
        assert_eq!(
            f.kstream
                .get_selection(KSTREAM_PAD_SINK, SelectionTarget::CropBounds)
                .unwrap(),
            Rect::full(&uyvy_format(1280, 720))
        );
        assert!(f.kstream.g_frame_interval().is_ok());
    }
}
