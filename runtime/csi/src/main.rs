// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto
mod board;
mod dma;
mod i2c;
mod mmio;
mod sink;
mod uio;

use {
    board::*,
    clap::{Parser, ValueEnum},
    dma::DmaWindow,
    glib::{ControlFlow, Error, FileError},
    gmsl_serdes_protocols::{
        max9286::Max9286, max96706::Max96706, max96722::Max96722, poc::Max2008x, BringUpReport,
        DeserializerSubdev, GmslDeserializer, GmslPower, GpioLine, I2cBus, LinkState,
    },
    i2c::{I2cAdapters, SysfsGpio},
    mmio::{io_to_error, DispmuxRegion, MmioRegion},
    nix::sys::signal,
    runtime_core::{cmdline::*, dispatcher::*, LogLevel, *},
    sdrv_csi_protocols::{
        csi_core::CsiCore,
        graph::{self, AsyncNotifier, MediaGraph, PortDesc},
        kstream::*,
        mipi_csi2::MipiCsi2Host,
        parallel::ParallelInterface,
        pixfmt::PixelFormat,
        subdev::V4l2Subdev,
        video::*,
        RegisterIo,
    },
    sink::FrameSink,
    std::{
        collections::HashMap,
        os::unix::io::AsRawFd,
        path::PathBuf,
        sync::{mpsc, Arc},
        time::Duration,
    },
    tracing::{debug, debug_span, error, warn, Level},
    uio::UioIrq,
};

enum Event {
    Shutdown,
    Frame(u32, KstreamBuffer, Vb2BufferState),
    Timer,
}

/// Deserializer observed by the interval timer.
trait LinkMonitor: Send + Sync {
    fn label(&self) -> String;
    fn link_state(&self) -> LinkState;
    fn bring_up_report(&self) -> BringUpReport;
    fn locked_links(&self) -> Result<u8, Error>;
}

impl<D: GmslDeserializer> LinkMonitor for DeserializerSubdev<D> {
    fn label(&self) -> String {
        self.name()
    }

    fn link_state(&self) -> LinkState {
        self.state()
    }

    fn bring_up_report(&self) -> BringUpReport {
        self.report()
    }

    fn locked_links(&self) -> Result<u8, Error> {
        self.link_status()
    }
}

type ProbedSensor = (Arc<dyn V4l2Subdev>, Arc<dyn LinkMonitor>);

fn probe_deserializer<D: GmslDeserializer + 'static>(dev: D) -> Result<ProbedSensor, Error> {
    let sd = Arc::new(DeserializerSubdev::probe(dev)?);
    let subdev: Arc<dyn V4l2Subdev> = sd.clone();
    let monitor: Arc<dyn LinkMonitor> = sd;
    Ok((subdev, monitor))
}

fn probe_sensor(desc: &SensorDesc, adapters: &mut I2cAdapters) -> Result<ProbedSensor, Error> {
    let (dev, lock) = adapters.get(desc.bus)?;
    let bus: Arc<dyn I2cBus> = dev;

    let poc = match &desc.poc {
        Some(poc) => {
            let (poc_bus, _) = adapters.get(poc.bus)?;
            Some(Max2008x::new(poc_bus, poc.addr, poc.variant))
        }
        None => None,
    };
    let power = GmslPower {
        pwdn: desc
            .pwdn_gpio
            .map(|line| Arc::new(SysfsGpio::new(line)) as Arc<dyn GpioLine>),
        poc,
    };

    match desc.chip {
        ChipKind::Max9286 => probe_deserializer(Max9286::new(bus, desc.params, power)),
        ChipKind::Max96706 => probe_deserializer(Max96706::new(bus, desc.params, power)),
        ChipKind::Max96722 => probe_deserializer(Max96722::new(bus, desc.params, power, lock)),
    }
}

/// Parameters of capture given by command line.
#[derive(Debug, Clone)]
struct CaptureParams {
    host_id: u32,
    dtb: PathBuf,
    uio: PathBuf,
    mipi_uio: Option<PathBuf>,
    dma_base: u64,
    dma_size: u64,
    buffers: u32,
    frames: u32,
    format: Option<PixelFormat>,
}

struct CsiRuntime {
    params: CaptureParams,
    core: Arc<CsiCore>,
    mipi: Vec<Arc<MipiCsi2Host<DispmuxRegion>>>,
    monitors: Vec<Arc<dyn LinkMonitor>>,
    graph: MediaGraph,
    irq: Arc<UioIrq>,
    mipi_irq: Option<Arc<UioIrq>>,
    window: DmaWindow,
    allocs: Vec<(Arc<dyn DmaAllocator>, u64, usize)>,
    captured: HashMap<u32, u32>,
    rx: mpsc::Receiver<Event>,
    tx: mpsc::SyncSender<Event>,
    dispatchers: Vec<Dispatcher>,
}

impl Drop for CsiRuntime {
    fn drop(&mut self) {
        // At first, stop event loop in all of dispatchers to avoid queueing new events.
        for dispatcher in &mut self.dispatchers {
            dispatcher.stop();
        }

        // Next, consume all events in queue to release blocked thread for sender.
        for _ in self.rx.try_iter() {}

        // Finally Finish I/O threads.
        self.dispatchers.clear();

        self.stop_capture();
    }
}

impl RuntimeOperation<CaptureParams> for CsiRuntime {
    fn new(params: CaptureParams, log_level: Option<LogLevel>) -> Result<Self, Error> {
        if let Some(level) = log_level {
            let fmt_level = match level {
                LogLevel::Debug => Level::DEBUG,
                LogLevel::Trace => Level::TRACE,
            };
            tracing_subscriber::fmt().with_max_level(fmt_level).init();
        }

        let label = params.dtb.display().to_string();
        let dtb = std::fs::read(&params.dtb).map_err(|e| io_to_error(e, &label))?;
        let board = BoardDesc::parse(&dtb, params.host_id)?;

        let io: Arc<dyn RegisterIo> = Arc::new(MmioRegion::open(&board.regs)?);
        let core = Arc::new(CsiCore::new(
            params.host_id,
            board.csi.bus,
            board.csi.sync,
            io,
        )?);

        // Use uni-directional channel for communication to child threads.
        let (tx, rx) = mpsc::sync_channel(64);

        let notifier = AsyncNotifier::new(&board.csi);

        let enter = debug_span!("interface").entered();
        let mut mipi = Vec::new();
        board.interfaces.iter().try_for_each(|desc| {
            match desc {
                InterfaceDesc::Mipi(desc) => {
                    let io: Arc<dyn RegisterIo> = Arc::new(MmioRegion::open(&desc.regs)?);
                    let dispmux = DispmuxRegion(desc.dispmux);
                    let host = Arc::new(MipiCsi2Host::new(io, dispmux, desc.config.clone())?);
                    notifier.bind_interface(&desc.name, host.clone())?;
                    mipi.push(host);
                }
                InterfaceDesc::Parallel { name, host_id } => {
                    let interface = Arc::new(ParallelInterface::new(*host_id, board.csi.bus)?);
                    notifier.bind_interface(name, interface)?;
                }
            }
            Ok::<(), Error>(())
        })?;
        enter.exit();

        let mut adapters = I2cAdapters::default();
        let mut monitors = Vec::new();
        board.sensors.iter().try_for_each(|desc| {
            let _enter = debug_span!("sensor", name = desc.name.as_str()).entered();
            let (subdev, monitor) = probe_sensor(desc, &mut adapters)?;
            let report = monitor.bring_up_report();
            if report.locked == 0 {
                warn!("No link is locked");
            }
            debug!(?report);
            notifier.bind_sensor(&desc.name, subdev)?;
            monitors.push(monitor);
            Ok::<(), Error>(())
        })?;

        let enter = debug_span!("graph").entered();
        let mut sinks = Vec::new();
        let vb2 = |port: &PortDesc| -> Arc<dyn Vb2Core> {
            let sink = Arc::new(FrameSink::new(port.id, tx.clone()));
            sinks.push(sink.clone());
            sink
        };
        let kstreams = graph::populate(&core, &board.csi, Arc::new(DefaultKstream), vb2)?;
        sinks
            .iter()
            .zip(&kstreams)
            .for_each(|(sink, kstream)| sink.attach(kstream));
        let graph = notifier.complete(&board.csi, &kstreams)?;
        graph.links.iter().for_each(|link| {
            debug!(
                "{}:{} -> {}:{} {:?}",
                link.source,
                link.source_pad,
                link.sink,
                link.sink_pad,
                link.flags
            );
        });
        enter.exit();

        let irq = Arc::new(UioIrq::open(&params.uio)?);
        let mipi_irq = match &params.mipi_uio {
            Some(path) => Some(Arc::new(UioIrq::open(path)?)),
            None => None,
        };

        let window = DmaWindow::new(params.dma_base, params.dma_size, Self::DMA_ALIGN)?;

        Ok(CsiRuntime {
            params,
            core,
            mipi,
            monitors,
            graph,
            irq,
            mipi_irq,
            window,
            allocs: Vec::new(),
            captured: HashMap::new(),
            rx,
            tx,
            dispatchers: Vec::new(),
        })
    }

    fn listen(&mut self) -> Result<(), Error> {
        self.launch_system_event_dispatcher()?;
        self.launch_irq_dispatcher()?;
        self.launch_timer_dispatcher()?;
        Ok(())
    }

    fn run(&mut self) -> Result<(), Error> {
        let enter = debug_span!("start").entered();
        let res = self.start_capture();
        enter.exit();
        if let Err(e) = res {
            self.stop_capture();
            return Err(e);
        }

        let enter = debug_span!("event").entered();
        loop {
            let ev = match self.rx.recv() {
                Ok(ev) => ev,
                Err(_) => continue,
            };

            match ev {
                Event::Shutdown => break,
                Event::Frame(pipe, buf, state) => {
                    let _enter = debug_span!("frame", pipe).entered();
                    self.handle_frame(pipe, buf, state);
                    if self.is_captured() {
                        break;
                    }
                }
                Event::Timer => {
                    let _enter = debug_span!("timer").entered();
                    self.report_links();
                }
            }
        }
        enter.exit();

        self.stop_capture();
        self.report_stats();

        Ok(())
    }
}

impl CsiRuntime {
    const SYSTEM_DISPATCHER_NAME: &'static str = "system event dispatcher";
    const IRQ_DISPATCHER_NAME: &'static str = "interrupt dispatcher";
    const TIMER_DISPATCHER_NAME: &'static str = "interval timer dispatcher";

    const TIMER_INTERVAL: Duration = Duration::from_secs(1);

    const DMA_ALIGN: u64 = 0x1000;

    fn launch_system_event_dispatcher(&mut self) -> Result<(), Error> {
        let name = Self::SYSTEM_DISPATCHER_NAME.to_string();
        let mut dispatcher = Dispatcher::run(name)?;

        let tx = self.tx.clone();
        dispatcher.attach_signal_handler(signal::Signal::SIGINT, move || {
            let _ = tx.send(Event::Shutdown);
            ControlFlow::Break
        });

        self.dispatchers.push(dispatcher);

        Ok(())
    }

    fn launch_irq_dispatcher(&mut self) -> Result<(), Error> {
        let name = Self::IRQ_DISPATCHER_NAME.to_string();
        let mut dispatcher = Dispatcher::run(name)?;

        self.irq.enable()?;
        let irq = self.irq.clone();
        let core = self.core.clone();
        dispatcher.attach_fd_handler(irq.as_raw_fd(), move || {
            handle_irq(&irq, || core.isr())
        });

        if let Some(irq) = &self.mipi_irq {
            irq.enable()?;
            let irq = irq.clone();
            let hosts = self.mipi.clone();
            dispatcher.attach_fd_handler(irq.as_raw_fd(), move || {
                handle_irq(&irq, || hosts.iter().for_each(|host| host.irq()))
            });
        }

        self.dispatchers.push(dispatcher);

        Ok(())
    }

    fn launch_timer_dispatcher(&mut self) -> Result<(), Error> {
        let name = Self::TIMER_DISPATCHER_NAME.to_string();
        let mut dispatcher = Dispatcher::run(name)?;

        let tx = self.tx.clone();
        dispatcher.attach_interval_handler(Self::TIMER_INTERVAL, move || {
            let _ = tx.try_send(Event::Timer);
            ControlFlow::Continue
        });

        self.dispatchers.push(dispatcher);

        Ok(())
    }

    fn start_capture(&mut self) -> Result<(), Error> {
        let videos = self.graph.videos.clone();
        for video in &videos {
            let _enter = debug_span!("video", name = video.name().as_str()).entered();
            self.start_video(video)?;
        }
        Ok(())
    }

    fn start_video(&mut self, video: &Arc<KstreamVideo>) -> Result<(), Error> {
        let kstream = video.kstream();

        // Propagate the format of interface to sink pad of image pipe.
        let (interface, pad) = kstream.interface()?;
        let mut fmt = interface.get_fmt(pad)?;
        kstream.set_fmt(KSTREAM_PAD_SINK, &mut fmt)?;

        let mut pix = video.default_fmt(self.params.format.unwrap_or_default())?;
        video.s_fmt(&mut pix)?;

        let mut count = self.params.buffers;
        let sizes = video.queue_setup(&mut count)?;
        debug!(count, ?sizes);

        let allocator: Arc<dyn DmaAllocator> = if kstream.config().hcrop.is_active() {
            let (front, back) = video.hcrop_padding()?;
            Arc::new(HcropAllocator::new(self.window.clone(), front, back))
        } else {
            Arc::new(self.window.clone())
        };

        for index in 0..count {
            let mut addrs = Vec::with_capacity(sizes.len());
            for &size in &sizes {
                let addr = allocator.alloc(size as usize)?;
                self.allocs.push((allocator.clone(), addr, size as usize));
                addrs.push(addr);
            }
            video.buf_prepare(&sizes)?;
            video.buf_queue(KstreamBuffer::new(index, &addrs))?;
        }

        video.start_streaming()
    }

    fn handle_frame(&mut self, pipe: u32, buf: KstreamBuffer, state: Vb2BufferState) {
        let count = self.captured.entry(pipe).or_default();
        match state {
            Vb2BufferState::Done => {
                debug!(
                    index = buf.index,
                    sequence = buf.sequence,
                    timestamp = buf.timestamp_ns,
                    field = ?buf.field,
                );
                *count += 1;
            }
            Vb2BufferState::Queued => (),
            Vb2BufferState::Error => debug!(index = buf.index, "Returned with error"),
        }
        if is_requeued(state, *count, self.params.frames) {
            self.requeue(pipe, buf);
        }
    }

    fn requeue(&self, pipe: u32, buf: KstreamBuffer) {
        let video = self
            .graph
            .videos
            .iter()
            .find(|video| video.kstream().id() == pipe && video.is_streaming());
        if let Some(video) = video {
            if let Err(e) = video.buf_queue(buf) {
                warn!("Fail to queue buffer again: {}", e);
            }
        }
    }

    fn is_captured(&self) -> bool {
        self.params.frames > 0
            && self.graph.videos.iter().all(|video| {
                let count = self.captured.get(&video.kstream().id()).copied();
                count.unwrap_or(0) >= self.params.frames
            })
    }

    fn stop_capture(&mut self) {
        self.graph
            .videos
            .iter()
            .filter(|video| video.is_streaming())
            .for_each(|video| {
                if let Err(e) = video.stop_streaming() {
                    error!(video = video.name().as_str(), "Fail to stop streaming: {}", e);
                }
            });

        // The buffers are returned with error state.
        for _ in self.rx.try_iter() {}

        self.allocs
            .drain(..)
            .for_each(|(allocator, addr, size)| allocator.free(addr, size));
    }

    fn report_links(&self) {
        self.monitors.iter().for_each(|monitor| {
            let label = monitor.label();
            match monitor.locked_links() {
                Ok(locked) => debug!(
                    deserializer = label.as_str(),
                    state = ?monitor.link_state(),
                    "locked: {:#06b}",
                    locked
                ),
                Err(e) => warn!(deserializer = label.as_str(), "{}", e),
            }
        });
    }

    fn report_stats(&self) {
        self.graph.videos.iter().for_each(|video| {
            let id = video.kstream().id();
            let count = self.captured.get(&id).copied().unwrap_or(0);
            println!("{}: {} frames", video.name(), count);
        });
        debug!(stats = ?self.core.stats());
        self.mipi.iter().for_each(|host| debug!(stats = ?host.stats()));
    }
}

// The buffer goes back to the pipe unless the pipe captured enough frames. The stopped pipe
// never takes it.
fn is_requeued(state: Vb2BufferState, captured: u32, frames: u32) -> bool {
    match state {
        Vb2BufferState::Done => frames == 0 || captured < frames,
        Vb2BufferState::Queued | Vb2BufferState::Error => true,
    }
}

fn handle_irq<F: FnMut()>(irq: &UioIrq, mut isr: F) -> ControlFlow {
    if let Err(e) = irq.read_count() {
        error!("{}", e);
        return ControlFlow::Break;
    }

    isr();

    match irq.enable() {
        Ok(_) => ControlFlow::Continue,
        Err(e) => {
            error!("{}", e);
            ControlFlow::Break
        }
    }
}

/// The format of pixels in memory.
#[derive(ValueEnum, Debug, Copy, Clone, PartialEq, Eq)]
enum Format {
    Uyvy,
    Yuyv,
    Yuv420,
    Rgb565,
    Rgb24,
    Sbggr8,
    Grey,
}

impl From<Format> for PixelFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Uyvy => PixelFormat::Uyvy,
            Format::Yuyv => PixelFormat::Yuyv,
            Format::Yuv420 => PixelFormat::Yuv420,
            Format::Rgb565 => PixelFormat::Rgb565,
            Format::Rgb24 => PixelFormat::Rgb24,
            Format::Sbggr8 => PixelFormat::Sbggr8,
            Format::Grey => PixelFormat::Grey,
        }
    }
}

fn parse_addr(literal: &str) -> Result<u64, String> {
    let res = match literal.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => literal.parse::<u64>(),
    };
    res.map_err(|e| format!("Invalid number {}: {}", literal, e))
}

struct CsiServiceCmd;

#[derive(Parser)]
#[clap(name = "sdrv-csi-ctl-service")]
struct Arguments {
    /// The numeric identifier of CSI host in the SoC.
    host_id: u32,

    /// The path to device tree blob.
    #[clap(long, default_value = "/sys/firmware/fdt")]
    dtb: PathBuf,

    /// The path to UIO device for interrupt of CSI host.
    #[clap(long)]
    uio: PathBuf,

    /// The path to UIO device for interrupt of MIPI CSI-2 host.
    #[clap(long)]
    mipi_uio: Option<PathBuf>,

    /// The physical address of memory reserved for DMA.
    #[clap(long, value_parser = parse_addr)]
    dma_base: u64,

    /// The size of memory reserved for DMA.
    #[clap(long, value_parser = parse_addr)]
    dma_size: u64,

    /// The number of buffers for each video node.
    #[clap(long, default_value_t = 4)]
    buffers: u32,

    /// The number of frames to capture for each video node, or 0 until interrupted.
    #[clap(long, default_value_t = 0)]
    frames: u32,

    /// The format of pixels in memory.
    #[clap(long, value_enum)]
    format: Option<Format>,

    /// The level to debug runtime, disabled as a default.
    #[clap(long, short, value_enum)]
    log_level: Option<LogLevel>,
}

impl ServiceCmd<Arguments, CaptureParams, CsiRuntime> for CsiServiceCmd {
    fn params(args: &Arguments) -> (CaptureParams, Option<LogLevel>) {
        let params = CaptureParams {
            host_id: args.host_id,
            dtb: args.dtb.clone(),
            uio: args.uio.clone(),
            mipi_uio: args.mipi_uio.clone(),
            dma_base: args.dma_base,
            dma_size: args.dma_size,
            buffers: args.buffers,
            frames: args.frames,
            format: args.format.map(PixelFormat::from),
        };
        (params, args.log_level)
    }
}

fn main() {
    CsiServiceCmd::run()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_literal() {
        assert_eq!(parse_addr("0x9c000000"), Ok(0x9c00_0000));
        assert_eq!(parse_addr("4096"), Ok(4096));
        assert!(parse_addr("0xg").is_err());
    }

    #[test]
    fn returned_buffer_policy() {
        // Unlimited capture.
        assert!(is_requeued(Vb2BufferState::Done, 100, 0));
        assert!(is_requeued(Vb2BufferState::Done, 29, 30));
        assert!(!is_requeued(Vb2BufferState::Done, 30, 30));

        // The buffer displaced in the middle of streaming is not lost.
        assert!(is_requeued(Vb2BufferState::Error, 0, 30));
        assert!(is_requeued(Vb2BufferState::Error, 30, 30));
        assert!(is_requeued(Vb2BufferState::Queued, 0, 30));
    }

    #[test]
    fn command_line() {
        let args = Arguments::try_parse_from([
            "sdrv-csi-ctl-service",
            "1",
            "--uio",
            "/dev/uio0",
            "--dma-base",
            "0x9c000000",
            "--dma-size",
            "0x2000000",
            "--format",
            "yuyv",
            "--frames",
            "30",
        ])
        .unwrap();
        let (params, log_level) = CsiServiceCmd::params(&args);
        assert_eq!(params.host_id, 1);
        assert_eq!(params.dtb, PathBuf::from("/sys/firmware/fdt"));
        assert_eq!(params.dma_base, 0x9c00_0000);
        assert_eq!(params.dma_size, 0x200_0000);
        assert_eq!(params.buffers, 4);
        assert_eq!(params.frames, 30);
        assert_eq!(params.format, Some(PixelFormat::Yuyv));
        assert_eq!(log_level, None);

        assert!(Arguments::try_parse_from(["sdrv-csi-ctl-service", "1"]).is_err());
    }
}
