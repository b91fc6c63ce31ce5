// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! MIPI CSI-2 host controller with DPHY and image pixel interfaces (IPI).
//!
//! Several virtual channels share one physical DPHY, thus the controller is initialized at the
//! first stream-on and powered off at the last stream-off. The frequency range of DPHY is
//! selected by a register in display mux block, which is shared with the other IPs; it is
//! mapped just for the write.

use {
    super::{pixfmt::MbusCode, subdev::*, *},
    glib::{error::ErrorDomain, Quark},
    std::sync::Mutex,
    tracing::{debug, debug_span, error},
};

pub const CSI2_VERSION: u32 = 0x00;
pub const CSI2_VERSION_MAGIC: u32 = 0x3133_302a;
pub const CSI2_N_LANES: u32 = 0x04;
pub const CSI2_RESETN: u32 = 0x08;
pub const CSI2_INT_ST_MAIN: u32 = 0x2c;
pub const CSI2_PHY_SHUTDOWNZ: u32 = 0x40;
pub const CSI2_DPHY_RSTZ: u32 = 0x44;

/// The base offset of register block for each IPI.
pub const IPI_BASES: [u32; 4] = [0x80, 0x200, 0x220, 0x240];
pub const IPI_MODE: u32 = 0x00;
pub const IPI_VCID: u32 = 0x04;
pub const IPI_DATA_TYPE: u32 = 0x08;
pub const IPI_MEM_FLUSH: u32 = 0x0c;
pub const IPI_HSA_TIME: u32 = 0x10;
pub const IPI_HBP_TIME: u32 = 0x14;
pub const IPI_HSD_TIME: u32 = 0x18;

pub const IPI_MODE_CONTROLLER: u32 = 1 << 0;
pub const IPI_MODE_COLOR16: u32 = 1 << 8;
pub const IPI_MODE_CUT_THROUGH: u32 = 1 << 16;
pub const IPI_MODE_ENABLE: u32 = 1 << 24;
pub const IPI_MEM_FLUSH_AUTO: u32 = 1 << 8;

pub fn ipi_adv_features(ipi: usize) -> u32 {
    if ipi == 0 {
        0xac
    } else {
        IPI_BASES[ipi] + 0x1c
    }
}

pub const INT_ST_PHY_FATAL: u32 = 0xe0;
pub const INT_MSK_PHY_FATAL: u32 = 0xe4;
pub const INT_ST_PKT_FATAL: u32 = 0xf0;
pub const INT_MSK_PKT_FATAL: u32 = 0xf4;
pub const INT_ST_FRAME_FATAL: u32 = 0x100;
pub const INT_MSK_FRAME_FATAL: u32 = 0x104;
pub const INT_ST_PHY: u32 = 0x110;
pub const INT_MSK_PHY: u32 = 0x114;
pub const INT_ST_PKT: u32 = 0x120;
pub const INT_MSK_PKT: u32 = 0x124;
pub const INT_ST_LINE: u32 = 0x130;
pub const INT_MSK_LINE: u32 = 0x134;
pub const INT_ST_IPI: u32 = 0x140;
pub const INT_MSK_IPI: u32 = 0x144;

pub const MAIN_PHY_FATAL: u32 = 1 << 0;
pub const MAIN_PKT_FATAL: u32 = 1 << 1;
pub const MAIN_FRAME_FATAL: u32 = 1 << 2;
pub const MAIN_PHY: u32 = 1 << 16;
pub const MAIN_PKT: u32 = 1 << 17;
pub const MAIN_LINE: u32 = 1 << 18;
pub const MAIN_IPI: u32 = 1 << 19;

const INT_MASKS: [u32; 7] = [
    INT_MSK_PHY_FATAL,
    INT_MSK_PKT_FATAL,
    INT_MSK_FRAME_FATAL,
    INT_MSK_PHY,
    INT_MSK_PKT,
    INT_MSK_LINE,
    INT_MSK_IPI,
];

/// The maximum number of data lanes.
pub const MAX_LANES: u32 = 4;

/// The number of virtual channels. Sink pads are followed by source pads.
pub const MIPI_CSI2_VC_COUNT: u32 = 4;

/// Any error of MIPI CSI-2 host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CsiHostError {
    /// The version register has unexpected value.
    Version,
    /// The rate of DPHY is out of supported range.
    PhyFreq,
    Invalid(i32),
}

impl std::fmt::Display for CsiHostError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match self {
            CsiHostError::Version => "version",
            CsiHostError::PhyFreq => "phy-freq",
            CsiHostError::Invalid(_) => "invalid",
        };

        write!(f, "CsiHostError::{}", msg)
    }
}

impl ErrorDomain for CsiHostError {
    fn domain() -> Quark {
        Quark::from_str("sdrv-csi-host-error-quark")
    }

    fn code(self) -> i32 {
        match self {
            CsiHostError::Version => 0,
            CsiHostError::PhyFreq => 1,
            CsiHostError::Invalid(v) => v,
        }
    }

    fn from(code: i32) -> Option<Self> {
        let enumeration = match code {
            0 => CsiHostError::Version,
            1 => CsiHostError::PhyFreq,
            _ => CsiHostError::Invalid(code),
        };
        Some(enumeration)
    }
}

/// The range of rate in MHz, `[range_l, range_h)`, and its code for frequency selection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhyFreqRange {
    pub range_l: u32,
    pub range_h: u32,
    pub code: u8,
}

const PHY_FREQ_BOUNDS: [u32; 64] = [
    80, 90, 100, 110, 120, 130, 140, 150, 160, 170, 180, 190, 205, 220, 235, 250, 275, 300, 325,
    350, 375, 400, 450, 500, 550, 600, 650, 700, 750, 800, 850, 900, 950, 1000, 1050, 1100, 1150,
    1200, 1250, 1300, 1350, 1400, 1450, 1500, 1550, 1600, 1650, 1700, 1750, 1800, 1850, 1900,
    1950, 2000, 2050, 2100, 2150, 2200, 2250, 2300, 2350, 2400, 2450, 2500,
];

const fn build_phy_freqs() -> [PhyFreqRange; 63] {
    let mut table = [PhyFreqRange {
        range_l: 0,
        range_h: 0,
        code: 0,
    }; 63];
    let mut i = 0;
    while i < 63 {
        table[i] = PhyFreqRange {
            range_l: PHY_FREQ_BOUNDS[i],
            range_h: PHY_FREQ_BOUNDS[i + 1],
            code: i as u8,
        };
        i += 1;
    }
    table
}

/// The table of frequency ranges for DPHY.
pub const PHY_FREQS: [PhyFreqRange; 63] = build_phy_freqs();

/// Find the range for the rate in MHz.
pub fn find_phy_freq(phyrate: u32) -> Option<&'static PhyFreqRange> {
    PHY_FREQS
        .iter()
        .find(|r| r.range_l <= phyrate && phyrate < r.range_h)
}

/// The region shared with the other IPs. It is claimed and mapped just for access.
pub trait SharedRegion: Send + Sync {
    /// The mapping, unmapped and released when dropped.
    type Mapping: RegisterIo;

    fn map(&self) -> Result<Self::Mapping, Error>;
}

/// The field for frequency selection in display mux block.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DispmuxField {
    pub offset: u32,
    pub shift: u32,
}

const DISPMUX_FREQ_MASK: u32 = 0x7f;

/// Select frequency range of DPHY for the rate of lane in MHz. The region is not mapped when
/// the rate is out of range.
pub fn set_phy_freq<R: SharedRegion>(
    region: &R,
    field: &DispmuxField,
    freq: u32,
    lanes: u32,
) -> Result<u8, Error> {
    let phyrate = freq
        .checked_mul(lanes)
        .and_then(|rate| rate.checked_mul(2))
        .ok_or_else(|| {
            let msg = format!("Rate of lane {} MHz by {} lanes is too large", freq, lanes);
            Error::new(FileError::Inval, &msg)
        })?;
    let range = find_phy_freq(phyrate).ok_or_else(|| {
        let msg = format!("Rate of DPHY {} MHz is out of range", phyrate);
        error!("{}", msg);
        Error::new(CsiHostError::PhyFreq, &msg)
    })?;

    let mapping = region.map()?;
    mapping.update(
        field.offset,
        DISPMUX_FREQ_MASK << field.shift,
        (range.code as u32) << field.shift,
    );
    debug!(phyrate, code = range.code);

    Ok(range.code)
}

/// Parameters of IPI.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct IpiConfig {
    pub vc: u32,
    pub code: MbusCode,
    /// Timing by controller instead of camera.
    pub controller_timing: bool,
    pub hsa: u32,
    pub hbp: u32,
    pub hsd: u32,
    pub adv_features: u32,
}

/// Parameters of host.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MipiCsi2Config {
    pub host_id: u32,
    pub lanes: u32,
    /// The rate of lane in MHz.
    pub lane_rate: u32,
    pub ipis: Vec<IpiConfig>,
    pub dispmux: DispmuxField,
}

/// The counters of interrupts.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MipiCsi2Stats {
    pub phy_fatal: u32,
    pub pkt_fatal: u32,
    pub frame_fatal: u32,
    pub phy: u32,
    pub pkt: u32,
    pub line: u32,
    pub ipi: u32,
}

/// The host controller.
pub struct MipiCsi2Host<R: SharedRegion> {
    io: Arc<dyn RegisterIo>,
    dispmux: R,
    config: MipiCsi2Config,
    sensor: Mutex<Option<Arc<dyn V4l2Subdev>>>,
    // Held across initialization of DPHY.
    active_stream_num: Mutex<u32>,
    stats: Mutex<MipiCsi2Stats>,
}

impl<R: SharedRegion> MipiCsi2Host<R> {
    pub fn new(io: Arc<dyn RegisterIo>, dispmux: R, config: MipiCsi2Config) -> Result<Self, Error> {
        if config.lanes == 0 || config.lanes > MAX_LANES {
            let msg = format!("Invalid number of lanes: {}", config.lanes);
            Err(invalid_arg(&msg))?;
        }
        if config.ipis.len() > IPI_BASES.len() {
            let msg = format!("Too many IPIs: {}", config.ipis.len());
            Err(invalid_arg(&msg))?;
        }

        Ok(Self {
            io,
            dispmux,
            config,
            sensor: Default::default(),
            active_stream_num: Default::default(),
            stats: Default::default(),
        })
    }

    fn sensor(&self) -> Result<Arc<dyn V4l2Subdev>, Error> {
        self.sensor
            .lock()
            .map_err(poisoned)?
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::new(FileError::Nodev, "No sensor is bound"))
    }

    pub fn active_stream_num(&self) -> u32 {
        self.active_stream_num.lock().map(|n| *n).unwrap_or(0)
    }

    pub fn stats(&self) -> MipiCsi2Stats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }

    fn init(&self) -> Result<(), Error> {
        let version = self.io.readl(CSI2_VERSION);
        if version != CSI2_VERSION_MAGIC {
            let msg = format!("Unexpected version: {:#010x}", version);
            Err(Error::new(CsiHostError::Version, &msg))?;
        }

        self.io.writel(CSI2_RESETN, 0);
        self.io.writel(CSI2_N_LANES, self.config.lanes - 1);

        self.config.ipis.iter().enumerate().for_each(|(i, ipi)| {
            let base = IPI_BASES[i];
            let mut mode = IPI_MODE_ENABLE | IPI_MODE_CUT_THROUGH;
            if ipi.controller_timing {
                mode |= IPI_MODE_CONTROLLER;
            }
            self.io.writel(base + IPI_MODE, mode);
            self.io.writel(base + IPI_VCID, ipi.vc & 0x3);
            self.io.writel(base + IPI_DATA_TYPE, ipi.code.csi2_data_type());
            self.io.writel(base + IPI_MEM_FLUSH, IPI_MEM_FLUSH_AUTO);
            self.io.writel(base + IPI_HSA_TIME, ipi.hsa & 0xfff);
            self.io.writel(base + IPI_HBP_TIME, ipi.hbp & 0xfff);
            self.io.writel(base + IPI_HSD_TIME, ipi.hsd & 0xfff);
            self.io.writel(ipi_adv_features(i), ipi.adv_features);
        });

        set_phy_freq(
            &self.dispmux,
            &self.config.dispmux,
            self.config.lane_rate,
            self.config.lanes,
        )?;

        Ok(())
    }

    fn power_on(&self) {
        self.io.writel(CSI2_PHY_SHUTDOWNZ, 1);
        self.io.writel(CSI2_DPHY_RSTZ, 1);
        self.io.writel(CSI2_RESETN, 1);
        INT_MASKS
            .iter()
            .for_each(|reg| self.io.writel(*reg, 0xffff_ffff));
    }

    fn power_off(&self) {
        INT_MASKS.iter().for_each(|reg| self.io.writel(*reg, 0));
        self.io.writel(CSI2_DPHY_RSTZ, 0);
        self.io.writel(CSI2_PHY_SHUTDOWNZ, 0);
        self.io.writel(CSI2_RESETN, 0);
    }

    /// Handle interrupt. The status registers are cleared by read.
    pub fn irq(&self) {
        let main = self.io.readl(CSI2_INT_ST_MAIN);
        if main == 0 {
            return;
        }

        if let Ok(mut guard) = self.stats.lock() {
            let stats = &mut *guard;
            [
                (MAIN_PHY_FATAL, INT_ST_PHY_FATAL, &mut stats.phy_fatal),
                (MAIN_PKT_FATAL, INT_ST_PKT_FATAL, &mut stats.pkt_fatal),
                (MAIN_FRAME_FATAL, INT_ST_FRAME_FATAL, &mut stats.frame_fatal),
                (MAIN_PHY, INT_ST_PHY, &mut stats.phy),
                (MAIN_PKT, INT_ST_PKT, &mut stats.pkt),
                (MAIN_LINE, INT_ST_LINE, &mut stats.line),
                (MAIN_IPI, INT_ST_IPI, &mut stats.ipi),
            ]
            .iter_mut()
            .filter(|(bit, _, _)| main & *bit > 0)
            .for_each(|(_, reg, counter)| {
                let status = self.io.readl(*reg);
                **counter = counter.wrapping_add(1);
                debug!(
                    host = self.config.host_id,
                    "Interrupt at {:#05x}: {:#010x}", reg, status
                );
            });
        }
    }
}

impl<R: SharedRegion> InterfaceSubdev for MipiCsi2Host<R> {
    fn bind_sensor(&self, sensor: Arc<dyn V4l2Subdev>) -> Result<(), Error> {
        let mut entry = self.sensor.lock().map_err(poisoned)?;
        *entry = Some(sensor);
        Ok(())
    }

    fn pads(&self, vc: u32) -> (u32, u32) {
        (vc, vc + MIPI_CSI2_VC_COUNT)
    }
}

impl<R: SharedRegion> V4l2Subdev for MipiCsi2Host<R> {
    fn name(&self) -> String {
        format!("sdrv-mipi-csi2-{}", self.config.host_id)
    }

    fn s_power(&self, on: bool) -> Result<(), Error> {
        self.sensor()?.s_power(on)
    }

    fn s_stream(&self, enable: bool) -> Result<(), Error> {
        let _enter = debug_span!("mipi-csi2", host = self.config.host_id, enable).entered();
        let sensor = self.sensor()?;
        let mut count = self.active_stream_num.lock().map_err(poisoned)?;

        if enable {
            if *count == 0 {
                self.init()?;
                self.power_on();
                if let Err(err) = sensor.s_stream(true) {
                    self.power_off();
                    return Err(err);
                }
            }
            *count += 1;
        } else if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.power_off();
                sensor.s_stream(false)?;
            }
        }

        debug!(active_stream_num = *count);

        Ok(())
    }

    fn get_fmt(&self, pad: u32) -> Result<MbusFrameFormat, Error> {
        self.sensor()?.get_fmt(pad % MIPI_CSI2_VC_COUNT)
    }

    fn set_fmt(&self, pad: u32, fmt: &mut MbusFrameFormat) -> Result<(), Error> {
        self.sensor()?.set_fmt(pad % MIPI_CSI2_VC_COUNT, fmt)
    }

    fn enum_mbus_code(&self, pad: u32, index: u32) -> Result<MbusCode, Error> {
        self.sensor()?.enum_mbus_code(pad % MIPI_CSI2_VC_COUNT, index)
    }

    fn enum_frame_size(
        &self,
        pad: u32,
        index: u32,
        code: MbusCode,
    ) -> Result<FrameSizeRange, Error> {
        self.sensor()?.enum_frame_size(pad % MIPI_CSI2_VC_COUNT, index, code)
    }

    fn enum_frame_interval(
        &self,
        pad: u32,
        index: u32,
        code: MbusCode,
        width: u32,
        height: u32,
    ) -> Result<FrameInterval, Error> {
        self.sensor()?
            .enum_frame_interval(pad % MIPI_CSI2_VC_COUNT, index, code, width, height)
    }

    fn g_frame_interval(&self) -> Result<FrameInterval, Error> {
        self.sensor()?.g_frame_interval()
    }

    fn s_frame_interval(&self, interval: &mut FrameInterval) -> Result<(), Error> {
        self.sensor()?.s_frame_interval(interval)
    }
}

#[cfg(test)]
mod test {
    use {super::super::test_utils::*, super::*};

    struct FakeMapping {
        io: Arc<RecordingIo>,
        live: Arc<Mutex<i32>>,
    }

    impl RegisterIo for FakeMapping {
        fn readl(&self, offset: u32) -> u32 {
            self.io.readl(offset)
        }

        fn writel(&self, offset: u32, val: u32) {
            self.io.writel(offset, val)
        }
    }

    impl Drop for FakeMapping {
        fn drop(&mut self) {
            *self.live.lock().unwrap() -= 1;
        }
    }

    #[derive(Default)]
    struct FakeRegion {
        io: Arc<RecordingIo>,
        maps: Mutex<u32>,
        live: Arc<Mutex<i32>>,
    }

    impl SharedRegion for FakeRegion {
        type Mapping = FakeMapping;

        fn map(&self) -> Result<Self::Mapping, Error> {
            *self.maps.lock().unwrap() += 1;
            *self.live.lock().unwrap() += 1;
            Ok(FakeMapping {
                io: self.io.clone(),
                live: self.live.clone(),
            })
        }
    }

    #[test]
    fn phy_freq_table_is_contiguous() {
        assert_eq!(PHY_FREQS.len(), 63);
        assert_eq!(PHY_FREQS[0].range_l, 80);
        assert_eq!(PHY_FREQS[62].range_h, 2500);
        assert!(PHY_FREQS.windows(2).all(|w| w[0].range_h == w[1].range_l));
        assert!(PHY_FREQS.iter().all(|r| r.range_l < r.range_h));
    }

    #[test]
    fn phy_freq_lookup_selects_one_row() {
        (80..2500).for_each(|rate| {
            let count = PHY_FREQS
                .iter()
                .filter(|r| r.range_l <= rate && rate < r.range_h)
                .count();
            assert_eq!(count, 1, "{}", rate);
            assert!(find_phy_freq(rate).is_some());
        });
        assert!(find_phy_freq(79).is_none());
        assert!(find_phy_freq(2500).is_none());
        assert_eq!(find_phy_freq(205).map(|r| r.range_l), Some(205));
    }

    #[test]
    fn phy_freq_out_of_range_leaves_dispmux() {
        let region = FakeRegion::default();
        let field = DispmuxField {
            offset: 0x40,
            shift: 8,
        };

        // 625 * 2 * 2 = 2500.
        let err = set_phy_freq(&region, &field, 625, 2).unwrap_err();
        assert_eq!(err.kind::<CsiHostError>(), Some(CsiHostError::PhyFreq));
        let err = set_phy_freq(&region, &field, 9, 4).unwrap_err();
        assert_eq!(err.kind::<CsiHostError>(), Some(CsiHostError::PhyFreq));
        let err = set_phy_freq(&region, &field, u32::MAX / 2, 4).unwrap_err();
        assert_eq!(err.kind::<FileError>(), Some(FileError::Inval));
        let err = set_phy_freq(&region, &field, 0x8000_0000, 1).unwrap_err();
        assert_eq!(err.kind::<FileError>(), Some(FileError::Inval));
        assert_eq!(*region.maps.lock().unwrap(), 0);
        assert!(region.io.writes().is_empty());

        region.io.preset(0x40, 0xffff_00ff);
        let code = set_phy_freq(&region, &field, 100, 4).unwrap();
        assert_eq!(PHY_FREQS[code as usize].range_l, 800);
        assert_eq!(region.io.value(0x40), 0xffff_00ff | ((code as u32) << 8));
        assert_eq!(*region.maps.lock().unwrap(), 1);
        assert_eq!(*region.live.lock().unwrap(), 0);
    }

    fn host(version: u32) -> (MipiCsi2Host<FakeRegion>, Arc<RecordingIo>, Arc<FakeSubdev>) {
        let io = Arc::new(RecordingIo::default());
        io.preset(CSI2_VERSION, version);
        let config = MipiCsi2Config {
            host_id: 0,
            lanes: 4,
            lane_rate: 100,
            ipis: (0..4)
                .map(|vc| IpiConfig {
                    vc,
                    hsa: 0x10,
                    hbp: 0x20,
                    hsd: 0x30,
                    ..Default::default()
                })
                .collect(),
            dispmux: DispmuxField {
                offset: 0x40,
                shift: 0,
            },
        };
        let host = MipiCsi2Host::new(io.clone(), FakeRegion::default(), config).unwrap();
        let sensor = Arc::new(FakeSubdev::new(uyvy_format(1280, 720), io.clone()));
        host.bind_sensor(sensor.clone()).unwrap();
        (host, io, sensor)
    }

    #[test]
    fn stream_reference_count() {
        let (host, io, sensor) = host(CSI2_VERSION_MAGIC);

        host.s_stream(true).unwrap();
        assert_eq!(io.value(CSI2_N_LANES), 3);
        assert_eq!(io.value(IPI_BASES[3] + IPI_VCID), 3);
        assert_eq!(io.value(IPI_BASES[2] + IPI_DATA_TYPE), 0x1e);
        assert_eq!(io.value(IPI_BASES[1] + IPI_HBP_TIME), 0x20);
        assert_eq!(io.value(CSI2_PHY_SHUTDOWNZ), 1);
        assert_eq!(*host.dispmux.maps.lock().unwrap(), 1);
        let writes = io.writes().len();

        host.s_stream(true).unwrap();
        host.s_stream(true).unwrap();
        assert_eq!(io.writes().len(), writes);
        assert_eq!(host.active_stream_num(), 3);
        assert_eq!(sensor.stream_calls().len(), 1);

        host.s_stream(false).unwrap();
        host.s_stream(false).unwrap();
        assert_eq!(io.value(CSI2_PHY_SHUTDOWNZ), 1);
        assert_eq!(sensor.stream_calls().len(), 1);

        host.s_stream(false).unwrap();
        assert_eq!(io.value(CSI2_PHY_SHUTDOWNZ), 0);
        assert_eq!(host.active_stream_num(), 0);
        assert_eq!(
            sensor.stream_calls().iter().map(|c| c.0).collect::<Vec<_>>(),
            vec![true, false]
        );

        // Extra stream-off is ignored.
        host.s_stream(false).unwrap();
        assert_eq!(sensor.stream_calls().len(), 2);
    }

    #[test]
    fn version_mismatch() {
        let (host, io, sensor) = host(0x3132_302a);
        let err = host.s_stream(true).unwrap_err();
        assert_eq!(err.kind::<CsiHostError>(), Some(CsiHostError::Version));
        assert_eq!(host.active_stream_num(), 0);
        assert!(sensor.stream_calls().is_empty());
        assert_eq!(io.value(CSI2_PHY_SHUTDOWNZ), 0);
    }

    #[test]
    fn interrupt_counters() {
        let (host, io, _) = host(CSI2_VERSION_MAGIC);
        io.preset(CSI2_INT_ST_MAIN, MAIN_PKT_FATAL | MAIN_LINE);
        host.irq();
        host.irq();
        io.preset(CSI2_INT_ST_MAIN, MAIN_IPI);
        host.irq();
        let stats = host.stats();
        assert_eq!(stats.pkt_fatal, 2);
        assert_eq!(stats.line, 2);
        assert_eq!(stats.ipi, 1);
        assert_eq!(stats.phy_fatal, 0);
    }

    #[test]
    fn pad_operations_are_proxied() {
        let (host, _, _) = host(CSI2_VERSION_MAGIC);
        assert_eq!(host.get_fmt(0).unwrap(), uyvy_format(1280, 720));
        assert_eq!(host.get_fmt(host.pads(2).1).unwrap(), uyvy_format(1280, 720));
        assert_eq!(host.pads(3), (3, 7));
        assert!(host.g_frame_interval().is_ok());
        assert!(host.enum_frame_size(0, 0, MbusCode::Uyvy8_2x8).is_err());
    }
}
