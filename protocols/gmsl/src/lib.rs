// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

#![doc = include_str!("../README.md")]

pub mod ap0101;
pub mod max96705;
pub mod max96706;
pub mod max96722;
pub mod max9286;
pub mod poc;

use {
    glib::{error::ErrorDomain, Error, FileError, Quark},
    poc::Max2008x,
    sdrv_csi_protocols::{pixfmt::MbusCode, subdev::*},
    std::sync::{Arc, Mutex, PoisonError},
    tracing::{debug, debug_span, error, warn},
};

/// Transaction in I2C bus.
pub trait I2cBus: Send + Sync {
    /// Write bytes to the device at the 7 bit address.
    fn write(&self, addr: u16, data: &[u8]) -> Result<(), Error>;

    /// Write bytes then read bytes with repeated start.
    fn write_read(&self, addr: u16, wr: &[u8], rd: &mut [u8]) -> Result<(), Error>;

    /// Sleep the calling thread.
    fn delay_us(&self, us: u64);
}

impl<T: I2cBus + ?Sized> I2cBus for Arc<T> {
    fn write(&self, addr: u16, data: &[u8]) -> Result<(), Error> {
        (**self).write(addr, data)
    }

    fn write_read(&self, addr: u16, wr: &[u8], rd: &mut [u8]) -> Result<(), Error> {
        (**self).write_read(addr, wr, rd)
    }

    fn delay_us(&self, us: u64) {
        (**self).delay_us(us)
    }
}

/// Read 8 bit register at 8 bit address.
pub fn read_reg8(bus: &dyn I2cBus, addr: u16, reg: u8) -> Result<u8, Error> {
    let mut val = [0; 1];
    bus.write_read(addr, &[reg], &mut val).map_err(|e| {
        error!("Fail to read {:#04x} at {:#04x}: {}", reg, addr, e);
        e
    })?;
    Ok(val[0])
}

/// Write 8 bit register at 8 bit address.
pub fn write_reg8(bus: &dyn I2cBus, addr: u16, reg: u8, val: u8) -> Result<(), Error> {
    bus.write(addr, &[reg, val]).map_err(|e| {
        error!("Fail to write {:#04x} at {:#04x}: {}", reg, addr, e);
        e
    })
}

/// Read 8 bit register at 16 bit address.
pub fn read_reg16(bus: &dyn I2cBus, addr: u16, reg: u16) -> Result<u8, Error> {
    let mut val = [0; 1];
    bus.write_read(addr, &reg.to_be_bytes(), &mut val)
        .map_err(|e| {
            error!("Fail to read {:#06x} at {:#04x}: {}", reg, addr, e);
            e
        })?;
    Ok(val[0])
}

/// Write 8 bit register at 16 bit address.
pub fn write_reg16(bus: &dyn I2cBus, addr: u16, reg: u16, val: u8) -> Result<(), Error> {
    let [h, l] = reg.to_be_bytes();
    bus.write(addr, &[h, l, val]).map_err(|e| {
        error!("Fail to write {:#06x} at {:#04x}: {}", reg, addr, e);
        e
    })
}

/// Read 16 bit register at 16 bit address.
pub fn read_reg16_16(bus: &dyn I2cBus, addr: u16, reg: u16) -> Result<u16, Error> {
    let mut val = [0; 2];
    bus.write_read(addr, &reg.to_be_bytes(), &mut val)
        .map_err(|e| {
            error!("Fail to read {:#06x} at {:#04x}: {}", reg, addr, e);
            e
        })?;
    Ok(u16::from_be_bytes(val))
}

/// Write 16 bit register at 16 bit address.
pub fn write_reg16_16(bus: &dyn I2cBus, addr: u16, reg: u16, val: u16) -> Result<(), Error> {
    let [rh, rl] = reg.to_be_bytes();
    let [vh, vl] = val.to_be_bytes();
    bus.write(addr, &[rh, rl, vh, vl]).map_err(|e| {
        error!("Fail to write {:#06x} at {:#04x}: {}", reg, addr, e);
        e
    })
}

/// Call the closure till it returns true, with the interval between calls. Return the number
/// of calls if successful.
pub fn poll<F>(bus: &dyn I2cBus, attempts: u32, interval_us: u64, mut ready: F) -> Option<u32>
where
    F: FnMut() -> bool,
{
    let mut count = 0;
    while count < attempts {
        count += 1;
        if ready() {
            return Some(count);
        }
        if count < attempts {
            bus.delay_us(interval_us);
        }
    }
    None
}

/// The number of attempts to read chip identifier.
pub const CHIP_ID_ATTEMPTS: u32 = 10;
/// The interval between attempts to read chip identifier.
pub const CHIP_ID_INTERVAL_US: u64 = 10_000;

/// Poll the identifier of chip. No answer or unexpected identifier is fatal.
pub fn check_chip_id<F>(bus: &dyn I2cBus, name: &str, ids: &[u8], mut read: F) -> Result<u8, Error>
where
    F: FnMut() -> Result<u8, Error>,
{
    let mut id = None;
    poll(bus, CHIP_ID_ATTEMPTS, CHIP_ID_INTERVAL_US, || {
        id = read().ok();
        id.is_some()
    });

    match id {
        Some(id) if ids.contains(&id) => {
            debug!(chip = name, id);
            Ok(id)
        }
        Some(id) => {
            let msg = format!("Unexpected identifier of {}: {:#04x}", name, id);
            error!("{}", msg);
            Err(Error::new(FileError::Nxio, &msg))
        }
        None => {
            let msg = format!("{} does not answer", name);
            error!("{}", msg);
            Err(Error::new(FileError::Nxio, &msg))
        }
    }
}

/// Any error of link bring-up.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GmslLinkError {
    /// The operation is not available in current state of links.
    State,
    /// Any link is not locked.
    NoLink,
    Invalid(i32),
}

impl std::fmt::Display for GmslLinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match self {
            GmslLinkError::State => "state",
            GmslLinkError::NoLink => "no-link",
            GmslLinkError::Invalid(_) => "invalid",
        };

        write!(f, "GmslLinkError::{}", msg)
    }
}

impl ErrorDomain for GmslLinkError {
    fn domain() -> Quark {
        Quark::from_str("gmsl-link-error-quark")
    }

    fn code(self) -> i32 {
        match self {
            GmslLinkError::State => 0,
            GmslLinkError::NoLink => 1,
            GmslLinkError::Invalid(v) => v,
        }
    }

    fn from(code: i32) -> Option<Self> {
        let enumeration = match code {
            0 => GmslLinkError::State,
            1 => GmslLinkError::NoLink,
            _ => GmslLinkError::Invalid(code),
        };
        Some(enumeration)
    }
}

/// The state of links in deserializer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkState {
    PoweredOff,
    /// High-immunity mode is enabled and outputs are disabled.
    HimEnabled,
    /// The link is under training.
    LinksTraining(u32),
    AllLinksEnabled,
    OutputConfigured,
    FramesyncEnabled,
    Streaming,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::PoweredOff
    }
}

/// The policy at failure of step in register sequence.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepPolicy {
    /// The failure is logged and counted, then the sequence continues.
    Continue,
    /// The failure is returned.
    Abort,
}

/// The result of link bring-up.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BringUpReport {
    /// The mask of locked links.
    pub locked: u8,
    /// The links skipped since the serializer never answered.
    pub skipped: Vec<u32>,
    /// The number of failed steps with continue policy.
    pub soft_failures: u32,
}

impl BringUpReport {
    /// Apply the policy to the result of step.
    pub fn step(&mut self, policy: StepPolicy, res: Result<(), Error>) -> Result<(), Error> {
        match (res, policy) {
            (Ok(()), _) => Ok(()),
            (Err(e), StepPolicy::Continue) => {
                warn!("Continue after failure: {}", e);
                self.soft_failures += 1;
                Ok(())
            }
            (Err(e), StepPolicy::Abort) => Err(e),
        }
    }
}

/// Write registers at 8 bit address in the sequence of register, value, and delay in
/// microsecond after the write.
pub fn write_seq8(
    bus: &dyn I2cBus,
    addr: u16,
    seq: &[(u8, u8, u64)],
    policy: StepPolicy,
    report: &mut BringUpReport,
) -> Result<(), Error> {
    seq.iter().try_for_each(|&(reg, val, delay)| {
        report.step(policy, write_reg8(bus, addr, reg, val))?;
        if delay > 0 {
            bus.delay_us(delay);
        }
        Ok(())
    })
}

/// Write registers at 16 bit address in the sequence of register, value, and delay in
/// microsecond after the write.
pub fn write_seq16(
    bus: &dyn I2cBus,
    addr: u16,
    seq: &[(u16, u8, u64)],
    policy: StepPolicy,
    report: &mut BringUpReport,
) -> Result<(), Error> {
    seq.iter().try_for_each(|&(reg, val, delay)| {
        report.step(policy, write_reg16(bus, addr, reg, val))?;
        if delay > 0 {
            bus.delay_us(delay);
        }
        Ok(())
    })
}

/// The orientation of camera module.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Rotation {
    Normal,
    /// Mirrored and flipped.
    UpsideDown,
}

impl Default for Rotation {
    fn default() -> Self {
        Self::Normal
    }
}

impl Rotation {
    /// Parse the value of `rotation` property. Unsupported value is ignored.
    pub fn from_degrees(degrees: u32) -> Self {
        match degrees {
            0 => Self::Normal,
            180 => Self::UpsideDown,
            _ => {
                warn!(degrees, "Unsupported rotation");
                Self::Normal
            }
        }
    }
}

/// Parameters of deserializer and the chips behind it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GmslParams {
    /// The address of deserializer.
    pub des_addr: u16,
    /// The base of addresses assigned to serializers.
    pub ser_base: u16,
    /// The base of addresses assigned to image signal processors.
    pub isp_base: u16,
    /// The deserializer is secondary one in the same bus, thus the addresses are shifted.
    pub sec_9286: bool,
    pub sec_9286_shift: u16,
    pub link_count: u32,
    /// The number of lanes for MIPI CSI-2 output.
    pub lanes: u32,
    /// Generate frame sync internally.
    pub frame_sync: bool,
    pub rotation: Rotation,
}

impl Default for GmslParams {
    fn default() -> Self {
        Self {
            des_addr: 0x48,
            ser_base: 0x60,
            isp_base: 0x30,
            sec_9286: false,
            sec_9286_shift: 4,
            link_count: 4,
            lanes: 4,
            frame_sync: true,
            rotation: Default::default(),
        }
    }
}

impl GmslParams {
    fn shift(&self) -> u16 {
        if self.sec_9286 {
            self.sec_9286_shift
        } else {
            0
        }
    }

    /// The address assigned to serializer of the link.
    pub fn ser_addr(&self, ch: u32) -> u16 {
        self.ser_base + ch as u16 + self.shift()
    }

    /// The address assigned to image signal processor of the link.
    pub fn isp_addr(&self, ch: u32) -> u16 {
        self.isp_base + ch as u16 + self.shift()
    }

    pub fn validate(&self, max_links: u32) -> Result<(), Error> {
        if self.link_count == 0 || self.link_count > max_links {
            let msg = format!("Invalid number of links: {}", self.link_count);
            Err(Error::new(FileError::Inval, &msg))
        } else if self.lanes == 0 || self.lanes > 4 {
            let msg = format!("Invalid number of lanes: {}", self.lanes);
            Err(Error::new(FileError::Inval, &msg))
        } else {
            Ok(())
        }
    }
}

/// The line of general purpose I/O.
pub trait GpioLine: Send + Sync {
    fn set_value(&self, high: bool) -> Result<(), Error>;
}

const PWDN_SETTLE_US: u64 = 20_000;
const POC_SETTLE_US: u64 = 300_000;

/// Power control of deserializer and camera modules.
#[derive(Default)]
pub struct GmslPower {
    /// The line of power down, active low.
    pub pwdn: Option<Arc<dyn GpioLine>>,
    /// Power over coax.
    pub poc: Option<Max2008x>,
}

impl GmslPower {
    pub fn power_on(&self, bus: &dyn I2cBus, link_count: u32) -> Result<(), Error> {
        if let Some(pwdn) = &self.pwdn {
            pwdn.set_value(true)?;
            bus.delay_us(PWDN_SETTLE_US);
        }
        if let Some(poc) = &self.poc {
            poc.enable_outputs(link_count)?;
            bus.delay_us(POC_SETTLE_US);
        }
        Ok(())
    }

    pub fn power_off(&self) -> Result<(), Error> {
        if let Some(poc) = &self.poc {
            poc.disable_outputs()?;
        }
        if let Some(pwdn) = &self.pwdn {
            pwdn.set_value(false)?;
        }
        Ok(())
    }
}

/// Steps of link bring-up in deserializer.
pub trait GmslDeserializer: Send + Sync {
    const NAME: &'static str;
    const MAX_LINKS: u32;

    fn bus(&self) -> &dyn I2cBus;
    fn params(&self) -> &GmslParams;
    fn power(&self) -> &GmslPower;

    fn check_chip_id(&self) -> Result<(), Error>;

    /// Enable high-immunity mode and disable outputs.
    fn enable_him(&self, report: &mut BringUpReport) -> Result<(), Error>;

    /// Train the link. Return false when the serializer never answers.
    fn train_link(&self, ch: u32, report: &mut BringUpReport) -> Result<bool, Error>;

    fn enable_all_links(&self, locked: u8, report: &mut BringUpReport) -> Result<(), Error>;

    fn configure_output(&self, locked: u8, report: &mut BringUpReport) -> Result<(), Error>;

    fn enable_framesync(&self, report: &mut BringUpReport) -> Result<(), Error>;

    /// Enable or disable MIPI CSI-2 output.
    fn set_output(&self, enable: bool) -> Result<(), Error>;

    /// Read the mask of locked links.
    fn link_status(&self) -> Result<u8, Error>;
}

/// The maximum number of source pads, one for each link.
pub const MAX_PADS: usize = 4;

fn poisoned<T>(e: PoisonError<T>) -> Error {
    let msg = format!("{}", e);
    Error::new(FileError::Io, &msg)
}

/// Deserializer as sub-device.
pub struct DeserializerSubdev<D: GmslDeserializer> {
    dev: D,
    state: Mutex<LinkState>,
    report: Mutex<BringUpReport>,
    fmts: Mutex<[MbusFrameFormat; MAX_PADS]>,
    interval: Mutex<FrameInterval>,
}

impl<D: GmslDeserializer> DeserializerSubdev<D> {
    /// Bring up links of the deserializer.
    pub fn probe(dev: D) -> Result<Self, Error> {
        dev.params().validate(D::MAX_LINKS)?;

        let sd = Self {
            dev,
            state: Default::default(),
            report: Default::default(),
            fmts: Default::default(),
            interval: Default::default(),
        };
        sd.bring_up()?;
        Ok(sd)
    }

    pub fn dev(&self) -> &D {
        &self.dev
    }

    pub fn state(&self) -> LinkState {
        self.state.lock().map(|s| *s).unwrap_or_default()
    }

    pub fn report(&self) -> BringUpReport {
        self.report
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Read the mask of locked links.
    pub fn link_status(&self) -> Result<u8, Error> {
        if self.state() == LinkState::PoweredOff {
            Err(Error::new(GmslLinkError::State, "Links are powered off"))
        } else {
            self.dev.link_status()
        }
    }

    fn bring_up(&self) -> Result<(), Error> {
        let _enter = debug_span!("bring-up", chip = D::NAME).entered();

        let mut state = self.state.lock().map_err(poisoned)?;
        let mut report = BringUpReport::default();
        let res = self.walk(&mut state, &mut report);
        if res.is_err() {
            if let Err(e) = self.dev.power().power_off() {
                warn!(chip = D::NAME, "Fail to power off after bring-up failure: {}", e);
            }
            *state = LinkState::PoweredOff;
        }
        debug!(
            state = ?*state,
            locked = report.locked,
            soft_failures = report.soft_failures,
        );
        *self.report.lock().map_err(poisoned)? = report;

        res
    }

    fn walk(&self, state: &mut LinkState, report: &mut BringUpReport) -> Result<(), Error> {
        let params = self.dev.params();

        self.dev.power().power_on(self.dev.bus(), params.link_count)?;
        self.dev.check_chip_id()?;

        self.dev.enable_him(report)?;
        *state = LinkState::HimEnabled;

        (0..params.link_count).try_for_each(|ch| {
            *state = LinkState::LinksTraining(ch);
            if self.dev.train_link(ch, report)? {
                report.locked |= 1 << ch;
            } else {
                warn!(chip = D::NAME, ch, "Link is skipped");
                report.skipped.push(ch);
            }
            Ok::<(), Error>(())
        })?;

        if report.locked == 0 {
            warn!(chip = D::NAME, "No link is locked");
        }

        self.dev.enable_all_links(report.locked, report)?;
        *state = LinkState::AllLinksEnabled;

        self.dev.configure_output(report.locked, report)?;
        *state = LinkState::OutputConfigured;

        self.dev.enable_framesync(report)?;
        *state = LinkState::FramesyncEnabled;

        Ok(())
    }

    fn check_pad(&self, pad: u32) -> Result<usize, Error> {
        if pad < self.dev.params().link_count {
            Ok(pad as usize)
        } else {
            let msg = format!("Pad {} is out of range", pad);
            Err(Error::new(FileError::Inval, &msg))
        }
    }
}

impl<D: GmslDeserializer> V4l2Subdev for DeserializerSubdev<D> {
    fn name(&self) -> String {
        format!("{} {:02x}", D::NAME, self.dev.params().des_addr)
    }

    fn s_power(&self, on: bool) -> Result<(), Error> {
        let powered_off = self.state() == LinkState::PoweredOff;
        if on && powered_off {
            self.bring_up()
        } else if !on && !powered_off {
            let mut state = self.state.lock().map_err(poisoned)?;
            if *state == LinkState::Streaming {
                if let Err(e) = self.dev.set_output(false) {
                    warn!(chip = D::NAME, "Fail to stop output: {}", e);
                }
            }
            *state = LinkState::PoweredOff;
            self.dev.power().power_off()
        } else {
            Ok(())
        }
    }

    fn s_stream(&self, enable: bool) -> Result<(), Error> {
        let mut state = self.state.lock().map_err(poisoned)?;
        match (enable, *state) {
            (true, LinkState::FramesyncEnabled) => {
                self.dev.set_output(true)?;
                *state = LinkState::Streaming;
                Ok(())
            }
            (false, LinkState::Streaming) => {
                self.dev.set_output(false)?;
                *state = LinkState::FramesyncEnabled;
                Ok(())
            }
            (true, LinkState::Streaming) | (false, LinkState::FramesyncEnabled) => Ok(()),
            (_, s) => {
                let msg = format!("Links are not ready: {:?}", s);
                Err(Error::new(GmslLinkError::State, &msg))
            }
        }
    }

    fn get_fmt(&self, pad: u32) -> Result<MbusFrameFormat, Error> {
        let i = self.check_pad(pad)?;
        self.fmts.lock().map(|fmts| fmts[i]).map_err(poisoned)
    }

    fn set_fmt(&self, pad: u32, fmt: &mut MbusFrameFormat) -> Result<(), Error> {
        let i = self.check_pad(pad)?;
        fmt.code = MbusCode::Uyvy8_2x8;
        fmt.field = Field::None;
        let mut fmts = self.fmts.lock().map_err(poisoned)?;
        fmts[i] = *fmt;
        Ok(())
    }

    fn enum_mbus_code(&self, pad: u32, index: u32) -> Result<MbusCode, Error> {
        self.check_pad(pad)?;
        if index > 0 {
            Err(Error::new(FileError::Inval, "Index out of range"))
        } else {
            Ok(MbusCode::Uyvy8_2x8)
        }
    }

    fn enum_frame_size(
        &self,
        pad: u32,
        index: u32,
        code: MbusCode,
    ) -> Result<FrameSizeRange, Error> {
        let fmt = self.get_fmt(pad)?;
        if index > 0 || code != fmt.code {
            Err(Error::new(FileError::Inval, "Index out of range"))
        } else {
            Ok(FrameSizeRange {
                min_width: fmt.width,
                max_width: fmt.width,
                min_height: fmt.height,
                max_height: fmt.height,
            })
        }
    }

    fn enum_frame_interval(
        &self,
        pad: u32,
        index: u32,
        code: MbusCode,
        width: u32,
        height: u32,
    ) -> Result<FrameInterval, Error> {
        let fmt = self.get_fmt(pad)?;
        if index > 0 || code != fmt.code || width != fmt.width || height != fmt.height {
            Err(Error::new(FileError::Inval, "Index out of range"))
        } else {
            self.g_frame_interval()
        }
    }

    fn g_frame_interval(&self) -> Result<FrameInterval, Error> {
        self.interval.lock().map(|i| *i).map_err(poisoned)
    }

    fn s_frame_interval(&self, interval: &mut FrameInterval) -> Result<(), Error> {
        if interval.numerator == 0 || interval.denominator == 0 {
            *interval = self.g_frame_interval()?;
        } else {
            *self.interval.lock().map_err(poisoned)? = *interval;
        }
        Ok(())
    }
}
