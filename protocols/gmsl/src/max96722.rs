// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol for Maxim MAX96722 quad GMSL deserializer.
//!
//! The registers are addressed by 16 bit. The links are operated in GMSL1 mode for MAX96705
//! serializer.
//!
//! The serializers answer at the same default address after power-on, even if they are behind
//! the other deserializer in the same I2C bus. The window of default address is guarded by
//! the lock shared by deserializers in the bus.

use {
    super::max96705::*,
    super::*,
    std::sync::{MutexGuard, TryLockError},
};

pub const MAX96722_ID: u8 = 0xa1;

pub const MAX96722_REG_LINK_EN: u16 = 0x0006;
pub const MAX96722_REG_ID: u16 = 0x000d;
pub const MAX96722_REG_CSI_OUT: u16 = 0x040b;
pub const MAX96722_REG_FSYNC_MODE: u16 = 0x04a0;
pub const MAX96722_REG_FSYNC_PERIOD_L: u16 = 0x04a5;
pub const MAX96722_REG_FSYNC_PERIOD_M: u16 = 0x04a6;
pub const MAX96722_REG_FSYNC_PERIOD_H: u16 = 0x04a7;
pub const MAX96722_REG_FSYNC_GMSL1: u16 = 0x04af;
pub const MAX96722_REG_MIPI_PHY0: u16 = 0x08a0;
pub const MAX96722_REG_MIPI_PHY3: u16 = 0x08a3;
pub const MAX96722_REG_MIPI_TX_LANES: u16 = 0x094a;

const REG_GMSL1_CC_BASE: u16 = 0x0b04;
const REG_GMSL1_HIM_BASE: u16 = 0x0b06;
const REG_GMSL1_LOCK_BASE: u16 = 0x0bcb;
const GMSL1_REG_STRIDE: u16 = 0x100;

const REG_PIPE_MAP_BASE: u16 = 0x090b;
const PIPE_MAP_STRIDE: u16 = 0x40;

const CSI_OUT_ENABLE: u8 = 0x02;
const CC_FWD_REV: u8 = 0x03;
const HIM_ENABLE: u8 = 0xef;
const LOCKED: u8 = 0x01;
const MIPI_PHY_2X4: u8 = 0x04;
const MIPI_LANE_MAP: u8 = 0xe4;
const DT_YUV422_8BIT: u8 = 0x1e;
const FSYNC_MANUAL: u8 = 0x04;
const FSYNC_OFF: u8 = 0x00;
const FSYNC_GMSL1_ALL: u8 = 0xcf;

/// The period of frame sync in pixel clock.
const FSYNC_PERIOD: u32 = 0x0032_5aa0;

const CONTROL_CHANNEL_SETTLE_US: u64 = 5_000;
const HIM_SETTLE_US: u64 = 1_000;

/// The lock for the window of serializer default address in I2C bus.
#[derive(Default, Debug)]
pub struct SerializerAddressLock(Mutex<()>);

impl SerializerAddressLock {
    pub fn new() -> Self {
        Default::default()
    }

    /// Acquire the window. The guard should be kept till the serializer is moved to the other
    /// address.
    pub fn acquire(&self) -> Result<MutexGuard<'_, ()>, Error> {
        self.0.lock().map_err(poisoned)
    }

    /// Whether the window is acquired by any context.
    pub fn is_held(&self) -> bool {
        match self.0.try_lock() {
            Err(TryLockError::WouldBlock) => true,
            _ => false,
        }
    }
}

/// MAX96722 deserializer.
pub struct Max96722 {
    bus: Arc<dyn I2cBus>,
    params: GmslParams,
    power: GmslPower,
    lock: Arc<SerializerAddressLock>,
}

impl Max96722 {
    pub fn new(
        bus: Arc<dyn I2cBus>,
        params: GmslParams,
        power: GmslPower,
        lock: Arc<SerializerAddressLock>,
    ) -> Self {
        Self {
            bus,
            params,
            power,
            lock,
        }
    }

    fn write_seq(
        &self,
        seq: &[(u16, u8, u64)],
        policy: StepPolicy,
        report: &mut BringUpReport,
    ) -> Result<(), Error> {
        write_seq16(self.bus(), self.params.des_addr, seq, policy, report)
    }
}

fn gmsl1_reg(base: u16, ch: u32) -> u16 {
    base + GMSL1_REG_STRIDE * ch as u16
}

/// Map frame start, frame end, and YUV422 packets of the pipe to the virtual channel of the
/// same index.
fn vc_map_seq(ch: u32) -> Vec<(u16, u8, u64)> {
    let base = REG_PIPE_MAP_BASE + PIPE_MAP_STRIDE * ch as u16;
    let vc = (ch as u8) << 6;
    vec![
        (base, 0x07, 0),
        (base + 0x02, DT_YUV422_8BIT, 0),
        (base + 0x03, vc | DT_YUV422_8BIT, 0),
        (base + 0x04, 0x00, 0),
        (base + 0x05, vc, 0),
        (base + 0x06, 0x01, 0),
        (base + 0x07, vc | 0x01, 0),
        (base + 0x2a, 0x15, 0),
    ]
}

impl GmslDeserializer for Max96722 {
    const NAME: &'static str = "max96722";
    const MAX_LINKS: u32 = 4;

    fn bus(&self) -> &dyn I2cBus {
        &*self.bus
    }

    fn params(&self) -> &GmslParams {
        &self.params
    }

    fn power(&self) -> &GmslPower {
        &self.power
    }

    fn check_chip_id(&self) -> Result<(), Error> {
        check_chip_id(self.bus(), Self::NAME, &[MAX96722_ID], || {
            read_reg16(self.bus(), self.params.des_addr, MAX96722_REG_ID)
        })
        .map(|_| ())
    }

    fn enable_him(&self, report: &mut BringUpReport) -> Result<(), Error> {
        let mut seq = vec![(MAX96722_REG_CSI_OUT, 0, 0), (MAX96722_REG_LINK_EN, 0, 0)];
        (0..self.params.link_count)
            .for_each(|ch| seq.push((gmsl1_reg(REG_GMSL1_HIM_BASE, ch), HIM_ENABLE, 0)));
        self.write_seq(&seq, StepPolicy::Continue, report)?;
        self.bus.delay_us(HIM_SETTLE_US);
        Ok(())
    }

    fn train_link(&self, ch: u32, report: &mut BringUpReport) -> Result<bool, Error> {
        let _guard = self.lock.acquire()?;

        let seq = [
            (MAX96722_REG_LINK_EN, 1 << ch, 0),
            (
                gmsl1_reg(REG_GMSL1_CC_BASE, ch),
                CC_FWD_REV,
                CONTROL_CHANNEL_SETTLE_US,
            ),
        ];
        self.write_seq(&seq, StepPolicy::Continue, report)?;

        Max96705Protocol::train(self.bus(), &self.params, ch, report)
    }

    fn enable_all_links(&self, locked: u8, report: &mut BringUpReport) -> Result<(), Error> {
        let res = write_reg16(self.bus(), self.params.des_addr, MAX96722_REG_LINK_EN, locked);
        report.step(StepPolicy::Abort, res)?;

        let seq: Vec<_> = (0..self.params.link_count)
            .filter(|ch| locked & (1 << ch) > 0)
            .map(|ch| (gmsl1_reg(REG_GMSL1_CC_BASE, ch), CC_FWD_REV, 0))
            .collect();
        self.write_seq(&seq, StepPolicy::Continue, report)?;

        (0..self.params.link_count)
            .filter(|ch| locked & (1 << ch) > 0)
            .try_for_each(|ch| {
                let res =
                    Max96705Protocol::set_serial_link(self.bus(), self.params.ser_addr(ch), true);
                report.step(StepPolicy::Continue, res)
            })
    }

    fn configure_output(&self, locked: u8, report: &mut BringUpReport) -> Result<(), Error> {
        let lanes = ((self.params.lanes - 1) as u8) << 6;
        let seq = [
            (MAX96722_REG_MIPI_PHY0, MIPI_PHY_2X4, 0),
            (MAX96722_REG_MIPI_PHY3, MIPI_LANE_MAP, 0),
            (MAX96722_REG_MIPI_TX_LANES, lanes, 0),
        ];
        self.write_seq(&seq, StepPolicy::Continue, report)?;

        (0..self.params.link_count)
            .filter(|ch| locked & (1 << ch) > 0)
            .try_for_each(|ch| self.write_seq(&vc_map_seq(ch), StepPolicy::Continue, report))
    }

    fn enable_framesync(&self, report: &mut BringUpReport) -> Result<(), Error> {
        if self.params.frame_sync {
            let [l, m, h, _] = FSYNC_PERIOD.to_le_bytes();
            let seq = [
                (MAX96722_REG_FSYNC_PERIOD_L, l, 0),
                (MAX96722_REG_FSYNC_PERIOD_M, m, 0),
                (MAX96722_REG_FSYNC_PERIOD_H, h, 0),
                (MAX96722_REG_FSYNC_GMSL1, FSYNC_GMSL1_ALL, 0),
                (MAX96722_REG_FSYNC_MODE, FSYNC_MANUAL, 0),
            ];
            self.write_seq(&seq, StepPolicy::Continue, report)
        } else {
            let seq = [(MAX96722_REG_FSYNC_MODE, FSYNC_OFF, 0)];
            self.write_seq(&seq, StepPolicy::Continue, report)
        }
    }

    fn set_output(&self, enable: bool) -> Result<(), Error> {
        let val = if enable { CSI_OUT_ENABLE } else { 0 };
        write_reg16(self.bus(), self.params.des_addr, MAX96722_REG_CSI_OUT, val)
    }

    fn link_status(&self) -> Result<u8, Error> {
        (0..self.params.link_count).try_fold(0, |mask, ch| {
            let reg = gmsl1_reg(REG_GMSL1_LOCK_BASE, ch);
            read_reg16(self.bus(), self.params.des_addr, reg).map(|val| {
                if val & LOCKED > 0 {
                    mask | (1 << ch)
                } else {
                    mask
                }
            })
        })
    }
}
