// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol for Maxim MAX96706 single GMSL deserializer.

use {super::max96705::*, super::*};

pub const MAX96706_ID: u8 = 0x4a;

pub const MAX96706_REG_CTRL: u8 = 0x04;
pub const MAX96706_REG_HIM: u8 = 0x06;
pub const MAX96706_REG_CONFIG: u8 = 0x07;
pub const MAX96706_REG_ID: u8 = 0x1e;

const CTRL_LOCKED: u8 = 0x80;
const CTRL_OUTPUT_DISABLE: u8 = 0x40;
const CTRL_BASE: u8 = 0x87;
const HIM_ENABLE: u8 = 0xac;
const CONFIG_DBL_HVEN: u8 = 0x84;

const HIM_SETTLE_US: u64 = 5_000;

/// MAX96706 deserializer.
pub struct Max96706 {
    bus: Arc<dyn I2cBus>,
    params: GmslParams,
    power: GmslPower,
}

impl Max96706 {
    pub fn new(bus: Arc<dyn I2cBus>, params: GmslParams, power: GmslPower) -> Self {
        Self { bus, params, power }
    }
}

impl GmslDeserializer for Max96706 {
    const NAME: &'static str = "max96706";
    const MAX_LINKS: u32 = 1;

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
        check_chip_id(self.bus(), Self::NAME, &[MAX96706_ID], || {
            read_reg8(self.bus(), self.params.des_addr, MAX96706_REG_ID)
        })
        .map(|_| ())
    }

    fn enable_him(&self, report: &mut BringUpReport) -> Result<(), Error> {
        let seq = [
            (MAX96706_REG_CTRL, CTRL_BASE | CTRL_OUTPUT_DISABLE, 0),
            (MAX96706_REG_HIM, HIM_ENABLE, HIM_SETTLE_US),
        ];
        write_seq8(
            self.bus(),
            self.params.des_addr,
            &seq,
            StepPolicy::Continue,
            report,
        )
    }

    fn train_link(&self, ch: u32, report: &mut BringUpReport) -> Result<bool, Error> {
        Max96705Protocol::train(self.bus(), &self.params, ch, report)
    }

    fn enable_all_links(&self, locked: u8, report: &mut BringUpReport) -> Result<(), Error> {
        if locked & 0x01 > 0 {
            let res = Max96705Protocol::set_serial_link(self.bus(), self.params.ser_addr(0), true);
            report.step(StepPolicy::Abort, res)
        } else {
            Ok(())
        }
    }

    fn configure_output(&self, _: u8, report: &mut BringUpReport) -> Result<(), Error> {
        let seq = [(MAX96706_REG_CONFIG, CONFIG_DBL_HVEN, 0)];
        write_seq8(
            self.bus(),
            self.params.des_addr,
            &seq,
            StepPolicy::Continue,
            report,
        )
    }

    fn enable_framesync(&self, _: &mut BringUpReport) -> Result<(), Error> {
        if self.params.frame_sync {
            debug!(chip = Self::NAME, "Frame sync is driven by camera module");
        }
        Ok(())
    }

    fn set_output(&self, enable: bool) -> Result<(), Error> {
        let mut val = CTRL_BASE;
        if !enable {
            val |= CTRL_OUTPUT_DISABLE;
        }
        write_reg8(self.bus(), self.params.des_addr, MAX96706_REG_CTRL, val)
    }

    fn link_status(&self) -> Result<u8, Error> {
        read_reg8(self.bus(), self.params.des_addr, MAX96706_REG_CTRL)
            .map(|val| if val & CTRL_LOCKED > 0 { 0x01 } else { 0x00 })
    }
}
