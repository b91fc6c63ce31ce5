// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol for power over coax by Maxim MAX20086 and MAX20087.
//!
//! The chip is in the other I2C bus than the one for deserializer.

use super::*;

pub const MAX2008X_REG_MASK: u8 = 0x00;
pub const MAX2008X_REG_CONFIG: u8 = 0x01;
pub const MAX2008X_REG_ID: u8 = 0x02;
pub const MAX2008X_REG_STAT1: u8 = 0x03;

const CONFIG_OUT_MASK: u8 = 0x0f;

/// The variant of chip.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PocVariant {
    /// Two outputs.
    Max20086,
    /// Four outputs.
    Max20087,
}

impl PocVariant {
    pub fn outputs(&self) -> u32 {
        match self {
            Self::Max20086 => 2,
            Self::Max20087 => 4,
        }
    }
}

/// The power controller for camera modules.
pub struct Max2008x {
    bus: Arc<dyn I2cBus>,
    addr: u16,
    variant: PocVariant,
}

impl Max2008x {
    pub fn new(bus: Arc<dyn I2cBus>, addr: u16, variant: PocVariant) -> Self {
        Self { bus, addr, variant }
    }

    pub fn read_id(&self) -> Result<u8, Error> {
        read_reg8(&*self.bus, self.addr, MAX2008X_REG_ID)
    }

    /// Read the status of outputs.
    pub fn read_status(&self) -> Result<u8, Error> {
        read_reg8(&*self.bus, self.addr, MAX2008X_REG_STAT1)
    }

    /// Enable outputs for the number of links.
    pub fn enable_outputs(&self, link_count: u32) -> Result<(), Error> {
        let count = link_count.min(self.variant.outputs());
        let mask = ((1u32 << count) - 1) as u8;
        self.update_outputs(mask)
    }

    pub fn disable_outputs(&self) -> Result<(), Error> {
        self.update_outputs(0)
    }

    fn update_outputs(&self, mask: u8) -> Result<(), Error> {
        let config = read_reg8(&*self.bus, self.addr, MAX2008X_REG_CONFIG)?;
        let val = (config & !CONFIG_OUT_MASK) | mask;
        write_reg8(&*self.bus, self.addr, MAX2008X_REG_CONFIG, val)?;
        debug!(addr = self.addr, variant = ?self.variant, outputs = mask);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use {super::super::test_utils::*, super::*};

    #[test]
    fn power_sequence() {
        let bus = Arc::new(ScriptedBus::default());
        let poc_bus = Arc::new(ScriptedBus::default());
        poc_bus.preset(0x28, MAX2008X_REG_CONFIG as u16, 0x10);
        let gpio = Arc::new(FakeGpio::default());

        let power = GmslPower {
            pwdn: Some(gpio.clone()),
            poc: Some(Max2008x::new(poc_bus.clone(), 0x28, PocVariant::Max20087)),
        };
        power.power_on(&*bus, 3).unwrap();
        assert_eq!(*gpio.values.lock().unwrap(), vec![true]);
        assert_eq!(poc_bus.value(0x28, MAX2008X_REG_CONFIG as u16), Some(0x17));
        assert_eq!(bus.delayed_us(), PWDN_SETTLE_US + POC_SETTLE_US);

        power.power_off().unwrap();
        assert_eq!(*gpio.values.lock().unwrap(), vec![true, false]);
        assert_eq!(poc_bus.value(0x28, MAX2008X_REG_CONFIG as u16), Some(0x10));
    }

    #[test]
    fn outputs_of_variant() {
        let bus = Arc::new(ScriptedBus::default());
        let poc = Max2008x::new(bus.clone(), 0x29, PocVariant::Max20086);
        poc.enable_outputs(4).unwrap();
        assert_eq!(bus.value(0x29, MAX2008X_REG_CONFIG as u16), Some(0x03));
    }
}
