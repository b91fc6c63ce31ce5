// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol for onsemi AP0101 image signal processor in camera module.
//!
//! The registers are addressed by 16 bit and have 16 bit value in big endian.

use super::*;

/// The address of chip before translation by serializer.
pub const AP0101_DEFAULT_ADDR: u16 = 0x5d;

pub const AP0101_REG_CHIP_VERSION: u16 = 0x0000;
pub const AP0101_CHIP_VERSION: u16 = 0x0160;

const REG_HOST_COMMAND: u16 = 0x0040;
const REG_CMD_HANDLER_PARAMS: u16 = 0xfc00;
const REG_READ_MODE: u16 = 0xc846;

const READ_MODE_MIRROR: u16 = 0x0001;
const READ_MODE_FLIP: u16 = 0x0002;

const CMD_SET_STATE: u16 = 0x8100;
const STATE_CHANGE_CONFIG: u16 = 0x2800;

const COMMAND_SETTLE_US: u64 = 10_000;

/// Operation of AP0101.
pub trait Ap0101Operation {
    fn read_chip_version(bus: &dyn I2cBus, addr: u16) -> Result<u16, Error> {
        read_reg16_16(bus, addr, AP0101_REG_CHIP_VERSION)
    }

    /// Program mirror and flip of sensor read mode, then request change of configuration.
    fn set_rotation(bus: &dyn I2cBus, addr: u16, rotation: Rotation) -> Result<(), Error> {
        let mask = READ_MODE_MIRROR | READ_MODE_FLIP;
        let curr = read_reg16_16(bus, addr, REG_READ_MODE)?;
        let val = match rotation {
            Rotation::Normal => curr & !mask,
            Rotation::UpsideDown => curr | mask,
        };
        write_reg16_16(bus, addr, REG_READ_MODE, val)?;
        write_reg16_16(bus, addr, REG_CMD_HANDLER_PARAMS, STATE_CHANGE_CONFIG)?;
        write_reg16_16(bus, addr, REG_HOST_COMMAND, CMD_SET_STATE)?;
        bus.delay_us(COMMAND_SETTLE_US);
        debug!(addr, ?rotation);
        Ok(())
    }
}

/// The protocol implementation for AP0101.
#[derive(Default, Debug)]
pub struct Ap0101Protocol;

impl Ap0101Operation for Ap0101Protocol {}
