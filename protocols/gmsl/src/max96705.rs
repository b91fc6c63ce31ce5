// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol for Maxim MAX96705 GMSL serializer in camera module.
//!
//! Any serializer answers at the default address after power-on. The deserializer enables
//! control channel of one link at a time, thus the serializer at the default address is the one
//! in the link. The serializer is moved to the address for the link, then the next link is
//! enabled.

use {super::ap0101::*, super::*};

/// The address of serializer after power-on.
pub const MAX96705_DEFAULT_ADDR: u16 = 0x40;
pub const MAX96705_ID: u8 = 0x41;

pub const MAX96705_REG_SERADDR: u8 = 0x00;
pub const MAX96705_REG_DESADDR: u8 = 0x01;
pub const MAX96705_REG_MAIN_CTRL: u8 = 0x04;
pub const MAX96705_REG_CONFIG: u8 = 0x07;
pub const MAX96705_REG_I2C_SRC_A: u8 = 0x09;
pub const MAX96705_REG_I2C_DST_A: u8 = 0x0a;
pub const MAX96705_REG_ID: u8 = 0x1e;
pub const MAX96705_REG_VS_DLY_2: u8 = 0x43;
pub const MAX96705_REG_VS_DLY_1: u8 = 0x44;
pub const MAX96705_REG_VS_H_2: u8 = 0x45;
pub const MAX96705_REG_VS_H_1: u8 = 0x46;
pub const MAX96705_REG_VS_H_0: u8 = 0x47;

const MAIN_CTRL_CONFIG_LINK: u8 = 0x43;
const MAIN_CTRL_SERIAL_LINK: u8 = 0x83;

/// Double input and high-bandwidth mode with HS/VS encoding.
const CONFIG_DBL_HVEN: u8 = 0x84;

/// The number of polls for serializer at default address.
pub const SER_POLL_ATTEMPTS: u32 = 20;
/// The interval between polls for serializer.
pub const SER_POLL_INTERVAL_US: u64 = 10_000;

const REASSIGN_SETTLE_US: u64 = 2_000;
const SERIAL_LINK_SETTLE_US: u64 = 5_000;

/// Operation of MAX96705.
pub trait Max96705Operation {
    /// Poll the serializer at the default address till it answers with the identifier. Return
    /// the number of polls.
    fn poll_default(bus: &dyn I2cBus) -> Option<u32> {
        poll(bus, SER_POLL_ATTEMPTS, SER_POLL_INTERVAL_US, || {
            read_reg8(bus, MAX96705_DEFAULT_ADDR, MAX96705_REG_ID)
                .map(|id| id == MAX96705_ID)
                .unwrap_or(false)
        })
    }

    /// Move the serializer at the default address to the address.
    fn reassign(bus: &dyn I2cBus, addr: u16) -> Result<(), Error> {
        write_reg8(
            bus,
            MAX96705_DEFAULT_ADDR,
            MAX96705_REG_SERADDR,
            (addr << 1) as u8,
        )?;
        bus.delay_us(REASSIGN_SETTLE_US);
        Ok(())
    }

    /// Program video parameters and delay of vertical sync.
    fn configure_video(
        bus: &dyn I2cBus,
        addr: u16,
        des_addr: u16,
        report: &mut BringUpReport,
    ) -> Result<(), Error> {
        let seq = [
            (MAX96705_REG_DESADDR, (des_addr << 1) as u8, 0),
            (MAX96705_REG_MAIN_CTRL, MAIN_CTRL_CONFIG_LINK, 0),
            (MAX96705_REG_CONFIG, CONFIG_DBL_HVEN, 0),
            (MAX96705_REG_VS_DLY_2, 0x25, 0),
            (MAX96705_REG_VS_DLY_1, 0x00, 0),
            (MAX96705_REG_VS_H_2, 0x01, 0),
            (MAX96705_REG_VS_H_1, 0x00, 0),
            (MAX96705_REG_VS_H_0, 0x26, 0),
        ];
        write_seq8(bus, addr, &seq, StepPolicy::Continue, report)
    }

    /// Translate the address in the remote bus of camera module.
    fn translate(bus: &dyn I2cBus, addr: u16, src: u16, dst: u16) -> Result<(), Error> {
        write_reg8(bus, addr, MAX96705_REG_I2C_SRC_A, (src << 1) as u8)?;
        write_reg8(bus, addr, MAX96705_REG_I2C_DST_A, (dst << 1) as u8)
    }

    /// Enable video in serial link, or fall back to configuration link.
    fn set_serial_link(bus: &dyn I2cBus, addr: u16, enable: bool) -> Result<(), Error> {
        let val = if enable {
            MAIN_CTRL_SERIAL_LINK
        } else {
            MAIN_CTRL_CONFIG_LINK
        };
        write_reg8(bus, addr, MAX96705_REG_MAIN_CTRL, val)?;
        bus.delay_us(SERIAL_LINK_SETTLE_US);
        Ok(())
    }

    /// Train the link of which control channel is enabled. The serializer is moved to the
    /// address for the link only after it answers at the default address. Return false when it
    /// never answers.
    fn train(
        bus: &dyn I2cBus,
        params: &GmslParams,
        ch: u32,
        report: &mut BringUpReport,
    ) -> Result<bool, Error> {
        let polls = match Self::poll_default(bus) {
            Some(polls) => polls,
            None => {
                warn!(ch, "Serializer does not answer");
                return Ok(false);
            }
        };

        let ser_addr = params.ser_addr(ch);
        if let Err(e) = Self::reassign(bus, ser_addr) {
            warn!(ch, "Fail to reassign address of serializer: {}", e);
            return Ok(false);
        }
        debug!(ch, polls, ser_addr);

        Self::configure_video(bus, ser_addr, params.des_addr, report)?;

        let isp_addr = params.isp_addr(ch);
        report.step(
            StepPolicy::Continue,
            Self::translate(bus, ser_addr, isp_addr, AP0101_DEFAULT_ADDR),
        )?;

        if params.rotation != Rotation::Normal {
            report.step(
                StepPolicy::Continue,
                Ap0101Protocol::set_rotation(bus, isp_addr, params.rotation),
            )?;
        }

        Ok(true)
    }
}

/// The protocol implementation for MAX96705.
#[derive(Default, Debug)]
pub struct Max96705Protocol;

impl Max96705Operation for Max96705Protocol {}
