// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol for Maxim MAX9286 quad GMSL deserializer.

use {super::max96705::*, super::*};

pub const MAX9286_ID: u8 = 0x40;

pub const MAX9286_REG_LINK_EN: u8 = 0x00;
pub const MAX9286_REG_FSYNC: u8 = 0x01;
pub const MAX9286_REG_FSYNC_PERIOD_L: u8 = 0x06;
pub const MAX9286_REG_FSYNC_PERIOD_M: u8 = 0x07;
pub const MAX9286_REG_FSYNC_PERIOD_H: u8 = 0x08;
pub const MAX9286_REG_FWD_REV_CC: u8 = 0x0a;
pub const MAX9286_REG_POLARITY: u8 = 0x0c;
pub const MAX9286_REG_CSI_CONFIG: u8 = 0x12;
pub const MAX9286_REG_CSI_OUT: u8 = 0x15;
pub const MAX9286_REG_HIM: u8 = 0x1c;
pub const MAX9286_REG_ID: u8 = 0x1e;
pub const MAX9286_REG_LINK_DETECT: u8 = 0x49;
pub const MAX9286_REG_MASK: u8 = 0x69;

const LINK_EN_BASE: u8 = 0xe0;
const CSI_OUT_VCTYPE: u8 = 0x80;
const CSI_OUT_ENABLE: u8 = 0x40;
const CSI_OUT_RESV: u8 = 0x03;
const HIM_ENABLE: u8 = 0xf4;
const CSI_CONFIG_DBL: u8 = 0x30;
const CSI_CONFIG_YUV422_8BIT: u8 = 0x03;
const POLARITY_HS_VS: u8 = 0x91;
const MASK_AUTO: u8 = 0x10;
const FSYNC_INTERNAL_AUTO: u8 = 0x02;
const FSYNC_DISABLED: u8 = 0xc0;

/// The period of frame sync in pixel clock.
const FSYNC_PERIOD: u32 = 0x002d_c6c0;

const CONTROL_CHANNEL_SETTLE_US: u64 = 2_000;

/// MAX9286 deserializer.
pub struct Max9286 {
    bus: Arc<dyn I2cBus>,
    params: GmslParams,
    power: GmslPower,
}

impl Max9286 {
    pub fn new(bus: Arc<dyn I2cBus>, params: GmslParams, power: GmslPower) -> Self {
        Self { bus, params, power }
    }

    fn des_addr(&self) -> u16 {
        self.params.des_addr
    }
}

fn control_channels(mask: u8) -> u8 {
    (mask << 4) | mask
}

impl GmslDeserializer for Max9286 {
    const NAME: &'static str = "max9286";
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
        check_chip_id(self.bus(), Self::NAME, &[MAX9286_ID], || {
            read_reg8(self.bus(), self.des_addr(), MAX9286_REG_ID)
        })
        .map(|_| ())
    }

    fn enable_him(&self, report: &mut BringUpReport) -> Result<(), Error> {
        let seq = [
            (MAX9286_REG_CSI_OUT, CSI_OUT_VCTYPE | CSI_OUT_RESV, 0),
            (MAX9286_REG_LINK_EN, LINK_EN_BASE, 0),
            (MAX9286_REG_FWD_REV_CC, 0, 0),
            (MAX9286_REG_HIM, HIM_ENABLE, CONTROL_CHANNEL_SETTLE_US),
        ];
        write_seq8(self.bus(), self.des_addr(), &seq, StepPolicy::Continue, report)
    }

    fn train_link(&self, ch: u32, report: &mut BringUpReport) -> Result<bool, Error> {
        let res = write_reg8(
            self.bus(),
            self.des_addr(),
            MAX9286_REG_FWD_REV_CC,
            control_channels(1 << ch),
        );
        report.step(StepPolicy::Continue, res)?;
        self.bus.delay_us(CONTROL_CHANNEL_SETTLE_US);

        Max96705Protocol::train(self.bus(), &self.params, ch, report)
    }

    fn enable_all_links(&self, locked: u8, report: &mut BringUpReport) -> Result<(), Error> {
        let bus = self.bus();
        let res = write_reg8(
            bus,
            self.des_addr(),
            MAX9286_REG_FWD_REV_CC,
            control_channels(locked),
        );
        report.step(StepPolicy::Continue, res)?;

        let res = write_reg8(bus, self.des_addr(), MAX9286_REG_LINK_EN, LINK_EN_BASE | locked);
        report.step(StepPolicy::Abort, res)?;

        (0..self.params.link_count)
            .filter(|ch| locked & (1 << ch) > 0)
            .try_for_each(|ch| {
                let res = Max96705Protocol::set_serial_link(bus, self.params.ser_addr(ch), true);
                report.step(StepPolicy::Continue, res)
            })
    }

    fn configure_output(&self, locked: u8, report: &mut BringUpReport) -> Result<(), Error> {
        let lanes = ((self.params.lanes - 1) as u8) << 6;
        let seq = [
            (
                MAX9286_REG_CSI_CONFIG,
                lanes | CSI_CONFIG_DBL | CSI_CONFIG_YUV422_8BIT,
                0,
            ),
            (MAX9286_REG_POLARITY, POLARITY_HS_VS, 0),
            (MAX9286_REG_MASK, MASK_AUTO | (!locked & 0x0f), 0),
        ];
        write_seq8(self.bus(), self.des_addr(), &seq, StepPolicy::Continue, report)
    }

    fn enable_framesync(&self, report: &mut BringUpReport) -> Result<(), Error> {
        if self.params.frame_sync {
            let [l, m, h, _] = FSYNC_PERIOD.to_le_bytes();
            let seq = [
                (MAX9286_REG_FSYNC_PERIOD_L, l, 0),
                (MAX9286_REG_FSYNC_PERIOD_M, m, 0),
                (MAX9286_REG_FSYNC_PERIOD_H, h, 0),
                (MAX9286_REG_FSYNC, FSYNC_INTERNAL_AUTO, 0),
            ];
            write_seq8(self.bus(), self.des_addr(), &seq, StepPolicy::Continue, report)
        } else {
            let seq = [(MAX9286_REG_FSYNC, FSYNC_DISABLED, 0)];
            write_seq8(self.bus(), self.des_addr(), &seq, StepPolicy::Continue, report)
        }
    }

    fn set_output(&self, enable: bool) -> Result<(), Error> {
        let mut val = CSI_OUT_VCTYPE | CSI_OUT_RESV;
        if enable {
            val |= CSI_OUT_ENABLE;
        }
        write_reg8(self.bus(), self.des_addr(), MAX9286_REG_CSI_OUT, val)
    }

    fn link_status(&self) -> Result<u8, Error> {
        read_reg8(self.bus(), self.des_addr(), MAX9286_REG_LINK_DETECT).map(|val| val & 0x0f)
    }
}

#[cfg(test)]
mod test {
    use {super::super::test_utils::*, super::*};

    fn scripted_bus() -> Arc<ScriptedBus> {
        let bus = Arc::new(ScriptedBus::default());
        bus.preset(0x48, MAX9286_REG_ID as u16, MAX9286_ID as u16);
        bus.preset(
            MAX96705_DEFAULT_ADDR,
            MAX96705_REG_ID as u16,
            MAX96705_ID as u16,
        );
        bus
    }

    fn params(link_count: u32) -> GmslParams {
        GmslParams {
            link_count,
            ..Default::default()
        }
    }

    fn is_reassign(x: &Xfer, addr: u16) -> bool {
        x.addr == MAX96705_DEFAULT_ADDR
            && x.reg == MAX96705_REG_SERADDR as u16
            && x.val == Some(addr << 1)
    }

    fn is_poll(x: &Xfer) -> bool {
        x.addr == MAX96705_DEFAULT_ADDR && x.val.is_none()
    }

    #[test]
    fn channels_are_trained_in_order() {
        const NACKS: usize = 3;

        let bus = scripted_bus();
        bus.set_nacks(MAX96705_DEFAULT_ADDR, NACKS as u32);

        let dev = Max9286::new(bus.clone(), params(2), Default::default());
        let sd = DeserializerSubdev::probe(dev).unwrap();
        assert_eq!(sd.state(), LinkState::FramesyncEnabled);
        assert_eq!(sd.report().locked, 0b11);
        assert!(sd.report().skipped.is_empty());

        let log = bus.log();
        let first = log.iter().position(|x| is_reassign(x, 0x60)).unwrap();
        let second = log.iter().position(|x| is_reassign(x, 0x61)).unwrap();
        assert!(first < second);

        // Exactly N+1 polls before the reassignment.
        assert_eq!(log[..first].iter().filter(|x| is_poll(x)).count(), NACKS + 1);
        assert_eq!(log[first..second].iter().filter(|x| is_poll(x)).count(), 1);

        // Nothing for the second link before the first reassignment.
        assert!(log[..first].iter().all(|x| x.addr != 0x61 && x.addr != 0x31));
        assert!(!log[..first].iter().any(|x| {
            x.addr == 0x48
                && x.reg == MAX9286_REG_FWD_REV_CC as u16
                && x.val.map(|v| v & 0x22 > 0).unwrap_or(false)
        }));

        // Control channel of the second link is enabled after the first link is configured.
        let enable_second = log
            .iter()
            .position(|x| {
                x.addr == 0x48
                    && x.reg == MAX9286_REG_FWD_REV_CC as u16
                    && x.val == Some(0x22)
            })
            .unwrap();
        assert!(first < enable_second && enable_second < second);

        assert_eq!(bus.value(0x48, MAX9286_REG_LINK_EN as u16), Some(0xe3));
        assert_eq!(bus.value(0x48, MAX9286_REG_FWD_REV_CC as u16), Some(0x33));
        assert_eq!(bus.value(0x48, MAX9286_REG_CSI_CONFIG as u16), Some(0xf3));
        assert_eq!(bus.value(0x48, MAX9286_REG_MASK as u16), Some(0x1c));
        assert_eq!(bus.value(0x48, MAX9286_REG_FSYNC as u16), Some(0x02));
        assert_eq!(bus.value(0x61, MAX96705_REG_MAIN_CTRL as u16), Some(0x83));
    }

    #[test]
    fn silent_link_is_skipped() {
        let bus = scripted_bus();
        bus.set_nacks(MAX96705_DEFAULT_ADDR, SER_POLL_ATTEMPTS);

        let dev = Max9286::new(bus.clone(), params(2), Default::default());
        let sd = DeserializerSubdev::probe(dev).unwrap();
        let report = sd.report();
        assert_eq!(report.locked, 0b10);
        assert_eq!(report.skipped, vec![0]);
        assert_eq!(bus.value(0x48, MAX9286_REG_LINK_EN as u16), Some(0xe2));
        assert_eq!(bus.value(0x48, MAX9286_REG_MASK as u16), Some(0x1d));
        assert!(bus.writes_to(0x60).is_empty());
    }

    #[test]
    fn chip_id_mismatch_aborts_probe() {
        let bus = scripted_bus();
        bus.preset(0x48, MAX9286_REG_ID as u16, 0x4a);

        let dev = Max9286::new(bus.clone(), params(4), Default::default());
        let err = DeserializerSubdev::probe(dev).err().unwrap();
        assert_eq!(err.kind::<FileError>(), Some(FileError::Nxio));
        assert!(bus.log().iter().all(|x| x.addr == 0x48 && x.val.is_none()));
    }

    #[test]
    fn configuration_failure_continues() {
        let bus = scripted_bus();
        let dev = Max9286::new(bus.clone(), params(1), Default::default());
        let sd = DeserializerSubdev::probe(dev).unwrap();
        assert_eq!(sd.report().soft_failures, 0);

        sd.s_power(false).unwrap();
        assert_eq!(sd.state(), LinkState::PoweredOff);

        // The first write to the serializer after reassignment fails.
        bus.set_nacks(0x60, 1);
        sd.s_power(true).unwrap();
        assert_eq!(sd.report().soft_failures, 1);
        assert_eq!(sd.report().locked, 0b1);
        assert_eq!(sd.state(), LinkState::FramesyncEnabled);
    }

    #[test]
    fn stream_toggles_output() {
        let bus = scripted_bus();
        let dev = Max9286::new(bus.clone(), params(4), Default::default());
        let sd = DeserializerSubdev::probe(dev).unwrap();

        sd.s_stream(true).unwrap();
        assert_eq!(sd.state(), LinkState::Streaming);
        assert_eq!(bus.value(0x48, MAX9286_REG_CSI_OUT as u16), Some(0xc3));
        sd.s_stream(true).unwrap();

        sd.s_stream(false).unwrap();
        assert_eq!(sd.state(), LinkState::FramesyncEnabled);
        assert_eq!(bus.value(0x48, MAX9286_REG_CSI_OUT as u16), Some(0x83));

        sd.s_power(false).unwrap();
        let err = sd.s_stream(true).unwrap_err();
        assert_eq!(err.kind::<GmslLinkError>(), Some(GmslLinkError::State));
        assert!(sd.link_status().is_err());
    }

    #[test]
    fn power_off_while_streaming() {
        let bus = scripted_bus();
        let dev = Max9286::new(bus.clone(), params(4), Default::default());
        let sd = DeserializerSubdev::probe(dev).unwrap();
        sd.s_stream(true).unwrap();

        // The failure to stop output does not block power off.
        bus.set_nacks(0x48, u32::MAX);
        sd.s_power(false).unwrap();
        assert_eq!(sd.state(), LinkState::PoweredOff);
        assert_eq!(bus.value(0x48, MAX9286_REG_CSI_OUT as u16), Some(0xc3));
        assert!(bus.log().iter().any(|x| x.addr == 0x48 && !x.acked));
    }

    #[test]
    fn pad_operations() {
        let bus = scripted_bus();
        bus.preset(0x48, MAX9286_REG_LINK_DETECT as u16, 0xf5);
        let dev = Max9286::new(bus, params(2), Default::default());
        let sd = DeserializerSubdev::probe(dev).unwrap();

        assert_eq!(sd.name(), "max9286 48");
        assert_eq!(sd.link_status().unwrap(), 0x05);

        let mut fmt = MbusFrameFormat {
            width: 1920,
            height: 1080,
            code: MbusCode::Rgb888_1x24,
            field: Field::None,
        };
        sd.set_fmt(1, &mut fmt).unwrap();
        assert_eq!(fmt.code, MbusCode::Uyvy8_2x8);
        assert_eq!(sd.get_fmt(1).unwrap(), fmt);
        assert_eq!(sd.get_fmt(0).unwrap(), MbusFrameFormat::default());
        assert!(sd.get_fmt(2).is_err());

        assert_eq!(sd.enum_mbus_code(0, 0).unwrap(), MbusCode::Uyvy8_2x8);
        assert!(sd.enum_mbus_code(0, 1).is_err());
        let size = sd.enum_frame_size(1, 0, MbusCode::Uyvy8_2x8).unwrap();
        assert_eq!((size.max_width, size.max_height), (1920, 1080));

        let mut interval = FrameInterval {
            numerator: 1,
            denominator: 25,
        };
        sd.s_frame_interval(&mut interval).unwrap();
        assert_eq!(
            sd.enum_frame_interval(0, 0, MbusCode::Uyvy8_2x8, 1280, 720)
                .unwrap(),
            interval
        );
    }
}
