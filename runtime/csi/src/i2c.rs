// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! I2C adapters by `/dev/i2c-N` character devices, and GPIO lines by sysfs.

use {
    super::*,
    gmsl_serdes_protocols::{max96722::SerializerAddressLock, GpioLine, I2cBus},
    mmio::{errno_to_error, io_to_error},
    nix::ioctl_write_ptr_bad,
    std::{
        collections::HashMap,
        fs::{File, OpenOptions},
        os::unix::io::AsRawFd,
        sync::Arc,
        time::Duration,
    },
};

const I2C_RDWR: u32 = 0x0707;
const I2C_M_RD: u16 = 0x0001;

#[repr(C)]
struct I2cMsg {
    addr: u16,
    flags: u16,
    len: u16,
    buf: *mut u8,
}

#[repr(C)]
struct I2cRdwrIoctlData {
    msgs: *mut I2cMsg,
    nmsgs: u32,
}

ioctl_write_ptr_bad!(i2c_rdwr, I2C_RDWR, I2cRdwrIoctlData);

/// The I2C adapter.
#[derive(Debug)]
pub struct I2cDev {
    file: File,
    bus: u32,
}

impl I2cDev {
    pub fn open(bus: u32) -> Result<Self, Error> {
        let path = format!("/dev/i2c-{}", bus);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| io_to_error(e, &path))?;
        Ok(Self { file, bus })
    }

    pub fn bus(&self) -> u32 {
        self.bus
    }

    fn transfer(&self, addr: u16, msgs: &mut [I2cMsg]) -> Result<(), Error> {
        let data = I2cRdwrIoctlData {
            msgs: msgs.as_mut_ptr(),
            nmsgs: msgs.len() as u32,
        };
        unsafe { i2c_rdwr(self.file.as_raw_fd(), &data) }
            .map(|_| ())
            .map_err(|e| {
                // Any failure of transaction including NACK.
                let label = format!("i2c-{} at {:#04x}", self.bus, addr);
                let err = errno_to_error(e, &label);
                Error::new(FileError::Io, err.message())
            })
    }
}

impl I2cBus for I2cDev {
    fn write(&self, addr: u16, data: &[u8]) -> Result<(), Error> {
        let mut msgs = [I2cMsg {
            addr,
            flags: 0,
            len: data.len() as u16,
            buf: data.as_ptr() as *mut u8,
        }];
        self.transfer(addr, &mut msgs)
    }

    fn write_read(&self, addr: u16, wr: &[u8], rd: &mut [u8]) -> Result<(), Error> {
        let mut msgs = [
            I2cMsg {
                addr,
                flags: 0,
                len: wr.len() as u16,
                buf: wr.as_ptr() as *mut u8,
            },
            I2cMsg {
                addr,
                flags: I2C_M_RD,
                len: rd.len() as u16,
                buf: rd.as_mut_ptr(),
            },
        ];
        self.transfer(addr, &mut msgs)
    }

    fn delay_us(&self, us: u64) {
        std::thread::sleep(Duration::from_micros(us));
    }
}

/// The adapters opened for deserializers. The lock for serializer default address is shared by
/// deserializers in the same adapter.
#[derive(Default)]
pub struct I2cAdapters {
    adapters: HashMap<u32, (Arc<I2cDev>, Arc<SerializerAddressLock>)>,
}

impl I2cAdapters {
    pub fn get(&mut self, bus: u32) -> Result<(Arc<I2cDev>, Arc<SerializerAddressLock>), Error> {
        if let Some((dev, lock)) = self.adapters.get(&bus) {
            return Ok((dev.clone(), lock.clone()));
        }

        let dev = Arc::new(I2cDev::open(bus)?);
        let lock = Arc::new(SerializerAddressLock::new());
        self.adapters.insert(bus, (dev.clone(), lock.clone()));
        debug!(bus, "opened");
        Ok((dev, lock))
    }
}

/// The GPIO line exported in sysfs.
#[derive(Debug)]
pub struct SysfsGpio {
    line: u32,
}

impl SysfsGpio {
    pub fn new(line: u32) -> Self {
        Self { line }
    }
}

impl GpioLine for SysfsGpio {
    fn set_value(&self, high: bool) -> Result<(), Error> {
        let path = format!("/sys/class/gpio/gpio{}/value", self.line);
        let val = if high { "1" } else { "0" };
        std::fs::write(&path, val).map_err(|e| io_to_error(e, &path))
    }
}
