// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Interrupt notified by UIO device.
//!
//! Reading the device returns the total number of interrupts. Writing 1 enables the interrupt
//! again.

use {
    super::*,
    mmio::io_to_error,
    std::{
        fs::{File, OpenOptions},
        io::{Read, Write},
        os::unix::io::{AsRawFd, RawFd},
        path::Path,
    },
};

#[derive(Debug)]
pub struct UioIrq {
    file: File,
    label: String,
}

impl UioIrq {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let label = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| io_to_error(e, &label))?;
        Ok(Self { file, label })
    }

    pub fn enable(&self) -> Result<(), Error> {
        (&self.file)
            .write_all(&1u32.to_ne_bytes())
            .map_err(|e| io_to_error(e, &self.label))
    }

    /// Read the total number of interrupts.
    pub fn read_count(&self) -> Result<u32, Error> {
        let mut buf = [0; 4];
        (&self.file)
            .read_exact(&mut buf)
            .map_err(|e| io_to_error(e, &self.label))?;
        Ok(u32::from_ne_bytes(buf))
    }
}

impl AsRawFd for UioIrq {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
