// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Register blocks mapped from physical memory.

use {
    super::*,
    board::RegRegion,
    nix::{
        errno::Errno,
        sys::mman::{mmap, munmap, MapFlags, ProtFlags},
        unistd::{sysconf, SysconfVar},
    },
    sdrv_csi_protocols::{mipi_csi2::SharedRegion, RegisterIo},
    std::{
        ffi::c_void,
        fs::OpenOptions,
        num::NonZeroUsize,
        os::unix::fs::OpenOptionsExt,
        path::Path,
        ptr::NonNull,
    },
};

const DEV_MEM: &str = "/dev/mem";

pub fn errno_to_error(e: Errno, label: &str) -> Error {
    let kind = match e {
        Errno::EACCES | Errno::EPERM => FileError::Acces,
        Errno::ENOENT => FileError::Noent,
        Errno::ENXIO => FileError::Nxio,
        Errno::ENODEV => FileError::Nodev,
        Errno::EINVAL => FileError::Inval,
        Errno::ENOMEM => FileError::Nomem,
        Errno::EAGAIN => FileError::Again,
        _ => FileError::Io,
    };
    let msg = format!("{}: {}", label, e.desc());
    Error::new(kind, &msg)
}

pub fn io_to_error(e: std::io::Error, label: &str) -> Error {
    let errno = e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO);
    errno_to_error(errno, label)
}

fn page_size() -> usize {
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|size| size as usize)
        .unwrap_or(4096)
}

/// The block of registers mapped by `/dev/mem`. Unmapped when dropped.
#[derive(Debug)]
pub struct MmioRegion {
    map: NonNull<c_void>,
    map_len: usize,
    // The offset of region from the start of mapping aligned to page.
    offset: usize,
    len: usize,
}

// The mapping is accessed by volatile operation of 32 bit aligned word.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl Drop for MmioRegion {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.map, self.map_len) } {
            warn!("Fail to unmap region: {}", e);
        }
    }
}

impl MmioRegion {
    pub fn open(region: &RegRegion) -> Result<Self, Error> {
        Self::open_path(Path::new(DEV_MEM), region)
    }

    fn open_path(path: &Path, region: &RegRegion) -> Result<Self, Error> {
        let label = format!("{} at {:#x}", path.display(), region.base);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|e| io_to_error(e, &label))?;

        let page = page_size() as u64;
        let aligned = region.base & !(page - 1);
        let offset = (region.base - aligned) as usize;
        let map_len = NonZeroUsize::new(offset + region.size)
            .ok_or_else(|| Error::new(FileError::Inval, "Size of region is zero"))?;

        let map = unsafe {
            mmap(
                None,
                map_len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                aligned as libc::off_t,
            )
        }
        .map_err(|e| errno_to_error(e, &label))?;

        debug!(base = region.base, size = region.size, "mapped");

        Ok(Self {
            map,
            map_len: map_len.get(),
            offset,
            len: region.size,
        })
    }

    fn word(&self, offset: u32) -> Option<*mut u32> {
        let offset = offset as usize;
        if offset % 4 > 0 || offset + 4 > self.len {
            error!("Offset {:#x} is out of region", offset);
            None
        } else {
            let ptr = unsafe { (self.map.as_ptr() as *mut u8).add(self.offset + offset) };
            Some(ptr as *mut u32)
        }
    }
}

impl RegisterIo for MmioRegion {
    fn readl(&self, offset: u32) -> u32 {
        self.word(offset)
            .map(|ptr| unsafe { std::ptr::read_volatile(ptr) })
            .unwrap_or(0)
    }

    fn writel(&self, offset: u32, val: u32) {
        if let Some(ptr) = self.word(offset) {
            unsafe { std::ptr::write_volatile(ptr, val) }
        }
    }
}

/// The block of display mux shared with display controller. Mapped just for access.
#[derive(Debug)]
pub struct DispmuxRegion(pub RegRegion);

impl SharedRegion for DispmuxRegion {
    type Mapping = MmioRegion;

    fn map(&self) -> Result<Self::Mapping, Error> {
        MmioRegion::open(&self.0)
    }
}
