// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Allocator of capture buffers in the window of physical memory reserved for the CSI host.

use {
    super::*,
    sdrv_csi_protocols::video::DmaAllocator,
    std::sync::{Arc, Mutex},
};

/// The first-fit allocator in the window. The clone shares the window.
#[derive(Debug, Clone)]
pub struct DmaWindow {
    base: u64,
    size: u64,
    align: u64,
    // Free ranges sorted by address, never adjacent to each other.
    free: Arc<Mutex<Vec<(u64, u64)>>>,
}

impl DmaWindow {
    pub fn new(base: u64, size: u64, align: u64) -> Result<Self, Error> {
        if align == 0 || !align.is_power_of_two() {
            let msg = format!("Invalid alignment: {}", align);
            Err(Error::new(FileError::Inval, &msg))?;
        }
        if size == 0 || base % align > 0 {
            let msg = format!("Invalid window: {:#x} of {} bytes", base, size);
            Err(Error::new(FileError::Inval, &msg))?;
        }

        Ok(Self {
            base,
            size,
            align,
            free: Arc::new(Mutex::new(vec![(base, size)])),
        })
    }

    fn round_up(&self, size: usize) -> u64 {
        (size as u64 + self.align - 1) & !(self.align - 1)
    }

    /// The number of bytes available in total.
    pub fn available(&self) -> u64 {
        self.free
            .lock()
            .map(|free| free.iter().map(|(_, len)| len).sum())
            .unwrap_or(0)
    }
}

impl DmaAllocator for DmaWindow {
    fn alloc(&self, size: usize) -> Result<u64, Error> {
        if size == 0 {
            Err(Error::new(FileError::Inval, "Zero-length allocation"))?;
        }
        let len = self.round_up(size);
        let mut free = self.free.lock().map_err(|e| {
            let msg = format!("{}", e);
            Error::new(FileError::Io, &msg)
        })?;

        let pos = free
            .iter()
            .position(|&(_, avail)| avail >= len)
            .ok_or_else(|| {
                let msg = format!("No room for {} bytes in window {:#x}", size, self.base);
                Error::new(FileError::Nomem, &msg)
            })?;

        let (addr, avail) = free[pos];
        if avail == len {
            free.remove(pos);
        } else {
            free[pos] = (addr + len, avail - len);
        }
        debug!(addr, len);

        Ok(addr)
    }

    fn free(&self, addr: u64, size: usize) {
        let len = self.round_up(size);
        if addr < self.base || addr + len > self.base + self.size {
            warn!(addr, len, "Release out of window");
            return;
        }

        if let Ok(mut free) = self.free.lock() {
            let pos = free
                .iter()
                .position(|&(start, _)| start > addr)
                .unwrap_or(free.len());
            free.insert(pos, (addr, len));

            // Merge with the next range, then the previous one.
            if pos + 1 < free.len() && free[pos].0 + free[pos].1 == free[pos + 1].0 {
                free[pos].1 += free[pos + 1].1;
                free.remove(pos + 1);
            }
            if pos > 0 && free[pos - 1].0 + free[pos - 1].1 == free[pos].0 {
                free[pos - 1].1 += free[pos].1;
                free.remove(pos);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, sdrv_csi_protocols::video::HcropAllocator};

    #[test]
    fn first_fit_and_merge() {
        let window = DmaWindow::new(0x8000_0000, 0x10000, 0x1000).unwrap();

        let a = window.alloc(100).unwrap();
        let b = window.alloc(0x1800).unwrap();
        let c = window.alloc(0x1000).unwrap();
        assert_eq!(a, 0x8000_0000);
        assert_eq!(b, 0x8000_1000);
        assert_eq!(c, 0x8000_3000);
        assert_eq!(window.available(), 0xc000);

        window.free(b, 0x1800);
        // The hole is reused.
        assert_eq!(window.alloc(0x800).unwrap(), 0x8000_1000);

        window.free(0x8000_1000, 0x800);
        window.free(a, 100);
        window.free(c, 0x1000);
        assert_eq!(window.available(), 0x10000);
        assert_eq!(*window.free.lock().unwrap(), vec![(0x8000_0000, 0x10000)]);
    }

    #[test]
    fn exhaustion() {
        let window = DmaWindow::new(0x1000, 0x2000, 0x1000).unwrap();
        let shared = window.clone();
        shared.alloc(0x2000).unwrap();
        let err = window.alloc(1).unwrap_err();
        assert_eq!(err.kind::<FileError>(), Some(FileError::Nomem));

        assert!(DmaWindow::new(0x1800, 0x2000, 0x1000).is_err());
        assert!(DmaWindow::new(0x1000, 0x2000, 3).is_err());
    }

    #[test]
    fn zero_length_allocation() {
        let window = DmaWindow::new(0x1000, 0x2000, 0x1000).unwrap();
        let err = window.alloc(0).unwrap_err();
        assert_eq!(err.kind::<FileError>(), Some(FileError::Inval));
        assert_eq!(window.available(), 0x2000);

        // The same address is never handed out twice.
        let a = window.alloc(1).unwrap();
        let b = window.alloc(1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn padding_for_hcrop() {
        let window = DmaWindow::new(0x1000, 0x10000, 0x100).unwrap();
        let alloc = HcropAllocator::new(window.clone(), 0x20, 0x40);
        let addr = alloc.alloc(0x1000).unwrap();
        assert_eq!(addr, 0x1020);
        assert_eq!(window.alloc(1).unwrap(), 0x1000 + 0x1100);

        alloc.free(addr, 0x1000);
        assert_eq!(window.available(), 0x10000 - 0x100);
    }
}
