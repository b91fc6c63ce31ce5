// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! CSI host with image pipes and its interrupt handler.

use {
    super::{kstream::*, pixfmt::*, regs::*, *},
    std::sync::Mutex,
    tracing::debug,
};

/// The counters of interrupts for errors, per image pipe.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CsiIntStats {
    pub bus_err: [u32; IMG_COUNT as usize],
    pub pixel_err: [u32; IMG_COUNT as usize],
    pub crop_err: [u32; IMG_COUNT as usize],
    pub overflow: [u32; IMG_COUNT as usize],
    pub bt_sync_err: [u32; IMG_COUNT as usize],
    pub bt_fatal: [u32; IMG_COUNT as usize],
}

impl CsiIntStats {
    fn count(&mut self, stat1: u32) {
        (0..IMG_COUNT).for_each(|id| {
            let i = id as usize;
            [
                (int_bus_err(id), &mut self.bus_err[i]),
                (int_pixel_err(id), &mut self.pixel_err[i]),
                (int_crop_err(id), &mut self.crop_err[i]),
                (int_overflow(id), &mut self.overflow[i]),
                (int_bt_sync_err(id), &mut self.bt_sync_err[i]),
                (int_bt_fatal(id), &mut self.bt_fatal[i]),
            ]
            .iter_mut()
            .filter(|(bit, _)| stat1 & *bit > 0)
            .for_each(|(_, counter)| **counter = counter.wrapping_add(1));
        });
    }
}

/// The CSI host.
pub struct CsiCore {
    host_id: u32,
    bus: BusType,
    sync: bool,
    io: Arc<dyn RegisterIo>,
    kstreams: Mutex<Vec<Arc<KstreamDevice>>>,
    stats: Mutex<CsiIntStats>,
    // Accumulation of status bits over image pipes in synchronized mode.
    img_sync: Mutex<u32>,
}

impl std::fmt::Debug for CsiCore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CsiCore")
            .field("host_id", &self.host_id)
            .field("bus", &self.bus)
            .field("sync", &self.sync)
            .finish()
    }
}

impl CsiCore {
    pub fn new(
        host_id: u32,
        bus: BusType,
        sync: bool,
        io: Arc<dyn RegisterIo>,
    ) -> Result<Self, Error> {
        validate_pix_fmts().map_err(|msg| Error::new(FileError::Failed, &msg))?;

        // Mask all of interrupts till streaming.
        io.writel(CSI_INT_MASK0, INT_DONE_MASK | INT_UPDATE_MASK);
        io.writel(CSI_INT_MASK1, 0x00ff_ffff);

        Ok(Self {
            host_id,
            bus,
            sync,
            io,
            kstreams: Default::default(),
            stats: Default::default(),
            img_sync: Default::default(),
        })
    }

    pub fn host_id(&self) -> u32 {
        self.host_id
    }

    pub fn bus(&self) -> BusType {
        self.bus
    }

    pub fn sync(&self) -> bool {
        self.sync
    }

    pub fn io(&self) -> &Arc<dyn RegisterIo> {
        &self.io
    }

    /// Add image pipe.
    pub fn add_kstream(
        &self,
        id: u32,
        vc: u32,
        hcrop: HcropCompensation,
        timing: ParallelTiming,
        ops: Arc<dyn KstreamIsrOperation>,
        vb2: Arc<dyn Vb2Core>,
    ) -> Result<Arc<KstreamDevice>, Error> {
        if id >= IMG_COUNT {
            let msg = format!("Image pipe {} is out of range", id);
            Err(invalid_arg(&msg))?;
        }

        let mut kstreams = self.kstreams.lock().map_err(poisoned)?;
        if kstreams.iter().any(|k| k.id() == id) {
            let msg = format!("Image pipe {} is already used", id);
            Err(invalid_arg(&msg))?;
        }
        if self.sync && (id != 0 || kstreams.len() > 0) {
            Err(invalid_arg("Synchronized mode has only the first image pipe"))?;
        }

        let config = KstreamConfig {
            id,
            bus: self.bus,
            sync: self.sync,
            vc,
            hcrop,
            timing,
        };
        let kstream = Arc::new(KstreamDevice::new(config, self.io.clone(), ops, vb2));
        kstreams.push(kstream.clone());
        debug!(host = self.host_id, kstream = id, vc, ?hcrop);

        Ok(kstream)
    }

    pub fn kstreams(&self) -> Vec<Arc<KstreamDevice>> {
        self.kstreams
            .lock()
            .map(|kstreams| kstreams.clone())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> CsiIntStats {
        self.stats.lock().map(|stats| *stats).unwrap_or_default()
    }

    /// Handle interrupt. The status is cleared, then frame done and shadow update are
    /// dispatched to each streaming pipe in the order.
    pub fn isr(&self) {
        let stat0 = self.io.readl(CSI_INT_STAT0);
        let stat1 = self.io.readl(CSI_INT_STAT1);
        self.io.writel(CSI_INT_STAT0, stat0);
        self.io.writel(CSI_INT_STAT1, stat1);

        if stat1 > 0 {
            debug!(host = self.host_id, "Error interrupt: {:#010x}", stat1);
            if let Ok(mut stats) = self.stats.lock() {
                stats.count(stat1);
            }
        }

        let kstreams = self.kstreams();

        if self.sync {
            let (done, update) = match self.img_sync.lock() {
                Ok(mut acc) => {
                    *acc |= stat0 & (INT_DONE_MASK | INT_UPDATE_MASK);
                    let done = *acc & INT_DONE_MASK == INT_DONE_MASK;
                    let update = *acc & INT_UPDATE_MASK == INT_UPDATE_MASK;
                    if done {
                        *acc &= !INT_DONE_MASK;
                    }
                    if update {
                        *acc &= !INT_UPDATE_MASK;
                    }
                    (done, update)
                }
                Err(_) => (false, false),
            };

            kstreams
                .iter()
                .filter(|k| k.state().is_streaming())
                .for_each(|k| {
                    if done {
                        k.ops().on_frame_done(k);
                    }
                    if update {
                        k.ops().on_shadow_update(k);
                    }
                });
        } else {
            kstreams
                .iter()
                .filter(|k| k.state().is_streaming())
                .for_each(|k| {
                    if stat0 & int_img_done(k.id()) > 0 {
                        k.ops().on_frame_done(k);
                    }
                    if stat0 & int_img_update(k.id()) > 0 {
                        k.ops().on_shadow_update(k);
                    }
                });
        }
    }
}
