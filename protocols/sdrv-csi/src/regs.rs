// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Register layout of CSI host IP.
//!
//! The host IP has global registers for pipe enable, shadow commit, and interrupts, followed by
//! register blocks for each image pipe at `IMG_REG_BASE + id * IMG_REG_LEN`.

/// The maximum number of image pipes in one host.
pub const IMG_COUNT: u32 = 4;

/// Enable bits of image pipes.
pub const CSI_ENABLE: u32 = 0x000;
/// Commit bits to latch shadow registers at next frame boundary.
pub const CSI_SHADOW: u32 = 0x004;
/// Status of frame done and shadow update. Write 1 to clear.
pub const CSI_INT_STAT0: u32 = 0x008;
/// Status of errors. Write 1 to clear.
pub const CSI_INT_STAT1: u32 = 0x00c;
/// Mask for CSI_INT_STAT0. The set bit masks the interrupt.
pub const CSI_INT_MASK0: u32 = 0x010;
/// Mask for CSI_INT_STAT1. The set bit masks the interrupt.
pub const CSI_INT_MASK1: u32 = 0x014;

pub const fn csi_img_en(id: u32) -> u32 {
    1 << id
}
pub const CSI_SYNC_EN: u32 = 1 << 16;

pub const fn csi_shadow_set(id: u32) -> u32 {
    1 << id
}

pub const fn int_img_done(id: u32) -> u32 {
    1 << id
}
pub const fn int_img_update(id: u32) -> u32 {
    1 << (id + 4)
}
pub const INT_DONE_MASK: u32 = 0x0000_000f;
pub const INT_UPDATE_MASK: u32 = 0x0000_00f0;

pub const fn int_bus_err(id: u32) -> u32 {
    1 << id
}
pub const fn int_pixel_err(id: u32) -> u32 {
    1 << (id + 4)
}
pub const fn int_crop_err(id: u32) -> u32 {
    1 << (id + 8)
}
pub const fn int_overflow(id: u32) -> u32 {
    1 << (id + 12)
}
pub const fn int_bt_sync_err(id: u32) -> u32 {
    1 << (id + 16)
}
pub const fn int_bt_fatal(id: u32) -> u32 {
    1 << (id + 20)
}

pub const IMG_REG_BASE: u32 = 0x100;
pub const IMG_REG_LEN: u32 = 0x100;

pub const fn img_base(id: u32) -> u32 {
    IMG_REG_BASE + id * IMG_REG_LEN
}

/// Interface parameters; bus type and virtual channel.
pub const IMG_IF_PARAM: u32 = 0x00;
pub const IF_PARAM_BUS_MASK: u32 = 0x0000_0007;
pub const IF_PARAM_VC_SHIFT: u32 = 8;
pub const IF_PARAM_VC_MASK: u32 = 0x0000_0300;

/// Control of pixel pipeline.
pub const IMG_PIXEL_CTRL: u32 = 0x04;
pub const PIXEL_CTRL_YUV422_IN: u32 = 1 << 0;
pub const PIXEL_CTRL_YUV420_LEGACY: u32 = 1 << 1;
pub const PIXEL_CTRL_YUV420_PLANAR: u32 = 1 << 2;
pub const PIXEL_CTRL_RGB: u32 = 1 << 3;
pub const PIXEL_CTRL_RAW: u32 = 1 << 4;
pub const PIXEL_CTRL_INTERLACED: u32 = 1 << 8;
pub const PIXEL_CTRL_BOTTOM_FIRST: u32 = 1 << 9;

/// Mask of pixel error interrupts. The set bit masks the interrupt.
pub const IMG_PIXEL_MASK: u32 = 0x08;
pub const PIXEL_MASK_BUS_ERR: u32 = 1 << 0;
pub const PIXEL_MASK_PIXEL_ERR: u32 = 1 << 1;
pub const PIXEL_MASK_CROP_ERR: u32 = 1 << 2;
pub const PIXEL_MASK_OVERFLOW: u32 = 1 << 3;
pub const PIXEL_MASK_BT_ERR: u32 = 1 << 4;
pub const PIXEL_MASK_ALL: u32 = 0x0000_001f;

/// Timing of parallel and BT.656 bus.
pub const IMG_PARA_BT: u32 = 0x0c;
pub const PARA_BT_HSYNC_POL: u32 = 1 << 0;
pub const PARA_BT_VSYNC_POL: u32 = 1 << 1;
pub const PARA_BT_PCLK_POL: u32 = 1 << 2;
pub const PARA_BT_EVEN_MASK_SHIFT: u32 = 4;
pub const PARA_BT_ODD_MASK_SHIFT: u32 = 8;
pub const PARA_BT_BT656_EN: u32 = 1 << 12;

/// Width in lower 16 bits, height in upper 16 bits.
pub const IMG_SIZE: u32 = 0x10;
/// Left in lower 16 bits, top in upper 16 bits.
pub const IMG_CROP_POS: u32 = 0x14;
/// Width in lower 15 bits, height in bits 16-30, and enable bit.
pub const IMG_CROP_SIZE: u32 = 0x18;
pub const CROP_SIZE_EN: u32 = 1 << 31;

/// Decomposition of incoming pixel words into channels.
pub const IMG_CHN_SPLIT: u32 = 0x1c;
/// Packing of channels into memory planes.
pub const IMG_CHN_PACK: u32 = 0x20;

pub const fn img_chn_ctrl(plane: usize) -> u32 {
    0x24 + 4 * plane as u32
}
pub const CHN_CTRL_EN: u32 = 1 << 8;

pub const fn img_stride(plane: usize) -> u32 {
    0x30 + 4 * plane as u32
}

pub const fn img_baddr_h(plane: usize) -> u32 {
    0x40 + 8 * plane as u32
}

pub const fn img_baddr_l(plane: usize) -> u32 {
    0x44 + 8 * plane as u32
}

/// Configuration of write DMA; burst length, FIFO threshold, and arbitration.
pub const IMG_WDMA_CFG: u32 = 0x60;
pub const WDMA_BURST_LEN_16: u32 = 0x0000_0004;
pub const WDMA_FIFO_THRESHOLD_SHIFT: u32 = 8;
pub const WDMA_ARB_ROUND_ROBIN: u32 = 1 << 16;
/// Priority of write DMA in bus arbitration.
pub const IMG_WDMA_PRIO: u32 = 0x64;

/// The maximum number of memory planes.
pub const MAX_PLANES: usize = 3;
