// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Pixel formats available in capture DMA engine.
//!
//! Each entry of [`PIX_FMTS`] associates a combination of pixel format in memory, code of media
//! bus format, and class of bus to the parameters for channel split and pack, which decide the
//! way to decompose incoming pixel words into memory planes.
//!
//! Two kinds of lookup are available. [`find_pix_fmt`] is strict and used to program the
//! hardware; no entry means that the combination is not supported. [`find_by_pixfmt`] and
//! [`find_by_mbus_code`] are for format negotiation; the caller decides to fall back to
//! [`KstreamPixFmt::negotiation_default`] when no entry matches.

use super::regs::MAX_PLANES;

/// The code of media bus format, compatible with `MEDIA_BUS_FMT_*`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MbusCode {
    Rgb565_2x8Le,
    Rgb888_1x24,
    Y8_1x8,
    Uyvy8_2x8,
    Yuyv8_2x8,
    Uyvy8_1x16,
    Yuyv8_1x16,
    Sbggr8_1x8,
}

impl Default for MbusCode {
    fn default() -> Self {
        Self::Uyvy8_2x8
    }
}

impl MbusCode {
    const ALL: [Self; 8] = [
        Self::Rgb565_2x8Le,
        Self::Rgb888_1x24,
        Self::Y8_1x8,
        Self::Uyvy8_2x8,
        Self::Yuyv8_2x8,
        Self::Uyvy8_1x16,
        Self::Yuyv8_1x16,
        Self::Sbggr8_1x8,
    ];

    /// The numeric code.
    pub const fn code(&self) -> u32 {
        match self {
            Self::Rgb565_2x8Le => 0x1008,
            Self::Rgb888_1x24 => 0x100a,
            Self::Y8_1x8 => 0x2001,
            Self::Uyvy8_2x8 => 0x2006,
            Self::Yuyv8_2x8 => 0x2008,
            Self::Uyvy8_1x16 => 0x200f,
            Self::Yuyv8_1x16 => 0x2011,
            Self::Sbggr8_1x8 => 0x3001,
        }
    }

    /// Parse the numeric code.
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().find(|c| c.code() == code).copied()
    }

    /// Whether the code is for YUV 4:2:2 formats.
    pub fn is_yuv422(&self) -> bool {
        match self {
            Self::Uyvy8_2x8 | Self::Yuyv8_2x8 | Self::Uyvy8_1x16 | Self::Yuyv8_1x16 => true,
            _ => false,
        }
    }

    /// The data type of MIPI CSI-2 packet to carry the format.
    pub fn csi2_data_type(&self) -> u32 {
        match self {
            Self::Uyvy8_2x8 | Self::Yuyv8_2x8 | Self::Uyvy8_1x16 | Self::Yuyv8_1x16 => 0x1e,
            Self::Rgb565_2x8Le => 0x22,
            Self::Rgb888_1x24 => 0x24,
            Self::Y8_1x8 | Self::Sbggr8_1x8 => 0x2a,
        }
    }
}

/// The format of pixels in memory, compatible with `V4L2_PIX_FMT_*`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// YUV 4:2:0 in three planes.
    Yuv420,
    Yuyv,
    Uyvy,
    Rgb565,
    Rgb24,
    /// Raw Bayer in 8 bit.
    Sbggr8,
    Grey,
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::Uyvy
    }
}

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

impl PixelFormat {
    const ALL: [Self; 7] = [
        Self::Yuv420,
        Self::Yuyv,
        Self::Uyvy,
        Self::Rgb565,
        Self::Rgb24,
        Self::Sbggr8,
        Self::Grey,
    ];

    /// The four character code.
    pub const fn fourcc(&self) -> u32 {
        match self {
            Self::Yuv420 => fourcc(b"YU12"),
            Self::Yuyv => fourcc(b"YUYV"),
            Self::Uyvy => fourcc(b"UYVY"),
            Self::Rgb565 => fourcc(b"RGBP"),
            Self::Rgb24 => fourcc(b"RGB3"),
            Self::Sbggr8 => fourcc(b"BA81"),
            Self::Grey => fourcc(b"GREY"),
        }
    }

    /// Parse the four character code.
    pub fn from_fourcc(code: u32) -> Option<Self> {
        Self::ALL.iter().find(|f| f.fourcc() == code).copied()
    }
}

/// The type of bus between interface and image pipe.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BusType {
    Parallel,
    Bt656,
    MipiCsi2,
    /// Loopback from display controller 1.
    Dc2Csi1,
    /// Loopback from display controller 2.
    Dc2Csi2,
}

impl Default for BusType {
    fn default() -> Self {
        Self::MipiCsi2
    }
}

impl BusType {
    /// The value of `mbus-type` property in device tree.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "parallel" => Some(Self::Parallel),
            "bt656" => Some(Self::Bt656),
            "mipi-csi2" => Some(Self::MipiCsi2),
            "dc2csi-1" => Some(Self::Dc2Csi1),
            "dc2csi-2" => Some(Self::Dc2Csi2),
            _ => None,
        }
    }

    /// The value in interface parameter register.
    pub(crate) fn reg_val(&self) -> u32 {
        match self {
            Self::Parallel => 0,
            Self::Bt656 => 1,
            Self::MipiCsi2 => 2,
            Self::Dc2Csi1 => 3,
            Self::Dc2Csi2 => 4,
        }
    }

    /// The class of bus in the table of pixel formats.
    pub fn class(&self) -> BusClass {
        match self {
            Self::Parallel | Self::Bt656 => BusClass::Parallel,
            Self::MipiCsi2 | Self::Dc2Csi1 | Self::Dc2Csi2 => BusClass::Mipi,
        }
    }
}

/// The class of bus which decides byte order of incoming pixel words.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BusClass {
    Mipi,
    Parallel,
}

/// Parameters of pixel format for capture DMA engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KstreamPixFmt {
    pub pixfmt: PixelFormat,
    pub mbus_code: MbusCode,
    pub bus: BusClass,
    /// The number of memory planes.
    pub planes: usize,
    /// Bits per pixel along line in each plane.
    pub bpp: [u32; MAX_PLANES],
    /// Vertical subsampling in each plane.
    pub vsub: [u32; MAX_PLANES],
    /// Pattern to decompose pixel words into channels.
    pub split: u32,
    /// Pattern to pack channels into planes.
    pub pack: u32,
}

impl KstreamPixFmt {
    /// The entry used in format negotiation when no entry matches.
    pub fn negotiation_default() -> &'static Self {
        &PIX_FMTS[NEGOTIATION_DEFAULT_INDEX]
    }

    /// The number of bytes in one line of the plane.
    pub fn bytesperline(&self, plane: usize, width: u32) -> u32 {
        width * self.bpp[plane] / 8
    }

    /// The number of bytes for the plane.
    pub fn plane_size(&self, plane: usize, bytesperline: u32, height: u32) -> u32 {
        bytesperline * height / self.vsub[plane]
    }
}

const NEGOTIATION_DEFAULT_INDEX: usize = 2;

/// The table of supported pixel formats.
pub const PIX_FMTS: &[KstreamPixFmt] = &[
    KstreamPixFmt {
        pixfmt: PixelFormat::Yuyv,
        mbus_code: MbusCode::Yuyv8_2x8,
        bus: BusClass::Parallel,
        planes: 1,
        bpp: [16, 0, 0],
        vsub: [1, 1, 1],
        split: 0x0000_0000,
        pack: 0x0000_0010,
    },
    KstreamPixFmt {
        pixfmt: PixelFormat::Yuyv,
        mbus_code: MbusCode::Uyvy8_2x8,
        bus: BusClass::Mipi,
        planes: 1,
        bpp: [16, 0, 0],
        vsub: [1, 1, 1],
        split: 0x0000_0000,
        pack: 0x0000_0011,
    },
    KstreamPixFmt {
        pixfmt: PixelFormat::Uyvy,
        mbus_code: MbusCode::Uyvy8_2x8,
        bus: BusClass::Mipi,
        planes: 1,
        bpp: [16, 0, 0],
        vsub: [1, 1, 1],
        split: 0x0000_0000,
        pack: 0x0000_0010,
    },
    KstreamPixFmt {
        pixfmt: PixelFormat::Uyvy,
        mbus_code: MbusCode::Uyvy8_2x8,
        bus: BusClass::Parallel,
        planes: 1,
        bpp: [16, 0, 0],
        vsub: [1, 1, 1],
        split: 0x0000_0000,
        pack: 0x0000_0010,
    },
    KstreamPixFmt {
        pixfmt: PixelFormat::Uyvy,
        mbus_code: MbusCode::Yuyv8_2x8,
        bus: BusClass::Parallel,
        planes: 1,
        bpp: [16, 0, 0],
        vsub: [1, 1, 1],
        split: 0x0000_0000,
        pack: 0x0000_0011,
    },
    KstreamPixFmt {
        pixfmt: PixelFormat::Yuv420,
        mbus_code: MbusCode::Uyvy8_2x8,
        bus: BusClass::Mipi,
        planes: 3,
        bpp: [8, 4, 4],
        vsub: [1, 2, 2],
        split: 0x0001_0203,
        pack: 0x0000_0210,
    },
    KstreamPixFmt {
        pixfmt: PixelFormat::Yuv420,
        mbus_code: MbusCode::Yuyv8_2x8,
        bus: BusClass::Parallel,
        planes: 3,
        bpp: [8, 4, 4],
        vsub: [1, 2, 2],
        split: 0x0000_0103,
        pack: 0x0000_0210,
    },
    KstreamPixFmt {
        pixfmt: PixelFormat::Rgb565,
        mbus_code: MbusCode::Rgb565_2x8Le,
        bus: BusClass::Mipi,
        planes: 1,
        bpp: [16, 0, 0],
        vsub: [1, 1, 1],
        split: 0x0000_0000,
        pack: 0x0000_0020,
    },
    KstreamPixFmt {
        pixfmt: PixelFormat::Rgb565,
        mbus_code: MbusCode::Rgb565_2x8Le,
        bus: BusClass::Parallel,
        planes: 1,
        bpp: [16, 0, 0],
        vsub: [1, 1, 1],
        split: 0x0000_0000,
        pack: 0x0000_0020,
    },
    KstreamPixFmt {
        pixfmt: PixelFormat::Rgb24,
        mbus_code: MbusCode::Rgb888_1x24,
        bus: BusClass::Mipi,
        planes: 1,
        bpp: [24, 0, 0],
        vsub: [1, 1, 1],
        split: 0x0000_0000,
        pack: 0x0000_0030,
    },
    KstreamPixFmt {
        pixfmt: PixelFormat::Rgb24,
        mbus_code: MbusCode::Rgb888_1x24,
        bus: BusClass::Parallel,
        planes: 1,
        bpp: [24, 0, 0],
        vsub: [1, 1, 1],
        split: 0x0000_0000,
        pack: 0x0000_0030,
    },
    KstreamPixFmt {
        pixfmt: PixelFormat::Sbggr8,
        mbus_code: MbusCode::Sbggr8_1x8,
        bus: BusClass::Mipi,
        planes: 1,
        bpp: [8, 0, 0],
        vsub: [1, 1, 1],
        split: 0x0000_0000,
        pack: 0x0000_0040,
    },
    KstreamPixFmt {
        pixfmt: PixelFormat::Sbggr8,
        mbus_code: MbusCode::Sbggr8_1x8,
        bus: BusClass::Parallel,
        planes: 1,
        bpp: [8, 0, 0],
        vsub: [1, 1, 1],
        split: 0x0000_0000,
        pack: 0x0000_0040,
    },
    KstreamPixFmt {
        pixfmt: PixelFormat::Grey,
        mbus_code: MbusCode::Y8_1x8,
        bus: BusClass::Mipi,
        planes: 1,
        bpp: [8, 0, 0],
        vsub: [1, 1, 1],
        split: 0x0000_0000,
        pack: 0x0000_0040,
    },
    KstreamPixFmt {
        pixfmt: PixelFormat::Grey,
        mbus_code: MbusCode::Y8_1x8,
        bus: BusClass::Parallel,
        planes: 1,
        bpp: [8, 0, 0],
        vsub: [1, 1, 1],
        split: 0x0000_0000,
        pack: 0x0000_0040,
    },
];

/// The media bus codes acceptable at sink pad of image pipe.
pub const MBUS_FMTS: &[MbusCode] = &[
    MbusCode::Uyvy8_2x8,
    MbusCode::Yuyv8_2x8,
    MbusCode::Rgb565_2x8Le,
    MbusCode::Rgb888_1x24,
    MbusCode::Sbggr8_1x8,
    MbusCode::Y8_1x8,
];

/// Find the entry strictly by the combination.
pub fn find_pix_fmt(
    pixfmt: PixelFormat,
    mbus_code: MbusCode,
    bus: BusClass,
) -> Option<&'static KstreamPixFmt> {
    PIX_FMTS
        .iter()
        .find(|e| e.pixfmt == pixfmt && e.mbus_code == mbus_code && e.bus == bus)
}

/// Find the first entry for the pixel format.
pub fn find_by_pixfmt(pixfmt: PixelFormat) -> Option<&'static KstreamPixFmt> {
    PIX_FMTS.iter().find(|e| e.pixfmt == pixfmt)
}

/// Find the first entry for the code of media bus format.
pub fn find_by_mbus_code(mbus_code: MbusCode) -> Option<&'static KstreamPixFmt> {
    PIX_FMTS.iter().find(|e| e.mbus_code == mbus_code)
}

/// Whether the code is acceptable at sink pad.
pub fn is_sink_mbus_code(code: MbusCode) -> bool {
    MBUS_FMTS.iter().any(|c| *c == code)
}

/// Check that every key of the table is unique and each entry is consistent.
pub fn validate_pix_fmts() -> Result<(), String> {
    PIX_FMTS.iter().enumerate().try_for_each(|(i, entry)| {
        if entry.planes == 0 || entry.planes > MAX_PLANES {
            Err(format!("Entry {} has invalid number of planes {}", i, entry.planes))?;
        }
        if entry.bpp[..entry.planes].iter().any(|bpp| *bpp == 0) {
            Err(format!("Entry {} has zero bits per pixel", i))?;
        }
        PIX_FMTS[(i + 1)..]
            .iter()
            .position(|e| {
                e.pixfmt == entry.pixfmt && e.mbus_code == entry.mbus_code && e.bus == entry.bus
            })
            .map_or(Ok(()), |pos| {
                Err(format!("Entry {} duplicates entry {}", i + 1 + pos, i))
            })
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn table_keys_are_unique() {
        assert_eq!(validate_pix_fmts(), Ok(()));
    }

    #[test]
    fn negotiation_default_is_uyvy() {
        let entry = KstreamPixFmt::negotiation_default();
        assert_eq!(entry.pixfmt, PixelFormat::Uyvy);
        assert_eq!(entry.mbus_code, MbusCode::Uyvy8_2x8);
    }

    #[test]
    fn lookup_by_pixfmt_round_trips_mbus_code() {
        PIX_FMTS.iter().for_each(|entry| {
            let by_fmt = find_by_pixfmt(entry.pixfmt).unwrap();
            let by_code = find_by_mbus_code(by_fmt.mbus_code).unwrap();
            assert_eq!(by_code.mbus_code, by_fmt.mbus_code);
        });
    }

    #[test]
    fn yuyv_aliases_bus_dependent_mbus_codes() {
        let parallel = find_pix_fmt(PixelFormat::Yuyv, MbusCode::Yuyv8_2x8, BusClass::Parallel);
        let mipi = find_pix_fmt(PixelFormat::Yuyv, MbusCode::Uyvy8_2x8, BusClass::Mipi);
        assert!(parallel.is_some());
        assert!(mipi.is_some());
        assert_ne!(parallel.unwrap().pack, mipi.unwrap().pack);
    }

    #[test]
    fn strict_lookup_has_no_fallback() {
        assert!(find_pix_fmt(PixelFormat::Yuyv, MbusCode::Yuyv8_2x8, BusClass::Mipi).is_none());
        assert!(find_pix_fmt(PixelFormat::Rgb24, MbusCode::Uyvy8_2x8, BusClass::Mipi).is_none());
    }

    #[test]
    fn permissive_lookup_reports_no_match() {
        assert!(find_by_mbus_code(MbusCode::Yuyv8_1x16).is_none());
        let entry = find_by_mbus_code(MbusCode::Yuyv8_1x16)
            .unwrap_or_else(|| KstreamPixFmt::negotiation_default());
        assert_eq!(entry.pixfmt, PixelFormat::Uyvy);
    }

    #[test]
    fn plane_geometry() {
        let entry = find_pix_fmt(PixelFormat::Yuv420, MbusCode::Uyvy8_2x8, BusClass::Mipi).unwrap();
        let bpl: Vec<u32> = (0..entry.planes)
            .map(|i| entry.bytesperline(i, 1280))
            .collect();
        assert_eq!(bpl, vec![1280, 640, 640]);
        let sizes: Vec<u32> = (0..entry.planes)
            .map(|i| entry.plane_size(i, bpl[i], 720))
            .collect();
        assert_eq!(sizes, vec![921600, 230400, 230400]);
    }

    #[test]
    fn codes_parse() {
        assert_eq!(MbusCode::from_code(0x2006), Some(MbusCode::Uyvy8_2x8));
        assert_eq!(MbusCode::from_code(0x9999), None);
        assert_eq!(
            PixelFormat::from_fourcc(PixelFormat::Uyvy.fourcc()),
            Some(PixelFormat::Uyvy)
        );
        assert_eq!(PixelFormat::Uyvy.fourcc(), 0x5956_5955);
        assert_eq!(BusType::from_name("bt656"), Some(BusType::Bt656));
        assert_eq!(BusType::from_name("usb"), None);
    }
}
