// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Pad-level operations of sub-devices in media graph.
//!
//! The operations are compatible with the ones of V4L2 sub-device; `core.s_power`,
//! `video.{g,s}_frame_interval`, `video.s_stream`, and `pad.{enum_mbus_code, get_fmt, set_fmt,
//! enum_frame_size, enum_frame_interval, get_selection, set_selection}`.

use {
    super::pixfmt::MbusCode,
    glib::{Error, FileError},
    std::sync::Arc,
};

/// The order of fields in frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Field {
    /// Progressive.
    None,
    /// Interleaved lines, order depending on video standard.
    Interlaced,
    /// Interleaved lines, top field first.
    InterlacedTb,
    /// Interleaved lines, bottom field first.
    InterlacedBt,
    /// Fields in separate buffers.
    Alternate,
    /// Both fields sequentially in one buffer, top field first.
    SeqTb,
    /// Both fields sequentially in one buffer, bottom field first.
    SeqBt,
}

impl Default for Field {
    fn default() -> Self {
        Self::None
    }
}

impl Field {
    /// Whether the frame consists of two fields written at interleaved lines.
    pub fn is_interlaced(&self) -> bool {
        match self {
            Self::Interlaced | Self::InterlacedTb | Self::InterlacedBt => true,
            _ => false,
        }
    }

    /// Whether bottom field is transferred at first.
    pub fn bottom_first(&self) -> bool {
        *self == Self::InterlacedBt
    }
}

/// The format of frame in media bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MbusFrameFormat {
    pub width: u32,
    pub height: u32,
    pub code: MbusCode,
    pub field: Field,
}

impl Default for MbusFrameFormat {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            code: MbusCode::default(),
            field: Field::default(),
        }
    }
}

/// The rectangle for selection.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    /// The rectangle to cover the whole frame.
    pub fn full(fmt: &MbusFrameFormat) -> Self {
        Self {
            left: 0,
            top: 0,
            width: fmt.width,
            height: fmt.height,
        }
    }
}

/// The interval of frames in second.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameInterval {
    pub numerator: u32,
    pub denominator: u32,
}

impl Default for FrameInterval {
    fn default() -> Self {
        Self {
            numerator: 1,
            denominator: 30,
        }
    }
}

/// The range of frame size.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FrameSizeRange {
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

/// The target of selection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SelectionTarget {
    Crop,
    CropDefault,
    CropBounds,
}

fn unsupported(name: &str, op: &str) -> Error {
    let msg = format!("{} does not support {}", name, op);
    Error::new(FileError::Nosys, &msg)
}

/// Operations of sub-device.
///
/// Every operation takes shared reference since the sub-device is shared by the entities
/// linked to it in media graph.
pub trait V4l2Subdev: Send + Sync {
    /// The name of entity.
    fn name(&self) -> String;

    fn s_power(&self, _on: bool) -> Result<(), Error> {
        Ok(())
    }

    /// Start or stop streaming.
    fn s_stream(&self, enable: bool) -> Result<(), Error>;

    /// Get the active format of the pad.
    fn get_fmt(&self, pad: u32) -> Result<MbusFrameFormat, Error>;

    /// Set the format of the pad. The format is adjusted to the one actually applied.
    fn set_fmt(&self, _pad: u32, _fmt: &mut MbusFrameFormat) -> Result<(), Error> {
        Err(unsupported(&self.name(), "set_fmt"))
    }

    fn enum_mbus_code(&self, pad: u32, index: u32) -> Result<MbusCode, Error> {
        if index > 0 {
            Err(Error::new(FileError::Inval, "Index out of range"))
        } else {
            self.get_fmt(pad).map(|fmt| fmt.code)
        }
    }

    fn enum_frame_size(
        &self,
        _pad: u32,
        _index: u32,
        _code: MbusCode,
    ) -> Result<FrameSizeRange, Error> {
        Err(unsupported(&self.name(), "enum_frame_size"))
    }

    fn enum_frame_interval(
        &self,
        _pad: u32,
        _index: u32,
        _code: MbusCode,
        _width: u32,
        _height: u32,
    ) -> Result<FrameInterval, Error> {
        Err(unsupported(&self.name(), "enum_frame_interval"))
    }

    fn g_frame_interval(&self) -> Result<FrameInterval, Error> {
        Err(unsupported(&self.name(), "g_frame_interval"))
    }

    fn s_frame_interval(&self, _interval: &mut FrameInterval) -> Result<(), Error> {
        Err(unsupported(&self.name(), "s_frame_interval"))
    }

    fn get_selection(&self, _pad: u32, _target: SelectionTarget) -> Result<Rect, Error> {
        Err(unsupported(&self.name(), "get_selection"))
    }

    fn set_selection(
        &self,
        _pad: u32,
        _target: SelectionTarget,
        _rect: &mut Rect,
    ) -> Result<(), Error> {
        Err(unsupported(&self.name(), "set_selection"))
    }
}

/// The sub-device between sensor and image pipe, which forwards operations to the sensor.
pub trait InterfaceSubdev: V4l2Subdev {
    fn bind_sensor(&self, sensor: Arc<dyn V4l2Subdev>) -> Result<(), Error>;

    /// The pair of sink and source pads for the virtual channel.
    fn pads(&self, vc: u32) -> (u32, u32);
}

#[cfg(test)]
mod test {
    use super::*;

    struct Sensor;

    impl V4l2Subdev for Sensor {
        fn name(&self) -> String {
            "sensor".to_string()
        }

        fn s_stream(&self, _: bool) -> Result<(), Error> {
            Ok(())
        }

        fn get_fmt(&self, _: u32) -> Result<MbusFrameFormat, Error> {
            Ok(MbusFrameFormat::default())
        }
    }

    #[test]
    fn default_operations() {
        let sensor = Sensor;
        assert_eq!(sensor.enum_mbus_code(0, 0).unwrap(), MbusCode::Uyvy8_2x8);
        assert!(sensor.enum_mbus_code(0, 1).is_err());

        let err = sensor.g_frame_interval().unwrap_err();
        assert_eq!(err.kind::<FileError>(), Some(FileError::Nosys));
    }

    #[test]
    fn field_order() {
        assert!(Field::InterlacedBt.is_interlaced());
        assert!(Field::InterlacedBt.bottom_first());
        assert!(Field::InterlacedTb.is_interlaced());
        assert!(!Field::InterlacedTb.bottom_first());
        assert!(!Field::SeqTb.is_interlaced());
        assert!(!Field::None.is_interlaced());
    }
}
