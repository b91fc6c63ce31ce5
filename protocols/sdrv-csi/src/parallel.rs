// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Parallel and BT.656 interface, which just forwards operations to the sensor.

use {
    super::{pixfmt::*, subdev::*, *},
    std::sync::Mutex,
    tracing::debug,
};

pub const PARALLEL_PAD_SINK: u32 = 0;
pub const PARALLEL_PAD_SOURCE: u32 = 1;

/// The interface for parallel or BT.656 bus.
pub struct ParallelInterface {
    host_id: u32,
    bus: BusType,
    sensor: Mutex<Option<Arc<dyn V4l2Subdev>>>,
}

impl std::fmt::Debug for ParallelInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ParallelInterface")
            .field("host_id", &self.host_id)
            .field("bus", &self.bus)
            .finish()
    }
}

impl ParallelInterface {
    pub fn new(host_id: u32, bus: BusType) -> Result<Self, Error> {
        if bus.class() != BusClass::Parallel {
            let msg = format!("{:?} is not for parallel interface", bus);
            Err(invalid_arg(&msg))?;
        }

        Ok(Self {
            host_id,
            bus,
            sensor: Default::default(),
        })
    }

    pub fn bus(&self) -> BusType {
        self.bus
    }

    fn sensor(&self) -> Result<Arc<dyn V4l2Subdev>, Error> {
        self.sensor
            .lock()
            .map_err(poisoned)?
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::new(FileError::Nodev, "No sensor is bound"))
    }
}

impl InterfaceSubdev for ParallelInterface {
    fn bind_sensor(&self, sensor: Arc<dyn V4l2Subdev>) -> Result<(), Error> {
        debug!(host = self.host_id, sensor = sensor.name().as_str());
        let mut entry = self.sensor.lock().map_err(poisoned)?;
        *entry = Some(sensor);
        Ok(())
    }

    fn pads(&self, _: u32) -> (u32, u32) {
        (PARALLEL_PAD_SINK, PARALLEL_PAD_SOURCE)
    }
}

impl V4l2Subdev for ParallelInterface {
    fn name(&self) -> String {
        format!("sdrv-parallel-{}", self.host_id)
    }

    fn s_power(&self, on: bool) -> Result<(), Error> {
        self.sensor()?.s_power(on)
    }

    fn s_stream(&self, enable: bool) -> Result<(), Error> {
        self.sensor()?.s_stream(enable)
    }

    fn get_fmt(&self, _: u32) -> Result<MbusFrameFormat, Error> {
        self.sensor()?.get_fmt(0)
    }

    fn set_fmt(&self, _: u32, fmt: &mut MbusFrameFormat) -> Result<(), Error> {
        self.sensor()?.set_fmt(0, fmt)
    }

    fn enum_mbus_code(&self, _: u32, index: u32) -> Result<MbusCode, Error> {
        self.sensor()?.enum_mbus_code(0, index)
    }

    fn enum_frame_size(&self, _: u32, index: u32, code: MbusCode) -> Result<FrameSizeRange, Error> {
        self.sensor()?.enum_frame_size(0, index, code)
    }

    fn enum_frame_interval(
        &self,
        _: u32,
        index: u32,
        code: MbusCode,
        width: u32,
        height: u32,
    ) -> Result<FrameInterval, Error> {
        self.sensor()?
            .enum_frame_interval(0, index, code, width, height)
    }

    fn g_frame_interval(&self) -> Result<FrameInterval, Error> {
        self.sensor()?.g_frame_interval()
    }

    fn s_frame_interval(&self, interval: &mut FrameInterval) -> Result<(), Error> {
        self.sensor()?.s_frame_interval(interval)
    }
}
