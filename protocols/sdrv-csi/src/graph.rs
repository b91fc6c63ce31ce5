// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Assembly of media graph for CSI host.
//!
//! The description of host, typically parsed from device tree, lists ports for image pipes. Each
//! port refers to interface (MIPI CSI-2 host or parallel interface) and sensor. The sub-devices
//! are registered asynchronously; once all of them are bound, media links are created in the
//! order of sensor, interface, image pipe, and video node.

use {
    super::{csi_core::*, kstream::*, pixfmt::*, regs::IMG_COUNT, subdev::*, video::*, *},
    bitflags::bitflags,
    std::collections::HashMap,
    std::sync::Mutex,
    tracing::{debug, debug_span},
};

/// The endpoint of remote node.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EndpointDesc {
    /// The name of remote node.
    pub node: String,
    pub pad: u32,
}

/// The port for image pipe.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PortDesc {
    /// The index of image pipe.
    pub id: u32,
    /// Virtual channel of MIPI CSI-2.
    pub vc: u32,
    /// The name of interface node.
    pub interface: String,
    pub sensor: EndpointDesc,
    pub hcrop: HcropCompensation,
    pub timing: ParallelTiming,
}

/// The description of CSI host.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CsiNodeDesc {
    pub host_id: u32,
    pub bus: BusType,
    pub sync: bool,
    pub ports: Vec<PortDesc>,
}

impl CsiNodeDesc {
    pub fn validate(&self) -> Result<(), Error> {
        if self.ports.is_empty() {
            let msg = format!("CSI host {} has no port", self.host_id);
            Err(invalid_arg(&msg))?;
        }

        self.ports.iter().enumerate().try_for_each(|(i, port)| {
            if port.id >= IMG_COUNT {
                let msg = format!("Port {} is out of range", port.id);
                Err(invalid_arg(&msg))
            } else if self.ports[..i].iter().any(|p| p.id == port.id) {
                let msg = format!("Port {} is duplicated", port.id);
                Err(invalid_arg(&msg))
            } else if port.interface.is_empty() || port.sensor.node.is_empty() {
                let msg = format!("Port {} has no remote endpoint", port.id);
                Err(invalid_arg(&msg))
            } else {
                Ok(())
            }
        })?;

        if self.sync && (self.ports.len() != 1 || self.ports[0].id != 0) {
            Err(invalid_arg("Synchronized mode requires single port for the first pipe"))?;
        }

        Ok(())
    }

    /// The nodes of sub-devices to wait for. The node shared by several ports appears once,
    /// like MIPI CSI-2 host used for virtual channels.
    pub fn async_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = Vec::new();
        self.ports
            .iter()
            .map(|port| &port.interface)
            .chain(self.ports.iter().map(|port| &port.sensor.node))
            .for_each(|node| {
                if !nodes.contains(node) {
                    nodes.push(node.clone());
                }
            });
        nodes
    }
}

/// Add image pipes for the ports to the host.
pub fn populate<F>(
    core: &CsiCore,
    desc: &CsiNodeDesc,
    ops: Arc<dyn KstreamIsrOperation>,
    mut vb2: F,
) -> Result<Vec<Arc<KstreamDevice>>, Error>
where
    F: FnMut(&PortDesc) -> Arc<dyn Vb2Core>,
{
    desc.validate()?;

    if desc.host_id != core.host_id() || desc.bus != core.bus() || desc.sync != core.sync() {
        let msg = format!("Description mismatch for CSI host {}", core.host_id());
        Err(invalid_arg(&msg))?;
    }

    desc.ports
        .iter()
        .map(|port| {
            core.add_kstream(
                port.id,
                port.vc,
                port.hcrop,
                port.timing,
                ops.clone(),
                vb2(port),
            )
        })
        .collect()
}

bitflags! {
    /// The flags of media link.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct LinkFlags: u32 {
        const ENABLED = 0x00000001;
        const IMMUTABLE = 0x00000002;
    }
}

/// The link between pads of entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLink {
    pub source: String,
    pub source_pad: u32,
    pub sink: String,
    pub sink_pad: u32,
    pub flags: LinkFlags,
}

/// The media graph after completion.
pub struct MediaGraph {
    pub videos: Vec<Arc<KstreamVideo>>,
    pub links: Vec<MediaLink>,
}

enum BoundSubdev {
    Interface(Arc<dyn InterfaceSubdev>, Arc<dyn V4l2Subdev>),
    Sensor(Arc<dyn V4l2Subdev>),
}

/// The notifier to wait for sub-devices.
pub struct AsyncNotifier {
    expected: Vec<String>,
    bound: Mutex<HashMap<String, BoundSubdev>>,
}

impl AsyncNotifier {
    pub fn new(desc: &CsiNodeDesc) -> Self {
        Self {
            expected: desc.async_nodes(),
            bound: Default::default(),
        }
    }

    pub fn expected(&self) -> &[String] {
        &self.expected
    }

    fn bind(&self, node: &str, entry: BoundSubdev) -> Result<bool, Error> {
        if !self.expected.iter().any(|n| n == node) {
            let msg = format!("Unexpected node: {}", node);
            Err(invalid_arg(&msg))?;
        }

        let mut bound = self.bound.lock().map_err(poisoned)?;
        if bound.contains_key(node) {
            let msg = format!("Node {} is already bound", node);
            Err(Error::new(FileError::Exist, &msg))?;
        }
        bound.insert(node.to_string(), entry);
        debug!(node, bound = bound.len(), expected = self.expected.len());

        Ok(bound.len() == self.expected.len())
    }

    /// Bind the interface. Return whether all of sub-devices are bound.
    pub fn bind_interface<T: InterfaceSubdev + 'static>(
        &self,
        node: &str,
        interface: Arc<T>,
    ) -> Result<bool, Error> {
        let subdev: Arc<dyn V4l2Subdev> = interface.clone();
        self.bind(node, BoundSubdev::Interface(interface, subdev))
    }

    /// Bind the sensor. Return whether all of sub-devices are bound.
    pub fn bind_sensor(&self, node: &str, sensor: Arc<dyn V4l2Subdev>) -> Result<bool, Error> {
        self.bind(node, BoundSubdev::Sensor(sensor))
    }

    pub fn is_complete(&self) -> bool {
        self.bound
            .lock()
            .map(|bound| bound.len() == self.expected.len())
            .unwrap_or(false)
    }

    /// Bind sensors to interfaces and interfaces to image pipes, then create video nodes and
    /// links.
    pub fn complete(
        &self,
        desc: &CsiNodeDesc,
        kstreams: &[Arc<KstreamDevice>],
    ) -> Result<MediaGraph, Error> {
        let _enter = debug_span!("complete", host = desc.host_id).entered();

        let bound = self.bound.lock().map_err(poisoned)?;
        if bound.len() != self.expected.len() {
            let msg = format!("{} of {} nodes bound", bound.len(), self.expected.len());
            Err(Error::new(FileError::Again, &msg))?;
        }

        let flags = LinkFlags::IMMUTABLE | LinkFlags::ENABLED;
        let mut videos = Vec::new();
        let mut links = Vec::new();

        desc.ports.iter().try_for_each(|port| {
            let kstream = kstreams
                .iter()
                .find(|k| k.id() == port.id)
                .ok_or_else(|| {
                    let msg = format!("No image pipe for port {}", port.id);
                    Error::new(FileError::Nodev, &msg)
                })?;

            let (interface, interface_sd) = match bound.get(&port.interface) {
                Some(BoundSubdev::Interface(i, sd)) => (i, sd),
                _ => {
                    let msg = format!("{} is not interface", port.interface);
                    Err(invalid_arg(&msg))?
                }
            };
            let sensor = match bound.get(&port.sensor.node) {
                Some(BoundSubdev::Sensor(sd)) => sd,
                _ => {
                    let msg = format!("{} is not sensor", port.sensor.node);
                    Err(invalid_arg(&msg))?
                }
            };

            interface.bind_sensor(sensor.clone())?;
            let (sink_pad, source_pad) = interface.pads(port.vc);
            kstream.bind_interface(interface_sd.clone(), source_pad)?;
            let video = Arc::new(KstreamVideo::new(desc.host_id, kstream.clone())?);

            links.push(MediaLink {
                source: sensor.name(),
                source_pad: port.sensor.pad,
                sink: interface_sd.name(),
                sink_pad,
                flags,
            });
            links.push(MediaLink {
                source: interface_sd.name(),
                source_pad,
                sink: kstream.name(),
                sink_pad: KSTREAM_PAD_SINK,
                flags,
            });
            links.push(MediaLink {
                source: kstream.name(),
                source_pad: KSTREAM_PAD_SOURCE,
                sink: video.name(),
                sink_pad: 0,
                flags,
            });
            videos.push(video);

            Ok::<(), Error>(())
        })?;

        links
            .iter()
            .for_each(|l| debug!("{}:{} -> {}:{}", l.source, l.source_pad, l.sink, l.sink_pad));

        Ok(MediaGraph { videos, links })
    }
}
