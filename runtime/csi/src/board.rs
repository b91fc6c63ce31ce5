// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Description of board read from flattened device tree.

use {
    super::*,
    fdt::{node::FdtNode, Fdt},
    gmsl_serdes_protocols::{poc::PocVariant, GmslParams, Rotation},
    sdrv_csi_protocols::{
        graph::{CsiNodeDesc, EndpointDesc, PortDesc},
        kstream::{HcropCompensation, ParallelTiming},
        mipi_csi2::{DispmuxField, IpiConfig, MipiCsi2Config},
        pixfmt::{BusType, MbusCode},
    },
    std::collections::HashMap,
};

const CSI_COMPATIBLE: &str = "semidrive,sdrv-csi";
const MIPI_CSI2_COMPATIBLE: &str = "semidrive,sdrv-mipi-csi2";
const PARALLEL_COMPATIBLE: &str = "semidrive,sdrv-parallel";

/// Access to properties of node.
pub trait PropertySource {
    fn node_name(&self) -> &str;
    fn u32_prop(&self, name: &str) -> Option<u32>;
    fn str_prop(&self, name: &str) -> Option<&str>;
}

impl<'b, 'a: 'b> PropertySource for FdtNode<'b, 'a> {
    fn node_name(&self) -> &str {
        self.name
    }

    fn u32_prop(&self, name: &str) -> Option<u32> {
        self.property(name)
            .and_then(|prop| prop.as_usize())
            .map(|val| val as u32)
    }

    fn str_prop(&self, name: &str) -> Option<&str> {
        self.property(name).and_then(|prop| prop.as_str())
    }
}

/// The type of deserializer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChipKind {
    Max9286,
    Max96706,
    Max96722,
}

impl ChipKind {
    fn from_compatible(compatible: &str) -> Option<Self> {
        match compatible {
            "maxim,max9286" => Some(Self::Max9286),
            "maxim,max96706" => Some(Self::Max96706),
            "maxim,max96722" => Some(Self::Max96722),
            _ => None,
        }
    }
}

fn poc_variant(compatible: &str) -> Option<PocVariant> {
    match compatible {
        "maxim,max20086" => Some(PocVariant::Max20086),
        "maxim,max20087" => Some(PocVariant::Max20087),
        _ => None,
    }
}

/// The controller of power over coax.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PocDesc {
    pub bus: u32,
    pub addr: u16,
    pub variant: PocVariant,
}

/// The deserializer as sensor for interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorDesc {
    pub name: String,
    pub chip: ChipKind,
    /// The number of I2C adapter.
    pub bus: u32,
    pub params: GmslParams,
    pub poc: Option<PocDesc>,
    /// The number of GPIO line for power down.
    pub pwdn_gpio: Option<u32>,
}

/// The region of registers.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RegRegion {
    pub base: u64,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MipiDesc {
    pub name: String,
    pub regs: RegRegion,
    pub dispmux: RegRegion,
    pub config: MipiCsi2Config,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceDesc {
    Mipi(MipiDesc),
    Parallel { name: String, host_id: u32 },
}

impl InterfaceDesc {
    pub fn name(&self) -> &str {
        match self {
            Self::Mipi(desc) => &desc.name,
            Self::Parallel { name, .. } => name,
        }
    }
}

/// The whole description for CSI host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardDesc {
    pub regs: RegRegion,
    pub csi: CsiNodeDesc,
    pub interfaces: Vec<InterfaceDesc>,
    pub sensors: Vec<SensorDesc>,
}

fn missing(node: &str, prop: &str) -> Error {
    let msg = format!("{} has no {} property", node, prop);
    Error::new(FileError::Inval, &msg)
}

pub fn parse_bus_type<P: PropertySource>(node: &P) -> Result<BusType, Error> {
    match node.str_prop("mbus-type") {
        Some(name) => BusType::from_name(name).ok_or_else(|| {
            let msg = format!("Unsupported mbus-type: {}", name);
            Error::new(FileError::Inval, &msg)
        }),
        None => Ok(BusType::default()),
    }
}

pub fn parse_hcrop<P: PropertySource>(node: &P) -> HcropCompensation {
    let prop = |name| node.u32_prop(name).unwrap_or(0);
    HcropCompensation {
        back: prop("hcrop_back"),
        front: prop("hcrop_front"),
        top_back: prop("hcrop_top_back"),
        top_front: prop("hcrop_top_front"),
        bottom_back: prop("hcrop_bottom_back"),
        bottom_front: prop("hcrop_bottom_front"),
    }
}

pub fn parse_timing<P: PropertySource>(node: &P) -> ParallelTiming {
    let flag = |name| node.u32_prop(name).map(|val| val > 0).unwrap_or(false);
    ParallelTiming {
        hsync_active_high: flag("hsync-active"),
        vsync_active_high: flag("vsync-active"),
        pclk_rising: flag("pclk-sample"),
        even_mask: node.u32_prop("even-mask").unwrap_or(0),
        odd_mask: node.u32_prop("odd-mask").unwrap_or(0),
    }
}

/// Parse the port. The phandles to interface and sensor are resolved to the names of node.
pub fn parse_port<P, F>(node: &P, resolve: F) -> Result<PortDesc, Error>
where
    P: PropertySource,
    F: Fn(u32) -> Option<String>,
{
    let name = node.node_name();
    let id = node.u32_prop("reg").ok_or_else(|| missing(name, "reg"))?;
    let vc = node.u32_prop("vc").unwrap_or(0);
    let interface = node
        .u32_prop("interface")
        .and_then(|ph| resolve(ph))
        .ok_or_else(|| missing(name, "interface"))?;
    let sensor = node
        .u32_prop("sensor")
        .and_then(|ph| resolve(ph))
        .ok_or_else(|| missing(name, "sensor"))?;
    let pad = node.u32_prop("sensor-pad").unwrap_or(vc);

    Ok(PortDesc {
        id,
        vc,
        interface,
        sensor: EndpointDesc { node: sensor, pad },
        hcrop: parse_hcrop(node),
        timing: parse_timing(node),
    })
}

pub fn parse_gmsl_params<P: PropertySource>(node: &P) -> Result<GmslParams, Error> {
    let name = node.node_name();
    let defaults = GmslParams::default();
    let des_addr = node.u32_prop("reg").ok_or_else(|| missing(name, "reg"))?;

    let params = GmslParams {
        des_addr: des_addr as u16,
        ser_base: node
            .u32_prop("addr_ser")
            .map(|addr| addr as u16)
            .unwrap_or(defaults.ser_base),
        isp_base: node
            .u32_prop("addr_isp")
            .map(|addr| addr as u16)
            .unwrap_or(defaults.isp_base),
        sec_9286: node.u32_prop("sec_9286").map(|val| val > 0).unwrap_or(false),
        sec_9286_shift: node
            .u32_prop("sec_9286_shift")
            .map(|val| val as u16)
            .unwrap_or(defaults.sec_9286_shift),
        link_count: node.u32_prop("link_count").unwrap_or(defaults.link_count),
        lanes: node.u32_prop("lanes").unwrap_or(defaults.lanes),
        frame_sync: node.u32_prop("sync").map(|val| val > 0).unwrap_or(defaults.frame_sync),
        rotation: node
            .u32_prop("rotation")
            .map(Rotation::from_degrees)
            .unwrap_or_default(),
    };
    Ok(params)
}

/// The IPIs for the ports connected to MIPI CSI-2 host, one for each virtual channel.
pub fn ipis_for<P: PropertySource>(node: &P, ports: &[PortDesc]) -> Vec<IpiConfig> {
    let name = node.node_name();
    ports
        .iter()
        .filter(|port| port.interface == name)
        .map(|port| IpiConfig {
            vc: port.vc,
            code: MbusCode::Uyvy8_2x8,
            controller_timing: node.u32_prop("ipi-controller-timing").unwrap_or(0) > 0,
            hsa: node.u32_prop("ipi-hsa").unwrap_or(0),
            hbp: node.u32_prop("ipi-hbp").unwrap_or(0),
            hsd: node.u32_prop("ipi-hsd").unwrap_or(0),
            adv_features: node.u32_prop("ipi-adv-features").unwrap_or(0),
        })
        .collect()
}

pub fn parse_mipi_config<P: PropertySource>(
    node: &P,
    host_id: u32,
    ports: &[PortDesc],
) -> Result<MipiCsi2Config, Error> {
    let name = node.node_name();
    Ok(MipiCsi2Config {
        host_id: node.u32_prop("host_id").unwrap_or(host_id),
        lanes: node.u32_prop("lanes").ok_or_else(|| missing(name, "lanes"))?,
        lane_rate: node
            .u32_prop("lane-rate")
            .ok_or_else(|| missing(name, "lane-rate"))?,
        ipis: ipis_for(node, ports),
        dispmux: DispmuxField {
            offset: node.u32_prop("dispmux-offset").unwrap_or(0),
            shift: node.u32_prop("dispmux-shift").unwrap_or(0),
        },
    })
}

/// The number of I2C adapter from the alias like `i2c3`.
fn i2c_bus_number(alias: &str) -> Option<u32> {
    alias
        .strip_prefix("i2c")
        .and_then(|num| num.parse::<u32>().ok())
}

fn is_compatible(node: &FdtNode, compatible: &str) -> bool {
    node.compatible()
        .map(|c| c.all().any(|c| c == compatible))
        .unwrap_or(false)
}

fn regions(node: &FdtNode) -> Vec<RegRegion> {
    node.reg()
        .map(|iter| {
            iter.map(|region| RegRegion {
                base: region.starting_address as usize as u64,
                size: region.size.unwrap_or(0),
            })
            .collect()
        })
        .unwrap_or_default()
}

impl BoardDesc {
    /// Parse the description of CSI host from device tree blob.
    pub fn parse(dtb: &[u8], host_id: u32) -> Result<Self, Error> {
        let fdt = Fdt::new(dtb).map_err(|e| {
            let msg = format!("Malformed device tree blob: {:?}", e);
            Error::new(FileError::Inval, &msg)
        })?;

        let node = fdt
            .all_nodes()
            .find(|node| {
                is_compatible(node, CSI_COMPATIBLE) && node.u32_prop("host_id") == Some(host_id)
            })
            .ok_or_else(|| {
                let msg = format!("CSI host {} is not found", host_id);
                Error::new(FileError::Nodev, &msg)
            })?;

        let regs = regions(&node)
            .first()
            .copied()
            .ok_or_else(|| missing(node.name, "reg"))?;

        let resolve = |ph: u32| fdt.find_phandle(ph).map(|n| n.name.to_string());
        let ports = node
            .children()
            .filter(|child| child.name.starts_with("port"))
            .map(|child| parse_port(&child, resolve))
            .collect::<Result<Vec<_>, Error>>()?;

        let csi = CsiNodeDesc {
            host_id,
            bus: parse_bus_type(&node)?,
            sync: node.u32_prop("sync").map(|val| val > 0).unwrap_or(false),
            ports,
        };
        csi.validate()?;

        // The children of I2C adapters and the number of adapter.
        let mut i2c_nodes = HashMap::new();
        if let Some(aliases) = fdt.aliases() {
            aliases
                .all()
                .filter_map(|(alias, path)| i2c_bus_number(alias).map(|bus| (bus, path)))
                .filter_map(|(bus, path)| fdt.find_node(path).map(|adapter| (bus, adapter)))
                .for_each(|(bus, adapter)| {
                    adapter.children().for_each(|child| {
                        i2c_nodes.insert(child.name, (bus, child));
                    });
                });
        }

        let mut interfaces: Vec<InterfaceDesc> = Vec::new();
        csi.ports.iter().try_for_each(|port| {
            if interfaces.iter().any(|i| i.name() == port.interface) {
                return Ok(());
            }
            let iface = fdt
                .all_nodes()
                .find(|n| n.name == port.interface)
                .ok_or_else(|| {
                    let msg = format!("Interface {} is not found", port.interface);
                    Error::new(FileError::Nodev, &msg)
                })?;

            let desc = if is_compatible(&iface, MIPI_CSI2_COMPATIBLE) {
                let regs = regions(&iface);
                if regs.len() < 2 {
                    Err(missing(iface.name, "reg for dispmux"))?;
                }
                InterfaceDesc::Mipi(MipiDesc {
                    name: iface.name.to_string(),
                    regs: regs[0],
                    dispmux: regs[1],
                    config: parse_mipi_config(&iface, host_id, &csi.ports)?,
                })
            } else if is_compatible(&iface, PARALLEL_COMPATIBLE) {
                InterfaceDesc::Parallel {
                    name: iface.name.to_string(),
                    host_id,
                }
            } else {
                let msg = format!("Unsupported interface: {}", iface.name);
                Err(Error::new(FileError::Inval, &msg))?
            };
            interfaces.push(desc);
            Ok::<(), Error>(())
        })?;

        let mut sensors: Vec<SensorDesc> = Vec::new();
        csi.ports.iter().try_for_each(|port| {
            let name = port.sensor.node.as_str();
            if sensors.iter().any(|s| s.name == name) {
                return Ok(());
            }
            let (bus, sensor) = i2c_nodes.get(name).ok_or_else(|| {
                let msg = format!("Sensor {} is not in any I2C adapter", name);
                Error::new(FileError::Nodev, &msg)
            })?;
            let chip = sensor
                .compatible()
                .and_then(|c| c.all().find_map(ChipKind::from_compatible))
                .ok_or_else(|| {
                    let msg = format!("Unsupported sensor: {}", name);
                    Error::new(FileError::Inval, &msg)
                })?;

            let poc = match sensor.u32_prop("semidrive,poc") {
                Some(ph) => {
                    let poc = fdt.find_phandle(ph).ok_or_else(|| missing(name, "semidrive,poc"))?;
                    let (poc_bus, _) = i2c_nodes
                        .get(poc.name)
                        .ok_or_else(|| missing(poc.name, "I2C adapter"))?;
                    let variant = poc
                        .compatible()
                        .and_then(|c| c.all().find_map(poc_variant))
                        .ok_or_else(|| missing(poc.name, "compatible"))?;
                    let addr = poc.u32_prop("reg").ok_or_else(|| missing(poc.name, "reg"))?;
                    Some(PocDesc {
                        bus: *poc_bus,
                        addr: addr as u16,
                        variant,
                    })
                }
                None => None,
            };

            sensors.push(SensorDesc {
                name: name.to_string(),
                chip,
                bus: *bus,
                params: parse_gmsl_params(sensor)?,
                poc,
                pwdn_gpio: sensor.u32_prop("pwdn-gpio"),
            });
            Ok::<(), Error>(())
        })?;

        debug!(
            host = host_id,
            interfaces = interfaces.len(),
            sensors = sensors.len(),
        );

        Ok(Self {
            regs,
            csi,
            interfaces,
            sensors,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct FakeNode {
        name: String,
        u32s: HashMap<&'static str, u32>,
        strs: HashMap<&'static str, &'static str>,
    }

    impl FakeNode {
        fn new(name: &str, u32s: &[(&'static str, u32)]) -> Self {
            Self {
                name: name.to_string(),
                u32s: u32s.iter().copied().collect(),
                ..Default::default()
            }
        }
    }

    impl PropertySource for FakeNode {
        fn node_name(&self) -> &str {
            &self.name
        }

        fn u32_prop(&self, name: &str) -> Option<u32> {
            self.u32s.get(name).copied()
        }

        fn str_prop(&self, name: &str) -> Option<&str> {
            self.strs.get(name).copied()
        }
    }

    fn resolve(ph: u32) -> Option<String> {
        match ph {
            1 => Some("mipi-csi2@30c00000".to_string()),
            2 => Some("max9286@48".to_string()),
            _ => None,
        }
    }

    #[test]
    fn port_with_hcrop() {
        let node = FakeNode::new(
            "port@1",
            &[
                ("reg", 1),
                ("vc", 1),
                ("interface", 1),
                ("sensor", 2),
                ("hcrop_back", 8),
                ("hcrop_front", 16),
            ],
        );
        let port = parse_port(&node, resolve).unwrap();
        assert_eq!(port.id, 1);
        assert_eq!(port.vc, 1);
        assert_eq!(port.interface, "mipi-csi2@30c00000");
        assert_eq!(port.sensor.node, "max9286@48");
        assert_eq!(port.sensor.pad, 1);
        assert_eq!(port.hcrop.back, 8);
        assert_eq!(port.hcrop.front, 16);
        assert_eq!(port.hcrop.top_front, 0);
        assert!(port.hcrop.is_active());

        let node = FakeNode::new("port@2", &[("reg", 2), ("interface", 1), ("sensor", 3)]);
        let err = parse_port(&node, resolve).unwrap_err();
        assert_eq!(err.kind::<FileError>(), Some(FileError::Inval));
    }

    #[test]
    fn deserializer_properties() {
        let node = FakeNode::new(
            "max9286@4c",
            &[
                ("reg", 0x4c),
                ("sec_9286", 1),
                ("sec_9286_shift", 8),
                ("link_count", 2),
                ("rotation", 180),
            ],
        );
        let params = parse_gmsl_params(&node).unwrap();
        assert_eq!(params.des_addr, 0x4c);
        assert_eq!(params.ser_addr(1), 0x69);
        assert_eq!(params.isp_addr(1), 0x39);
        assert_eq!(params.link_count, 2);
        assert_eq!(params.rotation, Rotation::UpsideDown);
        assert!(params.frame_sync);

        let node = FakeNode::new("max96706@78", &[("reg", 0x78), ("rotation", 90), ("sync", 0)]);
        let params = parse_gmsl_params(&node).unwrap();
        assert_eq!(params.rotation, Rotation::Normal);
        assert!(!params.frame_sync);
        assert_eq!(params.ser_addr(0), 0x60);
    }

    #[test]
    fn bus_type_property() {
        let mut node = FakeNode::new("csi@30cc0000", &[]);
        assert_eq!(parse_bus_type(&node).unwrap(), BusType::MipiCsi2);

        node.strs.insert("mbus-type", "bt656");
        assert_eq!(parse_bus_type(&node).unwrap(), BusType::Bt656);

        node.strs.insert("mbus-type", "dc2csi-2");
        assert_eq!(parse_bus_type(&node).unwrap(), BusType::Dc2Csi2);

        node.strs.insert("mbus-type", "hdmi");
        assert!(parse_bus_type(&node).is_err());
    }

    #[test]
    fn ipis_for_virtual_channels() {
        let ports: Vec<_> = (0..3)
            .map(|i| PortDesc {
                id: i,
                vc: i,
                interface: "mipi-csi2@30c00000".to_string(),
                sensor: EndpointDesc {
                    node: "max9286@48".to_string(),
                    pad: i,
                },
                ..Default::default()
            })
            .collect();
        let node = FakeNode::new(
            "mipi-csi2@30c00000",
            &[("lanes", 4), ("lane-rate", 150), ("dispmux-shift", 8)],
        );
        let config = parse_mipi_config(&node, 1, &ports).unwrap();
        assert_eq!(config.host_id, 1);
        assert_eq!(config.ipis.len(), 3);
        assert_eq!(config.ipis[2].vc, 2);
        assert_eq!(config.ipis[2].code, MbusCode::Uyvy8_2x8);
        assert_eq!(config.dispmux.shift, 8);

        let node = FakeNode::new("mipi-csi2@30c00000", &[("lanes", 4)]);
        assert!(parse_mipi_config(&node, 1, &ports).is_err());
    }

    #[test]
    fn i2c_alias() {
        assert_eq!(i2c_bus_number("i2c3"), Some(3));
        assert_eq!(i2c_bus_number("i2c12"), Some(12));
        assert_eq!(i2c_bus_number("serial0"), None);
        assert_eq!(i2c_bus_number("i2c"), None);
    }
}
