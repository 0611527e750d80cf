// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual interface descriptors, as handed to us by the compute service.
//!
//! [`VifDescriptor`] is the loosely-typed form which arrives over the plugin
//! boundary. It is converted into a [`Vif`] before anything is done with it,
//! and that conversion is where unsupported or malformed VIFs are rejected.

use camino::Utf8PathBuf;
use ipnetwork::IpNetwork;
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Length the compute service truncates generated device names to.
pub const NIC_NAME_LEN: usize = 14;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VifError {
    #[error("VIF {id} has unsupported type `{vif_type}`")]
    Unsupported { id: String, vif_type: String },

    #[error("VIF {id} is invalid: {reason}")]
    Invalid { id: String, reason: String },
}

impl VifError {
    pub fn vif_id(&self) -> &str {
        match self {
            VifError::Unsupported { id, .. } | VifError::Invalid { id, .. } => {
                id
            }
        }
    }
}

/// A MAC address, rendered in the lower-case colon-separated form the
/// vRouter tooling expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MacAddr(pub MacAddr6);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.as_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = macaddr::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MacAddr6::from_str(s).map(MacAddr)
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A fixed IP assigned to the port within a subnet.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct FixedIp {
    pub address: IpAddr,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Subnet {
    pub cidr: Option<IpNetwork>,
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub ips: Vec<FixedIp>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Network {
    pub id: String,
    pub bridge: Option<String>,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

impl Network {
    fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.subnets.iter().flat_map(|s| s.ips.iter().map(|ip| ip.address))
    }

    /// The first IPv4 address assigned on any subnet.
    pub fn ipv4_address(&self) -> Option<Ipv4Addr> {
        self.addresses().find_map(|ip| match ip {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
    }

    /// The first IPv6 address assigned on any subnet.
    pub fn ipv6_address(&self) -> Option<Ipv6Addr> {
        self.addresses().find_map(|ip| match ip {
            IpAddr::V6(ip) => Some(ip),
            IpAddr::V4(_) => None,
        })
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DatapathOffload {
    pub representor_name: Option<String>,
    pub representor_address: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PortProfile {
    pub datapath_offload: Option<DatapathOffload>,
}

/// A VIF as delivered across the plugin boundary.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct VifDescriptor {
    pub id: String,
    /// Object type of the VIF, e.g. `VIFGeneric` or `vhostuser`.
    pub vif_type: String,
    /// MAC address of the guest side of the port.
    pub address: String,
    pub vif_name: Option<String>,
    pub network: Network,
    /// vhost-user socket path.
    pub path: Option<Utf8PathBuf>,
    /// vhost-user mode, `client` or `server`.
    pub mode: Option<String>,
    /// PCI address of a host device.
    pub dev_address: Option<String>,
    pub dev_type: Option<String>,
    pub port_profile: Option<PortProfile>,
}

/// vhost-user socket mode of the guest side of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VhostUserMode {
    Client,
    Server,
}

impl VhostUserMode {
    /// Encoding understood by the vRouter.
    pub fn as_u8(&self) -> u8 {
        match self {
            VhostUserMode::Client => 0,
            VhostUserMode::Server => 1,
        }
    }
}

impl FromStr for VhostUserMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(VhostUserMode::Client),
            "server" => Ok(VhostUserMode::Server),
            other => Err(format!("unknown vhost-user mode `{other}`")),
        }
    }
}

impl fmt::Display for VhostUserMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VhostUserMode::Client => write!(f, "client"),
            VhostUserMode::Server => write!(f, "server"),
        }
    }
}

/// The host-side representor of an offloaded virtual function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Representor {
    pub name: Option<String>,
    /// PCI address of the representor.
    pub address: String,
}

/// Fields common to every kind of VIF.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VifCommon {
    pub id: String,
    pub mac: MacAddr,
    /// Name of the host-side device (TAP name).
    pub dev_name: String,
    pub network: Network,
}

/// A plain VIF backed by a kernel TAP device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VifGeneric {
    pub common: VifCommon,
}

/// A VIF backed by a vhost-user socket, possibly accelerated by a
/// virtio-forwarder offload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VifVHostUser {
    pub common: VifCommon,
    pub path: Utf8PathBuf,
    pub mode: VhostUserMode,
    pub offload: Option<Representor>,
}

/// A passthrough VIF whose datapath is offloaded to a NIC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VifHostDevice {
    pub common: VifCommon,
    pub dev_address: Option<String>,
    pub representor: Representor,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Vif {
    Generic(VifGeneric),
    VHostUser(VifVHostUser),
    HostDevice(VifHostDevice),
}

impl Vif {
    pub fn common(&self) -> &VifCommon {
        match self {
            Vif::Generic(v) => &v.common,
            Vif::VHostUser(v) => &v.common,
            Vif::HostDevice(v) => &v.common,
        }
    }

    pub fn id(&self) -> &str {
        &self.common().id
    }

    pub fn dev_name(&self) -> &str {
        &self.common().dev_name
    }

    /// The representor, if this VIF's datapath is offloaded.
    pub fn representor(&self) -> Option<&Representor> {
        match self {
            Vif::Generic(_) => None,
            Vif::VHostUser(v) => v.offload.as_ref(),
            Vif::HostDevice(v) => Some(&v.representor),
        }
    }
}

/// The device name the compute service uses when a VIF carries none.
pub fn default_dev_name(vif_id: &str) -> String {
    format!("tap{vif_id}").chars().take(NIC_NAME_LEN).collect()
}

enum VifKind {
    Generic,
    VHostUser,
    HostDevice,
}

/// Accepts the plain tags and the host framework's object names (for
/// instance `VIFVHostUser`), ignoring case.
fn classify(vif_type: &str) -> Option<VifKind> {
    let lower = vif_type.to_ascii_lowercase();
    let kind = lower.strip_prefix("vif").unwrap_or(&lower);
    match kind {
        "generic" => Some(VifKind::Generic),
        "vhostuser" => Some(VifKind::VHostUser),
        "hostdevice" => Some(VifKind::HostDevice),
        _ => None,
    }
}

impl TryFrom<&VifDescriptor> for Vif {
    type Error = VifError;

    fn try_from(desc: &VifDescriptor) -> Result<Self, Self::Error> {
        let unsupported = || VifError::Unsupported {
            id: desc.id.clone(),
            vif_type: desc.vif_type.clone(),
        };
        let invalid = |reason: String| VifError::Invalid {
            id: desc.id.clone(),
            reason,
        };

        let kind = classify(&desc.vif_type).ok_or_else(unsupported)?;

        let mac = desc.address.parse::<MacAddr>().map_err(|err| {
            invalid(format!("bad MAC address `{}`: {err}", desc.address))
        })?;
        let dev_name = match &desc.vif_name {
            Some(name) if name.is_empty() => {
                return Err(invalid("empty device name".to_string()));
            }
            Some(name) => name.clone(),
            None => default_dev_name(&desc.id),
        };
        let common = VifCommon {
            id: desc.id.clone(),
            mac,
            dev_name,
            network: desc.network.clone(),
        };
        let representor = desc
            .port_profile
            .as_ref()
            .and_then(|p| p.datapath_offload.as_ref())
            .and_then(|o| {
                o.representor_address.as_ref().map(|address| Representor {
                    name: o.representor_name.clone(),
                    address: address.clone(),
                })
            });

        match kind {
            VifKind::Generic => Ok(Vif::Generic(VifGeneric { common })),
            VifKind::VHostUser => {
                let mode = match &desc.mode {
                    Some(mode) => mode.parse().map_err(invalid)?,
                    None => VhostUserMode::Client,
                };
                let path = desc.path.clone().ok_or_else(|| {
                    invalid("vhost-user VIF has no socket path".to_string())
                })?;
                Ok(Vif::VHostUser(VifVHostUser {
                    common,
                    path,
                    mode,
                    offload: representor,
                }))
            }
            // Without a representor there is no way to attach a passthrough
            // device to the vRouter.
            VifKind::HostDevice => match representor {
                Some(representor) => Ok(Vif::HostDevice(VifHostDevice {
                    common,
                    dev_address: desc.dev_address.clone(),
                    representor,
                })),
                None => Err(unsupported()),
            },
        }
    }
}
