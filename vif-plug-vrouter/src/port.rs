// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registration records describing a port to the vRouter.

use crate::config::Config;
use crate::instance::InstanceInfo;
use crate::vif::{MacAddr, VhostUserMode, Vif};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum PortType {
    #[serde(rename = "NovaVMPort")]
    NovaVmPort,
    NameSpacePort,
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortType::NovaVmPort => write!(f, "NovaVMPort"),
            PortType::NameSpacePort => write!(f, "NameSpacePort"),
        }
    }
}

/// Selects how an offloaded port's datapath is attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VnicType {
    /// Passthrough of the virtual function to the guest.
    Direct,
    /// A vhost-user socket relayed to the virtual function.
    VirtioForwarder,
}

impl fmt::Display for VnicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VnicType::Direct => write!(f, "direct"),
            VnicType::VirtioForwarder => write!(f, "virtio-forwarder"),
        }
    }
}

/// Transport of the port, when it isn't a kernel TAP.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum PortVifType {
    VhostUser,
}

impl fmt::Display for PortVifType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortVifType::VhostUser => write!(f, "VhostUser"),
        }
    }
}

/// Socket path used for a generic VIF when the vRouter runs in userspace.
pub fn userspace_vhost_socket(config: &Config, dev_name: &str) -> Utf8PathBuf {
    config.userspace_vhost_socket_dir.join(format!("uvh_vif_{dev_name}"))
}

/// Everything the vRouter needs to know to add a port.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PortRecord {
    pub vif_id: String,
    pub instance_uuid: String,
    pub vn_uuid: String,
    pub project_id: String,
    pub ip_address: Ipv4Addr,
    pub ip6_address: Option<Ipv6Addr>,
    pub vm_name: String,
    pub mac: MacAddr,
    pub tap_name: String,
    pub port_type: PortType,
    pub vif_type: Option<PortVifType>,
    pub vnic_type: Option<VnicType>,
    pub pci_dev: Option<String>,
    pub vhostuser_socket: Option<Utf8PathBuf>,
    pub vhostuser_mode: Option<u8>,
    pub hostname: Option<String>,
    pub host: Option<String>,
}

impl PortRecord {
    /// Derive the registration record for `vif`, attached through the host
    /// device `tap_name`.
    pub fn derive(
        vif: &Vif,
        instance: &InstanceInfo,
        config: &Config,
        tap_name: &str,
    ) -> Self {
        let common = vif.common();
        let port_type = if config.virt_type.is_container() {
            PortType::NameSpacePort
        } else {
            PortType::NovaVmPort
        };

        let mut record = PortRecord {
            vif_id: common.id.clone(),
            instance_uuid: instance.uuid.clone(),
            vn_uuid: common.network.id.clone(),
            project_id: instance.project_id.clone(),
            ip_address: common
                .network
                .ipv4_address()
                .unwrap_or(Ipv4Addr::UNSPECIFIED),
            ip6_address: common.network.ipv6_address(),
            vm_name: instance.name.clone(),
            mac: common.mac,
            tap_name: tap_name.to_string(),
            port_type,
            vif_type: None,
            vnic_type: None,
            pci_dev: None,
            vhostuser_socket: None,
            vhostuser_mode: None,
            hostname: instance.hostname.clone(),
            host: instance.host.clone(),
        };

        match vif {
            Vif::Generic(_) if config.use_userspace_vhost => {
                record.vif_type = Some(PortVifType::VhostUser);
                record.vhostuser_socket =
                    Some(userspace_vhost_socket(config, &common.dev_name));
                record.vhostuser_mode = Some(VhostUserMode::Client.as_u8());
            }
            Vif::Generic(_) => {}
            Vif::VHostUser(v) => {
                record.vif_type = Some(PortVifType::VhostUser);
                record.vhostuser_socket = Some(v.path.clone());
                record.vhostuser_mode = Some(v.mode.as_u8());
                if let Some(representor) = &v.offload {
                    record.vnic_type = Some(VnicType::VirtioForwarder);
                    record.pci_dev = Some(representor.address.clone());
                }
            }
            Vif::HostDevice(v) => {
                record.vnic_type = Some(VnicType::Direct);
                record.pci_dev = Some(v.representor.address.clone());
            }
        }
        record
    }
}

/// Everything the vRouter needs to locate a port being deleted.
///
/// Offloaded ports are identified by their offload parameters as well as
/// their id; every other port by id alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortDeletion {
    pub vif_id: String,
    pub tap_name: Option<String>,
    pub vnic_type: Option<VnicType>,
    pub pci_dev: Option<String>,
    pub vhostuser_socket: Option<Utf8PathBuf>,
    pub vhostuser_mode: Option<u8>,
}

impl PortDeletion {
    pub fn derive(vif: &Vif) -> Self {
        let vif_id = vif.id().to_string();
        match vif {
            Vif::VHostUser(v) => match &v.offload {
                Some(representor) => PortDeletion {
                    vif_id,
                    tap_name: Some(v.common.dev_name.clone()),
                    vnic_type: Some(VnicType::VirtioForwarder),
                    pci_dev: Some(representor.address.clone()),
                    vhostuser_socket: Some(v.path.clone()),
                    vhostuser_mode: Some(v.mode.as_u8()),
                },
                None => PortDeletion { vif_id, ..Default::default() },
            },
            Vif::HostDevice(v) => PortDeletion {
                vif_id,
                vnic_type: Some(VnicType::Direct),
                pci_dev: Some(v.representor.address.clone()),
                ..Default::default()
            },
            Vif::Generic(_) => PortDeletion { vif_id, ..Default::default() },
        }
    }
}
