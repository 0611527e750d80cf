// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest-side interface configuration for a plugged VIF.

use crate::config::Config;
use crate::port::userspace_vhost_socket;
use crate::vif::{MacAddr, VhostUserMode, Vif, VifError};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use slog::{warn, Logger};
use std::collections::BTreeMap;
use std::fmt::Write;

pub const DEFAULT_NIC_MODEL: &str = "virtio";
const VIF_MODEL_PROPERTY: &str = "hw_vif_model";

/// Image properties relevant to interface configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ImageMeta {
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// The instance's flavor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct InstanceType {
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
}

/// Traffic shaping in one direction, in the units libvirt uses (KiB/s and
/// KiB).
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct Bandwidth {
    pub average: Option<u64>,
    pub peak: Option<u64>,
    pub burst: Option<u64>,
}

impl Bandwidth {
    fn is_empty(&self) -> bool {
        self.average.is_none() && self.peak.is_none() && self.burst.is_none()
    }
}

/// A PCI address in `domain:bus:slot.function` form.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl PciAddress {
    pub fn parse(s: &str) -> Option<Self> {
        let (domain, rest) = s.split_once(':')?;
        let (bus, rest) = rest.split_once(':')?;
        let (slot, function) = rest.split_once('.')?;
        Some(PciAddress {
            domain: u16::from_str_radix(domain, 16).ok()?,
            bus: u8::from_str_radix(bus, 16).ok()?,
            slot: u8::from_str_radix(slot, 16).ok()?,
            function: u8::from_str_radix(function, 16).ok()?,
        })
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InterfaceBackend {
    /// A TAP device the hypervisor opens by name.
    Ethernet { target_dev: String },
    /// A container interface attached to a host bridge.
    Bridge { source_bridge: String, target_dev: String },
    /// A vhost-user socket; `mode` is the hypervisor's side.
    VHostUser { path: Utf8PathBuf, mode: VhostUserMode },
    /// A PCI function passed through to the guest.
    HostDev { address: PciAddress },
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub mac: MacAddr,
    pub model: Option<String>,
    pub backend: InterfaceBackend,
    pub inbound: Bandwidth,
    pub outbound: Bandwidth,
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn write_bandwidth(out: &mut String, element: &str, bw: &Bandwidth) {
    let _ = write!(out, "    <{element}");
    for (name, value) in
        [("average", bw.average), ("peak", bw.peak), ("burst", bw.burst)]
    {
        if let Some(value) = value {
            let _ = write!(out, " {name}=\"{value}\"");
        }
    }
    out.push_str("/>\n");
}

impl InterfaceConfig {
    /// Render the libvirt `<interface>` element for this interface.
    pub fn to_libvirt_xml(&self) -> String {
        let mut out = String::new();
        let _ = match &self.backend {
            InterfaceBackend::Ethernet { .. } => {
                writeln!(out, "<interface type=\"ethernet\">")
            }
            InterfaceBackend::Bridge { .. } => {
                writeln!(out, "<interface type=\"bridge\">")
            }
            InterfaceBackend::VHostUser { .. } => {
                writeln!(out, "<interface type=\"vhostuser\">")
            }
            InterfaceBackend::HostDev { .. } => {
                writeln!(out, "<interface type=\"hostdev\" managed=\"yes\">")
            }
        };
        let _ = writeln!(out, "  <mac address=\"{}\"/>", self.mac);
        if let Some(model) = &self.model {
            let _ = writeln!(out, "  <model type=\"{}\"/>", escape(model));
        }
        let _ = match &self.backend {
            InterfaceBackend::Ethernet { target_dev } => {
                writeln!(out, "  <target dev=\"{}\"/>", escape(target_dev))
            }
            InterfaceBackend::Bridge { source_bridge, target_dev } => {
                writeln!(
                    out,
                    "  <source bridge=\"{}\"/>\n  <target dev=\"{}\"/>",
                    escape(source_bridge),
                    escape(target_dev)
                )
            }
            InterfaceBackend::VHostUser { path, mode } => writeln!(
                out,
                "  <source type=\"unix\" path=\"{}\" mode=\"{mode}\"/>",
                escape(path.as_str())
            ),
            InterfaceBackend::HostDev { address } => writeln!(
                out,
                "  <source>\n    <address type=\"pci\" domain=\"0x{:04x}\" \
                 bus=\"0x{:02x}\" slot=\"0x{:02x}\" function=\"0x{:x}\"/>\n  \
                 </source>",
                address.domain, address.bus, address.slot, address.function
            ),
        };
        if !self.inbound.is_empty() || !self.outbound.is_empty() {
            out.push_str("  <bandwidth>\n");
            if !self.inbound.is_empty() {
                write_bandwidth(&mut out, "inbound", &self.inbound);
            }
            if !self.outbound.is_empty() {
                write_bandwidth(&mut out, "outbound", &self.outbound);
            }
            out.push_str("  </bandwidth>\n");
        }
        out.push_str("</interface>\n");
        out
    }
}

fn bandwidth(
    log: &Logger,
    instance_type: &InstanceType,
    direction: &str,
) -> Bandwidth {
    let get = |what: &str| {
        let key = format!("quota:vif_{direction}_{what}");
        let value = instance_type.extra_specs.get(&key)?;
        match value.parse::<u64>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(
                    log,
                    "ignoring non-numeric bandwidth quota";
                    "key" => key,
                    "value" => value,
                );
                None
            }
        }
    };
    Bandwidth {
        average: get("average"),
        peak: get("peak"),
        burst: get("burst"),
    }
}

/// Build the guest interface configuration for `vif`.
///
/// `bridge` is the host bridge the interface attaches to, for container
/// guests.
pub fn interface_config(
    log: &Logger,
    config: &Config,
    vif: &Vif,
    bridge: Option<&str>,
    image_meta: &ImageMeta,
    instance_type: &InstanceType,
) -> Result<InterfaceConfig, VifError> {
    let common = vif.common();
    let backend = match (vif, bridge) {
        (Vif::Generic(_), _) if config.use_userspace_vhost => {
            InterfaceBackend::VHostUser {
                path: userspace_vhost_socket(config, &common.dev_name),
                mode: VhostUserMode::Client,
            }
        }
        (Vif::Generic(_), Some(bridge)) => InterfaceBackend::Bridge {
            source_bridge: bridge.to_string(),
            target_dev: common.dev_name.clone(),
        },
        (Vif::Generic(_), None) => InterfaceBackend::Ethernet {
            target_dev: common.dev_name.clone(),
        },
        (Vif::VHostUser(v), _) => {
            InterfaceBackend::VHostUser { path: v.path.clone(), mode: v.mode }
        }
        (Vif::HostDevice(v), _) => {
            let raw = v
                .dev_address
                .as_deref()
                .unwrap_or(v.representor.address.as_str());
            let address =
                PciAddress::parse(raw).ok_or_else(|| VifError::Invalid {
                    id: common.id.clone(),
                    reason: format!("bad PCI address `{raw}`"),
                })?;
            InterfaceBackend::HostDev { address }
        }
    };

    let model = match backend {
        InterfaceBackend::HostDev { .. } => None,
        _ => Some(
            image_meta
                .properties
                .get(VIF_MODEL_PROPERTY)
                .cloned()
                .unwrap_or_else(|| DEFAULT_NIC_MODEL.to_string()),
        ),
    };

    Ok(InterfaceConfig {
        mac: common.mac,
        model,
        backend,
        inbound: bandwidth(log, instance_type, "inbound"),
        outbound: bandwidth(log, instance_type, "outbound"),
    })
}
