// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The vRouter VIF plugin: plugging and unplugging guest ports.

use crate::config::Config;
use crate::instance::InstanceInfo;
use crate::interface::{
    interface_config, ImageMeta, InstanceType, InterfaceConfig,
};
use crate::port::{PortDeletion, PortRecord};
use crate::port_control::{BoxedPortControl, PortControlError};
use crate::vif::{Vif, VifDescriptor, VifError};
use async_trait::async_trait;
use linux_utils::destructor::{Deletable, Destructor};
use linux_utils::host::BoxedExecutor;
use linux_utils::link::{IpLink, LinkError};
use linux_utils::RootHelper;
use serde::Serialize;
use slog::{debug, error, info, warn, Logger};
use slog_error_chain::InlineErrorChain;

pub const PLUGIN_NAME: &str = "vrouter";
pub const CONTRAIL_PLUGIN_NAME: &str = "contrail_vrouter";

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct HostVifInfo {
    pub vif_object_name: String,
    pub min_version: String,
    pub max_version: String,
}

impl HostVifInfo {
    fn v1(name: &str) -> Self {
        Self {
            vif_object_name: name.to_string(),
            min_version: "1.0".to_string(),
            max_version: "1.0".to_string(),
        }
    }
}

/// What a plugin advertises to the compute service.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct HostPluginInfo {
    pub plugin_name: String,
    pub vif_info: Vec<HostVifInfo>,
}

#[derive(thiserror::Error, Debug)]
pub enum PlugError {
    #[error(transparent)]
    Vif(#[from] VifError),

    #[error(
        "Failed to set up local device for VIF {vif_id} of instance \
         {instance_uuid}"
    )]
    Device {
        vif_id: String,
        instance_uuid: String,
        #[source]
        err: LinkError,
    },

    #[error(
        "Failed to register VIF {vif_id} of instance {instance_uuid} with \
         the vRouter"
    )]
    Registration {
        vif_id: String,
        instance_uuid: String,
        #[source]
        err: PortControlError,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum UnplugError {
    #[error(transparent)]
    Vif(#[from] VifError),

    #[error(
        "Failed to deregister VIF {vif_id} of instance {instance_uuid} from \
         the vRouter"
    )]
    Deregistration {
        vif_id: String,
        instance_uuid: String,
        #[source]
        err: PortControlError,
    },

    #[error(
        "Failed to remove local device for VIF {vif_id} of instance \
         {instance_uuid}"
    )]
    Device {
        vif_id: String,
        instance_uuid: String,
        #[source]
        err: LinkError,
    },

    #[error(
        "Failed to deregister VIF {vif_id} of instance {instance_uuid} ({}) \
         and to remove its local device",
        InlineErrorChain::new(.deregistration)
    )]
    Both {
        vif_id: String,
        instance_uuid: String,
        deregistration: PortControlError,
        #[source]
        device: LinkError,
    },
}

/// Kernel devices backing a VIF on this host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct LocalDevices {
    tap: Option<String>,
    bridge: Option<String>,
}

impl LocalDevices {
    fn is_empty(&self) -> bool {
        self.tap.is_none() && self.bridge.is_none()
    }
}

/// Removes the local devices of an unplugged VIF.
struct DeviceRemoval {
    link: IpLink,
    devices: LocalDevices,
    vif_id: String,
    instance_uuid: String,
}

impl DeviceRemoval {
    async fn remove(&self) -> Result<(), LinkError> {
        let mut result = Ok(());
        if let Some(bridge) = &self.devices.bridge {
            if let Err(err) = self.link.delete_bridge(bridge).await {
                result = Err(err);
            }
        }
        if let Some(tap) = &self.devices.tap {
            if let Err(err) = self.link.remove_tap_dev(tap).await {
                result = result.and(Err(err));
            }
        }
        result
    }
}

#[async_trait]
impl Deletable for DeviceRemoval {
    async fn delete(&self) -> Result<(), anyhow::Error> {
        self.remove().await.map_err(|err| {
            anyhow::Error::new(err).context(format!(
                "removing local devices of VIF {} of instance {}",
                self.vif_id, self.instance_uuid
            ))
        })
    }
}

/// The bridge a container guest's TAP is attached to.
pub fn bridge_name(dev_name: &str) -> String {
    let suffix: String = dev_name.chars().skip(3).collect();
    format!("br{suffix}")
}

/// Plugs VIFs into the vRouter.
pub struct VrouterPlugin {
    log: Logger,
    config: Config,
    link: IpLink,
    port_control: BoxedPortControl,
    destructor: Destructor<DeviceRemoval>,
}

impl VrouterPlugin {
    pub fn new(
        log: &Logger,
        config: Config,
        executor: BoxedExecutor,
        port_control: BoxedPortControl,
    ) -> Self {
        let log = log.new(slog::o!("component" => "VrouterPlugin"));
        let link = IpLink::new(
            log.new(slog::o!("component" => "IpLink")),
            executor,
            RootHelper::from(config.root_helper.clone()),
            config.sysfs_net_dir.clone(),
        );
        let destructor =
            Destructor::new(log.new(slog::o!("component" => "DeviceRemoval")));
        Self { log, config, link, port_control, destructor }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn describe() -> HostPluginInfo {
        HostPluginInfo {
            plugin_name: PLUGIN_NAME.to_string(),
            vif_info: vec![
                HostVifInfo::v1("VIFGeneric"),
                HostVifInfo::v1("VIFVHostUser"),
                HostVifInfo::v1("VIFHostDevice"),
            ],
        }
    }

    /// The `contrail_vrouter` alias, which only handles vhost-user VIFs.
    pub fn describe_contrail_vrouter() -> HostPluginInfo {
        HostPluginInfo {
            plugin_name: CONTRAIL_PLUGIN_NAME.to_string(),
            vif_info: vec![HostVifInfo::v1("VIFVHostUser")],
        }
    }

    fn local_devices(&self, vif: &Vif) -> LocalDevices {
        match vif {
            Vif::Generic(v) if !self.config.use_userspace_vhost => {
                let dev_name = &v.common.dev_name;
                LocalDevices {
                    tap: Some(dev_name.clone()),
                    bridge: self
                        .config
                        .virt_type
                        .is_container()
                        .then(|| bridge_name(dev_name)),
                }
            }
            _ => LocalDevices::default(),
        }
    }

    fn removal(
        &self,
        vif: &Vif,
        instance: &InstanceInfo,
        devices: LocalDevices,
    ) -> DeviceRemoval {
        DeviceRemoval {
            link: self.link.clone(),
            devices,
            vif_id: vif.id().to_string(),
            instance_uuid: instance.uuid.clone(),
        }
    }

    fn convert(
        &self,
        desc: &VifDescriptor,
        instance: &InstanceInfo,
    ) -> Result<Vif, VifError> {
        Vif::try_from(desc).inspect_err(|err| {
            error!(
                self.log,
                "Rejecting VIF";
                "vif_id" => &desc.id,
                "vif_type" => &desc.vif_type,
                "instance_uuid" => &instance.uuid,
                "error" => %err,
            );
        })
    }

    pub async fn plug(
        &self,
        desc: &VifDescriptor,
        instance: &InstanceInfo,
    ) -> Result<(), PlugError> {
        let vif = self.convert(desc, instance)?;
        self.plug_vif(&vif, instance).await
    }

    pub async fn plug_vif(
        &self,
        vif: &Vif,
        instance: &InstanceInfo,
    ) -> Result<(), PlugError> {
        let log = self.log.new(slog::o!(
            "vif_id" => vif.id().to_string(),
            "instance_uuid" => instance.uuid.clone(),
        ));
        let dev_name = vif.dev_name();
        if self.destructor.cancel(dev_name).await {
            info!(log, "Cancelled pending removal of device"; "device" => dev_name);
        }

        let devices = self.local_devices(vif);
        let device_err = |err: LinkError| {
            error!(
                log,
                "Failed while plugging VIF";
                "error" => %InlineErrorChain::new(&err),
            );
            PlugError::Device {
                vif_id: vif.id().to_string(),
                instance_uuid: instance.uuid.clone(),
                err,
            }
        };

        // Only devices made here are torn down again on failure.
        let mut created = LocalDevices::default();
        if let Some(tap) = &devices.tap {
            if !self.link.device_exists(tap) {
                created.tap = Some(tap.clone());
            }
            if let Err(err) = self
                .link
                .create_tap_dev(tap, None, instance.virtio_multiqueue)
                .await
            {
                self.rollback(&log, vif, instance, created).await;
                return Err(device_err(err));
            }
        }
        if let (Some(bridge), Some(tap)) = (&devices.bridge, &devices.tap) {
            if !self.link.device_exists(bridge) {
                created.bridge = Some(bridge.clone());
            }
            if let Err(err) = self.link.create_bridge(bridge, tap).await {
                self.rollback(&log, vif, instance, created).await;
                return Err(device_err(err));
            }
        }

        let tap_name = devices.bridge.as_deref().unwrap_or(dev_name);
        let record = PortRecord::derive(vif, instance, &self.config, tap_name);
        if let Err(err) = self.port_control.add_port(&record).await {
            error!(
                log,
                "Failed while plugging VIF";
                "error" => %InlineErrorChain::new(&err),
            );
            self.rollback(&log, vif, instance, created).await;
            return Err(PlugError::Registration {
                vif_id: vif.id().to_string(),
                instance_uuid: instance.uuid.clone(),
                err,
            });
        }

        info!(log, "Plugged VIF"; "device" => tap_name);
        Ok(())
    }

    async fn rollback(
        &self,
        log: &Logger,
        vif: &Vif,
        instance: &InstanceInfo,
        created: LocalDevices,
    ) {
        if created.is_empty() {
            return;
        }
        if let Err(err) = self.removal(vif, instance, created).remove().await {
            warn!(
                log,
                "Failed to remove devices after plug failure";
                "error" => %InlineErrorChain::new(&err),
            );
        }
    }

    pub async fn unplug(
        &self,
        desc: &VifDescriptor,
        instance: &InstanceInfo,
    ) -> Result<(), UnplugError> {
        let vif = self.convert(desc, instance)?;
        self.unplug_vif(&vif, instance).await
    }

    pub async fn unplug_vif(
        &self,
        vif: &Vif,
        instance: &InstanceInfo,
    ) -> Result<(), UnplugError> {
        let log = self.log.new(slog::o!(
            "vif_id" => vif.id().to_string(),
            "instance_uuid" => instance.uuid.clone(),
        ));

        let deregistration = self
            .port_control
            .delete_port(&PortDeletion::derive(vif))
            .await
            .inspect_err(|err| {
                error!(
                    log,
                    "Failed to deregister VIF";
                    "error" => %InlineErrorChain::new(err),
                );
            })
            .err();

        let devices = self.local_devices(vif);
        let device = if devices.is_empty() {
            None
        } else if self.config.defer_device_removal && !instance.rebuilding {
            debug!(
                log,
                "Deferring device removal";
                "delay" => ?self.config.device_removal_delay(),
            );
            self.destructor
                .enqueue_destroy(
                    vif.dev_name(),
                    self.removal(vif, instance, devices),
                    self.config.device_removal_delay(),
                )
                .await;
            None
        } else {
            self.removal(vif, instance, devices)
                .remove()
                .await
                .inspect_err(|err| {
                    error!(
                        log,
                        "Failed to remove local device";
                        "error" => %InlineErrorChain::new(err),
                    );
                })
                .err()
        };

        let vif_id = vif.id().to_string();
        let instance_uuid = instance.uuid.clone();
        match (deregistration, device) {
            (None, None) => {
                info!(log, "Unplugged VIF");
                Ok(())
            }
            (Some(err), None) => {
                Err(UnplugError::Deregistration { vif_id, instance_uuid, err })
            }
            (None, Some(err)) => {
                Err(UnplugError::Device { vif_id, instance_uuid, err })
            }
            (Some(deregistration), Some(device)) => Err(UnplugError::Both {
                vif_id,
                instance_uuid,
                deregistration,
                device,
            }),
        }
    }

    /// Guest interface configuration for `desc`.
    pub fn get_config(
        &self,
        instance: &InstanceInfo,
        desc: &VifDescriptor,
        image_meta: &ImageMeta,
        instance_type: &InstanceType,
    ) -> Result<InterfaceConfig, VifError> {
        let vif = self.convert(desc, instance)?;
        let bridge = self.local_devices(&vif).bridge;
        interface_config(
            &self.log,
            &self.config,
            &vif,
            bridge.as_deref(),
            image_meta,
            instance_type,
        )
    }

    /// Returns true if removal of `dev_name` is scheduled but hasn't run.
    pub async fn removal_pending(&self, dev_name: &str) -> bool {
        self.destructor.is_pending(dev_name).await
    }

    /// Waits for deferred device removals to finish.
    pub async fn shutdown(self) {
        if self.destructor.try_close().await.is_err() {
            warn!(self.log, "Device removal queue still in use at shutdown");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use camino_tempfile::Utf8TempDir;
    use linux_utils::host::{FakeExecutor, Output, OutputExt};

    #[test]
    fn bridge_name_replaces_tap_prefix() {
        assert_eq!(bridge_name("tapvif-1"), "brvif-1");
        assert_eq!(bridge_name("ta"), "br");
        // The prefix is counted in characters, not bytes.
        assert_eq!(bridge_name("täpabc"), "brabc");
        assert_eq!(bridge_name("tä"), "br");
        assert_ne!(bridge_name("täpabc"), bridge_name("täpxyz"));
    }

    #[tokio::test]
    async fn failed_removal_names_the_vif() {
        let log = Logger::root(slog::Discard, slog::o!());
        let sysfs = Utf8TempDir::new().unwrap();
        std::fs::create_dir(sysfs.path().join("tapvif-1")).unwrap();
        let executor = FakeExecutor::new(log.clone());
        executor.set_wait_handler(Box::new(|_| Output::failure()));

        let removal = DeviceRemoval {
            link: IpLink::new(
                log,
                executor.as_executor(),
                RootHelper::none(),
                sysfs.path().to_owned(),
            ),
            devices: LocalDevices {
                tap: Some("tapvif-1".to_string()),
                bridge: None,
            },
            vif_id: "vif-1".to_string(),
            instance_uuid: "i-1".to_string(),
        };
        let err = removal.delete().await.unwrap_err();
        let message = format!("{err:#}");
        assert!(
            message.starts_with(
                "removing local devices of VIF vif-1 of instance i-1: "
            ),
            "{message}"
        );
    }

    #[test]
    fn contrail_alias_only_handles_vhostuser() {
        let info = VrouterPlugin::describe_contrail_vrouter();
        assert_eq!(info.plugin_name, "contrail_vrouter");
        assert_eq!(info.vif_info, vec![HostVifInfo::v1("VIFVHostUser")]);

        let info = VrouterPlugin::describe();
        assert_eq!(info.plugin_name, "vrouter");
        assert_eq!(info.vif_info.len(), 3);
        assert!(info.vif_info.iter().all(|i| i.min_version == "1.0"));
    }
}
