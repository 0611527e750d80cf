// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::{PortControl, PortControlError};
use crate::port::{PortDeletion, PortRecord};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use linux_utils::host::BoxedExecutor;
use linux_utils::RootHelper;
use slog::{debug, error, Logger};
use slog_error_chain::InlineErrorChain;

/// Registers ports by running `vrouter-port-control`.
pub struct CliPortControl {
    log: Logger,
    executor: BoxedExecutor,
    root_helper: RootHelper,
    path: Utf8PathBuf,
}

impl CliPortControl {
    pub fn new(
        log: &Logger,
        executor: BoxedExecutor,
        root_helper: RootHelper,
        path: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            log: log.new(slog::o!("component" => "CliPortControl")),
            executor,
            root_helper,
            path: path.into(),
        }
    }

    async fn run(
        &self,
        vif_id: &str,
        args: Vec<String>,
    ) -> Result<(), PortControlError> {
        let mut cmd = self.root_helper.command(self.path.as_str());
        cmd.args(&args);
        match self.executor.execute_async(&mut cmd).await {
            Ok(_) => {
                debug!(self.log, "vrouter-port-control succeeded"; "vif_id" => vif_id);
                Ok(())
            }
            Err(err) => {
                error!(
                    self.log,
                    "Unable to execute vrouter-port-control";
                    "vif_id" => vif_id,
                    "args" => ?args,
                    "error" => %InlineErrorChain::new(&err),
                );
                Err(PortControlError::Command { vif_id: vif_id.into(), err })
            }
        }
    }
}

/// Arguments adding `record`, in the order `vrouter-port-control` documents.
fn add_args(record: &PortRecord) -> Vec<String> {
    let mut args = vec![
        "--oper=add".to_string(),
        format!("--uuid={}", record.vif_id),
        format!("--instance_uuid={}", record.instance_uuid),
        format!("--vn_uuid={}", record.vn_uuid),
        format!("--vm_project_uuid={}", record.project_id),
        format!("--ip_address={}", record.ip_address),
        match record.ip6_address {
            Some(ip6) => format!("--ipv6_address={ip6}"),
            None => "--ipv6_address=None".to_string(),
        },
        format!("--vm_name={}", record.vm_name),
        format!("--mac={}", record.mac),
        format!("--tap_name={}", record.tap_name),
        format!("--port_type={}", record.port_type),
    ];
    if let Some(vif_type) = record.vif_type {
        args.push(format!("--vif_type={vif_type}"));
    }
    if let Some(vnic_type) = record.vnic_type {
        args.push(format!("--vnic_type={vnic_type}"));
    }
    if let Some(pci_dev) = &record.pci_dev {
        args.push(format!("--pci_dev={pci_dev}"));
    }
    if let Some(socket) = &record.vhostuser_socket {
        args.push(format!("--vhostuser_socket={socket}"));
    }
    if let Some(mode) = record.vhostuser_mode {
        args.push(format!("--vhostuser_mode={mode}"));
    }
    args.push("--tx_vlan_id=-1".to_string());
    args.push("--rx_vlan_id=-1".to_string());
    args
}

fn delete_args(deletion: &PortDeletion) -> Vec<String> {
    let mut args = vec![
        "--oper=delete".to_string(),
        format!("--uuid={}", deletion.vif_id),
    ];
    if let Some(tap_name) = &deletion.tap_name {
        args.push(format!("--tap_name={tap_name}"));
    }
    if let Some(vnic_type) = deletion.vnic_type {
        args.push(format!("--vnic_type={vnic_type}"));
    }
    if let Some(pci_dev) = &deletion.pci_dev {
        args.push(format!("--pci_dev={pci_dev}"));
    }
    if let Some(socket) = &deletion.vhostuser_socket {
        args.push(format!("--vhostuser_socket={socket}"));
    }
    if let Some(mode) = deletion.vhostuser_mode {
        args.push(format!("--vhostuser_mode={mode}"));
    }
    args
}

#[async_trait]
impl PortControl for CliPortControl {
    async fn add_port(
        &self,
        record: &PortRecord,
    ) -> Result<(), PortControlError> {
        self.run(&record.vif_id, add_args(record)).await
    }

    async fn delete_port(
        &self,
        deletion: &PortDeletion,
    ) -> Result<(), PortControlError> {
        self.run(&deletion.vif_id, delete_args(deletion)).await
    }
}
