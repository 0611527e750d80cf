// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixtures shared by the plugin's integration tests.

#![allow(dead_code)]

use linux_utils::host::FakeExecutor;
use linux_utils::RootHelper;
use std::sync::Arc;
use vif_plug_vrouter::config::DEFAULT_PORT_CONTROL_PATH;
use vif_plug_vrouter::port_control::CliPortControl;
use vif_plug_vrouter::vif::{
    DatapathOffload, FixedIp, Network, PortProfile, Subnet,
};
use vif_plug_vrouter::{Config, InstanceInfo, VifDescriptor, VrouterPlugin};
use vif_test_utils::{test_setup_log, FakeHost, LogContext};

pub const GENERIC_TAP: &str = "tap-xxx-yyy-zzz";

pub fn network() -> Network {
    Network {
        id: "f0ff5378-7367-4451-9202-829b068143f3".to_string(),
        bridge: Some("br0".to_string()),
        subnets: vec![
            Subnet {
                cidr: Some("101.168.1.0/24".parse().unwrap()),
                gateway: Some("101.168.1.1".parse().unwrap()),
                ips: vec![],
            },
            Subnet {
                cidr: Some("101:1db9::/64".parse().unwrap()),
                gateway: Some("101:1db9::1".parse().unwrap()),
                ips: vec![],
            },
        ],
    }
}

fn descriptor(id: &str, vif_type: &str, address: &str) -> VifDescriptor {
    VifDescriptor {
        id: id.to_string(),
        vif_type: vif_type.to_string(),
        address: address.to_string(),
        vif_name: None,
        network: network(),
        path: None,
        mode: None,
        dev_address: None,
        dev_type: None,
        port_profile: None,
    }
}

pub fn vif_generic() -> VifDescriptor {
    VifDescriptor {
        vif_name: Some(GENERIC_TAP.to_string()),
        ..descriptor(
            "a909a869-e967-4c5f-8f54-fbd57dc798a9",
            "VIFGeneric",
            "ca:fe:de:ad:be:ef",
        )
    }
}

pub fn vif_vhostuser() -> VifDescriptor {
    VifDescriptor {
        vif_name: Some("tapXXX".to_string()),
        path: Some("/var/run/openvswitch/vhub679325f-ca".into()),
        mode: Some("client".to_string()),
        ..descriptor(
            "40137937-43c3-47d9-be65-d3a13041c5cf",
            "VIFVHostUser",
            "ca:fe:de:ad:be:ef",
        )
    }
}

pub fn vif_vhostuser_no_path() -> VifDescriptor {
    VifDescriptor {
        vif_name: Some("tapXXX".to_string()),
        mode: Some("client".to_string()),
        ..descriptor(
            "f4454d55-ebb1-4bc8-9f92-7ade5e6a3350",
            "VIFVHostUser",
            "ca:fe:de:ad:be:ef",
        )
    }
}

fn offload() -> Option<PortProfile> {
    Some(PortProfile {
        datapath_offload: Some(DatapathOffload {
            representor_name: Some("nicdc065497-3c".to_string()),
            representor_address: Some("0000:08:08.5".to_string()),
        }),
    })
}

pub fn vif_direct() -> VifDescriptor {
    VifDescriptor {
        vif_name: Some("nicdc065497-3c".to_string()),
        dev_type: Some("ethernet".to_string()),
        dev_address: Some("0000:08:08.5".to_string()),
        port_profile: offload(),
        ..descriptor(
            "dc065497-3c8d-4f44-8fb4-e1d33c16a536",
            "VIFHostDevice",
            "22:52:25:62:e2:aa",
        )
    }
}

pub fn vif_forwarder() -> VifDescriptor {
    VifDescriptor {
        vif_name: Some("nicdc065497-3c".to_string()),
        path: Some("/fake/socket".into()),
        mode: Some("client".to_string()),
        port_profile: offload(),
        ..descriptor(
            "dc065497-3c8d-4f44-8fb4-e1d33c16a536",
            "VIFVHostUser",
            "22:52:25:62:e2:aa",
        )
    }
}

/// A generic VIF whose only address is IPv6.
pub fn vif_ipv6_only() -> VifDescriptor {
    let mut vif = vif_generic();
    vif.network.subnets = vec![Subnet {
        cidr: Some("2001:db8::/64".parse().unwrap()),
        gateway: None,
        ips: vec![FixedIp { address: "2001:db8::5".parse().unwrap() }],
    }];
    vif
}

/// The instance VIFs are unplugged from.
pub fn instance() -> InstanceInfo {
    InstanceInfo {
        uuid: "f0000000-0000-0000-0000-000000000001".to_string(),
        name: "Instance 1".to_string(),
        hostname: None,
        host: None,
        project_id: "1".to_string(),
        virtio_multiqueue: false,
        rebuilding: false,
    }
}

/// The instance VIFs are plugged into.
pub fn plug_instance() -> InstanceInfo {
    InstanceInfo {
        uuid: "46a4308b-e75a-4f90-a34a-650c86ca18b2".to_string(),
        name: "instance-name".to_string(),
        project_id: "b168ea26fa0c49c1a84e1566d9565fa5".to_string(),
        ..instance()
    }
}

pub fn args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// A plugin wired to a simulated host.
pub struct TestHost {
    pub logctx: LogContext,
    pub host: FakeHost,
    pub executor: Arc<FakeExecutor>,
}

impl TestHost {
    pub fn new(test_name: &str) -> Self {
        let logctx = test_setup_log(test_name);
        let host = FakeHost::new();
        let executor = FakeExecutor::new(logctx.log.clone());
        executor.set_wait_handler(host.handler());
        Self { logctx, host, executor }
    }

    /// Configuration pointing at the simulated sysfs, removing devices
    /// synchronously.
    pub fn config(&self) -> Config {
        Config {
            sysfs_net_dir: self.host.sysfs_net_dir().to_owned(),
            defer_device_removal: false,
            ..Config::default()
        }
    }

    pub fn plugin(&self, config: Config) -> VrouterPlugin {
        let port_control = CliPortControl::new(
            &self.logctx.log,
            self.executor.clone().as_executor(),
            RootHelper::none(),
            DEFAULT_PORT_CONTROL_PATH,
        );
        VrouterPlugin::new(
            &self.logctx.log,
            config,
            self.executor.clone().as_executor(),
            Arc::new(port_control),
        )
    }

    /// Arguments of every `vrouter-port-control` run so far.
    pub fn port_control_calls(&self) -> Vec<Vec<String>> {
        self.executor
            .observed()
            .into_iter()
            .filter(|input| input.program == DEFAULT_PORT_CONTROL_PATH)
            .map(|input| input.args)
            .collect()
    }

    /// Every device-management command run so far.
    pub fn link_calls(&self) -> Vec<String> {
        self.executor
            .observed()
            .into_iter()
            .filter(|input| input.program != DEFAULT_PORT_CONTROL_PATH)
            .map(|input| input.to_string())
            .collect()
    }

    pub fn cleanup_successful(self) {
        self.logctx.cleanup_successful();
    }
}
