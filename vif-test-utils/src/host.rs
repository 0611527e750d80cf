// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated compute host for driving the plugin end to end.
//!
//! Network devices live as directories under a temporary sysfs root, so the
//! plugin's existence checks see exactly what the fake `ip` and `tunctl`
//! commands did. Port registrations made through `vrouter-port-control` are
//! tracked by VIF id.

use camino::Utf8Path;
use camino_tempfile::Utf8TempDir;
use linux_utils::host::{BoxedWaitFn, Input, Output, OutputExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct HostState {
    /// Registered ports, keyed by VIF id, holding the full add arguments.
    ports: BTreeMap<String, Vec<String>>,
    /// Substrings of command lines which should fail.
    failures: Vec<String>,
}

pub struct FakeHost {
    sysfs: Utf8TempDir,
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        let sysfs = camino_tempfile::Builder::new()
            .prefix("fake-sysfs-net")
            .tempdir()
            .expect("creating fake sysfs directory");
        Self { sysfs, state: Arc::new(Mutex::new(HostState::default())) }
    }

    /// Directory standing in for `/sys/class/net`.
    pub fn sysfs_net_dir(&self) -> &Utf8Path {
        self.sysfs.path()
    }

    /// Pretend `name` was created outside the plugin.
    pub fn add_device(&self, name: &str) {
        add_device(self.sysfs.path(), name);
    }

    pub fn has_device(&self, name: &str) -> bool {
        self.sysfs.path().join(name).is_dir()
    }

    pub fn devices(&self) -> BTreeSet<String> {
        let entries = std::fs::read_dir(self.sysfs.path())
            .expect("reading fake sysfs directory");
        entries
            .map(|entry| {
                entry
                    .expect("reading fake sysfs entry")
                    .file_name()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }

    pub fn registered_ports(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().ports.keys().cloned().collect()
    }

    /// The `vrouter-port-control` arguments a port was registered with.
    pub fn port_args(&self, vif_id: &str) -> Option<Vec<String>> {
        self.state.lock().unwrap().ports.get(vif_id).cloned()
    }

    /// Fail every subsequent command whose command line contains `pattern`.
    pub fn fail_matching(&self, pattern: &str) {
        self.state.lock().unwrap().failures.push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    /// A handler to install with `FakeExecutor::set_wait_handler`.
    pub fn handler(&self) -> BoxedWaitFn {
        let sysfs = self.sysfs.path().to_owned();
        let state = self.state.clone();
        Box::new(move |input| {
            let mut state = state.lock().unwrap();
            let line = input.to_string();
            if state.failures.iter().any(|f| line.contains(f.as_str())) {
                return Output::failure().set_stderr("injected failure");
            }
            handle(&sysfs, &mut state, input)
        })
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

fn add_device(sysfs: &Utf8Path, name: &str) {
    std::fs::create_dir_all(sysfs.join(name))
        .expect("creating fake netdev directory");
}

fn remove_device(sysfs: &Utf8Path, name: &str) -> Output {
    match std::fs::remove_dir(sysfs.join(name)) {
        Ok(()) => Output::success(),
        Err(_) => Output::failure()
            .set_stderr(format!("Cannot find device \"{name}\"")),
    }
}

fn handle(sysfs: &Utf8Path, state: &mut HostState, input: &Input) -> Output {
    // Commands may arrive wrapped by a root helper.
    let mut argv: Vec<&str> = std::iter::once(input.program.as_str())
        .chain(input.args.iter().map(String::as_str))
        .collect();
    while argv.first().is_some_and(|p| *p == "sudo") {
        argv.remove(0);
    }
    let Some((program, args)) = argv.split_first() else {
        return Output::failure();
    };
    let program: &str = program.rsplit('/').next().unwrap_or(program);

    match (program, args) {
        ("ip", ["tuntap", "add", name, ..]) => {
            add_device(sysfs, name);
            Output::success()
        }
        ("tunctl", ["-b", "-t", name]) => {
            add_device(sysfs, name);
            Output::success().set_stdout(format!("{name}\n"))
        }
        ("ip", ["link", "add", "name", name, "type", "bridge"]) => {
            add_device(sysfs, name);
            Output::success()
        }
        ("ip", ["link", "set", name, rest @ ..]) => {
            let missing = std::iter::once(*name)
                .chain(match rest {
                    ["master", bridge] => Some(*bridge),
                    _ => None,
                })
                .find(|dev| !sysfs.join(dev).is_dir());
            match missing {
                Some(dev) => Output::failure()
                    .set_stderr(format!("Cannot find device \"{dev}\"")),
                None => Output::success(),
            }
        }
        ("ip", ["link", "delete", name, ..]) => remove_device(sysfs, name),
        ("vrouter-port-control", args) => {
            let flag = |key: &str| {
                args.iter().find_map(|a| {
                    a.strip_prefix(key).and_then(|v| v.strip_prefix('='))
                })
            };
            let Some(uuid) = flag("--uuid") else {
                return Output::with_code(2).set_stderr("missing --uuid");
            };
            match flag("--oper") {
                Some("add") => {
                    state.ports.insert(
                        uuid.to_string(),
                        args.iter().map(|a| a.to_string()).collect(),
                    );
                    Output::success()
                }
                Some("delete") => {
                    state.ports.remove(uuid);
                    Output::success()
                }
                _ => Output::with_code(2).set_stderr("unknown operation"),
            }
        }
        _ => Output::failure()
            .set_stderr(format!("fake host: unhandled command: {input}")),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tap_lifecycle() {
        let host = FakeHost::new();
        let mut handler = host.handler();
        let out = handler(&Input::shell("ip tuntap add tap0 mode tap"));
        assert!(out.status.success());
        assert!(host.has_device("tap0"));

        let out = handler(&Input::shell("sudo ip link set tap0 up"));
        assert!(out.status.success());

        let out = handler(&Input::shell("ip link delete tap0"));
        assert!(out.status.success());
        assert!(host.devices().is_empty());

        let out = handler(&Input::shell("ip link delete tap0"));
        assert_eq!(out.status.code(), Some(1));
    }

    #[test]
    fn enslaving_requires_bridge() {
        let host = FakeHost::new();
        host.add_device("tap0");
        let mut handler = host.handler();
        let out = handler(&Input::shell("ip link set tap0 master br0"));
        assert!(!out.status.success());
        handler(&Input::shell("ip link add name br0 type bridge"));
        let out = handler(&Input::shell("ip link set tap0 master br0"));
        assert!(out.status.success());
    }

    #[test]
    fn port_registry() {
        let host = FakeHost::new();
        let mut handler = host.handler();
        handler(&Input::shell(
            "vrouter-port-control --oper=add --uuid=vif-1 --tap_name=tap0",
        ));
        assert_eq!(
            host.registered_ports(),
            BTreeSet::from(["vif-1".to_string()])
        );
        assert_eq!(
            host.port_args("vif-1").unwrap(),
            vec!["--oper=add", "--uuid=vif-1", "--tap_name=tap0"]
        );
        handler(&Input::shell(
            "vrouter-port-control --oper=delete --uuid=vif-1",
        ));
        assert!(host.registered_ports().is_empty());
    }

    #[test]
    fn injected_failures() {
        let host = FakeHost::new();
        host.fail_matching("--oper=add");
        let mut handler = host.handler();
        let out = handler(&Input::shell(
            "vrouter-port-control --oper=add --uuid=vif-1",
        ));
        assert!(!out.status.success());
        assert!(host.registered_ports().is_empty());

        host.clear_failures();
        let out = handler(&Input::shell(
            "vrouter-port-control --oper=add --uuid=vif-1",
        ));
        assert!(out.status.success());
    }
}
