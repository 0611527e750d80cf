// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Management of the kernel network devices backing guest ports: TAP
//! devices and, for container guests, Linux bridges.

use crate::host::{execute_allowing, BoxedExecutor};
use crate::{ExecutionError, RootHelper, IP, TUNCTL};
use camino::{Utf8Path, Utf8PathBuf};
use slog::{debug, error, info, warn, Logger};
use slog_error_chain::InlineErrorChain;

/// Default location of the per-netdev sysfs entries.
pub const SYSFS_NET_DIR: &str = "/sys/class/net";

/// Exit codes from `ip` which indicate that the requested state already
/// holds (e.g., the device exists, or was already removed).
const IP_ALLOWED_EXIT_CODES: &[i32] = &[0, 2, 254];

#[derive(thiserror::Error, Debug)]
pub enum LinkError {
    #[error("Failed to create TAP device {name}")]
    CreateTap {
        name: String,
        #[source]
        err: ExecutionError,
    },

    #[error("Failed to remove network device {name}")]
    Remove {
        name: String,
        #[source]
        err: ExecutionError,
    },

    #[error("Failed to configure network device {name}")]
    Configure {
        name: String,
        #[source]
        err: ExecutionError,
    },

    #[error("Failed to create bridge {bridge} for {member}")]
    CreateBridge {
        bridge: String,
        member: String,
        #[source]
        err: ExecutionError,
    },
}

impl LinkError {
    /// The device this error concerns.
    pub fn device(&self) -> &str {
        match self {
            LinkError::CreateTap { name, .. }
            | LinkError::Remove { name, .. }
            | LinkError::Configure { name, .. } => name,
            LinkError::CreateBridge { bridge, .. } => bridge,
        }
    }
}

/// Wraps `ip link` / `ip tuntap` (and `tunctl` as a fallback) for the
/// devices we plumb into the vRouter.
#[derive(Clone)]
pub struct IpLink {
    log: Logger,
    executor: BoxedExecutor,
    root_helper: RootHelper,
    sysfs_net_dir: Utf8PathBuf,
}

impl IpLink {
    pub fn new(
        log: Logger,
        executor: BoxedExecutor,
        root_helper: RootHelper,
        sysfs_net_dir: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self { log, executor, root_helper, sysfs_net_dir: sysfs_net_dir.into() }
    }

    pub fn sysfs_net_dir(&self) -> &Utf8Path {
        &self.sysfs_net_dir
    }

    /// Returns true if a netdev named `name` exists.
    pub fn device_exists(&self, name: &str) -> bool {
        self.sysfs_net_dir.join(name).exists()
    }

    fn ip(&self, args: &[&str]) -> tokio::process::Command {
        let mut cmd = self.root_helper.command(IP);
        cmd.args(args);
        cmd
    }

    async fn run_ip(&self, args: &[&str]) -> Result<(), ExecutionError> {
        let mut cmd = self.ip(args);
        execute_allowing(&*self.executor, &mut cmd, IP_ALLOWED_EXIT_CODES)
            .await?;
        Ok(())
    }

    /// Create a TAP device, falling back to `tunctl` if `ip tuntap` fails.
    ///
    /// This is a no-op if the device already exists.
    pub async fn create_tap_dev(
        &self,
        name: &str,
        mac: Option<&str>,
        multiqueue: bool,
    ) -> Result<(), LinkError> {
        if self.device_exists(name) {
            debug!(self.log, "TAP device already exists"; "name" => name);
            return Ok(());
        }

        let mut args = vec!["tuntap", "add", name, "mode", "tap"];
        if multiqueue {
            args.push("multi_queue");
        }
        if let Err(err) = self.run_ip(&args).await {
            if multiqueue {
                warn!(
                    self.log,
                    "Failed to create a tap device with ip tuntap. \
                    tunctl does not support creation of multi-queue \
                    enabled devices, skipping fallback.";
                    "name" => name,
                    "error" => %InlineErrorChain::new(&err),
                );
                return Err(LinkError::CreateTap { name: name.into(), err });
            }

            let mut cmd = self.root_helper.command(TUNCTL);
            cmd.args(["-b", "-t", name]);
            self.executor
                .execute_async(&mut cmd)
                .await
                .map_err(|err| LinkError::CreateTap { name: name.into(), err })?;
        }

        if let Some(mac) = mac {
            self.run_ip(&["link", "set", name, "address", mac]).await.map_err(
                |err| LinkError::Configure { name: name.into(), err },
            )?;
        }
        self.run_ip(&["link", "set", name, "up"])
            .await
            .map_err(|err| LinkError::Configure { name: name.into(), err })?;
        info!(self.log, "Created TAP device"; "name" => name, "multiqueue" => multiqueue);
        Ok(())
    }

    /// Remove a TAP device, if it exists.
    pub async fn remove_tap_dev(&self, name: &str) -> Result<(), LinkError> {
        if !self.device_exists(name) {
            return Ok(());
        }
        match self.run_ip(&["link", "delete", name]).await {
            Ok(()) => {
                debug!(self.log, "Net device removed"; "name" => name);
                Ok(())
            }
            Err(err) => {
                error!(
                    self.log,
                    "Failed removing net device";
                    "name" => name,
                    "error" => %InlineErrorChain::new(&err),
                );
                Err(LinkError::Remove { name: name.into(), err })
            }
        }
    }

    /// Create a bridge with `member` enslaved to it, in promiscuous mode.
    ///
    /// Every step tolerates the state already being in place, so this may be
    /// called repeatedly for the same bridge.
    pub async fn create_bridge(
        &self,
        bridge: &str,
        member: &str,
    ) -> Result<(), LinkError> {
        let map_err = |err| LinkError::CreateBridge {
            bridge: bridge.into(),
            member: member.into(),
            err,
        };
        if !self.device_exists(bridge) {
            self.run_ip(&["link", "add", "name", bridge, "type", "bridge"])
                .await
                .map_err(map_err)?;
        }
        self.run_ip(&["link", "set", member, "master", bridge])
            .await
            .map_err(map_err)?;
        self.run_ip(&["link", "set", bridge, "promisc", "on"])
            .await
            .map_err(map_err)?;
        self.run_ip(&["link", "set", bridge, "up"]).await.map_err(map_err)?;
        info!(self.log, "Created bridge"; "bridge" => bridge, "member" => member);
        Ok(())
    }

    /// Delete a bridge, if it exists.
    pub async fn delete_bridge(&self, bridge: &str) -> Result<(), LinkError> {
        if !self.device_exists(bridge) {
            return Ok(());
        }
        self.run_ip(&["link", "delete", bridge, "type", "bridge"])
            .await
            .map_err(|err| LinkError::Remove { name: bridge.into(), err })?;
        debug!(self.log, "Bridge removed"; "bridge" => bridge);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::{FakeExecutor, Input, Output, OutputExt, StaticHandler};
    use camino_tempfile::Utf8TempDir;

    fn test_log() -> Logger {
        let decorator =
            slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build();
        Logger::root(slog::Fuse(drain), slog::o!())
    }

    fn setup() -> (Utf8TempDir, std::sync::Arc<FakeExecutor>, IpLink) {
        let log = test_log();
        let sysfs = camino_tempfile::tempdir().unwrap();
        let executor = FakeExecutor::new(log.clone());
        let link = IpLink::new(
            log,
            executor.clone().as_executor(),
            RootHelper::none(),
            sysfs.path(),
        );
        (sysfs, executor, link)
    }

    #[tokio::test]
    async fn create_tap_dev_runs_ip_tuntap() {
        let (_sysfs, executor, link) = setup();
        let mut handler = StaticHandler::new();
        handler.expect_ok("ip tuntap add tap0 mode tap");
        handler.expect_ok("ip link set tap0 address aa:bb:cc:dd:ee:ff");
        handler.expect_ok("ip link set tap0 up");
        handler.register(&executor);

        link.create_tap_dev("tap0", Some("aa:bb:cc:dd:ee:ff"), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_tap_dev_is_idempotent() {
        let (sysfs, executor, link) = setup();
        std::fs::create_dir(sysfs.path().join("tap0")).unwrap();

        link.create_tap_dev("tap0", None, false).await.unwrap();
        assert!(executor.observed().is_empty());
    }

    #[tokio::test]
    async fn create_tap_dev_falls_back_to_tunctl() {
        let (_sysfs, executor, link) = setup();
        let mut handler = StaticHandler::new();
        handler.expect_fail("ip tuntap add tap0 mode tap");
        handler.expect_ok("tunctl -b -t tap0");
        handler.expect_ok("ip link set tap0 up");
        handler.register(&executor);

        link.create_tap_dev("tap0", None, false).await.unwrap();
    }

    #[tokio::test]
    async fn multiqueue_tap_does_not_fall_back() {
        let (_sysfs, executor, link) = setup();
        let mut handler = StaticHandler::new();
        handler.expect_fail("ip tuntap add tap0 mode tap multi_queue");
        handler.register(&executor);

        let err = link.create_tap_dev("tap0", None, true).await.unwrap_err();
        assert!(matches!(err, LinkError::CreateTap { .. }));
        assert_eq!(err.device(), "tap0");
    }

    #[tokio::test]
    async fn remove_tap_dev_only_removes_existing_devices() {
        let (sysfs, executor, link) = setup();
        link.remove_tap_dev("tap0").await.unwrap();
        assert!(executor.observed().is_empty());

        std::fs::create_dir(sysfs.path().join("tap0")).unwrap();
        let mut handler = StaticHandler::new();
        handler.expect(
            Input::shell("ip link delete tap0"),
            Output::with_code(254),
        );
        handler.register(&executor);
        link.remove_tap_dev("tap0").await.unwrap();
    }

    #[tokio::test]
    async fn create_bridge_enables_promiscuous_mode() {
        let (_sysfs, executor, link) = setup();
        let mut handler = StaticHandler::new();
        handler.expect_ok("ip link add name br0 type bridge");
        handler.expect_ok("ip link set tap0 master br0");
        handler.expect_ok("ip link set br0 promisc on");
        handler.expect_ok("ip link set br0 up");
        handler.register(&executor);

        link.create_bridge("br0", "tap0").await.unwrap();
    }

    #[tokio::test]
    async fn privileged_commands_use_root_helper() {
        let log = test_log();
        let sysfs = camino_tempfile::tempdir().unwrap();
        let executor = FakeExecutor::new(log.clone());
        let link = IpLink::new(
            log,
            executor.clone().as_executor(),
            RootHelper::new("sudo"),
            sysfs.path(),
        );
        std::fs::create_dir(sysfs.path().join("br0")).unwrap();

        let mut handler = StaticHandler::new();
        handler.expect_ok("sudo ip link delete br0 type bridge");
        handler.register(&executor);
        link.delete_bridge("br0").await.unwrap();
    }
}
