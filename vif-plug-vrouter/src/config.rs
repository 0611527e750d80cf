// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with plugin configuration

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use slog::FilterLevel;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default directory for vhost-user sockets when userspace vhost is in use.
pub const DEFAULT_USERSPACE_VHOST_SOCKET_DIR: &str = "/var/run/vrouter";
pub const DEFAULT_PORT_CONTROL_PATH: &str = "vrouter-port-control";
/// Loopback port of the vRouter agent's port service.
pub const DEFAULT_AGENT_PORT: u16 = 9091;

/// Hypervisor driving the guests on this host.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VirtType {
    #[default]
    Kvm,
    Qemu,
    Lxc,
}

impl VirtType {
    pub fn is_container(&self) -> bool {
        matches!(self, VirtType::Lxc)
    }
}

/// Configuration for the vRouter VIF plugin.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub virt_type: VirtType,
    /// Plug generic VIFs as vhost-user sockets served by a DPDK vRouter.
    #[serde(default)]
    pub use_userspace_vhost: bool,
    #[serde(default = "default_socket_dir")]
    pub userspace_vhost_socket_dir: Utf8PathBuf,
    /// Command prefix for privileged operations, e.g. `sudo`.
    pub root_helper: Option<String>,
    #[serde(default = "default_port_control_path")]
    pub port_control_path: Utf8PathBuf,
    #[serde(default = "default_sysfs_net_dir")]
    pub sysfs_net_dir: Utf8PathBuf,
    /// Remove local devices some time after unplug rather than during it.
    #[serde(default = "default_true")]
    pub defer_device_removal: bool,
    #[serde(default = "default_removal_delay")]
    pub device_removal_delay_secs: u64,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_socket_dir() -> Utf8PathBuf {
    DEFAULT_USERSPACE_VHOST_SOCKET_DIR.into()
}

fn default_port_control_path() -> Utf8PathBuf {
    DEFAULT_PORT_CONTROL_PATH.into()
}

fn default_sysfs_net_dir() -> Utf8PathBuf {
    linux_utils::link::SYSFS_NET_DIR.into()
}

fn default_true() -> bool {
    true
}

fn default_removal_delay() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            virt_type: VirtType::default(),
            use_userspace_vhost: false,
            userspace_vhost_socket_dir: default_socket_dir(),
            root_helper: None,
            port_control_path: default_port_control_path(),
            sysfs_net_dir: default_sysfs_net_dir(),
            defer_device_removal: true,
            device_removal_delay_secs: default_removal_delay(),
            backend: BackendConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// How ports are registered with the vRouter.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// One `vrouter-port-control` invocation per operation.
    #[default]
    Cli,
    /// A persistent session with the vRouter agent.
    Agent {
        #[serde(default = "default_agent_address")]
        address: SocketAddr,
        #[serde(default = "default_keepalive_interval")]
        keepalive_interval_secs: u64,
        #[serde(default = "default_request_timeout")]
        request_timeout_secs: u64,
    },
}

fn default_agent_address() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_AGENT_PORT))
}

fn default_keepalive_interval() -> u64 {
    2
}

fn default_request_timeout() -> u64 {
    5
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl From<LogLevel> for FilterLevel {
    fn from(level: LogLevel) -> FilterLevel {
        match level {
            LogLevel::Trace => FilterLevel::Trace,
            LogLevel::Debug => FilterLevel::Debug,
            LogLevel::Info => FilterLevel::Info,
            LogLevel::Warn => FilterLevel::Warning,
            LogLevel::Error => FilterLevel::Error,
            LogLevel::Critical => FilterLevel::Critical,
        }
    }
}

/// Where the plugin's log goes (the "log" table of the config file).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode")]
pub enum LogConfig {
    #[serde(rename = "stderr-terminal")]
    StderrTerminal {
        #[serde(default)]
        level: LogLevel,
    },

    #[serde(rename = "file")]
    File {
        #[serde(default)]
        level: LogLevel,
        path: Utf8PathBuf,
    },
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig::StderrTerminal { level: LogLevel::default() }
    }
}

impl LogConfig {
    pub fn level(&self) -> LogLevel {
        match self {
            LogConfig::StderrTerminal { level } | LogConfig::File { level, .. } => {
                *level
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Load and validate a `Config` from the given TOML file.
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config: Config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.use_userspace_vhost && self.virt_type.is_container() {
            return Err(ConfigError::Invalid(
                "use_userspace_vhost is not supported with virt_type = lxc"
                    .to_string(),
            ));
        }
        if let BackendConfig::Agent { keepalive_interval_secs: 0, .. } =
            self.backend
        {
            return Err(ConfigError::Invalid(
                "keepalive_interval_secs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn device_removal_delay(&self) -> Duration {
        Duration::from_secs(self.device_removal_delay_secs)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use camino_tempfile::Utf8TempDir;

    fn write_config(dir: &Utf8TempDir, contents: &str) -> Utf8PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.userspace_vhost_socket_dir, "/var/run/vrouter");
        assert_eq!(config.device_removal_delay(), Duration::from_secs(10));
        assert_eq!(config.backend, BackendConfig::Cli);
    }

    #[test]
    fn agent_backend_defaults() {
        let config: Config = toml::from_str(
            r#"
            virt_type = "qemu"
            [backend]
            kind = "agent"
            "#,
        )
        .unwrap();
        assert_eq!(config.virt_type, VirtType::Qemu);
        assert_eq!(
            config.backend,
            BackendConfig::Agent {
                address: "127.0.0.1:9091".parse().unwrap(),
                keepalive_interval_secs: 2,
                request_timeout_secs: 5,
            }
        );
    }

    #[test]
    fn log_config_modes() {
        let config: Config = toml::from_str(
            r#"
            [log]
            mode = "file"
            level = "debug"
            path = "/var/log/vrouter-vif.log"
            "#,
        )
        .unwrap();
        assert_eq!(config.log.level(), LogLevel::Debug);
        assert_eq!(FilterLevel::from(config.log.level()), FilterLevel::Debug);
    }

    #[test]
    fn from_file_reports_path() {
        let dir = camino_tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert_matches!(
            Config::from_file(&missing),
            Err(ConfigError::Io { path, .. }) if path == missing
        );

        let path = write_config(&dir, "virt_type = \"xen\"");
        assert_matches!(Config::from_file(&path), Err(ConfigError::Parse { .. }));
    }

    #[test]
    fn userspace_vhost_with_lxc_is_rejected() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
            virt_type = "lxc"
            use_userspace_vhost = true
            "#,
        );
        assert_matches!(Config::from_file(&path), Err(ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_keepalive_interval_is_rejected() {
        let config = Config {
            backend: BackendConfig::Agent {
                address: default_agent_address(),
                keepalive_interval_secs: 0,
                request_timeout_secs: 5,
            },
            ..Config::default()
        };
        assert_matches!(config.validate(), Err(ConfigError::Invalid(_)));
    }
}
