// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line harness driving the plugin the way the compute service
//! would.

use crate::config::{BackendConfig, Config, LogConfig};
use crate::instance::InstanceInfo;
use crate::interface::{ImageMeta, InstanceType};
use crate::plugin::VrouterPlugin;
use crate::port_control::{
    AgentSession, BoxedPortControl, CliPortControl, HttpAgentClient,
    KeepAlive,
};
use crate::vif::VifDescriptor;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use linux_utils::host::HostExecutor;
use linux_utils::RootHelper;
use serde::de::DeserializeOwned;
use slog::{info, warn, Drain};
use std::sync::Arc;
use std::time::Duration;

/// Plug and unplug guest VIFs into a vRouter.
#[derive(Debug, Parser)]
#[command(name = "vrouter-vif", version)]
pub struct VrouterVifApp {
    /// Path to the plugin's TOML configuration.
    #[clap(long, env = "VROUTER_VIF_CONFIG")]
    config: Option<Utf8PathBuf>,

    #[clap(subcommand)]
    command: VrouterVifCommand,
}

#[derive(Debug, Subcommand)]
enum VrouterVifCommand {
    /// Print the VIF types this plugin handles.
    Describe(DescribeOpts),
    /// Plug a VIF into the vRouter.
    Plug(PortOpts),
    /// Unplug a VIF from the vRouter.
    Unplug(PortOpts),
    /// Print the guest interface configuration for a VIF.
    GetConfig(GetConfigOpts),
}

#[derive(Debug, Args)]
struct DescribeOpts {
    /// Describe the `contrail_vrouter` alias instead.
    #[clap(long)]
    contrail: bool,
}

#[derive(Debug, Args)]
struct PortOpts {
    /// JSON file holding the VIF descriptor.
    #[clap(long)]
    vif: Utf8PathBuf,

    /// JSON file holding the instance descriptor.
    #[clap(long)]
    instance: Utf8PathBuf,
}

#[derive(Debug, Args)]
struct GetConfigOpts {
    #[clap(flatten)]
    port: PortOpts,

    /// JSON file holding the image metadata.
    #[clap(long)]
    image_meta: Option<Utf8PathBuf>,

    /// JSON file holding the instance type (flavor).
    #[clap(long)]
    instance_type: Option<Utf8PathBuf>,

    /// Print a libvirt `<interface>` element rather than JSON.
    #[clap(long)]
    xml: bool,
}

fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {path}"))
}

fn read_json_or_default<T: DeserializeOwned + Default>(
    path: Option<&Utf8Path>,
) -> Result<T> {
    path.map(read_json).unwrap_or_else(|| Ok(T::default()))
}

impl PortOpts {
    fn load(&self) -> Result<(VifDescriptor, InstanceInfo)> {
        Ok((read_json(&self.vif)?, read_json(&self.instance)?))
    }
}

/// The forwarding-plane backend, plus the keep-alive task when there is
/// one.
struct Backend {
    port_control: BoxedPortControl,
    keep_alive: Option<KeepAlive>,
}

impl Backend {
    async fn start(log: &slog::Logger, config: &Config) -> Result<Self> {
        match &config.backend {
            BackendConfig::Cli => {
                let executor = HostExecutor::new(log.clone()).as_executor();
                let port_control = CliPortControl::new(
                    log,
                    executor,
                    RootHelper::from(config.root_helper.clone()),
                    config.port_control_path.clone(),
                );
                Ok(Self { port_control: Arc::new(port_control), keep_alive: None })
            }
            BackendConfig::Agent {
                address,
                keepalive_interval_secs,
                request_timeout_secs,
            } => {
                let client = HttpAgentClient::new(
                    log,
                    *address,
                    Duration::from_secs(*request_timeout_secs),
                )
                .context("building vRouter agent client")?;
                // The process exits before any reconnect, so nothing can be
                // left queued for one.
                let session = Arc::new(
                    AgentSession::new(log, Arc::new(client)).fail_while_down(),
                );
                session.tick().await;
                if !session.is_up() {
                    warn!(log, "vRouter agent unreachable"; "address" => %address);
                }
                let keep_alive = KeepAlive::spawn(
                    session.clone(),
                    Duration::from_secs(*keepalive_interval_secs),
                );
                Ok(Self { port_control: session, keep_alive: Some(keep_alive) })
            }
        }
    }

    async fn stop(self) {
        if let Some(keep_alive) = self.keep_alive {
            keep_alive.stop().await;
        }
    }
}

impl VrouterVifApp {
    /// Executes the app.
    pub async fn exec(self) -> Result<()> {
        let config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        let log = setup_log(&config.log)?;

        match self.command {
            VrouterVifCommand::Describe(opts) => {
                let info = if opts.contrail {
                    VrouterPlugin::describe_contrail_vrouter()
                } else {
                    VrouterPlugin::describe()
                };
                println!("{}", serde_json::to_string_pretty(&info)?);
                Ok(())
            }
            VrouterVifCommand::GetConfig(opts) => {
                let (vif, instance) = opts.port.load()?;
                let image_meta: ImageMeta =
                    read_json_or_default(opts.image_meta.as_deref())?;
                let instance_type: InstanceType =
                    read_json_or_default(opts.instance_type.as_deref())?;
                let plugin = plugin_without_backend(&log, config);
                let conf = plugin.get_config(
                    &instance,
                    &vif,
                    &image_meta,
                    &instance_type,
                )?;
                if opts.xml {
                    print!("{}", conf.to_libvirt_xml());
                } else {
                    println!("{}", serde_json::to_string_pretty(&conf)?);
                }
                Ok(())
            }
            VrouterVifCommand::Plug(opts) => {
                let (vif, instance) = opts.load()?;
                let backend = Backend::start(&log, &config).await?;
                let plugin = VrouterPlugin::new(
                    &log,
                    config,
                    HostExecutor::new(log.clone()).as_executor(),
                    backend.port_control.clone(),
                );
                let result = plugin.plug(&vif, &instance).await;
                plugin.shutdown().await;
                backend.stop().await;
                result?;
                info!(log, "plug complete"; "vif_id" => &vif.id);
                Ok(())
            }
            VrouterVifCommand::Unplug(opts) => {
                let (vif, instance) = opts.load()?;
                let backend = Backend::start(&log, &config).await?;
                let plugin = VrouterPlugin::new(
                    &log,
                    config,
                    HostExecutor::new(log.clone()).as_executor(),
                    backend.port_control.clone(),
                );
                let result = plugin.unplug(&vif, &instance).await;
                // Deferred removals run before the process exits.
                plugin.shutdown().await;
                backend.stop().await;
                result?;
                info!(log, "unplug complete"; "vif_id" => &vif.id);
                Ok(())
            }
        }
    }
}

/// A plugin for the operations which never touch the vRouter.
fn plugin_without_backend(log: &slog::Logger, config: Config) -> VrouterPlugin {
    let executor = HostExecutor::new(log.clone()).as_executor();
    let port_control = Arc::new(CliPortControl::new(
        log,
        executor.clone(),
        RootHelper::none(),
        config.port_control_path.clone(),
    ));
    VrouterPlugin::new(log, config, executor, port_control)
}

/// Build the process logger. `RUST_LOG` overrides the configured level.
pub fn setup_log(config: &LogConfig) -> Result<slog::Logger> {
    let level = slog::FilterLevel::from(config.level());
    let drain: Box<dyn Drain<Ok = (), Err = slog::Never> + Send> = match config
    {
        LogConfig::StderrTerminal { .. } => {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            Box::new(env_filtered(drain, "RUST_LOG", level))
        }
        LogConfig::File { path, .. } => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            let decorator = slog_term::PlainDecorator::new(file);
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            Box::new(env_filtered(drain, "RUST_LOG", level))
        }
    };
    let drain = slog_async::Async::new(drain).build().fuse();
    Ok(slog::Logger::root(drain, slog::o!()))
}

fn env_filtered<D>(
    drain: D,
    env_var: &str,
    level: slog::FilterLevel,
) -> slog_envlogger::EnvLogger<D>
where
    D: Drain<Ok = (), Err = slog::Never>,
{
    let mut builder = slog_envlogger::LogBuilder::new(drain);
    if let Ok(s) = std::env::var(env_var) {
        builder = builder.parse(&s);
    } else {
        builder = builder.filter(None, level);
    }
    builder.build()
}

pub enum CmdError {
    /// Incorrect command-line arguments.
    Usage(String),
    /// All other errors.
    Failure(anyhow::Error),
}

/// Print `cmd_error` and exit with an appropriate status.
pub fn fatal(cmd_error: CmdError) -> ! {
    let (exit_code, message) = match cmd_error {
        CmdError::Usage(message) => (2, message),
        CmdError::Failure(err) => (1, format!("{err:#}")),
    };
    eprintln!("vrouter-vif: {message}");
    std::process::exit(exit_code);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plugin::{PlugError, UnplugError};
    use crate::port_control::{AgentError, PortControlError};
    use assert_matches::assert_matches;
    use camino_tempfile::Utf8TempDir;
    use clap::CommandFactory;

    const VIF_JSON: &str = r#"{
        "id": "a909a869-e967-4c5f-8f54-fbd57dc798a9",
        "vif_type": "VIFGeneric",
        "address": "ca:fe:de:ad:be:ef",
        "vif_name": "tap-xxx-yyy-zzz",
        "network": { "id": "f0ff5378-7367-4451-9202-829b068143f3" }
    }"#;

    const INSTANCE_JSON: &str = r#"{
        "uuid": "f0000000-0000-0000-0000-000000000001",
        "name": "Instance 1",
        "project_id": "1"
    }"#;

    /// Config with an agent backend nobody listens on, plus the descriptor
    /// files for one VIF.
    fn unreachable_agent_setup(tap_exists: bool) -> (Utf8TempDir, PortOpts) {
        let dir = camino_tempfile::tempdir().unwrap();
        let sysfs = dir.path().join("net");
        std::fs::create_dir(&sysfs).unwrap();
        if tap_exists {
            std::fs::create_dir(sysfs.join("tap-xxx-yyy-zzz")).unwrap();
        }
        std::fs::write(
            dir.path().join("config.toml"),
            format!(
                r#"
                sysfs_net_dir = "{sysfs}"
                defer_device_removal = false

                [backend]
                kind = "agent"
                address = "127.0.0.1:1"
                request_timeout_secs = 1

                [log]
                mode = "file"
                path = "{log}"
                "#,
                log = dir.path().join("vrouter-vif.log"),
            ),
        )
        .unwrap();
        let vif = dir.path().join("vif.json");
        let instance = dir.path().join("instance.json");
        std::fs::write(&vif, VIF_JSON).unwrap();
        std::fs::write(&instance, INSTANCE_JSON).unwrap();
        (dir, PortOpts { vif, instance })
    }

    #[test]
    fn cli_is_well_formed() {
        VrouterVifApp::command().debug_assert();
    }

    #[test]
    fn parses_get_config() {
        let app = VrouterVifApp::try_parse_from([
            "vrouter-vif",
            "--config",
            "/etc/vrouter-vif.toml",
            "get-config",
            "--vif",
            "vif.json",
            "--instance",
            "instance.json",
            "--xml",
        ])
        .unwrap();
        assert_eq!(
            app.config.as_deref(),
            Some(Utf8Path::new("/etc/vrouter-vif.toml"))
        );
        assert_matches!(app.command, VrouterVifCommand::GetConfig(opts) => {
            assert!(opts.xml);
            assert_eq!(opts.image_meta, None);
            assert_eq!(opts.port.vif, "vif.json");
        });
    }

    #[test]
    fn plug_requires_descriptors() {
        let err = VrouterVifApp::try_parse_from(["vrouter-vif", "plug"])
            .unwrap_err();
        assert_eq!(
            err.kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn loads_descriptors() {
        let dir = camino_tempfile::tempdir().unwrap();
        let vif = dir.path().join("vif.json");
        let instance = dir.path().join("instance.json");
        std::fs::write(
            &vif,
            r#"{
                "id": "a909a869-e967-4c5f-8f54-fbd57dc798a9",
                "vif_type": "VIFGeneric",
                "address": "ca:fe:de:ad:be:ef",
                "vif_name": "tap-xxx-yyy-zzz",
                "network": { "id": "f0ff5378-7367-4451-9202-829b068143f3" }
            }"#,
        )
        .unwrap();
        std::fs::write(
            &instance,
            r#"{
                "uuid": "f0000000-0000-0000-0000-000000000001",
                "name": "Instance 1",
                "project_id": "1"
            }"#,
        )
        .unwrap();

        let opts = PortOpts { vif, instance };
        let (vif, instance) = opts.load().unwrap();
        assert_eq!(vif.vif_name.as_deref(), Some("tap-xxx-yyy-zzz"));
        assert_eq!(instance.project_id, "1");

        let missing: Result<ImageMeta> =
            read_json(&dir.path().join("missing.json"));
        assert!(missing.is_err());
        let meta: ImageMeta = read_json_or_default(None).unwrap();
        assert_eq!(meta, ImageMeta::default());
    }

    #[tokio::test]
    async fn plug_fails_when_agent_is_unreachable() {
        let (dir, opts) = unreachable_agent_setup(true);
        let app = VrouterVifApp {
            config: Some(dir.path().join("config.toml")),
            command: VrouterVifCommand::Plug(opts),
        };
        let err = app.exec().await.unwrap_err();
        assert_matches!(
            err.downcast_ref::<PlugError>(),
            Some(PlugError::Registration {
                err: PortControlError::Agent {
                    err: AgentError::Unreachable,
                    ..
                },
                ..
            })
        );
    }

    #[tokio::test]
    async fn unplug_fails_when_agent_is_unreachable() {
        let (dir, opts) = unreachable_agent_setup(false);
        let app = VrouterVifApp {
            config: Some(dir.path().join("config.toml")),
            command: VrouterVifCommand::Unplug(opts),
        };
        let err = app.exec().await.unwrap_err();
        assert_matches!(
            err.downcast_ref::<UnplugError>(),
            Some(UnplugError::Deregistration {
                err: PortControlError::Agent {
                    err: AgentError::Unreachable,
                    ..
                },
                ..
            })
        );
    }
}
