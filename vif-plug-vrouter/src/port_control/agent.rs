// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A persistent session with the vRouter agent.
//!
//! The agent forgets every port when it restarts. The session remembers the
//! ports which are currently plugged, notices (through a periodic keep-alive)
//! when the agent goes away and comes back, and replays those ports to it.

use super::{PortControl, PortControlError};
use crate::port::{PortDeletion, PortRecord};
use async_trait::async_trait;
use slog::{debug, info, warn, Logger};
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("Failed to reach the vRouter agent")]
    Transport(#[from] reqwest::Error),

    #[error("vRouter agent returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("vRouter agent is unreachable")]
    Unreachable,
}

/// Operations offered by the vRouter agent's port service.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Establish (or re-establish) a connection. Returns false if the agent
    /// is not accepting connections.
    async fn connect(&self) -> Result<bool, AgentError>;

    async fn keep_alive_check(&self) -> Result<bool, AgentError>;

    async fn add_port(&self, ports: &[PortRecord]) -> Result<(), AgentError>;

    async fn delete_port(&self, vif_id: &str) -> Result<(), AgentError>;
}

/// Port registration through a session with the vRouter agent.
///
/// The session starts out down; the first [`AgentSession::tick`] connects.
/// `up` only changes while `ports` is locked, so a mutation either sees the
/// session up and talks to the agent, or lands in the map before the
/// reconnect finishes reconciling it.
pub struct AgentSession {
    log: Logger,
    client: Arc<dyn AgentClient>,
    ports: Mutex<BTreeMap<String, PortRecord>>,
    up: AtomicBool,
    queue_while_down: bool,
}

impl AgentSession {
    pub fn new(log: &Logger, client: Arc<dyn AgentClient>) -> Self {
        Self {
            log: log.new(slog::o!("component" => "AgentSession")),
            client,
            ports: Mutex::new(BTreeMap::new()),
            up: AtomicBool::new(false),
            queue_while_down: true,
        }
    }

    /// Refuse port changes while the agent is down rather than keeping
    /// them for the next reconnect. For callers which exit before that
    /// reconnect could happen.
    pub fn fail_while_down(mut self) -> Self {
        self.queue_while_down = false;
        self
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Ids of the ports which would be replayed on reconnect.
    pub fn known_ports(&self) -> Vec<String> {
        self.ports.lock().unwrap().keys().cloned().collect()
    }

    fn mark_down(&self, op: &str, err: &AgentError) {
        let _ports = self.ports.lock().unwrap();
        if self.up.swap(false, Ordering::SeqCst) {
            warn!(
                self.log,
                "Lost connection to vRouter agent";
                "operation" => op,
                "error" => %InlineErrorChain::new(err),
            );
        }
    }

    /// Run one iteration of the health check.
    ///
    /// While up, the agent is pinged. While down, a connection is attempted
    /// and, if it succeeds, every known port is replayed before the session
    /// is marked up again. Failures only ever leave the session down.
    pub async fn tick(&self) {
        if self.is_up() {
            match self.client.keep_alive_check().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(self.log, "vRouter agent failed keep-alive check");
                    let _ports = self.ports.lock().unwrap();
                    self.up.store(false, Ordering::SeqCst);
                }
                Err(err) => self.mark_down("keep_alive_check", &err),
            }
            return;
        }

        match self.client.connect().await {
            Ok(true) => {}
            Ok(false) => {
                debug!(self.log, "vRouter agent not accepting connections");
                return;
            }
            Err(err) => {
                debug!(
                    self.log,
                    "Failed to connect to vRouter agent";
                    "error" => %InlineErrorChain::new(&err),
                );
                return;
            }
        }

        let mut replayed = 0;
        let mut sent = BTreeMap::new();
        loop {
            let snapshot = self.ports.lock().unwrap().clone();
            match self.replay(&sent, &snapshot).await {
                Ok(count) => replayed += count,
                Err(err) => {
                    warn!(
                        self.log,
                        "Failed to replay ports to vRouter agent";
                        "ports" => snapshot.len(),
                        "error" => %InlineErrorChain::new(&err),
                    );
                    return;
                }
            }
            sent = snapshot;

            // Ports plugged or unplugged during the replay go out on the
            // next pass.
            let settled = {
                let ports = self.ports.lock().unwrap();
                let settled = *ports == sent;
                if settled {
                    self.up.store(true, Ordering::SeqCst);
                }
                settled
            };
            if settled {
                break;
            }
        }
        info!(
            self.log,
            "Connected to vRouter agent";
            "replayed_ports" => replayed,
        );
    }

    /// Bring the agent from `sent` to `current`. Returns the number of ports
    /// added.
    async fn replay(
        &self,
        sent: &BTreeMap<String, PortRecord>,
        current: &BTreeMap<String, PortRecord>,
    ) -> Result<usize, AgentError> {
        let added: Vec<PortRecord> = current
            .iter()
            .filter(|(vif_id, port)| sent.get(*vif_id) != Some(*port))
            .map(|(_, port)| port.clone())
            .collect();
        if !added.is_empty() {
            self.client.add_port(&added).await?;
        }
        for vif_id in sent.keys().filter(|id| !current.contains_key(*id)) {
            self.client.delete_port(vif_id).await?;
        }
        Ok(added.len())
    }
}

#[async_trait]
impl PortControl for AgentSession {
    async fn add_port(
        &self,
        record: &PortRecord,
    ) -> Result<(), PortControlError> {
        let previous = {
            let mut ports = self.ports.lock().unwrap();
            if !self.is_up() {
                if !self.queue_while_down {
                    return Err(PortControlError::Agent {
                        vif_id: record.vif_id.clone(),
                        err: AgentError::Unreachable,
                    });
                }
                ports.insert(record.vif_id.clone(), record.clone());
                warn!(
                    self.log,
                    "vRouter agent is down; port will be added on reconnect";
                    "vif_id" => &record.vif_id,
                );
                return Ok(());
            }
            ports.insert(record.vif_id.clone(), record.clone())
        };

        if let Err(err) =
            self.client.add_port(std::slice::from_ref(record)).await
        {
            {
                let mut ports = self.ports.lock().unwrap();
                match previous {
                    Some(previous) => {
                        ports.insert(record.vif_id.clone(), previous);
                    }
                    None => {
                        ports.remove(&record.vif_id);
                    }
                }
            }
            self.mark_down("add_port", &err);
            return Err(PortControlError::Agent {
                vif_id: record.vif_id.clone(),
                err,
            });
        }
        Ok(())
    }

    async fn delete_port(
        &self,
        deletion: &PortDeletion,
    ) -> Result<(), PortControlError> {
        {
            let mut ports = self.ports.lock().unwrap();
            if !self.is_up() && !self.queue_while_down {
                return Err(PortControlError::Agent {
                    vif_id: deletion.vif_id.clone(),
                    err: AgentError::Unreachable,
                });
            }
            ports.remove(&deletion.vif_id);
            if !self.is_up() {
                return Ok(());
            }
        }

        if let Err(err) = self.client.delete_port(&deletion.vif_id).await {
            self.mark_down("delete_port", &err);
            return Err(PortControlError::Agent {
                vif_id: deletion.vif_id.clone(),
                err,
            });
        }
        Ok(())
    }
}

/// Background task driving [`AgentSession::tick`] on a fixed period.
pub struct KeepAlive {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl KeepAlive {
    pub fn spawn(session: Arc<AgentSession>, period: Duration) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => return,
                    _ = interval.tick() => session.tick().await,
                }
            }
        });
        Self { token, handle }
    }

    /// Stop the task and wait for it to exit.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}
