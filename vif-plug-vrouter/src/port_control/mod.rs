// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registration of ports with the vRouter forwarding plane.
//!
//! Two backends exist: [`CliPortControl`], which runs
//! `vrouter-port-control` once per operation, and [`AgentSession`], which
//! keeps a session with the vRouter agent and replays known ports whenever
//! the agent comes back after a restart.

use crate::port::{PortDeletion, PortRecord};
use async_trait::async_trait;
use linux_utils::ExecutionError;
use std::sync::Arc;

mod agent;
mod cli;
mod http;

pub use agent::AgentClient;
pub use agent::AgentError;
pub use agent::AgentSession;
pub use agent::KeepAlive;
pub use cli::CliPortControl;
pub use http::HttpAgentClient;

#[derive(thiserror::Error, Debug)]
pub enum PortControlError {
    #[error("vrouter-port-control failed for port {vif_id}")]
    Command {
        vif_id: String,
        #[source]
        err: ExecutionError,
    },

    #[error("vRouter agent request failed for port {vif_id}")]
    Agent {
        vif_id: String,
        #[source]
        err: AgentError,
    },
}

/// Adds and deletes ports in the vRouter.
#[async_trait]
pub trait PortControl: Send + Sync {
    async fn add_port(&self, record: &PortRecord)
        -> Result<(), PortControlError>;

    async fn delete_port(
        &self,
        deletion: &PortDeletion,
    ) -> Result<(), PortControlError>;
}

pub type BoxedPortControl = Arc<dyn PortControl>;
