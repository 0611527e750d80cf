// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::agent::{AgentClient, AgentError};
use crate::port::PortRecord;
use async_trait::async_trait;
use slog::{debug, Logger};
use std::net::SocketAddr;
use std::time::Duration;

/// Client for the vRouter agent's port service, speaking JSON over HTTP.
pub struct HttpAgentClient {
    log: Logger,
    client: reqwest::Client,
    base_url: String,
}

impl HttpAgentClient {
    pub fn new(
        log: &Logger,
        address: SocketAddr,
        timeout: Duration,
    ) -> Result<Self, AgentError> {
        Self::with_base_url(log, format!("http://{address}"), timeout)
    }

    pub fn with_base_url(
        log: &Logger,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            log: log.new(slog::o!(
                "component" => "HttpAgentClient",
                "agent" => base_url.clone(),
            )),
            client,
            base_url,
        })
    }

    /// Any answer at all means the agent is alive.
    async fn ping(&self) -> Result<bool, AgentError> {
        match self.client.get(format!("{}/", self.base_url)).send().await {
            Ok(_) => Ok(true),
            Err(err) if err.is_connect() || err.is_timeout() => {
                debug!(self.log, "vRouter agent unreachable"; "error" => %err);
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<(), AgentError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let message = response.text().await.unwrap_or_default();
    Err(AgentError::Status { status: status.as_u16(), message })
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn connect(&self) -> Result<bool, AgentError> {
        self.ping().await
    }

    async fn keep_alive_check(&self) -> Result<bool, AgentError> {
        self.ping().await
    }

    async fn add_port(&self, ports: &[PortRecord]) -> Result<(), AgentError> {
        for port in ports {
            let response = self
                .client
                .post(format!("{}/port", self.base_url))
                .json(port)
                .send()
                .await?;
            check_status(response).await?;
            debug!(self.log, "added port"; "vif_id" => &port.vif_id);
        }
        Ok(())
    }

    async fn delete_port(&self, vif_id: &str) -> Result<(), AgentError> {
        let response = self
            .client
            .delete(format!("{}/port/{vif_id}", self.base_url))
            .send()
            .await?;
        check_status(response).await?;
        debug!(self.log, "deleted port"; "vif_id" => vif_id);
        Ok(())
    }
}
