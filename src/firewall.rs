//! Probe, provision, run, deprovision.
//!
//! A rule created by [`FirewallManager::run`] is deleted exactly once before
//! `run` returns, whether the workload succeeds, fails or panics. If the
//! `run` future itself is dropped mid-workload, the deletion is spawned onto
//! the current tokio runtime instead.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::azure::{
    Authorizer, FirewallRule, ReqwestTransport, ResourceDirectory, RetryingTransport,
    ServerResource,
};
use crate::config::Config;
use crate::connection::ConnectionDescriptor;
use crate::probe::{ConnectivityProbe, ProbeResult, SqlServerConnector};
use crate::utils::errors::FirewallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    RuleProvisioned,
}

/// Owns a live rule until it is released.
struct RuleGuard {
    directory: Arc<ResourceDirectory>,
    provisioned: Option<(ServerResource, FirewallRule)>,
}

impl RuleGuard {
    fn new(directory: Arc<ResourceDirectory>, resource: ServerResource, rule: FirewallRule) -> Self {
        Self {
            directory,
            provisioned: Some((resource, rule)),
        }
    }

    /// The rule stays owned by the guard until the delete call returns, so a
    /// drop mid-delete still falls back to `Drop`.
    async fn release(mut self) {
        if let Some((resource, rule)) = &self.provisioned {
            if let Err(e) = self.directory.delete_rule(resource, rule).await {
                tracing::error!(
                    "Failed to remove firewall rule {} from server {}: {}. Remove it manually.",
                    rule.name,
                    resource.name,
                    e
                );
            }
        }
        self.provisioned = None;
        tracing::info!("State: {:?}", LifecycleState::Idle);
    }
}

impl Drop for RuleGuard {
    fn drop(&mut self) {
        let Some((resource, rule)) = self.provisioned.take() else {
            return;
        };
        tracing::warn!("Run abandoned with firewall rule {} still in place", rule.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let directory = self.directory.clone();
                handle.spawn(async move {
                    if let Err(e) = directory.delete_rule(&resource, &rule).await {
                        tracing::error!(
                            "Failed to remove firewall rule {} from server {}: {}. Remove it manually.",
                            rule.name,
                            resource.name,
                            e
                        );
                    }
                });
            }
            Err(_) => tracing::error!(
                "No runtime available to remove firewall rule {} from server {}. Remove it manually.",
                rule.name,
                resource.name
            ),
        }
    }
}

pub struct FirewallManager {
    probe: ConnectivityProbe,
    directory: Arc<ResourceDirectory>,
}

impl FirewallManager {
    pub fn new(probe: ConnectivityProbe, directory: Arc<ResourceDirectory>) -> Self {
        Self { probe, directory }
    }

    /// Production wiring: reqwest with retry for the management API and a TDS
    /// connector for the probe. Cancelling `cancel` ends any management call
    /// or back-off wait with [`TransportError::Cancelled`].
    ///
    /// [`TransportError::Cancelled`]: crate::utils::errors::TransportError::Cancelled
    pub fn from_config(
        config: &Config,
        authorizer: Arc<dyn Authorizer>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let http = ReqwestTransport::new(config.http_timeout)
            .context("Failed to create management API client")?;
        let transport =
            RetryingTransport::new(http, config.retry.clone()).with_cancellation(cancel);
        let directory = ResourceDirectory::new(authorizer, Arc::new(transport));
        let connector = SqlServerConnector::new(config.connect_timeout);
        Ok(Self::new(
            ConnectivityProbe::new(Arc::new(connector)),
            Arc::new(directory),
        ))
    }

    pub fn directory(&self) -> &Arc<ResourceDirectory> {
        &self.directory
    }

    async fn provision(&self, server_name: &str, ip: &str) -> Result<RuleGuard, FirewallError> {
        let to_error = |source| FirewallError::Provision {
            ip: ip.to_string(),
            source,
        };
        let resource = self.directory.resolve(server_name).await.map_err(to_error)?;
        let rule = self.directory.create_rule(&resource, ip).await.map_err(to_error)?;
        tracing::info!("State: {:?}", LifecycleState::RuleProvisioned);
        Ok(RuleGuard::new(self.directory.clone(), resource, rule))
    }

    /// Runs `workload` with network access to `server_name` guaranteed for
    /// its duration. The workload's own outcome is returned unchanged; a
    /// failure to remove the rule afterwards is only logged.
    pub async fn run<F, Fut, T>(
        &self,
        server_name: &str,
        descriptor: &ConnectionDescriptor,
        workload: F,
    ) -> Result<T, FirewallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        tracing::info!("State: {:?}", LifecycleState::Idle);
        let guard = match self.probe.check(descriptor).await {
            ProbeResult::Accessible => {
                tracing::info!("Server {} is reachable, no firewall rule needed", server_name);
                None
            }
            ProbeResult::BlockedWithAddress(ip) => Some(self.provision(server_name, &ip).await?),
            ProbeResult::Inconclusive(error) => {
                return Err(FirewallError::ProbeInconclusive {
                    server: server_name.to_string(),
                    message: error.text(),
                });
            }
        };

        let outcome = AssertUnwindSafe(async { workload().await })
            .catch_unwind()
            .await;

        if let Some(guard) = guard {
            guard.release().await;
        }

        match outcome {
            Ok(result) => result.map_err(FirewallError::Workload),
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}
