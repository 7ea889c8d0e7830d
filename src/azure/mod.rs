//! Control-plane access to SQL server resources and their firewall rules.

pub mod auth;
pub mod models;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use reqwest::Method;
use serde_json::json;
use tokio::sync::Mutex;

use crate::utils::errors::{DirectoryError, RemoteApiError};

pub use auth::{Authorizer, CloudEnvironment, StaticAuthorizer};
pub use models::{FirewallRule, ServerResource};
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, RetryingTransport, Transport};

use models::{EXPIRED_TOKEN_CODE, FirewallRuleBody, ServerList};

pub const SERVERS_API_VERSION: &str = "2015-05-01-preview";
pub const FIREWALL_API_VERSION: &str = "2014-04-01";

const DEFAULT_SQL_SUFFIX: &str = ".database.windows.net";

pub struct ResourceDirectory {
    authorizer: Arc<dyn Authorizer>,
    transport: Arc<dyn Transport>,
    servers: Mutex<HashMap<String, ServerResource>>,
}

impl ResourceDirectory {
    pub fn new(authorizer: Arc<dyn Authorizer>, transport: Arc<dyn Transport>) -> Self {
        Self {
            authorizer,
            transport,
            servers: Mutex::new(HashMap::new()),
        }
    }

    fn base_url(&self) -> String {
        self.authorizer
            .resource_manager_url()
            .trim_end_matches('/')
            .to_string()
    }

    fn rule_url(&self, resource: &ServerResource, rule_name: &str) -> String {
        format!(
            "{}/{}/firewallRules/{}?api-version={}",
            self.base_url(),
            resource.id.trim_start_matches('/'),
            urlencoding::encode(rule_name),
            FIREWALL_API_VERSION
        )
    }

    /// Sends `request`, refreshing the token once if the service reports it
    /// expired.
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, DirectoryError> {
        let token = self.token(false).await?;
        let response = self.transport.send(request, &token).await?;
        if response.status == 401
            && models::error_code(&response.body).as_deref() == Some(EXPIRED_TOKEN_CODE)
        {
            tracing::info!("Access token expired, refreshing and retrying");
            let token = self.token(true).await?;
            return Ok(self.transport.send(request, &token).await?);
        }
        Ok(response)
    }

    async fn token(&self, force_refresh: bool) -> Result<String, DirectoryError> {
        self.authorizer
            .get_token(force_refresh)
            .await
            .map_err(|e| DirectoryError::Authorization(format!("{:#}", e)))
    }

    async fn list_servers(&self) -> Result<Vec<ServerResource>, DirectoryError> {
        let mut url = format!(
            "{}/subscriptions/{}/providers/Microsoft.Sql/servers?api-version={}",
            self.base_url(),
            self.authorizer.subscription_id(),
            SERVERS_API_VERSION
        );
        let mut servers = Vec::new();
        loop {
            let response = self.send(&ApiRequest::new(Method::GET, url)).await?;
            if response.status != 200 {
                return Err(RemoteApiError::from_response(response.status, &response.body).into());
            }
            let page: ServerList = serde_json::from_str(&response.body).map_err(|e| {
                DirectoryError::InvalidResponse(format!("Failed to parse server list: {}", e))
            })?;
            servers.extend(page.value);
            match page.next_link {
                Some(next) if !next.is_empty() => url = next,
                _ => break,
            }
        }
        Ok(servers)
    }

    /// Finds the server resource behind `server_name`, which may be a fully
    /// qualified host name. Results are cached for the lifetime of the
    /// directory.
    pub async fn resolve(&self, server_name: &str) -> Result<ServerResource, DirectoryError> {
        let suffix = self
            .authorizer
            .cloud_suffix(auth::SQL_SERVER_HOSTNAME)
            .unwrap_or_else(|| DEFAULT_SQL_SUFFIX.to_string());
        let trimmed = server_name.trim();
        let short_name = match trimmed.len().checked_sub(suffix.len()) {
            Some(cut)
                if cut > 0
                    && trimmed
                        .get(cut..)
                        .is_some_and(|tail| tail.eq_ignore_ascii_case(&suffix)) =>
            {
                &trimmed[..cut]
            }
            _ => trimmed,
        };
        let key = short_name.to_ascii_lowercase();

        let mut cache = self.servers.lock().await;
        if let Some(resource) = cache.get(&key) {
            return Ok(resource.clone());
        }

        tracing::info!("Looking up SQL server '{}' in subscription", short_name);
        let servers = self.list_servers().await?;
        if servers.is_empty() {
            return Err(DirectoryError::NoServersInSubscription(short_name.to_string()));
        }
        let resource = servers
            .into_iter()
            .find(|server| server.name.eq_ignore_ascii_case(short_name))
            .ok_or_else(|| DirectoryError::ServerNotFound(short_name.to_string()))?;
        tracing::debug!("Resolved '{}' to {}", short_name, resource.id);
        cache.insert(key, resource.clone());
        Ok(resource)
    }

    /// Adds a single-address rule for `ip`.
    pub async fn create_rule(
        &self,
        resource: &ServerResource,
        ip: &str,
    ) -> Result<FirewallRule, DirectoryError> {
        let name = models::rule_name(ip, Utc::now());
        let body = json!({
            "properties": {
                "startIpAddress": ip,
                "endIpAddress": ip,
            }
        });
        let request = ApiRequest::new(Method::PUT, self.rule_url(resource, &name)).with_body(body);
        let response = self.send(&request).await?;
        if response.status != 200 && response.status != 201 {
            return Err(RemoteApiError::from_response(response.status, &response.body).into());
        }

        let rule = match serde_json::from_str::<FirewallRuleBody>(&response.body) {
            Ok(created) => FirewallRule {
                id: created.id,
                name: created.name.unwrap_or(name),
                start_ip_address: created.properties.start_ip_address,
                end_ip_address: created.properties.end_ip_address,
            },
            Err(e) => {
                tracing::debug!("Firewall rule response was not parsed ({}), using request values", e);
                FirewallRule {
                    id: None,
                    name,
                    start_ip_address: ip.to_string(),
                    end_ip_address: ip.to_string(),
                }
            }
        };
        tracing::info!(
            "Added firewall rule {} for {} on server {}",
            rule.name,
            ip,
            resource.name
        );
        Ok(rule)
    }

    pub async fn delete_rule(
        &self,
        resource: &ServerResource,
        rule: &FirewallRule,
    ) -> Result<(), DirectoryError> {
        let request = ApiRequest::new(Method::DELETE, self.rule_url(resource, &rule.name));
        let response = self.send(&request).await?;
        if response.status != 200 && response.status != 204 {
            return Err(RemoteApiError::from_response(response.status, &response.body).into());
        }
        tracing::info!("Removed firewall rule {} from server {}", rule.name, resource.name);
        Ok(())
    }
}
