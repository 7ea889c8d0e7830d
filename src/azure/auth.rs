use std::env;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::connection::Password;
use crate::utils::mask::SecretMasker;

/// Cloud-suffix key for the SQL server host name.
pub const SQL_SERVER_HOSTNAME: &str = "sqlServerHostname";
/// Cloud-endpoint key for the resource manager.
pub const RESOURCE_MANAGER: &str = "resourceManager";

/// Capability handing out management-plane bearer tokens plus the cloud
/// coordinates they are valid for.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn get_token(&self, force_refresh: bool) -> Result<String>;

    fn subscription_id(&self) -> &str;

    fn resource_manager_url(&self) -> &str;

    fn cloud_suffix(&self, name: &str) -> Option<String>;

    fn cloud_endpoint(&self, name: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CloudEnvironment {
    #[default]
    AzureCloud,
    AzureUSGovernment,
    AzureChinaCloud,
}

impl CloudEnvironment {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "azurecloud" | "azurepubliccloud" | "public" => Some(CloudEnvironment::AzureCloud),
            "azureusgovernment" | "usgovernment" => Some(CloudEnvironment::AzureUSGovernment),
            "azurechinacloud" | "china" => Some(CloudEnvironment::AzureChinaCloud),
            _ => None,
        }
    }

    pub fn resource_manager_url(&self) -> &'static str {
        match self {
            CloudEnvironment::AzureCloud => "https://management.azure.com/",
            CloudEnvironment::AzureUSGovernment => "https://management.usgovcloudapi.net/",
            CloudEnvironment::AzureChinaCloud => "https://management.chinacloudapi.cn/",
        }
    }

    pub fn suffix(&self, name: &str) -> Option<&'static str> {
        match (self, name) {
            (CloudEnvironment::AzureCloud, SQL_SERVER_HOSTNAME) => Some(".database.windows.net"),
            (CloudEnvironment::AzureUSGovernment, SQL_SERVER_HOSTNAME) => {
                Some(".database.usgovcloudapi.net")
            }
            (CloudEnvironment::AzureChinaCloud, SQL_SERVER_HOSTNAME) => {
                Some(".database.chinacloudapi.cn")
            }
            _ => None,
        }
    }
}

/// Authorizer around a token the caller already holds. Refreshing returns
/// the same token.
pub struct StaticAuthorizer {
    token: Password,
    subscription_id: String,
    resource_manager_url: String,
    cloud: CloudEnvironment,
}

impl StaticAuthorizer {
    pub fn new(
        token: &str,
        subscription_id: impl Into<String>,
        cloud: CloudEnvironment,
        masker: &dyn SecretMasker,
    ) -> Self {
        masker.register(token);
        Self {
            token: Password::new(token),
            subscription_id: subscription_id.into(),
            resource_manager_url: cloud.resource_manager_url().to_string(),
            cloud,
        }
    }

    pub fn with_resource_manager_url(mut self, url: impl Into<String>) -> Self {
        self.resource_manager_url = url.into();
        self
    }

    /// Reads `AZURE_ACCESS_TOKEN`, `AZURE_SUBSCRIPTION_ID` and optionally
    /// `AZURE_CLOUD` and `AZURE_RESOURCE_MANAGER_ENDPOINT`.
    pub fn from_env(masker: &dyn SecretMasker) -> Result<Self> {
        let token = env::var("AZURE_ACCESS_TOKEN").context("AZURE_ACCESS_TOKEN is not set")?;
        let subscription_id =
            env::var("AZURE_SUBSCRIPTION_ID").context("AZURE_SUBSCRIPTION_ID is not set")?;
        let cloud = match env::var("AZURE_CLOUD") {
            Ok(name) => CloudEnvironment::from_name(&name)
                .with_context(|| format!("Unknown cloud environment '{}'", name))?,
            Err(_) => CloudEnvironment::default(),
        };
        let authorizer = Self::new(&token, subscription_id, cloud, masker);
        match env::var("AZURE_RESOURCE_MANAGER_ENDPOINT") {
            Ok(url) if !url.trim().is_empty() => {
                url::Url::parse(url.trim())
                    .with_context(|| format!("Invalid resource manager endpoint '{}'", url))?;
                Ok(authorizer.with_resource_manager_url(url.trim()))
            }
            _ => Ok(authorizer),
        }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn get_token(&self, _force_refresh: bool) -> Result<String> {
        if self.token.is_empty() {
            anyhow::bail!("no access token configured");
        }
        Ok(self.token.expose().to_string())
    }

    fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    fn resource_manager_url(&self) -> &str {
        &self.resource_manager_url
    }

    fn cloud_suffix(&self, name: &str) -> Option<String> {
        self.cloud.suffix(name).map(str::to_string)
    }

    fn cloud_endpoint(&self, name: &str) -> Option<String> {
        match name {
            RESOURCE_MANAGER => Some(self.resource_manager_url.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::mask::SecretRegistry;

    #[test]
    fn test_cloud_environment_names() {
        assert_eq!(CloudEnvironment::from_name("AzureCloud"), Some(CloudEnvironment::AzureCloud));
        assert_eq!(
            CloudEnvironment::from_name("azureusgovernment"),
            Some(CloudEnvironment::AzureUSGovernment)
        );
        assert_eq!(CloudEnvironment::from_name("mars"), None);
    }

    #[test]
    fn test_sql_suffix_per_cloud() {
        assert_eq!(
            CloudEnvironment::AzureCloud.suffix(SQL_SERVER_HOSTNAME),
            Some(".database.windows.net")
        );
        assert_eq!(CloudEnvironment::AzureCloud.suffix("keyvaultDns"), None);
    }

    #[tokio::test]
    async fn test_static_authorizer_masks_token() {
        let registry = SecretRegistry::new();
        let authorizer = StaticAuthorizer::new("tok-123", "sub", CloudEnvironment::AzureCloud, &registry);
        assert!(registry.contains("tok-123"));
        assert_eq!(authorizer.get_token(true).await.unwrap(), "tok-123");
        assert_eq!(authorizer.resource_manager_url(), "https://management.azure.com/");
        assert_eq!(
            authorizer.cloud_endpoint(RESOURCE_MANAGER).as_deref(),
            Some("https://management.azure.com/")
        );
    }
}
