use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::errors::RemoteApiError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResource {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerList {
    #[serde(default)]
    pub value: Vec<ServerResource>,
    #[serde(rename = "nextLink", default)]
    pub next_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub id: Option<String>,
    pub name: String,
    pub start_ip_address: String,
    pub end_ip_address: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FirewallRuleProperties {
    pub start_ip_address: String,
    pub end_ip_address: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FirewallRuleBody {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub properties: FirewallRuleProperties,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Error code the management API uses for a token that has expired.
pub const EXPIRED_TOKEN_CODE: &str = "ExpiredAuthenticationToken";

/// Error code from an ARM error envelope, if the body is one.
pub(crate) fn error_code(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.error)
        .and_then(|error| error.code)
}

impl RemoteApiError {
    pub(crate) fn from_response(status: u16, body: &str) -> Self {
        match serde_json::from_str::<ErrorEnvelope>(body).ok().and_then(|e| e.error) {
            Some(error) => RemoteApiError {
                status,
                code: error.code,
                message: error
                    .message
                    .unwrap_or_else(|| format!("Request failed with status code {}", status)),
                details: error
                    .details
                    .into_iter()
                    .filter_map(|detail| match (detail.code, detail.message) {
                        (Some(code), Some(message)) => Some(format!("{}: {}", code, message)),
                        (None, Some(message)) => Some(message),
                        (Some(code), None) => Some(code),
                        (None, None) => None,
                    })
                    .collect(),
            },
            None => RemoteApiError {
                status,
                code: None,
                message: if body.trim().is_empty() {
                    format!("Request failed with status code {}", status)
                } else {
                    body.trim().to_string()
                },
                details: Vec::new(),
            },
        }
    }
}

/// `ClientIPAddress_<ip with dots as underscores>_<UTC yyyyMMddHHmmssSSS>`.
pub fn rule_name(ip: &str, now: DateTime<Utc>) -> String {
    format!(
        "ClientIPAddress_{}_{}",
        ip.replace('.', "_"),
        now.format("%Y%m%d%H%M%S%3f")
    )
}
