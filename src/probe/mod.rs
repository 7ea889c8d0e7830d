//! Reachability check that tells a firewall block apart from other failures.
//!
//! When the server rejects a client because of its firewall, the error text
//! carries the client's public IPv4 address. Any other failure (bad
//! credentials, DNS, TLS) does not.

pub mod sql_server;

use std::fmt;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use crate::connection::ConnectionDescriptor;

pub use sql_server::SqlServerConnector;

pub const ADMIN_DATABASE: &str = "master";

// Octets are deliberately not range-checked; the address is only echoed
// back to the platform that produced it.
static IPV4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{1,3}(\.\d{1,3}){3}").expect("valid IPv4 pattern")
});

/// A failed connection attempt, with the messages of every nested error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectError {
    pub messages: Vec<String>,
}

impl ConnectError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
        }
    }

    pub fn with_nested(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    /// Flattens an error and its `source()` chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut messages = vec![err.to_string()];
        let mut source = err.source();
        while let Some(inner) = source {
            messages.push(inner.to_string());
            source = inner.source();
        }
        Self { messages }
    }

    pub fn text(&self) -> String {
        self.messages.join(" | ")
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

impl std::error::Error for ConnectError {}

/// Opens and immediately closes one connection.
#[async_trait]
pub trait SqlConnector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        database: &str,
    ) -> Result<(), ConnectError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Accessible,
    BlockedWithAddress(String),
    Inconclusive(ConnectError),
}

/// First dotted quad found anywhere in the error messages.
pub fn extract_ipv4(error: &ConnectError) -> Option<String> {
    error
        .messages
        .iter()
        .find_map(|message| IPV4.find(message).map(|m| m.as_str().to_string()))
}

#[derive(Clone)]
pub struct ConnectivityProbe {
    connector: Arc<dyn SqlConnector>,
}

impl ConnectivityProbe {
    pub fn new(connector: Arc<dyn SqlConnector>) -> Self {
        Self { connector }
    }

    pub async fn check(&self, descriptor: &ConnectionDescriptor) -> ProbeResult {
        tracing::debug!("Probing {} via '{}'", descriptor.server, ADMIN_DATABASE);
        let error = match self.connector.connect(descriptor, ADMIN_DATABASE).await {
            Ok(()) => return ProbeResult::Accessible,
            Err(e) => e,
        };
        if let Some(ip) = extract_ipv4(&error) {
            tracing::info!("Client IP {} is blocked by the firewall of {}", ip, descriptor.server);
            return ProbeResult::BlockedWithAddress(ip);
        }

        // Some servers refuse `master` to logins that can reach their own database.
        if descriptor.database.eq_ignore_ascii_case(ADMIN_DATABASE) {
            return ProbeResult::Inconclusive(error);
        }
        tracing::debug!(
            "Connection to '{}' failed without an address ({}); retrying against '{}'",
            ADMIN_DATABASE,
            error,
            descriptor.database
        );
        let error = match self.connector.connect(descriptor, &descriptor.database).await {
            Ok(()) => return ProbeResult::Accessible,
            Err(e) => e,
        };
        match extract_ipv4(&error) {
            Some(ip) => {
                tracing::info!("Client IP {} is blocked by the firewall of {}", ip, descriptor.server);
                ProbeResult::BlockedWithAddress(ip)
            }
            None => ProbeResult::Inconclusive(error),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::mask::SecretRegistry;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted outcomes and records which databases were tried.
    #[derive(Default)]
    pub(crate) struct ScriptedConnector {
        outcomes: Mutex<VecDeque<Result<(), ConnectError>>>,
        pub(crate) databases: Mutex<Vec<String>>,
    }

    impl ScriptedConnector {
        pub(crate) fn new(outcomes: Vec<Result<(), ConnectError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                databases: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn attempts(&self) -> Vec<String> {
            self.databases.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SqlConnector for ScriptedConnector {
        async fn connect(
            &self,
            _descriptor: &ConnectionDescriptor,
            database: &str,
        ) -> Result<(), ConnectError> {
            self.databases.lock().unwrap().push(database.to_string());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ConnectError::new("no scripted outcome")))
        }
    }

    pub(crate) fn descriptor(database: &str) -> ConnectionDescriptor {
        let text = format!(
            "Server=srv.database.windows.net;Database={};User Id=u;Password=p",
            database
        );
        ConnectionDescriptor::parse(&text, &SecretRegistry::new()).unwrap()
    }

    pub(crate) fn firewall_error(ip: &str) -> ConnectError {
        ConnectError::new(format!(
            "Cannot open server 'srv' requested by the login. Client with IP address '{}' is not allowed to access the server.",
            ip
        ))
    }

    #[test]
    fn test_extract_ipv4_anywhere_in_text() {
        assert_eq!(
            extract_ipv4(&ConnectError::new("blocked: 1.2.3.4 not allowed")),
            Some("1.2.3.4".to_string())
        );
        assert_eq!(extract_ipv4(&ConnectError::new("Login failed for user 'u'")), None);
    }

    #[test]
    fn test_extract_ipv4_checks_nested_messages() {
        let error = ConnectError::new("aggregate failure").with_nested("Client with IP address '10.0.0.7' is not allowed");
        assert_eq!(extract_ipv4(&error), Some("10.0.0.7".to_string()));
    }

    #[test]
    fn test_extract_ipv4_uses_first_match_without_range_check() {
        let error = ConnectError::new("999.999.999.999 then 1.2.3.4");
        assert_eq!(extract_ipv4(&error), Some("999.999.999.999".to_string()));
    }

    #[tokio::test]
    async fn test_accessible_on_first_attempt() {
        let connector = Arc::new(ScriptedConnector::new(vec![Ok(())]));
        let probe = ConnectivityProbe::new(connector.clone());
        assert_eq!(probe.check(&descriptor("appdb")).await, ProbeResult::Accessible);
        assert_eq!(connector.attempts(), vec!["master"]);
    }

    #[tokio::test]
    async fn test_blocked_on_first_attempt_skips_second() {
        let connector = Arc::new(ScriptedConnector::new(vec![Err(firewall_error("1.2.3.4"))]));
        let probe = ConnectivityProbe::new(connector.clone());
        assert_eq!(
            probe.check(&descriptor("appdb")).await,
            ProbeResult::BlockedWithAddress("1.2.3.4".to_string())
        );
        assert_eq!(connector.attempts(), vec!["master"]);
    }

    #[tokio::test]
    async fn test_falls_back_to_target_database() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Err(ConnectError::new("Login failed for user 'u'")),
            Ok(()),
        ]));
        let probe = ConnectivityProbe::new(connector.clone());
        assert_eq!(probe.check(&descriptor("appdb")).await, ProbeResult::Accessible);
        assert_eq!(connector.attempts(), vec!["master", "appdb"]);
    }

    #[tokio::test]
    async fn test_second_attempt_can_detect_block() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Err(ConnectError::new("access to master denied")),
            Err(firewall_error("5.6.7.8")),
        ]));
        let probe = ConnectivityProbe::new(connector);
        assert_eq!(
            probe.check(&descriptor("appdb")).await,
            ProbeResult::BlockedWithAddress("5.6.7.8".to_string())
        );
    }

    #[tokio::test]
    async fn test_inconclusive_carries_last_error() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Err(ConnectError::new("first")),
            Err(ConnectError::new("Login failed for user 'u'")),
        ]));
        let probe = ConnectivityProbe::new(connector);
        assert_eq!(
            probe.check(&descriptor("appdb")).await,
            ProbeResult::Inconclusive(ConnectError::new("Login failed for user 'u'"))
        );
    }

    #[tokio::test]
    async fn test_master_target_is_not_tried_twice() {
        let connector = Arc::new(ScriptedConnector::new(vec![Err(ConnectError::new("dns failure"))]));
        let probe = ConnectivityProbe::new(connector.clone());
        assert!(matches!(
            probe.check(&descriptor("master")).await,
            ProbeResult::Inconclusive(_)
        ));
        assert_eq!(connector.attempts(), vec!["master"]);
    }
}
