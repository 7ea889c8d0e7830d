//! Error types for the firewall workflow.
//!
//! Messages must never contain passwords, client secrets or bearer tokens.

use std::fmt;

/// A required connection-string field that was absent or empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingField {
    User,
    Password,
    Database,
    Server,
    ClientId,
    ClientSecret,
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            MissingField::User => {
                "Invalid connection string. Please ensure 'User' or 'User ID' is provided in the connection string."
            }
            MissingField::Password => {
                "Invalid connection string. Please ensure 'Password' is provided in the connection string."
            }
            MissingField::Database => {
                "Invalid connection string. Please ensure 'Database' or 'Initial Catalog' is provided in the connection string."
            }
            MissingField::Server => {
                "Invalid connection string. Please ensure 'Server' or 'Data Source' is provided in the connection string."
            }
            MissingField::ClientId => {
                "Invalid connection string. Please ensure client ID is provided in the 'User' or 'User ID' field of the connection string."
            }
            MissingField::ClientSecret => {
                "Invalid connection string. Please ensure client secret is provided in the 'Password' field of the connection string."
            }
        };
        f.write_str(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionStringError {
    #[error("Connection string is not in the correct format: {0}")]
    Malformed(String),

    #[error("Authentication type '{0}' is not supported.")]
    UnsupportedAuthentication(String),

    #[error("{0}")]
    MissingField(MissingField),
}

/// Network failure classes seen by the HTTP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnectionReset,
    ConnectionRefused,
    ConnectionAborted,
    TimedOut,
    HostUnreachable,
    BrokenPipe,
    NameResolution,
    Other,
}

impl NetworkErrorKind {
    pub fn is_transient(&self) -> bool {
        !matches!(self, NetworkErrorKind::Other)
    }
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkErrorKind::ConnectionReset => "connection reset",
            NetworkErrorKind::ConnectionRefused => "connection refused",
            NetworkErrorKind::ConnectionAborted => "connection aborted",
            NetworkErrorKind::TimedOut => "timed out",
            NetworkErrorKind::HostUnreachable => "host unreachable",
            NetworkErrorKind::BrokenPipe => "broken pipe",
            NetworkErrorKind::NameResolution => "name resolution failed",
            NetworkErrorKind::Other => "network error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("{kind}: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("Request cancelled before completion")]
    Cancelled,
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Network { kind, .. } => kind.is_transient(),
            TransportError::Cancelled => false,
        }
    }
}

/// Error returned by the management API, decoded from its error envelope
/// when one is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteApiError {
    pub status: u16,
    pub code: Option<String>,
    pub message: String,
    pub details: Vec<String>,
}

impl fmt::Display for RemoteApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {}", self.message, self.status)?;
        if let Some(code) = &self.code {
            write!(f, ", code {}", code)?;
        }
        f.write_str(")")?;
        if !self.details.is_empty() {
            write!(f, ": {}", self.details.join("; "))?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteApiError {}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error(
        "Unable to get details of SQL server {0}. Sql server '{0}' was not found in the subscription."
    )]
    ServerNotFound(String),

    #[error("Unable to get details of SQL server {0}. No SQL servers are found in the subscription.")]
    NoServersInSubscription(String),

    #[error("Management API request failed: {0}")]
    RemoteApi(#[from] RemoteApiError),

    #[error("Network error during a management API request: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to obtain an access token: {0}")]
    Authorization(String),

    #[error("Unexpected management API response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("Unable to determine whether '{server}' is reachable: {message}")]
    ProbeInconclusive { server: String, message: String },

    #[error("Failed to add a firewall rule for {ip}: {source}")]
    Provision {
        ip: String,
        #[source]
        source: DirectoryError,
    },

    #[error(transparent)]
    Workload(anyhow::Error),
}
