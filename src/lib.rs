//! Temporary firewall access to Azure SQL servers for CI runners.
//!
//! [`FirewallManager::run`] probes the server, opens a single-address
//! firewall rule when the runner is blocked, runs the caller's workload and
//! removes the rule again on every exit path.

pub mod azure;
pub mod config;
pub mod connection;
pub mod firewall;
pub mod probe;
pub mod utils;

pub use azure::{Authorizer, CloudEnvironment, ResourceDirectory, StaticAuthorizer};
pub use config::{Config, init_logging};
pub use connection::{AuthenticationMode, ConnectionDescriptor, Password};
pub use firewall::{FirewallManager, LifecycleState};
pub use probe::{ConnectivityProbe, ProbeResult, SqlConnector};
pub use utils::{
    ActionsMasker, ConnectionStringError, DirectoryError, FirewallError, SecretMasker,
    SecretRegistry,
};
