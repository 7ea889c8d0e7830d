pub mod errors;
pub mod mask;
pub mod retry;

pub use errors::{
    ConnectionStringError, DirectoryError, FirewallError, MissingField, NetworkErrorKind,
    RemoteApiError, TransportError,
};
pub use mask::{ActionsMasker, SecretMasker, SecretRegistry};
