use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// Secret string, zeroized on drop. `Debug` and `Display` never show the value.
pub struct Password(SecretString);

impl Password {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl Default for Password {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl Clone for Password {
    fn clone(&self) -> Self {
        Self::new(self.expose())
    }
}

impl PartialEq for Password {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for Password {}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

impl fmt::Display for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AuthenticationMode {
    #[default]
    SqlPassword,
    ActiveDirectoryPassword,
    ActiveDirectoryServicePrincipal,
    ActiveDirectoryDefault,
}

impl AuthenticationMode {
    /// Canonical spelling, as written back into a connection string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthenticationMode::SqlPassword => "SQL Password",
            AuthenticationMode::ActiveDirectoryPassword => "Active Directory Password",
            AuthenticationMode::ActiveDirectoryServicePrincipal => {
                "Active Directory Service Principal"
            }
            AuthenticationMode::ActiveDirectoryDefault => "Active Directory Default",
        }
    }

    /// Accepts any casing, with or without the spaces between words.
    pub fn from_value(value: &str) -> Option<Self> {
        let normalized: String = value
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "sqlpassword" => Some(AuthenticationMode::SqlPassword),
            "activedirectorypassword" => Some(AuthenticationMode::ActiveDirectoryPassword),
            "activedirectoryserviceprincipal" => {
                Some(AuthenticationMode::ActiveDirectoryServicePrincipal)
            }
            "activedirectorydefault" => Some(AuthenticationMode::ActiveDirectoryDefault),
            _ => None,
        }
    }

    pub fn requires_credentials(&self) -> bool {
        !matches!(self, AuthenticationMode::ActiveDirectoryDefault)
    }
}

impl fmt::Display for AuthenticationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed and validated connection string.
///
/// Under service-principal authentication `user_id` holds the client ID and
/// `password` the client secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub server: String,
    pub port: Option<u16>,
    pub database: String,
    pub user_id: String,
    pub password: Password,
    /// `None` when the connection string did not name a mode.
    pub authentication: Option<AuthenticationMode>,
    /// Keys this crate does not interpret, in input order.
    pub extra: Vec<(String, String)>,
}

impl ConnectionDescriptor {
    pub fn authentication_mode(&self) -> AuthenticationMode {
        self.authentication.unwrap_or_default()
    }

    /// `host` or `host,port`, as a `Server=` value.
    pub fn server_address(&self) -> String {
        match self.port {
            Some(port) => format!("{},{}", self.server, port),
            None => self.server.clone(),
        }
    }
}
