use std::time::Duration;

use async_trait::async_trait;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncWriteCompatExt;

use crate::connection::{AuthenticationMode, ConnectionDescriptor, Password};
use crate::probe::{ConnectError, SqlConnector};

pub const DEFAULT_PORT: u16 = 1433;
const APPLICATION_NAME: &str = "azsql-firewall";

/// Production connector speaking TDS over a tokio TCP stream.
#[derive(Clone)]
pub struct SqlServerConnector {
    connect_timeout: Duration,
    access_token: Option<Password>,
}

impl SqlServerConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            access_token: None,
        }
    }

    /// Database-scoped token used for the Active Directory modes. Without it
    /// those logins are attempted with an empty token, which still lets the
    /// gateway report a firewall block.
    pub fn with_access_token(mut self, token: Password) -> Self {
        self.access_token = Some(token);
        self
    }

    fn config(&self, descriptor: &ConnectionDescriptor, database: &str) -> Config {
        let mut config = Config::new();
        config.host(&descriptor.server);
        config.port(descriptor.port.unwrap_or(DEFAULT_PORT));
        config.database(database);
        config.application_name(APPLICATION_NAME);
        config.encryption(EncryptionLevel::Required);
        let auth = match descriptor.authentication_mode() {
            AuthenticationMode::SqlPassword => {
                AuthMethod::sql_server(&descriptor.user_id, descriptor.password.expose())
            }
            _ => {
                let token = self
                    .access_token
                    .as_ref()
                    .map(|t| t.expose().to_string())
                    .unwrap_or_default();
                AuthMethod::aad_token(token)
            }
        };
        config.authentication(auth);
        config
    }

    async fn open_and_close(mut config: Config) -> Result<(), tiberius::error::Error> {
        // Azure gateways may redirect once to the node hosting the database.
        for _ in 0..2 {
            let tcp = TcpStream::connect(config.get_addr()).await?;
            tcp.set_nodelay(true)?;
            match Client::connect(config.clone(), tcp.compat_write()).await {
                Ok(client) => return client.close().await,
                Err(tiberius::error::Error::Routing { host, port }) => {
                    tracing::debug!("Redirected to {}:{}", host, port);
                    config.host(&host);
                    config.port(port);
                }
                Err(e) => return Err(e),
            }
        }
        Err(tiberius::error::Error::Protocol(
            "server redirected the connection more than once".into(),
        ))
    }

    /// Never names the host: a literal IP in the message would be taken
    /// for the client address the gateway reports.
    fn timeout_error(&self, descriptor: &ConnectionDescriptor) -> ConnectError {
        tracing::debug!(
            "Connection to {} timed out after {:?}",
            descriptor.server_address(),
            self.connect_timeout
        );
        ConnectError::new(format!("Connection timed out after {:?}", self.connect_timeout))
    }
}

#[async_trait]
impl SqlConnector for SqlServerConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        database: &str,
    ) -> Result<(), ConnectError> {
        let config = self.config(descriptor, database);
        match tokio::time::timeout(self.connect_timeout, Self::open_and_close(config)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectError::from_error(&e)),
            Err(_) => Err(self.timeout_error(descriptor)),
        }
    }
}
