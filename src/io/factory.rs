//! Opening and bootstrapping node connections

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use super::connection::{Connection, ConnectionError, ConnectionSettings, MultiplexingConnection};
use super::stream::MaybeSecureStream;
use crate::topology::HostEndpoint;

/// Opens transport connections to a node
pub trait ConnectionFactory: Send + Sync {
    fn connect<'a>(
        &'a self,
        endpoint: &'a HostEndpoint,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Connection>, ConnectionError>> + Send + 'a>>;
}

/// Protocol handshake run on every new connection
///
/// Implementations send HELLO, authenticate and select buckets using the
/// wire encoding of the protocol; the transport only sequences the calls.
pub trait ConnectionInitializer: Send + Sync {
    fn initialize<'a>(
        &'a self,
        connection: &'a dyn Connection,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send + 'a>>;

    fn select_bucket<'a>(
        &'a self,
        connection: &'a dyn Connection,
        bucket: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send + 'a>>;
}

/// Initializer for servers that need no handshake
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInitializer;

impl ConnectionInitializer for NoopInitializer {
    fn initialize<'a>(
        &'a self,
        connection: &'a dyn Connection,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send + 'a>> {
        Box::pin(async move {
            connection.mark_authenticated();
            Ok(())
        })
    }

    fn select_bucket<'a>(
        &'a self,
        _connection: &'a dyn Connection,
        _bucket: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Factory dialing TCP, optionally wrapped in TLS
pub struct TcpConnectionFactory {
    connect_timeout: Duration,
    settings: ConnectionSettings,
    #[cfg(feature = "tls")]
    tls: Option<tokio_rustls::TlsConnector>,
}

impl TcpConnectionFactory {
    pub fn new(connect_timeout: Duration, settings: ConnectionSettings) -> Self {
        TcpConnectionFactory {
            connect_timeout,
            settings,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, connector: tokio_rustls::TlsConnector) -> Self {
        self.tls = Some(connector);
        self
    }

    async fn open(&self, endpoint: &HostEndpoint) -> Result<MaybeSecureStream, ConnectionError> {
        let tcp = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| ConnectionError::ConnectTimeout(self.connect_timeout))??;
        tcp.set_nodelay(true)?;

        #[cfg(feature = "tls")]
        {
            if let Some(connector) = &self.tls {
                let name = super::tls::server_name(&endpoint.host)
                    .map_err(|e| ConnectionError::Tls(e.to_string()))?;
                let stream =
                    tokio::time::timeout(self.connect_timeout, connector.connect(name, tcp))
                        .await
                        .map_err(|_| ConnectionError::ConnectTimeout(self.connect_timeout))?
                        .map_err(|e| ConnectionError::Tls(e.to_string()))?;
                return Ok(MaybeSecureStream::tls(stream));
            }
        }

        Ok(MaybeSecureStream::plain(tcp))
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn connect<'a>(
        &'a self,
        endpoint: &'a HostEndpoint,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Connection>, ConnectionError>> + Send + 'a>> {
        Box::pin(async move {
            let stream = self.open(endpoint).await?;
            let local = stream.local_addr().ok();
            let remote = stream.peer_addr().ok();
            debug!(endpoint = %endpoint, tls = stream.is_tls(), "dialed node");
            let connection: Arc<dyn Connection> = Arc::new(MultiplexingConnection::new(
                stream,
                local,
                remote,
                self.settings.clone(),
            ));
            Ok(connection)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let factory = TcpConnectionFactory::new(Duration::from_secs(1), ConnectionSettings::default());
        let endpoint = HostEndpoint::new("127.0.0.1", addr.port());
        let connection = factory.connect(&endpoint).await.unwrap();
        assert_eq!(connection.remote_addr(), Some(addr));
        assert!(!connection.is_dead());

        let _server_side = accept.await.unwrap();
        NoopInitializer.initialize(connection.as_ref()).await.unwrap();
        assert!(connection.is_authenticated());
        connection.close();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let factory = TcpConnectionFactory::new(Duration::from_secs(1), ConnectionSettings::default());
        let result = factory.connect(&HostEndpoint::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(ConnectionError::Io(_))));
    }
}
