//! Client TLS configuration
//!
//! Certificate validation policy is decided by the caller: either a ready
//! rustls `ClientConfig`, or PEM files naming the trusted CA and, for mutual
//! TLS, a client certificate and key.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls_pemfile::{certs, private_key};
use tokio_rustls::rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    ClientConfig, RootCertStore,
};
use tokio_rustls::TlsConnector;

/// TLS-related errors
#[derive(Debug)]
pub enum TlsError {
    /// Failed to read a PEM file
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    /// No certificates found in file
    NoCertificates { path: PathBuf },
    /// No private key found in file
    NoPrivateKey { path: PathBuf },
    /// Invalid certificate
    InvalidCertificate { reason: String },
    /// The host cannot be used as a TLS server name
    InvalidServerName { host: String },
    /// TLS configuration error
    ConfigError { reason: String },
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::ReadError { path, source } => {
                write!(f, "Failed to read {:?}: {}", path, source)
            }
            TlsError::NoCertificates { path } => {
                write!(f, "No certificates found in {:?}", path)
            }
            TlsError::NoPrivateKey { path } => {
                write!(f, "No private key found in {:?}", path)
            }
            TlsError::InvalidCertificate { reason } => {
                write!(f, "Invalid certificate: {}", reason)
            }
            TlsError::InvalidServerName { host } => {
                write!(f, "Invalid TLS server name: {}", host)
            }
            TlsError::ConfigError { reason } => {
                write!(f, "TLS configuration error: {}", reason)
            }
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TlsError::ReadError { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Where the client's trust and identity come from
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// CA bundle the server chain must verify against (PEM)
    pub ca_path: Option<PathBuf>,
    /// Client certificate chain for mutual TLS (PEM)
    pub cert_path: Option<PathBuf>,
    /// Client private key for mutual TLS (PEM)
    pub key_path: Option<PathBuf>,
    prebuilt: Option<Arc<ClientConfig>>,
}

impl TlsClientConfig {
    pub fn new(ca_path: impl AsRef<Path>) -> Self {
        TlsClientConfig {
            ca_path: Some(ca_path.as_ref().to_path_buf()),
            cert_path: None,
            key_path: None,
            prebuilt: None,
        }
    }

    /// Use an already validated rustls configuration as-is
    pub fn from_rustls(config: Arc<ClientConfig>) -> Self {
        TlsClientConfig {
            ca_path: None,
            cert_path: None,
            key_path: None,
            prebuilt: Some(config),
        }
    }

    /// Present a client certificate (mutual TLS)
    pub fn with_client_cert(mut self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Self {
        self.cert_path = Some(cert_path.as_ref().to_path_buf());
        self.key_path = Some(key_path.as_ref().to_path_buf());
        self
    }

    fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        let file = File::open(path).map_err(|e| TlsError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut reader = BufReader::new(file);
        let certs: Vec<_> = certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::ReadError {
                path: path.to_path_buf(),
                source: e,
            })?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificates {
                path: path.to_path_buf(),
            });
        }
        Ok(certs)
    }

    fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
        let file = File::open(path).map_err(|e| TlsError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut reader = BufReader::new(file);
        private_key(&mut reader)
            .map_err(|e| TlsError::ReadError {
                path: path.to_path_buf(),
                source: e,
            })?
            .ok_or_else(|| TlsError::NoPrivateKey {
                path: path.to_path_buf(),
            })
    }

    /// Build a connector from this configuration
    pub fn build_connector(&self) -> Result<TlsConnector, TlsError> {
        if let Some(config) = &self.prebuilt {
            return Ok(TlsConnector::from(config.clone()));
        }
        let ca_path = self.ca_path.as_ref().ok_or_else(|| TlsError::ConfigError {
            reason: "a CA bundle is required".to_string(),
        })?;

        let mut roots = RootCertStore::empty();
        for cert in Self::read_certs(ca_path)? {
            roots
                .add(cert)
                .map_err(|e| TlsError::InvalidCertificate {
                    reason: e.to_string(),
                })?;
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let config = match (&self.cert_path, &self.key_path) {
            (Some(cert_path), Some(key_path)) => builder
                .with_client_auth_cert(Self::read_certs(cert_path)?, Self::read_key(key_path)?)
                .map_err(|e| TlsError::ConfigError {
                    reason: e.to_string(),
                })?,
            _ => builder.with_no_client_auth(),
        };
        Ok(TlsConnector::from(Arc::new(config)))
    }
}

/// Server name to verify the node's certificate against
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(host.to_string()).map_err(|_| TlsError::InvalidServerName {
        host: host.to_string(),
    })
}
