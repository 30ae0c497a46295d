//! TLS material for the fog platform channel.
//!
//! The channel is encrypted whenever a CA bundle is configured; a client
//! certificate and key, when given, authenticate the gateway to the fog.
//! Everything is read once at startup so a bad file stops the daemon
//! before any device traffic is accepted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use tokio_rustls::TlsConnector;

use fogbridge_core::config::PlatformConfig;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("client certificate and key must be configured together")]
    IncompleteIdentity,

    #[error("client certificate requires a CA bundle to verify the platform")]
    MissingCa,

    #[error("invalid platform server name {0:?}")]
    ServerName(String),

    #[error("TLS setup failed: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Everything needed to open a TLS session to the platform.
#[derive(Clone)]
pub struct PlatformTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    client_auth: bool,
}

impl std::fmt::Debug for PlatformTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformTls")
            .field("server_name", &self.server_name)
            .field("client_auth", &self.client_auth)
            .finish()
    }
}

impl PlatformTls {
    /// Build the connector from the configured PEM files.
    ///
    /// `Ok(None)` means no TLS material is configured and the channel runs
    /// in plaintext.
    pub fn from_config(config: &PlatformConfig) -> Result<Option<Self>, TlsError> {
        let identity = match (&config.cert_path, &config.key_path) {
            (Some(cert), Some(key)) => Some((load_certs(cert)?, load_key(key)?)),
            (None, None) => None,
            _ => return Err(TlsError::IncompleteIdentity),
        };

        let Some(ca_path) = &config.ca_path else {
            if identity.is_some() {
                return Err(TlsError::MissingCa);
            }
            return Ok(None);
        };

        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots.add(cert)?;
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
        let client_auth = identity.is_some();
        let tls = match identity {
            Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
            None => builder.with_no_client_auth(),
        };

        let name = config.tls_server_name().to_string();
        let server_name =
            ServerName::try_from(name.clone()).map_err(|_| TlsError::ServerName(name))?;

        Ok(Some(Self {
            connector: TlsConnector::from(Arc::new(tls)),
            server_name,
            client_auth,
        }))
    }

    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    pub fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }

    /// Whether the gateway presents its own certificate.
    pub fn client_auth(&self) -> bool {
        self.client_auth
    }
}

// ── PEM loading ───────────────────────────────────────────────────────────────

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = std::fs::read(path).map_err(|e| TlsError::Read(path.to_path_buf(), e))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Read(path.to_path_buf(), e))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = std::fs::read(path).map_err(|e| TlsError::Read(path.to_path_buf(), e))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| TlsError::Read(path.to_path_buf(), e))?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}
