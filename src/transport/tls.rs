//! TLS for member connections.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::channel::BoxedStream;
use super::{Address, MessagingError, Result, TlsConfig};

/// Acceptor and connector built from one certificate chain.
#[derive(Clone)]
pub(crate) struct TlsContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TlsContext {
    /// `None` when TLS is disabled.
    pub(crate) fn from_config(config: &TlsConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let chain_path = config
            .certificate_chain
            .as_deref()
            .ok_or_else(|| MessagingError::Tls("certificate_chain is required".to_string()))?;
        let key_path = config
            .private_key
            .as_deref()
            .ok_or_else(|| MessagingError::Tls("private_key is required".to_string()))?;

        let chain = load_certificates(chain_path)?;
        let key = load_private_key(key_path)?;

        let mut roots = RootCertStore::empty();
        let (added, _ignored) = roots.add_parsable_certificates(chain.iter().cloned());
        if added == 0 {
            return Err(MessagingError::Tls(
                "certificate chain contains no usable trust anchor".to_string(),
            ));
        }

        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| MessagingError::Tls(format!("Failed to build server TLS config: {e}")))?;
        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Some(Self {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            connector: TlsConnector::from(Arc::new(client)),
        }))
    }

    pub(crate) async fn accept(&self, stream: TcpStream) -> Result<BoxedStream> {
        let stream = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| MessagingError::Tls(format!("TLS accept failed: {e}")))?;
        Ok(Box::new(stream))
    }

    pub(crate) async fn connect(&self, address: &Address, stream: TcpStream) -> Result<BoxedStream> {
        let name = ServerName::try_from(address.host().to_string())
            .map_err(|e| MessagingError::Tls(format!("invalid server name '{}': {e}", address.host())))?;
        let stream = self
            .connector
            .connect(name, stream)
            .await
            .map_err(|e| MessagingError::Tls(format!("TLS connect to {address} failed: {e}")))?;
        Ok(Box::new(stream))
    }
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        MessagingError::Tls(format!("Failed to open certificate {}: {e}", path.display()))
    })?;
    let chain = certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| MessagingError::Tls(format!("Failed to parse certificates: {e}")))?;
    if chain.is_empty() {
        return Err(MessagingError::Tls("No certificates found in chain".to_string()));
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        MessagingError::Tls(format!("Failed to open private key {}: {e}", path.display()))
    })?;
    pkcs8_private_keys(&mut BufReader::new(file))
        .next()
        .ok_or_else(|| MessagingError::Tls("No private key found".to_string()))?
        .map(PrivateKeyDer::Pkcs8)
        .map_err(|e| MessagingError::Tls(format!("Failed to parse private key: {e}")))
}
