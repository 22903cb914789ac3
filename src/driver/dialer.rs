//! Opening sockets: DNS resolution, dial timeout, optional TLS.

use super::stream::ChStream;
use crate::config::{ChConfig, TlsConfig};
use crate::error::{ChResult, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};

/// Opens the raw stream for a new connection.
///
/// The pool calls `dial` for every new connection and for reconnect attempts
/// while the server is unreachable.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> ChResult<ChStream>;
}

/// Default dialer: resolves `addr` on every dial, so DNS changes are picked
/// up by new connections, and tries each resolved address in turn.
pub struct TcpDialer {
    timeout: Duration,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl TcpDialer {
    pub fn new(config: &ChConfig) -> ChResult<Self> {
        let tls = match &config.tls {
            Some(tls) => Some(tls_connector(tls, config.host())?),
            None => None,
        };
        Ok(Self {
            timeout: config.dial_timeout,
            tls,
        })
    }

    async fn connect(&self, addr: &str) -> ChResult<ChStream> {
        let dial_err = |message: String| TransportError::Dial {
            addr: addr.to_string(),
            message,
        };

        let mut last_err = None;
        let mut tcp = None;
        for sock in tokio::net::lookup_host(addr)
            .await
            .map_err(|e| dial_err(e.to_string()))?
        {
            match TcpStream::connect(sock).await {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let tcp = match (tcp, last_err) {
            (Some(tcp), _) => tcp,
            (None, Some(e)) => return Err(dial_err(e.to_string()).into()),
            (None, None) => return Err(dial_err("no addresses resolved".to_string()).into()),
        };
        tcp.set_nodelay(true).map_err(|e| dial_err(e.to_string()))?;

        match &self.tls {
            None => Ok(ChStream::Tcp(tcp)),
            Some((connector, server_name)) => {
                let stream = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|e| TransportError::Tls(format!("handshake failed: {}", e)))?;
                Ok(ChStream::Tls(stream))
            }
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> ChResult<ChStream> {
        match tokio::time::timeout(self.timeout, self.connect(addr)).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout("dial").into()),
        }
    }
}

fn tls_connector(
    config: &TlsConfig,
    host: &str,
) -> ChResult<(TlsConnector, ServerName<'static>)> {
    if config.client_cert_pem.is_some() != config.client_key_pem.is_some() {
        return Err(TransportError::Tls("client certificate and key must be set together".to_string()).into());
    }

    let mut root_cert_store = tokio_rustls::rustls::RootCertStore::empty();
    if let Some(ca_pem) = &config.ca_cert_pem {
        for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()).filter_map(|r| r.ok()) {
            root_cert_store
                .add(cert)
                .map_err(|e| TransportError::Tls(format!("invalid CA certificate: {}", e)))?;
        }
    } else {
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            let _ = root_cert_store.add(cert);
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(root_cert_store);
    let tls_config = match (&config.client_cert_pem, &config.client_key_pem) {
        (Some(cert_pem), Some(key_pem)) => {
            let client_certs: Vec<CertificateDer<'static>> =
                rustls_pemfile::certs(&mut cert_pem.as_slice())
                    .filter_map(|r| r.ok())
                    .collect();
            let client_key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                .map_err(|e| TransportError::Tls(format!("invalid client key: {}", e)))?
                .ok_or_else(|| TransportError::Tls("no private key found in PEM".to_string()))?;
            builder
                .with_client_auth_cert(client_certs, client_key)
                .map_err(|e| TransportError::Tls(format!("invalid client cert/key: {}", e)))?
        }
        _ => builder.with_no_client_auth(),
    };

    let name = config.server_name.as_deref().unwrap_or(host).to_string();
    let server_name = ServerName::try_from(name)
        .map_err(|_| TransportError::Tls("invalid hostname for TLS".to_string()))?;

    Ok((TlsConnector::from(Arc::new(tls_config)), server_name))
}
