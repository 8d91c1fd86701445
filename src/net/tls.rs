//! TLS configuration and certificate loading.
//!
//! # Responsibilities
//! - Load the certificate chain and private key (PEM)
//! - Require client certificates when a trust bundle is configured
//! - Restrict protocol versions and cipher suites by name
//! - Enforce the SNI allow-list after the handshake

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, SupportedProtocolVersion};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;

use crate::config::TlsConfig;

/// Error type for TLS setup and handshakes.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("No certificates found in {0}")]
    NoCertificates(String),
    #[error("No private key found in {0}")]
    NoPrivateKey(String),
    #[error("Unknown TLS protocol version: {0}")]
    UnknownProtocol(String),
    #[error("None of the configured cipher suites are supported: {0:?}")]
    NoCipherSuites(Vec<String>),
    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("Client verifier rejected: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
    #[error("TLS handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("SNI host name {0:?} is not accepted")]
    HostnameRejected(Option<String>),
}

/// Ready-to-use server side TLS.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: tokio_rustls::TlsAcceptor,
    verify_hostname: bool,
    server_names: Arc<[String]>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("verify_hostname", &self.verify_hostname)
            .field("server_names", &self.server_names)
            .finish()
    }
}

impl TlsContext {
    /// Build the server configuration from files on disk.
    pub fn from_config(config: &TlsConfig) -> Result<Self, TlsError> {
        let certs = load_certs(Path::new(&config.cert_path))?;
        let key = load_key(Path::new(&config.key_path))?;

        let mut provider = rustls::crypto::ring::default_provider();
        if !config.ciphers.is_empty() {
            provider.cipher_suites.retain(|suite| {
                let name = format!("{:?}", suite.suite());
                config.ciphers.iter().any(|c| c.eq_ignore_ascii_case(&name))
            });
            if provider.cipher_suites.is_empty() {
                return Err(TlsError::NoCipherSuites(config.ciphers.clone()));
            }
        }
        let provider = Arc::new(provider);
        let versions = protocol_versions(&config.protocols)?;

        let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&versions)?;

        let builder = match &config.trust_ca_path {
            Some(ca_path) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(Path::new(ca_path))? {
                    roots.add(cert)?;
                }
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider).build()?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut server_config = builder.with_single_cert(certs, key)?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        tracing::info!(
            cert = %config.cert_path,
            mutual = config.trust_ca_path.is_some(),
            protocols = ?config.protocols,
            verify_hostname = config.verify_hostname,
            "TLS configured"
        );

        Ok(Self {
            acceptor: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
            verify_hostname: config.verify_hostname,
            server_names: config.server_names.clone().into(),
        })
    }

    /// Run the server handshake, bounded by `timeout`, then check SNI.
    pub async fn accept<S>(&self, stream: S, timeout: Duration) -> Result<TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let tls = tokio::time::timeout(timeout, self.acceptor.accept(stream))
            .await
            .map_err(|_| TlsError::HandshakeTimeout(timeout))?
            .map_err(TlsError::Handshake)?;

        if self.verify_hostname {
            let sni = tls.get_ref().1.server_name();
            if !sni_allowed(&self.server_names, sni) {
                return Err(TlsError::HostnameRejected(sni.map(str::to_string)));
            }
        }
        Ok(tls)
    }
}

/// Whether the SNI name the client sent is on the allow-list.
/// Wildcard entries (`*.example.com`) match exactly one label.
pub fn sni_allowed(allowed: &[String], sni: Option<&str>) -> bool {
    let Some(sni) = sni else {
        return false;
    };
    allowed.iter().any(|name| match name.strip_prefix("*.") {
        Some(suffix) => sni
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest.eq_ignore_ascii_case(suffix)),
        None => name.eq_ignore_ascii_case(sni),
    })
}

fn protocol_versions(names: &[String]) -> Result<Vec<&'static SupportedProtocolVersion>, TlsError> {
    names
        .iter()
        .map(|name| match name.as_str() {
            "TLSv1.3" => Ok(&rustls::version::TLS13),
            "TLSv1.2" => Ok(&rustls::version::TLS12),
            other => Err(TlsError::UnknownProtocol(other.to_string())),
        })
        .collect()
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path).map(BufReader::new).map_err(|source| TlsError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}
