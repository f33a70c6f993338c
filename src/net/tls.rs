//! TLS configuration and certificate loading.
//!
//! Two sides use TLS here: the public listener (server certificate, served by
//! axum-server) and a tunnel leg dialing a local HTTPS service (client config).

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

/// Errors raised while building a TLS configuration.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("a client certificate needs both a cert and a key file")]
    IncompleteIdentity,
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Install the ring crypto provider as the process default.
///
/// axum-server builds its `ServerConfig` from the process default, so this
/// must run before [`load_tls_config`]. Calling it twice is harmless.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Load TLS configuration for the public listener from PEM files.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, std::io::Error> {
    if !cert_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        ));
    }
    if !key_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        ));
    }

    install_crypto_provider();
    RustlsConfig::from_pem_file(cert_path, key_path).await
}

/// TLS material used when a leg dials a local HTTPS service.
#[derive(Debug, Clone, Default)]
pub struct LocalTlsOptions {
    /// Client certificate presented to the local service.
    pub cert: Option<PathBuf>,
    /// Key for `cert`.
    pub key: Option<PathBuf>,
    /// CA used to verify the local service instead of the webpki roots.
    pub ca: Option<PathBuf>,
    /// Skip certificate verification entirely.
    pub allow_invalid_cert: bool,
}

/// Build a connector for local HTTPS services.
pub fn local_connector(options: &LocalTlsOptions) -> Result<TlsConnector, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let config = if options.allow_invalid_cert {
        tracing::warn!("Certificate verification disabled for the local service");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier { provider }))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        match &options.ca {
            Some(ca) => {
                for cert in load_certs(ca)? {
                    roots.add(cert)?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        let builder = builder.with_root_certificates(roots);
        match (&options.cert, &options.key) {
            (Some(cert), Some(key)) => builder.with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)?,
            (None, None) => builder.with_no_client_auth(),
            _ => return Err(TlsError::IncompleteIdentity),
        }
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Server name used for SNI and verification of `host`.
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(host.to_string()).map_err(|_| TlsError::InvalidServerName(host.to_string()))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read { path: path.to_path_buf(), source })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read { path: path.to_path_buf(), source })
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read { path: path.to_path_buf(), source })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Accepts any server certificate.
///
/// Only used when the operator passes `allow_invalid_cert`; the connection
/// is open to man-in-the-middle attacks.
#[derive(Debug)]
struct InsecureServerCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
