//! Certificates and rustls configurations shared by the TLS and QUIC
//! transports.
//!
//! The server presents either a PEM certificate from disk or a freshly
//! generated self-signed one. The client accepts whatever certificate the
//! server presents: this is a load generator, not a secure channel.
//! `SSLKEYLOGFILE` is honoured on both sides for packet captures.

use crate::{Config, Error, Result};
use log::info;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{self, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme, SupportedProtocolVersion};
use std::path::Path;
use std::sync::Arc;

fn tls_err(e: impl std::fmt::Display) -> Error {
    Error::Tls(e.to_string())
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(crypto::ring::default_provider())
}

/// Certificate chain and private key presented by the server.
pub struct CertBundle {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl CertBundle {
    /// Generates a self-signed certificate for `server_name`.
    pub fn self_signed(server_name: &str) -> Result<Self> {
        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
            .map_err(tls_err)?;
        let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
        Ok(Self {
            chain: vec![CertificateDer::from(cert.cert)],
            key: PrivateKeyDer::Pkcs8(key),
        })
    }

    /// Loads a PEM certificate chain and private key.
    pub fn from_pem_files(cert: &Path, key: &Path) -> Result<Self> {
        let chain = CertificateDer::pem_file_iter(cert)
            .map_err(|e| Error::Tls(format!("{}: {}", cert.display(), e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Tls(format!("{}: {}", cert.display(), e)))?;
        if chain.is_empty() {
            return Err(Error::Tls(format!(
                "{}: no certificates found",
                cert.display()
            )));
        }
        let key = PrivateKeyDer::from_pem_file(key)
            .map_err(|e| Error::Tls(format!("{}: {}", key.display(), e)))?;
        Ok(Self { chain, key })
    }

    /// The configured PEM files, or a self-signed certificate.
    pub fn from_config(config: &Config) -> Result<Self> {
        match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) => {
                info!("Loading TLS certificate from {}", cert.display());
                Self::from_pem_files(cert, key)
            }
            _ => {
                info!(
                    "Generating self-signed TLS certificate for {}",
                    config.server_name
                );
                Self::self_signed(&config.server_name)
            }
        }
    }
}

/// Server-side rustls configuration.
pub fn server_config(
    bundle: &CertBundle,
    versions: &[&'static SupportedProtocolVersion],
    alpn: &[&[u8]],
) -> Result<rustls::ServerConfig> {
    let mut cfg = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(versions)
        .map_err(tls_err)?
        .with_no_client_auth()
        .with_single_cert(bundle.chain.clone(), bundle.key.clone_key())
        .map_err(tls_err)?;
    cfg.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    cfg.key_log = Arc::new(rustls::KeyLogFile::new());
    Ok(cfg)
}

/// Client-side rustls configuration that skips certificate verification.
pub fn client_config(
    versions: &[&'static SupportedProtocolVersion],
    alpn: &[&[u8]],
) -> Result<rustls::ClientConfig> {
    let provider = provider();
    let mut cfg = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(versions)
        .map_err(tls_err)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
        .with_no_client_auth();
    cfg.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    cfg.key_log = Arc::new(rustls::KeyLogFile::new());
    Ok(cfg)
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_bundle_builds_configs() {
        let bundle = CertBundle::self_signed("localhost").unwrap();
        assert_eq!(bundle.chain.len(), 1);
        server_config(&bundle, rustls::ALL_VERSIONS, &[]).unwrap();
        client_config(&[&rustls::version::TLS13], &[b"streamload"]).unwrap();
    }

    #[test]
    fn test_missing_pem_files_are_tls_errors() {
        let err = CertBundle::from_pem_files(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Tls(_)));
    }

    #[test]
    fn test_config_without_files_self_signs() {
        let config = Config::new("127.0.0.1:0");
        let bundle = CertBundle::from_config(&config).unwrap();
        assert!(!bundle.chain.is_empty());
    }
}
