//! TLS configuration for both sides of the proxy
//!
//! The frontend listener serves a certificate/key pair loaded from PEM
//! files. The upstream connector either verifies against the Mozilla CA
//! bundle or, when the backend is configured that way, skips certificate
//! verification entirely; skipping is an explicit configuration choice,
//! never a hidden default.

use anyhow::{anyhow, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build a TLS acceptor for the frontend listener from PEM files
pub fn server_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let (certs, key) = load_cert_files(cert_path, key_path)?;
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow!("failed to build TLS server config: {}", e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("invalid TLS certificate/key pair: {}", e))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a TLS connector for upstream connections
///
/// With `verify_cert` false the connector accepts any certificate.
pub fn client_connector(verify_cert: bool) -> Result<TlsConnector> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow!("failed to build TLS client config: {}", e))?;

    let config = if verify_cert {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Load certificate chain and private key from PEM files
fn load_cert_files(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(cert_path)
            .with_context(|| format!("failed to open TLS certificate '{}'", cert_path))?,
    );
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse TLS certificate '{}'", cert_path))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in '{}'", cert_path);
    }

    let mut reader = std::io::BufReader::new(
        std::fs::File::open(key_path)
            .with_context(|| format!("failed to open TLS key '{}'", key_path))?,
    );
    let key = loop {
        match rustls_pemfile::read_one(&mut reader)
            .with_context(|| format!("failed to parse TLS key '{}'", key_path))?
        {
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => break PrivateKeyDer::Pkcs8(key),
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => break PrivateKeyDer::Pkcs1(key),
            Some(rustls_pemfile::Item::Sec1Key(key)) => break PrivateKeyDer::Sec1(key),
            Some(_) => continue,
            None => anyhow::bail!("no private key found in '{}'", key_path),
        }
    };

    Ok((certs, key))
}

/// Certificate verifier that accepts anything
///
/// Only installed when the backend configuration disables verification.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_builds_both_modes() {
        assert!(client_connector(true).is_ok());
        assert!(client_connector(false).is_ok());
    }

    #[test]
    fn test_server_acceptor_missing_files() {
        let result = server_acceptor("/nonexistent/cert.pem", "/nonexistent/key.pem");
        match result {
            Err(e) => assert!(e.to_string().contains("failed to open TLS certificate")),
            Ok(_) => panic!("expected an error"),
        }
    }
}
