//! TLS material for the rack side of the region link.
//!
//! The channel is encrypted but certificate trust is deliberately absent:
//! endpoints prove themselves with the shared secret after the TLS upgrade,
//! so the client accepts whatever certificate the region presents. Both sides
//! still present a certificate, loaded from PEM files when configured or
//! generated fresh at startup otherwise.

use anyhow::{Context, Result};
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// A certificate chain and matching private key.
pub struct TlsIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read(cert_path)
            .with_context(|| format!("read certificate {}", cert_path.display()))?;
        let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("parse certificate {}", cert_path.display()))?;
        anyhow::ensure!(
            !certs.is_empty(),
            "no certificates found in {}",
            cert_path.display()
        );
        let key_pem =
            fs::read(key_path).with_context(|| format!("read key {}", key_path.display()))?;
        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .with_context(|| format!("parse key {}", key_path.display()))?
            .with_context(|| format!("no private key found in {}", key_path.display()))?;
        Ok(Self { certs, key })
    }

    /// Ephemeral self-signed identity for deployments with no provisioned
    /// certificate. Trust comes from the secret, not the certificate.
    pub fn generate(hostname: &str) -> Result<Self> {
        let certified = rcgen::generate_simple_self_signed(vec![hostname.to_string()])
            .context("generate self-signed certificate")?;
        let cert = certified.cert.der().clone();
        let key = PrivateKeyDer::try_from(certified.key_pair.serialize_der())
            .map_err(|e| anyhow::anyhow!("encode generated key: {e}"))?;
        Ok(Self {
            certs: vec![cert],
            key,
        })
    }

    pub fn client_config(&self) -> Result<ClientConfig> {
        let provider = Arc::new(ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .context("select protocol versions")?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_client_auth_cert(self.certs.clone(), self.key.clone_key())
            .context("build client config")?;
        Ok(config)
    }

    pub fn server_config(&self) -> Result<ServerConfig> {
        let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .context("select protocol versions")?
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .context("build server config")?;
        Ok(config)
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("certs", &self.certs.len())
            .finish_non_exhaustive()
    }
}

/// Accepts any server certificate; authentication happens at the application
/// layer with the shared secret. Signatures are still verified so the session
/// keys are bound to the presented certificate.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_builds_both_configs() {
        let identity = TlsIdentity::generate("rack-test").unwrap();
        identity.client_config().unwrap();
        identity.server_config().unwrap();
    }

    #[test]
    fn pem_files_round_trip() {
        let certified =
            rcgen::generate_simple_self_signed(vec!["rack-test".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("rack.crt");
        let key_path = dir.path().join("rack.key");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
        let identity = TlsIdentity::from_pem_files(&cert_path, &key_path).unwrap();
        identity.client_config().unwrap();
    }

    #[test]
    fn missing_pem_is_a_readable_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TlsIdentity::from_pem_files(
            &dir.path().join("absent.crt"),
            &dir.path().join("absent.key"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("absent.crt"));
    }
}
