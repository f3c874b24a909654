//! TLS trust configuration for vCenter/OpenStack HTTP clients
//! (SPEC_FULL.md §4.2b), and leaf-certificate SHA-1 thumbprint
//! extraction for `GetThumbprint` (spec.md §4.2).
//!
//! `reqwest`'s `danger_accept_invalid_certs` covers the "don't verify"
//! case, but extracting the leaf certificate for a thumbprint needs the
//! raw TLS handshake, not just an HTTP response — hence a direct
//! `rustls`/`tokio` connection here alongside the `reqwest::ClientBuilder`
//! helper.

use std::sync::Arc;

use reqwest::ClientBuilder;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Returns a `reqwest::ClientBuilder` configured per
/// `EngineConfig.tls_verify`.
#[must_use]
pub fn client_builder(tls_verify: bool) -> ClientBuilder {
    let builder = ClientBuilder::new();
    if tls_verify {
        builder
    } else {
        builder.danger_accept_invalid_certs(true)
    }
}

/// A verifier that accepts any certificate. Only used transiently, to
/// complete a handshake purely for thumbprint extraction — this never
/// protects data in transit.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
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
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Connects to `host:port`, completes a TLS handshake without verifying
/// the certificate, and returns the SHA-1 of the leaf certificate's DER
/// encoding, formatted as uppercase colon-separated hex
/// (spec.md §4.2 `GetThumbprint`, §8 "Thumbprint" invariant).
pub async fn leaf_certificate_sha1_thumbprint(
    host: &str,
    port: u16,
) -> Result<String, std::io::Error> {
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    config.enable_sni = true;
    let connector = TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect((host, port)).await?;
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let tls_stream = connector.connect(server_name, tcp).await?;
    let (_, session) = tls_stream.get_ref();
    let cert = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "no peer certificate presented")
        })?;

    let digest = Sha1::digest(cert.as_ref());
    Ok(format_thumbprint(&digest))
}

/// Renders a digest as uppercase colon-separated hex.
fn format_thumbprint(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumbprint_is_uppercase_colon_separated() {
        let digest = [0xAAu8, 0x0F, 0xFF];
        assert_eq!(format_thumbprint(&digest), "AA:0F:FF");
    }
}
