//! Shared test utilities for the weft workspace.
//!
//! Socket pairs over real loopback TCP (in-memory pipes deadlock when
//! both ends start with a write) and throwaway TLS identities for
//! secure-channel tests.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

/// Creates a pair of connected TCP sockets over loopback.
pub async fn socket_pair() -> std::io::Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let connect = TcpStream::connect(addr);
    let accept = listener.accept();
    let (client, (server, _)) = tokio::try_join!(connect, accept)?;
    Ok((client, server))
}

/// A throwaway TLS identity: a self-signed server config and a client
/// config that accepts it.
pub struct TlsIdentity {
    /// Server-side TLS configuration.
    pub server: Arc<rustls::ServerConfig>,
    /// Client-side TLS configuration trusting any certificate.
    pub client: Arc<rustls::ClientConfig>,
    /// Name the certificate was issued for.
    pub server_name: rustls::pki_types::ServerName<'static>,
}

/// Generates a self-signed identity for `localhost`.
///
/// Test-only: the client side skips certificate verification entirely.
pub fn self_signed_identity() -> Result<TlsIdentity, Box<dyn std::error::Error>> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let cert_der = cert.cert.der().clone();
    let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let mut server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())?;
    // Session tickets are post-handshake records; with the frame-tunnel
    // handshake they would straddle the switch to pass-through mode.
    server.send_tls13_tickets = 0;

    let client = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
        .with_no_client_auth();

    Ok(TlsIdentity {
        server: Arc::new(server),
        client: Arc::new(client),
        server_name: rustls::pki_types::ServerName::try_from("localhost")?,
    })
}

/// Certificate verifier that accepts any certificate. Tests only.
#[derive(Debug)]
struct InsecureCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
