//! Transport plumbing: timeout-wrapped dialing with retries, the TLS
//! identity used for encrypted peer links, and certificate keyprints.

use crate::{ClientError, ClientResult};
use dctk_hash::base32_encode;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-attempt dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial attempts for peer connections.
pub const DIAL_ATTEMPTS: u32 = 3;

/// A bidirectional byte stream, plain or TLS.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed stream handed to the framing layer.
pub type BoxStream = Box<dyn AsyncStream>;

/// Dial with a per-attempt timeout.
pub async fn dial(host: &str, port: u16, timeout: Duration) -> ClientResult<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ClientError::Transport(format!(
            "connect {}:{} failed: {}",
            host, port, e
        ))),
        Err(_) => Err(ClientError::Transport(format!(
            "connect {}:{} timed out",
            host, port
        ))),
    }
}

/// Dial with bounded retries, aborting on cancellation.
pub async fn dial_retries(
    host: &str,
    port: u16,
    cancel: &CancellationToken,
) -> ClientResult<TcpStream> {
    let mut last = ClientError::Transport("no dial attempts made".into());
    for attempt in 1..=DIAL_ATTEMPTS {
        tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Terminated),
            result = dial(host, port, DIAL_TIMEOUT) => match result {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!(host, port, attempt, error = %e, "peer dial failed");
                    last = e;
                }
            }
        }
    }
    Err(last)
}

/// `SHA256/<b32>` keyprint of a DER certificate.
pub fn keyprint_of(der: &[u8]) -> String {
    format!("SHA256/{}", base32_encode(&Sha256::digest(der)))
}

/// Self-signed TLS identity for encrypted hub and peer links.
pub struct TlsIdentity {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    /// Keyprint of our own certificate, advertised in ADC `INF`.
    pub keyprint: String,
}

impl TlsIdentity {
    /// Generate a fresh self-signed certificate.
    pub fn generate() -> ClientResult<TlsIdentity> {
        let issued = rcgen::generate_simple_self_signed(vec!["dctk".to_string()])
            .map_err(|e| ClientError::Config(format!("certificate generation failed: {}", e)))?;
        let cert_der = issued.cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(issued.key_pair.serialize_der().into());
        let keyprint = keyprint_of(cert_der.as_ref());

        let server = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| ClientError::Config(format!("tls server config failed: {}", e)))?;

        // Peers authenticate by keyprint, not by chain: accept any
        // certificate here and compare fingerprints after the handshake.
        let client = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
            .with_no_client_auth();

        Ok(TlsIdentity {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            connector: TlsConnector::from(Arc::new(client)),
            keyprint,
        })
    }

    /// Client-side handshake; returns the stream and the remote keyprint.
    pub async fn connect(
        &self,
        stream: TcpStream,
        host: &str,
    ) -> ClientResult<(BoxStream, Option<String>)> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| ClientError::Transport(format!("bad tls server name: {}", e)))?;
        let tls = self
            .connector
            .connect(name, stream)
            .await
            .map_err(|e| ClientError::Transport(format!("tls handshake failed: {}", e)))?;
        let remote = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| keyprint_of(cert.as_ref()));
        debug!(keyprint = ?remote, "tls client handshake complete");
        Ok((Box::new(tls), remote))
    }

    /// Server-side handshake for the encrypted listener.
    pub async fn accept(&self, stream: TcpStream) -> ClientResult<BoxStream> {
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| ClientError::Transport(format!("tls accept failed: {}", e)))?;
        Ok(Box::new(tls))
    }
}

#[derive(Debug)]
struct AcceptAnyCert(Arc<rustls::crypto::CryptoProvider>);

impl AcceptAnyCert {
    fn new() -> Self {
        Self(Arc::new(rustls::crypto::ring::default_provider()))
    }
}

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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_keyprint_shape() {
        let kp = keyprint_of(b"certificate bytes");
        assert!(kp.starts_with("SHA256/"));
        // 32 bytes of SHA-256 encode to 52 base-32 chars.
        assert_eq!(kp.len(), "SHA256/".len() + 52);
    }

    #[tokio::test]
    async fn test_tls_loopback_with_keyprint() {
        let identity = Arc::new(TlsIdentity::generate().unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_id = identity.clone();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut tls = server_id.accept(stream).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            tls.write_all(b"pong").await.unwrap();
        });

        let stream = dial("127.0.0.1", addr.port(), DIAL_TIMEOUT).await.unwrap();
        let (mut tls, remote) = identity.connect(stream, "127.0.0.1").await.unwrap();
        assert_eq!(remote.as_deref(), Some(identity.keyprint.as_str()));

        tls.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Port 1 is essentially never listening.
        let err = dial("127.0.0.1", 1, Duration::from_secs(2)).await;
        assert!(matches!(err, Err(ClientError::Transport(_))));
    }
}
