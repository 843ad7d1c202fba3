use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::client::danger::HandshakeSignatureValid;
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, UnixTime};
use tokio_rustls::rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use tokio_rustls::rustls::{self, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use url::Url;

use super::{Request, Response, router};
use crate::server::AppState;

const MAX_REQUEST_LEN: usize = 1024;
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Lowercase hex SHA-256 of a DER certificate.
#[must_use]
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Client certificates are identities, not trust anchors: any certificate
/// is accepted as long as the handshake signature checks out.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for AcceptAnyCertificate {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn load_tls_config(certificate: &Path, key: &Path) -> anyhow::Result<ServerConfig> {
    let file = File::open(certificate)
        .with_context(|| format!("cannot open certificate {}", certificate.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file)).collect::<Result<Vec<_>, _>>()?;

    let file = File::open(key).with_context(|| format!("cannot open key {}", key.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(file))?
        .ok_or_else(|| anyhow!("no private key in {}", key.display()))?;

    let provider = Arc::new(crypto::ring::default_provider());
    let verifier = Arc::new(AcceptAnyCertificate {
        provider: provider.clone(),
    });
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    Ok(config)
}

/// Splits a request line into decoded path and query.
pub fn parse_request_line(line: &str) -> Result<(String, Option<String>), String> {
    if line.len() > MAX_REQUEST_LEN {
        return Err("request too long".to_string());
    }
    let url = Url::parse(line).map_err(|e| format!("malformed URL: {e}"))?;
    if url.scheme() != "gemini" {
        return Err("unsupported scheme".to_string());
    }

    let path = urlencoding::decode(url.path())
        .map_err(|_| "malformed path".to_string())?
        .into_owned();
    let query = url
        .query()
        .map(|q| urlencoding::decode(q).map(|q| q.into_owned()))
        .transpose()
        .map_err(|_| "malformed query".to_string())?;

    let path = if path.is_empty() { "/".to_string() } else { path };
    Ok((path, query))
}

/// Reads up to CRLF. `None` on EOF, invalid UTF-8 or an oversized line.
async fn read_request_line<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut buf = Vec::with_capacity(MAX_REQUEST_LEN + 2);
    let mut byte = [0u8; 1];
    loop {
        if reader.read(&mut byte).await? == 0 {
            return Ok(None);
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n") {
            buf.truncate(buf.len() - 2);
            return Ok(String::from_utf8(buf).ok());
        }
        if buf.len() > MAX_REQUEST_LEN + 2 {
            return Ok(None);
        }
    }
}

async fn handle_connection(
    state: &AppState,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let mut tls = tokio::time::timeout(CONNECTION_TIMEOUT, acceptor.accept(stream)).await??;
    let fingerprint = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| fingerprint(cert.as_ref()));

    let line = tokio::time::timeout(CONNECTION_TIMEOUT, read_request_line(&mut tls)).await??;
    let response = match line.as_deref().map(parse_request_line) {
        None => Response::BadRequest("malformed request".to_string()),
        Some(Err(message)) => Response::BadRequest(message),
        Some(Ok((path, query))) => {
            let request = Request {
                fingerprint,
                path,
                query,
                peer: peer.ip(),
            };
            let path = request.path.clone();
            let response = router::handle(state, request).await;
            tracing::info!(%peer, %path, status = response.status(), "Gemini request");
            response
        }
    };

    tls.write_all(&response.encode()).await?;
    tls.shutdown().await?;
    Ok(())
}

pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let gemini = &state.config.gemini;
    let tls = load_tls_config(&gemini.certificate, &gemini.key)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls));
    let addr = gemini.socket_addr()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Gemini listening on gemini://{}:{}", gemini.host, addr.port());

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Accept failed: {e}");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(&state, acceptor, stream, peer).await {
                tracing::debug!(%peer, "Gemini connection ended: {e}");
            }
        });
    }
}
