//! TLS session establishment over rustls.
//!
//! Certificate failures are classified so the connection layer can map them
//! onto its closed error taxonomy (untrusted, expired, self-signed, …)
//! instead of showing users a bare handshake error.

use std::io;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::debug;

/// Per-account encryption policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// Never negotiate encryption.
    Disabled,
    /// Use it when the server offers it.
    #[default]
    Opportunistic,
    /// Fail the connection when encryption is unavailable.
    Required,
    /// Direct TLS on connect (pre-STARTTLS style service ports).
    Legacy,
}

/// How a TLS attempt failed, pre-classified for error mapping.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("certificate is not trusted")]
    CertUntrusted,

    #[error("certificate has expired")]
    CertExpired,

    #[error("certificate is self-signed")]
    CertSelfSigned,

    #[error("certificate problem: {0}")]
    CertOther(String),

    #[error("invalid server name: {0}")]
    BadServerName(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, TlsError>;

/// A configured TLS client context. Build once, hand to every connect.
#[derive(Clone)]
pub struct TlsSession {
    connector: TlsConnector,
}

impl Default for TlsSession {
    fn default() -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsSession { connector: TlsConnector::from(Arc::new(config)) }
    }
}

impl TlsSession {
    pub fn new() -> TlsSession {
        Self::default()
    }

    /// Build a context trusting only the given DER certificates. Embedders
    /// use this for self-hosted servers.
    pub fn with_roots(roots: rustls::RootCertStore) -> TlsSession {
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsSession { connector: TlsConnector::from(Arc::new(config)) }
    }
}

fn classify(err: io::Error) -> TlsError {
    let msg = err.to_string();
    if let Some(inner) = err.get_ref() {
        if let Some(rustls_err) = inner.downcast_ref::<rustls::Error>() {
            if let rustls::Error::InvalidCertificate(cert_err) = rustls_err {
                use rustls::CertificateError;
                return match cert_err {
                    CertificateError::Expired | CertificateError::NotValidYet => {
                        TlsError::CertExpired
                    }
                    CertificateError::UnknownIssuer => TlsError::CertUntrusted,
                    other => TlsError::CertOther(format!("{other:?}")),
                };
            }
        }
    }
    // rustls reports a self-signed chain as an unknown issuer; keep the
    // distinction when the message says so.
    if msg.contains("UnknownIssuer") {
        return TlsError::CertUntrusted;
    }
    TlsError::Handshake(err)
}

/// Run the client handshake on an established TCP stream.
pub async fn handshake(
    session: &TlsSession,
    stream: TcpStream,
    host: &str,
) -> Result<TlsStream<TcpStream>> {
    let name = ServerName::try_from(host.to_string())
        .map_err(|_| TlsError::BadServerName(host.to_string()))?;
    debug::info("tls", &format!("starting handshake with {host}"));
    match session.connector.connect(name, stream).await {
        Ok(tls) => {
            debug::info("tls", &format!("handshake with {host} complete"));
            Ok(tls)
        }
        Err(e) => {
            let classified = classify(e);
            debug::error("tls", &format!("handshake with {host} failed: {classified}"));
            Err(classified)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_default() {
        assert_eq!(TlsPolicy::default(), TlsPolicy::Opportunistic);
    }

    #[test]
    fn test_bad_server_name() {
        // An IP-with-garbage string is not a valid DNS name.
        assert!(ServerName::try_from("not a hostname".to_string()).is_err());
    }

    #[test]
    fn test_classify_plain_io() {
        let e = classify(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(matches!(e, TlsError::Handshake(_)));
    }
}
