//! Connection fabric: TCP and TLS connect helpers plus the queued,
//! back-pressured output stream every protocol writes through.

mod connect;
mod stream;
mod tls;

pub use connect::Connector;
pub use stream::{BUF_INITIAL, BUF_MAX, QueuedOutputStream};
pub use tls::{TlsError, TlsPolicy, TlsSession, handshake};

use crate::resolver::ResolveError;

/// Errors from connection establishment.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("unable to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
