use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the transport.
///
/// The error a connection closed with is stored and handed back from every
/// user-facing call after the close, so the type is `Clone`; the I/O variant
/// wraps its source in an `Arc` for that reason.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The connection or mux is closed. Returned after a local `close`, a
    /// peer CLOSE frame, or a mux shutdown.
    #[error("closed pipe")]
    Closed,

    /// The server demanded a fresh cookie; redial with the one it sent.
    #[error("try again")]
    Again,

    /// The peer violated the protocol. The connection is torn down with
    /// this error.
    #[error("protocol botch: {0}")]
    Protocol(String),

    /// The Noise exchange failed.
    #[error("handshake failed: {0}")]
    Handshake(&'static str),

    /// A dial attempt ran out of time.
    #[error("dial timed out")]
    Timeout,

    /// An error on the underlying UDP socket.
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
