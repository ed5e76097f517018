//! Application callbacks.
//!
//! A [`ConnectionHandler`] is owned by its connection and called with the
//! connection's lock held. It must not call back into the connection it
//! belongs to; the [`Transport`](crate::Transport) offers thread-safe
//! `signal_writable` and `close` for that.

use std::net::SocketAddr;

use crate::crypto::CipherSuite;
use crate::message::AlertDescription;
use crate::{Error, Role};

/// Result of [`ConnectionHandler::on_write_record`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteRecord {
    /// Bytes written to the front of the buffer. 0 writes nothing.
    pub size: usize,
    /// Flush the datagram now instead of packing more records into it.
    pub should_send: bool,
    /// Call again, there is more to write.
    pub has_more: bool,
}

/// What the handshake settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub role: Role,
    pub peer: SocketAddr,
    pub cipher_suite: CipherSuite,
    pub alpn: Option<Vec<u8>>,
    /// The server's end-entity certificate (DER). Clients only, and not
    /// with PSK authentication.
    pub peer_certificate: Option<Vec<u8>>,
    /// Whether the external PSK authenticated the handshake.
    pub psk: bool,
}

/// Why a connection went away.
#[derive(Debug)]
pub enum DisconnectReason {
    /// Closed locally.
    Closed,
    /// The peer sent close_notify.
    PeerClosed,
    /// The peer sent a fatal alert.
    PeerAlert(AlertDescription),
    /// Handshake or retransmission timed out.
    Timeout,
    /// A fatal protocol error, as reported by the connection.
    Error(String),
}

/// Answer to [`ConnectionHandler::verify_peer_certificate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateVerdict {
    Accept,
    Reject,
    /// Decide later through
    /// [`Connection::complete_certificate_verification`](crate::Connection::complete_certificate_verification).
    /// The handshake stalls until then.
    Defer,
}

pub trait ConnectionHandler: Send {
    /// The connection is associated with `peer`.
    fn on_connect(&mut self, peer: SocketAddr) {
        let _ = peer;
    }

    fn on_disconnect(&mut self, reason: &DisconnectReason) {
        let _ = reason;
    }

    fn on_handshake_complete(&mut self, info: &HandshakeInfo) {
        let _ = info;
    }

    /// Fill `buf` with the plaintext of one application data record.
    ///
    /// Only called after [`signal_writable`](crate::Connection::signal_writable),
    /// and again for as long as `has_more` is returned.
    fn on_write_record(&mut self, buf: &mut [u8]) -> WriteRecord {
        let _ = buf;
        WriteRecord::default()
    }

    /// One decrypted application data record. An error closes the
    /// connection.
    fn on_read_record(&mut self, data: &[u8]) -> Result<(), Error> {
        let _ = data;
        Ok(())
    }

    /// The server's certificate chain, leaf first. The CertificateVerify
    /// signature has already been checked against the leaf.
    fn verify_peer_certificate(&mut self, chain: &[&[u8]]) -> CertificateVerdict {
        let _ = chain;
        CertificateVerdict::Accept
    }
}

/// Creates the handler for each connection a transport accepts or dials.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, peer: SocketAddr) -> Box<dyn ConnectionHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn(SocketAddr) -> Box<dyn ConnectionHandler> + Send + Sync,
{
    fn create(&self, peer: SocketAddr) -> Box<dyn ConnectionHandler> {
        self(peer)
    }
}

/// Handler that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ConnectionHandler for NoopHandler {}
