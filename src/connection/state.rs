/// Where a connection is in its life.
///
/// Client states are named after the message the client waits for. The
/// server starts in [`State::ServerExpectClientHello2`] because the first
/// ClientHello is answered statelessly by the acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not in use.
    Closed,
    ClientSentHello1,
    /// ClientHello1 is on the wire. A HelloRetryRequest is still possible.
    ClientExpectHrr,
    /// ClientHello2 is on the wire.
    ClientExpectServerHello,
    ClientExpectEncryptedExtensions,
    ClientExpectCertificate,
    ClientExpectCertificateVerify,
    ClientExpectFinished,
    ServerExpectClientHello2,
    ServerExpectFinished,
    /// Handshake done. Application data and post-handshake messages flow.
    PostHandshake,
    /// An alert is queued. Closed once it has been written.
    Shutdown,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Closed => "Closed",
            State::ClientSentHello1 => "ClientSentHello1",
            State::ClientExpectHrr => "ClientExpectHrr",
            State::ClientExpectServerHello => "ClientExpectServerHello",
            State::ClientExpectEncryptedExtensions => "ClientExpectEncryptedExtensions",
            State::ClientExpectCertificate => "ClientExpectCertificate",
            State::ClientExpectCertificateVerify => "ClientExpectCertificateVerify",
            State::ClientExpectFinished => "ClientExpectFinished",
            State::ServerExpectClientHello2 => "ServerExpectClientHello2",
            State::ServerExpectFinished => "ServerExpectFinished",
            State::PostHandshake => "PostHandshake",
            State::Shutdown => "Shutdown",
        }
    }

    /// Still exchanging records with the peer.
    pub fn is_active(&self) -> bool {
        !matches!(self, State::Closed | State::Shutdown)
    }

    pub fn is_handshaking(&self) -> bool {
        self.is_active() && *self != State::PostHandshake
    }

    /// The first ClientHello went out and nothing came back yet.
    pub(crate) fn awaits_first_reply(&self) -> bool {
        matches!(self, State::ClientSentHello1 | State::ClientExpectHrr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity() {
        assert!(!State::Closed.is_active());
        assert!(!State::Shutdown.is_active());
        assert!(State::ClientExpectHrr.is_handshaking());
        assert!(State::PostHandshake.is_active());
        assert!(!State::PostHandshake.is_handshaking());
        assert_eq!(State::ServerExpectFinished.name(), "ServerExpectFinished");
    }
}
