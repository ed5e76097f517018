use thiserror::Error;

use crate::message::AlertDescription;

/// How an error affects the connection it occurred on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The offending record or datagram is dropped, the connection carries on.
    Warning,
    /// The connection is shut down, with an alert if the phase permits one.
    Fatal,
}

/// Errors produced by the engine.
///
/// Internal invariant violations are not represented here. Those panic,
/// since they point at a bug rather than at the network or the peer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Parse incomplete")]
    ParseIncomplete,

    #[error("Parse error: {0:?}")]
    ParseError(nom::error::ErrorKind),

    #[error("Replayed record {0}")]
    Replay(u64),

    #[error("Record failed authentication")]
    BadRecordMac,

    #[error("Record for epoch bits {0} has no keys")]
    UnknownEpoch(u8),

    #[error("Record dropped: {0}")]
    RecordDropped(&'static str),

    #[error("Handshake fragment outside reassembly window")]
    FragmentOutOfWindow,

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Illegal parameter: {0}")]
    IllegalParameter(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Handshake failure: {0}")]
    HandshakeFailure(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Bad certificate: {0}")]
    BadCertificate(String),

    #[error("Unsupported protocol version")]
    ProtocolVersion,

    #[error("Missing extension: {0}")]
    MissingExtension(&'static str),

    #[error("No application protocol in common")]
    NoApplicationProtocol,

    #[error("Epoch would exceed 16 bits")]
    EpochOverflow,

    #[error("Record sequence would exceed 48 bits")]
    SequenceOverflow,

    #[error("Message sequence would exceed 16 bits")]
    MessageSeqOverflow,

    #[error("AEAD usage limit exhausted")]
    AeadLimitReached,

    #[error("Timeout: {0}")]
    Timeout(&'static str),

    #[error("Peer sent alert: {0:?}")]
    PeerAlert(AlertDescription),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Application error: {0}")]
    Application(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Unknown cipher suite {0:#06x}")]
    UnknownCipherSuite(u16),

    #[error("Transport connection table is full")]
    TransportFull,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::ParseIncomplete
            | Error::ParseError(_)
            | Error::Replay(_)
            | Error::BadRecordMac
            | Error::UnknownEpoch(_)
            | Error::RecordDropped(_)
            | Error::FragmentOutOfWindow => Severity::Warning,
            _ => Severity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Alert to send the peer when this error closes the connection.
    ///
    /// `None` for warnings and for fatal errors where no alert makes sense
    /// (the peer already left, or is unreachable).
    pub fn alert(&self) -> Option<AlertDescription> {
        use AlertDescription as A;
        let alert = match self {
            Error::UnexpectedMessage(_) => A::UnexpectedMessage,
            Error::IllegalParameter(_) => A::IllegalParameter,
            Error::DecodeError(_) => A::DecodeError,
            Error::HandshakeFailure(_) => A::HandshakeFailure,
            Error::SecurityError(_) => A::DecryptError,
            Error::BadCertificate(_) => A::BadCertificate,
            Error::ProtocolVersion => A::ProtocolVersion,
            Error::MissingExtension(_) => A::MissingExtension,
            Error::NoApplicationProtocol => A::NoApplicationProtocol,
            Error::EpochOverflow
            | Error::SequenceOverflow
            | Error::MessageSeqOverflow
            | Error::AeadLimitReached
            | Error::CryptoError(_)
            | Error::Application(_) => A::InternalError,
            _ => return None,
        };
        Some(alert)
    }
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    fn from(value: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        match value {
            nom::Err::Incomplete(_) => Error::ParseIncomplete,
            nom::Err::Error(e) | nom::Err::Failure(e) => Error::ParseError(e.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_level_errors_are_warnings() {
        assert_eq!(Error::BadRecordMac.severity(), Severity::Warning);
        assert_eq!(Error::Replay(7).severity(), Severity::Warning);
        assert!(Error::BadRecordMac.alert().is_none());
    }

    #[test]
    fn protocol_errors_are_fatal_with_alert() {
        let e = Error::SecurityError("finished mismatch".into());
        assert!(e.is_fatal());
        assert_eq!(e.alert(), Some(AlertDescription::DecryptError));

        assert!(Error::EpochOverflow.is_fatal());
        assert_eq!(Error::Timeout("handshake").alert(), None);
    }

    #[test]
    fn nom_errors_convert() {
        let e: Error = nom::Err::<nom::error::Error<&[u8]>>::Incomplete(nom::Needed::Unknown).into();
        assert!(matches!(e, Error::ParseIncomplete));
    }
}
