use crate::buffer::Buf;
use crate::crypto::{CipherSuite, Digest, HashAlgorithm, Hasher};
use crate::message::{FragmentHeader, MessageType};

/// Running hash over the handshake messages in TLS framing.
///
/// A client sends its first ClientHello before it knows which hash the
/// suite uses. Until then the raw bytes are buffered.
pub(crate) enum Transcript {
    Pending(Buf),
    Hashing(Hasher),
}

impl Transcript {
    pub fn new() -> Self {
        Transcript::Pending(Buf::new())
    }

    /// Start a transcript after a stateless HelloRetryRequest, where only
    /// the hash of the first ClientHello survived (in the cookie).
    pub fn from_message_hash(suite: CipherSuite, client_hello_hash: &[u8]) -> Self {
        let mut hasher = suite.new_hasher();
        hasher.update(&FragmentHeader::transcript_header(
            MessageType::MessageHash,
            client_hello_hash.len(),
        ));
        hasher.update(client_hello_hash);
        Transcript::Hashing(hasher)
    }

    /// Switch from buffering to hashing.
    pub fn set_suite(&mut self, suite: CipherSuite) {
        if let Transcript::Pending(buf) = self {
            let mut hasher = suite.new_hasher();
            hasher.update(buf);
            *self = Transcript::Hashing(hasher);
        }
    }

    pub fn is_hashing(&self) -> bool {
        matches!(self, Transcript::Hashing(_))
    }

    pub fn algorithm(&self) -> Option<HashAlgorithm> {
        match self {
            Transcript::Pending(_) => None,
            Transcript::Hashing(h) => Some(h.algorithm()),
        }
    }

    /// Add one complete handshake message.
    pub fn add_message(&mut self, msg_type: MessageType, body: &[u8]) {
        self.update(&FragmentHeader::transcript_header(msg_type, body.len()));
        self.update(body);
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Transcript::Pending(buf) => buf.extend_from_slice(data),
            Transcript::Hashing(h) => h.update(data),
        }
    }

    /// Hash of every message so far.
    pub fn hash(&self) -> Digest {
        match self {
            Transcript::Pending(_) => panic!("transcript hash before suite is known"),
            Transcript::Hashing(h) => h.current(),
        }
    }

    /// Hash of the transcript followed by a partial message.
    ///
    /// PSK binders cover the ClientHello up to the binders list, with the
    /// header announcing the full length. A client offering a PSK in its
    /// first ClientHello hashes the buffered bytes with `suite`.
    pub fn hash_with_partial(
        &self,
        suite: CipherSuite,
        msg_type: MessageType,
        full_len: usize,
        partial: &[u8],
    ) -> Digest {
        let mut h = match self {
            Transcript::Pending(buf) => {
                let mut h = suite.new_hasher();
                h.update(buf);
                h
            }
            Transcript::Hashing(h) => h.clone(),
        };
        h.update(&FragmentHeader::transcript_header(msg_type, full_len));
        h.update(partial);
        h.finalize()
    }

    /// Replace ClientHello1 with its message_hash after a HelloRetryRequest
    /// (RFC 8446 §4.4.1).
    pub fn replace_with_message_hash(&mut self, suite: CipherSuite) {
        self.set_suite(suite);
        let hash = self.hash();
        *self = Transcript::from_message_hash(suite, &hash);
    }
}

impl std::fmt::Debug for Transcript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transcript::Pending(b) => write!(f, "Transcript::Pending({} bytes)", b.len()),
            Transcript::Hashing(h) => write!(f, "Transcript::Hashing({:?})", h.algorithm()),
        }
    }
}
