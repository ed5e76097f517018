use nom::bytes::complete::take;
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::{Err, IResult};

use crate::buffer::Buf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    ClientHello,
    ServerHello,
    NewSessionTicket,
    EncryptedExtensions,
    Certificate,
    CertificateVerify,
    Finished,
    KeyUpdate,
    /// Synthetic transcript entry replacing ClientHello1 after a retry.
    MessageHash,
    Unknown(u8),
}

impl MessageType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => MessageType::ClientHello,
            2 => MessageType::ServerHello,
            4 => MessageType::NewSessionTicket,
            8 => MessageType::EncryptedExtensions,
            11 => MessageType::Certificate,
            15 => MessageType::CertificateVerify,
            20 => MessageType::Finished,
            24 => MessageType::KeyUpdate,
            254 => MessageType::MessageHash,
            _ => MessageType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            MessageType::ClientHello => 1,
            MessageType::ServerHello => 2,
            MessageType::NewSessionTicket => 4,
            MessageType::EncryptedExtensions => 8,
            MessageType::Certificate => 11,
            MessageType::CertificateVerify => 15,
            MessageType::Finished => 20,
            MessageType::KeyUpdate => 24,
            MessageType::MessageHash => 254,
            MessageType::Unknown(v) => *v,
        }
    }

    /// Messages exchanged after the handshake completed.
    pub fn is_post_handshake(&self) -> bool {
        matches!(
            self,
            MessageType::NewSessionTicket | MessageType::KeyUpdate
        )
    }
}

/// type(1) length(3) message_seq(2) fragment_offset(3) fragment_length(3)
pub const FRAGMENT_HEADER_LEN: usize = 12;

/// DTLS handshake header of one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub msg_type: MessageType,
    /// Length of the whole message body.
    pub length: u32,
    pub message_seq: u16,
    pub fragment_offset: u32,
    pub fragment_length: u32,
}

impl FragmentHeader {
    /// Parse a fragment and its body.
    ///
    /// The fragment must lie within the message.
    pub fn parse(input: &[u8]) -> IResult<&[u8], (FragmentHeader, &[u8])> {
        let (input, msg_type) = be_u8(input)?;
        let (input, length) = be_u24(input)?;
        let (input, message_seq) = be_u16(input)?;
        let (input, fragment_offset) = be_u24(input)?;
        let (input, fragment_length) = be_u24(input)?;

        if fragment_offset as u64 + fragment_length as u64 > length as u64 {
            return Err(Err::Error(NomError::new(input, ErrorKind::Verify)));
        }

        let (rest, body) = take(fragment_length as usize)(input)?;

        Ok((
            rest,
            (
                FragmentHeader {
                    msg_type: MessageType::from_u8(msg_type),
                    length,
                    message_seq,
                    fragment_offset,
                    fragment_length,
                },
                body,
            ),
        ))
    }

    pub fn write(&self, out: &mut Buf) {
        out.push(self.msg_type.as_u8());
        out.extend_from_slice(&self.length.to_be_bytes()[1..]);
        out.extend_from_slice(&self.message_seq.to_be_bytes());
        out.extend_from_slice(&self.fragment_offset.to_be_bytes()[1..]);
        out.extend_from_slice(&self.fragment_length.to_be_bytes()[1..]);
    }

    /// Whether this fragment carries the whole message.
    pub fn is_complete(&self) -> bool {
        self.fragment_offset == 0 && self.fragment_length == self.length
    }

    /// TLS handshake header (type, length) as hashed into the transcript.
    pub fn transcript_header(msg_type: MessageType, length: usize) -> [u8; 4] {
        let len = (length as u32).to_be_bytes();
        [msg_type.as_u8(), len[1], len[2], len[3]]
    }
}
