//! Record layer: framing, sequence numbers and AEAD protection.

mod header;
mod number;
mod protect;

pub use header::ContentType;
pub(crate) use header::{
    write_plaintext, HeaderKind, RecordHeader, CIPHERTEXT_HEADER_LEN, PLAINTEXT_HEADER_LEN,
};
pub use number::{RecordNumber, MAX_SEQ};
pub(crate) use protect::{max_content, open, seal, sealed_len, unmask_sequence};
