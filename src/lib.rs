//! DTLS 1.3 protocol engine.
//!
//! [`Connection`] is sans-IO: feed it datagrams with
//! [`Connection::handle_datagram`], drain outgoing datagrams with
//! [`Connection::poll_datagram`] and drive its timers with
//! [`Connection::poll_timeout`] / [`Connection::handle_timeout`].
//!
//! Servers put an [`Acceptor`] in front. It answers the first ClientHello
//! with a stateless HelloRetryRequest carrying a cookie and only hands a
//! ClientHello over once the cookie comes back.
//!
//! [`Transport`] ties both to a UDP socket with a receiver, a sender and
//! a clock thread.
#![forbid(unsafe_code)]
#![warn(clippy::all)]

#[macro_use]
extern crate log;

mod acceptor;
mod buffer;
pub mod certificate;
mod config;
mod connection;
pub mod containers;
mod cookie;
mod crypto;
mod error;
mod handler;
mod handshake;
mod keys;
mod message;
mod record;
mod rng;
mod time_tricks;
mod timer;
mod transport;
mod util;
mod window;

pub use acceptor::{Accept, Accepted, Acceptor};
pub use buffer::Buf;
pub use certificate::{generate_self_signed_certificate, DtlsCertificate};
pub use config::{Config, ConfigBuilder, Psk, PskResolver, Role};
pub use connection::{Connection, State};
pub use cookie::{CookieState, ValidCookie};
pub use crypto::{CipherSuite, NamedGroup};
pub use error::{Error, Severity};
pub use handler::{
    CertificateVerdict, ConnectionHandler, DisconnectReason, HandlerFactory, HandshakeInfo,
    NoopHandler, WriteRecord,
};
pub use message::AlertDescription;
pub use record::RecordNumber;
pub use transport::{DatagramSocket, Transport};
pub use window::ReplayWindow;
