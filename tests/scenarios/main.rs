//! End-to-end scenarios over a simulated link.

mod common;

mod failures;
mod handshake;
mod key_update;
mod psk;
mod transport;
mod verification;
