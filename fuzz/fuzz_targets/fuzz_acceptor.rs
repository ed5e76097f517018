#![no_main]

//! Arbitrary datagrams at the stateless front door.
//!
//! The acceptor parses the record header, the handshake fragment header
//! and the ClientHello before any state exists. Inputs are tried as-is
//! and wrapped in a plaintext handshake record so the ClientHello parser
//! sees most of them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use libfuzzer_sys::fuzz_target;
use once_cell::sync::Lazy;

use dtls13::{certificate, Acceptor, Buf, Config, Role};

/// DTLSPlaintext header, then a handshake header covering the whole body.
fn wrap_client_hello(body: &[u8]) -> Vec<u8> {
    let len = body.len().min(16_000);
    let mut record = Vec::with_capacity(25 + len);
    record.push(22);
    record.extend_from_slice(&[0xfe, 0xfd]);
    record.extend_from_slice(&[0; 8]);
    record.extend_from_slice(&((len + 12) as u16).to_be_bytes());
    record.push(1);
    record.extend_from_slice(&(len as u32).to_be_bytes()[1..]);
    record.extend_from_slice(&[0, 0]);
    record.extend_from_slice(&[0, 0, 0]);
    record.extend_from_slice(&(len as u32).to_be_bytes()[1..]);
    record.extend_from_slice(&body[..len]);
    record
}

static ACCEPTOR: Lazy<Acceptor> = Lazy::new(|| {
    let config = Config::builder()
        .role(Role::Server)
        .certificate(certificate::generate_self_signed_certificate().unwrap())
        .build()
        .unwrap();
    Acceptor::new(Arc::new(config))
});

fuzz_target!(|data: &[u8]| {
    let peer: SocketAddr = "192.0.2.1:4000".parse().unwrap();
    let now = Instant::now();
    let mut out = Buf::new();

    let _ = ACCEPTOR.process(data, peer, now, &mut out);
    let _ = ACCEPTOR.process(&wrap_client_hello(data), peer, now, &mut out);
});
