#![no_main]

//! Arbitrary datagrams into a client waiting for the server's flight.
//!
//! Plaintext records reach the HelloRetryRequest and ServerHello
//! parsers. Unified headers exercise sequence number unmasking, the
//! replay window and AEAD failure handling.

use std::sync::Arc;
use std::time::Instant;

use libfuzzer_sys::fuzz_target;

use dtls13::{Buf, Config, Connection, NoopHandler, Role};

fuzz_target!(|data: &[u8]| {
    let config = Arc::new(
        Config::builder()
            .role(Role::Client)
            .rng_seed(7)
            .build()
            .unwrap(),
    );
    let now = Instant::now();
    let mut client = Connection::new(config, Box::new(NoopHandler)).unwrap();
    client
        .connect("192.0.2.2:4433".parse().unwrap(), now)
        .unwrap();

    let mut out = Buf::new();
    while client.poll_datagram(&mut out) {}

    let mut datagram = data.to_vec();
    let _ = client.handle_datagram(&mut datagram, now);

    // The same bytes behind a unified header for epoch 2.
    let mut record = vec![0b0010_1110, 0, 0];
    record.extend_from_slice(&(data.len().min(16_000) as u16).to_be_bytes());
    record.extend_from_slice(&data[..data.len().min(16_000)]);
    let _ = client.handle_datagram(&mut record, now);

    while client.poll_datagram(&mut out) {}
});
