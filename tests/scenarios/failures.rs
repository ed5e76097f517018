use std::time::Duration;

use dtls13::{CipherSuite, State};

use crate::common::*;

#[test]
fn no_common_application_protocol() {
    let mut pair = Pair::new(
        client_builder().alpn_protocols(["h2"]),
        server_builder_with_cert().alpn_protocols(["dtls-test"]),
        Link::lossless(),
    );
    pair.run_until(100, |p| p.client.is_closed());

    assert!(pair.client.is_closed());
    assert!(pair.server().is_closed());
    assert_eq!(
        pair.client_disconnect().as_deref(),
        Some("PeerAlert(NoApplicationProtocol)")
    );
    let server = pair.server_disconnect().unwrap();
    assert!(server.contains("No application protocol"), "{}", server);
}

#[test]
fn no_common_cipher_suite_is_silent() {
    let mut pair = Pair::new(
        client_builder().cipher_suites(&[CipherSuite::ChaCha20Poly1305Sha256]),
        server_builder_with_cert().cipher_suites(&[CipherSuite::Aes128GcmSha256]),
        Link::lossless(),
    );
    pair.run_until(50, |_| false);

    // The acceptor drops what it can't serve and never allocates.
    assert_eq!(pair.retries_sent, 0);
    assert!(pair.server.is_none());
    assert_eq!(pair.client.state(), State::ClientExpectHrr);
}

#[test]
fn handshake_times_out_without_server() {
    let mut pair = Pair::new(
        client_builder()
            .flight_start_rto(Duration::from_millis(100))
            .flight_retries(2)
            .handshake_timeout(Duration::from_secs(30)),
        server_builder_with_cert(),
        Link::lossless(),
    );
    // Nothing reaches the server.
    pair.client_filter = Some(Box::new(|_| false));

    let mut sent = 0;
    for _ in 0..400 {
        pair.step();
        pair.now += TICK;
        if pair.client.is_closed() {
            break;
        }
        sent += 1;
    }
    assert!(pair.client.is_closed(), "client gave up after {} steps", sent);
    assert_eq!(pair.client_disconnect().as_deref(), Some("Timeout"));
}

#[test]
fn tampered_record_is_dropped() {
    let mut pair = Pair::new(client_builder(), server_builder_with_cert(), Link::lossless());
    pair.handshake();
    pair.run_until(20, |_| false);

    pair.client_send(b"first");
    let mut datagrams = pair.client_datagrams();
    assert_eq!(datagrams.len(), 1);
    let mut tampered = datagrams[0].clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;

    pair.to_server(tampered);
    assert!(pair.server_received().is_empty());
    assert!(pair.server().is_established());

    // The untouched copy still decrypts.
    pair.to_server(datagrams.remove(0));
    assert_eq!(pair.server_received(), vec![b"first".to_vec()]);
}

#[test]
fn replayed_record_is_dropped() {
    let mut pair = Pair::new(client_builder(), server_builder_with_cert(), Link::lossless());
    pair.handshake();
    pair.run_until(20, |_| false);

    pair.client_send(b"once");
    let datagram = pair.client_datagrams().remove(0);
    pair.to_server(datagram.clone());
    pair.to_server(datagram.clone());
    pair.to_server(datagram);
    assert_eq!(pair.server_received(), vec![b"once".to_vec()]);
    assert!(pair.server().is_established());
}

#[test]
fn garbage_after_valid_record_keeps_the_record() {
    let mut pair = Pair::new(client_builder(), server_builder_with_cert(), Link::lossless());
    pair.handshake();
    pair.run_until(20, |_| false);

    pair.client_send(b"payload");
    let mut datagram = pair.client_datagrams().remove(0);
    datagram.extend_from_slice(&[0xff, 0x00, 0x13]);
    pair.to_server(datagram);
    assert_eq!(pair.server_received(), vec![b"payload".to_vec()]);
    assert!(pair.server().is_established());
}
