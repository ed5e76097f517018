use std::sync::{Arc, Mutex};
use std::time::Duration;

use dtls13::{CipherSuite, State};

use crate::common::*;

/// Smallest MTU the config accepts.
const SMALL_MTU: usize = 256;

/// Handshake message types carried in the leading plaintext records of
/// a datagram. Stops at the first protected record.
fn plaintext_handshake_types(datagram: &[u8]) -> Vec<u8> {
    let mut types = vec![];
    let mut at = 0;
    while at + 13 < datagram.len() && datagram[at] == 22 {
        let len = u16::from_be_bytes([datagram[at + 11], datagram[at + 12]]) as usize;
        types.push(datagram[at + 13]);
        at += 13 + len;
    }
    types
}

fn small_mtu_pair(link: Link) -> (Pair, Arc<Mutex<Vec<Vec<u8>>>>) {
    let mut pair = Pair::new(
        client_builder().mtu(SMALL_MTU),
        server_builder_with_cert().mtu(SMALL_MTU),
        link,
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    pair.server_filter = Some(Box::new(move |d: &[u8]| {
        log.lock().unwrap().push(d.to_vec());
        true
    }));
    pair.client_filter = Some(Box::new(|d: &[u8]| {
        assert!(d.len() <= SMALL_MTU, "client datagram of {} bytes", d.len());
        true
    }));
    (pair, seen)
}

fn check_server_flight(seen: &[Vec<u8>]) {
    // The certificate alone does not fit one record.
    assert!(seen.len() >= 3, "only {} server datagrams", seen.len());
    let mut server_hellos = 0;
    for d in seen {
        assert!(d.len() <= SMALL_MTU, "server datagram of {} bytes", d.len());
        for msg_type in plaintext_handshake_types(d) {
            // Only ServerHello goes out unprotected.
            assert_eq!(msg_type, 2, "plaintext handshake type {}", msg_type);
            server_hellos += 1;
        }
    }
    assert!(server_hellos >= 1);
}

#[test]
fn small_mtu_handshake() {
    let (mut pair, seen) = small_mtu_pair(Link::lossless());
    pair.handshake();
    check_server_flight(&seen.lock().unwrap());

    pair.client_send(b"small");
    assert!(pair.run_until(50, |p| !p.server_received().is_empty()));
    assert_eq!(pair.server_received(), vec![b"small".to_vec()]);
}

#[test]
fn small_mtu_handshake_over_lossy_link() {
    let (mut pair, seen) = small_mtu_pair(Link::lossy(11));
    pair.handshake();
    check_server_flight(&seen.lock().unwrap());

    let client = pair.client_events.lock().unwrap().complete.clone().unwrap();
    assert!(client.peer_certificate.is_some());
    assert_eq!(pair.client.send_epoch(), 3);
}

#[test]
fn client_hello_with_cookie_must_fit_one_record() {
    // The cookie pushes ClientHello2 past one record. The acceptor only
    // takes whole ClientHellos, so the handshake never gets past it.
    let mut pair = Pair::new(
        client_builder()
            .mtu(SMALL_MTU)
            .alpn_protocols(["a-rather-long-protocol-name-one", "another-long-protocol-name-2"])
            .flight_start_rto(Duration::from_millis(100))
            .flight_retries(2)
            .handshake_timeout(Duration::from_secs(30)),
        server_builder_with_cert(),
        Link::lossless(),
    );

    for _ in 0..1_000 {
        pair.step();
        pair.now += TICK;
        if pair.client.is_closed() {
            break;
        }
    }
    assert_eq!(pair.retries_sent, 1);
    assert!(pair.server.is_none());
    assert_eq!(pair.client_disconnect().as_deref(), Some("Timeout"));
}

#[test]
fn handshake_over_lossy_link() {
    let mut pair = Pair::new(
        client_builder().cipher_suites(&[CipherSuite::Aes128GcmSha256]),
        server_builder_with_cert(),
        Link::lossy(7),
    );
    pair.handshake();

    assert!(pair.retries_sent >= 1, "cookie exchange happened");

    let client = pair.client_events.lock().unwrap().complete.clone().unwrap();
    let server = pair.server_events.lock().unwrap().complete.clone().unwrap();
    assert_eq!(client.cipher_suite, CipherSuite::Aes128GcmSha256);
    assert_eq!(server.cipher_suite, client.cipher_suite);
    assert!(client.peer_certificate.is_some());
    assert!(!client.psk);
    assert_eq!(client.peer, server_addr());
    assert_eq!(server.peer, client_addr());

    // Data over the same link, minus the loss. Duplicates stay.
    pair.link.loss = 0.0;
    pair.client_send(b"ping from client");
    pair.server_send(b"pong from server");
    assert!(pair.run_until(200, |p| {
        !p.client_received().is_empty() && !p.server_received().is_empty()
    }));
    // A few more rounds so any duplicate would have arrived.
    pair.run_until(20, |_| false);

    assert_eq!(pair.server_received(), vec![b"ping from client".to_vec()]);
    assert_eq!(pair.client_received(), vec![b"pong from server".to_vec()]);
}

#[test]
fn handshake_with_every_suite() {
    for suite in CipherSuite::ALL {
        let mut pair = Pair::new(
            client_builder().cipher_suites(&[suite]),
            server_builder_with_cert(),
            Link::lossless(),
        );
        pair.handshake();

        let info = pair.client_events.lock().unwrap().complete.clone().unwrap();
        assert_eq!(info.cipher_suite, suite);
        assert_eq!(pair.client.send_epoch(), 3);
        assert_eq!(pair.server().send_epoch(), 3);

        pair.client_send(b"hello");
        assert!(pair.run_until(50, |p| !p.server_received().is_empty()));
        assert_eq!(pair.server_received(), vec![b"hello".to_vec()]);
    }
}

#[test]
fn server_preference_picks_suite() {
    let mut pair = Pair::new(
        client_builder().cipher_suites(&[
            CipherSuite::ChaCha20Poly1305Sha256,
            CipherSuite::Aes256GcmSha384,
        ]),
        server_builder_with_cert().cipher_suites(&[
            CipherSuite::Aes256GcmSha384,
            CipherSuite::ChaCha20Poly1305Sha256,
        ]),
        Link::lossless(),
    );
    pair.handshake();
    let info = pair.server_events.lock().unwrap().complete.clone().unwrap();
    assert_eq!(info.cipher_suite, CipherSuite::Aes256GcmSha384);
}

#[test]
fn client_walks_through_states() {
    let mut pair = Pair::new(client_builder(), server_builder_with_cert(), Link::lossless());
    assert_eq!(pair.client.state(), State::ClientSentHello1);

    pair.step();
    // ClientHello1 out, HelloRetryRequest back, ClientHello2 queued.
    assert_eq!(pair.retries_sent, 1);
    assert_eq!(pair.client.state(), State::ClientExpectServerHello);
    assert!(pair.server.is_none());

    pair.flush_client();
    assert_eq!(pair.server().state(), State::ServerExpectFinished);

    pair.flush_server();
    assert_eq!(pair.client.state(), State::PostHandshake);
    assert_eq!(pair.server().state(), State::ServerExpectFinished);

    pair.flush_client();
    assert!(pair.established());
}

#[test]
fn session_ticket_reaches_client() {
    let mut pair = Pair::new(client_builder(), server_builder_with_cert(), Link::lossy(3));
    pair.handshake();
    assert!(pair.run_until(2_000, |p| p.client.session_ticket().is_some()));
    assert_eq!(pair.client.session_ticket().unwrap().len(), 32);
}

#[test]
fn no_session_ticket_when_disabled() {
    let mut pair = Pair::new(
        client_builder(),
        server_builder_with_cert().session_tickets(false),
        Link::lossless(),
    );
    pair.handshake();
    pair.run_until(100, |_| false);
    assert!(pair.client.session_ticket().is_none());
}

#[test]
fn alpn_negotiated() {
    let mut pair = Pair::new(
        client_builder().alpn_protocols(["h2", "dtls-test"]),
        server_builder_with_cert().alpn_protocols(["dtls-test", "h2"]),
        Link::lossless(),
    );
    pair.handshake();
    let client = pair.client_events.lock().unwrap().complete.clone().unwrap();
    let server = pair.server_events.lock().unwrap().complete.clone().unwrap();
    assert_eq!(client.alpn.as_deref(), Some(&b"dtls-test"[..]));
    assert_eq!(server.alpn, client.alpn);
}

#[test]
fn record_padding_and_plain_sequence_numbers() {
    let mut pair = Pair::new(
        client_builder()
            .record_padding(64)
            .sequence_number_encryption(false),
        server_builder_with_cert()
            .record_padding(64)
            .sequence_number_encryption(false),
        Link::lossless(),
    );
    pair.handshake();
    pair.client_send(b"padded");
    assert!(pair.run_until(50, |p| !p.server_received().is_empty()));
    assert_eq!(pair.server_received(), vec![b"padded".to_vec()]);
}

#[test]
fn orderly_shutdown() {
    let mut pair = Pair::new(client_builder(), server_builder_with_cert(), Link::lossless());
    pair.handshake();
    pair.run_until(20, |_| false);

    pair.client.shutdown();
    assert_eq!(pair.client.state(), State::Shutdown);
    pair.flush_client();
    assert!(pair.client.is_closed());
    assert!(pair.server().is_closed());

    assert_eq!(pair.client_disconnect().as_deref(), Some("Closed"));
    assert_eq!(pair.server_disconnect().as_deref(), Some("PeerClosed"));
}
