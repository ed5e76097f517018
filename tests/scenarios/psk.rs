use dtls13::{CipherSuite, Psk};

use crate::common::*;

const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

fn psk_server() -> dtls13::ConfigBuilder {
    server_builder().psk(Psk::server(|identity: &[u8]| {
        (identity == b"client-1").then(|| KEY.to_vec())
    }))
}

#[test]
fn psk_handshake_skips_certificate() {
    let mut pair = Pair::new(
        client_builder().psk(Psk::client("client-1", KEY)),
        psk_server(),
        Link::lossy(11),
    );
    pair.handshake();

    let client = pair.client_events.lock().unwrap().complete.clone().unwrap();
    let server = pair.server_events.lock().unwrap().complete.clone().unwrap();
    assert!(client.psk);
    assert!(server.psk);
    assert!(client.peer_certificate.is_none());
    assert!(pair.client_events.lock().unwrap().verified_chain.is_none());

    pair.link.loss = 0.0;
    pair.client_send(b"over psk");
    assert!(pair.run_until(100, |p| !p.server_received().is_empty()));
    assert_eq!(pair.server_received(), vec![b"over psk".to_vec()]);
}

#[test]
fn psk_with_certificate_fallback() {
    // The server knows no such identity but has a certificate.
    let mut pair = Pair::new(
        client_builder().psk(Psk::client("stranger", KEY)),
        psk_server().certificate(dtls13::generate_self_signed_certificate().unwrap()),
        Link::lossless(),
    );
    pair.handshake();

    let client = pair.client_events.lock().unwrap().complete.clone().unwrap();
    assert!(!client.psk);
    assert!(client.peer_certificate.is_some());
}

#[test]
fn unknown_identity_without_certificate_fails() {
    let mut pair = Pair::new(
        client_builder().psk(Psk::client("stranger", KEY)),
        psk_server(),
        Link::lossless(),
    );
    pair.run_until(100, |p| p.client.is_closed());
    assert_eq!(
        pair.client_disconnect().as_deref(),
        Some("PeerAlert(HandshakeFailure)")
    );
}

#[test]
fn wrong_key_fails_binder_check() {
    let mut pair = Pair::new(
        client_builder().psk(Psk::client("client-1", &b"not the right key at all........"[..])),
        psk_server(),
        Link::lossless(),
    );
    pair.run_until(100, |p| p.client.is_closed());
    assert_eq!(
        pair.client_disconnect().as_deref(),
        Some("PeerAlert(DecryptError)")
    );
    let server = pair.server_disconnect().unwrap();
    assert!(server.contains("binder"), "{}", server);
}

#[test]
fn sha384_suite_leaves_psk_out() {
    // The external PSK is bound to SHA-256, so a SHA-384 negotiation
    // authenticates with the certificate.
    let mut pair = Pair::new(
        client_builder()
            .cipher_suites(&[CipherSuite::Aes256GcmSha384, CipherSuite::Aes128GcmSha256])
            .psk(Psk::client("client-1", KEY)),
        psk_server()
            .cipher_suites(&[CipherSuite::Aes256GcmSha384])
            .certificate(dtls13::generate_self_signed_certificate().unwrap()),
        Link::lossless(),
    );
    pair.handshake();

    let client = pair.client_events.lock().unwrap().complete.clone().unwrap();
    assert_eq!(client.cipher_suite, CipherSuite::Aes256GcmSha384);
    assert!(!client.psk);
}
