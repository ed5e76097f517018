use dtls13::{CertificateVerdict, State};

use crate::common::*;

#[test]
fn deferred_verification_stalls_until_completed() {
    let mut pair = Pair::with_verdict(
        client_builder(),
        server_builder_with_cert(),
        Link::lossless(),
        CertificateVerdict::Defer,
    );
    pair.run_until(40, |_| false);

    // CertificateVerify checked, the chain handed over, Finished held back.
    assert_eq!(pair.client_events.lock().unwrap().verified_chain, Some(1));
    assert_eq!(pair.client.state(), State::ClientExpectFinished);
    assert!(pair.client_events.lock().unwrap().complete.is_none());

    let now = pair.now;
    pair.client
        .complete_certificate_verification(true, now)
        .expect("verification accepted");
    assert_eq!(pair.client.state(), State::PostHandshake);
    pair.handshake();
}

#[test]
fn deferred_rejection_closes() {
    let mut pair = Pair::with_verdict(
        client_builder(),
        server_builder_with_cert(),
        Link::lossless(),
        CertificateVerdict::Defer,
    );
    pair.run_until(40, |_| false);

    let now = pair.now;
    assert!(pair
        .client
        .complete_certificate_verification(false, now)
        .is_err());
    assert_eq!(pair.client.state(), State::Shutdown);

    pair.flush_client();
    assert!(pair.client.is_closed());
    assert!(pair.server().is_closed());
    assert_eq!(
        pair.server_disconnect().as_deref(),
        Some("PeerAlert(BadCertificate)")
    );
}

#[test]
fn immediate_rejection_sends_bad_certificate() {
    let mut pair = Pair::with_verdict(
        client_builder(),
        server_builder_with_cert(),
        Link::lossless(),
        CertificateVerdict::Reject,
    );
    pair.run_until(100, |p| {
        p.server.as_ref().map(|s| s.is_closed()).unwrap_or(false)
    });

    assert!(pair.client.is_closed());
    assert_eq!(
        pair.server_disconnect().as_deref(),
        Some("PeerAlert(BadCertificate)")
    );
    let client = pair.client_disconnect().unwrap();
    assert!(client.contains("rejected by application"), "{}", client);
}
