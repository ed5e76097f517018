use crate::common::*;

fn settled_pair(client: dtls13::ConfigBuilder, server: dtls13::ConfigBuilder) -> Pair {
    let mut pair = Pair::new(client, server, Link::lossless());
    pair.handshake();
    // Session ticket and the last acknowledgements.
    pair.run_until(20, |_| false);
    pair
}

#[test]
fn key_update_rolls_only_on_ack() {
    let mut pair = settled_pair(client_builder(), server_builder_with_cert());
    assert_eq!(pair.client.send_epoch(), 3);
    assert_eq!(pair.server().recv_epoch(), 3);

    pair.client.initiate_key_update(false).unwrap();
    pair.client_send(b"old epoch");
    for datagram in pair.client_datagrams() {
        pair.to_server(datagram);
    }
    assert_eq!(pair.server_received(), vec![b"old epoch".to_vec()]);
    assert_eq!(pair.server().recv_epoch(), 3);

    // The ACK for the KeyUpdate record is lost.
    let lost = pair.server_datagrams();
    assert!(!lost.is_empty());
    assert_eq!(pair.client.send_epoch(), 3);

    pair.client_send(b"still old");
    for datagram in pair.client_datagrams() {
        pair.to_server(datagram);
    }
    assert_eq!(pair.server().recv_epoch(), 3);

    // The retransmitted KeyUpdate is acknowledged.
    assert!(pair.run_until(200, |p| p.client.send_epoch() == 4));

    pair.client_send(b"new epoch");
    assert!(pair.run_until(50, |p| p.server_received().len() == 3));
    assert_eq!(pair.server().recv_epoch(), 4);
    assert_eq!(
        pair.server_received(),
        vec![
            b"old epoch".to_vec(),
            b"still old".to_vec(),
            b"new epoch".to_vec()
        ]
    );
}

#[test]
fn requested_update_is_answered() {
    let mut pair = settled_pair(client_builder(), server_builder_with_cert());

    pair.server().initiate_key_update(true).unwrap();
    assert!(pair.run_until(200, |p| {
        p.client.send_epoch() == 4
            && p.server.as_ref().map(|s| s.send_epoch()) == Some(4)
    }));

    pair.client_send(b"c4");
    pair.server_send(b"s4");
    assert!(pair.run_until(50, |p| {
        !p.client_received().is_empty() && !p.server_received().is_empty()
    }));
    assert_eq!(pair.client.recv_epoch(), 4);
    assert_eq!(pair.server().recv_epoch(), 4);
}

#[test]
fn key_update_is_refused_during_handshake() {
    let mut pair = Pair::new(client_builder(), server_builder_with_cert(), Link::lossless());
    assert!(pair.client.initiate_key_update(false).is_err());
    // Not a reason to tear the handshake down.
    pair.handshake();
}

#[test]
fn aead_limit_triggers_key_update() {
    let mut pair = settled_pair(
        client_builder().aead_limit(64),
        server_builder_with_cert().aead_limit(64),
    );

    let messages: Vec<Vec<u8>> = (0..150)
        .map(|i| format!("message {}", i).into_bytes())
        .collect();
    for message in &messages {
        pair.client_send(message);
        pair.step();
        pair.now += TICK;
    }
    assert!(pair.run_until(50, |p| p.server_received().len() == messages.len()));

    assert_eq!(pair.server_received(), messages);
    assert!(pair.client.send_epoch() >= 5, "{}", pair.client.send_epoch());
    assert!(pair.server().recv_epoch() >= 5);
    assert!(pair.client.is_established());
    assert!(pair.server().is_established());
}
