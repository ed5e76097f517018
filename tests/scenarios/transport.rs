use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dtls13::{CertificateVerdict, ConnectionHandler, Transport};

use crate::common::*;

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

fn recording(events: SharedEvents) -> impl Fn(SocketAddr) -> Box<dyn ConnectionHandler> {
    move |_peer| {
        Box::new(Recorder::new(events.clone(), CertificateVerdict::Accept))
            as Box<dyn ConnectionHandler>
    }
}

#[test]
fn loopback_handshake_and_data() {
    let _ = env_logger::try_init();

    let server_events = SharedEvents::default();
    let server_config = Arc::new(server_builder_with_cert().build().unwrap());
    let server = Transport::bind("127.0.0.1:0", server_config, recording(server_events.clone()))
        .expect("bind server");
    let server_addr = server.local_addr().unwrap();

    let client_events = SharedEvents::default();
    let client_config = Arc::new(client_builder().build().unwrap());
    let client = Transport::bind("127.0.0.1:0", client_config, recording(client_events.clone()))
        .expect("bind client");
    let client_addr = client.local_addr().unwrap();

    client.dial(server_addr).expect("dial");
    assert!(client.dial(server_addr).is_err(), "second dial to the same peer");

    wait_for("handshake", || {
        client_events.lock().unwrap().complete.is_some()
            && server_events.lock().unwrap().complete.is_some()
    });
    assert_eq!(client.connection_count(), 1);
    assert_eq!(server.connection_count(), 1);
    let info = server_events.lock().unwrap().complete.clone().unwrap();
    assert_eq!(info.peer, client_addr);

    client_events
        .lock()
        .unwrap()
        .outgoing
        .push_back(b"over udp".to_vec());
    assert!(client.signal_writable(server_addr));
    wait_for("client data", || !server_events.lock().unwrap().received.is_empty());

    server_events
        .lock()
        .unwrap()
        .outgoing
        .push_back(b"and back".to_vec());
    assert!(server.signal_writable(client_addr));
    wait_for("server data", || !client_events.lock().unwrap().received.is_empty());

    assert_eq!(
        server_events.lock().unwrap().received,
        vec![b"over udp".to_vec()]
    );
    assert_eq!(
        client_events.lock().unwrap().received,
        vec![b"and back".to_vec()]
    );

    client.key_update(server_addr, true).expect("key update");
    client_events
        .lock()
        .unwrap()
        .outgoing
        .push_back(b"after update".to_vec());
    client.signal_writable(server_addr);
    wait_for("data after update", || {
        server_events.lock().unwrap().received.len() == 2
    });

    assert!(client.close(server_addr));
    wait_for("close", || {
        server_events.lock().unwrap().disconnected.is_some()
            && client.connection_count() == 0
            && server.connection_count() == 0
    });
    assert_eq!(
        server_events.lock().unwrap().disconnected.as_deref(),
        Some("PeerClosed")
    );
    assert!(client.key_update(server_addr, false).is_err());

    client.shutdown();
    server.shutdown();
}

#[test]
fn server_transport_refuses_dial() {
    let config = Arc::new(server_builder_with_cert().build().unwrap());
    let transport =
        Transport::bind("127.0.0.1:0", config, recording(SharedEvents::default())).unwrap();
    let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
    assert!(transport.dial(peer).is_err());
    assert!(!transport.signal_writable(peer));
    assert!(!transport.close(peer));
    transport.shutdown();
}

#[test]
fn server_config_without_credentials_is_rejected() {
    let config = Arc::new(server_builder().build().unwrap());
    let result = Transport::bind("127.0.0.1:0", config, recording(SharedEvents::default()));
    assert!(result.is_err());
}

#[test]
fn racing_dials_to_one_peer() {
    let config = Arc::new(client_builder().build().unwrap());
    let transport =
        Transport::bind("127.0.0.1:0", config, recording(SharedEvents::default())).unwrap();
    // Nobody listens there. The dials only have to settle who owns the slot.
    let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();

    let results: Vec<bool> = thread::scope(|s| {
        let dials: Vec<_> = (0..8)
            .map(|_| s.spawn(|| transport.dial(peer).is_ok()))
            .collect();
        dials.into_iter().map(|d| d.join().unwrap()).collect()
    });
    assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
    assert_eq!(transport.connection_count(), 1);
    transport.shutdown();
}
