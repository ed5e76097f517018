//! Shared helpers: a recording handler, a simulated link and a
//! client/server pair driven in lockstep.

#![allow(unused)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use dtls13::certificate::generate_self_signed_certificate;
use dtls13::{
    Accept, Acceptor, Buf, CertificateVerdict, Config, ConfigBuilder, Connection,
    ConnectionHandler, DisconnectReason, Error, HandshakeInfo, Role, WriteRecord,
};

/// Simulated time per [`Pair::step`].
pub const TICK: Duration = Duration::from_millis(50);

pub fn client_addr() -> SocketAddr {
    "10.0.0.1:5000".parse().unwrap()
}

pub fn server_addr() -> SocketAddr {
    "10.0.0.2:4433".parse().unwrap()
}

/// Generous timers so that a lossy link never runs out of retries.
pub fn client_builder() -> ConfigBuilder {
    Config::builder()
        .role(Role::Client)
        .rng_seed(1)
        .flight_start_rto(Duration::from_millis(200))
        .flight_retries(8)
        .handshake_timeout(Duration::from_secs(600))
}

pub fn server_builder() -> ConfigBuilder {
    Config::builder()
        .role(Role::Server)
        .rng_seed(2)
        .flight_start_rto(Duration::from_millis(200))
        .flight_retries(8)
        .handshake_timeout(Duration::from_secs(600))
        .cookie_lifetime(Duration::from_secs(600))
}

pub fn server_builder_with_cert() -> ConfigBuilder {
    let cert = generate_self_signed_certificate().expect("generate certificate");
    server_builder().certificate(cert)
}

/// Everything a [`Recorder`] saw.
#[derive(Debug, Default)]
pub struct Events {
    pub connected: Option<SocketAddr>,
    pub complete: Option<HandshakeInfo>,
    pub disconnected: Option<String>,
    pub received: Vec<Vec<u8>>,
    /// Records the handler hands out on `on_write_record`.
    pub outgoing: VecDeque<Vec<u8>>,
    pub verified_chain: Option<usize>,
}

pub type SharedEvents = Arc<Mutex<Events>>;

pub struct Recorder {
    events: SharedEvents,
    verdict: CertificateVerdict,
}

impl Recorder {
    pub fn new(events: SharedEvents, verdict: CertificateVerdict) -> Self {
        Recorder { events, verdict }
    }
}

impl ConnectionHandler for Recorder {
    fn on_connect(&mut self, peer: SocketAddr) {
        self.events.lock().unwrap().connected = Some(peer);
    }

    fn on_disconnect(&mut self, reason: &DisconnectReason) {
        self.events.lock().unwrap().disconnected = Some(format!("{:?}", reason));
    }

    fn on_handshake_complete(&mut self, info: &HandshakeInfo) {
        self.events.lock().unwrap().complete = Some(info.clone());
    }

    fn on_write_record(&mut self, buf: &mut [u8]) -> WriteRecord {
        let mut events = self.events.lock().unwrap();
        let Some(data) = events.outgoing.pop_front() else {
            return WriteRecord::default();
        };
        assert!(data.len() <= buf.len(), "test record too large");
        buf[..data.len()].copy_from_slice(&data);
        WriteRecord {
            size: data.len(),
            should_send: false,
            has_more: !events.outgoing.is_empty(),
        }
    }

    fn on_read_record(&mut self, data: &[u8]) -> Result<(), Error> {
        self.events.lock().unwrap().received.push(data.to_vec());
        Ok(())
    }

    fn verify_peer_certificate(&mut self, chain: &[&[u8]]) -> CertificateVerdict {
        self.events.lock().unwrap().verified_chain = Some(chain.len());
        self.verdict
    }
}

/// A datagram link that drops and duplicates, deterministically.
pub struct Link {
    rng: StdRng,
    pub loss: f64,
    pub duplicate: f64,
    pub carried: usize,
    pub dropped: usize,
}

impl Link {
    pub fn lossless() -> Self {
        Link::with(0.0, 0.0, 0)
    }

    /// 20% loss, 10% duplication.
    pub fn lossy(seed: u64) -> Self {
        Link::with(0.2, 0.1, seed)
    }

    pub fn with(loss: f64, duplicate: f64, seed: u64) -> Self {
        Link {
            rng: StdRng::seed_from_u64(seed),
            loss,
            duplicate,
            carried: 0,
            dropped: 0,
        }
    }

    pub fn carry(&mut self, datagram: &[u8]) -> Vec<Vec<u8>> {
        if self.rng.gen_bool(self.loss) {
            self.dropped += 1;
            return Vec::new();
        }
        self.carried += 1;
        let mut out = vec![datagram.to_vec()];
        if self.rng.gen_bool(self.duplicate) {
            out.push(datagram.to_vec());
        }
        out
    }
}

/// A client connection and the server side that appears once the
/// acceptor lets the client through.
pub struct Pair {
    pub client: Connection,
    pub server: Option<Connection>,
    pub acceptor: Acceptor,
    pub server_config: Arc<Config>,
    pub client_events: SharedEvents,
    pub server_events: SharedEvents,
    pub link: Link,
    pub now: Instant,
    /// HelloRetryRequests the acceptor produced.
    pub retries_sent: usize,
    /// Datagrams the client sends go through this first.
    pub client_filter: Option<Box<dyn FnMut(&[u8]) -> bool>>,
    /// Datagrams the server sends go through this first.
    pub server_filter: Option<Box<dyn FnMut(&[u8]) -> bool>>,
}

impl Pair {
    pub fn new(client: ConfigBuilder, server: ConfigBuilder, link: Link) -> Pair {
        Pair::with_verdict(client, server, link, CertificateVerdict::Accept)
    }

    pub fn with_verdict(
        client: ConfigBuilder,
        server: ConfigBuilder,
        link: Link,
        verdict: CertificateVerdict,
    ) -> Pair {
        let _ = env_logger::try_init();

        let client_config = Arc::new(client.build().expect("client config"));
        let server_config = Arc::new(server.build().expect("server config"));
        let now = Instant::now();

        let client_events = SharedEvents::default();
        let handler = Recorder::new(client_events.clone(), verdict);
        let mut client = Connection::new(client_config, Box::new(handler)).expect("client");
        client.connect(server_addr(), now).expect("connect");

        Pair {
            client,
            server: None,
            acceptor: Acceptor::new(server_config.clone()),
            server_config,
            client_events,
            server_events: SharedEvents::default(),
            link,
            now,
            retries_sent: 0,
            client_filter: None,
            server_filter: None,
        }
    }

    pub fn server(&mut self) -> &mut Connection {
        self.server.as_mut().expect("server connection")
    }

    pub fn established(&self) -> bool {
        self.client.is_established()
            && self.server.as_ref().map(|s| s.is_established()).unwrap_or(false)
    }

    /// Timers on both sides, then whatever they want to send.
    pub fn step(&mut self) {
        let _ = self.client.handle_timeout(self.now);
        if let Some(server) = self.server.as_mut() {
            let _ = server.handle_timeout(self.now);
        }
        self.flush_client();
        self.flush_server();
    }

    /// Step and advance time until `done` holds. False if `limit` steps
    /// were not enough.
    pub fn run_until(&mut self, limit: usize, mut done: impl FnMut(&Pair) -> bool) -> bool {
        for _ in 0..limit {
            if done(self) {
                return true;
            }
            self.step();
            self.now += TICK;
        }
        done(self)
    }

    pub fn handshake(&mut self) {
        assert!(
            self.run_until(20_000, |p| p.established()),
            "handshake did not complete: client {:?} server {:?}",
            self.client.state(),
            self.server.as_ref().map(|s| s.state())
        );
    }

    /// Datagrams the client would send now, before the link.
    pub fn client_datagrams(&mut self) -> Vec<Vec<u8>> {
        let mut out = Buf::new();
        let mut datagrams = Vec::new();
        while self.client.poll_datagram(&mut out) {
            datagrams.push(out.to_vec());
        }
        datagrams
    }

    pub fn server_datagrams(&mut self) -> Vec<Vec<u8>> {
        let mut out = Buf::new();
        let mut datagrams = Vec::new();
        if let Some(server) = self.server.as_mut() {
            while server.poll_datagram(&mut out) {
                datagrams.push(out.to_vec());
            }
        }
        datagrams
    }

    pub fn flush_client(&mut self) {
        for datagram in self.client_datagrams() {
            if let Some(filter) = self.client_filter.as_mut() {
                if !filter(&datagram) {
                    continue;
                }
            }
            for copy in self.link.carry(&datagram) {
                self.to_server(copy);
            }
        }
    }

    pub fn flush_server(&mut self) {
        for datagram in self.server_datagrams() {
            if let Some(filter) = self.server_filter.as_mut() {
                if !filter(&datagram) {
                    continue;
                }
            }
            for copy in self.link.carry(&datagram) {
                self.to_client(copy);
            }
        }
    }

    pub fn to_client(&mut self, mut datagram: Vec<u8>) {
        let _ = self.client.handle_datagram(&mut datagram, self.now);
    }

    pub fn to_server(&mut self, mut datagram: Vec<u8>) {
        if let Some(server) = self.server.as_mut() {
            let _ = server.handle_datagram(&mut datagram, self.now);
            return;
        }

        let mut out = Buf::new();
        match self
            .acceptor
            .process(&datagram, client_addr(), self.now, &mut out)
        {
            Accept::Retry => {
                self.retries_sent += 1;
                for copy in self.link.carry(&out) {
                    self.to_client(copy);
                }
            }
            Accept::Accepted(accepted) => {
                let handler = Recorder::new(self.server_events.clone(), CertificateVerdict::Accept);
                let mut server = Connection::new(self.server_config.clone(), Box::new(handler))
                    .expect("server connection");
                let _ = server.accept(*accepted, self.now);
                self.server = Some(server);
            }
            Accept::Drop => {}
        }
    }

    /// Queue application records on the client and wake it.
    pub fn client_send(&mut self, data: &[u8]) {
        self.client_events
            .lock()
            .unwrap()
            .outgoing
            .push_back(data.to_vec());
        self.client.signal_writable();
    }

    pub fn server_send(&mut self, data: &[u8]) {
        self.server_events
            .lock()
            .unwrap()
            .outgoing
            .push_back(data.to_vec());
        self.server().signal_writable();
    }

    pub fn client_received(&self) -> Vec<Vec<u8>> {
        self.client_events.lock().unwrap().received.clone()
    }

    pub fn server_received(&self) -> Vec<Vec<u8>> {
        self.server_events.lock().unwrap().received.clone()
    }

    pub fn client_disconnect(&self) -> Option<String> {
        self.client_events.lock().unwrap().disconnected.clone()
    }

    pub fn server_disconnect(&self) -> Option<String> {
        self.server_events.lock().unwrap().disconnected.clone()
    }
}
