//! Threaded driver for many connections on one socket.
//!
//! Three workers share the state below:
//!
//! * the receiver reads datagrams, routes them by peer address and lets
//!   the [`Acceptor`] answer strangers,
//! * the sender drains connections that have output, plus stateless
//!   retry datagrams,
//! * the clock fires connection timers off an [`IndexHeap`].
//!
//! Each connection sits in a slab slot with its own lock. The registry
//! lock (address table, free list, connection pool) is only taken while
//! holding a slot lock or no lock at all. The outbox and timer locks are
//! leaves.

mod registry;
mod socket;
mod workers;

pub use socket::DatagramSocket;

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use self::registry::{Registry, Slot};
use crate::buffer::{BoundedPool, Buf};
use crate::containers::{IndexHeap, RingBuffer};
use crate::handler::HandlerFactory;
use crate::{Acceptor, Config, Connection, Error, NoopHandler, Role};

/// How long the receiver of a bound `UdpSocket` blocks before checking
/// for shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Work for the sender.
struct Outbox {
    /// Slab indices with output. Each index is queued at most once.
    ready: RingBuffer<usize>,
    /// Stateless HelloRetryRequests.
    retries: RingBuffer<(Buf, SocketAddr)>,
    retry_pool: BoundedPool,
}

struct Shared {
    config: Arc<Config>,
    socket: Box<dyn DatagramSocket>,
    acceptor: Option<Acceptor>,
    factory: Box<dyn HandlerFactory>,

    slots: Vec<Mutex<Slot>>,
    registry: Mutex<Registry>,

    outbox: Mutex<Outbox>,
    outbox_signal: Condvar,

    timers: Mutex<IndexHeap<Instant>>,
    timers_signal: Condvar,

    shutdown: AtomicBool,
}

/// A socket serving many DTLS connections.
///
/// Servers accept any peer that completes the cookie exchange. Clients
/// (and servers) open connections with [`Transport::dial`].
pub struct Transport {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Transport {
    /// Bind a UDP socket and start the workers.
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        config: Arc<Config>,
        factory: impl HandlerFactory + 'static,
    ) -> Result<Transport, Error> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        Transport::with_socket(socket, config, factory)
    }

    /// Start the workers on an existing socket.
    pub fn with_socket<S: DatagramSocket>(
        socket: S,
        config: Arc<Config>,
        factory: impl HandlerFactory + 'static,
    ) -> Result<Transport, Error> {
        // Validates the config, and primes the pool.
        let first = Connection::new(config.clone(), Box::new(NoopHandler))?;

        let capacity = config.max_connections();
        let mut registry = Registry::new(capacity);
        registry.recycle(first);

        let acceptor = (config.role() == Role::Server).then(|| Acceptor::new(config.clone()));
        let outbox = Outbox {
            ready: RingBuffer::new(capacity),
            retries: RingBuffer::new(config.max_pending_retries()),
            retry_pool: BoundedPool::new(config.max_pending_retries(), config.mtu()),
        };

        let shared = Arc::new(Shared {
            socket: Box::new(socket),
            acceptor,
            factory: Box::new(factory),
            slots: (0..capacity).map(|_| Mutex::new(Slot::default())).collect(),
            registry: Mutex::new(registry),
            outbox: Mutex::new(outbox),
            outbox_signal: Condvar::new(),
            timers: Mutex::new(IndexHeap::new(capacity)),
            timers_signal: Condvar::new(),
            shutdown: AtomicBool::new(false),
            config,
        });
        info!(
            "Transport on {:?} for up to {} connections",
            shared.socket.local_addr().ok(),
            capacity
        );

        let spawn = |name: &str, work: fn(&Shared)| {
            let shared = shared.clone();
            thread::Builder::new()
                .name(name.into())
                .spawn(move || work(&shared))
        };
        let workers = vec![
            spawn("dtls-recv", workers::receive)?,
            spawn("dtls-send", workers::send)?,
            spawn("dtls-clock", workers::clock)?,
        ];

        Ok(Transport { shared, workers })
    }

    /// Open a connection to `peer` as a client.
    pub fn dial(&self, peer: SocketAddr) -> Result<(), Error> {
        if self.shared.config.role() != Role::Client {
            return Err(Error::ConfigError("dial needs a client config".into()));
        }
        self.shared
            .open(peer, Instant::now(), |conn, now| conn.connect(peer, now))
    }

    /// The application has data for `peer`. False if there is no such
    /// connection.
    pub fn signal_writable(&self, peer: SocketAddr) -> bool {
        self.shared
            .with_connection(peer, |conn| {
                conn.signal_writable();
                Ok(())
            })
            .is_some()
    }

    /// Start a KeyUpdate on the connection to `peer`.
    pub fn key_update(&self, peer: SocketAddr, request_peer: bool) -> Result<(), Error> {
        self.shared
            .with_connection(peer, |conn| conn.initiate_key_update(request_peer))
            .unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Close the connection to `peer` with close_notify.
    pub fn close(&self, peer: SocketAddr) -> bool {
        self.shared
            .with_connection(peer, |conn| {
                conn.shutdown();
                Ok(())
            })
            .is_some()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Connections currently bound to a peer address.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Close every connection and stop the workers.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        let peers = self.shared.registry.lock().peers();
        for (peer, _) in peers {
            self.close(peer);
        }
        // Give the sender a chance at the close_notify alerts.
        self.shared.wait_for_outbox(Duration::from_millis(200));

        self.shared.shutdown.store(true, Ordering::SeqCst);
        // Workers check the flag under their lock before waiting.
        drop(self.shared.outbox.lock());
        self.shared.outbox_signal.notify_all();
        drop(self.shared.timers.lock());
        self.shared.timers_signal.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("Transport worker panicked");
            }
        }
        info!("Transport stopped");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Set up a new connection in a free slot and start it with `start`.
    fn open<F>(&self, peer: SocketAddr, now: Instant, start: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Connection, Instant) -> Result<(), Error>,
    {
        let reserved = self.registry.lock().reserve(peer);
        let (idx, pooled) = match reserved {
            Ok(reserved) => reserved,
            Err(Error::TransportFull) => {
                warn!("Connection table full, dropping {}", peer);
                return Err(Error::TransportFull);
            }
            Err(e) => return Err(e),
        };

        let handler = self.factory.create(peer);
        let mut conn = match pooled {
            Some(mut conn) => {
                conn.reset(handler);
                conn
            }
            None => match Connection::new(self.config.clone(), handler) {
                Ok(conn) => conn,
                Err(e) => {
                    self.registry.lock().release(idx, Some(peer), None);
                    return Err(e);
                }
            },
        };

        let mut slot = self.slots[idx].lock();
        debug_assert!(slot.conn.is_none(), "reserved slot {} in use", idx);
        let result = start(&mut conn, now);
        if conn.peer().is_none() {
            // Refused before taking the address.
            self.registry.lock().release(idx, Some(peer), Some(conn));
            return result;
        }
        slot.conn = Some(conn);
        self.after_io(idx, &mut slot, now);
        result
    }

    /// Run `f` on the connection bound to `peer`, then schedule its
    /// output and timer.
    fn with_connection<F>(&self, peer: SocketAddr, f: F) -> Option<Result<(), Error>>
    where
        F: FnOnce(&mut Connection) -> Result<(), Error>,
    {
        let idx = self.registry.lock().lookup(&peer)?;
        let mut slot = self.slots[idx].lock();
        let conn = slot.conn.as_mut().filter(|c| c.peer() == Some(peer))?;
        let result = f(conn);
        self.after_io(idx, &mut slot, Instant::now());
        Some(result)
    }

    /// Bookkeeping after the connection in `slot` did anything: queue it
    /// for the sender, move its timer, release it once closed.
    fn after_io(&self, idx: usize, slot: &mut MutexGuard<'_, Slot>, now: Instant) {
        let Some(conn) = slot.conn.as_ref() else {
            return;
        };
        let deadline = conn.poll_timeout();
        let closed = conn.is_closed();

        if !closed && !slot.queued {
            slot.queued = true;
            let mut outbox = self.outbox.lock();
            if outbox.ready.push(idx).is_err() {
                unreachable!("ready queue holds every slot at most once");
            }
            drop(outbox);
            self.outbox_signal.notify_one();
        }

        self.schedule(idx, deadline.filter(|_| !closed), now);

        if closed && !slot.queued {
            self.release(idx, slot);
        }
    }

    fn schedule(&self, idx: usize, deadline: Option<Instant>, now: Instant) {
        let mut timers = self.timers.lock();
        let before = timers.peek();
        match deadline {
            // Replaces the scheduled deadline even when earlier, so a
            // shortened retransmit timer is not held back. Past ones fire now.
            Some(at) => timers.set(idx, at.max(now)),
            None => {
                timers.remove(idx);
            }
        }
        if timers.peek() != before {
            self.timers_signal.notify_one();
        }
    }

    fn release(&self, idx: usize, slot: &mut MutexGuard<'_, Slot>) {
        let Some(conn) = slot.conn.take() else {
            return;
        };
        let peer = conn.peer();
        debug!("Releasing slot {} ({:?})", idx, peer);
        self.timers.lock().remove(idx);
        self.registry.lock().release(idx, peer, Some(conn));
    }

    /// Block until the sender has nothing queued, or `limit` passes.
    fn wait_for_outbox(&self, limit: Duration) {
        let until = Instant::now() + limit;
        loop {
            let idle = {
                let outbox = self.outbox.lock();
                outbox.ready.is_empty() && outbox.retries.is_empty()
            };
            if idle || Instant::now() >= until {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}
