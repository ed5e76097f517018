use std::net::SocketAddr;
use std::time::Instant;

use super::socket::is_idle;
use super::Shared;
use crate::buffer::Buf;
use crate::Accept;

/// Largest datagram the receiver reads.
const MAX_DATAGRAM: usize = 65_535;

pub(super) fn receive(shared: &Shared) {
    let mut buf = Buf::new();
    buf.resize(MAX_DATAGRAM, 0);
    let mut retry = Buf::with_capacity(shared.config.mtu());

    while !shared.is_shutdown() {
        let (len, peer) = match shared.socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if is_idle(&e) => continue,
            Err(e) => {
                warn!("Socket receive failed: {}", e);
                continue;
            }
        };
        let now = Instant::now();
        trace!("Received {} bytes from {}", len, peer);

        if !route(shared, &mut buf[..len], peer, now) {
            admit(shared, &buf[..len], peer, now, &mut retry);
        }
    }
    debug!("Receiver stopped");
}

/// Hand the datagram to the connection bound to `peer`. False if there
/// is none.
fn route(shared: &Shared, datagram: &mut [u8], peer: SocketAddr, now: Instant) -> bool {
    let Some(idx) = shared.registry.lock().lookup(&peer) else {
        return false;
    };
    let mut slot = shared.slots[idx].lock();
    let Some(conn) = slot.conn.as_mut().filter(|c| c.peer() == Some(peer)) else {
        return false;
    };
    if let Err(e) = conn.handle_datagram(datagram, now) {
        debug!("Connection to {} failed: {}", peer, e);
    }
    shared.after_io(idx, &mut slot, now);
    true
}

/// A datagram from an unknown address. Servers run it through the
/// acceptor, clients drop it.
fn admit(shared: &Shared, datagram: &[u8], peer: SocketAddr, now: Instant, retry: &mut Buf) {
    let Some(acceptor) = shared.acceptor.as_ref() else {
        trace!("Dropping datagram from unknown {}", peer);
        return;
    };

    retry.clear();
    match acceptor.process(datagram, peer, now, retry) {
        Accept::Retry => {
            let mut outbox = shared.outbox.lock();
            let Some(mut out) = outbox.retry_pool.pop() else {
                debug!("Retry pool exhausted, dropping HelloRetryRequest to {}", peer);
                return;
            };
            out.extend_from_slice(retry);
            if let Err((out, _)) = outbox.retries.push((out, peer)) {
                outbox.retry_pool.push(out);
                return;
            }
            drop(outbox);
            shared.outbox_signal.notify_one();
        }
        Accept::Accepted(accepted) => {
            let result = shared.open(peer, now, move |conn, now| conn.accept(*accepted, now));
            if let Err(e) = result {
                debug!("Accepting {} failed: {}", peer, e);
            }
        }
        Accept::Drop => {}
    }
}

pub(super) fn send(shared: &Shared) {
    let mut out = Buf::with_capacity(shared.config.mtu());

    loop {
        let mut outbox = shared.outbox.lock();
        while outbox.retries.is_empty() && outbox.ready.is_empty() && !shared.is_shutdown() {
            shared.outbox_signal.wait(&mut outbox);
        }
        if shared.is_shutdown() {
            break;
        }

        if let Some((datagram, peer)) = outbox.retries.pop() {
            drop(outbox);
            transmit(shared, &datagram, peer);
            shared.outbox.lock().retry_pool.push(datagram);
            continue;
        }

        let Some(idx) = outbox.ready.pop() else {
            continue;
        };
        drop(outbox);
        flush(shared, idx, &mut out);
    }
    debug!("Sender stopped");
}

/// Write out everything the connection in slot `idx` has.
fn flush(shared: &Shared, idx: usize, out: &mut Buf) {
    let mut slot = shared.slots[idx].lock();
    slot.queued = false;
    let Some(conn) = slot.conn.as_mut() else {
        return;
    };
    let Some(peer) = conn.peer() else {
        return;
    };
    let mut sent = 0;
    while conn.poll_datagram(out) {
        transmit(shared, out, peer);
        sent += 1;
    }
    if sent > 0 {
        trace!("Flushed {} datagrams to {}", sent, peer);
    }

    // Output was produced, so the timer may have moved. A closed
    // connection is released here if the receiver left it to us.
    if conn.is_closed() || sent > 0 {
        let now = Instant::now();
        let deadline = conn.poll_timeout().filter(|_| !conn.is_closed());
        shared.schedule(idx, deadline, now);
        if conn.is_closed() {
            shared.release(idx, &mut slot);
        }
    }
}

fn transmit(shared: &Shared, datagram: &[u8], peer: SocketAddr) {
    if let Err(e) = shared.socket.send_to(datagram, peer) {
        debug!("Send to {} failed: {}", peer, e);
    }
}

pub(super) fn clock(shared: &Shared) {
    let mut timers = shared.timers.lock();
    while !shared.is_shutdown() {
        let Some((idx, at)) = timers.peek() else {
            shared.timers_signal.wait(&mut timers);
            continue;
        };
        let now = Instant::now();
        if at > now {
            shared.timers_signal.wait_until(&mut timers, at);
            continue;
        }
        timers.remove(idx);
        drop(timers);

        fire(shared, idx, now);
        timers = shared.timers.lock();
    }
    debug!("Clock stopped");
}

fn fire(shared: &Shared, idx: usize, now: Instant) {
    let mut slot = shared.slots[idx].lock();
    let Some(conn) = slot.conn.as_mut() else {
        return;
    };
    if let Err(e) = conn.handle_timeout(now) {
        debug!("Connection to {:?} timed out: {}", conn.peer(), e);
    }
    shared.after_io(idx, &mut slot, now);
}
