use std::collections::HashMap;
use std::net::SocketAddr;

use crate::{Connection, Error};

/// One entry of the connection slab, behind its own lock.
#[derive(Default)]
pub(super) struct Slot {
    pub conn: Option<Connection>,
    /// The index sits in the sender's ready queue. A closed connection
    /// is only released once the sender has taken it off.
    pub queued: bool,
}

/// Address table, free slab indices and recycled connections.
///
/// Guarded by one lock that is only ever taken after a slot lock, never
/// before.
pub(super) struct Registry {
    by_addr: HashMap<SocketAddr, usize>,
    free: Vec<usize>,
    pool: Vec<Connection>,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Registry {
            by_addr: HashMap::with_capacity(capacity),
            free: (0..capacity).rev().collect(),
            pool: Vec::new(),
        }
    }

    pub fn lookup(&self, peer: &SocketAddr) -> Option<usize> {
        self.by_addr.get(peer).copied()
    }

    /// Claim a free index for `peer` and route its datagrams there. Also
    /// hands out a closed connection to reuse if one is pooled.
    ///
    /// Claiming and binding under the same lock means two openers racing
    /// for one address cannot both win.
    pub fn reserve(&mut self, peer: SocketAddr) -> Result<(usize, Option<Connection>), Error> {
        if self.by_addr.contains_key(&peer) {
            return Err(Error::ConfigError(format!("already connected to {}", peer)));
        }
        let idx = self.free.pop().ok_or(Error::TransportFull)?;
        self.by_addr.insert(peer, idx);
        Ok((idx, self.pool.pop()))
    }

    /// Give back an index, unbinding `peer` if it still points there.
    pub fn release(&mut self, idx: usize, peer: Option<SocketAddr>, conn: Option<Connection>) {
        if let Some(peer) = peer {
            if self.by_addr.get(&peer) == Some(&idx) {
                self.by_addr.remove(&peer);
            }
        }
        debug_assert!(!self.free.contains(&idx), "slot {} released twice", idx);
        self.free.push(idx);
        if let Some(conn) = conn {
            self.recycle(conn);
        }
    }

    /// Keep a closed connection for the next [`Registry::reserve`].
    pub fn recycle(&mut self, conn: Connection) {
        self.pool.push(conn);
    }

    /// Connections with a bound address.
    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn peers(&self) -> Vec<(SocketAddr, usize)> {
        self.by_addr.iter().map(|(a, i)| (*a, *i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn reserve_until_full() {
        let mut registry = Registry::new(2);
        let (a, _) = registry.reserve(addr(1000)).unwrap();
        let (b, _) = registry.reserve(addr(2000)).unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            registry.reserve(addr(3000)),
            Err(Error::TransportFull)
        ));

        registry.release(a, Some(addr(1000)), None);
        let (c, _) = registry.reserve(addr(3000)).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn address_is_claimed_once() {
        let mut registry = Registry::new(4);
        let (a, _) = registry.reserve(addr(1000)).unwrap();
        assert!(matches!(
            registry.reserve(addr(1000)),
            Err(Error::ConfigError(_))
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(&addr(1000)), Some(a));

        registry.release(a, Some(addr(1000)), None);
        assert!(registry.reserve(addr(1000)).is_ok());
    }

    #[test]
    fn release_unbinds_only_own_address() {
        let mut registry = Registry::new(4);
        let (a, _) = registry.reserve(addr(1000)).unwrap();
        let (b, _) = registry.reserve(addr(2000)).unwrap();
        assert_eq!(registry.len(), 2);

        // A stale release naming someone else's address leaves it bound.
        registry.release(a, Some(addr(2000)), None);
        assert_eq!(registry.lookup(&addr(2000)), Some(b));
        assert_eq!(registry.lookup(&addr(1000)), Some(a));

        registry.release(b, Some(addr(2000)), None);
        assert_eq!(registry.lookup(&addr(2000)), None);
    }
}
