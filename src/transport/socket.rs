use std::io;
use std::net::{SocketAddr, UdpSocket};

/// What a [`Transport`](super::Transport) needs from its socket.
///
/// `recv_from` must return periodically, with `WouldBlock` or `TimedOut`
/// when nothing arrived, so the receiver notices shutdown. A `UdpSocket`
/// given to [`Transport::bind`](super::Transport::bind) gets a read
/// timeout for this.
pub trait DatagramSocket: Send + Sync + 'static {
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize>;

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, peer)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Errors the receiver treats as "nothing to read yet".
pub(super) fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
