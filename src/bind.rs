//! The UDP collaborator interface.
//!
//! The transport core never touches sockets directly; it sends and receives
//! datagrams through this trait. Implementations may support GSO-style
//! batching (coalescing datagrams to one endpoint, lengths monotone
//! non-increasing) by overriding [`UdpBind::send_batch`], and advertise GRO
//! splitting through [`UdpBind::max_gso_segments`].

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;

/// A bound UDP endpoint the transport can send to and receive from.
#[async_trait]
pub trait UdpBind: Send + Sync + 'static {
    /// Send one datagram to `endpoint`.
    async fn send(&self, datagram: &[u8], endpoint: SocketAddr) -> io::Result<()>;

    /// Send a batch of datagrams to one endpoint. The default sends them
    /// one at a time; GSO-capable binds may coalesce.
    async fn send_batch(&self, datagrams: &[Vec<u8>], endpoint: SocketAddr) -> io::Result<()> {
        for datagram in datagrams {
            self.send(datagram, endpoint).await?;
        }
        Ok(())
    }

    /// Receive one datagram, returning its length and source address.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Largest batch [`Self::send_batch`] benefits from; 1 disables batching.
    fn max_gso_segments(&self) -> usize {
        1
    }

    /// Release the socket. Dropping the bind must also release it; this
    /// exists so shutdown can be explicit.
    fn close(&self) {}
}

/// [`UdpBind`] over a tokio UDP socket.
pub struct UdpSocketBind {
    socket: tokio::net::UdpSocket,
}

impl UdpSocketBind {
    /// Bind to the given port on all interfaces; port 0 picks one at
    /// random. Returns the bind and the chosen local port.
    pub async fn open(port: u16) -> io::Result<(Self, u16)> {
        let socket = tokio::net::UdpSocket::bind(("0.0.0.0", port)).await?;
        let local_port = socket.local_addr()?.port();
        Ok((Self { socket }, local_port))
    }
}

#[async_trait]
impl UdpBind for UdpSocketBind {
    async fn send(&self, datagram: &[u8], endpoint: SocketAddr) -> io::Result<()> {
        self.socket.send_to(datagram, endpoint).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}
