use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use super::NetworkError;

/// Largest datagram we will read in one receive call.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// Datagram channel shared by every peer in one multicast group.
///
/// Each send publishes one datagram to the whole group; each receive yields
/// one datagram from any peer, including loopback copies of our own sends.
/// Address reuse is enabled so several peers can coexist on one host.
pub struct MulticastTransport {
    socket: UdpSocket,
    group: SocketAddrV4,
}

impl MulticastTransport {
    pub fn bind(group: Ipv4Addr, port: u16) -> Result<Self, NetworkError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(NetworkError::Bind)?;
        socket.set_reuse_address(true).map_err(NetworkError::Bind)?;
        #[cfg(unix)]
        socket.set_reuse_port(true).map_err(NetworkError::Bind)?;

        let address = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&address.into()).map_err(NetworkError::Bind)?;

        socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(NetworkError::Join)?;
        socket.set_multicast_ttl_v4(1).map_err(NetworkError::Join)?;
        socket
            .set_multicast_loop_v4(true)
            .map_err(NetworkError::Join)?;

        socket.set_nonblocking(true).map_err(NetworkError::Bind)?;
        let socket = UdpSocket::from_std(socket.into()).map_err(NetworkError::Bind)?;

        Ok(Self {
            socket,
            group: SocketAddrV4::new(group, port),
        })
    }

    /// Publish one datagram to the group. Best effort; there are no retries
    /// at this layer.
    pub async fn send(&self, data: &[u8]) -> Result<(), NetworkError> {
        self.socket
            .send_to(data, SocketAddr::V4(self.group))
            .await
            .map_err(NetworkError::Send)?;
        Ok(())
    }

    /// Wait for the next datagram from any peer. The source address is only
    /// useful for diagnostics.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), NetworkError> {
        self.socket.recv_from(buf).await.map_err(NetworkError::Recv)
    }
}
