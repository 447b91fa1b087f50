//! Outbound multicast socket setup.
//!
//! One `TxSocket` per configured interface, holding up to one socket per
//! IP family. Sockets bind an ephemeral port; the multicast egress
//! interface, TTL and loopback are set at creation and never change.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use sacn_protocol::{Interface, IpMode, SocketError};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

pub(crate) struct TxSocket {
    pub interface: Interface,
    pub v4: Option<UdpSocket>,
    pub v6: Option<UdpSocket>,
    /// Consecutive send failures; the socket is dropped after three.
    pub failures: u8,
}

impl TxSocket {
    pub fn open(ip_mode: IpMode, interface: &Interface) -> Result<Self, SocketError> {
        let v4 = if ip_mode.includes_v4() {
            Some(open_v4(interface)?)
        } else {
            None
        };
        let v6 = if ip_mode.includes_v6() {
            Some(open_v6(interface)?)
        } else {
            None
        };
        Ok(TxSocket {
            interface: interface.clone(),
            v4,
            v6,
            failures: 0,
        })
    }
}

fn open_v4(interface: &Interface) -> Result<UdpSocket, SocketError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|source| {
        SocketError::Bind {
            ctx: format!("IPv4 transmit socket on {}", interface.name),
            source,
        }
    })?;

    let egress = interface.ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket
        .set_multicast_if_v4(&egress)
        .and_then(|()| socket.set_multicast_ttl_v4(64))
        .and_then(|()| socket.set_multicast_loop_v4(true))
        .map_err(|source| SocketError::MulticastInterface {
            ctx: format!("{} ({egress})", interface.name),
            source,
        })?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    socket
        .bind(&addr.into())
        .and_then(|()| socket.set_nonblocking(true))
        .map_err(|source| SocketError::Bind {
            ctx: format!("IPv4 transmit socket on {}", interface.name),
            source,
        })?;

    UdpSocket::from_std(socket.into()).map_err(|source| SocketError::Bind {
        ctx: format!("IPv4 transmit socket on {}", interface.name),
        source,
    })
}

fn open_v6(interface: &Interface) -> Result<UdpSocket, SocketError> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).map_err(|source| {
        SocketError::Bind {
            ctx: format!("IPv6 transmit socket on {}", interface.name),
            source,
        }
    })?;

    let index = interface.index.unwrap_or(0);
    socket
        .set_only_v6(true)
        .and_then(|()| socket.set_multicast_if_v6(index))
        .and_then(|()| socket.set_multicast_loop_v6(true))
        .map_err(|source| SocketError::MulticastInterface {
            ctx: format!("{} (index {index})", interface.name),
            source,
        })?;

    let addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0);
    socket
        .bind(&addr.into())
        .and_then(|()| socket.set_nonblocking(true))
        .map_err(|source| SocketError::Bind {
            ctx: format!("IPv6 transmit socket on {}", interface.name),
            source,
        })?;

    UdpSocket::from_std(socket.into()).map_err(|source| SocketError::Bind {
        ctx: format!("IPv6 transmit socket on {}", interface.name),
        source,
    })
}
