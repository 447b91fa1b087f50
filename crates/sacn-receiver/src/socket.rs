//! Inbound multicast socket setup and reader tasks.
//!
//! Each configured interface gets up to one socket per IP family, bound
//! to the sACN port with address and port reuse so several receivers
//! (in this or other processes) can coexist on one machine. A reader
//! task per socket forwards datagrams to the owning worker.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;

use sacn_protocol::{Interface, IpFamily, IpMode, SocketError, SACN_PORT};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A datagram handed from a reader task to the receiver worker.
pub(crate) struct Datagram {
    pub bytes: Vec<u8>,
    pub source: SocketAddr,
    pub family: IpFamily,
    pub interface: String,
}

/// What a reader task reports to its worker.
pub(crate) enum ReaderMessage {
    Datagram(Datagram),
    /// The socket died at runtime; the reader has exited.
    Closed {
        interface: String,
        error: std::io::Error,
    },
}

pub(crate) struct RxSocket {
    pub interface: Interface,
    pub v4: Option<Arc<UdpSocket>>,
    pub v6: Option<Arc<UdpSocket>>,
    /// Cancelled when this socket's readers must stop.
    pub readers: CancellationToken,
}

impl RxSocket {
    /// Bind, join the given groups, and start reader tasks feeding
    /// `datagrams`.
    pub fn open(
        ip_mode: IpMode,
        interface: &Interface,
        groups_v4: &[Ipv4Addr],
        groups_v6: &[Ipv6Addr],
        datagrams: mpsc::UnboundedSender<ReaderMessage>,
        parent: &CancellationToken,
    ) -> Result<Self, SocketError> {
        let v4 = if ip_mode.includes_v4() {
            Some(Arc::new(open_v4(interface, groups_v4)?))
        } else {
            None
        };
        let v6 = if ip_mode.includes_v6() {
            Some(Arc::new(open_v6(interface, groups_v6)?))
        } else {
            None
        };

        let readers = parent.child_token();
        if let Some(socket) = &v4 {
            spawn_reader(
                Arc::clone(socket),
                IpFamily::V4,
                interface.name.clone(),
                datagrams.clone(),
                readers.clone(),
            );
        }
        if let Some(socket) = &v6 {
            spawn_reader(
                Arc::clone(socket),
                IpFamily::V6,
                interface.name.clone(),
                datagrams,
                readers.clone(),
            );
        }

        Ok(RxSocket {
            interface: interface.clone(),
            v4,
            v6,
            readers,
        })
    }

    pub fn close(&self) {
        self.readers.cancel();
    }
}

fn spawn_reader(
    socket: Arc<UdpSocket>,
    family: IpFamily,
    interface: String,
    datagrams: mpsc::UnboundedSender<ReaderMessage>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        // Largest legal sACN datagram is 1144 bytes (discovery page);
        // one MTU-and-change covers everything.
        let mut buf = [0u8; 2048];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(interface = %interface, ?family, "reader stopped");
                    return;
                }
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, source)) => {
                        let _ = datagrams.send(ReaderMessage::Datagram(Datagram {
                            bytes: buf[..len].to_vec(),
                            source,
                            family,
                            interface: interface.clone(),
                        }));
                    }
                    Err(error) => {
                        warn!(%error, interface = %interface, "receive failed, reader exiting");
                        let _ = datagrams.send(ReaderMessage::Closed { interface, error });
                        return;
                    }
                },
            }
        }
    });
}

fn open_v4(interface: &Interface, groups: &[Ipv4Addr]) -> Result<UdpSocket, SocketError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|source| {
        SocketError::Bind {
            ctx: format!("IPv4 receive socket on {}", interface.name),
            source,
        }
    })?;

    socket
        .set_reuse_address(true)
        .map_err(|source| SocketError::ReusePort { source })?;
    #[cfg(not(target_os = "windows"))]
    socket
        .set_reuse_port(true)
        .map_err(|source| SocketError::ReusePort { source })?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SACN_PORT);
    socket
        .bind(&addr.into())
        .and_then(|()| socket.set_nonblocking(true))
        .map_err(|source| SocketError::Bind {
            ctx: format!("IPv4 receive socket on {}", interface.name),
            source,
        })?;

    let local = interface.ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED);
    for group in groups {
        socket
            .join_multicast_v4(group, &local)
            .map_err(|source| SocketError::JoinMulticast {
                group: IpAddr::V4(*group),
                source,
            })?;
    }

    UdpSocket::from_std(socket.into()).map_err(|source| SocketError::Bind {
        ctx: format!("IPv4 receive socket on {}", interface.name),
        source,
    })
}

fn open_v6(interface: &Interface, groups: &[Ipv6Addr]) -> Result<UdpSocket, SocketError> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).map_err(|source| {
        SocketError::Bind {
            ctx: format!("IPv6 receive socket on {}", interface.name),
            source,
        }
    })?;

    socket
        .set_only_v6(true)
        .map_err(|source| SocketError::Bind {
            ctx: format!("IPv6 receive socket on {}", interface.name),
            source,
        })?;
    socket
        .set_reuse_address(true)
        .map_err(|source| SocketError::ReusePort { source })?;
    #[cfg(not(target_os = "windows"))]
    socket
        .set_reuse_port(true)
        .map_err(|source| SocketError::ReusePort { source })?;

    let addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, SACN_PORT, 0, 0);
    socket
        .bind(&addr.into())
        .and_then(|()| socket.set_nonblocking(true))
        .map_err(|source| SocketError::Bind {
            ctx: format!("IPv6 receive socket on {}", interface.name),
            source,
        })?;

    let index = interface.index.unwrap_or(0);
    for group in groups {
        socket
            .join_multicast_v6(group, index)
            .map_err(|source| SocketError::JoinMulticast {
                group: IpAddr::V6(*group),
                source,
            })?;
    }

    UdpSocket::from_std(socket.into()).map_err(|source| SocketError::Bind {
        ctx: format!("IPv6 receive socket on {}", interface.name),
        source,
    })
}
