pub mod error;
pub mod frame;
pub mod layout;
pub mod merge;
pub mod packet;
pub mod priority;
pub mod sequence;
pub mod source_name;
pub mod universe;

pub use error::{ParseError, SocketError};
pub use packet::{DataPacket, DiscoveryPacket, Packet, StartCode};
pub use priority::Priority;
pub use source_name::SourceName;
pub use universe::Universe;

use std::net::{Ipv4Addr, Ipv6Addr};

/// UDP port all sACN traffic uses, data and discovery alike.
pub const SACN_PORT: u16 = 5568;

/// Number of DMX slots in a universe.
pub const UNIVERSE_SIZE: usize = 512;

/// IPv4 multicast group universe-discovery messages are sent to.
pub const DISCOVERY_GROUP_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 250, 214);

/// IPv6 multicast group universe-discovery messages are sent to.
pub const DISCOVERY_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff18, 0, 0, 0, 0x83, 0, 0xfa, 0xd6);

/// Mandated data transmit period (~44 Hz).
pub const DATA_TRANSMIT_PERIOD: std::time::Duration = std::time::Duration::from_micros(22_727);

/// Ticks per keep-alive cycle; levels are re-sent on ticks 0, 11, 22, 33.
pub const TICKS_PER_CYCLE: u8 = 44;

/// Interval between universe-discovery transmissions.
pub const DISCOVERY_TRANSMIT_PERIOD: std::time::Duration = std::time::Duration::from_secs(10);

/// A source is declared lost this long after its last data packet.
pub const SOURCE_LOSS_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(2500);

/// How long a receiver waits for a per-address-priority stream before
/// treating a source as levels-only.
pub const PAP_WAIT_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);

/// Length of the receiver sampling window.
pub const SAMPLING_PERIOD: std::time::Duration = std::time::Duration::from_millis(1500);

/// A discovered source expires after missing two discovery intervals.
pub const DISCOVERY_SOURCE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);

/// Cadence of the receiver-side loss-detection heartbeats.
pub const LOSS_HEARTBEAT_PERIOD: std::time::Duration = std::time::Duration::from_millis(500);

/// Which IP families an instance binds and joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpMode {
    Ipv4Only,
    Ipv6Only,
    Ipv4And6,
}

impl IpMode {
    pub fn includes_v4(self) -> bool {
        matches!(self, IpMode::Ipv4Only | IpMode::Ipv4And6)
    }

    pub fn includes_v6(self) -> bool {
        matches!(self, IpMode::Ipv6Only | IpMode::Ipv4And6)
    }
}

impl Default for IpMode {
    fn default() -> Self {
        IpMode::Ipv4Only
    }
}

/// A network interface to bind and multicast on.
///
/// The library does not enumerate interfaces itself; the embedder
/// resolves a name to whichever of these fields the configured IP modes
/// need. `ipv4` is the interface's local address (used for
/// `IP_MULTICAST_IF` and group joins), `index` the OS interface index
/// for the IPv6 equivalents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Interface {
    /// Diagnostic label, e.g. `eth0`. Also the identity used when
    /// diffing interface sets.
    pub name: String,
    pub ipv4: Option<Ipv4Addr>,
    pub index: Option<u32>,
}

impl Interface {
    /// The IPv4 wildcard pseudo-interface: bind and join on
    /// `0.0.0.0`, letting the OS route. Only valid for `IpMode::Ipv4Only`.
    pub fn any() -> Self {
        Interface {
            name: String::from("any"),
            ipv4: Some(Ipv4Addr::UNSPECIFIED),
            index: None,
        }
    }

    pub fn named(name: impl Into<String>) -> InterfaceBuilder {
        InterfaceBuilder(Interface {
            name: name.into(),
            ipv4: None,
            index: None,
        })
    }
}

/// Builder so embedders can fill in whichever facts they resolved.
pub struct InterfaceBuilder(Interface);

impl InterfaceBuilder {
    pub fn ipv4(mut self, addr: Ipv4Addr) -> Self {
        self.0.ipv4 = Some(addr);
        self
    }

    pub fn index(mut self, index: u32) -> Self {
        self.0.index = Some(index);
        self
    }

    pub fn build(self) -> Interface {
        self.0
    }
}

/// IP family a datagram arrived on. Part of a receiver-side source's
/// identity: the same CID seen on the other family is a different peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(addr: &std::net::IpAddr) -> Self {
        match addr {
            std::net::IpAddr::V4(_) => IpFamily::V4,
            std::net::IpAddr::V6(_) => IpFamily::V6,
        }
    }
}
