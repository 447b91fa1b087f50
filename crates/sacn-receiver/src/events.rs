use sacn_protocol::packet::StartCode;
use sacn_protocol::{Priority, SocketError, SourceName, UNIVERSE_SIZE};
use uuid::Uuid;

/// One accepted data datagram from one source, as surfaced by the raw
/// receiver after sequence filtering and identity checks.
#[derive(Debug, Clone)]
pub struct SourceData {
    pub cid: Uuid,
    pub name: SourceName,
    pub universe: u16,
    /// Universe priority from the framing layer.
    pub priority: Priority,
    pub start_code: StartCode,
    pub values: Vec<u8>,
    /// The source is still inside the receiver's sampling window.
    pub is_sampling: bool,
}

/// Notifications from a [`crate::RawReceiver`].
#[derive(Debug)]
pub enum RawReceiverEvent {
    /// An accepted levels or per-address-priority datagram.
    UniverseData(SourceData),
    SamplingStarted,
    SamplingEnded,
    /// Sources whose data stream timed out or terminated, coalesced per
    /// heartbeat.
    SourcesLost(Vec<Uuid>),
    /// A source's per-address-priority stream timed out; it falls back
    /// to its universe priority.
    SourcePapLost(Uuid),
    /// The configured source limit was hit; the excess source is
    /// ignored.
    SourceLimitExceeded,
    SocketClosed {
        interface: String,
        error: SocketError,
    },
}

/// Notifications from a merged [`crate::Receiver`].
#[derive(Debug)]
pub enum ReceiverEvent {
    /// A fresh merge result. Fired for every accepted datagram once
    /// sampling is over and no source is still waiting for its first
    /// levels.
    MergedData {
        universe: u16,
        levels: Box<[u8; UNIVERSE_SIZE]>,
        winners: Box<[Option<Uuid>; UNIVERSE_SIZE]>,
        active_sources: Vec<Uuid>,
    },
    SamplingStarted,
    SamplingEnded,
    SourcesLost(Vec<Uuid>),
    SourceLimitExceeded,
    SocketClosed {
        interface: String,
        error: SocketError,
    },
}

/// Notifications from a [`crate::DiscoveryReceiver`].
#[derive(Debug)]
pub enum DiscoveryEvent {
    /// A source completed (or changed) its paged universe list.
    SourceDiscovered {
        cid: Uuid,
        name: SourceName,
        universes: Vec<u16>,
    },
    /// Sources that stopped sending discovery messages, coalesced per
    /// heartbeat.
    SourcesLost(Vec<Uuid>),
    SocketClosed {
        interface: String,
        error: SocketError,
    },
}
