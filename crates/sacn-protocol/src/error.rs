use std::net::IpAddr;

use thiserror::Error;

/// Errors raised while decoding an E1.31 datagram or constructing one of
/// the validated field types.
///
/// Receivers never surface these to the embedder directly; a datagram
/// that fails to parse is logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("datagram too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },
    #[error("invalid preamble size")]
    InvalidPreamble,
    #[error("invalid postamble size")]
    InvalidPostamble,
    #[error("invalid ACN packet identifier")]
    InvalidAcnIdentifier,
    #[error("invalid PDU flags: {flags:#04x}")]
    InvalidPduFlags { flags: u8 },
    #[error("PDU length {length} inconsistent with datagram")]
    InvalidPduLength { length: usize },
    #[error("unknown root vector: {vector:#010x}")]
    UnknownRootVector { vector: u32 },
    #[error("unknown framing vector: {vector:#010x}")]
    UnknownFramingVector { vector: u32 },
    #[error("unknown DMP vector: {vector:#04x}")]
    UnknownDmpVector { vector: u8 },
    #[error("unknown universe-discovery vector: {vector:#010x}")]
    UnknownDiscoveryVector { vector: u32 },
    #[error("discovery page {page} above last page {last_page}")]
    InvalidPage { page: u8, last_page: u8 },
    #[error("invalid DMP address/property block")]
    InvalidAddressType,
    #[error("invalid priority: {value}")]
    InvalidPriority { value: u8 },
    #[error("invalid universe number: {value}")]
    InvalidUniverse { value: u16 },
    #[error("unrecognized start code: {value:#04x}")]
    UnknownStartCode { value: u8 },
    #[error("invalid property value count: {count}")]
    InvalidPropertyValueCount { count: u16 },
    #[error("discovery universe list not sorted ascending")]
    UniverseListNotSorted,
    #[error("source name is not valid UTF-8 or exceeds 63 bytes")]
    InvalidSourceName,
}

/// Failures from the UDP socket layer, shared by the transmit and
/// receive crates. Start-time failures surface synchronously from
/// `start`/`update_interfaces`; runtime failures arrive as
/// `SocketClosed` events.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("could not bind {ctx}: {source}")]
    Bind { ctx: String, source: std::io::Error },
    #[error("could not enable port reuse: {source}")]
    ReusePort { source: std::io::Error },
    #[error("could not join multicast group {group}: {source}")]
    JoinMulticast { group: IpAddr, source: std::io::Error },
    #[error("could not leave multicast group {group}: {source}")]
    LeaveMulticast { group: IpAddr, source: std::io::Error },
    #[error("could not assign multicast interface {ctx}: {source}")]
    MulticastInterface { ctx: String, source: std::io::Error },
    #[error("could not receive on {ctx}: {source}")]
    Receive { ctx: String, source: std::io::Error },
    #[error("could not send: {source}")]
    Send { source: std::io::Error },
}
