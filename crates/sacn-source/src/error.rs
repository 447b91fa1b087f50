use sacn_protocol::SocketError;
use thiserror::Error;

/// Validation and lifecycle errors returned synchronously by the
/// [`crate::Source`] API. None of these change engine state.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source already started")]
    AlreadyStarted,
    #[error("source is not started")]
    NotStarted,
    #[error("source is terminating; pass resume to defer the start")]
    Terminating,
    #[error("universe {0} already exists")]
    UniverseExists(u16),
    #[error("universe {0} does not exist")]
    UniverseNotFound(u16),
    #[error("universe {0} is terminating")]
    UniverseTerminating(u16),
    #[error("universe number invalid: {0}")]
    InvalidUniverse(u16),
    #[error("invalid slot number: {slot}")]
    InvalidSlot { slot: usize },
    #[error("IPv6 modes require at least one named interface")]
    Ipv6RequiresInterfaces,
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("source worker has shut down")]
    Closed,
}
