use sacn_protocol::SocketError;
use thiserror::Error;

/// Validation and lifecycle errors returned synchronously by the
/// receiver APIs.
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("receiver already started")]
    AlreadyStarted,
    #[error("receiver is not started")]
    NotStarted,
    #[error("universe {0} already exists in this group")]
    UniverseExists(u16),
    #[error("universe {0} does not exist in this group")]
    UniverseNotFound(u16),
    #[error("universe number invalid: {0}")]
    InvalidUniverse(u16),
    #[error("IPv6 modes require at least one named interface")]
    Ipv6RequiresInterfaces,
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("receiver worker has shut down")]
    Closed,
}
