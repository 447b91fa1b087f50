use sacn_protocol::SocketError;

/// Notifications pushed to the embedder's event channel.
#[derive(Debug)]
pub enum SourceEvent {
    /// The engine is up and transmitting (or ready to, if it has no
    /// universes yet).
    TransmissionStarted,
    /// Every universe finished its terminated-packet burst and the
    /// sockets are closed.
    TransmissionEnded,
    /// A socket failed at runtime and was dropped from the active set.
    SocketClosed {
        interface: String,
        error: SocketError,
    },
}
