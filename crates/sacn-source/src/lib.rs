//! sACN (ANSI E1.31-2018) transmit engine.
//!
//! One [`Source`] owns any number of universes and keeps each on the
//! mandated 44 Hz cadence: keep-alive levels packets four times per
//! cycle, a three-send window after every mutation, per-address
//! priority on the 0xDD stream, paged universe discovery every ten
//! seconds, and a three-packet terminated burst when a universe (or
//! the whole source) shuts down.

mod error;
mod events;
mod socket;
mod source;
mod universe_state;

pub use error::SourceError;
pub use events::SourceEvent;
pub use source::{Source, SourceConfig, UniverseData};

pub use sacn_protocol::{Interface, IpMode, Priority, SourceName};
