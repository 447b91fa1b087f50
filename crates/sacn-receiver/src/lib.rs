//! sACN (ANSI E1.31-2018) receiving side.
//!
//! Three surfaces, lowest to highest:
//!
//! - [`RawReceiver`] — one universe, per-source packet streams after
//!   sequence filtering, identity binding and loss detection.
//! - [`Receiver`] / [`ReceiverGroup`] — raw streams merged per slot
//!   (highest priority wins, highest level among ties) into one levels
//!   buffer plus winner identities.
//! - [`DiscoveryReceiver`] — which sources are out there and which
//!   universes each transmits.

mod discovery;
mod error;
mod events;
mod merged;
mod raw;
mod socket;

pub use discovery::{DiscoveryReceiver, DiscoveryReceiverConfig};
pub use error::ReceiverError;
pub use events::{DiscoveryEvent, RawReceiverEvent, ReceiverEvent, SourceData};
pub use merged::{Receiver, ReceiverGroup, ReceiverGroupConfig};
pub use raw::{RawReceiver, ReceiverConfig, DEFAULT_SOURCE_LIMIT};

pub use sacn_protocol::{Interface, IpFamily, IpMode, Priority, SourceName};
