use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Universe number reserved for universe-discovery traffic. Never valid
/// as a data universe.
pub const DISCOVERY_UNIVERSE: u16 = 64214;

/// A validated sACN universe number, 1..=63999.
///
/// Each universe maps to its own multicast group on both IP families, so
/// the number doubles as the routing key for all data traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Universe(u16);

pub const UNIVERSE_MIN: u16 = 1;
pub const UNIVERSE_MAX: u16 = 63999;

impl Universe {
    pub fn new(raw: u16) -> Result<Self, ParseError> {
        if !(UNIVERSE_MIN..=UNIVERSE_MAX).contains(&raw) {
            return Err(ParseError::InvalidUniverse { value: raw });
        }
        Ok(Universe(raw))
    }

    pub fn get(self) -> u16 {
        self.0
    }

    /// Data multicast group for this universe: `239.255.<hi>.<lo>`.
    pub fn multicast_ipv4(self) -> Ipv4Addr {
        Ipv4Addr::new(239, 255, (self.0 >> 8) as u8, (self.0 & 0xff) as u8)
    }

    /// Data multicast group for this universe: `ff18::83:00:<hi>:<lo>`.
    pub fn multicast_ipv6(self) -> Ipv6Addr {
        Ipv6Addr::new(0xff18, 0, 0, 0, 0x83, 0, self.0 >> 8, self.0 & 0xff)
    }
}

impl TryFrom<u16> for Universe {
    type Error = ParseError;

    fn try_from(raw: u16) -> Result<Self, ParseError> {
        Universe::new(raw)
    }
}

impl From<Universe> for u16 {
    fn from(universe: Universe) -> u16 {
        universe.0
    }
}

impl fmt::Display for Universe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
