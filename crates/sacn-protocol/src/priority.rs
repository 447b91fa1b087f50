use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// A validated sACN priority, 0..=200.
///
/// Carried per-packet in the data framing layer (universe priority) and
/// per-slot in the 0xDD stream. The default of 100 sits mid-range so
/// embedders can override in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

pub const PRIORITY_MAX: u8 = 200;
pub const PRIORITY_DEFAULT: u8 = 100;

impl Priority {
    pub fn new(raw: u8) -> Result<Self, ParseError> {
        if raw > PRIORITY_MAX {
            return Err(ParseError::InvalidPriority { value: raw });
        }
        Ok(Priority(raw))
    }

    /// Clamp an untrusted byte into range, falling back to the default.
    /// Used for per-slot priority arrays supplied by the embedder.
    pub fn clamped(raw: u8) -> Self {
        if raw > PRIORITY_MAX {
            Priority(PRIORITY_DEFAULT)
        } else {
            Priority(raw)
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(PRIORITY_DEFAULT)
    }
}

impl TryFrom<u8> for Priority {
    type Error = ParseError;

    fn try_from(raw: u8) -> Result<Self, ParseError> {
        Priority::new(raw)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> u8 {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_range() {
        assert!(Priority::new(0).is_ok());
        assert!(Priority::new(200).is_ok());
        assert!(Priority::new(201).is_err());
        assert_eq!(Priority::default().get(), 100);
    }

    #[test]
    fn clamps_invalid_to_default() {
        assert_eq!(Priority::clamped(255).get(), 100);
        assert_eq!(Priority::clamped(200).get(), 200);
        assert_eq!(Priority::clamped(0).get(), 0);
    }
}
