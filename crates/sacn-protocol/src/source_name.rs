use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Wire size of the source-name field: 63 UTF-8 bytes plus a NUL.
pub const SOURCE_NAME_LEN: usize = 64;

/// A source's human-readable name as it appears on the wire.
///
/// At most 63 bytes of UTF-8; packing pads with NUL to 64 bytes. Longer
/// input is cut on a character boundary rather than rejected, since names
/// are advisory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceName(String);

impl SourceName {
    /// Build a name, truncating to the longest prefix that fits 63 bytes
    /// without splitting a UTF-8 character.
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(SOURCE_NAME_LEN - 1);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        SourceName(name[..end].to_owned())
    }

    /// Decode the 64-byte wire field: UTF-8 up to the first NUL.
    pub fn parse(field: &[u8]) -> Result<Self, ParseError> {
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        let name = std::str::from_utf8(&field[..end]).map_err(|_| ParseError::InvalidSourceName)?;
        if name.len() > SOURCE_NAME_LEN - 1 {
            return Err(ParseError::InvalidSourceName);
        }
        Ok(SourceName(name.to_owned()))
    }

    /// Write the NUL-padded 64-byte field.
    pub fn pack_into(&self, field: &mut [u8]) {
        field[..SOURCE_NAME_LEN].fill(0);
        field[..self.0.len()].copy_from_slice(self.0.as_bytes());
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SourceName {
    fn default() -> Self {
        SourceName(String::new())
    }
}

impl Deref for SourceName {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SourceName {
    fn from(name: &str) -> Self {
        SourceName::new(name)
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
