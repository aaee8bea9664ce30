use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Meshtastic node identity in its user-facing form, `!` plus eight hex
/// digits of the 32-bit node number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(num: u32) -> Self {
        Self(num)
    }

    pub const fn num(self) -> u32 {
        self.0
    }
}

impl FromStr for NodeId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidId(s.to_string());
        let hex = s.strip_prefix('!').ok_or_else(invalid)?;
        if hex.len() != 8 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        u32::from_str_radix(hex, 16).map(Self).map_err(|_| invalid())
    }
}

impl TryFrom<String> for NodeId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}
