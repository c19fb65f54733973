//! Bus-scoped device addressing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of a device on a bus.
///
/// The transport encodes bus number, slot and sub-address into this value;
/// everything above the transport treats it as opaque. Within one bus an
/// address uniquely identifies a device.
///
/// The canonical text form is lowercase hex with a `0x` prefix, zero-padded
/// to four digits (`0x0048`), matching what the control API and status JSON
/// emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Addr(pub u32);

impl Addr {
    /// Parse an address from a string as emitted by [`Addr::to_string`] or
    /// typed by a user: `0x48`, `48` (hex with or without prefix) or a plain
    /// decimal number.
    ///
    /// Mirrors `strtoul(s, 0)` semantics so CSV address lists accept the
    /// same forms the firmware tooling always has.
    pub fn parse(s: &str) -> Option<Addr> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return u32::from_str_radix(hex, 16).ok().map(Addr);
        }
        s.parse::<u32>().ok().map(Addr)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl From<u32> for Addr {
    fn from(v: u32) -> Self {
        Addr(v)
    }
}

/// Unique identifier of a device across buses (`<bus>_<addr>`).
pub fn unique_device_id(bus_name: &str, addr: Addr) -> String {
    format!("{}_{}", bus_name, addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_hex_and_decimal() {
        assert_eq!(Addr::parse("0x48"), Some(Addr(0x48)));
        assert_eq!(Addr::parse("0X48"), Some(Addr(0x48)));
        assert_eq!(Addr::parse("72"), Some(Addr(72)));
        assert_eq!(Addr::parse(" 0x1d "), Some(Addr(0x1d)));
        assert_eq!(Addr::parse(""), None);
        assert_eq!(Addr::parse("zz"), None);
    }

    #[test]
    fn test_display_zero_padded_hex() {
        assert_eq!(Addr(0x48).to_string(), "0x0048");
        assert_eq!(Addr(0x1234).to_string(), "0x1234");
    }

    #[test]
    fn test_unique_id_includes_bus() {
        assert_eq!(unique_device_id("I2CA", Addr(0x48)), "I2CA_0x0048");
    }
}
