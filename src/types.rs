//! Common types used across the introspection engine
//!
//! This module defines shared types to avoid circular dependencies.
//! Kernel addresses are opaque here; nothing in this module reads memory.

use core::fmt;
use core::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

// ============================================================================
// Kernel Address
// ============================================================================

/// Kernel virtual address
///
/// A `KAddr` of zero is the distinguished NULL value and always means
/// "not present", never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct KAddr(pub u64);

impl KAddr {
    pub const NULL: Self = Self(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `offset` bytes past this one (wraps like the target would)
    pub const fn offset(self, offset: u64) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Whether the address lies in the arm64 kernel half (top 16 bits set)
    pub const fn is_kernel_pointer(self) -> bool {
        self.0 >> 48 == 0xffff
    }

    /// `None` for NULL, the address otherwise
    pub fn non_null(self) -> Option<Self> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Display for KAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::LowerHex for KAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<u64> for KAddr {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Error returned when an address string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid address literal: {0:?}")]
pub struct ParseAddrError(pub String);

impl FromStr for KAddr {
    type Err = ParseAddrError;

    /// Accepts `0x`-prefixed hex or plain decimal
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
            None => trimmed.replace('_', "").parse::<u64>(),
        };
        parsed.map(KAddr).map_err(|_| ParseAddrError(s.to_string()))
    }
}

// Kernel addresses exceed i64::MAX, which TOML integers cannot hold, so they
// travel as hex strings. Plain integers are still accepted on input.
impl Serialize for KAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#x}", self.0))
    }
}

impl<'de> Deserialize<'de> for KAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KAddrVisitor;

        impl Visitor<'_> for KAddrVisitor {
            type Value = KAddr;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a kernel address as a hex string or an integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<KAddr, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<KAddr, E> {
                Ok(KAddr(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<KAddr, E> {
                u64::try_from(v)
                    .map(KAddr)
                    .map_err(|_| E::custom("negative kernel address"))
            }
        }

        deserializer.deserialize_any(KAddrVisitor)
    }
}

// ============================================================================
// Field - one decoded value that may have failed to read
// ============================================================================

/// A single decoded field
///
/// Reads against a live target can fail per field. A failed read degrades
/// only that field to `Unreadable`, carrying the address that was tried;
/// sibling fields of the same record are still decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field<T> {
    Known(T),
    Unreadable(KAddr),
}

impl<T> Field<T> {
    pub fn known(self) -> Option<T> {
        match self {
            Field::Known(v) => Some(v),
            Field::Unreadable(_) => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Field::Known(_))
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Field<U> {
        match self {
            Field::Known(v) => Field::Known(f(v)),
            Field::Unreadable(a) => Field::Unreadable(a),
        }
    }

    pub fn unwrap_or(self, default: T) -> T {
        self.known().unwrap_or(default)
    }

    /// The value, or an error naming the field when an operation cannot
    /// continue without it
    pub fn require(self, what: &'static str) -> crate::error::Result<T> {
        match self {
            Field::Known(v) => Ok(v),
            Field::Unreadable(address) => {
                Err(crate::error::IntrospectError::UnreadableField { what, address })
            }
        }
    }
}

impl Field<KAddr> {
    /// The pointer value if it was read and is not NULL
    pub fn non_null(self) -> Option<KAddr> {
        self.known().and_then(KAddr::non_null)
    }
}

impl<T: fmt::Display> fmt::Display for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Known(v) => v.fmt(f),
            Field::Unreadable(a) => write!(f, "<unreadable @ {}>", a),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kaddr_parse() {
        assert_eq!(
            "0xfffffff00760f9c0".parse::<KAddr>().unwrap(),
            KAddr(0xffff_fff0_0760_f9c0)
        );
        assert_eq!("4096".parse::<KAddr>().unwrap(), KAddr(4096));
        assert!("0xzz".parse::<KAddr>().is_err());
        assert!("".parse::<KAddr>().is_err());
    }

    #[test]
    fn test_kaddr_display_is_padded() {
        assert_eq!(KAddr::NULL.to_string(), "0x0000000000000000");
        assert_eq!(KAddr(0x1234).to_string(), "0x0000000000001234");
    }

    #[test]
    fn test_kernel_pointer_range() {
        assert!(KAddr(0xffff_fff0_0760_f9c0).is_kernel_pointer());
        assert!(!KAddr(0x1_0000_0000).is_kernel_pointer());
        assert!(!KAddr::NULL.is_kernel_pointer());
    }

    #[test]
    fn test_field_non_null() {
        assert_eq!(Field::Known(KAddr(8)).non_null(), Some(KAddr(8)));
        assert_eq!(Field::Known(KAddr::NULL).non_null(), None);
        assert_eq!(Field::<KAddr>::Unreadable(KAddr(8)).non_null(), None);
    }

    #[test]
    fn test_field_display() {
        assert_eq!(Field::Known(7u32).to_string(), "7");
        assert_eq!(
            Field::<u32>::Unreadable(KAddr(0x10)).to_string(),
            "<unreadable @ 0x0000000000000010>"
        );
    }
}
