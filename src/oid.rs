//! Object identifiers.
//!
//! An OID is an opaque 8-byte value, unique within a single database. It
//! carries no ordering beyond equality at the protocol level, but the
//! reference storage engine (`crate::storage::file`) allocates them from a
//! monotonically increasing counter, so `Ord` is implemented for the
//! allocator's own bookkeeping convenience, not because the wire protocol
//! requires it.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(pub [u8; 8]);

impl Oid {
    pub const SIZE: usize = 8;

    pub const fn zero() -> Self {
        Oid([0u8; 8])
    }

    pub fn from_u64(value: u64) -> Self {
        Oid(value.to_be_bytes())
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.as_u64())
    }
}

impl From<u64> for Oid {
    fn from(value: u64) -> Self {
        Oid::from_u64(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_u64() {
        let oid = Oid::from_u64(0x00_00_00_00_00_00_00_2a);
        assert_eq!(oid.as_u64(), 42);
        assert_eq!(oid.as_bytes(), &[0, 0, 0, 0, 0, 0, 0, 42]);
    }

    #[test]
    fn display_is_fixed_width_hex() {
        let oid = Oid::from_u64(1);
        assert_eq!(oid.to_string(), "0000000000000001");
    }
}
