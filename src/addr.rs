//! IPv4 endpoint address value type.
//!
//! Provides [`AddressV4`], an immutable, copyable IPv4 address used by
//! listeners and connections, with dotted-decimal parsing and display.

use std::fmt;
use std::io;
use std::str::FromStr;

/// An immutable IPv4 address.
///
/// Stored as four octets in network order. Copyable and hashable, so it can
/// be used freely as a map key or carried by value across threads.
///
/// # Example
/// ```ignore
/// let addr: AddressV4 = "192.168.1.10".parse().unwrap();
/// assert_eq!(addr.octets(), [192, 168, 1, 10]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressV4 {
    octets: [u8; 4],
}

impl AddressV4 {
    /// Creates an address from four octets, most significant first.
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self {
            octets: [a, b, c, d],
        }
    }

    /// The wildcard address `0.0.0.0`, used to bind on all interfaces.
    pub const fn any() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// The loopback address `127.0.0.1`.
    pub const fn loopback() -> Self {
        Self::new(127, 0, 0, 1)
    }

    /// The limited broadcast address `255.255.255.255`.
    pub const fn broadcast() -> Self {
        Self::new(255, 255, 255, 255)
    }

    /// Returns the four octets, most significant first.
    pub const fn octets(&self) -> [u8; 4] {
        self.octets
    }

    /// Network-order word as stored in `sockaddr_in.sin_addr`.
    pub(crate) fn s_addr(&self) -> u32 {
        let value = (self.octets[0] as u32) << 24
            | (self.octets[1] as u32) << 16
            | (self.octets[2] as u32) << 8
            | (self.octets[3] as u32);

        value.to_be()
    }

    /// Rebuilds an address from a `sockaddr_in.sin_addr` word.
    pub(crate) fn from_s_addr(raw: u32) -> Self {
        let value = u32::from_be(raw);

        Self::new(
            (value >> 24) as u8,
            (value >> 16) as u8,
            (value >> 8) as u8,
            value as u8,
        )
    }
}

impl fmt::Display for AddressV4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.octets[0], self.octets[1], self.octets[2], self.octets[3]
        )
    }
}

impl FromStr for AddressV4 {
    type Err = io::Error;

    /// Parses a dotted-decimal IPv4 address such as `"10.0.0.1"`.
    fn from_str(s: &str) -> io::Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();

        if parts.len() != 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid IPv4 address",
            ));
        }

        let mut octets = [0u8; 4];
        for (index, part) in parts.iter().enumerate() {
            // Digits only, no sign or leading zeros; bare `u8` parsing
            // would also take "+1" and "01".
            let malformed = !part.bytes().all(|b| b.is_ascii_digit())
                || (part.len() > 1 && part.starts_with('0'));
            if malformed {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "invalid IPv4 octet",
                ));
            }

            octets[index] = part
                .parse::<u8>()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid IPv4 octet"))?;
        }

        Ok(Self { octets })
    }
}

impl From<[u8; 4]> for AddressV4 {
    fn from(octets: [u8; 4]) -> Self {
        Self { octets }
    }
}
