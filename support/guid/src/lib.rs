// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Provides the [`Guid`] type, laid out the way VMBus offers carry interface
//! and instance identifiers on the wire.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// A 128-bit identifier in mixed-endian (Windows `GUID`) layout.
#[repr(C)]
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
#[expect(missing_docs)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Default for Guid {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

/// Builds a [`Guid`] constant from its string form at compile time.
///
/// ```
/// const SHUTDOWN: guid::Guid = guid::guid!("0e0b6031-5213-4934-818b-38d90ced39db");
/// assert_eq!(SHUTDOWN.data2, 0x5213);
/// ```
#[macro_export]
macro_rules! guid {
    ($s:literal) => {
        const { $crate::Guid::from_static_str($s) }
    };
}

/// An error parsing a GUID.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The input is neither 36 nor 38 characters long.
    #[error("invalid GUID length")]
    Length,
    /// Braces or dashes are missing or misplaced.
    #[error("invalid GUID format")]
    Format,
    /// A character that should be a hex digit is not one.
    #[error("invalid GUID digit")]
    Digit,
}

/// Offsets of the 16 hex byte pairs within an unbraced GUID string.
const BYTE_OFFSETS: [usize; 16] = [0, 2, 4, 6, 9, 11, 14, 16, 19, 21, 24, 26, 28, 30, 32, 34];
const DASH_OFFSETS: [usize; 4] = [8, 13, 18, 23];

const fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl Guid {
    /// The all-zero GUID.
    pub const ZERO: Self = Self {
        data1: 0,
        data2: 0,
        data3: 0,
        data4: [0; 8],
    };

    /// Returns true if this is the all-zero GUID.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Parses a GUID at compile time, panicking on malformed input.
    ///
    /// Accepts both `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` and the braced
    /// form. Use [`str::parse`] for input that is not a literal.
    pub const fn from_static_str(value: &'static str) -> Self {
        match Self::parse(value.as_bytes()) {
            Ok(guid) => guid,
            Err(ParseError::Length) => panic!("invalid GUID length"),
            Err(ParseError::Format) => panic!("invalid GUID format"),
            Err(ParseError::Digit) => panic!("invalid GUID digit"),
        }
    }

    const fn parse(value: &[u8]) -> Result<Self, ParseError> {
        let start = match value.len() {
            36 => 0,
            38 => {
                if value[0] != b'{' || value[37] != b'}' {
                    return Err(ParseError::Format);
                }
                1
            }
            _ => return Err(ParseError::Length),
        };

        let mut i = 0;
        while i < DASH_OFFSETS.len() {
            if value[start + DASH_OFFSETS[i]] != b'-' {
                return Err(ParseError::Format);
            }
            i += 1;
        }

        // Bytes in textual order: data1 (BE), data2 (BE), data3 (BE), data4.
        let mut bytes = [0u8; 16];
        let mut i = 0;
        while i < BYTE_OFFSETS.len() {
            let at = start + BYTE_OFFSETS[i];
            let (Some(hi), Some(lo)) = (hex_digit(value[at]), hex_digit(value[at + 1])) else {
                return Err(ParseError::Digit);
            };
            bytes[i] = hi << 4 | lo;
            i += 1;
        }

        Ok(Self {
            data1: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data2: u16::from_be_bytes([bytes[4], bytes[5]]),
            data3: u16::from_be_bytes([bytes[6], bytes[7]]),
            data4: [
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ],
        })
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1, self.data2, self.data3, d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7],
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Guid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}

impl TryFrom<&[u8]> for Guid {
    type Error = ParseError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<[u8; 16]> for Guid {
    fn from(value: [u8; 16]) -> Self {
        zerocopy::transmute!(value)
    }
}

impl From<Guid> for [u8; 16] {
    fn from(value: Guid) -> Self {
        zerocopy::transmute!(value)
    }
}

#[cfg(test)]
mod tests {
    use super::Guid;
    use super::ParseError;

    const SAMPLE: Guid = Guid {
        data1: 0xcf127acc,
        data2: 0xc960,
        data3: 0x41e4,
        data4: [0x9b, 0x1e, 0x51, 0x3e, 0x8a, 0x89, 0x14, 0x7d],
    };

    #[test]
    fn display_is_lowercase_dashed() {
        assert_eq!(SAMPLE.to_string(), "cf127acc-c960-41e4-9b1e-513e8a89147d");
    }

    #[test]
    fn parses_plain_braced_and_const() {
        let plain: Guid = "CF127ACC-C960-41E4-9B1E-513E8A89147D".parse().unwrap();
        let braced = Guid::try_from(&b"{cf127acc-c960-41e4-9b1e-513e8a89147d}"[..]).unwrap();
        assert_eq!(plain, SAMPLE);
        assert_eq!(braced, SAMPLE);
        assert_eq!(guid!("cf127acc-c960-41e4-9b1e-513e8a89147d"), SAMPLE);
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!("cf127acc".parse::<Guid>(), Err(ParseError::Length));
        assert_eq!(
            "cf127acc_c960-41e4-9b1e-513e8a89147d".parse::<Guid>(),
            Err(ParseError::Format)
        );
        assert_eq!(
            "[cf127acc-c960-41e4-9b1e-513e8a89147d]".parse::<Guid>(),
            Err(ParseError::Format)
        );
        assert_eq!(
            "cf127acc-c960-41e4-9b1e-513e8a89147g".parse::<Guid>(),
            Err(ParseError::Digit)
        );
    }

    #[test]
    fn byte_layout_is_mixed_endian() {
        let bytes: [u8; 16] = SAMPLE.into();
        assert_eq!(&bytes[..4], &[0xcc, 0x7a, 0x12, 0xcf]);
        assert_eq!(Guid::from(bytes), SAMPLE);
        assert!(Guid::default().is_zero());
    }
}
