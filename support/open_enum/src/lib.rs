// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![no_std]

//! Provides the [`open_enum`] macro, used for wire-format constants whose set
//! of values the other side of the protocol may extend.

/// Defines a transparent newtype over an integer with associated constants
/// for the known values.
///
/// Unlike a Rust `enum`, any bit pattern is a valid value, so the type can be
/// read directly out of a hypervisor page or a ring buffer. Unknown values
/// round-trip unchanged and print as their raw number.
///
/// The generated type implements `Copy`, `Clone`, `Eq`, `PartialEq`, `Hash`,
/// `Ord`, `PartialOrd`, `Debug`, and conversions to and from the storage
/// type. Attributes written as `#![...]` inside the body apply to the impl
/// block holding the constants.
///
/// # Examples
///
/// ```
/// use open_enum::open_enum;
///
/// open_enum! {
///     pub enum PacketKind: u16 {
///         #![allow(missing_docs)]
///         DATA = 6,
///         COMPLETION = 11,
///     }
/// }
///
/// let kind = PacketKind::from(11);
/// assert_eq!(kind, PacketKind::COMPLETION);
/// assert_eq!(kind.name(), Some("COMPLETION"));
/// assert_eq!(format!("{:?}", PacketKind(3)), "3");
/// assert_eq!(u16::from(PacketKind::DATA), 6);
/// ```
#[macro_export]
macro_rules! open_enum {
    (
        $(#[$a:meta])*
        $v:vis enum $name:ident : $storage:ty {
            $(#![$implattr:meta])*
            $(
                $(#[$vattr:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        $(#[$a])*
        #[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
        #[repr(transparent)]
        $v struct $name(pub $storage);

        $(#[$implattr])*
        impl $name {
            $(
                $(#[$vattr])*
                pub const $variant: $name = $name($value);
            )*
        }

        impl $name {
            /// Returns the name of the constant matching this value, if any.
            #[allow(dead_code, unreachable_patterns)]
            pub const fn name(&self) -> ::core::option::Option<&'static str> {
                $(
                    if self.0 == $name::$variant.0 {
                        return ::core::option::Option::Some(stringify!($variant));
                    }
                )*
                ::core::option::Option::None
            }
        }

        impl ::core::convert::From<$storage> for $name {
            fn from(value: $storage) -> Self {
                Self(value)
            }
        }

        impl ::core::convert::From<$name> for $storage {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, fmt: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                match self.name() {
                    ::core::option::Option::Some(name) => fmt.pad(name),
                    ::core::option::Option::None => ::core::fmt::Debug::fmt(&self.0, fmt),
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::format;

    open_enum! {
        enum Sample: u8 {
            FIRST = 1,
            SECOND = 2,
        }
    }

    #[test]
    fn known_values_print_by_name() {
        assert_eq!(format!("{:?}", Sample::SECOND), "SECOND");
        assert_eq!(Sample(1).name(), Some("FIRST"));
    }

    #[test]
    fn unknown_values_survive() {
        let raw = Sample::from(0x7f);
        assert_eq!(raw.name(), None);
        assert_eq!(format!("{:?}", raw), "127");
        assert_eq!(u8::from(raw), 0x7f);
    }
}
