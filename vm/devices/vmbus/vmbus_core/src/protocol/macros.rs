// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Defines an open enum, which contains constants for each vmbus message type.
macro_rules! vmbus_message_type {
    (pub enum $enum_name:ident, $open_enum_name:ident { $( $num:literal $name:ident $rest:tt, )* }) => {
        open_enum! {
            /// The message type value that identifies a vmbus control message.
            #[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
            pub enum $open_enum_name: u32 {
                $($name = $num,)*
            }
        }
    }
}

/// Defines an enum with a variant per message type, and a parse method that
/// converts a received message into one of those variants.
macro_rules! vmbus_message_enum {
    (pub enum $enum_name:ident, $open_enum_name:ident { $( $num:literal $name:ident { $type:ident $min_version:tt } ,)* }) => {
        /// A parsed vmbus control message, with any bytes following the
        /// fixed part of the message.
        #[derive(Debug)]
        pub enum $enum_name<'a> {
            $($type($type, &'a [u8]),)*
        }

        impl<'a> $enum_name<'a> {
            /// Parses a vmbus message received from the synic, only accepting
            /// messages that are valid for the negotiated version.
            ///
            /// Use `None` for the version to only parse messages that are
            /// accepted before a version has been negotiated.
            pub fn parse(data: &'a [u8], version: Option<Version>) -> Result<Self, ParseError> {
                let (header, data) = MessageHeader::read_from_prefix(data)
                    .map_err(|_| ParseError::MessageTooSmall(None))?;

                let message = match header.message_type {
                    $(
                        $open_enum_name::$name
                            if version >= vmbus_message_enum!(@to_version $min_version) =>
                        {
                            let (message, remaining) = $type::read_from_prefix(data)
                                .map_err(|_| ParseError::MessageTooSmall(Some(header.message_type)))?;

                            Self::$type(message, remaining)
                        }
                    )*
                    _ => return Err(ParseError::InvalidMessageType(header.message_type)),
                };

                Ok(message)
            }

            /// The type of the parsed message.
            pub fn message_type(&self) -> $open_enum_name {
                match self {
                    $(Self::$type(..) => $open_enum_name::$name,)*
                }
            }
        }
    };

    (@to_version 0) => { None };
    (@to_version $version:ident) => { Some(Version::$version) };
}

/// Implements `VmbusMessage` for each message struct, and asserts at compile
/// time that the message fits in the hypervisor message payload.
macro_rules! vmbus_message_trait_impl {
    (pub enum $enum_name:ident, $open_enum_name:ident { $( $num:literal $name:ident { $type:ident $min_version:tt } ,)* }) => {
        $(
            impl VmbusMessage for $type {
                const MESSAGE_TYPE: $open_enum_name = $open_enum_name::$name;
            }

            static_assertions::const_assert!($type::MESSAGE_SIZE <= MAX_MESSAGE_SIZE);
        )*
    }
}

/// Defines the message type open enum, the parsed message enum, and the
/// `VmbusMessage` implementations. See the invocation in protocol.rs.
macro_rules! vmbus_messages {
    ($($contents:tt)*) => {
        vmbus_message_type!($($contents)*);
        vmbus_message_enum!($($contents)*);
        vmbus_message_trait_impl!($($contents)*);
    }
}
