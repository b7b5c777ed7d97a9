// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! IC protocol definitions.
//!
//! Every IC message starts with a [`PipeHeader`] followed by a [`Header`].
//! The message specific content follows the headers.

#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use open_enum::open_enum;
use static_assertions::const_assert_eq;
use std::fmt::Display;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Maximum message size between guest and host for IC devices.
pub const MAX_MESSAGE_SIZE: usize = 13312;

/// Status reported in [`Header::status`] for a failed request.
pub const STATUS_FAIL: u32 = 0x80004005;

/// Size of the pipe and IC headers that start every message.
pub const HEADER_SIZE: usize = size_of::<PipeHeader>() + size_of::<Header>();

const_assert_eq!(HEADER_SIZE, 28);

/// Protocol version.
#[repr(C)]
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    IntoBytes,
    Immutable,
    KnownLayout,
    FromBytes,
)]
pub struct Version {
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
}

impl Version {
    /// Create a new IC version instance.
    pub const fn new(major: u16, minor: u16) -> Self {
        Version { major, minor }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

open_enum! {
    /// Type of message
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum MessageType: u16 {
        /// Initial version negotiation between host and guest.
        VERSION_NEGOTIATION = 0,
        /// Heartbeat / check if alive.
        HEARTBEAT = 1,
        /// KVP exchange.
        KVP_EXCHANGE = 2,
        /// Request shutdown.
        SHUTDOWN = 3,
        /// Synchronize time.
        TIME_SYNC = 4,
        /// VSS
        VSS = 5,
        /// RDV
        RDV = 6,
        /// Guest interface.
        GUEST_INTERFACE = 7,
        /// VM Session.
        VM_SESSION = 8,
    }
}

/// Header of the pipe the IC messages travel in.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PipeHeader {
    /// Pipe flags.
    pub flags: u32,
    /// Number of pipe messages.
    pub msgs: u32,
}

/// Common message header for IC messages.
#[repr(C)]
#[derive(Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, Debug)]
pub struct Header {
    /// Version of the IC framework.
    pub framework_version: Version,
    /// Type of message.
    pub message_type: MessageType,
    /// Version of message content.
    pub message_version: Version,
    /// Size in bytes of the message following the headers.
    pub message_size: u16,
    /// Status code used for message response.
    pub status: u32,
    /// Transaction ID; should be matched by response message.
    pub transaction_id: u8,
    /// Message flags.
    pub flags: HeaderFlags,
    /// Reserved -- should be zero.
    pub reserved: [u8; 2],
}

/// Flags for IC messages.
#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HeaderFlags {
    /// Message expects a response.
    pub transaction: bool,
    /// Message is a request.
    pub request: bool,
    /// Message is a response.
    pub response: bool,
    /// Reserved - must be zero.
    #[bits(5)]
    _reserved: u8,
}

/// Version negotiation message.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct NegotiateMessage {
    /// The number of supported framework versions, located directly after
    /// this structure.
    pub framework_version_count: u16,
    /// The number of supported message versions, located after the framework
    /// versions.
    pub message_version_count: u16,
    /// Reserved -- must be zero.
    pub reserved: u32,
}

/// Offset of the version array in a negotiate message.
pub const NEGOTIATE_VERSIONS_OFFSET: usize = HEADER_SIZE + size_of::<NegotiateMessage>();

/// The vmbus interface IDs of the ICs.
pub mod interface {
    use guid::Guid;

    /// Heartbeat IC.
    pub const HEARTBEAT: Guid = guid::guid!("57164f39-9115-4e78-ab55-382f3bd5422d");
    /// Shutdown IC.
    pub const SHUTDOWN: Guid = guid::guid!("0e0b6031-5213-4934-818b-38d90ced39db");
    /// Time synchronization IC.
    pub const TIME_SYNC: Guid = guid::guid!("9527e630-d0ae-497b-adce-e80ab0175caf");
    /// Key/value pair exchange IC.
    pub const KVP_EXCHANGE: Guid = guid::guid!("a9a0f4e7-5a45-4d96-b827-8a841e8c03e6");
    /// Volume shadow copy IC.
    pub const VSS: Guid = guid::guid!("35fa2e29-ea23-4236-96ae-3a6ebacba440");
}

/// Heartbeat component protocol.
pub mod heartbeat {
    use crate::Version;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    /// Supported framework versions.
    pub const FRAMEWORK_VERSIONS: &[Version] = &[Version::new(1, 0), Version::new(3, 0)];

    /// Supported message versions.
    pub const HEARTBEAT_VERSIONS: &[Version] = &[Version::new(1, 0), Version::new(3, 0)];

    /// Heartbeat message following the headers.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct HeartbeatMessage {
        /// Incrementing sequence counter.
        pub sequence_number: u64,
        /// Reserved.
        pub reserved: [u32; 8],
    }

    /// Offset of the sequence number in a heartbeat message.
    pub const SEQUENCE_OFFSET: usize = crate::HEADER_SIZE;
}
