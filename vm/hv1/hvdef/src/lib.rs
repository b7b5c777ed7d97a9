// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Microsoft hypervisor definitions used by an enlightened guest: CPUID
//! leaves, synthetic MSRs, SynIC message and event layouts, and the
//! hypercalls needed to talk to VMBus.

#![no_std]

use bitfield_struct::bitfield;
use core::fmt::Debug;
use core::mem::size_of;
use open_enum::open_enum;
use static_assertions::const_assert;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const HV_PAGE_SIZE: u64 = 4096;

pub const HV_CPUID_FUNCTION_VERSION_AND_FEATURES: u32 = 0x00000001;
pub const HV_CPUID_FUNCTION_HV_VENDOR_AND_MAX_FUNCTION: u32 = 0x40000000;
pub const HV_CPUID_FUNCTION_HV_INTERFACE: u32 = 0x40000001;
pub const HV_CPUID_FUNCTION_MS_HV_VERSION: u32 = 0x40000002;
pub const HV_CPUID_FUNCTION_MS_HV_FEATURES: u32 = 0x40000003;
pub const HV_CPUID_FUNCTION_MS_HV_IMPLEMENTATION_LIMITS: u32 = 0x40000005;
pub const HV_CPUID_FUNCTION_MS_HV_HARDWARE_FEATURES: u32 = 0x40000006;

/// ECX bit of leaf 1 set by every hypervisor.
pub const CPUID_1_ECX_HYPERVISOR_PRESENT: u32 = 1 << 31;

/// "Hv#1" in EAX of [`HV_CPUID_FUNCTION_HV_INTERFACE`].
pub const HV_INTERFACE_SIGNATURE_HV1: u32 = 0x31237648;

/// The lowest maximum leaf a Microsoft-compatible hypervisor reports.
pub const HV_CPUID_MINIMUM_MAX_FUNCTION: u32 = HV_CPUID_FUNCTION_MS_HV_IMPLEMENTATION_LIMITS;

/// The partition privilege mask reported in EAX:EBX of
/// [`HV_CPUID_FUNCTION_MS_HV_FEATURES`].
#[bitfield(u64)]
pub struct HvPartitionPrivilege {
    pub access_vp_runtime_msr: bool,
    pub access_partition_reference_counter: bool,
    pub access_synic_msrs: bool,
    pub access_synthetic_timer_msrs: bool,
    pub access_apic_msrs: bool,
    pub access_hypercall_msrs: bool,
    pub access_vp_index: bool,
    pub access_reset_msr: bool,
    pub access_stats_msr: bool,
    pub access_partition_reference_tsc: bool,
    pub access_guest_idle_msr: bool,
    pub access_frequency_msrs: bool,
    pub access_debug_msrs: bool,
    #[bits(19)]
    _reserved0: u32,

    pub create_partitions: bool,
    pub access_partition_id: bool,
    pub access_memory_pool: bool,
    pub adjust_message_buffers: bool,
    pub post_messages: bool,
    pub signal_events: bool,
    #[bits(26)]
    _reserved1: u32,
}

/// The hypervisor version reported by [`HV_CPUID_FUNCTION_MS_HV_VERSION`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HvVersion {
    pub build: u32,
    pub major: u16,
    pub minor: u16,
    pub service_pack: u32,
    pub service_branch: u8,
    pub service_number: u32,
}

impl HvVersion {
    /// Decodes the four registers of the version leaf.
    pub fn from_cpuid(eax: u32, ebx: u32, ecx: u32, edx: u32) -> Self {
        Self {
            build: eax,
            major: (ebx >> 16) as u16,
            minor: ebx as u16,
            service_pack: ecx,
            service_branch: (edx >> 24) as u8,
            service_number: edx & 0xffffff,
        }
    }
}

/// The guest OS identity written to [`HV_X64_MSR_GUEST_OS_ID`] before
/// hypercalls are enabled, in the open-source vendor format.
#[bitfield(u64)]
pub struct GuestOsId {
    pub build_number: u16,
    pub service_version: u8,
    pub minor_version: u8,
    pub major_version: u8,
    _reserved: u8,
    pub os_id: u8,
    #[bits(7)]
    pub os_type: u8,
    pub open_source: bool,
}

open_enum! {
    /// OS type values for [`GuestOsId::os_type`].
    pub enum GuestOsType: u8 {
        LINUX = 1,
        FREEBSD = 2,
        XEN = 3,
        ILLUMOS = 4,
        DARWIN = 5,
    }
}

open_enum! {
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum HypercallCode: u16 {
        #![allow(non_upper_case_globals)]

        HvCallPostMessage = 0x005C,
        HvCallSignalEvent = 0x005D,
    }
}

pub const HV_X64_MSR_GUEST_OS_ID: u32 = 0x40000000;
pub const HV_X64_MSR_HYPERCALL: u32 = 0x40000001;
pub const HV_X64_MSR_VP_INDEX: u32 = 0x40000002;
pub const HV_X64_MSR_SCONTROL: u32 = 0x40000080;
pub const HV_X64_MSR_SIEFP: u32 = 0x40000082;
pub const HV_X64_MSR_SIMP: u32 = 0x40000083;
pub const HV_X64_MSR_EOM: u32 = 0x40000084;
pub const HV_X64_MSR_SINT0: u32 = 0x40000090;

/// Returns the SINTx MSR for `sint`.
pub const fn hv_x64_msr_sint(sint: u8) -> u32 {
    HV_X64_MSR_SINT0 + (sint as u32 & 0xf)
}

/// A hypervisor status code.
///
/// The non-success status codes are defined in [`HvError`].
#[derive(Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
#[repr(transparent)]
pub struct HvStatus(pub u16);

impl HvStatus {
    /// The success status code.
    pub const SUCCESS: Self = Self(0);

    /// Converts the status into a `Result`, mapping every non-zero code to
    /// its [`HvError`].
    pub fn result(self) -> HvResult<()> {
        match core::num::NonZeroU16::new(self.0) {
            Some(code) => Err(HvError(code)),
            None => Ok(()),
        }
    }

    const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    const fn into_bits(self) -> u16 {
        self.0
    }
}

impl From<HvResult<()>> for HvStatus {
    fn from(result: HvResult<()>) -> Self {
        match result {
            Ok(()) => Self::SUCCESS,
            Err(err) => Self(err.0.get()),
        }
    }
}

impl Debug for HvStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.result() {
            Ok(()) => f.write_str("Success"),
            Err(err) => Debug::fmt(&err, f),
        }
    }
}

/// A non-success [`HvStatus`].
#[derive(Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout)]
#[repr(transparent)]
pub struct HvError(core::num::NonZeroU16);

pub type HvResult<T> = Result<T, HvError>;

impl HvError {
    /// Returns the raw status code.
    pub fn code(&self) -> u16 {
        self.0.get()
    }

    /// Returns true for the codes the hypervisor uses to report temporary
    /// message buffer exhaustion, which callers may retry.
    pub fn is_transient(&self) -> bool {
        matches!(*self, Self::InsufficientMemory | Self::InsufficientBuffers)
    }
}

impl From<core::num::NonZeroU16> for HvError {
    fn from(err: core::num::NonZeroU16) -> Self {
        Self(err)
    }
}

impl Debug for HvError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.debug_name() {
            Some(name) => f.pad(name),
            None => Debug::fmt(&self.0.get(), f),
        }
    }
}

impl core::fmt::Display for HvError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.doc_str() {
            Some(s) => f.write_str(s),
            None => write!(f, "hypervisor error {:#06x}", self.0),
        }
    }
}

impl core::error::Error for HvError {}

macro_rules! hv_error {
    ($ty:ty, $(#[doc = $doc:expr] $ident:ident = $val:expr),* $(,)?) => {
        #[allow(non_upper_case_globals)]
        impl $ty {
            $(
                #[doc = $doc]
                pub const $ident: Self = Self(core::num::NonZeroU16::new($val).unwrap());
            )*

            fn debug_name(&self) -> Option<&'static str> {
                Some(match self.0.get() {
                    $($val => stringify!($ident),)*
                    _ => return None,
                })
            }

            fn doc_str(&self) -> Option<&'static str> {
                Some(match self.0.get() {
                    $($val => $doc.trim_ascii(),)*
                    _ => return None,
                })
            }
        }
    };
}

// The doc comments double as the Display strings.
hv_error! {
    HvError,
    /// Invalid hypercall code
    InvalidHypercallCode = 0x0002,
    /// Invalid hypercall input
    InvalidHypercallInput = 0x0003,
    /// Invalid alignment
    InvalidAlignment = 0x0004,
    /// Invalid parameter
    InvalidParameter = 0x0005,
    /// Access denied
    AccessDenied = 0x0006,
    /// Insufficient memory
    InsufficientMemory = 0x000B,
    /// Invalid connection ID
    InvalidConnectionId = 0x0012,
    /// Insufficient buffers
    InsufficientBuffers = 0x0013,
}

open_enum! {
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum HvMessageType: u32 {
        #![allow(non_upper_case_globals)]

        HvMessageTypeNone = 0x00000000,
        /// VMBus control-plane message posted by the host partition.
        HvMessageTypeChannel = 0x00000001,
        HvMessageTypeTimerExpired = 0x80000010,
    }
}

impl Default for HvMessageType {
    fn default() -> Self {
        HvMessageType::HvMessageTypeNone
    }
}

pub const NUM_SINTS: usize = 16;

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvMessageHeader {
    pub typ: HvMessageType,
    pub len: u8,
    pub flags: HvMessageFlags,
    pub rsvd: u16,
    pub id: u64,
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvMessageFlags {
    pub message_pending: bool,
    #[bits(7)]
    _reserved: u8,
}

pub const HV_MESSAGE_SIZE: usize = size_of::<HvMessage>();
const_assert!(HV_MESSAGE_SIZE == 256);
pub const HV_MESSAGE_PAYLOAD_SIZE: usize = 240;

/// One synthetic message slot. A SIMP page holds [`NUM_SINTS`] of these.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HvMessage {
    pub header: HvMessageHeader,
    pub payload_buffer: [u8; HV_MESSAGE_PAYLOAD_SIZE],
}

impl Default for HvMessage {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl HvMessage {
    /// Constructs a message, truncating `payload` to the 240-byte limit.
    pub fn new(typ: HvMessageType, id: u64, payload: &[u8]) -> Self {
        let len = payload.len().min(HV_MESSAGE_PAYLOAD_SIZE);
        let mut msg = Self::new_zeroed();
        msg.header.typ = typ;
        msg.header.len = len as u8;
        msg.header.id = id;
        msg.payload_buffer[..len].copy_from_slice(&payload[..len]);
        msg
    }

    /// The valid portion of the payload, clamped to the buffer size.
    pub fn payload(&self) -> &[u8] {
        let len = (self.header.len as usize).min(HV_MESSAGE_PAYLOAD_SIZE);
        &self.payload_buffer[..len]
    }
}

/// Bytes of event flags per SINT in a SIEFP page.
pub const HV_EVENT_FLAGS_BYTE_COUNT: usize = 256;
/// Event flag bits per SINT.
pub const HV_EVENT_FLAGS_COUNT: usize = HV_EVENT_FLAGS_BYTE_COUNT * 8;
const_assert!(HV_EVENT_FLAGS_BYTE_COUNT * NUM_SINTS == HV_PAGE_SIZE as usize);

pub mod hypercall {
    use super::*;

    /// The hypercall input value.
    #[bitfield(u64)]
    pub struct Control {
        /// The hypercall code.
        pub code: u16,
        /// If this hypercall is a fast hypercall.
        pub fast: bool,
        /// The variable header size, in qwords.
        #[bits(10)]
        pub variable_header_size: usize,
        #[bits(4)]
        _rsvd0: u8,
        /// Route the call to the L0 hypervisor in a nested environment.
        pub nested: bool,
        /// The element count for rep hypercalls.
        #[bits(12)]
        pub rep_count: usize,
        #[bits(4)]
        _rsvd1: u8,
        /// The first element to process in a rep hypercall.
        #[bits(12)]
        pub rep_start: usize,
        #[bits(4)]
        _rsvd2: u8,
    }

    /// The hypercall result returned in RAX.
    #[bitfield(u64)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    #[must_use]
    pub struct HypercallOutput {
        #[bits(16)]
        pub call_status: HvStatus,
        pub rsvd: u16,
        #[bits(12)]
        pub elements_processed: usize,
        #[bits(20)]
        pub rsvd2: u32,
    }

    impl From<HvError> for HypercallOutput {
        fn from(e: HvError) -> Self {
            Self::new().with_call_status(Err(e).into())
        }
    }

    impl HypercallOutput {
        pub const SUCCESS: Self = Self::new();

        pub fn result(&self) -> HvResult<()> {
            self.call_status().result()
        }
    }

    #[bitfield(u64)]
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct MsrHypercallContents {
        pub enable: bool,
        pub locked: bool,
        #[bits(10)]
        pub reserved_p: u64,
        #[bits(52)]
        pub gpn: u64,
    }

    /// Input page for [`HypercallCode::HvCallPostMessage`].
    #[repr(C, align(8))]
    #[derive(Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct PostMessage {
        pub connection_id: u32,
        pub padding: u32,
        pub message_type: u32,
        pub payload_size: u32,
        pub payload: [u8; HV_MESSAGE_PAYLOAD_SIZE],
    }

    const_assert!(size_of::<PostMessage>() == 256);

    /// Fast input for [`HypercallCode::HvCallSignalEvent`], passed in the
    /// first input register.
    #[repr(C, align(8))]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct SignalEvent {
        pub connection_id: u32,
        pub flag_number: u16,
        pub rsvd: u16,
    }

    impl SignalEvent {
        /// Packs the input into the register value the fast call expects.
        pub fn as_u64(&self) -> u64 {
            zerocopy::transmute!(*self)
        }
    }
}

#[bitfield(u64)]
pub struct HvSynicSint {
    pub vector: u8,
    _reserved0: u8,
    pub masked: bool,
    pub auto_eoi: bool,
    pub polling: bool,
    _reserved1: bool,
    pub proxy: bool,
    #[bits(43)]
    _reserved2: u64,
}

#[bitfield(u64)]
pub struct HvSynicScontrol {
    pub enabled: bool,
    #[bits(63)]
    _reserved: u64,
}

#[bitfield(u64)]
pub struct HvSynicSimpSiefp {
    pub enabled: bool,
    #[bits(11)]
    _reserved: u64,
    #[bits(52)]
    pub base_gpn: u64,
}
