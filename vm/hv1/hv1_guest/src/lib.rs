// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest-side access to the Hyper-V hypervisor: detection, the hypercall
//! page, and the synthetic interrupt controller.
//!
//! Processor and memory access are abstracted by [`platform::GuestPlatform`].
//! On x64 kernels, [`arch::x86_64::X64Platform`] provides the processor
//! parts; [`emulated`] provides a complete in-process implementation.

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod arch {
    #[cfg(target_arch = "x86_64")]
    pub mod x86_64;
}
pub mod detect;
pub mod emulated;
pub mod hypercall;
pub mod memory;
pub mod platform;
pub mod synic;

pub use detect::HypervisorInfo;
pub use detect::report_guest_os_id;
pub use hypercall::Hypercalls;
pub use synic::Synic;
pub use synic::SynicConfig;
