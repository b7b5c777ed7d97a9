// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Processor access for a guest kernel running at CPL 0 on x64.
//!
//! The hypercall ABI for x64 is documented in the TLFS.

use crate::platform::CpuId;
use crate::platform::CpuIdResult;
use crate::platform::HypercallIo;
use crate::platform::MsrAccess;
use hvdef::hypercall::Control;
use hvdef::hypercall::HypercallOutput;

unsafe extern "C" {
    /// The hypercall page. The hypervisor overlays its code page on top of
    /// this once the hypercall MSR is enabled.
    static mut HYPERCALL_PAGE: [u8; 4096];
}

core::arch::global_asm! {
    r#"
.globl HYPERCALL_PAGE
.align 4096
HYPERCALL_PAGE:
    ud2
    .skip 4094, 0xcc
"#,
}

/// Direct processor access. Only valid in ring 0 of a Hyper-V guest.
pub struct X64Platform {
    virt_to_phys: fn(*const u8) -> u64,
}

impl X64Platform {
    /// `virt_to_phys` translates kernel virtual addresses to guest physical
    /// addresses.
    ///
    /// # Safety
    /// The caller must be running at CPL 0, where `rdmsr`, `wrmsr` and calls
    /// into the hypercall page are permitted.
    pub unsafe fn new(virt_to_phys: fn(*const u8) -> u64) -> Self {
        Self { virt_to_phys }
    }
}

impl MsrAccess for X64Platform {
    fn read_msr(&self, msr: u32) -> u64 {
        let low: u32;
        let high: u32;
        // SAFETY: construction required CPL 0, and the synthetic MSRs this
        // crate touches have no side effects on read.
        unsafe {
            core::arch::asm! {
                "rdmsr",
                out("eax") low,
                out("edx") high,
                in("ecx") msr,
            }
        }
        ((high as u64) << 32) | low as u64
    }

    fn write_msr(&self, msr: u32, value: u64) {
        // SAFETY: construction required CPL 0. Callers only write synthetic
        // MSRs with values derived from their current contents.
        unsafe {
            core::arch::asm! {
                "wrmsr",
                in("eax") value as u32,
                in("edx") (value >> 32) as u32,
                in("ecx") msr,
            }
        }
    }
}

impl CpuId for X64Platform {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult {
        // SAFETY: cpuid is available on all x64 processors.
        #[allow(unused_unsafe)]
        let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
        CpuIdResult {
            eax: r.eax,
            ebx: r.ebx,
            ecx: r.ecx,
            edx: r.edx,
        }
    }
}

impl HypercallIo for X64Platform {
    fn hypercall_page_gpn(&self) -> u64 {
        (self.virt_to_phys)((&raw const HYPERCALL_PAGE).cast()) / hvdef::HV_PAGE_SIZE
    }

    unsafe fn invoke(&self, control: Control, input: u64, output: u64) -> HypercallOutput {
        let status: u64;
        // SAFETY: the caller guarantees the input and output pages, and the
        // page has been registered by `Hypercalls::new`.
        unsafe {
            core::arch::asm! {
                "call {hypercall_page}",
                hypercall_page = sym HYPERCALL_PAGE,
                inout("rcx") u64::from(control) => _,
                in("rdx") input,
                in("r8") output,
                out("rax") status,
            }
        }
        status.into()
    }
}
