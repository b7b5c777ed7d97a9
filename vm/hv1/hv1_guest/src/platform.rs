// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The services the guest transport needs from the surrounding OS or
//! firmware. Everything that touches processor state or physical memory
//! sits behind these traits, so the protocol code runs unchanged against a
//! real partition or an emulated one.

use crate::memory::MemoryBlock;
use hvdef::hypercall::Control;
use hvdef::hypercall::HypercallOutput;
use std::sync::Arc;

/// Reads and writes model-specific registers of the current processor.
pub trait MsrAccess: Send + Sync {
    fn read_msr(&self, msr: u32) -> u64;
    fn write_msr(&self, msr: u32, value: u64);
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuIdResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

pub trait CpuId: Send + Sync {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult;
}

/// Per-processor execution.
pub trait PerCpu: Send + Sync {
    /// The number of logical processors. Processor indexes are dense from 0.
    fn cpu_count(&self) -> u32;

    /// The index of the processor the caller is running on.
    fn current_cpu(&self) -> u32;

    /// Runs `f(cpu)` on every processor and returns after all have finished.
    fn run_on_all_cpus(&self, f: &(dyn Fn(u32) + Sync));

    /// Runs `f` on `cpu` with migration disabled and returns after it
    /// finishes.
    fn run_on_cpu(&self, cpu: u32, f: &mut (dyn FnMut() + Send));
}

/// Access to the hypercall page.
pub trait HypercallIo: Send + Sync {
    /// The guest page number of the page to register in the hypercall MSR.
    fn hypercall_page_gpn(&self) -> u64;

    /// Calls through the hypercall page.
    ///
    /// # Safety
    /// For slow calls, `input` and `output` must be the physical addresses of
    /// pages the caller owns for the duration of the call.
    unsafe fn invoke(&self, control: Control, input: u64, output: u64) -> HypercallOutput;
}

/// Allocates page-aligned, physically addressable memory.
pub trait DmaClient: Send + Sync {
    /// Allocates `len` bytes, which must be a multiple of the page size. The
    /// memory is zeroed and freed when the last view is dropped.
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock>;
}

/// Receives the aggregated hypervisor interrupt.
pub trait InterruptSink: Send + Sync {
    /// Called in interrupt context on the processor that took the interrupt.
    /// Must not block.
    fn interrupt(&self);
}

/// The platform interrupt line the SynIC SINTs are routed to.
pub trait InterruptLine: Send + Sync {
    /// The vector to program into the SINT registers.
    fn vector(&self) -> u8;

    fn register(&self, sink: Arc<dyn InterruptSink>) -> anyhow::Result<()>;

    fn unregister(&self);

    fn enable(&self);

    fn disable(&self);
}

/// The collaborators handed to the hypercall layer, SynIC and VMBus client
/// at construction time.
#[derive(Clone)]
pub struct GuestPlatform {
    pub msr: Arc<dyn MsrAccess>,
    pub cpuid: Arc<dyn CpuId>,
    pub per_cpu: Arc<dyn PerCpu>,
    pub hypercall: Arc<dyn HypercallIo>,
    pub dma: Arc<dyn DmaClient>,
    pub interrupt: Arc<dyn InterruptLine>,
}
