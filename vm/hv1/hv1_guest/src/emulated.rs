// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-process emulation of the hypervisor services the guest transport
//! uses, for running the transport against a test host.
//!
//! Processors are emulated by a thread-local "current processor" index.
//! Interrupts are delivered on a dedicated thread so that guest interrupt
//! handlers never run nested inside a hypercall.

use crate::memory::MappedDmaTarget;
use crate::memory::MemoryBlock;
use crate::memory::PAGE_SIZE;
use crate::memory::PAGE_SIZE64;
use crate::platform::CpuId;
use crate::platform::CpuIdResult;
use crate::platform::DmaClient;
use crate::platform::GuestPlatform;
use crate::platform::HypercallIo;
use crate::platform::InterruptLine;
use crate::platform::InterruptSink;
use crate::platform::MsrAccess;
use crate::platform::PerCpu;
use anyhow::Context;
use hvdef::HV_MESSAGE_SIZE;
use hvdef::HvError;
use hvdef::HvMessage;
use hvdef::HvMessageType;
use hvdef::HvPartitionPrivilege;
use hvdef::HvResult;
use hvdef::HvStatus;
use hvdef::HvSynicSimpSiefp;
use hvdef::HvSynicSint;
use hvdef::HypercallCode;
use hvdef::NUM_SINTS;
use hvdef::hypercall::Control;
use hvdef::hypercall::HypercallOutput;
use hvdef::hypercall::MsrHypercallContents;
use hvdef::hypercall::PostMessage;
use hvdef::hypercall::SignalEvent;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// The first page number handed out by [`EmulatedMemory`]. Low page numbers
/// are left unbacked so that a zero GPA is always invalid.
pub const FIRST_PFN: u64 = 0x100;

/// The page number reported for the hypercall page. It is not backed by
/// memory; the emulator intercepts calls through it directly.
pub const HYPERCALL_PAGE_GPN: u64 = 0xff;

/// The interrupt vector the emulated interrupt line reports.
pub const EMULATED_VECTOR: u8 = 0x90;

#[repr(C, align(4096))]
struct Page([AtomicU8; PAGE_SIZE]);

impl Default for Page {
    fn default() -> Self {
        Self([0; PAGE_SIZE].map(AtomicU8::new))
    }
}

/// Physical memory shared by the emulated guest, hypervisor and host.
pub struct EmulatedMemory {
    pages: Box<[Page]>,
    state: Mutex<Vec<u64>>,
}

impl EmulatedMemory {
    pub fn new(page_count: usize) -> Arc<Self> {
        Arc::new(Self {
            pages: (0..page_count).map(|_| Page::default()).collect(),
            state: Mutex::new(vec![0; page_count.div_ceil(64)]),
        })
    }

    /// Allocates `len` bytes of contiguous, zeroed pages.
    pub fn alloc(self: &Arc<Self>, len: usize) -> Option<DmaBuffer> {
        assert!(len % PAGE_SIZE == 0);
        let count = len / PAGE_SIZE;

        // Find a contiguous free range by scanning the state bitmap.
        let start_page = {
            let mut state = self.state.lock();
            let mut i = 0;
            let mut contig = 0;
            while contig < count && i < self.pages.len() {
                if state[i / 64] & 1 << (i % 64) != 0 {
                    contig = 0;
                } else {
                    contig += 1;
                }
                i += 1;
            }
            if contig < count {
                return None;
            }
            let start = i - contig;
            for j in start..i {
                state[j / 64] |= 1 << (j % 64);
            }
            start
        };

        for page in &self.pages[start_page..start_page + count] {
            for b in &page.0 {
                b.store(0, Ordering::Relaxed);
            }
        }

        Some(DmaBuffer {
            mem: self.clone(),
            pfns: (start_page..start_page + count)
                .map(|p| p as u64 + FIRST_PFN)
                .collect(),
        })
    }

    /// The number of pages currently allocated.
    pub fn allocated_pages(&self) -> usize {
        self.state
            .lock()
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }

    fn page(&self, pfn: u64) -> Option<&Page> {
        self.pages.get(pfn.checked_sub(FIRST_PFN)? as usize)
    }

    /// Maps a list of page numbers the way a host maps a GPADL. The pages
    /// must be contiguous, which holds for everything [`Self::alloc`] returns.
    pub fn map_pfns(self: &Arc<Self>, pfns: &[u64]) -> Option<MemoryBlock> {
        let first = *pfns.first()?;
        if pfns
            .iter()
            .enumerate()
            .any(|(i, &pfn)| pfn != first + i as u64 || self.page(pfn).is_none())
        {
            return None;
        }
        Some(MemoryBlock::new(HostMapping {
            mem: self.clone(),
            pfns: pfns.to_vec(),
        }))
    }

    /// Returns the byte at `gpa`, or `None` if it is not backed.
    fn byte(&self, gpa: u64) -> Option<&AtomicU8> {
        let page = self.page(gpa / PAGE_SIZE64)?;
        Some(&page.0[(gpa % PAGE_SIZE64) as usize])
    }

    pub fn read_gpa(&self, gpa: u64, data: &mut [u8]) -> bool {
        for (i, d) in data.iter_mut().enumerate() {
            match self.byte(gpa + i as u64) {
                Some(b) => *d = b.load(Ordering::Relaxed),
                None => return false,
            }
        }
        true
    }

    pub fn write_gpa(&self, gpa: u64, data: &[u8]) -> bool {
        for (i, s) in data.iter().enumerate() {
            match self.byte(gpa + i as u64) {
                Some(b) => b.store(*s, Ordering::Relaxed),
                None => return false,
            }
        }
        true
    }

    /// Returns the aligned 32-bit word at `gpa`.
    pub fn atomic_u32(&self, gpa: u64) -> Option<&AtomicU32> {
        if gpa % 4 != 0 {
            return None;
        }
        let b = self.byte(gpa)?;
        // SAFETY: the address is 4-byte aligned and the word lies within one
        // page, and AtomicU32 has the same layout as four AtomicU8s.
        Some(unsafe { &*std::ptr::from_ref(b).cast::<AtomicU32>() })
    }
}

/// An allocation from [`EmulatedMemory`], returned to the pool on drop.
pub struct DmaBuffer {
    mem: Arc<EmulatedMemory>,
    pfns: Vec<u64>,
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let mut state = self.mem.state.lock();
        for &pfn in &self.pfns {
            let i = (pfn - FIRST_PFN) as usize;
            state[i / 64] &= !(1 << (i % 64));
        }
    }
}

/// SAFETY: the pages are owned by `mem`, which is kept alive, and are
/// contiguous in the page array.
unsafe impl MappedDmaTarget for DmaBuffer {
    fn base(&self) -> *const u8 {
        self.mem.pages[(self.pfns[0] - FIRST_PFN) as usize]
            .0
            .as_ptr()
            .cast()
    }

    fn len(&self) -> usize {
        self.pfns.len() * PAGE_SIZE
    }

    fn pfns(&self) -> &[u64] {
        &self.pfns
    }
}

struct HostMapping {
    mem: Arc<EmulatedMemory>,
    pfns: Vec<u64>,
}

/// SAFETY: `map_pfns` checked that the pages exist and are contiguous.
unsafe impl MappedDmaTarget for HostMapping {
    fn base(&self) -> *const u8 {
        self.mem.pages[(self.pfns[0] - FIRST_PFN) as usize]
            .0
            .as_ptr()
            .cast()
    }

    fn len(&self) -> usize {
        self.pfns.len() * PAGE_SIZE
    }

    fn pfns(&self) -> &[u64] {
        &self.pfns
    }
}

/// The other end of the emulated hypervisor's message and event ports.
pub trait HostHandler: Send + Sync {
    /// Handles an `HvPostMessage` from the guest.
    fn post_message(&self, connection_id: u32, message_type: u32, data: &[u8]) -> HvResult<()>;

    /// Handles an `HvSignalEvent` from the guest.
    fn signal_event(&self, connection_id: u32, flag_number: u16) -> HvResult<()>;
}

thread_local! {
    static CURRENT_CPU: Cell<u32> = const { Cell::new(0) };
}

/// Runs `f` with the calling thread posing as processor `cpu`.
pub fn with_cpu<R>(cpu: u32, f: impl FnOnce() -> R) -> R {
    let old = CURRENT_CPU.replace(cpu);
    let r = f();
    CURRENT_CPU.set(old);
    r
}

#[derive(Default)]
struct VpState {
    msrs: HashMap<u32, u64>,
    queued: [VecDeque<HvMessage>; NUM_SINTS],
}

impl VpState {
    fn msr(&self, msr: u32) -> u64 {
        self.msrs.get(&msr).copied().unwrap_or(0)
    }

    fn sint(&self, sint: u8) -> HvSynicSint {
        HvSynicSint::from(self.msr(hvdef::hv_x64_msr_sint(sint)))
    }

    fn page_gpa(&self, msr: u32) -> Option<u64> {
        let reg = HvSynicSimpSiefp::from(self.msr(msr));
        reg.enabled().then(|| reg.base_gpn() * PAGE_SIZE64)
    }
}

#[derive(Default)]
struct InterruptState {
    pending: u64,
    sink: Option<Arc<dyn InterruptSink>>,
    enabled: bool,
    running: bool,
}

#[derive(Default)]
struct InterruptQueue {
    state: Mutex<InterruptState>,
    cond: Condvar,
}

impl InterruptQueue {
    fn raise(&self, cpu: u32) {
        self.state.lock().pending |= 1 << cpu;
        self.cond.notify_all();
    }

    fn run(&self) {
        loop {
            let (cpu, sink) = {
                let mut state = self.state.lock();
                loop {
                    if !state.running {
                        return;
                    }
                    if state.enabled && state.pending != 0 {
                        if let Some(sink) = state.sink.clone() {
                            let cpu = state.pending.trailing_zeros();
                            state.pending &= !(1 << cpu);
                            break (cpu, sink);
                        }
                    }
                    self.cond.wait(&mut state);
                }
            };
            with_cpu(cpu, || sink.interrupt());
        }
    }
}

/// An emulated partition: processors with SynIC MSRs, a hypercall page, and
/// shared memory.
pub struct EmulatedHypervisor {
    memory: Arc<EmulatedMemory>,
    vps: Vec<Mutex<VpState>>,
    host: Mutex<Option<Arc<dyn HostHandler>>>,
    interrupts: Arc<InterruptQueue>,
    hypercalls: AtomicU64,
    eoms: Vec<AtomicU64>,
}

impl EmulatedHypervisor {
    /// Creates a partition with `cpu_count` processors (at most 64) and
    /// `page_count` pages of memory.
    pub fn new(cpu_count: u32, page_count: usize) -> Arc<Self> {
        assert!(cpu_count > 0 && cpu_count <= 64);
        Arc::new(Self {
            memory: EmulatedMemory::new(page_count),
            vps: (0..cpu_count).map(|_| Mutex::default()).collect(),
            host: Mutex::new(None),
            interrupts: Arc::default(),
            hypercalls: AtomicU64::new(0),
            eoms: (0..cpu_count).map(|_| AtomicU64::new(0)).collect(),
        })
    }

    /// The platform services backed by this partition.
    pub fn platform(self: &Arc<Self>) -> GuestPlatform {
        GuestPlatform {
            msr: self.clone(),
            cpuid: self.clone(),
            per_cpu: self.clone(),
            hypercall: self.clone(),
            dma: self.clone(),
            interrupt: self.clone(),
        }
    }

    pub fn memory(&self) -> &Arc<EmulatedMemory> {
        &self.memory
    }

    /// Connects the host side of the message and event ports.
    pub fn set_host(&self, host: Arc<dyn HostHandler>) {
        *self.host.lock() = Some(host);
    }

    /// Reads an MSR of `cpu` without side effects.
    pub fn msr(&self, cpu: u32, msr: u32) -> u64 {
        self.vps[cpu as usize].lock().msr(msr)
    }

    /// The number of hypercalls issued so far.
    pub fn hypercall_count(&self) -> u64 {
        self.hypercalls.load(Ordering::SeqCst)
    }

    /// The number of EOM writes made on `cpu`.
    pub fn eom_count(&self, cpu: u32) -> u64 {
        self.eoms[cpu as usize].load(Ordering::SeqCst)
    }

    /// Queues a message for `sint` on `cpu` and interrupts the processor if
    /// it landed in the slot.
    pub fn inject_message(&self, cpu: u32, sint: u8, typ: HvMessageType, payload: &[u8]) {
        let raise = {
            let mut vp = self.vps[cpu as usize].lock();
            vp.queued[sint as usize].push_back(HvMessage::new(typ, 0, payload));
            self.deliver(&mut vp)
        };
        if raise {
            self.interrupts.raise(cpu);
        }
    }

    /// Sets event flag `flag` for `sint` on `cpu` and interrupts the
    /// processor.
    pub fn signal_guest_event(&self, cpu: u32, sint: u8, flag: u32) {
        let raise = {
            let vp = self.vps[cpu as usize].lock();
            let Some(base) = vp.page_gpa(hvdef::HV_X64_MSR_SIEFP) else {
                tracing::debug!(cpu, "event dropped, siefp disabled");
                return;
            };
            let gpa = base
                + (sint as usize * hvdef::HV_EVENT_FLAGS_BYTE_COUNT) as u64
                + (flag / 32 * 4) as u64;
            if let Some(word) = self.memory.atomic_u32(gpa) {
                word.fetch_or(1 << (flag % 32), Ordering::SeqCst);
            }
            !vp.sint(sint).masked()
        };
        if raise {
            self.interrupts.raise(cpu);
        }
    }

    /// Moves queued messages into free slots. Returns whether an unmasked
    /// SINT received one.
    fn deliver(&self, vp: &mut VpState) -> bool {
        let Some(simp) = vp.page_gpa(hvdef::HV_X64_MSR_SIMP) else {
            return false;
        };
        let mut raise = false;
        for sint in 0..NUM_SINTS as u8 {
            if vp.queued[sint as usize].is_empty() {
                continue;
            }
            let slot = simp + (sint as usize * HV_MESSAGE_SIZE) as u64;
            let Some(typ) = self.memory.atomic_u32(slot) else {
                continue;
            };
            if typ.load(Ordering::Acquire) != HvMessageType::HvMessageTypeNone.0 {
                let mut flags = [0];
                self.memory.read_gpa(slot + 5, &mut flags);
                self.memory.write_gpa(slot + 5, &[flags[0] | 1]);
                // The guest may have freed the slot before the flag landed.
                if typ.load(Ordering::SeqCst) != HvMessageType::HvMessageTypeNone.0 {
                    continue;
                }
            }
            let queue = &mut vp.queued[sint as usize];
            let Some(mut message) = queue.pop_front() else {
                continue;
            };
            message
                .header
                .flags
                .set_message_pending(!queue.is_empty());
            // Publish the type last so the guest never sees a partial
            // message.
            self.memory.write_gpa(slot + 4, &message.as_bytes()[4..]);
            typ.store(message.header.typ.0, Ordering::Release);
            raise |= !vp.sint(sint).masked();
        }
        raise
    }

    fn eom(&self, cpu: u32) {
        self.eoms[cpu as usize].fetch_add(1, Ordering::SeqCst);
        let raise = self.deliver(&mut self.vps[cpu as usize].lock());
        if raise {
            self.interrupts.raise(cpu);
        }
    }

    fn dispatch_hypercall(&self, control: Control, input: u64) -> HvResult<()> {
        let cpu = CURRENT_CPU.get();
        let enabled = MsrHypercallContents::from(self.msr(cpu, hvdef::HV_X64_MSR_HYPERCALL))
            .enable();
        if !enabled {
            return Err(HvError::InvalidHypercallCode);
        }
        let host = self.host.lock().clone();
        match HypercallCode(control.code()) {
            HypercallCode::HvCallPostMessage if !control.fast() => {
                let mut message = PostMessage::new_zeroed();
                if !self.memory.read_gpa(input, message.as_mut_bytes()) {
                    return Err(HvError::InvalidParameter);
                }
                let len = message.payload_size as usize;
                if len > message.payload.len() {
                    return Err(HvError::InvalidParameter);
                }
                let host = host.ok_or(HvError::InvalidConnectionId)?;
                host.post_message(
                    message.connection_id,
                    message.message_type,
                    &message.payload[..len],
                )
            }
            HypercallCode::HvCallSignalEvent if control.fast() => {
                let event = SignalEvent::read_from_bytes(input.as_bytes())
                    .map_err(|_| HvError::InvalidHypercallInput)?;
                let host = host.ok_or(HvError::InvalidConnectionId)?;
                host.signal_event(event.connection_id, event.flag_number)
            }
            _ => Err(HvError::InvalidHypercallCode),
        }
    }
}

impl MsrAccess for EmulatedHypervisor {
    fn read_msr(&self, msr: u32) -> u64 {
        let cpu = CURRENT_CPU.get();
        if msr == hvdef::HV_X64_MSR_VP_INDEX {
            return cpu.into();
        }
        self.msr(cpu, msr)
    }

    fn write_msr(&self, msr: u32, value: u64) {
        let cpu = CURRENT_CPU.get();
        self.vps[cpu as usize].lock().msrs.insert(msr, value);
        if msr == hvdef::HV_X64_MSR_EOM {
            self.eom(cpu);
        }
    }
}

impl CpuId for EmulatedHypervisor {
    fn cpuid(&self, leaf: u32, _subleaf: u32) -> CpuIdResult {
        let privileges = u64::from(
            HvPartitionPrivilege::new()
                .with_access_synic_msrs(true)
                .with_access_hypercall_msrs(true)
                .with_access_vp_index(true)
                .with_post_messages(true)
                .with_signal_events(true),
        );
        match leaf {
            hvdef::HV_CPUID_FUNCTION_VERSION_AND_FEATURES => CpuIdResult {
                ecx: hvdef::CPUID_1_ECX_HYPERVISOR_PRESENT,
                ..Default::default()
            },
            hvdef::HV_CPUID_FUNCTION_HV_VENDOR_AND_MAX_FUNCTION => CpuIdResult {
                eax: hvdef::HV_CPUID_FUNCTION_MS_HV_HARDWARE_FEATURES,
                ebx: u32::from_le_bytes(*b"Micr"),
                ecx: u32::from_le_bytes(*b"osof"),
                edx: u32::from_le_bytes(*b"t Hv"),
            },
            hvdef::HV_CPUID_FUNCTION_HV_INTERFACE => CpuIdResult {
                eax: hvdef::HV_INTERFACE_SIGNATURE_HV1,
                ..Default::default()
            },
            hvdef::HV_CPUID_FUNCTION_MS_HV_VERSION => CpuIdResult {
                eax: 26100,
                ebx: 10 << 16,
                ..Default::default()
            },
            hvdef::HV_CPUID_FUNCTION_MS_HV_FEATURES => CpuIdResult {
                eax: privileges as u32,
                ebx: (privileges >> 32) as u32,
                ..Default::default()
            },
            _ => CpuIdResult::default(),
        }
    }
}

impl PerCpu for EmulatedHypervisor {
    fn cpu_count(&self) -> u32 {
        self.vps.len() as u32
    }

    fn current_cpu(&self) -> u32 {
        CURRENT_CPU.get()
    }

    fn run_on_all_cpus(&self, f: &(dyn Fn(u32) + Sync)) {
        for cpu in 0..self.cpu_count() {
            with_cpu(cpu, || f(cpu));
        }
    }

    fn run_on_cpu(&self, cpu: u32, f: &mut (dyn FnMut() + Send)) {
        with_cpu(cpu, f);
    }
}

impl HypercallIo for EmulatedHypervisor {
    fn hypercall_page_gpn(&self) -> u64 {
        HYPERCALL_PAGE_GPN
    }

    unsafe fn invoke(&self, control: Control, input: u64, _output: u64) -> HypercallOutput {
        self.hypercalls.fetch_add(1, Ordering::SeqCst);
        let result = self.dispatch_hypercall(control, input);
        if let Err(err) = result {
            tracing::trace!(code = control.code(), %err, "emulated hypercall failed");
        }
        HypercallOutput::new().with_call_status(HvStatus::from(result))
    }
}

impl DmaClient for EmulatedHypervisor {
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock> {
        Ok(MemoryBlock::new(
            self.memory.alloc(len).context("out of memory")?,
        ))
    }
}

impl InterruptLine for EmulatedHypervisor {
    fn vector(&self) -> u8 {
        EMULATED_VECTOR
    }

    fn register(&self, sink: Arc<dyn InterruptSink>) -> anyhow::Result<()> {
        {
            let mut state = self.interrupts.state.lock();
            anyhow::ensure!(state.sink.is_none(), "interrupt already registered");
            state.sink = Some(sink);
            state.running = true;
        }
        let queue = self.interrupts.clone();
        std::thread::Builder::new()
            .name("emulated-interrupt".into())
            .spawn(move || queue.run())
            .context("failed to spawn interrupt thread")?;
        Ok(())
    }

    fn unregister(&self) {
        let mut state = self.interrupts.state.lock();
        state.sink = None;
        state.running = false;
        self.interrupts.cond.notify_all();
    }

    fn enable(&self) {
        self.interrupts.state.lock().enabled = true;
        self.interrupts.cond.notify_all();
    }

    fn disable(&self) {
        self.interrupts.state.lock().enabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn alloc_reuses_freed_pages() {
        let mem = EmulatedMemory::new(4);
        let a = mem.alloc(PAGE_SIZE * 2).unwrap();
        let b = mem.alloc(PAGE_SIZE * 2).unwrap();
        assert!(mem.alloc(PAGE_SIZE).is_none());
        assert_eq!(a.pfns(), &[FIRST_PFN, FIRST_PFN + 1]);
        drop(a);
        assert_eq!(mem.allocated_pages(), 2);
        let c = mem.alloc(PAGE_SIZE).unwrap();
        assert_eq!(c.pfns(), &[FIRST_PFN]);
        drop((b, c));
        assert_eq!(mem.allocated_pages(), 0);
    }

    #[test]
    fn host_mapping_sees_guest_writes() {
        let mem = EmulatedMemory::new(4);
        let block = MemoryBlock::new(mem.alloc(PAGE_SIZE * 2).unwrap());
        block.write_obj(PAGE_SIZE + 16, &0x1234_5678u32);
        let host = mem.map_pfns(block.pfns()).unwrap();
        assert_eq!(host.read_obj::<u32>(PAGE_SIZE + 16), 0x1234_5678);
        assert!(mem.map_pfns(&[FIRST_PFN, FIRST_PFN + 2]).is_none());
        assert!(mem.map_pfns(&[0]).is_none());
    }

    #[test]
    fn interrupts_reach_the_target_cpu() {
        struct Sink(Mutex<Vec<u32>>, Condvar);
        impl InterruptSink for Sink {
            fn interrupt(&self) {
                self.0.lock().push(CURRENT_CPU.get());
                self.1.notify_all();
            }
        }

        let hv = EmulatedHypervisor::new(2, 16);
        let sink = Arc::new(Sink(Mutex::new(Vec::new()), Condvar::new()));
        hv.register(sink.clone()).unwrap();
        hv.interrupts.raise(1);
        hv.enable();
        let mut seen = sink.0.lock();
        while seen.is_empty() {
            sink.1
                .wait_for(&mut seen, std::time::Duration::from_secs(5));
        }
        assert_eq!(*seen, [1]);
        drop(seen);
        hv.unregister();
    }
}
