// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-processor synthetic interrupt controller setup and interrupt-time
//! message and event handling.

use crate::memory::MemoryBlock;
use crate::memory::PAGE_SIZE;
use crate::platform::GuestPlatform;
use crate::platform::MsrAccess;
use crate::platform::PerCpu;
use hvdef::HV_EVENT_FLAGS_BYTE_COUNT;
use hvdef::HV_EVENT_FLAGS_COUNT;
use hvdef::HV_MESSAGE_SIZE;
use hvdef::HvMessage;
use hvdef::HvMessageFlags;
use hvdef::HvMessageType;
use hvdef::HvSynicScontrol;
use hvdef::HvSynicSimpSiefp;
use hvdef::HvSynicSint;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SynicError {
    #[error("failed to allocate synic pages for cpu {cpu}")]
    Allocation {
        cpu: u32,
        #[source]
        err: anyhow::Error,
    },
    #[error("invalid sint {0}")]
    InvalidSint(u8),
}

#[derive(Debug, Copy, Clone)]
pub struct SynicConfig {
    /// The SINT VMBus messages and events arrive on.
    pub message_sint: u8,
    /// The SINT synthetic timer expirations arrive on.
    pub timer_sint: u8,
    pub auto_eoi: bool,
}

impl Default for SynicConfig {
    fn default() -> Self {
        Self {
            message_sint: 2,
            timer_sint: 4,
            auto_eoi: false,
        }
    }
}

/// Receives the work found by [`Synic::handle_interrupt`].
pub trait SynicHandler {
    /// Called with the event flags of the message SINT of `cpu`.
    fn on_events(&self, cpu: u32, flags: EventFlags<'_>);

    /// Called with a copy of a message taken from the message SINT slot. The
    /// slot has already been released.
    fn on_message(&self, cpu: u32, message: &HvMessage);
}

/// A 2048-bit event flag bitmap shared with the hypervisor.
#[derive(Copy, Clone)]
pub struct EventFlags<'a>(&'a [AtomicU32]);

impl<'a> EventFlags<'a> {
    pub fn new(words: &'a [AtomicU32]) -> Self {
        Self(words)
    }

    pub fn bit_count(&self) -> u32 {
        (self.0.len() * 32) as u32
    }

    pub fn is_set(&self, bit: u32) -> bool {
        self.0[bit as usize / 32].load(Ordering::Relaxed) & (1 << (bit % 32)) != 0
    }

    pub fn set(&self, bit: u32) {
        self.0[bit as usize / 32].fetch_or(1 << (bit % 32), Ordering::SeqCst);
    }

    /// Atomically clears `bit`, returning whether it was set.
    pub fn test_and_clear(&self, bit: u32) -> bool {
        let mask = 1 << (bit % 32);
        self.0[bit as usize / 32].fetch_and(!mask, Ordering::SeqCst) & mask != 0
    }

    /// Atomically clears every set bit in `start..end` and calls `f` for each
    /// in ascending order.
    pub fn take_range(&self, start: u32, end: u32, mut f: impl FnMut(u32)) {
        let end = end.min(self.bit_count());
        let mut word_start = start - start % 32;
        while word_start < end {
            let index = (word_start / 32) as usize;
            let mut mask = u32::MAX;
            if start > word_start {
                mask &= u32::MAX << (start - word_start);
            }
            if end - word_start < 32 {
                mask &= (1 << (end - word_start)) - 1;
            }
            // Skip the read-modify-write for the common all-clear case.
            if self.0[index].load(Ordering::Relaxed) & mask != 0 {
                let mut taken = self.0[index].fetch_and(!mask, Ordering::SeqCst) & mask;
                while taken != 0 {
                    let bit = taken.trailing_zeros();
                    taken &= taken - 1;
                    f(word_start + bit);
                }
            }
            word_start += 32;
        }
    }
}

struct CpuPages {
    message_page: MemoryBlock,
    event_page: MemoryBlock,
}

/// The SynIC state of every processor.
pub struct Synic {
    msr: Arc<dyn MsrAccess>,
    per_cpu: Arc<dyn PerCpu>,
    config: SynicConfig,
    vector: u8,
    cpus: Vec<CpuPages>,
    eom_lock: Mutex<()>,
}

impl Synic {
    /// Allocates the message and event pages of every processor and enables
    /// the SynIC on each of them.
    pub fn new(platform: &GuestPlatform, config: SynicConfig) -> Result<Self, SynicError> {
        for sint in [config.message_sint, config.timer_sint] {
            if sint as usize >= hvdef::NUM_SINTS {
                return Err(SynicError::InvalidSint(sint));
            }
        }

        let cpus = (0..platform.per_cpu.cpu_count())
            .map(|cpu| {
                let alloc = || platform.dma.allocate_dma_buffer(PAGE_SIZE);
                Ok(CpuPages {
                    message_page: alloc().map_err(|err| SynicError::Allocation { cpu, err })?,
                    event_page: alloc().map_err(|err| SynicError::Allocation { cpu, err })?,
                })
            })
            .collect::<Result<Vec<_>, SynicError>>()?;

        let this = Self {
            msr: platform.msr.clone(),
            per_cpu: platform.per_cpu.clone(),
            config,
            vector: platform.interrupt.vector(),
            cpus,
            eom_lock: Mutex::new(()),
        };

        this.per_cpu.run_on_all_cpus(&|cpu| this.enable_cpu(cpu));
        tracing::info!(
            cpus = this.cpus.len(),
            vector = this.vector,
            message_sint = config.message_sint,
            timer_sint = config.timer_sint,
            "synic enabled"
        );
        Ok(this)
    }

    pub fn config(&self) -> &SynicConfig {
        &self.config
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpus.len() as u32
    }

    fn enable_cpu(&self, cpu: u32) {
        let pages = &self.cpus[cpu as usize];
        let msr = &*self.msr;

        let simp = HvSynicSimpSiefp::from(msr.read_msr(hvdef::HV_X64_MSR_SIMP))
            .with_base_gpn(pages.message_page.pfns()[0])
            .with_enabled(true);
        msr.write_msr(hvdef::HV_X64_MSR_SIMP, simp.into());

        let siefp = HvSynicSimpSiefp::from(msr.read_msr(hvdef::HV_X64_MSR_SIEFP))
            .with_base_gpn(pages.event_page.pfns()[0])
            .with_enabled(true);
        msr.write_msr(hvdef::HV_X64_MSR_SIEFP, siefp.into());

        for sint in [self.config.message_sint, self.config.timer_sint] {
            let reg = hvdef::hv_x64_msr_sint(sint);
            let value = HvSynicSint::from(msr.read_msr(reg))
                .with_vector(self.vector)
                .with_masked(false)
                .with_auto_eoi(self.config.auto_eoi);
            msr.write_msr(reg, value.into());
        }

        let scontrol =
            HvSynicScontrol::from(msr.read_msr(hvdef::HV_X64_MSR_SCONTROL)).with_enabled(true);
        msr.write_msr(hvdef::HV_X64_MSR_SCONTROL, scontrol.into());
        tracing::trace!(cpu, "synic enabled on cpu");
    }

    fn disable_cpu(&self) {
        let msr = &*self.msr;
        for sint in [self.config.message_sint, self.config.timer_sint] {
            let reg = hvdef::hv_x64_msr_sint(sint);
            let value = HvSynicSint::from(msr.read_msr(reg)).with_masked(true);
            msr.write_msr(reg, value.into());
        }
        for reg in [hvdef::HV_X64_MSR_SIMP, hvdef::HV_X64_MSR_SIEFP] {
            let value = HvSynicSimpSiefp::from(msr.read_msr(reg)).with_enabled(false);
            msr.write_msr(reg, value.into());
        }
        let scontrol =
            HvSynicScontrol::from(msr.read_msr(hvdef::HV_X64_MSR_SCONTROL)).with_enabled(false);
        msr.write_msr(hvdef::HV_X64_MSR_SCONTROL, scontrol.into());
    }

    /// Masks the SINTs and disables the SynIC on every processor. The pages
    /// are released when `self` is dropped.
    pub fn shutdown(&self) {
        self.per_cpu.run_on_all_cpus(&|_| self.disable_cpu());
        tracing::info!("synic disabled");
    }

    /// The event flags of `sint` on `cpu`.
    pub fn event_flags(&self, cpu: u32, sint: u8) -> EventFlags<'_> {
        EventFlags(self.cpus[cpu as usize].event_page.as_u32_slice(
            sint as usize * HV_EVENT_FLAGS_BYTE_COUNT,
            HV_EVENT_FLAGS_COUNT / 32,
        ))
    }

    fn slot_offset(sint: u8) -> usize {
        sint as usize * HV_MESSAGE_SIZE
    }

    fn slot_type(&self, cpu: u32, sint: u8) -> &AtomicU32 {
        &self.cpus[cpu as usize]
            .message_page
            .as_u32_slice(Self::slot_offset(sint), 1)[0]
    }

    /// Copies the message in the `sint` slot of `cpu`, if there is one, and
    /// releases the slot.
    pub fn take_message(&self, cpu: u32, sint: u8) -> Option<HvMessage> {
        let typ = HvMessageType(self.slot_type(cpu, sint).load(Ordering::Acquire));
        if typ == HvMessageType::HvMessageTypeNone {
            return None;
        }
        let message: HvMessage = self.cpus[cpu as usize]
            .message_page
            .read_obj(Self::slot_offset(sint));
        self.release_slot(cpu, sint);
        Some(message)
    }

    /// Marks the slot free and, if the hypervisor has another message queued,
    /// asks for it with an EOM from the owning processor.
    fn release_slot(&self, cpu: u32, sint: u8) {
        let page = &self.cpus[cpu as usize].message_page;
        self.slot_type(cpu, sint)
            .store(HvMessageType::HvMessageTypeNone.0, Ordering::SeqCst);
        let mut flags = [0u8];
        page.read_at(Self::slot_offset(sint) + 5, &mut flags);
        if HvMessageFlags::from(flags[0]).message_pending() {
            self.complete_message(cpu);
        }
    }

    /// Writes the EOM MSR on `cpu`. Writing it on any other processor would
    /// acknowledge the wrong slot, so this migrates when needed.
    pub fn complete_message(&self, cpu: u32) {
        if self.per_cpu.current_cpu() == cpu {
            self.msr.write_msr(hvdef::HV_X64_MSR_EOM, 0);
            return;
        }
        let _guard = self.eom_lock.lock();
        let msr = self.msr.clone();
        self.per_cpu
            .run_on_cpu(cpu, &mut || msr.write_msr(hvdef::HV_X64_MSR_EOM, 0));
    }

    /// Handles the aggregated interrupt on `cpu`: timer expirations first,
    /// then channel events, then a pending control message.
    pub fn handle_interrupt(&self, cpu: u32, handler: &dyn SynicHandler) {
        if let Some(message) = self.take_message(cpu, self.config.timer_sint) {
            if message.header.typ != HvMessageType::HvMessageTypeTimerExpired {
                tracing::warn!(cpu, typ = ?message.header.typ, "unexpected message on timer sint");
            }
        }

        handler.on_events(cpu, self.event_flags(cpu, self.config.message_sint));

        if let Some(message) = self.take_message(cpu, self.config.message_sint) {
            handler.on_message(cpu, &message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::EmulatedHypervisor;
    use std::sync::atomic::AtomicU32;
    use test_with_tracing::test;

    fn setup() -> (Arc<EmulatedHypervisor>, Synic) {
        let hv = EmulatedHypervisor::new(2, 16);
        let synic = Synic::new(&hv.platform(), SynicConfig::default()).unwrap();
        (hv, synic)
    }

    #[test]
    fn programs_every_cpu() {
        let (hv, synic) = setup();
        for cpu in 0..2 {
            let sint = HvSynicSint::from(hv.msr(cpu, hvdef::hv_x64_msr_sint(2)));
            assert_eq!(sint.vector(), crate::emulated::EMULATED_VECTOR);
            assert!(!sint.masked());
            assert!(HvSynicSimpSiefp::from(hv.msr(cpu, hvdef::HV_X64_MSR_SIMP)).enabled());
            assert!(HvSynicScontrol::from(hv.msr(cpu, hvdef::HV_X64_MSR_SCONTROL)).enabled());
        }
        assert_ne!(
            hv.msr(0, hvdef::HV_X64_MSR_SIMP),
            hv.msr(1, hvdef::HV_X64_MSR_SIMP)
        );

        synic.shutdown();
        let sint = HvSynicSint::from(hv.msr(1, hvdef::hv_x64_msr_sint(2)));
        assert!(sint.masked());
        assert!(!HvSynicSimpSiefp::from(hv.msr(1, hvdef::HV_X64_MSR_SIMP)).enabled());
    }

    #[test]
    fn rejects_out_of_range_sint() {
        let hv = EmulatedHypervisor::new(1, 4);
        let err = Synic::new(
            &hv.platform(),
            SynicConfig {
                message_sint: 16,
                ..Default::default()
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, SynicError::InvalidSint(16)));
    }

    #[test]
    fn eom_runs_on_owning_cpu() {
        let (hv, synic) = setup();
        hv.inject_message(1, 2, HvMessageType::HvMessageTypeChannel, &[1]);
        hv.inject_message(1, 2, HvMessageType::HvMessageTypeChannel, &[2]);

        // Taken from processor 0, but the slot belongs to processor 1.
        let first = synic.take_message(1, 2).unwrap();
        assert_eq!(first.payload(), [1]);
        assert_eq!(hv.eom_count(0), 0);
        assert_eq!(hv.eom_count(1), 1);

        let second = synic.take_message(1, 2).unwrap();
        assert_eq!(second.payload(), [2]);
        assert_eq!(hv.eom_count(1), 1);
        assert!(synic.take_message(1, 2).is_none());
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl SynicHandler for Recorder {
        fn on_events(&self, cpu: u32, flags: EventFlags<'_>) {
            flags.take_range(0, 64, |bit| self.0.lock().push(format!("event {cpu} {bit}")));
        }

        fn on_message(&self, cpu: u32, message: &HvMessage) {
            self.0
                .lock()
                .push(format!("message {cpu} {:?}", message.payload()));
        }
    }

    #[test]
    fn interrupt_order() {
        let (hv, synic) = setup();
        hv.inject_message(0, 4, HvMessageType::HvMessageTypeTimerExpired, &[0; 24]);
        hv.inject_message(0, 2, HvMessageType::HvMessageTypeChannel, &[9]);
        hv.signal_guest_event(0, 2, 5);

        let recorder = Recorder::default();
        synic.handle_interrupt(0, &recorder);
        assert_eq!(*recorder.0.lock(), ["event 0 5", "message 0 [9]"]);
        assert!(synic.take_message(0, 4).is_none());
        assert!(synic.take_message(0, 2).is_none());
    }

    #[test]
    fn take_range_clears_only_requested_bits() {
        let words: Vec<AtomicU32> = (0..64).map(|_| AtomicU32::new(0)).collect();
        let flags = EventFlags::new(&words);
        for bit in [0, 1, 31, 32, 33, 200, 2047] {
            flags.set(bit);
        }

        let mut seen = Vec::new();
        flags.take_range(1, 201, |bit| seen.push(bit));
        assert_eq!(seen, [1, 31, 32, 33, 200]);
        assert!(flags.is_set(0));
        assert!(flags.is_set(2047));
        assert!(!flags.is_set(33));

        assert!(flags.test_and_clear(2047));
        assert!(!flags.test_and_clear(2047));
    }

    #[test]
    fn take_range_handles_word_boundaries() {
        let words: Vec<AtomicU32> = (0..2).map(|_| AtomicU32::new(u32::MAX)).collect();
        let flags = EventFlags::new(&words);
        let mut count = 0;
        flags.take_range(30, 64, |_| count += 1);
        assert_eq!(count, 34);
        assert_eq!(words[0].load(std::sync::atomic::Ordering::Relaxed), 0x3fff_ffff);
        assert_eq!(words[1].load(std::sync::atomic::Ordering::Relaxed), 0);
    }
}
