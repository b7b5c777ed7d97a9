// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The two hypercalls VMBus needs: `HvPostMessage` and `HvSignalEvent`.

use crate::memory::MemoryBlock;
use crate::memory::PAGE_SIZE;
use crate::platform::GuestPlatform;
use crate::platform::HypercallIo;
use crate::platform::MsrAccess;
use crate::platform::PerCpu;
use hvdef::HV_MESSAGE_PAYLOAD_SIZE;
use hvdef::HvError;
use hvdef::HvResult;
use hvdef::HypercallCode;
use hvdef::hypercall::Control;
use hvdef::hypercall::MsrHypercallContents;
use hvdef::hypercall::PostMessage;
use hvdef::hypercall::SignalEvent;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromZeros;

#[derive(Debug, Error)]
pub enum HypercallInitError {
    #[error("hypercall MSR did not latch the enable bit (read back {0:#x})")]
    NotEnabled(u64),
    #[error("failed to allocate hypercall input page for cpu {cpu}")]
    Staging {
        cpu: u32,
        #[source]
        err: anyhow::Error,
    },
}

/// An enabled hypercall interface.
pub struct Hypercalls {
    io: Arc<dyn HypercallIo>,
    msr: Arc<dyn MsrAccess>,
    per_cpu: Arc<dyn PerCpu>,
    // One input page per processor. The lock only guards against preemption
    // between picking the page and issuing the call.
    staging: Vec<Mutex<MemoryBlock>>,
}

impl Hypercalls {
    /// Registers the hypercall page and allocates the per-processor input
    /// pages. The guest OS ID must already have been reported.
    pub fn new(platform: &GuestPlatform) -> Result<Self, HypercallInitError> {
        let gpn = platform.hypercall.hypercall_page_gpn();
        let contents =
            MsrHypercallContents::from(platform.msr.read_msr(hvdef::HV_X64_MSR_HYPERCALL))
                .with_enable(true)
                .with_gpn(gpn);
        platform
            .msr
            .write_msr(hvdef::HV_X64_MSR_HYPERCALL, contents.into());

        let readback = platform.msr.read_msr(hvdef::HV_X64_MSR_HYPERCALL);
        if !MsrHypercallContents::from(readback).enable() {
            return Err(HypercallInitError::NotEnabled(readback));
        }

        let staging = (0..platform.per_cpu.cpu_count())
            .map(|cpu| {
                platform
                    .dma
                    .allocate_dma_buffer(PAGE_SIZE)
                    .map(Mutex::new)
                    .map_err(|err| HypercallInitError::Staging { cpu, err })
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(gpn, cpus = staging.len(), "hypercalls enabled");
        Ok(Self {
            io: platform.hypercall.clone(),
            msr: platform.msr.clone(),
            per_cpu: platform.per_cpu.clone(),
            staging,
        })
    }

    /// Posts a message to `connection_id`. Payloads over 240 bytes are
    /// rejected with `InvalidParameter` without calling the hypervisor.
    pub fn post_message(
        &self,
        connection_id: u32,
        message_type: u32,
        data: &[u8],
    ) -> HvResult<()> {
        if data.len() > HV_MESSAGE_PAYLOAD_SIZE {
            tracing::warn!(len = data.len(), "post message payload too large");
            return Err(HvError::InvalidParameter);
        }

        let mut input = PostMessage::new_zeroed();
        input.connection_id = connection_id;
        input.message_type = message_type;
        input.payload_size = data.len() as u32;
        input.payload[..data.len()].copy_from_slice(data);

        let cpu = self.per_cpu.current_cpu() as usize;
        let page = self.staging[cpu % self.staging.len()].lock();
        page.write_obj(0, &input);

        let control = Control::new().with_code(HypercallCode::HvCallPostMessage.0);
        // SAFETY: the staging page is owned by this object and locked for the
        // duration of the call. PostMessage has no output.
        let output = unsafe { self.io.invoke(control, page.gpa(), 0) };
        tracing::trace!(
            connection_id,
            message_type,
            len = data.len(),
            status = ?output.call_status(),
            "post message"
        );
        output.result()
    }

    /// Signals the event associated with `connection_id`, flag 0.
    pub fn signal_event(&self, connection_id: u32) -> HvResult<()> {
        let input = SignalEvent {
            connection_id,
            flag_number: 0,
            rsvd: 0,
        };
        let control = Control::new()
            .with_code(HypercallCode::HvCallSignalEvent.0)
            .with_fast(true);
        // SAFETY: fast calls take their input in registers and touch no
        // memory.
        let output = unsafe { self.io.invoke(control, input.as_u64(), 0) };
        output.result()
    }

    /// Clears the enable bit in the hypercall MSR.
    pub fn disable(&self) {
        let contents =
            MsrHypercallContents::from(self.msr.read_msr(hvdef::HV_X64_MSR_HYPERCALL))
                .with_enable(false);
        self.msr
            .write_msr(hvdef::HV_X64_MSR_HYPERCALL, contents.into());
        tracing::debug!("hypercalls disabled");
    }
}
