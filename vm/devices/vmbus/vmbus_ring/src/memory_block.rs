// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A ring backed by a [`MemoryBlock`]: DMA memory whose pfns are known and
//! which has been described to the host by a GPADL.

use crate::CONTROL_WORD_COUNT;
use crate::PAGE_SIZE;
use crate::RingMem;
use hv1_guest::memory::MemoryBlock;
use std::sync::atomic::AtomicU32;

/// One direction of a channel: a control page followed by the data pages.
#[derive(Debug, Clone)]
pub struct MemoryBlockRingBuffer(MemoryBlock);

impl MemoryBlockRingBuffer {
    /// Panics unless `mem` is whole pages with at least one data page.
    pub fn new(mem: MemoryBlock) -> Self {
        assert!(mem.len() >= 2 * PAGE_SIZE && mem.len() % PAGE_SIZE == 0);
        Self(mem)
    }

    /// The backing memory, including the control page.
    pub fn memory(&self) -> &MemoryBlock {
        &self.0
    }
}

impl RingMem for MemoryBlockRingBuffer {
    fn control(&self) -> &[AtomicU32] {
        self.0.as_u32_slice(0, CONTROL_WORD_COUNT)
    }

    fn len(&self) -> usize {
        self.0.len() - PAGE_SIZE
    }

    fn read_linear(&self, offset: usize, data: &mut [u8]) {
        self.0.read_at(PAGE_SIZE + offset, data);
    }

    fn write_linear(&self, offset: usize, data: &[u8]) {
        self.0.write_at(PAGE_SIZE + offset, data);
    }
}
