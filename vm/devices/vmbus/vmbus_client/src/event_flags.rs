// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! How channel interrupts are encoded in event flags.
//!
//! Hosts that negotiated Windows 7 or older set a summary bit (bit 0) in the
//! SINT's event flags and the channel's bit in the receive half of a shared
//! interrupt page. Later hosts set the channel's bit directly in the SINT's
//! event flags.

use hv1_guest::memory::MemoryBlock;
use hv1_guest::memory::PAGE_SIZE;
use hv1_guest::synic::EventFlags;
use vmbus_core::protocol::ChannelId;

/// Decodes incoming channel interrupts and prepares outgoing ones.
pub trait EventFlagStrategy: Send + Sync {
    /// Clears and reports every signaled channel below `max_channels`.
    fn scan(&self, flags: EventFlags<'_>, max_channels: u32, f: &mut dyn FnMut(ChannelId));

    /// Called before the guest signals `channel_id`'s connection.
    fn prepare_signal(&self, channel_id: ChannelId);
}

const HALF_PAGE_WORDS: usize = PAGE_SIZE / 2 / size_of::<u32>();

/// The interrupt page scheme used before Windows 8.
pub struct LegacyEventFlagStrategy {
    page: MemoryBlock,
}

impl LegacyEventFlagStrategy {
    /// `page` is the page whose address is sent in `InitiateContact`.
    pub fn new(page: MemoryBlock) -> Self {
        assert!(page.len() >= PAGE_SIZE);
        Self { page }
    }

    fn rx(&self) -> EventFlags<'_> {
        EventFlags::new(self.page.as_u32_slice(0, HALF_PAGE_WORDS))
    }

    fn tx(&self) -> EventFlags<'_> {
        EventFlags::new(self.page.as_u32_slice(PAGE_SIZE / 2, HALF_PAGE_WORDS))
    }

    pub fn page(&self) -> &MemoryBlock {
        &self.page
    }
}

impl EventFlagStrategy for LegacyEventFlagStrategy {
    fn scan(&self, flags: EventFlags<'_>, max_channels: u32, f: &mut dyn FnMut(ChannelId)) {
        if flags.test_and_clear(0) {
            self.rx().take_range(1, max_channels, |bit| f(ChannelId(bit)));
        }
    }

    fn prepare_signal(&self, channel_id: ChannelId) {
        self.tx().set(channel_id.0);
    }
}

/// Windows 8 and later: one SINT event flag per channel.
#[derive(Debug, Default)]
pub struct PerChannelBitStrategy;

impl EventFlagStrategy for PerChannelBitStrategy {
    fn scan(&self, flags: EventFlags<'_>, max_channels: u32, f: &mut dyn FnMut(ChannelId)) {
        flags.take_range(1, max_channels, |bit| f(ChannelId(bit)));
    }

    fn prepare_signal(&self, _channel_id: ChannelId) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use hv1_guest::emulated::EmulatedMemory;
    use std::sync::atomic::AtomicU32;
    use test_with_tracing::test;

    fn sint_flags() -> Vec<AtomicU32> {
        (0..64).map(|_| AtomicU32::new(0)).collect()
    }

    fn collect(strategy: &dyn EventFlagStrategy, flags: EventFlags<'_>) -> Vec<u32> {
        let mut seen = Vec::new();
        strategy.scan(flags, 256, &mut |id| seen.push(id.0));
        seen
    }

    #[test]
    fn legacy_needs_the_summary_bit() {
        let mem = EmulatedMemory::new(1);
        let strategy =
            LegacyEventFlagStrategy::new(MemoryBlock::new(mem.alloc(PAGE_SIZE).unwrap()));
        let words = sint_flags();
        let flags = EventFlags::new(&words);

        strategy.rx().set(5);
        strategy.rx().set(40);
        assert!(collect(&strategy, flags).is_empty());

        flags.set(0);
        assert_eq!(collect(&strategy, flags), [5, 40]);
        assert!(!flags.is_set(0));
        assert!(!strategy.rx().is_set(5));

        // Bits past the channel limit stay put.
        strategy.rx().set(300);
        flags.set(0);
        assert!(collect(&strategy, flags).is_empty());
        assert!(strategy.rx().is_set(300));
    }

    #[test]
    fn legacy_signal_marks_the_tx_half() {
        let mem = EmulatedMemory::new(1);
        let block = MemoryBlock::new(mem.alloc(PAGE_SIZE).unwrap());
        let strategy = LegacyEventFlagStrategy::new(block.clone());
        strategy.prepare_signal(ChannelId(33));
        assert_eq!(block.read_obj::<u32>(PAGE_SIZE / 2 + 4), 1 << 1);
        assert_eq!(block.read_obj::<u32>(4), 0);
    }

    #[test]
    fn per_channel_bits() {
        let words = sint_flags();
        let flags = EventFlags::new(&words);
        flags.set(0);
        flags.set(5);
        flags.set(255);
        assert_eq!(collect(&PerChannelBitStrategy, flags), [5, 255]);
        // Bit 0 is not a channel.
        assert!(flags.is_set(0));
    }
}
