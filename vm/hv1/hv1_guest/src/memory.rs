// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits and types for memory shared with the hypervisor and host.
//!
//! Everything here may be written concurrently by the other side, so access
//! goes through atomics rather than plain references.

use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE64: u64 = PAGE_SIZE as u64;

/// A mapped, physically addressable buffer visible to the host.
///
/// # Safety
/// The implementor must ensure that the VA region from `base()..base() + len()`
/// remains mapped and writable for its lifetime, and that `pfns()` describes
/// exactly the pages backing that region.
pub unsafe trait MappedDmaTarget: Send + Sync {
    /// The virtual address of the mapped memory.
    fn base(&self) -> *const u8;

    /// The length of the buffer in bytes.
    fn len(&self) -> usize;

    /// Guest page numbers of the buffer, in order.
    fn pfns(&self) -> &[u64];
}

struct SubRange {
    mem: Arc<dyn MappedDmaTarget>,
    offset: usize,
    len: usize,
}

// SAFETY: the bounds are checked in `MemoryBlock::subblock`, and the pages
// are a slice of the parent's.
unsafe impl MappedDmaTarget for SubRange {
    fn base(&self) -> *const u8 {
        self.mem.base().wrapping_add(self.offset)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn pfns(&self) -> &[u64] {
        let first = self.offset / PAGE_SIZE;
        let last = (self.offset + self.len).div_ceil(PAGE_SIZE);
        &self.mem.pfns()[first..last]
    }
}

/// A reference-counted view of a DMA buffer.
#[derive(Clone)]
pub struct MemoryBlock {
    base: *const u8,
    len: usize,
    mem: Arc<dyn MappedDmaTarget>,
}

// SAFETY: the target is Send + Sync and all access goes through atomics.
unsafe impl Send for MemoryBlock {}
// SAFETY: as above.
unsafe impl Sync for MemoryBlock {}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("len", &self.len)
            .field("pfns", &self.pfns())
            .finish()
    }
}

impl MemoryBlock {
    /// Wraps `mem`.
    pub fn new<T: 'static + MappedDmaTarget>(mem: T) -> Self {
        Self {
            base: mem.base(),
            len: mem.len(),
            mem: Arc::new(mem),
        }
    }

    /// Returns a view of `len` bytes starting at `offset`. Page-aligned
    /// offsets keep the view's PFN list exact.
    ///
    /// Panics if the range is out of bounds.
    pub fn subblock(&self, offset: usize, len: usize) -> Self {
        assert!(
            offset <= self.len && self.len - offset >= len,
            "subblock out of range"
        );
        Self::new(SubRange {
            mem: Arc::new(self.clone()),
            offset,
            len,
        })
    }

    pub fn base(&self) -> *const u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Guest page numbers backing the buffer.
    pub fn pfns(&self) -> &[u64] {
        self.mem.pfns()
    }

    /// Guest physical address of the first byte, assuming the buffer starts
    /// on a page boundary.
    pub fn gpa(&self) -> u64 {
        self.pfns()[0] * PAGE_SIZE64 + self.offset_in_page() as u64
    }

    /// Offset of the first byte within the first page.
    pub fn offset_in_page(&self) -> u32 {
        (self.base as usize % PAGE_SIZE) as u32
    }

    pub fn as_slice(&self) -> &[AtomicU8] {
        // SAFETY: the memory stays mapped for the lifetime of `mem`, and
        // AtomicU8 has the same layout as u8.
        unsafe { std::slice::from_raw_parts(self.base.cast(), self.len) }
    }

    /// Returns `count` 32-bit words starting at `offset`.
    ///
    /// Panics if the range is out of bounds or misaligned.
    pub fn as_u32_slice(&self, offset: usize, count: usize) -> &[AtomicU32] {
        let bytes = &self.as_slice()[offset..][..count * 4];
        assert_eq!(bytes.as_ptr() as usize % 4, 0, "misaligned atomic view");
        // SAFETY: in bounds and aligned per the checks above, and AtomicU32
        // has the same layout as u32.
        unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast(), count) }
    }

    pub fn read_at(&self, offset: usize, data: &mut [u8]) {
        let src = &self.as_slice()[offset..][..data.len()];
        for (d, s) in data.iter_mut().zip(src) {
            *d = s.load(Ordering::Relaxed);
        }
    }

    pub fn read_obj<T: FromBytes + IntoBytes + Immutable + KnownLayout>(&self, offset: usize) -> T {
        let mut obj = T::new_zeroed();
        self.read_at(offset, obj.as_mut_bytes());
        obj
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) {
        let dest = &self.as_slice()[offset..][..data.len()];
        for (d, s) in dest.iter().zip(data) {
            d.store(*s, Ordering::Relaxed);
        }
    }

    pub fn write_obj<T: IntoBytes + Immutable + KnownLayout>(&self, offset: usize, data: &T) {
        self.write_at(offset, data.as_bytes());
    }

    pub fn fill_at(&self, offset: usize, value: u8, len: usize) {
        for b in &self.as_slice()[offset..][..len] {
            b.store(value, Ordering::Relaxed);
        }
    }
}

// SAFETY: forwards to the wrapped block, which upholds the contract.
unsafe impl MappedDmaTarget for MemoryBlock {
    fn base(&self) -> *const u8 {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }

    fn pfns(&self) -> &[u64] {
        self.mem.pfns()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(4096))]
    struct Pages([AtomicU8; PAGE_SIZE * 2]);

    struct HeapTarget(Box<Pages>);

    // SAFETY: the box is never moved out of or freed while the target lives.
    unsafe impl MappedDmaTarget for HeapTarget {
        fn base(&self) -> *const u8 {
            self.0.0.as_ptr().cast()
        }

        fn len(&self) -> usize {
            PAGE_SIZE * 2
        }

        fn pfns(&self) -> &[u64] {
            &[40, 41]
        }
    }

    fn block() -> MemoryBlock {
        MemoryBlock::new(HeapTarget(Box::new(Pages(
            [0; PAGE_SIZE * 2].map(AtomicU8::new),
        ))))
    }

    #[test]
    fn subblock_pfns_and_offsets() {
        let mem = block();
        let second = mem.subblock(PAGE_SIZE, PAGE_SIZE);
        assert_eq!(second.pfns(), &[41]);
        assert_eq!(second.gpa(), 41 * PAGE_SIZE64);

        second.write_obj(8, &0xdead_beef_u32);
        assert_eq!(mem.read_obj::<u32>(PAGE_SIZE + 8), 0xdead_beef);
        assert_eq!(
            mem.as_u32_slice(PAGE_SIZE + 8, 1)[0].load(Ordering::Relaxed),
            0xdead_beef
        );
    }

    #[test]
    #[should_panic(expected = "subblock out of range")]
    fn subblock_out_of_range() {
        block().subblock(PAGE_SIZE, PAGE_SIZE + 1);
    }
}
