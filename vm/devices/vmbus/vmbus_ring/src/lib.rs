// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest side of the vmbus ring buffer.
//!
//! A channel owns two rings, one per direction. Each is a control page
//! followed by a circular data region whose size is a whole number of pages.
//! A packet is a [`PacketDescriptor`], an optional type specific header, the
//! payload padded to 8 bytes, and an 8-byte trailer whose upper half holds
//! the offset the packet started at.
//!
//! Packets are staged through a cursor and become visible to the host only
//! when the cursor is committed.

#![forbid(unsafe_code)]

pub mod gparange;
mod memory_block;

pub use memory_block::MemoryBlockRingBuffer;

use gparange::PagedRange;
use std::fmt::Debug;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Rings are sized in pages, and the control page is one page.
pub const PAGE_SIZE: usize = 4096;

/// Number of 32-bit words of the control page the ring touches.
pub const CONTROL_WORD_COUNT: usize = 32;

pub const PACKET_TYPE_IN_BAND: u16 = 6;
pub const PACKET_TYPE_TRANSFER_PAGES: u16 = 7;
pub const PACKET_TYPE_GPA_DIRECT: u16 = 9;
pub const PACKET_TYPE_COMPLETION: u16 = 0xb;

const FLAG_COMPLETION_REQUESTED: u16 = 1;

const DESCRIPTOR_SIZE: u32 = size_of::<PacketDescriptor>() as u32;
const EXTENDED_HEADER_SIZE: u32 = size_of::<ExtendedHeader>() as u32;
const TRAILER_SIZE: u32 = 8;

/// Bytes that always stay free, so that a full ring never looks empty.
const RESERVED_SIZE: u32 = 8;

/// The descriptor that starts every packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PacketDescriptor {
    pub packet_type: u16,
    /// Offset of the payload from the start of the packet, in 8-byte units.
    pub data_offset8: u16,
    /// Length of the packet without its trailer, in 8-byte units.
    pub length8: u16,
    pub flags: u16,
    pub transaction_id: u64,
}

/// Follows the descriptor of GPA direct and transfer page packets. `tag` is
/// the transfer page set ID, and zero for GPA direct.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
struct ExtendedHeader {
    tag: u16,
    reserved: u16,
    range_count: u32,
}

/// One range of a transfer page packet.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TransferPageRange {
    pub byte_count: u32,
    pub byte_offset: u32,
}

/// Control page words, by index.
#[derive(Copy, Clone, Debug)]
enum Word {
    WriteIndex = 0,
    ReadIndex = 1,
    InterruptMask = 2,
    PendingSendSize = 3,
}

/// The ring or a packet in it is not what the protocol allows.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("data region of {0:#x} bytes is not a whole number of pages")]
    RingSize(usize),
    #[error("control page holds fewer than 32 words")]
    ControlPage,
    #[error("ring index {0:#x} is out of range or misaligned")]
    Index(u32),
    #[error("{len} byte packet can never fit a {ring} byte ring")]
    PacketTooLarge { len: usize, ring: u32 },
    #[error("packet needs {needed} bytes but only {available} were written")]
    Overrun { needed: u32, available: u32 },
    #[error("descriptor data offset {offset8} and length {length8} disagree")]
    DescriptorLengths { offset8: u16, length8: u16 },
    #[error("unknown descriptor flags {0:#x}")]
    DescriptorFlags(u16),
    #[error("unknown packet type {0:#x}")]
    PacketType(u16),
    #[error("gpa direct packet without ranges")]
    NoRanges,
}

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("ring buffer empty")]
    Empty,
    #[error(transparent)]
    Corrupt(#[from] Error),
}

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    /// The packet does not fit until the host reads. Holds the bytes the
    /// packet needs, trailer included.
    #[error("ring buffer full, {0} bytes needed")]
    Full(usize),
    #[error(transparent)]
    Corrupt(#[from] Error),
}

/// An access past the end of a [`RingRange`].
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
#[error("ring range of {available} bytes accessed with {requested} bytes")]
pub struct AccessError {
    pub available: usize,
    pub requested: usize,
}

/// Memory backing one ring.
pub trait RingMem: Send {
    /// The control page words. The ring checks there are at least
    /// [`CONTROL_WORD_COUNT`] of them.
    fn control(&self) -> &[AtomicU32];

    /// Size of the data region in bytes.
    fn len(&self) -> usize;

    /// Copies out of the data region. The access never runs past `len()`.
    fn read_linear(&self, offset: usize, data: &mut [u8]);

    /// Copies into the data region. The access never runs past `len()`.
    fn write_linear(&self, offset: usize, data: &[u8]);
}

/// The data region plus its control words, with wrap-aware copies.
struct Region<M> {
    mem: M,
    size: u32,
}

impl<M: RingMem> Region<M> {
    fn new(mem: M) -> Result<Self, Error> {
        let len = mem.len();
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(Error::RingSize(len));
        }
        let size = u32::try_from(len).map_err(|_| Error::RingSize(len))?;
        if mem.control().len() < CONTROL_WORD_COUNT {
            return Err(Error::ControlPage);
        }
        Ok(Self { mem, size })
    }

    fn word(&self, word: Word) -> &AtomicU32 {
        &self.mem.control()[word as usize]
    }

    fn index(&self, word: Word, ordering: Ordering) -> Result<u32, Error> {
        let index = self.word(word).load(ordering);
        if index >= self.size || index % 8 != 0 {
            return Err(Error::Index(index));
        }
        Ok(index)
    }

    fn advance(&self, at: u32, by: u32) -> u32 {
        ((at as u64 + by as u64) % self.size as u64) as u32
    }

    /// Bytes written and not yet read.
    fn used(&self, write: u32, read: u32) -> u32 {
        if write >= read {
            write - read
        } else {
            self.size - read + write
        }
    }

    fn free(&self, write: u32, read: u32) -> u32 {
        self.size - self.used(write, read) - RESERVED_SIZE
    }

    /// Copies `data.len()` bytes starting at `at`, splitting at the end of
    /// the region.
    fn copy_out(&self, at: u32, data: &mut [u8]) {
        let at = at as usize;
        let (head, tail) = data.split_at_mut(data.len().min(self.mem.len() - at));
        self.mem.read_linear(at, head);
        if !tail.is_empty() {
            self.mem.read_linear(0, tail);
        }
    }

    fn copy_in(&self, at: u32, data: &[u8]) {
        let at = at as usize;
        let (head, tail) = data.split_at(data.len().min(self.mem.len() - at));
        self.mem.write_linear(at, head);
        if !tail.is_empty() {
            self.mem.write_linear(0, tail);
        }
    }

    fn read_obj<T: FromBytes + IntoBytes>(&self, at: u32) -> T {
        let mut obj = T::new_zeroed();
        self.copy_out(at, obj.as_mut_bytes());
        obj
    }
}

impl<M: RingMem> Debug for Region<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("size", &self.size)
            .field("write", self.word(Word::WriteIndex))
            .field("read", self.word(Word::ReadIndex))
            .field("interrupt_mask", self.word(Word::InterruptMask))
            .finish()
    }
}

/// A span of a ring's data region. It may wrap past the end.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RingRange {
    start: u32,
    len: u32,
}

impl RingRange {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, requested: usize) -> Result<(), AccessError> {
        if requested > self.len() {
            return Err(AccessError {
                available: self.len(),
                requested,
            });
        }
        Ok(())
    }

    /// Copies the first `data.len()` bytes of the range.
    pub fn read<M: RingMem>(
        &self,
        ring: &IncomingRing<M>,
        data: &mut [u8],
    ) -> Result<(), AccessError> {
        self.check(data.len())?;
        ring.region.copy_out(self.start, data);
        Ok(())
    }

    pub fn read_all<M: RingMem>(&self, ring: &IncomingRing<M>) -> Vec<u8> {
        let mut data = vec![0; self.len()];
        ring.region.copy_out(self.start, &mut data);
        data
    }

    /// Fills the start of the range with `data`.
    pub fn write<M: RingMem>(
        &self,
        ring: &OutgoingRing<M>,
        data: &[u8],
    ) -> Result<(), AccessError> {
        self.check(data.len())?;
        ring.region.copy_in(self.start, data);
        Ok(())
    }
}

/// How an incoming packet refers to its data.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IncomingPacketType {
    InBand,
    Completion,
    /// Range count and the encoded ranges.
    GpaDirect(u32, RingRange),
    /// Transfer page set ID, range count and the [`TransferPageRange`]s.
    TransferPages(u16, u32, RingRange),
}

#[derive(Debug)]
pub struct IncomingPacket {
    pub descriptor: PacketDescriptor,
    /// Set for completions and for packets that request one.
    pub transaction_id: Option<u64>,
    pub typ: IncomingPacketType,
    /// The descriptor and any type specific header, up to the payload.
    pub header: RingRange,
    /// The payload including its padding.
    pub payload: RingRange,
}

/// The receiving end of a ring.
#[derive(Debug)]
pub struct IncomingRing<M: RingMem> {
    region: Region<M>,
}

/// Read position within an [`IncomingRing`].
#[derive(Debug, Clone)]
pub struct ReadCursor {
    published: u32,
    next: u32,
    /// Write index last loaded with acquire ordering.
    write: u32,
}

impl ReadCursor {
    /// Puts back the packets read since the last commit.
    pub fn revert(&mut self) {
        self.next = self.published;
    }
}

impl<M: RingMem> IncomingRing<M> {
    /// Wraps `mem` with interrupts from the host masked.
    pub fn new(mem: M) -> Result<Self, Error> {
        let region = Region::new(mem)?;
        region.word(Word::InterruptMask).store(1, Ordering::Relaxed);
        Ok(Self { region })
    }

    /// Masking tells the host not to signal when it makes the ring
    /// non-empty.
    pub fn set_interrupt_mask(&self, masked: bool) {
        self.region
            .word(Word::InterruptMask)
            .store(masked.into(), Ordering::SeqCst);
    }

    pub fn incoming(&self) -> Result<ReadCursor, Error> {
        let read = self.region.index(Word::ReadIndex, Ordering::Relaxed)?;
        let write = self.region.index(Word::WriteIndex, Ordering::Acquire)?;
        Ok(ReadCursor {
            published: read,
            next: read,
            write,
        })
    }

    /// Whether a packet is waiting at the cursor. Reloads the write index
    /// once everything seen so far has been read.
    pub fn can_read(&self, cursor: &mut ReadCursor) -> Result<bool, Error> {
        if cursor.next == cursor.write {
            cursor.write = self.region.index(Word::WriteIndex, Ordering::Acquire)?;
        }
        Ok(cursor.next != cursor.write)
    }

    /// Parses the packet at the cursor and moves past it. The space is
    /// returned to the host by [`Self::commit_read`].
    pub fn read(&self, cursor: &mut ReadCursor) -> Result<IncomingPacket, ReadError> {
        if !self.can_read(cursor)? {
            return Err(ReadError::Empty);
        }
        let start = cursor.next;
        let available = self.region.used(cursor.write, start);
        let packet = self.parse(start, available)?;
        let len = packet.descriptor.length8 as u32 * 8;
        cursor.next = self.region.advance(start, len + TRAILER_SIZE);
        tracing::trace!(
            offset = start,
            len,
            packet_type = packet.descriptor.packet_type,
            "ring read"
        );
        Ok(packet)
    }

    fn parse(&self, start: u32, available: u32) -> Result<IncomingPacket, Error> {
        if available < DESCRIPTOR_SIZE + TRAILER_SIZE {
            return Err(Error::Overrun {
                needed: DESCRIPTOR_SIZE + TRAILER_SIZE,
                available,
            });
        }
        let descriptor: PacketDescriptor = self.region.read_obj(start);
        let PacketDescriptor {
            packet_type,
            data_offset8,
            length8,
            flags,
            transaction_id,
        } = descriptor;
        if data_offset8 < 2 || length8 < data_offset8 {
            return Err(Error::DescriptorLengths {
                offset8: data_offset8,
                length8,
            });
        }
        let header_len = data_offset8 as u32 * 8;
        let len = length8 as u32 * 8;
        if len + TRAILER_SIZE > available {
            return Err(Error::Overrun {
                needed: len + TRAILER_SIZE,
                available,
            });
        }
        if flags & !FLAG_COMPLETION_REQUESTED != 0 {
            return Err(Error::DescriptorFlags(flags));
        }

        let typ = match packet_type {
            PACKET_TYPE_IN_BAND => IncomingPacketType::InBand,
            PACKET_TYPE_COMPLETION => IncomingPacketType::Completion,
            PACKET_TYPE_GPA_DIRECT | PACKET_TYPE_TRANSFER_PAGES => {
                let ranges_start = DESCRIPTOR_SIZE + EXTENDED_HEADER_SIZE;
                if header_len < ranges_start {
                    return Err(Error::DescriptorLengths {
                        offset8: data_offset8,
                        length8,
                    });
                }
                let extended: ExtendedHeader =
                    self.region.read_obj(self.region.advance(start, DESCRIPTOR_SIZE));
                let ranges = RingRange {
                    start: self.region.advance(start, ranges_start),
                    len: header_len - ranges_start,
                };
                if packet_type == PACKET_TYPE_TRANSFER_PAGES {
                    IncomingPacketType::TransferPages(extended.tag, extended.range_count, ranges)
                } else if extended.range_count == 0 {
                    return Err(Error::NoRanges);
                } else {
                    IncomingPacketType::GpaDirect(extended.range_count, ranges)
                }
            }
            other => return Err(Error::PacketType(other)),
        };

        let wants_completion = flags & FLAG_COMPLETION_REQUESTED != 0;
        Ok(IncomingPacket {
            descriptor,
            transaction_id: (wants_completion || packet_type == PACKET_TYPE_COMPLETION)
                .then_some(transaction_id),
            typ,
            header: RingRange {
                start,
                len: header_len,
            },
            payload: RingRange {
                start: self.region.advance(start, header_len),
                len: len - header_len,
            },
        })
    }

    /// Publishes the read index past every packet read through `cursor`.
    /// Returns true if the host should be signalled because the free space
    /// just reached the pending send size it asked for.
    pub fn commit_read(&self, cursor: &mut ReadCursor) -> bool {
        if cursor.next == cursor.published {
            return false;
        }
        self.region
            .word(Word::ReadIndex)
            .store(cursor.next, Ordering::SeqCst);
        // Writers may ask for the ring size minus one, which can never be
        // free, so round down to the packet granularity.
        let pending = self
            .region
            .word(Word::PendingSendSize)
            .load(Ordering::SeqCst)
            & !7;
        let crossed = pending != 0
            && self
                .region
                .index(Word::WriteIndex, Ordering::SeqCst)
                .is_ok_and(|write| {
                    self.region.free(write, cursor.published) < pending
                        && self.region.free(write, cursor.next) >= pending
                });
        cursor.published = cursor.next;
        crossed
    }
}

/// An outgoing packet, without its payload.
#[derive(Debug)]
pub struct OutgoingPacket<'a> {
    pub transaction_id: u64,
    /// Payload length in bytes.
    pub size: usize,
    pub typ: OutgoingPacketType<'a>,
}

#[derive(Debug, Copy, Clone)]
pub enum OutgoingPacketType<'a> {
    InBandNoCompletion,
    InBandWithCompletion,
    Completion,
    /// References memory outside the ring. Always requests a completion.
    GpaDirect(&'a [PagedRange<'a>]),
}

impl OutgoingPacketType<'_> {
    /// The encoded descriptor and type specific header for a payload of
    /// `size` bytes, plus the packet length without its trailer. `None` if
    /// the lengths overflow the descriptor.
    fn encode_header(&self, transaction_id: u64, size: usize) -> Option<(Vec<u8>, u32)> {
        let (packet_type, flags, extended) = match *self {
            Self::InBandNoCompletion => (PACKET_TYPE_IN_BAND, 0, Vec::new()),
            Self::InBandWithCompletion => {
                (PACKET_TYPE_IN_BAND, FLAG_COMPLETION_REQUESTED, Vec::new())
            }
            Self::Completion => (PACKET_TYPE_COMPLETION, 0, Vec::new()),
            Self::GpaDirect(ranges) => {
                let mut words = Vec::new();
                for range in ranges {
                    range.encode_into(&mut words);
                }
                let header = ExtendedHeader {
                    tag: 0,
                    reserved: 0,
                    range_count: ranges.len() as u32,
                };
                let extended = [header.as_bytes(), words.as_bytes()].concat();
                (PACKET_TYPE_GPA_DIRECT, FLAG_COMPLETION_REQUESTED, extended)
            }
        };
        let header_len = DESCRIPTOR_SIZE as usize + extended.len();
        let len = header_len.checked_add(size)?.next_multiple_of(8);
        let descriptor = PacketDescriptor {
            packet_type,
            data_offset8: u16::try_from(header_len / 8).ok()?,
            length8: u16::try_from(len / 8).ok()?,
            flags,
            transaction_id,
        };
        let len = u32::try_from(len).ok()?;
        Some(([descriptor.as_bytes(), extended.as_slice()].concat(), len))
    }
}

/// The sending end of a ring.
#[derive(Debug)]
pub struct OutgoingRing<M: RingMem> {
    region: Region<M>,
}

/// Write position within an [`OutgoingRing`].
#[derive(Debug, Clone)]
pub struct WriteCursor {
    published: u32,
    next: u32,
    /// Read index last loaded with acquire ordering.
    read: u32,
}

impl WriteCursor {
    /// Drops the packets written since the last commit.
    pub fn revert(&mut self) {
        self.next = self.published;
    }
}

impl<M: RingMem> OutgoingRing<M> {
    pub fn new(mem: M) -> Result<Self, Error> {
        Ok(Self {
            region: Region::new(mem)?,
        })
    }

    pub fn outgoing(&self) -> Result<WriteCursor, Error> {
        let write = self.region.index(Word::WriteIndex, Ordering::Relaxed)?;
        let read = self.region.index(Word::ReadIndex, Ordering::Acquire)?;
        Ok(WriteCursor {
            published: write,
            next: write,
            read,
        })
    }

    /// Stages the descriptor, type specific header, zero padding and trailer
    /// of `packet` at the cursor and returns the range for its payload. The
    /// caller fills the payload, then publishes with [`Self::commit_write`].
    pub fn write(
        &self,
        cursor: &mut WriteCursor,
        packet: &OutgoingPacket<'_>,
    ) -> Result<RingRange, WriteError> {
        let (header, len) = packet
            .typ
            .encode_header(packet.transaction_id, packet.size)
            .ok_or(Error::PacketTooLarge {
                len: packet.size,
                ring: self.region.size,
            })?;
        let total = len + TRAILER_SIZE;
        if total > self.region.size - RESERVED_SIZE {
            return Err(Error::PacketTooLarge {
                len: total as usize,
                ring: self.region.size,
            }
            .into());
        }
        let start = cursor.next;
        if self.region.free(start, cursor.read) < total {
            cursor.read = self.region.index(Word::ReadIndex, Ordering::Acquire)?;
            if self.region.free(start, cursor.read) < total {
                return Err(WriteError::Full(total as usize));
            }
        }

        let header_len = header.len() as u32;
        let payload_end = header_len + packet.size as u32;
        self.region.copy_in(start, &header);
        self.region.copy_in(
            self.region.advance(start, payload_end),
            &[0; 7][..(len - payload_end) as usize],
        );
        let trailer = (start as u64) << 32;
        self.region
            .copy_in(self.region.advance(start, len), trailer.as_bytes());
        cursor.next = self.region.advance(start, total);
        tracing::trace!(offset = start, len = total, "ring write");
        Ok(RingRange {
            start: self.region.advance(start, header_len),
            len: packet.size as u32,
        })
    }

    /// Publishes the packets staged through `cursor`. Returns true if the
    /// host should be signalled: its interrupts are unmasked and it had
    /// drained the ring before these packets. A host that has not caught up
    /// will reach them without a signal.
    pub fn commit_write(&self, cursor: &mut WriteCursor) -> bool {
        if cursor.next == cursor.published {
            return false;
        }
        self.region
            .word(Word::WriteIndex)
            .store(cursor.next, Ordering::SeqCst);
        let masked = self.region.word(Word::InterruptMask).load(Ordering::SeqCst) != 0;
        let drained = self.region.word(Word::ReadIndex).load(Ordering::SeqCst) == cursor.published;
        cursor.published = cursor.next;
        !masked && drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gparange::parse_ranges;
    use hv1_guest::emulated::EmulatedMemory;
    use hv1_guest::memory::MemoryBlock;
    use std::sync::Arc;
    use test_with_tracing::test;

    struct TestRing {
        _mem: Arc<EmulatedMemory>,
        buffer: MemoryBlockRingBuffer,
    }

    impl TestRing {
        fn new(data_pages: usize) -> Self {
            let mem = EmulatedMemory::new(data_pages + 2);
            let block = MemoryBlock::new(mem.alloc((data_pages + 1) * PAGE_SIZE).unwrap());
            Self {
                _mem: mem,
                buffer: MemoryBlockRingBuffer::new(block),
            }
        }

        fn incoming(&self) -> IncomingRing<MemoryBlockRingBuffer> {
            IncomingRing::new(self.buffer.clone()).unwrap()
        }

        fn outgoing(&self) -> OutgoingRing<MemoryBlockRingBuffer> {
            OutgoingRing::new(self.buffer.clone()).unwrap()
        }

        fn word(&self, word: Word) -> u32 {
            self.buffer.control()[word as usize].load(Ordering::Relaxed)
        }

        fn set_word(&self, word: Word, value: u32) {
            self.buffer.control()[word as usize].store(value, Ordering::Relaxed);
        }

        fn set_indices(&self, index: u32) {
            self.set_word(Word::WriteIndex, index);
            self.set_word(Word::ReadIndex, index);
        }
    }

    /// Writes one inband packet. `None` if the ring is full.
    fn send<M: RingMem>(ring: &OutgoingRing<M>, data: &[u8]) -> Option<bool> {
        let mut cursor = ring.outgoing().unwrap();
        let packet = OutgoingPacket {
            transaction_id: 0,
            size: data.len(),
            typ: OutgoingPacketType::InBandNoCompletion,
        };
        match ring.write(&mut cursor, &packet) {
            Ok(range) => {
                range.write(ring, data).unwrap();
                Some(ring.commit_write(&mut cursor))
            }
            Err(WriteError::Full(_)) => None,
            Err(err) => panic!("{err}"),
        }
    }

    /// Reads one packet's payload, and whether committing asked for a
    /// signal.
    fn receive<M: RingMem>(ring: &IncomingRing<M>) -> (Vec<u8>, bool) {
        let mut cursor = ring.incoming().unwrap();
        let payload = ring.read(&mut cursor).unwrap().payload.read_all(ring);
        (payload, ring.commit_read(&mut cursor))
    }

    fn inband_len(payload: usize) -> u32 {
        (DESCRIPTOR_SIZE + TRAILER_SIZE) + payload.next_multiple_of(8) as u32
    }

    #[test]
    fn signals_only_when_unmasked_and_drained() {
        let ring = TestRing::new(4);
        let incoming = ring.incoming();
        let outgoing = ring.outgoing();

        // Masked on creation.
        assert_eq!(send(&outgoing, &[1, 2, 3]), Some(false));
        receive(&incoming);

        incoming.set_interrupt_mask(false);
        assert_eq!(send(&outgoing, &[1, 2, 3]), Some(true));
        assert_eq!(send(&outgoing, &[4]), Some(false));
        receive(&incoming);
        assert_eq!(send(&outgoing, &[5]), Some(false));
        receive(&incoming);
        receive(&incoming);
        assert_eq!(send(&outgoing, &[6]), Some(true));
    }

    #[test]
    fn uncommitted_writes_stay_hidden() {
        let ring = TestRing::new(1);
        let incoming = ring.incoming();
        let outgoing = ring.outgoing();
        let mut cursor = outgoing.outgoing().unwrap();
        outgoing
            .write(
                &mut cursor,
                &OutgoingPacket {
                    transaction_id: 0,
                    size: 8,
                    typ: OutgoingPacketType::InBandNoCompletion,
                },
            )
            .unwrap();
        assert_eq!(ring.word(Word::WriteIndex), 0);
        assert_eq!(
            incoming.read(&mut incoming.incoming().unwrap()).unwrap_err(),
            ReadError::Empty
        );
        cursor.revert();
        assert!(!outgoing.commit_write(&mut cursor));
        assert_eq!(ring.word(Word::WriteIndex), 0);
    }

    #[test]
    fn copies_split_at_the_end_of_the_region() {
        const SIZE: u32 = PAGE_SIZE as u32;
        let ring = TestRing::new(1);
        let region = Region::new(ring.buffer.clone()).unwrap();
        for len in [1, SIZE as usize / 2, SIZE as usize - 1] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8 + 1).collect();
            for at in 0..SIZE {
                region.copy_in(at, &data);
                let mut back = vec![0; len];
                region.copy_out(at, &mut back);
                assert_eq!(back, data, "offset {at} len {len}");

                let mut last = [0];
                region.copy_out(region.advance(at, len as u32 - 1), &mut last);
                assert_eq!(last[0], data[len - 1]);
                if at as usize + len > SIZE as usize {
                    let mut first = [0];
                    region.copy_out(0, &mut first);
                    assert_eq!(first[0], data[(SIZE - at) as usize]);
                }
            }
        }
    }

    #[test]
    fn packets_wrap_at_every_write_offset() {
        const SIZE: u32 = PAGE_SIZE as u32;
        let ring = TestRing::new(1);
        let incoming = ring.incoming();
        let outgoing = ring.outgoing();
        let largest = (SIZE - RESERVED_SIZE - inband_len(0)) as usize;
        for len in [1, SIZE as usize / 2, largest] {
            let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
            for start in (0..SIZE).step_by(8) {
                ring.set_indices(start);
                send(&outgoing, &data).unwrap();

                let total = inband_len(len);
                assert_eq!(ring.word(Word::WriteIndex), (start + total) % SIZE);
                let trailer: u64 = Region::new(ring.buffer.clone())
                    .unwrap()
                    .read_obj((start + total - TRAILER_SIZE) % SIZE);
                assert_eq!(trailer, (start as u64) << 32);

                let (payload, _) = receive(&incoming);
                assert_eq!(payload.len(), len.next_multiple_of(8));
                assert_eq!(&payload[..len], data.as_slice(), "start {start} len {len}");
                assert!(payload[len..].iter().all(|&b| b == 0));
                assert_eq!(ring.word(Word::ReadIndex), ring.word(Word::WriteIndex));
            }
        }
    }

    #[test]
    fn indices_stay_in_bounds() {
        const SIZE: u32 = 2 * PAGE_SIZE as u32;
        let ring = TestRing::new(2);
        let incoming = ring.incoming();
        let outgoing = ring.outgoing();

        let mut queued = std::collections::VecDeque::new();
        let mut seed = 0x1234_5678u32;
        for i in 0..2000u32 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let len = (seed >> 16) as usize % 1500 + 1;
            if seed & 1 == 0 || queued.is_empty() {
                let data = vec![i as u8; len];
                if send(&outgoing, &data).is_some() {
                    queued.push_back(data);
                }
            } else {
                let (payload, _) = receive(&incoming);
                let expected = queued.pop_front().unwrap();
                assert_eq!(&payload[..expected.len()], expected.as_slice());
            }
            for word in [Word::WriteIndex, Word::ReadIndex] {
                let index = ring.word(word);
                assert!(index < SIZE && index % 8 == 0);
            }
        }
        while let Some(expected) = queued.pop_front() {
            assert_eq!(&receive(&incoming).0[..expected.len()], expected.as_slice());
        }
        let mut cursor = incoming.incoming().unwrap();
        assert_eq!(incoming.read(&mut cursor).unwrap_err(), ReadError::Empty);
    }

    #[test]
    fn full_and_oversized_packets() {
        let ring = TestRing::new(1);
        let outgoing = ring.outgoing();
        let mut cursor = outgoing.outgoing().unwrap();
        let packet = OutgoingPacket {
            transaction_id: 0,
            size: 2040,
            typ: OutgoingPacketType::InBandNoCompletion,
        };
        outgoing.write(&mut cursor, &packet).unwrap();
        assert_eq!(
            outgoing.write(&mut cursor, &packet).unwrap_err(),
            WriteError::Full(inband_len(2040) as usize)
        );

        let oversized = OutgoingPacket {
            size: PAGE_SIZE,
            ..packet
        };
        assert!(matches!(
            outgoing.write(&mut outgoing.outgoing().unwrap(), &oversized),
            Err(WriteError::Corrupt(Error::PacketTooLarge { .. }))
        ));
    }

    #[test]
    fn host_draining_the_ring_frees_space() {
        let ring = TestRing::new(1);
        let incoming = ring.incoming();
        let outgoing = ring.outgoing();
        assert!(send(&outgoing, &[1; 2040]).is_some());
        assert!(send(&outgoing, &[2; 2040]).is_none());
        receive(&incoming);
        assert!(send(&outgoing, &[2; 2040]).is_some());
    }

    #[test]
    fn commit_read_signals_when_pending_send_size_is_reached() {
        let ring = TestRing::new(4);
        let incoming = ring.incoming();
        let outgoing = ring.outgoing();
        for byte in 1..=4 {
            send(&outgoing, &[byte; 4000]).unwrap();
        }
        assert!(send(&outgoing, &[5; 4000]).is_none());
        assert!(!receive(&incoming).1);
        send(&outgoing, &[5; 4000]).unwrap();

        // The host waits for room for two packets. Round down the low bits.
        ring.set_word(Word::PendingSendSize, inband_len(4000) * 2 + 3);
        assert!(!receive(&incoming).1);
        assert!(receive(&incoming).1);
        assert!(!receive(&incoming).1);
    }

    #[test]
    fn rejects_corrupt_packets() {
        let ring = TestRing::new(1);
        let incoming = ring.incoming();
        let region = Region::new(ring.buffer.clone()).unwrap();
        let read = |descriptor: PacketDescriptor, written: u32| {
            ring.set_indices(0);
            region.copy_in(0, descriptor.as_bytes());
            ring.set_word(Word::WriteIndex, written);
            incoming.read(&mut incoming.incoming().unwrap()).unwrap_err()
        };
        let good = PacketDescriptor {
            packet_type: PACKET_TYPE_IN_BAND,
            data_offset8: 2,
            length8: 4,
            flags: 0,
            transaction_id: 0,
        };
        let corrupt = |err| ReadError::Corrupt(err);

        assert_eq!(
            read(
                PacketDescriptor {
                    data_offset8: 1,
                    ..good
                },
                64
            ),
            corrupt(Error::DescriptorLengths {
                offset8: 1,
                length8: 4
            })
        );
        assert_eq!(
            read(PacketDescriptor { length8: 1, ..good }, 64),
            corrupt(Error::DescriptorLengths {
                offset8: 2,
                length8: 1
            })
        );
        assert_eq!(
            read(good, 32),
            corrupt(Error::Overrun {
                needed: 40,
                available: 32
            })
        );
        assert_eq!(
            read(good, 8),
            corrupt(Error::Overrun {
                needed: 24,
                available: 8
            })
        );
        assert_eq!(
            read(PacketDescriptor { flags: 2, ..good }, 64),
            corrupt(Error::DescriptorFlags(2))
        );
        assert_eq!(
            read(
                PacketDescriptor {
                    packet_type: 3,
                    ..good
                },
                64
            ),
            corrupt(Error::PacketType(3))
        );
        assert_eq!(
            read(
                PacketDescriptor {
                    packet_type: PACKET_TYPE_GPA_DIRECT,
                    ..good
                },
                64
            ),
            corrupt(Error::DescriptorLengths {
                offset8: 2,
                length8: 4
            })
        );

        ring.set_word(Word::WriteIndex, 12);
        assert_eq!(incoming.incoming().unwrap_err(), Error::Index(12));
    }

    #[test]
    fn gpa_direct_ranges_round_trip() {
        let ring = TestRing::new(2);
        let incoming = ring.incoming();
        let outgoing = ring.outgoing();
        let gpns = [0x10, 0x11, 0x40];
        let ranges = [
            PagedRange::new(0x800, 0x1000, &gpns[..2]).unwrap(),
            PagedRange::new(0, 0x20, &gpns[2..]).unwrap(),
        ];
        let mut cursor = outgoing.outgoing().unwrap();
        outgoing
            .write(
                &mut cursor,
                &OutgoingPacket {
                    transaction_id: 7,
                    size: 4,
                    typ: OutgoingPacketType::GpaDirect(&ranges),
                },
            )
            .unwrap()
            .write(&outgoing, &[9; 4])
            .unwrap();
        outgoing.commit_write(&mut cursor);

        let mut cursor = incoming.incoming().unwrap();
        let packet = incoming.read(&mut cursor).unwrap();
        assert_eq!(packet.transaction_id, Some(7));
        assert_eq!(packet.descriptor.flags, FLAG_COMPLETION_REQUESTED);
        let IncomingPacketType::GpaDirect(count, encoded) = packet.typ else {
            panic!("{:?}", packet.typ);
        };
        let words: Vec<u64> = encoded
            .read_all(&incoming)
            .chunks_exact(8)
            .map(|w| u64::from_le_bytes(w.try_into().unwrap()))
            .collect();
        assert_eq!(parse_ranges(count as usize, &words).unwrap(), ranges);
        assert_eq!(packet.payload.read_all(&incoming)[..4], [9; 4]);
        // Descriptor, extended header, two range headers and three pages.
        assert_eq!(packet.header.len(), 16 + 8 + 8 * 5);
    }

    #[test]
    fn transfer_page_packets_are_parsed() {
        let ring = TestRing::new(1);
        let incoming = ring.incoming();
        let region = Region::new(ring.buffer.clone()).unwrap();
        let descriptor = PacketDescriptor {
            packet_type: PACKET_TYPE_TRANSFER_PAGES,
            data_offset8: 4,
            length8: 4,
            flags: FLAG_COMPLETION_REQUESTED,
            transaction_id: 8,
        };
        let extended = ExtendedHeader {
            tag: 3,
            reserved: 0xffff,
            range_count: 1,
        };
        let range = TransferPageRange {
            byte_count: 10,
            byte_offset: 20,
        };
        region.copy_in(
            0,
            &[descriptor.as_bytes(), extended.as_bytes(), range.as_bytes()].concat(),
        );
        ring.set_word(Word::WriteIndex, 32 + TRAILER_SIZE);

        let mut cursor = incoming.incoming().unwrap();
        let packet = incoming.read(&mut cursor).unwrap();
        assert_eq!(packet.transaction_id, Some(8));
        let IncomingPacketType::TransferPages(3, 1, ranges) = packet.typ else {
            panic!("{:?}", packet.typ);
        };
        assert_eq!(ranges.read_all(&incoming), range.as_bytes());
        assert!(packet.payload.is_empty());
        incoming.commit_read(&mut cursor);
        assert_eq!(ring.word(Word::ReadIndex), 40);
    }

    #[test]
    fn range_access_is_bounded() {
        let ring = TestRing::new(1);
        let incoming = ring.incoming();
        send(&ring.outgoing(), &[1; 8]).unwrap();
        let packet = incoming.read(&mut incoming.incoming().unwrap()).unwrap();
        assert_eq!(
            packet.payload.read(&incoming, &mut [0; 9]),
            Err(AccessError {
                available: 8,
                requested: 9
            })
        );
        let mut four = [0; 4];
        packet.payload.read(&incoming, &mut four).unwrap();
        assert_eq!(four, [1; 4]);
    }

    #[test]
    fn concurrent_reader_sees_whole_packets() {
        const PACKETS: u32 = 5000;
        let ring = TestRing::new(2);
        let incoming = ring.incoming();
        let outgoing = ring.outgoing();

        let reader = std::thread::spawn(move || {
            let mut seen = 0;
            while seen < PACKETS {
                let mut cursor = incoming.incoming().unwrap();
                while let Ok(packet) = incoming.read(&mut cursor) {
                    let payload = packet.payload.read_all(&incoming);
                    let len = (seen % 200 + 1) as usize;
                    assert!(
                        payload[..len].iter().all(|&b| b == seen as u8),
                        "packet {seen} torn"
                    );
                    seen += 1;
                }
                incoming.commit_read(&mut cursor);
            }
        });

        let mut sent = 0;
        while sent < PACKETS {
            let len = (sent % 200 + 1) as usize;
            if send(&outgoing, &vec![sent as u8; len]).is_some() {
                sent += 1;
            } else {
                std::thread::yield_now();
            }
        }
        reader.join().unwrap();
    }
}
