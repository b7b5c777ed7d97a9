// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Splitting a GPADL range list across a header message and body messages,
//! and reassembling it on the receiving side.
//!
//! The range list is a sequence of 64-bit values. Each range starts with a
//! value holding `byte_count` in the low half and `byte_offset` in the high
//! half, followed by one page number per page the range touches.

use crate::OutgoingMessage;
use crate::protocol::ChannelId;
use crate::protocol::GpadlBody;
use crate::protocol::GpadlHeader;
use crate::protocol::GpadlId;
use thiserror::Error;
use zerocopy::IntoBytes;

const PAGE_SIZE: u64 = 4096;

/// The most pages a single-range GPADL can describe: the header's 16-bit
/// length field must cover the range value and every page number.
pub const MAX_GPADL_PAGES: usize = (u16::MAX as usize / size_of::<u64>()) - 1;

/// Packs the first value of a range.
pub const fn range_header(byte_count: u32, byte_offset: u32) -> u64 {
    byte_count as u64 | (byte_offset as u64) << 32
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("a gpadl must describe at least one page")]
    Empty,
    #[error("{0} pages exceeds the gpadl limit of {MAX_GPADL_PAGES}")]
    TooManyPages(usize),
    #[error("byte count {byte_count:#x} does not match {pages} pages")]
    ByteCount { byte_count: u32, pages: usize },
}

/// The messages that register one single-range GPADL, in send order.
#[derive(Debug)]
pub struct GpadlMessages {
    messages: Vec<OutgoingMessage>,
}

impl GpadlMessages {
    /// Builds the messages for a buffer of `byte_count` bytes starting at the
    /// beginning of the first page of `pfns`.
    pub fn new(
        channel_id: ChannelId,
        gpadl_id: GpadlId,
        byte_count: u32,
        pfns: &[u64],
    ) -> Result<Self, BuildError> {
        if pfns.is_empty() {
            return Err(BuildError::Empty);
        }
        if pfns.len() > MAX_GPADL_PAGES {
            return Err(BuildError::TooManyPages(pfns.len()));
        }
        if byte_count == 0 || (byte_count as u64).div_ceil(PAGE_SIZE) != pfns.len() as u64 {
            return Err(BuildError::ByteCount {
                byte_count,
                pages: pfns.len(),
            });
        }

        let mut buf = Vec::with_capacity(pfns.len() + 1);
        buf.push(range_header(byte_count, 0));
        buf.extend_from_slice(pfns);

        // Split off the values that fit in the header.
        let (first, remaining) = if buf.len() > GpadlHeader::MAX_DATA_VALUES {
            buf.split_at(GpadlHeader::MAX_DATA_VALUES)
        } else {
            (buf.as_slice(), [].as_slice())
        };

        let header = GpadlHeader {
            channel_id,
            gpadl_id,
            len: (buf.len() * size_of::<u64>()) as u16,
            count: 1,
        };
        let mut messages = vec![OutgoingMessage::with_data(&header, first.as_bytes())];

        let body = GpadlBody { rsvd: 0, gpadl_id };
        messages.extend(
            remaining
                .chunks(GpadlBody::MAX_DATA_VALUES)
                .map(|chunk| OutgoingMessage::with_data(&body, chunk.as_bytes())),
        );
        Ok(Self { messages })
    }

    /// The header message followed by the body messages.
    pub fn messages(&self) -> &[OutgoingMessage] {
        &self.messages
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssembleError {
    #[error("gpadl data is not a multiple of 8 bytes")]
    Unaligned,
    #[error("gpadl length {0} is not a multiple of 8 bytes")]
    BadLength(u16),
    #[error("more gpadl data than the header announced")]
    Overflow,
    #[error("malformed range list")]
    BadRange,
}

/// A GPADL being received, one message at a time.
#[derive(Debug)]
pub struct GpadlAssembler {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    count: u16,
    expected: usize,
    values: Vec<u64>,
}

/// One reassembled range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpaRange {
    pub byte_count: u32,
    pub byte_offset: u32,
    pub pfns: Vec<u64>,
}

impl GpadlAssembler {
    /// Starts a GPADL from its header message and trailing data.
    pub fn new(header: &GpadlHeader, data: &[u8]) -> Result<Self, AssembleError> {
        if header.len as usize % size_of::<u64>() != 0 {
            return Err(AssembleError::BadLength(header.len));
        }
        let mut this = Self {
            channel_id: header.channel_id,
            gpadl_id: header.gpadl_id,
            count: header.count,
            expected: header.len as usize / size_of::<u64>(),
            values: Vec::new(),
        };
        this.add(data)?;
        Ok(this)
    }

    /// Appends the data of a body message.
    pub fn add_body(&mut self, data: &[u8]) -> Result<(), AssembleError> {
        self.add(data)
    }

    fn add(&mut self, data: &[u8]) -> Result<(), AssembleError> {
        if data.len() % size_of::<u64>() != 0 {
            return Err(AssembleError::Unaligned);
        }
        if self.values.len() + data.len() / size_of::<u64>() > self.expected {
            return Err(AssembleError::Overflow);
        }
        self.values.extend(
            data.chunks_exact(size_of::<u64>())
                .map(|v| u64::from_le_bytes(v.try_into().unwrap_or_default())),
        );
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.values.len() == self.expected
    }

    /// Decodes the complete range list.
    pub fn ranges(&self) -> Result<Vec<GpaRange>, AssembleError> {
        let mut ranges = Vec::with_capacity(self.count.into());
        let mut values = self.values.as_slice();
        for _ in 0..self.count {
            let (&first, rest) = values.split_first().ok_or(AssembleError::BadRange)?;
            let byte_count = first as u32;
            let byte_offset = (first >> 32) as u32;
            let pages = (byte_offset as u64 % PAGE_SIZE + byte_count as u64).div_ceil(PAGE_SIZE);
            if pages as usize > rest.len() {
                return Err(AssembleError::BadRange);
            }
            let (pfns, rest) = rest.split_at(pages as usize);
            ranges.push(GpaRange {
                byte_count,
                byte_offset,
                pfns: pfns.to_vec(),
            });
            values = rest;
        }
        if !values.is_empty() {
            return Err(AssembleError::BadRange);
        }
        Ok(ranges)
    }
}
