// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Page ranges referenced by GPA direct packets.
//!
//! On the ring a range is one word holding the byte count in its low half
//! and the offset into the first page in its high half, followed by one word
//! per page.

use thiserror::Error;

const PAGE_SIZE: usize = 4096;

/// A byte range spread over a list of guest pages.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PagedRange<'a> {
    offset: usize,
    len: usize,
    gpns: &'a [u64],
}

impl<'a> PagedRange<'a> {
    /// Returns `None` unless `gpns` holds exactly the pages that `len` bytes
    /// starting `offset` bytes into the first page touch.
    pub fn new(offset: usize, len: usize, gpns: &'a [u64]) -> Option<Self> {
        let valid = offset < PAGE_SIZE
            && len > 0
            && u32::try_from(len).is_ok()
            && (offset + len).div_ceil(PAGE_SIZE) == gpns.len();
        valid.then_some(Self { offset, len, gpns })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn gpns(&self) -> &'a [u64] {
        self.gpns
    }

    /// Appends the ring encoding of this range to `words`.
    pub fn encode_into(&self, words: &mut Vec<u64>) {
        words.push(self.len as u64 | (self.offset as u64) << 32);
        words.extend_from_slice(self.gpns);
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("range list ends after {0} ranges")]
    Missing(usize),
    #[error("range {0} has no bytes")]
    Empty(usize),
    #[error("range {index} needs {needed} pages but {available} remain")]
    Short {
        index: usize,
        needed: usize,
        available: usize,
    },
}

/// Decodes `count` ranges from the front of `words`.
pub fn parse_ranges(count: usize, words: &[u64]) -> Result<Vec<PagedRange<'_>>, RangeError> {
    let mut rest = words;
    (0..count)
        .map(|index| {
            let (&header, tail) = rest.split_first().ok_or(RangeError::Missing(index))?;
            let len = header as u32 as usize;
            let offset = (header >> 32) as usize % PAGE_SIZE;
            if len == 0 {
                return Err(RangeError::Empty(index));
            }
            let needed = (offset + len).div_ceil(PAGE_SIZE);
            if tail.len() < needed {
                return Err(RangeError::Short {
                    index,
                    needed,
                    available: tail.len(),
                });
            }
            let (gpns, tail) = tail.split_at(needed);
            rest = tail;
            Ok(PagedRange { offset, len, gpns })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn new_checks_page_count() {
        assert!(PagedRange::new(0, 4096, &[1]).is_some());
        assert!(PagedRange::new(1, 4096, &[1]).is_none());
        assert!(PagedRange::new(1, 4096, &[1, 2]).is_some());
        assert!(PagedRange::new(0, 0, &[]).is_none());
        assert!(PagedRange::new(4096, 1, &[1]).is_none());
    }

    #[test]
    fn encoded_ranges_parse_back() {
        let mut words = Vec::new();
        let a = PagedRange::new(0xff8, 0x10, &[7, 8]).unwrap();
        let b = PagedRange::new(0, 4096, &[9]).unwrap();
        a.encode_into(&mut words);
        b.encode_into(&mut words);
        assert_eq!(words, [0x10 | (0xff8 << 32), 7, 8, 4096, 9]);
        assert_eq!(parse_ranges(2, &words).unwrap(), [a, b]);
    }

    #[test]
    fn malformed_lists_are_rejected() {
        let words = [0x10 | (0xff8 << 32), 7, 8];
        assert_eq!(parse_ranges(2, &words).unwrap_err(), RangeError::Missing(1));
        assert_eq!(parse_ranges(1, &[0, 1]).unwrap_err(), RangeError::Empty(0));
        assert_eq!(
            parse_ranges(1, &[8193]).unwrap_err(),
            RangeError::Short {
                index: 0,
                needed: 3,
                available: 0
            }
        );
    }
}
