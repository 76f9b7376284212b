//! A sequential big-endian bit-level cursor over a borrowed byte buffer.
//!
//! All the syntax parsed by this crate is defined in terms of big-endian,
//! MSB-first bit fields, so this is the one reader shared by the RTP and
//! Program Stream layers.  The cursor only ever moves forward; callers that
//! need to inspect data ahead of the current position (e.g. the PES payload
//! length cross-check) do so against the underlying slice directly.

use std::cmp;

/// Error produced when a read or skip asks for more bits than the buffer
/// still holds.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct InsufficientData {
    /// number of bits the caller asked for
    pub requested: usize,
    /// number of bits actually remaining in the buffer
    pub available: usize,
}

/// Big-endian bit reader borrowing an underlying `&[u8]`.
///
/// The position is measured in bits from the start of the buffer, and never
/// decreases.
pub struct BitReader<'buf> {
    data: &'buf [u8],
    pos: usize,
}

impl<'buf> BitReader<'buf> {
    pub fn new(data: &'buf [u8]) -> BitReader<'buf> {
        BitReader { data, pos: 0 }
    }

    /// Reads the next `n` bits as an unsigned value, advancing the position.
    ///
    /// Panics if `n` is outside `1..=32`; that is a caller bug, not a
    /// property of the data.
    pub fn read(&mut self, n: u32) -> Result<u32, InsufficientData> {
        assert!((1..=32).contains(&n), "bit count {} outside 1..=32", n);
        let n = n as usize;
        if self.remaining() < n {
            return Err(InsufficientData {
                requested: n,
                available: self.remaining(),
            });
        }
        let mut value = 0u32;
        let mut left = n;
        while left > 0 {
            let byte = self.data[self.pos / 8];
            let offset = self.pos % 8;
            let take = cmp::min(8 - offset, left);
            let shift = 8 - offset - take;
            let mask = ((1u16 << take) - 1) as u8;
            value = (value << take) | u32::from((byte >> shift) & mask);
            self.pos += take;
            left -= take;
        }
        Ok(value)
    }

    /// Advances the position by `n` bits without materializing a value.
    pub fn skip(&mut self, n: usize) -> Result<(), InsufficientData> {
        if self.remaining() < n {
            return Err(InsufficientData {
                requested: n,
                available: self.remaining(),
            });
        }
        self.pos += n;
        Ok(())
    }

    /// Borrows the next `n` bytes of the underlying buffer, advancing the
    /// position past them.
    ///
    /// Panics unless the cursor is byte-aligned, which every structure in
    /// this crate guarantees at the points payload is extracted.
    pub fn take(&mut self, n: usize) -> Result<&'buf [u8], InsufficientData> {
        assert_eq!(self.pos % 8, 0, "cursor not byte-aligned");
        if self.remaining() < n * 8 {
            return Err(InsufficientData {
                requested: n * 8,
                available: self.remaining(),
            });
        }
        let start = self.pos / 8;
        self.pos += n * 8;
        Ok(&self.data[start..start + n])
    }

    /// Absolute position, in bits from the start of the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Absolute position in whole bytes; only meaningful while the cursor is
    /// byte-aligned.
    pub fn byte_position(&self) -> usize {
        self.pos / 8
    }

    /// Number of bits between the current position and the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len() * 8 - self.pos
    }
}
