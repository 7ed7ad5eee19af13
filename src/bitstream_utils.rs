// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::io::Cursor;
use std::io::Read;

use byteorder::BigEndian;
use byteorder::ByteOrder;
use thiserror::Error;

/// Delimiter written in front of every NAL unit we emit.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Returns the position of the next `00 00 01` pattern in `data`, starting at `from`.
pub fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }

    data[from..]
        .windows(3)
        .position(|window| window == [0x00, 0x00, 0x01])
        .map(|pos| pos + from)
}

/// Whether `data` already uses delimiter framing, i.e. starts with a 3 or 4 bytes start code.
pub fn is_delimiter_framed(data: &[u8]) -> bool {
    data.starts_with(&[0x00, 0x00, 0x01]) || data.starts_with(&START_CODE)
}

/// A bit reader for codec bitstreams. It properly handles emulation-prevention
/// bytes and stop bits for H264.
#[derive(Clone)]
pub(crate) struct BitReader<'a> {
    /// A reference into the next unread byte in the stream.
    data: Cursor<&'a [u8]>,
    /// Contents of the current byte. First unread bit starting at position 8 -
    /// num_remaining_bits_in_curr_bytes.
    curr_byte: u8,
    /// Number of bits remaining in `curr_byte`
    num_remaining_bits_in_curr_byte: usize,
    /// Used in emulation prevention byte detection.
    prev_two_bytes: u16,
    /// Number of emulation prevention bytes (i.e. 0x000003) we found.
    num_epb: usize,
    /// Whether or not we need emulation prevention logic.
    needs_epb: bool,
}

#[derive(Debug)]
pub(crate) enum ReadBitsError {
    TooManyBitsRequested(usize),
    OutOfBits,
    InvalidExpGolomb,
}

impl fmt::Display for ReadBitsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReadBitsError::TooManyBitsRequested(bits) => {
                write!(f, "more than 31 ({}) bits were requested", bits)
            }
            ReadBitsError::OutOfBits => write!(f, "reader ran out of bits"),
            ReadBitsError::InvalidExpGolomb => write!(f, "invalid exp-golomb code"),
        }
    }
}

impl std::error::Error for ReadBitsError {}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8], needs_epb: bool) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: Default::default(),
            num_remaining_bits_in_curr_byte: Default::default(),
            prev_two_bytes: 0xffff,
            num_epb: Default::default(),
            needs_epb,
        }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> Result<bool, ReadBitsError> {
        Ok(self.read_bits(1)? == 1)
    }

    /// Read up to 31 bits from the stream.
    pub fn read_bits(&mut self, num_bits: usize) -> Result<u32, ReadBitsError> {
        if num_bits > 31 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        let mut bits_left = num_bits;
        let mut out = 0u32;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= (self.curr_byte as u32) << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.move_to_next_byte()?;
        }

        out |= (self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left)) as u32;
        out &= (1 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;

        Ok(out)
    }

    /// Reads an Unsigned Exponential golomb coding number from the next bytes in the
    /// bitstream. See H264 Annex B specification 9.1 for details.
    pub fn read_ue(&mut self) -> Result<u32, ReadBitsError> {
        let mut num_bits = 0;

        while self.read_bits(1)? == 0 {
            num_bits += 1;
            if num_bits > 31 {
                return Err(ReadBitsError::InvalidExpGolomb);
            }
        }

        ((1u32 << num_bits) - 1)
            .checked_add(self.read_bits(num_bits)?)
            .ok_or(ReadBitsError::InvalidExpGolomb)
    }

    fn get_byte(&mut self) -> Result<u8, ReadBitsError> {
        let mut buf = [0u8; 1];
        self.data
            .read_exact(&mut buf)
            .map_err(|_| ReadBitsError::OutOfBits)?;
        Ok(buf[0])
    }

    fn move_to_next_byte(&mut self) -> Result<(), ReadBitsError> {
        let mut byte = self.get_byte()?;

        if self.needs_epb {
            if self.prev_two_bytes == 0 && byte == 0x03 {
                // We found an epb
                self.num_epb += 1;
                // Read another byte
                byte = self.get_byte()?;
                // We need another 3 bytes before another epb can happen.
                self.prev_two_bytes = 0xffff;
            }
            self.prev_two_bytes = (self.prev_two_bytes << 8) | u16::from(byte);
        }

        self.num_remaining_bits_in_curr_byte = 8;
        self.curr_byte = byte;
        Ok(())
    }
}

/// Iterator over the raw NAL units of a delimiter-framed buffer, without parsing their headers.
///
/// Yields the NAL units without start codes or trailing zero bytes. Bytes before the first start
/// code are skipped.
pub struct AnnexBUnits<'a> {
    data: &'a [u8],
    next: Option<usize>,
}

impl<'a> AnnexBUnits<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            next: find_start_code(data, 0),
        }
    }
}

impl<'a> Iterator for AnnexBUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let start = self.next? + 3;
            self.next = find_start_code(self.data, start);

            let mut end = self.next.unwrap_or(self.data.len());
            while end > start && self.data[end - 1] == 0x00 {
                end -= 1;
            }

            // Skip empty units, e.g. two back to back start codes.
            if end > start {
                return Some(&self.data[start..end]);
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LengthPrefixError {
    #[error("unsupported length prefix size {0}")]
    InvalidPrefixSize(usize),
    #[error("truncated length prefix at offset {offset}")]
    TruncatedPrefix { offset: usize },
    #[error("NAL unit at offset {offset} claims {len} bytes but only {remaining} remain")]
    Overrun {
        offset: usize,
        len: usize,
        remaining: usize,
    },
}

/// Iterator over the NAL units of a length-prefixed (container style) access unit.
///
/// Yields the NAL unit payloads, without their prefix. Iteration stops after the first error.
pub struct LengthPrefixedIterator<'a> {
    data: &'a [u8],
    pos: usize,
    prefix_size: usize,
    failed: bool,
}

impl<'a> LengthPrefixedIterator<'a> {
    pub fn new(data: &'a [u8], prefix_size: usize) -> Self {
        Self {
            data,
            pos: 0,
            prefix_size,
            failed: false,
        }
    }
}

impl<'a> Iterator for LengthPrefixedIterator<'a> {
    type Item = Result<&'a [u8], LengthPrefixError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }

        let result = read_length_prefixed(self.data, self.pos, self.prefix_size);
        match &result {
            Ok(nalu) => self.pos += self.prefix_size + nalu.len(),
            Err(_) => self.failed = true,
        }

        Some(result)
    }
}

/// Reads the NAL unit whose length prefix starts at `offset` in `data`.
pub(crate) fn read_length_prefixed(
    data: &[u8],
    offset: usize,
    prefix_size: usize,
) -> Result<&[u8], LengthPrefixError> {
    if !(1..=4).contains(&prefix_size) {
        return Err(LengthPrefixError::InvalidPrefixSize(prefix_size));
    }
    if data.len() - offset < prefix_size {
        return Err(LengthPrefixError::TruncatedPrefix { offset });
    }

    let len = BigEndian::read_uint(&data[offset..], prefix_size) as usize;
    let start = offset + prefix_size;
    let remaining = data.len() - start;
    if len > remaining {
        return Err(LengthPrefixError::Overrun {
            offset,
            len,
            remaining,
        });
    }

    Ok(&data[start..start + len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_code_search() {
        let data = [0xaa, 0x00, 0x00, 0x01, 0x65, 0x00, 0x00, 0x00, 0x01, 0x41];
        assert_eq!(find_start_code(&data, 0), Some(1));
        assert_eq!(find_start_code(&data, 2), Some(6));
        assert_eq!(find_start_code(&data, 7), None);
        assert_eq!(find_start_code(&data, 100), None);
        assert!(is_delimiter_framed(&data[1..]));
        assert!(is_delimiter_framed(&data[5..]));
        assert!(!is_delimiter_framed(&data));
    }

    #[test]
    fn length_prefixed_units() {
        let data = [0, 2, 0x65, 0x88, 0, 1, 0x41];
        let units = LengthPrefixedIterator::new(&data, 2)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(units, vec![&[0x65, 0x88][..], &[0x41][..]]);
    }

    #[test]
    fn length_prefix_overrun_is_an_error() {
        let data = [0, 0, 0, 9, 0x65, 0x88];
        let mut iter = LengthPrefixedIterator::new(&data, 4);
        assert_eq!(
            iter.next(),
            Some(Err(LengthPrefixError::Overrun {
                offset: 0,
                len: 9,
                remaining: 2
            }))
        );
        assert_eq!(iter.next(), None);

        let mut iter = LengthPrefixedIterator::new(&data[..2], 4);
        assert_eq!(
            iter.next(),
            Some(Err(LengthPrefixError::TruncatedPrefix { offset: 0 }))
        );
        assert_eq!(
            LengthPrefixedIterator::new(&data, 5).next(),
            Some(Err(LengthPrefixError::InvalidPrefixSize(5)))
        );
    }

    #[test]
    fn annex_b_units_skip_garbage_and_empty_units() {
        let data = [
            0xde, 0xad, // leading garbage
            0x00, 0x00, 0x01, 0x09, 0xf0, //
            0x00, 0x00, 0x01, // empty unit
            0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x00, 0x00,
        ];
        let units = AnnexBUnits::new(&data).collect::<Vec<_>>();
        assert_eq!(units, vec![&[0x09, 0xf0][..], &[0x65, 0x88][..]]);

        assert_eq!(AnnexBUnits::new(&[0x65, 0x88]).count(), 0);
    }

    // Check that read_ue behaves properly with input at the limits.
    #[test]
    fn read_ue() {
        // Regular value.
        let mut reader = BitReader::new(&[0b0001_1010], true);
        assert_eq!(reader.read_ue().unwrap(), 12);
        assert_eq!(reader.num_remaining_bits_in_curr_byte, 1);

        // 0 value.
        let mut reader = BitReader::new(&[0b1000_0000], true);
        assert_eq!(reader.read_ue().unwrap(), 0);
        assert_eq!(reader.num_remaining_bits_in_curr_byte, 7);

        // No prefix stop bit.
        let mut reader = BitReader::new(&[0b0000_0000], true);
        reader.read_ue().unwrap_err();
    }

    // Check that emulation prevention is being handled correctly.
    #[test]
    fn skip_epb_when_enabled() {
        let mut reader = BitReader::new(&[0x00, 0x00, 0x03, 0x01], false);
        assert_eq!(reader.read_bits(8).unwrap(), 0x00);
        assert_eq!(reader.read_bits(8).unwrap(), 0x00);
        assert_eq!(reader.read_bits(8).unwrap(), 0x03);
        assert_eq!(reader.read_bits(8).unwrap(), 0x01);

        let mut reader = BitReader::new(&[0x00, 0x00, 0x03, 0x01], true);
        assert_eq!(reader.read_bits(8).unwrap(), 0x00);
        assert_eq!(reader.read_bits(8).unwrap(), 0x00);
        assert_eq!(reader.read_bits(8).unwrap(), 0x01);
        assert_eq!(reader.num_epb, 1);
    }
}
