// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Access-unit assembler.
//!
//! Turns delimiter-framed data split at arbitrary points into complete access units. A NAL unit
//! is only known to be complete once the start code of the following one has been seen, so an
//! access unit is emitted as soon as the header of the first NAL unit of the next one arrives,
//! when an end of sequence/stream unit closes it, or on [`Assembler::flush`].
//!
//! Each emitted unit takes the timestamps of the packet its first NAL unit came from. A packet's
//! timestamps are used at most once: when a packet carries several access units, only the first
//! one gets them.

use std::collections::VecDeque;

use log::debug;
use thiserror::Error;

use crate::bitstream_utils::find_start_code;
use crate::codec;
use crate::stream::AccessUnit;
use crate::stream::Packet;
use crate::EncodedFormat;

#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error("corrupt NAL unit at offset {offset}: {source:#}")]
    CorruptNalu {
        offset: u64,
        source: anyhow::Error,
    },
    #[error("partial access unit exceeds {0} bytes")]
    Overflow(usize),
    #[error("parser state is corrupt and must be reset")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, AssemblerError>;

/// Where a packet landed in the assembler buffer.
#[derive(Debug)]
struct ChunkInfo {
    /// Absolute offset of the first byte of the packet.
    start: u64,
    pts: Option<i64>,
    dts: Option<i64>,
    keyframe: bool,
    pos: Option<u64>,
    used: bool,
}

pub struct Assembler {
    codec: EncodedFormat,
    max_pending_bytes: usize,

    /// Unconsumed data. `buf[0]` is at absolute offset `base`.
    buf: Vec<u8>,
    base: u64,
    /// Bytes at the start of `buf` holding the complete NAL units of the unit being built.
    au_len: usize,
    /// Absolute offset of the first NAL payload of the unit being built.
    au_start: Option<u64>,
    au_vcl: bool,
    au_keyframe: bool,
    /// Where to resume the search for the end of the current NAL unit.
    scan: usize,
    /// Whether a start code has been found since the last reset.
    synced: bool,
    chunks: VecDeque<ChunkInfo>,

    keyframe_seen: bool,
    poisoned: bool,
    discarded: u64,
}

impl Assembler {
    pub fn new(codec: EncodedFormat, max_pending_bytes: usize) -> Self {
        Self {
            codec,
            max_pending_bytes,
            buf: Vec::new(),
            base: 0,
            au_len: 0,
            au_start: None,
            au_vcl: false,
            au_keyframe: false,
            scan: 0,
            synced: false,
            chunks: VecDeque::new(),
            keyframe_seen: false,
            poisoned: false,
            discarded: 0,
        }
    }

    /// Feeds one packet and returns the access units it completed.
    pub fn parse(&mut self, packet: Packet) -> Result<Vec<AccessUnit>> {
        if self.poisoned {
            return Err(AssemblerError::Poisoned);
        }

        let mut units = Vec::new();
        if packet.data.is_empty() {
            return Ok(units);
        }

        self.chunks.push_back(ChunkInfo {
            start: self.base + self.buf.len() as u64,
            pts: packet.pts,
            dts: packet.dts,
            keyframe: packet.keyframe,
            pos: packet.pos,
            used: false,
        });
        self.buf.extend_from_slice(&packet.data);

        self.sync();
        self.scan_nalus(&mut units)?;

        if self.buf.len() > self.max_pending_bytes {
            self.poisoned = true;
            return Err(AssemblerError::Overflow(self.max_pending_bytes));
        }

        Ok(units)
    }

    /// Emits whatever is buffered at the end of the stream.
    pub fn flush(&mut self) -> Result<Vec<AccessUnit>> {
        if self.poisoned {
            return Err(AssemblerError::Poisoned);
        }

        let mut units = Vec::new();

        if self.synced {
            if let Some(sc) = find_start_code(&self.buf, self.au_len) {
                let payload = sc + 3;
                let end = trim_trailing_zeros(&self.buf, payload, self.buf.len());
                if end > payload {
                    self.push_nalu(payload, end, &mut units)?;
                }
            }
            if self.au_start.is_some() {
                self.emit(self.au_len, &mut units);
            }
        }

        self.clear();
        Ok(units)
    }

    /// Drops all parser state, including a previous fatal error. The keyframe gate is left as
    /// is, see [`Assembler::rearm_keyframe_gate`].
    pub fn reset(&mut self) {
        self.clear();
        self.poisoned = false;
    }

    /// Discards access units again until the next keyframe.
    pub fn rearm_keyframe_gate(&mut self) {
        self.keyframe_seen = false;
    }

    pub fn keyframe_seen(&self) -> bool {
        self.keyframe_seen
    }

    /// Number of access units discarded because no keyframe had been seen yet.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Bytes currently buffered.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.base = 0;
        self.au_len = 0;
        self.au_start = None;
        self.au_vcl = false;
        self.au_keyframe = false;
        self.scan = 0;
        self.synced = false;
        self.chunks.clear();
    }

    /// Drops everything before the first start code.
    fn sync(&mut self) {
        if self.synced {
            return;
        }

        match find_start_code(&self.buf, 0) {
            Some(mut pos) => {
                // Keep the leading zero of a 4-byte start code.
                if pos > 0 && self.buf[pos - 1] == 0x00 {
                    pos -= 1;
                }
                if pos > 0 {
                    debug!("discarding {} bytes before the first start code", pos);
                }
                self.consume(pos);
                self.synced = true;
            }
            None => {
                // Keep what could be the beginning of a start code.
                let keep = self.buf.len().min(3);
                self.consume(self.buf.len() - keep);
            }
        }
    }

    fn consume(&mut self, len: usize) {
        self.buf.drain(..len);
        self.base += len as u64;
        self.au_len = self.au_len.saturating_sub(len);
        self.scan = self.scan.saturating_sub(len);
    }

    fn scan_nalus(&mut self, units: &mut Vec<AccessUnit>) -> Result<()> {
        while self.synced {
            let Some(sc) = find_start_code(&self.buf, self.au_len) else {
                break;
            };
            let payload = sc + 3;

            let Some(next) = find_start_code(&self.buf, payload.max(self.scan)) else {
                self.scan = self.buf.len().saturating_sub(2).max(payload);
                self.close_on_partial_nalu(payload, units);
                break;
            };

            let end = trim_trailing_zeros(&self.buf, payload, next);
            self.scan = 0;
            self.push_nalu(payload, end, units)?;
        }

        Ok(())
    }

    /// Emits the unit being built as soon as the header of the incomplete NAL unit at `payload`
    /// shows that it starts a new access unit. Undecidable prefixes are left for
    /// [`Assembler::push_nalu`] once the NAL unit is complete.
    fn close_on_partial_nalu(&mut self, payload: usize, units: &mut Vec<AccessUnit>) {
        if !self.au_vcl || self.buf.get(payload).map_or(true, |b| *b == 0x00) {
            return;
        }

        let starts_new = codec::classify(self.codec, &self.buf[payload..])
            .map_or(false, |info| info.starts_access_unit || info.first_slice);
        if starts_new {
            let len = self.au_len;
            self.emit(len, units);
        }
    }

    /// Appends the complete NAL unit `buf[payload..end]` to the unit being built, emitting the
    /// latter first if this NAL unit starts a new one.
    fn push_nalu(
        &mut self,
        mut payload: usize,
        mut end: usize,
        units: &mut Vec<AccessUnit>,
    ) -> Result<()> {
        if end == payload {
            self.au_len = end;
            return Ok(());
        }

        let info = match codec::classify(self.codec, &self.buf[payload..end]) {
            Ok(info) => info,
            Err(source) => {
                self.poisoned = true;
                return Err(AssemblerError::CorruptNalu {
                    offset: self.base + payload as u64,
                    source,
                });
            }
        };

        if self.au_vcl && (info.starts_access_unit || info.first_slice) {
            let len = self.au_len;
            self.emit(len, units);
            payload -= len;
            end -= len;
        }

        if self.au_start.is_none() {
            self.au_start = Some(self.base + payload as u64);
        }
        self.au_len = end;
        self.au_vcl |= info.vcl;
        self.au_keyframe |= info.keyframe;

        if info.end {
            self.emit(end, units);
        }

        Ok(())
    }

    /// Moves the first `len` bytes of the buffer out as one access unit.
    fn emit(&mut self, len: usize, units: &mut Vec<AccessUnit>) {
        let rest = self.buf.split_off(len);
        let data = std::mem::replace(&mut self.buf, rest);

        let start = self.au_start.take().unwrap_or(self.base);
        let vcl = std::mem::take(&mut self.au_vcl);
        let keyframe = std::mem::take(&mut self.au_keyframe);
        self.base += len as u64;
        self.au_len = 0;
        self.scan = self.scan.saturating_sub(len);

        let chunk = self.chunks.iter_mut().rev().find(|c| c.start <= start);
        let unit = match chunk {
            Some(chunk) if !chunk.used => {
                chunk.used = true;
                AccessUnit {
                    data,
                    pts: chunk.pts,
                    dts: chunk.dts,
                    keyframe: keyframe || chunk.keyframe,
                    offset: chunk.pos,
                }
            }
            chunk => AccessUnit {
                data,
                pts: None,
                dts: None,
                keyframe,
                offset: chunk.and_then(|c| c.pos),
            },
        };

        while self.chunks.len() > 1 && self.chunks[1].start <= self.base {
            self.chunks.pop_front();
        }

        if !vcl {
            debug!("dropping {} bytes without slice data", unit.data.len());
            return;
        }

        if !self.keyframe_seen {
            if !unit.keyframe {
                self.discarded += 1;
                debug!("discarding access unit before the first keyframe");
                return;
            }
            self.keyframe_seen = true;
        }

        units.push(unit);
    }
}

fn trim_trailing_zeros(data: &[u8], start: usize, mut end: usize) -> usize {
    while end > start && data[end - 1] == 0x00 {
        end -= 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1e];
    const PPS: &[u8] = &[0x68, 0xce];
    const IDR: &[u8] = &[0x65, 0x88, 0x84];
    const P: &[u8] = &[0x41, 0x9a, 0x02];
    // Second slice of a picture, first_mb_in_slice == 1.
    const P_CONT: &[u8] = &[0x41, 0x40, 0x02];
    const EOS: &[u8] = &[0x0a];

    fn annex_b(units: &[&[u8]]) -> Vec<u8> {
        let mut out = vec![];
        for unit in units {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(unit);
        }
        out
    }

    fn assembler() -> Assembler {
        Assembler::new(EncodedFormat::H264, 1024 * 1024)
    }

    fn parse_all(assembler: &mut Assembler, packets: Vec<Packet>) -> Vec<AccessUnit> {
        let mut units = vec![];
        for packet in packets {
            units.extend(assembler.parse(packet).unwrap());
        }
        units.extend(assembler.flush().unwrap());
        units
    }

    #[test]
    fn picture_boundaries() {
        let stream = annex_b(&[SPS, PPS, IDR, P, P_CONT, P]);
        let mut assembler = assembler();

        let units = assembler.parse(Packet::new(stream)).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].data, annex_b(&[SPS, PPS, IDR]));
        assert!(units[0].keyframe);
        assert_eq!(units[1].data, annex_b(&[P, P_CONT]));
        assert!(!units[1].keyframe);

        let units = assembler.flush().unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].data, annex_b(&[P]));
    }

    #[test]
    fn unit_completes_on_next_picture_header() {
        let mut assembler = assembler();

        assert!(assembler
            .parse(Packet::new(annex_b(&[SPS, PPS, IDR])))
            .unwrap()
            .is_empty());

        // The header of the next slice is enough, without waiting for its end.
        let units = assembler.parse(Packet::new(annex_b(&[P]))).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].data, annex_b(&[SPS, PPS, IDR]));

        // Neither is the header of a second slice of the same picture, nor a lone header byte.
        assert!(assembler
            .parse(Packet::new(annex_b(&[P_CONT])))
            .unwrap()
            .is_empty());
        assert!(assembler
            .parse(Packet::new(vec![0, 0, 0, 1, 0x41]))
            .unwrap()
            .is_empty());
        let units = assembler.parse(Packet::new(vec![0x9a, 0x02])).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].data, annex_b(&[P, P_CONT]));
    }

    #[test]
    fn fragmented_input_gives_same_units() {
        let stream = annex_b(&[SPS, PPS, IDR, P, P_CONT, P, SPS, PPS, IDR]);

        let whole = parse_all(&mut assembler(), vec![Packet::new(stream.clone())]);
        let bytes = parse_all(
            &mut assembler(),
            stream.iter().map(|b| Packet::new(vec![*b])).collect(),
        );

        assert_eq!(whole.len(), 4);
        assert_eq!(
            whole.iter().map(|u| &u.data).collect::<Vec<_>>(),
            bytes.iter().map(|u| &u.data).collect::<Vec<_>>()
        );
    }

    #[test]
    fn timestamps_follow_the_starting_packet() {
        let mut assembler = assembler();
        let packets = vec![
            Packet::new(annex_b(&[SPS, PPS, IDR])).with_pts(0),
            Packet::new(annex_b(&[P])).with_pts(3000),
            // Two pictures in one packet: only the first one gets the timestamp.
            Packet::new(annex_b(&[P, P])).with_pts(6000),
        ];

        let units = parse_all(&mut assembler, packets);
        assert_eq!(
            units.iter().map(|u| u.pts).collect::<Vec<_>>(),
            vec![Some(0), Some(3000), Some(6000), None]
        );
    }

    #[test]
    fn unit_split_across_packets_keeps_first_timestamp() {
        let mut assembler = assembler();
        let stream = annex_b(&[SPS, PPS, IDR]);
        let (head, tail) = stream.split_at(7);

        let packets = vec![
            Packet::new(head.to_vec()).with_pts(100),
            Packet::new(tail.to_vec()).with_pts(200),
        ];
        let units = parse_all(&mut assembler, packets);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].pts, Some(100));
    }

    #[test]
    fn leading_garbage_is_discarded() {
        let mut data = vec![0xde, 0xad, 0xbe, 0xef];
        data.extend(annex_b(&[IDR]));

        let units = parse_all(&mut assembler(), vec![Packet::new(data)]);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].data, annex_b(&[IDR]));
    }

    #[test]
    fn units_before_first_keyframe_are_discarded() {
        let mut assembler = assembler();
        let units = parse_all(&mut assembler, vec![Packet::new(annex_b(&[P, P, IDR, P]))]);

        assert_eq!(units.len(), 2);
        assert!(units[0].keyframe);
        assert_eq!(assembler.discarded(), 2);
        assert!(assembler.keyframe_seen());

        // A parser reset keeps the gate open, re-arming closes it.
        assembler.reset();
        assert_eq!(parse_all(&mut assembler, vec![Packet::new(annex_b(&[P, P]))]).len(), 2);

        assembler.rearm_keyframe_gate();
        assert!(parse_all(&mut assembler, vec![Packet::new(annex_b(&[P, P]))]).is_empty());
    }

    #[test]
    fn container_keyframe_hint() {
        let units = parse_all(
            &mut assembler(),
            vec![Packet::new(annex_b(&[P])).keyframe(true)],
        );
        assert_eq!(units.len(), 1);
        assert!(units[0].keyframe);
    }

    #[test]
    fn end_of_sequence_closes_unit() {
        let mut assembler = assembler();

        let units = assembler
            .parse(Packet::new(annex_b(&[IDR, EOS, P])))
            .unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].data, annex_b(&[IDR, EOS]));
    }

    #[test]
    fn corrupt_nalu_poisons_parser() {
        let mut assembler = assembler();
        let data = annex_b(&[IDR, &[0x80, 0x00], P]);

        assert!(matches!(
            assembler.parse(Packet::new(data)),
            Err(AssemblerError::CorruptNalu { offset: 11, .. })
        ));
        assert!(assembler.is_poisoned());
        assert!(matches!(
            assembler.parse(Packet::new(annex_b(&[P]))),
            Err(AssemblerError::Poisoned)
        ));

        assembler.reset();
        assert!(!assembler.is_poisoned());
        assert!(assembler.parse(Packet::new(annex_b(&[IDR]))).is_ok());
    }

    #[test]
    fn overflow() {
        let mut assembler = Assembler::new(EncodedFormat::H264, 16);
        let mut data = annex_b(&[IDR]);
        data.extend(std::iter::repeat(0xaa).take(32));

        assert!(matches!(
            assembler.parse(Packet::new(data)),
            Err(AssemblerError::Overflow(16))
        ));
    }

    #[test]
    fn h265_first_slice_segment() {
        let vps: &[u8] = &[0x40, 0x01, 0x0c];
        let idr: &[u8] = &[0x26, 0x01, 0xaf];
        // Dependent slice segment: first_slice_segment_in_pic_flag == 0.
        let idr_cont: &[u8] = &[0x26, 0x01, 0x2f];
        let trail: &[u8] = &[0x02, 0x01, 0xd0];

        let mut assembler = Assembler::new(EncodedFormat::H265, 1024);
        let units = parse_all(
            &mut assembler,
            vec![Packet::new(annex_b(&[vps, idr, idr_cont, trail]))],
        );

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].data, annex_b(&[vps, idr, idr_cont]));
        assert!(units[0].keyframe);
        assert_eq!(units[1].data, annex_b(&[trail]));
    }
}
