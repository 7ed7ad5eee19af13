// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stream-level data exchanged with the demuxer collaborator.

use crate::EncodedFormat;
use crate::Rational;
use crate::Resolution;

/// Static description of the elementary stream being decoded.
///
/// Filled in once when the stream is opened and never modified afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub codec: EncodedFormat,
    pub resolution: Resolution,
    /// Average frame rate as reported by the stream itself.
    pub avg_frame_rate: Option<Rational>,
    /// Frame rate guessed by the container layer from packet timing.
    pub guessed_frame_rate: Option<Rational>,
    /// Unit of all the timestamps carried by packets of this stream.
    pub time_base: Rational,
    /// Out-of-band parameter sets: an avcC/hvcC configuration record for container-framed
    /// streams, or delimiter-framed parameter sets for elementary streams. May be empty.
    pub extradata: Vec<u8>,
}

impl StreamDescriptor {
    pub fn new(codec: EncodedFormat, resolution: Resolution, time_base: Rational) -> Self {
        Self {
            codec,
            resolution,
            avg_frame_rate: None,
            guessed_frame_rate: None,
            time_base,
            extradata: Vec::new(),
        }
    }

    /// Best known frame rate of the stream, preferring the stream-reported average.
    pub fn frame_rate(&self) -> Option<Rational> {
        self.avg_frame_rate
            .filter(Rational::is_valid)
            .or(self.guessed_frame_rate.filter(Rational::is_valid))
    }
}

/// A raw chunk of encoded data as produced by the demuxer.
///
/// A packet may hold exactly one access unit, several of them, or only a fragment of one; the
/// [`crate::assembler::Assembler`] sorts that out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// Keyframe hint from the container.
    pub keyframe: bool,
    /// Byte offset of the packet in the source, if known.
    pub pos: Option<u64>,
}

impl Packet {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn keyframe(mut self, keyframe: bool) -> Self {
        self.keyframe = keyframe;
        self
    }
}

/// One complete encoded picture in delimiter framing, ready to be submitted to a decoder.
///
/// Produced by the assembler and consumed exactly once by a submission.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessUnit {
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub keyframe: bool,
    /// Byte offset in the source of the packet that started this unit.
    pub offset: Option<u64>,
}

/// Where to reposition a [`PacketSource`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SeekTarget {
    /// Beginning of the stream.
    Start,
    /// Nearest keyframe at or before this timestamp, in stream time base units.
    Timestamp(i64),
    /// Byte position in the source.
    ByteOffset(u64),
}

/// The demuxer collaborator: an ordered sequence of packets belonging to one elementary stream.
pub trait PacketSource: Send {
    /// Returns the next packet, or `None` at the end of the stream.
    fn read_packet(&mut self) -> anyhow::Result<Option<Packet>>;

    /// Repositions the read cursor.
    fn seek(&mut self, target: SeekTarget) -> anyhow::Result<()>;
}

impl<S: PacketSource + ?Sized> PacketSource for Box<S> {
    fn read_packet(&mut self) -> anyhow::Result<Option<Packet>> {
        (**self).read_packet()
    }

    fn seek(&mut self, target: SeekTarget) -> anyhow::Result<()> {
        (**self).seek(target)
    }
}

/// Replays a list of already demuxed packets.
#[derive(Debug, Default)]
pub struct MemorySource {
    packets: Vec<Packet>,
    cursor: usize,
    /// Packets returned since creation, across seeks.
    reads: usize,
}

impl MemorySource {
    pub fn new(packets: Vec<Packet>) -> Self {
        Self {
            packets,
            cursor: 0,
            reads: 0,
        }
    }

    /// Splits a delimiter-framed elementary stream into packets of at most `chunk_size` bytes,
    /// with no timestamps. Useful to feed raw `.h264`/`.h265` files.
    pub fn from_elementary_stream(data: &[u8], chunk_size: usize) -> Self {
        let packets = data
            .chunks(chunk_size.max(1))
            .scan(0u64, |pos, chunk| {
                let packet = Packet {
                    data: chunk.to_vec(),
                    pos: Some(*pos),
                    ..Default::default()
                };
                *pos += chunk.len() as u64;
                Some(packet)
            })
            .collect();

        Self::new(packets)
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn num_reads(&self) -> usize {
        self.reads
    }
}

impl PacketSource for MemorySource {
    fn read_packet(&mut self) -> anyhow::Result<Option<Packet>> {
        let packet = self.packets.get(self.cursor).cloned();
        if packet.is_some() {
            self.cursor += 1;
            self.reads += 1;
        }
        Ok(packet)
    }

    fn seek(&mut self, target: SeekTarget) -> anyhow::Result<()> {
        self.cursor = match target {
            SeekTarget::Start => 0,
            SeekTarget::Timestamp(ts) => {
                // Last keyframe at or before `ts`, or the start of the stream.
                self.packets
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.keyframe && p.pts.map_or(false, |pts| pts <= ts))
                    .map(|(i, _)| i)
                    .last()
                    .unwrap_or(0)
            }
            SeekTarget::ByteOffset(offset) => self
                .packets
                .iter()
                .position(|p| p.pos.map_or(false, |pos| pos >= offset))
                .unwrap_or(self.packets.len()),
        };

        Ok(())
    }
}
