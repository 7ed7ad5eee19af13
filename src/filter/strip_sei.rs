// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Removal of supplemental enhancement information units, which some M2M decoders reject.

use log::debug;

use crate::bitstream_utils::AnnexBUnits;
use crate::bitstream_utils::START_CODE;
use crate::codec;
use crate::filter::FilterError;
use crate::filter::PacketTransform;
use crate::filter::Result;
use crate::stream::Packet;
use crate::EncodedFormat;

pub struct StripSei {
    codec: EncodedFormat,
    stripped: usize,
}

impl StripSei {
    pub fn new(codec: EncodedFormat) -> Self {
        Self { codec, stripped: 0 }
    }

    /// Number of units removed so far.
    pub fn stripped(&self) -> usize {
        self.stripped
    }
}

impl PacketTransform for StripSei {
    fn name(&self) -> &'static str {
        "strip_sei"
    }

    fn transform(&mut self, mut packet: Packet) -> Result<Option<Packet>> {
        let mut keep = Vec::new();
        let mut dropped = 0;

        for nalu in AnnexBUnits::new(&packet.data) {
            let info = codec::classify(self.codec, nalu).map_err(FilterError::CorruptNalu)?;
            if info.sei {
                dropped += 1;
            } else {
                keep.push(nalu);
            }
        }

        if dropped == 0 {
            return Ok(Some(packet));
        }

        self.stripped += dropped;
        debug!("stripped {} SEI units", dropped);

        if keep.is_empty() {
            return Ok(None);
        }

        let mut out = Vec::with_capacity(packet.data.len());
        for nalu in keep {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nalu);
        }
        packet.data = out;

        Ok(Some(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_h264_sei() {
        let mut strip = StripSei::new(EncodedFormat::H264);
        let data = vec![
            0, 0, 0, 1, 0x06, 0x05, 0x10, //
            0, 0, 0, 1, 0x65, 0x88,
        ];

        let out = strip.transform(Packet::new(data)).unwrap().unwrap();
        assert_eq!(out.data, vec![0, 0, 0, 1, 0x65, 0x88]);
        assert_eq!(strip.stripped(), 1);

        // Only SEI: the packet disappears.
        let out = strip
            .transform(Packet::new(vec![0, 0, 0, 1, 0x06, 0x05]))
            .unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn strips_h265_prefix_and_suffix_sei() {
        let mut strip = StripSei::new(EncodedFormat::H265);
        let data = vec![
            0, 0, 0, 1, 0x4e, 0x01, 0x05, // prefix SEI
            0, 0, 0, 1, 0x26, 0x01, 0xaf, // IDR_W_RADL
            0, 0, 0, 1, 0x50, 0x01, 0x05, // suffix SEI
        ];

        let out = strip.transform(Packet::new(data)).unwrap().unwrap();
        assert_eq!(out.data, vec![0, 0, 0, 1, 0x26, 0x01, 0xaf]);
        assert_eq!(strip.stripped(), 2);
    }

    #[test]
    fn untouched_packet_is_not_copied() {
        let mut strip = StripSei::new(EncodedFormat::H264);
        let data = vec![0, 0, 1, 0x41, 0x9a];

        let out = strip.transform(Packet::new(data.clone())).unwrap().unwrap();
        assert_eq!(out.data, data);
    }
}
