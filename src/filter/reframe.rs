// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Length-prefixed to delimiter framing conversion.

use log::debug;

use crate::bitstream_utils::LengthPrefixedIterator;
use crate::bitstream_utils::START_CODE;
use crate::codec;
use crate::codec::ConfigRecord;
use crate::filter::FilterError;
use crate::filter::PacketTransform;
use crate::filter::Result;
use crate::stream::Packet;
use crate::EncodedFormat;

/// Replaces the length prefix of every NAL unit with a 4-byte start code and inserts the
/// out-of-band parameter sets in front of keyframes that do not carry them in-band.
pub struct Reframe {
    codec: EncodedFormat,
    nal_length_size: usize,
    parameter_sets: Vec<u8>,
}

impl Reframe {
    pub fn new(codec: EncodedFormat, record: &ConfigRecord) -> Self {
        Self {
            codec,
            nal_length_size: record.nal_length_size,
            parameter_sets: record.to_annex_b(),
        }
    }
}

impl PacketTransform for Reframe {
    fn name(&self) -> &'static str {
        "reframe"
    }

    fn transform(&mut self, mut packet: Packet) -> Result<Option<Packet>> {
        let mut out = Vec::with_capacity(packet.data.len() + self.parameter_sets.len() + 16);
        let mut in_band_parameter_sets = false;
        let mut injected = false;

        for nalu in LengthPrefixedIterator::new(&packet.data, self.nal_length_size) {
            let nalu = nalu?;
            if nalu.is_empty() {
                continue;
            }

            let info = codec::classify(self.codec, nalu).map_err(FilterError::CorruptNalu)?;
            in_band_parameter_sets |= info.parameter_set;

            if info.vcl
                && (info.keyframe || packet.keyframe)
                && !in_band_parameter_sets
                && !injected
                && !self.parameter_sets.is_empty()
            {
                debug!("injecting {} bytes of parameter sets", self.parameter_sets.len());
                out.extend_from_slice(&self.parameter_sets);
                injected = true;
            }

            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nalu);
        }

        if out.is_empty() {
            return Ok(None);
        }

        packet.data = out;
        Ok(Some(packet))
    }
}
