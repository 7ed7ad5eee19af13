// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guarantees exactly one access unit delimiter at the front of every packet.

use crate::bitstream_utils::AnnexBUnits;
use crate::bitstream_utils::START_CODE;
use crate::codec;
use crate::filter::FilterError;
use crate::filter::PacketTransform;
use crate::filter::Result;
use crate::stream::Packet;
use crate::EncodedFormat;

pub struct InsertAud {
    codec: EncodedFormat,
}

impl InsertAud {
    pub fn new(codec: EncodedFormat) -> Self {
        Self { codec }
    }
}

impl PacketTransform for InsertAud {
    fn name(&self) -> &'static str {
        "insert_aud"
    }

    fn transform(&mut self, mut packet: Packet) -> Result<Option<Packet>> {
        let mut units = Vec::new();
        let mut delimiters = Vec::new();

        for (i, nalu) in AnnexBUnits::new(&packet.data).enumerate() {
            let info = codec::classify(self.codec, nalu).map_err(FilterError::CorruptNalu)?;
            if info.delimiter {
                delimiters.push(i);
            } else {
                units.push(nalu);
            }
        }

        if units.is_empty() {
            return Ok(None);
        }

        // Already in the expected shape.
        if delimiters == [0] {
            return Ok(Some(packet));
        }

        let aud = codec::access_unit_delimiter(self.codec);
        let mut out = Vec::with_capacity(packet.data.len() + aud.len());
        out.extend_from_slice(aud);
        for nalu in units {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nalu);
        }
        packet.data = out;

        Ok(Some(packet))
    }
}
