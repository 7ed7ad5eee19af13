// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod h264;
pub mod h265;
pub mod nalu;

use crate::bitstream_utils::START_CODE;
use crate::codec::nalu::NaluInfo;
use crate::EncodedFormat;

/// Out-of-band stream configuration carried by a container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigRecord {
    /// Size in bytes of the length prefix of each NAL unit in the stream.
    pub nal_length_size: usize,
    /// Parameter set NAL units, without any framing.
    pub parameter_sets: Vec<Vec<u8>>,
}

impl ConfigRecord {
    /// Returns the parameter sets in delimiter framing, ready to be prepended to a keyframe.
    pub fn to_annex_b(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for ps in &self.parameter_sets {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(ps);
        }
        out
    }
}

/// Parses the container configuration record (avcC or hvcC) found in the stream extradata.
pub fn parse_config_record(
    codec: EncodedFormat,
    extradata: &[u8],
) -> anyhow::Result<ConfigRecord> {
    match codec {
        EncodedFormat::H264 => h264::parse_config_record(extradata),
        EncodedFormat::H265 => h265::parse_config_record(extradata),
    }
}

/// Parses the header of `nalu` (which must not include its start code).
pub fn classify(codec: EncodedFormat, nalu: &[u8]) -> anyhow::Result<NaluInfo> {
    match codec {
        EncodedFormat::H264 => NaluInfo::parse::<h264::NaluHeader>(nalu, |h| h.type_ as u8),
        EncodedFormat::H265 => NaluInfo::parse::<h265::NaluHeader>(nalu, |h| h.type_ as u8),
    }
}

/// An access unit delimiter NAL unit for `codec`, including its start code.
pub fn access_unit_delimiter(codec: EncodedFormat) -> &'static [u8] {
    match codec {
        EncodedFormat::H264 => &h264::AUD,
        EncodedFormat::H265 => &h265::AUD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_h264() {
        let sps = classify(EncodedFormat::H264, &[0x67, 0x42]).unwrap();
        assert!(sps.parameter_set);
        assert!(sps.starts_access_unit);
        assert!(!sps.vcl);

        let idr = classify(EncodedFormat::H264, &[0x65, 0x88]).unwrap();
        assert!(idr.vcl && idr.keyframe && idr.first_slice);
        assert_eq!(idr.nalu_type, 5);

        let eos = classify(EncodedFormat::H264, &[0x0a]).unwrap();
        assert!(eos.end);
    }

    #[test]
    fn parameter_sets_to_annex_b() {
        let record = ConfigRecord {
            nal_length_size: 4,
            parameter_sets: vec![vec![0x67, 0x42], vec![0x68]],
        };
        assert_eq!(
            record.to_annex_b(),
            vec![0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68]
        );
    }
}
