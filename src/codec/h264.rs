// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 NAL unit headers and the avcC decoder configuration record.

use anyhow::anyhow;
use anyhow::Context;
use bytes::Buf;
use enumn::N;

use crate::bitstream_utils::BitReader;
use crate::codec::nalu::Header;
use crate::codec::ConfigRecord;

/// Access unit delimiter allowing any slice type, with its start code.
pub const AUD: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xf0];

#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

#[derive(Debug)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
    pub idr_pic_flag: bool,
}

impl Header for NaluHeader {
    fn parse(nalu: &[u8]) -> anyhow::Result<Self> {
        let byte = *nalu.first().ok_or(anyhow!("Broken Data"))?;

        if byte & 0x80 != 0 {
            return Err(anyhow!("forbidden_zero_bit is set"));
        }

        // Reserved and unspecified types are carried along untouched.
        let type_ = NaluType::n(byte & 0x1f).unwrap_or(NaluType::Unknown);
        let ref_idc = (byte & 0x60) >> 5;
        let idr_pic_flag = matches!(type_, NaluType::SliceIdr);

        Ok(NaluHeader {
            ref_idc,
            type_,
            idr_pic_flag,
        })
    }

    fn is_end(&self) -> bool {
        matches!(self.type_, NaluType::SeqEnd | NaluType::StreamEnd)
    }

    fn len(&self) -> usize {
        1
    }

    fn is_vcl(&self) -> bool {
        matches!(
            self.type_,
            NaluType::Slice
                | NaluType::SliceDpa
                | NaluType::SliceDpb
                | NaluType::SliceDpc
                | NaluType::SliceIdr
        )
    }

    fn is_keyframe(&self) -> bool {
        self.idr_pic_flag
    }

    fn is_delimiter(&self) -> bool {
        matches!(self.type_, NaluType::AuDelimiter)
    }

    fn is_parameter_set(&self) -> bool {
        matches!(self.type_, NaluType::Sps | NaluType::Pps)
    }

    fn is_sei(&self) -> bool {
        matches!(self.type_, NaluType::Sei)
    }

    /// See 7.4.1.2.3: these units, when present, precede the first slice of the primary coded
    /// picture.
    fn starts_access_unit(&self) -> bool {
        matches!(
            self.type_,
            NaluType::AuDelimiter
                | NaluType::Sps
                | NaluType::Pps
                | NaluType::Sei
                | NaluType::PrefixUnit
                | NaluType::SubsetSps
                | NaluType::DepthSps
        )
    }

    fn is_first_slice(&self, nalu: &[u8]) -> bool {
        // Data partitions B and C never start a picture.
        if matches!(self.type_, NaluType::SliceDpb | NaluType::SliceDpc) {
            return false;
        }

        let mut r = BitReader::new(&nalu[self.len()..], true);
        // first_mb_in_slice
        matches!(r.read_ue(), Ok(0))
    }
}

/// Parses an `AVCDecoderConfigurationRecord` (ISO/IEC 14496-15, 5.3.3.1).
pub fn parse_config_record(mut data: &[u8]) -> anyhow::Result<ConfigRecord> {
    if data.remaining() < 6 {
        return Err(anyhow!("avcC record too short ({} bytes)", data.remaining()));
    }

    let version = data.get_u8();
    if version != 1 {
        return Err(anyhow!("unsupported avcC version {}", version));
    }
    // profile_idc, profile_compatibility, level_idc
    data.advance(3);
    let nal_length_size = usize::from(data.get_u8() & 0x3) + 1;

    let mut parameter_sets = Vec::new();
    let num_sps = data.get_u8() & 0x1f;
    read_parameter_sets(&mut data, usize::from(num_sps), &mut parameter_sets).context("SPS")?;

    if !data.has_remaining() {
        return Err(anyhow!("avcC record truncated before PPS count"));
    }
    let num_pps = data.get_u8();
    read_parameter_sets(&mut data, usize::from(num_pps), &mut parameter_sets).context("PPS")?;

    Ok(ConfigRecord {
        nal_length_size,
        parameter_sets,
    })
}

/// Reads `count` 16-bit length prefixed parameter sets from `data`.
pub(crate) fn read_parameter_sets(
    data: &mut &[u8],
    count: usize,
    out: &mut Vec<Vec<u8>>,
) -> anyhow::Result<()> {
    for i in 0..count {
        if data.remaining() < 2 {
            return Err(anyhow!("truncated length of parameter set {}", i));
        }
        let len = usize::from(data.get_u16());
        if data.remaining() < len {
            return Err(anyhow!(
                "parameter set {} claims {} bytes, {} left",
                i,
                len,
                data.remaining()
            ));
        }
        out.push(data[..len].to_vec());
        data.advance(len);
    }

    Ok(())
}
