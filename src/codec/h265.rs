// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.265 NAL unit headers and the hvcC decoder configuration record.

use anyhow::anyhow;
use anyhow::Context;
use bytes::Buf;
use enumn::N;

use crate::codec::h264::read_parameter_sets;
use crate::codec::nalu::Header;
use crate::codec::ConfigRecord;

/// Access unit delimiter allowing any slice type, with its start code.
pub const AUD: [u8; 7] = [0x00, 0x00, 0x00, 0x01, 0x46, 0x01, 0x50];

/// Size of the fixed part of an `HEVCDecoderConfigurationRecord`.
const HVCC_HEADER_SIZE: usize = 22;

#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    TrailN = 0,
    TrailR = 1,
    TsaN = 2,
    TsaR = 3,
    StsaN = 4,
    StsaR = 5,
    RadlN = 6,
    RadlR = 7,
    RaslN = 8,
    RaslR = 9,
    BlaWLp = 16,
    BlaWRadl = 17,
    BlaNLp = 18,
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
    VpsNut = 32,
    SpsNut = 33,
    PpsNut = 34,
    AudNut = 35,
    EosNut = 36,
    EobNut = 37,
    FdNut = 38,
    PrefixSeiNut = 39,
    SuffixSeiNut = 40,
    RsvNvcl41 = 41,
    RsvNvcl42 = 42,
    RsvNvcl43 = 43,
    RsvNvcl44 = 44,
    /// Any reserved or unspecified value not listed above.
    Reserved = 63,
}

#[derive(Debug)]
pub struct NaluHeader {
    pub type_: NaluType,
    pub nuh_layer_id: u8,
    pub nuh_temporal_id_plus1: u8,
}

impl Header for NaluHeader {
    fn parse(nalu: &[u8]) -> anyhow::Result<Self> {
        if nalu.len() < 2 {
            return Err(anyhow!("Broken Data"));
        }

        if nalu[0] & 0x80 != 0 {
            return Err(anyhow!("forbidden_zero_bit is set"));
        }

        let type_ = NaluType::n((nalu[0] >> 1) & 0x3f).unwrap_or(NaluType::Reserved);
        let nuh_layer_id = ((nalu[0] & 0x1) << 5) | (nalu[1] >> 3);
        let nuh_temporal_id_plus1 = nalu[1] & 0x7;

        if nuh_temporal_id_plus1 == 0 {
            return Err(anyhow!("nuh_temporal_id_plus1 is zero"));
        }

        Ok(NaluHeader {
            type_,
            nuh_layer_id,
            nuh_temporal_id_plus1,
        })
    }

    fn is_end(&self) -> bool {
        matches!(self.type_, NaluType::EosNut | NaluType::EobNut)
    }

    fn len(&self) -> usize {
        2
    }

    fn is_vcl(&self) -> bool {
        (self.type_ as u8) < 32
    }

    fn is_keyframe(&self) -> bool {
        (NaluType::BlaWLp as u8..=NaluType::CraNut as u8).contains(&(self.type_ as u8))
    }

    fn is_delimiter(&self) -> bool {
        matches!(self.type_, NaluType::AudNut)
    }

    fn is_parameter_set(&self) -> bool {
        matches!(
            self.type_,
            NaluType::VpsNut | NaluType::SpsNut | NaluType::PpsNut
        )
    }

    fn is_sei(&self) -> bool {
        matches!(
            self.type_,
            NaluType::PrefixSeiNut | NaluType::SuffixSeiNut
        )
    }

    /// See F.7.4.2.4.4: the first of these units after the last VCL unit of a picture starts a
    /// new access unit.
    fn starts_access_unit(&self) -> bool {
        self.nuh_layer_id == 0
            && matches!(
                self.type_,
                NaluType::AudNut
                    | NaluType::VpsNut
                    | NaluType::SpsNut
                    | NaluType::PpsNut
                    | NaluType::PrefixSeiNut
                    | NaluType::RsvNvcl41
                    | NaluType::RsvNvcl42
                    | NaluType::RsvNvcl43
                    | NaluType::RsvNvcl44
            )
    }

    fn is_first_slice(&self, nalu: &[u8]) -> bool {
        // first_slice_segment_in_pic_flag is the first bit after the header.
        nalu.get(self.len()).map_or(false, |b| b & 0x80 != 0)
    }
}

/// Parses an `HEVCDecoderConfigurationRecord` (ISO/IEC 14496-15, 8.3.3.1).
pub fn parse_config_record(data: &[u8]) -> anyhow::Result<ConfigRecord> {
    if data.len() < HVCC_HEADER_SIZE + 1 {
        return Err(anyhow!("hvcC record too short ({} bytes)", data.len()));
    }

    if data[0] != 1 {
        return Err(anyhow!("unsupported hvcC version {}", data[0]));
    }

    let nal_length_size = usize::from(data[HVCC_HEADER_SIZE - 1] & 0x3) + 1;

    let mut data = &data[HVCC_HEADER_SIZE..];
    let num_arrays = data.get_u8();
    let mut parameter_sets = Vec::new();

    for i in 0..num_arrays {
        if data.remaining() < 3 {
            return Err(anyhow!("hvcC array {} truncated", i));
        }
        // array_completeness, reserved, NAL_unit_type
        data.advance(1);
        let num_nalus = usize::from(data.get_u16());
        read_parameter_sets(&mut data, num_nalus, &mut parameter_sets)
            .with_context(|| format!("hvcC array {}", i))?;
    }

    Ok(ConfigRecord {
        nal_length_size,
        parameter_sets,
    })
}
