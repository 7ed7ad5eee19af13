// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt::Debug;

use anyhow::Result;

pub trait Header: Sized + Debug {
    /// Parse the NALU header from the first bytes of `nalu`.
    fn parse(nalu: &[u8]) -> Result<Self>;
    /// Whether this header type indicates EOS.
    fn is_end(&self) -> bool;
    /// The length of the header.
    fn len(&self) -> usize;
    /// Whether this unit carries slice data.
    fn is_vcl(&self) -> bool;
    /// Whether this unit is a slice of a random access picture.
    fn is_keyframe(&self) -> bool;
    /// Whether this is an access unit delimiter.
    fn is_delimiter(&self) -> bool;
    fn is_parameter_set(&self) -> bool;
    fn is_sei(&self) -> bool;
    /// Whether this non-VCL unit starts a new access unit when it follows the slices of a
    /// picture.
    fn starts_access_unit(&self) -> bool;
    /// For slices, whether `nalu` is the first slice of a picture.
    fn is_first_slice(&self, nalu: &[u8]) -> bool;
}

/// Codec independent summary of a NAL unit, as needed to reframe and reassemble access units.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NaluInfo {
    pub nalu_type: u8,
    pub vcl: bool,
    pub keyframe: bool,
    pub first_slice: bool,
    pub delimiter: bool,
    pub parameter_set: bool,
    pub sei: bool,
    pub starts_access_unit: bool,
    pub end: bool,
}

impl NaluInfo {
    pub fn parse<U: Header>(nalu: &[u8], nalu_type: impl Fn(&U) -> u8) -> Result<Self> {
        let hdr = U::parse(nalu)?;
        let vcl = hdr.is_vcl();

        Ok(Self {
            nalu_type: nalu_type(&hdr),
            vcl,
            keyframe: hdr.is_keyframe(),
            first_slice: vcl && hdr.is_first_slice(nalu),
            delimiter: hdr.is_delimiter(),
            parameter_set: hdr.is_parameter_set(),
            sei: hdr.is_sei(),
            starts_access_unit: hdr.starts_access_unit(),
            end: hdr.is_end(),
        })
    }
}
