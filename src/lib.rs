// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode submission pipeline for memory-to-memory (M2M) hardware video decoders.
//!
//! Container-framed encoded packets flow through the [`normalizer`] (length-prefixed to
//! delimiter framing), the [`assembler`] (complete access units), and a
//! [`session::DecodeSession`] driving a [`backend::DecoderBackend`] through a non-blocking
//! submit/receive protocol. The [`recovery`] state machine watches that protocol and escalates
//! from parser resets to deep device resets and finally to a software decoder. Decoded pictures
//! get their presentation timestamps fixed up by the [`timestamp`] normalizer and can be handed
//! over to another thread through the [`frame_queue`].
//!
//! The entry point for hosts is [`pipeline::Pipeline`].

pub mod assembler;
pub mod backend;
pub mod bitstream_utils;
pub mod codec;
pub mod config;
pub mod filter;
pub mod frame_queue;
pub mod normalizer;
pub mod pipeline;
pub mod recovery;
pub mod session;
pub mod stream;
pub mod timestamp;

use std::fmt;
use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

/// A FourCC code, as used by V4L2 to describe pixel and compressed formats.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Fourcc(u32);

impl From<u32> for Fourcc {
    fn from(fourcc: u32) -> Self {
        Self(fourcc)
    }
}

impl From<Fourcc> for u32 {
    fn from(fourcc: Fourcc) -> Self {
        fourcc.0
    }
}

impl From<&[u8; 4]> for Fourcc {
    fn from(n: &[u8; 4]) -> Self {
        Self(u32::from_le_bytes(*n))
    }
}

impl From<Fourcc> for [u8; 4] {
    fn from(n: Fourcc) -> Self {
        n.0.to_le_bytes()
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c: [u8; 4] = (*self).into();
        f.write_fmt(format_args!(
            "{}{}{}{}",
            c[0] as char, c[1] as char, c[2] as char, c[3] as char
        ))
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

/// Pixel layout of a decoded picture.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    NV12,
    I420,
}

impl FromStr for DecodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(DecodedFormat::NV12),
            "i420" | "I420" => Ok(DecodedFormat::I420),
            _ => Err("unrecognized output format. Valid values: nv12, i420"),
        }
    }
}

impl From<DecodedFormat> for Fourcc {
    fn from(format: DecodedFormat) -> Fourcc {
        match format {
            DecodedFormat::NV12 => Fourcc::from(b"NV12"),
            DecodedFormat::I420 => Fourcc::from(b"YU12"),
        }
    }
}

/// Compression standard of an elementary stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EncodedFormat {
    H264,
    H265,
}

impl EncodedFormat {
    /// The compressed fourcc a stateful V4L2 decoder expects on its OUTPUT queue.
    pub fn fourcc(&self) -> Fourcc {
        match self {
            EncodedFormat::H264 => Fourcc::from(b"H264"),
            EncodedFormat::H265 => Fourcc::from(b"HEVC"),
        }
    }
}

impl FromStr for EncodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(EncodedFormat::H264),
            "h265" | "H265" | "hevc" | "HEVC" => Ok(EncodedFormat::H265),
            _ => Err("unrecognized input format. Valid values: h264, h265"),
        }
    }
}

/// A rational number, used for time bases and frame rates.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Whether both terms are strictly positive, i.e. the value can be used as a rate or a time
    /// base.
    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        f64::from(self.num) / f64::from(self.den)
    }

    /// Converts one tick of a rate of `self` frames per second into units of `time_base`,
    /// rounding to the nearest integer. Returns `None` if either value is not valid.
    pub fn frame_duration_in(&self, time_base: Rational) -> Option<i64> {
        if !self.is_valid() || !time_base.is_valid() {
            return None;
        }

        // duration = (den / num) seconds = (den * tb.den) / (num * tb.num) ticks.
        let n = i128::from(self.den) * i128::from(time_base.den);
        let d = i128::from(self.num) * i128::from(time_base.num);
        let duration = (n + d / 2) / d;

        i64::try_from(duration).ok().filter(|d| *d > 0)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Copies `src` into `dst` as NV12, removing any extra padding.
pub fn nv12_copy(
    src: &[u8],
    mut dst: &mut [u8],
    width: usize,
    height: usize,
    strides: [usize; 2],
    offsets: [usize; 2],
) {
    let mut src_y = &src[offsets[0]..];

    for _ in 0..height {
        dst[..width].copy_from_slice(&src_y[..width]);
        dst = &mut dst[width..];
        src_y = &src_y[strides[0].min(src_y.len())..];
    }

    // Align width and height to 2 for UV plane.
    let width = width + (width & 1);
    let height = (height + (height & 1)) / 2;

    let mut src_uv = &src[offsets[1]..];

    for _ in 0..height {
        dst[..width].copy_from_slice(&src_uv[..width]);
        dst = &mut dst[width..];
        src_uv = &src_uv[strides[1].min(src_uv.len())..];
    }
}

/// Copies three separate planes into `dst` as I420, removing any extra padding.
pub fn i420_copy(
    planes: [&[u8]; 3],
    mut dst: &mut [u8],
    width: usize,
    height: usize,
    strides: [usize; 3],
) {
    let chroma_width = (width + 1) / 2;
    let chroma_height = (height + 1) / 2;

    for (i, plane) in planes.iter().enumerate() {
        let (w, h) = if i == 0 {
            (width, height)
        } else {
            (chroma_width, chroma_height)
        };

        let mut src = *plane;
        for _ in 0..h {
            dst[..w].copy_from_slice(&src[..w]);
            dst = &mut dst[w..];
            src = &src[strides[i].min(src.len())..];
        }
    }
}

/// Returns the size required to store a frame of `format` with size `width`x`height`, without any
/// padding. This is the minimum size of the destination buffer passed to `nv12_copy` or
/// `i420_copy`.
pub fn decoded_frame_size(format: DecodedFormat, width: usize, height: usize) -> usize {
    match format {
        DecodedFormat::I420 | DecodedFormat::NV12 => {
            let u_size = width * height;
            // U and V planes need to be aligned to 2.
            let uv_size = ((width + 1) / 2) * ((height + 1) / 2) * 2;

            u_size + uv_size
        }
    }
}
