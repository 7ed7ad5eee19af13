// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder backends.
//!
//! A backend is a provider of decoding, either a memory-to-memory hardware device or a software
//! decoder. All of them expose the same non-blocking submit/receive protocol through
//! [`DecoderBackend`], so the pipeline can swap one for the other without knowing which one it
//! drives.

pub mod dummy;
#[cfg(feature = "openh264")]
pub mod openh264;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::fmt;

use thiserror::Error;

use crate::stream::AccessUnit;
use crate::stream::StreamDescriptor;
use crate::DecodedFormat;
use crate::Resolution;

#[derive(Debug, Error)]
pub enum BackendError {
    /// The decoder rejected a single access unit. The unit is lost but decoding can go on.
    #[error("decoder rejected access unit: {0}")]
    InvalidData(String),
    #[error("decode session is closed")]
    Closed,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    /// Whether decoding can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BackendError::InvalidData(_))
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Outcome of [`DecoderBackend::submit`].
#[derive(Debug)]
pub enum SubmitStatus {
    Accepted,
    /// The input queue of the decoder is full. The unit is handed back so it can be submitted
    /// again once `receive` made some room.
    Busy(AccessUnit),
}

/// Outcome of [`DecoderBackend::receive`].
#[derive(Debug)]
pub enum ReceiveStatus {
    Frame(DecodedPicture),
    /// No picture is available right now. Not an error.
    NeedMoreInput,
    /// The decoder has been drained and will not produce any more pictures.
    EndOfStream,
}

/// Pixel data of a decoded picture.
pub trait PictureBuffer: Send {
    /// Copies the picture into `buffer`, which must be at least [`PictureBuffer::image_size`]
    /// bytes long, without any padding.
    fn read(&mut self, buffer: &mut [u8]) -> anyhow::Result<()>;

    /// Size in bytes of the picture without padding.
    fn image_size(&self) -> usize;
}

/// A picture already copied out of the decoder into system memory.
pub struct OwnedPicture(pub Vec<u8>);

impl PictureBuffer for OwnedPicture {
    fn read(&mut self, buffer: &mut [u8]) -> anyhow::Result<()> {
        let len = buffer.len();
        let dst = buffer
            .get_mut(..self.0.len())
            .ok_or_else(|| anyhow::anyhow!("buffer too small: {} < {}", len, self.0.len()))?;
        dst.copy_from_slice(&self.0);
        Ok(())
    }

    fn image_size(&self) -> usize {
        self.0.len()
    }
}

/// A decoded picture. Dropping it releases its buffer.
pub struct DecodedPicture {
    buffer: Box<dyn PictureBuffer>,
    pub resolution: Resolution,
    pub format: DecodedFormat,
    /// Presentation timestamp in stream time base units.
    pub pts: Option<i64>,
    /// Whether `pts` was inferred rather than reported by the decoder.
    pub synthetic_pts: bool,
    /// Position of the picture in output order since the session was opened.
    pub sequence: u64,
}

impl DecodedPicture {
    pub fn new(
        buffer: Box<dyn PictureBuffer>,
        resolution: Resolution,
        format: DecodedFormat,
        pts: Option<i64>,
    ) -> Self {
        Self {
            buffer,
            resolution,
            format,
            pts,
            synthetic_pts: false,
            sequence: 0,
        }
    }

    pub fn read(&mut self, buffer: &mut [u8]) -> anyhow::Result<()> {
        self.buffer.read(buffer)
    }

    pub fn image_size(&self) -> usize {
        self.buffer.image_size()
    }
}

impl fmt::Debug for DecodedPicture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedPicture")
            .field("resolution", &self.resolution)
            .field("format", &self.format)
            .field("pts", &self.pts)
            .field("synthetic_pts", &self.synthetic_pts)
            .field("sequence", &self.sequence)
            .field("image_size", &self.image_size())
            .finish()
    }
}

/// The capability interface shared by hardware and software decoders.
pub trait DecoderBackend: Send {
    fn name(&self) -> &'static str;

    fn is_software(&self) -> bool;

    /// Pixel format of the pictures this backend produces.
    fn output_format(&self) -> DecodedFormat;

    /// Hands one access unit to the decoder without blocking.
    fn submit(&mut self, unit: AccessUnit) -> BackendResult<SubmitStatus>;

    /// Signals the end of the input, so the decoder outputs all the pictures it still holds and
    /// then reports [`ReceiveStatus::EndOfStream`].
    fn drain(&mut self) -> BackendResult<()>;

    /// Polls for one decoded picture without blocking.
    fn receive(&mut self) -> BackendResult<ReceiveStatus>;

    /// Drops all pending input and output, e.g. before a seek.
    fn flush(&mut self) -> BackendResult<()>;

    /// Tears down and recreates the decoding state while keeping the device itself open.
    fn reopen(&mut self) -> BackendResult<()>;

    /// Releases the decoder. Further calls fail with [`BackendError::Closed`].
    fn close(&mut self);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Hardware,
    Software,
}

/// Opens backends for a stream, at session open time and on fallback.
pub trait BackendFactory: Send {
    fn open(
        &mut self,
        kind: BackendKind,
        stream: &StreamDescriptor,
    ) -> BackendResult<Box<dyn DecoderBackend>>;
}

/// Opens the V4L2 decoder at `device_path` for hardware sessions and OpenH264 for software ones,
/// depending on the enabled features.
pub struct SystemBackendFactory {
    pub device_path: std::path::PathBuf,
}

impl SystemBackendFactory {
    pub fn new<P: Into<std::path::PathBuf>>(device_path: P) -> Self {
        Self {
            device_path: device_path.into(),
        }
    }
}

impl BackendFactory for SystemBackendFactory {
    fn open(
        &mut self,
        kind: BackendKind,
        stream: &StreamDescriptor,
    ) -> BackendResult<Box<dyn DecoderBackend>> {
        match kind {
            #[cfg(feature = "v4l2")]
            BackendKind::Hardware => Ok(Box::new(v4l2::V4l2Backend::open(
                &self.device_path,
                stream,
            )?)),
            #[cfg(feature = "openh264")]
            BackendKind::Software => Ok(Box::new(openh264::OpenH264Backend::new(stream)?)),
            #[allow(unreachable_patterns)]
            kind => Err(BackendError::Unsupported(format!(
                "no {:?} backend for {:?} built in ({})",
                kind,
                stream.codec,
                self.device_path.display()
            ))),
        }
    }
}
