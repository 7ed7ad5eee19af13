// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software H.264 decoding with OpenH264.
//!
//! Decoding happens synchronously in `submit`; the resulting pictures wait in a small queue until
//! they are received, so the backend follows the same protocol as the hardware ones.

use std::collections::VecDeque;

use anyhow::anyhow;
use log::debug;
use openh264::decoder::Decoder;
use openh264::formats::YUVSource;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::DecodedPicture;
use crate::backend::DecoderBackend;
use crate::backend::OwnedPicture;
use crate::backend::ReceiveStatus;
use crate::backend::SubmitStatus;
use crate::decoded_frame_size;
use crate::i420_copy;
use crate::stream::AccessUnit;
use crate::stream::StreamDescriptor;
use crate::DecodedFormat;
use crate::EncodedFormat;
use crate::Resolution;

/// Pictures held before `submit` reports busy.
const MAX_PENDING_PICTURES: usize = 4;

pub struct OpenH264Backend {
    decoder: Option<Decoder>,
    pending: VecDeque<DecodedPicture>,
    draining: bool,
}

fn new_decoder() -> BackendResult<Decoder> {
    Decoder::new().map_err(|e| BackendError::Other(anyhow!("cannot create OpenH264 decoder: {}", e)))
}

impl OpenH264Backend {
    pub fn new(stream: &StreamDescriptor) -> BackendResult<Self> {
        if stream.codec != EncodedFormat::H264 {
            return Err(BackendError::Unsupported(format!(
                "OpenH264 cannot decode {:?}",
                stream.codec
            )));
        }

        Ok(Self {
            decoder: Some(new_decoder()?),
            pending: VecDeque::new(),
            draining: false,
        })
    }

    fn decoder(&mut self) -> BackendResult<&mut Decoder> {
        self.decoder.as_mut().ok_or(BackendError::Closed)
    }
}

impl DecoderBackend for OpenH264Backend {
    fn name(&self) -> &'static str {
        "openh264"
    }

    fn is_software(&self) -> bool {
        true
    }

    fn output_format(&self) -> DecodedFormat {
        DecodedFormat::I420
    }

    fn submit(&mut self, unit: AccessUnit) -> BackendResult<SubmitStatus> {
        if self.pending.len() >= MAX_PENDING_PICTURES {
            return Ok(SubmitStatus::Busy(unit));
        }

        let picture = match self.decoder()?.decode(&unit.data) {
            Ok(Some(yuv)) => {
                let (width, height) = yuv.dimensions();
                let (y_stride, u_stride, v_stride) = yuv.strides();
                let mut data = vec![0u8; decoded_frame_size(DecodedFormat::I420, width, height)];
                i420_copy(
                    [yuv.y(), yuv.u(), yuv.v()],
                    &mut data,
                    width,
                    height,
                    [y_stride, u_stride, v_stride],
                );

                Some(DecodedPicture::new(
                    Box::new(OwnedPicture(data)),
                    Resolution::from((width as u32, height as u32)),
                    DecodedFormat::I420,
                    unit.pts,
                ))
            }
            Ok(None) => None,
            Err(e) => return Err(BackendError::InvalidData(format!("openh264: {}", e))),
        };

        if let Some(picture) = picture {
            self.pending.push_back(picture);
        } else {
            debug!("openh264: no picture for unit with pts {:?}", unit.pts);
        }

        Ok(SubmitStatus::Accepted)
    }

    fn drain(&mut self) -> BackendResult<()> {
        self.decoder()?;
        self.draining = true;
        Ok(())
    }

    fn receive(&mut self) -> BackendResult<ReceiveStatus> {
        self.decoder()?;
        Ok(match self.pending.pop_front() {
            Some(picture) => ReceiveStatus::Frame(picture),
            None if self.draining => ReceiveStatus::EndOfStream,
            None => ReceiveStatus::NeedMoreInput,
        })
    }

    fn flush(&mut self) -> BackendResult<()> {
        self.decoder()?;
        self.pending.clear();
        self.draining = false;
        Ok(())
    }

    fn reopen(&mut self) -> BackendResult<()> {
        self.decoder()?;
        self.decoder = Some(new_decoder()?);
        self.pending.clear();
        self.draining = false;
        Ok(())
    }

    fn close(&mut self) {
        self.decoder = None;
        self.pending.clear();
    }
}
