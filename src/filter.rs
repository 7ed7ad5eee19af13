// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bitstream filters applied to container-framed packets before they reach the assembler.
//!
//! Every stage follows a pull-based protocol: one packet is fed in with
//! [`BitstreamFilter::send`], and at most one packet is pulled out with
//! [`BitstreamFilter::receive`]. A stage holds at most one packet, so feeding a second one before
//! the first has been pulled fails with [`FilterError::Again`]. This keeps the 1:1 backpressure
//! visible to the caller.

pub mod insert_aud;
pub mod reframe;
pub mod strip_sei;

use log::debug;
use thiserror::Error;

use crate::bitstream_utils::LengthPrefixError;
use crate::codec::ConfigRecord;
use crate::config::NormalizerConfig;
use crate::filter::insert_aud::InsertAud;
use crate::filter::reframe::Reframe;
use crate::filter::strip_sei::StripSei;
use crate::stream::Packet;
use crate::EncodedFormat;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("malformed length-prefixed unit: {0}")]
    Malformed(#[from] LengthPrefixError),
    #[error("invalid decoder configuration record: {0:#}")]
    InvalidConfigRecord(anyhow::Error),
    #[error("corrupt NAL unit: {0:#}")]
    CorruptNalu(anyhow::Error),
    #[error("filter stage {0} already holds a packet")]
    Again(&'static str),
}

pub type Result<T> = std::result::Result<T, FilterError>;

/// A single filter stage.
pub trait BitstreamFilter: Send {
    fn name(&self) -> &'static str;

    /// Feeds one packet to the stage. `None` signals the end of the stream.
    fn send(&mut self, packet: Option<Packet>) -> Result<()>;

    /// Pulls at most one filtered packet out of the stage.
    fn receive(&mut self) -> Result<Option<Packet>>;

    /// Drops any held packet and internal state.
    fn reset(&mut self);
}

/// A 1:1 packet transformation that can be turned into a [`BitstreamFilter`] through [`Stage`].
pub trait PacketTransform: Send {
    fn name(&self) -> &'static str;

    /// Transforms `packet`. Returning `None` drops the packet entirely.
    fn transform(&mut self, packet: Packet) -> Result<Option<Packet>>;

    fn reset(&mut self) {}
}

/// Holds the output of a [`PacketTransform`] until it is pulled.
pub struct Stage<T: PacketTransform> {
    transform: T,
    pending: Option<Packet>,
}

impl<T: PacketTransform> Stage<T> {
    pub fn new(transform: T) -> Self {
        Self {
            transform,
            pending: None,
        }
    }
}

impl<T: PacketTransform> BitstreamFilter for Stage<T> {
    fn name(&self) -> &'static str {
        self.transform.name()
    }

    fn send(&mut self, packet: Option<Packet>) -> Result<()> {
        if self.pending.is_some() {
            return Err(FilterError::Again(self.name()));
        }

        match packet {
            Some(packet) => self.pending = self.transform.transform(packet)?,
            None => debug!("{}: end of stream", self.name()),
        }

        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Packet>> {
        Ok(self.pending.take())
    }

    fn reset(&mut self) {
        self.pending = None;
        self.transform.reset();
    }
}

/// An ordered list of filter stages.
pub struct FilterChain {
    stages: Vec<Box<dyn BitstreamFilter>>,
}

impl FilterChain {
    pub fn new(stages: Vec<Box<dyn BitstreamFilter>>) -> Self {
        Self { stages }
    }

    /// Builds the chain converting a container-framed stream described by `record` to delimiter
    /// framing, followed by the optional stages enabled in `config`.
    pub fn for_container(
        codec: EncodedFormat,
        record: &ConfigRecord,
        config: &NormalizerConfig,
    ) -> Self {
        let mut stages: Vec<Box<dyn BitstreamFilter>> =
            vec![Box::new(Stage::new(Reframe::new(codec, record)))];

        if config.strip_sei {
            stages.push(Box::new(Stage::new(StripSei::new(codec))));
        }
        if config.insert_aud {
            stages.push(Box::new(Stage::new(InsertAud::new(codec))));
        }

        debug!(
            "filter chain: {}",
            stages.iter().map(|s| s.name()).collect::<Vec<_>>().join(" -> ")
        );

        Self::new(stages)
    }

    /// Runs `packet` through every stage. Returns `None` if one of the stages dropped it.
    pub fn filter(&mut self, packet: Packet) -> Result<Option<Packet>> {
        let mut current = Some(packet);

        for stage in self.stages.iter_mut() {
            let Some(packet) = current.take() else {
                break;
            };
            stage.send(Some(packet))?;
            current = stage.receive()?;
        }

        Ok(current)
    }

    /// Signals the end of the stream to every stage.
    pub fn finish(&mut self) -> Result<()> {
        for stage in self.stages.iter_mut() {
            stage.send(None)?;
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        for stage in self.stages.iter_mut() {
            stage.reset();
        }
    }
}
