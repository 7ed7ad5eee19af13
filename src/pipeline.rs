// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The renderer-facing decoding pipeline.
//!
//! A [`Pipeline`] reads packets from a [`PacketSource`], normalizes and assembles them into
//! access units, and drives a [`DecodeSession`] through its non-blocking submit/receive protocol
//! while the [`Recovery`] state machine watches for stalls. Pictures are returned from
//! [`Pipeline::get_next_picture`], either decoded on the spot within a bounded time budget, or
//! taken from the [`crate::frame_queue::FrameQueue`] filled by a dedicated decode thread.

mod worker;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::error;
use log::info;
use log::warn;
use thiserror::Error;

use crate::assembler::Assembler;
use crate::assembler::AssemblerError;
use crate::backend::BackendError;
use crate::backend::BackendFactory;
use crate::backend::BackendKind;
use crate::backend::DecodedPicture;
use crate::backend::ReceiveStatus;
use crate::backend::SubmitStatus;
use crate::config::ConfigError;
use crate::config::PipelineConfig;
use crate::filter::FilterError;
use crate::normalizer::Normalizer;
use crate::recovery::Recovery;
use crate::recovery::RecoveryAction;
use crate::session::DecodeSession;
use crate::stream::AccessUnit;
use crate::stream::PacketSource;
use crate::stream::SeekTarget;
use crate::stream::StreamDescriptor;
use crate::timestamp::TimestampNormalizer;

use worker::DecodeWorker;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("malformed stream: {0}")]
    Stream(#[from] FilterError),
    #[error("parse error: {0}")]
    Parse(#[from] AssemblerError),
    #[error("decoder error: {0}")]
    Device(#[from] BackendError),
    #[error("packet source error: {0:#}")]
    Source(anyhow::Error),
    #[error("decoder is stuck and every recovery attempt failed")]
    Stalled,
    #[error("pipeline has failed and cannot continue")]
    Failed,
    #[error("pipeline is closed")]
    Closed,
}

impl PipelineError {
    /// Whether the current decode session cannot continue after this error.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineError::Device(e) if e.is_recoverable())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineStats {
    pub frames_decoded: u64,
    /// Pictures overwritten in the frame queue plus access units rejected by the decoder.
    pub frames_dropped: u64,
    /// Time spent decoding per produced picture.
    pub avg_decode_time_ms: f64,
    pub parser_resets: u64,
    pub deep_resets: u64,
    pub fallbacks: u64,
    pub software_active: bool,
}

/// Result of a single receive attempt outside of the end of stream drain.
enum Received {
    Frame(DecodedPicture),
    Empty,
    /// Nothing was received and a recovery action was carried out.
    Recovered,
}

enum NextUnit {
    Unit(AccessUnit),
    EndOfInput,
    OutOfTime,
}

/// Everything needed to decode the stream, owned by a single thread at a time.
pub(crate) struct DecodeLoop {
    config: PipelineConfig,
    stream: StreamDescriptor,
    source: Box<dyn PacketSource>,
    factory: Box<dyn BackendFactory>,
    session: DecodeSession,

    normalizer: Normalizer,
    assembler: Assembler,
    recovery: Recovery,
    timestamps: TimestampNormalizer,
    /// Assembled units waiting for submission, in decode order.
    ready: VecDeque<AccessUnit>,

    source_eos: bool,
    /// Last time the drain made progress, if it has started.
    drain_progress: Option<Instant>,
    eos: bool,
    failed: bool,

    frames_decoded: u64,
    busy_time: Duration,
    stats: Arc<Mutex<PipelineStats>>,
}

impl DecodeLoop {
    fn new(
        config: PipelineConfig,
        stream: StreamDescriptor,
        source: Box<dyn PacketSource>,
        factory: Box<dyn BackendFactory>,
        session: DecodeSession,
        stats: Arc<Mutex<PipelineStats>>,
    ) -> Self {
        let normalizer = Normalizer::new(&stream, &config.normalizer);
        let assembler = Assembler::new(stream.codec, config.max_pending_bytes);
        let recovery = Recovery::new(config.recovery.clone(), session.is_software());
        let timestamps = TimestampNormalizer::new(&stream, config.configured_frame_rate);

        Self {
            config,
            stream,
            source,
            factory,
            session,
            normalizer,
            assembler,
            recovery,
            timestamps,
            ready: VecDeque::new(),
            source_eos: false,
            drain_progress: None,
            eos: false,
            failed: false,
            frames_decoded: 0,
            busy_time: Duration::ZERO,
            stats,
        }
    }

    pub(crate) fn is_eos(&self) -> bool {
        self.eos
    }

    fn update_stats(&self, f: impl FnOnce(&mut PipelineStats)) {
        f(&mut self.stats.lock().unwrap());
    }

    pub(crate) fn count_dropped(&self, count: u64) {
        self.update_stats(|s| s.frames_dropped += count);
    }

    /// Tries to produce one picture within the time budget. `Ok(None)` means "try again later",
    /// unless [`DecodeLoop::is_eos`] is set.
    pub(crate) fn step(&mut self) -> Result<Option<DecodedPicture>> {
        if self.failed {
            return Err(PipelineError::Failed);
        }
        if self.eos {
            return Ok(None);
        }

        let start = Instant::now();
        let result = self.run_until(start + self.config.time_budget_for(self.stream.frame_rate()));
        self.busy_time += start.elapsed();

        if let Err(e) = &result {
            if e.is_terminal() {
                error!("decoding failed: {}", e);
                self.failed = true;
            }
        }

        let avg = if self.frames_decoded > 0 {
            self.busy_time.as_secs_f64() * 1000.0 / self.frames_decoded as f64
        } else {
            0.0
        };
        self.update_stats(|s| s.avg_decode_time_ms = avg);

        result
    }

    fn run_until(&mut self, deadline: Instant) -> Result<Option<DecodedPicture>> {
        if self.drain_progress.is_some() {
            return self.drain_step();
        }

        let cap = if self.frames_decoded >= self.config.steady_after_frames {
            self.config.steady_packet_cap
        } else {
            self.config.initial_packet_cap
        };

        match self.receive_once()? {
            Received::Frame(picture) => return Ok(Some(picture)),
            Received::Recovered => return Ok(None),
            Received::Empty => (),
        }

        let mut attempts = 0;
        loop {
            if attempts >= cap || Instant::now() >= deadline {
                return Ok(None);
            }

            if self.assembler.keyframe_seen()
                && self.recovery.check_watchdog(Instant::now()) == RecoveryAction::Fallback
            {
                self.fallback()?;
                return Ok(None);
            }

            let unit = match self.next_unit(deadline)? {
                NextUnit::Unit(unit) => unit,
                NextUnit::OutOfTime => return Ok(None),
                NextUnit::EndOfInput => {
                    debug!("end of input, draining {}", self.session.name());
                    self.session.drain()?;
                    self.drain_progress = Some(Instant::now());
                    return self.drain_step();
                }
            };

            attempts += 1;
            self.recovery.on_submit_attempt(Instant::now());

            match self.session.submit(unit) {
                Ok(SubmitStatus::Accepted) => {
                    self.recovery.on_submitted();
                    match self.receive_once()? {
                        Received::Frame(picture) => return Ok(Some(picture)),
                        Received::Recovered => return Ok(None),
                        Received::Empty => (),
                    }
                }
                Ok(SubmitStatus::Busy(unit)) => {
                    // Retried once a receive made some room, within the cap and the budget.
                    self.ready.push_front(unit);
                    match self.receive_once()? {
                        Received::Frame(picture) => return Ok(Some(picture)),
                        Received::Recovered => return Ok(None),
                        Received::Empty => (),
                    }
                }
                Err(e) if e.is_recoverable() => {
                    warn!("dropping access unit: {}", e);
                    self.count_dropped(1);
                }
                Err(e) => {
                    self.recovery.mark_fatal();
                    return Err(e.into());
                }
            }
        }
    }

    /// Returns the next access unit to submit, reading from the source as needed.
    fn next_unit(&mut self, deadline: Instant) -> Result<NextUnit> {
        loop {
            if let Some(unit) = self.ready.pop_front() {
                return Ok(NextUnit::Unit(unit));
            }
            if self.source_eos {
                return Ok(NextUnit::EndOfInput);
            }
            if Instant::now() >= deadline {
                return Ok(NextUnit::OutOfTime);
            }

            match self.source.read_packet().map_err(PipelineError::Source)? {
                Some(packet) => {
                    if let Some(packet) = self.normalizer.normalize(packet)? {
                        self.ready.extend(self.assembler.parse(packet)?);
                    }
                }
                None => {
                    self.source_eos = true;
                    self.normalizer.finish()?;
                    self.ready.extend(self.assembler.flush()?);
                }
            }
        }
    }

    fn deliver(&mut self, mut picture: DecodedPicture) -> DecodedPicture {
        self.recovery.on_frame(Instant::now());
        self.timestamps.normalize(&mut picture);
        self.frames_decoded += 1;
        self.update_stats(|s| s.frames_decoded += 1);
        debug!(
            "picture {} pts {:?}{}",
            picture.sequence,
            picture.pts,
            if picture.synthetic_pts { " (synthetic)" } else { "" }
        );
        picture
    }

    fn receive_once(&mut self) -> Result<Received> {
        match self.session.receive() {
            Ok(ReceiveStatus::Frame(picture)) => Ok(Received::Frame(self.deliver(picture))),
            Ok(ReceiveStatus::NeedMoreInput) => {
                let action = self.recovery.on_empty_receive();
                self.apply(action)
            }
            Ok(ReceiveStatus::EndOfStream) => Ok(Received::Empty),
            Err(e) if e.is_recoverable() => {
                warn!("receive: {}", e);
                self.count_dropped(1);
                Ok(Received::Empty)
            }
            Err(e) => {
                self.recovery.mark_fatal();
                Err(e.into())
            }
        }
    }

    fn apply(&mut self, action: RecoveryAction) -> Result<Received> {
        match action {
            RecoveryAction::None => Ok(Received::Empty),
            RecoveryAction::ParserReset => {
                self.update_stats(|s| s.parser_resets += 1);
                self.reset_parser();
                self.session.flush()?;
                Ok(Received::Recovered)
            }
            RecoveryAction::DeepReset => {
                self.update_stats(|s| s.deep_resets += 1);
                let success = match self.session.reopen() {
                    Ok(()) => {
                        // The new decoding state needs parameter sets and a keyframe first.
                        self.reset_parser();
                        self.assembler.rearm_keyframe_gate();
                        true
                    }
                    Err(e) => {
                        warn!("cannot reopen {}: {}", self.session.name(), e);
                        false
                    }
                };
                match self.recovery.on_deep_reset(success) {
                    RecoveryAction::None => Ok(Received::Recovered),
                    next => self.apply(next),
                }
            }
            RecoveryAction::Fallback => {
                self.fallback()?;
                Ok(Received::Recovered)
            }
            RecoveryAction::Fatal => {
                self.recovery.mark_fatal();
                Err(PipelineError::Stalled)
            }
        }
    }

    fn drain_step(&mut self) -> Result<Option<DecodedPicture>> {
        let status = match self.session.receive() {
            Ok(status) => status,
            Err(e) if e.is_recoverable() => {
                warn!("receive while draining: {}", e);
                self.count_dropped(1);
                return Ok(None);
            }
            Err(e) => {
                self.recovery.mark_fatal();
                return Err(e.into());
            }
        };

        match status {
            ReceiveStatus::Frame(picture) => {
                self.drain_progress = Some(Instant::now());
                Ok(Some(self.deliver(picture)))
            }
            ReceiveStatus::EndOfStream => {
                self.finish();
                Ok(None)
            }
            ReceiveStatus::NeedMoreInput => {
                let stalled_for = self
                    .drain_progress
                    .map_or(Duration::ZERO, |since| since.elapsed());
                if stalled_for > self.config.drain_timeout {
                    warn!("drain timed out after {:?}", stalled_for);
                    self.finish();
                }
                Ok(None)
            }
        }
    }

    fn finish(&mut self) {
        info!("end of stream after {} pictures", self.frames_decoded);
        self.drain_progress = None;
        self.eos = true;
    }

    fn reset_parser(&mut self) {
        self.assembler.reset();
        self.normalizer.reset();
        self.ready.clear();
    }

    /// Repositions the source and starts over from the next keyframe.
    fn restart_from(&mut self, target: SeekTarget) -> Result<()> {
        self.source.seek(target).map_err(PipelineError::Source)?;
        self.reset_parser();
        self.assembler.rearm_keyframe_gate();
        self.timestamps.reset();
        self.source_eos = false;
        self.drain_progress = None;
        self.eos = false;
        Ok(())
    }

    /// Replaces the current session with a software one and restarts from the beginning of the
    /// stream.
    pub(crate) fn fallback(&mut self) -> Result<()> {
        info!("{}: falling back to the software decoder", self.session.name());
        self.session.close();
        self.session =
            DecodeSession::open(self.factory.as_mut(), BackendKind::Software, &self.stream)?;
        self.restart_from(SeekTarget::Start)?;
        self.recovery.on_fallback();
        self.failed = false;
        self.update_stats(|s| {
            s.fallbacks += 1;
            s.software_active = true;
        });
        Ok(())
    }

    pub(crate) fn seek(&mut self, target: SeekTarget) -> Result<()> {
        if self.failed {
            return Err(PipelineError::Failed);
        }
        info!("seeking to {:?}", target);
        self.session.flush()?;
        self.restart_from(target)?;
        self.recovery.on_seek();
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        self.session.close();
    }
}

fn open_session(
    factory: &mut dyn BackendFactory,
    stream: &StreamDescriptor,
    force_software: bool,
) -> Result<DecodeSession> {
    if !force_software {
        match DecodeSession::open(factory, BackendKind::Hardware, stream) {
            Ok(session) => return Ok(session),
            Err(e) => warn!("cannot open hardware decoder ({}), using software", e),
        }
    }

    DecodeSession::open(factory, BackendKind::Software, stream).map_err(|e| {
        error!("cannot open software decoder: {}", e);
        PipelineError::Device(e)
    })
}

enum Mode {
    Cooperative(Box<DecodeLoop>),
    Threaded(DecodeWorker),
    Closed,
}

/// Decodes one elementary stream for a renderer.
pub struct Pipeline {
    mode: Mode,
    stats: Arc<Mutex<PipelineStats>>,
}

impl Pipeline {
    /// Opens the hardware decoder for `stream`, or the software one if that fails or
    /// `config.force_software` is set.
    pub fn open(
        stream: StreamDescriptor,
        source: Box<dyn PacketSource>,
        mut factory: Box<dyn BackendFactory>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let session = open_session(factory.as_mut(), &stream, config.force_software)?;
        let stats = Arc::new(Mutex::new(PipelineStats {
            software_active: session.is_software(),
            ..Default::default()
        }));

        info!(
            "opened {:?} {}x{} pipeline, {} mode",
            stream.codec,
            stream.resolution.width,
            stream.resolution.height,
            if config.threaded { "threaded" } else { "cooperative" }
        );

        let threaded = config.threaded;
        let decoder = Box::new(DecodeLoop::new(
            config,
            stream,
            source,
            factory,
            session,
            Arc::clone(&stats),
        ));

        let mode = if threaded {
            Mode::Threaded(DecodeWorker::spawn(decoder))
        } else {
            Mode::Cooperative(decoder)
        };

        Ok(Self { mode, stats })
    }

    /// Returns the next decoded picture, or `None` if none is available yet or the end of the
    /// stream has been reached. Never blocks for longer than the time budget.
    pub fn get_next_picture(&mut self) -> Result<Option<DecodedPicture>> {
        match &mut self.mode {
            Mode::Cooperative(decoder) => decoder.step(),
            Mode::Threaded(worker) => worker.next_picture(),
            Mode::Closed => Err(PipelineError::Closed),
        }
    }

    /// Whether all the pictures of the stream have been returned.
    pub fn is_eos(&self) -> bool {
        match &self.mode {
            Mode::Cooperative(decoder) => decoder.is_eos(),
            Mode::Threaded(worker) => worker.is_eos(),
            Mode::Closed => false,
        }
    }

    fn with_decoder(&mut self, f: impl FnOnce(&mut DecodeLoop) -> Result<()>) -> Result<()> {
        match &mut self.mode {
            Mode::Cooperative(decoder) => f(decoder),
            Mode::Threaded(worker) => worker.with_parked(f),
            Mode::Closed => Err(PipelineError::Closed),
        }
    }

    /// Restarts decoding from the last keyframe at or before `timestamp`.
    pub fn seek(&mut self, timestamp: i64) -> Result<()> {
        self.with_decoder(|decoder| decoder.seek(SeekTarget::Timestamp(timestamp)))
    }

    /// Restarts decoding from the beginning of the stream, e.g. for looped playback.
    pub fn reset_for_loop(&mut self) -> Result<()> {
        self.with_decoder(|decoder| decoder.seek(SeekTarget::Start))
    }

    /// Switches to the software decoder, e.g. after a terminal hardware error.
    pub fn fallback_to_software(&mut self) -> Result<()> {
        self.with_decoder(|decoder| decoder.fallback())
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.lock().unwrap().clone()
    }

    /// Stops decoding and releases the decoder. Calling it again does nothing.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::Cooperative(mut decoder) => decoder.close(),
            Mode::Threaded(worker) => worker.shutdown(),
            Mode::Closed => return,
        }
        info!("pipeline closed: {:?}", self.stats());
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.close();
    }
}
