// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the pipeline run without any
//! decoding hardware, so we can test it in isolation.
//!
//! Its behavior is driven by a [`DummyScript`], and everything it is asked to do is recorded in a
//! [`DummyLog`] shared with the test.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;
use log::debug;

use crate::backend::BackendError;
use crate::backend::BackendFactory;
use crate::backend::BackendKind;
use crate::backend::BackendResult;
use crate::backend::DecodedPicture;
use crate::backend::DecoderBackend;
use crate::backend::OwnedPicture;
use crate::backend::ReceiveStatus;
use crate::backend::SubmitStatus;
use crate::decoded_frame_size;
use crate::stream::AccessUnit;
use crate::stream::StreamDescriptor;
use crate::DecodedFormat;
use crate::Resolution;

/// How a dummy decoder behaves.
#[derive(Clone, Debug)]
pub struct DummyScript {
    /// Units held by the decoder before it outputs the picture of the first one.
    pub latency: usize,
    /// Units the input queue can hold on top of `latency`. Further submissions are busy.
    pub queue_depth: usize,
    /// Accept every unit but never output anything.
    pub stalled: bool,
    /// Fail `receive` with a fatal error once this many pictures were output.
    pub fatal_after_frames: Option<u64>,
    /// Indices of submissions rejected as invalid data.
    pub reject: Vec<u64>,
    /// Indices of submission attempts answered with busy, once each.
    pub busy: Vec<u64>,
    /// Fail the first receive after a drain request with invalid data.
    pub corrupt_on_drain: bool,
    /// Drop the timestamps of the output pictures at these output indices.
    pub drop_pts: Vec<u64>,
    pub fail_reopen: bool,
    pub format: DecodedFormat,
}

impl Default for DummyScript {
    fn default() -> Self {
        Self {
            latency: 0,
            queue_depth: 4,
            stalled: false,
            fatal_after_frames: None,
            reject: Vec::new(),
            busy: Vec::new(),
            corrupt_on_drain: false,
            drop_pts: Vec::new(),
            fail_reopen: false,
            format: DecodedFormat::NV12,
        }
    }
}

impl DummyScript {
    pub fn stalled() -> Self {
        Self {
            stalled: true,
            ..Default::default()
        }
    }
}

/// What the dummy decoders opened by one [`DummyFactory`] have been asked to do.
#[derive(Clone, Debug, Default)]
pub struct DummyLog {
    pub opened: Vec<BackendKind>,
    pub submitted: u64,
    pub busy: u64,
    pub rejected: u64,
    pub frames: u64,
    pub drains: u64,
    pub flushes: u64,
    pub reopens: u64,
    pub closes: u64,
    /// Submissions attempted after a fatal error was returned.
    pub submits_after_fatal: u64,
    /// Keyframe flags of the units submitted since the last reopen.
    pub keyframes_after_reopen: Vec<bool>,
}

pub struct DummyBackend {
    kind: BackendKind,
    script: DummyScript,
    resolution: Resolution,
    log: Arc<Mutex<DummyLog>>,

    queue: VecDeque<AccessUnit>,
    attempts: u64,
    submissions: u64,
    outputs: u64,
    draining: bool,
    drain_corrupted: bool,
    reopened: bool,
    failed: bool,
    closed: bool,
}

impl DummyBackend {
    pub fn new(
        kind: BackendKind,
        script: DummyScript,
        resolution: Resolution,
        log: Arc<Mutex<DummyLog>>,
    ) -> Self {
        Self {
            kind,
            script,
            resolution,
            log,
            queue: VecDeque::new(),
            attempts: 0,
            submissions: 0,
            outputs: 0,
            draining: false,
            drain_corrupted: false,
            reopened: false,
            failed: false,
            closed: false,
        }
    }

    fn check_open(&self) -> BackendResult<()> {
        if self.closed {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }

    fn picture(&mut self, unit: AccessUnit) -> DecodedPicture {
        let size = decoded_frame_size(
            self.script.format,
            self.resolution.width as usize,
            self.resolution.height as usize,
        );
        let pts = if self.script.drop_pts.contains(&self.outputs) {
            None
        } else {
            unit.pts
        };

        self.outputs += 1;
        self.log.lock().unwrap().frames += 1;

        DecodedPicture::new(
            Box::new(OwnedPicture(vec![self.outputs as u8; size])),
            self.resolution,
            self.script.format,
            pts,
        )
    }
}

impl DecoderBackend for DummyBackend {
    fn name(&self) -> &'static str {
        match self.kind {
            BackendKind::Hardware => "dummy-hw",
            BackendKind::Software => "dummy-sw",
        }
    }

    fn is_software(&self) -> bool {
        self.kind == BackendKind::Software
    }

    fn output_format(&self) -> DecodedFormat {
        self.script.format
    }

    fn submit(&mut self, unit: AccessUnit) -> BackendResult<SubmitStatus> {
        self.check_open()?;

        if self.failed {
            self.log.lock().unwrap().submits_after_fatal += 1;
        }
        if self.reopened {
            self.log
                .lock()
                .unwrap()
                .keyframes_after_reopen
                .push(unit.keyframe);
        }

        let attempt = self.attempts;
        self.attempts += 1;
        if self.script.busy.contains(&attempt) {
            self.log.lock().unwrap().busy += 1;
            return Ok(SubmitStatus::Busy(unit));
        }

        if self.script.stalled {
            self.log.lock().unwrap().submitted += 1;
            return Ok(SubmitStatus::Accepted);
        }

        if self.queue.len() >= self.script.latency + self.script.queue_depth {
            self.log.lock().unwrap().busy += 1;
            return Ok(SubmitStatus::Busy(unit));
        }

        let index = self.submissions;
        self.submissions += 1;

        if self.script.reject.contains(&index) {
            self.log.lock().unwrap().rejected += 1;
            return Err(BackendError::InvalidData(format!("unit {} is broken", index)));
        }

        self.log.lock().unwrap().submitted += 1;
        self.queue.push_back(unit);
        Ok(SubmitStatus::Accepted)
    }

    fn drain(&mut self) -> BackendResult<()> {
        self.check_open()?;
        self.draining = true;
        self.log.lock().unwrap().drains += 1;
        Ok(())
    }

    fn receive(&mut self) -> BackendResult<ReceiveStatus> {
        self.check_open()?;

        if self.script.fatal_after_frames == Some(self.outputs) {
            self.failed = true;
            return Err(BackendError::Other(anyhow!("device reported an error")));
        }

        if self.draining && self.script.corrupt_on_drain && !self.drain_corrupted {
            self.drain_corrupted = true;
            return Err(BackendError::InvalidData("corrupt picture".into()));
        }

        let ready = if self.draining {
            !self.queue.is_empty()
        } else {
            self.queue.len() > self.script.latency
        };

        if ready {
            if let Some(unit) = self.queue.pop_front() {
                return Ok(ReceiveStatus::Frame(self.picture(unit)));
            }
        }

        if self.draining && self.queue.is_empty() {
            Ok(ReceiveStatus::EndOfStream)
        } else {
            Ok(ReceiveStatus::NeedMoreInput)
        }
    }

    fn flush(&mut self) -> BackendResult<()> {
        self.check_open()?;
        debug!("{}: flushing {} units", self.name(), self.queue.len());
        self.queue.clear();
        self.draining = false;
        self.log.lock().unwrap().flushes += 1;
        Ok(())
    }

    fn reopen(&mut self) -> BackendResult<()> {
        self.check_open()?;
        self.log.lock().unwrap().reopens += 1;
        if self.script.fail_reopen {
            return Err(BackendError::Other(anyhow!("cannot reopen device")));
        }
        self.queue.clear();
        self.draining = false;
        self.failed = false;
        self.reopened = true;
        self.log.lock().unwrap().keyframes_after_reopen.clear();
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.queue.clear();
            self.log.lock().unwrap().closes += 1;
        }
    }
}

/// Opens dummy backends. A `None` script makes opening that kind of backend fail.
pub struct DummyFactory {
    pub hardware: Option<DummyScript>,
    pub software: Option<DummyScript>,
    log: Arc<Mutex<DummyLog>>,
}

impl DummyFactory {
    pub fn new(hardware: Option<DummyScript>, software: Option<DummyScript>) -> Self {
        Self {
            hardware,
            software,
            log: Default::default(),
        }
    }

    /// Handle on the log of all the backends this factory opens.
    pub fn log(&self) -> Arc<Mutex<DummyLog>> {
        Arc::clone(&self.log)
    }
}

impl BackendFactory for DummyFactory {
    fn open(
        &mut self,
        kind: BackendKind,
        stream: &StreamDescriptor,
    ) -> BackendResult<Box<dyn DecoderBackend>> {
        let script = match kind {
            BackendKind::Hardware => self.hardware.clone(),
            BackendKind::Software => self.software.clone(),
        }
        .ok_or_else(|| BackendError::Unsupported(format!("no dummy {:?} decoder", kind)))?;

        self.log.lock().unwrap().opened.push(kind);

        Ok(Box::new(DummyBackend::new(
            kind,
            script,
            stream.resolution,
            Arc::clone(&self.log),
        )))
    }
}
