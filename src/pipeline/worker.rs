// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode thread feeding the frame queue.

use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;
use log::error;
use log::warn;

use crate::backend::DecodedPicture;
use crate::frame_queue::FrameQueue;
use crate::frame_queue::PushOutcome;
use crate::pipeline::DecodeLoop;
use crate::pipeline::PipelineError;
use crate::pipeline::Result;

/// What the decode thread reports back to the consumer.
#[derive(Default)]
struct Status {
    error: Option<PipelineError>,
    /// The error has already been returned to the consumer.
    error_reported: bool,
    eos: bool,
}

/// Owns the decode thread. The [`DecodeLoop`] lives on that thread while it runs, and comes back
/// to the worker when the thread is parked.
pub(crate) struct DecodeWorker {
    queue: Arc<FrameQueue>,
    status: Arc<Mutex<Status>>,
    handle: Option<JoinHandle<Box<DecodeLoop>>>,
    parked: Option<Box<DecodeLoop>>,
    push_timeout: Duration,
    idle_interval: Duration,
}

impl DecodeWorker {
    pub(crate) fn spawn(decoder: Box<DecodeLoop>) -> Self {
        let mut worker = Self {
            queue: Arc::new(FrameQueue::new()),
            status: Default::default(),
            handle: None,
            push_timeout: decoder.config.queue_push_timeout,
            idle_interval: decoder.config.idle_poll_interval,
            parked: Some(decoder),
        };
        worker.resume();
        worker
    }

    fn resume(&mut self) {
        let Some(decoder) = self.parked.take() else {
            return;
        };

        *self.status.lock().unwrap() = Default::default();
        self.queue.restart();

        let queue = Arc::clone(&self.queue);
        let status = Arc::clone(&self.status);
        let push_timeout = self.push_timeout;
        let idle_interval = self.idle_interval;
        self.handle = Some(thread::spawn(move || {
            run(decoder, &queue, &status, push_timeout, idle_interval)
        }));
    }

    /// Stops the decode thread and takes the decode loop back. Pictures still queued are
    /// released.
    fn park(&mut self) -> Result<&mut DecodeLoop> {
        self.queue.stop();
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(decoder) => self.parked = Some(decoder),
                Err(_) => error!("decode thread panicked"),
            }
        }
        self.queue.clear();

        self.parked.as_deref_mut().ok_or(PipelineError::Failed)
    }

    /// Runs `f` on the decode loop while the thread is stopped, then restarts the thread.
    pub(crate) fn with_parked(
        &mut self,
        f: impl FnOnce(&mut DecodeLoop) -> Result<()>,
    ) -> Result<()> {
        let result = f(self.park()?);
        self.resume();
        result
    }

    pub(crate) fn next_picture(&mut self) -> Result<Option<DecodedPicture>> {
        if let Some(picture) = self.queue.try_pop() {
            return Ok(Some(picture));
        }

        let finished = self.handle.as_ref().map_or(true, |h| h.is_finished());
        let mut status = self.status.lock().unwrap();
        if let Some(e) = status.error.take() {
            status.error_reported = true;
            return Err(e);
        }
        if status.error_reported || (finished && !status.eos) {
            return Err(PipelineError::Failed);
        }

        Ok(None)
    }

    pub(crate) fn is_eos(&self) -> bool {
        self.status.lock().unwrap().eos && self.queue.is_empty()
    }

    pub(crate) fn shutdown(mut self) {
        if let Ok(decoder) = self.park() {
            decoder.close();
        }
    }
}

fn run(
    mut decoder: Box<DecodeLoop>,
    queue: &FrameQueue,
    status: &Mutex<Status>,
    push_timeout: Duration,
    idle_interval: Duration,
) -> Box<DecodeLoop> {
    debug!("decode thread started");

    while !queue.is_stopped() {
        match decoder.step() {
            Ok(Some(picture)) => match queue.push(picture, push_timeout) {
                PushOutcome::Queued => (),
                PushOutcome::ReplacedOldest => decoder.count_dropped(1),
                PushOutcome::Stopped(_) => break,
            },
            Ok(None) if decoder.is_eos() => {
                status.lock().unwrap().eos = true;
                break;
            }
            Ok(None) => thread::sleep(idle_interval),
            Err(e) if !e.is_terminal() => warn!("decode thread: {}", e),
            Err(e) => {
                status.lock().unwrap().error = Some(e);
                break;
            }
        }
    }

    debug!("decode thread exiting");
    decoder
}
