// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded queue handing decoded pictures from the decode thread to the consumer.
//!
//! The queue is a fixed ring of [`FRAME_QUEUE_CAPACITY`] slots. A producer finding it full waits
//! for the consumer for a bounded time, then overwrites the oldest unread picture so decoding
//! never stalls behind a slow consumer. Stopping the queue wakes both sides up immediately.

use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use log::debug;

use crate::backend::DecodedPicture;

pub const FRAME_QUEUE_CAPACITY: usize = 3;

/// Outcome of [`FrameQueue::push`].
#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// The queue stayed full until the timeout and its oldest unread picture was dropped.
    ReplacedOldest,
    /// The queue is stopped. The picture is handed back.
    Stopped(DecodedPicture),
}

#[derive(Default)]
struct Ring {
    slots: [Option<DecodedPicture>; FRAME_QUEUE_CAPACITY],
    read: usize,
    write: usize,
    count: usize,
    stopped: bool,
    dropped: u64,
}

impl Ring {
    fn store(&mut self, picture: DecodedPicture) {
        self.slots[self.write] = Some(picture);
        self.write = (self.write + 1) % FRAME_QUEUE_CAPACITY;
        self.count += 1;
    }

    fn take(&mut self) -> Option<DecodedPicture> {
        if self.count == 0 {
            return None;
        }
        let picture = self.slots[self.read].take();
        self.read = (self.read + 1) % FRAME_QUEUE_CAPACITY;
        self.count -= 1;
        picture
    }

    fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.read = 0;
        self.write = 0;
        self.count = 0;
    }
}

#[derive(Default)]
pub struct FrameQueue {
    ring: Mutex<Ring>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl FrameQueue {
    pub fn new() -> Self {
        Default::default()
    }

    /// Queues `picture`, waiting at most `timeout` for a free slot.
    pub fn push(&self, picture: DecodedPicture, timeout: Duration) -> PushOutcome {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock().unwrap();

        while ring.count == FRAME_QUEUE_CAPACITY && !ring.stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            ring = self.not_full.wait_timeout(ring, deadline - now).unwrap().0;
        }

        if ring.stopped {
            return PushOutcome::Stopped(picture);
        }

        let outcome = if ring.count == FRAME_QUEUE_CAPACITY {
            let oldest = ring.take();
            ring.dropped += 1;
            debug!(
                "frame queue full, dropping picture {:?}",
                oldest.map(|p| p.sequence)
            );
            PushOutcome::ReplacedOldest
        } else {
            PushOutcome::Queued
        };

        ring.store(picture);
        self.not_empty.notify_one();
        outcome
    }

    /// Takes the oldest picture without waiting.
    pub fn try_pop(&self) -> Option<DecodedPicture> {
        let mut ring = self.ring.lock().unwrap();
        let picture = ring.take();
        if picture.is_some() {
            self.not_full.notify_one();
        }
        picture
    }

    /// Takes the oldest picture, waiting at most `timeout` for one. Returns `None` right away if
    /// the queue is stopped and empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<DecodedPicture> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock().unwrap();

        while ring.count == 0 && !ring.stopped {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            ring = self.not_empty.wait_timeout(ring, deadline - now).unwrap().0;
        }

        let picture = ring.take();
        if picture.is_some() {
            self.not_full.notify_one();
        }
        picture
    }

    /// Wakes up both sides and makes further pushes fail. Queued pictures can still be popped.
    pub fn stop(&self) {
        self.ring.lock().unwrap().stopped = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Accepts pushes again after [`FrameQueue::stop`].
    pub fn restart(&self) {
        self.ring.lock().unwrap().stopped = false;
    }

    /// Releases all the queued pictures.
    pub fn clear(&self) {
        self.ring.lock().unwrap().clear();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stopped(&self) -> bool {
        self.ring.lock().unwrap().stopped
    }

    /// Number of pictures overwritten before being consumed.
    pub fn dropped(&self) -> u64 {
        self.ring.lock().unwrap().dropped
    }
}
