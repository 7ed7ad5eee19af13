// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode session: exclusive owner of one decoder backend.

use log::debug;
use log::error;
use log::info;

use crate::backend::BackendError;
use crate::backend::BackendFactory;
use crate::backend::BackendKind;
use crate::backend::BackendResult;
use crate::backend::DecoderBackend;
use crate::backend::ReceiveStatus;
use crate::backend::SubmitStatus;
use crate::stream::AccessUnit;
use crate::stream::StreamDescriptor;
use crate::DecodedFormat;

/// Wraps a [`DecoderBackend`] with the session lifecycle.
///
/// Once closed, or once the backend returned a fatal error, the backend is not called anymore:
/// every operation fails with [`BackendError::Closed`] until the session is reopened.
pub struct DecodeSession {
    backend: Box<dyn DecoderBackend>,
    name: &'static str,
    software: bool,
    format: DecodedFormat,
    closed: bool,
    failed: bool,
    next_sequence: u64,
}

impl DecodeSession {
    pub fn new(backend: Box<dyn DecoderBackend>) -> Self {
        let name = backend.name();
        let software = backend.is_software();
        let format = backend.output_format();
        info!(
            "opened {} decode session ({}), output format {:?}",
            if software { "software" } else { "hardware" },
            name,
            format
        );

        Self {
            backend,
            name,
            software,
            format,
            closed: false,
            failed: false,
            next_sequence: 0,
        }
    }

    pub fn open(
        factory: &mut dyn BackendFactory,
        kind: BackendKind,
        stream: &StreamDescriptor,
    ) -> BackendResult<Self> {
        factory.open(kind, stream).map(Self::new)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_software(&self) -> bool {
        self.software
    }

    /// Pixel format negotiated with the backend.
    pub fn output_format(&self) -> DecodedFormat {
        self.format
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Whether the backend returned a fatal error.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    fn check_usable(&self) -> BackendResult<()> {
        if self.closed || self.failed {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }

    fn track<T>(&mut self, result: BackendResult<T>) -> BackendResult<T> {
        if let Err(e) = &result {
            if !e.is_recoverable() {
                error!("{}: fatal error: {}", self.name, e);
                self.failed = true;
            }
        }
        result
    }

    pub fn submit(&mut self, unit: AccessUnit) -> BackendResult<SubmitStatus> {
        self.check_usable()?;
        debug!(
            "{}: submit {} bytes, pts {:?}, keyframe {}",
            self.name,
            unit.data.len(),
            unit.pts,
            unit.keyframe
        );
        let result = self.backend.submit(unit);
        self.track(result)
    }

    /// Submits the end of stream marker.
    pub fn drain(&mut self) -> BackendResult<()> {
        self.check_usable()?;
        debug!("{}: drain", self.name);
        let result = self.backend.drain();
        self.track(result)
    }

    pub fn receive(&mut self) -> BackendResult<ReceiveStatus> {
        self.check_usable()?;
        let result = self.backend.receive();
        match self.track(result)? {
            ReceiveStatus::Frame(mut picture) => {
                picture.sequence = self.next_sequence;
                self.next_sequence += 1;
                Ok(ReceiveStatus::Frame(picture))
            }
            status => Ok(status),
        }
    }

    /// Drops the pending input and output of the decoder.
    pub fn flush(&mut self) -> BackendResult<()> {
        self.check_usable()?;
        let result = self.backend.flush();
        self.track(result)
    }

    /// Recreates the decoding state of the backend in place. Clears a previous fatal error on
    /// success.
    pub fn reopen(&mut self) -> BackendResult<()> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        info!("{}: reopening", self.name);
        let result = self.backend.reopen();
        if result.is_ok() {
            self.failed = false;
        }
        self.track(result)
    }

    /// Releases the backend. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        info!("{}: closing after {} pictures", self.name, self.next_sequence);
        self.backend.close();
        self.closed = true;
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::dummy::DummyLog;
    use crate::backend::dummy::DummyScript;
    use crate::Resolution;

    fn session(script: DummyScript) -> (DecodeSession, Arc<Mutex<DummyLog>>) {
        let log = Arc::new(Mutex::new(DummyLog::default()));
        let backend = DummyBackend::new(
            BackendKind::Hardware,
            script,
            Resolution::from((4, 4)),
            Arc::clone(&log),
        );
        (DecodeSession::new(Box::new(backend)), log)
    }

    fn unit() -> AccessUnit {
        AccessUnit {
            data: vec![0, 0, 1, 0x65],
            keyframe: true,
            ..Default::default()
        }
    }

    #[test]
    fn sequence_numbers() {
        let (mut session, _) = session(Default::default());
        assert!(!session.is_software());
        assert_eq!(session.output_format(), DecodedFormat::NV12);

        for expected in 0..3 {
            session.submit(unit()).unwrap();
            match session.receive().unwrap() {
                ReceiveStatus::Frame(picture) => assert_eq!(picture.sequence, expected),
                status => panic!("unexpected {:?}", status),
            }
        }
    }

    #[test]
    fn close_is_idempotent() {
        let (mut session, log) = session(Default::default());
        session.close();
        session.close();
        drop(session);

        assert_eq!(log.lock().unwrap().closes, 1);
    }

    #[test]
    fn operations_after_close_fail() {
        let (mut session, _) = session(Default::default());
        session.close();

        assert!(!session.is_open());
        assert!(matches!(session.submit(unit()), Err(BackendError::Closed)));
        assert!(matches!(session.receive(), Err(BackendError::Closed)));
        assert!(matches!(session.flush(), Err(BackendError::Closed)));
        assert!(matches!(session.reopen(), Err(BackendError::Closed)));
    }

    #[test]
    fn no_submit_after_fatal_error() {
        let (mut session, log) = session(DummyScript {
            fatal_after_frames: Some(0),
            ..Default::default()
        });

        session.submit(unit()).unwrap();
        assert!(matches!(session.receive(), Err(BackendError::Other(_))));
        assert!(session.is_failed());

        assert!(matches!(session.submit(unit()), Err(BackendError::Closed)));
        assert_eq!(log.lock().unwrap().submits_after_fatal, 0);

        session.reopen().unwrap();
        assert!(!session.is_failed());
    }

    #[test]
    fn rejected_unit_is_recoverable() {
        let (mut session, _) = session(DummyScript {
            reject: vec![0],
            ..Default::default()
        });

        let err = session.submit(unit()).unwrap_err();
        assert!(err.is_recoverable());
        assert!(!session.is_failed());
        assert!(matches!(session.submit(unit()), Ok(SubmitStatus::Accepted)));
    }
}
