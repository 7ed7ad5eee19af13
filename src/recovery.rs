// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Recovery state machine.
//!
//! Observes the outcome of every submission and reception and decides when the decoder is stuck
//! and how invasive the remedy must be:
//!
//! 1. a run of `backpressure_limit` empty receives triggers a parser reset,
//! 2. `reset_threshold` parser resets without a frame trigger a deep reset (reopening the
//!    decoder in place), once,
//! 3. further parser resets switch to the software decoder, or are fatal if the software decoder
//!    is already in use,
//! 4. independently, a watchdog switches to the software decoder if the hardware decoder does
//!    not produce anything in time after the first keyframe.
//!
//! Any frame zeroes all the counters. If a deep reset was needed to get that frame, the reset
//! threshold is lowered by one so the next stall is handled faster.
//!
//! This type only takes decisions; carrying them out is up to the caller.

use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::warn;

use crate::config::RecoveryConfig;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecoveryState {
    Normal,
    /// The given number of parser resets happened since the last frame.
    ParserReset(u32),
    DeepResetAttempted,
    SoftwareFallback,
    /// Terminal.
    Fatal,
}

/// What the caller must do next.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    None,
    /// Reinitialize the assembler and normalizer and flush the decoder.
    ParserReset,
    /// Reopen the decoder in place.
    DeepReset,
    /// Replace the hardware decoder with the software one.
    Fallback,
    /// Give up.
    Fatal,
}

pub struct Recovery {
    config: RecoveryConfig,
    state: RecoveryState,
    /// Current parser reset threshold, lowered after successful deep resets.
    threshold: u32,
    software: bool,

    /// Consecutive empty receives.
    streak: u32,
    /// Empty receives since the last frame.
    empty_since_frame: u64,
    /// Parser resets since the last frame.
    parser_resets: u32,
    deep_reset_attempted: bool,
    deep_reset_succeeded: bool,
    first_submit: Option<Instant>,
    last_frame: Option<Instant>,
    /// Units accepted by the decoder since the last frame.
    units_since_frame: u32,
    /// Frames produced by the current session.
    session_frames: u64,
}

impl Recovery {
    pub fn new(config: RecoveryConfig, software: bool) -> Self {
        let threshold = config.reset_threshold;
        Self {
            config,
            state: if software {
                RecoveryState::SoftwareFallback
            } else {
                RecoveryState::Normal
            },
            threshold,
            software,
            streak: 0,
            empty_since_frame: 0,
            parser_resets: 0,
            deep_reset_attempted: false,
            deep_reset_succeeded: false,
            first_submit: None,
            last_frame: None,
            units_since_frame: 0,
            session_frames: 0,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn is_fatal(&self) -> bool {
        self.state == RecoveryState::Fatal
    }

    pub fn reset_threshold(&self) -> u32 {
        self.threshold
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn empty_since_frame(&self) -> u64 {
        self.empty_since_frame
    }

    pub fn units_since_frame(&self) -> u32 {
        self.units_since_frame
    }

    pub fn last_frame(&self) -> Option<Instant> {
        self.last_frame
    }

    fn idle_state(&self) -> RecoveryState {
        if self.software {
            RecoveryState::SoftwareFallback
        } else {
            RecoveryState::Normal
        }
    }

    /// Called before every submission attempt.
    pub fn on_submit_attempt(&mut self, now: Instant) {
        self.first_submit.get_or_insert(now);
    }

    /// Called when the decoder accepted a unit.
    pub fn on_submitted(&mut self) {
        self.units_since_frame = self.units_since_frame.saturating_add(1);
    }

    /// Called when the decoder produced a frame.
    pub fn on_frame(&mut self, now: Instant) {
        if self.deep_reset_succeeded {
            let threshold = self
                .threshold
                .saturating_sub(1)
                .max(self.config.reset_threshold_floor);
            if threshold != self.threshold {
                debug!("reset threshold lowered to {}", threshold);
            }
            self.threshold = threshold;
        }

        self.streak = 0;
        self.empty_since_frame = 0;
        self.parser_resets = 0;
        self.deep_reset_attempted = false;
        self.deep_reset_succeeded = false;
        self.units_since_frame = 0;
        self.last_frame = Some(now);
        self.session_frames += 1;
        if self.state != RecoveryState::Fatal {
            self.state = self.idle_state();
        }
    }

    /// Called when a receive returned nothing.
    pub fn on_empty_receive(&mut self) -> RecoveryAction {
        if self.is_fatal() {
            return RecoveryAction::Fatal;
        }

        self.streak += 1;
        self.empty_since_frame += 1;
        if self.streak < self.config.backpressure_limit {
            return RecoveryAction::None;
        }

        self.streak = 0;
        self.parser_resets += 1;

        if self.parser_resets < self.threshold {
            warn!(
                "no output after {} polls, parser reset {}/{}",
                self.config.backpressure_limit, self.parser_resets, self.threshold
            );
            self.state = RecoveryState::ParserReset(self.parser_resets);
            return RecoveryAction::ParserReset;
        }

        self.parser_resets = 0;
        if !self.deep_reset_attempted {
            warn!("{} parser resets without output, deep reset", self.threshold);
            self.deep_reset_attempted = true;
            self.state = RecoveryState::DeepResetAttempted;
            RecoveryAction::DeepReset
        } else {
            self.escalate()
        }
    }

    /// Reports the outcome of a deep reset. Returns the next step if it failed.
    pub fn on_deep_reset(&mut self, success: bool) -> RecoveryAction {
        if success {
            self.deep_reset_succeeded = true;
            self.streak = 0;
            RecoveryAction::None
        } else {
            warn!("deep reset failed");
            self.escalate()
        }
    }

    fn escalate(&mut self) -> RecoveryAction {
        if self.software {
            self.state = RecoveryState::Fatal;
            RecoveryAction::Fatal
        } else {
            RecoveryAction::Fallback
        }
    }

    /// Checks whether the hardware decoder took too long to produce anything. Only meaningful
    /// once the first keyframe has been submitted.
    pub fn check_watchdog(&self, now: Instant) -> RecoveryAction {
        if self.software || self.is_fatal() {
            return RecoveryAction::None;
        }

        if self.session_frames == 0 {
            if let Some(elapsed) = self.since_first_submit(now) {
                if elapsed > self.config.watchdog_timeout {
                    warn!("watchdog: no frame {:?} after the first submission", elapsed);
                    return RecoveryAction::Fallback;
                }
            }
        }

        if self.units_since_frame > self.config.watchdog_packet_limit {
            warn!("watchdog: {} units submitted without a frame", self.units_since_frame);
            return RecoveryAction::Fallback;
        }

        RecoveryAction::None
    }

    /// Called once the software decoder replaced the hardware one. Zeroes every counter and
    /// clears a fatal state.
    pub fn on_fallback(&mut self) {
        self.software = true;
        self.state = RecoveryState::SoftwareFallback;
        self.clear_counters();
        self.session_frames = 0;
        self.first_submit = None;
        self.last_frame = None;
    }

    /// Called after a seek: the decoder starts over from a new position.
    pub fn on_seek(&mut self) {
        self.clear_counters();
        self.first_submit = None;
        if self.state != RecoveryState::Fatal {
            self.state = self.idle_state();
        }
    }

    pub fn mark_fatal(&mut self) {
        self.state = RecoveryState::Fatal;
    }

    fn clear_counters(&mut self) {
        self.streak = 0;
        self.empty_since_frame = 0;
        self.parser_resets = 0;
        self.deep_reset_attempted = false;
        self.deep_reset_succeeded = false;
        self.units_since_frame = 0;
    }

    /// Time since the first submission of the session, if any.
    pub fn since_first_submit(&self, now: Instant) -> Option<Duration> {
        self.first_submit
            .map(|first| now.saturating_duration_since(first))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hardware() -> Recovery {
        Recovery::new(RecoveryConfig::default(), false)
    }

    fn empty_receives(recovery: &mut Recovery, count: usize) -> Vec<RecoveryAction> {
        (0..count)
            .map(|_| recovery.on_empty_receive())
            .filter(|a| *a != RecoveryAction::None)
            .collect()
    }

    #[test]
    fn sixty_empty_receives_give_one_parser_reset() {
        let mut recovery = hardware();

        let actions = empty_receives(&mut recovery, 60);

        assert_eq!(actions, vec![RecoveryAction::ParserReset]);
        assert_eq!(recovery.state(), RecoveryState::ParserReset(1));
        assert_eq!(recovery.streak(), 10);
        assert_eq!(recovery.empty_since_frame(), 60);
    }

    #[test]
    fn escalation_ladder() {
        let mut recovery = hardware();

        assert_eq!(
            empty_receives(&mut recovery, 150),
            vec![
                RecoveryAction::ParserReset,
                RecoveryAction::ParserReset,
                RecoveryAction::DeepReset
            ]
        );
        assert_eq!(recovery.state(), RecoveryState::DeepResetAttempted);
        assert_eq!(recovery.on_deep_reset(true), RecoveryAction::None);

        // Still stuck after the deep reset.
        assert_eq!(
            empty_receives(&mut recovery, 150),
            vec![
                RecoveryAction::ParserReset,
                RecoveryAction::ParserReset,
                RecoveryAction::Fallback
            ]
        );

        recovery.on_fallback();
        assert_eq!(recovery.state(), RecoveryState::SoftwareFallback);
        assert_eq!(recovery.empty_since_frame(), 0);

        // On software the ladder ends with a fatal error.
        assert_eq!(
            empty_receives(&mut recovery, 300),
            vec![
                RecoveryAction::ParserReset,
                RecoveryAction::ParserReset,
                RecoveryAction::DeepReset,
                RecoveryAction::ParserReset,
                RecoveryAction::ParserReset,
                RecoveryAction::Fatal
            ]
        );
        assert!(recovery.is_fatal());
        assert_eq!(recovery.on_empty_receive(), RecoveryAction::Fatal);
    }

    #[test]
    fn failed_deep_reset_falls_back() {
        let mut recovery = hardware();
        empty_receives(&mut recovery, 150);

        assert_eq!(recovery.on_deep_reset(false), RecoveryAction::Fallback);
    }

    #[test]
    fn frame_zeroes_counters_and_anneals_threshold() {
        let mut recovery = hardware();
        let now = Instant::now();

        empty_receives(&mut recovery, 150);
        recovery.on_deep_reset(true);
        recovery.on_submitted();
        recovery.on_frame(now);

        assert_eq!(recovery.state(), RecoveryState::Normal);
        assert_eq!(recovery.reset_threshold(), 2);
        assert_eq!(recovery.streak(), 0);
        assert_eq!(recovery.units_since_frame(), 0);
        assert_eq!(recovery.last_frame(), Some(now));

        // Next time the deep reset comes after two parser resets only.
        assert_eq!(
            empty_receives(&mut recovery, 100),
            vec![RecoveryAction::ParserReset, RecoveryAction::DeepReset]
        );
        recovery.on_deep_reset(true);
        recovery.on_frame(now);
        assert_eq!(recovery.reset_threshold(), 1);

        // Bounded by the floor.
        empty_receives(&mut recovery, 50);
        recovery.on_deep_reset(true);
        recovery.on_frame(now);
        assert_eq!(recovery.reset_threshold(), 1);
    }

    #[test]
    fn frame_without_deep_reset_keeps_threshold() {
        let mut recovery = hardware();
        empty_receives(&mut recovery, 100);
        recovery.on_frame(Instant::now());
        assert_eq!(recovery.reset_threshold(), 3);
    }

    #[test]
    fn watchdog_packet_limit() {
        let mut recovery = hardware();
        let now = Instant::now();
        recovery.on_submit_attempt(now);

        for _ in 0..100 {
            recovery.on_submitted();
        }
        assert_eq!(recovery.check_watchdog(now), RecoveryAction::None);

        recovery.on_submitted();
        assert_eq!(recovery.check_watchdog(now), RecoveryAction::Fallback);

        recovery.on_fallback();
        for _ in 0..200 {
            recovery.on_submitted();
        }
        assert_eq!(recovery.check_watchdog(now), RecoveryAction::None);
    }

    #[test]
    fn watchdog_timeout_only_without_frames() {
        let mut recovery = hardware();
        let start = Instant::now();
        recovery.on_submit_attempt(start);

        let late = start + Duration::from_secs(3);
        assert_eq!(recovery.check_watchdog(late), RecoveryAction::Fallback);
        assert_eq!(recovery.since_first_submit(late), Some(Duration::from_secs(3)));

        recovery.on_frame(start);
        assert_eq!(recovery.check_watchdog(late), RecoveryAction::None);
    }

    #[test]
    fn seek_clears_counters() {
        let mut recovery = hardware();
        empty_receives(&mut recovery, 70);
        recovery.on_submitted();

        recovery.on_seek();
        assert_eq!(recovery.state(), RecoveryState::Normal);
        assert_eq!(recovery.streak(), 0);
        assert_eq!(recovery.units_since_frame(), 0);
    }
}
