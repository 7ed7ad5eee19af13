// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Tunables of the decode pipeline.
//!
//! Every value has a default suited to the M2M decoders this crate was tuned against. The
//! escalation thresholds are hardware dependent and can be overridden from the environment with
//! [`PipelineConfig::from_env`].

use std::str::FromStr;
use std::time::Duration;

use log::warn;
use thiserror::Error;

use crate::Rational;

pub const ENV_BACKPRESSURE_LIMIT: &str = "M2M_DECODE_BACKPRESSURE_LIMIT";
pub const ENV_RESET_THRESHOLD: &str = "M2M_DECODE_RESET_THRESHOLD";
pub const ENV_WATCHDOG_MS: &str = "M2M_DECODE_WATCHDOG_MS";
pub const ENV_WATCHDOG_PACKETS: &str = "M2M_DECODE_WATCHDOG_PACKETS";
pub const ENV_FORCE_SOFTWARE: &str = "M2M_DECODE_FORCE_SOFTWARE";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("reset threshold floor ({floor}) is above the reset threshold ({threshold})")]
    FloorAboveThreshold { floor: u32, threshold: u32 },
    #[error("unsupported NAL length size {0}")]
    NalLengthSize(usize),
}

/// Escalation thresholds of the recovery state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Consecutive empty receives that trigger a parser reset.
    pub backpressure_limit: u32,
    /// Parser resets after which a deep reset is attempted.
    pub reset_threshold: u32,
    /// Lowest value the reset threshold can be annealed to.
    pub reset_threshold_floor: u32,
    /// Time without any frame after the first submission before falling back to software.
    pub watchdog_timeout: Duration,
    /// Access units submitted since the last frame before falling back to software.
    pub watchdog_packet_limit: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            backpressure_limit: 50,
            reset_threshold: 3,
            reset_threshold_floor: 1,
            watchdog_timeout: Duration::from_secs(2),
            watchdog_packet_limit: 100,
        }
    }
}

impl RecoveryConfig {
    /// Applies the overrides found in the environment. Invalid values are ignored.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = parse_var(&lookup, ENV_BACKPRESSURE_LIMIT) {
            self.backpressure_limit = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_RESET_THRESHOLD) {
            self.reset_threshold = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, ENV_WATCHDOG_MS) {
            self.watchdog_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, ENV_WATCHDOG_PACKETS) {
            self.watchdog_packet_limit = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backpressure_limit == 0 {
            return Err(ConfigError::Zero("backpressure_limit"));
        }
        if self.reset_threshold == 0 {
            return Err(ConfigError::Zero("reset_threshold"));
        }
        if self.reset_threshold_floor == 0 {
            return Err(ConfigError::Zero("reset_threshold_floor"));
        }
        if self.reset_threshold_floor > self.reset_threshold {
            return Err(ConfigError::FloorAboveThreshold {
                floor: self.reset_threshold_floor,
                threshold: self.reset_threshold,
            });
        }
        if self.watchdog_timeout.is_zero() {
            return Err(ConfigError::Zero("watchdog_timeout"));
        }
        if self.watchdog_packet_limit == 0 {
            return Err(ConfigError::Zero("watchdog_packet_limit"));
        }
        Ok(())
    }
}

/// Options of the bitstream normalizer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizerConfig {
    /// Use the filter chain. When false, or when the configuration record cannot be parsed, the
    /// manual in-place reframe is used instead.
    pub use_filter_chain: bool,
    /// Remove SEI units before submission.
    pub strip_sei: bool,
    /// Guarantee one access unit delimiter per unit.
    pub insert_aud: bool,
    /// Length prefix size assumed when the stream does not provide one.
    pub nal_length_size: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            use_filter_chain: true,
            strip_sei: true,
            insert_aud: false,
            nal_length_size: 4,
        }
    }
}

/// Configuration of a [`crate::pipeline::Pipeline`].
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub recovery: RecoveryConfig,
    pub normalizer: NormalizerConfig,
    /// Wall-clock budget of one cooperative `get_next_picture` call.
    pub time_budget: Duration,
    /// Maximum access units submitted per call until frames flow steadily.
    pub initial_packet_cap: u32,
    /// Maximum access units submitted per call afterwards.
    pub steady_packet_cap: u32,
    /// Frames after which the steady cap applies.
    pub steady_after_frames: u64,
    /// How long the end of stream drain may keep returning empty before giving up.
    pub drain_timeout: Duration,
    /// Decode on a dedicated thread and hand pictures over through the frame queue.
    pub threaded: bool,
    /// How long the decode thread waits for room in a full queue before replacing the oldest
    /// picture.
    pub queue_push_timeout: Duration,
    /// Sleep of the decode thread between iterations that produced nothing.
    pub idle_poll_interval: Duration,
    /// Frame rate to assume when the stream does not report one.
    pub configured_frame_rate: Option<Rational>,
    /// Skip the hardware decoder entirely.
    pub force_software: bool,
    /// Largest partial access unit the assembler buffers.
    pub max_pending_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            recovery: Default::default(),
            normalizer: Default::default(),
            time_budget: Duration::from_millis(12),
            initial_packet_cap: 32,
            steady_packet_cap: 8,
            steady_after_frames: 10,
            drain_timeout: Duration::from_millis(500),
            threaded: false,
            queue_push_timeout: Duration::from_millis(250),
            idle_poll_interval: Duration::from_millis(1),
            configured_frame_rate: None,
            force_software: false,
            max_pending_bytes: 16 * 1024 * 1024,
        }
    }
}

impl PipelineConfig {
    /// Default configuration with the environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.recovery.apply_overrides(&lookup);
        if let Some(v) = lookup(ENV_FORCE_SOFTWARE) {
            self.force_software = matches!(v.trim(), "1" | "true" | "yes" | "on");
        }
    }

    /// Time budget of a call for a stream running at `frame_rate`.
    ///
    /// High frame rate streams get half again the base budget.
    pub fn time_budget_for(&self, frame_rate: Option<Rational>) -> Duration {
        match frame_rate {
            Some(rate) if rate.as_f64() > 50.0 => self.time_budget.mul_f64(1.5),
            _ => self.time_budget,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.recovery.validate()?;
        if !(1..=4).contains(&self.normalizer.nal_length_size) {
            return Err(ConfigError::NalLengthSize(self.normalizer.nal_length_size));
        }
        if self.time_budget.is_zero() {
            return Err(ConfigError::Zero("time_budget"));
        }
        if self.initial_packet_cap == 0 {
            return Err(ConfigError::Zero("initial_packet_cap"));
        }
        if self.steady_packet_cap == 0 {
            return Err(ConfigError::Zero("steady_packet_cap"));
        }
        if self.max_pending_bytes == 0 {
            return Err(ConfigError::Zero("max_pending_bytes"));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let value = lookup(name)?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring invalid value {:?} for {}", value, name);
            None
        }
    }
}
