// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bitstream normalizer: turns the packets of the demuxer into delimiter-framed data.
//!
//! Three modes are supported, chosen once from the stream extradata:
//!
//! * passthrough, for streams that are already delimiter framed (or have no extradata at all),
//! * the [`FilterChain`], for container-framed streams with a valid configuration record,
//! * a manual reframe, used when the filter chain is disabled or the configuration record could
//!   not be parsed. 4-byte prefixes are rewritten in place.

use log::debug;
use log::info;
use log::warn;

use crate::bitstream_utils::is_delimiter_framed;
use crate::bitstream_utils::read_length_prefixed;
use crate::bitstream_utils::AnnexBUnits;
use crate::bitstream_utils::START_CODE;
use crate::codec;
use crate::config::NormalizerConfig;
use crate::filter::FilterChain;
use crate::filter::Result;
use crate::stream::Packet;
use crate::stream::StreamDescriptor;
use crate::EncodedFormat;

enum Mode {
    Passthrough(Passthrough),
    Chain(FilterChain),
    Manual(ManualReframe),
}

pub struct Normalizer {
    mode: Mode,
    /// Packets in, packets out.
    counts: (u64, u64),
}

impl Normalizer {
    pub fn new(stream: &StreamDescriptor, config: &NormalizerConfig) -> Self {
        let extradata = &stream.extradata;

        let mode = if extradata.is_empty() || is_delimiter_framed(extradata) {
            info!("normalizer: passthrough ({} bytes of extradata)", extradata.len());
            Mode::Passthrough(Passthrough::new(stream.codec, extradata.clone()))
        } else {
            match codec::parse_config_record(stream.codec, extradata) {
                Ok(record) if config.use_filter_chain => {
                    info!(
                        "normalizer: filter chain, {}-byte length prefixes, {} parameter sets",
                        record.nal_length_size,
                        record.parameter_sets.len()
                    );
                    Mode::Chain(FilterChain::for_container(stream.codec, &record, config))
                }
                Ok(record) => {
                    info!("normalizer: manual reframe, {}-byte length prefixes", record.nal_length_size);
                    Mode::Manual(ManualReframe::new(
                        stream.codec,
                        record.nal_length_size,
                        record.to_annex_b(),
                    ))
                }
                Err(e) => {
                    warn!(
                        "cannot parse configuration record ({:#}), manual reframe with {}-byte length prefixes",
                        e, config.nal_length_size
                    );
                    Mode::Manual(ManualReframe::new(
                        stream.codec,
                        config.nal_length_size,
                        Vec::new(),
                    ))
                }
            }
        };

        Self { mode, counts: (0, 0) }
    }

    /// Normalizes one packet. Returns `None` when the packet vanished, e.g. because it only
    /// carried SEI units that were stripped.
    ///
    /// Errors are permanent stream errors and must not be retried.
    pub fn normalize(&mut self, packet: Packet) -> Result<Option<Packet>> {
        self.counts.0 += 1;

        let out = match &mut self.mode {
            Mode::Passthrough(p) => Some(p.normalize(packet)),
            Mode::Chain(chain) => chain.filter(packet)?,
            Mode::Manual(manual) => Some(manual.normalize(packet)?),
        };

        if out.is_some() {
            self.counts.1 += 1;
        }

        Ok(out)
    }

    /// Signals the end of the stream.
    pub fn finish(&mut self) -> Result<()> {
        debug!("normalizer: {} packets in, {} out", self.counts.0, self.counts.1);
        match &mut self.mode {
            Mode::Chain(chain) => chain.finish(),
            _ => Ok(()),
        }
    }

    /// Restores the state of a freshly opened stream, e.g. after a seek.
    pub fn reset(&mut self) {
        match &mut self.mode {
            Mode::Passthrough(p) => p.reset(),
            Mode::Chain(chain) => chain.reset(),
            Mode::Manual(_) => (),
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self.mode {
            Mode::Passthrough(_) => "passthrough",
            Mode::Chain(_) => "filter chain",
            Mode::Manual(_) => "manual",
        }
    }
}

/// Leaves the data untouched, but prepends delimiter-framed extradata once at the start of the
/// stream unless the stream carries its own parameter sets.
struct Passthrough {
    codec: EncodedFormat,
    extradata: Vec<u8>,
    pending: bool,
}

impl Passthrough {
    fn new(codec: EncodedFormat, extradata: Vec<u8>) -> Self {
        let pending = !extradata.is_empty();
        Self {
            codec,
            extradata,
            pending,
        }
    }

    fn normalize(&mut self, mut packet: Packet) -> Packet {
        if !self.pending {
            return packet;
        }
        self.pending = false;

        let in_band = AnnexBUnits::new(&packet.data).any(|nalu| {
            codec::classify(self.codec, nalu).map_or(false, |info| info.parameter_set)
        });
        if !in_band {
            let mut data = Vec::with_capacity(self.extradata.len() + packet.data.len());
            data.extend_from_slice(&self.extradata);
            data.append(&mut packet.data);
            packet.data = data;
        }

        packet
    }

    fn reset(&mut self) {
        self.pending = !self.extradata.is_empty();
    }
}

/// Reframes length-prefixed packets without a filter chain.
struct ManualReframe {
    codec: EncodedFormat,
    nal_length_size: usize,
    parameter_sets: Vec<u8>,
}

impl ManualReframe {
    fn new(codec: EncodedFormat, nal_length_size: usize, parameter_sets: Vec<u8>) -> Self {
        Self {
            codec,
            nal_length_size,
            parameter_sets,
        }
    }

    fn normalize(&mut self, mut packet: Packet) -> Result<Packet> {
        // Validate every prefix before touching the data.
        let mut offsets = Vec::new();
        let mut in_band_parameter_sets = false;
        let mut pos = 0;
        while pos < packet.data.len() {
            let nalu = read_length_prefixed(&packet.data, pos, self.nal_length_size)?;
            in_band_parameter_sets |= !nalu.is_empty()
                && codec::classify(self.codec, nalu).map_or(false, |info| info.parameter_set);
            offsets.push((pos, nalu.len()));
            pos += self.nal_length_size + nalu.len();
        }

        let mut data = if self.nal_length_size == START_CODE.len() {
            for (pos, _) in &offsets {
                packet.data[*pos..*pos + START_CODE.len()].copy_from_slice(&START_CODE);
            }
            std::mem::take(&mut packet.data)
        } else {
            let mut data = Vec::with_capacity(packet.data.len() + offsets.len() * START_CODE.len());
            for (pos, len) in &offsets {
                let start = pos + self.nal_length_size;
                data.extend_from_slice(&START_CODE);
                data.extend_from_slice(&packet.data[start..start + len]);
            }
            data
        };

        if packet.keyframe && !in_band_parameter_sets && !self.parameter_sets.is_empty() {
            let mut with_ps = Vec::with_capacity(self.parameter_sets.len() + data.len());
            with_ps.extend_from_slice(&self.parameter_sets);
            with_ps.append(&mut data);
            data = with_ps;
        }

        packet.data = data;
        Ok(packet)
    }
}
