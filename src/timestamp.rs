// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Presentation timestamps of decoded pictures.

use log::debug;

use crate::backend::DecodedPicture;
use crate::stream::StreamDescriptor;
use crate::Rational;

/// Frame rate assumed when neither the stream nor the caller provide one.
pub const FALLBACK_FRAME_RATE: Rational = Rational::new(30, 1);

/// Fills in the timestamps the decoder did not report, by extrapolating from the last valid one.
pub struct TimestampNormalizer {
    /// Duration of one frame in stream time base units.
    frame_duration: Option<i64>,
    last_good: Option<i64>,
    synthesized: u64,
}

impl TimestampNormalizer {
    /// Infers the frame duration from, in order: the average frame rate of the stream, the
    /// guessed frame rate, `configured`, and [`FALLBACK_FRAME_RATE`].
    pub fn new(stream: &StreamDescriptor, configured: Option<Rational>) -> Self {
        let frame_duration = [
            stream.avg_frame_rate,
            stream.guessed_frame_rate,
            configured,
            Some(FALLBACK_FRAME_RATE),
        ]
        .into_iter()
        .flatten()
        .find_map(|rate| rate.frame_duration_in(stream.time_base));

        debug!(
            "frame duration {:?} in time base {}",
            frame_duration, stream.time_base
        );

        Self {
            frame_duration,
            last_good: None,
            synthesized: 0,
        }
    }

    pub fn frame_duration(&self) -> Option<i64> {
        self.frame_duration
    }

    /// Number of timestamps synthesized so far.
    pub fn synthesized(&self) -> u64 {
        self.synthesized
    }

    pub fn normalize(&mut self, picture: &mut DecodedPicture) {
        match picture.pts {
            Some(pts) => {
                picture.synthetic_pts = false;
                self.last_good = Some(pts);
            }
            None => {
                if let (Some(last), Some(duration)) = (self.last_good, self.frame_duration) {
                    let pts = last.saturating_add(duration);
                    picture.pts = Some(pts);
                    picture.synthetic_pts = true;
                    // Consecutive missing timestamps keep advancing.
                    self.last_good = Some(pts);
                    self.synthesized += 1;
                }
            }
        }
    }

    /// Forgets the last known timestamp, e.g. after a seek.
    pub fn reset(&mut self) {
        self.last_good = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OwnedPicture;
    use crate::DecodedFormat;
    use crate::EncodedFormat;
    use crate::Resolution;

    fn stream() -> StreamDescriptor {
        StreamDescriptor::new(
            EncodedFormat::H264,
            Resolution::from((2, 2)),
            Rational::new(1, 90_000),
        )
    }

    fn picture(pts: Option<i64>) -> DecodedPicture {
        DecodedPicture::new(
            Box::new(OwnedPicture(vec![0; 6])),
            Resolution::from((2, 2)),
            DecodedFormat::NV12,
            pts,
        )
    }

    #[test]
    fn synthesizes_missing_timestamp() {
        let mut stream = stream();
        stream.avg_frame_rate = Some(Rational::new(25, 1));
        let mut normalizer = TimestampNormalizer::new(&stream, None);
        assert_eq!(normalizer.frame_duration(), Some(3600));

        let mut first = picture(Some(1000));
        normalizer.normalize(&mut first);
        assert_eq!(first.pts, Some(1000));
        assert!(!first.synthetic_pts);

        let mut second = picture(None);
        normalizer.normalize(&mut second);
        assert_eq!(second.pts, Some(4600));
        assert!(second.synthetic_pts);

        let mut third = picture(None);
        normalizer.normalize(&mut third);
        assert_eq!(third.pts, Some(8200));
        assert_eq!(normalizer.synthesized(), 2);
    }

    #[test]
    fn no_timestamp_without_reference() {
        let mut normalizer = TimestampNormalizer::new(&stream(), None);

        let mut pic = picture(None);
        normalizer.normalize(&mut pic);
        assert_eq!(pic.pts, None);
        assert!(!pic.synthetic_pts);

        normalizer.normalize(&mut picture(Some(0)));
        normalizer.reset();
        let mut pic = picture(None);
        normalizer.normalize(&mut pic);
        assert_eq!(pic.pts, None);
    }

    #[test]
    fn frame_duration_priority() {
        let mut stream = stream();

        // Hard-coded fallback.
        let normalizer = TimestampNormalizer::new(&stream, None);
        assert_eq!(normalizer.frame_duration(), Some(3000));

        // Configured rate.
        let normalizer = TimestampNormalizer::new(&stream, Some(Rational::new(60, 1)));
        assert_eq!(normalizer.frame_duration(), Some(1500));

        // Guessed rate wins over the configured one, and invalid rates are skipped.
        stream.guessed_frame_rate = Some(Rational::new(50, 1));
        stream.avg_frame_rate = Some(Rational::new(0, 0));
        let normalizer = TimestampNormalizer::new(&stream, Some(Rational::new(60, 1)));
        assert_eq!(normalizer.frame_duration(), Some(1800));

        stream.avg_frame_rate = Some(Rational::new(24, 1));
        let normalizer = TimestampNormalizer::new(&stream, Some(Rational::new(60, 1)));
        assert_eq!(normalizer.frame_duration(), Some(3750));
    }

    #[test]
    fn invalid_time_base_gives_no_duration() {
        let mut stream = stream();
        stream.time_base = Rational::new(0, 1);
        let mut normalizer = TimestampNormalizer::new(&stream, None);
        assert_eq!(normalizer.frame_duration(), None);

        normalizer.normalize(&mut picture(Some(5)));
        let mut pic = picture(None);
        normalizer.normalize(&mut pic);
        assert_eq!(pic.pts, None);
    }
}
