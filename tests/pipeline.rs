// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end tests of the pipeline against scripted dummy decoders.

use std::thread;
use std::time::Duration;

use m2m_decode::backend::dummy::DummyFactory;
use m2m_decode::backend::dummy::DummyScript;
use m2m_decode::backend::BackendError;
use m2m_decode::backend::BackendKind;
use m2m_decode::backend::DecodedPicture;
use m2m_decode::config::PipelineConfig;
use m2m_decode::pipeline::Pipeline;
use m2m_decode::pipeline::PipelineError;
use m2m_decode::stream::MemorySource;
use m2m_decode::stream::Packet;
use m2m_decode::stream::StreamDescriptor;
use m2m_decode::EncodedFormat;
use m2m_decode::Rational;
use m2m_decode::Resolution;

const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1e];
const PPS: &[u8] = &[0x68, 0xce];
const IDR: &[u8] = &[0x65, 0x88, 0x84];
const P: &[u8] = &[0x41, 0x9a, 0x02];

/// Ticks of a 1/90000 time base per frame at 30 fps.
const FRAME: i64 = 3000;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn annex_b(units: &[&[u8]]) -> Vec<u8> {
    let mut out = vec![];
    for unit in units {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(unit);
    }
    out
}

fn packet(index: usize, keyframe: bool) -> Packet {
    let data = if keyframe {
        annex_b(&[SPS, PPS, IDR])
    } else {
        annex_b(&[P])
    };
    Packet::new(data)
        .with_pts(index as i64 * FRAME)
        .keyframe(keyframe)
}

/// `len` pictures, with a keyframe every `gop` pictures starting at `first_key`.
fn packets(len: usize, first_key: usize, gop: usize) -> Vec<Packet> {
    (0..len)
        .map(|i| packet(i, i >= first_key && (i - first_key) % gop == 0))
        .collect()
}

fn stream() -> StreamDescriptor {
    let mut stream = StreamDescriptor::new(
        EncodedFormat::H264,
        Resolution::from((16, 16)),
        Rational::new(1, 90_000),
    );
    stream.avg_frame_rate = Some(Rational::new(30, 1));
    stream
}

/// Generous budgets so slow test machines behave like fast ones.
fn config() -> PipelineConfig {
    let mut config = PipelineConfig {
        time_budget: Duration::from_secs(5),
        queue_push_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    config.recovery.watchdog_timeout = Duration::from_secs(60);
    config
}

fn open(packets: Vec<Packet>, factory: DummyFactory, config: PipelineConfig) -> Pipeline {
    init_logging();
    Pipeline::open(
        stream(),
        Box::new(MemorySource::new(packets)),
        Box::new(factory),
        config,
    )
    .unwrap()
}

fn hardware(script: DummyScript) -> DummyFactory {
    DummyFactory::new(Some(script), Some(DummyScript::default()))
}

fn decode_all(pipeline: &mut Pipeline) -> Vec<DecodedPicture> {
    let mut pictures = vec![];
    for _ in 0..1_000_000 {
        if pipeline.is_eos() {
            return pictures;
        }
        match pipeline.get_next_picture().unwrap() {
            Some(picture) => pictures.push(picture),
            None => thread::yield_now(),
        }
    }
    panic!("no end of stream after {} pictures", pictures.len());
}

fn pts(pictures: &[DecodedPicture]) -> Vec<i64> {
    pictures.iter().filter_map(|p| p.pts).collect()
}

fn frames(range: std::ops::Range<i64>) -> Vec<i64> {
    range.map(|i| i * FRAME).collect()
}

#[test]
fn decodes_every_picture_in_order() {
    let mut pipeline = open(packets(30, 0, 10), hardware(Default::default()), config());

    let pictures = decode_all(&mut pipeline);

    assert_eq!(pts(&pictures), frames(0..30));
    assert!(pictures.iter().all(|p| !p.synthetic_pts));
    let stats = pipeline.stats();
    assert_eq!(stats.frames_decoded, 30);
    assert_eq!(stats.frames_dropped, 0);
    assert_eq!(stats.parser_resets, 0);
    assert!(!stats.software_active);
    assert!(stats.avg_decode_time_ms >= 0.0);
}

#[test]
fn nothing_before_the_first_keyframe() {
    let mut pipeline = open(packets(12, 4, 100), hardware(Default::default()), config());

    let pictures = decode_all(&mut pipeline);

    assert_eq!(pts(&pictures), frames(4..12));
    assert_eq!(pipeline.stats().frames_dropped, 0);
}

#[test]
fn missing_timestamps_are_synthesized() {
    let mut pipeline = open(
        packets(5, 0, 5),
        hardware(DummyScript {
            drop_pts: vec![2, 3],
            ..Default::default()
        }),
        config(),
    );

    let pictures = decode_all(&mut pipeline);

    assert_eq!(pts(&pictures), frames(0..5));
    let synthetic: Vec<_> = pictures.iter().map(|p| p.synthetic_pts).collect();
    assert_eq!(synthetic, vec![false, false, true, true, false]);
}

#[test]
fn rejected_unit_is_dropped() {
    let mut pipeline = open(
        packets(10, 0, 10),
        hardware(DummyScript {
            reject: vec![4],
            ..Default::default()
        }),
        config(),
    );

    let pictures = decode_all(&mut pipeline);

    assert_eq!(pictures.len(), 9);
    assert!(!pts(&pictures).contains(&(4 * FRAME)));
    assert_eq!(pipeline.stats().frames_dropped, 1);
}

#[test]
fn busy_decoder_is_retried_within_the_call() {
    let factory = hardware(DummyScript {
        busy: vec![3, 4],
        ..Default::default()
    });
    let log = factory.log();
    let mut pipeline = open(packets(10, 0, 10), factory, config());

    // Every call still returns a picture, the busy unit is submitted again on the spot.
    let pictures: Vec<_> = (0..10)
        .map(|_| pipeline.get_next_picture().unwrap().unwrap())
        .collect();

    assert_eq!(pts(&pictures), frames(0..10));
    assert_eq!(log.lock().unwrap().busy, 2);
    assert!(decode_all(&mut pipeline).is_empty());
}

#[test]
fn corrupt_picture_while_draining_is_dropped() {
    let mut pipeline = open(
        packets(10, 0, 10),
        hardware(DummyScript {
            latency: 2,
            corrupt_on_drain: true,
            ..Default::default()
        }),
        config(),
    );

    let pictures = decode_all(&mut pipeline);

    assert_eq!(pts(&pictures), frames(0..10));
    assert_eq!(pipeline.stats().frames_dropped, 1);
}

#[test]
fn threaded_corrupt_picture_while_draining_is_dropped() {
    let mut pipeline = open(
        packets(10, 0, 10),
        hardware(DummyScript {
            latency: 2,
            corrupt_on_drain: true,
            ..Default::default()
        }),
        PipelineConfig {
            threaded: true,
            ..config()
        },
    );

    let pictures = decode_all(&mut pipeline);

    assert_eq!(pts(&pictures), frames(0..10));
    assert!(pipeline.is_eos());
}

#[test]
fn sixty_empty_receives_reset_the_parser_once() {
    let factory = hardware(DummyScript::stalled());
    let log = factory.log();
    let mut pipeline = open(packets(60, 0, 100), factory, config());

    let pictures = decode_all(&mut pipeline);

    assert!(pictures.is_empty());
    let stats = pipeline.stats();
    assert_eq!(stats.parser_resets, 1);
    assert_eq!(stats.deep_resets, 0);
    assert_eq!(stats.fallbacks, 0);
    assert_eq!(log.lock().unwrap().opened, vec![BackendKind::Hardware]);
    assert!(log.lock().unwrap().flushes >= 1);
}

#[test]
fn watchdog_falls_back_to_software() {
    let factory = hardware(DummyScript::stalled());
    let log = factory.log();
    let mut pipeline = open(packets(300, 0, 300), factory, config());

    let pictures = decode_all(&mut pipeline);

    // The software decoder starts over from the beginning of the stream.
    assert_eq!(pts(&pictures), frames(0..300));
    let stats = pipeline.stats();
    assert_eq!(stats.fallbacks, 1);
    assert_eq!(stats.deep_resets, 0);
    assert!(stats.software_active);
    assert_eq!(stats.frames_decoded, 300);

    let log = log.lock().unwrap();
    assert_eq!(
        log.opened,
        vec![BackendKind::Hardware, BackendKind::Software]
    );
    // The hardware decoder is torn down at the switch.
    assert_eq!(log.closes, 1);
}

#[test]
fn stuck_decoder_climbs_the_recovery_ladder() {
    let mut config = config();
    config.recovery.watchdog_packet_limit = 100_000;
    let factory = hardware(DummyScript::stalled());
    let log = factory.log();
    let mut pipeline = open(packets(600, 0, 10), factory, config);

    let pictures = decode_all(&mut pipeline);

    assert_eq!(pictures.len(), 600);
    let stats = pipeline.stats();
    assert_eq!(stats.parser_resets, 4);
    assert_eq!(stats.deep_resets, 1);
    assert_eq!(stats.fallbacks, 1);

    let log = log.lock().unwrap();
    assert_eq!(log.reopens, 1);
    // The reopened decoder starts over from a keyframe.
    assert_eq!(log.keyframes_after_reopen.first(), Some(&true));
}

#[test]
fn stuck_software_decoder_is_fatal() {
    let mut config = config();
    config.recovery.watchdog_packet_limit = 100_000;
    let factory = DummyFactory::new(None, Some(DummyScript::stalled()));
    let mut pipeline = open(packets(600, 0, 10), factory, config);

    let error = loop {
        match pipeline.get_next_picture() {
            Ok(picture) => assert!(picture.is_none()),
            Err(e) => break e,
        }
        assert!(!pipeline.is_eos());
    };

    assert!(matches!(error, PipelineError::Stalled));
    assert!(error.is_terminal());
    assert!(matches!(
        pipeline.get_next_picture(),
        Err(PipelineError::Failed)
    ));
    assert_eq!(pipeline.stats().deep_resets, 1);
}

#[test]
fn fatal_device_error_stops_submissions() {
    let factory = DummyFactory::new(
        Some(DummyScript {
            fatal_after_frames: Some(3),
            ..Default::default()
        }),
        None,
    );
    let log = factory.log();
    let mut pipeline = open(packets(20, 0, 20), factory, config());

    let mut pictures = vec![];
    let error = loop {
        match pipeline.get_next_picture() {
            Ok(Some(picture)) => pictures.push(picture),
            Ok(None) => (),
            Err(e) => break e,
        }
    };

    assert_eq!(pictures.len(), 3);
    assert!(matches!(
        error,
        PipelineError::Device(BackendError::Other(_))
    ));
    assert!(error.is_terminal());

    let submitted = log.lock().unwrap().submitted;
    for _ in 0..3 {
        assert!(matches!(
            pipeline.get_next_picture(),
            Err(PipelineError::Failed)
        ));
    }
    assert_eq!(log.lock().unwrap().submitted, submitted);
    assert_eq!(log.lock().unwrap().submits_after_fatal, 0);

    // No software decoder to switch to.
    assert!(matches!(
        pipeline.fallback_to_software(),
        Err(PipelineError::Device(BackendError::Unsupported(_)))
    ));
}

#[test]
fn manual_fallback_after_fatal_error() {
    let mut pipeline = open(
        packets(20, 0, 20),
        hardware(DummyScript {
            fatal_after_frames: Some(3),
            ..Default::default()
        }),
        config(),
    );

    while pipeline.get_next_picture().is_ok() {}

    pipeline.fallback_to_software().unwrap();
    let pictures = decode_all(&mut pipeline);

    assert_eq!(pts(&pictures), frames(0..20));
    let stats = pipeline.stats();
    assert!(stats.software_active);
    assert_eq!(stats.frames_decoded, 23);
}

#[test]
fn software_decoder_when_hardware_is_missing() {
    let factory = DummyFactory::new(None, Some(Default::default()));
    let log = factory.log();
    let mut pipeline = open(packets(5, 0, 5), factory, config());

    assert_eq!(decode_all(&mut pipeline).len(), 5);
    assert!(pipeline.stats().software_active);
    assert_eq!(pipeline.stats().fallbacks, 0);
    assert_eq!(log.lock().unwrap().opened, vec![BackendKind::Software]);
}

#[test]
fn forced_software_decoder() {
    let factory = hardware(Default::default());
    let log = factory.log();
    let mut pipeline = open(
        packets(5, 0, 5),
        factory,
        PipelineConfig {
            force_software: true,
            ..config()
        },
    );

    assert_eq!(decode_all(&mut pipeline).len(), 5);
    assert_eq!(log.lock().unwrap().opened, vec![BackendKind::Software]);
}

#[test]
fn no_decoder_at_all() {
    init_logging();
    let result = Pipeline::open(
        stream(),
        Box::new(MemorySource::new(packets(5, 0, 5))),
        Box::new(DummyFactory::new(None, None)),
        config(),
    );

    assert!(matches!(
        result,
        Err(PipelineError::Device(BackendError::Unsupported(_)))
    ));
}

#[test]
fn seek_restarts_from_keyframe() {
    let mut pipeline = open(packets(20, 0, 5), hardware(Default::default()), config());

    let mut first = vec![];
    while first.len() < 3 {
        first.extend(pipeline.get_next_picture().unwrap());
    }

    pipeline.seek(12 * FRAME).unwrap();
    let rest = decode_all(&mut pipeline);

    assert_eq!(pts(&rest), frames(10..20));
}

#[test]
fn loop_reset_replays_the_stream() {
    let mut pipeline = open(packets(15, 3, 6), hardware(Default::default()), config());

    let first = pts(&decode_all(&mut pipeline));
    assert!(pipeline.is_eos());

    pipeline.reset_for_loop().unwrap();
    assert!(!pipeline.is_eos());
    let second = pts(&decode_all(&mut pipeline));

    assert_eq!(first, frames(3..15));
    assert_eq!(first, second);
    assert_eq!(pipeline.stats().frames_decoded, 24);
}

#[test]
fn threaded_decoding() {
    let mut pipeline = open(
        packets(40, 0, 10),
        hardware(DummyScript {
            latency: 1,
            ..Default::default()
        }),
        PipelineConfig {
            threaded: true,
            ..config()
        },
    );

    let first = decode_all(&mut pipeline);
    assert_eq!(pts(&first), frames(0..40));

    pipeline.reset_for_loop().unwrap();
    let second = decode_all(&mut pipeline);
    assert_eq!(pts(&second), frames(0..40));

    assert_eq!(pipeline.stats().frames_dropped, 0);
    pipeline.close();
    assert!(matches!(
        pipeline.get_next_picture(),
        Err(PipelineError::Closed)
    ));
}

#[test]
fn threaded_fatal_error_is_reported() {
    let mut pipeline = open(
        packets(20, 0, 20),
        hardware(DummyScript {
            fatal_after_frames: Some(2),
            ..Default::default()
        }),
        PipelineConfig {
            threaded: true,
            ..config()
        },
    );

    let mut pictures = 0;
    let error = loop {
        match pipeline.get_next_picture() {
            Ok(Some(_)) => pictures += 1,
            Ok(None) => thread::sleep(Duration::from_millis(1)),
            Err(e) => break e,
        }
    };

    assert_eq!(pictures, 2);
    assert!(matches!(error, PipelineError::Device(_)));
    assert!(matches!(
        pipeline.get_next_picture(),
        Err(PipelineError::Failed)
    ));
}

#[test]
fn slow_consumer_loses_oldest_pictures() {
    let mut pipeline = open(
        packets(10, 0, 10),
        hardware(Default::default()),
        PipelineConfig {
            threaded: true,
            queue_push_timeout: Duration::from_millis(1),
            ..config()
        },
    );

    // Let the decode thread run through the stream without consuming anything.
    for _ in 0..5000 {
        if pipeline.stats().frames_dropped == 7 {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    // Queued pictures keep the pipeline from reporting the end of the stream.
    assert!(!pipeline.is_eos());

    let pictures = decode_all(&mut pipeline);

    // Only the last three pictures are left, the others were replaced.
    assert_eq!(pts(&pictures), frames(7..10));
    assert_eq!(pipeline.stats().frames_dropped, 7);
}
