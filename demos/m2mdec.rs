// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! m2mdec, a simple decoder program using m2m-decode. Decodes a raw H.264 or H.265 elementary
//! stream with the V4L2 decoder (or the software one if unavailable), and can compute MD5
//! checksums or write the raw decoded frames to a file.

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use argh::FromArgs;
use m2m_decode::backend::SystemBackendFactory;
use m2m_decode::config::PipelineConfig;
use m2m_decode::pipeline::Pipeline;
use m2m_decode::stream::MemorySource;
use m2m_decode::stream::StreamDescriptor;
use m2m_decode::EncodedFormat;
use m2m_decode::Rational;
use m2m_decode::Resolution;

#[derive(Debug)]
enum Md5Computation {
    Stream,
    Frame,
}

impl FromStr for Md5Computation {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Md5Computation::Stream),
            "frame" => Ok(Md5Computation::Frame),
            _ => Err("unrecognized MD5 computation option. Valid values: stream, frame"),
        }
    }
}

/// Simple M2M decoder using m2m-decode
#[derive(Debug, FromArgs)]
struct Args {
    /// input file
    #[argh(positional)]
    input: PathBuf,

    /// output file to write the decoded frames to
    #[argh(option)]
    output: Option<PathBuf>,

    /// input format to decode from. Default: h264
    #[argh(option, default = "EncodedFormat::H264")]
    input_format: EncodedFormat,

    /// V4L2 decoder device. Default: /dev/video-dec0
    #[argh(option, default = "PathBuf::from(\"/dev/video-dec0\")")]
    device: PathBuf,

    /// coded width of the stream
    #[argh(option)]
    width: u32,

    /// coded height of the stream
    #[argh(option)]
    height: u32,

    /// frame rate to assume for the timestamps. Default: 30
    #[argh(option, default = "30")]
    fps: i32,

    /// size of the chunks the input is split into. Default: 4096
    #[argh(option, default = "4096")]
    chunk_size: usize,

    /// decode on a dedicated thread
    #[argh(switch)]
    threaded: bool,

    /// skip the hardware decoder
    #[argh(switch)]
    software: bool,

    /// whether to display the MD5 of the decoded stream, and at which granularity (stream or
    /// frame)
    #[argh(option)]
    compute_md5: Option<Md5Computation>,
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let input = {
        let mut buf = Vec::new();
        File::open(&args.input)
            .expect("error opening input file")
            .read_to_end(&mut buf)
            .expect("error reading input file");
        buf
    };

    let mut output = args
        .output
        .as_ref()
        .map(|p| File::create(p).expect("error creating output file"));

    let mut stream = StreamDescriptor::new(
        args.input_format,
        Resolution::from((args.width, args.height)),
        Rational::new(1, 90_000),
    );
    stream.avg_frame_rate = Some(Rational::new(args.fps, 1));

    let mut config = PipelineConfig::from_env();
    config.threaded = args.threaded;
    config.force_software |= args.software;

    let mut pipeline = Pipeline::open(
        stream,
        Box::new(MemorySource::from_elementary_stream(&input, args.chunk_size)),
        Box::new(SystemBackendFactory::new(&args.device)),
        config,
    )
    .expect("failed to open decoding pipeline");

    let mut md5_context = md5::Context::new();
    let mut frame_data = Vec::new();

    while !pipeline.is_eos() {
        let mut picture = match pipeline.get_next_picture() {
            Ok(Some(picture)) => picture,
            Ok(None) => {
                if args.threaded {
                    thread::sleep(Duration::from_millis(1));
                }
                continue;
            }
            Err(e) => {
                eprintln!("decoding failed: {}", e);
                break;
            }
        };

        if output.is_none() && args.compute_md5.is_none() {
            continue;
        }

        frame_data.resize(picture.image_size(), 0);
        picture
            .read(&mut frame_data)
            .expect("failed to read decoded picture");

        if let Some(output) = &mut output {
            output
                .write_all(&frame_data)
                .expect("failed to write to output file");
        }

        match args.compute_md5 {
            None => (),
            Some(Md5Computation::Frame) => println!("{:x}", md5::compute(&frame_data)),
            Some(Md5Computation::Stream) => md5_context.consume(&frame_data),
        }
    }

    if let Some(Md5Computation::Stream) = args.compute_md5 {
        println!("{:x}", md5_context.compute());
    }

    let stats = pipeline.stats();
    eprintln!(
        "{} frames decoded, {} dropped, {:.2} ms average, {} parser resets, {} deep resets, {} fallbacks{}",
        stats.frames_decoded,
        stats.frames_dropped,
        stats.avg_decode_time_ms,
        stats.parser_resets,
        stats.deep_resets,
        stats.fallbacks,
        if stats.software_active { " (software)" } else { "" }
    );

    pipeline.close();
}
