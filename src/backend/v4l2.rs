// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateful V4L2 memory-to-memory decoder.
//!
//! Access units are copied into MMAP buffers of the OUTPUT queue, and decoded NV12 pictures are
//! copied out of the MMAP buffers of the CAPTURE queue so they can outlive the buffer. Every
//! OUTPUT buffer is tagged with a sequence number as timestamp, which the driver copies to the
//! CAPTURE buffer of the picture, and which maps back to the presentation timestamp of the unit.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use log::debug;
use log::info;
use log::warn;
use v4l2r::bindings::v4l2_format;
use v4l2r::device::queue::direction::Capture;
use v4l2r::device::queue::direction::Output;
use v4l2r::device::queue::BuffersAllocated;
use v4l2r::device::queue::GetFreeCaptureBuffer;
use v4l2r::device::queue::GetFreeOutputBuffer;
use v4l2r::device::queue::Queue;
use v4l2r::device::queue::QueueInit;
use v4l2r::device::AllocatedQueue;
use v4l2r::device::Device;
use v4l2r::device::DeviceConfig;
use v4l2r::device::Stream;
use v4l2r::device::TryDequeue;
use v4l2r::ioctl;
use v4l2r::ioctl::DecoderCommand;
use v4l2r::memory::MemoryType;
use v4l2r::memory::MmapHandle;
use v4l2r::nix::sys::time::TimeVal;
use v4l2r::Format;
use v4l2r::PixelFormat;
use v4l2r::PlaneLayout;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::DecodedPicture;
use crate::backend::DecoderBackend;
use crate::backend::OwnedPicture;
use crate::backend::ReceiveStatus;
use crate::backend::SubmitStatus;
use crate::decoded_frame_size;
use crate::nv12_copy;
use crate::stream::AccessUnit;
use crate::stream::StreamDescriptor;
use crate::DecodedFormat;
use crate::EncodedFormat;
use crate::Resolution;

const NUM_OUTPUT_BUFFERS: u32 = 8;
const NUM_CAPTURE_BUFFERS: u32 = 12;
// 1 MB per access unit should be enough for most streams.
const OUTPUT_BUFFER_SIZE: u32 = 1024 * 1024;

type OutputQueue = Queue<Output, BuffersAllocated<Vec<MmapHandle>>>;
type CaptureQueue = Queue<Capture, BuffersAllocated<Vec<MmapHandle>>>;

struct Queues {
    output: OutputQueue,
    capture: CaptureQueue,
    capture_format: Format,
}

fn v4l2_error<E: std::fmt::Debug>(what: &'static str) -> impl FnOnce(E) -> BackendError {
    move |e| BackendError::Other(anyhow!("{}: {:?}", what, e))
}

fn to_timeval(tag: u64) -> TimeVal {
    TimeVal::new((tag / 1_000_000) as i64, (tag % 1_000_000) as i64)
}

fn from_timeval(tv: &TimeVal) -> u64 {
    (tv.tv_sec() as u64) * 1_000_000 + tv.tv_usec() as u64
}

impl Queues {
    fn new(
        output: Queue<Output, QueueInit>,
        capture: Queue<Capture, QueueInit>,
        codec: EncodedFormat,
        resolution: Resolution,
    ) -> BackendResult<Self> {
        let (width, height) = resolution.into();
        let coded: [u8; 4] = codec.fourcc().into();

        output
            .change_format()
            .map_err(v4l2_error("cannot change OUTPUT format"))?
            .set_size(width as usize, height as usize)
            .set_pixelformat(PixelFormat::from_fourcc(&coded))
            .set_planes_layout(vec![PlaneLayout {
                sizeimage: OUTPUT_BUFFER_SIZE,
                ..Default::default()
            }])
            .apply::<v4l2_format>()
            .map_err(v4l2_error("cannot set OUTPUT format"))?;

        capture
            .change_format()
            .map_err(v4l2_error("cannot change CAPTURE format"))?
            .set_size(width as usize, height as usize)
            .set_pixelformat(PixelFormat::from_fourcc(b"NV12"))
            .apply::<v4l2_format>()
            .map_err(v4l2_error("cannot set CAPTURE format"))?;

        let capture_format: Format = capture
            .get_format()
            .map_err(v4l2_error("cannot get CAPTURE format"))?;
        debug!("CAPTURE format: {:?}", capture_format);

        let output = output
            .request_buffers_generic::<Vec<MmapHandle>>(MemoryType::Mmap, NUM_OUTPUT_BUFFERS)
            .map_err(v4l2_error("cannot allocate OUTPUT buffers"))?;
        let capture = capture
            .request_buffers_generic::<Vec<MmapHandle>>(MemoryType::Mmap, NUM_CAPTURE_BUFFERS)
            .map_err(v4l2_error("cannot allocate CAPTURE buffers"))?;

        output
            .stream_on()
            .map_err(v4l2_error("cannot stream on OUTPUT"))?;
        capture
            .stream_on()
            .map_err(v4l2_error("cannot stream on CAPTURE"))?;

        let queues = Self {
            output,
            capture,
            capture_format,
        };
        queues.refill_capture()?;
        Ok(queues)
    }

    fn refill_capture(&self) -> BackendResult<()> {
        while self.capture.num_free_buffers() != 0 {
            let buffer = self
                .capture
                .try_get_free_buffer()
                .map_err(v4l2_error("cannot get CAPTURE buffer"))?;
            buffer
                .queue()
                .map_err(v4l2_error("cannot queue CAPTURE buffer"))?;
        }
        Ok(())
    }

    /// Releases the OUTPUT buffers the decoder is done with.
    fn reclaim_output(&self) {
        while self.output.num_queued_buffers() != 0 {
            match self.output.try_dequeue() {
                Ok(buffer) => drop(buffer),
                Err(_) => break,
            }
        }
    }

    /// Frees the buffers and gives the queues back in their initial state.
    fn release(self) -> BackendResult<(Queue<Output, QueueInit>, Queue<Capture, QueueInit>)> {
        if let Err(e) = self.output.stream_off() {
            warn!("v4l2: cannot stream off OUTPUT: {:?}", e);
        }
        if let Err(e) = self.capture.stream_off() {
            warn!("v4l2: cannot stream off CAPTURE: {:?}", e);
        }
        let output = self
            .output
            .free_buffers()
            .map_err(v4l2_error("cannot free OUTPUT buffers"))?
            .queue;
        let capture = self
            .capture
            .free_buffers()
            .map_err(v4l2_error("cannot free CAPTURE buffers"))?
            .queue;
        Ok((output, capture))
    }
}

pub struct V4l2Backend {
    device: Arc<Device>,
    codec: EncodedFormat,
    resolution: Resolution,
    queues: Option<Queues>,

    /// Presentation timestamps of the units in flight, by OUTPUT buffer tag.
    in_flight: BTreeMap<u64, Option<i64>>,
    next_tag: u64,
    draining: bool,
    /// The last buffer of a drain has been dequeued.
    drained: bool,
}

impl V4l2Backend {
    pub fn open(path: &Path, stream: &StreamDescriptor) -> BackendResult<Self> {
        let device = Arc::new(
            Device::open(path, DeviceConfig::new().non_blocking_dqbuf()).map_err(|e| {
                BackendError::Unsupported(format!("cannot open {}: {:?}", path.display(), e))
            })?,
        );

        let output = Queue::get_output_mplane_queue(Arc::clone(&device))
            .map_err(v4l2_error("cannot get OUTPUT queue"))?;
        let capture = Queue::get_capture_mplane_queue(Arc::clone(&device))
            .map_err(v4l2_error("cannot get CAPTURE queue"))?;
        let queues = Queues::new(output, capture, stream.codec, stream.resolution)?;

        info!(
            "{}: decoding {:?} {}x{}",
            path.display(),
            stream.codec,
            stream.resolution.width,
            stream.resolution.height
        );

        Ok(Self {
            device,
            codec: stream.codec,
            resolution: stream.resolution,
            queues: Some(queues),
            in_flight: BTreeMap::new(),
            next_tag: 0,
            draining: false,
            drained: false,
        })
    }

    fn queues(&self) -> BackendResult<&Queues> {
        self.queues.as_ref().ok_or(BackendError::Closed)
    }

    fn picture(&mut self, data: &[u8], tag: u64, queues: &Queues) -> DecodedPicture {
        let format = &queues.capture_format;
        let width = self.resolution.width as usize;
        let height = self.resolution.height as usize;
        let stride = format.plane_fmt[0].bytesperline as usize;

        let mut picture = vec![0u8; decoded_frame_size(DecodedFormat::NV12, width, height)];
        nv12_copy(
            data,
            &mut picture,
            width,
            height,
            [stride, stride],
            [0, stride * format.height as usize],
        );

        let pts = self.in_flight.remove(&tag).flatten();
        DecodedPicture::new(
            Box::new(OwnedPicture(picture)),
            self.resolution,
            DecodedFormat::NV12,
            pts,
        )
    }
}

impl DecoderBackend for V4l2Backend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn is_software(&self) -> bool {
        false
    }

    fn output_format(&self) -> DecodedFormat {
        DecodedFormat::NV12
    }

    fn submit(&mut self, unit: AccessUnit) -> BackendResult<SubmitStatus> {
        let queues = self.queues()?;
        queues.reclaim_output();

        let buffer = match queues.output.try_get_free_buffer() {
            Ok(buffer) => buffer,
            Err(_) => return Ok(SubmitStatus::Busy(unit)),
        };

        let len = unit.data.len();
        {
            let mut mapping = buffer
                .get_plane_mapping(0)
                .ok_or_else(|| anyhow!("cannot map OUTPUT buffer"))?;
            let dst = mapping.as_mut().get_mut(..len).ok_or_else(|| {
                BackendError::InvalidData(format!("{} bytes do not fit in an OUTPUT buffer", len))
            })?;
            dst.copy_from_slice(&unit.data);
        }

        let tag = self.next_tag;
        buffer
            .set_timestamp(to_timeval(tag))
            .queue(&[len])
            .map_err(v4l2_error("cannot queue OUTPUT buffer"))?;

        self.next_tag += 1;
        self.in_flight.insert(tag, unit.pts);
        debug!("OUTPUT: queued {} bytes, tag {}", len, tag);

        Ok(SubmitStatus::Accepted)
    }

    fn drain(&mut self) -> BackendResult<()> {
        self.queues()?;
        ioctl::decoder_cmd::<_, ()>(&*self.device, &DecoderCommand::stop())
            .map_err(v4l2_error("cannot stop decoder"))?;
        self.draining = true;
        Ok(())
    }

    fn receive(&mut self) -> BackendResult<ReceiveStatus> {
        if self.drained {
            return Ok(ReceiveStatus::EndOfStream);
        }

        let queues = self.queues.take().ok_or(BackendError::Closed)?;
        let result = self.dequeue(&queues);
        self.queues = Some(queues);
        result
    }

    fn flush(&mut self) -> BackendResult<()> {
        let queues = self.queues()?;
        for result in [queues.output.stream_off(), queues.output.stream_on()] {
            result.map_err(v4l2_error("cannot restart OUTPUT"))?;
        }
        for result in [queues.capture.stream_off(), queues.capture.stream_on()] {
            result.map_err(v4l2_error("cannot restart CAPTURE"))?;
        }
        queues.refill_capture()?;

        if self.draining {
            ioctl::decoder_cmd::<_, ()>(&*self.device, &DecoderCommand::start())
                .map_err(v4l2_error("cannot restart decoder"))?;
        }

        self.in_flight.clear();
        self.draining = false;
        self.drained = false;
        Ok(())
    }

    fn reopen(&mut self) -> BackendResult<()> {
        let queues = self.queues.take().ok_or(BackendError::Closed)?;
        let (output, capture) = queues.release()?;
        self.queues = Some(Queues::new(output, capture, self.codec, self.resolution)?);

        self.in_flight.clear();
        self.draining = false;
        self.drained = false;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(queues) = self.queues.take() {
            if let Err(e) = queues.release() {
                warn!("v4l2: cannot release queues: {}", e);
            }
        }
        self.in_flight.clear();
    }
}

impl V4l2Backend {
    fn dequeue(&mut self, queues: &Queues) -> BackendResult<ReceiveStatus> {
        queues.reclaim_output();

        let buffer = match queues.capture.try_dequeue() {
            Ok(buffer) => buffer,
            Err(ioctl::DqBufError::IoctlError(ioctl::DqBufIoctlError::NotReady)) => {
                return Ok(ReceiveStatus::NeedMoreInput)
            }
            Err(ioctl::DqBufError::IoctlError(ioctl::DqBufIoctlError::Eos)) => {
                self.drained = true;
                return Ok(ReceiveStatus::EndOfStream);
            }
            Err(e) => return Err(anyhow!("cannot dequeue CAPTURE buffer: {:?}", e).into()),
        };

        let is_last = buffer.data.is_last();
        let bytes_used = *buffer.data.get_first_plane().bytesused;
        let tag = from_timeval(&buffer.data.timestamp());

        let picture = if bytes_used == 0 {
            None
        } else {
            let mapping = buffer
                .get_plane_mapping(0)
                .ok_or_else(|| anyhow!("cannot map CAPTURE buffer"))?;
            Some(self.picture(mapping.as_ref(), tag, queues))
        };
        drop(buffer);
        queues.refill_capture()?;

        if is_last {
            debug!("CAPTURE: last buffer");
            self.drained = true;
        }

        Ok(match picture {
            Some(picture) => ReceiveStatus::Frame(picture),
            None if self.drained => ReceiveStatus::EndOfStream,
            None => ReceiveStatus::NeedMoreInput,
        })
    }
}
