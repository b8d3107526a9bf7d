// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Frame reassembly. See [`FrameStreamProcessor`]
//!
//! A frame arrives as a start-of-frame packet, any number of middle packets, and an
//! end-of-frame packet, each possibly split into several chunks. The format specific part
//! (unpacking, decompression, color conversion) is a [`FrameCodec`], the bookkeeping around
//! it is shared.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::{
    buffer::Buffer,
    format::StreamGeometry,
    mirror,
    protocol::{packet_type, PacketHeader},
    PixelFormat,
};

/// A decoded frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Running frame counter of the stream, starting at 1
    pub frame_id: u32,
    /// Device timestamp of the last packet of the frame
    pub timestamp: u32,
    /// Pixels per line
    pub width: usize,
    /// Lines
    pub height: usize,
    /// Layout of `data`
    pub format: PixelFormat,
    /// Pixel data
    pub data: Vec<u8>,
    /// Something went wrong while decoding this frame (lost packets, overflow, bad
    /// compressed data). The data is delivered anyway, but should not be trusted.
    pub corrupted: bool,
}

/// Something that consumes the chunks of one packet family
pub trait DataProcessor {
    /// Handle a chunk of a packet. `offset` is the position of `data` inside the packet's
    /// payload. Returns a frame when the chunk completed one.
    fn process_data(&mut self, header: &PacketHeader, data: &[u8], offset: usize)
        -> Option<Frame>;
}

/// Detects lost packets and counts received bytes
#[derive(Debug, Default)]
pub struct PacketTracker {
    last_packet_id: u16,
    bytes_received: usize,
}

impl PacketTracker {
    /// Account a chunk. Returns `false` if packets were lost before it.
    pub fn track(&mut self, name: &str, header: &PacketHeader, data_len: usize, offset: usize) -> bool {
        self.bytes_received += data_len;
        if offset != 0 {
            return true;
        }
        let expected = self.last_packet_id.wrapping_add(1);
        self.last_packet_id = header.packet_id;
        if header.packet_id != expected && header.packet_id != 0 {
            warn!(
                stream = name,
                expected,
                got = header.packet_id,
                "packet lost"
            );
            return false;
        }
        true
    }

    /// Bytes received since the last [`PacketTracker::take_bytes_received`]
    pub fn take_bytes_received(&mut self) -> usize {
        std::mem::take(&mut self.bytes_received)
    }
}

/// Per-frame state the codecs work on
pub struct FrameContext {
    name: String,
    write_buffer: Buffer<'static>,
    corrupted: bool,
    frame_id: u32,
    dump_dir: Option<PathBuf>,
}

impl FrameContext {
    fn new(name: String, max_frame_size: usize) -> Self {
        Self {
            name,
            write_buffer: Buffer::with_capacity(max_frame_size),
            corrupted: false,
            frame_id: 1,
            dump_dir: None,
        }
    }

    /// Name of the stream, for logging
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The frame being assembled
    pub fn write_buffer(&mut self) -> &mut Buffer<'static> {
        &mut self.write_buffer
    }

    /// ID the current frame will get
    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    /// `true` once anything went wrong in this frame
    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    /// Mark the current frame as corrupted. Logged once per frame.
    pub fn frame_is_corrupted(&mut self) {
        if !self.corrupted {
            warn!(stream = %self.name, frame_id = self.frame_id, "frame is corrupt");
            self.corrupted = true;
        }
    }

    /// The frame does not fit the write buffer
    pub fn write_buffer_overflowed(&mut self) {
        warn!(
            stream = %self.name,
            size = self.write_buffer.size(),
            "frame buffer overflow"
        );
        self.frame_is_corrupted();
    }

    /// Check that `size` more bytes fit the write buffer. Marks the frame corrupted if not.
    pub fn check_write_buffer_for_overflow(&mut self, size: usize) -> bool {
        if size > self.write_buffer.free_space() {
            self.write_buffer_overflowed();
            return false;
        }
        true
    }

    /// Directory for diagnostic dumps, if enabled
    pub fn dump_dir(&self) -> Option<&PathBuf> {
        self.dump_dir.as_ref()
    }

    /// Write `data` to `file_name` in the dump directory, if dumping is enabled.
    /// Failures are logged, never returned.
    pub fn dump(&self, file_name: &str, data: &[u8]) {
        let Some(dir) = &self.dump_dir else {
            return;
        };
        let path = dir.join(file_name);
        if let Err(e) = std::fs::write(&path, data) {
            warn!(path = %path.display(), error = %e, "failed writing dump");
        }
    }
}

/// The format specific part of a frame stream
pub trait FrameCodec {
    /// Format of the produced frames
    fn output_format(&self) -> PixelFormat;

    /// Resolution of the produced frames
    fn geometry(&self) -> StreamGeometry;

    /// Capacity of the write buffer
    fn max_frame_size(&self) -> usize {
        self.geometry().frame_size(self.output_format())
    }

    /// Whether a start-of-frame packet directly following another one continues the frame
    fn allow_double_sof(&self) -> bool {
        false
    }

    /// A new frame starts. The write buffer is already reset.
    fn start_of_frame(&mut self, _ctx: &mut FrameContext, _header: &PacketHeader) {}

    /// A piece of frame data. Called in offset order, and not at all once the frame is
    /// corrupted.
    fn process_chunk(
        &mut self,
        ctx: &mut FrameContext,
        header: &PacketHeader,
        data: &[u8],
        offset: usize,
    );

    /// The whole frame arrived. Flush whatever is pending into the write buffer.
    fn end_of_frame(&mut self, _ctx: &mut FrameContext, _header: &PacketHeader) {}
}

/// Which packet types delimit the frames of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Depth packets
    Depth,
    /// Image packets (color and IR)
    Image,
}

impl StreamKind {
    fn start_of_frame(self) -> u16 {
        match self {
            StreamKind::Depth => packet_type::DEPTH_START,
            StreamKind::Image => packet_type::IMAGE_START,
        }
    }

    fn end_of_frame(self) -> u16 {
        match self {
            StreamKind::Depth => packet_type::DEPTH_END,
            StreamKind::Image => packet_type::IMAGE_END,
        }
    }
}

/// Collects chunks into frames, driving a [`FrameCodec`]
pub struct FrameStreamProcessor<C> {
    codec: C,
    ctx: FrameContext,
    kind: StreamKind,
    tracker: PacketTracker,
    last_sof_packet_id: u16,
    mirror: bool,
    raw_input: Option<Vec<u8>>,
}

impl<C: FrameCodec> FrameStreamProcessor<C> {
    /// Processor named `name` (used in logs and dump file names)
    pub fn new(name: impl Into<String>, kind: StreamKind, codec: C) -> Self {
        let ctx = FrameContext::new(name.into(), codec.max_frame_size());
        Self {
            codec,
            ctx,
            kind,
            tracker: PacketTracker::default(),
            last_sof_packet_id: 0,
            mirror: false,
            raw_input: None,
        }
    }

    /// Flip delivered frames horizontally
    pub fn with_mirror(mut self, mirror: bool) -> Self {
        self.mirror = mirror;
        self
    }

    /// Write diagnostic dumps (raw input of every frame, undecodable images) to `dir`
    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ctx.dump_dir = Some(dir.into());
        self.raw_input = Some(Vec::new());
        self
    }

    /// The codec
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// The codec, mutably
    pub fn codec_mut(&mut self) -> &mut C {
        &mut self.codec
    }

    /// The stream lost packets. The current frame is unusable.
    pub fn packet_lost(&mut self) {
        self.ctx.frame_is_corrupted();
    }

    fn start_of_frame(&mut self, header: &PacketHeader) {
        self.ctx.corrupted = false;
        self.ctx.write_buffer.reset();
        if let Some(raw) = &mut self.raw_input {
            raw.clear();
        }
        self.codec.start_of_frame(&mut self.ctx, header);
    }

    fn end_of_frame(&mut self, header: &PacketHeader) -> Frame {
        self.codec.end_of_frame(&mut self.ctx, header);

        let geometry = self.codec.geometry();
        let format = self.codec.output_format();
        let mut data = self.ctx.write_buffer.data().to_vec();
        if self.mirror && format != PixelFormat::Jpeg {
            if let Err(e) = mirror::mirror(format, &mut data, geometry.x_res) {
                warn!(stream = %self.ctx.name, error = %e, "could not mirror frame");
            }
        }
        if let Some(raw) = &self.raw_input {
            self.ctx
                .dump(&format!("{}In_{}.raw", self.ctx.name, self.ctx.frame_id), raw);
        }

        let frame = Frame {
            frame_id: self.ctx.frame_id,
            timestamp: header.timestamp,
            width: geometry.x_res,
            height: geometry.y_res,
            format,
            data,
            corrupted: self.ctx.corrupted,
        };
        debug!(
            stream = %self.ctx.name,
            frame_id = frame.frame_id,
            bytes_received = self.tracker.take_bytes_received(),
            corrupted = frame.corrupted,
            "frame ready"
        );
        self.ctx.frame_id += 1;
        self.ctx.write_buffer.reset();
        frame
    }
}

impl<C: FrameCodec> DataProcessor for FrameStreamProcessor<C> {
    fn process_data(
        &mut self,
        header: &PacketHeader,
        data: &[u8],
        offset: usize,
    ) -> Option<Frame> {
        let no_loss = self.tracker.track(&self.ctx.name, header, data.len(), offset);

        if header.packet_type == self.kind.start_of_frame() && offset == 0 {
            let continues = self.codec.allow_double_sof()
                && header.packet_id == self.last_sof_packet_id.wrapping_add(1);
            if !continues {
                self.last_sof_packet_id = header.packet_id;
                self.start_of_frame(header);
            }
        }
        if !no_loss {
            self.packet_lost();
        }

        if !self.ctx.corrupted {
            if let Some(raw) = &mut self.raw_input {
                raw.extend_from_slice(data);
            }
            self.codec.process_chunk(&mut self.ctx, header, data, offset);
        }

        if header.packet_type == self.kind.end_of_frame()
            && offset + data.len() == header.buf_size as usize
        {
            return Some(self.end_of_frame(header));
        }
        None
    }
}

/// Carries the bytes of an incomplete fixed-size element over to the next chunk
pub struct Continuation {
    buffer: Buffer<'static>,
    element_size: usize,
}

impl Continuation {
    /// For elements of `element_size` bytes
    pub fn new(element_size: usize) -> Self {
        Self {
            buffer: Buffer::with_capacity(element_size),
            element_size,
        }
    }

    /// Number of bytes waiting for the rest of their element
    pub fn pending(&self) -> usize {
        self.buffer.size()
    }

    /// Drop the pending bytes
    pub fn reset(&mut self) {
        self.buffer.reset();
    }

    /// Call `process` with runs of whole elements: first the completed pending element, then
    /// the whole elements of `data`. The tail is kept for the next call, unless `process`
    /// reports failure on the bulk run.
    pub fn feed(&mut self, mut data: &[u8], mut process: impl FnMut(&[u8]) -> bool) {
        if self.buffer.size() != 0 {
            let take = data.len().min(self.element_size - self.buffer.size());
            self.buffer.write_unchecked(&data[..take]);
            data = &data[take..];
            if self.buffer.size() == self.element_size {
                process(self.buffer.data());
                self.buffer.reset();
            }
        }

        let whole = data.len() / self.element_size * self.element_size;
        if whole > 0 && !process(&data[..whole]) {
            return;
        }
        self.buffer.write_unchecked(&data[whole..]);
    }
}
