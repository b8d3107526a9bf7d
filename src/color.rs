// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Image and IR stream decoding. See [`ImageCodec`] and [`image_processor`]
//!
//! Both streams arrive in the image packets. The encoding and output format decide what
//! happens to the chunks; the combinations the device can produce are:
//!
//! | encoding        | output formats                |
//! |-----------------|-------------------------------|
//! | `Raw`           | anything, copied as is        |
//! | `Yuv422`/`Yuyv` | `Rgb888`                      |
//! | `PsCompressed`  | `Yuv422`, `Rgb888`            |
//! | `Jpeg`          | `Rgb888` (needs `jpeg`)       |
//! | `Ir10`          | `Gray16`, `Rgb888`            |

use byteorder::{ByteOrder, LittleEndian};
use tracing::{trace, warn};

use crate::{
    buffer::Buffer,
    format::StreamGeometry,
    processor::{Continuation, FrameCodec, FrameContext, FrameStreamProcessor, StreamKind},
    protocol::{packet_type, PacketHeader},
    uncomp::{uncompress, ChannelLayout},
    unpack::{unpack_packed10, PACKED10_ELEMENT_BYTES, PACKED10_ELEMENT_VALUES},
    yuv::{yuv422_to_rgb888, yuyv_to_rgb888, RGB_GROUP_BYTES, YUV_GROUP_BYTES},
    Error, PixelFormat, Result,
};

/// How the device encodes the image stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEncoding {
    /// Already in the output format
    Raw,
    /// Uncompressed U Y1 V Y2
    Yuv422,
    /// Uncompressed Y1 U Y2 V
    Yuyv,
    /// YUV422 in the PS nibble compression
    PsCompressed,
    /// JPEG
    Jpeg,
    /// 10 bit packed IR
    Ir10,
}

/// Settings of an image or IR processor
#[derive(Debug, Clone)]
pub struct ImageProcessorConfig {
    /// Resolution of the stream
    pub geometry: StreamGeometry,
    /// Format of the produced frames
    pub output_format: PixelFormat,
    /// Input encoding
    pub encoding: ImageEncoding,
}

impl Default for ImageProcessorConfig {
    fn default() -> Self {
        Self {
            geometry: StreamGeometry::VGA,
            output_format: PixelFormat::Rgb888,
            encoding: ImageEncoding::Yuv422,
        }
    }
}

enum ImageInput {
    Raw,
    Yuv(Continuation),
    Compressed(Vec<u8>),
    #[cfg_attr(not(feature = "jpeg"), allow(dead_code))]
    Jpeg(Buffer<'static>),
    Ir(Continuation),
}

/// Image decoding on top of [`FrameStreamProcessor`]
pub struct ImageCodec {
    config: ImageProcessorConfig,
    input: ImageInput,
    /// Intermediate frame for conversions done at the end of the frame
    temp: Buffer<'static>,
    values: Vec<u16>,
}

fn unsupported(config: &ImageProcessorConfig) -> Error {
    warn!(
        encoding = ?config.encoding,
        format = ?config.output_format,
        "unsupported image output format"
    );
    Error::UnsupportedFormat(config.output_format)
}

impl ImageCodec {
    /// Codec for `config`. Fails if the output format can't be made from the encoding.
    pub fn new(config: ImageProcessorConfig) -> Result<Self> {
        let pixels = config.geometry.pixels();
        let output_size = config.geometry.frame_size(config.output_format);
        let mut temp = Buffer::new();
        let input = match (config.encoding, config.output_format) {
            (ImageEncoding::Raw, _) => ImageInput::Raw,
            (ImageEncoding::Yuv422 | ImageEncoding::Yuyv, PixelFormat::Rgb888) => {
                ImageInput::Yuv(Continuation::new(YUV_GROUP_BYTES))
            }
            (ImageEncoding::PsCompressed, PixelFormat::Yuv422) => {
                ImageInput::Compressed(Vec::with_capacity(output_size))
            }
            (ImageEncoding::PsCompressed, PixelFormat::Rgb888) => {
                temp.allocate(pixels * PixelFormat::Yuv422.bytes_per_pixel());
                ImageInput::Compressed(Vec::with_capacity(output_size))
            }
            #[cfg(feature = "jpeg")]
            (ImageEncoding::Jpeg, PixelFormat::Rgb888) => {
                ImageInput::Jpeg(Buffer::with_capacity(output_size))
            }
            (ImageEncoding::Ir10, PixelFormat::Gray16) => {
                ImageInput::Ir(Continuation::new(PACKED10_ELEMENT_BYTES))
            }
            (ImageEncoding::Ir10, PixelFormat::Rgb888) => {
                temp.allocate(pixels * 2);
                ImageInput::Ir(Continuation::new(PACKED10_ELEMENT_BYTES))
            }
            _ => return Err(unsupported(&config)),
        };
        Ok(Self {
            config,
            input,
            temp,
            values: Vec::new(),
        })
    }

    /// Whether frames are delivered compressed, so their size is not known in advance
    fn compressed_output(&self) -> bool {
        self.config.output_format == PixelFormat::Jpeg
    }

    fn reset_input(&mut self) {
        match &mut self.input {
            ImageInput::Raw => (),
            ImageInput::Yuv(continuation) | ImageInput::Ir(continuation) => continuation.reset(),
            ImageInput::Compressed(raw) => raw.clear(),
            ImageInput::Jpeg(raw) => raw.reset(),
        }
        self.temp.reset();
    }

    fn process_yuv(&mut self, ctx: &mut FrameContext, data: &[u8]) {
        let ImageInput::Yuv(continuation) = &mut self.input else {
            return;
        };
        let convert = match self.config.encoding {
            ImageEncoding::Yuyv => yuyv_to_rgb888,
            _ => yuv422_to_rgb888,
        };
        continuation.feed(data, |groups| {
            let needed = groups.len() / YUV_GROUP_BYTES * RGB_GROUP_BYTES;
            if !ctx.check_write_buffer_for_overflow(needed) {
                return false;
            }
            let buffer = ctx.write_buffer();
            let (_, written) = convert(groups, buffer.spare_mut());
            buffer.advance(written);
            true
        });
    }

    fn process_compressed(&mut self, ctx: &mut FrameContext, header: &PacketHeader, data: &[u8], offset: usize) {
        let Self {
            input: ImageInput::Compressed(raw),
            temp,
            config,
            ..
        } = self
        else {
            return;
        };

        let from_raw = !raw.is_empty();
        if from_raw {
            let capacity = config.geometry.frame_size(config.output_format);
            if capacity.saturating_sub(raw.len()) < data.len() {
                warn!(stream = ctx.name(), pending = raw.len(), "compressed image overflow");
                ctx.frame_is_corrupted();
                raw.clear();
                return;
            }
            raw.extend_from_slice(data);
        }
        let input: &[u8] = if from_raw { raw.as_slice() } else { data };
        if input.is_empty() {
            return;
        }

        let last_part = header.packet_type == packet_type::IMAGE_END
            && offset + data.len() == header.buf_size as usize;
        let line_size = config.geometry.x_res * 2;
        let to_temp = config.output_format == PixelFormat::Rgb888;

        let result = {
            let target = if to_temp { &mut *temp } else { ctx.write_buffer() };
            let result = uncompress(ChannelLayout::Ps, input, target.spare_mut(), line_size, last_part);
            match &result {
                Ok(decoded) => target.advance(decoded.written),
                // The output is full of decoded bytes, keep them
                Err(Error::OutputBufferOverflow { available, .. }) => target.advance(*available),
                Err(_) => (),
            }
            result
        };
        let read = match result {
            Ok(decoded) => decoded.read,
            Err(e) => {
                warn!(
                    stream = ctx.name(),
                    error = %e,
                    input_size = input.len(),
                    last_part,
                    "image decompression failed"
                );
                ctx.frame_is_corrupted();
                input.len()
            }
        };

        if from_raw {
            raw.drain(..read);
        } else {
            raw.extend_from_slice(&data[read..]);
        }
    }

    fn process_jpeg(&mut self, ctx: &mut FrameContext, data: &[u8]) {
        let ImageInput::Jpeg(raw) = &mut self.input else {
            return;
        };
        if raw.free_space() < data.len() {
            warn!(stream = ctx.name(), size = raw.size(), "jpeg data overflow");
            ctx.frame_is_corrupted();
            raw.reset();
        } else {
            raw.write_unchecked(data);
        }
    }

    fn process_ir(&mut self, ctx: &mut FrameContext, data: &[u8]) {
        let Self {
            input: ImageInput::Ir(continuation),
            temp,
            config,
            values,
        } = self
        else {
            return;
        };
        let to_temp = config.output_format == PixelFormat::Rgb888;
        continuation.feed(data, |elements| {
            let count = elements.len() / PACKED10_ELEMENT_BYTES * PACKED10_ELEMENT_VALUES;
            let target = if to_temp { &mut *temp } else { ctx.write_buffer() };
            if count * 2 > target.free_space() {
                ctx.write_buffer_overflowed();
                return false;
            }
            values.resize(count, 0);
            unpack_packed10(elements, values.as_mut_slice());
            let target = if to_temp { &mut *temp } else { ctx.write_buffer() };
            LittleEndian::write_u16_into(values.as_slice(), &mut target.spare_mut()[..count * 2]);
            target.advance(count * 2);
            true
        });
    }

    fn finish_compressed(&mut self, ctx: &mut FrameContext) {
        if self.config.output_format != PixelFormat::Rgb888 {
            return;
        }
        let buffer = ctx.write_buffer();
        let (_, written) = yuv422_to_rgb888(self.temp.data(), buffer.spare_mut());
        buffer.advance(written);
    }

    #[cfg(feature = "jpeg")]
    fn finish_jpeg(&mut self, ctx: &mut FrameContext) {
        let ImageInput::Jpeg(raw) = &self.input else {
            return;
        };
        match image::load_from_memory_with_format(raw.data(), image::ImageFormat::Jpeg) {
            Ok(decoded) => {
                let rgb = decoded.into_rgb8();
                let rgb = rgb.as_raw();
                if ctx.check_write_buffer_for_overflow(rgb.len()) {
                    ctx.write_buffer().write_unchecked(rgb);
                }
            }
            Err(e) => {
                warn!(
                    stream = ctx.name(),
                    frame_id = ctx.frame_id(),
                    error = %e,
                    "failed to uncompress jpeg"
                );
                ctx.frame_is_corrupted();
                ctx.dump(&format!("BadImage_{}.jpeg", ctx.frame_id()), raw.data());
            }
        }
    }

    #[cfg(not(feature = "jpeg"))]
    fn finish_jpeg(&mut self, _ctx: &mut FrameContext) {}

    fn finish_ir(&mut self, ctx: &mut FrameContext) {
        if let ImageInput::Ir(continuation) = &self.input {
            if continuation.pending() != 0 {
                warn!(
                    stream = ctx.name(),
                    left_over = continuation.pending(),
                    "IR buffer is corrupt, there are left over bytes"
                );
                ctx.frame_is_corrupted();
            }
        }
        if self.config.output_format != PixelFormat::Rgb888 {
            return;
        }
        let buffer = ctx.write_buffer();
        let mut written = 0;
        for (value, out) in self
            .temp
            .data()
            .chunks_exact(2)
            .zip(buffer.spare_mut().chunks_exact_mut(3))
        {
            out.fill((LittleEndian::read_u16(value) >> 2) as u8);
            written += 3;
        }
        buffer.advance(written);
    }
}

impl FrameCodec for ImageCodec {
    fn output_format(&self) -> PixelFormat {
        self.config.output_format
    }

    fn geometry(&self) -> StreamGeometry {
        self.config.geometry
    }

    fn allow_double_sof(&self) -> bool {
        self.config.encoding == ImageEncoding::Jpeg
    }

    fn start_of_frame(&mut self, _ctx: &mut FrameContext, _header: &PacketHeader) {
        self.reset_input();
    }

    fn process_chunk(&mut self, ctx: &mut FrameContext, header: &PacketHeader, data: &[u8], offset: usize) {
        trace!(stream = ctx.name(), offset, size = data.len(), "image chunk");
        match self.input {
            ImageInput::Raw => {
                if ctx.check_write_buffer_for_overflow(data.len()) {
                    ctx.write_buffer().write_unchecked(data);
                }
            }
            ImageInput::Yuv(_) => self.process_yuv(ctx, data),
            ImageInput::Compressed(_) => self.process_compressed(ctx, header, data, offset),
            ImageInput::Jpeg(_) => self.process_jpeg(ctx, data),
            ImageInput::Ir(_) => self.process_ir(ctx, data),
        }
    }

    fn end_of_frame(&mut self, ctx: &mut FrameContext, _header: &PacketHeader) {
        match self.input {
            ImageInput::Compressed(_) => self.finish_compressed(ctx),
            ImageInput::Jpeg(_) => self.finish_jpeg(ctx),
            ImageInput::Ir(_) => self.finish_ir(ctx),
            ImageInput::Raw | ImageInput::Yuv(_) => (),
        }
        if !self.compressed_output() {
            let size = ctx.write_buffer().size();
            let expected = self.max_frame_size();
            if size != expected {
                warn!(stream = ctx.name(), size, expected, "image buffer is corrupt");
                ctx.frame_is_corrupted();
            }
        }
        self.reset_input();
    }
}

/// A ready to use image (or IR, for [`ImageEncoding::Ir10`]) stream processor
pub fn image_processor(config: ImageProcessorConfig) -> Result<FrameStreamProcessor<ImageCodec>> {
    let name = if config.encoding == ImageEncoding::Ir10 {
        "IR"
    } else {
        "Image"
    };
    Ok(FrameStreamProcessor::new(
        name,
        StreamKind::Image,
        ImageCodec::new(config)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{processor::DataProcessor, Frame};

    fn header(packet_type: u16, packet_id: u16, buf_size: usize) -> PacketHeader {
        PacketHeader {
            packet_type,
            packet_id,
            buf_size: buf_size as u16,
            ..Default::default()
        }
    }

    /// Send `payload` as a SOF and an EOF packet, split at `split`
    fn run_frame(processor: &mut impl DataProcessor, first_id: u16, payload: &[u8], split: usize) -> Frame {
        let (a, b) = payload.split_at(split);
        assert!(processor
            .process_data(&header(packet_type::IMAGE_START, first_id, a.len()), a, 0)
            .is_none());
        processor
            .process_data(&header(packet_type::IMAGE_END, first_id + 1, b.len()), b, 0)
            .unwrap()
    }

    fn config(encoding: ImageEncoding, output_format: PixelFormat, x_res: usize, y_res: usize) -> ImageProcessorConfig {
        ImageProcessorConfig {
            geometry: StreamGeometry { x_res, y_res },
            output_format,
            encoding,
        }
    }

    #[test]
    fn yuv_to_rgb_across_chunks() {
        let mut processor = image_processor(config(ImageEncoding::Yuv422, PixelFormat::Rgb888, 4, 1)).unwrap();
        let payload = [128, 16, 128, 235, 128, 235, 128, 16];
        for split in 0..=payload.len() {
            let frame = run_frame(&mut processor, 1 + split as u16 * 2, &payload, split);
            assert!(!frame.corrupted, "split at {split}");
            assert_eq!(frame.data, [0, 0, 0, 255, 255, 255, 255, 255, 255, 0, 0, 0]);
        }

        let mut processor = image_processor(config(ImageEncoding::Yuyv, PixelFormat::Rgb888, 2, 1)).unwrap();
        let frame = run_frame(&mut processor, 1, &[235, 128, 16, 128], 1);
        assert_eq!(frame.data, [255, 255, 255, 0, 0, 0]);
    }

    #[test]
    fn raw_passthrough() {
        let mut processor = image_processor(config(ImageEncoding::Raw, PixelFormat::Gray8, 3, 2)).unwrap();
        let frame = run_frame(&mut processor, 1, &[1, 2, 3, 4, 5, 6], 2);
        assert_eq!(frame.data, [1, 2, 3, 4, 5, 6]);
        assert!(!frame.corrupted);
        let frame = run_frame(&mut processor, 3, &[1, 2, 3, 4, 5], 2);
        assert!(frame.corrupted);
    }

    #[test]
    fn ir_to_gray16_and_rgb() {
        // 10 bit values 0, 1023, 512, 4 packed into 5 bytes
        let payload = [0x00, 0x3f, 0xf8, 0x00, 0x04];
        let mut processor = image_processor(config(ImageEncoding::Ir10, PixelFormat::Gray16, 2, 2)).unwrap();
        let frame = run_frame(&mut processor, 1, &payload, 3);
        assert!(!frame.corrupted);
        let values: Vec<u16> = frame.data.chunks_exact(2).map(LittleEndian::read_u16).collect();
        assert_eq!(values, [0, 1023, 512, 4]);

        let mut processor = image_processor(config(ImageEncoding::Ir10, PixelFormat::Rgb888, 2, 2)).unwrap();
        let frame = run_frame(&mut processor, 1, &payload, 2);
        assert!(!frame.corrupted);
        assert_eq!(frame.data, [0, 0, 0, 255, 255, 255, 128, 128, 128, 1, 1, 1]);
    }

    #[test]
    fn ir_left_over_bytes_corrupt_the_frame() {
        let mut processor = image_processor(config(ImageEncoding::Ir10, PixelFormat::Gray16, 2, 2)).unwrap();
        let frame = run_frame(&mut processor, 1, &[0, 0, 0, 0, 0, 1], 3);
        assert!(frame.corrupted);
    }

    #[test]
    fn ps_compressed_to_yuv_and_rgb() {
        // One 2 pixel line: u=2 y1=4 v=6 as differences from 0, y2 = y1 + 0 (slot 3 continues
        // slot 1)
        let compressed = [0x8a, 0xc6];
        let mut processor =
            image_processor(config(ImageEncoding::PsCompressed, PixelFormat::Yuv422, 2, 1)).unwrap();
        for split in 0..=compressed.len() {
            let frame = run_frame(&mut processor, 1 + split as u16 * 2, &compressed, split);
            assert!(!frame.corrupted, "split at {split}");
            assert_eq!(frame.data, [2, 4, 6, 4]);
        }

        let mut processor =
            image_processor(config(ImageEncoding::PsCompressed, PixelFormat::Rgb888, 2, 1)).unwrap();
        let frame = run_frame(&mut processor, 1, &compressed, 2);
        assert!(!frame.corrupted);
        assert_eq!(frame.data, [0, 134, 0, 0, 134, 0]);
    }

    #[test]
    fn ps_compressed_overflow_keeps_the_decoded_part() {
        let mut processor =
            image_processor(config(ImageEncoding::PsCompressed, PixelFormat::Yuv422, 2, 1)).unwrap();
        // A complete line, then the start of a line that does not fit
        let frame = run_frame(&mut processor, 1, &[0x8a, 0xc6, 0x66], 0);
        assert!(frame.corrupted);
        assert_eq!(frame.data, [2, 4, 6, 4]);

        let frame = run_frame(&mut processor, 3, &[0x8a, 0xc6], 0);
        assert!(!frame.corrupted);
        assert_eq!(frame.data, [2, 4, 6, 4]);
    }

    #[test]
    fn unsupported_combinations() {
        for (encoding, format) in [
            (ImageEncoding::Yuv422, PixelFormat::Gray8),
            (ImageEncoding::PsCompressed, PixelFormat::Gray16),
            (ImageEncoding::Ir10, PixelFormat::Yuv422),
            (ImageEncoding::Jpeg, PixelFormat::Yuv422),
        ] {
            assert!(matches!(
                ImageCodec::new(config(encoding, format, 4, 4)),
                Err(Error::UnsupportedFormat(f)) if f == format
            ));
        }
    }

    #[cfg(feature = "jpeg")]
    fn encode_jpeg(width: u32, height: u32) -> Vec<u8> {
        let pixels: Vec<u8> = (0..width * height)
            .flat_map(|i| [(i * 8) as u8, 100, 200])
            .collect();
        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode(&pixels, width, height, image::ExtendedColorType::Rgb8)
            .unwrap();
        jpeg
    }

    #[cfg(feature = "jpeg")]
    #[test]
    fn corrupt_jpeg_only_affects_its_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = image_processor(config(ImageEncoding::Jpeg, PixelFormat::Rgb888, 64, 64))
            .unwrap()
            .with_dump_dir(dir.path());
        let jpeg = encode_jpeg(64, 64);
        assert!(jpeg.len() <= 64 * 64 * 3);

        // Cut off before the frame header
        let truncated = &jpeg[..20];
        let frame = run_frame(&mut processor, 1, truncated, 10);
        assert!(frame.corrupted);
        let dumped = std::fs::read(dir.path().join("BadImage_1.jpeg")).unwrap();
        assert_eq!(dumped, truncated);

        let frame = run_frame(&mut processor, 3, &jpeg, jpeg.len() / 2);
        assert!(!frame.corrupted);
        assert_eq!(frame.frame_id, 2);
        assert_eq!(frame.data.len(), 64 * 64 * 3);
        assert!(!dir.path().join("BadImage_2.jpeg").exists());
    }

    #[cfg(feature = "jpeg")]
    #[test]
    fn jpeg_double_sof_continues_the_frame() {
        let mut processor =
            image_processor(config(ImageEncoding::Jpeg, PixelFormat::Rgb888, 64, 64)).unwrap();
        let jpeg = encode_jpeg(64, 64);
        let (a, rest) = jpeg.split_at(20);
        let (b, c) = rest.split_at(20);
        processor.process_data(&header(packet_type::IMAGE_START, 1, a.len()), a, 0);
        processor.process_data(&header(packet_type::IMAGE_START, 2, b.len()), b, 0);
        let frame = processor
            .process_data(&header(packet_type::IMAGE_END, 3, c.len()), c, 0)
            .unwrap();
        assert!(!frame.corrupted);
        assert_eq!(frame.data.len(), 64 * 64 * 3);
    }

    #[cfg(feature = "jpeg")]
    #[test]
    fn jpeg_overflow_is_corruption() {
        let mut processor =
            image_processor(config(ImageEncoding::Jpeg, PixelFormat::Rgb888, 2, 2)).unwrap();
        let frame = run_frame(&mut processor, 1, &[0u8; 20], 4);
        assert!(frame.corrupted);
    }
}
