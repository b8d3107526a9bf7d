// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Depth stream decoding. See [`DepthCodec`] and [`depth_processor`]
//!
//! The device sends raw shift values in one of several encodings. Every shift goes through
//! the shift-to-depth table (or an identity table for shift output) on its way into the
//! frame.

use std::{marker::PhantomData, sync::Arc};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{trace, warn};

use crate::{
    format::StreamGeometry,
    processor::{Continuation, FrameCodec, FrameContext, FrameStreamProcessor, StreamKind},
    protocol::{packet_type, PacketHeader},
    shift_to_depth::{SharedTables, ShiftToDepthTables, MAX_SHIFT_VALUE},
    uncomp::Decoded,
    unpack::{
        unpack_packed11, unpack_packed12, ScalarUnpack, UnpackStrategy, PACKED11_ELEMENT_BYTES,
        PACKED11_ELEMENT_VALUES, PACKED12_ELEMENT_BYTES, PACKED12_ELEMENT_VALUES,
    },
    Error, PixelFormat, Result,
};

/// "No depth" in shift output
pub const NO_DEPTH_SHIFT: u16 = 2047;
/// "No depth" in depth output
pub const NO_DEPTH_VALUE: u16 = 0;

/// Uncompressed shifts at or above this are invalid
const RAW_SHIFT_LIMIT: u16 = MAX_SHIFT_VALUE as u16 - 1;

/// How the device encodes the depth stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthEncoding {
    /// Little endian 16 bit shifts
    Uncompressed,
    /// 11 bit packed shifts
    Packed11,
    /// 12 bit packed shifts
    Packed12,
    /// The PS nibble compression
    PsCompressed,
}

/// Settings of a depth processor
#[derive(Debug, Clone)]
pub struct DepthProcessorConfig {
    /// Resolution of the stream
    pub geometry: StreamGeometry,
    /// One of the depth formats
    pub output_format: PixelFormat,
    /// Input encoding
    pub encoding: DepthEncoding,
    /// The firmware reports padding pixels in the timestamp of the first packet (5.1+)
    pub firmware_padding: bool,
}

impl Default for DepthProcessorConfig {
    fn default() -> Self {
        Self {
            geometry: StreamGeometry::VGA,
            output_format: PixelFormat::Depth1Mm,
            encoding: DepthEncoding::Packed11,
            firmware_padding: true,
        }
    }
}

enum DepthLookup {
    Identity,
    Table(Arc<ShiftToDepthTables>),
}

impl DepthLookup {
    #[inline]
    fn output(&self, shift: u16) -> u16 {
        match self {
            DepthLookup::Identity => shift,
            DepthLookup::Table(tables) => tables
                .shift_to_depth()
                .get(shift as usize)
                .copied()
                .unwrap_or(NO_DEPTH_VALUE),
        }
    }
}

/// Look `shifts` up and append them to the frame. Marks the frame corrupted if they don't fit.
fn emit(ctx: &mut FrameContext, lookup: &DepthLookup, shifts: &[u16]) -> bool {
    let bytes = shifts.len() * 2;
    if !ctx.check_write_buffer_for_overflow(bytes) {
        return false;
    }
    let buffer = ctx.write_buffer();
    for (out, &shift) in buffer.spare_mut()[..bytes].chunks_exact_mut(2).zip(shifts) {
        LittleEndian::write_u16(out, lookup.output(shift));
    }
    buffer.advance(bytes);
    true
}

/// Decode the PS depth compression into raw shifts.
///
/// Nibble codes:
/// - `0x0..=0xC`: difference of `-6..=6`
/// - `0xD`: filler
/// - `0xE n`: the last value repeated `n + 1` times
/// - `0xF 1xxx n`: difference of `xxxn - 64`
/// - `0xF 0xxx n n n`: a 15 bit literal
///
/// Values at or above [`MAX_SHIFT_VALUE`] become 0. A code cut off by the end of the input is
/// dropped. Unless `last_part` is set, the result only reaches up to the last byte aligned
/// literal, which is where decoding can resume. `written` counts values.
pub fn uncompress_depth_ps(input: &[u8], output: &mut [u16], last_part: bool) -> Result<Decoded> {
    let nibble = |pos: usize| -> Option<u32> {
        let byte = *input.get(pos / 2)? as u32;
        Some(if pos % 2 == 0 { byte >> 4 } else { byte & 0x0f })
    };

    let mut pos = 0;
    let mut next = || {
        let n = nibble(pos);
        pos += 1;
        n
    };
    let mut written = 0;
    let mut put = |value: &mut u16, written: &mut usize| -> Result<()> {
        let available = output.len();
        let Some(out) = output.get_mut(*written) else {
            return Err(Error::OutputBufferOverflow {
                needed: *written + 1,
                available,
            });
        };
        if *value as u32 >= MAX_SHIFT_VALUE {
            *value = 0;
        }
        *out = *value;
        *written += 1;
        Ok(())
    };

    let mut last_value: u16 = 0;
    let mut stop = Decoded::default();
    let mut read_nibbles = 0;

    'decode: loop {
        let code_pos = read_nibbles;
        let Some(code) = next() else { break };
        read_nibbles += 1;
        match code {
            0xd => {}
            0xe => {
                let Some(count) = next() else { break };
                read_nibbles += 1;
                for _ in 0..=count {
                    put(&mut last_value, &mut written)?;
                }
            }
            0xf => {
                let Some(n) = next() else { break };
                read_nibbles += 1;
                if n & 0x8 != 0 {
                    let Some(low) = next() else { break };
                    read_nibbles += 1;
                    let large = ((n - 0x8) << 4 | low) as i32;
                    last_value = (last_value as i32 + large - 64) as u16;
                } else {
                    if code_pos % 2 == 0 {
                        stop = Decoded {
                            read: code_pos / 2,
                            written,
                        };
                    }
                    let mut value = n << 12;
                    for bit in [8, 4, 0] {
                        let Some(n) = next() else { break 'decode };
                        read_nibbles += 1;
                        value |= n << bit;
                    }
                    last_value = value as u16;
                }
                put(&mut last_value, &mut written)?;
            }
            diff => {
                last_value = (last_value as i32 + diff as i32 - 6) as u16;
                put(&mut last_value, &mut written)?;
            }
        }
    }

    if last_part {
        Ok(Decoded {
            read: (read_nibbles + 1) / 2,
            written,
        })
    } else {
        Ok(stop)
    }
}

enum InputState {
    Uncompressed,
    Packed(Continuation),
    Compressed(Vec<u8>),
}

/// Depth decoding on top of [`FrameStreamProcessor`]
pub struct DepthCodec<S = ScalarUnpack> {
    config: DepthProcessorConfig,
    tables: Arc<SharedTables>,
    lookup: DepthLookup,
    no_depth: u16,
    padding_on_end: usize,
    input: InputState,
    shifts: Vec<u16>,
    _strategy: PhantomData<S>,
}

impl<S: UnpackStrategy> DepthCodec<S> {
    /// Codec for `config`, reading the shift-to-depth tables from `tables` at every frame start
    pub fn new(config: DepthProcessorConfig, tables: Arc<SharedTables>) -> Result<Self> {
        let (lookup, no_depth) = match config.output_format {
            PixelFormat::Shift9_2 => (DepthLookup::Identity, NO_DEPTH_SHIFT),
            PixelFormat::Depth1Mm | PixelFormat::Depth100Um => {
                (DepthLookup::Table(tables.snapshot()), NO_DEPTH_VALUE)
            }
            other => {
                warn!(format = ?other, "unknown depth output format");
                return Err(Error::UnsupportedFormat(other));
            }
        };
        let input = match config.encoding {
            DepthEncoding::Uncompressed => InputState::Uncompressed,
            DepthEncoding::Packed11 => {
                InputState::Packed(Continuation::new(PACKED11_ELEMENT_BYTES))
            }
            DepthEncoding::Packed12 => {
                InputState::Packed(Continuation::new(PACKED12_ELEMENT_BYTES))
            }
            DepthEncoding::PsCompressed => InputState::Compressed(Vec::with_capacity(
                config.geometry.frame_size(config.output_format),
            )),
        };
        Ok(Self {
            config,
            tables,
            lookup,
            no_depth,
            padding_on_end: 0,
            input,
            shifts: Vec::new(),
            _strategy: PhantomData,
        })
    }

    /// Value of pixels without depth in the produced frames
    pub fn no_depth_value(&self) -> u16 {
        self.no_depth
    }

    fn expected_size(&self) -> usize {
        self.config.geometry.pixels() * 2
    }

    fn pad_pixels(&self, ctx: &mut FrameContext, pixels: usize) {
        if !ctx.check_write_buffer_for_overflow(pixels * 2) {
            return;
        }
        let buffer = ctx.write_buffer();
        for out in buffer.spare_mut()[..pixels * 2].chunks_exact_mut(2) {
            LittleEndian::write_u16(out, self.no_depth);
        }
        buffer.advance(pixels * 2);
    }

    fn reset_input(&mut self) {
        match &mut self.input {
            InputState::Uncompressed => (),
            InputState::Packed(continuation) => continuation.reset(),
            InputState::Compressed(raw) => raw.clear(),
        }
    }

    fn process_uncompressed(&mut self, ctx: &mut FrameContext, data: &[u8]) {
        if !ctx.check_write_buffer_for_overflow(data.len()) {
            return;
        }
        // Lost packets can leave an odd byte count. Keep the 16 bit alignment.
        let data = if data.len() % 2 != 0 { &data[1..] } else { data };
        self.shifts.clear();
        self.shifts.extend(data.chunks_exact(2).map(|b| {
            let shift = LittleEndian::read_u16(b);
            if shift < RAW_SHIFT_LIMIT {
                shift
            } else {
                0
            }
        }));
        emit(ctx, &self.lookup, &self.shifts);
    }

    fn process_packed(&mut self, ctx: &mut FrameContext, data: &[u8]) {
        let Self {
            input: InputState::Packed(continuation),
            shifts,
            lookup,
            config,
            ..
        } = self
        else {
            return;
        };
        let (element_bytes, element_values) = match config.encoding {
            DepthEncoding::Packed11 => (PACKED11_ELEMENT_BYTES, PACKED11_ELEMENT_VALUES),
            _ => (PACKED12_ELEMENT_BYTES, PACKED12_ELEMENT_VALUES),
        };
        let packed12 = config.encoding == DepthEncoding::Packed12;
        continuation.feed(data, |elements| {
            let count = elements.len() / element_bytes;
            if !ctx.check_write_buffer_for_overflow(count * element_values * 2) {
                return false;
            }
            shifts.resize(count * element_values, 0);
            if packed12 {
                unpack_packed12::<S>(elements, shifts.as_mut_slice());
            } else {
                unpack_packed11(elements, shifts.as_mut_slice());
            }
            emit(ctx, lookup, shifts.as_slice())
        });
    }

    fn process_compressed(&mut self, ctx: &mut FrameContext, header: &PacketHeader, data: &[u8], offset: usize) {
        let Self {
            input: InputState::Compressed(raw),
            shifts,
            lookup,
            config,
            ..
        } = self
        else {
            return;
        };

        let capacity = config.geometry.frame_size(config.output_format);
        let from_raw = !raw.is_empty();
        if from_raw {
            if capacity.saturating_sub(raw.len()) < data.len() {
                warn!(stream = ctx.name(), pending = raw.len(), "compressed depth overflow");
                ctx.frame_is_corrupted();
            } else {
                raw.extend_from_slice(data);
            }
        }
        let input: &[u8] = if from_raw { raw.as_slice() } else { data };

        let last_part = header.packet_type == packet_type::DEPTH_END
            && offset + data.len() == header.buf_size as usize;
        shifts.resize(ctx.write_buffer().free_space() / 2, 0);

        let read = match uncompress_depth_ps(input, shifts.as_mut_slice(), last_part) {
            Ok(decoded) => {
                emit(ctx, lookup, &shifts[..decoded.written]);
                decoded.read
            }
            Err(e) => {
                warn!(
                    stream = ctx.name(),
                    error = %e,
                    input_size = input.len(),
                    last_part,
                    "uncompress depth failed"
                );
                // The output is full of decoded values, keep them
                if let Error::OutputBufferOverflow { available, .. } = e {
                    emit(ctx, lookup, &shifts[..available]);
                }
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
}

impl<S: UnpackStrategy> FrameCodec for DepthCodec<S> {
    fn output_format(&self) -> PixelFormat {
        self.config.output_format
    }

    fn geometry(&self) -> StreamGeometry {
        self.config.geometry
    }

    fn start_of_frame(&mut self, ctx: &mut FrameContext, header: &PacketHeader) {
        if let DepthLookup::Table(tables) = &mut self.lookup {
            *tables = self.tables.snapshot();
        }
        self.reset_input();
        self.padding_on_end = 0;
        if self.config.firmware_padding && header.timestamp != 0 {
            self.padding_on_end = (header.timestamp & 0xffff) as usize;
            self.pad_pixels(ctx, (header.timestamp >> 16) as usize);
        }
    }

    fn process_chunk(&mut self, ctx: &mut FrameContext, header: &PacketHeader, data: &[u8], offset: usize) {
        trace!(stream = ctx.name(), offset, size = data.len(), "depth chunk");
        match self.input {
            InputState::Uncompressed => self.process_uncompressed(ctx, data),
            InputState::Packed(_) => self.process_packed(ctx, data),
            InputState::Compressed(_) => self.process_compressed(ctx, header, data, offset),
        }
    }

    fn end_of_frame(&mut self, ctx: &mut FrameContext, _header: &PacketHeader) {
        if self.padding_on_end != 0 {
            self.pad_pixels(ctx, self.padding_on_end);
            self.padding_on_end = 0;
        }
        let size = ctx.write_buffer().size();
        if size != self.expected_size() {
            warn!(
                stream = ctx.name(),
                size,
                expected = self.expected_size(),
                "depth buffer is corrupt"
            );
            ctx.frame_is_corrupted();
        }
        self.reset_input();
    }
}

/// A ready to use depth stream processor
pub fn depth_processor(
    config: DepthProcessorConfig,
    tables: Arc<SharedTables>,
) -> Result<FrameStreamProcessor<DepthCodec>> {
    Ok(FrameStreamProcessor::new(
        "Depth",
        StreamKind::Depth,
        DepthCodec::new(config, tables)?,
    ))
}
