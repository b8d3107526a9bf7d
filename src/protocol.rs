// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Wire framing of the sensor's data endpoints.
//!
//! Every endpoint carries a stream of "mini packets": a 12 byte [`PacketHeader`] followed by
//! its payload. Transfers do not respect packet boundaries, so [`PacketParser`] reassembles
//! headers across reads and hands out payload pieces as `(header, data, offset)` chunks.
//! [`StreamDispatcher`] routes those chunks to the per-stream processors.

use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tracing::{trace, warn};

use crate::processor::{DataProcessor, Frame};

/// Size of the header on the wire
pub const HEADER_SIZE: usize = 12;

/// Magic of firmware 2.5 and older ("SP")
pub const FW_MAGIC_25: u16 = 0x5350;
/// Magic of firmware 2.6 and newer ("BR")
pub const FW_MAGIC_26: u16 = 0x4252;

/// Packet type codes
pub mod packet_type {
    /// First packet of a depth frame
    pub const DEPTH_START: u16 = 0x7100;
    /// Middle packet of a depth frame
    pub const DEPTH_BUFFER: u16 = 0x7200;
    /// Last packet of a depth frame
    pub const DEPTH_END: u16 = 0x7500;
    /// First packet of an image (or IR) frame
    pub const IMAGE_START: u16 = 0x8100;
    /// Middle packet of an image (or IR) frame
    pub const IMAGE_BUFFER: u16 = 0x8200;
    /// Last packet of an image (or IR) frame
    pub const IMAGE_END: u16 = 0x8500;
    /// Audio samples
    pub const AUDIO_BUFFER: u16 = 0x9200;
    /// Global motion compensation points
    pub const GMC: u16 = 0xa200;
    /// GMC debug data
    pub const GMC_DEBUG: u16 = 0xb200;
    /// Last packet of GMC debug data
    pub const GMC_DEBUG_END: u16 = 0xb500;
    /// Wavelength correction debug data
    pub const WAVELENGTH_CORRECTION_DEBUG: u16 = 0xc200;
    /// Thermo-electric cooler debug data
    pub const TEC_DEBUG: u16 = 0xd200;
    /// NESA debug data
    pub const NESA_DEBUG: u16 = 0xd201;
    /// The projector reported a fault
    pub const PROJECTOR_FAULT_EVENT: u16 = 0xdead;
    /// The device is overheating
    pub const OVERHEAT: u16 = 0xf31f;
}

/// Header of a mini packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    /// Firmware magic
    pub magic: u16,
    /// One of the [`packet_type`] codes
    pub packet_type: u16,
    /// Running packet counter of the stream
    pub packet_id: u16,
    /// Size of the payload (the header not included)
    pub buf_size: u16,
    /// Device timestamp
    pub timestamp: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct RawPacketHeader {
    magic: u16,
    packet_type: u16,
    packet_id: u16,
    buf_size: u16,
    timestamp: u32,
}

unsafe impl bytemuck::Zeroable for RawPacketHeader {}
unsafe impl bytemuck::Pod for RawPacketHeader {}

impl PacketHeader {
    /// Parse a header. `buf_size` is big endian on the wire and counts the header too.
    /// Returns `None` if it claims to be shorter than the header itself.
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Option<Self> {
        let raw: RawPacketHeader = bytemuck::pod_read_unaligned(bytes);
        let total_size = u16::from_be(raw.buf_size);
        Some(Self {
            magic: u16::from_le(raw.magic),
            packet_type: u16::from_le(raw.packet_type),
            packet_id: u16::from_le(raw.packet_id),
            buf_size: total_size.checked_sub(HEADER_SIZE as u16)?,
            timestamp: u32::from_le(raw.timestamp),
        })
    }

    /// Wire representation of the header
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let raw = RawPacketHeader {
            magic: self.magic.to_le(),
            packet_type: self.packet_type.to_le(),
            packet_id: self.packet_id.to_le(),
            buf_size: self.buf_size.wrapping_add(HEADER_SIZE as u16).to_be(),
            timestamp: self.timestamp.to_le(),
        };
        bytemuck::cast(raw)
    }
}

/// Bulk endpoint of the depth stream (firmware 3.0 and newer)
pub const DEPTH_ENDPOINT: u8 = 0x81;
/// Bulk endpoint of the image and IR streams
pub const IMAGE_ENDPOINT: u8 = 0x82;
/// Bulk endpoint of audio and the debug channels
pub const MISC_ENDPOINT: u8 = 0x83;

/// Settings of a data endpoint reader
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// USB endpoint address
    pub endpoint: u8,
    /// How long a read waits for data. Zero waits forever.
    pub read_timeout: Duration,
    /// Firmware magic to look for
    pub magic: u16,
    /// Bytes dropped at the very start of the stream. The first transfer of each endpoint
    /// is garbage on some firmware versions.
    pub ignore_bytes: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            endpoint: DEPTH_ENDPOINT,
            read_timeout: Duration::ZERO,
            magic: FW_MAGIC_26,
            ignore_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    IgnoringGarbage { missing: usize },
    LookingForMagic { first_byte_seen: bool },
    Header { have: usize },
    Data { missing: usize },
}

/// Reassembles mini packets from arbitrary pieces of the byte stream
#[derive(Debug)]
pub struct PacketParser {
    magic: [u8; 2],
    state: ParserState,
    header_bytes: [u8; HEADER_SIZE],
    header: PacketHeader,
}

impl PacketParser {
    /// New parser at the start of a stream
    pub fn new(config: &ReaderConfig) -> Self {
        Self {
            magic: config.magic.to_le_bytes(),
            state: ParserState::IgnoringGarbage {
                missing: config.ignore_bytes,
            },
            header_bytes: [0; HEADER_SIZE],
            header: PacketHeader::default(),
        }
    }

    /// Process one read worth of bytes, calling `on_chunk(header, data, offset)` for every
    /// piece of payload found.
    pub fn feed(&mut self, mut bytes: &[u8], mut on_chunk: impl FnMut(&PacketHeader, &[u8], usize)) {
        while !bytes.is_empty() {
            match self.state {
                ParserState::IgnoringGarbage { missing } => {
                    let skip = missing.min(bytes.len());
                    if skip > 0 {
                        trace!(skip, "ignoring garbage bytes");
                    }
                    bytes = &bytes[skip..];
                    self.state = if missing == skip {
                        ParserState::LookingForMagic {
                            first_byte_seen: false,
                        }
                    } else {
                        ParserState::IgnoringGarbage {
                            missing: missing - skip,
                        }
                    };
                }
                ParserState::LookingForMagic { first_byte_seen } => {
                    if first_byte_seen && bytes[0] == self.magic[1] {
                        bytes = &bytes[1..];
                        self.start_header();
                        continue;
                    }
                    match bytes.windows(2).position(|w| w == self.magic) {
                        Some(pos) => {
                            bytes = &bytes[pos + 2..];
                            self.start_header();
                        }
                        None => {
                            let first_byte_seen = bytes[bytes.len() - 1] == self.magic[0];
                            bytes = &[];
                            self.state = ParserState::LookingForMagic { first_byte_seen };
                        }
                    }
                }
                ParserState::Header { have } => {
                    let take = (HEADER_SIZE - have).min(bytes.len());
                    self.header_bytes[have..have + take].copy_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];
                    let have = have + take;
                    if have < HEADER_SIZE {
                        self.state = ParserState::Header { have };
                        continue;
                    }
                    match PacketHeader::parse(&self.header_bytes) {
                        Some(header) => {
                            self.header = header;
                            if header.buf_size == 0 {
                                on_chunk(&self.header, &[], 0);
                                self.state = ParserState::LookingForMagic {
                                    first_byte_seen: false,
                                };
                            } else {
                                self.state = ParserState::Data {
                                    missing: header.buf_size as usize,
                                };
                            }
                        }
                        None => {
                            warn!("packet header with invalid size, resyncing");
                            self.state = ParserState::LookingForMagic {
                                first_byte_seen: false,
                            };
                        }
                    }
                }
                ParserState::Data { missing } => {
                    let take = missing.min(bytes.len());
                    let offset = self.header.buf_size as usize - missing;
                    on_chunk(&self.header, &bytes[..take], offset);
                    bytes = &bytes[take..];
                    self.state = if take == missing {
                        ParserState::LookingForMagic {
                            first_byte_seen: false,
                        }
                    } else {
                        ParserState::Data {
                            missing: missing - take,
                        }
                    };
                }
            }
        }
    }

    fn start_header(&mut self) {
        self.header_bytes = [0; HEADER_SIZE];
        self.header_bytes[..2].copy_from_slice(&self.magic);
        self.state = ParserState::Header { have: 2 };
    }
}

/// Device level condition reported in-band by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorState {
    /// The projector reported a fault
    ProjectorFault,
    /// The device is overheating
    Overheat,
}

type ProcessorSlot = Mutex<Option<Box<dyn DataProcessor + Send>>>;

/// Routes chunks to the depth, image and audio processors.
///
/// Processors can be replaced from another thread while data flows. Each slot is locked
/// while a chunk is processed.
#[derive(Default)]
pub struct StreamDispatcher {
    depth: ProcessorSlot,
    image: ProcessorSlot,
    audio: ProcessorSlot,
    debug: ProcessorSlot,
    error_state: Mutex<Option<DeviceErrorState>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamDispatcher {
    /// Dispatcher without any processors. Chunks of missing streams are dropped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or remove, with `None`) the depth processor
    pub fn replace_depth(&self, processor: Option<Box<dyn DataProcessor + Send>>) {
        *lock(&self.depth) = processor;
    }

    /// Install (or remove, with `None`) the image processor. IR uses the image packets too.
    pub fn replace_image(&self, processor: Option<Box<dyn DataProcessor + Send>>) {
        *lock(&self.image) = processor;
    }

    /// Install (or remove, with `None`) the audio processor
    pub fn replace_audio(&self, processor: Option<Box<dyn DataProcessor + Send>>) {
        *lock(&self.audio) = processor;
    }

    /// Install (or remove, with `None`) the processor of the firmware debug packets
    pub fn replace_debug(&self, processor: Option<Box<dyn DataProcessor + Send>>) {
        *lock(&self.debug) = processor;
    }

    /// Last in-band error reported by the device, cleared by the next stream data
    pub fn error_state(&self) -> Option<DeviceErrorState> {
        *lock(&self.error_state)
    }

    /// Handle one chunk. Returns a frame if this chunk completed one.
    pub fn process_chunk(&self, header: &PacketHeader, data: &[u8], offset: usize) -> Option<Frame> {
        let slot = match header.packet_type {
            packet_type::DEPTH_START | packet_type::DEPTH_BUFFER | packet_type::DEPTH_END => {
                &self.depth
            }
            packet_type::IMAGE_START | packet_type::IMAGE_BUFFER | packet_type::IMAGE_END => {
                &self.image
            }
            packet_type::AUDIO_BUFFER => &self.audio,
            packet_type::GMC_DEBUG
            | packet_type::GMC_DEBUG_END
            | packet_type::WAVELENGTH_CORRECTION_DEBUG
            | packet_type::TEC_DEBUG
            | packet_type::NESA_DEBUG => &self.debug,
            packet_type::GMC => {
                trace!(size = data.len(), "ignoring GMC data");
                return None;
            }
            packet_type::PROJECTOR_FAULT_EVENT => {
                warn!("projector fault reported by device");
                *lock(&self.error_state) = Some(DeviceErrorState::ProjectorFault);
                return None;
            }
            packet_type::OVERHEAT => {
                warn!("device is overheating");
                *lock(&self.error_state) = Some(DeviceErrorState::Overheat);
                return None;
            }
            other => {
                warn!(packet_type = format_args!("0x{other:x}"), "unknown packet type");
                return None;
            }
        };

        lock(&self.error_state).take();
        lock(slot)
            .as_mut()
            .and_then(|processor| processor.process_data(header, data, offset))
    }

    /// Parse `bytes` with `parser` and dispatch every chunk. Returns the completed frames.
    pub fn feed(&self, parser: &mut PacketParser, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        parser.feed(bytes, |header, data, offset| {
            frames.extend(self.process_chunk(header, data, offset));
        });
        frames
    }
}
