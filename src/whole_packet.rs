// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Streams whose packets are only useful whole: audio and the firmware debug channels.

use std::{
    collections::{HashMap, VecDeque},
    fs::File,
    io::Write,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use tracing::{debug, warn};

use crate::{
    buffer::Buffer,
    processor::{DataProcessor, Frame, PacketTracker},
    protocol::{packet_type, PacketHeader},
};

/// Largest audio packet the device sends
pub const MAX_AUDIO_PACKET_SIZE: usize = 2048;
/// Largest debug packet the device sends
pub const MAX_DEBUG_PACKET_SIZE: usize = 4096;

/// Receives complete packets
pub trait PacketSink {
    /// `data` is the whole payload of the packet described by `header`
    fn process_whole_packet(&mut self, header: &PacketHeader, data: &[u8]);
}

/// Collects the chunks of a packet and hands the complete packet to a [`PacketSink`].
///
/// A packet that is cut short (a new one starts before it ends) or is larger than the maximum
/// size is dropped with a warning.
pub struct WholePacketProcessor<S> {
    name: String,
    packet: Buffer<'static>,
    tracker: PacketTracker,
    sink: S,
}

impl<S: PacketSink> WholePacketProcessor<S> {
    /// Processor for packets of at most `max_packet_size` bytes
    pub fn new(name: impl Into<String>, max_packet_size: usize, sink: S) -> Self {
        Self {
            name: name.into(),
            packet: Buffer::with_capacity(max_packet_size),
            tracker: PacketTracker::default(),
            sink,
        }
    }

    /// The sink
    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: PacketSink> DataProcessor for WholePacketProcessor<S> {
    fn process_data(&mut self, header: &PacketHeader, data: &[u8], offset: usize) -> Option<Frame> {
        self.tracker.track(&self.name, header, data.len(), offset);

        if offset == 0 && self.packet.size() != 0 {
            warn!(
                stream = %self.name,
                got = self.packet.size(),
                "previous packet was not received to its end"
            );
            self.packet.reset();
        }

        let size = header.buf_size as usize;
        if size > self.packet.max_size() {
            warn!(
                stream = %self.name,
                size,
                max_size = self.packet.max_size(),
                "packet is bigger than max size"
            );
            return None;
        }
        if let Err(e) = self.packet.write(data) {
            warn!(stream = %self.name, error = %e, "packet data does not fit");
            self.packet.reset();
            return None;
        }
        if self.packet.size() == size {
            self.sink.process_whole_packet(header, self.packet.data());
            self.packet.reset();
        }
        None
    }
}

/// One audio packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    /// Device timestamp
    pub timestamp: u32,
    /// 16 bit little endian samples
    pub data: Vec<u8>,
}

/// Bounded queue of received audio packets, shared between the reader and the consumer.
/// When full, the oldest packet is dropped.
#[derive(Debug, Clone)]
pub struct AudioQueue {
    packets: Arc<Mutex<VecDeque<AudioPacket>>>,
    capacity: usize,
}

impl AudioQueue {
    /// Queue holding at most `capacity` packets
    pub fn new(capacity: usize) -> Self {
        Self {
            packets: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn push(&self, packet: AudioPacket) {
        let mut packets = self.packets.lock().unwrap_or_else(PoisonError::into_inner);
        if packets.len() >= self.capacity {
            packets.pop_front();
        }
        packets.push_back(packet);
    }

    /// Oldest packet, if any
    pub fn pop(&self) -> Option<AudioPacket> {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Number of packets waiting
    pub fn len(&self) -> usize {
        self.packets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// `true` if no packets are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Puts audio packets into an [`AudioQueue`]
pub struct AudioSink {
    queue: AudioQueue,
    delete_channel: bool,
}

impl AudioSink {
    /// If `delete_channel` is set, only the left channel of the stereo samples is kept
    pub fn new(queue: AudioQueue, delete_channel: bool) -> Self {
        Self {
            queue,
            delete_channel,
        }
    }
}

impl PacketSink for AudioSink {
    fn process_whole_packet(&mut self, header: &PacketHeader, data: &[u8]) {
        let data = if self.delete_channel {
            data.chunks_exact(4).flat_map(|frame| [frame[0], frame[1]]).collect()
        } else {
            data.to_vec()
        };
        self.queue.push(AudioPacket {
            timestamp: header.timestamp,
            data,
        });
    }
}

/// Audio stream processor feeding `queue`
pub fn audio_processor(queue: AudioQueue, delete_channel: bool) -> WholePacketProcessor<AudioSink> {
    WholePacketProcessor::new(
        "Audio",
        MAX_AUDIO_PACKET_SIZE,
        AudioSink::new(queue, delete_channel),
    )
}

/// Appends the firmware debug packets to text files in a directory, one file per channel
pub struct DebugDumpSink {
    dir: PathBuf,
    files: HashMap<u16, File>,
}

impl DebugDumpSink {
    /// Dump into `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: HashMap::new(),
        }
    }

    /// Name of the dump file of a debug packet type
    pub fn file_name(packet_type: u16) -> String {
        match packet_type {
            packet_type::NESA_DEBUG => "NesaDebug.txt".into(),
            packet_type::TEC_DEBUG => "TecDebug.csv".into(),
            other => format!("Debug_{other:04x}.txt"),
        }
    }
}

impl PacketSink for DebugDumpSink {
    fn process_whole_packet(&mut self, header: &PacketHeader, data: &[u8]) {
        // The firmware sends NUL terminated text
        let text = data.split(|&b| b == 0).next().unwrap_or_default();
        debug!(
            packet_type = format_args!("0x{:x}", header.packet_type),
            text = %String::from_utf8_lossy(text),
            "debug packet"
        );

        let file = match self.files.entry(header.packet_type) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let path = self.dir.join(Self::file_name(header.packet_type));
                match File::create(&path) {
                    Ok(file) => entry.insert(file),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "can't open debug dump");
                        return;
                    }
                }
            }
        };
        if let Err(e) = file.write_all(text).and_then(|_| file.write_all(b"\n")) {
            warn!(error = %e, "failed writing debug dump");
        }
    }
}

/// Processor of the firmware debug packets, dumping them into `dir`
pub fn debug_dump_processor(dir: impl Into<PathBuf>) -> WholePacketProcessor<DebugDumpSink> {
    WholePacketProcessor::new("Debug", MAX_DEBUG_PACKET_SIZE, DebugDumpSink::new(dir))
}
