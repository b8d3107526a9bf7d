// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Decoder for the legacy 4 bit differential image compression.
//!
//! The input is a stream of nibbles:
//! - `0x0..=0xC`: difference of `-6..=6` to the running value of the current channel
//! - `0xD`: filler, ignored
//! - `0xE`, `0xF`: the next two nibbles are a literal 8 bit value
//!
//! Running values are reset at the end of every line. Decoding can stop in the middle of the
//! input, in which case only whole lines are reported as done, so the remainder can be
//! prepended to the next chunk.

use crate::{Error, Result};

/// How running values are assigned to output bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    /// YUV422 (U Y1 V Y2): four slots, the second luma continues from the first one
    Ps,
    /// Two alternating slots
    New,
}

/// How far a decode call got
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Decoded {
    /// Input bytes fully consumed
    pub read: usize,
    /// Output bytes that are final
    pub written: usize,
}

struct Nibbles<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Nibbles<'_> {
    fn len(&self) -> usize {
        self.input.len() * 2
    }

    fn at(&self, pos: usize) -> u8 {
        let byte = self.input[pos / 2];
        if pos % 2 == 0 {
            byte >> 4
        } else {
            byte & 0x0f
        }
    }

    /// Byte position of the decoder. A half-consumed byte is not counted as read.
    fn byte_pos(&self) -> usize {
        self.pos / 2
    }
}

/// Decode `input` into `output`. Lines are `line_size` output bytes long.
///
/// If `last_part` is set, everything consumed is reported. Otherwise the result only covers
/// complete lines, and is zero if no line was completed.
pub fn uncompress(
    layout: ChannelLayout,
    input: &[u8],
    output: &mut [u8],
    line_size: usize,
    last_part: bool,
) -> Result<Decoded> {
    if input.is_empty() {
        return Err(Error::CompressedBufferTooSmall);
    }

    let mut nibbles = Nibbles { input, pos: 0 };
    let mut last_full = [0u8; 4];
    let mut channel = 0;
    let mut line_bytes = 0;
    let mut written = 0;
    let mut stop = Decoded::default();
    let mut truncated = false;

    while nibbles.pos < nibbles.len() {
        let code = nibbles.at(nibbles.pos);
        nibbles.pos += 1;
        match code {
            0x0..=0xc => {
                last_full[channel] = last_full[channel].wrapping_add_signed(code as i8 - 6);
            }
            0xd => continue,
            _ => {
                if nibbles.pos + 2 > nibbles.len() {
                    truncated = true;
                    break;
                }
                last_full[channel] = nibbles.at(nibbles.pos) << 4 | nibbles.at(nibbles.pos + 1);
                nibbles.pos += 2;
            }
        }

        let Some(out) = output.get_mut(written) else {
            return Err(Error::OutputBufferOverflow {
                needed: written + 1,
                available: output.len(),
            });
        };
        *out = last_full[channel];
        written += 1;

        channel += 1;
        match (layout, channel) {
            (ChannelLayout::Ps, 2) => last_full[3] = last_full[1],
            (ChannelLayout::Ps, 4) => {
                last_full[1] = last_full[3];
                channel = 0;
            }
            (ChannelLayout::New, 2) => channel = 0,
            _ => (),
        }

        line_bytes += 1;
        if line_bytes == line_size {
            stop = Decoded {
                read: nibbles.byte_pos(),
                written,
            };
            last_full = [0; 4];
            line_bytes = 0;
        }
    }

    if last_part {
        let read = if truncated {
            input.len()
        } else {
            nibbles.byte_pos()
        };
        Ok(Decoded { read, written })
    } else if stop.read != 0 && stop.written != 0 {
        Ok(stop)
    } else {
        Ok(Decoded::default())
    }
}
