// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! YUV to RGB conversion, BT.601 studio swing, fixed point

/// Bytes of one two-pixel YUV group
pub const YUV_GROUP_BYTES: usize = 4;
/// Bytes of the two RGB pixels made from a group
pub const RGB_GROUP_BYTES: usize = 6;

#[inline]
fn clip(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Convert one pixel
#[inline]
pub fn yuv444_to_rgb888(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as i32 - 16) * 298 + 128;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clip((c + 409 * e) >> 8),
        clip((c - 100 * d - 208 * e) >> 8),
        clip((c + 516 * d) >> 8),
    ]
}

/// Convert whole groups while they fit `output`. `order` gives the byte offsets of
/// (u, y1, v, y2) inside a group. Returns (bytes read, bytes written).
fn convert_groups(input: &[u8], output: &mut [u8], order: [usize; 4]) -> (usize, usize) {
    let [u, y1, v, y2] = order;
    let mut groups = 0;
    for (src, dst) in input
        .chunks_exact(YUV_GROUP_BYTES)
        .zip(output.chunks_exact_mut(RGB_GROUP_BYTES))
    {
        dst[..3].copy_from_slice(&yuv444_to_rgb888(src[y1], src[u], src[v]));
        dst[3..].copy_from_slice(&yuv444_to_rgb888(src[y2], src[u], src[v]));
        groups += 1;
    }
    (groups * YUV_GROUP_BYTES, groups * RGB_GROUP_BYTES)
}

/// Convert U Y1 V Y2 data. Returns (bytes read, bytes written).
pub fn yuv422_to_rgb888(input: &[u8], output: &mut [u8]) -> (usize, usize) {
    convert_groups(input, output, [0, 1, 2, 3])
}

/// Convert Y1 U Y2 V data. Returns (bytes read, bytes written).
pub fn yuyv_to_rgb888(input: &[u8], output: &mut [u8]) -> (usize, usize) {
    convert_groups(input, output, [1, 0, 3, 2])
}
