// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Horizontal flipping of frames, in place.
//!
//! Every line goes through a fixed-size scratch line. Lines wider than [`MAX_LINE_BYTES`]
//! are refused instead of allocating.

use tracing::warn;

use crate::{Error, PixelFormat, Result};

/// Largest supported line, in bytes (full HD, 3 bytes per pixel)
pub const MAX_LINE_BYTES: usize = 1920 * 3;

fn check_line(line_bytes: usize) -> Result<()> {
    if line_bytes > MAX_LINE_BYTES {
        return Err(Error::BufferTooSmall {
            needed: line_bytes,
            available: MAX_LINE_BYTES,
        });
    }
    Ok(())
}

/// Reverse the order of `N` byte pixels on every line of `data`.
fn mirror_pixels<const N: usize>(data: &mut [u8], line_width: usize) -> Result<()> {
    let line_bytes = line_width * N;
    check_line(line_bytes)?;
    if line_bytes == 0 {
        return Ok(());
    }
    let mut scratch = [0u8; MAX_LINE_BYTES];
    for line in data.chunks_exact_mut(line_bytes) {
        let scratch = &mut scratch[..line_bytes];
        scratch.copy_from_slice(line);
        for (dst, src) in line
            .chunks_exact_mut(N)
            .zip(scratch.chunks_exact(N).rev())
        {
            dst.copy_from_slice(src);
        }
    }
    Ok(())
}

/// Mirror 8 bit pixels
pub fn mirror_1_byte(data: &mut [u8], line_width: usize) -> Result<()> {
    mirror_pixels::<1>(data, line_width)
}

/// Mirror 16 bit pixels
pub fn mirror_2_byte(data: &mut [u8], line_width: usize) -> Result<()> {
    mirror_pixels::<2>(data, line_width)
}

/// Mirror 24 bit pixels
pub fn mirror_3_byte(data: &mut [u8], line_width: usize) -> Result<()> {
    mirror_pixels::<3>(data, line_width)
}

/// Mirror two-pixel groups, reversing group order and swapping the luma samples inside each
/// group. `luma` holds the byte offsets of the two luma samples.
fn mirror_yuv_groups(data: &mut [u8], line_width: usize, luma: (usize, usize)) -> Result<()> {
    let line_bytes = line_width * 2;
    check_line(line_bytes)?;
    let groups_bytes = line_width / 2 * 4;
    if groups_bytes == 0 {
        return Ok(());
    }
    let mut scratch = [0u8; MAX_LINE_BYTES];
    for line in data.chunks_exact_mut(line_bytes) {
        let scratch = &mut scratch[..groups_bytes];
        scratch.copy_from_slice(&line[..groups_bytes]);
        for (dst, src) in line[..groups_bytes]
            .chunks_exact_mut(4)
            .zip(scratch.chunks_exact(4).rev())
        {
            dst.copy_from_slice(src);
            dst.swap(luma.0, luma.1);
        }
    }
    Ok(())
}

/// Mirror U Y1 V Y2 data
pub fn mirror_yuv422(data: &mut [u8], line_width: usize) -> Result<()> {
    mirror_yuv_groups(data, line_width, (1, 3))
}

/// Mirror Y1 U Y2 V data
pub fn mirror_yuyv(data: &mut [u8], line_width: usize) -> Result<()> {
    mirror_yuv_groups(data, line_width, (0, 2))
}

/// Mirror `data` in place, picking the pixel layout from `format`.
pub fn mirror(format: PixelFormat, data: &mut [u8], line_width: usize) -> Result<()> {
    match format {
        PixelFormat::Shift9_2
        | PixelFormat::Shift9_3
        | PixelFormat::Depth1Mm
        | PixelFormat::Depth100Um
        | PixelFormat::Gray16 => mirror_2_byte(data, line_width),
        PixelFormat::Gray8 => mirror_1_byte(data, line_width),
        PixelFormat::Yuv422 => mirror_yuv422(data, line_width),
        PixelFormat::Yuyv => mirror_yuyv(data, line_width),
        PixelFormat::Rgb888 => mirror_3_byte(data, line_width),
        PixelFormat::Jpeg => {
            warn!(?format, "mirror is not supported for this format");
            Err(Error::UnsupportedFormat(format))
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    use super::*;

    #[test]
    fn mirror_twice_is_identity() {
        let mut rng = StdRng::seed_from_u64(7);
        let formats = [
            PixelFormat::Gray8,
            PixelFormat::Depth1Mm,
            PixelFormat::Rgb888,
            PixelFormat::Yuv422,
            PixelFormat::Yuyv,
        ];
        for format in formats {
            let max_width = MAX_LINE_BYTES / format.bytes_per_pixel();
            let widths = (1..=64).chain([max_width - 1, max_width]);
            for width in widths {
                let mut data = vec![0u8; width * format.bytes_per_pixel() * 3];
                rng.fill_bytes(&mut data);
                let original = data.clone();
                mirror(format, &mut data, width).unwrap();
                mirror(format, &mut data, width).unwrap();
                assert_eq!(data, original, "{format:?} width {width}");
            }
        }
    }

    #[test]
    fn rgb_line_is_reversed() {
        let mut data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9];
        mirror_3_byte(&mut data, 3).unwrap();
        assert_eq!(data, vec![7, 8, 9, 4, 5, 6, 1, 2, 3]);
    }

    #[test]
    fn depth_lines_are_mirrored_separately() {
        let mut data = vec![1, 0, 2, 0, 3, 0, 4, 0];
        mirror_2_byte(&mut data, 2).unwrap();
        assert_eq!(data, vec![2, 0, 1, 0, 4, 0, 3, 0]);
    }

    #[test]
    fn yuv_luma_order_is_swapped() {
        // u y1 v y2 | u' y3 v' y4
        let mut data = vec![10, 1, 20, 2, 30, 3, 40, 4];
        mirror_yuv422(&mut data, 4).unwrap();
        assert_eq!(data, vec![30, 4, 40, 3, 10, 2, 20, 1]);

        // y1 u y2 v | y3 u' y4 v'
        let mut data = vec![1, 10, 2, 20, 3, 30, 4, 40];
        mirror_yuyv(&mut data, 4).unwrap();
        assert_eq!(data, vec![4, 30, 3, 40, 2, 10, 1, 20]);
    }

    #[test]
    fn too_wide_lines_are_refused() {
        let mut data = vec![0u8; (MAX_LINE_BYTES + 3) * 2];
        assert!(matches!(
            mirror_3_byte(&mut data, MAX_LINE_BYTES / 3 + 1),
            Err(Error::BufferTooSmall { .. })
        ));
        assert!(mirror_1_byte(&mut data, MAX_LINE_BYTES).is_ok());
    }

    #[test]
    fn jpeg_cannot_be_mirrored() {
        let mut data = vec![0u8; 16];
        assert!(matches!(
            mirror(PixelFormat::Jpeg, &mut data, 4),
            Err(Error::UnsupportedFormat(PixelFormat::Jpeg))
        ));
    }
}
