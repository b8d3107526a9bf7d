// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Output pixel formats. See [`PixelFormat`]

/// Pixel layouts a stream can deliver. The discriminants are the OpenNI numeric codes,
/// which is also how the format is stored in the `OutputFormat` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Depth in millimeters, 16 bits per pixel
    Depth1Mm = 100,
    /// Depth in 100 micrometer units, 16 bits per pixel
    Depth100Um = 101,
    /// Raw shift values (9.2 fixed point), 16 bits per pixel
    Shift9_2 = 102,
    /// Raw shift values (9.3 fixed point), 16 bits per pixel
    Shift9_3 = 103,
    /// Packed 8 bit red, green, blue
    Rgb888 = 200,
    /// U Y1 V Y2, two pixels per 4 bytes
    Yuv422 = 201,
    /// 8 bit grayscale
    Gray8 = 202,
    /// 16 bit grayscale
    Gray16 = 203,
    /// Compressed JPEG stream
    Jpeg = 204,
    /// Y1 U Y2 V, two pixels per 4 bytes
    Yuyv = 205,
}

impl PixelFormat {
    /// Storage size of one pixel, in bytes. JPEG counts as one byte per pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Depth1Mm
            | PixelFormat::Depth100Um
            | PixelFormat::Shift9_2
            | PixelFormat::Shift9_3
            | PixelFormat::Gray16
            | PixelFormat::Yuv422
            | PixelFormat::Yuyv => 2,
            PixelFormat::Rgb888 => 3,
            PixelFormat::Gray8 | PixelFormat::Jpeg => 1,
        }
    }

    /// `true` for the formats the depth pipeline can produce
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            PixelFormat::Depth1Mm
                | PixelFormat::Depth100Um
                | PixelFormat::Shift9_2
                | PixelFormat::Shift9_3
        )
    }

    /// The numeric OpenNI code
    pub fn code(self) -> u64 {
        self as u64
    }

    /// Parse an OpenNI numeric code
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            100 => PixelFormat::Depth1Mm,
            101 => PixelFormat::Depth100Um,
            102 => PixelFormat::Shift9_2,
            103 => PixelFormat::Shift9_3,
            200 => PixelFormat::Rgb888,
            201 => PixelFormat::Yuv422,
            202 => PixelFormat::Gray8,
            203 => PixelFormat::Gray16,
            204 => PixelFormat::Jpeg,
            205 => PixelFormat::Yuyv,
            _ => return None,
        })
    }
}

/// Resolution of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGeometry {
    /// Pixels per line
    pub x_res: usize,
    /// Lines per frame
    pub y_res: usize,
}

impl StreamGeometry {
    /// VGA, the default mode of both depth and image streams
    pub const VGA: StreamGeometry = StreamGeometry {
        x_res: 640,
        y_res: 480,
    };

    /// QVGA
    pub const QVGA: StreamGeometry = StreamGeometry {
        x_res: 320,
        y_res: 240,
    };

    /// Number of pixels in a frame
    pub fn pixels(&self) -> usize {
        self.x_res * self.y_res
    }

    /// Size of a whole frame in `format`
    pub fn frame_size(&self, format: PixelFormat) -> usize {
        self.pixels() * format.bytes_per_pixel()
    }
}

impl Default for StreamGeometry {
    fn default() -> Self {
        Self::VGA
    }
}
