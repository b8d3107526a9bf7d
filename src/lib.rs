// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.
#![warn(missing_docs)]
//! Protocol decoder for PS1080 based depth cameras (PrimeSense Carmine, Asus Xtion and friends).
//!
//! The crate turns the raw, chunked packet stream coming from the sensor's USB endpoints into
//! typed frames: depth, color, IR and audio. The transport itself is thin: with the `usb`
//! feature [`util::SensorReader`] reads bulk transfers with [`rusb`], but any byte source can
//! be fed into a [`protocol::PacketParser`].
//!
//! Example usage (in a thread, probably):
//! ```ignore
//! let mut properties = PropertyStore::new();
//! register_depth_properties(&mut properties, &ShiftToDepthConfig::default(), PixelFormat::Depth1Mm)?;
//! let helper = DepthStreamHelper::init(&mut properties)?;
//!
//! let dispatcher = StreamDispatcher::new();
//! let depth = helper.depth_processor(&properties, DepthProcessorConfig::default())?;
//! dispatcher.replace_depth(Some(Box::new(depth)));
//!
//! let mut reader = SensorReader::new(Arc::new(open_device(None)?), ReaderConfig::default());
//! loop {
//!     for frame in reader.read(&dispatcher)? {
//!         ...
//!     }
//! }
//! ```
//!
//! Lookup tables translating raw shift values to depth are built by [`shift_to_depth`] and
//! kept in sync with the calibration properties by [`depth_stream::DepthStreamHelper`].

use std::fmt;

pub mod buffer;
pub mod color;
pub mod depth;
pub mod depth_stream;
pub mod enumeration;
pub mod format;
pub mod linalg;
pub mod mirror;
pub mod processor;
pub mod property;
pub mod protocol;
pub mod shift_to_depth;
pub mod uncomp;
pub mod unpack;
#[cfg(feature = "usb")]
pub mod util;
pub mod whole_packet;
pub mod yuv;

pub use format::PixelFormat;
pub use processor::Frame;

/// Possible errors resulting from `ps1080-protocol` API calls
#[derive(Debug, Clone)]
pub enum Error {
    /// An rusb error happened. See [`rusb::Error`] for specifics
    #[cfg(feature = "usb")]
    UsbError(rusb::Error),
    /// No supported device was found.
    NotFound,
    /// No data arrived in time. Reading again is fine.
    PacketTimeout,
    /// The device went away. The stream ended.
    Disconnected,
    /// Input, or an internal fixed-size scratch area, is too small for the operation.
    BufferTooSmall {
        /// Bytes the operation needs
        needed: usize,
        /// Bytes that were available
        available: usize,
    },
    /// The destination buffer cannot hold the output.
    OutputBufferOverflow {
        /// Bytes the operation needs
        needed: usize,
        /// Bytes that were available
        available: usize,
    },
    /// Compressed input was empty.
    CompressedBufferTooSmall,
    /// The configured max shift does not fit the allocated shift-to-depth table.
    InvalidMaxShift,
    /// The configured max depth does not fit the allocated depth-to-shift table.
    InvalidMaxDepth,
    /// The operation does not support this pixel format.
    UnsupportedFormat(PixelFormat),
    /// No property is registered under this ID.
    PropertyNotFound(u32),
    /// The property cannot be set.
    PropertyReadOnly(u32),
    /// The value's type does not match the property's type.
    PropertyTypeMismatch(u32),
    /// The property's validator refused the new value.
    PropertyRejected(&'static str),
    /// Other fatal error, usually a problem with the library itself, or
    /// a device support issue. File a bug if you encounter this.
    Other(&'static str),
}

/// Result type used by the whole crate
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "usb")]
            Error::UsbError(e) => write!(f, "USB error: {e}"),
            Error::NotFound => write!(f, "no supported device found"),
            Error::PacketTimeout => write!(f, "timed out waiting for data"),
            Error::Disconnected => write!(f, "device disconnected"),
            Error::BufferTooSmall { needed, available } => {
                write!(f, "buffer too small: need {needed} bytes, have {available}")
            }
            Error::OutputBufferOverflow { needed, available } => write!(
                f,
                "output buffer overflow: need {needed} bytes, have {available}"
            ),
            Error::CompressedBufferTooSmall => write!(f, "compressed buffer is empty"),
            Error::InvalidMaxShift => write!(f, "max shift exceeds the allocated table"),
            Error::InvalidMaxDepth => write!(f, "max depth exceeds the allocated table"),
            Error::UnsupportedFormat(format) => write!(f, "unsupported pixel format {format:?}"),
            Error::PropertyNotFound(id) => write!(f, "property 0x{id:08x} not found"),
            Error::PropertyReadOnly(id) => write!(f, "property 0x{id:08x} is read only"),
            Error::PropertyTypeMismatch(id) => {
                write!(f, "value type does not match property 0x{id:08x}")
            }
            Error::PropertyRejected(reason) => write!(f, "property value rejected: {reason}"),
            Error::Other(reason) => write!(f, "{reason}"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(feature = "usb")]
impl From<rusb::Error> for Error {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::Timeout => Error::PacketTimeout,
            rusb::Error::NoDevice => Error::Disconnected,
            e => Error::UsbError(e),
        }
    }
}

impl From<&'static str> for Error {
    fn from(e: &'static str) -> Self {
        Error::Other(e)
    }
}
