// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! USB access: opening a sensor and reading its data endpoints

use std::sync::Arc;

use rusb::{Device, DeviceHandle, DeviceList, GlobalContext};
use tracing::{debug, trace};

use crate::{
    enumeration::{device_uri, is_supported, parse_uri},
    processor::Frame,
    protocol::{
        PacketParser, ReaderConfig, StreamDispatcher, DEPTH_ENDPOINT, IMAGE_ENDPOINT,
        MISC_ENDPOINT,
    },
    Error, Result,
};

const DATA_ENDPOINTS: [u8; 3] = [DEPTH_ENDPOINT, IMAGE_ENDPOINT, MISC_ENDPOINT];

/// Size of one bulk read. 120 max size USB 2.0 bulk packets.
pub const READ_BUFFER_SIZE: usize = 512 * 120;

/// Find the device at `uri`, or the first supported device if `uri` is `None`
fn get_device(uri: Option<&str>) -> Result<Device<GlobalContext>> {
    let wanted = match uri {
        Some(uri) => Some(parse_uri(uri).ok_or(Error::Other("Malformed device URI"))?),
        None => None,
    };
    for device in DeviceList::new()?.iter() {
        if let Ok(desc) = device.device_descriptor() {
            let (vid, pid) = (desc.vendor_id(), desc.product_id());
            let matches = match wanted {
                Some(wanted) => wanted == (vid, pid, device.bus_number(), device.address()),
                None => is_supported(vid, pid),
            };
            if matches {
                return Ok(device);
            }
        }
    }
    Err(Error::NotFound)
}

/// Interfaces owning the depth, image and misc endpoints, each listed once
fn data_interfaces(device: &Device<GlobalContext>) -> Result<Vec<u8>> {
    let config_desc = device.config_descriptor(0)?;
    let mut interfaces = Vec::new();
    for interface in config_desc.interfaces() {
        let owns_data = interface.descriptors().any(|desc| {
            desc.endpoint_descriptors()
                .any(|endpoint| DATA_ENDPOINTS.contains(&endpoint.address()))
        });
        if owns_data && !interfaces.contains(&interface.number()) {
            interfaces.push(interface.number());
        }
    }
    if interfaces.is_empty() {
        return Err(Error::Other("No PS1080 data endpoints, not a sensor (probably)"));
    }
    Ok(interfaces)
}

/// Open the sensor at `uri` (or the first one found) and claim its data interfaces
pub fn open_device(uri: Option<&str>) -> Result<DeviceHandle<GlobalContext>> {
    let device = get_device(uri)?;
    let interfaces = data_interfaces(&device)?;
    let mut device_handle = device.open()?;
    device_handle.set_auto_detach_kernel_driver(true)?;
    for interface in &interfaces {
        device_handle.claim_interface(*interface)?;
    }
    if let Ok(desc) = device.device_descriptor() {
        debug!(
            uri = %device_uri(
                desc.vendor_id(),
                desc.product_id(),
                device.bus_number(),
                device.address()
            ),
            ?interfaces,
            "device opened"
        );
    }
    Ok(device_handle)
}

/// Reads one bulk endpoint and feeds the data through a [`PacketParser`] into a
/// [`StreamDispatcher`]. One reader per endpoint, each on its own thread if needed.
pub struct SensorReader {
    handle: Arc<DeviceHandle<GlobalContext>>,
    config: ReaderConfig,
    parser: PacketParser,
    buffer: Vec<u8>,
}

impl SensorReader {
    /// Reader of the endpoint in `config`
    pub fn new(handle: Arc<DeviceHandle<GlobalContext>>, config: ReaderConfig) -> Self {
        Self {
            handle,
            parser: PacketParser::new(&config),
            config,
            buffer: vec![0; READ_BUFFER_SIZE],
        }
    }

    /// Do one bulk read and dispatch it. Returns the frames completed by the data.
    ///
    /// [`Error::PacketTimeout`] means no data arrived in time and reading again is fine.
    /// [`Error::Disconnected`] means the device is gone.
    pub fn read(&mut self, dispatcher: &StreamDispatcher) -> Result<Vec<Frame>> {
        let size = self.handle.read_bulk(
            self.config.endpoint,
            &mut self.buffer,
            self.config.read_timeout,
        )?;
        trace!(endpoint = self.config.endpoint, size, "bulk read");
        Ok(dispatcher.feed(&mut self.parser, &self.buffer[..size]))
    }
}
