// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Tracks the connected PS1080 devices. See [`DeviceRegistry`]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, info};

use crate::Result;

/// PrimeSense USB vendor ID
pub const VID: u16 = 0x1D27;
/// USB product IDs of the supported devices
pub const SUPPORTED_PIDS: [u16; 4] = [0x0500, 0x0600, 0x0601, 0x0609];

/// `true` if the USB IDs belong to a supported device
pub fn is_supported(vid: u16, pid: u16) -> bool {
    vid == VID && SUPPORTED_PIDS.contains(&pid)
}

/// Description of a connected device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Unique address of the device, `vvvv/pppp@bus/address`
    pub uri: String,
    /// Always "PrimeSense"
    pub vendor: String,
    /// Always "PS1080"
    pub name: String,
    /// USB vendor ID
    pub usb_vendor_id: u16,
    /// USB product ID
    pub usb_product_id: u16,
}

impl DeviceInfo {
    /// Info of the device at `uri`
    pub fn new(uri: impl Into<String>, usb_vendor_id: u16, usb_product_id: u16) -> Self {
        Self {
            uri: uri.into(),
            vendor: "PrimeSense".into(),
            name: "PS1080".into(),
            usb_vendor_id,
            usb_product_id,
        }
    }
}

/// URI of the device with the given USB IDs at `bus`/`address`
pub fn device_uri(vid: u16, pid: u16, bus: u8, address: u8) -> String {
    format!("{vid:04x}/{pid:04x}@{bus}/{address}")
}

/// Split a URI made by [`device_uri`] into (vid, pid, bus, address)
pub fn parse_uri(uri: &str) -> Option<(u16, u16, u8, u8)> {
    let (ids, location) = uri.split_once('@')?;
    let (vid, pid) = ids.split_once('/')?;
    let (bus, address) = location.split_once('/')?;
    Some((
        u16::from_str_radix(vid, 16).ok()?,
        u16::from_str_radix(pid, 16).ok()?,
        bus.parse().ok()?,
        address.parse().ok()?,
    ))
}

/// Kind of a connectivity change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// A device appeared
    Connected,
    /// A device went away
    Disconnected,
}

/// Gets notified of devices coming and going
pub trait DeviceListener: Send + Sync {
    /// `info` connected or disconnected
    fn on_event(&self, event: ConnectivityEvent, info: &DeviceInfo);
}

impl<F> DeviceListener for F
where
    F: Fn(ConnectivityEvent, &DeviceInfo) + Send + Sync,
{
    fn on_event(&self, event: ConnectivityEvent, info: &DeviceInfo) {
        self(event, info)
    }
}

#[derive(Default)]
struct Devices {
    devices: HashMap<String, DeviceInfo>,
    listeners: Vec<Arc<dyn DeviceListener>>,
}

#[derive(Clone, Default)]
struct SharedDevices(Arc<Mutex<Devices>>);

impl SharedDevices {
    fn lock(&self) -> MutexGuard<'_, Devices> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_connect(&self, uri: &str, vid: u16, pid: u16) -> bool {
        let (info, listeners) = {
            let mut devices = self.lock();
            if devices.devices.contains_key(uri) {
                return false;
            }
            let info = DeviceInfo::new(uri, vid, pid);
            devices.devices.insert(uri.to_string(), info.clone());
            (info, devices.listeners.clone())
        };
        info!(uri, "device connected");
        for listener in listeners {
            listener.on_event(ConnectivityEvent::Connected, &info);
        }
        true
    }

    /// Listeners still find the device in the registry while they are notified
    fn on_disconnect(&self, uri: &str) -> bool {
        let (info, listeners) = {
            let devices = self.lock();
            let Some(info) = devices.devices.get(uri) else {
                return false;
            };
            (info.clone(), devices.listeners.clone())
        };
        info!(uri, "device disconnected");
        for listener in listeners {
            listener.on_event(ConnectivityEvent::Disconnected, &info);
        }
        self.lock().devices.remove(uri).is_some()
    }
}

/// The set of connected devices, keyed by URI, with connect and disconnect notifications.
///
/// Without the `usb` feature (or before [`DeviceRegistry::init`]) it is fed manually through
/// [`DeviceRegistry::on_connect`] and [`DeviceRegistry::on_disconnect`].
#[derive(Default)]
pub struct DeviceRegistry {
    devices: SharedDevices,
    #[cfg(feature = "usb")]
    hotplug: Mutex<Option<usb::HotplugWatcher>>,
}

impl DeviceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `listener` on every future connect and disconnect
    pub fn add_listener(&self, listener: impl DeviceListener + 'static) {
        self.devices.lock().listeners.push(Arc::new(listener));
    }

    /// Register a device. Returns `false` (and notifies nobody) if it is already known.
    pub fn on_connect(&self, uri: &str, vid: u16, pid: u16) -> bool {
        self.devices.on_connect(uri, vid, pid)
    }

    /// Forget a device. Returns `false` if it was not known.
    pub fn on_disconnect(&self, uri: &str) -> bool {
        self.devices.on_disconnect(uri)
    }

    /// Info of the device at `uri`
    pub fn device_info(&self, uri: &str) -> Option<DeviceInfo> {
        self.devices.lock().devices.get(uri).cloned()
    }

    /// Every connected device, ordered by URI
    pub fn devices(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<_> = self.devices.lock().devices.values().cloned().collect();
        devices.sort_by(|a, b| a.uri.cmp(&b.uri));
        devices
    }

    /// Enumerate the devices already present, and follow hotplug events if libusb supports
    /// them. Calling it again is a no-op.
    #[cfg(feature = "usb")]
    pub fn init(&self) -> Result<()> {
        let mut hotplug = self.hotplug.lock().unwrap_or_else(PoisonError::into_inner);
        if hotplug.is_none() {
            *hotplug = Some(usb::HotplugWatcher::start(self.devices.clone())?);
        }
        Ok(())
    }

    /// Manual mode only: nothing to initialize
    #[cfg(not(feature = "usb"))]
    pub fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Stop following hotplug events, and forget every device and listener
    pub fn shutdown(&self) {
        self.stop_hotplug();
        let mut devices = self.devices.lock();
        devices.devices.clear();
        devices.listeners.clear();
        debug!("device registry shut down");
    }

    #[cfg(feature = "usb")]
    fn stop_hotplug(&self) {
        let watcher = self
            .hotplug
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            watcher.stop();
        }
    }

    #[cfg(not(feature = "usb"))]
    fn stop_hotplug(&self) {}
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(feature = "usb")]
mod usb {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::JoinHandle,
        time::Duration,
    };

    use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
    use tracing::{debug, warn};

    use super::{device_uri, is_supported, SharedDevices, VID};
    use crate::Result;

    const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

    fn ids_and_uri(device: &Device<Context>) -> Option<(u16, u16, String)> {
        let desc = device.device_descriptor().ok()?;
        let (vid, pid) = (desc.vendor_id(), desc.product_id());
        Some((
            vid,
            pid,
            device_uri(vid, pid, device.bus_number(), device.address()),
        ))
    }

    struct Handler {
        devices: SharedDevices,
    }

    impl Hotplug<Context> for Handler {
        fn device_arrived(&mut self, device: Device<Context>) {
            if let Some((vid, pid, uri)) = ids_and_uri(&device) {
                if is_supported(vid, pid) {
                    self.devices.on_connect(&uri, vid, pid);
                }
            }
        }

        fn device_left(&mut self, device: Device<Context>) {
            match ids_and_uri(&device) {
                Some((_, _, uri)) => {
                    self.devices.on_disconnect(&uri);
                }
                None => warn!("could not identify departed device"),
            }
        }
    }

    pub(super) struct HotplugWatcher {
        running: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
        registration: Option<Registration<Context>>,
    }

    impl HotplugWatcher {
        pub(super) fn start(devices: SharedDevices) -> Result<Self> {
            let context = Context::new()?;
            for device in context.devices()?.iter() {
                if let Some((vid, pid, uri)) = ids_and_uri(&device) {
                    if is_supported(vid, pid) {
                        devices.on_connect(&uri, vid, pid);
                    }
                }
            }

            if !rusb::has_hotplug() {
                debug!("libusb has no hotplug support, devices are enumerated once");
                return Ok(Self {
                    running: Arc::new(AtomicBool::new(false)),
                    thread: None,
                    registration: None,
                });
            }

            let registration = HotplugBuilder::new()
                .vendor_id(VID)
                .enumerate(false)
                .register(&context, Box::new(Handler { devices }))?;
            let running = Arc::new(AtomicBool::new(true));
            let thread_running = running.clone();
            let thread = std::thread::spawn(move || {
                while thread_running.load(Ordering::Relaxed) {
                    if let Err(e) = context.handle_events(Some(EVENT_POLL_INTERVAL)) {
                        warn!(error = %e, "libusb event handling failed");
                        break;
                    }
                }
            });
            Ok(Self {
                running,
                thread: Some(thread),
                registration: Some(registration),
            })
        }

        pub(super) fn stop(mut self) {
            self.running.store(false, Ordering::Relaxed);
            if let Some(thread) = self.thread.take() {
                if thread.join().is_err() {
                    warn!("hotplug thread panicked");
                }
            }
            drop(self.registration.take());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn supported_products() {
        assert!(is_supported(0x1D27, 0x0600));
        assert!(is_supported(0x1D27, 0x0609));
        assert!(!is_supported(0x1D27, 0x0700));
        assert!(!is_supported(0x045e, 0x0600));
    }

    #[test]
    fn uri_round_trip() {
        let uri = device_uri(0x1D27, 0x0601, 3, 17);
        assert_eq!(uri, "1d27/0601@3/17");
        assert_eq!(parse_uri(&uri), Some((0x1D27, 0x0601, 3, 17)));
        assert_eq!(parse_uri("1d27/0601"), None);
        assert_eq!(parse_uri("zz27/0601@3/17"), None);
    }

    #[test]
    fn connect_and_disconnect_events() {
        let registry = DeviceRegistry::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = events.clone();
        registry.add_listener(move |event: ConnectivityEvent, info: &DeviceInfo| {
            log.lock().unwrap().push((event, info.uri.clone()));
        });

        assert!(registry.on_connect("1d27/0600@1/2", 0x1D27, 0x0600));
        // Connecting twice is a no-op
        assert!(!registry.on_connect("1d27/0600@1/2", 0x1D27, 0x0600));
        assert!(registry.on_connect("1d27/0609@1/3", 0x1D27, 0x0609));

        let info = registry.device_info("1d27/0600@1/2").unwrap();
        assert_eq!(info.vendor, "PrimeSense");
        assert_eq!(info.name, "PS1080");
        assert_eq!(info.usb_product_id, 0x0600);
        assert_eq!(registry.devices().len(), 2);

        assert!(registry.on_disconnect("1d27/0600@1/2"));
        assert!(!registry.on_disconnect("1d27/0600@1/2"));
        assert!(registry.device_info("1d27/0600@1/2").is_none());

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                (ConnectivityEvent::Connected, "1d27/0600@1/2".to_string()),
                (ConnectivityEvent::Connected, "1d27/0609@1/3".to_string()),
                (ConnectivityEvent::Disconnected, "1d27/0600@1/2".to_string()),
            ]
        );
    }

    #[test]
    fn listeners_see_the_disconnecting_device() {
        let registry = DeviceRegistry::new();
        let devices = Arc::downgrade(&registry.devices.0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        registry.add_listener(move |event: ConnectivityEvent, info: &DeviceInfo| {
            let Some(devices) = devices.upgrade() else {
                return;
            };
            let found = SharedDevices(devices).lock().devices.get(&info.uri).cloned();
            log.lock().unwrap().push((event, found.map(|found| found.usb_product_id)));
        });

        registry.on_connect("1d27/0601@2/5", 0x1D27, 0x0601);
        assert!(registry.on_disconnect("1d27/0601@2/5"));
        assert!(registry.device_info("1d27/0601@2/5").is_none());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (ConnectivityEvent::Connected, Some(0x0601)),
                (ConnectivityEvent::Disconnected, Some(0x0601)),
            ]
        );
    }

    #[test]
    fn shutdown_forgets_everything() {
        let registry = DeviceRegistry::new();
        let events = Arc::new(Mutex::new(0));
        let count = events.clone();
        registry.add_listener(move |_: ConnectivityEvent, _: &DeviceInfo| {
            *count.lock().unwrap() += 1;
        });
        registry.on_connect("1d27/0600@1/2", 0x1D27, 0x0600);
        registry.shutdown();
        assert!(registry.devices().is_empty());
        registry.on_connect("1d27/0600@1/2", 0x1D27, 0x0600);
        assert_eq!(*events.lock().unwrap(), 1);
    }
}
