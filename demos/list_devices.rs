// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

use std::time::Duration;

use clap::Parser;
use ps1080_protocol::enumeration::{ConnectivityEvent, DeviceInfo, DeviceRegistry};

/// List connected PS1080 sensors, optionally following hotplug events
#[derive(Parser)]
struct Args {
    /// Keep watching for this many seconds
    #[arg(short, long, default_value = "0")]
    watch: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let registry = DeviceRegistry::new();
    registry.init().unwrap();
    for device in registry.devices() {
        println!(
            "{} {} {} ({:04x}:{:04x})",
            device.uri, device.vendor, device.name, device.usb_vendor_id, device.usb_product_id
        );
    }

    if args.watch > 0 {
        registry.add_listener(|event: ConnectivityEvent, info: &DeviceInfo| {
            println!("{event:?}: {}", info.uri);
        });
        std::thread::sleep(Duration::from_secs(args.watch));
    }
    registry.shutdown();
}
