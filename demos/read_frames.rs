// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Decode frames from an already streaming sensor and print their statistics.
//! Starting the streams is up to the control interface, this only reads.

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, ValueEnum};
use ps1080_protocol::{
    color::{image_processor, ImageEncoding, ImageProcessorConfig},
    depth::{DepthEncoding, DepthProcessorConfig},
    depth_stream::{register_depth_properties, DepthStreamHelper},
    property::PropertyStore,
    protocol::{ReaderConfig, StreamDispatcher, DEPTH_ENDPOINT, IMAGE_ENDPOINT},
    shift_to_depth::ShiftToDepthConfig,
    util::{open_device, SensorReader},
    Error, PixelFormat,
};

#[derive(Clone, Copy, ValueEnum)]
enum Stream {
    Depth,
    Image,
}

#[derive(Parser)]
struct Args {
    /// Which stream to read
    #[arg(value_enum, default_value = "depth")]
    stream: Stream,

    /// Device URI, as printed by list_devices
    #[arg(short, long)]
    uri: Option<String>,

    /// Number of frames to read
    #[arg(short, long, default_value = "30")]
    frames: usize,

    /// Write raw frames and undecodable images here
    #[arg(long)]
    dump_dir: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let handle = Arc::new(open_device(args.uri.as_deref()).unwrap());
    let dispatcher = StreamDispatcher::new();
    let mut properties = PropertyStore::new();

    let endpoint = match args.stream {
        Stream::Depth => {
            register_depth_properties(
                &mut properties,
                &ShiftToDepthConfig::default(),
                PixelFormat::Depth1Mm,
            )
            .unwrap();
            let helper = DepthStreamHelper::init(&mut properties).unwrap();
            let mut processor = helper
                .depth_processor(
                    &properties,
                    DepthProcessorConfig {
                        encoding: DepthEncoding::Packed11,
                        ..Default::default()
                    },
                )
                .unwrap();
            if let Some(dir) = &args.dump_dir {
                processor = processor.with_dump_dir(dir);
            }
            dispatcher.replace_depth(Some(Box::new(processor)));
            DEPTH_ENDPOINT
        }
        Stream::Image => {
            let mut processor = image_processor(ImageProcessorConfig {
                encoding: ImageEncoding::Yuv422,
                ..Default::default()
            })
            .unwrap();
            if let Some(dir) = &args.dump_dir {
                processor = processor.with_dump_dir(dir);
            }
            dispatcher.replace_image(Some(Box::new(processor)));
            IMAGE_ENDPOINT
        }
    };

    let mut reader = SensorReader::new(
        handle,
        ReaderConfig {
            endpoint,
            read_timeout: Duration::from_millis(500),
            ..Default::default()
        },
    );
    let mut received = 0;
    while received < args.frames {
        let frames = match reader.read(&dispatcher) {
            Ok(frames) => frames,
            Err(Error::PacketTimeout) => {
                println!("No data, is the stream started?");
                continue;
            }
            Err(e) => panic!("Reading failed: {e}"),
        };
        for frame in frames {
            let nonzero = frame.data.iter().filter(|&&b| b != 0).count();
            println!(
                "Frame {} at {}: {}x{} {:?}, {} bytes ({} nonzero){}",
                frame.frame_id,
                frame.timestamp,
                frame.width,
                frame.height,
                frame.format,
                frame.data.len(),
                nonzero,
                if frame.corrupted { " CORRUPTED" } else { "" }
            );
            received += 1;
        }
    }
}
