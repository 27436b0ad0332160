//! Prefetch binary: pulls buckets from a data store and reports throughput.
//!
//! Usage: cargo run --release --bin prefetch -- [OPTIONS]
//!
//! Options:
//!   --config <PATH>      Stream config JSON (required)
//!   --layer <NAME>       Layer to fetch (default: first configured layer)
//!   --bucket <X,Y,Z,ZOOM>  Bucket address, may be repeated
//!   --cube <N>           Also fetch the N x N x N block of buckets at zoom 0
//!   --priority <P>       Pull priority for all requests (default: 0)
//!   --debug-port <PORT>  Serve the debug protocol while fetching

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use bucketstream::core::{logging, Error, Result, StreamConfig};
use bucketstream::debug::StreamingInspector;
use bucketstream::store::{ChannelSaveQueue, ReqwestTransport, TokenProvider, Transport};
use bucketstream::streaming::{BucketAddress, ConnectionInfo, QueueEntry, MAX_ZOOM_STEP};
use bucketstream::DataLayer;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Prefetch failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config_path = parse_str_arg(&args, "--config")
        .map(PathBuf::from)
        .ok_or_else(|| Error::Config("missing --config <PATH>".into()))?;
    let priority = parse_i32_arg(&args, "--priority").unwrap_or(0);

    let config = StreamConfig::load_sync(&config_path)?;
    config.validate()?;

    let layer_config = match parse_str_arg(&args, "--layer") {
        Some(name) => config.layer(&name).cloned(),
        None => config.layers.first().cloned(),
    }
    .ok_or_else(|| Error::Config("no such layer configured".into()))?;

    let mut addresses = parse_bucket_args(&args)?;
    if let Some(n) = parse_i32_arg(&args, "--cube") {
        for x in 0..n {
            for y in 0..n {
                for z in 0..n {
                    addresses.push(BucketAddress::new(x, y, z, 0));
                }
            }
        }
    }
    if addresses.is_empty() {
        return Err(Error::Config("nothing to fetch, pass --bucket or --cube".into()));
    }

    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(config.request_timeout())?);
    let tokens = Arc::new(TokenProvider::new(transport.clone(), config.token_url.clone()));
    // Prefetching never edits, so saves only go to a local channel
    let (save_queue, _saves) = ChannelSaveQueue::new();
    let connection_info = Arc::new(ConnectionInfo::new());

    let layer = DataLayer::connect(
        &config,
        layer_config,
        transport,
        tokens,
        Arc::new(save_queue),
        connection_info.clone(),
    );

    let debug_port = match parse_str_arg(&args, "--debug-port") {
        Some(value) => Some(parse_port(&value)?),
        None => None,
    };
    let _server = debug_port.map(|port| {
        let handler = Arc::new(tokio::sync::Mutex::new(StreamingInspector::new(vec![layer.clone()])));
        bucketstream_debug::DebugServer::start(handler, port)
    });

    log::info!("Fetching {} buckets of layer {}", addresses.len(), layer.name());
    let started = Instant::now();
    layer.request_buckets(addresses.iter().map(|&address| QueueEntry::new(address, priority)));
    layer.pull_queue().wait_idle().await;

    let stats = layer.stats();
    let overall = connection_info.stats();
    log::info!(
        "Done in {:.2}s: {} loaded, {} missing, {} failed",
        started.elapsed().as_secs_f64(),
        stats.cube.loaded,
        stats.cube.missing,
        stats.cube.unrequested,
    );
    log::info!(
        "{} requests, {} bytes, round trip {:.1} ms, bandwidth {:.1} bytes/ms",
        overall.requests,
        overall.total_bytes,
        overall.round_trip_ms,
        overall.bandwidth,
    );
    Ok(())
}

fn parse_bucket_args(args: &[String]) -> Result<Vec<BucketAddress>> {
    args.iter()
        .enumerate()
        .filter(|(_, a)| *a == "--bucket")
        .map(|(i, _)| {
            let value = args
                .get(i + 1)
                .ok_or_else(|| Error::Config("--bucket needs a value".into()))?;
            parse_bucket(value)
        })
        .collect()
}

fn parse_bucket(value: &str) -> Result<BucketAddress> {
    let parts: Vec<i32> = value
        .split(',')
        .map(|p| p.trim().parse::<i32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Config(format!("invalid bucket {:?}: {}", value, e)))?;
    match parts.as_slice() {
        &[x, y, z, zoom] if (0..=MAX_ZOOM_STEP as i32).contains(&zoom) => {
            Ok(BucketAddress::new(x, y, z, zoom as u32))
        }
        &[_, _, _, zoom] => Err(Error::Config(format!(
            "zoom step must be between 0 and {}, got {}",
            MAX_ZOOM_STEP, zoom
        ))),
        _ => Err(Error::Config(format!("bucket must be X,Y,Z,ZOOM, got {:?}", value))),
    }
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .map_err(|e| Error::Config(format!("invalid --debug-port {:?}: {}", value, e)))
}

fn parse_i32_arg(args: &[String], flag: &str) -> Option<i32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
