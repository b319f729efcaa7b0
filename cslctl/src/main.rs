// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! cslctl
//!
//! Drives the lifecycle manager against the simulated camera kernel: lists
//! the enumerated devices, or opens sessions, streams a sensor pipeline in
//! each and reports what the handlers received.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use clap::{Arg, ArgAction, Command};
use csl::{Csl, CslConfig, CslMessage, DeviceDescriptor, MessageHandler, SessionInfo};
use kmd::{
    DeactivateMode, DeviceHandle, LinkHandle, PacketHandle, PlatformInfo, SessionHandle,
    SimKernel, SyncMode,
};
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;
use signal_hook::consts::{SIGINT, SIGTERM};

const SENSOR_INDEX: i32 = 2;
const CSIPHY_INDEX: i32 = 1;
const IFE_INDEX: i32 = 0;

#[derive(Serialize)]
struct Inventory {
    platform: PlatformInfo,
    devices: Vec<DeviceDescriptor>,
}

#[derive(Serialize)]
struct SessionReport {
    frames_delivered: u64,
    session: SessionInfo,
}

struct Pipeline {
    session: SessionHandle,
    devices: Vec<DeviceHandle>,
    ife: DeviceHandle,
    link: LinkHandle,
    frames: Arc<AtomicU64>,
}

fn build_pipeline(csl: &Csl) -> anyhow::Result<Pipeline> {
    let session = csl.open().context("opening session")?;
    let sensor = csl.acquire_device(session, SENSOR_INDEX, &[], &[], "sensor")?;
    let csiphy = csl.acquire_device(session, CSIPHY_INDEX, &[], &[], "csiphy")?;
    let ife = csl.acquire_device(session, IFE_INDEX, &[], &[], "ife")?;
    let link = csl.link(session, &[sensor, csiphy, ife])?;

    let frames = Arc::new(AtomicU64::new(0));
    let counter = frames.clone();
    let handler: MessageHandler = Arc::new(move |message: &CslMessage| match message {
        CslMessage::Frame(frame) => {
            debug!(
                "session {session} frame {} request {} at {}",
                frame.frame_count, frame.request_id, frame.timestamp
            );
            counter.fetch_add(1, Ordering::Relaxed);
        }
        CslMessage::Error(error) => warn!("session {session} pipeline error {error:?}"),
    });
    csl.register_message_handler(session, link, handler)?;
    csl.stream_on(session, link, None)?;

    Ok(Pipeline {
        session,
        devices: vec![sensor, csiphy, ife],
        ife,
        link,
        frames,
    })
}

fn tear_down(csl: &Csl, pipeline: &Pipeline) -> anyhow::Result<()> {
    csl.stream_off(
        pipeline.session,
        pipeline.link,
        None,
        DeactivateMode::empty(),
    )?;
    csl.unlink(pipeline.session, pipeline.link)?;
    for device in &pipeline.devices {
        csl.release_device(pipeline.session, *device)?;
    }
    csl.close(pipeline.session)?;
    Ok(())
}

fn list(csl: &Csl) -> anyhow::Result<()> {
    let mut devices = Vec::new();
    for index in 0..csl.device_count() {
        devices.push(csl.enumerate_devices(i32::try_from(index)?)?);
    }
    let inventory = Inventory {
        platform: csl.query_platform()?,
        devices,
    };
    println!("{}", serde_json::to_string_pretty(&inventory)?);
    Ok(())
}

fn run(
    csl: &Csl,
    sim: &SimKernel,
    sessions: usize,
    frames: u64,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    let mut pipelines = Vec::with_capacity(sessions);
    for _ in 0..sessions {
        pipelines.push(build_pipeline(csl)?);
    }
    info!("{} pipeline(s) streaming", pipelines.len());

    let started = Instant::now();
    let mut issued = 0;
    for request_id in 1..=frames {
        if stop.load(Ordering::SeqCst) {
            warn!("interrupted after {issued} request(s)");
            break;
        }
        for pipeline in &pipelines {
            csl.open_request(
                pipeline.session,
                pipeline.link,
                request_id,
                false,
                SyncMode::NoSync,
                0,
            )?;
            csl.submit(pipeline.session, pipeline.ife, PacketHandle(1), 0)?;
            let timestamp = u64::try_from(started.elapsed().as_nanos())?;
            sim.emit_frame(
                pipeline.session,
                pipeline.link,
                request_id,
                request_id,
                timestamp,
            )?;
        }
        issued = request_id;
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline
        && pipelines
            .iter()
            .any(|pipeline| pipeline.frames.load(Ordering::Relaxed) < issued)
    {
        thread::sleep(Duration::from_millis(5));
    }

    let mut reports = Vec::with_capacity(pipelines.len());
    for pipeline in &pipelines {
        reports.push(SessionReport {
            frames_delivered: pipeline.frames.load(Ordering::Relaxed),
            session: csl.session_info(pipeline.session)?,
        });
    }
    println!("{}", serde_json::to_string_pretty(&reports)?);

    for pipeline in &pipelines {
        tear_down(csl, pipeline)
            .with_context(|| format!("tearing down session {}", pipeline.session))?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let matches = Command::new("cslctl")
        .version(env!("CARGO_PKG_VERSION"))
        .author("CSL Hardware Authors")
        .about("Drive the CSL camera hardware layer against a simulated kernel")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new("list")
                .short('l')
                .long("list")
                .action(ArgAction::SetTrue)
                .help("Only print the platform and device inventory"),
        )
        .arg(
            Arg::new("sessions")
                .short('s')
                .long("sessions")
                .value_name("N")
                .default_value("1")
                .value_parser(clap::value_parser!(usize))
                .help("Number of concurrent sessions"),
        )
        .arg(
            Arg::new("frames")
                .short('f')
                .long("frames")
                .value_name("N")
                .default_value("30")
                .value_parser(clap::value_parser!(u64))
                .help("Requests to issue per session"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Increase logging verbosity"),
        )
        .get_matches();

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    match matches.get_count("verbose") {
        0 => {}
        1 => {
            logger.filter_level(LevelFilter::Debug);
        }
        _ => {
            logger.filter_level(LevelFilter::Trace);
        }
    }
    logger.init();

    let config = match matches.get_one::<String>("config") {
        Some(path) => CslConfig::load(Path::new(path))?,
        None => CslConfig::default(),
    };
    let sessions = *matches
        .get_one::<usize>("sessions")
        .ok_or_else(|| anyhow!("missing session count"))?;
    let frames = *matches
        .get_one::<u64>("frames")
        .ok_or_else(|| anyhow!("missing frame count"))?;

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, stop.clone())
            .with_context(|| format!("registering handler for signal {signal}"))?;
    }

    let sim = Arc::new(SimKernel::with_camera_topology());
    let csl = Csl::new(sim.clone(), config)?;
    csl.initialize().context("initializing")?;

    let mut result = list(&csl);
    if result.is_ok() && !matches.get_flag("list") {
        result = run(&csl, &sim, sessions, frames, &stop);
    }
    csl.uninitialize()?;
    result
}
