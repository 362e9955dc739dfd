use failure::*;
use log::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use structopt::StructOpt;

use eyestream::net::{LoopbackTransport, Sender};
use eyestream::tracker::{SyntheticConfig, SyntheticTracker};
use eyestream::{Session, StreamKind, StreamRegistry};

const DRAIN_INTERVAL: Duration = Duration::from_millis(500);

#[derive(StructOpt)]
#[structopt(name = "eyestream", about = "eye tracker stream buffering and relay")]
enum Cli {
    /// Record a synthetic tracker into session buffers and drain them
    Record {
        #[structopt(short, long = "stream", default_value = "gaze")]
        streams: Vec<StreamKind>,
        /// Merge eye openness into gaze samples
        #[structopt(long)]
        eye_openness: bool,
        #[structopt(short, long, default_value = "5")]
        seconds: u64,
        #[structopt(long, default_value = "SYNTH-1")]
        serial: String,
    },
    /// Publish a synthetic tracker over the loopback transport and listen to it
    Relay {
        #[structopt(short, long = "stream", default_value = "gaze")]
        streams: Vec<StreamKind>,
        #[structopt(long)]
        eye_openness: bool,
        #[structopt(short, long, default_value = "5")]
        seconds: u64,
        #[structopt(long, default_value = "SYNTH-1")]
        serial: String,
        /// Simulated receiver clock offset in seconds
        #[structopt(long, default_value = "0.0")]
        clock_offset: f64,
    },
}

fn main() -> Result<(), Error> {
    pretty_env_logger::init();
    log::set_max_level(LevelFilter::Trace);

    match Cli::from_args() {
        Cli::Record {
            streams,
            eye_openness,
            seconds,
            serial,
        } => record(&streams, eye_openness, Duration::from_secs(seconds), &serial),
        Cli::Relay {
            streams,
            eye_openness,
            seconds,
            serial,
            clock_offset,
        } => relay(
            &streams,
            eye_openness,
            Duration::from_secs(seconds),
            &serial,
            clock_offset,
        ),
    }
}

fn record(streams: &[StreamKind], eye_openness: bool, run_for: Duration, serial: &str) -> Result<(), Error> {
    let tracker = Arc::new(SyntheticTracker::new(SyntheticConfig::spectrum(serial)));
    let session = Session::new(tracker);
    if eye_openness {
        session.set_include_eye_openness_in_gaze(true)?;
    }
    for kind in streams {
        session.start(*kind, None, None)?;
    }

    let deadline = Instant::now() + run_for;
    while Instant::now() < deadline {
        thread::sleep(DRAIN_INTERVAL);
        for kind in streams {
            let samples = session.consume_n(*kind, None, None);
            info!("{}: drained {} samples", kind, samples.len());
        }
    }

    for kind in streams {
        session.stop(*kind, Some(true))?;
    }
    trace!("recording ended");
    Ok(())
}

fn relay(
    streams: &[StreamKind],
    eye_openness: bool,
    run_for: Duration,
    serial: &str,
    clock_offset: f64,
) -> Result<(), Error> {
    let tracker = Arc::new(SyntheticTracker::new(SyntheticConfig::spectrum(serial)));
    let transport = Arc::new(LoopbackTransport::with_clock_offset(clock_offset));
    let sender = Sender::new(tracker, transport.clone());
    let registry = StreamRegistry::new(transport);
    if eye_openness {
        sender.set_include_eye_openness_in_gaze(true)?;
    }

    let mut handles = Vec::new();
    for kind in streams {
        sender.start(*kind)?;
        let info = sender
            .stream_info(*kind)
            .ok_or_else(|| format_err!("{} stream is not published", kind))?;
        let handle = registry.create_listener(&info.source_id, None, Some(true))?;
        info!("listening to {} as {}", info.source_id, handle);
        handles.push(handle);
    }

    let deadline = Instant::now() + run_for;
    while Instant::now() < deadline {
        thread::sleep(DRAIN_INTERVAL);
        for handle in &handles {
            let samples = registry.consume_n(*handle, None, None)?;
            info!(
                "{} {}: received {} samples, time correction {:.6}s",
                handle,
                registry.kind(*handle)?,
                samples.len(),
                registry.time_correction(*handle)?
            );
        }
    }

    registry.clear_listeners();
    for kind in streams {
        sender.stop(*kind)?;
    }
    trace!("relay ended");
    Ok(())
}
