//! Receiving one networked stream into a buffer.
//!
//! An [`Inlet`] owns a transport subscription. While listening, a worker
//! thread pulls frames with a bounded wait, decodes them, stamps them with
//! the sender's clock and the sender's clock corrected into ours, and
//! appends them to the inlet's buffer. Stopping hands the subscription back
//! to the inlet so listening can resume later.

use bytes::BytesMut;
use crossbeam::atomic::AtomicCell;
use crossbeam_channel::{bounded, SendError};
use log::*;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::codec::Decoder;

use super::codec::ChannelCodec;
use super::layout::{seconds_to_micros, ChannelLayout};
use super::{LinkError, Pull, RawSample, StreamInfo, Subscription, Transport, ERR_LOST};
use crate::buffer::{Clock, TimeSeriesBuffer, Timestamped};
use crate::error::{Error, Result};
use crate::stream::StreamKind;

/// A sample as it landed in an inlet buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct Received<S> {
    pub sample: S,
    /// Sender clock, microseconds.
    pub remote_time: i64,
    /// Sender clock plus the time correction at arrival, microseconds.
    pub local_time: i64,
}

impl<S: Timestamped> Timestamped for Received<S> {
    const KIND: StreamKind = S::KIND;
    const TIME_RANGE: bool = S::TIME_RANGE;

    fn timestamp(&self, clock: Clock) -> i64 {
        match clock {
            Clock::Local => self.local_time,
            Clock::Remote => self.remote_time,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InletConfig {
    pub initial_capacity: usize,
    /// Start the worker as soon as the inlet exists.
    pub auto_start: bool,
    /// Longest single wait for a frame. Bounds how long stopping takes.
    pub pull_timeout: Duration,
    /// Wait for each per-sample time correction refresh. Zero only takes
    /// an estimate that is already available.
    pub correction_timeout: Duration,
    /// Wait for the first time correction when the inlet is created.
    pub warmup_timeout: Duration,
    pub open_timeout: Duration,
    /// How long discovery waits for the stream to show up.
    pub resolve_timeout: Duration,
}

impl InletConfig {
    pub fn for_kind(kind: StreamKind) -> InletConfig {
        InletConfig {
            initial_capacity: kind.default_capacity(),
            auto_start: false,
            pull_timeout: Duration::from_millis(100),
            correction_timeout: Duration::from_secs(0),
            warmup_timeout: Duration::from_secs(5),
            open_timeout: Duration::from_secs(5),
            resolve_timeout: Duration::from_secs(1),
        }
    }
}

enum Link {
    Idle(Box<dyn Subscription>),
    Listening(JoinHandle<Option<Box<dyn Subscription>>>),
    /// The worker thread died and took the subscription with it.
    Broken,
}

pub struct Inlet<S: ChannelLayout> {
    info: StreamInfo,
    config: InletConfig,
    buffer: Arc<TimeSeriesBuffer<Received<S>>>,
    correction: Arc<AtomicCell<f64>>,
    stop: Arc<AtomicBool>,
    link: Mutex<Link>,
}

impl<S: ChannelLayout> Inlet<S> {
    /// Subscribe to `info` and take a first time correction estimate.
    pub fn new(transport: &dyn Transport, info: StreamInfo, config: InletConfig) -> Result<Inlet<S>> {
        if info.format != S::FORMAT || info.channel_count != S::COUNT {
            return Err(Error::Decode(format!(
                "{} advertises {} {} channels, a {} inlet needs {} {}",
                info.source_id,
                info.channel_count,
                info.format,
                S::KIND,
                S::COUNT,
                S::FORMAT
            )));
        }

        let mut subscription = transport.subscribe(&info)?;
        let correction = match subscription.time_correction(config.warmup_timeout) {
            Ok(correction) => correction,
            Err(LinkError::Timeout) => {
                warn!("{}: no time correction available yet, starting from 0", info.source_id);
                0.0
            }
            Err(LinkError::Lost) => {
                return Err(Error::Transport {
                    code: ERR_LOST,
                    message: format!("{} was lost while connecting", info.source_id),
                })
            }
        };
        debug!("{}: inlet created, time correction {:.6}s", info.source_id, correction);

        let inlet = Inlet {
            buffer: Arc::new(TimeSeriesBuffer::with_capacity(config.initial_capacity)),
            correction: Arc::new(AtomicCell::new(correction)),
            stop: Arc::new(AtomicBool::new(true)),
            link: Mutex::new(Link::Idle(subscription)),
            info,
            config,
        };
        if inlet.config.auto_start {
            inlet.start_listening()?;
        }
        Ok(inlet)
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn config(&self) -> &InletConfig {
        &self.config
    }

    /// Last known time correction in seconds.
    pub fn time_correction(&self) -> f64 {
        self.correction.load()
    }

    pub fn buffer(&self) -> Arc<TimeSeriesBuffer<Received<S>>> {
        self.buffer.clone()
    }

    /// Spawn the worker. Returns whether a worker was started; an inlet
    /// that is already listening is left alone. A worker that ended because
    /// the stream was lost is reaped and the subscription reopened, which
    /// fails if the stream is still gone.
    pub fn start_listening(&self) -> Result<bool> {
        let mut link = self.link.lock();
        let mut subscription = match std::mem::replace(&mut *link, Link::Broken) {
            Link::Listening(handle) => {
                if !self.stop.load(Ordering::Acquire) {
                    *link = Link::Listening(handle);
                    return Ok(false);
                }
                let mut subscription = self.join(handle)?;
                subscription.flush();
                subscription.close();
                subscription
            }
            Link::Idle(subscription) => subscription,
            Link::Broken => {
                return Err(Error::InvalidState(format!(
                    "{}: inlet lost its subscription",
                    self.info.source_id
                )))
            }
        };

        if let Err(e) = subscription.open(self.config.open_timeout) {
            *link = Link::Idle(subscription);
            return Err(e);
        }

        self.stop.store(false, Ordering::Release);
        let worker = Worker {
            buffer: self.buffer.clone(),
            correction: self.correction.clone(),
            stop: self.stop.clone(),
            pull_timeout: self.config.pull_timeout,
            correction_timeout: self.config.correction_timeout,
            codec: ChannelCodec::new(),
        };
        // handed over once the thread exists, so a failed spawn keeps it
        let (handoff, pickup) = bounded::<Box<dyn Subscription>>(1);
        let spawned = thread::Builder::new()
            .name(format!("inlet {}", self.info.source_id))
            .spawn(move || pickup.recv().ok().map(|subscription| worker.run(subscription)));
        match spawned {
            Ok(handle) => match handoff.send(subscription) {
                Ok(()) => {
                    debug!("{}: inlet worker spawned", self.info.source_id);
                    *link = Link::Listening(handle);
                    Ok(true)
                }
                Err(SendError(mut subscription)) => {
                    self.stop.store(true, Ordering::Release);
                    subscription.close();
                    *link = Link::Idle(subscription);
                    Err(Error::InvalidState(format!(
                        "{}: inlet worker exited before it started",
                        self.info.source_id
                    )))
                }
            },
            Err(e) => {
                self.stop.store(true, Ordering::Release);
                subscription.close();
                *link = Link::Idle(subscription);
                Err(Error::InvalidState(format!(
                    "{}: could not spawn inlet worker: {}",
                    self.info.source_id, e
                )))
            }
        }
    }

    pub fn is_listening(&self) -> bool {
        let link = self.link.lock();
        matches!(*link, Link::Listening(_)) && !self.stop.load(Ordering::Acquire)
    }

    /// Stop the worker, drop frames received but not yet pulled, and
    /// optionally clear the buffer. Returns whether a worker was running.
    pub fn stop_listening(&self, clear_buffer: bool) -> bool {
        let mut link = self.link.lock();
        let mut was_running = false;
        match std::mem::replace(&mut *link, Link::Broken) {
            Link::Listening(handle) => {
                was_running = !self.stop.swap(true, Ordering::AcqRel);
                if let Ok(mut subscription) = self.join(handle) {
                    let dropped = subscription.flush();
                    subscription.close();
                    debug!(
                        "{}: inlet stopped, {} pending frames dropped",
                        self.info.source_id, dropped
                    );
                    *link = Link::Idle(subscription);
                }
            }
            other => *link = other,
        }

        if clear_buffer {
            self.buffer.clear();
        }
        was_running
    }

    fn join(&self, handle: JoinHandle<Option<Box<dyn Subscription>>>) -> Result<Box<dyn Subscription>> {
        match handle.join() {
            Ok(Some(subscription)) => Ok(subscription),
            _ => {
                error!("{}: inlet worker lost its subscription", self.info.source_id);
                Err(Error::InvalidState(format!(
                    "{}: inlet worker lost its subscription",
                    self.info.source_id
                )))
            }
        }
    }
}

impl<S: ChannelLayout> Drop for Inlet<S> {
    fn drop(&mut self) {
        self.stop_listening(false);
    }
}

struct Worker<S: ChannelLayout> {
    buffer: Arc<TimeSeriesBuffer<Received<S>>>,
    correction: Arc<AtomicCell<f64>>,
    stop: Arc<AtomicBool>,
    pull_timeout: Duration,
    correction_timeout: Duration,
    codec: ChannelCodec,
}

impl<S: ChannelLayout> Worker<S> {
    /// Pump until stopped or the stream is lost, then give the subscription
    /// back. A panic while pumping ends the worker the same way.
    fn run(mut self, mut subscription: Box<dyn Subscription>) -> Box<dyn Subscription> {
        let source_id = subscription.info().source_id.clone();
        let pumped = panic::catch_unwind(AssertUnwindSafe(|| self.pump(subscription.as_mut())));
        if pumped.is_err() {
            error!("{}: inlet worker panicked", source_id);
        }
        self.stop.store(true, Ordering::Release);
        debug!("{}: inlet worker done", source_id);
        subscription
    }

    fn pump(&mut self, subscription: &mut dyn Subscription) {
        while !self.stop.load(Ordering::Acquire) {
            let raw = match subscription.pull(self.pull_timeout) {
                Pull::Sample(raw) => raw,
                Pull::Timeout => continue,
                Pull::Lost => {
                    warn!("{}: stream lost, inlet worker exiting", subscription.info().source_id);
                    return;
                }
            };

            // best effort, a missing estimate keeps the last one
            let offset = match subscription.time_correction(self.correction_timeout) {
                Ok(offset) => {
                    self.correction.store(offset);
                    offset
                }
                Err(_) => self.correction.load(),
            };

            match self.decode(&raw, offset) {
                Ok(received) => self.buffer.append(received),
                Err(e) => warn!("{}: dropping sample: {}", subscription.info().source_id, e),
            }
        }
    }

    fn decode(&mut self, raw: &RawSample, offset: f64) -> Result<Received<S>> {
        trace!("pulled {} byte frame at {:.6}", raw.payload.len(), raw.timestamp);
        let mut frame = BytesMut::from(&raw.payload[..]);
        let channels = self
            .codec
            .decode(&mut frame)
            .map_err(|e| Error::Decode(e.to_string()))?
            .ok_or_else(|| Error::Decode(format!("truncated frame {}", hex::encode(&raw.payload))))?;

        let remote_time = seconds_to_micros(raw.timestamp);
        Ok(Received {
            sample: S::from_channels(&channels, remote_time)?,
            remote_time,
            local_time: seconds_to_micros(raw.timestamp + offset),
        })
    }
}
