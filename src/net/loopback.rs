//! In-process transport. Outlets and subscriptions meet on a shared bus,
//! with a configurable clock offset and the ability to cut a stream to
//! simulate link loss.

use bytes::BytesMut;
use crossbeam::atomic::AtomicCell;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::codec::Encoder;

use super::codec::ChannelCodec;
use super::{Channels, LinkError, Outlet, Pull, RawSample, StreamInfo, Subscription, Transport};
use super::{ERR_ARGUMENT, ERR_INTERNAL, ERR_LOST};
use crate::error::{Error, Result};
use crate::stream::StreamKind;

const RESOLVE_POLL: Duration = Duration::from_millis(10);

struct Published {
    info: StreamInfo,
    generation: u64,
    subscribers: HashMap<u64, Sender<RawSample>>,
}

struct Bus {
    epoch: Instant,
    clock_offset: AtomicCell<Option<f64>>,
    streams: Mutex<HashMap<String, Published>>,
    ids: AtomicU64,
}

impl Bus {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct LoopbackTransport {
    bus: Arc<Bus>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        LoopbackTransport::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> LoopbackTransport {
        LoopbackTransport::with_clock_offset(0.0)
    }

    /// Every subscription reports `offset` seconds as its time correction.
    pub fn with_clock_offset(offset: f64) -> LoopbackTransport {
        LoopbackTransport {
            bus: Arc::new(Bus {
                epoch: Instant::now(),
                clock_offset: AtomicCell::new(Some(offset)),
                streams: Mutex::new(HashMap::new()),
                ids: AtomicU64::new(1),
            }),
        }
    }

    /// `None` makes every time correction query time out.
    pub fn set_clock_offset(&self, offset: Option<f64>) {
        self.bus.clock_offset.store(offset);
    }

    /// Drop a published stream as if the network went away. Subscribers
    /// drain what they already received and then see the stream as lost.
    pub fn disconnect(&self, source_id: &str) -> bool {
        let removed = self.bus.streams.lock().remove(source_id);
        if removed.is_some() {
            debug!("loopback: disconnected {}", source_id);
        }
        removed.is_some()
    }

    /// Every stream on the bus, by source id.
    pub fn published(&self) -> Vec<StreamInfo> {
        let mut published: Vec<StreamInfo> = self
            .bus
            .streams
            .lock()
            .values()
            .map(|p| p.info.clone())
            .collect();
        published.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        published
    }

    /// Poll the bus until something matches or `timeout` passes.
    fn find(&self, timeout: Duration, matches: impl Fn(&StreamInfo) -> bool) -> Vec<StreamInfo> {
        let deadline = Instant::now() + timeout;
        loop {
            let found: Vec<StreamInfo> = self
                .published()
                .into_iter()
                .filter(|info| matches(info))
                .collect();
            let now = Instant::now();
            if !found.is_empty() || now >= deadline {
                return found;
            }
            thread::sleep(RESOLVE_POLL.min(deadline - now));
        }
    }
}

impl Transport for LoopbackTransport {
    fn local_clock(&self) -> f64 {
        self.bus.now()
    }

    fn create_outlet(&self, info: StreamInfo) -> Result<Box<dyn Outlet>> {
        let mut streams = self.bus.streams.lock();
        if streams.contains_key(&info.source_id) {
            return Err(Error::Transport {
                code: ERR_ARGUMENT,
                message: format!("{} is already published", info.source_id),
            });
        }

        let generation = self.bus.next_id();
        streams.insert(
            info.source_id.clone(),
            Published {
                info: info.clone(),
                generation,
                subscribers: HashMap::new(),
            },
        );
        debug!("loopback: outlet {} created", info.source_id);
        Ok(Box::new(LoopbackOutlet {
            bus: self.bus.clone(),
            info,
            generation,
        }))
    }

    fn resolve(&self, source_id: &str, timeout: Duration) -> Vec<StreamInfo> {
        self.find(timeout, |info| info.source_id == source_id)
    }

    fn resolve_kind(&self, kind: StreamKind, timeout: Duration) -> Vec<StreamInfo> {
        self.find(timeout, |info| info.kind == kind)
    }

    // the bus knows every stream at once, nothing to wait for
    fn resolve_all(&self, _timeout: Duration) -> Vec<StreamInfo> {
        self.published()
    }

    fn subscribe(&self, info: &StreamInfo) -> Result<Box<dyn Subscription>> {
        if !self.bus.streams.lock().contains_key(&info.source_id) {
            return Err(Error::StreamNotFound(info.source_id.clone()));
        }
        Ok(Box::new(LoopbackSubscription {
            bus: self.bus.clone(),
            info: info.clone(),
            id: self.bus.next_id(),
            samples: None,
        }))
    }
}

struct LoopbackOutlet {
    bus: Arc<Bus>,
    info: StreamInfo,
    generation: u64,
}

impl Outlet for LoopbackOutlet {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn push(&self, channels: &Channels, timestamp: Option<f64>) -> Result<()> {
        if channels.format() != self.info.format || channels.len() != self.info.channel_count {
            return Err(Error::Transport {
                code: ERR_ARGUMENT,
                message: format!(
                    "{} expects {} {} channels, got {} {}",
                    self.info.source_id,
                    self.info.channel_count,
                    self.info.format,
                    channels.len(),
                    channels.format()
                ),
            });
        }

        let mut frame = BytesMut::new();
        ChannelCodec::new()
            .encode(channels, &mut frame)
            .map_err(|e| Error::Transport {
                code: ERR_INTERNAL,
                message: e.to_string(),
            })?;
        let timestamp = timestamp.unwrap_or_else(|| self.bus.now());
        trace!(
            "{}: push at {:.6}: {}",
            self.info.source_id,
            timestamp,
            hex::encode(&frame)
        );
        let sample = RawSample {
            payload: frame.freeze(),
            timestamp,
        };

        let mut streams = self.bus.streams.lock();
        if let Some(published) = streams.get_mut(&self.info.source_id) {
            if published.generation == self.generation {
                published
                    .subscribers
                    .retain(|_, tx| tx.send(sample.clone()).is_ok());
            }
        }
        Ok(())
    }
}

impl Drop for LoopbackOutlet {
    fn drop(&mut self) {
        let mut streams = self.bus.streams.lock();
        let ours = streams
            .get(&self.info.source_id)
            .map_or(false, |p| p.generation == self.generation);
        if ours {
            streams.remove(&self.info.source_id);
            debug!("loopback: outlet {} closed", self.info.source_id);
        }
    }
}

struct LoopbackSubscription {
    bus: Arc<Bus>,
    info: StreamInfo,
    id: u64,
    samples: Option<Receiver<RawSample>>,
}

impl LoopbackSubscription {
    fn is_published(&self) -> bool {
        self.bus.streams.lock().contains_key(&self.info.source_id)
    }
}

impl Subscription for LoopbackSubscription {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn open(&mut self, _timeout: Duration) -> Result<()> {
        let mut streams = self.bus.streams.lock();
        let published = match streams.get_mut(&self.info.source_id) {
            Some(published) => published,
            None => {
                self.samples = None;
                return Err(Error::Transport {
                    code: ERR_LOST,
                    message: format!("{} is no longer published", self.info.source_id),
                });
            }
        };
        if self.samples.is_some() && published.subscribers.contains_key(&self.id) {
            return Ok(());
        }
        let (tx, rx) = unbounded();
        published.subscribers.insert(self.id, tx);
        self.samples = Some(rx);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(published) = self.bus.streams.lock().get_mut(&self.info.source_id) {
            published.subscribers.remove(&self.id);
        }
        self.samples = None;
    }

    fn pull(&mut self, timeout: Duration) -> Pull {
        let samples = match &self.samples {
            Some(samples) => samples,
            None => {
                thread::sleep(timeout);
                return Pull::Timeout;
            }
        };
        match samples.recv_timeout(timeout) {
            Ok(sample) => Pull::Sample(sample),
            Err(RecvTimeoutError::Timeout) => Pull::Timeout,
            Err(RecvTimeoutError::Disconnected) => Pull::Lost,
        }
    }

    fn time_correction(&mut self, _timeout: Duration) -> std::result::Result<f64, LinkError> {
        if !self.is_published() {
            return Err(LinkError::Lost);
        }
        self.bus.clock_offset.load().ok_or(LinkError::Timeout)
    }

    fn flush(&mut self) -> usize {
        self.samples
            .as_ref()
            .map_or(0, |samples| samples.try_iter().count())
    }
}

impl Drop for LoopbackSubscription {
    fn drop(&mut self) {
        self.close();
    }
}
