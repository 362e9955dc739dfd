//! Publishing tracker streams to a network transport and receiving them
//! back on another machine.
//!
//! The transport itself is abstract: anything offering outlets, discovery,
//! subscriptions with bounded pulls, and a clock-offset estimate can carry
//! the streams. [`loopback::LoopbackTransport`] is the in-process one.

pub mod codec;
pub mod inlet;
pub mod layout;
pub mod loopback;
pub mod receiver;
pub mod sender;

use bytes::Bytes;
use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::stream::StreamKind;

pub use inlet::{Inlet, InletConfig, Received};
pub use loopback::LoopbackTransport;
pub use receiver::{InletSamples, Receiver};
pub use sender::Sender;

/// Transport status codes carried in [`crate::Error::Transport`].
pub const ERR_LOST: i32 = -2;
pub const ERR_ARGUMENT: i32 = -3;
pub const ERR_INTERNAL: i32 = -4;

/// Prefix of every source id this crate advertises.
pub const SOURCE_ID_PREFIX: &str = "eyestream:";

/// `eyestream:<kind>@<serial>`
pub fn source_id(kind: StreamKind, serial_number: &str) -> String {
    format!("{}{}@{}", SOURCE_ID_PREFIX, kind, serial_number)
}

/// Name of the stream carrying `kind`, as shown to transport browsers.
pub fn stream_name(kind: StreamKind) -> String {
    format!("eyestream_{}", kind.snake_case())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelFormat {
    Float32,
    Double64,
    Int64,
}

impl ChannelFormat {
    /// Bytes per channel value on the wire.
    pub fn width(&self) -> usize {
        match self {
            ChannelFormat::Float32 => 4,
            ChannelFormat::Double64 | ChannelFormat::Int64 => 8,
        }
    }
}

impl fmt::Display for ChannelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelFormat::Float32 => "float32",
            ChannelFormat::Double64 => "double64",
            ChannelFormat::Int64 => "int64",
        };
        f.write_str(name)
    }
}

/// The channel values of one sample.
#[derive(Clone, Debug, PartialEq)]
pub enum Channels {
    Float32(Vec<f32>),
    Double64(Vec<f64>),
    Int64(Vec<i64>),
}

impl Channels {
    pub fn format(&self) -> ChannelFormat {
        match self {
            Channels::Float32(_) => ChannelFormat::Float32,
            Channels::Double64(_) => ChannelFormat::Double64,
            Channels::Int64(_) => ChannelFormat::Int64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Channels::Float32(v) => v.len(),
            Channels::Double64(v) => v.len(),
            Channels::Int64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Metadata for one channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelDesc {
    pub label: String,
    pub eye: Option<&'static str>,
    pub content: Option<&'static str>,
    pub unit: Option<&'static str>,
}

/// Who produced the stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Acquisition {
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub tracking_mode: String,
}

/// Everything a subscriber learns about a stream before pulling from it.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    pub name: String,
    pub kind: StreamKind,
    pub format: ChannelFormat,
    pub channel_count: usize,
    /// Samples per second, `None` for irregular streams.
    pub nominal_rate: Option<f64>,
    pub source_id: String,
    pub acquisition: Acquisition,
    pub channels: Vec<ChannelDesc>,
}

/// One sample as it left the sender, not yet decoded.
#[derive(Clone, Debug, PartialEq)]
pub struct RawSample {
    /// [`codec::ChannelCodec`] frame.
    pub payload: Bytes,
    /// Sender clock, seconds.
    pub timestamp: f64,
}

#[derive(Debug, PartialEq)]
pub enum Pull {
    Sample(RawSample),
    Timeout,
    /// The stream is gone for good.
    Lost,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkError {
    Timeout,
    Lost,
}

pub trait Transport: Send + Sync {
    /// Seconds on this host's transport clock.
    fn local_clock(&self) -> f64;

    fn create_outlet(&self, info: StreamInfo) -> Result<Box<dyn Outlet>>;

    /// Streams advertised under `source_id`, waiting up to `timeout` for at
    /// least one to show up.
    fn resolve(&self, source_id: &str, timeout: Duration) -> Vec<StreamInfo>;

    /// Streams of `kind`, waiting up to `timeout` for at least one.
    fn resolve_kind(&self, kind: StreamKind, timeout: Duration) -> Vec<StreamInfo>;

    /// Everything advertised. Discovery runs for up to `timeout`.
    fn resolve_all(&self, timeout: Duration) -> Vec<StreamInfo>;

    fn subscribe(&self, info: &StreamInfo) -> Result<Box<dyn Subscription>>;
}

/// Publishing side of a stream. Pushed from source callback threads.
pub trait Outlet: Send + Sync {
    fn info(&self) -> &StreamInfo;

    /// `timestamp` in seconds on the sender clock, `None` to stamp with the
    /// current transport time.
    fn push(&self, channels: &Channels, timestamp: Option<f64>) -> Result<()>;
}

/// Receiving side of a stream, owned by one inlet.
pub trait Subscription: Send {
    fn info(&self) -> &StreamInfo;

    /// Start receiving. Samples published before this are not seen.
    fn open(&mut self, timeout: Duration) -> Result<()>;

    fn close(&mut self);

    fn pull(&mut self, timeout: Duration) -> Pull;

    /// Seconds to add to a sender timestamp to get local transport time.
    fn time_correction(&mut self, timeout: Duration) -> std::result::Result<f64, LinkError>;

    /// Drop everything received but not pulled yet. Returns how many
    /// samples were dropped.
    fn flush(&mut self) -> usize;
}
