use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::buffer::{BufferSide, Clock, TimeSeriesBuffer, Timestamped};
use crate::error::{Error, Result};
use crate::tracker::types::{EyeImage, ExtSignal, GazeSample, Notification, Positioning, TimeSync};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    Gaze,
    /// Never buffered on its own, always merged into gaze samples.
    EyeOpenness,
    EyeImage,
    ExtSignal,
    TimeSync,
    Positioning,
    Notification,
}

impl StreamKind {
    pub const ALL: [StreamKind; 7] = [
        StreamKind::Gaze,
        StreamKind::EyeOpenness,
        StreamKind::EyeImage,
        StreamKind::ExtSignal,
        StreamKind::TimeSync,
        StreamKind::Positioning,
        StreamKind::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Gaze => "gaze",
            StreamKind::EyeOpenness => "eyeOpenness",
            StreamKind::EyeImage => "eyeImage",
            StreamKind::ExtSignal => "externalSignal",
            StreamKind::TimeSync => "timeSync",
            StreamKind::Positioning => "positioning",
            StreamKind::Notification => "notification",
        }
    }

    pub fn snake_case(&self) -> &'static str {
        match self {
            StreamKind::EyeOpenness => "eye_openness",
            StreamKind::EyeImage => "eye_image",
            StreamKind::ExtSignal => "external_signal",
            StreamKind::TimeSync => "time_sync",
            other => other.as_str(),
        }
    }

    /// Initial buffer reservation, in samples.
    pub fn default_capacity(&self) -> usize {
        match self {
            StreamKind::Gaze | StreamKind::EyeOpenness => 2 << 19,
            StreamKind::EyeImage => 2 << 11,
            StreamKind::ExtSignal => 2 << 9,
            StreamKind::TimeSync => 2 << 9,
            StreamKind::Positioning => 2 << 11,
            StreamKind::Notification => 2 << 4,
        }
    }

    /// Kind whose buffer holds this kind's samples.
    pub fn storage(&self) -> StreamKind {
        match self {
            StreamKind::EyeOpenness => StreamKind::Gaze,
            other => *other,
        }
    }

    pub fn supports_time_range(&self) -> bool {
        *self != StreamKind::Positioning
    }

    /// Kinds that can be published to and received from a transport.
    pub fn is_networked(&self) -> bool {
        matches!(
            self,
            StreamKind::Gaze | StreamKind::ExtSignal | StreamKind::TimeSync | StreamKind::Positioning
        )
    }

    fn supported_names() -> String {
        StreamKind::ALL
            .iter()
            .map(|k| format!("\"{}\"", k.as_str()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromStr for StreamKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<StreamKind> {
        StreamKind::ALL
            .iter()
            .find(|k| k.as_str() == s || k.snake_case() == s)
            .copied()
            .ok_or_else(|| Error::UnknownStream {
                name: s.to_string(),
                supported: StreamKind::supported_names(),
            })
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One buffer per stored kind, so per-kind work needs a single match.
#[derive(Clone)]
pub enum AnyBuffer {
    Gaze(Arc<TimeSeriesBuffer<GazeSample>>),
    EyeImage(Arc<TimeSeriesBuffer<EyeImage>>),
    ExtSignal(Arc<TimeSeriesBuffer<ExtSignal>>),
    TimeSync(Arc<TimeSeriesBuffer<TimeSync>>),
    Positioning(Arc<TimeSeriesBuffer<Positioning>>),
    Notification(Arc<TimeSeriesBuffer<Notification>>),
}

/// Samples drained from an [`AnyBuffer`].
#[derive(Clone, Debug, PartialEq)]
pub enum Samples {
    Gaze(Vec<GazeSample>),
    EyeImage(Vec<EyeImage>),
    ExtSignal(Vec<ExtSignal>),
    TimeSync(Vec<TimeSync>),
    Positioning(Vec<Positioning>),
    Notification(Vec<Notification>),
}

macro_rules! each_buffer {
    ($any:expr, $buf:ident => $body:expr) => {
        match $any {
            AnyBuffer::Gaze($buf) => $body,
            AnyBuffer::EyeImage($buf) => $body,
            AnyBuffer::ExtSignal($buf) => $body,
            AnyBuffer::TimeSync($buf) => $body,
            AnyBuffer::Positioning($buf) => $body,
            AnyBuffer::Notification($buf) => $body,
        }
    };
}

macro_rules! map_buffer {
    ($any:expr, $buf:ident => $body:expr) => {
        match $any {
            AnyBuffer::Gaze($buf) => Samples::Gaze($body),
            AnyBuffer::EyeImage($buf) => Samples::EyeImage($body),
            AnyBuffer::ExtSignal($buf) => Samples::ExtSignal($body),
            AnyBuffer::TimeSync($buf) => Samples::TimeSync($body),
            AnyBuffer::Positioning($buf) => Samples::Positioning($body),
            AnyBuffer::Notification($buf) => Samples::Notification($body),
        }
    };
}

impl AnyBuffer {
    pub fn with_capacity(kind: StreamKind, capacity: usize) -> AnyBuffer {
        match kind {
            StreamKind::Gaze | StreamKind::EyeOpenness => {
                AnyBuffer::Gaze(Arc::new(TimeSeriesBuffer::with_capacity(capacity)))
            }
            StreamKind::EyeImage => {
                AnyBuffer::EyeImage(Arc::new(TimeSeriesBuffer::with_capacity(capacity)))
            }
            StreamKind::ExtSignal => {
                AnyBuffer::ExtSignal(Arc::new(TimeSeriesBuffer::with_capacity(capacity)))
            }
            StreamKind::TimeSync => {
                AnyBuffer::TimeSync(Arc::new(TimeSeriesBuffer::with_capacity(capacity)))
            }
            StreamKind::Positioning => {
                AnyBuffer::Positioning(Arc::new(TimeSeriesBuffer::with_capacity(capacity)))
            }
            StreamKind::Notification => {
                AnyBuffer::Notification(Arc::new(TimeSeriesBuffer::with_capacity(capacity)))
            }
        }
    }

    pub fn kind(&self) -> StreamKind {
        match self {
            AnyBuffer::Gaze(_) => StreamKind::Gaze,
            AnyBuffer::EyeImage(_) => StreamKind::EyeImage,
            AnyBuffer::ExtSignal(_) => StreamKind::ExtSignal,
            AnyBuffer::TimeSync(_) => StreamKind::TimeSync,
            AnyBuffer::Positioning(_) => StreamKind::Positioning,
            AnyBuffer::Notification(_) => StreamKind::Notification,
        }
    }

    /// `owner` names whoever holds the buffer in the mismatch error.
    pub fn typed<S: Recorded>(&self, owner: &str) -> Result<Arc<TimeSeriesBuffer<S>>> {
        S::unwrap_buffer(self).ok_or_else(|| Error::type_mismatch(owner, S::KIND, self.kind()))
    }

    pub fn len(&self) -> usize {
        each_buffer!(self, b => b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reserve(&self, capacity: usize) {
        each_buffer!(self, b => b.reserve(capacity))
    }

    pub fn consume_n(&self, n: usize, side: BufferSide) -> Samples {
        map_buffer!(self, b => b.consume_n(n, side))
    }

    pub fn peek_n(&self, n: usize, side: BufferSide) -> Samples {
        map_buffer!(self, b => b.peek_n(n, side))
    }

    pub fn consume_time_range(&self, t0: i64, t1: i64, clock: Clock) -> Result<Samples> {
        Ok(map_buffer!(self, b => b.consume_time_range(t0, t1, clock)?))
    }

    pub fn peek_time_range(&self, t0: i64, t1: i64, clock: Clock) -> Result<Samples> {
        Ok(map_buffer!(self, b => b.peek_time_range(t0, t1, clock)?))
    }

    pub fn clear(&self) {
        each_buffer!(self, b => b.clear())
    }

    pub fn clear_time_range(&self, t0: i64, t1: i64, clock: Clock) -> Result<()> {
        each_buffer!(self, b => b.clear_time_range(t0, t1, clock))
    }
}

impl Samples {
    pub fn kind(&self) -> StreamKind {
        match self {
            Samples::Gaze(_) => StreamKind::Gaze,
            Samples::EyeImage(_) => StreamKind::EyeImage,
            Samples::ExtSignal(_) => StreamKind::ExtSignal,
            Samples::TimeSync(_) => StreamKind::TimeSync,
            Samples::Positioning(_) => StreamKind::Positioning,
            Samples::Notification(_) => StreamKind::Notification,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Samples::Gaze(v) => v.len(),
            Samples::EyeImage(v) => v.len(),
            Samples::ExtSignal(v) => v.len(),
            Samples::TimeSync(v) => v.len(),
            Samples::Positioning(v) => v.len(),
            Samples::Notification(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sample shapes that a tracker session buffers, with their slot in
/// [`AnyBuffer`].
pub trait Recorded: Timestamped {
    fn unwrap_buffer(any: &AnyBuffer) -> Option<Arc<TimeSeriesBuffer<Self>>>;
}

macro_rules! recorded {
    ($($shape:ty => $variant:ident),* $(,)?) => {
        $(
            impl Recorded for $shape {
                fn unwrap_buffer(any: &AnyBuffer) -> Option<Arc<TimeSeriesBuffer<Self>>> {
                    match any {
                        AnyBuffer::$variant(b) => Some(b.clone()),
                        _ => None,
                    }
                }
            }
        )*
    };
}

recorded! {
    GazeSample => Gaze,
    EyeImage => EyeImage,
    ExtSignal => ExtSignal,
    TimeSync => TimeSync,
    Positioning => Positioning,
    Notification => Notification,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_both_spellings() {
        assert_eq!("gaze".parse::<StreamKind>().unwrap(), StreamKind::Gaze);
        assert_eq!("eyeOpenness".parse::<StreamKind>().unwrap(), StreamKind::EyeOpenness);
        assert_eq!("eye_openness".parse::<StreamKind>().unwrap(), StreamKind::EyeOpenness);
        assert_eq!("externalSignal".parse::<StreamKind>().unwrap(), StreamKind::ExtSignal);
        assert_eq!("external_signal".parse::<StreamKind>().unwrap(), StreamKind::ExtSignal);
        assert_eq!("time_sync".parse::<StreamKind>().unwrap(), StreamKind::TimeSync);
        assert_eq!("eye_image".parse::<StreamKind>().unwrap(), StreamKind::EyeImage);
        assert_eq!("notification".parse::<StreamKind>().unwrap(), StreamKind::Notification);

        for kind in StreamKind::ALL.iter() {
            assert_eq!(kind.to_string().parse::<StreamKind>().unwrap(), *kind);
        }
    }

    #[test]
    fn unknown_stream_lists_supported_names() {
        match "ttl".parse::<StreamKind>() {
            Err(Error::UnknownStream { name, supported }) => {
                assert_eq!(name, "ttl");
                assert!(supported.contains("\"timeSync\""));
                assert!(supported.contains("\"positioning\""));
            }
            other => panic!("expected unknown stream, got {:?}", other),
        }
    }

    #[test]
    fn eye_openness_shares_the_gaze_buffer() {
        assert_eq!(StreamKind::EyeOpenness.storage(), StreamKind::Gaze);
        assert_eq!(
            StreamKind::EyeOpenness.default_capacity(),
            StreamKind::Gaze.default_capacity()
        );
        let buffer = AnyBuffer::with_capacity(StreamKind::EyeOpenness, 4);
        assert_eq!(buffer.kind(), StreamKind::Gaze);
    }

    #[test]
    fn default_capacities() {
        assert_eq!(StreamKind::Gaze.default_capacity(), 1_048_576);
        assert_eq!(StreamKind::ExtSignal.default_capacity(), 1024);
        assert_eq!(StreamKind::TimeSync.default_capacity(), 1024);
        assert_eq!(StreamKind::Positioning.default_capacity(), 4096);
    }

    #[test]
    fn positioning_range_is_rejected_through_dispatch() {
        let buffer = AnyBuffer::with_capacity(StreamKind::Positioning, 4);
        assert!(!StreamKind::Positioning.supports_time_range());
        assert!(buffer.peek_time_range(0, i64::MAX, Clock::Local).is_err());
        assert!(buffer.clear_time_range(0, i64::MAX, Clock::Local).is_err());
        assert!(buffer.consume_n(crate::buffer::ALL, BufferSide::Start).is_empty());
    }

    #[test]
    fn typed_access_matches_variant() {
        let buffer = AnyBuffer::with_capacity(StreamKind::TimeSync, 4);
        let typed = buffer.typed::<TimeSync>("test").unwrap();
        typed.append(TimeSync {
            system_request_time_stamp: 1,
            device_time_stamp: 2,
            system_response_time_stamp: 3,
        });
        assert_eq!(buffer.len(), 1);
        match buffer.peek_n(1, BufferSide::End) {
            Samples::TimeSync(v) => assert_eq!(v[0].device_time_stamp, 2),
            other => panic!("unexpected {:?}", other.kind()),
        }
    }
}
