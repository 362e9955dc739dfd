//! Kind-erased inlets, resolved from a source id.

use std::sync::Arc;
use std::time::Duration;

use super::inlet::{Inlet, InletConfig, Received};
use super::layout::ChannelLayout;
use super::{StreamInfo, Transport, SOURCE_ID_PREFIX};
use crate::buffer::{BufferSide, Clock, TimeSeriesBuffer, ALL, TIME_MAX, TIME_MIN};
use crate::error::{Error, Result};
use crate::stream::StreamKind;
use crate::tracker::types::*;

/// An inlet for any stream kind that can be received.
pub enum Receiver {
    Gaze(Inlet<GazeSample>),
    ExtSignal(Inlet<ExtSignal>),
    TimeSync(Inlet<TimeSync>),
    Positioning(Inlet<Positioning>),
}

/// Samples drained from a [`Receiver`].
#[derive(Clone, Debug, PartialEq)]
pub enum InletSamples {
    Gaze(Vec<Received<GazeSample>>),
    ExtSignal(Vec<Received<ExtSignal>>),
    TimeSync(Vec<Received<TimeSync>>),
    Positioning(Vec<Received<Positioning>>),
}

macro_rules! each_inlet {
    ($receiver:expr, $inlet:ident => $body:expr) => {
        match $receiver {
            Receiver::Gaze($inlet) => $body,
            Receiver::ExtSignal($inlet) => $body,
            Receiver::TimeSync($inlet) => $body,
            Receiver::Positioning($inlet) => $body,
        }
    };
}

macro_rules! map_inlet {
    ($receiver:expr, $inlet:ident => $body:expr) => {
        match $receiver {
            Receiver::Gaze($inlet) => InletSamples::Gaze($body),
            Receiver::ExtSignal($inlet) => InletSamples::ExtSignal($body),
            Receiver::TimeSync($inlet) => InletSamples::TimeSync($body),
            Receiver::Positioning($inlet) => InletSamples::Positioning($body),
        }
    };
}

/// Kind named by an eyestream source id, `eyestream:<kind>@<serial>`.
pub fn source_kind(source_id: &str) -> Result<StreamKind> {
    if !source_id.starts_with(SOURCE_ID_PREFIX) {
        return Err(Error::InvalidState(format!(
            "\"{}\" was not published by an eyestream sender",
            source_id
        )));
    }
    let rest = &source_id[SOURCE_ID_PREFIX.len()..];
    match rest.find('@') {
        Some(at) => rest[..at].parse(),
        None => Err(Error::InvalidState(format!(
            "\"{}\" does not name a serial number",
            source_id
        ))),
    }
}

fn receivable(kind: StreamKind) -> Result<()> {
    match kind {
        StreamKind::EyeOpenness | StreamKind::EyeImage | StreamKind::Notification => {
            Err(Error::unsupported(kind, "receiving"))
        }
        _ => Ok(()),
    }
}

/// Streams a listener could be created for. With a kind, waits up to
/// `timeout` for one to show up; without, lists everything advertised.
pub fn available_streams(
    transport: &dyn Transport,
    kind: Option<StreamKind>,
    timeout: Duration,
) -> Result<Vec<StreamInfo>> {
    match kind {
        Some(kind) => {
            receivable(kind)?;
            Ok(transport.resolve_kind(kind, timeout))
        }
        None => Ok(transport.resolve_all(timeout)),
    }
}

impl Receiver {
    /// Find the stream published under `source_id` and subscribe to it.
    pub fn connect(transport: &dyn Transport, source_id: &str, config: InletConfig) -> Result<Receiver> {
        let kind = source_kind(source_id)?;
        receivable(kind)?;

        let mut found = transport.resolve(source_id, config.resolve_timeout);
        let info = match found.len() {
            0 => return Err(Error::StreamNotFound(source_id.to_string())),
            1 => found.remove(0),
            n => {
                return Err(Error::InvalidState(format!(
                    "{} streams share the source id \"{}\"",
                    n, source_id
                )))
            }
        };
        if info.kind != kind {
            return Err(Error::InvalidState(format!(
                "\"{}\" carries a {} stream",
                source_id, info.kind
            )));
        }

        Ok(match kind {
            StreamKind::Gaze => Receiver::Gaze(Inlet::new(transport, info, config)?),
            StreamKind::ExtSignal => Receiver::ExtSignal(Inlet::new(transport, info, config)?),
            StreamKind::TimeSync => Receiver::TimeSync(Inlet::new(transport, info, config)?),
            StreamKind::Positioning => Receiver::Positioning(Inlet::new(transport, info, config)?),
            other => return Err(Error::unsupported(other, "receiving")),
        })
    }

    pub fn kind(&self) -> StreamKind {
        match self {
            Receiver::Gaze(_) => StreamKind::Gaze,
            Receiver::ExtSignal(_) => StreamKind::ExtSignal,
            Receiver::TimeSync(_) => StreamKind::TimeSync,
            Receiver::Positioning(_) => StreamKind::Positioning,
        }
    }

    pub fn info(&self) -> &StreamInfo {
        each_inlet!(self, inlet => inlet.info())
    }

    pub fn time_correction(&self) -> f64 {
        each_inlet!(self, inlet => inlet.time_correction())
    }

    pub fn start_listening(&self) -> Result<bool> {
        each_inlet!(self, inlet => inlet.start_listening())
    }

    pub fn is_listening(&self) -> bool {
        each_inlet!(self, inlet => inlet.is_listening())
    }

    pub fn stop_listening(&self, clear_buffer: Option<bool>) -> bool {
        let clear_buffer = clear_buffer.unwrap_or(false);
        each_inlet!(self, inlet => inlet.stop_listening(clear_buffer))
    }

    /// Typed handle on the inlet buffer.
    pub fn buffer<S: Networked>(&self) -> Result<Arc<TimeSeriesBuffer<Received<S>>>> {
        S::unwrap_inlet(self)
            .map(|inlet| inlet.buffer())
            .ok_or_else(|| Error::type_mismatch(&self.info().source_id, S::KIND, self.kind()))
    }

    pub fn len(&self) -> usize {
        each_inlet!(self, inlet => inlet.buffer().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove up to `n` samples (default all) from `side` (default start).
    pub fn consume_n(&self, n: Option<usize>, side: Option<BufferSide>) -> InletSamples {
        let (n, side) = (n.unwrap_or(ALL), side.unwrap_or(BufferSide::Start));
        map_inlet!(self, inlet => inlet.buffer().consume_n(n, side))
    }

    /// Copy up to `n` samples (default one) from `side` (default end).
    pub fn peek_n(&self, n: Option<usize>, side: Option<BufferSide>) -> InletSamples {
        let (n, side) = (n.unwrap_or(1), side.unwrap_or(BufferSide::End));
        map_inlet!(self, inlet => inlet.buffer().peek_n(n, side))
    }

    pub fn consume_time_range(
        &self,
        t0: Option<i64>,
        t1: Option<i64>,
        clock: Option<Clock>,
    ) -> Result<InletSamples> {
        let (t0, t1, clock) = range_args(t0, t1, clock);
        Ok(map_inlet!(self, inlet => inlet.buffer().consume_time_range(t0, t1, clock)?))
    }

    pub fn peek_time_range(
        &self,
        t0: Option<i64>,
        t1: Option<i64>,
        clock: Option<Clock>,
    ) -> Result<InletSamples> {
        let (t0, t1, clock) = range_args(t0, t1, clock);
        Ok(map_inlet!(self, inlet => inlet.buffer().peek_time_range(t0, t1, clock)?))
    }

    pub fn clear(&self) {
        each_inlet!(self, inlet => inlet.buffer().clear())
    }

    pub fn clear_time_range(&self, t0: Option<i64>, t1: Option<i64>, clock: Option<Clock>) -> Result<()> {
        let (t0, t1, clock) = range_args(t0, t1, clock);
        each_inlet!(self, inlet => inlet.buffer().clear_time_range(t0, t1, clock))
    }
}

fn range_args(t0: Option<i64>, t1: Option<i64>, clock: Option<Clock>) -> (i64, i64, Clock) {
    (
        t0.unwrap_or(TIME_MIN),
        t1.unwrap_or(TIME_MAX),
        clock.unwrap_or_default(),
    )
}

impl InletSamples {
    pub fn kind(&self) -> StreamKind {
        match self {
            InletSamples::Gaze(_) => StreamKind::Gaze,
            InletSamples::ExtSignal(_) => StreamKind::ExtSignal,
            InletSamples::TimeSync(_) => StreamKind::TimeSync,
            InletSamples::Positioning(_) => StreamKind::Positioning,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            InletSamples::Gaze(v) => v.len(),
            InletSamples::ExtSignal(v) => v.len(),
            InletSamples::TimeSync(v) => v.len(),
            InletSamples::Positioning(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sample shapes an inlet can receive, with their slot in [`Receiver`].
pub trait Networked: ChannelLayout {
    fn unwrap_inlet(receiver: &Receiver) -> Option<&Inlet<Self>>;
}

macro_rules! networked {
    ($($shape:ty => $variant:ident),* $(,)?) => {
        $(
            impl Networked for $shape {
                fn unwrap_inlet(receiver: &Receiver) -> Option<&Inlet<Self>> {
                    match receiver {
                        Receiver::$variant(inlet) => Some(inlet),
                        _ => None,
                    }
                }
            }
        )*
    };
}

networked! {
    GazeSample => Gaze,
    ExtSignal => ExtSignal,
    TimeSync => TimeSync,
    Positioning => Positioning,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::layout::stream_info;
    use crate::net::LoopbackTransport;
    use crate::tracker::source::TrackerInfo;
    use std::thread;
    use std::time::{Duration, Instant};

    fn tracker() -> TrackerInfo {
        TrackerInfo {
            serial_number: "S1".to_string(),
            model: "m".to_string(),
            firmware_version: "1".to_string(),
            tracking_mode: "human".to_string(),
            frequency: 120.0,
            has_eye_openness: false,
            has_eye_images: false,
            has_external_signal: true,
        }
    }

    fn config(kind: StreamKind) -> InletConfig {
        let mut config = InletConfig::for_kind(kind);
        config.pull_timeout = Duration::from_millis(10);
        config.resolve_timeout = Duration::from_millis(20);
        config
    }

    fn wait_for(what: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !what() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn source_ids_are_parsed() {
        assert_eq!(source_kind("eyestream:timeSync@S1").unwrap(), StreamKind::TimeSync);
        assert_eq!(source_kind("eyestream:external_signal@x@y").unwrap(), StreamKind::ExtSignal);
        assert!(source_kind("other:gaze@S1").is_err());
        assert!(source_kind("eyestream:gaze").is_err());
        match source_kind("eyestream:blink@S1") {
            Err(Error::UnknownStream { name, .. }) => assert_eq!(name, "blink"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn lists_streams_that_can_be_received() {
        let transport = LoopbackTransport::new();
        let short = Duration::from_millis(20);
        assert!(available_streams(&transport, Some(StreamKind::Gaze), short)
            .unwrap()
            .is_empty());

        let mut outlets = Vec::new();
        for kind in &[StreamKind::TimeSync, StreamKind::ExtSignal] {
            let info = stream_info(*kind, &tracker()).unwrap();
            outlets.push(transport.create_outlet(info).unwrap());
        }

        let found = available_streams(&transport, Some(StreamKind::TimeSync), short).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].source_id, "eyestream:timeSync@S1");
        assert_eq!(available_streams(&transport, None, short).unwrap().len(), 2);

        for kind in &[StreamKind::EyeImage, StreamKind::EyeOpenness, StreamKind::Notification] {
            match available_streams(&transport, Some(*kind), short) {
                Err(Error::Unsupported { kind: rejected, .. }) => assert_eq!(rejected, *kind),
                other => panic!("{}: unexpected {:?}", kind, other),
            }
        }
    }

    fn ext_signal_receiver(transport: &LoopbackTransport) -> (Box<dyn crate::net::Outlet>, Receiver) {
        let info = stream_info(StreamKind::ExtSignal, &tracker()).unwrap();
        let outlet = transport.create_outlet(info.clone()).unwrap();
        let receiver =
            Receiver::connect(transport, &info.source_id, config(StreamKind::ExtSignal)).unwrap();
        (outlet, receiver)
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "eyestream:externalSignal@S1")]
    fn wrong_typed_access_names_the_listener() {
        let transport = LoopbackTransport::new();
        let (_outlet, receiver) = ext_signal_receiver(&transport);
        let _ = receiver.buffer::<TimeSync>();
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn wrong_typed_access_names_the_listener() {
        let transport = LoopbackTransport::new();
        let (_outlet, receiver) = ext_signal_receiver(&transport);
        match receiver.buffer::<TimeSync>() {
            Err(Error::TypeMismatch { owner, expected, actual }) => {
                assert_eq!(owner, "eyestream:externalSignal@S1");
                assert_eq!(expected, StreamKind::TimeSync);
                assert_eq!(actual, StreamKind::ExtSignal);
            }
            other => panic!("unexpected {:?}", other.is_ok()),
        }
    }

    #[test]
    fn unreceivable_kinds_and_missing_streams() {
        let transport = LoopbackTransport::new();
        for id in &["eyestream:eyeImage@S1", "eyestream:eyeOpenness@S1", "eyestream:notification@S1"] {
            match Receiver::connect(&transport, id, config(StreamKind::Gaze)) {
                Err(Error::Unsupported { .. }) => {}
                other => panic!("{}: unexpected {:?}", id, other.map(|r| r.kind())),
            }
        }
        match Receiver::connect(&transport, "eyestream:gaze@S1", config(StreamKind::Gaze)) {
            Err(Error::StreamNotFound(id)) => assert_eq!(id, "eyestream:gaze@S1"),
            other => panic!("unexpected {:?}", other.map(|r| r.kind())),
        }
    }

    #[test]
    fn positioning_keeps_counts_but_not_ranges() {
        let transport = LoopbackTransport::new();
        let info = stream_info(StreamKind::Positioning, &tracker()).unwrap();
        let outlet = transport.create_outlet(info.clone()).unwrap();
        let receiver =
            Receiver::connect(&transport, &info.source_id, config(StreamKind::Positioning)).unwrap();
        assert_eq!(receiver.kind(), StreamKind::Positioning);
        assert!(receiver.start_listening().unwrap());

        let eye = UserPosition {
            position: Point3 {
                x: 0.5,
                y: 0.5,
                z: 0.5,
            },
            validity: Validity::Valid,
        };
        let position = Positioning {
            left_eye: eye,
            right_eye: eye,
        };
        outlet.push(&position.to_channels(), None).unwrap();
        wait_for(|| receiver.len() == 1);

        assert!(receiver.consume_time_range(None, None, None).is_err());
        assert!(receiver.peek_time_range(None, None, Some(Clock::Remote)).is_err());
        assert!(receiver.clear_time_range(None, None, None).is_err());
        assert_eq!(receiver.peek_n(None, None).len(), 1);
        assert_eq!(receiver.consume_n(None, None).kind(), StreamKind::Positioning);
        assert!(receiver.is_empty());
    }

    #[test]
    fn defaults_and_typed_access() {
        let transport = LoopbackTransport::new();
        let info = stream_info(StreamKind::ExtSignal, &tracker()).unwrap();
        let outlet = transport.create_outlet(info.clone()).unwrap();
        let receiver =
            Receiver::connect(&transport, &info.source_id, config(StreamKind::ExtSignal)).unwrap();
        assert_eq!(receiver.info(), &info);
        receiver.start_listening().unwrap();

        for t in 1..=3 {
            let signal = ExtSignal {
                device_time_stamp: t,
                system_time_stamp: t * 1_000_000,
                value: t as u32 % 2,
                change_type: ExtSignalChange::ValueChanged,
            };
            outlet.push(&signal.to_channels(), Some(t as f64)).unwrap();
        }
        wait_for(|| receiver.len() == 3);

        let newest = match receiver.peek_n(None, None) {
            InletSamples::ExtSignal(v) => v,
            other => panic!("unexpected {:?}", other.kind()),
        };
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].sample.device_time_stamp, 3);
        assert_eq!(newest[0].remote_time, 3_000_000);

        let typed = receiver.buffer::<ExtSignal>().unwrap();
        assert_eq!(typed.len(), 3);

        let taken = receiver.consume_time_range(Some(2_000_000), None, Some(Clock::Remote)).unwrap();
        assert_eq!(taken.len(), 2);
        assert_eq!(receiver.consume_n(None, None).len(), 1);
        assert!(receiver.stop_listening(Some(true)));
    }
}
