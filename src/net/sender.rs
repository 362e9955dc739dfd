//! Publishing tracker streams through a transport.
//!
//! Gaze and eye openness go out through one gaze outlet. While both are
//! subscribed they are merged on device time first, the same way a
//! [`crate::Session`] records them.

use log::*;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::layout::{self, micros_to_seconds, ChannelLayout};
use super::{Outlet, StreamInfo, Transport};
use crate::error::{Error, Result};
use crate::stager::DualSourceStager;
use crate::stream::StreamKind;
use crate::tracker::source::{Callback, EyeTrackerSource, SourceEvent};
use crate::tracker::types::GazeSample;

/// State touched from source callback threads.
struct Publishers {
    /// Keyed by storage kind.
    outlets: RwLock<HashMap<StreamKind, Box<dyn Outlet>>>,
    stager: DualSourceStager,
}

impl Publishers {
    fn route(&self, event: SourceEvent) {
        match event {
            SourceEvent::Gaze(gaze) => self.publish_gaze(self.stager.receive_gaze(&gaze)),
            SourceEvent::EyeOpenness(openness) => {
                self.publish_gaze(self.stager.receive_eye_openness(&openness))
            }
            SourceEvent::ExtSignal(signal) => self.publish(&signal),
            SourceEvent::TimeSync(sync) => self.publish(&sync),
            SourceEvent::Positioning(position) => self.publish(&position),
            other => error!("{} events cannot be published", other.kind()),
        }
    }

    fn publish_gaze(&self, samples: Vec<GazeSample>) {
        for sample in &samples {
            self.publish(sample);
        }
    }

    fn publish<S: ChannelLayout>(&self, sample: &S) {
        let outlets = self.outlets.read();
        let outlet = match outlets.get(&S::KIND) {
            Some(outlet) => outlet,
            None => {
                trace!("no {} outlet, dropping sample", S::KIND);
                return;
            }
        };
        let timestamp = sample.push_time().map(micros_to_seconds);
        if let Err(e) = outlet.push(&sample.to_channels(), timestamp) {
            warn!("{}: push failed: {}", outlet.info().source_id, e);
        }
    }
}

#[derive(Default)]
struct State {
    active: HashSet<StreamKind>,
    include_eye_openness: bool,
}

fn merge_partner(kind: StreamKind) -> Option<StreamKind> {
    match kind {
        StreamKind::Gaze => Some(StreamKind::EyeOpenness),
        StreamKind::EyeOpenness => Some(StreamKind::Gaze),
        _ => None,
    }
}

pub struct Sender {
    source: Arc<dyn EyeTrackerSource>,
    transport: Arc<dyn Transport>,
    publishers: Arc<Publishers>,
    state: Mutex<State>,
}

impl Sender {
    pub fn new(source: Arc<dyn EyeTrackerSource>, transport: Arc<dyn Transport>) -> Sender {
        Sender {
            source,
            transport,
            publishers: Arc::new(Publishers {
                outlets: RwLock::new(HashMap::new()),
                stager: DualSourceStager::new(false),
            }),
            state: Mutex::new(State::default()),
        }
    }

    /// Start publishing `kind`. Returns whether anything was started.
    pub fn start(&self, kind: StreamKind) -> Result<bool> {
        let mut state = self.state.lock();
        self.start_locked(&mut state, kind)
    }

    fn start_locked(&self, state: &mut State, kind: StreamKind) -> Result<bool> {
        let mut started = false;
        if !state.active.contains(&kind) {
            let storage = kind.storage();
            let created = !self.publishers.outlets.read().contains_key(&storage);
            if created {
                let info = layout::stream_info(kind, &self.source.info())?;
                let outlet = self.transport.create_outlet(info)?;
                debug!("created outlet {}", outlet.info().source_id);
                self.publishers.outlets.write().insert(storage, outlet);
            }

            if let Err(e) = self.source.subscribe(kind, false, self.callback()) {
                if created {
                    let outlet = self.publishers.outlets.write().remove(&storage);
                    drop(outlet);
                }
                return Err(e);
            }
            state.active.insert(kind);
            self.update_merging(state);
            debug!("publishing {} stream", kind);
            started = true;
        }

        if state.include_eye_openness {
            if let Some(partner) = merge_partner(kind) {
                if !state.active.contains(&partner) {
                    started |= self.start_locked(state, partner)?;
                }
            }
        }
        Ok(started)
    }

    pub fn is_streaming(&self, kind: StreamKind) -> bool {
        self.state.lock().active.contains(&kind)
    }

    /// Stop publishing `kind`. Returns whether anything was stopped.
    pub fn stop(&self, kind: StreamKind) -> Result<bool> {
        let mut state = self.state.lock();
        self.stop_locked(&mut state, kind)
    }

    fn stop_locked(&self, state: &mut State, kind: StreamKind) -> Result<bool> {
        let mut stopped = false;
        if state.active.contains(&kind) {
            // no callback may be inside an outlet once this returns
            self.source.unsubscribe(kind)?;
            state.active.remove(&kind);
            self.update_merging(state);

            let storage = kind.storage();
            if !state.active.iter().any(|k| k.storage() == storage) {
                let outlet = self.publishers.outlets.write().remove(&storage);
                if let Some(outlet) = outlet {
                    debug!("closing outlet {}", outlet.info().source_id);
                }
            }
            debug!("stopped publishing {} stream", kind);
            stopped = true;
        }

        if state.include_eye_openness {
            if let Some(partner) = merge_partner(kind) {
                if state.active.contains(&partner) {
                    stopped |= self.stop_locked(state, partner)?;
                }
            }
        }
        Ok(stopped)
    }

    /// Description of the outlet carrying `kind`, if it is published.
    pub fn stream_info(&self, kind: StreamKind) -> Option<StreamInfo> {
        self.publishers
            .outlets
            .read()
            .get(&kind.storage())
            .map(|outlet| outlet.info().clone())
    }

    pub fn include_eye_openness_in_gaze(&self) -> bool {
        self.state.lock().include_eye_openness
    }

    /// Returns the previous setting. While gaze is published this starts
    /// or stops the eye openness feed.
    pub fn set_include_eye_openness_in_gaze(&self, include: bool) -> Result<bool> {
        if include && !self.source.info().has_eye_openness {
            return Err(Error::unsupported(
                StreamKind::EyeOpenness,
                "merging into gaze",
            ));
        }

        let mut state = self.state.lock();
        let previous = state.include_eye_openness;
        state.include_eye_openness = include;

        let gaze = state.active.contains(&StreamKind::Gaze);
        let openness = state.active.contains(&StreamKind::EyeOpenness);
        if gaze && !include && openness {
            self.stop_locked(&mut state, StreamKind::EyeOpenness)?;
        } else if gaze && include && !openness {
            self.start_locked(&mut state, StreamKind::EyeOpenness)?;
        }
        Ok(previous)
    }

    fn callback(&self) -> Callback {
        let publishers = self.publishers.clone();
        Arc::new(move |event| publishers.route(event))
    }

    /// Staged halves left over when merging ends still go out, through the
    /// gaze outlet that is closed only afterwards.
    fn update_merging(&self, state: &State) {
        let merging = state.active.contains(&StreamKind::Gaze)
            && state.active.contains(&StreamKind::EyeOpenness);
        if merging != self.publishers.stager.is_merging() {
            let flushed = self.publishers.stager.set_merging(merging);
            self.publishers.publish_gaze(flushed);
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.include_eye_openness = false;
        let active: Vec<StreamKind> = state.active.iter().copied().collect();
        for kind in active {
            if let Err(e) = self.stop_locked(&mut state, kind) {
                warn!("failed to stop publishing {}: {}", kind, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::ChannelCodec;
    use crate::net::layout::seconds_to_micros;
    use crate::net::{LoopbackTransport, Pull, Subscription};
    use crate::tracker::source::{ManualSource, TrackerInfo};
    use crate::tracker::types::*;
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio_util::codec::Decoder;

    fn tracker(eye_openness: bool) -> Arc<ManualSource> {
        Arc::new(ManualSource::new(TrackerInfo {
            serial_number: "P1".to_string(),
            model: "m".to_string(),
            firmware_version: "1".to_string(),
            tracking_mode: "human".to_string(),
            frequency: 250.0,
            has_eye_openness: eye_openness,
            has_eye_images: true,
            has_external_signal: true,
        }))
    }

    fn sender(source: &Arc<ManualSource>) -> (LoopbackTransport, Sender) {
        let transport = LoopbackTransport::new();
        let sender = Sender::new(source.clone(), Arc::new(transport.clone()));
        (transport, sender)
    }

    fn gaze(t: i64) -> SourceEvent {
        let eye = EyeGaze {
            gaze_point_on_display_area: Point2 { x: 0.5, y: 0.5 },
            gaze_point_in_user_coordinates: Point3 {
                x: 0.0,
                y: 100.0,
                z: 0.0,
            },
            gaze_point_validity: Validity::Valid,
            pupil_diameter: 3.5,
            pupil_validity: Validity::Valid,
            gaze_origin_in_user_coordinates: Point3 {
                x: 30.0,
                y: 0.0,
                z: 600.0,
            },
            gaze_origin_validity: Validity::Valid,
        };
        SourceEvent::Gaze(GazeData {
            left_eye: eye,
            right_eye: eye,
            device_time_stamp: t,
            system_time_stamp: t + 10,
        })
    }

    fn openness(t: i64) -> SourceEvent {
        SourceEvent::EyeOpenness(EyeOpennessData {
            left_diameter: 11.0,
            left_validity: Validity::Valid,
            right_diameter: 12.0,
            right_validity: Validity::Valid,
            device_time_stamp: t,
            system_time_stamp: t + 10,
        })
    }

    fn listen(transport: &LoopbackTransport, info: &StreamInfo) -> Box<dyn Subscription> {
        let mut subscription = transport.subscribe(info).unwrap();
        subscription.open(Duration::from_millis(10)).unwrap();
        subscription
    }

    fn next_gaze(subscription: &mut Box<dyn Subscription>) -> GazeSample {
        match subscription.pull(Duration::from_millis(100)) {
            Pull::Sample(raw) => {
                let mut frame = BytesMut::from(&raw.payload[..]);
                let channels = ChannelCodec::new().decode(&mut frame).unwrap().unwrap();
                GazeSample::from_channels(&channels, seconds_to_micros(raw.timestamp)).unwrap()
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let source = tracker(false);
        let (transport, sender) = sender(&source);
        assert!(sender.start(StreamKind::TimeSync).unwrap());
        assert!(!sender.start(StreamKind::TimeSync).unwrap());
        assert!(sender.is_streaming(StreamKind::TimeSync));
        assert!(source.is_subscribed(StreamKind::TimeSync));
        assert_eq!(transport.published().len(), 1);

        assert!(sender.stop(StreamKind::TimeSync).unwrap());
        assert!(!sender.stop(StreamKind::TimeSync).unwrap());
        assert!(!source.is_subscribed(StreamKind::TimeSync));
        assert!(transport.published().is_empty());
    }

    #[test]
    fn merged_gaze_goes_out_once() {
        let source = tracker(true);
        let (transport, sender) = sender(&source);
        assert!(!sender.set_include_eye_openness_in_gaze(true).unwrap());
        assert!(sender.start(StreamKind::Gaze).unwrap());
        assert!(sender.is_streaming(StreamKind::EyeOpenness));
        assert_eq!(transport.published().len(), 1);

        let info = sender.stream_info(StreamKind::EyeOpenness).unwrap();
        assert_eq!(info.source_id, "eyestream:gaze@P1");
        let mut subscription = listen(&transport, &info);

        source.deliver(openness(100));
        assert_eq!(subscription.pull(Duration::from_millis(10)), Pull::Timeout);
        source.deliver(gaze(100));

        let sample = next_gaze(&mut subscription);
        assert_eq!(sample.device_time_stamp, 100);
        assert_eq!(sample.system_time_stamp, 110);
        assert!(sample.left_eye.gaze_origin.available);
        assert_eq!(sample.right_eye.eye_openness.diameter, 12.0);
        assert_eq!(subscription.pull(Duration::from_millis(10)), Pull::Timeout);
    }

    #[test]
    fn leaving_merge_mode_publishes_staged_halves() {
        let source = tracker(true);
        let (transport, sender) = sender(&source);
        sender.set_include_eye_openness_in_gaze(true).unwrap();
        sender.start(StreamKind::Gaze).unwrap();
        let info = sender.stream_info(StreamKind::Gaze).unwrap();
        let mut subscription = listen(&transport, &info);

        source.deliver(gaze(200));
        assert!(sender.set_include_eye_openness_in_gaze(false).unwrap());
        assert!(!sender.is_streaming(StreamKind::EyeOpenness));
        assert!(!source.is_subscribed(StreamKind::EyeOpenness));

        let sample = next_gaze(&mut subscription);
        assert_eq!(sample.device_time_stamp, 200);
        assert!(!sample.left_eye.eye_openness.available);

        // gaze keeps its outlet
        assert_eq!(transport.published().len(), 1);
        source.deliver(gaze(201));
        assert_eq!(next_gaze(&mut subscription).device_time_stamp, 201);
    }

    #[test]
    fn stopping_one_half_stops_both() {
        let source = tracker(true);
        let (transport, sender) = sender(&source);
        sender.set_include_eye_openness_in_gaze(true).unwrap();
        sender.start(StreamKind::EyeOpenness).unwrap();
        assert!(sender.is_streaming(StreamKind::Gaze));

        assert!(sender.stop(StreamKind::Gaze).unwrap());
        assert!(!sender.is_streaming(StreamKind::EyeOpenness));
        assert!(transport.published().is_empty());
    }

    #[test]
    fn unpublishable_kinds() {
        let source = tracker(false);
        let (transport, sender) = sender(&source);
        for kind in &[StreamKind::EyeImage, StreamKind::Notification] {
            match sender.start(*kind) {
                Err(Error::Unsupported { kind: k, .. }) => assert_eq!(k, *kind),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(sender.set_include_eye_openness_in_gaze(true).is_err());
        // subscribing fails on a tracker without eye openness, the outlet goes too
        assert!(sender.start(StreamKind::EyeOpenness).is_err());
        assert!(transport.published().is_empty());
    }

    #[test]
    fn positioning_is_stamped_by_the_transport() {
        let source = tracker(false);
        let (transport, sender) = sender(&source);
        sender.start(StreamKind::Positioning).unwrap();
        let info = sender.stream_info(StreamKind::Positioning).unwrap();
        let mut subscription = listen(&transport, &info);

        let eye = UserPosition {
            position: Point3 {
                x: 0.5,
                y: 0.5,
                z: 0.5,
            },
            validity: Validity::Valid,
        };
        let before = transport.local_clock();
        source.deliver(SourceEvent::Positioning(Positioning {
            left_eye: eye,
            right_eye: eye,
        }));
        match subscription.pull(Duration::from_millis(100)) {
            Pull::Sample(raw) => assert!(raw.timestamp >= before),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn dropping_the_sender_unpublishes() {
        let source = tracker(false);
        let (transport, sender) = sender(&source);
        sender.start(StreamKind::ExtSignal).unwrap();
        sender.start(StreamKind::TimeSync).unwrap();
        drop(sender);
        assert!(transport.published().is_empty());
        assert!(!source.is_subscribed(StreamKind::ExtSignal));
    }
}
