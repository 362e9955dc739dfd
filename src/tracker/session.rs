//! Per-stream recording over an [`EyeTrackerSource`].
//!
//! A session owns one buffer per stored stream kind. Starting a kind
//! subscribes a callback that appends into that buffer; the host drains it
//! with the consume/peek calls from any thread.

use log::*;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use super::source::{Callback, EyeTrackerSource, SourceEvent, TrackerInfo};
use super::types::*;
use crate::buffer::{BufferSide, Clock, TimeSeriesBuffer, ALL, TIME_MAX, TIME_MIN};
use crate::error::{Error, Result};
use crate::stager::DualSourceStager;
use crate::stream::{AnyBuffer, Recorded, Samples, StreamKind};

/// Buffers written from source callback threads.
struct Recorders {
    gaze: Arc<TimeSeriesBuffer<GazeSample>>,
    eye_images: Arc<TimeSeriesBuffer<EyeImage>>,
    ext_signal: Arc<TimeSeriesBuffer<ExtSignal>>,
    time_sync: Arc<TimeSeriesBuffer<TimeSync>>,
    positioning: Arc<TimeSeriesBuffer<Positioning>>,
    notifications: Arc<TimeSeriesBuffer<Notification>>,
    stager: DualSourceStager,
}

impl Recorders {
    fn route(&self, event: SourceEvent) {
        match event {
            SourceEvent::Gaze(gaze) => self.gaze.extend(self.stager.receive_gaze(&gaze)),
            SourceEvent::EyeOpenness(openness) => self
                .gaze
                .extend(self.stager.receive_eye_openness(&openness)),
            SourceEvent::EyeImage(image) => self.eye_images.append(image),
            SourceEvent::ExtSignal(signal) => self.ext_signal.append(signal),
            SourceEvent::TimeSync(sync) => self.time_sync.append(sync),
            SourceEvent::Positioning(position) => self.positioning.append(position),
            SourceEvent::Notification(notification) => self.notifications.append(notification),
        }
    }

    fn buffer(&self, kind: StreamKind) -> AnyBuffer {
        match kind {
            StreamKind::Gaze | StreamKind::EyeOpenness => AnyBuffer::Gaze(self.gaze.clone()),
            StreamKind::EyeImage => AnyBuffer::EyeImage(self.eye_images.clone()),
            StreamKind::ExtSignal => AnyBuffer::ExtSignal(self.ext_signal.clone()),
            StreamKind::TimeSync => AnyBuffer::TimeSync(self.time_sync.clone()),
            StreamKind::Positioning => AnyBuffer::Positioning(self.positioning.clone()),
            StreamKind::Notification => AnyBuffer::Notification(self.notifications.clone()),
        }
    }
}

#[derive(Default)]
struct State {
    active: HashSet<StreamKind>,
    include_eye_openness: bool,
    eye_images_as_gif: bool,
}

/// The gaze partner that is started and stopped together with `kind` when
/// eye openness is merged into gaze.
fn merge_partner(kind: StreamKind) -> Option<StreamKind> {
    match kind {
        StreamKind::Gaze => Some(StreamKind::EyeOpenness),
        StreamKind::EyeOpenness => Some(StreamKind::Gaze),
        _ => None,
    }
}

pub struct Session {
    source: Arc<dyn EyeTrackerSource>,
    recorders: Arc<Recorders>,
    state: Mutex<State>,
}

impl Session {
    pub fn new(source: Arc<dyn EyeTrackerSource>) -> Session {
        // buffers start empty, `start` reserves per-kind capacity
        Session {
            source,
            recorders: Arc::new(Recorders {
                gaze: Arc::new(TimeSeriesBuffer::new()),
                eye_images: Arc::new(TimeSeriesBuffer::new()),
                ext_signal: Arc::new(TimeSeriesBuffer::new()),
                time_sync: Arc::new(TimeSeriesBuffer::new()),
                positioning: Arc::new(TimeSeriesBuffer::new()),
                notifications: Arc::new(TimeSeriesBuffer::new()),
                stager: DualSourceStager::new(false),
            }),
            state: Mutex::new(State::default()),
        }
    }

    pub fn info(&self) -> TrackerInfo {
        self.source.info()
    }

    /// Start recording `kind`. Returns whether anything was started; a
    /// stream that is already recording is left alone.
    ///
    /// `as_gif` selects the eye image variant and is ignored for other
    /// kinds. Asking for the other variant while eye images are recording
    /// resubscribes.
    pub fn start(
        &self,
        kind: StreamKind,
        initial_capacity: Option<usize>,
        as_gif: Option<bool>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        self.start_locked(&mut state, kind, initial_capacity, as_gif)
    }

    fn start_locked(
        &self,
        state: &mut State,
        kind: StreamKind,
        initial_capacity: Option<usize>,
        as_gif: Option<bool>,
    ) -> Result<bool> {
        let as_gif = as_gif.unwrap_or(false);
        let mut started = false;

        let resubscribe = kind == StreamKind::EyeImage
            && state.active.contains(&kind)
            && state.eye_images_as_gif != as_gif;
        if resubscribe {
            debug!("switching eye images to gif={}", as_gif);
            self.source.unsubscribe(kind)?;
            state.active.remove(&kind);
        }

        if !state.active.contains(&kind) {
            let capacity = initial_capacity.unwrap_or_else(|| kind.default_capacity());
            self.recorders.buffer(kind).reserve(capacity);

            self.source.subscribe(kind, as_gif, self.callback())?;
            state.active.insert(kind);
            if kind == StreamKind::EyeImage {
                state.eye_images_as_gif = as_gif;
            }
            self.update_merging(state);
            debug!("started {} stream", kind);
            started = true;
        }

        if state.include_eye_openness {
            if let Some(partner) = merge_partner(kind) {
                if !state.active.contains(&partner) {
                    started |= self.start_locked(state, partner, initial_capacity, None)?;
                }
            }
        }
        Ok(started)
    }

    pub fn is_active(&self, kind: StreamKind) -> bool {
        self.state.lock().active.contains(&kind)
    }

    /// Stop recording `kind`, optionally dropping what it buffered. Returns
    /// whether anything was stopped.
    pub fn stop(&self, kind: StreamKind, clear_buffer: Option<bool>) -> Result<bool> {
        let mut state = self.state.lock();
        self.stop_locked(&mut state, kind, clear_buffer.unwrap_or(false))
    }

    fn stop_locked(&self, state: &mut State, kind: StreamKind, clear_buffer: bool) -> Result<bool> {
        let mut stopped = false;
        if state.active.contains(&kind) {
            self.source.unsubscribe(kind)?;
            state.active.remove(&kind);
            self.update_merging(state);
            debug!("stopped {} stream", kind);
            stopped = true;
        }

        if clear_buffer {
            self.recorders.buffer(kind).clear();
        }

        if state.include_eye_openness {
            if let Some(partner) = merge_partner(kind) {
                if state.active.contains(&partner) {
                    stopped |= self.stop_locked(state, partner, clear_buffer)?;
                }
            }
        }
        Ok(stopped)
    }

    pub fn include_eye_openness_in_gaze(&self) -> bool {
        self.state.lock().include_eye_openness
    }

    /// Merge eye openness into gaze samples. Returns the previous setting.
    /// While gaze is recording this starts or stops the eye openness feed.
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
            self.stop_locked(&mut state, StreamKind::EyeOpenness, false)?;
        } else if gaze && include && !openness {
            self.start_locked(&mut state, StreamKind::EyeOpenness, None, None)?;
        }
        Ok(previous)
    }

    fn callback(&self) -> Callback {
        let recorders = self.recorders.clone();
        Arc::new(move |event| recorders.route(event))
    }

    /// Merge only while both halves are subscribed. Leaving merge mode moves
    /// any half-filled samples into the gaze buffer.
    fn update_merging(&self, state: &State) {
        let merging = state.active.contains(&StreamKind::Gaze)
            && state.active.contains(&StreamKind::EyeOpenness);
        if merging != self.recorders.stager.is_merging() {
            let flushed = self.recorders.stager.set_merging(merging);
            self.recorders.gaze.extend(flushed);
        }
    }

    /// Typed handle on the buffer that stores `S`.
    pub fn buffer<S: Recorded>(&self) -> Result<Arc<TimeSeriesBuffer<S>>> {
        let owner = format!("session of {}", self.source.info().serial_number);
        self.recorders.buffer(S::KIND).typed::<S>(&owner)
    }

    /// Remove up to `n` samples (default all) from `side` (default start).
    pub fn consume_n(&self, kind: StreamKind, n: Option<usize>, side: Option<BufferSide>) -> Samples {
        self.recorders
            .buffer(kind)
            .consume_n(n.unwrap_or(ALL), side.unwrap_or(BufferSide::Start))
    }

    /// Copy up to `n` samples (default one) from `side` (default end).
    pub fn peek_n(&self, kind: StreamKind, n: Option<usize>, side: Option<BufferSide>) -> Samples {
        self.recorders
            .buffer(kind)
            .peek_n(n.unwrap_or(1), side.unwrap_or(BufferSide::End))
    }

    pub fn consume_time_range(
        &self,
        kind: StreamKind,
        t0: Option<i64>,
        t1: Option<i64>,
    ) -> Result<Samples> {
        self.recorders.buffer(kind).consume_time_range(
            t0.unwrap_or(TIME_MIN),
            t1.unwrap_or(TIME_MAX),
            Clock::Local,
        )
    }

    pub fn peek_time_range(
        &self,
        kind: StreamKind,
        t0: Option<i64>,
        t1: Option<i64>,
    ) -> Result<Samples> {
        self.recorders.buffer(kind).peek_time_range(
            t0.unwrap_or(TIME_MIN),
            t1.unwrap_or(TIME_MAX),
            Clock::Local,
        )
    }

    pub fn clear(&self, kind: StreamKind) {
        self.recorders.buffer(kind).clear()
    }

    pub fn clear_time_range(&self, kind: StreamKind, t0: Option<i64>, t1: Option<i64>) -> Result<()> {
        self.recorders.buffer(kind).clear_time_range(
            t0.unwrap_or(TIME_MIN),
            t1.unwrap_or(TIME_MAX),
            Clock::Local,
        )
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.include_eye_openness = false;
        let active: Vec<StreamKind> = state.active.iter().copied().collect();
        for kind in active {
            if let Err(e) = self.stop_locked(&mut state, kind, false) {
                warn!("failed to stop {} while closing session: {}", kind, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::source::ManualSource;

    fn tracker(eye_openness: bool) -> Arc<ManualSource> {
        Arc::new(ManualSource::new(TrackerInfo {
            serial_number: "TEST-1".to_string(),
            model: "test".to_string(),
            firmware_version: "0".to_string(),
            tracking_mode: "human".to_string(),
            frequency: 600.0,
            has_eye_openness: eye_openness,
            has_eye_images: true,
            has_external_signal: true,
        }))
    }

    fn gaze(t: i64) -> SourceEvent {
        let eye = EyeGaze {
            gaze_point_on_display_area: Point2 { x: 0.1, y: 0.2 },
            gaze_point_in_user_coordinates: Point3 {
                x: 1.0,
                y: 2.0,
                z: 3.0,
            },
            gaze_point_validity: Validity::Valid,
            pupil_diameter: 3.0,
            pupil_validity: Validity::Valid,
            gaze_origin_in_user_coordinates: Point3 {
                x: 4.0,
                y: 5.0,
                z: 6.0,
            },
            gaze_origin_validity: Validity::Valid,
        };
        SourceEvent::Gaze(GazeData {
            left_eye: eye,
            right_eye: eye,
            device_time_stamp: t,
            system_time_stamp: t,
        })
    }

    fn openness(t: i64) -> SourceEvent {
        SourceEvent::EyeOpenness(EyeOpennessData {
            left_diameter: 10.0,
            left_validity: Validity::Valid,
            right_diameter: 10.0,
            right_validity: Validity::Valid,
            device_time_stamp: t,
            system_time_stamp: t,
        })
    }

    fn gaze_times(samples: Samples) -> Vec<i64> {
        match samples {
            Samples::Gaze(v) => v.iter().map(|s| s.device_time_stamp).collect(),
            other => panic!("expected gaze samples, got {}", other.kind()),
        }
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let source = tracker(true);
        let session = Session::new(source.clone());

        assert!(session.start(StreamKind::TimeSync, None, None).unwrap());
        assert!(!session.start(StreamKind::TimeSync, None, None).unwrap());
        assert!(session.is_active(StreamKind::TimeSync));
        assert!(source.is_subscribed(StreamKind::TimeSync));

        assert!(session.stop(StreamKind::TimeSync, None).unwrap());
        assert!(!session.stop(StreamKind::TimeSync, None).unwrap());
        assert!(!session.is_active(StreamKind::TimeSync));
        assert!(!source.is_subscribed(StreamKind::TimeSync));
    }

    #[test]
    fn consume_and_peek_defaults_differ() {
        let source = tracker(false);
        let session = Session::new(source.clone());
        session.start(StreamKind::Gaze, Some(16), None).unwrap();
        for t in &[10, 20, 30] {
            assert!(source.deliver(gaze(*t)));
        }

        assert_eq!(gaze_times(session.peek_n(StreamKind::Gaze, None, None)), vec![30]);
        assert_eq!(
            gaze_times(session.consume_n(StreamKind::Gaze, None, None)),
            vec![10, 20, 30]
        );
        assert!(session.peek_n(StreamKind::Gaze, None, None).is_empty());
    }

    #[test]
    fn stop_can_clear_the_buffer() {
        let source = tracker(false);
        let session = Session::new(source.clone());
        session.start(StreamKind::Gaze, None, None).unwrap();
        source.deliver(gaze(1));

        session.stop(StreamKind::Gaze, None).unwrap();
        assert_eq!(session.peek_n(StreamKind::Gaze, Some(ALL), None).len(), 1);
        assert!(!source.deliver(gaze(2)));

        session.stop(StreamKind::Gaze, Some(true)).unwrap();
        assert!(session.peek_n(StreamKind::Gaze, Some(ALL), None).is_empty());
    }

    #[test]
    fn merged_gaze_and_eye_openness() {
        let source = tracker(true);
        let session = Session::new(source.clone());
        assert!(!session.set_include_eye_openness_in_gaze(true).unwrap());

        session.start(StreamKind::Gaze, None, None).unwrap();
        assert!(session.is_active(StreamKind::EyeOpenness));

        source.deliver(gaze(100));
        source.deliver(openness(100));
        source.deliver(openness(200));
        source.deliver(gaze(200));

        let samples = session.buffer::<GazeSample>().unwrap().consume_n(ALL, BufferSide::Start);
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.has_gaze() && s.has_eye_openness()));
    }

    #[test]
    fn disabling_merge_flushes_staged_halves_into_gaze() {
        let source = tracker(true);
        let session = Session::new(source.clone());
        session.set_include_eye_openness_in_gaze(true).unwrap();
        session.start(StreamKind::Gaze, None, None).unwrap();

        source.deliver(gaze(100));
        assert!(session.peek_n(StreamKind::Gaze, None, None).is_empty());

        assert!(session.set_include_eye_openness_in_gaze(false).unwrap());
        assert!(!session.is_active(StreamKind::EyeOpenness));
        assert!(session.is_active(StreamKind::Gaze));
        assert_eq!(gaze_times(session.consume_n(StreamKind::Gaze, None, None)), vec![100]);
    }

    #[test]
    fn merge_partner_stops_together() {
        let source = tracker(true);
        let session = Session::new(source.clone());
        session.set_include_eye_openness_in_gaze(true).unwrap();
        session.start(StreamKind::EyeOpenness, None, None).unwrap();
        assert!(session.is_active(StreamKind::Gaze));

        assert!(session.stop(StreamKind::Gaze, None).unwrap());
        assert!(!session.is_active(StreamKind::EyeOpenness));
        assert!(!source.is_subscribed(StreamKind::EyeOpenness));
    }

    #[test]
    fn eye_openness_needs_capable_tracker() {
        let session = Session::new(tracker(false));
        assert!(session.set_include_eye_openness_in_gaze(true).is_err());
        assert!(!session.include_eye_openness_in_gaze());
        assert!(session.start(StreamKind::EyeOpenness, None, None).is_err());
        assert!(!session.is_active(StreamKind::EyeOpenness));
    }

    #[test]
    fn eye_image_variant_switch_resubscribes() {
        let source = tracker(false);
        let session = Session::new(source.clone());
        session.start(StreamKind::EyeImage, None, None).unwrap();
        assert_eq!(source.eye_images_as_gif(), Some(false));

        assert!(!session.start(StreamKind::EyeImage, None, Some(false)).unwrap());
        assert!(session.start(StreamKind::EyeImage, None, Some(true)).unwrap());
        assert_eq!(source.eye_images_as_gif(), Some(true));
    }

    #[test]
    fn positioning_has_no_time_ranges() {
        let source = tracker(false);
        let session = Session::new(source.clone());
        session.start(StreamKind::Positioning, None, None).unwrap();
        source.deliver(SourceEvent::Positioning(Positioning {
            left_eye: UserPosition {
                position: Point3 {
                    x: 0.5,
                    y: 0.5,
                    z: 0.5,
                },
                validity: Validity::Valid,
            },
            right_eye: UserPosition {
                position: Point3::NAN,
                validity: Validity::Invalid,
            },
        }));

        assert!(session.consume_time_range(StreamKind::Positioning, None, None).is_err());
        assert!(session.peek_time_range(StreamKind::Positioning, None, None).is_err());
        assert!(session.clear_time_range(StreamKind::Positioning, None, None).is_err());
        assert_eq!(session.peek_n(StreamKind::Positioning, None, None).len(), 1);

        session.clear(StreamKind::Positioning);
        assert!(session.peek_n(StreamKind::Positioning, None, None).is_empty());
    }

    #[test]
    fn time_range_on_device_clock() {
        let source = tracker(false);
        let session = Session::new(source.clone());
        session.start(StreamKind::ExtSignal, None, None).unwrap();
        for t in &[10, 20, 30, 40, 50] {
            source.deliver(SourceEvent::ExtSignal(ExtSignal {
                device_time_stamp: *t,
                system_time_stamp: *t + 5,
                value: 1,
                change_type: ExtSignalChange::ValueChanged,
            }));
        }

        match session
            .consume_time_range(StreamKind::ExtSignal, Some(15), Some(45))
            .unwrap()
        {
            Samples::ExtSignal(v) => assert_eq!(v.len(), 3),
            other => panic!("unexpected {}", other.kind()),
        }
        session.clear_time_range(StreamKind::ExtSignal, None, Some(10)).unwrap();
        assert_eq!(session.peek_n(StreamKind::ExtSignal, Some(ALL), None).len(), 1);
    }

    #[test]
    fn dropping_the_session_unsubscribes() {
        let source = tracker(true);
        {
            let session = Session::new(source.clone());
            session.set_include_eye_openness_in_gaze(true).unwrap();
            session.start(StreamKind::Gaze, None, None).unwrap();
            session.start(StreamKind::Notification, None, None).unwrap();
        }
        for kind in StreamKind::ALL.iter() {
            assert!(!source.is_subscribed(*kind));
        }
    }

    #[test]
    fn stopping_waits_for_deliveries_in_flight() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let source = tracker(false);
        let session = Session::new(source.clone());
        session.start(StreamKind::TimeSync, None, None).unwrap();
        let buffer = session.buffer::<TimeSync>().unwrap();
        let running = AtomicBool::new(true);

        crossbeam_utils::thread::scope(|s| {
            s.spawn(|_| {
                let mut t = 0;
                while running.load(Ordering::Acquire) {
                    source.deliver(SourceEvent::TimeSync(TimeSync {
                        system_request_time_stamp: t,
                        device_time_stamp: t,
                        system_response_time_stamp: t,
                    }));
                    t += 1;
                }
            });

            while buffer.len() < 100 {
                std::thread::yield_now();
            }
            assert!(session.stop(StreamKind::TimeSync, Some(true)).unwrap());
            assert!(buffer.is_empty());
            std::thread::sleep(std::time::Duration::from_millis(10));
            assert!(buffer.is_empty());
            running.store(false, Ordering::Release);
        })
        .unwrap();
    }
}
