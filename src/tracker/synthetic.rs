//! A tracker that makes up plausible data, one thread per subscribed feed.

use crossbeam_channel::{select, tick, Receiver, Sender};
use log::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::source::{Callback, EyeTrackerSource, SourceEvent, TrackerInfo};
use super::types::*;
use crate::error::{Error, Result};
use crate::stream::StreamKind;

pub struct SyntheticConfig {
    pub serial_number: String,
    pub model: String,
    /// Gaze, eye openness and positioning rate in Hz.
    pub frequency: f32,
    pub eye_openness: bool,
    /// Device clock reading at construction, in microseconds.
    pub start_device_time: i64,
}

impl SyntheticConfig {
    /// A 600 Hz screen-based tracker with eye openness.
    pub fn spectrum(serial_number: &str) -> SyntheticConfig {
        SyntheticConfig {
            serial_number: serial_number.to_string(),
            model: "Tobii Pro Spectrum".to_string(),
            frequency: 600.0,
            eye_openness: true,
            start_device_time: 1_000_000,
        }
    }
}

/// Maps host time elapsed since construction onto the two tracker clocks,
/// quantized to a feed's period so parallel feeds stamp the same instants.
#[derive(Clone, Copy)]
struct DeviceClock {
    epoch: Instant,
    device_start: i64,
    system_start: i64,
}

impl DeviceClock {
    fn sample_index(&self, period: Duration) -> u64 {
        let period_us = (period.as_micros() as u64).max(1);
        self.epoch.elapsed().as_micros() as u64 / period_us
    }

    fn stamps(&self, index: u64, period: Duration) -> (i64, i64) {
        let offset = (index as u128 * period.as_micros()) as i64;
        (self.device_start + offset, self.system_start + offset)
    }
}

struct Feed {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct SyntheticTracker {
    info: TrackerInfo,
    clock: DeviceClock,
    feeds: Mutex<HashMap<StreamKind, Feed>>,
}

impl SyntheticTracker {
    pub fn new(config: SyntheticConfig) -> SyntheticTracker {
        let system_start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();

        SyntheticTracker {
            info: TrackerInfo {
                serial_number: config.serial_number,
                model: config.model,
                firmware_version: "synthetic".to_string(),
                tracking_mode: "human".to_string(),
                frequency: config.frequency,
                has_eye_openness: config.eye_openness,
                has_eye_images: true,
                has_external_signal: true,
            },
            clock: DeviceClock {
                epoch: Instant::now(),
                device_start: config.start_device_time,
                system_start,
            },
            feeds: Mutex::new(HashMap::new()),
        }
    }

    fn period(&self, kind: StreamKind) -> Duration {
        match kind {
            StreamKind::Gaze | StreamKind::EyeOpenness | StreamKind::Positioning => {
                Duration::from_secs_f64(1.0 / self.info.frequency.max(1.0) as f64)
            }
            StreamKind::EyeImage => Duration::from_millis(100),
            StreamKind::ExtSignal => Duration::from_millis(250),
            StreamKind::TimeSync => Duration::from_millis(500),
            StreamKind::Notification => Duration::from_secs(1),
        }
    }

    fn stop_feed(&self, kind: StreamKind, feed: Feed) {
        drop(feed.stop);
        if feed.handle.join().is_err() {
            error!("synthetic {} feed panicked", kind);
        }
        debug!("synthetic {} feed stopped", kind);
    }
}

impl EyeTrackerSource for SyntheticTracker {
    fn info(&self) -> TrackerInfo {
        self.info.clone()
    }

    fn subscribe(&self, kind: StreamKind, as_gif: bool, callback: Callback) -> Result<()> {
        if !self.info.supports(kind) {
            return Err(Error::unsupported(kind, "subscribing"));
        }

        let mut feeds = self.feeds.lock();
        if let Some(previous) = feeds.remove(&kind) {
            self.stop_feed(kind, previous);
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let generator = Generator {
            kind,
            as_gif,
            period: self.period(kind),
            frequency: self.info.frequency,
            clock: self.clock,
        };
        let handle = thread::Builder::new()
            .name(format!("synthetic-{}", kind.snake_case()))
            .spawn(move || generator.run(callback, stop_rx))
            .map_err(|e| Error::Device {
                code: e.raw_os_error().unwrap_or(-1),
                message: e.to_string(),
            })?;

        debug!("synthetic {} feed started", kind);
        feeds.insert(
            kind,
            Feed {
                stop: stop_tx,
                handle,
            },
        );
        Ok(())
    }

    fn unsubscribe(&self, kind: StreamKind) -> Result<()> {
        let feed = self.feeds.lock().remove(&kind);
        if let Some(feed) = feed {
            self.stop_feed(kind, feed);
        }
        Ok(())
    }
}

impl Drop for SyntheticTracker {
    fn drop(&mut self) {
        let feeds: Vec<(StreamKind, Feed)> = self.feeds.lock().drain().collect();
        for (kind, feed) in feeds {
            self.stop_feed(kind, feed);
        }
    }
}

struct Generator {
    kind: StreamKind,
    as_gif: bool,
    period: Duration,
    frequency: f32,
    clock: DeviceClock,
}

impl Generator {
    fn run(self, callback: Callback, stop: Receiver<()>) {
        let ticker = tick(self.period);
        let mut last = None;

        loop {
            select! {
                recv(stop) -> _ => break,
                recv(ticker) -> _ => {
                    let index = self.clock.sample_index(self.period);
                    if last != Some(index) {
                        last = Some(index);
                        callback(self.event(index));
                    }
                }
            }
        }
    }

    fn event(&self, index: u64) -> SourceEvent {
        let (device, system) = self.clock.stamps(index, self.period);
        // position along a slow circle, one revolution every 4 seconds
        let phase = (device as f64 / 4e6 * std::f64::consts::TAU) as f32;

        match self.kind {
            StreamKind::Gaze => {
                let eye = |dx: f32| EyeGaze {
                    gaze_point_on_display_area: Point2 {
                        x: 0.5 + 0.3 * phase.cos(),
                        y: 0.5 + 0.3 * phase.sin(),
                    },
                    gaze_point_in_user_coordinates: Point3 {
                        x: 150.0 * phase.cos(),
                        y: 100.0 + 90.0 * phase.sin(),
                        z: 50.0,
                    },
                    gaze_point_validity: Validity::Valid,
                    pupil_diameter: 3.5 + 0.2 * (phase * 3.0).sin(),
                    pupil_validity: Validity::Valid,
                    gaze_origin_in_user_coordinates: Point3 {
                        x: dx,
                        y: 0.0,
                        z: 620.0,
                    },
                    gaze_origin_validity: Validity::Valid,
                };
                SourceEvent::Gaze(GazeData {
                    left_eye: eye(-31.0),
                    right_eye: eye(31.0),
                    device_time_stamp: device,
                    system_time_stamp: system,
                })
            }
            StreamKind::EyeOpenness => {
                // blink for 150 ms every 3 s
                let blinking = device.rem_euclid(3_000_000) < 150_000;
                let (diameter, validity) = match blinking {
                    true => (0.5, Validity::Invalid),
                    false => (11.0, Validity::Valid),
                };
                SourceEvent::EyeOpenness(EyeOpennessData {
                    left_diameter: diameter,
                    left_validity: validity,
                    right_diameter: diameter,
                    right_validity: validity,
                    device_time_stamp: device,
                    system_time_stamp: system,
                })
            }
            StreamKind::EyeImage => {
                let (width, height) = (16u32, 8u32);
                let mut data: Vec<u8> = (0..width * height)
                    .map(|p| ((p + index as u32) % 256) as u8)
                    .collect();
                if self.as_gif {
                    let mut gif = b"GIF89a".to_vec();
                    gif.append(&mut data);
                    data = gif;
                }
                SourceEvent::EyeImage(EyeImage {
                    is_gif: self.as_gif,
                    device_time_stamp: device,
                    system_time_stamp: system,
                    bits_per_pixel: if self.as_gif { 0 } else { 8 },
                    padding_per_pixel: 0,
                    width: if self.as_gif { 0 } else { width },
                    height: if self.as_gif { 0 } else { height },
                    region_id: 0,
                    region_top: 0,
                    region_left: 0,
                    image_type: EyeImageType::Cropped,
                    camera_id: (index % 2) as i32,
                    data,
                })
            }
            StreamKind::ExtSignal => SourceEvent::ExtSignal(ExtSignal {
                device_time_stamp: device,
                system_time_stamp: system,
                value: (index % 2) as u32,
                change_type: ExtSignalChange::ValueChanged,
            }),
            StreamKind::TimeSync => SourceEvent::TimeSync(TimeSync {
                system_request_time_stamp: system - 150,
                device_time_stamp: device,
                system_response_time_stamp: system + 150,
            }),
            StreamKind::Positioning => {
                let sway = 0.05 * phase.sin();
                SourceEvent::Positioning(Positioning {
                    left_eye: UserPosition {
                        position: Point3 {
                            x: 0.45 + sway,
                            y: 0.5,
                            z: 0.5,
                        },
                        validity: Validity::Valid,
                    },
                    right_eye: UserPosition {
                        position: Point3 {
                            x: 0.55 + sway,
                            y: 0.5,
                            z: 0.5,
                        },
                        validity: Validity::Valid,
                    },
                })
            }
            StreamKind::Notification => {
                let mut notification =
                    Notification::new(system, NotificationType::GazeOutputFrequencyChanged);
                notification.output_frequency = Some(self.frequency);
                SourceEvent::Notification(notification)
            }
        }
    }
}
