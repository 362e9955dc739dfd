//! How each networked sample shape maps onto transport channels.
//!
//! The gaze layout is fixed for compatibility with existing recordings:
//! 18 channels per eye (left first) followed by the device time in seconds,
//! 37 doubles in total.

use super::{Acquisition, ChannelDesc, ChannelFormat, Channels, StreamInfo};
use crate::buffer::Timestamped;
use crate::error::{Error, Result};
use crate::stream::StreamKind;
use crate::tracker::source::TrackerInfo;
use crate::tracker::types::*;

pub const GAZE_CHANNELS: usize = 37;
pub const EXT_SIGNAL_CHANNELS: usize = 4;
pub const TIME_SYNC_CHANNELS: usize = 3;
pub const POSITIONING_CHANNELS: usize = 8;

/// A sample shape with a channel layout.
pub trait ChannelLayout: Timestamped {
    const FORMAT: ChannelFormat;
    const COUNT: usize;

    fn to_channels(&self) -> Channels;

    /// Rebuild a sample. `sent_at` is the sender timestamp in microseconds,
    /// standing in for fields the layout does not carry.
    fn from_channels(channels: &Channels, sent_at: i64) -> Result<Self>;

    /// Sender timestamp to push with, microseconds on the sender clock.
    /// `None` lets the transport stamp the sample.
    fn push_time(&self) -> Option<i64>;
}

pub fn micros_to_seconds(t: i64) -> f64 {
    t as f64 / 1e6
}

pub fn seconds_to_micros(t: f64) -> i64 {
    (t * 1e6).round() as i64
}

fn check_shape(channels: &Channels, kind: StreamKind, format: ChannelFormat, count: usize) -> Result<()> {
    if channels.format() != format || channels.len() != count {
        return Err(Error::Decode(format!(
            "{} sample needs {} {} channels, got {} {}",
            kind,
            count,
            format,
            channels.len(),
            channels.format()
        )));
    }
    Ok(())
}

fn flag(b: bool) -> f64 {
    match b {
        true => 1.0,
        false => 0.0,
    }
}

fn gaze_eye_channels(eye: &EyeData, out: &mut Vec<f64>) {
    let gp = &eye.gaze_point;
    out.extend_from_slice(&[
        gp.on_display_area.x as f64,
        gp.on_display_area.y as f64,
        gp.in_user_coordinates.x as f64,
        gp.in_user_coordinates.y as f64,
        gp.in_user_coordinates.z as f64,
        flag(gp.validity.is_valid()),
        flag(gp.available),
        eye.pupil.diameter as f64,
        flag(eye.pupil.validity.is_valid()),
        flag(eye.pupil.available),
        eye.gaze_origin.in_user_coordinates.x as f64,
        eye.gaze_origin.in_user_coordinates.y as f64,
        eye.gaze_origin.in_user_coordinates.z as f64,
        flag(eye.gaze_origin.validity.is_valid()),
        flag(eye.gaze_origin.available),
        eye.eye_openness.diameter as f64,
        flag(eye.eye_openness.validity.is_valid()),
        flag(eye.eye_openness.available),
    ]);
}

fn gaze_eye_from(v: &[f64]) -> EyeData {
    let valid = |x: f64| Validity::from_flag(x == 1.0);
    let point3 = |i: usize| Point3 {
        x: v[i] as f32,
        y: v[i + 1] as f32,
        z: v[i + 2] as f32,
    };
    EyeData {
        gaze_point: GazePoint {
            on_display_area: Point2 {
                x: v[0] as f32,
                y: v[1] as f32,
            },
            in_user_coordinates: point3(2),
            validity: valid(v[5]),
            available: v[6] == 1.0,
        },
        pupil: Pupil {
            diameter: v[7] as f32,
            validity: valid(v[8]),
            available: v[9] == 1.0,
        },
        gaze_origin: GazeOrigin {
            in_user_coordinates: point3(10),
            validity: valid(v[13]),
            available: v[14] == 1.0,
        },
        eye_openness: EyeOpenness {
            diameter: v[15] as f32,
            validity: valid(v[16]),
            available: v[17] == 1.0,
        },
    }
}

impl ChannelLayout for GazeSample {
    const FORMAT: ChannelFormat = ChannelFormat::Double64;
    const COUNT: usize = GAZE_CHANNELS;

    fn to_channels(&self) -> Channels {
        let mut v = Vec::with_capacity(GAZE_CHANNELS);
        gaze_eye_channels(&self.left_eye, &mut v);
        gaze_eye_channels(&self.right_eye, &mut v);
        v.push(micros_to_seconds(self.device_time_stamp));
        Channels::Double64(v)
    }

    fn from_channels(channels: &Channels, sent_at: i64) -> Result<GazeSample> {
        check_shape(channels, Self::KIND, Self::FORMAT, Self::COUNT)?;
        let v = match channels {
            Channels::Double64(v) => v,
            _ => return Err(Error::Decode("gaze channels must be double64".to_string())),
        };
        Ok(GazeSample {
            left_eye: gaze_eye_from(&v[0..18]),
            right_eye: gaze_eye_from(&v[18..36]),
            device_time_stamp: seconds_to_micros(v[36]),
            system_time_stamp: sent_at,
        })
    }

    fn push_time(&self) -> Option<i64> {
        Some(self.system_time_stamp)
    }
}

impl ChannelLayout for ExtSignal {
    const FORMAT: ChannelFormat = ChannelFormat::Int64;
    const COUNT: usize = EXT_SIGNAL_CHANNELS;

    fn to_channels(&self) -> Channels {
        Channels::Int64(vec![
            self.device_time_stamp,
            self.system_time_stamp,
            self.value as i64,
            self.change_type.code(),
        ])
    }

    fn from_channels(channels: &Channels, _sent_at: i64) -> Result<ExtSignal> {
        check_shape(channels, Self::KIND, Self::FORMAT, Self::COUNT)?;
        let v = match channels {
            Channels::Int64(v) => v,
            _ => return Err(Error::Decode("external signal channels must be int64".to_string())),
        };
        let change_type = ExtSignalChange::from_code(v[3])
            .ok_or_else(|| Error::Decode(format!("unknown external signal change type {}", v[3])))?;
        Ok(ExtSignal {
            device_time_stamp: v[0],
            system_time_stamp: v[1],
            value: v[2] as u32,
            change_type,
        })
    }

    fn push_time(&self) -> Option<i64> {
        Some(self.system_time_stamp)
    }
}

impl ChannelLayout for TimeSync {
    const FORMAT: ChannelFormat = ChannelFormat::Int64;
    const COUNT: usize = TIME_SYNC_CHANNELS;

    fn to_channels(&self) -> Channels {
        Channels::Int64(vec![
            self.system_request_time_stamp,
            self.device_time_stamp,
            self.system_response_time_stamp,
        ])
    }

    fn from_channels(channels: &Channels, _sent_at: i64) -> Result<TimeSync> {
        check_shape(channels, Self::KIND, Self::FORMAT, Self::COUNT)?;
        let v = match channels {
            Channels::Int64(v) => v,
            _ => return Err(Error::Decode("time sync channels must be int64".to_string())),
        };
        Ok(TimeSync {
            system_request_time_stamp: v[0],
            device_time_stamp: v[1],
            system_response_time_stamp: v[2],
        })
    }

    fn push_time(&self) -> Option<i64> {
        Some(self.system_request_time_stamp)
    }
}

impl ChannelLayout for Positioning {
    const FORMAT: ChannelFormat = ChannelFormat::Float32;
    const COUNT: usize = POSITIONING_CHANNELS;

    fn to_channels(&self) -> Channels {
        let eye = |e: &UserPosition| {
            [
                e.position.x,
                e.position.y,
                e.position.z,
                if e.validity.is_valid() { 1.0 } else { 0.0 },
            ]
        };
        let mut v = Vec::with_capacity(POSITIONING_CHANNELS);
        v.extend_from_slice(&eye(&self.left_eye));
        v.extend_from_slice(&eye(&self.right_eye));
        Channels::Float32(v)
    }

    fn from_channels(channels: &Channels, _sent_at: i64) -> Result<Positioning> {
        check_shape(channels, Self::KIND, Self::FORMAT, Self::COUNT)?;
        let v = match channels {
            Channels::Float32(v) => v,
            _ => return Err(Error::Decode("positioning channels must be float32".to_string())),
        };
        let eye = |i: usize| UserPosition {
            position: Point3 {
                x: v[i],
                y: v[i + 1],
                z: v[i + 2],
            },
            validity: Validity::from_flag(v[i + 3] == 1.0),
        };
        Ok(Positioning {
            left_eye: eye(0),
            right_eye: eye(4),
        })
    }

    fn push_time(&self) -> Option<i64> {
        None
    }
}

fn desc(
    label: String,
    eye: Option<&'static str>,
    content: Option<&'static str>,
    unit: Option<&'static str>,
) -> ChannelDesc {
    ChannelDesc {
        label,
        eye,
        content,
        unit,
    }
}

/// (field path, content type, unit) of the per-eye gaze channels.
const GAZE_EYE_FIELDS: [(&str, Option<&str>, Option<&str>); 18] = [
    ("x.position_on_display_area.gaze_point", Some("ScreenX"), Some("normalized")),
    ("y.position_on_display_area.gaze_point", Some("ScreenY"), Some("normalized")),
    ("x.position_in_user_coordinates.gaze_point", Some("IntersectionX"), Some("mm")),
    ("y.position_in_user_coordinates.gaze_point", Some("IntersectionY"), Some("mm")),
    ("z.position_in_user_coordinates.gaze_point", Some("IntersectionZ"), Some("mm")),
    ("valid.gaze_point", Some("ValidFlag"), Some("bool")),
    ("available.gaze_point", None, Some("bool")),
    ("diameter.pupil", Some("Diameter"), Some("mm")),
    ("valid.pupil", Some("ValidFlag"), Some("bool")),
    ("available.pupil", None, Some("bool")),
    ("x.position_in_user_coordinates.gaze_origin", Some("PositionX"), Some("mm")),
    ("y.position_in_user_coordinates.gaze_origin", Some("PositionY"), Some("mm")),
    ("z.position_in_user_coordinates.gaze_origin", Some("PositionZ"), Some("mm")),
    ("valid.gaze_origin", Some("ValidFlag"), Some("bool")),
    ("available.gaze_origin", None, Some("bool")),
    ("diameter.eye_openness", Some("EyeOpenness"), Some("mm")),
    ("valid.eye_openness", Some("ValidFlag"), Some("bool")),
    ("available.eye_openness", None, Some("bool")),
];

pub fn channel_descriptors(kind: StreamKind) -> Vec<ChannelDesc> {
    let stamp = |label: &str| desc(label.to_string(), None, Some("TimeStamp"), Some("us"));
    match kind {
        StreamKind::Gaze | StreamKind::EyeOpenness => {
            let mut channels = Vec::with_capacity(GAZE_CHANNELS);
            for eye in &["left", "right"] {
                for (field, content, unit) in GAZE_EYE_FIELDS.iter() {
                    channels.push(desc(format!("{}.{}_eye", field, eye), Some(*eye), *content, *unit));
                }
            }
            channels.push(desc("device_time_stamp".to_string(), None, Some("TimeStamp"), Some("s")));
            channels
        }
        StreamKind::ExtSignal => vec![
            stamp("device_time_stamp"),
            stamp("system_time_stamp"),
            desc("value".to_string(), None, Some("TTLIn"), None),
            desc("change_type".to_string(), None, Some("flag"), None),
        ],
        StreamKind::TimeSync => vec![
            stamp("system_request_time_stamp"),
            stamp("device_time_stamp"),
            stamp("system_response_time_stamp"),
        ],
        StreamKind::Positioning => {
            let mut channels = Vec::with_capacity(POSITIONING_CHANNELS);
            for eye in &["left", "right"] {
                for (axis, content) in &[("x", "PositionX"), ("y", "PositionY"), ("z", "PositionZ")] {
                    channels.push(desc(
                        format!("{}.user_position.{}_eye", axis, eye),
                        Some(*eye),
                        Some(*content),
                        Some("normalized"),
                    ));
                }
                channels.push(desc(
                    format!("valid.user_position.{}_eye", eye),
                    Some(*eye),
                    Some("ValidFlag"),
                    Some("bool"),
                ));
            }
            channels
        }
        StreamKind::EyeImage | StreamKind::Notification => Vec::new(),
    }
}

/// Describe the stream a sender publishes for `kind` on `tracker`.
pub fn stream_info(kind: StreamKind, tracker: &TrackerInfo) -> Result<StreamInfo> {
    let (format, channel_count, nominal_rate) = match kind {
        StreamKind::Gaze | StreamKind::EyeOpenness => {
            (ChannelFormat::Double64, GAZE_CHANNELS, Some(tracker.frequency as f64))
        }
        StreamKind::ExtSignal => (ChannelFormat::Int64, EXT_SIGNAL_CHANNELS, None),
        StreamKind::TimeSync => (ChannelFormat::Int64, TIME_SYNC_CHANNELS, None),
        StreamKind::Positioning => (ChannelFormat::Float32, POSITIONING_CHANNELS, None),
        StreamKind::EyeImage | StreamKind::Notification => {
            return Err(Error::unsupported(kind, "publishing"))
        }
    };
    let kind = kind.storage();

    Ok(StreamInfo {
        name: super::stream_name(kind),
        kind,
        format,
        channel_count,
        nominal_rate,
        source_id: super::source_id(kind, &tracker.serial_number),
        acquisition: Acquisition {
            manufacturer: "Tobii".to_string(),
            model: tracker.model.clone(),
            serial_number: tracker.serial_number.clone(),
            firmware_version: tracker.firmware_version.clone(),
            tracking_mode: tracker.tracking_mode.clone(),
        },
        channels: channel_descriptors(kind),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> TrackerInfo {
        TrackerInfo {
            serial_number: "SN1".to_string(),
            model: "m".to_string(),
            firmware_version: "f".to_string(),
            tracking_mode: "human".to_string(),
            frequency: 300.0,
            has_eye_openness: true,
            has_eye_images: false,
            has_external_signal: true,
        }
    }

    #[test]
    fn gaze_channel_order() {
        let mut sample = GazeSample::new(2_500_000, 7_000_000);
        sample.left_eye.gaze_point = GazePoint {
            on_display_area: Point2 { x: 0.25, y: 0.75 },
            in_user_coordinates: Point3 {
                x: 1.0,
                y: 2.0,
                z: 3.0,
            },
            validity: Validity::Valid,
            available: true,
        };
        sample.right_eye.eye_openness = EyeOpenness {
            diameter: 9.5,
            validity: Validity::Invalid,
            available: true,
        };

        let v = match sample.to_channels() {
            Channels::Double64(v) => v,
            other => panic!("unexpected {:?}", other.format()),
        };
        assert_eq!(v.len(), GAZE_CHANNELS);
        assert_eq!(&v[0..7], &[0.25, 0.75, 1.0, 2.0, 3.0, 1.0, 1.0]);
        assert!(v[7].is_nan());
        assert_eq!(v[9], 0.0);
        assert_eq!(v[18 + 15], 9.5);
        assert_eq!(v[18 + 16], 0.0);
        assert_eq!(v[18 + 17], 1.0);
        assert_eq!(v[36], 2.5);
        assert_eq!(sample.push_time(), Some(7_000_000));
    }

    #[test]
    fn gaze_rebuilds_with_sender_time() {
        let mut sample = GazeSample::new(2_500_001, 7_000_000);
        sample.left_eye.pupil = Pupil {
            diameter: 3.25,
            validity: Validity::Valid,
            available: true,
        };
        let back = GazeSample::from_channels(&sample.to_channels(), 7_000_000).unwrap();
        assert_eq!(back.device_time_stamp, 2_500_001);
        assert_eq!(back.system_time_stamp, 7_000_000);
        assert_eq!(back.left_eye.pupil, sample.left_eye.pupil);
        assert!(!back.right_eye.gaze_origin.available);
        assert!(back.right_eye.gaze_origin.in_user_coordinates.x.is_nan());
    }

    #[test]
    fn wrong_shapes_are_rejected() {
        assert!(GazeSample::from_channels(&Channels::Double64(vec![0.0; 36]), 0).is_err());
        assert!(TimeSync::from_channels(&Channels::Float32(vec![0.0; 3]), 0).is_err());
        assert!(ExtSignal::from_channels(&Channels::Int64(vec![1, 2, 3, 99]), 0).is_err());
    }

    #[test]
    fn small_layouts() {
        let signal = ExtSignal {
            device_time_stamp: 10,
            system_time_stamp: 20,
            value: 1,
            change_type: ExtSignalChange::InitialValue,
        };
        assert_eq!(signal.to_channels(), Channels::Int64(vec![10, 20, 1, 1]));
        assert_eq!(ExtSignal::from_channels(&signal.to_channels(), 0).unwrap(), signal);

        let sync = TimeSync {
            system_request_time_stamp: 1,
            device_time_stamp: 2,
            system_response_time_stamp: 3,
        };
        assert_eq!(sync.push_time(), Some(1));
        assert_eq!(TimeSync::from_channels(&sync.to_channels(), 0).unwrap(), sync);

        let position = Positioning {
            left_eye: UserPosition {
                position: Point3 {
                    x: 0.1,
                    y: 0.2,
                    z: 0.3,
                },
                validity: Validity::Valid,
            },
            right_eye: UserPosition {
                position: Point3 {
                    x: 0.4,
                    y: 0.5,
                    z: 0.6,
                },
                validity: Validity::Invalid,
            },
        };
        assert_eq!(
            position.to_channels(),
            Channels::Float32(vec![0.1, 0.2, 0.3, 1.0, 0.4, 0.5, 0.6, 0.0])
        );
        assert_eq!(position.push_time(), None);
    }

    #[test]
    fn descriptors_match_channel_counts() {
        assert_eq!(channel_descriptors(StreamKind::Gaze).len(), GAZE_CHANNELS);
        assert_eq!(channel_descriptors(StreamKind::ExtSignal).len(), EXT_SIGNAL_CHANNELS);
        assert_eq!(channel_descriptors(StreamKind::TimeSync).len(), TIME_SYNC_CHANNELS);
        assert_eq!(channel_descriptors(StreamKind::Positioning).len(), POSITIONING_CHANNELS);

        let gaze = channel_descriptors(StreamKind::Gaze);
        assert_eq!(gaze[0].label, "x.position_on_display_area.gaze_point.left_eye");
        assert_eq!(gaze[18].eye, Some("right"));
        assert_eq!(gaze[36].label, "device_time_stamp");
    }

    #[test]
    fn eye_openness_publishes_as_gaze() {
        let info = stream_info(StreamKind::EyeOpenness, &tracker()).unwrap();
        assert_eq!(info.kind, StreamKind::Gaze);
        assert_eq!(info.source_id, "eyestream:gaze@SN1");
        assert_eq!(info.nominal_rate, Some(300.0));
        assert!(stream_info(StreamKind::EyeImage, &tracker()).is_err());
    }

    #[test]
    fn seconds_round_to_microseconds() {
        assert_eq!(seconds_to_micros(1000.0 + 0.005), 1_000_005_000);
        assert_eq!(seconds_to_micros(-0.25), -250_000);
        assert_eq!(micros_to_seconds(1_500_000), 1.5);
    }
}
