//! Sample payloads delivered by an eye tracker.
//!
//! Timestamps are microseconds. `device_time_stamp` is the tracker's own
//! clock, `system_time_stamp` the host clock the tracker synchronizes to.

use crate::buffer::{Clock, Timestamped};
use crate::stream::StreamKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validity {
    Invalid,
    Valid,
}

impl Default for Validity {
    fn default() -> Validity {
        Validity::Invalid
    }
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        *self == Validity::Valid
    }

    pub fn from_flag(valid: bool) -> Validity {
        match valid {
            true => Validity::Valid,
            false => Validity::Invalid,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    pub const NAN: Point2 = Point2 {
        x: f32::NAN,
        y: f32::NAN,
    };
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3 {
    pub const NAN: Point3 = Point3 {
        x: f32::NAN,
        y: f32::NAN,
        z: f32::NAN,
    };
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GazePoint {
    pub on_display_area: Point2,
    pub in_user_coordinates: Point3,
    pub validity: Validity,
    pub available: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pupil {
    /// Millimeters.
    pub diameter: f32,
    pub validity: Validity,
    pub available: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GazeOrigin {
    pub in_user_coordinates: Point3,
    pub validity: Validity,
    pub available: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EyeOpenness {
    /// Millimeters.
    pub diameter: f32,
    pub validity: Validity,
    pub available: bool,
}

impl Default for GazePoint {
    fn default() -> GazePoint {
        GazePoint {
            on_display_area: Point2::NAN,
            in_user_coordinates: Point3::NAN,
            validity: Validity::Invalid,
            available: false,
        }
    }
}

impl Default for Pupil {
    fn default() -> Pupil {
        Pupil {
            diameter: f32::NAN,
            validity: Validity::Invalid,
            available: false,
        }
    }
}

impl Default for GazeOrigin {
    fn default() -> GazeOrigin {
        GazeOrigin {
            in_user_coordinates: Point3::NAN,
            validity: Validity::Invalid,
            available: false,
        }
    }
}

impl Default for EyeOpenness {
    fn default() -> EyeOpenness {
        EyeOpenness {
            diameter: f32::NAN,
            validity: Validity::Invalid,
            available: false,
        }
    }
}

/// Everything known about one eye at one instant. Parts that were never
/// delivered stay NaN and `available == false`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EyeData {
    pub gaze_point: GazePoint,
    pub pupil: Pupil,
    pub gaze_origin: GazeOrigin,
    pub eye_openness: EyeOpenness,
}

/// Composite gaze sample, gaze and eye openness merged on device time.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GazeSample {
    pub left_eye: EyeData,
    pub right_eye: EyeData,
    pub device_time_stamp: i64,
    pub system_time_stamp: i64,
}

impl GazeSample {
    pub fn new(device_time_stamp: i64, system_time_stamp: i64) -> GazeSample {
        GazeSample {
            device_time_stamp,
            system_time_stamp,
            ..Default::default()
        }
    }

    pub fn has_gaze(&self) -> bool {
        self.left_eye.gaze_origin.available
    }

    pub fn has_eye_openness(&self) -> bool {
        self.left_eye.eye_openness.available
    }

    pub fn apply_gaze(&mut self, gaze: &GazeData) {
        apply_eye_gaze(&mut self.left_eye, &gaze.left_eye);
        apply_eye_gaze(&mut self.right_eye, &gaze.right_eye);
    }

    pub fn apply_eye_openness(&mut self, openness: &EyeOpennessData) {
        self.left_eye.eye_openness = EyeOpenness {
            diameter: openness.left_diameter,
            validity: openness.left_validity,
            available: true,
        };
        self.right_eye.eye_openness = EyeOpenness {
            diameter: openness.right_diameter,
            validity: openness.right_validity,
            available: true,
        };
    }
}

fn apply_eye_gaze(eye: &mut EyeData, gaze: &EyeGaze) {
    eye.gaze_point = GazePoint {
        on_display_area: gaze.gaze_point_on_display_area,
        in_user_coordinates: gaze.gaze_point_in_user_coordinates,
        validity: gaze.gaze_point_validity,
        available: true,
    };
    eye.pupil = Pupil {
        diameter: gaze.pupil_diameter,
        validity: gaze.pupil_validity,
        available: true,
    };
    eye.gaze_origin = GazeOrigin {
        in_user_coordinates: gaze.gaze_origin_in_user_coordinates,
        validity: gaze.gaze_origin_validity,
        available: true,
    };
}

impl Timestamped for GazeSample {
    const KIND: StreamKind = StreamKind::Gaze;

    fn timestamp(&self, _: Clock) -> i64 {
        self.device_time_stamp
    }
}

/// Raw per-eye gaze as the tracker reports it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EyeGaze {
    pub gaze_point_on_display_area: Point2,
    pub gaze_point_in_user_coordinates: Point3,
    pub gaze_point_validity: Validity,
    pub pupil_diameter: f32,
    pub pupil_validity: Validity,
    pub gaze_origin_in_user_coordinates: Point3,
    pub gaze_origin_validity: Validity,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GazeData {
    pub left_eye: EyeGaze,
    pub right_eye: EyeGaze,
    pub device_time_stamp: i64,
    pub system_time_stamp: i64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EyeOpennessData {
    pub left_diameter: f32,
    pub left_validity: Validity,
    pub right_diameter: f32,
    pub right_validity: Validity,
    pub device_time_stamp: i64,
    pub system_time_stamp: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EyeImageType {
    Full,
    Cropped,
    MultiRoi,
    Unknown,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EyeImage {
    /// `data` holds a GIF file rather than raw pixels.
    pub is_gif: bool,
    pub device_time_stamp: i64,
    pub system_time_stamp: i64,
    pub bits_per_pixel: u32,
    pub padding_per_pixel: u32,
    pub width: u32,
    pub height: u32,
    pub region_id: i32,
    pub region_top: i32,
    pub region_left: i32,
    pub image_type: EyeImageType,
    pub camera_id: i32,
    pub data: Vec<u8>,
}

impl Timestamped for EyeImage {
    const KIND: StreamKind = StreamKind::EyeImage;

    fn timestamp(&self, _: Clock) -> i64 {
        self.device_time_stamp
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtSignalChange {
    ValueChanged,
    InitialValue,
    ConnectionRestored,
}

impl ExtSignalChange {
    pub fn code(&self) -> i64 {
        match self {
            ExtSignalChange::ValueChanged => 0,
            ExtSignalChange::InitialValue => 1,
            ExtSignalChange::ConnectionRestored => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<ExtSignalChange> {
        match code {
            0 => Some(ExtSignalChange::ValueChanged),
            1 => Some(ExtSignalChange::InitialValue),
            2 => Some(ExtSignalChange::ConnectionRestored),
            _ => None,
        }
    }
}

/// TTL input change on the tracker's external signal port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtSignal {
    pub device_time_stamp: i64,
    pub system_time_stamp: i64,
    pub value: u32,
    pub change_type: ExtSignalChange,
}

impl Timestamped for ExtSignal {
    const KIND: StreamKind = StreamKind::ExtSignal;

    fn timestamp(&self, _: Clock) -> i64 {
        self.device_time_stamp
    }
}

/// One round trip of the tracker's clock synchronization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeSync {
    pub system_request_time_stamp: i64,
    pub device_time_stamp: i64,
    pub system_response_time_stamp: i64,
}

impl Timestamped for TimeSync {
    const KIND: StreamKind = StreamKind::TimeSync;

    fn timestamp(&self, _: Clock) -> i64 {
        self.device_time_stamp
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UserPosition {
    /// Normalized to the track box.
    pub position: Point3,
    pub validity: Validity,
}

/// Head position guide. Carries no timestamp.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Positioning {
    pub left_eye: UserPosition,
    pub right_eye: UserPosition,
}

impl Timestamped for Positioning {
    const KIND: StreamKind = StreamKind::Positioning;
    const TIME_RANGE: bool = false;

    fn timestamp(&self, _: Clock) -> i64 {
        0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationType {
    ConnectionLost,
    ConnectionRestored,
    CalibrationModeEntered,
    CalibrationModeLeft,
    CalibrationChanged,
    TrackBoxChanged,
    DisplayAreaChanged,
    GazeOutputFrequencyChanged,
    EyeTrackingModeChanged,
    DeviceFaults,
    DeviceWarnings,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DisplayArea {
    pub width: f32,
    pub height: f32,
    pub top_left: Point3,
    pub top_right: Point3,
    pub bottom_left: Point3,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub system_time_stamp: i64,
    pub notification_type: NotificationType,
    pub output_frequency: Option<f32>,
    pub display_area: Option<DisplayArea>,
    pub errors_or_warnings: Option<String>,
}

impl Notification {
    pub fn new(system_time_stamp: i64, notification_type: NotificationType) -> Notification {
        Notification {
            system_time_stamp,
            notification_type,
            output_frequency: None,
            display_area: None,
            errors_or_warnings: None,
        }
    }
}

impl Timestamped for Notification {
    const KIND: StreamKind = StreamKind::Notification;

    // notifications only carry the host clock
    fn timestamp(&self, _: Clock) -> i64 {
        self.system_time_stamp
    }
}
