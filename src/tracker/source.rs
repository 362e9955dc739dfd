use log::*;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::types::*;
use crate::error::{Error, Result};
use crate::stream::StreamKind;

/// One callback delivery from an eye tracker.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceEvent {
    Gaze(GazeData),
    EyeOpenness(EyeOpennessData),
    EyeImage(EyeImage),
    ExtSignal(ExtSignal),
    TimeSync(TimeSync),
    Positioning(Positioning),
    Notification(Notification),
}

impl SourceEvent {
    pub fn kind(&self) -> StreamKind {
        match self {
            SourceEvent::Gaze(_) => StreamKind::Gaze,
            SourceEvent::EyeOpenness(_) => StreamKind::EyeOpenness,
            SourceEvent::EyeImage(_) => StreamKind::EyeImage,
            SourceEvent::ExtSignal(_) => StreamKind::ExtSignal,
            SourceEvent::TimeSync(_) => StreamKind::TimeSync,
            SourceEvent::Positioning(_) => StreamKind::Positioning,
            SourceEvent::Notification(_) => StreamKind::Notification,
        }
    }
}

/// Invoked on a thread owned by the source, possibly several at once.
pub type Callback = Arc<dyn Fn(SourceEvent) + Send + Sync>;

#[derive(Clone, Debug, PartialEq)]
pub struct TrackerInfo {
    pub serial_number: String,
    pub model: String,
    pub firmware_version: String,
    pub tracking_mode: String,
    /// Gaze output frequency in Hz.
    pub frequency: f32,
    pub has_eye_openness: bool,
    pub has_eye_images: bool,
    pub has_external_signal: bool,
}

impl TrackerInfo {
    pub fn supports(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::EyeOpenness => self.has_eye_openness,
            StreamKind::EyeImage => self.has_eye_images,
            StreamKind::ExtSignal => self.has_external_signal,
            _ => true,
        }
    }
}

/// Anything that can feed samples into a session or a sender.
///
/// Subscribing a kind that already has a callback replaces it.
/// Unsubscribing must not return while a callback for that kind is still
/// running, and must be idempotent.
pub trait EyeTrackerSource: Send + Sync {
    fn info(&self) -> TrackerInfo;

    /// `as_gif` only matters for eye images.
    fn subscribe(&self, kind: StreamKind, as_gif: bool, callback: Callback) -> Result<()>;

    fn unsubscribe(&self, kind: StreamKind) -> Result<()>;
}

/// A source driven by the host: samples are handed in through
/// [`ManualSource::deliver`] on the caller's thread. Used for replaying
/// recordings and for tests.
///
/// Each kind has its own slot. Deliveries hold it shared while the callback
/// runs, so unsubscribing waits for them to finish.
pub struct ManualSource {
    info: TrackerInfo,
    slots: HashMap<StreamKind, RwLock<Option<Subscriber>>>,
}

struct Subscriber {
    as_gif: bool,
    callback: Callback,
}

impl ManualSource {
    pub fn new(info: TrackerInfo) -> ManualSource {
        ManualSource {
            info,
            slots: StreamKind::ALL
                .iter()
                .map(|kind| (*kind, RwLock::new(None)))
                .collect(),
        }
    }

    fn slot(&self, kind: StreamKind) -> Option<&RwLock<Option<Subscriber>>> {
        self.slots.get(&kind)
    }

    pub fn is_subscribed(&self, kind: StreamKind) -> bool {
        self.slot(kind).map_or(false, |slot| slot.read().is_some())
    }

    /// Whether eye images were requested as GIF. `None` if not subscribed.
    pub fn eye_images_as_gif(&self) -> Option<bool> {
        self.slot(StreamKind::EyeImage)
            .and_then(|slot| slot.read().as_ref().map(|s| s.as_gif))
    }

    /// Hand `event` to its subscriber. Returns false when nobody listens.
    pub fn deliver(&self, event: SourceEvent) -> bool {
        let kind = event.kind();
        let slot = match self.slot(kind) {
            Some(slot) => slot.read(),
            None => return false,
        };
        match &*slot {
            Some(subscriber) => {
                (subscriber.callback)(event);
                true
            }
            None => {
                trace!("dropping {} event, not subscribed", kind);
                false
            }
        }
    }
}

impl EyeTrackerSource for ManualSource {
    fn info(&self) -> TrackerInfo {
        self.info.clone()
    }

    fn subscribe(&self, kind: StreamKind, as_gif: bool, callback: Callback) -> Result<()> {
        if !self.info.supports(kind) {
            return Err(Error::unsupported(kind, "subscribing"));
        }
        if let Some(slot) = self.slot(kind) {
            *slot.write() = Some(Subscriber { as_gif, callback });
        }
        Ok(())
    }

    fn unsubscribe(&self, kind: StreamKind) -> Result<()> {
        if let Some(slot) = self.slot(kind) {
            slot.write().take();
        }
        Ok(())
    }
}
