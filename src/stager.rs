//! Aligns gaze and eye openness callbacks into composite gaze samples.
//!
//! The tracker reports gaze and eye openness through two independent
//! callbacks that may run on different threads and in either order. Both
//! carry the same device timestamp for the same instant, so pending halves
//! are parked here until their partner arrives.

use log::*;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::tracker::types::{EyeOpennessData, GazeData, GazeSample};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Half {
    Gaze,
    EyeOpenness,
}

enum Part<'a> {
    Gaze(&'a GazeData),
    EyeOpenness(&'a EyeOpennessData),
}

impl<'a> Part<'a> {
    fn half(&self) -> Half {
        match self {
            Part::Gaze(_) => Half::Gaze,
            Part::EyeOpenness(_) => Half::EyeOpenness,
        }
    }

    fn device_time(&self) -> i64 {
        match self {
            Part::Gaze(g) => g.device_time_stamp,
            Part::EyeOpenness(o) => o.device_time_stamp,
        }
    }

    fn system_time(&self) -> i64 {
        match self {
            Part::Gaze(g) => g.system_time_stamp,
            Part::EyeOpenness(o) => o.system_time_stamp,
        }
    }

    fn apply(&self, sample: &mut GazeSample) {
        match self {
            Part::Gaze(g) => sample.apply_gaze(g),
            Part::EyeOpenness(o) => sample.apply_eye_openness(o),
        }
    }
}

/// A composite sample waiting for its second half.
struct StagingEntry {
    sample: GazeSample,
    has_gaze: bool,
    has_eye_openness: bool,
}

impl StagingEntry {
    fn has(&self, half: Half) -> bool {
        match half {
            Half::Gaze => self.has_gaze,
            Half::EyeOpenness => self.has_eye_openness,
        }
    }

    fn fill(&mut self, part: &Part<'_>) {
        part.apply(&mut self.sample);
        match part.half() {
            Half::Gaze => self.has_gaze = true,
            Half::EyeOpenness => self.has_eye_openness = true,
        }
    }
}

struct Staging {
    merging: bool,
    pending: VecDeque<StagingEntry>,
}

/// Merges the two halves of a gaze sample.
///
/// Every `receive_*` call returns the samples that became ready, in the order
/// they should be appended. The caller hands them to a buffer or an outlet
/// after this returns, so the staging lock is never held together with a
/// buffer lock.
pub struct DualSourceStager {
    staging: Mutex<Staging>,
}

impl Default for DualSourceStager {
    fn default() -> Self {
        DualSourceStager::new(false)
    }
}

impl DualSourceStager {
    pub fn new(merging: bool) -> DualSourceStager {
        DualSourceStager {
            staging: Mutex::new(Staging {
                merging,
                pending: VecDeque::new(),
            }),
        }
    }

    pub fn is_merging(&self) -> bool {
        self.staging.lock().merging
    }

    /// Switch merge mode. Turning it off releases every pending entry
    /// unmerged, oldest first.
    pub fn set_merging(&self, merging: bool) -> Vec<GazeSample> {
        let mut staging = self.staging.lock();
        staging.merging = merging;
        if merging {
            return Vec::new();
        }
        let flushed: Vec<GazeSample> = staging.pending.drain(..).map(|e| e.sample).collect();
        if !flushed.is_empty() {
            debug!("merge disabled, flushing {} staged samples", flushed.len());
        }
        flushed
    }

    /// Number of half-filled samples waiting for a partner.
    pub fn pending(&self) -> usize {
        self.staging.lock().pending.len()
    }

    pub fn receive_gaze(&self, gaze: &GazeData) -> Vec<GazeSample> {
        self.receive(Part::Gaze(gaze))
    }

    pub fn receive_eye_openness(&self, openness: &EyeOpennessData) -> Vec<GazeSample> {
        self.receive(Part::EyeOpenness(openness))
    }

    fn receive(&self, part: Part<'_>) -> Vec<GazeSample> {
        let time = part.device_time();
        let half = part.half();
        let mut ready = Vec::new();
        let mut staging = self.staging.lock();

        if !staging.merging {
            // leftovers from a merge period go out first
            ready.extend(staging.pending.drain(..).map(|e| e.sample));
            let mut sample = GazeSample::new(time, part.system_time());
            part.apply(&mut sample);
            ready.push(sample);
            return ready;
        }

        let mut i = 0;
        let mut matched = false;
        while i < staging.pending.len() {
            let entry = &staging.pending[i];
            if entry.sample.device_time_stamp == time {
                if let Some(mut entry) = staging.pending.remove(i) {
                    entry.fill(&part);
                    trace!("merged {:?} into staged sample at {}", half, time);
                    ready.push(entry.sample);
                }
                matched = true;
                break;
            }
            // this half already moved past an older entry that is still
            // missing it, so that entry will never be completed
            if entry.sample.device_time_stamp < time && !entry.has(half) {
                if let Some(orphan) = staging.pending.remove(i) {
                    trace!(
                        "releasing unmerged sample at {}",
                        orphan.sample.device_time_stamp
                    );
                    ready.push(orphan.sample);
                }
                continue;
            }
            i += 1;
        }

        if !matched {
            let mut entry = StagingEntry {
                sample: GazeSample::new(time, part.system_time()),
                has_gaze: false,
                has_eye_openness: false,
            };
            entry.fill(&part);
            staging.pending.push_back(entry);
        }
        ready
    }
}
