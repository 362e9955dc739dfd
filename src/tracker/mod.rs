pub mod session;
pub mod source;
pub mod synthetic;
pub mod types;

pub use session::Session;
pub use source::{Callback, EyeTrackerSource, ManualSource, SourceEvent, TrackerInfo};
pub use synthetic::{SyntheticConfig, SyntheticTracker};
