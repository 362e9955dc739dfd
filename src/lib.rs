pub mod buffer;
pub mod error;
pub mod net;
pub mod registry;
pub mod stager;
pub mod stream;
pub mod tracker;

pub use buffer::{BufferSide, Clock, TimeSeriesBuffer, Timestamped};
pub use error::{Error, Result};
pub use registry::{Handle, StreamRegistry};
pub use stream::StreamKind;
pub use tracker::session::Session;
