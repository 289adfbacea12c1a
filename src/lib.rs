//! rtsp-recorder
//!
//! Records a live RTSP stream into rotating MP4 segments under a revocable
//! storage grant, reconnecting across network loss.

pub mod buffer;
pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod mux;
pub mod reconnect;
pub mod session;
pub mod status;
pub mod storage;
pub mod transport;

pub use config::Config;
pub use error::{ErrorKind, RecorderError, TransportError, TransportErrorKind};
pub use media::{Frame, StreamDescriptor};
pub use session::{ControlHandle, RecordingController, RecordingOutcome, SessionState};
pub use status::StatusEvent;
pub use storage::{DirectoryHandle, StorageHandle};
pub use transport::{Connector, RtspConnector};
