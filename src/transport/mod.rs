//! Transport session
//!
//! A [`Connector`] opens a network session for a [`StreamDescriptor`] and
//! hands back a [`FrameSource`], a pull-based sequence of frames that ends
//! with a [`TransportError`]. [`TransportSession`] wraps a source with the
//! connect and keepalive watchdogs and makes `close()` idempotent.

mod rtsp;

pub use rtsp::{classify_error, RtspConnector};

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::media::{Frame, StreamDescriptor};

/// An open session yielding frames as they arrive
#[async_trait]
pub trait FrameSource: Send {
    /// The descriptor with the codec parameters negotiated for this session
    fn descriptor(&self) -> &StreamDescriptor;

    /// Wait for the next frame. The sequence ends with an error, never with
    /// `None`: a server teardown is `TransportError{Unexpected}`.
    async fn next_frame(&mut self) -> Result<Frame, TransportError>;

    /// Release network resources. May be called more than once.
    async fn close(&mut self);
}

/// Opens sessions against a remote stream
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, descriptor: &StreamDescriptor) -> Result<Box<dyn FrameSource>, TransportError>;
}

/// A frame source guarded by the keepalive watchdog
pub struct TransportSession {
    source: Box<dyn FrameSource>,
    frame_timeout: Duration,
    closed: bool,
}

impl TransportSession {
    /// Open a session, bounded by the connect watchdog
    pub async fn open(
        connector: &dyn Connector,
        descriptor: &StreamDescriptor,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let connect_timeout = config.connect_timeout();
        let source = match tokio::time::timeout(connect_timeout, connector.open(descriptor)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportError::timeout(format!(
                    "no session with {} after {}s",
                    descriptor.url(),
                    connect_timeout.as_secs()
                )))
            }
        };

        debug!("Session open: {:?}", source.descriptor());
        Ok(Self {
            source,
            frame_timeout: config.frame_timeout(),
            closed: false,
        })
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        self.source.descriptor()
    }

    pub async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        if self.closed {
            return Err(TransportError::unexpected("session closed"));
        }
        match tokio::time::timeout(self.frame_timeout, self.source.next_frame()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(format!(
                "no frame for {}s",
                self.frame_timeout.as_secs()
            ))),
        }
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.source.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
