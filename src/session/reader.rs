//! Network read loop
//!
//! Opens transport sessions through the reconnection policy, tags frames
//! with the current stream epoch and pushes them into the frame buffer.
//! Every session gets its own epoch: frames were lost while disconnected,
//! so the writer never splices two sessions into one segment.
//! Reports to the controller; never touches session state itself.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{FrameBuffer, PushOutcome, StreamEpoch};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::media::{Lane, StreamDescriptor};
use crate::reconnect::{Continuity, ContinuityGuard, ReconnectPolicy, RetryDecision};
use crate::transport::{Connector, TransportSession};

#[derive(Debug)]
pub(crate) enum ReaderEvent {
    Connected {
        descriptor: StreamDescriptor,
        /// `None` on the first connection of the run
        continuity: Option<Continuity>,
    },
    Lost {
        error: TransportError,
        attempt: u32,
        delay: Duration,
    },
    GaveUp(TransportError),
    FramesDropped {
        lane: Lane,
        frames: usize,
        keyframe: bool,
    },
}

pub(crate) struct ReadLoop {
    pub connector: Arc<dyn Connector>,
    pub descriptor: StreamDescriptor,
    pub transport: TransportConfig,
    pub policy: ReconnectPolicy,
    pub buffer: Arc<FrameBuffer>,
    pub events: mpsc::UnboundedSender<ReaderEvent>,
    pub cancel: CancellationToken,
}

struct Epochs {
    current: Option<Arc<StreamEpoch>>,
    next_id: u64,
}

impl Epochs {
    fn begin(&mut self, descriptor: &StreamDescriptor) -> Arc<StreamEpoch> {
        let epoch = Arc::new(StreamEpoch {
            id: self.next_id,
            descriptor: descriptor.clone(),
        });
        self.next_id += 1;
        self.current = Some(Arc::clone(&epoch));
        epoch
    }
}

impl ReadLoop {
    pub async fn run(mut self) {
        let mut epochs = Epochs {
            current: None,
            next_id: 0,
        };
        let mut guard = ContinuityGuard::default();
        let mut last_frame_at: Option<Instant> = None;

        while !self.cancel.is_cancelled() {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = TransportSession::open(self.connector.as_ref(), &self.descriptor, &self.transport) => result,
            };
            let mut session = match opened {
                Ok(session) => session,
                Err(error) => {
                    if self.retry(error).await {
                        continue;
                    }
                    break;
                }
            };

            let negotiated = session.descriptor().clone();
            let continuity = match epochs.current.as_ref() {
                None => {
                    guard.start(&negotiated);
                    None
                }
                Some(previous) => {
                    let outage = last_frame_at.map_or(Duration::ZERO, |at| at.elapsed());
                    Some(guard.on_reconnect(&previous.descriptor, &negotiated, outage))
                }
            };
            let epoch = epochs.begin(&negotiated);
            info!("Transport connected (epoch {}, {:?})", epoch.id, continuity);
            self.emit(ReaderEvent::Connected {
                descriptor: negotiated.clone(),
                continuity,
            });

            let mut first_frame = true;
            let error = loop {
                let next = tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    result = session.next_frame() => Some(result),
                };
                let mut frame = match next {
                    None => {
                        session.close().await;
                        return;
                    }
                    Some(Err(error)) => break error,
                    Some(Ok(frame)) => frame,
                };

                if first_frame {
                    first_frame = false;
                    self.policy.on_first_frame();
                }
                guard.admit(&mut frame);
                last_frame_at = Some(Instant::now());

                let lane = frame.lane;
                match self.buffer.push(&epoch, frame) {
                    PushOutcome::Queued => {}
                    PushOutcome::Evicted { frames, keyframe } => {
                        self.emit(ReaderEvent::FramesDropped { lane, frames, keyframe });
                    }
                    PushOutcome::Rejected { keyframe } => {
                        warn!("Dropped a {} frame larger than the buffer byte cap", lane);
                        self.emit(ReaderEvent::FramesDropped {
                            lane,
                            frames: 1,
                            keyframe,
                        });
                    }
                    PushOutcome::Closed => {
                        debug!("Frame buffer closed, read loop exiting");
                        session.close().await;
                        return;
                    }
                }
            };

            session.close().await;
            if !self.retry(error).await {
                break;
            }
        }
        debug!("Read loop finished");
    }

    /// Consult the policy after a failure. Returns false when the loop ends.
    async fn retry(&mut self, error: TransportError) -> bool {
        warn!("Transport error: {}", error);
        match self.policy.on_failure(&error) {
            RetryDecision::GiveUp => {
                warn!(
                    "Giving up after {} consecutive failures",
                    self.policy.consecutive_failures()
                );
                self.emit(ReaderEvent::GaveUp(error));
                false
            }
            RetryDecision::RetryNow => {
                self.emit(ReaderEvent::Lost {
                    error,
                    attempt: self.policy.consecutive_failures(),
                    delay: Duration::ZERO,
                });
                true
            }
            RetryDecision::RetryAfter(delay) => {
                info!("Reconnecting in {:.1}s", delay.as_secs_f64());
                self.emit(ReaderEvent::Lost {
                    error,
                    attempt: self.policy.consecutive_failures(),
                    delay,
                });
                tokio::select! {
                    _ = self.cancel.cancelled() => false,
                    _ = tokio::time::sleep(delay) => true,
                }
            }
        }
    }

    fn emit(&self, event: ReaderEvent) {
        let _ = self.events.send(event);
    }
}
