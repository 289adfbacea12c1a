//! Status events pushed to the lifecycle layer

use std::time::Duration;

use crate::media::Lane;
use crate::mux::SegmentInfo;
use crate::session::{RecordingOutcome, SessionState};

#[derive(Debug, Clone)]
pub enum StatusEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    SegmentStarted {
        index: u32,
        name: String,
    },
    SegmentClosed(SegmentInfo),
    Reconnecting {
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    /// The frame buffer overflowed and evicted frames
    FramesDropped {
        lane: Lane,
        frames: usize,
        keyframe: bool,
    },
    Finished(RecordingOutcome),
}

impl StatusEvent {
    /// Text for a persistent status notification, when this event changes it
    pub fn notification_text(&self) -> Option<String> {
        match self {
            StatusEvent::StateChanged { to, .. } => match to {
                SessionState::Idle | SessionState::Reconnecting => None,
                SessionState::Connecting => Some("Connecting to stream...".to_string()),
                SessionState::Streaming => Some("Recording".to_string()),
                SessionState::Finalizing => Some("Finishing recording...".to_string()),
                SessionState::Stopped => Some("Recording stopped".to_string()),
                SessionState::Failed(kind) => Some(format!("Recording failed: {}", kind)),
            },
            StatusEvent::SegmentStarted { index, .. } => Some(format!("Recording segment {}", index + 1)),
            StatusEvent::Reconnecting { delay, .. } => {
                if delay.is_zero() {
                    Some("Reconnecting...".to_string())
                } else {
                    Some(format!("Reconnecting in {}s...", delay.as_secs_f64().ceil() as u64))
                }
            }
            StatusEvent::Finished(outcome) => {
                let n = outcome.segments().len();
                Some(format!(
                    "Saved {} segment{}",
                    n,
                    if n == 1 { "" } else { "s" }
                ))
            }
            StatusEvent::SegmentClosed(_) | StatusEvent::FramesDropped { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_notification_text() {
        let started = StatusEvent::SegmentStarted {
            index: 0,
            name: "rec_20260101_000000_seg0000.mp4".into(),
        };
        assert_eq!(started.notification_text().as_deref(), Some("Recording segment 1"));

        let reconnecting = StatusEvent::Reconnecting {
            attempt: 2,
            delay: Duration::from_millis(5_400),
            reason: "refused".into(),
        };
        assert_eq!(reconnecting.notification_text().as_deref(), Some("Reconnecting in 6s..."));

        let failed = StatusEvent::StateChanged {
            from: SessionState::Reconnecting,
            to: SessionState::Failed(ErrorKind::Io),
        };
        assert_eq!(failed.notification_text().as_deref(), Some("Recording failed: io"));

        let done = StatusEvent::Finished(RecordingOutcome::Stopped { segments: Vec::new() });
        assert_eq!(done.notification_text().as_deref(), Some("Saved 0 segments"));
    }
}
