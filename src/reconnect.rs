//! Reconnection policy
//!
//! Decides what happens after a transport error: retry now, retry after an
//! exponential backoff with jitter, or give up after too many failures in a
//! row. [`ContinuityGuard`] decides whether a reconnected stream continues
//! the previous one and keeps the run timeline moving forward across
//! sessions.

use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::config::ReconnectConfig;
use crate::error::{TransportError, TransportErrorKind};
use crate::media::{Frame, Lane, StreamDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryNow,
    RetryAfter(Duration),
    GiveUp,
}

/// How a reconnected stream relates to the one before it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// Same codec parameters: the new session continues the run timeline
    Continuation,
    /// Codec parameters changed: the run timeline restarts
    Break,
}

fn jitter_multiplier(run_id: &str, attempt: u32) -> f64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    run_id.hash(&mut hasher);
    attempt.hash(&mut hasher);
    let hash = hasher.finish();
    let bucket = (hash % 401) as f64;
    0.8 + (bucket / 1000.0)
}

pub struct ReconnectPolicy {
    config: ReconnectConfig,
    run_id: String,
    consecutive_failures: u32,
    /// Frames flowed since the last failure
    healthy: bool,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig, run_id: impl Into<String>) -> Self {
        Self {
            config,
            run_id: run_id.into(),
            consecutive_failures: 0,
            healthy: false,
        }
    }

    /// Undelayed, unjittered backoff for the n-th consecutive failure
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.config.base_delay_ms);
        let max = Duration::from_millis(self.config.max_delay_ms);
        let exp = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        base.checked_mul(exp).unwrap_or(max).min(max)
    }

    pub fn on_failure(&mut self, error: &TransportError) -> RetryDecision {
        self.consecutive_failures += 1;
        let was_healthy = std::mem::take(&mut self.healthy);

        if self.consecutive_failures >= self.config.max_consecutive_failures {
            return RetryDecision::GiveUp;
        }

        let transient = matches!(
            error.kind,
            TransportErrorKind::Timeout | TransportErrorKind::Unexpected
        );
        if was_healthy && transient && self.config.immediate_first_retry {
            return RetryDecision::RetryNow;
        }

        let attempt = self.consecutive_failures;
        let max = Duration::from_millis(self.config.max_delay_ms);
        let delay = self
            .backoff_for_attempt(attempt)
            .mul_f64(jitter_multiplier(&self.run_id, attempt))
            .min(max);
        RetryDecision::RetryAfter(delay)
    }

    /// The session delivered a frame; the failure streak is over
    pub fn on_first_frame(&mut self) {
        self.consecutive_failures = 0;
        self.healthy = true;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Maps per-session timestamps onto one run timeline.
///
/// Every session clock starts near zero. After a [`Continuity::Continuation`]
/// the first frame of each lane is shifted to land the measured outage past
/// the last timestamp pushed for that lane, and the rest of the session keeps
/// that shift. A [`Continuity::Break`] drops the history and lets the new
/// session start its own timeline.
#[derive(Debug, Default)]
pub struct ContinuityGuard {
    clock_rates: [u32; 2],
    watermarks: [Option<i64>; 2],
    offsets: [i64; 2],
    /// Outage still to be bridged on the first frame of each lane
    pending_gap: [Option<Duration>; 2],
}

impl ContinuityGuard {
    /// First session of the run
    pub fn start(&mut self, descriptor: &StreamDescriptor) {
        *self = Self::default();
        self.set_clock_rates(descriptor);
    }

    /// Compare the descriptors of the old and new session. `outage` is the
    /// wall time since the last frame of the old session.
    pub fn on_reconnect(
        &mut self,
        previous: &StreamDescriptor,
        next: &StreamDescriptor,
        outage: Duration,
    ) -> Continuity {
        if !previous.same_codecs(next) {
            self.start(next);
            return Continuity::Break;
        }
        self.set_clock_rates(next);
        self.offsets = [0, 0];
        self.pending_gap = [Some(outage), Some(outage)];
        Continuity::Continuation
    }

    /// Move a frame of the current session onto the run timeline
    pub fn admit(&mut self, frame: &mut Frame) {
        let i = frame.lane.index();
        if let Some(gap) = self.pending_gap[i].take() {
            if let Some(last) = self.watermarks[i] {
                let rate = f64::from(self.clock_rates[i].max(1));
                let gap_ticks = ((gap.as_secs_f64() * rate).round() as i64).max(1);
                self.offsets[i] = last.saturating_add(gap_ticks) - frame.dts;
            }
        }
        frame.dts = frame.dts.saturating_add(self.offsets[i]);
        frame.pts = frame.pts.saturating_add(self.offsets[i]);
        let mark = &mut self.watermarks[i];
        *mark = Some(mark.map_or(frame.dts, |m| m.max(frame.dts)));
    }

    pub fn watermark(&self, lane: Lane) -> Option<i64> {
        self.watermarks[lane.index()]
    }

    fn set_clock_rates(&mut self, descriptor: &StreamDescriptor) {
        for lane in Lane::ALL {
            self.clock_rates[lane.index()] = descriptor.lane(lane).map_or(1, |p| p.clock_rate);
        }
    }
}
