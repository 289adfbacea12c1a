//! Bounded frame buffer between the network read loop and the writer thread
//!
//! One FIFO lane per stream index, each capped by frame count and byte size.
//! When a lane is full the oldest non-keyframe is dropped; a keyframe is only
//! dropped when the lane holds nothing else, and that raises a discontinuity
//! flag the writer consumes to start a fresh keyframe-aligned segment.
//! A frame bigger than the whole byte cap is rejected outright, so a lane
//! never holds more than `max_bytes`.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::BufferConfig;
use crate::media::{Frame, Lane, StreamDescriptor};

/// One transport session's worth of frames, with fixed codec parameters.
///
/// The read loop opens a new epoch for every session it connects; the writer
/// rotates whenever the epoch of a frame changes.
#[derive(Debug)]
pub struct StreamEpoch {
    pub id: u64,
    pub descriptor: StreamDescriptor,
}

#[derive(Debug)]
pub struct QueuedFrame {
    pub epoch: Arc<StreamEpoch>,
    pub frame: Frame,
}

/// Result of [`FrameBuffer::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting older frames from the same lane
    Evicted { frames: usize, keyframe: bool },
    /// The frame alone exceeds the lane's byte cap and was dropped
    Rejected { keyframe: bool },
    /// Buffer closed; the frame was not accepted
    Closed,
}

/// Frames taken by the writer in one go
#[derive(Debug, Default)]
pub struct Batch {
    pub video: Vec<QueuedFrame>,
    pub audio: Vec<QueuedFrame>,
    /// A keyframe was evicted since the previous batch
    pub discontinuity: bool,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.video.len() + self.audio.len()
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty()
    }
}

#[derive(Debug)]
pub enum Pop {
    Batch(Batch),
    /// Nothing arrived within the wait
    Empty,
    /// Closed and fully drained
    Closed,
}

#[derive(Default)]
struct LaneQueue {
    frames: VecDeque<QueuedFrame>,
    bytes: usize,
    dropped: u64,
}

#[derive(Default)]
struct State {
    lanes: [LaneQueue; 2],
    discontinuity: bool,
    closed: bool,
}

pub struct FrameBuffer {
    state: Mutex<State>,
    available: Condvar,
    max_frames: usize,
    max_bytes: usize,
}

impl FrameBuffer {
    pub fn new(config: &BufferConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: Condvar::new(),
            max_frames: config.max_frames.max(1),
            max_bytes: config.max_bytes.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a writer panicked mid-pop; the queues
        // themselves are still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a frame, evicting per the overflow policy. Never blocks on the
    /// consumer.
    pub fn push(&self, epoch: &Arc<StreamEpoch>, frame: Frame) -> PushOutcome {
        let mut state = self.lock();
        if state.closed {
            return PushOutcome::Closed;
        }

        let incoming = frame.len();
        if incoming > self.max_bytes {
            let keyframe = frame.keyframe;
            state.lanes[frame.lane.index()].dropped += 1;
            if keyframe {
                state.discontinuity = true;
            }
            return PushOutcome::Rejected { keyframe };
        }

        let mut evicted = 0;
        let mut keyframe_evicted = false;
        {
            let lane = &mut state.lanes[frame.lane.index()];
            while !lane.frames.is_empty()
                && (lane.frames.len() >= self.max_frames || lane.bytes + incoming > self.max_bytes)
            {
                let victim = match lane.frames.iter().position(|q| !q.frame.keyframe) {
                    Some(pos) => lane.frames.remove(pos),
                    None => {
                        keyframe_evicted = true;
                        lane.frames.pop_front()
                    }
                };
                if let Some(victim) = victim {
                    lane.bytes -= victim.frame.len();
                    lane.dropped += 1;
                    evicted += 1;
                }
            }

            lane.bytes += incoming;
            lane.frames.push_back(QueuedFrame {
                epoch: Arc::clone(epoch),
                frame,
            });
        }
        if keyframe_evicted {
            state.discontinuity = true;
        }
        drop(state);
        self.available.notify_one();

        if evicted == 0 {
            PushOutcome::Queued
        } else {
            PushOutcome::Evicted {
                frames: evicted,
                keyframe: keyframe_evicted,
            }
        }
    }

    /// Take everything queued, waiting up to `wait` for the first frame
    pub fn pop_batch(&self, wait: Duration) -> Pop {
        let mut state = self.lock();
        if Self::is_drained(&state) && !state.closed {
            let (guard, _) = self
                .available
                .wait_timeout_while(state, wait, |s| Self::is_drained(s) && !s.closed)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }

        if Self::is_drained(&state) {
            return if state.closed { Pop::Closed } else { Pop::Empty };
        }

        let mut batch = Batch {
            discontinuity: std::mem::take(&mut state.discontinuity),
            ..Batch::default()
        };
        for lane in Lane::ALL {
            let queue = &mut state.lanes[lane.index()];
            queue.bytes = 0;
            let frames: Vec<QueuedFrame> = queue.frames.drain(..).collect();
            match lane {
                Lane::Video => batch.video = frames,
                Lane::Audio => batch.audio = frames,
            }
        }
        Pop::Batch(batch)
    }

    fn is_drained(state: &State) -> bool {
        state.lanes.iter().all(|l| l.frames.is_empty())
    }

    /// Stop accepting frames and wake the consumer; queued frames stay
    /// poppable until drained
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    /// Drop everything still queued; returns how many frames were discarded
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let mut cleared = 0;
        for lane in state.lanes.iter_mut() {
            cleared += lane.frames.len();
            lane.frames.clear();
            lane.bytes = 0;
        }
        cleared
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self, lane: Lane) -> usize {
        self.lock().lanes[lane.index()].frames.len()
    }

    pub fn bytes(&self, lane: Lane) -> usize {
        self.lock().lanes[lane.index()].bytes
    }

    /// Frames evicted from `lane` so far
    pub fn dropped(&self, lane: Lane) -> u64 {
        self.lock().lanes[lane.index()].dropped
    }
}
