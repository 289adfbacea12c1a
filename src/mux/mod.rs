//! Container writer
//!
//! Runs on its own thread, draining the [`FrameBuffer`] in batches,
//! interleaving lanes by decode time and multiplexing frames into MP4
//! segments through `muxide`. Rotation happens on the duration/size cap, on
//! a discontinuity raised by the buffer or a failed write, and on an epoch
//! change. A segment always opens on a keyframe when the stream has video;
//! frames that arrive before one are skipped.

mod bitstream;

pub use bitstream::{AdtsFraming, BitstreamError, VideoFraming};

use chrono::{DateTime, Local};
use muxide::api::{AudioCodec, Muxer, MuxerBuilder, VideoCodec};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::io::{self, Write};
use std::iter::Peekable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::buffer::{Batch, FrameBuffer, Pop, QueuedFrame, StreamEpoch};
use crate::config::{RecordingConfig, WriterConfig};
use crate::error::StorageError;
use crate::media::{Codec, Frame, Lane, StreamDescriptor};
use crate::storage::{SegmentSink, StorageHandle};

/// Frame rate announced to the muxer. Sample durations come from the
/// timestamps, this only seeds the track header.
const NOMINAL_FRAME_RATE: f64 = 30.0;

/// A closed, published segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Monotonic index within the recording run
    pub index: u32,
    pub name: String,
    pub started_at: DateTime<Local>,
    /// Decode time of the first frame, in seconds of the run timeline
    pub start_secs: f64,
    /// Decode time of the last frame
    pub end_secs: f64,
    pub bytes: u64,
    pub video_frames: usize,
    pub audio_frames: usize,
    /// The segment follows a gap: evicted keyframe, failed write or a
    /// session break
    pub discontinuity: bool,
}

/// Status reported by the writer thread
#[derive(Debug, Clone)]
pub enum WriterEvent {
    SegmentOpened { index: u32, name: String },
    SegmentClosed(SegmentInfo),
    /// Closed but below the minimum size, so deleted
    SegmentDiscarded { index: u32, name: String, bytes: u64 },
    /// A write failed; the writer reopens and retries within its bound
    WriteFailed { attempt: u32, error: String },
    /// The storage grant is gone; the open segment was flushed one last time
    StorageRevoked { reason: String },
    /// Write retries exhausted
    Fatal { error: String },
    /// The writer exited and will touch storage no more
    Finished {
        reordered_dropped: u64,
        /// Frames that could not start or join a segment: waiting for a
        /// keyframe, or a malformed bitstream
        skipped_frames: u64,
        abandoned_frames: usize,
    },
}

enum WriteStop {
    StorageLost(String),
    Fatal(String),
    Aborted,
}

#[derive(Debug)]
enum SegmentError {
    Storage(StorageError),
    Io(io::Error),
    Mux(String),
}

impl From<io::Error> for SegmentError {
    fn from(e: io::Error) -> Self {
        SegmentError::Io(e)
    }
}

impl From<StorageError> for SegmentError {
    fn from(e: StorageError) -> Self {
        SegmentError::Storage(e)
    }
}

impl From<BitstreamError> for SegmentError {
    fn from(e: BitstreamError) -> Self {
        SegmentError::Mux(e.to_string())
    }
}

impl std::fmt::Display for SegmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentError::Storage(e) => write!(f, "{}", e),
            SegmentError::Io(e) => write!(f, "{}", e),
            SegmentError::Mux(e) => write!(f, "muxer: {}", e),
        }
    }
}

/// What became of one frame handed to the open segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Written {
    Muxed,
    Skipped(&'static str),
}

/// Segment sink shared between the muxer and the writer.
///
/// The muxer owns one clone as its output; the writer keeps another to
/// count bytes, recover the underlying I/O error behind a muxer failure,
/// and commit or discard the segment once the muxer is done.
#[derive(Clone)]
struct SharedSink(Arc<Mutex<SinkSlot>>);

struct SinkSlot {
    sink: Option<Box<dyn SegmentSink>>,
    bytes: u64,
    error: Option<io::Error>,
}

impl SharedSink {
    fn new(sink: Box<dyn SegmentSink>) -> Self {
        Self(Arc::new(Mutex::new(SinkSlot {
            sink: Some(sink),
            bytes: 0,
            error: None,
        })))
    }

    fn lock(&self) -> MutexGuard<'_, SinkSlot> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bytes(&self) -> u64 {
        self.lock().bytes
    }

    /// Classify a muxer failure: the sink's own I/O error when there is one
    fn failure(&self, err: impl Display) -> SegmentError {
        let recorded = self.lock().error.take();
        match recorded {
            Some(e) => SegmentError::Io(e),
            None => SegmentError::Mux(err.to_string()),
        }
    }

    fn commit(&self) -> Result<(), StorageError> {
        let sink = self.lock().sink.take();
        match sink {
            Some(sink) => sink.commit(),
            None => Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                "segment sink already released",
            ))),
        }
    }

    fn discard(&self) {
        let sink = self.lock().sink.take();
        if let Some(sink) = sink {
            sink.discard();
        }
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.lock();
        let slot = &mut *guard;
        let Some(sink) = slot.sink.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "segment sink released"));
        };
        match sink.write(buf) {
            Ok(n) => {
                slot.bytes += n as u64;
                Ok(n)
            }
            Err(e) => {
                slot.error = Some(io::Error::new(e.kind(), e.to_string()));
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self.lock();
        let slot = &mut *guard;
        match slot.sink.as_mut() {
            Some(sink) => sink.flush().map_err(|e| {
                slot.error = Some(io::Error::new(e.kind(), e.to_string()));
                e
            }),
            None => Ok(()),
        }
    }
}

struct OpenSegment {
    index: u32,
    name: String,
    started_at: DateTime<Local>,
    epoch: Arc<StreamEpoch>,
    muxer: Muxer<SharedSink>,
    sink: SharedSink,
    video: Option<VideoFraming>,
    audio: Option<AdtsFraming>,
    /// Run-timeline seconds of the opening frame; muxer time zero
    origin: f64,
    first_dts: [Option<i64>; 2],
    last_dts: [Option<i64>; 2],
    last_ts: [Option<f64>; 2],
    frames: [usize; 2],
    /// Elementary stream bytes handed to the muxer
    payload_bytes: u64,
    discontinuity: bool,
}

impl OpenSegment {
    fn clock_rate(&self, lane: Lane) -> u32 {
        self.epoch
            .descriptor
            .lane(lane)
            .map_or(1, |p| p.clock_rate.max(1))
    }

    /// Lane used for timing: video when present
    fn reference_lane(&self) -> Lane {
        if self.epoch.descriptor.has_video() {
            Lane::Video
        } else {
            Lane::Audio
        }
    }

    fn span_secs(&self) -> (f64, f64) {
        let lane = self.reference_lane();
        let rate = f64::from(self.clock_rate(lane));
        let first = self.first_dts[lane.index()].unwrap_or(0) as f64 / rate;
        let last = self.last_dts[lane.index()].unwrap_or(0) as f64 / rate;
        (first, last)
    }

    fn write(&mut self, frame: &Frame) -> Result<Written, SegmentError> {
        let lane = frame.lane;
        let i = lane.index();
        if lane == Lane::Video && self.frames[i] == 0 && !frame.keyframe {
            return Ok(Written::Skipped("video track must start on a keyframe"));
        }
        let ts = frame.dts_secs(self.clock_rate(lane)) - self.origin;
        if ts < 0.0 || self.last_ts[i].map_or(false, |last| ts <= last) {
            return Ok(Written::Skipped("decode time before the segment position"));
        }

        let data = match lane {
            Lane::Video => self.video.as_ref().map(|v| v.annex_b(&frame.payload, frame.keyframe)),
            Lane::Audio => self.audio.as_ref().map(|a| a.frame(&frame.payload)),
        };
        let data = match data {
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                warn!("Skipping malformed {} frame at dts {}: {}", lane, frame.dts, e);
                return Ok(Written::Skipped("malformed bitstream"));
            }
            None => return Ok(Written::Skipped("lane has no track")),
        };

        let result = match lane {
            Lane::Video => self.muxer.write_video(ts, &data, frame.keyframe),
            Lane::Audio => self.muxer.write_audio(ts, &data),
        };
        result.map_err(|e| self.sink.failure(e))?;

        self.frames[i] += 1;
        self.first_dts[i].get_or_insert(frame.dts);
        self.last_dts[i] = Some(frame.dts);
        self.last_ts[i] = Some(ts);
        self.payload_bytes += data.len() as u64;
        Ok(Written::Muxed)
    }
}

fn video_codec(codec: Codec) -> Result<VideoCodec, SegmentError> {
    match codec {
        Codec::H264 => Ok(VideoCodec::H264),
        Codec::H265 => Ok(VideoCodec::H265),
        Codec::Aac => Err(SegmentError::Mux("AAC negotiated on the video lane".into())),
    }
}

/// Build a muxer writing to `sink` with one track per negotiated lane
fn build_muxer(
    sink: &SharedSink,
    descriptor: &StreamDescriptor,
) -> Result<(Muxer<SharedSink>, Option<VideoFraming>, Option<AdtsFraming>), SegmentError> {
    let mut builder = MuxerBuilder::new(sink.clone());
    let mut video = None;
    let mut audio = None;

    if let Some(p) = descriptor.video() {
        video = Some(VideoFraming::from_record(p.codec, &p.extra_data)?);
        builder = builder.video(
            video_codec(p.codec)?,
            u32::from(p.width),
            u32::from(p.height),
            NOMINAL_FRAME_RATE,
        );
    }
    if let Some(p) = descriptor.audio() {
        audio = Some(AdtsFraming::from_config(&p.extra_data, p.sample_rate)?);
        builder = builder.audio(AudioCodec::Aac, p.sample_rate, p.channels);
    }

    let muxer = builder.build().map_err(|e| sink.failure(e))?;
    Ok((muxer, video, audio))
}

/// A segment may only open here: a video keyframe, or any frame of an
/// audio-only stream
fn is_boundary(epoch: &StreamEpoch, frame: &Frame) -> bool {
    !epoch.descriptor.has_video() || (frame.lane == Lane::Video && frame.keyframe)
}

/// Handle the controller keeps on the writer thread
pub struct WriterHandle {
    abort: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WriterHandle {
    /// Ask the writer to stop at its next frame and drop what is queued
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Detach from a writer that did not finish in time
    pub fn detach(mut self) {
        self.thread.take();
    }
}

pub struct SegmentWriter {
    recording: RecordingConfig,
    writer: WriterConfig,
    storage: Arc<dyn StorageHandle>,
    buffer: Arc<FrameBuffer>,
    events: mpsc::UnboundedSender<WriterEvent>,
    abort: Arc<AtomicBool>,
    current: Option<OpenSegment>,
    next_index: u32,
    /// Epoch of the most recently opened segment
    last_epoch: Option<u64>,
    last_written: [Option<(u64, i64)>; 2],
    pending_discontinuity: bool,
    consecutive_failures: u32,
    reordered_dropped: u64,
    skipped_frames: u64,
}

impl SegmentWriter {
    pub fn new(
        recording: RecordingConfig,
        writer: WriterConfig,
        storage: Arc<dyn StorageHandle>,
        buffer: Arc<FrameBuffer>,
        events: mpsc::UnboundedSender<WriterEvent>,
    ) -> Self {
        Self {
            recording,
            writer,
            storage,
            buffer,
            events,
            abort: Arc::new(AtomicBool::new(false)),
            current: None,
            next_index: 0,
            last_epoch: None,
            last_written: [None, None],
            pending_discontinuity: false,
            consecutive_failures: 0,
            reordered_dropped: 0,
            skipped_frames: 0,
        }
    }

    /// Start the writer on a dedicated thread
    pub fn spawn(self) -> std::io::Result<WriterHandle> {
        let abort = Arc::clone(&self.abort);
        let thread = std::thread::Builder::new()
            .name("segment-writer".into())
            .spawn(move || self.run())?;
        Ok(WriterHandle {
            abort,
            thread: Some(thread),
        })
    }

    /// Drain the buffer until it is closed and empty, storage is lost,
    /// retries run out, or the writer is aborted
    pub fn run(mut self) {
        let poll = self.writer.poll_interval();
        let stop = loop {
            if self.abort.load(Ordering::SeqCst) {
                break Some(WriteStop::Aborted);
            }
            let batch = match self.buffer.pop_batch(poll) {
                Pop::Empty => continue,
                Pop::Closed => break None,
                Pop::Batch(batch) => batch,
            };
            if !self.storage.is_valid() {
                break Some(WriteStop::StorageLost(format!(
                    "{} is no longer writable",
                    self.storage.location()
                )));
            }
            if batch.discontinuity {
                warn!("Keyframe evicted from buffer; next segment starts at a keyframe");
                self.pending_discontinuity = true;
            }
            if let Err(stop) = self.write_batch(batch) {
                break Some(stop);
            }
        };

        // The last flush of the open segment happens even when storage was
        // revoked; nothing is opened or written after it.
        if let Err(e) = self.close_current() {
            error!("Failed to finalize last segment: {}", e);
            self.emit(WriterEvent::WriteFailed {
                attempt: self.consecutive_failures + 1,
                error: e.to_string(),
            });
        }

        let mut abandoned_frames = 0;
        match stop {
            None => info!("Frame buffer drained, writer finished"),
            Some(WriteStop::Aborted) => {
                abandoned_frames = self.buffer.clear();
                warn!("Writer aborted, {} buffered frames abandoned", abandoned_frames);
            }
            Some(WriteStop::StorageLost(reason)) => {
                self.buffer.close();
                abandoned_frames = self.buffer.clear();
                error!("Storage lost: {} ({} buffered frames abandoned)", reason, abandoned_frames);
                self.emit(WriterEvent::StorageRevoked { reason });
            }
            Some(WriteStop::Fatal(error)) => {
                self.buffer.close();
                abandoned_frames = self.buffer.clear();
                error!("Writer giving up: {}", error);
                self.emit(WriterEvent::Fatal { error });
            }
        }

        self.emit(WriterEvent::Finished {
            reordered_dropped: self.reordered_dropped,
            skipped_frames: self.skipped_frames,
            abandoned_frames,
        });
    }

    fn write_batch(&mut self, batch: Batch) -> Result<(), WriteStop> {
        for queued in interleave(batch) {
            if self.abort.load(Ordering::SeqCst) {
                return Err(WriteStop::Aborted);
            }
            self.write_one(queued)?;
        }
        Ok(())
    }

    fn write_one(&mut self, queued: QueuedFrame) -> Result<(), WriteStop> {
        let QueuedFrame { epoch, frame } = queued;
        let lane = frame.lane;

        if let Some((epoch_id, last)) = self.last_written[lane.index()] {
            if epoch_id == epoch.id && frame.dts <= last {
                self.reordered_dropped += 1;
                debug!(
                    "Dropping out-of-order {} frame (dts {} <= {})",
                    lane, frame.dts, last
                );
                return Ok(());
            }
        }
        if epoch.descriptor.lane(lane).is_none() {
            warn!("Dropping {} frame: lane was not negotiated", lane);
            return Ok(());
        }

        loop {
            match self.try_write(&epoch, &frame) {
                Ok(Written::Muxed) => {
                    self.consecutive_failures = 0;
                    self.last_written[lane.index()] = Some((epoch.id, frame.dts));
                    return Ok(());
                }
                Ok(Written::Skipped(reason)) => {
                    self.skipped_frames += 1;
                    debug!("Skipped {} frame at dts {}: {}", lane, frame.dts, reason);
                    return Ok(());
                }
                Err(SegmentError::Storage(StorageError::Permission(reason))) => {
                    return Err(WriteStop::StorageLost(reason));
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    warn!(
                        "Segment write failed (attempt {}/{}): {}",
                        self.consecutive_failures,
                        self.writer.max_write_retries + 1,
                        e
                    );
                    self.emit(WriterEvent::WriteFailed {
                        attempt: self.consecutive_failures,
                        error: e.to_string(),
                    });
                    self.abandon_current();
                    if self.consecutive_failures > self.writer.max_write_retries {
                        return Err(WriteStop::Fatal(e.to_string()));
                    }
                    if self.abort.load(Ordering::SeqCst) {
                        return Err(WriteStop::Aborted);
                    }
                    std::thread::sleep(self.writer.poll_interval());
                }
            }
        }
    }

    fn try_write(&mut self, epoch: &Arc<StreamEpoch>, frame: &Frame) -> Result<Written, SegmentError> {
        if self.should_rotate(epoch, frame) {
            self.close_current()?;
        }

        if self.current.is_none() {
            if !is_boundary(epoch, frame) {
                return Ok(Written::Skipped("waiting for a keyframe"));
            }
            if !self.storage.is_valid() {
                return Err(SegmentError::Storage(StorageError::Permission(format!(
                    "{} is no longer writable",
                    self.storage.location()
                ))));
            }
            let discontinuity =
                self.pending_discontinuity || self.last_epoch.map_or(false, |id| id != epoch.id);
            self.open_segment(epoch, frame, discontinuity)?;
            self.pending_discontinuity = false;
        }

        match self.current.as_mut() {
            Some(segment) => segment.write(frame),
            None => Ok(Written::Skipped("no open segment")),
        }
    }

    fn should_rotate(&self, epoch: &Arc<StreamEpoch>, frame: &Frame) -> bool {
        let Some(segment) = &self.current else {
            return false;
        };
        if segment.epoch.id != epoch.id {
            return true;
        }
        if !is_boundary(epoch, frame) {
            return false;
        }
        if self.pending_discontinuity {
            return true;
        }

        // The muxer holds samples until finish, so the cap counts what it
        // was handed
        if self.recording.segment_max_bytes > 0
            && segment.payload_bytes >= self.recording.segment_max_bytes
        {
            return true;
        }

        if let Some(cap) = self.recording.segment_duration() {
            if let Some(first) = segment.first_dts[frame.lane.index()] {
                let elapsed = (frame.dts - first) as f64 / f64::from(segment.clock_rate(frame.lane));
                if elapsed >= cap.as_secs_f64() {
                    return true;
                }
            }
        }
        false
    }

    fn open_segment(
        &mut self,
        epoch: &Arc<StreamEpoch>,
        opening: &Frame,
        discontinuity: bool,
    ) -> Result<(), SegmentError> {
        let index = self.next_index;
        self.next_index += 1;
        let started_at = Local::now();
        let name = segment_name(started_at, index);

        let sink = SharedSink::new(self.storage.create_segment_sink(&name)?);
        let (muxer, video, audio) = match build_muxer(&sink, &epoch.descriptor) {
            Ok(parts) => parts,
            Err(e) => {
                sink.discard();
                return Err(e);
            }
        };
        let rate = epoch
            .descriptor
            .lane(opening.lane)
            .map_or(1, |p| p.clock_rate.max(1));

        info!("Opened segment {} ({})", index, name);
        self.emit(WriterEvent::SegmentOpened {
            index,
            name: name.clone(),
        });
        self.last_epoch = Some(epoch.id);
        self.current = Some(OpenSegment {
            index,
            name,
            started_at,
            epoch: Arc::clone(epoch),
            muxer,
            sink,
            video,
            audio,
            origin: opening.dts_secs(rate),
            first_dts: [None, None],
            last_dts: [None, None],
            last_ts: [None, None],
            frames: [0, 0],
            payload_bytes: 0,
            discontinuity,
        });
        Ok(())
    }

    /// Finalize the open segment and publish or discard it
    fn close_current(&mut self) -> Result<(), SegmentError> {
        let Some(segment) = self.current.take() else {
            return Ok(());
        };

        let (start_secs, end_secs) = segment.span_secs();
        let OpenSegment {
            index,
            name,
            started_at,
            mut muxer,
            sink,
            frames: [video_frames, audio_frames],
            discontinuity,
            ..
        } = segment;

        if video_frames + audio_frames == 0 {
            drop(muxer);
            sink.discard();
            debug!("Discarded empty segment {}", name);
            return Ok(());
        }

        if let Err(e) = muxer.finish_with_stats() {
            let err = sink.failure(e);
            sink.discard();
            return Err(err);
        }
        let bytes = sink.bytes();

        if bytes < self.recording.min_segment_bytes {
            sink.discard();
            info!(
                "Discarded short segment {} ({} bytes < {})",
                name, bytes, self.recording.min_segment_bytes
            );
            self.emit(WriterEvent::SegmentDiscarded { index, name, bytes });
            return Ok(());
        }

        sink.commit()?;
        let info = SegmentInfo {
            index,
            name,
            started_at,
            start_secs,
            end_secs,
            bytes,
            video_frames,
            audio_frames,
            discontinuity,
        };
        info!(
            "Closed segment {}: {} ({} bytes, {:.1}s-{:.1}s, {} video / {} audio frames)",
            info.index, info.name, info.bytes, info.start_secs, info.end_secs, video_frames, audio_frames
        );
        self.emit(WriterEvent::SegmentClosed(info));
        Ok(())
    }

    /// Best-effort close after a failed write. Whatever the muxer lost
    /// leaves a gap, so the next segment waits for a keyframe and is marked
    /// discontinuous.
    fn abandon_current(&mut self) {
        if let Err(e) = self.close_current() {
            warn!("Could not salvage segment after write failure: {}", e);
        }
        self.pending_discontinuity = true;
    }

    fn emit(&self, event: WriterEvent) {
        // The controller may already be gone during forced shutdown
        let _ = self.events.send(event);
    }
}

/// `rec_<YYYYmmdd_HHMMSS>_seg<NNNN>.mp4`
pub fn segment_name(started_at: DateTime<Local>, index: u32) -> String {
    format!("rec_{}_seg{:04}.mp4", started_at.format("%Y%m%d_%H%M%S"), index)
}

/// Merge the lanes of a batch by (epoch, decode time) while keeping each
/// lane's own order
pub fn interleave(batch: Batch) -> Vec<QueuedFrame> {
    let Batch { video, audio, .. } = batch;
    let mut out = Vec::with_capacity(video.len() + audio.len());
    let mut video = video.into_iter().peekable();
    let mut audio = audio.into_iter().peekable();

    fn key(q: &QueuedFrame) -> (u64, f64) {
        let rate = q
            .epoch
            .descriptor
            .lane(q.frame.lane)
            .map_or(1, |p| p.clock_rate.max(1));
        (q.epoch.id, q.frame.dts_secs(rate))
    }

    fn take_next<I: Iterator<Item = QueuedFrame>>(
        a: &mut Peekable<I>,
        b: &mut Peekable<I>,
    ) -> Option<QueuedFrame> {
        match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => {
                if key(x) <= key(y) {
                    a.next()
                } else {
                    b.next()
                }
            }
            (Some(_), None) => a.next(),
            (None, Some(_)) => b.next(),
            (None, None) => None,
        }
    }

    while let Some(q) = take_next(&mut video, &mut audio) {
        out.push(q);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::media::CodecParameters;
    use crate::storage::DirectoryHandle;
    use crate::transport::testing::{h264_descriptor, h264_payload, video_frame};
    use bytes::Bytes;
    use std::time::Duration;

    fn epoch(id: u64, descriptor: StreamDescriptor) -> Arc<StreamEpoch> {
        Arc::new(StreamEpoch { id, descriptor })
    }

    struct Harness {
        dir: tempfile::TempDir,
        storage: DirectoryHandle,
        buffer: Arc<FrameBuffer>,
        rx: mpsc::UnboundedReceiver<WriterEvent>,
        writer: SegmentWriter,
    }

    fn test_buffer() -> Arc<FrameBuffer> {
        Arc::new(FrameBuffer::new(&BufferConfig {
            max_frames: 100_000,
            max_bytes: 1 << 30,
        }))
    }

    fn harness(recording: RecordingConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let storage = DirectoryHandle::open(dir.path()).unwrap();
        let buffer = test_buffer();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = SegmentWriter::new(
            recording,
            WriterConfig {
                poll_interval_ms: 5,
                ..WriterConfig::default()
            },
            Arc::new(storage.clone()),
            Arc::clone(&buffer),
            tx,
        );
        Harness {
            dir,
            storage,
            buffer,
            rx,
            writer,
        }
    }

    fn recording(segment_secs: u64) -> RecordingConfig {
        RecordingConfig {
            output_directory: None,
            segment_duration_secs: segment_secs,
            segment_max_bytes: 0,
            min_segment_bytes: 0,
        }
    }

    fn closed_segments(rx: &mut mpsc::UnboundedReceiver<WriterEvent>) -> Vec<SegmentInfo> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WriterEvent::SegmentClosed(info) = event {
                out.push(info);
            }
        }
        out
    }

    /// 30 fps video with a keyframe every second
    fn push_video(buffer: &FrameBuffer, epoch: &Arc<StreamEpoch>, frames: std::ops::Range<i64>) {
        for n in frames {
            buffer.push(epoch, video_frame(n));
        }
    }

    fn batch(epoch: &Arc<StreamEpoch>, frames: std::ops::Range<i64>) -> Batch {
        Batch {
            video: frames
                .map(|n| QueuedFrame {
                    epoch: Arc::clone(epoch),
                    frame: video_frame(n),
                })
                .collect(),
            audio: Vec::new(),
            discontinuity: false,
        }
    }

    /// (type, size) of each top-level box
    fn top_level_boxes(file: &[u8]) -> Vec<(String, usize)> {
        let mut out = Vec::new();
        let mut rest = file;
        while rest.len() >= 8 {
            let size = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            let kind = String::from_utf8_lossy(&rest[4..8]).into_owned();
            if size < 8 || size > rest.len() {
                break;
            }
            out.push((kind, size));
            rest = &rest[size..];
        }
        out
    }

    /// Storage whose sinks can never be created
    struct BrokenStorage;

    impl StorageHandle for BrokenStorage {
        fn create_segment_sink(&self, _name: &str) -> Result<Box<dyn SegmentSink>, StorageError> {
            Err(StorageError::Io(io::Error::new(io::ErrorKind::Other, "no space left on device")))
        }

        fn is_valid(&self) -> bool {
            true
        }

        fn location(&self) -> String {
            "broken".into()
        }
    }

    #[test]
    fn test_duration_cap_rotates_on_keyframes() {
        let Harness {
            dir,
            buffer,
            mut rx,
            writer,
            ..
        } = harness(recording(10));
        let e = epoch(0, h264_descriptor());
        push_video(&buffer, &e, 0..1800);
        buffer.close();
        writer.run();

        let segments = closed_segments(&mut rx);
        assert_eq!(segments.len(), 6);
        for (i, seg) in segments.iter().enumerate() {
            assert_eq!(seg.index, i as u32);
            assert_eq!(seg.video_frames, 300);
            let window = 10.0 * i as f64;
            assert!(seg.start_secs >= window - 1e-9);
            assert!(seg.end_secs < window + 10.0);
            assert!(dir.path().join(&seg.name).exists());
        }
        assert!(!segments[0].discontinuity);
    }

    #[test]
    fn test_size_cap_rotates_on_keyframes() {
        let mut config = recording(600);
        config.segment_max_bytes = 1;
        let Harness { dir: _dir, buffer, mut rx, writer, .. } = harness(config);
        let e = epoch(0, h264_descriptor());
        push_video(&buffer, &e, 0..90);
        buffer.close();
        writer.run();

        let segments = closed_segments(&mut rx);
        assert_eq!(segments.len(), 3);
        for seg in &segments {
            assert_eq!(seg.video_frames, 30);
            assert!(!seg.discontinuity);
        }
        assert_eq!(segments[2].start_secs, 2.0);
    }

    #[test]
    fn test_epoch_change_forces_rotation() {
        let Harness { dir: _dir, buffer, mut rx, writer, .. } = harness(recording(600));
        let first = epoch(0, h264_descriptor());
        let second = epoch(1, h264_descriptor());
        push_video(&buffer, &first, 0..45);
        push_video(&buffer, &second, 60..90);
        buffer.close();
        writer.run();

        let segments = closed_segments(&mut rx);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].video_frames, 45);
        assert_eq!(segments[1].video_frames, 30);
        assert!(!segments[0].discontinuity);
        assert!(segments[1].discontinuity);
    }

    #[test]
    fn test_new_epoch_waits_for_a_keyframe() {
        let Harness { dir: _dir, mut rx, mut writer, .. } = harness(recording(600));
        let first = epoch(0, h264_descriptor());
        let second = epoch(1, h264_descriptor());
        assert!(writer.write_batch(batch(&first, 0..20)).is_ok());
        // The new session joins mid-GOP
        assert!(writer.write_batch(batch(&second, 50..75)).is_ok());
        writer.close_current().unwrap();

        let segments = closed_segments(&mut rx);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].video_frames, 15);
        assert_eq!(segments[1].start_secs, 2.0);
        assert!(segments[1].discontinuity);
        assert_eq!(writer.skipped_frames, 10);
    }

    #[test]
    fn test_discontinuity_rotates_at_next_keyframe() {
        let Harness { dir: _dir, mut rx, mut writer, .. } = harness(recording(600));
        let e = epoch(0, h264_descriptor());
        assert!(writer.write_batch(batch(&e, 0..45)).is_ok());

        writer.pending_discontinuity = true;
        // Frames 45..59 stay in the open GOP; 60 is the next keyframe
        assert!(writer.write_batch(batch(&e, 45..75)).is_ok());
        writer.close_current().unwrap();

        let segments = closed_segments(&mut rx);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].video_frames, 60);
        assert!(!segments[0].discontinuity);
        assert_eq!(segments[1].video_frames, 15);
        assert!(segments[1].discontinuity);
        assert!(!writer.pending_discontinuity);
    }

    #[test]
    fn test_abandoned_segment_resumes_at_keyframe() {
        let Harness { dir: _dir, mut rx, mut writer, .. } = harness(recording(600));
        let e = epoch(0, h264_descriptor());
        assert!(writer.write_batch(batch(&e, 0..10)).is_ok());

        writer.abandon_current();
        assert!(writer.write_batch(batch(&e, 10..45)).is_ok());
        writer.close_current().unwrap();

        let segments = closed_segments(&mut rx);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].video_frames, 10);
        assert!(!segments[0].discontinuity);
        // Frames 10..29 belong to the lost GOP
        assert_eq!(segments[1].video_frames, 15);
        assert_eq!(segments[1].start_secs, 1.0);
        assert!(segments[1].discontinuity);
        assert_eq!(writer.skipped_frames, 20);
    }

    #[test]
    fn test_out_of_order_frames_are_dropped() {
        let Harness { dir: _dir, buffer, mut rx, writer, .. } = harness(recording(600));
        let e = epoch(0, h264_descriptor());
        for dts in [0, 3000, 9000, 6000, 9000, 12000] {
            buffer.push(&e, Frame::new(Lane::Video, dts, dts, dts == 0, h264_payload(dts == 0, 12)));
        }
        buffer.close();
        writer.run();

        let mut reordered = 0;
        let mut segments = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                WriterEvent::SegmentClosed(info) => segments.push(info),
                WriterEvent::Finished { reordered_dropped, .. } => reordered = reordered_dropped,
                _ => {}
            }
        }
        assert_eq!(reordered, 2);
        assert_eq!(segments[0].video_frames, 4);
        assert_eq!(segments[0].end_secs, 12000.0 / 90_000.0);
    }

    #[test]
    fn test_failing_sink_gives_up_after_retries() {
        let buffer = test_buffer();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let writer = SegmentWriter::new(
            recording(600),
            WriterConfig {
                max_write_retries: 2,
                poll_interval_ms: 1,
                ..WriterConfig::default()
            },
            Arc::new(BrokenStorage),
            Arc::clone(&buffer),
            tx,
        );
        let e = epoch(0, h264_descriptor());
        push_video(&buffer, &e, 0..5);
        buffer.close();
        writer.run();

        let mut attempts = Vec::new();
        let mut tail = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                WriterEvent::WriteFailed { attempt, error } => {
                    assert!(tail.is_empty());
                    assert!(error.contains("no space left"));
                    attempts.push(attempt);
                }
                WriterEvent::Fatal { .. } => tail.push("fatal"),
                WriterEvent::Finished { .. } => tail.push("finished"),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(tail, vec!["fatal", "finished"]);
        assert!(buffer.is_closed());
    }

    #[test]
    fn test_revoked_storage_stops_writes() {
        let Harness {
            dir,
            storage,
            buffer,
            mut rx,
            writer,
        } = harness(recording(1));
        let e = epoch(0, h264_descriptor());
        let handle = writer.spawn().unwrap();

        push_video(&buffer, &e, 0..30);
        std::thread::sleep(Duration::from_millis(100));
        storage.revoke();
        push_video(&buffer, &e, 30..90);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !handle.is_finished() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(handle.is_finished());

        let mut opened = 0;
        let mut revoked = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                WriterEvent::SegmentOpened { .. } => opened += 1,
                WriterEvent::StorageRevoked { .. } => revoked = true,
                _ => {}
            }
        }
        assert!(revoked);
        assert_eq!(opened, 1);
        // The open segment was still finalized once
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(files.len(), 1);
        assert!(buffer.is_closed());
    }

    #[test]
    fn test_min_segment_bytes_discards_runts() {
        let mut config = recording(600);
        config.min_segment_bytes = 1024 * 1024;
        let Harness { dir, buffer, mut rx, writer, .. } = harness(config);
        let e = epoch(0, h264_descriptor());
        push_video(&buffer, &e, 0..10);
        buffer.close();
        writer.run();

        let mut discarded = false;
        while let Ok(event) = rx.try_recv() {
            if let WriterEvent::SegmentDiscarded { .. } = event {
                discarded = true;
            }
        }
        assert!(discarded);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_interleave_orders_lanes_by_time() {
        let desc = StreamDescriptor::parse("rtsp://camera/live").unwrap().negotiated(
            Some(CodecParameters::video(
                Codec::H264,
                90_000,
                640,
                480,
                Bytes::from_static(&[1]),
            )),
            Some(CodecParameters::audio(8_000, 1, 8_000, Bytes::from_static(&[0x15, 0x88]))),
        );
        let e = epoch(0, desc);
        let q = |lane, dts| QueuedFrame {
            epoch: Arc::clone(&e),
            frame: Frame::new(lane, dts, dts, true, vec![0u8]),
        };
        let batch = Batch {
            // 0s, 0.5s, 1s
            video: vec![q(Lane::Video, 0), q(Lane::Video, 45_000), q(Lane::Video, 90_000)],
            // 0.25s, 0.75s
            audio: vec![q(Lane::Audio, 2_000), q(Lane::Audio, 6_000)],
            discontinuity: false,
        };

        let order: Vec<(Lane, i64)> = interleave(batch)
            .into_iter()
            .map(|q| (q.frame.lane, q.frame.dts))
            .collect();
        assert_eq!(
            order,
            vec![
                (Lane::Video, 0),
                (Lane::Audio, 2_000),
                (Lane::Video, 45_000),
                (Lane::Audio, 6_000),
                (Lane::Video, 90_000),
            ]
        );
    }

    #[test]
    fn test_segment_name_format() {
        let at = chrono::TimeZone::with_ymd_and_hms(&Local, 2026, 10, 18, 9, 5, 7).unwrap();
        assert_eq!(segment_name(at, 3), "rec_20261018_090507_seg0003.mp4");
    }

    #[test]
    fn test_written_file_is_a_complete_mp4() {
        let Harness { dir, buffer, mut rx, writer, .. } = harness(recording(600));
        let e = epoch(0, h264_descriptor());
        push_video(&buffer, &e, 0..3);
        buffer.close();
        writer.run();

        let segments = closed_segments(&mut rx);
        let file = std::fs::read(dir.path().join(&segments[0].name)).unwrap();
        let boxes = top_level_boxes(&file);
        let kinds: Vec<&str> = boxes.iter().map(|(kind, _)| kind.as_str()).collect();
        assert_eq!(kinds.first(), Some(&"ftyp"));
        assert!(kinds.contains(&"moov"));
        assert!(kinds.contains(&"mdat"));
        assert_eq!(boxes.iter().map(|(_, size)| size).sum::<usize>(), file.len());
        assert_eq!(segments[0].bytes, file.len() as u64);
    }
}
