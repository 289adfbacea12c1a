//! RTSP backend on top of retina
//!
//! DESCRIBE, SETUP over interleaved TCP, PLAY, then pull demuxed access
//! units. Only H.264/H.265 video and AAC audio are set up; other streams in
//! the presentation are skipped.
//!
//! Frame timestamps are relative to the start of the session. The RTP
//! timestamp base is random per session, so raw values say nothing about how
//! two sessions line up.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use retina::client::{Credentials, Demuxed, PlayOptions, Session, SessionOptions, SetupOptions};
use retina::codec::{CodecItem, ParametersRef};
use std::pin::Pin;
use tracing::{debug, info, warn};

use super::{Connector, FrameSource};
use crate::config::TransportConfig;
use crate::error::{TransportError, TransportErrorKind};
use crate::media::{Codec, CodecParameters, Frame, Lane, StreamDescriptor};

/// RTP clock for H.264/H.265 payloads
const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Map a retina error message onto the transport taxonomy
pub fn classify_error(message: &str) -> TransportErrorKind {
    let m = message.to_ascii_lowercase();
    if m.contains("401") || m.contains("403") || m.contains("unauthorized") || m.contains("forbidden") {
        return TransportErrorKind::Refused;
    }
    if m.contains("refused")
        || m.contains("unreachable")
        || m.contains("no route")
        || m.contains("unable to connect")
        || m.contains("failed to lookup")
        || m.contains("name or service not known")
        || m.contains("dns")
    {
        return TransportErrorKind::Refused;
    }
    if m.contains("timed out") || m.contains("timeout") {
        return TransportErrorKind::Timeout;
    }
    if m.contains("parse")
        || m.contains("invalid")
        || m.contains("malformed")
        || m.contains("sdp")
        || m.contains("unexpected rtsp")
        || m.contains("unsupported")
    {
        return TransportErrorKind::ProtocolError;
    }
    TransportErrorKind::Unexpected
}

fn transport_error(err: retina::Error) -> TransportError {
    let message = err.to_string();
    TransportError::new(classify_error(&message), message)
}

/// Channel count from an AudioSpecificConfig, defaulting to stereo
fn aac_channels(config: &[u8]) -> u16 {
    match config {
        [_, b1, ..] => match (b1 >> 3) & 0x0f {
            0 => 2,
            7 => 8,
            n => u16::from(n),
        },
        _ => 2,
    }
}

fn video_codec(encoding_name: &str) -> Option<Codec> {
    match encoding_name.to_ascii_lowercase().as_str() {
        "h264" => Some(Codec::H264),
        "h265" => Some(Codec::H265),
        _ => None,
    }
}

pub struct RtspConnector {
    user_agent: String,
}

impl RtspConnector {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
        }
    }
}

#[async_trait]
impl Connector for RtspConnector {
    async fn open(&self, descriptor: &StreamDescriptor) -> Result<Box<dyn FrameSource>, TransportError> {
        let creds = descriptor.credentials().map(|c| Credentials {
            username: c.username.clone(),
            password: c.password.clone(),
        });
        let options = SessionOptions::default()
            .creds(creds)
            .user_agent(self.user_agent.clone());

        let mut session = Session::describe(descriptor.url().clone(), options)
            .await
            .map_err(transport_error)?;

        let mut video = None;
        let mut audio = None;
        for (i, stream) in session.streams().iter().enumerate() {
            match stream.parameters() {
                Some(ParametersRef::Video(params)) if video.is_none() => {
                    let Some(codec) = video_codec(stream.encoding_name()) else {
                        warn!("Skipping unsupported video encoding {}", stream.encoding_name());
                        continue;
                    };
                    let (width, height) = params.pixel_dimensions();
                    let parameters = CodecParameters::video(
                        codec,
                        VIDEO_CLOCK_RATE,
                        u16::try_from(width).unwrap_or(u16::MAX),
                        u16::try_from(height).unwrap_or(u16::MAX),
                        Bytes::copy_from_slice(params.extra_data()),
                    );
                    video = Some((i, parameters));
                }
                Some(ParametersRef::Audio(params)) if audio.is_none() => {
                    if !stream.encoding_name().eq_ignore_ascii_case("mpeg4-generic") {
                        warn!("Skipping unsupported audio encoding {}", stream.encoding_name());
                        continue;
                    }
                    let parameters = CodecParameters::audio(
                        params.clock_rate(),
                        aac_channels(params.extra_data()),
                        params.clock_rate(),
                        Bytes::copy_from_slice(params.extra_data()),
                    );
                    audio = Some((i, parameters));
                }
                _ => {
                    debug!(
                        "Ignoring stream {} ({}/{})",
                        i,
                        stream.media(),
                        stream.encoding_name()
                    );
                }
            }
        }

        if video.is_none() && audio.is_none() {
            return Err(TransportError::protocol(
                "presentation has no recordable H.264/H.265/AAC stream with known parameters",
            ));
        }

        for (i, _) in video.iter().chain(audio.iter()) {
            session
                .setup(*i, SetupOptions::default())
                .await
                .map_err(transport_error)?;
        }

        let demuxed = session
            .play(PlayOptions::default())
            .await
            .map_err(transport_error)?
            .demuxed()
            .map_err(transport_error)?;

        let negotiated = descriptor.negotiated(
            video.as_ref().map(|(_, p)| p.clone()),
            audio.as_ref().map(|(_, p)| p.clone()),
        );
        info!(
            "Playing {} (video: {:?}, audio: {:?})",
            negotiated.url(),
            negotiated.video().map(|p| (p.codec, p.width, p.height)),
            negotiated.audio().map(|p| (p.codec, p.sample_rate, p.channels))
        );

        Ok(Box::new(RtspSource {
            descriptor: negotiated,
            demuxed: Some(Box::pin(demuxed)),
            video_stream: video.map(|(i, _)| i),
            audio_stream: audio.map(|(i, _)| i),
            seen_video: false,
        }))
    }
}

struct RtspSource {
    descriptor: StreamDescriptor,
    demuxed: Option<Pin<Box<Demuxed>>>,
    video_stream: Option<usize>,
    audio_stream: Option<usize>,
    seen_video: bool,
}

impl RtspSource {
    fn lane_of(&self, stream_id: usize) -> Option<Lane> {
        if self.video_stream == Some(stream_id) {
            Some(Lane::Video)
        } else if self.audio_stream == Some(stream_id) {
            Some(Lane::Audio)
        } else {
            None
        }
    }
}

#[async_trait]
impl FrameSource for RtspSource {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            let Some(demuxed) = self.demuxed.as_mut() else {
                return Err(TransportError::unexpected("session closed"));
            };
            let item = match demuxed.next().await {
                Some(Ok(item)) => item,
                Some(Err(e)) => return Err(transport_error(e)),
                None => return Err(TransportError::unexpected("server ended the session")),
            };

            match item {
                CodecItem::VideoFrame(frame) => {
                    if self.lane_of(frame.stream_id()) != Some(Lane::Video) {
                        continue;
                    }
                    // New SPS/PPS after the first frame invalidates the
                    // sample entry; reconnecting re-derives the descriptor.
                    if frame.has_new_parameters() && self.seen_video {
                        return Err(TransportError::unexpected("video parameters changed in-band"));
                    }
                    self.seen_video = true;
                    let ts = frame.timestamp().elapsed();
                    return Ok(Frame::new(
                        Lane::Video,
                        ts,
                        ts,
                        frame.is_random_access_point(),
                        Bytes::copy_from_slice(&frame.data()[..]),
                    ));
                }
                CodecItem::AudioFrame(frame) => {
                    if self.lane_of(frame.stream_id()) != Some(Lane::Audio) {
                        continue;
                    }
                    let ts = frame.timestamp().elapsed();
                    return Ok(Frame::new(
                        Lane::Audio,
                        ts,
                        ts,
                        true,
                        Bytes::copy_from_slice(&frame.data()[..]),
                    ));
                }
                _ => continue,
            }
        }
    }

    async fn close(&mut self) {
        if self.demuxed.take().is_some() {
            debug!("Closed RTSP session to {}", self.descriptor.url());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_error() {
        assert_eq!(
            classify_error("Unable to connect to RTSP server: Connection refused (os error 111)"),
            TransportErrorKind::Refused
        );
        assert_eq!(classify_error("RTSP DESCRIBE: 401 Unauthorized"), TransportErrorKind::Refused);
        assert_eq!(classify_error("keepalive timed out"), TransportErrorKind::Timeout);
        assert_eq!(
            classify_error("Unable to parse SDP: missing m= line"),
            TransportErrorKind::ProtocolError
        );
        assert_eq!(classify_error("EOF"), TransportErrorKind::Unexpected);
    }

    #[test]
    fn test_aac_channels() {
        // AAC-LC, 44.1 kHz, stereo
        assert_eq!(aac_channels(&[0x12, 0x10]), 2);
        // AAC-LC, 8 kHz, mono
        assert_eq!(aac_channels(&[0x15, 0x88]), 1);
        assert_eq!(aac_channels(&[]), 2);
    }

    #[test]
    fn test_video_codec() {
        assert_eq!(video_codec("H264"), Some(Codec::H264));
        assert_eq!(video_codec("h265"), Some(Codec::H265));
        assert_eq!(video_codec("jpeg"), None);
    }
}
