//! Stream descriptor and frame types shared by every pipeline stage

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::error::ConfigError;

/// Stream index of a frame. One buffer lane and one container track per lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Lane {
    Video,
    Audio,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Video, Lane::Audio];

    pub fn index(self) -> usize {
        match self {
            Lane::Video => 0,
            Lane::Audio => 1,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Video => f.write_str("video"),
            Lane::Audio => f.write_str("audio"),
        }
    }
}

/// Codecs the container writer can store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    H264,
    H265,
    Aac,
}

impl Codec {
    pub fn lane(self) -> Lane {
        match self {
            Codec::H264 | Codec::H265 => Lane::Video,
            Codec::Aac => Lane::Audio,
        }
    }
}

/// Negotiated parameters of one elementary stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecParameters {
    pub codec: Codec,
    /// Timestamp units per second for this lane
    pub clock_rate: u32,
    pub width: u16,
    pub height: u16,
    pub channels: u16,
    pub sample_rate: u32,
    /// Decoder configuration record: avcC/hvcC body for video,
    /// AudioSpecificConfig for AAC
    pub extra_data: Bytes,
}

impl CodecParameters {
    pub fn video(codec: Codec, clock_rate: u32, width: u16, height: u16, extra_data: Bytes) -> Self {
        Self {
            codec,
            clock_rate,
            width,
            height,
            channels: 0,
            sample_rate: 0,
            extra_data,
        }
    }

    pub fn audio(clock_rate: u32, channels: u16, sample_rate: u32, extra_data: Bytes) -> Self {
        Self {
            codec: Codec::Aac,
            clock_rate,
            width: 0,
            height: 0,
            channels,
            sample_rate,
            extra_data,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// What to record and, once connected, what the server negotiated.
///
/// Immutable once a session starts; a reconnect produces a fresh descriptor
/// via [`StreamDescriptor::negotiated`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    url: Url,
    credentials: Option<Credentials>,
    video: Option<CodecParameters>,
    audio: Option<CodecParameters>,
}

impl StreamDescriptor {
    /// Parse and validate an RTSP URL. Credentials embedded in the URL are
    /// moved out of it.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let mut url = Url::parse(url.trim())
            .map_err(|e| ConfigError(format!("invalid RTSP URL {:?}: {}", url, e)))?;

        // The RTSP client speaks plain rtsp:// only (TCP interleaved, no TLS)
        if url.scheme() != "rtsp" {
            return Err(ConfigError(format!(
                "unsupported URL scheme {:?} (expected rtsp)",
                url.scheme()
            )));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(ConfigError(format!("RTSP URL {} has no host", url)));
        }

        let credentials = if url.username().is_empty() {
            None
        } else {
            Some(Credentials {
                username: url.username().to_string(),
                password: url.password().unwrap_or_default().to_string(),
            })
        };
        // Url only fails these on cannot-be-a-base URLs, which rtsp:// is not
        let _ = url.set_username("");
        let _ = url.set_password(None);

        Ok(Self {
            url,
            credentials,
            video: None,
            audio: None,
        })
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Copy of this descriptor carrying freshly negotiated codec parameters
    pub fn negotiated(&self, video: Option<CodecParameters>, audio: Option<CodecParameters>) -> Self {
        Self {
            url: self.url.clone(),
            credentials: self.credentials.clone(),
            video,
            audio,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn video(&self) -> Option<&CodecParameters> {
        self.video.as_ref()
    }

    pub fn audio(&self) -> Option<&CodecParameters> {
        self.audio.as_ref()
    }

    pub fn lane(&self, lane: Lane) -> Option<&CodecParameters> {
        match lane {
            Lane::Video => self.video(),
            Lane::Audio => self.audio(),
        }
    }

    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    /// True when both descriptors negotiated identical codec parameters
    pub fn same_codecs(&self, other: &StreamDescriptor) -> bool {
        self.video == other.video && self.audio == other.audio
    }
}

/// One encoded access unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub lane: Lane,
    /// Presentation timestamp in the lane's clock rate
    pub pts: i64,
    /// Decode timestamp in the lane's clock rate
    pub dts: i64,
    pub keyframe: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(lane: Lane, pts: i64, dts: i64, keyframe: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            lane,
            pts,
            dts,
            keyframe,
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Decode time in seconds given the lane's clock rate
    pub fn dts_secs(&self, clock_rate: u32) -> f64 {
        self.dts as f64 / f64::from(clock_rate.max(1))
    }
}
