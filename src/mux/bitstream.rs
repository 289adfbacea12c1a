//! Elementary stream framing for the muxer
//!
//! The RTSP depacketizer hands out H.264/H.265 access units as 4-byte
//! length-prefixed NAL units (the layout avcC/hvcC describe) and AAC as raw
//! access units. The muxer wants Annex B video with the parameter sets
//! in-band on every keyframe, and ADTS-framed AAC.

use thiserror::Error;

use crate::media::Codec;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Largest frame an ADTS header can describe, header included
const ADTS_MAX_FRAME: usize = 0x1fff;
const ADTS_HEADER_LEN: usize = 7;

/// MPEG-4 sampling frequency table (ISO/IEC 14496-3, 1.6.3.4)
const SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitstreamError {
    #[error("NAL unit length {len} overruns the {remaining} bytes left in the access unit")]
    Truncated { len: usize, remaining: usize },

    #[error("malformed {0} decoder configuration record")]
    BadRecord(&'static str),

    #[error("unsupported AudioSpecificConfig: {0}")]
    BadAudioConfig(String),

    #[error("AAC frame of {0} bytes is too large for ADTS")]
    FrameTooLarge(usize),
}

/// Rewrites length-prefixed video access units as Annex B
#[derive(Debug, Clone)]
pub struct VideoFraming {
    length_size: usize,
    /// SPS/PPS (and VPS for H.265), already start-code prefixed
    parameter_sets: Vec<u8>,
}

impl VideoFraming {
    /// Read the NAL length size and parameter sets from an avcC or hvcC
    /// record
    pub fn from_record(codec: Codec, record: &[u8]) -> Result<Self, BitstreamError> {
        let (length_size, sets) = match codec {
            Codec::H264 => parse_avcc(record)?,
            Codec::H265 => parse_hvcc(record)?,
            Codec::Aac => return Err(BitstreamError::BadRecord("video")),
        };
        let mut parameter_sets = Vec::new();
        for nal in sets {
            parameter_sets.extend_from_slice(&START_CODE);
            parameter_sets.extend_from_slice(nal);
        }
        Ok(Self {
            length_size,
            parameter_sets,
        })
    }

    pub fn annex_b(&self, access_unit: &[u8], keyframe: bool) -> Result<Vec<u8>, BitstreamError> {
        let mut out = Vec::with_capacity(access_unit.len() + self.parameter_sets.len() + 16);
        if keyframe {
            out.extend_from_slice(&self.parameter_sets);
        }

        let mut rest = access_unit;
        while !rest.is_empty() {
            if rest.len() < self.length_size {
                return Err(BitstreamError::Truncated {
                    len: self.length_size,
                    remaining: rest.len(),
                });
            }
            let (prefix, body) = rest.split_at(self.length_size);
            let len = prefix.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
            if len > body.len() {
                return Err(BitstreamError::Truncated {
                    len,
                    remaining: body.len(),
                });
            }
            let (nal, tail) = body.split_at(len);
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nal);
            rest = tail;
        }
        Ok(out)
    }
}

/// Byte reader over a decoder configuration record
struct Record<'a> {
    data: &'a [u8],
    kind: &'static str,
}

impl<'a> Record<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BitstreamError> {
        if self.data.len() < n {
            return Err(BitstreamError::BadRecord(self.kind));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, BitstreamError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, BitstreamError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn nal(&mut self) -> Result<&'a [u8], BitstreamError> {
        let len = self.u16()?;
        self.take(usize::from(len))
    }
}

fn parse_avcc(record: &[u8]) -> Result<(usize, Vec<&[u8]>), BitstreamError> {
    let mut r = Record { data: record, kind: "avcC" };
    if r.u8()? != 1 {
        return Err(BitstreamError::BadRecord("avcC"));
    }
    r.take(3)?;
    let length_size = usize::from(r.u8()? & 0x03) + 1;

    let mut sets = Vec::new();
    let sps_count = r.u8()? & 0x1f;
    for _ in 0..sps_count {
        sets.push(r.nal()?);
    }
    let pps_count = r.u8()?;
    for _ in 0..pps_count {
        sets.push(r.nal()?);
    }
    if sets.is_empty() {
        return Err(BitstreamError::BadRecord("avcC"));
    }
    Ok((length_size, sets))
}

fn parse_hvcc(record: &[u8]) -> Result<(usize, Vec<&[u8]>), BitstreamError> {
    let mut r = Record { data: record, kind: "hvcC" };
    if r.u8()? != 1 {
        return Err(BitstreamError::BadRecord("hvcC"));
    }
    // Profile, level and format fields up to lengthSizeMinusOne
    r.take(20)?;
    let length_size = usize::from(r.u8()? & 0x03) + 1;

    let mut sets = Vec::new();
    let arrays = r.u8()?;
    for _ in 0..arrays {
        r.u8()?;
        let count = r.u16()?;
        for _ in 0..count {
            sets.push(r.nal()?);
        }
    }
    if sets.is_empty() {
        return Err(BitstreamError::BadRecord("hvcC"));
    }
    Ok((length_size, sets))
}

/// Wraps raw AAC access units in ADTS headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsFraming {
    /// Audio object type minus one
    profile: u8,
    freq_index: u8,
    channel_config: u8,
}

impl AdtsFraming {
    /// Derive the header fields from an AudioSpecificConfig. `sample_rate`
    /// resolves configs that spell the rate out instead of indexing it.
    pub fn from_config(config: &[u8], sample_rate: u32) -> Result<Self, BitstreamError> {
        let [b0, b1, ..] = config else {
            return Err(BitstreamError::BadAudioConfig(format!(
                "{} byte(s), need at least 2",
                config.len()
            )));
        };
        let object_type = b0 >> 3;
        if !(1..=4).contains(&object_type) {
            return Err(BitstreamError::BadAudioConfig(format!(
                "audio object type {} has no ADTS profile",
                object_type
            )));
        }

        let mut freq_index = ((b0 & 0x07) << 1) | (b1 >> 7);
        let channel_config = if freq_index == 0x0f {
            // 24-bit explicit rate follows the index
            freq_index = SAMPLE_RATES
                .iter()
                .position(|&rate| rate == sample_rate)
                .and_then(|i| u8::try_from(i).ok())
                .ok_or_else(|| {
                    BitstreamError::BadAudioConfig(format!("sample rate {} Hz", sample_rate))
                })?;
            match config.get(4) {
                Some(b4) => (b4 >> 3) & 0x0f,
                None => return Err(BitstreamError::BadAudioConfig("truncated".into())),
            }
        } else {
            (b1 >> 3) & 0x0f
        };
        if channel_config > 7 {
            return Err(BitstreamError::BadAudioConfig(format!(
                "channel configuration {}",
                channel_config
            )));
        }

        Ok(Self {
            profile: object_type - 1,
            freq_index,
            channel_config,
        })
    }

    pub fn frame(&self, access_unit: &[u8]) -> Result<Vec<u8>, BitstreamError> {
        let len = access_unit.len() + ADTS_HEADER_LEN;
        if len > ADTS_MAX_FRAME {
            return Err(BitstreamError::FrameTooLarge(access_unit.len()));
        }
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&[
            0xff,
            // MPEG-4, layer 0, no CRC
            0xf1,
            (self.profile << 6) | (self.freq_index << 2) | (self.channel_config >> 2),
            ((self.channel_config & 0x03) << 6) | ((len >> 11) as u8 & 0x03),
            ((len >> 3) & 0xff) as u8,
            (((len & 0x07) as u8) << 5) | 0x1f,
            0xfc,
        ]);
        out.extend_from_slice(access_unit);
        Ok(out)
    }
}
