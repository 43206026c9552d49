//! Bitstream reformatting applied by the demultiplexer before packets are queued.
//!
//! Two transforms exist:
//!
//! - **Length-prefixed to Annex-B** for H.264/H.265 carried `avcC`/`hvcC` style.
//!   Each NAL unit's length prefix is replaced with a 4-byte start code and the
//!   parameter sets from the codec-private record are inserted before the first
//!   access unit and before every keyframe that does not already carry them.
//! - **ADTS header synthesis** for raw AAC. A 7-byte header carrying the sync
//!   word, profile, sampling frequency index, channel configuration and the
//!   total frame length is prepended to every frame.
//!
//! A sample rate without an exact ADTS table entry is handled according to
//! [`SampleRatePolicy`]; it is never silently mapped to an arbitrary index.

use std::io;

use bitstream_io::{BigEndian, BitRead, BitReader, BitWrite, BitWriter};
use log::trace;

use crate::structs::stream::{AudioFormat, CodecId, FormatParams, Packaging, StreamDescriptor};
use crate::utils::errors::ReformatError;

pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

pub const ADTS_HEADER_LEN: usize = 7;

const ADTS_MAX_FRAME_LEN: usize = (1 << 13) - 1;

/// Sampling frequencies by ADTS sampling frequency index.
pub const ADTS_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// What to do when a stream's sample rate has no exact ADTS table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleRatePolicy {
    /// Refuse to build a header; the stream is not linked.
    #[default]
    Reject,
    /// Use the closest table entry.
    Nearest,
}

pub fn sample_rate_index(sample_rate: u32, policy: SampleRatePolicy) -> Result<u8, ReformatError> {
    if let Some(index) = ADTS_SAMPLE_RATES.iter().position(|&r| r == sample_rate) {
        return Ok(index as u8);
    }

    match policy {
        SampleRatePolicy::Reject => Err(ReformatError::UnsupportedSampleRate(sample_rate)),
        SampleRatePolicy::Nearest => {
            let (index, nearest) = ADTS_SAMPLE_RATES
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.abs_diff(sample_rate))
                .ok_or(ReformatError::UnsupportedSampleRate(sample_rate))?;
            log::warn!("No ADTS index for {sample_rate} Hz, using nearest {nearest} Hz");
            Ok(index as u8)
        }
    }
}

/// Fields of an ADTS header that stay constant for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsConfig {
    /// MPEG-4 audio object type, 1 (Main) to 4 (LTP).
    pub object_type: u8,
    pub sample_rate_index: u8,
    pub channel_config: u8,
}

impl AdtsConfig {
    pub fn new(
        object_type: u8,
        sample_rate_index: u8,
        channel_config: u8,
    ) -> Result<Self, ReformatError> {
        if !(1..=4).contains(&object_type) {
            return Err(ReformatError::UnsupportedObjectType(object_type));
        }
        if sample_rate_index as usize >= ADTS_SAMPLE_RATES.len() {
            return Err(ReformatError::MalformedConfig(
                "sampling frequency index out of range",
            ));
        }
        if channel_config > 7 {
            return Err(ReformatError::UnsupportedChannelCount(channel_config as u16));
        }
        Ok(Self {
            object_type,
            sample_rate_index,
            channel_config,
        })
    }

    /// Reads object type, sampling frequency and channel configuration from an
    /// AudioSpecificConfig.
    pub fn from_audio_specific_config(
        asc: &[u8],
        policy: SampleRatePolicy,
    ) -> Result<Self, ReformatError> {
        const TRUNCATED: ReformatError = ReformatError::MalformedConfig("truncated AudioSpecificConfig");

        let mut bs = BitReader::endian(asc, BigEndian);
        let mut object_type = bs.read_unsigned_var::<u8>(5).map_err(|_| TRUNCATED)?;
        if object_type == 31 {
            object_type = 32 + bs.read_unsigned_var::<u8>(6).map_err(|_| TRUNCATED)?;
        }

        let mut index = bs.read_unsigned_var::<u8>(4).map_err(|_| TRUNCATED)?;
        if index == 0xF {
            let explicit = bs.read_unsigned_var::<u32>(24).map_err(|_| TRUNCATED)?;
            index = sample_rate_index(explicit, policy)?;
        }

        let channel_config = bs.read_unsigned_var::<u8>(4).map_err(|_| TRUNCATED)?;

        Self::new(object_type, index, channel_config)
    }

    /// Builds the header fields from format parameters. The profile must be known.
    pub fn from_format(format: &AudioFormat, policy: SampleRatePolicy) -> Result<Self, ReformatError> {
        let object_type = format.profile.ok_or(ReformatError::UnknownProfile)?;
        let index = sample_rate_index(format.sample_rate, policy)?;
        let channel_config = match format.channels {
            1..=6 => format.channels as u8,
            8 => 7,
            other => return Err(ReformatError::UnsupportedChannelCount(other)),
        };

        Self::new(object_type, index, channel_config)
    }

    pub fn sample_rate(&self) -> u32 {
        ADTS_SAMPLE_RATES[self.sample_rate_index as usize]
    }

    /// Builds the 7-byte header for a frame whose raw payload is `payload_len` bytes.
    pub fn synthesize_header(&self, payload_len: usize) -> Result<[u8; ADTS_HEADER_LEN], ReformatError> {
        let frame_len = payload_len + ADTS_HEADER_LEN;
        if frame_len > ADTS_MAX_FRAME_LEN {
            return Err(ReformatError::FrameTooLarge(frame_len));
        }

        let bytes = self
            .write_header(frame_len as u16)
            .map_err(|_| ReformatError::MalformedConfig("ADTS header write failed"))?;

        let mut header = [0u8; ADTS_HEADER_LEN];
        header.copy_from_slice(&bytes);
        Ok(header)
    }

    fn write_header(&self, frame_len: u16) -> io::Result<Vec<u8>> {
        let mut bs = BitWriter::endian(Vec::with_capacity(ADTS_HEADER_LEN), BigEndian);

        bs.write_unsigned_var::<u16>(12, 0x0FFF)?; // syncword
        bs.write_bit(false)?; // MPEG-4
        bs.write_unsigned_var::<u8>(2, 0)?; // layer
        bs.write_bit(true)?; // protection absent
        bs.write_unsigned_var::<u8>(2, self.object_type - 1)?;
        bs.write_unsigned_var::<u8>(4, self.sample_rate_index)?;
        bs.write_bit(false)?; // private
        bs.write_unsigned_var::<u8>(3, self.channel_config)?;
        bs.write_unsigned_var::<u8>(4, 0)?; // original, home, copyright id/start
        bs.write_unsigned_var::<u16>(13, frame_len)?;
        bs.write_unsigned_var::<u16>(11, 0x07FF)?; // VBR buffer fullness
        bs.write_unsigned_var::<u8>(2, 0)?; // one raw data block

        Ok(bs.into_writer())
    }
}

/// Parses an ADTS header, returning its fields and the frame length it declares.
pub fn parse_adts_header(data: &[u8]) -> Option<(AdtsConfig, usize)> {
    if data.len() < ADTS_HEADER_LEN {
        return None;
    }

    let mut bs = BitReader::endian(data, BigEndian);
    let parse = |bs: &mut BitReader<&[u8], BigEndian>| -> io::Result<Option<(u8, u8, u8, u16)>> {
        if bs.read_unsigned_var::<u16>(12)? != 0x0FFF {
            return Ok(None);
        }
        bs.skip(4)?; // id, layer, protection absent
        let profile = bs.read_unsigned_var::<u8>(2)?;
        let index = bs.read_unsigned_var::<u8>(4)?;
        bs.skip(1)?;
        let channels = bs.read_unsigned_var::<u8>(3)?;
        bs.skip(4)?;
        let frame_len = bs.read_unsigned_var::<u16>(13)?;
        Ok(Some((profile, index, channels, frame_len)))
    };

    let (profile, index, channels, frame_len) = parse(&mut bs).ok()??;
    let config = AdtsConfig::new(profile + 1, index, channels).ok()?;
    Some((config, frame_len as usize))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalFamily {
    H264,
    H265,
}

impl NalFamily {
    pub fn nal_type(&self, nal: &[u8]) -> Option<u8> {
        let first = *nal.first()?;
        Some(match self {
            NalFamily::H264 => first & 0x1F,
            NalFamily::H265 => (first >> 1) & 0x3F,
        })
    }

    pub fn is_parameter_set(&self, nal_type: u8) -> bool {
        match self {
            NalFamily::H264 => matches!(nal_type, 7 | 8),
            NalFamily::H265 => matches!(nal_type, 32..=34),
        }
    }
}

/// Splits an Annex-B byte stream into NAL units, start codes removed.
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut units = Vec::with_capacity(starts.len());
    for (n, &start) in starts.iter().enumerate() {
        let mut end = match starts.get(n + 1) {
            Some(&next) => next - 3,
            None => data.len(),
        };
        while end > start && data[end - 1] == 0 {
            end -= 1;
        }
        units.push(&data[start..end]);
    }
    units
}

/// Length-prefixed to start-code conversion for one stream.
#[derive(Debug, Clone)]
pub struct AnnexBConverter {
    family: NalFamily,
    nal_length_size: u8,
    /// Parameter sets, already in Annex-B form.
    parameter_sets: Vec<u8>,
    first_emitted: bool,
}

fn truncated(what: &'static str) -> impl Fn(io::Error) -> ReformatError {
    move |_| ReformatError::MalformedConfig(what)
}

fn read_nal_array(
    bs: &mut BitReader<&[u8], BigEndian>,
    count: u16,
    out: &mut Vec<u8>,
    what: &'static str,
) -> Result<(), ReformatError> {
    for _ in 0..count {
        let len = bs.read_unsigned_var::<u16>(16).map_err(truncated(what))? as usize;
        let mut nal = vec![0u8; len];
        bs.read_bytes(&mut nal).map_err(truncated(what))?;
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&nal);
    }
    Ok(())
}

impl AnnexBConverter {
    pub fn new(family: NalFamily, nal_length_size: u8) -> Result<Self, ReformatError> {
        if !matches!(nal_length_size, 1 | 2 | 4) {
            return Err(ReformatError::InvalidNalLengthSize(nal_length_size));
        }
        Ok(Self {
            family,
            nal_length_size,
            parameter_sets: Vec::new(),
            first_emitted: false,
        })
    }

    /// Parses an `AVCDecoderConfigurationRecord`.
    pub fn from_avcc(record: &[u8]) -> Result<Self, ReformatError> {
        const WHAT: &str = "truncated avcC record";

        let mut bs = BitReader::endian(record, BigEndian);
        let version = bs.read_unsigned_var::<u8>(8).map_err(truncated(WHAT))?;
        if version != 1 {
            return Err(ReformatError::MalformedConfig("avcC version is not 1"));
        }
        bs.skip(24).map_err(truncated(WHAT))?; // profile, compatibility, level
        bs.skip(6).map_err(truncated(WHAT))?;
        let length_size = bs.read_unsigned_var::<u8>(2).map_err(truncated(WHAT))? + 1;

        let mut converter = Self::new(NalFamily::H264, length_size)?;

        bs.skip(3).map_err(truncated(WHAT))?;
        let sps_count = bs.read_unsigned_var::<u16>(5).map_err(truncated(WHAT))?;
        read_nal_array(&mut bs, sps_count, &mut converter.parameter_sets, WHAT)?;

        let pps_count = bs.read_unsigned_var::<u16>(8).map_err(truncated(WHAT))?;
        read_nal_array(&mut bs, pps_count, &mut converter.parameter_sets, WHAT)?;

        Ok(converter)
    }

    /// Parses an `HEVCDecoderConfigurationRecord`.
    pub fn from_hvcc(record: &[u8]) -> Result<Self, ReformatError> {
        const WHAT: &str = "truncated hvcC record";

        let mut bs = BitReader::endian(record, BigEndian);
        let version = bs.read_unsigned_var::<u8>(8).map_err(truncated(WHAT))?;
        if version != 1 {
            return Err(ReformatError::MalformedConfig("hvcC version is not 1"));
        }
        bs.skip(20 * 8).map_err(truncated(WHAT))?; // profile/tier/level through temporal fields
        bs.skip(6).map_err(truncated(WHAT))?;
        let length_size = bs.read_unsigned_var::<u8>(2).map_err(truncated(WHAT))? + 1;

        let mut converter = Self::new(NalFamily::H265, length_size)?;

        let arrays = bs.read_unsigned_var::<u8>(8).map_err(truncated(WHAT))?;
        for _ in 0..arrays {
            bs.skip(8).map_err(truncated(WHAT))?; // completeness, reserved, NAL type
            let count = bs.read_unsigned_var::<u16>(16).map_err(truncated(WHAT))?;
            read_nal_array(&mut bs, count, &mut converter.parameter_sets, WHAT)?;
        }

        Ok(converter)
    }

    pub fn family(&self) -> NalFamily {
        self.family
    }

    pub fn nal_length_size(&self) -> u8 {
        self.nal_length_size
    }

    pub fn parameter_sets(&self) -> &[u8] {
        &self.parameter_sets
    }

    pub fn convert(&mut self, payload: &[u8], keyframe: bool) -> Result<Vec<u8>, ReformatError> {
        let size = self.nal_length_size as usize;
        let mut out = Vec::with_capacity(payload.len() + self.parameter_sets.len() + 16);
        let mut has_parameter_sets = false;
        let mut units = Vec::new();

        let mut offset = 0;
        while offset < payload.len() {
            if offset + size > payload.len() {
                return Err(ReformatError::TruncatedNal {
                    offset,
                    needed: size,
                    available: payload.len() - offset,
                });
            }
            let len = payload[offset..offset + size]
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | b as usize);
            offset += size;

            if offset + len > payload.len() {
                return Err(ReformatError::TruncatedNal {
                    offset,
                    needed: len,
                    available: payload.len() - offset,
                });
            }
            let nal = &payload[offset..offset + len];
            offset += len;

            if let Some(nal_type) = self.family.nal_type(nal) {
                has_parameter_sets |= self.family.is_parameter_set(nal_type);
            }
            units.push(nal);
        }

        if (keyframe || !self.first_emitted) && !has_parameter_sets {
            out.extend_from_slice(&self.parameter_sets);
        }
        for nal in units {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nal);
        }

        self.first_emitted = true;
        Ok(out)
    }
}

/// Per-stream transform chosen from the stream's packaging.
#[derive(Debug, Clone)]
pub enum Reformatter {
    Passthrough,
    AnnexB(AnnexBConverter),
    Adts(AdtsConfig),
}

impl Reformatter {
    pub fn for_stream(
        descriptor: &StreamDescriptor,
        format: &FormatParams,
        policy: SampleRatePolicy,
    ) -> Result<Self, ReformatError> {
        let private = &descriptor.codec_private[..];

        let reformatter = match (descriptor.packaging, &descriptor.codec) {
            (Packaging::AsIs, _) => Reformatter::Passthrough,
            (Packaging::LengthPrefixed, CodecId::H264) if private.is_empty() => {
                Reformatter::AnnexB(AnnexBConverter::new(NalFamily::H264, 4)?)
            }
            (Packaging::LengthPrefixed, CodecId::H264) => {
                Reformatter::AnnexB(AnnexBConverter::from_avcc(private)?)
            }
            (Packaging::LengthPrefixed, CodecId::H265) if private.is_empty() => {
                Reformatter::AnnexB(AnnexBConverter::new(NalFamily::H265, 4)?)
            }
            (Packaging::LengthPrefixed, CodecId::H265) => {
                Reformatter::AnnexB(AnnexBConverter::from_hvcc(private)?)
            }
            (Packaging::LengthPrefixed, _) => {
                return Err(ReformatError::MalformedConfig(
                    "length-prefixed packaging requires H.264 or H.265",
                ));
            }
            (Packaging::Headerless, CodecId::Aac) if !private.is_empty() => {
                Reformatter::Adts(AdtsConfig::from_audio_specific_config(private, policy)?)
            }
            (Packaging::Headerless, CodecId::Aac) => {
                let audio = format.audio().ok_or(ReformatError::MalformedConfig(
                    "AAC stream without audio format parameters",
                ))?;
                Reformatter::Adts(AdtsConfig::from_format(audio, policy)?)
            }
            (Packaging::Headerless, _) => {
                return Err(ReformatError::MalformedConfig(
                    "header synthesis is only defined for AAC",
                ));
            }
        };

        trace!(
            "Stream {}: {} reformatter selected",
            descriptor.index,
            reformatter.name()
        );
        Ok(reformatter)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Reformatter::Passthrough => "passthrough",
            Reformatter::AnnexB(_) => "annexb",
            Reformatter::Adts(_) => "adts",
        }
    }

    pub fn apply(&mut self, payload: Vec<u8>, keyframe: bool) -> Result<Vec<u8>, ReformatError> {
        match self {
            Reformatter::Passthrough => Ok(payload),
            Reformatter::AnnexB(converter) => converter.convert(&payload, keyframe),
            Reformatter::Adts(config) => {
                let header = config.synthesize_header(payload.len())?;
                let mut out = Vec::with_capacity(ADTS_HEADER_LEN + payload.len());
                out.extend_from_slice(&header);
                out.extend_from_slice(&payload);
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::stream::{MediaKind, SampleFormat};
    use crate::utils::timing::TimeBase;

    const SPS: [u8; 4] = [0x67, 0x42, 0x00, 0x1E];
    const PPS: [u8; 3] = [0x68, 0xCE, 0x38];

    fn avcc() -> Vec<u8> {
        let mut record = vec![1, 0x42, 0x00, 0x1E, 0xFF, 0xE1];
        record.extend_from_slice(&(SPS.len() as u16).to_be_bytes());
        record.extend_from_slice(&SPS);
        record.push(1);
        record.extend_from_slice(&(PPS.len() as u16).to_be_bytes());
        record.extend_from_slice(&PPS);
        record
    }

    fn aac_format(sample_rate: u32, profile: Option<u8>) -> AudioFormat {
        AudioFormat {
            sample_rate,
            channels: 2,
            sample_format: SampleFormat::F32,
            profile,
        }
    }

    #[test]
    fn adts_header_layout() -> anyhow::Result<()> {
        let config = AdtsConfig::from_format(&aac_format(44100, Some(2)), SampleRatePolicy::Reject)?;
        let header = config.synthesize_header(100)?;
        assert_eq!(header, [0xFF, 0xF1, 0x50, 0x80, 0x0D, 0x7F, 0xFC]);

        let (parsed, frame_len) = parse_adts_header(&header).ok_or(anyhow::anyhow!("no header"))?;
        assert_eq!(parsed, config);
        assert_eq!(frame_len, 107);
        Ok(())
    }

    #[test]
    fn adts_from_audio_specific_config() -> anyhow::Result<()> {
        // AAC-LC, 44.1 kHz, stereo
        let config = AdtsConfig::from_audio_specific_config(&[0x12, 0x10], SampleRatePolicy::Reject)?;
        assert_eq!(config.object_type, 2);
        assert_eq!(config.sample_rate(), 44100);
        assert_eq!(config.channel_config, 2);
        Ok(())
    }

    #[test]
    fn unmatched_sample_rate_follows_policy() {
        assert_eq!(
            sample_rate_index(44000, SampleRatePolicy::Reject),
            Err(ReformatError::UnsupportedSampleRate(44000))
        );
        assert_eq!(sample_rate_index(44000, SampleRatePolicy::Nearest), Ok(4));
        assert_eq!(sample_rate_index(100_000, SampleRatePolicy::Nearest), Ok(0));
        assert_eq!(sample_rate_index(48000, SampleRatePolicy::Reject), Ok(3));
    }

    #[test]
    fn missing_profile_is_rejected() {
        assert_eq!(
            AdtsConfig::from_format(&aac_format(48000, None), SampleRatePolicy::Nearest),
            Err(ReformatError::UnknownProfile)
        );
    }

    #[test]
    fn oversized_frame_is_rejected() -> anyhow::Result<()> {
        let config = AdtsConfig::new(2, 3, 2)?;
        assert_eq!(
            config.synthesize_header(8191),
            Err(ReformatError::FrameTooLarge(8198))
        );
        assert!(config.synthesize_header(8184).is_ok());
        Ok(())
    }

    #[test]
    fn avcc_to_annex_b_inserts_parameter_sets() -> anyhow::Result<()> {
        let mut converter = AnnexBConverter::from_avcc(&avcc())?;
        assert_eq!(converter.nal_length_size(), 4);

        let idr = [0x65, 0x88, 0x84];
        let mut payload = (idr.len() as u32).to_be_bytes().to_vec();
        payload.extend_from_slice(&idr);

        let first = converter.convert(&payload, true)?;
        let units = split_annex_b(&first);
        assert_eq!(units, vec![&SPS[..], &PPS[..], &idr[..]]);

        let slice = [0x41, 0x9A];
        let mut payload = (slice.len() as u32).to_be_bytes().to_vec();
        payload.extend_from_slice(&slice);
        let second = converter.convert(&payload, false)?;
        assert_eq!(second, [0, 0, 0, 1, 0x41, 0x9A]);
        Ok(())
    }

    #[test]
    fn in_band_parameter_sets_are_not_duplicated() -> anyhow::Result<()> {
        let mut converter = AnnexBConverter::from_avcc(&avcc())?;
        let mut payload = Vec::new();
        for nal in [&SPS[..], &PPS[..], &[0x65, 0x01][..]] {
            payload.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            payload.extend_from_slice(nal);
        }
        let out = converter.convert(&payload, true)?;
        assert_eq!(split_annex_b(&out).len(), 3);
        Ok(())
    }

    #[test]
    fn two_byte_length_prefix() -> anyhow::Result<()> {
        let mut converter = AnnexBConverter::new(NalFamily::H264, 2)?;
        let out = converter.convert(&[0x00, 0x02, 0x41, 0x01, 0x00, 0x01, 0x41], false)?;
        assert_eq!(out, [0, 0, 0, 1, 0x41, 0x01, 0, 0, 0, 1, 0x41]);
        Ok(())
    }

    #[test]
    fn truncated_nal_is_an_error() -> anyhow::Result<()> {
        let mut converter = AnnexBConverter::new(NalFamily::H264, 4)?;
        let err = converter.convert(&[0, 0, 0, 9, 0x65], true);
        assert_eq!(
            err,
            Err(ReformatError::TruncatedNal {
                offset: 4,
                needed: 9,
                available: 1
            })
        );
        assert_eq!(
            AnnexBConverter::new(NalFamily::H264, 3).err(),
            Some(ReformatError::InvalidNalLengthSize(3))
        );
        Ok(())
    }

    #[test]
    fn hvcc_parameter_sets() -> anyhow::Result<()> {
        let vps = [0x40, 0x01, 0x0C];
        let sps = [0x42, 0x01, 0x01];
        let pps = [0x44, 0x01, 0xC1];

        let mut record = vec![1];
        record.extend_from_slice(&[0u8; 20]);
        record.push(0x0F); // length size 4
        record.push(3);
        for (nal_type, nal) in [(32u8, &vps), (33, &sps), (34, &pps)] {
            record.push(0x80 | nal_type);
            record.extend_from_slice(&1u16.to_be_bytes());
            record.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            record.extend_from_slice(nal);
        }

        let mut converter = AnnexBConverter::from_hvcc(&record)?;
        assert_eq!(converter.family(), NalFamily::H265);

        let idr = [0x26, 0x01, 0xAF];
        let mut payload = (idr.len() as u32).to_be_bytes().to_vec();
        payload.extend_from_slice(&idr);
        let out = converter.convert(&payload, true)?;
        assert_eq!(
            split_annex_b(&out),
            vec![&vps[..], &sps[..], &pps[..], &idr[..]]
        );
        Ok(())
    }

    #[test]
    fn reformatter_selection() -> anyhow::Result<()> {
        let format = FormatParams::Audio(aac_format(44000, Some(2)));
        let descriptor = StreamDescriptor::new(1, MediaKind::Audio, CodecId::Aac, TimeBase::new(1, 44000)?)
            .with_packaging(Packaging::Headerless)
            .with_format(format);

        assert_eq!(
            Reformatter::for_stream(&descriptor, &format, SampleRatePolicy::Reject).err(),
            Some(ReformatError::UnsupportedSampleRate(44000))
        );

        let mut adts = Reformatter::for_stream(&descriptor, &format, SampleRatePolicy::Nearest)?;
        assert_eq!(adts.name(), "adts");
        let out = adts.apply(vec![0xAA; 10], true)?;
        assert_eq!(out.len(), 17);
        assert_eq!(parse_adts_header(&out).map(|(_, len)| len), Some(17));

        let plain = descriptor.clone().with_packaging(Packaging::AsIs);
        let mut passthrough = Reformatter::for_stream(&plain, &format, SampleRatePolicy::Reject)?;
        assert_eq!(passthrough.apply(vec![1, 2, 3], false)?, vec![1, 2, 3]);
        Ok(())
    }
}
