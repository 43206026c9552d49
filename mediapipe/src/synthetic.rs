//! Built-in collaborators that fabricate media instead of parsing it.
//!
//! The container side produces interleaved packets for a list of declared
//! streams, framed the way real containers frame them (length-prefixed NAL
//! units with an `avcC`/`hvcC` record, headerless AAC with an
//! AudioSpecificConfig). The codec side checks the framing a real decoder would
//! insist on and emits one correctly sized raw frame per packet. The collecting
//! backend records what was presented and when.
//!
//! Every elementary payload ends in a marker: `SYN` followed by the packet's
//! sequence number, or `BAD` for packets declared corrupt.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use bitstream_io::{BigEndian, BitWrite, BitWriter};
use log::debug;
use parking_lot::Mutex;

use crate::backend::{
    CodecLibrary, Container, ContainerProbe, Decoder, PresentationBackend, ReadEvent, Surface,
};
use crate::process::reformat::{
    ADTS_HEADER_LEN, ADTS_SAMPLE_RATES, AdtsConfig, NalFamily, START_CODE, SampleRatePolicy,
    parse_adts_header, split_annex_b,
};
use crate::structs::frame::{DecodedFrame, FrameLayout, RawFrame};
use crate::structs::packet::{CompressedPacket, RawPacket};
use crate::structs::stream::{
    AudioFormat, CodecId, FormatParams, MediaKind, Packaging, PixelLayout, StreamDescriptor,
    VideoFormat,
};
use crate::utils::errors::OpenError;
use crate::utils::timing::{Clock, ClockTime, NANOS_PER_SECOND, TimeBase, normalize};

pub const GOOD_MARKER: &[u8; 3] = b"SYN";
pub const CORRUPT_MARKER: &[u8; 3] = b"BAD";

/// Packets of a late-format stream read before its format event.
pub const LATE_FORMAT_AFTER: u64 = 2;

const H264_SPS: [u8; 8] = [0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x02, 0x80, 0xBF];
const H264_PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];
const H265_VPS: [u8; 6] = [0x40, 0x01, 0x0C, 0x01, 0xFF, 0xFF];
const H265_SPS: [u8; 6] = [0x42, 0x01, 0x01, 0x01, 0x60, 0x00];
const H265_PPS: [u8; 4] = [0x44, 0x01, 0xC1, 0x72];

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticStream {
    pub index: u32,
    pub codec: CodecId,
    pub time_base: TimeBase,
    pub format: FormatParams,
    pub packaging: Packaging,
    pub packet_count: u64,
    /// In time base units.
    pub packet_duration: i64,
    pub start_pts: i64,
    /// Every n-th video packet is a keyframe; audio packets always are.
    pub keyframe_interval: u64,
    pub missing_pts: Vec<u64>,
    pub corrupt: Vec<u64>,
    /// Withhold the format until [`LATE_FORMAT_AFTER`] packets have been read.
    pub late_format: bool,
}

impl SyntheticStream {
    pub fn new(index: u32, codec: CodecId, time_base: TimeBase, format: FormatParams) -> Self {
        Self {
            index,
            codec,
            time_base,
            format,
            packaging: Packaging::AsIs,
            packet_count: 10,
            packet_duration: 1,
            start_pts: 0,
            keyframe_interval: 10,
            missing_pts: Vec::new(),
            corrupt: Vec::new(),
            late_format: false,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.format.kind()
    }

    pub fn descriptor(&self) -> StreamDescriptor {
        let mut descriptor =
            StreamDescriptor::new(self.index, self.kind(), self.codec.clone(), self.time_base)
                .with_packaging(self.packaging)
                .with_codec_private(self.codec_private());
        if !self.late_format {
            descriptor = descriptor.with_format(self.format);
        }
        descriptor
    }

    fn is_keyframe(&self, sequence: u64) -> bool {
        match self.kind() {
            MediaKind::Audio => true,
            MediaKind::Video => sequence % self.keyframe_interval.max(1) == 0,
        }
    }

    fn pts(&self, sequence: u64) -> i64 {
        self.start_pts
            .saturating_add((sequence as i64).saturating_mul(self.packet_duration))
    }

    fn codec_private(&self) -> Vec<u8> {
        match (&self.codec, self.packaging) {
            (CodecId::H264, Packaging::LengthPrefixed) => avcc_record(),
            (CodecId::H265, Packaging::LengthPrefixed) => hvcc_record(),
            (CodecId::Aac, Packaging::Headerless) => self
                .format
                .audio()
                .and_then(|audio| audio_specific_config(audio).ok())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn body(&self, sequence: u64) -> Vec<u8> {
        let marker = if self.corrupt.contains(&sequence) {
            CORRUPT_MARKER
        } else {
            GOOD_MARKER
        };
        let mut body = marker.to_vec();
        body.extend_from_slice(&sequence.to_be_bytes());
        body
    }

    fn payload(&self, sequence: u64) -> Vec<u8> {
        let body = self.body(sequence);
        let key = self.is_keyframe(sequence);

        let (header, parameter_sets): (&[u8], &[&[u8]]) = match (&self.codec, key) {
            (CodecId::H264, true) => (&[0x65], &[&H264_SPS, &H264_PPS]),
            (CodecId::H264, false) => (&[0x41], &[]),
            (CodecId::H265, true) => (&[0x26, 0x01], &[&H265_VPS, &H265_SPS, &H265_PPS]),
            (CodecId::H265, false) => (&[0x02, 0x01], &[]),
            (CodecId::Aac, _) => return self.aac_payload(body),
            _ => return body,
        };

        let mut nal = header.to_vec();
        nal.extend_from_slice(&body);

        match self.packaging {
            Packaging::LengthPrefixed => {
                let mut out = (nal.len() as u32).to_be_bytes().to_vec();
                out.extend_from_slice(&nal);
                out
            }
            _ => {
                let mut out = Vec::new();
                for unit in parameter_sets.iter().chain([&nal[..]].iter()) {
                    out.extend_from_slice(&START_CODE);
                    out.extend_from_slice(unit);
                }
                out
            }
        }
    }

    fn aac_payload(&self, body: Vec<u8>) -> Vec<u8> {
        if self.packaging == Packaging::Headerless {
            return body;
        }
        let header = self
            .format
            .audio()
            .and_then(|audio| AdtsConfig::from_format(audio, SampleRatePolicy::Nearest).ok())
            .and_then(|config| config.synthesize_header(body.len()).ok());
        match header {
            Some(header) => [&header[..], &body[..]].concat(),
            None => body,
        }
    }
}

fn avcc_record() -> Vec<u8> {
    let mut record = vec![1, H264_SPS[1], H264_SPS[2], H264_SPS[3], 0xFF, 0xE1];
    record.extend_from_slice(&(H264_SPS.len() as u16).to_be_bytes());
    record.extend_from_slice(&H264_SPS);
    record.push(1);
    record.extend_from_slice(&(H264_PPS.len() as u16).to_be_bytes());
    record.extend_from_slice(&H264_PPS);
    record
}

fn hvcc_record() -> Vec<u8> {
    let mut record = vec![1];
    record.extend_from_slice(&[0u8; 20]);
    record.push(0x0F);
    record.push(3);
    for (nal_type, nal) in [(32u8, &H265_VPS[..]), (33, &H265_SPS[..]), (34, &H265_PPS[..])] {
        record.push(0x80 | nal_type);
        record.extend_from_slice(&1u16.to_be_bytes());
        record.extend_from_slice(&(nal.len() as u16).to_be_bytes());
        record.extend_from_slice(nal);
    }
    record
}

/// Minimal AudioSpecificConfig; needs a known profile.
fn audio_specific_config(audio: &AudioFormat) -> io::Result<Vec<u8>> {
    let object_type = audio
        .profile
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "profile unknown"))?;
    let channel_config = match audio.channels {
        1..=6 => audio.channels as u8,
        8 => 7,
        _ => 0,
    };

    let mut bs = BitWriter::endian(Vec::new(), BigEndian);
    bs.write_unsigned_var::<u8>(5, object_type)?;
    match ADTS_SAMPLE_RATES.iter().position(|&r| r == audio.sample_rate) {
        Some(index) => bs.write_unsigned_var::<u8>(4, index as u8)?,
        None => {
            bs.write_unsigned_var::<u8>(4, 0x0F)?;
            bs.write_unsigned_var::<u32>(24, audio.sample_rate)?;
        }
    }
    bs.write_unsigned_var::<u8>(4, channel_config)?;
    bs.write_unsigned_var::<u8>(3, 0)?;
    bs.byte_align()?;
    Ok(bs.into_writer())
}

/// A fabricated container.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyntheticSource {
    pub streams: Vec<SyntheticStream>,
    /// Fail the read that follows this many packets.
    pub read_error_after: Option<u64>,
    pub unreadable: bool,
}

impl SyntheticSource {
    pub fn new(streams: Vec<SyntheticStream>) -> Self {
        Self {
            streams,
            ..Default::default()
        }
    }

    pub fn descriptors(&self) -> Vec<StreamDescriptor> {
        self.streams.iter().map(SyntheticStream::descriptor).collect()
    }

    pub fn container(&self) -> SyntheticContainer {
        SyntheticContainer {
            cursors: vec![0; self.streams.len()],
            format_sent: self.streams.iter().map(|s| !s.late_format).collect(),
            source: self.clone(),
            packets_read: 0,
        }
    }
}

pub struct SyntheticContainer {
    source: SyntheticSource,
    cursors: Vec<u64>,
    format_sent: Vec<bool>,
    packets_read: u64,
}

impl SyntheticContainer {
    fn next_stream(&self) -> Option<usize> {
        self.source
            .streams
            .iter()
            .enumerate()
            .filter(|(n, s)| self.cursors[*n] < s.packet_count)
            .min_by_key(|(n, s)| {
                let pts = normalize(Some(s.pts(self.cursors[*n])), s.time_base);
                (pts.unwrap_or(ClockTime::ZERO), s.index)
            })
            .map(|(n, _)| n)
    }
}

impl Container for SyntheticContainer {
    fn read(&mut self) -> Result<ReadEvent> {
        if let Some(limit) = self.source.read_error_after {
            if self.packets_read >= limit {
                bail!("synthetic read error after {limit} packets");
            }
        }

        for (n, stream) in self.source.streams.iter().enumerate() {
            let due = self.cursors[n] >= LATE_FORMAT_AFTER.min(stream.packet_count);
            if !self.format_sent[n] && due {
                self.format_sent[n] = true;
                return Ok(ReadEvent::Format {
                    stream_index: stream.index,
                    params: stream.format,
                });
            }
        }

        let Some(n) = self.next_stream() else {
            return Ok(ReadEvent::Eof);
        };
        let stream = &self.source.streams[n];
        let sequence = self.cursors[n];
        self.cursors[n] += 1;
        self.packets_read += 1;

        let pts = (!stream.missing_pts.contains(&sequence)).then(|| stream.pts(sequence));
        Ok(ReadEvent::Packet(RawPacket {
            stream_index: stream.index,
            payload: stream.payload(sequence),
            pts,
            dts: pts,
            duration: Some(stream.packet_duration),
            keyframe: stream.is_keyframe(sequence),
        }))
    }
}

/// Maps paths to fabricated containers.
#[derive(Debug, Default)]
pub struct SyntheticProbe {
    sources: Mutex<HashMap<PathBuf, SyntheticSource>>,
}

impl SyntheticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(self, path: impl Into<PathBuf>, source: SyntheticSource) -> Self {
        self.insert(path, source);
        self
    }

    pub fn insert(&self, path: impl Into<PathBuf>, source: SyntheticSource) {
        self.sources.lock().insert(path.into(), source);
    }
}

impl ContainerProbe for SyntheticProbe {
    fn open(&self, path: &Path) -> Result<(Vec<StreamDescriptor>, Box<dyn Container>), OpenError> {
        let sources = self.sources.lock();
        let source = sources
            .get(path)
            .ok_or_else(|| OpenError::NotFound(path.to_path_buf()))?;

        if source.unreadable {
            return Err(OpenError::Unreadable {
                path: path.to_path_buf(),
                reason: "container header is damaged".into(),
            });
        }

        Ok((source.descriptors(), Box::new(source.container())))
    }
}

/// Decoders for every codec the synthetic container produces.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticCodecs;

impl CodecLibrary for SyntheticCodecs {
    fn open_decoder(
        &self,
        descriptor: &StreamDescriptor,
        params: &FormatParams,
    ) -> Result<Box<dyn Decoder>> {
        let family = match &descriptor.codec {
            CodecId::H264 => Some(NalFamily::H264),
            CodecId::H265 => Some(NalFamily::H265),
            CodecId::Aac | CodecId::Pcm | CodecId::RawVideo => None,
            CodecId::Other(name) => bail!("no decoder for codec '{name}'"),
        };

        if descriptor.codec.kind() != Some(params.kind()) {
            bail!(
                "{} decoder cannot take {} parameters",
                descriptor.codec,
                params.kind()
            );
        }

        let output = match params {
            FormatParams::Video(v) => FormatParams::Video(VideoFormat {
                pixel_layout: match descriptor.codec {
                    CodecId::RawVideo => v.pixel_layout,
                    _ => PixelLayout::I420,
                },
                ..*v
            }),
            FormatParams::Audio(a) => FormatParams::Audio(AudioFormat { profile: None, ..*a }),
        };

        debug!("Synthetic {} decoder for stream {}", descriptor.codec, descriptor.index);
        Ok(Box::new(SyntheticDecoder {
            codec: descriptor.codec.clone(),
            family,
            output,
            seen_parameter_sets: false,
        }))
    }
}

struct SyntheticDecoder {
    codec: CodecId,
    family: Option<NalFamily>,
    output: FormatParams,
    seen_parameter_sets: bool,
}

impl SyntheticDecoder {
    fn elementary_body<'a>(&mut self, payload: &'a [u8]) -> Result<&'a [u8]> {
        if let Some(family) = self.family {
            if !payload.starts_with(&[0, 0, 1]) && !payload.starts_with(&START_CODE) {
                bail!("payload does not begin with a start code");
            }

            let header_len = match family {
                NalFamily::H264 => 1,
                NalFamily::H265 => 2,
            };
            for nal in split_annex_b(payload) {
                let Some(nal_type) = family.nal_type(nal) else {
                    continue;
                };
                if family.is_parameter_set(nal_type) {
                    self.seen_parameter_sets = true;
                    continue;
                }
                let keyframe = match family {
                    NalFamily::H264 => nal_type == 5,
                    NalFamily::H265 => (16..=21).contains(&nal_type),
                };
                if keyframe && !self.seen_parameter_sets {
                    bail!("keyframe arrived before any parameter set");
                }
                return nal
                    .get(header_len..)
                    .ok_or_else(|| anyhow!("NAL unit shorter than its header"));
            }
            bail!("no slice NAL unit in access unit");
        }

        if self.codec == CodecId::Aac {
            let (_, frame_len) =
                parse_adts_header(payload).ok_or_else(|| anyhow!("missing ADTS sync word"))?;
            if frame_len != payload.len() {
                bail!(
                    "ADTS frame length {frame_len} does not match packet size {}",
                    payload.len()
                );
            }
            return Ok(&payload[ADTS_HEADER_LEN..]);
        }

        Ok(payload)
    }
}

impl Decoder for SyntheticDecoder {
    fn decode(&mut self, packet: &CompressedPacket) -> Result<Vec<RawFrame>> {
        let body = self.elementary_body(&packet.payload)?;
        if !body.starts_with(GOOD_MARKER) {
            bail!("corrupt payload");
        }

        let frame = match self.output {
            FormatParams::Video(v) => RawFrame {
                payload: vec![
                    (packet.sequence & 0xFF) as u8;
                    v.pixel_layout.frame_size(v.width, v.height)
                ],
                layout: FrameLayout::Picture {
                    width: v.width,
                    height: v.height,
                    pixel_layout: v.pixel_layout,
                },
            },
            FormatParams::Audio(a) => {
                let nanos_per_second = NANOS_PER_SECOND as i128;
                let count = packet
                    .duration
                    .map(|d| {
                        (d.nanos().max(0) as i128 * a.sample_rate as i128 + nanos_per_second / 2)
                            / nanos_per_second
                    })
                    .map_or(1024, |n| n.clamp(1, u32::MAX as i128) as u32);
                let len = count as usize * a.channels as usize * a.sample_format.bytes_per_sample();
                RawFrame {
                    payload: vec![0; len],
                    layout: FrameLayout::Samples {
                        count,
                        channels: a.channels,
                        sample_format: a.sample_format,
                    },
                }
            }
        };
        Ok(vec![frame])
    }

    fn output_format(&self) -> FormatParams {
        self.output
    }
}

/// What a [`CollectingBackend`] surface saw.
#[derive(Debug, Clone, PartialEq)]
pub struct Presented {
    pub stream_index: u32,
    pub sequence: u64,
    pub pts: Option<ClockTime>,
    /// Pipeline clock reading at presentation.
    pub presented_at: ClockTime,
    pub payload_len: usize,
}

/// Records presented frames for inspection. Clones share the record.
#[derive(Clone)]
pub struct CollectingBackend {
    clock: Arc<dyn Clock>,
    presented: Arc<Mutex<Vec<Presented>>>,
    finished: Arc<Mutex<Vec<u32>>>,
    refuse: Option<MediaKind>,
}

impl CollectingBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            presented: Arc::default(),
            finished: Arc::default(),
            refuse: None,
        }
    }

    /// Fails `configure` for streams of `kind`.
    pub fn refusing(mut self, kind: MediaKind) -> Self {
        self.refuse = Some(kind);
        self
    }

    pub fn presented(&self) -> Vec<Presented> {
        self.presented.lock().clone()
    }

    pub fn presented_for(&self, stream_index: u32) -> Vec<Presented> {
        self.presented
            .lock()
            .iter()
            .filter(|p| p.stream_index == stream_index)
            .cloned()
            .collect()
    }

    pub fn finished(&self) -> Vec<u32> {
        self.finished.lock().clone()
    }
}

impl PresentationBackend for CollectingBackend {
    fn configure(
        &self,
        descriptor: &StreamDescriptor,
        params: &FormatParams,
    ) -> Result<Box<dyn Surface>> {
        if self.refuse == Some(params.kind()) {
            bail!("no {} output available", params.kind());
        }
        Ok(Box::new(CollectingSurface {
            stream_index: descriptor.index,
            backend: self.clone(),
        }))
    }
}

struct CollectingSurface {
    stream_index: u32,
    backend: CollectingBackend,
}

impl Surface for CollectingSurface {
    fn present(&mut self, frame: &DecodedFrame) -> Result<()> {
        self.backend.presented.lock().push(Presented {
            stream_index: frame.stream_index,
            sequence: frame.sequence,
            pts: frame.pts,
            presented_at: self.backend.clock.now(),
            payload_len: frame.payload.len(),
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.backend.finished.lock().push(self.stream_index);
        Ok(())
    }
}
