use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Deserializer};

use crate::input::InputReader;
use mediapipe::structs::stream::{
    AudioFormat, CodecId, FormatParams, FrameRate, Packaging, PixelLayout, SampleFormat,
    VideoFormat,
};
use mediapipe::synthetic::{SyntheticSource, SyntheticStream};
use mediapipe::utils::timing::TimeBase;

/// A synthetic container described in YAML.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub read_error_after: Option<u64>,
    #[serde(default)]
    pub unreadable: bool,
    pub streams: Vec<StreamEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamEntry {
    #[serde(deserialize_with = "codec_id")]
    pub codec: CodecId,
    #[serde(default)]
    pub packaging: PackagingName,
    #[serde(deserialize_with = "time_base")]
    pub time_base: TimeBase,
    pub packets: u64,
    pub packet_duration: i64,
    #[serde(default)]
    pub start_pts: i64,
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval: u64,
    #[serde(default)]
    pub missing_pts: Vec<u64>,
    #[serde(default)]
    pub corrupt: Vec<u64>,
    #[serde(default)]
    pub late_format: bool,
    #[serde(default)]
    pub video: Option<VideoParams>,
    #[serde(default)]
    pub audio: Option<AudioParams>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackagingName {
    #[default]
    AsIs,
    LengthPrefixed,
    Headerless,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub pixel_layout: PixelLayoutName,
    #[serde(default, deserialize_with = "frame_rate")]
    pub frame_rate: Option<FrameRate>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelLayoutName {
    #[default]
    I420,
    Nv12,
    Rgb24,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    #[serde(default)]
    pub sample_format: SampleFormatName,
    #[serde(default)]
    pub profile: Option<u8>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormatName {
    #[default]
    F32,
    S16,
}

fn default_keyframe_interval() -> u64 {
    10
}

fn parse_ratio(text: &str) -> Result<(i64, i64)> {
    let (num, den) = text
        .split_once('/')
        .ok_or_else(|| anyhow!("expected a ratio like 1/90000, got '{text}'"))?;
    Ok((num.trim().parse()?, den.trim().parse()?))
}

fn codec_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<CodecId, D::Error> {
    let name = String::deserialize(deserializer)?;
    Ok(match name.to_ascii_lowercase().as_str() {
        "h264" | "avc" => CodecId::H264,
        "h265" | "hevc" => CodecId::H265,
        "aac" => CodecId::Aac,
        "pcm" => CodecId::Pcm,
        "rawvideo" | "raw" => CodecId::RawVideo,
        _ => CodecId::Other(name),
    })
}

fn time_base<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeBase, D::Error> {
    let text = String::deserialize(deserializer)?;
    let (num, den) = parse_ratio(&text).map_err(serde::de::Error::custom)?;
    TimeBase::new(num, den).map_err(serde::de::Error::custom)
}

fn frame_rate<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<FrameRate>, D::Error> {
    let Some(text) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let (num, den) = parse_ratio(&text).map_err(serde::de::Error::custom)?;
    let num = u32::try_from(num).map_err(serde::de::Error::custom)?;
    let den = u32::try_from(den).map_err(serde::de::Error::custom)?;
    Ok(Some(FrameRate { num, den }))
}

impl Scenario {
    /// Reads a scenario from a YAML file, or stdin for "-".
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = InputReader::new(path)
            .with_context(|| format!("Failed to open scenario {}", path.display()))?;
        let data = reader.read_all()?;
        let scenario = Self::parse(&data).with_context(|| {
            let source = if reader.is_pipe() {
                "stdin".to_string()
            } else {
                path.display().to_string()
            };
            format!("Invalid scenario in {source}")
        })?;
        Ok(scenario)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(serde_yaml_ng::from_slice(data)?)
    }

    pub fn display_name(&self, path: &Path) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| path.display().to_string())
    }

    pub fn total_packets(&self) -> u64 {
        self.streams.iter().map(|s| s.packets).sum()
    }

    pub fn to_source(&self) -> Result<SyntheticSource> {
        let streams = self
            .streams
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                entry.to_stream(index as u32)
                    .with_context(|| format!("Stream {index}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SyntheticSource {
            streams,
            read_error_after: self.read_error_after,
            unreadable: self.unreadable,
        })
    }
}

impl StreamEntry {
    fn format(&self) -> Result<FormatParams> {
        match (&self.video, &self.audio) {
            (Some(v), None) => Ok(FormatParams::Video(VideoFormat {
                width: v.width,
                height: v.height,
                pixel_layout: match v.pixel_layout {
                    PixelLayoutName::I420 => PixelLayout::I420,
                    PixelLayoutName::Nv12 => PixelLayout::Nv12,
                    PixelLayoutName::Rgb24 => PixelLayout::Rgb24,
                },
                frame_rate: v.frame_rate,
            })),
            (None, Some(a)) => Ok(FormatParams::Audio(AudioFormat {
                sample_rate: a.sample_rate,
                channels: a.channels,
                sample_format: match a.sample_format {
                    SampleFormatName::F32 => SampleFormat::F32,
                    SampleFormatName::S16 => SampleFormat::S16,
                },
                profile: a.profile,
            })),
            (Some(_), Some(_)) => bail!("both video and audio parameters given"),
            (None, None) => bail!("one of video or audio parameters is required"),
        }
    }

    fn to_stream(&self, index: u32) -> Result<SyntheticStream> {
        let format = self.format()?;
        if let Some(kind) = self.codec.kind() {
            if kind != format.kind() {
                bail!("codec {} is {kind}, but {} parameters were given", self.codec, format.kind());
            }
        }

        let mut stream = SyntheticStream::new(index, self.codec.clone(), self.time_base, format);
        stream.packaging = match self.packaging {
            PackagingName::AsIs => Packaging::AsIs,
            PackagingName::LengthPrefixed => Packaging::LengthPrefixed,
            PackagingName::Headerless => Packaging::Headerless,
        };
        stream.packet_count = self.packets;
        stream.packet_duration = self.packet_duration;
        stream.start_pts = self.start_pts;
        stream.keyframe_interval = self.keyframe_interval;
        stream.missing_pts = self.missing_pts.clone();
        stream.corrupt = self.corrupt.clone();
        stream.late_format = self.late_format;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
name: trailer
read_error_after: 40
streams:
  - codec: h264
    packaging: length-prefixed
    time_base: 1/90000
    packets: 25
    packet_duration: 3600
    corrupt: [5]
    video: { width: 64, height: 32, frame_rate: 25/1 }
  - codec: aac
    packaging: headerless
    time_base: 1/48000
    packets: 47
    packet_duration: 1024
    audio: { sample_rate: 48000, channels: 2, profile: 2 }
"#;

    #[test]
    fn parses_into_synthetic_source() -> Result<()> {
        let scenario = Scenario::parse(SCENARIO.as_bytes())?;
        assert_eq!(scenario.display_name(Path::new("x.yaml")), "trailer");
        assert_eq!(scenario.total_packets(), 72);

        let source = scenario.to_source()?;
        assert_eq!(source.read_error_after, Some(40));
        assert_eq!(source.streams.len(), 2);

        let video = &source.streams[0];
        assert_eq!(video.index, 0);
        assert_eq!(video.codec, CodecId::H264);
        assert_eq!(video.packaging, Packaging::LengthPrefixed);
        assert_eq!(video.time_base, TimeBase::MPEG);
        assert_eq!(video.corrupt, vec![5]);
        assert_eq!(video.keyframe_interval, 10);
        assert_eq!(
            video.format.video().and_then(|v| v.frame_rate),
            Some(FrameRate { num: 25, den: 1 })
        );

        let audio = &source.streams[1];
        assert_eq!(audio.format.audio().and_then(|a| a.profile), Some(2));
        Ok(())
    }

    #[test]
    fn rejects_mismatched_parameters() -> Result<()> {
        let text = r#"
streams:
  - codec: aac
    time_base: 1/48000
    packets: 1
    packet_duration: 1024
    video: { width: 2, height: 2 }
"#;
        let scenario = Scenario::parse(text.as_bytes())?;
        assert!(scenario.to_source().is_err());
        Ok(())
    }

    #[test]
    fn rejects_bad_time_base() {
        let text = r#"
streams:
  - codec: pcm
    time_base: 1/0
    packets: 1
    packet_duration: 1
    audio: { sample_rate: 8000, channels: 1 }
"#;
        assert!(Scenario::parse(text.as_bytes()).is_err());
    }
}
