use std::fmt;
use std::sync::Arc;

use crate::utils::timing::TimeBase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CodecId {
    H264,
    H265,
    Aac,
    Pcm,
    RawVideo,
    Other(String),
}

impl CodecId {
    pub fn kind(&self) -> Option<MediaKind> {
        match self {
            CodecId::H264 | CodecId::H265 | CodecId::RawVideo => Some(MediaKind::Video),
            CodecId::Aac | CodecId::Pcm => Some(MediaKind::Audio),
            CodecId::Other(_) => None,
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecId::H264 => f.write_str("h264"),
            CodecId::H265 => f.write_str("h265"),
            CodecId::Aac => f.write_str("aac"),
            CodecId::Pcm => f.write_str("pcm"),
            CodecId::RawVideo => f.write_str("rawvideo"),
            CodecId::Other(name) => f.write_str(name),
        }
    }
}

/// How the container frames a stream's packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Packaging {
    /// Payloads are already in the form the decoder expects.
    #[default]
    AsIs,
    /// NAL units prefixed by their length; parameter sets live in codec-private data.
    LengthPrefixed,
    /// AAC frames without an ADTS header.
    Headerless,
}

impl fmt::Display for Packaging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Packaging::AsIs => "as-is",
            Packaging::LengthPrefixed => "length-prefixed",
            Packaging::Headerless => "headerless",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelLayout {
    #[default]
    I420,
    Nv12,
    Rgb24,
}

impl PixelLayout {
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelLayout::I420 | PixelLayout::Nv12 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
            PixelLayout::Rgb24 => w * h * 3,
        }
    }
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PixelLayout::I420 => "i420",
            PixelLayout::Nv12 => "nv12",
            PixelLayout::Rgb24 => "rgb24",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SampleFormat {
    #[default]
    F32,
    S16,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::F32 => 4,
            SampleFormat::S16 => 2,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SampleFormat::F32 => "f32le",
            SampleFormat::S16 => "s16le",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 0 {
            return f.write_str("unknown");
        }
        write!(f, "{:.3}", self.num as f64 / self.den as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_layout: PixelLayout,
    pub frame_rate: Option<FrameRate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    /// MPEG-4 audio object type, when the container states it.
    pub profile: Option<u8>,
}

/// Negotiated format parameters carried on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatParams {
    Video(VideoFormat),
    Audio(AudioFormat),
}

impl FormatParams {
    pub fn kind(&self) -> MediaKind {
        match self {
            FormatParams::Video(_) => MediaKind::Video,
            FormatParams::Audio(_) => MediaKind::Audio,
        }
    }

    pub fn video(&self) -> Option<&VideoFormat> {
        match self {
            FormatParams::Video(v) => Some(v),
            FormatParams::Audio(_) => None,
        }
    }

    pub fn audio(&self) -> Option<&AudioFormat> {
        match self {
            FormatParams::Audio(a) => Some(a),
            FormatParams::Video(_) => None,
        }
    }
}

impl fmt::Display for FormatParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatParams::Video(v) => {
                write!(f, "{}x{} {}", v.width, v.height, v.pixel_layout)?;
                if let Some(rate) = v.frame_rate {
                    write!(f, " @ {rate} fps")?;
                }
                Ok(())
            }
            FormatParams::Audio(a) => {
                write!(f, "{} Hz, {} ch, {}", a.sample_rate, a.channels, a.sample_format)
            }
        }
    }
}

/// Immutable description of one elementary stream in a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub index: u32,
    pub kind: MediaKind,
    pub codec: CodecId,
    pub time_base: TimeBase,
    /// Known at open time for most containers; `None` until a later format event otherwise.
    pub format: Option<FormatParams>,
    pub packaging: Packaging,
    /// Parameter sets (`avcC`/`hvcC`) or AudioSpecificConfig.
    pub codec_private: Arc<[u8]>,
}

impl StreamDescriptor {
    pub fn new(index: u32, kind: MediaKind, codec: CodecId, time_base: TimeBase) -> Self {
        Self {
            index,
            kind,
            codec,
            time_base,
            format: None,
            packaging: Packaging::AsIs,
            codec_private: Arc::from(Vec::new()),
        }
    }

    pub fn with_format(mut self, format: FormatParams) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_packaging(mut self, packaging: Packaging) -> Self {
        self.packaging = packaging;
        self
    }

    pub fn with_codec_private(mut self, codec_private: impl Into<Arc<[u8]>>) -> Self {
        self.codec_private = codec_private.into();
        self
    }
}
