use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use serde::Serialize;

use crate::wav::{SampleEncoding, WAVWriter};
use mediapipe::backend::{PresentationBackend, Surface};
use mediapipe::structs::frame::DecodedFrame;
use mediapipe::structs::stats::LegSnapshot;
use mediapipe::structs::stream::{FormatParams, PixelLayout, SampleFormat, StreamDescriptor};

pub fn create_path_with_suffix(base_path: &Path, suffix: &str) -> Result<PathBuf> {
    let file_name = base_path
        .file_name()
        .ok_or_else(|| anyhow!("Output path {} has no file name", base_path.display()))?;
    let mut path = base_path.to_path_buf();
    path.set_file_name(format!("{}.{suffix}", file_name.to_string_lossy()));
    Ok(path)
}

fn video_extension(layout: PixelLayout) -> &'static str {
    match layout {
        PixelLayout::I420 => "yuv",
        PixelLayout::Nv12 => "nv12",
        PixelLayout::Rgb24 => "rgb",
    }
}

/// Writes each leg to `<base>.<index>.wav` (audio) or `<base>.<index>.yuv` (video).
pub struct OutputBackend {
    base_path: PathBuf,
}

impl OutputBackend {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn path_for(&self, stream_index: u32, params: &FormatParams) -> Result<PathBuf> {
        let ext = match params {
            FormatParams::Audio(_) => "wav",
            FormatParams::Video(video) => video_extension(video.pixel_layout),
        };
        create_path_with_suffix(&self.base_path, &format!("{stream_index}.{ext}"))
    }
}

impl PresentationBackend for OutputBackend {
    fn configure(
        &self,
        descriptor: &StreamDescriptor,
        params: &FormatParams,
    ) -> Result<Box<dyn Surface>> {
        let path = self.path_for(descriptor.index, params)?;
        log::info!(
            "Stream {} ({params}) written to {}",
            descriptor.index,
            path.display()
        );

        match params {
            FormatParams::Audio(audio) => {
                let encoding = match audio.sample_format {
                    SampleFormat::F32 => SampleEncoding::Float32,
                    SampleFormat::S16 => SampleEncoding::Pcm16,
                };
                let mut writer = WAVWriter::new(
                    File::create(&path)?,
                    encoding,
                    audio.sample_rate,
                    audio.channels,
                );
                writer.write_header()?;
                Ok(Box::new(AudioSurface { writer, path }))
            }
            FormatParams::Video(_) => Ok(Box::new(VideoSurface {
                writer: BufWriter::new(File::create(&path)?),
                path,
                bytes_written: 0,
            })),
        }
    }
}

struct AudioSurface {
    writer: WAVWriter<File>,
    path: PathBuf,
}

impl Surface for AudioSurface {
    fn present(&mut self, frame: &DecodedFrame) -> Result<()> {
        self.writer.write_samples(&frame.payload)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.finish()?;
        log::debug!(
            "Finished {} ({} bytes of samples)",
            self.path.display(),
            self.writer.data_written()
        );
        Ok(())
    }
}

struct VideoSurface {
    writer: BufWriter<File>,
    path: PathBuf,
    bytes_written: u64,
}

impl Surface for VideoSurface {
    fn present(&mut self, frame: &DecodedFrame) -> Result<()> {
        self.writer.write_all(&frame.payload)?;
        self.bytes_written += frame.payload.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        log::debug!(
            "Finished {} ({} bytes of pictures)",
            self.path.display(),
            self.bytes_written
        );
        Ok(())
    }
}

/// Presents by dropping frames. Used when no output path is given.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardBackend;

impl PresentationBackend for DiscardBackend {
    fn configure(
        &self,
        descriptor: &StreamDescriptor,
        _params: &FormatParams,
    ) -> Result<Box<dyn Surface>> {
        Ok(Box::new(DiscardSurface {
            stream_index: descriptor.index,
        }))
    }
}

struct DiscardSurface {
    stream_index: u32,
}

impl Surface for DiscardSurface {
    fn present(&mut self, frame: &DecodedFrame) -> Result<()> {
        log::trace!(
            "Stream {} frame {} discarded ({} bytes)",
            self.stream_index,
            frame.sequence,
            frame.payload.len()
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct PlayReport {
    pub scenario: String,
    pub elapsed_secs: f64,
    pub end_of_stream: bool,
    pub errors: Vec<String>,
    pub legs: BTreeMap<u32, LegReport>,
}

#[derive(Debug, Serialize)]
pub struct LegReport {
    pub packets_routed: u64,
    pub packets_reformat_dropped: u64,
    pub frames_decoded: u64,
    pub transient_errors: u64,
    pub frames_presented: u64,
    pub frames_queue_dropped: u64,
    pub frames_late_dropped: u64,
}

impl From<&LegSnapshot> for LegReport {
    fn from(s: &LegSnapshot) -> Self {
        Self {
            packets_routed: s.packets_routed,
            packets_reformat_dropped: s.packets_reformat_dropped,
            frames_decoded: s.frames_decoded,
            transient_errors: s.transient_errors,
            frames_presented: s.frames_presented,
            frames_queue_dropped: s.frames_queue_dropped,
            frames_late_dropped: s.frames_late_dropped,
        }
    }
}

impl PlayReport {
    pub fn write(&self, base_path: &Path) -> Result<PathBuf> {
        let path = create_path_with_suffix(base_path, "report.yaml")?;
        std::fs::write(&path, serde_yaml_ng::to_string(self)?)?;
        Ok(path)
    }
}
