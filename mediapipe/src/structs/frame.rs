use crate::structs::stream::{PixelLayout, SampleFormat};
use crate::utils::timing::ClockTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayout {
    Picture {
        width: u32,
        height: u32,
        pixel_layout: PixelLayout,
    },
    /// Interleaved samples.
    Samples {
        count: u32,
        channels: u16,
        sample_format: SampleFormat,
    },
}

/// Decoder output before the stage stamps it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub payload: Vec<u8>,
    pub layout: FrameLayout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub stream_index: u32,
    pub sequence: u64,
    /// Copied from the packet the frame was decoded from.
    pub pts: Option<ClockTime>,
    pub duration: Option<ClockTime>,
    pub payload: Vec<u8>,
    pub layout: FrameLayout,
}
