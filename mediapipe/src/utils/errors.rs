use std::path::PathBuf;

use crate::structs::stream::{CodecId, MediaKind};

#[derive(thiserror::Error, Debug)]
pub enum OpenError {
    #[error("Container not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Container {} is unreadable: {reason}", .path.display())]
    Unreadable { path: PathBuf, reason: String },

    #[error("No audio or video stream found in {}", .0.display())]
    NoStreams(PathBuf),
}

#[derive(thiserror::Error, Debug)]
pub enum DecoderInitError {
    #[error("Unsupported codec {codec} on stream {stream_index}: {reason}")]
    Unsupported {
        stream_index: u32,
        codec: CodecId,
        reason: String,
    },

    #[error("Failed to open decoder for stream {stream_index}: {reason}")]
    OpenFailed { stream_index: u32, reason: String },
}

impl DecoderInitError {
    pub fn stream_index(&self) -> u32 {
        match self {
            DecoderInitError::Unsupported { stream_index, .. }
            | DecoderInitError::OpenFailed { stream_index, .. } => *stream_index,
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Decode error on stream {stream_index}, packet {packet_number}: {reason}")]
pub struct TransientDecodeError {
    pub stream_index: u32,
    pub packet_number: u64,
    pub reason: String,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Requested stream {0} does not exist in the container")]
    UnknownStream(u32),

    #[error("No stage constructor registered for {kind} streams (stream {stream_index})")]
    NoConstructor { stream_index: u32, kind: MediaKind },

    #[error("Port for stream {0} is already linked")]
    AlreadyLinked(u32),

    #[error("{stage} stage expects {expected} on its {direction} port")]
    TypeMismatch {
        stage: &'static str,
        direction: &'static str,
        expected: &'static str,
    },

    #[error("{stage} stage for stream {stream_index} has no {direction} binding")]
    Unbound {
        stage: &'static str,
        stream_index: u32,
        direction: &'static str,
    },

    #[error("Stage no longer accepts bindings")]
    ShuttingDown,
}

#[derive(thiserror::Error, Debug)]
#[error("Read error after {packets_read} packets: {reason}")]
pub struct IoReadError {
    pub packets_read: u64,
    pub reason: String,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReformatError {
    #[error("Sample rate {0} Hz has no ADTS sampling frequency index")]
    UnsupportedSampleRate(u32),

    #[error("Channel count {0} cannot be signalled in an ADTS header")]
    UnsupportedChannelCount(u16),

    #[error("AAC profile is unknown for this stream")]
    UnknownProfile,

    #[error("Audio object type {0} cannot be carried in ADTS")]
    UnsupportedObjectType(u8),

    #[error("Frame of {0} bytes exceeds the 13-bit ADTS frame length")]
    FrameTooLarge(usize),

    #[error("Codec-private record is malformed: {0}")]
    MalformedConfig(&'static str),

    #[error("NAL length size {0} is not one of 1, 2 or 4")]
    InvalidNalLengthSize(u8),

    #[error("Truncated NAL unit: needs {needed} bytes at offset {offset}, {available} available")]
    TruncatedNal {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum PresentError {
    #[error("Failed to configure {kind} surface for stream {stream_index}: {reason}")]
    Configure {
        stream_index: u32,
        kind: MediaKind,
        reason: String,
    },
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBaseError {
    #[error("Time base numerator must be positive, got {0}")]
    InvalidNumerator(i64),

    #[error("Time base denominator must be positive, got {0}")]
    InvalidDenominator(i64),
}

#[derive(thiserror::Error, Debug)]
pub enum TransitionError {
    #[error("No source location set")]
    NoSource,

    #[error("Source location cannot change in the {0} state")]
    SourceLocked(crate::pipeline::State),

    #[error(transparent)]
    Open(#[from] OpenError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("Failed to spawn {stage} worker: {source}")]
    Spawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },
}
