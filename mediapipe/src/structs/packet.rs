use crate::utils::timing::ClockTime;

/// One unit read from a container, timestamps in the stream's native time base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub stream_index: u32,
    pub payload: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: Option<i64>,
    pub keyframe: bool,
}

impl RawPacket {
    pub fn new(stream_index: u32, payload: Vec<u8>) -> Self {
        Self {
            stream_index,
            payload,
            pts: None,
            dts: None,
            duration: None,
            keyframe: false,
        }
    }
}

/// A reformatted packet on its way to a decoder, timestamps normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedPacket {
    pub stream_index: u32,
    /// Position of this packet within its stream, starting at 0.
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub pts: Option<ClockTime>,
    pub dts: Option<ClockTime>,
    pub duration: Option<ClockTime>,
    pub keyframe: bool,
}
