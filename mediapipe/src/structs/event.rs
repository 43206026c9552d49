use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::structs::stream::FormatParams;
use crate::utils::timing::{ClockTime, TimeBase};

static NEXT_GROUP_ID: AtomicU32 = AtomicU32::new(1);

/// Associates the ports that came out of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(u32);

impl GroupId {
    /// Unique for the lifetime of the process.
    pub fn next() -> Self {
        Self(NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn stream_id(&self, stream_index: u32) -> String {
        format!("{self}/{stream_index:02}")
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Running time of the first buffer.
    pub start: ClockTime,
    pub time_base: TimeBase,
}

/// Sticky events sent on a port before its first packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    StreamStart { group_id: GroupId, stream_id: String },
    Caps(FormatParams),
    Segment(Segment),
}

/// What travels through a stage-to-stage queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Item<T> {
    Event(StreamEvent),
    Data(T),
    EndOfStream,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_ids_are_unique_and_hex_formatted() {
        let a = GroupId::next();
        let b = GroupId::next();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 8);
        assert_eq!(GroupId(0x1f).stream_id(3), "0000001f/03");
    }
}
