use std::fmt;

use crate::structs::stream::{FormatParams, MediaKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

/// A typed, directional connection point tagged with its negotiated format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub stream_index: u32,
    pub direction: Direction,
    pub format: FormatParams,
}

impl Port {
    pub fn output(stream_index: u32, format: FormatParams) -> Self {
        Self {
            stream_index,
            direction: Direction::Output,
            format,
        }
    }

    pub fn input(stream_index: u32, format: FormatParams) -> Self {
        Self {
            stream_index,
            direction: Direction::Input,
            format,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.format.kind()
    }

    /// Pad-style name, `video_0`, `audio_1`, ...
    pub fn name(&self) -> String {
        format!("{}_{}", self.kind(), self.stream_index)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Input => "sink",
            Direction::Output => "src",
        };
        write!(f, "{}:{dir} [{}]", self.name(), self.format)
    }
}
