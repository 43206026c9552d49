//! Status messages from the pipeline to the application.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

use log::trace;

use crate::pipeline::State;
use crate::structs::event::GroupId;
use crate::structs::port::Port;
use crate::structs::stream::StreamDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Pipeline,
    Demux,
    Decoder,
    Sink,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageKind::Pipeline => "pipeline",
            StageKind::Demux => "demux",
            StageKind::Decoder => "decoder",
            StageKind::Sink => "sink",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Open,
    DecoderInit,
    TransientDecode,
    Link,
    IoRead,
    Reformat,
    Present,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Open => "open",
            ErrorKind::DecoderInit => "decoder-init",
            ErrorKind::TransientDecode => "transient-decode",
            ErrorKind::Link => "link",
            ErrorKind::IoRead => "io-read",
            ErrorKind::Reformat => "reformat",
            ErrorKind::Present => "present",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    StateChanged {
        old: State,
        new: State,
    },
    StreamsDiscovered {
        group_id: GroupId,
        streams: Vec<StreamDescriptor>,
    },
    PortAdded(Port),
    SinkFinished {
        stream_index: u32,
    },
    /// Recoverable; the stage carried on.
    Warning {
        kind: ErrorKind,
        stage: StageKind,
        stream_index: Option<u32>,
        message: String,
    },
    /// Fatal to the stage (or, for open and link errors, to the pipeline).
    Error {
        kind: ErrorKind,
        stage: StageKind,
        stream_index: Option<u32>,
        message: String,
    },
    /// Every leg has drained.
    EndOfStream,
}

#[derive(Debug, Clone)]
pub struct Bus {
    tx: mpsc::Sender<Message>,
}

impl Bus {
    pub fn channel() -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    pub fn post(&self, message: Message) {
        if self.tx.send(message).is_err() {
            trace!("Bus receiver dropped, message discarded");
        }
    }

    pub fn warning(
        &self,
        kind: ErrorKind,
        stage: StageKind,
        stream_index: Option<u32>,
        err: &dyn fmt::Display,
    ) {
        self.post(Message::Warning {
            kind,
            stage,
            stream_index,
            message: err.to_string(),
        });
    }

    pub fn error(
        &self,
        kind: ErrorKind,
        stage: StageKind,
        stream_index: Option<u32>,
        err: &dyn fmt::Display,
    ) {
        self.post(Message::Error {
            kind,
            stage,
            stream_index,
            message: err.to_string(),
        });
    }
}

/// Counts the parties that must finish before `EndOfStream` is posted.
#[derive(Debug, Default)]
pub struct EosTracker {
    active: AtomicUsize,
}

impl EosTracker {
    pub fn register(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    /// Posts `EndOfStream` when the last registered party finishes.
    pub fn finish(&self, bus: &Bus) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            bus.post(Message::EndOfStream);
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}
