//! Pipeline stages.
//!
//! Every stage owns one worker thread and talks to its neighbours only through
//! bounded queues:
//!
//! ```text
//! container → Demuxer ─packets→ DecoderStage ─frames→ SinkStage → surface
//!                     ─packets→ DecoderStage ─frames→ SinkStage → surface
//! ```
//!
//! Stages share one capability interface, [`Stage`], and are held by the
//! pipeline as the tagged variant [`StageSlot`].

pub mod decode;
pub mod demux;
pub mod reformat;
pub mod render;

use std::thread;

use anyhow::Result;
use log::{debug, error};

use crate::bus::StageKind;
use crate::structs::event::Item;
use crate::structs::frame::DecodedFrame;
use crate::structs::packet::CompressedPacket;
use crate::structs::port::Port;
use crate::utils::errors::{LinkError, TransitionError};
use crate::utils::queue::{Consumer, Producer};

use decode::DecoderStage;
use demux::Demuxer;
use render::SinkStage;

pub type PacketItem = Item<CompressedPacket>;
pub type FrameItem = Item<DecodedFrame>;

/// One end of a queue handed to a stage when it is bound.
#[derive(Debug)]
pub enum Link {
    PacketsIn(Consumer<PacketItem>),
    PacketsOut(Producer<PacketItem>),
    FramesIn(Consumer<FrameItem>),
    FramesOut(Producer<FrameItem>),
}

impl Link {
    pub fn describe(&self) -> &'static str {
        match self {
            Link::PacketsIn(_) => "packet consumer",
            Link::PacketsOut(_) => "packet producer",
            Link::FramesIn(_) => "frame consumer",
            Link::FramesOut(_) => "frame producer",
        }
    }
}

pub trait Stage {
    fn kind(&self) -> StageKind;

    fn bind_input(&mut self, port: &Port, link: Link) -> Result<(), LinkError>;

    fn bind_output(&mut self, port: &Port, link: Link) -> Result<(), LinkError>;

    fn start(&mut self) -> Result<(), TransitionError>;

    /// Closes the stage's queues. Returns without waiting for the worker.
    fn stop(&mut self);

    /// Waits for the worker to exit. Call after [`Stage::stop`].
    fn join(&mut self);
}

pub enum StageSlot {
    Demux(Demuxer),
    Decoder(DecoderStage),
    Sink(SinkStage),
}

impl StageSlot {
    pub fn stage(&mut self) -> &mut dyn Stage {
        match self {
            StageSlot::Demux(stage) => stage,
            StageSlot::Decoder(stage) => stage,
            StageSlot::Sink(stage) => stage,
        }
    }
}

pub(crate) fn spawn_worker<F>(
    stage: &'static str,
    name: String,
    body: F,
) -> Result<thread::JoinHandle<Result<()>>, TransitionError>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(body)
        .map_err(|source| TransitionError::Spawn { stage, source })
}

pub(crate) fn join_worker(handle: Option<thread::JoinHandle<Result<()>>>) {
    let Some(handle) = handle else {
        return;
    };
    let name = handle.thread().name().unwrap_or("worker").to_string();

    match handle.join() {
        Ok(Ok(())) => debug!("{name} joined"),
        Ok(Err(e)) => error!("{name} failed: {e:#}"),
        Err(_) => error!("{name} panicked"),
    }
}

pub(crate) fn mismatch(stage: &'static str, direction: &'static str, expected: &'static str) -> LinkError {
    LinkError::TypeMismatch {
        stage,
        direction,
        expected,
    }
}
