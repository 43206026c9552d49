//! Decoder stage: compressed packets in, decoded frames out.

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Result;
use log::{debug, info, trace, warn};

use crate::backend::{CodecLibrary, Decoder};
use crate::bus::{Bus, ErrorKind, StageKind};
use crate::process::{FrameItem, Link, PacketItem, Stage, join_worker, mismatch, spawn_worker};
use crate::structs::event::{Item, StreamEvent};
use crate::structs::frame::DecodedFrame;
use crate::structs::port::Port;
use crate::structs::stats::LegStats;
use crate::structs::stream::{CodecId, FormatParams, StreamDescriptor};
use crate::utils::errors::{DecoderInitError, LinkError, TransientDecodeError, TransitionError};
use crate::utils::queue::{Closer, Consumer, Producer, Push};

pub struct DecoderStage {
    descriptor: Arc<StreamDescriptor>,
    decoder: Option<Box<dyn Decoder>>,
    output_format: FormatParams,
    input: Option<Consumer<PacketItem>>,
    output: Option<Producer<FrameItem>>,
    closers: Vec<Closer>,
    stats: Arc<LegStats>,
    bus: Bus,
    handle: Option<JoinHandle<Result<()>>>,
}

impl DecoderStage {
    /// Opens the codec. Failing here is the only fatal condition for a decoder.
    pub fn new(
        descriptor: Arc<StreamDescriptor>,
        params: &FormatParams,
        codecs: &dyn CodecLibrary,
        stats: Arc<LegStats>,
        bus: Bus,
    ) -> Result<Self, DecoderInitError> {
        let decoder = codecs.open_decoder(&descriptor, params).map_err(|e| {
            let reason = format!("{e:#}");
            match &descriptor.codec {
                CodecId::Other(_) => DecoderInitError::Unsupported {
                    stream_index: descriptor.index,
                    codec: descriptor.codec.clone(),
                    reason,
                },
                _ => DecoderInitError::OpenFailed {
                    stream_index: descriptor.index,
                    reason,
                },
            }
        })?;

        let output_format = decoder.output_format();
        debug!(
            "Stream {}: {} decoder opened, output {output_format}",
            descriptor.index, descriptor.codec
        );

        Ok(Self {
            descriptor,
            decoder: Some(decoder),
            output_format,
            input: None,
            output: None,
            closers: Vec::new(),
            stats,
            bus,
            handle: None,
        })
    }

    pub fn stream_index(&self) -> u32 {
        self.descriptor.index
    }

    pub fn output_format(&self) -> FormatParams {
        self.output_format
    }
}

impl Stage for DecoderStage {
    fn kind(&self) -> StageKind {
        StageKind::Decoder
    }

    fn bind_input(&mut self, port: &Port, link: Link) -> Result<(), LinkError> {
        let Link::PacketsIn(consumer) = link else {
            return Err(mismatch("decoder", "input", "a packet consumer"));
        };
        if self.input.is_some() {
            return Err(LinkError::AlreadyLinked(port.stream_index));
        }
        self.closers.push(consumer.closer());
        self.input = Some(consumer);
        Ok(())
    }

    fn bind_output(&mut self, port: &Port, link: Link) -> Result<(), LinkError> {
        let Link::FramesOut(producer) = link else {
            return Err(mismatch("decoder", "output", "a frame producer"));
        };
        if self.output.is_some() {
            return Err(LinkError::AlreadyLinked(port.stream_index));
        }
        self.closers.push(producer.closer());
        self.output = Some(producer);
        Ok(())
    }

    fn start(&mut self) -> Result<(), TransitionError> {
        let index = self.descriptor.index;
        let unbound = |direction| LinkError::Unbound {
            stage: "decoder",
            stream_index: index,
            direction,
        };

        let input = self.input.take().ok_or_else(|| unbound("input"))?;
        let output = self.output.take().ok_or_else(|| unbound("output"))?;
        let decoder = self.decoder.take().ok_or_else(|| unbound("codec"))?;

        let worker = DecodeWorker {
            stream_index: index,
            decoder,
            input,
            output,
            stats: self.stats.clone(),
            bus: self.bus.clone(),
        };

        self.handle = Some(spawn_worker(
            "decoder",
            format!("decoder-{index}"),
            move || worker.run(),
        )?);
        Ok(())
    }

    fn stop(&mut self) {
        for closer in &self.closers {
            closer.close();
        }
    }

    fn join(&mut self) {
        join_worker(self.handle.take());
    }
}

struct DecodeWorker {
    stream_index: u32,
    decoder: Box<dyn Decoder>,
    input: Consumer<PacketItem>,
    output: Producer<FrameItem>,
    stats: Arc<LegStats>,
    bus: Bus,
}

impl DecodeWorker {
    fn run(mut self) -> Result<()> {
        let index = self.stream_index;
        let mut frames_out: u64 = 0;
        info!("Decoder for stream {index} started");

        while let Ok(item) = self.input.pop() {
            let packet = match item {
                Item::Data(packet) => packet,
                Item::Event(StreamEvent::Caps(params)) => {
                    debug!("Stream {index}: upstream caps {params}");
                    continue;
                }
                Item::Event(event) => {
                    trace!("Stream {index}: {event:?}");
                    continue;
                }
                Item::EndOfStream => {
                    debug!("Stream {index}: end of stream after {frames_out} frames");
                    self.forward(Item::EndOfStream);
                    break;
                }
            };

            let frames = match self.decoder.decode(&packet) {
                Ok(frames) => frames,
                Err(e) => {
                    let err = TransientDecodeError {
                        stream_index: index,
                        packet_number: packet.sequence,
                        reason: format!("{e:#}"),
                    };
                    warn!("{err}");
                    LegStats::bump(&self.stats.transient_errors);
                    self.bus.warning(
                        ErrorKind::TransientDecode,
                        StageKind::Decoder,
                        Some(index),
                        &err,
                    );
                    continue;
                }
            };

            for raw in frames {
                let frame = DecodedFrame {
                    stream_index: index,
                    sequence: frames_out,
                    pts: packet.pts,
                    duration: packet.duration,
                    payload: raw.payload,
                    layout: raw.layout,
                };
                frames_out += 1;
                LegStats::bump(&self.stats.frames_decoded);

                if !self.forward(Item::Data(frame)) {
                    debug!("Stream {index}: frame queue closed, decoder exiting");
                    return Ok(());
                }
            }
        }

        info!("Decoder for stream {index} finished: {frames_out} frames");
        Ok(())
    }

    /// Pushes downstream, counting any frame the queue evicts. Returns
    /// `false` once the queue is closed.
    fn forward(&self, item: FrameItem) -> bool {
        match self.output.push(item) {
            Push::Accepted => true,
            Push::Dropped => {
                LegStats::bump(&self.stats.frames_queue_dropped);
                true
            }
            Push::Closed => false,
        }
    }
}
