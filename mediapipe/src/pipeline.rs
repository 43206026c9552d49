//! Pipeline state machine.
//!
//! `Null → Ready → Paused → Playing` and back. Worker threads exist only in
//! `Paused` and `Playing`:
//!
//! - `Ready → Paused` opens the source, creates the demultiplexer and one
//!   decoder + sink leg per linked port, then starts every worker.
//! - `Paused → Playing` captures the base time and hands it to every sink.
//! - `Playing → Paused` and every step toward `Null` close all queues and join
//!   all workers before returning.
//!
//! Stages are built from an explicit [`StageTable`] of collaborators keyed by
//! media kind. Status goes out on the [`Bus`](crate::bus::Bus).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::backend::{CodecLibrary, ContainerProbe, PresentationBackend};
use crate::bus::{Bus, EosTracker, ErrorKind, Message, StageKind};
use crate::process::decode::DecoderStage;
use crate::process::demux::{DemuxConfig, Demuxer, PortListener};
use crate::process::render::{SinkConfig, SinkStage};
use crate::process::{Link, PacketItem, Stage, StageSlot};
use crate::structs::port::Port;
use crate::structs::stats::{LegSnapshot, StatsRegistry};
use crate::structs::stream::{MediaKind, StreamDescriptor};
use crate::utils::errors::{LinkError, TransitionError};
use crate::utils::queue::{Producer, QueueConfig, bounded};
use crate::utils::timing::{Clock, ClockTime, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Null,
    Ready,
    Paused,
    Playing,
}

impl State {
    fn up(self) -> Self {
        match self {
            State::Null => State::Ready,
            State::Ready => State::Paused,
            State::Paused | State::Playing => State::Playing,
        }
    }

    fn down(self) -> Self {
        match self {
            State::Playing => State::Paused,
            State::Paused => State::Ready,
            State::Ready | State::Null => State::Null,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Null => "null",
            State::Ready => "ready",
            State::Paused => "paused",
            State::Playing => "playing",
        })
    }
}

#[derive(Clone)]
pub struct PipelineConfig {
    pub packet_queue: QueueConfig,
    pub audio_frame_queue: QueueConfig,
    pub video_frame_queue: QueueConfig,
    pub sink: SinkConfig,
    pub demux: DemuxConfig,
    pub clock: Arc<dyn Clock>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            packet_queue: QueueConfig::blocking(32),
            audio_frame_queue: QueueConfig::blocking(8),
            video_frame_queue: QueueConfig::drop_oldest(4),
            sink: SinkConfig::default(),
            demux: DemuxConfig::default(),
            clock: Arc::new(SystemClock::new()),
        }
    }
}

impl PipelineConfig {
    pub fn frame_queue(&self, kind: MediaKind) -> QueueConfig {
        match kind {
            MediaKind::Audio => self.audio_frame_queue,
            MediaKind::Video => self.video_frame_queue,
        }
    }
}

/// Collaborators the pipeline builds its stages from.
#[derive(Clone)]
pub struct StageTable {
    probe: Arc<dyn ContainerProbe>,
    decoders: HashMap<MediaKind, Arc<dyn CodecLibrary>>,
    sinks: HashMap<MediaKind, Arc<dyn PresentationBackend>>,
}

impl StageTable {
    pub fn new(probe: Arc<dyn ContainerProbe>) -> Self {
        Self {
            probe,
            decoders: HashMap::new(),
            sinks: HashMap::new(),
        }
    }

    pub fn with_decoder(mut self, kind: MediaKind, codecs: Arc<dyn CodecLibrary>) -> Self {
        self.decoders.insert(kind, codecs);
        self
    }

    pub fn with_sink(mut self, kind: MediaKind, backend: Arc<dyn PresentationBackend>) -> Self {
        self.sinks.insert(kind, backend);
        self
    }
}

struct Bin {
    stages: Vec<StageSlot>,
    linked: HashSet<u32>,
    running: bool,
    shutting_down: bool,
    base_time: Option<ClockTime>,
    /// First link failure seen before the workers started.
    fatal: Option<LinkError>,
    eos: Arc<EosTracker>,
}

impl Bin {
    fn new() -> Self {
        Self {
            stages: Vec::new(),
            linked: HashSet::new(),
            running: false,
            shutting_down: false,
            base_time: None,
            fatal: None,
            eos: Arc::new(EosTracker::default()),
        }
    }

    fn start_all(&mut self) -> Result<(), TransitionError> {
        for kind in [StageKind::Demux, StageKind::Decoder, StageKind::Sink] {
            for slot in self.stages.iter_mut() {
                let stage = slot.stage();
                if stage.kind() == kind {
                    stage.start()?;
                }
            }
        }
        Ok(())
    }
}

struct Shared {
    bin: Mutex<Bin>,
    bus: Bus,
    table: StageTable,
    config: PipelineConfig,
    stats: Arc<StatsRegistry>,
}

impl Shared {
    fn link_failed(&self, bin: &mut Bin, err: LinkError, stream_index: u32) {
        if bin.running {
            error!("Stream {stream_index}: {err}");
            self.bus
                .error(ErrorKind::Link, StageKind::Pipeline, Some(stream_index), &err);
        } else if bin.fatal.is_none() {
            bin.fatal = Some(err);
        }
    }

    /// Builds, binds and (when running) starts the decoder and sink for one port.
    fn link_port(
        &self,
        descriptor: &Arc<StreamDescriptor>,
        port: &Port,
    ) -> Option<Producer<PacketItem>> {
        let mut bin = self.bin.lock();
        if bin.shutting_down {
            debug!("Ignoring port {port} during shutdown");
            return None;
        }

        let index = port.stream_index;
        let kind = port.kind();
        if !bin.linked.insert(index) {
            self.link_failed(&mut bin, LinkError::AlreadyLinked(index), index);
            return None;
        }

        let (Some(codecs), Some(backend)) = (self.table.decoders.get(&kind), self.table.sinks.get(&kind))
        else {
            let err = LinkError::NoConstructor {
                stream_index: index,
                kind,
            };
            self.link_failed(&mut bin, err, index);
            return None;
        };

        let stats = self.stats.leg(index);
        let mut decoder = match DecoderStage::new(
            descriptor.clone(),
            &port.format,
            codecs.as_ref(),
            stats.clone(),
            self.bus.clone(),
        ) {
            Ok(decoder) => decoder,
            Err(e) => {
                error!("{e}; {kind} leg disabled");
                self.bus
                    .error(ErrorKind::DecoderInit, StageKind::Decoder, Some(index), &e);
                return None;
            }
        };

        let decoded = decoder.output_format();
        let mut sink = match SinkStage::new(
            descriptor.clone(),
            &decoded,
            backend.as_ref(),
            self.config.clock.clone(),
            self.config.sink,
            stats,
            self.bus.clone(),
            bin.eos.clone(),
        ) {
            Ok(sink) => sink,
            Err(e) => {
                error!("{e}; {kind} leg disabled");
                self.bus
                    .error(ErrorKind::Present, StageKind::Sink, Some(index), &e);
                return None;
            }
        };

        let (packets_tx, packets_rx) = bounded(self.config.packet_queue);
        let (frames_tx, frames_rx) = bounded(self.config.frame_queue(kind));

        let bound = decoder
            .bind_input(&Port::input(index, port.format), Link::PacketsIn(packets_rx))
            .and_then(|()| decoder.bind_output(&Port::output(index, decoded), Link::FramesOut(frames_tx)))
            .and_then(|()| sink.bind_input(&Port::input(index, decoded), Link::FramesIn(frames_rx)));
        if let Err(e) = bound {
            self.link_failed(&mut bin, e, index);
            return None;
        }

        if bin.running {
            let started = decoder.start().and_then(|()| sink.start());
            if let Err(e) = started {
                error!("Stream {index}: {e}");
                self.bus
                    .error(ErrorKind::Link, StageKind::Pipeline, Some(index), &e);
                for stage in [&mut decoder as &mut dyn Stage, &mut sink] {
                    stage.stop();
                    stage.join();
                }
                return None;
            }
            if let Some(base_time) = bin.base_time {
                sink.set_base_time(base_time);
            }
        }

        info!("Linked {port} through a {decoded} decoder");
        bin.stages.push(StageSlot::Decoder(decoder));
        bin.stages.push(StageSlot::Sink(sink));
        self.bus.post(Message::PortAdded(port.clone()));
        Some(packets_tx)
    }
}

/// Port listener handed to the demultiplexer. Holds the pipeline weakly since
/// the demultiplexer itself lives inside the pipeline.
struct PortLinker {
    shared: Weak<Shared>,
}

impl PortListener for PortLinker {
    fn port_added(
        &self,
        descriptor: &Arc<StreamDescriptor>,
        port: &Port,
    ) -> Option<Producer<PacketItem>> {
        self.shared.upgrade()?.link_port(descriptor, port)
    }
}

pub struct Pipeline {
    shared: Arc<Shared>,
    state: State,
    source: Option<PathBuf>,
    bus_rx: Option<Receiver<Message>>,
    /// Workers were joined by `Playing → Paused`; playing again re-prerolls.
    drained: bool,
}

impl Pipeline {
    pub fn new(table: StageTable, config: PipelineConfig) -> Self {
        let (bus, bus_rx) = Bus::channel();
        Self {
            shared: Arc::new(Shared {
                bin: Mutex::new(Bin::new()),
                bus,
                table,
                config,
                stats: Arc::new(StatsRegistry::default()),
            }),
            state: State::Null,
            source: None,
            bus_rx: Some(bus_rx),
            drained: false,
        }
    }

    pub fn set_source(&mut self, path: impl Into<PathBuf>) -> Result<(), TransitionError> {
        if self.state > State::Ready {
            return Err(TransitionError::SourceLocked(self.state));
        }
        self.source = Some(path.into());
        Ok(())
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The receiving end of the status bus. Only the first call returns it.
    pub fn take_bus(&mut self) -> Option<Receiver<Message>> {
        self.bus_rx.take()
    }

    pub fn stats(&self) -> BTreeMap<u32, LegSnapshot> {
        self.shared.stats.snapshot()
    }

    /// Steps through every intermediate state until `target` is reached.
    ///
    /// A failure leaves the pipeline in the last state it reached.
    pub fn transition(&mut self, target: State) -> Result<(), TransitionError> {
        while self.state != target {
            let next = if target > self.state {
                self.state.up()
            } else {
                self.state.down()
            };

            match (self.state, next) {
                (State::Null, State::Ready) => {
                    if self.source.is_none() {
                        return Err(TransitionError::NoSource);
                    }
                }
                (State::Ready, State::Paused) => self.preroll()?,
                (State::Paused, State::Playing) => self.play()?,
                (State::Playing, State::Paused) => {
                    self.teardown();
                    self.drained = true;
                }
                (State::Paused, State::Ready) => {
                    self.teardown();
                    self.drained = false;
                }
                _ => {}
            }

            self.set_state(next);
        }
        Ok(())
    }

    fn set_state(&mut self, new: State) {
        let old = self.state;
        self.state = new;
        info!("Pipeline {old} → {new}");
        self.shared.bus.post(Message::StateChanged { old, new });
    }

    fn preroll(&mut self) -> Result<(), TransitionError> {
        let path = self.source.clone().ok_or(TransitionError::NoSource)?;
        let shared = &self.shared;
        let bus = &shared.bus;

        shared.stats.clear();
        let eos = Arc::new(EosTracker::default());
        *shared.bin.lock() = Bin {
            eos: eos.clone(),
            ..Bin::new()
        };

        let listener = Arc::new(PortLinker {
            shared: Arc::downgrade(shared),
        });
        let mut demux = Demuxer::new(
            shared.table.probe.clone(),
            shared.config.demux.clone(),
            listener,
            shared.stats.clone(),
            bus.clone(),
            eos.clone(),
        );

        let streams = demux.open(&path).inspect_err(|e| {
            error!("{e}");
            bus.error(ErrorKind::Open, StageKind::Demux, None, e);
        })?;
        bus.post(Message::StreamsDiscovered {
            group_id: demux.group_id(),
            streams,
        });

        if let Err(e) = demux.select_streams() {
            error!("{e}");
            bus.error(ErrorKind::Link, StageKind::Demux, None, &e);
            self.teardown();
            return Err(e.into());
        }
        demux.announce_ports();

        let mut bin = shared.bin.lock();
        if let Some(e) = bin.fatal.take() {
            drop(bin);
            error!("{e}");
            bus.error(ErrorKind::Link, StageKind::Pipeline, None, &e);
            self.teardown();
            return Err(e.into());
        }

        bin.stages.insert(0, StageSlot::Demux(demux));
        bin.running = true;

        // Held until every stage is started so early finishers cannot end the run.
        eos.register();
        let started = bin.start_all();
        let legs = bin.stages.len().saturating_sub(1) / 2;
        drop(bin);
        eos.finish(bus);

        if let Err(e) = started {
            error!("{e}");
            bus.error(ErrorKind::Link, StageKind::Pipeline, None, &e);
            self.teardown();
            return Err(e);
        }

        info!("Prerolled {} with {legs} legs", path.display());
        self.drained = false;
        Ok(())
    }

    fn play(&mut self) -> Result<(), TransitionError> {
        if self.drained {
            debug!("Workers were joined, prerolling again");
            self.preroll()?;
        }

        let base_time = self.shared.config.clock.now();
        let mut bin = self.shared.bin.lock();
        bin.base_time = Some(base_time);
        for slot in &bin.stages {
            if let StageSlot::Sink(sink) = slot {
                sink.set_base_time(base_time);
            }
        }
        info!("Base time {base_time}");
        Ok(())
    }

    /// Closes every queue, then joins every worker.
    fn teardown(&self) {
        let mut stages = {
            let mut bin = self.shared.bin.lock();
            bin.shutting_down = true;
            bin.running = false;
            bin.base_time = None;
            std::mem::take(&mut bin.stages)
        };
        if stages.is_empty() {
            return;
        }

        for slot in stages.iter_mut() {
            slot.stage().stop();
        }
        for slot in stages.iter_mut() {
            slot.stage().join();
        }
        debug!("{} stages joined", stages.len());
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(e) = self.transition(State::Null) {
            warn!("Pipeline shutdown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::stream::{
        AudioFormat, CodecId, FormatParams, PixelLayout, SampleFormat, VideoFormat,
    };
    use crate::synthetic::{
        CollectingBackend, SyntheticCodecs, SyntheticProbe, SyntheticSource, SyntheticStream,
    };
    use crate::utils::errors::OpenError;
    use crate::utils::timing::TimeBase;
    use std::time::Duration;

    fn video(index: u32, count: u64) -> anyhow::Result<SyntheticStream> {
        let mut stream = SyntheticStream::new(
            index,
            CodecId::RawVideo,
            TimeBase::new(1, 100)?,
            FormatParams::Video(VideoFormat {
                width: 4,
                height: 4,
                pixel_layout: PixelLayout::I420,
                frame_rate: None,
            }),
        );
        stream.packet_count = count;
        Ok(stream)
    }

    fn audio(index: u32, codec: CodecId) -> anyhow::Result<SyntheticStream> {
        let mut stream = SyntheticStream::new(
            index,
            codec,
            TimeBase::new(1, 48000)?,
            FormatParams::Audio(AudioFormat {
                sample_rate: 48000,
                channels: 2,
                sample_format: SampleFormat::S16,
                profile: None,
            }),
        );
        stream.packet_count = 4;
        stream.packet_duration = 480;
        Ok(stream)
    }

    fn pipeline(source: SyntheticSource, audio_sink: bool) -> (Pipeline, CollectingBackend) {
        let config = PipelineConfig::default();
        let backend = CollectingBackend::new(config.clock.clone());
        let probe = SyntheticProbe::new().with_source("test.syn", source);

        let mut table = StageTable::new(Arc::new(probe))
            .with_decoder(MediaKind::Video, Arc::new(SyntheticCodecs))
            .with_decoder(MediaKind::Audio, Arc::new(SyntheticCodecs))
            .with_sink(MediaKind::Video, Arc::new(backend.clone()));
        if audio_sink {
            table = table.with_sink(MediaKind::Audio, Arc::new(backend.clone()));
        }
        (Pipeline::new(table, config), backend)
    }

    fn wait_for_eos(rx: &Receiver<Message>) -> anyhow::Result<Vec<Message>> {
        let mut seen = Vec::new();
        loop {
            let message = rx.recv_timeout(Duration::from_secs(5))?;
            let done = message == Message::EndOfStream;
            seen.push(message);
            if done {
                return Ok(seen);
            }
        }
    }

    #[test]
    fn ready_needs_a_source() {
        let (mut pipeline, _) = pipeline(SyntheticSource::default(), true);
        assert!(matches!(
            pipeline.transition(State::Ready),
            Err(TransitionError::NoSource)
        ));
        assert_eq!(pipeline.state(), State::Null);
    }

    #[test]
    fn open_failure_stays_ready() -> anyhow::Result<()> {
        let (mut pipeline, _) = pipeline(SyntheticSource::default(), true);
        let rx = pipeline.take_bus().ok_or(anyhow::anyhow!("bus taken"))?;
        pipeline.set_source("missing.syn")?;

        let err = pipeline.transition(State::Playing);
        assert!(matches!(err, Err(TransitionError::Open(OpenError::NotFound(_)))));
        assert_eq!(pipeline.state(), State::Ready);
        assert!(rx.try_iter().any(|m| matches!(
            m,
            Message::Error {
                kind: ErrorKind::Open,
                ..
            }
        )));
        Ok(())
    }

    #[test]
    fn missing_constructor_is_a_link_error() -> anyhow::Result<()> {
        let source = SyntheticSource::new(vec![video(0, 3)?, audio(1, CodecId::Pcm)?]);
        let (mut pipeline, _) = pipeline(source, false);
        pipeline.set_source("test.syn")?;

        let err = pipeline.transition(State::Paused);
        assert!(matches!(
            err,
            Err(TransitionError::Link(LinkError::NoConstructor {
                stream_index: 1,
                kind: MediaKind::Audio
            }))
        ));
        assert_eq!(pipeline.state(), State::Ready);
        Ok(())
    }

    #[test]
    fn decoder_init_failure_keeps_sibling_leg() -> anyhow::Result<()> {
        let source = SyntheticSource::new(vec![
            video(0, 3)?,
            audio(1, CodecId::Other("opus".into()))?,
        ]);
        let (mut pipeline, backend) = pipeline(source, true);
        let rx = pipeline.take_bus().ok_or(anyhow::anyhow!("bus taken"))?;
        pipeline.set_source("test.syn")?;
        pipeline.transition(State::Playing)?;

        let messages = wait_for_eos(&rx)?;
        assert!(messages.iter().any(|m| matches!(
            m,
            Message::Error {
                kind: ErrorKind::DecoderInit,
                stream_index: Some(1),
                ..
            }
        )));
        assert_eq!(backend.presented_for(0).len(), 3);
        assert!(backend.presented_for(1).is_empty());
        assert_eq!(pipeline.state(), State::Playing);

        pipeline.transition(State::Null)?;
        Ok(())
    }

    #[test]
    fn paused_again_replays_from_start() -> anyhow::Result<()> {
        let source = SyntheticSource::new(vec![video(0, 2)?]);
        let (mut pipeline, backend) = pipeline(source, true);
        let rx = pipeline.take_bus().ok_or(anyhow::anyhow!("bus taken"))?;
        pipeline.set_source("test.syn")?;

        pipeline.transition(State::Playing)?;
        wait_for_eos(&rx)?;
        pipeline.transition(State::Paused)?;
        assert!(matches!(
            pipeline.set_source("other.syn"),
            Err(TransitionError::SourceLocked(State::Paused))
        ));

        pipeline.transition(State::Playing)?;
        wait_for_eos(&rx)?;
        assert_eq!(backend.presented_for(0).len(), 4);
        assert_eq!(backend.finished(), vec![0, 0]);

        pipeline.transition(State::Null)?;
        let states: Vec<State> = rx
            .try_iter()
            .filter_map(|m| match m {
                Message::StateChanged { new, .. } => Some(new),
                _ => None,
            })
            .collect();
        assert!(states.ends_with(&[State::Paused, State::Ready, State::Null]));
        Ok(())
    }
}
