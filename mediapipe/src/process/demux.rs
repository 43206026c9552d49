//! Demultiplexer stage.
//!
//! Opens a container through a [`ContainerProbe`], selects the streams to play
//! and keeps a registry of output ports keyed by stream index. A port is created
//! the first time its stream's format is known, which may be at open time or
//! later in the read loop. Each new port is announced to a [`PortListener`],
//! which returns the producer end of the queue feeding the stage bound to it.
//!
//! Before the first packet on a port the worker sends the sticky events:
//! stream-start (group id + stream id), caps, then a segment anchored at zero.
//! On end of container or a read error every linked port gets `EndOfStream`.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use anyhow::Result;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::backend::{Container, ContainerProbe, ReadEvent};
use crate::bus::{Bus, EosTracker, ErrorKind, StageKind};
use crate::process::reformat::{Reformatter, SampleRatePolicy};
use crate::process::{Link, PacketItem, Stage, join_worker, mismatch, spawn_worker};
use crate::structs::event::{GroupId, Item, Segment, StreamEvent};
use crate::structs::packet::{CompressedPacket, RawPacket};
use crate::structs::port::Port;
use crate::structs::stats::{LegStats, StatsRegistry};
use crate::structs::stream::{FormatParams, MediaKind, StreamDescriptor};
use crate::utils::errors::{IoReadError, LinkError, OpenError, TransitionError};
use crate::utils::queue::{Closer, Producer, Push};
use crate::utils::timing::{ClockTime, normalize};

/// Receives every port the demultiplexer creates, before data flows on it.
pub trait PortListener: Send + Sync {
    /// Returns the producer for the port's packet queue, or `None` to leave
    /// the port unlinked (its packets are then discarded).
    fn port_added(
        &self,
        descriptor: &Arc<StreamDescriptor>,
        port: &Port,
    ) -> Option<Producer<PacketItem>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamSelection {
    /// Lowest-indexed audio stream and lowest-indexed video stream.
    #[default]
    FirstOfEachKind,
    Indices(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemuxConfig {
    pub selection: StreamSelection,
    pub sample_rate_policy: SampleRatePolicy,
    /// Packets held per stream while its format is unknown.
    pub pending_limit: usize,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            selection: StreamSelection::default(),
            sample_rate_policy: SampleRatePolicy::default(),
            pending_limit: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxState {
    Idle,
    Opened,
    Reading,
    Stopped,
}

struct OutputPort {
    port: Port,
    reformatter: Reformatter,
    producer: Option<Producer<PacketItem>>,
    stats: Arc<LegStats>,
    sequence: u64,
    announced: bool,
}

struct StreamEntry {
    descriptor: Arc<StreamDescriptor>,
    output: Option<OutputPort>,
    pending: VecDeque<RawPacket>,
    failed: bool,
}

impl StreamEntry {
    fn is_done(&self) -> bool {
        self.failed
            || self
                .output
                .as_ref()
                .is_some_and(|output| output.producer.is_none())
    }
}

struct Context {
    group_id: GroupId,
    config: DemuxConfig,
    listener: Arc<dyn PortListener>,
    stats: Arc<StatsRegistry>,
    bus: Bus,
    closers: Arc<Mutex<Vec<Closer>>>,
}

/// Ports keyed by stream index, one entry per selected stream.
struct PortRegistry {
    ctx: Context,
    entries: BTreeMap<u32, StreamEntry>,
}

impl PortRegistry {
    fn create_port(&mut self, index: u32, format: FormatParams) {
        let Some(entry) = self.entries.get_mut(&index) else {
            return;
        };
        if entry.output.is_some() || entry.failed {
            return;
        }

        let descriptor = entry.descriptor.clone();
        let reformatter =
            match Reformatter::for_stream(&descriptor, &format, self.ctx.config.sample_rate_policy) {
                Ok(reformatter) => reformatter,
                Err(e) => {
                    error!("Stream {index}: {e}; stream left unlinked");
                    self.ctx
                        .bus
                        .error(ErrorKind::Reformat, StageKind::Demux, Some(index), &e);
                    entry.failed = true;
                    entry.pending.clear();
                    return;
                }
            };

        let port = Port::output(index, format);
        info!("New port {port} ({} reformat)", reformatter.name());

        let producer = self.ctx.listener.port_added(&descriptor, &port);
        match &producer {
            Some(producer) => self.ctx.closers.lock().push(producer.closer()),
            None => debug!("Port {} left unlinked", port.name()),
        }

        entry.output = Some(OutputPort {
            port,
            reformatter,
            producer,
            stats: self.ctx.stats.leg(index),
            sequence: 0,
            announced: false,
        });
    }

    fn bind(&mut self, port: &Port, producer: Producer<PacketItem>) -> Result<(), LinkError> {
        let index = port.stream_index;
        let output = self
            .entries
            .get_mut(&index)
            .and_then(|entry| entry.output.as_mut())
            .ok_or(LinkError::UnknownStream(index))?;
        if output.producer.is_some() {
            return Err(LinkError::AlreadyLinked(index));
        }
        self.ctx.closers.lock().push(producer.closer());
        output.producer = Some(producer);
        Ok(())
    }

    fn all_done(&self) -> bool {
        self.entries.values().all(StreamEntry::is_done)
    }

    fn send(output: &mut OutputPort, item: PacketItem) {
        let Some(producer) = &output.producer else {
            return;
        };
        if producer.push(item) == Push::Closed {
            debug!("Port {} closed downstream", output.port.name());
            output.producer = None;
        }
    }

    fn announce(group_id: GroupId, descriptor: &StreamDescriptor, output: &mut OutputPort) {
        if output.announced {
            return;
        }
        output.announced = true;

        let index = descriptor.index;
        let events = [
            StreamEvent::StreamStart {
                group_id,
                stream_id: group_id.stream_id(index),
            },
            StreamEvent::Caps(output.port.format),
            StreamEvent::Segment(Segment {
                start: ClockTime::ZERO,
                time_base: descriptor.time_base,
            }),
        ];
        for event in events {
            Self::send(output, Item::Event(event));
        }
    }

    fn announce_all(&mut self) {
        let group_id = self.ctx.group_id;
        for entry in self.entries.values_mut() {
            if let Some(output) = entry.output.as_mut() {
                Self::announce(group_id, &entry.descriptor, output);
            }
        }
    }

    fn forward(
        group_id: GroupId,
        descriptor: &StreamDescriptor,
        output: &mut OutputPort,
        packet: RawPacket,
    ) {
        if output.producer.is_none() {
            return;
        }
        Self::announce(group_id, descriptor, output);

        let index = descriptor.index;
        let sequence = output.sequence;
        output.sequence += 1;

        let payload = match output.reformatter.apply(packet.payload, packet.keyframe) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Stream {index}: dropping packet {sequence}: {e}");
                LegStats::bump(&output.stats.packets_reformat_dropped);
                return;
            }
        };

        let tb = descriptor.time_base;
        let compressed = CompressedPacket {
            stream_index: index,
            sequence,
            payload,
            pts: normalize(packet.pts, tb),
            dts: normalize(packet.dts, tb),
            duration: normalize(packet.duration, tb),
            keyframe: packet.keyframe,
        };
        trace!(
            "Stream {index}: packet {sequence}, {} bytes, pts {:?}",
            compressed.payload.len(),
            compressed.pts
        );

        Self::send(output, Item::Data(compressed));
        LegStats::bump(&output.stats.packets_routed);
    }

    fn route(&mut self, packet: RawPacket) {
        let index = packet.stream_index;
        let group_id = self.ctx.group_id;
        let pending_limit = self.ctx.config.pending_limit;

        let Some(entry) = self.entries.get_mut(&index) else {
            trace!("Ignoring packet for unselected stream {index}");
            return;
        };
        if entry.failed {
            return;
        }

        match entry.output.as_mut() {
            Some(output) => Self::forward(group_id, &entry.descriptor, output, packet),
            None => {
                if entry.pending.len() >= pending_limit {
                    warn!("Stream {index}: format still unknown, dropping oldest held packet");
                    entry.pending.pop_front();
                }
                entry.pending.push_back(packet);
            }
        }
    }

    fn format_known(&mut self, index: u32, params: FormatParams) {
        self.create_port(index, params);

        let group_id = self.ctx.group_id;
        let Some(entry) = self.entries.get_mut(&index) else {
            return;
        };
        let Some(output) = entry.output.as_mut() else {
            return;
        };

        Self::announce(group_id, &entry.descriptor, output);
        if !entry.pending.is_empty() {
            debug!("Stream {index}: flushing {} held packets", entry.pending.len());
        }
        while let Some(packet) = entry.pending.pop_front() {
            Self::forward(group_id, &entry.descriptor, output, packet);
        }
    }

    fn finish(&mut self) {
        let group_id = self.ctx.group_id;
        for (index, entry) in self.entries.iter_mut() {
            match entry.output.as_mut() {
                Some(output) => {
                    Self::announce(group_id, &entry.descriptor, output);
                    Self::send(output, Item::EndOfStream);
                }
                None if !entry.failed => {
                    warn!(
                        "Stream {index}: format never became known, {} packets discarded",
                        entry.pending.len()
                    );
                }
                None => {}
            }
        }
    }
}

pub struct Demuxer {
    probe: Arc<dyn ContainerProbe>,
    state: Arc<Mutex<DemuxState>>,
    path: Option<PathBuf>,
    streams: Vec<Arc<StreamDescriptor>>,
    container: Option<Box<dyn Container>>,
    registry: Option<PortRegistry>,
    group_id: GroupId,
    bus: Bus,
    eos: Arc<EosTracker>,
    stop: Arc<AtomicBool>,
    closers: Arc<Mutex<Vec<Closer>>>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Demuxer {
    pub fn new(
        probe: Arc<dyn ContainerProbe>,
        config: DemuxConfig,
        listener: Arc<dyn PortListener>,
        stats: Arc<StatsRegistry>,
        bus: Bus,
        eos: Arc<EosTracker>,
    ) -> Self {
        let group_id = GroupId::next();
        let closers = Arc::new(Mutex::new(Vec::new()));

        Self {
            probe,
            state: Arc::new(Mutex::new(DemuxState::Idle)),
            path: None,
            streams: Vec::new(),
            container: None,
            registry: Some(PortRegistry {
                ctx: Context {
                    group_id,
                    config,
                    listener,
                    stats,
                    bus: bus.clone(),
                    closers: closers.clone(),
                },
                entries: BTreeMap::new(),
            }),
            group_id,
            bus,
            eos,
            stop: Arc::new(AtomicBool::new(false)),
            closers,
            handle: None,
        }
    }

    pub fn state(&self) -> DemuxState {
        *self.state.lock()
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn streams(&self) -> &[Arc<StreamDescriptor>] {
        &self.streams
    }

    /// Probes the container and enumerates its audio and video streams.
    pub fn open(&mut self, path: &Path) -> Result<Vec<StreamDescriptor>, OpenError> {
        if self.state() != DemuxState::Idle {
            return Err(OpenError::Unreadable {
                path: path.to_path_buf(),
                reason: "demultiplexer already opened".into(),
            });
        }

        let (descriptors, container) = self.probe.open(path)?;
        let streams: Vec<StreamDescriptor> = descriptors
            .into_iter()
            .filter(|d| {
                let usable = d.codec.kind().is_none_or(|kind| kind == d.kind);
                if !usable {
                    warn!("Stream {}: codec {} does not match kind {}", d.index, d.codec, d.kind);
                }
                usable
            })
            .collect();

        if streams.is_empty() {
            return Err(OpenError::NoStreams(path.to_path_buf()));
        }

        for d in &streams {
            info!(
                "Stream {}: {} {} ({}, time base {})",
                d.index,
                d.kind,
                d.codec,
                d.format.map_or("format pending".to_string(), |f| f.to_string()),
                d.time_base
            );
        }

        self.streams = streams.iter().cloned().map(Arc::new).collect();
        self.container = Some(container);
        self.path = Some(path.to_path_buf());
        *self.state.lock() = DemuxState::Opened;

        Ok(streams)
    }

    /// Chooses the streams that get ports according to the configured selection.
    pub fn select_streams(&mut self) -> Result<Vec<u32>, LinkError> {
        let registry = self.registry.as_mut().ok_or(LinkError::ShuttingDown)?;

        let selected: Vec<Arc<StreamDescriptor>> = match &registry.ctx.config.selection {
            StreamSelection::FirstOfEachKind => [MediaKind::Video, MediaKind::Audio]
                .iter()
                .filter_map(|&kind| {
                    self.streams
                        .iter()
                        .filter(|d| d.kind == kind)
                        .min_by_key(|d| d.index)
                        .cloned()
                })
                .collect(),
            StreamSelection::Indices(indices) => indices
                .iter()
                .map(|&index| {
                    self.streams
                        .iter()
                        .find(|d| d.index == index)
                        .cloned()
                        .ok_or(LinkError::UnknownStream(index))
                })
                .collect::<Result<_, _>>()?,
        };

        registry.entries.clear();
        for descriptor in selected {
            registry.entries.insert(
                descriptor.index,
                StreamEntry {
                    descriptor,
                    output: None,
                    pending: VecDeque::new(),
                    failed: false,
                },
            );
        }

        let indices: Vec<u32> = registry.entries.keys().copied().collect();
        info!("Selected streams {indices:?}");
        Ok(indices)
    }

    /// Creates ports for selected streams whose format is already known.
    pub fn announce_ports(&mut self) {
        let Some(registry) = self.registry.as_mut() else {
            return;
        };
        let known: Vec<(u32, FormatParams)> = registry
            .entries
            .values()
            .filter_map(|e| e.descriptor.format.map(|f| (e.descriptor.index, f)))
            .collect();

        for (index, format) in known {
            registry.create_port(index, format);
        }
    }
}

impl Stage for Demuxer {
    fn kind(&self) -> StageKind {
        StageKind::Demux
    }

    fn bind_input(&mut self, _port: &Port, _link: Link) -> Result<(), LinkError> {
        Err(mismatch("demux", "input", "nothing"))
    }

    fn bind_output(&mut self, port: &Port, link: Link) -> Result<(), LinkError> {
        let Link::PacketsOut(producer) = link else {
            return Err(mismatch("demux", "output", "a packet producer"));
        };
        self.registry
            .as_mut()
            .ok_or(LinkError::ShuttingDown)?
            .bind(port, producer)
    }

    fn start(&mut self) -> Result<(), TransitionError> {
        let unbound = |direction| LinkError::Unbound {
            stage: "demux",
            stream_index: 0,
            direction,
        };
        let container = self.container.take().ok_or_else(|| unbound("container"))?;
        let registry = self.registry.take().ok_or_else(|| unbound("port registry"))?;

        let worker = DemuxWorker {
            container,
            registry,
            state: self.state.clone(),
            stop: self.stop.clone(),
            bus: self.bus.clone(),
            eos: self.eos.clone(),
        };

        *self.state.lock() = DemuxState::Reading;
        self.eos.register();
        let name = match &self.path {
            Some(path) => format!("demux-{}", path.display()),
            None => "demux".to_string(),
        };
        self.handle = Some(spawn_worker("demux", name, move || worker.run())?);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for closer in self.closers.lock().iter() {
            closer.close();
        }
    }

    fn join(&mut self) {
        join_worker(self.handle.take());
        *self.state.lock() = DemuxState::Stopped;
    }
}

struct DemuxWorker {
    container: Box<dyn Container>,
    registry: PortRegistry,
    state: Arc<Mutex<DemuxState>>,
    stop: Arc<AtomicBool>,
    bus: Bus,
    eos: Arc<EosTracker>,
}

impl DemuxWorker {
    fn run(mut self) -> Result<()> {
        info!("Demuxer started, group {}", self.registry.ctx.group_id);
        self.registry.announce_all();

        let mut packets_read: u64 = 0;
        loop {
            if self.stop.load(Ordering::Acquire) {
                debug!("Demuxer stop requested");
                break;
            }
            if self.registry.all_done() {
                info!("All ports closed or unlinked, demuxer exiting");
                break;
            }

            match self.container.read() {
                Ok(ReadEvent::Packet(packet)) => {
                    packets_read += 1;
                    self.registry.route(packet);
                }
                Ok(ReadEvent::Format {
                    stream_index,
                    params,
                }) => {
                    debug!("Stream {stream_index}: format now known ({params})");
                    self.registry.format_known(stream_index, params);
                }
                Ok(ReadEvent::Eof) => {
                    info!("End of container after {packets_read} packets");
                    break;
                }
                Err(e) => {
                    let err = IoReadError {
                        packets_read,
                        reason: format!("{e:#}"),
                    };
                    warn!("{err}; treating as end of stream");
                    self.bus
                        .warning(ErrorKind::IoRead, StageKind::Demux, None, &err);
                    break;
                }
            }
        }

        self.registry.finish();
        *self.state.lock() = DemuxState::Stopped;
        self.eos.finish(&self.bus);
        Ok(())
    }
}
