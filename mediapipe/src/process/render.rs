//! Sink stage: clock-gated presentation of decoded frames.
//!
//! A sink waits for the pipeline's base time, then presents each frame at
//! `base_time + pts` on the shared clock. A small look-ahead buffer lets a
//! late frame be replaced by the newer one behind it when the sink falls
//! behind. Every wait observes queue closure, so a stop never waits for a
//! frame's due time.
//!
//! On a drop-oldest input queue only frames already past their due time may
//! be evicted. Until the base time arrives nothing is evicted, so an early
//! frame holds the decoder back instead of being lost.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, info, trace, warn};

use crate::backend::{PresentationBackend, Surface};
use crate::bus::{Bus, EosTracker, ErrorKind, Message, StageKind};
use crate::process::{FrameItem, Link, Stage, join_worker, mismatch, spawn_worker};
use crate::structs::event::Item;
use crate::structs::frame::DecodedFrame;
use crate::structs::port::Port;
use crate::structs::stats::LegStats;
use crate::structs::stream::{FormatParams, MediaKind, StreamDescriptor};
use crate::utils::errors::{LinkError, PresentError, TransitionError};
use crate::utils::queue::{Closer, Consumer, Producer, QueueConfig, TryPop, bounded};
use crate::utils::timing::{Clock, ClockTime};

pub const MAX_LOOKAHEAD: usize = 2;

/// A frame this far behind its due time is dropped if a newer one is waiting.
const LATE_THRESHOLD: ClockTime = ClockTime::from_nanos(20_000_000);

/// Upper bound on a single clock wait, so clocks that drift from `Instant` are re-read.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkConfig {
    /// Look-ahead depth, clamped to `1..=MAX_LOOKAHEAD`.
    pub lookahead: usize,
    pub drop_late: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            lookahead: MAX_LOOKAHEAD,
            drop_late: true,
        }
    }
}

pub struct SinkStage {
    descriptor: Arc<StreamDescriptor>,
    surface: Option<Box<dyn Surface>>,
    input: Option<Consumer<FrameItem>>,
    base_time_tx: Producer<ClockTime>,
    base_time_rx: Option<Consumer<ClockTime>>,
    closers: Vec<Closer>,
    clock: Arc<dyn Clock>,
    config: SinkConfig,
    stats: Arc<LegStats>,
    bus: Bus,
    eos: Arc<EosTracker>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl SinkStage {
    /// Configures the presentation surface for the negotiated format.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        descriptor: Arc<StreamDescriptor>,
        params: &FormatParams,
        backend: &dyn PresentationBackend,
        clock: Arc<dyn Clock>,
        config: SinkConfig,
        stats: Arc<LegStats>,
        bus: Bus,
        eos: Arc<EosTracker>,
    ) -> Result<Self, PresentError> {
        let surface = backend
            .configure(&descriptor, params)
            .map_err(|e| PresentError::Configure {
                stream_index: descriptor.index,
                kind: params.kind(),
                reason: format!("{e:#}"),
            })?;

        let config = SinkConfig {
            lookahead: config.lookahead.clamp(1, MAX_LOOKAHEAD),
            drop_late: config.drop_late && params.kind() == MediaKind::Video,
        };

        let (base_time_tx, base_time_rx) = bounded(QueueConfig::blocking(1));
        let closers = vec![base_time_tx.closer()];

        Ok(Self {
            descriptor,
            surface: Some(surface),
            input: None,
            base_time_tx,
            base_time_rx: Some(base_time_rx),
            closers,
            clock,
            config,
            stats,
            bus,
            eos,
            handle: None,
        })
    }

    pub fn stream_index(&self) -> u32 {
        self.descriptor.index
    }

    /// Hands the shared base time to the worker. Presentation starts after this.
    pub fn set_base_time(&self, base_time: ClockTime) {
        self.base_time_tx.push(base_time);
    }
}

impl Stage for SinkStage {
    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    fn bind_input(&mut self, port: &Port, link: Link) -> Result<(), LinkError> {
        let Link::FramesIn(consumer) = link else {
            return Err(mismatch("sink", "input", "a frame consumer"));
        };
        if self.input.is_some() {
            return Err(LinkError::AlreadyLinked(port.stream_index));
        }
        consumer.set_eviction_filter(|_| false);
        self.closers.push(consumer.closer());
        self.input = Some(consumer);
        Ok(())
    }

    fn bind_output(&mut self, _port: &Port, _link: Link) -> Result<(), LinkError> {
        Err(mismatch("sink", "output", "nothing"))
    }

    fn start(&mut self) -> Result<(), TransitionError> {
        let index = self.descriptor.index;
        let unbound = |direction| LinkError::Unbound {
            stage: "sink",
            stream_index: index,
            direction,
        };

        let input = self.input.take().ok_or_else(|| unbound("input"))?;
        let surface = self.surface.take().ok_or_else(|| unbound("surface"))?;
        let base_time = self.base_time_rx.take().ok_or_else(|| unbound("clock"))?;

        let worker = SinkWorker {
            stream_index: index,
            kind: self.descriptor.kind,
            surface,
            input,
            base_time,
            clock: self.clock.clone(),
            config: self.config,
            stats: self.stats.clone(),
            bus: self.bus.clone(),
            eos: self.eos.clone(),
        };

        self.eos.register();
        self.handle = Some(spawn_worker(
            "sink",
            format!("sink-{index}"),
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

fn is_late(item: &FrameItem, base_time: ClockTime, now: ClockTime) -> bool {
    match item {
        Item::Data(DecodedFrame { pts: Some(pts), .. }) => {
            now.saturating_sub(base_time.saturating_add(*pts)) > LATE_THRESHOLD
        }
        _ => false,
    }
}

enum Wait {
    Due,
    Cancelled,
}

struct SinkWorker {
    stream_index: u32,
    kind: MediaKind,
    surface: Box<dyn Surface>,
    input: Consumer<FrameItem>,
    base_time: Consumer<ClockTime>,
    clock: Arc<dyn Clock>,
    config: SinkConfig,
    stats: Arc<LegStats>,
    bus: Bus,
    eos: Arc<EosTracker>,
}

impl SinkWorker {
    fn run(mut self) -> Result<()> {
        let index = self.stream_index;

        let Ok(base_time) = self.base_time.pop() else {
            debug!("Sink {index} stopped before playback started");
            return Ok(());
        };
        info!("Sink for {} stream {index} running, base time {base_time}", self.kind);
        let clock = self.clock.clone();
        self.input
            .set_eviction_filter(move |item| is_late(item, base_time, clock.now()));

        let mut lookahead: VecDeque<DecodedFrame> = VecDeque::with_capacity(MAX_LOOKAHEAD);
        let mut end_of_stream = false;

        loop {
            while !end_of_stream && lookahead.len() < self.config.lookahead {
                let item = if lookahead.is_empty() {
                    match self.input.pop() {
                        Ok(item) => item,
                        Err(_) => return self.stopped(),
                    }
                } else {
                    match self.input.try_pop() {
                        TryPop::Item(item) => item,
                        TryPop::Empty => break,
                        TryPop::Closed => return self.stopped(),
                    }
                };

                match item {
                    Item::Data(frame) => lookahead.push_back(frame),
                    Item::Event(event) => trace!("Sink {index}: {event:?}"),
                    Item::EndOfStream => end_of_stream = true,
                }
            }

            let Some(frame) = lookahead.pop_front() else {
                if end_of_stream {
                    break;
                }
                continue;
            };

            if let Some(pts) = frame.pts {
                let target = base_time.saturating_add(pts);
                let now = self.clock.now();

                if now < target {
                    if let Wait::Cancelled = self.wait_until(target) {
                        return self.stopped();
                    }
                } else if self.config.drop_late
                    && !end_of_stream
                    && !lookahead.is_empty()
                    && now.saturating_sub(target) > LATE_THRESHOLD
                {
                    debug!(
                        "Sink {index}: dropping frame {} late by {}",
                        frame.sequence,
                        now.saturating_sub(target)
                    );
                    LegStats::bump(&self.stats.frames_late_dropped);
                    continue;
                }
            }

            match self.surface.present(&frame) {
                Ok(()) => LegStats::bump(&self.stats.frames_presented),
                Err(e) => {
                    warn!("Sink {index}: failed to present frame {}: {e:#}", frame.sequence);
                    self.bus
                        .warning(ErrorKind::Present, StageKind::Sink, Some(index), &e);
                }
            }
        }

        if let Err(e) = self.surface.finish() {
            warn!("Sink {index}: failed to finish surface: {e:#}");
            self.bus
                .warning(ErrorKind::Present, StageKind::Sink, Some(index), &e);
        }

        info!("Sink for stream {index} finished");
        self.bus.post(Message::SinkFinished {
            stream_index: index,
        });
        self.eos.finish(&self.bus);
        Ok(())
    }

    fn wait_until(&self, target: ClockTime) -> Wait {
        loop {
            let remaining = target.saturating_sub(self.clock.now());
            let Some(remaining) = remaining.to_duration().filter(|d| !d.is_zero()) else {
                return Wait::Due;
            };

            let deadline = Instant::now() + remaining.min(MAX_WAIT_SLICE);
            if self.input.wait_cancelled(deadline) {
                return Wait::Cancelled;
            }
        }
    }

    fn stopped(&self) -> Result<()> {
        debug!("Sink {} stopped", self.stream_index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::frame::FrameLayout;
    use crate::structs::stream::{CodecId, PixelLayout, VideoFormat};
    use crate::utils::queue::Push;
    use crate::utils::timing::{SystemClock, TimeBase};
    use parking_lot::Mutex;

    const FORMAT: FormatParams = FormatParams::Video(VideoFormat {
        width: 2,
        height: 2,
        pixel_layout: PixelLayout::I420,
        frame_rate: None,
    });

    #[derive(Default)]
    struct Recorder {
        presented: Arc<Mutex<Vec<(u64, ClockTime)>>>,
        finished: Arc<Mutex<bool>>,
        clock: Option<Arc<dyn Clock>>,
    }

    struct RecordingSurface {
        presented: Arc<Mutex<Vec<(u64, ClockTime)>>>,
        finished: Arc<Mutex<bool>>,
        clock: Arc<dyn Clock>,
    }

    impl Surface for RecordingSurface {
        fn present(&mut self, frame: &DecodedFrame) -> Result<()> {
            self.presented.lock().push((frame.sequence, self.clock.now()));
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            *self.finished.lock() = true;
            Ok(())
        }
    }

    impl PresentationBackend for Recorder {
        fn configure(&self, _: &StreamDescriptor, _: &FormatParams) -> Result<Box<dyn Surface>> {
            let clock = self.clock.clone().ok_or(anyhow::anyhow!("no clock"))?;
            Ok(Box::new(RecordingSurface {
                presented: self.presented.clone(),
                finished: self.finished.clone(),
                clock,
            }))
        }
    }

    fn frame(sequence: u64, pts_ms: Option<i64>) -> FrameItem {
        Item::Data(DecodedFrame {
            stream_index: 0,
            sequence,
            pts: pts_ms.map(ClockTime::from_millis),
            duration: None,
            payload: vec![0; 6],
            layout: FrameLayout::Picture {
                width: 2,
                height: 2,
                pixel_layout: PixelLayout::I420,
            },
        })
    }

    fn sink(
        recorder: &Recorder,
        clock: Arc<dyn Clock>,
        config: SinkConfig,
    ) -> anyhow::Result<(SinkStage, Producer<FrameItem>, std::sync::mpsc::Receiver<Message>)> {
        let descriptor = Arc::new(
            StreamDescriptor::new(0, MediaKind::Video, CodecId::RawVideo, TimeBase::MPEG)
                .with_format(FORMAT),
        );
        let (bus, rx) = Bus::channel();
        let eos = Arc::new(EosTracker::default());
        let mut stage = SinkStage::new(
            descriptor,
            &FORMAT,
            recorder,
            clock,
            config,
            Arc::new(LegStats::default()),
            bus,
            eos,
        )?;
        let (tx, frames) = bounded(QueueConfig::drop_oldest(8));
        stage.bind_input(&Port::input(0, FORMAT), Link::FramesIn(frames))?;
        Ok((stage, tx, rx))
    }

    #[test]
    fn presents_in_order_then_finishes() -> anyhow::Result<()> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let recorder = Recorder {
            clock: Some(clock.clone()),
            ..Default::default()
        };
        let config = SinkConfig {
            drop_late: false,
            ..Default::default()
        };
        let (mut stage, tx, rx) = sink(&recorder, clock.clone(), config)?;
        stage.start()?;

        for (n, pts) in [Some(0), Some(10), None, Some(30)].into_iter().enumerate() {
            tx.push(frame(n as u64, pts));
        }
        tx.push(Item::EndOfStream);

        let base_time = clock.now();
        stage.set_base_time(base_time);

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2))?,
            Message::SinkFinished { stream_index: 0 }
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(1))?, Message::EndOfStream);
        stage.join();

        let presented = recorder.presented.lock().clone();
        let order: Vec<u64> = presented.iter().map(|(n, _)| *n).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert!(presented[3].1 >= base_time.saturating_add(ClockTime::from_millis(30)));
        assert!(*recorder.finished.lock());
        Ok(())
    }

    #[test]
    fn stop_interrupts_clock_wait() -> anyhow::Result<()> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let recorder = Recorder {
            clock: Some(clock.clone()),
            ..Default::default()
        };
        let (mut stage, tx, _rx) = sink(&recorder, clock.clone(), SinkConfig::default())?;
        stage.start()?;
        tx.push(frame(0, Some(10_000)));
        stage.set_base_time(clock.now());

        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        stage.stop();
        stage.join();

        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(recorder.presented.lock().is_empty());
        Ok(())
    }

    #[test]
    fn stop_before_base_time() -> anyhow::Result<()> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let recorder = Recorder {
            clock: Some(clock.clone()),
            ..Default::default()
        };
        let (mut stage, _tx, _rx) = sink(&recorder, clock, SinkConfig::default())?;
        stage.start()?;
        stage.stop();
        stage.join();
        assert!(!*recorder.finished.lock());
        Ok(())
    }

    #[test]
    fn late_frames_are_replaced_by_newer_ones() -> anyhow::Result<()> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let recorder = Recorder {
            clock: Some(clock.clone()),
            ..Default::default()
        };
        let (mut stage, tx, rx) = sink(&recorder, clock.clone(), SinkConfig::default())?;
        stage.start()?;

        for n in 0..4 {
            tx.push(frame(n, Some(n as i64)));
        }
        tx.push(Item::EndOfStream);
        stage.set_base_time(clock.now().saturating_sub(ClockTime::from_millis(1000)));

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2))?,
            Message::SinkFinished { stream_index: 0 }
        );
        stage.join();

        let order: Vec<u64> = recorder.presented.lock().iter().map(|(n, _)| *n).collect();
        assert_eq!(order, vec![3]);
        Ok(())
    }

    #[test]
    fn early_frames_hold_back_the_producer() -> anyhow::Result<()> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let recorder = Recorder {
            clock: Some(clock.clone()),
            ..Default::default()
        };
        let (mut stage, tx, rx) = sink(&recorder, clock.clone(), SinkConfig::default())?;
        stage.start()?;

        let producer = std::thread::spawn(move || {
            let mut pushes: Vec<_> = (0..10).map(|n| tx.push(frame(n, Some(n as i64)))).collect();
            pushes.push(tx.push(Item::EndOfStream));
            pushes
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        stage.set_base_time(clock.now().saturating_add(ClockTime::from_millis(50)));
        let pushes = producer
            .join()
            .map_err(|_| anyhow::anyhow!("producer panicked"))?;
        assert!(pushes.iter().all(|p| *p == Push::Accepted));

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2))?,
            Message::SinkFinished { stream_index: 0 }
        );
        stage.join();

        let order: Vec<u64> = recorder.presented.lock().iter().map(|(n, _)| *n).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn only_late_frames_are_evictable() {
        let base = ClockTime::from_millis(1000);
        let due = frame(0, Some(100));
        assert!(!is_late(&due, base, ClockTime::from_millis(1100)));
        assert!(!is_late(&due, base, ClockTime::from_millis(1110)));
        assert!(is_late(&due, base, ClockTime::from_millis(1200)));
        assert!(!is_late(&frame(1, None), base, ClockTime::from_millis(5000)));
        assert!(!is_late(&Item::EndOfStream, base, ClockTime::from_millis(5000)));
    }

    #[test]
    fn sinks_have_no_output() -> anyhow::Result<()> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let recorder = Recorder {
            clock: Some(clock.clone()),
            ..Default::default()
        };
        let (mut stage, _tx, _rx) = sink(&recorder, clock, SinkConfig::default())?;
        let (out, _) = bounded(QueueConfig::blocking(1));
        assert!(matches!(
            stage.bind_output(&Port::output(0, FORMAT), Link::FramesOut(out)),
            Err(LinkError::TypeMismatch { .. })
        ));
        Ok(())
    }
}
