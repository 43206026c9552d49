#![doc = include_str!("../README.md")]
//!
//! ## Technical Overview
//!
//! A container is split into per-stream legs, each running on its own threads:
//!
//! ```text
//! container → Demuxer ─packets→ DecoderStage ─frames→ SinkStage → surface
//! ```
//!
//! ### Dataflow
//!
//! Stages exchange items only through bounded single-producer single-consumer
//! queues. Closing a queue wakes both ends and is the only way a stage is told
//! to stop.
//!
//! ### Timing
//!
//! Timestamps are normalized from each stream's time base to nanoseconds by the
//! demultiplexer. Sinks present a frame at `base_time + pts`, where the base
//! time is captured once when the pipeline starts playing.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mediapipe::bus::Message;
//! use mediapipe::pipeline::{Pipeline, PipelineConfig, StageTable, State};
//! use mediapipe::structs::stream::MediaKind;
//! use mediapipe::synthetic::{CollectingBackend, SyntheticCodecs, SyntheticProbe, SyntheticSource};
//!
//! let config = PipelineConfig::default();
//! let backend = Arc::new(CollectingBackend::new(config.clock.clone()));
//! let probe = SyntheticProbe::new().with_source("demo.syn", SyntheticSource::default());
//!
//! let table = StageTable::new(Arc::new(probe))
//!     .with_decoder(MediaKind::Audio, Arc::new(SyntheticCodecs))
//!     .with_decoder(MediaKind::Video, Arc::new(SyntheticCodecs))
//!     .with_sink(MediaKind::Audio, backend.clone())
//!     .with_sink(MediaKind::Video, backend);
//!
//! let mut pipeline = Pipeline::new(table, config);
//! let bus = pipeline.take_bus().expect("bus");
//! pipeline.set_source("demo.syn")?;
//! pipeline.transition(State::Playing)?;
//!
//! for message in bus.iter() {
//!     if message == Message::EndOfStream {
//!         break;
//!     }
//! }
//! pipeline.transition(State::Null)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Collaborator interfaces: container probe, codec library, presentation backend.
pub mod backend;

/// Status messages posted by stages and the pipeline.
pub mod bus;

/// The `Null → Ready → Paused → Playing` state machine that owns every stage.
pub mod pipeline;

/// Pipeline stages and the bitstream reformatter.
///
/// - **Demultiplexer** ([`process::demux`]): Stream selection and port registry
/// - **Reformatter** ([`process::reformat`]): Length-prefixed to Annex-B, ADTS synthesis
/// - **Decoder** ([`process::decode`]): Packets to frames
/// - **Sink** ([`process::render`]): Clock-synchronized presentation
pub mod process;

/// Data carried between stages.
///
/// - **Streams** ([`structs::stream`]): Descriptors and format parameters
/// - **Packets** ([`structs::packet`]): Raw and normalized compressed packets
/// - **Frames** ([`structs::frame`]): Decoded frames
/// - **Events** ([`structs::event`]): Stream-start, caps, segment markers
/// - **Ports** ([`structs::port`]): Typed stage connection points
/// - **Statistics** ([`structs::stats`]): Per-leg counters
pub mod structs;

/// Fabricated containers, codecs and a recording presentation backend.
pub mod synthetic;

/// Supporting infrastructure.
///
/// - **Errors** ([`utils::errors`]): Error taxonomy
/// - **Queue** ([`utils::queue`]): Bounded frame queue
/// - **Timing** ([`utils::timing`]): Time bases, clock times, pipeline clock
pub mod utils;
