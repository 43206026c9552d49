use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

use mediapipe::bus::{ErrorKind, Message};
use mediapipe::pipeline::{Pipeline, PipelineConfig, StageTable, State};
use mediapipe::structs::stream::{
    AudioFormat, CodecId, FormatParams, MediaKind, Packaging, PixelLayout, SampleFormat,
    VideoFormat,
};
use mediapipe::synthetic::{
    CollectingBackend, SyntheticCodecs, SyntheticProbe, SyntheticSource, SyntheticStream,
};
use mediapipe::utils::queue::QueueConfig;
use mediapipe::utils::timing::{ClockTime, TimeBase};

const PATH: &str = "scenario.syn";

fn h264_video(index: u32) -> Result<SyntheticStream> {
    let mut stream = SyntheticStream::new(
        index,
        CodecId::H264,
        TimeBase::new(1, 100)?,
        FormatParams::Video(VideoFormat {
            width: 16,
            height: 8,
            pixel_layout: PixelLayout::I420,
            frame_rate: None,
        }),
    );
    stream.packaging = Packaging::LengthPrefixed;
    stream.keyframe_interval = 4;
    Ok(stream)
}

fn aac_audio(index: u32) -> Result<SyntheticStream> {
    let mut stream = SyntheticStream::new(
        index,
        CodecId::Aac,
        TimeBase::new(1, 48000)?,
        FormatParams::Audio(AudioFormat {
            sample_rate: 48000,
            channels: 2,
            sample_format: SampleFormat::F32,
            profile: Some(2),
        }),
    );
    stream.packaging = Packaging::Headerless;
    stream.packet_duration = 480;
    Ok(stream)
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.video_frame_queue = QueueConfig::blocking(4);
    config.sink.drop_late = false;
    config
}

struct Harness {
    pipeline: Pipeline,
    bus: Receiver<Message>,
    backend: CollectingBackend,
}

fn harness(source: SyntheticSource, config: PipelineConfig) -> Result<Harness> {
    let backend = CollectingBackend::new(config.clock.clone());
    harness_with(source, config, backend)
}

fn harness_with(
    source: SyntheticSource,
    config: PipelineConfig,
    backend: CollectingBackend,
) -> Result<Harness> {
    let probe = SyntheticProbe::new().with_source(PATH, source);
    let table = StageTable::new(Arc::new(probe))
        .with_decoder(MediaKind::Audio, Arc::new(SyntheticCodecs))
        .with_decoder(MediaKind::Video, Arc::new(SyntheticCodecs))
        .with_sink(MediaKind::Audio, Arc::new(backend.clone()))
        .with_sink(MediaKind::Video, Arc::new(backend.clone()));

    let mut pipeline = Pipeline::new(table, config);
    let bus = pipeline.take_bus().ok_or(anyhow!("bus already taken"))?;
    pipeline.set_source(PATH)?;
    Ok(Harness {
        pipeline,
        bus,
        backend,
    })
}

fn until_end_of_stream(bus: &Receiver<Message>) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    loop {
        let message = bus.recv_timeout(Duration::from_secs(10))?;
        let done = message == Message::EndOfStream;
        messages.push(message);
        if done {
            return Ok(messages);
        }
    }
}

#[test]
fn audio_and_video_play_to_completion() -> Result<()> {
    let source = SyntheticSource::new(vec![h264_video(0)?, aac_audio(1)?]);
    let mut h = harness(source, PipelineConfig::default())?;

    h.pipeline.transition(State::Playing)?;
    assert_eq!(h.pipeline.state(), State::Playing);
    let messages = until_end_of_stream(&h.bus)?;

    let discovered = messages.iter().find_map(|m| match m {
        Message::StreamsDiscovered { streams, .. } => Some(streams.len()),
        _ => None,
    });
    assert_eq!(discovered, Some(2));

    let mut finished: Vec<u32> = messages
        .iter()
        .filter_map(|m| match m {
            Message::SinkFinished { stream_index } => Some(*stream_index),
            _ => None,
        })
        .collect();
    finished.sort();
    assert_eq!(finished, vec![0, 1]);

    assert_eq!(h.backend.presented_for(0).len(), 10);
    assert_eq!(h.backend.presented_for(1).len(), 10);

    let pts: Vec<Option<ClockTime>> = h.backend.presented_for(0).iter().map(|p| p.pts).collect();
    let expected: Vec<Option<ClockTime>> =
        (0..10).map(|n| Some(ClockTime::from_millis(n * 10))).collect();
    assert_eq!(pts, expected);

    let started = Instant::now();
    h.pipeline.transition(State::Null)?;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(h.pipeline.state(), State::Null);
    Ok(())
}

#[test]
fn video_only_creates_one_port() -> Result<()> {
    let source = SyntheticSource::new(vec![h264_video(0)?]);
    let mut h = harness(source, config())?;

    h.pipeline.transition(State::Playing)?;
    let messages = until_end_of_stream(&h.bus)?;

    let ports = messages
        .iter()
        .filter(|m| matches!(m, Message::PortAdded(_)))
        .count();
    assert_eq!(ports, 1);
    assert_eq!(h.backend.finished(), vec![0]);

    h.pipeline.transition(State::Null)?;
    Ok(())
}

#[test]
fn transient_decode_error_skips_one_frame() -> Result<()> {
    let mut video = h264_video(0)?;
    video.corrupt = vec![4];
    let mut h = harness(SyntheticSource::new(vec![video]), config())?;

    h.pipeline.transition(State::Playing)?;
    let messages = until_end_of_stream(&h.bus)?;

    let warnings = messages
        .iter()
        .filter(|m| {
            matches!(
                m,
                Message::Warning {
                    kind: ErrorKind::TransientDecode,
                    stream_index: Some(0),
                    ..
                }
            )
        })
        .count();
    assert_eq!(warnings, 1);

    let stats = h.pipeline.stats();
    let leg = stats.get(&0).ok_or(anyhow!("no stats for stream 0"))?;
    assert_eq!(leg.frames_decoded, 9);
    assert_eq!(leg.transient_errors, 1);
    assert_eq!(h.backend.presented_for(0).len(), 9);
    assert_eq!(h.pipeline.state(), State::Playing);

    h.pipeline.transition(State::Null)?;
    Ok(())
}

#[test]
fn stop_interrupts_clock_wait() -> Result<()> {
    let mut video = h264_video(0)?;
    video.time_base = TimeBase::new(1, 1)?;
    video.packet_duration = 30;
    video.packet_count = 3;
    let mut h = harness(SyntheticSource::new(vec![video]), config())?;

    h.pipeline.transition(State::Playing)?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.backend.presented_for(0).is_empty() {
        if Instant::now() > deadline {
            return Err(anyhow!("first frame never presented"));
        }
        thread::sleep(Duration::from_millis(5));
    }

    let started = Instant::now();
    h.pipeline.transition(State::Null)?;
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(500), "stop took {elapsed:?}");
    assert_eq!(h.backend.presented_for(0).len(), 1);
    assert!(h.backend.finished().is_empty());
    Ok(())
}

#[test]
fn open_failure_leaves_pipeline_ready() -> Result<()> {
    let mut source = SyntheticSource::new(vec![h264_video(0)?]);
    source.unreadable = true;
    let mut h = harness(source, config())?;

    assert!(h.pipeline.transition(State::Playing).is_err());
    assert_eq!(h.pipeline.state(), State::Ready);
    assert!(h.bus.try_iter().any(|m| matches!(
        m,
        Message::Error {
            kind: ErrorKind::Open,
            ..
        }
    )));
    Ok(())
}

#[test]
fn read_error_ends_playback_with_warning() -> Result<()> {
    let mut source = SyntheticSource::new(vec![h264_video(0)?, aac_audio(1)?]);
    source.read_error_after = Some(5);
    let mut h = harness(source, config())?;

    h.pipeline.transition(State::Playing)?;
    let messages = until_end_of_stream(&h.bus)?;

    assert!(messages.iter().any(|m| matches!(
        m,
        Message::Warning {
            kind: ErrorKind::IoRead,
            ..
        }
    )));
    let presented = h.backend.presented().len();
    assert_eq!(presented, 5);
    let mut finished = h.backend.finished();
    finished.sort();
    assert_eq!(finished, vec![0, 1]);

    h.pipeline.transition(State::Null)?;
    Ok(())
}

#[test]
fn late_format_stream_still_links() -> Result<()> {
    let mut video = h264_video(0)?;
    video.late_format = true;
    let source = SyntheticSource::new(vec![video, aac_audio(1)?]);
    let mut h = harness(source, config())?;

    h.pipeline.transition(State::Playing)?;
    let messages = until_end_of_stream(&h.bus)?;

    let ports: Vec<u32> = messages
        .iter()
        .filter_map(|m| match m {
            Message::PortAdded(port) => Some(port.stream_index),
            _ => None,
        })
        .collect();
    assert_eq!(ports.len(), 2);
    assert_eq!(h.backend.presented_for(0).len(), 10);

    h.pipeline.transition(State::Null)?;
    Ok(())
}

#[test]
fn explicit_selection_plays_two_audio_streams() -> Result<()> {
    let source = SyntheticSource::new(vec![h264_video(0)?, aac_audio(1)?, aac_audio(2)?]);
    let mut config = config();
    config.demux.selection = mediapipe::process::demux::StreamSelection::Indices(vec![1, 2]);
    let mut h = harness(source, config)?;

    h.pipeline.transition(State::Playing)?;
    until_end_of_stream(&h.bus)?;

    assert!(h.backend.presented_for(0).is_empty());
    assert_eq!(h.backend.presented_for(1).len(), 10);
    assert_eq!(h.backend.presented_for(2).len(), 10);

    h.pipeline.transition(State::Null)?;
    Ok(())
}

#[test]
fn default_config_presents_every_video_frame() -> Result<()> {
    for preroll in [Some(Duration::from_millis(200)), None] {
        let mut video = h264_video(0)?;
        video.time_base = TimeBase::new(1, 50)?;
        video.packet_count = 20;
        let mut h = harness(SyntheticSource::new(vec![video]), PipelineConfig::default())?;

        if let Some(wait) = preroll {
            h.pipeline.transition(State::Paused)?;
            thread::sleep(wait);
        }
        h.pipeline.transition(State::Playing)?;
        until_end_of_stream(&h.bus)?;

        let stats = h.pipeline.stats();
        let leg = stats.get(&0).ok_or(anyhow!("no stats for stream 0"))?;
        assert_eq!(leg.frames_decoded, 20);
        assert_eq!(leg.frames_queue_dropped, 0);
        assert_eq!(leg.frames_late_dropped, 0);
        assert_eq!(leg.frames_presented, 20);

        let pts: Vec<Option<ClockTime>> =
            h.backend.presented_for(0).iter().map(|p| p.pts).collect();
        let expected: Vec<Option<ClockTime>> =
            (0..20).map(|n| Some(ClockTime::from_millis(n * 20))).collect();
        assert_eq!(pts, expected);

        h.pipeline.transition(State::Null)?;
    }
    Ok(())
}

#[test]
fn refused_surface_disables_only_that_leg() -> Result<()> {
    let config = PipelineConfig::default();
    let backend = CollectingBackend::new(config.clock.clone()).refusing(MediaKind::Audio);
    let source = SyntheticSource::new(vec![h264_video(0)?, aac_audio(1)?]);
    let mut h = harness_with(source, config, backend)?;

    h.pipeline.transition(State::Playing)?;
    let messages = until_end_of_stream(&h.bus)?;

    assert!(messages.iter().any(|m| matches!(
        m,
        Message::Error {
            kind: ErrorKind::Present,
            stream_index: Some(1),
            ..
        }
    )));
    assert_eq!(h.backend.presented_for(0).len(), 10);
    assert!(h.backend.presented_for(1).is_empty());
    assert_eq!(h.backend.finished(), vec![0]);
    assert_eq!(h.pipeline.state(), State::Playing);

    h.pipeline.transition(State::Null)?;
    Ok(())
}
