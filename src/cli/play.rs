use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use super::command::{Cli, PlayArgs};
use crate::output::{DiscardBackend, LegReport, OutputBackend, PlayReport};
use crate::scenario::Scenario;
use crate::timestamp::time_str;
use mediapipe::backend::{CodecLibrary, PresentationBackend};
use mediapipe::bus::{ErrorKind, Message};
use mediapipe::pipeline::{Pipeline, PipelineConfig, StageTable, State};
use mediapipe::process::demux::{DemuxConfig, StreamSelection};
use mediapipe::process::reformat::SampleRatePolicy;
use mediapipe::process::render::SinkConfig;
use mediapipe::structs::stats::LegSnapshot;
use mediapipe::structs::stream::MediaKind;
use mediapipe::synthetic::{SyntheticCodecs, SyntheticProbe};
use mediapipe::utils::queue::QueueConfig;
use mediapipe::utils::timing::{ClockTime, SystemClock};

const BUS_POLL: Duration = Duration::from_millis(100);

fn pipeline_config(args: &PlayArgs) -> PipelineConfig {
    let selection = if args.streams.is_empty() {
        StreamSelection::FirstOfEachKind
    } else {
        StreamSelection::Indices(args.streams.clone())
    };
    let sample_rate_policy = if args.nearest_sample_rate {
        SampleRatePolicy::Nearest
    } else {
        SampleRatePolicy::Reject
    };

    PipelineConfig {
        packet_queue: QueueConfig::blocking(args.packet_queue as usize),
        audio_frame_queue: QueueConfig::blocking(args.audio_queue as usize),
        video_frame_queue: QueueConfig::drop_oldest(args.video_queue as usize),
        sink: SinkConfig {
            lookahead: args.lookahead as usize,
            drop_late: !args.no_drop_late,
        },
        demux: DemuxConfig {
            selection,
            sample_rate_policy,
            ..DemuxConfig::default()
        },
        clock: Arc::new(SystemClock::new()),
    }
}

/// What the bus loop saw before it stopped.
#[derive(Debug, Default)]
struct Outcome {
    end_of_stream: bool,
    timed_out: bool,
    errors: Vec<String>,
    fatal: Option<String>,
}

pub fn cmd_play(args: &PlayArgs, cli: &Cli, multi: Option<&MultiProgress>) -> Result<()> {
    log::info!(
        "Playing scenario: {} (strict mode: {})",
        args.input.display(),
        cli.strict
    );

    let scenario = Scenario::load(&args.input)?;
    let source = scenario.to_source()?;
    let name = scenario.display_name(&args.input);

    let probe = SyntheticProbe::new().with_source(&args.input, source);
    let codecs: Arc<dyn CodecLibrary> = Arc::new(SyntheticCodecs);
    let backend: Arc<dyn PresentationBackend> = match &args.output_path {
        Some(base_path) => {
            log::info!("Output path specified: {}", base_path.display());
            Arc::new(OutputBackend::new(base_path))
        }
        None => Arc::new(DiscardBackend),
    };

    let table = StageTable::new(Arc::new(probe))
        .with_decoder(MediaKind::Audio, codecs.clone())
        .with_decoder(MediaKind::Video, codecs)
        .with_sink(MediaKind::Audio, backend.clone())
        .with_sink(MediaKind::Video, backend);

    let mut pipeline = Pipeline::new(table, pipeline_config(args));
    pipeline.set_source(&args.input)?;
    let bus = pipeline
        .take_bus()
        .ok_or_else(|| anyhow!("pipeline bus already taken"))?;

    let pb = match multi {
        Some(multi) => Some(create_progress_bar(multi)?),
        None => None,
    };

    let started = Instant::now();
    if let Err(e) = pipeline.transition(State::Playing) {
        drain_bus(&bus, cli.strict);
        pipeline.transition(State::Null)?;
        if let Some(pb) = &pb {
            pb.finish_and_clear();
        }
        return Err(e.into());
    }

    let outcome = follow_bus(&pipeline, &bus, args, cli.strict, &scenario, pb.as_ref());
    let elapsed = started.elapsed();

    pipeline.transition(State::Null)?;
    if let Some(pb) = &pb {
        pb.finish_with_message("done");
    }

    let stats = pipeline.stats();
    print_stats(&stats, elapsed);

    if let Some(base_path) = &args.output_path {
        let report = PlayReport {
            scenario: name,
            elapsed_secs: elapsed.as_secs_f64(),
            end_of_stream: outcome.end_of_stream,
            errors: outcome.errors.clone(),
            legs: stats.iter().map(|(&i, s)| (i, LegReport::from(s))).collect(),
        };
        let path = report.write(base_path)?;
        log::info!("Report written to {}", path.display());
    }

    if let Some(fatal) = outcome.fatal {
        return Err(anyhow!("{fatal}"));
    }
    if outcome.timed_out {
        log::warn!("Playback stopped by timeout after {:.3}s", elapsed.as_secs_f64());
    }

    let presented: u64 = stats.values().map(|s| s.frames_presented).sum();
    if presented == 0 && !outcome.errors.is_empty() {
        return Err(anyhow!(
            "No frames presented: {}",
            outcome.errors.join("; ")
        ));
    }

    Ok(())
}

fn create_progress_bar(multi: &MultiProgress) -> Result<ProgressBar> {
    let pb = multi.add(ProgressBar::new(0));
    pb.set_style(ProgressStyle::with_template(
        "{bar:40.cyan/blue} {pos}/{len} frames ({percent}%)\n{msg} | elapsed: {elapsed_precise}",
    )?);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message("prerolling");
    Ok(pb)
}

fn follow_bus(
    pipeline: &Pipeline,
    bus: &Receiver<Message>,
    args: &PlayArgs,
    strict: bool,
    scenario: &Scenario,
    pb: Option<&ProgressBar>,
) -> Outcome {
    let deadline = args
        .timeout
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| Instant::now() + Duration::from_secs_f64(secs));
    let mut outcome = Outcome::default();

    loop {
        if let Some(pb) = pb {
            let presented: u64 = pipeline
                .stats()
                .values()
                .map(|s| s.frames_presented)
                .sum();
            pb.set_position(presented);
        }

        match bus.recv_timeout(BUS_POLL) {
            Ok(Message::EndOfStream) => {
                log::info!("End of stream");
                outcome.end_of_stream = true;
                break;
            }
            Ok(Message::PortAdded(port)) => {
                log::info!("Linked {port}");
                if let Some(pb) = pb {
                    let packets = scenario
                        .streams
                        .get(port.stream_index as usize)
                        .map_or(0, |s| s.packets);
                    pb.inc_length(packets);
                    pb.set_message("playing");
                }
            }
            Ok(message) => {
                if let Some(fatal) = handle_message(message, strict, &mut outcome.errors) {
                    outcome.fatal = Some(fatal);
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                log::debug!("Bus closed");
                break;
            }
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            outcome.timed_out = true;
            break;
        }
    }

    outcome
}

/// Logs one bus message. Returns the reason to abort the run, if any.
fn handle_message(message: Message, strict: bool, errors: &mut Vec<String>) -> Option<String> {
    match message {
        Message::StateChanged { old, new } => log::debug!("State changed: {old} → {new}"),
        Message::StreamsDiscovered { group_id, streams } => {
            log::info!("Group {group_id}: {} stream(s) discovered", streams.len());
            for stream in &streams {
                log::debug!(
                    "  #{} {} {} ({})",
                    stream.index,
                    stream.kind,
                    stream.codec,
                    stream.packaging
                );
            }
        }
        Message::PortAdded(port) => log::info!("Linked {port}"),
        Message::SinkFinished { stream_index } => {
            log::info!("Stream {stream_index} finished")
        }
        Message::Warning {
            kind,
            stage,
            stream_index,
            message,
        } => {
            let text = describe(kind, stage, stream_index, &message);
            log::warn!("{text}");
            if strict && kind == ErrorKind::TransientDecode {
                return Some(format!("{text} (strict mode)"));
            }
        }
        Message::Error {
            kind,
            stage,
            stream_index,
            message,
        } => {
            let text = describe(kind, stage, stream_index, &message);
            log::error!("{text}");
            if strict {
                return Some(text);
            }
            errors.push(text);
        }
        Message::EndOfStream => {}
    }
    None
}

fn describe(
    kind: ErrorKind,
    stage: impl std::fmt::Display,
    stream_index: Option<u32>,
    message: &str,
) -> String {
    match stream_index {
        Some(index) => format!("{stage} {kind} on stream {index}: {message}"),
        None => format!("{stage} {kind}: {message}"),
    }
}

fn drain_bus(bus: &Receiver<Message>, strict: bool) {
    let mut errors = Vec::new();
    while let Ok(message) = bus.try_recv() {
        // Strict aborts are moot here; the run already failed.
        let _ = handle_message(message, strict, &mut errors);
    }
}

fn print_stats(stats: &BTreeMap<u32, LegSnapshot>, elapsed: Duration) {
    println!(
        "Played for {}",
        time_str(ClockTime::from(elapsed))
    );
    for (index, leg) in stats {
        println!();
        println!("Stream #{index}");
        println!("  Packets routed:            {}", leg.packets_routed);
        println!("  Packets reformat-dropped:  {}", leg.packets_reformat_dropped);
        println!("  Frames decoded:            {}", leg.frames_decoded);
        println!("  Transient decode errors:   {}", leg.transient_errors);
        println!("  Frames presented:          {}", leg.frames_presented);
        println!("  Frames dropped (queue):    {}", leg.frames_queue_dropped);
        println!("  Frames dropped (late):     {}", leg.frames_late_dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediapipe::bus::StageKind;
    use std::path::PathBuf;

    fn args() -> PlayArgs {
        PlayArgs {
            input: PathBuf::from("demo.yaml"),
            output_path: None,
            packet_queue: 16,
            audio_queue: 8,
            video_queue: 3,
            lookahead: 1,
            no_drop_late: true,
            streams: vec![2],
            nearest_sample_rate: true,
            timeout: None,
        }
    }

    #[test]
    fn flags_map_onto_pipeline_config() {
        let config = pipeline_config(&args());
        assert_eq!(config.packet_queue, QueueConfig::blocking(16));
        assert_eq!(config.video_frame_queue, QueueConfig::drop_oldest(3));
        assert_eq!(config.sink.lookahead, 1);
        assert!(!config.sink.drop_late);
        assert_eq!(config.demux.selection, StreamSelection::Indices(vec![2]));
        assert_eq!(config.demux.sample_rate_policy, SampleRatePolicy::Nearest);
        assert_eq!(config.demux.pending_limit, DemuxConfig::default().pending_limit);
    }

    #[test]
    fn strict_turns_transient_errors_fatal() {
        let warning = || Message::Warning {
            kind: ErrorKind::TransientDecode,
            stage: StageKind::Decoder,
            stream_index: Some(0),
            message: "bad packet".into(),
        };
        let mut errors = Vec::new();
        assert!(handle_message(warning(), false, &mut errors).is_none());
        assert!(handle_message(warning(), true, &mut errors).is_some());
        assert!(errors.is_empty());
    }
}
