use anyhow::Result;

use super::command::{Cli, InfoArgs};
use crate::scenario::Scenario;
use crate::timestamp::time_str;
use mediapipe::backend::ContainerProbe;
use mediapipe::process::reformat::{Reformatter, SampleRatePolicy};
use mediapipe::structs::stream::StreamDescriptor;
use mediapipe::synthetic::SyntheticProbe;
use mediapipe::utils::timing::{ClockTime, normalize};

pub fn cmd_info(args: &InfoArgs, cli: &Cli) -> Result<()> {
    log::info!("Analyzing scenario: {}", args.input.display());

    let scenario = Scenario::load(&args.input)?;
    let source = scenario.to_source()?;
    let probe = SyntheticProbe::new().with_source(&args.input, source.clone());
    let (streams, _container) = probe.open(&args.input)?;

    let policy = if args.nearest_sample_rate {
        SampleRatePolicy::Nearest
    } else {
        SampleRatePolicy::Reject
    };

    println!("Scenario: {}", scenario.display_name(&args.input));
    println!("Streams: {}", streams.len());
    if let Some(limit) = source.read_error_after {
        println!("Read error after: {limit} packets");
    }

    let mut unusable = 0;
    for (descriptor, stream) in streams.iter().zip(&source.streams) {
        let end = normalize(
            Some(stream.start_pts + stream.packet_count as i64 * stream.packet_duration),
            stream.time_base,
        )
        .unwrap_or(ClockTime::ZERO);

        println!();
        println!("Stream #{}", descriptor.index);
        println!("  Kind:        {}", descriptor.kind);
        println!("  Codec:       {}", descriptor.codec);
        println!("  Time base:   {}", descriptor.time_base);
        println!("  Packaging:   {}", descriptor.packaging);
        match &descriptor.format {
            Some(format) => println!("  Format:      {format}"),
            None => println!("  Format:      (announced after the first packets)"),
        }
        println!("  Packets:     {}", stream.packet_count);
        println!("  Ends at:     {}", time_str(end));

        match reformat_step(descriptor, policy) {
            Ok(step) => println!("  Reformat:    {step}"),
            Err(e) => {
                unusable += 1;
                println!("  Reformat:    unavailable ({e})");
            }
        }
        if !stream.corrupt.is_empty() {
            println!("  Corrupt:     {:?}", stream.corrupt);
        }
        if !stream.missing_pts.is_empty() {
            println!("  Missing PTS: {:?}", stream.missing_pts);
        }
    }

    if unusable > 0 {
        log::warn!("{unusable} stream(s) cannot be linked with the current settings");
        if cli.strict {
            anyhow::bail!("{unusable} stream(s) cannot be linked (strict mode)");
        }
    }

    Ok(())
}

fn reformat_step(descriptor: &StreamDescriptor, policy: SampleRatePolicy) -> Result<String> {
    let Some(format) = &descriptor.format else {
        return Ok("decided when the format arrives".to_string());
    };
    let reformatter = Reformatter::for_stream(descriptor, format, policy)?;
    Ok(reformatter.name().to_string())
}
