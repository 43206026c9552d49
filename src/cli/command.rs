use std::path::PathBuf;

use clap::{Args, Parser as ClapParser, Subcommand, ValueEnum};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_GIT_DESCRIBE"),
    ", built ",
    env!("BUILD_TIMESTAMP"),
    ")\nmediapipe ",
    env!("MEDIAPIPE_VERSION"),
);

#[derive(Debug, ClapParser)]
#[command(
    name         = env!("CARGO_PKG_NAME"),
    version      = env!("CARGO_PKG_VERSION"),
    long_version = LONG_VERSION,
    author       = env!("CARGO_PKG_AUTHORS"),
    about        = "Plays synthetic media scenarios through the mediapipe dataflow engine",
    long_about   = None,
)]
pub struct Cli {
    /// Set the log level
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    pub loglevel: LogLevel,

    /// Treat transient decode errors as fatal (fail on first one).
    #[arg(long, global = true)]
    pub strict: bool,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Plain)]
    pub log_format: LogFormat,

    /// Show progress bars during operations.
    #[arg(long, global = true)]
    pub progress: bool,

    /// Choose an operation to perform.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Play a scenario through demux, decode and render stages.
    Play(PlayArgs),

    /// Print stream information
    Info(InfoArgs),
}

#[derive(Debug, Args)]
pub struct PlayArgs {
    /// Scenario file in YAML (use "-" for stdin).
    #[arg(value_name = "SCENARIO")]
    pub input: PathBuf,

    /// Base path for decoded audio (.wav) and video (.yuv) files.
    #[arg(long, value_name = "PATH")]
    pub output_path: Option<PathBuf>,

    /// Capacity of each demux to decoder packet queue.
    #[arg(long, value_name = "N", default_value_t = 32, value_parser = clap::value_parser!(u32).range(1..))]
    pub packet_queue: u32,

    /// Capacity of each audio frame queue (blocking).
    #[arg(long, value_name = "N", default_value_t = 8, value_parser = clap::value_parser!(u32).range(1..))]
    pub audio_queue: u32,

    /// Capacity of each video frame queue (drops the oldest late frame when full).
    #[arg(long, value_name = "N", default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..))]
    pub video_queue: u32,

    /// Sink look-ahead depth (1 or 2).
    #[arg(long, value_name = "N", default_value_t = 2, value_parser = clap::value_parser!(u8).range(1..=2))]
    pub lookahead: u8,

    /// Present late video frames instead of dropping them.
    #[arg(long)]
    pub no_drop_late: bool,

    /// Play only these stream indices (repeatable).
    #[arg(long = "stream", value_name = "INDEX")]
    pub streams: Vec<u32>,

    /// Use the closest ADTS sample rate when the exact rate has no index.
    #[arg(long)]
    pub nearest_sample_rate: bool,

    /// Stop playback after this many seconds.
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<f64>,
}

#[derive(Debug, Args)]
pub struct InfoArgs {
    /// Scenario file in YAML (use "-" for stdin).
    #[arg(value_name = "SCENARIO")]
    pub input: PathBuf,

    /// Use the closest ADTS sample rate when checking reformat steps.
    #[arg(long)]
    pub nearest_sample_rate: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    /// Disable logging output.
    Off,
    /// No output except errors.
    Error,
    /// Show warnings and errors.
    Warn,
    /// Show info, warnings and errors (default).
    Info,
    /// Show debug, info, warnings and errors.
    Debug,
    /// Show all log messages including trace.
    Trace,
}

impl LogLevel {
    /// Convert LogLevel to log::LevelFilter
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Colorized human-readable text.
    Plain,
    /// Structured JSON per log record.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_flags() {
        let cli = Cli::try_parse_from([
            "mediapiped",
            "--strict",
            "play",
            "demo.yaml",
            "--stream",
            "1",
            "--stream",
            "2",
            "--no-drop-late",
            "--timeout",
            "2.5",
        ])
        .unwrap();
        assert!(cli.strict);
        let Commands::Play(args) = cli.command else {
            panic!("expected play");
        };
        assert_eq!(args.streams, vec![1, 2]);
        assert!(args.no_drop_late);
        assert_eq!(args.timeout, Some(2.5));
        assert_eq!(args.packet_queue, 32);
        assert_eq!(args.lookahead, 2);
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(Cli::try_parse_from(["mediapiped", "play", "x", "--video-queue", "0"]).is_err());
        assert!(Cli::try_parse_from(["mediapiped", "play", "x", "--lookahead", "3"]).is_err());
    }
}
