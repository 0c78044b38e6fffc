use clap::Parser;
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Transport stream relay with on-demand input switching",
    long_about = "Reads transport stream packets from one of several inputs at a time and \n\
                  forwards them to a single output, with on-demand switching between the \n\
                  inputs, automatic failover on receive timeout and an optional privileged \n\
                  primary input that takes over as soon as it produces data.\n\
                  \n\
                  Inputs are HLS playlist URLs (http or https) or transport stream files \n\
                  (\"-\" reads from standard input). Remote control commands are read from \n\
                  standard input: \"set I\", \"next\", \"prev\", \"exit\"."
)]
pub struct CliArgs {
    /// Input URLs or file paths, in switching order
    #[arg(required = true, help = "HLS playlist URLs or transport stream files")]
    pub inputs: Vec<String>,

    /// Output file for the relayed transport stream
    #[arg(
        short,
        long,
        help = "Output transport stream file (default: standard output)"
    )]
    pub output: Option<PathBuf>,

    /// Index of the input to start with
    #[arg(long, default_value = "0", help = "Index of the initial input")]
    pub first_input: usize,

    /// Privileged input that pre-empts the current one when it produces
    #[arg(
        long,
        help = "Index of the primary input; when it produces data it automatically becomes current"
    )]
    pub primary_input: Option<usize>,

    /// Stop after this many full cycles through all inputs
    #[arg(
        long,
        default_value = "0",
        help = "Number of complete input cycles before terminating (0 = unlimited)"
    )]
    pub cycle_count: usize,

    /// Terminate when the first input session ends
    #[arg(long, help = "Terminate the relay when an input session ends")]
    pub terminate: bool,

    /// Keep all inputs running and switch instantly
    #[arg(
        long,
        conflicts_with = "delayed_switch",
        help = "Fast switching: all inputs keep receiving, the current pointer flips instantly"
    )]
    pub fast_switch: bool,

    /// Start the next input before stopping the current one
    #[arg(
        long,
        help = "Delayed switching: the current input stops only when the next one produces data"
    )]
    pub delayed_switch: bool,

    /// Packet capacity of each input buffer
    #[arg(
        long,
        default_value = "512",
        help = "Number of buffered packets per input"
    )]
    pub buffered_packets: usize,

    /// Maximum packets per receive operation
    #[arg(
        long,
        default_value = "128",
        help = "Maximum number of packets per receive operation"
    )]
    pub max_input_packets: usize,

    /// Receive timeout in milliseconds
    #[arg(
        long,
        default_value = "0",
        help = "Failover to the next input when the current one is silent for this long, in milliseconds (0 = no timeout)"
    )]
    pub receive_timeout: u64,

    /// Select the lowest bitrate variant of a master playlist
    #[arg(long, group = "variant_selection")]
    pub lowest_bitrate: bool,

    /// Select the highest bitrate variant of a master playlist
    #[arg(long, group = "variant_selection")]
    pub highest_bitrate: bool,

    /// Select the lowest resolution variant of a master playlist
    #[arg(long, group = "variant_selection")]
    pub lowest_resolution: bool,

    /// Select the highest resolution variant of a master playlist
    #[arg(long, group = "variant_selection")]
    pub highest_resolution: bool,

    /// Minimum variant bitrate in bits per second
    #[arg(long, conflicts_with = "variant_selection")]
    pub min_bitrate: Option<u64>,

    /// Maximum variant bitrate in bits per second
    #[arg(long, conflicts_with = "variant_selection")]
    pub max_bitrate: Option<u64>,

    /// Minimum variant width in pixels
    #[arg(long, conflicts_with = "variant_selection")]
    pub min_width: Option<u64>,

    /// Maximum variant width in pixels
    #[arg(long, conflicts_with = "variant_selection")]
    pub max_width: Option<u64>,

    /// Minimum variant height in pixels
    #[arg(long, conflicts_with = "variant_selection")]
    pub min_height: Option<u64>,

    /// Maximum variant height in pixels
    #[arg(long, conflicts_with = "variant_selection")]
    pub max_height: Option<u64>,

    /// List the variants of master playlists
    #[arg(long, help = "Log all variant streams of HLS master playlists")]
    pub list_variants: bool,

    /// Save downloaded playlists and segments
    #[arg(
        long,
        value_name = "DIR",
        help = "Directory where all downloaded playlists and media segments are saved"
    )]
    pub save_files: Option<PathBuf>,

    /// Stop an HLS input after this many media segments
    #[arg(long, help = "Stop HLS inputs after receiving this many media segments")]
    pub segment_count: Option<usize>,

    /// Start HLS playout at the last segment of the playlist
    #[arg(
        long,
        conflicts_with = "start_segment",
        help = "Live stream: start at the last segment (alias for --start-segment -1)"
    )]
    pub live: bool,

    /// Starting segment in the initial HLS playlist
    #[arg(
        long,
        allow_negative_numbers = true,
        help = "Starting segment: positive counts from the start of the playlist, negative from the end"
    )]
    pub start_segment: Option<i64>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,
}

/// A parsed remote control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    Set(usize),
    Next,
    Previous,
    Exit,
}

/// Parse one line of the remote control channel.
pub fn parse_remote_command(line: &str) -> Option<RemoteCommand> {
    let mut words = line.split_whitespace();
    match words.next()? {
        "set" => words
            .next()
            .and_then(|index| index.parse().ok())
            .map(RemoteCommand::Set),
        "next" => Some(RemoteCommand::Next),
        "prev" => Some(RemoteCommand::Previous),
        "exit" => Some(RemoteCommand::Exit),
        _ => None,
    }
}
