//! Translate CLI arguments into engine and input options.

use std::time::Duration;

use hls_input::{HlsInputOptions, VariantRange, VariantSelection};
use switch::{Strategy, SwitchOptions};

use crate::cli::CliArgs;

pub fn switch_options(args: &CliArgs) -> SwitchOptions {
    let strategy = if args.fast_switch {
        Strategy::Fast
    } else if args.delayed_switch {
        Strategy::Delayed
    } else {
        Strategy::Sequential
    };
    SwitchOptions {
        first_input: args.first_input,
        primary_input: args.primary_input,
        cycle_count: args.cycle_count,
        terminate: args.terminate,
        strategy,
        buffered_packets: args.buffered_packets,
        max_input_packets: args.max_input_packets,
        receive_timeout: Duration::from_millis(args.receive_timeout),
    }
}

pub fn hls_options(args: &CliArgs, url: &str) -> HlsInputOptions {
    let selection = if args.lowest_bitrate {
        VariantSelection::LowestBitrate
    } else if args.highest_bitrate {
        VariantSelection::HighestBitrate
    } else if args.lowest_resolution {
        VariantSelection::LowestResolution
    } else if args.highest_resolution {
        VariantSelection::HighestResolution
    } else {
        VariantSelection::Ranged(VariantRange {
            min_bitrate: args.min_bitrate.unwrap_or(0),
            max_bitrate: args.max_bitrate.unwrap_or(0),
            min_width: args.min_width.unwrap_or(0),
            max_width: args.max_width.unwrap_or(0),
            min_height: args.min_height.unwrap_or(0),
            max_height: args.max_height.unwrap_or(0),
        })
    };

    let mut opts = HlsInputOptions::new(url);
    opts.selection = selection;
    opts.list_variants = args.list_variants;
    opts.save_dir = args.save_files.clone();
    opts.max_segment_count = args.segment_count.unwrap_or(0);
    opts.start_segment = if args.live {
        // With live streams, start at the last segment.
        -1
    } else {
        args.start_segment.unwrap_or(0)
    };
    opts
}
