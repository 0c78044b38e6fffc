use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use hls_input::HlsInput;
use switch::{Core, InputPlugin};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

mod cli;
mod config;
mod plugins;

use cli::{CliArgs, RemoteCommand, parse_remote_command};
use plugins::{FileInput, FileOutput};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    // Setup logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    // Build one input plugin per command line input.
    let uses_stdin = args.inputs.iter().any(|input| input == "-");
    let mut inputs: Vec<Box<dyn InputPlugin>> = Vec::with_capacity(args.inputs.len());
    for input in &args.inputs {
        if input.starts_with("http://") || input.starts_with("https://") {
            match HlsInput::new(config::hls_options(&args, input)) {
                Ok(plugin) => inputs.push(Box::new(plugin)),
                Err(e) => {
                    error!(url = %input, error = %e, "invalid HLS input");
                    exit(1);
                }
            }
        } else {
            inputs.push(Box::new(FileInput::new(input.clone())));
        }
    }

    let output = Box::new(FileOutput::new(args.output.clone()));

    let core = match Core::new(config::switch_options(&args), inputs, output) {
        Ok(core) => core,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            exit(1);
        }
    };

    if let Err(e) = core.start().await {
        error!(error = %e, "could not start the relay");
        core.stop(false);
        exit(1);
    }

    // Remote control on standard input, unless an input reads from it.
    if uses_stdin {
        info!("standard input is used as an input, remote control disabled");
    } else {
        spawn_remote_control(Arc::clone(&core));
    }

    core.wait_for_termination().await;
    info!("relay terminated");
}

/// Read remote control commands from standard input and apply them to the
/// core.
fn spawn_remote_control(core: Arc<Core>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match parse_remote_command(&line) {
                Some(RemoteCommand::Set(index)) => core.set_input(index),
                Some(RemoteCommand::Next) => core.next_input(),
                Some(RemoteCommand::Previous) => core.previous_input(),
                Some(RemoteCommand::Exit) => {
                    core.stop(true);
                    break;
                }
                None => warn!(command = %line.trim(), "unknown remote command"),
            }
        }
    });
}
