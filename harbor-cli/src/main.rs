//! Harbor — framed Unix-socket daemons.
//!
//! # Usage
//!
//! ```text
//! harbor serve --socket <path> [--socket <path> ...]
//!              [--pid-file <path>] [--watch-pid <pid>] [--log <filter>]
//! harbor send --socket <path> <message> [--no-reply] [--timeout <secs>]
//! ```

mod commands;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::{send::SendArgs, serve::ServeArgs};

#[derive(Parser, Debug)]
#[command(
    name = "harbor",
    version,
    about = "Serve and exercise framed Unix-domain socket daemons",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the echo daemon on one or more Unix sockets.
    Serve(ServeArgs),

    /// Send one framed message to a daemon socket.
    Send(SendArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => args.run(),
        Commands::Send(args) => match args.run() {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("error: {err:#}");
                ExitCode::FAILURE
            }
        },
    }
}
