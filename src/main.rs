//! # Mocap Server Entry Point
//!
//! Parses the command line, layers it over the TOML configuration, and runs
//! either a single session on stdin/stdout (inetd mode) or a standing server
//! that accepts clients one at a time.

// Test modules
#[cfg(test)]
mod tests;

use anyhow::Context;
use clap::Parser;
use mocap_server_lib::config::{ServerConfig, PROGRAM_NAME};
use mocap_server_lib::server::{self, ServerContext};
use std::path::PathBuf;
use std::process::ExitCode;

/// Serve motion-capture channel data read from a text file, pipe or stdin.
#[derive(Parser, Debug)]
#[command(name = PROGRAM_NAME, version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, default_value = "mocap-server.toml")]
    config_file: PathBuf,

    /// File to read records from (`-` for stdin)
    #[arg(short = 'f', long = "file")]
    data_path: Option<String>,

    /// Max line length for the input file
    #[arg(short = 'b', long)]
    buffer_size: Option<usize>,

    /// Read the next record instead of the last one
    #[arg(short = 'N', long)]
    read_next: bool,

    /// Rewind the file on every read
    #[arg(short = 'r', long)]
    rewind: bool,

    /// Reopen the file on every read
    #[arg(short = 'R', long)]
    reopen: bool,

    /// Minimum record frequency in Hz
    #[arg(short = 't', long)]
    min_rate: Option<f64>,

    /// Maximum record frequency in Hz (0 disables recording)
    #[arg(short = 'T', long)]
    max_rate: Option<f64>,

    /// Default record frequency in Hz
    #[arg(short = 'H', long)]
    default_rate: Option<f64>,

    /// Channel configuration file
    #[arg(short = 'c', long = "channels")]
    channel_config: Option<String>,

    /// Unix socket path or TCP address to listen on
    #[arg(short = 'n', long = "name")]
    server_name: Option<String>,

    /// Serve one client connected on stdin/stdout, then exit
    #[arg(short = 'i', long)]
    inetd: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// Flags only switch options on; values replace the file's.
    fn apply(self, config: &mut ServerConfig) {
        if let Some(path) = self.data_path {
            config.data_path = path;
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        config.read_next |= self.read_next;
        config.rewind |= self.rewind;
        config.reopen |= self.reopen;
        if let Some(rate) = self.min_rate {
            config.min_rate = rate;
        }
        if let Some(rate) = self.max_rate {
            config.max_rate = rate;
        }
        if let Some(rate) = self.default_rate {
            config.default_rate = rate;
        }
        if let Some(path) = self.channel_config {
            config.channel_config = path;
        }
        if let Some(name) = self.server_name {
            config.server_name = name;
        }
        config.inetd |= self.inetd;
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = ServerConfig::load_from_path(&cli.config_file);
    cli.apply(&mut config);
    config.validate().context("invalid options")?;

    let mut ctx = ServerContext::new(config).context("cannot open data source")?;

    // One client at a time: a current-thread runtime is all the loop needs
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot start runtime")?;

    rt.block_on(async {
        if ctx.config().inetd {
            let client = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
            server::serve_single(&mut ctx, client).await?;
        } else {
            server::serve_forever(&mut ctx).await?;
        }
        Ok::<(), anyhow::Error>(())
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
