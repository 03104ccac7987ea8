//! The bluad daemon.

use clap::Parser;
use std::path::PathBuf;

use bluad::{config::Config, Session};

#[derive(Parser)]
#[command(name = "bluad", version, about = "Bluetooth audio bridge daemon")]
struct Opts {
    /// Configuration file (YAML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serve only the listed adapters, e.g. `hci0`. May be repeated.
    #[arg(short = 'i', long = "device")]
    devices: Vec<String>,

    /// Enable the A2DP sink profile.
    #[arg(long)]
    a2dp_sink: bool,

    /// Keep the A2DP source link open for this many seconds after the
    /// client disconnects.
    #[arg(long)]
    keep_alive: Option<u32>,

    /// Forward volume control to the remote device instead of scaling
    /// samples locally.
    #[arg(long)]
    volume_passthrough: bool,

    /// Increase log verbosity. May be repeated.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> bluad::Result<()> {
    let opts = Opts::parse();

    let level = match opts.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = match &opts.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            Config::from_yaml(&text)?
        }
        None => Config::default(),
    };
    config.hci_filter.extend(opts.devices.iter().cloned());
    if opts.a2dp_sink {
        config.enable.a2dp_sink = true;
    }
    if let Some(keep_alive) = opts.keep_alive {
        config.a2dp.keep_alive = keep_alive;
    }
    if opts.volume_passthrough {
        config.a2dp.volume = true;
    }

    let session = Session::new(config).await?;
    log::info!("bluad up, serving {}", bluad::SERVICE_NAME);

    tokio::select! {
        result = session.serve() => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("terminated by signal");
            Ok(())
        }
    }
}
