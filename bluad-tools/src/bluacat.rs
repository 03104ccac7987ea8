//! Player-style client: stream raw signed 16-bit little-endian samples
//! between standard I/O and a PCM endpoint.
//!
//! In source mode samples from stdin are played towards the remote
//! device; on end of input the stream is drained before exit. In sink
//! mode received samples are written to stdout.

use clap::Parser;
use dbus::Path;
use std::{
    fs::File,
    io::{Read, Write},
    os::fd::OwnedFd,
};

use bluad::client::Client;

#[derive(Parser)]
#[command(name = "bluacat", version, about = "bluad PCM streaming client")]
struct Opts {
    /// PCM object path; omit to use the first available endpoint.
    path: Option<String>,

    /// Open mode: `source` (play from stdin) or `sink` (capture to stdout).
    #[arg(short, long, default_value = "source")]
    mode: String,

    /// Skip the final drain in source mode.
    #[arg(long)]
    no_drain: bool,
}

fn stream_to_pcm(data: OwnedFd) -> std::io::Result<u64> {
    let mut fifo = File::from(data);
    let mut stdin = std::io::stdin().lock();
    std::io::copy(&mut stdin, &mut fifo)
}

fn stream_from_pcm(data: OwnedFd) -> std::io::Result<u64> {
    let mut fifo = File::from(data);
    let mut stdout = std::io::stdout().lock();
    let mut buf = [0u8; 4096];
    let mut total = 0;
    loop {
        let n = fifo.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        stdout.write_all(&buf[..n])?;
        total += n as u64;
    }
}

#[tokio::main]
async fn main() -> bluad::Result<()> {
    env_logger::init();
    let opts = Opts::parse();
    let client = Client::new().await?;

    let path = match &opts.path {
        Some(path) => Path::new(path.clone())
            .map_err(|p| bluad::Error { kind: bluad::ErrorKind::InvalidArguments, message: p })?,
        None => {
            let pcms = client.get_pcms().await?;
            let (path, _) = pcms.into_iter().next().ok_or(bluad::Error {
                kind: bluad::ErrorKind::NotFound,
                message: "no PCM endpoints available".into(),
            })?;
            path
        }
    };

    let props = client.properties(&path).await?;
    log::info!(
        "Opening {path} ({} ch, {} Hz, codec {:#06x})",
        props.channels,
        props.sampling,
        props.codec
    );

    let open = client.open(&path, &opts.mode).await?;
    let data = open.data;
    let ctrl = open.ctrl;

    match opts.mode.as_str() {
        "source" => {
            let copied = tokio::task::spawn_blocking(move || stream_to_pcm(data))
                .await
                .map_err(bluad::Error::from)??;
            log::info!("Played {} samples", copied / 2);
            if !opts.no_drain {
                let reply = ctrl.command("Drain")?;
                log::debug!("Drain: {reply}");
            }
        }
        "sink" => {
            let copied = tokio::task::spawn_blocking(move || stream_from_pcm(data))
                .await
                .map_err(bluad::Error::from)??;
            log::info!("Captured {} samples", copied / 2);
        }
        other => {
            return Err(bluad::Error {
                kind: bluad::ErrorKind::InvalidArguments,
                message: format!("invalid mode: {other}"),
            })
        }
    }

    Ok(())
}
