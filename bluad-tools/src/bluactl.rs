//! Control surface client: list PCM endpoints, inspect and set volume,
//! monitor manager signals.

use clap::{Parser, Subcommand};
use dbus::Path;

use bluad::client::{Client, PcmEvent};
use bluad::volume::Volume;

#[derive(Parser)]
#[command(name = "bluactl", version, about = "bluad control client")]
struct Opts {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all PCM endpoints.
    List,
    /// Show the properties of one PCM endpoint.
    Info {
        /// PCM object path.
        path: String,
    },
    /// Get or set the volume of a PCM endpoint.
    Volume {
        /// PCM object path.
        path: String,
        /// New packed volume word, e.g. 0x7f7f. Omit to read.
        value: Option<String>,
    },
    /// Mute or unmute both channels of a PCM endpoint.
    Mute {
        /// PCM object path.
        path: String,
        /// `on` or `off`.
        state: String,
    },
    /// Follow PCMAdded and PCMRemoved signals.
    Monitor,
}

fn parse_word(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("invalid volume word: {s}"))
}

#[tokio::main]
async fn main() -> bluad::Result<()> {
    env_logger::init();
    let opts = Opts::parse();
    let client = Client::new().await?;

    match opts.command {
        Command::List => {
            for (path, props) in client.get_pcms().await? {
                println!(
                    "{path} [{}] {} ch, {} Hz, codec {:#06x}",
                    props.modes.join("|"),
                    props.channels,
                    props.sampling,
                    props.codec,
                );
            }
        }
        Command::Info { path } => {
            let path = Path::new(path).map_err(invalid_path)?;
            let props = client.properties(&path).await?;
            let volume = Volume::unpack(props.volume);
            println!("Device:   {}", props.device.as_deref().unwrap_or("-"));
            println!("Modes:    {}", props.modes.join(", "));
            println!("Channels: {}", props.channels);
            println!("Sampling: {} Hz", props.sampling);
            println!("Codec:    {:#06x}", props.codec);
            println!("Delay:    {}.{} ms", props.delay / 10, props.delay % 10);
            println!(
                "Volume:   {}{} / {}{}",
                props_mute(volume.ch1_muted),
                volume.ch1_volume,
                props_mute(volume.ch2_muted),
                volume.ch2_volume,
            );
            match props.battery {
                Some(level) => println!("Battery:  {level}%"),
                None => println!("Battery:  -"),
            }
        }
        Command::Volume { path, value } => {
            let path = Path::new(path).map_err(invalid_path)?;
            match value {
                Some(value) => {
                    let word = parse_word(&value).map_err(invalid_arg)?;
                    client.set_volume(&path, word).await?;
                }
                None => {
                    let volume = Volume::unpack(client.volume(&path).await?);
                    println!(
                        "{}{} / {}{}",
                        props_mute(volume.ch1_muted),
                        volume.ch1_volume,
                        props_mute(volume.ch2_muted),
                        volume.ch2_volume,
                    );
                }
            }
        }
        Command::Mute { path, state } => {
            let path = Path::new(path).map_err(invalid_path)?;
            let muted = match state.as_str() {
                "on" => true,
                "off" => false,
                other => return Err(invalid_arg(format!("invalid mute state: {other}"))),
            };
            let mut volume = Volume::unpack(client.volume(&path).await?);
            volume.ch1_muted = muted;
            volume.ch2_muted = muted;
            client.set_volume(&path, volume.pack()).await?;
        }
        Command::Monitor => {
            let mut events = client.events().await?;
            println!("Monitoring, press ctrl-c to stop");
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(PcmEvent::Added(path, props)) => {
                            println!("PCMAdded {path} [{}]", props.modes.join("|"));
                        }
                        Some(PcmEvent::Removed(path)) => println!("PCMRemoved {path}"),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    Ok(())
}

fn props_mute(muted: bool) -> &'static str {
    if muted {
        "[M]"
    } else {
        ""
    }
}

fn invalid_path(path: String) -> bluad::Error {
    invalid_arg(format!("invalid object path: {path}"))
}

fn invalid_arg(message: impl Into<String>) -> bluad::Error {
    bluad::Error { kind: bluad::ErrorKind::InvalidArguments, message: message.into() }
}
