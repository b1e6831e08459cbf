// CLI entry point for Chorus.
//
// Two roles in one binary:
//
//   chorus server [--control-port N] [--data-port N] [--config FILE]
//       Listen for endpoints and read operator commands from stdin
//       (`list`, `play <file>`, `stop`, `vol <user|all> <0-100>`, `exit`).
//
//   chorus client <HOST> [--name NAME] [--control-port N] [--data-port N]
//                 [--device NAME] [--buffer-ms N] [--output FILE|-]
//                 [--volume-command TEMPLATE] [--unmute-command CMD]
//                 [--exit-on-close] [--config FILE]
//       Connect to a server and play what it broadcasts on the sound device.
//       `--output` writes the raw PCM (S16_LE stereo) to a file or stdout
//       instead, e.g. `chorus client host --output - | aplay -f S16_LE -c 2 -r 44100`.
//
//   chorus devices
//       List the output devices `--device` accepts.
//
// Logs go to stderr so stdout stays clean for PCM. `--log` takes an
// `EnvFilter` directive and overrides `RUST_LOG`; the default is `info`.
// Command-line flags override values from the `--config` JSON file.

use std::io;
use std::path::{Path, PathBuf};
use std::process;

use chorus_broadcast::audio::{
    AudioSink, CommandMixer, DeviceSink, MediaLoader, Mixer, NullMixer, PipeSink,
};
use chorus_broadcast::console::run_console;
use chorus_broadcast::{Client, ClientConfig, Result, Server, ServerConfig};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chorus", version, about = "Synchronized audio broadcast to many endpoints")]
struct Cli {
    /// Log filter, e.g. `debug` or `chorus_broadcast=trace` (overrides RUST_LOG).
    #[arg(long, global = true, value_name = "FILTER")]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept endpoints and broadcast audio files (MP3, WAV, FLAC, Ogg
    /// Vorbis), driven by commands on stdin.
    Server {
        #[arg(long)]
        control_port: Option<u16>,

        #[arg(long)]
        data_port: Option<u16>,

        /// JSON file with server settings.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Connect to a server and play what it broadcasts.
    Client {
        /// Server host name or address.
        host: String,

        /// Name to announce (default: the OS user name).
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        control_port: Option<u16>,

        #[arg(long)]
        data_port: Option<u16>,

        /// Output device name (see `chorus devices`); default device if unset.
        #[arg(long, value_name = "NAME")]
        device: Option<String>,

        /// Milliseconds of audio queued ahead of the device.
        #[arg(long, value_name = "MS")]
        buffer_ms: Option<u64>,

        /// Write raw PCM to a file instead of the sound device; `-` is stdout.
        #[arg(long, value_name = "FILE")]
        output: Option<String>,

        /// Shell command that sets the OS volume; `{volume}` is replaced by
        /// the percentage.
        #[arg(long, value_name = "TEMPLATE")]
        volume_command: Option<String>,

        /// Shell command that unmutes the output before a volume change.
        #[arg(long, value_name = "CMD")]
        unmute_command: Option<String>,

        /// Exit instead of reconnecting when the server closes the connection.
        #[arg(long)]
        exit_on_close: bool,

        /// JSON file with client settings.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// List audio output devices.
    Devices,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Server {
            control_port,
            data_port,
            config,
        } => {
            let mut config = match config {
                Some(path) => ServerConfig::load(&path)?,
                None => ServerConfig::default(),
            };
            if let Some(port) = control_port {
                config.control_port = port;
            }
            if let Some(port) = data_port {
                config.data_port = port;
            }

            let server = Server::start(config, Box::new(MediaLoader))?;
            run_console(&server, io::stdin().lock(), io::stdout())?;
            info!("Shutting down");
            Ok(())
        }
        Command::Client {
            host,
            name,
            control_port,
            data_port,
            device,
            buffer_ms,
            output,
            volume_command,
            unmute_command,
            exit_on_close,
            config,
        } => {
            let mut config = match config {
                Some(path) => ClientConfig::load(&path)?,
                None => ClientConfig::default(),
            };
            config.server = host;
            if name.is_some() {
                config.name = name;
            }
            if let Some(port) = control_port {
                config.control_port = port;
            }
            if let Some(port) = data_port {
                config.data_port = port;
            }
            if volume_command.is_some() {
                config.volume_command = volume_command;
            }
            if unmute_command.is_some() {
                config.unmute_command = unmute_command;
            }
            if device.is_some() {
                config.output_device = device;
            }
            if let Some(ms) = buffer_ms {
                config.output_buffer_ms = ms;
            }
            config.exit_on_remote_close |= exit_on_close;

            let sink: Box<dyn AudioSink> = match output.as_deref() {
                None => Box::new(
                    DeviceSink::new(config.output_device.clone())
                        .with_buffer(config.output_buffer()),
                ),
                Some("-") => Box::new(PipeSink::stdout()),
                Some(path) => Box::new(PipeSink::create(Path::new(path))?),
            };
            let mixer: Box<dyn Mixer> = match CommandMixer::from_config(&config) {
                Some(mixer) => Box::new(mixer),
                None => Box::new(NullMixer),
            };

            let mut client = Client::new(config, sink, mixer)?;
            client.run();
            Ok(())
        }
        Command::Devices => {
            for name in DeviceSink::list_devices()? {
                println!("{name}");
            }
            Ok(())
        }
    }
}
