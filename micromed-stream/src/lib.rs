//! # Micromed Stream
//!
//! Live streaming of Micromed EEG recordings over TCP.
//!
//! This crate adds the async side on top of [`micromed_core`]:
//! - [`emulator::Emulator`] replays a TRC file as if an acquisition system
//!   were sending it, paced at the recording's sampling rate
//! - [`receiver::StreamReceiver`] turns a byte stream back into frames
//! - [`pipeline`] cuts received (or file) samples into overlapping epochs
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   TCP    ┌────────────────┐  mpsc  ┌───────────────┐
//! │  Emulator    │ ───────▶ │ StreamReceiver │ ─────▶ │ EpochAssembler│──▶ EpochSink
//! │ (TrcReader)  │  frames  │ (FrameBuffer + │ frames │ (EpochBuffer) │   epochs
//! └──────────────┘          │  Validator)    │        └───────────────┘
//!                           └────────────────┘
//! ```
//!
//! The emulator connects as a client; the receiver side listens, the same
//! way the acquisition software pushes to an analysis host.
//!
//! ## Example: receiving one session
//!
//! ```rust,no_run
//! use micromed_core::EpochConfig;
//! use micromed_stream::pipeline::{epoch_frames, ChannelSink};
//! use micromed_stream::receiver::StreamReceiver;
//! use tokio::net::TcpListener;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:5123").await.unwrap();
//!     let (socket, _) = listener.accept().await.unwrap();
//!
//!     let (tx_frames, rx_frames) = mpsc::channel(64);
//!     let token = CancellationToken::new();
//!     tokio::spawn(StreamReceiver::new(socket).forward(tx_frames, token));
//!
//!     let (tx_epochs, mut rx_epochs) = mpsc::channel(16);
//!     tokio::spawn(async move {
//!         let mut sink = ChannelSink::new(tx_epochs);
//!         epoch_frames(rx_frames, EpochConfig::default(), &mut sink).await
//!     });
//!     while let Some(epoch) = rx_epochs.recv().await {
//!         println!("epoch at sample {}", epoch.start);
//!     }
//! }
//! ```
//!
//! ## Command-Line Interface
//!
//! See [`Cli`]. Subcommands:
//!
//! - `info FILE` - print header, channels and events of a TRC file
//! - `emulate FILE` - replay a file to a listening receiver
//! - `listen` - accept one session and log the epochs it produces
//! - `epoch FILE` - epoch a file offline

use clap::{Args, Parser, Subcommand};
use micromed_core::SampleUnits;
use serde::Serialize;
use std::net::IpAddr;
use std::path::PathBuf;

pub mod config;
pub mod emulator;
pub mod error;
pub mod pipeline;
pub mod receiver;

pub use error::StreamError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Clone, Debug)]
#[command(name = "micromed-stream", version, about = "Micromed EEG stream tools")]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// JSON configuration file, defaults to config.json in the user config directory
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Print the header, channels, markers and notes of a TRC file
    Info {
        file: PathBuf,

        /// Print as JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Replay a TRC file to a listening receiver
    Emulate {
        file: PathBuf,

        #[clap(flatten)]
        net: NetArgs,

        /// Packet duration in milliseconds
        #[arg(long)]
        packet_ms: Option<u64>,

        /// Playback speed multiplier
        #[arg(short, long)]
        speed: Option<f64>,

        /// Send as fast as possible instead of in real time
        #[arg(long, default_value_t = false)]
        unthrottled: bool,
    },

    /// Accept one streaming session and log the epochs it produces
    Listen {
        #[clap(flatten)]
        net: NetArgs,

        #[clap(flatten)]
        epoch: EpochArgs,
    },

    /// Cut a TRC file into epochs offline
    Epoch {
        file: PathBuf,

        #[clap(flatten)]
        epoch: EpochArgs,

        /// Print one JSON summary line per epoch
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Args, Clone, Debug, Default)]
pub struct NetArgs {
    /// Receiver address
    #[arg(short, long)]
    pub address: Option<IpAddr>,

    /// Receiver TCP port
    #[arg(short, long)]
    pub port: Option<u16>,
}

#[derive(Args, Clone, Debug, Default)]
pub struct EpochArgs {
    /// Epoch duration in seconds
    #[arg(long = "epoch")]
    pub epoch_duration: Option<f64>,

    /// Overlap between consecutive epochs in seconds
    #[arg(long)]
    pub overlap: Option<f64>,

    /// Keep only this channel, named `positive-negative` as in `info` (repeatable)
    #[arg(long = "pick")]
    pub picks: Vec<String>,

    /// Units of epoch values
    #[arg(long, value_enum)]
    pub units: Option<OutputUnits>,
}

#[derive(clap::ValueEnum, Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputUnits {
    Raw,
    #[default]
    Physical,
    Volts,
}

impl From<OutputUnits> for SampleUnits {
    fn from(units: OutputUnits) -> Self {
        match units {
            OutputUnits::Raw => SampleUnits::Raw,
            OutputUnits::Physical => SampleUnits::Physical,
            OutputUnits::Volts => SampleUnits::Volts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::parse_from([
            "micromed-stream",
            "-vv",
            "emulate",
            "rec.TRC",
            "--port",
            "6000",
            "--speed",
            "4",
        ]);
        match cli.command {
            Command::Emulate { file, net, speed, unthrottled, .. } => {
                assert_eq!(file, PathBuf::from("rec.TRC"));
                assert_eq!(net.port, Some(6000));
                assert_eq!(net.address, None);
                assert_eq!(speed, Some(4.0));
                assert!(!unthrottled);
            }
            other => panic!("unexpected {other:?}"),
        }

        let cli = Cli::parse_from([
            "micromed-stream",
            "listen",
            "--epoch",
            "2",
            "--pick",
            "Fp1-G2",
            "--pick",
            "Fp2-G2",
            "--units",
            "volts",
        ]);
        let Command::Listen { epoch, .. } = cli.command else {
            panic!("expected listen");
        };
        assert_eq!(epoch.epoch_duration, Some(2.0));
        assert_eq!(epoch.picks, ["Fp1-G2", "Fp2-G2"]);
        assert_eq!(epoch.units, Some(OutputUnits::Volts));
    }
}
