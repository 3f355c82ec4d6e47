use clap::Parser;
use log::{info, warn};
use miette::{IntoDiagnostic, Result};
use micromed_core::{Recording, TrcReader};
use micromed_stream::config::Config;
use micromed_stream::emulator::Emulator;
use micromed_stream::pipeline::{epoch_recording, epoch_session, LogSink};
use micromed_stream::{Cli, Command, StreamError};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};

const RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    let mut config = Config::load(args.config.as_deref()).into_diagnostic()?;

    match args.command {
        Command::Info { file, json } => print_info(&file, json),
        Command::Epoch { file, epoch, json } => {
            config.apply_epoch(&epoch);
            print_epochs(&file, &config, json)
        }
        Command::Emulate {
            file,
            net,
            packet_ms,
            speed,
            unthrottled,
        } => {
            config.apply_net(&net);
            if let Some(packet_ms) = packet_ms {
                config.packet_ms = packet_ms;
            }
            if let Some(speed) = speed {
                config.speed = speed;
            }
            let recording = load(&file).into_diagnostic()?;
            let emulator = Emulator::new(recording, config.emulator(!unthrottled)).into_diagnostic()?;
            let address = config.socket_addr();
            run_subsystem("Emulator", move |subsys| emulate(subsys, emulator, address)).await
        }
        Command::Listen { net, epoch } => {
            config.apply_net(&net);
            config.apply_epoch(&epoch);
            run_subsystem("Listener", move |subsys| listen(subsys, config)).await
        }
    }
}

async fn run_subsystem<F, Fut>(name: &'static str, run: F) -> Result<()>
where
    F: FnOnce(SubsystemHandle) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), StreamError>> + Send + 'static,
{
    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new(name, run));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .into_diagnostic()
}

fn load(file: &Path) -> Result<Recording, StreamError> {
    let recording = TrcReader::open(file)?.into_recording()?;
    info!(
        "Loaded {}: {} channels, {} samples at {} Hz ({:.1} s), {} markers, {} notes",
        file.display(),
        recording.header.channel_count(),
        recording.sample_count(),
        recording.header.sampling_rate,
        recording.duration(),
        recording.markers.len(),
        recording.notes.len()
    );
    Ok(recording)
}

/// Connect to the receiver, retrying every second, then replay once
async fn emulate(
    subsys: SubsystemHandle,
    emulator: Emulator,
    address: SocketAddr,
) -> Result<(), StreamError> {
    let token = subsys.create_cancellation_token();
    let socket = loop {
        tokio::select! {
            _ = subsys.on_shutdown_requested() => return Ok(()),
            r = TcpStream::connect(address) => match r {
                Ok(socket) => break socket,
                Err(e) => {
                    warn!("Cannot connect to {}: {}, retrying", address, e);
                    tokio::select! {
                        _ = subsys.on_shutdown_requested() => return Ok(()),
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    }
                }
            },
        }
    };
    socket.set_nodelay(true)?;
    info!("Connected to {}", address);

    let report = emulator.run(socket, token).await?;
    info!(
        "Sent {} frames, {} samples{}",
        report.frames,
        report.samples,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    subsys.request_shutdown();
    Ok(())
}

/// Accept one session and log its epochs
async fn listen(subsys: SubsystemHandle, config: Config) -> Result<(), StreamError> {
    let address = config.socket_addr();
    let listener = TcpListener::bind(address).await?;
    info!("Waiting for a stream on {}", address);

    let (socket, peer) = tokio::select! {
        _ = subsys.on_shutdown_requested() => return Ok(()),
        r = listener.accept() => r?,
    };
    info!("Session from {}", peer);

    let token = subsys.create_cancellation_token();
    let mut sink = LogSink::default();
    let report = epoch_session(socket, config.epoch, config.channel_capacity, &mut sink, token).await?;
    info!(
        "Session ended: {} frames, {} epochs, {} trailing samples discarded",
        report.frames, report.epochs, report.discarded_tail
    );
    subsys.request_shutdown();
    Ok(())
}

fn print_info(file: &Path, json: bool) -> Result<()> {
    let reader = TrcReader::open(file).into_diagnostic()?;
    let header = reader.header();

    if json {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Info<'a> {
            header: &'a micromed_core::RecordingHeader,
            sample_count: u64,
            markers: &'a [micromed_core::Marker],
            notes: &'a [micromed_core::Note],
        }
        let info = Info {
            header,
            sample_count: reader.sample_count(),
            markers: reader.markers(),
            notes: reader.notes(),
        };
        println!("{}", serde_json::to_string_pretty(&info).into_diagnostic()?);
        return Ok(());
    }

    println!("File:            {}", file.display());
    println!("Title:           {}", header.title);
    println!("Laboratory:      {}", header.laboratory);
    println!("Patient:         {}, {}", header.surname, header.first_name);
    println!(
        "Born:            {}",
        header
            .birth_date
            .map_or_else(|| "unknown".to_string(), |d| d.to_string())
    );
    println!("Recorded:        {}", header.recording_start);
    println!(
        "Acquisition:     {}",
        header
            .acquisition_unit()
            .map_or("unknown", |unit| unit.description())
    );
    println!("Sampling rate:   {} Hz", header.sampling_rate);
    println!("Sample width:    {}", header.sample_width);
    println!(
        "Samples:         {} ({:.1} s)",
        reader.sample_count(),
        reader.sample_count() as f64 / header.sampling_rate
    );
    println!("Channels:        {}", header.channel_count());
    for (i, ch) in header.channels.iter().enumerate() {
        println!(
            "  {:>3} {:<14} {:>6}..{:<6} -> {}..{} {}",
            i,
            ch.name(),
            ch.logic_min,
            ch.logic_max,
            ch.physical_min,
            ch.physical_max,
            ch.unit
        );
    }
    println!("Markers:         {}", reader.markers().len());
    for m in reader.markers() {
        println!("  sample {:>9}  code {}", m.sample, m.code);
    }
    println!("Notes:           {}", reader.notes().len());
    for n in reader.notes() {
        println!("  sample {:>9}  {}", n.sample, n.text);
    }
    Ok(())
}

fn print_epochs(file: &Path, config: &Config, json: bool) -> Result<()> {
    let recording = load(file).into_diagnostic()?;
    let epochs = epoch_recording(&recording, config.epoch.clone()).into_diagnostic()?;

    for epoch in &epochs {
        if json {
            #[derive(Serialize)]
            struct Summary<'a> {
                start: u64,
                channels: &'a [String],
                samples: usize,
                markers: &'a [micromed_core::Marker],
                notes: &'a [micromed_core::Note],
            }
            let summary = Summary {
                start: epoch.start,
                channels: &epoch.channels,
                samples: epoch.len(),
                markers: &epoch.markers,
                notes: &epoch.notes,
            };
            println!("{}", serde_json::to_string(&summary).into_diagnostic()?);
        } else {
            println!(
                "{:>9}  {:>6} samples  {} markers  {} notes",
                epoch.start,
                epoch.len(),
                epoch.markers.len(),
                epoch.notes.len()
            );
        }
    }
    info!("{} epochs", epochs.len());
    Ok(())
}
