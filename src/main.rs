//! ota-upload - Firmware upload client for ESP32 voice-assistant devices
//!
//! Streams a firmware image to the device's OTA listener over raw TCP.

mod config;
mod network;
mod protocol;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use network::{FirmwareUploader, NetworkConfig, UploadError, UploadEvent};
use protocol::CommandKind;

/// ota-upload - Upload firmware to a device over the air
#[derive(Parser, Debug)]
#[command(name = "ota-upload")]
#[command(author = "ota-upload Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Upload a firmware image to an ESP32 device over TCP", long_about = None)]
struct Cli {
    /// Address of the target device
    address: String,

    /// Firmware image to upload
    firmware: PathBuf,

    /// Port of the device's OTA listener
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Give up connecting after this many milliseconds
    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    /// Give up waiting for any single response after this many milliseconds
    #[arg(long)]
    read_timeout_ms: Option<u64>,

    /// Also require the device to acknowledge the end command
    #[arg(long)]
    strict_finalize: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            let code = e.downcast_ref::<UploadError>().map_or(1, UploadError::exit_code);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut net_config = NetworkConfig::from_settings(&config.network);
    if let Some(port) = cli.port {
        net_config.port = port;
    }
    if let Some(ms) = cli.connect_timeout_ms {
        net_config = net_config.with_connect_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = cli.read_timeout_ms {
        net_config = net_config.with_read_timeout(Duration::from_millis(ms));
    }

    let mut uploader = FirmwareUploader::new(net_config)
        .with_strict_finalize(cli.strict_finalize || config.upload.strict_finalize);
    let mut event_rx = uploader
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("event receiver already taken"))?;

    let address = cli.address;
    let firmware = cli.firmware;
    let upload = tokio::spawn(async move { uploader.run(&address, &firmware).await });

    // The channel closes when the upload task drops the uploader.
    while let Some(event) = event_rx.recv().await {
        print_progress(&event);
    }

    upload.await??;
    Ok(())
}

fn print_progress(event: &UploadEvent) {
    match event {
        UploadEvent::Connecting { addr } => println!("connecting to {}...", addr),
        UploadEvent::Connected { addr } => println!("connected to {}", addr),
        UploadEvent::SendingCommand { command } => {
            let label = match command {
                CommandKind::Start => "start OTA",
                CommandKind::End => "end OTA",
                CommandKind::Reboot => "reboot",
                CommandKind::Frame => "frame",
            };
            println!("sending '{}' command to target...", label);
        }
        UploadEvent::SendingFrame { number, total, len } => {
            println!("sending fragment {} of {} ({} bytes)", number, total, len)
        }
        UploadEvent::Finished { report } => println!(
            "update complete: {} fragments, {} bytes",
            report.frames_sent, report.bytes_sent
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["ota-upload", "192.168.1.50", "firmware.bin"]).unwrap();
        assert_eq!(cli.address, "192.168.1.50");
        assert_eq!(cli.firmware, PathBuf::from("firmware.bin"));
        assert!(cli.port.is_none());
        assert!(!cli.strict_finalize);
    }

    #[test]
    fn test_missing_arguments_is_usage_error() {
        let err = Cli::try_parse_from(["ota-upload"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
        assert_eq!(err.exit_code(), 2);

        let err = Cli::try_parse_from(["ota-upload", "192.168.1.50"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::try_parse_from([
            "ota-upload",
            "--port",
            "8266",
            "--read-timeout-ms",
            "3000",
            "--strict-finalize",
            "device.local",
            "fw.bin",
        ])
        .unwrap();
        assert_eq!(cli.port, Some(8266));
        assert_eq!(cli.read_timeout_ms, Some(3000));
        assert!(cli.strict_finalize);
    }
}
