//! Command-line interface for driving a UF2 Batch Flasher gateway
//!
//! The heavy lifting lives in the library; this module turns parsed
//! arguments and the configuration file into a connected [Flasher] run.

use std::{fs, path::PathBuf};

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use miette::{IntoDiagnostic, Result, WrapErr};
use tokio::sync::oneshot;

use crate::{
    cli::config::Config,
    connection::Connection,
    flasher::{relay_stdout, Flasher, ProgressCallbacks, USB_DEVICES},
    uf2::Uf2Image,
};

pub mod config;

const DEFAULT_HOST: &str = "192.168.1.52";
const DEFAULT_PORT: u16 = 5656;

/// Flash a UF2 image to every selected device behind the gateway
#[derive(Debug, Args)]
pub struct FlashArgs {
    /// Path to the UF2 file to flash
    pub uf2_file: PathBuf,

    #[clap(flatten)]
    pub devices: DeviceArgs,

    #[clap(flatten)]
    pub connection: ConnectArgs,

    /// Reboot the gateway once the operations are done
    #[clap(long)]
    pub reboot: bool,
}

/// Selection of the devices to flash
#[derive(Debug, Args)]
pub struct DeviceArgs {
    /// Flash a single device
    #[clap(long, value_name = "DEVICE", value_parser = clap::value_parser!(u8).range(..64))]
    pub single: Option<u8>,

    /// First device of the range to flash
    #[clap(long, value_name = "DEVICE", value_parser = clap::value_parser!(u8).range(..64))]
    pub start_with: Option<u8>,

    /// Last device of the range to flash
    #[clap(long, value_name = "DEVICE", value_parser = clap::value_parser!(u8).range(..64))]
    pub end_with: Option<u8>,
}

impl DeviceArgs {
    /// The devices to flash, in order
    ///
    /// `--single` overrides any range; otherwise missing bounds stretch to
    /// the edges of the rack. Device 0 is as selectable as any other.
    pub fn devices(&self) -> Vec<u8> {
        if let Some(single) = self.single {
            return vec![single];
        }
        let first = self.start_with.unwrap_or(0);
        let last = self.end_with.unwrap_or(USB_DEVICES - 1);
        (first..=last).collect()
    }
}

/// Where to reach the gateway
#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Host of the UF2 Batch Flasher
    #[clap(long)]
    pub host: Option<String>,

    /// Port of the UF2 Batch Flasher
    #[clap(long)]
    pub port: Option<u16>,
}

/// Opens the gateway connection; flags beat the config file, which beats the
/// built-in defaults
pub async fn connect(args: &ConnectArgs, config: &Config) -> Result<Connection> {
    let host = args
        .host
        .as_deref()
        .or(config.gateway.host.as_deref())
        .unwrap_or(DEFAULT_HOST);
    let port = args.port.or(config.gateway.port).unwrap_or(DEFAULT_PORT);

    info!("connecting to the UF2 Batch Flasher at {host}:{port}");
    Ok(Connection::open(host, port).await?)
}

/// Runs the whole batch: connect, drain the gateway's console backlog, then
/// flash every selected device and park the multiplexer
pub async fn flash_batch(args: FlashArgs, config: &Config) -> Result<()> {
    let connection = connect(&args.connection, config).await?;

    // Old console output must not interleave with this run's, so flashing
    // holds off until the relay has drained the gateway's backlog once.
    let (flushed, first_drain) = oneshot::channel();
    let relay = tokio::spawn(relay_stdout(connection.clone(), flushed));
    first_drain.await.ok();

    let contents = fs::read(&args.uf2_file)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read the UF2 image {}", args.uf2_file.display()))?;
    let mut image = Uf2Image::new(contents);

    let mut flasher = Flasher::new(connection.clone());
    let mut reporter = FlashProgress::default();
    let mut progress: Option<&mut dyn ProgressCallbacks> = Some(&mut reporter);
    flasher
        .run(&mut image, args.devices.devices(), &mut progress)
        .await?;

    if args.reboot {
        flasher.reboot_gateway().await?;
    }

    info!("closing the connection");
    relay.abort();
    connection.shutdown().await?;
    Ok(())
}

/// Progress reporting for the transfer to one device
#[derive(Default)]
pub struct FlashProgress {
    bar: Option<ProgressBar>,
}

impl ProgressCallbacks for FlashProgress {
    fn init(&mut self, device: u8, total: usize) {
        if let Some(stale) = self.bar.take() {
            stale.abandon();
        }

        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.set_message(format!("device {device}"));
        self.bar = Some(bar);
    }

    fn update(&mut self, current: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}
