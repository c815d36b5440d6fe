//! High-level flashing pipeline
//!
//! [Flasher] drives the gateway through the full batch sequence: release any
//! previous selection, then for each device patch the image, route USB to the
//! device, walk it into its bootloader, stream the image under flow control,
//! and confirm completion. One device failing leaves the rest of the batch
//! running.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use log::{debug, error, info};
use tokio::{sync::oneshot, time};

use crate::{
    connection::{
        command::{Command, FLASH_CHUNK_SIZE},
        Connection,
    },
    error::Error,
    mailbox::Claim,
    status::{DeviceStage, DeviceStatus, Expected},
    uf2::Uf2Image,
};

/// Number of device slots on a fully populated gateway
pub const USB_DEVICES: u8 = 64;

/// Chunks the gateway will queue before write acks must catch up; matches the
/// depth of the gateway's own buffer queue.
const WRITE_WINDOW: usize = 16;

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(200);
const STDOUT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const SELECT_TIMEOUT: Duration = Duration::from_secs(60);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(60);
const FLASH_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Bootloader entry happens over the target's CDC interface and either works
/// right away or not at all, hence the short default.
pub const DEFAULT_CDC_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_MSC_TIMEOUT: Duration = Duration::from_secs(60);

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, device: u8, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

/// Drives the per-device flashing sequence over an open [Connection]
pub struct Flasher {
    connection: Connection,
    cdc_timeout: Duration,
    msc_timeout: Duration,
    /// Most recent status snapshot, one byte per device slot
    last_status: Vec<DeviceStatus>,
}

impl Flasher {
    pub fn new(connection: Connection) -> Self {
        Flasher {
            connection,
            cdc_timeout: DEFAULT_CDC_TIMEOUT,
            msc_timeout: DEFAULT_MSC_TIMEOUT,
            last_status: Vec::new(),
        }
    }

    pub fn with_timeouts(mut self, cdc_timeout: Duration, msc_timeout: Duration) -> Self {
        self.cdc_timeout = cdc_timeout;
        self.msc_timeout = msc_timeout;
        self
    }

    /// Flashes the image to each device in turn, then parks the multiplexer
    ///
    /// A device that times out or faults is reported and skipped; only the
    /// loss of the connection itself aborts the whole batch.
    pub async fn run(
        &mut self,
        image: &mut Uf2Image,
        devices: impl IntoIterator<Item = u8>,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        self.reset_all().await?;

        for device in devices {
            if let Err(err) = self.flash_device(device, image, progress).await {
                error!("unable to flash device at USB port {device}: {err}");
                if matches!(err, Error::Connection(_)) {
                    return Err(err);
                }
            }
        }

        self.park().await
    }

    /// Patches the image for one device and runs its full flashing sequence
    pub async fn flash_device(
        &mut self,
        device: u8,
        image: &mut Uf2Image,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        image.patch_for(device);
        self.select(device).await?;

        info!("flashing {} bytes to device {device}", image.len());
        self.start_session().await?;
        self.stream(device, image, progress).await?;
        self.end_session(device).await
    }

    /// Releases any selected device and waits for the status to clear
    pub async fn reset_all(&mut self) -> Result<(), Error> {
        self.connection
            .command(Command::SelectDevice { device: -1 })
            .await?;
        self.wait_for_status(0, Expected::Settled, SETTLE_TIMEOUT, "USB status to clear")
            .await
    }

    /// Routes the multiplexer past the last slot, leaving no device selected
    pub async fn park(&mut self) -> Result<(), Error> {
        info!("select device {USB_DEVICES}");
        self.connection
            .command(Command::SelectDevice {
                device: USB_DEVICES as i8,
            })
            .await?;
        Ok(())
    }

    /// Asks the gateway itself to reboot
    pub async fn reboot_gateway(&mut self) -> Result<(), Error> {
        info!("sending soft-reboot command");
        self.connection.command(Command::RebootSoft).await?;
        Ok(())
    }

    /// Selects a device and follows it into its bootloader
    ///
    /// The gateway performs the actual mode switch on its own once the device
    /// is selected; we only watch the status walk through the stages.
    async fn select(&mut self, device: u8) -> Result<(), Error> {
        info!("select device {device}");
        self.connection
            .command(Command::SelectDevice {
                device: device as i8,
            })
            .await?;

        self.wait_for_status(
            device,
            Expected::Stage(DeviceStage::Selected),
            SELECT_TIMEOUT,
            "device selection",
        )
        .await?;
        self.wait_for_status(
            device,
            Expected::Stage(DeviceStage::BootselRequest),
            self.cdc_timeout,
            "BOOTSEL request",
        )
        .await?;
        self.wait_for_status(
            device,
            Expected::Stage(DeviceStage::BootselComplete),
            self.cdc_timeout,
            "BOOTSEL mode",
        )
        .await?;
        self.wait_for_status(
            device,
            Expected::Stage(DeviceStage::FlashRequest),
            self.msc_timeout,
            "flash request",
        )
        .await
    }

    /// Opens a flashing session on the currently selected device
    async fn start_session(&mut self) -> Result<(), Error> {
        let ack = self.connection.flash_start().claim();
        self.connection.command(Command::StartFlash).await?;
        ack.wait().await?;
        Ok(())
    }

    /// Streams the image in flow-controlled chunks
    ///
    /// Two limits hold at all times: no more than [WRITE_WINDOW] chunks are
    /// queued but unwritten on the gateway, and no more than one chunk is in
    /// flight before its receive ack. Each loop turn first waits for the
    /// oldest window slot to be written out, reserves the slot for the chunk
    /// about to go, then sends it and waits for it to reach the queue.
    async fn stream(
        &mut self,
        device: u8,
        image: &Uf2Image,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        self.connection.flash_part_received().clear_stale();
        self.connection.flash_part_written().clear_stale();

        // All window slots start out available.
        let mut window: VecDeque<Claim<()>> =
            (0..WRITE_WINDOW).map(|_| Claim::Ready(())).collect();

        let chunks = image.bytes().chunks(FLASH_CHUNK_SIZE);
        let total = chunks.len();
        if let Some(cb) = progress.as_mut() {
            cb.init(device, total)
        }

        let mut last_send = Instant::now();
        for (index, chunk) in chunks.enumerate() {
            if let Some(slot) = window.pop_front() {
                slot.wait().await?;
            }
            window.push_back(self.connection.flash_part_written().claim());

            let offset = index * FLASH_CHUNK_SIZE;
            debug!(
                "(waited {}ms) sending bytes[{}..{}]",
                last_send.elapsed().as_millis(),
                offset,
                offset + chunk.len(),
            );
            last_send = Instant::now();

            let received = self.connection.flash_part_received().claim();
            self.connection
                .command(Command::WriteFlashPart { data: chunk })
                .await?;
            received.wait().await?;

            if let Some(cb) = progress.as_mut() {
                cb.update(index + 1)
            }
        }

        // Wait until every queued chunk has been written out.
        while let Some(slot) = window.pop_front() {
            slot.wait().await?;
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish()
        }
        Ok(())
    }

    /// Closes the session and waits for the device to finish its own flash
    async fn end_session(&mut self, device: u8) -> Result<(), Error> {
        let ack = self.connection.flash_end().claim();
        self.connection.command(Command::EndFlash).await?;
        ack.wait().await?;

        self.wait_for_status(
            device,
            Expected::Stage(DeviceStage::FlashComplete),
            FLASH_TIMEOUT,
            "flash completion",
        )
        .await
    }

    /// Polls status snapshots until the device meets the expectation
    ///
    /// The cached snapshot is consulted first so a wait that is already
    /// satisfied costs nothing; faults in the cached byte are forgiven since
    /// they may be left over from a previous attempt. Fresh snapshots are
    /// strict: an error status fails the wait immediately.
    async fn wait_for_status(
        &mut self,
        device: u8,
        expected: Expected,
        timeout: Duration,
        waiting_for: &'static str,
    ) -> Result<(), Error> {
        debug!("USB {device}: waiting for status {expected}");
        let slot = usize::from(device);

        let mut last_seen = None;
        if let Some(&status) = self.last_status.get(slot) {
            info!("USB {device}: {status}");
            last_seen = Some(status);
            if !status.is_error() && status.satisfies(expected) {
                return Ok(());
            }
        }

        self.connection.status().clear_stale();
        let polling = async {
            loop {
                let claim = self.connection.status().claim();
                if !claim.is_ready() {
                    self.connection.command(Command::RequestStatus).await?;
                }
                self.last_status = claim.wait().await?;

                // A short snapshot cannot satisfy anything; keep polling.
                let Some(&status) = self.last_status.get(slot) else {
                    time::sleep(STATUS_POLL_INTERVAL).await;
                    continue;
                };

                if last_seen != Some(status) {
                    info!("USB {device}: {status}");
                    last_seen = Some(status);
                }
                if status.is_error() {
                    return Err(Error::DeviceFault {
                        device,
                        status,
                        waiting_for,
                    });
                }
                if status.satisfies(expected) {
                    return Ok(());
                }
                time::sleep(STATUS_POLL_INTERVAL).await;
            }
        };

        match time::timeout(timeout, polling).await {
            Ok(result) => result,
            Err(_) => Err(Error::StatusTimeout {
                device,
                waiting_for,
            }),
        }
    }
}

/// Relays the gateway's own stdout to ours, line by line
///
/// Runs until the connection goes away. Whenever the backlog is drained the
/// task signals `flushed` (once) and backs off; the flashing sequence starts
/// only after that first signal so old console output cannot interleave with
/// a fresh run.
pub async fn relay_stdout(connection: Connection, flushed: oneshot::Sender<()>) {
    let mut flushed = Some(flushed);
    let mut text = Vec::new();
    loop {
        let claim = connection.stdout().claim();
        if !claim.is_ready() && connection.command(Command::RequestStdout).await.is_err() {
            break;
        }
        let chunk = match claim.wait().await {
            Ok(chunk) => chunk,
            Err(_) => break,
        };
        text.extend_from_slice(&chunk);
        for line in drain_lines(&mut text) {
            println!("remote: {line}");
        }

        if text.is_empty() {
            if let Some(signal) = flushed.take() {
                let _ = signal.send(());
            }
            time::sleep(STDOUT_POLL_INTERVAL).await;
        }
    }
}

/// Splits off every complete line, leaving the trailing partial one buffered
///
/// A UTF-8 symbol may span two stdout chunks, so decoding happens per
/// complete line rather than per chunk.
fn drain_lines(text: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(newline) = text.iter().position(|&byte| byte == b'\n') {
        let line: Vec<u8> = text.drain(..=newline).collect();
        lines.push(String::from_utf8_lossy(&line[..newline]).into_owned());
    }
    lines
}
