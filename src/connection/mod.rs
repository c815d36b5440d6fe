//! Connection to the gateway
//!
//! The [Connection] struct owns the TCP stream to the gateway, serializes
//! command writes, and runs a background reader task that decodes incoming
//! messages and routes each one into the mailbox for its type. Protocol
//! logic never touches the socket; it sends [Command]s and claims results
//! from the mailboxes.

use std::sync::Arc;

use log::{debug, error, trace, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::Mutex,
    task::JoinHandle,
};

use self::{command::Command, event::Event};
use crate::{error::ConnectionError, mailbox::Mailbox, status::DeviceStatus};

pub mod command;
pub mod event;

const READ_BUFFER_SIZE: usize = 2048;

/// One mailbox per gateway message type
#[derive(Debug, Clone, Default)]
struct Mailboxes {
    status: Mailbox<Vec<DeviceStatus>>,
    stdout: Mailbox<Vec<u8>>,
    flash_start: Mailbox<()>,
    flash_part_received: Mailbox<()>,
    flash_part_written: Mailbox<()>,
    flash_end: Mailbox<()>,
}

impl Mailboxes {
    /// Fails every pending and future claim once the stream is unusable
    fn close_all(&self) {
        self.status.close();
        self.stdout.close();
        self.flash_start.close();
        self.flash_part_received.close();
        self.flash_part_written.close();
        self.flash_end.close();
    }
}

/// An established connection with the gateway
///
/// Cheap to clone; all clones share the stream and the mailboxes.
#[derive(Debug, Clone)]
pub struct Connection {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    mailboxes: Mailboxes,
    reader: Arc<JoinHandle<()>>,
}

impl Connection {
    /// Connects to the gateway and starts the background reader task
    pub async fn open(host: &str, port: u16) -> Result<Self, ConnectionError> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ConnectionError::ConnectFailed {
                addr: addr.clone(),
                source,
            })?;
        // Every command must leave as its own segment or the ack-paced flow
        // control stalls behind the kernel's coalescing.
        stream.set_nodelay(true)?;
        debug!("connected to the gateway at {addr}");

        let (read_half, write_half) = stream.into_split();
        let mailboxes = Mailboxes::default();
        let reader = tokio::spawn(read_loop(read_half, mailboxes.clone()));

        Ok(Connection {
            writer: Arc::new(Mutex::new(write_half)),
            mailboxes,
            reader: Arc::new(reader),
        })
    }

    /// Sends one command, holding back concurrent senders until it is out
    pub async fn command(&self, command: Command<'_>) -> Result<(), ConnectionError> {
        let mut encoded = Vec::new();
        command.write(&mut encoded)?;
        trace!("sending {}", command.command_type());

        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Status snapshots, one [DeviceStatus] per device slot
    pub fn status(&self) -> &Mailbox<Vec<DeviceStatus>> {
        &self.mailboxes.status
    }

    /// Raw slices of the gateway's own stdout
    pub fn stdout(&self) -> &Mailbox<Vec<u8>> {
        &self.mailboxes.stdout
    }

    /// Acknowledgement that a flashing session is open
    pub fn flash_start(&self) -> &Mailbox<()> {
        &self.mailboxes.flash_start
    }

    /// Acknowledgement that a chunk reached the gateway's queue
    pub fn flash_part_received(&self) -> &Mailbox<()> {
        &self.mailboxes.flash_part_received
    }

    /// Acknowledgement that a queued chunk was written out to the target
    pub fn flash_part_written(&self) -> &Mailbox<()> {
        &self.mailboxes.flash_part_written
    }

    /// Acknowledgement that the flashing session is closed
    pub fn flash_end(&self) -> &Mailbox<()> {
        &self.mailboxes.flash_end
    }

    /// Closes the write side and tears down the reader task
    pub async fn shutdown(self) -> Result<(), ConnectionError> {
        {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await?;
        }
        self.reader.abort();
        self.mailboxes.close_all();
        Ok(())
    }
}

/// Drains the stream, decoding messages off the front of a running buffer
///
/// Bytes left over after the last complete message stay in the buffer until
/// the next read completes them. Exits when the gateway goes away or the
/// stream loses framing, failing all mailboxes either way.
async fn read_loop(mut reader: OwnedReadHalf, mailboxes: Mailboxes) {
    let mut pending = Vec::new();
    let mut chunk = [0u8; READ_BUFFER_SIZE];
    'stream: loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!("the gateway closed the connection");
                break;
            }
            Ok(read) => {
                pending.extend_from_slice(&chunk[..read]);
                let mut consumed = 0;
                loop {
                    match event::decode(&pending[consumed..]) {
                        Ok(Some((event, spanned))) => {
                            consumed += spanned;
                            dispatch(&mailboxes, event);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            error!("{err}");
                            break 'stream;
                        }
                    }
                }
                pending.drain(..consumed);
            }
            Err(err) => {
                error!("error while reading from the gateway: {err}");
                break;
            }
        }
    }
    mailboxes.close_all();
}

fn dispatch(mailboxes: &Mailboxes, event: Event) {
    match event {
        Event::UpdateStatus(status) => mailboxes.status.post(status),
        Event::UpdateStdout(text) => mailboxes.stdout.post(text),
        Event::FlashStart => mailboxes.flash_start.post(()),
        Event::FlashPartReceived => mailboxes.flash_part_received.post(()),
        Event::FlashPartWritten => mailboxes.flash_part_written.post(()),
        Event::FlashEnd => mailboxes.flash_end.post(()),
        Event::FlashError => warn!("gateway: an error occurred while flashing the device"),
        Event::DecodeFailure => warn!("gateway: unexpected message id"),
    }
}
