//! Library and application errors

use std::io;

use miette::Diagnostic;
use thiserror::Error;

use crate::{mailbox::MailboxClosed, status::DeviceStatus};

/// All possible errors returned by uf2batch
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Communication with the gateway failed")]
    #[diagnostic(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Device {device}: timed out while waiting for {waiting_for}")]
    #[diagnostic(
        code(uf2batch::status_timeout),
        help("Check that a target is seated in USB port {device} and that the port is powered")
    )]
    StatusTimeout { device: u8, waiting_for: &'static str },

    #[error("Device {device} reported status {status} while waiting for {waiting_for}")]
    #[diagnostic(
        code(uf2batch::device_fault),
        help("Re-seat the target and flash this port again")
    )]
    DeviceFault {
        device: u8,
        status: DeviceStatus,
        waiting_for: &'static str,
    },
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<MailboxClosed> for Error {
    fn from(_: MailboxClosed) -> Self {
        Self::Connection(ConnectionError::Closed)
    }
}

/// Connection-related errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to connect to the gateway at {addr}")]
    #[diagnostic(
        code(uf2batch::connection_failed),
        help("Ensure that the gateway is powered and reachable over the network")
    )]
    ConnectFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Unrecognized message tag {tag:#04x} received from the gateway")]
    #[diagnostic(
        code(uf2batch::unknown_message),
        help("Message framing is lost and the stream cannot be resynchronized; reconnect and retry")
    )]
    UnknownMessage { tag: u8 },

    #[error("The connection to the gateway was closed")]
    #[diagnostic(
        code(uf2batch::connection_closed),
        help("Check the gateway's power and Wi-Fi link, then retry")
    )]
    Closed,

    #[error("IO error while using the connection: {0}")]
    #[diagnostic(code(uf2batch::io_error))]
    Io(#[from] io::Error),
}
