//! Messages pushed by the gateway to the client
//!
//! The gateway writes messages back to back with no framing beyond the tag
//! byte, so decoding works on a running buffer: a message is only taken off
//! the front once every byte it spans has arrived.

use crate::{error::ConnectionError, status::DeviceStatus};

const UPDATE_STATUS: u8 = 0x80;
const UPDATE_STDOUT: u8 = 0x81;
const FLASH_START: u8 = 0x82;
const FLASH_PART_RECEIVED: u8 = 0x83;
const FLASH_PART_WRITTEN: u8 = 0x84;
const FLASH_END: u8 = 0x85;
const FLASH_ERROR: u8 = 0x86;
const DECODE_FAILURE: u8 = 0x87;

/// A decoded gateway message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Snapshot of the status byte of every device slot
    UpdateStatus(Vec<DeviceStatus>),
    /// A slice of the gateway's buffered stdout
    UpdateStdout(Vec<u8>),
    FlashStart,
    FlashPartReceived,
    FlashPartWritten,
    FlashEnd,
    /// The gateway failed to write the current image to the flash disk
    FlashError,
    /// The gateway could not decode a command we sent it
    DecodeFailure,
}

/// Attempts to decode one message from the front of `data`
///
/// Returns the message and the number of bytes it spans, or `None` when the
/// buffer holds only an incomplete prefix and more bytes must be read first.
/// An unknown tag is unrecoverable: without a length for it, the rest of the
/// stream can never be re-framed.
pub fn decode(data: &[u8]) -> Result<Option<(Event, usize)>, ConnectionError> {
    let Some(&tag) = data.first() else {
        return Ok(None);
    };
    let decoded = match tag {
        UPDATE_STATUS => match length_prefixed(data) {
            Some((payload, consumed)) => {
                let status = payload.iter().copied().map(DeviceStatus).collect();
                (Event::UpdateStatus(status), consumed)
            }
            None => return Ok(None),
        },
        UPDATE_STDOUT => match length_prefixed(data) {
            Some((payload, consumed)) => (Event::UpdateStdout(payload.to_vec()), consumed),
            None => return Ok(None),
        },
        FLASH_START => (Event::FlashStart, 1),
        FLASH_PART_RECEIVED => (Event::FlashPartReceived, 1),
        FLASH_PART_WRITTEN => (Event::FlashPartWritten, 1),
        FLASH_END => (Event::FlashEnd, 1),
        FLASH_ERROR => (Event::FlashError, 1),
        DECODE_FAILURE => (Event::DecodeFailure, 1),
        tag => return Err(ConnectionError::UnknownMessage { tag }),
    };
    Ok(Some(decoded))
}

/// Splits off a `[tag, len_lo, len_hi, payload...]` message, if complete
fn length_prefixed(data: &[u8]) -> Option<(&[u8], usize)> {
    if data.len() < 3 {
        return None;
    }
    let length = u16::from_le_bytes([data[1], data[2]]) as usize;
    let consumed = 3 + length;
    if data.len() < consumed {
        return None;
    }
    Some((&data[3..consumed], consumed))
}
