//! Commands sent from the client to the gateway

use std::io::{self, Write};

use strum::Display;

/// Payload bytes carried by one WriteFlashPart command
///
/// The gateway link runs with a TCP MSS of 1460 and the command needs four
/// bytes to identify and size the chunk, so this keeps each chunk within a
/// single segment.
pub const FLASH_CHUNK_SIZE: usize = 1460 - 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[repr(u8)]
#[non_exhaustive]
pub enum CommandType {
    RequestStatus = 0x00,
    RequestStdout = 0x01,
    SelectDevice = 0x02,
    StartFlash = 0x03,
    WriteFlashPart = 0x04,
    EndFlash = 0x05,
    RebootForFlash = 0x06,
    RebootSoft = 0x07,
}

#[derive(Copy, Clone, Debug)]
pub enum Command<'a> {
    /// Ask for a fresh snapshot of every device slot's status byte
    RequestStatus,
    /// Ask for whatever the gateway has buffered from its own stdout
    RequestStdout,
    /// Route the USB multiplexer to a device slot; -1 releases the selection
    SelectDevice { device: i8 },
    StartFlash,
    WriteFlashPart { data: &'a [u8] },
    EndFlash,
    /// Reboot the selected target into its bootloader
    RebootForFlash,
    /// Reboot the gateway itself
    RebootSoft,
}

impl<'a> Command<'a> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::RequestStatus => CommandType::RequestStatus,
            Command::RequestStdout => CommandType::RequestStdout,
            Command::SelectDevice { .. } => CommandType::SelectDevice,
            Command::StartFlash => CommandType::StartFlash,
            Command::WriteFlashPart { .. } => CommandType::WriteFlashPart,
            Command::EndFlash => CommandType::EndFlash,
            Command::RebootForFlash => CommandType::RebootForFlash,
            Command::RebootSoft => CommandType::RebootSoft,
        }
    }

    /// Serializes the command into its wire form
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&[self.command_type() as u8])?;
        match *self {
            Command::SelectDevice { device } => {
                writer.write_all(&[device as u8])?;
            }
            Command::WriteFlashPart { data } => {
                debug_assert!(data.len() <= FLASH_CHUNK_SIZE);
                writer.write_all(&(data.len() as u16).to_le_bytes())?;
                writer.write_all(data)?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(command: Command<'_>) -> Vec<u8> {
        let mut encoded = Vec::new();
        command.write(&mut encoded).unwrap();
        encoded
    }

    #[test]
    fn bare_commands_encode_as_a_single_tag_byte() {
        assert_eq!(encode(Command::RequestStatus), [0x00]);
        assert_eq!(encode(Command::RequestStdout), [0x01]);
        assert_eq!(encode(Command::StartFlash), [0x03]);
        assert_eq!(encode(Command::EndFlash), [0x05]);
        assert_eq!(encode(Command::RebootForFlash), [0x06]);
        assert_eq!(encode(Command::RebootSoft), [0x07]);
    }

    #[test]
    fn select_device_carries_a_signed_slot_byte() {
        assert_eq!(encode(Command::SelectDevice { device: 3 }), [0x02, 0x03]);
        assert_eq!(encode(Command::SelectDevice { device: -1 }), [0x02, 0xff]);
        assert_eq!(encode(Command::SelectDevice { device: 64 }), [0x02, 0x40]);
    }

    #[test]
    fn write_flash_part_prefixes_a_little_endian_length() {
        let data = [0xaa; 1456];
        let encoded = encode(Command::WriteFlashPart { data: &data });

        assert_eq!(encoded[..3], [0x04, 0xb0, 0x05]);
        assert_eq!(encoded.len(), 3 + 1456);
        assert_eq!(&encoded[3..], &data[..]);
    }

    #[test]
    fn short_tail_chunks_encode_their_own_length() {
        let encoded = encode(Command::WriteFlashPart { data: &[1, 2, 3] });
        assert_eq!(encoded, [0x04, 0x03, 0x00, 1, 2, 3]);
    }
}
