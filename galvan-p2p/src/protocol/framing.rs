//! Wire message framing codec.
//!
//! Frames are:
//! - 4 bytes: network magic
//! - 12 bytes: ASCII command, zero-padded
//! - 4 bytes: little-endian payload length
//! - 4 bytes: checksum (first four bytes of SHA-256d of the payload)
//! - N bytes: payload

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use galvan_core::crypto::hashing::payload_checksum;

use crate::config::MAX_PROTOCOL_MESSAGE_LENGTH;
use crate::error::{P2pError, P2pResult};
use crate::protocol::messages::Message;

/// Frame header size: magic + command + length + checksum.
const HEADER_SIZE: usize = 24;

/// Command field width.
const COMMAND_SIZE: usize = 12;

/// Codec for the 24-byte-header wire framing.
#[derive(Debug)]
pub struct MessageCodec {
    magic: [u8; 4],
    /// Parsed header of the frame currently being read.
    pending: Option<(String, usize, [u8; 4])>,
}

impl MessageCodec {
    /// Create a codec for the given network magic.
    pub fn new(magic: [u8; 4]) -> Self {
        Self {
            magic,
            pending: None,
        }
    }
}

/// Extract the command string from its zero-padded field.
fn parse_command(field: &[u8]) -> P2pResult<String> {
    let end = field
        .iter()
        .position(|&byte| byte == 0)
        .unwrap_or(COMMAND_SIZE);
    // Padding must be all zero and the name printable ASCII.
    if field[end..].iter().any(|&byte| byte != 0) {
        return Err(P2pError::MalformedCommand);
    }
    let name = &field[..end];
    if name.is_empty() || name.iter().any(|&byte| !(0x20..0x7f).contains(&byte)) {
        return Err(P2pError::MalformedCommand);
    }
    Ok(String::from_utf8(name.to_vec()).expect("checked ASCII"))
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = P2pError;

    fn decode(&mut self, src: &mut BytesMut) -> P2pResult<Option<Message>> {
        if self.pending.is_none() {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            let magic: [u8; 4] = src[0..4].try_into().expect("4 bytes");
            if magic != self.magic {
                return Err(P2pError::InvalidMagic {
                    expected: self.magic,
                    actual: magic,
                });
            }

            let command = parse_command(&src[4..4 + COMMAND_SIZE])?;
            let length =
                u32::from_le_bytes(src[16..20].try_into().expect("4 bytes")) as usize;
            if length > MAX_PROTOCOL_MESSAGE_LENGTH {
                return Err(P2pError::MessageTooLarge {
                    size: length,
                    max: MAX_PROTOCOL_MESSAGE_LENGTH,
                });
            }
            let checksum: [u8; 4] = src[20..24].try_into().expect("4 bytes");

            src.advance(HEADER_SIZE);
            self.pending = Some((command, length, checksum));
        }

        let (_, length, _) = self.pending.as_ref().expect("header parsed");
        if src.len() < *length {
            src.reserve(*length - src.len());
            return Ok(None);
        }

        let (command, length, expected) = self.pending.take().expect("header parsed");
        let payload = src.split_to(length);

        if payload_checksum(&payload) != expected {
            return Err(P2pError::InvalidChecksum { command });
        }

        Ok(Some(Message::decode(&command, &payload)?))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = P2pError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> P2pResult<()> {
        let payload = message.encode_payload();
        if payload.len() > MAX_PROTOCOL_MESSAGE_LENGTH {
            return Err(P2pError::MessageTooLarge {
                size: payload.len(),
                max: MAX_PROTOCOL_MESSAGE_LENGTH,
            });
        }

        let command = message.command();
        let mut command_field = [0u8; COMMAND_SIZE];
        command_field[..command.len()].copy_from_slice(command.as_bytes());

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&self.magic);
        dst.put_slice(&command_field);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&payload_checksum(&payload));
        dst.put_slice(&payload);
        Ok(())
    }
}
