//! Frame encoding and decoding
//!
//! Frame layout, all integers little-endian:
//!
//! ```text
//! [type:1][is_chunked:1][length:4][payload:length]
//! ```
//!
//! When `is_chunked` is set the payload is a partial packet record:
//!
//! ```text
//! [position:4][is_end:1][total_size:4][chunk data:length-9]
//! ```

use crate::error::{NetworkError, Result};
use std::io::{Read, Write};

/// type + chunk flag + length
pub const FRAME_HEADER_LEN: usize = 6;

/// position + is_end + total size
pub const PARTIAL_HEADER_LEN: usize = 9;

/// Largest payload a single frame may declare
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Largest message that may be reassembled from chunks
pub const MAX_MESSAGE_LENGTH: usize = 64 * 1024 * 1024;

/// Messages larger than this are split into partial packets by default
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// A complete logical message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: u8, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Payload length; always equal to `payload.len()`
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// One chunk of a message too large for a single frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialPacket {
    /// Zero-based chunk index within the message
    pub position: u32,
    pub is_end: bool,
    pub total_data_size: u32,
    pub data: Vec<u8>,
}

/// A single decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Whole(Message),
    Partial { msg_type: u8, packet: PartialPacket },
}

/// Encode a message as one non-chunked frame
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    encode_frame(&Frame::Whole(message.clone()))
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    match frame {
        Frame::Whole(message) => {
            let length = checked_length(message.payload.len())?;
            let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + message.payload.len());
            buf.push(message.msg_type);
            buf.push(0);
            buf.extend_from_slice(&length.to_le_bytes());
            buf.extend_from_slice(&message.payload);
            Ok(buf)
        }
        Frame::Partial { msg_type, packet } => {
            let length = checked_length(PARTIAL_HEADER_LEN + packet.data.len())?;
            let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + length as usize);
            buf.push(*msg_type);
            buf.push(1);
            buf.extend_from_slice(&length.to_le_bytes());
            buf.extend_from_slice(&packet.position.to_le_bytes());
            buf.push(u8::from(packet.is_end));
            buf.extend_from_slice(&packet.total_data_size.to_le_bytes());
            buf.extend_from_slice(&packet.data);
            Ok(buf)
        }
    }
}

fn checked_length(len: usize) -> Result<u32> {
    if len > MAX_FRAME_LENGTH {
        return Err(NetworkError::Protocol(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_LENGTH}"
        )));
    }
    Ok(len as u32)
}

/// Split a message into the frames that carry it.
///
/// Messages up to `chunk_size` bytes travel as a single whole frame; larger
/// ones become a sequence of partial packets, the last one flagged `is_end`.
pub fn split_message(message: &Message, chunk_size: usize) -> Result<Vec<Frame>> {
    if chunk_size == 0 || chunk_size + PARTIAL_HEADER_LEN > MAX_FRAME_LENGTH {
        return Err(NetworkError::Config(format!(
            "invalid chunk size {chunk_size}"
        )));
    }
    if message.len() > MAX_MESSAGE_LENGTH {
        return Err(NetworkError::Protocol(format!(
            "message of {} bytes exceeds maximum {MAX_MESSAGE_LENGTH}",
            message.len()
        )));
    }
    if message.len() <= chunk_size {
        return Ok(vec![Frame::Whole(message.clone())]);
    }

    let total_data_size = message.len() as u32;
    let chunk_count = message.payload.chunks(chunk_size).count();
    let frames = message
        .payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, data)| Frame::Partial {
            msg_type: message.msg_type,
            packet: PartialPacket {
                position: index as u32,
                is_end: index + 1 == chunk_count,
                total_data_size,
                data: data.to_vec(),
            },
        })
        .collect();
    Ok(frames)
}

/// Write every frame of a message, chunking as needed
pub fn write_message<W: Write>(writer: &mut W, message: &Message, chunk_size: usize) -> Result<()> {
    for frame in split_message(message, chunk_size)? {
        writer.write_all(&encode_frame(&frame)?)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read exactly one frame, blocking until all declared bytes have arrived
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;

    let msg_type = header[0];
    let is_chunked = match header[1] {
        0 => false,
        1 => true,
        other => {
            return Err(NetworkError::Protocol(format!(
                "invalid chunk flag {other}"
            )))
        }
    };
    let length = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if length > MAX_FRAME_LENGTH {
        return Err(NetworkError::Protocol(format!(
            "declared frame length {length} exceeds maximum {MAX_FRAME_LENGTH}"
        )));
    }

    if !is_chunked {
        let payload = read_bytes(reader, length)?;
        return Ok(Frame::Whole(Message::new(msg_type, payload)));
    }

    if length < PARTIAL_HEADER_LEN {
        return Err(NetworkError::Protocol(format!(
            "chunked frame length {length} shorter than partial header"
        )));
    }
    let mut partial = [0u8; PARTIAL_HEADER_LEN];
    reader.read_exact(&mut partial)?;
    let position = u32::from_le_bytes([partial[0], partial[1], partial[2], partial[3]]);
    let is_end = partial[4] != 0;
    let total_data_size = u32::from_le_bytes([partial[5], partial[6], partial[7], partial[8]]);
    let data = read_bytes(reader, length - PARTIAL_HEADER_LEN)?;

    Ok(Frame::Partial {
        msg_type,
        packet: PartialPacket {
            position,
            is_end,
            total_data_size,
            data,
        },
    })
}

fn read_bytes<R: Read>(reader: &mut R, amount: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; amount];
    if amount > 0 {
        reader.read_exact(&mut buf)?;
    }
    Ok(buf)
}
