//! Inbound side of a connection: frame reading and chunk reassembly

use crate::error::{NetworkError, Result};
use crate::wire::codec::{read_frame, Frame, Message, PartialPacket, MAX_MESSAGE_LENGTH};
use crossbeam_channel::Sender;
use log::{debug, trace};
use std::io::Read;
use std::thread::{self, JoinHandle};

/// Events a running reader emits to its owner
#[derive(Debug)]
pub enum ReaderEvent {
    Message(Message),
    /// The loop has stopped; carries the cause
    Closed(NetworkError),
}

#[derive(Debug)]
enum Assembly {
    Idle,
    Accumulating {
        msg_type: u8,
        total_data_size: u32,
        next_position: u32,
        received: usize,
        chunks: Vec<Vec<u8>>,
    },
}

/// Reassembles one chunked message at a time.
///
/// Moves from `Idle` to `Accumulating` on the first partial packet and emits
/// the concatenated message on the `is_end` packet. Whole frames pass straight
/// through without disturbing an in-flight sequence.
#[derive(Debug)]
pub struct ChunkAssembler {
    state: Assembly,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self {
            state: Assembly::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, Assembly::Idle)
    }

    /// Feed one frame; returns a message once one is complete
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame {
            Frame::Whole(message) => Ok(Some(message)),
            Frame::Partial { msg_type, packet } => self.push_partial(msg_type, packet),
        }
    }

    fn push_partial(&mut self, msg_type: u8, packet: PartialPacket) -> Result<Option<Message>> {
        if packet.total_data_size as usize > MAX_MESSAGE_LENGTH {
            return Err(NetworkError::Protocol(format!(
                "chunked message of {} bytes exceeds maximum {MAX_MESSAGE_LENGTH}",
                packet.total_data_size
            )));
        }

        if let Assembly::Idle = self.state {
            if packet.position != 0 {
                return Err(NetworkError::Protocol(format!(
                    "chunk sequence starts at position {}",
                    packet.position
                )));
            }
            self.state = Assembly::Accumulating {
                msg_type,
                total_data_size: packet.total_data_size,
                next_position: 0,
                received: 0,
                chunks: Vec::new(),
            };
        }

        let (expected_type, total_data_size, next_position, received, chunks) = match &mut self.state
        {
            Assembly::Accumulating {
                msg_type,
                total_data_size,
                next_position,
                received,
                chunks,
            } => (msg_type, total_data_size, next_position, received, chunks),
            Assembly::Idle => {
                return Err(NetworkError::Protocol(
                    "chunk assembler lost its sequence".to_string(),
                ))
            }
        };

        if msg_type != *expected_type {
            return Err(NetworkError::Protocol(format!(
                "chunk of type {msg_type} interleaved with in-flight type {expected_type}"
            )));
        }
        if packet.position != *next_position {
            return Err(NetworkError::Protocol(format!(
                "expected chunk position {next_position}, got {}",
                packet.position
            )));
        }
        if packet.total_data_size != *total_data_size {
            return Err(NetworkError::Protocol(format!(
                "total size changed from {total_data_size} to {} mid-sequence",
                packet.total_data_size
            )));
        }
        if *received + packet.data.len() > *total_data_size as usize {
            return Err(NetworkError::Protocol(format!(
                "chunks exceed declared total size {total_data_size}"
            )));
        }

        *received += packet.data.len();
        *next_position += 1;
        chunks.push(packet.data);
        trace!("Buffered chunk {} ({received}/{total_data_size} bytes)", *next_position - 1);

        if !packet.is_end {
            return Ok(None);
        }

        if *received != *total_data_size as usize {
            return Err(NetworkError::Protocol(format!(
                "reassembled {received} bytes but {total_data_size} were declared"
            )));
        }

        let msg_type = *expected_type;
        let payload = chunks.concat();
        self.state = Assembly::Idle;
        debug!("Reassembled message type {msg_type} of {} bytes", payload.len());
        Ok(Some(Message::new(msg_type, payload)))
    }
}

/// Reads frames from one stream and yields complete messages
pub struct MessageReader<R> {
    stream: R,
    assembler: ChunkAssembler,
}

impl<R: Read> MessageReader<R> {
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            assembler: ChunkAssembler::new(),
        }
    }

    /// Block until the next complete message is available
    pub fn read_message(&mut self) -> Result<Message> {
        loop {
            let frame = read_frame(&mut self.stream)?;
            if let Some(message) = self.assembler.push(frame)? {
                return Ok(message);
            }
        }
    }
}

impl<R: Read + Send + 'static> MessageReader<R> {
    /// Run the read loop on its own thread.
    ///
    /// The loop ends on the first error, after sending `Closed`, or when the
    /// owner drops its receiver.
    pub fn spawn(mut self, name: String, events: Sender<ReaderEvent>) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(name)
            .spawn(move || loop {
                match self.read_message() {
                    Ok(message) => {
                        if events.send(ReaderEvent::Message(message)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Reader stopping: {e}");
                        let _ = events.send(ReaderEvent::Closed(e));
                        break;
                    }
                }
            })
            .map_err(|e| NetworkError::Io(format!("Failed to spawn reader thread: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::codec::{encode_frame, split_message};
    use crossbeam_channel::unbounded;
    use std::io::Cursor;
    use std::time::Duration;

    fn partial(msg_type: u8, position: u32, is_end: bool, total: u32, data: &[u8]) -> Frame {
        Frame::Partial {
            msg_type,
            packet: PartialPacket {
                position,
                is_end,
                total_data_size: total,
                data: data.to_vec(),
            },
        }
    }

    fn stream_of(frames: &[Frame]) -> Cursor<Vec<u8>> {
        let mut bytes = Vec::new();
        for frame in frames {
            bytes.extend(encode_frame(frame).unwrap());
        }
        Cursor::new(bytes)
    }

    #[test]
    fn test_reassembles_chunks_in_order() {
        let mut assembler = ChunkAssembler::new();
        assert_eq!(assembler.push(partial(3, 0, false, 7, b"abc")).unwrap(), None);
        assert!(!assembler.is_idle());
        assert_eq!(assembler.push(partial(3, 1, false, 7, b"de")).unwrap(), None);

        let message = assembler.push(partial(3, 2, true, 7, b"fg")).unwrap().unwrap();
        assert_eq!(message.msg_type, 3);
        assert_eq!(message.payload, b"abcdefg".to_vec());
        assert_eq!(message.len(), 7);
        assert!(assembler.is_idle());
    }

    #[test]
    fn test_split_then_read_yields_one_message() {
        let original = Message::new(4, (0..10_000u32).map(|i| (i % 251) as u8).collect());
        let frames = split_message(&original, 1024).unwrap();
        assert!(frames.len() > 1);

        let mut reader = MessageReader::new(stream_of(&frames));
        assert_eq!(reader.read_message().unwrap(), original);
        assert!(reader.read_message().is_err());
    }

    #[test]
    fn test_whole_frame_passes_through_during_sequence() {
        let mut assembler = ChunkAssembler::new();
        assembler.push(partial(3, 0, false, 4, b"ab")).unwrap();

        let ping = assembler.push(Frame::Whole(Message::new(5, vec![1]))).unwrap();
        assert_eq!(ping, Some(Message::new(5, vec![1])));

        let done = assembler.push(partial(3, 1, true, 4, b"cd")).unwrap().unwrap();
        assert_eq!(done.payload, b"abcd".to_vec());
    }

    #[test]
    fn test_interleaved_types_rejected() {
        let mut assembler = ChunkAssembler::new();
        assembler.push(partial(3, 0, false, 4, b"ab")).unwrap();
        assert!(matches!(
            assembler.push(partial(4, 1, true, 4, b"cd")),
            Err(NetworkError::Protocol(_))
        ));
    }

    #[test]
    fn test_out_of_order_position_rejected() {
        let mut assembler = ChunkAssembler::new();
        assert!(assembler.push(partial(3, 1, false, 4, b"ab")).is_err());

        let mut assembler = ChunkAssembler::new();
        assembler.push(partial(3, 0, false, 6, b"ab")).unwrap();
        assert!(assembler.push(partial(3, 2, true, 6, b"cd")).is_err());
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let mut assembler = ChunkAssembler::new();
        assembler.push(partial(3, 0, false, 10, b"ab")).unwrap();
        assert!(matches!(
            assembler.push(partial(3, 1, true, 10, b"cd")),
            Err(NetworkError::Protocol(_))
        ));
    }

    #[test]
    fn test_spawned_reader_reports_close() {
        let frames = vec![
            Frame::Whole(Message::new(1, b"one".to_vec())),
            Frame::Whole(Message::new(2, vec![])),
        ];
        let (tx, rx) = unbounded();
        let handle = MessageReader::new(stream_of(&frames))
            .spawn("test-reader".to_string(), tx)
            .unwrap();

        let timeout = Duration::from_secs(2);
        match rx.recv_timeout(timeout).unwrap() {
            ReaderEvent::Message(m) => assert_eq!(m.payload, b"one".to_vec()),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv_timeout(timeout).unwrap() {
            ReaderEvent::Message(m) => assert!(m.is_empty()),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            rx.recv_timeout(timeout).unwrap(),
            ReaderEvent::Closed(NetworkError::Io(_))
        ));
        handle.join().unwrap();
    }
}
