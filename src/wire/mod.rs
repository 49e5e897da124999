//! Length-prefixed framing over byte streams
//!
//! `codec` defines the frame layout, `reader` turns a stream into complete
//! messages (reassembling chunked ones) and `writer` serializes a queue of
//! outbound messages onto a stream.

pub mod codec;
pub mod reader;
pub mod writer;

pub use codec::{
    encode, encode_frame, read_frame, split_message, write_message, Frame, Message,
    PartialPacket, DEFAULT_CHUNK_SIZE, MAX_FRAME_LENGTH, MAX_MESSAGE_LENGTH,
};
pub use reader::{ChunkAssembler, MessageReader, ReaderEvent};
pub use writer::{MessageWriter, SendCallback, WriterEvent};
