//! bincode 2 helpers for protocol payloads and stored records

use crate::error::{NetworkError, Result};

/// Encode with the standard bincode configuration
pub fn serialize<T: bincode::Encode>(data: &T) -> Result<Vec<u8>> {
    Ok(bincode::encode_to_vec(data, bincode::config::standard())?)
}

/// Decode a whole payload; bytes left over after the value are an error
pub fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
    let (data, read) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
    if read != bytes.len() {
        return Err(NetworkError::Serialization(format!(
            "{} trailing bytes after payload",
            bytes.len() - read
        )));
    }
    Ok(data)
}
