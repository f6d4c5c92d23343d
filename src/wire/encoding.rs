//! Length-delimited binary encoding of [Message] frames.
//!
//! A frame is a big-endian u16 byte length followed by the bincode encoding
//! of the message. The length prefix bounds a message at 64 KiB, far above
//! anything the update protocol produces.

use super::TransportError;
use crate::messages::Message;

/// Encodes `msg` into a single frame, including the length prefix.
pub fn encode(msg: &Message) -> Result<Vec<u8>, TransportError> {
    let body = bincode::serialize(msg)?;
    let len = u16::try_from(body.len()).map_err(|_| TransportError::FrameTooLarge)?;
    let mut frame = Vec::with_capacity(2 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes a frame body (without the length prefix).
pub fn decode(body: &[u8]) -> Result<Message, TransportError> {
    Ok(bincode::deserialize(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hash;

    #[test]
    fn frame_roundtrip() {
        let msg = Message::UpdateRejected {
            channel: Hash([3; 32]),
            version: 7,
            reason: "no".into(),
        };

        let frame = encode(&msg).unwrap();
        let len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(len, frame.len() - 2);
        assert_eq!(decode(&frame[2..]).unwrap(), msg);
    }
}
