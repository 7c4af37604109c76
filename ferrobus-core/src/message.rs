//! Multipart message primitives.
//!
//! Protocol messages travel as sequences of byte frames. This module
//! provides the [`Zmsg`] alias, a cursor for safe frame consumption
//! during decoding, and the [`SimpleMessage`] used by protocols that
//! carry uninterpreted frames (e.g. internal wake channels).

use bytes::Bytes;

use crate::error::Error;
use crate::protocol::{DispatchKey, ProtocolMessage};

/// ZMQ multipart message: a sequence of byte frames.
pub type Zmsg = Vec<Bytes>;

/// Read a big-endian `u16` from a 2-byte frame slice.
pub fn be_u16(data: &[u8]) -> Result<u16, Error> {
    if data.len() != 2 {
        return Err(Error::invalid("expected 2-byte frame"));
    }
    Ok(u16::from_be_bytes([data[0], data[1]]))
}

/// Decode a frame as UTF-8 text.
pub fn text_frame(data: &[u8]) -> Result<&str, Error> {
    std::str::from_utf8(data).map_err(|_| Error::invalid("frame is not valid UTF-8"))
}

/// Sequential reader over the frames of a multipart message.
///
/// Decoders use it to consume frames in order and fail with
/// *invalid message* when a frame is missing.
pub struct FrameReader<'a> {
    frames: &'a [Bytes],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    /// Create a reader over `frames`.
    pub fn new(frames: &'a [Bytes]) -> Self {
        Self { frames, pos: 0 }
    }

    /// Number of frames not consumed yet.
    pub fn remaining(&self) -> usize {
        self.frames.len() - self.pos
    }

    /// Consume and return the next frame.
    ///
    /// # Errors
    ///
    /// Returns an invalid-message error when no frame is left.
    pub fn next(&mut self) -> Result<&'a Bytes, Error> {
        let frame = self
            .frames
            .get(self.pos)
            .ok_or_else(|| Error::invalid("missing message frame"))?;
        self.pos += 1;
        Ok(frame)
    }

    /// Consume and return the next frame, or `None` when exhausted.
    pub fn try_next(&mut self) -> Option<&'a Bytes> {
        let frame = self.frames.get(self.pos)?;
        self.pos += 1;
        Some(frame)
    }

    /// All frames not consumed yet, consuming them.
    pub fn rest(&mut self) -> &'a [Bytes] {
        let rest = &self.frames[self.pos..];
        self.pos = self.frames.len();
        rest
    }
}

/// Protocol message that holds uninterpreted multipart frames.
///
/// Dispatch key is the first frame, so simple protocols can register
/// handlers per leading frame or use the wildcard.
#[derive(Debug, Clone, Default)]
pub struct SimpleMessage {
    /// Sequence of data frames.
    pub data: Zmsg,
}

impl SimpleMessage {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message holding a single frame.
    pub fn from_frame(frame: impl Into<Bytes>) -> Self {
        Self { data: vec![frame.into()] }
    }
}

impl ProtocolMessage for SimpleMessage {
    type Key = DispatchKey<Bytes>;

    fn from_frames(frames: &Zmsg) -> Result<Self, Error> {
        Ok(Self { data: frames.clone() })
    }

    fn to_frames(&self) -> Zmsg {
        self.data.clone()
    }

    fn keys(&self) -> Vec<Self::Key> {
        match self.data.first() {
            Some(first) => vec![DispatchKey::Exact(first.clone()), DispatchKey::Any],
            None => vec![DispatchKey::Any],
        }
    }

    fn clear(&mut self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_be_u16() {
        assert_eq!(be_u16(&[0x01, 0x02]).unwrap(), 0x0102);
        assert!(be_u16(&[0x01]).is_err());
        assert!(be_u16(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_frame_reader() {
        let frames: Zmsg = vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")];
        let mut reader = FrameReader::new(&frames);
        assert_eq!(reader.remaining(), 2);
        assert_eq!(reader.next().unwrap().as_ref(), b"a");
        assert_eq!(reader.next().unwrap().as_ref(), b"b");
        assert!(reader.next().is_err());
        assert!(reader.try_next().is_none());
    }

    #[test]
    fn test_frame_reader_rest() {
        let frames: Zmsg = vec![
            Bytes::from_static(b"head"),
            Bytes::from_static(b"x"),
            Bytes::from_static(b"y"),
        ];
        let mut reader = FrameReader::new(&frames);
        reader.next().unwrap();
        let rest = reader.rest();
        assert_eq!(rest.len(), 2);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_simple_message_keys() {
        let msg = SimpleMessage::from_frame(&b"wake"[..]);
        let keys = msg.keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], DispatchKey::Exact(Bytes::from_static(b"wake")));
        assert_eq!(keys[1], DispatchKey::Any);

        let empty = SimpleMessage::new();
        assert_eq!(empty.keys(), vec![DispatchKey::Any]);
    }
}
