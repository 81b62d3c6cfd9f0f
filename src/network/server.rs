//! Wire framing and socket helpers
//!
//! Every message travels as a 24-byte header followed by its payload:
//! magic (4) | command (12, NUL padded) | payload length (u32 LE) | checksum (4).
//! The checksum is the first four bytes of SHA-256d over the payload.

use crate::network::message::{
    max_payload_length, Hash, Message, MessageError, COMMAND_SIZE, MAX_MESSAGE_PAYLOAD,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the fixed message header
pub const HEADER_SIZE: usize = 4 + COMMAND_SIZE + 4 + 4;

/// Framing errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid magic bytes: {0}")]
    InvalidMagic(String),

    #[error("Invalid command bytes")]
    InvalidCommand,

    #[error("Payload for {command} is {size} bytes, max is {max}")]
    PayloadTooLarge {
        command: String,
        size: usize,
        max: usize,
    },

    #[error("Checksum mismatch for {command}: header {expected}, payload {actual}")]
    ChecksumMismatch {
        command: String,
        expected: String,
        actual: String,
    },
}

impl CodecError {
    /// True when the remote side simply went away
    pub fn is_disconnect(&self) -> bool {
        match self {
            CodecError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// A framed message: command plus raw payload
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn from_message(msg: &Message) -> Result<Self, MessageError> {
        Ok(Self {
            command: msg.command().to_string(),
            payload: Bytes::from(msg.encode_payload()?),
        })
    }

    pub fn to_message(&self) -> Result<Message, MessageError> {
        Message::decode(&self.command, &self.payload)
    }

    /// Bytes this frame occupies on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = Hash::double_sha256(payload);
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash.0[..4]);
    out
}

/// Message codec for header-prefixed framing
#[derive(Debug, Clone)]
pub struct MessageCodec {
    magic: [u8; 4],
}

impl MessageCodec {
    pub fn new(magic: [u8; 4]) -> Self {
        Self { magic }
    }
}

impl Encoder<Frame> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let command = item.command.as_bytes();
        if command.is_empty() || command.len() > COMMAND_SIZE || !command.is_ascii() {
            return Err(CodecError::InvalidCommand);
        }

        let max = max_payload_length(&item.command).min(MAX_MESSAGE_PAYLOAD);
        if item.payload.len() > max {
            return Err(CodecError::PayloadTooLarge {
                command: item.command,
                size: item.payload.len(),
                max,
            });
        }

        dst.reserve(HEADER_SIZE + item.payload.len());
        dst.put_slice(&self.magic);
        let mut padded = [0u8; COMMAND_SIZE];
        padded[..command.len()].copy_from_slice(command);
        dst.put_slice(&padded);
        dst.put_u32_le(item.payload.len() as u32);
        dst.put_slice(&checksum(&item.payload));
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        if src[..4] != self.magic {
            return Err(CodecError::InvalidMagic(hex::encode(&src[..4])));
        }

        let raw_command = &src[4..4 + COMMAND_SIZE];
        let end = raw_command
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(COMMAND_SIZE);
        if end == 0
            || raw_command[end..].iter().any(|b| *b != 0)
            || !raw_command[..end].iter().all(|b| b.is_ascii_graphic())
        {
            return Err(CodecError::InvalidCommand);
        }
        let command = String::from_utf8_lossy(&raw_command[..end]).into_owned();

        let len_offset = 4 + COMMAND_SIZE;
        let len = u32::from_le_bytes([
            src[len_offset],
            src[len_offset + 1],
            src[len_offset + 2],
            src[len_offset + 3],
        ]) as usize;

        // Size checks happen before the body is buffered
        let max = max_payload_length(&command).min(MAX_MESSAGE_PAYLOAD);
        if len > max {
            return Err(CodecError::PayloadTooLarge {
                command,
                size: len,
                max,
            });
        }

        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        let mut expected = [0u8; 4];
        expected.copy_from_slice(&src[len_offset + 4..HEADER_SIZE]);

        src.advance(HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        let actual = checksum(&payload);
        if actual != expected {
            return Err(CodecError::ChecksumMismatch {
                command,
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }

        Ok(Some(Frame { command, payload }))
    }
}

/// Connect to a peer, giving up after `timeout`
pub async fn connect_to_peer(addr: SocketAddr, timeout: Duration) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("dial {} timed out after {:?}", addr, timeout),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::{cmd, MsgPing};

    const MAGIC: [u8; 4] = [0x44, 0x41, 0x47, 0x54];

    fn ping_frame(nonce: u64) -> Frame {
        Frame::from_message(&Message::Ping(MsgPing { nonce })).unwrap()
    }

    #[test]
    fn test_message_codec() {
        let mut codec = MessageCodec::new(MAGIC);
        let mut buf = BytesMut::new();
        codec.encode(ping_frame(12345), &mut buf).unwrap();

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command, cmd::PING);
        match frame.to_message().unwrap() {
            Message::Ping(ping) => assert_eq!(ping.nonce, 12345),
            other => panic!("Wrong message type: {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = MessageCodec::new(MAGIC);
        let mut full = BytesMut::new();
        codec.encode(ping_frame(1), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..HEADER_SIZE - 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = MessageCodec::new(MAGIC);
        let mut buf = BytesMut::new();
        codec.encode(ping_frame(1), &mut buf).unwrap();
        codec
            .encode(Frame::from_message(&Message::VerAck).unwrap(), &mut buf)
            .unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().command, cmd::PING);
        let verack = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(verack.command, cmd::VERACK);
        assert_eq!(verack.wire_len(), HEADER_SIZE);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_wrong_magic() {
        let mut buf = BytesMut::new();
        MessageCodec::new(MAGIC)
            .encode(ping_frame(1), &mut buf)
            .unwrap();

        let mut other = MessageCodec::new([1, 2, 3, 4]);
        assert!(matches!(
            other.decode(&mut buf),
            Err(CodecError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut codec = MessageCodec::new(MAGIC);
        let mut buf = BytesMut::new();
        codec.encode(ping_frame(7), &mut buf).unwrap();
        let last = buf.len() - 2;
        buf[last] ^= 0xff;

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_header_rejected_before_body() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        let mut command = [0u8; COMMAND_SIZE];
        command[..4].copy_from_slice(b"ping");
        buf.put_slice(&command);
        buf.put_u32_le(10_000);
        buf.put_slice(&[0u8; 4]);

        let mut codec = MessageCodec::new(MAGIC);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_garbage_command_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        let mut command = [0u8; COMMAND_SIZE];
        command[..3].copy_from_slice(b"a\x00b");
        buf.put_slice(&command);
        buf.put_u32_le(0);
        buf.put_slice(&checksum(&[]));

        let mut codec = MessageCodec::new(MAGIC);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::InvalidCommand)
        ));
    }
}
