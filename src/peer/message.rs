use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames longer than this are treated as a protocol violation rather than
/// buffered.
pub const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke         = 0,
    Unchoke       = 1,
    Interested    = 2,
    NotInterested = 3,
    Have          = 4,
    Bitfield      = 5,
    Request       = 6,
    Piece         = 7,
    Cancel        = 8,
}

/// A length-prefixed frame as it appears on the wire; no interpretation of
/// the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { bitmap: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame length {0} exceeds the maximum frame length")]
    FrameTooLarge(u32),
    #[error("unknown message id {0}")]
    UnknownId(u8),
    #[error("{id:?} payload has {received} bytes, expected {expected}")]
    MalformedPayload { id: MessageId, expected: usize, received: usize },
}

impl TryFrom<u8> for MessageId {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, MessageError> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            _ => Err(MessageError::UnknownId(value)),
        }
    }
}

impl Frame {
    pub fn serialize(&self) -> Vec<u8> {
        let length = self.payload.len() as u32 + 1;
        let mut buf = Vec::with_capacity(4 + length as usize);
        buf.extend_from_slice(&length.to_be_bytes());
        buf.push(self.id);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Serializes an optional frame; `None` is the zero-length keep-alive.
pub fn serialize(frame: Option<&Frame>) -> Vec<u8> {
    match frame {
        Some(frame) => frame.serialize(),
        None => vec![0; 4],
    }
}

/// Reads one frame. Returns `Ok(None)` for a keep-alive. A stream that ends
/// part way through a frame is an error, never a partial frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>, MessageError> {
    let mut length_buf = [0u8; 4];
    reader.read_exact(&mut length_buf).await?;
    let length = u32::from_be_bytes(length_buf);
    if length == 0 {
        return Ok(None);
    }
    if length > MAX_FRAME_LEN {
        return Err(MessageError::FrameTooLarge(length));
    }

    let mut buf = vec![0u8; length as usize];
    reader.read_exact(&mut buf).await?;
    let payload = buf.split_off(1);
    Ok(Some(Frame { id: buf[0], payload }))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: Option<&Frame>) -> Result<(), MessageError> {
    writer.write_all(&serialize(frame)).await?;
    writer.flush().await?;
    Ok(())
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn expect_len(id: MessageId, payload: &[u8], expected: usize) -> Result<(), MessageError> {
    if payload.len() != expected {
        return Err(MessageError::MalformedPayload { id, expected, received: payload.len() });
    }
    Ok(())
}

fn encode_12(index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(&begin.to_be_bytes());
    payload.extend_from_slice(&length.to_be_bytes());
    payload
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield { .. } => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
        }
    }
}

impl From<&Message> for Frame {
    fn from(message: &Message) -> Frame {
        let payload = match message {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => Vec::new(),
            Message::Have { index } => index.to_be_bytes().to_vec(),
            Message::Bitfield { bitmap } => bitmap.clone(),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                encode_12(*index, *begin, *length)
            },
            Message::Piece { index, begin, block } => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
                payload
            },
        };
        Frame { id: message.id() as u8, payload }
    }
}

impl TryFrom<Frame> for Message {
    type Error = MessageError;

    fn try_from(frame: Frame) -> Result<Self, MessageError> {
        let id = MessageId::try_from(frame.id)?;
        let payload = frame.payload;
        let message = match id {
            MessageId::Choke | MessageId::Unchoke | MessageId::Interested | MessageId::NotInterested => {
                expect_len(id, &payload, 0)?;
                match id {
                    MessageId::Choke => Message::Choke,
                    MessageId::Unchoke => Message::Unchoke,
                    MessageId::Interested => Message::Interested,
                    _ => Message::NotInterested,
                }
            },
            MessageId::Have => {
                expect_len(id, &payload, 4)?;
                Message::Have { index: be_u32(&payload) }
            },
            MessageId::Bitfield => Message::Bitfield { bitmap: payload },
            MessageId::Request | MessageId::Cancel => {
                expect_len(id, &payload, 12)?;
                let (index, begin, length) = (be_u32(&payload), be_u32(&payload[4..]), be_u32(&payload[8..]));
                if id == MessageId::Request {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            },
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(MessageError::MalformedPayload { id, expected: 8, received: payload.len() });
                }
                let (index, begin) = (be_u32(&payload), be_u32(&payload[4..]));
                Message::Piece { index, begin, block: payload[8..].to_vec() }
            },
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(bytes: &[u8]) -> Result<Option<Frame>, MessageError> {
        let mut reader = bytes;
        read_frame(&mut reader).await
    }

    #[tokio::test]
    async fn frames_survive_a_round_trip() {
        let wire: Vec<Vec<u8>> = vec![
            vec![0, 0, 0, 1, 0],
            vec![0, 0, 0, 1, 2],
            vec![0, 0, 0, 5, 4, 0, 0, 1, 0],
            vec![0, 0, 0, 3, 5, 0b1010_0000, 0],
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0],
            vec![0, 0, 0, 11, 7, 0, 0, 0, 2, 0, 0, 0, 0, 0xde, 0xad],
            vec![0, 0, 0, 2, 20, 0xff],
        ];
        for bytes in wire {
            let frame = decode(&bytes).await.unwrap();
            assert_eq!(serialize(frame.as_ref()), bytes);
        }
    }

    #[tokio::test]
    async fn zero_length_frame_is_keep_alive() {
        assert_eq!(decode(&[0, 0, 0, 0]).await.unwrap(), None);
        assert_eq!(serialize(None), vec![0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn short_reads_are_errors() {
        assert!(matches!(decode(&[0, 0]).await, Err(MessageError::Io(_))));
        assert!(matches!(decode(&[0, 0, 0, 5, 4, 0, 0]).await, Err(MessageError::Io(_))));
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let bytes = (MAX_FRAME_LEN + 1).to_be_bytes();
        assert!(matches!(decode(&bytes).await, Err(MessageError::FrameTooLarge(_))));
    }

    #[test]
    fn interprets_payloads() {
        let request = Message::Request { index: 1, begin: 16384, length: 16384 };
        let frame = Frame::from(&request);
        assert_eq!(frame.serialize(), vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]);
        assert_eq!(Message::try_from(frame).unwrap(), request);

        let piece = Message::Piece { index: 2, begin: 0, block: vec![0xde, 0xad] };
        assert_eq!(Message::try_from(Frame::from(&piece)).unwrap(), piece);

        let have = Message::try_from(Frame { id: 4, payload: vec![0, 0, 1, 0] }).unwrap();
        assert_eq!(have, Message::Have { index: 256 });
    }

    #[test]
    fn rejects_malformed_payloads() {
        let short_request = Frame { id: 6, payload: vec![0; 11] };
        assert!(matches!(
            Message::try_from(short_request),
            Err(MessageError::MalformedPayload { id: MessageId::Request, expected: 12, received: 11 })
        ));
        assert!(matches!(Message::try_from(Frame { id: 7, payload: vec![0; 7] }), Err(MessageError::MalformedPayload { .. })));
        assert!(matches!(Message::try_from(Frame { id: 1, payload: vec![0] }), Err(MessageError::MalformedPayload { .. })));
        assert!(matches!(Message::try_from(Frame { id: 20, payload: vec![] }), Err(MessageError::UnknownId(20))));
    }
}
