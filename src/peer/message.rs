use crate::error::PeerError;
use crate::piece::BlockRequest;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame we accept from a remote (type byte plus payload).
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Messages exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Keep-alive message (no payload)
    KeepAlive,
    /// Choke the peer
    Choke,
    /// Unchoke the peer
    Unchoke,
    /// Indicate interest
    Interested,
    /// Indicate lack of interest
    NotInterested,
    /// Indicate possession of a piece
    Have { index: u32 },
    /// Bitfield of available pieces
    Bitfield { bitfield: Vec<u8> },
    /// Request a block
    Request { block: BlockRequest },
    /// Send a block
    Piece { index: u32, begin: u32, data: Vec<u8> },
    /// Cancel a block request
    Cancel { block: BlockRequest },
}

impl WireMessage {
    /// Message type IDs
    const CHOKE: u8 = 0;
    const UNCHOKE: u8 = 1;
    const INTERESTED: u8 = 2;
    const NOT_INTERESTED: u8 = 3;
    const HAVE: u8 = 4;
    const BITFIELD: u8 = 5;
    const REQUEST: u8 = 6;
    const PIECE: u8 = 7;
    const CANCEL: u8 = 8;

    /// Serialize message to bytes
    /// Format: <length prefix><message ID><payload>
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        match self {
            WireMessage::KeepAlive => {
                buf.put_u32(0);
            }
            WireMessage::Choke => put_bare(&mut buf, Self::CHOKE),
            WireMessage::Unchoke => put_bare(&mut buf, Self::UNCHOKE),
            WireMessage::Interested => put_bare(&mut buf, Self::INTERESTED),
            WireMessage::NotInterested => put_bare(&mut buf, Self::NOT_INTERESTED),
            WireMessage::Have { index } => {
                buf.put_u32(5);
                buf.put_u8(Self::HAVE);
                buf.put_u32(*index);
            }
            WireMessage::Bitfield { bitfield } => {
                buf.put_u32((1 + bitfield.len()) as u32);
                buf.put_u8(Self::BITFIELD);
                buf.put_slice(bitfield);
            }
            WireMessage::Request { block } => put_block(&mut buf, Self::REQUEST, block),
            WireMessage::Piece { index, begin, data } => {
                buf.put_u32((9 + data.len()) as u32);
                buf.put_u8(Self::PIECE);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            WireMessage::Cancel { block } => put_block(&mut buf, Self::CANCEL, block),
        }

        buf.to_vec()
    }

    /// Short name for logging; payloads are never printed.
    pub fn name(&self) -> &'static str {
        match self {
            WireMessage::KeepAlive => "keep-alive",
            WireMessage::Choke => "choke",
            WireMessage::Unchoke => "unchoke",
            WireMessage::Interested => "interested",
            WireMessage::NotInterested => "not interested",
            WireMessage::Have { .. } => "have",
            WireMessage::Bitfield { .. } => "bitfield",
            WireMessage::Request { .. } => "request",
            WireMessage::Piece { .. } => "piece",
            WireMessage::Cancel { .. } => "cancel",
        }
    }

    /// Parse one frame body (everything after the length prefix). An empty
    /// body is a keep-alive.
    pub fn from_frame(frame: &[u8]) -> Result<Self, PeerError> {
        if frame.is_empty() {
            return Ok(WireMessage::KeepAlive);
        }

        let id = frame[0];
        let mut payload = &frame[1..];
        let malformed = || PeerError::MalformedMessage {
            id,
            length: frame.len() - 1,
        };

        let message = match id {
            Self::CHOKE | Self::UNCHOKE | Self::INTERESTED | Self::NOT_INTERESTED => {
                if !payload.is_empty() {
                    return Err(malformed());
                }
                match id {
                    Self::CHOKE => WireMessage::Choke,
                    Self::UNCHOKE => WireMessage::Unchoke,
                    Self::INTERESTED => WireMessage::Interested,
                    _ => WireMessage::NotInterested,
                }
            }
            Self::HAVE => {
                if payload.len() != 4 {
                    return Err(malformed());
                }
                WireMessage::Have {
                    index: payload.get_u32(),
                }
            }
            Self::BITFIELD => WireMessage::Bitfield {
                bitfield: payload.to_vec(),
            },
            Self::REQUEST | Self::CANCEL => {
                if payload.len() != 12 {
                    return Err(malformed());
                }
                let block = BlockRequest {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                };
                if id == Self::REQUEST {
                    WireMessage::Request { block }
                } else {
                    WireMessage::Cancel { block }
                }
            }
            Self::PIECE => {
                if payload.len() < 8 {
                    return Err(malformed());
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                WireMessage::Piece {
                    index,
                    begin,
                    data: payload.to_vec(),
                }
            }
            other => return Err(PeerError::UnknownMessageType(other)),
        };

        Ok(message)
    }
}

fn put_bare(buf: &mut BytesMut, id: u8) {
    buf.put_u32(1);
    buf.put_u8(id);
}

fn put_block(buf: &mut BytesMut, id: u8, block: &BlockRequest) {
    buf.put_u32(13);
    buf.put_u8(id);
    buf.put_u32(block.index);
    buf.put_u32(block.begin);
    buf.put_u32(block.length);
}

/// Read one length-prefixed message.
pub async fn read_message<R>(reader: &mut R) -> Result<WireMessage, PeerError>
where
    R: AsyncRead + Unpin,
{
    let mut length_buf = [0u8; 4];
    read_exact_or_closed(reader, &mut length_buf).await?;

    let length = u32::from_be_bytes(length_buf) as usize;
    if length > MAX_FRAME_LEN {
        return Err(PeerError::FrameTooLarge(length));
    }

    let mut frame = vec![0u8; length];
    read_exact_or_closed(reader, &mut frame).await?;
    WireMessage::from_frame(&frame)
}

/// Write one message and flush it.
pub async fn write_message<W>(writer: &mut W, message: &WireMessage) -> Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), PeerError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(PeerError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}
