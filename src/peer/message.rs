use super::error::PeerError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// The handshake both sides exchange before any framed messages:
/// `<1-byte len><19-byte protocol label><8 reserved><20-byte info hash>
/// <20-byte peer id>`.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            info_hash,
            peer_id,
            reserved: [0u8; 8],
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake);
        }

        if data[0] as usize != PROTOCOL.len() || &data[1..20] != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// A peer wire message.
///
/// The wire form is a 4-byte big-endian length prefix followed by a
/// 1-byte message id and the payload; a zero-length frame is a
/// keep-alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
}

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;

impl Message {
    /// Encodes the message with its length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => put_bare(&mut buf, ID_CHOKE),
            Message::Unchoke => put_bare(&mut buf, ID_UNCHOKE),
            Message::Interested => put_bare(&mut buf, ID_INTERESTED),
            Message::NotInterested => put_bare(&mut buf, ID_NOT_INTERESTED),
            Message::Have { piece } => {
                buf.put_u32(5);
                buf.put_u8(ID_HAVE);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(ID_BITFIELD);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => put_triple(&mut buf, ID_REQUEST, *index, *begin, *length),
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(ID_PIECE);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => put_triple(&mut buf, ID_CANCEL, *index, *begin, *length),
        }

        buf.freeze()
    }

    /// Decodes a frame body (the bytes after the length prefix).
    ///
    /// An empty body is a keep-alive. Unknown message ids and truncated
    /// payloads are protocol errors.
    pub fn decode(mut body: Bytes) -> Result<Self, PeerError> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = body.get_u8();

        match id {
            ID_CHOKE => expect_empty(&body, Message::Choke),
            ID_UNCHOKE => expect_empty(&body, Message::Unchoke),
            ID_INTERESTED => expect_empty(&body, Message::Interested),
            ID_NOT_INTERESTED => expect_empty(&body, Message::NotInterested),
            ID_HAVE => {
                if body.remaining() != 4 {
                    return Err(PeerError::Malformed("have"));
                }
                Ok(Message::Have {
                    piece: body.get_u32(),
                })
            }
            ID_BITFIELD => Ok(Message::Bitfield(body)),
            ID_REQUEST => {
                let (index, begin, length) = get_triple(&mut body, "request")?;
                Ok(Message::Request {
                    index,
                    begin,
                    length,
                })
            }
            ID_PIECE => {
                if body.remaining() < 8 {
                    return Err(PeerError::Malformed("piece"));
                }
                let index = body.get_u32();
                let begin = body.get_u32();
                Ok(Message::Piece {
                    index,
                    begin,
                    data: body,
                })
            }
            ID_CANCEL => {
                let (index, begin, length) = get_triple(&mut body, "cancel")?;
                Ok(Message::Cancel {
                    index,
                    begin,
                    length,
                })
            }
            other => Err(PeerError::UnknownMessageId(other)),
        }
    }
}

fn put_bare(buf: &mut BytesMut, id: u8) {
    buf.put_u32(1);
    buf.put_u8(id);
}

fn put_triple(buf: &mut BytesMut, id: u8, index: u32, begin: u32, length: u32) {
    buf.put_u32(13);
    buf.put_u8(id);
    buf.put_u32(index);
    buf.put_u32(begin);
    buf.put_u32(length);
}

fn get_triple(body: &mut Bytes, what: &'static str) -> Result<(u32, u32, u32), PeerError> {
    if body.remaining() != 12 {
        return Err(PeerError::Malformed(what));
    }
    Ok((body.get_u32(), body.get_u32(), body.get_u32()))
}

fn expect_empty(body: &Bytes, message: Message) -> Result<Message, PeerError> {
    if body.has_remaining() {
        return Err(PeerError::Malformed("unexpected payload"));
    }
    Ok(message)
}
