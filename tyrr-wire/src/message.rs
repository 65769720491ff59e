use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// A contiguous sub-range of a piece we ask a peer for.
///
/// Ordered by `(piece_index, begin)`; `length` never differs for the same
/// prefix in practice, so the derived lexicographic order is total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Request {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
}

/// Reply to a [`Request`]; the implied length is `data.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub piece_index: u32,
    pub begin: u32,
    pub data: Bytes,
}

impl Response {
    /// The request this response would satisfy.
    pub fn implied_request(&self) -> Request {
        Request {
            piece_index: self.piece_index,
            begin: self.begin,
            length: self.data.len() as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Bytes),
    Request(Request),
    Piece(Response),
    Cancel(Request),
}

mod id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
}

/// Length-prefixed framing: `u32` big-endian length, then `length` payload
/// bytes whose first byte is the message id. `length == 0` is a keep-alive.
///
/// A declared length inconsistent with the id is invalid data and kills the
/// connection; frames with unknown ids are drained and skipped.
#[derive(Debug, Clone, Default)]
pub struct PeerCodec;

/// Upper bound on a single frame; anything larger is treated as garbage
/// rather than buffered.
const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.remaining() < 4 {
                return Ok(None);
            }

            let mut length_bytes = [0u8; 4];
            length_bytes.copy_from_slice(&src[..4]);
            let frame_len = u32::from_be_bytes(length_bytes);

            if frame_len == 0 {
                src.advance(4);
                return Ok(Some(Message::KeepAlive));
            }

            if frame_len > MAX_FRAME_LEN {
                return Err(invalid("frame length out of bounds"));
            }

            if src.remaining() < 4 + frame_len as usize {
                src.reserve(4 + frame_len as usize - src.remaining());
                return Ok(None);
            }

            src.advance(4);
            let msg_id = src.get_u8();
            let payload_len = frame_len as usize - 1;

            let msg = match msg_id {
                id::CHOKE | id::UNCHOKE | id::INTERESTED | id::NOT_INTERESTED => {
                    if payload_len != 0 {
                        return Err(invalid("unexpected payload on flow-control message"));
                    }
                    match msg_id {
                        id::CHOKE => Message::Choke,
                        id::UNCHOKE => Message::Unchoke,
                        id::INTERESTED => Message::Interested,
                        _ => Message::NotInterested,
                    }
                }
                id::HAVE => {
                    if payload_len != 4 {
                        return Err(invalid("have payload must be 4 bytes"));
                    }
                    Message::Have {
                        piece_index: src.get_u32(),
                    }
                }
                id::BITFIELD => Message::Bitfield(src.split_to(payload_len).freeze()),
                id::REQUEST | id::CANCEL => {
                    if payload_len != 12 {
                        return Err(invalid("request payload must be 12 bytes"));
                    }
                    let request = Request {
                        piece_index: src.get_u32(),
                        begin: src.get_u32(),
                        length: src.get_u32(),
                    };
                    if msg_id == id::REQUEST {
                        Message::Request(request)
                    } else {
                        Message::Cancel(request)
                    }
                }
                id::PIECE => {
                    if payload_len < 8 {
                        return Err(invalid("piece payload too short"));
                    }
                    Message::Piece(Response {
                        piece_index: src.get_u32(),
                        begin: src.get_u32(),
                        data: src.split_to(payload_len - 8).freeze(),
                    })
                }
                _ => {
                    // tolerated: drain the frame and try the next one
                    src.advance(payload_len);
                    continue;
                }
            };

            return Ok(Some(msg));
        }
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::KeepAlive => dst.put_u32(0),
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(id::CHOKE);
            }
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(id::UNCHOKE);
            }
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(id::INTERESTED);
            }
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(id::NOT_INTERESTED);
            }
            Message::Have { piece_index } => {
                dst.put_u32(5);
                dst.put_u8(id::HAVE);
                dst.put_u32(piece_index);
            }
            Message::Bitfield(bits) => {
                dst.put_u32(bits.len() as u32 + 1);
                dst.put_u8(id::BITFIELD);
                dst.put_slice(&bits);
            }
            Message::Request(request) => {
                dst.put_u32(13);
                dst.put_u8(id::REQUEST);
                dst.put_u32(request.piece_index);
                dst.put_u32(request.begin);
                dst.put_u32(request.length);
            }
            Message::Piece(response) => {
                dst.put_u32(response.data.len() as u32 + 9);
                dst.put_u8(id::PIECE);
                dst.put_u32(response.piece_index);
                dst.put_u32(response.begin);
                dst.put_slice(&response.data);
            }
            Message::Cancel(request) => {
                dst.put_u32(13);
                dst.put_u8(id::CANCEL);
                dst.put_u32(request.piece_index);
                dst.put_u32(request.begin);
                dst.put_u32(request.length);
            }
        }
        Ok(())
    }
}
