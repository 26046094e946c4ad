//! # Peer Wire Codec
//!
//! This module serializes and parses the messages of the BitTorrent peer
//! wire protocol. Only the codec lives here; connection handling and the
//! download loop are in the `downloader` module.
//!
//! ## Handshake
//!
//! A fixed-layout message exchanged immediately after the TCP connection:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte, length of the protocol string (19)
//! - **pstr**: "BitTorrent protocol"
//! - **reserved**: 8 zero bytes
//! - **info_hash**: 20 bytes identifying the torrent
//! - **peer_id**: 20 bytes identifying the peer
//!
//! ## Messages
//!
//! Every subsequent message is length-prefixed:
//!
//! ```text
//! <length: u32 big-endian><id: u8><payload>
//! ```
//!
//! A length of zero is a keep-alive with no id or payload.
//!
//! | ID | Message | Payload |
//! |----|---------|---------|
//! | 0 | Choke | none |
//! | 1 | Unchoke | none |
//! | 2 | Interested | none |
//! | 3 | NotInterested | none |
//! | 4 | Have | piece index |
//! | 5 | Bitfield | piece availability bits |
//! | 6 | Request | index, begin, length |
//! | 7 | Piece | index, begin, block bytes |
//! | 8 | Cancel | index, begin, length |

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

/// Standard protocol identifier exchanged in the handshake.
pub const PROTOCOL_ID: &str = "BitTorrent protocol";

/// Errors produced while parsing wire data.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("message is truncated")]
    Truncated,
    #[error("unknown message id {0}")]
    UnknownId(u8),
    #[error("handshake is malformed")]
    BadHandshake,
}

/// The handshake exchanged right after connecting to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// SHA-1 of the torrent's info dictionary
    pub info_hash: [u8; 20],
    /// Unique identifier of the sending peer
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Build a new handshake.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake { info_hash, peer_id }
    }

    /// Serialize into the 68-byte wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let pstr = PROTOCOL_ID.as_bytes();

        let mut buf = Vec::with_capacity(49 + pstr.len());
        buf.push(pstr.len() as u8);
        buf.extend_from_slice(pstr);
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        buf
    }

    /// Parse the body of a received handshake.
    ///
    /// # Arguments
    ///
    /// * `pstr_len` - Protocol string length taken from the first byte.
    /// * `body` - The remaining `pstr_len + 48` bytes.
    pub fn parse(pstr_len: usize, body: &[u8]) -> Result<Handshake, WireError> {
        if pstr_len == 0 || body.len() != pstr_len + 48 {
            return Err(WireError::BadHandshake);
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&body[pstr_len + 8..pstr_len + 28]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&body[pstr_len + 28..pstr_len + 48]);

        Ok(Handshake { info_hash, peer_id })
    }
}

/// One message of the peer wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// The peer now has the piece at this index
    Have(u32),
    /// Compact availability map, one bit per piece, MSB first
    Bitfield(Vec<u8>),
    /// Ask for `length` bytes of piece `index` starting at `begin`
    Request { index: u32, begin: u32, length: u32 },
    /// Block of data answering a request
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// Withdraw a pending request
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// Serialize with the length prefix.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Assemble id + payload first, the prefix is its length
        let mut body = Vec::new();
        match self {
            Message::KeepAlive => {}
            Message::Choke => body.push(0),
            Message::Unchoke => body.push(1),
            Message::Interested => body.push(2),
            Message::NotInterested => body.push(3),
            Message::Have(index) => {
                body.push(4);
                body.extend_from_slice(&index.to_be_bytes());
            }
            Message::Bitfield(bits) => {
                body.push(5);
                body.extend_from_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                body.push(6);
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                body.push(7);
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(block);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                body.push(8);
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
            }
        }

        let mut buf = Vec::with_capacity(4 + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);
        buf
    }

    /// Parse a message body (everything after the length prefix).
    ///
    /// An empty body is a keep-alive.
    pub fn parse(body: &[u8]) -> Result<Message, WireError> {
        let Some((&id, payload)) = body.split_first() else {
            return Ok(Message::KeepAlive);
        };

        match id {
            0 => Ok(Message::Choke),
            1 => Ok(Message::Unchoke),
            2 => Ok(Message::Interested),
            3 => Ok(Message::NotInterested),
            4 => Ok(Message::Have(read_u32(payload)?)),
            5 => Ok(Message::Bitfield(payload.to_vec())),
            6 => {
                let mut cursor = Cursor::new(payload);
                Ok(Message::Request {
                    index: cursor.read_u32::<BigEndian>().map_err(|_| WireError::Truncated)?,
                    begin: cursor.read_u32::<BigEndian>().map_err(|_| WireError::Truncated)?,
                    length: cursor.read_u32::<BigEndian>().map_err(|_| WireError::Truncated)?,
                })
            }
            7 => {
                if payload.len() < 8 {
                    return Err(WireError::Truncated);
                }
                let mut cursor = Cursor::new(&payload[..8]);
                Ok(Message::Piece {
                    index: cursor.read_u32::<BigEndian>().map_err(|_| WireError::Truncated)?,
                    begin: cursor.read_u32::<BigEndian>().map_err(|_| WireError::Truncated)?,
                    block: payload[8..].to_vec(),
                })
            }
            8 => {
                let mut cursor = Cursor::new(payload);
                Ok(Message::Cancel {
                    index: cursor.read_u32::<BigEndian>().map_err(|_| WireError::Truncated)?,
                    begin: cursor.read_u32::<BigEndian>().map_err(|_| WireError::Truncated)?,
                    length: cursor.read_u32::<BigEndian>().map_err(|_| WireError::Truncated)?,
                })
            }
            id => Err(WireError::UnknownId(id)),
        }
    }
}

fn read_u32(payload: &[u8]) -> Result<u32, WireError> {
    let mut cursor = Cursor::new(payload);
    cursor.read_u32::<BigEndian>().map_err(|_| WireError::Truncated)
}

/// Check a piece index against a bitfield.
///
/// Bit 7 of byte 0 is piece 0; indexes past the end of the bitfield read as
/// missing.
pub fn bitfield_has_piece(bitfield: &[u8], index: u32) -> bool {
    let byte_index = (index / 8) as usize;
    let offset = index % 8;

    match bitfield.get(byte_index) {
        Some(byte) => byte >> (7 - offset) & 1 != 0,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trip() {
        let handshake = Handshake::new([0x12; 20], [0x34; 20]);
        let bytes = handshake.to_bytes();

        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0] as usize, PROTOCOL_ID.len());

        let parsed = Handshake::parse(bytes[0] as usize, &bytes[1..]).unwrap();
        assert_eq!(parsed, handshake);
    }

    #[test]
    fn handshake_rejects_short_bodies() {
        assert_eq!(
            Handshake::parse(19, &[0u8; 10]),
            Err(WireError::BadHandshake)
        );
    }

    #[test]
    fn messages_round_trip() {
        let messages = [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(7),
            Message::Bitfield(vec![0b1010_0000]),
            Message::Request {
                index: 1,
                begin: 16384,
                length: 16384,
            },
            Message::Piece {
                index: 1,
                begin: 0,
                block: vec![1, 2, 3],
            },
            Message::Cancel {
                index: 2,
                begin: 0,
                length: 16384,
            },
        ];

        for message in messages {
            let bytes = message.to_bytes();
            // Skip the 4-byte length prefix when parsing back
            assert_eq!(Message::parse(&bytes[4..]), Ok(message));
        }
    }

    #[test]
    fn empty_body_is_keep_alive() {
        assert_eq!(Message::parse(&[]), Ok(Message::KeepAlive));
        assert_eq!(Message::KeepAlive.to_bytes(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn rejects_unknown_ids_and_truncated_payloads() {
        assert_eq!(Message::parse(&[42]), Err(WireError::UnknownId(42)));
        assert_eq!(Message::parse(&[7, 0, 0]), Err(WireError::Truncated));
        assert_eq!(Message::parse(&[6, 0, 0, 0, 1]), Err(WireError::Truncated));
    }

    #[test]
    fn bitfield_lookup() {
        let bitfield = [0b1000_0010, 0b0100_0000];

        assert!(bitfield_has_piece(&bitfield, 0));
        assert!(bitfield_has_piece(&bitfield, 6));
        assert!(bitfield_has_piece(&bitfield, 9));
        assert!(!bitfield_has_piece(&bitfield, 1));
        // Past the end of the bitfield reads as missing
        assert!(!bitfield_has_piece(&bitfield, 99));
    }
}
