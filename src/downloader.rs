//! # Piece Downloader
//!
//! This module downloads single pieces from remote peers over the wire
//! protocol.
//!
//! ## Download Process
//!
//! Each call to [`PieceDownloader::try_download`] is one self-contained
//! attempt against one peer:
//!
//! 1. **Connect**: open a TCP connection with a timeout
//! 2. **Handshake**: exchange and validate the protocol handshake
//! 3. **Bitfield**: learn which pieces the peer has, bail out early if the
//!    requested piece is missing
//! 4. **Unchoke/Interested**: ask the peer to serve us
//! 5. **Blocks**: request 16 KiB blocks with up to 5 in flight, assembling
//!    them into the piece buffer
//!
//! The engine owns retry policy and hash verification; a failed attempt here
//! simply returns an error and the engine samples another peer.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};
use log::{debug, trace};
use thiserror::Error;

use crate::peer::Peer;
use crate::piece::Piece;
use crate::torrent::TorrentDescriptor;
use crate::wire::{bitfield_has_piece, Handshake, Message, WireError};

// Maximum number of in-flight block requests per piece
const MAX_INFLIGHT_REQUESTS: u32 = 5;

// Block size requested from peers (16 KiB)
const BLOCK_SIZE: u32 = 16384;

// How long to wait for the TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// Socket timeout during the handshake phase
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// Socket timeout while transferring blocks
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors produced by one download attempt.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("could not connect to peer")]
    Connect(#[source] std::io::Error),
    #[error("peer wire i/o failed")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("peer answered the handshake for a different torrent")]
    InfoHashMismatch,
    #[error("peer did not open with a bitfield")]
    NoBitfield,
    #[error("peer does not have piece {0}")]
    MissingPiece(u32),
    #[error("peer sent a block outside the requested piece")]
    InvalidBlock,
}

/// Downloads one piece from one peer per call.
///
/// Implementations must be thread-safe; every worker thread holds the same
/// instance.
pub trait PieceDownloader: Send + Sync {
    /// Fetch the content of `piece` from `peer`.
    ///
    /// On success the buffer's length equals the piece length. The caller
    /// verifies the SHA-1.
    fn try_download(
        &self,
        descriptor: &TorrentDescriptor,
        piece: &Piece,
        peer: &Peer,
    ) -> Result<Vec<u8>, DownloadError>;
}

/// Wire-protocol downloader over TCP.
pub struct TcpDownloader {
    /// Our 20-byte peer id, sent in every handshake
    peer_id: [u8; 20],
}

impl TcpDownloader {
    /// Build a new downloader announcing itself with `peer_id`.
    pub fn new(peer_id: [u8; 20]) -> TcpDownloader {
        TcpDownloader { peer_id }
    }
}

impl PieceDownloader for TcpDownloader {
    fn try_download(
        &self,
        descriptor: &TorrentDescriptor,
        piece: &Piece,
        peer: &Peer,
    ) -> Result<Vec<u8>, DownloadError> {
        let mut connection = PeerConnection::connect(peer, HANDSHAKE_TIMEOUT)?;
        connection.handshake(descriptor.info_hash, self.peer_id)?;
        connection.read_bitfield()?;

        if !connection.has_piece(piece.index) {
            return Err(DownloadError::MissingPiece(piece.index));
        }

        connection.send(&Message::Unchoke)?;
        connection.send(&Message::Interested)?;

        connection.set_timeout(TRANSFER_TIMEOUT)?;
        connection.download_piece(piece)
    }
}

/// One TCP connection to a remote peer.
struct PeerConnection {
    stream: TcpStream,
    choked: bool,
    bitfield: Vec<u8>,
}

impl PeerConnection {
    /// Open a connection to `peer`.
    fn connect(peer: &Peer, timeout: Duration) -> Result<PeerConnection, DownloadError> {
        let addr = SocketAddr::new(peer.ip.into(), peer.port);
        let stream =
            TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(DownloadError::Connect)?;

        debug!("Connected to peer {}", peer);

        let connection = PeerConnection {
            stream,
            choked: true,
            bitfield: Vec::new(),
        };
        connection.set_timeout(timeout)?;

        Ok(connection)
    }

    fn set_timeout(&self, timeout: Duration) -> Result<(), DownloadError> {
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream.set_write_timeout(Some(timeout))?;
        Ok(())
    }

    /// Exchange handshakes and validate the peer's info-hash.
    fn handshake(
        &mut self,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> Result<(), DownloadError> {
        self.stream
            .write_all(&Handshake::new(info_hash, peer_id).to_bytes())?;

        // First byte announces the protocol string length
        let mut pstr_len = [0u8; 1];
        self.stream.read_exact(&mut pstr_len)?;

        let mut body = vec![0u8; pstr_len[0] as usize + 48];
        self.stream.read_exact(&mut body)?;

        let reply = Handshake::parse(pstr_len[0] as usize, &body)?;
        if reply.info_hash != info_hash {
            return Err(DownloadError::InfoHashMismatch);
        }

        Ok(())
    }

    /// Read the bitfield the peer sends right after the handshake.
    fn read_bitfield(&mut self) -> Result<(), DownloadError> {
        match self.read_message()? {
            Message::Bitfield(bits) => {
                self.bitfield = bits;
                Ok(())
            }
            _ => Err(DownloadError::NoBitfield),
        }
    }

    fn has_piece(&self, index: u32) -> bool {
        bitfield_has_piece(&self.bitfield, index)
    }

    fn send(&mut self, message: &Message) -> Result<(), DownloadError> {
        self.stream.write_all(&message.to_bytes())?;
        Ok(())
    }

    /// Read one length-prefixed message.
    fn read_message(&mut self) -> Result<Message, DownloadError> {
        let len = self.stream.read_u32::<BigEndian>()?;

        let mut body = vec![0u8; len as usize];
        self.stream.read_exact(&mut body)?;

        Ok(Message::parse(&body)?)
    }

    /// Request and assemble every block of `piece`.
    fn download_piece(&mut self, piece: &Piece) -> Result<Vec<u8>, DownloadError> {
        let length = piece.length as u32;
        let mut data = vec![0u8; piece.length as usize];

        let mut requested: u32 = 0;
        let mut downloaded: u32 = 0;
        let mut inflight: u32 = 0;

        while downloaded < length {
            // Keep the request pipeline full while unchoked
            if !self.choked {
                while inflight < MAX_INFLIGHT_REQUESTS && requested < length {
                    let block_size = BLOCK_SIZE.min(length - requested);
                    self.send(&Message::Request {
                        index: piece.index,
                        begin: requested,
                        length: block_size,
                    })?;
                    requested += block_size;
                    inflight += 1;
                }
            }

            match self.read_message()? {
                Message::Choke => {
                    trace!("Peer choked us while downloading piece {}", piece.index);
                    self.choked = true;
                }
                Message::Unchoke => self.choked = false,
                Message::Have(index) => {
                    // Track late availability updates
                    let byte_index = (index / 8) as usize;
                    if byte_index >= self.bitfield.len() {
                        self.bitfield.resize(byte_index + 1, 0);
                    }
                    self.bitfield[byte_index] |= 1 << (7 - index % 8);
                }
                Message::Piece {
                    index,
                    begin,
                    block,
                } => {
                    if index != piece.index
                        || begin as u64 + block.len() as u64 > piece.length
                    {
                        return Err(DownloadError::InvalidBlock);
                    }

                    data[begin as usize..begin as usize + block.len()].copy_from_slice(&block);
                    downloaded += block.len() as u32;
                    inflight = inflight.saturating_sub(1);
                }
                Message::KeepAlive => {}
                other => trace!("Ignoring message {other:?} while downloading"),
            }
        }

        Ok(data)
    }
}
