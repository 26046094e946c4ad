//! # Torrent Metadata
//!
//! This module parses `.torrent` files (BitTorrent metainfo) into an
//! immutable descriptor used by the rest of the engine.
//!
//! ## Metainfo Layout
//!
//! A `.torrent` file is a bencoded dictionary:
//!
//! - **announce**: tracker URL for peer discovery
//! - **info**: dictionary describing the content
//!   - **name**: suggested file name (single-file) or root directory
//!     (multi-file)
//!   - **piece length**: size of each piece in bytes
//!   - **pieces**: concatenated 20-byte SHA-1 hashes, one per piece
//!   - **length**: total size (single-file layout), or
//!   - **files**: list of `{length, path}` entries (multi-file layout)
//!
//! ## Info Hash
//!
//! The info-hash identifies the torrent on the network. It is the SHA-1 of
//! the exact bytes encoding the `info` dictionary in the original file, so it
//! is computed here from the byte range the bencode parser recorded, not from
//! a re-encoding.

use std::path::PathBuf;

use boring::sha::Sha1;
use thiserror::Error;

use crate::bencode::{BencodeError, BencodeValue, Parser};

// Size of a SHA-1 hash in bytes
const SHA1_HASH_SIZE: usize = 20;

/// One file of the torrent's content, in layout order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the download folder; multi-file layouts are rooted
    /// under the torrent name
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
}

/// Immutable metadata of one torrent.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentDescriptor {
    /// Tracker URL for peer discovery
    pub announce_url: String,
    /// SHA-1 of the bencoded info dictionary
    pub info_hash: [u8; SHA1_HASH_SIZE],
    /// Size of each piece in bytes (except possibly the last)
    pub piece_length: u64,
    /// One 20-byte SHA-1 hash per piece
    pub piece_hashes: Vec<[u8; SHA1_HASH_SIZE]>,
    /// Content files in layout order
    pub files: Vec<FileEntry>,
    /// Suggested name from the metainfo
    pub name: String,
    /// Total content size in bytes
    pub length: u64,
}

/// Errors produced while building a descriptor from metainfo bytes.
///
/// Decoding failures of the underlying bencode stream keep their own type;
/// everything else is a structural problem in an otherwise well-formed tree.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TorrentParseError {
    #[error(transparent)]
    Bencode(#[from] BencodeError),
    #[error("torrent metainfo is not a dictionary")]
    NotADict,
    #[error("missing required key `{0}`")]
    MissingKey(&'static str),
    #[error("key `{0}` has the wrong type")]
    WrongType(&'static str),
    #[error("key `{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("key `{0}` must be a positive integer")]
    InvalidLength(&'static str),
    #[error("`pieces` length is not a multiple of 20")]
    InvalidPieceHashes,
    #[error("`files` list is empty")]
    NoFiles,
}

impl TorrentDescriptor {
    /// Build a descriptor from the raw bytes of a `.torrent` file.
    pub fn parse(buf: &[u8]) -> Result<TorrentDescriptor, TorrentParseError> {
        let mut parser = Parser::new();
        let root = parser.decode(buf)?;
        let root = root.as_dict().ok_or(TorrentParseError::NotADict)?;

        let announce_url = root
            .get(&b"announce"[..])
            .ok_or(TorrentParseError::MissingKey("announce"))?
            .as_str()
            .ok_or(TorrentParseError::InvalidUtf8("announce"))?
            .to_string();

        let info = root
            .get(&b"info"[..])
            .ok_or(TorrentParseError::MissingKey("info"))?
            .as_dict()
            .ok_or(TorrentParseError::WrongType("info"))?;

        let name = info
            .get(&b"name"[..])
            .ok_or(TorrentParseError::MissingKey("name"))?
            .as_str()
            .ok_or(TorrentParseError::InvalidUtf8("name"))?
            .to_string();

        let piece_length = info
            .get(&b"piece length"[..])
            .ok_or(TorrentParseError::MissingKey("piece length"))?
            .as_int()
            .filter(|len| *len > 0)
            .ok_or(TorrentParseError::InvalidLength("piece length"))?
            as u64;

        let piece_hashes = split_piece_hashes(
            info.get(&b"pieces"[..])
                .ok_or(TorrentParseError::MissingKey("pieces"))?
                .as_bytes()
                .ok_or(TorrentParseError::WrongType("pieces"))?,
        )?;

        // Single-file layout carries `length`, multi-file carries `files`
        let files = match info.get(&b"length"[..]) {
            Some(length) => {
                let length = length
                    .as_int()
                    .filter(|len| *len >= 0)
                    .ok_or(TorrentParseError::InvalidLength("length"))?;
                vec![FileEntry {
                    path: PathBuf::from(&name),
                    length: length as u64,
                }]
            }
            None => parse_file_list(
                info.get(&b"files"[..])
                    .ok_or(TorrentParseError::MissingKey("length"))?,
                &name,
            )?,
        };

        let length = files.iter().map(|file| file.length).sum();

        // Hash the exact byte range of the info dictionary
        let (start, end) = parser
            .dict_span(b"info")
            .ok_or(TorrentParseError::WrongType("info"))?;
        let mut hasher = Sha1::new();
        hasher.update(&buf[start..end]);
        let info_hash = hasher.finish();

        Ok(TorrentDescriptor {
            announce_url,
            info_hash,
            piece_length,
            piece_hashes,
            files,
            name,
            length,
        })
    }

    /// Number of pieces the content is divided into.
    pub fn pieces_count(&self) -> usize {
        self.piece_hashes.len()
    }
}

/// Split the concatenated `pieces` bytes into 20-byte SHA-1 hashes.
fn split_piece_hashes(
    pieces: &[u8],
) -> Result<Vec<[u8; SHA1_HASH_SIZE]>, TorrentParseError> {
    if pieces.len() % SHA1_HASH_SIZE != 0 {
        return Err(TorrentParseError::InvalidPieceHashes);
    }

    let mut hashes = Vec::with_capacity(pieces.len() / SHA1_HASH_SIZE);
    for chunk in pieces.chunks_exact(SHA1_HASH_SIZE) {
        let mut hash = [0u8; SHA1_HASH_SIZE];
        hash.copy_from_slice(chunk);
        hashes.push(hash);
    }

    Ok(hashes)
}

/// Parse the multi-file `files` list, rooting every path under `name/`.
fn parse_file_list(
    value: &BencodeValue,
    name: &str,
) -> Result<Vec<FileEntry>, TorrentParseError> {
    let entries = value.as_list().ok_or(TorrentParseError::WrongType("files"))?;
    if entries.is_empty() {
        return Err(TorrentParseError::NoFiles);
    }

    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry = entry.as_dict().ok_or(TorrentParseError::WrongType("files"))?;

        let length = entry
            .get(&b"length"[..])
            .ok_or(TorrentParseError::MissingKey("length"))?
            .as_int()
            .filter(|len| *len >= 0)
            .ok_or(TorrentParseError::InvalidLength("length"))?;

        let components = entry
            .get(&b"path"[..])
            .ok_or(TorrentParseError::MissingKey("path"))?
            .as_list()
            .ok_or(TorrentParseError::WrongType("path"))?;
        if components.is_empty() {
            return Err(TorrentParseError::WrongType("path"));
        }

        let mut path = PathBuf::from(name);
        for component in components {
            path.push(
                component
                    .as_str()
                    .ok_or(TorrentParseError::InvalidUtf8("path"))?,
            );
        }

        files.push(FileEntry {
            path,
            length: length as u64,
        });
    }

    Ok(files)
}
