//! # Peer Information
//!
//! This module defines the `Peer` structure and parses the compact peer
//! format returned by BitTorrent trackers.
//!
//! ## Compact Peer Format
//!
//! The tracker response packs each peer into 6 bytes:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! Both fields are in network byte order (big-endian).

use std::fmt;
use std::io::Cursor;
use std::net::Ipv4Addr;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

// Size of one compact peer entry in bytes
const PEER_SIZE: usize = 6;

/// A remote endpoint believed to hold (parts of) a torrent's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port number for connecting to the peer
    pub port: u16,
}

impl Peer {
    /// Build a new peer.
    pub fn new(ip: Ipv4Addr, port: u16) -> Peer {
        Peer { ip, port }
    }
}

impl fmt::Display for Peer {
    /// Formats the peer as `A.B.C.D:P`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parse a compact peer list from a tracker response.
///
/// # Arguments
///
/// * `compact` - Concatenated 6-byte peer entries.
///
/// # Errors
///
/// Returns an error if the byte length is not a multiple of 6.
pub fn parse_compact_peers(compact: &[u8]) -> Result<Vec<Peer>> {
    // Check tracker peers are valid
    if compact.len() % PEER_SIZE != 0 {
        return Err(anyhow!("received invalid peers from tracker"));
    }

    let mut peers = Vec::with_capacity(compact.len() / PEER_SIZE);
    for entry in compact.chunks_exact(PEER_SIZE) {
        let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);

        let mut port_cursor = Cursor::new(&entry[4..6]);
        let port = port_cursor.read_u16::<BigEndian>()?;

        peers.push(Peer::new(ip, port));
    }

    Ok(peers)
}
