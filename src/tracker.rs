//! # Tracker Client
//!
//! This module announces a torrent to its HTTP(S) tracker and parses the
//! peer list out of the bencoded response.
//!
//! ## Announce Request
//!
//! The announce is a GET request against the torrent's announce URL with the
//! standard query parameters: the binary `info_hash` and `peer_id` are
//! percent-encoded byte by byte, `left` carries the total content size, and
//! `compact=1` asks for the packed 6-byte peer format.
//!
//! ## Announce Response
//!
//! The response is a bencoded dictionary with an `interval` (seconds until
//! the next announce) and a `peers` byte string in compact format. A
//! `failure reason` key replaces both when the tracker rejects the request.

use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::bencode::Parser;
use crate::peer::{parse_compact_peers, Peer};
use crate::torrent::TorrentDescriptor;

// How long to wait for a tracker before giving up
const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

/// The tracker's reply to an announce.
#[derive(Debug, Clone)]
pub struct AnnounceResult {
    /// Seconds until the tracker expects the next announce
    pub interval: u64,
    /// Peers that can serve the torrent's content
    pub peers: Vec<Peer>,
}

/// Errors produced while announcing to a tracker.
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("could not parse tracker url `{0}`")]
    InvalidUrl(String),
    #[error("tracker request failed")]
    Request(#[source] reqwest::Error),
    #[error("tracker refused the announce: {0}")]
    Refused(String),
    #[error("could not decode tracker response")]
    InvalidResponse,
    #[error("tracker returned no peers")]
    NoPeers,
}

/// Peer discovery service for a torrent.
pub trait Tracker: Send + Sync {
    /// Announce ourselves and fetch the current peer list.
    fn announce(
        &self,
        descriptor: &TorrentDescriptor,
        peer_id: &[u8; 20],
        port: u16,
    ) -> Result<AnnounceResult, TrackerError>;
}

/// Tracker client over blocking HTTP.
#[derive(Default)]
pub struct HttpTracker;

impl Tracker for HttpTracker {
    fn announce(
        &self,
        descriptor: &TorrentDescriptor,
        peer_id: &[u8; 20],
        port: u16,
    ) -> Result<AnnounceResult, TrackerError> {
        let url = build_announce_url(descriptor, peer_id, port)?;

        // Build blocking HTTP client
        let client = reqwest::blocking::Client::builder()
            .timeout(TRACKER_TIMEOUT)
            .build()
            .map_err(TrackerError::Request)?;

        // Send GET request to the tracker
        let response = client
            .get(url)
            .send()
            .and_then(|response| response.bytes())
            .map_err(TrackerError::Request)?;

        parse_announce_response(&response)
    }
}

/// Build the full announce URL for a descriptor.
fn build_announce_url(
    descriptor: &TorrentDescriptor,
    peer_id: &[u8; 20],
    port: u16,
) -> Result<String, TrackerError> {
    // Parse tracker URL from the descriptor
    let base_url = Url::parse(&descriptor.announce_url)
        .map_err(|_| TrackerError::InvalidUrl(descriptor.announce_url.clone()))?;

    // Build the query string manually so the binary fields survive intact
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
        percent_encode_binary(&descriptor.info_hash),
        percent_encode_binary(peer_id),
        port,
        descriptor.length
    );

    let mut url = base_url.to_string();
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(&query);

    Ok(url)
}

/// Percent-encode raw bytes as `%XX` pairs.
fn percent_encode_binary(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0f) as usize] as char);
    }

    encoded
}

/// Decode the bencoded announce response into interval and peers.
fn parse_announce_response(response: &[u8]) -> Result<AnnounceResult, TrackerError> {
    let root = Parser::new()
        .decode(response)
        .map_err(|_| TrackerError::InvalidResponse)?;
    let root = root.as_dict().ok_or(TrackerError::InvalidResponse)?;

    if let Some(reason) = root.get(&b"failure reason"[..]) {
        let reason = reason.as_str().unwrap_or("unknown reason");
        return Err(TrackerError::Refused(reason.to_string()));
    }

    let interval = root
        .get(&b"interval"[..])
        .and_then(|value| value.as_int())
        .filter(|interval| *interval >= 0)
        .ok_or(TrackerError::InvalidResponse)? as u64;

    let peers = parse_compact_peers(
        root.get(&b"peers"[..])
            .and_then(|value| value.as_bytes())
            .ok_or(TrackerError::InvalidResponse)?,
    )
    .map_err(|_| TrackerError::InvalidResponse)?;

    if peers.is_empty() {
        return Err(TrackerError::NoPeers);
    }

    Ok(AnnounceResult { interval, peers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{encode, BencodeValue};
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    fn descriptor() -> TorrentDescriptor {
        TorrentDescriptor {
            announce_url: "http://tracker.local/announce".to_string(),
            info_hash: [0x12; 20],
            piece_length: 32,
            piece_hashes: vec![[0; 20]; 2],
            files: Vec::new(),
            name: "test".to_string(),
            length: 64,
        }
    }

    #[test]
    fn percent_encodes_every_byte() {
        assert_eq!(percent_encode_binary(&[0x00, 0x7f, 0xff]), "%00%7F%FF");
    }

    #[test]
    fn builds_the_announce_url() {
        let url = build_announce_url(&descriptor(), &[0xab; 20], 6881).unwrap();

        assert!(url.starts_with("http://tracker.local/announce?info_hash=%12"));
        assert!(url.contains("&peer_id=%AB"));
        assert!(url.contains("&port=6881"));
        assert!(url.contains("&left=64"));
        assert!(url.contains("&compact=1"));
    }

    #[test]
    fn keeps_existing_query_parameters() {
        let mut descriptor = descriptor();
        descriptor.announce_url = "http://tracker.local/announce?key=1".to_string();

        let url = build_announce_url(&descriptor, &[0xab; 20], 6881).unwrap();
        assert!(url.starts_with("http://tracker.local/announce?key=1&info_hash="));
    }

    #[test]
    fn parses_the_announce_response() {
        let mut root = BTreeMap::new();
        root.insert(b"interval".to_vec(), BencodeValue::Integer(1800));
        root.insert(
            b"peers".to_vec(),
            BencodeValue::ByteString(vec![10, 0, 0, 1, 0x1a, 0xe1]),
        );

        let result = parse_announce_response(&encode(&BencodeValue::Dict(root))).unwrap();
        assert_eq!(result.interval, 1800);
        assert_eq!(result.peers, vec![Peer::new(Ipv4Addr::new(10, 0, 0, 1), 6881)]);
    }

    #[test]
    fn surfaces_tracker_failures() {
        let mut root = BTreeMap::new();
        root.insert(
            b"failure reason".to_vec(),
            BencodeValue::ByteString(b"unregistered torrent".to_vec()),
        );

        match parse_announce_response(&encode(&BencodeValue::Dict(root))) {
            Err(TrackerError::Refused(reason)) => {
                assert_eq!(reason, "unregistered torrent")
            }
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_peer_lists() {
        let mut root = BTreeMap::new();
        root.insert(b"interval".to_vec(), BencodeValue::Integer(1800));
        root.insert(b"peers".to_vec(), BencodeValue::ByteString(Vec::new()));

        assert!(matches!(
            parse_announce_response(&encode(&BencodeValue::Dict(root))),
            Err(TrackerError::NoPeers)
        ));
    }
}
