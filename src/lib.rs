//! # Torrus
//!
//! A multi-threaded BitTorrent download engine.
//!
//! ## Features
//!
//! - Hand-written bencode codec with canonicality checks and info-hash
//!   support
//! - Multi-file piece layout with per-file subpiece writes
//! - Fixed worker pool fed by a policy-driven task queue (LIFO by default)
//! - Score-weighted peer selection with bounded per-piece retries
//! - Pause/resume/stop lifecycle per torrent with atomic progress counters
//! - SHA-1 verification of every downloaded piece
//!
//! ## Architecture
//!
//! [`Engine`] owns a registry of torrents and a pool of worker threads.
//! [`Engine::add_torrent`] parses a `.torrent` file into a
//! [`TorrentDescriptor`], announces it to its tracker, and enqueues one task
//! per piece. Workers pull tasks, sample a peer from the score-weighted
//! distribution, download through a [`PieceDownloader`], verify the SHA-1,
//! and persist the bytes through [`Storage`].
//!
//! The tracker, downloader and storage sit behind traits, so the engine can
//! run against stub collaborators in tests and against HTTP/TCP/disk in
//! production.

pub mod bencode;
pub mod config;
pub mod downloader;
pub mod engine;
pub mod peer;
pub mod piece;
pub mod queue;
pub mod storage;
pub mod torrent;
pub mod tracker;
pub mod wire;

pub use config::Config;
pub use downloader::{DownloadError, PieceDownloader, TcpDownloader};
pub use engine::{Engine, EngineError, TorrentGuiData, TorrentID, TorrentState};
pub use peer::Peer;
pub use piece::{Piece, Subpiece};
pub use storage::{DiskStorage, Storage, StorageError};
pub use torrent::{TorrentDescriptor, TorrentParseError};
pub use tracker::{AnnounceResult, HttpTracker, Tracker, TrackerError};
