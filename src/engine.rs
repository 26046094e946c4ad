//! # Download Engine
//!
//! This module coordinates the whole download: a registry of torrents, a
//! policy-driven task queue, and a pool of long-running worker threads.
//!
//! ## Architecture
//!
//! - **Registry**: a reader/writer-locked map from torrent id to per-torrent
//!   state (descriptor, peer swarm, scores, progress, lifecycle state).
//!   Adding or removing a torrent takes the write lock; workers only ever
//!   take the read lock and bump atomics.
//! - **Task queue**: one [`PieceTask`] per piece, extracted LIFO by default.
//! - **Workers**: one thread per available core (minus one), each looping
//!   extract → pick peer → download → verify → persist until the engine is
//!   dropped.
//!
//! ## Peer Selection
//!
//! Each peer carries an integer score starting at a baseline. A successful
//! download attributed to a peer raises its score; workers sample peers from
//! the score-weighted distribution, so the swarm drifts toward peers that
//! actually serve us without any explicit ban logic.
//!
//! ## Lifecycle
//!
//! ```text
//!         add_torrent
//! Loading ───────────► Downloading ── all pieces done ──► Completed
//!    │                     │
//!    │                     ├── remove_torrent ──► Stopped
//!    │                     ├── pause ─► Paused ──resume──► Downloading
//!    │                     └── retries exhausted ──► Error
//! ```
//!
//! Completed, Stopped and Error are terminal. A torrent that errors or is
//! removed has its queued tasks purged before its state changes, so no
//! worker picks up work for a dead torrent.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use boring::sha::Sha1;
use log::{debug, error, info, trace, warn};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use thiserror::Error;

use crate::config::Config;
use crate::downloader::{PieceDownloader, TcpDownloader};
use crate::peer::Peer;
use crate::piece::Piece;
use crate::queue::{ExtractError, LifoPolicy, TaskQueue};
use crate::storage::{DiskStorage, Storage, StorageError};
use crate::torrent::{TorrentDescriptor, TorrentParseError};
use crate::tracker::{HttpTracker, Tracker, TrackerError};

/// Identifier of a torrent within one engine, never reused.
pub type TorrentID = u64;

// Port advertised to trackers
const LISTEN_PORT: u16 = 6881;

// Score every peer starts with, so new peers stay sampleable
const PEER_SCORE_BASELINE: u64 = 1;

// Score added per successful download attributed to a peer
const PEER_SCORE_REWARD: u64 = 1;

/// Lifecycle state of one torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TorrentState {
    /// Being parsed and announced
    Loading = 0,
    /// Pieces are queued or in flight
    Downloading = 1,
    /// Tasks are bounced back to the queue without consuming retries
    Paused = 2,
    /// Removed before completing
    Stopped = 3,
    /// Every piece downloaded and persisted
    Completed = 4,
    /// A piece exhausted its retry budget
    Error = 5,
}

impl TorrentState {
    /// Whether no further transitions can happen from this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TorrentState::Stopped | TorrentState::Completed | TorrentState::Error
        )
    }

    fn from_u8(raw: u8) -> TorrentState {
        match raw {
            0 => TorrentState::Loading,
            1 => TorrentState::Downloading,
            2 => TorrentState::Paused,
            3 => TorrentState::Stopped,
            4 => TorrentState::Completed,
            _ => TorrentState::Error,
        }
    }
}

/// Atomic cell holding a [`TorrentState`].
struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(state: TorrentState) -> AtomicState {
        AtomicState(AtomicU8::new(state as u8))
    }

    fn load(&self) -> TorrentState {
        TorrentState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: TorrentState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Transition from `current` to `new`; returns whether it happened.
    fn transition(&self, current: TorrentState, new: TorrentState) -> bool {
        self.0
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}

/// One piece of one torrent, waiting in the queue.
///
/// Tasks reference their torrent by id only, so their lifetime is
/// independent of the torrent's and removal is a simple queue purge.
#[derive(Debug, Clone)]
pub struct PieceTask {
    /// Torrent the piece belongs to
    pub tid: TorrentID,
    /// The piece to download
    pub piece: Piece,
}

/// Progress snapshot of one torrent, for display front-ends.
#[derive(Debug, Clone)]
pub struct TorrentGuiData {
    pub tid: TorrentID,
    pub state: TorrentState,
    pub name: String,
    pub pieces_processed: usize,
    pub pieces_count: usize,
}

/// Peer list and per-peer scores of one torrent.
///
/// The vector layout is fixed once built; scores are atomics so workers can
/// bump them while only holding read locks.
struct Swarm {
    peers: Vec<Peer>,
    scores: Vec<AtomicU64>,
}

/// Registry entry of one torrent.
struct Torrent {
    descriptor: Arc<TorrentDescriptor>,
    swarm: RwLock<Swarm>,
    pieces_processed: AtomicUsize,
    state: AtomicState,
}

impl Torrent {
    fn new(descriptor: Arc<TorrentDescriptor>, peers: Vec<Peer>) -> Torrent {
        let scores = peers
            .iter()
            .map(|_| AtomicU64::new(PEER_SCORE_BASELINE))
            .collect();

        Torrent {
            descriptor,
            swarm: RwLock::new(Swarm { peers, scores }),
            pieces_processed: AtomicUsize::new(0),
            state: AtomicState::new(TorrentState::Loading),
        }
    }

    /// Copy out the peers and their current score weights.
    fn snapshot_swarm(&self) -> (Vec<Peer>, Vec<u64>) {
        let swarm = self.swarm.read().unwrap();
        let weights = swarm
            .scores
            .iter()
            .map(|score| score.load(Ordering::Relaxed))
            .collect();
        (swarm.peers.clone(), weights)
    }

    /// Credit the peer at `index` for a successful download.
    fn reward_peer(&self, index: usize) {
        let swarm = self.swarm.read().unwrap();
        if let Some(score) = swarm.scores.get(index) {
            score.fetch_add(PEER_SCORE_REWARD, Ordering::Relaxed);
        }
    }

    fn gui_data(&self, tid: TorrentID) -> TorrentGuiData {
        TorrentGuiData {
            tid,
            state: self.state.load(),
            name: self.descriptor.name.clone(),
            pieces_processed: self.pieces_processed.load(Ordering::Relaxed),
            pieces_count: self.descriptor.pieces_count(),
        }
    }
}

/// Why a torrent could not be loaded.
#[derive(Error, Debug)]
pub enum LoadingError {
    #[error("could not read torrent file")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] TorrentParseError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// Errors surfaced by the engine's public operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to load torrent")]
    LoadingTorrentFailed(#[from] LoadingError),
}

/// State shared between the engine handle and its worker threads.
struct Shared {
    config: Config,
    peer_id: [u8; 20],
    torrents: RwLock<HashMap<TorrentID, Torrent>>,
    tasks: TaskQueue<PieceTask>,
    next_tid: AtomicU64,
    alive: AtomicBool,
    tracker: Arc<dyn Tracker>,
    downloader: Arc<dyn PieceDownloader>,
    storage: Arc<dyn Storage>,
}

impl Shared {
    /// Purge a torrent's tasks and mark it errored.
    ///
    /// The queue is cleaned first, under its own mutex only, so no worker
    /// can pick up a task for the torrent after the state flips to Error.
    fn torrent_error(&self, tid: TorrentID) {
        self.tasks.mutate(|task| task.tid == tid);

        let torrents = self.torrents.read().unwrap();
        if let Some(torrent) = torrents.get(&tid) {
            torrent.state.store(TorrentState::Error);
        }
    }
}

/// Multi-torrent download engine.
///
/// Dropping the engine stops the worker pool: the alive flag is cleared,
/// blocked workers are woken, and every thread is joined. In-flight
/// downloads finish or fail on their own and their results are discarded.
pub struct Engine {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Build an engine with the production collaborators: HTTP tracker,
    /// TCP wire downloader and on-disk storage.
    pub fn new(config: Config) -> Engine {
        let peer_id = generate_peer_id();
        Engine::build(
            config,
            peer_id,
            Arc::new(HttpTracker),
            Arc::new(TcpDownloader::new(peer_id)),
            Arc::new(DiskStorage),
        )
    }

    /// Build an engine with injected collaborators.
    pub fn with_collaborators(
        config: Config,
        tracker: Arc<dyn Tracker>,
        downloader: Arc<dyn PieceDownloader>,
        storage: Arc<dyn Storage>,
    ) -> Engine {
        Engine::build(config, generate_peer_id(), tracker, downloader, storage)
    }

    fn build(
        config: Config,
        peer_id: [u8; 20],
        tracker: Arc<dyn Tracker>,
        downloader: Arc<dyn PieceDownloader>,
        storage: Arc<dyn Storage>,
    ) -> Engine {
        let worker_count = config.worker_count();

        let shared = Arc::new(Shared {
            config,
            peer_id,
            torrents: RwLock::new(HashMap::new()),
            tasks: TaskQueue::new(),
            next_tid: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            tracker,
            downloader,
            storage,
        });

        info!("Launching {} worker threads", worker_count);

        let workers = (0..worker_count)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || worker_main(shared, index))
            })
            .collect();

        Engine { shared, workers }
    }

    /// Load a `.torrent` file, announce it, and start downloading.
    ///
    /// Returns the id under which the torrent is registered. Read, decode,
    /// parse and announce failures all surface as
    /// [`EngineError::LoadingTorrentFailed`].
    pub fn add_torrent(&self, path: &Path) -> Result<TorrentID, EngineError> {
        let tid = self.shared.next_tid.fetch_add(1, Ordering::Relaxed);

        match self.load_torrent(tid, path) {
            Ok(()) => Ok(tid),
            Err(err) => {
                error!("Error loading T{} [{}]: {}", tid, path.display(), err);
                Err(EngineError::LoadingTorrentFailed(err))
            }
        }
    }

    fn load_torrent(&self, tid: TorrentID, path: &Path) -> Result<(), LoadingError> {
        let shared = &self.shared;

        let buf = fs::read(path)?;
        let descriptor = Arc::new(TorrentDescriptor::parse(&buf)?);

        info!("Announcing T{} to tracker at {}", tid, descriptor.announce_url);
        let announce = shared
            .tracker
            .announce(&descriptor, &shared.peer_id, LISTEN_PORT)?;
        for peer in &announce.peers {
            debug!("T{} peer: {}", tid, peer);
        }

        {
            let mut torrents = shared.torrents.write().unwrap();
            torrents.insert(tid, Torrent::new(Arc::clone(&descriptor), announce.peers));
        }

        // Downloading must be set before the first task can complete, or the
        // completion transition would not fire for a tiny torrent
        {
            let torrents = shared.torrents.read().unwrap();
            if let Some(torrent) = torrents.get(&tid) {
                torrent.state.store(TorrentState::Downloading);
            }
        }

        info!(
            "Generating {} piece tasks for T{}",
            descriptor.pieces_count(),
            tid
        );
        for piece in descriptor.pieces() {
            shared.tasks.insert(PieceTask { tid, piece });
        }

        Ok(())
    }

    /// Stop a torrent and drop its queued tasks.
    ///
    /// The torrent stays listed; its state becomes Stopped unless it already
    /// finished as Completed or Error.
    pub fn remove_torrent(&self, tid: TorrentID) {
        // Purge this torrent's tasks before touching its state
        self.shared.tasks.mutate(|task| task.tid == tid);

        let torrents = self.shared.torrents.read().unwrap();
        if let Some(torrent) = torrents.get(&tid) {
            let state = torrent.state.load();
            if state != TorrentState::Completed && state != TorrentState::Error {
                torrent.state.store(TorrentState::Stopped);
            }
        }
    }

    /// Pause a downloading torrent. Returns whether the transition happened.
    ///
    /// Queued tasks are not removed; workers bounce them back to the queue
    /// without consuming any retry budget until the torrent resumes.
    pub fn pause(&self, tid: TorrentID) -> bool {
        let torrents = self.shared.torrents.read().unwrap();
        torrents.get(&tid).is_some_and(|torrent| {
            torrent
                .state
                .transition(TorrentState::Downloading, TorrentState::Paused)
        })
    }

    /// Resume a paused torrent. Returns whether the transition happened.
    pub fn resume(&self, tid: TorrentID) -> bool {
        let torrents = self.shared.torrents.read().unwrap();
        torrents.get(&tid).is_some_and(|torrent| {
            torrent
                .state
                .transition(TorrentState::Paused, TorrentState::Downloading)
        })
    }

    /// Progress snapshots of every registered torrent, ordered by id.
    pub fn get_gui_data(&self) -> Vec<TorrentGuiData> {
        let torrents = self.shared.torrents.read().unwrap();

        let mut result = Vec::new();
        for (tid, torrent) in torrents.iter() {
            result.push(torrent.gui_data(*tid));
        }
        result.sort_by_key(|data| data.tid);

        result
    }

    /// Progress snapshot of one torrent.
    pub fn get_gui_data_of(&self, tid: TorrentID) -> Option<TorrentGuiData> {
        let torrents = self.shared.torrents.read().unwrap();
        torrents.get(&tid).map(|torrent| torrent.gui_data(tid))
    }

    /// Current score of every peer of a torrent, in peer-list order.
    pub fn peer_scores(&self, tid: TorrentID) -> Option<Vec<u64>> {
        let torrents = self.shared.torrents.read().unwrap();
        torrents.get(&tid).map(|torrent| torrent.snapshot_swarm().1)
    }

    /// Number of piece tasks currently queued, across all torrents.
    pub fn queued_tasks(&self) -> usize {
        self.shared.tasks.len()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::Release);
        self.shared.tasks.begin_skip_waiting();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Body of every worker thread.
fn worker_main(shared: Arc<Shared>, index: usize) {
    let policy = LifoPolicy;
    let mut rng = rand::thread_rng();

    while shared.alive.load(Ordering::Acquire) {
        match shared.tasks.try_extract(&policy) {
            Ok(task) => process_task(&shared, &mut rng, task),
            Err(ExtractError::Empty) => {
                trace!("worker {:02} is waiting for work, queue is empty", index);
                shared.tasks.wait_work();
            }
            Err(ExtractError::PolicyFailure) => {
                trace!(
                    "worker {:02} is waiting for work, policy extraction returned nothing",
                    index
                );
                shared.tasks.wait_work();
            }
        }
    }
}

/// Download, verify and persist one piece, retrying across peers.
fn process_task<R: Rng>(shared: &Shared, rng: &mut R, task: PieceTask) {
    // Snapshot everything needed under the registry read lock, then release
    // it for the whole download
    let (descriptor, peers, weights, state) = {
        let torrents = shared.torrents.read().unwrap();
        let Some(torrent) = torrents.get(&task.tid) else {
            // Torrent is gone, drop the task
            return;
        };

        let (peers, weights) = torrent.snapshot_swarm();
        (
            Arc::clone(&torrent.descriptor),
            peers,
            weights,
            torrent.state.load(),
        )
    };

    if state == TorrentState::Paused {
        // Bounce the task, no retry budget is consumed
        shared.tasks.insert(task);
        return;
    }
    if state.is_terminal() {
        // Leftover task of a finished torrent
        return;
    }

    let Ok(distribution) = WeightedIndex::new(&weights) else {
        warn!("T{} has no usable peers, setting error!", task.tid);
        shared.torrent_error(task.tid);
        return;
    };

    let mut completed = false;
    let mut attempt = 0;
    while !completed && attempt < shared.config.max_try && shared.alive.load(Ordering::Acquire)
    {
        let peer_index = distribution.sample(rng);
        let peer = &peers[peer_index];

        match shared.downloader.try_download(&descriptor, &task.piece, peer) {
            Ok(data) => {
                if !verify_piece(&task.piece, &data) {
                    debug!(
                        "Piece [{:4}] of T{} from {} failed hash verification",
                        task.piece.index, task.tid, peer
                    );
                    attempt += 1;
                    continue;
                }

                if let Err(err) = save_piece(shared, &task.piece, &data) {
                    warn!(
                        "Error while saving piece [{:4}] of T{}: {}",
                        task.piece.index, task.tid, err
                    );
                    attempt += 1;
                    continue;
                }

                info!(
                    "Downloaded piece [{:4}] of T{} from {}",
                    task.piece.index, task.tid, peer
                );
                finish_piece(shared, task.tid, peer_index);
                completed = true;
            }
            Err(err) => {
                trace!(
                    "Error while downloading piece [{:4}] of T{} from {}: {}",
                    task.piece.index,
                    task.tid,
                    peer,
                    err
                );
                attempt += 1;
            }
        }
    }

    if !completed && shared.alive.load(Ordering::Acquire) {
        warn!("Unable to process piece of T{}, setting error!", task.tid);
        shared.torrent_error(task.tid);
    }
}

/// Check a downloaded buffer against the piece's expected SHA-1.
fn verify_piece(piece: &Piece, data: &[u8]) -> bool {
    if data.len() as u64 != piece.length {
        return false;
    }

    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finish() == piece.hash
}

/// Write every subpiece of a downloaded piece through storage.
fn save_piece(shared: &Shared, piece: &Piece, data: &[u8]) -> Result<(), StorageError> {
    let mut offset = 0usize;
    for subpiece in &piece.subpieces {
        let path = shared.config.download_folder.join(&subpiece.filepath);
        let end = offset + subpiece.len as usize;

        shared
            .storage
            .write_bytes(&path, &data[offset..end], subpiece.file_offset)?;

        offset = end;
    }

    Ok(())
}

/// Account a successfully persisted piece: reward the peer, advance the
/// counter, and complete the torrent when it was the last one.
fn finish_piece(shared: &Shared, tid: TorrentID, peer_index: usize) {
    let torrents = shared.torrents.read().unwrap();
    let Some(torrent) = torrents.get(&tid) else {
        return;
    };

    torrent.reward_peer(peer_index);

    let processed = torrent.pieces_processed.fetch_add(1, Ordering::Relaxed) + 1;
    if processed == torrent.descriptor.pieces_count() {
        torrent
            .state
            .transition(TorrentState::Downloading, TorrentState::Completed);
    }
}

/// Generate a random 20-byte peer id.
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    rand::thread_rng().fill(&mut peer_id[..]);
    peer_id
}
