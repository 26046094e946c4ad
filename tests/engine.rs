//! End-to-end engine scenarios against stub collaborators.
//!
//! The tracker, downloader and storage are replaced with deterministic
//! in-memory implementations, so every scenario exercises the real worker
//! pool, task queue, peer sampling and lifecycle accounting without any
//! network or disk.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use boring::sha::Sha1;

use torrus::bencode::{encode, BencodeValue};
use torrus::downloader::{DownloadError, PieceDownloader};
use torrus::engine::Engine;
use torrus::peer::Peer;
use torrus::piece::Piece;
use torrus::storage::{Storage, StorageError};
use torrus::torrent::TorrentDescriptor;
use torrus::tracker::{AnnounceResult, Tracker, TrackerError};
use torrus::{Config, TorrentState};

/// Deterministic content for a torrent of `len` bytes.
fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Build single-file metainfo bytes for `content`.
fn metainfo(name: &str, content: &[u8], piece_length: usize) -> Vec<u8> {
    let mut hashes = Vec::new();
    for chunk in content.chunks(piece_length) {
        let mut hasher = Sha1::new();
        hasher.update(chunk);
        hashes.extend_from_slice(&hasher.finish());
    }

    let mut info = BTreeMap::new();
    info.insert(
        b"length".to_vec(),
        BencodeValue::Integer(content.len() as i64),
    );
    info.insert(
        b"name".to_vec(),
        BencodeValue::ByteString(name.as_bytes().to_vec()),
    );
    info.insert(
        b"piece length".to_vec(),
        BencodeValue::Integer(piece_length as i64),
    );
    info.insert(b"pieces".to_vec(), BencodeValue::ByteString(hashes));

    let mut root = BTreeMap::new();
    root.insert(
        b"announce".to_vec(),
        BencodeValue::ByteString(b"http://tracker.invalid/announce".to_vec()),
    );
    root.insert(b"info".to_vec(), BencodeValue::Dict(info));
    encode(&BencodeValue::Dict(root))
}

/// Write metainfo bytes into a scratch `.torrent` file.
fn write_torrent_file(test: &str, bytes: &[u8]) -> PathBuf {
    let dir = std::env::temp_dir().join("torrus-engine-tests");
    std::fs::create_dir_all(&dir).unwrap();

    let path = dir.join(format!("{}-{}.torrent", test, std::process::id()));
    std::fs::write(&path, bytes).unwrap();
    path
}

/// Poll `cond` every few milliseconds until it holds or `timeout` expires.
fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn peer(port: u16) -> Peer {
    Peer::new(Ipv4Addr::LOCALHOST, port)
}

/// Tracker stub handing out a fixed peer list.
struct StaticTracker {
    peers: Vec<Peer>,
}

impl Tracker for StaticTracker {
    fn announce(
        &self,
        _descriptor: &TorrentDescriptor,
        _peer_id: &[u8; 20],
        _port: u16,
    ) -> Result<AnnounceResult, TrackerError> {
        Ok(AnnounceResult {
            interval: 1800,
            peers: self.peers.clone(),
        })
    }
}

/// Downloader stub serving bytes from in-memory content, keyed by torrent
/// name. Peers whose port is listed in `failing_ports` always fail.
struct StubDownloader {
    contents: HashMap<String, Vec<u8>>,
    failing_ports: HashSet<u16>,
    delay: Duration,
    served: Mutex<Vec<String>>,
}

impl StubDownloader {
    fn serving(name: &str, content: &[u8]) -> StubDownloader {
        StubDownloader {
            contents: HashMap::from([(name.to_string(), content.to_vec())]),
            failing_ports: HashSet::new(),
            delay: Duration::ZERO,
            served: Mutex::new(Vec::new()),
        }
    }

    fn served(&self) -> Vec<String> {
        self.served.lock().unwrap().clone()
    }
}

impl PieceDownloader for StubDownloader {
    fn try_download(
        &self,
        descriptor: &TorrentDescriptor,
        piece: &Piece,
        peer: &Peer,
    ) -> Result<Vec<u8>, DownloadError> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        if self.failing_ports.contains(&peer.port) {
            return Err(DownloadError::Connect(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "stub peer is down",
            )));
        }

        let content = self
            .contents
            .get(&descriptor.name)
            .expect("stub has no content for this torrent");

        self.served.lock().unwrap().push(descriptor.name.clone());

        let begin = piece.index as usize * descriptor.piece_length as usize;
        Ok(content[begin..begin + piece.length as usize].to_vec())
    }
}

/// Storage stub capturing every write in memory.
struct MemoryStorage {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryStorage {
    fn new() -> MemoryStorage {
        MemoryStorage {
            files: Mutex::new(HashMap::new()),
        }
    }

    fn file(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    fn is_empty(&self) -> bool {
        self.files.lock().unwrap().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn write_bytes(&self, path: &Path, bytes: &[u8], offset: u64) -> Result<(), StorageError> {
        let mut files = self.files.lock().unwrap();
        let file = files.entry(path.to_path_buf()).or_default();

        let end = offset as usize + bytes.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[offset as usize..end].copy_from_slice(bytes);

        Ok(())
    }
}

fn config(workers: usize) -> Config {
    Config {
        download_folder: PathBuf::from("mem"),
        workers: Some(workers),
        ..Config::default()
    }
}

#[test]
fn happy_path_completes_and_drains_the_queue() {
    let data = content(320);
    let path = write_torrent_file("happy", &metainfo("happy.bin", &data, 32));

    let storage = Arc::new(MemoryStorage::new());
    let engine = Engine::with_collaborators(
        config(4),
        Arc::new(StaticTracker {
            peers: vec![peer(6881)],
        }),
        Arc::new(StubDownloader::serving("happy.bin", &data)),
        Arc::clone(&storage) as Arc<dyn Storage>,
    );

    let tid = engine.add_torrent(&path).unwrap();

    assert!(wait_for(Duration::from_secs(10), || {
        engine.get_gui_data_of(tid).unwrap().state == TorrentState::Completed
    }));

    let stats = engine.get_gui_data_of(tid).unwrap();
    assert_eq!(stats.pieces_processed, 10);
    assert_eq!(stats.pieces_count, 10);
    assert_eq!(engine.queued_tasks(), 0);

    // Every subpiece landed in the right place
    assert_eq!(
        storage.file(&PathBuf::from("mem").join("happy.bin")).unwrap(),
        data
    );
}

#[test]
fn scoring_converges_to_the_serving_peer() {
    let data = content(1600);
    let path = write_torrent_file("scoring", &metainfo("scoring.bin", &data, 16));

    let mut downloader = StubDownloader::serving("scoring.bin", &data);
    downloader.failing_ports.insert(1);

    let engine = Engine::with_collaborators(
        config(4),
        Arc::new(StaticTracker {
            peers: vec![peer(1), peer(2)],
        }),
        Arc::new(downloader),
        Arc::new(MemoryStorage::new()),
    );

    let tid = engine.add_torrent(&path).unwrap();

    assert!(wait_for(Duration::from_secs(30), || {
        engine.get_gui_data_of(tid).unwrap().state == TorrentState::Completed
    }));

    // 100 completed pieces all credited to the only working peer
    let scores = engine.peer_scores(tid).unwrap();
    assert_eq!(scores[0], 1);
    assert_eq!(scores[1], 101);
    assert!(scores[1] > scores[0]);
}

#[test]
fn pause_stops_progress_and_resume_completes() {
    let data = content(800);
    let path = write_torrent_file("pause", &metainfo("pause.bin", &data, 16));

    let mut downloader = StubDownloader::serving("pause.bin", &data);
    downloader.delay = Duration::from_millis(20);

    let engine = Engine::with_collaborators(
        config(2),
        Arc::new(StaticTracker {
            peers: vec![peer(6881)],
        }),
        Arc::new(downloader),
        Arc::new(MemoryStorage::new()),
    );

    let tid = engine.add_torrent(&path).unwrap();

    assert!(wait_for(Duration::from_secs(10), || {
        engine.get_gui_data_of(tid).unwrap().pieces_processed >= 3
    }));
    assert!(engine.pause(tid));

    // Let in-flight downloads drain, then the counter must hold still
    thread::sleep(Duration::from_millis(150));
    let stalled = engine.get_gui_data_of(tid).unwrap().pieces_processed;
    thread::sleep(Duration::from_millis(250));

    let stats = engine.get_gui_data_of(tid).unwrap();
    assert_eq!(stats.state, TorrentState::Paused);
    assert_eq!(stats.pieces_processed, stalled);
    assert!(stats.pieces_processed < stats.pieces_count);

    assert!(engine.resume(tid));
    assert!(wait_for(Duration::from_secs(30), || {
        engine.get_gui_data_of(tid).unwrap().state == TorrentState::Completed
    }));
    assert_eq!(engine.get_gui_data_of(tid).unwrap().pieces_processed, 50);
}

#[test]
fn retry_exhaustion_errors_the_torrent_and_purges_its_tasks() {
    let data = content(128);
    let path = write_torrent_file("exhaust", &metainfo("exhaust.bin", &data, 32));

    let mut downloader = StubDownloader::serving("exhaust.bin", &data);
    downloader.failing_ports.insert(6881);

    let storage = Arc::new(MemoryStorage::new());
    let engine = Engine::with_collaborators(
        Config {
            max_try: 5,
            ..config(1)
        },
        Arc::new(StaticTracker {
            peers: vec![peer(6881)],
        }),
        Arc::new(downloader),
        Arc::clone(&storage) as Arc<dyn Storage>,
    );

    let tid = engine.add_torrent(&path).unwrap();

    assert!(wait_for(Duration::from_secs(10), || {
        let stats = engine.get_gui_data_of(tid).unwrap();
        stats.state == TorrentState::Error && engine.queued_tasks() == 0
    }));

    assert_eq!(engine.get_gui_data_of(tid).unwrap().pieces_processed, 0);
    assert!(storage.is_empty());
}

#[test]
fn removed_torrent_tasks_are_never_processed() {
    let kept_data = content(160);
    let removed_data = content(160);

    let kept_path = write_torrent_file("kept", &metainfo("kept.bin", &kept_data, 32));
    let removed_path =
        write_torrent_file("removed", &metainfo("removed.bin", &removed_data, 32));

    let mut downloader = StubDownloader::serving("kept.bin", &kept_data);
    downloader
        .contents
        .insert("removed.bin".to_string(), removed_data);
    downloader.delay = Duration::from_millis(50);
    let downloader = Arc::new(downloader);

    let engine = Engine::with_collaborators(
        config(1),
        Arc::new(StaticTracker {
            peers: vec![peer(6881)],
        }),
        Arc::clone(&downloader) as Arc<dyn PieceDownloader>,
        Arc::new(MemoryStorage::new()),
    );

    let kept = engine.add_torrent(&kept_path).unwrap();

    // The single worker is now busy on a piece of the kept torrent; add and
    // remove the second torrent while it is occupied
    thread::sleep(Duration::from_millis(25));
    let removed = engine.add_torrent(&removed_path).unwrap();
    engine.remove_torrent(removed);

    assert!(wait_for(Duration::from_secs(10), || {
        engine.get_gui_data_of(kept).unwrap().state == TorrentState::Completed
    }));

    // No worker ever touched a task of the removed torrent
    assert!(downloader.served().iter().all(|name| name == "kept.bin"));

    let stats = engine.get_gui_data_of(removed).unwrap();
    assert_eq!(stats.state, TorrentState::Stopped);
    assert_eq!(stats.pieces_processed, 0);
    assert_eq!(engine.queued_tasks(), 0);
}

#[test]
fn teardown_releases_blocked_workers() {
    let engine = Engine::with_collaborators(
        config(4),
        Arc::new(StaticTracker { peers: Vec::new() }),
        Arc::new(StubDownloader::serving("none", &[])),
        Arc::new(MemoryStorage::new()),
    );

    // Give the workers time to block on the empty queue
    thread::sleep(Duration::from_millis(100));

    let done = Arc::new(AtomicBool::new(false));
    let done_flag = Arc::clone(&done);
    thread::spawn(move || {
        drop(engine);
        done_flag.store(true, Ordering::Release);
    });

    assert!(wait_for(Duration::from_secs(5), || {
        done.load(Ordering::Acquire)
    }));
}

#[test]
fn loading_failures_surface_from_add_torrent() {
    let engine = Engine::with_collaborators(
        config(1),
        Arc::new(StaticTracker {
            peers: vec![peer(6881)],
        }),
        Arc::new(StubDownloader::serving("none", &[])),
        Arc::new(MemoryStorage::new()),
    );

    // Unreadable file
    assert!(engine
        .add_torrent(Path::new("/definitely/not/a/real/path.torrent"))
        .is_err());

    // Readable but not a torrent
    let path = write_torrent_file("garbage", b"this is not bencode");
    assert!(engine.add_torrent(&path).is_err());

    // Nothing was registered
    assert!(engine.get_gui_data().is_empty());
}
