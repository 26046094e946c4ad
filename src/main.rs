//! # Torrus BitTorrent Client
//!
//! A command-line BitTorrent client built on the torrus download engine.
//!
//! ## Usage
//!
//! ```bash
//! torrus <torrent_file>
//! torrus <torrent_file> -o <download_folder>
//! ```
//!
//! ## Architecture
//!
//! The binary is a thin front-end: it parses arguments, constructs the
//! engine, adds the torrent, and polls the engine's stats surface to drive a
//! progress bar until the torrent reaches a terminal state.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use torrus::{Config, Engine, TorrentState};

// How often to refresh the progress display
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A multi-threaded command-line BitTorrent client, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    torrent: String,

    /// Download folder (defaults to the current directory)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Worker thread count (defaults to available cores minus one)
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// Download attempts per piece before giving up
    #[arg(long)]
    max_try: Option<usize>,
}

fn run(args: Args) -> Result<()> {
    // Check if torrent file exists
    if !Path::new(&args.torrent).exists() {
        return Err(anyhow!("could not find torrent file: {}", args.torrent));
    }

    let mut config = Config::default();
    if let Some(output) = args.output {
        config.download_folder = output;
    }
    if let Some(max_try) = args.max_try {
        config.max_try = max_try;
    }
    config.workers = args.workers;

    let engine = Engine::new(config);
    let tid = engine.add_torrent(Path::new(&args.torrent))?;

    let stats = engine
        .get_gui_data_of(tid)
        .ok_or_else(|| anyhow!("torrent disappeared right after loading"))?;
    println!("Downloading {:?} ({} pieces)", stats.name, stats.pieces_count);

    // Create progress bar
    let pb = ProgressBar::new(stats.pieces_count as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {pos}/{len} pieces [{bar:40.cyan/blue}] {percent}%")
            .unwrap()
            .progress_chars("#>-"),
    );

    // Poll the engine until the torrent reaches a terminal state
    loop {
        let stats = engine
            .get_gui_data_of(tid)
            .ok_or_else(|| anyhow!("torrent disappeared while downloading"))?;
        pb.set_position(stats.pieces_processed as u64);

        match stats.state {
            TorrentState::Completed => {
                pb.finish();
                println!("Saved \"{}\".", stats.name);
                return Ok(());
            }
            TorrentState::Error => {
                pb.abandon();
                return Err(anyhow!("download failed, no peer could serve a piece"));
            }
            TorrentState::Stopped => {
                pb.abandon();
                return Err(anyhow!("download was stopped"));
            }
            _ => {}
        }

        thread::sleep(POLL_INTERVAL);
    }
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}
