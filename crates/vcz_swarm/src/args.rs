use std::path::PathBuf;

use clap::Parser;
use tracing::Level;

/// Runs the piece requesters against a simulated swarm. Every flag
/// overrides the value of the configuration file.
#[derive(Parser, Debug)]
#[clap(name = "Vincenzo Swarm", author = "Gabriel Lombardo")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// Read the configuration from this file instead of the one in the
    /// config folder of the user.
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Download in order, like a video player, with the streaming requester
    #[clap(short, long)]
    pub stream: bool,

    /// Start playing at this byte of the file, only with --stream
    #[clap(long)]
    pub seek: Option<u64>,

    /// Seed of the random number generator, the same seed gives the same run
    #[clap(long)]
    pub seed: Option<u64>,

    /// How many peers have every piece
    #[clap(long)]
    pub seeders: Option<usize>,

    /// How many peers have some of the pieces
    #[clap(long)]
    pub leechers: Option<usize>,

    /// Give up after this many rounds
    #[clap(short, long)]
    pub rounds: Option<usize>,

    /// Fraction of the requests that peers reject, between 0 and 1
    #[clap(long)]
    pub reject_rate: Option<f64>,

    /// Size of the torrent in bytes
    #[clap(long)]
    pub size: Option<u64>,

    #[clap(short, long, default_value = "info")]
    pub log_level: Level,
}
