use clap::Parser;
use rand::{rngs::StdRng, SeedableRng};
use tracing::info;
use tracing_subscriber::FmtSubscriber;
use vcz_picker::{
    config::Config,
    requester::{StandardRequester, StreamingRequester},
};

mod args;
mod error;
mod swarm;

use args::Args;
use error::Error;
use swarm::{Strategy, Swarm};

fn main() -> Result<(), Error> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    let config = match &args.config {
        Some(path) => Config::from_path(path)?,
        None => Config::load()?,
    };

    let mut settings = config.swarm;
    if let Some(seed) = args.seed {
        settings.seed = seed;
    }
    if let Some(seeders) = args.seeders {
        settings.seeders = seeders;
    }
    if let Some(leechers) = args.leechers {
        settings.leechers = leechers;
    }
    if let Some(rounds) = args.rounds {
        settings.rounds = rounds;
    }
    if let Some(reject_rate) = args.reject_rate {
        settings.reject_rate = reject_rate;
    }
    if let Some(size) = args.size {
        settings.size = size;
    }

    // the requesters get their own stream of random numbers, derived from
    // the same seed so that a run can be replayed
    let rng = StdRng::seed_from_u64(settings.seed.wrapping_add(1));

    let strategy = if args.stream {
        Strategy::Streaming(StreamingRequester::with_rng(config.streaming, rng))
    } else {
        Strategy::Standard(StandardRequester::with_rng(config.requester, rng))
    };

    let mut swarm = Swarm::new(settings, strategy)?;

    if let Some(position) = args.seek {
        swarm.seek(position);
    }

    let report = swarm.run()?;

    info!("downloaded {} pieces in {} rounds", report.pieces, report.rounds);
    info!(
        "{} requests, {} cancelled, {} rejected, {} refused, {} dropped by chokes",
        report.requests, report.cancelled, report.rejected, report.failed, report.choked
    );
    info!("completion order: {:?}", report.completion_order);

    Ok(())
}
