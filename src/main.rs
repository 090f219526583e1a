// src/main.rs

use std::io;

use clap::Parser;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use udp_tracker::config::{self, Args, ConfigError, Mode, RunConfig};
use udp_tracker::magnet::{InfoHash, ParsedMagnet};
use udp_tracker::messages::{AnnounceResponse, ScrapeResponse};
use udp_tracker::tracker::{AnnounceParams, TrackerSession};
use udp_tracker::transport::{CancelToken, UdpTransport};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

enum Outcome {
    Scrape(ScrapeResponse),
    Announce(AnnounceResponse),
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Runs one full connect → query exchange against a single tracker.
fn query_tracker(
    tracker_url: &str,
    info_hash: InfoHash,
    config: &RunConfig,
    cancel: CancelToken,
) -> Result<Outcome, BoxError> {
    let mut rng = StdRng::from_entropy();
    let key = rng.next_u32();
    let mut transport = UdpTransport::connect(tracker_url, cancel)?;
    let mut session = TrackerSession::new(rng, config.timeout);

    session.connect(&mut transport)?;
    let outcome = match config.mode {
        Mode::Scrape => Outcome::Scrape(session.scrape(&mut transport, info_hash)?),
        Mode::Announce => {
            let params = AnnounceParams {
                info_hash,
                peer_id: config.peer_id,
                downloaded: 0,
                left: 0,
                uploaded: 0,
                event: config.event,
                key,
                num_want: config.num_want,
                port: config.port,
            };
            Outcome::Announce(session.announce(&mut transport, &params)?)
        }
    };
    Ok(outcome)
}

fn report(tracker_url: &str, outcome: &Outcome) {
    match outcome {
        Outcome::Scrape(stats) => println!(
            "{tracker_url}: seeders={} leechers={} completed={}",
            stats.seeders, stats.leechers, stats.completed
        ),
        Outcome::Announce(response) => {
            println!(
                "{tracker_url}: seeders={} leechers={} interval={}s peers={}",
                response.seeders,
                response.leechers,
                response.interval,
                response.peers.len()
            );
            for peer in &response.peers {
                println!("  {peer}");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let magnet_link = config::read_magnet(args.magnet.as_deref(), io::stdin().lock())?;
    let config = RunConfig::from_args(&args, &mut StdRng::from_entropy());

    let magnet = ParsedMagnet::parse(&magnet_link)?;
    let info_hash = magnet.info_hash()?;
    let trackers: Vec<String> = magnet.udp_trackers().map(str::to_string).collect();
    if trackers.is_empty() {
        return Err(ConfigError::NoUdpTrackers.into());
    }
    info!(
        "Probing {} UDP trackers for {} ({})",
        trackers.len(),
        info_hash,
        magnet.display_name().unwrap_or("unnamed")
    );

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling outstanding tracker requests");
                cancel.cancel();
            }
        });
    }

    let tasks = trackers.iter().cloned().map(|tracker_url| {
        let config = config.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || query_tracker(&tracker_url, info_hash, &config, cancel))
    });
    let results = join_all(tasks).await;

    let mut answered = 0;
    for (tracker_url, result) in trackers.iter().zip(results) {
        match result {
            Ok(Ok(outcome)) => {
                answered += 1;
                report(tracker_url, &outcome);
            }
            Ok(Err(e)) => warn!("{tracker_url}: {e}"),
            Err(e) => warn!("{tracker_url}: task failed: {e}"),
        }
    }
    info!("{answered}/{} trackers answered", trackers.len());

    Ok(())
}
