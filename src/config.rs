//! Command-line arguments and the run settings derived from them.

use std::io::{self, BufRead};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rand::RngCore;
use thiserror::Error;

use crate::messages::AnnounceEvent;

/// Client identifier placed at the front of every generated peer id.
pub const CLIENT_PREFIX: &[u8; 8] = b"-TP0001-";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read magnet link from stdin: {0}")]
    Stdin(#[from] io::Error),
    #[error("No magnet link given")]
    EmptyMagnet,
    #[error("Magnet link lists no udp:// trackers")]
    NoUdpTrackers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Ask for seeder, leecher and completed counts
    Scrape,
    /// Register as a peer and fetch a peer list
    Announce,
}

#[derive(Parser, Debug)]
#[command(name = "udp-tracker")]
#[command(about = "Query the UDP trackers of a magnet link for swarm statistics")]
pub struct Args {
    /// Magnet URI. Read from stdin when omitted.
    pub magnet: Option<String>,

    #[arg(long, value_enum, default_value_t = Mode::Scrape)]
    pub mode: Mode,

    /// Seconds to wait for each tracker reply
    #[arg(long, default_value_t = 8)]
    pub timeout: u64,

    /// Listening port reported in announce requests
    #[arg(long, default_value_t = 6881)]
    pub port: u16,

    /// Number of peers to ask for in announce requests (-1 = tracker default)
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub num_want: i32,

    /// Console log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Settings shared by every tracker queried in one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: Mode,
    pub timeout: Duration,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub num_want: i32,
    pub event: AnnounceEvent,
}

impl RunConfig {
    pub fn from_args(args: &Args, rng: &mut impl RngCore) -> Self {
        Self {
            mode: args.mode,
            timeout: Duration::from_secs(args.timeout),
            peer_id: generate_peer_id(rng),
            port: args.port,
            num_want: args.num_want,
            event: AnnounceEvent::Started,
        }
    }
}

/// `<client prefix><12 random bytes>`
pub fn generate_peer_id(rng: &mut impl RngCore) -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..CLIENT_PREFIX.len()].copy_from_slice(CLIENT_PREFIX);
    rng.fill_bytes(&mut id[CLIENT_PREFIX.len()..]);
    id
}

/// Returns the magnet given on the command line, or the first non-empty line of `input`.
pub fn read_magnet(arg: Option<&str>, input: impl BufRead) -> Result<String, ConfigError> {
    if let Some(magnet) = arg {
        let magnet = magnet.trim();
        return if magnet.is_empty() {
            Err(ConfigError::EmptyMagnet)
        } else {
            Ok(magnet.to_string())
        };
    }

    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            return Ok(line.to_string());
        }
    }
    Err(ConfigError::EmptyMagnet)
}
