//! BitTorrent UDP tracker client (BEP 15).
//!
//! Parses magnet links, encodes and decodes the fixed-layout tracker messages, and
//! drives the connect → announce/scrape exchange against a single tracker.

pub mod config;
pub mod magnet;
pub mod messages;
pub mod tracker;
pub mod transport;
