//! Fixed-layout BEP 15 messages. Every integer is big-endian.

use std::net::{Ipv4Addr, SocketAddrV4};

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

/// Magic constant identifying the UDP tracker protocol in a connect request.
pub const PROTOCOL_ID: u64 = 0x41727101980;

pub const CONNECT_REQUEST_LEN: usize = 16;
pub const CONNECT_RESPONSE_LEN: usize = 16;
pub const SCRAPE_REQUEST_LEN: usize = 36;
pub const SCRAPE_RESPONSE_LEN: usize = 20;
pub const ANNOUNCE_REQUEST_LEN: usize = 98;
pub const ANNOUNCE_RESPONSE_LEN: usize = 20;
pub const ERROR_RESPONSE_LEN: usize = 8;
const PEER_ENTRY_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Connect,
    Announce,
    Scrape,
    Error,
}

impl Action {
    pub fn code(self) -> u32 {
        match self {
            Action::Connect => 0,
            Action::Announce => 1,
            Action::Scrape => 2,
            Action::Error => 3,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Buffer has the wrong length. Expected {expected} bytes, got {actual}")]
    ShortBuffer { expected: usize, actual: usize },
    #[error("Unexpected action in response. Expected {expected}, got {actual}")]
    UnexpectedAction { expected: u32, actual: u32 },
}

fn require_len(buf: &[u8], expected: usize) -> Result<(), CodecError> {
    if buf.len() < expected {
        return Err(CodecError::ShortBuffer {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn require_exact_len(buf: &[u8], expected: usize) -> Result<(), CodecError> {
    if buf.len() != expected {
        return Err(CodecError::ShortBuffer {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn require_action(actual: u32, expected: Action) -> Result<(), CodecError> {
    if actual != expected.code() {
        return Err(CodecError::UnexpectedAction {
            expected: expected.code(),
            actual,
        });
    }
    Ok(())
}

/// Responses echo the transaction ID of the request they answer.
pub trait Transaction {
    fn transaction_id(&self) -> u32;
}

/// A decoded reply that is either the expected message or a tracker error (action 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    Success(T),
    Error(ErrorResponse),
}

impl<T: Transaction> Transaction for Reply<T> {
    fn transaction_id(&self) -> u32 {
        match self {
            Reply::Success(message) => message.transaction_id(),
            Reply::Error(err) => err.transaction_id,
        }
    }
}

/// Tracker-reported failure. The message is whatever text follows the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub transaction_id: u32,
    pub message: String,
}

impl ErrorResponse {
    /// Decodes `[action:4][transaction_id:4][message:rest]`. The caller has already
    /// seen `action == 3`.
    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        require_len(buf, ERROR_RESPONSE_LEN)?;
        Ok(Self {
            transaction_id: BigEndian::read_u32(&buf[4..8]),
            message: String::from_utf8_lossy(&buf[8..]).into_owned(),
        })
    }
}

/// Reads the leading action, dispatching action 3 to [`ErrorResponse`].
fn decode_reply<T>(
    buf: &[u8],
    expected: Action,
    min_len: usize,
    decode: impl FnOnce(&[u8]) -> T,
) -> Result<Reply<T>, CodecError> {
    require_len(buf, ERROR_RESPONSE_LEN)?;
    let action = BigEndian::read_u32(&buf[0..4]);
    if action == Action::Error.code() {
        return ErrorResponse::decode(buf).map(Reply::Error);
    }
    require_action(action, expected)?;
    require_len(buf, min_len)?;
    Ok(Reply::Success(decode(buf)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub transaction_id: u32,
}

impl ConnectRequest {
    /// `[protocol_id:8][action:4][transaction_id:4]`
    pub fn encode(&self) -> [u8; CONNECT_REQUEST_LEN] {
        let mut buf = [0u8; CONNECT_REQUEST_LEN];
        BigEndian::write_u64(&mut buf[0..8], PROTOCOL_ID);
        BigEndian::write_u32(&mut buf[8..12], Action::Connect.code());
        BigEndian::write_u32(&mut buf[12..16], self.transaction_id);
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    pub transaction_id: u32,
    pub connection_id: u64,
}

impl ConnectResponse {
    /// Decodes `[action:4][transaction_id:4][connection_id:8]`. Any other length
    /// is rejected.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        require_exact_len(buf, CONNECT_RESPONSE_LEN)?;
        require_action(BigEndian::read_u32(&buf[0..4]), Action::Connect)?;
        Ok(Self {
            transaction_id: BigEndian::read_u32(&buf[4..8]),
            connection_id: BigEndian::read_u64(&buf[8..16]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeRequest {
    pub connection_id: u64,
    pub transaction_id: u32,
    pub info_hash: [u8; 20],
}

impl ScrapeRequest {
    /// `[connection_id:8][action:4][transaction_id:4][info_hash:20]`
    pub fn encode(&self) -> [u8; SCRAPE_REQUEST_LEN] {
        let mut buf = [0u8; SCRAPE_REQUEST_LEN];
        BigEndian::write_u64(&mut buf[0..8], self.connection_id);
        BigEndian::write_u32(&mut buf[8..12], Action::Scrape.code());
        BigEndian::write_u32(&mut buf[12..16], self.transaction_id);
        buf[16..36].copy_from_slice(&self.info_hash);
        buf
    }
}

/// Swarm statistics for the single info hash that was scraped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeResponse {
    pub transaction_id: u32,
    pub seeders: u32,
    pub completed: u32,
    pub leechers: u32,
}

impl ScrapeResponse {
    /// Decodes `[action:4][transaction_id:4][seeders:4][completed:4][leechers:4]`.
    ///
    /// Only one info hash is ever requested, so entries after the first are ignored.
    pub fn decode(buf: &[u8]) -> Result<Reply<Self>, CodecError> {
        decode_reply(buf, Action::Scrape, SCRAPE_RESPONSE_LEN, |buf| Self {
            transaction_id: BigEndian::read_u32(&buf[4..8]),
            seeders: BigEndian::read_u32(&buf[8..12]),
            completed: BigEndian::read_u32(&buf[12..16]),
            leechers: BigEndian::read_u32(&buf[16..20]),
        })
    }
}

impl Transaction for ScrapeResponse {
    fn transaction_id(&self) -> u32 {
        self.transaction_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnounceEvent {
    #[default]
    None,
    Completed,
    Started,
    Stopped,
}

impl AnnounceEvent {
    pub fn code(self) -> u32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub connection_id: u64,
    pub transaction_id: u32,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: AnnounceEvent,
    /// 0 lets the tracker use the packet's source address.
    pub ip_address: u32,
    pub key: u32,
    /// -1 asks for the tracker's default.
    pub num_want: i32,
    pub port: u16,
}

impl AnnounceRequest {
    pub fn encode(&self) -> [u8; ANNOUNCE_REQUEST_LEN] {
        let mut buf = [0u8; ANNOUNCE_REQUEST_LEN];
        BigEndian::write_u64(&mut buf[0..8], self.connection_id);
        BigEndian::write_u32(&mut buf[8..12], Action::Announce.code());
        BigEndian::write_u32(&mut buf[12..16], self.transaction_id);
        buf[16..36].copy_from_slice(&self.info_hash);
        buf[36..56].copy_from_slice(&self.peer_id);
        BigEndian::write_u64(&mut buf[56..64], self.downloaded);
        BigEndian::write_u64(&mut buf[64..72], self.left);
        BigEndian::write_u64(&mut buf[72..80], self.uploaded);
        BigEndian::write_u32(&mut buf[80..84], self.event.code());
        BigEndian::write_u32(&mut buf[84..88], self.ip_address);
        BigEndian::write_u32(&mut buf[88..92], self.key);
        BigEndian::write_i32(&mut buf[92..96], self.num_want);
        BigEndian::write_u16(&mut buf[96..98], self.port);
        buf
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub transaction_id: u32,
    /// Seconds the client should wait before announcing again.
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddrV4>,
}

impl AnnounceResponse {
    /// Decodes the 20-byte header followed by 6-byte `(ip, port)` peer entries.
    /// A trailing partial entry is dropped.
    pub fn decode(buf: &[u8]) -> Result<Reply<Self>, CodecError> {
        decode_reply(buf, Action::Announce, ANNOUNCE_RESPONSE_LEN, |buf| Self {
            transaction_id: BigEndian::read_u32(&buf[4..8]),
            interval: BigEndian::read_u32(&buf[8..12]),
            leechers: BigEndian::read_u32(&buf[12..16]),
            seeders: BigEndian::read_u32(&buf[16..20]),
            peers: buf[ANNOUNCE_RESPONSE_LEN..]
                .chunks_exact(PEER_ENTRY_LEN)
                .map(|entry| {
                    SocketAddrV4::new(
                        Ipv4Addr::from(BigEndian::read_u32(&entry[0..4])),
                        BigEndian::read_u16(&entry[4..6]),
                    )
                })
                .collect(),
        })
    }
}

impl Transaction for AnnounceResponse {
    fn transaction_id(&self) -> u32 {
        self.transaction_id
    }
}

#[cfg(test)]
impl ConnectResponse {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; CONNECT_RESPONSE_LEN];
        BigEndian::write_u32(&mut buf[0..4], Action::Connect.code());
        BigEndian::write_u32(&mut buf[4..8], self.transaction_id);
        BigEndian::write_u64(&mut buf[8..16], self.connection_id);
        buf
    }
}

#[cfg(test)]
impl ScrapeResponse {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SCRAPE_RESPONSE_LEN];
        BigEndian::write_u32(&mut buf[0..4], Action::Scrape.code());
        BigEndian::write_u32(&mut buf[4..8], self.transaction_id);
        BigEndian::write_u32(&mut buf[8..12], self.seeders);
        BigEndian::write_u32(&mut buf[12..16], self.completed);
        BigEndian::write_u32(&mut buf[16..20], self.leechers);
        buf
    }
}

#[cfg(test)]
impl AnnounceResponse {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ANNOUNCE_RESPONSE_LEN];
        BigEndian::write_u32(&mut buf[0..4], Action::Announce.code());
        BigEndian::write_u32(&mut buf[4..8], self.transaction_id);
        BigEndian::write_u32(&mut buf[8..12], self.interval);
        BigEndian::write_u32(&mut buf[12..16], self.leechers);
        BigEndian::write_u32(&mut buf[16..20], self.seeders);
        for peer in &self.peers {
            buf.extend_from_slice(&peer.ip().octets());
            buf.extend_from_slice(&peer.port().to_be_bytes());
        }
        buf
    }
}

#[cfg(test)]
impl ErrorResponse {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ERROR_RESPONSE_LEN];
        BigEndian::write_u32(&mut buf[0..4], Action::Error.code());
        BigEndian::write_u32(&mut buf[4..8], self.transaction_id);
        buf.extend_from_slice(self.message.as_bytes());
        buf
    }
}
