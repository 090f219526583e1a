use std::fmt;

use percent_encoding::percent_decode_str;
use thiserror::Error;
use url::Url;

const INFO_HASH_LEN: usize = 20;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Malformed magnet URI: {0}")]
    MalformedUri(#[from] url::ParseError),
    #[error("Not a magnet URI: scheme is '{0}'")]
    UnsupportedScheme(String),
    #[error("Magnet URI has no 'xt' (exact topic) parameter")]
    MissingInfoHash,
    #[error("Invalid info hash in exact topic '{0}'")]
    InvalidInfoHash(String),
}

/// The 20-byte SHA-1 identifier of a torrent's info dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; INFO_HASH_LEN]);

impl InfoHash {
    pub fn new(bytes: [u8; INFO_HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; INFO_HASH_LEN] {
        &self.0
    }

    /// Decodes the percent-decoded hash part of a `urn:btih:` topic.
    ///
    /// 40 hex characters (either case) are hex-decoded. 20 bytes are taken verbatim
    /// as the raw hash. Base32 topics and every other length are rejected.
    pub fn from_topic_hash(hash: &[u8]) -> Result<Self, ParseError> {
        let invalid = || ParseError::InvalidInfoHash(String::from_utf8_lossy(hash).into_owned());

        let mut bytes = [0u8; INFO_HASH_LEN];
        match hash.len() {
            40 => hex::decode_to_slice(hash, &mut bytes).map_err(|_| invalid())?,
            INFO_HASH_LEN => bytes.copy_from_slice(hash),
            _ => return Err(invalid()),
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// The query parameters of a magnet link that matter to a tracker client.
///
/// Values keep the order and multiplicity they had in the URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMagnet {
    exact_topics: Vec<String>,
    /// `xt` values percent-decoded to bytes, so raw hashes survive non-UTF-8 octets.
    topic_bytes: Vec<Vec<u8>>,
    trackers: Vec<String>,
    display_names: Vec<String>,
}

impl ParsedMagnet {
    /// Parses a `magnet:?xt=...&tr=...&dn=...` URI.
    ///
    /// Query values are percent-decoded. Missing `tr` or `dn` parameters are not an
    /// error, and a missing `xt` only surfaces when [`ParsedMagnet::info_hash`] is called.
    pub fn parse(uri: &str) -> Result<Self, ParseError> {
        let url = Url::parse(uri.trim())?;
        if url.scheme() != "magnet" {
            return Err(ParseError::UnsupportedScheme(url.scheme().to_string()));
        }

        let topic_bytes = url
            .query()
            .unwrap_or_default()
            .split('&')
            .filter_map(|pair| pair.strip_prefix("xt="))
            .map(|value| percent_decode_str(&value.replace('+', " ")).collect::<Vec<u8>>())
            .collect();

        let mut magnet = Self {
            exact_topics: Vec::new(),
            topic_bytes,
            trackers: Vec::new(),
            display_names: Vec::new(),
        };
        for (key, value) in url.query_pairs() {
            let target = match &*key {
                "xt" => &mut magnet.exact_topics,
                "tr" => &mut magnet.trackers,
                "dn" => &mut magnet.display_names,
                _ => continue,
            };
            target.push(value.into_owned());
        }

        Ok(magnet)
    }

    pub fn exact_topics(&self) -> &[String] {
        &self.exact_topics
    }

    pub fn trackers(&self) -> &[String] {
        &self.trackers
    }

    pub fn display_names(&self) -> &[String] {
        &self.display_names
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_names.first().map(String::as_str)
    }

    /// Tracker URLs using the `udp://` scheme, in their original order.
    pub fn udp_trackers(&self) -> impl Iterator<Item = &str> {
        self.trackers
            .iter()
            .map(String::as_str)
            .filter(|tr| tr.starts_with("udp://"))
    }

    /// Derives the info hash from the first exact topic.
    pub fn info_hash(&self) -> Result<InfoHash, ParseError> {
        let topic = self
            .topic_bytes
            .first()
            .ok_or(ParseError::MissingInfoHash)?;

        // urn:btih:<hash>
        let hash = topic.split(|&b| b == b':').nth(2).ok_or_else(|| {
            ParseError::InvalidInfoHash(String::from_utf8_lossy(topic).into_owned())
        })?;

        InfoHash::from_topic_hash(hash)
    }
}
