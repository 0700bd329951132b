use core::fmt;
use std::net::SocketAddrV4;
use std::result::Result;
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info};

use crate::metadata::bencode::{BencodeError, BencodeValue};
use crate::metadata::file::{Metainfo, extract_uint};
use crate::peer::PeerId;

const COMPACT_PEER_LEN: usize = 6;

#[derive(Debug, Clone)]
pub struct Announce {
    pub interval: Duration,
    pub peers: Vec<SocketAddrV4>,
}

#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error("announce url '{0}' is invalid")]
    InvalidUrl(String),
    #[error("tracker unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("tracker responded with status {0}")]
    Status(u16),
    #[error("tracker response body could not be read: {0}")]
    Body(#[source] reqwest::Error),
    #[error("tracker response is invalid bencode data: {0}")]
    NonBencoded(#[from] BencodeError),
    #[error("tracker response is not a bencoded dictionary")]
    NotADictionary,
    #[error("tracker refused the announce: {0}")]
    Failure(String),
    #[error("tracker response missing interval key")]
    MissingInterval,
    #[error("tracker response interval is not a non-negative integer")]
    MalformedInterval,
    #[error("tracker response missing peers key")]
    MissingPeers,
    #[error("peers list byte length ({0}) is not a multiple of 6")]
    MalformedPeers(usize),
}

const INTERVAL: &[u8] = b"interval";
const PEERS: &[u8] = b"peers";
const FAILURE_REASON: &[u8] = b"failure reason";

/// Decodes a compact peer list. Any length that is not a multiple of 6
/// rejects the whole list.
pub fn parse_peers(bytes: &[u8]) -> Result<Vec<SocketAddrV4>, AnnounceError> {
    if bytes.len() % COMPACT_PEER_LEN != 0 {
        return Err(AnnounceError::MalformedPeers(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|chunk| {
            let ip = [chunk[0], chunk[1], chunk[2], chunk[3]];
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip.into(), port)
        })
        .collect())
}

impl TryFrom<&BencodeValue> for Announce {
    type Error = AnnounceError;

    fn try_from(value: &BencodeValue) -> Result<Self, AnnounceError> {
        let items = value.as_dictionary().ok_or(AnnounceError::NotADictionary)?;
        if let Some(reason) = items.get(FAILURE_REASON).and_then(BencodeValue::as_bytes) {
            return Err(AnnounceError::Failure(String::from_utf8_lossy(reason).into_owned()));
        }
        let interval = extract_uint(items.get(INTERVAL), "interval")
            .map_err(|_| AnnounceError::MalformedInterval)?
            .ok_or(AnnounceError::MissingInterval)?;
        let peers = items
            .get(PEERS)
            .ok_or(AnnounceError::MissingPeers)?
            .as_bytes()
            .ok_or(AnnounceError::MalformedPeers(0))?;
        Ok(Announce { interval: Duration::from_secs(interval), peers: parse_peers(peers)? })
    }
}

impl fmt::Display for Announce {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "interval (s): {}", self.interval.as_secs())?;
        for (i, socket) in self.peers.iter().enumerate() {
            writeln!(f, "{i:03}: {socket}")?;
        }
        Ok(())
    }
}

/// HTTP announce client. Performs a single request per call; retrying is
/// left to the caller.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    client: Client,
}

impl TrackerClient {
    pub fn new(timeout: Duration) -> Result<Self, AnnounceError> {
        let client = Client::builder().timeout(timeout).build().map_err(AnnounceError::Unreachable)?;
        Ok(TrackerClient { client })
    }

    pub async fn announce(&self, metainfo: &Metainfo, peer_id: &PeerId, port: u16) -> Result<Announce, AnnounceError> {
        let url = metainfo
            .announce_url(peer_id, port)
            .map_err(|_| AnnounceError::InvalidUrl(metainfo.announce.clone()))?;
        debug!(%url, "announcing");

        let response = self.client.get(url).send().await.map_err(AnnounceError::Unreachable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AnnounceError::Status(status.as_u16()));
        }
        let body = response.bytes().await.map_err(AnnounceError::Body)?;

        let value = BencodeValue::try_from(body.as_ref())?;
        let announce = Announce::try_from(&value)?;
        info!(peers = announce.peers.len(), interval = announce.interval.as_secs(), "tracker announce succeeded");
        Ok(announce)
    }
}
