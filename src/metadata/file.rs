use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use thiserror::Error;
use url::Url;

use crate::metadata::bencode::{BencodeError, BencodeValue};
use crate::peer::PeerId;
use crate::util::{self, sha1_hash};

pub const HASH_LEN: usize = 20;

/// Immutable description of a single-file swarm.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub announce: String,
    pub announce_list: Vec<String>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<u64>,

    pub name: String,
    pub info_hash: [u8; HASH_LEN],
    pub piece_hashes: Vec<[u8; HASH_LEN]>,
    pub piece_length: u32,
    pub total_length: u64,
}

/// One unit of download work: a piece and what it must hash to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceWork {
    pub index: u32,
    pub hash: [u8; HASH_LEN],
    pub length: u32,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unable to read torrent file: {0}")]
    Io(#[from] std::io::Error),
    #[error("torrent file is not valid bencode: {0}")]
    Bencode(#[from] BencodeError),
    #[error("torrent file is not a bencoded dictionary")]
    FileIsNotDictionary,
    #[error("missing required key '{0}'")]
    MissingRequiredKey(&'static str),
    #[error("key '{0}' does not map to a UTF-8 string")]
    KeyDoesNotMapToString(&'static str),
    #[error("key '{0}' does not map to an integer")]
    KeyDoesNotMapToInteger(&'static str),
    #[error("key '{0}' does not map to a dictionary")]
    KeyDoesNotMapToDictionary(&'static str),
    #[error("key '{0}' does not map to a list")]
    KeyDoesNotMapToList(&'static str),
    #[error("key '{0}' maps to a negative integer ({1})")]
    NegativeInteger(&'static str, i64),
    #[error("piece length must be positive")]
    ZeroPieceLength,
    #[error("piece length {0} does not fit in a 32-bit block offset")]
    PieceLengthTooLarge(u64),
    #[error("{0} pieces exceed the 32-bit piece index range")]
    TooManyPieces(usize),
    #[error("pieces string length ({0}) is not a multiple of 20")]
    InvalidPiecesLength(usize),
    #[error("{hashes} piece hashes given but {length} bytes at {piece_length} bytes per piece needs {expected}")]
    PieceCountMismatch { hashes: usize, expected: u64, length: u64, piece_length: u64 },
    #[error("multi-file torrents are not supported")]
    MultipleFilesUnsupported,
    #[error("announce url '{0}' is invalid")]
    InvalidAnnounceUrl(String),
}

type Result<T> = std::result::Result<T, ParseError>;

const ANNOUNCE: &[u8] = b"announce";
const ANNOUNCE_LIST: &[u8] = b"announce-list";
const CREATION_DATE: &[u8] = b"creation date";
const COMMENT: &[u8] = b"comment";
const CREATED_BY: &[u8] = b"created by";
const INFO: &[u8] = b"info";
const PIECE_LENGTH: &[u8] = b"piece length";
const PIECES: &[u8] = b"pieces";
const NAME: &[u8] = b"name";
const LENGTH: &[u8] = b"length";
const FILES: &[u8] = b"files";

impl fmt::Display for Metainfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "name: {}", self.name)?;
        writeln!(f, "announce: {}", self.announce)?;
        if !self.announce_list.is_empty() {
            writeln!(f, "announce list: [{}]", self.announce_list.join(", "))?;
        }
        if let Some(date) = &self.creation_date {
            writeln!(f, "created: {date} seconds since epoch")?;
        }
        if let Some(text) = &self.comment {
            writeln!(f, "comment: {text}")?;
        }
        if let Some(author) = &self.created_by {
            writeln!(f, "created by: {author}")?;
        }
        writeln!(f, "info hash: {}", util::to_string(&self.info_hash))?;
        write!(f, "size: {} bytes ({} pieces of {} bytes each)",
            self.total_length, self.piece_hashes.len(), self.piece_length)
    }
}

impl TryFrom<&BencodeValue> for Metainfo {
    type Error = ParseError;

    fn try_from(value: &BencodeValue) -> Result<Self> {
        let items = value.as_dictionary().ok_or(ParseError::FileIsNotDictionary)?;
        let info = items.get(INFO).ok_or(ParseError::MissingRequiredKey("info"))?;
        let info_items = info.as_dictionary().ok_or(ParseError::KeyDoesNotMapToDictionary("info"))?;
        if info_items.contains_key(FILES) {
            return Err(ParseError::MultipleFilesUnsupported);
        }

        let raw_piece_length = required(extract_uint(info_items.get(PIECE_LENGTH), "piece length")?, "piece length")?;
        if raw_piece_length == 0 {
            return Err(ParseError::ZeroPieceLength);
        }
        let piece_length =
            u32::try_from(raw_piece_length).map_err(|_| ParseError::PieceLengthTooLarge(raw_piece_length))?;
        let total_length = required(extract_uint(info_items.get(LENGTH), "length")?, "length")?;
        let piece_hashes = extract_pieces(info_items.get(PIECES))?;
        piece_count(piece_hashes.len())?;

        let expected = total_length.div_ceil(raw_piece_length);
        if piece_hashes.len() as u64 != expected {
            return Err(ParseError::PieceCountMismatch {
                hashes: piece_hashes.len(),
                expected,
                length: total_length,
                piece_length: raw_piece_length,
            });
        }

        Ok(Metainfo {
            announce: required(extract_string(items.get(ANNOUNCE), "announce")?, "announce")?,
            announce_list: extract_announce_list(items.get(ANNOUNCE_LIST))?,
            comment: extract_string(items.get(COMMENT), "comment")?,
            created_by: extract_string(items.get(CREATED_BY), "created by")?,
            creation_date: extract_uint(items.get(CREATION_DATE), "creation date")?,
            name: required(extract_string(info_items.get(NAME), "name")?, "name")?,
            info_hash: sha1_hash(&Vec::from(info)),
            piece_hashes,
            piece_length,
            total_length,
        })
    }
}

impl Metainfo {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let value = BencodeValue::try_from(raw)?;
        Metainfo::try_from(&value)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read(path)?;
        Metainfo::parse(&raw)
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size of piece `index`; only the last piece may be shorter than `piece_length`.
    pub fn piece_len(&self, index: u32) -> u32 {
        let remaining = self.total_length.saturating_sub(u64::from(index) * u64::from(self.piece_length));
        u32::try_from(remaining).map_or(self.piece_length, |remaining| remaining.min(self.piece_length))
    }

    /// Byte offset of piece `index` within the file.
    pub fn piece_offset(&self, index: u32) -> u64 {
        u64::from(index) * u64::from(self.piece_length)
    }

    pub fn piece_work(&self) -> impl Iterator<Item = PieceWork> + '_ {
        (0u32..).zip(&self.piece_hashes).map(|(index, hash)| {
            PieceWork { index, hash: *hash, length: self.piece_len(index) }
        })
    }

    /// Announce query parameters. `info_hash` and `peer_id` are raw bytes, so
    /// they are returned already percent-encoded.
    pub fn tracker_request_params(&self, peer_id: &PeerId, port: u16) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("info_hash", percent_encode(&self.info_hash, NON_ALPHANUMERIC).to_string()),
            ("peer_id", percent_encode(peer_id.as_bytes(), NON_ALPHANUMERIC).to_string()),
            ("port", port.to_string()),
            ("uploaded", "0".to_string()),
            ("downloaded", "0".to_string()),
            ("left", self.total_length.to_string()),
            ("compact", "1".to_string()),
        ])
    }

    pub fn announce_url(&self, peer_id: &PeerId, port: u16) -> Result<Url> {
        let mut url = Url::parse(&self.announce)
            .map_err(|_| ParseError::InvalidAnnounceUrl(self.announce.clone()))?;

        let params = self.tracker_request_params(peer_id, port)
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&");

        // values are pre-encoded, so bypass query_pairs_mut which would encode them again
        let query = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{existing}&{params}"),
            _ => params,
        };
        url.set_query(Some(&query));
        Ok(url)
    }
}

/// Piece indices travel as 32-bit integers on the wire.
fn piece_count(num: usize) -> Result<u32> {
    u32::try_from(num).map_err(|_| ParseError::TooManyPieces(num))
}

fn required<T>(value: Option<T>, name: &'static str) -> Result<T> {
    value.ok_or(ParseError::MissingRequiredKey(name))
}

fn convert_string(value: &BencodeValue) -> Option<String> {
    value.as_bytes().and_then(|bytes| std::str::from_utf8(bytes).ok()).map(str::to_owned)
}

fn extract_string(value: Option<&BencodeValue>, name: &'static str) -> Result<Option<String>> {
    match value {
        Some(v) => convert_string(v).map(Some).ok_or(ParseError::KeyDoesNotMapToString(name)),
        None => Ok(None),
    }
}

pub(crate) fn extract_uint(value: Option<&BencodeValue>, name: &'static str) -> Result<Option<u64>> {
    match value {
        Some(BencodeValue::Integer(num)) if *num < 0 => Err(ParseError::NegativeInteger(name, *num)),
        Some(BencodeValue::Integer(num)) => Ok(Some(*num as u64)),
        Some(_) => Err(ParseError::KeyDoesNotMapToInteger(name)),
        None => Ok(None),
    }
}

fn extract_announce_list(value: Option<&BencodeValue>) -> Result<Vec<String>> {
    let mut urls = Vec::new();
    let Some(value) = value else {
        return Ok(urls);
    };
    let BencodeValue::List(tiers) = value else {
        return Err(ParseError::KeyDoesNotMapToList("announce-list"));
    };
    for tier in tiers {
        match tier {
            BencodeValue::List(elements) => {
                for element in elements {
                    urls.push(convert_string(element).ok_or(ParseError::KeyDoesNotMapToString("announce-list"))?);
                }
            },
            _ => urls.push(convert_string(tier).ok_or(ParseError::KeyDoesNotMapToString("announce-list"))?),
        }
    }
    Ok(urls)
}

fn extract_pieces(value: Option<&BencodeValue>) -> Result<Vec<[u8; HASH_LEN]>> {
    let bytes = value
        .ok_or(ParseError::MissingRequiredKey("pieces"))?
        .as_bytes()
        .ok_or(ParseError::KeyDoesNotMapToString("pieces"))?;
    if bytes.len() % HASH_LEN != 0 {
        return Err(ParseError::InvalidPiecesLength(bytes.len()));
    }
    let mut hashes = Vec::with_capacity(bytes.len() / HASH_LEN);
    for chunk in bytes.chunks_exact(HASH_LEN) {
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(chunk);
        hashes.push(hash);
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::torrent_bytes;

    #[test]
    fn parses_single_file_torrent() {
        let content: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let raw = torrent_bytes("http://tracker.example/announce", &content, 1024);
        let metainfo = Metainfo::parse(&raw).unwrap();

        assert_eq!(metainfo.name, "sample.bin");
        assert_eq!(metainfo.total_length, 2500);
        assert_eq!(metainfo.piece_length, 1024);
        assert_eq!(metainfo.num_pieces(), 3);
        assert_eq!(metainfo.comment.as_deref(), Some("test torrent"));
        assert_eq!(metainfo.piece_hashes[2], sha1_hash(&content[2048..]));
        assert_eq!(metainfo.piece_len(0), 1024);
        assert_eq!(metainfo.piece_len(2), 452);
    }

    #[test]
    fn info_hash_covers_exact_info_bytes() {
        let raw = torrent_bytes("http://tracker.example/announce", b"hello world", 4);
        let metainfo = Metainfo::parse(&raw).unwrap();

        let start = raw.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        let info_bytes = &raw[start..raw.len() - 1];
        assert_eq!(metainfo.info_hash, sha1_hash(info_bytes));
    }

    #[test]
    fn piece_count_matches_length() {
        for (len, piece_length) in [(1usize, 1usize), (16, 16), (17, 16), (1000, 7), (4096, 1024)] {
            let content = vec![7u8; len];
            let metainfo = Metainfo::parse(&torrent_bytes("http://t/a", &content, piece_length)).unwrap();
            assert_eq!(metainfo.num_pieces() as u64, (len as u64).div_ceil(piece_length as u64));
            let sum: u64 = metainfo.piece_work().map(|w| u64::from(w.length)).sum();
            assert_eq!(sum, len as u64);
        }
    }

    #[test]
    fn rejects_bad_pieces_length() {
        let raw = b"d8:announce3:url4:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces3:abcee";
        assert!(matches!(Metainfo::parse(raw), Err(ParseError::InvalidPiecesLength(3))));
    }

    #[test]
    fn rejects_piece_count_mismatch() {
        let raw = b"d8:announce3:url4:infod6:lengthi40e4:name1:a12:piece lengthi10e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        assert!(matches!(Metainfo::parse(raw), Err(ParseError::PieceCountMismatch { hashes: 1, expected: 4, .. })));
    }

    #[test]
    fn rejects_piece_length_beyond_wire_range() {
        let raw = b"d8:announce3:url4:infod6:lengthi16e4:name1:a12:piece lengthi4294967312e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        assert!(matches!(Metainfo::parse(raw), Err(ParseError::PieceLengthTooLarge(4294967312))));

        let largest = b"d8:announce3:url4:infod6:lengthi16e4:name1:a12:piece lengthi4294967295e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        let metainfo = Metainfo::parse(largest).unwrap();
        assert_eq!(metainfo.piece_length, u32::MAX);
        assert_eq!(metainfo.piece_work().map(|w| w.length).collect::<Vec<_>>(), vec![16]);
    }

    #[test]
    fn piece_count_must_fit_wire_index() {
        assert_eq!(piece_count(3).unwrap(), 3);
        assert_eq!(piece_count(u32::MAX as usize).unwrap(), u32::MAX);
        let too_many = u32::MAX as usize + 1;
        assert!(matches!(piece_count(too_many), Err(ParseError::TooManyPieces(n)) if n == too_many));
    }

    #[test]
    fn rejects_missing_fields_and_multi_file() {
        let no_announce = b"d4:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        assert!(matches!(Metainfo::parse(no_announce), Err(ParseError::MissingRequiredKey("announce"))));

        let no_info = b"d8:announce3:urle";
        assert!(matches!(Metainfo::parse(no_info), Err(ParseError::MissingRequiredKey("info"))));

        let multi = b"d8:announce3:url4:infod5:filesle4:name1:a12:piece lengthi1e6:pieces0:ee";
        assert!(matches!(Metainfo::parse(multi), Err(ParseError::MultipleFilesUnsupported)));
    }

    #[test]
    fn announce_url_carries_encoded_params() {
        let raw = torrent_bytes("http://tracker.example/announce?key=abc", b"data", 4);
        let metainfo = Metainfo::parse(&raw).unwrap();
        let peer_id = PeerId::from(*b"-PM0100-abcdefghijkl");

        let params = metainfo.tracker_request_params(&peer_id, 6881);
        assert_eq!(params["left"], "4");
        assert_eq!(params["compact"], "1");
        assert_eq!(params["peer_id"], "%2DPM0100%2Dabcdefghijkl");
        let decoded: Vec<u8> = percent_encoding::percent_decode_str(&params["info_hash"]).collect();
        assert_eq!(decoded, metainfo.info_hash);

        let url = metainfo.announce_url(&peer_id, 6881).unwrap();
        let query = url.query().unwrap();
        assert!(query.starts_with("key=abc&"));
        assert!(query.contains("port=6881"));
        assert!(query.contains(&format!("info_hash={}", params["info_hash"])));
    }
}
