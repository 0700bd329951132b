pub mod connection;
pub mod handshake;
pub mod message;

use std::fmt;

use rand::Rng;
use rand::distr::Alphanumeric;
use thiserror::Error;

pub use connection::{ConnectionState, PeerConnection};
pub use message::{Frame, Message, MessageError};

const CLIENT_PREFIX: &[u8; 8] = b"-PM0100-";

/// Local peer identity, generated once per process and passed explicitly to
/// everything that needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerId([u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(CLIENT_PREFIX);
        for (byte, random) in id[8..].iter_mut().zip(rand::rng().sample_iter(Alphanumeric)) {
            *byte = random;
        }
        PeerId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(bytes: [u8; 20]) -> Self {
        PeerId(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("peer announced info hash {theirs} but we expected {ours}")]
    HandshakeMismatch { ours: String, theirs: String },
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("peer does not have piece {0}")]
    PieceUnavailable(u32),
    #[error("connection is closed")]
    Closed,
}

impl PeerError {
    /// Errors after which the connection cannot be reused.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PeerError::PieceUnavailable(_))
    }
}

/// Which pieces a peer has, most significant bit first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    masks: Vec<u8>,
    num: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitfieldError {
    #[error("{num_bytes} bytes cannot describe {num_pieces} pieces")]
    WrongLength { num_pieces: usize, num_bytes: usize },
    #[error("spare bits set past piece {num_pieces}")]
    SpareBitsSet { num_pieces: usize },
    #[error("piece {index} out of range (0..{len})")]
    PieceOutOfRange { index: usize, len: usize },
}

impl Bitfield {
    pub fn new(num: usize) -> Self {
        Bitfield { masks: vec![0; num.div_ceil(8)], num }
    }

    pub fn try_from_vec(masks: Vec<u8>, num: usize) -> Result<Self, BitfieldError> {
        if masks.len() != num.div_ceil(8) {
            return Err(BitfieldError::WrongLength { num_pieces: num, num_bytes: masks.len() });
        }
        let extra = num % 8;
        if extra != 0 {
            let spare: u8 = 0xFF >> extra;
            if masks.last().is_some_and(|last| last & spare != 0) {
                return Err(BitfieldError::SpareBitsSet { num_pieces: num });
            }
        }
        Ok(Bitfield { masks, num })
    }

    fn locate(&self, index: usize) -> Result<(usize, u8), BitfieldError> {
        if index >= self.num {
            return Err(BitfieldError::PieceOutOfRange { index, len: self.num });
        }
        Ok((index / 8, 1 << (7 - index % 8)))
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.locate(index).is_ok_and(|(element, mask)| self.masks[element] & mask != 0)
    }

    pub fn mark_piece(&mut self, index: usize) -> Result<(), BitfieldError> {
        let (element, mask) = self.locate(index)?;
        self.masks[element] |= mask;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.num
    }

    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    pub fn num_set(&self) -> usize {
        self.masks.iter().map(|mask| mask.count_ones() as usize).sum()
    }

    pub fn all(&self) -> bool {
        self.num_set() == self.num
    }

    pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num).filter(|&i| !self.has_piece(i))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.masks
    }
}
