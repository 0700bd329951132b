use std::result::Result;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::peer::{PeerError, PeerId};
use crate::util;

const P_STR: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: &PeerId) -> Self {
        Handshake { reserved: [0; 8], info_hash, peer_id: *peer_id.as_bytes() }
    }
}

impl TryFrom<&[u8; HANDSHAKE_LEN]> for Handshake {
    type Error = PeerError;

    fn try_from(bytes: &[u8; HANDSHAKE_LEN]) -> Result<Self, PeerError> {
        if bytes[0] as usize != P_STR.len() {
            return Err(PeerError::InvalidHandshake(format!("protocol string length {}", bytes[0])));
        }
        if bytes[1..20] != *P_STR {
            return Err(PeerError::InvalidHandshake(format!(
                "unknown protocol '{}'", String::from_utf8_lossy(&bytes[1..20]))));
        }
        let mut handshake = Handshake { reserved: [0; 8], info_hash: [0; 20], peer_id: [0; 20] };
        handshake.reserved.copy_from_slice(&bytes[20..28]);
        handshake.info_hash.copy_from_slice(&bytes[28..48]);
        handshake.peer_id.copy_from_slice(&bytes[48..68]);
        Ok(handshake)
    }
}

impl From<&Handshake> for [u8; HANDSHAKE_LEN] {
    fn from(handshake: &Handshake) -> [u8; HANDSHAKE_LEN] {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        bytes[0] = P_STR.len() as u8;
        bytes[1..20].copy_from_slice(P_STR);
        bytes[20..28].copy_from_slice(&handshake.reserved);
        bytes[28..48].copy_from_slice(&handshake.info_hash);
        bytes[48..68].copy_from_slice(&handshake.peer_id);
        bytes
    }
}

/// Sends our handshake, reads theirs and checks that both sides are in the
/// same swarm. Returns the remote handshake.
pub async fn exchange<S>(stream: &mut S, info_hash: [u8; 20], peer_id: &PeerId) -> Result<Handshake, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mine = Handshake::new(info_hash, peer_id);
    stream.write_all(&<[u8; HANDSHAKE_LEN]>::from(&mine)).await?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;
    let theirs = Handshake::try_from(&buf)?;

    if theirs.info_hash != mine.info_hash {
        return Err(PeerError::HandshakeMismatch {
            ours: util::to_string(&mine.info_hash),
            theirs: util::to_string(&theirs.info_hash),
        });
    }
    Ok(theirs)
}
