use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::metadata::file::PieceWork;
use crate::peer::handshake;
use crate::peer::message::{self, Frame, Message, MessageError};
use crate::peer::{Bitfield, PeerError, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Ready,
    Closed,
}

/// One connection to one remote peer. Only the worker that owns it touches
/// its state.
#[derive(Debug)]
pub struct PeerConnection<S = TcpStream> {
    pub address: SocketAddr,
    pub remote_id: [u8; 20],
    stream: S,
    state: ConnectionState,
    num_pieces: usize,
    peer_choking: bool,
    am_interested: bool,
    peer_bitfield: Option<Bitfield>,
    config: Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Pending,
    Requested,
    Received,
}

/// Reassembly buffer for one piece. Blocks land at their own offset, so the
/// result is in request order no matter how replies arrive.
#[derive(Debug)]
struct PieceProgress {
    data: Vec<u8>,
    block_size: u32,
    blocks: Vec<BlockState>,
}

impl PieceProgress {
    fn new(length: u32, block_size: u32) -> Self {
        let num_blocks = length.div_ceil(block_size) as usize;
        PieceProgress {
            data: vec![0; length as usize],
            block_size,
            blocks: vec![BlockState::Pending; num_blocks],
        }
    }

    fn block_len(&self, block: usize) -> u32 {
        let begin = block as u32 * self.block_size;
        self.block_size.min(self.data.len() as u32 - begin)
    }

    fn in_flight(&self) -> usize {
        self.blocks.iter().filter(|&&b| b == BlockState::Requested).count()
    }

    fn complete(&self) -> bool {
        self.blocks.iter().all(|&b| b == BlockState::Received)
    }

    fn next_request(&mut self) -> Option<(u32, u32)> {
        let block = self.blocks.iter().position(|&b| b == BlockState::Pending)?;
        self.blocks[block] = BlockState::Requested;
        Some((block as u32 * self.block_size, self.block_len(block)))
    }

    /// Stores a block we asked for. Anything else is rejected.
    fn accept(&mut self, begin: u32, bytes: &[u8]) -> bool {
        if begin % self.block_size != 0 {
            return false;
        }
        let block = (begin / self.block_size) as usize;
        if self.blocks.get(block) != Some(&BlockState::Requested) || bytes.len() != self.block_len(block) as usize {
            return false;
        }
        let start = begin as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.blocks[block] = BlockState::Received;
        true
    }

    /// Blocks asked for but not yet delivered, as `(begin, length)`.
    fn requested(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == BlockState::Requested)
            .map(|(block, _)| (block as u32 * self.block_size, self.block_len(block)))
    }

    /// A choke discards every outstanding request on the remote side.
    fn reset_in_flight(&mut self) {
        for block in self.blocks.iter_mut().filter(|b| **b == BlockState::Requested) {
            *block = BlockState::Pending;
        }
    }
}

impl PeerConnection<TcpStream> {
    pub async fn connect(
        address: SocketAddr,
        info_hash: [u8; 20],
        peer_id: &PeerId,
        num_pieces: usize,
        config: &Config,
    ) -> Result<Self, PeerError> {
        debug!(%address, state = ?ConnectionState::Connecting, "dialing peer");
        let stream = timeout(config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| PeerError::Timeout)??;
        PeerConnection::establish(stream, address, info_hash, peer_id, num_pieces, config).await
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs the handshake over an already open stream. The connection is only
    /// handed out once it is `Ready`; on failure the stream is dropped.
    pub async fn establish(
        mut stream: S,
        address: SocketAddr,
        info_hash: [u8; 20],
        peer_id: &PeerId,
        num_pieces: usize,
        config: &Config,
    ) -> Result<Self, PeerError> {
        debug!(%address, state = ?ConnectionState::Handshaking, "exchanging handshakes");
        let remote = timeout(config.message_timeout, handshake::exchange(&mut stream, info_hash, peer_id))
            .await
            .map_err(|_| PeerError::Timeout)??;
        info!(%address, remote_id = %String::from_utf8_lossy(&remote.peer_id), "handshake complete");

        Ok(PeerConnection {
            address,
            remote_id: remote.peer_id,
            stream,
            state: ConnectionState::Ready,
            num_pieces,
            peer_choking: true,
            am_interested: false,
            peer_bitfield: None,
            config: config.clone(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    pub fn peer_bitfield(&self) -> Option<&Bitfield> {
        self.peer_bitfield.as_ref()
    }

    /// Whether the peer may have `index`. A peer that has not announced
    /// anything yet is given the benefit of the doubt.
    pub fn may_have(&self, index: u32) -> bool {
        self.peer_bitfield.as_ref().is_none_or(|bf| bf.has_piece(index as usize))
    }

    fn closed_by(&mut self, error: PeerError) -> PeerError {
        if error.is_fatal() {
            self.state = ConnectionState::Closed;
        }
        error
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        if self.state != ConnectionState::Ready {
            return Err(PeerError::Closed);
        }
        trace!(address = %self.address, ?message, "sending");
        let frame = Frame::from(message);
        match timeout(self.config.message_timeout, message::write_frame(&mut self.stream, Some(&frame))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.closed_by(e.into())),
            Err(_) => Err(self.closed_by(PeerError::Timeout)),
        }
    }

    pub async fn receive(&mut self) -> Result<Option<Message>, PeerError> {
        let wait = self.config.message_timeout;
        self.receive_within(wait).await
    }

    /// Reads the next message and applies it to the connection state.
    /// Keep-alives and messages with unknown ids yield `None`.
    async fn receive_within(&mut self, wait: Duration) -> Result<Option<Message>, PeerError> {
        if self.state != ConnectionState::Ready {
            return Err(PeerError::Closed);
        }
        let frame = match timeout(wait, message::read_frame(&mut self.stream)).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                trace!(address = %self.address, "keep-alive");
                return Ok(None);
            },
            Ok(Err(e)) => return Err(self.closed_by(e.into())),
            Err(_) => return Err(self.closed_by(PeerError::Timeout)),
        };
        let message = match Message::try_from(frame) {
            Ok(message) => message,
            Err(MessageError::UnknownId(id)) => {
                debug!(address = %self.address, id, "ignoring message with unknown id");
                return Ok(None);
            },
            Err(e) => return Err(self.closed_by(e.into())),
        };
        if let Err(e) = self.apply(&message) {
            return Err(self.closed_by(e));
        }
        Ok(Some(message))
    }

    fn apply(&mut self, message: &Message) -> Result<(), PeerError> {
        match message {
            Message::Choke => self.peer_choking = true,
            Message::Unchoke => self.peer_choking = false,
            Message::Have { index } => {
                let num_pieces = self.num_pieces;
                self.peer_bitfield
                    .get_or_insert_with(|| Bitfield::new(num_pieces))
                    .mark_piece(*index as usize)
                    .map_err(|e| PeerError::Protocol(e.to_string()))?;
            },
            Message::Bitfield { bitmap } => {
                let bitfield = Bitfield::try_from_vec(bitmap.clone(), self.num_pieces)
                    .map_err(|e| PeerError::Protocol(e.to_string()))?;
                debug!(address = %self.address, pieces = bitfield.num_set(), "received bitfield");
                self.peer_bitfield = Some(bitfield);
            },
            Message::Interested | Message::NotInterested | Message::Request { .. } | Message::Cancel { .. } => {
                trace!(address = %self.address, ?message, "ignoring upload-side message");
            },
            Message::Piece { .. } => (),
        }
        Ok(())
    }

    /// Downloads every block of `work`, keeping up to `pipeline_depth`
    /// requests outstanding. The caller verifies the returned bytes.
    pub async fn download_piece(&mut self, work: &PieceWork) -> Result<Vec<u8>, PeerError> {
        if !self.may_have(work.index) {
            return Err(PeerError::PieceUnavailable(work.index));
        }
        if !self.am_interested {
            self.send(&Message::Interested).await?;
            self.am_interested = true;
        }

        let mut progress = PieceProgress::new(work.length, self.config.block_size);
        let mut last_block = Instant::now();

        while !progress.complete() {
            if !self.peer_choking {
                while progress.in_flight() < self.config.pipeline_depth {
                    let Some((begin, length)) = progress.next_request() else {
                        break;
                    };
                    self.send(&Message::Request { index: work.index, begin, length }).await?;
                }
            }

            let remaining = (last_block + self.config.idle_timeout).saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.closed_by(PeerError::Timeout));
            }
            let wait = self.config.message_timeout.min(remaining);

            match self.receive_within(wait).await? {
                Some(Message::Piece { index, begin, block }) if index == work.index => {
                    if progress.accept(begin, &block) {
                        last_block = Instant::now();
                    } else {
                        debug!(address = %self.address, index, begin, len = block.len(), "discarding unrequested block");
                    }
                },
                Some(Message::Piece { index, begin, .. }) => {
                    debug!(address = %self.address, index, begin, "discarding block for another piece");
                },
                Some(Message::Choke) => {
                    debug!(address = %self.address, index = work.index, "choked mid-piece");
                    progress.reset_in_flight();
                },
                Some(Message::Bitfield { .. } | Message::Have { .. }) if !self.may_have(work.index) => {
                    let outstanding: Vec<_> = progress.requested().collect();
                    for (begin, length) in outstanding {
                        self.send(&Message::Cancel { index: work.index, begin, length }).await?;
                    }
                    return Err(PeerError::PieceUnavailable(work.index));
                },
                _ => (),
            }
        }

        Ok(progress.data)
    }

    /// Shuts the connection down. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        let _ = self.stream.shutdown().await;
        debug!(address = %self.address, "connection closed");
    }
}
