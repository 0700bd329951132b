//! Distributes pieces across peer workers, verifies what they fetch and
//! assembles the verified pieces into the output buffer.

pub mod queue;
mod worker;

use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::sync::Arc;

use indicatif::ProgressBar;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metadata::file::{Metainfo, PieceWork};
use crate::peer::{Bitfield, PeerId};
use crate::util::{self, sha1_hash};

pub use queue::WorkQueue;
use worker::Worker;

/// A piece whose bytes matched the expected hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceResult {
    pub index: u32,
    pub data: Vec<u8>,
    pub verified: bool,
}

#[derive(Debug)]
pub enum WorkerEvent {
    Completed(PieceResult),
    Failed { index: u32, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("piece {index} hash mismatch: expected {expected}, got {actual}")]
pub struct VerificationError {
    pub index: u32,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{} pieces could not be downloaded", .missing.len())]
    Incomplete { missing: Vec<(u32, String)> },
    #[error("a {length} byte file cannot be held in memory")]
    OutputTooLarge { length: u64 },
}

/// Checks `data` against the piece hash. Only data that passes is ever handed
/// to the assembler.
pub fn verify(work: &PieceWork, data: Vec<u8>) -> Result<PieceResult, VerificationError> {
    let actual = sha1_hash(&data);
    if data.len() == work.length as usize && actual == work.hash {
        Ok(PieceResult { index: work.index, data, verified: true })
    } else {
        Err(VerificationError {
            index: work.index,
            expected: util::to_string(&work.hash),
            actual: util::to_string(&actual),
        })
    }
}

fn allocate_output(length: u64) -> Result<Vec<u8>, SchedulerError> {
    let too_large = || SchedulerError::OutputTooLarge { length };
    let len = usize::try_from(length).map_err(|_| too_large())?;
    let mut output = Vec::new();
    output.try_reserve_exact(len).map_err(|_| too_large())?;
    output.resize(len, 0);
    Ok(output)
}

pub struct PieceScheduler {
    metainfo: Arc<Metainfo>,
    peer_id: PeerId,
    config: Config,
    progress: ProgressBar,
}

impl PieceScheduler {
    pub fn new(metainfo: Arc<Metainfo>, peer_id: PeerId, config: Config) -> Self {
        PieceScheduler { metainfo, peer_id, config, progress: ProgressBar::hidden() }
    }

    /// Reports one tick per verified piece on `progress`.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Downloads every piece from `peers` and returns the assembled content.
    ///
    /// At most `max_peers` workers run at once. Peers beyond that are held in
    /// reserve and take over as workers finish, so the run only gives up once
    /// every peer has been tried.
    pub async fn run(&self, peers: &[SocketAddrV4]) -> Result<Vec<u8>, SchedulerError> {
        let num_pieces = self.metainfo.num_pieces();
        if num_pieces == 0 {
            return Ok(Vec::new());
        }
        if peers.is_empty() {
            warn!("no peers to download from");
            let missing = self
                .metainfo
                .piece_work()
                .map(|work| (work.index, "tracker returned no peers".to_string()))
                .collect();
            return Err(SchedulerError::Incomplete { missing });
        }
        let mut output = allocate_output(self.metainfo.total_length)?;

        let queue = Arc::new(WorkQueue::new(num_pieces));
        for work in self.metainfo.piece_work() {
            queue.push(work).await;
        }

        let (events_tx, mut events) = mpsc::channel(num_pieces);
        let (done, done_rx) = watch::channel(Bitfield::new(num_pieces));
        let mut workers = JoinSet::new();
        let mut reserve = peers.iter().copied();
        for address in reserve.by_ref().take(self.config.max_peers.max(1)) {
            self.spawn_worker(&mut workers, address, &queue, &events_tx, &done_rx);
        }
        info!(workers = workers.len(), reserve = reserve.len(), pieces = num_pieces, "download started");
        // Held only while replacements may still be spawned; once dropped,
        // the event stream ends with the last worker.
        let mut events_tx = (reserve.len() > 0).then_some(events_tx);

        self.progress.set_length(num_pieces as u64);
        let mut last_errors = BTreeMap::new();

        while !done.borrow().all() {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    match event {
                        WorkerEvent::Completed(piece) if done.borrow().has_piece(piece.index as usize) => {
                            debug!(index = piece.index, "duplicate piece ignored");
                        },
                        WorkerEvent::Completed(piece) => {
                            let start = self.metainfo.piece_offset(piece.index) as usize;
                            output[start..start + piece.data.len()].copy_from_slice(&piece.data);
                            done.send_modify(|done| {
                                // Index came from our own piece list.
                                let _ = done.mark_piece(piece.index as usize);
                            });
                            last_errors.remove(&piece.index);
                            self.progress.inc(1);
                        },
                        WorkerEvent::Failed { index, reason } => {
                            last_errors.insert(index, reason);
                        },
                    }
                },
                Some(joined) = workers.join_next(), if events_tx.is_some() => {
                    if let Err(e) = joined {
                        warn!("worker task failed: {e}");
                    }
                    if let (Some(address), Some(tx)) = (reserve.next(), events_tx.as_ref()) {
                        info!(%address, remaining = reserve.len(), "bringing in a reserve peer");
                        self.spawn_worker(&mut workers, address, &queue, tx, &done_rx);
                    }
                    if reserve.len() == 0 {
                        events_tx = None;
                    }
                },
            }
        }

        queue.close();
        drop(events_tx);
        drop(events);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("worker task failed: {e}");
            }
        }

        let done = done.borrow();
        if done.all() {
            self.progress.finish();
            info!(bytes = output.len(), "all pieces verified");
            return Ok(output);
        }

        let missing: Vec<(u32, String)> = done
            .missing()
            .map(|index| {
                let index = index as u32;
                let reason = last_errors
                    .remove(&index)
                    .unwrap_or_else(|| "no peer attempted this piece".to_string());
                (index, reason)
            })
            .collect();
        self.progress.abandon();
        warn!(missing = missing.len(), "download incomplete");
        Err(SchedulerError::Incomplete { missing })
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<()>,
        address: SocketAddrV4,
        queue: &Arc<WorkQueue>,
        events: &mpsc::Sender<WorkerEvent>,
        done: &watch::Receiver<Bitfield>,
    ) {
        let worker = Worker::new(
            address,
            self.metainfo.clone(),
            self.peer_id,
            self.config.clone(),
            queue.clone(),
            events.clone(),
            done.clone(),
        );
        workers.spawn(worker.run());
    }
}
