use std::collections::HashSet;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metadata::file::{Metainfo, PieceWork};
use crate::peer::{Bitfield, PeerConnection, PeerError, PeerId};
use crate::scheduler::queue::WorkQueue;
use crate::scheduler::{WorkerEvent, verify};

/// Pause after requeueing a piece this peer cannot serve.
const SKIP_BACKOFF: Duration = Duration::from_millis(50);

/// Drains the shared queue through one peer until the queue closes or the
/// peer is no longer worth talking to.
pub(crate) struct Worker {
    pub address: SocketAddrV4,
    metainfo: Arc<Metainfo>,
    peer_id: PeerId,
    config: Config,
    queue: Arc<WorkQueue>,
    events: mpsc::Sender<WorkerEvent>,
    done: watch::Receiver<Bitfield>,
    skip_set: HashSet<u32>,
    verification_failures: usize,
    connection_attempts: usize,
}

enum Outcome {
    Continue,
    Stop,
}

impl Worker {
    pub(crate) fn new(
        address: SocketAddrV4,
        metainfo: Arc<Metainfo>,
        peer_id: PeerId,
        config: Config,
        queue: Arc<WorkQueue>,
        events: mpsc::Sender<WorkerEvent>,
        done: watch::Receiver<Bitfield>,
    ) -> Self {
        Worker {
            address,
            metainfo,
            peer_id,
            config,
            queue,
            events,
            done,
            skip_set: HashSet::new(),
            verification_failures: 0,
            connection_attempts: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut connection: Option<PeerConnection> = None;

        while let Some(work) = self.queue.pop().await {
            if self.skip_set.contains(&work.index) {
                self.queue.push(work).await;
                if self.exhausted() {
                    debug!(address = %self.address, skipped = self.skip_set.len(), "nothing left this peer can serve");
                    break;
                }
                tokio::time::sleep(SKIP_BACKOFF).await;
                continue;
            }

            let mut conn = match connection.take() {
                Some(conn) => conn,
                None => match self.connect().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        let stop = matches!(e, PeerError::HandshakeMismatch { .. })
                            || self.connection_attempts >= self.config.max_connection_attempts;
                        self.give_back(work, &e.to_string()).await;
                        if stop {
                            break;
                        }
                        continue;
                    },
                },
            };

            let outcome = match conn.download_piece(&work).await {
                Ok(data) => {
                    connection = Some(conn);
                    self.deliver(work, data).await
                },
                Err(e @ PeerError::PieceUnavailable(_)) => {
                    connection = Some(conn);
                    self.skip_set.insert(work.index);
                    self.give_back(work, &e.to_string()).await;
                    Outcome::Continue
                },
                Err(e) => {
                    conn.close().await;
                    let exhausted = self.connection_attempts >= self.config.max_connection_attempts;
                    self.give_back(work, &e.to_string()).await;
                    if exhausted { Outcome::Stop } else { Outcome::Continue }
                },
            };
            if let Outcome::Stop = outcome {
                break;
            }
        }

        if let Some(mut conn) = connection {
            conn.close().await;
        }
        info!(address = %self.address, "worker finished");
    }

    /// True once every piece still missing is one this peer failed to serve.
    fn exhausted(&self) -> bool {
        let done = self.done.borrow();
        done.missing().all(|index| self.skip_set.contains(&(index as u32)))
    }

    async fn connect(&mut self) -> Result<PeerConnection, PeerError> {
        self.connection_attempts += 1;
        PeerConnection::connect(
            SocketAddr::V4(self.address),
            self.metainfo.info_hash,
            &self.peer_id,
            self.metainfo.num_pieces(),
            &self.config,
        )
        .await
    }

    async fn deliver(&mut self, work: PieceWork, data: Vec<u8>) -> Outcome {
        match verify(&work, data) {
            Ok(result) => {
                debug!(address = %self.address, index = work.index, "piece verified");
                // The assembler only hangs up once every piece is in.
                let _ = self.events.send(WorkerEvent::Completed(result)).await;
                Outcome::Continue
            },
            Err(e) => {
                self.verification_failures += 1;
                self.skip_set.insert(work.index);
                warn!(address = %self.address, index = work.index, failures = self.verification_failures, "{e}");
                self.give_back(work, &e.to_string()).await;
                if self.verification_failures >= self.config.max_verification_failures {
                    Outcome::Stop
                } else {
                    Outcome::Continue
                }
            },
        }
    }

    /// Requeues `work` before reporting so a piece is never held by an
    /// exiting worker.
    async fn give_back(&self, work: PieceWork, reason: &str) {
        let index = work.index;
        self.queue.push(work).await;
        debug!(address = %self.address, index, reason, "piece requeued");
        let reason = format!("{}: {reason}", self.address);
        let _ = self.events.send(WorkerEvent::Failed { index, reason }).await;
    }
}
