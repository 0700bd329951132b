use std::path::{Path, PathBuf};
use std::sync::Arc;

use indicatif::ProgressBar;
use thiserror::Error;
use tracing::info;

pub mod config;
pub mod metadata;
pub mod peer;
pub mod scheduler;
mod util;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use metadata::file::{Metainfo, ParseError};
pub use metadata::tracker::{AnnounceError, TrackerClient};
pub use peer::{Bitfield, PeerId};
pub use scheduler::{PieceScheduler, SchedulerError};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Announce(#[from] AnnounceError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("unable to write output: {0}")]
    Output(#[from] std::io::Error),
}

pub fn parse_torrent<P: AsRef<Path>>(path: P) -> Result<Metainfo, Error> {
    Ok(Metainfo::from_path(path)?)
}

/// Fetches the file described by `torrent` and writes it to `output`, or to
/// the torrent's suggested name when `output` is `None`.
pub async fn download<P: AsRef<Path>>(
    torrent: P,
    output: Option<PathBuf>,
    config: &Config,
    progress: ProgressBar,
) -> Result<PathBuf, Error> {
    let metainfo = Arc::new(parse_torrent(torrent)?);
    let output = output.unwrap_or_else(|| PathBuf::from(&metainfo.name));
    let peer_id = PeerId::generate();
    info!(name = %metainfo.name, pieces = metainfo.num_pieces(), %peer_id, "starting download");

    let tracker = TrackerClient::new(config.tracker_timeout)?;
    let announce = tracker.announce(&metainfo, &peer_id, config.port).await?;

    let scheduler = PieceScheduler::new(metainfo, peer_id, config.clone()).with_progress(progress);
    let bytes = scheduler.run(&announce.peers).await?;

    util::io::write_output(&output, &bytes)?;
    info!(path = %output.display(), bytes = bytes.len(), "output written");
    Ok(output)
}
