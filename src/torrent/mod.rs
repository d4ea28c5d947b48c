//! BitTorrent download engine
//!
//! This module ties the protocol pieces together:
//! - Metainfo parsing (bencode + info-hash)
//! - Tracker communication (HTTP/UDP)
//! - Peer wire protocol
//! - Piece work queue with SHA-1 verification
//!
//! `Client` drives a complete single-file download: it queries trackers
//! until one returns peers, runs one supervised worker per peer, and
//! collects verified pieces into the output file.

pub mod bencode;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod tracker;

pub use bencode::BencodeValue;
pub use metainfo::{Info, Metainfo, Sha1Hash};
pub use peer::{Handshake, PeerConnection, PeerMessage, BLOCK_SIZE, HANDSHAKE_SIZE};
pub use piece::{download_piece, PieceResult, PieceWork, WorkQueue};
pub use tracker::{
    generate_peer_id, parse_compact_peers, AnnounceRequest, AnnounceResponse, PeerAddr,
    TrackerClient,
};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::storage::PieceStore;

/// Capacity of the result channel. Each worker holds at most one
/// in-flight result, so a small buffer only smooths bursts.
const RESULT_CHANNEL_CAPACITY: usize = 64;

/// BitTorrent download client for one torrent
pub struct Client {
    metainfo: Arc<Metainfo>,
    config: ClientConfig,
    peer_id: [u8; 20],
    tracker: TrackerClient,
}

/// Shared state handed to every worker
struct WorkerContext {
    metainfo: Arc<Metainfo>,
    config: ClientConfig,
    peer_id: [u8; 20],
    queue: Arc<WorkQueue>,
    results: mpsc::Sender<PieceResult>,
    cancel: CancellationToken,
}

impl Client {
    /// Create a client for the given torrent.
    ///
    /// Generates a fresh `-PW0001-` peer id for this client instance.
    pub fn new(metainfo: Metainfo, config: ClientConfig) -> Result<Self> {
        let peer_id = generate_peer_id();
        let tracker = TrackerClient::with_timeouts(
            peer_id,
            config.announce_timeout(),
            config.udp_announce_timeout(),
            config.udp_announce_attempts,
        )?;

        Ok(Self {
            metainfo: Arc::new(metainfo),
            config,
            peer_id,
            tracker,
        })
    }

    /// The peer id announced to trackers and peers
    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }

    /// The torrent this client downloads
    pub fn metainfo(&self) -> &Metainfo {
        &self.metainfo
    }

    /// Download the whole payload into `output_dir/<name>`.
    ///
    /// `progress` is called once with `(0, total)` before any piece
    /// completes and once per verified piece written to storage. It must
    /// be cheap; it runs on the collector.
    ///
    /// Returns when every piece has been verified and written. Terminal
    /// errors: no tracker returned peers, or the output file could not
    /// be opened.
    pub async fn download<F>(&self, mut progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let info = &self.metainfo.info;
        let output_path = self.config.output_dir.join(&info.name);

        let store = PieceStore::open(&output_path, info.length).await?;
        tracing::info!(
            "Downloading '{}' ({} bytes, {} pieces) to {}",
            info.name,
            info.length,
            info.num_pieces(),
            output_path.display()
        );

        let peers = self.discover_peers().await?;
        tracing::info!("Starting {} peer supervisors", peers.len());

        let queue = Arc::new(WorkQueue::seeded(&self.metainfo));
        let (result_tx, mut result_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let ctx = Arc::new(WorkerContext {
            metainfo: Arc::clone(&self.metainfo),
            config: self.config.clone(),
            peer_id: self.peer_id,
            queue: Arc::clone(&queue),
            results: result_tx,
            cancel: cancel.clone(),
        });

        let mut supervisors = Vec::with_capacity(peers.len());
        for peer in peers {
            let ctx = Arc::clone(&ctx);
            supervisors.push(tokio::spawn(run_supervisor(ctx, peer)));
        }
        // The collector holds no result sender; when it stops receiving,
        // only workers keep the channel open
        drop(ctx);

        let total = info.num_pieces();
        let mut done = 0usize;
        progress(done, total);

        while done < total {
            let Some(result) = result_rx.recv().await else {
                // Every supervisor died with the channel. Unreachable in
                // practice since supervisors only exit on cancellation.
                break;
            };

            let index = result.index;
            let offset = index as u64 * info.piece_length;

            match store.write_at(offset, result.data).await {
                Ok(()) => {
                    done += 1;
                    tracing::debug!("Piece {} written ({}/{})", index, done, total);
                    progress(done, total);
                }
                Err(e) => {
                    // Not counted: put the piece back so another worker
                    // redelivers it
                    tracing::warn!("Error writing piece {}: {}", index, e);
                    if let Some(work) = PieceWork::for_piece(&self.metainfo, index as usize) {
                        queue.push(work);
                    }
                }
            }
        }

        cancel.cancel();
        for handle in supervisors {
            handle.abort();
        }

        if done < total {
            return Err(ClientError::Internal(
                "All peer supervisors exited before the download completed".to_string(),
            ));
        }

        store.sync().await?;
        tracing::info!("Download of '{}' complete", info.name);

        Ok(())
    }

    /// Query trackers in order until one returns at least one peer.
    ///
    /// Individual tracker failures are logged and skipped; only all
    /// trackers coming up empty is an error.
    async fn discover_peers(&self) -> Result<Vec<PeerAddr>> {
        let request = AnnounceRequest {
            info_hash: self.metainfo.info_hash,
            peer_id: self.peer_id,
            port: self.config.listen_port,
            uploaded: 0,
            downloaded: 0,
            left: self.metainfo.info.length,
        };

        let trackers = self.metainfo.all_trackers();
        tracing::debug!("Trying {} trackers", trackers.len());

        for tracker_url in &trackers {
            match self.tracker.announce(tracker_url, &request).await {
                Ok(response) if !response.peers.is_empty() => {
                    tracing::info!(
                        "Tracker {} returned {} peers (interval {}s)",
                        tracker_url,
                        response.peers.len(),
                        response.interval
                    );

                    // One supervisor per address; drop duplicates
                    let mut peers: Vec<PeerAddr> = Vec::with_capacity(response.peers.len());
                    for peer in response.peers {
                        if !peers.contains(&peer) {
                            peers.push(peer);
                        }
                    }
                    return Ok(peers);
                }
                Ok(_) => {
                    tracing::debug!("Tracker {} returned no peers", tracker_url);
                }
                Err(e) => {
                    tracing::warn!("Tracker {} failed: {}", tracker_url, e);
                }
            }
        }

        Err(ClientError::NoPeers)
    }
}

/// Keep one peer worked until the download is cancelled.
///
/// Whenever the worker exits (connect failure, handshake mismatch, dead
/// connection) the supervisor waits and dials the same address again.
async fn run_supervisor(ctx: Arc<WorkerContext>, peer: PeerAddr) {
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }

        match run_worker(&ctx, peer).await {
            Ok(()) => return, // cancelled
            Err(e) => {
                tracing::debug!("Worker for {} exited: {}", peer, e);
            }
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            _ = tokio::time::sleep(ctx.config.restart_delay()) => {}
        }
    }
}

/// One connection lifecycle against one peer.
///
/// Dial, handshake, then alternate between waiting out choke and pulling
/// work. Returns `Ok(())` only on cancellation; any connection or
/// protocol failure re-enqueues in-flight work and bubbles up so the
/// supervisor can retry with a fresh connection.
async fn run_worker(ctx: &WorkerContext, peer: PeerAddr) -> Result<()> {
    let num_pieces = ctx.metainfo.info.num_pieces();

    let mut conn = PeerConnection::connect(
        peer.socket_addr(),
        ctx.metainfo.info_hash,
        ctx.peer_id,
        num_pieces,
        ctx.config.connect_timeout(),
        ctx.config.read_timeout(),
    )
    .await?;

    tracing::debug!("Connected to peer {}", peer);

    loop {
        if ctx.cancel.is_cancelled() {
            conn.disconnect().await;
            return Ok(());
        }

        if conn.peer_choking() {
            // Tell the peer we want data, then wait for a message. The
            // read deadline bounds how long a silent peer can hold us.
            conn.express_interest().await?;

            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    conn.disconnect().await;
                    return Ok(());
                }
                msg = conn.recv() => {
                    msg?;
                }
            }
            continue;
        }

        // Unchoked: pull work
        let Some(work) = ctx.queue.pop() else {
            // Nothing pending right now. Other workers may still fail and
            // re-enqueue, so idle rather than exit.
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    conn.disconnect().await;
                    return Ok(());
                }
                _ = tokio::time::sleep(ctx.config.idle_wait()) => {}
            }
            continue;
        };

        if !conn.peer_has_piece(work.index as usize) {
            // Hand it back for a peer that has it and yield so this
            // worker doesn't spin on pieces it can never serve
            ctx.queue.push(work);
            tokio::time::sleep(ctx.config.idle_wait()).await;
            continue;
        }

        let index = work.index;
        match download_piece(&mut conn, &work, ctx.config.piece_timeout()).await {
            Ok(data) => {
                if !work.verify(&data) {
                    // Corrupt data. The piece goes back on the queue; the
                    // peer may still serve other pieces correctly, so the
                    // connection survives. Yield before polling again so
                    // another worker gets a chance at the returned piece.
                    tracing::warn!("Piece {} from {} failed SHA-1 check", index, peer);
                    ctx.queue.push(work);
                    tokio::time::sleep(ctx.config.idle_wait()).await;
                    continue;
                }

                tracing::debug!("Piece {} downloaded and verified from {}", index, peer);

                if ctx
                    .results
                    .send(PieceResult { index, data })
                    .await
                    .is_err()
                {
                    // Collector is gone: download finished
                    conn.disconnect().await;
                    return Ok(());
                }
            }
            Err(e) => {
                // Transport-level failure: return the work and drop the
                // connection so the supervisor can find a fresh one
                ctx.queue.push(work);
                conn.disconnect().await;
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_metainfo() -> Metainfo {
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce9:http://tr4:infod");
        data.extend_from_slice(b"6:lengthi100e4:name4:test12:piece lengthi32768e");
        data.extend_from_slice(b"6:pieces20:");
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"ee");
        Metainfo::parse(&data).unwrap()
    }

    #[test]
    fn test_client_peer_id_prefix() {
        let config = ClientConfig::with_output_dir(PathBuf::from("."));
        let client = Client::new(test_metainfo(), config).unwrap();
        assert_eq!(&client.peer_id()[0..8], b"-PW0001-");
    }

    #[test]
    fn test_clients_get_distinct_peer_ids() {
        let config = ClientConfig::with_output_dir(PathBuf::from("."));
        let a = Client::new(test_metainfo(), config.clone()).unwrap();
        let b = Client::new(test_metainfo(), config).unwrap();
        assert_ne!(a.peer_id(), b.peer_id());
    }
}
