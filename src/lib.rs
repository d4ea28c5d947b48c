//! # pullwire
//!
//! A single-file BitTorrent v1 leecher written in Rust.
//!
//! Given a `.torrent` file describing one payload file, pullwire obtains
//! a peer list from HTTP or UDP trackers, speaks the BEP 3 peer wire
//! protocol to many peers concurrently, verifies every piece against its
//! SHA-1 digest and writes verified pieces into a preallocated output
//! file at the correct offsets.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pullwire::{Client, ClientConfig, Metainfo};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let data = std::fs::read("debian.iso.torrent")?;
//!     let metainfo = Metainfo::parse(&data)?;
//!
//!     let config = ClientConfig::with_output_dir("./downloads");
//!     let client = Client::new(metainfo, config)?;
//!
//!     client
//!         .download(|done, total| {
//!             println!("{}/{} pieces", done, total);
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

// Modules
pub mod config;
pub mod error;
pub mod storage;
pub mod torrent;

// Re-exports for convenience
pub use config::ClientConfig;
pub use error::{ClientError, NetworkErrorKind, ProtocolErrorKind, Result, StorageErrorKind};
pub use storage::PieceStore;
pub use torrent::{
    generate_peer_id, AnnounceRequest, AnnounceResponse, BencodeValue, Client, Handshake, Info,
    Metainfo, PeerAddr, PeerConnection, PeerMessage, PieceResult, PieceWork, Sha1Hash,
    TrackerClient, WorkQueue, BLOCK_SIZE,
};
