//! Mock BitTorrent peer for testing
//!
//! An in-process seeder that speaks just enough of the BEP 3 wire
//! protocol to exercise the download path: handshake, bitfield, unchoke,
//! and block serving, with fault injection for wrong-swarm and corrupt
//! piece scenarios.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Protocol string for the BitTorrent handshake
const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Mock peer configuration
#[derive(Clone)]
pub struct MockPeerConfig {
    /// Info hash this peer accepts connections for
    pub info_hash: [u8; 20],
    /// Our peer ID
    pub peer_id: [u8; 20],
    /// Piece data to serve, keyed by index
    pub piece_data: HashMap<u32, Vec<u8>>,
    /// Number of pieces in the torrent (sizes the bitfield)
    pub num_pieces: usize,
    /// Unchoke connecting peers immediately after the bitfield
    pub auto_unchoke: bool,
    /// Reply to handshakes with this info hash instead of our own
    /// (wrong-swarm fault injection)
    pub reply_info_hash: Option<[u8; 20]>,
    /// Flip a byte in every block served from this piece
    pub corrupt_piece: Option<u32>,
}

impl MockPeerConfig {
    /// Create a mock peer config for testing
    pub fn new(info_hash: [u8; 20], num_pieces: usize) -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[0..8].copy_from_slice(b"-MO0001-");
        for byte in &mut peer_id[8..] {
            *byte = rand::random();
        }

        Self {
            info_hash,
            peer_id,
            piece_data: HashMap::new(),
            num_pieces,
            auto_unchoke: true,
            reply_info_hash: None,
            corrupt_piece: None,
        }
    }

    /// Add piece data to serve
    pub fn with_piece(mut self, index: u32, data: Vec<u8>) -> Self {
        self.piece_data.insert(index, data);
        self
    }

    /// Serve every piece of `pieces` in index order
    pub fn with_pieces(mut self, pieces: &[Vec<u8>]) -> Self {
        for (i, data) in pieces.iter().enumerate() {
            self.piece_data.insert(i as u32, data.clone());
        }
        self
    }

    /// Reply to handshakes with a foreign info hash
    pub fn with_reply_info_hash(mut self, info_hash: [u8; 20]) -> Self {
        self.reply_info_hash = Some(info_hash);
        self
    }

    /// Corrupt every block served from the given piece
    pub fn with_corrupt_piece(mut self, index: u32) -> Self {
        self.corrupt_piece = Some(index);
        self
    }
}

/// A mock BitTorrent peer listening on localhost
pub struct MockPeer {
    config: MockPeerConfig,
    listener: TcpListener,
}

impl MockPeer {
    /// Create a new mock peer and start listening
    pub async fn new(config: MockPeerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Self { config, listener })
    }

    /// The address this peer is listening on
    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Accept connections in the background until dropped
    pub fn start_accepting(self: Arc<Self>) {
        let peer = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                match peer.listener.accept().await {
                    Ok((stream, _addr)) => {
                        let peer = Arc::clone(&peer);
                        tokio::spawn(async move {
                            let _ = peer.handle_connection(stream).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });
    }

    /// Handle one peer connection
    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        self.do_handshake(&mut stream).await?;
        self.send_bitfield(&mut stream).await?;

        if self.config.auto_unchoke {
            self.send_unchoke(&mut stream).await?;
        }

        loop {
            let msg = self.read_message(&mut stream).await?;
            match msg {
                MockMessage::Interested => {
                    if !self.config.auto_unchoke {
                        self.send_unchoke(&mut stream).await?;
                    }
                }
                MockMessage::Request {
                    index,
                    begin,
                    length,
                } => {
                    if let Some(piece) = self.config.piece_data.get(&index) {
                        let end = (begin + length) as usize;
                        if end <= piece.len() {
                            let mut block = piece[begin as usize..end].to_vec();
                            if self.config.corrupt_piece == Some(index) && !block.is_empty() {
                                block[0] ^= 0xFF;
                            }
                            self.send_piece(&mut stream, index, begin, &block).await?;
                        }
                    }
                }
                MockMessage::KeepAlive | MockMessage::Other => {}
            }
        }
    }

    /// Read the remote handshake, validate, reply with ours
    async fn do_handshake(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        let mut handshake = [0u8; 68];
        stream.read_exact(&mut handshake).await?;

        if handshake[0] != 19 || &handshake[1..20] != PROTOCOL_STRING {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Invalid protocol string",
            ));
        }

        // Skip swarm validation when faking a foreign swarm
        if self.config.reply_info_hash.is_none() && handshake[28..48] != self.config.info_hash {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Info hash mismatch",
            ));
        }

        let reply_hash = self.config.reply_info_hash.unwrap_or(self.config.info_hash);

        let mut response = Vec::with_capacity(68);
        response.push(19);
        response.extend_from_slice(PROTOCOL_STRING);
        response.extend_from_slice(&[0u8; 8]);
        response.extend_from_slice(&reply_hash);
        response.extend_from_slice(&self.config.peer_id);
        stream.write_all(&response).await
    }

    /// Send a bitfield with a bit set for every piece we hold
    async fn send_bitfield(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        let num_bytes = self.config.num_pieces.div_ceil(8);
        let mut bitfield = vec![0u8; num_bytes];
        for &index in self.config.piece_data.keys() {
            let index = index as usize;
            if index < self.config.num_pieces {
                bitfield[index / 8] |= 0x80 >> (index % 8);
            }
        }

        let len = 1 + bitfield.len() as u32;
        let mut msg = Vec::with_capacity(4 + len as usize);
        msg.extend_from_slice(&len.to_be_bytes());
        msg.push(5);
        msg.extend_from_slice(&bitfield);
        stream.write_all(&msg).await
    }

    async fn send_unchoke(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        stream.write_all(&[0, 0, 0, 1, 1]).await
    }

    async fn send_piece(
        &self,
        stream: &mut TcpStream,
        index: u32,
        begin: u32,
        block: &[u8],
    ) -> std::io::Result<()> {
        let len = 9 + block.len() as u32;
        let mut msg = Vec::with_capacity(4 + len as usize);
        msg.extend_from_slice(&len.to_be_bytes());
        msg.push(7);
        msg.extend_from_slice(&index.to_be_bytes());
        msg.extend_from_slice(&begin.to_be_bytes());
        msg.extend_from_slice(block);
        stream.write_all(&msg).await
    }

    /// Read one framed message
    async fn read_message(&self, stream: &mut TcpStream) -> std::io::Result<MockMessage> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Ok(MockMessage::KeepAlive);
        }

        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;

        let id = data[0];
        let payload = &data[1..];

        Ok(match id {
            2 => MockMessage::Interested,
            6 if payload.len() >= 12 => MockMessage::Request {
                index: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                begin: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
                length: u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]),
            },
            _ => MockMessage::Other,
        })
    }
}

/// The subset of messages the mock reacts to
enum MockMessage {
    KeepAlive,
    Interested,
    Request { index: u32, begin: u32, length: u32 },
    Other,
}
