//! Peer wire protocol
//!
//! The BEP 3 base protocol: the 68-byte handshake, length-prefixed typed
//! messages, and a connection wrapper that tracks the remote peer's choke
//! state and bitfield.

use std::net::SocketAddr;
use std::time::Duration;

use bitvec::prelude::*;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::metainfo::Sha1Hash;
use crate::error::{ClientError, NetworkErrorKind, ProtocolErrorKind, Result};

/// Protocol string for BitTorrent
const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Size of the handshake frame: 1 + 19 + 8 + 20 + 20
pub const HANDSHAKE_SIZE: usize = 68;

/// Maximum accepted frame size (one 16 KiB block plus headers, with slack
/// for large bitfields)
const MAX_MESSAGE_SIZE: usize = 32 * 1024;

/// Block size for piece requests (16 KiB)
pub const BLOCK_SIZE: u32 = 16384;

/// The 68-byte connection-opening frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Info hash identifying the swarm
    pub info_hash: Sha1Hash,
    /// Peer ID of the sender
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a handshake for the given swarm
    pub fn new(info_hash: Sha1Hash, peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Serialize to the 68-byte wire form
    pub fn encode(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut buf = [0u8; HANDSHAKE_SIZE];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        // bytes 20..28 are the reserved extension bits, all zero
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Write the handshake to a stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode()).await.map_err(|e| {
            ClientError::network(
                NetworkErrorKind::ConnectionReset,
                format!("Handshake send failed: {}", e),
            )
        })
    }

    /// Read a handshake from a stream.
    ///
    /// Any protocol string other than `"BitTorrent protocol"` is rejected.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HANDSHAKE_SIZE];
        reader.read_exact(&mut buf).await.map_err(|e| {
            ClientError::network(
                NetworkErrorKind::ConnectionReset,
                format!("Handshake receive failed: {}", e),
            )
        })?;

        let pstrlen = buf[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() || &buf[1..1 + pstrlen] != PROTOCOL_STRING {
            return Err(ClientError::protocol(
                ProtocolErrorKind::UnknownProtocol,
                "Peer does not speak the BitTorrent protocol",
            ));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self { info_hash, peer_id })
    }
}

/// Peer wire protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Keep the connection alive (no id, no payload)
    KeepAlive,
    /// Remote will not serve requests
    Choke,
    /// Remote will serve requests
    Unchoke,
    /// We want data
    Interested,
    /// We do not want data
    NotInterested,
    /// Remote has a piece
    Have { piece_index: u32 },
    /// Remote's full piece bitfield
    Bitfield { bitfield: Vec<u8> },
    /// Request a block
    Request { index: u32, begin: u32, length: u32 },
    /// A block of piece data
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// Cancel a pending request
    Cancel { index: u32, begin: u32, length: u32 },
    /// Unrecognized message, discarded by receivers
    Unknown { id: u8, payload: Vec<u8> },
}

impl PeerMessage {
    /// Encode the message as a length-prefixed frame
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => vec![0, 0, 0, 0],
            Self::Choke => vec![0, 0, 0, 1, 0],
            Self::Unchoke => vec![0, 0, 0, 1, 1],
            Self::Interested => vec![0, 0, 0, 1, 2],
            Self::NotInterested => vec![0, 0, 0, 1, 3],

            Self::Have { piece_index } => {
                let mut buf = vec![0, 0, 0, 5, 4];
                buf.extend_from_slice(&piece_index.to_be_bytes());
                buf
            }

            Self::Bitfield { bitfield } => {
                let len = 1 + bitfield.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(5);
                buf.extend_from_slice(bitfield);
                buf
            }

            Self::Request {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 6];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Piece {
                index,
                begin,
                block,
            } => {
                let len = 9 + block.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(7);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }

            Self::Cancel {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 8];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Unknown { id, payload } => {
                let len = 1 + payload.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(*id);
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    /// Decode a frame body (everything after the length prefix).
    /// An empty body is a keep-alive.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::KeepAlive);
        }

        let id = data[0];
        let payload = &data[1..];

        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),

            4 => {
                if payload.len() < 4 {
                    return Err(ClientError::protocol(
                        ProtocolErrorKind::PeerProtocol,
                        "Have message too short",
                    ));
                }
                let piece_index =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Self::Have { piece_index })
            }

            5 => Ok(Self::Bitfield {
                bitfield: payload.to_vec(),
            }),

            6 => {
                if payload.len() < 12 {
                    return Err(ClientError::protocol(
                        ProtocolErrorKind::PeerProtocol,
                        "Request message too short",
                    ));
                }
                Ok(Self::Request {
                    index: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                    begin: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
                    length: u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]),
                })
            }

            7 => {
                if payload.len() < 8 {
                    return Err(ClientError::protocol(
                        ProtocolErrorKind::PeerProtocol,
                        "Piece message too short",
                    ));
                }
                Ok(Self::Piece {
                    index: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                    begin: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
                    block: payload[8..].to_vec(),
                })
            }

            8 => {
                if payload.len() < 12 {
                    return Err(ClientError::protocol(
                        ProtocolErrorKind::PeerProtocol,
                        "Cancel message too short",
                    ));
                }
                Ok(Self::Cancel {
                    index: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                    begin: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
                    length: u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]),
                })
            }

            _ => Ok(Self::Unknown {
                id,
                payload: payload.to_vec(),
            }),
        }
    }
}

/// A live peer connection with its session state.
///
/// `peer_choking` starts `true` and the remote bitfield starts empty;
/// both are updated as choke/unchoke/have/bitfield messages arrive.
/// The state dies with the connection.
#[derive(Debug)]
pub struct PeerConnection {
    stream: TcpStream,
    addr: SocketAddr,
    info_hash: Sha1Hash,
    our_peer_id: [u8; 20],
    peer_id: Option<[u8; 20]>,

    am_interested: bool,
    peer_choking: bool,
    peer_pieces: BitVec<u8, Msb0>,
    num_pieces: usize,

    read_timeout: Duration,
    read_buffer: BytesMut,
}

impl PeerConnection {
    /// Connect to a peer and perform the handshake.
    ///
    /// `connect_timeout` bounds the TCP dial; `read_timeout` bounds every
    /// subsequent stream operation including the handshake exchange.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        peer_id: [u8; 20],
        num_pieces: usize,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                ClientError::network(NetworkErrorKind::Timeout, "Peer connection timeout")
            })?
            .map_err(|e| {
                ClientError::network(
                    NetworkErrorKind::ConnectionRefused,
                    format!("Failed to connect: {}", e),
                )
            })?;

        let mut conn = Self {
            stream,
            addr,
            info_hash,
            our_peer_id: peer_id,
            peer_id: None,
            am_interested: false,
            peer_choking: true,
            peer_pieces: bitvec![u8, Msb0; 0; num_pieces],
            num_pieces,
            read_timeout,
            read_buffer: BytesMut::with_capacity(MAX_MESSAGE_SIZE),
        };

        conn.handshake().await?;

        Ok(conn)
    }

    /// Exchange handshakes and verify the swarm
    async fn handshake(&mut self) -> Result<()> {
        let ours = Handshake::new(self.info_hash, self.our_peer_id);

        timeout(self.read_timeout, ours.write_to(&mut self.stream))
            .await
            .map_err(|_| {
                ClientError::network(NetworkErrorKind::Timeout, "Handshake send timeout")
            })??;

        let theirs = timeout(self.read_timeout, Handshake::read_from(&mut self.stream))
            .await
            .map_err(|_| {
                ClientError::network(NetworkErrorKind::Timeout, "Handshake receive timeout")
            })??;

        if theirs.info_hash != self.info_hash {
            return Err(ClientError::protocol(
                ProtocolErrorKind::WrongSwarm,
                "Peer is serving a different torrent",
            ));
        }

        self.peer_id = Some(theirs.peer_id);

        Ok(())
    }

    /// Send a message to the peer
    pub async fn send(&mut self, msg: PeerMessage) -> Result<()> {
        let data = msg.encode();

        timeout(self.read_timeout, self.stream.write_all(&data))
            .await
            .map_err(|_| ClientError::network(NetworkErrorKind::Timeout, "Send timeout"))?
            .map_err(|e| {
                ClientError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("Send failed: {}", e),
                )
            })?;

        if matches!(msg, PeerMessage::Interested) {
            self.am_interested = true;
        }

        Ok(())
    }

    /// Receive one message, applying choke/bitfield state transitions
    pub async fn recv(&mut self) -> Result<PeerMessage> {
        let mut len_buf = [0u8; 4];
        timeout(self.read_timeout, self.stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| ClientError::network(NetworkErrorKind::Timeout, "Receive timeout"))?
            .map_err(|e| {
                ClientError::network(
                    NetworkErrorKind::ConnectionReset,
                    format!("Receive failed: {}", e),
                )
            })?;

        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Ok(PeerMessage::KeepAlive);
        }

        if len > MAX_MESSAGE_SIZE {
            return Err(ClientError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("Message too large: {} bytes", len),
            ));
        }

        self.read_buffer.resize(len, 0);
        timeout(
            self.read_timeout,
            self.stream.read_exact(&mut self.read_buffer),
        )
        .await
        .map_err(|_| ClientError::network(NetworkErrorKind::Timeout, "Receive body timeout"))?
        .map_err(|e| {
            ClientError::network(
                NetworkErrorKind::ConnectionReset,
                format!("Receive body failed: {}", e),
            )
        })?;

        let msg = PeerMessage::decode(&self.read_buffer)?;
        self.handle_message(&msg);
        Ok(msg)
    }

    /// Apply session state transitions for an incoming message
    fn handle_message(&mut self, msg: &PeerMessage) {
        match msg {
            PeerMessage::Choke => {
                self.peer_choking = true;
            }
            PeerMessage::Unchoke => {
                self.peer_choking = false;
            }
            PeerMessage::Have { piece_index } => {
                let index = *piece_index as usize;
                if index >= self.peer_pieces.len() {
                    self.peer_pieces.resize(index + 1, false);
                }
                self.peer_pieces.set(index, true);
            }
            PeerMessage::Bitfield { bitfield } => {
                // Replace the remote bitfield. The frame length defines an
                // upper bound on the peer's piece count; grow our copy if
                // the peer declares more bits than we expected.
                let declared_bits = bitfield.len() * 8;
                let size = declared_bits.max(self.num_pieces);
                let mut pieces = bitvec![u8, Msb0; 0; size];
                for (i, byte) in bitfield.iter().enumerate() {
                    for bit in 0..8 {
                        if (byte & (0x80 >> bit)) != 0 {
                            pieces.set(i * 8 + bit, true);
                        }
                    }
                }
                self.peer_pieces = pieces;
            }
            _ => {}
        }
    }

    /// Send `Interested` once; later calls on the same connection are no-ops
    pub async fn express_interest(&mut self) -> Result<()> {
        if self.am_interested {
            return Ok(());
        }
        self.send(PeerMessage::Interested).await
    }

    // Accessors

    /// Get the peer's address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the peer's ID from the handshake
    pub fn peer_id(&self) -> Option<&[u8; 20]> {
        self.peer_id.as_ref()
    }

    /// Check if the peer is choking us
    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    /// Check if we have expressed interest
    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    /// Check if the peer has a specific piece
    pub fn peer_has_piece(&self, index: usize) -> bool {
        self.peer_pieces.get(index).map(|b| *b).unwrap_or(false)
    }

    /// Get the peer's bitfield
    pub fn peer_pieces(&self) -> &BitVec<u8, Msb0> {
        &self.peer_pieces
    }

    /// Shut the connection down
    pub async fn disconnect(mut self) {
        self.stream.shutdown().await.ok();
    }
}
