//! Tracker client
//!
//! Announces to BitTorrent trackers over HTTP (BEP 3) and UDP (BEP 15)
//! and parses the compact peer list out of the response.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use url::Url;

use super::bencode::BencodeValue;
use super::metainfo::Sha1Hash;
use crate::error::{ClientError, NetworkErrorKind, ProtocolErrorKind, Result};

/// Default timeout for HTTP tracker requests
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Default per-attempt deadline for UDP tracker exchanges
const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of UDP announce attempts
const DEFAULT_UDP_ATTEMPTS: u32 = 3;

/// Gap between UDP announce attempts
const UDP_RETRY_GAP: Duration = Duration::from_secs(1);

/// Magic constant opening every UDP tracker conversation
const UDP_PROTOCOL_ID: u64 = 0x41727101980;

/// UDP action codes
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// Tracker client for HTTP and UDP trackers
pub struct TrackerClient {
    http_client: reqwest::Client,
    peer_id: [u8; 20],
    udp_timeout: Duration,
    udp_attempts: u32,
}

/// Announce request parameters.
///
/// A leecher that has not uploaded or downloaded anything announces
/// `uploaded = 0`, `downloaded = 0` and `left` = bytes remaining.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    /// Info hash of the torrent
    pub info_hash: Sha1Hash,
    /// Our peer ID
    pub peer_id: [u8; 20],
    /// Port we report to the tracker
    pub port: u16,
    /// Bytes uploaded so far
    pub uploaded: u64,
    /// Bytes downloaded so far
    pub downloaded: u64,
    /// Bytes remaining
    pub left: u64,
}

/// Announce response from a tracker
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds the tracker wants us to wait before re-announcing
    pub interval: u32,
    /// Discovered peers
    pub peers: Vec<PeerAddr>,
}

/// Peer address from a compact tracker response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    /// IPv4 address
    pub ip: Ipv4Addr,
    /// Port
    pub port: u16,
}

impl PeerAddr {
    /// Convert to a socket address
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parse a compact peer list: 6 bytes per peer, 4-byte big-endian IPv4
/// followed by a 2-byte big-endian port.
pub fn parse_compact_peers(data: &[u8]) -> Result<Vec<PeerAddr>> {
    if data.len() % 6 != 0 {
        return Err(ClientError::protocol(
            ProtocolErrorKind::TrackerError,
            format!("Malformed compact peer list: {} bytes", data.len()),
        ));
    }

    Ok(data
        .chunks_exact(6)
        .map(|chunk| PeerAddr {
            ip: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
        })
        .collect())
}

impl TrackerClient {
    /// Create a new tracker client with a random peer ID
    pub fn new() -> Result<Self> {
        Self::with_peer_id(generate_peer_id())
    }

    /// Create a tracker client with a specific peer ID
    pub fn with_peer_id(peer_id: [u8; 20]) -> Result<Self> {
        Self::with_timeouts(
            peer_id,
            DEFAULT_HTTP_TIMEOUT,
            DEFAULT_UDP_TIMEOUT,
            DEFAULT_UDP_ATTEMPTS,
        )
    }

    /// Create a tracker client with explicit timeouts
    pub fn with_timeouts(
        peer_id: [u8; 20],
        http_timeout: Duration,
        udp_timeout: Duration,
        udp_attempts: u32,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(|e| {
                ClientError::network(
                    NetworkErrorKind::Other,
                    format!("Failed to create HTTP client: {}", e),
                )
            })?;

        Ok(Self {
            http_client,
            peer_id,
            udp_timeout,
            udp_attempts: udp_attempts.max(1),
        })
    }

    /// Get the peer ID
    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }

    /// Announce to a tracker, dispatching on the URL scheme
    pub async fn announce(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        if tracker_url.starts_with("http://") || tracker_url.starts_with("https://") {
            self.announce_http(tracker_url, request).await
        } else if tracker_url.starts_with("udp://") {
            self.announce_udp(tracker_url, request).await
        } else {
            Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("Unsupported tracker protocol: {}", tracker_url),
            ))
        }
    }

    /// Announce to an HTTP tracker (BEP 3)
    pub async fn announce_http(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let mut url = tracker_url.to_string();
        if url.contains('?') {
            url.push('&');
        } else {
            url.push('?');
        }

        // info_hash and peer_id are raw 20-byte values, percent-encoded
        // byte-for-byte
        url.push_str("info_hash=");
        for byte in &request.info_hash {
            url.push_str(&format!("%{:02X}", byte));
        }

        url.push_str("&peer_id=");
        for byte in &request.peer_id {
            url.push_str(&format!("%{:02X}", byte));
        }

        url.push_str(&format!("&port={}", request.port));
        url.push_str(&format!("&uploaded={}", request.uploaded));
        url.push_str(&format!("&downloaded={}", request.downloaded));
        url.push_str(&format!("&left={}", request.left));
        url.push_str("&compact=1");

        let response = self.http_client.get(&url).send().await.map_err(|e| {
            ClientError::network(
                NetworkErrorKind::Other,
                format!("Tracker request failed: {}", e),
            )
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::network(
                NetworkErrorKind::HttpStatus(status.as_u16()),
                format!("Tracker returned status: {}", status),
            ));
        }

        let body = response.bytes().await.map_err(|e| {
            ClientError::network(
                NetworkErrorKind::Other,
                format!("Failed to read tracker response: {}", e),
            )
        })?;

        Self::parse_http_response(&body)
    }

    /// Parse a bencoded HTTP tracker response
    fn parse_http_response(data: &[u8]) -> Result<AnnounceResponse> {
        let value = BencodeValue::parse_exact(data).map_err(|_| {
            ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                "Invalid tracker response encoding",
            )
        })?;

        let dict = value.as_dict().ok_or_else(|| {
            ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                "Tracker response must be a dictionary",
            )
        })?;

        if let Some(failure) = dict.get(b"failure reason".as_slice()) {
            let msg = failure.as_string().unwrap_or("(unreadable reason)");
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerRejected,
                format!("Tracker rejected announce: {}", msg),
            ));
        }

        let interval = dict
            .get(b"interval".as_slice())
            .and_then(|v| v.as_uint())
            .unwrap_or(0) as u32;

        let peers_bytes = dict
            .get(b"peers".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| {
                ClientError::protocol(
                    ProtocolErrorKind::TrackerError,
                    "Tracker response 'peers' missing or not compact",
                )
            })?;

        let peers = parse_compact_peers(peers_bytes)?;

        Ok(AnnounceResponse { interval, peers })
    }

    /// Announce to a UDP tracker (BEP 15) with retries
    pub async fn announce_udp(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let mut last_err = None;

        for attempt in 1..=self.udp_attempts {
            match self.udp_announce_once(tracker_url, request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::debug!(
                        "UDP tracker attempt {}/{} to {} failed: {}",
                        attempt,
                        self.udp_attempts,
                        tracker_url,
                        e
                    );
                    last_err = Some(e);
                    if attempt < self.udp_attempts {
                        tokio::time::sleep(UDP_RETRY_GAP).await;
                    }
                }
            }
        }

        Err(ClientError::network(
            NetworkErrorKind::Unreachable,
            format!(
                "UDP tracker {} failed after {} attempts: {}",
                tracker_url,
                self.udp_attempts,
                last_err.map(|e| e.to_string()).unwrap_or_default()
            ),
        ))
    }

    /// One connect + announce exchange on a fresh socket
    async fn udp_announce_once(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let url = Url::parse(tracker_url)?;
        let host = url.host_str().ok_or_else(|| {
            ClientError::protocol(ProtocolErrorKind::TrackerError, "UDP tracker URL has no host")
        })?;
        let port = url.port().ok_or_else(|| {
            ClientError::protocol(ProtocolErrorKind::TrackerError, "UDP tracker URL has no port")
        })?;

        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| {
                ClientError::network(
                    NetworkErrorKind::DnsResolution,
                    format!("Failed to resolve tracker: {}", e),
                )
            })?
            .next()
            .ok_or_else(|| {
                ClientError::network(
                    NetworkErrorKind::DnsResolution,
                    "No addresses found for tracker",
                )
            })?;

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| {
            ClientError::network(
                NetworkErrorKind::Other,
                format!("Failed to create UDP socket: {}", e),
            )
        })?;

        socket.connect(addr).await.map_err(|e| {
            ClientError::network(
                NetworkErrorKind::ConnectionRefused,
                format!("Failed to connect to tracker: {}", e),
            )
        })?;

        let connection_id = self.udp_connect(&socket).await?;
        self.udp_announce(&socket, connection_id, request).await
    }

    /// UDP connect step: obtain a connection id
    async fn udp_connect(&self, socket: &UdpSocket) -> Result<u64> {
        let transaction_id: u32 = rand::rng().random();

        let mut req = Vec::with_capacity(16);
        req.extend_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
        req.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        req.extend_from_slice(&transaction_id.to_be_bytes());

        socket.send(&req).await.map_err(|e| {
            ClientError::network(NetworkErrorKind::Other, format!("UDP send failed: {}", e))
        })?;

        let mut response = [0u8; 16];
        let len = timeout(self.udp_timeout, socket.recv(&mut response))
            .await
            .map_err(|_| {
                ClientError::network(NetworkErrorKind::Timeout, "UDP tracker connect timeout")
            })?
            .map_err(|e| {
                ClientError::network(NetworkErrorKind::Other, format!("UDP recv failed: {}", e))
            })?;

        if len < 16 {
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP connect response too short",
            ));
        }

        let action = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
        let resp_transaction_id =
            u32::from_be_bytes([response[4], response[5], response[6], response[7]]);
        let connection_id = u64::from_be_bytes([
            response[8],
            response[9],
            response[10],
            response[11],
            response[12],
            response[13],
            response[14],
            response[15],
        ]);

        if action != ACTION_CONNECT {
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("UDP connect action mismatch: {}", action),
            ));
        }

        if resp_transaction_id != transaction_id {
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP connect transaction ID mismatch",
            ));
        }

        Ok(connection_id)
    }

    /// UDP announce step
    async fn udp_announce(
        &self,
        socket: &UdpSocket,
        connection_id: u64,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let transaction_id: u32 = rand::rng().random();
        let key: u32 = rand::rng().random();

        // 98-byte announce request, all fields big-endian
        let mut req = Vec::with_capacity(98);
        req.extend_from_slice(&connection_id.to_be_bytes()); // 0-7: connection_id
        req.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes()); // 8-11: action
        req.extend_from_slice(&transaction_id.to_be_bytes()); // 12-15: transaction_id
        req.extend_from_slice(&request.info_hash); // 16-35: info_hash
        req.extend_from_slice(&request.peer_id); // 36-55: peer_id
        req.extend_from_slice(&request.downloaded.to_be_bytes()); // 56-63: downloaded
        req.extend_from_slice(&request.left.to_be_bytes()); // 64-71: left
        req.extend_from_slice(&request.uploaded.to_be_bytes()); // 72-79: uploaded
        req.extend_from_slice(&0u32.to_be_bytes()); // 80-83: event (none)
        req.extend_from_slice(&0u32.to_be_bytes()); // 84-87: IP (default)
        req.extend_from_slice(&key.to_be_bytes()); // 88-91: key
        req.extend_from_slice(&(-1i32).to_be_bytes()); // 92-95: num_want
        req.extend_from_slice(&request.port.to_be_bytes()); // 96-97: port

        socket.send(&req).await.map_err(|e| {
            ClientError::network(
                NetworkErrorKind::Other,
                format!("UDP announce send failed: {}", e),
            )
        })?;

        // 20-byte header + 6 bytes per peer; 4096 holds ~679 peers
        let mut response = [0u8; 4096];
        let len = timeout(self.udp_timeout, socket.recv(&mut response))
            .await
            .map_err(|_| {
                ClientError::network(NetworkErrorKind::Timeout, "UDP tracker announce timeout")
            })?
            .map_err(|e| {
                ClientError::network(NetworkErrorKind::Other, format!("UDP recv failed: {}", e))
            })?;

        if len < 8 {
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP announce response too short",
            ));
        }

        let action = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
        let resp_transaction_id =
            u32::from_be_bytes([response[4], response[5], response[6], response[7]]);

        if action == ACTION_ERROR {
            let message = if len > 8 {
                String::from_utf8_lossy(&response[8..len]).to_string()
            } else {
                String::from("(no message)")
            };
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerRejected,
                format!("UDP tracker error: {}", message),
            ));
        }

        if action != ACTION_ANNOUNCE {
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                format!("UDP announce action mismatch: {}", action),
            ));
        }

        if resp_transaction_id != transaction_id {
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP announce transaction ID mismatch",
            ));
        }

        if len < 20 {
            return Err(ClientError::protocol(
                ProtocolErrorKind::TrackerError,
                "UDP announce response too short",
            ));
        }

        let interval = u32::from_be_bytes([response[8], response[9], response[10], response[11]]);
        // leechers at 12..16 and seeders at 16..20 are not used by this client

        let peers = parse_compact_peers(&response[20..len])?;

        Ok(AnnounceResponse { interval, peers })
    }
}

/// Generate a random peer ID in Azureus style.
///
/// Format: `-PW0001-` followed by 12 random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-PW0001-");
    rand::rng().fill(&mut peer_id[8..]);
    peer_id
}
