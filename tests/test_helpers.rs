//! Test helpers
//!
//! Builders for single-file test torrents and small async test utilities.

#![allow(dead_code)]

use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// Builder for single-file test torrent data
pub struct TestTorrentBuilder {
    name: String,
    announce: String,
    piece_length: u64,
    content: Vec<u8>,
}

impl TestTorrentBuilder {
    /// Create a builder for a torrent named `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            announce: "http://tracker.example.com/announce".to_string(),
            piece_length: 16384,
            content: Vec::new(),
        }
    }

    /// A torrent over `size` bytes of deterministic content
    pub fn with_size(name: impl Into<String>, size: usize) -> Self {
        let mut builder = Self::new(name);
        builder.content = (0..size).map(|i| (i % 256) as u8).collect();
        builder
    }

    /// Set the announce URL
    pub fn announce(mut self, url: impl Into<String>) -> Self {
        self.announce = url.into();
        self
    }

    /// Set the piece length
    pub fn piece_length(mut self, length: u64) -> Self {
        self.piece_length = length;
        self
    }

    /// Set the file content
    pub fn content(mut self, content: Vec<u8>) -> Self {
        self.content = content;
        self
    }

    /// The piece data for a given index
    pub fn piece_data(&self, index: usize) -> Vec<u8> {
        let start = index * self.piece_length as usize;
        let end = (start + self.piece_length as usize).min(self.content.len());
        if start >= self.content.len() {
            return Vec::new();
        }
        self.content[start..end].to_vec()
    }

    /// All pieces of the content in order
    pub fn all_pieces(&self) -> Vec<Vec<u8>> {
        let count = self.content.len().div_ceil(self.piece_length as usize);
        (0..count).map(|i| self.piece_data(i)).collect()
    }

    /// Build the bencoded torrent data and the per-piece SHA-1 hashes
    pub fn build(&self) -> (Vec<u8>, Vec<[u8; 20]>) {
        let mut piece_hashes = Vec::new();
        for piece in self.all_pieces() {
            let mut hasher = Sha1::new();
            hasher.update(&piece);
            piece_hashes.push(hasher.finalize().into());
        }

        let pieces_concat: Vec<u8> = piece_hashes.iter().flatten().copied().collect();

        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Value::Int(self.content.len() as i64));
        info.insert(b"name".to_vec(), Value::Bytes(self.name.as_bytes().to_vec()));
        info.insert(
            b"piece length".to_vec(),
            Value::Int(self.piece_length as i64),
        );
        info.insert(b"pieces".to_vec(), Value::Bytes(pieces_concat));

        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            Value::Bytes(self.announce.as_bytes().to_vec()),
        );
        root.insert(b"info".to_vec(), Value::Dict(info));

        (encode(&Value::Dict(root)), piece_hashes)
    }
}

/// Minimal bencode value for building test documents.
/// Intentionally separate from the crate's codec so encoder bugs cannot
/// hide from their own tests.
enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_to(value, &mut out);
    out
}

fn encode_to(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::Dict(d) => {
            out.push(b'd');
            for (k, v) in d {
                out.extend_from_slice(k.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(k);
                encode_to(v, out);
            }
            out.push(b'e');
        }
    }
}

/// Compact tracker response body advertising the given peers
pub fn tracker_response_body(peers: &[std::net::SocketAddrV4]) -> Vec<u8> {
    let mut compact = Vec::with_capacity(peers.len() * 6);
    for peer in peers {
        compact.extend_from_slice(&peer.ip().octets());
        compact.extend_from_slice(&peer.port().to_be_bytes());
    }

    let mut body = Vec::new();
    body.extend_from_slice(b"d8:intervali900e5:peers");
    body.extend_from_slice(compact.len().to_string().as_bytes());
    body.push(b':');
    body.extend_from_slice(&compact);
    body.push(b'e');
    body
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(timeout_ms: u64, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    false
}
