//! Metainfo (.torrent) parser
//!
//! Parses single-file metainfo files as defined in BEP 3: the announce
//! URLs, the info dictionary, and the info-hash computed over the raw
//! bytes of the `info` value.

use sha1::{Digest, Sha1};

use super::bencode::{info_span, BencodeValue};
use crate::error::{ClientError, ProtocolErrorKind, Result};

/// SHA-1 hash (20 bytes)
pub type Sha1Hash = [u8; 20];

/// Parsed torrent metainfo
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// SHA-1 hash of the raw bencoded info dictionary
    pub info_hash: Sha1Hash,
    /// The parsed info dictionary
    pub info: Info,
    /// Primary announce URL
    pub announce: String,
    /// Announce list (BEP 12) - list of tiers, each tier a list of trackers
    pub announce_list: Vec<Vec<String>>,
}

/// The info dictionary (single-file mode)
#[derive(Debug, Clone)]
pub struct Info {
    /// Output filename
    pub name: String,
    /// Number of bytes per piece
    pub piece_length: u64,
    /// SHA-1 hash of each piece
    pub pieces: Vec<Sha1Hash>,
    /// Total payload size in bytes
    pub length: u64,
    /// Length of the final piece, validated at parse time to lie in
    /// `(0, piece_length]`
    pub last_piece_length: u64,
}

impl Metainfo {
    /// Parse a .torrent file from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let root = BencodeValue::parse_exact(data)?;
        let dict = root.as_dict().ok_or_else(|| {
            ClientError::protocol(
                ProtocolErrorKind::InvalidTorrent,
                "Root must be a dictionary",
            )
        })?;

        // Hash the raw bytes of the info value, never a re-encoding
        let info_bytes = info_span(data)?;
        let info_hash = Self::calculate_info_hash(info_bytes);

        let info_value = dict.get(b"info".as_slice()).ok_or_else(|| {
            ClientError::protocol(ProtocolErrorKind::InvalidTorrent, "Missing 'info' key")
        })?;
        let info = Self::parse_info(info_value)?;

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(|v| v.as_string())
            .ok_or_else(|| {
                ClientError::protocol(
                    ProtocolErrorKind::InvalidTorrent,
                    "Missing or invalid 'announce'",
                )
            })?
            .to_string();

        let announce_list = Self::parse_announce_list(dict.get(b"announce-list".as_slice()));

        Ok(Metainfo {
            info_hash,
            info,
            announce,
            announce_list,
        })
    }

    /// Calculate SHA-1 hash of the raw info dictionary bytes
    fn calculate_info_hash(info_bytes: &[u8]) -> Sha1Hash {
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        hasher.finalize().into()
    }

    /// Parse the info dictionary
    fn parse_info(value: &BencodeValue) -> Result<Info> {
        let dict = value.as_dict().ok_or_else(|| {
            ClientError::protocol(
                ProtocolErrorKind::InvalidTorrent,
                "'info' must be a dictionary",
            )
        })?;

        // Multi-file torrents are out of scope for this client
        if dict.contains_key(b"files".as_slice()) {
            return Err(ClientError::protocol(
                ProtocolErrorKind::UnsupportedFeature,
                "Multi-file torrents are not supported",
            ));
        }

        let name = dict
            .get(b"name".as_slice())
            .and_then(|v| v.as_string())
            .ok_or_else(|| {
                ClientError::protocol(ProtocolErrorKind::InvalidTorrent, "Missing 'name' in info")
            })?
            .to_string();

        let piece_length = dict
            .get(b"piece length".as_slice())
            .and_then(|v| v.as_uint())
            .ok_or_else(|| {
                ClientError::protocol(
                    ProtocolErrorKind::InvalidTorrent,
                    "Missing or invalid 'piece length'",
                )
            })?;

        if piece_length == 0 {
            return Err(ClientError::protocol(
                ProtocolErrorKind::InvalidTorrent,
                "Invalid 'piece length': must be greater than zero",
            ));
        }

        let length = dict
            .get(b"length".as_slice())
            .and_then(|v| v.as_uint())
            .ok_or_else(|| {
                ClientError::protocol(
                    ProtocolErrorKind::InvalidTorrent,
                    "Missing 'length' for single-file torrent",
                )
            })?;

        let pieces_bytes = dict
            .get(b"pieces".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| {
                ClientError::protocol(ProtocolErrorKind::InvalidTorrent, "Missing 'pieces'")
            })?;

        if pieces_bytes.len() % 20 != 0 {
            return Err(ClientError::protocol(
                ProtocolErrorKind::InvalidTorrent,
                format!(
                    "Invalid pieces length: {} (not a multiple of 20)",
                    pieces_bytes.len()
                ),
            ));
        }

        let pieces: Vec<Sha1Hash> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let expected_pieces = length.div_ceil(piece_length);
        if pieces.len() as u64 != expected_pieces {
            return Err(ClientError::protocol(
                ProtocolErrorKind::InvalidTorrent,
                format!(
                    "Piece count mismatch: have {}, expected {} for {} bytes with {} byte pieces",
                    pieces.len(),
                    expected_pieces,
                    length,
                    piece_length
                ),
            ));
        }

        // Last piece must be a positive length no larger than a full
        // piece. Computed once here; piece_length() reads it back.
        let last_piece_length = if pieces.is_empty() {
            if length != 0 {
                return Err(ClientError::protocol(
                    ProtocolErrorKind::InvalidTorrent,
                    "Non-zero length but no piece hashes",
                ));
            }
            0
        } else {
            let last = length - piece_length * (pieces.len() as u64 - 1);
            if last == 0 || last > piece_length {
                return Err(ClientError::protocol(
                    ProtocolErrorKind::InvalidTorrent,
                    format!("Invalid last piece length: {}", last),
                ));
            }
            last
        };

        Ok(Info {
            name,
            piece_length,
            pieces,
            length,
            last_piece_length,
        })
    }

    /// Parse announce-list (BEP 12), dropping empty tiers
    fn parse_announce_list(value: Option<&BencodeValue>) -> Vec<Vec<String>> {
        let Some(value) = value else {
            return Vec::new();
        };

        let Some(tiers) = value.as_list() else {
            return Vec::new();
        };

        tiers
            .iter()
            .filter_map(|tier| {
                tier.as_list().map(|urls| {
                    urls.iter()
                        .filter_map(|url| url.as_string().map(String::from))
                        .collect()
                })
            })
            .filter(|tier: &Vec<String>| !tier.is_empty())
            .collect()
    }

    /// Get the info_hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        self.info_hash
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// Get the piece hash for a given piece index
    pub fn piece_hash(&self, index: usize) -> Option<&Sha1Hash> {
        self.info.pieces.get(index)
    }

    /// Get the length of a piece (the last piece may be shorter)
    pub fn piece_length(&self, index: usize) -> Option<u64> {
        let count = self.info.pieces.len();
        if index >= count {
            return None;
        }
        if index == count - 1 {
            Some(self.info.last_piece_length)
        } else {
            Some(self.info.piece_length)
        }
    }

    /// All trackers: announce plus the flattened announce-list,
    /// deduplicated in first-occurrence order
    pub fn all_trackers(&self) -> Vec<String> {
        let mut trackers = vec![self.announce.clone()];

        for tier in &self.announce_list {
            for url in tier {
                if !trackers.contains(url) {
                    trackers.push(url.clone());
                }
            }
        }

        trackers
    }
}

impl Info {
    /// Get the total number of pieces
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_torrent() -> Vec<u8> {
        // Single file of 100 bytes, one 32 KiB piece
        let pieces = vec![0u8; 20];
        let pieces_str = format!("6:pieces{}:", pieces.len());

        let mut data = Vec::new();
        data.extend_from_slice(b"d");
        data.extend_from_slice(b"8:announce35:http://tracker.example.com/announce");
        data.extend_from_slice(b"4:infod");
        data.extend_from_slice(b"6:lengthi100e");
        data.extend_from_slice(b"4:name8:test.txt");
        data.extend_from_slice(b"12:piece lengthi32768e");
        data.extend_from_slice(pieces_str.as_bytes());
        data.extend_from_slice(&pieces);
        data.extend_from_slice(b"ee");

        data
    }

    #[test]
    fn test_parse_single_file_torrent() {
        let data = create_test_torrent();
        let metainfo = Metainfo::parse(&data).unwrap();

        assert_eq!(metainfo.info.name, "test.txt");
        assert_eq!(metainfo.info.piece_length, 32768);
        assert_eq!(metainfo.info.length, 100);
        assert_eq!(metainfo.info.pieces.len(), 1);
        assert_eq!(metainfo.info.last_piece_length, 100);
        assert_eq!(
            metainfo.announce,
            "http://tracker.example.com/announce".to_string()
        );
    }

    #[test]
    fn test_info_hash_is_hash_of_raw_info_bytes() {
        let data = create_test_torrent();
        let metainfo = Metainfo::parse(&data).unwrap();

        let span = info_span(&data).unwrap();
        let mut hasher = Sha1::new();
        hasher.update(span);
        let expected: Sha1Hash = hasher.finalize().into();

        assert_eq!(metainfo.info_hash, expected);
        assert_eq!(metainfo.info_hash_hex().len(), 40);
    }

    #[test]
    fn test_info_hash_stable_across_documents() {
        // Same info dict embedded in documents with different outer keys
        // must produce the same info hash
        let data1 = create_test_torrent();

        let mut data2 = Vec::new();
        data2.extend_from_slice(b"d");
        data2.extend_from_slice(b"8:announce35:http://tracker.example.com/announce");
        data2.extend_from_slice(b"7:comment5:hello");
        data2.extend_from_slice(b"4:infod");
        data2.extend_from_slice(b"6:lengthi100e");
        data2.extend_from_slice(b"4:name8:test.txt");
        data2.extend_from_slice(b"12:piece lengthi32768e");
        data2.extend_from_slice(b"6:pieces20:");
        data2.extend_from_slice(&[0u8; 20]);
        data2.extend_from_slice(b"ee");

        let m1 = Metainfo::parse(&data1).unwrap();
        let m2 = Metainfo::parse(&data2).unwrap();
        assert_eq!(m1.info_hash, m2.info_hash);
    }

    #[test]
    fn test_multi_file_rejected() {
        // 'files' key instead of 'length' => unsupported feature
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce9:http://tr4:infod");
        data.extend_from_slice(b"5:filesld6:lengthi100e4:pathl4:a.ogeee");
        data.extend_from_slice(b"4:name4:test12:piece lengthi32768e6:pieces20:");
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"ee");

        let err = Metainfo::parse(&data).unwrap_err();
        assert_eq!(
            err.protocol_kind(),
            Some(ProtocolErrorKind::UnsupportedFeature)
        );
    }

    #[test]
    fn test_piece_length() {
        let data = create_test_torrent();
        let metainfo = Metainfo::parse(&data).unwrap();

        // Single short piece covering the whole 100-byte file
        assert_eq!(metainfo.piece_length(0), Some(100));
        assert_eq!(metainfo.piece_length(1), None);
    }

    #[test]
    fn test_exact_multiple_last_piece() {
        // 65536 bytes with 32768-byte pieces: the last piece is full length,
        // not zero
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce9:http://tr4:infod");
        data.extend_from_slice(b"6:lengthi65536e4:name4:test12:piece lengthi32768e");
        data.extend_from_slice(b"6:pieces40:");
        data.extend_from_slice(&[0u8; 40]);
        data.extend_from_slice(b"ee");

        let metainfo = Metainfo::parse(&data).unwrap();
        assert_eq!(metainfo.piece_length(0), Some(32768));
        assert_eq!(metainfo.piece_length(1), Some(32768));
    }

    #[test]
    fn test_all_trackers_dedup() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce9:http://t113:announce-list");
        data.extend_from_slice(b"ll9:http://t1el9:http://t29:http://t3el9:http://t2ee");
        data.extend_from_slice(b"4:infod6:lengthi100e4:name4:test12:piece lengthi32768e6:pieces20:");
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"ee");

        let metainfo = Metainfo::parse(&data).unwrap();
        assert_eq!(
            metainfo.all_trackers(),
            vec!["http://t1", "http://t2", "http://t3"]
        );
    }

    #[test]
    fn test_invalid_torrent() {
        // Missing info dict
        let data = b"d8:announce10:http://fooe";
        assert!(Metainfo::parse(data).is_err());

        // Pieces length not a multiple of 20
        let data = b"d8:announce9:http://tr4:infod6:lengthi100e4:name4:test12:piece lengthi1024e6:pieces5:12345ee";
        assert!(Metainfo::parse(data).is_err());

        // Piece count does not cover the declared length
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce9:http://tr4:infod");
        data.extend_from_slice(b"6:lengthi100000e4:name4:test12:piece lengthi32768e");
        data.extend_from_slice(b"6:pieces20:");
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"ee");
        assert!(Metainfo::parse(&data).is_err());

        // Missing announce
        let mut data = Vec::new();
        data.extend_from_slice(b"d4:infod6:lengthi100e4:name4:test12:piece lengthi32768e");
        data.extend_from_slice(b"6:pieces20:");
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"ee");
        assert!(Metainfo::parse(&data).is_err());
    }
}
