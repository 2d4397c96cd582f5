//! Torrent file parser
//!
//! Turns bencoded `.torrent` descriptors into [`TorrentMetadata`] and can
//! build single-file descriptors from in-memory data.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_bencode::value::Value;
use sha1::{Digest, Sha1};
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::torrent::metadata::{InfoHash, PieceHash, TorrentMetadata};

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentMetadata> {
        info!("Parsing torrent file from {} bytes", data.len());

        let root: Value = serde_bencode::from_bytes(data).map_err(|e| {
            error!("Failed to decode torrent descriptor: {}", e);
            TorrentError::parse_error_with_source("Invalid bencode in torrent descriptor", e.to_string())
        })?;

        let root_dict = match &root {
            Value::Dict(d) => d,
            _ => return Err(TorrentError::parse_error("Root must be a dictionary").into()),
        };

        let info_value = root_dict
            .get(b"info".as_slice())
            .ok_or_else(|| TorrentError::parse_error("Missing info dictionary"))?;
        let info_dict = as_dict(info_value).ok_or_else(|| TorrentError::parse_error("Info must be a dictionary"))?;

        let info_bytes = serde_bencode::to_bytes(info_value)?;
        let info_hash = InfoHash::new(Sha1::digest(&info_bytes).into());
        debug!("Info hash: {}", info_hash);

        let name = get_string(info_dict, b"name").ok_or_else(|| TorrentError::parse_error("Missing name field"))?;

        let piece_length = get_int(info_dict, b"piece length")
            .filter(|len| *len > 0)
            .ok_or_else(|| TorrentError::parse_error("Missing or invalid piece length"))? as u64;

        let pieces_bytes = get_bytes(info_dict, b"pieces").ok_or_else(|| TorrentError::parse_error("Missing pieces field"))?;
        let pieces = Self::parse_piece_hashes(pieces_bytes)?;

        let files = Self::parse_files(info_dict, &name)?;
        let trackers = Self::parse_trackers(root_dict);

        trace!("Parsed {} pieces, {} files, {} tracker tiers", pieces.len(), files.len(), trackers.len());

        let metadata = TorrentMetadata::new(info_hash, name, piece_length, pieces, files, trackers)?;
        info!("Successfully parsed torrent: {} ({} bytes)", metadata.name, metadata.total_size());
        Ok(metadata)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &Path) -> Result<TorrentMetadata> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    /// Build a bencoded single-file descriptor for `data`
    pub fn build_single_file(name: &str, piece_length: u64, data: &[u8], announce: Option<&str>) -> Result<Vec<u8>> {
        if piece_length == 0 {
            return Err(TorrentError::config_error_with_field("Piece length must be positive", "piece_length").into());
        }

        let pieces: Vec<u8> = data
            .chunks(piece_length as usize)
            .flat_map(|chunk| <[u8; 20]>::from(Sha1::digest(chunk)))
            .collect();

        let mut info = HashMap::new();
        info.insert(b"name".to_vec(), Value::Bytes(name.as_bytes().to_vec()));
        info.insert(b"piece length".to_vec(), Value::Int(piece_length as i64));
        info.insert(b"length".to_vec(), Value::Int(data.len() as i64));
        info.insert(b"pieces".to_vec(), Value::Bytes(pieces));

        let mut root = HashMap::new();
        root.insert(b"info".to_vec(), Value::Dict(info));
        if let Some(url) = announce {
            root.insert(b"announce".to_vec(), Value::Bytes(url.as_bytes().to_vec()));
        }

        Ok(serde_bencode::to_bytes(&Value::Dict(root))?)
    }

    /// Split the concatenated `pieces` string into SHA1 digests
    fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<PieceHash>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::parse_error_with_source(
                "Pieces field length must be a multiple of 20",
                format!("got {}", pieces_bytes.len()),
            )
            .into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                PieceHash::Sha1(hash)
            })
            .collect())
    }

    fn parse_files(info_dict: &HashMap<Vec<u8>, Value>, name: &str) -> Result<Vec<(PathBuf, u64)>> {
        if let Some(length) = get_int(info_dict, b"length") {
            if length < 0 {
                return Err(TorrentError::parse_error("Negative file length").into());
            }
            return Ok(vec![(PathBuf::from(name), length as u64)]);
        }

        let list = match info_dict.get(b"files".as_slice()) {
            Some(Value::List(list)) => list,
            _ => return Err(TorrentError::parse_error("Neither length nor files found in info dict").into()),
        };

        let mut files = Vec::with_capacity(list.len());
        for entry in list {
            let file_dict = as_dict(entry).ok_or_else(|| TorrentError::parse_error("File entry must be a dictionary"))?;
            let length = get_int(file_dict, b"length")
                .filter(|len| *len >= 0)
                .ok_or_else(|| TorrentError::parse_error("Missing file length"))? as u64;

            let components = match file_dict.get(b"path".as_slice()) {
                Some(Value::List(parts)) => parts,
                _ => return Err(TorrentError::parse_error("Missing file path").into()),
            };

            let mut path = PathBuf::from(name);
            for component in components {
                match component {
                    Value::Bytes(bytes) => path.push(String::from_utf8_lossy(bytes).as_ref()),
                    _ => return Err(TorrentError::parse_error("File path component must be a string").into()),
                }
            }
            files.push((path, length));
        }

        Ok(files)
    }

    fn parse_trackers(root_dict: &HashMap<Vec<u8>, Value>) -> Vec<Vec<String>> {
        let mut tiers = Vec::new();

        if let Some(Value::List(list)) = root_dict.get(b"announce-list".as_slice()) {
            for tier in list {
                if let Value::List(urls) = tier {
                    let urls: Vec<String> = urls
                        .iter()
                        .filter_map(|u| match u {
                            Value::Bytes(b) => Some(String::from_utf8_lossy(b).to_string()),
                            _ => None,
                        })
                        .collect();
                    if !urls.is_empty() {
                        tiers.push(urls);
                    }
                }
            }
        }

        if tiers.is_empty() {
            if let Some(announce) = get_string(root_dict, b"announce") {
                tiers.push(vec![announce]);
            }
        }

        tiers
    }
}

fn as_dict(value: &Value) -> Option<&HashMap<Vec<u8>, Value>> {
    match value {
        Value::Dict(d) => Some(d),
        _ => None,
    }
}

fn get_bytes<'a>(dict: &'a HashMap<Vec<u8>, Value>, key: &[u8]) -> Option<&'a [u8]> {
    match dict.get(key) {
        Some(Value::Bytes(b)) => Some(b),
        _ => None,
    }
}

fn get_string(dict: &HashMap<Vec<u8>, Value>, key: &[u8]) -> Option<String> {
    get_bytes(dict, key).map(|b| String::from_utf8_lossy(b).to_string())
}

fn get_int(dict: &HashMap<Vec<u8>, Value>, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Some(Value::Int(i)) => Some(*i),
        _ => None,
    }
}
