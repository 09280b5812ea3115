use super::Peer;
use crate::bencode::BencodeValue;
use crate::error::{BittorrentError, Result};
use std::net::IpAddr;
use tracing::warn;

/// Response from a tracker
#[derive(Debug, Clone)]
pub struct TrackerResponse {
    /// Interval in seconds to wait before next request
    pub interval: u64,
    /// Minimum announce interval (optional)
    pub min_interval: Option<u64>,
    /// Tracker ID (optional)
    pub tracker_id: Option<String>,
    /// Number of seeders (optional)
    pub complete: Option<u64>,
    /// Number of leechers (optional)
    pub incomplete: Option<u64>,
    /// List of peers
    pub peers: Vec<Peer>,
}

fn tracker_error(message: &str) -> BittorrentError {
    BittorrentError::TrackerError(message.to_string())
}

fn non_negative(value: &BencodeValue) -> Option<u64> {
    value.as_integer().and_then(|i| u64::try_from(i).ok())
}

impl TrackerResponse {
    pub fn from_bencode(value: &BencodeValue) -> Result<Self> {
        let dict = value
            .as_dict()
            .ok_or_else(|| tracker_error("Response must be a dict"))?;

        if let Some(failure) = dict.get(b"failure reason".as_ref()) {
            let reason = failure.as_str().unwrap_or("Unknown failure");
            return Err(BittorrentError::TrackerError(format!(
                "Tracker refused announce: {}",
                reason
            )));
        }

        let interval = dict
            .get(b"interval".as_ref())
            .and_then(non_negative)
            .ok_or_else(|| tracker_error("Missing 'interval' field"))?;

        let min_interval = dict.get(b"min interval".as_ref()).and_then(non_negative);

        let tracker_id = dict
            .get(b"tracker id".as_ref())
            .and_then(|v| v.as_str())
            .map(String::from);

        let complete = dict.get(b"complete".as_ref()).and_then(non_negative);
        let incomplete = dict.get(b"incomplete".as_ref()).and_then(non_negative);

        let peers = match dict.get(b"peers".as_ref()) {
            Some(BencodeValue::Bytes(compact)) => Peer::from_compact_list(compact)
                .ok_or_else(|| tracker_error("Compact peer list is not a multiple of 6 bytes"))?,
            Some(BencodeValue::List(list)) => parse_peer_list(list),
            Some(_) => return Err(tracker_error("Invalid 'peers' format")),
            None => return Err(tracker_error("Missing 'peers' field")),
        };

        Ok(TrackerResponse {
            interval,
            min_interval,
            tracker_id,
            complete,
            incomplete,
            peers,
        })
    }
}

/// Parse a dictionary-model peer list. Entries that cannot be used (a host
/// name instead of an address, a bad port) are skipped, not fatal.
fn parse_peer_list(list: &[BencodeValue]) -> Vec<Peer> {
    list.iter()
        .filter_map(|peer_value| match parse_peer_entry(peer_value) {
            Ok(peer) => Some(peer),
            Err(reason) => {
                warn!("Skipping tracker peer entry: {}", reason);
                None
            }
        })
        .collect()
}

fn parse_peer_entry(peer_value: &BencodeValue) -> std::result::Result<Peer, String> {
    let peer_dict = peer_value
        .as_dict()
        .ok_or_else(|| "peer is not a dict".to_string())?;

    let ip_text = peer_dict
        .get(b"ip".as_ref())
        .and_then(|v| v.as_str())
        .ok_or_else(|| "missing 'ip'".to_string())?;
    let ip: IpAddr = ip_text
        .parse()
        .map_err(|_| format!("'{}' is not an IP address", ip_text))?;

    let port = peer_dict
        .get(b"port".as_ref())
        .and_then(|v| v.as_integer())
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| format!("missing or invalid port for {}", ip))?;

    Ok(match peer_dict.get(b"peer id".as_ref()).and_then(|v| v.as_bytes()) {
        Some(id) => Peer::with_peer_id(ip, port, id.to_vec()),
        None => Peer::new(ip, port),
    })
}
