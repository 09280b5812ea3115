use crate::error::Result;
use crate::peer::PeerId;
use crate::torrent::InfoHash;
use url::form_urlencoded::byte_serialize;
use url::Url;

/// Events sent to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }
}

/// Request parameters for tracker communication
#[derive(Debug, Clone)]
pub struct TrackerRequest {
    /// SHA1 hash of the info dictionary
    pub info_hash: InfoHash,
    /// Unique peer ID
    pub peer_id: PeerId,
    /// Port this peer is listening on
    pub port: u16,
    /// Total amount uploaded
    pub uploaded: u64,
    /// Total amount downloaded
    pub downloaded: u64,
    /// Number of bytes left to download
    pub left: u64,
    /// Event (optional)
    pub event: Option<TrackerEvent>,
    /// Request compact peer list format
    pub compact: bool,
    /// Number of peers we would like back
    pub numwant: Option<u32>,
    /// Echoed back once a tracker hands one out
    pub tracker_id: Option<String>,
}

impl TrackerRequest {
    pub fn new(info_hash: InfoHash, peer_id: PeerId, port: u16, left: u64) -> Self {
        Self {
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left,
            event: Some(TrackerEvent::Started),
            compact: true,
            numwant: None,
            tracker_id: None,
        }
    }

    /// Build query parameters for HTTP request; binary values are
    /// percent-encoded byte by byte.
    pub fn to_query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("info_hash", percent_encode(&self.info_hash)),
            ("peer_id", percent_encode(&self.peer_id)),
            ("port", self.port.to_string()),
            ("uploaded", self.uploaded.to_string()),
            ("downloaded", self.downloaded.to_string()),
            ("left", self.left.to_string()),
            ("compact", if self.compact { "1" } else { "0" }.to_string()),
        ];

        if let Some(numwant) = self.numwant {
            params.push(("numwant", numwant.to_string()));
        }
        if let Some(tracker_id) = &self.tracker_id {
            params.push(("trackerid", percent_encode(tracker_id.as_bytes())));
        }
        if let Some(event) = &self.event {
            params.push(("event", event.as_str().to_string()));
        }

        params
    }

    /// Append the announce parameters to `tracker_url`, keeping any query
    /// it already carries.
    pub fn to_url(&self, tracker_url: &str) -> Result<Url> {
        let mut url = Url::parse(tracker_url)?;
        let ours = self
            .to_query_params()
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join("&");

        let query = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{}&{}", existing, ours),
            _ => ours,
        };
        url.set_query(Some(&query));
        Ok(url)
    }
}

fn percent_encode(bytes: &[u8]) -> String {
    byte_serialize(bytes).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_params_are_encoded_once() {
        let mut info_hash = [0u8; 20];
        info_hash[0] = 0xab;
        info_hash[1] = b'A';
        let request = TrackerRequest::new(info_hash, *b"-BW0001-abcdefghijkl", 6881, 100);

        let url = request.to_url("http://tracker.test/announce").unwrap();
        let query = url.query().unwrap();

        assert!(query.starts_with("info_hash=%ABA%00%00"));
        assert!(query.contains("peer_id=-BW0001-abcdefghijkl"));
        assert!(query.contains("left=100"));
        assert!(query.ends_with("event=started"));
    }

    #[test]
    fn test_existing_query_is_kept() {
        let mut request = TrackerRequest::new([1u8; 20], [2u8; 20], 6881, 0);
        request.event = None;
        request.numwant = Some(50);
        request.tracker_id = Some("a b".to_string());

        let url = request.to_url("http://tracker.test/announce?key=abc").unwrap();
        let query = url.query().unwrap();
        assert!(query.starts_with("key=abc&info_hash="));
        assert!(query.contains("numwant=50"));
        assert!(query.ends_with("trackerid=a+b"));
    }
}
