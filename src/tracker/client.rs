use super::{TrackerRequest, TrackerResponse};
use crate::bencode::decode;
use crate::error::{BittorrentError, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Client for communicating with BitTorrent trackers
pub struct TrackerClient {
    client: Client,
}

impl TrackerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Send a request to a tracker and get the peer list
    pub async fn announce(&self, tracker_url: &str, request: &TrackerRequest) -> Result<TrackerResponse> {
        debug!("Announcing to tracker: {}", tracker_url);

        let url = request.to_url(tracker_url)?;
        let response = self.client.get(url).send().await?;

        let status = response.status();
        let body = response.bytes().await?;

        debug!("Tracker response status: {}, body length: {}", status, body.len());

        if !status.is_success() {
            return Err(BittorrentError::TrackerError(format!(
                "HTTP error: {}",
                status
            )));
        }

        let decoded = decode(&body)?;
        let tracker_response = TrackerResponse::from_bencode(&decoded)?;

        info!(
            "Received {} peers from {} (interval: {}s)",
            tracker_response.peers.len(),
            tracker_url,
            tracker_response.interval
        );

        Ok(tracker_response)
    }

    /// Try each tracker in order and return the first successful response.
    /// Non-HTTP trackers are skipped.
    pub async fn announce_any(&self, urls: &[String], request: &TrackerRequest) -> Result<TrackerResponse> {
        let mut last_error = None;

        for url in urls {
            if !is_http(url) {
                debug!("Skipping unsupported tracker {}", url);
                continue;
            }
            match self.announce(url, request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!("Tracker {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            BittorrentError::TrackerError("No HTTP tracker available".to_string())
        }))
    }
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
