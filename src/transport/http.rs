// src/transport/http.rs
//! Fleet API client over HTTP

use super::{FeedEvent, FeedSubscription, LocationFeed, LocationSink};
use crate::{
    config::ApiConfig,
    error::{Result, TrackerError},
    gps::LocationUpdate,
};
use futures_util::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of each live stream's event channel
const FEED_CHANNEL_CAPACITY: usize = 64;

/// Longest stream line kept while waiting for its newline
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Splits a chunked response body into lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    overflowed: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    ///
    /// A line longer than `MAX_LINE_BYTES` is dropped up to its newline.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos + 1);
            rest = tail;
            if self.overflowed {
                self.overflowed = false;
                self.pending.clear();
                continue;
            }
            self.pending.extend_from_slice(head);
            lines.push(String::from_utf8_lossy(&self.pending).into_owned());
            self.pending.clear();
        }

        if !self.overflowed {
            self.pending.extend_from_slice(rest);
            if self.pending.len() > MAX_LINE_BYTES {
                warn!(bytes = self.pending.len(), "dropping oversized stream line");
                self.pending.clear();
                self.overflowed = true;
            }
        }
        lines
    }

    /// Whatever followed the last newline once the body has ended
    pub fn finish(&mut self) -> Option<String> {
        let overflowed = std::mem::take(&mut self.overflowed);
        let rest = std::mem::take(&mut self.pending);
        if overflowed || rest.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamMessage {
    Update(LocationUpdate),
    Status {
        #[serde(default)]
        connected: Option<bool>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Parse one line of the live stream body.
///
/// Accepts server-sent event framing (`data: {...}`) as well as bare JSON
/// lines. Comments, blank lines and other SSE fields yield nothing.
pub fn parse_stream_line(line: &str, entity_id: &str) -> Vec<FeedEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Vec::new();
    }
    let payload = match line.strip_prefix("data:") {
        Some(data) => data.trim(),
        None if line.starts_with('{') => line,
        None => return Vec::new(),
    };

    match serde_json::from_str::<StreamMessage>(payload) {
        Ok(StreamMessage::Update(mut update)) => {
            if update.entity_id.is_empty() {
                update.entity_id = entity_id.to_string();
            }
            vec![FeedEvent::Update(update)]
        }
        Ok(StreamMessage::Status { connected, error }) => {
            let mut events = Vec::new();
            if let Some(connected) = connected {
                events.push(FeedEvent::Connected(connected));
            }
            if let Some(error) = error {
                events.push(FeedEvent::Error(error));
            }
            events
        }
        Err(e) => {
            warn!(entity_id, error = %e, "ignoring malformed stream message");
            Vec::new()
        }
    }
}

/// Client for the fleet API's location endpoints
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
    reconnect_delay: Duration,
}

impl HttpTransport {
    pub fn new(api: &ApiConfig) -> Result<Self> {
        // No overall timeout on the client: live streams stay open indefinitely
        let http = reqwest::Client::builder()
            .user_agent(concat!("fleet-tracker/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(api.timeout_secs))
            .build()
            .map_err(|e| TrackerError::Config(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            http,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            token: api.token.clone(),
            request_timeout: Duration::from_secs(api.timeout_secs),
            reconnect_delay: Duration::from_secs(api.reconnect_delay_secs.max(1)),
        })
    }

    pub fn location_url(&self, entity_id: &str) -> String {
        format!("{}/vehicles/{}/location", self.base_url, entity_id)
    }

    pub fn stream_url(&self, entity_id: &str) -> String {
        format!("{}/vehicles/{}/location/stream", self.base_url, entity_id)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl LocationSink for HttpTransport {
    async fn send(&self, update: &LocationUpdate) -> Result<()> {
        let request = self
            .http
            .post(self.location_url(&update.entity_id))
            .timeout(self.request_timeout)
            .json(update);

        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| TrackerError::Transport(format!("Failed to send location: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::Transport(format!("Server rejected location: HTTP {}", status)));
        }

        debug!(entity_id = %update.entity_id, "location delivered");
        Ok(())
    }
}

impl LocationFeed for HttpTransport {
    fn subscribe(&self, entity_id: &str) -> FeedSubscription {
        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let client = self.clone();
        let entity_id = entity_id.to_string();
        let task = tokio::spawn(async move {
            client.run_stream(entity_id, tx).await;
        });
        FeedSubscription::new(rx, Some(task))
    }
}

impl HttpTransport {
    /// Read the stream until the subscriber goes away, reconnecting on loss
    async fn run_stream(self, entity_id: String, tx: mpsc::Sender<FeedEvent>) {
        let url = self.stream_url(&entity_id);

        loop {
            let request = self.http.get(&url).header(reqwest::header::ACCEPT, "text/event-stream");
            let response = match self.authorized(request).send().await {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    let message = format!("Live stream refused: HTTP {}", response.status());
                    if tx.send(FeedEvent::Error(message)).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(self.reconnect_delay).await;
                    continue;
                }
                Err(e) => {
                    let message = format!("Live stream unreachable: {}", e);
                    if tx.send(FeedEvent::Error(message)).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(self.reconnect_delay).await;
                    continue;
                }
            };

            info!(entity_id = %entity_id, "live stream connected");
            if tx.send(FeedEvent::Connected(true)).await.is_err() {
                return;
            }

            let mut body = std::pin::pin!(response.bytes_stream());
            let mut lines = LineBuffer::new();
            let mut failure = None;

            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        for line in lines.push(&bytes) {
                            for event in parse_stream_line(&line, &entity_id) {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        failure = Some(e.to_string());
                        break;
                    }
                }
            }

            if failure.is_none() {
                if let Some(line) = lines.finish() {
                    for event in parse_stream_line(&line, &entity_id) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }

            let message = failure.unwrap_or_else(|| "Live stream ended".to_string());
            warn!(entity_id = %entity_id, reason = %message, "live stream disconnected");
            if tx.send(FeedEvent::Connected(false)).await.is_err()
                || tx.send(FeedEvent::Error(message)).await.is_err()
            {
                return;
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "3fa85f64-5717-4562-b3fc-2c963f66afa6";

    fn transport() -> HttpTransport {
        let api = ApiConfig {
            base_url: "https://fleet.example.com/api/".to_string(),
            ..Default::default()
        };
        HttpTransport::new(&api).unwrap()
    }

    #[test]
    fn test_urls() {
        let t = transport();
        assert_eq!(
            t.location_url(ID),
            format!("https://fleet.example.com/api/vehicles/{}/location", ID)
        );
        assert_eq!(
            t.stream_url(ID),
            format!("https://fleet.example.com/api/vehicles/{}/location/stream", ID)
        );
    }

    #[test]
    fn test_sse_update_line() {
        let line = r#"data: {"coords":{"latitude":10.0,"longitude":20.0,"heading":45.0},"timestamp":1700000000000}"#;
        let events = parse_stream_line(line, ID);
        assert_eq!(events.len(), 1);
        let FeedEvent::Update(update) = &events[0] else {
            panic!("expected update");
        };
        assert_eq!(update.entity_id, ID);
        assert_eq!(update.coords.heading, Some(45.0));
    }

    #[test]
    fn test_bare_json_line() {
        let line = format!(
            r#"{{"entityId":"{}","coords":{{"latitude":1.0,"longitude":2.0}},"timestamp":"2024-01-01T00:00:00Z"}}"#,
            ID
        );
        let events = parse_stream_line(&line, "other");
        assert!(matches!(events.as_slice(), [FeedEvent::Update(u)] if u.entity_id == ID));
    }

    #[test]
    fn test_status_lines() {
        assert_eq!(
            parse_stream_line(r#"data: {"connected": false, "error": "vehicle offline"}"#, ID),
            vec![
                FeedEvent::Connected(false),
                FeedEvent::Error("vehicle offline".to_string())
            ]
        );
        assert_eq!(
            parse_stream_line(r#"data: {"connected": true}"#, ID),
            vec![FeedEvent::Connected(true)]
        );
    }

    #[test]
    fn test_line_buffer_joins_chunks() {
        let mut lines = LineBuffer::new();
        assert!(lines.push(b"data: {\"connec").is_empty());
        assert_eq!(lines.push(b"ted\": true}\n: ping\n"), vec![
            "data: {\"connected\": true}\n".to_string(),
            ": ping\n".to_string(),
        ]);
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_line_buffer_flushes_unterminated_tail() {
        let mut lines = LineBuffer::new();
        let body = r#"data: {"connected": false}"#;
        assert!(lines.push(body.as_bytes()).is_empty());

        let tail = lines.finish().unwrap();
        assert_eq!(parse_stream_line(&tail, ID), vec![FeedEvent::Connected(false)]);
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_line_buffer_drops_oversized_line() {
        let mut lines = LineBuffer::new();
        let junk = vec![b'x'; MAX_LINE_BYTES + 1];
        assert!(lines.push(&junk).is_empty());
        assert!(lines.pending.is_empty());

        // The rest of the oversized line is skipped, the next one survives
        assert_eq!(lines.push(b"xxx\n: ok\n"), vec![": ok\n".to_string()]);
        assert!(lines.push(&junk).is_empty());
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_ignored_lines() {
        assert!(parse_stream_line("", ID).is_empty());
        assert!(parse_stream_line(": keep-alive", ID).is_empty());
        assert!(parse_stream_line("event: location", ID).is_empty());
        assert!(parse_stream_line("data: not json", ID).is_empty());
    }
}
