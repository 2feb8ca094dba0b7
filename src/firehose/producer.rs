/// Jetstream reader that feeds the raw stream
use crate::{
    config::FirehoseConfig,
    error::PipelineResult,
    event::POST_COLLECTION,
    firehose::{normalize, JetstreamMessage},
    metrics::record_firehose_message,
    store::StreamStore,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Appends normalized Jetstream commits to the raw stream
pub struct FirehoseProducer {
    store: Arc<dyn StreamStore>,
    config: FirehoseConfig,
    stream: String,
    max_len: usize,
    shutdown: watch::Receiver<bool>,
    /// `time_us` of the last frame seen, used to resume after a reconnect
    cursor: Option<i64>,
}

/// Build the subscribe url, resuming from `cursor` when set
pub fn subscribe_url(base: &str, collection: &str, cursor: Option<i64>) -> String {
    let mut url = format!(
        "{}/subscribe?wantedCollections={}",
        base.trim_end_matches('/'),
        collection
    );
    if let Some(cursor) = cursor {
        url.push_str(&format!("&cursor={}", cursor));
    }
    url
}

impl FirehoseProducer {
    pub fn new(
        store: Arc<dyn StreamStore>,
        config: FirehoseConfig,
        stream: impl Into<String>,
        max_len: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            config,
            stream: stream.into(),
            max_len,
            shutdown,
            cursor: None,
        }
    }

    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    /// Handle one text frame; returns true when an entry was appended
    pub async fn handle_text(&mut self, text: &str) -> PipelineResult<bool> {
        let message: JetstreamMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                record_firehose_message("invalid");
                debug!("Skipping unparsable Jetstream frame: {}", e);
                return Ok(false);
            }
        };
        self.cursor = Some(message.time_us);

        let Some(event) = normalize(&message, POST_COLLECTION) else {
            record_firehose_message("skipped");
            return Ok(false);
        };

        match self
            .store
            .append(&self.stream, &event.to_fields(), Some(self.max_len))
            .await
        {
            Ok(_) => {
                record_firehose_message("appended");
                Ok(true)
            }
            Err(e) => {
                record_firehose_message("store_error");
                Err(e)
            }
        }
    }

    /// Read the firehose until shutdown, reconnecting on any disconnect
    pub async fn run(&mut self) -> u64 {
        let mut appended = 0u64;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let url = subscribe_url(&self.config.jetstream_url, POST_COLLECTION, self.cursor);
            info!("Connecting to Jetstream: {}", url);

            match connect_async(&url).await {
                Ok((mut ws_stream, _)) => {
                    info!("✓ Connected to Jetstream");

                    loop {
                        let msg = tokio::select! {
                            msg = ws_stream.next() => msg,
                            _ = self.shutdown.changed() => {
                                let _ = ws_stream.close(None).await;
                                break;
                            }
                        };

                        let Some(msg) = msg else {
                            info!("Jetstream stream ended");
                            break;
                        };

                        match msg {
                            Ok(Message::Text(text)) => match self.handle_text(&text).await {
                                Ok(true) => appended += 1,
                                Ok(false) => {}
                                Err(e) => warn!("Failed to append firehose event: {}", e),
                            },
                            Ok(Message::Ping(data)) => {
                                if let Err(e) = ws_stream.send(Message::Pong(data)).await {
                                    error!("Failed to send pong: {}", e);
                                    break;
                                }
                            }
                            Ok(Message::Close(_)) => {
                                info!("Jetstream closed connection");
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!("WebSocket error: {}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to connect to Jetstream: {}", e);
                }
            }

            if *self.shutdown.borrow() {
                break;
            }

            info!("Reconnecting in {:?}...", self.config.reconnect_interval);
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
                _ = self.shutdown.changed() => {}
            }
        }

        info!("Firehose producer stopped after {} events", appended);
        appended
    }
}
