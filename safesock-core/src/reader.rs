//! Background ingestion: turns raw transport lines into protocol events.

use std::sync::{Arc, Weak};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;

use crate::filter::Filter;
use crate::protocol;

/// Narrow capability surface the reader needs from the session. All
/// classification outcomes flow through these entry points and nothing
/// else.
pub(crate) trait LineSink: Send + Sync {
    /// A reserved, non-delimiter line (acks, heartbeats).
    fn handle_internal_line(&self, line: &str);
    /// A completed payload frame plus the salt from its delimiter.
    fn handle_user_message(&self, payload: String, salt: u64);
    /// Trigger the one-way alive-to-dead transition.
    fn teardown(&self, intended: bool);
}

/// Reads lines for the whole session lifetime, reassembling multi-line
/// payloads and forwarding control lines. End of stream and I/O failure
/// are both an unfriendly breakdown.
pub(crate) struct FrameReader<R, S> {
    lines: BufReader<R>,
    inbound: Arc<dyn Filter>,
    sink: Weak<S>,
    shutdown: watch::Receiver<bool>,
    pending: Option<String>,
}

impl<R, S> FrameReader<R, S>
where
    R: AsyncRead + Unpin + Send + 'static,
    S: LineSink + 'static,
{
    pub(crate) fn new(
        transport: R,
        inbound: Arc<dyn Filter>,
        sink: Weak<S>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            lines: BufReader::new(transport),
            inbound,
            sink,
            shutdown,
            pending: None,
        }
    }

    /// Run until the stream ends, the transport fails, or the session
    /// shuts down. Every exit path funnels into the idempotent teardown.
    pub(crate) async fn run(mut self) {
        self.ingest().await;
        if let Some(sink) = self.sink.upgrade() {
            sink.teardown(false);
        }
    }

    async fn ingest(&mut self) {
        loop {
            let mut raw = String::new();
            let read = tokio::select! {
                read = self.lines.read_line(&mut raw) => Some(read),
                _ = self.shutdown.changed() => None,
            };
            match read {
                Some(Ok(0)) => {
                    tracing::debug!("transport closed by peer");
                    return;
                }
                Some(Ok(_)) => {
                    while raw.ends_with('\n') || raw.ends_with('\r') {
                        raw.pop();
                    }
                    if !self.dispatch(&raw) {
                        return;
                    }
                }
                Some(Err(error)) => {
                    tracing::debug!(%error, "transport read failed");
                    return;
                }
                None => return,
            }
        }
    }

    /// Classify one line. Returns false when ingestion must stop.
    fn dispatch(&mut self, raw: &str) -> bool {
        let line = self.inbound.filter(raw);
        if line == protocol::MESSAGE_DISCARDED {
            return true;
        }
        let Some(sink) = self.sink.upgrade() else {
            return false;
        };
        if line.starts_with(protocol::DISCONNECT) {
            // Remote close; the transport goes down right behind it.
            sink.teardown(true);
        } else if line.starts_with(protocol::MESSAGE_DELIMITER) {
            match protocol::parse_delimiter(&line) {
                Some(salt) => {
                    let payload = self.pending.take().unwrap_or_default();
                    sink.handle_user_message(payload, salt);
                }
                None => {
                    tracing::error!(line = %line, "delimiter with unparseable salt");
                    return false;
                }
            }
        } else if protocol::is_reserved(&line) {
            sink.handle_internal_line(&line);
        } else {
            match &mut self.pending {
                Some(buffer) => {
                    buffer.push('\n');
                    buffer.push_str(&line);
                }
                None => self.pending = Some(line),
            }
        }
        true
    }
}
