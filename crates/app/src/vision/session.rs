//! Per-viewer multipart stream sessions.
//!
//! Every accepted `/stream.mjpg` request owns one [`StreamSession`] that walks
//! `Accepted -> HeadersSent -> Streaming -> Closed`. Sessions only read from the
//! frame hub, so closing one never affects the producer or other viewers.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use actix_web::web::Bytes;
use async_stream::stream;
use futures_core::Stream;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::vision::hub::Feed;

pub(crate) const BOUNDARY: &str = "FRAME";

pub(crate) fn stream_content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={BOUNDARY}")
}

/// One multipart part: delimiter, part headers, blank line, payload, CRLF.
pub(crate) fn multipart_part(payload: &[u8], content_type: &str) -> Bytes {
    let head = format!(
        "--{BOUNDARY}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
        payload.len()
    );
    let mut part = Vec::with_capacity(head.len() + payload.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(payload);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SessionState {
    Accepted,
    HeadersSent,
    Streaming,
    Closed,
}

impl SessionState {
    /// Transitions only move forward. `Closed` is reachable from every open
    /// state and `Streaming` repeats once per part.
    pub(crate) fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Accepted, HeadersSent)
                | (HeadersSent, Streaming)
                | (Streaming, Streaming)
                | (Accepted | HeadersSent | Streaming, Closed)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// The viewer went away; the server dropped the response body.
    ClientGone,
    /// Capture failed while this session was streaming.
    FeedInterrupted,
    Shutdown,
}

impl CloseReason {
    pub(crate) fn label(self) -> &'static str {
        match self {
            CloseReason::ClientGone => "client_gone",
            CloseReason::FeedInterrupted => "feed_interrupted",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Counters shared by all sessions of one server.
#[derive(Debug, Default)]
pub(crate) struct SessionRegistry {
    next_id: AtomicU64,
    active: AtomicU64,
    parts_sent: AtomicU64,
    client_gone: AtomicU64,
    feed_interrupted: AtomicU64,
    shutdown: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub(crate) struct SessionStats {
    pub(crate) opened: u64,
    pub(crate) active: u64,
    pub(crate) parts_sent: u64,
    pub(crate) client_gone: u64,
    pub(crate) feed_interrupted: u64,
    pub(crate) shutdown: u64,
}

impl SessionRegistry {
    pub(crate) fn stats(&self) -> SessionStats {
        SessionStats {
            opened: self.next_id.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            parts_sent: self.parts_sent.load(Ordering::Relaxed),
            client_gone: self.client_gone.load(Ordering::Relaxed),
            feed_interrupted: self.feed_interrupted.load(Ordering::Relaxed),
            shutdown: self.shutdown.load(Ordering::Relaxed),
        }
    }

    fn open(&self) -> u64 {
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("stream_sessions_active").set(active as f64);
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_close(&self, reason: CloseReason) {
        let counter = match reason {
            CloseReason::ClientGone => &self.client_gone,
            CloseReason::FeedInterrupted => &self.feed_interrupted,
            CloseReason::Shutdown => &self.shutdown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let active = self.active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::gauge!("stream_sessions_active").set(active as f64);
        metrics::counter!("stream_sessions_closed_total", "reason" => reason.label())
            .increment(1);
    }
}

pub(crate) struct StreamSession {
    id: u64,
    state: SessionState,
    feed: watch::Receiver<Feed>,
    registry: Arc<SessionRegistry>,
    last_sent: Option<u64>,
}

impl StreamSession {
    pub(crate) fn accept(mut feed: watch::Receiver<Feed>, registry: Arc<SessionRegistry>) -> Self {
        // Whatever the hub holds right now is the first thing this viewer sees.
        feed.mark_changed();
        let id = registry.open();
        debug!(session = id, "stream session accepted");
        Self {
            id,
            state: SessionState::Accepted,
            feed,
            registry,
            last_sent: None,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// Wait for the next frame newer than the last one sent and frame it as a
    /// multipart part. `None` means the session is closed.
    ///
    /// The first call comes from the body stream's first poll, which actix
    /// only issues after writing the response head.
    pub(crate) async fn next_part(&mut self) -> Option<Bytes> {
        if self.state == SessionState::Accepted {
            self.advance(SessionState::HeadersSent);
        }
        loop {
            if self.state == SessionState::Closed {
                return None;
            }
            if self.feed.changed().await.is_err() {
                self.close(CloseReason::Shutdown);
                return None;
            }
            let feed = self.feed.borrow_and_update().clone();
            match feed {
                Feed::Frame(packet) => {
                    if self.last_sent == Some(packet.frame_number) {
                        continue;
                    }
                    self.last_sent = Some(packet.frame_number);
                    self.advance(SessionState::Streaming);
                    self.registry.parts_sent.fetch_add(1, Ordering::Relaxed);
                    return Some(multipart_part(&packet.image, packet.content_type));
                }
                // A viewer that joined during an outage waits for the device
                // to come back instead of being turned away.
                Feed::Interrupted if self.state == SessionState::Streaming => {
                    self.close(CloseReason::FeedInterrupted);
                }
                Feed::Interrupted | Feed::Idle => {}
                Feed::Closed => self.close(CloseReason::Shutdown),
            }
        }
    }

    pub(crate) fn into_body(mut self) -> impl Stream<Item = Result<Bytes, actix_web::Error>> {
        stream! {
            while let Some(part) = self.next_part().await {
                yield Ok::<Bytes, actix_web::Error>(part);
            }
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid session transition {:?} -> {next:?}",
            self.state
        );
        self.state = next;
    }

    fn close(&mut self, reason: CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        self.advance(SessionState::Closed);
        self.registry.record_close(reason);
        info!(
            session = self.id,
            reason = reason.label(),
            last_frame = ?self.last_sent,
            "stream session closed"
        );
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.close(CloseReason::ClientGone);
    }
}
