//! Push sessions and their outbound queues.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{ACCEPT, CONTENT_TYPE};
use http::HeaderMap;
use parking_lot::{Mutex, RwLock};
use tidewire_core::{Encoding, PushFilter};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::service::context::parse_claims;

/// An encoded event ready to be written to a session's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub data: Bytes,
    pub encoding: Encoding,
}

// ---------------------------------------------------------------------------
// OutboundQueue
// ---------------------------------------------------------------------------

/// Bounded FIFO drained by the session's write loop.
///
/// Pushing never blocks: on overflow the oldest message is dropped.
#[derive(Debug)]
struct OutboundQueue {
    items: Mutex<VecDeque<PushMessage>>,
    capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Appends `message`, returning the message evicted to make room.
    fn push(&self, message: PushMessage) -> Option<PushMessage> {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(message);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    async fn pop(&self) -> PushMessage {
        loop {
            let next = self.items.lock().pop_front();
            if let Some(message) = next {
                return message;
            }
            self.notify.notified().await;
        }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Encoding negotiation
// ---------------------------------------------------------------------------

/// Read and write encodings of a session.
///
/// The `encoding` query parameter sets both. Otherwise the read side follows
/// `Content-Type` and the write side `Accept`, each defaulting to JSON.
#[must_use]
pub fn negotiate_encodings(
    headers: &HeaderMap,
    parameters: &HashMap<String, Vec<String>>,
) -> (Encoding, Encoding) {
    if let Some(encoding) = parameters
        .get("encoding")
        .and_then(|values| values.first())
        .and_then(|name| Encoding::from_name(name))
    {
        return (encoding, encoding);
    }

    let from_header = |name: http::HeaderName| {
        headers
            .get(name)
            .and_then(|v: &http::HeaderValue| v.to_str().ok())
            .map(Encoding::from_content_type)
            .unwrap_or_default()
    };
    (from_header(CONTENT_TYPE), from_header(ACCEPT))
}

// ---------------------------------------------------------------------------
// PushSession
// ---------------------------------------------------------------------------

/// A live push channel to one client.
#[derive(Debug)]
pub struct PushSession {
    id: String,
    headers: HeaderMap,
    parameters: HashMap<String, Vec<String>>,
    client_ip: Option<String>,
    start_time: DateTime<Utc>,
    read_encoding: Encoding,
    write_encoding: Encoding,
    filter: RwLock<Option<PushFilter>>,
    claims: RwLock<(Vec<String>, HashMap<String, String>)>,
    metadata: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    queue: OutboundQueue,
    close: CancellationToken,
}

impl PushSession {
    /// Creates a session with a fresh id, starting now. Encodings are
    /// negotiated from `headers` and `parameters`.
    #[must_use]
    pub fn new(
        headers: HeaderMap,
        parameters: HashMap<String, Vec<String>>,
        queue_capacity: usize,
    ) -> Self {
        let (read_encoding, write_encoding) = negotiate_encodings(&headers, &parameters);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            headers,
            parameters,
            client_ip: None,
            start_time: Utc::now(),
            read_encoding,
            write_encoding,
            filter: RwLock::new(None),
            claims: RwLock::new((Vec::new(), HashMap::new())),
            metadata: RwLock::new(HashMap::new()),
            queue: OutboundQueue::new(queue_capacity),
            close: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    #[must_use]
    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|v| v.to_str().ok())
    }

    /// First value of query parameter `key`.
    #[must_use]
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    #[must_use]
    pub fn client_ip(&self) -> Option<&str> {
        self.client_ip.as_deref()
    }

    /// Events stamped before this instant are never delivered.
    #[must_use]
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Encoding of frames received from the client.
    #[must_use]
    pub fn read_encoding(&self) -> Encoding {
        self.read_encoding
    }

    /// Encoding of frames sent to the client.
    #[must_use]
    pub fn write_encoding(&self) -> Encoding {
        self.write_encoding
    }

    #[must_use]
    pub fn filter(&self) -> Option<PushFilter> {
        self.filter.read().clone()
    }

    /// Replaces the filter. `None` lets every event through.
    pub fn set_filter(&self, filter: Option<PushFilter>) {
        *self.filter.write() = filter;
    }

    #[must_use]
    pub fn claims(&self) -> Vec<String> {
        self.claims.read().0.clone()
    }

    #[must_use]
    pub fn claims_map(&self) -> HashMap<String, String> {
        self.claims.read().1.clone()
    }

    pub fn set_claims(&self, claims: Vec<String>) {
        let map = parse_claims(&claims);
        *self.claims.write() = (claims, map);
    }

    pub fn set_metadata<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.metadata.write().insert(key.into(), Arc::new(value));
    }

    #[must_use]
    pub fn metadata<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.metadata
            .read()
            .get(key)
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }

    /// Queues `message` for the client. Never blocks.
    pub fn enqueue(&self, message: PushMessage) {
        if self.queue.push(message).is_some() {
            metrics::counter!("tidewire_push_dropped_total").increment(1);
            tracing::warn!(session_id = %self.id, "session queue full, dropped oldest message");
        }
    }

    /// Number of messages waiting to be written.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Next message to write, or `None` once the session is closed.
    pub async fn next_message(&self) -> Option<PushMessage> {
        tokio::select! {
            biased;
            () = self.close.cancelled() => None,
            message = self.queue.pop() => Some(message),
        }
    }

    /// Signals the transport loops to stop.
    pub fn close(&self) {
        self.close.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.close.cancelled().await;
    }
}
