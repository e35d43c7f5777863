//! UDP ingest server.
//!
//! A single receiver reads datagrams from resolvers, copies each payload
//! out of the reused receive buffer, and dispatches it to a concurrent
//! handler task. The transport is best-effort by design: malformed
//! payloads are counted and dropped, and back-pressure (no free handler
//! slot) drops the datagram rather than blocking the receiver.

use futures::FutureExt;
use serde::Deserialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::CollectorError;
use crate::metrics::{Metrics, Timer};
use crate::store::Store;

/// Receive buffer size; also the maximum accepted datagram.
const RECV_BUFFER_SIZE: usize = 4096;

/// Upper bound on concurrently running handler tasks.
const MAX_INFLIGHT_HANDLERS: usize = 1024;

/// One parsed query event as emitted by a resolver.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueryEvent {
    /// Address of the querying client; "unknown" when the emitter omits it.
    #[serde(default)]
    pub client_ip: String,
    /// Queried domain name. Required; an empty value invalidates the event.
    #[serde(default)]
    pub domain: String,
    /// Query type as sent by the client.
    #[serde(default)]
    pub qtype: String,
    /// Response type observed by the resolver; "unknown" when omitted.
    #[serde(default)]
    pub rtype: String,
}

impl QueryEvent {
    /// Validate the event and fill defaulted fields. Returns `None` when
    /// the domain is missing.
    pub fn normalize(mut self) -> Option<Self> {
        if self.domain.is_empty() {
            return None;
        }
        if self.client_ip.is_empty() {
            self.client_ip = "unknown".to_string();
        }
        if self.rtype.is_empty() {
            self.rtype = "unknown".to_string();
        }
        Some(self)
    }
}

/// Decode a datagram that may carry trailing garbage after the closing
/// brace (null bytes, stray characters from buggy emitters).
///
/// Scans from the end of the buffer backwards; for each `}` byte, attempts
/// to decode the prefix up to and including it, accepting the longest
/// prefix that parses.
pub fn decode_payload(data: &[u8]) -> Option<QueryEvent> {
    for end in (1..=data.len()).rev() {
        if data[end - 1] != b'}' {
            continue;
        }
        if let Ok(event) = serde_json::from_slice::<QueryEvent>(&data[..end]) {
            return Some(event);
        }
    }
    None
}

/// UDP ingest server.
pub struct IngestServer {
    udp_port: u16,
    max_resolv: i32,
    store: Store,
    metrics: Arc<Metrics>,
}

impl IngestServer {
    /// Create a new ingest server.
    pub fn new(udp_port: u16, max_resolv: i32, store: Store, metrics: Arc<Metrics>) -> Self {
        Self {
            udp_port,
            max_resolv,
            store,
            metrics,
        }
    }

    /// Bind the socket and run the receive loop until shutdown, then wait
    /// for in-flight handlers to drain.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), CollectorError> {
        let socket = UdpSocket::bind(("0.0.0.0", self.udp_port)).await?;
        info!(port = self.udp_port, "ingest server listening");

        let permits = Arc::new(Semaphore::new(MAX_INFLIGHT_HANDLERS));
        let tracker = TaskTracker::new();
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    break;
                }
                received = socket.recv_from(&mut buf) => {
                    let n = match received {
                        Ok((n, _peer)) => n,
                        Err(e) => {
                            warn!("error reading from UDP socket: {}", e);
                            continue;
                        }
                    };

                    // The receive buffer is reused; hand the handler its
                    // own copy of the payload.
                    let data = buf[..n].to_vec();

                    let permit = match permits.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.metrics
                                .server_messages_received
                                .with_label_values(&["dropped"])
                                .inc();
                            continue;
                        }
                    };

                    let store = self.store.clone();
                    let metrics = self.metrics.clone();
                    let max_resolv = self.max_resolv;
                    tracker.spawn(async move {
                        handle_message(store, metrics, max_resolv, data).await;
                        drop(permit);
                    });
                }
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("ingest server stopped");
        Ok(())
    }
}

/// Handle one datagram. A panic anywhere in the handler is recovered into
/// an invalid-message count; it must never take down the receive loop.
async fn handle_message(store: Store, metrics: Arc<Metrics>, max_resolv: i32, data: Vec<u8>) {
    let outcome = AssertUnwindSafe(handle_inner(&store, &metrics, max_resolv, &data))
        .catch_unwind()
        .await;

    if outcome.is_err() {
        error!(
            payload = %String::from_utf8_lossy(&data),
            "recovered from panic while handling datagram"
        );
        metrics
            .server_messages_received
            .with_label_values(&["invalid"])
            .inc();
    }
}

async fn handle_inner(store: &Store, metrics: &Metrics, max_resolv: i32, data: &[u8]) {
    let timer = Timer::start();

    let event = match decode_payload(data).and_then(QueryEvent::normalize) {
        Some(event) => event,
        None => {
            debug!(
                payload = %String::from_utf8_lossy(data),
                "discarding invalid datagram"
            );
            metrics
                .server_messages_received
                .with_label_values(&["invalid"])
                .inc();
            return;
        }
    };

    debug!(
        domain = %event.domain,
        client = %event.client_ip,
        rtype = %event.rtype,
        "received query event"
    );

    // Stats are observational; a failed insert must not stop registration.
    if let Err(e) = store
        .insert_stat(&event.domain, &event.client_ip, &event.rtype)
        .await
    {
        warn!(domain = %event.domain, "error inserting domain stat: {}", e);
    }

    let (domain, is_new) = match store.upsert_domain(&event.domain, max_resolv).await {
        Ok(result) => result,
        Err(e) => {
            warn!(domain = %event.domain, "error upserting domain: {}", e);
            return;
        }
    };

    if let Err(e) = store.touch_last_seen(domain.id).await {
        warn!(domain = %event.domain, "error updating last_seen: {}", e);
    }

    metrics
        .server_messages_received
        .with_label_values(&["valid"])
        .inc();
    metrics
        .server_domains_received
        .with_label_values(&[event.rtype.as_str()])
        .inc();
    metrics.server_processing_time.observe(timer.elapsed_secs());
    if is_new {
        metrics.server_new_domains.inc();
    }
}
