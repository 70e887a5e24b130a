use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// An event as published on the in-process bus. `seq` is assigned at
/// publish time and is strictly increasing for the life of the process;
/// a gap between consecutive envelopes tells a consumer it lagged.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub seq: u64,
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

/// Point-in-time bus counters for diagnostic surfaces.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub lagged: u64,
    pub receivers: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    lagged: AtomicU64,
}

/// Broadcast bus for JSON-serializable events.
///
/// Subscribers that fall behind lose the oldest envelopes; the bus is an
/// observability surface, not a durable queue (the kernel is). Dropped
/// envelopes are tallied across all subscribers and show up in [`stats`],
/// which the health loop reports.
///
/// [`stats`]: Bus::stats
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
    counters: Arc<Counters>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn subscribe(&self) -> Subscriber {
        Subscriber {
            rx: self.tx.subscribe(),
            counters: self.counters.clone(),
        }
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let seq = self.counters.published.fetch_add(1, Ordering::Relaxed) + 1;
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        let _ = self.tx.send(Envelope {
            seq,
            time: now,
            kind: kind.to_string(),
            payload: val,
        });
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            lagged: self.counters.lagged.load(Ordering::Relaxed),
            receivers: self.tx.receiver_count(),
        }
    }
}

/// A live subscription. Lag is not an error at this layer: envelopes
/// evicted before this subscriber read them are added to the shared
/// counters and `recv` resumes at the oldest retained envelope.
pub struct Subscriber {
    rx: broadcast::Receiver<Envelope>,
    counters: Arc<Counters>,
}

impl Subscriber {
    /// Next envelope, or `None` once every `Bus` clone has been dropped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(env) => return Some(env),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.counters.lagged.fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
