//! Server clock synchronization.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Best-effort estimate of `server clock - local clock` in milliseconds.
///
/// Updated (last-write-wins, no smoothing) from the timestamp of every
/// inbound message that carries one; persists across reconnects until
/// overwritten. Consumers use it to display server-relative elapsed times.
#[derive(Debug, Default)]
pub struct ServerClock {
    offset_ms: AtomicI64,
}

impl ServerClock {
    /// Update the offset from an ISO-8601 server timestamp.
    ///
    /// A timestamp that fails to parse leaves the previous offset untouched;
    /// that is not an error.
    pub fn observe(&self, timestamp: &str) {
        self.observe_at(timestamp, Utc::now());
    }

    /// Update rule with an explicit local reference instant.
    pub fn observe_at(&self, timestamp: &str, local_now: DateTime<Utc>) {
        let Ok(server) = DateTime::parse_from_rfc3339(timestamp) else {
            tracing::trace!(timestamp, "unparseable server timestamp, keeping previous offset");
            return;
        };
        let offset = server.with_timezone(&Utc).timestamp_millis() - local_now.timestamp_millis();
        self.offset_ms.store(offset, Ordering::Relaxed);
    }

    /// Last-known offset in milliseconds (0 until first observation).
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }
}
