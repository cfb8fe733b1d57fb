use crate::store::{Result, StatusEvent, StatusStore, StatusStoreRef};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Append-only status timeline consumed by clients for progress
/// feedback
///
/// Thin facade over a [`StatusStore`] that keeps timestamps strictly
/// monotonic within one session and mirrors every event into the
/// tracing log.
pub struct StatusStream {
    store: StatusStoreRef,
    last_timestamp: DashMap<String, DateTime<Utc>>,
}

impl StatusStream {
    /// Create a stream over a status store
    pub fn new(store: StatusStoreRef) -> Self {
        Self {
            store,
            last_timestamp: DashMap::new(),
        }
    }

    /// Create a stream that drops events (for tests)
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoOpStatusStore))
    }

    /// Append a message to a session's timeline
    pub async fn emit(&self, session: &str, message: impl Into<String>) -> Result<()> {
        let mut event = StatusEvent::new(session, message);

        // Clock reads can repeat under coarse timers; bump into
        // strictly increasing order per session.
        {
            let mut last = self
                .last_timestamp
                .entry(session.to_string())
                .or_insert(event.timestamp - Duration::milliseconds(1));
            if event.timestamp <= *last {
                event.timestamp = *last + Duration::microseconds(1);
            }
            *last = event.timestamp;
        }

        tracing::info!(session = %session, message = %event.message, "Status");
        self.store.append(event).await
    }

    /// Events after the cursor, oldest first
    pub async fn events_since(
        &self,
        session: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatusEvent>> {
        self.store.events_since(session, since).await
    }
}

/// No-op store backing the disabled stream
struct NoOpStatusStore;

#[async_trait::async_trait]
impl StatusStore for NoOpStatusStore {
    async fn append(&self, _event: StatusEvent) -> Result<()> {
        Ok(())
    }

    async fn events_since(
        &self,
        _session: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatusEvent>> {
        Ok(vec![])
    }
}
