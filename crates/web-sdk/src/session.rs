//! Session tracking: a rotating session id with sliding inactivity expiry,
//! persisted in per-tab storage and never cached in memory.

use std::sync::Arc;

use chrono::Duration;
use pulse_core::environment::{Clock, KeyValueStore};
use tracing::debug;
use uuid::Uuid;

pub const SESSION_ID_KEY: &str = "pulse_session_id";
pub const LAST_ACTIVITY_KEY: &str = "pulse_session_last_activity";

pub fn session_timeout() -> Duration {
    Duration::minutes(30)
}

pub struct SessionTracker {
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Arc<dyn Clock>,
}

impl SessionTracker {
    pub fn new(store: Option<Arc<dyn KeyValueStore>>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn is_available(&self) -> bool {
        self.store.is_some()
    }

    /// Current session id, rotating it after 30 minutes of inactivity.
    /// Every call extends the session.
    pub fn session_id(&self) -> Option<String> {
        let store = self.store.as_ref()?;
        match self.touch(store.as_ref()) {
            Ok(id) => Some(id),
            Err(e) => {
                debug!(error = %e, "session storage unavailable");
                None
            }
        }
    }

    fn touch(&self, store: &dyn KeyValueStore) -> anyhow::Result<String> {
        let now = self.clock.now().timestamp_millis();
        let stored_id = store.get(SESSION_ID_KEY)?.filter(|id| !id.is_empty());
        let last_activity = store
            .get(LAST_ACTIVITY_KEY)?
            .and_then(|raw| raw.parse::<i64>().ok());

        // A corrupt or future timestamp yields no usable gap and expires the session.
        let idle_ms = last_activity
            .and_then(|last| now.checked_sub(last))
            .filter(|gap| *gap >= 0);

        let id = match (stored_id, idle_ms) {
            (Some(id), Some(idle)) if idle <= session_timeout().num_milliseconds() => id,
            _ => {
                let id = Uuid::new_v4().to_string();
                store.set(SESSION_ID_KEY, &id)?;
                debug!(session_id = %id, "started new session");
                id
            }
        };

        store.set(LAST_ACTIVITY_KEY, &now.to_string())?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulse_core::environment::{ManualClock, MemoryStore};

    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            anyhow::bail!("storage access denied")
        }

        fn set(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            anyhow::bail!("storage access denied")
        }
    }

    fn tracker() -> (SessionTracker, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::new());
        let tracker = SessionTracker::new(
            Some(store.clone() as Arc<dyn KeyValueStore>),
            clock.clone() as Arc<dyn Clock>,
        );
        (tracker, clock, store)
    }

    #[test]
    fn test_same_id_within_timeout() {
        let (tracker, clock, _) = tracker();
        let first = tracker.session_id().unwrap();
        clock.advance(Duration::minutes(29));
        assert_eq!(tracker.session_id().unwrap(), first);
    }

    #[test]
    fn test_new_id_after_inactivity() {
        let (tracker, clock, _) = tracker();
        let first = tracker.session_id().unwrap();
        clock.advance(Duration::minutes(31));
        let second = tracker.session_id().unwrap();
        assert_ne!(first, second);
        assert!(Uuid::parse_str(&second).is_ok());
    }

    #[test]
    fn test_activity_slides_the_window() {
        let (tracker, clock, store) = tracker();
        let first = tracker.session_id().unwrap();
        for _ in 0..4 {
            clock.advance(Duration::minutes(20));
            assert_eq!(tracker.session_id().unwrap(), first);
        }
        assert_eq!(
            store.get(LAST_ACTIVITY_KEY).unwrap(),
            Some(clock.now().timestamp_millis().to_string())
        );
    }

    #[test]
    fn test_missing_timestamp_rotates() {
        let (tracker, _, store) = tracker();
        store.set(SESSION_ID_KEY, "stale").unwrap();
        let id = tracker.session_id().unwrap();
        assert_ne!(id, "stale");
        assert_eq!(store.get(SESSION_ID_KEY).unwrap(), Some(id));
    }

    #[test]
    fn test_out_of_range_timestamp_rotates() {
        let (tracker, clock, store) = tracker();
        for stored in [i64::MIN.to_string(), i64::MAX.to_string(), "not-a-number".into()] {
            store.set(SESSION_ID_KEY, "existing").unwrap();
            store.set(LAST_ACTIVITY_KEY, &stored).unwrap();
            let id = tracker.session_id().unwrap();
            assert_ne!(id, "existing", "stored timestamp {stored}");
            assert_eq!(
                store.get(LAST_ACTIVITY_KEY).unwrap(),
                Some(clock.now().timestamp_millis().to_string())
            );
        }
    }

    #[test]
    fn test_unavailable_storage() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        assert_eq!(SessionTracker::new(None, clock.clone()).session_id(), None);
        let broken = SessionTracker::new(Some(Arc::new(BrokenStore)), clock);
        assert!(broken.is_available());
        assert_eq!(broken.session_id(), None);
    }
}
