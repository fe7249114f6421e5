use crate::infrastructure::error::EngineError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-user serialization shared by expansion sweeps and sync passes, plus the
/// in-flight markers that make sync single-flight.
#[derive(Debug, Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    in_flight_syncs: Arc<Mutex<HashSet<String>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, user_id: &str) -> Result<Arc<AsyncMutex<()>>, EngineError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|error| EngineError::Persistence(format!("user lock map poisoned: {error}")))?;
        Ok(Arc::clone(
            locks
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        ))
    }

    /// Waits until no other expansion or sync holds this user's lock.
    pub async fn acquire(&self, user_id: &str) -> Result<OwnedMutexGuard<()>, EngineError> {
        Ok(self.lock_for(user_id)?.lock_owned().await)
    }

    /// Marks a sync for `user_id` as running; `None` when one already is.
    pub fn try_begin_sync(&self, user_id: &str) -> Result<Option<InFlightSync>, EngineError> {
        let mut in_flight = self.in_flight_syncs.lock().map_err(|error| {
            EngineError::Persistence(format!("in-flight sync set poisoned: {error}"))
        })?;
        if !in_flight.insert(user_id.to_string()) {
            return Ok(None);
        }
        Ok(Some(InFlightSync {
            in_flight_syncs: Arc::clone(&self.in_flight_syncs),
            user_id: user_id.to_string(),
        }))
    }

    pub fn is_sync_in_flight(&self, user_id: &str) -> bool {
        self.in_flight_syncs
            .lock()
            .map(|in_flight| in_flight.contains(user_id))
            .unwrap_or(false)
    }
}

/// Cleared on drop, including when the owning future is dropped mid-await.
#[derive(Debug)]
pub struct InFlightSync {
    in_flight_syncs: Arc<Mutex<HashSet<String>>>,
    user_id: String,
}

impl Drop for InFlightSync {
    fn drop(&mut self) {
        let mut in_flight = match self.in_flight_syncs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        in_flight.remove(&self.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn second_sync_marker_is_refused_until_first_drops() {
        let locks = UserLocks::new();
        let first = locks.try_begin_sync("user-1").expect("marker");
        assert!(first.is_some());
        assert!(locks.try_begin_sync("user-1").expect("marker").is_none());
        assert!(locks.try_begin_sync("user-2").expect("marker").is_some());

        drop(first);
        assert!(!locks.is_sync_in_flight("user-1"));
        assert!(locks.try_begin_sync("user-1").expect("marker").is_some());
    }

    #[tokio::test]
    async fn same_user_serializes_while_other_users_proceed() {
        let locks = Arc::new(UserLocks::new());
        let held = locks.acquire("user-1").await.expect("lock");

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire("user-1").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        let other = tokio::time::timeout(Duration::from_secs(1), locks.acquire("user-2")).await;
        assert!(other.is_ok());

        drop(held);
        contender.await.expect("join").expect("lock acquired");
    }
}
