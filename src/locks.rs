// src/locks.rs
//! Именованные асинхронные блокировки (по id стока / id операции)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{timeout, Duration};

use crate::error::{PlacementError, PlacementResult};

type Slot = Arc<AsyncMutex<()>>;

/// Map of lazily created per-key mutexes. Entries are dropped once nobody
/// holds or waits on them.
pub struct KeyedLocks {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    wait_timeout: Duration,
}

pub struct KeyGuard {
    key: String,
    slot: Slot,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl KeyedLocks {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            wait_timeout,
        }
    }

    pub async fn lock(&self, key: &str) -> PlacementResult<KeyGuard> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.entry(key.to_string()).or_default().clone()
        };

        let guard = timeout(self.wait_timeout, slot.clone().lock_owned())
            .await
            .map_err(|_| PlacementError::LockTimeout(key.to_string()))?;

        Ok(KeyGuard {
            key: key.to_string(),
            slot,
            guard: Some(guard),
            slots: self.slots.clone(),
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        // map + self; новые ожидающие клонируют Arc только под этим же мьютексом
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.key);
        }
    }
}
