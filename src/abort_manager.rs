use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// Cancellation handles for in-flight group cycles, keyed by group id.
#[derive(Clone)]
pub struct AbortRegistry {
    inner: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn register(&self, group_id: &str) -> CancellationToken {
        let token = CancellationToken::new();

        if let Ok(mut map) = self.inner.lock() {
            map.insert(group_id.to_string(), token.clone());
        }

        token
    }

    pub fn abort(&self, group_id: &str) -> Result<(), String> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| "Failed to acquire lock on abort registry".to_string())?;
        match map.remove(group_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(format!(
                "No cycle in flight for group {} (or it already completed)",
                group_id
            )),
        }
    }

    pub fn unregister(&self, group_id: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(group_id);
        }
    }

    pub fn is_registered(&self, group_id: &str) -> bool {
        if let Ok(map) = self.inner.lock() {
            map.contains_key(group_id)
        } else {
            false
        }
    }
}

impl Default for AbortRegistry {
    fn default() -> Self {
        Self::new()
    }
}
