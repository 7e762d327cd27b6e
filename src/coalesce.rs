use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::broadcast;

/// Fingerprint a request as hex SHA-256 of method, URL and body, so that
/// different payloads never collide.
pub fn fingerprint(method: &str, url: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(url.as_bytes());
    hasher.update(body);
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write;
        let _ = write!(hex, "{:02x}", b);
    }
    hex
}

/// Collapses concurrent identical requests into a single producer run.
///
/// The first caller for a fingerprint becomes the producer; everyone else
/// subscribes to a one-shot broadcast and receives the producer's value.
/// The value is shared as-is (use an `Arc` for identity sharing), and a
/// failed producer result is broadcast like any other value, so waiters
/// never re-execute on error. The map lock is only held for insert,
/// subscribe and remove, never while the producer runs.
pub struct CoalescingCache<T: Clone> {
    inflight: Mutex<HashMap<String, broadcast::Sender<T>>>,
}

impl<T: Clone> Default for CoalescingCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> CoalescingCache<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn coalesce<F, Fut>(&self, key: &str, producer: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut producer = Some(producer);
        loop {
            let waiter = {
                let mut inflight = self.inflight.lock();
                let existing = inflight.get(key).map(|tx| tx.subscribe());
                if existing.is_none() {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(key.to_string(), tx);
                }
                existing
            };

            match waiter {
                Some(mut rx) => match rx.recv().await {
                    Ok(value) => return value,
                    // The producer was cancelled before broadcasting; race
                    // again for the producer slot.
                    Err(_) => continue,
                },
                None => {
                    let guard = InflightGuard { cache: self, key };
                    let produce = producer.take().expect("producer slot claimed at most once");
                    let value = produce().await;
                    guard.complete(value.clone());
                    return value;
                }
            }
        }
    }
}

/// Removes the in-flight entry when the producer finishes or is dropped
/// mid-run. Dropping without `complete` closes the channel, which sends
/// waiters back into the race instead of hanging them forever.
struct InflightGuard<'a, T: Clone> {
    cache: &'a CoalescingCache<T>,
    key: &'a str,
}

impl<T: Clone> InflightGuard<'_, T> {
    fn complete(self, value: T) {
        let mut inflight = self.cache.inflight.lock();
        if let Some(tx) = inflight.remove(self.key) {
            let _ = tx.send(value);
        }
        std::mem::forget(self);
    }
}

impl<T: Clone> Drop for InflightGuard<'_, T> {
    fn drop(&mut self) {
        self.cache.inflight.lock().remove(self.key);
    }
}
