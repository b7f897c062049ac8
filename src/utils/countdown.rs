//! Cancellable one-second countdown used to force-submit timed attempts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const TICK: Duration = Duration::from_secs(1);

/// Handle to a running countdown. Clones observe and control the same timer.
#[derive(Clone, Debug)]
pub struct Countdown {
    remaining: Arc<AtomicU64>,
    active: Arc<AtomicBool>,
    token: CancellationToken,
}

impl Countdown {
    /// Starts ticking once per second; `on_expire` runs exactly once when the
    /// remaining time reaches zero, and never if the countdown is cancelled first.
    pub fn start<F, Fut>(duration: Duration, on_expire: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut secs = duration.as_secs();
        if duration.subsec_nanos() > 0 {
            secs += 1;
        }

        let countdown = Self {
            remaining: Arc::new(AtomicU64::new(secs)),
            active: Arc::new(AtomicBool::new(true)),
            token: CancellationToken::new(),
        };

        let remaining = countdown.remaining.clone();
        let active = countdown.active.clone();
        let token = countdown.token.clone();

        tokio::spawn(async move {
            if secs > 0 {
                let mut ticker = interval_at(Instant::now() + TICK, TICK);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            active.store(false, Ordering::SeqCst);
                            return;
                        }
                        _ = ticker.tick() => {
                            let left = remaining.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                            if left == 0 {
                                break;
                            }
                        }
                    }
                }
            }

            if token.is_cancelled() {
                active.store(false, Ordering::SeqCst);
                return;
            }
            active.store(false, Ordering::SeqCst);
            on_expire().await;
        });

        countdown
    }

    pub fn remaining_secs(&self) -> u64 {
        self.remaining.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.token.cancel();
        self.active.store(false, Ordering::SeqCst);
    }
}

struct Entry {
    generation: u64,
    countdown: Countdown,
}

/// Countdowns keyed by the entity they guard.
#[derive(Clone, Default)]
pub struct CountdownRegistry {
    inner: Arc<Mutex<HashMap<Uuid, Entry>>>,
    generations: Arc<AtomicU64>,
}

impl CountdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a countdown for `id`, cancelling any previous one.
    pub fn schedule<F, Fut>(&self, id: Uuid, duration: Duration, on_expire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst);
        let registry = self.clone();
        // held until the entry is stored, so an immediate expiry cannot forget it early
        let mut inner = self.inner.lock().expect("countdown registry mutex poisoned");
        let countdown = Countdown::start(duration, move || async move {
            registry.forget(id, generation);
            on_expire().await;
        });
        let previous = inner.insert(id, Entry { generation, countdown });
        drop(inner);
        if let Some(prev) = previous {
            prev.countdown.cancel();
        }
    }

    pub fn cancel(&self, id: Uuid) -> bool {
        let removed = self
            .inner
            .lock()
            .expect("countdown registry mutex poisoned")
            .remove(&id);
        match removed {
            Some(entry) => {
                entry.countdown.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remaining_secs(&self, id: Uuid) -> Option<u64> {
        self.inner
            .lock()
            .expect("countdown registry mutex poisoned")
            .get(&id)
            .map(|entry| entry.countdown.remaining_secs())
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("countdown registry mutex poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the entry for `id` only if it is still the countdown that expired.
    fn forget(&self, id: Uuid, generation: u64) {
        let mut inner = self.inner.lock().expect("countdown registry mutex poisoned");
        if inner.get(&id).is_some_and(|entry| entry.generation == generation) {
            inner.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() -> std::future::Ready<()> + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        (fired, move || {
            f.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_exactly_once_at_zero() {
        let (fired, on_expire) = counter();
        let countdown = Countdown::start(Duration::from_secs(3), on_expire);
        assert!(countdown.is_active());
        assert_eq!(countdown.remaining_secs(), 3);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(countdown.remaining_secs(), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(countdown.remaining_secs(), 0);
        assert!(!countdown.is_active());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_expiry() {
        let (fired, on_expire) = counter();
        let countdown = Countdown::start(Duration::from_secs(3), on_expire);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        countdown.cancel();
        assert!(!countdown.is_active());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(countdown.remaining_secs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_duration_fires_immediately() {
        let (fired, on_expire) = counter();
        let _countdown = Countdown::start(Duration::ZERO, on_expire);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_seconds_round_up() {
        let (_fired, on_expire) = counter();
        let countdown = Countdown::start(Duration::from_millis(2500), on_expire);
        assert_eq!(countdown.remaining_secs(), 3);
        countdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn registry_replaces_and_forgets() {
        let registry = CountdownRegistry::new();
        let id = Uuid::new_v4();
        let (first, on_first) = counter();
        let (second, on_second) = counter();

        registry.schedule(id, Duration::from_secs(5), on_first);
        registry.schedule(id, Duration::from_secs(2), on_second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.remaining_secs(id), Some(2));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
        assert!(!registry.cancel(id));
    }

    #[tokio::test(start_paused = true)]
    async fn late_expiry_leaves_the_replacement_cancellable() {
        let registry = CountdownRegistry::new();
        let id = Uuid::new_v4();
        let (first, on_first) = counter();
        let (second, on_second) = counter();

        registry.schedule(id, Duration::from_secs(5), on_first);
        let stale = registry.inner.lock().unwrap()[&id].generation;
        registry.schedule(id, Duration::from_secs(5), on_second);

        // the replaced countdown expiring after the new one was stored
        registry.forget(id, stale);
        assert_eq!(registry.len(), 1);
        assert!(registry.cancel(id));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }
}
