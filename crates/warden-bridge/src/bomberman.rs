//! Grace-time eviction.
//!
//! Every strapped container gets a countdown; when it expires without the
//! container being in use, the container is destroyed. Operations pause the
//! countdown for their duration through [`PauseGuard`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::backend::Backend;

/// Eviction timer operations the dispatcher relies on.
pub trait EvictionScheduler: Send + Sync {
    /// Start tracking a container. A zero grace time never expires.
    fn strap(&self, handle: &str, grace_time: Duration);

    /// Stop tracking a container without destroying it.
    fn defuse(&self, handle: &str);

    fn pause(&self, handle: &str);

    fn unpause(&self, handle: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Running,
    Paused,
}

type Detonate = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

struct Timer {
    grace_time: Duration,
    pause_count: usize,
    generation: u64,
    countdown: Option<JoinHandle<()>>,
}

/// Tokio-timer eviction scheduler.
pub struct Bomberman {
    timers: Arc<DashMap<String, Timer>>,
    detonate: Detonate,
}

impl Bomberman {
    /// Scheduler that calls `detonate` with the handle of each expired container.
    pub fn new<F>(detonate: F) -> Self
    where
        F: Fn(String) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self {
            timers: Arc::new(DashMap::new()),
            detonate: Arc::new(detonate),
        }
    }

    /// Scheduler that destroys expired containers through `backend`.
    pub fn destroying(backend: Arc<dyn Backend>) -> Self {
        Self::new(move |handle| {
            let backend = Arc::clone(&backend);
            Box::pin(async move {
                tracing::info!(%handle, "Grace time expired, destroying container");
                if let Err(e) = backend.destroy(&handle).await {
                    tracing::warn!(%handle, error = %e, "Failed to destroy expired container");
                }
            })
        })
    }

    pub fn state(&self, handle: &str) -> Option<TimerState> {
        self.timers.get(handle).map(|timer| {
            if timer.pause_count > 0 {
                TimerState::Paused
            } else {
                TimerState::Running
            }
        })
    }

    fn start_countdown(&self, handle: &str, timer: &mut Timer) {
        timer.generation += 1;
        if timer.grace_time.is_zero() {
            return;
        }

        let timers = Arc::clone(&self.timers);
        let detonate = Arc::clone(&self.detonate);
        let handle = handle.to_string();
        let generation = timer.generation;
        let grace_time = timer.grace_time;

        timer.countdown = Some(tokio::spawn(async move {
            tokio::time::sleep(grace_time).await;
            let expired = timers
                .remove_if(&handle, |_, t| t.generation == generation && t.pause_count == 0)
                .is_some();
            if expired {
                detonate(handle).await;
            }
        }));
    }

    fn stop_countdown(timer: &mut Timer) {
        timer.generation += 1;
        if let Some(countdown) = timer.countdown.take() {
            countdown.abort();
        }
    }
}

impl EvictionScheduler for Bomberman {
    fn strap(&self, handle: &str, grace_time: Duration) {
        let mut timer = Timer {
            grace_time,
            pause_count: 0,
            generation: 0,
            countdown: None,
        };
        self.start_countdown(handle, &mut timer);
        if let Some(mut previous) = self.timers.insert(handle.to_string(), timer) {
            Self::stop_countdown(&mut previous);
        }
        tracing::debug!(%handle, grace_time_secs = grace_time.as_secs(), "Strapped container");
    }

    fn defuse(&self, handle: &str) {
        if let Some((_, mut timer)) = self.timers.remove(handle) {
            Self::stop_countdown(&mut timer);
            tracing::debug!(%handle, "Defused container");
        }
    }

    fn pause(&self, handle: &str) {
        let Some(mut timer) = self.timers.get_mut(handle) else {
            return;
        };
        timer.pause_count += 1;
        if timer.pause_count == 1 {
            Self::stop_countdown(&mut timer);
        }
    }

    fn unpause(&self, handle: &str) {
        let Some(mut timer) = self.timers.get_mut(handle) else {
            return;
        };
        if timer.pause_count == 0 {
            return;
        }
        timer.pause_count -= 1;
        if timer.pause_count == 0 {
            self.start_countdown(handle, &mut timer);
        }
    }
}

/// Pauses a container's countdown until dropped.
///
/// Unpauses on every exit path, including unwinding.
pub struct PauseGuard {
    scheduler: Arc<dyn EvictionScheduler>,
    handle: String,
}

impl PauseGuard {
    pub fn new(scheduler: Arc<dyn EvictionScheduler>, handle: impl Into<String>) -> Self {
        let handle = handle.into();
        scheduler.pause(&handle);
        Self { scheduler, handle }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.scheduler.unpause(&self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn recording() -> (Arc<Bomberman>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bomberman = Bomberman::new(move |handle| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(handle);
            })
        });
        (Arc::new(bomberman), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn expired_container_is_detonated() {
        let (bomberman, mut detonated) = recording();
        bomberman.strap("c1", Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(detonated.recv().await.as_deref(), Some("c1"));
        assert_eq!(bomberman.state("c1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_container_survives_grace_time() {
        let (bomberman, mut detonated) = recording();
        bomberman.strap("c1", Duration::from_secs(10));
        bomberman.pause("c1");

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(detonated.try_recv().is_err());
        assert_eq!(bomberman.state("c1"), Some(TimerState::Paused));
    }

    #[tokio::test(start_paused = true)]
    async fn unpause_restarts_full_grace_time() {
        let (bomberman, mut detonated) = recording();
        bomberman.strap("c1", Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(8)).await;

        bomberman.pause("c1");
        bomberman.unpause("c1");
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert!(detonated.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(detonated.recv().await.as_deref(), Some("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_pauses_are_balanced() {
        let (bomberman, _detonated) = recording();
        bomberman.strap("c1", Duration::from_secs(10));

        let first = PauseGuard::new(bomberman.clone(), "c1");
        let second = PauseGuard::new(bomberman.clone(), "c1");
        drop(first);
        assert_eq!(bomberman.state("c1"), Some(TimerState::Paused));
        drop(second);

        assert_eq!(bomberman.state("c1"), Some(TimerState::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn unpause_without_pause_is_a_noop() {
        let (bomberman, _detonated) = recording();
        bomberman.strap("c1", Duration::from_secs(10));
        bomberman.unpause("c1");
        bomberman.pause("c1");

        assert_eq!(bomberman.state("c1"), Some(TimerState::Paused));
    }

    #[tokio::test(start_paused = true)]
    async fn defuse_cancels_countdown() {
        let (bomberman, mut detonated) = recording();
        bomberman.strap("c1", Duration::from_secs(10));
        bomberman.defuse("c1");

        tokio::time::sleep(Duration::from_secs(20)).await;

        assert!(detonated.try_recv().is_err());
        assert_eq!(bomberman.state("c1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_grace_time_never_expires() {
        let (bomberman, mut detonated) = recording();
        bomberman.strap("c1", Duration::ZERO);

        tokio::time::sleep(Duration::from_secs(3600)).await;

        assert!(detonated.try_recv().is_err());
        assert_eq!(bomberman.state("c1"), Some(TimerState::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn guard_unpauses_on_panic() {
        let (bomberman, _detonated) = recording();
        bomberman.strap("c1", Duration::from_secs(10));

        let scheduler = bomberman.clone();
        let result = tokio::spawn(async move {
            let _guard = PauseGuard::new(scheduler, "c1");
            panic!("backend exploded");
        })
        .await;

        assert!(result.is_err());
        assert_eq!(bomberman.state("c1"), Some(TimerState::Running));
    }
}
