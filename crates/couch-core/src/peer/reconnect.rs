use super::{PeerError, PeerSignalingChannel};
use crate::channel::Address;
use crate::config::PeerRetryPolicy;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the peer supervisor needs from a link owner.
#[async_trait]
pub trait LinkStarter: Send + Sync + 'static {
    /// Discards any half-open link to `address` and offers a new one.
    async fn start_link(&self, address: &Address) -> Result<(), PeerError>;

    fn link_ready(&self, address: &Address) -> bool;
}

#[async_trait]
impl LinkStarter for PeerSignalingChannel {
    async fn start_link(&self, address: &Address) -> Result<(), PeerError> {
        self.stop(address);
        self.start(address).await
    }

    fn link_ready(&self, address: &Address) -> bool {
        self.is_ready(address)
    }
}

#[derive(Default)]
struct PeerSupervisorState {
    target: Option<Address>,
    active: bool,
    channel_connected: bool,
    retries: u32,
    retry_generation: u64,
    scheduled: Option<JoinHandle<()>>,
}

impl PeerSupervisorState {
    fn cancel_scheduled(&mut self) {
        self.retry_generation += 1;
        if let Some(handle) = self.scheduled.take() {
            handle.abort();
        }
    }
}

struct PeerSupervisorInner {
    starter: Arc<dyn LinkStarter>,
    policy: PeerRetryPolicy,
    state: Mutex<PeerSupervisorState>,
}

/// Keeps a direct link to one target alive.
///
/// Each not-ready report while the shared channel is up schedules exactly one
/// retry after `retry_delay`, up to `max_retries`. The retry counter resets
/// only when the link reports ready.
#[derive(Clone)]
pub struct PeerReconnectSupervisor {
    inner: Arc<PeerSupervisorInner>,
}

impl PeerReconnectSupervisor {
    pub fn new(starter: Arc<dyn LinkStarter>, policy: PeerRetryPolicy) -> Self {
        Self {
            inner: Arc::new(PeerSupervisorInner {
                starter,
                policy,
                state: Mutex::new(PeerSupervisorState::default()),
            }),
        }
    }

    /// Starts supervising a link to `target` and opens it if the shared
    /// channel is up.
    pub fn activate(&self, target: Address) {
        let start_now = {
            let mut state = self.inner.state.lock();
            state.cancel_scheduled();
            state.active = true;
            state.retries = 0;
            state.target = Some(target.clone());
            state.channel_connected
        };
        info!(target: "couch::peer", peer = %target, "supervising peer link");
        if start_now {
            self.spawn_start(target);
        }
    }

    /// Stops supervising. Safe to call when never activated.
    pub fn deactivate(&self) {
        let mut state = self.inner.state.lock();
        if state.active {
            debug!(target: "couch::peer", "peer supervision stopped");
        }
        state.cancel_scheduled();
        state.active = false;
        state.target = None;
    }

    pub fn set_channel_connected(&self, connected: bool) {
        let restart = {
            let mut state = self.inner.state.lock();
            let was_connected = state.channel_connected;
            state.channel_connected = connected;
            if !connected {
                state.cancel_scheduled();
                None
            } else if !was_connected && state.active {
                state.target.clone()
            } else {
                None
            }
        };
        if let Some(target) = restart {
            if !self.inner.starter.link_ready(&target) {
                self.spawn_start(target);
            }
        }
    }

    pub fn on_ready_update(&self, address: &Address, ready: bool) {
        let mut state = self.inner.state.lock();
        if !state.active || state.target.as_ref() != Some(address) {
            return;
        }
        if ready {
            state.retries = 0;
            state.cancel_scheduled();
            return;
        }
        if !state.channel_connected {
            debug!(target: "couch::peer", peer = %address, "link down while channel is down; not retrying");
            return;
        }
        if state
            .scheduled
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }
        if state.retries >= self.inner.policy.max_retries {
            warn!(target: "couch::peer", peer = %address, retries = state.retries, "giving up on peer link");
            return;
        }
        state.retries += 1;
        state.retry_generation += 1;
        let generation = state.retry_generation;
        let attempt = state.retries;
        let inner = self.inner.clone();
        let address = address.clone();
        debug!(
            target: "couch::peer",
            peer = %address,
            attempt,
            delay_secs = self.inner.policy.retry_delay.as_secs(),
            "scheduling peer link retry"
        );
        state.scheduled = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.policy.retry_delay).await;
            {
                let mut state = inner.state.lock();
                if state.retry_generation != generation {
                    return;
                }
                state.scheduled = None;
                if !state.active
                    || !state.channel_connected
                    || state.target.as_ref() != Some(&address)
                {
                    return;
                }
            }
            if inner.starter.link_ready(&address) {
                return;
            }
            info!(target: "couch::peer", peer = %address, attempt, "retrying peer link");
            if let Err(err) = inner.starter.start_link(&address).await {
                warn!(target: "couch::peer", peer = %address, error = %err, "peer link retry failed to start");
            }
        }));
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.state.lock().retries
    }

    fn spawn_start(&self, target: Address) {
        let starter = self.inner.starter.clone();
        tokio::spawn(async move {
            if let Err(err) = starter.start_link(&target).await {
                warn!(target: "couch::peer", peer = %target, error = %err, "failed to start peer link");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingStarter {
        starts: AtomicUsize,
        ready: AtomicBool,
    }

    #[async_trait]
    impl LinkStarter for CountingStarter {
        async fn start_link(&self, _address: &Address) -> Result<(), PeerError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn link_ready(&self, _address: &Address) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
    }

    fn supervisor() -> (PeerReconnectSupervisor, Arc<CountingStarter>) {
        let starter = Arc::new(CountingStarter::default());
        let supervisor = PeerReconnectSupervisor::new(starter.clone(), PeerRetryPolicy::default());
        (supervisor, starter)
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[test_timeout::tokio_timeout_test(300, paused)]
    async fn retries_are_capped_at_max() {
        let (supervisor, starter) = supervisor();
        let tv = Address::new("abc", "tv");
        supervisor.set_channel_connected(true);
        supervisor.activate(tv.clone());
        settle().await;
        assert_eq!(starter.starts.load(Ordering::SeqCst), 1);

        for _ in 0..4 {
            supervisor.on_ready_update(&tv, false);
            tokio::time::sleep(Duration::from_secs(31)).await;
        }
        assert_eq!(starter.starts.load(Ordering::SeqCst), 1 + 3);
        assert_eq!(supervisor.retry_count(), 3);
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn repeated_not_ready_schedules_one_retry() {
        let (supervisor, starter) = supervisor();
        let tv = Address::new("abc", "tv");
        supervisor.set_channel_connected(true);
        supervisor.activate(tv.clone());
        settle().await;

        supervisor.on_ready_update(&tv, false);
        supervisor.on_ready_update(&tv, false);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(starter.starts.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.retry_count(), 1);
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn ready_resets_counter_and_cancels_retry() {
        let (supervisor, starter) = supervisor();
        let tv = Address::new("abc", "tv");
        supervisor.set_channel_connected(true);
        supervisor.activate(tv.clone());
        settle().await;

        supervisor.on_ready_update(&tv, false);
        supervisor.on_ready_update(&tv, true);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(starter.starts.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.retry_count(), 0);
    }

    #[test_timeout::tokio_timeout_test(300, paused)]
    async fn no_retry_while_channel_down_or_inactive() {
        let (supervisor, starter) = supervisor();
        let tv = Address::new("abc", "tv");
        supervisor.deactivate();
        supervisor.activate(tv.clone());
        supervisor.on_ready_update(&tv, false);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(starter.starts.load(Ordering::SeqCst), 0);

        supervisor.set_channel_connected(true);
        settle().await;
        assert_eq!(starter.starts.load(Ordering::SeqCst), 1);

        supervisor.on_ready_update(&tv, false);
        supervisor.deactivate();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(starter.starts.load(Ordering::SeqCst), 1);
    }
}
