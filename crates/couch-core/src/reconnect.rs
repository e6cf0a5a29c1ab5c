//! Silent rejoin of the shared channel after an unexpected disconnect.

use crate::channel::{
    ChannelError, ChannelIdentity, ChannelProfile, ChannelTransport, DisconnectReason, JoinOptions,
};
use crate::config::ReconnectPolicy;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectEvent {
    /// Sent once when a reconnect loop starts, however many rejoins it takes.
    Reconnecting,
    Reconnected { profile: ChannelProfile },
    /// Reconnecting stopped for good; the role should surface this.
    Unrecoverable { reason: String },
}

/// Source of the random delay before each rejoin attempt.
pub trait Jitter: Send + Sync {
    /// A delay in `[0, upper)`.
    fn delay(&self, upper: Duration) -> Duration;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn delay(&self, upper: Duration) -> Duration {
        let upper_ms = upper.as_millis() as u64;
        if upper_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..upper_ms))
    }
}

pub type ReconnectPredicate = Arc<dyn Fn(&DisconnectReason) -> bool + Send + Sync>;

#[derive(Default)]
struct CancelToken {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Runs `future` unless cancelled first; `None` means cancelled.
    async fn run<F: std::future::Future>(&self, future: F) -> Option<F::Output> {
        if self.is_cancelled() {
            return None;
        }
        tokio::select! {
            output = future => (!self.is_cancelled()).then_some(output),
            _ = self.notify.notified() => None,
        }
    }
}

#[derive(Default)]
struct SupervisorState {
    target: Option<(ChannelIdentity, JoinOptions)>,
    attempt_count: u32,
    reconnecting: bool,
    cancelled: bool,
    token: Option<Arc<CancelToken>>,
    task: Option<JoinHandle<()>>,
}

struct SupervisorInner {
    transport: ChannelTransport,
    policy: ReconnectPolicy,
    jitter: Arc<dyn Jitter>,
    should_reconnect: ReconnectPredicate,
    state: Mutex<SupervisorState>,
    events: mpsc::UnboundedSender<ReconnectEvent>,
}

/// Rejoins the last joined identity after a retryable disconnect.
///
/// At most one reconnect loop runs at a time. The loop waits a random delay
/// below `initial_jitter` before the first rejoin and below `retry_jitter`
/// before every later one; cancellation is checked after every await.
#[derive(Clone)]
pub struct ReconnectSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ReconnectSupervisor {
    pub fn new(
        transport: ChannelTransport,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<ReconnectEvent>) {
        Self::with_options(
            transport,
            policy,
            Arc::new(RandomJitter),
            Arc::new(DisconnectReason::is_retryable),
        )
    }

    pub fn with_options(
        transport: ChannelTransport,
        policy: ReconnectPolicy,
        jitter: Arc<dyn Jitter>,
        should_reconnect: ReconnectPredicate,
    ) -> (Self, mpsc::UnboundedReceiver<ReconnectEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = SupervisorInner {
            transport,
            policy,
            jitter,
            should_reconnect,
            state: Mutex::new(SupervisorState::default()),
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    pub fn transport(&self) -> &ChannelTransport {
        &self.inner.transport
    }

    /// Joins through the transport and remembers the target for rejoins.
    pub async fn join(
        &self,
        identity: &ChannelIdentity,
        options: &JoinOptions,
    ) -> Result<ChannelProfile, ChannelError> {
        self.inner.state.lock().cancelled = false;
        let profile = self.inner.transport.join(identity, options).await?;
        // A retry without a secret changes what a rejoin must present.
        let effective = self
            .inner
            .transport
            .identity()
            .unwrap_or_else(|| identity.clone());
        self.inner.state.lock().target = Some((effective, options.clone()));
        Ok(profile)
    }

    /// Replaces the identity used by later rejoins (secret rotation).
    pub fn update_identity(&self, identity: ChannelIdentity) {
        if let Some((current, _)) = self.inner.state.lock().target.as_mut() {
            *current = identity;
        }
    }

    /// The identity a rejoin would present.
    pub fn target_identity(&self) -> Option<ChannelIdentity> {
        self.inner
            .state
            .lock()
            .target
            .as_ref()
            .map(|(identity, _)| identity.clone())
    }

    pub fn attempt_count(&self) -> u32 {
        self.inner.state.lock().attempt_count
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.state.lock().reconnecting
    }

    /// Reacts to a transport disconnect. Returns `true` when a reconnect
    /// loop was started.
    pub fn handle_disconnect(&self, reason: &DisconnectReason) -> bool {
        if !(self.inner.should_reconnect)(reason) {
            warn!(target: "couch::reconnect", reason = %reason, "disconnect is not recoverable");
            let _ = self.inner.events.send(ReconnectEvent::Unrecoverable {
                reason: reason.to_string(),
            });
            return false;
        }

        let mut state = self.inner.state.lock();
        if state.cancelled || state.target.is_none() {
            debug!(target: "couch::reconnect", "not reconnecting: no active target");
            return false;
        }
        if state.reconnecting {
            debug!(target: "couch::reconnect", "reconnect already in progress");
            return false;
        }
        state.reconnecting = true;
        state.attempt_count = 0;
        let token = Arc::new(CancelToken::default());
        state.token = Some(token.clone());

        info!(target: "couch::reconnect", reason = %reason, "starting silent reconnect");
        let _ = self.inner.events.send(ReconnectEvent::Reconnecting);
        // Stored under the lock so the loop's own cleanup always sees it.
        state.task = Some(tokio::spawn(run_reconnect(self.inner.clone(), token)));
        true
    }

    /// Stops a running reconnect loop and waits for it to wind down. With no
    /// loop running this does nothing, so later disconnects still reconnect.
    pub async fn cancel(&self) {
        let (token, task) = {
            let mut state = self.inner.state.lock();
            let running = (state.token.take(), state.task.take());
            if running.0.is_some() || running.1.is_some() {
                state.cancelled = true;
            }
            running
        };
        if let Some(token) = token {
            token.cancel();
        }
        if let Some(task) = task {
            let _ = task.await;
            self.inner.transport.teardown();
            debug!(target: "couch::reconnect", "reconnect cancelled");
        }
    }
}

async fn run_reconnect(inner: Arc<SupervisorInner>, token: Arc<CancelToken>) {
    let outcome = rejoin_until_done(&inner, &token).await;
    {
        let mut state = inner.state.lock();
        state.reconnecting = false;
        state.token = None;
        state.task = None;
    }
    if let Some(event) = outcome {
        let _ = inner.events.send(event);
    }
}

/// Returns the closing event, or `None` when cancelled.
async fn rejoin_until_done(
    inner: &SupervisorInner,
    token: &CancelToken,
) -> Option<ReconnectEvent> {
    let mut attempt: u32 = 0;
    loop {
        inner.transport.teardown();
        let upper = if attempt == 0 {
            inner.policy.initial_jitter
        } else {
            inner.policy.retry_jitter
        };
        let delay = inner.jitter.delay(upper);
        token.run(tokio::time::sleep(delay)).await?;

        let (identity, options) = {
            let mut state = inner.state.lock();
            attempt += 1;
            state.attempt_count = attempt;
            state.target.clone()?
        };
        debug!(
            target: "couch::reconnect",
            attempt,
            delay_ms = delay.as_millis() as u64,
            channel = %identity.name,
            "rejoining channel"
        );

        let Some(result) = token.run(inner.transport.join(&identity, &options)).await else {
            inner.transport.teardown();
            return None;
        };
        match result {
            Ok(profile) => {
                info!(target: "couch::reconnect", attempt, channel = %profile.name, "reconnected");
                inner.state.lock().attempt_count = 0;
                return Some(ReconnectEvent::Reconnected { profile });
            }
            Err(ChannelError::Unauthorized) => {
                error!(target: "couch::reconnect", attempt, "rejoin refused: secret no longer valid");
                return Some(ReconnectEvent::Unrecoverable {
                    reason: ChannelError::Unauthorized.to_string(),
                });
            }
            Err(err) => {
                warn!(target: "couch::reconnect", attempt, error = %err, "rejoin attempt failed");
                if inner
                    .policy
                    .max_attempts
                    .is_some_and(|max| attempt >= max)
                {
                    error!(target: "couch::reconnect", attempt, "exhausted reconnect attempts");
                    return Some(ReconnectEvent::Unrecoverable {
                        reason: format!("gave up after {attempt} attempts: {err}"),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelEvent, DisconnectKind, MemoryHub};
    use crate::config::CoreConfig;

    #[derive(Default)]
    struct RecordingJitter {
        uppers: Mutex<Vec<Duration>>,
    }

    impl Jitter for RecordingJitter {
        fn delay(&self, upper: Duration) -> Duration {
            self.uppers.lock().push(upper);
            upper - Duration::from_millis(1)
        }
    }

    struct Fixture {
        hub: MemoryHub,
        transport: ChannelTransport,
        channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
        supervisor: ReconnectSupervisor,
        events: mpsc::UnboundedReceiver<ReconnectEvent>,
        jitter: Arc<RecordingJitter>,
    }

    fn fixture(max_attempts: Option<u32>) -> Fixture {
        let hub = MemoryHub::new();
        let (transport, channel_events) =
            ChannelTransport::new(Arc::new(hub.clone()), &CoreConfig::default());
        let jitter = Arc::new(RecordingJitter::default());
        let policy = ReconnectPolicy {
            max_attempts,
            ..ReconnectPolicy::default()
        };
        let (supervisor, events) = ReconnectSupervisor::with_options(
            transport.clone(),
            policy,
            jitter.clone(),
            Arc::new(DisconnectReason::is_retryable),
        );
        Fixture {
            hub,
            transport,
            channel_events,
            supervisor,
            events,
            jitter,
        }
    }

    async fn next_disconnect(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> DisconnectReason {
        loop {
            match events.recv().await {
                Some(ChannelEvent::Disconnected(reason)) => return reason,
                Some(_) => continue,
                None => panic!("channel events closed"),
            }
        }
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn one_failed_rejoin_then_success_reports_once() {
        let mut fx = fixture(Some(10));
        fx.supervisor
            .join(&ChannelIdentity::new("abc", "123"), &JoinOptions::controller())
            .await
            .unwrap();
        let connects_before = fx.hub.connect_count();

        fx.hub.drop_participant(&fx.transport.local_address().unwrap());
        fx.hub.fail_next_connects(1);
        let reason = next_disconnect(&mut fx.channel_events).await;
        assert!(fx.supervisor.handle_disconnect(&reason));

        assert_eq!(fx.events.recv().await, Some(ReconnectEvent::Reconnecting));
        match fx.events.recv().await {
            Some(ReconnectEvent::Reconnected { .. }) => {}
            other => panic!("unexpected event {other:?}"),
        }
        // Cleared before the event is observable.
        assert!(!fx.supervisor.is_reconnecting());
        assert!(fx.events.try_recv().is_err());
        assert_eq!(fx.hub.connect_count() - connects_before, 2);
        assert_eq!(
            *fx.jitter.uppers.lock(),
            vec![Duration::from_millis(1_000), Duration::from_millis(5_000)]
        );
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn rejoins_after_network_drop_with_bounded_jitter() {
        let mut fx = fixture(Some(10));
        let identity = ChannelIdentity::new("abc", "123");
        fx.supervisor
            .join(&identity, &JoinOptions::controller())
            .await
            .unwrap();

        fx.hub.drop_participant(&fx.transport.local_address().unwrap());
        fx.hub.fail_next_connects(2);
        let reason = next_disconnect(&mut fx.channel_events).await;
        assert!(fx.supervisor.handle_disconnect(&reason));

        let mut reconnecting = 0;
        loop {
            match fx.events.recv().await.unwrap() {
                ReconnectEvent::Reconnecting => reconnecting += 1,
                ReconnectEvent::Reconnected { profile } => {
                    assert_eq!(profile.address.as_str(), "abc/tv");
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(reconnecting, 1);
        assert_eq!(
            *fx.jitter.uppers.lock(),
            vec![
                Duration::from_millis(1_000),
                Duration::from_millis(5_000),
                Duration::from_millis(5_000)
            ]
        );
        assert!(fx.transport.is_joined());
        assert!(!fx.supervisor.is_reconnecting());
        assert_eq!(fx.supervisor.attempt_count(), 0);
    }

    #[test_timeout::tokio_timeout_test(120, paused)]
    async fn gives_up_after_max_attempts() {
        let mut fx = fixture(Some(3));
        fx.supervisor
            .join(&ChannelIdentity::new("abc", "123"), &JoinOptions::controller())
            .await
            .unwrap();
        fx.hub.drop_participant(&fx.transport.local_address().unwrap());
        fx.hub.fail_next_connects(100);
        let reason = next_disconnect(&mut fx.channel_events).await;
        fx.supervisor.handle_disconnect(&reason);

        let mut reconnecting = 0;
        loop {
            match fx.events.recv().await.unwrap() {
                ReconnectEvent::Reconnecting => reconnecting += 1,
                ReconnectEvent::Unrecoverable { .. } => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(reconnecting, 1);
        assert_eq!(fx.supervisor.attempt_count(), 3);
        assert!(!fx.supervisor.is_reconnecting());
        assert_eq!(fx.hub.connect_count(), 1 + 3);
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn unauthorized_disconnect_is_terminal() {
        let mut fx = fixture(Some(10));
        fx.supervisor
            .join(&ChannelIdentity::new("abc", "123"), &JoinOptions::controller())
            .await
            .unwrap();
        let started = fx.supervisor.handle_disconnect(&DisconnectReason::new(
            DisconnectKind::Unauthorized,
            "kicked",
        ));
        assert!(!started);
        assert!(matches!(
            fx.events.recv().await,
            Some(ReconnectEvent::Unrecoverable { .. })
        ));
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn cancel_during_backoff_stops_without_joining() {
        let mut fx = fixture(Some(10));
        fx.supervisor
            .join(&ChannelIdentity::new("abc", "123"), &JoinOptions::controller())
            .await
            .unwrap();
        fx.hub.drop_participant(&fx.transport.local_address().unwrap());
        let reason = next_disconnect(&mut fx.channel_events).await;
        let connects_before = fx.hub.connect_count();
        assert!(fx.supervisor.handle_disconnect(&reason));
        // A second disconnect while the loop runs is ignored.
        assert!(!fx.supervisor.handle_disconnect(&reason));

        fx.supervisor.cancel().await;
        fx.supervisor.cancel().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(fx.hub.connect_count(), connects_before);
        assert!(!fx.transport.is_joined());
        assert!(!fx.supervisor.is_reconnecting());
        assert!(fx.events.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test(60, paused)]
    async fn cancel_when_idle_is_a_noop() {
        let mut fx = fixture(Some(10));
        fx.supervisor
            .join(&ChannelIdentity::new("abc", "123"), &JoinOptions::controller())
            .await
            .unwrap();
        fx.supervisor.cancel().await;
        assert!(fx.transport.is_joined());

        fx.hub.drop_participant(&fx.transport.local_address().unwrap());
        let reason = next_disconnect(&mut fx.channel_events).await;
        assert!(fx.supervisor.handle_disconnect(&reason));
        assert_eq!(fx.events.recv().await, Some(ReconnectEvent::Reconnecting));
        assert!(matches!(
            fx.events.recv().await,
            Some(ReconnectEvent::Reconnected { .. })
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_join_keeps_previous_rejoin_target() {
        let fx = fixture(Some(10));
        let identity = ChannelIdentity::new("abc", "123");
        fx.supervisor
            .join(&identity, &JoinOptions::controller())
            .await
            .unwrap();
        let second = fx
            .supervisor
            .join(&ChannelIdentity::new("xyz", "789"), &JoinOptions::controller())
            .await;
        assert_eq!(second, Err(ChannelError::AlreadyJoined));
        assert_eq!(fx.supervisor.target_identity(), Some(identity));
    }
}
