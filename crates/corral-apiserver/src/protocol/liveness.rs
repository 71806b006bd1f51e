//! Connection liveness.
//!
//! Two independent background timers run per connection:
//!
//! - the **client ping timeout**: if the time since the last call of any
//!   kind exceeds the client ping interval, the connection is closed. A
//!   client that calls exactly once per interval stays connected;
//! - the **store pinger**: the cluster-state store is pinged every store
//!   ping interval, and the connection is closed if the ping fails.
//!
//! Both close the connection by cancelling its [`CancellationToken`], which
//! the connection handler treats exactly like a transport close.
//!
//! # Invariants
//!
//! - [INV-LV-001] After [`LivenessMonitor::stop`] returns, neither timer task
//!   is running, so no timeout can fire after a manual close.
//! - [INV-LV-002] Activity recorded between timer iterations is never lost.
//! - [INV-LV-003] The client timeout fires only when the idle time is
//!   strictly greater than the interval.

use std::sync::Arc;
use std::time::Duration;

use corral_core::state::EntityStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why the monitor closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessFailure {
    /// The client sent nothing for a full ping interval.
    ClientTimeout,
    /// The cluster-state store stopped answering pings.
    StoreUnreachable,
}

/// Tokio timers have millisecond resolution; the client deadline is armed
/// one tick past the interval so an on-schedule call is seen first.
const TIMER_TICK: Duration = Duration::from_millis(1);

/// Per-connection liveness timers.
#[derive(Debug)]
pub struct LivenessMonitor {
    activity: watch::Sender<Instant>,
    cancel: CancellationToken,
    client_task: Option<JoinHandle<()>>,
    store_task: Option<JoinHandle<()>>,
}

impl LivenessMonitor {
    /// Starts both timers for the connection owning `connection`.
    ///
    /// The monitor cancels `connection` on failure. Its own tasks are bound
    /// to a child token, so cancelling `connection` also stops the monitor.
    #[must_use]
    pub fn start(
        connection: &CancellationToken,
        client_interval: Duration,
        store: Arc<dyn EntityStore>,
        store_interval: Duration,
    ) -> Self {
        let (activity, last_activity) = watch::channel(Instant::now());
        let cancel = connection.child_token();

        let client_task = tokio::spawn(client_ping_timeout(
            last_activity,
            client_interval,
            connection.clone(),
            cancel.clone(),
        ));
        let store_task = tokio::spawn(store_pinger(
            store,
            store_interval,
            connection.clone(),
            cancel.clone(),
        ));

        Self {
            activity,
            cancel,
            client_task: Some(client_task),
            store_task: Some(store_task),
        }
    }

    /// Records client activity, resetting the client ping timeout.
    pub fn touch(&self) {
        self.activity.send_replace(Instant::now());
    }

    /// When the client was last heard from.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self.activity.borrow()
    }

    /// Stops both timers and waits for them to exit.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for task in [self.client_task.take(), self.store_task.take()]
            .into_iter()
            .flatten()
        {
            // The tasks only return after observing cancellation; a join
            // error means the task panicked, which has already been logged.
            let _ = task.await;
        }
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in [self.client_task.take(), self.store_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

async fn client_ping_timeout(
    mut activity: watch::Receiver<Instant>,
    interval: Duration,
    connection: CancellationToken,
    cancel: CancellationToken,
) {
    loop {
        let deadline = *activity.borrow_and_update() + interval + TIMER_TICK;
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            changed = activity.changed() => {
                if changed.is_err() {
                    return;
                }
            },
            () = tokio::time::sleep_until(deadline) => {
                if cancel.is_cancelled() {
                    return;
                }
                let idle = Instant::now().saturating_duration_since(*activity.borrow());
                if idle <= interval {
                    continue;
                }
                warn!(
                    interval_secs = interval.as_secs(),
                    idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
                    failure = ?LivenessFailure::ClientTimeout,
                    "client ping timeout, closing connection"
                );
                connection.cancel();
                return;
            },
        }
    }
}

async fn store_pinger(
    store: Arc<dyn EntityStore>,
    interval: Duration,
    connection: CancellationToken,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {},
        }
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            result = store.ping() => result,
        };
        match result {
            Ok(()) => debug!("store ping ok"),
            Err(e) => {
                warn!(
                    error = %e,
                    failure = ?LivenessFailure::StoreUnreachable,
                    "store ping failed, closing connection"
                );
                connection.cancel();
                return;
            },
        }
    }
}
