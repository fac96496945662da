//! Background loops: keep-alive, stale sweep, presence ping.
//!
//! Each loop is an independent task with its own cancellation token, started
//! once by [`start`] and stopped through the returned [`SchedulerHandle`].

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use boardsync_core::UserId;

use crate::notify::Notifier;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub heartbeat_interval: Duration,
    pub sweep_interval: Duration,
    pub stale_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_spacing: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(300),
            stale_timeout: Duration::from_secs(300),
            ping_interval: Duration::from_secs(20),
            ping_spacing: Duration::from_secs(20),
        }
    }
}

/// Stop handle for one loop.
pub struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LoopHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "scheduler loop panicked");
        }
    }
}

pub struct SchedulerHandle {
    pub heartbeat: LoopHandle,
    pub sweep: LoopHandle,
    pub presence_ping: LoopHandle,
}

impl SchedulerHandle {
    /// Stop all three loops and wait for them to exit.
    pub async fn shutdown(self) {
        self.heartbeat.stop();
        self.sweep.stop();
        self.presence_ping.stop();
        self.heartbeat.join().await;
        self.sweep.join().await;
        self.presence_ping.join().await;
        info!("scheduler stopped");
    }
}

pub fn start(notifier: Notifier, config: SchedulerConfig, parent: &CancellationToken) -> SchedulerHandle {
    let heartbeat = {
        let notifier = notifier.clone();
        spawn_loop("heartbeat", config.heartbeat_interval, parent, move || {
            let notifier = notifier.clone();
            async move {
                heartbeat_tick(&notifier).await;
            }
        })
    };

    let sweep = {
        let notifier = notifier.clone();
        let timeout = config.stale_timeout;
        spawn_loop("stale_sweep", config.sweep_interval, parent, move || {
            let notifier = notifier.clone();
            async move {
                sweep_tick(&notifier, timeout).await;
            }
        })
    };

    let presence_ping = {
        let spacing = config.ping_spacing;
        spawn_loop("presence_ping", config.ping_interval, parent, move || {
            let notifier = notifier.clone();
            async move {
                ping_tick(&notifier, spacing).await;
            }
        })
    };

    info!(
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        sweep_secs = config.sweep_interval.as_secs(),
        ping_secs = config.ping_interval.as_secs(),
        "scheduler started"
    );

    SchedulerHandle {
        heartbeat,
        sweep,
        presence_ping,
    }
}

fn spawn_loop<F, Fut>(name: &'static str, every: Duration, parent: &CancellationToken, mut tick: F) -> LoopHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let cancel = parent.child_token();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await; // first tick completes immediately
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => tick().await,
            }
        }
        debug!(loop_name = name, "scheduler loop exited");
    });
    LoopHandle { cancel, task }
}

/// Write a keep-alive comment to every connection and announce the ones
/// found dead.
pub async fn heartbeat_tick(notifier: &Notifier) -> usize {
    let delivery = notifier.registry().heartbeat();
    debug!(sent = delivery.sent, dead = delivery.removed.len(), "heartbeat");
    notifier.connections_closed(delivery.removed).await;
    delivery.sent
}

/// Remove connections idle past `timeout` and announce departures.
pub async fn sweep_tick(notifier: &Notifier, timeout: Duration) -> usize {
    let removed = notifier.registry().sweep_stale(timeout);
    let count = removed.len();
    if count > 0 {
        info!(removed = count, "swept stale connections");
    }
    notifier.connections_closed(removed).await;
    count
}

/// Ping users the presence store reports as nearing timeout, board by board.
/// One board's store failure does not affect the others.
pub async fn ping_tick(notifier: &Notifier, spacing: Duration) -> usize {
    notifier.registry().forget_stale_pings();
    let mut sent = 0;
    for board_id in notifier.registry().active_boards() {
        let nearing: HashSet<UserId> = match notifier.presence().users_nearing_timeout(&board_id).await {
            Ok(users) => users.into_iter().collect(),
            Err(e) => {
                warn!(board_id = %board_id, error = %e, "presence lookup failed");
                continue;
            }
        };
        let delivery = notifier.registry().ping_users(&board_id, &nearing, spacing);
        sent += delivery.sent;
        notifier.connections_closed(delivery.removed).await;
    }
    sent
}
