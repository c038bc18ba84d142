//! Liveness monitor: heartbeat probing of the worker
//!
//! State machine: `Unknown -> Alive -> Dead`. Every interval the monitor checks
//! whether a heartbeat arrived since the previous check; consecutive misses are
//! counted and reaching the miss limit moves the worker to `Dead`. `Dead` is
//! terminal for a worker instance: recovery means recreating the worker and
//! its RPC client.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Default probe interval (10s per heartbeat)
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Shortest probe interval; a zero interval would stall the probe timer
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Consecutive misses after which the worker is declared dead (1 min at 10s)
pub const DEFAULT_MISS_LIMIT: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessStatus {
    Unknown,
    Alive,
    Dead,
}

/// Observable liveness state, mutated only by the monitor
#[derive(Debug, Clone, Serialize)]
pub struct LivenessState {
    pub status: LivenessStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub missed_count: u32,
    #[serde(skip)]
    heard_since_check: bool,
}

pub struct LivenessMonitor {
    state: Mutex<LivenessState>,
    interval: Duration,
    miss_limit: u32,
}

impl LivenessMonitor {
    pub fn new(interval: Duration, miss_limit: u32) -> Self {
        Self {
            state: Mutex::new(LivenessState {
                status: LivenessStatus::Unknown,
                last_heartbeat_at: None,
                missed_count: 0,
                heard_since_check: false,
            }),
            interval: interval.max(MIN_HEARTBEAT_INTERVAL),
            miss_limit: miss_limit.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LivenessState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn status(&self) -> LivenessStatus {
        self.lock().status
    }

    /// False once the worker has been declared dead, forever
    pub fn is_alive(&self) -> bool {
        self.status() != LivenessStatus::Dead
    }

    pub fn snapshot(&self) -> LivenessState {
        self.lock().clone()
    }

    /// A heartbeat reply arrived from the worker
    pub fn record_heartbeat(&self) {
        let mut state = self.lock();
        if state.status == LivenessStatus::Dead {
            debug!("Heartbeat received after worker was declared dead, ignoring");
            return;
        }
        if state.status == LivenessStatus::Unknown {
            info!("Worker is alive");
        }
        state.status = LivenessStatus::Alive;
        state.missed_count = 0;
        state.heard_since_check = true;
        state.last_heartbeat_at = Some(Utc::now());
    }

    /// Evaluate one elapsed interval and return the resulting status
    pub fn check(&self) -> LivenessStatus {
        let mut state = self.lock();
        if state.status == LivenessStatus::Dead {
            return LivenessStatus::Dead;
        }
        if state.heard_since_check {
            state.heard_since_check = false;
            return state.status;
        }
        state.missed_count += 1;
        debug!(missed = state.missed_count, "Heartbeat missed");
        if state.missed_count >= self.miss_limit {
            error!(
                missed = state.missed_count,
                "Worker missed {} consecutive heartbeats, declaring it dead", self.miss_limit
            );
            state.status = LivenessStatus::Dead;
        }
        state.status
    }

    /// Force the terminal state (e.g. the transport closed underneath us)
    pub fn mark_dead(&self) {
        let mut state = self.lock();
        if state.status != LivenessStatus::Dead {
            error!("Worker declared dead");
            state.status = LivenessStatus::Dead;
        }
    }

    /// Spawn the periodic probe loop.
    ///
    /// `send_probe` posts one heartbeat to the worker; a failure to post marks
    /// the worker dead. The loop exits when the worker is dead or `cancel`
    /// fires.
    pub fn spawn<F>(self: &Arc<Self>, send_probe: F, cancel: CancellationToken) -> JoinHandle<()>
    where
        F: Fn() -> crate::error::Result<()> + Send + 'static,
    {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            if send_probe().is_err() {
                monitor.mark_dead();
                return;
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Liveness probe cancelled");
                        break;
                    }
                    _ = ticker.tick() => {}
                }
                if monitor.check() == LivenessStatus::Dead {
                    break;
                }
                if send_probe().is_err() {
                    monitor.mark_dead();
                    break;
                }
            }
        })
    }
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MISS_LIMIT)
    }
}
