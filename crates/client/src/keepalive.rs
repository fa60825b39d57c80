//! Keep-alive bookkeeping and the heartbeat monitor.
//!
//! The server advertises a keep-alive timeout at negotiation time. From it we
//! derive when to warn that the connection looks slow, and how often to
//! check. The monitor is time-based and independent of transport framing: it
//! only ever looks at "when did we last see any inbound activity".

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::connection::ConnectionState;

/// Origin for the monotonic millisecond clock used by activity stamps.
static CLOCK_ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

fn monotonic_ms() -> u64 {
    CLOCK_ORIGIN.elapsed().as_millis() as u64
}

/// Fraction of the keep-alive timeout after which the connection is
/// considered slow.
const WARN_AT: f64 = 2.0 / 3.0;

/// Keep-alive timings plus the last-activity stamp.
///
/// Derived once per start or reconnect attempt and handed to the heartbeat
/// monitor; clones share the activity stamp so a beat recorded through the
/// connection is visible to the monitor task.
#[derive(Debug, Clone)]
pub struct KeepAliveData {
    timeout: Duration,
    warn_after: Duration,
    check_interval: Duration,
    last_activity: Arc<AtomicU64>,
}

impl KeepAliveData {
    pub fn new(timeout: Duration) -> Self {
        let warn_after = timeout.mul_f64(WARN_AT);
        // The check has to be short enough not to miss a whole episode.
        let check_interval = ((timeout - warn_after) / 3).max(Duration::from_millis(1));
        Self {
            timeout,
            warn_after,
            check_interval,
            last_activity: Arc::new(AtomicU64::new(monotonic_ms())),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn warn_after(&self) -> Duration {
        self.warn_after
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Record inbound activity "now".
    pub fn beat(&self) {
        self.last_activity.store(monotonic_ms(), Ordering::Relaxed);
    }

    /// Time since the last recorded activity.
    pub fn elapsed(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(monotonic_ms().saturating_sub(last))
    }
}

struct MonitorState {
    keep_alive: Option<KeepAliveData>,
    on_warning: Option<Arc<dyn Fn() + Send + Sync>>,
    on_timeout: Option<Arc<dyn Fn() + Send + Sync>>,
    stopped: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

/// Periodic checker that turns silence into warning and timeout signals.
///
/// Each signal fires once per silence episode: after a warning (or timeout)
/// the monitor stays quiet until activity resumes, which re-arms both.
/// Replaced, not reused, across reconnects.
pub struct HeartbeatMonitor {
    state: Mutex<MonitorState>,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState {
                keep_alive: None,
                on_warning: None,
                on_timeout: None,
                stopped: Arc::new(AtomicBool::new(true)),
                task: None,
            }),
        }
    }

    /// Set the slow-connection callback. Must be set before `start`.
    pub fn set_on_warning(&self, f: impl Fn() + Send + Sync + 'static) {
        self.state.lock().unwrap().on_warning = Some(Arc::new(f));
    }

    /// Set the timeout callback. Must be set before `start`.
    pub fn set_on_timeout(&self, f: impl Fn() + Send + Sync + 'static) {
        self.state.lock().unwrap().on_timeout = Some(Arc::new(f));
    }

    /// Arm the periodic check. `connection_state` is sampled on every tick;
    /// the monitor only evaluates elapsed time while it reports Connected.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        &self,
        keep_alive: KeepAliveData,
        connection_state: impl Fn() -> ConnectionState + Send + Sync + 'static,
    ) {
        let mut state = self.state.lock().unwrap();
        if state.keep_alive.is_some() {
            Self::stop_locked(&mut state);
        }

        keep_alive.beat();
        let stopped = Arc::new(AtomicBool::new(false));
        state.stopped = stopped.clone();
        state.keep_alive = Some(keep_alive.clone());

        let on_warning = state.on_warning.clone();
        let on_timeout = state.on_timeout.clone();
        let interval = keep_alive.check_interval();

        debug!(
            timeout_ms = keep_alive.timeout().as_millis() as u64,
            warn_ms = keep_alive.warn_after().as_millis() as u64,
            check_ms = interval.as_millis() as u64,
            "starting heartbeat monitor"
        );

        state.task = Some(tokio::spawn(async move {
            let start_at = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start_at, interval);
            let mut warned = false;
            let mut timed_out = false;
            loop {
                ticker.tick().await;
                if stopped.load(Ordering::Relaxed) {
                    break;
                }
                if connection_state() != ConnectionState::Connected {
                    continue;
                }
                let elapsed = keep_alive.elapsed();
                if elapsed >= keep_alive.timeout() {
                    if !timed_out {
                        timed_out = true;
                        debug!(elapsed_ms = elapsed.as_millis() as u64, "keep-alive timeout");
                        if let Some(cb) = &on_timeout {
                            cb();
                        }
                    }
                } else if elapsed >= keep_alive.warn_after() {
                    if !warned {
                        warned = true;
                        trace!(elapsed_ms = elapsed.as_millis() as u64, "connection slow");
                        if let Some(cb) = &on_warning {
                            cb();
                        }
                    }
                } else {
                    warned = false;
                    timed_out = false;
                }
            }
        }));
    }

    /// Disarm the periodic check. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        Self::stop_locked(&mut state);
    }

    fn stop_locked(state: &mut MonitorState) {
        state.stopped.store(true, Ordering::Relaxed);
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    /// Record inbound activity.
    pub fn beat(&self) {
        if let Some(keep_alive) = &self.state.lock().unwrap().keep_alive {
            keep_alive.beat();
        }
    }

    /// The keep-alive data this monitor was last armed with.
    pub fn keep_alive_data(&self) -> Option<KeepAliveData> {
        self.state.lock().unwrap().keep_alive.clone()
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            Self::stop_locked(&mut state);
        }
    }
}
