//! Inactivity sign-out.
//!
//! A [`SessionTimeoutGuard`] owns one timer task per signed-in session. The
//! task keeps two single-shot deadlines relative to the last activity: a
//! warning at `window - warning_lead` and a forced sign-out at `window`.
//! Activity moves both. Dropping or disposing the guard cancels the task, so
//! nothing outlives the session. Once the sign-out deadline has fired the
//! task is no longer cancellable and always runs the sign-out to completion.
//!
//! [`SessionRegistry`] is the explicit context object that owns the guards
//! (and the per-session CSRF token) for every live access token.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::security::csrf::{CsrfGuard, MemorySessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeoutConfig {
    pub window: Duration,
    pub warning_lead: Duration,
}

impl SessionTimeoutConfig {
    pub fn from_minutes(timeout: u64, warning: u64) -> Self {
        Self {
            window: Duration::from_secs(timeout * 60),
            warning_lead: Duration::from_secs(warning * 60),
        }
    }

    fn warn_after(&self) -> Duration {
        self.window.saturating_sub(self.warning_lead)
    }
}

/// User interactions that count as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySignal {
    PointerDown,
    PointerMove,
    KeyPress,
    Scroll,
    TouchStart,
    Click,
}

impl ActivitySignal {
    pub const ALL: [ActivitySignal; 6] = [
        ActivitySignal::PointerDown,
        ActivitySignal::PointerMove,
        ActivitySignal::KeyPress,
        ActivitySignal::Scroll,
        ActivitySignal::TouchStart,
        ActivitySignal::Click,
    ];

    /// Map a DOM event name onto a signal.
    pub fn from_dom_event(name: &str) -> Option<Self> {
        match name {
            "mousedown" | "pointerdown" => Some(Self::PointerDown),
            "mousemove" | "pointermove" => Some(Self::PointerMove),
            "keypress" | "keydown" => Some(Self::KeyPress),
            "scroll" => Some(Self::Scroll),
            "touchstart" => Some(Self::TouchStart),
            "click" => Some(Self::Click),
            _ => None,
        }
    }
}

/// Side effects fired by the timer task.
#[async_trait]
pub trait SessionEvents: Send + Sync + 'static {
    /// The session will be signed out in `remaining` unless activity occurs.
    async fn warn(&self, remaining: Duration);
    /// Inactivity window elapsed.
    async fn sign_out(&self);
}

#[derive(Debug)]
struct TimerState {
    last_activity: Instant,
    warned: bool,
    expired: bool,
    cancelled: bool,
}

/// Snapshot of a guard's timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimerStatus {
    pub idle_secs: u64,
    pub remaining_secs: u64,
    pub warned: bool,
    pub expired: bool,
}

pub struct SessionTimeoutGuard {
    config: SessionTimeoutConfig,
    activity: mpsc::UnboundedSender<Instant>,
    state: Arc<Mutex<TimerState>>,
    task: JoinHandle<()>,
}

impl SessionTimeoutGuard {
    /// Start the timers. Must be called inside a tokio runtime.
    pub fn start(config: SessionTimeoutConfig, events: Arc<dyn SessionEvents>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(TimerState {
            last_activity: Instant::now(),
            warned: false,
            expired: false,
            cancelled: false,
        }));
        let task = tokio::spawn(run_timers(config, events, rx, state.clone()));
        Self {
            config,
            activity: tx,
            state,
            task,
        }
    }

    /// Reset both deadlines. Returns false once the session has expired.
    pub fn record_activity(&self, signal: ActivitySignal) -> bool {
        debug!(?signal, "session activity");
        self.activity.send(Instant::now()).is_ok() && !self.is_expired()
    }

    pub fn is_expired(&self) -> bool {
        lock(&self.state).expired
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn status(&self) -> TimerStatus {
        let state = lock(&self.state);
        let idle = state.last_activity.elapsed();
        TimerStatus {
            idle_secs: idle.as_secs(),
            remaining_secs: self.config.window.saturating_sub(idle).as_secs(),
            warned: state.warned,
            expired: state.expired,
        }
    }

    /// Cancel both timers without signing out. A guard that has already
    /// expired is detached instead, so its sign-out still completes.
    pub fn dispose(self) {
        drop(self);
    }

    fn cancel(&self) {
        let mut state = lock(&self.state);
        if state.expired {
            return;
        }
        state.cancelled = true;
        self.task.abort();
    }
}

impl Drop for SessionTimeoutGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_timers(
    config: SessionTimeoutConfig,
    events: Arc<dyn SessionEvents>,
    mut activity: mpsc::UnboundedReceiver<Instant>,
    state: Arc<Mutex<TimerState>>,
) {
    loop {
        let (last, warned) = {
            let s = lock(&state);
            (s.last_activity, s.warned)
        };
        let warn_at = last + config.warn_after();
        let expire_at = last + config.window;

        tokio::select! {
            biased;
            seen = activity.recv() => match seen {
                Some(at) => {
                    let mut s = lock(&state);
                    if at > s.last_activity {
                        s.last_activity = at;
                    }
                    s.warned = false;
                }
                None => return,
            },
            _ = sleep_until(expire_at) => {
                {
                    let mut s = lock(&state);
                    if s.cancelled {
                        return;
                    }
                    s.expired = true;
                }
                info!("session expired after inactivity");
                events.sign_out().await;
                return;
            }
            _ = sleep_until(warn_at), if !warned => {
                lock(&state).warned = true;
                events.warn(config.warning_lead).await;
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct SessionEntry {
    guard: SessionTimeoutGuard,
    csrf: CsrfGuard<MemorySessionStore>,
}

/// Status reported to the client for a live session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub remaining_secs: u64,
    pub warning: bool,
    pub expired: bool,
}

/// Live sessions keyed by access-token id.
pub struct SessionRegistry {
    config: SessionTimeoutConfig,
    sessions: Mutex<HashMap<i64, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new(config: SessionTimeoutConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> SessionTimeoutConfig {
        self.config
    }

    /// Start tracking `token_id`. A live session is left untouched, so
    /// repeated calls never stack timers. Returns true when a guard was
    /// started.
    pub fn begin(&self, token_id: i64, events: Arc<dyn SessionEvents>) -> bool {
        let mut sessions = lock(&self.sessions);
        if let Some(entry) = sessions.get(&token_id) {
            if entry.guard.is_active() {
                return false;
            }
        }
        sessions.insert(
            token_id,
            SessionEntry {
                guard: SessionTimeoutGuard::start(self.config, events),
                csrf: CsrfGuard::new(MemorySessionStore::default()),
            },
        );
        true
    }

    /// Record activity. False when the session is unknown or expired.
    pub fn touch(&self, token_id: i64, signal: ActivitySignal) -> bool {
        lock(&self.sessions)
            .get(&token_id)
            .map(|entry| entry.guard.record_activity(signal))
            .unwrap_or(false)
    }

    pub fn status(&self, token_id: i64) -> Option<SessionStatus> {
        lock(&self.sessions).get(&token_id).map(|entry| {
            let status = entry.guard.status();
            SessionStatus {
                remaining_secs: status.remaining_secs,
                warning: status.warned,
                expired: status.expired,
            }
        })
    }

    /// CSRF token for the session, generated on first request.
    pub fn csrf_token(&self, token_id: i64) -> Option<String> {
        lock(&self.sessions)
            .get(&token_id)
            .map(|entry| entry.csrf.ensure_token())
    }

    pub fn validate_csrf(&self, token_id: i64, candidate: &str) -> bool {
        lock(&self.sessions)
            .get(&token_id)
            .map(|entry| entry.csrf.validate(candidate))
            .unwrap_or(false)
    }

    /// Stop tracking the session and cancel its timers. An expired session's
    /// sign-out keeps running in the background.
    pub fn end(&self, token_id: i64) -> bool {
        let removed = lock(&self.sessions).remove(&token_id);
        match removed {
            Some(entry) => {
                entry.csrf.clear();
                entry.guard.dispose();
                true
            }
            None => false,
        }
    }

    /// Drop entries whose timer task has finished.
    pub fn prune_expired(&self) -> usize {
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|_, entry| entry.guard.is_active());
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
