//! Two-stage resilient timeout for long-running commands.
//!
//! A command starts ACTIVE with a primary deadline. Silence moves it to
//! GRACE; continued silence through the grace window expires it. Output can
//! defer or reverse that march: recognized progress fully re-arms the primary
//! deadline (and recovers from GRACE), neutral activity earns a bounded
//! extension, and a recognized error expires the command immediately. One
//! absolute-maximum deadline is armed at start and pre-empts everything.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::events::EngineEventBus;
use crate::events::EngineEventKind;
use crate::pattern::Classification;
use crate::pattern::CompiledPatterns;
use crate::pattern::PatternCache;
use crate::session::SessionId;

static NEXT_PROFILE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct ProfileInner {
    id: u64,
    base_timeout: Duration,
    activity_extension: Duration,
    grace_timeout: Duration,
    absolute_maximum: Duration,
    progress_patterns: Vec<String>,
    error_patterns: Vec<String>,
}

/// Immutable timing policy for one kind of command. Cheap to clone; identity
/// (not pattern text) keys the compiled-regex cache.
#[derive(Debug, Clone)]
pub struct TimeoutProfile {
    inner: Arc<ProfileInner>,
}

impl TimeoutProfile {
    pub fn builder(base_timeout: Duration) -> TimeoutProfileBuilder {
        TimeoutProfileBuilder {
            base_timeout,
            activity_extension: base_timeout / 4,
            grace_timeout: base_timeout / 2,
            absolute_maximum: base_timeout * 10,
            progress_patterns: Vec::new(),
            error_patterns: Vec::new(),
        }
    }

    /// Short interactive commands: tight deadlines, no patterns.
    pub fn quick() -> Self {
        Self::builder(Duration::from_secs(10))
            .grace_timeout(Duration::from_secs(5))
            .absolute_maximum(Duration::from_secs(60))
            .build()
    }

    /// Package-manager installs: long downloads with recognizable progress.
    pub fn package_install() -> Self {
        Self::builder(Duration::from_secs(120))
            .activity_extension(Duration::from_secs(30))
            .grace_timeout(Duration::from_secs(60))
            .absolute_maximum(Duration::from_secs(1800))
            .progress_pattern(r"(?i)downloading|resolving|fetching|unpacking|installing")
            .error_pattern(r"(?i)\berror\b|\bfailed\b|fatal|unable to")
            .build()
    }

    /// Compiler and build-system invocations.
    pub fn build_job() -> Self {
        Self::builder(Duration::from_secs(300))
            .activity_extension(Duration::from_secs(60))
            .grace_timeout(Duration::from_secs(120))
            .absolute_maximum(Duration::from_secs(3600))
            .progress_pattern(r"Compiling |Building |\[\d+/\d+\]")
            .error_pattern(r"error\[|error: |FAILED")
            .build()
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn base_timeout(&self) -> Duration {
        self.inner.base_timeout
    }

    pub fn activity_extension(&self) -> Duration {
        self.inner.activity_extension
    }

    pub fn grace_timeout(&self) -> Duration {
        self.inner.grace_timeout
    }

    pub fn absolute_maximum(&self) -> Duration {
        self.inner.absolute_maximum
    }

    pub(crate) fn progress_patterns(&self) -> &[String] {
        &self.inner.progress_patterns
    }

    pub(crate) fn error_patterns(&self) -> &[String] {
        &self.inner.error_patterns
    }
}

#[derive(Debug)]
pub struct TimeoutProfileBuilder {
    base_timeout: Duration,
    activity_extension: Duration,
    grace_timeout: Duration,
    absolute_maximum: Duration,
    progress_patterns: Vec<String>,
    error_patterns: Vec<String>,
}

impl TimeoutProfileBuilder {
    pub fn activity_extension(mut self, value: Duration) -> Self {
        self.activity_extension = value;
        self
    }

    pub fn grace_timeout(mut self, value: Duration) -> Self {
        self.grace_timeout = value;
        self
    }

    pub fn absolute_maximum(mut self, value: Duration) -> Self {
        self.absolute_maximum = value;
        self
    }

    pub fn progress_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.progress_patterns.push(pattern.into());
        self
    }

    pub fn error_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.error_patterns.push(pattern.into());
        self
    }

    pub fn build(self) -> TimeoutProfile {
        TimeoutProfile {
            inner: Arc::new(ProfileInner {
                id: NEXT_PROFILE_ID.fetch_add(1, Ordering::Relaxed),
                base_timeout: self.base_timeout,
                activity_extension: self.activity_extension,
                grace_timeout: self.grace_timeout,
                absolute_maximum: self.absolute_maximum,
                progress_patterns: self.progress_patterns,
                error_patterns: self.error_patterns,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStage {
    Active,
    Grace,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    ErrorDetected,
    GraceExpired,
    AbsoluteMaximum,
    Cancelled,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TerminationReason::ErrorDetected => "error_detected",
            TerminationReason::GraceExpired => "grace_expired",
            TerminationReason::AbsoluteMaximum => "absolute_maximum",
            TerminationReason::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

#[derive(Debug)]
struct TimerState {
    stage: TimeoutStage,
    /// Bumped on every mutation; a watchdog wake that raced a transition sees
    /// a stale generation and does nothing.
    generation: u64,
    primary_deadline: Instant,
    grace_deadline: Option<Instant>,
    absolute_deadline: Instant,
}

struct StageChange {
    from: TimeoutStage,
    to: TimeoutStage,
    reason: Option<TerminationReason>,
}

struct TimeoutShared {
    profile: TimeoutProfile,
    patterns: Arc<CompiledPatterns>,
    events: EngineEventBus,
    session: Option<SessionId>,
    command_preview: String,
    state: Mutex<TimerState>,
    rearm: Notify,
    expired_tx: Mutex<Option<oneshot::Sender<TerminationReason>>>,
}

/// One armed timeout machine for one in-flight command. Dropping it aborts
/// the watchdog task.
pub struct ResilientTimeout {
    shared: Arc<TimeoutShared>,
    watchdog: JoinHandle<()>,
}

impl ResilientTimeout {
    /// Arms the machine and returns the channel on which exactly one
    /// [`TerminationReason`] is delivered if the command must be stopped.
    pub fn start(
        profile: TimeoutProfile,
        patterns: &PatternCache,
        events: EngineEventBus,
        session: Option<SessionId>,
        command_preview: String,
    ) -> (Self, oneshot::Receiver<TerminationReason>) {
        let now = Instant::now();
        let (tx, rx) = oneshot::channel();
        let compiled = patterns.compiled_for(&profile);
        let shared = Arc::new(TimeoutShared {
            state: Mutex::new(TimerState {
                stage: TimeoutStage::Active,
                generation: 0,
                primary_deadline: now + profile.base_timeout(),
                grace_deadline: None,
                absolute_deadline: now + profile.absolute_maximum(),
            }),
            profile,
            patterns: compiled,
            events,
            session,
            command_preview,
            rearm: Notify::new(),
            expired_tx: Mutex::new(Some(tx)),
        });
        let watchdog = tokio::spawn(watchdog_loop(shared.clone()));
        (Self { shared, watchdog }, rx)
    }

    pub fn stage(&self) -> TimeoutStage {
        self.shared.lock_state().stage
    }

    /// Feeds one output chunk through pattern classification and applies the
    /// resulting deadline adjustment. Synchronous and lock-bounded, safe to
    /// call from any task.
    pub fn on_output(&self, chunk: &str) {
        let classification = self.shared.patterns.classify(chunk);
        self.shared.apply_output(&classification);
    }

    /// Forces expiry with [`TerminationReason::Cancelled`]. Idempotent; a
    /// no-op once the machine is expired.
    pub fn cancel(&self) {
        let change = {
            let mut state = self.shared.lock_state();
            if state.stage == TimeoutStage::Expired {
                return;
            }
            expire_locked(&mut state, TerminationReason::Cancelled)
        };
        self.shared.rearm.notify_waiters();
        self.shared.publish(change);
    }

    /// Marks normal command completion: disarms without events or a
    /// termination reason.
    pub(crate) fn finish(&self) {
        {
            let mut state = self.shared.lock_state();
            if state.stage == TimeoutStage::Expired {
                return;
            }
            state.stage = TimeoutStage::Expired;
            state.generation += 1;
        }
        self.shared
            .expired_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared.rearm.notify_waiters();
    }
}

impl Drop for ResilientTimeout {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}

impl fmt::Debug for ResilientTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientTimeout")
            .field("stage", &self.stage())
            .field("command", &self.shared.command_preview)
            .finish()
    }
}

async fn watchdog_loop(shared: Arc<TimeoutShared>) {
    loop {
        let (generation, deadline) = {
            let state = shared.lock_state();
            if state.stage == TimeoutStage::Expired {
                return;
            }
            (state.generation, next_deadline(&state))
        };
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => shared.on_deadline(generation),
            () = shared.rearm.notified() => {}
        }
    }
}

fn next_deadline(state: &TimerState) -> Instant {
    let stage_deadline = match state.stage {
        TimeoutStage::Active => state.primary_deadline,
        TimeoutStage::Grace => state.grace_deadline.unwrap_or(state.primary_deadline),
        TimeoutStage::Expired => state.absolute_deadline,
    };
    stage_deadline.min(state.absolute_deadline)
}

fn expire_locked(state: &mut TimerState, reason: TerminationReason) -> StageChange {
    let from = state.stage;
    state.stage = TimeoutStage::Expired;
    state.generation += 1;
    StageChange {
        from,
        to: TimeoutStage::Expired,
        reason: Some(reason),
    }
}

impl TimeoutShared {
    fn lock_state(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_deadline(&self, generation: u64) {
        let change = {
            let mut state = self.lock_state();
            if state.generation != generation || state.stage == TimeoutStage::Expired {
                return;
            }
            let now = Instant::now();
            if now >= state.absolute_deadline {
                Some(expire_locked(&mut state, TerminationReason::AbsoluteMaximum))
            } else if state.stage == TimeoutStage::Grace {
                match state.grace_deadline {
                    Some(deadline) if now >= deadline => {
                        Some(expire_locked(&mut state, TerminationReason::GraceExpired))
                    }
                    _ => None,
                }
            } else if now >= state.primary_deadline {
                state.stage = TimeoutStage::Grace;
                state.grace_deadline = Some(now + self.profile.grace_timeout());
                state.generation += 1;
                Some(StageChange {
                    from: TimeoutStage::Active,
                    to: TimeoutStage::Grace,
                    reason: None,
                })
            } else {
                None
            }
        };
        if let Some(change) = change {
            self.publish(change);
        }
    }

    fn apply_output(&self, classification: &Classification) {
        if let Some(hit) = classification.hit() {
            self.events.emit(
                self.session,
                Some(self.command_preview.clone()),
                EngineEventKind::PatternMatch {
                    class: classification.class(),
                    pattern: hit.pattern.clone(),
                    matched: hit.matched_text.clone(),
                },
            );
        }
        let change = {
            let mut state = self.lock_state();
            if state.stage == TimeoutStage::Expired {
                return;
            }
            let now = Instant::now();
            match classification {
                Classification::Error(_) => {
                    Some(expire_locked(&mut state, TerminationReason::ErrorDetected))
                }
                Classification::Progress(_) => {
                    state.primary_deadline = now + self.profile.base_timeout();
                    let recovered = state.stage == TimeoutStage::Grace;
                    if recovered {
                        state.stage = TimeoutStage::Active;
                        state.grace_deadline = None;
                    }
                    state.generation += 1;
                    recovered.then_some(StageChange {
                        from: TimeoutStage::Grace,
                        to: TimeoutStage::Active,
                        reason: None,
                    })
                }
                Classification::Neutral => match state.stage {
                    TimeoutStage::Active => {
                        // Bounded extension: unrecognized activity earns more
                        // time, but never more than a fresh base window.
                        let extended = state.primary_deadline + self.profile.activity_extension();
                        state.primary_deadline = extended.min(now + self.profile.base_timeout());
                        state.generation += 1;
                        None
                    }
                    TimeoutStage::Grace => {
                        state.stage = TimeoutStage::Active;
                        state.grace_deadline = None;
                        state.primary_deadline = now + self.profile.base_timeout();
                        state.generation += 1;
                        Some(StageChange {
                            from: TimeoutStage::Grace,
                            to: TimeoutStage::Active,
                            reason: None,
                        })
                    }
                    TimeoutStage::Expired => None,
                },
            }
        };
        self.rearm.notify_waiters();
        if let Some(change) = change {
            self.publish(change);
        }
    }

    fn publish(&self, change: StageChange) {
        self.events.emit(
            self.session,
            Some(self.command_preview.clone()),
            EngineEventKind::StateChange {
                from: change.from,
                to: change.to,
                reason: change.reason.map(|r| r.to_string()),
            },
        );
        if let Some(reason) = change.reason {
            let tx = self
                .expired_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(tx) = tx {
                let _ = tx.send(reason);
            }
            self.events.emit(
                self.session,
                Some(self.command_preview.clone()),
                EngineEventKind::Terminate { reason },
            );
        }
    }
}
