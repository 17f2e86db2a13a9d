//! Bounded pool of reusable shell sessions, keyed by environment signature.
//!
//! Sessions are interchangeable when they were spawned with the same shell,
//! working directory and environment, so the pool keys on a fingerprint of
//! those inputs rather than on caller identity. Unhealthy sessions are torn
//! down and replaced transparently; callers never receive one.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use sha2::Digest;
use sha2::Sha256;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::ExecError;
use crate::events::EngineEventBus;
use crate::pattern::PatternCache;
use crate::session::SessionId;
use crate::session::SessionOptions;
use crate::session::SessionSummary;
use crate::session::ShellKind;
use crate::session::ShellSession;

/// Fingerprint of the inputs that make two sessions interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvironmentSignature {
    shell: ShellKind,
    working_dir: Option<PathBuf>,
    digest: String,
}

impl EnvironmentSignature {
    pub fn of(options: &SessionOptions) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(options.shell.program().as_bytes());
        hasher.update([0]);
        if let Some(dir) = &options.working_dir {
            hasher.update(dir.as_os_str().as_encoded_bytes());
        }
        hasher.update([0]);
        // BTreeMap iteration is already sorted, so the digest is stable.
        for (key, value) in &options.env_overrides {
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.as_bytes());
            hasher.update([0]);
        }
        for dir in &options.path_dirs {
            hasher.update(dir.as_os_str().as_encoded_bytes());
            hasher.update([0]);
        }
        Self {
            shell: options.shell.kind(),
            working_dir: options.working_dir.clone(),
            digest: format!("{:x}", hasher.finalize()),
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// What to do when every session is busy and the pool is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for a release before admitting the new session.
    Wait,
    /// Exceed the bound, loudly.
    GrowWithWarning,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_sessions: usize,
    pub overflow: OverflowPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 8,
            overflow: OverflowPolicy::Wait,
        }
    }
}

struct IdleEntry {
    key: EnvironmentSignature,
    session: ShellSession,
    last_used: Instant,
}

struct PoolState {
    idle: Vec<IdleEntry>,
    /// Every session the pool has spawned and not yet torn down, busy ones
    /// included; `clear` terminates them all.
    all: Vec<ShellSession>,
    live: usize,
    closed: bool,
}

enum Admit {
    Reuse(ShellSession),
    /// Unhealthy idle session: tear down and retry.
    Discard(ShellSession),
    /// LRU idle eviction; the freed slot goes to the new session.
    Evict(ShellSession),
    Spawn,
}

pub struct ShellSessionPool {
    config: PoolConfig,
    events: EngineEventBus,
    patterns: Arc<PatternCache>,
    state: Mutex<PoolState>,
    released: Notify,
    next_session_id: AtomicU32,
}

impl ShellSessionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            events: EngineEventBus::new(),
            patterns: Arc::new(PatternCache::new()),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                all: Vec::new(),
                live: 0,
                closed: false,
            }),
            released: Notify::new(),
            next_session_id: AtomicU32::new(1),
        }
    }

    pub fn events(&self) -> &EngineEventBus {
        &self.events
    }

    /// Returns a healthy ready session for the given environment, reusing an
    /// idle one when possible and spawning otherwise. At capacity the
    /// least-recently-used idle session is evicted; with no idle session the
    /// configured [`OverflowPolicy`] applies.
    pub async fn acquire(
        &self,
        key: &EnvironmentSignature,
        options: &SessionOptions,
    ) -> Result<ShellSession, ExecError> {
        loop {
            // Registered under the lock below, so a release between deciding
            // to wait and awaiting cannot be missed.
            let mut wait = std::pin::pin!(self.released.notified());
            let admit = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(ExecError::PoolClosed);
                }
                if let Some(pos) = state.idle.iter().position(|entry| &entry.key == key) {
                    let entry = state.idle.remove(pos);
                    if entry.session.is_healthy() {
                        Some(Admit::Reuse(entry.session))
                    } else {
                        state.live = state.live.saturating_sub(1);
                        retain_except(&mut state.all, entry.session.id());
                        Some(Admit::Discard(entry.session))
                    }
                } else if state.live < self.config.max_sessions {
                    state.live += 1;
                    Some(Admit::Spawn)
                } else if let Some(pos) = lru_idle(&state.idle) {
                    let evicted = state.idle.remove(pos);
                    retain_except(&mut state.all, evicted.session.id());
                    Some(Admit::Evict(evicted.session))
                } else {
                    match self.config.overflow {
                        OverflowPolicy::Wait => {
                            wait.as_mut().enable();
                            None
                        }
                        OverflowPolicy::GrowWithWarning => {
                            tracing::warn!(
                                max_sessions = self.config.max_sessions,
                                "session pool growing past its bound"
                            );
                            state.live += 1;
                            Some(Admit::Spawn)
                        }
                    }
                }
            };
            match admit {
                Some(Admit::Reuse(session)) => return Ok(session),
                Some(Admit::Discard(session)) => {
                    session.terminate().await;
                    self.released.notify_waiters();
                }
                Some(Admit::Evict(session)) => {
                    session.terminate().await;
                    return self.spawn_session(options).await;
                }
                Some(Admit::Spawn) => return self.spawn_session(options).await,
                None => wait.await,
            }
        }
    }

    /// Returns a session to the pool. Unhealthy sessions are torn down
    /// instead of being re-filed.
    pub async fn release(&self, key: EnvironmentSignature, session: ShellSession) {
        if !session.is_healthy() {
            {
                let mut state = self.state.lock().await;
                state.live = state.live.saturating_sub(1);
                retain_except(&mut state.all, session.id());
            }
            session.terminate().await;
            self.released.notify_waiters();
            return;
        }
        {
            let mut state = self.state.lock().await;
            if state.closed {
                drop(state);
                session.terminate().await;
                return;
            }
            state.idle.push(IdleEntry {
                key,
                session,
                last_used: Instant::now(),
            });
        }
        self.released.notify_waiters();
    }

    /// Tears down every session, busy ones included, and closes the pool.
    pub async fn clear(&self) {
        let sessions: Vec<ShellSession> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.idle.clear();
            state.live = 0;
            std::mem::take(&mut state.all)
        };
        for session in sessions {
            session.terminate().await;
        }
        self.released.notify_waiters();
    }

    pub async fn live_count(&self) -> usize {
        self.state.lock().await.live
    }

    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let state = self.state.lock().await;
        state.all.iter().map(ShellSession::summary).collect()
    }

    async fn spawn_session(&self, options: &SessionOptions) -> Result<ShellSession, ExecError> {
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::SeqCst));
        match ShellSession::spawn(
            id,
            options.clone(),
            self.patterns.clone(),
            self.events.clone(),
        )
        .await
        {
            Ok(session) => {
                let mut state = self.state.lock().await;
                if state.closed {
                    drop(state);
                    session.terminate().await;
                    return Err(ExecError::PoolClosed);
                }
                state.all.push(session.clone());
                Ok(session)
            }
            Err(err) => {
                {
                    let mut state = self.state.lock().await;
                    state.live = state.live.saturating_sub(1);
                }
                self.released.notify_waiters();
                Err(err)
            }
        }
    }
}

impl Default for ShellSessionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

fn retain_except(sessions: &mut Vec<ShellSession>, id: SessionId) {
    sessions.retain(|session| session.id() != id);
}

fn lru_idle(idle: &[IdleEntry]) -> Option<usize> {
    idle.iter()
        .enumerate()
        .min_by_key(|(_, entry)| entry.last_used)
        .map(|(pos, _)| pos)
}
