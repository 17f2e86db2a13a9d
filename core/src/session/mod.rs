//! Persistent shell sessions.
//!
//! A session owns one long-lived shell subprocess and a FIFO command queue
//! served by a single dispatcher task, so commands on one session start and
//! resolve in strict submission order. Completion is detected with a fresh
//! random sentinel per command: the marker plus `$?` printed to stdout and
//! the bare marker printed to stderr sequence-point both streams.

mod platform;

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

pub use platform::PlatformStrategy;
pub use platform::ShellKind;

use crate::command::CommandResult;
use crate::command::OutputChunk;
use crate::command::OutputStream;
use crate::command::TIMEOUT_EXIT_CODE;
use crate::command::preview_command;
use crate::error::ExecError;
use crate::events::EngineEventBus;
use crate::events::EngineEventKind;
use crate::pattern::PatternCache;
use crate::timeout::ResilientTimeout;
use crate::timeout::TerminationReason;
use crate::timeout::TimeoutProfile;

const READ_BUFFER_SIZE: usize = 8192;
const CHUNK_CHANNEL_CAPACITY: usize = 128;
/// How long to keep collecting reader output after a kill before giving up
/// on the channel closing.
const KILL_DRAIN_WINDOW: Duration = Duration::from_millis(200);

const STATE_UNINITIALIZED: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_BUSY: u8 = 2;
const STATE_TERMINATED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Ready,
    Busy,
    Terminated,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_READY => SessionState::Ready,
            STATE_BUSY => SessionState::Busy,
            STATE_TERMINATED => SessionState::Terminated,
            _ => SessionState::Uninitialized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Environment a session is spawned with. Two sessions with equal options
/// are interchangeable from the pool's point of view.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub shell: PlatformStrategy,
    pub working_dir: Option<PathBuf>,
    pub env_overrides: BTreeMap<String, String>,
    /// When non-empty, replaces PATH with exactly these directories.
    pub path_dirs: Vec<PathBuf>,
    /// How long to wait after a graceful interrupt before killing.
    pub kill_escalation: Duration,
    /// Trailing output retained per session for diagnostics.
    pub output_retention_bytes: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            shell: PlatformStrategy::native(),
            working_dir: None,
            env_overrides: BTreeMap::new(),
            path_dirs: Vec::new(),
            kill_escalation: Duration::from_secs(2),
            output_retention_bytes: 16 * 1024,
        }
    }
}

/// Observability snapshot of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub state: SessionState,
    pub poisoned: bool,
    pub last_command: Option<String>,
    pub uptime: Duration,
    pub bytes_seen: u64,
    pub tail: String,
}

struct QueuedCommand {
    id: String,
    text: String,
    profile: TimeoutProfile,
    stream: Option<mpsc::Sender<OutputChunk>>,
    done: oneshot::Sender<Result<CommandResult, ExecError>>,
}

struct ActiveCancel {
    command_id: String,
    timeout: Arc<ResilientTimeout>,
}

struct SessionInner {
    id: SessionId,
    options: SessionOptions,
    events: EngineEventBus,
    patterns: Arc<PatternCache>,
    state: AtomicU8,
    poisoned: AtomicBool,
    queue: Mutex<VecDeque<QueuedCommand>>,
    queue_notify: Notify,
    shutdown: Notify,
    active: Mutex<Option<ActiveCancel>>,
    next_command: AtomicU64,
    started_at: Instant,
    bytes_seen: AtomicU64,
    last_preview: Mutex<Option<String>>,
    tail: Mutex<OutputTail>,
}

/// Handle to one persistent shell session. Cloning shares the session.
#[derive(Clone)]
pub struct ShellSession {
    inner: Arc<SessionInner>,
}

/// A submitted command: its id (for cancellation) and the future result.
pub struct CommandTicket {
    id: String,
    done: oneshot::Receiver<Result<CommandResult, ExecError>>,
}

impl CommandTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> Result<CommandResult, ExecError> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(ExecError::SessionClosed),
        }
    }
}

impl ShellSession {
    /// Spawns the shell subprocess and starts the dispatcher. Spawn failures
    /// surface immediately.
    pub async fn spawn(
        id: SessionId,
        options: SessionOptions,
        patterns: Arc<PatternCache>,
        events: EngineEventBus,
    ) -> Result<Self, ExecError> {
        let shell = spawn_shell(&options)?;
        let retention = options.output_retention_bytes;
        let inner = Arc::new(SessionInner {
            id,
            options,
            events,
            patterns,
            state: AtomicU8::new(STATE_UNINITIALIZED),
            poisoned: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            shutdown: Notify::new(),
            active: Mutex::new(None),
            next_command: AtomicU64::new(1),
            started_at: Instant::now(),
            bytes_seen: AtomicU64::new(0),
            last_preview: Mutex::new(None),
            tail: Mutex::new(OutputTail::new(retention)),
        });
        inner.state.store(STATE_READY, Ordering::SeqCst);
        inner
            .events
            .emit(Some(id), None, EngineEventKind::SessionSpawned);
        tokio::spawn(dispatcher(inner.clone(), shell));
        Ok(Self { inner })
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_healthy(&self) -> bool {
        !self.inner.poisoned.load(Ordering::SeqCst)
            && self.state() != SessionState::Terminated
    }

    /// Runs one command to completion. Timeout terminations resolve `Ok` with
    /// a synthetic exit code and the reason set.
    pub async fn execute(
        &self,
        text: &str,
        profile: TimeoutProfile,
    ) -> Result<CommandResult, ExecError> {
        self.submit(text, profile, None)?.wait().await
    }

    /// Like [`ShellSession::execute`] but forwards output chunks as they
    /// arrive. A full or closed channel drops chunks rather than stalling the
    /// command.
    pub async fn execute_streamed(
        &self,
        text: &str,
        profile: TimeoutProfile,
        stream: mpsc::Sender<OutputChunk>,
    ) -> Result<CommandResult, ExecError> {
        self.submit(text, profile, Some(stream))?.wait().await
    }

    /// Enqueues a command; the dispatcher serves the queue in FIFO order.
    pub fn submit(
        &self,
        text: &str,
        profile: TimeoutProfile,
        stream: Option<mpsc::Sender<OutputChunk>>,
    ) -> Result<CommandTicket, ExecError> {
        if self.inner.state.load(Ordering::SeqCst) == STATE_TERMINATED
            || self.inner.poisoned.load(Ordering::SeqCst)
        {
            return Err(ExecError::SessionClosed);
        }
        let id = format!(
            "cmd-{}-{}",
            self.inner.id,
            self.inner.next_command.fetch_add(1, Ordering::SeqCst)
        );
        let (done_tx, done_rx) = oneshot::channel();
        self.inner.lock_queue().push_back(QueuedCommand {
            id: id.clone(),
            text: text.to_string(),
            profile,
            stream,
            done: done_tx,
        });
        self.inner.queue_notify.notify_one();
        Ok(CommandTicket { id, done: done_rx })
    }

    /// Cancels one command by id. A queued command is rejected with
    /// [`ExecError::Cancelled`]; an in-flight command is stopped through the
    /// timeout machine and resolves with `termination = Cancelled`. Returns
    /// `false` when no such command is pending.
    pub fn cancel(&self, command_id: &str) -> bool {
        {
            let mut queue = self.inner.lock_queue();
            if let Some(pos) = queue.iter().position(|cmd| cmd.id == command_id) {
                if let Some(cmd) = queue.remove(pos) {
                    let _ = cmd.done.send(Err(ExecError::Cancelled));
                    return true;
                }
            }
        }
        let timeout = {
            let active = self
                .inner
                .active
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            active
                .as_ref()
                .filter(|a| a.command_id == command_id)
                .map(|a| a.timeout.clone())
        };
        match timeout {
            Some(timeout) => {
                timeout.cancel();
                true
            }
            None => false,
        }
    }

    /// Tears the session down: rejects queued commands, stops any in-flight
    /// command and kills the subprocess. Idempotent.
    pub async fn terminate(&self) {
        let prev = self.inner.state.swap(STATE_TERMINATED, Ordering::SeqCst);
        if prev == STATE_TERMINATED {
            return;
        }
        let timeout = {
            let active = self
                .inner
                .active
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            active.as_ref().map(|a| a.timeout.clone())
        };
        if let Some(timeout) = timeout {
            timeout.cancel();
        }
        self.inner.reject_queued(|| ExecError::Cancelled);
        // notify_one stores a permit, so the dispatcher sees the shutdown
        // even if it was not parked in its select yet.
        self.inner.shutdown.notify_one();
        self.inner
            .events
            .emit(Some(self.inner.id), None, EngineEventKind::SessionRetired);
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.inner.id,
            state: self.state(),
            poisoned: self.inner.poisoned.load(Ordering::SeqCst),
            last_command: self
                .inner
                .last_preview
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            uptime: self.inner.started_at.elapsed(),
            bytes_seen: self.inner.bytes_seen.load(Ordering::SeqCst),
            tail: self
                .inner
                .tail
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .snapshot(),
        }
    }
}

impl fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellSession")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionInner {
    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<QueuedCommand>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop_queued(&self) -> Option<QueuedCommand> {
        self.lock_queue().pop_front()
    }

    fn reject_queued(&self, err: fn() -> ExecError) {
        let drained: Vec<QueuedCommand> = self.lock_queue().drain(..).collect();
        for cmd in drained {
            let _ = cmd.done.send(Err(err()));
        }
    }

    fn clear_active(&self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn record_output(&self, chunk: &OutputChunk) {
        self.bytes_seen
            .fetch_add(chunk.data.len() as u64, Ordering::SeqCst);
        self.tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(chunk.data.as_bytes());
    }

    fn poison(&self, reason: &str) {
        tracing::warn!(session = %self.id, "poisoning session: {reason}");
        self.poisoned.store(true, Ordering::SeqCst);
        self.state.store(STATE_TERMINATED, Ordering::SeqCst);
        self.reject_queued(|| ExecError::SessionClosed);
        self.events
            .emit(Some(self.id), None, EngineEventKind::SessionRetired);
    }
}

struct ShellChild {
    child: Child,
    stdin: ChildStdin,
    chunks: mpsc::Receiver<OutputChunk>,
}

fn spawn_shell(options: &SessionOptions) -> Result<ShellChild, ExecError> {
    let mut cmd = options.shell.command();
    if let Some(dir) = &options.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &options.env_overrides {
        cmd.env(key, value);
    }
    if !options.path_dirs.is_empty() {
        let joined = std::env::join_paths(&options.path_dirs).map_err(|err| {
            ExecError::InitFailed {
                reason: format!("invalid PATH entry: {err}"),
            }
        })?;
        cmd.env("PATH", joined);
    }
    let mut child = cmd
        .spawn()
        .map_err(|err| ExecError::SpawnFailed { source: err.into() })?;
    let stdin = child.stdin.take().ok_or_else(|| ExecError::InitFailed {
        reason: "shell stdin not captured".to_string(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| ExecError::InitFailed {
        reason: "shell stdout not captured".to_string(),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| ExecError::InitFailed {
        reason: "shell stderr not captured".to_string(),
    })?;
    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    spawn_reader(stdout, OutputStream::Stdout, chunk_tx.clone());
    spawn_reader(stderr, OutputStream::Stderr, chunk_tx);
    Ok(ShellChild {
        child,
        stdin,
        chunks: chunk_rx,
    })
}

fn spawn_reader<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let data = String::from_utf8_lossy(&buf[..n]).to_string();
                    if tx.send(OutputChunk { stream, data }).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

enum Verdict {
    Completed,
    Killed,
    Died,
    Unkillable,
}

struct RunOutcome {
    result: Result<CommandResult, ExecError>,
    verdict: Verdict,
}

async fn dispatcher(inner: Arc<SessionInner>, mut shell: ShellChild) {
    loop {
        let next = 'idle: loop {
            if inner.state.load(Ordering::SeqCst) == STATE_TERMINATED {
                break 'idle None;
            }
            if let Some(cmd) = inner.pop_queued() {
                break 'idle Some(cmd);
            }
            tokio::select! {
                () = inner.queue_notify.notified() => {}
                () = inner.shutdown.notified() => {}
                chunk = shell.chunks.recv() => match chunk {
                    // Unsolicited output between commands still lands in the
                    // diagnostic tail.
                    Some(chunk) => inner.record_output(&chunk),
                    None => {
                        inner.poison("shell exited while idle");
                        break 'idle None;
                    }
                },
            }
        };
        let Some(cmd) = next else { break };

        if inner
            .state
            .compare_exchange(STATE_READY, STATE_BUSY, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let _ = cmd.done.send(Err(ExecError::SessionClosed));
            continue;
        }
        let QueuedCommand {
            id,
            text,
            profile,
            stream,
            done,
        } = cmd;
        let outcome = run_command(&inner, &mut shell, &id, &text, profile, stream).await;
        let _ = done.send(outcome.result);

        match outcome.verdict {
            Verdict::Completed => {
                let _ = inner.state.compare_exchange(
                    STATE_BUSY,
                    STATE_READY,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
            Verdict::Killed => {
                if inner.state.load(Ordering::SeqCst) == STATE_TERMINATED {
                    break;
                }
                // The shell died with the command; respawn it so the session
                // survives a per-command timeout.
                match spawn_shell(&inner.options) {
                    Ok(fresh) => {
                        shell = fresh;
                        let _ = inner.state.compare_exchange(
                            STATE_BUSY,
                            STATE_READY,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        );
                        tracing::debug!(session = %inner.id, "respawned shell after kill");
                    }
                    Err(err) => {
                        inner.poison(&format!("respawn after kill failed: {err}"));
                        break;
                    }
                }
            }
            Verdict::Died => {
                inner.poison("shell process exited mid-command");
                break;
            }
            Verdict::Unkillable => {
                inner.poison("shell process would not die");
                break;
            }
        }
    }
    inner.reject_queued(|| ExecError::SessionClosed);
    let _ = inner
        .options
        .shell
        .stop(&mut shell.child, inner.options.kill_escalation)
        .await;
}

async fn run_command(
    inner: &Arc<SessionInner>,
    shell: &mut ShellChild,
    command_id: &str,
    text: &str,
    profile: TimeoutProfile,
    stream: Option<mpsc::Sender<OutputChunk>>,
) -> RunOutcome {
    let started = Instant::now();
    let preview = preview_command(text);
    *inner
        .last_preview
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(preview.clone());

    let marker = fresh_marker();
    let block = inner.options.shell.completion_block(text, &marker);

    let (timeout, mut expired_rx) = ResilientTimeout::start(
        profile,
        &inner.patterns,
        inner.events.clone(),
        Some(inner.id),
        preview,
    );
    let timeout = Arc::new(timeout);
    *inner
        .active
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(ActiveCancel {
        command_id: command_id.to_string(),
        timeout: timeout.clone(),
    });

    if shell.stdin.write_all(block.as_bytes()).await.is_err()
        || shell.stdin.flush().await.is_err()
    {
        inner.clear_active();
        timeout.finish();
        return RunOutcome {
            result: Err(ExecError::ProcessDied),
            verdict: Verdict::Died,
        };
    }

    let mut capture = CommandCapture::new(&marker, &block);
    let termination: Option<TerminationReason> = loop {
        tokio::select! {
            chunk = shell.chunks.recv() => {
                let Some(chunk) = chunk else {
                    inner.clear_active();
                    timeout.finish();
                    return RunOutcome {
                        result: Err(ExecError::ProcessDied),
                        verdict: Verdict::Died,
                    };
                };
                inner.record_output(&chunk);
                timeout.on_output(&chunk.data);
                if let Some(tx) = &stream {
                    let _ = tx.try_send(chunk.clone());
                }
                if capture.absorb(&chunk) {
                    break None;
                }
            }
            reason = &mut expired_rx => {
                break Some(reason.unwrap_or(TerminationReason::Cancelled));
            }
        }
    };
    inner.clear_active();

    if let Some(reason) = termination {
        let stop = inner
            .options
            .shell
            .stop(&mut shell.child, inner.options.kill_escalation)
            .await;
        // The readers still hold whatever the shell wrote before it died;
        // fold that into the report instead of dropping it. They close the
        // channel on EOF shortly after the kill, so the deadline only fires
        // when the process refused to die.
        let mut drain_deadline = std::pin::pin!(tokio::time::sleep(KILL_DRAIN_WINDOW));
        loop {
            tokio::select! {
                chunk = shell.chunks.recv() => match chunk {
                    Some(chunk) => {
                        inner.record_output(&chunk);
                        if let Some(tx) = &stream {
                            let _ = tx.try_send(chunk.clone());
                        }
                        capture.absorb(&chunk);
                    }
                    None => break,
                },
                () = &mut drain_deadline => break,
            }
        }
        let (stdout, stderr) = capture.into_output();
        let result = Ok(CommandResult {
            stdout,
            stderr,
            exit_code: TIMEOUT_EXIT_CODE,
            duration: started.elapsed(),
            termination: Some(reason),
        });
        match stop {
            Ok(()) => RunOutcome {
                result,
                verdict: Verdict::Killed,
            },
            Err(err) => {
                tracing::error!(session = %inner.id, "failed to stop shell: {err}");
                RunOutcome {
                    result,
                    verdict: Verdict::Unkillable,
                }
            }
        }
    } else {
        timeout.finish();
        let exit_code = capture.exit_code().unwrap_or(TIMEOUT_EXIT_CODE);
        let (stdout, stderr) = capture.into_output();
        RunOutcome {
            result: Ok(CommandResult {
                stdout,
                stderr,
                exit_code,
                duration: started.elapsed(),
                termination: None,
            }),
            verdict: Verdict::Completed,
        }
    }
}

fn fresh_marker() -> String {
    let nonce: u64 = rand::random();
    format!("__SHELLHERD_DONE_{nonce:016x}__")
}

/// Per-command output assembly: line buffering, echo skipping and sentinel
/// detection for both streams.
struct CommandCapture {
    marker: String,
    stdout: StreamCapture,
    stderr: StreamCapture,
    exit_code: Option<i32>,
}

impl CommandCapture {
    fn new(marker: &str, submitted_block: &str) -> Self {
        Self {
            marker: marker.to_string(),
            stdout: StreamCapture::new(EchoSkip::new(submitted_block)),
            stderr: StreamCapture::new(EchoSkip::disabled()),
            exit_code: None,
        }
    }

    /// Returns true once both stream sentinels have been seen.
    fn absorb(&mut self, chunk: &OutputChunk) -> bool {
        match chunk.stream {
            OutputStream::Stdout => {
                self.stdout
                    .absorb(&chunk.data, &self.marker, true, &mut self.exit_code);
            }
            OutputStream::Stderr => {
                self.stderr
                    .absorb(&chunk.data, &self.marker, false, &mut self.exit_code);
            }
        }
        self.stdout.done && self.stderr.done
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn into_output(mut self) -> (String, String) {
        self.stdout.flush_partial();
        self.stderr.flush_partial();
        (self.stdout.text, self.stderr.text)
    }
}

struct StreamCapture {
    line: String,
    text: String,
    echo: EchoSkip,
    done: bool,
}

impl StreamCapture {
    fn new(echo: EchoSkip) -> Self {
        Self {
            line: String::new(),
            text: String::new(),
            echo,
            done: false,
        }
    }

    fn absorb(&mut self, data: &str, marker: &str, is_stdout: bool, exit_code: &mut Option<i32>) {
        if self.done {
            return;
        }
        self.line.push_str(data);
        while let Some(pos) = self.line.find('\n') {
            let line: String = self.line.drain(..=pos).collect();
            let trimmed = line.trim_end_matches(['\n', '\r']);
            // The sentinel can share a line with unterminated command output;
            // everything before the marker still belongs to the command. An
            // echoed copy of the completion block contains the marker too,
            // but never followed by a bare exit status, so it cannot
            // false-positive here.
            if let Some(idx) = trimmed.find(marker) {
                let prefix = &trimmed[..idx];
                let rest = &trimmed[idx + marker.len()..];
                if is_stdout {
                    if let Ok(code) = rest.trim().parse::<i32>() {
                        self.text.push_str(prefix);
                        *exit_code = Some(code);
                        self.done = true;
                        return;
                    }
                } else if rest.trim().is_empty() {
                    self.text.push_str(prefix);
                    self.done = true;
                    return;
                }
            }
            if self.echo.skip(trimmed) {
                continue;
            }
            self.text.push_str(&line);
        }
    }

    fn flush_partial(&mut self) {
        if !self.done && !self.line.is_empty() {
            self.text.push_str(&self.line);
            self.line.clear();
        }
    }
}

/// Skips an echoed copy of the submitted block, line by line, when the shell
/// echoes its input. Disabled for good on the first non-matching line, so
/// non-echoing shells pay one comparison per command.
struct EchoSkip {
    pending: VecDeque<String>,
    enabled: bool,
}

impl EchoSkip {
    fn new(submitted_block: &str) -> Self {
        Self {
            pending: submitted_block.lines().map(str::to_string).collect(),
            enabled: true,
        }
    }

    fn disabled() -> Self {
        Self {
            pending: VecDeque::new(),
            enabled: false,
        }
    }

    fn skip(&mut self, line: &str) -> bool {
        if !self.enabled {
            return false;
        }
        match self.pending.front() {
            Some(expected) if expected == line => {
                self.pending.pop_front();
                true
            }
            _ => {
                self.enabled = false;
                false
            }
        }
    }
}

/// Bounded ring of the most recent output bytes for diagnostics.
struct OutputTail {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl OutputTail {
    fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            capacity,
        }
    }

    fn push(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        self.buf.extend(data.iter().copied());
        if self.buf.len() > self.capacity {
            let overflow = self.buf.len() - self.capacity;
            self.buf.drain(..overflow);
        }
    }

    fn snapshot(&self) -> String {
        let bytes: Vec<u8> = self.buf.iter().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn stdout_chunk(data: &str) -> OutputChunk {
        OutputChunk {
            stream: OutputStream::Stdout,
            data: data.to_string(),
        }
    }

    fn stderr_chunk(data: &str) -> OutputChunk {
        OutputChunk {
            stream: OutputStream::Stderr,
            data: data.to_string(),
        }
    }

    #[test]
    fn capture_completes_on_both_markers() {
        let mut capture = CommandCapture::new("MARK", "echo hi\n");
        assert!(!capture.absorb(&stdout_chunk("hi\nMARK 0\n")));
        assert!(capture.absorb(&stderr_chunk("MARK\n")));
        assert_eq!(capture.exit_code(), Some(0));
        let (stdout, stderr) = capture.into_output();
        assert_eq!(stdout, "hi\n");
        assert_eq!(stderr, "");
    }

    #[test]
    fn capture_handles_marker_split_across_chunks() {
        let mut capture = CommandCapture::new("MARK", "true\n");
        capture.absorb(&stdout_chunk("MA"));
        assert!(!capture.absorb(&stdout_chunk("RK 7\n")));
        assert!(capture.absorb(&stderr_chunk("MARK\n")));
        assert_eq!(capture.exit_code(), Some(7));
    }

    #[test]
    fn stderr_sentinel_tolerates_trailing_whitespace() {
        // cmd.exe style: the marker line may carry a trailing blank and CRLF.
        let mut capture = CommandCapture::new("MARK", "dir\r\n");
        assert!(!capture.absorb(&stdout_chunk("MARK 0\r\n")));
        assert!(capture.absorb(&stderr_chunk("MARK \r\n")));
        assert_eq!(capture.exit_code(), Some(0));
    }

    #[test]
    fn capture_keeps_unterminated_output_before_marker() {
        let mut capture = CommandCapture::new("MARK", "printf no-newline\n");
        capture.absorb(&stdout_chunk("no-newlineMARK 0\n"));
        capture.absorb(&stderr_chunk("MARK\n"));
        let (stdout, _) = capture.into_output();
        assert_eq!(stdout, "no-newline");
    }

    #[test]
    fn capture_ignores_marker_without_exit_status() {
        let mut capture = CommandCapture::new("MARK", "cat\n");
        assert!(!capture.absorb(&stdout_chunk("MARK not-a-number\n")));
        assert!(!capture.absorb(&stdout_chunk("MARK 3\n")));
        assert!(capture.absorb(&stderr_chunk("MARK\n")));
        assert_eq!(capture.exit_code(), Some(3));
        let (stdout, _) = capture.into_output();
        assert_eq!(stdout, "MARK not-a-number\n");
    }

    #[test]
    fn capture_flushes_partial_line_on_timeout() {
        let mut capture = CommandCapture::new("MARK", "emit\n");
        capture.absorb(&stdout_chunk("first\nsecond without newline"));
        let (stdout, _) = capture.into_output();
        assert_eq!(stdout, "first\nsecond without newline");
    }

    #[test]
    fn echoed_block_is_skipped_until_first_mismatch() {
        let block = "echo hi\nprintf '%s %s\\n' 'MARK' \"$?\"\n";
        let mut capture = CommandCapture::new("MARK", block);
        // An echoing shell repeats the submitted block before real output.
        capture.absorb(&stdout_chunk(
            "echo hi\nprintf '%s %s\\n' 'MARK' \"$?\"\nhi\nMARK 0\n",
        ));
        capture.absorb(&stderr_chunk("MARK\n"));
        let (stdout, _) = capture.into_output();
        assert_eq!(stdout, "hi\n");
    }

    #[test]
    fn echo_skip_disables_after_mismatch() {
        let mut echo = EchoSkip::new("a\nb\n");
        assert!(echo.skip("a"));
        assert!(!echo.skip("unrelated"));
        // Even an exact later match is kept once disabled.
        assert!(!echo.skip("b"));
    }

    #[test]
    fn output_tail_keeps_only_the_newest_bytes() {
        let mut tail = OutputTail::new(8);
        tail.push(b"0123456789");
        assert_eq!(tail.snapshot(), "23456789");
        tail.push(b"ab");
        assert_eq!(tail.snapshot(), "456789ab");
    }

    #[test]
    fn fresh_markers_are_unique() {
        let a = fresh_marker();
        let b = fresh_marker();
        assert_ne!(a, b);
        assert!(a.starts_with("__SHELLHERD_DONE_"));
    }

    #[test]
    fn session_state_roundtrip() {
        assert_eq!(SessionState::from_u8(STATE_READY), SessionState::Ready);
        assert_eq!(SessionState::from_u8(STATE_BUSY), SessionState::Busy);
        assert_eq!(
            SessionState::from_u8(STATE_TERMINATED),
            SessionState::Terminated
        );
        assert_eq!(
            SessionState::from_u8(STATE_UNINITIALIZED),
            SessionState::Uninitialized
        );
    }
}
