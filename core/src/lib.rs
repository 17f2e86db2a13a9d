//! shellherd-core: a resilient shell execution engine.
//!
//! Commands run inside persistent shell sessions with per-session FIFO
//! queues. Each in-flight command is guarded by a two-stage timeout machine
//! driven by regex classification of its output, and sessions are pooled by
//! environment signature so repeated work reuses warm shells.

mod command;
mod error;
mod events;
mod pattern;
mod pool;
mod session;
mod timeout;

pub use command::CommandResult;
pub use command::OutputChunk;
pub use command::OutputStream;
pub use command::TIMEOUT_EXIT_CODE;
pub use error::ExecError;
pub use events::EngineEvent;
pub use events::EngineEventBus;
pub use events::EngineEventKind;
pub use pattern::Classification;
pub use pattern::CompiledPatterns;
pub use pattern::OutputClass;
pub use pattern::PatternCache;
pub use pattern::PatternHit;
pub use pool::EnvironmentSignature;
pub use pool::OverflowPolicy;
pub use pool::PoolConfig;
pub use pool::ShellSessionPool;
pub use session::CommandTicket;
pub use session::PlatformStrategy;
pub use session::SessionId;
pub use session::SessionOptions;
pub use session::SessionState;
pub use session::SessionSummary;
pub use session::ShellKind;
pub use session::ShellSession;
pub use timeout::ResilientTimeout;
pub use timeout::TerminationReason;
pub use timeout::TimeoutProfile;
pub use timeout::TimeoutProfileBuilder;
pub use timeout::TimeoutStage;
