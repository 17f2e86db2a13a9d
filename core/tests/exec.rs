// End-to-end session tests against a real shell.
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use shellherd_core::EngineEventBus;
use shellherd_core::ExecError;
use shellherd_core::PatternCache;
use shellherd_core::SessionId;
use shellherd_core::SessionOptions;
use shellherd_core::SessionState;
use shellherd_core::ShellSession;
use shellherd_core::TIMEOUT_EXIT_CODE;
use shellherd_core::TerminationReason;
use shellherd_core::TimeoutProfile;
use tokio::sync::mpsc;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn session_with(options: SessionOptions) -> ShellSession {
    ShellSession::spawn(
        SessionId(1),
        options,
        Arc::new(PatternCache::new()),
        EngineEventBus::new(),
    )
    .await
    .expect("spawn session")
}

async fn session() -> ShellSession {
    session_with(SessionOptions::default()).await
}

fn lenient() -> TimeoutProfile {
    TimeoutProfile::builder(Duration::from_secs(20)).build()
}

fn tight() -> TimeoutProfile {
    TimeoutProfile::builder(Duration::from_millis(300))
        .grace_timeout(Duration::from_millis(200))
        .absolute_maximum(Duration::from_secs(5))
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runs_commands_and_keeps_shell_state() {
    init_logging();
    let session = session().await;

    let result = session.execute("echo hello", lenient()).await.expect("echo");
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.termination, None);

    let result = session
        .execute("bash -c 'exit 7'", lenient())
        .await
        .expect("exit 7");
    assert_eq!(result.exit_code, 7);

    // The shell is persistent: state set by one command is visible to the
    // next.
    session.execute("GREETING=salve", lenient()).await.expect("assign");
    let result = session
        .execute("echo \"$GREETING\"", lenient())
        .await
        .expect("read back");
    assert_eq!(result.stdout, "salve\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stdout_and_stderr_are_captured_separately() {
    let session = session().await;
    let result = session
        .execute("echo out; echo err 1>&2", lenient())
        .await
        .expect("execute");
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "err\n");
    assert_eq!(result.exit_code, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_commands_run_in_submission_order() {
    let session = session().await;
    let first = session
        .submit("SEQ=$((SEQ+1)); echo $SEQ", lenient(), None)
        .expect("submit");
    let second = session
        .submit("SEQ=$((SEQ+1)); echo $SEQ", lenient(), None)
        .expect("submit");
    let third = session
        .submit("SEQ=$((SEQ+1)); echo $SEQ", lenient(), None)
        .expect("submit");

    assert_eq!(first.wait().await.expect("first").stdout, "1\n");
    assert_eq!(second.wait().await.expect("second").stdout, "2\n");
    assert_eq!(third.wait().await.expect("third").stdout, "3\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn marker_like_output_does_not_complete_early() {
    let session = session().await;
    let result = session
        .execute(
            "echo __SHELLHERD_DONE_0000000000000000__ 99; echo tail",
            lenient(),
        )
        .await
        .expect("execute");
    assert_eq!(result.termination, None);
    assert_eq!(result.exit_code, 0);
    assert_eq!(
        result.stdout,
        "__SHELLHERD_DONE_0000000000000000__ 99\ntail\n"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_kills_the_command_but_preserves_the_session() {
    init_logging();
    let session = session().await;
    let result = session.execute("sleep 30", tight()).await.expect("timeout");
    assert!(result.timed_out());
    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert_eq!(result.termination, Some(TerminationReason::GraceExpired));

    // The session respawned its shell and keeps serving commands.
    let result = session.execute("echo back", lenient()).await.expect("echo");
    assert_eq!(result.stdout, "back\n");
    assert!(session.is_healthy());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_pattern_terminates_the_command() {
    let profile = TimeoutProfile::builder(Duration::from_secs(20))
        .error_pattern("BOOM")
        .build();
    let session = session().await;
    let result = session
        .execute("echo BOOM; sleep 30", profile)
        .await
        .expect("execute");
    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert_eq!(result.termination, Some(TerminationReason::ErrorDetected));
    assert!(result.stdout.contains("BOOM"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn output_written_before_the_kill_lands_in_the_report() {
    let profile = TimeoutProfile::builder(Duration::from_secs(20))
        .error_pattern("fatal")
        .build();
    let session = session().await;
    // The stderr line triggers the kill while the stdout line may still be
    // sitting in the reader; it must reach the report anyway.
    let result = session
        .execute("echo fatal 1>&2; echo trailing; sleep 30", profile)
        .await
        .expect("execute");
    assert_eq!(result.termination, Some(TerminationReason::ErrorDetected));
    assert!(result.stderr.contains("fatal"));
    assert!(result.stdout.contains("trailing"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_output_defers_the_timeout() {
    let profile = TimeoutProfile::builder(Duration::from_millis(600))
        .grace_timeout(Duration::from_millis(300))
        .absolute_maximum(Duration::from_secs(10))
        .progress_pattern("tick")
        .build();
    let session = session().await;
    // Runs well past the base timeout, but each tick re-arms it.
    let result = session
        .execute(
            "for i in 1 2 3 4; do echo tick; sleep 0.3; done; echo done",
            profile,
        )
        .await
        .expect("execute");
    assert_eq!(result.termination, None);
    assert!(result.stdout.ends_with("done\n"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_queued_command_rejects_it() {
    let session = session().await;
    let running = session
        .submit("sleep 0.5", lenient(), None)
        .expect("submit");
    let queued = session.submit("echo never", lenient(), None).expect("submit");
    let queued_id = queued.id().to_string();

    assert!(session.cancel(&queued_id));
    assert!(matches!(queued.wait().await, Err(ExecError::Cancelled)));

    // The running command is unaffected.
    let result = running.wait().await.expect("running");
    assert_eq!(result.termination, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_an_in_flight_command_resolves_with_cancelled() {
    let session = session().await;
    let ticket = session.submit("sleep 30", lenient(), None).expect("submit");
    let id = ticket.id().to_string();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(session.cancel(&id));
    let result = ticket.wait().await.expect("cancelled command");
    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert_eq!(result.termination, Some(TerminationReason::Cancelled));

    // Cancellation of an unknown id is a no-op.
    assert!(!session.cancel("cmd-1-999"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminate_is_idempotent() {
    let session = session().await;
    session.terminate().await;
    session.terminate().await;
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(matches!(
        session.submit("echo nope", lenient(), None),
        Err(ExecError::SessionClosed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shell_exit_poisons_the_session() {
    let session = session().await;
    let result = session.execute("exit 0", lenient()).await;
    assert!(matches!(result, Err(ExecError::ProcessDied)));
    assert!(!session.is_healthy());
    assert!(matches!(
        session.submit("echo nope", lenient(), None),
        Err(ExecError::SessionClosed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn working_dir_and_env_overrides_apply() {
    let dir = tempfile::tempdir().expect("tempdir");
    let canonical = std::fs::canonicalize(dir.path()).expect("canonicalize");
    let mut options = SessionOptions {
        working_dir: Some(dir.path().to_path_buf()),
        ..SessionOptions::default()
    };
    options
        .env_overrides
        .insert("SHELLHERD_TEST".to_string(), "grazing".to_string());
    let session = session_with(options).await;

    let result = session.execute("pwd", lenient()).await.expect("pwd");
    assert_eq!(result.stdout.trim_end(), canonical.to_string_lossy());

    let result = session
        .execute("echo \"$SHELLHERD_TEST\"", lenient())
        .await
        .expect("env");
    assert_eq!(result.stdout, "grazing\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamed_chunks_arrive_while_running() {
    let session = session().await;
    let (tx, mut rx) = mpsc::channel(64);
    let result = session
        .execute_streamed("echo one; echo two", lenient(), tx)
        .await
        .expect("execute");
    assert_eq!(result.exit_code, 0);

    let mut streamed = String::new();
    while let Ok(chunk) = rx.try_recv() {
        streamed.push_str(&chunk.data);
    }
    assert!(streamed.contains("one"));
    assert!(streamed.contains("two"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn summary_reflects_session_activity() {
    let session = session().await;
    session.execute("echo visible", lenient()).await.expect("echo");

    let summary = session.summary();
    assert_eq!(summary.state, SessionState::Ready);
    assert!(!summary.poisoned);
    assert_eq!(summary.last_command.as_deref(), Some("echo visible"));
    assert!(summary.bytes_seen > 0);
    assert!(summary.tail.contains("visible"));
}
