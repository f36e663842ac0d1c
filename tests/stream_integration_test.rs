//! Integration tests for remote command execution and log tailing
//!
//! Commands run against the scripted in-memory transport.

use futures::StreamExt;
use ssh_console::models::{ConnectTarget, ConnectionEvent, Credentials, HostId};
use ssh_console::services::exec_service::{
    Completion, ExecEvent, ExecRequest, LineSink, OutputLine, OutputStream,
};
use ssh_console::services::log_service::LogService;
use ssh_console::services::memory_transport::{ExecScript, MemoryConnector};
use ssh_console::services::{Session, SessionSettings};
use ssh_console::utils::error::{ExecError, TailError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_test::assert_ok;

fn target() -> ConnectTarget {
    ConnectTarget {
        name: "web-1".into(),
        host: "web.example.com".into(),
        port: 22,
        username: "root".into(),
        credentials: Credentials::Password("secret".into()),
        host_key_fingerprint: None,
        verify_host_key: false,
    }
}

fn session(connector: Arc<MemoryConnector>, log: Arc<LogService>) -> Session {
    let (events, _) = broadcast::channel(16);
    Session::new(
        HostId::new("web"),
        target(),
        connector,
        SessionSettings::default(),
        log,
        events,
    )
}

async fn connected(connector: &Arc<MemoryConnector>) -> (Session, Arc<LogService>) {
    let log = Arc::new(LogService::new(200));
    let session = session(connector.clone(), log.clone());
    assert_ok!(session.connect().await);
    (session, log)
}

fn stdout(text: &str) -> OutputLine {
    OutputLine {
        stream: OutputStream::Stdout,
        text: text.to_string(),
    }
}

fn stderr(text: &str) -> OutputLine {
    OutputLine {
        stream: OutputStream::Stderr,
        text: text.to_string(),
    }
}

// =============================================================================
// Command Integration Tests
// =============================================================================

#[tokio::test]
async fn test_single_command_streams_output() {
    let connector = MemoryConnector::new();
    connector.script("uptime", ExecScript::stdout(&["up 3 days", "load 0.1"]));
    let (session, log) = connected(&connector).await;

    let executor = session.stream_executor().await.unwrap();
    let (lines, completion) = executor
        .run(ExecRequest::command("uptime"))
        .await
        .unwrap()
        .collect_output()
        .await;

    assert_eq!(lines, vec![stdout("up 3 days"), stdout("load 0.1")]);
    assert_eq!(
        completion,
        Completion::Finished {
            exit_status: Some(0),
            failed_steps: 0
        }
    );
    assert!(log
        .get_logs()
        .await
        .iter()
        .any(|l| l.event == ConnectionEvent::CommandStarted { command: "uptime".into() }));
}

#[tokio::test]
async fn test_command_runs_in_working_directory() {
    let connector = MemoryConnector::new();
    let (session, _log) = connected(&connector).await;

    let executor = session.stream_executor().await.unwrap();
    executor
        .run(ExecRequest::command("ls -la").in_directory("/srv/app"))
        .await
        .unwrap()
        .collect_output()
        .await;

    assert_eq!(connector.executed(), vec!["cd /srv/app && ls -la".to_string()]);
}

#[tokio::test]
async fn test_failing_command_reports_exit_status() {
    let connector = MemoryConnector::new();
    connector.script("cat", ExecScript::failing(1, &["cat: nope: No such file"]));
    let (session, _log) = connected(&connector).await;

    let executor = session.stream_executor().await.unwrap();
    let (lines, completion) = executor
        .run(ExecRequest::command("cat nope"))
        .await
        .unwrap()
        .collect_output()
        .await;

    assert_eq!(lines, vec![stderr("cat: nope: No such file")]);
    assert_eq!(
        completion,
        Completion::Finished {
            exit_status: Some(1),
            failed_steps: 1
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_command_timeout_is_reported() {
    let connector = MemoryConnector::new();
    connector.script("sleep", ExecScript::hanging(&[]));
    let (session, _log) = connected(&connector).await;

    let executor = session.stream_executor().await.unwrap();
    let (lines, completion) = executor
        .run(ExecRequest::command("sleep 3600"))
        .await
        .unwrap()
        .collect_output()
        .await;

    assert_eq!(lines, vec![stderr("timed out after 30s")]);
    assert_eq!(
        completion,
        Completion::Finished {
            exit_status: None,
            failed_steps: 1
        }
    );
    assert_eq!(connector.last_connection().unwrap().channels_closed(), 1);
}

#[tokio::test]
async fn test_exec_requires_connection() {
    let connector = MemoryConnector::new();
    let session = session(connector, Arc::new(LogService::new(10)));
    assert!(matches!(
        session.stream_executor().await,
        Err(ExecError::NotConnected)
    ));
}

#[tokio::test]
async fn test_empty_script_is_rejected() {
    let connector = MemoryConnector::new();
    let (session, _log) = connected(&connector).await;

    let executor = session.stream_executor().await.unwrap();
    let result = executor.run(ExecRequest::script("# nothing here\n\n")).await;
    assert!(matches!(result, Err(ExecError::EmptyScript)));
    assert!(connector.executed().is_empty());
}

// =============================================================================
// Script Integration Tests
// =============================================================================

#[tokio::test]
async fn test_script_continues_after_failed_statement() {
    let connector = MemoryConnector::new();
    connector.script("false-cmd", ExecScript::failing(2, &["boom"]));
    connector.script("echo done", ExecScript::stdout(&["done"]));
    let (session, _log) = connected(&connector).await;

    let executor = session.stream_executor().await.unwrap();
    let script = "# deploy steps\n\nfalse-cmd\necho done\n";
    let (lines, completion) = executor
        .run(ExecRequest::script(script).in_directory("/srv"))
        .await
        .unwrap()
        .collect_output()
        .await;

    assert_eq!(
        lines,
        vec![
            stdout("# deploy steps (skipped)"),
            stdout("$ false-cmd"),
            stderr("boom"),
            stderr("error: exit status 2"),
            stdout("---"),
            stdout("$ echo done"),
            stdout("done"),
            stdout("---"),
        ]
    );
    assert_eq!(
        completion,
        Completion::Finished {
            exit_status: Some(0),
            failed_steps: 1
        }
    );
    assert_eq!(
        connector.executed(),
        vec![
            "cd /srv && false-cmd".to_string(),
            "cd /srv && echo done".to_string()
        ]
    );
}

#[derive(Default)]
struct Collected {
    out: Vec<String>,
    err: Vec<String>,
}

impl LineSink for Collected {
    fn stdout(&mut self, line: &str) {
        self.out.push(line.to_string());
    }

    fn stderr(&mut self, line: &str) {
        self.err.push(line.to_string());
    }
}

#[tokio::test]
async fn test_run_with_feeds_sink() {
    let connector = MemoryConnector::new();
    connector.script("whoami", ExecScript::stdout(&["root"]));
    connector.script("missing", ExecScript::failing(127, &["missing: not found"]));
    let (session, _log) = connected(&connector).await;

    let executor = session.stream_executor().await.unwrap();
    let mut sink = Collected::default();
    let completion = executor
        .run_with(ExecRequest::script("whoami\nmissing"), &mut sink)
        .await
        .unwrap();

    assert_eq!(sink.out, vec!["$ whoami", "root", "---", "$ missing", "---"]);
    assert_eq!(sink.err, vec!["missing: not found", "error: exit status 127"]);
    assert_eq!(
        completion,
        Completion::Finished {
            exit_status: Some(127),
            failed_steps: 1
        }
    );
}

// =============================================================================
// Cancellation Integration Tests
// =============================================================================

#[tokio::test]
async fn test_cancel_delivers_exactly_one_completion() {
    let connector = MemoryConnector::new();
    connector.script("journalctl", ExecScript::hanging(&["first"]));
    let (session, _log) = connected(&connector).await;

    let executor = session.stream_executor().await.unwrap();
    let mut stream = executor
        .run(ExecRequest::command("journalctl -f"))
        .await
        .unwrap();

    assert_eq!(stream.next().await, Some(ExecEvent::Line(stdout("first"))));
    stream.cancel();

    let rest: Vec<ExecEvent> = stream.collect().await;
    assert_eq!(rest, vec![ExecEvent::Completed(Completion::Cancelled)]);
}

#[tokio::test]
async fn test_cancel_racing_completion_still_completes_once() {
    let connector = MemoryConnector::new();
    connector.script("date", ExecScript::stdout(&["Mon"]));
    let (session, _log) = connected(&connector).await;
    let executor = session.stream_executor().await.unwrap();

    for _ in 0..20 {
        let stream = executor.run(ExecRequest::command("date")).await.unwrap();
        stream.cancel();

        let events: Vec<ExecEvent> = stream.collect().await;
        let completions = events
            .iter()
            .filter(|e| matches!(e, ExecEvent::Completed(_)))
            .count();
        assert_eq!(completions, 1);
        assert!(matches!(events.last(), Some(ExecEvent::Completed(_))));
    }
}

#[tokio::test]
async fn test_cancelled_executor_runs_nothing() {
    let connector = MemoryConnector::new();
    let (session, _log) = connected(&connector).await;

    let executor = session.stream_executor().await.unwrap();
    executor.cancel();

    let result = executor.run(ExecRequest::command("rm -rf /tmp/x")).await;
    assert!(matches!(result, Err(ExecError::Cancelled)));
    let result = executor.run(ExecRequest::script("rm -rf /tmp/x")).await;
    assert!(matches!(result, Err(ExecError::Cancelled)));
    assert!(connector.executed().is_empty());
}

#[tokio::test]
async fn test_disconnect_cancels_running_streams() {
    let connector = MemoryConnector::new();
    connector.script("top", ExecScript::hanging(&["tick"]));
    let (session, _log) = connected(&connector).await;
    let connection = connector.last_connection().unwrap();

    let executor = session.stream_executor().await.unwrap();
    let mut first = executor.run(ExecRequest::command("top -b")).await.unwrap();
    let mut second = executor.run(ExecRequest::command("top -b")).await.unwrap();
    assert!(first.next().await.is_some());
    assert!(second.next().await.is_some());
    assert_eq!(session.live_streams(), 2);

    session.disconnect().await;

    assert_eq!(
        first.next().await,
        Some(ExecEvent::Completed(Completion::Cancelled))
    );
    assert_eq!(
        second.next().await,
        Some(ExecEvent::Completed(Completion::Cancelled))
    );
    assert_eq!(session.live_streams(), 0);
    assert_eq!(connection.channels_closed(), 2);
}

#[tokio::test]
async fn test_stop_current_streams_keeps_session_connected() {
    let connector = MemoryConnector::new();
    connector.script("top", ExecScript::hanging(&["tick"]));
    let (session, _log) = connected(&connector).await;

    let executor = session.stream_executor().await.unwrap();
    let mut stream = executor.run(ExecRequest::command("top -b")).await.unwrap();
    assert!(stream.next().await.is_some());

    session.stop_current_streams().await;
    assert_eq!(
        stream.next().await,
        Some(ExecEvent::Completed(Completion::Cancelled))
    );
    assert!(session.status().is_connected());

    // The stopped executor refuses further work without touching the host
    let executed = connector.executed().len();
    let result = executor.run(ExecRequest::command("hostname")).await;
    assert!(matches!(result, Err(ExecError::Cancelled)));
    assert_eq!(connector.executed().len(), executed);

    // A fresh executor is not affected by the earlier stop
    connector.script("hostname", ExecScript::stdout(&["web-1"]));
    let executor = session.stream_executor().await.unwrap();
    let (lines, _) = executor
        .run(ExecRequest::command("hostname"))
        .await
        .unwrap()
        .collect_output()
        .await;
    assert_eq!(lines, vec![stdout("web-1")]);
}

// =============================================================================
// Log Tailing Integration Tests
// =============================================================================

#[tokio::test]
async fn test_tail_missing_file() {
    let connector = MemoryConnector::new();
    connector.script("test -f /var/log/missing.log", ExecScript::failing(1, &[]));
    let (session, _log) = connected(&connector).await;

    let tailer = session.log_tailer().await.unwrap();
    let result = tailer.start("/var/log/missing.log").await;
    assert!(matches!(result, Err(TailError::FileNotFound(path)) if path == "/var/log/missing.log"));
    assert!(!tailer.is_running().await);
    assert_eq!(connector.executed().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_tail_existence_check_timeout() {
    let connector = MemoryConnector::new();
    connector.script("test -f", ExecScript::hanging(&[]));
    let (session, _log) = connected(&connector).await;

    let tailer = session.log_tailer().await.unwrap();
    let result = tailer.start("/var/log/app.log").await;
    assert!(matches!(result, Err(TailError::Timeout(path)) if path == "/var/log/app.log"));
    assert!(!tailer.is_running().await);
    // Only the check ran, and its channel was shut down
    assert_eq!(connector.executed().len(), 1);
    assert_eq!(connector.last_connection().unwrap().channels_closed(), 1);
}

#[tokio::test]
async fn test_tail_streams_until_stopped() {
    let connector = MemoryConnector::new();
    connector.script("tail -f", ExecScript::hanging(&["GET /", "GET /health"]));
    let (session, log) = connected(&connector).await;

    let tailer = session.log_tailer().await.unwrap();
    let mut stream = tailer.start("/var/log/nginx/access.log").await.unwrap();
    assert_eq!(stream.next().await, Some(ExecEvent::Line(stdout("GET /"))));
    assert_eq!(
        stream.next().await,
        Some(ExecEvent::Line(stdout("GET /health")))
    );
    assert!(tailer.is_running().await);
    assert_eq!(
        connector.executed().last().unwrap(),
        "tail -f -n 200 /var/log/nginx/access.log"
    );

    tailer.stop().await;
    assert_eq!(
        stream.next().await,
        Some(ExecEvent::Completed(Completion::Cancelled))
    );
    assert!(!tailer.is_running().await);

    // Stopping twice is harmless
    tailer.stop().await;
    let stopped = log
        .get_logs()
        .await
        .iter()
        .filter(|l| matches!(l.event, ConnectionEvent::TailStopped { .. }))
        .count();
    assert_eq!(stopped, 1);
}

#[tokio::test]
async fn test_new_tail_replaces_previous() {
    let connector = MemoryConnector::new();
    connector.script("tail -f", ExecScript::hanging(&["line"]));
    let (session, _log) = connected(&connector).await;

    let tailer = session.log_tailer().await.unwrap();
    let mut first = tailer.start("/var/log/a.log").await.unwrap();
    assert!(first.next().await.is_some());

    let mut second = tailer.start("/var/log/b.log").await.unwrap();
    assert_eq!(
        first.next().await,
        Some(ExecEvent::Completed(Completion::Cancelled))
    );
    assert_eq!(second.next().await, Some(ExecEvent::Line(stdout("line"))));

    tailer.stop().await;
}

#[tokio::test]
async fn test_tail_requires_connection() {
    let connector = MemoryConnector::new();
    let session = session(connector, Arc::new(LogService::new(10)));
    assert!(matches!(
        session.log_tailer().await,
        Err(TailError::NotConnected)
    ));
}

#[tokio::test]
async fn test_tail_ends_when_session_disconnects() {
    let connector = MemoryConnector::new();
    connector.script("tail -f", ExecScript::hanging(&["line"]));
    let (session, _log) = connected(&connector).await;

    let tailer = session.log_tailer().await.unwrap();
    let mut stream = tailer.start("/var/log/syslog").await.unwrap();
    assert!(stream.next().await.is_some());

    session.disconnect().await;
    assert_eq!(
        stream.next().await,
        Some(ExecEvent::Completed(Completion::Cancelled))
    );
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap(),
        None
    );
}
