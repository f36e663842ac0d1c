use crate::models::ConnectionEvent;
use crate::services::exec_service::{
    drain_channel, ChannelOutcome, Completion, Emitter, ExecStream, StreamLimits, StreamTracker,
};
use crate::services::log_service::StatusReporter;
use crate::services::transport::{ChannelEvent, RemoteConnection};
use crate::utils::error::TailError;
use crate::utils::shell;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

struct RunningTail {
    path: String,
    token: CancellationToken,
    /// Cancelled once the tail task has exited
    done: CancellationToken,
}

/// Streams newly appended lines of one remote file at a time
pub struct LogTailer {
    connection: Arc<dyn RemoteConnection>,
    tracker: Arc<StreamTracker>,
    limits: StreamLimits,
    history_lines: usize,
    reporter: StatusReporter,
    current: Mutex<Option<RunningTail>>,
}

impl LogTailer {
    pub(crate) fn new(
        connection: Arc<dyn RemoteConnection>,
        tracker: Arc<StreamTracker>,
        limits: StreamLimits,
        history_lines: usize,
        reporter: StatusReporter,
    ) -> Self {
        Self {
            connection,
            tracker,
            limits,
            history_lines,
            reporter,
            current: Mutex::new(None),
        }
    }

    /// Follow `remote_path`, replacing any tail this tailer already runs.
    /// The last `history_lines` lines are replayed first.
    pub async fn start(&self, remote_path: &str) -> Result<ExecStream, TailError> {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            self.finish(previous).await;
        }

        if !self.file_exists(remote_path).await? {
            return Err(TailError::FileNotFound(remote_path.to_string()));
        }

        let command = format!(
            "tail -f -n {} {}",
            self.history_lines,
            shell::quote(remote_path)
        );
        let mut channel = self.connection.exec(&command).await?;

        let token = self.tracker.child_token();
        let done = CancellationToken::new();
        let (tx, rx) = mpsc::channel(256);
        let emitter = Emitter::new(tx, token.clone());
        let cleanup_timeout = self.limits.cleanup_timeout;
        let done_guard = done.clone().drop_guard();

        let task = tokio::spawn(async move {
            let _done = done_guard;
            let completion = match drain_channel(&mut channel, &emitter, None, cleanup_timeout).await
            {
                ChannelOutcome::Exited(status) => Completion::Finished {
                    exit_status: status,
                    failed_steps: usize::from(status.is_some_and(|s| s != 0)),
                },
                ChannelOutcome::TimedOut | ChannelOutcome::Cancelled => Completion::Cancelled,
            };
            emitter.complete(completion).await;
        });
        self.tracker.track(task);

        self.reporter
            .report(ConnectionEvent::TailStarted {
                path: remote_path.to_string(),
            })
            .await;

        *current = Some(RunningTail {
            path: remote_path.to_string(),
            token: token.clone(),
            done,
        });
        Ok(ExecStream::from_parts(rx, token))
    }

    /// Stop the running tail, if any
    pub async fn stop(&self) {
        if let Some(running) = self.current.lock().await.take() {
            self.finish(running).await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.done.is_cancelled())
    }

    async fn finish(&self, running: RunningTail) {
        running.token.cancel();
        if tokio::time::timeout(self.limits.cleanup_timeout, running.done.cancelled())
            .await
            .is_err()
        {
            tracing::warn!("Tail of {} did not stop in time", running.path);
        }
        self.reporter
            .report(ConnectionEvent::TailStopped { path: running.path })
            .await;
    }

    async fn file_exists(&self, remote_path: &str) -> Result<bool, TailError> {
        let check = format!("test -f {}", shell::quote(remote_path));
        let mut channel = self.connection.exec(&check).await?;

        let checked = tokio::time::timeout(self.limits.command_timeout, async {
            let mut exit_status = None;
            while let Some(event) = channel.next_event().await {
                if let ChannelEvent::ExitStatus(status) = event {
                    exit_status = Some(status);
                }
            }
            exit_status
        })
        .await;

        match checked {
            Ok(exit_status) => Ok(exit_status == Some(0)),
            Err(_) => {
                let _ = tokio::time::timeout(self.limits.cleanup_timeout, channel.close()).await;
                Err(TailError::Timeout(remote_path.to_string()))
            }
        }
    }
}
