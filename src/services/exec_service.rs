use crate::models::ConnectionEvent;
use crate::services::log_service::StatusReporter;
use crate::services::transport::{ChannelEvent, ExecChannel, RemoteConnection};
use crate::utils::error::ExecError;
use crate::utils::shell;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STREAM_BUFFER: usize = 256;

/// What to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statements {
    Command(String),
    /// Executed line by line, each on its own channel
    Script(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub statements: Statements,
    pub working_directory: Option<String>,
}

impl ExecRequest {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            statements: Statements::Command(command.into()),
            working_directory: None,
        }
    }

    pub fn script(text: &str) -> Self {
        Self {
            statements: Statements::Script(text.lines().map(str::to_string).collect()),
            working_directory: None,
        }
    }

    pub fn in_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    fn executable_lines(&self) -> usize {
        match &self.statements {
            Statements::Command(cmd) => usize::from(!cmd.trim().is_empty()),
            Statements::Script(lines) => lines
                .iter()
                .map(|l| l.trim())
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .count(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Ran to the end. `exit_status` is that of the last statement.
    Finished {
        exit_status: Option<u32>,
        failed_steps: usize,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Line(OutputLine),
    /// Always the last item, emitted exactly once
    Completed(Completion),
}

/// Cancels a running stream from anywhere
#[derive(Debug, Clone)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Output of one run
pub struct ExecStream {
    events: mpsc::Receiver<ExecEvent>,
    token: CancellationToken,
}

impl ExecStream {
    pub(crate) fn from_parts(events: mpsc::Receiver<ExecEvent>, token: CancellationToken) -> Self {
        Self { events, token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.token.clone())
    }

    /// Drain the stream into its lines and completion
    pub async fn collect_output(mut self) -> (Vec<OutputLine>, Completion) {
        let mut lines = vec![];
        while let Some(event) = self.next().await {
            match event {
                ExecEvent::Line(line) => lines.push(line),
                ExecEvent::Completed(completion) => return (lines, completion),
            }
        }
        (lines, Completion::Cancelled)
    }
}

impl Stream for ExecStream {
    type Item = ExecEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

/// Callback-style consumer of an `ExecStream`
pub trait LineSink: Send {
    fn stdout(&mut self, line: &str);
    fn stderr(&mut self, line: &str);
}

/// Every executor and tailer spawned from one session, for bulk cancellation
pub(crate) struct StreamTracker {
    state: Mutex<TrackerState>,
}

struct TrackerState {
    parent: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamTracker {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                parent: CancellationToken::new(),
                tasks: vec![],
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.lock().parent.child_token()
    }

    pub(crate) fn track(&self, task: JoinHandle<()>) {
        let mut state = self.lock();
        state.tasks.retain(|t| !t.is_finished());
        state.tasks.push(task);
    }

    pub(crate) fn live(&self) -> usize {
        self.lock().tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Cancel everything tracked and wait up to `timeout` for it to wind down.
    /// Stragglers are aborted.
    pub(crate) async fn stop_all(&self, timeout: Duration) {
        let tasks = {
            let mut state = self.lock();
            state.parent.cancel();
            state.parent = CancellationToken::new();
            std::mem::take(&mut state.tasks)
        };
        if tasks.is_empty() {
            return;
        }

        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!("Streams did not stop within {:?}, aborting", timeout);
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

/// Timing limits shared by executors and tailers
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    /// Per statement
    pub command_timeout: Duration,
    /// Bound on closing a channel after cancellation
    pub cleanup_timeout: Duration,
}

/// Runs commands or scripts on a connected session, streaming their output
pub struct StreamExecutor {
    connection: Arc<dyn RemoteConnection>,
    tracker: Arc<StreamTracker>,
    token: CancellationToken,
    limits: StreamLimits,
    reporter: StatusReporter,
}

impl StreamExecutor {
    pub(crate) fn new(
        connection: Arc<dyn RemoteConnection>,
        tracker: Arc<StreamTracker>,
        limits: StreamLimits,
        reporter: StatusReporter,
    ) -> Self {
        let token = tracker.child_token();
        Self {
            connection,
            tracker,
            token,
            limits,
            reporter,
        }
    }

    /// Start `request`. A single command's channel is opened before this
    /// returns; script statements report channel failures inline.
    ///
    /// Fails with `ExecError::Cancelled` once this executor was cancelled,
    /// directly or through the session, without running anything.
    pub async fn run(&self, request: ExecRequest) -> Result<ExecStream, ExecError> {
        if self.token.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        if request.executable_lines() == 0 {
            return Err(ExecError::EmptyScript);
        }

        let first_channel = match &request.statements {
            Statements::Command(command) => {
                let command = shell::in_directory(command, request.working_directory.as_deref());
                self.reporter
                    .report(ConnectionEvent::CommandStarted {
                        command: command.clone(),
                    })
                    .await;
                Some(self.connection.exec(&command).await?)
            }
            Statements::Script(_) => {
                self.reporter
                    .report(ConnectionEvent::CommandStarted {
                        command: format!("script ({} statements)", request.executable_lines()),
                    })
                    .await;
                None
            }
        };

        let token = self.token.child_token();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let emitter = Emitter::new(tx, token.clone());
        let task = tokio::spawn(produce(
            self.connection.clone(),
            request,
            first_channel,
            emitter,
            self.limits,
        ));
        self.tracker.track(task);

        Ok(ExecStream::from_parts(rx, token))
    }

    /// Run `request` and feed its output to `sink`
    pub async fn run_with(
        &self,
        request: ExecRequest,
        sink: &mut dyn LineSink,
    ) -> Result<Completion, ExecError> {
        let mut stream = self.run(request).await?;
        while let Some(event) = stream.next().await {
            match event {
                ExecEvent::Line(OutputLine {
                    stream: OutputStream::Stdout,
                    text,
                }) => sink.stdout(&text),
                ExecEvent::Line(OutputLine {
                    stream: OutputStream::Stderr,
                    text,
                }) => sink.stderr(&text),
                ExecEvent::Completed(completion) => return Ok(completion),
            }
        }
        Ok(Completion::Cancelled)
    }

    /// Terminate every run started from this executor. Later runs fail.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Sends events unless the run was cancelled or the consumer went away
pub(crate) struct Emitter {
    tx: mpsc::Sender<ExecEvent>,
    token: CancellationToken,
}

impl Emitter {
    pub(crate) fn new(tx: mpsc::Sender<ExecEvent>, token: CancellationToken) -> Self {
        Self { tx, token }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) async fn line(&self, stream: OutputStream, text: impl Into<String>) -> bool {
        let event = ExecEvent::Line(OutputLine {
            stream,
            text: text.into(),
        });
        tokio::select! {
            _ = self.token.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    pub(crate) async fn complete(self, completion: Completion) {
        // Completion is delivered even after cancellation
        let _ = self.tx.send(ExecEvent::Completed(completion)).await;
    }
}

/// How one channel ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelOutcome {
    Exited(Option<u32>),
    TimedOut,
    Cancelled,
}

/// Splits byte chunks into lines
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = vec![];
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(Self::decode(&raw[..raw.len() - 1]));
        }
        lines
    }

    fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(Self::decode(&raw))
    }

    fn decode(raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw);
        text.strip_suffix('\r').unwrap_or(&text).to_string()
    }
}

/// Forward one channel's output until it ends, times out or is cancelled
pub(crate) async fn drain_channel(
    channel: &mut Box<dyn ExecChannel>,
    emitter: &Emitter,
    timeout: Option<Duration>,
    cleanup_timeout: Duration,
) -> ChannelOutcome {
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    let mut stdout = LineBuffer::default();
    let mut stderr = LineBuffer::default();
    let mut exit_status = None;

    let outcome = loop {
        let event = tokio::select! {
            _ = emitter.token().cancelled() => break ChannelOutcome::Cancelled,
            _ = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => break ChannelOutcome::TimedOut,
            event = channel.next_event() => event,
        };

        let (stream, lines) = match event {
            Some(ChannelEvent::Stdout(bytes)) => (OutputStream::Stdout, stdout.push(&bytes)),
            Some(ChannelEvent::Stderr(bytes)) => (OutputStream::Stderr, stderr.push(&bytes)),
            Some(ChannelEvent::ExitStatus(status)) => {
                exit_status = Some(status);
                continue;
            }
            None => {
                for (stream, buffer) in [
                    (OutputStream::Stdout, &mut stdout),
                    (OutputStream::Stderr, &mut stderr),
                ] {
                    if let Some(rest) = buffer.flush() {
                        emitter.line(stream, rest).await;
                    }
                }
                return ChannelOutcome::Exited(exit_status);
            }
        };

        for line in lines {
            if !emitter.line(stream, line).await {
                break;
            }
        }
        if emitter.token().is_cancelled() || emitter.tx.is_closed() {
            break ChannelOutcome::Cancelled;
        }
    };

    if tokio::time::timeout(cleanup_timeout, channel.close())
        .await
        .is_err()
    {
        tracing::warn!("Channel did not close within {:?}", cleanup_timeout);
    }
    outcome
}

async fn produce(
    connection: Arc<dyn RemoteConnection>,
    request: ExecRequest,
    first_channel: Option<Box<dyn ExecChannel>>,
    emitter: Emitter,
    limits: StreamLimits,
) {
    let completion = match (request.statements, first_channel) {
        (Statements::Command(_), Some(mut channel)) => {
            let outcome = drain_channel(
                &mut channel,
                &emitter,
                Some(limits.command_timeout),
                limits.cleanup_timeout,
            )
            .await;
            match outcome {
                ChannelOutcome::Cancelled => Completion::Cancelled,
                ChannelOutcome::TimedOut => {
                    emitter
                        .line(
                            OutputStream::Stderr,
                            format!("timed out after {}s", limits.command_timeout.as_secs()),
                        )
                        .await;
                    Completion::Finished {
                        exit_status: None,
                        failed_steps: 1,
                    }
                }
                ChannelOutcome::Exited(status) => Completion::Finished {
                    exit_status: status,
                    failed_steps: usize::from(status.is_some_and(|s| s != 0)),
                },
            }
        }
        (Statements::Script(lines), _) => {
            run_script(
                connection.as_ref(),
                &lines,
                request.working_directory.as_deref(),
                &emitter,
                limits,
            )
            .await
        }
        (Statements::Command(_), None) => Completion::Finished {
            exit_status: None,
            failed_steps: 1,
        },
    };

    emitter.complete(completion).await;
}

/// Run each statement on its own channel; a failing statement is reported on
/// stderr and the script carries on with the next one.
async fn run_script(
    connection: &dyn RemoteConnection,
    lines: &[String],
    working_directory: Option<&str>,
    emitter: &Emitter,
    limits: StreamLimits,
) -> Completion {
    let mut failed_steps = 0;
    let mut last_status = None;

    for line in lines.iter().map(|l| l.trim()) {
        if emitter.token().is_cancelled() {
            return Completion::Cancelled;
        }
        if line.is_empty() {
            continue;
        }
        if line.starts_with('#') {
            emitter
                .line(OutputStream::Stdout, format!("{} (skipped)", line))
                .await;
            continue;
        }

        emitter.line(OutputStream::Stdout, format!("$ {}", line)).await;
        let command = shell::in_directory(line, working_directory);

        let failure = match connection.exec(&command).await {
            Ok(mut channel) => {
                match drain_channel(
                    &mut channel,
                    emitter,
                    Some(limits.command_timeout),
                    limits.cleanup_timeout,
                )
                .await
                {
                    ChannelOutcome::Cancelled => return Completion::Cancelled,
                    ChannelOutcome::TimedOut => {
                        last_status = None;
                        Some(format!(
                            "timed out after {}s",
                            limits.command_timeout.as_secs()
                        ))
                    }
                    ChannelOutcome::Exited(status) => {
                        last_status = status;
                        match status {
                            Some(code) if code != 0 => Some(format!("exit status {}", code)),
                            _ => None,
                        }
                    }
                }
            }
            Err(e) => {
                last_status = None;
                Some(e.to_string())
            }
        };

        if let Some(reason) = failure {
            failed_steps += 1;
            emitter
                .line(OutputStream::Stderr, format!("error: {}", reason))
                .await;
        }
        emitter.line(OutputStream::Stdout, "---").await;
    }

    Completion::Finished {
        exit_status: last_status,
        failed_steps,
    }
}
