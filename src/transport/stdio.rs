//! Message-oriented duplex channel over a pair of byte streams.
//!
//! A [`DuplexChannel`] frames [`Message`]s as newline-delimited text. It is
//! built either over a freshly launched child process ([`DuplexChannel::spawn`])
//! or over any reader/writer pair such as our own stdin/stdout
//! ([`DuplexChannel::stdio`]).
//!
//! Each channel runs background tasks:
//!
//! - **writer** — drains the outgoing queue into the write half, one line per
//!   message, flushing after each. Dropping it closes the child's stdin.
//! - **reader** — splits the read half into lines of at most `max_line` bytes
//!   and queues every line that parses as JSON on the receiver returned at
//!   construction. Oversized, non-UTF-8 and non-JSON lines are logged and
//!   skipped.
//! - **stderr** (child only) — re-emits stderr lines through `tracing`.
//! - **exit watcher** (child only) — owns the [`Child`], waits for it to exit,
//!   and on [`DuplexChannel::close`] closes stdin, waits the configured grace
//!   period, then kills.
//!
//! The receiver yields `None` once the read half reaches EOF. [`closed`]
//! resolves once the channel can no longer accept messages: for a child that
//! is process exit, for plain streams it is the writer ending.
//!
//! [`closed`]: MessageSink::closed

use std::io;
use std::process::Stdio;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{
    AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead, FramedWrite, LinesCodec,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::MessageSink;
use crate::config::{expand_tilde, ChildConfig};
use crate::error::{LaunchError, SendError};
use crate::message::Message;

/// Send half of a duplex channel. Incoming messages arrive on the receiver
/// handed out alongside it.
pub struct DuplexChannel {
    label: String,
    pid: Option<u32>,
    outgoing: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

impl DuplexChannel {
    /// Launch `config.command` with piped stdio and wrap it.
    ///
    /// `label` (normally the session id) tags every log line of this child.
    pub fn spawn(
        config: &ChildConfig,
        label: &str,
        capacity: usize,
        max_line: usize,
    ) -> Result<(Self, mpsc::Receiver<Message>), LaunchError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(expand_tilde(dir).into_owned());
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            command: config.command_line(),
            source,
        })?;
        let missing = |pipe| LaunchError::MissingPipe {
            command: config.command_line(),
            pipe,
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        let pid = child.id();

        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();
        let (outgoing, outgoing_rx) = mpsc::channel(capacity);
        let (incoming_tx, incoming) = mpsc::channel(capacity);

        tokio::spawn(write_lines(label.to_string(), stdin, outgoing_rx, shutdown.clone()));
        tokio::spawn(read_lines(
            label.to_string(),
            stdout,
            max_line,
            incoming_tx,
            exited_then(closed.clone(), config.shutdown_grace()),
        ));
        tokio::spawn(log_stderr(label.to_string(), stderr));
        tokio::spawn(watch_exit(
            label.to_string(),
            child,
            shutdown.clone(),
            closed.clone(),
            config.shutdown_grace(),
        ));

        info!(
            session = %label,
            pid = pid.unwrap_or(0),
            "Launched `{}`",
            config.command_line()
        );
        let channel = Self {
            label: label.to_string(),
            pid,
            outgoing,
            shutdown,
            closed,
        };
        Ok((channel, incoming))
    }

    /// Wrap an arbitrary reader/writer pair.
    pub fn from_io<R, W>(
        reader: R,
        writer: W,
        label: &str,
        capacity: usize,
        max_line: usize,
    ) -> (Self, mpsc::Receiver<Message>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();
        let (outgoing, outgoing_rx) = mpsc::channel(capacity);
        let (incoming_tx, incoming) = mpsc::channel(capacity);

        let writer_label = label.to_string();
        let writer_shutdown = shutdown.clone();
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            write_lines(writer_label, writer, outgoing_rx, writer_shutdown).await;
            writer_closed.cancel();
        });
        let stop_reading = shutdown.clone();
        tokio::spawn(read_lines(
            label.to_string(),
            reader,
            max_line,
            incoming_tx,
            stop_reading.cancelled_owned(),
        ));

        let channel = Self {
            label: label.to_string(),
            pid: None,
            outgoing,
            shutdown,
            closed,
        };
        (channel, incoming)
    }

    /// Wrap this process's own stdin and stdout.
    pub fn stdio(capacity: usize, max_line: usize) -> (Self, mpsc::Receiver<Message>) {
        Self::from_io(tokio::io::stdin(), tokio::io::stdout(), "stdio", capacity, max_line)
    }

    /// OS process id, for child-backed channels.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the channel and wait until it is fully closed. Idempotent.
    ///
    /// For a child this closes its stdin, waits up to the grace period for it
    /// to exit on its own, and kills it otherwise.
    pub async fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!(session = %self.label, "Closing duplex channel");
        }
        self.shutdown.cancel();
        self.closed.cancelled().await;
    }
}

impl MessageSink for DuplexChannel {
    async fn send(&self, message: Message) -> Result<(), SendError> {
        if self.shutdown.is_cancelled() || self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.outgoing
            .send(message)
            .await
            .map_err(|_| SendError::Closed)
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

impl Drop for DuplexChannel {
    fn drop(&mut self) {
        // The exit watcher still owns the child and will reap it.
        self.shutdown.cancel();
    }
}

/// Resolves `grace` after `closed` fires. Bounds how long the reader keeps
/// draining a pipe whose process has already exited.
async fn exited_then(closed: CancellationToken, grace: Duration) {
    closed.cancelled().await;
    tokio::time::sleep(grace).await;
}

async fn write_lines<W>(
    label: String,
    writer: W,
    mut outgoing: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(writer, LinesCodec::new());
    loop {
        let message = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                // Flush whatever was queued before the close.
                while let Ok(message) = outgoing.try_recv() {
                    if framed.send(message.as_str()).await.is_err() {
                        break;
                    }
                }
                break;
            }
            next = outgoing.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };
        if let Err(e) = framed.send(message.as_str()).await {
            warn!(session = %label, "Write to duplex channel failed: {e}");
            shutdown.cancel();
            break;
        }
    }
    debug!(session = %label, "Duplex channel writer stopped");
}

/// One newline-terminated chunk of the read half.
#[derive(Debug, PartialEq, Eq)]
enum Line {
    Data(Bytes),
    /// A line longer than the limit; its bytes are discarded up to the next
    /// newline.
    TooLong,
}

/// Newline framing over raw bytes that reports an oversized line as a frame.
///
/// A decoder error ends a `FramedRead`, so overlong lines must not surface
/// as one.
struct LineDecoder(AnyDelimiterCodec);

impl LineDecoder {
    fn new(max_line: usize) -> Self {
        Self(AnyDelimiterCodec::new_with_max_length(
            b"\n".to_vec(),
            b"\n".to_vec(),
            max_line.max(1),
        ))
    }

    fn lift(result: Result<Option<Bytes>, AnyDelimiterCodecError>) -> io::Result<Option<Line>> {
        match result {
            Ok(chunk) => Ok(chunk.map(Line::Data)),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => Ok(Some(Line::TooLong)),
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for LineDecoder {
    type Item = Line;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Line>> {
        Self::lift(self.0.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Line>> {
        Self::lift(self.0.decode_eof(buf))
    }
}

async fn read_lines<R, F>(
    label: String,
    reader: R,
    max_line: usize,
    incoming: mpsc::Sender<Message>,
    stop: F,
) where
    R: AsyncRead + Unpin,
    F: std::future::Future<Output = ()>,
{
    let mut lines = FramedRead::new(reader, LineDecoder::new(max_line));
    tokio::pin!(stop);
    loop {
        let line = tokio::select! {
            biased;
            next = lines.next() => match next {
                Some(Ok(Line::Data(line))) => line,
                Some(Ok(Line::TooLong)) => {
                    warn!(session = %label, "Skipping line longer than {max_line} bytes from duplex channel");
                    continue;
                }
                Some(Err(e)) => {
                    warn!(session = %label, "Read from duplex channel failed: {e}");
                    break;
                }
                None => break,
            },
            () = &mut stop => break,
        };
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match Message::from_slice(&line) {
            Ok(message) => {
                if incoming.send(message).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(session = %label, "Skipping non-JSON line from duplex channel: {e}"),
        }
    }
    debug!(session = %label, "Duplex channel reader stopped");
}

async fn log_stderr<R>(label: String, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(session = %label, "stderr: {line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(session = %label, "stderr read error: {e}");
                break;
            }
        }
    }
}

async fn watch_exit(
    label: String,
    mut child: Child,
    shutdown: CancellationToken,
    closed: CancellationToken,
    grace: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = shutdown.cancelled() => {
            // The writer drops stdin on shutdown; give the child a chance to
            // exit on EOF before killing it.
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(session = %label, "Child did not exit within {}ms, killing", grace.as_millis());
                    if let Err(e) = child.start_kill() {
                        warn!(session = %label, "Kill failed: {e}");
                    }
                    child.wait().await
                }
            }
        }
    };
    match status {
        Ok(s) => info!(session = %label, "Child exited: {s}"),
        Err(e) => error!(session = %label, "Child wait error: {e}"),
    }
    shutdown.cancel();
    closed.cancel();
}
