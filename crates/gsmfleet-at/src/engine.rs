// ── AT command engine ──
//
// Serializes commands onto a line channel: exactly one command is in flight
// at a time, responses are buffered until a terminal result-code line, and
// unsolicited lines are diverted to a broadcast channel at any point.
//
// A command that times out is not left blocking the port. Its sequence
// number moves to an abandoned list, the next queued command is written
// immediately, and the first terminal line that arrives while the abandoned
// list is non-empty is consumed against the oldest abandoned entry and
// discarded together with whatever payload preceded it. Responses therefore
// never shift onto the wrong caller.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::AtError;
use crate::event::{self, UnsolicitedEvent};
use crate::transport::LineChannel;

const SUBMIT_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 64;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(5_000);

// ── Result grammar ───────────────────────────────────────────────────

/// Terminal result codes that end a command/response cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    Error,
    Busy,
    NoCarrier,
    Data,
    /// `CONNECT`, optionally with a speed suffix.
    Connect(Option<String>),
    /// The `> ` prompt issued before payload entry.
    Prompt,
}

impl ResultCode {
    /// Parse a received line as a terminal result code, if it is one.
    pub fn parse(line: &str) -> Option<Self> {
        match line {
            "OK" => Some(Self::Ok),
            "ERROR" => Some(Self::Error),
            "BUSY" => Some(Self::Busy),
            "NO CARRIER" => Some(Self::NoCarrier),
            "DATA" => Some(Self::Data),
            "> " => Some(Self::Prompt),
            _ => line.strip_prefix("CONNECT").map(|rest| {
                let rest = rest.trim();
                Self::Connect((!rest.is_empty()).then(|| rest.to_owned()))
            }),
        }
    }
}

/// A completed command/response cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub code: ResultCode,
    /// Payload lines received before the terminal code, echo and blank
    /// separators already stripped. Empty on `ERROR`.
    pub lines: Vec<String>,
}

impl CommandResponse {
    pub fn is_ok(&self) -> bool {
        !matches!(self.code, ResultCode::Error)
    }

    /// First payload line, for single-line queries.
    pub fn first_line(&self) -> Option<&str> {
        self.lines.first().map(String::as_str)
    }
}

// ── Engine handle ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Per-command response window.
    pub command_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

struct Submission {
    command: String,
    reply: oneshot::Sender<Result<CommandResponse, AtError>>,
}

/// Handle onto a running engine task. Cheap to clone; the task stops when
/// [`AtEngine::close`] is called or the transport drops.
#[derive(Clone)]
pub struct AtEngine {
    submit_tx: mpsc::Sender<Submission>,
    event_tx: broadcast::Sender<UnsolicitedEvent>,
    cancel: CancellationToken,
}

impl AtEngine {
    /// Start an engine on `channel` and probe the device with a bare `AT`.
    /// Fails if the device does not answer within the command window.
    pub async fn open(channel: LineChannel, options: EngineOptions) -> Result<Self, AtError> {
        let engine = Self::start(channel, options);
        engine.submit("AT").await?;
        Ok(engine)
    }

    /// Start the engine task without probing. Used by `open` and by tests
    /// that script the far side before the first command.
    pub fn start(channel: LineChannel, options: EngineOptions) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_QUEUE);
        let (event_tx, _) = broadcast::channel(EVENT_QUEUE);
        let cancel = CancellationToken::new();

        tokio::spawn(engine_task(
            channel,
            options,
            submit_rx,
            event_tx.clone(),
            cancel.clone(),
        ));

        Self {
            submit_tx,
            event_tx,
            cancel,
        }
    }

    /// Queue a command and wait for its response. Commands issued from
    /// multiple tasks are answered strictly in submission order.
    pub async fn submit(&self, command: impl Into<String>) -> Result<CommandResponse, AtError> {
        let (reply, rx) = oneshot::channel();
        self.submit_tx
            .send(Submission {
                command: command.into(),
                reply,
            })
            .await
            .map_err(|_| AtError::EngineClosed)?;
        rx.await.map_err(|_| AtError::EngineClosed)?
    }

    /// Subscribe to unsolicited events. Subscribers that lag past the
    /// channel capacity miss events rather than stalling the engine.
    pub fn events(&self) -> broadcast::Receiver<UnsolicitedEvent> {
        self.event_tx.subscribe()
    }

    /// Stop the engine task. Queued and in-flight commands resolve with
    /// [`AtError::EngineClosed`].
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

// ── Engine task ──────────────────────────────────────────────────────

struct InFlight {
    seq: u64,
    command: String,
    reply: oneshot::Sender<Result<CommandResponse, AtError>>,
    deadline: Instant,
}

struct EngineTask {
    channel: LineChannel,
    options: EngineOptions,
    event_tx: broadcast::Sender<UnsolicitedEvent>,

    queue: VecDeque<Submission>,
    in_flight: Option<InFlight>,
    /// Sequence numbers of timed-out commands whose terminal line is still
    /// owed by the device, oldest first.
    abandoned: VecDeque<u64>,
    buffer: Vec<String>,
    next_seq: u64,
}

async fn engine_task(
    channel: LineChannel,
    options: EngineOptions,
    mut submit_rx: mpsc::Receiver<Submission>,
    event_tx: broadcast::Sender<UnsolicitedEvent>,
    cancel: CancellationToken,
) {
    let mut task = EngineTask {
        channel,
        options,
        event_tx,
        queue: VecDeque::new(),
        in_flight: None,
        abandoned: VecDeque::new(),
        buffer: Vec::new(),
        next_seq: 0,
    };

    loop {
        // Far-future deadline keeps the select arm live when idle.
        let deadline = task
            .in_flight
            .as_ref()
            .map(|f| f.deadline)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            submission = submit_rx.recv() => {
                let Some(submission) = submission else { break };
                task.queue.push_back(submission);
                if task.write_next().await.is_err() {
                    task.fail_all();
                    break;
                }
            }

            line = task.channel.reader.recv() => {
                let Some(line) = line else {
                    debug!("line channel closed");
                    task.fail_all();
                    break;
                };
                if task.handle_line(line).await.is_err() {
                    task.fail_all();
                    break;
                }
            }

            _ = tokio::time::sleep_until(deadline), if task.in_flight.is_some() => {
                task.abandon_in_flight().await;
            }
        }
    }

    task.fail_all();
}

impl EngineTask {
    /// Write the next queued command if the port is free.
    async fn write_next(&mut self) -> Result<(), ()> {
        while self.in_flight.is_none() {
            let Some(submission) = self.queue.pop_front() else {
                return Ok(());
            };
            if submission.reply.is_closed() {
                continue; // caller gave up while queued
            }

            let seq = self.next_seq;
            self.next_seq += 1;
            trace!(seq, command = %submission.command, "write");

            if self.channel.writer.send(submission.command.clone()).await.is_err() {
                let _ = submission.reply.send(Err(AtError::Transport {
                    message: "write channel closed".into(),
                }));
                return Err(());
            }

            self.buffer.clear();
            self.in_flight = Some(InFlight {
                seq,
                command: submission.command,
                reply: submission.reply,
                deadline: Instant::now() + self.options.command_timeout,
            });
        }
        Ok(())
    }

    /// Route one received line: event, echo, payload, or terminal code.
    async fn handle_line(&mut self, line: String) -> Result<(), ()> {
        if let Some(event) = event::classify(&line) {
            trace!(?event, "unsolicited");
            let _ = self.event_tx.send(event);
            return Ok(());
        }

        if let Some(code) = ResultCode::parse(&line) {
            return self.finish(code).await;
        }

        // Local echo of the command we just wrote. Compared byte-wise: a
        // garbled line may not have a char boundary two bytes in.
        let echo = line
            .as_bytes()
            .get(..2)
            .is_some_and(|p| p.eq_ignore_ascii_case(b"AT"));
        if echo {
            return Ok(());
        }
        // Blank separator lines around the payload.
        if line.is_empty() {
            return Ok(());
        }

        self.buffer.push(line);
        Ok(())
    }

    /// A terminal line arrived. If any abandoned command still owes one,
    /// this line settles the oldest of them and the payload is discarded;
    /// otherwise it completes the in-flight command.
    async fn finish(&mut self, code: ResultCode) -> Result<(), ()> {
        if let Some(seq) = self.abandoned.pop_front() {
            debug!(seq, ?code, "discarding response of abandoned command");
            self.buffer.clear();
            return Ok(());
        }

        let Some(flight) = self.in_flight.take() else {
            warn!(?code, "terminal line with no command in flight");
            self.buffer.clear();
            return Ok(());
        };

        let lines = if code == ResultCode::Error {
            self.buffer.clear();
            Vec::new()
        } else {
            std::mem::take(&mut self.buffer)
        };
        trace!(seq = flight.seq, ?code, lines = lines.len(), "complete");
        let _ = flight.reply.send(Ok(CommandResponse { code, lines }));

        self.write_next().await
    }

    /// The in-flight command ran out its window: fail the caller, remember
    /// the sequence number, and free the port for the next command.
    async fn abandon_in_flight(&mut self) {
        let Some(flight) = self.in_flight.take() else {
            return;
        };
        warn!(
            seq = flight.seq,
            command = %flight.command,
            "command timed out, abandoning"
        );
        self.abandoned.push_back(flight.seq);
        self.buffer.clear();
        let _ = flight.reply.send(Err(AtError::Timeout {
            timeout_ms: self.options.command_timeout.as_millis() as u64,
        }));

        if self.write_next().await.is_err() {
            self.fail_all();
        }
    }

    /// Resolve everything outstanding with a closed-engine error.
    fn fail_all(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            let _ = flight.reply.send(Err(AtError::EngineClosed));
        }
        for submission in self.queue.drain(..) {
            let _ = submission.reply.send(Err(AtError::EngineClosed));
        }
    }
}
