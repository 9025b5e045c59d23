//! The link-layer protocol engine: one task driving the OptoLink through
//! session establishment, keepalive, request-reply and error recovery, in
//! either the polled KW protocol or the framed P300 protocol.

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::encode_hex;
use crate::protocol::{self, Command, CommandError, CommandKind, CommandResult};

pub(crate) type TransportWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Maximum gap between two bytes of one reply.
const BYTE_GAP: Duration = Duration::from_millis(40);
/// How recent the last KW poll byte must be for a request to go out without
/// waiting for the next one. The device polls roughly every 1.6 s.
const ENQ_FRESHNESS: Duration = Duration::from_millis(1500);
/// P300 keepalive interval.
const SYNC_INTERVAL: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not write to the transport")]
    Write(#[source] std::io::Error),
    #[error("the transport byte stream ended unexpectedly")]
    ByteStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unknown,
    Reset,
    ResetAck,
    #[allow(dead_code)]
    ResetP300,
    #[allow(dead_code)]
    ResetP300Ack,
    Idle,
    SendKwStart,
    SendKw,
    RecvKw,
    SwP300,
    WaitAck,
    Wait,
    SendP300,
    SendP300Ack,
    RecvP300,
    RecvP300Ack,
    #[allow(dead_code)]
    RecvP300Nak,
}

/// Outcome of a byte-sequence read that did not complete.
enum Recv {
    Timeout { received: usize, expected: usize },
    Closed,
}

/// Reads exactly `n` bytes off the byte channel. Gives up once more than two
/// consecutive inter-byte gaps pass after the reply has started, or when the
/// overall budget of `150 + n` gaps elapses.
async fn wait_for_bytes(bytes: &mut mpsc::Receiver<u8>, n: usize) -> Result<Vec<u8>, Recv> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut buf = Vec::with_capacity(n);
    let mut consecutive_timeouts = 0usize;
    let mut total_timeouts = 0usize;
    loop {
        match tokio::time::timeout(BYTE_GAP, bytes.recv()).await {
            Ok(Some(b)) => {
                buf.push(b);
                consecutive_timeouts = 0;
                if buf.len() == n {
                    return Ok(buf);
                }
            }
            Ok(None) => return Err(Recv::Closed),
            Err(_) => {
                consecutive_timeouts += 1;
                total_timeouts += 1;
                if (consecutive_timeouts > 2 && !buf.is_empty()) || total_timeouts > 150 + n {
                    return Err(Recv::Timeout { received: buf.len(), expected: n });
                }
            }
        }
    }
}

pub(crate) struct Engine {
    pub writer: TransportWriter,
    pub bytes: mpsc::Receiver<u8>,
    pub inbox: mpsc::Receiver<Command>,
    pub outbox: mpsc::Sender<CommandResult>,
    pub cancel: CancellationToken,
    /// Whether the P300 probe is attempted at all; degrades to `false` after
    /// three unanswered sync sequences.
    pub allow_p300: bool,
    /// 3-bit telegram sequence counter, off by default.
    pub sequence_counter: Option<u8>,
}

impl Engine {
    pub(crate) async fn run(mut self) -> Result<(), Error> {
        let result = self.drive().await;
        if self.cancel.is_cancelled() {
            debug!(message = "protocol engine stopped, transport closed");
            return Ok(());
        }
        match &result {
            Ok(()) => debug!(message = "protocol engine stopped, callers gone"),
            Err(e) => warn!(message = "protocol engine failed", error = %e),
        }
        result
    }

    async fn drive(&mut self) -> Result<(), Error> {
        let mut state = State::Unknown;
        let mut came_from = State::Unknown;
        let mut last_syn = Instant::now();
        let mut last_enq = Instant::now();
        let mut fail_count = 0u32;
        let mut can_p300 = self.allow_p300;
        let mut pending: Option<Command> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let next = match state {
                State::Unknown => State::Reset,
                State::Reset => {
                    self.write(&[protocol::EOT]).await?;
                    State::ResetAck
                }
                State::ResetAck | State::ResetP300Ack => {
                    match wait_for_bytes(&mut self.bytes, 1).await {
                        Ok(b) if b[0] == protocol::ENQ || b[0] == protocol::ACK => {
                            last_enq = Instant::now();
                            fail_count = 0;
                            State::Idle
                        }
                        Ok(b) => {
                            warn!(message = "unexpected byte after reset", byte = b[0]);
                            fail_count += 1;
                            if fail_count < 3 { State::Reset } else { state }
                        }
                        Err(Recv::Closed) => return Err(Error::ByteStream),
                        Err(Recv::Timeout { .. }) => {
                            fail_count += 1;
                            if fail_count < 3 { State::Reset } else { state }
                        }
                    }
                }
                State::ResetP300 => {
                    self.write(&[protocol::EOT]).await?;
                    State::ResetP300Ack
                }
                State::Idle => {
                    if can_p300 {
                        match wait_for_bytes(&mut self.bytes, 1).await {
                            Ok(b) if b[0] == protocol::ENQ => {
                                last_enq = Instant::now();
                                fail_count = 0;
                                State::SwP300
                            }
                            Ok(_) => State::Reset,
                            Err(Recv::Closed) => return Err(Error::ByteStream),
                            Err(Recv::Timeout { .. }) => {
                                fail_count += 1;
                                State::Reset
                            }
                        }
                    } else {
                        if pending.is_none() {
                            pending = self.inbox.try_recv().ok();
                        }
                        if pending.is_some() {
                            if last_enq.elapsed() > ENQ_FRESHNESS {
                                // The poll byte is stale; wait for a fresh one
                                // before talking.
                                match wait_for_bytes(&mut self.bytes, 1).await {
                                    Ok(b) if b[0] == protocol::ENQ => {
                                        last_enq = Instant::now();
                                        fail_count = 0;
                                        State::SendKwStart
                                    }
                                    Ok(_) => State::Reset,
                                    Err(Recv::Closed) => return Err(Error::ByteStream),
                                    Err(Recv::Timeout { .. }) => {
                                        fail_count += 1;
                                        State::Reset
                                    }
                                }
                            } else {
                                State::SendKwStart
                            }
                        } else {
                            match wait_for_bytes(&mut self.bytes, 1).await {
                                Ok(b) if b[0] == protocol::ENQ => {
                                    last_enq = Instant::now();
                                    fail_count = 0;
                                    State::Idle
                                }
                                Ok(_) => State::Reset,
                                Err(Recv::Closed) => return Err(Error::ByteStream),
                                Err(Recv::Timeout { .. }) => {
                                    fail_count += 1;
                                    State::Reset
                                }
                            }
                        }
                    }
                }
                State::SendKwStart => {
                    if came_from != State::RecvKw {
                        self.write(&[protocol::SOH]).await?;
                    }
                    State::SendKw
                }
                State::SendKw => match pending.take() {
                    None => State::Idle,
                    Some(mut cmd) => match protocol::kw_frame(&mut cmd) {
                        Ok(frame) => {
                            self.write(&frame).await?;
                            pending = Some(cmd);
                            State::RecvKw
                        }
                        Err(e) => {
                            self.emit(CommandResult::failure(cmd.id, e)).await;
                            State::Idle
                        }
                    },
                },
                State::RecvKw => match pending.take() {
                    None => State::Idle,
                    Some(cmd) => {
                        match wait_for_bytes(&mut self.bytes, cmd.result_len as usize).await {
                            Err(Recv::Closed) => return Err(Error::ByteStream),
                            Err(Recv::Timeout { received, expected }) => {
                                let error = CommandError::Timeout { received, expected };
                                self.emit(CommandResult::failure(cmd.id, error)).await;
                                State::Idle
                            }
                            Ok(body) => {
                                if cmd.kind == CommandKind::KwWrite
                                    && body.first() != Some(&0x00)
                                {
                                    let error = CommandError::Frame(format!(
                                        "kw write status {}, expected 00",
                                        encode_hex(&body)
                                    ));
                                    self.emit(CommandResult::failure(cmd.id, error)).await;
                                    State::Idle
                                } else {
                                    let body = if cmd.kind == CommandKind::KwWrite {
                                        vec![cmd.args.len() as u8]
                                    } else {
                                        body
                                    };
                                    self.emit(CommandResult { id: cmd.id, error: None, body })
                                        .await;
                                    last_enq = Instant::now();
                                    // Chain a queued command into the same
                                    // poll cycle.
                                    match self.inbox.try_recv() {
                                        Ok(next) => {
                                            pending = Some(next);
                                            State::SendKwStart
                                        }
                                        Err(_) => State::Idle,
                                    }
                                }
                            }
                        }
                    }
                },
                State::SwP300 => {
                    self.write(&[protocol::SYN, protocol::NUL, protocol::NUL]).await?;
                    State::WaitAck
                }
                State::WaitAck => match wait_for_bytes(&mut self.bytes, 1).await {
                    Ok(b) if b[0] == protocol::ACK => {
                        fail_count = 0;
                        last_syn = Instant::now();
                        State::Wait
                    }
                    Err(Recv::Closed) => return Err(Error::ByteStream),
                    _ => {
                        fail_count += 1;
                        if fail_count < 3 {
                            State::SwP300
                        } else {
                            debug!(message = "no sync acknowledge, degrading to kw");
                            can_p300 = false;
                            State::Reset
                        }
                    }
                },
                State::Wait => {
                    if last_syn.elapsed() > SYNC_INTERVAL {
                        State::SwP300
                    } else if pending.is_some() {
                        State::SendP300
                    } else {
                        // A pending command outranks the keepalive; a
                        // spurious byte forces a reset.
                        tokio::select! {
                            biased;
                            cmd = self.inbox.recv() => match cmd {
                                Some(cmd) => {
                                    pending = Some(cmd);
                                    State::SendP300
                                }
                                None => return Ok(()),
                            },
                            byte = self.bytes.recv() => match byte {
                                Some(b) => {
                                    debug!(message = "spurious byte while synchronized", byte = b);
                                    State::Reset
                                }
                                None => return Err(Error::ByteStream),
                            },
                            _ = tokio::time::sleep_until(last_syn + SYNC_INTERVAL) => State::SwP300,
                        }
                    }
                }
                State::SendP300 => match pending.take() {
                    None => State::Wait,
                    Some(mut cmd) => {
                        match protocol::p300_frame(&mut cmd, &mut self.sequence_counter) {
                            Ok(frame) => {
                                self.write(&frame).await?;
                                pending = Some(cmd);
                                State::SendP300Ack
                            }
                            Err(e) => {
                                self.emit(CommandResult::failure(cmd.id, e)).await;
                                State::Wait
                            }
                        }
                    }
                },
                State::SendP300Ack => match pending.take() {
                    None => State::Wait,
                    Some(cmd) => match wait_for_bytes(&mut self.bytes, 1).await {
                        Err(Recv::Closed) => return Err(Error::ByteStream),
                        Err(Recv::Timeout { received, expected }) => {
                            let error = CommandError::Timeout { received, expected };
                            self.emit(CommandResult::failure(cmd.id, error)).await;
                            State::Wait
                        }
                        Ok(b) if b[0] == protocol::ACK => {
                            pending = Some(cmd);
                            State::RecvP300
                        }
                        Ok(b) if b[0] == protocol::NAK => {
                            let error =
                                CommandError::Frame("the peer rejected the telegram".to_string());
                            self.emit(CommandResult::failure(cmd.id, error)).await;
                            State::Wait
                        }
                        Ok(b) => {
                            let error = CommandError::Frame(format!(
                                "expected ACK or NAK, received {:#04x}",
                                b[0]
                            ));
                            self.emit(CommandResult::failure(cmd.id, error)).await;
                            State::Wait
                        }
                    },
                },
                State::RecvP300 => match pending.take() {
                    None => State::Wait,
                    Some(cmd) => self.recv_p300(cmd).await?,
                },
                State::RecvP300Ack => {
                    self.write(&[protocol::ACK]).await?;
                    State::Wait
                }
                State::RecvP300Nak => {
                    self.write(&[protocol::NAK]).await?;
                    State::Wait
                }
            };
            if next != state {
                trace!(message = "state change", from = ?state, to = ?next);
            }
            came_from = state;
            state = next;
        }
    }

    /// Receives and validates one answer telegram and emits the result for
    /// `cmd`. A truncated or misaligned header is severe and resets the
    /// session; validation failures after a complete read acknowledge the
    /// telegram and carry the error in the result.
    async fn recv_p300(&mut self, cmd: Command) -> Result<State, Error> {
        let header = match wait_for_bytes(&mut self.bytes, 2).await {
            Ok(h) => h,
            Err(Recv::Closed) => return Err(Error::ByteStream),
            Err(Recv::Timeout { .. }) => {
                let error =
                    CommandError::Frame("could not read the telegram start and length".to_string());
                self.emit(CommandResult::failure(cmd.id, error)).await;
                return Ok(State::Reset);
            }
        };
        if header[0] != protocol::FRAME_START {
            let error = CommandError::Frame(format!(
                "telegram start byte {:#04x}, expected 0x41",
                header[0]
            ));
            self.emit(CommandResult::failure(cmd.id, error)).await;
            return Ok(State::Reset);
        }
        let length = usize::from(header[1]);
        let rest = match wait_for_bytes(&mut self.bytes, length + 1).await {
            Ok(r) => r,
            Err(Recv::Closed) => return Err(Error::ByteStream),
            Err(Recv::Timeout { received, expected }) => {
                let error = CommandError::Timeout { received, expected };
                self.emit(CommandResult::failure(cmd.id, error)).await;
                return Ok(State::Reset);
            }
        };
        if length < 5 {
            let error = CommandError::Frame(format!("telegram length {length} is too short"));
            self.emit(CommandResult::failure(cmd.id, error)).await;
            return Ok(State::Reset);
        }

        // telegram = {length, answer, command, addr hi, addr lo, count, data…, crc}
        let mut telegram = Vec::with_capacity(length + 2);
        telegram.push(header[1]);
        telegram.extend_from_slice(&rest);

        let answer = telegram[1];
        if answer != 0x01 && answer != 0x03 {
            let error =
                CommandError::Frame(format!("telegram answer type {answer:#04x}, expected 0x01"));
            self.emit(CommandResult::failure(cmd.id, error)).await;
            return Ok(State::RecvP300Ack);
        }
        // Mask off the sequence counter bits some peers fold into the echo.
        if telegram[2] & 0x1f != cmd.kind.code() & 0x1f {
            let error = CommandError::Frame(format!(
                "telegram echoes command {:#04x}, expected {:#04x}",
                telegram[2],
                cmd.kind.code()
            ));
            self.emit(CommandResult::failure(cmd.id, error)).await;
            return Ok(State::RecvP300Ack);
        }
        let crc_received = telegram[telegram.len() - 1];
        let crc_calculated = protocol::crc8(&telegram[..telegram.len() - 1]);
        if crc_received != crc_calculated {
            let error = CommandError::Crc { calculated: crc_calculated, received: crc_received };
            self.emit(CommandResult::failure(cmd.id, error)).await;
            return Ok(State::RecvP300Ack);
        }

        let mut error = (answer == 0x03).then_some(CommandError::ErrorTelegram);
        if telegram[5] != cmd.result_len {
            error = Some(CommandError::LengthMismatch {
                requested: cmd.result_len,
                received: telegram[5],
            });
        }
        let body = if cmd.kind == CommandKind::P300Write {
            // A write answers with the number of bytes accepted.
            vec![telegram[5]]
        } else {
            telegram[6..telegram.len() - 1].to_vec()
        };
        self.emit(CommandResult { id: cmd.id, error, body }).await;
        Ok(State::RecvP300Ack)
    }

    async fn emit(&mut self, result: CommandResult) {
        trace!(
            message = "command result",
            id = %result.id,
            error = ?result.error,
            body = %encode_hex(&result.body),
        );
        if self.outbox.send(result).await.is_err() {
            debug!(message = "dropping a result, the gateway is gone");
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        trace!(message = "writing", bytes = %encode_hex(bytes));
        self.writer.write_all(bytes).await.map_err(Error::Write)?;
        self.writer.flush().await.map_err(Error::Write)
    }
}
