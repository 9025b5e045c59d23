//! The caller-facing gateway: serializes commands onto the single physical
//! link, answers reads from the address cache when fresh, chunks oversized
//! reads, and decodes typed values through the descriptor-bound codecs.

use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::MemCache;
use crate::codec::{self, Codec, Value};
use crate::connection;
use crate::datapoint::{DataPoint, EventType};
use crate::fsm;
use crate::protocol::{self, Command, CommandError, CommandKind, CommandResult};

/// Register holding the 8-byte system device identifier.
const SYSTEM_IDENT_ADDRESS: u16 = 0x00f8;
/// How long a command may wait for the engine to accept it.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("event type `{0}` is unknown")]
    NotFound(String),
    #[error("event type `{0}` is not readable")]
    NotReadable(String),
    #[error("event type `{0}` is not writable")]
    NotWritable(String),
    #[error("event type `{0}` does not carry a timestamp")]
    NotAnInstant(String),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Codec(#[from] codec::Error),
}

pub struct Options {
    pub cache_duration: Duration,
    pub allow_p300: bool,
    pub sequence_counter: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            cache_duration: Duration::from_secs(3),
            allow_p300: true,
            sequence_counter: false,
        }
    }
}

/// Everything that must be serialized against the engine: the command
/// channels and the cache they refresh.
struct Gate {
    inbox: mpsc::Sender<Command>,
    outbox: mpsc::Receiver<CommandResult>,
    cache: MemCache,
}

/// One OptoLink device behind one transport.
pub struct Device {
    gate: Mutex<Gate>,
    write_gate: Mutex<()>,
    cache_duration: Duration,
    data_point: DataPoint,
    pub worker: JoinHandle<Result<(), fsm::Error>>,
    cancel: CancellationToken,
}

impl Device {
    pub async fn connect(args: &connection::Args) -> Result<Device, connection::Error> {
        let transport = connection::open(args).await?;
        Ok(Device::from_stream(
            transport,
            Options {
                cache_duration: *args.cache_duration,
                allow_p300: !args.kw_only,
                sequence_counter: args.sequence_counter,
            },
        ))
    }

    /// Builds the full pipeline (byte pump, protocol engine, gateway) on top
    /// of an already-open bidirectional byte stream.
    pub fn from_stream(
        stream: impl AsyncRead + AsyncWrite + Send + Unpin + 'static,
        options: Options,
    ) -> Device {
        let (reader, writer) = tokio::io::split(stream);
        let cancel = CancellationToken::new();
        let (byte_tx, byte_rx) = mpsc::channel(512);
        let (inbox_tx, inbox_rx) = mpsc::channel(1);
        let (outbox_tx, outbox_rx) = mpsc::channel(1);
        tokio::spawn(connection::byte_pump(Box::new(reader), byte_tx, cancel.clone()));
        let engine = fsm::Engine {
            writer: Box::new(writer),
            bytes: byte_rx,
            inbox: inbox_rx,
            outbox: outbox_tx,
            cancel: cancel.clone(),
            allow_p300: options.allow_p300,
            sequence_counter: options.sequence_counter.then_some(0),
        };
        let engine_cancel = cancel.clone();
        let worker = tokio::spawn(async move {
            let result = engine.run().await;
            engine_cancel.cancel();
            result
        });
        Device {
            gate: Mutex::new(Gate {
                inbox: inbox_tx,
                outbox: outbox_rx,
                cache: MemCache::new(),
            }),
            write_gate: Mutex::new(()),
            cache_duration: options.cache_duration,
            data_point: DataPoint::unidentified(),
            worker,
            cancel,
        }
    }

    /// Asks the engine to wind down. [`Device::closed`] resolves once it has.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Resolves when the engine has terminated, cleanly or not. Callers must
    /// stop submitting commands before reconnecting.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    pub fn data_point(&self) -> &DataPoint {
        &self.data_point
    }

    /// Attaches the catalog-derived identity. Must happen before the device
    /// is shared; typed reads and writes resolve names against it.
    pub fn set_data_point(&mut self, data_point: DataPoint) {
        self.data_point = data_point;
    }

    /// Reads the 8-byte system device identifier used for catalog matching.
    /// The identity always comes from the wire, never from the cache.
    pub async fn identify(&self) -> Result<[u8; 8], Error> {
        let cmd = Command::read(CommandKind::P300Read, SYSTEM_IDENT_ADDRESS, 8);
        let result = {
            let mut gate = self.gate.lock().await;
            self.run_command(&mut gate, cmd, false).await
        };
        if let Some(error) = result.error {
            return Err(error.into());
        }
        result.body.as_slice().try_into().map_err(|_| {
            CommandError::LengthMismatch { requested: 8, received: result.body.len() as u8 }.into()
        })
    }

    /// Runs one raw command through cache, chunking and the engine.
    pub async fn raw_cmd(&self, cmd: Command) -> CommandResult {
        let mut gate = self.gate.lock().await;
        self.run_command(&mut gate, cmd, true).await
    }

    /// Runs several raw commands back to back without letting another caller
    /// interleave, for composite read-modify-write sequences.
    pub async fn raw_cmds(&self, cmds: Vec<Command>) -> Vec<CommandResult> {
        let mut gate = self.gate.lock().await;
        let mut results = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            results.push(self.run_command(&mut gate, cmd, true).await);
        }
        results
    }

    async fn run_command(
        &self,
        gate: &mut Gate,
        mut cmd: Command,
        use_cache: bool,
    ) -> CommandResult {
        let now = Instant::now();
        let is_read = cmd.kind.is_read();
        if use_cache && is_read && self.cache_duration > Duration::ZERO && cmd.result_len > 0 {
            if let Some((body, oldest)) =
                gate.cache.lookup(cmd.address, usize::from(cmd.result_len))
            {
                if now.duration_since(oldest) < self.cache_duration {
                    debug!(message = "cache hit", address = cmd.address, len = cmd.result_len);
                    return CommandResult { id: cmd.id, error: None, body };
                }
            }
        }
        if !is_read {
            return Self::submit(gate, cmd).await;
        }

        let id = cmd.id;
        let mut first_error = None;
        let mut body = Vec::with_capacity(usize::from(cmd.result_len));
        let mut remaining = usize::from(cmd.result_len);
        while remaining > 0 {
            let chunk_len = remaining.min(usize::from(protocol::MAX_TELEGRAM_DATA));
            cmd.result_len = chunk_len as u8;
            let chunk = Self::submit(gate, cmd.clone()).await;
            match chunk.error {
                None => gate.cache.store(cmd.address, &chunk.body, now),
                Some(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
            body.extend(chunk.body);
            cmd.address = cmd.address.wrapping_add(u16::from(protocol::MAX_TELEGRAM_DATA));
            remaining -= chunk_len;
        }
        CommandResult { id, error: first_error, body }
    }

    async fn submit(gate: &mut Gate, cmd: Command) -> CommandResult {
        let id = cmd.id;
        match tokio::time::timeout(SUBMIT_TIMEOUT, gate.inbox.send(cmd)).await {
            Err(_) => {
                warn!(message = "the engine did not accept the command in time");
                return CommandResult::failure(id, CommandError::Closed);
            }
            Ok(Err(_)) => return CommandResult::failure(id, CommandError::Closed),
            Ok(Ok(())) => {}
        }
        match gate.outbox.recv().await {
            Some(result) => {
                if result.id != id {
                    warn!(
                        message = "result does not correlate",
                        expected = %id,
                        received = %result.id,
                    );
                }
                result
            }
            None => CommandResult::failure(id, CommandError::Closed),
        }
    }

    /// Reads the named event type and decodes it through its bound codec.
    pub async fn vread(&self, name: &str) -> Result<Value, Error> {
        let _write_gate = self.write_gate.lock().await;
        let et = self.event_type(name)?;
        let kind = et.read_kind.ok_or_else(|| Error::NotReadable(name.to_string()))?;
        let raw = self.read_block(et, kind).await?;
        Ok(et.codec.decode(et, &raw)?)
    }

    /// Encodes `value` into the named event type's block and writes it out.
    /// Fields that do not own their whole block are read back first so the
    /// surrounding bits and bytes survive.
    pub async fn vwrite(&self, name: &str, value: &Value) -> Result<(), Error> {
        let _write_gate = self.write_gate.lock().await;
        let et = self.event_type(name)?;
        let write_kind = et.write_kind.ok_or_else(|| Error::NotWritable(name.to_string()))?;
        let needs_pre_read = et.byte_position > 0 || et.bit_length > 0;
        let read_kind = match et.read_kind {
            Some(kind) => Some(kind),
            None if needs_pre_read => return Err(Error::NotReadable(name.to_string())),
            None => None,
        };

        let mut block = match read_kind {
            Some(kind) => self.read_block(et, kind).await?,
            None => vec![0; usize::from(et.block_length)],
        };
        if block.len() < usize::from(et.block_length) {
            return Err(CommandError::LengthMismatch {
                requested: et.block_length,
                received: block.len() as u8,
            }
            .into());
        }
        et.codec.encode(et, &mut block, value)?;

        let step = u16::from(et.step());
        let block_len = u16::from(et.block_length);
        let mut offset = 0u16;
        while offset < block_len {
            let len = step.min(block_len - offset);
            // A telegram carries at most 32 data bytes; larger steps go out
            // as aligned sub-writes.
            let mut sub = 0u16;
            while sub < len {
                let n = (len - sub).min(u16::from(protocol::MAX_TELEGRAM_DATA));
                let start = usize::from(offset + sub);
                let cmd = Command::write(
                    write_kind,
                    et.address.wrapping_add(offset + sub),
                    block[start..start + usize::from(n)].to_vec(),
                );
                let result = self.raw_cmd(cmd).await;
                if let Some(error) = result.error {
                    return Err(error.into());
                }
                sub += n;
            }
            offset += step;
        }
        Ok(())
    }

    /// Reads the named event type as a calendar instant; only meaningful for
    /// descriptors bound to the BCD date-time codec.
    pub async fn vread_instant(&self, name: &str) -> Result<DateTime<Local>, Error> {
        if self.event_type(name)?.codec != Codec::DateTimeBcd {
            return Err(Error::NotAnInstant(name.to_string()));
        }
        match self.vread(name).await? {
            Value::Instant(t) => Ok(t),
            _ => Err(Error::NotAnInstant(name.to_string())),
        }
    }

    pub async fn vwrite_instant(&self, name: &str, at: DateTime<Local>) -> Result<(), Error> {
        if self.event_type(name)?.codec != Codec::DateTimeBcd {
            return Err(Error::NotAnInstant(name.to_string()));
        }
        self.vwrite(name, &Value::Instant(at)).await
    }

    fn event_type(&self, name: &str) -> Result<&EventType, Error> {
        self.data_point
            .event_types
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Reads a descriptor's whole block, one step per request.
    async fn read_block(&self, et: &EventType, kind: CommandKind) -> Result<Vec<u8>, Error> {
        let step = u16::from(et.step());
        let block_len = u16::from(et.block_length);
        let mut raw = Vec::with_capacity(usize::from(block_len));
        let mut offset = 0u16;
        while offset < block_len {
            let len = step.min(block_len - offset) as u8;
            let cmd = Command::read(kind, et.address.wrapping_add(offset), len);
            let result = self.raw_cmd(cmd).await;
            raw.extend(result.body);
            if let Some(error) = result.error {
                return Err(error.into());
            }
            offset += step;
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ACK, ENQ, EOT, FRAME_START, SOH, SYN};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};

    /// Scripted KW-only peer: emits the poll byte when idle (as the real
    /// device does every ~1.6 s), serves reads from a register bank,
    /// acknowledges writes while logging them, and stays silent on the P300
    /// sync probe so the engine degrades to KW.
    async fn kw_peer(
        stream: DuplexStream,
        registers: Arc<Vec<u8>>,
        served: Arc<AtomicUsize>,
        writes: Arc<StdMutex<Vec<(u16, Vec<u8>)>>>,
    ) {
        let (mut r, mut w) = tokio::io::split(stream);
        let mut b = [0u8; 1];
        loop {
            tokio::select! {
                read = r.read_exact(&mut b) => {
                    if read.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(1600)) => {
                    if w.write_all(&[ENQ]).await.is_err() {
                        return;
                    }
                    continue;
                }
            }
            let request = match b[0] {
                EOT => {
                    let _ = w.write_all(&[ENQ]).await;
                    continue;
                }
                SYN => {
                    // Swallow the two NULs and never acknowledge.
                    let mut nuls = [0u8; 2];
                    let _ = r.read_exact(&mut nuls).await;
                    continue;
                }
                SOH => {
                    if r.read_exact(&mut b).await.is_err() {
                        return;
                    }
                    b[0]
                }
                // A chained request arrives without a fresh SOH.
                0xf7 | 0xf4 => b[0],
                _ => continue,
            };
            let mut header = [0u8; 3];
            if r.read_exact(&mut header).await.is_err() {
                return;
            }
            let address = u16::from_be_bytes([header[0], header[1]]);
            let len = usize::from(header[2]);
            served.fetch_add(1, Ordering::SeqCst);
            if request == 0xf7 {
                let start = usize::from(address);
                let _ = w.write_all(&registers[start..start + len]).await;
            } else {
                let mut args = vec![0; len];
                if r.read_exact(&mut args).await.is_err() {
                    return;
                }
                writes.lock().unwrap().push((address, args));
                let _ = w.write_all(&[0x00]).await;
            }
        }
    }

    type WriteLog = Arc<StdMutex<Vec<(u16, Vec<u8>)>>>;

    fn spawn_kw_peer(server: DuplexStream, registers: Arc<Vec<u8>>) -> (Arc<AtomicUsize>, WriteLog) {
        let served = Arc::new(AtomicUsize::new(0));
        let writes: WriteLog = Arc::new(StdMutex::new(Vec::new()));
        tokio::spawn(kw_peer(server, registers, served.clone(), writes.clone()));
        (served, writes)
    }

    /// Scripted P300 peer: completes the reset/sync handshake, acknowledges
    /// telegrams, logs each request frame and answers with the next canned
    /// response.
    async fn p300_peer(
        stream: DuplexStream,
        responses: Vec<Vec<u8>>,
        requests: Arc<StdMutex<Vec<Vec<u8>>>>,
    ) {
        let (mut r, mut w) = tokio::io::split(stream);
        let mut responses = responses.into_iter();
        let mut b = [0u8; 1];
        loop {
            if r.read_exact(&mut b).await.is_err() {
                return;
            }
            match b[0] {
                EOT => {
                    // One poll byte ends the reset, the next one triggers the
                    // sync probe.
                    let _ = w.write_all(&[ENQ, ENQ]).await;
                }
                SYN => {
                    let mut nuls = [0u8; 2];
                    if r.read_exact(&mut nuls).await.is_err() {
                        return;
                    }
                    let _ = w.write_all(&[ACK]).await;
                }
                FRAME_START => {
                    if r.read_exact(&mut b).await.is_err() {
                        return;
                    }
                    let len = usize::from(b[0]);
                    let mut rest = vec![0; len + 1];
                    if r.read_exact(&mut rest).await.is_err() {
                        return;
                    }
                    let mut frame = vec![FRAME_START, len as u8];
                    frame.extend_from_slice(&rest);
                    requests.lock().unwrap().push(frame);
                    let _ = w.write_all(&[ACK]).await;
                    if let Some(response) = responses.next() {
                        let _ = w.write_all(&response).await;
                    }
                }
                // The engine's telegram acknowledge, among others.
                _ => {}
            }
        }
    }

    fn no_cache() -> Options {
        Options { cache_duration: Duration::ZERO, ..Options::default() }
    }

    // Answer to an 8-byte read of the system identifier: length 0x0d covers
    // the 5 header bytes plus the data, the trailing byte is the mod-256 sum.
    const IDENT_RESPONSE: [u8; 16] = [
        0x41, 0x0d, 0x01, 0x01, 0x00, 0xf8, 0x08, 0x20, 0x92, 0x01, 0x07, 0x00, 0x00, 0x01,
        0x5a, 0x24,
    ];

    #[tokio::test(start_paused = true)]
    async fn p300_read_round_trip() {
        let (client, server) = tokio::io::duplex(256);
        let requests = Arc::new(StdMutex::new(Vec::new()));
        tokio::spawn(p300_peer(server, vec![IDENT_RESPONSE.to_vec()], requests.clone()));

        let device = Device::from_stream(client, no_cache());
        let result = device.raw_cmd(Command::read(CommandKind::P300Read, 0x00f8, 8)).await;
        assert_eq!(result.error, None);
        assert_eq!(result.body, [0x20, 0x92, 0x01, 0x07, 0x00, 0x00, 0x01, 0x5a]);
        assert_eq!(
            requests.lock().unwrap()[0],
            [0x41, 0x05, 0x00, 0x01, 0x00, 0xf8, 0x08, 0x06]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn p300_write_reports_accepted_bytes() {
        let (client, server) = tokio::io::duplex(256);
        let requests = Arc::new(StdMutex::new(Vec::new()));
        // A write is answered with the request header echoed back, the count
        // field holding the number of bytes accepted.
        let response = vec![0x41, 0x05, 0x01, 0x02, 0x23, 0x23, 0x01, 0x4f];
        tokio::spawn(p300_peer(server, vec![response], requests.clone()));

        let device = Device::from_stream(client, no_cache());
        let result = device
            .raw_cmd(Command::write(CommandKind::P300Write, 0x2323, vec![0x01]))
            .await;
        assert_eq!(result.error, None);
        assert_eq!(result.body, [0x01]);
        assert_eq!(
            requests.lock().unwrap()[0],
            [0x41, 0x06, 0x00, 0x02, 0x23, 0x23, 0x01, 0x01, 0x51]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_corrupted_telegram_is_an_error_but_not_fatal() {
        let (client, server) = tokio::io::duplex(256);
        let requests = Arc::new(StdMutex::new(Vec::new()));
        let mut corrupted = IDENT_RESPONSE.to_vec();
        *corrupted.last_mut().unwrap() = 0x00;
        tokio::spawn(p300_peer(
            server,
            vec![corrupted, IDENT_RESPONSE.to_vec()],
            requests.clone(),
        ));

        let device = Device::from_stream(client, no_cache());
        let first = device.raw_cmd(Command::read(CommandKind::P300Read, 0x00f8, 8)).await;
        assert_eq!(
            first.error,
            Some(CommandError::Crc { calculated: 0x24, received: 0x00 })
        );
        assert_eq!(first.body, Vec::<u8>::new());

        // The session survives; the next exchange succeeds.
        let second = device.raw_cmd(Command::read(CommandKind::P300Read, 0x00f8, 8)).await;
        assert_eq!(second.error, None);
        assert_eq!(second.body, [0x20, 0x92, 0x01, 0x07, 0x00, 0x00, 0x01, 0x5a]);
    }

    #[tokio::test(start_paused = true)]
    async fn identify_reads_the_system_identifier() {
        let (client, server) = tokio::io::duplex(256);
        let requests = Arc::new(StdMutex::new(Vec::new()));
        tokio::spawn(p300_peer(server, vec![IDENT_RESPONSE.to_vec()], requests.clone()));

        let device = Device::from_stream(client, no_cache());
        let ident = device.identify().await.unwrap();
        assert_eq!(ident, [0x20, 0x92, 0x01, 0x07, 0x00, 0x00, 0x01, 0x5a]);
    }

    fn kw_registers() -> Arc<Vec<u8>> {
        let mut registers = vec![0u8; 0x3000];
        registers[0x0886] = 0x4e;
        registers[0x0887] = 0x20;
        for (i, slot) in registers[0x1000..0x1100].iter_mut().enumerate() {
            *slot = i as u8;
        }
        // A weekly schedule block: day 0 switches 06h10..08h00, the rest
        // unset.
        for slot in registers[0x1800..0x1838].iter_mut() {
            *slot = 0xff;
        }
        registers[0x1800] = 6 << 3 | 1;
        registers[0x1801] = 8 << 3;
        registers[0x2301] = 0xaa;
        registers[0x2302] = 0xbb;
        Arc::new(registers)
    }

    #[tokio::test(start_paused = true)]
    async fn kw_read_after_p300_degradation() {
        let (client, server) = tokio::io::duplex(256);
        let _peer = spawn_kw_peer(server, kw_registers());

        // The peer never acknowledges the sync probe, so the engine falls
        // back to the polled protocol on its own.
        let device = Device::from_stream(client, no_cache());
        let result = device.raw_cmd(Command::read(CommandKind::KwRead, 0x0886, 2)).await;
        assert_eq!(result.error, None);
        assert_eq!(result.body, [0x4e, 0x20]);
    }

    #[tokio::test(start_paused = true)]
    async fn kw_write_reports_accepted_bytes() {
        let (client, server) = tokio::io::duplex(256);
        let (_, writes) = spawn_kw_peer(server, kw_registers());

        let device = Device::from_stream(
            client,
            Options { allow_p300: false, ..no_cache() },
        );
        let result = device
            .raw_cmd(Command::write(CommandKind::KwWrite, 0x2323, vec![0x01]))
            .await;
        assert_eq!(result.error, None);
        assert_eq!(result.body, [0x01]);
        assert_eq!(*writes.lock().unwrap(), [(0x2323, vec![0x01])]);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_cache_entries_answer_without_the_wire() {
        let (client, server) = tokio::io::duplex(256);
        let (served, _) = spawn_kw_peer(server, kw_registers());

        let device = Device::from_stream(
            client,
            Options {
                allow_p300: false,
                cache_duration: Duration::from_secs(60),
                ..Options::default()
            },
        );
        let first = device.raw_cmd(Command::read(CommandKind::KwRead, 0x0886, 2)).await;
        let second = device.raw_cmd(Command::read(CommandKind::KwRead, 0x0886, 2)).await;
        assert_eq!(first.error, None);
        assert_eq!(first.body, second.body);
        assert_eq!(served.load(Ordering::SeqCst), 1, "the second read must be a cache hit");

        // Past the freshness window the gateway goes back to the wire.
        tokio::time::advance(Duration::from_secs(61)).await;
        let third = device.raw_cmd(Command::read(CommandKind::KwRead, 0x0886, 2)).await;
        assert_eq!(third.error, None);
        assert_eq!(third.body, first.body);
        assert_eq!(served.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_reads_are_chunked_at_32_bytes() {
        let (client, server) = tokio::io::duplex(256);
        let registers = kw_registers();
        let (served, _) = spawn_kw_peer(server, registers.clone());

        let device = Device::from_stream(
            client,
            Options { allow_p300: false, ..no_cache() },
        );
        let result = device.raw_cmd(Command::read(CommandKind::KwRead, 0x1000, 100)).await;
        assert_eq!(result.error, None);
        assert_eq!(result.body, registers[0x1000..0x1064]);
        assert_eq!(served.load(Ordering::SeqCst), 4, "100 bytes travel as 32+32+32+4");

        // The same span read in explicit chunks concatenates identically.
        let explicit = device
            .raw_cmds(vec![
                Command::read(CommandKind::KwRead, 0x1000, 32),
                Command::read(CommandKind::KwRead, 0x1020, 32),
                Command::read(CommandKind::KwRead, 0x1040, 32),
                Command::read(CommandKind::KwRead, 0x1060, 4),
            ])
            .await;
        let joined: Vec<u8> = explicit.into_iter().flat_map(|r| r.body).collect();
        assert_eq!(joined, result.body);
    }

    #[tokio::test(start_paused = true)]
    async fn a_closed_device_reports_closed() {
        let (client, server) = tokio::io::duplex(256);
        let _peer = spawn_kw_peer(server, kw_registers());

        let device = Device::from_stream(
            client,
            Options { allow_p300: false, ..no_cache() },
        );
        device.close();
        device.closed().await;
        let result = device.raw_cmd(Command::read(CommandKind::KwRead, 0x0886, 2)).await;
        assert_eq!(result.error, Some(CommandError::Closed));
    }

    fn test_descriptor(name: &str, address: u16, codec: Codec) -> EventType {
        EventType {
            name: name.to_string(),
            address,
            description: String::new(),
            read_kind: Some(CommandKind::P300Read),
            write_kind: Some(CommandKind::P300Write),
            parameter: crate::datapoint::Parameter::Plain,
            prefix_read: Vec::new(),
            prefix_write: Vec::new(),
            block_length: 1,
            block_factor: 0,
            mapping_type: 0,
            byte_position: 0,
            byte_length: 1,
            bit_position: 0,
            bit_length: 0,
            factory_setting: String::new(),
            conversion: crate::datapoint::Conversion::NoConversion,
            factor: 1.0,
            offset: 0.0,
            lower_border: 0.0,
            upper_border: 0.0,
            stepping: 0.0,
            value_list: String::new(),
            unit: String::new(),
            codec,
        }
    }

    fn kw_device_with(
        client: DuplexStream,
        descriptors: Vec<EventType>,
    ) -> Device {
        let mut device = Device::from_stream(
            client,
            Options { allow_p300: false, ..no_cache() },
        );
        let mut data_point = DataPoint::unidentified();
        for et in descriptors {
            data_point.event_types.insert(et.name.clone(), et);
        }
        device.set_data_point(data_point);
        device
    }

    #[tokio::test(start_paused = true)]
    async fn vread_decodes_through_the_descriptor() {
        let (client, server) = tokio::io::duplex(256);
        let _peer = spawn_kw_peer(server, kw_registers());

        let mut temperature = test_descriptor("BoilerTemp", 0x0886, Codec::DivMulOffset);
        temperature.block_length = 2;
        temperature.byte_length = 2;
        temperature.factor = 0.1;
        let device = kw_device_with(client, vec![temperature]);

        let Value::Float(v) = device.vread("BoilerTemp").await.unwrap() else {
            panic!("expected a float")
        };
        assert!((v - 827.0).abs() < 0.01, "0x204e * 0.1, little-endian");

        assert!(matches!(device.vread("NoSuchThing").await, Err(Error::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn vread_steps_through_block_factors() {
        let (client, server) = tokio::io::duplex(256);
        let (served, _) = spawn_kw_peer(server, kw_registers());

        let mut timer = test_descriptor("HeatingTimerMo", 0x1800, Codec::MappingTime53);
        timer.block_length = 56;
        timer.block_factor = 7;
        timer.byte_length = 0;
        timer.mapping_type = 1;
        let device = kw_device_with(client, vec![timer]);

        let Value::Schedule(days) = device.vread("HeatingTimerMo").await.unwrap() else {
            panic!("expected a schedule")
        };
        assert_eq!(days.len(), 7);
        assert_eq!(days[0][0].to_string(), "06h10 .. 08h00");
        assert!(days[1..].iter().all(|day| day.is_empty()));
        assert_eq!(served.load(Ordering::SeqCst), 7, "one request per 8-byte sub-block");
    }

    #[tokio::test(start_paused = true)]
    async fn vwrite_preserves_the_surrounding_block() {
        let (client, server) = tokio::io::duplex(256);
        let (_, writes) = spawn_kw_peer(server, kw_registers());

        let mut level = test_descriptor("PartyLevel", 0x2301, Codec::DivMulOffset);
        level.block_length = 2;
        level.byte_position = 1;
        level.byte_length = 1;
        let device = kw_device_with(client, vec![level]);

        device.vwrite("PartyLevel", &Value::Float(7.0)).await.unwrap();
        // The pre-read byte at position 0 survives the read-modify-write.
        assert_eq!(*writes.lock().unwrap(), [(0x2301, vec![0xaa, 0x07])]);
    }

    #[tokio::test(start_paused = true)]
    async fn direction_checks_come_before_the_wire() {
        let (client, server) = tokio::io::duplex(256);
        let _peer = spawn_kw_peer(server, kw_registers());

        let mut read_only = test_descriptor("ReadOnly", 0x0886, Codec::DivMulOffset);
        read_only.write_kind = None;
        let mut blind_bits = test_descriptor("BlindBits", 0x2301, Codec::ValueList);
        blind_bits.read_kind = None;
        blind_bits.bit_position = 2;
        blind_bits.bit_length = 2;
        let device = kw_device_with(client, vec![read_only, blind_bits]);

        assert!(matches!(
            device.vwrite("ReadOnly", &Value::Float(1.0)).await,
            Err(Error::NotWritable(_))
        ));
        // A bit field cannot be written without reading the block back
        // first.
        assert!(matches!(
            device.vwrite("BlindBits", &Value::Int(1)).await,
            Err(Error::NotReadable(_))
        ));
    }
}
