use uuid::Uuid;

// Control bytes shared by the KW and P300 link protocols.
pub const NUL: u8 = 0x00;
pub const SOH: u8 = 0x01;
pub const EOT: u8 = 0x04;
pub const ENQ: u8 = 0x05;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const SYN: u8 = 0x16;
pub const FRAME_START: u8 = 0x41;

/// Longest data run a single telegram can carry.
pub const MAX_TELEGRAM_DATA: u8 = 32;

/// Command kinds as they appear on the wire (and in the Vitosoft catalogs).
///
/// Only the P300 and KW kinds are ever emitted. The remaining kinds belong to
/// the GWG and KM-Bus command sets and are kept for read/write
/// classification of catalog records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[repr(u8)]
pub enum CommandKind {
    P300Read = 0x01,
    P300Write = 0x02,
    P300FunctionCall = 0x07,
    KwRead = 0xf7,
    KwWrite = 0xf4,
    VirtualRead = 0xc7,
    VirtualWrite = 0xc4,
    PhysicalRead = 0xcb,
    PhysicalWrite = 0xc8,
    EepromRead = 0xae,
    EepromWrite = 0xad,
    PhysicalXramRead = 0xc5,
    PhysicalXramWrite = 0xc3,
    PhysicalPortRead = 0x6e,
    PhysicalPortWrite = 0x6d,
    PhysicalBeRead = 0x9e,
    PhysicalBeWrite = 0x9d,
    KmbusRamRead = 0x33,
    KmbusEepromRead = 0x43,
}

impl CommandKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_read(self) -> bool {
        use CommandKind::*;
        match self {
            P300Read | KwRead | VirtualRead | PhysicalRead | EepromRead | PhysicalXramRead
            | PhysicalPortRead | PhysicalBeRead | KmbusRamRead | KmbusEepromRead => true,
            // Vendor protocol extensions keep the base kind in the low 5 bits.
            other => other.code() & 0x1f == P300Read.code(),
        }
    }

    pub fn is_write(self) -> bool {
        use CommandKind::*;
        match self {
            P300Write | KwWrite | VirtualWrite | PhysicalWrite | EepromWrite
            | PhysicalXramWrite | PhysicalPortWrite | PhysicalBeWrite => true,
            other => other.code() & 0x1f == P300Write.code(),
        }
    }
}

/// One read or write intent against the device's register address space.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: Uuid,
    pub kind: CommandKind,
    pub address: u16,
    pub args: Vec<u8>,
    pub result_len: u8,
}

impl Command {
    pub fn read(kind: CommandKind, address: u16, result_len: u8) -> Command {
        Command { id: Uuid::new_v4(), kind, address, args: Vec::new(), result_len }
    }

    pub fn write(kind: CommandKind, address: u16, args: Vec<u8>) -> Command {
        let result_len = args.len() as u8;
        Command { id: Uuid::new_v4(), kind, address, args, result_len }
    }
}

/// The outcome of exactly one [`Command`].
///
/// `ErrorTelegram` and `LengthMismatch` deliver the received body alongside
/// the error; every other error leaves the body empty.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub id: Uuid,
    pub error: Option<CommandError>,
    pub body: Vec<u8>,
}

impl CommandResult {
    pub(crate) fn failure(id: Uuid, error: CommandError) -> CommandResult {
        CommandResult { id, error: Some(error), body: Vec::new() }
    }
}

/// Errors a command can come back with.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("{0}")]
    Unsupported(String),
    #[error("frame error: {0}")]
    Frame(String),
    #[error("crc mismatch: calculated {calculated:#04x}, received {received:#04x}")]
    Crc { calculated: u8, received: u8 },
    #[error("length mismatch: requested {requested} bytes, peer reports {received}")]
    LengthMismatch { requested: u8, received: u8 },
    #[error("the peer answered with an error telegram")]
    ErrorTelegram,
    #[error("timed out after receiving {received} of {expected} bytes")]
    Timeout { received: usize, expected: usize },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("the protocol engine is gone")]
    Closed,
}

/// CRC-8 as used by P300 telegrams: a plain sum modulo 256.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |crc, b| crc.wrapping_add(*b))
}

/// Builds the KW request bytes for `cmd`, normalizing P300 kinds to their KW
/// counterparts. The leading `SOH` is not part of the frame; the engine sends
/// it separately when starting a poll cycle.
pub(crate) fn kw_frame(cmd: &mut Command) -> Result<Vec<u8>, CommandError> {
    cmd.kind = match cmd.kind {
        CommandKind::P300Read => CommandKind::KwRead,
        CommandKind::P300Write => CommandKind::KwWrite,
        other => other,
    };
    let [hi, lo] = cmd.address.to_be_bytes();
    match cmd.kind {
        CommandKind::KwRead => Ok(vec![cmd.kind.code(), hi, lo, cmd.result_len]),
        CommandKind::KwWrite => {
            // The device answers a KW write with a single status byte.
            cmd.result_len = 1;
            let mut frame = vec![cmd.kind.code(), hi, lo, cmd.args.len() as u8];
            frame.extend_from_slice(&cmd.args);
            Ok(frame)
        }
        other => Err(CommandError::Unsupported(format!(
            "command kind {other:?} cannot be sent over the KW link"
        ))),
    }
}

/// Builds a complete P300 telegram for `cmd`, normalizing KW kinds to their
/// P300 counterparts. With `sequence` present, a 3-bit counter is folded into
/// bits 5-7 of the command byte before the CRC is computed.
pub(crate) fn p300_frame(
    cmd: &mut Command,
    sequence: &mut Option<u8>,
) -> Result<Vec<u8>, CommandError> {
    cmd.kind = match cmd.kind {
        CommandKind::KwRead => CommandKind::P300Read,
        CommandKind::KwWrite => CommandKind::P300Write,
        other => other,
    };
    let [hi, lo] = cmd.address.to_be_bytes();
    let mut frame = match cmd.kind {
        CommandKind::P300Read => {
            vec![FRAME_START, 5, 0x00, cmd.kind.code(), hi, lo, cmd.result_len]
        }
        CommandKind::P300Write => {
            cmd.result_len = cmd.args.len() as u8;
            let mut frame = vec![
                FRAME_START,
                cmd.args.len() as u8 + 5,
                0x00,
                cmd.kind.code(),
                hi,
                lo,
                cmd.args.len() as u8,
            ];
            frame.extend_from_slice(&cmd.args);
            frame
        }
        CommandKind::P300FunctionCall => {
            return Err(CommandError::Unsupported(
                "the P300 function call is not implemented".to_string(),
            ))
        }
        other => {
            return Err(CommandError::Unsupported(format!(
                "command kind {other:?} cannot be sent over the P300 link"
            )))
        }
    };
    if let Some(counter) = sequence {
        frame[3] |= *counter << 5;
        *counter = (*counter + 1) & 0x07;
    }
    let crc = crc8(&frame[1..]);
    frame.push(crc);
    Ok(frame)
}
