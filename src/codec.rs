use std::time::Duration;

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};

use crate::datapoint::EventType;

/// A decoded register value. The variant is fixed by the codec bound to the
/// descriptor, never guessed from the data.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(u16),
    Float(f32),
    Bytes(Vec<u8>),
    Instant(DateTime<Local>),
    Duration(Duration),
    Schedule(Vec<Vec<SwitchSlot>>),
    Errors(Vec<FaultEntry>),
}

/// One on/off pair of a weekly switching schedule, both sides expressed as
/// offsets into the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchSlot {
    pub on: Duration,
    pub off: Duration,
}

/// One entry of the device's fault history. Cleared slots carry an all-zero
/// timestamp which has no calendar representation, hence the `Option`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FaultEntry {
    pub code: u8,
    pub at: Option<DateTime<Local>>,
}

fn fmt_day_offset(d: Duration) -> String {
    let mins = d.as_secs() / 60;
    format!("{:02}h{:02}", mins / 60, mins % 60)
}

impl std::fmt::Display for SwitchSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} .. {}", fmt_day_offset(self.on), fmt_day_offset(self.off))
    }
}

impl serde::Serialize for SwitchSlot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeTuple;
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&fmt_day_offset(self.on))?;
        tuple.serialize_element(&fmt_day_offset(self.off))?;
        tuple.end()
    }
}

impl std::fmt::Display for FaultEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.at {
            Some(at) => write!(f, "{:#04x}: {}", self.code, at.format("%Y-%m-%d %H:%M:%S")),
            None => write!(f, "{:#04x}: -", self.code),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::Bytes(b) => f.write_str(&encode_hex(b)),
            Value::Instant(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S")),
            Value::Duration(d) => write!(f, "{}", humantime::format_duration(*d)),
            Value::Schedule(days) => {
                for (i, day) in days.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    if day.is_empty() {
                        f.write_str("-")?;
                    }
                    for (j, slot) in day.iter().enumerate() {
                        if j > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{slot}")?;
                    }
                }
                Ok(())
            }
            Value::Errors(entries) => {
                for (i, entry) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{entry}")?;
                }
                Ok(())
            }
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Int(n) => serializer.serialize_u16(*n),
            Value::Float(n) => serializer.serialize_f32(*n),
            Value::Bytes(b) => serializer.serialize_str(&encode_hex(b)),
            Value::Instant(t) => serializer.serialize_str(&t.to_rfc3339()),
            Value::Duration(d) => {
                serializer.serialize_str(&humantime::format_duration(*d).to_string())
            }
            Value::Schedule(days) => days.serialize(serializer),
            Value::Errors(entries) => entries.serialize(serializer),
        }
    }
}

pub(crate) fn encode_hex(data: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        let _ = write!(out, "{b:02x}");
    }
    out
}

pub(crate) fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("block holds {got} bytes, the field needs {need}")]
    BlockTooShort { need: usize, got: usize },
    #[error("cannot handle a bit field of {bit_length} bits in {byte_length} bytes")]
    BitLayout { byte_length: u8, bit_length: u8 },
    #[error("cannot convert a numeric field of {0} bytes")]
    ByteLength(u8),
    #[error("codec {0:?} does not support encoding")]
    EncodeUnsupported(Codec),
    #[error("expected a {expected} value")]
    ValueShape { expected: &'static str },
    #[error("bytes {} do not form a calendar timestamp", encode_hex(.0))]
    BadTimestamp(Vec<u8>),
    #[error("data length {got} is not a multiple of the {chunk}-byte sub-block")]
    ChunkLayout { chunk: usize, got: usize },
    #[error("a block factor is required for schedule data")]
    MissingBlockFactor,
    #[error("could not parse `{input}` as a {expected} value")]
    Parse { input: String, expected: &'static str },
}

/// The codec bound to an [`EventType`] at catalog load time.
///
/// Decoding interprets a whole block; encoding mutates only the bit/byte
/// slice the descriptor covers so that a read-modify-write preserves the
/// neighboring fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Codec {
    Nop,
    ValueList,
    DivMulOffset,
    DateTimeBcd,
    DateBcd,
    SecondsToDuration,
    MappingTime53,
    MappingRaster152,
    MappingErrors,
}

impl Codec {
    pub fn decode(self, et: &EventType, raw: &[u8]) -> Result<Value, Error> {
        match self {
            Codec::Nop | Codec::MappingRaster152 => Ok(Value::Bytes(raw.to_vec())),
            Codec::ValueList => decode_value_list(et, raw),
            Codec::DivMulOffset => decode_div_mul_offset(et, raw),
            Codec::DateTimeBcd | Codec::DateBcd => {
                let slice = field_slice(et, raw)?;
                Ok(Value::Instant(decode_bcd_date(slice)?))
            }
            Codec::SecondsToDuration => decode_seconds(et, raw),
            Codec::MappingTime53 => decode_time53(et, raw),
            Codec::MappingErrors => decode_errors(raw),
        }
    }

    pub fn encode(self, et: &EventType, block: &mut [u8], value: &Value) -> Result<(), Error> {
        match self {
            Codec::ValueList => encode_value_list(et, block, value),
            Codec::DivMulOffset => encode_div_mul_offset(et, block, value),
            Codec::DateTimeBcd => encode_bcd_date_time(et, block, value),
            Codec::DateBcd => encode_bcd_date(et, block, value),
            Codec::SecondsToDuration => encode_seconds(et, block, value),
            Codec::Nop
            | Codec::MappingTime53
            | Codec::MappingRaster152
            | Codec::MappingErrors => Err(Error::EncodeUnsupported(self)),
        }
    }
}

/// Parses a CLI-supplied string into the [`Value`] shape `codec` encodes.
/// Calendar codecs additionally accept the literal `now`.
pub fn parse_value(codec: Codec, input: &str) -> Result<Value, Error> {
    let parse = Error::Parse {
        input: input.to_string(),
        expected: match codec {
            Codec::ValueList => "list index",
            Codec::DivMulOffset => "numeric",
            Codec::DateTimeBcd | Codec::DateBcd => "timestamp",
            Codec::SecondsToDuration => "duration",
            _ => "hex byte string",
        },
    };
    match codec {
        Codec::ValueList => input.parse().map(Value::Int).map_err(|_| parse),
        Codec::DivMulOffset => input.parse().map(Value::Float).map_err(|_| parse),
        Codec::SecondsToDuration => humantime::parse_duration(input)
            .map(Value::Duration)
            .map_err(|_| parse),
        Codec::DateTimeBcd | Codec::DateBcd => {
            if input == "now" {
                return Ok(Value::Instant(Local::now()));
            }
            let naive = chrono::NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S")
                .or_else(|_| chrono::NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S"))
                .or_else(|_| {
                    chrono::NaiveDate::parse_from_str(input, "%Y-%m-%d")
                        .map(|d| chrono::NaiveDateTime::new(d, chrono::NaiveTime::MIN))
                })
                .map_err(|_| parse)?;
            match naive.and_local_timezone(Local).earliest() {
                Some(t) => Ok(Value::Instant(t)),
                None => Err(Error::Parse { input: input.to_string(), expected: "timestamp" }),
            }
        }
        Codec::Nop | Codec::MappingRaster152 => decode_hex(input)
            .map(Value::Bytes)
            .ok_or(parse),
        Codec::MappingTime53 | Codec::MappingErrors => Err(parse),
    }
}

fn value_as_f32(value: &Value) -> Result<f32, Error> {
    match value {
        Value::Int(n) => Ok(*n as f32),
        Value::Float(n) => Ok(*n),
        _ => Err(Error::ValueShape { expected: "numeric" }),
    }
}

fn field_slice<'a>(et: &EventType, raw: &'a [u8]) -> Result<&'a [u8], Error> {
    let start = et.byte_position as usize;
    let end = start + et.byte_length as usize;
    raw.get(start..end)
        .ok_or(Error::BlockTooShort { need: end, got: raw.len() })
}

fn from_bcd(b: u8) -> u32 {
    u32::from(b >> 4) * 10 + u32::from(b & 0x0f)
}

fn to_bcd(v: u32) -> u8 {
    (((v / 10) << 4) | (v % 10)) as u8
}

/// Decodes 4 (date only) or up to 8 BCD bytes into a local calendar instant.
/// Missing time bytes count as zero.
fn decode_bcd_date(c: &[u8]) -> Result<DateTime<Local>, Error> {
    if c.len() < 4 {
        return Err(Error::BlockTooShort { need: 4, got: c.len() });
    }
    let mut padded = [0u8; 8];
    padded[..c.len().min(8)].copy_from_slice(&c[..c.len().min(8)]);
    let year = from_bcd(padded[0]) * 100 + from_bcd(padded[1]);
    // padded[4] is the weekday, implied by the date itself.
    Local
        .with_ymd_and_hms(
            year as i32,
            from_bcd(padded[2]),
            from_bcd(padded[3]),
            from_bcd(padded[5]),
            from_bcd(padded[6]),
            from_bcd(padded[7]),
        )
        .earliest()
        .ok_or_else(|| Error::BadTimestamp(c.to_vec()))
}

fn instant_of(value: &Value) -> Result<DateTime<Local>, Error> {
    match value {
        Value::Instant(t) => Ok(*t),
        _ => Err(Error::ValueShape { expected: "timestamp" }),
    }
}

fn write_bcd_date(block: &mut [u8], start: usize, t: DateTime<Local>) {
    block[start] = to_bcd(t.year() as u32 / 100);
    block[start + 1] = to_bcd(t.year() as u32 % 100);
    block[start + 2] = to_bcd(t.month());
    block[start + 3] = to_bcd(t.day());
}

fn encode_bcd_date_time(et: &EventType, block: &mut [u8], value: &Value) -> Result<(), Error> {
    let start = et.byte_position as usize;
    if block.len() < start + 8 {
        return Err(Error::BlockTooShort { need: start + 8, got: block.len() });
    }
    let t = instant_of(value)?;
    write_bcd_date(block, start, t);
    block[start + 4] = to_bcd(t.weekday().number_from_monday());
    block[start + 5] = to_bcd(t.hour());
    block[start + 6] = to_bcd(t.minute());
    block[start + 7] = to_bcd(t.second());
    Ok(())
}

fn encode_bcd_date(et: &EventType, block: &mut [u8], value: &Value) -> Result<(), Error> {
    let start = et.byte_position as usize;
    if block.len() < start + 4 {
        return Err(Error::BlockTooShort { need: start + 4, got: block.len() });
    }
    let t = instant_of(value)?;
    write_bcd_date(block, start, t);
    // A longer slice still carries the weekday; the time bytes are cleared.
    if block.len() > start + 4 {
        block[start + 4] = to_bcd(t.weekday().number_from_monday());
    }
    for i in 5..8 {
        if block.len() > start + i {
            block[start + i] = 0;
        }
    }
    Ok(())
}

fn decode_value_list(et: &EventType, raw: &[u8]) -> Result<Value, Error> {
    if et.bit_length > 8 {
        return Err(Error::BitLayout { byte_length: et.byte_length, bit_length: et.bit_length });
    }
    let d = if et.bit_length > 0 {
        // The byte position in the catalogs is not always trustworthy for
        // bit fields; derive it from the bit position instead.
        let byte_pos = usize::from(et.bit_position / 8);
        let shift = et.bit_position % 8;
        let byte = *raw
            .get(byte_pos)
            .ok_or(Error::BlockTooShort { need: byte_pos + 1, got: raw.len() })?;
        let mask = ((1u16 << et.bit_length) - 1) as u8;
        u16::from((byte >> shift) & mask)
    } else if et.byte_length == 1 {
        u16::from(field_slice(et, raw)?[0])
    } else {
        let start = et.byte_position as usize;
        let pair = raw
            .get(start..start + 2)
            .ok_or(Error::BlockTooShort { need: start + 2, got: raw.len() })?;
        u16::from_le_bytes([pair[0], pair[1]])
    };
    Ok(Value::Int(d))
}

fn encode_value_list(et: &EventType, block: &mut [u8], value: &Value) -> Result<(), Error> {
    if et.bit_length > 8 {
        return Err(Error::BitLayout { byte_length: et.byte_length, bit_length: et.bit_length });
    }
    let d = value_as_f32(value)? as u16;
    if et.bit_length > 0 {
        let byte_pos = usize::from(et.bit_position / 8);
        let shift = et.bit_position % 8;
        if block.len() <= byte_pos {
            return Err(Error::BlockTooShort { need: byte_pos + 1, got: block.len() });
        }
        let mask = ((1u16 << et.bit_length) - 1) as u8;
        block[byte_pos] = (block[byte_pos] & !(mask << shift)) | (((d as u8) & mask) << shift);
    } else if et.byte_length == 1 {
        let pos = et.byte_position as usize;
        if block.len() <= pos {
            return Err(Error::BlockTooShort { need: pos + 1, got: block.len() });
        }
        block[pos] = d as u8;
    } else {
        let pos = et.byte_position as usize;
        if block.len() < pos + 2 {
            return Err(Error::BlockTooShort { need: pos + 2, got: block.len() });
        }
        block[pos..pos + 2].copy_from_slice(&d.to_le_bytes());
    }
    Ok(())
}

fn check_numeric_bit_layout(et: &EventType) -> Result<(), Error> {
    if et.bit_length > 0 && !(et.byte_length == 1 && et.bit_length == 4) {
        return Err(Error::BitLayout { byte_length: et.byte_length, bit_length: et.bit_length });
    }
    Ok(())
}

fn decode_div_mul_offset(et: &EventType, raw: &[u8]) -> Result<Value, Error> {
    check_numeric_bit_layout(et)?;
    let c = field_slice(et, raw)?;
    let signed = et.parameter.is_signed(et.byte_length);
    let raw_value = match et.byte_length {
        1 => {
            if signed {
                c[0] as i8 as f32
            } else {
                let mut d = c[0];
                if et.bit_length == 4 {
                    // Nibble fields: position 0 is the high half.
                    if et.bit_position == 0 {
                        d >>= 4;
                    } else if et.bit_position == 4 {
                        d &= 0x0f;
                    }
                }
                f32::from(d)
            }
        }
        2 => {
            let u = if et.parameter.is_high_byte_first() {
                u16::from_be_bytes([c[0], c[1]])
            } else {
                u16::from_le_bytes([c[0], c[1]])
            };
            if signed {
                f32::from(u as i16)
            } else {
                f32::from(u)
            }
        }
        3 => {
            (u32::from(c[2]) << 16 | u32::from(c[1]) << 8 | u32::from(c[0])) as f32
        }
        4 => {
            let u = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            if signed {
                u as i32 as f32
            } else {
                u as f32
            }
        }
        n => return Err(Error::ByteLength(n)),
    };
    Ok(Value::Float(raw_value * et.factor + et.offset))
}

fn encode_div_mul_offset(et: &EventType, block: &mut [u8], value: &Value) -> Result<(), Error> {
    check_numeric_bit_layout(et)?;
    let start = et.byte_position as usize;
    let end = start + et.byte_length as usize;
    if block.len() < end {
        return Err(Error::BlockTooShort { need: end, got: block.len() });
    }
    let mut f = value_as_f32(value)?;
    // Catalog borders are not guaranteed to be ordered; apply them
    // independently.
    if et.lower_border != et.upper_border {
        if f < et.lower_border {
            f = et.lower_border;
        }
        if f > et.upper_border {
            f = et.upper_border;
        }
    }
    let f = ((f - et.offset) / et.factor).round();
    let signed = et.parameter.is_signed(et.byte_length);
    match et.byte_length {
        1 => {
            if signed {
                block[start] = f as i8 as u8;
            } else if et.bit_length == 4 {
                let d = (f as u8) & 0x0f;
                if et.bit_position == 0 {
                    block[start] = (block[start] & 0x0f) | (d << 4);
                } else if et.bit_position == 4 {
                    block[start] = (block[start] & 0xf0) | d;
                }
            } else {
                block[start] = f as u8;
            }
        }
        2 => {
            let bytes = if signed {
                (f as i16).to_le_bytes()
            } else {
                (f as u16).to_le_bytes()
            };
            if et.parameter.is_high_byte_first() {
                block[start] = bytes[1];
                block[start + 1] = bytes[0];
            } else {
                block[start..end].copy_from_slice(&bytes);
            }
        }
        3 => {
            let d = f as u32;
            block[start..end].copy_from_slice(&d.to_le_bytes()[..3]);
        }
        4 => {
            let bytes = if signed {
                (f as i32).to_le_bytes()
            } else {
                (f as u32).to_le_bytes()
            };
            block[start..end].copy_from_slice(&bytes);
        }
        n => return Err(Error::ByteLength(n)),
    }
    Ok(())
}

fn decode_seconds(et: &EventType, raw: &[u8]) -> Result<Value, Error> {
    let c = field_slice(et, raw)?;
    let mut secs = 0u64;
    for b in c.iter().rev() {
        secs = (secs << 8) + u64::from(*b);
    }
    Ok(Value::Duration(Duration::from_secs(secs)))
}

fn encode_seconds(et: &EventType, block: &mut [u8], value: &Value) -> Result<(), Error> {
    let start = et.byte_position as usize;
    let end = start + et.byte_length as usize;
    if block.len() < end {
        return Err(Error::BlockTooShort { need: end, got: block.len() });
    }
    let d = match value {
        Value::Duration(d) => *d,
        _ => return Err(Error::ValueShape { expected: "duration" }),
    };
    let mut secs = d.as_secs();
    for slot in block[start..end].iter_mut() {
        *slot = (secs & 0xff) as u8;
        secs >>= 8;
    }
    Ok(())
}

/// Converts one 5+3-coded byte (hours in the high 5 bits, 10-minute raster in
/// the low 3) into an offset from midnight.
fn time53(b: u8) -> Duration {
    Duration::from_secs(u64::from(b >> 3) * 3600 + u64::from(b & 0x07) * 600)
}

fn decode_time53(et: &EventType, raw: &[u8]) -> Result<Value, Error> {
    if et.block_factor == 0 {
        return Err(Error::MissingBlockFactor);
    }
    let chunk = usize::from(et.block_length / et.block_factor);
    if chunk == 0 || raw.len() % chunk != 0 {
        return Err(Error::ChunkLayout { chunk, got: raw.len() });
    }
    let mut days = Vec::with_capacity(raw.len() / chunk);
    for day in raw.chunks_exact(chunk) {
        let mut slots = Vec::new();
        for pair in day.chunks_exact(2) {
            // 0xff terminates the day's switch list.
            if pair[0] == 0xff || pair[1] == 0xff {
                break;
            }
            slots.push(SwitchSlot { on: time53(pair[0]), off: time53(pair[1]) });
        }
        days.push(slots);
    }
    Ok(Value::Schedule(days))
}

fn decode_errors(raw: &[u8]) -> Result<Value, Error> {
    if raw.len() % 9 != 0 {
        return Err(Error::ChunkLayout { chunk: 9, got: raw.len() });
    }
    let entries = raw
        .chunks_exact(9)
        .map(|record| FaultEntry {
            code: record[0],
            at: decode_bcd_date(&record[1..9]).ok(),
        })
        .collect();
    Ok(Value::Errors(entries))
}
