use std::collections::BTreeMap;

use crate::codec::Codec;
use crate::protocol::CommandKind;

/// One concrete controller model, matched against the 8-byte system device
/// identifier the device reports at startup.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DataPoint {
    pub id: String,
    pub description: String,
    pub system_ident: [u8; 8],
    pub event_types: BTreeMap<String, EventType>,
}

impl DataPoint {
    /// A placeholder identity for a device whose catalogs have not been
    /// loaded (only raw commands are possible then).
    pub fn unidentified() -> DataPoint {
        DataPoint {
            id: String::new(),
            description: String::new(),
            system_ident: [0; 8],
            event_types: BTreeMap::new(),
        }
    }
}

/// Interpretation hint for `SByte`/`SInt`-style catalog parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, strum::EnumString)]
pub enum Parameter {
    #[default]
    Plain,
    SByte,
    SInt,
    SInt4,
    IntHighByteFirst,
    SIntHighByteFirst,
}

impl Parameter {
    pub(crate) fn is_signed(self, byte_length: u8) -> bool {
        match byte_length {
            1 => matches!(self, Parameter::SByte | Parameter::SInt),
            2 => matches!(self, Parameter::SInt | Parameter::SIntHighByteFirst),
            4 => matches!(self, Parameter::SInt | Parameter::SInt4),
            _ => false,
        }
    }

    pub(crate) fn is_high_byte_first(self) -> bool {
        matches!(self, Parameter::IntHighByteFirst | Parameter::SIntHighByteFirst)
    }
}

/// The conversion tag of a catalog record. Resolved to a [`Codec`] at load
/// time; tags the implementation cannot perform reject the whole record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, strum::EnumString)]
pub enum Conversion {
    NoConversion,
    #[strum(serialize = "DateTimeBCD")]
    DateTimeBcd,
    #[strum(serialize = "DateBCD")]
    DateBcd,
    Sec2Hour,
    Sec2Minute,
    HourDiffSec2Hour,
    Div10,
    Div100,
    Div1000,
    Div2,
    Mult10,
    Mult100,
    Mult2,
    Mult5,
    MultOffset,
    #[strum(serialize = "MultOffsetBCD")]
    MultOffsetBcd,
    MultOffsetFloat,
}

/// One logical, named field at a register address: its byte/bit layout
/// within the surrounding block, the conversion applied to it, and the
/// command kinds used to reach it. Immutable once loaded.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventType {
    pub name: String,
    pub address: u16,
    pub description: String,
    pub read_kind: Option<CommandKind>,
    pub write_kind: Option<CommandKind>,
    pub parameter: Parameter,
    pub prefix_read: Vec<u8>,
    pub prefix_write: Vec<u8>,
    pub block_length: u8,
    pub block_factor: u8,
    pub mapping_type: u8,
    pub byte_position: u8,
    pub byte_length: u8,
    pub bit_position: u8,
    pub bit_length: u8,
    pub factory_setting: String,
    pub conversion: Conversion,
    pub factor: f32,
    pub offset: f32,
    pub lower_border: f32,
    pub upper_border: f32,
    pub stepping: f32,
    pub value_list: String,
    pub unit: String,
    pub codec: Codec,
}

impl EventType {
    /// Length of one sub-block: descriptors with a block factor are read and
    /// written in `block_length / block_factor` slices.
    pub fn step(&self) -> u8 {
        if self.block_factor > 0 {
            let step = self.block_length / self.block_factor;
            if step > 0 {
                return step;
            }
        }
        self.block_length
    }
}
