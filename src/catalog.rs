//! Loaders for the two Vitosoft-style XML catalogs: `DataPointType` records
//! describe controller models and which event types they carry,
//! `EventType` records describe the register layout of each field.

use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;
use std::str::FromStr;

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

use crate::codec::{self, Codec};
use crate::datapoint::{Conversion, DataPoint, EventType, Parameter};
use crate::protocol::CommandKind;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read the catalog")]
    Xml(#[from] quick_xml::Error),
    #[error("the catalog ended in the middle of a record")]
    Truncated,
    #[error("no data point matches the device identifier {}", codec::encode_hex(.0))]
    NoMatch([u8; 8]),
}

/// A matched `DataPointType` record: the device identity plus the names of
/// the event types the second catalog should be filtered down to.
#[derive(Debug, Clone)]
pub struct DataPointRecord {
    pub id: String,
    pub description: String,
    pub system_ident: [u8; 8],
    pub event_type_names: BTreeSet<String>,
}

/// Loads both catalogs and assembles the immutable [`DataPoint`] for the
/// device reporting `ident`.
pub fn load(
    data_point_xml: impl BufRead,
    event_type_xml: impl BufRead,
    ident: [u8; 8],
) -> Result<DataPoint, Error> {
    let record = find_data_point(data_point_xml, ident)?;
    let event_types = load_event_types(event_type_xml, &record)?;
    Ok(DataPoint {
        id: record.id,
        description: record.description,
        system_ident: ident,
        event_types,
    })
}

struct Candidate {
    id: String,
    description: String,
    event_type_list: String,
    extension: u64,
    extension_till: u64,
}

/// Streams the `DataPointType` catalog and returns the record that matches
/// `ident` with the tightest identification-extension range.
pub fn find_data_point<R: BufRead>(xml: R, ident: [u8; 8]) -> Result<DataPointRecord, Error> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut best: Option<Candidate> = None;
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.name().as_ref() == b"DataPointType" => {
                let fields = collect_record(&mut reader, b"DataPointType")?;
                if let Some(cand) = candidate(&fields, ident) {
                    best = Some(match best.take() {
                        None => cand,
                        Some(prev) => {
                            let tighter = cand.extension >= prev.extension
                                && (cand.extension_till < prev.extension_till
                                    || prev.extension_till == 0);
                            if tighter {
                                cand
                            } else {
                                prev
                            }
                        }
                    });
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    let best = best.ok_or(Error::NoMatch(ident))?;
    let event_type_names = best
        .event_type_list
        .split(';')
        .map(strip_address_suffix)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    Ok(DataPointRecord {
        id: best.id,
        description: best.description,
        system_ident: ident,
        event_type_names,
    })
}

fn candidate(fields: &BTreeMap<String, String>, ident: [u8; 8]) -> Option<Candidate> {
    let identification = fields.get("Identification")?;
    if identification.len() != 4 {
        return None;
    }
    let group = u16::from_str_radix(identification, 16).ok()?;
    if ident[0] != (group >> 8) as u8 || ident[1] != (group & 0xff) as u8 {
        return None;
    }
    let extension_str = field(fields, "IdentificationExtension");
    let till_str = field(fields, "IdentificationExtensionTill");
    let len_ok = |s: &str| s.is_empty() || (4..=6).contains(&s.len());
    if !len_ok(extension_str) || !len_ok(till_str) {
        return None;
    }
    let extension = u64::from_str_radix(extension_str, 16).unwrap_or(0);
    let extension_till = u64::from_str_radix(till_str, 16).unwrap_or(0);

    let mut device_extension = u64::from(ident[2]) << 8 | u64::from(ident[3]);
    if extension_str.len() > 4 || till_str.len() > 4 {
        device_extension =
            device_extension << 16 | u64::from(ident[4]) << 8 | u64::from(ident[5]);
    }
    if device_extension < extension || (extension_till != 0 && device_extension >= extension_till)
    {
        return None;
    }
    Some(Candidate {
        id: field(fields, "ID").to_string(),
        description: field(fields, "Description").to_string(),
        event_type_list: field(fields, "EventTypeList").to_string(),
        extension,
        extension_till,
    })
}

/// Streams the `EventType` catalog, keeping only records named by the data
/// point and accepted by the validator.
pub fn load_event_types<R: BufRead>(
    xml: R,
    record: &DataPointRecord,
) -> Result<BTreeMap<String, EventType>, Error> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut out = BTreeMap::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.name().as_ref() == b"EventType" => {
                let fields = collect_record(&mut reader, b"EventType")?;
                let name = strip_address_suffix(field(&fields, "ID"));
                if !name.is_empty() && record.event_type_names.contains(name) {
                    match validate(name, &fields) {
                        Ok(event_type) => {
                            out.insert(name.to_string(), event_type);
                        }
                        Err(reason) => {
                            debug!(message = "rejecting event type", name, %reason);
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

#[derive(thiserror::Error, Debug)]
enum Rejection {
    #[error("address `{0}` is not a 16-bit number")]
    Address(String),
    #[error("conversion tag `{0}` is not supported")]
    Conversion(String),
    #[error("a {bit_length}-bit field in {byte_length} bytes is not supported")]
    BitLayout { byte_length: u8, bit_length: u8 },
    #[error("block length {block_length} does not cover byte position {byte_position} plus byte length {byte_length}")]
    BlockLength { block_length: u8, byte_position: u8, byte_length: u8 },
}

fn validate(name: &str, fields: &BTreeMap<String, String>) -> Result<EventType, Rejection> {
    let address_str = field(fields, "Address");
    let address = parse_number(address_str)
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| Rejection::Address(address_str.to_string()))?;

    let block_length = parse_u8(fields, "BlockLength");
    let block_factor = parse_u8(fields, "BlockFactor");
    let mapping_type = parse_u8(fields, "MappingType");
    let byte_position = parse_u8(fields, "BytePosition");
    let byte_length = parse_u8(fields, "ByteLength");
    let bit_position = parse_u8(fields, "BitPosition");
    let bit_length = parse_u8(fields, "BitLength");

    if u16::from(block_length) < u16::from(byte_position) + u16::from(byte_length) {
        return Err(Rejection::BlockLength { block_length, byte_position, byte_length });
    }

    let conversion_str = field(fields, "Conversion");
    let conversion = Conversion::from_str(conversion_str)
        .map_err(|_| Rejection::Conversion(conversion_str.to_string()))?;

    let mut factor = parse_f32(fields, "ConversionFactor");
    let value_list = field(fields, "ValueList").to_string();

    let codec = match conversion {
        Conversion::DateTimeBcd => Codec::DateTimeBcd,
        Conversion::DateBcd => Codec::DateBcd,
        Conversion::Sec2Hour | Conversion::Sec2Minute | Conversion::HourDiffSec2Hour => {
            Codec::SecondsToDuration
        }
        Conversion::Div10 => {
            factor = 0.1;
            Codec::DivMulOffset
        }
        Conversion::Div100 => {
            factor = 0.01;
            Codec::DivMulOffset
        }
        Conversion::Div1000 => {
            factor = 0.001;
            Codec::DivMulOffset
        }
        Conversion::Div2 => {
            factor = 0.5;
            Codec::DivMulOffset
        }
        Conversion::Mult10 => {
            factor = 10.0;
            Codec::DivMulOffset
        }
        Conversion::Mult100 => {
            factor = 100.0;
            Codec::DivMulOffset
        }
        Conversion::Mult2 => {
            factor = 2.0;
            Codec::DivMulOffset
        }
        Conversion::Mult5 => {
            factor = 5.0;
            Codec::DivMulOffset
        }
        Conversion::MultOffset => {
            // Some catalog records leave the factor out entirely.
            if factor == 0.0 {
                factor = 1.0;
            }
            Codec::DivMulOffset
        }
        Conversion::MultOffsetBcd | Conversion::MultOffsetFloat => {
            return Err(Rejection::Conversion(conversion_str.to_string()))
        }
        Conversion::NoConversion => {
            if !value_list.is_empty() {
                Codec::ValueList
            } else if mapping_type > 0 {
                match mapping_type {
                    1 => Codec::MappingTime53,
                    2 => Codec::MappingRaster152,
                    3 => Codec::MappingErrors,
                    _ => Codec::Nop,
                }
            } else if byte_length < 5 && bit_length == 0 {
                if factor == 0.0 {
                    factor = 1.0;
                }
                Codec::DivMulOffset
            } else if block_length == 9 && name.starts_with("FehlerHisFA") {
                Codec::MappingErrors
            } else {
                Codec::Nop
            }
        }
    };

    // The numeric codec only knows nibble fields; the value-list codec
    // handles anything up to a byte.
    if codec == Codec::DivMulOffset && bit_length > 0 && !(byte_length == 1 && bit_length == 4) {
        return Err(Rejection::BitLayout { byte_length, bit_length });
    }
    if codec == Codec::ValueList && bit_length > 8 {
        return Err(Rejection::BitLayout { byte_length, bit_length });
    }

    Ok(EventType {
        name: name.to_string(),
        address,
        description: field(fields, "Description").to_string(),
        read_kind: access_kind(field(fields, "FCRead")),
        write_kind: access_kind(field(fields, "FCWrite")),
        parameter: Parameter::from_str(field(fields, "Parameter")).unwrap_or_default(),
        prefix_read: codec::decode_hex(field(fields, "PrefixRead")).unwrap_or_default(),
        prefix_write: codec::decode_hex(field(fields, "PrefixWrite")).unwrap_or_default(),
        block_length,
        block_factor,
        mapping_type,
        byte_position,
        byte_length,
        bit_position,
        bit_length,
        factory_setting: field(fields, "ALZ").to_string(),
        conversion,
        factor,
        offset: parse_f32(fields, "ConversionOffset"),
        lower_border: parse_f32(fields, "LowerBorder"),
        upper_border: parse_f32(fields, "UpperBorder"),
        stepping: parse_f32(fields, "Stepping"),
        value_list,
        unit: field(fields, "Unit").to_string(),
        codec,
    })
}

/// Maps a catalog access-mode string to the wire command kind. Only the
/// `Virtual_*` modes have one; the GWG and KM-Bus command sets are
/// recognized by the catalogs but carry no OptoLink mapping.
fn access_kind(mode: &str) -> Option<CommandKind> {
    match mode {
        "Virtual_READ" => Some(CommandKind::P300Read),
        "Virtual_WRITE" => Some(CommandKind::P300Write),
        _ => None,
    }
}

/// Event-type names may carry their address as a `~0x....` suffix.
fn strip_address_suffix(name: &str) -> &str {
    match name.split_once("~0x") {
        Some((prefix, _)) => prefix,
        None => name,
    }
}

fn field<'a>(fields: &'a BTreeMap<String, String>, name: &str) -> &'a str {
    fields.get(name).map(String::as_str).unwrap_or("")
}

fn parse_number(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn parse_u8(fields: &BTreeMap<String, String>, name: &str) -> u8 {
    parse_number(field(fields, name))
        .and_then(|v| u8::try_from(v).ok())
        .unwrap_or(0)
}

fn parse_f32(fields: &BTreeMap<String, String>, name: &str) -> f32 {
    field(fields, name).parse().unwrap_or(0.0)
}

/// Collects the child elements of the record the reader is positioned in
/// into a name → text map. Stops at the matching end tag.
fn collect_record<R: BufRead>(
    reader: &mut Reader<R>,
    record_tag: &[u8],
) -> Result<BTreeMap<String, String>, Error> {
    let mut fields = BTreeMap::new();
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut text = String::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                current = Some(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                text.clear();
            }
            Event::Text(t) => {
                if current.is_some() {
                    text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if current.is_some() {
                    text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(e) => {
                if e.name().as_ref() == record_tag {
                    return Ok(fields);
                }
                if let Some(tag) = current.take() {
                    if e.name().as_ref() == tag.as_bytes() {
                        fields.insert(tag, std::mem::take(&mut text));
                    }
                }
            }
            Event::Empty(_) => current = None,
            Event::Eof => return Err(Error::Truncated),
            _ => {}
        }
        buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENT: [u8; 8] = [0x20, 0x92, 0x01, 0x07, 0x00, 0x00, 0x01, 0x5a];

    fn data_point_xml(records: &[&str]) -> String {
        format!("<ECNDataSet>{}</ECNDataSet>", records.concat())
    }

    const WIDE: &str = "<DataPointType>\
        <ID>V200KW2</ID>\
        <Description>Vitotronic 200</Description>\
        <Identification>2092</Identification>\
        <EventTypeList>Outside_Temp~0x5525;Boiler_Temp;</EventTypeList>\
        </DataPointType>";
    const NARROW: &str = "<DataPointType>\
        <ID>V200KW2_ranged</ID>\
        <Description>Vitotronic 200, later revisions</Description>\
        <Identification>2092</Identification>\
        <IdentificationExtension>0100</IdentificationExtension>\
        <IdentificationExtensionTill>0200</IdentificationExtensionTill>\
        <EventTypeList>Outside_Temp</EventTypeList>\
        </DataPointType>";
    const OTHER_GROUP: &str = "<DataPointType>\
        <ID>VScotHO1</ID>\
        <Identification>20b8</Identification>\
        <EventTypeList>Outside_Temp</EventTypeList>\
        </DataPointType>";

    #[test]
    fn the_tightest_extension_range_wins() {
        for records in [[WIDE, NARROW, OTHER_GROUP], [NARROW, WIDE, OTHER_GROUP]] {
            let xml = data_point_xml(&records);
            let record = find_data_point(xml.as_bytes(), IDENT).unwrap();
            assert_eq!(record.id, "V200KW2_ranged");
        }
    }

    #[test]
    fn extension_bounds_are_half_open() {
        let out_of_range: [u8; 8] = [0x20, 0x92, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00];
        let xml = data_point_xml(&[NARROW]);
        assert!(matches!(
            find_data_point(xml.as_bytes(), out_of_range),
            Err(Error::NoMatch(_))
        ));
        let xml = data_point_xml(&[WIDE, NARROW]);
        let record = find_data_point(xml.as_bytes(), out_of_range).unwrap();
        assert_eq!(record.id, "V200KW2", "only the unbounded record may match");
    }

    #[test]
    fn event_type_names_lose_their_address_suffix() {
        let xml = data_point_xml(&[WIDE]);
        let record = find_data_point(xml.as_bytes(), IDENT).unwrap();
        assert_eq!(
            record.event_type_names.iter().collect::<Vec<_>>(),
            ["Boiler_Temp", "Outside_Temp"]
        );
    }

    #[test]
    fn no_group_match_is_reported() {
        let xml = data_point_xml(&[OTHER_GROUP]);
        assert!(matches!(find_data_point(xml.as_bytes(), IDENT), Err(Error::NoMatch(_))));
    }

    fn record_with_names(names: &[&str]) -> DataPointRecord {
        DataPointRecord {
            id: "V200KW2".to_string(),
            description: String::new(),
            system_ident: IDENT,
            event_type_names: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    fn event_type_xml(records: &[&str]) -> String {
        format!("<ECNDataSet>{}</ECNDataSet>", records.concat())
    }

    #[test]
    fn records_are_validated_and_bound() {
        let xml = event_type_xml(&[
            "<EventType>\
             <ID>Outside_Temp~0x5525</ID>\
             <Address>0x5525</Address>\
             <FCRead>Virtual_READ</FCRead>\
             <FCWrite>undefined</FCWrite>\
             <Parameter>SInt</Parameter>\
             <BlockLength>2</BlockLength>\
             <ByteLength>2</ByteLength>\
             <Conversion>Div10</Conversion>\
             <Unit>°C</Unit>\
             </EventType>",
        ]);
        let types =
            load_event_types(xml.as_bytes(), &record_with_names(&["Outside_Temp"])).unwrap();
        let et = &types["Outside_Temp"];
        assert_eq!(et.address, 0x5525);
        assert_eq!(et.read_kind, Some(CommandKind::P300Read));
        assert_eq!(et.write_kind, None);
        assert_eq!(et.codec, Codec::DivMulOffset);
        assert_eq!(et.parameter, Parameter::SInt);
        assert!((et.factor - 0.1).abs() < 1e-6);
        assert_eq!(et.unit, "°C");
    }

    #[test]
    fn unknown_names_and_conversions_are_dropped() {
        let xml = event_type_xml(&[
            // Not in the data point's list.
            "<EventType><ID>Unrelated</ID><Address>0x0001</Address>\
             <Conversion>NoConversion</Conversion></EventType>",
            // Unsupported conversion tag.
            "<EventType><ID>BadConv</ID><Address>0x0002</Address>\
             <Conversion>MultOffsetFloat</Conversion></EventType>",
            // Block too short for the field.
            "<EventType><ID>BadBlock</ID><Address>0x0003</Address>\
             <BlockLength>1</BlockLength><BytePosition>1</BytePosition>\
             <ByteLength>1</ByteLength><Conversion>NoConversion</Conversion></EventType>",
            // Bit width the numeric codec cannot carry.
            "<EventType><ID>BadBits</ID><Address>0x0004</Address>\
             <BlockLength>1</BlockLength><ByteLength>1</ByteLength>\
             <BitLength>3</BitLength><Conversion>Div2</Conversion></EventType>",
        ]);
        let record = record_with_names(&["Unrelated", "BadConv", "BadBlock", "BadBits"]);
        // "Unrelated" is in the list here, so only the three invalid ones drop.
        let record2 = record_with_names(&["BadConv", "BadBlock", "BadBits"]);
        assert_eq!(load_event_types(xml.as_bytes(), &record).unwrap().len(), 1);
        assert!(load_event_types(xml.as_bytes(), &record2).unwrap().is_empty());
    }

    #[test]
    fn no_conversion_binding_rules() {
        let xml = event_type_xml(&[
            "<EventType><ID>Mode</ID><Address>0x2301</Address>\
             <BlockLength>1</BlockLength><ByteLength>1</ByteLength>\
             <ValueList>0=Off;1=On</ValueList>\
             <Conversion>NoConversion</Conversion></EventType>",
            "<EventType><ID>Timer</ID><Address>0x2000</Address>\
             <BlockLength>56</BlockLength><BlockFactor>7</BlockFactor>\
             <MappingType>1</MappingType>\
             <Conversion>NoConversion</Conversion></EventType>",
            "<EventType><ID>Plain</ID><Address>0x2100</Address>\
             <BlockLength>2</BlockLength><ByteLength>2</ByteLength>\
             <Conversion>NoConversion</Conversion></EventType>",
            "<EventType><ID>FehlerHisFA1</ID><Address>0x7507</Address>\
             <BlockLength>9</BlockLength><ByteLength>9</ByteLength>\
             <Conversion>NoConversion</Conversion></EventType>",
            "<EventType><ID>Opaque</ID><Address>0x2200</Address>\
             <BlockLength>16</BlockLength><ByteLength>16</ByteLength>\
             <Conversion>NoConversion</Conversion></EventType>",
        ]);
        let record =
            record_with_names(&["Mode", "Timer", "Plain", "FehlerHisFA1", "Opaque"]);
        let types = load_event_types(xml.as_bytes(), &record).unwrap();
        assert_eq!(types["Mode"].codec, Codec::ValueList);
        assert_eq!(types["Timer"].codec, Codec::MappingTime53);
        assert_eq!(types["Plain"].codec, Codec::DivMulOffset);
        assert_eq!(types["Plain"].factor, 1.0);
        assert_eq!(types["FehlerHisFA1"].codec, Codec::MappingErrors);
        assert_eq!(types["Opaque"].codec, Codec::Nop);
    }

    #[test]
    fn full_load_assembles_the_data_point() {
        let dp_xml = data_point_xml(&[WIDE]);
        let et_xml = event_type_xml(&[
            "<EventType><ID>Boiler_Temp</ID><Address>0x0810</Address>\
             <FCRead>Virtual_READ</FCRead>\
             <BlockLength>2</BlockLength><ByteLength>2</ByteLength>\
             <Conversion>Div10</Conversion></EventType>",
        ]);
        let dp = load(dp_xml.as_bytes(), et_xml.as_bytes(), IDENT).unwrap();
        assert_eq!(dp.id, "V200KW2");
        assert_eq!(dp.system_ident, IDENT);
        assert_eq!(dp.event_types.len(), 1);
        assert!(dp.event_types.contains_key("Boiler_Temp"));
    }
}
