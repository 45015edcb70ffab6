//! AMF0 value codec.
//!
//! Command bodies carry their arguments as a flat list of AMF0 values.
//! Only the types the protocol actually exchanges are supported; the
//! AVM+ (AMF3) escape is rejected.

use std::fmt;

use crate::packet::{Packet, PacketError};

const NUMBER_MARKER: u8 = 0x00;
const BOOLEAN_MARKER: u8 = 0x01;
const STRING_MARKER: u8 = 0x02;
const BEGIN_OBJECT_MARKER: u8 = 0x03;
const NULL_MARKER: u8 = 0x05;
const UNDEFINED_MARKER: u8 = 0x06;
const ECMA_ARRAY_MARKER: u8 = 0x08;
const END_OBJECT_MARKER: u8 = 0x09;
const AVMPLUS_OBJECT_MARKER: u8 = 0x11;

/// AMF0 decode error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmfError {
    /// A value ran past the end of the buffer
    Truncated,
    /// A type marker this codec does not handle
    UnsupportedMarker(u8),
    /// The expected marker was not found
    UnexpectedMarker { expected: u8, found: u8 },
    /// A string was not valid UTF-8
    InvalidString,
}

impl fmt::Display for AmfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmfError::Truncated => write!(f, "AMF0 value truncated"),
            AmfError::UnsupportedMarker(m) => write!(f, "unsupported AMF0 marker {m:#04x}"),
            AmfError::UnexpectedMarker { expected, found } => {
                write!(f, "expected AMF0 marker {expected:#04x}, found {found:#04x}")
            }
            AmfError::InvalidString => write!(f, "AMF0 string is not valid UTF-8"),
        }
    }
}

impl std::error::Error for AmfError {}

impl From<PacketError> for AmfError {
    fn from(_: PacketError) -> Self {
        AmfError::Truncated
    }
}

/// An AMF0 value.
///
/// Objects and ECMA arrays keep their properties in wire order so that
/// encoding a decoded value reproduces the original bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0Value)>),
    EcmaArray(Vec<(String, Amf0Value)>),
    Null,
    Undefined,
}

impl Amf0Value {
    fn marker(&self) -> u8 {
        match self {
            Amf0Value::Number(_) => NUMBER_MARKER,
            Amf0Value::Boolean(_) => BOOLEAN_MARKER,
            Amf0Value::String(_) => STRING_MARKER,
            Amf0Value::Object(_) => BEGIN_OBJECT_MARKER,
            Amf0Value::EcmaArray(_) => ECMA_ARRAY_MARKER,
            Amf0Value::Null => NULL_MARKER,
            Amf0Value::Undefined => UNDEFINED_MARKER,
        }
    }
}

fn is_value_marker(marker: u8) -> bool {
    matches!(
        marker,
        NUMBER_MARKER
            | BOOLEAN_MARKER
            | STRING_MARKER
            | BEGIN_OBJECT_MARKER
            | NULL_MARKER
            | UNDEFINED_MARKER
            | ECMA_ARRAY_MARKER
            | AVMPLUS_OBJECT_MARKER
    )
}

/// Read AMF0 values until the next byte is not a known type marker or
/// the cursor is exhausted.
pub fn read_values(pkt: &mut Packet) -> Result<Vec<Amf0Value>, AmfError> {
    let mut values = Vec::new();
    while let Some(marker) = pkt.peek() {
        if !is_value_marker(marker) {
            break;
        }
        values.push(read_value(pkt)?);
    }
    Ok(values)
}

/// Read a single AMF0 value from the cursor.
pub fn read_value(pkt: &mut Packet) -> Result<Amf0Value, AmfError> {
    let marker = pkt.peek().ok_or(AmfError::Truncated)?;
    match marker {
        NUMBER_MARKER => {
            pkt.skip(1);
            Ok(Amf0Value::Number(pkt.read_f64()?))
        }
        BOOLEAN_MARKER => {
            pkt.skip(1);
            Ok(Amf0Value::Boolean(pkt.read_u8()? != 0))
        }
        STRING_MARKER => {
            pkt.skip(1);
            Ok(Amf0Value::String(read_utf8(pkt)?))
        }
        BEGIN_OBJECT_MARKER => {
            pkt.skip(1);
            Ok(Amf0Value::Object(read_properties(pkt)?))
        }
        ECMA_ARRAY_MARKER => {
            pkt.skip(1);
            // associative count, properties follow the object layout
            pkt.read_u32()?;
            Ok(Amf0Value::EcmaArray(read_properties(pkt)?))
        }
        NULL_MARKER => {
            pkt.skip(1);
            Ok(Amf0Value::Null)
        }
        UNDEFINED_MARKER => {
            pkt.skip(1);
            Ok(Amf0Value::Undefined)
        }
        other => Err(AmfError::UnsupportedMarker(other)),
    }
}

/// Read an AMF0 string, checking its marker.
pub fn read_string(pkt: &mut Packet) -> Result<String, AmfError> {
    expect_marker(pkt, STRING_MARKER)?;
    read_utf8(pkt)
}

/// Read an AMF0 number, checking its marker.
pub fn read_number(pkt: &mut Packet) -> Result<f64, AmfError> {
    expect_marker(pkt, NUMBER_MARKER)?;
    Ok(pkt.read_f64()?)
}

fn expect_marker(pkt: &mut Packet, expected: u8) -> Result<(), AmfError> {
    let found = pkt.read_u8()?;
    if found != expected {
        return Err(AmfError::UnexpectedMarker { expected, found });
    }
    Ok(())
}

fn read_utf8(pkt: &mut Packet) -> Result<String, AmfError> {
    let len = pkt.read_u16()? as usize;
    let raw = pkt.read_bytes(len)?;
    String::from_utf8(raw).map_err(|_| AmfError::InvalidString)
}

fn read_properties(pkt: &mut Packet) -> Result<Vec<(String, Amf0Value)>, AmfError> {
    let mut props = Vec::new();
    loop {
        let key = read_utf8(pkt)?;
        if key.is_empty() {
            expect_marker(pkt, END_OBJECT_MARKER)?;
            return Ok(props);
        }
        props.push((key, read_value(pkt)?));
    }
}

/// Write a single AMF0 value at the cursor.
pub fn write_value(pkt: &mut Packet, value: &Amf0Value) {
    pkt.write_u8(value.marker());
    match value {
        Amf0Value::Number(n) => pkt.write_f64(*n),
        Amf0Value::Boolean(b) => pkt.write_u8(u8::from(*b)),
        Amf0Value::String(s) => write_utf8(pkt, s),
        Amf0Value::Object(props) => write_properties(pkt, props),
        Amf0Value::EcmaArray(props) => {
            pkt.write_u32(props.len() as u32);
            write_properties(pkt, props);
        }
        Amf0Value::Null | Amf0Value::Undefined => {}
    }
}

/// Write an AMF0 string (marker + UTF-8 payload).
pub fn write_string(pkt: &mut Packet, s: &str) {
    pkt.write_u8(STRING_MARKER);
    write_utf8(pkt, s);
}

/// Write an AMF0 number.
pub fn write_number(pkt: &mut Packet, n: f64) {
    pkt.write_u8(NUMBER_MARKER);
    pkt.write_f64(n);
}

/// Write an AMF0 null marker.
pub fn write_null(pkt: &mut Packet) {
    pkt.write_u8(NULL_MARKER);
}

fn write_utf8(pkt: &mut Packet, s: &str) {
    pkt.write_u16(s.len() as u16);
    pkt.write_bytes(s.as_bytes());
}

fn write_properties(pkt: &mut Packet, props: &[(String, Amf0Value)]) {
    for (key, value) in props {
        write_utf8(pkt, key);
        write_value(pkt, value);
    }
    pkt.write_u16(0);
    pkt.write_u8(END_OBJECT_MARKER);
}
