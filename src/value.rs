//! msgpack values.
//!
//! [`Value`] is the decoded tree the codec works with. Anything a record
//! carries that this version does not interpret (unknown map keys, trailing
//! array elements) is kept as a [`RawValue`] instead: the exact bytes it was
//! read from, written back untouched.

use crate::error::Result;
use rmp::Marker;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use thiserror::Error;

/// Name rmp-serde recognizes for msgpack ext values.
const EXT_STRUCT_NAME: &str = "_ExtStruct";

/// Containers nested deeper than this are rejected.
pub const MAX_DEPTH: usize = 512;

/// A generic msgpack value.
///
/// Integers are split by sign: non-negative values always live in
/// [`Value::UInt`], negative ones in [`Value::Int`], whichever marker they
/// were read from. Use `Value::from(i64)` to get the normalized form.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Boolean(bool),
    UInt(u64),
    Int(i64),
    F32(f32),
    F64(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    /// Application-defined type tag plus data.
    Ext(i8, Vec<u8>),
}

/// Unknown map entries of a map-shaped record, in file order.
pub type AdditionalData = Vec<(String, RawValue)>;

/// Unknown trailing elements of an array-shaped record.
pub type AdditionalElements = Vec<RawValue>;

impl Value {
    /// Binary string value.
    pub fn bin(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Binary(bytes.into())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Non-negative integer.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(u) => Some(*u),
            _ => None,
        }
    }

    /// Any integer that fits in an `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::UInt(u) => i64::try_from(*u).ok(),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(f) => Some(f64::from(*f)),
            Value::F64(f) => Some(*f),
            _ => None,
        }
    }

    /// Contents of a msgpack BIN value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Contents of a msgpack STR value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// msgpack type name, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::UInt(_) => "positive integer",
            Value::Int(_) => "negative integer",
            Value::F32(_) | Value::F64(_) => "float",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Ext(..) => "extension",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::UInt(u)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        if i >= 0 {
            Value::UInt(i as u64)
        } else {
            Value::Int(i)
        }
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::F64(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Nil => serializer.serialize_unit(),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::UInt(u) => serializer.serialize_u64(*u),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::F32(f) => serializer.serialize_f32(*f),
            Value::F64(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Binary(b) => serializer.serialize_bytes(b),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Value::Ext(tag, data) => {
                serializer.serialize_newtype_struct(EXT_STRUCT_NAME, &(*tag, ExtData(data)))
            }
        }
    }
}

struct ExtData<'a>(&'a [u8]);

impl Serialize for ExtData<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

// --- Raw values ---

/// One msgpack value, kept as the bytes it was read from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RawValue(Vec<u8>);

impl RawValue {
    /// Encode a value.
    pub fn encode(value: &Value) -> Result<Self> {
        Ok(RawValue(rmp_serde::to_vec(value)?))
    }

    /// Wrap bytes holding exactly one msgpack value.
    pub fn from_slice(bytes: &[u8]) -> std::result::Result<Self, ParseError> {
        let mut rd = bytes;
        read_value(&mut rd)?;
        if !rd.is_empty() {
            return Err(ParseError::Trailing(rd.len()));
        }
        Ok(RawValue(bytes.to_vec()))
    }

    /// Copy bytes already known to hold one value.
    pub(crate) fn copied(raw: &[u8]) -> Self {
        RawValue(raw.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn decode(&self) -> std::result::Result<Value, ParseError> {
        read_value(&mut self.0.as_slice())
    }
}

impl Serialize for RawValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.decode() {
            Ok(value) => value.serialize(serializer),
            Err(_) => serializer.serialize_bytes(&self.0),
        }
    }
}

// --- Reading ---

/// Why bytes could not be read as msgpack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("was not enough bytes to parse the entry")]
    Truncated,
    #[error("uses the reserved msgpack marker 0xc1")]
    Reserved,
    #[error("nests containers more than {} levels deep", MAX_DEPTH)]
    TooDeep,
    #[error("there are {0} bytes after the value")]
    Trailing(usize),
}

type ParseResult<T> = std::result::Result<T, ParseError>;

/// A value together with the bytes it was read from.
#[derive(Debug)]
pub(crate) struct Spanned<'a> {
    pub value: Value,
    pub raw: &'a [u8],
}

impl Spanned<'_> {
    pub fn to_raw(&self) -> RawValue {
        RawValue::copied(self.raw)
    }
}

/// A value read one level deep: the children of a container keep their bytes.
#[derive(Debug)]
pub(crate) enum Shallow<'a> {
    Map(Vec<(Value, Spanned<'a>)>),
    Array(Vec<Spanned<'a>>),
    Scalar(Value),
}

enum Head {
    Array(usize),
    Map(usize),
    Scalar(Value),
}

fn take<'a>(rd: &mut &'a [u8], n: usize) -> ParseResult<&'a [u8]> {
    if rd.len() < n {
        return Err(ParseError::Truncated);
    }
    let (head, tail) = rd.split_at(n);
    *rd = tail;
    Ok(head)
}

fn read_be(rd: &mut &[u8], n: usize) -> ParseResult<u64> {
    Ok(take(rd, n)?
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
}

fn read_signed(rd: &mut &[u8], n: usize) -> ParseResult<i64> {
    let shift = 64 - 8 * n as u32;
    Ok(((read_be(rd, n)? << shift) as i64) >> shift)
}

fn read_len(rd: &mut &[u8], n: usize) -> ParseResult<usize> {
    usize::try_from(read_be(rd, n)?).map_err(|_| ParseError::Truncated)
}

/// Read a marker plus whatever follows it, up to a container's elements.
fn read_head(rd: &mut &[u8]) -> ParseResult<Head> {
    let value = match Marker::from_u8(take(rd, 1)?[0]) {
        Marker::FixArray(n) => return Ok(Head::Array(usize::from(n))),
        Marker::Array16 => return Ok(Head::Array(read_len(rd, 2)?)),
        Marker::Array32 => return Ok(Head::Array(read_len(rd, 4)?)),
        Marker::FixMap(n) => return Ok(Head::Map(usize::from(n))),
        Marker::Map16 => return Ok(Head::Map(read_len(rd, 2)?)),
        Marker::Map32 => return Ok(Head::Map(read_len(rd, 4)?)),
        Marker::Null => Value::Nil,
        Marker::True => Value::Boolean(true),
        Marker::False => Value::Boolean(false),
        Marker::FixPos(n) => Value::UInt(u64::from(n)),
        Marker::FixNeg(n) => Value::Int(i64::from(n)),
        Marker::U8 => Value::UInt(read_be(rd, 1)?),
        Marker::U16 => Value::UInt(read_be(rd, 2)?),
        Marker::U32 => Value::UInt(read_be(rd, 4)?),
        Marker::U64 => Value::UInt(read_be(rd, 8)?),
        Marker::I8 => Value::from(read_signed(rd, 1)?),
        Marker::I16 => Value::from(read_signed(rd, 2)?),
        Marker::I32 => Value::from(read_signed(rd, 4)?),
        Marker::I64 => Value::from(read_signed(rd, 8)?),
        Marker::F32 => Value::F32(f32::from_bits(read_be(rd, 4)? as u32)),
        Marker::F64 => Value::F64(f64::from_bits(read_be(rd, 8)?)),
        Marker::FixStr(n) => read_str(rd, usize::from(n))?,
        Marker::Str8 => read_str_with_len(rd, 1)?,
        Marker::Str16 => read_str_with_len(rd, 2)?,
        Marker::Str32 => read_str_with_len(rd, 4)?,
        Marker::Bin8 => read_bin(rd, 1)?,
        Marker::Bin16 => read_bin(rd, 2)?,
        Marker::Bin32 => read_bin(rd, 4)?,
        Marker::FixExt1 => read_ext(rd, 1)?,
        Marker::FixExt2 => read_ext(rd, 2)?,
        Marker::FixExt4 => read_ext(rd, 4)?,
        Marker::FixExt8 => read_ext(rd, 8)?,
        Marker::FixExt16 => read_ext(rd, 16)?,
        Marker::Ext8 => read_ext_with_len(rd, 1)?,
        Marker::Ext16 => read_ext_with_len(rd, 2)?,
        Marker::Ext32 => read_ext_with_len(rd, 4)?,
        Marker::Reserved => return Err(ParseError::Reserved),
    };
    Ok(Head::Scalar(value))
}

fn read_str(rd: &mut &[u8], len: usize) -> ParseResult<Value> {
    let bytes = take(rd, len)?;
    // A STR that is not UTF-8 is still a byte string.
    Ok(match std::str::from_utf8(bytes) {
        Ok(s) => Value::String(s.to_string()),
        Err(_) => Value::Binary(bytes.to_vec()),
    })
}

fn read_str_with_len(rd: &mut &[u8], width: usize) -> ParseResult<Value> {
    let len = read_len(rd, width)?;
    read_str(rd, len)
}

fn read_bin(rd: &mut &[u8], width: usize) -> ParseResult<Value> {
    let len = read_len(rd, width)?;
    Ok(Value::Binary(take(rd, len)?.to_vec()))
}

fn read_ext(rd: &mut &[u8], len: usize) -> ParseResult<Value> {
    let tag = take(rd, 1)?[0] as i8;
    Ok(Value::Ext(tag, take(rd, len)?.to_vec()))
}

fn read_ext_with_len(rd: &mut &[u8], width: usize) -> ParseResult<Value> {
    let len = read_len(rd, width)?;
    read_ext(rd, len)
}

fn read_nested(rd: &mut &[u8], depth: usize) -> ParseResult<Value> {
    match read_head(rd)? {
        Head::Scalar(value) => Ok(value),
        _ if depth >= MAX_DEPTH => Err(ParseError::TooDeep),
        Head::Array(len) => {
            let mut items = Vec::with_capacity(len.min(rd.len()));
            for _ in 0..len {
                items.push(read_nested(rd, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        Head::Map(len) => {
            let mut entries = Vec::with_capacity(len.min(rd.len()));
            for _ in 0..len {
                let key = read_nested(rd, depth + 1)?;
                let value = read_nested(rd, depth + 1)?;
                entries.push((key, value));
            }
            Ok(Value::Map(entries))
        }
    }
}

/// Read one value from the front of `rd`, advancing it.
pub fn read_value(rd: &mut &[u8]) -> ParseResult<Value> {
    read_nested(rd, 0)
}

pub(crate) fn read_spanned<'a>(rd: &mut &'a [u8]) -> ParseResult<Spanned<'a>> {
    let start = *rd;
    let value = read_nested(rd, 1)?;
    let used = start.len() - rd.len();
    Ok(Spanned {
        value,
        raw: &start[..used],
    })
}

pub(crate) fn read_shallow<'a>(rd: &mut &'a [u8]) -> ParseResult<Shallow<'a>> {
    let mut ahead = *rd;
    match read_head(&mut ahead)? {
        Head::Scalar(value) => {
            *rd = ahead;
            Ok(Shallow::Scalar(value))
        }
        Head::Array(len) => {
            *rd = ahead;
            let mut items = Vec::with_capacity(len.min(rd.len()));
            for _ in 0..len {
                items.push(read_spanned(rd)?);
            }
            Ok(Shallow::Array(items))
        }
        Head::Map(len) => {
            *rd = ahead;
            let mut entries = Vec::with_capacity(len.min(rd.len()));
            for _ in 0..len {
                let key = read_nested(rd, 1)?;
                entries.push((key, read_spanned(rd)?));
            }
            Ok(Shallow::Map(entries))
        }
    }
}
