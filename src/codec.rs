//! Entry codec.
//!
//! A record is three msgpack unsigned integers (type, timestamp, payload
//! length) followed by exactly `length` bytes of msgpack payload. Payloads
//! of known kinds are maps or arrays; fields equal to their default are left
//! out on encode and filled back in on decode. Keys and elements the decoder
//! does not recognize are kept in the entry's additional data so they survive
//! a rewrite.

use crate::error::{Result, ShadaError};
use crate::flags::EntryMask;
use crate::reader::{ReadItem, ShadaReader};
use crate::types::{
    BufferList, BufferListItem, Entry, EntryData, EntryKind, FileMark, GlobalVariable, Header,
    HistoryItem, HistoryType, MotionType, Position, Register, SearchPattern, SubString, Timestamp,
    UnknownItem, VarValue,
};
use crate::value::{
    read_shallow, AdditionalData, AdditionalElements, ParseError, RawValue, Shallow, Spanned,
    Value,
};
use std::io::{self, Write};
use thiserror::Error;

/// Additional element marking a binary variable value as a blob.
pub const VAR_TYPE_BLOB: u64 = 10;

/// Why a payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not msgpack, or not framed like a ShaDa record. Fatal to a read.
    #[error("not a ShaDa record: {0}")]
    NotShaDa(String),
    /// Valid msgpack with the wrong structure. The record is skipped.
    #[error("malformed entry: {0}")]
    Malformed(String),
}

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

// --- Framing ---

/// Write one record header plus payload.
pub fn write_record<W: Write>(
    out: &mut W,
    type_code: u64,
    timestamp: Timestamp,
    payload: &[u8],
) -> io::Result<()> {
    write_header_uint(out, type_code)?;
    write_header_uint(out, timestamp.0)?;
    write_header_uint(out, payload.len() as u64)?;
    out.write_all(payload)
}

fn write_header_uint<W: Write>(out: &mut W, value: u64) -> io::Result<()> {
    rmp::encode::write_uint(out, value).map(|_| ()).map_err(io_error)
}

fn io_error(e: rmp::encode::ValueWriteError<io::Error>) -> io::Error {
    match e {
        rmp::encode::ValueWriteError::InvalidMarkerWrite(e)
        | rmp::encode::ValueWriteError::InvalidDataWrite(e) => e,
    }
}

/// Encode an entry's payload.
///
/// Fails with [`ShadaError::Unencodable`] when the entry holds a value that
/// has no on-disk form, such as a function reference.
pub fn encode_payload(entry: &Entry) -> Result<Vec<u8>> {
    if let EntryData::Unknown(item) = &entry.data {
        return Ok(item.contents.clone());
    }
    encode_data(&entry.data)
}

/// Encode a whole record.
pub fn encode(entry: &Entry) -> Result<Vec<u8>> {
    let payload = encode_payload(entry)?;
    let mut out = Vec::with_capacity(payload.len() + 12);
    write_record(&mut out, entry.type_code(), entry.timestamp, &payload)?;
    Ok(out)
}

/// Encode and write a record, unless its payload is larger than
/// `max_kbyte` KiB (0 means no limit). Returns whether it was written.
pub fn write_entry<W: Write>(out: &mut W, entry: &Entry, max_kbyte: u64) -> Result<bool> {
    let payload = encode_payload(entry)?;
    if max_kbyte != 0 && payload.len() as u64 > max_kbyte.saturating_mul(1024) {
        return Ok(false);
    }
    write_record(out, entry.type_code(), entry.timestamp, &payload)?;
    Ok(true)
}

/// Decode one complete record from the start of `bytes`.
pub fn decode(bytes: &[u8]) -> DecodeResult<Entry> {
    let mut reader = ShadaReader::new(bytes);
    match reader.next_item(EntryMask::all(), 0) {
        Ok(ReadItem::Entry(entry)) => Ok(entry),
        Ok(ReadItem::Malformed { reason, .. }) => Err(DecodeError::Malformed(reason)),
        Ok(ReadItem::Finished) => Err(DecodeError::NotShaDa("no record".to_string())),
        Err(e) => Err(DecodeError::NotShaDa(e.to_string())),
    }
}

/// Parse a payload as exactly one msgpack value, keeping the bytes of its
/// top-level children.
pub(crate) fn parse_payload(payload: &[u8]) -> DecodeResult<Shallow<'_>> {
    let mut rd = payload;
    let value = read_shallow(&mut rd).map_err(classify_parse_error)?;
    if !rd.is_empty() {
        return Err(DecodeError::NotShaDa(format!(
            "there are {} bytes after the payload",
            rd.len()
        )));
    }
    Ok(value)
}

fn classify_parse_error(err: ParseError) -> DecodeError {
    match err {
        ParseError::TooDeep => DecodeError::Malformed(format!("contains a value that {err}")),
        ParseError::Truncated | ParseError::Reserved | ParseError::Trailing(_) => {
            DecodeError::NotShaDa(err.to_string())
        }
    }
}

/// Decode a payload of the given type.
pub fn decode_payload(type_code: u64, timestamp: Timestamp, payload: &[u8]) -> DecodeResult<Entry> {
    let kind = match EntryKind::from_code(type_code) {
        Some(kind) => kind,
        None => {
            return Ok(Entry::new(
                timestamp,
                EntryData::Unknown(UnknownItem {
                    type_code,
                    contents: payload.to_vec(),
                }),
            ))
        }
    };
    let value = parse_payload(payload)?;
    let data = match kind {
        EntryKind::Header => EntryData::Header(decode_header(value)),
        EntryKind::SearchPattern => EntryData::SearchPattern(decode_search_pattern(value)?),
        EntryKind::SubString => EntryData::SubString(decode_sub_string(value)?),
        EntryKind::HistoryEntry => EntryData::HistoryItem(decode_history(value)?),
        EntryKind::Register => EntryData::Register(decode_register(value)?),
        EntryKind::Variable => EntryData::GlobalVariable(decode_variable(value)?),
        EntryKind::GlobalMark => EntryData::GlobalMark(decode_file_mark(value, kind)?),
        EntryKind::Jump => EntryData::Jump(decode_file_mark(value, kind)?),
        EntryKind::LocalMark => EntryData::LocalMark(decode_file_mark(value, kind)?),
        EntryKind::Change => EntryData::Change(decode_file_mark(value, kind)?),
        EntryKind::BufferList => EntryData::BufferList(decode_buffer_list(value)?),
        EntryKind::Missing => {
            return Err(DecodeError::NotShaDa("has entry with type 0".to_string()))
        }
    };
    Ok(Entry::new(timestamp, data))
}

// --- Encoding ---

fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

fn bin(text: &str) -> Value {
    Value::Binary(text.as_bytes().to_vec())
}

/// A map or array payload being built. Children are encoded as they are
/// added; raw children are copied in unchanged.
struct Container {
    is_map: bool,
    len: u32,
    body: Vec<u8>,
}

impl Container {
    fn map() -> Self {
        Self {
            is_map: true,
            len: 0,
            body: Vec::new(),
        }
    }

    fn array() -> Self {
        Self {
            is_map: false,
            ..Self::map()
        }
    }

    fn bump(&mut self) -> Result<()> {
        self.len = self
            .len
            .checked_add(1)
            .ok_or_else(|| ShadaError::Unencodable("container is too large".to_string()))?;
        Ok(())
    }

    fn push_encoded(&mut self, value: &Value) -> Result<()> {
        rmp_serde::encode::write(&mut self.body, value)?;
        Ok(())
    }

    /// Array element.
    fn element(&mut self, value: &Value) -> Result<()> {
        self.push_encoded(value)?;
        self.bump()
    }

    fn raw_element(&mut self, raw: &[u8]) -> Result<()> {
        self.body.extend_from_slice(raw);
        self.bump()
    }

    fn entry(&mut self, key: &Value, value: &Value) -> Result<()> {
        self.push_encoded(key)?;
        self.push_encoded(value)?;
        self.bump()
    }

    fn field(&mut self, name: &str, value: &Value) -> Result<()> {
        self.entry(&key(name), value)
    }

    fn flag(&mut self, name: &str, value: bool, default: bool) -> Result<()> {
        if value != default {
            self.field(name, &Value::Boolean(value))?;
        }
        Ok(())
    }

    fn position(&mut self, position: Position) -> Result<()> {
        let defaults = Position::default();
        if position.line != defaults.line {
            self.field("l", &Value::from(position.line))?;
        }
        if position.col != defaults.col {
            self.field("c", &Value::from(position.col))?;
        }
        Ok(())
    }

    fn additional_data(&mut self, additional: &AdditionalData) -> Result<()> {
        for (name, raw) in additional {
            self.push_encoded(&key(name))?;
            self.body.extend_from_slice(raw.as_bytes());
            self.bump()?;
        }
        Ok(())
    }

    fn additional_elements(&mut self, additional: &AdditionalElements) -> Result<()> {
        for raw in additional {
            self.raw_element(raw.as_bytes())?;
        }
        Ok(())
    }

    fn finish(self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.body.len() + 5);
        if self.is_map {
            rmp::encode::write_map_len(&mut out, self.len).map_err(io_error)?;
        } else {
            rmp::encode::write_array_len(&mut out, self.len).map_err(io_error)?;
        }
        out.extend_from_slice(&self.body);
        Ok(out)
    }
}

fn default_mark_name(kind: EntryKind) -> char {
    match kind {
        EntryKind::Jump | EntryKind::Change => '\0',
        _ => '"',
    }
}

fn encode_data(data: &EntryData) -> Result<Vec<u8>> {
    match data {
        EntryData::Header(header) => {
            let mut map = Container::map();
            for (k, v) in &header.fields {
                map.entry(k, v)?;
            }
            map.finish()
        }
        EntryData::SearchPattern(sp) => {
            let defaults = SearchPattern::default();
            let mut map = Container::map();
            map.field("sp", &bin(&sp.pattern))?;
            map.flag("sm", sp.magic, defaults.magic)?;
            map.flag("su", sp.is_last_used, defaults.is_last_used)?;
            map.flag("sc", sp.smartcase, defaults.smartcase)?;
            map.flag("sl", sp.has_line_offset, defaults.has_line_offset)?;
            map.flag("se", sp.place_cursor_at_end, defaults.place_cursor_at_end)?;
            map.flag("ss", sp.is_substitute_pattern, defaults.is_substitute_pattern)?;
            map.flag("sh", sp.highlighted, defaults.highlighted)?;
            map.flag("sb", sp.search_backward, defaults.search_backward)?;
            if sp.offset != defaults.offset {
                map.field("so", &Value::from(sp.offset))?;
            }
            map.additional_data(&sp.additional_data)?;
            map.finish()
        }
        EntryData::SubString(sub) => {
            let mut items = Container::array();
            items.element(&bin(&sub.replacement))?;
            items.additional_elements(&sub.additional_elements)?;
            items.finish()
        }
        EntryData::HistoryItem(item) => {
            let mut items = Container::array();
            items.element(&Value::UInt(u64::from(item.history_type)))?;
            items.element(&bin(&item.line))?;
            if item.kind() == Some(HistoryType::Search) {
                items.element(&Value::UInt(u64::from(item.separator)))?;
            }
            items.additional_elements(&item.additional_elements)?;
            items.finish()
        }
        EntryData::Register(reg) => {
            let mut map = Container::map();
            map.field(
                "rc",
                &Value::Array(reg.contents.iter().map(|line| bin(line)).collect()),
            )?;
            map.field("n", &Value::UInt(u64::from(reg.name)))?;
            if reg.motion != MotionType::CharWise {
                map.field("rt", &Value::UInt(u64::from(reg.motion.code())))?;
            }
            if reg.width != 0 {
                map.field("rw", &Value::UInt(reg.width))?;
            }
            map.flag("ru", reg.is_unnamed, false)?;
            map.additional_data(&reg.additional_data)?;
            map.finish()
        }
        EntryData::GlobalVariable(var) => {
            let mut items = Container::array();
            items.element(&bin(&var.name))?;
            if let VarValue::Blob(bytes) = &var.value {
                items.element(&Value::Binary(bytes.clone()))?;
                items.element(&Value::UInt(VAR_TYPE_BLOB))?;
            } else {
                items.element(&var_to_value(&var.value)?)?;
            }
            items.additional_elements(&var.additional_elements)?;
            items.finish()
        }
        EntryData::GlobalMark(mark) => encode_file_mark(mark, EntryKind::GlobalMark),
        EntryData::Jump(mark) => encode_file_mark(mark, EntryKind::Jump),
        EntryData::LocalMark(mark) => encode_file_mark(mark, EntryKind::LocalMark),
        EntryData::Change(mark) => encode_file_mark(mark, EntryKind::Change),
        EntryData::BufferList(list) => {
            let mut items = Container::array();
            for buf in &list.buffers {
                let mut map = Container::map();
                map.field("f", &bin(&buf.file))?;
                map.position(buf.position)?;
                map.additional_data(&buf.additional_data)?;
                items.raw_element(&map.finish()?)?;
            }
            items.finish()
        }
        EntryData::Unknown(item) => Ok(item.contents.clone()),
    }
}

fn encode_file_mark(mark: &FileMark, kind: EntryKind) -> Result<Vec<u8>> {
    let mut map = Container::map();
    map.field("f", &bin(&mark.file))?;
    map.position(mark.position)?;
    let default_name = default_mark_name(kind);
    if default_name != '\0' && mark.name != default_name {
        map.field("n", &Value::UInt(u64::from(mark.name)))?;
    }
    map.additional_data(&mark.additional_data)?;
    map.finish()
}

/// Convert a variable value to its on-disk form.
pub fn var_to_value(value: &VarValue) -> Result<Value> {
    let converted = match value {
        VarValue::Null => Value::Nil,
        VarValue::Bool(b) => Value::Boolean(*b),
        VarValue::Number(n) => Value::from(*n),
        VarValue::Float(f) => Value::F64(*f),
        VarValue::String(s) => bin(s),
        VarValue::Blob(bytes) => Value::Binary(bytes.clone()),
        VarValue::List(items) => Value::Array(
            items
                .iter()
                .map(var_to_value)
                .collect::<Result<Vec<_>>>()?,
        ),
        VarValue::Dict(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| Ok((bin(k), var_to_value(v)?)))
                .collect::<Result<Vec<_>>>()?,
        ),
        VarValue::Funcref(name) => {
            return Err(ShadaError::Unencodable(format!(
                "attempt to dump function reference {name}"
            )))
        }
    };
    Ok(converted)
}

// --- Decoding ---

fn malformed(message: String) -> DecodeError {
    DecodeError::Malformed(message)
}

/// Split a map payload into string keys and values.
fn expect_map<'a>(value: Shallow<'a>, what: &str) -> DecodeResult<Vec<(String, Spanned<'a>)>> {
    let Shallow::Map(entries) = value else {
        return Err(malformed(format!("{what} entry is not a dictionary")));
    };
    entries
        .into_iter()
        .map(|(k, v)| match k {
            Value::String(name) if !name.is_empty() => Ok((name, v)),
            Value::String(_) => Err(malformed(format!("{what} entry has empty key"))),
            _ => Err(malformed(format!("{what} entry has key which is not a string"))),
        })
        .collect()
}

fn expect_array<'a>(value: Shallow<'a>, what: &str) -> DecodeResult<Vec<Spanned<'a>>> {
    match value {
        Shallow::Array(items) => Ok(items),
        _ => Err(malformed(format!("{what} entry is not an array"))),
    }
}

fn raw_elements<'a>(items: impl Iterator<Item = Spanned<'a>>) -> AdditionalElements {
    items.map(|item| item.to_raw()).collect()
}

fn expect_bool(value: Value, what: &str, name: &str) -> DecodeResult<bool> {
    value.as_bool().ok_or_else(|| {
        malformed(format!(
            "{what} entry has {name} key value which is not a boolean"
        ))
    })
}

fn expect_uint(value: Value, what: &str, name: &str) -> DecodeResult<u64> {
    value.as_u64().ok_or_else(|| {
        malformed(format!(
            "{what} entry has {name} key value which is not an unsigned integer"
        ))
    })
}

fn expect_int(value: Value, what: &str, name: &str) -> DecodeResult<i64> {
    value.as_i64().ok_or_else(|| {
        malformed(format!(
            "{what} entry has {name} key value which is not an integer"
        ))
    })
}

fn expect_char(value: Value, what: &str, name: &str) -> DecodeResult<char> {
    let code = expect_uint(value, what, name)?;
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| malformed(format!("{what} entry has invalid {name} key value {code}")))
}

fn expect_string(value: Value, what: &str, name: &str) -> DecodeResult<String> {
    match value {
        Value::Binary(bytes) => String::from_utf8(bytes).map_err(|_| {
            malformed(format!("{what} entry has {name} key value which is not valid UTF-8"))
        }),
        _ => Err(malformed(format!(
            "{what} entry has {name} key value which is not a binary"
        ))),
    }
}

fn decode_header(value: Shallow<'_>) -> Header {
    // Headers are informational; a header that is not a map has no fields.
    let fields = match value {
        Shallow::Map(entries) => entries.into_iter().map(|(k, v)| (k, v.value)).collect(),
        _ => Vec::new(),
    };
    Header { fields }
}

fn decode_search_pattern(value: Shallow<'_>) -> DecodeResult<SearchPattern> {
    const WHAT: &str = "search pattern";
    let mut sp = SearchPattern::default();
    let mut pattern = None;
    for (name, field) in expect_map(value, WHAT)? {
        let Spanned { value, raw } = field;
        match name.as_str() {
            "sm" => sp.magic = expect_bool(value, WHAT, "sm")?,
            "su" => sp.is_last_used = expect_bool(value, WHAT, "su")?,
            "sc" => sp.smartcase = expect_bool(value, WHAT, "sc")?,
            "sl" => sp.has_line_offset = expect_bool(value, WHAT, "sl")?,
            "se" => sp.place_cursor_at_end = expect_bool(value, WHAT, "se")?,
            "ss" => sp.is_substitute_pattern = expect_bool(value, WHAT, "ss")?,
            "sh" => sp.highlighted = expect_bool(value, WHAT, "sh")?,
            "sb" => sp.search_backward = expect_bool(value, WHAT, "sb")?,
            "so" => sp.offset = expect_int(value, WHAT, "so")?,
            "sp" => pattern = Some(expect_string(value, WHAT, "sp")?),
            _ => sp.additional_data.push((name, RawValue::copied(raw))),
        }
    }
    sp.pattern = pattern.ok_or_else(|| malformed(format!("{WHAT} entry has no pattern")))?;
    Ok(sp)
}

fn decode_sub_string(value: Shallow<'_>) -> DecodeResult<SubString> {
    const WHAT: &str = "sub string";
    let mut items = expect_array(value, WHAT)?.into_iter();
    let first = items
        .next()
        .ok_or_else(|| malformed(format!("{WHAT} entry does not have enough elements")))?;
    let replacement = expect_string(first.value, WHAT, "replacement")?;
    Ok(SubString {
        replacement,
        additional_elements: raw_elements(items),
    })
}

fn decode_history(value: Shallow<'_>) -> DecodeResult<HistoryItem> {
    const WHAT: &str = "history";
    let items = expect_array(value, WHAT)?;
    if items.len() < 2 {
        return Err(malformed(format!("{WHAT} entry does not have enough elements")));
    }
    let mut items = items.into_iter();
    let history_type = items
        .next()
        .and_then(|v| v.value.as_u64())
        .and_then(|code| u8::try_from(code).ok())
        .ok_or_else(|| malformed(format!("{WHAT} entry has wrong history type type")))?;
    let line = match items.next().map(|item| item.value) {
        Some(Value::Binary(bytes)) => {
            if bytes.contains(&0) {
                return Err(malformed(format!(
                    "{WHAT} entry contains string with zero byte inside"
                )));
            }
            String::from_utf8(bytes)
                .map_err(|_| malformed(format!("{WHAT} entry has string which is not valid UTF-8")))?
        }
        _ => return Err(malformed(format!("{WHAT} entry has wrong history string type"))),
    };
    let separator = if history_type == HistoryType::Search.code() {
        items
            .next()
            .ok_or_else(|| {
                malformed(format!(
                    "search {WHAT} entry does not have separator character"
                ))
            })?
            .value
            .as_u64()
            .and_then(|code| u8::try_from(code).ok())
            .ok_or_else(|| malformed(format!("search {WHAT} entry has wrong separator type")))?
    } else {
        0
    };
    Ok(HistoryItem {
        history_type,
        line,
        separator,
        additional_elements: raw_elements(items),
    })
}

fn decode_register(value: Shallow<'_>) -> DecodeResult<Register> {
    const WHAT: &str = "register";
    let mut reg = Register {
        name: '\0',
        contents: Vec::new(),
        motion: MotionType::CharWise,
        width: 0,
        is_unnamed: false,
        additional_data: Vec::new(),
    };
    let mut contents = None;
    for (name, field) in expect_map(value, WHAT)? {
        let Spanned { value, raw } = field;
        match name.as_str() {
            "rc" => {
                let lines = match value {
                    Value::Array(lines) => lines,
                    _ => {
                        return Err(malformed(format!(
                            "{WHAT} entry has rc key value which is not an array"
                        )))
                    }
                };
                if lines.is_empty() {
                    return Err(malformed(format!(
                        "{WHAT} entry has rc key with empty array"
                    )));
                }
                let lines = lines
                    .into_iter()
                    .map(|line| expect_string(line, WHAT, "rc array"))
                    .collect::<DecodeResult<Vec<_>>>()?;
                contents = Some(lines);
            }
            "rt" => {
                let code = expect_uint(value, WHAT, "rt")?;
                let code = u8::try_from(code)
                    .map_err(|_| malformed(format!("{WHAT} entry has invalid rt key value")))?;
                reg.motion = MotionType::from_code(code);
            }
            "rw" => reg.width = expect_uint(value, WHAT, "rw")?,
            "ru" => reg.is_unnamed = expect_bool(value, WHAT, "ru")?,
            "n" => reg.name = expect_char(value, WHAT, "n")?,
            _ => reg.additional_data.push((name, RawValue::copied(raw))),
        }
    }
    reg.contents = contents
        .ok_or_else(|| malformed(format!("{WHAT} entry has missing rc array")))?;
    Ok(reg)
}

/// Convert an on-disk variable value to its in-session form.
pub fn var_from_value(value: Value) -> std::result::Result<VarValue, String> {
    let converted = match value {
        Value::Nil => VarValue::Null,
        Value::Boolean(b) => VarValue::Bool(b),
        Value::UInt(u) => {
            VarValue::Number(i64::try_from(u).map_err(|_| format!("integer {u} is too large"))?)
        }
        Value::Int(i) => VarValue::Number(i),
        Value::F32(f) => VarValue::Float(f64::from(f)),
        Value::F64(f) => VarValue::Float(f),
        Value::String(s) => VarValue::String(s),
        Value::Binary(bytes) => VarValue::String(
            String::from_utf8(bytes).map_err(|_| "string is not valid UTF-8".to_string())?,
        ),
        Value::Array(items) => VarValue::List(
            items
                .into_iter()
                .map(var_from_value)
                .collect::<std::result::Result<Vec<_>, _>>()?,
        ),
        Value::Map(entries) => VarValue::Dict(
            entries
                .into_iter()
                .map(|(k, v)| {
                    let name = match k {
                        Value::String(s) => s,
                        Value::Binary(bytes) => String::from_utf8(bytes)
                            .map_err(|_| "dictionary key is not valid UTF-8".to_string())?,
                        other => {
                            return Err(format!(
                                "dictionary key is a {}, not a string",
                                other.type_name()
                            ))
                        }
                    };
                    Ok((name, var_from_value(v)?))
                })
                .collect::<std::result::Result<Vec<_>, _>>()?,
        ),
        Value::Ext(tag, _) => return Err(format!("extension type {tag} has no variable form")),
    };
    Ok(converted)
}

fn decode_variable(value: Shallow<'_>) -> DecodeResult<GlobalVariable> {
    const WHAT: &str = "variable";
    let items = expect_array(value, WHAT)?;
    if items.len() < 2 {
        return Err(malformed(format!("{WHAT} entry does not have enough elements")));
    }
    let mut items = items.into_iter();
    let name = match items.next().map(|item| item.value) {
        Some(Value::Binary(bytes)) => String::from_utf8(bytes)
            .map_err(|_| malformed(format!("{WHAT} entry has name which is not valid UTF-8")))?,
        _ => return Err(malformed(format!("{WHAT} entry has wrong variable name type"))),
    };
    let raw = items.next().map_or(Value::Nil, |item| item.value);
    let mut rest = items.peekable();

    let value = match raw {
        Value::Binary(bytes) if rest.peek().is_some() => {
            if rest.next().map(|item| item.value) != Some(Value::UInt(VAR_TYPE_BLOB)) {
                return Err(malformed(format!("{WHAT} entry has wrong variable type")));
            }
            VarValue::Blob(bytes)
        }
        other => var_from_value(other).map_err(|reason| {
            malformed(format!("{WHAT} entry has value that cannot be converted: {reason}"))
        })?,
    };
    Ok(GlobalVariable {
        name,
        value,
        additional_elements: raw_elements(rest),
    })
}

fn decode_position(
    position: &mut Position,
    name: &str,
    value: Value,
    what: &str,
) -> DecodeResult<()> {
    match name {
        "l" => position.line = expect_int(value, what, "l")?,
        _ => position.col = expect_int(value, what, "c")?,
    }
    Ok(())
}

fn check_position(position: Position, what: &str) -> DecodeResult<()> {
    if position.line <= 0 {
        return Err(malformed(format!("{what} entry has invalid line number")));
    }
    if position.col < 0 {
        return Err(malformed(format!("{what} entry has invalid column number")));
    }
    Ok(())
}

fn decode_file_mark(value: Shallow<'_>, kind: EntryKind) -> DecodeResult<FileMark> {
    let what = kind.name();
    let mut mark = FileMark::new(default_mark_name(kind), String::new(), Position::default());
    let mut file = None;
    for (name, field) in expect_map(value, what)? {
        let Spanned { value, raw } = field;
        match name.as_str() {
            "n" => {
                if matches!(kind, EntryKind::Jump | EntryKind::Change) {
                    return Err(malformed(format!(
                        "{what} entry has n key which is only valid for local and global mark entries"
                    )));
                }
                mark.name = expect_char(value, what, "n")?;
            }
            "l" | "c" => decode_position(&mut mark.position, &name, value, what)?,
            "f" => file = Some(expect_string(value, what, "f")?),
            _ => mark.additional_data.push((name, RawValue::copied(raw))),
        }
    }
    mark.file = file.ok_or_else(|| malformed(format!("{what} entry is missing file name")))?;
    check_position(mark.position, what)?;
    Ok(mark)
}

fn decode_buffer_list(value: Shallow<'_>) -> DecodeResult<BufferList> {
    const WHAT: &str = "buffer list";
    let mut buffers = Vec::new();
    for item in expect_array(value, WHAT)? {
        let mut rd = item.raw;
        let item = read_shallow(&mut rd).map_err(classify_parse_error)?;
        let mut position = Position::default();
        let mut file = None;
        let mut additional_data = Vec::new();
        for (name, field) in expect_map(item, WHAT)? {
            let Spanned { value, raw } = field;
            match name.as_str() {
                "l" | "c" => decode_position(&mut position, &name, value, WHAT)?,
                "f" => file = Some(expect_string(value, WHAT, "f")?),
                _ => additional_data.push((name, RawValue::copied(raw))),
            }
        }
        let file =
            file.ok_or_else(|| malformed(format!("{WHAT} entry is missing file name")))?;
        check_position(position, WHAT)?;
        buffers.push(BufferListItem {
            file,
            position,
            additional_data,
        });
    }
    Ok(BufferList { buffers })
}
