//! Core types for ShaDa records.

use crate::value::{AdditionalData, AdditionalElements, Value};
use serde::Serialize;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
///
/// Coarse on purpose: two events in the same second compare equal, so ties
/// are expected and every merge rule states how it breaks them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Timestamp(secs)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ts({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Record type tags as they appear on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum EntryKind {
    /// Reserved. Never written; fatal when read.
    Missing = 0,
    Header = 1,
    SearchPattern = 2,
    SubString = 3,
    HistoryEntry = 4,
    Register = 5,
    Variable = 6,
    GlobalMark = 7,
    Jump = 8,
    BufferList = 9,
    LocalMark = 10,
    Change = 11,
}

impl EntryKind {
    /// Highest type code this version understands.
    pub const LAST: u64 = 11;

    pub fn from_code(code: u64) -> Option<Self> {
        let kind = match code {
            0 => EntryKind::Missing,
            1 => EntryKind::Header,
            2 => EntryKind::SearchPattern,
            3 => EntryKind::SubString,
            4 => EntryKind::HistoryEntry,
            5 => EntryKind::Register,
            6 => EntryKind::Variable,
            7 => EntryKind::GlobalMark,
            8 => EntryKind::Jump,
            9 => EntryKind::BufferList,
            10 => EntryKind::LocalMark,
            11 => EntryKind::Change,
            _ => return None,
        };
        Some(kind)
    }

    pub fn code(self) -> u64 {
        self as u64
    }

    /// Human readable name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            EntryKind::Missing => "missing",
            EntryKind::Header => "header",
            EntryKind::SearchPattern => "search pattern",
            EntryKind::SubString => "sub string",
            EntryKind::HistoryEntry => "history",
            EntryKind::Register => "register",
            EntryKind::Variable => "variable",
            EntryKind::GlobalMark => "global mark",
            EntryKind::Jump => "jump",
            EntryKind::BufferList => "buffer list",
            EntryKind::LocalMark => "local mark",
            EntryKind::Change => "change",
        }
    }
}

/// Cursor position. Lines are 1-based, columns 0-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Position {
    pub line: i64,
    pub col: i64,
}

impl Position {
    pub fn new(line: i64, col: i64) -> Self {
        Self { line, col }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self { line: 1, col: 0 }
    }
}

// --- Name tables ---

/// Named global marks `A`-`Z`.
pub const NMARKS: usize = 26;
/// Numbered marks `0`-`9`.
pub const EXTRA_MARKS: usize = 10;
/// Local marks `a`-`z` plus `"`, `^` and `.`.
pub const NLOCALMARKS: usize = 29;
/// Jump list and change list capacity.
pub const JUMPLISTSIZE: usize = 100;
/// Registers `0`-`9`, `a`-`z` and `-`.
pub const NUM_SAVED_REGISTERS: usize = 37;
/// Number of history kinds.
pub const HIST_COUNT: usize = 5;

/// Index of a global mark: `A`-`Z` then `0`-`9`.
pub fn global_mark_index(name: char) -> Option<usize> {
    match name {
        'A'..='Z' => Some(name as usize - 'A' as usize),
        '0'..='9' => Some(NMARKS + name as usize - '0' as usize),
        _ => None,
    }
}

pub fn global_mark_name(index: usize) -> char {
    if index < NMARKS {
        (b'A' + index as u8) as char
    } else {
        (b'0' + (index - NMARKS) as u8) as char
    }
}

/// Index of a local mark that is saved to disk.
pub fn local_mark_index(name: char) -> Option<usize> {
    match name {
        'a'..='z' => Some(name as usize - 'a' as usize),
        '"' => Some(26),
        '^' => Some(27),
        '.' => Some(28),
        _ => None,
    }
}

pub fn local_mark_name(index: usize) -> char {
    match index {
        0..=25 => (b'a' + index as u8) as char,
        26 => '"',
        27 => '^',
        _ => '.',
    }
}

/// Index of a register that is saved to disk. Upper case names alias lower case.
pub fn register_index(name: char) -> Option<usize> {
    match name {
        '0'..='9' => Some(name as usize - '0' as usize),
        'a'..='z' => Some(10 + name as usize - 'a' as usize),
        'A'..='Z' => Some(10 + name as usize - 'A' as usize),
        '-' => Some(36),
        _ => None,
    }
}

pub fn register_name(index: usize) -> char {
    match index {
        0..=9 => (b'0' + index as u8) as char,
        10..=35 => (b'a' + (index - 10) as u8) as char,
        _ => '-',
    }
}

// --- History ---

/// History kinds, in on-disk order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum HistoryType {
    Cmd = 0,
    Search = 1,
    Expr = 2,
    Input = 3,
    Debug = 4,
}

impl HistoryType {
    pub const ALL: [HistoryType; HIST_COUNT] = [
        HistoryType::Cmd,
        HistoryType::Search,
        HistoryType::Expr,
        HistoryType::Input,
        HistoryType::Debug,
    ];

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Character of the `'shada'` item holding this kind's size.
    pub fn option_char(self) -> char {
        match self {
            HistoryType::Cmd => ':',
            HistoryType::Search => '/',
            HistoryType::Expr => '=',
            HistoryType::Input => '@',
            HistoryType::Debug => '>',
        }
    }
}

// --- Register contents ---

/// How a register's text is put.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Default)]
pub enum MotionType {
    #[default]
    CharWise,
    LineWise,
    BlockWise,
    /// A type written by a newer version.
    Other(u8),
}

impl MotionType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => MotionType::CharWise,
            1 => MotionType::LineWise,
            2 => MotionType::BlockWise,
            other => MotionType::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            MotionType::CharWise => 0,
            MotionType::LineWise => 1,
            MotionType::BlockWise => 2,
            MotionType::Other(code) => code,
        }
    }
}

/// Value of a global variable.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum VarValue {
    Null,
    Bool(bool),
    Number(i64),
    Float(f64),
    String(String),
    Blob(Vec<u8>),
    List(Vec<VarValue>),
    Dict(Vec<(String, VarValue)>),
    /// A function reference. Exists only in a live session, can't be saved.
    Funcref(String),
}

// --- Entries ---

/// Header written at the top of every file.
#[derive(Clone, Debug, PartialEq, Default, Serialize)]
pub struct Header {
    pub fields: Vec<(Value, Value)>,
}

impl Header {
    /// Header describing this writer.
    pub fn current(max_kbyte: u64) -> Self {
        Self {
            fields: vec![
                (Value::from("generator"), Value::from(env!("CARGO_PKG_NAME"))),
                (Value::from("version"), Value::from(env!("CARGO_PKG_VERSION"))),
                (Value::from("max_kbyte"), Value::UInt(max_kbyte)),
                (Value::from("pid"), Value::UInt(u64::from(std::process::id()))),
                (Value::from("encoding"), Value::from("utf-8")),
            ],
        }
    }
}

/// Last search or substitute pattern.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchPattern {
    pub pattern: String,
    pub magic: bool,
    pub is_last_used: bool,
    pub smartcase: bool,
    pub has_line_offset: bool,
    pub place_cursor_at_end: bool,
    pub is_substitute_pattern: bool,
    pub highlighted: bool,
    pub search_backward: bool,
    pub offset: i64,
    pub additional_data: AdditionalData,
}

impl Default for SearchPattern {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            magic: true,
            is_last_used: true,
            smartcase: false,
            has_line_offset: false,
            place_cursor_at_end: false,
            is_substitute_pattern: false,
            highlighted: false,
            search_backward: false,
            offset: 0,
            additional_data: Vec::new(),
        }
    }
}

/// Last `:substitute` replacement string.
#[derive(Clone, Debug, PartialEq, Default, Serialize)]
pub struct SubString {
    pub replacement: String,
    pub additional_elements: AdditionalElements,
}

/// One history line.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryItem {
    /// Raw kind code; codes past [`HistoryType::Debug`] are passed through.
    pub history_type: u8,
    pub line: String,
    /// Search direction character, only meaningful for search history.
    pub separator: u8,
    pub additional_elements: AdditionalElements,
}

impl HistoryItem {
    pub fn new(kind: HistoryType, line: impl Into<String>) -> Self {
        Self {
            history_type: kind.code(),
            line: line.into(),
            separator: if kind == HistoryType::Search { b'/' } else { 0 },
            additional_elements: Vec::new(),
        }
    }

    pub fn kind(&self) -> Option<HistoryType> {
        HistoryType::from_code(self.history_type)
    }
}

/// Contents of one register.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Register {
    pub name: char,
    pub contents: Vec<String>,
    pub motion: MotionType,
    pub width: u64,
    pub is_unnamed: bool,
    pub additional_data: AdditionalData,
}

/// A global variable.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GlobalVariable {
    pub name: String,
    pub value: VarValue,
    pub additional_elements: AdditionalElements,
}

/// A position inside a named file. Used by marks, jumps and changes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileMark {
    /// Mark name; NUL for jumps and changes.
    pub name: char,
    pub file: String,
    pub position: Position,
    pub additional_data: AdditionalData,
}

impl FileMark {
    pub fn new(name: char, file: impl Into<String>, position: Position) -> Self {
        Self {
            name,
            file: file.into(),
            position,
            additional_data: Vec::new(),
        }
    }
}

/// One buffer of the saved buffer list.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BufferListItem {
    pub file: String,
    pub position: Position,
    pub additional_data: AdditionalData,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize)]
pub struct BufferList {
    pub buffers: Vec<BufferListItem>,
}

/// A record with a type code this version does not know.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UnknownItem {
    pub type_code: u64,
    /// Raw payload bytes.
    pub contents: Vec<u8>,
}

/// Variant payload of an [`Entry`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum EntryData {
    Header(Header),
    SearchPattern(SearchPattern),
    SubString(SubString),
    HistoryItem(HistoryItem),
    Register(Register),
    GlobalVariable(GlobalVariable),
    GlobalMark(FileMark),
    Jump(FileMark),
    BufferList(BufferList),
    LocalMark(FileMark),
    Change(FileMark),
    Unknown(UnknownItem),
}

/// A single record.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Entry {
    pub timestamp: Timestamp,
    pub data: EntryData,
}

impl Entry {
    pub fn new(timestamp: Timestamp, data: EntryData) -> Self {
        Self { timestamp, data }
    }

    /// Known kind, or `None` for unknown records.
    pub fn kind(&self) -> Option<EntryKind> {
        let kind = match &self.data {
            EntryData::Header(_) => EntryKind::Header,
            EntryData::SearchPattern(_) => EntryKind::SearchPattern,
            EntryData::SubString(_) => EntryKind::SubString,
            EntryData::HistoryItem(_) => EntryKind::HistoryEntry,
            EntryData::Register(_) => EntryKind::Register,
            EntryData::GlobalVariable(_) => EntryKind::Variable,
            EntryData::GlobalMark(_) => EntryKind::GlobalMark,
            EntryData::Jump(_) => EntryKind::Jump,
            EntryData::BufferList(_) => EntryKind::BufferList,
            EntryData::LocalMark(_) => EntryKind::LocalMark,
            EntryData::Change(_) => EntryKind::Change,
            EntryData::Unknown(_) => return None,
        };
        Some(kind)
    }

    /// Type code written to disk.
    pub fn type_code(&self) -> u64 {
        match &self.data {
            EntryData::Unknown(item) => item.type_code,
            _ => self.kind().map(EntryKind::code).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes() {
        for code in 0..=EntryKind::LAST {
            let kind = EntryKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert!(EntryKind::from_code(12).is_none());
    }

    #[test]
    fn test_mark_tables() {
        assert_eq!(global_mark_index('A'), Some(0));
        assert_eq!(global_mark_index('0'), Some(NMARKS));
        assert_eq!(global_mark_index('a'), None);
        for i in 0..NMARKS + EXTRA_MARKS {
            assert_eq!(global_mark_index(global_mark_name(i)), Some(i));
        }
        for i in 0..NLOCALMARKS {
            assert_eq!(local_mark_index(local_mark_name(i)), Some(i));
        }
        assert_eq!(local_mark_index('['), None);
    }

    #[test]
    fn test_register_table() {
        for i in 0..NUM_SAVED_REGISTERS {
            assert_eq!(register_index(register_name(i)), Some(i));
        }
        assert_eq!(register_index('A'), register_index('a'));
        assert_eq!(register_index('*'), None);
    }

    #[test]
    fn test_unknown_entry_keeps_code() {
        let entry = Entry::new(
            Timestamp(1),
            EntryData::Unknown(UnknownItem {
                type_code: 42,
                contents: vec![0xc0],
            }),
        );
        assert_eq!(entry.kind(), None);
        assert_eq!(entry.type_code(), 42);
    }
}
