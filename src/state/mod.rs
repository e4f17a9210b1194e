//! The editor state the store reads from and writes into.
//!
//! The store never owns editor state. It talks to the editor through
//! [`EditorState`], a set of plain getters and setters; every recency
//! decision is made by the read and write pipelines, not by the
//! implementation.

mod session;

pub use session::Session;

use crate::types::{HistoryType, MotionType, Position, Timestamp, VarValue};
use crate::value::{AdditionalData, AdditionalElements};
use serde::Serialize;
use std::fmt;

/// Handle of an open buffer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BufferId(pub u32);

impl fmt::Debug for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buf({})", self.0)
    }
}

/// A mark inside some buffer.
#[derive(Clone, Debug, PartialEq, Default, Serialize)]
pub struct Mark {
    pub position: Position,
    pub timestamp: Timestamp,
    pub additional_data: AdditionalData,
}

impl Mark {
    pub fn new(position: Position, timestamp: Timestamp) -> Self {
        Self {
            position,
            timestamp,
            additional_data: Vec::new(),
        }
    }
}

/// File a global mark or jump points to: an open buffer, or a path that
/// is not loaded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum FileRef {
    Buffer(BufferId),
    Path(String),
}

/// A mark that carries the file it belongs to.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnchoredMark {
    pub mark: Mark,
    pub file: FileRef,
}

impl AnchoredMark {
    pub fn new(file: FileRef, position: Position, timestamp: Timestamp) -> Self {
        Self {
            mark: Mark::new(position, timestamp),
            file,
        }
    }
}

/// What the store needs to know about an open buffer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BufferInfo {
    pub id: BufferId,
    /// Full path; `None` for unnamed buffers.
    pub name: Option<String>,
    pub listed: bool,
    /// Terminal, quickfix, help and similar buffers.
    pub special: bool,
    pub last_cursor: Position,
    pub additional_data: AdditionalData,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RegisterValue {
    pub contents: Vec<String>,
    pub motion: MotionType,
    pub width: u64,
    pub timestamp: Timestamp,
    pub additional_data: AdditionalData,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryValue {
    pub line: String,
    /// Search direction for search history, 0 otherwise.
    pub separator: u8,
    pub timestamp: Timestamp,
    pub additional_elements: AdditionalElements,
}

impl HistoryValue {
    pub fn new(line: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            line: line.into(),
            separator: 0,
            timestamp,
            additional_elements: Vec::new(),
        }
    }
}

/// Last search or substitute pattern with its search offset.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchPatternValue {
    pub pattern: String,
    pub magic: bool,
    pub smartcase: bool,
    pub backward: bool,
    pub line_offset: bool,
    pub end: bool,
    pub offset: i64,
    pub timestamp: Timestamp,
    pub additional_data: AdditionalData,
}

impl SearchPatternValue {
    pub fn new(pattern: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            pattern: pattern.into(),
            magic: true,
            smartcase: false,
            backward: false,
            line_offset: false,
            end: false,
            offset: 0,
            timestamp,
            additional_data: Vec::new(),
        }
    }
}

/// Last `:substitute` replacement.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Replacement {
    pub text: String,
    pub timestamp: Timestamp,
    pub additional_elements: AdditionalElements,
}

/// Access to live editor state.
pub trait EditorState {
    // --- Buffers ---

    fn buffers(&self) -> Vec<BufferInfo>;

    /// Open buffer whose full path is `file`.
    fn find_buffer(&self, file: &str) -> Option<BufferId>;

    fn buffer_name(&self, buffer: BufferId) -> Option<String>;

    /// Add a listed buffer for `file` without loading it.
    fn add_buffer(&mut self, file: &str, last_cursor: Position, additional_data: AdditionalData);

    /// Number of files given on the command line.
    fn argument_count(&self) -> usize {
        0
    }

    /// Buffer and position of the cursor in the current window.
    fn cursor(&self) -> Option<(BufferId, Position)>;

    // --- Marks ---

    /// Global mark `A`-`Z` or `0`-`9`.
    fn global_mark(&self, name: char) -> Option<AnchoredMark>;

    fn set_global_mark(&mut self, name: char, mark: AnchoredMark);

    /// Local marks of a buffer that are worth saving.
    fn local_marks(&self, buffer: BufferId) -> Vec<(char, Mark)>;

    fn set_local_mark(&mut self, buffer: BufferId, name: char, mark: Mark);

    /// Jump list of the current window, oldest first.
    fn jumps(&self) -> Vec<AnchoredMark>;

    fn set_jumps(&mut self, jumps: Vec<AnchoredMark>);

    /// Change list of a buffer, oldest first.
    fn changes(&self, buffer: BufferId) -> Vec<Mark>;

    fn set_changes(&mut self, buffer: BufferId, changes: Vec<Mark>);

    // --- Registers ---

    /// Register contents; `None` for empty registers.
    fn register(&self, name: char) -> Option<RegisterValue>;

    /// Name of the register the unnamed register points to.
    fn unnamed_register(&self) -> Option<char>;

    fn set_register(&mut self, name: char, value: RegisterValue, is_unnamed: bool);

    // --- History ---

    /// History of one kind, oldest first.
    fn history(&self, kind: HistoryType) -> Vec<HistoryValue>;

    fn set_history(&mut self, kind: HistoryType, items: Vec<HistoryValue>);

    // --- Search ---

    fn search_pattern(&self, substitute: bool) -> Option<SearchPatternValue>;

    fn set_search_pattern(&mut self, substitute: bool, pattern: SearchPatternValue);

    /// Whether the search pattern (not the substitute one) was used last.
    fn search_was_last_used(&self) -> bool;

    fn set_last_used_pattern(&mut self, substitute: bool);

    fn no_hlsearch(&self) -> bool;

    fn set_no_hlsearch(&mut self, value: bool);

    fn replacement(&self) -> Option<Replacement>;

    fn set_replacement(&mut self, replacement: Replacement);

    // --- Variables ---

    /// Global variables that should persist.
    fn global_variables(&self) -> Vec<(String, VarValue)>;

    fn has_global_variable(&self, name: &str) -> bool;

    fn set_global_variable(&mut self, name: &str, value: VarValue);

    // --- Old files ---

    fn oldfiles(&self) -> Option<Vec<String>>;

    fn set_oldfiles(&mut self, files: Vec<String>);
}
