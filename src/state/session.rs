//! In-memory editor state.
//!
//! Holds everything the store persists without any editing machinery behind
//! it. Useful on its own for tools that inspect or rewrite ShaDa files, and
//! as the reference [`EditorState`] implementation.

use super::{
    AnchoredMark, BufferId, BufferInfo, EditorState, FileRef, HistoryValue, Mark, RegisterValue,
    Replacement, SearchPatternValue,
};
use crate::types::{
    global_mark_index, local_mark_index, register_index, HistoryType, Position, VarValue,
    HIST_COUNT,
};
use crate::value::AdditionalData;
use std::collections::BTreeMap;

#[derive(Clone, Debug)]
struct Buffer {
    info: BufferInfo,
    marks: BTreeMap<char, Mark>,
    changes: Vec<Mark>,
}

/// Session state kept in plain collections.
#[derive(Clone, Debug, Default)]
pub struct Session {
    buffers: Vec<Buffer>,
    cursor: Option<(BufferId, Position)>,
    argument_count: usize,
    global_marks: BTreeMap<char, AnchoredMark>,
    jumps: Vec<AnchoredMark>,
    registers: BTreeMap<char, RegisterValue>,
    unnamed: Option<char>,
    history: [Vec<HistoryValue>; HIST_COUNT],
    patterns: [Option<SearchPatternValue>; 2],
    substitute_last_used: bool,
    no_hlsearch: bool,
    replacement: Option<Replacement>,
    variables: BTreeMap<String, VarValue>,
    oldfiles: Option<Vec<String>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or find) a buffer for `path` and return its id.
    pub fn open_buffer(&mut self, path: &str) -> BufferId {
        if let Some(id) = self.find_buffer(path) {
            return id;
        }
        let id = BufferId(self.buffers.len() as u32 + 1);
        self.buffers.push(Buffer {
            info: BufferInfo {
                id,
                name: Some(path.to_string()),
                listed: true,
                special: false,
                last_cursor: Position::default(),
                additional_data: Vec::new(),
            },
            marks: BTreeMap::new(),
            changes: Vec::new(),
        });
        id
    }

    /// Mark a buffer as special (terminal, quickfix, ...). Special buffers
    /// are left out of the saved buffer list.
    pub fn set_special(&mut self, buffer: BufferId, special: bool) {
        if let Some(buf) = self.buffer_mut(buffer) {
            buf.info.special = special;
        }
    }

    pub fn set_cursor(&mut self, buffer: BufferId, position: Position) {
        self.cursor = Some((buffer, position));
    }

    pub fn set_argument_count(&mut self, count: usize) {
        self.argument_count = count;
    }

    /// Append a history line as the newest of its kind.
    pub fn push_history(&mut self, kind: HistoryType, item: HistoryValue) {
        self.history[kind as usize].push(item);
    }

    pub fn push_jump(&mut self, jump: AnchoredMark) {
        self.jumps.push(jump);
    }

    pub fn push_change(&mut self, buffer: BufferId, change: Mark) {
        if let Some(buf) = self.buffer_mut(buffer) {
            buf.changes.push(change);
        }
    }

    pub fn global_variable(&self, name: &str) -> Option<&VarValue> {
        self.variables.get(name)
    }

    fn buffer(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.iter().find(|b| b.info.id == id)
    }

    fn buffer_mut(&mut self, id: BufferId) -> Option<&mut Buffer> {
        self.buffers.iter_mut().find(|b| b.info.id == id)
    }
}

impl EditorState for Session {
    fn buffers(&self) -> Vec<BufferInfo> {
        self.buffers.iter().map(|b| b.info.clone()).collect()
    }

    fn find_buffer(&self, file: &str) -> Option<BufferId> {
        self.buffers
            .iter()
            .find(|b| b.info.name.as_deref() == Some(file))
            .map(|b| b.info.id)
    }

    fn buffer_name(&self, buffer: BufferId) -> Option<String> {
        self.buffer(buffer).and_then(|b| b.info.name.clone())
    }

    fn add_buffer(&mut self, file: &str, last_cursor: Position, additional_data: AdditionalData) {
        let id = self.open_buffer(file);
        if let Some(buf) = self.buffer_mut(id) {
            buf.info.listed = true;
            buf.info.last_cursor = last_cursor;
            buf.info.additional_data = additional_data;
        }
    }

    fn argument_count(&self) -> usize {
        self.argument_count
    }

    fn cursor(&self) -> Option<(BufferId, Position)> {
        self.cursor
    }

    fn global_mark(&self, name: char) -> Option<AnchoredMark> {
        self.global_marks.get(&name).cloned()
    }

    fn set_global_mark(&mut self, name: char, mark: AnchoredMark) {
        if global_mark_index(name).is_none() {
            return;
        }
        // Marks on paths that are now open are kept against the buffer.
        let open = match &mark.file {
            FileRef::Path(path) => self.find_buffer(path),
            FileRef::Buffer(_) => None,
        };
        let mark = match open {
            Some(id) => AnchoredMark {
                file: FileRef::Buffer(id),
                ..mark
            },
            None => mark,
        };
        self.global_marks.insert(name, mark);
    }

    fn local_marks(&self, buffer: BufferId) -> Vec<(char, Mark)> {
        self.buffer(buffer)
            .map(|b| b.marks.iter().map(|(c, m)| (*c, m.clone())).collect())
            .unwrap_or_default()
    }

    fn set_local_mark(&mut self, buffer: BufferId, name: char, mark: Mark) {
        if local_mark_index(name).is_none() {
            return;
        }
        if let Some(buf) = self.buffer_mut(buffer) {
            buf.marks.insert(name, mark);
        }
    }

    fn jumps(&self) -> Vec<AnchoredMark> {
        self.jumps.clone()
    }

    fn set_jumps(&mut self, jumps: Vec<AnchoredMark>) {
        self.jumps = jumps;
    }

    fn changes(&self, buffer: BufferId) -> Vec<Mark> {
        self.buffer(buffer)
            .map(|b| b.changes.clone())
            .unwrap_or_default()
    }

    fn set_changes(&mut self, buffer: BufferId, changes: Vec<Mark>) {
        if let Some(buf) = self.buffer_mut(buffer) {
            buf.changes = changes;
        }
    }

    fn register(&self, name: char) -> Option<RegisterValue> {
        self.registers.get(&name.to_ascii_lowercase()).cloned()
    }

    fn unnamed_register(&self) -> Option<char> {
        self.unnamed
    }

    fn set_register(&mut self, name: char, value: RegisterValue, is_unnamed: bool) {
        if register_index(name).is_none() {
            return;
        }
        let name = name.to_ascii_lowercase();
        self.registers.insert(name, value);
        if is_unnamed {
            self.unnamed = Some(name);
        }
    }

    fn history(&self, kind: HistoryType) -> Vec<HistoryValue> {
        self.history[kind as usize].clone()
    }

    fn set_history(&mut self, kind: HistoryType, items: Vec<HistoryValue>) {
        self.history[kind as usize] = items;
    }

    fn search_pattern(&self, substitute: bool) -> Option<SearchPatternValue> {
        self.patterns[usize::from(substitute)].clone()
    }

    fn set_search_pattern(&mut self, substitute: bool, pattern: SearchPatternValue) {
        self.patterns[usize::from(substitute)] = Some(pattern);
    }

    fn search_was_last_used(&self) -> bool {
        !self.substitute_last_used
    }

    fn set_last_used_pattern(&mut self, substitute: bool) {
        self.substitute_last_used = substitute;
    }

    fn no_hlsearch(&self) -> bool {
        self.no_hlsearch
    }

    fn set_no_hlsearch(&mut self, value: bool) {
        self.no_hlsearch = value;
    }

    fn replacement(&self) -> Option<Replacement> {
        self.replacement.clone()
    }

    fn set_replacement(&mut self, replacement: Replacement) {
        self.replacement = Some(replacement);
    }

    fn global_variables(&self) -> Vec<(String, VarValue)> {
        self.variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn has_global_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    fn set_global_variable(&mut self, name: &str, value: VarValue) {
        self.variables.insert(name.to_string(), value);
    }

    fn oldfiles(&self) -> Option<Vec<String>> {
        self.oldfiles.clone()
    }

    fn set_oldfiles(&mut self, files: Vec<String>) {
        self.oldfiles = Some(files);
    }
}
