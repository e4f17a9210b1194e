//! Write pipeline.
//!
//! Live state is first snapshotted into merge holders, one per mark slot,
//! register, pattern and history kind, plus a group of local marks and
//! changes per file. If an existing file is being merged, its records are
//! then folded into the same holders, newest wins. Finally the holders are
//! serialized in a fixed order.

use crate::codec;
use crate::config::{ShadaConfig, ShadaOptions};
use crate::error::{Result, ShadaError};
use crate::flags::EntryMask;
use crate::merge::{upsert_bounded, HistoryMerger, Origin};
use crate::reader::{ReadItem, ShadaReader};
use crate::state::{BufferId, BufferInfo, EditorState, FileRef, HistoryValue};
use crate::types::{
    global_mark_index, global_mark_name, local_mark_index, register_index,
    register_name, BufferList, BufferListItem, Entry, EntryData, FileMark, GlobalVariable,
    Header, HistoryItem, HistoryType, Position, Register, SearchPattern, SubString, Timestamp,
    EXTRA_MARKS, JUMPLISTSIZE, NLOCALMARKS, NMARKS, NUM_SAVED_REGISTERS,
};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

/// How the write went.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WriteStatus {
    #[default]
    Successful,
    /// The file being merged did not look like a ShaDa file. Everything
    /// from the session was still written, but nothing from that file past
    /// the point where it went wrong.
    ReadNotShaDa,
}

/// Summary of a write.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct WriteReport {
    pub status: WriteStatus,
    /// Values that could not be encoded and were left out.
    pub ignorable_errors: Vec<String>,
    pub written_from_session: usize,
    pub written_from_file: usize,
    /// Temp file left in place instead of being renamed over the target.
    pub leftover_temp: Option<PathBuf>,
}

/// A merge holder: an entry and where it came from.
#[derive(Clone, Debug)]
struct Held {
    entry: Entry,
    origin: Origin,
}

impl Held {
    fn session(timestamp: Timestamp, data: EntryData) -> Self {
        Self {
            entry: Entry::new(timestamp, data),
            origin: Origin::Session,
        }
    }

    fn file(entry: Entry) -> Self {
        Self {
            entry,
            origin: Origin::File,
        }
    }

    fn timestamp(&self) -> Timestamp {
        self.entry.timestamp
    }
}

/// Keep the newer of a holder and a file entry. The holder wins ties.
fn merge_slot(slot: &mut Option<Held>, entry: Entry) {
    if slot
        .as_ref()
        .is_some_and(|held| held.timestamp() >= entry.timestamp)
    {
        return;
    }
    *slot = Some(Held::file(entry));
}

fn mark_of(entry: &Entry) -> Option<&FileMark> {
    match &entry.data {
        EntryData::GlobalMark(m)
        | EntryData::Jump(m)
        | EntryData::LocalMark(m)
        | EntryData::Change(m) => Some(m),
        _ => None,
    }
}

fn same_place(a: &Held, b: &Held) -> bool {
    match (mark_of(&a.entry), mark_of(&b.entry)) {
        (Some(a), Some(b)) => a.position == b.position && a.file == b.file,
        _ => false,
    }
}

/// Local marks and changes of one file.
#[derive(Debug)]
struct FileMarks {
    marks: Vec<Option<Held>>,
    changes: Vec<Held>,
    /// Local marks with names this version does not save.
    additional_marks: Vec<Held>,
    greatest_timestamp: Timestamp,
}

impl Default for FileMarks {
    fn default() -> Self {
        Self {
            marks: vec![None; NLOCALMARKS],
            changes: Vec::new(),
            additional_marks: Vec::new(),
            greatest_timestamp: Timestamp::default(),
        }
    }
}

impl FileMarks {
    fn touch(&mut self, timestamp: Timestamp) {
        self.greatest_timestamp = self.greatest_timestamp.max(timestamp);
    }
}

/// Write a ShaDa file from `state`, merging in `merge_from` if given.
///
/// Fatal errors (I/O, encoding failures other than unencodable values) are
/// returned as `Err`; the output is then incomplete and must be discarded.
pub fn write_merged<W, R, S>(
    out: &mut W,
    merge_from: Option<&mut ShadaReader<R>>,
    state: &S,
    config: &ShadaConfig,
) -> Result<WriteReport>
where
    W: Write,
    R: Read,
    S: EditorState + ?Sized,
{
    let mut merger = WriteMerger::new(state, config);
    if merger.max_kbyte == 0 {
        return Ok(merger.report);
    }
    merger.write_header(out)?;
    if let Some(cap) = config.options.buffer_list() {
        merger.write_buffer_list(out, cap)?;
    }
    if config.options.save_global_variables() {
        merger.write_variables(out)?;
    }
    merger.collect_session();
    if let Some(reader) = merge_from {
        merger.merge_file(out, reader)?;
    }
    merger.push_cursor_mark();
    merger.write_holders(out)?;
    debug!(
        from_session = merger.report.written_from_session,
        from_file = merger.report.written_from_file,
        "wrote ShaDa data"
    );
    Ok(merger.report)
}

// --- Context encoding ---
//
// These write one kind of live state as plain records, with no header and no
// size limit, for callers that keep editor context in memory.

/// Encode all non-empty registers.
pub fn encode_registers<S: EditorState + ?Sized>(state: &S, config: &ShadaConfig) -> Result<Vec<u8>> {
    let mut merger = WriteMerger::unbounded(state, config);
    merger.register_line_limit = None;
    merger.collect_registers();
    let mut out = Vec::new();
    for held in std::mem::take(&mut merger.registers).into_iter().flatten() {
        merger.emit(&mut out, &held)?;
    }
    Ok(out)
}

/// Encode the jump list.
pub fn encode_jumps<S: EditorState + ?Sized>(state: &S, config: &ShadaConfig) -> Result<Vec<u8>> {
    let mut merger = WriteMerger::unbounded(state, config);
    merger.collect_jumps();
    let mut out = Vec::new();
    for held in std::mem::take(&mut merger.jumps) {
        merger.emit(&mut out, &held)?;
    }
    Ok(out)
}

/// Encode the buffer list as a single record.
pub fn encode_buffer_list<S: EditorState + ?Sized>(
    state: &S,
    config: &ShadaConfig,
) -> Result<Vec<u8>> {
    let mut merger = WriteMerger::unbounded(state, config);
    let mut out = Vec::new();
    merger.write_buffer_list(&mut out, config.options.buffer_list().flatten())?;
    Ok(out)
}

/// Encode global variables. Values that cannot be encoded are left out.
pub fn encode_global_variables<S: EditorState + ?Sized>(
    state: &S,
    config: &ShadaConfig,
) -> Result<Vec<u8>> {
    let mut merger = WriteMerger::unbounded(state, config);
    let mut out = Vec::new();
    merger.write_variables(&mut out)?;
    Ok(out)
}

struct WriteMerger<'a, S: ?Sized> {
    state: &'a S,
    options: &'a ShadaOptions,
    now: Timestamp,
    max_kbyte: u64,
    marked_files: usize,
    register_line_limit: Option<usize>,
    dump_registers: bool,
    dump_global_marks: bool,
    buffers: HashMap<BufferId, BufferInfo>,
    global_marks: Vec<Option<Held>>,
    live_global_timestamps: Vec<Option<Timestamp>>,
    /// Newest first; names are assigned by position when written.
    numbered_marks: Vec<Held>,
    registers: Vec<Option<Held>>,
    jumps: Vec<Held>,
    search_pattern: Option<Held>,
    sub_search_pattern: Option<Held>,
    replacement: Option<Held>,
    history: Vec<Option<HistoryMerger<HistoryValue>>>,
    dumped_variables: HashSet<String>,
    file_marks: HashMap<String, FileMarks>,
    report: WriteReport,
}

impl<'a, S: EditorState + ?Sized> WriteMerger<'a, S> {
    fn new(state: &'a S, config: &'a ShadaConfig) -> Self {
        let options = &config.options;
        let register_line_limit = options.register_line_limit();
        let history = HistoryType::ALL
            .iter()
            .map(|&kind| {
                let limit = options.history_limit(kind, config.history_len);
                (limit > 0).then(|| HistoryMerger::new(limit, state.history(kind)))
            })
            .collect();
        let buffers = state
            .buffers()
            .into_iter()
            .map(|info| (info.id, info))
            .collect();
        Self {
            state,
            options,
            now: Timestamp::now(),
            max_kbyte: options.max_kbyte(),
            marked_files: options.marked_files(),
            register_line_limit,
            dump_registers: options.dump_registers(),
            dump_global_marks: options.save_global_marks(),
            buffers,
            global_marks: vec![None; NMARKS],
            live_global_timestamps: vec![None; NMARKS],
            numbered_marks: Vec::new(),
            registers: vec![None; NUM_SAVED_REGISTERS],
            jumps: Vec::new(),
            search_pattern: None,
            sub_search_pattern: None,
            replacement: None,
            history,
            dumped_variables: HashSet::new(),
            file_marks: HashMap::new(),
            report: WriteReport::default(),
        }
    }

    fn unbounded(state: &'a S, config: &'a ShadaConfig) -> Self {
        Self {
            max_kbyte: 0,
            ..Self::new(state, config)
        }
    }

    // --- Output ---

    /// Write one held entry. Returns `false` if it could not be encoded.
    fn emit<W: Write>(&mut self, out: &mut W, held: &Held) -> Result<bool> {
        match codec::write_entry(out, &held.entry, self.max_kbyte) {
            Ok(written) => {
                if written {
                    match held.origin {
                        Origin::Session => self.report.written_from_session += 1,
                        Origin::File => self.report.written_from_file += 1,
                    }
                }
                Ok(true)
            }
            Err(ShadaError::Unencodable(reason)) => {
                warn!("Failed to write ShaDa entry: {}", reason);
                self.report.ignorable_errors.push(reason);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn write_header<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let header = Held::session(self.now, EntryData::Header(Header::current(self.max_kbyte)));
        self.emit(out, &header)?;
        Ok(())
    }

    // --- Buffers ---

    /// Buffers whose marks and names are never written.
    fn is_ignored(&self, info: &BufferInfo) -> bool {
        match &info.name {
            None => true,
            Some(name) => !info.listed || info.special || self.options.is_removable(name),
        }
    }

    /// File name to record for a mark, or `None` if it must not be saved.
    fn file_name(&self, file: &FileRef) -> Option<String> {
        match file {
            FileRef::Buffer(id) => {
                let info = self.buffers.get(id)?;
                if self.is_ignored(info) {
                    return None;
                }
                info.name.clone()
            }
            FileRef::Path(path) => (!self.options.is_removable(path)).then(|| path.clone()),
        }
    }

    fn write_buffer_list<W: Write>(&mut self, out: &mut W, cap: Option<usize>) -> Result<()> {
        let mut infos: Vec<&BufferInfo> = self
            .buffers
            .values()
            .filter(|info| !self.is_ignored(info))
            .collect();
        infos.sort_by_key(|info| info.id);
        let buffers = infos
            .into_iter()
            .take(cap.unwrap_or(usize::MAX))
            .filter_map(|info| {
                Some(BufferListItem {
                    file: info.name.clone()?,
                    position: Position::new(info.last_cursor.line.max(1), info.last_cursor.col.max(0)),
                    additional_data: info.additional_data.clone(),
                })
            })
            .collect();
        let held = Held::session(self.now, EntryData::BufferList(BufferList { buffers }));
        self.emit(out, &held)?;
        Ok(())
    }

    // --- Variables ---

    fn write_variables<W: Write>(&mut self, out: &mut W) -> Result<()> {
        for (name, value) in self.state.global_variables() {
            let held = Held::session(
                self.now,
                EntryData::GlobalVariable(GlobalVariable {
                    name: name.clone(),
                    value,
                    additional_elements: Vec::new(),
                }),
            );
            if self.emit(out, &held)? {
                self.dumped_variables.insert(name);
            }
        }
        Ok(())
    }

    // --- Session snapshot ---

    fn collect_session(&mut self) {
        self.collect_jumps();
        self.collect_patterns();
        if self.dump_global_marks {
            self.collect_global_marks();
        }
        if self.dump_registers {
            self.collect_registers();
        }
        if self.marked_files > 0 {
            self.collect_file_marks();
        }
    }

    fn collect_jumps(&mut self) {
        let mut jumps: Vec<Held> = self
            .state
            .jumps()
            .into_iter()
            .filter_map(|jump| {
                let file = self.file_name(&jump.file)?;
                Some(Held::session(
                    jump.mark.timestamp,
                    EntryData::Jump(FileMark {
                        name: '\0',
                        file,
                        position: jump.mark.position,
                        additional_data: jump.mark.additional_data,
                    }),
                ))
            })
            .collect();
        jumps.sort_by_key(Held::timestamp);
        let excess = jumps.len().saturating_sub(JUMPLISTSIZE);
        jumps.drain(..excess);
        self.jumps = jumps;
    }

    fn collect_patterns(&mut self) {
        let search_last_used = self.state.search_was_last_used();
        let highlight = !(self.state.no_hlsearch() || self.options.no_hlsearch());
        for substitute in [false, true] {
            let Some(pat) = self.state.search_pattern(substitute) else {
                continue;
            };
            let defaults = SearchPattern::default();
            let is_last_used = substitute ^ search_last_used;
            let held = Held::session(
                pat.timestamp,
                EntryData::SearchPattern(SearchPattern {
                    pattern: pat.pattern,
                    magic: pat.magic,
                    is_last_used,
                    smartcase: pat.smartcase,
                    has_line_offset: if substitute {
                        defaults.has_line_offset
                    } else {
                        pat.line_offset
                    },
                    place_cursor_at_end: if substitute {
                        defaults.place_cursor_at_end
                    } else {
                        pat.end
                    },
                    is_substitute_pattern: substitute,
                    highlighted: is_last_used && highlight,
                    search_backward: !substitute && pat.backward,
                    offset: if substitute { defaults.offset } else { pat.offset },
                    additional_data: pat.additional_data,
                }),
            );
            if substitute {
                self.sub_search_pattern = Some(held);
            } else {
                self.search_pattern = Some(held);
            }
        }
        if let Some(sub) = self.state.replacement() {
            self.replacement = Some(Held::session(
                sub.timestamp,
                EntryData::SubString(SubString {
                    replacement: sub.text,
                    additional_elements: sub.additional_elements,
                }),
            ));
        }
    }

    fn collect_global_marks(&mut self) {
        for idx in 0..NMARKS + EXTRA_MARKS {
            let name = global_mark_name(idx);
            let Some(mark) = self.state.global_mark(name) else {
                continue;
            };
            if idx < NMARKS {
                self.live_global_timestamps[idx] = Some(mark.mark.timestamp);
            }
            let Some(file) = self.file_name(&mark.file) else {
                continue;
            };
            let held = Held::session(
                mark.mark.timestamp,
                EntryData::GlobalMark(FileMark {
                    name,
                    file,
                    position: mark.mark.position,
                    additional_data: mark.mark.additional_data,
                }),
            );
            if idx < NMARKS {
                self.global_marks[idx] = Some(held);
            } else {
                self.numbered_marks.push(held);
            }
        }
    }

    fn collect_registers(&mut self) {
        let unnamed = self.state.unnamed_register();
        for idx in 0..NUM_SAVED_REGISTERS {
            let name = register_name(idx);
            let Some(reg) = self.state.register(name) else {
                continue;
            };
            if reg.contents.is_empty()
                || self
                    .register_line_limit
                    .is_some_and(|limit| reg.contents.len() > limit)
            {
                continue;
            }
            self.registers[idx] = Some(Held::session(
                reg.timestamp,
                EntryData::Register(Register {
                    name,
                    contents: reg.contents,
                    motion: reg.motion,
                    width: reg.width,
                    is_unnamed: unnamed == Some(name),
                    additional_data: reg.additional_data,
                }),
            ));
        }
    }

    fn collect_file_marks(&mut self) {
        let mut infos: Vec<BufferInfo> = self
            .buffers
            .values()
            .filter(|info| !self.is_ignored(info))
            .cloned()
            .collect();
        infos.sort_by_key(|info| info.id);
        for info in infos {
            let Some(file) = info.name.clone() else {
                continue;
            };
            let mut group = FileMarks::default();
            for (name, mark) in self.state.local_marks(info.id) {
                let Some(idx) = local_mark_index(name) else {
                    continue;
                };
                if mark.position.line <= 0 {
                    continue;
                }
                group.touch(mark.timestamp);
                group.marks[idx] = Some(Held::session(
                    mark.timestamp,
                    EntryData::LocalMark(FileMark {
                        name,
                        file: file.clone(),
                        position: mark.position,
                        additional_data: mark.additional_data,
                    }),
                ));
            }
            let mut changes: Vec<Held> = self
                .state
                .changes(info.id)
                .into_iter()
                .filter(|change| change.position.line > 0)
                .map(|change| {
                    Held::session(
                        change.timestamp,
                        EntryData::Change(FileMark {
                            name: '\0',
                            file: file.clone(),
                            position: change.position,
                            additional_data: change.additional_data,
                        }),
                    )
                })
                .collect();
            changes.sort_by_key(Held::timestamp);
            let excess = changes.len().saturating_sub(JUMPLISTSIZE);
            changes.drain(..excess);
            for change in &changes {
                group.touch(change.timestamp());
            }
            group.changes = changes;
            if group.marks.iter().any(Option::is_some) || !group.changes.is_empty() {
                self.file_marks.insert(file, group);
            }
        }
    }

    // --- Merging an existing file ---

    fn merge_mask(&self) -> EntryMask {
        let mut mask = EntryMask::UNDISABLEABLE | EntryMask::UNKNOWN;
        if self.history.iter().any(Option::is_some) {
            mask |= EntryMask::HISTORY;
        }
        if self.dump_registers {
            mask |= EntryMask::REGISTER;
        }
        if self.options.save_global_variables() {
            mask |= EntryMask::VARIABLE;
        }
        if self.dump_global_marks {
            mask |= EntryMask::GLOBAL_MARK;
        }
        if self.marked_files > 0 {
            mask |= EntryMask::LOCAL_MARK | EntryMask::CHANGE;
        }
        mask
    }

    fn merge_file<W: Write, R: Read>(
        &mut self,
        out: &mut W,
        reader: &mut ShadaReader<R>,
    ) -> Result<()> {
        let mask = self.merge_mask();
        loop {
            let entry = match reader.next_item(mask, self.max_kbyte) {
                Ok(ReadItem::Finished) => break,
                Ok(ReadItem::Malformed { offset, reason }) => {
                    debug!(offset, %reason, "skipping malformed entry while merging");
                    continue;
                }
                Ok(ReadItem::Entry(entry)) => entry,
                Err(ShadaError::NotShaDa { offset, reason }) => {
                    warn!(
                        "Merged ShaDa file does not look like a ShaDa file: {} at position {}",
                        reason, offset
                    );
                    self.report.status = WriteStatus::ReadNotShaDa;
                    break;
                }
                Err(e) => return Err(e),
            };
            self.merge_entry(out, entry)?;
        }
        Ok(())
    }

    fn merge_entry<W: Write>(&mut self, out: &mut W, entry: Entry) -> Result<()> {
        match &entry.data {
            EntryData::Header(_) | EntryData::BufferList(_) => {}
            EntryData::Unknown(_) => {
                self.emit(out, &Held::file(entry))?;
            }
            EntryData::SearchPattern(sp) => {
                if sp.is_substitute_pattern {
                    merge_slot(&mut self.sub_search_pattern, entry);
                } else {
                    merge_slot(&mut self.search_pattern, entry);
                }
            }
            EntryData::SubString(_) => merge_slot(&mut self.replacement, entry),
            EntryData::HistoryItem(item) => {
                let Some(kind) = item.kind() else {
                    self.emit(out, &Held::file(entry))?;
                    return Ok(());
                };
                if let Some(merger) = self.history[kind as usize].as_mut() {
                    let timestamp = entry.timestamp;
                    if let EntryData::HistoryItem(item) = entry.data {
                        merger.insert_from_file(HistoryValue {
                            line: item.line,
                            separator: item.separator,
                            timestamp,
                            additional_elements: item.additional_elements,
                        });
                    }
                }
            }
            EntryData::Register(reg) => match register_index(reg.name) {
                Some(idx) => merge_slot(&mut self.registers[idx], entry),
                None => {
                    self.emit(out, &Held::file(entry))?;
                }
            },
            EntryData::GlobalVariable(var) => {
                if !self.dumped_variables.contains(&var.name) {
                    self.emit(out, &Held::file(entry))?;
                }
            }
            EntryData::GlobalMark(mark) => match global_mark_index(mark.name) {
                None => {
                    self.emit(out, &Held::file(entry))?;
                }
                Some(idx) if idx >= NMARKS => self.merge_numbered_mark(entry),
                Some(idx) => {
                    if self.global_marks[idx].is_none()
                        && self.live_global_timestamps[idx]
                            .is_some_and(|live| live >= entry.timestamp)
                    {
                        return Ok(());
                    }
                    merge_slot(&mut self.global_marks[idx], entry);
                }
            },
            EntryData::Jump(_) => {
                upsert_bounded(
                    &mut self.jumps,
                    JUMPLISTSIZE,
                    Held::file(entry),
                    Held::timestamp,
                    same_place,
                );
            }
            EntryData::LocalMark(mark) | EntryData::Change(mark) => {
                if self.options.is_removable(&mark.file) {
                    return Ok(());
                }
                self.merge_file_mark(entry);
            }
        }
        Ok(())
    }

    fn merge_numbered_mark(&mut self, entry: Entry) {
        let held = Held::file(entry);
        let duplicate = self
            .numbered_marks
            .iter()
            .any(|m| m.timestamp() == held.timestamp() && same_place(m, &held));
        if duplicate {
            return;
        }
        let idx = self
            .numbered_marks
            .iter()
            .position(|m| m.timestamp() < held.timestamp())
            .unwrap_or(self.numbered_marks.len());
        if idx < EXTRA_MARKS {
            self.numbered_marks.insert(idx, held);
            self.numbered_marks.truncate(EXTRA_MARKS);
        }
    }

    fn merge_file_mark(&mut self, entry: Entry) {
        let Some(mark) = mark_of(&entry) else {
            return;
        };
        let file = mark.file.clone();
        let name = mark.name;
        let timestamp = entry.timestamp;
        let is_change = matches!(entry.data, EntryData::Change(_));

        // Marks of a file that is open but not saved still count as newer.
        let live_timestamp = if is_change || self.file_marks.contains_key(&file) {
            None
        } else {
            self.state
                .find_buffer(&file)
                .and_then(|buf| {
                    self.state
                        .local_marks(buf)
                        .into_iter()
                        .find(|(n, _)| *n == name)
                })
                .map(|(_, m)| m.timestamp)
        };

        let group = self.file_marks.entry(file).or_default();
        if is_change {
            upsert_bounded(
                &mut group.changes,
                JUMPLISTSIZE,
                Held::file(entry),
                Held::timestamp,
                |a, b| mark_of(&a.entry).map(|m| m.position) == mark_of(&b.entry).map(|m| m.position),
            );
            group.touch(timestamp);
            return;
        }
        let Some(idx) = local_mark_index(name) else {
            group.additional_marks.push(Held::file(entry));
            group.touch(timestamp);
            return;
        };
        let slot = &mut group.marks[idx];
        if slot.is_none() && live_timestamp.is_some_and(|live| live >= timestamp) {
            return;
        }
        if slot.as_ref().is_some_and(|held| held.timestamp() >= timestamp) {
            return;
        }
        *slot = Some(Held::file(entry));
        group.touch(timestamp);
    }

    // --- Final output ---

    /// The cursor becomes mark `'0`; older numbered marks move down.
    fn push_cursor_mark(&mut self) {
        if !self.dump_global_marks {
            return;
        }
        let Some((buffer, position)) = self.state.cursor() else {
            return;
        };
        if position.line <= 0 {
            return;
        }
        let Some(file) = self.file_name(&FileRef::Buffer(buffer)) else {
            return;
        };
        let held = Held::session(
            self.now,
            EntryData::GlobalMark(FileMark {
                name: '0',
                file,
                position,
                additional_data: Vec::new(),
            }),
        );
        self.numbered_marks.insert(0, held);
        self.numbered_marks.truncate(EXTRA_MARKS);
    }

    fn write_holders<W: Write>(&mut self, out: &mut W) -> Result<()> {
        for held in std::mem::take(&mut self.global_marks).into_iter().flatten() {
            self.emit(out, &held)?;
        }
        for (i, mut held) in std::mem::take(&mut self.numbered_marks)
            .into_iter()
            .enumerate()
        {
            if let EntryData::GlobalMark(mark) = &mut held.entry.data {
                mark.name = global_mark_name(NMARKS + i);
            }
            self.emit(out, &held)?;
        }
        for held in std::mem::take(&mut self.registers).into_iter().flatten() {
            self.emit(out, &held)?;
        }
        for held in std::mem::take(&mut self.jumps) {
            self.emit(out, &held)?;
        }
        let patterns = [
            self.search_pattern.take(),
            self.sub_search_pattern.take(),
            self.replacement.take(),
        ];
        for held in patterns.into_iter().flatten() {
            self.emit(out, &held)?;
        }

        let mut groups: Vec<(String, FileMarks)> = self.file_marks.drain().collect();
        groups.sort_by(|(a_name, a), (b_name, b)| {
            b.greatest_timestamp
                .cmp(&a.greatest_timestamp)
                .then_with(|| a_name.cmp(b_name))
        });
        for (_, group) in groups.into_iter().take(self.marked_files) {
            let FileMarks {
                marks,
                changes,
                additional_marks,
                ..
            } = group;
            for held in marks.into_iter().flatten() {
                self.emit(out, &held)?;
            }
            for held in changes.into_iter().chain(additional_marks) {
                self.emit(out, &held)?;
            }
        }

        let history = std::mem::take(&mut self.history);
        for (kind, merger) in HistoryType::ALL.into_iter().zip(history) {
            let Some(merger) = merger else {
                continue;
            };
            for (value, origin) in merger.finish() {
                let held = Held {
                    entry: Entry::new(
                        value.timestamp,
                        EntryData::HistoryItem(HistoryItem {
                            history_type: kind.code(),
                            line: value.line,
                            separator: value.separator,
                            additional_elements: value.additional_elements,
                        }),
                    ),
                    origin,
                };
                self.emit(out, &held)?;
            }
        }
        Ok(())
    }
}
