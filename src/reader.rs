//! Read pipeline.
//!
//! [`ShadaReader`] streams records off any [`Read`], decoding only the kinds
//! the caller asked for. [`read_into`] applies what it reads to live editor
//! state, letting the newer of the two sides win.

use crate::codec::{self, DecodeError};
use crate::config::ShadaConfig;
use crate::error::{Result, ShadaError};
use crate::flags::{EntryMask, ReadFlags};
use crate::merge::{upsert_bounded, HistoryMerger, RingItem};
use crate::state::{
    AnchoredMark, BufferId, EditorState, FileRef, HistoryValue, Mark, RegisterValue, Replacement,
    SearchPatternValue,
};
use crate::types::{
    global_mark_index, local_mark_index, register_index, Entry, EntryData, EntryKind, FileMark,
    HistoryType, MotionType, Timestamp, JUMPLISTSIZE,
};
use std::collections::{BTreeMap, HashSet};
use std::io::{self, Read};
use tracing::{debug, warn};

/// Result of reading one record.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadItem {
    Entry(Entry),
    /// A record of a wanted kind that could not be decoded. It has been
    /// consumed; reading can continue.
    Malformed { offset: u64, reason: String },
    /// Clean end of input.
    Finished,
}

/// Streaming record reader.
pub struct ShadaReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> ShadaReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the next record of a wanted kind, skipping everything else.
    ///
    /// Records longer than `max_kbyte` KiB are skipped too (0 disables the
    /// limit). Errors are fatal: the input is unreadable or not a ShaDa file.
    pub fn next_item(&mut self, wanted: EntryMask, max_kbyte: u64) -> Result<ReadItem> {
        loop {
            let start = self.offset;
            let Some(type_code) = self.read_header_uint(true)? else {
                return Ok(ReadItem::Finished);
            };
            let timestamp = self.read_required_uint()?;
            let length = self.read_required_uint()?;

            if length > isize::MAX as u64 {
                return Err(ShadaError::not_shada(
                    start,
                    format!("entry declares a length of {length} bytes, which is too long"),
                ));
            }
            if type_code == EntryKind::Missing.code() {
                return Err(ShadaError::not_shada(
                    start,
                    "there is an item with type 0, which is reserved",
                ));
            }

            let oversized = max_kbyte != 0 && length > max_kbyte.saturating_mul(1024);
            if !wanted.wants(type_code) || oversized {
                // A text file starts with a line, which reads as type 10 or
                // garbage; make sure the first record really is msgpack.
                if start == 0 && (type_code == u64::from(b'\n') || type_code > EntryKind::LAST) {
                    let payload = self.read_payload(start, length)?;
                    if let Err(DecodeError::NotShaDa(reason)) = codec::parse_payload(&payload) {
                        return Err(ShadaError::not_shada(start, reason));
                    }
                } else {
                    self.skip(start, length)?;
                }
                continue;
            }

            let payload = self.read_payload(start, length)?;
            return match codec::decode_payload(type_code, Timestamp(timestamp), &payload) {
                Ok(entry) => Ok(ReadItem::Entry(entry)),
                Err(DecodeError::Malformed(reason)) => Ok(ReadItem::Malformed {
                    offset: start,
                    reason,
                }),
                Err(DecodeError::NotShaDa(reason)) => Err(ShadaError::not_shada(start, reason)),
            };
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.offset += filled as u64;
        Ok(filled)
    }

    /// Read a msgpack unsigned integer. `None` only on EOF before the first
    /// byte, and only when `eof_ok`.
    fn read_header_uint(&mut self, eof_ok: bool) -> Result<Option<u64>> {
        let start = self.offset;
        let mut first = [0u8; 1];
        if self.fill(&mut first)? == 0 {
            if eof_ok {
                return Ok(None);
            }
            return Err(ShadaError::not_shada(
                start,
                "expected positive integer, but got nothing",
            ));
        }
        let width = match rmp::Marker::from_u8(first[0]) {
            rmp::Marker::FixPos(value) => return Ok(Some(u64::from(value))),
            rmp::Marker::U8 => 1,
            rmp::Marker::U16 => 2,
            rmp::Marker::U32 => 4,
            rmp::Marker::U64 => 8,
            _ => {
                return Err(ShadaError::not_shada(
                    start,
                    format!("expected positive integer, but got byte 0x{:02x}", first[0]),
                ))
            }
        };
        let mut buf = [0u8; 8];
        if self.fill(&mut buf[8 - width..])? != width {
            return Err(ShadaError::not_shada(
                start,
                "expected positive integer, but file ended in the middle of it",
            ));
        }
        Ok(Some(u64::from_be_bytes(buf)))
    }

    fn read_required_uint(&mut self) -> Result<u64> {
        Ok(self.read_header_uint(false)?.unwrap_or_default())
    }

    fn read_payload(&mut self, start: u64, length: u64) -> Result<Vec<u8>> {
        // Grows with the data actually present, so a bogus length can't
        // trigger a huge allocation.
        let mut payload = Vec::new();
        let read = (&mut self.inner).take(length).read_to_end(&mut payload)? as u64;
        self.offset += read;
        if read < length {
            return Err(truncated(start, length));
        }
        Ok(payload)
    }

    fn skip(&mut self, start: u64, length: u64) -> Result<()> {
        let skipped = io::copy(&mut (&mut self.inner).take(length), &mut io::sink())?;
        self.offset += skipped;
        if skipped < length {
            return Err(truncated(start, length));
        }
        Ok(())
    }
}

fn truncated(start: u64, length: u64) -> ShadaError {
    ShadaError::not_shada(
        start,
        format!("last entry specified that it occupies {length} bytes, but file ended earlier"),
    )
}

impl RingItem for HistoryValue {
    fn key(&self) -> &str {
        &self.line
    }

    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Kinds to decode for a read with `flags`.
fn read_mask<S: EditorState + ?Sized>(
    state: &S,
    flags: ReadFlags,
    config: &ShadaConfig,
    get_oldfiles: bool,
) -> EntryMask {
    let options = &config.options;
    let mut wanted = EntryMask::empty();
    if flags.contains(ReadFlags::WANT_INFO) {
        wanted |= EntryMask::UNDISABLEABLE | EntryMask::REGISTER | EntryMask::GLOBAL_MARK;
        if config.history_len > 0 {
            wanted |= EntryMask::HISTORY;
        }
        if options.save_global_variables() {
            wanted |= EntryMask::VARIABLE;
        }
        if options.buffer_list().is_some() && state.argument_count() == 0 {
            wanted |= EntryMask::BUFFER_LIST;
        }
    }
    if flags.contains(ReadFlags::WANT_MARKS) && options.marked_files() > 0 {
        wanted |= EntryMask::LOCAL_MARK | EntryMask::CHANGE;
    }
    if get_oldfiles {
        wanted |= EntryMask::LOCAL_MARK;
    }
    wanted
}

/// Read every record from `reader` and merge it into `state`.
///
/// Marks, registers and search patterns from the file replace live ones only
/// when strictly newer, unless [`ReadFlags::FORCE`] is set. History, jumps and
/// changes are merged with what the session holds. Malformed records are
/// logged and skipped; a fatal error stops the read and discards history,
/// jump and change merges that were still in progress.
pub fn read_into<R, S>(
    reader: &mut ShadaReader<R>,
    state: &mut S,
    flags: ReadFlags,
    config: &ShadaConfig,
) -> Result<()>
where
    R: Read,
    S: EditorState + ?Sized,
{
    let force = flags.contains(ReadFlags::FORCE);
    let get_oldfiles = flags.intersects(ReadFlags::GET_OLDFILES | ReadFlags::FORCE)
        && (force || state.oldfiles().map_or(true, |files| files.is_empty()));
    let wanted = read_mask(&*state, flags, config, get_oldfiles);
    if wanted.is_empty() {
        return Ok(());
    }

    let history = wanted.contains(EntryMask::HISTORY).then(|| {
        HistoryType::ALL
            .iter()
            .map(|&kind| HistoryMerger::new(config.history_len, state.history(kind)))
            .collect::<Vec<_>>()
    });
    let mut applier = Applier {
        state,
        force,
        want_marks: flags.contains(ReadFlags::WANT_MARKS),
        get_oldfiles,
        history,
        jumps: None,
        changes: BTreeMap::new(),
        oldfiles: Vec::new(),
        seen_oldfiles: HashSet::new(),
    };

    loop {
        match reader.next_item(wanted, 0)? {
            ReadItem::Finished => break,
            ReadItem::Malformed { offset, reason } => {
                warn!(
                    "E575: Error while reading ShaDa file: {} at position {}",
                    reason, offset
                );
            }
            ReadItem::Entry(entry) => applier.apply(entry),
        }
    }
    applier.finish();
    debug!(offset = reader.offset(), "finished reading ShaDa data");
    Ok(())
}

struct Applier<'a, S: ?Sized> {
    state: &'a mut S,
    force: bool,
    want_marks: bool,
    get_oldfiles: bool,
    history: Option<Vec<HistoryMerger<HistoryValue>>>,
    jumps: Option<Vec<AnchoredMark>>,
    changes: BTreeMap<BufferId, Vec<Mark>>,
    oldfiles: Vec<String>,
    seen_oldfiles: HashSet<String>,
}

impl<S: EditorState + ?Sized> Applier<'_, S> {
    /// Whether a live value stamped `live` keeps its place against a file
    /// value stamped `file`.
    fn live_wins(&self, live: Option<Timestamp>, file: Timestamp) -> bool {
        !self.force && live.is_some_and(|live| live >= file)
    }

    fn file_ref(&self, file: String) -> FileRef {
        match self.state.find_buffer(&file) {
            Some(id) => FileRef::Buffer(id),
            None => FileRef::Path(file),
        }
    }

    fn apply(&mut self, entry: Entry) {
        let timestamp = entry.timestamp;
        match entry.data {
            EntryData::Header(_) | EntryData::Unknown(_) => {}
            EntryData::SearchPattern(sp) => {
                let substitute = sp.is_substitute_pattern;
                let live = self.state.search_pattern(substitute).map(|p| p.timestamp);
                if self.live_wins(live, timestamp) {
                    return;
                }
                let is_last_used = sp.is_last_used;
                let highlighted = sp.highlighted;
                self.state.set_search_pattern(
                    substitute,
                    SearchPatternValue {
                        pattern: sp.pattern,
                        magic: sp.magic,
                        smartcase: sp.smartcase,
                        backward: sp.search_backward,
                        line_offset: sp.has_line_offset,
                        end: sp.place_cursor_at_end,
                        offset: sp.offset,
                        timestamp,
                        additional_data: sp.additional_data,
                    },
                );
                if is_last_used {
                    self.state.set_last_used_pattern(substitute);
                    self.state.set_no_hlsearch(!highlighted);
                }
            }
            EntryData::SubString(sub) => {
                let live = self.state.replacement().map(|r| r.timestamp);
                if self.live_wins(live, timestamp) {
                    return;
                }
                self.state.set_replacement(Replacement {
                    text: sub.replacement,
                    timestamp,
                    additional_elements: sub.additional_elements,
                });
            }
            EntryData::HistoryItem(item) => {
                let (Some(kind), Some(mergers)) = (item.kind(), self.history.as_mut()) else {
                    return;
                };
                mergers[kind as usize].insert_from_file(HistoryValue {
                    line: item.line,
                    separator: item.separator,
                    timestamp,
                    additional_elements: item.additional_elements,
                });
            }
            EntryData::Register(reg) => {
                if matches!(reg.motion, MotionType::Other(_)) || register_index(reg.name).is_none()
                {
                    return;
                }
                let live = self.state.register(reg.name).map(|r| r.timestamp);
                if self.live_wins(live, timestamp) {
                    return;
                }
                self.state.set_register(
                    reg.name,
                    RegisterValue {
                        contents: reg.contents,
                        motion: reg.motion,
                        width: reg.width,
                        timestamp,
                        additional_data: reg.additional_data,
                    },
                    reg.is_unnamed,
                );
            }
            EntryData::GlobalVariable(var) => {
                if self.force || !self.state.has_global_variable(&var.name) {
                    self.state.set_global_variable(&var.name, var.value);
                }
            }
            EntryData::GlobalMark(mark) => {
                if global_mark_index(mark.name).is_none() {
                    return;
                }
                let live = self.state.global_mark(mark.name).map(|m| m.mark.timestamp);
                if self.live_wins(live, timestamp) {
                    return;
                }
                let name = mark.name;
                let anchored = self.anchored(mark, timestamp);
                self.state.set_global_mark(name, anchored);
            }
            EntryData::Jump(mark) => {
                let anchored = self.anchored(mark, timestamp);
                let state = &*self.state;
                let jumps = self.jumps.get_or_insert_with(|| state.jumps());
                upsert_bounded(
                    jumps,
                    JUMPLISTSIZE,
                    anchored,
                    |j| j.mark.timestamp,
                    |a, b| a.mark.position == b.mark.position && a.file == b.file,
                );
            }
            EntryData::BufferList(list) => {
                for buf in list.buffers {
                    self.state
                        .add_buffer(&buf.file, buf.position, buf.additional_data);
                }
            }
            EntryData::LocalMark(mark) => self.apply_buffer_mark(mark, timestamp, false),
            EntryData::Change(mark) => self.apply_buffer_mark(mark, timestamp, true),
        }
    }

    fn anchored(&self, mark: FileMark, timestamp: Timestamp) -> AnchoredMark {
        AnchoredMark {
            mark: Mark {
                position: mark.position,
                timestamp,
                additional_data: mark.additional_data,
            },
            file: self.file_ref(mark.file),
        }
    }

    fn apply_buffer_mark(&mut self, mark: FileMark, timestamp: Timestamp, is_change: bool) {
        if self.get_oldfiles && self.seen_oldfiles.insert(mark.file.clone()) {
            self.oldfiles.push(mark.file.clone());
        }
        if !self.want_marks {
            return;
        }
        let Some(buffer) = self.state.find_buffer(&mark.file) else {
            return;
        };
        let value = Mark {
            position: mark.position,
            timestamp,
            additional_data: mark.additional_data,
        };
        if is_change {
            let state = &*self.state;
            let changes = self
                .changes
                .entry(buffer)
                .or_insert_with(|| state.changes(buffer));
            upsert_bounded(
                changes,
                JUMPLISTSIZE,
                value,
                |c| c.timestamp,
                |a, b| a.position == b.position,
            );
            return;
        }
        if local_mark_index(mark.name).is_none() {
            return;
        }
        let live = self
            .state
            .local_marks(buffer)
            .into_iter()
            .find(|(name, _)| *name == mark.name)
            .map(|(_, m)| m.timestamp);
        if self.live_wins(live, timestamp) {
            return;
        }
        self.state.set_local_mark(buffer, mark.name, value);
    }

    fn finish(self) {
        let Applier {
            state,
            get_oldfiles,
            history,
            jumps,
            changes,
            oldfiles,
            ..
        } = self;
        if let Some(mergers) = history {
            for (kind, merger) in HistoryType::ALL.into_iter().zip(mergers) {
                let merged = merger.finish().into_iter().map(|(item, _)| item).collect();
                state.set_history(kind, merged);
            }
        }
        if let Some(jumps) = jumps {
            state.set_jumps(jumps);
        }
        for (buffer, list) in changes {
            state.set_changes(buffer, list);
        }
        if get_oldfiles {
            state.set_oldfiles(oldfiles);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, write_record};
    use crate::state::Session;
    use crate::types::{Position, Register, SubString, UnknownItem};

    fn file_of(entries: &[Entry]) -> Vec<u8> {
        entries.iter().flat_map(|e| encode(e).unwrap()).collect()
    }

    fn sub(text: &str, ts: u64) -> Entry {
        Entry::new(
            Timestamp(ts),
            EntryData::SubString(SubString {
                replacement: text.to_string(),
                additional_elements: vec![],
            }),
        )
    }

    #[test]
    fn test_reads_until_finished() {
        let bytes = file_of(&[sub("a", 1), sub("b", 2)]);
        let mut reader = ShadaReader::new(&bytes[..]);
        assert!(matches!(
            reader.next_item(EntryMask::all(), 0).unwrap(),
            ReadItem::Entry(_)
        ));
        assert!(matches!(
            reader.next_item(EntryMask::all(), 0).unwrap(),
            ReadItem::Entry(_)
        ));
        assert_eq!(
            reader.next_item(EntryMask::all(), 0).unwrap(),
            ReadItem::Finished
        );
        assert_eq!(reader.offset(), bytes.len() as u64);
    }

    #[test]
    fn test_skips_unwanted_and_oversized() {
        let big = sub(&"x".repeat(3000), 1);
        let bytes = file_of(&[big, sub("small", 2)]);
        let mut reader = ShadaReader::new(&bytes[..]);
        match reader.next_item(EntryMask::SUB_STRING, 1).unwrap() {
            ReadItem::Entry(entry) => assert_eq!(entry, sub("small", 2)),
            other => panic!("unexpected {other:?}"),
        }

        let mut reader = ShadaReader::new(&bytes[..]);
        assert_eq!(
            reader.next_item(EntryMask::REGISTER, 0).unwrap(),
            ReadItem::Finished
        );
    }

    #[test]
    fn test_malformed_is_recoverable() {
        let mut bytes = Vec::new();
        // Register map without contents.
        let payload = rmp_serde::to_vec(&crate::value::Value::Map(vec![])).unwrap();
        write_record(&mut bytes, 5, Timestamp(1), &payload).unwrap();
        bytes.extend(file_of(&[sub("after", 2)]));

        let mut reader = ShadaReader::new(&bytes[..]);
        assert!(matches!(
            reader.next_item(EntryMask::all(), 0).unwrap(),
            ReadItem::Malformed { offset: 0, .. }
        ));
        assert_eq!(
            reader.next_item(EntryMask::all(), 0).unwrap(),
            ReadItem::Entry(sub("after", 2))
        );
    }

    #[test]
    fn test_fatal_conditions() {
        let not_shada = |bytes: &[u8]| {
            let mut reader = ShadaReader::new(bytes);
            matches!(
                reader.next_item(EntryMask::all(), 0),
                Err(ShadaError::NotShaDa { .. })
            )
        };
        // Type 0.
        assert!(not_shada(&[0x00, 0x01, 0x01, 0xc0]));
        // Negative integer where a header field belongs.
        assert!(not_shada(&[0xff]));
        // Header ends after the type.
        assert!(not_shada(&[0x03]));
        // Payload shorter than declared.
        assert!(not_shada(&[0x03, 0x01, 0x05, 0x91]));
        // Plain text.
        assert!(not_shada(b"hello world\n"));
    }

    #[test]
    fn test_text_file_rejected_even_when_unwanted() {
        // "\n" then timestamp 'a', length 2, payload is a cut off array.
        let bytes = [b'\n', b'a', 0x02, 0x92, 0x01];
        let mut reader = ShadaReader::new(&bytes[..]);
        assert!(reader.next_item(EntryMask::HEADER, 0).is_err());
    }

    #[test]
    fn test_unknown_passthrough() {
        let mut bytes = Vec::new();
        write_record(&mut bytes, 77, Timestamp(4), &[0x93, 1, 2, 3]).unwrap();
        let mut reader = ShadaReader::new(&bytes[..]);
        match reader.next_item(EntryMask::UNKNOWN, 0).unwrap() {
            ReadItem::Entry(Entry {
                data: EntryData::Unknown(UnknownItem { type_code, contents }),
                ..
            }) => {
                assert_eq!(type_code, 77);
                assert_eq!(contents, vec![0x93, 1, 2, 3]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_read_into_respects_recency() {
        let mut session = Session::new();
        session.set_register(
            'a',
            RegisterValue {
                contents: vec!["live".to_string()],
                motion: MotionType::CharWise,
                width: 0,
                timestamp: Timestamp(10),
                additional_data: vec![],
            },
            false,
        );
        let reg = |name: char, text: &str, ts: u64| {
            Entry::new(
                Timestamp(ts),
                EntryData::Register(Register {
                    name,
                    contents: vec![text.to_string()],
                    motion: MotionType::LineWise,
                    width: 0,
                    is_unnamed: false,
                    additional_data: vec![],
                }),
            )
        };
        let bytes = file_of(&[reg('a', "old", 5), reg('b', "new", 5)]);
        let config = ShadaConfig::default();
        read_into(
            &mut ShadaReader::new(&bytes[..]),
            &mut session,
            ReadFlags::WANT_INFO,
            &config,
        )
        .unwrap();
        assert_eq!(session.register('a').unwrap().contents, vec!["live"]);
        assert_eq!(session.register('b').unwrap().contents, vec!["new"]);

        read_into(
            &mut ShadaReader::new(&bytes[..]),
            &mut session,
            ReadFlags::WANT_INFO | ReadFlags::FORCE,
            &config,
        )
        .unwrap();
        assert_eq!(session.register('a').unwrap().contents, vec!["old"]);
    }

    #[test]
    fn test_read_into_collects_oldfiles_and_marks() {
        let mut session = Session::new();
        let buf = session.open_buffer("/open.txt");
        let local = |file: &str, ts: u64| {
            Entry::new(
                Timestamp(ts),
                EntryData::LocalMark(FileMark::new('a', file, Position::new(7, 2))),
            )
        };
        let bytes = file_of(&[
            local("/closed.txt", 3),
            local("/open.txt", 4),
            local("/closed.txt", 5),
        ]);
        read_into(
            &mut ShadaReader::new(&bytes[..]),
            &mut session,
            ReadFlags::WANT_MARKS | ReadFlags::GET_OLDFILES,
            &ShadaConfig::default(),
        )
        .unwrap();
        assert_eq!(
            session.oldfiles().unwrap(),
            vec!["/closed.txt".to_string(), "/open.txt".to_string()]
        );
        let marks = session.local_marks(buf);
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].1.position, Position::new(7, 2));
    }
}
