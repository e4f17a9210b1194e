//! Integration tests: whole sessions through the store.

use shada::codec;
use shada::types::{FileMark, UnknownItem};
use shada::{
    AnchoredMark, EditorState, Entry, EntryData, EntryMask, FileRef, HistoryType, HistoryValue,
    Mark, Position, ReadFlags, ReadItem, RegisterValue, Replacement, SearchPatternValue, Session,
    ShadaConfig, ShadaOptions, ShadaReader, ShadaStore, Timestamp, VarValue, WriteStatus,
};
use std::fs::{self, File};
use std::io::BufReader;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_store(options: &str) -> ShadaStore {
    init_tracing();
    ShadaStore::new(ShadaConfig {
        options: ShadaOptions::parse(options).unwrap(),
        fsync: false,
        ..Default::default()
    })
}

fn shada_path(dir: &TempDir) -> String {
    dir.path().join("main.shada").to_string_lossy().into_owned()
}

fn read_entries(path: &str) -> Vec<Entry> {
    let mut reader = ShadaReader::new(BufReader::new(File::open(path).unwrap()));
    let mut entries = Vec::new();
    loop {
        match reader.next_item(EntryMask::all(), 0).unwrap() {
            ReadItem::Entry(entry) => entries.push(entry),
            ReadItem::Finished => return entries,
            ReadItem::Malformed { offset, reason } => panic!("malformed at {offset}: {reason}"),
        }
    }
}

fn register(lines: &[&str], ts: u64) -> RegisterValue {
    RegisterValue {
        contents: lines.iter().map(|l| l.to_string()).collect(),
        motion: Default::default(),
        width: 0,
        timestamp: Timestamp(ts),
        additional_data: vec![],
    }
}

/// A session touching every kind of state.
fn busy_session() -> Session {
    let mut session = Session::new();
    let a = session.open_buffer("/p/a.rs");
    let b = session.open_buffer("/p/b.rs");
    session.set_local_mark(a, 'x', Mark::new(Position::new(4, 2), Timestamp(20)));
    session.set_local_mark(b, '"', Mark::new(Position::new(9, 0), Timestamp(21)));
    session.push_change(a, Mark::new(Position::new(5, 0), Timestamp(22)));
    session.push_change(a, Mark::new(Position::new(6, 1), Timestamp(23)));
    session.set_global_mark(
        'G',
        AnchoredMark::new(FileRef::Buffer(b), Position::new(1, 0), Timestamp(24)),
    );
    session.push_jump(AnchoredMark::new(
        FileRef::Buffer(a),
        Position::new(2, 0),
        Timestamp(25),
    ));
    session.push_jump(AnchoredMark::new(
        FileRef::Path("/p/closed.rs".to_string()),
        Position::new(7, 3),
        Timestamp(26),
    ));
    session.set_register('r', register(&["one", "two"], 27), true);
    session.push_history(HistoryType::Cmd, HistoryValue::new("make", Timestamp(28)));
    session.push_history(HistoryType::Cmd, HistoryValue::new("copen", Timestamp(29)));
    let mut pattern = SearchPatternValue::new("fn main", Timestamp(30));
    pattern.backward = true;
    pattern.line_offset = true;
    pattern.offset = 2;
    session.set_search_pattern(false, pattern);
    session.set_search_pattern(true, SearchPatternValue::new("foo", Timestamp(31)));
    session.set_replacement(Replacement {
        text: "bar".to_string(),
        timestamp: Timestamp(32),
        additional_elements: vec![],
    });
    session.set_global_variable("LIST", VarValue::List(vec![VarValue::Number(1)]));
    session.set_global_variable("NAME", VarValue::String("shada".to_string()));
    session
}

#[test]
fn test_session_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = test_store("!,'100,<50,s10,h");
    let file = shada_path(&dir);
    store.write_file(Some(&file), false, &busy_session()).unwrap();

    let mut restored = Session::new();
    let a = restored.open_buffer("/p/a.rs");
    let b = restored.open_buffer("/p/b.rs");
    store
        .read_everything(Some(&file), false, false, &mut restored)
        .unwrap();

    assert_eq!(
        restored.local_marks(a),
        vec![('x', Mark::new(Position::new(4, 2), Timestamp(20)))]
    );
    assert_eq!(restored.local_marks(b)[0].0, '"');
    let changes: Vec<_> = restored.changes(a).into_iter().map(|c| c.position).collect();
    assert_eq!(changes, vec![Position::new(5, 0), Position::new(6, 1)]);
    assert_eq!(restored.global_mark('G').unwrap().file, FileRef::Buffer(b));

    let jumps = restored.jumps();
    assert_eq!(jumps.len(), 2);
    assert_eq!(jumps[0].file, FileRef::Buffer(a));
    assert_eq!(jumps[1].file, FileRef::Path("/p/closed.rs".to_string()));

    assert_eq!(restored.register('r').unwrap().contents, vec!["one", "two"]);
    assert_eq!(restored.unnamed_register(), Some('r'));
    let history: Vec<_> = restored
        .history(HistoryType::Cmd)
        .into_iter()
        .map(|h| h.line)
        .collect();
    assert_eq!(history, vec!["make", "copen"]);

    let search = restored.search_pattern(false).unwrap();
    assert_eq!(search.pattern, "fn main");
    assert!(search.backward);
    assert!(search.line_offset);
    assert_eq!(search.offset, 2);
    assert!(restored.search_was_last_used());
    // The `h` flag means highlighting is not restored.
    assert!(restored.no_hlsearch());
    assert_eq!(restored.search_pattern(true).unwrap().pattern, "foo");
    assert_eq!(restored.replacement().unwrap().text, "bar");

    assert_eq!(
        restored.global_variable("LIST"),
        Some(&VarValue::List(vec![VarValue::Number(1)]))
    );
    let mut oldfiles = restored.oldfiles().unwrap();
    oldfiles.sort();
    assert_eq!(oldfiles, vec!["/p/a.rs", "/p/b.rs"]);
}

#[test]
fn test_rewrite_without_changes_is_stable() {
    let dir = TempDir::new().unwrap();
    let store = test_store("!,'100,<50,s10,h");
    let file = shada_path(&dir);
    let session = busy_session();

    // Header and variables are stamped at write time; everything else
    // carries the time it was last changed.
    let comparable = |entries: Vec<Entry>| -> Vec<Entry> {
        entries
            .into_iter()
            .filter(|e| !matches!(e.data, EntryData::Header(_)))
            .map(|mut e| {
                if matches!(e.data, EntryData::GlobalVariable(_)) {
                    e.timestamp = Timestamp(0);
                }
                e
            })
            .collect()
    };

    store.write_file(Some(&file), false, &session).unwrap();
    let first = comparable(read_entries(&file));
    let report = store.write_file(Some(&file), false, &session).unwrap();
    let second = comparable(read_entries(&file));

    assert_eq!(report.status, WriteStatus::Successful);
    assert_eq!(first, second);
}

#[test]
fn test_newer_mark_in_file_wins_on_write() {
    let dir = TempDir::new().unwrap();
    let store = test_store("!,'100,<50,s10,h");
    let file = shada_path(&dir);
    fs::write(
        &file,
        codec::encode(&Entry::new(
            Timestamp(5),
            EntryData::GlobalMark(FileMark::new('A', "/f", Position::new(10, 0))),
        ))
        .unwrap(),
    )
    .unwrap();

    let mut session = Session::new();
    session.set_global_mark(
        'A',
        AnchoredMark::new(
            FileRef::Path("/f".to_string()),
            Position::new(20, 0),
            Timestamp(3),
        ),
    );
    store.write_file(Some(&file), false, &session).unwrap();

    let lines: Vec<_> = read_entries(&file)
        .into_iter()
        .filter_map(|e| match e.data {
            EntryData::GlobalMark(m) if m.name == 'A' => Some(m.position.line),
            _ => None,
        })
        .collect();
    assert_eq!(lines, vec![10]);
}

#[test]
fn test_unknown_records_survive_rewrite() {
    let dir = TempDir::new().unwrap();
    let store = test_store("'100");
    let file = shada_path(&dir);
    let mut bytes = Vec::new();
    codec::write_record(&mut bytes, 64, Timestamp(3), &[0x92, 0x01, 0x02]).unwrap();
    fs::write(&file, &bytes).unwrap();

    store.write_file(Some(&file), false, &busy_session()).unwrap();

    let unknown: Vec<_> = read_entries(&file)
        .into_iter()
        .filter_map(|e| match e.data {
            EntryData::Unknown(item) => Some((e.timestamp, item)),
            _ => None,
        })
        .collect();
    assert_eq!(
        unknown,
        vec![(
            Timestamp(3),
            UnknownItem {
                type_code: 64,
                contents: vec![0x92, 0x01, 0x02],
            }
        )]
    );
}

#[test]
fn test_extension_data_survives_rewrite() {
    let dir = TempDir::new().unwrap();
    let store = test_store("'100");
    let file = shada_path(&dir);
    // Global mark 'Q' with "zz": fixext1(1, 0x00) and "yy": int8 5
    let payload = [
        0x84, 0xa1, b'f', 0xc4, 0x02, b'/', b'q', 0xa1, b'n', 0x51, 0xa2, b'z', b'z', 0xd4, 0x01,
        0x00, 0xa2, b'y', b'y', 0xd0, 0x05,
    ];
    let mut record = Vec::new();
    codec::write_record(&mut record, 7, Timestamp(11), &payload).unwrap();
    fs::write(&file, &record).unwrap();

    let report = store.write_file(Some(&file), false, &Session::new()).unwrap();
    assert_eq!(report.written_from_file, 1);

    let written = fs::read(&file).unwrap();
    assert!(written.windows(record.len()).any(|w| w == record.as_slice()));
}

#[test]
fn test_removable_files_are_not_saved() {
    let dir = TempDir::new().unwrap();
    let store = test_store("'100,r/mnt/");
    let file = shada_path(&dir);
    let mut session = Session::new();
    let usb = session.open_buffer("/mnt/usb/notes.txt");
    let home = session.open_buffer("/home/me/notes.txt");
    session.set_local_mark(usb, 'a', Mark::new(Position::new(1, 0), Timestamp(1)));
    session.set_local_mark(home, 'a', Mark::new(Position::new(1, 0), Timestamp(1)));
    store.write_file(Some(&file), false, &session).unwrap();

    let files: Vec<_> = read_entries(&file)
        .into_iter()
        .filter_map(|e| match e.data {
            EntryData::LocalMark(m) => Some(m.file),
            _ => None,
        })
        .collect();
    assert_eq!(files, vec!["/home/me/notes.txt"]);
}

#[test]
fn test_buffer_list_restored_only_without_arguments() {
    let dir = TempDir::new().unwrap();
    let store = test_store("'100,%");
    let file = shada_path(&dir);
    let mut session = Session::new();
    session.open_buffer("/p/one.rs");
    let special = session.open_buffer("term://shell");
    session.set_special(special, true);
    session.open_buffer("/p/two.rs");
    store.write_file(Some(&file), false, &session).unwrap();

    let mut fresh = Session::new();
    store
        .read_file(Some(&file), ReadFlags::WANT_INFO, &mut fresh)
        .unwrap();
    let names: Vec<_> = fresh.buffers().into_iter().filter_map(|b| b.name).collect();
    assert_eq!(names, vec!["/p/one.rs", "/p/two.rs"]);

    let mut with_args = Session::new();
    with_args.set_argument_count(1);
    store
        .read_file(Some(&file), ReadFlags::WANT_INFO, &mut with_args)
        .unwrap();
    assert!(with_args.buffers().is_empty());
}

#[test]
fn test_instances_merge_history() {
    let dir = TempDir::new().unwrap();
    let store = test_store("'100,:3");
    let file = shada_path(&dir);

    let mut first = Session::new();
    first.push_history(HistoryType::Cmd, HistoryValue::new("a", Timestamp(1)));
    first.push_history(HistoryType::Cmd, HistoryValue::new("c", Timestamp(3)));
    store.write_file(Some(&file), false, &first).unwrap();

    let mut second = Session::new();
    second.push_history(HistoryType::Cmd, HistoryValue::new("b", Timestamp(2)));
    second.push_history(HistoryType::Cmd, HistoryValue::new("d", Timestamp(4)));
    store.write_file(Some(&file), false, &second).unwrap();

    let lines: Vec<_> = read_entries(&file)
        .into_iter()
        .filter_map(|e| match e.data {
            EntryData::HistoryItem(item) => Some(item.line),
            _ => None,
        })
        .collect();
    assert_eq!(lines, vec!["b", "c", "d"]);
}

#[test]
fn test_malformed_record_is_skipped_on_read() {
    let dir = TempDir::new().unwrap();
    let store = test_store("!,'100,<50,s10,h");
    let file = shada_path(&dir);
    let mut bytes = Vec::new();
    // Register whose contents are not an array.
    codec::write_record(&mut bytes, 5, Timestamp(1), &[0x81, 0xa2, b'r', b'c', 0x07]).unwrap();
    bytes.extend(
        codec::encode(&Entry::new(
            Timestamp(2),
            EntryData::HistoryItem(shada::types::HistoryItem::new(HistoryType::Cmd, "ok")),
        ))
        .unwrap(),
    );
    fs::write(&file, bytes).unwrap();

    let mut session = Session::new();
    store
        .read_file(Some(&file), ReadFlags::WANT_INFO, &mut session)
        .unwrap();
    assert_eq!(session.history(HistoryType::Cmd)[0].line, "ok");
}
