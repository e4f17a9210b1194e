//! Error handling and edge case tests.

use shada::codec;
use shada::types::{FileMark, HistoryItem};
use shada::{
    AnchoredMark, EditorState, Entry, EntryData, FileRef, HistoryType, Position, ReadFlags,
    Session, ShadaConfig, ShadaError, ShadaOptions, ShadaStore, Timestamp, VarValue,
};
use std::fs;
use tempfile::TempDir;

fn test_store() -> ShadaStore {
    ShadaStore::new(ShadaConfig {
        fsync: false,
        ..Default::default()
    })
}

fn shada_path(dir: &TempDir) -> String {
    dir.path().join("main.shada").to_string_lossy().into_owned()
}

// --- Option Errors ---

#[test]
fn test_option_errors() {
    let message = |raw: &str| ShadaOptions::parse(raw).unwrap_err().to_string();
    assert!(message("'10,x").starts_with("E539"));
    assert!(message("'10,:").starts_with("E526"));
    assert!(message("'10:5").starts_with("E527"));
    assert!(message("!,s10").starts_with("E528"));
    assert!(ShadaOptions::parse("").is_ok());
}

// --- Read Errors ---

#[test]
fn test_missing_file_with_error_flag() {
    let dir = TempDir::new().unwrap();
    let store = test_store();
    let mut session = Session::new();
    let result = store.read_file(
        Some(&shada_path(&dir)),
        ReadFlags::WANT_INFO | ReadFlags::MISSING_ERROR,
        &mut session,
    );
    let err = result.unwrap_err();
    assert!(matches!(err, ShadaError::Open { .. }));
    assert!(err.to_string().starts_with("E886"));
}

#[test]
fn test_text_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = test_store();
    let file = shada_path(&dir);
    fs::write(&file, "\nthis is a text file\n").unwrap();

    let mut session = Session::new();
    let result = store.read_file(Some(&file), ReadFlags::WANT_INFO, &mut session);
    assert!(matches!(result, Err(ShadaError::NotShaDa { offset: 0, .. })));
}

#[test]
fn test_reserved_type_is_fatal() {
    let dir = TempDir::new().unwrap();
    let store = test_store();
    let file = shada_path(&dir);
    let mut bytes = Vec::new();
    codec::write_record(&mut bytes, 0, Timestamp(1), &[]).unwrap();
    fs::write(&file, bytes).unwrap();

    let mut session = Session::new();
    let result = store.read_file(Some(&file), ReadFlags::WANT_INFO, &mut session);
    assert!(matches!(result, Err(ShadaError::NotShaDa { .. })));
}

#[test]
fn test_truncated_file_keeps_earlier_records() {
    let dir = TempDir::new().unwrap();
    let store = test_store();
    let file = shada_path(&dir);
    let mut bytes = codec::encode(&Entry::new(
        Timestamp(4),
        EntryData::GlobalMark(FileMark::new('T', "/t", Position::new(2, 0))),
    ))
    .unwrap();
    let second = codec::encode(&Entry::new(
        Timestamp(5),
        EntryData::HistoryItem(HistoryItem::new(HistoryType::Cmd, "lost")),
    ))
    .unwrap();
    let mark_len = bytes.len() as u64;
    bytes.extend_from_slice(&second[..second.len() - 2]);
    fs::write(&file, bytes).unwrap();

    let mut session = Session::new();
    let result = store.read_file(Some(&file), ReadFlags::WANT_INFO, &mut session);
    match result {
        Err(ShadaError::NotShaDa { offset, .. }) => assert_eq!(offset, mark_len),
        other => panic!("expected NotShaDa, got {other:?}"),
    }
    assert_eq!(session.global_mark('T').unwrap().file, FileRef::Path("/t".to_string()));
    assert!(session.history(HistoryType::Cmd).is_empty());
}

// --- Write Errors ---

#[test]
fn test_disabled_store() {
    let store = ShadaStore::new(ShadaConfig {
        shadafile: Some("NONE".to_string()),
        ..Default::default()
    });
    let mut session = Session::new();
    assert!(matches!(
        store.read_file(None, ReadFlags::WANT_INFO, &mut session),
        Err(ShadaError::Disabled)
    ));
    assert!(matches!(
        store.write_file(None, false, &session),
        Err(ShadaError::Disabled)
    ));
}

#[test]
fn test_function_reference_is_ignorable() {
    let dir = TempDir::new().unwrap();
    let store = test_store();
    let file = shada_path(&dir);
    let mut session = Session::new();
    for i in 0..4 {
        session.set_global_variable(&format!("V{i}"), VarValue::Number(i));
    }
    session.set_global_variable("CALLBACK", VarValue::Funcref("s:callback".to_string()));

    let report = store.write_file(Some(&file), false, &session).unwrap();
    assert_eq!(report.ignorable_errors.len(), 1);

    let mut restored = Session::new();
    store
        .read_file(Some(&file), ReadFlags::WANT_INFO, &mut restored)
        .unwrap();
    assert_eq!(restored.global_variables().len(), 4);
    assert!(!restored.has_global_variable("CALLBACK"));
}

#[test]
fn test_temp_files_exhausted_message() {
    let dir = TempDir::new().unwrap();
    let store = test_store();
    let file = shada_path(&dir);
    store.write_file(Some(&file), false, &Session::new()).unwrap();
    for suffix in 'a'..='z' {
        fs::write(format!("{file}.tmp.{suffix}"), b"").unwrap();
    }

    let err = store
        .write_file(Some(&file), false, &Session::new())
        .unwrap_err();
    assert!(err.to_string().starts_with("E138"));
}

#[test]
fn test_oversized_items_are_not_written() {
    let dir = TempDir::new().unwrap();
    let store = ShadaStore::new(ShadaConfig {
        options: ShadaOptions::parse("!,'10,s1").unwrap(),
        fsync: false,
        ..Default::default()
    });
    let file = shada_path(&dir);
    let mut session = Session::new();
    session.set_global_variable("BIG", VarValue::String("x".repeat(4096)));
    session.set_global_variable("SMALL", VarValue::Number(1));
    session.set_global_mark(
        'M',
        AnchoredMark::new(FileRef::Path("/m".to_string()), Position::new(1, 0), Timestamp(1)),
    );
    store.write_file(Some(&file), false, &session).unwrap();

    let mut restored = Session::new();
    store
        .read_file(Some(&file), ReadFlags::WANT_INFO, &mut restored)
        .unwrap();
    assert!(restored.has_global_variable("SMALL"));
    assert!(!restored.has_global_variable("BIG"));
    assert!(restored.global_mark('M').is_some());
}
