//! Main store tying path resolution, reading and writing together.

use crate::config::{default_shada_path, resolve, ShadaConfig};
use crate::error::{Result, ShadaError};
use crate::flags::ReadFlags;
use crate::reader::{self, ShadaReader};
use crate::state::EditorState;
use crate::writer::{self, WriteReport, WriteStatus};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Reads and writes ShaDa files for one editor.
///
/// The store holds no editor state of its own. Every operation takes an
/// [`EditorState`] and either merges a file into it or writes it out, merged
/// with whatever the file on disk already holds.
pub struct ShadaStore {
    /// Store configuration.
    config: ShadaConfig,

    /// Path of the last file read or written by explicit name.
    last_used: Mutex<Option<PathBuf>>,
}

impl ShadaStore {
    pub fn new(config: ShadaConfig) -> Self {
        Self {
            config,
            last_used: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ShadaConfig {
        &self.config
    }

    /// Path an operation on `file` would use.
    ///
    /// Order: `file`, the last explicitly used path, `shadafile`, the `n`
    /// item of the option, the default path.
    pub fn resolve_path(&self, file: Option<&str>) -> PathBuf {
        if let Some(file) = file.filter(|f| !f.is_empty()) {
            return resolve(file);
        }
        if let Some(last) = self.last_used.lock().clone() {
            return last;
        }
        if let Some(file) = self.config.shadafile.as_deref().filter(|f| !f.is_empty()) {
            return resolve(file);
        }
        match self.config.options.file_name() {
            Some(file) => resolve(file),
            None => default_shada_path(),
        }
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.config.is_disabled() {
            return Err(ShadaError::Disabled);
        }
        Ok(())
    }

    fn remember(&self, file: Option<&str>, path: &Path) {
        if file.is_some_and(|f| !f.is_empty()) {
            *self.last_used.lock() = Some(path.to_path_buf());
        }
    }

    // --- Reading ---

    /// Read a ShaDa file into `state`.
    ///
    /// Returns `false` when the file does not exist and
    /// [`ReadFlags::MISSING_ERROR`] is not set.
    pub fn read_file<S: EditorState + ?Sized>(
        &self,
        file: Option<&str>,
        flags: ReadFlags,
        state: &mut S,
    ) -> Result<bool> {
        self.ensure_enabled()?;
        let path = self.resolve_path(file);
        let source = match File::open(&path) {
            Ok(source) => source,
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    && !flags.contains(ReadFlags::MISSING_ERROR) =>
            {
                debug!("ShaDa file \"{}\" does not exist", path.display());
                return Ok(false);
            }
            Err(source) => return Err(ShadaError::Open { path, source }),
        };
        debug!(
            info = flags.contains(ReadFlags::WANT_INFO),
            marks = flags.contains(ReadFlags::WANT_MARKS),
            oldfiles = flags.contains(ReadFlags::GET_OLDFILES),
            "Reading ShaDa file \"{}\"",
            path.display()
        );
        let mut reader = ShadaReader::new(BufReader::new(source));
        reader::read_into(&mut reader, state, flags, &self.config)?;
        self.remember(file, &path);
        Ok(true)
    }

    /// Read everything: info, marks and the old files list.
    pub fn read_everything<S: EditorState + ?Sized>(
        &self,
        file: Option<&str>,
        force: bool,
        missing_ok: bool,
        state: &mut S,
    ) -> Result<bool> {
        let mut flags = ReadFlags::WANT_INFO | ReadFlags::WANT_MARKS | ReadFlags::GET_OLDFILES;
        if force {
            flags |= ReadFlags::FORCE;
        }
        if !missing_ok {
            flags |= ReadFlags::MISSING_ERROR;
        }
        self.read_file(file, flags, state)
    }

    /// Read only local marks and change lists from the default file.
    pub fn read_marks<S: EditorState + ?Sized>(&self, state: &mut S) -> Result<bool> {
        self.read_file(None, ReadFlags::WANT_MARKS, state)
    }

    /// Apply records produced by the `encode_*` methods.
    pub fn read_bytes<S: EditorState + ?Sized>(
        &self,
        bytes: &[u8],
        flags: ReadFlags,
        state: &mut S,
    ) -> Result<()> {
        let mut reader = ShadaReader::new(bytes);
        reader::read_into(&mut reader, state, flags, &self.config)
    }

    // --- Context encoding ---

    pub fn encode_registers<S: EditorState + ?Sized>(&self, state: &S) -> Result<Vec<u8>> {
        writer::encode_registers(state, &self.config)
    }

    pub fn encode_jumps<S: EditorState + ?Sized>(&self, state: &S) -> Result<Vec<u8>> {
        writer::encode_jumps(state, &self.config)
    }

    pub fn encode_buffer_list<S: EditorState + ?Sized>(&self, state: &S) -> Result<Vec<u8>> {
        writer::encode_buffer_list(state, &self.config)
    }

    pub fn encode_global_variables<S: EditorState + ?Sized>(&self, state: &S) -> Result<Vec<u8>> {
        writer::encode_global_variables(state, &self.config)
    }

    // --- Writing ---

    /// Write `state` to a ShaDa file.
    ///
    /// Unless `nomerge` is set, an existing file is merged in: the result is
    /// written to a temp file next to it and renamed over it only once it
    /// is complete. A failed write never touches the existing file.
    pub fn write_file<S: EditorState + ?Sized>(
        &self,
        file: Option<&str>,
        nomerge: bool,
        state: &S,
    ) -> Result<WriteReport> {
        self.ensure_enabled()?;
        let target = self.resolve_path(file);
        debug!("Writing ShaDa file \"{}\"", target.display());
        let report = self.write_with(&target, nomerge, state, BufWriter::new)?;
        self.remember(file, &target);
        Ok(report)
    }

    /// `wrap` builds the output writer on top of a handle to the new file.
    fn write_with<S, W, F>(&self, target: &Path, nomerge: bool, state: &S, wrap: F) -> Result<WriteReport>
    where
        S: EditorState + ?Sized,
        W: Write,
        F: FnOnce(File) -> W,
    {
        if !nomerge {
            match File::open(target) {
                Ok(source) => return self.write_merging(target, source, state, wrap),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => error!(
                    "System error while opening ShaDa file {} for reading to merge before writing it: {}",
                    target.display(),
                    e
                ),
            }
        }
        self.write_direct(target, state, wrap)
    }

    fn write_merging<S, W, F>(
        &self,
        target: &Path,
        source: File,
        state: &S,
        wrap: F,
    ) -> Result<WriteReport>
    where
        S: EditorState + ?Sized,
        W: Write,
        F: FnOnce(File) -> W,
    {
        let (temp, file) = open_temp(target, temp_mode(target))?;
        let mut reader = ShadaReader::new(BufReader::new(source));
        let result = self.fill(&file, Some(&mut reader), state, wrap);
        let mut report = match result {
            Ok(report) => report,
            Err(e) => {
                error!(
                    "Did not rename {} to {} because there were errors during writing it: {}",
                    temp.display(),
                    target.display(),
                    e
                );
                drop(file);
                if let Err(remove) = fs::remove_file(&temp) {
                    error!("Failed to remove {}: {}", temp.display(), remove);
                }
                return Err(e);
            }
        };

        if report.status == WriteStatus::ReadNotShaDa {
            error!(
                "Did not rename {} because {} does not look like a ShaDa file",
                temp.display(),
                target.display()
            );
            report_leftover(&temp, target);
            report.leftover_temp = Some(temp);
            return Ok(report);
        }

        #[cfg(unix)]
        {
            if let Err(e) = check_owner(target, &file) {
                report_leftover(&temp, target);
                return Err(e);
            }
        }

        drop(file);
        if let Err(source) = fs::rename(&temp, target) {
            error!(
                "Can't rename ShaDa file from {} to {}: {}",
                temp.display(),
                target.display(),
                source
            );
            return Err(ShadaError::Rename {
                temp,
                target: target.to_path_buf(),
                source,
            });
        }
        Ok(report)
    }

    fn write_direct<S, W, F>(&self, target: &Path, state: &S, wrap: F) -> Result<WriteReport>
    where
        S: EditorState + ?Sized,
        W: Write,
        F: FnOnce(File) -> W,
    {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                create_private_dir(parent).map_err(|source| ShadaError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let file = open_truncated(target)?;
        self.fill(&file, None::<&mut ShadaReader<io::Empty>>, state, wrap)
    }

    /// Write the merged data into `file` and make it durable.
    fn fill<S, R, W, F>(
        &self,
        file: &File,
        merge_from: Option<&mut ShadaReader<R>>,
        state: &S,
        wrap: F,
    ) -> Result<WriteReport>
    where
        S: EditorState + ?Sized,
        R: io::Read,
        W: Write,
        F: FnOnce(File) -> W,
    {
        let mut out = wrap(file.try_clone()?);
        let report = writer::write_merged(&mut out, merge_from, state, &self.config)?;
        out.flush()?;
        drop(out);
        if self.config.fsync {
            file.sync_all()?;
        }
        Ok(report)
    }
}

fn report_leftover(temp: &Path, target: &Path) {
    error!(
        "Do not forget to remove {} or rename it manually to {}.",
        temp.display(),
        target.display()
    );
}

fn temp_name(target: &Path, suffix: u8) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".tmp.");
    name.push(char::from(suffix).to_string());
    PathBuf::from(name)
}

/// Create the first free `<target>.tmp.[a-z]`.
fn open_temp(target: &Path, mode: u32) -> Result<(PathBuf, File)> {
    for suffix in b'a'..=b'z' {
        let temp = temp_name(target, suffix);
        match create_exclusive(&temp, mode) {
            Ok(file) => return Ok((temp, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists || is_symlink_loop(&e) => {
                debug!("{} exists, trying the next name", temp.display());
            }
            Err(e) => {
                error!(
                    "System error while opening temporary ShaDa file {} for writing: {}",
                    temp.display(),
                    e
                );
                return Err(e.into());
            }
        }
    }
    Err(ShadaError::TempFilesExhausted(target.to_path_buf()))
}

/// Permissions of the replacement: the old ones without setuid bits and
/// always readable and writable by the owner.
#[cfg(unix)]
fn temp_mode(target: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(target)
        .map(|meta| (meta.permissions().mode() & 0o777) | 0o600)
        .unwrap_or(0o600)
}

#[cfg(not(unix))]
fn temp_mode(_target: &Path) -> u32 {
    0o600
}

#[cfg(unix)]
fn create_exclusive(path: &Path, mode: u32) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
}

#[cfg(not(unix))]
fn create_exclusive(path: &Path, _mode: u32) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(unix)]
fn is_symlink_loop(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ELOOP)
}

#[cfg(not(unix))]
fn is_symlink_loop(_e: &io::Error) -> bool {
    false
}

#[cfg(unix)]
fn open_truncated(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_truncated(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Keep a file written as root owned by its previous owner, and refuse to
/// replace a file the current user could not write to.
#[cfg(unix)]
fn check_owner(target: &Path, replacement: &File) -> Result<()> {
    use std::os::unix::fs::MetadataExt;
    let Ok(old) = fs::metadata(target) else {
        return Ok(());
    };
    // SAFETY: getuid and getgid have no preconditions and cannot fail.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    if uid == 0 {
        if old.uid() != 0 || old.gid() != gid {
            std::os::unix::fs::fchown(replacement, Some(old.uid()), Some(old.gid())).map_err(|e| {
                error!("Failed setting uid and gid for file {}: {}", target.display(), e);
                ShadaError::Io(e)
            })?;
        }
        return Ok(());
    }
    let mode = old.mode();
    let writable = if old.uid() == uid {
        mode & 0o200 != 0
    } else if old.gid() == gid {
        mode & 0o020 != 0
    } else {
        mode & 0o002 != 0
    };
    if !writable {
        error!("E137: ShaDa file is not writable: {}", target.display());
        return Err(ShadaError::NotWritable(target.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShadaOptions;
    use crate::state::{AnchoredMark, FileRef, HistoryValue, Mark, RegisterValue, Session};
    use crate::types::{HistoryType, Position, Timestamp, VarValue};
    use tempfile::TempDir;

    fn test_store() -> ShadaStore {
        ShadaStore::new(ShadaConfig {
            fsync: false,
            ..Default::default()
        })
    }

    fn path_str(dir: &TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    fn sample_session() -> Session {
        let mut session = Session::new();
        let buf = session.open_buffer("/src/lib.rs");
        session.set_local_mark(buf, 'a', Mark::new(Position::new(12, 4), Timestamp(10)));
        session.set_global_mark(
            'A',
            AnchoredMark::new(FileRef::Buffer(buf), Position::new(3, 0), Timestamp(11)),
        );
        session.set_register(
            'q',
            RegisterValue {
                contents: vec!["hello".to_string()],
                motion: Default::default(),
                width: 0,
                timestamp: Timestamp(12),
                additional_data: vec![],
            },
            true,
        );
        session.push_history(HistoryType::Cmd, HistoryValue::new("write", Timestamp(13)));
        session.set_global_variable("COUNT", VarValue::Number(3));
        session
    }

    /// Fails every write once `budget` bytes have gone through.
    struct DiskFull<W> {
        inner: W,
        budget: usize,
    }

    impl<W: Write> Write for DiskFull<W> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = self.inner.write(&buf[..buf.len().min(self.budget)])?;
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let store = test_store();
        let file = path_str(&dir, "main.shada");
        let report = store
            .write_file(Some(&file), false, &sample_session())
            .unwrap();
        assert_eq!(report.status, WriteStatus::Successful);

        let mut restored = Session::new();
        let buf = restored.open_buffer("/src/lib.rs");
        assert!(store
            .read_everything(Some(&file), false, false, &mut restored)
            .unwrap());
        assert_eq!(restored.local_marks(buf)[0].1.position, Position::new(12, 4));
        assert_eq!(restored.global_mark('A').unwrap().mark.position.line, 3);
        assert_eq!(restored.register('q').unwrap().contents, vec!["hello"]);
        assert_eq!(restored.history(HistoryType::Cmd)[0].line, "write");
        assert_eq!(restored.global_variable("COUNT"), Some(&VarValue::Number(3)));
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = test_store();
        let file = path_str(&dir, "absent.shada");
        let mut session = Session::new();
        assert!(!store
            .read_file(Some(&file), ReadFlags::WANT_INFO, &mut session)
            .unwrap());
        let result = store.read_everything(Some(&file), false, false, &mut session);
        assert!(matches!(result, Err(ShadaError::Open { .. })));
    }

    #[test]
    fn test_disabled() {
        let store = ShadaStore::new(ShadaConfig {
            shadafile: Some("NONE".to_string()),
            ..Default::default()
        });
        let result = store.write_file(None, false, &Session::new());
        assert!(matches!(result, Err(ShadaError::Disabled)));
    }

    #[test]
    fn test_resolve_path_order() {
        let store = ShadaStore::new(ShadaConfig {
            options: ShadaOptions::parse("'10,n/from/option").unwrap(),
            ..Default::default()
        });
        assert_eq!(store.resolve_path(None), PathBuf::from("/from/option"));
        assert_eq!(store.resolve_path(Some("/explicit")), PathBuf::from("/explicit"));

        let store = ShadaStore::new(ShadaConfig {
            options: ShadaOptions::parse("'10,n/from/option").unwrap(),
            shadafile: Some("/from/config".to_string()),
            ..Default::default()
        });
        assert_eq!(store.resolve_path(None), PathBuf::from("/from/config"));
    }

    #[test]
    fn test_explicit_path_is_remembered() {
        let dir = TempDir::new().unwrap();
        let store = test_store();
        let file = path_str(&dir, "used.shada");
        store.write_file(Some(&file), true, &Session::new()).unwrap();
        assert_eq!(store.resolve_path(None), PathBuf::from(&file));
    }

    #[test]
    fn test_merge_keeps_other_sessions() {
        let dir = TempDir::new().unwrap();
        let store = test_store();
        let file = path_str(&dir, "main.shada");

        let mut first = Session::new();
        first.push_history(HistoryType::Search, HistoryValue::new("needle", Timestamp(1)));
        store.write_file(Some(&file), false, &first).unwrap();

        let mut second = Session::new();
        second.push_history(HistoryType::Search, HistoryValue::new("haystack", Timestamp(2)));
        store.write_file(Some(&file), false, &second).unwrap();

        let mut restored = Session::new();
        store
            .read_file(Some(&file), ReadFlags::WANT_INFO, &mut restored)
            .unwrap();
        let lines: Vec<_> = restored
            .history(HistoryType::Search)
            .into_iter()
            .map(|h| h.line)
            .collect();
        assert_eq!(lines, vec!["needle", "haystack"]);
    }

    #[test]
    fn test_temp_name_collision() {
        let dir = TempDir::new().unwrap();
        let store = test_store();
        let file = path_str(&dir, "main.shada");
        store.write_file(Some(&file), false, &Session::new()).unwrap();
        fs::write(format!("{file}.tmp.a"), b"busy").unwrap();

        store.write_file(Some(&file), false, &sample_session()).unwrap();
        assert_eq!(fs::read(format!("{file}.tmp.a")).unwrap(), b"busy");
        assert!(!Path::new(&format!("{file}.tmp.b")).exists());
    }

    #[test]
    fn test_temp_names_exhausted() {
        let dir = TempDir::new().unwrap();
        let store = test_store();
        let file = path_str(&dir, "main.shada");
        store.write_file(Some(&file), false, &Session::new()).unwrap();
        let before = fs::read(&file).unwrap();
        for suffix in b'a'..=b'z' {
            fs::write(temp_name(Path::new(&file), suffix), b"").unwrap();
        }

        let result = store.write_file(Some(&file), false, &sample_session());
        assert!(matches!(result, Err(ShadaError::TempFilesExhausted(_))));
        assert_eq!(fs::read(&file).unwrap(), before);
    }

    #[test]
    fn test_failed_write_keeps_original() {
        let dir = TempDir::new().unwrap();
        let store = test_store();
        let file = path_str(&dir, "main.shada");
        store.write_file(Some(&file), false, &sample_session()).unwrap();
        let before = fs::read(&file).unwrap();

        let mut changed = sample_session();
        changed.set_global_variable("COUNT", VarValue::Number(4));
        let result = store.write_with(Path::new(&file), false, &changed, |file| DiskFull {
            inner: file,
            budget: 16,
        });
        assert!(matches!(result, Err(ShadaError::Io(_))));
        assert_eq!(fs::read(&file).unwrap(), before);
        assert!(!Path::new(&format!("{file}.tmp.a")).exists());
    }

    #[test]
    fn test_not_shada_leaves_temp() {
        let dir = TempDir::new().unwrap();
        let store = test_store();
        let file = path_str(&dir, "notes.txt");
        fs::write(&file, "\nsome notes\n").unwrap();

        let report = store.write_file(Some(&file), false, &sample_session()).unwrap();
        assert_eq!(report.status, WriteStatus::ReadNotShaDa);
        assert_eq!(fs::read_to_string(&file).unwrap(), "\nsome notes\n");
        let temp = report.leftover_temp.unwrap();
        assert!(temp.ends_with("notes.txt.tmp.a"));
        assert!(temp.exists());
    }

    #[test]
    fn test_nomerge_creates_directories() {
        let dir = TempDir::new().unwrap();
        let store = test_store();
        let file = path_str(&dir, "nested/deeper/main.shada");
        store.write_file(Some(&file), true, &sample_session()).unwrap();
        assert!(Path::new(&file).is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_read_only_original_is_not_replaced() {
        use std::os::unix::fs::PermissionsExt;
        // Root may write anywhere; the check only applies to other users.
        if unsafe { libc::getuid() } == 0 {
            return;
        }
        let dir = TempDir::new().unwrap();
        let store = test_store();
        let file = path_str(&dir, "main.shada");
        store.write_file(Some(&file), false, &Session::new()).unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o400)).unwrap();

        let result = store.write_file(Some(&file), false, &sample_session());
        assert!(matches!(result, Err(ShadaError::NotWritable(_))));
    }

    #[test]
    fn test_context_round_trip() {
        let store = test_store();
        let session = sample_session();
        let bytes = store.encode_registers(&session).unwrap();

        let mut restored = Session::new();
        store
            .read_bytes(&bytes, ReadFlags::WANT_INFO, &mut restored)
            .unwrap();
        assert_eq!(restored.register('q'), session.register('q'));
        assert_eq!(restored.unnamed_register(), Some('q'));
    }
}
