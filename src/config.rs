//! Store configuration and the `'shada'` option string.
//!
//! The option string is a comma separated list of items, each a single
//! character optionally followed by a value:
//!
//! | item | meaning |
//! |------|---------|
//! | `!`  | save global variables |
//! | `"`  | register line cap (older spelling of `<`) |
//! | `%`  | save the buffer list, with an optional cap |
//! | `'`  | number of files whose marks are saved (required) |
//! | `/` `:` `=` `@` `>` | history sizes per kind |
//! | `<`  | register line cap |
//! | `c`  | accepted for compatibility, ignored |
//! | `f`  | `f0` disables global marks |
//! | `h`  | do not restore search highlighting |
//! | `n`  | file name, takes the rest of the string |
//! | `r`  | removable media prefix |
//! | `s`  | maximum item size in KiB |

use crate::error::{Result, ShadaError};
use crate::types::HistoryType;
use etcetera::base_strategy::{choose_base_strategy, BaseStrategy};
use std::path::{Path, PathBuf};

const VALID_ITEMS: &str = "!\"%'/:<@cfhnrs";

/// Default `'shada'` value.
pub const DEFAULT_SHADA_OPTION: &str = "!,'100,<50,s10,h";

/// Default maximum item size in KiB.
const DEFAULT_MAX_KBYTE: u64 = 10;

/// Largest numeric parameter an item can carry; longer numbers saturate.
const MAX_PARAMETER: i64 = i32::MAX as i64;

/// Parsed and validated `'shada'` option.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadaOptions {
    raw: String,
}

impl Default for ShadaOptions {
    fn default() -> Self {
        Self {
            raw: DEFAULT_SHADA_OPTION.to_string(),
        }
    }
}

impl ShadaOptions {
    /// Validate an option string.
    pub fn parse(raw: &str) -> Result<Self> {
        let bytes = raw.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i] as char;
            if !VALID_ITEMS.contains(c) {
                return Err(ShadaError::InvalidOption(format!(
                    "E539: Illegal character <{c}>"
                )));
            }
            i += 1;
            match c {
                'n' => break,
                'r' => {
                    while i < bytes.len() && bytes[i] != b',' {
                        i += 1;
                    }
                }
                '%' => {
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                '!' | 'h' | 'c' => {}
                _ => {
                    if i >= bytes.len() || !bytes[i].is_ascii_digit() {
                        return Err(ShadaError::InvalidOption(format!(
                            "E526: Missing number after <{c}>"
                        )));
                    }
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            if i < bytes.len() {
                if bytes[i] != b',' {
                    return Err(ShadaError::InvalidOption("E527: Missing comma".to_string()));
                }
                i += 1;
            }
        }

        let options = Self {
            raw: raw.to_string(),
        };
        if !raw.is_empty() && options.parameter('\'').is_none() {
            return Err(ShadaError::InvalidOption(
                "E528: Must specify a ' value".to_string(),
            ));
        }
        Ok(options)
    }

    /// Empty option: only the undisableable kinds are kept.
    pub fn empty() -> Self {
        Self { raw: String::new() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Text following item `c`, if present.
    fn find(&self, c: char) -> Option<&str> {
        let mut rest = self.raw.as_str();
        loop {
            let mut chars = rest.chars();
            let first = chars.next()?;
            if first == c {
                return Some(chars.as_str());
            }
            if first == 'n' {
                return None;
            }
            let comma = rest.find(',')?;
            rest = &rest[comma + 1..];
        }
    }

    /// Whether item `c` is present at all.
    pub fn has(&self, c: char) -> bool {
        self.find(c).is_some()
    }

    /// Numeric value of item `c`, if present and followed by a number.
    pub fn parameter(&self, c: char) -> Option<i64> {
        let value = self.find(c)?;
        let digits: &str = &value[..value
            .find(|ch: char| !ch.is_ascii_digit())
            .unwrap_or(value.len())];
        if digits.is_empty() {
            return None;
        }
        // Saturate absurdly long numbers rather than rejecting them.
        Some(digits.parse().map_or(MAX_PARAMETER, |n: i64| n.min(MAX_PARAMETER)))
    }

    /// Number of files whose local marks and changes are saved.
    pub fn marked_files(&self) -> usize {
        self.parameter('\'').map_or(0, |n| n as usize)
    }

    /// Maximum register size in lines; `None` means no limit.
    pub fn register_line_limit(&self) -> Option<usize> {
        self.parameter('<')
            .or_else(|| self.parameter('"'))
            .map(|n| n as usize)
    }

    /// `<0` disables registers altogether.
    pub fn dump_registers(&self) -> bool {
        self.register_line_limit() != Some(0)
    }

    /// Maximum item size in KiB; 0 means nothing is written.
    pub fn max_kbyte(&self) -> u64 {
        self.parameter('s').map_or(DEFAULT_MAX_KBYTE, |n| n as u64)
    }

    /// Number of history lines of `kind` to keep.
    pub fn history_limit(&self, kind: HistoryType, default: usize) -> usize {
        self.parameter(kind.option_char())
            .map_or(default, |n| n as usize)
    }

    pub fn save_global_variables(&self) -> bool {
        self.has('!')
    }

    /// Cap on saved buffers when the buffer list is saved; `Some(None)`
    /// means no cap.
    pub fn buffer_list(&self) -> Option<Option<usize>> {
        if !self.has('%') {
            return None;
        }
        Some(self.parameter('%').map(|n| n as usize))
    }

    pub fn save_global_marks(&self) -> bool {
        self.parameter('f') != Some(0)
    }

    /// Search highlighting is not restored.
    pub fn no_hlsearch(&self) -> bool {
        self.has('h')
    }

    /// File name given with `n`.
    pub fn file_name(&self) -> Option<&str> {
        self.find('n').filter(|name| !name.is_empty())
    }

    /// Removable media prefixes given with `r`.
    pub fn removable_prefixes(&self) -> Vec<String> {
        let mut prefixes = Vec::new();
        for item in self.raw.split(',') {
            if item.starts_with('n') {
                break;
            }
            if let Some(prefix) = item.strip_prefix('r') {
                if !prefix.is_empty() {
                    prefixes.push(expand_path(prefix));
                }
            }
        }
        prefixes
    }

    /// Whether `path` lives under one of the removable media prefixes.
    pub fn is_removable(&self, path: &str) -> bool {
        let path = expand_path(path);
        self.removable_prefixes().iter().any(|prefix| {
            path.len() >= prefix.len()
                && path.is_char_boundary(prefix.len())
                && path[..prefix.len()].eq_ignore_ascii_case(prefix)
        })
    }
}

/// Store configuration.
#[derive(Clone, Debug)]
pub struct ShadaConfig {
    /// The `'shada'` option.
    pub options: ShadaOptions,

    /// Default history size for kinds without their own item.
    pub history_len: usize,

    /// Overrides every other path source. `"NONE"` disables the store.
    pub shadafile: Option<String>,

    /// Whether to fsync the file before renaming it into place.
    pub fsync: bool,
}

impl Default for ShadaConfig {
    fn default() -> Self {
        Self {
            options: ShadaOptions::default(),
            history_len: 10000,
            shadafile: None,
            fsync: true,
        }
    }
}

impl ShadaConfig {
    pub fn is_disabled(&self) -> bool {
        self.shadafile.as_deref() == Some("NONE")
    }
}

/// `<state dir>/nvim/shada/main.shada`.
pub fn default_shada_path() -> PathBuf {
    let mut path = match choose_base_strategy() {
        Ok(strategy) => strategy
            .state_dir()
            .unwrap_or_else(|| strategy.data_dir()),
        Err(_) => PathBuf::from("."),
    };
    path.push("nvim");
    path.push("shada");
    path.push("main.shada");
    path
}

/// Expand a leading `~` and `$VAR` / `${VAR}` references. Unset variables
/// are left as written.
pub fn expand_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut rest = path;

    if let Some(after) = rest.strip_prefix('~') {
        if after.is_empty() || after.starts_with('/') {
            if let Ok(home) = etcetera::home_dir() {
                out.push_str(&home.to_string_lossy());
                rest = after;
            }
        }
    }

    while let Some(dollar) = rest.find('$') {
        out.push_str(&rest[..dollar]);
        let after = &rest[dollar + 1..];
        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };
        match std::env::var(name) {
            Ok(value) if !name.is_empty() => out.push_str(&value),
            _ => out.push_str(&rest[dollar..dollar + 1 + consumed]),
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}

/// Resolve a possibly relative, unexpanded path.
pub fn resolve(path: &str) -> PathBuf {
    let expanded = expand_path(path);
    let path = Path::new(&expanded);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_option() {
        let opts = ShadaOptions::default();
        assert_eq!(opts.marked_files(), 100);
        assert_eq!(opts.register_line_limit(), Some(50));
        assert_eq!(opts.max_kbyte(), 10);
        assert!(opts.save_global_variables());
        assert!(opts.no_hlsearch());
        assert!(opts.save_global_marks());
        assert!(opts.buffer_list().is_none());
        assert_eq!(opts.history_limit(HistoryType::Cmd, 42), 42);
    }

    #[test]
    fn test_parse_errors() {
        let err = |s: &str| match ShadaOptions::parse(s) {
            Err(ShadaError::InvalidOption(msg)) => msg,
            other => panic!("expected error for {s:?}, got {other:?}"),
        };
        assert!(err("'100,x").starts_with("E539"));
        assert!(err("'100,<").starts_with("E526"));
        assert!(err("'100!").starts_with("E527"));
        assert!(err("<50").starts_with("E528"));
    }

    #[test]
    fn test_items() {
        let opts = ShadaOptions::parse("'20,%5,:30,/0,f0,<10,s1,r/mnt/usb,n/tmp/x.shada").unwrap();
        assert_eq!(opts.marked_files(), 20);
        assert_eq!(opts.buffer_list(), Some(Some(5)));
        assert_eq!(opts.history_limit(HistoryType::Cmd, 100), 30);
        assert_eq!(opts.history_limit(HistoryType::Search, 100), 0);
        assert_eq!(opts.history_limit(HistoryType::Expr, 100), 100);
        assert!(!opts.save_global_marks());
        assert!(!opts.save_global_variables());
        assert_eq!(opts.max_kbyte(), 1);
        assert_eq!(opts.file_name(), Some("/tmp/x.shada"));
        assert!(opts.is_removable("/MNT/usb/notes.txt"));
        assert!(!opts.is_removable("/home/user/notes.txt"));
    }

    #[test]
    fn test_huge_parameters_saturate() {
        let opts = ShadaOptions::parse("'99999999999999999999,:4294967296").unwrap();
        assert_eq!(opts.parameter('\''), Some(i64::from(i32::MAX)));
        assert_eq!(opts.history_limit(HistoryType::Cmd, 100), i32::MAX as usize);
    }

    #[test]
    fn test_name_item_is_last() {
        // Everything after `n` is the file name, commas included.
        let opts = ShadaOptions::parse("'5,n/tmp/a,b").unwrap();
        assert_eq!(opts.file_name(), Some("/tmp/a,b"));
        assert_eq!(opts.parameter('b'), None);
    }

    #[test]
    fn test_register_limit_fallback() {
        let opts = ShadaOptions::parse("'5,\"7").unwrap();
        assert_eq!(opts.register_line_limit(), Some(7));
        let opts = ShadaOptions::parse("'5,<0").unwrap();
        assert!(!opts.dump_registers());
    }

    #[test]
    fn test_empty_option() {
        let opts = ShadaOptions::parse("").unwrap();
        assert_eq!(opts.marked_files(), 0);
        assert_eq!(opts.register_line_limit(), None);
        assert!(!opts.save_global_variables());
    }

    #[test]
    fn test_expand_path() {
        std::env::set_var("SHADA_TEST_EXPAND_DIR", "/data");
        assert_eq!(expand_path("$SHADA_TEST_EXPAND_DIR/main.shada"), "/data/main.shada");
        assert_eq!(expand_path("${SHADA_TEST_EXPAND_DIR}x"), "/datax");
        assert_eq!(
            expand_path("$SHADA_TEST_UNSET_VARIABLE/a"),
            "$SHADA_TEST_UNSET_VARIABLE/a"
        );
        assert_eq!(expand_path("cost$"), "cost$");
    }

    #[test]
    fn test_disabled() {
        let config = ShadaConfig {
            shadafile: Some("NONE".to_string()),
            ..Default::default()
        };
        assert!(config.is_disabled());
        assert!(!ShadaConfig::default().is_disabled());
    }
}
