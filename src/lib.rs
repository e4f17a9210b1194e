//! # ShaDa
//!
//! Persistence for editor session state: marks, jumps, change lists,
//! registers, command and search history, global variables and the buffer
//! list, kept in a single binary file of msgpack records.
//!
//! ## Core Concepts
//!
//! - **Records**: `[type][timestamp][length][payload]`, payload in msgpack
//! - **Merging**: reading and writing both reconcile the file with live
//!   state; the newer side wins, history and jump lists interleave
//! - **Safe writes**: merged output goes to a temp file that replaces the
//!   old one only once it is complete
//! - **Pass-through**: records this version does not understand survive
//!   a rewrite unchanged
//!
//! ## Example
//!
//! ```ignore
//! use shada::{ReadFlags, Session, ShadaConfig, ShadaStore};
//!
//! let store = ShadaStore::new(ShadaConfig::default());
//! let mut session = Session::new();
//!
//! // Restore the previous session
//! store.read_everything(None, false, true, &mut session)?;
//!
//! // ... edit ...
//!
//! // Merge with what other instances wrote and save
//! let report = store.write_file(None, false, &session)?;
//! for problem in &report.ignorable_errors {
//!     eprintln!("not saved: {problem}");
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod flags;
pub mod inspect;
pub mod merge;
pub mod reader;
pub mod state;
pub mod store;
pub mod types;
pub mod value;
pub mod writer;

// Re-exports
pub use config::{ShadaConfig, ShadaOptions, DEFAULT_SHADA_OPTION};
pub use error::{Result, ShadaError};
pub use flags::{EntryMask, ReadFlags};
pub use merge::{HistoryMerger, HistoryRing, Origin};
pub use reader::{read_into, ReadItem, ShadaReader};
pub use state::{
    AnchoredMark, BufferId, BufferInfo, EditorState, FileRef, HistoryValue, Mark, RegisterValue,
    Replacement, SearchPatternValue, Session,
};
pub use store::ShadaStore;
pub use types::{Entry, EntryData, EntryKind, HistoryType, MotionType, Position, Timestamp, VarValue};
pub use value::{RawValue, Value};
pub use writer::{write_merged, WriteReport, WriteStatus};
