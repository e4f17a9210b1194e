//! Bounded merge primitives.
//!
//! Both the reader and the writer reconcile two sources of the same data:
//! what the running session holds and what the file on disk holds. These
//! collections do the reconciling while keeping a hard cap on size.

mod ring;
mod sorted;

pub use ring::{HistoryMerger, HistoryRing, RingItem};
pub use sorted::{upsert_bounded, Upsert};

/// Where a value being merged came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    /// The running session.
    Session,
    /// A ShaDa file.
    File,
}
