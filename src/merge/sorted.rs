//! Bounded sorted-array upsert, shared by jump lists and change lists.

use crate::types::Timestamp;

/// Outcome of [`upsert_bounded`].
#[derive(Debug, PartialEq)]
pub enum Upsert<T> {
    /// Inserted at the given index. `evicted` holds the oldest element if
    /// the list was full.
    Inserted { index: usize, evicted: Option<T> },
    /// The list already records this position at least as recently, or the
    /// list is full of newer elements. The new element is handed back.
    Dropped(T),
}

/// Insert `new` into `items`, which is sorted by ascending timestamp and
/// holds at most `capacity` elements.
///
/// Walking back from the newest element, any element at the same position
/// that is newer than `new` supersedes it, as does the first element that is
/// not newer if it is at the same position.
pub fn upsert_bounded<T, K, E>(
    items: &mut Vec<T>,
    capacity: usize,
    new: T,
    timestamp: K,
    same_position: E,
) -> Upsert<T>
where
    K: Fn(&T) -> Timestamp,
    E: Fn(&T, &T) -> bool,
{
    let new_ts = timestamp(&new);
    let mut index = items.len();
    while index > 0 {
        let existing = &items[index - 1];
        if same_position(existing, &new) {
            return Upsert::Dropped(new);
        }
        if timestamp(existing) <= new_ts {
            break;
        }
        index -= 1;
    }

    if capacity == 0 {
        return Upsert::Dropped(new);
    }
    let mut evicted = None;
    if items.len() >= capacity {
        if index == 0 {
            return Upsert::Dropped(new);
        }
        evicted = Some(items.remove(0));
        index -= 1;
    }
    items.insert(index, new);
    Upsert::Inserted { index, evicted }
}
