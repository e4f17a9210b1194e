//! Human-readable dumps of ShaDa data, for debugging.

use crate::error::{Result, ShadaError};
use crate::flags::EntryMask;
use crate::reader::{ReadItem, ShadaReader};
use serde_json::{json, Value as JsonValue};
use std::io::Read;

/// Dump every record of `input` as a JSON array.
///
/// Malformed records show up with their offset and reason. If the input
/// stops looking like ShaDa data, a final element describes where and why;
/// everything before it is still returned. Only I/O errors fail the dump.
pub fn dump_json<R: Read>(input: R) -> Result<JsonValue> {
    let mut reader = ShadaReader::new(input);
    let mut records = Vec::new();
    loop {
        let offset = reader.offset();
        match reader.next_item(EntryMask::all(), 0) {
            Ok(ReadItem::Finished) => break,
            Ok(ReadItem::Entry(entry)) => {
                let kind = entry.kind().map_or("unknown", |kind| kind.name());
                records.push(json!({
                    "offset": offset,
                    "type": entry.type_code(),
                    "kind": kind,
                    "timestamp": entry.timestamp,
                    "data": serde_json::to_value(&entry.data)?,
                }));
            }
            Ok(ReadItem::Malformed { offset, reason }) => {
                records.push(json!({ "offset": offset, "malformed": reason }));
            }
            Err(ShadaError::NotShaDa { offset, reason }) => {
                records.push(json!({ "offset": offset, "error": reason }));
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(JsonValue::Array(records))
}
