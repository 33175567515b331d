//! Opaque paging cursors over the attendance sequence.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

const PREFIX: &str = "seq:";

pub fn encode_cursor(seq: i64) -> String {
    URL_SAFE_NO_PAD.encode(format!("{PREFIX}{seq}"))
}

/// Returns the sequence a cursor points after, or `None` for anything we did not issue.
pub fn decode_cursor(cursor: &str) -> Option<i64> {
    let raw = URL_SAFE_NO_PAD.decode(cursor).ok()?;
    let text = std::str::from_utf8(&raw).ok()?;
    text.strip_prefix(PREFIX)?
        .parse()
        .ok()
        .filter(|seq: &i64| *seq >= 0)
}
