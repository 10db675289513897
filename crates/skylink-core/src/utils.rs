/*!
 * Byte rendering for wire-level logs.
 */
use std::fmt::Write as _;

/// Render bytes as space separated hex, for wire-level trace logs
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Render bytes for logs: printable ASCII as text, anything else as hex
pub fn printable(bytes: &[u8]) -> String {
    if bytes
        .iter()
        .all(|b| b.is_ascii_graphic() || *b == b' ')
    {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        hex_dump(bytes)
    }
}
