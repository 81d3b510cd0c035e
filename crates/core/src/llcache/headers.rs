//! Response header lines.

const WHITESPACE: &[char] = &[' ', '\t', '\r', '\n'];

/// One response header, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    /// Heap and inline footprint, for cache accounting.
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.name.len() + self.value.len()
    }
}

/// Split a raw header line into name and value.
///
/// Whitespace around the name and value is dropped. A line without a colon
/// is a name with an empty value. Returns `None` when the name is empty.
pub fn split_header(line: &str) -> Option<Header> {
    let line = line.trim_start_matches(WHITESPACE);
    let (name, value) = match line.split_once(':') {
        Some((name, value)) => (name, value.trim_matches(WHITESPACE)),
        None => (line, ""),
    };
    let name = name.trim_end_matches(WHITESPACE);
    if name.is_empty() {
        return None;
    }
    Some(Header { name: name.to_string(), value: value.to_string() })
}
