use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// An atomic log record shipped by a watcher and stored by the collector.
///
/// Header order on the wire is fixed: `id`, `timestamp`, `source`, `tags`,
/// then any extra headers in the order they were first seen, then content.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub timestamp: f64,
    pub source: String,
    pub tags: Vec<String>,
    /// Extra headers in insertion order. Duplicate names: last write wins,
    /// in the position of the name's first occurrence.
    pub extras: Vec<(String, String)>,
    pub content: Vec<u8>,
}

impl Event {
    /// Floor of `timestamp` as whole seconds, used for time-bound filtering
    /// and bucket assignment.
    pub fn timestamp_secs(&self) -> i64 {
        self.timestamp.floor() as i64
    }

    /// Deduplicated tag set, ignoring order and duplicate entries.
    pub fn tag_set(&self) -> BTreeSet<&str> {
        self.tags.iter().map(|s| s.as_str()).collect()
    }

    /// Serialize to the wire format: `id:`, `timestamp:`, `source:`, `tags:`,
    /// extras (insertion order), then content with no trailing newline.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.content.len());
        out.extend_from_slice(b"id:");
        out.extend_from_slice(self.id.as_bytes());
        out.push(b'\n');

        out.extend_from_slice(b"timestamp:");
        out.extend_from_slice(format_timestamp(self.timestamp).as_bytes());
        out.push(b'\n');

        out.extend_from_slice(b"source:");
        out.extend_from_slice(self.source.as_bytes());
        out.push(b'\n');

        out.extend_from_slice(b"tags:");
        out.extend_from_slice(self.tags.join(",").as_bytes());
        out.push(b'\n');

        for (name, value) in &self.extras {
            out.extend_from_slice(name.as_bytes());
            out.push(b':');
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }

        out.extend_from_slice(&self.content);
        out
    }

    /// Parse the wire format described in spec §4.1.
    ///
    /// Reads header lines until one carries no `:` (or input is exhausted);
    /// the remainder of input from that line (inclusive) is content.
    pub fn parse(bytes: &[u8]) -> Result<Event> {
        if bytes.is_empty() {
            return Err(Error::Parse("empty input".into()));
        }

        let mut id: Option<String> = None;
        let mut timestamp: Option<f64> = None;
        let mut source: Option<String> = None;
        let mut tags: Option<Vec<String>> = None;
        let mut extras: Vec<(String, String)> = Vec::new();

        let mut pos = 0usize;
        let content_start;
        loop {
            if pos >= bytes.len() {
                content_start = bytes.len();
                break;
            }
            let line_end = match bytes[pos..].iter().position(|&b| b == b'\n') {
                Some(rel) => pos + rel,
                None => {
                    // No more newlines: this and everything after it is content.
                    content_start = pos;
                    break;
                }
            };
            let line = &bytes[pos..line_end];
            let colon = match line.iter().position(|&b| b == b':') {
                Some(c) => c,
                None => {
                    content_start = pos;
                    break;
                }
            };
            let name = String::from_utf8_lossy(&line[..colon]).into_owned();
            let value = String::from_utf8_lossy(&line[colon + 1..]).into_owned();

            match name.as_str() {
                "id" => id = Some(value),
                "timestamp" => {
                    timestamp = Some(parse_timestamp(&value)?);
                }
                "source" => source = Some(value),
                "tags" => {
                    tags = Some(value.split(',').filter(|s| !s.is_empty()).map(String::from).collect())
                }
                _ => {
                    if let Some(entry) = extras.iter_mut().find(|(n, _)| n == &name) {
                        entry.1 = value;
                    } else {
                        extras.push((name, value));
                    }
                }
            }

            pos = line_end + 1;
        }

        let id = id.ok_or_else(|| Error::Parse("missing id".into()))?;

        Ok(Event {
            id,
            // A missing `timestamp:` header is not a parse error: the
            // collector fills this in with a receive timestamp (spec §4.5),
            // so the codec only needs to reject a header that is present
            // but non-numeric.
            timestamp: timestamp.unwrap_or(0.0),
            source: source.unwrap_or_default(),
            tags: tags.unwrap_or_default(),
            extras,
            content: bytes[content_start..].to_vec(),
        })
    }
}

/// Tolerates a single leading space, matching observed producers.
fn parse_timestamp(value: &str) -> Result<f64> {
    let trimmed = value.strip_prefix(' ').unwrap_or(value);
    trimmed
        .parse::<f64>()
        .map_err(|_| Error::Parse(format!("non-numeric timestamp: {value:?}")))
}

fn format_timestamp(ts: f64) -> String {
    // Avoid trailing ".0" noise while preserving full precision otherwise.
    if ts.fract() == 0.0 && ts.is_finite() {
        format!("{}", ts as i64)
    } else {
        format!("{ts}")
    }
}
