use serde::Deserialize;

use crate::error::Result;
use crate::event::Event;

/// Sort order for `/find` results. Ignored on `/live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    Asc,
    Desc,
}

impl Default for Order {
    fn default() -> Self {
        Order::Asc
    }
}

/// A conjunctive filter descriptor, as received over `/find` and `/live`.
/// Unknown JSON keys are ignored; absent fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterDescriptor {
    pub id: Option<String>,
    pub source: Option<String>,
    pub content: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    #[serde(default)]
    pub order: Order,
}

/// The compiled, pure predicate form of a `FilterDescriptor`. Holds no
/// per-call state and is safe to share across threads.
pub struct Filter {
    id: Option<regex::Regex>,
    source: Option<regex::Regex>,
    content: Option<regex::Regex>,
    tags: Vec<regex::Regex>,
    start: Option<i64>,
    end: Option<i64>,
    order: Order,
}

impl Filter {
    pub fn order(&self) -> Order {
        self.order
    }

    pub fn start(&self) -> Option<i64> {
        self.start
    }

    pub fn end(&self) -> Option<i64> {
        self.end
    }

    /// Evaluate the short-circuit order from spec §4.2: time bounds, id,
    /// source, tags, content.
    pub fn matches(&self, event: &Event) -> bool {
        let secs = event.timestamp_secs();
        if let Some(start) = self.start {
            if secs < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if secs > end {
                return false;
            }
        }

        if let Some(re) = &self.id {
            if !re.is_match(&event.id) {
                return false;
            }
        }

        if let Some(re) = &self.source {
            if !re.is_match(&event.source) {
                return false;
            }
        }

        if !self.tags.is_empty() {
            let any_tag_matches = event
                .tags
                .iter()
                .any(|tag| self.tags.iter().any(|re| re.is_match(tag)));
            if !any_tag_matches {
                return false;
            }
        }

        if let Some(re) = &self.content {
            let content = String::from_utf8_lossy(&event.content);
            if !re.is_match(&content) {
                return false;
            }
        }

        true
    }
}

/// Compile a descriptor's regexes once. Each regex uses unanchored `find`
/// semantics (the `regex` crate's default), not `fullmatch`.
pub fn compile(descriptor: &FilterDescriptor) -> Result<Filter> {
    let id = descriptor.id.as_deref().map(regex::Regex::new).transpose()?;
    let source = descriptor.source.as_deref().map(regex::Regex::new).transpose()?;
    let content = descriptor
        .content
        .as_deref()
        .map(|pat| regex::RegexBuilder::new(pat).multi_line(true).build())
        .transpose()?;
    let tags = descriptor
        .tags
        .iter()
        .map(|pat| regex::Regex::new(pat))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Filter {
        id,
        source,
        content,
        tags,
        start: descriptor.start,
        end: descriptor.end,
        order: descriptor.order,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, ts: f64, source: &str, tags: &[&str], content: &str) -> Event {
        Event {
            id: id.into(),
            timestamp: ts,
            source: source.into(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            extras: Vec::new(),
            content: content.as_bytes().to_vec(),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = compile(&FilterDescriptor::default()).unwrap();
        assert!(f.matches(&event("a", 1.0, "s", &[], "x")));
    }

    #[test]
    fn tags_match_any_regex_any_tag() {
        let d = FilterDescriptor {
            tags: vec!["web.*".into()],
            ..Default::default()
        };
        let f = compile(&d).unwrap();
        assert!(f.matches(&event("1", 100.0, "s", &["web"], "")));
        assert!(f.matches(&event("2", 200.0, "s", &["web", "prod"], "")));
        assert!(!f.matches(&event("3", 300.0, "s", &["db"], "")));
    }

    #[test]
    fn time_window_inclusive_bounds() {
        let d = FilterDescriptor {
            start: Some(150),
            end: Some(250),
            ..Default::default()
        };
        let f = compile(&d).unwrap();
        assert!(!f.matches(&event("1", 100.0, "s", &[], "")));
        assert!(f.matches(&event("2", 200.0, "s", &[], "")));
        assert!(!f.matches(&event("3", 300.0, "s", &[], "")));
        assert!(f.matches(&event("edge-start", 150.0, "s", &[], "")));
        assert!(f.matches(&event("edge-end", 250.0, "s", &[], "")));
    }

    #[test]
    fn content_regex_unanchored_and_multiline() {
        let d = FilterDescriptor {
            content: Some(r"\[ERR\]".into()),
            ..Default::default()
        };
        let f = compile(&d).unwrap();
        assert!(!f.matches(&event("1", 1.0, "s", &[], "ok")));
        assert!(f.matches(&event("2", 1.0, "s", &[], "[ERR] a")));
        assert!(f.matches(&event("3", 1.0, "s", &[], "line one\n[ERR] on line two")));
    }

    #[test]
    fn invalid_regex_is_compile_error() {
        let d = FilterDescriptor {
            id: Some("(".into()),
            ..Default::default()
        };
        assert!(compile(&d).is_err());
    }

    #[test]
    fn conjunctive_across_fields() {
        let d = FilterDescriptor {
            source: Some("^svc$".into()),
            content: Some("boom".into()),
            ..Default::default()
        };
        let f = compile(&d).unwrap();
        assert!(!f.matches(&event("1", 1.0, "svc", &[], "ok")));
        assert!(!f.matches(&event("2", 1.0, "other", &[], "boom")));
        assert!(f.matches(&event("3", 1.0, "svc", &[], "boom")));
    }
}
