//! Hierarchical event identifiers such as `App.Out.Result`.
//!
//! Matching works on dot-separated segments and ignores ASCII case. In a
//! pattern, `?` matches exactly one segment and `*` matches any number of
//! segments, including none.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    One,
    Rest,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventPattern {
    raw: String,
    segments: Vec<Segment>,
}

pub fn segments(id: &str) -> impl Iterator<Item = &str> {
    id.split('.').map(str::trim).filter(|segment| !segment.is_empty())
}

impl EventPattern {
    pub fn new(pattern: &str) -> Self {
        let segments = segments(pattern)
            .map(|segment| match segment {
                "*" => Segment::Rest,
                "?" => Segment::One,
                literal => Segment::Literal(literal.to_ascii_lowercase()),
            })
            .collect();
        Self {
            raw: pattern.trim().to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, id: &str) -> bool {
        let parts = segments(id).collect::<Vec<_>>();
        match_segments(&self.segments, &parts)
    }
}

fn match_segments(pattern: &[Segment], id: &[&str]) -> bool {
    match pattern.split_first() {
        None => id.is_empty(),
        Some((Segment::Rest, rest)) => (0..=id.len()).any(|skip| match_segments(rest, &id[skip..])),
        Some((Segment::One, rest)) => !id.is_empty() && match_segments(rest, &id[1..]),
        Some((Segment::Literal(literal), rest)) => match id.split_first() {
            Some((head, tail)) => head.eq_ignore_ascii_case(literal) && match_segments(rest, tail),
            None => false,
        },
    }
}

impl FromStr for EventPattern {
    type Err = std::convert::Infallible;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(input))
    }
}

impl From<&str> for EventPattern {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Removes `prefix` from `id` on segment boundaries. The remainder keeps the
/// original spelling of `id`.
pub fn strip_segment_prefix<'a>(id: &'a str, prefix: &str) -> Option<&'a str> {
    let mut rest = id.trim();
    for wanted in segments(prefix) {
        rest = rest.trim_start_matches('.');
        let (head, tail) = match rest.find('.') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, ""),
        };
        if !head.trim().eq_ignore_ascii_case(wanted) {
            return None;
        }
        rest = tail;
    }
    Some(rest.trim_start_matches('.'))
}

/// Segment-wise prefix test, so `gw1` covers `gw1.a` but not `gw10.a`.
pub fn has_segment_prefix(id: &str, prefix: &str) -> bool {
    strip_segment_prefix(id, prefix).is_some()
}
