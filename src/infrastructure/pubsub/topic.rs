//! Topic Matching
//!
//! Dot-segmented topics matched against subscription patterns:
//!
//! - a literal segment matches the same segment exactly
//! - `*` matches exactly one non-empty segment
//! - `**` matches zero or more segments, so `a.**` also matches `a`
//!
//! Matching is pure and shared by every delivery backend.

use std::fmt;

/// Single segment of a compiled pattern
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Single,
    Multi,
}

/// A subscription pattern compiled into segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Compile a pattern string
    pub fn new(pattern: &str) -> Self {
        let segments = pattern
            .split('.')
            .map(|segment| match segment {
                "*" => Segment::Single,
                "**" => Segment::Multi,
                literal => Segment::Literal(literal.to_string()),
            })
            .collect();

        Self {
            raw: pattern.to_string(),
            segments,
        }
    }

    /// The original pattern string
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern contains any wildcard segment
    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Single | Segment::Multi))
    }

    /// Check a concrete topic against this pattern
    pub fn matches(&self, topic: &str) -> bool {
        if topic == self.raw {
            return true;
        }
        if !self.has_wildcards() {
            return false;
        }

        let topic: Vec<&str> = topic.split('.').collect();
        let (mut t, mut p) = (0usize, 0usize);
        // (pattern index after the last `**`, topic index it currently absorbs up to)
        let mut backtrack: Option<(usize, usize)> = None;

        while t < topic.len() {
            match self.segments.get(p) {
                Some(Segment::Multi) => {
                    backtrack = Some((p + 1, t));
                    p += 1;
                }
                Some(Segment::Single) if !topic[t].is_empty() => {
                    p += 1;
                    t += 1;
                }
                Some(Segment::Literal(literal)) if literal == topic[t] => {
                    p += 1;
                    t += 1;
                }
                _ => match backtrack {
                    Some((resume, absorbed)) => {
                        p = resume;
                        t = absorbed + 1;
                        backtrack = Some((resume, absorbed + 1));
                    }
                    None => return false,
                },
            }
        }

        self.segments[p..].iter().all(|s| *s == Segment::Multi)
    }

    /// Translate into a Redis `PSUBSCRIBE` glob.
    ///
    /// Redis globs only know `*` (any run of characters, dots included), so
    /// both wildcards collapse into it and `**` also swallows its adjacent
    /// separators. The result is never narrower than the pattern; deliveries
    /// must still be filtered with [`TopicPattern::matches`].
    pub fn to_redis_glob(&self, prefix: &str) -> String {
        let mut glob = String::with_capacity(prefix.len() + self.raw.len());
        glob.push_str(prefix);
        let mut pending_dot = false;

        for segment in &self.segments {
            match segment {
                Segment::Multi => {
                    glob.push('*');
                    pending_dot = false;
                }
                Segment::Single => {
                    if pending_dot {
                        glob.push('.');
                    }
                    glob.push('*');
                    pending_dot = true;
                }
                Segment::Literal(literal) => {
                    if pending_dot {
                        glob.push('.');
                    }
                    for c in literal.chars() {
                        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                            glob.push('\\');
                        }
                        glob.push(c);
                    }
                    pending_dot = true;
                }
            }
        }

        glob
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Match a concrete topic against a subscription pattern
pub fn matches(topic: &str, pattern: &str) -> bool {
    topic == pattern || TopicPattern::new(pattern).matches(topic)
}
