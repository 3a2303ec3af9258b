//! Relative Pointers
//!
//! Expressions and watch lists refer to other fields through pointers:
//!
//! - `#` / `#/a/b` / `/a/b`: absolute, from the root node
//! - `.` / `./a`: relative to the node owning the expression
//! - `..` / `../a` / `../../a`: relative to an ancestor
//! - `*` as a segment matches every child of an array or object
//!
//! A pointer resolves against the owner's absolute path into a [`PathPattern`],
//! which is what the dependency index stores.

use std::fmt;

/// One segment of a pointer or pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    Key(String),
    Wildcard,
}

impl Segment {
    fn matches(&self, name: &str) -> bool {
        match self {
            Segment::Key(key) => key == name,
            Segment::Wildcard => true,
        }
    }
}

/// Where a pointer starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Anchor {
    Root,
    /// Number of `..` steps above the owning node.
    Relative(usize),
}

/// A parsed pointer, not yet bound to a location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelativePointer {
    source: String,
    anchor: Anchor,
    segments: Vec<Segment>,
}

impl RelativePointer {
    /// Parse a pointer string.
    pub fn parse(input: &str) -> Result<Self, String> {
        let (anchor, rest) = if input == "#" {
            (Anchor::Root, "")
        } else if let Some(rest) = input.strip_prefix("#/") {
            (Anchor::Root, rest)
        } else if let Some(rest) = input.strip_prefix('/') {
            (Anchor::Root, rest)
        } else if input.starts_with('.') {
            let mut up = 0;
            let mut rest = input;
            loop {
                if rest == ".." {
                    up += 1;
                    rest = "";
                } else if rest == "." {
                    rest = "";
                } else if let Some(next) = rest.strip_prefix("../") {
                    up += 1;
                    rest = next;
                    continue;
                } else if let Some(next) = rest.strip_prefix("./") {
                    rest = next;
                    continue;
                }
                break;
            }
            (Anchor::Relative(up), rest)
        } else {
            return Err(format!(
                "pointer `{input}` must start with `#`, `/`, `./` or `../`"
            ));
        };

        let mut segments = Vec::new();
        if !rest.is_empty() {
            for raw in rest.split('/') {
                match raw {
                    "" => return Err(format!("pointer `{input}` has an empty segment")),
                    "." | ".." => {
                        return Err(format!(
                            "pointer `{input}` may only climb with `..` at its start"
                        ))
                    }
                    "*" => segments.push(Segment::Wildcard),
                    key => segments.push(Segment::Key(unescape_segment(key))),
                }
            }
        }

        Ok(Self {
            source: input.to_string(),
            anchor,
            segments,
        })
    }

    /// The text the pointer was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn anchor(&self) -> Anchor {
        self.anchor
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Bind the pointer to the absolute location of its owner.
    ///
    /// Returns `None` when the pointer climbs above the root.
    pub fn resolve(&self, base: &[String]) -> Option<PathPattern> {
        let mut segments: Vec<Segment> = match self.anchor {
            Anchor::Root => Vec::new(),
            Anchor::Relative(up) => {
                if up > base.len() {
                    return None;
                }
                base[..base.len() - up]
                    .iter()
                    .map(|s| Segment::Key(s.clone()))
                    .collect()
            }
        };
        segments.extend(self.segments.iter().cloned());
        Some(PathPattern { segments })
    }
}

impl fmt::Display for RelativePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// An absolute path that may contain wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathPattern {
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether a change at `path` can affect the value observed through this
    /// pattern. That holds when one is a prefix of the other, so changes to
    /// ancestors and descendants of the watched location both count.
    pub fn overlaps(&self, path: &[String]) -> bool {
        self.segments
            .iter()
            .zip(path.iter())
            .all(|(segment, name)| segment.matches(name))
    }

    /// Whether the pattern names exactly `path`.
    pub fn matches(&self, path: &[String]) -> bool {
        self.segments.len() == path.len() && self.overlaps(path)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Key(key) => write!(f, "/{}", escape_segment(key))?,
                Segment::Wildcard => f.write_str("/*")?,
            }
        }
        Ok(())
    }
}

/// Escape a name for use inside a JSON pointer.
pub fn escape_segment(name: &str) -> String {
    name.replace('~', "~0").replace('/', "~1")
}

/// Reverse of [`escape_segment`].
pub fn unescape_segment(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Append a child name to a JSON pointer.
pub fn join_pointer(parent: &str, name: &str) -> String {
    format!("{parent}/{}", escape_segment(name))
}

/// Split a JSON pointer (`""`, `/a/b`) into unescaped segments.
///
/// A leading `#` is tolerated so schema-style paths split the same way.
pub fn split_pointer(pointer: &str) -> Vec<String> {
    let trimmed = pointer.strip_prefix('#').unwrap_or(pointer);
    if trimmed.is_empty() || trimmed == "/" {
        return Vec::new();
    }
    trimmed
        .strip_prefix('/')
        .unwrap_or(trimmed)
        .split('/')
        .map(unescape_segment)
        .collect()
}
