//! Restricted JSONPath resolution and condition evaluation.
//!
//! Grammar: an optional `{...}` wrapper and leading `$`/`.`, then dot-separated
//! field names, `[n]` list indices and bracketed quoted keys (`['a.b/c']`).
//! Wildcards, filters, slices and recursive descent are not supported.

use std::fmt;

use serde_json::Value as Json;
use smallvec::SmallVec;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("unsupported token {0:?} at {1} (wildcards, filters and recursive descent are not supported)")]
    Unsupported(char, usize),
    #[error("unexpected {0:?} at {1}")]
    Unexpected(char, usize),
    #[error("unterminated bracket starting at {0}")]
    Unterminated(usize),
    #[error("invalid list index {0:?}")]
    BadIndex(String),
}

/// Parsed path; resolves against any document without allocating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: SmallVec<[Segment; 8]>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let mut s = raw.trim();
        if let Some(inner) = s.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
            s = inner.trim();
        }
        if let Some(rest) = s.strip_prefix('$') {
            s = rest;
        }
        let s = s.strip_prefix('.').unwrap_or(s);
        if s.is_empty() {
            return Err(PathError::Empty);
        }
        Parser { chars: s.char_indices().collect(), pos: 0 }.parse()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Walk the document. Missing keys, out-of-range indices and traversal into
    /// scalars all yield `None`.
    pub fn resolve<'a>(&self, root: &'a Json) -> Option<&'a Json> {
        let mut cur = root;
        for seg in self.segments.iter() {
            cur = match (seg, cur) {
                (Segment::Key(k), Json::Object(map)) => map.get(k)?,
                (Segment::Index(i), Json::Array(arr)) => arr.get(*i)?,
                _ => return None,
            };
        }
        Some(cur)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            match seg {
                Segment::Key(k) if k.contains(['.', '[', ']']) => write!(f, "['{}']", k)?,
                Segment::Key(k) if i == 0 => write!(f, "{}", k)?,
                Segment::Key(k) => write!(f, ".{}", k)?,
                Segment::Index(n) => write!(f, "[{}]", n)?,
            }
        }
        Ok(())
    }
}

struct Parser {
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<(usize, char)> {
        self.chars.get(self.pos).copied()
    }

    fn parse(mut self) -> Result<FieldPath, PathError> {
        let mut segments: SmallVec<[Segment; 8]> = SmallVec::new();
        let mut expect_key = true;
        while let Some((at, c)) = self.peek() {
            match c {
                '[' => {
                    segments.push(self.bracket()?);
                    expect_key = false;
                }
                '.' if !expect_key => {
                    self.pos += 1;
                    expect_key = true;
                    if self.peek().is_none() {
                        return Err(PathError::Empty);
                    }
                }
                '*' | '?' | '@' => return Err(PathError::Unsupported(c, at)),
                _ if expect_key => {
                    segments.push(Segment::Key(self.key()?));
                    expect_key = false;
                }
                _ => return Err(PathError::Unexpected(c, at)),
            }
        }
        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        Ok(FieldPath { segments })
    }

    fn key(&mut self) -> Result<String, PathError> {
        let mut out = String::new();
        while let Some((at, c)) = self.peek() {
            match c {
                '.' | '[' => break,
                '*' | '?' | '@' => return Err(PathError::Unsupported(c, at)),
                ']' | '\'' | '"' => return Err(PathError::Unexpected(c, at)),
                c if c.is_whitespace() => return Err(PathError::Unexpected(c, at)),
                c => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        if out.is_empty() {
            let (at, c) = self.peek().unwrap_or((0, '.'));
            return Err(PathError::Unexpected(c, at));
        }
        Ok(out)
    }

    fn bracket(&mut self) -> Result<Segment, PathError> {
        let (start, _) = self.chars[self.pos];
        self.pos += 1;
        let (at, c) = self.peek().ok_or(PathError::Unterminated(start))?;
        if c == '\'' || c == '"' {
            self.pos += 1;
            let mut key = String::new();
            loop {
                let (_, ch) = self.peek().ok_or(PathError::Unterminated(start))?;
                self.pos += 1;
                if ch == c {
                    break;
                }
                key.push(ch);
            }
            match self.peek() {
                Some((_, ']')) => self.pos += 1,
                Some((at, ch)) => return Err(PathError::Unexpected(ch, at)),
                None => return Err(PathError::Unterminated(start)),
            }
            return Ok(Segment::Key(key));
        }
        if matches!(c, '*' | '?' | '@') {
            return Err(PathError::Unsupported(c, at));
        }
        let mut idx = String::new();
        loop {
            let (_, ch) = self.peek().ok_or(PathError::Unterminated(start))?;
            self.pos += 1;
            if ch == ']' {
                break;
            }
            idx.push(ch);
        }
        if idx.is_empty() || !idx.chars().all(|c| c.is_ascii_digit()) {
            return Err(PathError::BadIndex(idx));
        }
        idx.parse::<usize>().map(Segment::Index).map_err(|_| PathError::BadIndex(idx))
    }
}

/// Canonical string form used for expected-value comparison.
pub fn stringify(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Bool(b) => b.to_string(),
        Json::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn is_empty(v: &Json) -> bool {
    match v {
        Json::Null => true,
        Json::String(s) => s.is_empty(),
        Json::Array(a) => a.is_empty(),
        Json::Object(m) => m.is_empty(),
        _ => false,
    }
}

/// True when `path` resolves in `doc` and either matches `expected` exactly or,
/// with no expectation, is non-empty. Never fails: unresolvable or malformed
/// paths count as "not met".
pub fn evaluate(doc: &Json, path: &str, expected: Option<&str>) -> bool {
    let fp = match FieldPath::parse(path) {
        Ok(fp) => fp,
        Err(e) => {
            debug!(path, error = %e, "unparsable condition path; treating as unmet");
            return false;
        }
    };
    evaluate_path(doc, &fp, expected)
}

pub fn evaluate_path(doc: &Json, path: &FieldPath, expected: Option<&str>) -> bool {
    match path.resolve(doc) {
        None | Some(Json::Null) => false,
        Some(v) => match expected {
            Some(want) => stringify(v) == want,
            None => !is_empty(v),
        },
    }
}
