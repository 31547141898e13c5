//! Path queries over JSON state snapshots.
//!
//! Supports dotted field access, zero-based array indices and a `[*]`
//! wildcard, e.g. `processes[0].stderr` or `processes[*].status`. A parsed
//! path resolves to every node it matches together with that node's
//! concrete (wildcard-free) path, so assertion failures can name the exact
//! offender.

use serde_json::Value;

use crate::error::HarnessError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
    AnyIndex,
}

/// A parsed state path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePath {
    raw: String,
    segments: Vec<Segment>,
}

impl StatePath {
    /// Parse a path expression.
    ///
    /// Paths are authored by the oracle, so a syntax error is reported as a
    /// malformed decision rather than an evaluator failure.
    pub fn parse(raw: &str) -> Result<Self, HarnessError> {
        let mut segments = Vec::new();
        let mut rest = raw;
        loop {
            let end = rest.find(['.', '[']).unwrap_or(rest.len());
            let field = &rest[..end];
            if field.is_empty() {
                return Err(invalid(raw));
            }
            segments.push(Segment::Field(field.to_string()));
            rest = &rest[end..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped.find(']').ok_or_else(|| invalid(raw))?;
                let inner = &stripped[..close];
                let segment = if inner == "*" {
                    Segment::AnyIndex
                } else {
                    Segment::Index(inner.parse().map_err(|_| invalid(raw))?)
                };
                segments.push(segment);
                rest = &stripped[close + 1..];
            }
            if rest.is_empty() {
                break;
            }
            rest = rest.strip_prefix('.').ok_or_else(|| invalid(raw))?;
            if rest.is_empty() {
                return Err(invalid(raw));
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The original path expression.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Resolve against a snapshot, returning every matched node with its
    /// concrete path. An empty result means no node matched.
    pub fn resolve<'a>(&self, state: &'a Value) -> Vec<(String, &'a Value)> {
        let mut matches = vec![(String::new(), state)];
        for segment in &self.segments {
            let mut next = Vec::new();
            for (path, node) in matches {
                match segment {
                    Segment::Field(name) => {
                        if let Some(child) = node.get(name.as_str()) {
                            let concrete = if path.is_empty() {
                                name.clone()
                            } else {
                                format!("{path}.{name}")
                            };
                            next.push((concrete, child));
                        }
                    }
                    Segment::Index(idx) => {
                        if let Some(child) = node.get(*idx) {
                            next.push((format!("{path}[{idx}]"), child));
                        }
                    }
                    Segment::AnyIndex => {
                        if let Some(items) = node.as_array() {
                            for (idx, child) in items.iter().enumerate() {
                                next.push((format!("{path}[{idx}]"), child));
                            }
                        }
                    }
                }
            }
            matches = next;
        }
        matches
    }
}

fn invalid(raw: &str) -> HarnessError {
    HarnessError::DecisionFormat {
        reason: format!("invalid state path '{raw}'"),
    }
}
