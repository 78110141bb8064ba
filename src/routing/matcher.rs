//! Route matching logic.
//!
//! # Responsibilities
//! - Parse route patterns (`/u/:id`) into segments
//! - Test a request path against a pattern
//! - Capture `:param` segments into a string map
//!
//! # Design Decisions
//! - Path matching is case-sensitive
//! - Empty segments are ignored, so `/a//b/` matches `/a/b`
//! - No regex to guarantee O(n) matching

use std::collections::HashMap;

/// Trait for matching request paths against a route.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the path matches this route.
    fn test(&self, path: &str) -> bool;

    /// Returns the captured parameters, or `None` when the path does not match.
    fn captures(&self, path: &str) -> Option<HashMap<String, String>>;
}

/// Reasons a pattern cannot be compiled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("pattern must start with '/'")]
    MissingLeadingSlash,
    #[error("parameter at segment {0} has no name")]
    EmptyParameter(usize),
    #[error("parameter ':{0}' appears more than once")]
    RepeatedParameter(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A compiled `/literal/:param` pattern.
#[derive(Debug, Clone)]
pub struct PathPattern {
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Compile a pattern.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if !pattern.starts_with('/') {
            return Err(PatternError::MissingLeadingSlash);
        }

        let mut segments = Vec::new();
        for (index, raw) in split_path(pattern).enumerate() {
            match raw.strip_prefix(':') {
                Some("") => return Err(PatternError::EmptyParameter(index)),
                Some(name) => {
                    let repeated = segments
                        .iter()
                        .any(|s| matches!(s, Segment::Param(existing) if existing == name));
                    if repeated {
                        return Err(PatternError::RepeatedParameter(name.to_string()));
                    }
                    segments.push(Segment::Param(name.to_string()));
                }
                None => segments.push(Segment::Literal(raw.to_string())),
            }
        }

        Ok(Self { segments })
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl Matcher for PathPattern {
    fn test(&self, path: &str) -> bool {
        let mut parts = split_path(path);
        for segment in &self.segments {
            match (segment, parts.next()) {
                (Segment::Literal(expected), Some(part)) if expected == part => {}
                (Segment::Param(_), Some(_)) => {}
                _ => return false,
            }
        }
        parts.next().is_none()
    }

    fn captures(&self, path: &str) -> Option<HashMap<String, String>> {
        if !self.test(path) {
            return None;
        }

        let params = self
            .segments
            .iter()
            .zip(split_path(path))
            .filter_map(|(segment, part)| match segment {
                Segment::Param(name) => Some((name.clone(), part.to_string())),
                Segment::Literal(_) => None,
            })
            .collect();
        Some(params)
    }
}
