//! Store Paths
//!
//! Flat `/`-separated key paths into the realtime store tree.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::store::StoreError;

/// Characters not allowed inside a path segment.
const FORBIDDEN: [char; 5] = ['.', '#', '$', '[', ']'];

/// Validated path: zero or more non-empty segments.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    /// The root of the tree.
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    /// Parse `a/b/c`. Leading and trailing slashes are ignored.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            validate_segment(raw, segment)?;
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Append a relative path (which may itself contain `/`).
    pub fn child(&self, relative: &str) -> Result<Self, StoreError> {
        let tail = Self::parse(relative)?;
        let mut segments = self.segments.clone();
        segments.extend(tail.segments);
        Ok(Self { segments })
    }

    /// Path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Last segment, if any.
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Whether `self` equals `other` or is one of its ancestors.
    pub fn is_prefix_of(&self, other: &StorePath) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// Whether a change at `self` can affect the value at `other`, or vice versa.
    pub fn overlaps(&self, other: &StorePath) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }
}

fn validate_segment(raw: &str, segment: &str) -> Result<(), StoreError> {
    if segment.is_empty() || segment.contains(&FORBIDDEN[..]) {
        return Err(StoreError::InvalidPath(raw.to_string()));
    }
    Ok(())
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

impl FromStr for StorePath {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for StorePath {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StorePath> for String {
    fn from(path: StorePath) -> Self {
        path.segments.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path = StorePath::parse("/online_players/abc/").unwrap();
        assert_eq!(path.segments(), &["online_players".to_string(), "abc".to_string()]);
        assert_eq!(path.key(), Some("abc"));
        assert_eq!(path.to_string(), "/online_players/abc");
        assert_eq!(StorePath::parse("").unwrap(), StorePath::root());
    }

    #[test]
    fn test_rejects_bad_segments() {
        assert!(StorePath::parse("a//b").is_err());
        assert!(StorePath::parse("a/b.c").is_err());
        assert!(StorePath::parse("a/$b").is_err());
        assert!(StorePath::parse("a/[0]").is_err());
    }

    #[test]
    fn test_overlap() {
        let parent = StorePath::parse("online_players").unwrap();
        let child = parent.child("p1/position").unwrap();
        let other = StorePath::parse("users/p1").unwrap();

        assert!(parent.is_prefix_of(&child));
        assert!(!child.is_prefix_of(&parent));
        assert!(parent.overlaps(&child) && child.overlaps(&parent));
        assert!(!parent.overlaps(&other));
        assert!(StorePath::root().overlaps(&other));
    }

    #[test]
    fn test_serde_as_string() {
        let path = StorePath::parse("users/p1").unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"users/p1\"");
        let back: StorePath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
        assert!(serde_json::from_str::<StorePath>("\"a/.b\"").is_err());
    }
}
