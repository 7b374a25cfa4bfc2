//! Path algebra over normalized, slash-separated segment sequences.
//!
//! Paths are compared byte-for-byte on the normalized form and are
//! case-sensitive. Normalization turns backslashes into forward slashes,
//! collapses runs of separators, and strips leading and trailing ones, so
//! `a//b\c` and `/a/b/c/` name the same entry.

use std::fmt;

pub const SEPARATOR: char = '/';

/// A normalized filesystem path.
///
/// The empty path names the root directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FsPath(String);

impl FsPath {
    /// Normalizes a raw caller-supplied path.
    pub fn normalize(raw: &str) -> Self {
        let mut path = raw.replace('\\', "/");
        while path.contains("//") {
            path = path.replace("//", "/");
        }
        Self(path.trim_matches(SEPARATOR).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the root directory.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the path still holds more than one segment.
    pub fn is_multi_segment(&self) -> bool {
        self.0.contains(SEPARATOR)
    }

    /// Everything before the first separator; the whole path if there is
    /// none. Callers descending a directory tree test
    /// [`is_multi_segment`](Self::is_multi_segment) first.
    pub fn first_segment(&self) -> &str {
        split_first(&self.0).0
    }

    /// Everything after the first separator; the whole path if there is
    /// none.
    pub fn rest(&self) -> &str {
        split_first(&self.0).1
    }

    /// Everything before the last separator; empty (the root) if there is
    /// none.
    pub fn parent(&self) -> FsPath {
        match self.0.rfind(SEPARATOR) {
            Some(index) => FsPath(self.0[..index].to_string()),
            None => FsPath(String::new()),
        }
    }

    /// The final segment; the whole path if there is no separator.
    pub fn leaf(&self) -> &str {
        match self.0.rfind(SEPARATOR) {
            Some(index) => &self.0[index + 1..],
            None => &self.0,
        }
    }

    /// Iterates the segments in order. Empty for the root path.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR).filter(|s| !s.is_empty())
    }
}

/// Splits a normalized path at the first separator. Both halves equal the
/// input when there is none; segments never include the separator itself.
pub fn split_first(path: &str) -> (&str, &str) {
    match path.find(SEPARATOR) {
        Some(index) => (&path[..index], &path[index + 1..]),
        None => (path, path),
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_backslashes() {
        assert_eq!(FsPath::normalize("a\\b\\c").as_str(), "a/b/c");
    }

    #[test]
    fn test_normalize_collapses_runs() {
        assert_eq!(FsPath::normalize("a//b///c").as_str(), "a/b/c");
        assert_eq!(FsPath::normalize("a/\\b").as_str(), "a/b");
    }

    #[test]
    fn test_normalize_strips_edges() {
        assert_eq!(FsPath::normalize("/a/b/c/").as_str(), "a/b/c");
        assert_eq!(FsPath::normalize("///").as_str(), "");
        assert_eq!(FsPath::normalize("/").as_str(), "");
        assert_eq!(FsPath::normalize("").as_str(), "");
    }

    #[test]
    fn test_normalize_preserves_case() {
        assert_eq!(FsPath::normalize("Foo/BAR/baz").as_str(), "Foo/BAR/baz");
    }

    #[test]
    fn test_cursed_path() {
        let path = FsPath::normalize("Foo/Bar/Baz\\a/b/\\d/test/welp\\\\dead/fart");
        assert_eq!(path.as_str(), "Foo/Bar/Baz/a/b/d/test/welp/dead/fart");
        assert_eq!(path.segments().count(), 10);
    }

    #[test]
    fn test_first_and_rest() {
        let path = FsPath::normalize("a/b/c");
        assert!(path.is_multi_segment());
        assert_eq!(path.first_segment(), "a");
        assert_eq!(path.rest(), "b/c");

        let single = FsPath::normalize("file.txt");
        assert!(!single.is_multi_segment());
        assert_eq!(single.first_segment(), "file.txt");
        assert_eq!(single.rest(), "file.txt");
    }

    #[test]
    fn test_parent_and_leaf() {
        let path = FsPath::normalize("a/b/c.txt");
        assert_eq!(path.parent().as_str(), "a/b");
        assert_eq!(path.leaf(), "c.txt");

        let single = FsPath::normalize("c.txt");
        assert_eq!(single.parent().as_str(), "");
        assert_eq!(single.leaf(), "c.txt");
    }

    #[test]
    fn test_equivalent_spellings_normalize_identically() {
        let spellings = ["a//b\\c", "a/b/c", "/a/b/c/", "\\a\\b\\c"];
        for raw in spellings {
            assert_eq!(FsPath::normalize(raw).as_str(), "a/b/c", "raw: {raw}");
        }
    }
}
